//! The intermediate representation between compiler passes: a
//! struct-of-arrays graph of nodes and typed links, addressed by index.

use crate::diag::SourceLoc;
use crate::ops::NodeKind;
use crate::tensor::{Tensor, TypeInfo};

/// Which iteration domain a node belongs to after the domain-split pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Domain {
    /// Not reached from any output yet.
    Unassigned,
    /// Reached from more than one output with a non-scalar shape.
    Shared,
    /// Owned by the output node with this index.
    Owner(u32),
}

impl Default for Domain {
    fn default() -> Self {
        Domain::Unassigned
    }
}

/// One graph node.
#[derive(Clone, Debug)]
pub struct Node {
    pub id: String,
    pub kind: NodeKind,
    pub loc: SourceLoc,
    /// Payload of `Const`/`Input` nodes and the `init` state of `Memory`.
    pub constant: Option<Tensor>,
    /// Subgraph path of a `Call` node.
    pub subgraph: Option<String>,
    /// Coordinate axis of an `Index` node.
    pub axis: u32,
    /// Inferred output type, filled by the analysis pass.
    pub ty: TypeInfo,
    pub domain: Domain,
    /// Register assigned by the liveness pass.
    pub reg: Option<u16>,
}

impl Node {
    pub fn new(id: String, kind: NodeKind, loc: SourceLoc) -> Self {
        Node {
            id,
            kind,
            loc,
            constant: None,
            subgraph: None,
            axis: 0,
            ty: TypeInfo::default(),
            domain: Domain::Unassigned,
            reg: None,
        }
    }
}

/// A directed edge between node ports. Port names survive lowering only
/// where they cannot be resolved yet (edges touching a `Call` node).
#[derive(Clone, Debug)]
pub struct Link {
    pub src: u32,
    pub src_port: u32,
    pub src_name: Option<String>,
    pub dst: u32,
    pub dst_port: u32,
    pub dst_name: Option<String>,
}

/// The whole graph.
#[derive(Clone, Debug, Default)]
pub struct GraphIr {
    pub nodes: Vec<Node>,
    pub links: Vec<Link>,
}

impl GraphIr {
    /// The node feeding `dst_port` of `node`, if connected.
    pub fn input_source(&self, node: u32, dst_port: u32) -> Option<u32> {
        self.links
            .iter()
            .find(|l| l.dst == node && l.dst_port == dst_port)
            .map(|l| l.src)
    }

    /// Per-node consumer counts, from link multiplicity.
    pub fn use_counts(&self) -> Vec<u32> {
        let mut counts = vec![0u32; self.nodes.len()];
        for link in &self.links {
            if let Some(c) = counts.get_mut(link.src as usize) {
                *c += 1;
            }
        }
        counts
    }

    pub fn has_calls(&self) -> bool {
        self.nodes.iter().any(|n| n.kind == NodeKind::Call)
    }
}
