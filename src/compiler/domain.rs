//! Pass 6: domain splitting.
//!
//! Every output node seeds an iteration domain identified by its own
//! index and marks it backwards over its dependencies. A non-scalar node
//! reached from two different domains becomes shared; scalars float
//! freely with whichever domain claimed them first.

use crate::ir::{Domain, GraphIr};
use crate::ops::NodeKind;

pub fn run(ir: &mut GraphIr) {
    for node in &mut ir.nodes {
        node.domain = Domain::Unassigned;
    }

    let outputs: Vec<u32> = ir
        .nodes
        .iter()
        .enumerate()
        .filter(|(_, n)| n.kind == NodeKind::Output)
        .map(|(i, _)| i as u32)
        .collect();

    // Incoming adjacency once, instead of rescanning links per node.
    let mut inputs: Vec<Vec<u32>> = vec![Vec::new(); ir.nodes.len()];
    for link in &ir.links {
        inputs[link.dst as usize].push(link.src);
    }

    for out in outputs {
        mark(ir, &inputs, out, out);
    }
}

fn mark(ir: &mut GraphIr, inputs: &[Vec<u32>], node: u32, owner: u32) {
    match ir.nodes[node as usize].domain {
        Domain::Unassigned => {}
        Domain::Shared => return,
        Domain::Owner(existing) => {
            if existing != owner && ir.nodes[node as usize].ty.ndim > 0 {
                ir.nodes[node as usize].domain = Domain::Shared;
            }
            return;
        }
    }
    ir.nodes[node as usize].domain = Domain::Owner(owner);
    for &src in &inputs[node as usize] {
        mark(ir, inputs, src, owner);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diag::SourceLoc;
    use crate::ir::{Link, Node};
    use crate::tensor::{Dtype, TypeInfo};

    fn node(id: &str, kind: NodeKind, dims: &[i32]) -> Node {
        let mut n = Node::new(id.to_string(), kind, SourceLoc::default());
        n.ty = if dims.is_empty() {
            TypeInfo::scalar(Dtype::F32)
        } else {
            TypeInfo::with_shape(Dtype::F32, dims)
        };
        n
    }

    fn link(src: u32, dst: u32) -> Link {
        Link {
            src,
            src_port: 0,
            src_name: None,
            dst,
            dst_port: 0,
            dst_name: None,
        }
    }

    #[test]
    fn outputs_own_their_dependency_cones() {
        let mut ir = GraphIr {
            nodes: vec![
                node("v", NodeKind::Const, &[4]),
                node("neg", NodeKind::Sub, &[4]),
                node("o1", NodeKind::Output, &[4]),
            ],
            links: vec![link(0, 1), link(1, 2)],
        };
        run(&mut ir);
        assert_eq!(ir.nodes[0].domain, Domain::Owner(2));
        assert_eq!(ir.nodes[1].domain, Domain::Owner(2));
        assert_eq!(ir.nodes[2].domain, Domain::Owner(2));
    }

    #[test]
    fn non_scalar_shared_between_outputs_becomes_shared() {
        let mut ir = GraphIr {
            nodes: vec![
                node("v", NodeKind::Const, &[4]),
                node("o1", NodeKind::Output, &[4]),
                node("o2", NodeKind::Output, &[4]),
            ],
            links: vec![link(0, 1), link(0, 2)],
        };
        run(&mut ir);
        assert_eq!(ir.nodes[0].domain, Domain::Shared);
    }

    #[test]
    fn scalars_float_with_their_first_domain() {
        let mut ir = GraphIr {
            nodes: vec![
                node("s", NodeKind::Const, &[]),
                node("o1", NodeKind::Output, &[]),
                node("o2", NodeKind::Output, &[]),
            ],
            links: vec![link(0, 1), link(0, 2)],
        };
        run(&mut ir);
        assert_eq!(ir.nodes[0].domain, Domain::Owner(1));
    }
}
