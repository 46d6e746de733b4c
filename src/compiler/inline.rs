//! Pass 3: expand `Call` nodes by splicing their subgraphs into the
//! parent IR.
//!
//! Each sweep replaces every call currently in the graph; nested calls
//! surface again on the next sweep, bounded by [`MAX_INLINE_DEPTH`].
//! Child exports are keyed `<call>:i:<id>` / `<call>:o:<id>` in an
//! explicit table, with a `default` alias when the child has exactly one
//! input or output.

use fxhash::FxHashMap;
use log::debug;

use super::{dir_of, join_path, load_ir, FileLoader};
use crate::diag::{DiagKind, Diagnostics};
use crate::ir::{Domain, GraphIr, Node};
use crate::ops::NodeKind;

pub const MAX_INLINE_DEPTH: usize = 10;

/// An export of an inlined subgraph: the node standing in for the port,
/// and the port name to use when that node is itself a call.
struct Export {
    node: u32,
    port_name: Option<String>,
}

pub fn run(
    mut ir: GraphIr,
    loader: &dyn FileLoader,
    base_dir: &str,
    diag: &mut Diagnostics,
) -> GraphIr {
    // Anchor top-level call paths; nested paths are re-anchored as their
    // parents are expanded.
    for node in &mut ir.nodes {
        if node.kind == NodeKind::Call {
            if let Some(sub) = &node.subgraph {
                node.subgraph = Some(join_path(base_dir, sub));
            }
        }
    }

    for _ in 0..MAX_INLINE_DEPTH {
        if !ir.has_calls() {
            return ir;
        }
        ir = expand(ir, loader, diag);
        if diag.has_errors() {
            return ir;
        }
    }

    if let Some(call) = ir.nodes.iter().find(|n| n.kind == NodeKind::Call) {
        diag.error(
            DiagKind::MaxInlineDepth,
            Some(call.loc.clone()),
            format!(
                "call '{}' still unresolved after {} inline passes",
                call.id, MAX_INLINE_DEPTH
            ),
        );
    }
    ir
}

fn expand(src: GraphIr, loader: &dyn FileLoader, diag: &mut Diagnostics) -> GraphIr {
    let mut out = GraphIr::default();
    let mut node_map: Vec<Option<u32>> = vec![None; src.nodes.len()];
    let mut exports: FxHashMap<String, Export> = FxHashMap::default();

    for (i, node) in src.nodes.iter().enumerate() {
        if node.kind != NodeKind::Call {
            node_map[i] = Some(out.nodes.len() as u32);
            out.nodes.push(node.clone());
            continue;
        }

        let path = match &node.subgraph {
            Some(p) => p.clone(),
            None => continue,
        };
        let source = match loader.read(&path) {
            Ok(s) => s,
            Err(e) => {
                diag.error(
                    DiagKind::IoError,
                    Some(node.loc.clone()),
                    format!("call '{}': cannot read '{}': {}", node.id, path, e),
                );
                continue;
            }
        };
        let child = match load_ir(&source, &path, diag) {
            Some(child) => child,
            None => continue,
        };
        debug!(
            "inlining '{}' from {} ({} nodes)",
            node.id,
            path,
            child.nodes.len()
        );
        splice_child(node, &node_map, child, &path, &mut out, &mut exports);
    }

    rewrite_links(&src, &node_map, &exports, &mut out, diag);
    out
}

/// Copies a child graph into `out`, prefixing ids and registering the
/// call's export table.
fn splice_child(
    call: &Node,
    parent_map: &[Option<u32>],
    child: GraphIr,
    path: &str,
    out: &mut GraphIr,
    exports: &mut FxHashMap<String, Export>,
) {
    let mut child_map: Vec<Option<u32>> = vec![None; child.nodes.len()];

    // The call's own domain, remapped into the output graph, is inherited
    // by child nodes without one of their own.
    let inherited = match call.domain {
        Domain::Owner(p) => parent_map
            .get(p as usize)
            .and_then(|m| *m)
            .map(Domain::Owner)
            .unwrap_or(Domain::Unassigned),
        other => other,
    };

    let mut inputs = Vec::new();
    let mut outputs = Vec::new();

    // First pass: assign indices for every copied node.
    let base = out.nodes.len() as u32;
    let mut copied = 0u32;
    for (k, c_node) in child.nodes.iter().enumerate() {
        if c_node.kind == NodeKind::Output {
            continue;
        }
        child_map[k] = Some(base + copied);
        copied += 1;
        if c_node.kind == NodeKind::Input {
            inputs.push((k, c_node.id.clone()));
        }
    }

    // Second pass: push the copies.
    for (k, c_node) in child.nodes.iter().enumerate() {
        if c_node.kind == NodeKind::Output {
            // Exit point: export the node feeding the output.
            if let Some(provider) = child.input_source(k as u32, 0) {
                let provider_link = child
                    .links
                    .iter()
                    .find(|l| l.dst == k as u32 && l.dst_port == 0);
                if let Some(new_idx) = child_map[provider as usize] {
                    exports.insert(
                        format!("{}:o:{}", call.id, c_node.id),
                        Export {
                            node: new_idx,
                            port_name: provider_link.and_then(|l| l.src_name.clone()),
                        },
                    );
                    outputs.push(c_node.id.clone());
                }
            }
            continue;
        }

        let mut copy = c_node.clone();
        copy.id = format!("{}::{}", call.id, c_node.id);
        copy.domain = match c_node.domain {
            Domain::Owner(d) => child_map[d as usize]
                .map(Domain::Owner)
                .unwrap_or(Domain::Unassigned),
            Domain::Unassigned => inherited,
            Domain::Shared => Domain::Shared,
        };
        if copy.kind == NodeKind::Call {
            if let Some(sub) = &copy.subgraph {
                copy.subgraph = Some(join_path(dir_of(path), sub));
            }
        }
        out.nodes.push(copy);
    }

    // Entry points.
    for (k, raw_id) in &inputs {
        if let Some(new_idx) = child_map[*k] {
            exports.insert(
                format!("{}:i:{}", call.id, raw_id),
                Export {
                    node: new_idx,
                    port_name: None,
                },
            );
        }
    }
    if inputs.len() == 1 {
        if let Some(new_idx) = child_map[inputs[0].0] {
            exports.insert(
                format!("{}:i:default", call.id),
                Export {
                    node: new_idx,
                    port_name: None,
                },
            );
        }
    }
    if outputs.len() == 1 {
        let key = format!("{}:o:{}", call.id, outputs[0]);
        if let Some(export) = exports.get(&key) {
            let clone = Export {
                node: export.node,
                port_name: export.port_name.clone(),
            };
            exports.insert(format!("{}:o:default", call.id), clone);
        }
    }

    // Child links, skipping those into exit points.
    for link in &child.links {
        if child.nodes[link.dst as usize].kind == NodeKind::Output {
            continue;
        }
        if let (Some(new_src), Some(new_dst)) =
            (child_map[link.src as usize], child_map[link.dst as usize])
        {
            let mut copy = link.clone();
            copy.src = new_src;
            copy.dst = new_dst;
            out.links.push(copy);
        }
    }
}

/// Rewrites the parent's links: plain endpoints remap directly, call
/// endpoints resolve through the export table; unresolved links drop with
/// a warning.
fn rewrite_links(
    src: &GraphIr,
    node_map: &[Option<u32>],
    exports: &FxHashMap<String, Export>,
    out: &mut GraphIr,
    diag: &mut Diagnostics,
) {
    for link in &src.links {
        let src_node = &src.nodes[link.src as usize];
        let dst_node = &src.nodes[link.dst as usize];
        let mut copy = link.clone();

        if src_node.kind == NodeKind::Call {
            let port = link.src_name.as_deref().unwrap_or("default");
            let export = exports
                .get(&format!("{}:o:{}", src_node.id, port))
                .or_else(|| exports.get(&format!("{}:o:default", src_node.id)));
            match export {
                Some(export) => {
                    copy.src = export.node;
                    copy.src_port = 0;
                    copy.src_name = export.port_name.clone();
                }
                None => {
                    diag.warn(
                        DiagKind::UnresolvedReference,
                        Some(src_node.loc.clone()),
                        format!("call '{}' exports no output '{}'", src_node.id, port),
                    );
                    continue;
                }
            }
        } else {
            match node_map[link.src as usize] {
                Some(idx) => copy.src = idx,
                None => continue,
            }
        }

        if dst_node.kind == NodeKind::Call {
            let port = link.dst_name.as_deref().unwrap_or("default");
            let export = exports
                .get(&format!("{}:i:{}", dst_node.id, port))
                .or_else(|| exports.get(&format!("{}:i:default", dst_node.id)));
            match export {
                Some(export) => {
                    copy.dst = export.node;
                    copy.dst_port = 0;
                    copy.dst_name = None;
                }
                None => {
                    diag.warn(
                        DiagKind::UnresolvedReference,
                        Some(dst_node.loc.clone()),
                        format!("call '{}' exports no input '{}'", dst_node.id, port),
                    );
                    continue;
                }
            }
        } else {
            match node_map[link.dst as usize] {
                Some(idx) => copy.dst = idx,
                None => continue,
            }
        }

        out.links.push(copy);
    }
}

#[cfg(test)]
mod tests {
    use super::super::MemLoader;
    use super::*;
    use crate::compiler::{json, lower};

    fn load(source: &str, name: &str) -> GraphIr {
        let mut diag = Diagnostics::new();
        let ast = json::parse(source, name, &mut diag).unwrap();
        let ir = lower::run(&ast, name, &mut diag);
        assert!(!diag.has_errors());
        ir
    }

    const DOUBLE: &str = r#"{ "nodes": [
        {"id": "x", "type": "Input"},
        {"id": "two", "type": "Const", "data": {"value": 2}},
        {"id": "m", "type": "Mul"},
        {"id": "y", "type": "Output"} ],
      "links": [
        {"src": "x", "dst": "m", "dst_port": "a"},
        {"src": "two", "dst": "m", "dst_port": "b"},
        {"src": "m", "dst": "y", "dst_port": "in"} ] }"#;

    #[test]
    fn single_call_is_spliced() {
        let mut loader = MemLoader::new();
        loader.insert("double.json", DOUBLE);
        let parent = load(
            r#"{ "nodes": [
                 {"id": "c", "type": "Const", "data": {"value": 21}},
                 {"id": "call", "type": "Call", "data": {"path": "double.json"}},
                 {"id": "out", "type": "Output"} ],
               "links": [
                 {"src": "c", "dst": "call", "dst_port": "x"},
                 {"src": "call", "dst": "out", "dst_port": "in", "src_port": "y"} ] }"#,
            "main.json",
        );
        let mut diag = Diagnostics::new();
        let ir = run(parent, &loader, "", &mut diag);
        assert!(!diag.has_errors());
        assert!(!ir.has_calls());
        // c, out, plus x/two/m from the child.
        assert_eq!(ir.nodes.len(), 5);
        assert!(ir.nodes.iter().any(|n| n.id == "call::m"));
        // Both parent links must have been rewired onto child nodes.
        let mul = ir.nodes.iter().position(|n| n.id == "call::m").unwrap() as u32;
        let out_node = ir.nodes.iter().position(|n| n.id == "out").unwrap() as u32;
        assert!(ir
            .links
            .iter()
            .any(|l| l.src == mul && l.dst == out_node));
    }

    #[test]
    fn default_aliases_resolve_unnamed_ports() {
        let mut loader = MemLoader::new();
        loader.insert("double.json", DOUBLE);
        let parent = load(
            r#"{ "nodes": [
                 {"id": "c", "type": "Const", "data": {"value": 1}},
                 {"id": "call", "type": "Call", "data": {"path": "double.json"}},
                 {"id": "out", "type": "Output"} ],
               "links": [
                 {"src": "c", "dst": "call"},
                 {"src": "call", "dst": "out", "dst_port": "in"} ] }"#,
            "main.json",
        );
        let mut diag = Diagnostics::new();
        let ir = run(parent, &loader, "", &mut diag);
        assert!(!diag.has_errors());
        // Two child links survive (the exit-point link folds away) plus
        // both parent links resolved through the default aliases.
        assert_eq!(ir.links.len(), 4);
        assert!(ir.links.iter().all(|l| (l.src as usize) < ir.nodes.len()));
    }

    #[test]
    fn nested_calls_expand_across_sweeps() {
        let mut loader = MemLoader::new();
        loader.insert("double.json", DOUBLE);
        loader.insert(
            "quad.json",
            r#"{ "nodes": [
                 {"id": "x", "type": "Input"},
                 {"id": "d1", "type": "Call", "data": {"path": "double.json"}},
                 {"id": "d2", "type": "Call", "data": {"path": "double.json"}},
                 {"id": "y", "type": "Output"} ],
               "links": [
                 {"src": "x", "dst": "d1"},
                 {"src": "d1", "dst": "d2"},
                 {"src": "d2", "dst": "y", "dst_port": "in"} ] }"#,
        );
        let parent = load(
            r#"{ "nodes": [
                 {"id": "c", "type": "Const", "data": {"value": 3}},
                 {"id": "q", "type": "Call", "data": {"path": "quad.json"}},
                 {"id": "out", "type": "Output"} ],
               "links": [
                 {"src": "c", "dst": "q"},
                 {"src": "q", "dst": "out", "dst_port": "in"} ] }"#,
            "main.json",
        );
        let mut diag = Diagnostics::new();
        let ir = run(parent, &loader, "", &mut diag);
        assert!(!diag.has_errors());
        assert!(!ir.has_calls());
        assert!(ir.nodes.iter().any(|n| n.id == "q::d1::m"));
        assert!(ir.nodes.iter().any(|n| n.id == "q::d2::m"));
    }

    #[test]
    fn recursion_hits_the_depth_limit() {
        let mut loader = MemLoader::new();
        loader.insert(
            "loop.json",
            r#"{ "nodes": [
                 {"id": "x", "type": "Input"},
                 {"id": "again", "type": "Call", "data": {"path": "loop.json"}},
                 {"id": "y", "type": "Output"} ],
               "links": [
                 {"src": "x", "dst": "again"},
                 {"src": "again", "dst": "y", "dst_port": "in"} ] }"#,
        );
        let parent = load(
            r#"{ "nodes": [{"id": "c", "type": "Call", "data": {"path": "loop.json"}}] }"#,
            "main.json",
        );
        let mut diag = Diagnostics::new();
        run(parent, &loader, "", &mut diag);
        assert_eq!(diag.first_error().unwrap().kind, DiagKind::MaxInlineDepth);
    }

    #[test]
    fn inline_is_idempotent_once_flat() {
        let mut loader = MemLoader::new();
        loader.insert("double.json", DOUBLE);
        let parent = load(
            r#"{ "nodes": [
                 {"id": "c", "type": "Const", "data": {"value": 1}},
                 {"id": "call", "type": "Call", "data": {"path": "double.json"}},
                 {"id": "out", "type": "Output"} ],
               "links": [
                 {"src": "c", "dst": "call"},
                 {"src": "call", "dst": "out", "dst_port": "in"} ] }"#,
            "main.json",
        );
        let mut diag = Diagnostics::new();
        let once = run(parent, &loader, "", &mut diag);
        assert!(!diag.has_errors());
        let node_count = once.nodes.len();
        let link_count = once.links.len();
        let twice = run(once, &loader, "", &mut diag);
        assert!(!diag.has_errors());
        assert_eq!(twice.nodes.len(), node_count);
        assert_eq!(twice.links.len(), link_count);
    }
}
