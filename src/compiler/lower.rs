//! Pass 2: lower the generic JSON value tree into the graph IR.
//!
//! Resolves node types and port names through the op registry, parses
//! constant payloads into tensors and builds the id → index map used to
//! connect links.

use fxhash::FxHashMap;
use log::debug;

use super::json::{JsonKind, JsonValue};
use crate::diag::{DiagKind, Diagnostics};
use crate::ir::{GraphIr, Link, Node};
use crate::ops::NodeKind;
use crate::program::fnv1a;
use crate::tensor::{Dtype, Tensor, TypeInfo};

pub fn run(ast: &JsonValue, file: &str, diag: &mut Diagnostics) -> GraphIr {
    let mut ir = GraphIr::default();
    let mut index: FxHashMap<String, u32> = FxHashMap::default();

    let nodes = match ast.get("nodes").and_then(|n| n.as_array()) {
        Some(nodes) => nodes,
        None => {
            diag.error(
                DiagKind::ParseError,
                Some(ast.loc.clone()),
                "graph has no \"nodes\" array",
            );
            return ir;
        }
    };

    for raw in nodes {
        let id = node_id(raw);
        let kind = match raw.get("type").and_then(|t| t.as_str()) {
            Some(name) => match NodeKind::from_json_name(name) {
                Some(kind) => kind,
                None => {
                    diag.error(
                        DiagKind::UnknownOp,
                        Some(raw.loc.clone()),
                        format!("node '{}' has unknown type '{}'", id, name),
                    );
                    NodeKind::Unknown
                }
            },
            None => {
                diag.error(
                    DiagKind::ParseError,
                    Some(raw.loc.clone()),
                    format!("node '{}' has no type", id),
                );
                NodeKind::Unknown
            }
        };

        let mut node = Node::new(id.clone(), kind, raw.loc.clone());
        let data = raw.get("data");

        match kind {
            NodeKind::Const | NodeKind::Input => {
                if let Some(value) = data.and_then(|d| d.get("value")) {
                    node.constant = parse_constant(value, data);
                    if let Some(constant) = &node.constant {
                        node.ty = constant.info;
                    }
                } else if let Some(declared) = parse_declared_type(data) {
                    // Uninitialised input: shape and dtype only.
                    node.ty = declared;
                }
            }
            NodeKind::Memory => {
                node.constant = data
                    .and_then(|d| d.get("init"))
                    .and_then(|v| parse_constant(v, data))
                    .or_else(|| Some(Tensor::scalar_f32(0.0)));
                if let Some(init) = &node.constant {
                    node.ty = init.info;
                }
            }
            NodeKind::Call => match data.and_then(|d| d.get("path")).and_then(|p| p.as_str()) {
                Some(path) => node.subgraph = Some(path.to_string()),
                None => diag.error(
                    DiagKind::UnresolvedReference,
                    Some(raw.loc.clone()),
                    format!("call node '{}' has no subgraph path", id),
                ),
            },
            NodeKind::Index => {
                node.axis = data
                    .and_then(|d| d.get("axis"))
                    .and_then(|a| a.as_f64())
                    .unwrap_or(0.0) as u32;
            }
            _ => {}
        }

        let idx = ir.nodes.len() as u32;
        if index.insert(id.clone(), idx).is_some() {
            diag.warn(
                DiagKind::UnresolvedReference,
                Some(raw.loc.clone()),
                format!("duplicate node id '{}' shadows an earlier node", id),
            );
        }
        ir.nodes.push(node);
    }

    if let Some(imports) = ast.get("imports").and_then(|i| i.as_array()) {
        // Imports are resolved lazily through Call nodes; the list is
        // informational.
        debug!("{}: {} imports declared", file, imports.len());
    }

    if let Some(links) = ast.get("links").and_then(|l| l.as_array()) {
        for raw in links {
            if let Some(link) = lower_link(raw, &ir, &index, diag) {
                ir.links.push(link);
            }
        }
    }

    ir
}

fn lower_link(
    raw: &JsonValue,
    ir: &GraphIr,
    index: &FxHashMap<String, u32>,
    diag: &mut Diagnostics,
) -> Option<Link> {
    let (src_id, dst_id) = match (raw.get("src"), raw.get("dst")) {
        (Some(src), Some(dst)) => (node_ref(src), node_ref(dst)),
        _ => {
            diag.error(
                DiagKind::ParseError,
                Some(raw.loc.clone()),
                "link is missing src or dst",
            );
            return None;
        }
    };

    let src = match index.get(&src_id) {
        Some(&i) => i,
        None => {
            diag.error(
                DiagKind::UnresolvedReference,
                Some(raw.loc.clone()),
                format!("link source '{}' not found", src_id),
            );
            return None;
        }
    };
    let dst = match index.get(&dst_id) {
        Some(&i) => i,
        None => {
            diag.error(
                DiagKind::UnresolvedReference,
                Some(raw.loc.clone()),
                format!("link destination '{}' not found", dst_id),
            );
            return None;
        }
    };

    let mut link = Link {
        src,
        src_port: 0,
        src_name: None,
        dst,
        dst_port: 0,
        dst_name: None,
    };

    // Source ports: index 0 unless the endpoint is a Call, whose exports
    // are only resolvable after inlining.
    if let Some(port) = raw.get("src_port") {
        match (&port.kind, ir.nodes[src as usize].kind) {
            (JsonKind::Str(name), NodeKind::Call) => link.src_name = Some(name.clone()),
            (JsonKind::Str(_), _) => {}
            (JsonKind::Number(n), _) => link.src_port = *n as u32,
            _ => {}
        }
    }

    if let Some(port) = raw.get("dst_port") {
        let dst_kind = ir.nodes[dst as usize].kind;
        match &port.kind {
            JsonKind::Str(name) if dst_kind == NodeKind::Call => {
                link.dst_name = Some(name.clone())
            }
            JsonKind::Str(name) => match dst_kind.port_index(name) {
                Some(i) => link.dst_port = i,
                None => {
                    diag.warn(
                        DiagKind::UnresolvedReference,
                        Some(port.loc.clone()),
                        format!(
                            "node '{}' has no port '{}', using port 0",
                            ir.nodes[dst as usize].id, name
                        ),
                    );
                }
            },
            JsonKind::Number(n) => link.dst_port = *n as u32,
            _ => {}
        }
    }

    Some(link)
}

/// Node ids may be strings or bare numbers.
fn node_id(raw: &JsonValue) -> String {
    raw.get("id").map(node_ref).unwrap_or_else(|| "unknown".to_string())
}

fn node_ref(value: &JsonValue) -> String {
    match &value.kind {
        JsonKind::Str(s) => s.clone(),
        JsonKind::Number(n) => format!("{}", *n as i64),
        _ => "unknown".to_string(),
    }
}

fn declared_dtype(data: Option<&JsonValue>) -> Dtype {
    data.and_then(|d| d.get("dtype"))
        .and_then(|v| v.as_str())
        .and_then(Dtype::from_name)
        .unwrap_or(Dtype::F32)
}

fn parse_declared_type(data: Option<&JsonValue>) -> Option<TypeInfo> {
    let shape = data?.get("shape")?.as_array()?;
    let dims: Vec<i32> = shape
        .iter()
        .map(|d| d.as_f64().unwrap_or(0.0) as i32)
        .collect();
    Some(TypeInfo::with_shape(declared_dtype(data), &dims))
}

/// Parses a constant payload into a tensor.
///
/// Numbers become scalars of the declared dtype (F32 by default), bools
/// become U8. Strings become a 1-D F32 array of UTF-32 codepoints unless
/// the dtype is I32, in which case the FNV-1a hash is stored. Flat arrays
/// become 1-D F32/I32, arrays of strings hash per element and nested
/// arrays become rank-2 F32.
pub fn parse_constant(value: &JsonValue, data: Option<&JsonValue>) -> Option<Tensor> {
    let target = declared_dtype(data);
    match &value.kind {
        JsonKind::Number(n) => Some(match target {
            Dtype::I32 => Tensor::scalar_i32(*n as i32),
            Dtype::U8 => Tensor::scalar_u8(*n as u8),
            _ => Tensor::scalar_f32(*n as f32),
        }),
        JsonKind::Bool(b) => Some(Tensor::scalar_u8(*b as u8)),
        JsonKind::Str(s) => Some(if target == Dtype::I32 {
            Tensor::scalar_i32(fnv1a(s) as i32)
        } else {
            let codepoints: Vec<f32> = s.chars().map(|c| c as u32 as f32).collect();
            let len = codepoints.len() as i32;
            Tensor::from_f32(&[len], codepoints)
        }),
        JsonKind::Array(items) => parse_array_constant(items, target),
        _ => None,
    }
}

fn parse_array_constant(items: &[JsonValue], target: Dtype) -> Option<Tensor> {
    let first = items.first()?;
    match &first.kind {
        JsonKind::Number(_) => {
            let len = items.len() as i32;
            if target == Dtype::I32 {
                let values = items
                    .iter()
                    .map(|v| v.as_f64().unwrap_or(0.0) as i32)
                    .collect();
                Some(Tensor::from_i32(&[len], values))
            } else {
                let values = items
                    .iter()
                    .map(|v| v.as_f64().unwrap_or(0.0) as f32)
                    .collect();
                Some(Tensor::from_f32(&[len], values))
            }
        }
        JsonKind::Str(_) => {
            let values = items
                .iter()
                .map(|v| v.as_str().map(|s| fnv1a(s) as i32).unwrap_or(0))
                .collect();
            Some(Tensor::from_i32(&[items.len() as i32], values))
        }
        JsonKind::Array(row) => {
            let rows = items.len();
            let cols = row.len();
            let mut values = Vec::with_capacity(rows * cols);
            for item in items {
                let row = item.as_array().unwrap_or(&[]);
                for c in 0..cols {
                    values.push(row.get(c).and_then(|v| v.as_f64()).unwrap_or(0.0) as f32);
                }
            }
            Some(Tensor::from_f32(&[rows as i32, cols as i32], values))
        }
        _ => None,
    }
}
