//! Pass 5: type and shape inference.
//!
//! Runs over the topologically sorted graph, so every input type is
//! resolved before its consumers. The registry's shape rule drives the
//! common cases; the handful of operations with bespoke behaviour are
//! matched first. The dtype rule applies last and may force the output
//! dtype regardless of the inputs.

use crate::diag::{DiagKind, Diagnostics};
use crate::ir::GraphIr;
use crate::ops::{mask_allows, NodeKind, OutRule, ShapeRule};
use crate::tensor::{broadcast, can_append_dim, Dtype, TypeInfo};

pub fn run(ir: &mut GraphIr, order: &[u32], diag: &mut Diagnostics) {
    for &idx in order {
        infer_node(ir, idx, diag);
        if diag.has_errors() {
            // Downstream nodes would only cascade noise off a broken type.
            return;
        }
    }
}

fn infer_node(ir: &mut GraphIr, idx: u32, diag: &mut Diagnostics) {
    let kind = ir.nodes[idx as usize].kind;
    let info = kind.info();

    let s = [
        source_ty(ir, idx, 0),
        source_ty(ir, idx, 1),
        source_ty(ir, idx, 2),
    ];

    // Arity check: every declared port must be fed, except Input's
    // optional override.
    if !matches!(
        kind,
        NodeKind::Const | NodeKind::Input | NodeKind::Memory | NodeKind::Unknown
    ) {
        for port in 0..info.arity() {
            if s[port].is_none() {
                let node = &ir.nodes[idx as usize];
                diag.error(
                    DiagKind::ShapeMismatch,
                    Some(node.loc.clone()),
                    format!(
                        "node '{}' is missing input '{}'",
                        node.id,
                        info.ports[port].unwrap_or("?")
                    ),
                );
                return;
            }
        }
    }

    // Input dtype mask.
    for (port, ty) in s.iter().enumerate() {
        if let Some(ty) = ty {
            // The select condition is a mask, not a value input.
            let masked = !(kind == NodeKind::Select && port == 0);
            if masked && !mask_allows(info.dtype_mask, ty.dtype) {
                let node = &ir.nodes[idx as usize];
                diag.error(
                    DiagKind::TypeMismatch,
                    Some(node.loc.clone()),
                    format!(
                        "node '{}' does not accept {} on port '{}'",
                        node.id,
                        ty.dtype,
                        info.ports[port].unwrap_or("?")
                    ),
                );
                return;
            }
        }
    }

    let out = match kind {
        NodeKind::Const | NodeKind::Memory => {
            constant_ty(ir, idx).unwrap_or_else(|| ir.nodes[idx as usize].ty)
        }
        NodeKind::Input => {
            // Inlined call inputs are fed by the parent graph; free
            // inputs keep their declared or constant type.
            s[0].or_else(|| constant_ty(ir, idx))
                .unwrap_or_else(|| ir.nodes[idx as usize].ty)
        }
        NodeKind::Unknown => return,
        NodeKind::Select => {
            let (t, f) = (s[1].unwrap(), s[2].unwrap());
            match checked_broadcast(ir, idx, &t, &f, diag)
                .and_then(|tf| merge_shape_only(ir, idx, &tf, &s[0].unwrap(), diag))
            {
                Some(out) => out,
                None => return,
            }
        }
        NodeKind::SmoothStep => {
            // Edges stay a broadcast `[e0, e1]` pair (or a trailing dim of
            // two); the output follows x.
            let mut out = s[1].unwrap();
            out.dtype = Dtype::F32;
            out
        }
        _ => match infer_by_rule(ir, idx, info.shape_rule, &s, diag) {
            Some(out) => out,
            None => return,
        },
    };

    let mut out = out;
    match info.out_rule {
        OutRule::SameAsS1 => {}
        OutRule::SameAsS2 => {
            if let Some(ty) = s[1] {
                out.dtype = ty.dtype;
            }
        }
        OutRule::ForceF32 => out.dtype = Dtype::F32,
        OutRule::ForceU8 => out.dtype = Dtype::U8,
        OutRule::ForceI32 => out.dtype = Dtype::I32,
    }
    out.calc_strides();
    ir.nodes[idx as usize].ty = out;
}

fn infer_by_rule(
    ir: &GraphIr,
    idx: u32,
    rule: ShapeRule,
    s: &[Option<TypeInfo>; 3],
    diag: &mut Diagnostics,
) -> Option<TypeInfo> {
    match rule {
        ShapeRule::Special => Some(ir.nodes[idx as usize].ty),
        ShapeRule::SameAsS1 => Some(s[0].unwrap()),
        ShapeRule::Broadcast => {
            let mut out = s[0].unwrap();
            for next in s.iter().skip(1).flatten() {
                out = checked_broadcast(ir, idx, &out, next, diag)?;
            }
            Some(out)
        }
        ShapeRule::MatMul => {
            let (a, b) = (s[0].unwrap(), s[1].unwrap());
            let node = &ir.nodes[idx as usize];
            if a.ndim != 2 || b.ndim != 2 {
                // Rank-1 operands belong to Dot.
                diag.error(
                    DiagKind::ShapeMismatch,
                    Some(node.loc.clone()),
                    format!(
                        "matmul '{}' requires rank-2 operands, got {} and {}",
                        node.id, a, b
                    ),
                );
                return None;
            }
            if a.shape[1] > 0 && b.shape[0] > 0 && a.shape[1] != b.shape[0] {
                diag.error(
                    DiagKind::ShapeMismatch,
                    Some(node.loc.clone()),
                    format!("matmul '{}' inner dims differ: {} x {}", node.id, a, b),
                );
                return None;
            }
            let mut out = a;
            out.shape[1] = b.shape[1];
            Some(out)
        }
        ShapeRule::Transpose => {
            let mut out = s[0].unwrap();
            if out.ndim >= 2 {
                out.shape.swap(out.ndim - 2, out.ndim - 1);
            }
            Some(out)
        }
        ShapeRule::Dot => {
            let mut out = s[0].unwrap();
            if out.ndim > 0 {
                out.ndim -= 1;
            }
            Some(out)
        }
        ShapeRule::Join => {
            let a = s[0].unwrap();
            if let Some(b) = s[1] {
                if a.dtype != b.dtype && a.dtype != Dtype::Unknown && b.dtype != Dtype::Unknown {
                    let node = &ir.nodes[idx as usize];
                    diag.error(
                        DiagKind::TypeMismatch,
                        Some(node.loc.clone()),
                        format!("join '{}' mixes {} and {}", node.id, a.dtype, b.dtype),
                    );
                    return None;
                }
            }
            let mut out = a;
            if can_append_dim(&out) {
                out.shape[out.ndim] = 2;
                out.ndim += 1;
            }
            Some(out)
        }
        ShapeRule::Gather => {
            let data = s[0].unwrap();
            let mut out = s[1].unwrap();
            out.dtype = data.dtype;
            Some(out)
        }
        ShapeRule::Reshape => {
            let data = s[0].unwrap();
            let mut out = TypeInfo::scalar(data.dtype);
            match constant_of_source(ir, idx, 1) {
                Some(shape) => {
                    out.ndim = shape.len().min(crate::tensor::MAX_DIMS);
                    for k in 0..out.ndim {
                        out.shape[k] = shape.index_at(k).unwrap_or(0);
                    }
                }
                None => {
                    // Runtime shape: keep the input rank, all dynamic.
                    out.ndim = data.ndim;
                }
            }
            Some(out)
        }
        ShapeRule::Slice => {
            let data = s[0].unwrap();
            let mut out = TypeInfo::with_shape(data.dtype, &[0]);
            if let Some(range) = constant_of_source(ir, idx, 1) {
                let start = range.index_at(0).unwrap_or(0);
                let end = range.index_at(1).unwrap_or(0);
                out.shape[0] = (end - start).max(0);
            }
            Some(out)
        }
        ShapeRule::Dynamic1D => Some(TypeInfo::with_shape(Dtype::F32, &[0])),
    }
}

/// Broadcast with dtype agreement; reports and returns `None` on
/// conflict.
fn checked_broadcast(
    ir: &GraphIr,
    idx: u32,
    a: &TypeInfo,
    b: &TypeInfo,
    diag: &mut Diagnostics,
) -> Option<TypeInfo> {
    let node = &ir.nodes[idx as usize];
    if a.dtype != b.dtype && a.dtype != Dtype::Unknown && b.dtype != Dtype::Unknown {
        diag.error(
            DiagKind::TypeMismatch,
            Some(node.loc.clone()),
            format!(
                "node '{}' mixes {}{} and {}{}",
                node.id, a.dtype, a, b.dtype, b
            ),
        );
        return None;
    }
    match broadcast(a, b) {
        Some(out) => Some(out),
        None => {
            diag.error(
                DiagKind::ShapeMismatch,
                Some(node.loc.clone()),
                format!("node '{}' cannot broadcast {} with {}", node.id, a, b),
            );
            None
        }
    }
}

/// Shape-only broadcast: the mask of a select widens the shape but never
/// contributes a dtype.
fn merge_shape_only(
    ir: &GraphIr,
    idx: u32,
    value: &TypeInfo,
    mask: &TypeInfo,
    diag: &mut Diagnostics,
) -> Option<TypeInfo> {
    let node = &ir.nodes[idx as usize];
    match broadcast(value, mask) {
        Some(mut out) => {
            out.dtype = value.dtype;
            Some(out)
        }
        None => {
            diag.error(
                DiagKind::ShapeMismatch,
                Some(node.loc.clone()),
                format!(
                    "node '{}' cannot broadcast {} with condition {}",
                    node.id, value, mask
                ),
            );
            None
        }
    }
}

fn source_ty(ir: &GraphIr, idx: u32, port: u32) -> Option<TypeInfo> {
    ir.input_source(idx, port)
        .map(|src| ir.nodes[src as usize].ty)
}

fn constant_ty(ir: &GraphIr, idx: u32) -> Option<TypeInfo> {
    ir.nodes[idx as usize].constant.as_ref().map(|t| t.info)
}

fn constant_of_source<'a>(
    ir: &'a GraphIr,
    idx: u32,
    port: u32,
) -> Option<&'a crate::tensor::Tensor> {
    let src = ir.input_source(idx, port)?;
    ir.nodes[src as usize].constant.as_ref()
}
