//! CPU kernels, one per opcode, dispatched through a closed match.
//!
//! Kernels resolve their output shape from the actual operand shapes at
//! runtime (compile-time inference may leave dims dynamic), resize the
//! destination register and iterate its elements. Broadcast operands are
//! addressed modulo their length, which covers scalars and trailing-suffix
//! broadcasts alike. Every floating-point result is masked to zero when
//! non-finite, which keeps execution deterministic and free of NaN
//! propagation.

use super::{Backend, DomainCoords, ExecCtx, ExecError};
use crate::ops::Opcode;
use crate::program::Instruction;
use crate::tensor::{broadcast, Dtype, Tensor, TensorData, TypeInfo};

pub struct CpuBackend;

impl Default for CpuBackend {
    fn default() -> Self {
        CpuBackend
    }
}

impl Backend for CpuBackend {
    fn exec(&self, ctx: &mut ExecCtx, inst: &Instruction) {
        match inst.opcode {
            Opcode::Noop => {}
            Opcode::Add => binary(ctx, inst, |a, b| a + b, |a, b| a.wrapping_add(b)),
            Opcode::Sub => binary(ctx, inst, |a, b| a - b, |a, b| a.wrapping_sub(b)),
            Opcode::Mul => binary(ctx, inst, |a, b| a * b, |a, b| a.wrapping_mul(b)),
            Opcode::Div => binary(ctx, inst, |a, b| a / b, |a, b| a.checked_div(b).unwrap_or(0)),
            Opcode::Pow => binary(ctx, inst, f32::powf, |a, b| a.wrapping_pow(b.max(0) as u32)),
            Opcode::Atan2 => binary(ctx, inst, f32::atan2, |_, _| 0),
            Opcode::Min => binary(ctx, inst, f32::min, i32::min),
            Opcode::Max => binary(ctx, inst, f32::max, i32::max),
            Opcode::Step => binary(ctx, inst, |e, x| if x >= e { 1.0 } else { 0.0 }, |e, x| {
                if x >= e {
                    1
                } else {
                    0
                }
            }),
            Opcode::Fma => ternary(ctx, inst, |a, b, c| a * b + c, |a, b, c| {
                a.wrapping_mul(b).wrapping_add(c)
            }),
            Opcode::Mix => ternary(ctx, inst, |a, b, t| a + (b - a) * t, |a, _, _| a),
            Opcode::Clamp => ternary(ctx, inst, |x, lo, hi| x.max(lo).min(hi), |x, lo, hi| {
                x.max(lo).min(hi)
            }),

            Opcode::Abs => unary(ctx, inst, f32::abs, i32::abs),
            Opcode::Sin => unary_f32(ctx, inst, f32::sin),
            Opcode::Cos => unary_f32(ctx, inst, f32::cos),
            Opcode::Sqrt => unary_f32(ctx, inst, f32::sqrt),
            Opcode::Floor => unary_f32(ctx, inst, f32::floor),
            Opcode::Ceil => unary_f32(ctx, inst, f32::ceil),

            Opcode::Less => compare(ctx, inst, |a, b| a < b),
            Opcode::Greater => compare(ctx, inst, |a, b| a > b),
            Opcode::Equal => compare(ctx, inst, |a, b| (a - b).abs() == 0.0),
            Opcode::NotEqual => compare(ctx, inst, |a, b| (a - b).abs() != 0.0),
            Opcode::LessEqual => compare(ctx, inst, |a, b| a <= b),
            Opcode::GreaterEqual => compare(ctx, inst, |a, b| a >= b),

            Opcode::And => logic(ctx, inst, |a, b| a && b),
            Opcode::Or => logic(ctx, inst, |a, b| a || b),
            Opcode::Xor => logic(ctx, inst, |a, b| a ^ b),
            Opcode::Not => op_not(ctx, inst),

            Opcode::WhereTrue => op_where(ctx, inst, true),
            Opcode::WhereFalse => op_where(ctx, inst, false),

            Opcode::SmoothStep => op_smoothstep(ctx, inst),
            Opcode::MatMul => op_matmul(ctx, inst),
            Opcode::Transpose => op_transpose(ctx, inst),
            Opcode::Inverse => op_inverse(ctx, inst),
            Opcode::Normalize => op_normalize(ctx, inst),
            Opcode::Dot => op_dot(ctx, inst),
            Opcode::Length => op_length(ctx, inst),
            Opcode::Join => op_join(ctx, inst),

            Opcode::Range => op_range(ctx, inst),
            Opcode::Index => op_index(ctx, inst),
            Opcode::Gather => op_gather(ctx, inst),
            Opcode::CumSum => op_cumsum(ctx, inst),
            Opcode::Filter => op_filter(ctx, inst),
            Opcode::Slice => op_slice(ctx, inst),
            Opcode::Reshape => op_reshape(ctx, inst),
            Opcode::Copy => op_copy(ctx, inst),
        }
    }
}

/// Non-finite results collapse to zero.
#[inline]
fn mask(v: f32) -> f32 {
    if v.is_finite() {
        v
    } else {
        0.0
    }
}

/// Broadcast read: scalars and trailing suffixes wrap, empty (unstaged)
/// operands read as zero.
#[inline]
fn at_f32(s: &[f32], j: usize) -> f32 {
    if s.is_empty() {
        0.0
    } else {
        s[j % s.len()]
    }
}

#[inline]
fn at_i32(s: &[i32], j: usize) -> i32 {
    if s.is_empty() {
        0
    } else {
        s[j % s.len()]
    }
}

/// Any-dtype scalar read as f64, for comparisons.
fn at_num(t: &Tensor, j: usize) -> f64 {
    match t.data() {
        TensorData::F32(v) if !v.is_empty() => f64::from(v[j % v.len()]),
        TensorData::I32(v) if !v.is_empty() => f64::from(v[j % v.len()]),
        TensorData::U8(v) if !v.is_empty() => f64::from(v[j % v.len()]),
        _ => 0.0,
    }
}

fn at_bool(t: &Tensor, j: usize) -> bool {
    at_num(t, j) != 0.0
}

/// Runtime output shape of an element-wise op over `n` operands.
fn resolve_elementwise(ctx: &ExecCtx, inst: &Instruction, n: usize) -> Option<TypeInfo> {
    let mut info = ctx.reg(inst.src1).info;
    if n >= 2 {
        info = broadcast(&info, &ctx.reg(inst.src2).info)?;
    }
    if n >= 3 {
        info = broadcast(&info, &ctx.reg(inst.src3).info)?;
    }
    Some(info)
}

/// Resizes the destination to the resolved shape, keeping the dtype the
/// compiler decided on. Returns the taken destination.
fn prepare_dst(ctx: &mut ExecCtx, inst: &Instruction, n: usize) -> Option<Tensor> {
    let resolved = match resolve_elementwise(ctx, inst, n) {
        Some(info) => info,
        None => {
            ctx.fail(ExecError::ShapeMismatch);
            return None;
        }
    };
    let mut dst = ctx.take(inst.dest);
    let mut info = resolved;
    if dst.info.dtype != Dtype::Unknown {
        info.dtype = dst.info.dtype;
    }
    info.calc_strides();
    dst.resize(info);
    Some(dst)
}

fn binary(
    ctx: &mut ExecCtx,
    inst: &Instruction,
    f: impl Fn(f32, f32) -> f32,
    g: impl Fn(i32, i32) -> i32,
) {
    let mut dst = match prepare_dst(ctx, inst, 2) {
        Some(d) => d,
        None => return,
    };
    match dst.info.dtype {
        Dtype::F32 => {
            let (a, b) = (ctx.reg(inst.src1).f32(), ctx.reg(inst.src2).f32());
            for (j, out) in dst.f32_mut().iter_mut().enumerate() {
                *out = mask(f(at_f32(a, j), at_f32(b, j)));
            }
        }
        Dtype::I32 => {
            let (a, b) = (ctx.reg(inst.src1).i32(), ctx.reg(inst.src2).i32());
            for (j, out) in dst.i32_mut().iter_mut().enumerate() {
                *out = g(at_i32(a, j), at_i32(b, j));
            }
        }
        _ => ctx.fail(ExecError::Runtime),
    }
    ctx.put(inst.dest, dst);
}

fn ternary(
    ctx: &mut ExecCtx,
    inst: &Instruction,
    f: impl Fn(f32, f32, f32) -> f32,
    g: impl Fn(i32, i32, i32) -> i32,
) {
    let mut dst = match prepare_dst(ctx, inst, 3) {
        Some(d) => d,
        None => return,
    };
    match dst.info.dtype {
        Dtype::F32 => {
            let a = ctx.reg(inst.src1).f32();
            let b = ctx.reg(inst.src2).f32();
            let c = ctx.reg(inst.src3).f32();
            for (j, out) in dst.f32_mut().iter_mut().enumerate() {
                *out = mask(f(at_f32(a, j), at_f32(b, j), at_f32(c, j)));
            }
        }
        Dtype::I32 => {
            let a = ctx.reg(inst.src1).i32();
            let b = ctx.reg(inst.src2).i32();
            let c = ctx.reg(inst.src3).i32();
            for (j, out) in dst.i32_mut().iter_mut().enumerate() {
                *out = g(at_i32(a, j), at_i32(b, j), at_i32(c, j));
            }
        }
        _ => ctx.fail(ExecError::Runtime),
    }
    ctx.put(inst.dest, dst);
}

fn unary(ctx: &mut ExecCtx, inst: &Instruction, f: impl Fn(f32) -> f32, g: impl Fn(i32) -> i32) {
    let mut dst = match prepare_dst(ctx, inst, 1) {
        Some(d) => d,
        None => return,
    };
    match dst.info.dtype {
        Dtype::F32 => {
            let a = ctx.reg(inst.src1).f32();
            for (j, out) in dst.f32_mut().iter_mut().enumerate() {
                *out = mask(f(at_f32(a, j)));
            }
        }
        Dtype::I32 => {
            let a = ctx.reg(inst.src1).i32();
            for (j, out) in dst.i32_mut().iter_mut().enumerate() {
                *out = g(at_i32(a, j));
            }
        }
        _ => ctx.fail(ExecError::Runtime),
    }
    ctx.put(inst.dest, dst);
}

fn unary_f32(ctx: &mut ExecCtx, inst: &Instruction, f: impl Fn(f32) -> f32) {
    unary(ctx, inst, f, |v| v)
}

fn compare(ctx: &mut ExecCtx, inst: &Instruction, f: impl Fn(f64, f64) -> bool) {
    let dst = match prepare_dst(ctx, inst, 2) {
        Some(d) => d,
        None => return,
    };
    let mut out = vec![0u8; dst.len()];
    for (j, o) in out.iter_mut().enumerate() {
        *o = f(at_num(ctx.reg(inst.src1), j), at_num(ctx.reg(inst.src2), j)) as u8;
    }
    ctx.put(inst.dest, Tensor::from_u8(&dst.info.dims().to_vec(), out));
}

fn logic(ctx: &mut ExecCtx, inst: &Instruction, f: impl Fn(bool, bool) -> bool) {
    let dst = match prepare_dst(ctx, inst, 2) {
        Some(d) => d,
        None => return,
    };
    let mut out = vec![0u8; dst.len()];
    for (j, o) in out.iter_mut().enumerate() {
        *o = f(at_bool(ctx.reg(inst.src1), j), at_bool(ctx.reg(inst.src2), j)) as u8;
    }
    ctx.put(inst.dest, Tensor::from_u8(&dst.info.dims().to_vec(), out));
}

fn op_not(ctx: &mut ExecCtx, inst: &Instruction) {
    let dst = match prepare_dst(ctx, inst, 1) {
        Some(d) => d,
        None => return,
    };
    let mut out = vec![0u8; dst.len()];
    for (j, o) in out.iter_mut().enumerate() {
        *o = !at_bool(ctx.reg(inst.src1), j) as u8;
    }
    ctx.put(inst.dest, Tensor::from_u8(&dst.info.dims().to_vec(), out));
}

/// One half of a select. Writes only the lanes its condition selects;
/// the destination keeps its other lanes, so the pair composes into a
/// full conditional move.
fn op_where(ctx: &mut ExecCtx, inst: &Instruction, want: bool) {
    let resolved = match resolve_elementwise(ctx, inst, 2) {
        Some(info) => info,
        None => {
            ctx.fail(ExecError::ShapeMismatch);
            return;
        }
    };
    let mut dst = ctx.take(inst.dest);
    let mut info = resolved;
    info.dtype = ctx.reg(inst.src2).info.dtype;
    info.calc_strides();
    dst.resize(info);

    let n = dst.len();
    for j in 0..n {
        if at_bool(ctx.reg(inst.src1), j) != want {
            continue;
        }
        let val = ctx.reg(inst.src2);
        match dst.info.dtype {
            Dtype::F32 => {
                let v = at_f32(val.f32(), j);
                dst.f32_mut()[j] = v;
            }
            Dtype::I32 => {
                let v = at_i32(val.i32(), j);
                dst.i32_mut()[j] = v;
            }
            Dtype::U8 => {
                let v = at_num(val, j) as u8;
                dst.u8_mut()[j] = v;
            }
            Dtype::Unknown => {
                ctx.fail(ExecError::Runtime);
                break;
            }
        }
    }
    ctx.put(inst.dest, dst);
}

fn op_smoothstep(ctx: &mut ExecCtx, inst: &Instruction) {
    let mut dst = ctx.take(inst.dest);
    let x_info = ctx.reg(inst.src2).info;
    let mut info = x_info;
    info.dtype = Dtype::F32;
    info.calc_strides();
    dst.resize(info);

    let edges = ctx.reg(inst.src1).f32();
    let x = ctx.reg(inst.src2).f32();
    let n = dst.len();
    // A `[e0, e1]` pair broadcasts; per-element edges need a trailing
    // dim of two.
    let per_element = edges.len() == 2 * n && n > 1;
    for (j, out) in dst.f32_mut().iter_mut().enumerate() {
        let (e0, e1) = if per_element {
            (edges[2 * j], edges[2 * j + 1])
        } else {
            (at_f32(edges, 0), at_f32(edges, 1))
        };
        let t = ((at_f32(x, j) - e0) / (e1 - e0)).max(0.0).min(1.0);
        *out = mask(t * t * (3.0 - 2.0 * t));
    }
    ctx.put(inst.dest, dst);
}

fn op_matmul(ctx: &mut ExecCtx, inst: &Instruction) {
    let a_info = ctx.reg(inst.src1).info;
    let b_info = ctx.reg(inst.src2).info;
    if a_info.ndim != 2 || b_info.ndim != 2 || a_info.shape[1] != b_info.shape[0] {
        ctx.fail(ExecError::ShapeMismatch);
        return;
    }
    let (m, k, n) = (
        a_info.shape[0] as usize,
        a_info.shape[1] as usize,
        b_info.shape[1] as usize,
    );
    let mut dst = ctx.take(inst.dest);
    dst.resize(TypeInfo::with_shape(Dtype::F32, &[m as i32, n as i32]));

    let a = ctx.reg(inst.src1).f32();
    let b = ctx.reg(inst.src2).f32();
    if a.len() < m * k || b.len() < k * n {
        ctx.put(inst.dest, dst);
        ctx.fail(ExecError::ShapeMismatch);
        return;
    }
    let out = dst.f32_mut();
    match (m, k, n) {
        (3, 3, 3) => mm3(a, b, out),
        (4, 4, 4) => mm4(a, b, out),
        _ => {
            for r in 0..m {
                for c in 0..n {
                    let mut sum = 0.0;
                    for i in 0..k {
                        sum += a[r * k + i] * b[i * n + c];
                    }
                    out[r * n + c] = mask(sum);
                }
            }
        }
    }
    ctx.put(inst.dest, dst);
}

fn mm3(a: &[f32], b: &[f32], out: &mut [f32]) {
    for r in 0..3 {
        for c in 0..3 {
            out[r * 3 + c] = mask(
                a[r * 3] * b[c] + a[r * 3 + 1] * b[3 + c] + a[r * 3 + 2] * b[6 + c],
            );
        }
    }
}

fn mm4(a: &[f32], b: &[f32], out: &mut [f32]) {
    for r in 0..4 {
        for c in 0..4 {
            out[r * 4 + c] = mask(
                a[r * 4] * b[c]
                    + a[r * 4 + 1] * b[4 + c]
                    + a[r * 4 + 2] * b[8 + c]
                    + a[r * 4 + 3] * b[12 + c],
            );
        }
    }
}

fn op_transpose(ctx: &mut ExecCtx, inst: &Instruction) {
    let src_info = ctx.reg(inst.src1).info;
    let mut dst = ctx.take(inst.dest);
    if src_info.ndim == 2 {
        let (m, n) = (src_info.shape[0] as usize, src_info.shape[1] as usize);
        let mut info = src_info;
        info.shape.swap(0, 1);
        info.calc_strides();
        dst.resize(info);
        let src = ctx.reg(inst.src1).f32();
        if src.len() >= m * n {
            let out = dst.f32_mut();
            for r in 0..m {
                for c in 0..n {
                    out[c * m + r] = src[r * n + c];
                }
            }
        }
        ctx.put(inst.dest, dst);
    } else {
        ctx.put(inst.dest, ctx.reg(inst.src1).clone());
    }
}

fn op_inverse(ctx: &mut ExecCtx, inst: &Instruction) {
    let src = ctx.reg(inst.src1).clone();
    let mut dst = ctx.take(inst.dest);
    dst.resize(src.info);
    let m = src.f32();
    let n = m.len();
    {
        let out = dst.f32_mut();
        if n == 9 {
            let det = m[0] * (m[4] * m[8] - m[7] * m[5]) - m[1] * (m[3] * m[8] - m[5] * m[6])
                + m[2] * (m[3] * m[7] - m[4] * m[6]);
            let inv = 1.0 / det;
            out[0] = mask((m[4] * m[8] - m[5] * m[7]) * inv);
            out[1] = mask((m[2] * m[7] - m[1] * m[8]) * inv);
            out[2] = mask((m[1] * m[5] - m[2] * m[4]) * inv);
            out[3] = mask((m[5] * m[6] - m[3] * m[8]) * inv);
            out[4] = mask((m[0] * m[8] - m[2] * m[6]) * inv);
            out[5] = mask((m[2] * m[3] - m[0] * m[5]) * inv);
            out[6] = mask((m[3] * m[7] - m[4] * m[6]) * inv);
            out[7] = mask((m[1] * m[6] - m[0] * m[7]) * inv);
            out[8] = mask((m[0] * m[4] - m[1] * m[3]) * inv);
        } else if n == 16 {
            inverse4(m, out);
        } else {
            out.copy_from_slice(m);
        }
    }
    ctx.put(inst.dest, dst);
}

/// Closed-form 4x4 inverse by cofactor expansion.
fn inverse4(m: &[f32], out: &mut [f32]) {
    let mut inv = [0.0f32; 16];
    inv[0] = m[5] * m[10] * m[15] - m[5] * m[11] * m[14] - m[9] * m[6] * m[15]
        + m[9] * m[7] * m[14]
        + m[13] * m[6] * m[11]
        - m[13] * m[7] * m[10];
    inv[4] = -m[4] * m[10] * m[15] + m[4] * m[11] * m[14] + m[8] * m[6] * m[15]
        - m[8] * m[7] * m[14]
        - m[12] * m[6] * m[11]
        + m[12] * m[7] * m[10];
    inv[8] = m[4] * m[9] * m[15] - m[4] * m[11] * m[13] - m[8] * m[5] * m[15]
        + m[8] * m[7] * m[13]
        + m[12] * m[5] * m[11]
        - m[12] * m[7] * m[9];
    inv[12] = -m[4] * m[9] * m[14] + m[4] * m[10] * m[13] + m[8] * m[5] * m[14]
        - m[8] * m[6] * m[13]
        - m[12] * m[5] * m[10]
        + m[12] * m[6] * m[9];
    inv[1] = -m[1] * m[10] * m[15] + m[1] * m[11] * m[14] + m[9] * m[2] * m[15]
        - m[9] * m[3] * m[14]
        - m[13] * m[2] * m[11]
        + m[13] * m[3] * m[10];
    inv[5] = m[0] * m[10] * m[15] - m[0] * m[11] * m[14] - m[8] * m[2] * m[15]
        + m[8] * m[3] * m[14]
        + m[12] * m[2] * m[11]
        - m[12] * m[3] * m[10];
    inv[9] = -m[0] * m[9] * m[15] + m[0] * m[11] * m[13] + m[8] * m[1] * m[15]
        - m[8] * m[3] * m[13]
        - m[12] * m[1] * m[11]
        + m[12] * m[3] * m[9];
    inv[13] = m[0] * m[9] * m[14] - m[0] * m[10] * m[13] - m[8] * m[1] * m[14]
        + m[8] * m[2] * m[13]
        + m[12] * m[1] * m[10]
        - m[12] * m[2] * m[9];
    inv[2] = m[1] * m[6] * m[15] - m[1] * m[7] * m[14] - m[5] * m[2] * m[15]
        + m[5] * m[3] * m[14]
        + m[13] * m[2] * m[7]
        - m[13] * m[3] * m[6];
    inv[6] = -m[0] * m[6] * m[15] + m[0] * m[7] * m[14] + m[4] * m[2] * m[15]
        - m[4] * m[3] * m[14]
        - m[12] * m[2] * m[7]
        + m[12] * m[3] * m[6];
    inv[10] = m[0] * m[5] * m[15] - m[0] * m[7] * m[13] - m[4] * m[1] * m[15]
        + m[4] * m[3] * m[13]
        + m[12] * m[1] * m[7]
        - m[12] * m[3] * m[5];
    inv[14] = -m[0] * m[5] * m[14] + m[0] * m[6] * m[13] + m[4] * m[1] * m[14]
        - m[4] * m[2] * m[13]
        - m[12] * m[1] * m[6]
        + m[12] * m[2] * m[5];
    inv[3] = -m[1] * m[6] * m[11] + m[1] * m[7] * m[10] + m[5] * m[2] * m[11]
        - m[5] * m[3] * m[10]
        - m[9] * m[2] * m[7]
        + m[9] * m[3] * m[6];
    inv[7] = m[0] * m[6] * m[11] - m[0] * m[7] * m[10] - m[4] * m[2] * m[11]
        + m[4] * m[3] * m[10]
        + m[8] * m[2] * m[7]
        - m[8] * m[3] * m[6];
    inv[11] = -m[0] * m[5] * m[11] + m[0] * m[7] * m[9] + m[4] * m[1] * m[11]
        - m[4] * m[3] * m[9]
        - m[8] * m[1] * m[7]
        + m[8] * m[3] * m[5];
    inv[15] = m[0] * m[5] * m[10] - m[0] * m[6] * m[9] - m[4] * m[1] * m[10]
        + m[4] * m[2] * m[9]
        + m[8] * m[1] * m[6]
        - m[8] * m[2] * m[5];

    let det = m[0] * inv[0] + m[1] * inv[4] + m[2] * inv[8] + m[3] * inv[12];
    let scale = 1.0 / det;
    for (o, v) in out.iter_mut().zip(inv.iter()) {
        *o = mask(v * scale);
    }
}

/// Last-dim vector length of a tensor, 1 for scalars.
fn lane_width(info: &TypeInfo) -> usize {
    if info.ndim == 0 {
        1
    } else {
        info.shape[info.ndim - 1].max(1) as usize
    }
}

fn op_dot(ctx: &mut ExecCtx, inst: &Instruction) {
    let a_info = ctx.reg(inst.src1).info;
    let k = lane_width(&a_info);
    let mut info = a_info;
    if info.ndim > 0 {
        info.ndim -= 1;
    }
    info.dtype = Dtype::F32;
    info.calc_strides();

    let mut dst = ctx.take(inst.dest);
    dst.resize(info);
    let a = ctx.reg(inst.src1).f32();
    let b = ctx.reg(inst.src2).f32();
    for (i, out) in dst.f32_mut().iter_mut().enumerate() {
        let mut sum = 0.0;
        for l in 0..k {
            sum += at_f32(a, i * k + l) * at_f32(b, i * k + l);
        }
        *out = mask(sum);
    }
    ctx.put(inst.dest, dst);
}

fn op_length(ctx: &mut ExecCtx, inst: &Instruction) {
    let a_info = ctx.reg(inst.src1).info;
    let k = lane_width(&a_info);
    let mut info = a_info;
    if info.ndim > 0 {
        info.ndim -= 1;
    }
    info.dtype = Dtype::F32;
    info.calc_strides();

    let mut dst = ctx.take(inst.dest);
    dst.resize(info);
    let a = ctx.reg(inst.src1).f32();
    for (i, out) in dst.f32_mut().iter_mut().enumerate() {
        let mut sum = 0.0;
        for l in 0..k {
            let v = at_f32(a, i * k + l);
            sum += v * v;
        }
        *out = mask(sum.sqrt());
    }
    ctx.put(inst.dest, dst);
}

fn op_normalize(ctx: &mut ExecCtx, inst: &Instruction) {
    let src = ctx.reg(inst.src1).clone();
    let k = lane_width(&src.info);
    let mut dst = ctx.take(inst.dest);
    let mut info = src.info;
    info.dtype = Dtype::F32;
    dst.resize(info);
    let a = src.f32();
    let out = dst.f32_mut();
    let groups = if k == 0 { 0 } else { a.len() / k };
    for i in 0..groups {
        let mut sum = 0.0;
        for l in 0..k {
            sum += a[i * k + l] * a[i * k + l];
        }
        let inv = 1.0 / sum.sqrt();
        for l in 0..k {
            out[i * k + l] = mask(a[i * k + l] * inv);
        }
    }
    ctx.put(inst.dest, dst);
}

fn op_join(ctx: &mut ExecCtx, inst: &Instruction) {
    let a = ctx.reg(inst.src1).clone();
    let b = ctx.reg(inst.src2).clone();
    let n = a.len().max(b.len()).max(1);

    let mut info = a.info;
    if info.ndim < crate::tensor::MAX_DIMS {
        info.shape[info.ndim] = 2;
        info.ndim += 1;
    }
    info.calc_strides();
    let mut dst = ctx.take(inst.dest);
    dst.resize(info);

    match dst.info.dtype {
        Dtype::F32 => {
            let out = dst.f32_mut();
            for j in 0..n {
                out[2 * j] = at_f32(a.f32(), j);
                out[2 * j + 1] = at_f32(b.f32(), j);
            }
        }
        Dtype::I32 => {
            let out = dst.i32_mut();
            for j in 0..n {
                out[2 * j] = at_i32(a.i32(), j);
                out[2 * j + 1] = at_i32(b.i32(), j);
            }
        }
        _ => ctx.fail(ExecError::Runtime),
    }
    ctx.put(inst.dest, dst);
}

fn op_range(ctx: &mut ExecCtx, inst: &Instruction) {
    let count = ctx.reg(inst.src1).index_at(0).unwrap_or(0).max(0);
    let mut dst = ctx.take(inst.dest);
    dst.resize(TypeInfo::with_shape(Dtype::F32, &[count]));
    for (i, out) in dst.f32_mut().iter_mut().enumerate() {
        *out = i as f32;
    }
    ctx.put(inst.dest, dst);
}

/// Coordinate generator over the invocation domain: axis 0 is the row
/// (slowest) coordinate, axis 1 the column, axis 2 the depth slice. The
/// axis arrives as an immediate in the instruction's spare slot.
fn op_index(ctx: &mut ExecCtx, inst: &Instruction) {
    let DomainCoords {
        global_offset,
        local_size,
        ..
    } = ctx.coords;
    let axis = inst.padding as usize;
    let rows = local_size[0].max(1) as usize;
    let cols = local_size[1].max(1) as usize;
    let n = rows * cols;

    let mut dst = ctx.take(inst.dest);
    dst.resize(TypeInfo::with_shape(Dtype::F32, &[n as i32]));
    for (j, out) in dst.f32_mut().iter_mut().enumerate() {
        let v = match axis {
            0 => global_offset[0] as usize + j / cols,
            1 => global_offset[1] as usize + j % cols,
            2 => global_offset[2] as usize,
            _ => 0,
        };
        *out = v as f32;
    }
    ctx.put(inst.dest, dst);
}

fn op_gather(ctx: &mut ExecCtx, inst: &Instruction) {
    let data = ctx.reg(inst.src1).clone();
    let indices = ctx.reg(inst.src2).clone();
    let mut info = indices.info;
    info.dtype = data.info.dtype;
    info.calc_strides();
    let mut dst = ctx.take(inst.dest);
    dst.resize(info);

    let limit = data.len().saturating_sub(1) as i32;
    let pick = |j: usize| -> usize { indices.index_at(j).unwrap_or(0).max(0).min(limit.max(0)) as usize };
    match dst.info.dtype {
        Dtype::F32 => {
            let out = dst.f32_mut();
            for j in 0..out.len() {
                out[j] = at_f32(data.f32(), pick(j));
            }
        }
        Dtype::I32 => {
            let out = dst.i32_mut();
            for j in 0..out.len() {
                out[j] = at_i32(data.i32(), pick(j));
            }
        }
        Dtype::U8 => {
            let out = dst.u8_mut();
            for j in 0..out.len() {
                let v = at_num(&data, pick(j)) as u8;
                out[j] = v;
            }
        }
        _ => ctx.fail(ExecError::Runtime),
    }
    ctx.put(inst.dest, dst);
}

fn op_cumsum(ctx: &mut ExecCtx, inst: &Instruction) {
    let src = ctx.reg(inst.src1).clone();
    let mut dst = ctx.take(inst.dest);
    dst.resize(src.info);
    match dst.info.dtype {
        Dtype::F32 => {
            let mut acc = 0.0f32;
            let input = src.f32();
            for (out, v) in dst.f32_mut().iter_mut().zip(input.iter()) {
                acc = mask(acc + v);
                *out = acc;
            }
        }
        Dtype::I32 => {
            let mut acc = 0i32;
            let input = src.i32();
            for (out, v) in dst.i32_mut().iter_mut().zip(input.iter()) {
                acc = acc.wrapping_add(*v);
                *out = acc;
            }
        }
        _ => ctx.fail(ExecError::Runtime),
    }
    ctx.put(inst.dest, dst);
}

/// Keeps the elements whose mask lane is non-zero; the output is 1-D with
/// the surviving count.
fn op_filter(ctx: &mut ExecCtx, inst: &Instruction) {
    let src = ctx.reg(inst.src1).clone();
    let mask_t = ctx.reg(inst.src2).clone();
    let kept: Vec<usize> = (0..src.len()).filter(|&j| at_bool(&mask_t, j)).collect();

    let mut dst = ctx.take(inst.dest);
    match src.data() {
        TensorData::F32(v) => {
            let out: Vec<f32> = kept.iter().map(|&j| v[j]).collect();
            dst = Tensor::from_f32(&[out.len() as i32], out);
        }
        TensorData::I32(v) => {
            let out: Vec<i32> = kept.iter().map(|&j| v[j]).collect();
            dst = Tensor::from_i32(&[out.len() as i32], out);
        }
        TensorData::U8(v) => {
            let out: Vec<u8> = kept.iter().map(|&j| v[j]).collect();
            dst = Tensor::from_u8(&[out.len() as i32], out);
        }
        TensorData::Empty => dst.resize(TypeInfo::with_shape(src.info.dtype, &[0])),
    }
    ctx.put(inst.dest, dst);
}

fn op_slice(ctx: &mut ExecCtx, inst: &Instruction) {
    let src = ctx.reg(inst.src1).clone();
    let range = ctx.reg(inst.src2);
    let len = src.len() as i32;
    let start = range.index_at(0).unwrap_or(0).max(0).min(len);
    let end = range.index_at(1).unwrap_or(len).max(start).min(len);

    let mut dst = ctx.take(inst.dest);
    match src.data() {
        TensorData::F32(v) => {
            dst = Tensor::from_f32(
                &[end - start],
                v[start as usize..end as usize].to_vec(),
            )
        }
        TensorData::I32(v) => {
            dst = Tensor::from_i32(
                &[end - start],
                v[start as usize..end as usize].to_vec(),
            )
        }
        TensorData::U8(v) => {
            dst = Tensor::from_u8(
                &[end - start],
                v[start as usize..end as usize].to_vec(),
            )
        }
        TensorData::Empty => dst.resize(TypeInfo::with_shape(src.info.dtype, &[0])),
    }
    ctx.put(inst.dest, dst);
}

fn op_reshape(ctx: &mut ExecCtx, inst: &Instruction) {
    let src = ctx.reg(inst.src1).clone();
    let shape_t = ctx.reg(inst.src2);
    let rank = shape_t.len().min(crate::tensor::MAX_DIMS);
    let mut dims = [0i32; crate::tensor::MAX_DIMS];
    let mut wildcard = None;
    let mut known: usize = 1;
    for k in 0..rank {
        dims[k] = shape_t.index_at(k).unwrap_or(0);
        if dims[k] <= 0 {
            if wildcard.replace(k).is_some() {
                ctx.fail(ExecError::ShapeMismatch);
                return;
            }
        } else {
            known *= dims[k] as usize;
        }
    }
    if let Some(w) = wildcard {
        if known == 0 || src.len() % known != 0 {
            ctx.fail(ExecError::ShapeMismatch);
            return;
        }
        dims[w] = (src.len() / known) as i32;
        known *= dims[w] as usize;
    }
    if known != src.len() {
        ctx.fail(ExecError::ShapeMismatch);
        return;
    }

    let mut out = src;
    out.info = TypeInfo::with_shape(out.info.dtype, &dims[..rank]);
    let _ = ctx.take(inst.dest);
    ctx.put(inst.dest, out);
}

fn op_copy(ctx: &mut ExecCtx, inst: &Instruction) {
    let src = ctx.reg(inst.src1).clone();
    let _ = ctx.take(inst.dest);
    ctx.put(inst.dest, src);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn run_one(regs: &mut Vec<Tensor>, inst: Instruction) -> u32 {
        let error = AtomicU32::new(0);
        let mut ctx = ExecCtx::new(regs, &error);
        CpuBackend.exec(&mut ctx, &inst);
        error.load(std::sync::atomic::Ordering::SeqCst)
    }

    #[test]
    fn add_broadcasts_scalar() {
        let mut regs = vec![
            Tensor::empty(TypeInfo::with_shape(Dtype::F32, &[3])),
            Tensor::from_f32(&[3], vec![1.0, 2.0, 3.0]),
            Tensor::scalar_f32(10.0),
        ];
        let code = run_one(&mut regs, Instruction::new(Opcode::Add, 0, 1, 2, 0));
        assert_eq!(code, 0);
        assert_eq!(regs[0].f32(), &[11.0, 12.0, 13.0][..]);
    }

    #[test]
    fn division_by_zero_masks_to_zero() {
        let mut regs = vec![
            Tensor::empty(TypeInfo::with_shape(Dtype::F32, &[2])),
            Tensor::from_f32(&[2], vec![1.0, -1.0]),
            Tensor::scalar_f32(0.0),
        ];
        run_one(&mut regs, Instruction::new(Opcode::Div, 0, 1, 2, 0));
        assert_eq!(regs[0].f32(), &[0.0, 0.0][..]);
    }

    #[test]
    fn where_pair_composes_a_select() {
        let mut regs = vec![
            Tensor::empty(TypeInfo::with_shape(Dtype::F32, &[3])),
            Tensor::from_u8(&[3], vec![1, 0, 1]),
            Tensor::from_f32(&[3], vec![10.0, 20.0, 30.0]),
            Tensor::from_f32(&[3], vec![-1.0, -2.0, -3.0]),
        ];
        run_one(&mut regs, Instruction::new(Opcode::WhereTrue, 0, 1, 2, 0));
        run_one(&mut regs, Instruction::new(Opcode::WhereFalse, 0, 1, 3, 0));
        assert_eq!(regs[0].f32(), &[10.0, -2.0, 30.0][..]);
    }

    #[test]
    fn matmul_2x2() {
        let mut regs = vec![
            Tensor::empty(TypeInfo::with_shape(Dtype::F32, &[2, 2])),
            Tensor::from_f32(&[2, 2], vec![1.0, 2.0, 3.0, 4.0]),
            Tensor::from_f32(&[2, 2], vec![5.0, 6.0, 7.0, 8.0]),
        ];
        let code = run_one(&mut regs, Instruction::new(Opcode::MatMul, 0, 1, 2, 0));
        assert_eq!(code, 0);
        assert_eq!(regs[0].f32(), &[19.0, 22.0, 43.0, 50.0][..]);
    }

    #[test]
    fn matmul_inner_mismatch_sets_the_error_word() {
        let mut regs = vec![
            Tensor::empty(TypeInfo::with_shape(Dtype::F32, &[2, 2])),
            Tensor::from_f32(&[2, 3], vec![0.0; 6]),
            Tensor::from_f32(&[2, 2], vec![0.0; 4]),
        ];
        let code = run_one(&mut regs, Instruction::new(Opcode::MatMul, 0, 1, 2, 0));
        assert_eq!(ExecError::from_code(code), Some(ExecError::ShapeMismatch));
    }

    #[test]
    fn inverse3_times_input_is_identity() {
        let m = vec![2.0, 0.0, 0.0, 0.0, 4.0, 0.0, 0.0, 0.0, 8.0];
        let mut regs = vec![
            Tensor::empty(TypeInfo::with_shape(Dtype::F32, &[3, 3])),
            Tensor::from_f32(&[3, 3], m),
        ];
        run_one(&mut regs, Instruction::new(Opcode::Inverse, 0, 1, 0, 0));
        assert_eq!(regs[0].f32()[0], 0.5);
        assert_eq!(regs[0].f32()[4], 0.25);
        assert_eq!(regs[0].f32()[8], 0.125);
    }

    #[test]
    fn dot_reduces_lanes() {
        let mut regs = vec![
            Tensor::empty(TypeInfo::with_shape(Dtype::F32, &[2])),
            Tensor::from_f32(&[2, 3], vec![1.0, 0.0, 0.0, 0.0, 2.0, 0.0]),
            Tensor::from_f32(&[2, 3], vec![1.0, 1.0, 1.0, 1.0, 1.0, 1.0]),
        ];
        run_one(&mut regs, Instruction::new(Opcode::Dot, 0, 1, 2, 0));
        assert_eq!(regs[0].f32(), &[1.0, 2.0][..]);
    }

    #[test]
    fn filter_compresses_by_mask() {
        let mut regs = vec![
            Tensor::default(),
            Tensor::from_f32(&[4], vec![1.0, 2.0, 3.0, 4.0]),
            Tensor::from_u8(&[4], vec![1, 0, 0, 1]),
        ];
        run_one(&mut regs, Instruction::new(Opcode::Filter, 0, 1, 2, 0));
        assert_eq!(regs[0].f32(), &[1.0, 4.0][..]);
        assert_eq!(regs[0].info.dims(), &[2]);
    }

    #[test]
    fn cumsum_runs_forward() {
        let mut regs = vec![
            Tensor::default(),
            Tensor::from_f32(&[4], vec![1.0, 2.0, 3.0, 4.0]),
        ];
        run_one(&mut regs, Instruction::new(Opcode::CumSum, 0, 1, 0, 0));
        assert_eq!(regs[0].f32(), &[1.0, 3.0, 6.0, 10.0][..]);
    }

    #[test]
    fn reshape_resolves_a_wildcard() {
        let mut regs = vec![
            Tensor::default(),
            Tensor::from_f32(&[6], vec![0.0; 6]),
            Tensor::from_i32(&[2], vec![2, -1]),
        ];
        let code = run_one(&mut regs, Instruction::new(Opcode::Reshape, 0, 1, 2, 0));
        assert_eq!(code, 0);
        assert_eq!(regs[0].info.dims(), &[2, 3]);
    }

    #[test]
    fn gather_clamps_out_of_range_indices() {
        let mut regs = vec![
            Tensor::default(),
            Tensor::from_f32(&[3], vec![10.0, 20.0, 30.0]),
            Tensor::from_i32(&[4], vec![2, 0, 9, -5]),
        ];
        run_one(&mut regs, Instruction::new(Opcode::Gather, 0, 1, 2, 0));
        assert_eq!(regs[0].f32(), &[30.0, 10.0, 30.0, 10.0][..]);
    }

    #[test]
    fn smoothstep_with_uniform_edges() {
        let mut regs = vec![
            Tensor::default(),
            Tensor::from_f32(&[2], vec![0.0, 1.0]),
            Tensor::from_f32(&[3], vec![-1.0, 0.5, 2.0]),
        ];
        run_one(&mut regs, Instruction::new(Opcode::SmoothStep, 0, 1, 2, 0));
        assert_eq!(regs[0].f32(), &[0.0, 0.5, 1.0][..]);
    }

    #[test]
    fn slice_copies_the_range() {
        let mut regs = vec![
            Tensor::default(),
            Tensor::from_f32(&[5], vec![0.0, 1.0, 2.0, 3.0, 4.0]),
            Tensor::from_i32(&[2], vec![1, 4]),
        ];
        run_one(&mut regs, Instruction::new(Opcode::Slice, 0, 1, 2, 0));
        assert_eq!(regs[0].f32(), &[1.0, 2.0, 3.0][..]);
    }
}
