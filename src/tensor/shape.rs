//! Broadcast resolution and the operand stride rule used by codegen.

use super::{TypeInfo, MAX_DIMS};

fn dims_match(a: i32, b: i32) -> bool {
    a == b || a <= 0 || b <= 0
}

/// Resolves the broadcast of two shapes, or `None` when they are not
/// broadcastable. The rules, in order:
///
/// 1. one side has a single element → the other side wins;
/// 2. identical shapes;
/// 3. trailing suffix: one side carries one extra leading batch dim;
/// 4. equal rank where dims differ only when one side is dynamic (`<= 0`),
///    resolved to the positive side.
///
/// The result keeps the first operand's dtype; dtype agreement is checked
/// by the caller.
pub fn broadcast(a: &TypeInfo, b: &TypeInfo) -> Option<TypeInfo> {
    if a.element_count() == 1 && !a.is_dynamic() {
        return Some(pick(b, a));
    }
    if b.element_count() == 1 && !b.is_dynamic() {
        return Some(*a);
    }
    if a.same_shape(b) {
        return Some(*a);
    }

    // [batch, ..suffix] against [..suffix].
    if a.ndim == b.ndim + 1 {
        let ok = (0..b.ndim).all(|i| dims_match(a.shape[i + 1], b.shape[i]));
        if ok {
            return Some(*a);
        }
    }
    if b.ndim == a.ndim + 1 {
        let ok = (0..a.ndim).all(|i| dims_match(b.shape[i + 1], a.shape[i]));
        if ok {
            return Some(pick(b, a));
        }
    }

    // Equal rank with dynamic wildcards.
    if a.ndim == b.ndim {
        let mut out = *a;
        for i in 0..a.ndim {
            if a.shape[i] != b.shape[i] {
                if a.shape[i] > 0 && b.shape[i] > 0 {
                    return None;
                }
                out.shape[i] = a.shape[i].max(b.shape[i]);
            }
        }
        out.calc_strides();
        return Some(out);
    }

    None
}

fn pick(shape_src: &TypeInfo, dtype_src: &TypeInfo) -> TypeInfo {
    let mut out = *shape_src;
    out.dtype = dtype_src.dtype;
    out
}

/// Element stride of an operand with `op_count` elements iterated over a
/// domain of `dom_count` elements: `1` for a one-to-one walk, `0` for a
/// broadcast scalar, `k <= 16` for packed channels, `0` otherwise.
pub fn linear_stride(op_count: usize, dom_count: usize) -> i32 {
    if dom_count <= 1 {
        return if op_count > 0 { 1 } else { 0 };
    }
    if op_count == dom_count || op_count == 0 {
        return 1;
    }
    if op_count == 1 {
        return 0;
    }
    if op_count > dom_count && op_count % dom_count == 0 {
        let ratio = op_count / dom_count;
        if ratio <= 16 {
            return ratio as i32;
        }
    }
    0
}

/// Dimension bound helper shared by shape-rule code; `MAX_DIMS` guards
/// joins that append a trailing dimension.
pub fn can_append_dim(info: &TypeInfo) -> bool {
    info.ndim < MAX_DIMS
}

#[cfg(test)]
mod tests {
    use super::super::Dtype;
    use super::*;

    fn shape(dims: &[i32]) -> TypeInfo {
        TypeInfo::with_shape(Dtype::F32, dims)
    }

    #[test]
    fn scalar_broadcasts_to_vector() {
        let s = TypeInfo::scalar(Dtype::F32);
        let v = shape(&[4]);
        assert_eq!(broadcast(&s, &v).unwrap().dims(), &[4]);
        assert_eq!(broadcast(&v, &s).unwrap().dims(), &[4]);
    }

    #[test]
    fn identical_shapes_pass_through() {
        let v = shape(&[2, 3]);
        assert_eq!(broadcast(&v, &v).unwrap().dims(), &[2, 3]);
    }

    #[test]
    fn leading_batch_dim_is_accepted() {
        let batched = shape(&[8, 3]);
        let row = shape(&[3]);
        assert_eq!(broadcast(&batched, &row).unwrap().dims(), &[8, 3]);
        assert_eq!(broadcast(&row, &batched).unwrap().dims(), &[8, 3]);
    }

    #[test]
    fn dynamic_wildcard_resolves_to_positive_side() {
        let dynamic = shape(&[0, 4]);
        let fixed = shape(&[16, 4]);
        let out = broadcast(&dynamic, &fixed).unwrap();
        assert_eq!(out.dims(), &[16, 4]);
    }

    #[test]
    fn mismatched_shapes_are_rejected() {
        assert!(broadcast(&shape(&[2]), &shape(&[3])).is_none());
        assert!(broadcast(&shape(&[2, 2]), &shape(&[3, 3])).is_none());
    }

    #[test]
    fn broadcast_result_covers_both_operands() {
        // Every resolved output shape must index both inputs through
        // strides 0/1/k.
        let cases = [
            (shape(&[4]), TypeInfo::scalar(Dtype::F32)),
            (shape(&[8, 3]), shape(&[3])),
            (shape(&[2, 2]), shape(&[2, 2])),
        ];
        for (a, b) in &cases {
            let out = broadcast(a, b).unwrap();
            let dom = out.element_count();
            for op in &[a, b] {
                let stride = linear_stride(op.element_count(), dom);
                let last = (dom - 1) * stride as usize;
                assert!(last < op.element_count().max(1) * dom);
            }
        }
    }

    #[test]
    fn stride_rule() {
        assert_eq!(linear_stride(16, 16), 1);
        assert_eq!(linear_stride(1, 16), 0);
        assert_eq!(linear_stride(64, 16), 4);
        assert_eq!(linear_stride(16 * 17, 16), 0); // ratio above 16
        assert_eq!(linear_stride(7, 16), 0);
        assert_eq!(linear_stride(5, 1), 1); // degenerate domain
    }
}
