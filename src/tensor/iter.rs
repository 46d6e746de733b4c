//! Strided N-dimensional iteration over element offsets.

use super::{TypeInfo, MAX_DIMS};

/// Walks a tensor in logical row-major order, yielding element offsets
/// into its storage. Contiguous layouts take a straight-line fast path;
/// anything else increments the fastest-varying dimension and carries.
///
/// Every advance is bounds-checked; stepping outside `[0, limit]` is an
/// invariant violation and panics.
pub struct StridedIter<'a> {
    info: &'a TypeInfo,
    offset: isize,
    limit: isize,
    indices: [i32; MAX_DIMS],
    contiguous: bool,
}

impl<'a> StridedIter<'a> {
    /// Starts at offset zero; `limit` is the element count of the backing
    /// storage.
    pub fn new(info: &'a TypeInfo, limit: usize) -> Self {
        StridedIter {
            info,
            offset: 0,
            limit: limit as isize,
            indices: [0; MAX_DIMS],
            contiguous: info.is_contiguous(),
        }
    }

    /// Current element offset. Panics when the iterator has walked past
    /// the end of the storage.
    pub fn offset(&self) -> usize {
        assert!(
            self.offset >= 0 && self.offset < self.limit,
            "tensor iterator out of bounds: offset {} not in [0, {})",
            self.offset,
            self.limit
        );
        self.offset as usize
    }

    /// Steps to the next logical element.
    pub fn next(&mut self) {
        if self.contiguous {
            self.offset += 1;
        } else {
            let ndim = self.info.ndim;
            let mut carried = true;
            for i in (0..ndim).rev() {
                self.indices[i] += 1;
                if self.indices[i] < self.info.shape[i].max(1) {
                    self.offset += self.info.strides[i] as isize;
                    carried = false;
                    break;
                }
                self.offset -=
                    ((self.info.shape[i].max(1) - 1) * self.info.strides[i]) as isize;
                self.indices[i] = 0;
            }
            if carried {
                // Wrapped the whole domain.
                self.offset = self.limit;
            }
        }
        assert!(
            self.offset >= 0 && self.offset <= self.limit,
            "tensor iterator out of bounds after step"
        );
    }

    /// Advances by `step` elements: a single add when contiguous, `step`
    /// successive carries otherwise.
    pub fn advance(&mut self, step: i32) {
        match step {
            0 => {}
            1 => self.next(),
            _ if self.contiguous => {
                self.offset += step as isize;
                assert!(
                    self.offset >= 0 && self.offset <= self.limit,
                    "tensor iterator out of bounds after advance"
                );
            }
            _ => {
                for _ in 0..step {
                    self.next();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::Dtype;
    use super::*;

    #[test]
    fn contiguous_walk_is_linear() {
        let info = TypeInfo::with_shape(Dtype::F32, &[2, 3]);
        let mut it = StridedIter::new(&info, 6);
        let mut seen = Vec::new();
        for _ in 0..6 {
            seen.push(it.offset());
            it.next();
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn transposed_walk_follows_strides() {
        // A [3,2] view over [2,3] storage: strides swapped.
        let mut info = TypeInfo::with_shape(Dtype::F32, &[3, 2]);
        info.strides = {
            let mut s = [0; MAX_DIMS];
            s[0] = 1;
            s[1] = 3;
            s
        };
        let mut it = StridedIter::new(&info, 6);
        let mut seen = Vec::new();
        for _ in 0..6 {
            seen.push(it.offset());
            it.next();
        }
        assert_eq!(seen, vec![0, 3, 1, 4, 2, 5]);
    }

    #[test]
    fn advance_matches_repeated_next() {
        let info = TypeInfo::with_shape(Dtype::F32, &[8]);
        let mut a = StridedIter::new(&info, 8);
        let mut b = StridedIter::new(&info, 8);
        a.advance(5);
        for _ in 0..5 {
            b.next();
        }
        assert_eq!(a.offset(), b.offset());
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn walking_past_the_end_traps() {
        let info = TypeInfo::with_shape(Dtype::F32, &[2]);
        let mut it = StridedIter::new(&info, 2);
        it.next();
        it.next();
        it.offset();
    }
}
