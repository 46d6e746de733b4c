//! The tensor model: dtypes, shape/stride metadata and typed storage.

mod iter;
mod shape;

pub use self::iter::StridedIter;
pub use self::shape::{broadcast, can_append_dim, linear_stride};

use std::fmt;

use serde::{Deserialize, Serialize};

/// Maximum supported rank.
pub const MAX_DIMS: usize = 8;

/// Element type of a tensor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dtype {
    Unknown,
    F32,
    I32,
    U8,
}

impl Default for Dtype {
    fn default() -> Self {
        Dtype::Unknown
    }
}

impl Dtype {
    /// Element size in bytes.
    pub fn size(self) -> usize {
        match self {
            Dtype::F32 | Dtype::I32 => 4,
            Dtype::U8 => 1,
            Dtype::Unknown => 0,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Dtype::F32 => "F32",
            Dtype::I32 => "I32",
            Dtype::U8 => "U8",
            Dtype::Unknown => "Unknown",
        }
    }

    pub fn from_name(name: &str) -> Option<Dtype> {
        match name {
            "F32" => Some(Dtype::F32),
            "I32" => Some(Dtype::I32),
            "U8" => Some(Dtype::U8),
            _ => None,
        }
    }

    pub fn from_u8(raw: u8) -> Dtype {
        match raw {
            1 => Dtype::F32,
            2 => Dtype::I32,
            3 => Dtype::U8,
            _ => Dtype::Unknown,
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            Dtype::Unknown => 0,
            Dtype::F32 => 1,
            Dtype::I32 => 2,
            Dtype::U8 => 3,
        }
    }
}

impl fmt::Display for Dtype {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Shape and layout of a tensor. Rank 0 denotes a scalar; a dimension
/// `<= 0` is dynamic and resolved at runtime.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TypeInfo {
    pub dtype: Dtype,
    pub ndim: usize,
    pub shape: [i32; MAX_DIMS],
    pub strides: [i32; MAX_DIMS],
}

impl Default for TypeInfo {
    fn default() -> Self {
        TypeInfo::scalar(Dtype::Unknown)
    }
}

impl TypeInfo {
    pub fn scalar(dtype: Dtype) -> Self {
        TypeInfo {
            dtype,
            ndim: 0,
            shape: [0; MAX_DIMS],
            strides: [0; MAX_DIMS],
        }
    }

    pub fn with_shape(dtype: Dtype, dims: &[i32]) -> Self {
        assert!(dims.len() <= MAX_DIMS, "rank above {} unsupported", MAX_DIMS);
        let mut info = TypeInfo::scalar(dtype);
        info.ndim = dims.len();
        info.shape[..dims.len()].copy_from_slice(dims);
        info.calc_strides();
        info
    }

    pub fn dims(&self) -> &[i32] {
        &self.shape[..self.ndim]
    }

    /// Row-major strides; dynamic dimensions count as one element.
    /// Entries beyond `ndim` are zeroed so equal shapes compare (and
    /// serialise) identically regardless of how they were produced.
    pub fn calc_strides(&mut self) {
        let mut stride = 1i32;
        for k in (0..self.ndim).rev() {
            self.strides[k] = stride;
            stride *= self.shape[k].max(1);
        }
        for k in self.ndim..MAX_DIMS {
            self.shape[k] = 0;
            self.strides[k] = 0;
        }
    }

    /// Number of elements, counting dynamic dimensions as one.
    pub fn element_count(&self) -> usize {
        self.dims().iter().map(|&d| d.max(1) as usize).product()
    }

    pub fn byte_len(&self) -> usize {
        self.element_count() * self.dtype.size()
    }

    pub fn is_dynamic(&self) -> bool {
        self.ndim > 0 && self.dims().iter().any(|&d| d <= 0)
    }

    pub fn is_contiguous(&self) -> bool {
        let mut stride = 1i32;
        for k in (0..self.ndim).rev() {
            if self.strides[k] != stride {
                return false;
            }
            stride *= self.shape[k].max(1);
        }
        true
    }

    pub fn same_shape(&self, other: &TypeInfo) -> bool {
        self.ndim == other.ndim && self.dims() == other.dims()
    }
}

impl fmt::Display for TypeInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.dims().iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", d)?;
        }
        write!(f, "]")
    }
}

/// Typed element storage; one vector per dtype keeps every access
/// alignment-safe.
#[derive(Clone, Debug, PartialEq)]
pub enum TensorData {
    Empty,
    F32(Vec<f32>),
    I32(Vec<i32>),
    U8(Vec<u8>),
}

impl TensorData {
    pub fn len(&self) -> usize {
        match self {
            TensorData::Empty => 0,
            TensorData::F32(v) => v.len(),
            TensorData::I32(v) => v.len(),
            TensorData::U8(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A tensor: layout metadata plus owned storage. Ownership of the storage
/// gives the "freed exactly once" buffer invariant for free.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Tensor {
    pub info: TypeInfo,
    data: TensorData,
}

impl Default for TensorData {
    fn default() -> Self {
        TensorData::Empty
    }
}

impl Tensor {
    /// A placeholder with known layout and no storage.
    pub fn empty(info: TypeInfo) -> Self {
        Tensor {
            info,
            data: TensorData::Empty,
        }
    }

    /// Zero-initialised storage for the full element count.
    pub fn zeros(info: TypeInfo) -> Self {
        let mut t = Tensor::empty(info);
        t.ensure_storage();
        t
    }

    pub fn scalar_f32(value: f32) -> Self {
        Tensor {
            info: TypeInfo::scalar(Dtype::F32),
            data: TensorData::F32(vec![value]),
        }
    }

    pub fn scalar_i32(value: i32) -> Self {
        Tensor {
            info: TypeInfo::scalar(Dtype::I32),
            data: TensorData::I32(vec![value]),
        }
    }

    pub fn scalar_u8(value: u8) -> Self {
        Tensor {
            info: TypeInfo::scalar(Dtype::U8),
            data: TensorData::U8(vec![value]),
        }
    }

    pub fn from_f32(dims: &[i32], values: Vec<f32>) -> Self {
        Tensor {
            info: TypeInfo::with_shape(Dtype::F32, dims),
            data: TensorData::F32(values),
        }
    }

    pub fn from_i32(dims: &[i32], values: Vec<i32>) -> Self {
        Tensor {
            info: TypeInfo::with_shape(Dtype::I32, dims),
            data: TensorData::I32(values),
        }
    }

    pub fn from_u8(dims: &[i32], values: Vec<u8>) -> Self {
        Tensor {
            info: TypeInfo::with_shape(Dtype::U8, dims),
            data: TensorData::U8(values),
        }
    }

    pub fn data(&self) -> &TensorData {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn has_data(&self) -> bool {
        !self.data.is_empty()
    }

    pub fn byte_len(&self) -> usize {
        self.len() * self.info.dtype.size()
    }

    pub fn f32(&self) -> &[f32] {
        match &self.data {
            TensorData::F32(v) => v,
            _ => &[],
        }
    }

    pub fn i32(&self) -> &[i32] {
        match &self.data {
            TensorData::I32(v) => v,
            _ => &[],
        }
    }

    pub fn u8(&self) -> &[u8] {
        match &self.data {
            TensorData::U8(v) => v,
            _ => &[],
        }
    }

    pub fn f32_mut(&mut self) -> &mut [f32] {
        self.ensure_storage();
        match &mut self.data {
            TensorData::F32(v) => v,
            _ => &mut [],
        }
    }

    pub fn i32_mut(&mut self) -> &mut [i32] {
        self.ensure_storage();
        match &mut self.data {
            TensorData::I32(v) => v,
            _ => &mut [],
        }
    }

    pub fn u8_mut(&mut self) -> &mut [u8] {
        self.ensure_storage();
        match &mut self.data {
            TensorData::U8(v) => v,
            _ => &mut [],
        }
    }

    /// Reads element `i` as an index value, accepting F32 or I32 storage.
    /// Constant range and shape operands use this.
    pub fn index_at(&self, i: usize) -> Option<i32> {
        match &self.data {
            TensorData::F32(v) => v.get(i).map(|&x| x as i32),
            TensorData::I32(v) => v.get(i).copied(),
            TensorData::U8(v) => v.get(i).map(|&x| i32::from(x)),
            TensorData::Empty => None,
        }
    }

    /// Adopts `info`, growing or shrinking storage as needed. Existing
    /// content is preserved up to the smaller of the two sizes; a dtype
    /// change discards it.
    pub fn resize(&mut self, info: TypeInfo) {
        let count = info.element_count();
        if info.dtype != self.info.dtype {
            self.info = info;
            self.data = TensorData::Empty;
            self.ensure_storage();
            return;
        }
        self.info = info;
        match &mut self.data {
            TensorData::F32(v) => v.resize(count, 0.0),
            TensorData::I32(v) => v.resize(count, 0),
            TensorData::U8(v) => v.resize(count, 0),
            TensorData::Empty => self.ensure_storage(),
        }
    }

    fn ensure_storage(&mut self) {
        if self.data.is_empty() {
            let count = self.info.element_count();
            self.data = match self.info.dtype {
                Dtype::F32 => TensorData::F32(vec![0.0; count]),
                Dtype::I32 => TensorData::I32(vec![0; count]),
                Dtype::U8 => TensorData::U8(vec![0; count]),
                Dtype::Unknown => TensorData::Empty,
            };
        }
    }

    /// Serialises the storage to little-endian bytes, in element order.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        match &self.data {
            TensorData::Empty => Vec::new(),
            TensorData::F32(v) => {
                let mut out = Vec::with_capacity(v.len() * 4);
                for x in v {
                    out.extend_from_slice(&x.to_bits().to_le_bytes());
                }
                out
            }
            TensorData::I32(v) => {
                let mut out = Vec::with_capacity(v.len() * 4);
                for x in v {
                    out.extend_from_slice(&x.to_le_bytes());
                }
                out
            }
            TensorData::U8(v) => v.clone(),
        }
    }

    /// Replaces the storage from little-endian bytes; the byte length must
    /// be a multiple of the element size.
    pub fn copy_from_le_bytes(&mut self, bytes: &[u8]) {
        match self.info.dtype {
            Dtype::F32 => {
                let vals = bytes
                    .chunks_exact(4)
                    .map(|c| f32::from_bits(u32::from_le_bytes([c[0], c[1], c[2], c[3]])))
                    .collect();
                self.data = TensorData::F32(vals);
            }
            Dtype::I32 => {
                let vals = bytes
                    .chunks_exact(4)
                    .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect();
                self.data = TensorData::I32(vals);
            }
            Dtype::U8 => self.data = TensorData::U8(bytes.to_vec()),
            Dtype::Unknown => self.data = TensorData::Empty,
        }
    }

    pub fn from_le_bytes(info: TypeInfo, bytes: &[u8]) -> Self {
        let mut t = Tensor::empty(info);
        t.copy_from_le_bytes(bytes);
        t
    }
}
