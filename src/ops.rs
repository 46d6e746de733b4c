//! The operation registry.
//!
//! One `op_table!` invocation is the single source of truth for every
//! operation: the graph-level node kind, its JSON type name, the opcode it
//! lowers to, arity category, accepted input dtypes, output dtype rule,
//! shape rule and input port names. Compiler passes and the backend all
//! consult this table; adding an operation means one table row plus a
//! kernel.

use crate::tensor::Dtype;

pub const MASK_F32: u8 = 1 << 1;
pub const MASK_I32: u8 = 1 << 2;
pub const MASK_U8: u8 = 1 << 3;
pub const MASK_NUMERIC: u8 = MASK_F32 | MASK_I32;
pub const MASK_ALL: u8 = MASK_NUMERIC | MASK_U8;
pub const MASK_LOGIC: u8 = MASK_U8;

/// True when `dtype` is accepted by `mask`; unknown dtypes pass so that
/// dynamic inputs defer the check to runtime.
pub fn mask_allows(mask: u8, dtype: Dtype) -> bool {
    dtype == Dtype::Unknown || mask & (1 << dtype.to_u8()) != 0
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpCategory {
    Special,
    Unary,
    Binary,
    Ternary,
    Matrix,
    Array,
}

/// How the output dtype derives from the inputs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutRule {
    SameAsS1,
    SameAsS2,
    ForceF32,
    ForceU8,
    ForceI32,
}

/// How the output shape derives from the inputs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShapeRule {
    Special,
    SameAsS1,
    Broadcast,
    MatMul,
    Transpose,
    Dot,
    Join,
    Gather,
    Reshape,
    Slice,
    Dynamic1D,
}

/// Static metadata for one operation.
pub struct OpInfo {
    pub kind: NodeKind,
    pub json_name: &'static str,
    pub opcode: Opcode,
    pub category: OpCategory,
    pub dtype_mask: u8,
    pub out_rule: OutRule,
    pub shape_rule: ShapeRule,
    pub ports: [Option<&'static str>; 3],
}

impl OpInfo {
    /// Number of declared input ports.
    pub fn arity(&self) -> usize {
        self.ports.iter().filter(|p| p.is_some()).count()
    }
}

macro_rules! opcodes {
    ($($name:ident,)*) => {
        /// Bytecode operation codes. The discriminant is the wire value.
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        #[repr(u16)]
        pub enum Opcode { $($name,)* }

        static OPCODES: &[Opcode] = &[$(Opcode::$name,)*];

        impl Opcode {
            pub fn from_u16(raw: u16) -> Option<Opcode> {
                OPCODES.get(raw as usize).copied()
            }

            pub fn to_u16(self) -> u16 {
                self as u16
            }
        }
    };
}

opcodes! {
    Noop,
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Atan2,
    Min,
    Max,
    Fma,
    Abs,
    Sin,
    Cos,
    Sqrt,
    Floor,
    Ceil,
    Not,
    WhereTrue,
    WhereFalse,
    Mix,
    Clamp,
    Step,
    SmoothStep,
    MatMul,
    Transpose,
    Inverse,
    Normalize,
    Dot,
    Length,
    Join,
    Less,
    Greater,
    Equal,
    NotEqual,
    LessEqual,
    GreaterEqual,
    And,
    Or,
    Xor,
    Range,
    Index,
    Gather,
    CumSum,
    Filter,
    Slice,
    Reshape,
    Copy,
}

macro_rules! op_table {
    ($(($kind:ident, $name:expr, $opcode:ident, $cat:ident, $mask:expr, $out:ident,
        $shape:ident, [$($port:expr),*]),)*) => {
        /// Graph-level operation kinds, one per registry row.
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        pub enum NodeKind { $($kind,)* }

        pub static OP_TABLE: &[OpInfo] = &[
            $(OpInfo {
                kind: NodeKind::$kind,
                json_name: $name,
                opcode: Opcode::$opcode,
                category: OpCategory::$cat,
                dtype_mask: $mask,
                out_rule: OutRule::$out,
                shape_rule: ShapeRule::$shape,
                ports: [$($port),*],
            },)*
        ];

        impl NodeKind {
            pub fn info(self) -> &'static OpInfo {
                &OP_TABLE[self as usize]
            }
        }
    };
}

op_table! {
    // Special nodes handled by the compiler and host.
    (Const,    "Const",        Noop,       Special, MASK_ALL,     SameAsS1, Special,   [None, None, None]),
    (Input,    "Input",        Noop,       Special, MASK_ALL,     SameAsS1, Special,   [None, None, None]),
    (Output,   "Output",       Copy,       Special, MASK_ALL,     SameAsS1, SameAsS1,  [Some("in"), None, None]),
    (Call,     "Call",         Noop,       Special, MASK_ALL,     SameAsS1, Special,   [None, None, None]),
    (Memory,   "Memory",       Noop,       Special, MASK_ALL,     SameAsS1, Special,   [Some("in"), None, None]),

    // Binary arithmetic.
    (Add,      "Add",          Add,        Binary,  MASK_NUMERIC, SameAsS1, Broadcast, [Some("a"), Some("b"), None]),
    (Sub,      "Sub",          Sub,        Binary,  MASK_NUMERIC, SameAsS1, Broadcast, [Some("a"), Some("b"), None]),
    (Mul,      "Mul",          Mul,        Binary,  MASK_NUMERIC, SameAsS1, Broadcast, [Some("a"), Some("b"), None]),
    (Div,      "Div",          Div,        Binary,  MASK_NUMERIC, SameAsS1, Broadcast, [Some("a"), Some("b"), None]),
    (Pow,      "Pow",          Pow,        Binary,  MASK_NUMERIC, SameAsS1, Broadcast, [Some("base"), Some("exp"), None]),
    (Atan2,    "Atan2",        Atan2,      Binary,  MASK_NUMERIC, SameAsS1, Broadcast, [Some("y"), Some("x"), None]),
    (Min,      "Min",          Min,        Binary,  MASK_NUMERIC, SameAsS1, Broadcast, [Some("a"), Some("b"), None]),
    (Max,      "Max",          Max,        Binary,  MASK_NUMERIC, SameAsS1, Broadcast, [Some("a"), Some("b"), None]),
    (Fma,      "Fma",          Fma,        Ternary, MASK_NUMERIC, SameAsS1, Broadcast, [Some("a"), Some("b"), Some("c")]),

    // Unary math.
    (Abs,      "Abs",          Abs,        Unary,   MASK_NUMERIC, SameAsS1, SameAsS1,  [Some("x"), None, None]),
    (Sin,      "Sin",          Sin,        Unary,   MASK_F32,     ForceF32, SameAsS1,  [Some("x"), None, None]),
    (Cos,      "Cos",          Cos,        Unary,   MASK_F32,     ForceF32, SameAsS1,  [Some("x"), None, None]),
    (Sqrt,     "Sqrt",         Sqrt,       Unary,   MASK_F32,     ForceF32, SameAsS1,  [Some("x"), None, None]),
    (Floor,    "Floor",        Floor,      Unary,   MASK_F32,     ForceF32, SameAsS1,  [Some("x"), None, None]),
    (Ceil,     "Ceil",         Ceil,       Unary,   MASK_F32,     ForceF32, SameAsS1,  [Some("x"), None, None]),
    (Not,      "Not",          Not,        Unary,   MASK_ALL,     ForceU8,  SameAsS1,  [Some("in"), None, None]),

    // Selection and interpolation.
    (Select,   "Select",       WhereTrue,  Ternary, MASK_ALL,     SameAsS2, Broadcast, [Some("cond"), Some("true"), Some("false")]),
    (Mix,      "Mix",          Mix,        Ternary, MASK_F32,     ForceF32, Broadcast, [Some("a"), Some("b"), Some("t")]),
    (Clamp,    "Clamp",        Clamp,      Ternary, MASK_NUMERIC, SameAsS1, Broadcast, [Some("x"), Some("min"), Some("max")]),
    (Step,     "Step",         Step,       Binary,  MASK_NUMERIC, SameAsS1, Broadcast, [Some("edge"), Some("x"), None]),
    (SmoothStep, "SmoothStep", SmoothStep, Binary,  MASK_F32,     ForceF32, Broadcast, [Some("edges"), Some("x"), None]),

    // Matrix.
    (MatMul,   "MatMul",       MatMul,     Matrix,  MASK_NUMERIC, SameAsS1, MatMul,    [Some("a"), Some("b"), None]),
    (Transpose, "Transpose",   Transpose,  Matrix,  MASK_ALL,     SameAsS1, Transpose, [Some("in"), None, None]),
    (Inverse,  "Inverse",      Inverse,    Matrix,  MASK_F32,     ForceF32, SameAsS1,  [Some("in"), None, None]),
    (Normalize, "Normalize",   Normalize,  Unary,   MASK_F32,     ForceF32, SameAsS1,  [Some("in"), None, None]),
    (Dot,      "Dot",          Dot,        Matrix,  MASK_NUMERIC, ForceF32, Dot,       [Some("a"), Some("b"), None]),
    (Length,   "Length",       Length,     Unary,   MASK_F32,     ForceF32, Dot,       [Some("x"), None, None]),
    (Join,     "Join",         Join,       Matrix,  MASK_ALL,     SameAsS1, Join,      [Some("a"), Some("b"), None]),

    // Comparison.
    (Less,     "Less",         Less,       Binary,  MASK_NUMERIC, ForceU8,  Broadcast, [Some("a"), Some("b"), None]),
    (Greater,  "Greater",      Greater,    Binary,  MASK_NUMERIC, ForceU8,  Broadcast, [Some("a"), Some("b"), None]),
    (Equal,    "Equal",        Equal,      Binary,  MASK_ALL,     ForceU8,  Broadcast, [Some("a"), Some("b"), None]),
    (NotEqual, "NotEqual",     NotEqual,   Binary,  MASK_ALL,     ForceU8,  Broadcast, [Some("a"), Some("b"), None]),
    (LessEqual, "LessEqual",   LessEqual,  Binary,  MASK_NUMERIC, ForceU8,  Broadcast, [Some("a"), Some("b"), None]),
    (GreaterEqual, "GreaterEqual", GreaterEqual, Binary, MASK_NUMERIC, ForceU8, Broadcast, [Some("a"), Some("b"), None]),

    // Logic.
    (And,      "And",          And,        Binary,  MASK_LOGIC,   ForceU8,  Broadcast, [Some("a"), Some("b"), None]),
    (Or,       "Or",           Or,         Binary,  MASK_LOGIC,   ForceU8,  Broadcast, [Some("a"), Some("b"), None]),
    (Xor,      "Xor",          Xor,        Binary,  MASK_LOGIC,   ForceU8,  Broadcast, [Some("a"), Some("b"), None]),

    // Array generators and transforms.
    (Range,    "Range",        Range,      Array,   MASK_NUMERIC, ForceF32, Dynamic1D, [Some("count"), None, None]),
    (Index,    "Index",        Index,      Array,   MASK_NUMERIC, ForceF32, Dynamic1D, [None, None, None]),
    (Gather,   "Gather",       Gather,     Array,   MASK_ALL,     SameAsS1, Gather,    [Some("data"), Some("indices"), None]),
    (CumSum,   "CumSum",       CumSum,     Array,   MASK_NUMERIC, SameAsS1, SameAsS1,  [Some("in"), None, None]),
    (Filter,   "Filter",       Filter,     Array,   MASK_ALL,     SameAsS1, SameAsS1,  [Some("in"), Some("mask"), None]),
    (Slice,    "Slice",        Slice,      Array,   MASK_ALL,     SameAsS1, Slice,     [Some("in"), Some("range"), None]),
    (Reshape,  "Reshape",      Reshape,    Array,   MASK_ALL,     SameAsS1, Reshape,   [Some("in"), Some("shape"), None]),
    (Copy,     "Copy",         Copy,       Special, MASK_ALL,     SameAsS1, SameAsS1,  [Some("in"), None, None]),

    // Placeholder for nodes removed by optimisation.
    (Unknown,  "",             Noop,       Special, MASK_ALL,     SameAsS1, Special,   [None, None, None]),
}

impl NodeKind {
    /// Resolves a JSON `type` string to a kind.
    pub fn from_json_name(name: &str) -> Option<NodeKind> {
        OP_TABLE
            .iter()
            .find(|op| !op.json_name.is_empty() && op.json_name == name)
            .map(|op| op.kind)
    }

    /// Resolves an input port name to its index.
    pub fn port_index(self, name: &str) -> Option<u32> {
        self.info()
            .ports
            .iter()
            .position(|p| *p == Some(name))
            .map(|i| i as u32)
    }

    pub fn is_special(self) -> bool {
        self.info().category == OpCategory::Special
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_and_enum_agree() {
        for (i, op) in OP_TABLE.iter().enumerate() {
            assert_eq!(op.kind.info().json_name, op.json_name);
            assert_eq!(op.kind as usize, i);
        }
    }

    #[test]
    fn json_names_resolve() {
        assert_eq!(NodeKind::from_json_name("Add"), Some(NodeKind::Add));
        assert_eq!(NodeKind::from_json_name("Filter"), Some(NodeKind::Filter));
        assert_eq!(NodeKind::from_json_name("Bogus"), None);
        // The optimiser placeholder is not reachable from JSON.
        assert_eq!(NodeKind::from_json_name(""), None);
    }

    #[test]
    fn port_names_resolve() {
        assert_eq!(NodeKind::Select.port_index("cond"), Some(0));
        assert_eq!(NodeKind::Select.port_index("false"), Some(2));
        assert_eq!(NodeKind::Add.port_index("b"), Some(1));
        assert_eq!(NodeKind::Add.port_index("zzz"), None);
        assert_eq!(NodeKind::Clamp.info().arity(), 3);
    }

    #[test]
    fn opcode_wire_round_trip() {
        assert_eq!(Opcode::from_u16(Opcode::MatMul.to_u16()), Some(Opcode::MatMul));
        assert_eq!(Opcode::from_u16(0), Some(Opcode::Noop));
        assert_eq!(Opcode::from_u16(0xffff), None);
    }

    #[test]
    fn masks_accept_the_right_dtypes() {
        assert!(mask_allows(MASK_NUMERIC, Dtype::F32));
        assert!(mask_allows(MASK_NUMERIC, Dtype::I32));
        assert!(!mask_allows(MASK_NUMERIC, Dtype::U8));
        assert!(mask_allows(MASK_LOGIC, Dtype::U8));
        assert!(mask_allows(MASK_F32, Dtype::Unknown));
    }
}
