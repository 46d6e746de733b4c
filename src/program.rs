//! Compiled program images: fixed-size instructions, the symbol table,
//! tasks and tensor prototypes.

use crate::ops::Opcode;
use crate::tensor::{Tensor, TypeInfo};

/// Symbol visible to the host as a readable input.
pub const SYMBOL_INPUT: u8 = 1 << 0;
/// Symbol visible to the host as a writable output.
pub const SYMBOL_OUTPUT: u8 = 1 << 1;

/// A task binding reads the register.
pub const BINDING_READ: u8 = 1 << 0;
/// A task binding writes the register.
pub const BINDING_WRITE: u8 = 1 << 1;

/// Longest symbol name stored in a cartridge.
pub const MAX_SYMBOL_NAME: usize = 64;

/// FNV-1a over a name, the hash used for symbol and resource pairing.
pub fn fnv1a(name: &str) -> u32 {
    let mut hash: u32 = 2_166_136_261;
    for byte in name.bytes() {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(16_777_619);
    }
    hash
}

/// One bytecode instruction: three-address form plus the element stride of
/// each operand over the task's iteration domain (0 broadcast, 1
/// sequential, k packed channels).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Instruction {
    pub opcode: Opcode,
    pub dest: u16,
    pub src1: u16,
    pub src2: u16,
    pub src3: u16,
    pub padding: u16,
    pub strides: [i32; 4],
}

impl Instruction {
    pub fn new(opcode: Opcode, dest: u16, src1: u16, src2: u16, src3: u16) -> Self {
        Instruction {
            opcode,
            dest,
            src1,
            src2,
            src3,
            padding: 0,
            strides: [1, 1, 1, 1],
        }
    }
}

/// Name → register mapping with host-visible IO flags.
#[derive(Clone, Debug, PartialEq)]
pub struct Symbol {
    pub name: String,
    pub register: u32,
    pub flags: u8,
    /// FNV-1a hash of the paired port name for input/output auto-resize
    /// (`u_State_in` ↔ `u_State_out`); zero when unpaired.
    pub related_name_hash: u32,
}

impl Symbol {
    pub fn is_input(&self) -> bool {
        self.flags & SYMBOL_INPUT != 0
    }

    pub fn is_output(&self) -> bool {
        self.flags & SYMBOL_OUTPUT != 0
    }
}

/// A contiguous instruction range iterating one domain shape.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Task {
    pub first: u32,
    pub count: u32,
    pub domain: TypeInfo,
}

/// Registers a task consumes or produces.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TaskBinding {
    pub task: u32,
    pub register: u32,
    pub flags: u8,
}

/// A compiled program: bytecode plus everything the VM needs to stage its
/// register file.
#[derive(Clone, Debug, Default)]
pub struct Program {
    pub instructions: Vec<Instruction>,
    pub symbols: Vec<Symbol>,
    pub tasks: Vec<Task>,
    pub bindings: Vec<TaskBinding>,
    /// One prototype per register: constants carry data, intermediates are
    /// zero-sized placeholders with their inferred layout.
    pub prototypes: Vec<Tensor>,
    pub register_count: u32,
}

impl Default for Task {
    fn default() -> Self {
        Task {
            first: 0,
            count: 0,
            domain: TypeInfo::default(),
        }
    }
}

impl Program {
    pub fn find_symbol(&self, name: &str) -> Option<&Symbol> {
        self.symbols.iter().find(|s| s.name == name)
    }

    /// Checks that every operand index of every instruction addresses a
    /// real register and every task range stays inside the code.
    pub fn validate(&self) -> Result<(), String> {
        let count = self.register_count;
        for (i, inst) in self.instructions.iter().enumerate() {
            for &idx in &[inst.dest, inst.src1, inst.src2, inst.src3] {
                if u32::from(idx) >= count {
                    return Err(format!(
                        "instruction {} addresses register {} of {}",
                        i, idx, count
                    ));
                }
            }
        }
        for task in &self.tasks {
            if task.first + task.count > self.instructions.len() as u32 {
                return Err(format!(
                    "task range {}..{} exceeds {} instructions",
                    task.first,
                    task.first + task.count,
                    self.instructions.len()
                ));
            }
        }
        Ok(())
    }
}
