//! The virtual machine: a register file staged from a program's tensor
//! prototypes and a dispatch loop over its tasks.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use log::debug;

use crate::backend::{Backend, DomainCoords, ExecCtx, ExecError};
use crate::program::Program;
use crate::tensor::Tensor;

/// Register access intent; a hook point for backends that stage uploads.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    Write,
}

pub struct Vm {
    program: Arc<Program>,
    registers: Vec<Tensor>,
    /// Shared kill switch: any worker storing a non-zero code aborts the
    /// whole batch.
    error: Arc<AtomicU32>,
    pub coords: DomainCoords,
}

impl Vm {
    pub fn new(program: Arc<Program>) -> Self {
        Vm::with_error_word(program, Arc::new(AtomicU32::new(0)))
    }

    /// A VM whose error word is shared with other workers of a batch.
    pub fn with_error_word(program: Arc<Program>, error: Arc<AtomicU32>) -> Self {
        let mut vm = Vm {
            program,
            registers: Vec::new(),
            error,
            coords: DomainCoords::default(),
        };
        vm.reset();
        vm
    }

    pub fn program(&self) -> &Arc<Program> {
        &self.program
    }

    /// Re-stages every register from its prototype: constants are
    /// deep-copied, intermediates become zero-sized placeholders.
    pub fn reset(&mut self) {
        self.registers.clear();
        self.registers.extend(self.program.prototypes.iter().cloned());
        debug!("vm reset: {} registers staged", self.registers.len());
    }

    /// Executes all tasks in program order. Stops at the first error
    /// observed in the shared error word, including errors raised by
    /// other workers.
    pub fn exec(&mut self, backend: &dyn Backend) -> Result<(), ExecError> {
        let program = Arc::clone(&self.program);
        let mut ctx = ExecCtx::new(&mut self.registers, &self.error);
        ctx.coords = self.coords;

        for task in &program.tasks {
            ctx.batch = task.domain.element_count();
            let first = task.first as usize;
            let end = first + task.count as usize;
            for inst in &program.instructions[first..end] {
                backend.exec(&mut ctx, inst);
                let code = ctx.error_code();
                if code != 0 {
                    return Err(ExecError::from_code(code).unwrap_or(ExecError::Runtime));
                }
            }
        }
        Ok(())
    }

    pub fn error_code(&self) -> u32 {
        self.error.load(Ordering::SeqCst)
    }

    /// Clears a sticky error so the next frame can run.
    pub fn clear_error(&self) {
        self.error.store(0, Ordering::SeqCst);
    }

    pub fn register_count(&self) -> usize {
        self.registers.len()
    }

    pub fn map_tensor(&mut self, idx: u32, _mode: AccessMode) -> Option<&mut Tensor> {
        self.registers.get_mut(idx as usize)
    }

    pub fn tensor(&self, idx: u32) -> Option<&Tensor> {
        self.registers.get(idx as usize)
    }

    /// Linear scan of the symbol table.
    pub fn find_register(&self, name: &str) -> Option<u32> {
        self.program.find_symbol(name).map(|s| s.register)
    }
}
