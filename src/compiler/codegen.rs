//! Pass 9: bytecode emission.
//!
//! One instruction per node in execution order (`Select` expands to a
//! `WhereTrue`/`WhereFalse` pair merging into one destination), operand
//! strides resolved against the owning domain, consecutive same-domain
//! instructions grouped into tasks, and the symbol table plus tensor
//! prototypes staged for the VM. Memory nodes contribute no instruction
//! of their own; the frame ends with a copy of each next-state register
//! back into its state register.

use itertools::Itertools;
use log::{debug, warn};

use crate::diag::Diagnostics;
use crate::ir::{Domain, GraphIr, Node};
use crate::ops::{NodeKind, Opcode};
use crate::program::{
    fnv1a, Instruction, Program, Symbol, Task, TaskBinding, BINDING_READ, BINDING_WRITE,
    MAX_SYMBOL_NAME, SYMBOL_INPUT, SYMBOL_OUTPUT,
};
use crate::tensor::{linear_stride, Tensor, TypeInfo};

pub fn run(
    ir: &GraphIr,
    order: &[u32],
    register_count: u32,
    diag: &mut Diagnostics,
) -> Program {
    let mut program = Program::default();
    program.register_count = register_count;

    build_prototypes(ir, register_count, &mut program);
    build_symbols(ir, &mut program, diag);

    // Emit instructions, remembering each one's domain shape.
    let mut domains: Vec<TypeInfo> = Vec::new();
    for &n in order {
        let node = &ir.nodes[n as usize];
        match node.kind {
            NodeKind::Const | NodeKind::Call | NodeKind::Unknown | NodeKind::Memory => continue,
            // A free input is staged by the host; one wired up by an
            // inlined call is a passthrough and copies its source.
            NodeKind::Input if ir.input_source(n, 0).is_none() => continue,
            _ => {}
        }
        emit_node(ir, node, n, &mut program.instructions, &mut domains);
    }

    // Frame end: persist next-frame state into the memory registers.
    for (n, node) in ir.nodes.iter().enumerate() {
        if node.kind != NodeKind::Memory {
            continue;
        }
        if let (Some(dest), Some(src)) = (node.reg, source_reg(ir, n as u32, 0)) {
            let mut inst = Instruction::new(Opcode::Copy, dest, src, 0, 0);
            inst.strides = [1, 1, 0, 0];
            program.instructions.push(inst);
            domains.push(node.ty);
        } else {
            warn!("memory node '{}' has no writer; state will not advance", node.id);
        }
    }

    build_tasks(&mut program, &domains);

    debug!(
        "codegen: {} instructions, {} tasks, {} registers, {} symbols",
        program.instructions.len(),
        program.tasks.len(),
        program.register_count,
        program.symbols.len()
    );
    debug_assert!(program.validate().is_ok(), "codegen emitted invalid program");
    program
}

fn emit_node(
    ir: &GraphIr,
    node: &Node,
    n: u32,
    instructions: &mut Vec<Instruction>,
    domains: &mut Vec<TypeInfo>,
) {
    let dest = match node.reg {
        Some(r) => r,
        None => return,
    };
    let domain = match node.domain {
        Domain::Owner(d) => ir.nodes[d as usize].ty,
        _ => node.ty,
    };
    let dom_count = domain.element_count();

    let srcs = [
        source_reg(ir, n, 0),
        source_reg(ir, n, 1),
        source_reg(ir, n, 2),
    ];
    let stride_of = |port: u32| -> i32 {
        match ir.input_source(n, port) {
            Some(src) => linear_stride(ir.nodes[src as usize].ty.element_count(), dom_count),
            None => 0,
        }
    };
    let dest_stride = linear_stride(node.ty.element_count(), dom_count);

    match node.kind {
        NodeKind::Select => {
            // Two conditional moves merging into the destination; the VM
            // preserves register contents between them.
            let cond = srcs[0].unwrap_or(0);
            let mut a = Instruction::new(Opcode::WhereTrue, dest, cond, srcs[1].unwrap_or(0), 0);
            a.strides = [dest_stride, stride_of(0), stride_of(1), 0];
            instructions.push(a);
            domains.push(domain);

            let mut b = Instruction::new(Opcode::WhereFalse, dest, cond, srcs[2].unwrap_or(0), 0);
            b.strides = [dest_stride, stride_of(0), stride_of(2), 0];
            instructions.push(b);
            domains.push(domain);
        }
        NodeKind::Input => {
            let mut inst = Instruction::new(Opcode::Copy, dest, srcs[0].unwrap_or(0), 0, 0);
            inst.strides = [dest_stride, stride_of(0), 0, 0];
            instructions.push(inst);
            domains.push(domain);
        }
        NodeKind::Index => {
            // The coordinate axis travels as an immediate in the spare
            // slot, keeping every operand field a real register index.
            let mut inst = Instruction::new(Opcode::Index, dest, 0, 0, 0);
            inst.padding = node.axis as u16;
            inst.strides = [dest_stride, 0, 0, 0];
            instructions.push(inst);
            domains.push(domain);
        }
        _ => {
            let opcode = node.kind.info().opcode;
            let mut inst = Instruction::new(
                opcode,
                dest,
                srcs[0].unwrap_or(0),
                srcs[1].unwrap_or(0),
                srcs[2].unwrap_or(0),
            );
            inst.strides = [dest_stride, stride_of(0), stride_of(1), stride_of(2)];
            instructions.push(inst);
            domains.push(domain);
        }
    }
}

fn build_prototypes(ir: &GraphIr, register_count: u32, program: &mut Program) {
    program.prototypes = vec![Tensor::default(); register_count as usize];

    // Placeholders first, so constants win when a register is later
    // reused by an intermediate.
    for node in &ir.nodes {
        if let Some(reg) = node.reg {
            if node.constant.is_none() {
                program.prototypes[reg as usize] = Tensor::empty(node.ty);
            }
        }
    }
    for node in &ir.nodes {
        if let (Some(reg), Some(constant)) = (node.reg, &node.constant) {
            let mut proto = constant.clone();
            if proto.info.dtype == node.ty.dtype {
                proto.info = node.ty;
            }
            program.prototypes[reg as usize] = proto;
        }
    }
}

fn build_symbols(ir: &GraphIr, program: &mut Program, diag: &mut Diagnostics) {
    for node in &ir.nodes {
        let flags = match node.kind {
            NodeKind::Input => SYMBOL_INPUT,
            NodeKind::Output => SYMBOL_OUTPUT,
            NodeKind::Memory => SYMBOL_INPUT | SYMBOL_OUTPUT,
            _ => continue,
        };
        let reg = match node.reg {
            Some(r) => r,
            None => continue,
        };
        // The cartridge format stores names NUL-terminated in 64 bytes.
        let mut name = node.id.clone();
        if name.len() >= MAX_SYMBOL_NAME {
            diag.warn(
                crate::diag::DiagKind::UnresolvedReference,
                Some(node.loc.clone()),
                format!("symbol '{}' truncated to {} bytes", name, MAX_SYMBOL_NAME - 1),
            );
            let mut cut = MAX_SYMBOL_NAME - 1;
            while !name.is_char_boundary(cut) {
                cut -= 1;
            }
            name.truncate(cut);
        }
        program.symbols.push(Symbol {
            name,
            register: u32::from(reg),
            flags,
            related_name_hash: 0,
        });
    }

    // Pair `<stem>_in` inputs with `<stem>_out` outputs for auto-resize.
    let outputs = program
        .symbols
        .iter()
        .filter(|s| s.is_output())
        .map(|s| s.name.clone())
        .collect_vec();
    for sym in &mut program.symbols {
        if !sym.is_input() || !sym.name.ends_with("_in") {
            continue;
        }
        let stem = &sym.name[..sym.name.len() - 3];
        let candidate = format!("{}_out", stem);
        if outputs.iter().any(|o| *o == candidate) {
            sym.related_name_hash = fnv1a(&candidate);
        }
    }
}

/// Groups consecutive instructions iterating the same domain shape.
fn build_tasks(program: &mut Program, domains: &[TypeInfo]) {
    let mut start = 0usize;
    while start < domains.len() {
        let mut end = start + 1;
        while end < domains.len() && domains[end].same_shape(&domains[start]) {
            end += 1;
        }
        let task_idx = program.tasks.len() as u32;
        program.tasks.push(Task {
            first: start as u32,
            count: (end - start) as u32,
            domain: domains[start],
        });

        // Register bindings of the task, reads and writes deduplicated.
        let mut bindings: Vec<TaskBinding> = Vec::new();
        for inst in &program.instructions[start..end] {
            note_binding(&mut bindings, task_idx, inst.dest, BINDING_WRITE);
            for &src in &[inst.src1, inst.src2, inst.src3] {
                note_binding(&mut bindings, task_idx, src, BINDING_READ);
            }
        }
        program.bindings.extend(bindings);
        start = end;
    }
}

fn note_binding(bindings: &mut Vec<TaskBinding>, task: u32, register: u16, flag: u8) {
    let register = u32::from(register);
    match bindings.iter_mut().find(|b| b.register == register) {
        Some(b) => b.flags |= flag,
        None => bindings.push(TaskBinding {
            task,
            register,
            flags: flag,
        }),
    }
}

fn source_reg(ir: &GraphIr, node: u32, port: u32) -> Option<u16> {
    ir.input_source(node, port)
        .and_then(|src| ir.nodes[src as usize].reg)
}
