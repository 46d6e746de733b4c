//! Pass 8: liveness-driven register allocation.
//!
//! Walks the execution order computing each node's last use, then assigns
//! registers from a free list, reusing a slot once its previous owner's
//! live range has ended and the dtype plus byte capacity are compatible.
//! Symbol-named nodes (inputs, outputs, memory state) and constants are
//! pinned for the whole program; the producer feeding a memory node stays
//! live until the end-of-frame copy.
//!
//! A source register is never released before the instruction consuming
//! it, so an instruction's destination can never alias its sources.

use log::debug;

use crate::diag::{DiagKind, Diagnostics};
use crate::ir::GraphIr;
use crate::ops::NodeKind;

pub fn run(ir: &mut GraphIr, order: &[u32], diag: &mut Diagnostics) -> u32 {
    let node_count = ir.nodes.len();
    let mut pos = vec![usize::max_value(); node_count];
    for (p, &n) in order.iter().enumerate() {
        pos[n as usize] = p;
    }

    // Last use per node, in execution-order positions. A node with no
    // consumers dies right after its own instruction.
    let mut last_use: Vec<usize> = pos.clone();
    for link in &ir.links {
        let src = link.src as usize;
        let dst = link.dst as usize;
        if ir.nodes[dst].kind == NodeKind::Memory {
            // Next-frame state is copied at the end of the frame.
            last_use[src] = order.len();
        } else if pos[dst] != usize::max_value() {
            last_use[src] = last_use[src].max(pos[dst]);
        }
    }

    // Symbols stay addressable for the whole run, and constants must
    // survive frames: the VM only re-stages prototypes on reset, which a
    // persistent script never performs between frames.
    let pinned: Vec<bool> = ir
        .nodes
        .iter()
        .map(|n| {
            n.constant.is_some()
                || matches!(
                    n.kind,
                    NodeKind::Input | NodeKind::Output | NodeKind::Memory
                )
        })
        .collect();

    // Nodes whose range ends at position p.
    let mut expiring: Vec<Vec<u32>> = vec![Vec::new(); order.len() + 1];
    for (n, &end) in last_use.iter().enumerate() {
        if end <= order.len() {
            expiring[end.min(order.len())].push(n as u32);
        }
    }

    let mut free: Vec<(u16, crate::tensor::Dtype, usize)> = Vec::new();
    let mut next_reg: u32 = 0;

    for (p, &n) in order.iter().enumerate() {
        let node = &ir.nodes[n as usize];
        if node.kind != NodeKind::Unknown && node.kind != NodeKind::Call {
            let need = node.ty.byte_len();
            let dtype = node.ty.dtype;
            let slot = free
                .iter()
                .position(|(_, d, cap)| *d == dtype && *cap >= need);
            let reg = match slot {
                Some(i) => {
                    let (reg, _, _) = free.remove(i);
                    debug!("register {} reused for '{}'", reg, node.id);
                    reg
                }
                None => {
                    if next_reg > u32::from(u16::max_value()) {
                        diag.error(
                            DiagKind::ShapeMismatch,
                            Some(node.loc.clone()),
                            "register file exhausted (more than 65536 live values)",
                        );
                        return next_reg;
                    }
                    let reg = next_reg as u16;
                    next_reg += 1;
                    reg
                }
            };
            ir.nodes[n as usize].reg = Some(reg);
        }

        // Release ranges that end at this instruction, after its own
        // destination was assigned.
        for &dead in &expiring[p] {
            if pinned[dead as usize] {
                continue;
            }
            if let Some(reg) = ir.nodes[dead as usize].reg {
                let ty = ir.nodes[dead as usize].ty;
                free.push((reg, ty.dtype, ty.byte_len()));
            }
        }
    }

    next_reg
}

#[cfg(test)]
mod tests {
    use super::super::{analyze, domain, json, lower, topo};
    use super::*;

    fn allocate(source: &str) -> (GraphIr, Vec<u32>, u32) {
        let mut diag = Diagnostics::new();
        let ast = json::parse(source, "test.json", &mut diag).unwrap();
        let mut ir = lower::run(&ast, "test.json", &mut diag);
        let order = topo::sort(&ir, &mut diag).unwrap();
        analyze::run(&mut ir, &order, &mut diag);
        domain::run(&mut ir);
        assert!(!diag.has_errors());
        let count = run(&mut ir, &order, &mut diag);
        assert!(!diag.has_errors());
        (ir, order, count)
    }

    /// A chain of unary ops: intermediates can share one register.
    const CHAIN: &str = r#"{ "nodes": [
        {"id": "x", "type": "Const", "data": {"value": [1, 2, 3]}},
        {"id": "a", "type": "Abs"},
        {"id": "b", "type": "Floor"},
        {"id": "c", "type": "Ceil"},
        {"id": "o", "type": "Output"} ],
      "links": [
        {"src": "x", "dst": "a", "dst_port": "x"},
        {"src": "a", "dst": "b", "dst_port": "x"},
        {"src": "b", "dst": "c", "dst_port": "x"},
        {"src": "c", "dst": "o", "dst_port": "in"} ] }"#;

    #[test]
    fn dead_intermediates_share_registers() {
        let (ir, _, count) = allocate(CHAIN);
        // x, one shared intermediate slot, and the pinned output.
        assert!(count <= 4, "expected register reuse, got {}", count);
        let a = ir.nodes.iter().find(|n| n.id == "a").unwrap().reg;
        let c = ir.nodes.iter().find(|n| n.id == "c").unwrap().reg;
        assert_eq!(a, c, "a is dead by the time c executes");
    }

    #[test]
    fn live_ranges_assigned_to_one_register_never_overlap() {
        let (ir, order, _) = allocate(CHAIN);
        let mut pos = vec![0; ir.nodes.len()];
        for (p, &n) in order.iter().enumerate() {
            pos[n as usize] = p;
        }
        let mut last = vec![0usize; ir.nodes.len()];
        for (i, _) in ir.nodes.iter().enumerate() {
            last[i] = pos[i];
        }
        for l in &ir.links {
            last[l.src as usize] = last[l.src as usize].max(pos[l.dst as usize]);
        }
        for (i, a) in ir.nodes.iter().enumerate() {
            for (j, b) in ir.nodes.iter().enumerate() {
                if i >= j || a.reg.is_none() || a.reg != b.reg {
                    continue;
                }
                let (s1, e1) = (pos[i], last[i]);
                let (s2, e2) = (pos[j], last[j]);
                assert!(
                    e1 < s2 || e2 < s1,
                    "nodes '{}' and '{}' share a register with overlapping ranges",
                    a.id,
                    b.id
                );
            }
        }
    }

    #[test]
    fn sources_are_not_reused_as_destination_of_the_same_instruction() {
        let (ir, _, _) = allocate(
            r#"{ "nodes": [
                 {"id": "x", "type": "Const", "data": {"value": [1, 2]}},
                 {"id": "y", "type": "Const", "data": {"value": [3, 4]}},
                 {"id": "sum", "type": "Add"},
                 {"id": "o", "type": "Output"} ],
               "links": [
                 {"src": "x", "dst": "sum", "dst_port": "a"},
                 {"src": "y", "dst": "sum", "dst_port": "b"},
                 {"src": "sum", "dst": "o", "dst_port": "in"} ] }"#,
        );
        let x = ir.nodes.iter().find(|n| n.id == "x").unwrap().reg;
        let y = ir.nodes.iter().find(|n| n.id == "y").unwrap().reg;
        let sum = ir.nodes.iter().find(|n| n.id == "sum").unwrap().reg;
        assert_ne!(sum, x);
        assert_ne!(sum, y);
    }

    #[test]
    fn memory_producer_stays_live_to_frame_end() {
        let (ir, _, _) = allocate(
            r#"{ "nodes": [
                 {"id": "state", "type": "Memory", "data": {"init": 0}},
                 {"id": "one", "type": "Const", "data": {"value": 1}},
                 {"id": "next", "type": "Add"},
                 {"id": "o", "type": "Output"} ],
               "links": [
                 {"src": "state", "dst": "next", "dst_port": "a"},
                 {"src": "one", "dst": "next", "dst_port": "b"},
                 {"src": "next", "dst": "state", "dst_port": "in"},
                 {"src": "next", "dst": "o", "dst_port": "in"} ] }"#,
        );
        let state = ir.nodes.iter().find(|n| n.id == "state").unwrap().reg;
        let next = ir.nodes.iter().find(|n| n.id == "next").unwrap().reg;
        assert!(state.is_some() && next.is_some());
        assert_ne!(state, next);
    }
}
