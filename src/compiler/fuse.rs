//! Pass 7: instruction fusion.
//!
//! One pattern: a `Mul` whose only consumer is an `Add` folds into that
//! `Add`, which becomes an `Fma`. The dead multiply is retyped to
//! `Unknown` and its links excised, so later passes skip it.

use log::debug;

use crate::diag::Diagnostics;
use crate::ir::GraphIr;
use crate::ops::NodeKind;

pub fn run(ir: &mut GraphIr, _diag: &mut Diagnostics) {
    let use_count = ir.use_counts();
    let mut changed = false;

    for i in 0..ir.nodes.len() {
        if ir.nodes[i].kind != NodeKind::Add {
            continue;
        }
        // Try Mul on either side of the add.
        for side in 0..2u32 {
            let other = 1 - side;
            let mul = match ir.input_source(i as u32, side) {
                Some(m) => m,
                None => continue,
            };
            if ir.nodes[mul as usize].kind != NodeKind::Mul || use_count[mul as usize] != 1 {
                continue;
            }
            let have_operands = ir.input_source(mul, 0).is_some()
                && ir.input_source(mul, 1).is_some()
                && ir.input_source(i as u32, other).is_some();
            if !have_operands {
                continue;
            }

            debug!(
                "fusing '{}' * into '{}' as fma",
                ir.nodes[mul as usize].id, ir.nodes[i].id
            );
            ir.nodes[i].kind = NodeKind::Fma;

            for link in &mut ir.links {
                if link.dst == mul {
                    // Mul operands become fma ports 0/1.
                    link.dst = i as u32;
                } else if link.dst == i as u32 && link.dst_port == other {
                    // The addend moves to port 2.
                    link.dst_port = 2;
                } else if link.src == mul && link.dst == i as u32 {
                    // The mul->add edge disappears.
                    link.src = u32::max_value();
                    link.dst = u32::max_value();
                }
            }
            ir.nodes[mul as usize].kind = NodeKind::Unknown;
            changed = true;
            break;
        }
    }

    if changed {
        ir.links.retain(|l| l.src != u32::max_value());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diag::SourceLoc;
    use crate::ir::{Link, Node};

    fn node(id: &str, kind: NodeKind) -> Node {
        Node::new(id.to_string(), kind, SourceLoc::default())
    }

    fn link(src: u32, dst: u32, dst_port: u32) -> Link {
        Link {
            src,
            src_port: 0,
            src_name: None,
            dst,
            dst_port,
            dst_name: None,
        }
    }

    /// a*b + c over constants 0:a 1:b 2:c, 3:mul, 4:add.
    fn mul_add_graph() -> GraphIr {
        GraphIr {
            nodes: vec![
                node("a", NodeKind::Const),
                node("b", NodeKind::Const),
                node("c", NodeKind::Const),
                node("mul", NodeKind::Mul),
                node("add", NodeKind::Add),
            ],
            links: vec![
                link(0, 3, 0),
                link(1, 3, 1),
                link(3, 4, 0),
                link(2, 4, 1),
            ],
        }
    }

    #[test]
    fn single_use_mul_fuses_into_fma() {
        let mut ir = mul_add_graph();
        let mut diag = Diagnostics::new();
        run(&mut ir, &mut diag);
        assert_eq!(ir.nodes[4].kind, NodeKind::Fma);
        assert_eq!(ir.nodes[3].kind, NodeKind::Unknown);
        // a and b feed ports 0/1, c moved to port 2; the mul edge is gone.
        assert_eq!(ir.links.len(), 3);
        assert_eq!(ir.input_source(4, 0), Some(0));
        assert_eq!(ir.input_source(4, 1), Some(1));
        assert_eq!(ir.input_source(4, 2), Some(2));
    }

    #[test]
    fn multi_use_mul_is_left_alone() {
        let mut ir = mul_add_graph();
        // A second consumer of the mul.
        ir.nodes.push(node("out2", NodeKind::Output));
        ir.links.push(link(3, 5, 0));
        let mut diag = Diagnostics::new();
        run(&mut ir, &mut diag);
        assert_eq!(ir.nodes[4].kind, NodeKind::Add);
        assert_eq!(ir.nodes[3].kind, NodeKind::Mul);
    }

    #[test]
    fn addend_on_the_left_also_fuses() {
        let mut ir = mul_add_graph();
        // Swap the add's ports: c on 0, mul on 1.
        ir.links[2].dst_port = 1;
        ir.links[3].dst_port = 0;
        let mut diag = Diagnostics::new();
        run(&mut ir, &mut diag);
        assert_eq!(ir.nodes[4].kind, NodeKind::Fma);
        assert_eq!(ir.input_source(4, 2), Some(2));
    }
}
