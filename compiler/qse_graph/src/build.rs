// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::{BlockInfo, Error, FunctionGraph};
use qse_llvm::{Function, Instruction, Name, Terminator};
use rustc_hash::FxHashMap;

pub(crate) fn function_graph(function: &Function) -> Result<FunctionGraph, Error> {
    let mut block_index = FxHashMap::default();
    for (i, block) in function.blocks.iter().enumerate() {
        block_index.insert(block.name.clone(), i);
    }

    let resolve = |label: &Name| -> Result<usize, Error> {
        block_index
            .get(label)
            .copied()
            .ok_or_else(|| Error::UnknownLabel {
                function: function.name.to_string(),
                label: label.to_string(),
            })
    };

    let mut blocks = Vec::with_capacity(function.blocks.len());
    for block in &function.blocks {
        let successors = match &block.terminator {
            Terminator::Br { dest } => vec![resolve(dest)?],
            Terminator::CondBr {
                if_true, if_false, ..
            } => vec![resolve(if_true)?, resolve(if_false)?],
            Terminator::Ret(_) | Terminator::Unreachable => Vec::new(),
        };
        blocks.push(BlockInfo {
            name: block.name.clone(),
            successors,
            predecessors: Vec::new(),
            loop_header: false,
            dominator: None,
            phis: phi_group(function, block)?,
        });
    }

    for i in 0..blocks.len() {
        for j in 0..blocks[i].successors.len() {
            let succ = blocks[i].successors[j];
            blocks[succ].predecessors.push(i);
        }
    }
    for block in &mut blocks {
        block.predecessors.sort_unstable();
        block.predecessors.dedup();
    }

    let topo_order = depth_first(&mut blocks);
    compute_dominators(&mut blocks, &topo_order);
    check_phi_predecessors(function, &blocks, &block_index)?;

    Ok(FunctionGraph {
        function: function.name.clone(),
        blocks,
        block_index,
        topo_order,
    })
}

fn phi_group(
    function: &Function,
    block: &qse_llvm::BasicBlock,
) -> Result<Vec<Name>, Error> {
    let mut phis = Vec::new();
    let mut seen_non_phi = false;
    for instruction in &block.instructions {
        if let Instruction::Phi { dest, .. } = instruction {
            if seen_non_phi {
                return Err(Error::MisplacedPhi {
                    function: function.name.to_string(),
                    block: block.name.to_string(),
                });
            }
            phis.push(dest.clone());
        } else {
            seen_non_phi = true;
        }
    }
    Ok(phis)
}

fn check_phi_predecessors(
    function: &Function,
    blocks: &[BlockInfo],
    block_index: &FxHashMap<Name, usize>,
) -> Result<(), Error> {
    for (i, block) in function.blocks.iter().enumerate() {
        for instruction in &block.instructions {
            let Instruction::Phi { incoming, .. } = instruction else {
                continue;
            };
            for (_, label) in incoming {
                let pred = block_index.get(label).copied();
                if !pred.is_some_and(|p| blocks[i].predecessors.contains(&p)) {
                    return Err(Error::PhiPredecessor {
                        function: function.name.to_string(),
                        block: block.name.to_string(),
                        label: label.to_string(),
                    });
                }
            }
        }
    }
    Ok(())
}

/// Iterative depth-first walk from the entry block. Marks back-edge targets
/// as loop headers (gray-set detection) and returns the reverse postorder.
fn depth_first(blocks: &mut [BlockInfo]) -> Vec<usize> {
    #[derive(Clone, Copy, PartialEq)]
    enum Color {
        White,
        Gray,
        Black,
    }

    let mut color = vec![Color::White; blocks.len()];
    let mut postorder = Vec::new();
    // Stack frames carry the next successor edge to explore.
    let mut stack = vec![(0usize, 0usize)];
    color[0] = Color::Gray;

    while let Some((block, edge)) = stack.pop() {
        if edge < blocks[block].successors.len() {
            stack.push((block, edge + 1));
            let succ = blocks[block].successors[edge];
            match color[succ] {
                Color::White => {
                    color[succ] = Color::Gray;
                    stack.push((succ, 0));
                }
                Color::Gray => blocks[succ].loop_header = true,
                Color::Black => {}
            }
        } else {
            color[block] = Color::Black;
            postorder.push(block);
        }
    }

    postorder.reverse();
    postorder
}

/// Immediate dominators by iteration to a fixed point over the reverse
/// postorder.
fn compute_dominators(blocks: &mut [BlockInfo], topo_order: &[usize]) {
    if topo_order.is_empty() {
        return;
    }
    let entry = topo_order[0];
    let mut order_of = vec![usize::MAX; blocks.len()];
    for (pos, &block) in topo_order.iter().enumerate() {
        order_of[block] = pos;
    }

    let mut idom = vec![None; blocks.len()];
    idom[entry] = Some(entry);

    let intersect = |idom: &[Option<usize>], mut a: usize, mut b: usize| {
        while a != b {
            while order_of[a] > order_of[b] {
                a = idom[a].expect("processed block should have a dominator");
            }
            while order_of[b] > order_of[a] {
                b = idom[b].expect("processed block should have a dominator");
            }
        }
        a
    };

    let mut changed = true;
    while changed {
        changed = false;
        for &block in topo_order.iter().skip(1) {
            let mut new_idom = None;
            for &pred in &blocks[block].predecessors {
                if idom[pred].is_none() {
                    continue;
                }
                new_idom = Some(match new_idom {
                    None => pred,
                    Some(current) => intersect(&idom, pred, current),
                });
            }
            if new_idom.is_some() && idom[block] != new_idom {
                idom[block] = new_idom;
                changed = true;
            }
        }
    }

    for (block, info) in blocks.iter_mut().enumerate() {
        info.dominator = if block == entry { None } else { idom[block] };
    }
}
