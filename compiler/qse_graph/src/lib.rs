// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Lowers each function of a parsed module to an execution graph: the CFG
//! over its basic blocks annotated with the facts the projection engine
//! needs — topological order, loop headers (back-edge targets), immediate
//! dominators, and the phi groupings at each block entry.

#![warn(clippy::mod_module_files, clippy::pedantic, clippy::unwrap_used)]

#[cfg(test)]
mod tests;

mod build;
mod debug;

use miette::Diagnostic;
use qse_llvm::{Module, Name};
use rustc_hash::FxHashMap;
use std::rc::Rc;
use thiserror::Error;

#[derive(Debug, Diagnostic, Error)]
pub enum Error {
    #[error("branch to unknown label {label} in function @{function}")]
    #[diagnostic(code("Qse.Graph.UnknownLabel"))]
    UnknownLabel { function: String, label: String },

    #[error("phi after non-phi instruction in block {block} of function @{function}")]
    #[diagnostic(code("Qse.Graph.MisplacedPhi"))]
    MisplacedPhi { function: String, block: String },

    #[error("phi in block {block} of function @{function} names {label}, which is not a predecessor")]
    #[diagnostic(code("Qse.Graph.PhiPredecessor"))]
    PhiPredecessor {
        function: String,
        block: String,
        label: String,
    },
}

/// Execution graphs for every defined function in a module.
#[derive(Debug)]
pub struct ModuleGraphs {
    graphs: Vec<FunctionGraph>,
    index: FxHashMap<Rc<str>, usize>,
}

impl ModuleGraphs {
    #[must_use]
    pub fn get(&self, function: &str) -> Option<&FunctionGraph> {
        self.index.get(function).map(|i| &self.graphs[*i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &FunctionGraph> {
        self.graphs.iter()
    }
}

/// The execution graph of one function.
#[derive(Debug)]
pub struct FunctionGraph {
    pub function: Rc<str>,
    pub blocks: Vec<BlockInfo>,
    /// Block name to index in `blocks` (which parallels the function's
    /// block list).
    pub block_index: FxHashMap<Name, usize>,
    /// Reverse postorder over the blocks reachable from entry.
    pub topo_order: Vec<usize>,
}

/// Per-block graph facts.
#[derive(Debug)]
pub struct BlockInfo {
    pub name: Name,
    pub successors: Vec<usize>,
    pub predecessors: Vec<usize>,
    /// Target of at least one back edge.
    pub loop_header: bool,
    /// Immediate dominator; `None` for the entry block and unreachable
    /// blocks.
    pub dominator: Option<usize>,
    /// Destination names of the phi group at block entry, in order.
    pub phis: Vec<Name>,
}

/// Builds execution graphs for all defined functions.
///
/// When `trace` is set, each graph is rendered to the `qse::graph` log
/// target as it is built.
///
/// # Errors
/// Fails when a branch names an unknown label or a phi group is malformed.
pub fn build(module: &Module, trace: bool) -> Result<ModuleGraphs, Error> {
    let mut graphs = Vec::with_capacity(module.functions.len());
    let mut index = FxHashMap::default();
    for function in &module.functions {
        let graph = build::function_graph(function)?;
        if trace {
            log::info!(target: "qse::graph", "{graph}");
        }
        index.insert(function.name.clone(), graphs.len());
        graphs.push(graph);
    }
    Ok(ModuleGraphs { graphs, index })
}
