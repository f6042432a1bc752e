// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::FunctionGraph;
use std::fmt::{self, Display, Formatter, Write};

impl Display for FunctionGraph {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        writeln!(f, "graph @{}:", self.function)?;
        for &i in &self.topo_order {
            let block = &self.blocks[i];
            let mut line = format!("  {}:", block.name);
            if block.loop_header {
                line.push_str(" loop-header");
            }
            if let Some(dom) = block.dominator {
                let _ = write!(line, " dom={}", self.blocks[dom].name);
            }
            if !block.phis.is_empty() {
                let _ = write!(line, " phis={}", block.phis.len());
            }
            if !block.successors.is_empty() {
                line.push_str(" ->");
                for &succ in &block.successors {
                    let _ = write!(line, " {}", self.blocks[succ].name);
                }
            }
            writeln!(f, "{line}")?;
        }
        Ok(())
    }
}
