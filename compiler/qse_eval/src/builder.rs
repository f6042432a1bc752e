// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The quantum builder proxy: accumulates primitive gate operations until a
//! measurement must be observed, then replays them into the builder the
//! backend supplied.

use crate::backend::Builder;
use rustc_hash::FxHashMap;
use std::fmt::{self, Display, Formatter};

/// A primitive gate operation. Rotation angles are radians.
#[derive(Clone, Debug, PartialEq)]
pub enum GateOp {
    X { qubit: usize, theta: f64 },
    Y { qubit: usize, theta: f64 },
    Z { qubit: usize, theta: f64 },
    CX { controls: Vec<usize>, target: usize, theta: f64 },
    CY { controls: Vec<usize>, target: usize, theta: f64 },
    CZ { controls: Vec<usize>, target: usize, theta: f64 },
    Swap { a: usize, b: usize },
    Reset { qubit: usize },
    Measure { qubit: usize },
}

impl GateOp {
    /// The qubits this operation touches.
    pub fn touches(&self, out: &mut Vec<usize>) {
        match self {
            GateOp::X { qubit, .. }
            | GateOp::Y { qubit, .. }
            | GateOp::Z { qubit, .. }
            | GateOp::Reset { qubit }
            | GateOp::Measure { qubit } => out.push(*qubit),
            GateOp::CX {
                controls, target, ..
            }
            | GateOp::CY {
                controls, target, ..
            }
            | GateOp::CZ {
                controls, target, ..
            } => {
                out.extend_from_slice(controls);
                out.push(*target);
            }
            GateOp::Swap { a, b } => {
                out.push(*a);
                out.push(*b);
            }
        }
    }

    /// Replays the operation into a backend builder.
    pub fn apply(&self, builder: &mut dyn Builder) {
        match self {
            GateOp::X { qubit, theta } => builder.x(*qubit, *theta),
            GateOp::Y { qubit, theta } => builder.y(*qubit, *theta),
            GateOp::Z { qubit, theta } => builder.z(*qubit, *theta),
            GateOp::CX {
                controls,
                target,
                theta,
            } => builder.cx(controls, *target, *theta),
            GateOp::CY {
                controls,
                target,
                theta,
            } => builder.cy(controls, *target, *theta),
            GateOp::CZ {
                controls,
                target,
                theta,
            } => builder.cz(controls, *target, *theta),
            GateOp::Swap { a, b } => builder.swap(*a, *b),
            GateOp::Reset { qubit } => builder.reset(*qubit),
            GateOp::Measure { qubit } => builder.measure(*qubit),
        }
    }
}

impl Display for GateOp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            GateOp::X { qubit, theta } => write!(f, "x {qubit} {theta}"),
            GateOp::Y { qubit, theta } => write!(f, "y {qubit} {theta}"),
            GateOp::Z { qubit, theta } => write!(f, "z {qubit} {theta}"),
            GateOp::CX {
                controls,
                target,
                theta,
            } => write!(f, "cx {controls:?} {target} {theta}"),
            GateOp::CY {
                controls,
                target,
                theta,
            } => write!(f, "cy {controls:?} {target} {theta}"),
            GateOp::CZ {
                controls,
                target,
                theta,
            } => write!(f, "cz {controls:?} {target} {theta}"),
            GateOp::Swap { a, b } => write!(f, "swap {a} {b}"),
            GateOp::Reset { qubit } => write!(f, "reset {qubit}"),
            GateOp::Measure { qubit } => write!(f, "measure {qubit}"),
        }
    }
}

/// The pending gate buffer.
///
/// Same-axis single-qubit rotations on a qubit merge into one angle as long
/// as no other operation touched that qubit in between. Measurements are
/// assigned classical bit positions in arrival order since the last clear.
#[derive(Debug, Default)]
pub struct BuilderProxy {
    ops: Vec<GateOp>,
    last_touch: FxHashMap<usize, usize>,
    measured: usize,
    clears: u64,
    scratch: Vec<usize>,
}

impl BuilderProxy {
    fn push(&mut self, op: GateOp) {
        self.scratch.clear();
        let mut touched = std::mem::take(&mut self.scratch);
        op.touches(&mut touched);
        let index = self.ops.len();
        for &qubit in &touched {
            self.last_touch.insert(qubit, index);
        }
        self.scratch = touched;
        self.ops.push(op);
    }

    fn push_rotation(&mut self, op: GateOp) {
        let (qubit, theta) = match &op {
            GateOp::X { qubit, theta }
            | GateOp::Y { qubit, theta }
            | GateOp::Z { qubit, theta } => (*qubit, *theta),
            _ => unreachable!("push_rotation requires a single-qubit rotation"),
        };
        if let Some(&index) = self.last_touch.get(&qubit) {
            let merged = match (&mut self.ops[index], &op) {
                (GateOp::X { theta: prev, .. }, GateOp::X { .. })
                | (GateOp::Y { theta: prev, .. }, GateOp::Y { .. })
                | (GateOp::Z { theta: prev, .. }, GateOp::Z { .. }) => {
                    *prev += theta;
                    true
                }
                _ => false,
            };
            if merged {
                return;
            }
        }
        self.push(op);
    }

    pub fn x(&mut self, qubit: usize, theta: f64) {
        self.push_rotation(GateOp::X { qubit, theta });
    }

    pub fn y(&mut self, qubit: usize, theta: f64) {
        self.push_rotation(GateOp::Y { qubit, theta });
    }

    pub fn z(&mut self, qubit: usize, theta: f64) {
        self.push_rotation(GateOp::Z { qubit, theta });
    }

    pub fn cx(&mut self, controls: Vec<usize>, target: usize, theta: f64) {
        self.push(GateOp::CX {
            controls,
            target,
            theta,
        });
    }

    pub fn cy(&mut self, controls: Vec<usize>, target: usize, theta: f64) {
        self.push(GateOp::CY {
            controls,
            target,
            theta,
        });
    }

    pub fn cz(&mut self, controls: Vec<usize>, target: usize, theta: f64) {
        self.push(GateOp::CZ {
            controls,
            target,
            theta,
        });
    }

    pub fn swap(&mut self, a: usize, b: usize) {
        self.push(GateOp::Swap { a, b });
    }

    pub fn reset(&mut self, qubit: usize) {
        self.push(GateOp::Reset { qubit });
    }

    /// Appends a measurement and returns its classical bit position.
    pub fn measure(&mut self, qubit: usize) -> usize {
        let position = self.measured;
        self.measured += 1;
        self.push(GateOp::Measure { qubit });
        position
    }

    pub fn clear(&mut self) {
        self.ops.clear();
        self.last_touch.clear();
        self.measured = 0;
        self.clears += 1;
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    #[must_use]
    pub fn ops(&self) -> &[GateOp] {
        &self.ops
    }

    /// Number of measurements in the buffer.
    #[must_use]
    pub fn measured(&self) -> usize {
        self.measured
    }

    /// How often the buffer was cleared, used to gate projection-cache
    /// recording.
    #[must_use]
    pub fn clears(&self) -> u64 {
        self.clears
    }

    /// Appends previously recorded operations (projection-cache replay).
    pub fn extend(&mut self, ops: &[GateOp]) {
        for op in ops {
            self.push(op.clone());
        }
    }

    /// Replays the buffer into a backend builder in program order.
    pub fn flush_into(&self, builder: &mut dyn Builder) {
        for op in &self.ops {
            op.apply(builder);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::BuilderProxy;
    use std::f64::consts::{FRAC_PI_2, PI};

    fn rendered(proxy: &BuilderProxy) -> Vec<String> {
        proxy.ops().iter().map(ToString::to_string).collect()
    }

    #[test]
    fn same_axis_rotations_merge() {
        let mut proxy = BuilderProxy::default();
        proxy.z(0, FRAC_PI_2);
        proxy.z(0, FRAC_PI_2);
        assert_eq!(rendered(&proxy), vec![format!("z 0 {PI}")]);
    }

    #[test]
    fn intervening_op_blocks_merge() {
        let mut proxy = BuilderProxy::default();
        proxy.z(0, FRAC_PI_2);
        proxy.cx(vec![0], 1, PI);
        proxy.z(0, FRAC_PI_2);
        assert_eq!(
            rendered(&proxy),
            vec![
                format!("z 0 {FRAC_PI_2}"),
                format!("cx [0] 1 {PI}"),
                format!("z 0 {FRAC_PI_2}"),
            ]
        );
    }

    #[test]
    fn other_qubit_does_not_block_merge() {
        let mut proxy = BuilderProxy::default();
        proxy.x(0, FRAC_PI_2);
        proxy.x(1, PI);
        proxy.x(0, FRAC_PI_2);
        assert_eq!(
            rendered(&proxy),
            vec![format!("x 0 {PI}"), format!("x 1 {PI}")]
        );
    }

    #[test]
    fn measure_positions_are_arrival_order() {
        let mut proxy = BuilderProxy::default();
        assert_eq!(proxy.measure(5), 0);
        assert_eq!(proxy.measure(2), 1);
        proxy.clear();
        assert_eq!(proxy.measure(2), 0);
    }

    #[test]
    fn different_axis_does_not_merge() {
        let mut proxy = BuilderProxy::default();
        proxy.x(0, PI);
        proxy.z(0, PI);
        assert_eq!(
            rendered(&proxy),
            vec![format!("x 0 {PI}"), format!("z 0 {PI}")]
        );
    }
}
