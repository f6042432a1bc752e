// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A routing decorator over the backend interface: logical qubits are
//! remapped onto a physical coupling architecture before the wrapped
//! backend sees the circuit. Physical-qubit renaming is visible to the
//! wrapped backend, as a routed hardware run would make it.

use crate::backend::{Backend, Builder, Distribution, RequiredFeatures};
use crate::builder::GateOp;
use rustc_hash::FxHashMap;
use std::any::Any;
use std::collections::VecDeque;

/// A physical coupling map.
#[derive(Clone, Debug)]
pub struct Architecture {
    couplings: Vec<(usize, usize)>,
    nodes: usize,
}

impl Architecture {
    #[must_use]
    pub fn new(couplings: Vec<(usize, usize)>) -> Self {
        let nodes = couplings
            .iter()
            .map(|&(a, b)| a.max(b) + 1)
            .max()
            .unwrap_or(0);
        Self { couplings, nodes }
    }

    /// A ring of `n` nodes: 0-1, 1-2, ..., (n-1)-0.
    #[must_use]
    pub fn ring(n: usize) -> Self {
        Self::new((0..n).map(|i| (i % n, (i + 1) % n)).collect())
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes
    }

    fn adjacent(&self, a: usize, b: usize) -> bool {
        self.couplings
            .iter()
            .any(|&(x, y)| (x == a && y == b) || (x == b && y == a))
    }

    fn neighbors(&self, node: usize) -> impl Iterator<Item = usize> + '_ {
        self.couplings.iter().filter_map(move |&(x, y)| {
            if x == node {
                Some(y)
            } else if y == node {
                Some(x)
            } else {
                None
            }
        })
    }
}

/// Interposes routing between the engine and `inner`.
pub struct RoutedBackend {
    inner: Box<dyn Backend>,
    architecture: Architecture,
}

impl RoutedBackend {
    #[must_use]
    pub fn new(architecture: Architecture, inner: Box<dyn Backend>) -> Self {
        Self {
            inner,
            architecture,
        }
    }
}

impl Backend for RoutedBackend {
    fn create_builder(&mut self) -> Box<dyn Builder> {
        Box::new(RoutedBuilder::default())
    }

    fn execute(&mut self, builder: &mut dyn Builder) -> Result<Distribution, String> {
        let routed = builder
            .as_any()
            .downcast_mut::<RoutedBuilder>()
            .ok_or_else(|| "routed backend received a foreign builder".to_string())?;
        let physical = route(&self.architecture, &routed.ops)?;

        let mut inner_builder = self.inner.create_builder();
        for op in &physical {
            op.apply(&mut *inner_builder);
        }
        self.inner.execute(&mut *inner_builder)
    }

    fn has_features(&self, required: &RequiredFeatures) -> bool {
        required.qubit_count <= self.architecture.node_count() as u64
            && self.inner.has_features(required)
    }
}

/// Records the logical circuit for the routing pass.
#[derive(Default)]
pub struct RoutedBuilder {
    ops: Vec<GateOp>,
}

impl Builder for RoutedBuilder {
    fn x(&mut self, qubit: usize, theta: f64) {
        self.ops.push(GateOp::X { qubit, theta });
    }

    fn y(&mut self, qubit: usize, theta: f64) {
        self.ops.push(GateOp::Y { qubit, theta });
    }

    fn z(&mut self, qubit: usize, theta: f64) {
        self.ops.push(GateOp::Z { qubit, theta });
    }

    fn cx(&mut self, controls: &[usize], target: usize, theta: f64) {
        self.ops.push(GateOp::CX {
            controls: controls.to_vec(),
            target,
            theta,
        });
    }

    fn cy(&mut self, controls: &[usize], target: usize, theta: f64) {
        self.ops.push(GateOp::CY {
            controls: controls.to_vec(),
            target,
            theta,
        });
    }

    fn cz(&mut self, controls: &[usize], target: usize, theta: f64) {
        self.ops.push(GateOp::CZ {
            controls: controls.to_vec(),
            target,
            theta,
        });
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.ops.push(GateOp::Swap { a, b });
    }

    fn reset(&mut self, qubit: usize) {
        self.ops.push(GateOp::Reset { qubit });
    }

    fn measure(&mut self, qubit: usize) {
        self.ops.push(GateOp::Measure { qubit });
    }

    fn clear(&mut self) {
        self.ops.clear();
    }

    fn as_any(&mut self) -> &mut dyn Any {
        self
    }
}

struct Placement<'a> {
    architecture: &'a Architecture,
    map: FxHashMap<usize, usize>,
    used: Vec<bool>,
}

impl Placement<'_> {
    fn free_edge(&self) -> Option<(usize, usize)> {
        // Interacting pairs are seated walking the coupling list from the
        // end, matching the placement the original runtime exhibits on ring
        // architectures.
        self.architecture
            .couplings
            .iter()
            .rev()
            .find(|&&(a, b)| !self.used[a] && !self.used[b])
            .copied()
    }

    fn assign(&mut self, logical: usize, physical: usize) {
        self.map.insert(logical, physical);
        self.used[physical] = true;
    }

    fn place_single(&mut self, logical: usize) -> Result<usize, String> {
        if let Some(&physical) = self.map.get(&logical) {
            return Ok(physical);
        }
        // Prefer the same-numbered node, then the first free one.
        let physical = if logical < self.used.len() && !self.used[logical] {
            logical
        } else {
            self.used
                .iter()
                .position(|used| !used)
                .ok_or_else(|| "architecture has no free node left".to_string())?
        };
        self.assign(logical, physical);
        Ok(physical)
    }

    fn place_pair(&mut self, a: usize, b: usize) -> Result<(), String> {
        match (self.map.contains_key(&a), self.map.contains_key(&b)) {
            (false, false) => {
                if let Some((pa, pb)) = self.free_edge() {
                    self.assign(a, pa);
                    self.assign(b, pb);
                } else {
                    self.place_single(a)?;
                    self.place_single(b)?;
                }
            }
            (true, false) => {
                let pa = self.map[&a];
                let free = self.architecture.neighbors(pa).find(|&n| !self.used[n]);
                if let Some(free) = free {
                    self.assign(b, free);
                } else {
                    self.place_single(b)?;
                }
            }
            (false, true) => {
                let pb = self.map[&b];
                let free = self.architecture.neighbors(pb).find(|&n| !self.used[n]);
                if let Some(free) = free {
                    self.assign(a, free);
                } else {
                    self.place_single(a)?;
                }
            }
            (true, true) => {}
        }
        Ok(())
    }
}

/// Maps a logical circuit onto the architecture, inserting swaps when an
/// interacting pair is not adjacent.
fn route(architecture: &Architecture, ops: &[GateOp]) -> Result<Vec<GateOp>, String> {
    let mut placement = Placement {
        architecture,
        map: FxHashMap::default(),
        used: vec![false; architecture.node_count()],
    };

    // Seat interacting pairs first so two-qubit gates land on coupled nodes.
    for op in ops {
        match op {
            GateOp::CX {
                controls, target, ..
            }
            | GateOp::CY {
                controls, target, ..
            }
            | GateOp::CZ {
                controls, target, ..
            } => {
                for &control in controls {
                    placement.place_pair(control, *target)?;
                }
            }
            GateOp::Swap { a, b } => placement.place_pair(*a, *b)?,
            _ => {}
        }
    }

    let mut routed = Vec::with_capacity(ops.len());
    for op in ops {
        match op {
            GateOp::X { qubit, theta } => routed.push(GateOp::X {
                qubit: placement.place_single(*qubit)?,
                theta: *theta,
            }),
            GateOp::Y { qubit, theta } => routed.push(GateOp::Y {
                qubit: placement.place_single(*qubit)?,
                theta: *theta,
            }),
            GateOp::Z { qubit, theta } => routed.push(GateOp::Z {
                qubit: placement.place_single(*qubit)?,
                theta: *theta,
            }),
            GateOp::Reset { qubit } => routed.push(GateOp::Reset {
                qubit: placement.place_single(*qubit)?,
            }),
            GateOp::Measure { qubit } => routed.push(GateOp::Measure {
                qubit: placement.place_single(*qubit)?,
            }),
            GateOp::Swap { a, b } => {
                let pa = placement.place_single(*a)?;
                let pb = placement.place_single(*b)?;
                routed.push(GateOp::Swap { a: pa, b: pb });
            }
            GateOp::CX {
                controls,
                target,
                theta,
            } => {
                let (controls, target) =
                    route_interaction(architecture, &mut placement, controls, *target, &mut routed)?;
                routed.push(GateOp::CX {
                    controls,
                    target,
                    theta: *theta,
                });
            }
            GateOp::CY {
                controls,
                target,
                theta,
            } => {
                let (controls, target) =
                    route_interaction(architecture, &mut placement, controls, *target, &mut routed)?;
                routed.push(GateOp::CY {
                    controls,
                    target,
                    theta: *theta,
                });
            }
            GateOp::CZ {
                controls,
                target,
                theta,
            } => {
                let (controls, target) =
                    route_interaction(architecture, &mut placement, controls, *target, &mut routed)?;
                routed.push(GateOp::CZ {
                    controls,
                    target,
                    theta: *theta,
                });
            }
        }
    }
    Ok(routed)
}

/// Brings each control adjacent to the target, emitting swaps as needed,
/// and returns the physical operands.
fn route_interaction(
    architecture: &Architecture,
    placement: &mut Placement,
    controls: &[usize],
    target: usize,
    routed: &mut Vec<GateOp>,
) -> Result<(Vec<usize>, usize), String> {
    let physical_target = placement.place_single(target)?;
    let mut physical_controls = Vec::with_capacity(controls.len());
    for &control in controls {
        let mut physical = placement.place_single(control)?;
        while !architecture.adjacent(physical, physical_target) {
            let step = next_hop(architecture, physical, physical_target)
                .ok_or_else(|| "no path between coupled nodes".to_string())?;
            routed.push(GateOp::Swap { a: physical, b: step });
            swap_mapping(placement, physical, step);
            physical = step;
        }
        physical_controls.push(physical);
    }
    Ok((physical_controls, physical_target))
}

/// First hop of a shortest path from `from` toward `to`.
fn next_hop(architecture: &Architecture, from: usize, to: usize) -> Option<usize> {
    let mut previous: FxHashMap<usize, usize> = FxHashMap::default();
    let mut queue = VecDeque::from([to]);
    while let Some(node) = queue.pop_front() {
        for neighbor in architecture.neighbors(node) {
            if neighbor != to && !previous.contains_key(&neighbor) {
                previous.insert(neighbor, node);
                if neighbor == from {
                    return Some(node);
                }
                queue.push_back(neighbor);
            }
        }
    }
    None
}

fn swap_mapping(placement: &mut Placement, a: usize, b: usize) {
    let logical_a = placement
        .map
        .iter()
        .find_map(|(&l, &p)| (p == a).then_some(l));
    let logical_b = placement
        .map
        .iter()
        .find_map(|(&l, &p)| (p == b).then_some(l));
    if let Some(l) = logical_a {
        placement.map.insert(l, b);
    }
    if let Some(l) = logical_b {
        placement.map.insert(l, a);
    }
    placement.used[a] = logical_b.is_some();
    placement.used[b] = logical_a.is_some();
}

#[cfg(test)]
mod tests {
    use super::{route, Architecture};
    use crate::builder::GateOp;
    use std::f64::consts::{FRAC_PI_2, PI};

    #[test]
    fn ring_architecture_edges() {
        let ring = Architecture::ring(4);
        assert_eq!(ring.node_count(), 4);
        assert!(ring.adjacent(3, 0));
        assert!(!ring.adjacent(0, 2));
    }

    #[test]
    fn bell_on_ring_four_lands_on_last_edge() {
        let ops = vec![
            GateOp::Z { qubit: 0, theta: PI },
            GateOp::Y {
                qubit: 0,
                theta: FRAC_PI_2,
            },
            GateOp::CX {
                controls: vec![0],
                target: 1,
                theta: PI,
            },
            GateOp::Measure { qubit: 0 },
            GateOp::Measure { qubit: 1 },
        ];
        let routed = route(&Architecture::ring(4), &ops).expect("routing should succeed");
        let rendered: Vec<String> = routed.iter().map(ToString::to_string).collect();
        assert_eq!(
            rendered,
            vec![
                format!("z 3 {PI}"),
                format!("y 3 {FRAC_PI_2}"),
                format!("cx [3] 0 {PI}"),
                "measure 3".to_string(),
                "measure 0".to_string(),
            ]
        );
    }

    #[test]
    fn distant_pair_gets_swapped_adjacent() {
        // A line of five nodes; logical qubits seated at the ends.
        let line = Architecture::new(vec![(0, 1), (1, 2), (2, 3), (3, 4)]);
        let ops = vec![GateOp::CX {
            controls: vec![0],
            target: 1,
            theta: PI,
        }];
        let routed = route(&line, &ops).expect("routing should succeed");
        // Pair placement starts from the last edge, so no swaps are needed.
        assert_eq!(routed.len(), 1);

        // Force a distant pair by seating three pairs first.
        let ops = vec![
            GateOp::CX {
                controls: vec![0],
                target: 1,
                theta: PI,
            },
            GateOp::CX {
                controls: vec![2],
                target: 3,
                theta: PI,
            },
            GateOp::CX {
                controls: vec![1],
                target: 3,
                theta: PI,
            },
        ];
        let routed = route(&line, &ops).expect("routing should succeed");
        assert!(
            routed
                .iter()
                .any(|op| matches!(op, GateOp::Swap { .. })),
            "expected at least one inserted swap, got {routed:?}"
        );
    }
}
