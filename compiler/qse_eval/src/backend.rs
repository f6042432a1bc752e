// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The capability interfaces a quantum runtime must provide, plus the
//! decorators and deterministic implementations the executor ships with.

use std::any::Any;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

/// A shot-count distribution: bitstring to count. Ordered so that every
/// consumer iterates deterministically.
pub type Distribution = BTreeMap<String, u64>;

/// The features a backend must have to run a module.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RequiredFeatures {
    pub qubit_count: u64,
}

impl RequiredFeatures {
    #[must_use]
    pub fn new(qubit_count: u64) -> Self {
        Self { qubit_count }
    }
}

/// An accumulator of primitive gate operations scoped to a single circuit
/// execution. Angles are radians; `measure` assigns classical bit positions
/// in arrival order.
pub trait Builder: Any {
    fn x(&mut self, qubit: usize, theta: f64);
    fn y(&mut self, qubit: usize, theta: f64);
    fn z(&mut self, qubit: usize, theta: f64);
    fn cx(&mut self, controls: &[usize], target: usize, theta: f64);
    fn cy(&mut self, controls: &[usize], target: usize, theta: f64);
    fn cz(&mut self, controls: &[usize], target: usize, theta: f64);
    fn swap(&mut self, a: usize, b: usize);
    fn reset(&mut self, qubit: usize);
    fn measure(&mut self, qubit: usize);
    fn clear(&mut self) {}
    /// Downcast support for backends that need their own builder back.
    fn as_any(&mut self) -> &mut dyn Any;
}

/// A component that consumes a builder and returns a distribution of
/// observed bitstrings over all shots.
pub trait Backend {
    fn create_builder(&mut self) -> Box<dyn Builder>;

    /// Runs the circuit accumulated in `builder`. The builder may be
    /// inspected but must not be retained past this call.
    ///
    /// # Errors
    /// Returns the backend's error message; the engine wraps it verbatim.
    fn execute(&mut self, builder: &mut dyn Builder) -> Result<Distribution, String>;

    fn has_features(&self, required: &RequiredFeatures) -> bool;
}

/// Builder decorator that logs every gate it forwards to the
/// `qse::projection` trace channel.
pub struct LoggingBuilder {
    inner: Box<dyn Builder>,
}

impl LoggingBuilder {
    #[must_use]
    pub fn new(inner: Box<dyn Builder>) -> Self {
        Self { inner }
    }

    #[must_use]
    pub fn into_inner(self) -> Box<dyn Builder> {
        self.inner
    }
}

impl Builder for LoggingBuilder {
    fn x(&mut self, qubit: usize, theta: f64) {
        log::info!(target: "qse::projection", "x {qubit} {theta}");
        self.inner.x(qubit, theta);
    }

    fn y(&mut self, qubit: usize, theta: f64) {
        log::info!(target: "qse::projection", "y {qubit} {theta}");
        self.inner.y(qubit, theta);
    }

    fn z(&mut self, qubit: usize, theta: f64) {
        log::info!(target: "qse::projection", "z {qubit} {theta}");
        self.inner.z(qubit, theta);
    }

    fn cx(&mut self, controls: &[usize], target: usize, theta: f64) {
        log::info!(target: "qse::projection", "cx {controls:?} {target} {theta}");
        self.inner.cx(controls, target, theta);
    }

    fn cy(&mut self, controls: &[usize], target: usize, theta: f64) {
        log::info!(target: "qse::projection", "cy {controls:?} {target} {theta}");
        self.inner.cy(controls, target, theta);
    }

    fn cz(&mut self, controls: &[usize], target: usize, theta: f64) {
        log::info!(target: "qse::projection", "cz {controls:?} {target} {theta}");
        self.inner.cz(controls, target, theta);
    }

    fn swap(&mut self, a: usize, b: usize) {
        log::info!(target: "qse::projection", "swap {a} {b}");
        self.inner.swap(a, b);
    }

    fn reset(&mut self, qubit: usize) {
        log::info!(target: "qse::projection", "reset {qubit}");
        self.inner.reset(qubit);
    }

    fn measure(&mut self, qubit: usize) {
        log::info!(target: "qse::projection", "measure {qubit}");
        self.inner.measure(qubit);
    }

    fn clear(&mut self) {
        log::info!(target: "qse::projection", "clear");
        self.inner.clear();
    }

    fn as_any(&mut self) -> &mut dyn Any {
        self.inner.as_any()
    }
}

/// A builder that renders every gate into a line of text, matching the shape
/// backends typically log (`x 0 3.141592653589793`, `cx [0] 1 ...`).
#[derive(Default)]
pub struct RecordingBuilder {
    pub gates: Vec<String>,
    measured: usize,
}

impl Builder for RecordingBuilder {
    fn x(&mut self, qubit: usize, theta: f64) {
        self.gates.push(format!("x {qubit} {theta}"));
    }

    fn y(&mut self, qubit: usize, theta: f64) {
        self.gates.push(format!("y {qubit} {theta}"));
    }

    fn z(&mut self, qubit: usize, theta: f64) {
        self.gates.push(format!("z {qubit} {theta}"));
    }

    fn cx(&mut self, controls: &[usize], target: usize, theta: f64) {
        self.gates.push(format!("cx {controls:?} {target} {theta}"));
    }

    fn cy(&mut self, controls: &[usize], target: usize, theta: f64) {
        self.gates.push(format!("cy {controls:?} {target} {theta}"));
    }

    fn cz(&mut self, controls: &[usize], target: usize, theta: f64) {
        self.gates.push(format!("cz {controls:?} {target} {theta}"));
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.gates.push(format!("swap {a} {b}"));
    }

    fn reset(&mut self, qubit: usize) {
        self.gates.push(format!("reset {qubit}"));
    }

    fn measure(&mut self, qubit: usize) {
        self.gates.push(format!("measure {qubit}"));
        self.measured += 1;
    }

    fn clear(&mut self) {
        self.gates.clear();
        self.measured = 0;
    }

    fn as_any(&mut self) -> &mut dyn Any {
        self
    }
}

/// The gate lists of every circuit a [`RecordingBackend`] executed, shared
/// with the caller that constructed the backend.
pub type ExecutionLog = Rc<RefCell<Vec<Vec<String>>>>;

/// A backend that records executed circuits and answers with a fixed
/// distribution. The default (empty) distribution makes every forced result
/// materialize as zero.
pub struct RecordingBackend {
    log: ExecutionLog,
    counts: Distribution,
}

impl Default for RecordingBackend {
    fn default() -> Self {
        Self::new(Distribution::new())
    }
}

impl RecordingBackend {
    #[must_use]
    pub fn new(counts: Distribution) -> Self {
        Self {
            log: Rc::default(),
            counts,
        }
    }

    /// A shared handle to the execution log; survives handing the backend to
    /// an executor.
    #[must_use]
    pub fn log(&self) -> ExecutionLog {
        self.log.clone()
    }
}

impl Backend for RecordingBackend {
    fn create_builder(&mut self) -> Box<dyn Builder> {
        Box::new(RecordingBuilder::default())
    }

    fn execute(&mut self, builder: &mut dyn Builder) -> Result<Distribution, String> {
        let recording = builder
            .as_any()
            .downcast_mut::<RecordingBuilder>()
            .ok_or_else(|| "recording backend received a foreign builder".to_string())?;
        self.log.borrow_mut().push(recording.gates.clone());
        Ok(self.counts.clone())
    }

    fn has_features(&self, _required: &RequiredFeatures) -> bool {
        true
    }
}

/// A deterministic stand-in backend: every measured bit comes back zero for
/// all shots. Useful for smoke-testing files without a quantum runtime.
pub struct ZeroBackend {
    pub qubit_count: u64,
    pub shots: u64,
}

impl Default for ZeroBackend {
    fn default() -> Self {
        Self {
            qubit_count: 30,
            shots: 1024,
        }
    }
}

impl Backend for ZeroBackend {
    fn create_builder(&mut self) -> Box<dyn Builder> {
        Box::new(RecordingBuilder::default())
    }

    fn execute(&mut self, builder: &mut dyn Builder) -> Result<Distribution, String> {
        let recording = builder
            .as_any()
            .downcast_mut::<RecordingBuilder>()
            .ok_or_else(|| "zero backend received a foreign builder".to_string())?;
        let mut counts = Distribution::new();
        counts.insert("0".repeat(recording.measured.max(1)), self.shots);
        Ok(counts)
    }

    fn has_features(&self, required: &RequiredFeatures) -> bool {
        required.qubit_count <= self.qubit_count
    }
}
