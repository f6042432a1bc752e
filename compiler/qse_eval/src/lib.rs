// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The projection engine: a partial evaluator over QIR execution graphs.
//!
//! Classical instructions fold eagerly. Quantum intrinsics accumulate into
//! the builder proxy without evaluating. When control flow needs a value
//! that depends on an unmeasured result, the engine forces materialization:
//! the accumulated circuit is flushed to the backend, executed, and the
//! pending results are projected from the returned distribution before
//! execution resumes.

#![warn(clippy::mod_module_files, clippy::pedantic, clippy::unwrap_used)]

#[cfg(test)]
mod tests;

pub mod backend;
pub mod builder;
pub mod heap;
mod intrinsics;
pub mod routing;
pub mod val;

use backend::{Backend, Builder, Distribution, LoggingBuilder};
use builder::{BuilderProxy, GateOp};
use heap::{Heap, QubitPool, ResultState};
use miette::Diagnostic;
use qse_graph::{FunctionGraph, ModuleGraphs};
use qse_llvm::instruction::{BinaryOp, CastOp, Constant, Instruction, Operand, Terminator};
use qse_llvm::{FPPredicate, IntPredicate, Module, Name, Ty};
use rustc_hash::{FxHashMap, FxHashSet, FxHasher};
use std::hash::{Hash, Hasher};
use std::rc::Rc;
use thiserror::Error as ThisError;
use val::{normalize, to_unsigned, DeferredExpr, Pointer, ResultId, StringId, Value};

#[derive(Clone, Debug, Diagnostic, ThisError)]
pub enum Error {
    #[error("mismatched types: expected {expected}, found {found}")]
    #[diagnostic(code("Qse.Eval.TypeMismatch"))]
    TypeMismatch { expected: String, found: String },

    #[error("undefined symbol: {0}")]
    #[diagnostic(code("Qse.Eval.UndefinedSymbol"))]
    UndefinedSymbol(String),

    #[error("no qubits left to allocate")]
    #[diagnostic(code("Qse.Eval.OutOfQubits"))]
    OutOfQubits,

    #[error("qubit {0} used after release")]
    #[diagnostic(code("Qse.Eval.QubitUseAfterRelease"))]
    QubitUseAfterRelease(usize),

    #[error("refcount underflow: {0}")]
    #[diagnostic(code("Qse.Eval.RefcountUnderflow"))]
    RefcountUnderflow(String),

    #[error("exceeded step count limit of {0}")]
    #[diagnostic(code("Qse.Eval.StepLimitExceeded"))]
    #[diagnostic(help("raise the limit with step_count_limit"))]
    StepLimitExceeded(u64),

    #[error("recursion limit of {0} exceeded")]
    #[diagnostic(code("Qse.Eval.RecursionLimit"))]
    RecursionLimit(usize),

    #[error("unsupported feature: {0}")]
    #[diagnostic(code("Qse.Eval.Unsupported"))]
    Unsupported(String),

    #[error("backend failure: {0}")]
    #[diagnostic(code("Qse.Eval.BackendFailure"))]
    BackendFailure(String),

    #[error("{source} (at @{function}, block {block}, instruction {index})")]
    #[diagnostic(code("Qse.Eval.Failed"))]
    Context {
        function: String,
        block: String,
        index: usize,
        source: Box<Error>,
    },
}

impl Error {
    fn type_mismatch(expected: impl Into<String>, found: impl Into<String>) -> Self {
        Error::TypeMismatch {
            expected: expected.into(),
            found: found.into(),
        }
    }

    fn expected(expected: &str, value: &Value) -> Self {
        Self::type_mismatch(expected, value.type_name())
    }
}

/// Engine knobs, owned by the orchestrator.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Instructions the engine may execute before aborting. `None` is
    /// unbounded.
    pub step_limit: Option<u64>,
    pub recursion_limit: usize,
    pub qubit_capacity: Option<u64>,
    pub trace_projections: bool,
    pub trace_runtime: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            step_limit: None,
            recursion_limit: 256,
            qubit_capacity: None,
            trace_projections: false,
            trace_runtime: false,
        }
    }
}

/// A host-supplied argument or host-facing return value.
#[derive(Clone, Debug, PartialEq)]
pub enum HostValue {
    Int(i64),
    Double(f64),
    Bool(bool),
    String(String),
}

/// One `result_record_output` call, in program order.
#[derive(Clone, Debug)]
pub struct OutputRecord {
    pub result: ResultId,
    pub label: Option<Rc<str>>,
}

/// A recorded output bit after the run: either already materialized or a
/// position in the final distribution.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputBit {
    Known(bool),
    Position(usize),
}

/// Everything the orchestrator needs to shape and report a run.
#[derive(Debug)]
pub struct RunOutcome {
    pub value: Option<HostValue>,
    pub output_bits: Vec<OutputBit>,
    pub final_distribution: Option<Distribution>,
    /// Backend executions performed.
    pub executions: usize,
    /// High-water mark of qubit ids.
    pub qubits_used: u64,
    /// Allocated qubits never released.
    pub leaked_qubits: Vec<usize>,
    /// Heap entries never released (rendered for reporting).
    pub leaked_entries: Vec<String>,
}

/// Runs an entry-point function against a backend.
///
/// # Errors
/// Any engine error aborts the run; heap and qubit state are not rolled
/// back.
pub fn run(
    module: &Module,
    graphs: &ModuleGraphs,
    backend: &mut dyn Backend,
    config: &EngineConfig,
    entry: &str,
    args: &[HostValue],
) -> Result<RunOutcome, Error> {
    let mut function_index = FxHashMap::default();
    let mut graphs_by_index = Vec::with_capacity(module.functions.len());
    for (index, function) in module.functions.iter().enumerate() {
        function_index.insert(function.name.clone(), index);
        graphs_by_index.push(graphs.get(&function.name).ok_or_else(|| {
            Error::UndefinedSymbol(format!("execution graph for @{}", function.name))
        })?);
    }
    let Some(&entry_index) = function_index.get(entry) else {
        return Err(Error::UndefinedSymbol(format!("entry point @{entry}")));
    };

    let mut engine = Engine {
        module,
        graphs: graphs_by_index,
        function_index,
        backend,
        config,
        heap: Heap::default(),
        pool: QubitPool::default(),
        proxy: BuilderProxy::default(),
        outputs: Vec::new(),
        interned: FxHashMap::default(),
        interned_ids: FxHashSet::default(),
        frames: Vec::new(),
        steps_taken: 0,
        executions: 0,
        last_distribution: None,
        cache: FxHashMap::default(),
        recordings: Vec::new(),
    };
    engine.pool.set_capacity(config.qubit_capacity);

    let locals = engine.bind_args(entry_index, args)?;
    engine.frames.push(Frame {
        func: entry_index,
        block: 0,
        prev_block: None,
        pc: 0,
        locals,
        call_dest: None,
    });

    let returned = loop {
        if let Some(value) = engine.step_with_context()? {
            break value;
        }
    };
    engine.into_outcome(returned)
}

/// Projects recorded output bits over the final distribution, producing the
/// base-profile `bitstring -> count` mapping. The first recorded bit is the
/// rightmost character of each key.
#[must_use]
pub fn shape_counts(bits: &[OutputBit], distribution: Option<&Distribution>) -> Distribution {
    let mut shaped = Distribution::new();
    let needs_distribution = bits.iter().any(|b| matches!(b, OutputBit::Position(_)));
    if needs_distribution {
        if let Some(distribution) = distribution {
            for (key, count) in distribution {
                let mut chars: Vec<char> = bits
                    .iter()
                    .map(|bit| match bit {
                        OutputBit::Known(true) => '1',
                        OutputBit::Known(false) => '0',
                        OutputBit::Position(position) => key_bit(key, *position),
                    })
                    .collect();
                chars.reverse();
                *shaped.entry(chars.into_iter().collect()).or_insert(0) += count;
            }
            return shaped;
        }
    }
    let total = distribution
        .map(|d| d.values().sum::<u64>())
        .filter(|&t| t > 0)
        .unwrap_or(1);
    let mut chars: Vec<char> = bits
        .iter()
        .map(|bit| match bit {
            OutputBit::Known(true) => '1',
            // Positions without a distribution cannot occur; pending bits
            // default to zero like unmeasured results.
            _ => '0',
        })
        .collect();
    chars.reverse();
    shaped.insert(chars.into_iter().collect(), total);
    shaped
}

fn key_bit(key: &str, position: usize) -> char {
    let bytes = key.as_bytes();
    if position < bytes.len() && bytes[bytes.len() - 1 - position] == b'1' {
        '1'
    } else {
        '0'
    }
}

/// Strict majority of bit `position` over the distribution; ties and empty
/// distributions give zero.
fn majority_bit(distribution: &Distribution, position: usize) -> bool {
    let mut ones = 0u64;
    let mut total = 0u64;
    for (key, count) in distribution {
        total += count;
        if key_bit(key, position) == '1' {
            ones += count;
        }
    }
    ones * 2 > total
}

struct Frame {
    func: usize,
    block: usize,
    prev_block: Option<usize>,
    pc: usize,
    locals: FxHashMap<Name, Value>,
    /// Where the caller wants this frame's return value.
    call_dest: Option<Name>,
}

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
struct CacheKey {
    func: usize,
    block: usize,
    fingerprint: u64,
}

#[derive(Clone, Debug)]
struct CacheEntry {
    ops: Vec<GateOp>,
    value: Option<Value>,
}

/// An in-progress observation of a loop-header tail, finalized when the
/// frame that entered the header returns.
struct Recording {
    key: CacheKey,
    depth: usize,
    ops_start: usize,
    clears: u64,
    churn: u64,
    allocations: u64,
    measured: usize,
    outputs_len: usize,
}

const MAX_RECORDINGS: usize = 256;

struct Engine<'a> {
    module: &'a Module,
    graphs: Vec<&'a FunctionGraph>,
    function_index: FxHashMap<Rc<str>, usize>,
    backend: &'a mut dyn Backend,
    config: &'a EngineConfig,
    heap: Heap,
    pool: QubitPool,
    proxy: BuilderProxy,
    outputs: Vec<OutputRecord>,
    interned: FxHashMap<Rc<str>, StringId>,
    interned_ids: FxHashSet<usize>,
    frames: Vec<Frame>,
    steps_taken: u64,
    executions: usize,
    last_distribution: Option<Distribution>,
    cache: FxHashMap<CacheKey, CacheEntry>,
    recordings: Vec<Recording>,
}

/// `Some(value)` from a step means the entry frame returned `value`.
type StepOutcome = Option<Option<Value>>;

impl<'a> Engine<'a> {
    fn current_frame(&self) -> &Frame {
        self.frames.last().expect("engine should have a frame")
    }

    fn current_frame_mut(&mut self) -> &mut Frame {
        self.frames.last_mut().expect("engine should have a frame")
    }

    fn step_with_context(&mut self) -> Result<StepOutcome, Error> {
        let frame = self.current_frame();
        let (func, block, pc) = (frame.func, frame.block, frame.pc);
        match self.step() {
            Ok(outcome) => Ok(outcome),
            Err(error @ Error::Context { .. }) => Err(error),
            Err(error) => {
                let function = &self.module.functions[func];
                Err(Error::Context {
                    function: function.name.to_string(),
                    block: function.blocks[block].name.to_string(),
                    index: pc,
                    source: Box::new(error),
                })
            }
        }
    }

    fn step(&mut self) -> Result<StepOutcome, Error> {
        let module = self.module;
        let frame = self.current_frame();
        let (func, block_idx, pc) = (frame.func, frame.block, frame.pc);
        let function = &module.functions[func];
        let block = &function.blocks[block_idx];

        self.charge_step()?;
        if self.config.trace_runtime {
            let what = block.instructions.get(pc).map_or_else(
                || "terminator".to_string(),
                qse_llvm::Instruction::opcode,
            );
            log::info!(
                target: "qse::runtime",
                "step {} depth {} @{}:{}:{pc} {what}",
                self.steps_taken,
                self.frames.len(),
                function.name,
                block.name,
            );
        }

        if let Some(instruction) = block.instructions.get(pc) {
            self.current_frame_mut().pc += 1;
            self.eval_instruction(instruction)?;
            Ok(None)
        } else {
            self.eval_terminator(&block.terminator)
        }
    }

    fn charge_step(&mut self) -> Result<(), Error> {
        if let Some(limit) = self.config.step_limit {
            if self.steps_taken >= limit {
                return Err(Error::StepLimitExceeded(limit));
            }
        }
        self.steps_taken += 1;
        Ok(())
    }

    // Values and operands

    fn set_local(&mut self, name: &Name, value: Value) {
        if self.config.trace_projections {
            log::info!(target: "qse::projection", "{name} <- {value}");
        }
        self.current_frame_mut().locals.insert(name.clone(), value);
    }

    fn eval_operand(&mut self, operand: &Operand) -> Result<Value, Error> {
        match operand {
            Operand::Local { name, .. } => self
                .current_frame()
                .locals
                .get(name)
                .cloned()
                .ok_or_else(|| Error::UndefinedSymbol(name.to_string())),
            Operand::Constant(constant) => self.const_value(constant),
        }
    }

    fn const_value(&mut self, constant: &Constant) -> Result<Value, Error> {
        match constant {
            Constant::Int { width, value } => Ok(Value::int(*width, *value)),
            Constant::Double(value) => Ok(Value::Double(*value)),
            Constant::Null(ty) => Ok(self.pointer_literal(ty, 0)),
            Constant::IntToPtr { value, ty } => {
                let id = usize::try_from(*value).map_err(|_| {
                    Error::type_mismatch("non-negative handle id", value.to_string())
                })?;
                Ok(self.pointer_literal(ty, id))
            }
            Constant::Global { name, ty } => self.global_value(name, ty),
            Constant::Undef(_) => Ok(Value::Null),
        }
    }

    /// A typed pointer literal: `null` or `inttoptr` of a handle type.
    fn pointer_literal(&mut self, ty: &Ty, id: usize) -> Value {
        if ty.is_qubit_ptr() {
            self.pool.touch_literal(id);
            Value::Qubit(val::QubitRef(id))
        } else if ty.is_result_ptr() {
            Value::Result(self.heap.ensure_static_result(id))
        } else if id == 0 {
            Value::Null
        } else {
            #[allow(clippy::cast_possible_wrap)]
            let value = id as i64;
            Value::Int { width: 64, value }
        }
    }

    fn global_value(&mut self, name: &Rc<str>, _ty: &Ty) -> Result<Value, Error> {
        if let Some(&id) = self.interned.get(name) {
            return Ok(Value::String(id));
        }
        let bytes = self
            .module
            .globals
            .get(name)
            .ok_or_else(|| Error::UndefinedSymbol(format!("@{name}")))?
            .clone();
        let id = self.heap.alloc_string(bytes);
        self.interned.insert(name.clone(), id);
        self.interned_ids.insert(id.0);
        Ok(Value::String(id))
    }

    // Instructions

    fn eval_instruction(&mut self, instruction: &Instruction) -> Result<(), Error> {
        match instruction {
            Instruction::Binary { op, lhs, rhs, dest } => {
                let lhs = self.eval_operand(lhs)?;
                let rhs = self.eval_operand(rhs)?;
                let value = if lhs.is_classical() && rhs.is_classical() {
                    fold_binary(*op, &lhs, &rhs)?
                } else {
                    Value::Deferred(Rc::new(DeferredExpr::Binary { op: *op, lhs, rhs }))
                };
                self.set_local(dest, value);
            }
            Instruction::ICmp {
                pred,
                lhs,
                rhs,
                dest,
            } => {
                let lhs = self.eval_operand(lhs)?;
                let rhs = self.eval_operand(rhs)?;
                let value = if lhs.is_classical() && rhs.is_classical() {
                    fold_icmp(*pred, &lhs, &rhs)?
                } else {
                    Value::Deferred(Rc::new(DeferredExpr::Compare {
                        pred: *pred,
                        lhs,
                        rhs,
                    }))
                };
                self.set_local(dest, value);
            }
            Instruction::FCmp {
                pred,
                lhs,
                rhs,
                dest,
            } => {
                let lhs = self.eval_operand(lhs)?;
                let lhs = self.materialize(lhs)?;
                let rhs = self.eval_operand(rhs)?;
                let rhs = self.materialize(rhs)?;
                let value = fold_fcmp(*pred, &lhs, &rhs)?;
                self.set_local(dest, value);
            }
            Instruction::Phi { incoming, dest, .. } => {
                let value = self.eval_phi(incoming)?;
                self.set_local(dest, value);
            }
            Instruction::Select {
                cond,
                if_true,
                if_false,
                dest,
            } => {
                let cond = self.eval_operand(cond)?;
                let if_true = self.eval_operand(if_true)?;
                let if_false = self.eval_operand(if_false)?;
                let value = if cond.is_classical() {
                    if cond.as_bool().map_err(|_| Error::expected("Bool", &cond))? {
                        if_true
                    } else {
                        if_false
                    }
                } else {
                    Value::Deferred(Rc::new(DeferredExpr::Select {
                        cond,
                        if_true,
                        if_false,
                    }))
                };
                self.set_local(dest, value);
            }
            Instruction::Call {
                callee,
                args,
                dest,
                ..
            } => self.eval_call(callee, args, dest.as_ref())?,
            Instruction::GetElementPtr {
                base,
                indices,
                dest,
            } => {
                let value = self.eval_gep(base, indices)?;
                self.set_local(dest, value);
            }
            Instruction::Cast {
                op,
                operand,
                to,
                dest,
            } => {
                let value = self.eval_cast(*op, operand, to)?;
                self.set_local(dest, value);
            }
            Instruction::Alloca { dest, .. } => {
                let slot = self.heap.alloc_slot();
                self.set_local(dest, Value::Pointer(Pointer::Slot(slot)));
            }
            Instruction::Load { ptr, dest, .. } => {
                let ptr = self.eval_operand(ptr)?;
                let pointer = ptr.as_pointer().map_err(|_| Error::expected("Pointer", &ptr))?;
                let value = self.heap.read_pointer(pointer)?;
                self.set_local(dest, value);
            }
            Instruction::Store { value, ptr } => {
                let value = self.eval_operand(value)?;
                let ptr = self.eval_operand(ptr)?;
                let pointer = ptr.as_pointer().map_err(|_| Error::expected("Pointer", &ptr))?;
                self.heap.write_pointer(pointer, value)?;
            }
        }
        Ok(())
    }

    fn eval_phi(&mut self, incoming: &[(Operand, Name)]) -> Result<Value, Error> {
        let prev = self
            .current_frame()
            .prev_block
            .ok_or_else(|| Error::UndefinedSymbol("phi at function entry".to_string()))?;
        let prev_name = &self.module.functions[self.current_frame().func].blocks[prev].name;
        let operand = incoming
            .iter()
            .find(|(_, label)| label == prev_name)
            .map(|(operand, _)| operand.clone())
            .ok_or_else(|| {
                Error::UndefinedSymbol(format!("phi has no incoming value from {prev_name}"))
            })?;
        self.eval_operand(&operand)
    }

    fn eval_gep(&mut self, base: &Operand, indices: &[Operand]) -> Result<Value, Error> {
        let base = self.eval_operand(base)?;
        let mut index_values = Vec::with_capacity(indices.len());
        for index in indices {
            let value = self.eval_operand(index)?;
            index_values.push(
                value
                    .as_int()
                    .map_err(|_| Error::expected("Int index", &value))?,
            );
        }
        match base {
            // A tuple pointer bitcast to its typed shape, then indexed:
            // first index must be zero, second selects the field.
            Value::Tuple(id) => match index_values.as_slice() {
                [0] => Ok(Value::Tuple(id)),
                [0, field] => {
                    let field = usize::try_from(*field).map_err(|_| {
                        Error::type_mismatch("non-negative field index", field.to_string())
                    })?;
                    Ok(Value::Pointer(Pointer::TupleElement(id, field)))
                }
                _ => Err(Error::Unsupported(
                    "getelementptr shape on tuple".to_string(),
                )),
            },
            Value::Pointer(pointer) if index_values.iter().all(|&i| i == 0) => {
                Ok(Value::Pointer(pointer))
            }
            Value::String(id) if index_values.iter().all(|&i| i == 0) => Ok(Value::String(id)),
            other => Err(Error::Unsupported(format!(
                "getelementptr on {}",
                other.type_name()
            ))),
        }
    }

    fn eval_cast(&mut self, op: CastOp, operand: &Operand, to: &Ty) -> Result<Value, Error> {
        let source_ty = operand.ty();
        let value = self.eval_operand(operand)?;
        match op {
            CastOp::BitCast => Ok(value),
            CastOp::IntToPtr => {
                let value = self.materialize(value)?;
                let raw = value.as_int().map_err(|_| Error::expected("Int", &value))?;
                let id = usize::try_from(raw).map_err(|_| {
                    Error::type_mismatch("non-negative handle id", raw.to_string())
                })?;
                Ok(self.pointer_literal(to, id))
            }
            _ => {
                if value.is_classical() {
                    fold_cast(op, &source_ty, to, &value)
                } else {
                    Ok(Value::Deferred(Rc::new(DeferredExpr::Cast {
                        op,
                        to: to.clone(),
                        value,
                    })))
                }
            }
        }
    }

    fn eval_call(
        &mut self,
        callee: &Rc<str>,
        args: &[Operand],
        dest: Option<&Name>,
    ) -> Result<(), Error> {
        let mut values = Vec::with_capacity(args.len());
        for arg in args {
            values.push(self.eval_operand(arg)?);
        }

        if callee.as_ref() == "__quantum__rt__result_equal" {
            if values.len() != 2 {
                return Err(Error::type_mismatch(
                    "2 arguments to result_equal",
                    values.len().to_string(),
                ));
            }
            let a = self.coerce_result(&values[0])?;
            let b = self.coerce_result(&values[1])?;
            let equal = self.result_bit(a)? == self.result_bit(b)?;
            if let Some(dest) = dest {
                self.set_local(dest, Value::Bool(equal));
            }
            return Ok(());
        }

        if intrinsics::is_quantum(callee) {
            // A deferred value reaching a gate parameter forces
            // materialization before the gate is accumulated.
            for value in &mut values {
                if !value.is_classical() {
                    *value = self.materialize(value.clone())?;
                }
            }
            let mut ctx = intrinsics::IntrinsicContext {
                heap: &mut self.heap,
                pool: &mut self.pool,
                proxy: &mut self.proxy,
                outputs: &mut self.outputs,
            };
            let result = intrinsics::call_quantum(&mut ctx, callee, &values)?;
            if let (Some(dest), Some(value)) = (dest, result) {
                self.set_local(dest, value);
            }
            return Ok(());
        }

        if intrinsics::is_runtime(callee) {
            let mut ctx = intrinsics::IntrinsicContext {
                heap: &mut self.heap,
                pool: &mut self.pool,
                proxy: &mut self.proxy,
                outputs: &mut self.outputs,
            };
            let result = intrinsics::call_runtime(&mut ctx, callee, &values)?;
            if let (Some(dest), Some(value)) = (dest, result) {
                self.set_local(dest, value);
            }
            return Ok(());
        }

        let Some(&index) = self.function_index.get(callee) else {
            return Err(Error::UndefinedSymbol(format!("@{callee}")));
        };
        if self.frames.len() >= self.config.recursion_limit {
            return Err(Error::RecursionLimit(self.config.recursion_limit));
        }
        let function = &self.module.functions[index];
        if function.params.len() != values.len() {
            return Err(Error::type_mismatch(
                format!("{} arguments to @{callee}", function.params.len()),
                values.len().to_string(),
            ));
        }
        let mut locals = FxHashMap::default();
        for (param, value) in function.params.iter().zip(values) {
            locals.insert(param.name.clone(), value);
        }
        self.frames.push(Frame {
            func: index,
            block: 0,
            prev_block: None,
            pc: 0,
            locals,
            call_dest: dest.cloned(),
        });
        Ok(())
    }

    // Control flow

    fn eval_terminator(&mut self, terminator: &Terminator) -> Result<StepOutcome, Error> {
        match terminator {
            Terminator::Ret(operand) => {
                let value = match operand {
                    Some(operand) => Some(self.eval_operand(operand)?),
                    None => None,
                };
                self.finish_frame(value)
            }
            Terminator::Br { dest } => {
                let target = self.block_target(dest)?;
                self.jump(target)
            }
            Terminator::CondBr {
                cond,
                if_true,
                if_false,
            } => {
                let value = self.eval_operand(cond)?;
                let taken = if value.is_classical() {
                    value.as_bool().map_err(|_| Error::expected("Bool", &value))?
                } else {
                    if self.config.trace_projections {
                        log::info!(
                            target: "qse::projection",
                            "branch depends on unmeasured result; forcing"
                        );
                    }
                    let value = self.materialize(value)?;
                    value.as_bool().map_err(|_| Error::expected("Bool", &value))?
                };
                if self.config.trace_projections {
                    let label = if taken { if_true } else { if_false };
                    log::info!(target: "qse::projection", "branch {taken} -> {label}");
                }
                let target = self.block_target(if taken { if_true } else { if_false })?;
                self.jump(target)
            }
            Terminator::Unreachable => Err(Error::Unsupported(
                "executing `unreachable` terminator".to_string(),
            )),
        }
    }

    fn block_target(&self, label: &Name) -> Result<usize, Error> {
        let graph = self.graphs[self.current_frame().func];
        graph
            .block_index
            .get(label)
            .copied()
            .ok_or_else(|| Error::UndefinedSymbol(format!("block {label}")))
    }

    fn jump(&mut self, target: usize) -> Result<StepOutcome, Error> {
        {
            let frame = self.current_frame_mut();
            frame.prev_block = Some(frame.block);
            frame.block = target;
            frame.pc = 0;
        }
        let func = self.current_frame().func;
        if self.graphs[func].blocks[target].loop_header {
            if let Some(fingerprint) = self.fingerprint() {
                let key = CacheKey {
                    func,
                    block: target,
                    fingerprint,
                };
                let hit = self.cache.get(&key).cloned();
                if let Some(entry) = hit {
                    if self.config.trace_projections {
                        log::info!(
                            target: "qse::projection",
                            "projection cache hit at {}; replaying tail",
                            self.graphs[func].blocks[target].name
                        );
                    }
                    self.proxy.extend(&entry.ops);
                    return self.finish_frame(entry.value);
                }
                if self.recordings.len() < MAX_RECORDINGS {
                    self.recordings.push(Recording {
                        key,
                        depth: self.frames.len(),
                        ops_start: self.proxy.ops().len(),
                        clears: self.proxy.clears(),
                        churn: self.pool.churn(),
                        allocations: self.heap.allocations(),
                        measured: self.proxy.measured(),
                        outputs_len: self.outputs.len(),
                    });
                }
            }
        }
        Ok(None)
    }

    /// Fingerprint of the classical SSA environment at the current point.
    /// `None` when a deferred value is live (the cache does not apply).
    fn fingerprint(&self) -> Option<u64> {
        let frame = self.current_frame();
        let mut entries: Vec<(&Name, &Value)> = frame.locals.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        let mut hasher = FxHasher::default();
        frame.prev_block.hash(&mut hasher);
        for (name, value) in entries {
            name.hash(&mut hasher);
            if !value.fingerprint(&mut hasher) {
                return None;
            }
        }
        Some(hasher.finish())
    }

    fn finish_frame(&mut self, value: Option<Value>) -> Result<StepOutcome, Error> {
        let depth = self.frames.len();
        let recordings = std::mem::take(&mut self.recordings);
        for recording in recordings {
            if recording.depth == depth {
                self.finalize_recording(recording, value.as_ref());
            } else if recording.depth < depth {
                self.recordings.push(recording);
            }
        }

        let frame = self.frames.pop().expect("engine should have a frame");
        if self.frames.is_empty() {
            return Ok(Some(value));
        }
        if let Some(dest) = frame.call_dest {
            let value = value.unwrap_or(Value::Null);
            self.set_local(&dest, value);
        }
        Ok(None)
    }

    /// Installs a cache entry for a completed loop-header tail, if the tail
    /// is replayable: no builder flush, no qubit churn, no heap allocation,
    /// no measurements, no recorded output, and a classical return value.
    fn finalize_recording(&mut self, recording: Recording, value: Option<&Value>) {
        let replayable = self.proxy.clears() == recording.clears
            && self.pool.churn() == recording.churn
            && self.heap.allocations() == recording.allocations
            && self.proxy.measured() == recording.measured
            && self.outputs.len() == recording.outputs_len
            && value.map_or(true, Value::is_classical);
        if !replayable {
            return;
        }
        let ops = self.proxy.ops()[recording.ops_start..].to_vec();
        self.cache.insert(
            recording.key,
            CacheEntry {
                ops,
                value: value.cloned(),
            },
        );
    }

    // Forcing and materialization

    fn flush_and_execute(&mut self) -> Result<Distribution, Error> {
        let mut builder: Box<dyn Builder> = self.backend.create_builder();
        if self.config.trace_projections {
            builder = Box::new(LoggingBuilder::new(builder));
        }
        self.proxy.flush_into(&mut *builder);
        let distribution = self
            .backend
            .execute(&mut *builder)
            .map_err(Error::BackendFailure)?;
        self.executions += 1;
        Ok(distribution)
    }

    /// Flushes the accumulated circuit, executes it, and projects every
    /// pending measured result from the distribution's per-position
    /// majority bit.
    fn force(&mut self) -> Result<(), Error> {
        let distribution = self.flush_and_execute()?;
        for (id, position) in self.heap.pending_positioned_results() {
            let bit = majority_bit(&distribution, position);
            self.heap.set_result_state(
                id,
                if bit {
                    ResultState::One
                } else {
                    ResultState::Zero
                },
            )?;
            if self.config.trace_projections {
                log::info!(
                    target: "qse::projection",
                    "materialized Result{} = {}",
                    id.0,
                    u8::from(bit)
                );
            }
        }
        self.proxy.clear();
        self.last_distribution = Some(distribution);
        Ok(())
    }

    /// A result operand; opaque-pointer modules encode static results as
    /// bare integers or null.
    fn coerce_result(&mut self, value: &Value) -> Result<ResultId, Error> {
        match value {
            Value::Result(id) => Ok(*id),
            Value::Null => Ok(self.heap.ensure_static_result(0)),
            Value::Int { value, .. } if *value >= 0 => {
                #[allow(clippy::cast_sign_loss)]
                let id = *value as usize;
                Ok(self.heap.ensure_static_result(id))
            }
            other => Err(Error::expected("Result", other)),
        }
    }

    /// The concrete outcome bit of a result handle, forcing if necessary.
    fn result_bit(&mut self, id: ResultId) -> Result<bool, Error> {
        match self.heap.result_state(id)? {
            ResultState::Zero => Ok(false),
            ResultState::One => Ok(true),
            ResultState::Pending {
                position: Some(_),
            } => {
                self.force()?;
                match self.heap.result_state(id)? {
                    ResultState::Zero => Ok(false),
                    ResultState::One => Ok(true),
                    ResultState::Pending { .. } => {
                        self.heap.set_result_state(id, ResultState::Zero)?;
                        Ok(false)
                    }
                }
            }
            ResultState::Pending { position: None } => {
                log::warn!("materializing a result that was never measured; defaulting to Zero");
                self.heap.set_result_state(id, ResultState::Zero)?;
                Ok(false)
            }
        }
    }

    /// Resolves a deferred value to a classical one, forcing pending
    /// results as needed.
    fn materialize(&mut self, value: Value) -> Result<Value, Error> {
        match value {
            Value::Deferred(_) => {
                let mut ids = Vec::new();
                value.collect_deferred_results(&mut ids);
                for id in ids {
                    let _ = self.result_bit(id)?;
                }
                self.resolve(&value)
            }
            other => Ok(other),
        }
    }

    /// Folds a value whose result leaves are all materialized.
    fn resolve(&mut self, value: &Value) -> Result<Value, Error> {
        let Value::Deferred(expr) = value else {
            return Ok(value.clone());
        };
        match expr.as_ref() {
            DeferredExpr::Result(id) => Ok(Value::Bool(self.result_bit(*id)?)),
            DeferredExpr::Binary { op, lhs, rhs } => {
                let lhs = self.resolve(lhs)?;
                let rhs = self.resolve(rhs)?;
                fold_binary(*op, &lhs, &rhs)
            }
            DeferredExpr::Compare { pred, lhs, rhs } => {
                let lhs = self.resolve(lhs)?;
                let rhs = self.resolve(rhs)?;
                fold_icmp(*pred, &lhs, &rhs)
            }
            DeferredExpr::Cast { op, to, value } => {
                let inner = self.resolve(value)?;
                let source_ty = Ty::Int {
                    width: value_width(&inner),
                };
                fold_cast(*op, &source_ty, to, &inner)
            }
            DeferredExpr::Select {
                cond,
                if_true,
                if_false,
            } => {
                let cond = self.resolve(cond)?;
                if cond.as_bool().map_err(|_| Error::expected("Bool", &cond))? {
                    self.resolve(if_true)
                } else {
                    self.resolve(if_false)
                }
            }
        }
    }

    // Entry and exit plumbing

    fn bind_args(
        &mut self,
        entry_index: usize,
        args: &[HostValue],
    ) -> Result<FxHashMap<Name, Value>, Error> {
        let function = &self.module.functions[entry_index];
        if function.params.len() != args.len() {
            return Err(Error::type_mismatch(
                format!("{} entry arguments", function.params.len()),
                args.len().to_string(),
            ));
        }
        let mut locals = FxHashMap::default();
        for (param, arg) in function.params.iter().zip(args) {
            let value = match (&param.ty, arg) {
                (Ty::Int { width: 1 }, HostValue::Bool(b)) => Value::Bool(*b),
                (Ty::Int { width }, HostValue::Int(i)) => Value::int(*width, *i),
                (Ty::Double, HostValue::Double(d)) => Value::Double(*d),
                (ty, HostValue::String(s)) if is_string_like(ty) => {
                    Value::String(self.heap.alloc_string(s.clone().into_bytes()))
                }
                (ty, arg) => {
                    return Err(Error::type_mismatch(
                        format!("entry argument of type {ty}"),
                        format!("{arg:?}"),
                    ))
                }
            };
            locals.insert(param.name.clone(), value);
        }
        Ok(locals)
    }

    fn marshal_return(&mut self, value: Value) -> Result<Option<HostValue>, Error> {
        match value {
            Value::Int { value, .. } => Ok(Some(HostValue::Int(value))),
            Value::Double(d) => Ok(Some(HostValue::Double(d))),
            Value::Bool(b) => Ok(Some(HostValue::Bool(b))),
            Value::Result(id) => Ok(Some(HostValue::Bool(self.result_bit(id)?))),
            Value::String(id) => {
                let text = String::from_utf8_lossy(self.heap.string(id)?)
                    .trim_end_matches('\0')
                    .to_string();
                Ok(Some(HostValue::String(text)))
            }
            Value::Deferred(_) => {
                let value = self.materialize(value)?;
                self.marshal_return(value)
            }
            Value::Null => Ok(None),
            other => Err(Error::expected("primitive return value", &other)),
        }
    }

    fn into_outcome(mut self, returned: Option<Value>) -> Result<RunOutcome, Error> {
        let value = match returned {
            Some(value) => self.marshal_return(value)?,
            None => None,
        };

        // Gates may still be pending after the entry returns; realize them
        // with one final execution so their measurements are observable.
        let final_distribution = if self.proxy.is_empty() {
            self.last_distribution.clone()
        } else {
            let distribution = self.flush_and_execute()?;
            Some(distribution)
        };

        let mut output_bits = Vec::with_capacity(self.outputs.len());
        for record in &self.outputs {
            let bit = match self.heap.result_state(record.result)? {
                ResultState::Zero => OutputBit::Known(false),
                ResultState::One => OutputBit::Known(true),
                ResultState::Pending {
                    position: Some(position),
                } => OutputBit::Position(position),
                ResultState::Pending { position: None } => {
                    log::warn!(
                        "recorded output Result{} was never measured; reporting Zero",
                        record.result.0
                    );
                    OutputBit::Known(false)
                }
            };
            output_bits.push(bit);
        }

        let leaked_entries = self
            .heap
            .live_entries()
            .into_iter()
            .filter(|entry| !(entry.kind == "string" && self.interned_ids.contains(&entry.id)))
            .map(|entry| format!("{} {} (refcount {})", entry.kind, entry.id, entry.refcount))
            .collect();

        Ok(RunOutcome {
            value,
            output_bits,
            final_distribution,
            executions: self.executions,
            qubits_used: self.pool.high_water() as u64,
            leaked_qubits: self.pool.leaked(),
            leaked_entries,
        })
    }
}

fn is_string_like(ty: &Ty) -> bool {
    ty.is_string_ptr()
        || matches!(ty.pointee(), Some(Ty::Int { width: 8 }))
}

fn value_width(value: &Value) -> u32 {
    match value {
        Value::Int { width, .. } => *width,
        Value::Bool(_) => 1,
        _ => 64,
    }
}

// Classical folding

fn fold_binary(op: BinaryOp, lhs: &Value, rhs: &Value) -> Result<Value, Error> {
    if matches!(
        op,
        BinaryOp::FAdd | BinaryOp::FSub | BinaryOp::FMul | BinaryOp::FDiv
    ) {
        let a = lhs.as_double().map_err(|_| Error::expected("Double", lhs))?;
        let b = rhs.as_double().map_err(|_| Error::expected("Double", rhs))?;
        let value = match op {
            BinaryOp::FAdd => a + b,
            BinaryOp::FSub => a - b,
            BinaryOp::FMul => a * b,
            _ => a / b,
        };
        return Ok(Value::Double(value));
    }

    let width = value_width(lhs).max(value_width(rhs));
    let a = lhs.as_int().map_err(|_| Error::expected("Int", lhs))?;
    let b = rhs.as_int().map_err(|_| Error::expected("Int", rhs))?;
    let nonzero = |value: i64| -> Result<i64, Error> {
        if value == 0 {
            Err(Error::type_mismatch("nonzero divisor", "0"))
        } else {
            Ok(value)
        }
    };
    #[allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)]
    let value = match op {
        BinaryOp::Add => a.wrapping_add(b),
        BinaryOp::Sub => a.wrapping_sub(b),
        BinaryOp::Mul => a.wrapping_mul(b),
        BinaryOp::SDiv => a.wrapping_div(nonzero(b)?),
        BinaryOp::SRem => a.wrapping_rem(nonzero(b)?),
        BinaryOp::UDiv => {
            let b = nonzero(b)?;
            (to_unsigned(width, a) / to_unsigned(width, b)) as i64
        }
        BinaryOp::URem => {
            let b = nonzero(b)?;
            (to_unsigned(width, a) % to_unsigned(width, b)) as i64
        }
        BinaryOp::And => a & b,
        BinaryOp::Or => a | b,
        BinaryOp::Xor => a ^ b,
        BinaryOp::Shl => a.wrapping_shl(to_unsigned(width, b) as u32),
        BinaryOp::LShr => (to_unsigned(width, a) >> (to_unsigned(width, b) % 64)) as i64,
        BinaryOp::AShr => normalize(width, a) >> (to_unsigned(width, b) % 64),
        BinaryOp::FAdd | BinaryOp::FSub | BinaryOp::FMul | BinaryOp::FDiv => unreachable!(),
    };
    Ok(Value::int(width, value))
}

fn fold_icmp(pred: IntPredicate, lhs: &Value, rhs: &Value) -> Result<Value, Error> {
    // Handle comparisons on pointers (handles) support equality only.
    let handle_ids = |value: &Value| -> Option<(u8, usize)> {
        match value {
            Value::Qubit(q) => Some((1, q.0)),
            Value::Result(r) => Some((2, r.0)),
            Value::Array(a) => Some((3, a.0)),
            Value::Tuple(t) => Some((4, t.0)),
            Value::String(s) => Some((5, s.0)),
            Value::Null => Some((0, 0)),
            _ => None,
        }
    };
    if let (Some(a), Some(b)) = (handle_ids(lhs), handle_ids(rhs)) {
        return match pred {
            IntPredicate::EQ => Ok(Value::Bool(a == b)),
            IntPredicate::NE => Ok(Value::Bool(a != b)),
            _ => Err(Error::type_mismatch(
                "equality comparison on handles",
                pred.to_string(),
            )),
        };
    }

    let width = value_width(lhs).max(value_width(rhs));
    let a = lhs.as_int().map_err(|_| Error::expected("Int", lhs))?;
    let b = rhs.as_int().map_err(|_| Error::expected("Int", rhs))?;
    let (ua, ub) = (to_unsigned(width, a), to_unsigned(width, b));
    let result = match pred {
        IntPredicate::EQ => a == b,
        IntPredicate::NE => a != b,
        IntPredicate::SGT => a > b,
        IntPredicate::SGE => a >= b,
        IntPredicate::SLT => a < b,
        IntPredicate::SLE => a <= b,
        IntPredicate::UGT => ua > ub,
        IntPredicate::UGE => ua >= ub,
        IntPredicate::ULT => ua < ub,
        IntPredicate::ULE => ua <= ub,
    };
    Ok(Value::Bool(result))
}

fn fold_fcmp(pred: FPPredicate, lhs: &Value, rhs: &Value) -> Result<Value, Error> {
    let a = lhs.as_double().map_err(|_| Error::expected("Double", lhs))?;
    let b = rhs.as_double().map_err(|_| Error::expected("Double", rhs))?;
    let unordered = a.is_nan() || b.is_nan();
    let result = match pred {
        FPPredicate::False => false,
        FPPredicate::True => true,
        FPPredicate::ORD => !unordered,
        FPPredicate::UNO => unordered,
        FPPredicate::OEQ => !unordered && a == b,
        FPPredicate::OGT => !unordered && a > b,
        FPPredicate::OGE => !unordered && a >= b,
        FPPredicate::OLT => !unordered && a < b,
        FPPredicate::OLE => !unordered && a <= b,
        FPPredicate::ONE => !unordered && a != b,
        FPPredicate::UEQ => unordered || a == b,
        FPPredicate::UGT => unordered || a > b,
        FPPredicate::UGE => unordered || a >= b,
        FPPredicate::ULT => unordered || a < b,
        FPPredicate::ULE => unordered || a <= b,
        FPPredicate::UNE => unordered || a != b,
    };
    Ok(Value::Bool(result))
}

fn fold_cast(op: CastOp, from: &Ty, to: &Ty, value: &Value) -> Result<Value, Error> {
    let to_width = match to {
        Ty::Int { width } => *width,
        Ty::Double => 64,
        _ => {
            return Err(Error::Unsupported(format!(
                "cast {op} to {to}"
            )))
        }
    };
    match op {
        CastOp::BitCast => Ok(value.clone()),
        CastOp::ZExt => {
            let from_width = match from {
                Ty::Int { width } => *width,
                _ => value_width(value),
            };
            let raw = value.as_int().map_err(|_| Error::expected("Int", value))?;
            #[allow(clippy::cast_possible_wrap)]
            let widened = to_unsigned(from_width, raw) as i64;
            Ok(Value::int(to_width, widened))
        }
        CastOp::SExt | CastOp::Trunc => {
            let raw = value.as_int().map_err(|_| Error::expected("Int", value))?;
            Ok(Value::int(to_width, raw))
        }
        CastOp::PtrToInt => {
            let id = match value {
                Value::Qubit(q) => q.0,
                Value::Result(r) => r.0,
                Value::Null => 0,
                other => return Err(Error::expected("pointer", other)),
            };
            #[allow(clippy::cast_possible_wrap)]
            let raw = id as i64;
            Ok(Value::int(to_width, raw))
        }
        #[allow(clippy::cast_possible_truncation)]
        CastOp::FPToSI => {
            let raw = value
                .as_double()
                .map_err(|_| Error::expected("Double", value))?;
            Ok(Value::int(to_width, raw as i64))
        }
        #[allow(clippy::cast_precision_loss)]
        CastOp::SIToFP => {
            let raw = value.as_int().map_err(|_| Error::expected("Int", value))?;
            Ok(Value::Double(raw as f64))
        }
        CastOp::IntToPtr => Err(Error::Unsupported(
            "inttoptr on a deferred value".to_string(),
        )),
    }
}
