// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The `__quantum__qis__*` gate dispatch and the `__quantum__rt__*` runtime
//! table. Gate intrinsics never evaluate anything; they lower to primitive
//! rotations in the builder proxy. Runtime intrinsics mutate the heap and
//! qubit pool.
//!
//! `__quantum__rt__result_equal` is absent here on purpose: comparing two
//! results forces materialization, which needs the backend, so the engine
//! handles it directly.

use crate::builder::BuilderProxy;
use crate::heap::{Heap, QubitPool, ResultState};
use crate::val::{DeferredExpr, Value};
use crate::{Error, OutputRecord};
use std::rc::Rc;

const QIS_PREFIX: &str = "__quantum__qis__";
const RT_PREFIX: &str = "__quantum__rt__";

pub(crate) fn is_quantum(name: &str) -> bool {
    name.starts_with(QIS_PREFIX)
}

pub(crate) fn is_runtime(name: &str) -> bool {
    name.starts_with(RT_PREFIX)
}

/// Mutable engine state the intrinsic table operates on.
pub(crate) struct IntrinsicContext<'e> {
    pub heap: &'e mut Heap,
    pub pool: &'e mut QubitPool,
    pub proxy: &'e mut BuilderProxy,
    pub outputs: &'e mut Vec<OutputRecord>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Variant {
    Body,
    Adj,
    Ctl,
    CtlAdj,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Axis {
    X,
    Y,
    Z,
}

fn split_gate_name(name: &str) -> Result<(&str, Variant), Error> {
    let rest = &name[QIS_PREFIX.len()..];
    let (gate, variant) = rest
        .rsplit_once("__")
        .ok_or_else(|| Error::Unsupported(format!("intrinsic `{name}`")))?;
    let variant = match variant {
        "body" => Variant::Body,
        "adj" => Variant::Adj,
        "ctl" => Variant::Ctl,
        "ctladj" => Variant::CtlAdj,
        _ => return Err(Error::Unsupported(format!("intrinsic `{name}`"))),
    };
    Ok((gate, variant))
}

impl IntrinsicContext<'_> {
    fn type_mismatch(expected: &str, value: &Value) -> Error {
        Error::TypeMismatch {
            expected: expected.to_string(),
            found: value.type_name().to_string(),
        }
    }

    /// A qubit operand. Opaque-pointer modules encode static qubits as bare
    /// integers or null, so those coerce here.
    #[allow(clippy::cast_sign_loss)]
    fn qubit_arg(&mut self, value: &Value) -> Result<usize, Error> {
        let id = match value {
            Value::Qubit(q) => {
                self.pool.assert_live(q.0)?;
                return Ok(q.0);
            }
            Value::Null => 0,
            Value::Int { value, .. } if *value >= 0 => *value as usize,
            other => return Err(Self::type_mismatch("Qubit", other)),
        };
        self.pool.touch_literal(id);
        Ok(id)
    }

    /// A result operand, with the same opaque-pointer coercion as
    /// [`Self::qubit_arg`].
    fn result_arg(&mut self, value: &Value) -> Result<crate::val::ResultId, Error> {
        match value {
            Value::Result(r) => Ok(*r),
            Value::Null => Ok(self.heap.ensure_static_result(0)),
            Value::Int { value, .. } if *value >= 0 => {
                #[allow(clippy::cast_sign_loss)]
                let id = *value as usize;
                Ok(self.heap.ensure_static_result(id))
            }
            other => Err(Self::type_mismatch("Result", other)),
        }
    }

    fn double_arg(value: &Value) -> Result<f64, Error> {
        value
            .as_double()
            .map_err(|_| Self::type_mismatch("Double", value))
    }

    fn control_args(&mut self, value: &Value) -> Result<Vec<usize>, Error> {
        let array = value
            .as_array()
            .map_err(|_| Self::type_mismatch("Array of controls", value))?;
        let elements = self.heap.array(array)?.elements.clone();
        let mut controls = Vec::with_capacity(elements.len());
        for element in &elements {
            controls.push(self.qubit_arg(element)?);
        }
        Ok(controls)
    }

    /// Unpacks the `(double, qubit)` tuple a controlled rotation receives.
    fn rotation_tuple(&mut self, value: &Value) -> Result<(f64, usize), Error> {
        let tuple = value
            .as_tuple()
            .map_err(|_| Self::type_mismatch("rotation Tuple", value))?;
        let theta = Self::double_arg(&self.heap.tuple_get(tuple, 0)?)?;
        let qubit = self.qubit_arg(&self.heap.tuple_get(tuple, 1)?)?;
        Ok((theta, qubit))
    }

    fn rotate(&mut self, axis: Axis, controls: &[usize], qubit: usize, theta: f64) {
        if controls.is_empty() {
            match axis {
                Axis::X => self.proxy.x(qubit, theta),
                Axis::Y => self.proxy.y(qubit, theta),
                Axis::Z => self.proxy.z(qubit, theta),
            }
        } else {
            let controls = controls.to_vec();
            match axis {
                Axis::X => self.proxy.cx(controls, qubit, theta),
                Axis::Y => self.proxy.cy(controls, qubit, theta),
                Axis::Z => self.proxy.cz(controls, qubit, theta),
            }
        }
    }

    /// `H` lowers to a z rotation by pi and a y rotation by pi/2; controls
    /// ride along on both halves. H is self-inverse, so the adjoint is the
    /// same sequence.
    fn hadamard(&mut self, controls: &[usize], qubit: usize) {
        self.rotate(Axis::Z, controls, qubit, std::f64::consts::PI);
        self.rotate(Axis::Y, controls, qubit, std::f64::consts::FRAC_PI_2);
    }

    fn measure(&mut self, qubit: usize) -> ResultState {
        let position = self.proxy.measure(qubit);
        ResultState::Pending {
            position: Some(position),
        }
    }

    fn label_of(&mut self, value: &Value) -> Result<Option<Rc<str>>, Error> {
        match value {
            Value::Null => Ok(None),
            Value::String(id) => {
                let bytes = self.heap.string(*id)?;
                let text = String::from_utf8_lossy(bytes);
                Ok(Some(text.trim_end_matches('\0').into()))
            }
            other => Err(Self::type_mismatch("label string", other)),
        }
    }
}

/// Dispatches a `__quantum__qis__*` intrinsic.
///
/// Angles must already be classical; the engine materializes deferred values
/// before any of them can reach a gate parameter.
pub(crate) fn call_quantum(
    ctx: &mut IntrinsicContext,
    name: &str,
    args: &[Value],
) -> Result<Option<Value>, Error> {
    let (gate, variant) = split_gate_name(name)?;
    let adjoint = matches!(variant, Variant::Adj | Variant::CtlAdj);
    let controlled = matches!(variant, Variant::Ctl | Variant::CtlAdj);

    let arity = |expected: usize| -> Result<(), Error> {
        if args.len() == expected {
            Ok(())
        } else {
            Err(Error::TypeMismatch {
                expected: format!("{expected} arguments to {name}"),
                found: format!("{}", args.len()),
            })
        }
    };

    match gate {
        // Pauli rotations by pi; all self-inverse, so adjoint is identity on
        // the lowering.
        "x" | "y" | "z" => {
            let axis = match gate {
                "x" => Axis::X,
                "y" => Axis::Y,
                _ => Axis::Z,
            };
            let (controls, target) = if controlled {
                arity(2)?;
                (ctx.control_args(&args[0])?, ctx.qubit_arg(&args[1])?)
            } else {
                arity(1)?;
                (Vec::new(), ctx.qubit_arg(&args[0])?)
            };
            ctx.rotate(axis, &controls, target, std::f64::consts::PI);
            Ok(None)
        }
        "h" => {
            let (controls, target) = if controlled {
                arity(2)?;
                (ctx.control_args(&args[0])?, ctx.qubit_arg(&args[1])?)
            } else {
                arity(1)?;
                (Vec::new(), ctx.qubit_arg(&args[0])?)
            };
            ctx.hadamard(&controls, target);
            Ok(None)
        }
        "s" | "t" => {
            let base = if gate == "s" {
                std::f64::consts::FRAC_PI_2
            } else {
                std::f64::consts::FRAC_PI_4
            };
            let theta = if adjoint { -base } else { base };
            let (controls, target) = if controlled {
                arity(2)?;
                (ctx.control_args(&args[0])?, ctx.qubit_arg(&args[1])?)
            } else {
                arity(1)?;
                (Vec::new(), ctx.qubit_arg(&args[0])?)
            };
            ctx.rotate(Axis::Z, &controls, target, theta);
            Ok(None)
        }
        "rx" | "ry" | "rz" => {
            let axis = match gate {
                "rx" => Axis::X,
                "ry" => Axis::Y,
                _ => Axis::Z,
            };
            let (controls, theta, target) = if controlled {
                arity(2)?;
                let controls = ctx.control_args(&args[0])?;
                let (theta, target) = ctx.rotation_tuple(&args[1])?;
                (controls, theta, target)
            } else {
                arity(2)?;
                let theta = IntrinsicContext::double_arg(&args[0])?;
                let target = ctx.qubit_arg(&args[1])?;
                (Vec::new(), theta, target)
            };
            let theta = if adjoint { -theta } else { theta };
            ctx.rotate(axis, &controls, target, theta);
            Ok(None)
        }
        "cnot" | "cx" => {
            arity(2)?;
            let control = ctx.qubit_arg(&args[0])?;
            let target = ctx.qubit_arg(&args[1])?;
            ctx.rotate(Axis::X, &[control], target, std::f64::consts::PI);
            Ok(None)
        }
        // Routed with z-axis semantics; one path in the original sent this
        // through the x axis, which was a transcription slip.
        "cz" => {
            arity(2)?;
            let control = ctx.qubit_arg(&args[0])?;
            let target = ctx.qubit_arg(&args[1])?;
            ctx.rotate(Axis::Z, &[control], target, std::f64::consts::PI);
            Ok(None)
        }
        "swap" => {
            arity(2)?;
            let a = ctx.qubit_arg(&args[0])?;
            let b = ctx.qubit_arg(&args[1])?;
            ctx.proxy.swap(a, b);
            Ok(None)
        }
        "reset" => {
            arity(1)?;
            let qubit = ctx.qubit_arg(&args[0])?;
            ctx.proxy.reset(qubit);
            Ok(None)
        }
        "mz" => {
            arity(2)?;
            let qubit = ctx.qubit_arg(&args[0])?;
            let result = ctx.result_arg(&args[1])?;
            let state = ctx.measure(qubit);
            ctx.heap.set_result_state(result, state)?;
            Ok(None)
        }
        "m" | "measure" => {
            arity(1)?;
            let qubit = ctx.qubit_arg(&args[0])?;
            let state = ctx.measure(qubit);
            let result = ctx.heap.alloc_result(state);
            Ok(Some(Value::Result(result)))
        }
        "read_result" => {
            arity(1)?;
            let result = ctx.result_arg(&args[0])?;
            match ctx.heap.result_state(result)? {
                ResultState::Zero => Ok(Some(Value::Bool(false))),
                ResultState::One => Ok(Some(Value::Bool(true))),
                ResultState::Pending { .. } => Ok(Some(Value::Deferred(Rc::new(
                    DeferredExpr::Result(result),
                )))),
            }
        }
        _ => Err(Error::Unsupported(format!("intrinsic `{name}`"))),
    }
}

/// Dispatches a `__quantum__rt__*` intrinsic.
#[allow(clippy::too_many_lines)]
pub(crate) fn call_runtime(
    ctx: &mut IntrinsicContext,
    name: &str,
    args: &[Value],
) -> Result<Option<Value>, Error> {
    let int_arg = |value: &Value| -> Result<i64, Error> {
        value
            .as_int()
            .map_err(|_| IntrinsicContext::type_mismatch("Int", value))
    };

    let min_arity: usize = match name {
        "__quantum__rt__qubit_allocate"
        | "__quantum__rt__result_get_zero"
        | "__quantum__rt__result_get_one"
        | "__quantum__rt__tuple_create"
        | "__quantum__rt__array_record_output"
        | "__quantum__rt__tuple_record_output" => 0,
        "__quantum__rt__qubit_allocate_array"
        | "__quantum__rt__qubit_release"
        | "__quantum__rt__qubit_release_array"
        | "__quantum__rt__array_get_size_1d"
        | "__quantum__rt__string_create"
        | "__quantum__rt__message" => 1,
        _ => 2,
    };
    if args.len() < min_arity {
        return Err(Error::TypeMismatch {
            expected: format!("{min_arity} arguments to {name}"),
            found: format!("{}", args.len()),
        });
    }

    match name {
        "__quantum__rt__qubit_allocate" => {
            let id = ctx.pool.allocate()?;
            Ok(Some(Value::Qubit(crate::val::QubitRef(id))))
        }
        "__quantum__rt__qubit_allocate_array" => {
            let count = usize::try_from(int_arg(&args[0])?).map_err(|_| Error::TypeMismatch {
                expected: "non-negative qubit count".to_string(),
                found: args[0].to_string(),
            })?;
            let array = ctx.heap.alloc_array(8, count);
            for index in 0..count {
                let id = ctx.pool.allocate()?;
                ctx.heap
                    .array_set(array, index, Value::Qubit(crate::val::QubitRef(id)))?;
            }
            Ok(Some(Value::Array(array)))
        }
        "__quantum__rt__qubit_release" => {
            let qubit = args[0]
                .as_qubit()
                .map_err(|_| IntrinsicContext::type_mismatch("Qubit", &args[0]))?;
            ctx.pool.release(qubit.0)?;
            Ok(None)
        }
        "__quantum__rt__qubit_release_array" => {
            let array = args[0]
                .as_array()
                .map_err(|_| IntrinsicContext::type_mismatch("Array", &args[0]))?;
            let elements = ctx.heap.array(array)?.elements.clone();
            for element in &elements {
                let qubit = element
                    .as_qubit()
                    .map_err(|_| IntrinsicContext::type_mismatch("Qubit", element))?;
                ctx.pool.release(qubit.0)?;
            }
            ctx.heap.update_array_refcount(array, -1)?;
            Ok(None)
        }
        "__quantum__rt__array_create_1d" => {
            let elem_size = u64::try_from(int_arg(&args[0])?).unwrap_or(0);
            let length = usize::try_from(int_arg(&args[1])?).map_err(|_| Error::TypeMismatch {
                expected: "non-negative array length".to_string(),
                found: args[1].to_string(),
            })?;
            Ok(Some(Value::Array(ctx.heap.alloc_array(elem_size, length))))
        }
        "__quantum__rt__array_get_element_ptr_1d" => {
            let array = args[0]
                .as_array()
                .map_err(|_| IntrinsicContext::type_mismatch("Array", &args[0]))?;
            let index = usize::try_from(int_arg(&args[1])?).map_err(|_| Error::TypeMismatch {
                expected: "non-negative index".to_string(),
                found: args[1].to_string(),
            })?;
            Ok(Some(Value::Pointer(crate::val::Pointer::ArrayElement(
                array, index,
            ))))
        }
        "__quantum__rt__array_get_size_1d" => {
            let array = args[0]
                .as_array()
                .map_err(|_| IntrinsicContext::type_mismatch("Array", &args[0]))?;
            let len = ctx.heap.array(array)?.elements.len();
            Ok(Some(Value::Int {
                width: 64,
                value: i64::try_from(len).unwrap_or(i64::MAX),
            }))
        }
        "__quantum__rt__array_concatenate" => {
            let a = args[0]
                .as_array()
                .map_err(|_| IntrinsicContext::type_mismatch("Array", &args[0]))?;
            let b = args[1]
                .as_array()
                .map_err(|_| IntrinsicContext::type_mismatch("Array", &args[1]))?;
            Ok(Some(Value::Array(ctx.heap.array_concat(a, b)?)))
        }
        "__quantum__rt__array_update_reference_count" => {
            let array = args[0]
                .as_array()
                .map_err(|_| IntrinsicContext::type_mismatch("Array", &args[0]))?;
            ctx.heap.update_array_refcount(array, int_arg(&args[1])?)?;
            Ok(None)
        }
        "__quantum__rt__array_update_alias_count" => {
            let array = args[0]
                .as_array()
                .map_err(|_| IntrinsicContext::type_mismatch("Array", &args[0]))?;
            ctx.heap.update_array_alias(array, int_arg(&args[1])?)?;
            Ok(None)
        }
        "__quantum__rt__tuple_create" => Ok(Some(Value::Tuple(ctx.heap.alloc_tuple()))),
        "__quantum__rt__tuple_update_reference_count" => {
            let tuple = args[0]
                .as_tuple()
                .map_err(|_| IntrinsicContext::type_mismatch("Tuple", &args[0]))?;
            ctx.heap.update_tuple_refcount(tuple, int_arg(&args[1])?)?;
            Ok(None)
        }
        "__quantum__rt__tuple_update_alias_count" => {
            let tuple = args[0]
                .as_tuple()
                .map_err(|_| IntrinsicContext::type_mismatch("Tuple", &args[0]))?;
            ctx.heap.update_tuple_alias(tuple, int_arg(&args[1])?)?;
            Ok(None)
        }
        "__quantum__rt__result_get_zero" => Ok(Some(Value::Result(
            ctx.heap.alloc_result(ResultState::Zero),
        ))),
        "__quantum__rt__result_get_one" => Ok(Some(Value::Result(
            ctx.heap.alloc_result(ResultState::One),
        ))),
        "__quantum__rt__result_update_reference_count" => {
            let result = ctx.result_arg(&args[0])?;
            ctx.heap.update_result_refcount(result, int_arg(&args[1])?)?;
            Ok(None)
        }
        "__quantum__rt__result_record_output" => {
            let result = ctx.result_arg(&args[0])?;
            let label = ctx.label_of(&args[1])?;
            ctx.outputs.push(OutputRecord { result, label });
            Ok(None)
        }
        // Grouping markers in base-profile output; the bitstring shape
        // carries the same information.
        "__quantum__rt__array_record_output" | "__quantum__rt__tuple_record_output" => Ok(None),
        "__quantum__rt__string_create" => {
            let bytes = match &args[0] {
                Value::String(id) => ctx.heap.string(*id)?.to_vec(),
                Value::Null => Vec::new(),
                other => return Err(IntrinsicContext::type_mismatch("byte string", other)),
            };
            Ok(Some(Value::String(ctx.heap.alloc_string(bytes))))
        }
        "__quantum__rt__string_update_reference_count" => {
            let string = args[0]
                .as_string()
                .map_err(|_| IntrinsicContext::type_mismatch("String", &args[0]))?;
            ctx.heap.update_string_refcount(string, int_arg(&args[1])?)?;
            Ok(None)
        }
        "__quantum__rt__message" => {
            let text = match &args[0] {
                Value::String(id) => String::from_utf8_lossy(ctx.heap.string(*id)?)
                    .trim_end_matches('\0')
                    .to_string(),
                other => return Err(IntrinsicContext::type_mismatch("String", other)),
            };
            log::info!(target: "qse::runtime", "{text}");
            Ok(None)
        }
        _ => Err(Error::Unsupported(format!("intrinsic `{name}`"))),
    }
}
