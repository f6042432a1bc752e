// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use qse_llvm::instruction::{BinaryOp, CastOp};
use qse_llvm::{IntPredicate, Ty};
use std::fmt::{self, Display, Formatter};
use std::hash::{Hash, Hasher};
use std::rc::Rc;

/// A logical qubit id.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct QubitRef(pub usize);

/// A handle to a measurement outcome. The outcome itself lives in the heap's
/// result table and stays pending until projected from a distribution.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ResultId(pub usize);

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ArrayId(pub usize);

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct TupleId(pub usize);

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct StringId(pub usize);

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct SlotId(pub usize);

/// An SSA location: where a pointer value leads.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Pointer {
    /// An `alloca` slot.
    Slot(SlotId),
    ArrayElement(ArrayId, usize),
    TupleElement(TupleId, usize),
}

/// The tagged value domain of the projection engine.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Int { width: u32, value: i64 },
    Double(f64),
    Bool(bool),
    Qubit(QubitRef),
    Result(ResultId),
    Array(ArrayId),
    Tuple(TupleId),
    String(StringId),
    Pointer(Pointer),
    Null,
    /// A classical value that depends on a not-yet-materialized result.
    Deferred(Rc<DeferredExpr>),
}

/// An unresolved symbolic expression over pending measurement results.
#[derive(Clone, Debug, PartialEq)]
pub enum DeferredExpr {
    /// The result's outcome read as a boolean.
    Result(ResultId),
    Binary {
        op: BinaryOp,
        lhs: Value,
        rhs: Value,
    },
    Compare {
        pred: IntPredicate,
        lhs: Value,
        rhs: Value,
    },
    Cast {
        op: CastOp,
        to: Ty,
        value: Value,
    },
    Select {
        cond: Value,
        if_true: Value,
        if_false: Value,
    },
}

/// A failed value conversion: what was wanted and what was found.
#[derive(Clone, Copy, Debug)]
pub struct ConversionError {
    pub expected: &'static str,
    pub actual: &'static str,
}

impl Value {
    #[must_use]
    pub fn int(width: u32, value: i64) -> Self {
        if width == 1 {
            Value::Bool(value & 1 != 0)
        } else {
            Value::Int {
                width,
                value: normalize(width, value),
            }
        }
    }

    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Int { .. } => "Int",
            Value::Double(_) => "Double",
            Value::Bool(_) => "Bool",
            Value::Qubit(_) => "Qubit",
            Value::Result(_) => "Result",
            Value::Array(_) => "Array",
            Value::Tuple(_) => "Tuple",
            Value::String(_) => "String",
            Value::Pointer(_) => "Pointer",
            Value::Null => "Null",
            Value::Deferred(_) => "Deferred",
        }
    }

    fn conversion(&self, expected: &'static str) -> ConversionError {
        ConversionError {
            expected,
            actual: self.type_name(),
        }
    }

    /// The value as a signed integer, with bools widening to 0/1.
    pub fn as_int(&self) -> Result<i64, ConversionError> {
        match self {
            Value::Int { value, .. } => Ok(*value),
            Value::Bool(b) => Ok(i64::from(*b)),
            _ => Err(self.conversion("Int")),
        }
    }

    pub fn as_bool(&self) -> Result<bool, ConversionError> {
        match self {
            Value::Bool(b) => Ok(*b),
            Value::Int { width: 1, value } => Ok(*value & 1 != 0),
            _ => Err(self.conversion("Bool")),
        }
    }

    pub fn as_double(&self) -> Result<f64, ConversionError> {
        match self {
            Value::Double(d) => Ok(*d),
            _ => Err(self.conversion("Double")),
        }
    }

    pub fn as_qubit(&self) -> Result<QubitRef, ConversionError> {
        match self {
            Value::Qubit(q) => Ok(*q),
            _ => Err(self.conversion("Qubit")),
        }
    }

    pub fn as_result(&self) -> Result<ResultId, ConversionError> {
        match self {
            Value::Result(r) => Ok(*r),
            _ => Err(self.conversion("Result")),
        }
    }

    pub fn as_array(&self) -> Result<ArrayId, ConversionError> {
        match self {
            Value::Array(a) => Ok(*a),
            _ => Err(self.conversion("Array")),
        }
    }

    pub fn as_tuple(&self) -> Result<TupleId, ConversionError> {
        match self {
            Value::Tuple(t) => Ok(*t),
            _ => Err(self.conversion("Tuple")),
        }
    }

    pub fn as_string(&self) -> Result<StringId, ConversionError> {
        match self {
            Value::String(s) => Ok(*s),
            _ => Err(self.conversion("String")),
        }
    }

    pub fn as_pointer(&self) -> Result<Pointer, ConversionError> {
        match self {
            Value::Pointer(p) => Ok(*p),
            _ => Err(self.conversion("Pointer")),
        }
    }

    /// Whether the value is immediately usable by classical folding.
    #[must_use]
    pub fn is_classical(&self) -> bool {
        !matches!(self, Value::Deferred(_))
    }

    /// Collects the pending result handles this value depends on.
    pub fn collect_deferred_results(&self, out: &mut Vec<ResultId>) {
        if let Value::Deferred(expr) = self {
            expr.collect_results(out);
        }
    }

    /// Feeds the value into a hasher for projection-cache fingerprints.
    /// Returns `false` when the value cannot participate in a fingerprint
    /// (it is deferred).
    #[must_use]
    pub fn fingerprint(&self, state: &mut impl Hasher) -> bool {
        std::mem::discriminant(self).hash(state);
        match self {
            Value::Int { width, value } => {
                width.hash(state);
                value.hash(state);
            }
            Value::Double(d) => d.to_bits().hash(state),
            Value::Bool(b) => b.hash(state),
            Value::Qubit(QubitRef(id))
            | Value::Result(ResultId(id))
            | Value::Array(ArrayId(id))
            | Value::Tuple(TupleId(id))
            | Value::String(StringId(id)) => id.hash(state),
            Value::Pointer(p) => p.hash(state),
            Value::Null => {}
            Value::Deferred(_) => return false,
        }
        true
    }
}

impl DeferredExpr {
    fn collect_results(&self, out: &mut Vec<ResultId>) {
        match self {
            DeferredExpr::Result(id) => out.push(*id),
            DeferredExpr::Binary { lhs, rhs, .. } | DeferredExpr::Compare { lhs, rhs, .. } => {
                lhs.collect_deferred_results(out);
                rhs.collect_deferred_results(out);
            }
            DeferredExpr::Cast { value, .. } => value.collect_deferred_results(out),
            DeferredExpr::Select {
                cond,
                if_true,
                if_false,
            } => {
                cond.collect_deferred_results(out);
                if_true.collect_deferred_results(out);
                if_false.collect_deferred_results(out);
            }
        }
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int { value, .. } => write!(f, "{value}"),
            Value::Double(d) => write!(f, "{d}"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Qubit(q) => write!(f, "Qubit{}", q.0),
            Value::Result(r) => write!(f, "Result{}", r.0),
            Value::Array(a) => write!(f, "Array{}", a.0),
            Value::Tuple(t) => write!(f, "Tuple{}", t.0),
            Value::String(s) => write!(f, "String{}", s.0),
            Value::Pointer(Pointer::Slot(s)) => write!(f, "&slot{}", s.0),
            Value::Pointer(Pointer::ArrayElement(a, i)) => write!(f, "&Array{}[{i}]", a.0),
            Value::Pointer(Pointer::TupleElement(t, i)) => write!(f, "&Tuple{}.{i}", t.0),
            Value::Null => write!(f, "null"),
            Value::Deferred(_) => write!(f, "<deferred>"),
        }
    }
}

/// Sign-extends `value` from `width` bits, the canonical in-engine form.
#[must_use]
pub fn normalize(width: u32, value: i64) -> i64 {
    if width >= 64 {
        value
    } else {
        let shift = 64 - width;
        (value << shift) >> shift
    }
}

/// The value's bits as unsigned, masked to `width`.
#[must_use]
pub fn to_unsigned(width: u32, value: i64) -> u64 {
    #[allow(clippy::cast_sign_loss)]
    let bits = value as u64;
    if width >= 64 {
        bits
    } else {
        bits & ((1u64 << width) - 1)
    }
}
