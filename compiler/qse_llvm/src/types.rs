// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt::{self, Display, Formatter};
use std::rc::Rc;

/// The subset of LLVM types that QIR modules use.
///
/// Opaque named types carry their name; the QIR handle types (`%Qubit`,
/// `%Result`, `%Array`, `%Tuple`, `%String`) are recognized through the
/// `is_*_ptr` helpers on pointers to them.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum Ty {
    Void,
    Int { width: u32 },
    Double,
    Pointer(Rc<Ty>),
    Array { size: u64, element: Rc<Ty> },
    Struct(Vec<Ty>),
    Opaque(Rc<str>),
}

impl Ty {
    pub const BOOL: Ty = Ty::Int { width: 1 };

    #[must_use]
    pub fn pointer_to(pointee: Ty) -> Ty {
        Ty::Pointer(Rc::new(pointee))
    }

    #[must_use]
    pub fn pointee(&self) -> Option<&Ty> {
        match self {
            Ty::Pointer(p) => Some(p),
            _ => None,
        }
    }

    fn is_opaque_ptr(&self, name: &str) -> bool {
        matches!(self.pointee(), Some(Ty::Opaque(n)) if n.as_ref() == name)
    }

    #[must_use]
    pub fn is_qubit_ptr(&self) -> bool {
        self.is_opaque_ptr("Qubit")
    }

    #[must_use]
    pub fn is_result_ptr(&self) -> bool {
        self.is_opaque_ptr("Result")
    }

    #[must_use]
    pub fn is_array_ptr(&self) -> bool {
        self.is_opaque_ptr("Array")
    }

    #[must_use]
    pub fn is_tuple_ptr(&self) -> bool {
        self.is_opaque_ptr("Tuple")
    }

    #[must_use]
    pub fn is_string_ptr(&self) -> bool {
        self.is_opaque_ptr("String")
    }
}

impl Display for Ty {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Ty::Void => write!(f, "void"),
            Ty::Int { width } => write!(f, "i{width}"),
            Ty::Double => write!(f, "double"),
            Ty::Pointer(pointee) => write!(f, "{pointee}*"),
            Ty::Array { size, element } => write!(f, "[{size} x {element}]"),
            Ty::Struct(fields) => {
                write!(f, "{{ ")?;
                for (i, field) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{field}")?;
                }
                write!(f, " }}")
            }
            Ty::Opaque(name) => write!(f, "%{name}"),
        }
    }
}
