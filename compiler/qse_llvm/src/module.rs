// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::instruction::{Instruction, Terminator};
use crate::name::Name;
use crate::types::Ty;
use rustc_hash::FxHashMap;
use std::rc::Rc;

/// A parsed QIR module: defined functions, external declarations, global
/// string constants, and attribute groups.
#[derive(Clone, Debug, Default)]
pub struct Module {
    pub name: String,
    pub functions: Vec<Function>,
    pub declarations: Vec<Declaration>,
    /// Global byte-string constants (`@x = ... c"..."`), keyed by name.
    pub globals: FxHashMap<Rc<str>, Vec<u8>>,
    /// Attribute groups (`attributes #0 = { ... }`), keyed by group id.
    pub attribute_groups: FxHashMap<u32, Vec<Attribute>>,
}

impl Module {
    #[must_use]
    pub fn get_func_by_name(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.name.as_ref() == name)
    }

    #[must_use]
    pub fn get_decl_by_name(&self, name: &str) -> Option<&Declaration> {
        self.declarations.iter().find(|d| d.name.as_ref() == name)
    }

    /// Functions marked with the `entry_point`/`EntryPoint` attribute.
    pub fn entry_points(&self) -> impl Iterator<Item = &Function> {
        self.functions.iter().filter(|f| f.is_entry_point())
    }
}

/// A string attribute, either a bare flag or a key="value" pair.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Attribute {
    Flag(Rc<str>),
    KeyValue(Rc<str>, Rc<str>),
}

/// A function parameter.
#[derive(Clone, Debug, PartialEq)]
pub struct Parameter {
    pub name: Name,
    pub ty: Ty,
}

/// A fully defined function.
#[derive(Clone, Debug)]
pub struct Function {
    pub name: Rc<str>,
    pub ret_ty: Ty,
    pub params: Vec<Parameter>,
    pub blocks: Vec<BasicBlock>,
    /// Attributes after attribute-group resolution.
    pub attributes: Vec<Attribute>,
}

impl Function {
    fn has_flag(&self, flag: &str) -> bool {
        self.attributes
            .iter()
            .any(|a| matches!(a, Attribute::Flag(f) if f.as_ref() == flag))
    }

    fn attr_value(&self, key: &str) -> Option<&str> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::KeyValue(k, v) if k.as_ref() == key => Some(v.as_ref()),
            _ => None,
        })
    }

    #[must_use]
    pub fn is_entry_point(&self) -> bool {
        self.has_flag("entry_point") || self.has_flag("EntryPoint")
    }

    /// The `required_num_qubits`/`requiredQubits` attribute hint, if present.
    #[must_use]
    pub fn required_qubits(&self) -> Option<u64> {
        self.attr_value("required_num_qubits")
            .or_else(|| self.attr_value("requiredQubits"))
            .and_then(|v| v.parse().ok())
    }

    /// The `required_num_results`/`requiredResults` attribute hint, if present.
    #[must_use]
    pub fn required_results(&self) -> Option<u64> {
        self.attr_value("required_num_results")
            .or_else(|| self.attr_value("requiredResults"))
            .and_then(|v| v.parse().ok())
    }
}

/// A declared (but not defined) function.
#[derive(Clone, Debug)]
pub struct Declaration {
    pub name: Rc<str>,
    pub ret_ty: Ty,
    pub param_tys: Vec<Ty>,
}

/// A basic block: a label, a straight-line instruction sequence, and a
/// terminator.
#[derive(Clone, Debug)]
pub struct BasicBlock {
    pub name: Name,
    pub instructions: Vec<Instruction>,
    pub terminator: Terminator,
}
