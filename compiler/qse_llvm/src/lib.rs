// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![warn(clippy::mod_module_files, clippy::pedantic, clippy::unwrap_used)]

pub mod bitcode;
pub mod instruction;
pub use instruction::{CastOp, Constant, Instruction, Operand, Terminator};
pub mod module;
pub use module::{Attribute, BasicBlock, Declaration, Function, Module, Parameter};
pub mod name;
pub use name::Name;
pub mod parse;
pub mod predicates;
pub use predicates::{FPPredicate, IntPredicate};
pub mod types;
pub use types::Ty;

use miette::Diagnostic;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Diagnostic, Error)]
pub enum Error {
    #[error("parse error at line {1}: {0}")]
    #[diagnostic(code("Qse.Llvm.Parse"))]
    Parse(String, usize),

    #[error("unsupported feature at line {1}: {0}")]
    #[diagnostic(code("Qse.Llvm.Unsupported"))]
    #[diagnostic(help("only the QIR opcode and intrinsic subset is accepted"))]
    Unsupported(String, usize),

    #[error("failed to read {0}")]
    #[diagnostic(code("Qse.Llvm.Io"))]
    Io(String, #[source] std::io::Error),

    #[error("bitcode ingestion failed: {0}")]
    #[diagnostic(code("Qse.Llvm.Bitcode"))]
    #[diagnostic(help(
        "bitcode files are disassembled with llvm-dis; install LLVM tools or set QSE_LLVM_DIS"
    ))]
    Bitcode(String),
}

/// Loads a QIR module from a `.ll` or `.bc` file.
///
/// Textual IR is parsed directly; bitcode is disassembled to text first
/// (see [`bitcode`]) and then parsed. Files with other extensions are
/// sniffed for the bitcode magic and otherwise treated as text.
///
/// # Errors
/// Returns [`Error::Parse`] on malformed input, [`Error::Unsupported`] when
/// an opcode outside the supported set appears, and [`Error::Io`] /
/// [`Error::Bitcode`] for ingestion failures.
pub fn load_file(path: impl AsRef<Path>) -> Result<Module, Error> {
    let path = path.as_ref();
    let bytes =
        std::fs::read(path).map_err(|e| Error::Io(path.display().to_string(), e))?;
    let name = path
        .file_stem()
        .map_or_else(|| "module".to_string(), |s| s.to_string_lossy().into_owned());

    let is_bc = path.extension().is_some_and(|e| e == "bc") || bitcode::is_bitcode(&bytes);
    let source = if is_bc {
        bitcode::disassemble(path)?
    } else {
        String::from_utf8(bytes).map_err(|e| Error::Parse(e.to_string(), 0))?
    };
    load_text(&name, &source)
}

/// Parses a QIR module from textual LLVM IR.
///
/// # Errors
/// Returns [`Error::Parse`] or [`Error::Unsupported`] as for [`load_file`].
pub fn load_text(name: &str, source: &str) -> Result<Module, Error> {
    log::debug!("parsing module `{name}` ({} bytes)", source.len());
    parse::module(name, source)
}
