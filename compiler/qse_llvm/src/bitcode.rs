// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Bitcode ingestion.
//!
//! The executor parses textual IR itself; `.bc` files are disassembled to
//! text with the system `llvm-dis` tool first. The tool is looked up on
//! `PATH`, or at the location given by the `QSE_LLVM_DIS` environment
//! variable.

use crate::Error;
use std::path::Path;
use std::process::Command;

const RAW_MAGIC: [u8; 4] = [0x42, 0x43, 0xC0, 0xDE];
const WRAPPER_MAGIC: [u8; 4] = [0xDE, 0xC0, 0x17, 0x0B];

/// Whether the bytes start with the LLVM bitcode magic (raw or wrapped).
#[must_use]
pub fn is_bitcode(bytes: &[u8]) -> bool {
    bytes.starts_with(&RAW_MAGIC) || bytes.starts_with(&WRAPPER_MAGIC)
}

/// Disassembles a bitcode file to textual IR.
///
/// # Errors
/// Fails when the disassembler is missing or exits unsuccessfully.
pub fn disassemble(path: &Path) -> Result<String, Error> {
    let tool = std::env::var("QSE_LLVM_DIS").unwrap_or_else(|_| "llvm-dis".to_string());
    let output = Command::new(&tool)
        .arg(path)
        .arg("-o")
        .arg("-")
        .output()
        .map_err(|e| Error::Bitcode(format!("could not run `{tool}`: {e}")))?;

    if output.status.success() {
        String::from_utf8(output.stdout)
            .map_err(|e| Error::Bitcode(format!("`{tool}` produced invalid UTF-8: {e}")))
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(Error::Bitcode(format!(
            "`{tool}` failed on {}: {}",
            path.display(),
            stderr.trim()
        )))
    }
}
