// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Process-wide logger initialization.
//!
//! Backends may call into the executor at import time, so initialization is
//! idempotent: the first successful call wins and later calls are ignored.

use std::path::Path;
use std::sync::Once;

pub const DEFAULT_LOG_FILE: &str = "qse.log";

static INIT: Once = Once::new();

/// Initializes logging to stdout, honoring `RUST_LOG`.
pub fn initialize_commandline_logger() {
    INIT.call_once(|| {
        let _ = env_logger::Builder::from_env(
            env_logger::Env::default().default_filter_or("info"),
        )
        .target(env_logger::Target::Stdout)
        .try_init();
    });
}

/// Initializes logging into an append-only file.
///
/// Falls back to stderr when the file cannot be opened.
pub fn initialize_file_logger(path: impl AsRef<Path>) {
    let path = path.as_ref().to_path_buf();
    INIT.call_once(move || {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path);
        let mut builder = env_logger::Builder::from_env(
            env_logger::Env::default().default_filter_or("info"),
        );
        match file {
            Ok(file) => {
                builder.target(env_logger::Target::Pipe(Box::new(file)));
            }
            Err(error) => {
                eprintln!("could not open log file {}: {error}", path.display());
            }
        }
        let _ = builder.try_init();
    });
}
