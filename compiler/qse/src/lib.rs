// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The execution orchestrator: loads a QIR file, negotiates a capable
//! backend, drives the projection engine, and shapes the result for the
//! host.

#![warn(clippy::mod_module_files, clippy::pedantic, clippy::unwrap_used)]

#[cfg(test)]
mod tests;

pub mod logging;

pub use qse_eval::backend::{
    Backend, Builder, Distribution, RecordingBackend, RecordingBuilder, RequiredFeatures,
    ZeroBackend,
};
pub use qse_eval::routing::{Architecture, RoutedBackend};
pub use qse_eval::HostValue;

use miette::Diagnostic;
use qse_eval::EngineConfig;
use qse_llvm::Module;
use std::io::Write;
use std::path::Path;
use thiserror::Error as ThisError;

#[derive(Debug, Diagnostic, ThisError)]
pub enum Error {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Load(#[from] qse_llvm::Error),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Graph(#[from] qse_graph::Error),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Eval(#[from] qse_eval::Error),

    #[error("no entry point found in module")]
    #[diagnostic(code("Qse.NoEntryPoint"))]
    NoEntryPoint,

    #[error("multiple entry points found; name one explicitly")]
    #[diagnostic(code("Qse.MultipleEntryPoints"))]
    MultipleEntryPoints,

    #[error("no configured backend has the required features (qubit count {0})")]
    #[diagnostic(code("Qse.NoCapableBackend"))]
    NoCapableBackend(u64),

    #[error("no function named @{0}")]
    #[diagnostic(code("Qse.EntryPointNotFound"))]
    EntryPointNotFound(String),

    #[error("failed to stage temporary input: {0}")]
    #[diagnostic(code("Qse.TempFile"))]
    TempFile(String),
}

/// The shaped result of a run: a base-profile distribution or the entry's
/// return value.
#[derive(Clone, Debug, PartialEq)]
pub enum RunResult {
    Counts(Distribution),
    Value(HostValue),
}

/// Top-level executor over a list of configured backends.
///
/// Backends are tried in configuration order; the first one whose
/// `has_features` accepts the module's requirements runs the program.
pub struct Executor {
    backends: Vec<Box<dyn Backend>>,
    config: EngineConfig,
    trace_graphs: bool,
}

impl Executor {
    #[must_use]
    pub fn new(backend: Box<dyn Backend>) -> Self {
        Self::from_backends(vec![backend])
    }

    #[must_use]
    pub fn from_backends(backends: Vec<Box<dyn Backend>>) -> Self {
        Self {
            backends,
            config: EngineConfig::default(),
            trace_graphs: false,
        }
    }

    pub fn add_backend(&mut self, backend: Box<dyn Backend>) -> &mut Self {
        self.backends.push(backend);
        self
    }

    /// Bounds how many instructions the engine may execute.
    pub fn step_count_limit(&mut self, limit: u64) -> &mut Self {
        self.config.step_limit = Some(limit);
        self
    }

    pub fn recursion_limit(&mut self, limit: usize) -> &mut Self {
        self.config.recursion_limit = limit;
        self
    }

    /// Prints each function's execution graph as it is built.
    pub fn trace_graphs(&mut self) -> &mut Self {
        self.trace_graphs = true;
        self
    }

    /// Logs value resolutions, branch decisions, and built circuits.
    pub fn trace_projections(&mut self) -> &mut Self {
        self.config.trace_projections = true;
        self
    }

    /// Logs every step the engine takes.
    pub fn trace_runtime(&mut self) -> &mut Self {
        self.config.trace_runtime = true;
        self
    }

    /// Runs a `.ll` or `.bc` file.
    ///
    /// # Errors
    /// Surfaces loader, graph, engine, and backend-negotiation failures.
    pub fn run(
        &mut self,
        path: impl AsRef<Path>,
        args: &[HostValue],
    ) -> Result<Option<RunResult>, Error> {
        let module = qse_llvm::load_file(path)?;
        self.run_module(&module, args, None)
    }

    /// Runs textual IR, staging it through a temporary file like the other
    /// host entry points.
    ///
    /// # Errors
    /// As for [`Executor::run`].
    pub fn run_ll(&mut self, source: &str, args: &[HostValue]) -> Result<Option<RunResult>, Error> {
        let staged = StagedFile::write("ll", source.as_bytes())?;
        self.run(&staged.path, args)
    }

    /// Runs LLVM bitcode bytes.
    ///
    /// # Errors
    /// As for [`Executor::run`].
    pub fn run_bitcode(
        &mut self,
        bitcode: &[u8],
        args: &[HostValue],
    ) -> Result<Option<RunResult>, Error> {
        let staged = StagedFile::write("bc", bitcode)?;
        self.run(&staged.path, args)
    }

    /// Runs an already-loaded module, optionally naming the entry point.
    ///
    /// # Errors
    /// As for [`Executor::run`].
    pub fn run_module(
        &mut self,
        module: &Module,
        args: &[HostValue],
        entry_point: Option<&str>,
    ) -> Result<Option<RunResult>, Error> {
        let entry = choose_entry_point(module, entry_point)?;
        log::info!("@{entry} is the entry point");

        let graphs = qse_graph::build(module, self.trace_graphs)?;

        let required = required_features(module, entry);
        let backend = self
            .backends
            .iter_mut()
            .find(|backend| backend.has_features(&required))
            .ok_or(Error::NoCapableBackend(required.qubit_count))?;

        let outcome = qse_eval::run(module, &graphs, backend.as_mut(), &self.config, entry, args)?;

        for qubit in &outcome.leaked_qubits {
            log::warn!("qubit {qubit} was not released");
        }
        for entry in &outcome.leaked_entries {
            log::warn!("heap entry leaked: {entry}");
        }

        // Base profile: the observable output is the recorded result list,
        // shaped as a bitstring counter. Otherwise the entry's return value
        // is the result.
        if outcome.output_bits.is_empty() {
            Ok(outcome.value.map(RunResult::Value))
        } else {
            let counts = qse_eval::shape_counts(
                &outcome.output_bits,
                outcome.final_distribution.as_ref(),
            );
            Ok(Some(RunResult::Counts(counts)))
        }
    }
}

fn choose_entry_point<'m>(
    module: &'m Module,
    name: Option<&str>,
) -> Result<&'m str, Error> {
    if let Some(name) = name {
        return module
            .get_func_by_name(name)
            .map(|f| f.name.as_ref())
            .ok_or_else(|| Error::EntryPointNotFound(name.to_string()));
    }
    let mut entry_points = module.entry_points();
    let Some(first) = entry_points.next() else {
        // Modules without attributes still commonly define a single
        // function; treat a lone definition as the entry.
        return if module.functions.len() == 1 {
            Ok(module.functions[0].name.as_ref())
        } else {
            Err(Error::NoEntryPoint)
        };
    };
    if entry_points.next().is_some() {
        return Err(Error::MultipleEntryPoints);
    }
    Ok(first.name.as_ref())
}

fn required_features(module: &Module, entry: &str) -> RequiredFeatures {
    let qubit_count = module
        .get_func_by_name(entry)
        .and_then(qse_llvm::Function::required_qubits)
        .unwrap_or(0);
    RequiredFeatures::new(qubit_count)
}

/// A temporary input file removed on drop; mirrors the staging the host
/// bindings perform for in-memory sources.
struct StagedFile {
    path: std::path::PathBuf,
}

impl StagedFile {
    fn write(extension: &str, bytes: &[u8]) -> Result<Self, Error> {
        let mut path = std::env::temp_dir();
        let unique = format!(
            "qse-{}-{:x}.{extension}",
            std::process::id(),
            fingerprint(bytes)
        );
        path.push(unique);
        let mut file =
            std::fs::File::create(&path).map_err(|e| Error::TempFile(e.to_string()))?;
        file.write_all(bytes)
            .map_err(|e| Error::TempFile(e.to_string()))?;
        Ok(Self { path })
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn fingerprint(bytes: &[u8]) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    bytes.hash(&mut hasher);
    hasher.finish()
}
