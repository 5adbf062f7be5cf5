//! Bundler abstraction for the dual-target build.
//!
//! The orchestrator talks to a [`Bundler`] and never to a concrete
//! tool. A bundler takes one [`BundleJob`] (an in-memory entry module
//! plus a target) and returns the produced files and the set of source
//! files that contributed to the bundle. The production implementation
//! drives an external `esbuild` binary, tests script a fake.

pub mod esbuild;

pub use esbuild::EsbuildCli;

use std::path::PathBuf;

use rustc_hash::FxHashSet;
use thiserror::Error;

use crate::paths::{CLIENT_BUNDLE_FILE_NAME, SERVER_BUNDLE_FILE_NAME};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BundleTarget {
    Client,
    Server,
}

impl BundleTarget {
    pub const fn platform(self) -> &'static str {
        match self {
            Self::Client => "browser",
            Self::Server => "node",
        }
    }

    /// File name the target's entry chunk is published under in the
    /// build directory.
    pub const fn bundle_file_name(self) -> &'static str {
        match self {
            Self::Client => CLIENT_BUNDLE_FILE_NAME,
            Self::Server => SERVER_BUNDLE_FILE_NAME,
        }
    }
}

/// One bundling request: a synthesized entry module for one target.
#[derive(Debug, Clone)]
pub struct BundleJob {
    pub target: BundleTarget,
    /// JS source of the entry module, fed to the bundler in memory.
    pub entry_source: String,
    /// Directory imports are resolved against.
    pub project_dir: PathBuf,
}

/// A file produced by one bundling pass. The path is relative to the
/// build directory; the orchestrator decides where and whether it is
/// written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputFile {
    pub path: PathBuf,
    pub contents: Vec<u8>,
}

/// Everything one target's bundling pass yields.
#[derive(Debug, Clone, Default)]
pub struct TargetOutput {
    pub output_files: Vec<OutputFile>,
    /// Absolute paths of every source file that contributed to the
    /// bundle. Drives the watch set in serve mode.
    pub input_file_paths: Vec<PathBuf>,
}

/// One bundler error message with its optional source location.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Diagnostic {
    pub text: String,
    pub file: Option<String>,
    pub line: Option<u32>,
    pub column: Option<u32>,
}

impl Diagnostic {
    /// `file:line:column` rendering of the location, as much of it as
    /// is known.
    pub fn location_display(&self) -> Option<String> {
        let file = self.file.as_ref()?;

        Some(match (self.line, self.column) {
            (Some(line), Some(column)) => format!("{file}:{line}:{column}"),
            (Some(line), None) => format!("{file}:{line}"),
            _ => file.clone(),
        })
    }
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("Bundling failed with {} error(s)", diagnostics.len())]
    Failed { diagnostics: Vec<Diagnostic> },

    #[error("Failed to run the bundler")]
    Launch(#[source] std::io::Error),

    #[error("IO error while collecting bundle output")]
    Io(#[from] std::io::Error),

    #[error("Malformed bundler metadata: {0}")]
    Metadata(String),
}

/// Runs one bundling pass per call. Implementations must be safe to
/// call repeatedly with the same job; the orchestrator re-invokes them
/// on rebuild.
pub trait Bundler: Send {
    fn bundle(&self, job: &BundleJob) -> Result<TargetOutput, BuildError>;
}

/// Drop duplicate diagnostics, keeping the first occurrence of each
/// (text, file, line, column) tuple. Both targets compile the same
/// page modules, so one broken page reports twice without this.
pub fn dedup_diagnostics(diagnostics: Vec<Diagnostic>) -> Vec<Diagnostic> {
    let mut seen = FxHashSet::default();

    diagnostics
        .into_iter()
        .filter(|diagnostic| seen.insert(diagnostic.clone()))
        .collect()
}

/// Drop output files whose path was already produced, keeping the
/// first occurrence. The targets can overlap on shared assets.
pub fn dedup_output_files(files: Vec<OutputFile>) -> Vec<OutputFile> {
    let mut seen = FxHashSet::default();

    files
        .into_iter()
        .filter(|file| seen.insert(file.path.clone()))
        .collect()
}

#[cfg(test)]
pub mod testing {
    //! Scripted bundler for tests that exercise the orchestration
    //! without an external tool.

    use std::collections::VecDeque;

    use parking_lot::Mutex;
    use rustc_hash::FxHashMap;

    use super::*;

    #[derive(Default)]
    pub struct FakeBundler {
        outputs: Mutex<FxHashMap<BundleTarget, VecDeque<Result<TargetOutput, BuildError>>>>,
        pub calls: Mutex<Vec<BundleTarget>>,
    }

    impl FakeBundler {
        pub fn new() -> Self {
            Self::default()
        }

        /// Queue the result returned by the next `bundle` call for the
        /// target. Later pushes answer later calls.
        pub fn push(&self, target: BundleTarget, result: Result<TargetOutput, BuildError>) {
            self.outputs.lock().entry(target).or_default().push_back(result);
        }
    }

    impl Bundler for FakeBundler {
        fn bundle(&self, job: &BundleJob) -> Result<TargetOutput, BuildError> {
            self.calls.lock().push(job.target);

            self.outputs
                .lock()
                .get_mut(&job.target)
                .and_then(VecDeque::pop_front)
                .unwrap_or_else(|| panic!("no scripted output for {:?}", job.target))
        }
    }

    pub fn output_file(path: &str, contents: &str) -> OutputFile {
        OutputFile {
            path: PathBuf::from(path),
            contents: contents.as_bytes().to_vec(),
        }
    }

    pub fn diagnostic(text: &str, file: &str, line: u32, column: u32) -> Diagnostic {
        Diagnostic {
            text: text.to_string(),
            file: Some(file.to_string()),
            line: Some(line),
            column: Some(column),
        }
    }
}
