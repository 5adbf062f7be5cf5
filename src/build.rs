//! Dual-target build orchestration.
//!
//! One build pass synthesizes both entry modules, runs the bundler
//! once per target and only then touches the build directory: outputs
//! from both targets are merged and deduplicated in memory first, so a
//! failed pass never leaves half-written files behind. Diagnostics
//! from failing targets are merged the same way. The retained
//! [`BuildResult`] re-runs the pass on demand and reports how the
//! contributing input set changed, which drives the watch loop.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use arc_swap::ArcSwap;
use rustc_hash::FxHashSet;

use crate::bundler::{
    BuildError, BundleJob, BundleTarget, Bundler, EsbuildCli, TargetOutput, dedup_diagnostics,
    dedup_output_files,
};
use crate::codegen::{self, RuntimeContext};
use crate::config::SiteConfig;
use crate::log;
use crate::logger::log_diagnostics;
use crate::pages::{PageDescriptor, resolve_pages};
use crate::paths::ProjectPaths;
use crate::render::{NodeBackend, render_site};

/// Handle to the latest successfully built server bundle.
#[derive(Debug, Clone, Default)]
pub struct Artifacts {
    /// Monotonic build counter; 0 means nothing has been published.
    pub version: u64,
    pub server_bundle_file: PathBuf,
}

/// Published build artifacts, swapped atomically on every successful
/// pass. The renderer always loads the latest version and never a
/// stale evaluation of a previous bundle.
pub struct ArtifactStore {
    current: ArcSwap<Artifacts>,
}

impl ArtifactStore {
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(Artifacts::default()),
        }
    }

    /// Publish a freshly written server bundle under the next version.
    pub fn publish(&self, server_bundle_file: PathBuf) -> Arc<Artifacts> {
        let artifacts = Arc::new(Artifacts {
            version: self.current.load().version + 1,
            server_bundle_file,
        });

        self.current.store(artifacts.clone());
        artifacts
    }

    pub fn latest(&self) -> Arc<Artifacts> {
        self.current.load_full()
    }
}

impl Default for ArtifactStore {
    fn default() -> Self {
        Self::new()
    }
}

/// How the contributing input set changed across a rebuild.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InputDiff {
    pub added: Vec<PathBuf>,
    pub removed: Vec<PathBuf>,
}

/// Set difference of contributing inputs, sorted for determinism.
pub fn input_diff(old: &FxHashSet<PathBuf>, new: &FxHashSet<PathBuf>) -> InputDiff {
    let mut added: Vec<PathBuf> = new.difference(old).cloned().collect();
    let mut removed: Vec<PathBuf> = old.difference(new).cloned().collect();

    added.sort();
    removed.sort();

    InputDiff { added, removed }
}

/// Run one full build and render pass for the build command.
pub fn build_site(project_dir: PathBuf) -> anyhow::Result<()> {
    let paths = ProjectPaths::new(project_dir);
    let config = SiteConfig::from_path(&paths.config_file)?;
    let pages = resolve_pages(&paths.project_dir, &config.pages, config.build.allow_unmatched)?;

    let bundler = Box::new(EsbuildCli::locate()?);
    let backend = NodeBackend::locate()?;
    let store = Arc::new(ArtifactStore::new());

    let result = build(bundler, &paths, &config, &pages, store.clone()).map_err(|err| {
        if let BuildError::Failed { diagnostics } = &err {
            log_diagnostics(diagnostics);
        }
        err
    })?;
    result.dispose();

    render_site(&backend, &paths, &config, &pages, &store.latest())?;

    log!("build"; "Built {} pages", pages.len());
    Ok(())
}

/// A completed build pass plus everything needed to run it again.
pub struct BuildResult {
    /// Every source file that contributed to either bundle, plus the
    /// config file. This is the watch set in serve mode.
    pub input_file_paths: FxHashSet<PathBuf>,
    jobs: Vec<BundleJob>,
    bundler: Box<dyn Bundler>,
    build_dir: PathBuf,
    config_file: PathBuf,
    server_bundle_file: PathBuf,
    store: Arc<ArtifactStore>,
}

/// Run the dual-target build for the given page set.
pub fn build(
    bundler: Box<dyn Bundler>,
    paths: &ProjectPaths,
    config: &SiteConfig,
    pages: &[PageDescriptor],
    store: Arc<ArtifactStore>,
) -> Result<BuildResult, BuildError> {
    let runtime = RuntimeContext::from_package(&config.build.runtime);
    let metadata_url = paths.metadata_url(&config.build.base_url);

    let jobs = vec![
        BundleJob {
            target: BundleTarget::Client,
            entry_source: codegen::client_entry(&runtime, pages, &metadata_url),
            project_dir: paths.project_dir.clone(),
        },
        BundleJob {
            target: BundleTarget::Server,
            entry_source: codegen::server_entry(&runtime, pages),
            project_dir: paths.project_dir.clone(),
        },
    ];

    let mut result = BuildResult {
        input_file_paths: FxHashSet::default(),
        jobs,
        bundler,
        build_dir: paths.build_dir.clone(),
        config_file: paths.config_file.clone(),
        server_bundle_file: paths.server_bundle_file.clone(),
        store,
    };

    let outputs = run_jobs(result.bundler.as_ref(), &result.jobs)?;
    result.input_file_paths = result.write_and_publish(outputs)?;

    Ok(result)
}

impl BuildResult {
    /// Re-run the retained build pass and report how the input set
    /// changed. The same merge, dedup and write guarantees as the
    /// initial pass apply.
    pub fn rebuild(&mut self) -> Result<InputDiff, BuildError> {
        let outputs = run_jobs(self.bundler.as_ref(), &self.jobs)?;
        let new_inputs = self.write_and_publish(outputs)?;

        let diff = input_diff(&self.input_file_paths, &new_inputs);
        self.input_file_paths = new_inputs;

        Ok(diff)
    }

    /// Release the retained rebuild state. Dropping does the same;
    /// taking `self` makes the hand-off explicit and unrepeatable.
    pub fn dispose(self) {}

    fn write_and_publish(
        &self,
        outputs: Vec<TargetOutput>,
    ) -> Result<FxHashSet<PathBuf>, BuildError> {
        let mut inputs = FxHashSet::default();
        let mut files = Vec::new();

        for output in outputs {
            inputs.extend(output.input_file_paths);
            files.extend(output.output_files);
        }

        // The config file stands in for the synthesized entries, so
        // editing it retriggers a rebuild in watch mode.
        inputs.insert(self.config_file.clone());

        let files = dedup_output_files(files);

        for file in &files {
            let path = self.build_dir.join(&file.path);

            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }

            fs::write(&path, &file.contents)?;
        }

        log!("build"; "Wrote {} bundle files", files.len());

        self.store.publish(self.server_bundle_file.clone());

        Ok(inputs)
    }
}

/// Run every job, collecting failures from all of them before
/// reporting. A target that cannot even launch aborts immediately.
fn run_jobs(bundler: &dyn Bundler, jobs: &[BundleJob]) -> Result<Vec<TargetOutput>, BuildError> {
    let mut outputs = Vec::new();
    let mut diagnostics = Vec::new();

    for job in jobs {
        match bundler.bundle(job) {
            Ok(output) => outputs.push(output),
            Err(BuildError::Failed {
                diagnostics: mut errors,
            }) => diagnostics.append(&mut errors),
            Err(other) => return Err(other),
        }
    }

    if !diagnostics.is_empty() {
        return Err(BuildError::Failed {
            diagnostics: dedup_diagnostics(diagnostics),
        });
    }

    Ok(outputs)
}
