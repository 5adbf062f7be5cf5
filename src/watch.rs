//! File system watcher driving rebuilds.
//!
//! Watches the exact input files reported by the bundler rather than
//! whole directories, then funnels changes through a debouncer into
//! rebuild, render, and reload:
//!
//! ```text
//! notify events ──▶ Debouncer (300ms) ──▶ rebuild ──▶ render ──▶ reload()
//! ```
//!
//! Each rebuild reports its own input set, so the watched set follows
//! imports as they come and go. A deleted input stays watched so
//! recreating it rebuilds again.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use notify::{Event, EventKind, RecursiveMode, Watcher};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::build::{ArtifactStore, BuildResult, InputDiff};
use crate::bundler::BuildError;
use crate::config::SiteConfig;
use crate::log;
use crate::logger::log_diagnostics;
use crate::pages::PageDescriptor;
use crate::paths::ProjectPaths;
use crate::render::RenderBackend;
use crate::render::worker::{RenderTask, render_in_worker};
use crate::serve::LiveReload;

// =============================================================================
// Constants
// =============================================================================

const DEBOUNCE_MS: u64 = 300;
const REBUILD_COOLDOWN_MS: u64 = 800;

// =============================================================================
// Input Registry
// =============================================================================

/// Watches an exact set of files through non-recursive watches on
/// their parent directories.
///
/// Editors often replace a file by deleting and recreating it, which
/// silences a watch placed on the file itself. Watching the parent
/// keeps events flowing across the swap. Directory watches are
/// refcounted so inputs sharing a directory share one watch, and
/// events are filtered back down to the registered files.
struct InputWatcher<W: Watcher> {
    watcher: W,
    registered: FxHashSet<PathBuf>,
    directories: FxHashMap<PathBuf, usize>,
}

impl<W: Watcher> InputWatcher<W> {
    fn new(watcher: W) -> Self {
        Self {
            watcher,
            registered: FxHashSet::default(),
            directories: FxHashMap::default(),
        }
    }

    fn register(&mut self, paths: impl IntoIterator<Item = PathBuf>) -> Result<()> {
        for path in paths {
            if !self.registered.insert(path.clone()) {
                continue;
            }

            let Some(parent) = path.parent().map(Path::to_path_buf) else {
                continue;
            };

            let count = self.directories.entry(parent.clone()).or_insert(0);
            *count += 1;

            if *count == 1 {
                self.watcher
                    .watch(&parent, RecursiveMode::NonRecursive)
                    .with_context(|| format!("Failed to watch {}", parent.display()))?;
            }
        }

        Ok(())
    }

    fn unregister(&mut self, paths: impl IntoIterator<Item = PathBuf>) {
        for path in paths {
            if !self.registered.remove(&path) {
                continue;
            }

            let Some(parent) = path.parent() else {
                continue;
            };

            let released = match self.directories.get_mut(parent) {
                Some(count) => {
                    *count -= 1;
                    *count == 0
                }
                None => false,
            };

            if released {
                self.directories.remove(parent);
                // The directory may already be gone.
                let _ = self.watcher.unwatch(parent);
            }
        }
    }

    /// Keep only the event paths that name registered input files.
    fn filter_registered(&self, paths: Vec<PathBuf>) -> Vec<PathBuf> {
        paths
            .into_iter()
            .filter(|path| self.registered.contains(path))
            .collect()
    }
}

// =============================================================================
// Debounce State
// =============================================================================

/// Batches rapid file events with debouncing and rebuild cooldown.
struct Debouncer {
    pending: FxHashSet<PathBuf>,
    last_event: Option<Instant>,
    last_rebuild: Option<Instant>,
}

impl Debouncer {
    fn new() -> Self {
        Self {
            pending: FxHashSet::default(),
            last_event: None,
            last_rebuild: None,
        }
    }

    fn in_cooldown(&self) -> bool {
        self.last_rebuild
            .is_some_and(|t| t.elapsed() < Duration::from_millis(REBUILD_COOLDOWN_MS))
    }

    fn add(&mut self, paths: impl IntoIterator<Item = PathBuf>) {
        self.pending.extend(paths);
        self.last_event = Some(Instant::now());
    }

    fn ready(&self) -> bool {
        !self.pending.is_empty()
            && self
                .last_event
                .is_some_and(|t| t.elapsed() >= Duration::from_millis(DEBOUNCE_MS))
    }

    fn take(&mut self) -> Vec<PathBuf> {
        self.last_event = None;
        self.pending.drain().collect()
    }

    fn mark_rebuild(&mut self) {
        self.last_rebuild = Some(Instant::now());
    }

    fn timeout(&self) -> Duration {
        if self.pending.is_empty() {
            Duration::from_secs(60)
        } else {
            Duration::from_millis(DEBOUNCE_MS)
        }
    }
}

// =============================================================================
// Event Handler
// =============================================================================

/// Format absolute path as project-relative for log display.
fn rel_path(path: &Path, root: &Path) -> String {
    path.strip_prefix(root).unwrap_or(path).display().to_string()
}

/// Rebuild after a batch of changes, refresh the watched set, render,
/// and notify connected browsers. Any failure leaves the served output
/// as it was. Returns true when the whole pass succeeded (for cooldown
/// tracking).
fn handle_changes(
    context: &mut WatchContext,
    inputs: &mut InputWatcher<impl Watcher>,
    changed: &[PathBuf],
) -> bool {
    if changed.is_empty() {
        return false;
    }

    let names: Vec<String> = changed
        .iter()
        .map(|path| rel_path(path, &context.paths.project_dir))
        .collect();
    log!("watch"; "{} changed, rebuilding...", names.join(", "));

    let diff = match context.build.rebuild() {
        Ok(diff) => diff,
        Err(err) => {
            if let BuildError::Failed { diagnostics } = &err {
                log_diagnostics(diagnostics);
            }
            log!("watch"; "rebuild failed: {err}");
            return false;
        }
    };

    update_watches(inputs, diff, changed);

    let task = RenderTask {
        paths: context.paths.clone(),
        config: context.config.clone(),
        pages: context.pages.clone(),
        artifacts: context.store.latest(),
    };

    if let Err(err) = render_in_worker(context.backend.clone(), task) {
        log!("watch"; "render failed: {err}");
        return false;
    }

    context.live_reload.reload();
    true
}

fn update_watches(inputs: &mut InputWatcher<impl Watcher>, diff: InputDiff, changed: &[PathBuf]) {
    if !diff.added.is_empty() || !diff.removed.is_empty() {
        log!("watch"; "inputs: +{} -{}", diff.added.len(), diff.removed.len());
    }

    // A path from the triggering batch stays registered even when the
    // new input set drops it, so a deleted file's recreation is still
    // seen.
    let dropped: Vec<PathBuf> = diff
        .removed
        .into_iter()
        .filter(|path| !changed.contains(path))
        .collect();

    inputs.unregister(dropped);
    if let Err(err) = inputs.register(diff.added) {
        log!("watch"; "{err}");
    }
}

const fn is_relevant(event: &Event) -> bool {
    matches!(
        event.kind,
        EventKind::Modify(_) | EventKind::Create(_) | EventKind::Remove(_)
    )
}

// =============================================================================
// Public API
// =============================================================================

/// Everything the watch loop owns while serving.
pub struct WatchContext {
    pub build: BuildResult,
    pub backend: Arc<dyn RenderBackend>,
    pub store: Arc<ArtifactStore>,
    pub paths: ProjectPaths,
    pub config: SiteConfig,
    pub pages: Vec<PageDescriptor>,
    pub live_reload: LiveReload,
}

/// Start the blocking watch loop over the current input set.
pub fn watch_for_changes(mut context: WatchContext) -> Result<()> {
    let (tx, rx) = mpsc::channel();
    let watcher = notify::recommended_watcher(tx).context("Failed to create file watcher")?;

    let mut inputs = InputWatcher::new(watcher);
    inputs.register(context.build.input_file_paths.iter().cloned())?;

    log!("watch"; "watching {} input files", context.build.input_file_paths.len());

    let mut debouncer = Debouncer::new();

    loop {
        match rx.recv_timeout(debouncer.timeout()) {
            Ok(Ok(event)) if is_relevant(&event) && !debouncer.in_cooldown() => {
                let changed = inputs.filter_registered(event.paths);
                if !changed.is_empty() {
                    debouncer.add(changed);
                }
            }
            Ok(Err(err)) => log!("watch"; "error: {err}"),
            Err(RecvTimeoutError::Timeout) if debouncer.ready() => {
                let changed = debouncer.take();
                if handle_changes(&mut context, &mut inputs, &changed) {
                    debouncer.mark_rebuild();
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
            // Irrelevant events, cooldown drops, idle timeouts.
            _ => {}
        }
    }

    Ok(())
}
