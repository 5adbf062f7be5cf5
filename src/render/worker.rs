//! One-shot render worker.
//!
//! Each render pass runs on its own short-lived thread and reports
//! back over a channel. The parent has exactly one interaction with
//! the worker: wait for its result. This keeps bundle evaluation side
//! effects off the watch loop's thread without introducing a pool or
//! any shared mutable state.

use std::sync::Arc;
use std::sync::mpsc;
use std::thread;

use crate::build::Artifacts;
use crate::config::SiteConfig;
use crate::pages::PageDescriptor;
use crate::paths::ProjectPaths;
use crate::render::{RenderBackend, RenderError, render_site};

/// Everything one render pass needs, owned so it can move to the
/// worker thread.
#[derive(Clone)]
pub struct RenderTask {
    pub paths: ProjectPaths,
    pub config: SiteConfig,
    pub pages: Vec<PageDescriptor>,
    pub artifacts: Arc<Artifacts>,
}

/// Run one render pass on a dedicated thread and wait for it to
/// finish.
pub fn render_in_worker(
    backend: Arc<dyn RenderBackend>,
    task: RenderTask,
) -> Result<(), RenderError> {
    let (sender, receiver) = mpsc::channel();

    let handle = thread::Builder::new()
        .name("render".to_string())
        .spawn(move || {
            let result = render_site(
                backend.as_ref(),
                &task.paths,
                &task.config,
                &task.pages,
                &task.artifacts,
            );

            // The parent may only be gone if it is shutting down.
            let _ = sender.send(result);
        })
        .map_err(RenderError::Launch)?;

    let result = match receiver.recv() {
        Ok(result) => result,
        Err(_) => Err(RenderError::Backend(
            "render worker terminated without a result".to_string(),
        )),
    };

    let _ = handle.join();
    result
}
