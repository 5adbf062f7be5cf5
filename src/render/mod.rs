//! Server-side rendering and site metadata.
//!
//! After a successful build the renderer turns the server bundle into
//! one HTML document per page. Document layout mirrors source layout:
//! output paths preserve each page's sub-path below the longest common
//! ancestor of all page sources. Per-page declared metadata is
//! collected first, the combined site metadata document is written
//! once planning is complete, and only then are the documents
//! rendered and written. A failed render therefore never leaves a
//! half-updated document set with fresh metadata pointing at it.
//!
//! The bundle evaluation itself happens behind [`RenderBackend`]; the
//! production implementation runs `node` in a fresh process per pass,
//! so a rebuild can never observe a stale module evaluation.

pub mod node;
pub mod worker;

pub use node::NodeBackend;

use std::fs;
use std::path::{Path, PathBuf};

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::build::Artifacts;
use crate::config::SiteConfig;
use crate::log;
use crate::pages::PageDescriptor;
use crate::paths::{ProjectPaths, url_join};

pub const HTML_DOCTYPE: &str = "<!DOCTYPE html>";

/// Metadata keys owned by the pipeline. Page-declared fields with
/// these names are dropped rather than letting them spoof identity.
const RESERVED_PAGE_FIELDS: [&str; 3] = ["moduleExportName", "moduleFilePath", "documentUrl"];

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("Failed to run the render runtime")]
    Launch(#[source] std::io::Error),

    #[error("Render runtime failed: {0}")]
    Backend(String),

    #[error("Render runtime returned no document for `{0}`")]
    MissingPage(String),

    #[error("Malformed render runtime output: {0}")]
    Output(String),

    #[error("Failed to serialize site metadata")]
    Metadata(#[from] serde_json::Error),

    #[error("IO error while writing rendered documents")]
    Io(#[from] std::io::Error),
}

/// One page's entry in the site metadata document. Page-declared
/// fields are flattened alongside the pipeline-owned ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageMetadata {
    pub module_export_name: String,
    pub module_file_path: String,
    pub document_url: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildMetadata {
    pub client_bundle_url: String,
}

/// The combined metadata document, served from the build directory and
/// consumed by both the renderer and the client hydration bootstrap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteMetadata {
    pub build: BuildMetadata,
    pub project: Map<String, Value>,
    pub pages: Vec<PageMetadata>,
}

/// Where one page's document goes and under which URL it is reachable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentPlan {
    pub export_name: String,
    pub document_file: PathBuf,
    pub document_url: String,
}

/// Fully planned render pass: the site metadata to publish and the
/// documents to write.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderPlan {
    pub site: SiteMetadata,
    pub documents: Vec<DocumentPlan>,
}

/// Evaluates the server bundle. `inspect` collects page-declared
/// metadata for planning, `render` produces the HTML bodies (without
/// doctype). Each call must observe the bundle version in `artifacts`,
/// never a cached evaluation of an older one.
pub trait RenderBackend: Send + Sync {
    fn inspect(
        &self,
        artifacts: &Artifacts,
        pages: &[PageDescriptor],
    ) -> Result<FxHashMap<String, Map<String, Value>>, RenderError>;

    fn render(
        &self,
        artifacts: &Artifacts,
        plan: &RenderPlan,
    ) -> Result<FxHashMap<String, String>, RenderError>;
}

/// Document paths relative to the build directory, one per page, with
/// the extension replaced by `.html` and the common ancestor stripped.
pub fn document_rel_paths(rel_paths: &[&str]) -> Vec<String> {
    let common = common_ancestor(rel_paths);

    rel_paths
        .iter()
        .map(|rel_path| document_rel_path(rel_path, &common))
        .collect()
}

fn parent_components(rel_path: &str) -> Vec<&str> {
    let mut parts: Vec<&str> = rel_path.split('/').filter(|part| !part.is_empty()).collect();
    parts.pop();
    parts
}

fn common_ancestor<'a>(rel_paths: &[&'a str]) -> Vec<&'a str> {
    let mut iter = rel_paths.iter();
    let Some(first) = iter.next() else {
        return Vec::new();
    };

    let mut common = parent_components(first);

    for rel_path in iter {
        let components = parent_components(rel_path);
        let shared = common
            .iter()
            .zip(&components)
            .take_while(|(ours, theirs)| ours == theirs)
            .count();

        common.truncate(shared);
    }

    common
}

fn document_rel_path(rel_path: &str, common: &[&str]) -> String {
    let parents = parent_components(rel_path);
    let stem = Path::new(rel_path)
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();

    let document = format!("{stem}.html");
    let mut parts: Vec<&str> = parents.get(common.len()..).unwrap_or(&[]).to_vec();
    parts.push(&document);

    parts.join("/")
}

/// Plan the render pass: document paths and URLs for every page plus
/// the site metadata combining pipeline-owned and page-declared
/// fields.
pub fn plan(
    paths: &ProjectPaths,
    config: &SiteConfig,
    pages: &[PageDescriptor],
    mut page_fields: FxHashMap<String, Map<String, Value>>,
) -> RenderPlan {
    let rel_paths: Vec<&str> = pages.iter().map(|page| page.rel_path.as_str()).collect();
    let document_rels = document_rel_paths(&rel_paths);

    let mut site_pages = Vec::with_capacity(pages.len());
    let mut documents = Vec::with_capacity(pages.len());

    for (page, document_rel) in pages.iter().zip(&document_rels) {
        let document_url = url_join(&config.build.base_url, document_rel);

        let mut fields = page_fields.remove(&page.export_name).unwrap_or_default();
        for key in RESERVED_PAGE_FIELDS {
            fields.remove(key);
        }

        site_pages.push(PageMetadata {
            module_export_name: page.export_name.clone(),
            module_file_path: page.rel_path.clone(),
            document_url: document_url.clone(),
            fields,
        });

        documents.push(DocumentPlan {
            export_name: page.export_name.clone(),
            document_file: paths.build_dir.join(document_rel),
            document_url,
        });
    }

    RenderPlan {
        site: SiteMetadata {
            build: BuildMetadata {
                client_bundle_url: paths.client_bundle_url(&config.build.base_url),
            },
            project: config.metadata.clone(),
            pages: site_pages,
        },
        documents,
    }
}

/// Render the whole site from the latest published bundle.
pub fn render_site(
    backend: &dyn RenderBackend,
    paths: &ProjectPaths,
    config: &SiteConfig,
    pages: &[PageDescriptor],
    artifacts: &Artifacts,
) -> Result<(), RenderError> {
    let page_fields = backend.inspect(artifacts, pages)?;
    let plan = plan(paths, config, pages, page_fields);

    fs::create_dir_all(&paths.build_dir)?;
    fs::write(&paths.metadata_file, serde_json::to_vec_pretty(&plan.site)?)?;

    let rendered = backend.render(artifacts, &plan)?;

    for document in &plan.documents {
        let body = rendered
            .get(&document.export_name)
            .ok_or_else(|| RenderError::MissingPage(document.export_name.clone()))?;

        if let Some(parent) = document.document_file.parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(&document.document_file, format!("{HTML_DOCTYPE}{body}"))?;
        log!("render"; "{}", document.document_url);
    }

    Ok(())
}

#[cfg(test)]
pub mod testing {
    //! Scripted backend for render and serve tests.

    use super::*;

    #[derive(Default)]
    pub struct FakeBackend {
        pub fields: FxHashMap<String, Map<String, Value>>,
        pub bodies: FxHashMap<String, String>,
        pub fail_render: bool,
    }

    impl RenderBackend for FakeBackend {
        fn inspect(
            &self,
            _artifacts: &Artifacts,
            _pages: &[PageDescriptor],
        ) -> Result<FxHashMap<String, Map<String, Value>>, RenderError> {
            Ok(self.fields.clone())
        }

        fn render(
            &self,
            _artifacts: &Artifacts,
            _plan: &RenderPlan,
        ) -> Result<FxHashMap<String, String>, RenderError> {
            if self.fail_render {
                return Err(RenderError::Backend("scripted failure".to_string()));
            }

            Ok(self.bodies.clone())
        }
    }

    pub fn descriptor(rel_path: &str) -> PageDescriptor {
        PageDescriptor {
            source_file: PathBuf::from("/proj").join(rel_path),
            rel_path: rel_path.to_string(),
            export_name: crate::pages::export_name(rel_path),
        }
    }
}
