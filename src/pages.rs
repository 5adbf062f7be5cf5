//! Page resolution.
//!
//! Turns the `pages` patterns from `mica.json` into a flat, ordered
//! list of [`PageDescriptor`]s. Patterns are expanded in config order,
//! matches within one pattern come back alphabetically, and a path
//! that matches twice keeps its first position. Patterns without glob
//! metacharacters are taken verbatim and never checked against disk,
//! so generated or not-yet-written files can be listed up front.

use std::path::{Path, PathBuf};

use colored::Colorize;
use rustc_hash::{FxHashMap, FxHashSet};
use thiserror::Error;

use crate::log;
use crate::utils::hash::ident_digest;

#[derive(Debug, Error)]
pub enum PagesError {
    #[error("Invalid page pattern `{0}`")]
    Pattern(String, #[source] glob::PatternError),

    #[error("Failed to expand page pattern `{0}`")]
    Expand(String, #[source] glob::GlobError),

    #[error("No files matched page pattern `{0}`")]
    Unmatched(String),

    #[error("Page patterns resolved to an empty page set")]
    Empty,

    #[error("Pages `{1}` and `{2}` both export as `{0}`")]
    ExportCollision(String, String, String),
}

/// One resolved page: where its module lives and the identifier its
/// namespace is exported under in the generated entry files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageDescriptor {
    /// Absolute path of the page module.
    pub source_file: PathBuf,
    /// Project-relative path with forward slashes. This is the stable
    /// identity of the page, independent of machine and working dir.
    pub rel_path: String,
    /// Valid JS identifier, unique across the page set.
    pub export_name: String,
}

/// Expand the configured page patterns into page descriptors.
///
/// A glob pattern matching nothing is an error unless `allow_unmatched`
/// downgrades it to a logged skip. An empty final page set is always an
/// error.
pub fn resolve_pages(
    project_dir: &Path,
    patterns: &[String],
    allow_unmatched: bool,
) -> Result<Vec<PageDescriptor>, PagesError> {
    let mut seen = FxHashSet::default();
    let mut names = FxHashMap::default();
    let mut pages = Vec::new();

    for pattern in patterns {
        if !is_glob_pattern(pattern) {
            push_page(project_dir, pattern.clone(), &mut seen, &mut names, &mut pages)?;
            continue;
        }

        let full_pattern = project_dir.join(pattern);
        let entries = glob::glob(&full_pattern.to_string_lossy())
            .map_err(|err| PagesError::Pattern(pattern.clone(), err))?;

        let mut matched = false;

        for entry in entries {
            let path = entry.map_err(|err| PagesError::Expand(pattern.clone(), err))?;

            if !path.is_file() {
                continue;
            }

            matched = true;
            let rel_path = rel_path_str(project_dir, &path);
            push_page(project_dir, rel_path, &mut seen, &mut names, &mut pages)?;
        }

        if !matched {
            if allow_unmatched {
                log!("build"; "Pattern {} matched no files, skipping", pattern.bold());
            } else {
                return Err(PagesError::Unmatched(pattern.clone()));
            }
        }
    }

    if pages.is_empty() {
        return Err(PagesError::Empty);
    }

    Ok(pages)
}

/// Derive the export identifier for a page path.
///
/// The sanitized file stem keeps the name readable, the digest of the
/// full relative path makes it unique: `pages/about-us.jsx` becomes
/// `about_us<32 hex chars>`.
pub fn export_name(rel_path: &str) -> String {
    let stem = Path::new(rel_path)
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut name = String::with_capacity(stem.len() + 33);

    if stem.chars().next().is_some_and(|first| first.is_ascii_digit()) {
        name.push('_');
    }

    for ch in stem.chars() {
        if ch.is_ascii_alphanumeric() || ch == '_' {
            name.push(ch);
        } else {
            name.push('_');
        }
    }

    name.push_str(&ident_digest(rel_path));
    name
}

/// True when the pattern needs glob expansion. Everything else is a
/// plain literal path.
fn is_glob_pattern(pattern: &str) -> bool {
    pattern.contains(['*', '?', '['])
}

fn push_page(
    project_dir: &Path,
    rel_path: String,
    seen: &mut FxHashSet<String>,
    names: &mut FxHashMap<String, String>,
    pages: &mut Vec<PageDescriptor>,
) -> Result<(), PagesError> {
    // First occurrence wins; later matches of the same path are dropped.
    if !seen.insert(rel_path.clone()) {
        return Ok(());
    }

    let export_name = export_name(&rel_path);

    if let Some(other) = names.insert(export_name.clone(), rel_path.clone()) {
        return Err(PagesError::ExportCollision(export_name, other, rel_path));
    }

    pages.push(PageDescriptor {
        source_file: project_dir.join(&rel_path),
        rel_path,
        export_name,
    });

    Ok(())
}

fn rel_path_str(project_dir: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(project_dir).unwrap_or(path);
    rel.to_string_lossy().replace('\\', "/")
}
