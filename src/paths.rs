//! Canonical file-system layout of a project.
//!
//! Every path the pipeline touches derives from the project root:
//!
//! ```text
//! <project>/
//!     mica.json            config file
//!     build/               build directory
//!         mica-client.js   browser bundle
//!         mica-server.js   server bundle (renderer-only, still served)
//!         metadata.json    combined site metadata document
//!         **/*.html        rendered documents
//! ```
//!
//! The layout is computed once per invocation and never mutated.

use std::path::{Path, PathBuf};

pub const BUILD_DIRECTORY_NAME: &str = "build";
pub const CONFIG_FILE_NAME: &str = "mica.json";
pub const CLIENT_BUNDLE_FILE_NAME: &str = "mica-client.js";
pub const SERVER_BUNDLE_FILE_NAME: &str = "mica-server.js";
pub const METADATA_FILE_NAME: &str = "metadata.json";

/// Canonical paths for one project, derived from its root directory.
#[derive(Debug, Clone)]
pub struct ProjectPaths {
    pub project_dir: PathBuf,
    pub build_dir: PathBuf,
    pub config_file: PathBuf,
    pub client_bundle_file: PathBuf,
    pub server_bundle_file: PathBuf,
    pub metadata_file: PathBuf,
}

impl ProjectPaths {
    /// Derive the full layout from a project root directory.
    pub fn new<P: Into<PathBuf>>(project_dir: P) -> Self {
        let project_dir = project_dir.into();
        let build_dir = project_dir.join(BUILD_DIRECTORY_NAME);

        Self {
            config_file: project_dir.join(CONFIG_FILE_NAME),
            client_bundle_file: build_dir.join(CLIENT_BUNDLE_FILE_NAME),
            server_bundle_file: build_dir.join(SERVER_BUNDLE_FILE_NAME),
            metadata_file: build_dir.join(METADATA_FILE_NAME),
            project_dir,
            build_dir,
        }
    }

    /// URL of the client bundle under the given base URL.
    pub fn client_bundle_url(&self, base_url: &str) -> String {
        self.build_file_url(&self.client_bundle_file, base_url)
    }

    /// URL of the metadata document under the given base URL.
    pub fn metadata_url(&self, base_url: &str) -> String {
        self.build_file_url(&self.metadata_file, base_url)
    }

    /// URL of a build-dir file: its path relative to the build
    /// directory, joined to the base URL.
    fn build_file_url(&self, file: &Path, base_url: &str) -> String {
        let rel = file.strip_prefix(&self.build_dir).unwrap_or(file);
        url_join(base_url, &rel.to_string_lossy())
    }
}

/// Join a base URL and a build-dir-relative path into a document URL.
///
/// The base may be root-relative (`/`, `/sub`) or absolute
/// (`https://example.org`); a single slash separates the parts either
/// way. Backslashes from Windows paths are normalized to `/`.
pub fn url_join(base_url: &str, rel_path: &str) -> String {
    let rel = rel_path.replace('\\', "/");
    let rel = rel.trim_start_matches('/');
    let base = base_url.trim_end_matches('/');

    format!("{base}/{rel}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_from_root() {
        let paths = ProjectPaths::new("/proj");

        assert_eq!(paths.project_dir, Path::new("/proj"));
        assert_eq!(paths.build_dir, Path::new("/proj/build"));
        assert_eq!(paths.config_file, Path::new("/proj/mica.json"));
        assert_eq!(paths.client_bundle_file, Path::new("/proj/build/mica-client.js"));
        assert_eq!(paths.server_bundle_file, Path::new("/proj/build/mica-server.js"));
        assert_eq!(paths.metadata_file, Path::new("/proj/build/metadata.json"));
    }

    #[test]
    fn test_url_join_root_base() {
        assert_eq!(url_join("/", "b/x.html"), "/b/x.html");
        assert_eq!(url_join("/", "metadata.json"), "/metadata.json");
    }

    #[test]
    fn test_url_join_subdirectory_base() {
        assert_eq!(url_join("/sub", "b/x.html"), "/sub/b/x.html");
        assert_eq!(url_join("/sub/", "b/x.html"), "/sub/b/x.html");
    }

    #[test]
    fn test_url_join_absolute_base() {
        assert_eq!(
            url_join("https://example.org", "b/x.html"),
            "https://example.org/b/x.html"
        );
        assert_eq!(
            url_join("https://example.org/", "/b/x.html"),
            "https://example.org/b/x.html"
        );
    }

    #[test]
    fn test_url_join_normalizes_backslashes() {
        assert_eq!(url_join("/", "b\\x.html"), "/b/x.html");
    }

    #[test]
    fn test_bundle_urls() {
        let paths = ProjectPaths::new("/proj");

        assert_eq!(paths.client_bundle_url("/"), "/mica-client.js");
        assert_eq!(
            paths.metadata_url("https://example.org"),
            "https://example.org/metadata.json"
        );
    }
}
