//! Project configuration loading.
//!
//! Configuration lives in a `mica.json` file at the project root:
//!
//! ```json
//! {
//!   "metadata": { "title": "My Site" },
//!   "pages": ["src/pages/*.jsx", "src/posts/**/*.jsx"],
//!   "build": { "baseUrl": "/" }
//! }
//! ```
//!
//! The file is read once per `build`/`serve` invocation and stays
//! immutable for the life of that invocation; editing it requires a
//! restart.

mod error;

pub use error::ConfigError;

use educe::Educe;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{fs, path::Path};

/// Built-in defaults shared by serde and the `Default` derives.
mod defaults {
    pub mod build {
        pub fn base_url() -> String {
            "/".to_string()
        }

        pub fn runtime() -> String {
            "mica".to_string()
        }
    }
}

/// Project configuration read from `mica.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SiteConfig {
    /// Opaque project metadata, copied verbatim into the generated
    /// site metadata document under `project`.
    #[serde(default)]
    pub metadata: Map<String, Value>,

    /// Ordered page patterns, relative to the project directory.
    /// Non-glob entries pass through as literal module paths.
    #[serde(default)]
    pub pages: Vec<String>,

    /// `build` section.
    #[serde(default)]
    pub build: BuildConfig,
}

/// `build` section in mica.json - URL and codegen settings.
///
/// # Example
/// ```json
/// { "build": { "baseUrl": "/", "runtime": "mica", "allowUnmatched": false } }
/// ```
#[derive(Debug, Clone, Educe, Serialize, Deserialize)]
#[educe(Default)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct BuildConfig {
    /// URL prefix for generated document and bundle URLs.
    /// Root-relative (`/`) by default; absolute URLs are accepted.
    #[serde(default = "defaults::build::base_url")]
    #[educe(Default = defaults::build::base_url())]
    pub base_url: String,

    /// Rendering-framework package imported by the generated entry
    /// modules (`<runtime>/client` and `<runtime>/server`).
    #[serde(default = "defaults::build::runtime")]
    #[educe(Default = defaults::build::runtime())]
    pub runtime: String,

    /// Allow page patterns that match no files instead of failing.
    #[serde(default)]
    pub allow_unmatched: bool,
}

impl SiteConfig {
    /// Parse configuration from a JSON string.
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file path.
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let content =
            fs::read_to_string(path).map_err(|err| ConfigError::Io(path.to_path_buf(), err))?;
        Self::from_str(&content)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.pages.is_empty() {
            return Err(ConfigError::Validation(
                "`pages` must list at least one page pattern".to_string(),
            ));
        }

        if self.build.base_url.is_empty() {
            return Err(ConfigError::Validation(
                "`build.baseUrl` must not be empty".to_string(),
            ));
        }

        Ok(())
    }
}
