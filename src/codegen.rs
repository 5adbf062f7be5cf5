//! Entry-module synthesis.
//!
//! Neither build target bundles a file that exists on disk. The
//! pipeline synthesizes a small JS module per target and hands it to
//! the bundler as an in-memory entry:
//!
//! - the client entry imports the framework's client runtime and every
//!   page module, then invokes an inlined hydration bootstrap,
//! - the server entry re-exports the framework's server runtime and
//!   every page module for the renderer to pick up by export name.
//!
//! Output is deterministic for a given page list. Import specifiers
//! are JSON-escaped so arbitrary file paths survive embedding.

use crate::pages::PageDescriptor;

/// Module specifiers for the rendering framework, threaded explicitly
/// into the generated entries instead of relying on ambient globals.
///
/// A runtime package `r` is expected to expose `createElement` on its
/// root module, `hydrateRoot` under `r/client` and `renderToString`
/// under `r/server`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeContext {
    pub framework: String,
    pub client: String,
    pub server: String,
}

impl RuntimeContext {
    pub fn from_package(package: &str) -> Self {
        Self {
            framework: package.to_string(),
            client: format!("{package}/client"),
            server: format!("{package}/server"),
        }
    }
}

/// Browser-side bootstrap appended to the client entry. Runs once per
/// document load: locates the current page in the fetched metadata,
/// rebuilds the element tree the server rendered (parent wrapper
/// included) and hydrates it into the template's container. Pages
/// without a template are static and left alone.
const HYDRATE_BOOTSTRAP: &str = r#"async (runtime, pageModules, metadataUrl) => {
  let { pathname } = document.location;

  if (pathname.endsWith("/")) {
    pathname += "index.html";
  }

  const matchesPath = url => {
    if (url.startsWith("http://") || url.startsWith("https://")) {
      return new URL(url).pathname === pathname;
    }

    return url === pathname;
  };

  const response = await fetch(metadataUrl);
  const metadata = await response.json();
  const page = metadata.pages.find(
    ({ documentUrl }) => matchesPath(documentUrl)
  );

  if (!page) {
    return;
  }

  metadata["page"] = page;

  const module = pageModules[page.moduleExportName];
  const { default: component, parent, template: childTemplate } = module;
  const template = parent?.template ?? childTemplate;

  if (!template) {
    return;
  }

  const props = { metadata };
  let element = runtime.framework.createElement(component, props);

  if (parent) {
    element = runtime.framework.createElement(parent.default, props, element);
  }

  const container = document.querySelector(template.containerSelector);

  runtime.client.hydrateRoot(container, element);
}"#;

/// Generate the client entry module.
pub fn client_entry(
    runtime: &RuntimeContext,
    pages: &[PageDescriptor],
    metadata_url: &str,
) -> String {
    let mut lines = Vec::new();

    lines.push(format!("import * as framework from {};", js_string(&runtime.framework)));
    lines.push(format!("import * as client from {};", js_string(&runtime.client)));
    lines.push(page_imports(pages));
    lines.push(page_module_map("pageModules", pages));
    lines.push(format!(
        "({HYDRATE_BOOTSTRAP})({{ framework, client }}, pageModules, {});",
        js_string(metadata_url)
    ));

    lines.join("\n")
}

/// Generate the server entry module.
pub fn server_entry(runtime: &RuntimeContext, pages: &[PageDescriptor]) -> String {
    let mut lines = Vec::new();

    lines.push(format!("import * as framework from {};", js_string(&runtime.framework)));
    lines.push(format!("import * as server from {};", js_string(&runtime.server)));
    lines.push(page_imports(pages));

    let mut names = vec!["framework", "server"];
    names.extend(pages.iter().map(|page| page.export_name.as_str()));
    lines.push(export_block(&names));

    lines.join("\n")
}

fn page_imports(pages: &[PageDescriptor]) -> String {
    let lines: Vec<String> = pages
        .iter()
        .map(|page| {
            format!(
                "import * as {} from {};",
                page.export_name,
                js_string(&page.source_file.to_string_lossy())
            )
        })
        .collect();

    lines.join("\n")
}

fn page_module_map(name: &str, pages: &[PageDescriptor]) -> String {
    let mut lines = vec![format!("const {name} = {{}};")];

    for page in pages {
        lines.push(format!(
            "{name}[{}] = {};",
            js_string(&page.export_name),
            page.export_name
        ));
    }

    lines.join("\n")
}

fn export_block(names: &[&str]) -> String {
    let mut lines = vec!["export {".to_string()];

    for name in names {
        lines.push(format!("  {name},"));
    }

    lines.push("};".to_string());
    lines.join("\n")
}

/// JSON-quote a string for embedding in generated JS.
fn js_string(text: &str) -> String {
    serde_json::Value::String(text.to_owned()).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn sample_pages() -> Vec<PageDescriptor> {
        ["pages/home.jsx", "pages/about-us.jsx"]
            .iter()
            .map(|rel_path| PageDescriptor {
                source_file: PathBuf::from("/proj").join(rel_path),
                rel_path: (*rel_path).to_string(),
                export_name: crate::pages::export_name(rel_path),
            })
            .collect()
    }

    #[test]
    fn test_client_entry_shape() {
        let runtime = RuntimeContext::from_package("mica");
        let pages = sample_pages();
        let code = client_entry(&runtime, &pages, "/metadata.json");

        assert!(code.contains(r#"import * as framework from "mica";"#));
        assert!(code.contains(r#"import * as client from "mica/client";"#));
        assert!(code.contains(&format!(
            r#"import * as {} from "/proj/pages/home.jsx";"#,
            pages[0].export_name
        )));
        assert!(code.contains("const pageModules = {};"));
        assert!(code.contains(&format!(
            r#"pageModules["{0}"] = {0};"#,
            pages[1].export_name
        )));
        assert!(code.contains(r#"pageModules, "/metadata.json");"#));
        assert!(code.contains("hydrateRoot"));
    }

    #[test]
    fn test_server_entry_reexports_runtime_and_pages() {
        let runtime = RuntimeContext::from_package("mica");
        let pages = sample_pages();
        let code = server_entry(&runtime, &pages);

        assert!(code.contains(r#"import * as server from "mica/server";"#));
        assert!(code.contains("  framework,"));
        assert!(code.contains("  server,"));

        for page in &pages {
            assert!(code.contains(&format!("  {},", page.export_name)));
        }
    }

    #[test]
    fn test_entries_are_deterministic() {
        let runtime = RuntimeContext::from_package("mica");
        let pages = sample_pages();

        assert_eq!(
            client_entry(&runtime, &pages, "/metadata.json"),
            client_entry(&runtime, &pages, "/metadata.json")
        );
        assert_eq!(server_entry(&runtime, &pages), server_entry(&runtime, &pages));
    }

    #[test]
    fn test_specifiers_are_json_escaped() {
        let runtime = RuntimeContext::from_package("mica");
        let pages = vec![PageDescriptor {
            source_file: PathBuf::from(r#"/proj/pages/we"ird.jsx"#),
            rel_path: r#"pages/we"ird.jsx"#.to_string(),
            export_name: "weird_page".to_string(),
        }];

        let code = server_entry(&runtime, &pages);
        assert!(code.contains(r#"from "/proj/pages/we\"ird.jsx";"#));
    }

    #[test]
    fn test_runtime_context_subpaths() {
        let runtime = RuntimeContext::from_package("mica");

        assert_eq!(runtime.framework, "mica");
        assert_eq!(runtime.client, "mica/client");
        assert_eq!(runtime.server, "mica/server");
    }
}
