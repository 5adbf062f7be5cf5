//! `node`-backed [`RenderBackend`].
//!
//! Every call spawns a fresh `node` process running a small embedded
//! driver: request JSON goes in on stdin, the driver imports the
//! server bundle, and the response JSON comes back on stdout. A fresh
//! process per call means a fresh module registry, so a rebuild can
//! never be rendered through a stale evaluation of the previous
//! bundle.

use std::path::{Path, PathBuf};

use rustc_hash::FxHashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::build::Artifacts;
use crate::pages::PageDescriptor;
use crate::render::{RenderBackend, RenderError, RenderPlan, SiteMetadata};
use crate::utils::command::{locate_tool, run_captured};

/// Driver evaluated with `node --input-type=module --eval`. Composes
/// each page the same way the hydration bootstrap does: the parent
/// wrapper (one level) around the component, the template, when
/// declared, around both. The parent's template overrides the child's.
const DRIVER_JS: &str = r#"const readStream = async stream => {
  const chunks = [];

  for await (const chunk of stream) {
    chunks.push(chunk);
  }

  return Buffer.concat(chunks).toString("utf8");
};

const composePage = (framework, module, props) => {
  const { default: component, parent, template: childTemplate } = module;
  let templateComponent = childTemplate?.default;
  let element = framework.createElement(component, props);

  if (parent) {
    templateComponent = parent.template?.default ?? templateComponent;
    element = framework.createElement(parent.default, props, element);
  }

  if (templateComponent) {
    element = framework.createElement(templateComponent, props, element);
  }

  return element;
};

const main = async () => {
  const request = JSON.parse(await readStream(process.stdin));
  const { pathToFileURL } = await import("node:url");

  const bundleUrl = pathToFileURL(request.bundlePath);
  bundleUrl.searchParams.set("v", String(request.version));

  const namespace = await import(bundleUrl.href);
  const bundle = namespace.default ?? namespace;
  const response = {};

  if (request.mode === "inspect") {
    for (const name of request.pages) {
      response[name] = Object.assign({}, bundle[name]?.metadata);
    }
  } else {
    const { framework, server } = bundle;

    for (const name of request.pages) {
      const page = request.site.pages.find(
        entry => entry.moduleExportName === name
      );
      const metadata = { ...request.site, page };
      const element = composePage(framework, bundle[name], { metadata });

      response[name] = server.renderToString(element);
    }
  }

  process.stdout.write(JSON.stringify(response));
};

main().catch(error => {
  console.error(error?.stack ?? String(error));
  process.exit(1);
});
"#;

pub struct NodeBackend {
    binary: PathBuf,
}

impl NodeBackend {
    /// Locate `node` on PATH.
    pub fn locate() -> std::io::Result<Self> {
        Ok(Self {
            binary: locate_tool("node")?,
        })
    }

    fn run<T: DeserializeOwned>(&self, request: &DriverRequest) -> Result<T, RenderError> {
        let payload = serde_json::to_vec(request)?;
        let cwd = request.bundle_path.parent().unwrap_or(Path::new("."));

        let captured = run_captured(
            &self.binary,
            ["--input-type=module", "--eval", DRIVER_JS],
            cwd,
            Some(&payload),
        )
        .map_err(RenderError::Launch)?;

        if !captured.success {
            let text = match captured.stderr.trim() {
                "" => "render runtime exited with an error".to_string(),
                stderr => stderr.to_string(),
            };

            return Err(RenderError::Backend(text));
        }

        serde_json::from_slice(&captured.stdout)
            .map_err(|err| RenderError::Output(err.to_string()))
    }
}

/// Request payload for one driver run. The version gives every build a
/// distinct module URL, so even a reused evaluator could not observe a
/// stale bundle.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DriverRequest<'a> {
    mode: &'a str,
    bundle_path: &'a Path,
    version: u64,
    pages: Vec<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    site: Option<&'a SiteMetadata>,
}

impl RenderBackend for NodeBackend {
    fn inspect(
        &self,
        artifacts: &Artifacts,
        pages: &[PageDescriptor],
    ) -> Result<FxHashMap<String, Map<String, Value>>, RenderError> {
        self.run(&DriverRequest {
            mode: "inspect",
            bundle_path: &artifacts.server_bundle_file,
            version: artifacts.version,
            pages: pages.iter().map(|page| page.export_name.as_str()).collect(),
            site: None,
        })
    }

    fn render(
        &self,
        artifacts: &Artifacts,
        plan: &RenderPlan,
    ) -> Result<FxHashMap<String, String>, RenderError> {
        self.run(&DriverRequest {
            mode: "render",
            bundle_path: &artifacts.server_bundle_file,
            version: artifacts.version,
            pages: plan
                .documents
                .iter()
                .map(|document| document.export_name.as_str())
                .collect(),
            site: Some(&plan.site),
        })
    }
}
