//! esbuild-backed [`Bundler`].
//!
//! Drives an external `esbuild` binary. The synthesized entry module
//! goes in on stdin, outputs land in a throwaway staging directory and
//! are read back into memory, so the orchestrator alone decides what
//! reaches the build directory. Contributing inputs come from the
//! metafile, diagnostics from parsing esbuild's stderr report.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use walkdir::WalkDir;

use crate::bundler::{
    BuildError, BundleJob, BundleTarget, Bundler, Diagnostic, OutputFile, TargetOutput,
};
use crate::utils::command::{locate_tool, run_captured};

/// Extensions emitted as hashed asset files instead of being inlined.
const FILE_LOADER_EXTENSIONS: [&str; 4] = [".png", ".jpg", ".svg", ".css"];
const PUBLIC_PATH: &str = "/";

pub struct EsbuildCli {
    binary: PathBuf,
}

impl EsbuildCli {
    /// Locate `esbuild` on PATH.
    pub fn locate() -> std::io::Result<Self> {
        Ok(Self {
            binary: locate_tool("esbuild")?,
        })
    }
}

impl Bundler for EsbuildCli {
    fn bundle(&self, job: &BundleJob) -> Result<TargetOutput, BuildError> {
        let staging = tempfile::tempdir()?;
        let outdir = staging.path().join("out");
        let metafile = staging.path().join("meta.json");

        let args = build_args(job.target, &outdir, &metafile);
        let captured = run_captured(
            &self.binary,
            &args,
            &job.project_dir,
            Some(job.entry_source.as_bytes()),
        )
        .map_err(BuildError::Launch)?;

        if !captured.success {
            return Err(BuildError::Failed {
                diagnostics: parse_diagnostics(&captured.stderr),
            });
        }

        Ok(TargetOutput {
            output_files: collect_outputs(&outdir, job.target)?,
            input_file_paths: read_inputs(&metafile, &job.project_dir, job.target)?,
        })
    }
}

fn build_args(target: BundleTarget, outdir: &Path, metafile: &Path) -> Vec<String> {
    let mut args = vec![
        "--bundle".to_string(),
        format!("--platform={}", target.platform()),
        // Names the stdin entry, which in turn names its output chunk.
        format!("--sourcefile={}", target.bundle_file_name()),
        "--loader=js".to_string(),
        format!("--outdir={}", outdir.display()),
        format!("--metafile={}", metafile.display()),
        format!("--public-path={PUBLIC_PATH}"),
        "--log-level=error".to_string(),
        "--color=false".to_string(),
    ];

    for extension in FILE_LOADER_EXTENSIONS {
        args.push(format!("--loader:{extension}=file"));
    }

    args
}

/// Read every file esbuild wrote to the staging directory, mapping the
/// entry chunk onto the target's bundle file name.
fn collect_outputs(outdir: &Path, target: BundleTarget) -> Result<Vec<OutputFile>, BuildError> {
    let mut files = Vec::new();

    for entry in WalkDir::new(outdir).sort_by_file_name() {
        let entry = entry.map_err(|err| BuildError::Io(err.into()))?;

        if !entry.file_type().is_file() {
            continue;
        }

        let rel = entry
            .path()
            .strip_prefix(outdir)
            .unwrap_or(entry.path())
            .to_path_buf();

        // Older esbuild releases name the stdin chunk `stdin.js`
        // regardless of the sourcefile flag.
        let path = if rel == Path::new("stdin.js") || rel == Path::new(target.bundle_file_name()) {
            PathBuf::from(target.bundle_file_name())
        } else {
            rel
        };

        files.push(OutputFile {
            path,
            contents: fs::read(entry.path())?,
        });
    }

    Ok(files)
}

#[derive(Deserialize)]
struct Metafile {
    inputs: BTreeMap<String, serde_json::Value>,
}

/// Contributing source files from the metafile, as absolute paths. The
/// stdin pseudo-input is not a file on disk and is skipped.
fn read_inputs(
    metafile_path: &Path,
    project_dir: &Path,
    target: BundleTarget,
) -> Result<Vec<PathBuf>, BuildError> {
    let raw = fs::read_to_string(metafile_path)?;
    let metafile: Metafile =
        serde_json::from_str(&raw).map_err(|err| BuildError::Metadata(err.to_string()))?;

    let inputs = metafile
        .inputs
        .into_keys()
        .filter(|key| key != "<stdin>" && key != target.bundle_file_name())
        .map(|key| {
            let path = PathBuf::from(key);

            if path.is_absolute() {
                path
            } else {
                project_dir.join(path)
            }
        })
        .collect();

    Ok(inputs)
}

/// Parse esbuild's stderr error report into diagnostics.
///
/// The report prints one header line per error followed by an indented
/// `file:line:column:` location and a code excerpt. Headers without a
/// location (resolution setup failures and the like) keep their text
/// only. Unrecognizable stderr becomes a single opaque diagnostic so a
/// failure is never silent.
fn parse_diagnostics(stderr: &str) -> Vec<Diagnostic> {
    static HEADER: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"^✘ \[ERROR\] (.+)$").unwrap());
    static LOCATION: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"^[ \t]+(.+):([0-9]+):([0-9]+):[ \t]*$").unwrap());

    let mut diagnostics = Vec::new();
    let mut current: Option<Diagnostic> = None;

    for line in stderr.lines() {
        if let Some(captures) = HEADER.captures(line) {
            if let Some(done) = current.take() {
                diagnostics.push(done);
            }

            current = Some(Diagnostic {
                text: captures[1].trim().to_string(),
                file: None,
                line: None,
                column: None,
            });
            continue;
        }

        if let Some(diagnostic) = current.as_mut()
            && diagnostic.file.is_none()
            && let Some(captures) = LOCATION.captures(line)
        {
            diagnostic.file = Some(captures[1].trim().to_string());
            diagnostic.line = captures[2].parse().ok();
            diagnostic.column = captures[3].parse().ok();
        }
    }

    if let Some(done) = current.take() {
        diagnostics.push(done);
    }

    if diagnostics.is_empty() {
        let text = match stderr.trim() {
            "" => "bundling failed without diagnostics".to_string(),
            raw => raw.to_string(),
        };

        diagnostics.push(Diagnostic {
            text,
            file: None,
            line: None,
            column: None,
        });
    }

    diagnostics
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPORT: &str = "\u{2718} [ERROR] Could not resolve \"./missing\"\n\
        \n\
        \x20   pages/home.jsx:3:7:\n\
        \x20     3 \u{2502} import missing from \"./missing\";\n\
        \x20       \u{2575}                     ~~~~~~~~~~~\n\
        \n\
        \u{2718} [ERROR] Expected \"}\" but found end of file\n\
        \n\
        \x20   pages/about.jsx:12:0:\n\
        \n\
        2 errors\n";

    #[test]
    fn test_parse_diagnostics_report() {
        let diagnostics = parse_diagnostics(REPORT);

        assert_eq!(diagnostics.len(), 2);
        assert_eq!(diagnostics[0].text, "Could not resolve \"./missing\"");
        assert_eq!(diagnostics[0].file.as_deref(), Some("pages/home.jsx"));
        assert_eq!(diagnostics[0].line, Some(3));
        assert_eq!(diagnostics[0].column, Some(7));
        assert_eq!(diagnostics[1].file.as_deref(), Some("pages/about.jsx"));
        assert_eq!(diagnostics[1].line, Some(12));
    }

    #[test]
    fn test_parse_diagnostics_without_location() {
        let report = "\u{2718} [ERROR] Cannot use \"file\" loader without an output path\n";
        let diagnostics = parse_diagnostics(report);

        assert_eq!(diagnostics.len(), 1);
        assert!(diagnostics[0].file.is_none());
    }

    #[test]
    fn test_parse_diagnostics_opaque_fallback() {
        let diagnostics = parse_diagnostics("segmentation fault\n");

        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].text, "segmentation fault");
    }

    #[test]
    fn test_build_args_per_target() {
        let outdir = PathBuf::from("/tmp/out");
        let metafile = PathBuf::from("/tmp/meta.json");

        let client = build_args(BundleTarget::Client, &outdir, &metafile);
        assert!(client.contains(&"--platform=browser".to_string()));
        assert!(client.contains(&"--sourcefile=mica-client.js".to_string()));
        assert!(client.contains(&"--loader:.png=file".to_string()));
        assert!(client.contains(&"--public-path=/".to_string()));

        let server = build_args(BundleTarget::Server, &outdir, &metafile);
        assert!(server.contains(&"--platform=node".to_string()));
        assert!(server.contains(&"--sourcefile=mica-server.js".to_string()));
    }

    #[test]
    fn test_collect_outputs_renames_entry_chunk() {
        let staging = tempfile::tempdir().unwrap();
        fs::write(staging.path().join("stdin.js"), "bundle").unwrap();
        fs::create_dir_all(staging.path().join("assets")).unwrap();
        fs::write(staging.path().join("assets/logo-ABCD1234.png"), "png").unwrap();

        let outputs = collect_outputs(staging.path(), BundleTarget::Client).unwrap();
        let paths: Vec<&Path> = outputs.iter().map(|file| file.path.as_path()).collect();

        assert!(paths.contains(&Path::new("mica-client.js")));
        assert!(paths.contains(&Path::new("assets/logo-ABCD1234.png")));
    }

    #[test]
    fn test_read_inputs_filters_and_absolutizes() {
        let staging = tempfile::tempdir().unwrap();
        let metafile = staging.path().join("meta.json");
        fs::write(
            &metafile,
            r#"{
                "inputs": {
                    "mica-client.js": { "bytes": 10, "imports": [] },
                    "pages/home.jsx": { "bytes": 120, "imports": [] },
                    "node_modules/mica/index.js": { "bytes": 900, "imports": [] }
                },
                "outputs": {}
            }"#,
        )
        .unwrap();

        let inputs = read_inputs(&metafile, Path::new("/proj"), BundleTarget::Client).unwrap();

        assert_eq!(
            inputs,
            vec![
                PathBuf::from("/proj/node_modules/mica/index.js"),
                PathBuf::from("/proj/pages/home.jsx"),
            ]
        );
    }
}
