//! Mica - build React projects into static HTML sites.

mod build;
mod bundler;
mod cli;
mod codegen;
mod config;
mod logger;
mod pages;
mod paths;
mod render;
mod serve;
mod utils;
mod watch;

use anyhow::{Context, Result};
use build::build_site;
use clap::Parser;
use cli::{Cli, Commands};
use serve::serve_site;
use std::path::PathBuf;

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Build { project } => build_site(canonical_project_dir(project)?),
        Commands::Serve {
            project,
            interface,
            port,
        } => serve_site(canonical_project_dir(project)?, &interface, port),
    }
}

/// Resolve the project directory to an absolute path so bundler input
/// paths and watcher registrations agree.
fn canonical_project_dir(project: PathBuf) -> Result<PathBuf> {
    project
        .canonicalize()
        .with_context(|| format!("Project directory not found: {}", project.display()))
}
