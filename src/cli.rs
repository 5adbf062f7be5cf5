//! Command-line interface definitions.
//!
//! Defines all CLI arguments and subcommands using clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Mica static site generator CLI
#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None, arg_required_else_help = true)]
pub struct Cli {
    /// subcommands
    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Bundle the project and render every page into the build
    /// directory
    Build {
        /// Project directory containing mica.json
        #[arg(default_value = ".")]
        project: PathBuf,
    },

    /// Serve the build directory. Rebuild and reload on change
    /// automatically
    Serve {
        /// Project directory containing mica.json
        #[arg(default_value = ".")]
        project: PathBuf,

        /// Interface to bind on
        #[arg(short, long, default_value = "0.0.0.0")]
        interface: String,

        /// Port to listen on
        #[arg(short, long, default_value_t = 8080)]
        port: u16,
    },
}
