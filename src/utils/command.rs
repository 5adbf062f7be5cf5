//! External command execution helpers.
//!
//! The bundler and the render backend both drive external tools as
//! child processes. Everything here is blocking: spawn, feed stdin,
//! wait, hand back captured output.

use std::ffi::OsStr;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// Captured result of a finished child process.
#[derive(Debug)]
pub struct Captured {
    pub success: bool,
    pub stdout: Vec<u8>,
    pub stderr: String,
}

/// Locate an external tool on `PATH`.
pub fn locate_tool(name: &str) -> io::Result<PathBuf> {
    which::which(name).map_err(|err| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("`{name}` not found on PATH ({err}); install it to use this command"),
        )
    })
}

/// Run a command to completion, optionally feeding `stdin`, and capture
/// both output streams.
///
/// Stdin is written from a detached thread so a child that floods its
/// output pipes before draining stdin cannot deadlock the caller.
pub fn run_captured<I, S>(
    program: &Path,
    args: I,
    cwd: &Path,
    stdin: Option<&[u8]>,
) -> io::Result<Captured>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut command = Command::new(program);
    command
        .args(args)
        .current_dir(cwd)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

    let mut child = command.spawn()?;

    if let Some(data) = stdin
        && let Some(mut pipe) = child.stdin.take()
    {
        let payload = data.to_vec();
        std::thread::spawn(move || {
            // A child that exits early closes the pipe; nothing to do.
            let _ = pipe.write_all(&payload);
        });
    }

    let output = child.wait_with_output()?;

    Ok(Captured {
        success: output.status.success(),
        stdout: output.stdout,
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}
