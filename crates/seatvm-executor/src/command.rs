//! Thin wrapper over `tokio::process::Command` for the host tools we shell out to.

use anyhow::{anyhow, Context, Result};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Output;
use tokio::process::Command;
use tracing::debug;

/// Run a program to completion and fail with its stderr if it exits non-zero.
pub async fn run<I, S>(program: impl AsRef<OsStr>, args: I) -> Result<Output>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = output(program.as_ref(), args).await?;
    if !output.status.success() {
        return Err(anyhow!(
            "{} exited with {}: {}",
            program.as_ref().to_string_lossy(),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }
    Ok(output)
}

/// Run a program to completion without judging its exit status.
pub async fn output<I, S>(program: impl AsRef<OsStr>, args: I) -> Result<Output>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let program = program.as_ref();
    let args: Vec<_> = args.into_iter().map(|a| a.as_ref().to_os_string()).collect();
    debug!(program = %program.to_string_lossy(), ?args, "running host command");
    Command::new(program)
        .args(&args)
        .kill_on_drop(true)
        .output()
        .await
        .with_context(|| format!("failed to spawn {}", program.to_string_lossy()))
}

/// Locate a program either at one of the given absolute paths or on `PATH`.
pub fn find_program(name: &str, candidates: &[&str]) -> Option<PathBuf> {
    for candidate in candidates {
        let p = Path::new(candidate);
        if p.is_file() {
            return Some(p.to_path_buf());
        }
    }

    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|p| p.is_file())
}
