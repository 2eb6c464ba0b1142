//! Command execution abstraction for the firewall backends.
//!
//! Backends never spawn processes directly; they go through a
//! [`CommandExecutor`] so unit tests can script `ipfw`/`nft` responses
//! without root or a real packet filter.

use anyhow::{Context, Result};
use std::io::Write;
use std::path::Path;
use std::process::{Command, Stdio};

use crate::error::BlocksyncError;

#[cfg(test)]
use mockall::automock;

/// Output from command execution
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// Whether the command succeeded (exit code 0)
    pub success: bool,
    pub code: Option<i32>,
}

impl CommandOutput {
    /// Stdout on success, otherwise an error carrying stderr.
    pub fn into_stdout(self, program: &str) -> Result<String> {
        if self.success {
            Ok(self.stdout)
        } else {
            Err(BlocksyncError::Firewall(format!(
                "{} failed (exit {}): {}",
                program,
                self.code.map_or_else(|| "signal".to_string(), |c| c.to_string()),
                self.stderr.trim()
            ))
            .into())
        }
    }
}

/// Process execution seam, mocked in tests.
///
/// Arguments are `&[String]` rather than `&[&str]` because mockall cannot
/// express the nested lifetime of the latter.
#[cfg_attr(test, automock)]
pub trait CommandExecutor: Send + Sync {
    fn execute(&self, cmd: &str, args: &[String]) -> Result<CommandOutput>;

    /// Execute with `stdin` piped to the child (used for `nft -f -`).
    fn execute_with_stdin(&self, cmd: &str, args: &[String], stdin: &str) -> Result<CommandOutput>;
}

/// Runs real system commands.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealCommandExecutor;

impl RealCommandExecutor {
    pub fn new() -> Self {
        Self
    }
}

impl CommandExecutor for RealCommandExecutor {
    fn execute(&self, cmd: &str, args: &[String]) -> Result<CommandOutput> {
        let output = Command::new(cmd)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .with_context(|| format!("Failed to execute {}", cmd))?;

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            success: output.status.success(),
            code: output.status.code(),
        })
    }

    fn execute_with_stdin(
        &self,
        cmd: &str,
        args: &[String],
        stdin_data: &str,
    ) -> Result<CommandOutput> {
        let mut child = Command::new(cmd)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to spawn {}", cmd))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(stdin_data.as_bytes())?;
        }

        let output = child.wait_with_output()?;

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            success: output.status.success(),
            code: output.status.code(),
        })
    }
}

pub fn args_to_strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

/// Run a command and return its stdout, failing on a non-zero exit.
pub fn run_checked<E: CommandExecutor + ?Sized>(
    executor: &E,
    program: &str,
    args: &[&str],
) -> Result<String> {
    executor
        .execute(program, &args_to_strings(args))?
        .into_stdout(program)
}

/// First candidate path that exists, or the last candidate (a bare name
/// resolved through `PATH`).
pub fn locate_binary(candidates: &[&'static str]) -> &'static str {
    candidates
        .iter()
        .copied()
        .find(|path| Path::new(path).is_absolute() && Path::new(path).exists())
        .or_else(|| candidates.last().copied())
        .unwrap_or("")
}
