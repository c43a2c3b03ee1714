//! Thin `std::process::Command` helpers for the synchronous, best-effort shell-outs the sandbox
//! needs: copying trees, taking a Git snapshot, and invoking the privileged deleter. There is no
//! async runtime in this crate (see `executor.rs`), so this wraps the synchronous `Command` only.

use std::process::{Command, ExitStatus, Output};

use anyhow::{bail, Context, Result};

/// Run a command and bail with its captured output if it didn't exit with status 0.
pub trait CommandExt {
    fn run_checked(&mut self) -> Result<Output>;
}

impl CommandExt for Command {
    fn run_checked(&mut self) -> Result<Output> {
        let output = self
            .output()
            .with_context(|| format!("spawning {:?}", self))?;
        output
            .status
            .check_ok()
            .with_context(|| format!("running {:?}", self))?;
        Ok(output)
    }
}

/// Extension trait for inspecting exit statuses and outputs the way the rest of the crate wants
/// to: "0 means ok, anything else (including a signal) is an error with the captured streams
/// attached".
pub trait ExitStatusExt {
    fn check_ok(&self) -> Result<()>;
}

impl ExitStatusExt for ExitStatus {
    fn check_ok(&self) -> Result<()> {
        match self.code() {
            Some(0) => Ok(()),
            Some(code) => bail!("exited with status {code}"),
            None => bail!("killed by signal"),
        }
    }
}

pub trait OutputExt {
    /// The exit code, treating "killed by signal" as an error rather than panicking the way a
    /// bare `.code().unwrap()` would.
    fn code_not_killed(&self) -> Result<i32>;
}

impl OutputExt for Output {
    fn code_not_killed(&self) -> Result<i32> {
        self.status.code().context("process was killed by a signal")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_checked_ok() {
        let output = Command::new("true").run_checked().expect("true should succeed");
        assert_eq!(output.status.code(), Some(0));
    }

    #[test]
    fn run_checked_err() {
        Command::new("false")
            .run_checked()
            .expect_err("false should fail");
    }
}
