//! Centralized command execution with consistent error handling.
//!
//! Every external tool kdf talks to (`modinfo`, `xz`, `nix-build`,
//! `virtiofsd`, QEMU) goes through [`Cmd`], so failures always carry the
//! tool name, exit code and captured stderr.

use anyhow::{Context, Result};
use std::fs::File;
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};

use crate::error::Error;

/// Result of a command execution.
#[derive(Debug, Clone)]
pub struct CommandResult {
    /// Exit status of the command.
    pub status: ExitStatus,
    /// Captured stdout as a string.
    pub stdout: String,
    /// Captured stderr as a string.
    pub stderr: String,
}

impl CommandResult {
    /// Returns true if the command exited successfully.
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// Get the exit code, or -1 if terminated by signal.
    pub fn code(&self) -> i32 {
        self.status.code().unwrap_or(-1)
    }

    /// Get stdout, trimmed of whitespace.
    pub fn stdout_trimmed(&self) -> &str {
        self.stdout.trim()
    }

    /// Get stderr, trimmed of whitespace.
    pub fn stderr_trimmed(&self) -> &str {
        self.stderr.trim()
    }
}

/// Builder for configuring command execution.
pub struct Cmd {
    program: String,
    args: Vec<String>,
    /// Custom error message prefix.
    error_prefix: Option<String>,
}

impl Cmd {
    /// Create a new command builder.
    pub fn new(program: impl AsRef<str>) -> Self {
        Self {
            program: program.as_ref().to_string(),
            args: Vec::new(),
            error_prefix: None,
        }
    }

    /// Add a single argument.
    pub fn arg(mut self, arg: impl AsRef<str>) -> Self {
        self.args.push(arg.as_ref().to_string());
        self
    }

    /// Add multiple arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for arg in args {
            self.args.push(arg.as_ref().to_string());
        }
        self
    }

    /// Add a path as an argument.
    pub fn arg_path(mut self, path: &Path) -> Self {
        self.args.push(path.to_string_lossy().into_owned());
        self
    }

    /// Set a custom error message prefix.
    pub fn error_msg(mut self, msg: impl AsRef<str>) -> Self {
        self.error_prefix = Some(msg.as_ref().to_string());
        self
    }

    /// The command line as it would be typed in a shell, for logging.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd
    }

    fn failure(&self, code: i32, stderr: &str) -> Error {
        let message = match (&self.error_prefix, stderr.is_empty()) {
            (Some(prefix), true) => format!("{} (exit code {})", prefix, code),
            (Some(prefix), false) => format!("{} (exit code {}):\n{}", prefix, code, stderr),
            (None, true) => format!("exit code {}", code),
            (None, false) => format!("exit code {}:\n{}", code, stderr),
        };
        Error::ToolFailed {
            tool: self.program.clone(),
            message,
        }
    }

    /// Run the command and capture output.
    pub fn run(self) -> Result<CommandResult> {
        let output = self
            .command()
            .output()
            .with_context(|| format!("Failed to execute '{}'. Is it installed?", self.program))?;

        let result = CommandResult {
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        if !result.success() {
            return Err(self.failure(result.code(), result.stderr_trimmed()).into());
        }

        Ok(result)
    }

    /// Run the command with stdout redirected into `dest` (truncated first).
    ///
    /// Used for tools that stream binary data, e.g. `xz -dc`.
    pub fn run_to_file(self, dest: &Path) -> Result<()> {
        let file = File::create(dest)
            .with_context(|| format!("Failed to create {}", dest.display()))?;

        let output = self
            .command()
            .stdout(Stdio::from(file))
            .stderr(Stdio::piped())
            .output()
            .with_context(|| format!("Failed to execute '{}'. Is it installed?", self.program))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(self
                .failure(output.status.code().unwrap_or(-1), stderr.trim())
                .into());
        }

        Ok(())
    }

    /// Spawn the command with inherited stdio, for the VM itself.
    ///
    /// The caller waits on the child and checks the status with
    /// [`Cmd::check_status`].
    pub fn spawn_interactive(&self) -> Result<Child> {
        self.command()
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()
            .with_context(|| format!("Failed to execute '{}'. Is it installed?", self.program))
    }

    /// Turn a non-zero exit status of this command into a `ToolFailed` error.
    pub fn check_status(&self, status: ExitStatus) -> Result<()> {
        if !status.success() {
            return Err(self.failure(status.code().unwrap_or(-1), "").into());
        }
        Ok(())
    }

    /// Spawn the command in the background without waiting for it.
    ///
    /// stdin is closed, stdout/stderr are inherited so daemon output ends up
    /// next to ours.
    pub fn spawn(self) -> Result<Child> {
        self.command()
            .stdin(Stdio::null())
            .spawn()
            .with_context(|| format!("Failed to spawn '{}'. Is it installed?", self.program))
    }
}

// =============================================================================
// Convenience functions
// =============================================================================

/// Check if a program exists in PATH.
pub fn exists(program: &str) -> bool {
    which::which(program).is_ok()
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_success() {
        let result = Cmd::new("echo").arg("hello").run().unwrap();
        assert!(result.success());
        assert_eq!(result.stdout_trimmed(), "hello");
    }

    #[test]
    fn test_run_failure_is_tool_failed() {
        let err = Cmd::new("ls").arg("/nonexistent_path_12345").run().unwrap_err();
        match err.downcast_ref::<Error>() {
            Some(Error::ToolFailed { tool, message }) => {
                assert_eq!(tool, "ls");
                assert!(message.contains("No such file") || message.contains("cannot access"));
            }
            other => panic!("expected ToolFailed, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_program() {
        let err = Cmd::new("nonexistent_program_12345").arg("x").run().unwrap_err();
        assert!(err.to_string().contains("Is it installed?"));
    }

    #[test]
    fn test_custom_error_message() {
        let err = Cmd::new("false")
            .error_msg("Custom build step failed")
            .run()
            .unwrap_err();

        assert!(err.to_string().contains("Custom build step failed"));
    }

    #[test]
    fn test_run_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out");
        Cmd::new("printf").arg("a\\000b").run_to_file(&dest).unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"a\0b");
    }

    #[test]
    fn test_spawn_interactive_status() {
        let cmd = Cmd::new("false").error_msg("VM failed");
        let status = cmd.spawn_interactive().unwrap().wait().unwrap();
        let err = cmd.check_status(status).unwrap_err();
        assert!(err.to_string().contains("VM failed (exit code 1)"));

        let cmd = Cmd::new("true");
        let status = cmd.spawn_interactive().unwrap().wait().unwrap();
        cmd.check_status(status).unwrap();
    }

    #[test]
    fn test_display() {
        let cmd = Cmd::new("xz").args(["-dc", "a.ko.xz"]);
        assert_eq!(cmd.display(), "xz -dc a.ko.xz");
    }

    #[test]
    fn test_exists() {
        assert!(exists("sh"));
        assert!(!exists("nonexistent_program_12345"));
    }
}
