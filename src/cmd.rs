use anyhow::{Context, Result, anyhow};
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tracing::{debug, trace};

/// A builder for runtime CLI invocations with unified error handling
pub struct Cmd {
    program: String,
    args: Vec<String>,
    workdir: Option<PathBuf>,
}

impl Cmd {
    /// Create a new command builder
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            args: Vec::new(),
            workdir: None,
        }
    }

    /// Add a single argument
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Add multiple arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set the working directory for the command
    pub fn workdir(mut self, path: &Path) -> Self {
        self.workdir = Some(path.to_path_buf());
        self
    }

    fn command_line(&self) -> String {
        format!("{} {}", self.program, self.args.join(" "))
    }

    /// Convert into a `std::process::Command` for callers that manage the child themselves
    pub fn into_command(self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        if let Some(dir) = &self.workdir {
            cmd.current_dir(dir);
        }
        cmd
    }

    fn output(&self) -> Result<Output> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        if let Some(dir) = &self.workdir {
            cmd.current_dir(dir);
        }
        cmd.output()
            .with_context(|| format!("Failed to execute command: {}", self.command_line()))
    }

    /// Execute the command and return the output
    /// Returns an error if the command fails (non-zero exit code)
    pub fn run(self) -> Result<Output> {
        trace!(program = %self.program, args = ?self.args, workdir = ?self.workdir, "cmd:run start");
        let output = self.output()?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            debug!(
                program = %self.program,
                args = ?self.args,
                status = ?output.status.code(),
                stderr = %stderr.trim(),
                "cmd:run failure"
            );
            return Err(anyhow!(
                "Command failed: {}\n{}",
                self.command_line(),
                stderr.trim()
            ));
        }
        trace!(program = %self.program, "cmd:run success");
        Ok(output)
    }

    /// Execute the command and return stdout as a trimmed string
    pub fn run_and_capture_stdout(self) -> Result<String> {
        let output = self.run()?;
        Ok(String::from_utf8(output.stdout)?.trim().to_string())
    }

    /// Execute the command, returning Ok(true) if it succeeds, Ok(false) if it fails
    /// Useful for existence checks such as `docker image inspect`
    pub fn run_as_check(self) -> Result<bool> {
        trace!(program = %self.program, args = ?self.args, "cmd:check start");
        let output = self.output()?;
        let success = output.status.success();
        trace!(program = %self.program, success, "cmd:check result");
        Ok(success)
    }

    /// Execute the command, treating a failure whose stderr contains any of
    /// `benign` as success. Used for idempotent teardown (`kill`, `rm`).
    pub fn run_tolerating(self, benign: &[&str]) -> Result<()> {
        trace!(program = %self.program, args = ?self.args, "cmd:tolerant start");
        let output = self.output()?;
        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let lowered = stderr.to_lowercase();
        if benign.iter().any(|pattern| lowered.contains(pattern)) {
            debug!(program = %self.program, stderr = %stderr.trim(), "cmd:tolerated failure");
            return Ok(());
        }

        Err(anyhow!(
            "Command failed: {}\n{}",
            self.command_line(),
            stderr.trim()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_and_capture_trims_stdout() {
        let out = Cmd::new("sh")
            .args(["-c", "echo '  hi  '"])
            .run_and_capture_stdout()
            .unwrap();
        assert_eq!(out, "hi");
    }

    #[test]
    fn run_reports_stderr_on_failure() {
        let err = Cmd::new("sh")
            .args(["-c", "echo boom >&2; exit 1"])
            .run()
            .unwrap_err();
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn run_as_check_maps_exit_status() {
        assert!(Cmd::new("sh").args(["-c", "exit 0"]).run_as_check().unwrap());
        assert!(!Cmd::new("sh").args(["-c", "exit 2"]).run_as_check().unwrap());
    }

    #[test]
    fn run_tolerating_accepts_benign_errors() {
        Cmd::new("sh")
            .args(["-c", "echo 'Error: No such container: x' >&2; exit 1"])
            .run_tolerating(&["no such container"])
            .unwrap();

        let err = Cmd::new("sh")
            .args(["-c", "echo 'permission denied' >&2; exit 1"])
            .run_tolerating(&["no such container"])
            .unwrap_err();
        assert!(err.to_string().contains("permission denied"));
    }

    #[test]
    fn workdir_is_applied() {
        let dir = tempfile::tempdir().unwrap();
        let out = Cmd::new("pwd")
            .workdir(dir.path())
            .run_and_capture_stdout()
            .unwrap();
        assert_eq!(
            std::fs::canonicalize(out).unwrap(),
            std::fs::canonicalize(dir.path()).unwrap()
        );
    }
}
