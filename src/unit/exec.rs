//! Attaching commands to a running unit.

use anyhow::{Context, Result, bail};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use std::time::Duration;
use tracing::{debug, trace};

use super::Unit;
use crate::engine::{ExecOutput, ExecRequest};

/// Quote `s` for POSIX `sh`.
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Quote an in-unit path, anchoring relative ones at `./` so a leading `-`
/// is never read as an option.
fn quote_path(path: &str) -> String {
    if path.starts_with('/') {
        shell_quote(path)
    } else {
        shell_quote(&format!("./{path}"))
    }
}

impl Unit {
    /// Run `command` with `sh -c` in the unit's working directory.
    ///
    /// Fails with [`super::UnitTerminated`] unless the unit is running. A
    /// non-zero exit or a timeout is reported in the output, not as an error.
    pub fn exec(&self, command: &str, timeout: Duration) -> Result<ExecOutput> {
        self.ensure_running()?;
        self.run(ExecRequest::new(command, &self.workdir, timeout))
    }

    fn run(&self, request: ExecRequest) -> Result<ExecOutput> {
        trace!(unit = %self.name, command = %request.command, "unit:exec start");
        let output = self
            .engine
            .exec(&self.id, &request)
            .with_context(|| format!("Failed to run command in unit '{}'", self.name))?;
        debug!(
            unit = %self.name,
            exit_code = ?output.exit_code,
            timed_out = output.timed_out,
            "unit:exec done"
        );
        Ok(output)
    }

    /// Write `contents` to `path` inside the unit.
    ///
    /// The payload travels base64-encoded over stdin and is decoded in the unit,
    /// so arbitrary bytes survive the text channel. Relative paths resolve
    /// against the working directory. Parent directories are created.
    pub fn write_file(&self, path: &str, contents: &[u8], timeout: Duration) -> Result<()> {
        self.ensure_running()?;
        let quoted = quote_path(path);
        let command = format!("mkdir -p \"$(dirname {quoted})\" && base64 -d > {quoted}");
        let mut payload = STANDARD.encode(contents).into_bytes();
        payload.push(b'\n');

        debug!(unit = %self.name, path, bytes = contents.len(), "unit:write file");
        let output = self.run(ExecRequest::new(command, &self.workdir, timeout).with_stdin(payload))?;
        check(&output, "write", path)
    }

    /// Read `path` from inside the unit.
    pub fn read_file(&self, path: &str, timeout: Duration) -> Result<Vec<u8>> {
        self.ensure_running()?;
        let command = format!("base64 < {}", quote_path(path));
        let output = self.run(ExecRequest::new(command, &self.workdir, timeout))?;
        check(&output, "read", path)?;

        let encoded: String = output
            .stdout
            .chars()
            .filter(|c| !c.is_ascii_whitespace())
            .collect();
        STANDARD
            .decode(encoded)
            .with_context(|| format!("Unit returned malformed data for '{path}'"))
    }
}

fn check(output: &ExecOutput, action: &str, path: &str) -> Result<()> {
    if output.timed_out {
        bail!("Timed out trying to {action} '{path}'");
    }
    if !output.success() {
        bail!(
            "Failed to {action} '{path}' (exit {:?}): {}",
            output.exit_code,
            output.stderr.trim()
        );
    }
    Ok(())
}
