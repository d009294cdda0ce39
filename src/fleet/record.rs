use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::engine::{ExecOutput, ResourceLimits};

/// Lifecycle of an agent session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxStatus {
    /// Record exists, unit not started yet.
    #[default]
    Pending,
    /// Unit is up and accepting commands.
    Running,
    /// A command finished cleanly. Only used as a [`CommandRun`] outcome.
    Success,
    /// Provisioning failed or the unit died. Eligible for regeneration.
    Failed,
    Stopped,
    /// Being replaced by a fresh session.
    Regenerating,
}

impl SandboxStatus {
    /// Statuses under which a session may still be reused.
    pub fn is_usable(&self) -> bool {
        matches!(
            self,
            SandboxStatus::Pending | SandboxStatus::Running | SandboxStatus::Regenerating
        )
    }
}

impl fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
            Self::Stopped => write!(f, "stopped"),
            Self::Regenerating => write!(f, "regenerating"),
        }
    }
}

/// Outcome of the most recent command in a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRun {
    pub command: String,
    /// `Success` or `Failed`.
    pub outcome: SandboxStatus,
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub timed_out: bool,
    pub finished_at: u64,
}

impl CommandRun {
    /// Success needs exit 0 and nothing on stderr.
    pub fn from_output(command: &str, output: &ExecOutput) -> Self {
        let stderr = output.stderr.trim();
        let outcome = if output.success() && stderr.is_empty() {
            SandboxStatus::Success
        } else {
            SandboxStatus::Failed
        };
        let error = if output.timed_out {
            Some(format!("Command timed out. {stderr}").trim().to_string())
        } else if stderr.is_empty() {
            None
        } else {
            Some(output.stderr.clone())
        };
        Self {
            command: command.to_string(),
            outcome,
            output: if output.stdout.is_empty() {
                "No output.".to_string()
            } else {
                output.stdout.clone()
            },
            error,
            exit_code: output.exit_code,
            timed_out: output.timed_out,
            finished_at: now_secs(),
        }
    }
}

/// One agent session, persisted in the record store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxRecord {
    pub id: String,
    pub agent_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    pub container_name: String,
    pub status: SandboxStatus,
    pub created_at: u64,
    pub updated_at: u64,
    /// Last command requested, replayed when the session is regenerated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run: Option<CommandRun>,
    pub image: String,
    pub resources: ResourceLimits,
    /// Provisioning or liveness error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub is_active: bool,
}

pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
