//! Worker session records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Lifecycle status of a worker session.
///
/// Monotonic per session name: a completed session never becomes running again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// The worker process is alive.
    Running,
    /// The worker process has exited but its session is still listed.
    Completed,
}

impl std::str::FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(SessionStatus::Running),
            "completed" => Ok(SessionStatus::Completed),
            _ => Err(format!("Invalid session status: '{}'", s)),
        }
    }
}

/// A session as reported by the process manager, before enrichment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawSession {
    pub name: String,
    pub running: bool,
    /// Where the worker writes its output.
    pub output_file: PathBuf,
}

/// A fully resolved worker session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    /// Stable identifier (the tmux session name).
    pub name: String,
    /// Owning story, if any. Absent for standalone sessions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub story_id: Option<String>,
    pub status: SessionStatus,
    pub output_file: PathBuf,
    pub output_available: bool,
    pub start_time: DateTime<Utc>,
    /// Present iff `status` is completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    /// Short excerpt of the most recent output. Advisory only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_preview: Option<String>,
}

impl SessionInfo {
    pub fn is_running(&self) -> bool {
        self.status == SessionStatus::Running
    }
}
