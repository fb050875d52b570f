//! Session discovery through tmux.

use crate::{Result, SagaError};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use saga_types::RawSession;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, trace};

/// Prefix shared by every worker session name.
pub const SESSION_PREFIX: &str = "saga-story-";

/// `tmux ls` line: "saga-story-<storyId>-<timestamp>: N windows ..."
static SESSION_LINE_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(saga-story-[a-z0-9-]+-\d+):").unwrap());

/// Enumerates the worker sessions currently known to the process manager.
///
/// A successful call returning an empty list means "no sessions"; an `Err`
/// means the process manager could not be asked at all.
#[async_trait]
pub trait SessionLister: Send + Sync {
    async fn list_sessions(&self) -> Result<Vec<RawSession>>;
}

/// Lists `saga-story-*` sessions from the local tmux server.
pub struct TmuxSessionLister {
    tmux_path: PathBuf,
    output_dir: PathBuf,
}

impl TmuxSessionLister {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            tmux_path: PathBuf::from("tmux"),
            output_dir: output_dir.into(),
        }
    }

    /// Use a specific tmux binary instead of the one on `PATH`.
    pub fn with_tmux_path(mut self, tmux_path: impl Into<PathBuf>) -> Self {
        self.tmux_path = tmux_path.into();
        self
    }

    async fn has_session(&self, name: &str) -> Result<bool> {
        let status = Command::new(&self.tmux_path)
            .args(["has-session", "-t", name])
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .await
            .map_err(|e| SagaError::Tmux(format!("failed to run tmux has-session: {}", e)))?;
        Ok(status.success())
    }
}

#[async_trait]
impl SessionLister for TmuxSessionLister {
    async fn list_sessions(&self) -> Result<Vec<RawSession>> {
        let output = Command::new(&self.tmux_path)
            .arg("ls")
            .output()
            .await
            .map_err(|e| SagaError::Tmux(format!("failed to run tmux ls: {}", e)))?;

        // tmux exits non-zero when no server is running, i.e. there are no sessions.
        if !output.status.success() {
            trace!(target: "saga::tmux", "tmux ls exited with {}, no sessions", output.status);
            return Ok(Vec::new());
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut sessions = parse_tmux_ls(&stdout, &self.output_dir);

        for session in &mut sessions {
            session.running = self.has_session(&session.name).await?;
        }

        debug!(target: "saga::tmux", "Listed {} worker sessions", sessions.len());
        Ok(sessions)
    }
}

/// Pick our sessions out of `tmux ls` output.
///
/// Everything listed is assumed running; the caller refines that.
pub(crate) fn parse_tmux_ls(stdout: &str, output_dir: &Path) -> Vec<RawSession> {
    stdout
        .lines()
        .filter_map(|line| SESSION_LINE_REGEX.captures(line.trim()))
        .map(|caps| {
            let name = caps[1].to_string();
            RawSession {
                output_file: output_dir.join(format!("{}.jsonl", name)),
                name,
                running: true,
            }
        })
        .collect()
}
