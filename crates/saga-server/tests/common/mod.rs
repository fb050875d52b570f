//! Shared fixtures for server tests.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use saga_core::{parse_session_name, SessionDetailBuilder, SessionLister};
use saga_server::config::Config;
use saga_server::state::AppState;
use saga_types::{RawSession, SessionInfo, SessionStatus};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// Lister returning whatever the test last set.
#[derive(Default)]
pub struct StaticLister {
    sessions: Mutex<Vec<RawSession>>,
}

impl StaticLister {
    pub fn set(&self, sessions: Vec<RawSession>) {
        *self.sessions.lock().unwrap() = sessions;
    }
}

#[async_trait]
impl SessionLister for StaticLister {
    async fn list_sessions(&self) -> saga_core::Result<Vec<RawSession>> {
        Ok(self.sessions.lock().unwrap().clone())
    }
}

/// Builder with start times taken from the session name's timestamp, so
/// ordering is deterministic.
pub struct FakeBuilder;

#[async_trait]
impl SessionDetailBuilder for FakeBuilder {
    async fn build(&self, raw: &RawSession) -> saga_core::Result<Option<SessionInfo>> {
        let Some(story_id) = parse_session_name(&raw.name) else {
            return Ok(None);
        };
        let seconds: i64 = raw
            .name
            .rsplit('-')
            .next()
            .and_then(|ts| ts.parse().ok())
            .unwrap_or(0);
        let start_time = Utc.timestamp_opt(1_700_000_000 + seconds, 0).unwrap();
        let status = if raw.running {
            SessionStatus::Running
        } else {
            SessionStatus::Completed
        };
        Ok(Some(SessionInfo {
            name: raw.name.clone(),
            story_id: Some(story_id),
            status,
            output_file: raw.output_file.clone(),
            output_available: raw.output_file.exists(),
            start_time,
            end_time: (status == SessionStatus::Completed).then_some(start_time),
            output_preview: None,
        }))
    }
}

pub fn raw(output_dir: &Path, name: &str, running: bool) -> RawSession {
    RawSession {
        name: name.to_string(),
        running,
        output_file: output_dir.join(format!("{}.jsonl", name)),
    }
}

pub struct TestEnv {
    pub dir: TempDir,
    pub lister: Arc<StaticLister>,
    pub state: Arc<AppState>,
}

impl TestEnv {
    pub fn output_dir(&self) -> std::path::PathBuf {
        self.state.config.output_dir.clone()
    }

    pub fn saga_root(&self) -> std::path::PathBuf {
        self.state.config.saga_root.clone()
    }
}

/// State over a temp directory with short intervals.
pub fn test_env() -> TestEnv {
    let dir = TempDir::new().unwrap();
    let output_dir = dir.path().join("output");
    let saga_root = dir.path().join("project");
    std::fs::create_dir_all(&output_dir).unwrap();
    std::fs::create_dir_all(saga_root.join(".saga/stories")).unwrap();

    let config = Config {
        host: "127.0.0.1".to_string(),
        port: 0,
        saga_root,
        output_dir,
        static_dir: dir.path().join("static"),
        poll_interval_ms: 50,
        heartbeat_interval_ms: 30_000,
    };

    let lister = Arc::new(StaticLister::default());
    let state = Arc::new(AppState::with_collaborators(
        config,
        lister.clone(),
        Arc::new(FakeBuilder),
    ));
    TestEnv { dir, lister, state }
}
