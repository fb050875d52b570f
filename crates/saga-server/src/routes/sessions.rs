//! Read-only session routes over the poller's snapshot.

use crate::state::AppState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use saga_types::{SessionInfo, SessionStatus};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionListQuery {
    pub story_id: Option<String>,
    /// Alias for `storyId`.
    pub owner_id: Option<String>,
    /// `running` or `completed`; anything else is ignored.
    pub status: Option<String>,
}

impl SessionListQuery {
    fn owner(&self) -> Option<&str> {
        self.story_id.as_deref().or(self.owner_id.as_deref())
    }

    fn status(&self) -> Option<SessionStatus> {
        self.status.as_deref().and_then(|s| s.parse().ok())
    }

    pub fn apply(&self, sessions: Vec<SessionInfo>) -> Vec<SessionInfo> {
        let owner = self.owner();
        let status = self.status();
        sessions
            .into_iter()
            .filter(|s| owner.is_none_or(|owner| s.story_id.as_deref() == Some(owner)))
            .filter(|s| status.is_none_or(|status| s.status == status))
            .collect()
    }
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// `GET /api/sessions`, newest first.
pub async fn list(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SessionListQuery>,
) -> Json<Vec<SessionInfo>> {
    let sessions = query.apply(state.poller.current_sessions());
    debug!(target: "saga::api", "Listing {} sessions", sessions.len());
    Json(sessions)
}

/// `GET /api/sessions/{name}`.
pub async fn get(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<SessionInfo>, (StatusCode, Json<ErrorResponse>)> {
    state
        .poller
        .current_sessions()
        .into_iter()
        .find(|s| s.name == name)
        .map(Json)
        .ok_or_else(|| {
            (
                StatusCode::NOT_FOUND,
                Json(ErrorResponse {
                    error: "Session not found".to_string(),
                }),
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::path::PathBuf;

    fn session(name: &str, story: Option<&str>, status: SessionStatus) -> SessionInfo {
        SessionInfo {
            name: name.to_string(),
            story_id: story.map(String::from),
            status,
            output_file: PathBuf::from(format!("/tmp/{}.jsonl", name)),
            output_available: true,
            start_time: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            end_time: None,
            output_preview: None,
        }
    }

    fn sample() -> Vec<SessionInfo> {
        vec![
            session("saga-story-a-2", Some("a"), SessionStatus::Running),
            session("saga-story-b-1", Some("b"), SessionStatus::Completed),
            session("saga-story-a-1", Some("a"), SessionStatus::Completed),
        ]
    }

    fn names(sessions: &[SessionInfo]) -> Vec<&str> {
        sessions.iter().map(|s| s.name.as_str()).collect()
    }

    #[test]
    fn test_no_filters() {
        assert_eq!(SessionListQuery::default().apply(sample()).len(), 3);
    }

    #[test]
    fn test_filter_by_owner_and_status() {
        let query = SessionListQuery {
            story_id: Some("a".to_string()),
            status: Some("completed".to_string()),
            ..Default::default()
        };
        assert_eq!(names(&query.apply(sample())), vec!["saga-story-a-1"]);
    }

    #[test]
    fn test_owner_id_alias() {
        let query = SessionListQuery {
            owner_id: Some("b".to_string()),
            ..Default::default()
        };
        assert_eq!(names(&query.apply(sample())), vec!["saga-story-b-1"]);
    }

    #[test]
    fn test_unknown_status_is_ignored() {
        let query = SessionListQuery {
            status: Some("paused".to_string()),
            ..Default::default()
        };
        assert_eq!(query.apply(sample()).len(), 3);
    }
}
