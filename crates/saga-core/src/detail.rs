//! Resolving raw tmux sessions into [`SessionInfo`] records.

use crate::tmux::SESSION_PREFIX;
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use saga_types::{RawSession, SessionInfo, SessionStatus};
use std::path::Path;
use tracing::trace;

/// Number of trailing output lines considered for a preview.
pub const PREVIEW_LINES_COUNT: usize = 5;

/// Maximum preview length in characters.
pub const PREVIEW_MAX_LENGTH: usize = 500;

/// Resolves a raw session into a full record.
///
/// `Ok(None)` means the session does not follow our naming convention.
#[async_trait]
pub trait SessionDetailBuilder: Send + Sync {
    async fn build(&self, raw: &RawSession) -> Result<Option<SessionInfo>>;
}

/// Builds session records from the worker's output file on disk.
#[derive(Debug, Default, Clone)]
pub struct FsSessionDetailBuilder;

#[async_trait]
impl SessionDetailBuilder for FsSessionDetailBuilder {
    async fn build(&self, raw: &RawSession) -> Result<Option<SessionInfo>> {
        let Some(story_id) = parse_session_name(&raw.name) else {
            trace!(target: "saga::poller", "Skipping foreign session {}", raw.name);
            return Ok(None);
        };

        let status = if raw.running {
            SessionStatus::Running
        } else {
            SessionStatus::Completed
        };

        let output_available = tokio::fs::try_exists(&raw.output_file).await.unwrap_or(false);

        let (start_time, end_time, output_preview) = if output_available {
            let (start, end) = file_timestamps(&raw.output_file, status).await;
            let preview = match tokio::fs::read_to_string(&raw.output_file).await {
                Ok(content) => generate_output_preview(&content),
                Err(_) => None,
            };
            (start, end, preview)
        } else {
            let now = Utc::now();
            let end = (status == SessionStatus::Completed).then_some(now);
            (now, end, None)
        };

        Ok(Some(SessionInfo {
            name: raw.name.clone(),
            story_id: Some(story_id),
            status,
            output_file: raw.output_file.clone(),
            output_available,
            start_time,
            end_time,
            output_preview,
        }))
    }
}

/// Start time from the file's birth time, end time from its last write.
async fn file_timestamps(
    path: &Path,
    status: SessionStatus,
) -> (DateTime<Utc>, Option<DateTime<Utc>>) {
    let now = Utc::now();
    let Ok(meta) = tokio::fs::metadata(path).await else {
        return (now, (status == SessionStatus::Completed).then_some(now));
    };

    let modified = meta.modified().ok().map(DateTime::<Utc>::from);
    let start = meta
        .created()
        .ok()
        .map(DateTime::<Utc>::from)
        .or(modified)
        .unwrap_or(now);
    let end = match status {
        SessionStatus::Completed => Some(modified.unwrap_or(now)),
        SessionStatus::Running => None,
    };
    (start, end)
}

/// Extract the story id from `saga-story-<storyId>-<timestamp>`.
///
/// The story id may itself contain hyphens; the timestamp is the last
/// all-digit segment.
pub fn parse_session_name(name: &str) -> Option<String> {
    let rest = name.strip_prefix(SESSION_PREFIX)?;
    let (story_id, timestamp) = rest.rsplit_once('-')?;

    if timestamp.is_empty() || !timestamp.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if story_id.is_empty() {
        return None;
    }
    Some(story_id.to_string())
}

/// A slug is `[a-z0-9-]+` and neither starts nor ends with a hyphen.
pub fn validate_slug(slug: &str) -> bool {
    !slug.is_empty()
        && slug
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
        && !slug.starts_with('-')
        && !slug.ends_with('-')
}

/// Preview of the last few lines of a JSONL output file.
///
/// Valid JSON lines are preferred; if none of the trailing lines parse, the raw
/// lines are used instead.
pub fn generate_output_preview(content: &str) -> Option<String> {
    let lines: Vec<&str> = content.split('\n').filter(|l| !l.is_empty()).collect();
    if lines.is_empty() {
        return None;
    }

    let last_lines = &lines[lines.len().saturating_sub(PREVIEW_LINES_COUNT)..];
    let valid: Vec<&str> = last_lines
        .iter()
        .copied()
        .filter(|line| serde_json::from_str::<serde_json::Value>(line).is_ok())
        .collect();

    let preview = if valid.is_empty() {
        last_lines.join("\n")
    } else {
        valid.join("\n")
    };
    Some(truncate_preview(&preview))
}

/// Cut at the last newline before the limit, or hard at the limit if there is none.
fn truncate_preview(preview: &str) -> String {
    if preview.chars().count() <= PREVIEW_MAX_LENGTH {
        return preview.to_string();
    }
    let truncated: String = preview.chars().take(PREVIEW_MAX_LENGTH).collect();
    match truncated.rfind('\n') {
        Some(idx) if idx > 0 => truncated[..idx].to_string(),
        _ => truncated,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    #[test]
    fn test_parse_session_name() {
        assert_eq!(
            parse_session_name("saga-story-auth-flow-1700000000000"),
            Some("auth-flow".to_string())
        );
        assert_eq!(parse_session_name("saga-story-x-1"), Some("x".to_string()));
        assert_eq!(parse_session_name("saga-story-"), None);
        assert_eq!(parse_session_name("saga-story-1700000000000"), None);
        assert_eq!(parse_session_name("saga-story--1700000000000"), None);
        assert_eq!(parse_session_name("saga-story-auth-flow"), None);
        assert_eq!(parse_session_name("other-auth-17"), None);
    }

    #[test]
    fn test_validate_slug() {
        assert!(validate_slug("auth-flow"));
        assert!(validate_slug("a1"));
        assert!(!validate_slug(""));
        assert!(!validate_slug("-auth"));
        assert!(!validate_slug("auth-"));
        assert!(!validate_slug("Auth"));
        assert!(!validate_slug("auth_flow"));
    }

    #[test]
    fn test_preview_prefers_json_lines() {
        let content = "{\"a\":1}\nnot json\n{\"b\":2}\n\n";
        assert_eq!(
            generate_output_preview(content),
            Some("{\"a\":1}\n{\"b\":2}".to_string())
        );
    }

    #[test]
    fn test_preview_falls_back_to_raw_lines() {
        let content = "starting\nworking\n";
        assert_eq!(generate_output_preview(content), Some("starting\nworking".to_string()));
    }

    #[test]
    fn test_preview_takes_last_lines_only() {
        let content: String = (0..10).map(|i| format!("{{\"n\":{}}}\n", i)).collect();
        let preview = generate_output_preview(&content).unwrap();
        assert_eq!(preview.lines().count(), PREVIEW_LINES_COUNT);
        assert!(preview.starts_with("{\"n\":5}"));
    }

    #[test]
    fn test_preview_truncates_at_newline() {
        let long_line = format!("{{\"text\":\"{}\"}}", "x".repeat(300));
        let content = format!("{}\n{}\n", long_line, long_line);
        let preview = generate_output_preview(&content).unwrap();
        assert_eq!(preview, long_line);
    }

    #[test]
    fn test_preview_empty() {
        assert_eq!(generate_output_preview(""), None);
        assert_eq!(generate_output_preview("\n\n"), None);
    }

    #[tokio::test]
    async fn test_build_with_output_file() {
        let dir = TempDir::new().unwrap();
        let name = "saga-story-auth-flow-1700000000000";
        let output_file = dir.path().join(format!("{}.jsonl", name));
        std::fs::write(&output_file, "{\"type\":\"text\"}\n").unwrap();

        let raw = RawSession {
            name: name.to_string(),
            running: false,
            output_file: output_file.clone(),
        };
        let info = FsSessionDetailBuilder.build(&raw).await.unwrap().unwrap();

        assert_eq!(info.story_id.as_deref(), Some("auth-flow"));
        assert_eq!(info.status, SessionStatus::Completed);
        assert!(info.output_available);
        assert!(info.end_time.is_some());
        assert_eq!(info.output_preview.as_deref(), Some("{\"type\":\"text\"}"));
    }

    #[tokio::test]
    async fn test_build_without_output_file() {
        let raw = RawSession {
            name: "saga-story-x-1".to_string(),
            running: true,
            output_file: PathBuf::from("/nonexistent/saga-story-x-1.jsonl"),
        };
        let info = FsSessionDetailBuilder.build(&raw).await.unwrap().unwrap();

        assert_eq!(info.status, SessionStatus::Running);
        assert!(!info.output_available);
        assert!(info.end_time.is_none());
        assert!(info.output_preview.is_none());
    }

    #[tokio::test]
    async fn test_build_foreign_session() {
        let raw = RawSession {
            name: "scratch".to_string(),
            running: true,
            output_file: PathBuf::from("/tmp/scratch.jsonl"),
        };
        assert!(FsSessionDetailBuilder.build(&raw).await.unwrap().is_none());
    }
}
