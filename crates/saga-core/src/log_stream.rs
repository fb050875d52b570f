//! Streaming of worker output files to subscribed observers.
//!
//! One file watcher per session, shared by all of its subscribers. Each
//! subscriber first receives the whole file as an initial frame; afterwards
//! only lines beyond the last delivered line count are sent.

use crate::{
    parse_session_name, validate_slug, Broadcaster, ObserverId, Result, SagaError, SessionEvent,
};
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use saga_types::{LogsData, LogsError, WsServerMessage};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

struct LogStream {
    subscribers: HashSet<ObserverId>,
    line_count: usize,
    watcher: Option<RecommendedWatcher>,
    task: Option<JoinHandle<()>>,
}

impl Drop for LogStream {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

pub struct LogStreamManager {
    broadcaster: Arc<Broadcaster>,
    output_dir: PathBuf,
    streams: Mutex<HashMap<String, LogStream>>,
}

impl LogStreamManager {
    pub fn new(broadcaster: Arc<Broadcaster>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            broadcaster,
            output_dir: output_dir.into(),
            streams: Mutex::new(HashMap::new()),
        }
    }

    fn output_file(&self, session_name: &str) -> PathBuf {
        self.output_dir.join(format!("{}.jsonl", session_name))
    }

    fn send_error(&self, observer: ObserverId, session_name: &str, error: String) {
        self.broadcaster.send_to(
            observer,
            WsServerMessage::LogsError(LogsError {
                entity_key: session_name.to_string(),
                error,
            }),
        );
    }

    /// Subscribe an observer to a session's output.
    ///
    /// Problems are reported to the observer as `logs-error` frames.
    pub async fn subscribe(self: &Arc<Self>, session_name: &str, observer: ObserverId) {
        if !parse_session_name(session_name).is_some_and(|story_id| validate_slug(&story_id)) {
            self.send_error(
                observer,
                session_name,
                SagaError::InvalidSessionName(session_name.to_string()).to_string(),
            );
            return;
        }

        let output_file = self.output_file(session_name);
        let content = match tokio::fs::read_to_string(&output_file).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let error = SagaError::OutputNotFound(output_file.display().to_string());
                self.send_error(observer, session_name, error.to_string());
                return;
            }
            Err(e) => {
                self.send_error(observer, session_name, e.to_string());
                return;
            }
        };

        self.broadcaster.send_to(
            observer,
            WsServerMessage::LogsData(LogsData {
                entity_key: session_name.to_string(),
                payload: parse_jsonl_lines(&content),
                is_initial: true,
                is_complete: false,
            }),
        );

        let mut streams = self.streams.lock().await;
        let needs_watcher = !streams.contains_key(session_name);
        let stream = streams
            .entry(session_name.to_string())
            .or_insert_with(|| LogStream {
                subscribers: HashSet::new(),
                line_count: 0,
                watcher: None,
                task: None,
            });
        if !needs_watcher {
            // Catch existing subscribers up before the cursor moves past
            // what the newcomer's initial frame already covers.
            if let Some((payload, _)) = new_lines_since(&content, stream.line_count) {
                let message = WsServerMessage::LogsData(LogsData {
                    entity_key: session_name.to_string(),
                    payload,
                    is_initial: false,
                    is_complete: false,
                });
                for existing in stream.subscribers.iter().filter(|id| **id != observer) {
                    self.broadcaster.send_to(*existing, message.clone());
                }
            }
        }
        stream.line_count = count_lines(&content);
        stream.subscribers.insert(observer);

        if needs_watcher {
            match self.watch(session_name, &output_file) {
                Ok((watcher, task)) => {
                    stream.watcher = Some(watcher);
                    stream.task = Some(task);
                }
                Err(e) => {
                    warn!(target: "saga::logs", "Failed to watch {}: {}", output_file.display(), e);
                }
            }
        }
        debug!(
            target: "saga::logs",
            "Observer {} subscribed to {} ({} subscribers)",
            observer,
            session_name,
            stream.subscribers.len()
        );
    }

    fn watch(
        self: &Arc<Self>,
        session_name: &str,
        output_file: &Path,
    ) -> Result<(RecommendedWatcher, JoinHandle<()>)> {
        let (notify_tx, mut notify_rx) = mpsc::unbounded_channel::<Event>();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            if let Ok(event) = res {
                let _ = notify_tx.send(event);
            }
        })?;
        watcher.watch(output_file, RecursiveMode::NonRecursive)?;

        let manager = Arc::downgrade(self);
        let session_name = session_name.to_string();
        let task = tokio::spawn(async move {
            while let Some(event) = notify_rx.recv().await {
                if !(event.kind.is_modify() || event.kind.is_create()) {
                    continue;
                }
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                manager.send_incremental(&session_name).await;
            }
        });

        Ok((watcher, task))
    }

    /// Send lines written since the last delivery to every subscriber.
    async fn send_incremental(&self, session_name: &str) {
        let Ok(content) = tokio::fs::read_to_string(self.output_file(session_name)).await else {
            return;
        };

        let mut streams = self.streams.lock().await;
        let Some(stream) = streams.get_mut(session_name) else {
            return;
        };

        let Some((payload, line_count)) = new_lines_since(&content, stream.line_count) else {
            return;
        };
        stream.line_count = line_count;
        trace!(target: "saga::logs", "{} new lines for {}", payload.len(), session_name);

        let message = WsServerMessage::LogsData(LogsData {
            entity_key: session_name.to_string(),
            payload,
            is_initial: false,
            is_complete: false,
        });
        for observer in &stream.subscribers {
            self.broadcaster.send_to(*observer, message.clone());
        }
    }

    pub async fn unsubscribe(&self, session_name: &str, observer: ObserverId) {
        let mut streams = self.streams.lock().await;
        if let Some(stream) = streams.get_mut(session_name) {
            stream.subscribers.remove(&observer);
            if stream.subscribers.is_empty() {
                streams.remove(session_name);
                debug!(target: "saga::logs", "Stopped watching {}", session_name);
            }
        }
    }

    /// Drop an observer from every stream it was subscribed to.
    pub async fn handle_observer_disconnect(&self, observer: ObserverId) {
        let mut streams = self.streams.lock().await;
        streams.retain(|_, stream| {
            stream.subscribers.remove(&observer);
            !stream.subscribers.is_empty()
        });
    }

    /// Flush remaining lines with `isComplete` set, then stop watching.
    pub async fn notify_session_completed(&self, session_name: &str) {
        let content = tokio::fs::read_to_string(self.output_file(session_name))
            .await
            .unwrap_or_default();

        let mut streams = self.streams.lock().await;
        let Some(stream) = streams.remove(session_name) else {
            return;
        };

        let payload = new_lines_since(&content, stream.line_count)
            .map(|(payload, _)| payload)
            .unwrap_or_default();
        let message = WsServerMessage::LogsData(LogsData {
            entity_key: session_name.to_string(),
            payload,
            is_initial: false,
            is_complete: true,
        });
        for observer in &stream.subscribers {
            self.broadcaster.send_to(*observer, message.clone());
        }
        debug!(target: "saga::logs", "Session {} completed, log stream closed", session_name);
    }

    /// Forward poller completion events until the poller goes away.
    pub fn spawn_completion_listener(
        self: &Arc<Self>,
        mut events: broadcast::Receiver<SessionEvent>,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(SessionEvent::Completed { name }) => {
                        manager.notify_session_completed(&name).await;
                    }
                    Ok(SessionEvent::SnapshotChanged(_)) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(target: "saga::logs", "Missed {} session events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Stop all watchers and forget all subscriptions.
    pub async fn dispose(&self) {
        self.streams.lock().await.clear();
    }

    pub async fn subscription_count(&self, session_name: &str) -> usize {
        self.streams
            .lock()
            .await
            .get(session_name)
            .map_or(0, |s| s.subscribers.len())
    }

    pub async fn has_watcher(&self, session_name: &str) -> bool {
        self.streams
            .lock()
            .await
            .get(session_name)
            .is_some_and(|s| s.watcher.is_some())
    }

    pub async fn line_count(&self, session_name: &str) -> usize {
        self.streams
            .lock()
            .await
            .get(session_name)
            .map_or(0, |s| s.line_count)
    }
}

/// Parse JSONL content, skipping blank and malformed lines.
pub fn parse_jsonl_lines(content: &str) -> Vec<Value> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect()
}

fn count_lines(content: &str) -> usize {
    content.lines().filter(|l| !l.trim().is_empty()).count()
}

/// Records on non-empty lines past `seen`, with the new line count.
fn new_lines_since(content: &str, seen: usize) -> Option<(Vec<Value>, usize)> {
    let lines: Vec<&str> = content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();
    if lines.len() <= seen {
        return None;
    }
    let payload = lines[seen..]
        .iter()
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect();
    Some((payload, lines.len()))
}
