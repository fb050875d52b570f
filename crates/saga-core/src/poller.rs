//! Periodic session discovery with change detection.
//!
//! tmux offers no change notifications, so the poller lists sessions on a
//! fixed interval, diffs the result against the previous snapshot and emits a
//! [`SessionEvent::SnapshotChanged`] only when something observable changed.

use crate::{SessionDetailBuilder, SessionLister};
use futures::future::join_all;
use saga_types::SessionInfo;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

/// Reference polling interval.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(3000);

#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub interval: Duration,
    /// Capacity of the event channel handed to subscribers.
    pub event_capacity: usize,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            event_capacity: 64,
        }
    }
}

/// Events emitted by the poller.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The snapshot changed; carries the full new snapshot, newest first.
    SnapshotChanged(Arc<Vec<SessionInfo>>),
    /// A session went from running to completed since the previous snapshot.
    Completed { name: String },
}

/// Result of one poll cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    /// The snapshot was replaced with this one.
    Changed(Vec<SessionInfo>),
    /// Nothing observable changed, or discovery failed this cycle.
    Unchanged,
    /// Another cycle was still in flight.
    Skipped,
}

impl PollOutcome {
    pub fn changed(&self) -> bool {
        matches!(self, PollOutcome::Changed(_))
    }
}

/// Owns the canonical session snapshot.
pub struct SessionPoller {
    lister: Arc<dyn SessionLister>,
    builder: Arc<dyn SessionDetailBuilder>,
    config: PollerConfig,
    snapshot: RwLock<Arc<Vec<SessionInfo>>>,
    first_poll: AtomicBool,
    /// Held for the duration of a cycle so cycles never overlap.
    cycle: tokio::sync::Mutex<()>,
    event_tx: broadcast::Sender<SessionEvent>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SessionPoller {
    pub fn new(
        lister: Arc<dyn SessionLister>,
        builder: Arc<dyn SessionDetailBuilder>,
        config: PollerConfig,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            lister,
            builder,
            config,
            snapshot: RwLock::new(Arc::new(Vec::new())),
            first_poll: AtomicBool::new(true),
            cycle: tokio::sync::Mutex::new(()),
            event_tx,
            task: Mutex::new(None),
        }
    }

    /// Subscribe to snapshot and completion events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }

    /// Copy of the current snapshot, newest first.
    pub fn current_sessions(&self) -> Vec<SessionInfo> {
        self.snapshot_arc().as_ref().clone()
    }

    fn snapshot_arc(&self) -> Arc<Vec<SessionInfo>> {
        self.snapshot
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Start polling: once immediately, then every interval.
    ///
    /// Restarting resets the baseline, so the first cycle always broadcasts.
    pub fn start(self: &Arc<Self>) {
        self.stop();

        let poller = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poller.config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                poller.poll().await;
            }
        });

        *self.task.lock().unwrap_or_else(|p| p.into_inner()) = Some(handle);
        info!(
            target: "saga::poller",
            "Session polling started (interval: {:?})",
            self.config.interval
        );
    }

    /// Stop polling and forget the current snapshot.
    pub fn stop(&self) {
        if let Some(handle) = self.task.lock().unwrap_or_else(|p| p.into_inner()).take() {
            handle.abort();
            info!(target: "saga::poller", "Session polling stopped");
        }
        *self.snapshot.write().unwrap_or_else(|p| p.into_inner()) = Arc::new(Vec::new());
        self.first_poll.store(true, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Run one discovery cycle. Never fails; errors degrade to "unchanged".
    pub async fn poll(&self) -> PollOutcome {
        let Ok(_cycle) = self.cycle.try_lock() else {
            trace!(target: "saga::poller", "Previous poll still in flight, skipping tick");
            return PollOutcome::Skipped;
        };

        let Some(sessions) = self.discover().await else {
            return PollOutcome::Unchanged;
        };

        let previous = self.snapshot_arc();
        let first = self.first_poll.load(Ordering::SeqCst);
        if !first && !detect_changes(&previous, &sessions) {
            trace!(target: "saga::poller", "No session changes");
            return PollOutcome::Unchanged;
        }

        let completed = completed_transitions(&previous, &sessions);
        let snapshot = Arc::new(sessions);
        *self.snapshot.write().unwrap_or_else(|p| p.into_inner()) = Arc::clone(&snapshot);
        self.first_poll.store(false, Ordering::SeqCst);

        debug!(
            target: "saga::poller",
            "Session snapshot changed ({} sessions)",
            snapshot.len()
        );

        // No receivers is fine; nobody is listening yet.
        let _ = self
            .event_tx
            .send(SessionEvent::SnapshotChanged(Arc::clone(&snapshot)));
        for name in completed {
            debug!(target: "saga::poller", "Session {} completed", name);
            let _ = self.event_tx.send(SessionEvent::Completed { name });
        }

        PollOutcome::Changed(snapshot.as_ref().clone())
    }

    /// List and resolve sessions. `None` when the lister itself failed.
    async fn discover(&self) -> Option<Vec<SessionInfo>> {
        let raw_sessions = match self.lister.list_sessions().await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(target: "saga::poller", "Failed to list sessions: {}", e);
                return None;
            }
        };

        let builds = raw_sessions.iter().map(|raw| async move {
            match self.builder.build(raw).await {
                Ok(info) => info,
                Err(e) => {
                    debug!(target: "saga::poller", "Failed to build session {}: {}", raw.name, e);
                    None
                }
            }
        });

        let mut sessions: Vec<SessionInfo> = join_all(builds).await.into_iter().flatten().collect();
        sessions.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        Some(sessions)
    }
}

/// Whether `next` differs observably from `previous`.
///
/// Compares the set of names, then status and preview of each matching pair.
/// Order and other fields are ignored.
pub fn detect_changes(previous: &[SessionInfo], next: &[SessionInfo]) -> bool {
    if previous.len() != next.len() {
        return true;
    }

    let previous_by_name: HashMap<&str, &SessionInfo> =
        previous.iter().map(|s| (s.name.as_str(), s)).collect();
    let next_by_name: HashMap<&str, &SessionInfo> =
        next.iter().map(|s| (s.name.as_str(), s)).collect();

    if previous_by_name.len() != next_by_name.len() {
        return true;
    }

    next_by_name.iter().any(|(name, new)| match previous_by_name.get(name) {
        None => true,
        Some(old) => old.status != new.status || old.output_preview != new.output_preview,
    })
}

/// Names that were running in `previous` and are completed in `next`.
fn completed_transitions(previous: &[SessionInfo], next: &[SessionInfo]) -> Vec<String> {
    let was_running: HashMap<&str, bool> =
        previous.iter().map(|s| (s.name.as_str(), s.is_running())).collect();

    next.iter()
        .filter(|s| !s.is_running() && was_running.get(s.name.as_str()) == Some(&true))
        .map(|s| s.name.clone())
        .collect()
}
