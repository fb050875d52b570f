//! Fan-out of server messages to connected observers.

use crate::SessionEvent;
use dashmap::DashMap;
use saga_types::{SessionInfo, StoryDetail, WsServerMessage};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// Identifier of one connected observer.
pub type ObserverId = Uuid;

/// Outbound queue of one observer, drained by its WebSocket task.
pub type ObserverReceiver = mpsc::Receiver<WsServerMessage>;

/// Messages buffered per observer before further sends to it are dropped.
pub const OBSERVER_QUEUE_CAPACITY: usize = 256;

struct Observer {
    tx: mpsc::Sender<WsServerMessage>,
    stories: HashSet<String>,
}

/// Registry of connected observers.
///
/// Sends never wait: a full queue drops the message for that observer only,
/// a closed queue removes the observer.
#[derive(Default)]
pub struct Broadcaster {
    observers: DashMap<ObserverId, Observer>,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new observer and return its outbound queue.
    pub fn register(&self) -> (ObserverId, ObserverReceiver) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(OBSERVER_QUEUE_CAPACITY);
        self.observers.insert(
            id,
            Observer {
                tx,
                stories: HashSet::new(),
            },
        );
        debug!(target: "saga::ws", "Observer {} registered ({} connected)", id, self.observers.len());
        (id, rx)
    }

    pub fn unregister(&self, id: ObserverId) {
        if self.observers.remove(&id).is_some() {
            debug!(target: "saga::ws", "Observer {} unregistered ({} connected)", id, self.observers.len());
        }
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    /// Push the full snapshot to every observer.
    pub fn on_snapshot_changed(&self, snapshot: &[SessionInfo]) -> usize {
        self.broadcast(WsServerMessage::SessionsUpdated(snapshot.to_vec()))
    }

    /// Send a message to every observer. Returns how many accepted it.
    pub fn broadcast(&self, message: WsServerMessage) -> usize {
        self.deliver(message, |_| true)
    }

    /// Send a message to one observer.
    pub fn send_to(&self, id: ObserverId, message: WsServerMessage) -> bool {
        let outcome = match self.observers.get(&id) {
            Some(observer) => observer.tx.try_send(message),
            None => return false,
        };
        self.handle_send_outcome(id, outcome)
    }

    pub fn subscribe_story(&self, id: ObserverId, story_id: &str) {
        if let Some(mut observer) = self.observers.get_mut(&id) {
            observer.stories.insert(story_id.to_string());
        }
    }

    pub fn unsubscribe_story(&self, id: ObserverId, story_id: &str) {
        if let Some(mut observer) = self.observers.get_mut(&id) {
            observer.stories.remove(story_id);
        }
    }

    pub fn has_story_subscribers(&self, story_id: &str) -> bool {
        self.observers
            .iter()
            .any(|entry| entry.stories.contains(story_id))
    }

    /// Send a story update to the observers subscribed to it.
    pub fn publish_story(&self, story: StoryDetail) -> usize {
        let story_id = story.id.clone();
        self.deliver(WsServerMessage::StoryUpdated(story), |observer| {
            observer.stories.contains(&story_id)
        })
    }

    fn deliver(&self, message: WsServerMessage, filter: impl Fn(&Observer) -> bool) -> usize {
        let outcomes: Vec<_> = self
            .observers
            .iter()
            .filter(|entry| filter(entry.value()))
            .map(|entry| (*entry.key(), entry.tx.try_send(message.clone())))
            .collect();

        // Outcomes are handled after iteration; removal inside it would deadlock the shard.
        outcomes
            .into_iter()
            .map(|(id, outcome)| self.handle_send_outcome(id, outcome))
            .filter(|delivered| *delivered)
            .count()
    }

    fn handle_send_outcome(
        &self,
        id: ObserverId,
        outcome: Result<(), mpsc::error::TrySendError<WsServerMessage>>,
    ) -> bool {
        match outcome {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(target: "saga::ws", "Observer {} is not keeping up, dropping message", id);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.unregister(id);
                false
            }
        }
    }

    /// Forward poller snapshots to all observers until the poller goes away.
    pub fn spawn_forwarder(
        self: &Arc<Self>,
        mut events: broadcast::Receiver<SessionEvent>,
    ) -> JoinHandle<()> {
        let broadcaster = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(SessionEvent::SnapshotChanged(snapshot)) => {
                        let delivered = broadcaster.on_snapshot_changed(&snapshot);
                        trace!(
                            target: "saga::ws",
                            "Broadcast {} sessions to {} observers",
                            snapshot.len(),
                            delivered
                        );
                    }
                    Ok(SessionEvent::Completed { .. }) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        // Later snapshots are full, so skipping stale ones is harmless.
                        debug!(target: "saga::ws", "Broadcaster lagged by {} events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}
