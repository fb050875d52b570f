//! Interest declarations replayed on every (re)connect.

use saga_types::WsClientMessage;

/// One `(kind, key)` interest.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Subscription {
    /// `story-updated` frames for a story id.
    Story(String),
    /// `logs-data` / `logs-error` frames for a session name.
    Logs(String),
}

impl Subscription {
    pub fn key(&self) -> &str {
        match self {
            Subscription::Story(key) | Subscription::Logs(key) => key,
        }
    }

    pub fn subscribe_message(&self) -> WsClientMessage {
        match self {
            Subscription::Story(id) => WsClientMessage::subscribe_story(id.as_str()),
            Subscription::Logs(key) => WsClientMessage::subscribe_logs(key.as_str()),
        }
    }

    pub fn unsubscribe_message(&self) -> WsClientMessage {
        match self {
            Subscription::Story(id) => WsClientMessage::unsubscribe_story(id.as_str()),
            Subscription::Logs(key) => WsClientMessage::unsubscribe_logs(key.as_str()),
        }
    }
}

/// Ordered set of subscriptions. Insertion order is replay order.
#[derive(Debug, Default, Clone)]
pub struct SubscriptionRegistry {
    entries: Vec<Subscription>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the subscription was already present.
    pub fn add(&mut self, subscription: Subscription) -> bool {
        if self.entries.contains(&subscription) {
            return false;
        }
        self.entries.push(subscription);
        true
    }

    /// Returns false if the subscription was not present.
    pub fn remove(&mut self, subscription: &Subscription) -> bool {
        let before = self.entries.len();
        self.entries.retain(|entry| entry != subscription);
        self.entries.len() != before
    }

    pub fn contains(&self, subscription: &Subscription) -> bool {
        self.entries.contains(subscription)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Subscription> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Subscribe messages for every entry, in registration order.
    pub fn replay_messages(&self) -> Vec<WsClientMessage> {
        self.entries.iter().map(Subscription::subscribe_message).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_is_idempotent() {
        let mut registry = SubscriptionRegistry::new();
        assert!(registry.add(Subscription::Story("auth".to_string())));
        assert!(!registry.add(Subscription::Story("auth".to_string())));
        assert_eq!(registry.len(), 1);
        assert_eq!(
            registry.replay_messages(),
            vec![WsClientMessage::subscribe_story("auth")]
        );
    }

    #[test]
    fn test_same_key_different_kind_are_distinct() {
        let mut registry = SubscriptionRegistry::new();
        registry.add(Subscription::Story("x".to_string()));
        registry.add(Subscription::Logs("x".to_string()));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_replay_preserves_order() {
        let mut registry = SubscriptionRegistry::new();
        registry.add(Subscription::Logs("saga-story-b-2".to_string()));
        registry.add(Subscription::Story("a".to_string()));
        registry.add(Subscription::Story("c".to_string()));
        registry.remove(&Subscription::Story("a".to_string()));
        registry.add(Subscription::Story("a".to_string()));

        assert_eq!(
            registry.replay_messages(),
            vec![
                WsClientMessage::subscribe_logs("saga-story-b-2"),
                WsClientMessage::subscribe_story("c"),
                WsClientMessage::subscribe_story("a"),
            ]
        );
    }

    #[test]
    fn test_remove_absent_is_noop() {
        let mut registry = SubscriptionRegistry::new();
        assert!(!registry.remove(&Subscription::Story("nope".to_string())));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_unsubscribe_message() {
        let sub = Subscription::Logs("saga-story-a-1".to_string());
        assert_eq!(sub.key(), "saga-story-a-1");
        assert_eq!(
            sub.unsubscribe_message(),
            WsClientMessage::unsubscribe_logs("saga-story-a-1")
        );
    }
}
