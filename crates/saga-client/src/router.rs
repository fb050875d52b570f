//! Per-entity demultiplexing of log frames.

use saga_types::{LogsData, LogsError};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::mpsc;

/// A frame delivered to a log consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum LogFrame {
    Data {
        payload: Vec<Value>,
        is_initial: bool,
        is_complete: bool,
    },
    Error(String),
}

pub type LogFrameReceiver = mpsc::UnboundedReceiver<LogFrame>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Delivered,
    /// Nobody registered for the key; the frame was dropped.
    NoConsumer,
    /// The consumer dropped its receiver and has been removed.
    ConsumerGone,
}

/// Maps entity keys to consumer channels.
#[derive(Debug, Default)]
pub struct StreamRouter {
    consumers: HashMap<String, mpsc::UnboundedSender<LogFrame>>,
}

impl StreamRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a consumer for `entity_key`, replacing any previous one.
    pub fn register(&mut self, entity_key: impl Into<String>) -> LogFrameReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        self.consumers.insert(entity_key.into(), tx);
        rx
    }

    pub fn unregister(&mut self, entity_key: &str) -> bool {
        self.consumers.remove(entity_key).is_some()
    }

    pub fn is_registered(&self, entity_key: &str) -> bool {
        self.consumers.contains_key(entity_key)
    }

    pub fn route_data(&mut self, data: LogsData) -> RouteOutcome {
        let frame = LogFrame::Data {
            payload: data.payload,
            is_initial: data.is_initial,
            is_complete: data.is_complete,
        };
        self.route(&data.entity_key, frame)
    }

    pub fn route_error(&mut self, error: LogsError) -> RouteOutcome {
        self.route(&error.entity_key, LogFrame::Error(error.error))
    }

    fn route(&mut self, entity_key: &str, frame: LogFrame) -> RouteOutcome {
        let Some(consumer) = self.consumers.get(entity_key) else {
            return RouteOutcome::NoConsumer;
        };
        if consumer.send(frame).is_ok() {
            RouteOutcome::Delivered
        } else {
            self.consumers.remove(entity_key);
            RouteOutcome::ConsumerGone
        }
    }
}
