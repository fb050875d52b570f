//! Observer side of the Saga session monitor: one resilient WebSocket
//! connection with heartbeat, backoff, subscription replay and per-entity
//! log routing.

mod connection;
mod error;
mod machine;
mod registry;
mod router;

pub use connection::{
    ConnectionConfig, ConnectionManager, DEFAULT_CONNECT_TIMEOUT, DEFAULT_QUEUE_CAPACITY,
};
pub use error::ClientError;
pub use machine::{
    backoff_delay, heartbeat_expired, ConnectionEvent, ConnectionMachine, ConnectionState,
    ConnectionStatus, Effect, RetryPolicy, BACKOFF_BASE, BACKOFF_CAP, HEARTBEAT_INTERVAL,
    MAX_RETRIES,
};
pub use registry::{Subscription, SubscriptionRegistry};
pub use router::{LogFrame, LogFrameReceiver, RouteOutcome, StreamRouter};

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;
