//! Producer side of the Saga session monitor: session discovery, change
//! detection and fan-out to connected observers.

mod broadcaster;
mod detail;
mod error;
mod log_stream;
mod poller;
mod stories;
mod tmux;

pub use broadcaster::{Broadcaster, ObserverId, ObserverReceiver, OBSERVER_QUEUE_CAPACITY};
pub use detail::{
    generate_output_preview, parse_session_name, validate_slug, FsSessionDetailBuilder,
    SessionDetailBuilder, PREVIEW_LINES_COUNT, PREVIEW_MAX_LENGTH,
};
pub use error::SagaError;
pub use log_stream::{parse_jsonl_lines, LogStreamManager};
pub use poller::{detect_changes, PollOutcome, PollerConfig, SessionEvent, SessionPoller};
pub use stories::{story_id_from_path, FsStoryLoader, StoryLoader, StoryWatcher};
pub use tmux::{SessionLister, TmuxSessionLister, SESSION_PREFIX};

/// Result type for Saga operations.
pub type Result<T> = std::result::Result<T, SagaError>;
