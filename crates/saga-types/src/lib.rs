//! Shared types for the Saga session monitor.

mod session;
mod story;
mod ws;

pub use session::*;
pub use story::*;
pub use ws::*;
