//! Saga session monitor server library.
//!
//! HTTP routes, the observer WebSocket endpoint and application state, kept
//! apart from main.rs so integration tests can build the router directly.

pub mod app;
pub mod config;
pub mod logging;
pub mod routes;
pub mod state;
pub mod websocket;
