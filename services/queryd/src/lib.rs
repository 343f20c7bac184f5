// Query service library surface; the binary in main.rs is a thin wrapper.
//! Blockchain query and notification server.
//!
//! Serves the framed query protocol over router/dealer TCP endpoints and
//! pushes `address.update2` notifications to prefix subscribers.

pub mod auth;
pub mod config;
pub mod dispatch;
pub mod interface;
pub mod server;
pub mod transport;
