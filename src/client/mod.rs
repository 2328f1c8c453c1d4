//! DCS Protocol - Client Library
//!
//! High-level API for devices talking to the DCS cloud.

#[allow(clippy::module_inception)]
mod client;
mod config;
mod dispatch;
mod receiver;
mod session;

pub use client::*;
pub use config::*;
pub use dispatch::parse_setup_changes;
pub use session::ConnectionPhase;
