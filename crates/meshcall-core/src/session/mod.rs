//! Live connections to remote endpoints.
//!
//! A [`Session`] wraps one transport connection and routes replies back to
//! the calls waiting on them. Its own monitor task retires it when it gets
//! too old or stops answering heartbeats. The [`SessionPool`] owns sessions
//! keyed by candidate address and dials new ones through the [`Dialer`].

mod conn;
mod dialer;
mod monitor;
mod pool;

pub use conn::{Exchange, Session};
pub use dialer::Dialer;
pub use pool::{SessionPool, ShutdownReport};

use serde::Serialize;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Transport is up, creation hooks have not finished.
    Connecting,
    /// Accepting calls.
    Active,
    /// No new calls; outstanding ones run until done or past their deadline.
    Draining,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Connecting => "connecting",
            SessionState::Active => "active",
            SessionState::Draining => "draining",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Point-in-time view of a session, handed to plugins and callers.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: Uuid,
    pub remote: String,
    pub state: SessionState,
    pub age: Duration,
    pub idle: Duration,
    pub in_flight: usize,
    pub missed_heartbeats: u32,
    pub slow_calls: u64,
    pub tls: bool,
}
