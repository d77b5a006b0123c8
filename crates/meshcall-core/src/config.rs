//! Centralized defaults for meshcall.
//!
//! These constants seed [`EndpointConfig`](crate::endpoint::EndpointConfig)
//! and the reference collaborators. Every value here can be overridden through
//! endpoint options except the frame limits.

use std::time::Duration;

/// Session lifetime and keep-alive defaults.
pub struct SessionDefaults;

impl SessionDefaults {
    pub const SESSION_AGE: Duration = Duration::from_secs(3600);
    pub const CONTEXT_AGE: Duration = Duration::from_secs(30);
    pub const SLOW_CALL_THRESHOLD: Duration = Duration::from_secs(5);
    /// Zero disables heartbeats.
    pub const HEARTBEAT_INTERVAL: Duration = Duration::ZERO;
    pub const HEARTBEAT_MISS_THRESHOLD: u32 = 2;
    pub const BODY_CODEC: &'static str = "json";
}

/// Dialing defaults.
pub struct DialDefaults;

impl DialDefaults {
    pub const NETWORK: &'static str = "tcp";
    pub const LOCAL_IP: &'static str = "0.0.0.0";
    pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
}

/// Retry and discovery defaults.
pub struct RetryDefaults;

impl RetryDefaults {
    pub const RETRY_TIMES: u32 = 2;
    /// Upper bound accepted by the endpoint builder.
    pub const MAX_RETRY_TIMES: u32 = 64;
    pub const REGISTRY_WAIT: Duration = Duration::from_secs(3);
    pub const UNHEALTHY_COOLDOWN: Duration = Duration::from_secs(10);
    pub const BACKOFF_MAX_DELAY: Duration = Duration::from_secs(5);
}

/// Wire framing limits for the default protocol.
pub struct FrameDefaults;

impl FrameDefaults {
    pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024; // 16MB
}
