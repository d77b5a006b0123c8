//! Error types for meshcall.
//!
//! Every failure the client stack can surface is a variant of [`MeshError`].
//! Transport and timing failures are classified as retryable; encoding
//! failures, hook aborts and remote application errors are not.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Pipeline stage at which a plugin hook ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookStage {
    BeforeDial,
    AfterDial,
    BeforeWrite,
    AfterRead,
    SessionCreate,
}

impl fmt::Display for HookStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HookStage::BeforeDial => "before-dial",
            HookStage::AfterDial => "after-dial",
            HookStage::BeforeWrite => "before-write",
            HookStage::AfterRead => "after-read",
            HookStage::SessionCreate => "on-session-create",
        };
        f.write_str(name)
    }
}

/// Main error type for meshcall.
#[derive(Debug, Error)]
pub enum MeshError {
    // Codec errors
    #[error("Codec not found: {0}")]
    CodecNotFound(String),

    #[error("Duplicate codec identifier: {0}")]
    DuplicateIdentifier(String),

    #[error("Encoding failed with codec {codec}: {message}")]
    EncodingFailed { codec: String, message: String },

    // Transport errors
    #[error("Dial to {addr} timed out after {timeout:?}")]
    DialTimeout { addr: String, timeout: Duration },

    #[error("Handshake with {addr} failed: {message}")]
    HandshakeFailed { addr: String, message: String },

    #[error("Connection to {addr} lost: {message}")]
    ConnectionLost { addr: String, message: String },

    #[error("Call {service_method} on {addr} timed out after {timeout:?}")]
    CallTimeout {
        addr: String,
        service_method: String,
        timeout: Duration,
    },

    #[error("Session to {addr} is draining")]
    SessionDraining { addr: String },

    #[error("Session to {addr} is closed")]
    SessionClosed { addr: String },

    // Discovery errors
    #[error("No available candidate for service {service}")]
    NoAvailableCandidate { service: String },

    #[error("Service {service} unavailable for {method} after {attempts} attempt(s)")]
    ServiceUnavailable {
        service: String,
        method: String,
        attempts: u32,
        #[source]
        last: Option<Box<MeshError>>,
    },

    #[error("Call {service}.{method} failed after {attempts} attempt(s): {source}")]
    RetriesExhausted {
        service: String,
        method: String,
        attempts: u32,
        source: Box<MeshError>,
    },

    #[error("Call {service}.{method} aborted on attempt {attempts}: {source}")]
    CallAborted {
        service: String,
        method: String,
        attempts: u32,
        source: Box<MeshError>,
    },

    // Pipeline errors
    #[error("Plugin {plugin} aborted at {stage}: {reason}")]
    HookAborted {
        plugin: String,
        stage: HookStage,
        reason: String,
    },

    #[error("Remote error {code}: {message}")]
    ApplicationError { code: i32, message: String },

    #[error("Endpoint is shutting down")]
    EndpointClosed,

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },
}

/// Result type alias for meshcall operations.
pub type Result<T> = std::result::Result<T, MeshError>;

impl From<std::io::Error> for MeshError {
    fn from(err: std::io::Error) -> Self {
        MeshError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for MeshError {
    fn from(err: serde_json::Error) -> Self {
        MeshError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl MeshError {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        MeshError::Config {
            message: message.into(),
        }
    }

    pub(crate) fn encoding(codec: impl Into<String>, message: impl fmt::Display) -> Self {
        MeshError::EncodingFailed {
            codec: codec.into(),
            message: message.to_string(),
        }
    }

    /// Check if the dispatcher should retry this error against another candidate.
    ///
    /// A session found draining or closed between pick and write is a race with
    /// the session's own lifecycle, so it is treated like a lost connection.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MeshError::DialTimeout { .. }
                | MeshError::ConnectionLost { .. }
                | MeshError::CallTimeout { .. }
                | MeshError::SessionDraining { .. }
                | MeshError::SessionClosed { .. }
        )
    }

    /// Walk through call-level wrappers to the underlying failure.
    pub fn cause(&self) -> &MeshError {
        match self {
            MeshError::RetriesExhausted { source, .. } | MeshError::CallAborted { source, .. } => {
                source.cause()
            }
            MeshError::ServiceUnavailable {
                last: Some(last), ..
            } => last.cause(),
            other => other,
        }
    }

    /// Number of attempts recorded on a call-level error, if any.
    pub fn attempts(&self) -> Option<u32> {
        match self {
            MeshError::ServiceUnavailable { attempts, .. }
            | MeshError::RetriesExhausted { attempts, .. }
            | MeshError::CallAborted { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }
}
