//! Plugin hooks for dialing, session lifecycle and call execution.
//!
//! A plugin is a named object that opts into one or more capabilities by
//! returning itself from the matching `as_*` accessor. Hooks run
//! synchronously, in registration order, and may mutate what they are given.
//! Returning `Err(reason)` aborts the remaining pipeline for that stage and
//! surfaces as [`MeshError::HookAborted`](crate::MeshError::HookAborted).

mod pipeline;

pub use pipeline::PluginPipeline;

use crate::proto::Message;
use crate::session::SessionInfo;
use std::collections::BTreeMap;

/// Outcome of a single hook. The error string becomes the abort reason.
pub type HookResult = std::result::Result<(), String>;

/// Target of a dial about to happen. `before_dial` hooks may rewrite it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialContext {
    pub addr: String,
}

/// Hooks around establishing a transport connection.
pub trait DialObserver: Send + Sync {
    fn before_dial(&self, _ctx: &mut DialContext) -> HookResult {
        Ok(())
    }

    fn after_dial(&self, _session: &SessionInfo) -> HookResult {
        Ok(())
    }
}

/// Hooks around each call's outgoing and incoming message.
pub trait CallObserver: Send + Sync {
    fn before_write(&self, _message: &mut Message) -> HookResult {
        Ok(())
    }

    fn after_read(&self, _message: &mut Message) -> HookResult {
        Ok(())
    }
}

/// Hooks on session creation and close.
pub trait SessionObserver: Send + Sync {
    fn on_session_create(&self, _session: &SessionInfo) -> HookResult {
        Ok(())
    }

    /// Close notifications cannot abort anything.
    fn on_session_close(&self, _session: &SessionInfo) {}
}

/// A named pipeline entry.
pub trait Plugin: Send + Sync + 'static {
    /// Unique name within one endpoint's pipeline.
    fn name(&self) -> &str;

    fn as_dial_observer(&self) -> Option<&dyn DialObserver> {
        None
    }

    fn as_call_observer(&self) -> Option<&dyn CallObserver> {
        None
    }

    fn as_session_observer(&self) -> Option<&dyn SessionObserver> {
        None
    }
}

/// Stamps fixed metadata onto every outgoing call.
///
/// Keys already present on the message are left alone, so per-call metadata
/// wins over the static set.
#[derive(Debug, Clone)]
pub struct StaticMeta {
    name: String,
    meta: BTreeMap<String, String>,
}

impl StaticMeta {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            meta: BTreeMap::new(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }
}

impl Plugin for StaticMeta {
    fn name(&self) -> &str {
        &self.name
    }

    fn as_call_observer(&self) -> Option<&dyn CallObserver> {
        Some(self)
    }
}

impl CallObserver for StaticMeta {
    fn before_write(&self, message: &mut Message) -> HookResult {
        for (key, value) in &self.meta {
            message
                .meta
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
        Ok(())
    }
}
