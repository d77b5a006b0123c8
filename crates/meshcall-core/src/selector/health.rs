//! Per-address health tracking.
//!
//! A failed candidate is not removed, only deprioritized:
//! - Healthy: picked normally
//! - Unhealthy: only picked when no healthy candidate remains
//! - Probing: cool-down elapsed, picked normally until the next report

use crate::config::RetryDefaults;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Health states of one address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Healthy,
    Unhealthy,
    Probing,
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthState::Healthy => write!(f, "HEALTHY"),
            HealthState::Unhealthy => write!(f, "UNHEALTHY"),
            HealthState::Probing => write!(f, "PROBING"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    state: HealthState,
    failures: u32,
    since: Instant,
}

/// Tracks which candidate addresses recently failed.
#[derive(Debug)]
pub struct HealthTracker {
    cooldown: RwLock<Duration>,
    entries: RwLock<HashMap<String, Entry>>,
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new(RetryDefaults::UNHEALTHY_COOLDOWN)
    }
}

impl HealthTracker {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown: RwLock::new(cooldown),
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn set_cooldown(&self, cooldown: Duration) {
        *self.cooldown.write().unwrap_or_else(|e| e.into_inner()) = cooldown;
    }

    fn cooldown(&self) -> Duration {
        *self.cooldown.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Current state of `addr`, moving it to probing once the cool-down has passed.
    pub fn state(&self, addr: &str) -> HealthState {
        let cooldown = self.cooldown();
        {
            let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
            match entries.get(addr) {
                None => return HealthState::Healthy,
                Some(entry) if entry.state != HealthState::Unhealthy => return entry.state,
                Some(entry) if entry.since.elapsed() < cooldown => return HealthState::Unhealthy,
                Some(_) => {}
            }
        }

        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        match entries.get_mut(addr) {
            Some(entry) if entry.state == HealthState::Unhealthy => {
                entry.state = HealthState::Probing;
                entry.since = Instant::now();
                debug!("Candidate {} cooled down, probing", addr);
                HealthState::Probing
            }
            Some(entry) => entry.state,
            None => HealthState::Healthy,
        }
    }

    /// True unless `addr` is inside its cool-down.
    pub fn is_preferred(&self, addr: &str) -> bool {
        self.state(addr) != HealthState::Unhealthy
    }

    pub fn record_success(&self, addr: &str) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = entries.remove(addr) {
            info!(
                "Candidate {} recovered after {} failure(s)",
                addr, entry.failures
            );
        }
    }

    pub fn record_failure(&self, addr: &str) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let entry = entries.entry(addr.to_string()).or_insert(Entry {
            state: HealthState::Healthy,
            failures: 0,
            since: Instant::now(),
        });
        entry.failures += 1;
        if entry.state != HealthState::Unhealthy {
            warn!(
                "Candidate {} marked unhealthy after {} failure(s)",
                addr, entry.failures
            );
        }
        entry.state = HealthState::Unhealthy;
        entry.since = Instant::now();
    }

    /// Drop whatever is known about `addrs`.
    pub fn forget<'a>(&self, addrs: impl IntoIterator<Item = &'a str>) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        for addr in addrs {
            if entries.remove(addr).is_some() {
                debug!("Forgetting health of departed candidate {}", addr);
            }
        }
    }

    /// Number of addresses currently tracked.
    pub fn tracked(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}
