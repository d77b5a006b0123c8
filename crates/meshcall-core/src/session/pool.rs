use super::conn::CloseCause;
use super::{Dialer, Session, SessionInfo, SessionState};
use crate::endpoint::EndpointConfig;
use crate::error::{MeshError, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

/// Outcome of [`SessionPool::shutdown`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// Sessions open when shutdown began.
    pub sessions: usize,
    /// Sessions that finished their outstanding calls in time.
    pub drained: usize,
    /// Sessions closed because the shutdown bound expired.
    pub forced: usize,
    /// Calls still in flight on forced sessions.
    pub abandoned_calls: usize,
}

/// Sessions keyed by candidate address, at most one live per address.
///
/// Concurrent acquires for the same address wait on a per-address gate so
/// only one of them dials.
pub struct SessionPool {
    dialer: Dialer,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    gates: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    closed: AtomicBool,
}

impl SessionPool {
    pub fn new(config: Arc<EndpointConfig>) -> Self {
        Self {
            dialer: Dialer::new(config),
            sessions: RwLock::new(HashMap::new()),
            gates: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn usable(&self, addr: &str) -> Option<Arc<Session>> {
        let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
        sessions.get(addr).filter(|s| s.is_usable()).cloned()
    }

    fn gate(&self, addr: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut gates = self.gates.lock().unwrap_or_else(|e| e.into_inner());
        gates.entry(addr.to_string()).or_default().clone()
    }

    /// Drop the gate for `addr` once nobody else holds or waits on it.
    fn release_gate(&self, addr: &str, gate: &Arc<tokio::sync::Mutex<()>>) {
        let mut gates = self.gates.lock().unwrap_or_else(|e| e.into_inner());
        let idle = gates
            .get(addr)
            .is_some_and(|g| Arc::ptr_eq(g, gate) && Arc::strong_count(gate) == 2);
        if idle {
            gates.remove(addr);
        }
    }

    /// Return the active session for `addr`, dialing one if needed.
    pub async fn acquire(&self, addr: &str) -> Result<Arc<Session>> {
        if self.is_closed() {
            return Err(MeshError::EndpointClosed);
        }
        if let Some(session) = self.usable(addr) {
            return Ok(session);
        }

        let gate = self.gate(addr);
        let result = {
            let _guard = gate.lock().await;
            self.dial_gated(addr).await
        };
        self.release_gate(addr, &gate);
        result
    }

    /// Second half of `acquire`, run while holding the address gate.
    async fn dial_gated(&self, addr: &str) -> Result<Arc<Session>> {
        if let Some(session) = self.usable(addr) {
            return Ok(session);
        }
        if self.is_closed() {
            return Err(MeshError::EndpointClosed);
        }

        let session = self.dialer.dial(addr).await?;
        {
            let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
            if self.is_closed() {
                drop(sessions);
                session.begin_drain("endpoint shutting down");
                return Err(MeshError::EndpointClosed);
            }
            sessions.retain(|_, s| s.state() != SessionState::Closed);
            if let Some(previous) = sessions.insert(addr.to_string(), session.clone()) {
                debug!(
                    "Replaced session {} to {} ({})",
                    previous.id(),
                    addr,
                    previous.state()
                );
            }
        }
        Ok(session)
    }

    /// Snapshot of every session the pool still tracks.
    pub fn sessions(&self) -> Vec<SessionInfo> {
        let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
        let mut infos: Vec<SessionInfo> = sessions
            .values()
            .filter(|s| s.state() != SessionState::Closed)
            .map(|s| s.info())
            .collect();
        infos.sort_by(|a, b| a.remote.cmp(&b.remote));
        infos
    }

    /// Drain every session, forcing closed whatever is left after `timeout`.
    ///
    /// New acquires fail with `EndpointClosed` from the moment this is called.
    pub async fn shutdown(&self, timeout: Duration) -> ShutdownReport {
        self.closed.store(true, Ordering::SeqCst);
        let sessions: Vec<Arc<Session>> = {
            let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
            sessions.drain().map(|(_, s)| s).collect()
        };

        let deadline = Instant::now() + timeout;
        let mut report = ShutdownReport {
            sessions: sessions.len(),
            ..Default::default()
        };
        for session in &sessions {
            session.begin_drain("endpoint shutting down");
        }
        for session in sessions {
            match timeout_at(deadline, session.closed()).await {
                Ok(()) => report.drained += 1,
                Err(_) => {
                    let left = session.in_flight();
                    warn!(
                        "Session {} to {} did not drain within {:?}; abandoning {} call(s)",
                        session.id(),
                        session.remote(),
                        timeout,
                        left
                    );
                    report.abandoned_calls += left;
                    report.forced += 1;
                    session.close(CloseCause::Forced);
                }
            }
        }

        info!(
            "Session pool shut down: {} drained, {} forced, {} call(s) abandoned",
            report.drained, report.forced, report.abandoned_calls
        );
        report
    }
}

impl std::fmt::Debug for SessionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self
            .sessions
            .read()
            .map(|s| s.len())
            .unwrap_or_default();
        f.debug_struct("SessionPool")
            .field("sessions", &count)
            .field("closed", &self.is_closed())
            .finish()
    }
}
