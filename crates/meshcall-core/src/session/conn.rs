use super::{monitor, SessionInfo, SessionState};
use crate::endpoint::EndpointConfig;
use crate::error::{MeshError, Result};
use crate::proto::{FrameReader, FrameWriter, Message, MessageKind};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{oneshot, watch, Notify};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

struct PendingCall {
    tx: oneshot::Sender<Result<Message>>,
    deadline: Instant,
    service_method: String,
    timeout: Duration,
}

struct SessionInner {
    state: SessionState,
    last_activity: Instant,
    pending: HashMap<u64, PendingCall>,
    heartbeat: Option<(u64, oneshot::Sender<()>)>,
    missed_heartbeats: u32,
}

/// Why a session was closed. Decides what its leftover calls fail with.
#[derive(Debug, Clone)]
pub(crate) enum CloseCause {
    /// Transport failed; leftovers get `ConnectionLost`.
    Lost(String),
    /// Drain finished or its deadline passed; leftovers get `CallTimeout`.
    Drained,
    /// Closed before it ever became active.
    Rejected(String),
    /// Shutdown bound expired; leftovers get `SessionClosed`.
    Forced,
}

impl fmt::Display for CloseCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseCause::Lost(reason) => write!(f, "transport lost: {}", reason),
            CloseCause::Drained => f.write_str("drained"),
            CloseCause::Rejected(reason) => write!(f, "rejected: {}", reason),
            CloseCause::Forced => f.write_str("forced shutdown"),
        }
    }
}

/// Result of one round trip on a session.
#[derive(Debug, Clone)]
pub struct Exchange {
    pub reply: Message,
    pub elapsed: Duration,
    /// Round trip exceeded the slow-call threshold.
    pub slow: bool,
}

/// One live transport connection.
///
/// Calls are multiplexed by sequence number: each registers a pending slot,
/// writes its message and waits for the reader task to hand it the reply
/// with the same `seq`. Replies may arrive in any order.
pub struct Session {
    id: Uuid,
    remote: String,
    created_at: Instant,
    config: Arc<EndpointConfig>,
    inner: Mutex<SessionInner>,
    writer: tokio::sync::Mutex<Box<dyn FrameWriter>>,
    next_seq: AtomicU64,
    slow_calls: AtomicU64,
    drained: Notify,
    state_tx: watch::Sender<SessionState>,
}

/// Removes a call's pending slot when the call finishes or is dropped.
struct PendingSlot<'a> {
    session: &'a Session,
    seq: u64,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        let removed = self.session.lock().pending.remove(&self.seq).is_some();
        if removed {
            self.session.drained.notify_one();
        }
    }
}

impl Session {
    /// Wrap a freshly opened connection and start its reader and monitor tasks.
    ///
    /// The session starts in `Connecting`; the dialer activates it once the
    /// creation hooks have passed.
    pub(crate) fn start(
        config: Arc<EndpointConfig>,
        remote: String,
        reader: Box<dyn FrameReader>,
        writer: Box<dyn FrameWriter>,
    ) -> Arc<Self> {
        let now = Instant::now();
        let (state_tx, _) = watch::channel(SessionState::Connecting);
        let session = Arc::new(Self {
            id: Uuid::new_v4(),
            remote,
            created_at: now,
            config,
            inner: Mutex::new(SessionInner {
                state: SessionState::Connecting,
                last_activity: now,
                pending: HashMap::new(),
                heartbeat: None,
                missed_heartbeats: 0,
            }),
            writer: tokio::sync::Mutex::new(writer),
            next_seq: AtomicU64::new(1),
            slow_calls: AtomicU64::new(0),
            drained: Notify::new(),
            state_tx,
        });

        tokio::spawn(read_loop(session.clone(), reader));
        tokio::spawn(monitor::run(session.clone()));
        session
    }

    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, inner: &mut SessionInner, state: SessionState) {
        inner.state = state;
        self.state_tx.send_replace(state);
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    /// True while the session accepts new calls.
    pub fn is_usable(&self) -> bool {
        self.state() == SessionState::Active
    }

    pub fn in_flight(&self) -> usize {
        self.lock().pending.len()
    }

    pub(crate) fn config(&self) -> &Arc<EndpointConfig> {
        &self.config
    }

    pub(crate) fn created_at(&self) -> Instant {
        self.created_at
    }

    pub(crate) fn last_activity(&self) -> Instant {
        self.lock().last_activity
    }

    pub fn info(&self) -> SessionInfo {
        let inner = self.lock();
        SessionInfo {
            id: self.id,
            remote: self.remote.clone(),
            state: inner.state,
            age: self.created_at.elapsed(),
            idle: inner.last_activity.elapsed(),
            in_flight: inner.pending.len(),
            missed_heartbeats: inner.missed_heartbeats,
            slow_calls: self.slow_calls.load(Ordering::Relaxed),
            tls: self.config.is_tls(),
        }
    }

    /// Follow state transitions as they happen.
    pub fn state_changes(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    /// Resolves once the session is closed.
    pub async fn closed(&self) {
        let mut rx = self.state_tx.subscribe();
        let _ = rx.wait_for(|s| *s == SessionState::Closed).await;
    }

    /// Waits for the session to leave `Connecting` and returns the new state.
    pub(crate) async fn settled(&self) -> SessionState {
        let mut rx = self.state_tx.subscribe();
        let state = match rx.wait_for(|s| *s != SessionState::Connecting).await {
            Ok(state) => *state,
            Err(_) => SessionState::Closed,
        };
        state
    }

    /// Resolves once the session stops accepting calls.
    pub(crate) async fn left_active(&self) {
        let mut rx = self.state_tx.subscribe();
        let _ = rx
            .wait_for(|s| matches!(s, SessionState::Draining | SessionState::Closed))
            .await;
    }

    pub(crate) fn activate(&self) -> bool {
        let mut inner = self.lock();
        if inner.state != SessionState::Connecting {
            return false;
        }
        inner.last_activity = Instant::now();
        self.set_state(&mut inner, SessionState::Active);
        true
    }

    /// Stop accepting calls. Outstanding calls keep running until done or
    /// past their deadline, then the monitor closes the session.
    pub fn begin_drain(&self, reason: &str) -> bool {
        let mut inner = self.lock();
        if inner.state != SessionState::Active {
            return false;
        }
        self.set_state(&mut inner, SessionState::Draining);
        info!(
            "Session {} to {} draining ({} in flight): {}",
            self.id,
            self.remote,
            inner.pending.len(),
            reason
        );
        true
    }

    /// Close the session and fail every call still waiting on it.
    pub(crate) fn close(self: &Arc<Self>, cause: CloseCause) {
        let (pending, heartbeat) = {
            let mut inner = self.lock();
            if inner.state == SessionState::Closed {
                return;
            }
            self.set_state(&mut inner, SessionState::Closed);
            (std::mem::take(&mut inner.pending), inner.heartbeat.take())
        };
        drop(heartbeat);

        info!(
            "Session {} to {} closed ({} call(s) left): {}",
            self.id,
            self.remote,
            pending.len(),
            cause
        );
        for (_, call) in pending {
            let error = self.leftover_error(&cause, &call);
            let _ = call.tx.send(Err(error));
        }
        self.drained.notify_one();
        if !matches!(cause, CloseCause::Rejected(_)) {
            self.config.plugins().session_close(&self.info());
        }

        let session = self.clone();
        tokio::spawn(async move {
            let mut writer = session.writer.lock().await;
            if let Err(e) = writer.shutdown().await {
                debug!("Session {} writer shutdown: {}", session.id, e);
            }
        });
    }

    fn leftover_error(&self, cause: &CloseCause, call: &PendingCall) -> MeshError {
        match cause {
            CloseCause::Lost(reason) | CloseCause::Rejected(reason) => MeshError::ConnectionLost {
                addr: self.remote.clone(),
                message: reason.clone(),
            },
            CloseCause::Drained => MeshError::CallTimeout {
                addr: self.remote.clone(),
                service_method: call.service_method.clone(),
                timeout: call.timeout,
            },
            CloseCause::Forced => MeshError::SessionClosed {
                addr: self.remote.clone(),
            },
        }
    }

    fn unavailable(&self, state: SessionState) -> MeshError {
        match state {
            SessionState::Draining => MeshError::SessionDraining {
                addr: self.remote.clone(),
            },
            _ => MeshError::SessionClosed {
                addr: self.remote.clone(),
            },
        }
    }

    /// Send `message` and wait for its reply, at most `context_age`.
    ///
    /// The message's `seq` is assigned here.
    pub async fn call(self: &Arc<Self>, mut message: Message, context_age: Duration) -> Result<Exchange> {
        let started = Instant::now();
        let deadline = started + context_age;
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        message.seq = seq;

        let (tx, rx) = oneshot::channel();
        {
            let mut inner = self.lock();
            if inner.state != SessionState::Active {
                return Err(self.unavailable(inner.state));
            }
            inner.pending.insert(
                seq,
                PendingCall {
                    tx,
                    deadline,
                    service_method: message.service_method.clone(),
                    timeout: context_age,
                },
            );
        }
        let _slot = PendingSlot { session: self, seq };

        if self.config.print_detail() {
            debug!(
                "-> {} seq={} {} codec={} meta={:?} body={}B",
                self.remote,
                seq,
                message.service_method,
                message.codec_id,
                message.meta,
                message.body.len()
            );
        }

        // The frame goes out whole even if this call gives up; only the
        // reply wait is bounded by the deadline.
        self.send_frame(message.clone());

        let reply = match timeout_at(deadline, rx).await {
            Ok(Ok(result)) => result?,
            Ok(Err(_)) => {
                return Err(MeshError::ConnectionLost {
                    addr: self.remote.clone(),
                    message: "session dropped the call".into(),
                })
            }
            Err(_) => {
                debug!("Call {} seq={} on {} timed out", message.service_method, seq, self.remote);
                return Err(MeshError::CallTimeout {
                    addr: self.remote.clone(),
                    service_method: message.service_method.clone(),
                    timeout: context_age,
                });
            }
        };

        let elapsed = started.elapsed();
        let slow = elapsed > self.config.slow_call_threshold();
        if slow {
            self.slow_calls.fetch_add(1, Ordering::Relaxed);
            warn!(
                "Slow call {} on {}: {:?} (threshold {:?})",
                message.service_method,
                self.remote,
                elapsed,
                self.config.slow_call_threshold()
            );
        }
        Ok(Exchange {
            reply,
            elapsed,
            slow,
        })
    }

    /// Send one heartbeat and wait up to `wait` for its echo.
    ///
    /// `Ok(false)` is a miss. An error means the session is gone. Dropping
    /// the future early leaves the session untouched.
    pub(crate) async fn heartbeat(self: &Arc<Self>, wait: Duration) -> Result<bool> {
        let deadline = Instant::now() + wait;
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut inner = self.lock();
            if inner.state != SessionState::Active {
                return Err(self.unavailable(inner.state));
            }
            inner.heartbeat = Some((seq, tx));
        }
        self.send_frame(Message::heartbeat(seq));

        match timeout_at(deadline, rx).await {
            Ok(Ok(())) => Ok(true),
            Ok(Err(_)) => Err(MeshError::SessionClosed {
                addr: self.remote.clone(),
            }),
            Err(_) => {
                let mut inner = self.lock();
                if inner.heartbeat.as_ref().map(|(s, _)| *s) == Some(seq) {
                    inner.heartbeat = None;
                }
                Ok(false)
            }
        }
    }

    /// Write `message` on its own task so a caller giving up never leaves a
    /// half-written frame behind. A failed write closes the session, which
    /// fails every pending call with `ConnectionLost`.
    fn send_frame(self: &Arc<Self>, message: Message) {
        let session = self.clone();
        tokio::spawn(async move {
            let written = {
                let mut writer = session.writer.lock().await;
                if session.state() == SessionState::Closed {
                    return;
                }
                writer.write_message(&message).await
            };
            if let Err(e) = written {
                warn!(
                    "Write of seq={} to {} failed: {}",
                    message.seq, session.remote, e
                );
                session.close(CloseCause::Lost(e.to_string()));
            }
        });
    }

    /// Count one unanswered heartbeat, returning the consecutive total.
    pub(crate) fn record_miss(&self) -> u32 {
        let mut inner = self.lock();
        inner.missed_heartbeats += 1;
        inner.missed_heartbeats
    }

    /// Wait until no calls are outstanding or the latest deadline has passed,
    /// then close.
    pub(crate) async fn drain(self: &Arc<Self>) {
        loop {
            let latest = {
                let inner = self.lock();
                if inner.state == SessionState::Closed {
                    return;
                }
                inner.pending.values().map(|p| p.deadline).max()
            };
            let Some(deadline) = latest else {
                break;
            };
            tokio::select! {
                _ = self.drained.notified() => continue,
                _ = tokio::time::sleep_until(deadline) => break,
            }
        }
        self.close(CloseCause::Drained);
    }

    fn route(&self, message: Message) {
        if self.config.print_detail() {
            debug!(
                "<- {} seq={} {:?} status={:?} body={}B",
                self.remote,
                message.seq,
                message.kind,
                message.status,
                message.body.len()
            );
        }

        let kind = message.kind;
        let mut inner = self.lock();
        match kind {
            MessageKind::Heartbeat => {
                if inner.heartbeat.as_ref().map(|(seq, _)| *seq) == Some(message.seq) {
                    if let Some((_, tx)) = inner.heartbeat.take() {
                        let _ = tx.send(());
                    }
                    inner.missed_heartbeats = 0;
                    inner.last_activity = Instant::now();
                }
            }
            MessageKind::Reply => match inner.pending.remove(&message.seq) {
                Some(call) => {
                    inner.last_activity = Instant::now();
                    drop(inner);
                    let _ = call.tx.send(Ok(message));
                    self.drained.notify_one();
                }
                None => debug!(
                    "Dropping reply seq={} from {}: no pending call",
                    message.seq, self.remote
                ),
            },
            MessageKind::Call => {
                warn!(
                    "Ignoring inbound call {} from {}: sessions are client-only",
                    message.service_method, self.remote
                );
            }
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .field("state", &self.state())
            .finish()
    }
}

async fn read_loop(session: Arc<Session>, mut reader: Box<dyn FrameReader>) {
    loop {
        let next = tokio::select! {
            next = reader.read_message() => next,
            _ = session.closed() => return,
        };
        match next {
            Ok(Some(message)) => session.route(message),
            Ok(None) => {
                session.close(CloseCause::Lost("connection closed by peer".into()));
                return;
            }
            Err(e) => {
                session.close(CloseCause::Lost(e.to_string()));
                return;
            }
        }
    }
}
