//! Per-session lifetime task.
//!
//! One task per session owns both timers: the age limit and the heartbeat.
//! When either retires the session, or someone else starts a drain, the same
//! task waits out the outstanding calls and closes it.

use super::{Session, SessionState};
use std::sync::Arc;
use tokio::time::sleep_until;
use tracing::{debug, warn};

pub(crate) async fn run(session: Arc<Session>) {
    if session.settled().await == SessionState::Closed {
        return;
    }

    let config = session.config().clone();
    let age_deadline = session.created_at() + config.session_age();
    let interval = config.heartbeat_interval();
    let threshold = config.heartbeat_miss_threshold().max(1);

    loop {
        let next_beat = session.last_activity() + interval;
        tokio::select! {
            _ = sleep_until(age_deadline) => {
                session.begin_drain("session age exceeded");
                break;
            }
            _ = sleep_until(next_beat), if !interval.is_zero() => {
                if session.last_activity().elapsed() < interval {
                    continue;
                }
                // The age limit still applies while the echo is outstanding.
                let answered = tokio::select! {
                    answered = session.heartbeat(interval) => answered,
                    _ = sleep_until(age_deadline) => {
                        session.begin_drain("session age exceeded");
                        break;
                    }
                    _ = session.left_active() => break,
                };
                match answered {
                    Ok(true) => {}
                    Ok(false) => {
                        let missed = session.record_miss();
                        warn!(
                            "Session {} to {} missed heartbeat {}/{}",
                            session.id(),
                            session.remote(),
                            missed,
                            threshold
                        );
                        if missed >= threshold {
                            session.begin_drain("heartbeats unanswered");
                            break;
                        }
                    }
                    Err(e) => {
                        debug!("Heartbeat on session {} stopped: {}", session.id(), e);
                        break;
                    }
                }
            }
            _ = session.left_active() => break,
        }
    }

    session.drain().await;
}
