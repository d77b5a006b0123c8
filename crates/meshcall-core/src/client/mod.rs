//! Call dispatcher.
//!
//! [`Client`] turns `(service, method, body)` into a remote call: it picks a
//! candidate through the endpoint's selector, gets a session for it from the
//! pool, runs the call hooks and decodes the reply. Transport and timing
//! failures move on to another candidate until the retry budget is spent.

mod attempts;

pub use attempts::FailedAttempt;

use crate::codec::NIL_CODEC_ID;
use crate::endpoint::EndpointConfig;
use crate::error::{MeshError, Result};
use crate::proto::{self, Message};
use crate::session::{Exchange, SessionInfo, SessionPool, ShutdownReport};
use attempts::Backoff;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Per-call overrides.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    context_age: Option<Duration>,
    codec: Option<String>,
    meta: BTreeMap<String, String>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bound each attempt's round trip by `age` instead of the endpoint's.
    pub fn with_context_age(mut self, age: Duration) -> Self {
        self.context_age = Some(age);
        self
    }

    /// Encode the request with the named codec instead of the endpoint's.
    pub fn with_codec(mut self, name: impl Into<String>) -> Self {
        self.codec = Some(name.into());
        self
    }

    /// Add a metadata entry to the outgoing message.
    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }
}

/// A decoded reply and how it was obtained.
#[derive(Debug, Clone)]
pub struct Reply<T> {
    pub body: T,
    /// Address of the candidate that answered.
    pub served_by: String,
    /// Attempts made, including the successful one.
    pub attempts: u32,
    /// Retryable failures that preceded the success.
    pub failures: Vec<FailedAttempt>,
    /// Time from dispatch to decoded reply.
    pub elapsed: Duration,
    /// The successful round trip exceeded the slow-call threshold.
    pub slow: bool,
}

/// Counters since the client was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ClientStats {
    pub calls: u64,
    pub successes: u64,
    pub failures: u64,
    /// Attempts beyond the first.
    pub retries: u64,
    pub slow_calls: u64,
}

#[derive(Debug, Default)]
struct Counters {
    calls: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    retries: AtomicU64,
    slow_calls: AtomicU64,
}

/// Client half of an endpoint.
///
/// # Example
///
/// ```rust,ignore
/// let client = Client::new(config);
/// let total: u64 = client.call("billing", "charge", &order).await?;
/// client.shutdown(Duration::from_secs(5)).await;
/// ```
#[derive(Debug)]
pub struct Client {
    config: Arc<EndpointConfig>,
    pool: SessionPool,
    counters: Counters,
}

impl Client {
    pub fn new(config: Arc<EndpointConfig>) -> Self {
        Self {
            pool: SessionPool::new(config.clone()),
            config,
            counters: Counters::default(),
        }
    }

    pub fn config(&self) -> &Arc<EndpointConfig> {
        &self.config
    }

    /// Call `service.method` and return the decoded reply body.
    pub async fn call<Req, Resp>(&self, service: &str, method: &str, body: &Req) -> Result<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        self.invoke(service, method, body, CallOptions::default())
            .await
            .map(|reply| reply.body)
    }

    /// Call `service.method` with per-call options and return the full [`Reply`].
    pub async fn invoke<Req, Resp>(
        &self,
        service: &str,
        method: &str,
        body: &Req,
        options: CallOptions,
    ) -> Result<Reply<Resp>>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        if self.pool.is_closed() {
            return Err(MeshError::EndpointClosed);
        }
        self.counters.calls.fetch_add(1, Ordering::Relaxed);

        let started = Instant::now();
        let result = self.dispatch(service, method, body, &options, started).await;
        match &result {
            Ok(reply) => {
                self.counters.successes.fetch_add(1, Ordering::Relaxed);
                if reply.slow {
                    self.counters.slow_calls.fetch_add(1, Ordering::Relaxed);
                }
            }
            Err(_) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
            }
        }

        if self.config.count_time() {
            match &result {
                Ok(reply) => info!(
                    "Call {}.{} served by {} in {:?} ({} attempt(s))",
                    service, method, reply.served_by, reply.elapsed, reply.attempts
                ),
                Err(e) => info!(
                    "Call {}.{} failed after {:?}: {}",
                    service,
                    method,
                    started.elapsed(),
                    e
                ),
            }
        }
        result
    }

    async fn dispatch<Req, Resp>(
        &self,
        service: &str,
        method: &str,
        body: &Req,
        options: &CallOptions,
        started: Instant,
    ) -> Result<Reply<Resp>>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let aborted = |attempts: u32, source: MeshError| MeshError::CallAborted {
            service: service.to_string(),
            method: method.to_string(),
            attempts,
            source: Box::new(source),
        };

        let codecs = self.config.codecs();
        let codec_id = match &options.codec {
            Some(name) => codecs.get_by_name(name).map_err(|e| aborted(0, e))?.id(),
            None => self.config.body_codec_id(),
        };
        let payload = codecs.marshal(codec_id, body).map_err(|e| aborted(0, e))?;

        let service_method = proto::service_method(service, method);
        let context_age = options.context_age.unwrap_or(self.config.context_age());
        let retry_times = self.config.retry_times();
        let backoff = self.config.retry_backoff().map(Backoff::new);
        let selector = self.config.selector();

        let mut exclude = HashSet::new();
        let mut failures = Vec::new();
        let mut last_error: Option<MeshError> = None;
        let mut attempts = 0u32;

        while attempts <= retry_times {
            if attempts > 0 {
                if let Some(backoff) = &backoff {
                    let delay = backoff.delay(attempts - 1);
                    debug!("Backing off {:?} before retrying {}", delay, service_method);
                    tokio::time::sleep(delay).await;
                }
            }

            let candidate = match selector.pick(service, &exclude).await {
                Ok(candidate) => candidate,
                Err(MeshError::NoAvailableCandidate { .. }) => {
                    return Err(MeshError::ServiceUnavailable {
                        service: service.to_string(),
                        method: method.to_string(),
                        attempts,
                        last: last_error.map(Box::new),
                    });
                }
                Err(e) => return Err(aborted(attempts + 1, e)),
            };

            let attempt_started = Instant::now();
            let outcome = self
                .attempt(
                    &candidate.addr,
                    &service_method,
                    codec_id,
                    &payload,
                    &options.meta,
                    context_age,
                )
                .await;
            if self.config.count_time() {
                let spent = attempt_started.elapsed();
                match &outcome {
                    Ok(exchange) => info!(
                        "Attempt {}/{} of {} on {}: ok in {:?} (round trip {:?})",
                        attempts + 1,
                        retry_times + 1,
                        service_method,
                        candidate.addr,
                        spent,
                        exchange.elapsed
                    ),
                    Err(e) => info!(
                        "Attempt {}/{} of {} on {}: failed in {:?}: {}",
                        attempts + 1,
                        retry_times + 1,
                        service_method,
                        candidate.addr,
                        spent,
                        e
                    ),
                }
            }
            match outcome {
                Ok(exchange) => {
                    selector.report(&candidate.addr, true);
                    attempts += 1;
                    let reply_codec = match exchange.reply.codec_id {
                        NIL_CODEC_ID => codec_id,
                        id => id,
                    };
                    let body = codecs
                        .unmarshal(reply_codec, &exchange.reply.body)
                        .map_err(|e| aborted(attempts, e))?;
                    if !failures.is_empty() {
                        debug!(
                            "Call {} succeeded on {} after {} failure(s)",
                            service_method,
                            candidate.addr,
                            failures.len()
                        );
                    }
                    return Ok(Reply {
                        body,
                        served_by: candidate.addr,
                        attempts,
                        failures,
                        elapsed: started.elapsed(),
                        slow: exchange.slow,
                    });
                }
                Err(e) if e.is_retryable() => {
                    selector.report(&candidate.addr, false);
                    attempts += 1;
                    warn!(
                        "Attempt {}/{} of {} on {} failed: {}",
                        attempts,
                        retry_times + 1,
                        service_method,
                        candidate.addr,
                        e
                    );
                    failures.push(FailedAttempt::new(&candidate.addr, &e));
                    exclude.insert(candidate.addr);
                    if attempts <= retry_times {
                        self.counters.retries.fetch_add(1, Ordering::Relaxed);
                    }
                    last_error = Some(e);
                }
                Err(e) => {
                    // The remote answered, so the candidate itself is fine.
                    if matches!(e, MeshError::ApplicationError { .. }) {
                        selector.report(&candidate.addr, true);
                    }
                    return Err(aborted(attempts + 1, e));
                }
            }
        }

        let source = last_error.unwrap_or_else(|| MeshError::NoAvailableCandidate {
            service: service.to_string(),
        });
        Err(MeshError::RetriesExhausted {
            service: service.to_string(),
            method: method.to_string(),
            attempts,
            source: Box::new(source),
        })
    }

    /// One round trip against one candidate.
    async fn attempt(
        &self,
        addr: &str,
        service_method: &str,
        codec_id: u8,
        payload: &[u8],
        meta: &BTreeMap<String, String>,
        context_age: Duration,
    ) -> Result<Exchange> {
        let session = self.pool.acquire(addr).await?;

        let mut message = Message::call(0, service_method, codec_id, payload.to_vec());
        message
            .meta
            .extend(meta.iter().map(|(k, v)| (k.clone(), v.clone())));
        self.config.plugins().before_write(&mut message)?;

        let mut exchange = session.call(message, context_age).await?;
        self.config.plugins().after_read(&mut exchange.reply)?;
        if let Some(status) = exchange.reply.error_status() {
            return Err(MeshError::ApplicationError {
                code: status.code,
                message: status.message.clone(),
            });
        }
        Ok(exchange)
    }

    pub fn stats(&self) -> ClientStats {
        ClientStats {
            calls: self.counters.calls.load(Ordering::Relaxed),
            successes: self.counters.successes.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            retries: self.counters.retries.load(Ordering::Relaxed),
            slow_calls: self.counters.slow_calls.load(Ordering::Relaxed),
        }
    }

    /// Snapshot of the pooled sessions.
    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.pool.sessions()
    }

    /// Stop accepting calls, drain the sessions and close whatever is left
    /// after `timeout`.
    pub async fn shutdown(&self, timeout: Duration) -> ShutdownReport {
        info!("Client shutting down (bound {:?})", timeout);
        self.pool.shutdown(timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{options, EndpointBuilder};
    use crate::selector::{Candidate, MemoryRegistry};

    fn client(registry: Arc<MemoryRegistry>) -> Client {
        let config = EndpointBuilder::new()
            .with(options::registry(registry))
            .with(options::registry_wait(Duration::from_millis(50)))
            .build()
            .unwrap();
        Client::new(config)
    }

    #[test]
    fn test_call_options_accumulate() {
        let options = CallOptions::new()
            .with_context_age(Duration::from_millis(10))
            .with_codec("plain")
            .with_meta("trace", "abc")
            .with_meta("tenant", "7");
        assert_eq!(options.context_age, Some(Duration::from_millis(10)));
        assert_eq!(options.codec.as_deref(), Some("plain"));
        assert_eq!(options.meta.len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_codec_aborts_before_any_attempt() {
        let registry = Arc::new(MemoryRegistry::new());
        registry.set("svc", vec![Candidate::new("127.0.0.1:1")]);
        let client = client(registry);

        let err = client
            .invoke::<_, serde_json::Value>("svc", "m", &1, CallOptions::new().with_codec("xml"))
            .await
            .unwrap_err();
        assert_eq!(err.attempts(), Some(0));
        assert!(matches!(err.cause(), MeshError::CodecNotFound(_)));
        assert_eq!(client.stats().failures, 1);
    }

    #[tokio::test]
    async fn test_closed_client_rejects_calls() {
        let client = client(Arc::new(MemoryRegistry::new()));
        let report = client.shutdown(Duration::from_millis(10)).await;
        assert_eq!(report.sessions, 0);

        let err = client
            .call::<_, serde_json::Value>("svc", "m", &1)
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::EndpointClosed));
        assert_eq!(client.stats().calls, 0);
    }
}
