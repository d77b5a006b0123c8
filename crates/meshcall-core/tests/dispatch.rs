//! End-to-end call dispatch against in-process responders.

mod common;

use common::{unreachable_addr, Behavior, Responder};
use meshcall_core::plugin::{CallObserver, HookResult, Plugin};
use meshcall_core::{
    options, CallOptions, Candidate, Client, EndpointBuilder, EndpointOption, MemoryRegistry,
    Message, MeshError, RegistrySelector, Strategy,
};
use serde_json::{json, Value};
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Always picks the candidate with the lowest `rank` metadata.
struct Ranked;

impl Strategy for Ranked {
    fn name(&self) -> &str {
        "ranked"
    }

    fn choose(&self, _service: &str, candidates: &[Candidate]) -> Option<usize> {
        candidates
            .iter()
            .enumerate()
            .min_by_key(|(_, c)| {
                c.metadata
                    .get("rank")
                    .and_then(|r| r.parse::<u32>().ok())
                    .unwrap_or(u32::MAX)
            })
            .map(|(i, _)| i)
    }
}

fn ranked(addr: &str, rank: u32) -> Candidate {
    Candidate::new(addr).with_metadata("rank", rank.to_string())
}

fn client_with(registry: Arc<MemoryRegistry>, extra: Vec<EndpointOption>) -> Client {
    let config = EndpointBuilder::new()
        .with(options::registry(registry))
        .with(options::registry_wait(Duration::from_millis(200)))
        .with(options::dial_timeout(Duration::from_secs(1)))
        .with_all(extra)
        .build()
        .unwrap();
    Client::new(config)
}

#[tokio::test]
async fn test_call_echoes_body() {
    let responder = Responder::start(Behavior::echo()).await;
    let registry = Arc::new(MemoryRegistry::new());
    registry.set("echo", vec![Candidate::new(responder.addr())]);
    let client = client_with(registry, Vec::new());

    let reply: Value = client
        .call("echo", "say", &json!({"text": "hi", "n": 3}))
        .await
        .unwrap();
    assert_eq!(reply, json!({"text": "hi", "n": 3}));

    let sessions = client.sessions();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].remote, responder.addr());
    assert_eq!(client.stats().successes, 1);
}

#[tokio::test]
async fn test_retries_move_to_next_candidate() {
    let responder = Responder::start(Behavior::echo()).await;
    let first = unreachable_addr().await;
    let second = unreachable_addr().await;

    let registry = Arc::new(MemoryRegistry::new());
    registry.set(
        "billing",
        vec![
            ranked(&first, 0),
            ranked(&second, 1),
            ranked(responder.addr(), 2),
        ],
    );
    let client = client_with(
        registry,
        vec![
            options::retry_times(2),
            options::selector(Arc::new(RegistrySelector::new(Ranked))),
        ],
    );

    let reply = client
        .invoke::<_, Value>("billing", "charge", &json!(42), CallOptions::new())
        .await
        .unwrap();
    assert_eq!(reply.body, json!(42));
    assert_eq!(reply.served_by, responder.addr());
    assert_eq!(reply.attempts, 3);
    assert_eq!(reply.failures.len(), 2);
    assert_eq!(reply.failures[0].addr, first);
    assert_eq!(reply.failures[1].addr, second);
    assert_eq!(client.stats().retries, 2);
}

#[tokio::test]
async fn test_retry_budget_exhausted() {
    let registry = Arc::new(MemoryRegistry::new());
    registry.set(
        "billing",
        vec![
            Candidate::new(unreachable_addr().await),
            Candidate::new(unreachable_addr().await),
            Candidate::new(unreachable_addr().await),
        ],
    );
    let client = client_with(registry, vec![options::retry_times(1)]);

    let err = client
        .call::<_, Value>("billing", "charge", &1)
        .await
        .unwrap_err();
    assert!(matches!(err, MeshError::RetriesExhausted { attempts: 2, .. }), "{err}");
    assert!(matches!(err.cause(), MeshError::ConnectionLost { .. }));
}

/// Collects formatted log output for assertions.
#[derive(Clone, Default)]
struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl LogBuffer {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn test_count_time_logs_each_attempt() {
    let logs = LogBuffer::default();
    let writer = logs.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .with_max_level(tracing::Level::INFO)
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let responder = Responder::start(Behavior::echo()).await;
    let dead = unreachable_addr().await;
    let registry = Arc::new(MemoryRegistry::new());
    registry.set("billing", vec![ranked(&dead, 0), ranked(responder.addr(), 1)]);
    let client = client_with(
        registry,
        vec![
            options::retry_times(2),
            options::count_time(true),
            options::selector(Arc::new(RegistrySelector::new(Ranked))),
        ],
    );

    let reply = client
        .invoke::<_, Value>("billing", "charge", &5, CallOptions::new())
        .await
        .unwrap();
    assert_eq!(reply.attempts, 2);

    let output = logs.contents();
    let timed: Vec<&str> = output
        .lines()
        .filter(|l| l.contains("INFO") && l.contains("Attempt "))
        .collect();
    assert_eq!(timed.len(), 2, "{output}");
    assert!(timed[0].contains("Attempt 1/3"), "{output}");
    assert!(timed[0].contains(&dead), "{output}");
    assert!(timed[0].contains("failed in"), "{output}");
    assert!(timed[1].contains("Attempt 2/3"), "{output}");
    assert!(timed[1].contains(responder.addr()), "{output}");
    assert!(timed[1].contains("ok in"), "{output}");
}

#[tokio::test]
async fn test_every_candidate_excluded_is_unavailable() {
    let registry = Arc::new(MemoryRegistry::new());
    registry.set("billing", vec![Candidate::new(unreachable_addr().await)]);
    let client = client_with(registry, vec![options::retry_times(3)]);

    let err = client
        .call::<_, Value>("billing", "charge", &1)
        .await
        .unwrap_err();
    match err {
        MeshError::ServiceUnavailable { attempts, last, .. } => {
            assert_eq!(attempts, 1);
            assert!(matches!(last.as_deref(), Some(MeshError::ConnectionLost { .. })));
        }
        other => panic!("expected ServiceUnavailable, got {other}"),
    }
}

#[tokio::test]
async fn test_zero_candidates_fails_fast() {
    let registry = Arc::new(MemoryRegistry::new());
    registry.set("ghost", Vec::new());
    let client = client_with(registry, Vec::new());

    let started = Instant::now();
    let err = client.call::<_, Value>("ghost", "boo", &1).await.unwrap_err();
    assert!(matches!(err, MeshError::ServiceUnavailable { attempts: 0, .. }), "{err}");
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn test_context_age_bounds_slow_call() {
    let responder = Responder::start(Behavior::delayed(Duration::from_millis(200))).await;
    let registry = Arc::new(MemoryRegistry::new());
    registry.set("slow", vec![Candidate::new(responder.addr())]);
    let client = client_with(registry, vec![options::retry_times(0)]);

    // Warm the session so the measured time is the call alone.
    client
        .invoke::<_, Value>(
            "slow",
            "warm",
            &1,
            CallOptions::new().with_context_age(Duration::from_secs(2)),
        )
        .await
        .unwrap();

    let started = Instant::now();
    let err = client
        .invoke::<_, Value>(
            "slow",
            "work",
            &1,
            CallOptions::new().with_context_age(Duration::from_millis(50)),
        )
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err.cause(), MeshError::CallTimeout { .. }), "{err}");
    assert!(elapsed >= Duration::from_millis(45), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(150), "{elapsed:?}");
}

#[tokio::test]
async fn test_application_error_is_not_retried() {
    let failing = Responder::start(Behavior::failing(404, "no such method")).await;
    let registry = Arc::new(MemoryRegistry::new());
    registry.set("billing", vec![Candidate::new(failing.addr())]);
    let client = client_with(registry, vec![options::retry_times(3)]);

    let err = client
        .call::<_, Value>("billing", "refund", &1)
        .await
        .unwrap_err();
    assert_eq!(err.attempts(), Some(1));
    match err.cause() {
        MeshError::ApplicationError { code, message } => {
            assert_eq!(*code, 404);
            assert_eq!(message, "no such method");
        }
        other => panic!("expected ApplicationError, got {other}"),
    }
    assert_eq!(failing.calls(), 1);
}

struct Gatekeeper;

impl Plugin for Gatekeeper {
    fn name(&self) -> &str {
        "gatekeeper"
    }

    fn as_call_observer(&self) -> Option<&dyn CallObserver> {
        Some(self)
    }
}

impl CallObserver for Gatekeeper {
    fn before_write(&self, message: &mut Message) -> HookResult {
        if message.meta.contains_key("token") {
            Ok(())
        } else {
            Err("missing token".into())
        }
    }
}

#[tokio::test]
async fn test_hook_abort_is_not_retried() {
    let responder = Responder::start(Behavior::echo()).await;
    let registry = Arc::new(MemoryRegistry::new());
    registry.set("billing", vec![Candidate::new(responder.addr())]);
    let client = client_with(
        registry,
        vec![
            options::retry_times(3),
            options::plugins(vec![Arc::new(Gatekeeper) as Arc<dyn Plugin>]),
        ],
    );

    let err = client
        .call::<_, Value>("billing", "charge", &1)
        .await
        .unwrap_err();
    assert_eq!(err.attempts(), Some(1));
    assert!(matches!(err.cause(), MeshError::HookAborted { .. }), "{err}");
    assert_eq!(responder.calls(), 0);

    let reply: Value = client
        .invoke("billing", "charge", &1, CallOptions::new().with_meta("token", "t"))
        .await
        .map(|r| r.body)
        .unwrap();
    assert_eq!(reply, json!(1));
    assert_eq!(responder.calls(), 1);
}

#[tokio::test]
async fn test_codec_override_round_trips_text() {
    let responder = Responder::start(Behavior::echo()).await;
    let registry = Arc::new(MemoryRegistry::new());
    registry.set("echo", vec![Candidate::new(responder.addr())]);
    let client = client_with(registry, Vec::new());

    let reply: String = client
        .invoke("echo", "say", "plain words", CallOptions::new().with_codec("plain"))
        .await
        .map(|r| r.body)
        .unwrap();
    assert_eq!(reply, "plain words");
}

#[tokio::test]
async fn test_shutdown_lets_in_flight_call_finish() {
    let responder = Responder::start(Behavior::delayed(Duration::from_millis(200))).await;
    let registry = Arc::new(MemoryRegistry::new());
    registry.set("slow", vec![Candidate::new(responder.addr())]);
    let client = Arc::new(client_with(registry, Vec::new()));

    let caller = client.clone();
    let in_flight =
        tokio::spawn(async move { caller.call::<_, Value>("slow", "work", &7).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let report = client.shutdown(Duration::from_secs(2)).await;
    assert_eq!(report.sessions, 1);
    assert_eq!(report.drained, 1);
    assert_eq!(report.forced, 0);
    assert_eq!(in_flight.await.unwrap().unwrap(), json!(7));

    let err = client.call::<_, Value>("slow", "work", &7).await.unwrap_err();
    assert!(matches!(err, MeshError::EndpointClosed));
}

#[tokio::test]
async fn test_shutdown_bound_forces_close() {
    let responder = Responder::start(Behavior::delayed(Duration::from_secs(5))).await;
    let registry = Arc::new(MemoryRegistry::new());
    registry.set("stuck", vec![Candidate::new(responder.addr())]);
    let client = Arc::new(client_with(
        registry,
        vec![options::context_age(Duration::from_secs(10))],
    ));

    let caller = client.clone();
    let in_flight =
        tokio::spawn(async move { caller.call::<_, Value>("stuck", "work", &7).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = Instant::now();
    let report = client.shutdown(Duration::from_millis(100)).await;
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(report.forced, 1);
    assert_eq!(report.abandoned_calls, 1);
    assert!(in_flight.await.unwrap().is_err());
}
