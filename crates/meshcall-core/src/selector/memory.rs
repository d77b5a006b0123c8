use super::{Candidate, Registry, ServiceInstance};
use crate::error::Result;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::watch;
use tracing::debug;

/// In-process registry backend.
///
/// Each service has a `watch` channel holding its current candidate list,
/// kept sorted by address. Watching a service that was never registered
/// yields an empty snapshot immediately.
#[derive(Default)]
pub struct MemoryRegistry {
    services: Mutex<HashMap<String, watch::Sender<Vec<Candidate>>>>,
}

impl std::fmt::Debug for MemoryRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRegistry")
            .field("services", &self.services().len())
            .finish()
    }
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn channel(&self, service: &str) -> watch::Sender<Vec<Candidate>> {
        let mut services = self.services.lock().unwrap_or_else(|e| e.into_inner());
        services
            .entry(service.to_string())
            .or_insert_with(|| watch::channel(Vec::new()).0)
            .clone()
    }

    /// Replace the whole candidate list for a service.
    pub fn set(&self, service: &str, mut candidates: Vec<Candidate>) {
        candidates.sort_by(|a, b| a.addr.cmp(&b.addr));
        candidates.dedup_by(|a, b| a.addr == b.addr);
        debug!("Registry snapshot for {}: {} candidate(s)", service, candidates.len());
        self.channel(service).send_replace(candidates);
    }

    /// Current candidates for a service.
    pub fn candidates(&self, service: &str) -> Vec<Candidate> {
        self.channel(service).borrow().clone()
    }

    /// Names of services with at least one candidate, sorted.
    pub fn services(&self) -> Vec<String> {
        let services = self.services.lock().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<String> = services
            .iter()
            .filter(|(_, tx)| !tx.borrow().is_empty())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }
}

#[async_trait::async_trait]
impl Registry for MemoryRegistry {
    async fn register(&self, instance: ServiceInstance) -> Result<()> {
        let ServiceInstance { service, candidate } = instance;
        debug!("Registering {} for service {}", candidate.addr, service);
        self.channel(&service).send_modify(|list| {
            list.retain(|c| c.addr != candidate.addr);
            list.push(candidate);
            list.sort_by(|a, b| a.addr.cmp(&b.addr));
        });
        Ok(())
    }

    async fn deregister(&self, instance: &ServiceInstance) -> Result<()> {
        debug!(
            "Deregistering {} from service {}",
            instance.candidate.addr, instance.service
        );
        self.channel(&instance.service)
            .send_if_modified(|list| {
                let before = list.len();
                list.retain(|c| c.addr != instance.candidate.addr);
                list.len() != before
            });
        Ok(())
    }

    fn watch(&self, service: &str) -> BoxStream<'static, Vec<Candidate>> {
        let rx = self.channel(service).subscribe();
        stream::unfold((rx, true), |(mut rx, first)| async move {
            if !first && rx.changed().await.is_err() {
                return None;
            }
            let snapshot = rx.borrow_and_update().clone();
            Some((snapshot, (rx, false)))
        })
        .boxed()
    }
}
