use super::{Candidate, HealthTracker, RoundRobin, Selector, SelectorInit, Strategy};
use crate::error::{MeshError, Result};
use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

type Snapshot = Arc<Vec<Candidate>>;

struct ServiceWatch {
    snapshot: watch::Receiver<Option<Snapshot>>,
    task: JoinHandle<()>,
}

/// Selector backed by registry watch streams.
///
/// The first pick for a service spawns one background task that follows the
/// registry's snapshots for it. Each new snapshot replaces the previous one
/// whole, so a pick sees either the old list or the new one. Picks prefer
/// candidates outside their failure cool-down and fall back to the rest.
/// Candidates that leave a snapshot lose their health entry, and a service
/// whose snapshot empties loses its strategy state.
pub struct RegistrySelector<S: Strategy = RoundRobin> {
    strategy: Arc<S>,
    init: RwLock<Option<SelectorInit>>,
    services: Mutex<HashMap<String, ServiceWatch>>,
    health: Arc<HealthTracker>,
}

impl Default for RegistrySelector<RoundRobin> {
    fn default() -> Self {
        Self::new(RoundRobin::new())
    }
}

impl<S: Strategy> RegistrySelector<S> {
    pub fn new(strategy: S) -> Self {
        Self {
            strategy: Arc::new(strategy),
            init: RwLock::new(None),
            services: Mutex::new(HashMap::new()),
            health: Arc::new(HealthTracker::default()),
        }
    }

    pub fn strategy(&self) -> &S {
        &self.strategy
    }

    pub fn health(&self) -> &HealthTracker {
        &self.health
    }

    /// Number of services with a running watch.
    pub fn watched_services(&self) -> usize {
        self.services.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn subscribe(&self, service: &str) -> Result<(Duration, watch::Receiver<Option<Snapshot>>)> {
        let init = self
            .init
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| MeshError::config("selector has no registry attached"))?;

        let mut services = self.services.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = services.get(service) {
            return Ok((init.registry_wait, existing.snapshot.clone()));
        }

        let (tx, rx) = watch::channel(None);
        let mut updates = init.registry.watch(service);
        let name = service.to_string();
        let strategy = self.strategy.clone();
        let health = self.health.clone();
        let task = tokio::spawn(async move {
            let mut known: HashSet<String> = HashSet::new();
            while let Some(mut candidates) = updates.next().await {
                candidates.sort_by(|a, b| a.addr.cmp(&b.addr));
                debug!("Service {} snapshot: {} candidate(s)", name, candidates.len());

                let current: HashSet<String> = candidates.iter().map(|c| c.addr.clone()).collect();
                health.forget(known.difference(&current).map(String::as_str));
                if current.is_empty() {
                    strategy.forget(&name);
                }
                known = current;

                tx.send_replace(Some(Arc::new(candidates)));
            }
            debug!("Registry watch for {} ended", name);
        });

        info!("Watching registry for service {}", service);
        services.insert(
            service.to_string(),
            ServiceWatch {
                snapshot: rx.clone(),
                task,
            },
        );
        Ok((init.registry_wait, rx))
    }
}

impl<S: Strategy> Drop for RegistrySelector<S> {
    fn drop(&mut self) {
        let services = self.services.get_mut().unwrap_or_else(|e| e.into_inner());
        for (_, watch) in services.drain() {
            watch.task.abort();
        }
    }
}

#[async_trait::async_trait]
impl<S: Strategy> Selector for RegistrySelector<S> {
    fn init(&self, init: SelectorInit) {
        self.health.set_cooldown(init.unhealthy_cooldown);
        *self.init.write().unwrap_or_else(|e| e.into_inner()) = Some(init);
    }

    async fn pick(&self, service: &str, exclude: &HashSet<String>) -> Result<Candidate> {
        let (registry_wait, mut rx) = self.subscribe(service)?;

        let waiting = rx.borrow().is_none();
        if waiting {
            let arrived = tokio::time::timeout(registry_wait, rx.wait_for(|s| s.is_some()))
                .await
                .map(|r| r.is_ok())
                .unwrap_or(false);
            if !arrived {
                debug!(
                    "No snapshot for {} within {:?}, treating as empty",
                    service, registry_wait
                );
            }
        }

        let snapshot = rx.borrow().clone();
        let available = snapshot
            .iter()
            .flat_map(|list| list.iter())
            .filter(|c| !exclude.contains(&c.addr))
            .cloned();
        let (preferred, cooling): (Vec<_>, Vec<_>) =
            available.partition(|c| self.health.is_preferred(&c.addr));
        let mut pool = if preferred.is_empty() { cooling } else { preferred };

        match self.strategy.choose(service, &pool) {
            Some(index) if index < pool.len() => Ok(pool.swap_remove(index)),
            _ => Err(MeshError::NoAvailableCandidate {
                service: service.to_string(),
            }),
        }
    }

    fn report(&self, addr: &str, ok: bool) {
        if ok {
            self.health.record_success(addr);
        } else {
            self.health.record_failure(addr);
        }
    }
}

impl<S: Strategy> std::fmt::Debug for RegistrySelector<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistrySelector")
            .field("strategy", &self.strategy.name())
            .field("services", &self.watched_services())
            .finish()
    }
}
