//! Service discovery and candidate selection.
//!
//! A [`Registry`] publishes full candidate snapshots per service name. A
//! [`Selector`] consumes those snapshots and picks one candidate per call
//! attempt, skipping addresses the dispatcher has already excluded.

mod health;
mod memory;
mod registry_selector;
mod strategy;

pub use health::{HealthState, HealthTracker};
pub use memory::MemoryRegistry;
pub use registry_selector::RegistrySelector;
pub use strategy::{RoundRobin, Strategy, WeightedRandom};

use crate::error::Result;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

fn default_weight() -> u32 {
    1
}

/// One reachable instance of a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub addr: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

impl Candidate {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            metadata: BTreeMap::new(),
            weight: default_weight(),
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// A candidate announced under a service name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub service: String,
    pub candidate: Candidate,
}

impl ServiceInstance {
    pub fn new(service: impl Into<String>, candidate: Candidate) -> Self {
        Self {
            service: service.into(),
            candidate,
        }
    }
}

/// Discovery backend.
///
/// `watch` yields the full candidate list for a service, first the current
/// state and then one item per change. It is consumed by background tasks,
/// never on the call path.
#[async_trait::async_trait]
pub trait Registry: Send + Sync + 'static {
    async fn register(&self, instance: ServiceInstance) -> Result<()>;

    async fn deregister(&self, instance: &ServiceInstance) -> Result<()>;

    fn watch(&self, service: &str) -> BoxStream<'static, Vec<Candidate>>;
}

/// What an endpoint hands its selector at build time.
#[derive(Clone)]
pub struct SelectorInit {
    pub registry: Arc<dyn Registry>,
    /// Bound on how long a pick waits for a service's first snapshot.
    pub registry_wait: Duration,
    /// How long a failed candidate stays deprioritized.
    pub unhealthy_cooldown: Duration,
}

/// Load-balancing component fed by a registry.
#[async_trait::async_trait]
pub trait Selector: Send + Sync + 'static {
    /// Attach the registry. Called once by the endpoint builder.
    fn init(&self, init: SelectorInit);

    /// Pick one candidate for `service` whose address is not in `exclude`.
    ///
    /// Fails with [`MeshError::NoAvailableCandidate`](crate::MeshError::NoAvailableCandidate)
    /// when nothing is left.
    async fn pick(&self, service: &str, exclude: &HashSet<String>) -> Result<Candidate>;

    /// Feed back the outcome of an attempt against `addr`.
    fn report(&self, addr: &str, ok: bool);
}
