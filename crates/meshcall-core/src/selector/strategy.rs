//! Load-balancing policies.

use super::Candidate;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::sync::Mutex;

/// Chooses one entry from a non-empty, address-sorted candidate slice.
pub trait Strategy: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Index into `candidates`, or `None` if the slice is empty.
    fn choose(&self, service: &str, candidates: &[Candidate]) -> Option<usize>;

    /// `service` has no candidates left; drop any state kept for it.
    fn forget(&self, _service: &str) {}
}

/// Rotates through candidates, one cursor per service.
#[derive(Debug, Default)]
pub struct RoundRobin {
    cursors: Mutex<HashMap<String, usize>>,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Strategy for RoundRobin {
    fn name(&self) -> &str {
        "round-robin"
    }

    fn choose(&self, service: &str, candidates: &[Candidate]) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        let mut cursors = self.cursors.lock().unwrap_or_else(|e| e.into_inner());
        let cursor = cursors.entry(service.to_string()).or_insert(0);
        let index = *cursor % candidates.len();
        *cursor = cursor.wrapping_add(1);
        Some(index)
    }

    fn forget(&self, service: &str) {
        self.cursors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(service);
    }
}

/// Picks proportionally to candidate weight.
///
/// When every weight is zero the pick is uniform.
#[derive(Debug)]
pub struct WeightedRandom {
    rng: Mutex<StdRng>,
}

impl Default for WeightedRandom {
    fn default() -> Self {
        Self::new()
    }
}

impl WeightedRandom {
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_rng(&mut rand::rng())),
        }
    }

    /// Reproducible sequence of picks.
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl Strategy for WeightedRandom {
    fn name(&self) -> &str {
        "weighted-random"
    }

    fn choose(&self, _service: &str, candidates: &[Candidate]) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        let total: u64 = candidates.iter().map(|c| u64::from(c.weight)).sum();
        if total == 0 {
            return Some(rng.random_range(0..candidates.len()));
        }

        let mut point = rng.random_range(0..total);
        for (index, candidate) in candidates.iter().enumerate() {
            let weight = u64::from(candidate.weight);
            if point < weight {
                return Some(index);
            }
            point -= weight;
        }
        Some(candidates.len() - 1)
    }
}
