use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use dashmap::DashMap;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use conductor_common::{LoadBalancingMode, ModelRunnerEndpoint};

/// An admissible endpoint presented to the routing strategy.
#[derive(Debug, Clone, Copy)]
pub struct Candidate<'a> {
    pub endpoint: &'a ModelRunnerEndpoint,
    pub in_flight: u32,
}

/// Trait for pluggable load-balancing strategies.
/// The Router filters candidates (active, healthy, spare capacity) in the
/// VMR's configured order, then delegates selection to the strategy.
pub trait RoutingStrategy: Send + Sync {
    /// Select one candidate for a request on `vmr_id`. Returns the index into `candidates`.
    fn select(&self, vmr_id: &str, candidates: &[Candidate]) -> Option<usize>;

    /// Human-readable name for logging / metrics.
    fn name(&self) -> &'static str;
}

/// Map `ticket` into the cumulative weight ranges of `candidates`.
pub fn pick_weighted(candidates: &[Candidate], ticket: u64) -> Option<usize> {
    let total: u64 = candidates.iter().map(|c| c.endpoint.effective_weight()).sum();
    if total == 0 {
        return None;
    }
    let mut point = ticket % total;
    for (i, c) in candidates.iter().enumerate() {
        let weight = c.endpoint.effective_weight();
        if point < weight {
            return Some(i);
        }
        point -= weight;
    }
    None
}

// ---------------------------------------------------------------------------
// WeightedRoundRobin: one rotation counter per VMR
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct WeightedRoundRobin {
    counters: DashMap<String, AtomicU64>,
}

impl WeightedRoundRobin {
    pub fn forget(&self, vmr_id: &str) {
        self.counters.remove(vmr_id);
    }

    fn next_ticket(&self, vmr_id: &str) -> u64 {
        if let Some(counter) = self.counters.get(vmr_id) {
            return counter.fetch_add(1, Ordering::Relaxed);
        }
        self.counters
            .entry(vmr_id.to_string())
            .or_default()
            .fetch_add(1, Ordering::Relaxed)
    }
}

impl RoutingStrategy for WeightedRoundRobin {
    fn select(&self, vmr_id: &str, candidates: &[Candidate]) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        pick_weighted(candidates, self.next_ticket(vmr_id))
    }

    fn name(&self) -> &'static str {
        "round_robin"
    }
}

// ---------------------------------------------------------------------------
// WeightedRandom: uniform draw over total weight
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct WeightedRandom {
    rng: Mutex<StdRng>,
}

impl WeightedRandom {
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl Default for WeightedRandom {
    fn default() -> Self {
        Self::new()
    }
}

impl RoutingStrategy for WeightedRandom {
    fn select(&self, _vmr_id: &str, candidates: &[Candidate]) -> Option<usize> {
        let total: u64 = candidates.iter().map(|c| c.endpoint.effective_weight()).sum();
        if total == 0 {
            return None;
        }
        let ticket = self
            .rng
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .gen_range(0..total);
        pick_weighted(candidates, ticket)
    }

    fn name(&self) -> &'static str {
        "random"
    }
}

// ---------------------------------------------------------------------------
// FirstAvailable: first admissible endpoint in configured order
// ---------------------------------------------------------------------------

pub struct FirstAvailable;

impl RoutingStrategy for FirstAvailable {
    fn select(&self, _vmr_id: &str, candidates: &[Candidate]) -> Option<usize> {
        if candidates.is_empty() {
            None
        } else {
            Some(0)
        }
    }

    fn name(&self) -> &'static str {
        "first_available"
    }
}

/// The strategy instances owned by one router.
#[derive(Debug, Default)]
pub struct Balancer {
    round_robin: WeightedRoundRobin,
    random: WeightedRandom,
}

impl Balancer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_seed(seed: u64) -> Self {
        Self {
            round_robin: WeightedRoundRobin::default(),
            random: WeightedRandom::with_seed(seed),
        }
    }

    pub fn for_mode(&self, mode: LoadBalancingMode) -> &dyn RoutingStrategy {
        match mode {
            LoadBalancingMode::RoundRobin => &self.round_robin,
            LoadBalancingMode::Random => &self.random,
            LoadBalancingMode::FirstAvailable => &FirstAvailable,
        }
    }

    pub fn forget(&self, vmr_id: &str) {
        self.round_robin.forget(vmr_id);
    }
}
