//! Load balancing strategies

use crate::endpoint::Endpoint;
use crate::registry::{ServiceEntry, ServiceRegistry};
use metrics::counter;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};
use waypoint_core::{telemetry, GatewayError, GatewayResult, LoadBalanceStrategy};

/// Source of uniform draws in `[0, 1)`
pub trait RandomSource: Send + Sync {
    fn next_f64(&self) -> f64;
}

/// Thread-local RNG, used in production
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadRandom;

impl RandomSource for ThreadRandom {
    fn next_f64(&self) -> f64 {
        rand::thread_rng().gen::<f64>()
    }
}

/// Deterministic RNG for reproducible selection sequences
#[derive(Debug)]
pub struct SeededRandom {
    rng: Mutex<StdRng>,
}

impl SeededRandom {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl RandomSource for SeededRandom {
    fn next_f64(&self) -> f64 {
        match self.rng.lock() {
            Ok(mut rng) => rng.gen::<f64>(),
            Err(poisoned) => poisoned.into_inner().gen::<f64>(),
        }
    }
}

/// Pick an index with probability proportional to its weight.
///
/// `draw` is a uniform sample in `[0, 1)`, scaled to `[0, total)`. Weights
/// are subtracted in order and the first endpoint that brings the remainder
/// to zero or below wins. Zero weights are never picked. Returns `None` when
/// every weight is zero.
pub fn pick_weighted(weights: &[u32], draw: f64) -> Option<usize> {
    let total: u64 = weights.iter().map(|w| *w as u64).sum();
    if total == 0 {
        return None;
    }

    let mut point = draw.clamp(0.0, 1.0) * total as f64;
    let mut last_positive = None;
    for (index, weight) in weights.iter().enumerate() {
        if *weight == 0 {
            continue;
        }
        if point <= *weight as f64 {
            return Some(index);
        }
        point -= *weight as f64;
        last_positive = Some(index);
    }

    // Only reachable through float rounding at the upper edge
    last_positive
}

/// Virtual nodes each endpoint places on the hash ring
pub const VIRTUAL_NODES: u32 = 100;

/// 64-bit FNV-1a, stable across processes and releases
#[derive(Debug, Clone, Copy)]
struct Fnv1a(u64);

impl Fnv1a {
    fn new() -> Self {
        Self(0xcbf2_9ce4_8422_2325)
    }

    fn write(mut self, bytes: &[u8]) -> Self {
        for byte in bytes {
            self.0 ^= *byte as u64;
            self.0 = self.0.wrapping_mul(0x0100_0000_01b3);
        }
        self
    }

    fn finish(self) -> u64 {
        self.0
    }
}

/// Pick the endpoint owning `key` on a consistent-hash ring.
///
/// Every `(host, port)` contributes [`VIRTUAL_NODES`] points; the key goes
/// to the first point at or after its own hash, wrapping around. Removing an
/// endpoint only moves the keys it owned. Returns `None` for an empty slice.
pub fn pick_hashed(addrs: &[(&str, u16)], key: &str) -> Option<usize> {
    let target = Fnv1a::new().write(key.as_bytes()).finish();

    let mut best: Option<(u64, usize)> = None;
    for (index, (host, port)) in addrs.iter().enumerate() {
        let base = Fnv1a::new()
            .write(host.as_bytes())
            .write(b":")
            .write(&port.to_be_bytes());
        for node in 0..VIRTUAL_NODES {
            let point = base.write(b"#").write(&node.to_be_bytes()).finish();
            // Clockwise distance from the key to this point
            let distance = point.wrapping_sub(target);
            if best.map_or(true, |(d, _)| distance < d) {
                best = Some((distance, index));
            }
        }
    }
    best.map(|(_, index)| index)
}

/// Index of the smallest key, scanning from `start` so ties rotate
fn scan_min<K, F>(candidates: &[&Arc<Endpoint>], start: usize, key: F) -> usize
where
    K: PartialOrd,
    F: Fn(&Endpoint) -> K,
{
    let n = candidates.len();
    let mut best = start % n;
    let mut best_key = key(candidates[best].as_ref());
    for offset in 1..n {
        let index = (start + offset) % n;
        let candidate_key = key(candidates[index].as_ref());
        if candidate_key < best_key {
            best = index;
            best_key = candidate_key;
        }
    }
    best
}

/// Result of a selection
#[derive(Debug, Clone)]
pub struct Selection {
    pub endpoint: Arc<Endpoint>,
    /// No endpoint was healthy and the pick came from the full list
    pub degraded: bool,
}

/// Load balancer for distributing requests across a service's endpoints
pub struct LoadBalancer {
    registry: Arc<ServiceRegistry>,
    random: Arc<dyn RandomSource>,
}

impl LoadBalancer {
    /// Create a new load balancer over the registry
    pub fn new(registry: Arc<ServiceRegistry>) -> Self {
        Self::with_random_source(registry, Arc::new(ThreadRandom))
    }

    pub fn with_random_source(registry: Arc<ServiceRegistry>, random: Arc<dyn RandomSource>) -> Self {
        Self { registry, random }
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    /// Select an endpoint for a service using its configured strategy
    pub fn select_endpoint(&self, service: &str) -> GatewayResult<Selection> {
        self.select_endpoint_for(service, None, |_| true)
    }

    /// Select an endpoint, considering only those `admit` accepts
    pub fn select_endpoint_where<F>(&self, service: &str, admit: F) -> GatewayResult<Selection>
    where
        F: Fn(&Endpoint) -> bool,
    {
        self.select_endpoint_for(service, None, admit)
    }

    /// Select an endpoint, considering only those `admit` accepts.
    ///
    /// Healthy endpoints are preferred. When none is healthy the whole list
    /// is used and the selection is flagged as degraded. If `admit` rejects
    /// every candidate the service is reported as circuit-open.
    ///
    /// `affinity` keys the consistent-hash strategy; other strategies ignore
    /// it, and without one consistent hashing picks at random.
    pub fn select_endpoint_for<F>(
        &self,
        service: &str,
        affinity: Option<&str>,
        admit: F,
    ) -> GatewayResult<Selection>
    where
        F: Fn(&Endpoint) -> bool,
    {
        let entry = self
            .registry
            .service(service)
            .ok_or_else(|| GatewayError::NoHealthyEndpoint(service.to_string()))?;
        let endpoints = entry.endpoints();
        if endpoints.is_empty() {
            return Err(GatewayError::NoHealthyEndpoint(service.to_string()));
        }

        let healthy: Vec<&Arc<Endpoint>> = endpoints.iter().filter(|e| e.is_healthy()).collect();
        let degraded = healthy.is_empty();
        let pool: Vec<&Arc<Endpoint>> = if degraded {
            warn!(
                service = %service,
                endpoints = endpoints.len(),
                "No healthy endpoints, selecting from all"
            );
            endpoints.iter().collect()
        } else {
            healthy
        };

        let admitted: Vec<&Arc<Endpoint>> = pool.into_iter().filter(|e| admit(e.as_ref())).collect();
        if admitted.is_empty() {
            debug!(service = %service, "Every candidate rejected, circuits open");
            return Err(GatewayError::CircuitOpen(service.to_string()));
        }

        let with_capacity: Vec<&Arc<Endpoint>> =
            admitted.iter().copied().filter(|e| e.has_capacity()).collect();
        let candidates = if with_capacity.is_empty() {
            admitted
        } else {
            with_capacity
        };

        let index = self.pick(&entry, &candidates, affinity);
        let endpoint = candidates[index].clone();

        endpoint.note_selected();
        entry.note_request();
        if degraded {
            entry.note_degraded();
            counter!(telemetry::DEGRADED_SELECTIONS_TOTAL, "service" => service.to_string())
                .increment(1);
        }

        debug!(
            service = %service,
            strategy = %entry.strategy(),
            endpoint = %endpoint.addr(),
            candidates = candidates.len(),
            degraded = degraded,
            "Selected endpoint"
        );

        Ok(Selection { endpoint, degraded })
    }

    fn pick(
        &self,
        entry: &ServiceEntry,
        candidates: &[&Arc<Endpoint>],
        affinity: Option<&str>,
    ) -> usize {
        let n = candidates.len();
        match entry.strategy() {
            LoadBalanceStrategy::RoundRobin => entry.next_cursor() % n,
            LoadBalanceStrategy::Random => self.random_index(n),
            LoadBalanceStrategy::Weighted => {
                let weights: Vec<u32> = candidates.iter().map(|e| e.weight()).collect();
                pick_weighted(&weights, self.random.next_f64())
                    .unwrap_or_else(|| self.random_index(n))
            }
            LoadBalanceStrategy::LeastConnections => {
                scan_min(candidates, entry.next_cursor(), |e| e.active_connections())
            }
            // Endpoints without samples report 0 and are tried first
            LoadBalanceStrategy::ResponseTime => {
                scan_min(candidates, entry.next_cursor(), |e| e.response_time_ewma_ms())
            }
            LoadBalanceStrategy::ConsistentHash => {
                let addrs: Vec<(&str, u16)> =
                    candidates.iter().map(|e| (e.host(), e.port())).collect();
                affinity
                    .and_then(|key| pick_hashed(&addrs, key))
                    .unwrap_or_else(|| self.random_index(n))
            }
        }
    }

    fn random_index(&self, n: usize) -> usize {
        ((self.random.next_f64() * n as f64) as usize).min(n - 1)
    }
}
