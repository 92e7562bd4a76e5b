//! Live endpoint state shared between the registry, health monitor and router

use crate::circuit::CircuitBreaker;
use chrono::{TimeZone, Utc};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::time::Duration;
use waypoint_core::{CircuitBreakerConfig, EndpointOrigin, EndpointSnapshot, EndpointSpec};

/// Smoothing factor for the response-time moving average
const EWMA_ALPHA: f64 = 0.1;

fn origin_to_u8(origin: EndpointOrigin) -> u8 {
    match origin {
        EndpointOrigin::Static => 0,
        EndpointOrigin::Discovery => 1,
        EndpointOrigin::Admin => 2,
    }
}

fn origin_from_u8(raw: u8) -> EndpointOrigin {
    match raw {
        1 => EndpointOrigin::Discovery,
        2 => EndpointOrigin::Admin,
        _ => EndpointOrigin::Static,
    }
}

/// A backend instance with its counters and circuit breaker.
///
/// Identity (`host`, `port`) is fixed; everything that changes at runtime is
/// atomic so readers on the request path never lock.
#[derive(Debug)]
pub struct Endpoint {
    host: String,
    port: u16,
    tls: bool,
    max_connections: u32,
    origin: AtomicU8,
    weight: AtomicU32,
    healthy: AtomicBool,
    /// Consecutive successful discovery polls this endpoint was missing from
    missing_polls: AtomicU32,
    /// Unix millis of the last probe, 0 if never probed
    last_health_check_ms: AtomicI64,
    probe_failures: AtomicU32,
    probe_successes: AtomicU32,
    active_connections: AtomicU32,
    request_count: AtomicU64,
    success_count: AtomicU64,
    failure_count: AtomicU64,
    /// f64 milliseconds stored as bits
    response_time_ewma: AtomicU64,
    breaker: CircuitBreaker,
}

impl Endpoint {
    /// Create a healthy endpoint from its spec
    pub fn new(spec: &EndpointSpec, origin: EndpointOrigin, breaker: CircuitBreakerConfig) -> Self {
        Self {
            host: spec.host.clone(),
            port: spec.port,
            tls: spec.tls,
            max_connections: spec.max_connections,
            origin: AtomicU8::new(origin_to_u8(origin)),
            weight: AtomicU32::new(spec.weight),
            healthy: AtomicBool::new(true),
            missing_polls: AtomicU32::new(0),
            last_health_check_ms: AtomicI64::new(0),
            probe_failures: AtomicU32::new(0),
            probe_successes: AtomicU32::new(0),
            active_connections: AtomicU32::new(0),
            request_count: AtomicU64::new(0),
            success_count: AtomicU64::new(0),
            failure_count: AtomicU64::new(0),
            response_time_ewma: AtomicU64::new(0f64.to_bits()),
            breaker: CircuitBreaker::new(breaker),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn matches(&self, host: &str, port: u16) -> bool {
        self.port == port && self.host == host
    }

    /// `host:port`
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Get the base URL for this endpoint
    pub fn url(&self) -> String {
        let scheme = if self.tls { "https" } else { "http" };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }

    pub fn origin(&self) -> EndpointOrigin {
        origin_from_u8(self.origin.load(Ordering::Acquire))
    }

    /// Static and admin registrations pin an endpoint so discovery no longer
    /// owns it; discovery never downgrades them.
    pub(crate) fn claim(&self, origin: EndpointOrigin) {
        if origin != EndpointOrigin::Discovery {
            self.origin.store(origin_to_u8(origin), Ordering::Release);
        }
    }

    pub fn weight(&self) -> u32 {
        self.weight.load(Ordering::Relaxed)
    }

    pub fn set_weight(&self, weight: u32) {
        self.weight.store(weight, Ordering::Relaxed);
    }

    pub fn max_connections(&self) -> u32 {
        self.max_connections
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    /// Swap the health flag, returning the previous value
    pub fn set_healthy(&self, healthy: bool) -> bool {
        self.healthy.swap(healthy, Ordering::AcqRel)
    }

    /// Manual override: set the flag and restart probe streaks
    pub fn force_health(&self, healthy: bool) {
        self.probe_failures.store(0, Ordering::Release);
        self.probe_successes.store(0, Ordering::Release);
        self.set_healthy(healthy);
    }

    pub fn is_stale(&self) -> bool {
        self.missing_polls.load(Ordering::Acquire) > 0
    }

    pub(crate) fn note_missing(&self) -> u32 {
        self.missing_polls.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn note_present(&self) {
        self.missing_polls.store(0, Ordering::Release);
    }

    /// Record a successful probe, returning the success streak
    pub(crate) fn note_probe_success(&self) -> u32 {
        self.touch_health_check();
        self.probe_failures.store(0, Ordering::Release);
        self.probe_successes.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Record a failed probe, returning the failure streak
    pub(crate) fn note_probe_failure(&self) -> u32 {
        self.touch_health_check();
        self.probe_successes.store(0, Ordering::Release);
        self.probe_failures.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn touch_health_check(&self) {
        self.last_health_check_ms
            .store(Utc::now().timestamp_millis(), Ordering::Release);
    }

    pub fn active_connections(&self) -> u32 {
        self.active_connections.load(Ordering::Acquire)
    }

    /// Whether another request fits under `max_connections`
    pub fn has_capacity(&self) -> bool {
        self.active_connections() < self.max_connections
    }

    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }

    /// Count a load-balancer selection
    pub fn note_selected(&self) {
        self.request_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Mark a forwarded request as started
    pub fn begin_request(&self) {
        self.active_connections.fetch_add(1, Ordering::AcqRel);
    }

    /// Mark a forwarded request as finished and fold its latency into the EWMA
    pub fn end_request(&self, success: bool, elapsed: Duration) {
        let _ = self
            .active_connections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)));
        if success {
            self.success_count.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failure_count.fetch_add(1, Ordering::Relaxed);
        }
        self.observe_response_time(elapsed);
    }

    fn observe_response_time(&self, elapsed: Duration) {
        let sample = elapsed.as_secs_f64() * 1_000.0;
        let _ = self
            .response_time_ewma
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                let current = f64::from_bits(bits);
                let next = if current == 0.0 {
                    sample
                } else {
                    EWMA_ALPHA * sample + (1.0 - EWMA_ALPHA) * current
                };
                Some(next.to_bits())
            });
    }

    /// Response-time moving average in milliseconds, 0 before the first sample
    pub fn response_time_ewma_ms(&self) -> f64 {
        f64::from_bits(self.response_time_ewma.load(Ordering::Acquire))
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Point-in-time view for the admin API and stats
    pub fn snapshot(&self) -> EndpointSnapshot {
        let last_check = self.last_health_check_ms.load(Ordering::Acquire);
        EndpointSnapshot {
            host: self.host.clone(),
            port: self.port,
            weight: self.weight(),
            max_connections: self.max_connections,
            tls: self.tls,
            origin: self.origin(),
            healthy: self.is_healthy(),
            stale: self.is_stale(),
            last_health_check: if last_check == 0 {
                None
            } else {
                Utc.timestamp_millis_opt(last_check).single()
            },
            active_connections: self.active_connections(),
            request_count: self.request_count(),
            success_count: self.success_count.load(Ordering::Relaxed),
            failure_count: self.failure_count.load(Ordering::Relaxed),
            response_time_ewma_ms: self.response_time_ewma_ms(),
            circuit_state: self.breaker.state(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint() -> Endpoint {
        Endpoint::new(
            &EndpointSpec::new("127.0.0.1", 30000),
            EndpointOrigin::Static,
            CircuitBreakerConfig::default(),
        )
    }

    #[test]
    fn test_new_endpoint_is_healthy() {
        let ep = endpoint();
        assert!(ep.is_healthy());
        assert_eq!(ep.url(), "http://127.0.0.1:30000");
        assert!(ep.snapshot().last_health_check.is_none());
    }

    #[test]
    fn test_ewma() {
        let ep = endpoint();
        ep.begin_request();
        ep.end_request(true, Duration::from_millis(100));
        assert!((ep.response_time_ewma_ms() - 100.0).abs() < 1e-9);

        ep.begin_request();
        ep.end_request(false, Duration::from_millis(200));
        assert!((ep.response_time_ewma_ms() - 110.0).abs() < 1e-9);

        let snap = ep.snapshot();
        assert_eq!(snap.success_count, 1);
        assert_eq!(snap.failure_count, 1);
        assert_eq!(snap.active_connections, 0);
    }

    #[test]
    fn test_capacity() {
        let spec = EndpointSpec {
            max_connections: 1,
            ..EndpointSpec::new("127.0.0.1", 30000)
        };
        let ep = Endpoint::new(&spec, EndpointOrigin::Admin, CircuitBreakerConfig::default());
        assert!(ep.has_capacity());
        ep.begin_request();
        assert!(!ep.has_capacity());
        ep.end_request(true, Duration::ZERO);
        assert!(ep.has_capacity());
    }

    #[test]
    fn test_discovery_never_downgrades_origin() {
        let ep = endpoint();
        ep.claim(EndpointOrigin::Discovery);
        assert_eq!(ep.origin(), EndpointOrigin::Static);
    }
}
