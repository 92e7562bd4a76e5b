//! Prometheus metric names shared by every waypoint crate.
//!
//! Counters are emitted through the `metrics` facade; nothing is recorded
//! until the daemon installs a recorder. The JSON snapshot stats served on
//! the admin API are tracked separately and are unaffected.

use metrics::{describe_counter, describe_histogram, Unit};

pub const REQUESTS_TOTAL: &str = "waypoint_requests_total";
pub const REQUEST_DURATION_SECONDS: &str = "waypoint_request_duration_seconds";
pub const RATE_LIMITED_TOTAL: &str = "waypoint_rate_limited_total";
pub const UPSTREAM_ATTEMPTS_TOTAL: &str = "waypoint_upstream_attempts_total";
pub const UPSTREAM_DURATION_SECONDS: &str = "waypoint_upstream_duration_seconds";
pub const RETRIES_TOTAL: &str = "waypoint_retries_total";
pub const CACHE_HITS_TOTAL: &str = "waypoint_cache_hits_total";
pub const CACHE_MISSES_TOTAL: &str = "waypoint_cache_misses_total";
pub const CACHE_EVICTIONS_TOTAL: &str = "waypoint_cache_evictions_total";
pub const CIRCUIT_TRANSITIONS_TOTAL: &str = "waypoint_circuit_transitions_total";
pub const DEGRADED_SELECTIONS_TOTAL: &str = "waypoint_degraded_selections_total";
pub const HEALTH_TRANSITIONS_TOTAL: &str = "waypoint_health_transitions_total";
pub const DISCOVERY_POLLS_TOTAL: &str = "waypoint_discovery_polls_total";

/// Register help text and units with the installed recorder
pub fn describe_metrics() {
    describe_counter!(REQUESTS_TOTAL, Unit::Count, "Proxied requests by method and status");
    describe_histogram!(
        REQUEST_DURATION_SECONDS,
        Unit::Seconds,
        "End-to-end latency of proxied requests"
    );
    describe_counter!(RATE_LIMITED_TOTAL, Unit::Count, "Requests rejected by a route rate limit");
    describe_counter!(
        UPSTREAM_ATTEMPTS_TOTAL,
        Unit::Count,
        "Upstream attempts by service and outcome"
    );
    describe_histogram!(
        UPSTREAM_DURATION_SECONDS,
        Unit::Seconds,
        "Latency of individual upstream attempts"
    );
    describe_counter!(RETRIES_TOTAL, Unit::Count, "Upstream attempts after the first");
    describe_counter!(CACHE_HITS_TOTAL, Unit::Count, "Response cache hits");
    describe_counter!(CACHE_MISSES_TOTAL, Unit::Count, "Response cache misses");
    describe_counter!(CACHE_EVICTIONS_TOTAL, Unit::Count, "Response cache evictions");
    describe_counter!(
        CIRCUIT_TRANSITIONS_TOTAL,
        Unit::Count,
        "Circuit breaker transitions by target state"
    );
    describe_counter!(
        DEGRADED_SELECTIONS_TOTAL,
        Unit::Count,
        "Selections made with no healthy endpoint available"
    );
    describe_counter!(
        HEALTH_TRANSITIONS_TOTAL,
        Unit::Count,
        "Endpoint health flips by new state"
    );
    describe_counter!(DISCOVERY_POLLS_TOTAL, Unit::Count, "Discovery polls by outcome");
}
