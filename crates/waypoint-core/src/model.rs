//! Service, endpoint and route type definitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Static description of a backend instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointSpec {
    /// Host address
    #[serde(alias = "address")]
    pub host: String,
    /// Port number
    pub port: u16,
    /// Relative share of weighted traffic
    #[serde(default = "default_weight")]
    pub weight: u32,
    /// Active requests above which the endpoint is skipped
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Whether TLS is enabled
    #[serde(default)]
    pub tls: bool,
}

fn default_weight() -> u32 {
    1
}

fn default_max_connections() -> u32 {
    1024
}

impl EndpointSpec {
    /// Create a new endpoint spec with weight 1
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            weight: default_weight(),
            max_connections: default_max_connections(),
            tls: false,
        }
    }

    /// Builder-style weight override
    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    /// `host:port` key used to identify the endpoint within a service
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Get the base URL for this endpoint
    pub fn url(&self) -> String {
        let scheme = if self.tls { "https" } else { "http" };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }
}

/// Where an endpoint registration came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointOrigin {
    /// Loaded from the configuration file
    Static,
    /// Learned from the discovery poll
    Discovery,
    /// Registered through the administrative API
    Admin,
}

/// Load balancing strategy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalanceStrategy {
    /// Cyclic selection over healthy endpoints
    #[default]
    #[serde(alias = "round-robin")]
    RoundRobin,
    /// Uniform random selection
    Random,
    /// Random selection proportional to endpoint weight
    #[serde(alias = "weighted_random", alias = "weighted_round_robin")]
    Weighted,
    /// Fewest active connections first
    #[serde(alias = "least-connections")]
    LeastConnections,
    /// Lowest response-time EWMA first
    #[serde(alias = "response-time")]
    ResponseTime,
    /// Session affinity: requests with the same user id or client IP land on
    /// the same endpoint while the endpoint set is unchanged
    #[serde(alias = "consistent-hash", alias = "ip_hash", alias = "hash")]
    ConsistentHash,
}

impl std::fmt::Display for LoadBalanceStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadBalanceStrategy::RoundRobin => write!(f, "round_robin"),
            LoadBalanceStrategy::Random => write!(f, "random"),
            LoadBalanceStrategy::Weighted => write!(f, "weighted"),
            LoadBalanceStrategy::LeastConnections => write!(f, "least_connections"),
            LoadBalanceStrategy::ResponseTime => write!(f, "response_time"),
            LoadBalanceStrategy::ConsistentHash => write!(f, "consistent_hash"),
        }
    }
}

/// Static description of a logical service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSpec {
    /// Unique service name
    pub name: String,
    /// Selection strategy for this service
    #[serde(default)]
    pub strategy: LoadBalanceStrategy,
    /// Business domain the service belongs to (indexed for queries)
    #[serde(default)]
    pub domain: Option<String>,
    /// Service type (indexed for queries)
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    /// Backend instances
    #[serde(default)]
    pub endpoints: Vec<EndpointSpec>,
}

impl ServiceSpec {
    pub fn new(name: impl Into<String>, strategy: LoadBalanceStrategy) -> Self {
        Self {
            name: name.into(),
            strategy,
            domain: None,
            kind: None,
            endpoints: Vec::new(),
        }
    }
}

/// Retry behaviour for a route
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Backend statuses that trigger another attempt
    #[serde(default = "default_retryable_status_codes")]
    pub retryable_status_codes: Vec<u16>,
    /// Delay before the first retry
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Upper bound for the exponential delay
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// Allow retries for POST/PATCH
    #[serde(default)]
    pub retry_non_idempotent: bool,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retryable_status_codes() -> Vec<u16> {
    vec![502, 503, 504]
}

fn default_backoff_base_ms() -> u64 {
    100
}

fn default_backoff_max_ms() -> u64 {
    2_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            retryable_status_codes: default_retryable_status_codes(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            retry_non_idempotent: false,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Whether a backend status should be retried
    pub fn is_retryable_status(&self, status: u16) -> bool {
        self.retryable_status_codes.contains(&status)
    }

    /// Delay before retry number `retry` (1-based): base * 2^(retry-1), capped
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(32);
        let delay = self
            .backoff_base_ms
            .saturating_mul(1u64 << exponent)
            .min(self.backoff_max_ms);
        Duration::from_millis(delay)
    }
}

/// Response caching for a route
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachePolicy {
    #[serde(default)]
    pub enabled: bool,
    /// Time to live for stored responses
    #[serde(default = "default_ttl_secs", alias = "ttl")]
    pub ttl_secs: u64,
}

fn default_ttl_secs() -> u64 {
    60
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            ttl_secs: default_ttl_secs(),
        }
    }
}

impl CachePolicy {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Request budget for a route
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    /// Requests admitted per window
    pub limit: u32,
    /// Window length
    #[serde(alias = "window")]
    pub window_secs: u64,
}

/// Mapping from a path prefix to a target service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRule {
    /// Path prefix, matched on segment boundaries
    pub prefix: String,
    /// Target service name
    pub service: String,
    /// Remove the prefix before forwarding
    #[serde(default)]
    pub strip_prefix: bool,
    /// Allowed methods, empty means any
    #[serde(default)]
    pub methods: Vec<String>,
    /// Per-attempt timeout
    #[serde(default = "default_timeout_ms", alias = "timeout")]
    pub timeout_ms: u64,
    /// Overall deadline across all attempts, falls back to the gateway default
    #[serde(default)]
    pub deadline_ms: Option<u64>,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub cache: CachePolicy,
    #[serde(default)]
    pub rate_limit: Option<RateLimit>,
}

fn default_timeout_ms() -> u64 {
    30_000
}

impl RouteRule {
    /// Create a route with default policies
    pub fn new(prefix: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            service: service.into(),
            strip_prefix: false,
            methods: Vec::new(),
            timeout_ms: default_timeout_ms(),
            deadline_ms: None,
            retry: RetryPolicy::default(),
            cache: CachePolicy::default(),
            rate_limit: None,
        }
    }

    /// Whether the route accepts `method`
    pub fn allows_method(&self, method: &str) -> bool {
        self.methods.is_empty()
            || self
                .methods
                .iter()
                .any(|m| m == "*" || m.eq_ignore_ascii_case(method))
    }

    /// Whether `path` falls under this route's prefix on a segment boundary
    pub fn matches_path(&self, path: &str) -> bool {
        let prefix = self.prefix.trim_end_matches('/');
        if prefix.is_empty() {
            return true;
        }
        match path.strip_prefix(prefix) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }

    /// Path to send upstream
    pub fn upstream_path(&self, path: &str) -> String {
        if !self.strip_prefix {
            return path.to_string();
        }
        let prefix = self.prefix.trim_end_matches('/');
        let rest = path.strip_prefix(prefix).unwrap_or(path);
        if rest.starts_with('/') {
            rest.to_string()
        } else {
            format!("/{}", rest)
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Requests flow through
    Closed,
    /// Requests are rejected without a network call
    Open,
    /// A single trial request is in flight
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Point-in-time view of an endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointSnapshot {
    pub host: String,
    pub port: u16,
    pub weight: u32,
    pub max_connections: u32,
    pub tls: bool,
    pub origin: EndpointOrigin,
    pub healthy: bool,
    /// Absent from the latest discovery poll, pending removal
    pub stale: bool,
    pub last_health_check: Option<DateTime<Utc>>,
    pub active_connections: u32,
    pub request_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub response_time_ewma_ms: f64,
    pub circuit_state: CircuitState,
}

/// Point-in-time view of a service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSnapshot {
    pub name: String,
    pub strategy: LoadBalanceStrategy,
    pub domain: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub total_requests: u64,
    /// Selections made from the unfiltered list because nothing was healthy
    pub degraded_selections: u64,
    pub healthy_endpoints: usize,
    pub endpoints: Vec<EndpointSnapshot>,
}
