//! Configuration types for waypoint

use crate::{GatewayError, GatewayResult, RouteRule, ServiceSpec};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Environment variables with this prefix override file values,
/// e.g. `WAYPOINT__SERVER__PORT=8081`.
pub const ENV_PREFIX: &str = "WAYPOINT";

/// Main gateway configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Inbound proxy listener
    pub server: ServerConfig,
    /// Administrative API listener
    pub admin: AdminConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
    /// Active health probing
    pub health: HealthConfig,
    /// Discovery polling
    pub discovery: DiscoveryConfig,
    /// Per-endpoint circuit breakers
    pub circuit_breaker: CircuitBreakerConfig,
    /// Response cache
    pub cache: CacheConfig,
    /// Outbound HTTP client
    pub upstream: UpstreamConfig,
    /// Statically configured services
    pub services: Vec<ServiceSpec>,
    /// Route table
    pub routes: Vec<RouteRule>,
}

impl GatewayConfig {
    /// Load configuration from a TOML file, applying environment overrides
    pub fn load(path: &Path) -> GatewayResult<Self> {
        if !path.exists() {
            return Err(GatewayError::Config(format!(
                "Config file not found: {}",
                path.display()
            )));
        }

        let settings = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: GatewayConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string without environment overrides
    pub fn from_toml_str(content: &str) -> GatewayResult<Self> {
        let config: GatewayConfig = toml::from_str(content)
            .map_err(|e| GatewayError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that cannot be served
    pub fn validate(&self) -> GatewayResult<()> {
        let mut names = HashSet::new();
        for service in &self.services {
            if service.name.trim().is_empty() {
                return Err(GatewayError::Config("service name must not be empty".into()));
            }
            if !names.insert(service.name.as_str()) {
                return Err(GatewayError::Config(format!(
                    "duplicate service name: {}",
                    service.name
                )));
            }
            for endpoint in &service.endpoints {
                if endpoint.host.trim().is_empty() || endpoint.port == 0 {
                    return Err(GatewayError::Config(format!(
                        "service {} has invalid endpoint {}",
                        service.name,
                        endpoint.addr()
                    )));
                }
            }
        }

        validate_routes(&self.routes)?;

        if self.health.unhealthy_threshold == 0 || self.health.healthy_threshold == 0 {
            return Err(GatewayError::Config(
                "health thresholds must be at least 1".into(),
            ));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(GatewayError::Config(
                "circuit_breaker.failure_threshold must be at least 1".into(),
            ));
        }
        if self.discovery.stale_after_polls == 0 {
            return Err(GatewayError::Config(
                "discovery.stale_after_polls must be at least 1".into(),
            ));
        }

        Ok(())
    }
}

/// Validate a route table on its own (used for startup and reloads)
pub fn validate_routes(routes: &[RouteRule]) -> GatewayResult<()> {
    let mut prefixes = HashSet::new();
    for route in routes {
        if !route.prefix.starts_with('/') {
            return Err(GatewayError::Config(format!(
                "route prefix must start with '/': {:?}",
                route.prefix
            )));
        }
        if !prefixes.insert(route.prefix.trim_end_matches('/')) {
            return Err(GatewayError::Config(format!(
                "duplicate route prefix: {}",
                route.prefix
            )));
        }
        if route.service.trim().is_empty() {
            return Err(GatewayError::Config(format!(
                "route {} has no target service",
                route.prefix
            )));
        }
        if route.timeout_ms == 0 {
            return Err(GatewayError::Config(format!(
                "route {} has a zero timeout",
                route.prefix
            )));
        }
        if route.retry.max_attempts == 0 {
            return Err(GatewayError::Config(format!(
                "route {} must allow at least one attempt",
                route.prefix
            )));
        }
        if route.cache.enabled && route.cache.ttl_secs == 0 {
            return Err(GatewayError::Config(format!(
                "route {} enables caching with a zero ttl",
                route.prefix
            )));
        }
        if let Some(limit) = &route.rate_limit {
            if limit.limit == 0 || limit.window_secs == 0 {
                return Err(GatewayError::Config(format!(
                    "route {} has an empty rate limit",
                    route.prefix
                )));
            }
        }
    }
    Ok(())
}

/// Inbound proxy listener
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub address: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

/// Administrative API listener
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    pub address: String,
    pub port: u16,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1".to_string(),
            port: 9090,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
    /// Log format (json or text)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

/// Health probe configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub enabled: bool,
    /// Health check endpoint path
    pub path: String,
    /// Check interval in seconds
    pub interval_secs: u64,
    /// Probe timeout in milliseconds
    pub timeout_ms: u64,
    /// Consecutive failed probes before marking unhealthy
    pub unhealthy_threshold: u32,
    /// Consecutive successful probes before marking healthy again
    pub healthy_threshold: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: "/health".to_string(),
            interval_secs: 10,
            timeout_ms: 5_000,
            unhealthy_threshold: 3,
            healthy_threshold: 1,
        }
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Discovery polling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Discovery document URL; polling is disabled when absent
    pub url: Option<String>,
    pub interval_secs: u64,
    pub timeout_ms: u64,
    /// Consecutive successful polls an endpoint may be missing from before removal
    pub stale_after_polls: u32,
    /// Delay after the first failed poll
    pub backoff_base_ms: u64,
    /// Upper bound for the failure backoff
    pub backoff_max_ms: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            url: None,
            interval_secs: 30,
            timeout_ms: 5_000,
            stale_after_polls: 2,
            backoff_base_ms: 1_000,
            backoff_max_ms: 60_000,
        }
    }
}

impl DiscoveryConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens
    pub failure_threshold: u32,
    /// Time the circuit stays open before admitting a trial request
    pub recovery_timeout_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            recovery_timeout_ms: 30_000,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }
}

/// Response cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of stored responses
    pub max_entries: usize,
    /// Responses with larger bodies are not stored
    pub max_payload_bytes: usize,
    /// Background sweep interval in seconds
    pub sweep_interval_secs: u64,
    /// Request headers that take part in the fingerprint
    pub vary_headers: Vec<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            max_payload_bytes: 1024 * 1024,
            sweep_interval_secs: 30,
            vary_headers: vec![
                "accept".to_string(),
                "accept-encoding".to_string(),
                "accept-language".to_string(),
                "authorization".to_string(),
                "cookie".to_string(),
            ],
        }
    }
}

/// Outbound HTTP client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// TCP connect timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Deadline across all attempts for routes that do not set one
    pub request_deadline_ms: u64,
    /// Idle pooled connections kept per backend
    pub pool_max_idle_per_host: usize,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 2_000,
            request_deadline_ms: 60_000,
            pool_max_idle_per_host: 32,
        }
    }
}

impl UpstreamConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_deadline(&self) -> Duration {
        Duration::from_millis(self.request_deadline_ms)
    }
}
