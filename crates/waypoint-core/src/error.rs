//! Error types for waypoint

use thiserror::Error;

/// Main error type for waypoint
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Malformed route or service configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Discovery source could not be polled or parsed
    #[error("Discovery error: {0}")]
    Discovery(String),

    /// No route rule matches the request path
    #[error("No route matches path {0}")]
    RouteNotFound(String),

    /// A route matches the path but does not allow the method
    #[error("Method {method} not allowed for {path}")]
    MethodNotAllowed { method: String, path: String },

    /// Service is not present in the registry
    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    /// Endpoint is not registered for the service
    #[error("Endpoint {endpoint} not found in service {service}")]
    EndpointNotFound { service: String, endpoint: String },

    /// Endpoint definition was rejected
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// Service is unknown or has no endpoint that can take traffic
    #[error("No healthy endpoint available for service {0}")]
    NoHealthyEndpoint(String),

    /// Every candidate endpoint has an open circuit
    #[error("Circuit open for service {0}")]
    CircuitOpen(String),

    /// Backend did not answer within the attempt timeout or request deadline
    #[error("Downstream timeout for service {0}")]
    DownstreamTimeout(String),

    /// Backend could not be reached
    #[error("Upstream unavailable for service {service}: {reason}")]
    UpstreamUnavailable { service: String, reason: String },

    /// Route rate limit exceeded
    #[error("Rate limit exceeded for route {0}")]
    RateLimited(String),

    /// Response cache rejected an operation
    #[error("Cache error: {0}")]
    Cache(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for waypoint operations
pub type GatewayResult<T> = Result<T, GatewayError>;

impl GatewayError {
    /// Stable machine-readable code exposed to clients
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Config(_) => "config_error",
            GatewayError::Discovery(_) => "discovery_error",
            GatewayError::RouteNotFound(_) => "route_not_found",
            GatewayError::MethodNotAllowed { .. } => "method_not_allowed",
            GatewayError::ServiceNotFound(_) => "service_not_found",
            GatewayError::EndpointNotFound { .. } => "endpoint_not_found",
            GatewayError::InvalidEndpoint(_) => "invalid_endpoint",
            GatewayError::NoHealthyEndpoint(_) => "no_healthy_endpoint",
            GatewayError::CircuitOpen(_) => "circuit_open",
            GatewayError::DownstreamTimeout(_) => "downstream_timeout",
            GatewayError::UpstreamUnavailable { .. } => "upstream_unavailable",
            GatewayError::RateLimited(_) => "rate_limited",
            GatewayError::Cache(_) => "cache_error",
            GatewayError::Io(_) | GatewayError::Serialization(_) | GatewayError::Internal(_) => {
                "internal_error"
            }
        }
    }

    /// HTTP status used when the error terminates a request
    pub fn status_code(&self) -> u16 {
        match self {
            GatewayError::RouteNotFound(_)
            | GatewayError::ServiceNotFound(_)
            | GatewayError::EndpointNotFound { .. } => 404,
            GatewayError::MethodNotAllowed { .. } => 405,
            GatewayError::Config(_) | GatewayError::InvalidEndpoint(_) => 400,
            GatewayError::RateLimited(_) => 429,
            GatewayError::NoHealthyEndpoint(_)
            | GatewayError::CircuitOpen(_)
            | GatewayError::UpstreamUnavailable { .. } => 502,
            GatewayError::DownstreamTimeout(_) => 504,
            GatewayError::Discovery(_)
            | GatewayError::Cache(_)
            | GatewayError::Io(_)
            | GatewayError::Serialization(_)
            | GatewayError::Internal(_) => 500,
        }
    }

    /// Message safe to show to clients. Internal variants are collapsed.
    pub fn public_message(&self) -> String {
        match self {
            GatewayError::Io(_)
            | GatewayError::Serialization(_)
            | GatewayError::Internal(_)
            | GatewayError::Cache(_)
            | GatewayError::Discovery(_) => "internal gateway error".to_string(),
            GatewayError::UpstreamUnavailable { service, .. } => {
                format!("Upstream unavailable for service {}", service)
            }
            other => other.to_string(),
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for GatewayError {
    fn from(err: toml::de::Error) -> Self {
        GatewayError::Config(err.to_string())
    }
}

impl From<config::ConfigError> for GatewayError {
    fn from(err: config::ConfigError) -> Self {
        GatewayError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = GatewayError::Config("invalid route".to_string());
        assert_eq!(err.to_string(), "Configuration error: invalid route");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: GatewayError = io_err.into();
        assert!(matches!(err, GatewayError::Io(_)));
        assert_eq!(err.code(), "internal_error");
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(GatewayError::CircuitOpen("a".into()).status_code(), 502);
        assert_eq!(GatewayError::NoHealthyEndpoint("a".into()).status_code(), 502);
        assert_eq!(GatewayError::DownstreamTimeout("a".into()).status_code(), 504);
        assert_eq!(GatewayError::RateLimited("/a".into()).status_code(), 429);
        assert_eq!(GatewayError::RouteNotFound("/x".into()).status_code(), 404);
    }

    #[test]
    fn test_public_message_hides_internals() {
        let err = GatewayError::Internal("lock poisoned at registry.rs:42".to_string());
        assert_eq!(err.public_message(), "internal gateway error");

        let err = GatewayError::UpstreamUnavailable {
            service: "users".to_string(),
            reason: "tcp connect error: 10.0.0.3:8080 refused".to_string(),
        };
        assert!(!err.public_message().contains("10.0.0.3"));
    }
}
