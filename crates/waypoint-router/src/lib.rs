//! waypoint-router: Request routing for the waypoint gateway
//!
//! This crate ties the registry, load balancer, circuit breakers and
//! response cache together:
//! - Route table matching and hot reload
//! - Forwarding with timeouts, retries and backoff
//! - Rate limiting hook
//! - Gateway startup and shutdown

pub mod lifecycle;
pub mod rate_limit;
pub mod route_table;
pub mod router;
pub mod upstream;

pub use lifecycle::Gateway;
pub use rate_limit::{RateLimiter, SlidingWindowLimiter};
pub use route_table::{RouteTable, SharedRouteTable};
pub use router::{is_idempotent, CacheStatus, RequestRouter, RoutedResponse, RouterStats};
pub use upstream::{HttpUpstream, ProxyRequest, ProxyResponse, Upstream, UpstreamError};
