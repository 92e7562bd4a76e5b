//! waypoint-store: Response caching
//!
//! This crate provides:
//! - Request fingerprinting
//! - A sharded, TTL-bounded response cache

pub mod cache;
pub mod fingerprint;

pub use cache::{is_cacheable_status, CacheStats, CachedResponse, ResponseCache};
pub use fingerprint::fingerprint;
