//! waypoint-core: Core types for the waypoint gateway
//!
//! This crate provides the fundamental types used throughout waypoint:
//! - Service, endpoint and route definitions
//! - Retry, cache and rate-limit policies
//! - Configuration types
//! - Error handling
//! - Metric names

pub mod config;
pub mod error;
pub mod model;
pub mod telemetry;

pub use config::*;
pub use error::*;
pub use model::*;
