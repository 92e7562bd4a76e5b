//! waypoint-api: HTTP surfaces for waypoint
//!
//! This crate provides:
//! - The proxy handler that feeds inbound traffic to the request router
//! - The administrative REST API for services, endpoints and routes
//! - Structured error responses

pub mod error;
pub mod proxy;
pub mod rest;

pub use error::{ApiError, ErrorBody};
pub use proxy::create_proxy_router;
pub use rest::create_router;
