//! waypoint-network: Service registry and traffic distribution
//!
//! This crate provides:
//! - The live service registry with copy-on-write snapshots
//! - Load balancing strategies
//! - Per-endpoint circuit breakers
//! - Active health checking
//! - Remote service discovery

pub mod balancer;
pub mod circuit;
pub mod discovery;
pub mod endpoint;
pub mod health;
pub mod registry;

pub use balancer::{LoadBalancer, RandomSource, SeededRandom, Selection, ThreadRandom};
pub use circuit::{CircuitBreaker, CircuitPermit};
pub use discovery::{DiscoveryDocument, DiscoveryPoller, DiscoverySource, HttpDiscoverySource};
pub use endpoint::Endpoint;
pub use health::{HealthMonitor, HealthProbe, HealthTransition, HttpHealthProbe};
pub use registry::{
    EndpointList, MergeReport, Registration, Removal, ServiceEntry, ServiceRegistry, ServiceUpdate,
};
