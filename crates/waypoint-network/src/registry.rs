//! Service registry
//!
//! Reads are lock-free: the service map and each service's endpoint list sit
//! behind `ArcSwap` pointers, and every update builds a new version before
//! swapping it in. Writers are serialized by a single async mutex so two
//! control-plane updates never race on the same copy.

use crate::endpoint::Endpoint;
use arc_swap::ArcSwap;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use waypoint_core::{
    CircuitBreakerConfig, EndpointOrigin, EndpointSpec, GatewayError, GatewayResult,
    LoadBalanceStrategy, ServiceSnapshot, ServiceSpec,
};

/// Immutable list of endpoints handed to readers
pub type EndpointList = Arc<Vec<Arc<Endpoint>>>;

/// Outcome of a registration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// A new entry was created
    Added,
    /// An existing entry was updated in place
    Updated,
}

/// Outcome of a deregistration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    /// The endpoint was removed, the service still has others
    EndpointRemoved,
    /// The service entry was removed
    ServiceRemoved,
    /// Nothing matched; the registry is unchanged
    AlreadyAbsent,
}

/// Summary of a discovery merge
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub added: usize,
    pub updated: usize,
    /// Endpoints missing from this poll but retained for now
    pub stale: usize,
    pub removed: usize,
}

/// Desired state for one service, as supplied by config or discovery
#[derive(Debug, Clone, Default)]
pub struct ServiceUpdate {
    pub name: String,
    /// `None` keeps the current strategy (round-robin for new services)
    pub strategy: Option<LoadBalanceStrategy>,
    pub domain: Option<String>,
    pub kind: Option<String>,
    pub endpoints: Vec<EndpointSpec>,
}

impl From<&ServiceSpec> for ServiceUpdate {
    fn from(spec: &ServiceSpec) -> Self {
        Self {
            name: spec.name.clone(),
            strategy: Some(spec.strategy),
            domain: spec.domain.clone(),
            kind: spec.kind.clone(),
            endpoints: spec.endpoints.clone(),
        }
    }
}

/// Service-level metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceMeta {
    pub strategy: LoadBalanceStrategy,
    pub domain: Option<String>,
    pub kind: Option<String>,
}

/// A registered service and its endpoints
#[derive(Debug)]
pub struct ServiceEntry {
    name: String,
    meta: ArcSwap<ServiceMeta>,
    endpoints: ArcSwap<Vec<Arc<Endpoint>>>,
    total_requests: AtomicU64,
    degraded_selections: AtomicU64,
    /// Shared by round-robin and tie-breaking
    cursor: AtomicUsize,
}

impl ServiceEntry {
    fn new(name: &str, meta: ServiceMeta) -> Self {
        Self {
            name: name.to_string(),
            meta: ArcSwap::from_pointee(meta),
            endpoints: ArcSwap::from_pointee(Vec::new()),
            total_requests: AtomicU64::new(0),
            degraded_selections: AtomicU64::new(0),
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn meta(&self) -> Arc<ServiceMeta> {
        self.meta.load_full()
    }

    pub fn strategy(&self) -> LoadBalanceStrategy {
        self.meta.load().strategy
    }

    /// Stable snapshot of the endpoint list
    pub fn endpoints(&self) -> EndpointList {
        self.endpoints.load_full()
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn degraded_selections(&self) -> u64 {
        self.degraded_selections.load(Ordering::Relaxed)
    }

    pub(crate) fn note_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_degraded(&self) {
        self.degraded_selections.fetch_add(1, Ordering::Relaxed);
    }

    /// Advance the rotation cursor, returning its previous value
    pub(crate) fn next_cursor(&self) -> usize {
        self.cursor.fetch_add(1, Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> ServiceSnapshot {
        let meta = self.meta();
        let endpoints = self.endpoints();
        ServiceSnapshot {
            name: self.name.clone(),
            strategy: meta.strategy,
            domain: meta.domain.clone(),
            kind: meta.kind.clone(),
            total_requests: self.total_requests(),
            degraded_selections: self.degraded_selections(),
            healthy_endpoints: endpoints.iter().filter(|e| e.is_healthy()).count(),
            endpoints: endpoints.iter().map(|e| e.snapshot()).collect(),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct RegistryState {
    services: HashMap<String, Arc<ServiceEntry>>,
    by_domain: HashMap<String, BTreeSet<String>>,
    by_kind: HashMap<String, BTreeSet<String>>,
}

impl RegistryState {
    fn index(&mut self, name: &str, meta: &ServiceMeta) {
        if let Some(domain) = &meta.domain {
            self.by_domain
                .entry(domain.clone())
                .or_default()
                .insert(name.to_string());
        }
        if let Some(kind) = &meta.kind {
            self.by_kind
                .entry(kind.clone())
                .or_default()
                .insert(name.to_string());
        }
    }

    fn unindex(&mut self, name: &str, meta: &ServiceMeta) {
        if let Some(domain) = &meta.domain {
            if let Some(names) = self.by_domain.get_mut(domain) {
                names.remove(name);
                if names.is_empty() {
                    self.by_domain.remove(domain);
                }
            }
        }
        if let Some(kind) = &meta.kind {
            if let Some(names) = self.by_kind.get_mut(kind) {
                names.remove(name);
                if names.is_empty() {
                    self.by_kind.remove(kind);
                }
            }
        }
    }
}

fn validate_endpoint(service: &str, endpoint: &EndpointSpec) -> GatewayResult<()> {
    if service.trim().is_empty() {
        return Err(GatewayError::InvalidEndpoint(
            "service name must not be empty".to_string(),
        ));
    }
    if endpoint.host.trim().is_empty() || endpoint.port == 0 {
        return Err(GatewayError::InvalidEndpoint(format!(
            "{} is not a routable address",
            endpoint.addr()
        )));
    }
    Ok(())
}

/// Authoritative set of services and endpoints
pub struct ServiceRegistry {
    state: ArcSwap<RegistryState>,
    writer: Mutex<()>,
    breaker_config: CircuitBreakerConfig,
}

impl ServiceRegistry {
    /// Create an empty registry; new endpoints get breakers built from `breaker_config`
    pub fn new(breaker_config: CircuitBreakerConfig) -> Self {
        Self {
            state: ArcSwap::from_pointee(RegistryState::default()),
            writer: Mutex::new(()),
            breaker_config,
        }
    }

    /// Register every statically configured service
    pub async fn load_static(&self, services: &[ServiceSpec]) -> GatewayResult<()> {
        for spec in services {
            self.register_service(&ServiceUpdate::from(spec), EndpointOrigin::Static)
                .await?;
        }
        info!(services = services.len(), "Loaded static services");
        Ok(())
    }

    /// Create or update a service with its endpoints
    pub async fn register_service(
        &self,
        update: &ServiceUpdate,
        origin: EndpointOrigin,
    ) -> GatewayResult<Registration> {
        if update.name.trim().is_empty() {
            return Err(GatewayError::InvalidEndpoint(
                "service name must not be empty".to_string(),
            ));
        }
        for endpoint in &update.endpoints {
            validate_endpoint(&update.name, endpoint)?;
        }

        let _guard = self.writer.lock().await;
        let (entry, outcome) = self.upsert_service_locked(update);
        for endpoint in &update.endpoints {
            self.upsert_endpoint_locked(&entry, endpoint, origin);
        }

        debug!(
            service = %update.name,
            endpoints = update.endpoints.len(),
            outcome = ?outcome,
            "Registered service"
        );
        Ok(outcome)
    }

    /// Register an endpoint for a service, creating the service if needed.
    ///
    /// Re-registering an existing `host:port` updates its weight instead of
    /// adding a duplicate.
    pub async fn register(
        &self,
        service: &str,
        endpoint: EndpointSpec,
        origin: EndpointOrigin,
    ) -> GatewayResult<Registration> {
        let update = ServiceUpdate {
            name: service.to_string(),
            ..ServiceUpdate::default()
        };
        let (outcome, _) = self.register_with(&update, endpoint, origin).await?;
        Ok(outcome)
    }

    /// Register an endpoint and apply the service fields of `update` in one
    /// step. Readers never see the endpoint without the metadata or the other
    /// way round. `update.endpoints` is ignored.
    ///
    /// Returns the endpoint's outcome and the live endpoint.
    pub async fn register_with(
        &self,
        update: &ServiceUpdate,
        endpoint: EndpointSpec,
        origin: EndpointOrigin,
    ) -> GatewayResult<(Registration, Arc<Endpoint>)> {
        validate_endpoint(&update.name, &endpoint)?;

        let _guard = self.writer.lock().await;
        let (entry, _) = self.upsert_service_locked(update);
        let (outcome, registered) = self.upsert_endpoint_locked(&entry, &endpoint, origin);

        info!(
            service = %update.name,
            endpoint = %endpoint.addr(),
            weight = endpoint.weight,
            outcome = ?outcome,
            "Registered endpoint"
        );
        Ok((outcome, registered))
    }

    /// Remove one endpoint, or the whole service when `endpoint` is `None`.
    ///
    /// Removing the last endpoint removes the service entry.
    pub async fn deregister(
        &self,
        service: &str,
        endpoint: Option<(&str, u16)>,
    ) -> GatewayResult<Removal> {
        if service.trim().is_empty() {
            return Err(GatewayError::InvalidEndpoint(
                "service name must not be empty".to_string(),
            ));
        }

        let _guard = self.writer.lock().await;
        let Some(entry) = self.state.load().services.get(service).cloned() else {
            debug!(service = %service, "Deregister: service already absent");
            return Ok(Removal::AlreadyAbsent);
        };

        let outcome = match endpoint {
            None => {
                self.remove_service_locked(service);
                Removal::ServiceRemoved
            }
            Some((host, port)) => {
                let current = entry.endpoints();
                if !current.iter().any(|e| e.matches(host, port)) {
                    return Ok(Removal::AlreadyAbsent);
                }
                let remaining: Vec<Arc<Endpoint>> = current
                    .iter()
                    .filter(|e| !e.matches(host, port))
                    .cloned()
                    .collect();
                if remaining.is_empty() {
                    self.remove_service_locked(service);
                    Removal::ServiceRemoved
                } else {
                    entry.endpoints.store(Arc::new(remaining));
                    Removal::EndpointRemoved
                }
            }
        };

        info!(service = %service, outcome = ?outcome, "Deregistered");
        Ok(outcome)
    }

    /// Merge a successful discovery poll.
    ///
    /// New endpoints are added and known ones refreshed. Discovery-owned
    /// endpoints missing from the poll are marked stale and only removed once
    /// they have been missing for `stale_after` consecutive polls.
    pub async fn merge_discovered(&self, updates: &[ServiceUpdate], stale_after: u32) -> MergeReport {
        let mut report = MergeReport::default();
        let mut seen: HashMap<&str, HashSet<(&str, u16)>> = HashMap::new();

        let _guard = self.writer.lock().await;
        for update in updates {
            if update.name.trim().is_empty() {
                warn!("Discovery returned a service without a name, skipping");
                continue;
            }
            let (entry, _) = self.upsert_service_locked(update);
            let present = seen.entry(update.name.as_str()).or_default();
            for endpoint in &update.endpoints {
                if let Err(e) = validate_endpoint(&update.name, endpoint) {
                    warn!(service = %update.name, error = %e, "Skipping discovered endpoint");
                    continue;
                }
                match self.upsert_endpoint_locked(&entry, endpoint, EndpointOrigin::Discovery).0 {
                    Registration::Added => report.added += 1,
                    Registration::Updated => report.updated += 1,
                }
                present.insert((endpoint.host.as_str(), endpoint.port));
            }
        }

        let state = self.state.load_full();
        for (name, entry) in state.services.iter() {
            let present = seen.get(name.as_str());
            let current = entry.endpoints();
            let mut kept = Vec::with_capacity(current.len());
            let mut changed = false;

            for endpoint in current.iter() {
                let listed = present
                    .map(|p| p.contains(&(endpoint.host(), endpoint.port())))
                    .unwrap_or(false);
                if endpoint.origin() != EndpointOrigin::Discovery || listed {
                    kept.push(endpoint.clone());
                    continue;
                }

                let missing = endpoint.note_missing();
                if missing >= stale_after {
                    info!(
                        service = %name,
                        endpoint = %endpoint.addr(),
                        missing_polls = missing,
                        "Removing endpoint absent from discovery"
                    );
                    report.removed += 1;
                    changed = true;
                } else {
                    debug!(service = %name, endpoint = %endpoint.addr(), "Endpoint marked stale");
                    report.stale += 1;
                    kept.push(endpoint.clone());
                }
            }

            if changed {
                if kept.is_empty() {
                    self.remove_service_locked(name);
                } else {
                    entry.endpoints.store(Arc::new(kept));
                }
            }
        }

        report
    }

    fn upsert_service_locked(&self, update: &ServiceUpdate) -> (Arc<ServiceEntry>, Registration) {
        let current = self.state.load_full();

        if let Some(entry) = current.services.get(&update.name) {
            let old = entry.meta();
            let next = ServiceMeta {
                strategy: update.strategy.unwrap_or(old.strategy),
                domain: update.domain.clone().or_else(|| old.domain.clone()),
                kind: update.kind.clone().or_else(|| old.kind.clone()),
            };
            if next != *old {
                entry.meta.store(Arc::new(next.clone()));
                if next.domain != old.domain || next.kind != old.kind {
                    let mut state = (*current).clone();
                    state.unindex(&update.name, &old);
                    state.index(&update.name, &next);
                    self.state.store(Arc::new(state));
                }
            }
            return (entry.clone(), Registration::Updated);
        }

        let meta = ServiceMeta {
            strategy: update.strategy.unwrap_or_default(),
            domain: update.domain.clone(),
            kind: update.kind.clone(),
        };
        let entry = Arc::new(ServiceEntry::new(&update.name, meta.clone()));
        let mut state = (*current).clone();
        state.services.insert(update.name.clone(), entry.clone());
        state.index(&update.name, &meta);
        self.state.store(Arc::new(state));

        (entry, Registration::Added)
    }

    fn upsert_endpoint_locked(
        &self,
        entry: &ServiceEntry,
        spec: &EndpointSpec,
        origin: EndpointOrigin,
    ) -> (Registration, Arc<Endpoint>) {
        let current = entry.endpoints();
        if let Some(existing) = current.iter().find(|e| e.matches(&spec.host, spec.port)) {
            existing.set_weight(spec.weight);
            existing.claim(origin);
            existing.note_present();
            return (Registration::Updated, existing.clone());
        }

        let added = Arc::new(Endpoint::new(spec, origin, self.breaker_config));
        let mut next = Vec::with_capacity(current.len() + 1);
        next.extend(current.iter().cloned());
        next.push(added.clone());
        entry.endpoints.store(Arc::new(next));
        (Registration::Added, added)
    }

    fn remove_service_locked(&self, name: &str) {
        let current = self.state.load_full();
        let mut state = (*current).clone();
        if let Some(entry) = state.services.remove(name) {
            state.unindex(name, &entry.meta());
        }
        self.state.store(Arc::new(state));
    }

    /// Look up a service
    pub fn service(&self, name: &str) -> Option<Arc<ServiceEntry>> {
        self.state.load().services.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.state.load().services.contains_key(name)
    }

    /// Stable snapshot of a service's endpoints
    pub fn get_endpoints(&self, name: &str) -> Option<EndpointList> {
        self.service(name).map(|entry| entry.endpoints())
    }

    /// All service names, sorted
    pub fn service_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.load().services.keys().cloned().collect();
        names.sort();
        names
    }

    /// Services registered under a domain
    pub fn services_by_domain(&self, domain: &str) -> Vec<String> {
        self.state
            .load()
            .by_domain
            .get(domain)
            .map(|names| names.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Services registered under a type
    pub fn services_by_kind(&self, kind: &str) -> Vec<String> {
        self.state
            .load()
            .by_kind
            .get(kind)
            .map(|names| names.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Find a specific endpoint
    pub fn find_endpoint(&self, service: &str, host: &str, port: u16) -> GatewayResult<Arc<Endpoint>> {
        let entry = self
            .service(service)
            .ok_or_else(|| GatewayError::ServiceNotFound(service.to_string()))?;
        let endpoints = entry.endpoints();
        endpoints
            .iter()
            .find(|e| e.matches(host, port))
            .cloned()
            .ok_or_else(|| GatewayError::EndpointNotFound {
                service: service.to_string(),
                endpoint: format!("{}:{}", host, port),
            })
    }

    /// Change an endpoint's weight
    pub fn set_weight(&self, service: &str, host: &str, port: u16, weight: u32) -> GatewayResult<()> {
        let endpoint = self.find_endpoint(service, host, port)?;
        endpoint.set_weight(weight);
        info!(service = %service, endpoint = %endpoint.addr(), weight = weight, "Updated weight");
        Ok(())
    }

    /// Manually mark an endpoint healthy or unhealthy
    pub fn set_health(&self, service: &str, host: &str, port: u16, healthy: bool) -> GatewayResult<()> {
        let endpoint = self.find_endpoint(service, host, port)?;
        endpoint.force_health(healthy);
        info!(service = %service, endpoint = %endpoint.addr(), healthy = healthy, "Health set manually");
        Ok(())
    }

    /// Every endpoint with its service name, for the health monitor
    pub fn all_endpoints(&self) -> Vec<(String, Arc<Endpoint>)> {
        let state = self.state.load();
        state
            .services
            .iter()
            .flat_map(|(name, entry)| {
                entry
                    .endpoints()
                    .iter()
                    .map(|e| (name.clone(), e.clone()))
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Snapshot of every service, sorted by name
    pub fn snapshot(&self) -> Vec<ServiceSnapshot> {
        let mut services: Vec<ServiceSnapshot> = self
            .state
            .load()
            .services
            .values()
            .map(|entry| entry.snapshot())
            .collect();
        services.sort_by(|a, b| a.name.cmp(&b.name));
        services
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(name: &str, ports: &[u16]) -> ServiceUpdate {
        ServiceUpdate {
            name: name.to_string(),
            endpoints: ports
                .iter()
                .map(|p| EndpointSpec::new("127.0.0.1", *p))
                .collect(),
            ..ServiceUpdate::default()
        }
    }

    #[tokio::test]
    async fn test_register_and_get() {
        let registry = ServiceRegistry::default();
        let outcome = registry
            .register("users", EndpointSpec::new("127.0.0.1", 30000), EndpointOrigin::Admin)
            .await
            .unwrap();
        assert_eq!(outcome, Registration::Added);

        let endpoints = registry.get_endpoints("users").unwrap();
        assert_eq!(endpoints.len(), 1);
        assert_eq!(endpoints[0].port(), 30000);
    }

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let registry = ServiceRegistry::default();
        registry
            .register("users", EndpointSpec::new("127.0.0.1", 30000), EndpointOrigin::Admin)
            .await
            .unwrap();
        let outcome = registry
            .register(
                "users",
                EndpointSpec::new("127.0.0.1", 30000).with_weight(5),
                EndpointOrigin::Admin,
            )
            .await
            .unwrap();

        assert_eq!(outcome, Registration::Updated);
        let endpoints = registry.get_endpoints("users").unwrap();
        assert_eq!(endpoints.len(), 1);
        assert_eq!(endpoints[0].weight(), 5);
    }

    #[tokio::test]
    async fn test_register_rejects_invalid_endpoint() {
        let registry = ServiceRegistry::default();
        let err = registry
            .register("users", EndpointSpec::new("", 30000), EndpointOrigin::Admin)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidEndpoint(_)));
        assert!(!registry.contains("users"));
    }

    #[tokio::test]
    async fn test_register_with_applies_endpoint_and_metadata_together() {
        let registry = ServiceRegistry::default();
        let update = ServiceUpdate {
            name: "users".to_string(),
            strategy: Some(LoadBalanceStrategy::LeastConnections),
            domain: Some("identity".to_string()),
            kind: Some("http".to_string()),
            endpoints: Vec::new(),
        };
        let (outcome, endpoint) = registry
            .register_with(
                &update,
                EndpointSpec::new("127.0.0.1", 30000).with_weight(4),
                EndpointOrigin::Admin,
            )
            .await
            .unwrap();

        assert_eq!(outcome, Registration::Added);
        assert_eq!(endpoint.weight(), 4);
        let entry = registry.service("users").unwrap();
        assert_eq!(entry.strategy(), LoadBalanceStrategy::LeastConnections);
        assert_eq!(entry.meta().domain.as_deref(), Some("identity"));
        assert_eq!(registry.services_by_domain("identity"), vec!["users".to_string()]);
        assert!(Arc::ptr_eq(&endpoint, &registry.get_endpoints("users").unwrap()[0]));

        // Unset fields keep what the service already has
        let (outcome, _) = registry
            .register_with(
                &ServiceUpdate {
                    name: "users".to_string(),
                    ..ServiceUpdate::default()
                },
                EndpointSpec::new("127.0.0.1", 30000),
                EndpointOrigin::Admin,
            )
            .await
            .unwrap();
        assert_eq!(outcome, Registration::Updated);
        assert_eq!(entry.meta().kind.as_deref(), Some("http"));
    }

    #[tokio::test]
    async fn test_register_with_invalid_endpoint_leaves_no_service() {
        let registry = ServiceRegistry::default();
        let update = ServiceUpdate {
            name: "users".to_string(),
            domain: Some("identity".to_string()),
            ..ServiceUpdate::default()
        };
        let err = registry
            .register_with(&update, EndpointSpec::new("127.0.0.1", 0), EndpointOrigin::Admin)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidEndpoint(_)));
        assert!(!registry.contains("users"));
        assert!(registry.services_by_domain("identity").is_empty());
    }

    #[tokio::test]
    async fn test_deregister_last_endpoint_removes_service() {
        let registry = ServiceRegistry::default();
        registry
            .register_service(&update("users", &[30000, 30001]), EndpointOrigin::Static)
            .await
            .unwrap();

        let outcome = registry
            .deregister("users", Some(("127.0.0.1", 30000)))
            .await
            .unwrap();
        assert_eq!(outcome, Removal::EndpointRemoved);
        assert_eq!(registry.get_endpoints("users").unwrap().len(), 1);

        let outcome = registry
            .deregister("users", Some(("127.0.0.1", 30001)))
            .await
            .unwrap();
        assert_eq!(outcome, Removal::ServiceRemoved);
        assert!(registry.get_endpoints("users").is_none());
    }

    #[tokio::test]
    async fn test_deregister_absent_is_distinguished() {
        let registry = ServiceRegistry::default();
        assert_eq!(
            registry.deregister("ghost", None).await.unwrap(),
            Removal::AlreadyAbsent
        );

        registry
            .register_service(&update("users", &[30000]), EndpointOrigin::Static)
            .await
            .unwrap();
        assert_eq!(
            registry
                .deregister("users", Some(("127.0.0.1", 9)))
                .await
                .unwrap(),
            Removal::AlreadyAbsent
        );
        assert!(registry.deregister("", None).await.is_err());
    }

    #[tokio::test]
    async fn test_indexes_follow_deregistration() {
        let registry = ServiceRegistry::default();
        let mut svc = update("diagnosis", &[30000]);
        svc.domain = Some("health".to_string());
        svc.kind = Some("rest".to_string());
        registry
            .register_service(&svc, EndpointOrigin::Static)
            .await
            .unwrap();

        assert_eq!(registry.services_by_domain("health"), vec!["diagnosis"]);
        assert_eq!(registry.services_by_kind("rest"), vec!["diagnosis"]);

        registry.deregister("diagnosis", None).await.unwrap();
        assert!(registry.services_by_domain("health").is_empty());
        assert!(registry.services_by_kind("rest").is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_is_stable() {
        let registry = ServiceRegistry::default();
        registry
            .register_service(&update("users", &[30000]), EndpointOrigin::Static)
            .await
            .unwrap();

        let before = registry.get_endpoints("users").unwrap();
        registry
            .register("users", EndpointSpec::new("127.0.0.1", 30001), EndpointOrigin::Admin)
            .await
            .unwrap();

        assert_eq!(before.len(), 1);
        assert_eq!(registry.get_endpoints("users").unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_set_weight_and_health() {
        let registry = ServiceRegistry::default();
        registry
            .register_service(&update("users", &[30000]), EndpointOrigin::Static)
            .await
            .unwrap();

        registry.set_weight("users", "127.0.0.1", 30000, 7).unwrap();
        registry.set_health("users", "127.0.0.1", 30000, false).unwrap();

        let endpoint = registry.find_endpoint("users", "127.0.0.1", 30000).unwrap();
        assert_eq!(endpoint.weight(), 7);
        assert!(!endpoint.is_healthy());

        assert!(matches!(
            registry.set_weight("users", "127.0.0.1", 1, 1),
            Err(GatewayError::EndpointNotFound { .. })
        ));
        assert!(matches!(
            registry.set_health("ghost", "127.0.0.1", 1, true),
            Err(GatewayError::ServiceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_discovery_marks_stale_before_removing() {
        let registry = ServiceRegistry::default();
        registry
            .register_service(&update("users", &[30000]), EndpointOrigin::Static)
            .await
            .unwrap();

        let report = registry
            .merge_discovered(&[update("users", &[30001, 30002])], 2)
            .await;
        assert_eq!(report.added, 2);
        assert_eq!(registry.get_endpoints("users").unwrap().len(), 3);

        // 30002 disappears: first poll only marks it stale
        let report = registry.merge_discovered(&[update("users", &[30001])], 2).await;
        assert_eq!(report.stale, 1);
        assert_eq!(report.removed, 0);
        let stale = registry.find_endpoint("users", "127.0.0.1", 30002).unwrap();
        assert!(stale.is_stale());

        let report = registry.merge_discovered(&[update("users", &[30001])], 2).await;
        assert_eq!(report.removed, 1);

        let endpoints = registry.get_endpoints("users").unwrap();
        let ports: Vec<u16> = endpoints.iter().map(|e| e.port()).collect();
        assert_eq!(ports, vec![30000, 30001]);
    }

    #[tokio::test]
    async fn test_discovery_reappearance_clears_stale() {
        let registry = ServiceRegistry::default();
        registry.merge_discovered(&[update("orders", &[30000])], 2).await;
        registry.merge_discovered(&[], 2).await;

        let endpoint = registry.find_endpoint("orders", "127.0.0.1", 30000).unwrap();
        assert!(endpoint.is_stale());

        registry.merge_discovered(&[update("orders", &[30000])], 2).await;
        assert!(!endpoint.is_stale());

        registry.merge_discovered(&[], 2).await;
        registry.merge_discovered(&[], 2).await;
        assert!(!registry.contains("orders"));
    }
}
