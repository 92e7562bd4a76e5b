//! Gateway assembly and background task lifecycle

use crate::route_table::{RouteTable, SharedRouteTable};
use crate::router::RequestRouter;
use crate::upstream::{HttpUpstream, Upstream};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use waypoint_core::{GatewayConfig, GatewayResult};
use waypoint_network::{
    DiscoveryPoller, HealthMonitor, HealthProbe, HttpDiscoverySource, HttpHealthProbe, LoadBalancer,
    ServiceRegistry,
};
use waypoint_store::ResponseCache;

/// A running gateway core: registry, router and the periodic tasks that
/// keep them current.
pub struct Gateway {
    registry: Arc<ServiceRegistry>,
    router: Arc<RequestRouter>,
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Gateway {
    /// Build everything from config and start health checks, discovery
    /// polling and cache sweeping
    pub async fn start(config: &GatewayConfig) -> GatewayResult<Self> {
        let upstream = Arc::new(HttpUpstream::new(&config.upstream)?);
        let probe = Arc::new(HttpHealthProbe::from_config(&config.health)?);
        Self::start_with(config, upstream, probe).await
    }

    /// Like [`Gateway::start`] with caller-supplied forwarding and probing
    pub async fn start_with(
        config: &GatewayConfig,
        upstream: Arc<dyn Upstream>,
        probe: Arc<dyn HealthProbe>,
    ) -> GatewayResult<Self> {
        config.validate()?;

        let registry = Arc::new(ServiceRegistry::new(config.circuit_breaker));
        registry.load_static(&config.services).await?;

        let routes = Arc::new(SharedRouteTable::new(RouteTable::new(config.routes.clone())?));
        let cache = Arc::new(ResponseCache::new(&config.cache));
        let balancer = Arc::new(LoadBalancer::new(registry.clone()));
        let router = Arc::new(
            RequestRouter::new(routes, balancer, upstream, cache.clone())
                .with_vary_headers(config.cache.vary_headers.clone())
                .with_default_deadline(config.upstream.request_deadline()),
        );

        let token = CancellationToken::new();
        let mut tasks = vec![cache.spawn_sweeper(token.child_token())];

        if config.health.enabled {
            let monitor = HealthMonitor::new(registry.clone(), probe, config.health.clone());
            tasks.push(monitor.spawn(token.child_token()));
        }

        if let Some(url) = &config.discovery.url {
            let source = Arc::new(HttpDiscoverySource::new(url.clone(), config.discovery.timeout())?);
            let poller = DiscoveryPoller::new(registry.clone(), source, config.discovery.clone());
            tasks.push(poller.spawn(token.child_token()));
        }

        info!(
            services = config.services.len(),
            routes = config.routes.len(),
            health_checks = config.health.enabled,
            discovery = config.discovery.url.is_some(),
            "Gateway started"
        );

        Ok(Self {
            registry,
            router,
            token,
            tasks,
        })
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    pub fn router(&self) -> &Arc<RequestRouter> {
        &self.router
    }

    /// Number of background tasks still attached
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Stop every background task and wait for them to finish
    pub async fn shutdown(self) {
        info!("Shutting down gateway");
        self.token.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
        info!("Gateway stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::CacheStatus;
    use crate::upstream::{ProxyRequest, ProxyResponse, UpstreamError};
    use async_trait::async_trait;
    use bytes::Bytes;
    use http::{HeaderMap, Method};
    use std::time::Duration;
    use waypoint_network::Endpoint;

    struct Echo;

    #[async_trait]
    impl Upstream for Echo {
        async fn send(
            &self,
            endpoint: &Endpoint,
            request: &ProxyRequest,
            _timeout: Duration,
        ) -> Result<ProxyResponse, UpstreamError> {
            Ok(ProxyResponse {
                status: 200,
                headers: HeaderMap::new(),
                body: Bytes::from(format!("{} {}", endpoint.port(), request.path)),
            })
        }
    }

    struct AlwaysUp;

    #[async_trait]
    impl HealthProbe for AlwaysUp {
        async fn probe(&self, _endpoint: &Endpoint) -> bool {
            true
        }
    }

    const CONFIG: &str = r#"
[[services]]
name = "users"
endpoints = [{ host = "127.0.0.1", port = 30000 }]

[[routes]]
prefix = "/api/users"
service = "users"
strip_prefix = true
"#;

    #[tokio::test]
    async fn test_start_route_and_shutdown() {
        let config = GatewayConfig::from_toml_str(CONFIG).unwrap();
        let gateway = Gateway::start_with(&config, Arc::new(Echo), Arc::new(AlwaysUp))
            .await
            .unwrap();
        assert_eq!(gateway.task_count(), 2);

        let routed = gateway
            .router()
            .route(ProxyRequest::new(Method::GET, "/api/users/7"))
            .await
            .unwrap();
        assert_eq!(routed.response.body, Bytes::from_static(b"30000 /7"));

        gateway.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_config_fails_startup() {
        let mut config = GatewayConfig::from_toml_str(CONFIG).unwrap();
        config.routes[0].prefix = "api".to_string();
        assert!(Gateway::start_with(&config, Arc::new(Echo), Arc::new(AlwaysUp))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_cached_responses_not_shared_across_credentials() {
        let mut config = GatewayConfig::from_toml_str(CONFIG).unwrap();
        config.routes[0].cache.enabled = true;
        let gateway = Gateway::start_with(&config, Arc::new(Echo), Arc::new(AlwaysUp))
            .await
            .unwrap();

        let as_user = |token: &'static str| {
            let mut request = ProxyRequest::new(Method::GET, "/api/users/me");
            request
                .headers
                .insert("authorization", http::HeaderValue::from_static(token));
            request
        };

        let router = gateway.router();
        let first = router.route(as_user("Bearer alice")).await.unwrap();
        assert_eq!(first.cache, Some(CacheStatus::Miss));
        let other = router.route(as_user("Bearer bob")).await.unwrap();
        assert_eq!(other.cache, Some(CacheStatus::Miss));
        let repeat = router.route(as_user("Bearer alice")).await.unwrap();
        assert_eq!(repeat.cache, Some(CacheStatus::Hit));

        gateway.shutdown().await;
    }
}
