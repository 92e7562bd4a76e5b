//! End-to-end routing against real HTTP backends

use http::Method;
use std::sync::Arc;
use std::time::Duration;
use waypoint_core::{
    CacheConfig, CircuitBreakerConfig, CircuitState, EndpointOrigin, EndpointSpec, GatewayError,
    LoadBalanceStrategy, RetryPolicy, RouteRule, UpstreamConfig,
};
use waypoint_network::{
    DiscoverySource, HealthProbe, HttpDiscoverySource, HttpHealthProbe, LoadBalancer, SeededRandom,
    ServiceRegistry, ServiceUpdate,
};
use waypoint_router::{HttpUpstream, ProxyRequest, RequestRouter, RouteTable, SharedRouteTable};
use waypoint_store::ResponseCache;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn port_of(server: &MockServer) -> u16 {
    server.address().port()
}

async fn gateway(
    endpoints: Vec<EndpointSpec>,
    strategy: LoadBalanceStrategy,
    rule: RouteRule,
    breaker: CircuitBreakerConfig,
) -> (RequestRouter, Arc<ServiceRegistry>) {
    let registry = Arc::new(ServiceRegistry::new(breaker));
    registry
        .register_service(
            &ServiceUpdate {
                name: rule.service.clone(),
                strategy: Some(strategy),
                endpoints,
                ..ServiceUpdate::default()
            },
            EndpointOrigin::Static,
        )
        .await
        .unwrap();

    let balancer = Arc::new(LoadBalancer::with_random_source(
        registry.clone(),
        Arc::new(SeededRandom::new(42)),
    ));
    let routes = Arc::new(SharedRouteTable::new(RouteTable::new(vec![rule]).unwrap()));
    let upstream = Arc::new(HttpUpstream::new(&UpstreamConfig::default()).unwrap());
    let cache = Arc::new(ResponseCache::new(&CacheConfig::default()));
    (RequestRouter::new(routes, balancer, upstream, cache), registry)
}

async fn received(server: &MockServer) -> usize {
    server.received_requests().await.map(|r| r.len()).unwrap_or(0)
}

#[tokio::test]
async fn test_weighted_split_across_backends() {
    let heavy = MockServer::start().await;
    let light = MockServer::start().await;
    for server in [&heavy, &light] {
        Mock::given(method("GET"))
            .and(path("/api/users"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(server)
            .await;
    }

    let (router, _) = gateway(
        vec![
            EndpointSpec::new("127.0.0.1", port_of(&heavy)).with_weight(3),
            EndpointSpec::new("127.0.0.1", port_of(&light)).with_weight(1),
        ],
        LoadBalanceStrategy::Weighted,
        RouteRule::new("/api/users", "users"),
        CircuitBreakerConfig::default(),
    )
    .await;

    for _ in 0..800 {
        let routed = router
            .route(ProxyRequest::new(Method::GET, "/api/users"))
            .await
            .unwrap();
        assert_eq!(routed.response.status, 200);
    }

    let heavy_count = received(&heavy).await;
    assert_eq!(heavy_count + received(&light).await, 800);
    assert!(
        (540..=660).contains(&heavy_count),
        "heavy backend served {}",
        heavy_count
    );
}

#[tokio::test]
async fn test_circuit_opens_then_recovers() {
    let backend = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&backend)
        .await;

    let mut rule = RouteRule::new("/api", "orders");
    rule.retry = RetryPolicy::none();
    let (router, registry) = gateway(
        vec![EndpointSpec::new("127.0.0.1", port_of(&backend))],
        LoadBalanceStrategy::RoundRobin,
        rule,
        CircuitBreakerConfig {
            failure_threshold: 3,
            recovery_timeout_ms: 200,
        },
    )
    .await;

    for _ in 0..3 {
        let routed = router
            .route(ProxyRequest::new(Method::GET, "/api/orders"))
            .await
            .unwrap();
        assert_eq!(routed.response.status, 503);
    }

    let err = router
        .route(ProxyRequest::new(Method::GET, "/api/orders"))
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::CircuitOpen(_)));
    assert_eq!(err.status_code(), 502);
    assert_eq!(received(&backend).await, 3);

    backend.reset().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&backend)
        .await;
    tokio::time::sleep(Duration::from_millis(250)).await;

    let routed = router
        .route(ProxyRequest::new(Method::GET, "/api/orders"))
        .await
        .unwrap();
    assert_eq!(routed.response.status, 200);

    let endpoint = registry
        .find_endpoint("orders", "127.0.0.1", port_of(&backend))
        .unwrap();
    assert_eq!(endpoint.breaker().state(), CircuitState::Closed);
}

#[tokio::test]
async fn test_retry_moves_to_next_endpoint() {
    let failing = MockServer::start().await;
    let healthy = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&failing)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("served"))
        .mount(&healthy)
        .await;

    let mut rule = RouteRule::new("/api", "catalog");
    rule.retry.backoff_base_ms = 10;
    let (router, _) = gateway(
        vec![
            EndpointSpec::new("127.0.0.1", port_of(&failing)),
            EndpointSpec::new("127.0.0.1", port_of(&healthy)),
        ],
        LoadBalanceStrategy::RoundRobin,
        rule,
        CircuitBreakerConfig::default(),
    )
    .await;

    let routed = router
        .route(ProxyRequest::new(Method::GET, "/api/items"))
        .await
        .unwrap();
    assert_eq!(routed.response.status, 200);
    assert_eq!(&routed.response.body[..], b"served");
    assert_eq!(received(&failing).await, 1);
}

#[tokio::test]
async fn test_slow_backend_times_out() {
    let backend = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
        .mount(&backend)
        .await;

    let mut rule = RouteRule::new("/api", "slow");
    rule.timeout_ms = 100;
    rule.retry = RetryPolicy::none();
    let (router, _) = gateway(
        vec![EndpointSpec::new("127.0.0.1", port_of(&backend))],
        LoadBalanceStrategy::RoundRobin,
        rule,
        CircuitBreakerConfig::default(),
    )
    .await;

    let err = router
        .route(ProxyRequest::new(Method::GET, "/api/report"))
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::DownstreamTimeout(_)));
    assert_eq!(err.status_code(), 504);
}

#[tokio::test]
async fn test_unreachable_backend_is_502() {
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    let mut rule = RouteRule::new("/api", "gone");
    rule.retry = RetryPolicy::none();
    let (router, _) = gateway(
        vec![EndpointSpec::new("127.0.0.1", port)],
        LoadBalanceStrategy::RoundRobin,
        rule,
        CircuitBreakerConfig::default(),
    )
    .await;

    let err = router
        .route(ProxyRequest::new(Method::GET, "/api/x"))
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::UpstreamUnavailable { .. }));
    assert_eq!(err.status_code(), 502);
}

#[tokio::test]
async fn test_http_health_probe() {
    let up = MockServer::start().await;
    let down = MockServer::start().await;
    Mock::given(path("/health"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&up)
        .await;
    Mock::given(path("/health"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&down)
        .await;

    let registry = ServiceRegistry::default();
    registry
        .register_service(
            &ServiceUpdate {
                name: "probe".to_string(),
                endpoints: vec![
                    EndpointSpec::new("127.0.0.1", port_of(&up)),
                    EndpointSpec::new("127.0.0.1", port_of(&down)),
                ],
                ..ServiceUpdate::default()
            },
            EndpointOrigin::Static,
        )
        .await
        .unwrap();

    let probe = HttpHealthProbe::new("/health", Duration::from_secs(2)).unwrap();
    let up_endpoint = registry.find_endpoint("probe", "127.0.0.1", port_of(&up)).unwrap();
    let down_endpoint = registry
        .find_endpoint("probe", "127.0.0.1", port_of(&down))
        .unwrap();
    assert!(probe.probe(&up_endpoint).await);
    assert!(!probe.probe(&down_endpoint).await);
}

#[tokio::test]
async fn test_http_discovery_source() {
    let registry_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/services"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "services": {
                "diagnosis": {
                    "instances": [{"host": "10.0.0.5", "port": 8000}],
                    "loadBalanceStrategy": "least_connections",
                    "domain": "health"
                }
            }
        })))
        .mount(&registry_server)
        .await;

    let source = HttpDiscoverySource::new(
        format!("{}/services", registry_server.uri()),
        Duration::from_secs(2),
    )
    .unwrap();
    let updates = source.fetch().await.unwrap().into_updates();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].name, "diagnosis");
    assert_eq!(updates[0].strategy, Some(LoadBalanceStrategy::LeastConnections));

    let unreachable = HttpDiscoverySource::new(
        format!("{}/missing", registry_server.uri()),
        Duration::from_secs(2),
    )
    .unwrap();
    assert!(matches!(
        unreachable.fetch().await,
        Err(GatewayError::Discovery(_))
    ));
}
