//! Administrative REST API handlers

use crate::error::{error_response, ApiError};
use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post, put},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;
use waypoint_core::{
    EndpointOrigin, EndpointSnapshot, EndpointSpec, GatewayError, LoadBalanceStrategy, RouteRule,
    ServiceSnapshot,
};
use waypoint_network::{Registration, Removal, ServiceUpdate};
use waypoint_router::{RequestRouter, RouterStats};

/// Application state shared across handlers
pub struct AppState {
    pub router: Arc<RequestRouter>,
    /// Prometheus recorder handle; `None` when no recorder is installed
    pub metrics: Option<PrometheusHandle>,
}

/// Create the admin API router
pub fn create_router(router: Arc<RequestRouter>, metrics: Option<PrometheusHandle>) -> Router {
    let state = Arc::new(AppState { router, metrics });

    Router::new()
        .route("/admin/services", get(list_services))
        .route(
            "/admin/services/:name",
            get(get_service).delete(delete_service),
        )
        .route("/admin/services/:name/endpoints", post(register_endpoint))
        .route(
            "/admin/services/:name/endpoints/:host/:port",
            axum::routing::delete(delete_endpoint),
        )
        .route(
            "/admin/services/:name/endpoints/:host/:port/weight",
            put(set_weight),
        )
        .route(
            "/admin/services/:name/endpoints/:host/:port/health",
            put(set_health),
        )
        .route("/admin/routes", get(get_routes).put(replace_routes))
        .route("/stats", get(get_stats))
        .route("/metrics", get(render_metrics))
        .route("/healthz", get(healthz))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Filters for the service listing
#[derive(Debug, Default, Deserialize)]
pub struct ServiceFilter {
    pub domain: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
}

/// List services, optionally narrowed by domain and/or type
async fn list_services(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<ServiceFilter>,
) -> Json<Vec<ServiceSnapshot>> {
    let registry = state.router.registry();

    let mut allowed: Option<BTreeSet<String>> = None;
    if let Some(domain) = &filter.domain {
        allowed = Some(registry.services_by_domain(domain).into_iter().collect());
    }
    if let Some(kind) = &filter.kind {
        let by_kind: BTreeSet<String> = registry.services_by_kind(kind).into_iter().collect();
        allowed = Some(match allowed {
            Some(names) => names.intersection(&by_kind).cloned().collect(),
            None => by_kind,
        });
    }

    let services = registry
        .snapshot()
        .into_iter()
        .filter(|s| allowed.as_ref().map_or(true, |names| names.contains(&s.name)))
        .collect();
    Json(services)
}

/// Get a specific service
async fn get_service(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<ServiceSnapshot>, ApiError> {
    let entry = state
        .router
        .registry()
        .service(&name)
        .ok_or(GatewayError::ServiceNotFound(name))?;
    Ok(Json(entry.snapshot()))
}

/// Deregister a whole service
async fn delete_service(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    info!(service = %name, "Deregistering service");

    match state.router.registry().deregister(&name, None).await? {
        Removal::AlreadyAbsent => Err(GatewayError::ServiceNotFound(name).into()),
        _ => Ok(StatusCode::NO_CONTENT),
    }
}

/// Request to register an endpoint
#[derive(Debug, Deserialize)]
pub struct RegisterEndpointRequest {
    #[serde(flatten)]
    pub endpoint: EndpointSpec,
    /// Optional service metadata, applied when present
    #[serde(default)]
    pub strategy: Option<LoadBalanceStrategy>,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
}

/// Register or update an endpoint
async fn register_endpoint(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(req): Json<RegisterEndpointRequest>,
) -> Result<(StatusCode, Json<EndpointSnapshot>), ApiError> {
    let update = ServiceUpdate {
        name,
        strategy: req.strategy,
        domain: req.domain,
        kind: req.kind,
        endpoints: Vec::new(),
    };
    let (outcome, endpoint) = state
        .router
        .registry()
        .register_with(&update, req.endpoint, EndpointOrigin::Admin)
        .await?;

    let snapshot = endpoint.snapshot();
    let status = match outcome {
        Registration::Added => StatusCode::CREATED,
        Registration::Updated => StatusCode::OK,
    };
    Ok((status, Json(snapshot)))
}

#[derive(Debug, Serialize)]
pub struct RemovalResponse {
    /// `endpoint_removed` or `service_removed`
    pub outcome: &'static str,
}

/// Deregister one endpoint
async fn delete_endpoint(
    State(state): State<Arc<AppState>>,
    Path((name, host, port)): Path<(String, String, u16)>,
) -> Result<Json<RemovalResponse>, ApiError> {
    info!(service = %name, host = %host, port = port, "Deregistering endpoint");

    let outcome = match state
        .router
        .registry()
        .deregister(&name, Some((&host, port)))
        .await?
    {
        Removal::EndpointRemoved => "endpoint_removed",
        Removal::ServiceRemoved => "service_removed",
        Removal::AlreadyAbsent => {
            return Err(GatewayError::EndpointNotFound {
                service: name,
                endpoint: format!("{}:{}", host, port),
            }
            .into())
        }
    };
    Ok(Json(RemovalResponse { outcome }))
}

#[derive(Debug, Deserialize)]
pub struct WeightRequest {
    pub weight: u32,
}

/// Update an endpoint's weight
async fn set_weight(
    State(state): State<Arc<AppState>>,
    Path((name, host, port)): Path<(String, String, u16)>,
    Json(req): Json<WeightRequest>,
) -> Result<Json<EndpointSnapshot>, ApiError> {
    let registry = state.router.registry();
    registry.set_weight(&name, &host, port, req.weight)?;
    Ok(Json(registry.find_endpoint(&name, &host, port)?.snapshot()))
}

#[derive(Debug, Deserialize)]
pub struct HealthRequest {
    pub healthy: bool,
}

/// Manually mark an endpoint healthy or unhealthy
async fn set_health(
    State(state): State<Arc<AppState>>,
    Path((name, host, port)): Path<(String, String, u16)>,
    Json(req): Json<HealthRequest>,
) -> Result<Json<EndpointSnapshot>, ApiError> {
    let registry = state.router.registry();
    registry.set_health(&name, &host, port, req.healthy)?;
    Ok(Json(registry.find_endpoint(&name, &host, port)?.snapshot()))
}

/// Current route table
async fn get_routes(State(state): State<Arc<AppState>>) -> Json<Vec<RouteRule>> {
    Json(state.router.routes().load().rules().to_vec())
}

/// Validate and swap in a new route table
async fn replace_routes(
    State(state): State<Arc<AppState>>,
    Json(rules): Json<Vec<RouteRule>>,
) -> Result<Json<Vec<RouteRule>>, ApiError> {
    info!(routes = rules.len(), "Replacing route table");
    let table = state.router.routes().reload(rules)?;
    Ok(Json(table.rules().to_vec()))
}

/// Routing statistics
async fn get_stats(State(state): State<Arc<AppState>>) -> Json<RouterStats> {
    Json(state.router.stats())
}

/// Prometheus text exposition of the gateway's metrics
async fn render_metrics(State(state): State<Arc<AppState>>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => error_response(
            StatusCode::NOT_FOUND,
            "metrics_disabled",
            "no metrics recorder is installed",
        ),
    }
}

/// Liveness response
#[derive(Debug, Serialize)]
pub struct HealthzResponse {
    pub status: &'static str,
    pub version: String,
}

async fn healthz() -> Json<HealthzResponse> {
    Json(HealthzResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}
