//! Request routing
//!
//! Per request: match a route, apply its rate limit, serve from cache when
//! possible, then forward with retries. Every attempt re-selects an endpoint,
//! passes through that endpoint's circuit breaker and reports its outcome
//! back to the breaker and the endpoint counters.

use crate::rate_limit::{RateLimiter, SlidingWindowLimiter};
use crate::route_table::SharedRouteTable;
use crate::upstream::{ProxyRequest, ProxyResponse, Upstream, UpstreamError};
use http::Method;
use metrics::{counter, histogram};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};
use waypoint_core::{telemetry, GatewayError, GatewayResult, RouteRule, ServiceSnapshot};
use waypoint_network::{CircuitPermit, Endpoint, LoadBalancer, ServiceRegistry};
use waypoint_store::{fingerprint, is_cacheable_status, CacheStats, CachedResponse, ResponseCache};

/// Methods that may be retried without an explicit opt-in
pub fn is_idempotent(method: &Method) -> bool {
    matches!(
        method.as_str(),
        "GET" | "HEAD" | "OPTIONS" | "PUT" | "DELETE" | "TRACE"
    )
}

/// How the cache took part in a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Miss,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStatus::Hit => "HIT",
            CacheStatus::Miss => "MISS",
        }
    }
}

/// Response returned to the inbound side
#[derive(Debug, Clone)]
pub struct RoutedResponse {
    pub response: ProxyResponse,
    /// `None` when the route does not cache
    pub cache: Option<CacheStatus>,
}

/// Routing statistics
#[derive(Debug, Clone, Serialize)]
pub struct RouterStats {
    pub routes: usize,
    pub requests: u64,
    pub rate_limited: u64,
    pub cache: CacheStats,
    pub services: Vec<ServiceSnapshot>,
}

/// Tracks one forwarded attempt.
///
/// If the attempt is dropped before `finish` (client went away, deadline hit)
/// it is recorded as a failure.
struct InFlight {
    endpoint: Arc<Endpoint>,
    permit: CircuitPermit,
    started: Instant,
    done: bool,
}

impl InFlight {
    fn start(endpoint: Arc<Endpoint>, permit: CircuitPermit) -> Self {
        endpoint.begin_request();
        Self {
            endpoint,
            permit,
            started: Instant::now(),
            done: false,
        }
    }

    fn finish(mut self, success: bool) {
        self.complete(success);
    }

    fn complete(&mut self, success: bool) {
        if self.done {
            return;
        }
        self.done = true;
        self.endpoint.end_request(success, self.started.elapsed());
        if success {
            self.endpoint.breaker().record_success(self.permit);
        } else {
            self.endpoint.breaker().record_failure(self.permit);
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if !self.done {
            debug!(endpoint = %self.endpoint.addr(), "Attempt abandoned, counting as failure");
            self.complete(false);
        }
    }
}

enum Outcome {
    Response(ProxyResponse),
    Failed(GatewayError),
}

/// Maps inbound requests to backend endpoints
pub struct RequestRouter {
    routes: Arc<SharedRouteTable>,
    balancer: Arc<LoadBalancer>,
    upstream: Arc<dyn Upstream>,
    cache: Arc<ResponseCache>,
    rate_limiter: Arc<dyn RateLimiter>,
    vary_headers: Vec<String>,
    default_deadline: Duration,
    requests: AtomicU64,
    rate_limited: AtomicU64,
}

impl RequestRouter {
    /// Create a new router
    pub fn new(
        routes: Arc<SharedRouteTable>,
        balancer: Arc<LoadBalancer>,
        upstream: Arc<dyn Upstream>,
        cache: Arc<ResponseCache>,
    ) -> Self {
        Self {
            routes,
            balancer,
            upstream,
            cache,
            rate_limiter: Arc::new(SlidingWindowLimiter::new()),
            vary_headers: Vec::new(),
            default_deadline: Duration::from_secs(60),
            requests: AtomicU64::new(0),
            rate_limited: AtomicU64::new(0),
        }
    }

    /// Replace the rate limiter consulted for routes declaring `rate_limit`
    pub fn with_rate_limiter(mut self, limiter: Arc<dyn RateLimiter>) -> Self {
        self.rate_limiter = limiter;
        self
    }

    /// Request headers that take part in cache fingerprints
    pub fn with_vary_headers(mut self, headers: Vec<String>) -> Self {
        self.vary_headers = headers;
        self
    }

    /// Deadline for routes that do not set `deadline_ms`
    pub fn with_default_deadline(mut self, deadline: Duration) -> Self {
        self.default_deadline = deadline;
        self
    }

    pub fn routes(&self) -> &Arc<SharedRouteTable> {
        &self.routes
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        self.balancer.registry()
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    /// Route one request
    pub async fn route(&self, request: ProxyRequest) -> GatewayResult<RoutedResponse> {
        self.requests.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        let method = request.method.clone();

        let result = self.dispatch(request).await;

        let status = match &result {
            Ok(routed) => routed.response.status,
            Err(e) => e.status_code(),
        };
        counter!(
            telemetry::REQUESTS_TOTAL,
            "method" => method.as_str().to_string(),
            "status" => status.to_string()
        )
        .increment(1);
        histogram!(telemetry::REQUEST_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
        result
    }

    async fn dispatch(&self, request: ProxyRequest) -> GatewayResult<RoutedResponse> {
        let table = self.routes.load();
        let rule = table.match_route(request.method.as_str(), &request.path)?;

        if let Some(limit) = &rule.rate_limit {
            if !self.rate_limiter.try_acquire(&rule.prefix, limit) {
                self.rate_limited.fetch_add(1, Ordering::Relaxed);
                counter!(telemetry::RATE_LIMITED_TOTAL, "route" => rule.prefix.clone()).increment(1);
                debug!(route = %rule.prefix, "Rate limit exceeded");
                return Err(GatewayError::RateLimited(rule.prefix.clone()));
            }
        }

        let cache_key = (rule.cache.enabled && request.method == Method::GET).then(|| {
            fingerprint(
                &request.method,
                &request.path,
                request.query.as_deref(),
                &request.headers,
                &self.vary_headers,
            )
        });

        if let Some(key) = &cache_key {
            if let Some(hit) = self.cache.get(key) {
                debug!(route = %rule.prefix, "Served from cache");
                return Ok(RoutedResponse {
                    response: ProxyResponse {
                        status: hit.status,
                        headers: hit.headers.clone(),
                        body: hit.body.clone(),
                    },
                    cache: Some(CacheStatus::Hit),
                });
            }
        }

        let upstream_path = rule.upstream_path(&request.path);
        let forward = ProxyRequest {
            path: upstream_path,
            ..request
        };
        let response = self.forward(rule, &forward).await?;

        if let Some(key) = &cache_key {
            if is_cacheable_status(response.status) {
                let stored = CachedResponse {
                    status: response.status,
                    headers: response.headers.clone(),
                    body: response.body.clone(),
                };
                if let Err(e) = self.cache.put(key, stored, rule.cache.ttl()) {
                    debug!(route = %rule.prefix, error = %e, "Response not cached");
                }
            }
        }

        Ok(RoutedResponse {
            response,
            cache: cache_key.map(|_| CacheStatus::Miss),
        })
    }

    async fn forward(&self, rule: &RouteRule, request: &ProxyRequest) -> GatewayResult<ProxyResponse> {
        let service = rule.service.as_str();
        let deadline = Instant::now()
            + rule
                .deadline_ms
                .map(Duration::from_millis)
                .unwrap_or(self.default_deadline);
        let may_retry = rule.retry.retry_non_idempotent || is_idempotent(&request.method);
        let affinity = request.affinity_key();
        let max_attempts = if may_retry {
            rule.retry.max_attempts.max(1)
        } else {
            1
        };

        let mut last: Option<Outcome> = None;
        for attempt in 1..=max_attempts {
            if attempt > 1 {
                let delay = rule.retry.backoff(attempt - 1);
                if Instant::now() + delay >= deadline {
                    debug!(service = %service, attempt = attempt, "Deadline leaves no room for retry");
                    break;
                }
                tokio::time::sleep(delay).await;
                counter!(telemetry::RETRIES_TOTAL, "service" => service.to_string()).increment(1);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let attempt_timeout = rule.timeout().min(remaining);

            let selection = match self
                .balancer
                .select_endpoint_for(service, affinity.as_deref(), |e| {
                    e.breaker().would_admit()
                })
            {
                Ok(selection) => selection,
                Err(e) => {
                    if matches!(e, GatewayError::CircuitOpen(_)) {
                        debug!(service = %service, "Circuit open, failing fast");
                    }
                    match last {
                        Some(_) => break,
                        None => return Err(e),
                    }
                }
            };
            let endpoint = selection.endpoint;

            // Another request may have taken the half-open trial since selection
            let Some(permit) = endpoint.breaker().try_acquire() else {
                debug!(service = %service, endpoint = %endpoint.addr(), "Circuit open, failing fast");
                match last {
                    Some(_) => break,
                    None => return Err(GatewayError::CircuitOpen(service.to_string())),
                }
            };

            let in_flight = InFlight::start(endpoint.clone(), permit);
            let result = match tokio::time::timeout(
                attempt_timeout,
                self.upstream.send(&endpoint, request, attempt_timeout),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(UpstreamError::Timeout),
            };
            let outcome = match &result {
                Ok(response) if response.status >= 500 => "server_error",
                Ok(_) => "response",
                Err(UpstreamError::Timeout) => "timeout",
                Err(UpstreamError::Connect(_)) => "connect_error",
            };
            counter!(
                telemetry::UPSTREAM_ATTEMPTS_TOTAL,
                "service" => service.to_string(),
                "outcome" => outcome
            )
            .increment(1);
            histogram!(telemetry::UPSTREAM_DURATION_SECONDS, "service" => service.to_string())
                .record(in_flight.started.elapsed().as_secs_f64());

            match result {
                Ok(response) => {
                    in_flight.finish(response.status < 500);
                    if rule.retry.is_retryable_status(response.status) && attempt < max_attempts {
                        debug!(
                            service = %service,
                            endpoint = %endpoint.addr(),
                            status = response.status,
                            attempt = attempt,
                            "Retryable status"
                        );
                        last = Some(Outcome::Response(response));
                        continue;
                    }
                    return Ok(response);
                }
                Err(err) => {
                    in_flight.finish(false);
                    warn!(
                        service = %service,
                        endpoint = %endpoint.addr(),
                        attempt = attempt,
                        error = %err,
                        "Upstream attempt failed"
                    );
                    last = Some(Outcome::Failed(match err {
                        UpstreamError::Timeout => GatewayError::DownstreamTimeout(service.to_string()),
                        UpstreamError::Connect(reason) => GatewayError::UpstreamUnavailable {
                            service: service.to_string(),
                            reason,
                        },
                    }));
                }
            }
        }

        match last {
            Some(Outcome::Response(response)) => Ok(response),
            Some(Outcome::Failed(e)) => Err(e),
            None => Err(GatewayError::DownstreamTimeout(service.to_string())),
        }
    }

    pub fn stats(&self) -> RouterStats {
        RouterStats {
            routes: self.routes.load().len(),
            requests: self.requests.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            cache: self.cache.stats(),
            services: self.registry().snapshot(),
        }
    }
}
