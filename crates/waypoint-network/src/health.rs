//! Active health checking for endpoints

use crate::endpoint::Endpoint;
use crate::registry::ServiceRegistry;
use async_trait::async_trait;
use futures::future::join_all;
use metrics::counter;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use waypoint_core::{telemetry, GatewayError, GatewayResult, HealthConfig};

/// Probe that decides whether an endpoint is currently serving
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, endpoint: &Endpoint) -> bool;
}

/// HTTP probe: `GET {endpoint}{path}` must answer 2xx
pub struct HttpHealthProbe {
    client: reqwest::Client,
    health_path: String,
    timeout: Duration,
}

impl HttpHealthProbe {
    /// Create a new HTTP probe
    pub fn new(health_path: impl Into<String>, timeout: Duration) -> GatewayResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::Internal(format!("failed to build health client: {}", e)))?;

        Ok(Self {
            client,
            health_path: health_path.into(),
            timeout,
        })
    }

    pub fn from_config(config: &HealthConfig) -> GatewayResult<Self> {
        Self::new(config.path.clone(), config.timeout())
    }

    /// Get the timeout duration
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self, endpoint: &Endpoint) -> bool {
        let url = format!("{}{}", endpoint.url(), self.health_path);

        match self.client.get(&url).send().await {
            Ok(response) => {
                let healthy = response.status().is_success();
                if healthy {
                    debug!(endpoint = %url, "Health check passed");
                } else {
                    debug!(
                        endpoint = %url,
                        status = %response.status(),
                        "Health check failed"
                    );
                }
                healthy
            }
            Err(e) => {
                debug!(endpoint = %url, error = %e, "Health check error");
                false
            }
        }
    }
}

/// Health state change caused by a probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthTransition {
    BecameHealthy,
    BecameUnhealthy,
}

/// Periodically probes every registered endpoint.
///
/// An endpoint flips to unhealthy after `unhealthy_threshold` consecutive
/// failed probes and back to healthy after `healthy_threshold` consecutive
/// successes.
pub struct HealthMonitor {
    registry: Arc<ServiceRegistry>,
    probe: Arc<dyn HealthProbe>,
    config: HealthConfig,
}

impl HealthMonitor {
    pub fn new(registry: Arc<ServiceRegistry>, probe: Arc<dyn HealthProbe>, config: HealthConfig) -> Self {
        Self {
            registry,
            probe,
            config,
        }
    }

    /// Probe every endpoint once, concurrently. Returns the transitions observed.
    pub async fn check_all(&self) -> Vec<(String, String, HealthTransition)> {
        let endpoints = self.registry.all_endpoints();
        let timeout = self.config.timeout();

        let checks = endpoints.iter().map(|(service, endpoint)| {
            let probe = self.probe.clone();
            async move {
                let ok = matches!(
                    tokio::time::timeout(timeout, probe.probe(endpoint)).await,
                    Ok(true)
                );
                self.apply_probe_result(service, endpoint, ok)
                    .map(|t| (service.clone(), endpoint.addr(), t))
            }
        });

        join_all(checks).await.into_iter().flatten().collect()
    }

    /// Fold one probe outcome into the endpoint's health state
    pub fn apply_probe_result(
        &self,
        service: &str,
        endpoint: &Endpoint,
        ok: bool,
    ) -> Option<HealthTransition> {
        if ok {
            let streak = endpoint.note_probe_success();
            if !endpoint.is_healthy() && streak >= self.config.healthy_threshold {
                endpoint.set_healthy(true);
                counter!(telemetry::HEALTH_TRANSITIONS_TOTAL, "state" => "healthy").increment(1);
                info!(service = %service, endpoint = %endpoint.addr(), "Endpoint healthy again");
                return Some(HealthTransition::BecameHealthy);
            }
        } else {
            let streak = endpoint.note_probe_failure();
            if endpoint.is_healthy() && streak >= self.config.unhealthy_threshold {
                endpoint.set_healthy(false);
                counter!(telemetry::HEALTH_TRANSITIONS_TOTAL, "state" => "unhealthy").increment(1);
                warn!(
                    service = %service,
                    endpoint = %endpoint.addr(),
                    consecutive_failures = streak,
                    "Endpoint marked unhealthy"
                );
                return Some(HealthTransition::BecameUnhealthy);
            }
        }
        None
    }

    /// Run the probe loop until `token` is cancelled
    pub fn spawn(self, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!(
                interval_secs = self.config.interval_secs,
                path = %self.config.path,
                "Health monitor started"
            );

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let transitions = self.check_all().await;
                        if !transitions.is_empty() {
                            debug!(transitions = transitions.len(), "Health round complete");
                        }
                    }
                }
            }

            info!("Health monitor stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ServiceUpdate;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use waypoint_core::{EndpointOrigin, EndpointSpec};

    /// Fails every endpoint whose port is in the set
    #[derive(Default)]
    struct ScriptedProbe {
        failing: Mutex<HashSet<u16>>,
    }

    impl ScriptedProbe {
        fn fail(&self, port: u16) {
            self.failing.lock().unwrap().insert(port);
        }

        fn recover(&self, port: u16) {
            self.failing.lock().unwrap().remove(&port);
        }
    }

    #[async_trait]
    impl HealthProbe for ScriptedProbe {
        async fn probe(&self, endpoint: &Endpoint) -> bool {
            !self.failing.lock().unwrap().contains(&endpoint.port())
        }
    }

    async fn monitor(config: HealthConfig) -> (Arc<ServiceRegistry>, Arc<ScriptedProbe>, HealthMonitor) {
        let registry = Arc::new(ServiceRegistry::default());
        registry
            .register_service(
                &ServiceUpdate {
                    name: "users".to_string(),
                    endpoints: vec![
                        EndpointSpec::new("127.0.0.1", 30000),
                        EndpointSpec::new("127.0.0.1", 30001),
                    ],
                    ..ServiceUpdate::default()
                },
                EndpointOrigin::Static,
            )
            .await
            .unwrap();
        let probe = Arc::new(ScriptedProbe::default());
        let monitor = HealthMonitor::new(registry.clone(), probe.clone(), config);
        (registry, probe, monitor)
    }

    #[test]
    fn test_http_probe_creation() {
        let probe = HttpHealthProbe::new("/health", Duration::from_secs(10)).unwrap();
        assert_eq!(probe.timeout(), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_unhealthy_after_threshold() {
        let config = HealthConfig {
            unhealthy_threshold: 2,
            ..HealthConfig::default()
        };
        let (registry, probe, monitor) = monitor(config).await;
        probe.fail(30001);

        assert!(monitor.check_all().await.is_empty());
        let endpoint = registry.find_endpoint("users", "127.0.0.1", 30001).unwrap();
        assert!(endpoint.is_healthy());

        let transitions = monitor.check_all().await;
        assert_eq!(transitions.len(), 1);
        assert_eq!(transitions[0].2, HealthTransition::BecameUnhealthy);
        assert!(!endpoint.is_healthy());
        assert!(endpoint.snapshot().last_health_check.is_some());
    }

    #[tokio::test]
    async fn test_recovers_after_healthy_threshold() {
        let config = HealthConfig {
            unhealthy_threshold: 1,
            healthy_threshold: 2,
            ..HealthConfig::default()
        };
        let (registry, probe, monitor) = monitor(config).await;
        let endpoint = registry.find_endpoint("users", "127.0.0.1", 30000).unwrap();

        probe.fail(30000);
        monitor.check_all().await;
        assert!(!endpoint.is_healthy());

        probe.recover(30000);
        monitor.check_all().await;
        assert!(!endpoint.is_healthy());
        monitor.check_all().await;
        assert!(endpoint.is_healthy());
    }

    #[tokio::test]
    async fn test_intermittent_failures_do_not_flip() {
        let config = HealthConfig {
            unhealthy_threshold: 3,
            ..HealthConfig::default()
        };
        let (registry, _probe, monitor) = monitor(config).await;
        let endpoint = registry.find_endpoint("users", "127.0.0.1", 30000).unwrap();

        for ok in [false, false, true, false, false] {
            monitor.apply_probe_result("users", &endpoint, ok);
        }
        assert!(endpoint.is_healthy());
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_monitor_stops_on_cancel() {
        let config = HealthConfig {
            interval_secs: 1,
            unhealthy_threshold: 1,
            ..HealthConfig::default()
        };
        let (registry, probe, monitor) = monitor(config).await;
        probe.fail(30000);

        let token = CancellationToken::new();
        let handle = monitor.spawn(token.clone());

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        let endpoint = registry.find_endpoint("users", "127.0.0.1", 30000).unwrap();
        assert!(!endpoint.is_healthy());

        token.cancel();
        handle.await.unwrap();
    }
}
