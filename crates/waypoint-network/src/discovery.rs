//! Remote service discovery
//!
//! A discovery source returns the full desired set of services. The poller
//! merges each successful response into the registry; failed polls leave the
//! registry untouched and back off exponentially.

use crate::registry::{MergeReport, ServiceRegistry, ServiceUpdate};
use async_trait::async_trait;
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use waypoint_core::{telemetry, DiscoveryConfig, EndpointSpec, GatewayError, GatewayResult, LoadBalanceStrategy};

/// Document served by a discovery endpoint
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscoveryDocument {
    #[serde(default)]
    pub services: HashMap<String, DiscoveredService>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscoveredService {
    #[serde(default)]
    pub instances: Vec<EndpointSpec>,
    #[serde(default, rename = "loadBalanceStrategy", alias = "strategy")]
    pub strategy: Option<LoadBalanceStrategy>,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
}

impl DiscoveryDocument {
    /// Convert into registry updates, sorted by service name
    pub fn into_updates(self) -> Vec<ServiceUpdate> {
        let mut updates: Vec<ServiceUpdate> = self
            .services
            .into_iter()
            .map(|(name, service)| ServiceUpdate {
                name,
                strategy: service.strategy,
                domain: service.domain,
                kind: service.kind,
                endpoints: service.instances,
            })
            .collect();
        updates.sort_by(|a, b| a.name.cmp(&b.name));
        updates
    }
}

/// Where discovered services come from
#[async_trait]
pub trait DiscoverySource: Send + Sync {
    async fn fetch(&self) -> GatewayResult<DiscoveryDocument>;
}

/// Fetches the discovery document over HTTP
pub struct HttpDiscoverySource {
    client: reqwest::Client,
    url: String,
}

impl HttpDiscoverySource {
    pub fn new(url: impl Into<String>, timeout: Duration) -> GatewayResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::Discovery(format!("failed to build client: {}", e)))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl DiscoverySource for HttpDiscoverySource {
    async fn fetch(&self) -> GatewayResult<DiscoveryDocument> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| GatewayError::Discovery(format!("{}: {}", self.url, e)))?;

        if !response.status().is_success() {
            return Err(GatewayError::Discovery(format!(
                "{} answered {}",
                self.url,
                response.status()
            )));
        }

        response
            .json::<DiscoveryDocument>()
            .await
            .map_err(|e| GatewayError::Discovery(format!("invalid document from {}: {}", self.url, e)))
    }
}

/// Delay before the next attempt after `failures` consecutive failed polls
pub fn backoff_delay(config: &DiscoveryConfig, failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(20);
    let delay_ms = config.backoff_base_ms.saturating_mul(1u64 << exponent);
    Duration::from_millis(delay_ms.min(config.backoff_max_ms))
}

/// Periodically merges a discovery source into the registry
pub struct DiscoveryPoller {
    registry: Arc<ServiceRegistry>,
    source: Arc<dyn DiscoverySource>,
    config: DiscoveryConfig,
}

impl DiscoveryPoller {
    pub fn new(registry: Arc<ServiceRegistry>, source: Arc<dyn DiscoverySource>, config: DiscoveryConfig) -> Self {
        Self {
            registry,
            source,
            config,
        }
    }

    /// Fetch once and merge on success
    pub async fn poll_once(&self) -> GatewayResult<MergeReport> {
        let document = match self.source.fetch().await {
            Ok(document) => document,
            Err(e) => {
                counter!(telemetry::DISCOVERY_POLLS_TOTAL, "outcome" => "error").increment(1);
                return Err(e);
            }
        };
        let updates = document.into_updates();
        let report = self
            .registry
            .merge_discovered(&updates, self.config.stale_after_polls)
            .await;

        debug!(
            services = updates.len(),
            added = report.added,
            updated = report.updated,
            stale = report.stale,
            removed = report.removed,
            "Discovery poll merged"
        );
        counter!(telemetry::DISCOVERY_POLLS_TOTAL, "outcome" => "success").increment(1);
        Ok(report)
    }

    /// Poll until `token` is cancelled. Failures never stop the loop.
    pub fn spawn(self, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(interval_secs = self.config.interval_secs, "Discovery poller started");
            let mut failures: u32 = 0;

            loop {
                let delay = match self.poll_once().await {
                    Ok(_) => {
                        if failures > 0 {
                            info!(failed_polls = failures, "Discovery recovered");
                        }
                        failures = 0;
                        self.config.interval()
                    }
                    Err(e) => {
                        failures = failures.saturating_add(1);
                        let delay = backoff_delay(&self.config, failures);
                        warn!(
                            error = %e,
                            consecutive_failures = failures,
                            retry_in_ms = delay.as_millis() as u64,
                            "Discovery poll failed, keeping current registry"
                        );
                        delay
                    }
                };

                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            info!("Discovery poller stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use waypoint_core::EndpointOrigin;

    /// Replays a fixed sequence of poll outcomes
    struct ScriptedSource {
        responses: Mutex<VecDeque<GatewayResult<DiscoveryDocument>>>,
    }

    impl ScriptedSource {
        fn new(responses: Vec<GatewayResult<DiscoveryDocument>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
            }
        }
    }

    #[async_trait]
    impl DiscoverySource for ScriptedSource {
        async fn fetch(&self) -> GatewayResult<DiscoveryDocument> {
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(GatewayError::Discovery("script exhausted".to_string())))
        }
    }

    fn document(json: &str) -> DiscoveryDocument {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_parse_document() {
        let doc = document(
            r#"{"services": {"diagnosis": {
                "instances": [{"address": "10.0.0.5", "port": 8000, "weight": 2}],
                "loadBalanceStrategy": "weighted_random",
                "domain": "health",
                "type": "rest"
            }}}"#,
        );
        let updates = doc.into_updates();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].strategy, Some(LoadBalanceStrategy::Weighted));
        assert_eq!(updates[0].kind.as_deref(), Some("rest"));
        assert_eq!(updates[0].endpoints[0].host, "10.0.0.5");
        assert_eq!(updates[0].endpoints[0].weight, 2);
    }

    #[test]
    fn test_backoff_delay() {
        let config = DiscoveryConfig {
            backoff_base_ms: 1_000,
            backoff_max_ms: 5_000,
            ..DiscoveryConfig::default()
        };
        assert_eq!(backoff_delay(&config, 1), Duration::from_secs(1));
        assert_eq!(backoff_delay(&config, 2), Duration::from_secs(2));
        assert_eq!(backoff_delay(&config, 3), Duration::from_secs(4));
        assert_eq!(backoff_delay(&config, 4), Duration::from_secs(5));
        assert_eq!(backoff_delay(&config, 40), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_failed_poll_keeps_registry() {
        let registry = Arc::new(ServiceRegistry::default());
        let source = Arc::new(ScriptedSource::new(vec![
            Ok(document(
                r#"{"services": {"orders": {"instances": [{"host": "127.0.0.1", "port": 30000}]}}}"#,
            )),
            Err(GatewayError::Discovery("connection refused".to_string())),
        ]));
        let poller = DiscoveryPoller::new(registry.clone(), source, DiscoveryConfig::default());

        let report = poller.poll_once().await.unwrap();
        assert_eq!(report.added, 1);

        assert!(poller.poll_once().await.is_err());
        let endpoint = registry.find_endpoint("orders", "127.0.0.1", 30000).unwrap();
        assert!(!endpoint.is_stale());
        assert_eq!(endpoint.origin(), EndpointOrigin::Discovery);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_poller_survives_failures() {
        let registry = Arc::new(ServiceRegistry::default());
        let source = Arc::new(ScriptedSource::new(vec![
            Err(GatewayError::Discovery("down".to_string())),
            Ok(document(
                r#"{"services": {"orders": {"instances": [{"host": "127.0.0.1", "port": 30000}]}}}"#,
            )),
        ]));
        let config = DiscoveryConfig {
            backoff_base_ms: 100,
            ..DiscoveryConfig::default()
        };
        let token = CancellationToken::new();
        let handle = DiscoveryPoller::new(registry.clone(), source, config).spawn(token.clone());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(registry.contains("orders"));

        token.cancel();
        handle.await.unwrap();
    }
}
