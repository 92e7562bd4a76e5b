//! CLI commands implementation

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use waypoint_core::{EndpointSnapshot, LoadBalanceStrategy, RouteRule, ServiceSnapshot};

/// Client for the gateway's admin API
pub struct AdminClient {
    base_url: String,
    client: reqwest::Client,
}

impl AdminClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .context("building HTTP client")?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn endpoint_url(&self, service: &str, host: &str, port: u16) -> String {
        self.url(&format!(
            "/admin/services/{}/endpoints/{}/{}",
            service, host, port
        ))
    }
}

/// Error body returned by the admin API
#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

/// Turn a non-success response into an error carrying the API's message
async fn check(response: reqwest::Response, action: &str) -> Result<reqwest::Response> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    match serde_json::from_str::<ErrorBody>(&text) {
        Ok(body) => anyhow::bail!(
            "{} failed ({}): {} [{}]",
            action,
            status,
            body.error.message,
            body.error.code
        ),
        Err(_) => anyhow::bail!("{} failed ({}): {}", action, status, text),
    }
}

/// Endpoint registration body
#[derive(Debug, Serialize)]
pub struct RegisterRequest {
    pub host: String,
    pub port: u16,
    pub weight: u32,
    pub max_connections: u32,
    pub tls: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<LoadBalanceStrategy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RemovalResponse {
    outcome: String,
}

#[derive(Debug, Deserialize)]
struct CacheStats {
    hits: u64,
    misses: u64,
    entries: usize,
    evictions: u64,
}

#[derive(Debug, Deserialize)]
struct StatsResponse {
    routes: usize,
    requests: u64,
    rate_limited: u64,
    cache: CacheStats,
    services: Vec<ServiceSnapshot>,
}

/// Parse a strategy name the way the config file spells it
pub fn parse_strategy(value: &str) -> std::result::Result<LoadBalanceStrategy, String> {
    serde_json::from_value(serde_json::Value::String(value.to_string()))
        .map_err(|_| format!("unknown strategy '{}'", value))
}

/// List services
pub async fn services(
    client: &AdminClient,
    domain: Option<String>,
    kind: Option<String>,
) -> Result<()> {
    let mut query = Vec::new();
    if let Some(domain) = domain {
        query.push(("domain", domain));
    }
    if let Some(kind) = kind {
        query.push(("type", kind));
    }

    let response = client
        .client
        .get(client.url("/admin/services"))
        .query(&query)
        .send()
        .await?;
    let services: Vec<ServiceSnapshot> = check(response, "listing services").await?.json().await?;

    if services.is_empty() {
        println!("No services found");
        return Ok(());
    }

    println!(
        "{:<24} {:<18} {:<16} {:<10} {:<10}",
        "NAME", "STRATEGY", "DOMAIN", "HEALTHY", "REQUESTS"
    );
    println!("{}", "-".repeat(82));
    for svc in services {
        println!(
            "{:<24} {:<18} {:<16} {}/{:<8} {:<10}",
            svc.name,
            svc.strategy.to_string(),
            svc.domain.as_deref().unwrap_or("-"),
            svc.healthy_endpoints,
            svc.endpoints.len(),
            svc.total_requests
        );
    }

    Ok(())
}

/// Show one service
pub async fn service(client: &AdminClient, name: &str) -> Result<()> {
    let response = client
        .client
        .get(client.url(&format!("/admin/services/{}", name)))
        .send()
        .await?;
    let svc: ServiceSnapshot = check(response, "fetching service").await?.json().await?;

    println!("Service: {}", svc.name);
    println!("  Strategy: {}", svc.strategy);
    if let Some(domain) = &svc.domain {
        println!("  Domain: {}", domain);
    }
    if let Some(kind) = &svc.kind {
        println!("  Type: {}", kind);
    }
    println!("  Requests: {}", svc.total_requests);
    if svc.degraded_selections > 0 {
        println!("  Degraded selections: {}", svc.degraded_selections);
    }

    if !svc.endpoints.is_empty() {
        println!("\nEndpoints:");
        for ep in &svc.endpoints {
            print_endpoint(ep);
        }
    }

    Ok(())
}

/// Register or update an endpoint
pub async fn register(client: &AdminClient, service: &str, request: &RegisterRequest) -> Result<()> {
    let response = client
        .client
        .post(client.url(&format!("/admin/services/{}/endpoints", service)))
        .json(request)
        .send()
        .await?;
    let response = check(response, "registering endpoint").await?;
    let created = response.status() == reqwest::StatusCode::CREATED;
    let ep: EndpointSnapshot = response.json().await?;

    let verb = if created { "registered" } else { "updated" };
    println!("Endpoint {}:{} {} on '{}'", ep.host, ep.port, verb, service);
    Ok(())
}

/// Deregister an endpoint or a whole service
pub async fn deregister(
    client: &AdminClient,
    service: &str,
    endpoint: Option<(String, u16)>,
) -> Result<()> {
    match endpoint {
        Some((host, port)) => {
            let response = client
                .client
                .delete(client.endpoint_url(service, &host, port))
                .send()
                .await?;
            let removal: RemovalResponse =
                check(response, "deregistering endpoint").await?.json().await?;
            if removal.outcome == "service_removed" {
                println!(
                    "Endpoint {}:{} removed; '{}' had no endpoints left and was removed",
                    host, port, service
                );
            } else {
                println!("Endpoint {}:{} removed from '{}'", host, port, service);
            }
        }
        None => {
            let response = client
                .client
                .delete(client.url(&format!("/admin/services/{}", service)))
                .send()
                .await?;
            check(response, "deregistering service").await?;
            println!("Service '{}' removed", service);
        }
    }
    Ok(())
}

/// Change an endpoint's weight
pub async fn weight(
    client: &AdminClient,
    service: &str,
    host: &str,
    port: u16,
    weight: u32,
) -> Result<()> {
    let response = client
        .client
        .put(format!("{}/weight", client.endpoint_url(service, host, port)))
        .json(&serde_json::json!({ "weight": weight }))
        .send()
        .await?;
    let ep: EndpointSnapshot = check(response, "setting weight").await?.json().await?;
    println!("Endpoint {}:{} weight is now {}", ep.host, ep.port, ep.weight);
    Ok(())
}

/// Override an endpoint's health flag
pub async fn health(
    client: &AdminClient,
    service: &str,
    host: &str,
    port: u16,
    healthy: bool,
) -> Result<()> {
    let response = client
        .client
        .put(format!("{}/health", client.endpoint_url(service, host, port)))
        .json(&serde_json::json!({ "healthy": healthy }))
        .send()
        .await?;
    let ep: EndpointSnapshot = check(response, "setting health").await?.json().await?;
    println!(
        "Endpoint {}:{} marked {}",
        ep.host,
        ep.port,
        if ep.healthy { "healthy" } else { "unhealthy" }
    );
    Ok(())
}

/// Show routing statistics
pub async fn stats(client: &AdminClient) -> Result<()> {
    let response = client.client.get(client.url("/stats")).send().await?;
    let stats: StatsResponse = check(response, "fetching stats").await?.json().await?;

    println!("Routes: {}", stats.routes);
    println!("Requests: {}", stats.requests);
    println!("Rate limited: {}", stats.rate_limited);
    println!(
        "Cache: {} entries, {} hits, {} misses, {} evictions",
        stats.cache.entries, stats.cache.hits, stats.cache.misses, stats.cache.evictions
    );

    for svc in stats.services {
        println!("\n{} ({} requests)", svc.name, svc.total_requests);
        for ep in &svc.endpoints {
            print_endpoint(ep);
        }
    }

    Ok(())
}

/// Show the route table
pub async fn routes(client: &AdminClient) -> Result<()> {
    let response = client.client.get(client.url("/admin/routes")).send().await?;
    let rules: Vec<RouteRule> = check(response, "fetching routes").await?.json().await?;
    print_routes(&rules);
    Ok(())
}

/// Replace the route table from a file
pub async fn apply_routes(client: &AdminClient, path: &Path) -> Result<()> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let rules = parse_route_file(path, &text)?;

    let response = client
        .client
        .put(client.url("/admin/routes"))
        .json(&rules)
        .send()
        .await?;
    let installed: Vec<RouteRule> = check(response, "replacing routes").await?.json().await?;
    println!("Installed {} routes", installed.len());
    print_routes(&installed);
    Ok(())
}

/// Routes come from a JSON array, or the `[[routes]]` tables of a TOML file
fn parse_route_file(path: &Path, text: &str) -> Result<Vec<RouteRule>> {
    if path.extension().and_then(|e| e.to_str()) == Some("json") {
        return serde_json::from_str(text).context("parsing JSON route list");
    }

    #[derive(Deserialize)]
    struct RouteFile {
        #[serde(default)]
        routes: Vec<RouteRule>,
    }
    let file: RouteFile = toml::from_str(text).context("parsing TOML route file")?;
    Ok(file.routes)
}

fn print_routes(rules: &[RouteRule]) {
    if rules.is_empty() {
        println!("No routes configured");
        return;
    }
    println!(
        "{:<28} {:<20} {:<16} {:<10} {:<6}",
        "PREFIX", "SERVICE", "METHODS", "TIMEOUT", "CACHE"
    );
    println!("{}", "-".repeat(84));
    for rule in rules {
        let methods = if rule.methods.is_empty() {
            "*".to_string()
        } else {
            rule.methods.join(",")
        };
        println!(
            "{:<28} {:<20} {:<16} {:<10} {:<6}",
            rule.prefix,
            rule.service,
            methods,
            format!("{}ms", rule.timeout_ms),
            if rule.cache.enabled { "yes" } else { "no" }
        );
    }
}

fn print_endpoint(ep: &EndpointSnapshot) {
    println!(
        "  {}:{} weight={} {} circuit={} active={} ok={} failed={} ewma={:.1}ms{}",
        ep.host,
        ep.port,
        ep.weight,
        if ep.healthy { "healthy" } else { "unhealthy" },
        ep.circuit_state,
        ep.active_connections,
        ep.success_count,
        ep.failure_count,
        ep.response_time_ewma_ms,
        if ep.stale { " (stale)" } else { "" }
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_strategy() {
        assert_eq!(
            parse_strategy("least_connections").unwrap(),
            LoadBalanceStrategy::LeastConnections
        );
        assert_eq!(
            parse_strategy("round-robin").unwrap(),
            LoadBalanceStrategy::RoundRobin
        );
        assert_eq!(
            parse_strategy("ip_hash").unwrap(),
            LoadBalanceStrategy::ConsistentHash
        );
        assert!(parse_strategy("fastest").is_err());
    }

    #[test]
    fn test_parse_route_file_formats() {
        let json = r#"[{"prefix": "/api", "service": "users"}]"#;
        let rules = parse_route_file(Path::new("routes.json"), json).unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].service, "users");

        let toml = r#"
            [[routes]]
            prefix = "/api/orders"
            service = "orders"
            methods = ["GET"]

            [[routes]]
            prefix = "/api"
            service = "catalog"
        "#;
        let rules = parse_route_file(Path::new("waypoint.toml"), toml).unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].methods, vec!["GET".to_string()]);
    }

    #[test]
    fn test_register_request_omits_unset_metadata() {
        let request = RegisterRequest {
            host: "10.0.0.1".to_string(),
            port: 8000,
            weight: 2,
            max_connections: 1024,
            tls: false,
            strategy: None,
            domain: Some("billing".to_string()),
            kind: None,
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["domain"], "billing");
        assert!(value.get("strategy").is_none());
        assert!(value.get("type").is_none());
    }
}
