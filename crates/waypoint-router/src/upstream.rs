//! Forwarding requests to backend endpoints

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{self, HeaderName};
use http::{HeaderMap, Method};
use std::net::IpAddr;
use std::time::Duration;
use tracing::debug;
use waypoint_core::{GatewayError, GatewayResult, UpstreamConfig};
use waypoint_network::Endpoint;

/// Headers that describe a single connection and are never forwarded
static HOP_BY_HOP: [HeaderName; 9] = [
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
    header::HOST,
    header::CONTENT_LENGTH,
];

/// Copy `headers` without hop-by-hop entries
pub fn strip_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if HOP_BY_HOP.contains(name) || name.as_str() == "keep-alive" {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

/// An inbound request as seen by the router
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Peer address of the inbound connection, when known
    pub client_addr: Option<IpAddr>,
}

impl ProxyRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: None,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            client_addr: None,
        }
    }

    /// Key for session affinity.
    ///
    /// Checked in order: the `x-user-id` header, a `user_id` query parameter,
    /// the first `x-forwarded-for` hop, then the connection's peer address.
    pub fn affinity_key(&self) -> Option<String> {
        let header = |name: &str| {
            self.headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
        };

        if let Some(user) = header("x-user-id") {
            return Some(user.to_string());
        }
        let from_query = self.query.as_deref().and_then(|query| {
            query.split('&').find_map(|pair| {
                let (name, value) = pair.split_once('=')?;
                (name == "user_id" && !value.is_empty()).then(|| value.to_string())
            })
        });
        if from_query.is_some() {
            return from_query;
        }
        if let Some(hop) = header("x-forwarded-for")
            .and_then(|chain| chain.split(',').next())
            .map(str::trim)
            .filter(|hop| !hop.is_empty())
        {
            return Some(hop.to_string());
        }
        self.client_addr.map(|ip| ip.to_string())
    }
}

/// A backend response
#[derive(Debug, Clone)]
pub struct ProxyResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Why a forward attempt produced no response
#[derive(Debug, Clone, thiserror::Error)]
pub enum UpstreamError {
    #[error("timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connect(String),
}

/// Sends one attempt to one endpoint
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn send(
        &self,
        endpoint: &Endpoint,
        request: &ProxyRequest,
        timeout: Duration,
    ) -> Result<ProxyResponse, UpstreamError>;
}

/// HTTP forwarding over a pooled reqwest client
pub struct HttpUpstream {
    client: reqwest::Client,
}

impl HttpUpstream {
    pub fn new(config: &UpstreamConfig) -> GatewayResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| GatewayError::Internal(format!("failed to build upstream client: {}", e)))?;
        Ok(Self { client })
    }
}

fn classify(err: reqwest::Error) -> UpstreamError {
    if err.is_timeout() {
        UpstreamError::Timeout
    } else {
        UpstreamError::Connect(err.to_string())
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn send(
        &self,
        endpoint: &Endpoint,
        request: &ProxyRequest,
        timeout: Duration,
    ) -> Result<ProxyResponse, UpstreamError> {
        let mut url = format!("{}{}", endpoint.url(), request.path);
        if let Some(query) = request.query.as_deref().filter(|q| !q.is_empty()) {
            url.push('?');
            url.push_str(query);
        }

        debug!(method = %request.method, url = %url, "Forwarding request");

        let response = self
            .client
            .request(request.method.clone(), &url)
            .headers(strip_hop_by_hop(&request.headers))
            .body(request.body.clone())
            .timeout(timeout)
            .send()
            .await
            .map_err(classify)?;

        let status = response.status().as_u16();
        let headers = strip_hop_by_hop(response.headers());
        let body = response.bytes().await.map_err(classify)?;

        Ok(ProxyResponse {
            status,
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    #[test]
    fn test_strip_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert(header::HOST, HeaderValue::from_static("gateway.local"));
        headers.insert(header::ACCEPT, HeaderValue::from_static("application/json"));
        headers.append("x-tag", HeaderValue::from_static("a"));
        headers.append("x-tag", HeaderValue::from_static("b"));

        let stripped = strip_hop_by_hop(&headers);
        assert!(stripped.get(header::CONNECTION).is_none());
        assert!(stripped.get("keep-alive").is_none());
        assert!(stripped.get(header::HOST).is_none());
        assert_eq!(stripped.get(header::ACCEPT).unwrap(), "application/json");
        assert_eq!(stripped.get_all("x-tag").iter().count(), 2);
    }

    #[test]
    fn test_affinity_key_precedence() {
        let mut request = ProxyRequest::new(Method::GET, "/api/cart");
        assert_eq!(request.affinity_key(), None);

        request.client_addr = Some("192.0.2.7".parse().unwrap());
        assert_eq!(request.affinity_key().as_deref(), Some("192.0.2.7"));

        request
            .headers
            .insert("x-forwarded-for", HeaderValue::from_static("203.0.113.9, 10.0.0.1"));
        assert_eq!(request.affinity_key().as_deref(), Some("203.0.113.9"));

        request.query = Some("page=2&user_id=u-17".to_string());
        assert_eq!(request.affinity_key().as_deref(), Some("u-17"));

        request.headers.insert("x-user-id", HeaderValue::from_static("u-42"));
        assert_eq!(request.affinity_key().as_deref(), Some("u-42"));
    }

    #[test]
    fn test_affinity_key_ignores_empty_values() {
        let mut request = ProxyRequest::new(Method::GET, "/api/cart");
        request.headers.insert("x-user-id", HeaderValue::from_static(""));
        request.query = Some("user_id=".to_string());
        request.client_addr = Some("::1".parse().unwrap());
        assert_eq!(request.affinity_key().as_deref(), Some("::1"));
    }
}
