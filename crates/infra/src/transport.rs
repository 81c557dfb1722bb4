//! Outbound HTTP transport.
//!
//! Every call is single-shot and bounded by the per-request timeout.
//! Redirects are never followed: a 3xx answer is returned as-is and counts
//! as a non-success outcome. Response bodies are read only up to the
//! request's `max_body_bytes`; the rest is discarded unread.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::redirect::Policy;

use cmis_webhooks::protocol::DEFAULT_USER_AGENT;

use crate::error::TransportError;

/// Response bytes kept when the caller sets no tighter bound.
pub const DEFAULT_MAX_BODY_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

/// A fully assembled outbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundRequest {
    pub method: HttpMethod,
    pub url: String,
    /// Appended to the URL's query string.
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
    pub timeout: Duration,
    /// Upper bound on response body bytes read.
    pub max_body_bytes: usize,
}

impl OutboundRequest {
    pub fn get(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            method: HttpMethod::Get,
            url: url.into(),
            query: Vec::new(),
            headers: Vec::new(),
            body: None,
            timeout,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }

    pub fn post(url: impl Into<String>, body: String, timeout: Duration) -> Self {
        Self {
            method: HttpMethod::Post,
            url: url.into(),
            query: Vec::new(),
            headers: Vec::new(),
            body: Some(body),
            timeout,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }

    pub fn query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn max_body_bytes(mut self, limit: usize) -> Self {
        self.max_body_bytes = limit;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: OutboundRequest) -> Result<HttpResponse, TransportError>;
}

#[async_trait]
impl<T: HttpTransport + ?Sized> HttpTransport for std::sync::Arc<T> {
    async fn send(&self, request: OutboundRequest) -> Result<HttpResponse, TransportError> {
        (**self).send(request).await
    }
}

/// [`HttpTransport`] backed by a shared `reqwest` client.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(user_agent: &str) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .redirect(Policy::none())
            .build()
            .map_err(|e| {
                TransportError::InvalidRequest(format!("failed to build http client: {e}"))
            })?;
        Ok(Self { client })
    }

    pub fn with_default_user_agent() -> Result<Self, TransportError> {
        Self::new(DEFAULT_USER_AGENT)
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: OutboundRequest) -> Result<HttpResponse, TransportError> {
        let OutboundRequest {
            method,
            url,
            query,
            headers,
            body,
            timeout,
            max_body_bytes,
        } = request;

        let mut builder = match method {
            HttpMethod::Get => self.client.get(&url),
            HttpMethod::Post => self.client.post(&url),
        };
        if !query.is_empty() {
            builder = builder.query(&query);
        }
        for (name, value) in &headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = body {
            builder = builder.body(body);
        }

        let response = builder
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| classify(e, timeout))?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = read_body(response, max_body_bytes)
            .await
            .map_err(|e| classify(e, timeout))?;

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

/// Read at most `limit` bytes of the body, decoding lossily.
async fn read_body(
    mut response: reqwest::Response,
    limit: usize,
) -> Result<String, reqwest::Error> {
    let mut buf: Vec<u8> = Vec::new();
    while buf.len() < limit {
        let Some(chunk) = response.chunk().await? else {
            break;
        };
        let take = chunk.len().min(limit - buf.len());
        buf.extend_from_slice(&chunk[..take]);
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

fn classify(err: reqwest::Error, timeout: Duration) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout(timeout)
    } else if err.is_connect() {
        TransportError::Connect(err.to_string())
    } else if err.is_builder() {
        TransportError::InvalidRequest(err.to_string())
    } else {
        TransportError::Request(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    #[tokio::test]
    async fn does_not_follow_redirects() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .respond_with(
                ResponseTemplate::new(302).insert_header("location", "https://evil.example"),
            )
            .mount(&server)
            .await;

        let transport = ReqwestTransport::with_default_user_agent().unwrap();
        let response = transport
            .send(OutboundRequest::post(
                format!("{}/hook", server.uri()),
                "{}".to_string(),
                Duration::from_secs(5),
            ))
            .await
            .unwrap();

        assert_eq!(response.status, 302);
        assert!(!response.is_success());
    }

    #[tokio::test]
    async fn sends_query_and_headers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/verify"))
            .and(query_param("hub_mode", "subscribe"))
            .and(header("user-agent", "Acme-Hooks/1.0"))
            .respond_with(ResponseTemplate::new(200).set_body_string("pong"))
            .expect(1)
            .mount(&server)
            .await;

        let transport = ReqwestTransport::new("Acme-Hooks/1.0").unwrap();
        let response = transport
            .send(
                OutboundRequest::get(format!("{}/verify", server.uri()), Duration::from_secs(5))
                    .query("hub_mode", "subscribe"),
            )
            .await
            .unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(response.body, "pong");
    }

    #[tokio::test]
    async fn large_bodies_are_read_up_to_the_limit() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("x".repeat(256 * 1024)))
            .mount(&server)
            .await;

        let transport = ReqwestTransport::with_default_user_agent().unwrap();
        let response = transport
            .send(
                OutboundRequest::post(server.uri(), String::new(), Duration::from_secs(5))
                    .max_body_bytes(10),
            )
            .await
            .unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body, "x".repeat(10));

        let response = transport
            .send(OutboundRequest::post(server.uri(), String::new(), Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(response.body.len(), DEFAULT_MAX_BODY_BYTES);
    }

    #[tokio::test]
    async fn slow_endpoint_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(1500)))
            .mount(&server)
            .await;

        let transport = ReqwestTransport::with_default_user_agent().unwrap();
        let err = transport
            .send(OutboundRequest::post(server.uri(), String::new(), Duration::from_millis(200)))
            .await
            .unwrap_err();

        assert!(matches!(err, TransportError::Timeout(_)));
    }
}
