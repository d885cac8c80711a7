//! Pass-through forwarding to the real origin.
//!
//! A registration without a reply spec forwards the captured request to the
//! upstream and holds whatever comes back until the gate fires. Failures are
//! captured the same way and surfaced verbatim; nothing is retried.

use crate::registry::{CapturedRequest, Reply};
use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("invalid method {0:?}")]
    Method(String),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

/// Where pass-through requests are sent.
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn forward(&self, request: &CapturedRequest) -> Result<Reply, UpstreamError>;
}

/// HTTP upstream addressed by origin (`scheme://host:port`).
pub struct HttpUpstream {
    origin: String,
    client: reqwest::Client,
}

impl HttpUpstream {
    pub fn new(origin: impl Into<String>) -> Self {
        let origin = origin.into();
        Self {
            origin: origin.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn forward(&self, request: &CapturedRequest) -> Result<Reply, UpstreamError> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|_| UpstreamError::Method(request.method.clone()))?;

        let mut url = format!("{}{}", self.origin, request.path);
        if let Some(query) = &request.query {
            url.push('?');
            url.push_str(query);
        }

        let mut outbound = self.client.request(method, &url);
        for (name, value) in &request.headers {
            if !is_connection_request_header(name) {
                outbound = outbound.header(name, value);
            }
        }
        if let Some(body) = &request.body {
            outbound = outbound.body(body.clone());
        }

        let response = outbound.send().await?;
        let status = response.status().as_u16();
        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response.bytes().await?.to_vec();

        Ok(Reply {
            status,
            headers,
            body: if body.is_empty() { None } else { Some(body) },
        })
    }
}

/// Headers that describe the inbound connection rather than the request
/// being forwarded.
fn is_connection_request_header(name: &str) -> bool {
    name.eq_ignore_ascii_case("host")
        || name.eq_ignore_ascii_case("connection")
        || name.eq_ignore_ascii_case("content-length")
        || name.eq_ignore_ascii_case("transfer-encoding")
        || name.eq_ignore_ascii_case("accept-encoding")
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn get_request(path: &str, query: Option<&str>) -> CapturedRequest {
        CapturedRequest {
            method: "GET".to_string(),
            path: path.to_string(),
            query: query.map(str::to_string),
            ..CapturedRequest::default()
        }
    }

    #[tokio::test]
    async fn forwards_and_captures_the_real_reply() {
        let origin = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/123/info.0.json"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"img": "x.png", "alt": "X"})),
            )
            .mount(&origin)
            .await;

        let upstream = HttpUpstream::new(origin.uri());
        let reply = upstream
            .forward(&get_request("/123/info.0.json", None))
            .await
            .unwrap();

        assert_eq!(reply.status, 200);
        let body: serde_json::Value =
            serde_json::from_slice(reply.body.as_deref().unwrap()).unwrap();
        assert_eq!(body["img"], "x.png");
        assert_eq!(body["alt"], "X");
    }

    #[tokio::test]
    async fn forwards_the_query_string() {
        let origin = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/search"))
            .and(query_param("q", "rust"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&origin)
            .await;

        let upstream = HttpUpstream::new(origin.uri());
        let reply = upstream
            .forward(&get_request("/search", Some("q=rust")))
            .await
            .unwrap();
        assert_eq!(reply.status, 204);
    }

    #[tokio::test]
    async fn unreachable_origin_surfaces_an_error() {
        // Nothing listens on port 1.
        let upstream = HttpUpstream::new("http://127.0.0.1:1");
        let result = upstream.forward(&get_request("/", None)).await;
        assert!(matches!(result, Err(UpstreamError::Http(_))));
    }

    #[tokio::test]
    async fn bad_method_is_rejected() {
        let upstream = HttpUpstream::new("http://127.0.0.1:1");
        let request = CapturedRequest {
            method: "NOT A METHOD".to_string(),
            path: "/".to_string(),
            ..CapturedRequest::default()
        };
        assert!(matches!(
            upstream.forward(&request).await,
            Err(UpstreamError::Method(_))
        ));
    }
}
