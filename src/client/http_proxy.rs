use anyhow::{Context, Result};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Client;
use std::str::FromStr;
use url::Url;

use super::handler::{HandlerError, HandlerResponse, RequestHandler};
use crate::protocol::ProxiedRequest;

/// Forwards proxied requests to a local HTTP service
#[derive(Debug, Clone)]
pub struct ForwardHandler {
    client: Client,
    target: Url,
}

impl ForwardHandler {
    pub fn new(target: &str) -> Result<Self> {
        let target =
            Url::parse(target).with_context(|| format!("Invalid forward URL: {}", target))?;

        let client = Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .pool_max_idle_per_host(10)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self { client, target })
    }

    pub fn target(&self) -> &Url {
        &self.target
    }

    fn local_url(&self, relay_path: &str) -> String {
        format!(
            "{}{}",
            self.target.as_str().trim_end_matches('/'),
            local_path(relay_path)
        )
    }
}

impl RequestHandler for ForwardHandler {
    async fn handle(&self, request: &ProxiedRequest) -> Result<HandlerResponse, HandlerError> {
        let method = reqwest::Method::from_str(request.method())
            .map_err(|e| HandlerError::BadRequest(format!("method '{}': {}", request.method(), e)))?;
        let body = request
            .body()
            .map_err(|e| HandlerError::BadRequest(format!("body_base64: {}", e)))?;

        let mut header_map = HeaderMap::new();
        for (name, value) in request.header_pairs() {
            if is_hop_by_hop(&name) || name.eq_ignore_ascii_case("host") {
                continue;
            }
            if name.eq_ignore_ascii_case("content-length") {
                continue;
            }

            if let (Ok(header_name), Ok(header_value)) =
                (HeaderName::from_str(&name), HeaderValue::from_str(&value))
            {
                header_map.append(header_name, header_value);
            }
        }

        let mut builder = self
            .client
            .request(method, self.local_url(request.path()))
            .headers(header_map);
        if !body.is_empty() {
            builder = builder.body(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| HandlerError::Upstream(e.to_string()))?;

        let status = response.status();
        let headers: Vec<(String, String)> = response
            .headers()
            .iter()
            .filter(|(name, _)| !is_hop_by_hop(name.as_str()))
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        let body = response
            .bytes()
            .await
            .map_err(|e| HandlerError::Upstream(e.to_string()))?;

        Ok(HandlerResponse::new(status, headers, body.to_vec()))
    }
}

/// Strip the relay's endpoint segment: `/<endpoint>/rest` becomes `/rest`
fn local_path(relay_path: &str) -> String {
    let trimmed = relay_path.trim_start_matches('/');
    match trimmed.find('/') {
        Some(idx) => trimmed[idx..].to_string(),
        None => "/".to_string(),
    }
}

fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::InboundFrame;
    use http::StatusCode;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn request(json: &str) -> ProxiedRequest {
        match InboundFrame::from_json(json).unwrap() {
            InboundFrame::Request(req) => req,
            other => panic!("expected request, got {:?}", other),
        }
    }

    #[test]
    fn test_local_path() {
        assert_eq!(local_path("/abc123/items/7"), "/items/7");
        assert_eq!(local_path("/abc123"), "/");
        assert_eq!(local_path("/abc123/"), "/");
        assert_eq!(local_path("/"), "/");
    }

    #[tokio::test]
    async fn test_forward_request_not_running() {
        // Nothing listens on this port
        let handler = ForwardHandler::new("http://localhost:19999").unwrap();
        let result = handler
            .handle(&request(r#"{"uuid":"u","method":"GET","path":"/e/test"}"#))
            .await;

        assert!(matches!(result, Err(HandlerError::Upstream(_))));
    }

    #[tokio::test]
    async fn test_forward_rejects_bad_method() {
        let handler = ForwardHandler::new("http://localhost:19999").unwrap();
        let result = handler
            .handle(&request(r#"{"uuid":"u","method":"BAD METHOD","path":"/"}"#))
            .await;

        assert!(matches!(result, Err(HandlerError::BadRequest(_))));
    }

    #[tokio::test]
    async fn test_forward_to_local_service() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            let mut buf = [0u8; 1024];
            // Headers plus the 5-byte body
            while !received.ends_with(b"hello") {
                let n = stream.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                received.extend_from_slice(&buf[..n]);
            }
            stream
                .write_all(
                    b"HTTP/1.1 201 Created\r\nContent-Length: 2\r\nX-Local: yes\r\nConnection: close\r\n\r\nok",
                )
                .await
                .unwrap();
            String::from_utf8_lossy(&received).to_string()
        });

        let handler = ForwardHandler::new(&format!("http://{}", addr)).unwrap();
        let resp = handler
            .handle(&request(
                r#"{"uuid":"u","method":"POST","path":"/abc123/items",
                    "headers":{"X-Client":["1"],"Connection":["keep-alive"]},
                    "body_base64":"aGVsbG8="}"#,
            ))
            .await
            .unwrap();

        assert_eq!(resp.status, StatusCode::CREATED);
        assert_eq!(resp.body, b"ok".to_vec());
        assert!(resp
            .headers
            .contains(&("x-local".to_string(), "yes".to_string())));
        assert!(!resp.headers.iter().any(|(k, _)| k == "connection"));

        let seen = server.await.unwrap();
        assert!(seen.starts_with("POST /items HTTP/1.1\r\n"), "{}", seen);
        assert!(seen.to_ascii_lowercase().contains("x-client: 1"));
    }
}
