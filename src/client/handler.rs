//! Pluggable request handling.
//!
//! The session hands every proxied request to a [`RequestHandler`] and turns
//! whatever comes back (or the error) into a response frame. Handlers never
//! see the tunnel connection.

use http::StatusCode;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

use crate::protocol::ProxiedRequest;

/// Status, headers and raw body produced by a handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerResponse {
    pub status: StatusCode,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HandlerResponse {
    pub fn new(status: StatusCode, headers: Vec<(String, String)>, body: Vec<u8>) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    pub fn text(status: StatusCode, body: impl Into<String>) -> Self {
        Self::new(
            status,
            vec![(
                "Content-Type".to_string(),
                "text/plain; charset=utf-8".to_string(),
            )],
            body.into().into_bytes(),
        )
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    #[error("invalid request: {0}")]
    BadRequest(String),

    #[error("upstream request failed: {0}")]
    Upstream(String),

    #[error("handler timed out after {0:?}")]
    Timeout(Duration),

    #[error("{0}")]
    Internal(String),
}

impl HandlerError {
    pub fn status(&self) -> StatusCode {
        match self {
            HandlerError::BadRequest(_) => StatusCode::BAD_REQUEST,
            HandlerError::Upstream(_) => StatusCode::BAD_GATEWAY,
            HandlerError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            HandlerError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Diagnostic response answering a request whose handler failed
    pub fn into_response(self) -> HandlerResponse {
        let status = self.status();
        let reason = status.canonical_reason().unwrap_or("Error");
        HandlerResponse::text(status, format!("{}: {}", reason, self))
    }
}

/// Maps a proxied request to an HTTP response.
///
/// Calls for different requests may run concurrently, so implementations
/// must handle their own synchronization.
pub trait RequestHandler: Send + Sync + 'static {
    fn handle(
        &self,
        request: &ProxiedRequest,
    ) -> impl Future<Output = Result<HandlerResponse, HandlerError>> + Send;
}

/// Answers every request with `200 Hello World`
#[derive(Debug, Clone, Copy, Default)]
pub struct HelloWorld;

impl HelloWorld {
    const BODY: &'static str = "Hello World";
}

impl RequestHandler for HelloWorld {
    async fn handle(&self, _request: &ProxiedRequest) -> Result<HandlerResponse, HandlerError> {
        Ok(HandlerResponse::new(
            StatusCode::OK,
            vec![(
                "Content-Length".to_string(),
                Self::BODY.len().to_string(),
            )],
            Self::BODY.as_bytes().to_vec(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::InboundFrame;

    fn request(json: &str) -> ProxiedRequest {
        match InboundFrame::from_json(json).unwrap() {
            InboundFrame::Request(req) => req,
            other => panic!("expected request, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_hello_world_ignores_payload() {
        for json in [
            r#"{"uuid":"r-1","method":"GET","path":"/"}"#,
            r#"{"uuid":"r-2","method":"DELETE","path":"/x/y","body_base64":"AAEC"}"#,
        ] {
            let resp = HelloWorld.handle(&request(json)).await.unwrap();
            assert_eq!(resp.status, StatusCode::OK);
            assert_eq!(resp.body, b"Hello World".to_vec());
            assert_eq!(
                resp.headers,
                vec![("Content-Length".to_string(), "11".to_string())]
            );
        }
    }

    #[test]
    fn test_error_responses() {
        let resp = HandlerError::Upstream("connection refused".to_string()).into_response();
        assert_eq!(resp.status, StatusCode::BAD_GATEWAY);
        assert_eq!(
            String::from_utf8(resp.body).unwrap(),
            "Bad Gateway: upstream request failed: connection refused"
        );

        let resp = HandlerError::Internal("boom".to_string()).into_response();
        assert_eq!(resp.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(String::from_utf8(resp.body).unwrap(), "Internal Server Error: boom");

        assert_eq!(
            HandlerError::Timeout(Duration::from_secs(10)).status(),
            StatusCode::GATEWAY_TIMEOUT
        );
    }
}
