use thiserror::Error;

use crate::protocol::RequestId;

#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("Failed to connect to relay at {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: Box<tokio_tungstenite::tungstenite::Error>,
    },

    #[error("Invalid relay URL '{0}': {1}")]
    InvalidUrl(String, String),

    #[error("Undecodable frame: {0}")]
    Decode(String),

    #[error("Handler failed for request {uuid}: {message}")]
    Handler { uuid: RequestId, message: String },

    #[error("Failed to send response for request {0}: session closed")]
    Send(RequestId),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, TunnelError>;
