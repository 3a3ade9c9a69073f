use chrono::{DateTime, Local};

use crate::protocol::RequestId;

/// Events that flow from the session to whoever is watching it
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Connection status changed
    ConnectionStatus(ConnectionStatus),
    /// Relay announced the public URL for this session
    Announced { public_url: String },
    /// Incoming proxied request
    RequestReceived(RequestEvent),
    /// Response frame handed to the writer
    ResponseSent(ResponseEvent),
    /// Session ended
    Closed(CloseReason),
}

#[derive(Debug, Clone)]
pub struct RequestEvent {
    pub uuid: RequestId,
    pub method: String,
    pub path: String,
    pub timestamp: DateTime<Local>,
}

#[derive(Debug, Clone)]
pub struct ResponseEvent {
    pub uuid: RequestId,
    pub status: u16,
    pub body_len: usize,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Reconnecting { attempt: u32, next_retry_secs: u64 },
    Disconnected { reason: String },
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionStatus::Connecting => write!(f, "Connecting"),
            ConnectionStatus::Connected => write!(f, "Connected"),
            ConnectionStatus::Reconnecting {
                attempt,
                next_retry_secs,
            } => {
                write!(f, "Reconnecting ({}) in {}s", attempt, next_retry_secs)
            }
            ConnectionStatus::Disconnected { reason } => write!(f, "Disconnected: {}", reason),
        }
    }
}

/// Why a session left the open state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Relay sent a close frame
    PeerClosed(Option<String>),
    /// Stream ended without a close frame
    StreamEnded,
    /// Fatal transport error
    Transport(String),
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::PeerClosed(Some(reason)) if !reason.is_empty() => {
                write!(f, "relay closed the tunnel ({})", reason)
            }
            CloseReason::PeerClosed(_) => write!(f, "relay closed the tunnel"),
            CloseReason::StreamEnded => write!(f, "connection ended"),
            CloseReason::Transport(e) => write!(f, "transport error: {}", e),
        }
    }
}
