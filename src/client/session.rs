//! One tunnel session: the receive loop and per-frame dispatch.
//!
//! A [`Session`] starts `Open` and moves to `Closed` exactly once, through
//! [`Session::on_close`] or a fatal [`Session::on_error`]. Every inbound
//! frame goes through [`Session::on_message`]. Proxied requests are handled
//! on their own tasks; all outbound frames go through a single writer channel.

use chrono::Local;
use futures_util::{Stream, StreamExt};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::{protocol::CloseFrame, Error as WsError, Message};
use tracing::{debug, error, info, warn};

use super::events::{CloseReason, RequestEvent, ResponseEvent, SessionEvent};
use super::handler::{HandlerError, RequestHandler};
use crate::error::TunnelError;
use crate::protocol::{HeaderStyle, InboundFrame, ProxiedRequest, ProxiedResponse, RequestId};

/// Relay gives up on a request after this long, so there's no point waiting longer
pub const DEFAULT_HANDLER_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy)]
pub struct SessionOptions {
    pub header_style: HeaderStyle,
    pub handler_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            header_style: HeaderStyle::default(),
            handler_timeout: DEFAULT_HANDLER_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Open,
    Closed(CloseReason),
}

pub struct Session<H> {
    /// Public base URL, without trailing slash
    base_url: String,
    handler: Arc<H>,
    outbound: mpsc::Sender<Message>,
    events: Option<mpsc::Sender<SessionEvent>>,
    options: SessionOptions,
    state: SessionState,
    public_url: Option<String>,
    /// Requests whose response hasn't been handed to the writer yet
    in_flight: Arc<Mutex<HashSet<RequestId>>>,
}

impl<H: RequestHandler> Session<H> {
    pub fn new(
        base_url: &str,
        handler: Arc<H>,
        outbound: mpsc::Sender<Message>,
        events: Option<mpsc::Sender<SessionEvent>>,
        options: SessionOptions,
    ) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            handler,
            outbound,
            events,
            options,
            state: SessionState::Open,
            public_url: None,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == SessionState::Open
    }

    /// `<baseUrl>/<endpoint>` once the relay has announced it
    #[cfg(test)]
    pub fn public_url(&self) -> Option<&str> {
        self.public_url.as_deref()
    }

    /// Drive the session until the inbound stream closes or fails
    pub async fn run<S>(mut self, mut read: S) -> CloseReason
    where
        S: Stream<Item = Result<Message, WsError>> + Unpin,
    {
        while self.is_open() {
            match read.next().await {
                Some(Ok(Message::Close(frame))) => self.on_close(frame).await,
                Some(Ok(msg)) => self.on_message(msg).await,
                Some(Err(e)) => self.on_error(e).await,
                None => self.transition_closed(CloseReason::StreamEnded).await,
            }
        }

        match self.state {
            SessionState::Closed(reason) => reason,
            SessionState::Open => CloseReason::StreamEnded,
        }
    }

    pub async fn on_message(&mut self, msg: Message) {
        if !self.is_open() {
            debug!("Ignoring frame after close");
            return;
        }

        match msg {
            Message::Text(text) => self.dispatch(text.as_bytes()).await,
            Message::Binary(data) => self.dispatch(&data).await,
            Message::Ping(data) => {
                debug!("Received ping, sending pong");
                let _ = self.outbound.send(Message::Pong(data)).await;
            }
            Message::Pong(_) => {
                debug!("Received pong");
            }
            Message::Close(frame) => self.on_close(frame).await,
            Message::Frame(_) => {}
        }
    }

    pub async fn on_close(&mut self, frame: Option<CloseFrame<'_>>) {
        let reason = frame.map(|f| f.reason.to_string());
        info!("Relay closed connection: {:?}", reason);
        self.transition_closed(CloseReason::PeerClosed(reason)).await;
    }

    pub async fn on_error(&mut self, err: WsError) {
        match err {
            // The offending frame is lost but the connection is still usable
            WsError::Capacity(_) | WsError::Utf8 { .. } => {
                warn!("Dropping unreadable frame: {}", err);
            }
            other => {
                error!("WebSocket error: {}", other);
                self.transition_closed(CloseReason::Transport(other.to_string()))
                    .await;
            }
        }
    }

    async fn transition_closed(&mut self, reason: CloseReason) {
        if !self.is_open() {
            return;
        }
        self.state = SessionState::Closed(reason.clone());
        self.emit(SessionEvent::Closed(reason)).await;
    }

    async fn dispatch(&mut self, bytes: &[u8]) {
        let frame = match InboundFrame::from_bytes(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Dropping frame: {}", e);
                return;
            }
        };

        match frame {
            InboundFrame::Announcement(announcement) => {
                let public_url = format!("{}/{}", self.base_url, announcement.endpoint);
                info!("Reach me at {}", public_url);
                if let Some(previous) = self.public_url.replace(public_url.clone()) {
                    debug!("Endpoint moved from {}", previous);
                }
                self.emit(SessionEvent::Announced { public_url }).await;
            }
            InboundFrame::Request(request) => self.spawn_request(request).await,
        }
    }

    async fn spawn_request(&mut self, request: ProxiedRequest) {
        if !self.in_flight.lock().await.insert(request.uuid.clone()) {
            warn!(
                "Request {} is already being handled, ignoring duplicate",
                request.uuid
            );
            return;
        }

        debug!("{} {} ({})", request.method(), request.path(), request.uuid);
        if !request.extra.is_empty() {
            let names: Vec<&str> = request.extra.keys().map(String::as_str).collect();
            debug!("Request {} carries extra fields: {:?}", request.uuid, names);
        }
        self.emit(SessionEvent::RequestReceived(RequestEvent {
            uuid: request.uuid.clone(),
            method: request.method().to_string(),
            path: request.path().to_string(),
            timestamp: Local::now(),
        }))
        .await;

        let handler = self.handler.clone();
        let outbound = self.outbound.clone();
        let events = self.events.clone();
        let in_flight = self.in_flight.clone();
        let options = self.options;

        tokio::spawn(async move {
            let start = Instant::now();
            let response = respond(handler.as_ref(), &request, &options).await;
            let duration_ms = start.elapsed().as_millis() as u64;

            debug!(
                "{} {} -> {} ({}ms)",
                request.method(),
                request.path(),
                response.status,
                duration_ms
            );

            match response.to_json() {
                Ok(json) => {
                    if outbound.send(Message::Text(json)).await.is_err() {
                        debug!("{}", TunnelError::Send(request.uuid.clone()));
                    } else if let Some(tx) = &events {
                        let _ = tx
                            .send(SessionEvent::ResponseSent(ResponseEvent {
                                uuid: request.uuid.clone(),
                                status: response.status,
                                body_len: response.content_length().unwrap_or(0),
                                duration_ms,
                            }))
                            .await;
                    }
                }
                Err(e) => error!("Failed to encode response for {}: {}", request.uuid, e),
            }

            in_flight.lock().await.remove(&request.uuid);
        });
    }

    async fn emit(&self, event: SessionEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event).await;
        }
    }
}

/// Run the handler and turn its outcome into a response frame.
/// Always produces a response, so the relay never waits on an unanswered uuid.
pub async fn respond<H: RequestHandler>(
    handler: &H,
    request: &ProxiedRequest,
    options: &SessionOptions,
) -> ProxiedResponse {
    let result = match tokio::time::timeout(options.handler_timeout, handler.handle(request)).await
    {
        Ok(result) => result,
        Err(_) => Err(HandlerError::Timeout(options.handler_timeout)),
    };

    let response = result.unwrap_or_else(|e| {
        warn!(
            "{}",
            TunnelError::Handler {
                uuid: request.uuid.clone(),
                message: e.to_string(),
            }
        );
        e.into_response()
    });

    ProxiedResponse::new(
        request.uuid.clone(),
        response.status.as_u16(),
        response.headers,
        &response.body,
        options.header_style,
    )
}
