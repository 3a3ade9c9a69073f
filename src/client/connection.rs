use futures_util::{Sink, SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info};
use url::Url;

use super::events::{CloseReason, ConnectionStatus, SessionEvent};
use super::handler::RequestHandler;
use super::session::{Session, SessionOptions};
use crate::error::{Result, TunnelError};

/// Path the relay serves the tunnel WebSocket on
pub const TUNNEL_PATH: &str = "proxy";

/// How long the writer gets to flush the close handshake after a session ends
const WRITER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Exponential backoff between sessions
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

/// Derive the WebSocket tunnel URL from the relay's public base URL.
///
/// `https://relay.example/` becomes `wss://relay.example/proxy`.
pub fn tunnel_url(base_url: &str) -> Result<Url> {
    let invalid = |reason: String| TunnelError::InvalidUrl(base_url.to_string(), reason);

    let trimmed = base_url.trim_end_matches('/');
    let mut url =
        Url::parse(&format!("{}/{}", trimmed, TUNNEL_PATH)).map_err(|e| invalid(e.to_string()))?;

    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(invalid(format!("unsupported scheme '{}'", other))),
    };
    url.set_scheme(scheme)
        .map_err(|_| invalid(format!("cannot use scheme '{}'", scheme)))?;

    Ok(url)
}

pub struct TunnelClient<H> {
    base_url: String,
    tunnel_url: Url,
    handler: Arc<H>,
    options: SessionOptions,
    reconnect: Option<ReconnectPolicy>,
    events: Option<mpsc::Sender<SessionEvent>>,
}

impl<H: RequestHandler> TunnelClient<H> {
    pub fn new(
        base_url: &str,
        handler: H,
        options: SessionOptions,
        events: Option<mpsc::Sender<SessionEvent>>,
    ) -> Result<Self> {
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            tunnel_url: tunnel_url(base_url)?,
            handler: Arc::new(handler),
            options,
            reconnect: None,
            events,
        })
    }

    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = Some(policy);
        self
    }

    pub fn tunnel_url(&self) -> &Url {
        &self.tunnel_url
    }

    /// Run one session, or keep reconnecting if a policy is set
    pub async fn run(&self) -> Result<()> {
        let Some(policy) = self.reconnect else {
            let reason = self.connect_and_run().await?;
            info!("Session ended: {}", reason);
            return Ok(());
        };

        let mut retry_delay = policy.initial_delay;
        let mut attempt = 0u32;

        loop {
            match self.connect_and_run().await {
                Ok(reason) => {
                    info!("Session ended: {}", reason);
                    retry_delay = policy.initial_delay;
                    attempt = 0;
                }
                Err(e) => {
                    error!("Connection error: {}", e);
                }
            }

            attempt += 1;
            self.send_event(SessionEvent::ConnectionStatus(
                ConnectionStatus::Reconnecting {
                    attempt,
                    next_retry_secs: retry_delay.as_secs(),
                },
            ))
            .await;
            info!("Reconnecting in {:?}...", retry_delay);
            tokio::time::sleep(retry_delay).await;

            retry_delay = std::cmp::min(retry_delay * 2, policy.max_delay);
        }
    }

    /// Open the tunnel WebSocket
    pub async fn connect(&self) -> Result<WsStream> {
        info!("Connecting to {}...", self.tunnel_url);

        let (ws_stream, _) = connect_async(self.tunnel_url.as_str())
            .await
            .map_err(|e| TunnelError::Connect {
                url: self.tunnel_url.to_string(),
                source: Box::new(e),
            })?;

        info!("Connected to relay");
        Ok(ws_stream)
    }

    /// Connect and serve one session until the relay closes it
    pub async fn connect_and_run(&self) -> Result<CloseReason> {
        self.send_event(SessionEvent::ConnectionStatus(ConnectionStatus::Connecting))
            .await;

        let ws_stream = match self.connect().await {
            Ok(ws) => ws,
            Err(e) => {
                self.send_event(SessionEvent::ConnectionStatus(
                    ConnectionStatus::Disconnected {
                        reason: e.to_string(),
                    },
                ))
                .await;
                return Err(e);
            }
        };
        self.send_event(SessionEvent::ConnectionStatus(ConnectionStatus::Connected))
            .await;

        let (write, read) = ws_stream.split();

        // Single writer: every outbound frame funnels through this channel
        let (ws_tx, ws_rx) = mpsc::channel::<Message>(256);
        let (stop_tx, stop_rx) = oneshot::channel();
        let mut writer_handle = tokio::spawn(write_loop(write, ws_rx, stop_rx));

        let session = Session::new(
            &self.base_url,
            self.handler.clone(),
            ws_tx,
            self.events.clone(),
            self.options,
        );
        let reason = session.run(read).await;

        // In-flight handlers still hold senders, so stop the writer explicitly
        let _ = stop_tx.send(());
        if tokio::time::timeout(WRITER_SHUTDOWN_TIMEOUT, &mut writer_handle)
            .await
            .is_err()
        {
            debug!("Writer did not finish closing in time");
            writer_handle.abort();
        }

        self.send_event(SessionEvent::ConnectionStatus(
            ConnectionStatus::Disconnected {
                reason: reason.to_string(),
            },
        ))
        .await;

        Ok(reason)
    }

    async fn send_event(&self, event: SessionEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event).await;
        }
    }
}

/// Forward outbound frames until told to stop, then close the sink so any
/// pending close reply reaches the relay
async fn write_loop<W>(
    mut write: W,
    mut rx: mpsc::Receiver<Message>,
    mut stop: oneshot::Receiver<()>,
) where
    W: Sink<Message, Error = WsError> + Unpin,
{
    loop {
        let msg = tokio::select! {
            _ = &mut stop => break,
            msg = rx.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };
        if let Err(e) = write.send(msg).await {
            debug!("Send error (connection closing): {}", e);
            return;
        }
    }

    if let Err(e) = write.close().await {
        debug!("Close error: {}", e);
    }
}
