//! STOMP over WebSocket, using `tokio-tungstenite`.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{Instrument, debug, info, info_span, instrument, warn};
use url::Url;

use crate::config::RealtimeSettings;
use crate::error::TransportError;
use crate::realtime::connector::{BrokerCommand, BrokerEvent, BrokerLink, Connector, LinkEnd};
use crate::realtime::stomp::{self, Command, Frame};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// ERROR frame messages that mean the credential was refused.
const AUTH_FAILURE_MARKERS: [&str; 6] = [
    "unauthorized",
    "unauthenticated",
    "forbidden",
    "expired",
    "invalid token",
    "access denied",
];

/// Connects to the platform's STOMP broker endpoint.
#[derive(Debug, Clone)]
pub struct StompConnector {
    url: Url,
    handshake_timeout: Duration,
}

impl StompConnector {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            handshake_timeout: Duration::from_secs(10),
        }
    }

    pub fn from_settings(settings: &RealtimeSettings) -> Self {
        Self {
            url: settings.url.clone(),
            handshake_timeout: settings.handshake_timeout(),
        }
    }

    #[must_use]
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    async fn handshake(&self, access_token: &str) -> Result<WsStream, TransportError> {
        let (mut ws, _response) = match connect_async(self.url.as_str()).await {
            Ok(connected) => connected,
            Err(tungstenite::Error::Http(response)) => {
                let status = response.status();
                return Err(match status.as_u16() {
                    401 | 403 => TransportError::Unauthorized(format!(
                        "WebSocket upgrade refused with {status}"
                    )),
                    _ => TransportError::Io(format!("WebSocket upgrade failed with {status}")),
                });
            }
            Err(e) => return Err(TransportError::Io(e.to_string())),
        };

        let host = self.url.host_str().unwrap_or("localhost");
        ws.send(Message::Text(stomp::connect(host, access_token).encode().into()))
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;

        loop {
            let message = match ws.next().await {
                Some(Ok(message)) => message,
                Some(Err(e)) => return Err(TransportError::Io(e.to_string())),
                None => return Err(TransportError::Closed),
            };
            let text = match message {
                Message::Text(text) => text,
                Message::Close(_) => return Err(TransportError::Closed),
                _ => continue,
            };
            let frames = Frame::decode_all(text.as_str())
                .map_err(|e| TransportError::Protocol(e.to_string()))?;
            for frame in frames {
                match frame.command {
                    Command::Connected => {
                        debug!(version = ?frame.get("version"), "STOMP session established.");
                        return Ok(ws);
                    }
                    Command::Error => return Err(classify_error_frame(&frame)),
                    other => debug!(command = %other, "Ignoring frame before CONNECTED."),
                }
            }
        }
    }
}

#[async_trait]
impl Connector for StompConnector {
    #[instrument(skip(self, access_token), fields(url = %self.url))]
    async fn connect(&self, access_token: &str) -> Result<BrokerLink, TransportError> {
        let ws = match tokio::time::timeout(self.handshake_timeout, self.handshake(access_token)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(TransportError::Io(format!(
                    "handshake timed out after {:?}",
                    self.handshake_timeout
                )));
            }
        };
        info!("Broker connection open.");

        let (link, end) = BrokerLink::pair();
        tokio::spawn(pump(ws, end).instrument(info_span!("stomp_link")));
        Ok(link)
    }
}

fn classify_error_frame(frame: &Frame) -> TransportError {
    let message = frame
        .get("message")
        .map(str::to_string)
        .unwrap_or_else(|| frame.body.trim().to_string());
    let lowered = message.to_ascii_lowercase();
    if AUTH_FAILURE_MARKERS.iter().any(|marker| lowered.contains(marker)) {
        TransportError::Unauthorized(message)
    } else {
        TransportError::Protocol(message)
    }
}

/// Moves frames between the socket and the manager until either side ends.
async fn pump(mut ws: WsStream, mut end: LinkEnd) {
    loop {
        tokio::select! {
            command = end.commands.recv() => {
                let Some(command) = command else {
                    debug!("Manager dropped the link; closing socket.");
                    let _ = ws.close(None).await;
                    return;
                };
                let (frame, closing) = match command {
                    BrokerCommand::Subscribe { id, destination } => (stomp::subscribe(&id, &destination), false),
                    BrokerCommand::Unsubscribe { id } => (stomp::unsubscribe(&id), false),
                    BrokerCommand::Disconnect => (stomp::disconnect(), true),
                };
                if let Err(e) = ws.send(Message::Text(frame.encode().into())).await {
                    warn!("Failed to send {} frame: {}", frame.command, e);
                    let _ = end.events.send(BrokerEvent::Fault(TransportError::Io(e.to_string())));
                    return;
                }
                if closing {
                    let _ = ws.close(None).await;
                    return;
                }
            }
            message = ws.next() => {
                let fault = match message {
                    Some(Ok(Message::Text(text))) => match Frame::decode_all(text.as_str()) {
                        Ok(frames) => frames.into_iter().find_map(|frame| forward(frame, &end)),
                        Err(e) => Some(TransportError::Protocol(e.to_string())),
                    },
                    Some(Ok(Message::Close(_))) | None => Some(TransportError::Closed),
                    Some(Ok(_)) => None,
                    Some(Err(e)) => Some(TransportError::Io(e.to_string())),
                };
                if let Some(fault) = fault {
                    warn!("Broker link lost: {}", fault);
                    let _ = end.events.send(BrokerEvent::Fault(fault));
                    return;
                }
            }
        }
    }
}

/// Passes a MESSAGE on. Returns the fault that ends the link, if any.
fn forward(frame: Frame, end: &LinkEnd) -> Option<TransportError> {
    match frame.command {
        Command::Message => {
            let Some(destination) = frame.get("destination").map(str::to_string) else {
                warn!("MESSAGE frame without destination dropped.");
                return None;
            };
            let event = BrokerEvent::Message {
                destination,
                body: frame.body,
            };
            end.events.send(event).err().map(|_| TransportError::Closed)
        }
        Command::Error => Some(classify_error_frame(&frame)),
        other => {
            debug!(command = %other, "Ignoring frame.");
            None
        }
    }
}
