//! # Live WebSocket Client
//!
//! [`GeminiLiveTransport`] connects to the hosted live API over a TLS
//! WebSocket, sends the setup message, and then runs one task per connection
//! that:
//!
//! - writes every outbound message as a `realtimeInput` text frame
//! - parses every inbound text or binary frame into [`TransportEvent`]s
//! - closes the socket when the session asks it to
//!
//! Raw socket errors are logged here in full; the session only ever surfaces
//! a generic connection error to users.

use crate::config::LiveConfig;
use crate::error::LiveError;
use crate::live::protocol::{parse_server_frame, LiveSetup, OutboundMessage, ServerFrame};
use crate::live::transport::{LiveConnection, LiveTransport, TransportEvent};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

/// WebSocket transport for the hosted live API.
///
/// Holds no settings of its own: endpoint, key and setup come from the
/// `LiveConfig` each session starts with.
#[derive(Debug, Default)]
pub struct GeminiLiveTransport;

impl GeminiLiveTransport {
    pub fn new() -> Self {
        Self
    }
}

fn socket_url(config: &LiveConfig) -> String {
    format!("{}?key={}", config.endpoint, config.api_key)
}

/// Turn one parsed server frame into the events the session consumes.
///
/// Returns `false` when nothing was forwarded because the receiver is gone.
fn forward_frame(frame: ServerFrame, events: &mpsc::UnboundedSender<TransportEvent>) -> bool {
    match frame {
        ServerFrame::SetupComplete => {
            debug!("Live setup complete");
            events.send(TransportEvent::Open).is_ok()
        }
        ServerFrame::Content(messages) => messages
            .into_iter()
            .all(|message| events.send(TransportEvent::Message(message)).is_ok()),
        ServerFrame::GoAway(time_left) => {
            warn!(time_left = ?time_left, "Live backend announced disconnect");
            true
        }
        ServerFrame::Other => true,
    }
}

fn handle_payload(payload: &[u8], events: &mpsc::UnboundedSender<TransportEvent>) -> bool {
    match parse_server_frame(payload) {
        Ok(frame) => forward_frame(frame, events),
        Err(e) => {
            warn!(error = %e, "Dropping unreadable server frame");
            true
        }
    }
}

#[async_trait]
impl LiveTransport for GeminiLiveTransport {
    async fn connect(&self, config: &LiveConfig) -> Result<LiveConnection, LiveError> {
        if config.api_key.is_empty() {
            return Err(LiveError::Connection("no API key configured".to_string()));
        }

        let (socket, response) = connect_async(socket_url(config)).await.map_err(|e| {
            error!(error = %e, "Live connection failed");
            LiveError::Connection(e.to_string())
        })?;
        info!(status = %response.status(), model = %config.model, "Live socket connected");

        let setup = LiveSetup::from_config(config);

        let (mut write, mut read) = socket.split();

        write
            .send(Message::Text(setup.to_wire().to_string()))
            .await
            .map_err(|e| LiveError::Connection(format!("failed to send setup: {}", e)))?;

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<OutboundMessage>();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => {
                        let _ = write.send(Message::Close(None)).await;
                        debug!("Live socket closed by client");
                        break;
                    }

                    Some(message) = outbound_rx.recv() => {
                        if let Err(e) = write.send(Message::Text(message.to_wire().to_string())).await {
                            error!(error = %e, "Failed to send audio frame");
                            let _ = events_tx.send(TransportEvent::Error(e.to_string()));
                            break;
                        }
                    }

                    incoming = read.next() => {
                        let keep_going = match incoming {
                            Some(Ok(Message::Text(text))) => handle_payload(text.as_bytes(), &events_tx),
                            Some(Ok(Message::Binary(bytes))) => handle_payload(&bytes, &events_tx),
                            Some(Ok(Message::Ping(payload))) => write.send(Message::Pong(payload)).await.is_ok(),
                            Some(Ok(Message::Close(frame))) => {
                                let reason = frame.map(|f| f.reason.to_string()).filter(|r| !r.is_empty());
                                info!(reason = ?reason, "Live socket closed by server");
                                let _ = events_tx.send(TransportEvent::Closed(reason));
                                false
                            }
                            Some(Ok(_)) => true,
                            Some(Err(e)) => {
                                error!(error = %e, "Live socket error");
                                let _ = events_tx.send(TransportEvent::Error(e.to_string()));
                                false
                            }
                            None => {
                                let _ = events_tx.send(TransportEvent::Closed(None));
                                false
                            }
                        };
                        if !keep_going {
                            break;
                        }
                    }
                }
            }
        });

        Ok(LiveConnection::new(outbound_tx, events_rx, shutdown_tx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::live::protocol::InboundMessage;

    #[test]
    fn test_url_carries_key() {
        let mut config = LiveConfig::default();
        config.api_key = "abc".to_string();
        let url = socket_url(&config);
        assert!(url.starts_with("wss://"));
        assert!(url.ends_with("?key=abc"));
    }

    #[tokio::test]
    async fn test_missing_key_is_connection_error() {
        let transport = GeminiLiveTransport::new();
        let result = transport.connect(&LiveConfig::default()).await;
        assert!(matches!(result, Err(LiveError::Connection(_))));
    }

    #[tokio::test]
    async fn test_each_connect_uses_the_config_it_is_given() {
        let transport = GeminiLiveTransport::new();
        let mut config = LiveConfig::default();
        config.api_key = "key".to_string();
        // Nothing listens on port 1, so the attempt fails at the socket,
        // after the key check passed
        config.endpoint = "ws://127.0.0.1:1".to_string();

        match transport.connect(&config).await {
            Err(LiveError::Connection(reason)) => assert_ne!(reason, "no API key configured"),
            other => panic!("expected a refused connection, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_frames_become_events() {
        let (tx, mut rx) = mpsc::unbounded_channel();

        assert!(handle_payload(br#"{"setupComplete":{}}"#, &tx));
        assert!(handle_payload(br#"{"serverContent":{"interrupted":true}}"#, &tx));
        assert!(handle_payload(b"garbage", &tx));

        assert_eq!(rx.recv().await, Some(TransportEvent::Open));
        assert_eq!(
            rx.recv().await,
            Some(TransportEvent::Message(InboundMessage::interruption()))
        );
        assert!(rx.try_recv().is_err());
    }
}
