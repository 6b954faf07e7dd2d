//! # Live Transport
//!
//! The seam between the session controller and the network.
//!
//! A [`LiveTransport`] connects and returns a [`LiveConnection`]: an outbound
//! sender for captured audio plus an ordered stream of [`TransportEvent`]s.
//! The controller never touches sockets, so the same controller runs against
//! the real WebSocket client and against an in-memory [`RemotePeer`] in tests.
//!
//! ## Event order:
//! `Open` arrives once, before any `Message`. After `Error` or `Closed` no
//! further events are delivered.

use crate::config::LiveConfig;
use crate::error::LiveError;
use crate::live::protocol::{InboundMessage, OutboundMessage};
use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

/// Something that happened on the connection.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The backend confirmed the session is open.
    Open,
    /// One inbound message, in arrival order.
    Message(InboundMessage),
    /// The connection failed.
    Error(String),
    /// The connection closed, with the reason if one was given.
    Closed(Option<String>),
}

/// One open connection to the live backend.
pub struct LiveConnection {
    outbound: mpsc::UnboundedSender<OutboundMessage>,
    events: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl LiveConnection {
    /// Assemble a connection from the channels a transport task drives.
    pub fn new(
        outbound: mpsc::UnboundedSender<OutboundMessage>,
        events: mpsc::UnboundedReceiver<TransportEvent>,
        shutdown: oneshot::Sender<()>,
    ) -> Self {
        Self {
            outbound,
            events: Some(events),
            shutdown: Some(shutdown),
        }
    }

    /// A connection wired to an in-memory peer.
    pub fn pair() -> (LiveConnection, RemotePeer) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let connection = LiveConnection::new(outbound_tx, events_rx, shutdown_tx);
        let peer = RemotePeer {
            events: events_tx,
            outbound: outbound_rx,
            shutdown: shutdown_rx,
        };
        (connection, peer)
    }

    /// Sender for captured audio. Cloned into the capture pipeline.
    pub fn sender(&self) -> mpsc::UnboundedSender<OutboundMessage> {
        self.outbound.clone()
    }

    /// Take the event stream. Returns `None` on the second call.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.events.take()
    }

    /// Ask the transport to close the socket. Safe to call more than once.
    pub fn close(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
            debug!("Live connection close requested");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_none()
    }
}

impl Drop for LiveConnection {
    fn drop(&mut self) {
        self.close();
    }
}

/// The far end of [`LiveConnection::pair`].
pub struct RemotePeer {
    events: mpsc::UnboundedSender<TransportEvent>,
    outbound: mpsc::UnboundedReceiver<OutboundMessage>,
    shutdown: oneshot::Receiver<()>,
}

impl RemotePeer {
    fn emit(&self, event: TransportEvent) -> bool {
        self.events.send(event).is_ok()
    }

    /// Confirm the session is open.
    pub fn open(&self) -> bool {
        self.emit(TransportEvent::Open)
    }

    pub fn deliver(&self, message: InboundMessage) -> bool {
        self.emit(TransportEvent::Message(message))
    }

    pub fn fail(&self, reason: impl Into<String>) -> bool {
        self.emit(TransportEvent::Error(reason.into()))
    }

    pub fn close(&self, reason: Option<String>) -> bool {
        self.emit(TransportEvent::Closed(reason))
    }

    /// Next outbound message, or `None` once the client side is gone.
    pub async fn next_outbound(&mut self) -> Option<OutboundMessage> {
        self.outbound.recv().await
    }

    /// Whether the client asked to close (or dropped its connection).
    pub fn shutdown_requested(&mut self) -> bool {
        !matches!(self.shutdown.try_recv(), Err(oneshot::error::TryRecvError::Empty))
    }
}

/// Opens connections to the live backend.
#[async_trait]
pub trait LiveTransport: Send + Sync {
    /// Connect with `config` and send the session setup derived from it. The
    /// returned connection has not necessarily been confirmed open yet; wait
    /// for [`TransportEvent::Open`].
    async fn connect(&self, config: &LiveConfig) -> Result<LiveConnection, LiveError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_delivers_events_in_order() {
        let (mut connection, peer) = LiveConnection::pair();
        let mut events = connection.take_events().unwrap();
        assert!(connection.take_events().is_none());

        peer.open();
        peer.deliver(InboundMessage::interruption());
        peer.close(None);

        assert_eq!(events.recv().await, Some(TransportEvent::Open));
        assert!(matches!(events.recv().await, Some(TransportEvent::Message(_))));
        assert_eq!(events.recv().await, Some(TransportEvent::Closed(None)));
    }

    #[tokio::test]
    async fn test_outbound_and_close() {
        let (mut connection, mut peer) = LiveConnection::pair();
        connection
            .sender()
            .send(OutboundMessage::audio("AAAA".to_string(), 16000))
            .unwrap();
        assert_eq!(peer.next_outbound().await.unwrap().media.data, "AAAA");

        assert!(!peer.shutdown_requested());
        connection.close();
        connection.close();
        assert!(connection.is_closed());
        assert!(peer.shutdown_requested());
    }
}
