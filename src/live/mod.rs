//! # Live Session Module
//!
//! The connection to the hosted live backend and the controller that runs a
//! voice session over it.
//!
//! - **protocol**: message shapes on the wire and as the controller sees them
//! - **transport**: the `LiveTransport` seam and the event channel it returns
//! - **client**: WebSocket implementation of `LiveTransport`
//! - **session**: the session lifecycle state machine

pub mod client;
pub mod protocol;
pub mod session;
pub mod transport;

pub use client::GeminiLiveTransport;
pub use protocol::{InboundMessage, LiveSetup, OutboundMessage};
pub use session::{LiveSessionController, SessionSettings, SessionSnapshot, SessionStatus};
pub use transport::{LiveConnection, LiveTransport, RemotePeer, TransportEvent};
