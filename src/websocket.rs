//! # Session Status WebSocket
//!
//! Clients connect to `/ws/session` to follow the live session and drive it
//! without polling.
//!
//! ## WebSocket Protocol:
//! 1. **Connection**: the server immediately sends the current `session_status`
//! 2. **Status feed**: every later transition is pushed as another `session_status`
//! 3. **Commands**: the client may send `start_session`, `end_session`,
//!    `get_status` and `pong`
//! 4. **Heartbeat**: the server pings every 30 s and drops clients silent for 60 s
//!
//! ## Message Format:
//! JSON text frames tagged by `type`:
//! ```json
//! { "type": "session_status", "status": "Listening", "session_id": "...", "message": null }
//! { "type": "error", "code": "device_error", "message": "connection error" }
//! ```
//!
//! ## Actor Model:
//! Each connection is an independent actix actor. The controller's watch
//! channel is attached to it as a second stream, so status pushes and client
//! frames are handled on the same actor without extra locking.

use crate::live::session::SessionStatus;
use crate::state::AppState;
use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, error, info, warn};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// WebSocket message types for client-server communication.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WebSocketMessage {
    /// Client asks to open a session
    #[serde(rename = "start_session")]
    StartSession,

    /// Client asks to stop the session
    #[serde(rename = "end_session")]
    EndSession,

    /// Client asks for the current status
    #[serde(rename = "get_status")]
    GetStatus,

    /// Status pushed by the server
    #[serde(rename = "session_status")]
    SessionStatus {
        status: SessionStatus,
        session_id: Option<String>,
        message: Option<String>,
    },

    /// Command failures. `message` never carries device or network detail.
    #[serde(rename = "error")]
    Error { code: String, message: String },

    /// Heartbeat from the server
    #[serde(rename = "ping")]
    Ping { timestamp: u64 },

    /// Heartbeat reply from the client
    #[serde(rename = "pong")]
    Pong { timestamp: u64 },
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Message for sending a command error back to the client.
#[derive(Message)]
#[rtype(result = "()")]
struct CommandFailed {
    code: &'static str,
    message: String,
}

/// WebSocket actor for one status feed connection.
pub struct SessionWebSocket {
    state: web::Data<AppState>,
    last_heartbeat: Instant,
}

impl SessionWebSocket {
    pub fn new(state: web::Data<AppState>) -> Self {
        Self {
            state,
            last_heartbeat: Instant::now(),
        }
    }

    fn send(&self, ctx: &mut ws::WebsocketContext<Self>, message: &WebSocketMessage) {
        match serde_json::to_string(message) {
            Ok(json) => ctx.text(json),
            Err(e) => error!(error = %e, "Failed to serialize WebSocket message"),
        }
    }

    fn send_status(&self, status: SessionStatus, ctx: &mut ws::WebsocketContext<Self>) {
        let session_id = self.state.session.snapshot().session_id.map(|id| id.to_string());
        let message = match status {
            SessionStatus::Error | SessionStatus::Closed => Some("connection error".to_string()),
            _ => None,
        };
        self.send(
            ctx,
            &WebSocketMessage::SessionStatus {
                status,
                session_id,
                message,
            },
        );
    }

    fn send_error(&self, ctx: &mut ws::WebsocketContext<Self>, code: &str, message: &str) {
        warn!(code, message, "WebSocket command failed");
        self.send(
            ctx,
            &WebSocketMessage::Error {
                code: code.to_string(),
                message: message.to_string(),
            },
        );
    }

    /// Run `start()` outside the actor so the session keeps starting even if
    /// this client disconnects halfway. Status changes reach the client
    /// through the watch stream; only the failure reason is sent back here.
    fn handle_start_session(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        let state = self.state.clone();
        let addr = ctx.address();

        actix_web::rt::spawn(async move {
            let result = state.session.start(state.session_settings()).await;
            state.record_session_start(result.is_ok());

            if let Err(e) = result {
                addr.do_send(CommandFailed {
                    code: e.kind(),
                    message: e.public_message(),
                });
            }
        });
    }

    fn handle_end_session(&mut self) {
        self.state.session.stop();
    }

    /// Heartbeat reply. The client's clock is not compared to ours.
    fn handle_pong(&mut self, timestamp: u64) {
        debug!(timestamp, "Heartbeat pong");
        self.last_heartbeat = Instant::now();
    }
}

impl Actor for SessionWebSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!("Status WebSocket connected");
        self.state.increment_status_subscribers();

        // Yields the current status first, then every change
        ctx.add_stream(WatchStream::new(self.state.session.subscribe()));

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!("WebSocket heartbeat timeout, closing connection");
                ctx.stop();
                return;
            }
            act.send(ctx, &WebSocketMessage::Ping { timestamp: now_millis() });
            ctx.ping(b"");
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        self.state.decrement_status_subscribers();
        info!("Status WebSocket disconnected");
    }
}

/// Status changes from the session controller.
impl StreamHandler<SessionStatus> for SessionWebSocket {
    fn handle(&mut self, status: SessionStatus, ctx: &mut Self::Context) {
        self.send_status(status, ctx);
    }

    fn finished(&mut self, ctx: &mut Self::Context) {
        debug!("Session status feed ended");
        ctx.stop();
    }
}

/// Frames from the client.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for SessionWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => match serde_json::from_str::<WebSocketMessage>(&text) {
                Ok(WebSocketMessage::StartSession) => self.handle_start_session(ctx),
                Ok(WebSocketMessage::EndSession) => self.handle_end_session(),
                Ok(WebSocketMessage::GetStatus) => {
                    let status = self.state.session.status();
                    self.send_status(status, ctx);
                }
                Ok(WebSocketMessage::Pong { timestamp }) => self.handle_pong(timestamp),
                Ok(_) => {
                    self.send_error(ctx, "unexpected_message", "message type is not accepted from clients");
                }
                Err(err) => {
                    self.send_error(ctx, "invalid_json", &format!("Invalid JSON: {}", err));
                }
            },
            Ok(ws::Message::Binary(_)) => {
                self.send_error(ctx, "unexpected_binary", "binary frames are not supported");
            }
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!(reason = ?reason, "WebSocket closed by client");
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!("Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(error = %err, "WebSocket protocol error");
                ctx.stop();
            }
        }
    }
}

impl Handler<CommandFailed> for SessionWebSocket {
    type Result = ();

    fn handle(&mut self, msg: CommandFailed, ctx: &mut Self::Context) {
        self.send_error(ctx, msg.code, &msg.message);
    }
}

/// WebSocket endpoint handler: upgrades `GET /ws/session`.
pub async fn session_websocket(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    debug!(peer = ?req.connection_info().peer_addr(), "Status WebSocket upgrade requested");
    ws::start(SessionWebSocket::new(state), &req, stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_commands_parse() {
        assert!(matches!(
            serde_json::from_str::<WebSocketMessage>(r#"{"type":"start_session"}"#).unwrap(),
            WebSocketMessage::StartSession
        ));
        assert!(matches!(
            serde_json::from_str::<WebSocketMessage>(r#"{"type":"end_session"}"#).unwrap(),
            WebSocketMessage::EndSession
        ));
        assert!(matches!(
            serde_json::from_str::<WebSocketMessage>(r#"{"type":"pong","timestamp":42}"#).unwrap(),
            WebSocketMessage::Pong { timestamp: 42 }
        ));
    }

    #[test]
    fn test_status_message_shape() {
        let json = serde_json::to_value(WebSocketMessage::SessionStatus {
            status: SessionStatus::Listening,
            session_id: Some("abc".to_string()),
            message: None,
        })
        .unwrap();

        assert_eq!(json["type"], "session_status");
        assert_eq!(json["status"], "Listening");
        assert_eq!(json["session_id"], "abc");
    }

    #[test]
    fn test_error_message_shape() {
        let json = serde_json::to_string(&WebSocketMessage::Error {
            code: "device_error".to_string(),
            message: "connection error".to_string(),
        })
        .unwrap();
        assert!(json.contains(r#""type":"error""#));
        assert!(json.contains("connection error"));
    }
}
