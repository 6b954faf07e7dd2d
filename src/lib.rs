//! # Partner Live
//!
//! A live, bidirectional voice session with a hosted generative-AI backend:
//! microphone audio is streamed up as 16-bit PCM, and the model's spoken
//! replies are scheduled back to back on an output device, with barge-in
//! interruption.
//!
//! ## Modules:
//! - **audio**: PCM codec, devices, capture pipeline and playback scheduler
//! - **live**: wire protocol, transport and the session lifecycle controller
//! - **config**: layered configuration (defaults, config.toml, environment)
//! - **state**, **handlers**, **health**, **websocket**, **middleware**: the
//!   HTTP / WebSocket control API
//! - **error**: the session error taxonomy and its HTTP mapping

pub mod audio;
pub mod config;
pub mod error;
pub mod handlers;
pub mod health;
pub mod live;
pub mod middleware;
pub mod state;
pub mod websocket;
