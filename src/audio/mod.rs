//! # Audio Module
//!
//! Everything between the microphone / speakers and the live connection.
//!
//! ## Key Components:
//! - **buffer**: `AudioFrame`, `AudioBuffer` and `PlaybackChunk` value types
//! - **codec**: base64 <-> 16-bit little-endian PCM <-> float samples
//! - **device**: traits the session uses to open input and output devices
//! - **mixer**: sources pinned to frame positions, mixed block by block
//! - **output**: clock-driven software output device
//! - **input**: WAV-file microphone and the file-backed device provider
//! - **hardware**: sound card microphone and speakers (cpal), backend routing
//! - **capture**: microphone frames -> outbound messages
//! - **scheduler**: gapless, interruptible playback of inbound chunks
//!
//! ## Audio Formats:
//! - **Capture**: 16 kHz mono, 4096-sample frames (configurable)
//! - **Playback**: 24 kHz mono (configurable)
//! - **Wire**: 16-bit signed little-endian PCM, base64 encoded

pub mod buffer;
pub mod capture;
pub mod codec;
pub mod device;
pub mod hardware;
pub mod input;
pub mod mixer;
pub mod output;
pub mod scheduler;

pub use buffer::{AudioBuffer, AudioFrame, PlaybackChunk, SourceId};
pub use capture::CapturePipeline;
pub use device::{DeviceProvider, InputDevice, OutputDevice};
pub use hardware::ConfiguredDeviceProvider;
pub use input::FileDeviceProvider;
pub use scheduler::{PlaybackScheduler, SchedulerSnapshot};
