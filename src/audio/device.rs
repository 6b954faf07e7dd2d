//! # Audio Device Abstraction
//!
//! The session controller never talks to hardware directly. It asks a
//! [`DeviceProvider`] for one [`OutputDevice`] and one [`InputDevice`] per
//! session, and releases both on teardown.
//!
//! ## Contracts implementors must honor:
//! - `OutputDevice::current_time` is monotonic and measured in seconds from the
//!   moment the device was opened
//! - `OutputDevice::start_source` must not invoke `on_ended` synchronously; the
//!   callback runs later from the device's own render path, with no device lock
//!   held, and at most once
//! - `OutputDevice::stop_source` silences the source immediately and drops its
//!   callback without running it
//! - `close` / `stop` are idempotent
//! - An `InputDevice` delivers frames of exactly `frame_size` mono samples

use crate::audio::buffer::{AudioBuffer, SourceId};
use crate::config::DevicesConfig;
use crate::error::LiveError;
use async_trait::async_trait;
use std::sync::Arc;

/// Completion callback for one scheduled source.
pub type EndedCallback = Box<dyn FnOnce() + Send + 'static>;

/// Callback receiving one captured frame of normalized mono samples.
pub type FrameCallback = Box<dyn FnMut(&[f32]) + Send + 'static>;

/// An audio output context with its own clock.
pub trait OutputDevice: Send + Sync {
    /// Sample rate the device was opened with.
    fn sample_rate(&self) -> u32;

    /// Channel count the device was opened with.
    fn channel_count(&self) -> u16;

    /// Current position of the output clock, in seconds.
    fn current_time(&self) -> f64;

    /// Schedule `buffer` to start playing at `start_at` (output clock seconds).
    fn start_source(
        &self,
        id: SourceId,
        buffer: Arc<AudioBuffer>,
        start_at: f64,
        on_ended: EndedCallback,
    ) -> Result<(), LiveError>;

    /// Stop a scheduled or playing source immediately.
    fn stop_source(&self, id: SourceId);

    /// Release the device. Every remaining source is silenced.
    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// A microphone stream.
pub trait InputDevice: Send {
    /// Sample rate of the frames this device delivers.
    fn sample_rate(&self) -> u32;

    /// Begin delivering frames of `frame_size` samples to `on_frame`.
    fn start(&mut self, frame_size: usize, on_frame: FrameCallback) -> Result<(), LiveError>;

    /// Stop the stream and release every track. Safe to call repeatedly.
    fn stop(&mut self);
}

/// Opens the devices for one session.
///
/// Both methods are async because real platforms prompt for permission or
/// negotiate with an audio server before a device becomes usable. The
/// `DevicesConfig` is the one the session started with, so configuration
/// changes apply from the next session on.
#[async_trait]
pub trait DeviceProvider: Send + Sync {
    /// Open an output context at a fixed rate and channel count.
    async fn open_output(
        &self,
        config: &DevicesConfig,
        sample_rate: u32,
        channels: u16,
    ) -> Result<Arc<dyn OutputDevice>, LiveError>;

    /// Request microphone access. Fails with `LiveError::Device` when access
    /// is denied or no input device exists.
    async fn request_microphone(
        &self,
        config: &DevicesConfig,
        sample_rate: u32,
    ) -> Result<Box<dyn InputDevice>, LiveError>;
}
