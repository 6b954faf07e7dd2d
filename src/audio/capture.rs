//! # Capture Pipeline
//!
//! Turns microphone frames into outbound messages:
//!
//! ```text
//! InputDevice --(f32 frame)--> AudioFrame --> PCM bytes --> base64 --> OutboundMessage --> channel
//! ```
//!
//! The frame callback runs on the device's own task. It only converts and
//! pushes onto an unbounded channel, so a slow network can never stall the
//! microphone.

use crate::audio::buffer::AudioFrame;
use crate::audio::codec;
use crate::audio::device::InputDevice;
use crate::error::LiveError;
use crate::live::protocol::OutboundMessage;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

/// A running microphone wired to the outbound channel.
pub struct CapturePipeline {
    input: Box<dyn InputDevice>,
    frames_sent: Arc<AtomicU64>,
    running: bool,
}

impl CapturePipeline {
    /// Start `input` and forward every frame of `frame_size` samples.
    ///
    /// On failure the input is stopped before the error is returned.
    pub fn start(
        mut input: Box<dyn InputDevice>,
        frame_size: usize,
        outbound: mpsc::UnboundedSender<OutboundMessage>,
    ) -> Result<Self, LiveError> {
        let sample_rate = input.sample_rate();
        let frames_sent = Arc::new(AtomicU64::new(0));
        let counter = frames_sent.clone();

        let on_frame = Box::new(move |samples: &[f32]| {
            let frame = AudioFrame::from_float(samples, sample_rate);
            let data = codec::encode_base64(&codec::encode_pcm(frame.samples()));

            // A closed channel means the session is being torn down
            if outbound.send(OutboundMessage::audio(data, frame.sample_rate())).is_ok() {
                let sent = counter.fetch_add(1, Ordering::Relaxed) + 1;
                trace!(frames_sent = sent, "Captured frame queued");
            }
        });

        if let Err(e) = input.start(frame_size, on_frame) {
            input.stop();
            return Err(e);
        }

        info!(sample_rate, frame_size, "Capture pipeline started");
        Ok(Self {
            input,
            frames_sent,
            running: true,
        })
    }

    /// Number of frames pushed onto the outbound channel.
    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Stop the microphone. Safe to call more than once.
    pub fn stop(&mut self) {
        if !self.running {
            return;
        }
        self.running = false;
        self.input.stop();
        debug!(frames_sent = self.frames_sent(), "Capture pipeline stopped");
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}
