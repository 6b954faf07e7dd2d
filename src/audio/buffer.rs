//! # Audio Value Types
//!
//! The three buffers that move through the voice pipeline:
//!
//! - [`AudioFrame`]: one block of microphone audio as signed 16-bit PCM, ready to
//!   be encoded and sent to the live backend
//! - [`AudioBuffer`]: decoded model speech as planar `f32` channels, ready to be
//!   played on the output device
//! - [`PlaybackChunk`]: an `AudioBuffer` pinned to a start time on the output
//!   timeline, owned by the playback scheduler while it is scheduled or playing
//!
//! None of these types expose mutable access after construction.

use std::sync::Arc;

/// Identifier of one scheduled playback source on an output device.
pub type SourceId = u64;

/// A fixed-length block of 16-bit PCM samples captured from the microphone.
///
/// ## Ownership:
/// Created by the capture pipeline once per frame and moved into the outbound
/// message. The sample vector is private, so nothing can modify a frame after
/// it has been built.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    samples: Vec<i16>,
    sample_rate: u32,
    channels: u16,
}

impl AudioFrame {
    /// Build a frame from already-quantized samples (interleaved if `channels > 1`).
    pub fn new(samples: Vec<i16>, sample_rate: u32, channels: u16) -> Self {
        Self {
            samples,
            sample_rate,
            channels,
        }
    }

    /// Build a mono frame from normalized float samples in `[-1.0, 1.0]`.
    ///
    /// ## Conversion:
    /// Each sample is multiplied by 32768 and truncated toward zero, then
    /// clamped to the i16 range so a full-scale `1.0` becomes `32767`.
    pub fn from_float(samples: &[f32], sample_rate: u32) -> Self {
        let samples = samples.iter().map(|&s| super::codec::quantize(s)).collect();
        Self::new(samples, sample_rate, 1)
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Number of sample frames (samples per channel).
    pub fn frame_count(&self) -> usize {
        if self.channels == 0 {
            0
        } else {
            self.samples.len() / self.channels as usize
        }
    }
}

/// Decoded audio ready for playback: one `Vec<f32>` per channel.
///
/// ## Why planar:
/// The output device mixes sources channel by channel, so keeping each channel
/// contiguous avoids striding through interleaved data in the render loop.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    sample_rate: u32,
    channels: Vec<Vec<f32>>,
}

impl AudioBuffer {
    /// Build a buffer from planar channel data.
    ///
    /// All channels are expected to have the same length; the codec guarantees
    /// this for every buffer it produces.
    pub fn new(sample_rate: u32, channels: Vec<Vec<f32>>) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }

    /// A mono buffer holding `frames` copies of `value`. Handy for tests and
    /// for rendering silence.
    pub fn constant(sample_rate: u32, frames: usize, value: f32) -> Self {
        Self::new(sample_rate, vec![vec![value; frames]])
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channel_count(&self) -> u16 {
        self.channels.len() as u16
    }

    /// Samples of one channel. Panics if `index` is out of range, like slice indexing.
    pub fn channel(&self, index: usize) -> &[f32] {
        &self.channels[index]
    }

    /// Number of sample frames (samples per channel).
    pub fn frame_count(&self) -> usize {
        self.channels.first().map(Vec::len).unwrap_or(0)
    }

    /// Playback duration in seconds.
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frame_count() as f64 / self.sample_rate as f64
    }
}

/// A decoded buffer together with where it sits on the output timeline.
///
/// ## Lifecycle:
/// Created by `PlaybackScheduler::enqueue`, stored in the scheduler's source
/// registry, and dropped when its source ends naturally or is force-stopped by
/// an interrupt or a session stop.
#[derive(Debug, Clone)]
pub struct PlaybackChunk {
    pub id: SourceId,
    pub buffer: Arc<AudioBuffer>,
    pub start_at: f64,
}

impl PlaybackChunk {
    pub fn duration(&self) -> f64 {
        self.buffer.duration()
    }

    /// Time at which this chunk finishes playing.
    pub fn end_at(&self) -> f64 {
        self.start_at + self.duration()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_from_float_quantizes() {
        let frame = AudioFrame::from_float(&[0.0, 0.5, -0.5, 1.0, -1.0], 16000);
        assert_eq!(frame.samples(), &[0, 16384, -16384, 32767, -32768]);
        assert_eq!(frame.channels(), 1);
        assert_eq!(frame.frame_count(), 5);
    }

    #[test]
    fn test_buffer_duration() {
        let buffer = AudioBuffer::constant(24000, 12000, 0.25);
        assert_eq!(buffer.frame_count(), 12000);
        assert!((buffer.duration() - 0.5).abs() < 1e-12);

        let chunk = PlaybackChunk {
            id: 7,
            buffer: Arc::new(buffer),
            start_at: 0.25,
        };
        assert!((chunk.end_at() - 0.75).abs() < 1e-12);
    }

    #[test]
    fn test_empty_buffer_has_zero_duration() {
        let buffer = AudioBuffer::new(24000, Vec::new());
        assert_eq!(buffer.frame_count(), 0);
        assert_eq!(buffer.duration(), 0.0);
    }
}
