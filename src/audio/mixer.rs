//! # Source Mixer
//!
//! The part every output device shares: a set of sources pinned to absolute
//! frame positions, mixed block by block as the device consumes audio.
//!
//! The mixer keeps no history. Each call to [`Mixer::render`] produces the
//! next block and forgets it, so memory stays flat however long a session
//! runs.

use crate::audio::buffer::{AudioBuffer, SourceId};
use crate::audio::device::EndedCallback;
use std::collections::HashMap;
use std::sync::Arc;

struct ActiveSource {
    buffer: Arc<AudioBuffer>,
    start_frame: u64,
    on_ended: Option<EndedCallback>,
}

impl ActiveSource {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.buffer.frame_count() as u64
    }
}

pub struct Mixer {
    channels: usize,
    sources: HashMap<SourceId, ActiveSource>,
    rendered_frames: u64,
}

impl Mixer {
    pub fn new(channels: u16) -> Self {
        Self {
            channels: channels.max(1) as usize,
            sources: HashMap::new(),
            rendered_frames: 0,
        }
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Frames consumed since the device opened. This is the device clock.
    pub fn rendered_frames(&self) -> u64 {
        self.rendered_frames
    }

    pub fn add(&mut self, id: SourceId, buffer: Arc<AudioBuffer>, start_frame: u64, on_ended: EndedCallback) {
        self.sources.insert(
            id,
            ActiveSource {
                buffer,
                start_frame,
                on_ended: Some(on_ended),
            },
        );
    }

    /// Drop a source without running its callback.
    pub fn remove(&mut self, id: SourceId) -> bool {
        self.sources.remove(&id).is_some()
    }

    pub fn clear(&mut self) {
        self.sources.clear();
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Advance the clock by `frames`.
    ///
    /// With a `block`, the interleaved mix of those frames replaces its
    /// contents; without one the frames are skipped unheard. Returns the
    /// callbacks of sources whose last frame has now been rendered. The
    /// caller runs them once it holds no lock.
    pub fn render(&mut self, frames: usize, block: Option<&mut Vec<f32>>) -> Vec<EndedCallback> {
        let from = self.rendered_frames;
        let to = from + frames as u64;

        if let Some(block) = block {
            block.clear();
            block.resize(frames * self.channels, 0.0);
            for source in self.sources.values() {
                let begin = source.start_frame.max(from);
                let end = source.end_frame().min(to);
                let source_channels = source.buffer.channel_count().max(1) as usize;
                for frame in begin..end {
                    let offset = (frame - source.start_frame) as usize;
                    let slot = (frame - from) as usize * self.channels;
                    for channel in 0..self.channels {
                        block[slot + channel] += source.buffer.channel(channel % source_channels)[offset];
                    }
                }
            }
        }
        self.rendered_frames = to;

        let done: Vec<SourceId> = self
            .sources
            .iter()
            .filter(|(_, source)| source.end_frame() <= to)
            .map(|(id, _)| *id)
            .collect();

        done.into_iter()
            .filter_map(|id| self.sources.remove(&id))
            .filter_map(|source| source.on_ended)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocks_follow_on_from_each_other() {
        let mut mixer = Mixer::new(1);
        mixer.add(1, Arc::new(AudioBuffer::constant(10, 3, 0.25)), 0, Box::new(|| {}));
        mixer.add(2, Arc::new(AudioBuffer::constant(10, 2, 0.5)), 3, Box::new(|| {}));

        let mut block = Vec::new();
        assert_eq!(mixer.render(4, Some(&mut block)).len(), 1);
        assert_eq!(block, vec![0.25, 0.25, 0.25, 0.5]);

        assert_eq!(mixer.render(4, Some(&mut block)).len(), 1);
        assert_eq!(block, vec![0.5, 0.0, 0.0, 0.0]);
        assert_eq!(mixer.rendered_frames(), 8);
        assert!(mixer.is_empty());
    }

    #[test]
    fn test_mono_source_fills_every_output_channel() {
        let mut mixer = Mixer::new(2);
        mixer.add(1, Arc::new(AudioBuffer::constant(10, 2, 0.5)), 1, Box::new(|| {}));

        let mut block = Vec::new();
        mixer.render(3, Some(&mut block));
        assert_eq!(block, vec![0.0, 0.0, 0.5, 0.5, 0.5, 0.5]);
    }

    #[test]
    fn test_skipped_frames_still_complete_sources() {
        let mut mixer = Mixer::new(1);
        mixer.add(1, Arc::new(AudioBuffer::constant(10, 5, 0.5)), 0, Box::new(|| {}));
        mixer.add(2, Arc::new(AudioBuffer::constant(10, 5, 0.5)), 2, Box::new(|| {}));
        assert!(mixer.remove(2));
        assert!(!mixer.remove(2));

        assert_eq!(mixer.render(5, None).len(), 1);
        assert_eq!(mixer.rendered_frames(), 5);
        assert_eq!(mixer.len(), 0);
    }
}
