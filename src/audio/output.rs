//! # Virtual Output Device
//!
//! A software output context that behaves like a sound card with a sample
//! clock: sources are started at absolute times, mixed as the clock advances,
//! and report completion once their last frame has been rendered.
//!
//! ## Clocks:
//! - **Realtime**: the clock follows wall time since the device was opened and a
//!   background task renders every [`RENDER_INTERVAL`]
//! - **Manual**: the clock only moves when a [`ManualClock`] is set, and the
//!   caller drives rendering with [`VirtualOutput::render`]. Tests use this to
//!   step through a session deterministically.
//!
//! ## Rendering to disk:
//! When opened with a render path, every rendered block is appended to a
//! 16-bit WAV file (via `hound`) as it is mixed. Nothing is held in memory
//! between blocks; the header is finalized when the device closes.

use crate::audio::buffer::{AudioBuffer, SourceId};
use crate::audio::codec;
use crate::audio::device::{EndedCallback, OutputDevice};
use crate::audio::mixer::Mixer;
use crate::error::LiveError;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How often the realtime driver advances the mix.
pub const RENDER_INTERVAL: Duration = Duration::from_millis(20);

/// Largest block mixed in one pass when catching up to the clock.
const MAX_BLOCK_FRAMES: usize = 4096;

type RenderSink = hound::WavWriter<BufWriter<File>>;

/// A clock that only moves when told to.
#[derive(Debug, Clone, Default)]
pub struct ManualClock(Arc<Mutex<f64>>);

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now(&self) -> f64 {
        *self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set(&self, seconds: f64) {
        *self.0.lock().unwrap_or_else(|e| e.into_inner()) = seconds;
    }
}

enum OutputClock {
    Realtime(Instant),
    Manual(ManualClock),
}

struct RenderState {
    mixer: Mixer,
    block: Vec<f32>,
    sink: Option<RenderSink>,
}

/// Software output context. See the module docs for the clock modes.
pub struct VirtualOutput {
    sample_rate: u32,
    channels: u16,
    clock: OutputClock,
    state: Mutex<RenderState>,
    closed: AtomicBool,
    driver: Mutex<Option<JoinHandle<()>>>,
}

fn open_sink(path: &Path, sample_rate: u32, channels: u16) -> Result<RenderSink, LiveError> {
    let spec = hound::WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    hound::WavWriter::create(path, spec)
        .map_err(|e| LiveError::Device(format!("cannot create {}: {}", path.display(), e)))
}

impl VirtualOutput {
    fn build(sample_rate: u32, channels: u16, clock: OutputClock, sink: Option<RenderSink>) -> Self {
        Self {
            sample_rate,
            channels: channels.max(1),
            clock,
            state: Mutex::new(RenderState {
                mixer: Mixer::new(channels),
                block: Vec::new(),
                sink,
            }),
            closed: AtomicBool::new(false),
            driver: Mutex::new(None),
        }
    }

    /// Open a device driven by a manual clock.
    pub fn manual(sample_rate: u32, channels: u16, clock: ManualClock) -> Arc<Self> {
        Arc::new(Self::build(sample_rate, channels, OutputClock::Manual(clock), None))
    }

    /// Open a realtime device and start its render task.
    ///
    /// Must be called from within a tokio runtime. The render task holds only a
    /// weak reference, so dropping the last `Arc` also ends the task. Fails
    /// with `Device` if the render file cannot be created.
    pub fn realtime(sample_rate: u32, channels: u16, render_path: Option<&Path>) -> Result<Arc<Self>, LiveError> {
        let sink = render_path
            .map(|path| open_sink(path, sample_rate, channels.max(1)))
            .transpose()?;
        let output = Arc::new(Self::build(
            sample_rate,
            channels,
            OutputClock::Realtime(Instant::now()),
            sink,
        ));

        let weak = Arc::downgrade(&output);
        let driver = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(RENDER_INTERVAL);
            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(output) if !output.is_closed() => {
                        output.render();
                    }
                    _ => break,
                }
            }
        });
        *output.lock_driver() = Some(driver);

        info!(sample_rate, channels, render = render_path.is_some(), "Opened realtime output device");
        Ok(output)
    }

    fn lock_state(&self) -> MutexGuard<'_, RenderState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_driver(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.driver.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Render up to the current clock position.
    pub fn render(&self) -> usize {
        self.render_until(self.current_time())
    }

    /// Mix every source up to `time` seconds and fire completion callbacks for
    /// sources whose last frame has been rendered.
    ///
    /// Returns the number of sources that completed. Callbacks run after the
    /// device lock is released.
    pub fn render_until(&self, time: f64) -> usize {
        if self.is_closed() {
            return 0;
        }

        let target = (time.max(0.0) * self.sample_rate as f64).floor() as u64;

        let finished: Vec<EndedCallback> = {
            let mut guard = self.lock_state();
            let state = &mut *guard;
            let mut finished = Vec::new();

            while state.mixer.rendered_frames() < target {
                let frames = (target - state.mixer.rendered_frames()).min(MAX_BLOCK_FRAMES as u64) as usize;
                match state.sink.as_mut() {
                    Some(sink) => {
                        finished.extend(state.mixer.render(frames, Some(&mut state.block)));
                        let written = state.block.iter().try_for_each(|&s| sink.write_sample(codec::quantize(s)));
                        if let Err(e) = written {
                            warn!(error = %e, "Output render failed, no longer recording");
                            state.sink = None;
                        }
                    }
                    None => finished.extend(state.mixer.render(frames, None)),
                }
            }

            // Picks up sources that ended at or before the current position
            finished.extend(state.mixer.render(0, None));
            finished
        };

        let count = finished.len();
        for on_ended in finished {
            on_ended();
        }
        count
    }

    /// Number of sources scheduled or playing.
    pub fn active_sources(&self) -> usize {
        self.lock_state().mixer.len()
    }
}

impl OutputDevice for VirtualOutput {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channel_count(&self) -> u16 {
        self.channels
    }

    fn current_time(&self) -> f64 {
        match &self.clock {
            OutputClock::Realtime(opened_at) => opened_at.elapsed().as_secs_f64(),
            OutputClock::Manual(clock) => clock.now(),
        }
    }

    fn start_source(
        &self,
        id: SourceId,
        buffer: Arc<AudioBuffer>,
        start_at: f64,
        on_ended: EndedCallback,
    ) -> Result<(), LiveError> {
        if self.is_closed() {
            return Err(LiveError::Device("output device is closed".to_string()));
        }

        let start_frame = (start_at.max(0.0) * self.sample_rate as f64).round() as u64;
        self.lock_state().mixer.add(id, buffer, start_frame, on_ended);
        Ok(())
    }

    fn stop_source(&self, id: SourceId) {
        if self.lock_state().mixer.remove(id) {
            debug!(source_id = id, "Stopped playback source");
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(driver) = self.lock_driver().take() {
            driver.abort();
        }

        let (sink, frames) = {
            let mut state = self.lock_state();
            state.mixer.clear();
            (state.sink.take(), state.mixer.rendered_frames())
        };

        if let Some(sink) = sink {
            match sink.finalize() {
                Ok(()) => info!(frames, "Wrote output render"),
                Err(e) => warn!(error = %e, "Failed to finish output render"),
            }
        }

        debug!("Output device closed");
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for VirtualOutput {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::AtomicUsize;

    fn counter_callback(counter: &Arc<AtomicUsize>) -> EndedCallback {
        let counter = counter.clone();
        Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    /// Manually clocked device that records into `dir/render.wav`.
    fn recording(dir: &tempfile::TempDir, sample_rate: u32, clock: ManualClock) -> (VirtualOutput, PathBuf) {
        let path = dir.path().join("render.wav");
        let sink = open_sink(&path, sample_rate, 1).unwrap();
        (VirtualOutput::build(sample_rate, 1, OutputClock::Manual(clock), Some(sink)), path)
    }

    fn read_render(path: &Path) -> Vec<i16> {
        hound::WavReader::open(path)
            .unwrap()
            .samples::<i16>()
            .map(|s| s.unwrap())
            .collect()
    }

    #[test]
    fn test_sources_complete_after_last_frame() {
        let clock = ManualClock::new();
        let output = VirtualOutput::manual(1000, 1, clock.clone());
        let ended = Arc::new(AtomicUsize::new(0));

        output
            .start_source(1, Arc::new(AudioBuffer::constant(1000, 500, 0.5)), 0.0, counter_callback(&ended))
            .unwrap();

        clock.set(0.499);
        assert_eq!(output.render(), 0);
        assert_eq!(output.active_sources(), 1);

        clock.set(0.5);
        assert_eq!(output.render(), 1);
        assert_eq!(ended.load(Ordering::SeqCst), 1);
        assert_eq!(output.active_sources(), 0);
    }

    #[test]
    fn test_stopped_source_never_reports_completion() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::new();
        let (output, path) = recording(&dir, 1000, clock.clone());
        let ended = Arc::new(AtomicUsize::new(0));

        output
            .start_source(1, Arc::new(AudioBuffer::constant(1000, 100, 0.5)), 0.0, counter_callback(&ended))
            .unwrap();
        output.stop_source(1);

        clock.set(1.0);
        output.render();
        assert_eq!(ended.load(Ordering::SeqCst), 0);
        output.close();

        // Nothing after the stop reaches the render
        let samples = read_render(&path);
        assert_eq!(samples.len(), 1000);
        assert!(samples.iter().all(|&s| s == 0));
    }

    #[test]
    fn test_render_places_sources_at_their_start_frames() {
        let dir = tempfile::tempdir().unwrap();
        let (output, path) = recording(&dir, 10, ManualClock::new());
        let noop = || -> EndedCallback { Box::new(|| {}) };

        output.start_source(1, Arc::new(AudioBuffer::constant(10, 3, 0.25)), 0.0, noop()).unwrap();
        output.start_source(2, Arc::new(AudioBuffer::constant(10, 2, 0.5)), 0.3, noop()).unwrap();

        output.render_until(0.4);
        output.render_until(1.0);
        output.close();

        let samples = read_render(&path);
        assert_eq!(samples.len(), 10);
        assert_eq!(&samples[..6], &[8192, 8192, 8192, 16384, 16384, 0]);
    }

    #[test]
    fn test_long_render_is_written_in_bounded_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let (output, path) = recording(&dir, 8000, ManualClock::new());

        // Ten minutes in one call: written block by block, not held in memory
        output.render_until(600.0);
        assert!(output.lock_state().block.capacity() <= 2 * MAX_BLOCK_FRAMES);
        output.close();

        let spec = hound::WavReader::open(&path).unwrap().spec();
        assert_eq!(spec.sample_rate, 8000);
        assert_eq!(hound::WavReader::open(&path).unwrap().len(), 8000 * 600);
    }

    #[test]
    fn test_closed_device_rejects_sources() {
        let output = VirtualOutput::manual(24000, 1, ManualClock::new());
        output.close();
        output.close();
        assert!(output.is_closed());

        let result = output.start_source(1, Arc::new(AudioBuffer::constant(24000, 10, 0.0)), 0.0, Box::new(|| {}));
        assert!(matches!(result, Err(LiveError::Device(_))));
    }

    #[tokio::test]
    async fn test_realtime_device_writes_render_on_close() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("render.wav");

        let output = VirtualOutput::realtime(8000, 1, Some(path.as_path())).unwrap();
        output
            .start_source(1, Arc::new(AudioBuffer::constant(8000, 80, 0.5)), 0.0, Box::new(|| {}))
            .unwrap();
        output.render_until(0.02);
        output.close();

        let reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.spec().channels, 1);
        assert_eq!(reader.spec().bits_per_sample, 16);
        let samples = read_render(&path);
        assert_eq!(samples.len(), 160);
        assert!(samples[..80].iter().all(|&s| s == 16384));
    }

    #[tokio::test]
    async fn test_unwritable_render_path_is_device_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("render.wav");
        assert!(matches!(VirtualOutput::realtime(8000, 1, Some(path.as_path())), Err(LiveError::Device(_))));
    }
}
