//! # Sound Card Devices
//!
//! The `system` device backend: the host's microphone and speakers through
//! cpal, plus [`ConfiguredDeviceProvider`], which picks a backend per session
//! from `DevicesConfig`.
//!
//! ## Threads:
//! A `cpal::Stream` is not `Send`, so every stream lives on a keeper thread
//! that builds it, reports the outcome back through a oneshot, and holds it
//! until the device is released. The speaker keeper also runs completion
//! callbacks, so they never execute on the audio thread or under the mixer
//! lock.
//!
//! ## Rates:
//! Streams open at the session's rate when the device supports it. Otherwise
//! the device's default config is used and audio is converted with rubato in
//! fixed 512-frame chunks.

use crate::audio::buffer::{AudioBuffer, SourceId};
use crate::audio::device::{DeviceProvider, EndedCallback, FrameCallback, InputDevice, OutputDevice};
use crate::audio::input::FileDeviceProvider;
use crate::audio::mixer::Mixer;
use crate::config::{DeviceBackend, DevicesConfig};
use crate::error::LiveError;
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, StreamConfig};
use rubato::{Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex, MutexGuard};
use std::thread;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

const RESAMPLER_CHUNK_SIZE: usize = 512;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn to_i16(sample: f32) -> i16 {
    (sample * i16::MAX as f32) as i16
}

fn to_u16(sample: f32) -> u16 {
    ((sample + 1.0) * 32767.5) as u16
}

fn from_i16(sample: i16) -> f32 {
    sample as f32 / 32768.0
}

fn from_u16(sample: u16) -> f32 {
    (sample as f32 - 32768.0) / 32768.0
}

fn is_writable(format: SampleFormat) -> bool {
    matches!(format, SampleFormat::F32 | SampleFormat::I16 | SampleFormat::U16)
}

/// Rubato resampler fed with interleaved blocks of any length.
///
/// Input is buffered into fixed chunks; a partial chunk waits for the next
/// call.
struct StreamResampler {
    inner: SincFixedIn<f32>,
    channels: usize,
    pending: Vec<f32>,
}

impl StreamResampler {
    fn new(from_rate: u32, to_rate: u32, channels: usize) -> Result<Self, LiveError> {
        let params = SincInterpolationParameters {
            sinc_len: 256,
            f_cutoff: 0.95,
            interpolation: SincInterpolationType::Linear,
            oversampling_factor: 256,
            window: WindowFunction::BlackmanHarris2,
        };
        let inner = SincFixedIn::<f32>::new(
            to_rate as f64 / from_rate as f64,
            2.0,
            params,
            RESAMPLER_CHUNK_SIZE,
            channels,
        )
        .map_err(|e| LiveError::Device(format!("cannot convert {} Hz to {} Hz: {}", from_rate, to_rate, e)))?;

        debug!(from_rate, to_rate, channels, "Resampler ready");
        Ok(Self {
            inner,
            channels,
            pending: Vec::with_capacity(RESAMPLER_CHUNK_SIZE * channels * 2),
        })
    }

    /// Queue `input` and append every converted frame that is ready to `out`.
    fn process(&mut self, input: &[f32], out: &mut Vec<f32>) -> Result<(), LiveError> {
        self.pending.extend_from_slice(input);
        let chunk = RESAMPLER_CHUNK_SIZE * self.channels;

        while self.pending.len() >= chunk {
            let planar: Vec<Vec<f32>> = (0..self.channels)
                .map(|c| self.pending[..chunk].iter().skip(c).step_by(self.channels).copied().collect())
                .collect();
            self.pending.drain(..chunk);

            let converted = self
                .inner
                .process(&planar, None)
                .map_err(|e| LiveError::Device(format!("resampling failed: {}", e)))?;
            let frames = converted.first().map(Vec::len).unwrap_or(0);
            for frame in 0..frames {
                out.extend(converted.iter().map(|channel| channel[frame]));
            }
        }
        Ok(())
    }
}

/// Speaker side state shared between `CpalOutput` and the audio callback.
struct Playback {
    mixer: Mixer,
    resampler: Option<StreamResampler>,
    queued: VecDeque<f32>,
    block: Vec<f32>,
    converted: Vec<f32>,
}

impl Playback {
    fn new(channels: u16) -> Self {
        Self {
            mixer: Mixer::new(channels),
            resampler: None,
            queued: VecDeque::new(),
            block: Vec::new(),
            converted: Vec::new(),
        }
    }

    /// Replace `out` with `frames` interleaved frames at the device rate.
    fn fill(&mut self, frames: usize, out: &mut Vec<f32>) -> Vec<EndedCallback> {
        let Some(resampler) = self.resampler.as_mut() else {
            return self.mixer.render(frames, Some(out));
        };

        let wanted = frames * self.mixer.channels();
        let mut finished = Vec::new();
        while self.queued.len() < wanted {
            finished.extend(self.mixer.render(RESAMPLER_CHUNK_SIZE, Some(&mut self.block)));
            self.converted.clear();
            if let Err(e) = resampler.process(&self.block, &mut self.converted) {
                warn!(error = %e, "Output conversion failed, playing silence");
                self.queued.extend(std::iter::repeat(0.0).take(wanted));
                break;
            }
            self.queued.extend(self.converted.drain(..));
        }

        out.clear();
        out.extend(self.queued.drain(..wanted));
        finished
    }
}

enum KeeperCommand {
    Ended(Vec<EndedCallback>),
    Close,
}

/// Lives inside the output data callback.
struct Renderer {
    playback: Arc<Mutex<Playback>>,
    logical_channels: usize,
    device_channels: usize,
    scratch: Vec<f32>,
    keeper: mpsc::Sender<KeeperCommand>,
}

impl Renderer {
    fn render<T>(&mut self, data: &mut [T], convert: impl Fn(f32) -> T) {
        let frames = data.len() / self.device_channels;
        let finished = lock(&self.playback).fill(frames, &mut self.scratch);

        for (frame, out) in data.chunks_mut(self.device_channels).enumerate() {
            for (channel, sample) in out.iter_mut().enumerate() {
                let index = frame * self.logical_channels + channel % self.logical_channels;
                let value = self.scratch.get(index).copied().unwrap_or(0.0);
                *sample = convert(value.clamp(-1.0, 1.0));
            }
        }

        if !finished.is_empty() {
            let _ = self.keeper.send(KeeperCommand::Ended(finished));
        }
    }
}

fn output_device(name: Option<&str>) -> Result<cpal::Device, LiveError> {
    let host = cpal::default_host();
    match name {
        Some(name) => host
            .output_devices()
            .map_err(|e| LiveError::Device(format!("cannot list output devices: {}", e)))?
            .find(|device| device.name().map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| LiveError::Device(format!("no output device named {}", name))),
        None => host
            .default_output_device()
            .ok_or_else(|| LiveError::Device("no output device available".to_string())),
    }
}

fn input_device(name: Option<&str>) -> Result<cpal::Device, LiveError> {
    let host = cpal::default_host();
    match name {
        Some(name) => host
            .input_devices()
            .map_err(|e| LiveError::Device(format!("cannot list input devices: {}", e)))?
            .find(|device| device.name().map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| LiveError::Device(format!("no input device named {}", name))),
        None => host
            .default_input_device()
            .ok_or_else(|| LiveError::Device("no input device available".to_string())),
    }
}

/// A config at exactly `rate` and `channels` if the device offers one,
/// otherwise the device default.
fn output_config(device: &cpal::Device, rate: u32, channels: u16) -> Result<(StreamConfig, SampleFormat), LiveError> {
    let exact = device.supported_output_configs().ok().and_then(|mut configs| {
        configs.find(|c| {
            c.channels() == channels
                && c.min_sample_rate().0 <= rate
                && rate <= c.max_sample_rate().0
                && is_writable(c.sample_format())
        })
    });

    let chosen = match exact {
        Some(range) => range.with_sample_rate(cpal::SampleRate(rate)),
        None => device
            .default_output_config()
            .map_err(|e| LiveError::Device(format!("no usable output config: {}", e)))?,
    };
    Ok((chosen.config(), chosen.sample_format()))
}

fn input_config(device: &cpal::Device, rate: u32) -> Result<(StreamConfig, SampleFormat), LiveError> {
    let exact = device.supported_input_configs().ok().and_then(|mut configs| {
        configs.find(|c| {
            c.channels() == 1
                && c.min_sample_rate().0 <= rate
                && rate <= c.max_sample_rate().0
                && is_writable(c.sample_format())
        })
    });

    let chosen = match exact {
        Some(range) => range.with_sample_rate(cpal::SampleRate(rate)),
        None => device
            .default_input_config()
            .map_err(|e| LiveError::Device(format!("no usable input config: {}", e)))?,
    };
    Ok((chosen.config(), chosen.sample_format()))
}

fn open_output_stream(
    name: Option<&str>,
    sample_rate: u32,
    channels: u16,
    playback: Arc<Mutex<Playback>>,
    keeper: mpsc::Sender<KeeperCommand>,
    failed: Arc<AtomicBool>,
) -> Result<cpal::Stream, LiveError> {
    let device = output_device(name)?;
    let (config, format) = output_config(&device, sample_rate, channels)?;
    if config.sample_rate.0 != sample_rate {
        lock(&playback).resampler = Some(StreamResampler::new(sample_rate, config.sample_rate.0, channels as usize)?);
    }

    info!(
        device = %device.name().unwrap_or_default(),
        device_rate = config.sample_rate.0,
        device_channels = config.channels,
        ?format,
        "Opening speaker stream"
    );

    let mut renderer = Renderer {
        playback,
        logical_channels: channels as usize,
        device_channels: config.channels.max(1) as usize,
        scratch: Vec::new(),
        keeper,
    };
    let on_error = move |err: cpal::StreamError| {
        error!(error = %err, "Speaker stream error");
        failed.store(true, Ordering::SeqCst);
    };

    let stream = match format {
        SampleFormat::F32 => device.build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| renderer.render(data, |s| s),
            on_error,
            None,
        ),
        SampleFormat::I16 => device.build_output_stream(
            &config,
            move |data: &mut [i16], _: &cpal::OutputCallbackInfo| renderer.render(data, to_i16),
            on_error,
            None,
        ),
        SampleFormat::U16 => device.build_output_stream(
            &config,
            move |data: &mut [u16], _: &cpal::OutputCallbackInfo| renderer.render(data, to_u16),
            on_error,
            None,
        ),
        other => return Err(LiveError::Device(format!("unsupported speaker format {:?}", other))),
    }
    .map_err(|e| LiveError::Device(format!("cannot open speaker stream: {}", e)))?;

    stream
        .play()
        .map_err(|e| LiveError::Device(format!("cannot start speaker stream: {}", e)))?;
    Ok(stream)
}

/// Speakers driven by the sound card clock.
pub struct CpalOutput {
    sample_rate: u32,
    channels: u16,
    playback: Arc<Mutex<Playback>>,
    failed: Arc<AtomicBool>,
    closed: AtomicBool,
    keeper: Mutex<mpsc::Sender<KeeperCommand>>,
}

impl CpalOutput {
    pub async fn open(device_name: Option<String>, sample_rate: u32, channels: u16) -> Result<Arc<Self>, LiveError> {
        let playback = Arc::new(Mutex::new(Playback::new(channels)));
        let failed = Arc::new(AtomicBool::new(false));
        let (keeper_tx, keeper_rx) = mpsc::channel();
        let (ready_tx, ready_rx) = oneshot::channel();

        let stream_playback = playback.clone();
        let stream_failed = failed.clone();
        let stream_keeper = keeper_tx.clone();
        thread::Builder::new()
            .name("live-speaker".to_string())
            .spawn(move || {
                let stream = match open_output_stream(
                    device_name.as_deref(),
                    sample_rate,
                    channels,
                    stream_playback,
                    stream_keeper,
                    stream_failed,
                ) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));

                for command in keeper_rx {
                    match command {
                        KeeperCommand::Ended(callbacks) => callbacks.into_iter().for_each(|on_ended| on_ended()),
                        KeeperCommand::Close => break,
                    }
                }
                drop(stream);
                debug!("Speaker stream released");
            })
            .map_err(|e| LiveError::Device(format!("cannot start speaker thread: {}", e)))?;

        ready_rx
            .await
            .map_err(|_| LiveError::Device("speaker thread exited".to_string()))??;

        Ok(Arc::new(Self {
            sample_rate,
            channels,
            playback,
            failed,
            closed: AtomicBool::new(false),
            keeper: Mutex::new(keeper_tx),
        }))
    }
}

impl OutputDevice for CpalOutput {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channel_count(&self) -> u16 {
        self.channels
    }

    fn current_time(&self) -> f64 {
        lock(&self.playback).mixer.rendered_frames() as f64 / self.sample_rate as f64
    }

    fn start_source(
        &self,
        id: SourceId,
        buffer: Arc<AudioBuffer>,
        start_at: f64,
        on_ended: EndedCallback,
    ) -> Result<(), LiveError> {
        if self.is_closed() {
            return Err(LiveError::Device("speaker stream is closed".to_string()));
        }
        let start_frame = (start_at.max(0.0) * self.sample_rate as f64).round() as u64;
        lock(&self.playback).mixer.add(id, buffer, start_frame, on_ended);
        Ok(())
    }

    fn stop_source(&self, id: SourceId) {
        if lock(&self.playback).mixer.remove(id) {
            debug!(source_id = id, "Stopped playback source");
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        lock(&self.playback).mixer.clear();
        let _ = lock(&self.keeper).send(KeeperCommand::Close);
        debug!("Speaker closed");
    }

    /// A stream that reported an error counts as closed.
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.failed.load(Ordering::SeqCst)
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        self.close();
    }
}

struct FrameSink {
    frame_size: usize,
    on_frame: FrameCallback,
    pending: Vec<f32>,
}

/// Microphone side state shared between `CpalInput` and the audio callback.
struct Capture {
    device_channels: usize,
    resampler: Option<StreamResampler>,
    sink: Option<FrameSink>,
    mono: Vec<f32>,
}

impl Capture {
    fn new() -> Self {
        Self {
            device_channels: 1,
            resampler: None,
            sink: None,
            mono: Vec::new(),
        }
    }

    /// Downmix one device buffer, bring it to the capture rate and hand out
    /// every complete frame. Dropped until a sink is installed.
    fn push(&mut self, interleaved: &[f32]) {
        let Some(sink) = self.sink.as_mut() else {
            return;
        };

        self.mono.clear();
        self.mono.extend(
            interleaved
                .chunks(self.device_channels)
                .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32),
        );

        match self.resampler.as_mut() {
            Some(resampler) => {
                if let Err(e) = resampler.process(&self.mono, &mut sink.pending) {
                    warn!(error = %e, "Dropping microphone audio");
                }
            }
            None => sink.pending.extend_from_slice(&self.mono),
        }

        while sink.pending.len() >= sink.frame_size {
            (sink.on_frame)(&sink.pending[..sink.frame_size]);
            sink.pending.drain(..sink.frame_size);
        }
    }
}

fn open_input_stream(name: Option<&str>, sample_rate: u32, capture: Arc<Mutex<Capture>>) -> Result<cpal::Stream, LiveError> {
    let device = input_device(name)?;
    let (config, format) = input_config(&device, sample_rate)?;
    {
        let mut state = lock(&capture);
        state.device_channels = config.channels.max(1) as usize;
        if config.sample_rate.0 != sample_rate {
            state.resampler = Some(StreamResampler::new(config.sample_rate.0, sample_rate, 1)?);
        }
    }

    info!(
        device = %device.name().unwrap_or_default(),
        device_rate = config.sample_rate.0,
        device_channels = config.channels,
        ?format,
        "Opening microphone stream"
    );

    let on_error = |err: cpal::StreamError| error!(error = %err, "Microphone stream error");
    let mut scratch: Vec<f32> = Vec::new();

    let stream = match format {
        SampleFormat::F32 => device.build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| lock(&capture).push(data),
            on_error,
            None,
        ),
        SampleFormat::I16 => device.build_input_stream(
            &config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                scratch.clear();
                scratch.extend(data.iter().map(|&s| from_i16(s)));
                lock(&capture).push(&scratch);
            },
            on_error,
            None,
        ),
        SampleFormat::U16 => device.build_input_stream(
            &config,
            move |data: &[u16], _: &cpal::InputCallbackInfo| {
                scratch.clear();
                scratch.extend(data.iter().map(|&s| from_u16(s)));
                lock(&capture).push(&scratch);
            },
            on_error,
            None,
        ),
        other => return Err(LiveError::Device(format!("unsupported microphone format {:?}", other))),
    }
    .map_err(|e| LiveError::Device(format!("microphone access refused: {}", e)))?;

    stream
        .play()
        .map_err(|e| LiveError::Device(format!("cannot start microphone stream: {}", e)))?;
    Ok(stream)
}

/// The sound card microphone.
pub struct CpalInput {
    sample_rate: u32,
    capture: Arc<Mutex<Capture>>,
    keeper: Option<mpsc::Sender<()>>,
}

impl CpalInput {
    pub async fn open(device_name: Option<String>, sample_rate: u32) -> Result<Self, LiveError> {
        let capture = Arc::new(Mutex::new(Capture::new()));
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let (ready_tx, ready_rx) = oneshot::channel();

        let stream_capture = capture.clone();
        thread::Builder::new()
            .name("live-microphone".to_string())
            .spawn(move || match open_input_stream(device_name.as_deref(), sample_rate, stream_capture) {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    // Returns on stop or when the input is dropped
                    let _ = stop_rx.recv();
                    drop(stream);
                    debug!("Microphone stream released");
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })
            .map_err(|e| LiveError::Device(format!("cannot start microphone thread: {}", e)))?;

        ready_rx
            .await
            .map_err(|_| LiveError::Device("microphone thread exited".to_string()))??;

        Ok(Self {
            sample_rate,
            capture,
            keeper: Some(stop_tx),
        })
    }
}

impl InputDevice for CpalInput {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn start(&mut self, frame_size: usize, on_frame: FrameCallback) -> Result<(), LiveError> {
        if self.keeper.is_none() {
            return Err(LiveError::Device("microphone already released".to_string()));
        }
        if frame_size == 0 {
            return Err(LiveError::Device("frame size must be greater than 0".to_string()));
        }

        let mut capture = lock(&self.capture);
        if capture.sink.is_some() {
            return Err(LiveError::Device("microphone already started".to_string()));
        }
        capture.sink = Some(FrameSink {
            frame_size,
            on_frame,
            pending: Vec::with_capacity(frame_size * 2),
        });

        debug!(frame_size, sample_rate = self.sample_rate, "Microphone started");
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(keeper) = self.keeper.take() {
            lock(&self.capture).sink = None;
            let _ = keeper.send(());
            debug!("Microphone stopped");
        }
    }
}

impl Drop for CpalInput {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Opens the host's sound card through cpal.
#[derive(Debug, Default)]
pub struct CpalDeviceProvider;

#[async_trait]
impl DeviceProvider for CpalDeviceProvider {
    async fn open_output(
        &self,
        config: &DevicesConfig,
        sample_rate: u32,
        channels: u16,
    ) -> Result<Arc<dyn OutputDevice>, LiveError> {
        if sample_rate == 0 || channels == 0 {
            return Err(LiveError::Device(format!(
                "unsupported output format: {} Hz, {} channel(s)",
                sample_rate, channels
            )));
        }
        let output: Arc<dyn OutputDevice> = CpalOutput::open(config.output_device.clone(), sample_rate, channels).await?;
        Ok(output)
    }

    async fn request_microphone(
        &self,
        config: &DevicesConfig,
        sample_rate: u32,
    ) -> Result<Box<dyn InputDevice>, LiveError> {
        let input = CpalInput::open(config.input_device.clone(), sample_rate).await?;
        info!(device = ?config.input_device, sample_rate, "Microphone granted");
        Ok(Box::new(input))
    }
}

/// Sends each request to the backend the session's `DevicesConfig` names.
#[derive(Debug, Default)]
pub struct ConfiguredDeviceProvider;

#[async_trait]
impl DeviceProvider for ConfiguredDeviceProvider {
    async fn open_output(
        &self,
        config: &DevicesConfig,
        sample_rate: u32,
        channels: u16,
    ) -> Result<Arc<dyn OutputDevice>, LiveError> {
        match config.backend {
            DeviceBackend::System => CpalDeviceProvider.open_output(config, sample_rate, channels).await,
            DeviceBackend::File => FileDeviceProvider.open_output(config, sample_rate, channels).await,
        }
    }

    async fn request_microphone(
        &self,
        config: &DevicesConfig,
        sample_rate: u32,
    ) -> Result<Box<dyn InputDevice>, LiveError> {
        match config.backend {
            DeviceBackend::System => CpalDeviceProvider.request_microphone(config, sample_rate).await,
            DeviceBackend::File => FileDeviceProvider.request_microphone(config, sample_rate).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_sample_conversions_cover_full_scale() {
        assert_eq!(to_i16(1.0), i16::MAX);
        assert_eq!(to_i16(-1.0), -i16::MAX);
        assert_eq!(to_u16(-1.0), 0);
        assert_eq!(to_u16(1.0), u16::MAX);
        assert_eq!(from_i16(-16384), -0.5);
        assert_eq!(from_u16(32768), 0.0);
    }

    #[test]
    fn test_resampler_waits_for_a_full_chunk() {
        let mut resampler = StreamResampler::new(24000, 48000, 1).unwrap();
        let mut out = Vec::new();

        resampler.process(&[0.0; 100], &mut out).unwrap();
        assert!(out.is_empty());

        resampler.process(&vec![0.0; 4 * RESAMPLER_CHUNK_SIZE - 100], &mut out).unwrap();
        // Four chunks at twice the rate
        assert!(out.len() > 3900 && out.len() < 4200, "got {} frames", out.len());
        assert!(resampler.pending.is_empty());
    }

    #[test]
    fn test_playback_at_device_rate_is_the_plain_mix() {
        let mut playback = Playback::new(1);
        playback.mixer.add(1, Arc::new(AudioBuffer::constant(24000, 3, 0.5)), 1, Box::new(|| {}));

        let mut out = Vec::new();
        assert_eq!(playback.fill(4, &mut out).len(), 1);
        assert_eq!(out, vec![0.0, 0.5, 0.5, 0.5]);
    }

    #[test]
    fn test_converted_playback_delivers_exactly_what_the_device_asks_for() {
        let mut playback = Playback::new(1);
        playback.resampler = Some(StreamResampler::new(24000, 48000, 1).unwrap());

        let mut out = Vec::new();
        playback.fill(1000, &mut out);
        assert_eq!(out.len(), 1000);
        playback.fill(1000, &mut out);
        assert_eq!(out.len(), 1000);

        // The clock advances in whole chunks, at the logical rate
        assert_eq!(playback.mixer.rendered_frames() % RESAMPLER_CHUNK_SIZE as u64, 0);
        assert!(playback.mixer.rendered_frames() >= 1000);
    }

    #[test]
    fn test_renderer_spreads_mono_and_hands_callbacks_to_keeper() {
        let playback = Arc::new(Mutex::new(Playback::new(1)));
        let ended = Arc::new(AtomicUsize::new(0));
        let counter = ended.clone();
        lock(&playback).mixer.add(
            7,
            Arc::new(AudioBuffer::constant(24000, 2, 0.5)),
            0,
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let (keeper_tx, keeper_rx) = mpsc::channel();
        let mut renderer = Renderer {
            playback,
            logical_channels: 1,
            device_channels: 2,
            scratch: Vec::new(),
            keeper: keeper_tx,
        };

        let mut data = [0i16; 6];
        renderer.render(&mut data, to_i16);
        assert_eq!(data, [16383, 16383, 16383, 16383, 0, 0]);

        // Nothing ran on the render path itself
        assert_eq!(ended.load(Ordering::SeqCst), 0);
        match keeper_rx.try_recv() {
            Ok(KeeperCommand::Ended(callbacks)) => callbacks.into_iter().for_each(|on_ended| on_ended()),
            _ => panic!("expected completion callbacks"),
        }
        assert_eq!(ended.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_capture_downmixes_and_cuts_fixed_frames() {
        let frames = Arc::new(Mutex::new(Vec::new()));
        let sink = frames.clone();

        let mut capture = Capture::new();
        capture.device_channels = 2;
        capture.push(&[1.0, 1.0]);

        capture.sink = Some(FrameSink {
            frame_size: 3,
            on_frame: Box::new(move |frame| sink.lock().unwrap().push(frame.to_vec())),
            pending: Vec::new(),
        });
        capture.push(&[0.5, 0.5, 0.0, 1.0, -0.5, -0.5, 1.0, 1.0]);

        let frames = frames.lock().unwrap();
        assert_eq!(frames.as_slice(), &[vec![0.5, 0.5, -0.5]]);
        assert_eq!(capture.sink.as_ref().unwrap().pending, vec![1.0]);
    }

    #[tokio::test]
    async fn test_file_backend_is_routed_to_file_devices() {
        let config = DevicesConfig {
            backend: DeviceBackend::File,
            ..DevicesConfig::default()
        };

        let output = ConfiguredDeviceProvider.open_output(&config, 24000, 1).await.unwrap();
        assert_eq!(output.sample_rate(), 24000);
        output.close();

        let denied = ConfiguredDeviceProvider.request_microphone(&config, 16000).await;
        assert!(matches!(denied, Err(LiveError::Device(_))));
    }
}
