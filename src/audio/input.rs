//! # File-Backed Devices
//!
//! [`WavFileInput`] plays a WAV file back as if it were a microphone, and
//! [`FileDeviceProvider`] hands out one of those plus a realtime
//! [`VirtualOutput`] for every session. This is the `file` device backend,
//! used for headless runs and tests.
//!
//! ## Input pacing:
//! Frames are delivered on a tokio interval of `frame_size / sample_rate`
//! seconds, so a 4096-sample frame at 16 kHz arrives every 256 ms, the same
//! cadence a sound card would produce.

use crate::audio::device::{DeviceProvider, FrameCallback, InputDevice, OutputDevice};
use crate::audio::output::VirtualOutput;
use crate::config::DevicesConfig;
use crate::error::LiveError;
use async_trait::async_trait;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Read a WAV file and mix it down to mono `f32` samples.
///
/// Returns the samples and the file's sample rate.
pub fn read_wav_mono(path: &Path) -> Result<(Vec<f32>, u32), LiveError> {
    let mut file = File::open(path)
        .map_err(|e| LiveError::Device(format!("cannot open {}: {}", path.display(), e)))?;
    let (header, data) = wav::read(&mut file)
        .map_err(|e| LiveError::Device(format!("cannot read {}: {}", path.display(), e)))?;

    let interleaved: Vec<f32> = match data {
        wav::BitDepth::Eight(samples) => samples.iter().map(|&s| (s as f32 - 128.0) / 128.0).collect(),
        wav::BitDepth::Sixteen(samples) => samples.iter().map(|&s| s as f32 / 32768.0).collect(),
        wav::BitDepth::TwentyFour(samples) => samples.iter().map(|&s| s as f32 / 8_388_608.0).collect(),
        wav::BitDepth::ThirtyTwoFloat(samples) => samples,
        wav::BitDepth::Empty => {
            return Err(LiveError::Device(format!("{} contains no audio", path.display())))
        }
    };

    let channels = header.channel_count.max(1) as usize;
    let mono = interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect();

    Ok((mono, header.sampling_rate))
}

/// A microphone that reads its samples from a WAV file.
pub struct WavFileInput {
    samples: Arc<Vec<f32>>,
    sample_rate: u32,
    loop_input: bool,
    task: Option<JoinHandle<()>>,
}

impl WavFileInput {
    /// Open `path` as a microphone running at `sample_rate`.
    ///
    /// The file must already be at that rate; no resampling is done.
    pub fn open(path: &Path, sample_rate: u32, loop_input: bool) -> Result<Self, LiveError> {
        let (samples, file_rate) = read_wav_mono(path)?;
        if file_rate != sample_rate {
            return Err(LiveError::Device(format!(
                "{} is {} Hz, capture runs at {} Hz",
                path.display(),
                file_rate,
                sample_rate
            )));
        }
        Ok(Self::from_samples(samples, sample_rate, loop_input))
    }

    /// Build an input from samples already in memory.
    pub fn from_samples(samples: Vec<f32>, sample_rate: u32, loop_input: bool) -> Self {
        Self {
            samples: Arc::new(samples),
            sample_rate,
            loop_input,
            task: None,
        }
    }

    /// Copy the next `frame.len()` samples starting at `position`.
    ///
    /// Past the end the frame is either wrapped around (looping) or padded
    /// with silence.
    fn fill_frame(samples: &[f32], position: &mut usize, frame: &mut [f32], loop_input: bool) {
        for slot in frame.iter_mut() {
            if *position >= samples.len() && loop_input && !samples.is_empty() {
                *position = 0;
            }
            *slot = samples.get(*position).copied().unwrap_or(0.0);
            *position += 1;
        }
    }
}

impl InputDevice for WavFileInput {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn start(&mut self, frame_size: usize, mut on_frame: FrameCallback) -> Result<(), LiveError> {
        if self.task.is_some() {
            return Err(LiveError::Device("microphone already started".to_string()));
        }
        if frame_size == 0 {
            return Err(LiveError::Device("frame size must be greater than 0".to_string()));
        }

        let samples = self.samples.clone();
        let loop_input = self.loop_input;
        let period = Duration::from_secs_f64(frame_size as f64 / self.sample_rate.max(1) as f64);

        self.task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately; skip it so the first frame
            // arrives after one frame's worth of audio has "been recorded"
            ticker.tick().await;

            let mut frame = vec![0.0f32; frame_size];
            let mut position = 0usize;
            loop {
                ticker.tick().await;
                Self::fill_frame(&samples, &mut position, &mut frame, loop_input);
                on_frame(&frame);
            }
        }));

        debug!(frame_size, sample_rate = self.sample_rate, "Microphone started");
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            debug!("Microphone stopped");
        }
    }
}

impl Drop for WavFileInput {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Opens file-backed devices from the `input_wav` / `output_wav` settings.
#[derive(Debug, Default)]
pub struct FileDeviceProvider;

#[async_trait]
impl DeviceProvider for FileDeviceProvider {
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
        let output: Arc<dyn OutputDevice> =
            VirtualOutput::realtime(sample_rate, channels, config.output_wav.as_deref())?;
        Ok(output)
    }

    async fn request_microphone(
        &self,
        config: &DevicesConfig,
        sample_rate: u32,
    ) -> Result<Box<dyn InputDevice>, LiveError> {
        let path = config
            .input_wav
            .as_ref()
            .ok_or_else(|| LiveError::Device("no microphone configured".to_string()))?;

        let input = WavFileInput::open(path, sample_rate, config.loop_input)?;
        info!(path = %path.display(), sample_rate, "Microphone granted");
        Ok(Box::new(input))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn write_wav(path: &Path, sample_rate: u32, channels: u16, samples: Vec<i16>) {
        let header = wav::Header::new(wav::header::WAV_FORMAT_PCM, channels, sample_rate, 16);
        let mut file = File::create(path).unwrap();
        wav::write(header, &wav::BitDepth::Sixteen(samples), &mut file).unwrap();
    }

    #[test]
    fn test_read_wav_mixes_down_to_mono() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stereo.wav");
        write_wav(&path, 16000, 2, vec![16384, 0, -16384, -16384]);

        let (samples, rate) = read_wav_mono(&path).unwrap();
        assert_eq!(rate, 16000);
        assert_eq!(samples, vec![0.25, -0.5]);
    }

    #[test]
    fn test_rate_mismatch_is_device_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mic.wav");
        write_wav(&path, 44100, 1, vec![0; 10]);

        assert!(matches!(WavFileInput::open(&path, 16000, false), Err(LiveError::Device(_))));
    }

    #[test]
    fn test_fill_frame_pads_or_loops() {
        let samples = [0.1, 0.2, 0.3];

        let mut position = 0;
        let mut frame = [0.0; 5];
        WavFileInput::fill_frame(&samples, &mut position, &mut frame, false);
        assert_eq!(frame, [0.1, 0.2, 0.3, 0.0, 0.0]);

        let mut position = 0;
        WavFileInput::fill_frame(&samples, &mut position, &mut frame, true);
        assert_eq!(frame, [0.1, 0.2, 0.3, 0.1, 0.2]);
    }

    #[tokio::test]
    async fn test_provider_without_input_denies_microphone() {
        let result = FileDeviceProvider.request_microphone(&DevicesConfig::default(), 16000).await;
        assert!(matches!(result, Err(LiveError::Device(_))));
    }

    #[tokio::test]
    async fn test_provider_reads_paths_from_each_request() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mic.wav");
        write_wav(&path, 16000, 1, vec![0; 16]);

        let mut config = DevicesConfig::default();
        assert!(FileDeviceProvider.request_microphone(&config, 16000).await.is_err());

        config.input_wav = Some(path);
        let mut mic = FileDeviceProvider.request_microphone(&config, 16000).await.unwrap();
        assert_eq!(mic.sample_rate(), 16000);
        mic.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_input_delivers_fixed_size_frames() {
        let frames = Arc::new(Mutex::new(Vec::new()));
        let sink = frames.clone();

        let mut input = WavFileInput::from_samples(vec![0.5; 10], 1000, false);
        input
            .start(
                4,
                Box::new(move |frame| sink.lock().unwrap().push(frame.to_vec())),
            )
            .unwrap();

        tokio::time::sleep(Duration::from_millis(13)).await;
        input.stop();
        input.stop();

        let frames = frames.lock().unwrap();
        assert_eq!(frames.len(), 3);
        assert!(frames.iter().all(|f| f.len() == 4));
        assert_eq!(frames[2], vec![0.5, 0.5, 0.0, 0.0]);
    }
}
