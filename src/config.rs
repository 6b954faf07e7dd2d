//! # Configuration Management
//!
//! This module handles loading and managing application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Key Rust Concepts Used:
//! - **Serde**: Converts between Rust structs and TOML / JSON / environment data
//! - **`#[serde(default)]`**: Missing fields fall back to the `Default` impl
//! - **Option<T>**: Settings that may legitimately be absent (device file paths)
//! - **Result<T, E>**: Loading and validation both report failures instead of panicking
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST`, `PORT` and `GEMINI_API_KEY` environment variables
//! 2. Environment variables with the APP_ prefix (`APP_LIVE__VOICE_NAME=Puck`)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impls)

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;

/// Main application configuration that contains all settings.
///
/// ## Sections:
/// - `server`: where the control API listens
/// - `live`: how to reach the hosted live backend and what to ask it for
/// - `audio`: capture and playback formats
/// - `devices`: which microphone and speakers a session opens
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub live: LiveConfig,
    #[serde(default)]
    pub audio: AudioConfig,
    #[serde(default)]
    pub devices: DevicesConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

/// Connection settings for the hosted live backend.
///
/// ## Fields:
/// - `endpoint`: WebSocket URL of the bidirectional streaming API
/// - `api_key`: appended as `?key=`; usually supplied via `GEMINI_API_KEY`
/// - `model`, `voice_name`, `system_instruction`: sent once in the setup message
/// - `connect_timeout_ms`: how long `start()` waits for the open confirmation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveConfig {
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
    pub voice_name: String,
    pub system_instruction: String,
    pub connect_timeout_ms: u64,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            endpoint: "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent".to_string(),
            api_key: String::new(),
            model: "models/gemini-2.5-flash-native-audio-preview-09-2025".to_string(),
            voice_name: "Zephyr".to_string(),
            system_instruction: "You are a friendly technical advisor for Google Cloud Partners. Speak concisely and helpful.".to_string(),
            connect_timeout_ms: 10_000,
        }
    }
}

/// Capture and playback formats.
///
/// The microphone is read at `capture_sample_rate` in frames of
/// `capture_frame_size` samples; model speech is played on an output device
/// opened at `output_sample_rate` with `output_channels` channels.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub capture_sample_rate: u32,
    pub capture_frame_size: usize,
    pub output_sample_rate: u32,
    pub output_channels: u16,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            capture_sample_rate: 16_000,
            capture_frame_size: 4096,
            output_sample_rate: 24_000,
            output_channels: 1,
        }
    }
}

/// Which implementation opens the microphone and speakers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceBackend {
    /// The host's sound card, through cpal
    #[default]
    System,
    /// WAV files standing in for the microphone and speakers
    File,
}

/// Audio devices.
///
/// - `backend`: `system` (sound card) or `file` (headless runs and tests)
/// - `input_device`, `output_device`: sound card device names; unset means the
///   host's default device
/// - `input_wav`: WAV file played back as the microphone by the `file`
///   backend. Without it every microphone request is refused.
/// - `output_wav`: where the `file` backend writes the mixed model speech
/// - `loop_input`: restart the input file instead of going silent at its end
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DevicesConfig {
    pub backend: DeviceBackend,
    pub input_device: Option<String>,
    pub output_device: Option<String>,
    pub input_wav: Option<PathBuf>,
    pub output_wav: Option<PathBuf>,
    pub loop_input: bool,
}

const REDACTED: &str = "***";

/// Read an unsigned integer field, rejecting values that do not fit `T`.
fn uint_field<T: TryFrom<u64>>(section: &serde_json::Value, key: &str) -> Result<Option<T>> {
    let Some(value) = section.get(key) else {
        return Ok(None);
    };
    let number = value
        .as_u64()
        .ok_or_else(|| anyhow::anyhow!("{} must be a non-negative integer", key))?;
    T::try_from(number)
        .map(Some)
        .map_err(|_| anyhow::anyhow!("{} out of range: {}", key, number))
}

/// Read an optional string field. JSON `null` clears the setting.
fn nullable_field(section: &serde_json::Value, key: &str) -> Result<Option<Option<String>>> {
    match section.get(key) {
        None => Ok(None),
        Some(serde_json::Value::Null) => Ok(Some(None)),
        Some(serde_json::Value::String(s)) => Ok(Some(Some(s.clone()))),
        Some(_) => Err(anyhow::anyhow!("{} must be a string or null", key)),
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=3000`: Override server port
    /// - `APP_AUDIO__CAPTURE_FRAME_SIZE=2048`: Smaller capture frames
    /// - `APP_DEVICES__BACKEND=file`, `APP_DEVICES__INPUT_WAV=./mic.wav`: Use a
    ///   file as the microphone
    /// - `HOST`, `PORT`: Special cases for deployment platforms
    /// - `GEMINI_API_KEY`: API key for the live backend
    ///
    /// Nested keys use `__` because the field names themselves contain `_`.
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        if let Ok(key) = env::var("GEMINI_API_KEY") {
            settings = settings.set_override("live.api_key", key)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - Server port is not 0
    /// - The live endpoint is a WebSocket URL
    /// - Sample rates, frame size and channel count are non-zero
    /// - The connect timeout is non-zero
    ///
    /// A missing API key is not an error here: the service can still serve
    /// its control API, and `start()` reports the failure as a connection error.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if !(self.live.endpoint.starts_with("ws://") || self.live.endpoint.starts_with("wss://")) {
            return Err(anyhow::anyhow!("Live endpoint must be a ws:// or wss:// URL"));
        }

        if self.live.connect_timeout_ms == 0 {
            return Err(anyhow::anyhow!("Connect timeout must be greater than 0"));
        }

        if self.audio.capture_sample_rate == 0 || self.audio.output_sample_rate == 0 {
            return Err(anyhow::anyhow!("Sample rates must be greater than 0"));
        }

        if self.audio.capture_frame_size == 0 {
            return Err(anyhow::anyhow!("Capture frame size must be greater than 0"));
        }

        if self.audio.output_channels == 0 {
            return Err(anyhow::anyhow!("Output channel count must be greater than 0"));
        }

        Ok(())
    }

    /// Update configuration from a JSON string (used for runtime config updates).
    ///
    /// ## Partial updates:
    /// Only the fields present in the JSON change. For example
    /// `{"live": {"voice_name": "Puck"}}` changes the voice for the next
    /// session and leaves everything else alone. The result is validated
    /// before it is accepted; on failure `self` is left untouched.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial: serde_json::Value = serde_json::from_str(json_str)?;
        let mut updated = self.clone();

        if let Some(server) = partial.get("server") {
            if let Some(host) = server.get("host").and_then(|v| v.as_str()) {
                updated.server.host = host.to_string();
            }
            if let Some(port) = uint_field::<u16>(server, "port")? {
                updated.server.port = port;
            }
        }

        if let Some(live) = partial.get("live") {
            if let Some(endpoint) = live.get("endpoint").and_then(|v| v.as_str()) {
                updated.live.endpoint = endpoint.to_string();
            }
            // A redacted key echoed back from GET leaves the real one in place
            if let Some(key) = live.get("api_key").and_then(|v| v.as_str()).filter(|k| *k != REDACTED) {
                updated.live.api_key = key.to_string();
            }
            if let Some(model) = live.get("model").and_then(|v| v.as_str()) {
                updated.live.model = model.to_string();
            }
            if let Some(voice) = live.get("voice_name").and_then(|v| v.as_str()) {
                updated.live.voice_name = voice.to_string();
            }
            if let Some(instruction) = live.get("system_instruction").and_then(|v| v.as_str()) {
                updated.live.system_instruction = instruction.to_string();
            }
            if let Some(timeout) = uint_field::<u64>(live, "connect_timeout_ms")? {
                updated.live.connect_timeout_ms = timeout;
            }
        }

        if let Some(audio) = partial.get("audio") {
            if let Some(rate) = uint_field::<u32>(audio, "capture_sample_rate")? {
                updated.audio.capture_sample_rate = rate;
            }
            if let Some(frame) = uint_field::<usize>(audio, "capture_frame_size")? {
                updated.audio.capture_frame_size = frame;
            }
            if let Some(rate) = uint_field::<u32>(audio, "output_sample_rate")? {
                updated.audio.output_sample_rate = rate;
            }
            if let Some(channels) = uint_field::<u16>(audio, "output_channels")? {
                updated.audio.output_channels = channels;
            }
        }

        if let Some(devices) = partial.get("devices") {
            if let Some(backend) = devices.get("backend") {
                updated.devices.backend = serde_json::from_value(backend.clone())
                    .map_err(|e| anyhow::anyhow!("Unknown device backend: {}", e))?;
            }
            if let Some(name) = nullable_field(devices, "input_device")? {
                updated.devices.input_device = name;
            }
            if let Some(name) = nullable_field(devices, "output_device")? {
                updated.devices.output_device = name;
            }
            if let Some(path) = nullable_field(devices, "input_wav")? {
                updated.devices.input_wav = path.map(PathBuf::from);
            }
            if let Some(path) = nullable_field(devices, "output_wav")? {
                updated.devices.output_wav = path.map(PathBuf::from);
            }
            if let Some(looped) = devices.get("loop_input").and_then(|v| v.as_bool()) {
                updated.devices.loop_input = looped;
            }
        }

        updated.validate()?;
        *self = updated;
        Ok(())
    }

    /// Copy of the configuration that is safe to return from the API.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if !copy.live.api_key.is_empty() {
            copy.live.api_key = REDACTED.to_string();
        }
        copy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.audio.capture_sample_rate, 16_000);
        assert_eq!(config.audio.capture_frame_size, 4096);
        assert_eq!(config.audio.output_sample_rate, 24_000);
        assert_eq!(config.audio.output_channels, 1);
        assert_eq!(config.live.voice_name, "Zephyr");
        assert!(config.devices.input_wav.is_none());
        assert_eq!(config.devices.backend, DeviceBackend::System);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.audio.capture_frame_size = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.live.endpoint = "https://example.com".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_update() {
        let mut config = AppConfig::default();
        let json = r#"{"server": {"port": 9090}, "live": {"voice_name": "Puck"}}"#;
        assert!(config.update_from_json(json).is_ok());
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.live.voice_name, "Puck");
        assert_eq!(config.server.host, "127.0.0.1");
    }

    #[test]
    fn test_rejected_update_leaves_config_unchanged() {
        let mut config = AppConfig::default();
        let json = r#"{"live": {"voice_name": "Puck"}, "audio": {"output_channels": 0}}"#;
        assert!(config.update_from_json(json).is_err());
        assert_eq!(config.live.voice_name, "Zephyr");
        assert_eq!(config.audio.output_channels, 1);
    }

    #[test]
    fn test_redacted_hides_api_key() {
        let mut config = AppConfig::default();
        config.live.api_key = "secret".to_string();
        assert_eq!(config.redacted().live.api_key, "***");
        assert_eq!(config.live.api_key, "secret");
    }

    #[test]
    fn test_out_of_range_numbers_are_rejected() {
        let mut config = AppConfig::default();
        let json = r#"{"audio": {"capture_sample_rate": 4294983296}}"#;
        assert!(config.update_from_json(json).is_err());
        assert_eq!(config.audio.capture_sample_rate, 16_000);

        assert!(config.update_from_json(r#"{"audio": {"output_channels": 65537}}"#).is_err());
        assert!(config.update_from_json(r#"{"audio": {"capture_frame_size": -1}}"#).is_err());
        assert_eq!(config.audio.output_channels, 1);
        assert_eq!(config.audio.capture_frame_size, 4096);
    }

    #[test]
    fn test_device_settings_update() {
        let mut config = AppConfig::default();
        let json = r#"{"devices": {"backend": "file", "input_wav": "/tmp/mic.wav", "output_device": "Speakers"}}"#;
        config.update_from_json(json).unwrap();
        assert_eq!(config.devices.backend, DeviceBackend::File);
        assert_eq!(config.devices.input_wav, Some(PathBuf::from("/tmp/mic.wav")));
        assert_eq!(config.devices.output_device.as_deref(), Some("Speakers"));

        config.update_from_json(r#"{"devices": {"input_wav": null}}"#).unwrap();
        config.update_from_json(r#"{"live": {"api_key": "secret"}}"#).unwrap();
        config.update_from_json(r#"{"live": {"api_key": "***"}}"#).unwrap();
        assert_eq!(config.live.api_key, "secret");
        assert!(config.devices.input_wav.is_none());
        assert!(config.update_from_json(r#"{"devices": {"backend": "alsa"}}"#).is_err());
    }
}
