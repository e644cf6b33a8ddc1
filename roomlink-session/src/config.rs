use crate::capture::ResolutionTier;
use crate::transport::IceServer;
use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Client configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub signaling: SignalingConfig,
    pub media: MediaConfig,
    pub audio: AudioConfig,
    pub stats: StatsConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    /// WebSocket URL of the signaling service
    pub url: String,
    /// Upper bound for every request/response round-trip
    pub request_timeout_ms: u64,
    /// ICE servers handed to every transport
    pub ice_servers: Vec<IceServer>,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:3000/signaling".to_string(),
            request_timeout_ms: 10_000,
            ice_servers: vec![
                IceServer::stun("stun:127.0.0.1:3478"),
                IceServer::turn("turn:127.0.0.1:3478", "user1", "pass1"),
            ],
        }
    }
}

impl SignalingConfig {
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    /// Preferred camera; `None` lets the platform choose
    pub camera_id: Option<String>,
    /// Preferred microphone; `None` lets the platform choose
    pub mic_id: Option<String>,
    /// Tier requested before the camera has been probed
    pub default_resolution: ResolutionTier,
    /// Pause between stopping a camera and reopening one
    pub camera_settle_delay_ms: u64,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            camera_id: None,
            mic_id: None,
            default_resolution: ResolutionTier::P360,
            camera_settle_delay_ms: 300,
        }
    }
}

impl MediaConfig {
    #[must_use]
    pub const fn camera_settle_delay(&self) -> Duration {
        Duration::from_millis(self.camera_settle_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub mic_gain: f32,
    pub speaker_gain: f32,
    /// Output device for remote audio; `None` is the system default
    pub speaker_id: Option<String>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            mic_gain: 1.0,
            speaker_gain: 1.0,
            speaker_id: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsConfig {
    pub interval_ms: u64,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self { interval_ms: 1000 }
    }
}

impl StatsConfig {
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl Config {
    /// Load configuration from file and environment variables
    ///
    /// Priority:
    /// 1. Environment variables (`ROOMLINK_SIGNALING__URL`, ...)
    /// 2. Config file (if provided and present)
    /// 3. Defaults
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("ROOMLINK")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Check for values the session cannot work with
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if !self.signaling.url.starts_with("ws://") && !self.signaling.url.starts_with("wss://") {
            errors.push(format!(
                "signaling.url must be a ws:// or wss:// URL, got '{}'",
                self.signaling.url
            ));
        }
        if self.signaling.request_timeout_ms == 0 {
            errors.push("signaling.request_timeout_ms must be greater than 0".to_string());
        }
        if self.stats.interval_ms == 0 {
            errors.push("stats.interval_ms must be greater than 0".to_string());
        }
        for (name, gain) in [
            ("audio.mic_gain", self.audio.mic_gain),
            ("audio.speaker_gain", self.audio.speaker_gain),
        ] {
            if !(0.0..=crate::audio::MAX_GAIN).contains(&gain) {
                errors.push(format!(
                    "{name} must be within 0.0..={}, got {gain}",
                    crate::audio::MAX_GAIN
                ));
            }
        }
        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            errors.push(format!(
                "logging.format must be 'json' or 'pretty', got '{}'",
                self.logging.format
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.signaling.request_timeout(), Duration::from_secs(10));
        assert_eq!(config.stats.interval(), Duration::from_secs(1));
        assert_eq!(config.media.default_resolution, ResolutionTier::P360);
        assert_eq!(config.signaling.ice_servers.len(), 2);
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let mut config = Config::default();
        config.signaling.url = "http://localhost".to_string();
        config.stats.interval_ms = 0;
        config.audio.mic_gain = 3.0;

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 3);
        assert!(errors[2].contains("audio.mic_gain"));
    }

    #[test]
    fn test_load_from_yaml_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "signaling:\n  url: wss://meet.example.com/ws\n  request_timeout_ms: 2500\nmedia:\n  default_resolution: 720p\naudio:\n  speaker_gain: 1.5\n"
        )
        .unwrap();

        let config = Config::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.signaling.url, "wss://meet.example.com/ws");
        assert_eq!(config.signaling.request_timeout_ms, 2500);
        assert_eq!(config.media.default_resolution, ResolutionTier::P720);
        assert!((config.audio.speaker_gain - 1.5).abs() < f32::EPSILON);
        assert_eq!(config.stats.interval_ms, 1000);
    }
}
