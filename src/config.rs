//! Configuration management for CrabRelay
//!
//! Loads and saves the relay's TOML configuration: the ordered capture
//! candidates and their settings, failover timing, broadcast buffering and
//! the HTTP/ICE options used by the service binary.

use crate::errors::RelayError;
use crate::types::{CaptureSettings, DeviceId, PixelFormat};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RelayConfig {
    pub camera: CameraConfig,
    pub failover: FailoverConfig,
    pub broadcast: BroadcastConfig,
    pub server: ServerConfig,
}

/// Capture candidates and the settings applied to whichever one is open
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// Ordered candidate list; the first that opens wins
    pub candidates: Vec<DeviceId>,
    /// Output resolution [width, height]
    pub resolution: [u32; 2],
    /// Output frames per second
    pub fps: u32,
    /// Driver-side buffer depth in frames
    pub buffer_depth: u32,
    pub pixel_format: PixelFormat,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FailoverConfig {
    /// Round-robin rotation period in milliseconds (0 disables)
    pub rotation_period_ms: u64,
    /// Delay before retrying after every candidate failed to open
    pub open_retry_backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
    /// Frames buffered per subscriber before it starts lagging
    pub capacity: usize,
}

/// HTTP service and ICE options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    pub stun_url: Option<String>,
    pub turn_url: Option<String>,
    pub turn_username: Option<String>,
    pub turn_password: Option<String>,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            candidates: vec![DeviceId::Index(0)],
            resolution: [640, 480],
            fps: 30,
            buffer_depth: 1,
            pixel_format: PixelFormat::Mjpeg,
        }
    }
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            rotation_period_ms: 5000,
            open_retry_backoff_ms: 1000,
        }
    }
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self { capacity: 32 }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            stun_url: None,
            turn_url: None,
            turn_username: None,
            turn_password: None,
        }
    }
}

impl CameraConfig {
    pub fn capture_settings(&self) -> CaptureSettings {
        CaptureSettings {
            width: self.resolution[0],
            height: self.resolution[1],
            fps: self.fps,
            buffer_depth: self.buffer_depth,
            pixel_format: self.pixel_format,
        }
    }
}

impl FailoverConfig {
    /// `None` when periodic rotation is disabled
    pub fn rotation_period(&self) -> Option<Duration> {
        (self.rotation_period_ms > 0).then(|| Duration::from_millis(self.rotation_period_ms))
    }

    pub fn open_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.open_retry_backoff_ms)
    }
}

impl RelayConfig {
    /// Configuration with the given candidates and defaults elsewhere
    pub fn with_candidates(candidates: Vec<DeviceId>) -> Self {
        let mut config = Self::default();
        config.camera.candidates = candidates;
        config
    }

    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, RelayError> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .map_err(|e| RelayError::ConfigError(format!("Failed to read config file: {}", e)))?;

        let config: RelayConfig = toml::from_str(&contents)
            .map_err(|e| RelayError::ConfigError(format!("Failed to parse config file: {}", e)))?;

        log::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), RelayError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| {
                    RelayError::ConfigError(format!("Failed to create config directory: {}", e))
                })?;
            }
        }

        let toml_string = toml::to_string_pretty(self)
            .map_err(|e| RelayError::ConfigError(format!("Failed to serialize config: {}", e)))?;

        fs::write(path, toml_string)
            .map_err(|e| RelayError::ConfigError(format!("Failed to write config file: {}", e)))?;

        log::info!("Saved configuration to {:?}", path);
        Ok(())
    }

    /// Get default config file path
    pub fn default_path() -> PathBuf {
        PathBuf::from("crabrelay.toml")
    }

    /// Load from default location or fall back to defaults
    pub fn load_or_default() -> Self {
        Self::load_from_file(Self::default_path()).unwrap_or_else(|e| {
            log::warn!("Failed to load config, using defaults: {}", e);
            Self::default()
        })
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), RelayError> {
        let invalid = |msg: &str| Err(RelayError::ConfigError(msg.to_string()));

        if self.camera.candidates.is_empty() {
            return invalid("At least one capture candidate is required");
        }
        if self.camera.resolution[0] == 0 || self.camera.resolution[1] == 0 {
            return invalid("Invalid resolution");
        }
        // H.264 encodes 4:2:0 chroma
        if self.camera.resolution[0] % 2 != 0 || self.camera.resolution[1] % 2 != 0 {
            return invalid("Resolution width and height must be even");
        }
        if self.camera.fps == 0 || self.camera.fps > 240 {
            return invalid("Invalid FPS (must be 1-240)");
        }
        if self.camera.buffer_depth == 0 {
            return invalid("Buffer depth must be at least 1");
        }
        if self.broadcast.capacity == 0 {
            return invalid("Broadcast capacity must be at least 1");
        }
        if self.server.turn_url.is_some()
            && (self.server.turn_username.is_none() || self.server.turn_password.is_none())
        {
            return invalid("TURN server requires username and password");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RelayConfig::default();
        assert_eq!(config.camera.resolution, [640, 480]);
        assert_eq!(config.camera.fps, 30);
        assert_eq!(config.failover.rotation_period_ms, 5000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut no_candidates = RelayConfig::default();
        no_candidates.camera.candidates.clear();
        assert!(no_candidates.validate().is_err());

        let mut bad_fps = RelayConfig::default();
        bad_fps.camera.fps = 0;
        assert!(bad_fps.validate().is_err());

        let mut odd_width = RelayConfig::default();
        odd_width.camera.resolution = [641, 480];
        assert!(odd_width.validate().is_err());

        let mut bad_turn = RelayConfig::default();
        bad_turn.server.turn_url = Some("turn:relay.example.com:3478".to_string());
        assert!(bad_turn.validate().is_err());
    }

    #[test]
    fn test_rotation_period_disabled_at_zero() {
        let mut config = FailoverConfig::default();
        assert_eq!(config.rotation_period(), Some(Duration::from_secs(5)));
        config.rotation_period_ms = 0;
        assert_eq!(config.rotation_period(), None);
    }

    #[test]
    fn test_config_toml_format() {
        let config = RelayConfig::with_candidates(vec![
            DeviceId::Index(0),
            DeviceId::Uri("file:fallback.png".to_string()),
        ]);
        let toml_string = toml::to_string_pretty(&config).unwrap();

        assert!(toml_string.contains("[camera]"));
        assert!(toml_string.contains("[failover]"));
        assert!(toml_string.contains("[broadcast]"));
        assert!(toml_string.contains("[server]"));
        assert!(toml_string.contains("file:fallback.png"));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: RelayConfig = toml::from_str(
            r#"
            [camera]
            candidates = ["1", "0"]
            fps = 15
            "#,
        )
        .unwrap();
        assert_eq!(
            config.camera.candidates,
            vec![DeviceId::Index(1), DeviceId::Index(0)]
        );
        assert_eq!(config.camera.fps, 15);
        assert_eq!(config.camera.resolution, [640, 480]);
        assert_eq!(config.broadcast.capacity, 32);
    }

    #[test]
    fn test_load_nonexistent_file() {
        let result = RelayConfig::load_from_file("nonexistent_crabrelay.toml");
        assert!(result.is_ok());
        assert_eq!(result.unwrap().camera.fps, 30);
    }
}
