use crate::shared::errors::StorageError;
use crate::shared::paths::{default_output_dir, default_scratch_dir, get_storage_dir};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Environment variable that overrides the configured capture device.
pub const DEVICE_ENV_VAR: &str = "VIDEO_DEVICE";

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("Invalid setting: {0}")]
    Invalid(String),
}

/// Buffer configuration, persisted as `settings.json` in the storage dir.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BufferSettings {
    #[serde(default = "default_segment_duration")]
    pub segment_duration_seconds: u32,
    #[serde(default = "default_window_duration")]
    pub window_duration_seconds: u32,
    #[serde(default = "default_device")]
    pub source_device_identifier: String,
    #[serde(default = "default_input_format")]
    pub input_format: String,
    #[serde(default = "default_framerate")]
    pub framerate: u32,
    #[serde(default = "default_video_size")]
    pub video_size: String,
    #[serde(default = "default_codec")]
    pub video_codec: String,
    #[serde(default = "default_bitrate")]
    pub bitrate: String,
    #[serde(default = "default_pixel_format")]
    pub pixel_format: String,
    #[serde(default = "default_preset")]
    pub preset: String,
    #[serde(default = "default_tune")]
    pub tune: String,
    #[serde(default = "default_scratch_dir")]
    pub scratch_directory: PathBuf,
    #[serde(default = "default_output_dir")]
    pub output_directory: PathBuf,
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,
    #[serde(default = "default_restart_backoff_ms")]
    pub restart_backoff_ms: u64,
    #[serde(default = "default_max_restart_attempts")]
    pub max_restart_attempts: u32,
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
}

fn default_segment_duration() -> u32 {
    5
}

fn default_window_duration() -> u32 {
    60
}

fn default_device() -> String {
    if cfg!(target_os = "windows") {
        "video=USB Video Device".to_string()
    } else {
        "/dev/video0".to_string()
    }
}

fn default_input_format() -> String {
    if cfg!(target_os = "windows") {
        "dshow".to_string()
    } else {
        "v4l2".to_string()
    }
}

fn default_framerate() -> u32 {
    30
}

fn default_video_size() -> String {
    "1920x1080".to_string()
}

fn default_codec() -> String {
    "libx264".to_string()
}

fn default_bitrate() -> String {
    "8000k".to_string()
}

fn default_pixel_format() -> String {
    "yuv420p".to_string()
}

fn default_preset() -> String {
    "ultrafast".to_string()
}

fn default_tune() -> String {
    "zerolatency".to_string()
}

fn default_ffmpeg_path() -> String {
    "ffmpeg".to_string()
}

fn default_restart_backoff_ms() -> u64 {
    1000
}

fn default_max_restart_attempts() -> u32 {
    5
}

fn default_stop_grace_ms() -> u64 {
    3000
}

impl Default for BufferSettings {
    fn default() -> Self {
        Self {
            segment_duration_seconds: default_segment_duration(),
            window_duration_seconds: default_window_duration(),
            source_device_identifier: default_device(),
            input_format: default_input_format(),
            framerate: default_framerate(),
            video_size: default_video_size(),
            video_codec: default_codec(),
            bitrate: default_bitrate(),
            pixel_format: default_pixel_format(),
            preset: default_preset(),
            tune: default_tune(),
            scratch_directory: default_scratch_dir(),
            output_directory: default_output_dir(),
            ffmpeg_path: default_ffmpeg_path(),
            restart_backoff_ms: default_restart_backoff_ms(),
            max_restart_attempts: default_max_restart_attempts(),
            stop_grace_ms: default_stop_grace_ms(),
        }
    }
}

impl BufferSettings {
    /// Number of segments retained: `ceil(window / segment)`.
    pub fn capacity(&self) -> usize {
        if self.segment_duration_seconds == 0 {
            return 0;
        }
        self.window_duration_seconds
            .div_ceil(self.segment_duration_seconds) as usize
    }

    pub fn segment_duration(&self) -> Duration {
        Duration::from_secs(u64::from(self.segment_duration_seconds))
    }

    pub fn restart_backoff(&self) -> Duration {
        Duration::from_millis(self.restart_backoff_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.segment_duration_seconds == 0 {
            return Err(SettingsError::Invalid(
                "segmentDurationSeconds must be greater than zero".to_string(),
            ));
        }
        if self.capacity() == 0 {
            return Err(SettingsError::Invalid(
                "windowDurationSeconds must be greater than zero".to_string(),
            ));
        }
        if self.source_device_identifier.trim().is_empty() {
            return Err(SettingsError::Invalid(
                "sourceDeviceIdentifier must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Applies environment overrides on top of the persisted values.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(device) = std::env::var(DEVICE_ENV_VAR) {
            if !device.trim().is_empty() {
                self.source_device_identifier = device;
            }
        }
        self
    }
}

fn get_settings_path() -> PathBuf {
    get_storage_dir().join("settings.json")
}

/// Loads settings from disk, falling back to defaults when the file is
/// missing or unreadable. Environment overrides are applied last.
pub fn load_settings() -> BufferSettings {
    let path = get_settings_path();

    let settings = match std::fs::read_to_string(&path) {
        Ok(content) => match serde_json::from_str::<BufferSettings>(&content) {
            Ok(settings) => settings,
            Err(e) => {
                tracing::warn!(target: "system", "Invalid settings file {:?}: {}, using defaults", path, e);
                BufferSettings::default()
            }
        },
        Err(_) => BufferSettings::default(),
    };

    settings.with_env_overrides()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_rounds_up() {
        let settings = BufferSettings {
            segment_duration_seconds: 2,
            window_duration_seconds: 10,
            ..BufferSettings::default()
        };
        assert_eq!(settings.capacity(), 5);

        let settings = BufferSettings {
            segment_duration_seconds: 4,
            window_duration_seconds: 10,
            ..BufferSettings::default()
        };
        assert_eq!(settings.capacity(), 3);
    }

    #[test]
    fn test_default_capacity_is_twelve() {
        assert_eq!(BufferSettings::default().capacity(), 12);
    }

    #[test]
    fn test_zero_window_is_invalid() {
        let settings = BufferSettings {
            window_duration_seconds: 0,
            ..BufferSettings::default()
        };
        assert_eq!(settings.capacity(), 0);
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_zero_segment_is_invalid() {
        let settings = BufferSettings {
            segment_duration_seconds: 0,
            ..BufferSettings::default()
        };
        assert!(matches!(settings.validate(), Err(SettingsError::Invalid(_))));
    }

    #[test]
    fn test_partial_json_uses_field_defaults() {
        let json = r#"{ "segmentDurationSeconds": 2, "windowDurationSeconds": 10 }"#;
        let settings: BufferSettings = serde_json::from_str(json).unwrap();

        assert_eq!(settings.capacity(), 5);
        assert_eq!(settings.preset, "ultrafast");
        assert_eq!(settings.restart_backoff_ms, 1000);
    }
}
