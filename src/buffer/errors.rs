use std::time::Duration;
use thiserror::Error;

use crate::core::settings::SettingsError;
use crate::shared::errors::StorageError;

/// Errors from the external capture process.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CaptureError {
    #[error("FFmpeg not found. Please install ffmpeg.")]
    FfmpegNotFound,
    #[error("Failed to spawn capture process: {0}")]
    SpawnFailed(String),
    #[error("Capture process did not exit within {0:?}")]
    StopTimeout(Duration),
}

/// Errors from the concatenation step of an export.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExportError {
    #[error("Failed to write concat manifest: {0}")]
    ManifestWrite(String),
    #[error("Failed to create output directory: {0}")]
    OutputDir(String),
    #[error("Concat process failed with exit code {exit_code}: {stderr}")]
    ProcessFailed { exit_code: i32, stderr: String },
    #[error("Failed to run concat process: {0}")]
    Spawn(String),
    #[error("Export output missing after concat: {0}")]
    OutputMissing(String),
    #[error("Export worker failed: {0}")]
    Worker(String),
}

/// Top-level error type for buffer operations.
#[derive(Error, Debug)]
pub enum BufferError {
    #[error("Failed to start capture: {0}")]
    CaptureStartFailure(#[source] CaptureError),
    #[error("Capture unavailable after {attempts} consecutive restart attempts")]
    CaptureUnavailable { attempts: u32 },
    #[error("No segments available to export")]
    NoSegmentsAvailable,
    #[error("Export failed: {0}")]
    ExportFailure(#[from] ExportError),
    #[error("An export is already in progress")]
    ExportInProgress,
    #[error("No recording in progress")]
    NotRecording,
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("Buffer coordinator is not running")]
    CoordinatorUnavailable,
}

impl From<SettingsError> for BufferError {
    fn from(error: SettingsError) -> Self {
        match error {
            SettingsError::Storage(e) => BufferError::Storage(e),
            SettingsError::Invalid(msg) => BufferError::InvalidConfig(msg),
        }
    }
}

impl From<std::io::Error> for BufferError {
    fn from(error: std::io::Error) -> Self {
        BufferError::Storage(StorageError::Io(error))
    }
}
