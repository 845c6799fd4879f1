//! Rolling segment buffer: the last N seconds of a capture device kept on
//! disk as short segments, exportable as one file on demand.

pub mod capture;
pub mod errors;
pub mod export;
pub mod recorder;
pub mod ring;
pub mod store;
pub mod types;

use std::sync::Arc;

use tokio::task::JoinHandle;

pub use capture::ffmpeg::FfmpegBackend;
pub use capture::CaptureBackend;
pub use errors::{BufferError, CaptureError, ExportError};
pub use recorder::coordinator::{BufferCoordinator, BufferNotice, BufferStatus, CoordinatorHandle};
pub use types::{ExportArtifact, Segment};

use crate::core::settings::BufferSettings;

/// Spawns a coordinator driving the given backend. Must be called from within
/// a tokio runtime.
pub fn spawn_with_backend(
    settings: &BufferSettings,
    backend: Arc<dyn CaptureBackend>,
) -> Result<(CoordinatorHandle, JoinHandle<()>), BufferError> {
    let (coordinator, handle) = BufferCoordinator::new(settings, backend)?;
    let task = tokio::spawn(coordinator.run());
    Ok((handle, task))
}

/// Spawns a coordinator backed by the ffmpeg command line tool.
pub fn spawn(settings: &BufferSettings) -> Result<(CoordinatorHandle, JoinHandle<()>), BufferError> {
    spawn_with_backend(settings, Arc::new(FfmpegBackend::from_settings(settings)))
}
