//! Capture process supervision.
//!
//! A `CaptureBackend` launches one encoder invocation per segment and reports
//! its lifecycle on a typed event channel. The coordinator is the only
//! subscriber. Every launch carries a `LaunchId`, so events from a process the
//! coordinator has already stopped or replaced can be recognised and dropped.

pub mod ffmpeg;
#[cfg(test)]
pub mod testing;

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use super::errors::{CaptureError, ExportError};
use super::types::SegmentSink;

pub type LaunchId = u64;

/// Extra time allowed on top of the grace period for the supervisor to kill
/// and reap a process that ignored the graceful request.
const STOP_MARGIN: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq)]
pub enum CaptureEventKind {
    Started,
    SegmentCompleted { path: PathBuf },
    Crashed { exit_code: Option<i32> },
    StoppedByRequest,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CaptureEvent {
    pub launch: LaunchId,
    pub kind: CaptureEventKind,
}

/// How a capture process ended.
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureExit {
    Completed,
    Crashed { exit_code: Option<i32> },
    Stopped,
}

impl CaptureExit {
    pub fn into_event(self, launch: LaunchId, path: &Path) -> CaptureEvent {
        let kind = match self {
            CaptureExit::Completed => CaptureEventKind::SegmentCompleted {
                path: path.to_path_buf(),
            },
            CaptureExit::Crashed { exit_code } => CaptureEventKind::Crashed { exit_code },
            CaptureExit::Stopped => CaptureEventKind::StoppedByRequest,
        };
        CaptureEvent { launch, kind }
    }
}

#[derive(Debug, Clone)]
pub struct CaptureRequest {
    pub launch: LaunchId,
    pub sink: SegmentSink,
}

/// The external encoder, seen as a black box.
pub trait CaptureBackend: Send + Sync + 'static {
    /// Checks that the encoder can be invoked at all.
    fn probe(&self) -> Result<(), CaptureError>;

    /// Starts one capture process. Must be called from within a tokio runtime.
    fn launch(
        &self,
        request: CaptureRequest,
        events: mpsc::Sender<CaptureEvent>,
    ) -> Result<CaptureProcess, CaptureError>;

    /// Stream-copies the files listed in `manifest` into `output`. Blocking.
    fn concat(&self, manifest: &Path, output: &Path) -> Result<(), ExportError>;
}

/// Handle to one running capture process.
///
/// Dropping the handle without calling `stop` also asks the supervisor to
/// terminate the process.
#[derive(Debug)]
pub struct CaptureProcess {
    launch: LaunchId,
    stop_tx: Option<oneshot::Sender<()>>,
    exit_rx: Option<oneshot::Receiver<CaptureExit>>,
}

impl CaptureProcess {
    pub fn new(
        launch: LaunchId,
        stop_tx: oneshot::Sender<()>,
        exit_rx: oneshot::Receiver<CaptureExit>,
    ) -> Self {
        Self {
            launch,
            stop_tx: Some(stop_tx),
            exit_rx: Some(exit_rx),
        }
    }

    /// Requests termination and waits a bounded time for the exit outcome.
    ///
    /// Returns `Completed` when the process had already finished its segment
    /// before the request reached it.
    pub async fn stop(mut self, grace: Duration) -> Result<CaptureExit, CaptureError> {
        if let Some(stop_tx) = self.stop_tx.take() {
            tracing::debug!(target: "buffer", "[CAPTURE] Stopping launch {}", self.launch);
            let _ = stop_tx.send(());
        }

        let Some(exit_rx) = self.exit_rx.take() else {
            return Ok(CaptureExit::Stopped);
        };

        match tokio::time::timeout(grace + STOP_MARGIN, exit_rx).await {
            Ok(Ok(exit)) => Ok(exit),
            // supervisor already gone, nothing left running
            Ok(Err(_)) => Ok(CaptureExit::Stopped),
            Err(_) => Err(CaptureError::StopTimeout(grace + STOP_MARGIN)),
        }
    }
}
