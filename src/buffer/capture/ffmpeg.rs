use std::collections::VecDeque;
use std::path::Path;
use std::process::{Command as StdCommand, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::{mpsc, oneshot};

use super::{CaptureBackend, CaptureEvent, CaptureEventKind, CaptureExit, CaptureProcess, CaptureRequest};
use crate::buffer::errors::{CaptureError, ExportError};
use crate::buffer::types::SinkMode;
use crate::core::settings::BufferSettings;

/// Stderr lines kept for the crash log.
const STDERR_TAIL_LINES: usize = 16;

/// Encoder parameters passed to every capture invocation.
#[derive(Debug, Clone)]
pub struct CaptureProfile {
    pub ffmpeg_path: String,
    pub input_format: String,
    pub device: String,
    pub framerate: u32,
    pub video_size: String,
    pub video_codec: String,
    pub bitrate: String,
    pub preset: String,
    pub tune: String,
    pub pixel_format: String,
    pub stop_grace: Duration,
}

impl CaptureProfile {
    pub fn from_settings(settings: &BufferSettings) -> Self {
        Self {
            ffmpeg_path: settings.ffmpeg_path.clone(),
            input_format: settings.input_format.clone(),
            device: settings.source_device_identifier.clone(),
            framerate: settings.framerate,
            video_size: settings.video_size.clone(),
            video_codec: settings.video_codec.clone(),
            bitrate: settings.bitrate.clone(),
            preset: settings.preset.clone(),
            tune: settings.tune.clone(),
            pixel_format: settings.pixel_format.clone(),
            stop_grace: settings.stop_grace(),
        }
    }
}

/// Arguments for one fixed-duration capture into a single file.
pub fn capture_args(profile: &CaptureProfile, output: &Path, duration: Duration) -> Vec<String> {
    vec![
        "-hide_banner".to_string(),
        "-loglevel".to_string(), "error".to_string(),
        "-f".to_string(), profile.input_format.clone(),
        "-framerate".to_string(), profile.framerate.to_string(),
        "-video_size".to_string(), profile.video_size.clone(),
        "-i".to_string(), profile.device.clone(),
        "-c:v".to_string(), profile.video_codec.clone(),
        "-b:v".to_string(), profile.bitrate.clone(),
        "-preset".to_string(), profile.preset.clone(),
        "-tune".to_string(), profile.tune.clone(),
        "-pix_fmt".to_string(), profile.pixel_format.clone(),
        "-t".to_string(), format!("{:.3}", duration.as_secs_f64()),
        "-y".to_string(),
        output.to_string_lossy().to_string(),
    ]
}

/// Arguments for a stream-copy concat of a manifest into `output`.
pub fn concat_args(manifest: &Path, output: &Path) -> Vec<String> {
    vec![
        "-hide_banner".to_string(),
        "-loglevel".to_string(), "error".to_string(),
        "-y".to_string(),
        "-f".to_string(), "concat".to_string(),
        "-safe".to_string(), "0".to_string(),
        "-i".to_string(), manifest.to_string_lossy().to_string(),
        "-c".to_string(), "copy".to_string(),
        "-movflags".to_string(), "+faststart".to_string(),
        output.to_string_lossy().to_string(),
    ]
}

pub struct FfmpegBackend {
    profile: CaptureProfile,
}

impl FfmpegBackend {
    pub fn new(profile: CaptureProfile) -> Self {
        Self { profile }
    }

    pub fn from_settings(settings: &BufferSettings) -> Self {
        Self::new(CaptureProfile::from_settings(settings))
    }
}

impl CaptureBackend for FfmpegBackend {
    fn probe(&self) -> Result<(), CaptureError> {
        StdCommand::new(&self.profile.ffmpeg_path)
            .arg("-version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|_| CaptureError::FfmpegNotFound)?;
        Ok(())
    }

    fn launch(
        &self,
        request: CaptureRequest,
        events: mpsc::Sender<CaptureEvent>,
    ) -> Result<CaptureProcess, CaptureError> {
        let args = match request.sink.mode {
            SinkMode::FixedDuration => {
                capture_args(&self.profile, &request.sink.path, request.sink.duration)
            }
        };
        tracing::debug!(target: "buffer", "[CAPTURE] launch={} args: {:?}", request.launch, args);

        let child = Command::new(&self.profile.ffmpeg_path)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CaptureError::SpawnFailed(e.to_string()))?;

        let launch = request.launch;
        let (stop_tx, stop_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = oneshot::channel();

        tokio::spawn(supervise(
            child,
            request,
            self.profile.stop_grace,
            events,
            stop_rx,
            exit_tx,
        ));

        Ok(CaptureProcess::new(launch, stop_tx, exit_rx))
    }

    fn concat(&self, manifest: &Path, output: &Path) -> Result<(), ExportError> {
        let args = concat_args(manifest, output);
        tracing::debug!(target: "buffer", "[EXPORT] concat args: {:?}", args);

        let result = StdCommand::new(&self.profile.ffmpeg_path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .map_err(|e| ExportError::Spawn(e.to_string()))?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            tracing::error!(target: "buffer", "[EXPORT] Concat failed: {}", stderr);
            return Err(ExportError::ProcessFailed {
                exit_code: result.status.code().unwrap_or(-1),
                stderr: stderr.trim().to_string(),
            });
        }

        Ok(())
    }
}

/// Owns one ffmpeg child until it exits, then reports the outcome on both the
/// exit channel (for a pending `stop`) and the event stream.
async fn supervise(
    mut child: Child,
    request: CaptureRequest,
    grace: Duration,
    events: mpsc::Sender<CaptureEvent>,
    mut stop_rx: oneshot::Receiver<()>,
    exit_tx: oneshot::Sender<CaptureExit>,
) {
    let launch = request.launch;
    let stderr_task = child.stderr.take().map(|stderr| tokio::spawn(drain_stderr(stderr)));

    let _ = events
        .send(CaptureEvent {
            launch,
            kind: CaptureEventKind::Started,
        })
        .await;

    let waited = tokio::select! {
        status = child.wait() => Some(status),
        // a dropped handle counts as a stop request
        _ = &mut stop_rx => None,
    };

    let exit = match waited {
        Some(Ok(status)) if status.success() => CaptureExit::Completed,
        Some(Ok(status)) => CaptureExit::Crashed {
            exit_code: status.code(),
        },
        Some(Err(e)) => {
            tracing::error!(target: "buffer", "[CAPTURE] launch={} wait failed: {}", launch, e);
            CaptureExit::Crashed { exit_code: None }
        }
        None => {
            request_graceful_stop(&mut child, grace, launch).await;
            CaptureExit::Stopped
        }
    };

    let tail = match stderr_task {
        Some(task) => task.await.unwrap_or_default(),
        None => Vec::new(),
    };

    if let CaptureExit::Crashed { exit_code } = &exit {
        tracing::warn!(target: "buffer",
            "[CAPTURE] launch={} exited abnormally (code {:?}) writing {:?}: {}",
            launch, exit_code, request.sink.path, tail.join(" | "));
    }

    let event = exit.clone().into_event(launch, &request.sink.path);
    let _ = exit_tx.send(exit);
    let _ = events.send(event).await;
}

/// Asks ffmpeg to finish via `q` on stdin, then kills it once the grace
/// period runs out.
async fn request_graceful_stop(child: &mut Child, grace: Duration, launch: u64) {
    if let Some(mut stdin) = child.stdin.take() {
        if let Err(e) = stdin.write_all(b"q\n").await {
            tracing::debug!(target: "buffer", "[CAPTURE] launch={} stdin closed before stop: {}", launch, e);
        }
        drop(stdin);
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => {
            tracing::warn!(target: "buffer", "[CAPTURE] launch={} wait after stop failed: {}", launch, e);
        }
        Err(_) => {
            tracing::warn!(target: "buffer",
                "[CAPTURE] launch={} ignored stop for {:?}, killing", launch, grace);
            if let Err(e) = child.kill().await {
                tracing::error!(target: "buffer", "[CAPTURE] launch={} kill failed: {}", launch, e);
            }
        }
    }
}

async fn drain_stderr(stderr: ChildStderr) -> Vec<String> {
    let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
    let mut lines = BufReader::new(stderr).lines();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                tracing::trace!(target: "buffer", "ffmpeg: {}", trimmed);
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(trimmed.to_string());
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(target: "buffer", "[CAPTURE] Failed to read ffmpeg stderr: {}", e);
                break;
            }
        }
    }

    tail.into_iter().collect()
}
