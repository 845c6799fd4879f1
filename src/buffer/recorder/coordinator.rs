//! BufferCoordinator - single owner actor for the rolling buffer.
//!
//! The coordinator owns the capture process, the segment ring and the scratch
//! directory, and processes everything through the state machine. Start, stop,
//! rotation and crash restarts are serialized through this one task, so at most
//! one capture process ever writes into the scratch directory.
//!
//! Architecture:
//! - `CoordinatorHandle` sends `Command`s via command_tx
//! - capture supervisors send `CaptureEvent`s via capture_tx
//! - restart timers and export workers send `WorkerEvent`s via worker_tx
//! - subscribers receive `BufferNotice`s on a broadcast channel

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};

use super::super::capture::{
    CaptureBackend, CaptureEvent, CaptureEventKind, CaptureExit, CaptureProcess, CaptureRequest,
    LaunchId,
};
use super::super::errors::{BufferError, CaptureError, ExportError};
use super::super::export::ExportService;
use super::super::ring::{RingSnapshot, SegmentRing};
use super::super::store::SegmentStore;
use super::super::types::{ExportArtifact, Segment, SegmentSink};
use super::state::{transition, BufferEvent, BufferState, RestartPolicy, SideEffect};
use crate::core::settings::BufferSettings;

/// Commands sent from the API layer to the coordinator.
#[derive(Debug)]
pub enum Command {
    Start {
        response_tx: oneshot::Sender<Result<(), BufferError>>,
    },
    Stop {
        response_tx: oneshot::Sender<Result<(), BufferError>>,
    },
    Export {
        response_tx: oneshot::Sender<Result<ExportArtifact, BufferError>>,
    },
    Status {
        response_tx: oneshot::Sender<BufferStatus>,
    },
}

/// Events from timers and export workers.
#[derive(Debug)]
enum WorkerEvent {
    RestartDue {
        token: u64,
    },
    ExportFinished {
        snapshot_id: u64,
        result: Result<ExportArtifact, BufferError>,
    },
}

/// Buffer status for the API layer.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BufferStatus {
    pub is_recording: bool,
    pub is_exporting: bool,
    pub segment_count: usize,
    pub capacity: usize,
    pub retained_indices: Vec<u64>,
    pub retained_seconds: f64,
    pub next_index: u64,
    pub generation: u64,
    pub last_error: Option<String>,
    pub started_at_timestamp: Option<f64>,
}

/// Notifications broadcast to subscribers.
#[derive(Debug, Clone)]
pub enum BufferNotice {
    StateChanged(BufferStatus),
    SegmentAdmitted { index: u64, path: PathBuf },
    CaptureUnavailable { attempts: u32 },
    ExportCompleted { path: PathBuf },
    ExportFailed { error: String },
}

struct ActiveCapture {
    launch: LaunchId,
    index: u64,
    path: PathBuf,
    /// `None` when the launch itself failed and a synthetic crash is pending.
    process: Option<CaptureProcess>,
}

pub struct BufferCoordinator {
    state: BufferState,
    policy: RestartPolicy,
    backend: Arc<dyn CaptureBackend>,
    store: SegmentStore,
    ring: SegmentRing,
    exporter: ExportService,
    segment_duration: Duration,
    restart_backoff: Duration,
    stop_grace: Duration,
    generation: u64,
    next_index: u64,
    next_launch: LaunchId,
    active: Option<ActiveCapture>,
    restart_token: u64,
    pending_snapshot: Option<RingSnapshot>,
    pending_export_response: Option<oneshot::Sender<Result<ExportArtifact, BufferError>>>,
    last_error: Option<String>,
    command_rx: mpsc::Receiver<Command>,
    capture_rx: mpsc::Receiver<CaptureEvent>,
    capture_tx: mpsc::Sender<CaptureEvent>,
    worker_rx: mpsc::Receiver<WorkerEvent>,
    worker_tx: mpsc::Sender<WorkerEvent>,
    notice_tx: broadcast::Sender<BufferNotice>,
}

impl BufferCoordinator {
    pub fn new(
        settings: &BufferSettings,
        backend: Arc<dyn CaptureBackend>,
    ) -> Result<(Self, CoordinatorHandle), BufferError> {
        settings.validate()?;

        let ring = SegmentRing::new(settings.capacity())?;
        let store = SegmentStore::open(&settings.scratch_directory)?;
        let exporter = ExportService::new(
            backend.clone(),
            store.clone(),
            settings.output_directory.clone(),
        );

        let (command_tx, command_rx) = mpsc::channel(16);
        let (capture_tx, capture_rx) = mpsc::channel(64);
        let (worker_tx, worker_rx) = mpsc::channel(16);
        let (notice_tx, _) = broadcast::channel(64);

        let coordinator = Self {
            state: BufferState::Idle,
            policy: RestartPolicy {
                max_attempts: settings.max_restart_attempts,
            },
            backend,
            store,
            ring,
            exporter,
            segment_duration: settings.segment_duration(),
            restart_backoff: settings.restart_backoff(),
            stop_grace: settings.stop_grace(),
            generation: 0,
            next_index: 0,
            next_launch: 0,
            active: None,
            restart_token: 0,
            pending_snapshot: None,
            pending_export_response: None,
            last_error: None,
            command_rx,
            capture_rx,
            capture_tx,
            worker_rx,
            worker_tx,
            notice_tx: notice_tx.clone(),
        };

        Ok((coordinator, CoordinatorHandle::new(command_tx, notice_tx)))
    }

    /// Main event loop. Run this as a tokio task; it ends when every handle
    /// has been dropped.
    pub async fn run(mut self) {
        tracing::info!(target: "buffer",
            "[COORDINATOR] Starting event loop (capacity={}, segment={:?})",
            self.ring.capacity(), self.segment_duration);

        loop {
            tokio::select! {
                cmd = self.command_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => {
                        tracing::info!(target: "buffer", "[COORDINATOR] All handles dropped, shutting down");
                        break;
                    }
                },
                Some(event) = self.capture_rx.recv() => {
                    self.handle_capture_event(event).await;
                }
                Some(event) = self.worker_rx.recv() => {
                    self.handle_worker_event(event).await;
                }
            }
        }

        self.teardown().await;
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Start { response_tx } => {
                let result = self.handle_start().await;
                let _ = response_tx.send(result);
            }
            Command::Stop { response_tx } => {
                let result = self.handle_stop().await;
                let _ = response_tx.send(result);
            }
            Command::Export { response_tx } => {
                self.handle_export(response_tx).await;
            }
            Command::Status { response_tx } => {
                let _ = response_tx.send(self.status());
            }
        }
    }

    async fn handle_start(&mut self) -> Result<(), BufferError> {
        match self.state {
            BufferState::Recording(_) => return Ok(()),
            BufferState::Exporting { .. } => return Err(BufferError::ExportInProgress),
            BufferState::Idle => {}
        }

        // probing runs the encoder once, keep it off the actor task
        let backend = self.backend.clone();
        tokio::task::spawn_blocking(move || backend.probe())
            .await
            .map_err(|e| BufferError::CaptureStartFailure(CaptureError::SpawnFailed(e.to_string())))?
            .map_err(BufferError::CaptureStartFailure)?;

        let (new_state, effects) = transition(self.state.clone(), BufferEvent::StartRequested, self.policy);
        self.state = new_state;
        self.last_error = None;

        for effect in effects {
            if let Err(e) = self.execute_effect(effect, true).await {
                self.fail_start(&e);
                return Err(e);
            }
        }

        tracing::info!(target: "buffer", "[COORDINATOR] Recording started (generation {})", self.generation);
        Ok(())
    }

    fn fail_start(&mut self, error: &BufferError) {
        tracing::error!(target: "buffer", "[COORDINATOR] Start failed: {}", error);
        self.last_error = Some(error.to_string());
        self.cancel_restart();
        self.active = None;

        let (new_state, _) = transition(self.state.clone(), BufferEvent::StartFailed, self.policy);
        self.state = new_state;
        self.publish(BufferNotice::StateChanged(self.status()));
    }

    async fn handle_stop(&mut self) -> Result<(), BufferError> {
        if !self.state.is_recording() {
            return Err(BufferError::NotRecording);
        }

        tracing::info!(target: "buffer", "[COORDINATOR] Stopping capture");
        self.dispatch(BufferEvent::StopRequested).await;
        Ok(())
    }

    async fn handle_export(
        &mut self,
        response_tx: oneshot::Sender<Result<ExportArtifact, BufferError>>,
    ) {
        if self.state.is_exporting() {
            let _ = response_tx.send(Err(BufferError::ExportInProgress));
            return;
        }

        if self.ring.is_empty() {
            tracing::info!(target: "buffer", "[COORDINATOR] Export requested with an empty ring");
            let _ = response_tx.send(Err(BufferError::NoSegmentsAvailable));
            return;
        }

        self.pending_export_response = Some(response_tx);
        self.dispatch(BufferEvent::ExportRequested).await;
    }

    async fn handle_capture_event(&mut self, event: CaptureEvent) {
        let Some(active) = self.active.as_ref() else {
            tracing::debug!(target: "buffer", "[COORDINATOR] Ignoring event from inactive launch {}: {:?}", event.launch, event.kind);
            return;
        };
        if active.launch != event.launch {
            tracing::debug!(target: "buffer", "[COORDINATOR] Ignoring stale event from launch {}: {:?}", event.launch, event.kind);
            return;
        }

        match event.kind {
            CaptureEventKind::Started => {
                tracing::debug!(target: "buffer", "[CAPTURE] Segment {} recording to {:?}", active.index, active.path);
            }
            CaptureEventKind::StoppedByRequest => {
                self.active = None;
            }
            CaptureEventKind::SegmentCompleted { path } => {
                self.active = None;
                self.dispatch(BufferEvent::SegmentCompleted { path }).await;
            }
            CaptureEventKind::Crashed { exit_code } => {
                let path = active.path.clone();
                tracing::warn!(target: "buffer",
                    "[CAPTURE] Segment {} crashed with exit code {:?}", active.index, exit_code);
                self.active = None;
                self.dispatch(BufferEvent::CaptureCrashed { path, exit_code }).await;
            }
        }
    }

    async fn handle_worker_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::RestartDue { token } => {
                if token != self.restart_token || self.active.is_some() {
                    tracing::debug!(target: "buffer", "[COORDINATOR] Dropping cancelled restart");
                    return;
                }
                self.dispatch(BufferEvent::RestartDue).await;
            }
            WorkerEvent::ExportFinished {
                snapshot_id,
                result,
            } => {
                self.dispatch(BufferEvent::ExportFinished { snapshot_id }).await;
                self.finish_export(result);
            }
        }
    }

    fn finish_export(&mut self, result: Result<ExportArtifact, BufferError>) {
        match &result {
            Ok(artifact) => {
                tracing::info!(target: "buffer",
                    "[EXPORT] Saved {} segments to {:?}", artifact.segment_count, artifact.path);
                self.publish(BufferNotice::ExportCompleted {
                    path: artifact.path.clone(),
                });
            }
            Err(e) => {
                tracing::error!(target: "buffer", "[EXPORT] Export failed: {}", e);
                self.last_error = Some(e.to_string());
                self.publish(BufferNotice::ExportFailed {
                    error: e.to_string(),
                });
            }
        }

        if let Some(response_tx) = self.pending_export_response.take() {
            let _ = response_tx.send(result);
        }
    }

    /// Runs one event through the state machine. Launch failures here count
    /// as crashes rather than errors.
    async fn dispatch(&mut self, event: BufferEvent) {
        let (new_state, effects) = transition(self.state.clone(), event, self.policy);
        self.state = new_state;

        for effect in effects {
            if let Err(e) = self.execute_effect(effect, false).await {
                tracing::error!(target: "buffer", "[COORDINATOR] Effect failed: {}", e);
                self.last_error = Some(e.to_string());
            }
        }
    }

    async fn execute_effect(&mut self, effect: SideEffect, launch_is_fatal: bool) -> Result<(), BufferError> {
        match effect {
            SideEffect::ClearStale => self.clear_stale()?,
            SideEffect::LaunchSegment => self.launch_segment(launch_is_fatal)?,
            SideEffect::StopCapture => self.stop_capture().await,
            SideEffect::AdmitSegment { path } => self.admit(path),
            SideEffect::DiscardPartial { path } => self.store.delete_quietly(&path),
            SideEffect::ScheduleRestart { attempt } => self.schedule_restart(attempt),
            SideEffect::SurfaceUnavailable { attempts } => {
                self.cancel_restart();
                let error = BufferError::CaptureUnavailable { attempts };
                tracing::error!(target: "buffer", "[COORDINATOR] {}", error);
                self.last_error = Some(error.to_string());
                self.publish(BufferNotice::CaptureUnavailable { attempts });
            }
            SideEffect::TakeSnapshot => {
                let snapshot = self.ring.snapshot();
                tracing::info!(target: "buffer",
                    "[EXPORT] Snapshot {} holds segments {:?}", snapshot.id, snapshot.indices());
                self.pending_snapshot = Some(snapshot);
            }
            SideEffect::BeginConcat => self.begin_concat(),
            SideEffect::ReleaseSnapshot { snapshot_id } => {
                for path in self.ring.release(snapshot_id) {
                    self.store.delete_quietly(&path);
                }
            }
            SideEffect::EmitStateChange { state } => {
                tracing::debug!(target: "buffer", "[COORDINATOR] State: {:?}", state);
                self.publish(BufferNotice::StateChanged(self.status()));
            }
        }
        Ok(())
    }

    fn clear_stale(&mut self) -> Result<(), BufferError> {
        self.cancel_restart();
        self.ring.clear();
        self.store.clear()?;
        self.generation += 1;
        self.next_index = 0;
        Ok(())
    }

    fn launch_segment(&mut self, launch_is_fatal: bool) -> Result<(), BufferError> {
        if let Some(active) = &self.active {
            tracing::warn!(target: "buffer",
                "[COORDINATOR] Launch requested while launch {} is active, skipping", active.launch);
            return Ok(());
        }

        let launch = self.next_launch;
        self.next_launch += 1;
        let index = self.next_index;
        let path = self.store.segment_path(self.generation, index);

        let request = CaptureRequest {
            launch,
            sink: SegmentSink::fixed(path.clone(), self.segment_duration),
        };

        match self.backend.launch(request, self.capture_tx.clone()) {
            Ok(process) => {
                self.active = Some(ActiveCapture {
                    launch,
                    index,
                    path,
                    process: Some(process),
                });
                Ok(())
            }
            Err(e) if launch_is_fatal => Err(BufferError::CaptureStartFailure(e)),
            Err(e) => {
                tracing::error!(target: "buffer", "[CAPTURE] Failed to launch segment {}: {}", index, e);
                self.active = Some(ActiveCapture {
                    launch,
                    index,
                    path,
                    process: None,
                });
                // routed through the normal crash path so backoff and retry limits apply
                let crash = CaptureEvent {
                    launch,
                    kind: CaptureEventKind::Crashed { exit_code: None },
                };
                if self.capture_tx.try_send(crash).is_err() {
                    tracing::error!(target: "buffer", "[COORDINATOR] Capture event queue full, dropping launch failure");
                    self.active = None;
                }
                Ok(())
            }
        }
    }

    async fn stop_capture(&mut self) {
        self.cancel_restart();

        let Some(active) = self.active.take() else {
            return;
        };
        let Some(process) = active.process else {
            self.store.delete_quietly(&active.path);
            return;
        };

        match process.stop(self.stop_grace).await {
            Ok(CaptureExit::Completed) => {
                tracing::debug!(target: "buffer", "[CAPTURE] Segment {} completed before stop", active.index);
                self.admit(active.path);
            }
            Ok(_) => self.store.delete_quietly(&active.path),
            Err(CaptureError::StopTimeout(waited)) => {
                tracing::error!(target: "buffer",
                    "[CAPTURE] Launch {} did not exit within {:?}, continuing", active.launch, waited);
                self.store.delete_quietly(&active.path);
            }
            Err(e) => {
                tracing::error!(target: "buffer", "[CAPTURE] Stop failed: {}", e);
                self.store.delete_quietly(&active.path);
            }
        }
    }

    fn admit(&mut self, path: PathBuf) {
        let index = self.next_index;
        let segment = Segment::new(index, self.generation, path.clone(), self.segment_duration);
        let outcome = self.ring.admit(segment);

        if let Some(evicted) = &outcome.evicted {
            tracing::debug!(target: "buffer", "[RING] Evicted segment {}", evicted.index);
        }
        for reclaimed in &outcome.reclaim {
            self.store.delete_quietly(reclaimed);
        }

        self.next_index += 1;
        tracing::debug!(target: "buffer", "[RING] Admitted segment {} ({}/{})", index, self.ring.len(), self.ring.capacity());
        self.publish(BufferNotice::SegmentAdmitted { index, path });
    }

    fn schedule_restart(&mut self, attempt: u32) {
        tracing::warn!(target: "buffer",
            "[COORDINATOR] Restarting capture in {:?} (attempt {}/{})",
            self.restart_backoff, attempt, self.policy.max_attempts);

        let token = self.restart_token;
        let backoff = self.restart_backoff;
        let worker_tx = self.worker_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(backoff).await;
            let _ = worker_tx.send(WorkerEvent::RestartDue { token }).await;
        });
    }

    fn cancel_restart(&mut self) {
        self.restart_token = self.restart_token.wrapping_add(1);
    }

    fn begin_concat(&mut self) {
        let Some(snapshot) = self.pending_snapshot.take() else {
            tracing::error!(target: "buffer", "[EXPORT] No snapshot for concat");
            return;
        };

        let exporter = self.exporter.clone();
        let worker_tx = self.worker_tx.clone();
        let snapshot_id = snapshot.id;

        tokio::spawn(async move {
            let result = tokio::task::spawn_blocking(move || exporter.export(&snapshot))
                .await
                .unwrap_or_else(|e| Err(ExportError::Worker(e.to_string()).into()));
            let _ = worker_tx
                .send(WorkerEvent::ExportFinished {
                    snapshot_id,
                    result,
                })
                .await;
        });
    }

    fn publish(&self, notice: BufferNotice) {
        // no subscribers is fine
        let _ = self.notice_tx.send(notice);
    }

    fn status(&self) -> BufferStatus {
        let started_at_timestamp = self.state.capture().map(|run| {
            let start = SystemTime::now() - run.started_at.elapsed();
            start
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs_f64()
        });

        BufferStatus {
            is_recording: self.state.is_recording(),
            is_exporting: self.state.is_exporting(),
            segment_count: self.ring.len(),
            capacity: self.ring.capacity(),
            retained_indices: self.ring.members().map(|s| s.index).collect(),
            retained_seconds: self.ring.retained_duration().as_secs_f64(),
            next_index: self.next_index,
            generation: self.generation,
            last_error: self.last_error.clone(),
            started_at_timestamp,
        }
    }

    async fn teardown(&mut self) {
        tracing::info!(target: "buffer", "[COORDINATOR] Tearing down buffer...");

        self.stop_capture().await;

        if self.state.is_exporting() {
            tracing::info!(target: "buffer", "[COORDINATOR] Waiting for in-flight export...");
            while let Some(event) = self.worker_rx.recv().await {
                if let WorkerEvent::ExportFinished { snapshot_id, result } = event {
                    self.ring.release(snapshot_id);
                    self.finish_export(result);
                    break;
                }
            }
        }

        self.ring.clear();
        if let Err(e) = self.store.clear() {
            tracing::error!(target: "buffer", "[COORDINATOR] Failed to clear scratch dir: {}", e);
        }
        self.state = BufferState::Idle;

        tracing::info!(target: "buffer", "[COORDINATOR] Teardown complete");
    }
}

/// Handle to send commands to the coordinator.
#[derive(Clone)]
pub struct CoordinatorHandle {
    command_tx: mpsc::Sender<Command>,
    notice_tx: broadcast::Sender<BufferNotice>,
}

impl CoordinatorHandle {
    fn new(command_tx: mpsc::Sender<Command>, notice_tx: broadcast::Sender<BufferNotice>) -> Self {
        Self {
            command_tx,
            notice_tx,
        }
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, BufferError> {
        let (response_tx, response_rx) = oneshot::channel();

        self.command_tx
            .send(make(response_tx))
            .await
            .map_err(|_| BufferError::CoordinatorUnavailable)?;

        response_rx
            .await
            .map_err(|_| BufferError::CoordinatorUnavailable)
    }

    pub async fn start(&self) -> Result<(), BufferError> {
        self.request(|response_tx| Command::Start { response_tx }).await?
    }

    pub async fn stop(&self) -> Result<(), BufferError> {
        self.request(|response_tx| Command::Stop { response_tx }).await?
    }

    pub async fn export_current_window(&self) -> Result<ExportArtifact, BufferError> {
        self.request(|response_tx| Command::Export { response_tx }).await?
    }

    pub async fn status(&self) -> Result<BufferStatus, BufferError> {
        self.request(|response_tx| Command::Status { response_tx }).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BufferNotice> {
        self.notice_tx.subscribe()
    }
}
