//! Pure state machine for the rolling buffer lifecycle.
//!
//! `(State, Event) -> (NewState, Vec<SideEffect>)`. The coordinator executes
//! the effects; this module never performs I/O.
//!
//! Crashes and restarts happen inside `Recording` and are not visible as a
//! separate state. During an export, capture keeps rotating if it was active
//! when the export began.

use std::path::PathBuf;
use std::time::Instant;

/// An active capture run: when it started and how many crashes in a row it
/// has seen since the last completed segment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CaptureRun {
    pub started_at: Instant,
    pub crash_streak: u32,
}

impl CaptureRun {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            crash_streak: 0,
        }
    }
}

impl Default for CaptureRun {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum BufferState {
    #[default]
    Idle,

    Recording(CaptureRun),

    /// Concat in flight. `resume` holds the capture run that keeps rotating
    /// meanwhile, if capture was active when the export began.
    Exporting { resume: Option<CaptureRun> },
}

impl BufferState {
    pub fn is_recording(&self) -> bool {
        self.capture().is_some()
    }

    pub fn is_exporting(&self) -> bool {
        matches!(self, BufferState::Exporting { .. })
    }

    pub fn capture(&self) -> Option<&CaptureRun> {
        match self {
            BufferState::Recording(run) => Some(run),
            BufferState::Exporting { resume } => resume.as_ref(),
            BufferState::Idle => None,
        }
    }

    fn with_capture(&self, run: Option<CaptureRun>) -> BufferState {
        match (self, run) {
            (BufferState::Exporting { .. }, resume) => BufferState::Exporting { resume },
            (_, Some(run)) => BufferState::Recording(run),
            (_, None) => BufferState::Idle,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RestartPolicy {
    pub max_attempts: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BufferEvent {
    StartRequested,
    /// The first launch after a start failed to spawn.
    StartFailed,
    StopRequested,
    SegmentCompleted { path: PathBuf },
    CaptureCrashed { path: PathBuf, exit_code: Option<i32> },
    RestartDue,
    ExportRequested,
    ExportFinished { snapshot_id: u64 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum SideEffect {
    /// Purge leftovers in the scratch dir and reset the index sequence.
    ClearStale,
    LaunchSegment,
    StopCapture,
    AdmitSegment { path: PathBuf },
    DiscardPartial { path: PathBuf },
    ScheduleRestart { attempt: u32 },
    SurfaceUnavailable { attempts: u32 },
    TakeSnapshot,
    BeginConcat,
    ReleaseSnapshot { snapshot_id: u64 },
    EmitStateChange { state: BufferState },
}

fn emit(state: &BufferState) -> SideEffect {
    SideEffect::EmitStateChange {
        state: state.clone(),
    }
}

/// Pure state transition function.
///
/// Invalid transitions return the current state with an empty effect list.
pub fn transition(
    state: BufferState,
    event: BufferEvent,
    policy: RestartPolicy,
) -> (BufferState, Vec<SideEffect>) {
    match (&state, event) {
        (BufferState::Idle, BufferEvent::StartRequested) => {
            let new_state = BufferState::Recording(CaptureRun::new());
            let effects = vec![
                SideEffect::ClearStale,
                SideEffect::LaunchSegment,
                emit(&new_state),
            ];
            (new_state, effects)
        }

        (BufferState::Recording(_), BufferEvent::StartFailed) => {
            let new_state = BufferState::Idle;
            let effects = vec![emit(&new_state)];
            (new_state, effects)
        }

        (BufferState::Recording(_), BufferEvent::StopRequested) => {
            let new_state = BufferState::Idle;
            let effects = vec![SideEffect::StopCapture, emit(&new_state)];
            (new_state, effects)
        }

        (BufferState::Exporting { resume: Some(_) }, BufferEvent::StopRequested) => {
            let new_state = BufferState::Exporting { resume: None };
            let effects = vec![SideEffect::StopCapture, emit(&new_state)];
            (new_state, effects)
        }

        // rotate: admit first so a slow relaunch never loses a finished segment
        (_, BufferEvent::SegmentCompleted { path }) if state.is_recording() => {
            let run = state.capture().map(|run| CaptureRun {
                started_at: run.started_at,
                crash_streak: 0,
            });
            let new_state = state.with_capture(run);
            let effects = vec![SideEffect::AdmitSegment { path }, SideEffect::LaunchSegment];
            (new_state, effects)
        }

        (_, BufferEvent::CaptureCrashed { path, .. }) if state.is_recording() => {
            let Some(run) = state.capture().copied() else {
                return (state, vec![]);
            };
            let attempt = run.crash_streak + 1;

            if attempt > policy.max_attempts {
                let new_state = state.with_capture(None);
                let effects = vec![
                    SideEffect::DiscardPartial { path },
                    SideEffect::SurfaceUnavailable {
                        attempts: run.crash_streak,
                    },
                    emit(&new_state),
                ];
                return (new_state, effects);
            }

            let new_state = state.with_capture(Some(CaptureRun {
                started_at: run.started_at,
                crash_streak: attempt,
            }));
            let effects = vec![
                SideEffect::DiscardPartial { path },
                SideEffect::ScheduleRestart { attempt },
            ];
            (new_state, effects)
        }

        (_, BufferEvent::RestartDue) if state.is_recording() => {
            (state, vec![SideEffect::LaunchSegment])
        }

        (BufferState::Recording(run), BufferEvent::ExportRequested) => {
            let new_state = BufferState::Exporting { resume: Some(*run) };
            let effects = vec![
                SideEffect::StopCapture,
                SideEffect::TakeSnapshot,
                SideEffect::LaunchSegment,
                SideEffect::BeginConcat,
                emit(&new_state),
            ];
            (new_state, effects)
        }

        (BufferState::Idle, BufferEvent::ExportRequested) => {
            let new_state = BufferState::Exporting { resume: None };
            let effects = vec![
                SideEffect::TakeSnapshot,
                SideEffect::BeginConcat,
                emit(&new_state),
            ];
            (new_state, effects)
        }

        (BufferState::Exporting { resume }, BufferEvent::ExportFinished { snapshot_id }) => {
            let new_state = match resume {
                Some(run) => BufferState::Recording(*run),
                None => BufferState::Idle,
            };
            let effects = vec![
                SideEffect::ReleaseSnapshot { snapshot_id },
                emit(&new_state),
            ];
            (new_state, effects)
        }

        _ => (state, vec![]),
    }
}
