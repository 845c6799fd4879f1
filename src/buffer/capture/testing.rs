//! Scripted capture backend for driving the coordinator in tests.
//!
//! Each launch waits until the test completes or crashes it. Completed
//! segments contain `segment:<file name>` so exports can be checked for order.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use super::{CaptureBackend, CaptureEvent, CaptureEventKind, CaptureExit, CaptureProcess, CaptureRequest};
use crate::buffer::errors::{CaptureError, ExportError};

enum Finish {
    Complete,
    Crash(i32),
}

pub struct ScriptedLaunch {
    pub launch: u64,
    pub path: PathBuf,
    finish_tx: Option<oneshot::Sender<Finish>>,
}

#[derive(Default)]
struct Script {
    launches: Vec<ScriptedLaunch>,
    probe_fails: bool,
    launch_fails: bool,
    concat_fails: bool,
    concat_inputs: Vec<Vec<PathBuf>>,
    stops: usize,
}

#[derive(Clone, Default)]
pub struct ScriptedBackend {
    script: Arc<Mutex<Script>>,
}

pub fn segment_payload(path: &Path) -> String {
    format!(
        "segment:{}\n",
        path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default()
    )
}

/// Parses `file '<path>'` lines back into paths.
pub fn parse_manifest(content: &str) -> Vec<PathBuf> {
    content
        .lines()
        .filter_map(|line| line.strip_prefix("file '"))
        .filter_map(|rest| rest.strip_suffix('\''))
        .map(|quoted| PathBuf::from(quoted.replace("'\\''", "'")))
        .collect()
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_probe(&self) {
        self.script.lock().unwrap().probe_fails = true;
    }

    pub fn fail_launches(&self, fail: bool) {
        self.script.lock().unwrap().launch_fails = fail;
    }

    pub fn fail_concat(&self) {
        self.script.lock().unwrap().concat_fails = true;
    }

    pub fn launch_count(&self) -> usize {
        self.script.lock().unwrap().launches.len()
    }

    pub fn stop_count(&self) -> usize {
        self.script.lock().unwrap().stops
    }

    pub fn launched_paths(&self) -> Vec<PathBuf> {
        self.script
            .lock()
            .unwrap()
            .launches
            .iter()
            .map(|l| l.path.clone())
            .collect()
    }

    pub fn concat_inputs(&self) -> Vec<Vec<PathBuf>> {
        self.script.lock().unwrap().concat_inputs.clone()
    }

    fn finish_latest(&self, finish: Finish) {
        let mut script = self.script.lock().unwrap();
        let launch = script
            .launches
            .last_mut()
            .expect("no launch to finish");
        let tx = launch.finish_tx.take().expect("launch already finished");
        let _ = tx.send(finish);
    }

    /// Lets the most recent launch finish its segment successfully.
    pub fn complete_latest(&self) {
        self.finish_latest(Finish::Complete);
    }

    /// Makes the most recent launch exit abnormally.
    pub fn crash_latest(&self, exit_code: i32) {
        self.finish_latest(Finish::Crash(exit_code));
    }

    /// Polls until at least `count` launches happened.
    pub async fn wait_for_launches(&self, count: usize) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while self.launch_count() < count {
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {} launches, saw {}",
                count,
                self.launch_count()
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

impl CaptureBackend for ScriptedBackend {
    fn probe(&self) -> Result<(), CaptureError> {
        if self.script.lock().unwrap().probe_fails {
            return Err(CaptureError::FfmpegNotFound);
        }
        Ok(())
    }

    fn launch(
        &self,
        request: CaptureRequest,
        events: mpsc::Sender<CaptureEvent>,
    ) -> Result<CaptureProcess, CaptureError> {
        let mut script = self.script.lock().unwrap();
        if script.launch_fails {
            return Err(CaptureError::SpawnFailed("scripted launch failure".to_string()));
        }

        // a partially written file exists from the moment capture starts
        let _ = std::fs::write(&request.sink.path, b"partial");

        let (finish_tx, finish_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = oneshot::channel();

        script.launches.push(ScriptedLaunch {
            launch: request.launch,
            path: request.sink.path.clone(),
            finish_tx: Some(finish_tx),
        });

        let shared = self.script.clone();
        let launch = request.launch;
        let path = request.sink.path.clone();

        tokio::spawn(async move {
            let _ = events
                .send(CaptureEvent {
                    launch,
                    kind: CaptureEventKind::Started,
                })
                .await;

            let exit = tokio::select! {
                finish = finish_rx => match finish {
                    Ok(Finish::Complete) => {
                        let _ = std::fs::write(&path, segment_payload(&path));
                        CaptureExit::Completed
                    }
                    Ok(Finish::Crash(code)) => CaptureExit::Crashed { exit_code: Some(code) },
                    Err(_) => CaptureExit::Stopped,
                },
                _ = stop_rx => {
                    shared.lock().unwrap().stops += 1;
                    CaptureExit::Stopped
                }
            };

            let event = exit.clone().into_event(launch, &path);
            let _ = exit_tx.send(exit);
            let _ = events.send(event).await;
        });

        Ok(CaptureProcess::new(request.launch, stop_tx, exit_rx))
    }

    fn concat(&self, manifest: &Path, output: &Path) -> Result<(), ExportError> {
        let content = std::fs::read_to_string(manifest)
            .map_err(|e| ExportError::Spawn(format!("manifest unreadable: {}", e)))?;
        let inputs = parse_manifest(&content);

        let mut script = self.script.lock().unwrap();
        script.concat_inputs.push(inputs.clone());
        if script.concat_fails {
            return Err(ExportError::ProcessFailed {
                exit_code: 1,
                stderr: "scripted concat failure".to_string(),
            });
        }
        drop(script);

        let mut joined = String::new();
        for input in inputs {
            let part = std::fs::read_to_string(&input)
                .map_err(|e| ExportError::Spawn(format!("{:?}: {}", input, e)))?;
            joined.push_str(&part);
        }
        std::fs::write(output, joined).map_err(|e| ExportError::Spawn(e.to_string()))
    }
}
