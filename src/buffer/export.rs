//! Materializes a ring snapshot into a single stream-copied file.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::capture::CaptureBackend;
use super::errors::{BufferError, ExportError};
use super::ring::RingSnapshot;
use super::store::SegmentStore;
use super::types::ExportArtifact;
use crate::shared::paths::ensure_dir;

/// Ordered inputs for one concat run.
#[derive(Debug, Default, PartialEq)]
pub struct ExportPlan {
    pub inputs: Vec<PathBuf>,
    /// Snapshot members whose files were gone when the plan was built.
    pub skipped: Vec<u64>,
}

/// Keeps the snapshot's chronological order and drops entries whose file
/// vanished. A missing file only shortens the export.
pub fn build_plan(snapshot: &RingSnapshot, store: &SegmentStore) -> ExportPlan {
    let mut plan = ExportPlan::default();
    for segment in &snapshot.segments {
        if store.exists(&segment.path) {
            plan.inputs.push(segment.path.clone());
        } else {
            tracing::warn!(target: "buffer",
                "[EXPORT] Segment {} vanished before export, skipping: {:?}",
                segment.index, segment.path);
            plan.skipped.push(segment.index);
        }
    }
    plan
}

/// One concat-demuxer line. Backslashes become `/` and single quotes are
/// escaped the way the demuxer expects.
pub fn manifest_line(path: &Path) -> String {
    let normalized = path.to_string_lossy().replace('\\', "/");
    format!("file '{}'", normalized.replace('\'', "'\\''"))
}

pub fn render_manifest(inputs: &[PathBuf]) -> String {
    let mut content = String::new();
    for input in inputs {
        content.push_str(&manifest_line(input));
        content.push('\n');
    }
    content
}

pub fn artifact_file_name(now: DateTime<Utc>) -> String {
    format!("recording_{}.mp4", now.format("%Y-%m-%dT%H-%M-%S-%3fZ"))
}

/// Removes the concat manifest on every exit path.
struct ManifestGuard {
    path: PathBuf,
}

impl ManifestGuard {
    fn write(path: PathBuf, content: &str) -> Result<Self, ExportError> {
        std::fs::write(&path, content)
            .map_err(|e| ExportError::ManifestWrite(format!("{:?}: {}", path, e)))?;
        Ok(Self { path })
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ManifestGuard {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(target: "buffer", "[EXPORT] Failed to remove manifest {:?}: {}", self.path, e);
            }
        }
    }
}

#[derive(Clone)]
pub struct ExportService {
    backend: Arc<dyn CaptureBackend>,
    store: SegmentStore,
    output_dir: PathBuf,
}

impl ExportService {
    pub fn new(
        backend: Arc<dyn CaptureBackend>,
        store: SegmentStore,
        output_dir: PathBuf,
    ) -> Self {
        Self {
            backend,
            store,
            output_dir,
        }
    }

    fn next_output_path(&self, now: DateTime<Utc>) -> PathBuf {
        let base = self.output_dir.join(artifact_file_name(now));
        if !base.exists() {
            return base;
        }

        let stem = base
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        let mut n = 1;
        loop {
            let candidate = self.output_dir.join(format!("{}_{}.mp4", stem, n));
            if !candidate.exists() {
                return candidate;
            }
            n += 1;
        }
    }

    /// Concatenates the snapshot into a new artifact. Blocking: run it off the
    /// async executor.
    pub fn export(&self, snapshot: &RingSnapshot) -> Result<ExportArtifact, BufferError> {
        if snapshot.is_empty() {
            return Err(BufferError::NoSegmentsAvailable);
        }

        let plan = build_plan(snapshot, &self.store);
        if plan.inputs.is_empty() {
            return Err(BufferError::NoSegmentsAvailable);
        }

        ensure_dir(&self.output_dir)
            .map_err(|e| ExportError::OutputDir(format!("{:?}: {}", self.output_dir, e)))?;

        let inputs: Vec<PathBuf> = plan
            .inputs
            .iter()
            .map(|p| std::fs::canonicalize(p).unwrap_or_else(|_| p.clone()))
            .collect();

        let manifest = ManifestGuard::write(self.store.manifest_path(), &render_manifest(&inputs))?;

        let created_at = Utc::now();
        let output = self.next_output_path(created_at);

        tracing::info!(target: "buffer",
            "[EXPORT] Concatenating {} segments ({} skipped) into {:?}",
            inputs.len(), plan.skipped.len(), output);

        self.backend.concat(manifest.path(), &output)?;

        if !output.is_file() {
            return Err(ExportError::OutputMissing(output.to_string_lossy().to_string()).into());
        }

        Ok(ExportArtifact {
            id: uuid::Uuid::new_v4().to_string(),
            path: output,
            segment_count: inputs.len(),
            skipped_indices: plan.skipped,
            created_at,
        })
    }
}
