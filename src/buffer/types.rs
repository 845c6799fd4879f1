use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;

/// One completed capture slice. Only fully written files become a `Segment`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    pub index: u64,
    /// Bumped on every fresh `start()`, so filenames from different runs never collide.
    pub generation: u64,
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
    #[serde(with = "duration_secs")]
    pub duration_nominal: Duration,
}

impl Segment {
    pub fn new(index: u64, generation: u64, path: PathBuf, duration_nominal: Duration) -> Self {
        Self {
            index,
            generation,
            path,
            created_at: Utc::now(),
            duration_nominal,
        }
    }
}

mod duration_secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(duration.as_secs_f64())
    }
}

/// How the capture process lays out its output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SinkMode {
    /// One process per segment, writing a single file for a fixed duration.
    FixedDuration,
}

/// Where and for how long a capture process writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentSink {
    pub mode: SinkMode,
    pub path: PathBuf,
    pub duration: Duration,
}

impl SegmentSink {
    pub fn fixed(path: PathBuf, duration: Duration) -> Self {
        Self {
            mode: SinkMode::FixedDuration,
            path,
            duration,
        }
    }
}

/// A finished export written to the output directory.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportArtifact {
    pub id: String,
    pub path: PathBuf,
    pub segment_count: usize,
    /// Indices that were in the snapshot but whose files had vanished.
    pub skipped_indices: Vec<u64>,
    pub created_at: DateTime<Utc>,
}
