//! Telemetry hook: maps every loop event to one append-only
//! JSON-lines record on disk, appending one line per event rather than
//! rewriting a file per run.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{Event, Hook};

/// Appends one JSON object per line to `<telemetry_dir>/events.jsonl`,
/// creating the directory if needed. A single `Mutex<File>` serializes
/// writers; each write is one `write_all` call so lines never interleave.
pub struct TelemetryHook {
    file: Mutex<File>,
    path: PathBuf,
}

impl TelemetryHook {
    pub fn new(telemetry_dir: &Path) -> std::io::Result<Self> {
        std::fs::create_dir_all(telemetry_dir)?;
        let path = telemetry_dir.join("events.jsonl");
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            file: Mutex::new(file),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Hook for TelemetryHook {
    async fn on_event(&self, event: &Event) {
        let Ok(mut line) = serde_json::to_string(event) else {
            tracing::error!(bead_id = %event.bead_id, "failed to serialize event for telemetry");
            return;
        };
        line.push('\n');
        let mut file = match self.file.lock() {
            Ok(file) => file,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(err) = file.write_all(line.as_bytes()) {
            tracing::error!(bead_id = %event.bead_id, error = %err, "failed to append telemetry event");
        }
    }
}
