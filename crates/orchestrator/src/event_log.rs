use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

use types::EventRecord;

/// Appends [`EventRecord`]s as JSON Lines to `log_path` (§6). One record per
/// line, flushed immediately — the event stream is a log, not a buffer the
/// orchestrator can afford to lose on a crash.
pub struct EventLog {
    writer: BufWriter<File>,
}

impl EventLog {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }

    pub fn append(&mut self, record: &EventRecord) {
        match serde_json::to_string(record) {
            Ok(line) => {
                if let Err(err) = writeln!(self.writer, "{line}") {
                    tracing::warn!(%err, "failed to append event record");
                }
                let _ = self.writer.flush();
            }
            Err(err) => tracing::warn!(%err, "failed to serialize event record"),
        }
    }
}
