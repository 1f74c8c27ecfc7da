//! Scalar telemetry stream.
//!
//! Named numeric series tagged with the global step counter, appended as JSONL
//! so any external plotting tool can consume the run afterwards.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

use serde::Serialize;

use crate::error::Result;

#[derive(Debug, Serialize)]
struct ScalarRecord<'a> {
    tag: &'a str,
    step: usize,
    value: f64,
}

/// Append-only JSONL sink for scalar series.
pub struct ScalarLog {
    writer: BufWriter<File>,
}

impl ScalarLog {
    /// Open (or create) the log file, creating parent directories as needed.
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }

    /// Record one scalar at the given step.
    pub fn scalar(&mut self, tag: &str, step: usize, value: f64) -> Result<()> {
        let record = ScalarRecord { tag, step, value };
        serde_json::to_writer(&mut self.writer, &record)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        tracing::debug!(tag, step, value, "scalar");
        Ok(())
    }
}
