use crate::fuzzer::StopReason;
use serde::Serialize;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const STATS_HEADER: &str = "timestamp,exec_count,coverage";
pub const DEFAULT_REPORT_INTERVAL: u64 = 100;

#[derive(Error, Debug)]
pub enum StatsError {
    #[error("Statistics I/O error at {path:?}: {source}")]
    Io { path: PathBuf, source: io::Error },

    #[error("Failed to serialize run summary: {0}")]
    Json(#[from] serde_json::Error),
}

/// One row of the statistics log.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatsRecord {
    /// Seconds since the run started.
    pub elapsed_secs: f64,
    pub exec_count: u64,
    pub edge_count: usize,
}

/// Append-only CSV log of periodic progress snapshots.
///
/// Rows are flushed as they are written so an external reader can follow the
/// file while the run is in progress.
#[derive(Debug)]
pub struct StatsLog {
    path: PathBuf,
    writer: BufWriter<File>,
    interval: u64,
    last_exec_count: u64,
    rows: usize,
}

impl StatsLog {
    /// Creates (or truncates) `path` and writes the header. An `interval` of
    /// zero is treated as one.
    pub fn create(path: impl Into<PathBuf>, interval: u64) -> Result<Self, StatsError> {
        let path = path.into();
        let io_err = |source| StatsError::Io {
            path: path.clone(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let file = File::create(&path).map_err(io_err)?;
        let mut writer = BufWriter::new(file);
        writeln!(writer, "{STATS_HEADER}")
            .and_then(|()| writer.flush())
            .map_err(io_err)?;

        Ok(Self {
            path,
            writer,
            interval: interval.max(1),
            last_exec_count: 0,
            rows: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn interval(&self) -> u64 {
        self.interval
    }

    /// Number of data rows written so far.
    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn is_due(&self, exec_count: u64) -> bool {
        exec_count > self.last_exec_count && exec_count % self.interval == 0
    }

    /// Appends `record` unconditionally.
    pub fn record(&mut self, record: &StatsRecord) -> Result<(), StatsError> {
        writeln!(
            self.writer,
            "{:.2},{},{}",
            record.elapsed_secs, record.exec_count, record.edge_count
        )
        .and_then(|()| self.writer.flush())
        .map_err(|source| StatsError::Io {
            path: self.path.clone(),
            source,
        })?;
        self.last_exec_count = record.exec_count;
        self.rows += 1;
        Ok(())
    }

    /// Appends `record` when its execution count falls on the interval.
    pub fn maybe_record(&mut self, record: &StatsRecord) -> Result<bool, StatsError> {
        if !self.is_due(record.exec_count) {
            return Ok(false);
        }
        self.record(record)?;
        Ok(true)
    }

    /// Writes a closing row if executions happened since the last one.
    pub fn finish(&mut self, record: &StatsRecord) -> Result<bool, StatsError> {
        if record.exec_count <= self.last_exec_count {
            return Ok(false);
        }
        self.record(record)?;
        Ok(true)
    }
}

/// End-of-run totals, written as JSON next to the statistics log.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub elapsed_secs: f64,
    pub executions: u64,
    pub edges: usize,
    pub corpus_size: usize,
    pub crashes: u64,
    pub stop_reason: StopReason,
}

impl RunSummary {
    pub fn write_json(&self, path: &Path) -> Result<(), StatsError> {
        let io_err = |source| StatsError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let mut writer = BufWriter::new(File::create(path).map_err(io_err)?);
        serde_json::to_writer_pretty(&mut writer, self)?;
        writeln!(writer).and_then(|()| writer.flush()).map_err(io_err)?;
        Ok(())
    }
}
