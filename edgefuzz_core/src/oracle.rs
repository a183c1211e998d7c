use crate::executor::ExecutionStatus;
use crate::input::TestCase;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Exit code instrumented targets use to flag a detected fault.
pub const DEFAULT_CRASH_EXIT_CODE: i32 = 66;

/// A defect observed while running one input.
#[derive(Debug, Clone)]
pub struct BugReport {
    /// The exact input that triggered the crash.
    pub input: TestCase,
    pub status: ExecutionStatus,
    /// Human-readable account of the termination.
    pub description: String,
    /// MD5 hex digest of the input, for matching reports to files.
    pub input_hash: String,
}

/// An `Oracle` examines the outcome of a target's execution to determine if a bug has occurred.
pub trait Oracle {
    /// Whether `status` is evidence of a defect.
    fn is_crash(&self, status: &ExecutionStatus) -> bool;

    /// Builds a report for `input` when its `status` is a crash.
    ///
    /// # Arguments
    /// * `input`: The candidate that was executed.
    /// * `status`: How the target ended for that candidate.
    ///
    /// # Returns
    /// A `BugReport` carrying the input and its md5 if `status` is a crash,
    /// `None` otherwise.
    fn examine(&self, input: &TestCase, status: &ExecutionStatus) -> Option<BugReport> {
        if !self.is_crash(status) {
            return None;
        }
        let description = match status {
            ExecutionStatus::Signaled(_) => format!("target terminated by {status}"),
            _ => format!("target reported a fault via {status}"),
        };
        Some(BugReport {
            input: input.clone(),
            status: *status,
            description,
            input_hash: format!("{:x}", md5::compute(input.as_bytes())),
        })
    }
}

/// Treats any signal-induced termination, and the reserved fault exit code,
/// as a crash. Timeouts and every other exit code are not crashes.
#[derive(Debug, Clone, Copy)]
pub struct CrashOracle {
    crash_exit_code: i32,
}

impl CrashOracle {
    pub fn new(crash_exit_code: i32) -> Self {
        Self { crash_exit_code }
    }

    pub fn crash_exit_code(&self) -> i32 {
        self.crash_exit_code
    }
}

impl Default for CrashOracle {
    fn default() -> Self {
        Self::new(DEFAULT_CRASH_EXIT_CODE)
    }
}

impl Oracle for CrashOracle {
    fn is_crash(&self, status: &ExecutionStatus) -> bool {
        match status {
            ExecutionStatus::Signaled(_) => true,
            ExecutionStatus::Normal(code) => *code == self.crash_exit_code,
            ExecutionStatus::Timeout => false,
        }
    }
}

/// Whether the fuzz loop should go on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopControl {
    Continue,
    Stop,
}

/// What to do once a crash has been recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CrashPolicy {
    /// End the run at the first crash.
    #[default]
    StopOnFirst,
    /// Record the crash and keep fuzzing.
    Continue,
}

impl CrashPolicy {
    pub fn from_stop_on_crash(stop_on_crash: bool) -> Self {
        if stop_on_crash {
            CrashPolicy::StopOnFirst
        } else {
            CrashPolicy::Continue
        }
    }

    /// The loop decision after an execution that did (`crashed`) or did not crash.
    pub fn decide(&self, crashed: bool) -> LoopControl {
        match (self, crashed) {
            (CrashPolicy::StopOnFirst, true) => LoopControl::Stop,
            _ => LoopControl::Continue,
        }
    }
}

#[derive(Error, Debug)]
pub enum CrashStoreError {
    #[error("Failed to create crash directory {path:?}: {source}")]
    CreateDir { path: PathBuf, source: io::Error },

    #[error("Failed to write crash input to {path:?}: {source}")]
    Write { path: PathBuf, source: io::Error },
}

/// Writes crashing inputs to `crash_<unix-seconds>.txt` files.
#[derive(Debug, Clone)]
pub struct CrashStore {
    dir: PathBuf,
}

impl CrashStore {
    /// The directory is created lazily on the first saved crash.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Saves the report's input bytes under a timestamp-derived name.
    pub fn save(&self, report: &BugReport) -> Result<PathBuf, CrashStoreError> {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        self.save_at(report, secs)
    }

    fn save_at(&self, report: &BugReport, unix_secs: u64) -> Result<PathBuf, CrashStoreError> {
        fs::create_dir_all(&self.dir).map_err(|source| CrashStoreError::CreateDir {
            path: self.dir.clone(),
            source,
        })?;

        let mut suffix = 0u32;
        loop {
            let name = if suffix == 0 {
                format!("crash_{unix_secs}.txt")
            } else {
                format!("crash_{unix_secs}_{suffix}.txt")
            };
            let path = self.dir.join(name);
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    file.write_all(report.input.as_bytes())
                        .and_then(|()| file.flush())
                        .map_err(|source| CrashStoreError::Write {
                            path: path.clone(),
                            source,
                        })?;
                    return Ok(path);
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => suffix += 1,
                Err(source) => return Err(CrashStoreError::Write { path, source }),
            }
        }
    }
}
