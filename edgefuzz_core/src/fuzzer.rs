use crate::corpus::{Corpus, CorpusError};
use crate::executor::{ExecutionStatus, Executor, ExecutorError};
use crate::feedback::{CoverageFeedback, Discovery, Feedback};
use crate::input::TestCase;
use crate::mutator::Mutator;
use crate::oracle::{CrashPolicy, CrashStore, LoopControl, Oracle};
use crate::scheduler::{Scheduler, SchedulerError};
use crate::stats::{RunSummary, StatsLog, StatsRecord};
use rand::Rng;
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Bytes of a candidate shown in discovery and crash log lines.
const PREVIEW_LEN: usize = 20;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(500);

/// Consecutive failed executions after which the target is considered unusable.
pub const DEFAULT_MAX_CONSECUTIVE_FAILURES: u32 = 100;

/// Errors that end a run. Everything else is contained within its iteration.
#[derive(Error, Debug)]
pub enum FuzzError {
    #[error("cannot select a seed: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("seed selection failed: {0}")]
    Corpus(#[from] CorpusError),

    #[error("target execution failed: {0}")]
    Executor(#[from] ExecutorError),

    #[error("target failed to execute {count} times in a row, last error: {last}")]
    RepeatedFailures { count: u32, last: ExecutorError },
}

/// Why a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StopReason {
    /// The interrupt flag was raised.
    Interrupted,
    /// The configured iteration bound was reached.
    IterationLimit,
    /// A crash was found and the policy said stop.
    CrashFound,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            StopReason::Interrupted => "interrupted",
            StopReason::IterationLimit => "iteration limit reached",
            StopReason::CrashFound => "crash found",
        };
        f.write_str(text)
    }
}

/// Engine context: everything that evolves during a run.
pub struct FuzzState<C: Corpus> {
    corpus: C,
    coverage: CoverageFeedback,
    exec_count: u64,
    crash_count: u64,
    start: Instant,
}

impl<C: Corpus> FuzzState<C> {
    /// The clock for elapsed time starts here.
    pub fn new(corpus: C) -> Self {
        Self {
            corpus,
            coverage: CoverageFeedback::new(),
            exec_count: 0,
            crash_count: 0,
            start: Instant::now(),
        }
    }

    pub fn corpus(&self) -> &C {
        &self.corpus
    }

    pub fn coverage(&self) -> &CoverageFeedback {
        &self.coverage
    }

    pub fn exec_count(&self) -> u64 {
        self.exec_count
    }

    pub fn crash_count(&self) -> u64 {
        self.crash_count
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn stats_record(&self) -> StatsRecord {
        StatsRecord {
            elapsed_secs: self.elapsed().as_secs_f64(),
            exec_count: self.exec_count,
            edge_count: self.coverage.edge_count(),
        }
    }

    pub fn summary(&self, stop_reason: StopReason) -> RunSummary {
        RunSummary {
            elapsed_secs: self.elapsed().as_secs_f64(),
            executions: self.exec_count,
            edges: self.coverage.edge_count(),
            corpus_size: self.corpus.len(),
            crashes: self.crash_count,
            stop_reason,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FuzzerSettings {
    pub timeout: Duration,
    pub crash_policy: CrashPolicy,
    /// `None` runs until interrupted or stopped by a crash.
    pub max_iterations: Option<u64>,
    /// Run ends once this many executions in a row have failed.
    pub max_consecutive_failures: u32,
}

impl Default for FuzzerSettings {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            crash_policy: CrashPolicy::default(),
            max_iterations: None,
            max_consecutive_failures: DEFAULT_MAX_CONSECUTIVE_FAILURES,
        }
    }
}

/// What one iteration did.
#[derive(Debug, Clone)]
pub struct IterationOutcome {
    /// `None` when the execution failed and the iteration was skipped.
    pub status: Option<ExecutionStatus>,
    pub discovery: Option<Discovery>,
    pub crashed: bool,
    /// Where the crashing input was saved, if it was.
    pub crash_file: Option<PathBuf>,
    pub control: LoopControl,
}

impl IterationOutcome {
    fn skipped() -> Self {
        Self {
            status: None,
            discovery: None,
            crashed: false,
            crash_file: None,
            control: LoopControl::Continue,
        }
    }
}

/// The select, mutate, execute, track, detect, report loop.
pub struct Fuzzer<E, M, S, O, R>
where
    E: Executor,
    M: Mutator<R>,
    S: Scheduler,
    O: Oracle,
    R: Rng,
{
    executor: E,
    mutator: M,
    scheduler: S,
    oracle: O,
    rng: R,
    settings: FuzzerSettings,
    crash_store: Option<CrashStore>,
    stats: Option<StatsLog>,
    consecutive_failures: u32,
}

impl<E, M, S, O, R> Fuzzer<E, M, S, O, R>
where
    E: Executor,
    M: Mutator<R>,
    S: Scheduler,
    O: Oracle,
    R: Rng,
{
    pub fn new(
        executor: E,
        mutator: M,
        scheduler: S,
        oracle: O,
        rng: R,
        settings: FuzzerSettings,
    ) -> Self {
        Self {
            executor,
            mutator,
            scheduler,
            oracle,
            rng,
            settings,
            crash_store: None,
            stats: None,
            consecutive_failures: 0,
        }
    }

    pub fn with_crash_store(mut self, store: CrashStore) -> Self {
        self.crash_store = Some(store);
        self
    }

    pub fn with_stats(mut self, stats: StatsLog) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Runs a single iteration against `state`.
    ///
    /// Only scheduler failures, fatal executor errors and a run of
    /// `max_consecutive_failures` failed executions are returned as errors.
    /// Persistence failures are logged and the iteration completes.
    pub fn fuzz_one<C: Corpus>(
        &mut self,
        state: &mut FuzzState<C>,
    ) -> Result<IterationOutcome, FuzzError> {
        let base_id = self.scheduler.next(&state.corpus, &mut self.rng)?;
        let base = state
            .corpus
            .get(base_id)
            .ok_or(CorpusError::InputNotFound(base_id))?
            .clone();

        let Some(candidate) = TestCase::new(self.mutator.mutate(base.as_bytes(), &mut self.rng))
        else {
            log::warn!("Mutator returned an empty candidate for seed {base_id}, skipping");
            return Ok(IterationOutcome::skipped());
        };

        let result = match self
            .executor
            .execute(candidate.as_bytes(), self.settings.timeout)
        {
            Ok(result) => result,
            Err(e) if e.is_fatal() => return Err(e.into()),
            Err(e) => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= self.settings.max_consecutive_failures {
                    return Err(FuzzError::RepeatedFailures {
                        count: self.consecutive_failures,
                        last: e,
                    });
                }
                log::warn!("Execution failed, skipping candidate: {e}");
                return Ok(IterationOutcome::skipped());
            }
        };
        self.consecutive_failures = 0;
        state.exec_count += 1;

        if result.status == ExecutionStatus::Timeout {
            log::debug!(
                "Execution {} timed out after {:?}",
                state.exec_count,
                self.settings.timeout
            );
        }

        let discovery = state.coverage.observe(&result);
        if let Some(found) = discovery {
            let id = state.corpus.add(candidate.clone());
            if let Err(e) = state.corpus.persist(id) {
                log::warn!("Keeping corpus entry {id} in memory only: {e}");
            }
            self.scheduler.report_discovery(base_id, found.new_edges);
            log::info!(
                "New path: \"{}\" | new edges: {} | total edges: {} | corpus: {}",
                candidate.preview(PREVIEW_LEN),
                found.new_edges,
                found.total_edges,
                state.corpus.len()
            );
        }

        let mut crash_file = None;
        let report = self.oracle.examine(&candidate, &result.status);
        let crashed = report.is_some();
        if let Some(report) = report {
            state.crash_count += 1;
            log::info!(
                "Crash found at execution {}: {} (input \"{}\", md5 {})",
                state.exec_count,
                report.description,
                candidate.preview(PREVIEW_LEN),
                report.input_hash
            );
            if let Some(store) = &self.crash_store {
                match store.save(&report) {
                    Ok(path) => {
                        log::info!("Crashing input saved to {path:?}");
                        crash_file = Some(path);
                    }
                    Err(e) => log::warn!("{e}"),
                }
            }
        }

        let control = self.settings.crash_policy.decide(crashed);
        if control == LoopControl::Continue {
            if let Some(stats) = &mut self.stats {
                if let Err(e) = stats.maybe_record(&state.stats_record()) {
                    log::warn!("{e}");
                }
            }
        }

        Ok(IterationOutcome {
            status: Some(result.status),
            discovery,
            crashed,
            crash_file,
            control,
        })
    }

    /// Iterates until `stop` is raised, the iteration bound is reached, or a
    /// crash ends the run.
    ///
    /// On every exit path, including a fatal error, the statistics log gets
    /// its closing row and the executor is torn down.
    pub fn run<C: Corpus>(
        &mut self,
        state: &mut FuzzState<C>,
        stop: &AtomicBool,
    ) -> Result<RunSummary, FuzzError> {
        log::info!(
            "Fuzzing started with {} seeds, timeout {:?}, policy {:?}",
            state.corpus.len(),
            self.settings.timeout,
            self.settings.crash_policy
        );

        let outcome = self.fuzz_loop(state, stop);
        self.shutdown(state);

        let reason = outcome?;
        let summary = state.summary(reason);
        log::info!(
            "Fuzzing stopped ({reason}): {} executions, {} edges, {} corpus entries, \
             {} crashes in {:.2}s",
            summary.executions,
            summary.edges,
            summary.corpus_size,
            summary.crashes,
            summary.elapsed_secs
        );
        Ok(summary)
    }

    fn fuzz_loop<C: Corpus>(
        &mut self,
        state: &mut FuzzState<C>,
        stop: &AtomicBool,
    ) -> Result<StopReason, FuzzError> {
        let mut iterations: u64 = 0;
        loop {
            if stop.load(Ordering::Relaxed) {
                return Ok(StopReason::Interrupted);
            }
            if self
                .settings
                .max_iterations
                .is_some_and(|max| iterations >= max)
            {
                return Ok(StopReason::IterationLimit);
            }
            iterations += 1;

            let outcome = self.fuzz_one(state)?;
            if outcome.control == LoopControl::Stop {
                return Ok(StopReason::CrashFound);
            }
        }
    }

    fn shutdown<C: Corpus>(&mut self, state: &FuzzState<C>) {
        if let Some(stats) = &mut self.stats {
            if let Err(e) = stats.finish(&state.stats_record()) {
                log::warn!("{e}");
            }
        }
        if let Err(e) = self.executor.teardown() {
            log::error!("Executor teardown failed: {e}");
        }
    }
}
