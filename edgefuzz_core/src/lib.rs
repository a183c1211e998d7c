pub mod channel;
pub mod config;
pub mod corpus;
pub mod executor;
pub mod feedback;
pub mod fuzzer;
pub mod input;
pub mod mutator;
pub mod oracle;
pub mod scheduler;
pub mod stats;

pub use channel::{ChannelError, CoverageChannel, FileChannel, SharedMemoryChannel};
pub use config::{CoverageBackend, EdgefuzzConfig};
pub use corpus::{Corpus, CorpusError, InMemoryCorpus, OnDiskCorpus};
pub use executor::{
    CommandExecutor, CommandExecutorConfig, ExecutionResult, ExecutionStatus, Executor,
    ExecutorError, InProcessExecutor,
};
pub use feedback::{CoverageFeedback, Discovery, EdgeSet, Feedback};
pub use fuzzer::{FuzzError, FuzzState, Fuzzer, FuzzerSettings, IterationOutcome, StopReason};
pub use input::TestCase;
pub use mutator::{HavocMutator, MutationKind, Mutator};
pub use oracle::{BugReport, CrashOracle, CrashPolicy, CrashStore, LoopControl, Oracle};
pub use scheduler::{RandomScheduler, Scheduler, SchedulerError};
pub use stats::{RunSummary, StatsError, StatsLog, StatsRecord};
