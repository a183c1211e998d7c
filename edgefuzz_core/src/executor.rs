use crate::channel::{ChannelError, CoverageChannel, DEFAULT_COVERAGE_ENV};
use crate::feedback::EdgeSet;
use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::sys::wait::{Id, WaitPidFlag, WaitStatus, waitid};
use nix::unistd::Pid;
use std::fmt;
use std::io::{self, Write};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;

const MIN_POLL_INTERVAL: Duration = Duration::from_micros(100);
const MAX_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// How a target run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionStatus {
    /// The target exited on its own with this code.
    Normal(i32),
    /// The target was terminated by this signal.
    Signaled(i32),
    /// The target exceeded its time budget and was killed.
    Timeout,
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionStatus::Normal(code) => write!(f, "exit code {code}"),
            ExecutionStatus::Signaled(signal) => match Signal::try_from(*signal) {
                Ok(sig) => write!(f, "signal {signal} ({})", sig.as_str()),
                Err(_) => write!(f, "signal {signal}"),
            },
            ExecutionStatus::Timeout => write!(f, "timeout"),
        }
    }
}

/// Outcome of one target execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub edges: EdgeSet,
    pub status: ExecutionStatus,
}

impl ExecutionResult {
    pub fn new(edges: EdgeSet, status: ExecutionStatus) -> Self {
        Self { edges, status }
    }

    /// A timed-out run. Timeouts never report coverage.
    pub fn timeout() -> Self {
        Self {
            edges: EdgeSet::new(),
            status: ExecutionStatus::Timeout,
        }
    }
}

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("target command is empty")]
    EmptyCommand,

    #[error("failed to spawn target {command:?}: {source}")]
    Spawn { command: String, source: io::Error },

    #[error("failed to wait for target process: {0}")]
    Wait(io::Error),

    #[error("failed to kill target process group {pid}: {source}")]
    Kill { pid: u32, source: io::Error },

    #[error("coverage channel failure: {0}")]
    Channel(#[from] ChannelError),
}

impl ExecutorError {
    /// Whether retrying with another candidate is pointless.
    ///
    /// A missing target, one that is not executable or not in an executable
    /// format, and a broken coverage channel fail the same way for every
    /// input; anything else is confined to one run.
    pub fn is_fatal(&self) -> bool {
        match self {
            ExecutorError::EmptyCommand | ExecutorError::Channel(_) => true,
            ExecutorError::Spawn { source, .. } => {
                matches!(
                    source.kind(),
                    io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied
                ) || source.raw_os_error() == Some(libc::ENOEXEC)
            }
            ExecutorError::Wait(_) | ExecutorError::Kill { .. } => false,
        }
    }
}

/// Runs a candidate against the target and reports what happened.
pub trait Executor {
    /// Executes `candidate` once, waiting at most `timeout` for the target.
    ///
    /// # Arguments
    /// * `candidate`: The exact bytes to deliver to the target.
    /// * `timeout`: Upper bound on the target's run time. A target still
    ///   running when it elapses is killed and reported as
    ///   [`ExecutionStatus::Timeout`].
    ///
    /// # Returns
    /// The coverage and termination status of the run, or an `ExecutorError`
    /// when the run could not be carried out at all.
    fn execute(
        &mut self,
        candidate: &[u8],
        timeout: Duration,
    ) -> Result<ExecutionResult, ExecutorError>;

    /// Frees resources held across executions. Called once when fuzzing ends.
    fn teardown(&mut self) -> Result<(), ExecutorError> {
        Ok(())
    }
}

/// Runs a closure in the fuzzer's own process instead of spawning a target.
///
/// The closure decides both the coverage and the status, which makes this
/// executor handy for replaying recorded outcomes and for exercising the
/// fuzz loop without a real binary.
pub struct InProcessExecutor<F>
where
    F: FnMut(&[u8]) -> ExecutionResult,
{
    harness_fn: F,
}

impl<F> InProcessExecutor<F>
where
    F: FnMut(&[u8]) -> ExecutionResult,
{
    pub fn new(harness_fn: F) -> Self {
        Self { harness_fn }
    }
}

impl<F> Executor for InProcessExecutor<F>
where
    F: FnMut(&[u8]) -> ExecutionResult,
{
    fn execute(
        &mut self,
        candidate: &[u8],
        _timeout: Duration,
    ) -> Result<ExecutionResult, ExecutorError> {
        Ok((self.harness_fn)(candidate))
    }
}

#[derive(Debug, Clone)]
pub struct CommandExecutorConfig {
    /// Target program followed by its arguments.
    pub command: Vec<String>,
    /// Environment variable carrying the coverage channel identity.
    pub coverage_env: String,
    pub working_dir: Option<PathBuf>,
}

impl CommandExecutorConfig {
    pub fn new(command: Vec<String>) -> Self {
        Self {
            command,
            coverage_env: DEFAULT_COVERAGE_ENV.to_string(),
            working_dir: None,
        }
    }
}

/// Spawns the target once per candidate and feeds the candidate on stdin.
///
/// The target runs in its own process group. On timeout the whole group is
/// killed and the target reaped before returning, so no process outlives the
/// execution. Coverage is read from the channel only after the target has
/// terminated.
pub struct CommandExecutor<C: CoverageChannel> {
    config: CommandExecutorConfig,
    channel: C,
}

impl<C: CoverageChannel> CommandExecutor<C> {
    pub fn new(config: CommandExecutorConfig, channel: C) -> Result<Self, ExecutorError> {
        if config.command.is_empty() {
            return Err(ExecutorError::EmptyCommand);
        }
        Ok(Self { config, channel })
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn config(&self) -> &CommandExecutorConfig {
        &self.config
    }

    fn build_command(&self) -> Command {
        let mut cmd = Command::new(&self.config.command[0]);
        cmd.args(&self.config.command[1..]);
        if let Some(cwd) = &self.config.working_dir {
            cmd.current_dir(cwd);
        }
        cmd.env(&self.config.coverage_env, self.channel.identity())
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0);
        cmd
    }
}

/// Writes the candidate from a helper thread so a target that never reads its
/// input cannot block the timeout logic.
fn spawn_stdin_feeder(mut stdin: ChildStdin, data: Vec<u8>) -> JoinHandle<io::Result<()>> {
    thread::spawn(move || match stdin.write_all(&data) {
        // The target may legitimately exit before consuming all of its input.
        Err(e) if e.kind() == io::ErrorKind::BrokenPipe => Ok(()),
        other => other,
    })
}

fn join_feeder(feeder: Option<JoinHandle<io::Result<()>>>) {
    let Some(handle) = feeder else {
        return;
    };
    match handle.join() {
        Ok(Ok(())) => {}
        Ok(Err(e)) => log::debug!("Writing candidate to target stdin failed: {e}"),
        Err(_) => log::warn!("Stdin feeder thread panicked"),
    }
}

/// Whether the child has terminated, without reaping it. The pid, and with it
/// the process group id, stays reserved until the child is waited for.
fn has_exited(child: &Child) -> io::Result<bool> {
    let pid = Pid::from_raw(child.id() as i32);
    let flags = WaitPidFlag::WEXITED | WaitPidFlag::WNOHANG | WaitPidFlag::WNOWAIT;
    loop {
        match waitid(Id::Pid(pid), flags) {
            Ok(WaitStatus::StillAlive) => return Ok(false),
            Ok(_) => return Ok(true),
            Err(Errno::EINTR) => continue,
            Err(errno) => return Err(io::Error::from(errno)),
        }
    }
}

/// Polls the child until it terminates or `timeout` elapses. Returns `false`
/// on timeout. The child is left unreaped either way.
fn wait_with_timeout(child: &Child, timeout: Duration) -> io::Result<bool> {
    let start_time = Instant::now();
    let mut interval = MIN_POLL_INTERVAL;
    loop {
        if has_exited(child)? {
            return Ok(true);
        }
        let elapsed = start_time.elapsed();
        if elapsed >= timeout {
            return Ok(false);
        }
        thread::sleep(interval.min(timeout - elapsed));
        interval = (interval * 2).min(MAX_POLL_INTERVAL);
    }
}

/// SIGKILLs the child's process group. Missing groups are not an error.
///
/// Must only be called while the child is unreaped, so the group id cannot
/// have been recycled.
fn kill_process_group(child: &Child) -> Result<(), ExecutorError> {
    let pid = child.id();
    match killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(errno) => Err(ExecutorError::Kill {
            pid,
            source: io::Error::from(errno),
        }),
    }
}

/// Kills a still-running target and blocks until it is reaped.
fn kill_and_reap(child: &mut Child) -> Result<(), ExecutorError> {
    let group_result = kill_process_group(child);
    if group_result.is_err() {
        // Fall back to the direct child so that at least it does not linger.
        let _ = child.kill();
    }
    child.wait().map_err(ExecutorError::Wait)?;
    group_result
}

fn status_from_exit(exit: ExitStatus) -> ExecutionStatus {
    match (exit.code(), exit.signal()) {
        (Some(code), _) => ExecutionStatus::Normal(code),
        (None, Some(signal)) => ExecutionStatus::Signaled(signal),
        // wait(2) without WUNTRACED only reports exits and signals.
        (None, None) => ExecutionStatus::Normal(exit.into_raw()),
    }
}

impl<C: CoverageChannel> Executor for CommandExecutor<C> {
    fn execute(
        &mut self,
        candidate: &[u8],
        timeout: Duration,
    ) -> Result<ExecutionResult, ExecutorError> {
        self.channel.reset()?;

        let mut child = self
            .build_command()
            .spawn()
            .map_err(|source| ExecutorError::Spawn {
                command: self.config.command.join(" "),
                source,
            })?;
        let feeder = child
            .stdin
            .take()
            .map(|stdin| spawn_stdin_feeder(stdin, candidate.to_vec()));

        match wait_with_timeout(&child, timeout) {
            Ok(true) => {}
            Ok(false) => {
                log::trace!("Target {} timed out after {:?}", child.id(), timeout);
                let killed = kill_and_reap(&mut child);
                join_feeder(feeder);
                killed?;
                return Ok(ExecutionResult::timeout());
            }
            Err(e) => {
                let _ = kill_and_reap(&mut child);
                join_feeder(feeder);
                return Err(ExecutorError::Wait(e));
            }
        }

        // Descendants left behind in the target's group would otherwise keep
        // stdin open and outlive the execution. The target is still a zombie
        // here, which pins the group id.
        if let Err(e) = kill_process_group(&child) {
            log::debug!("Cleaning up target process group failed: {e}");
        }
        let exit = child.wait();
        join_feeder(feeder);
        let exit = exit.map_err(ExecutorError::Wait)?;

        let status = status_from_exit(exit);
        let bitmap = self.channel.snapshot()?;
        let edges = EdgeSet::from_bitmap(&bitmap);
        log::trace!("Target finished with {status}, {} edges", edges.len());
        Ok(ExecutionResult { edges, status })
    }

    fn teardown(&mut self) -> Result<(), ExecutorError> {
        self.channel.release()?;
        Ok(())
    }
}
