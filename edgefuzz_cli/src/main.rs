use edgefuzz_core::channel::{CoverageChannel, FileChannel, SharedMemoryChannel};
use edgefuzz_core::config::{CoverageBackend, EdgefuzzConfig};
use edgefuzz_core::corpus::{Corpus, OnDiskCorpus};
use edgefuzz_core::executor::{CommandExecutor, CommandExecutorConfig};
use edgefuzz_core::fuzzer::{FuzzState, Fuzzer, StopReason};
use edgefuzz_core::input::TestCase;
use edgefuzz_core::mutator::HavocMutator;
use edgefuzz_core::oracle::{CrashOracle, CrashStore};
use edgefuzz_core::scheduler::RandomScheduler;
use edgefuzz_core::stats::{RunSummary, StatsLog};

use anyhow::Context;
use clap::Parser;
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;
use signal_hook::consts::TERM_SIGNALS;
use std::io;
use std::os::raw::c_int;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

const EXIT_STARTUP_FAILURE: u8 = 1;
const EXIT_CRASH_FOUND: u8 = 2;
/// Exit status when a second termination signal arrives before the run has stopped.
const EXIT_FORCED: c_int = 130;

#[derive(Parser, Debug)]
#[clap(author, version, about = "Coverage-guided greybox fuzzer", long_about = None)]
struct Cli {
    #[clap(short, long, value_parser)]
    config_file: Option<PathBuf>,
    /// Target program; replaces the first element of the configured command.
    #[clap(long)]
    target: Option<String>,
    #[clap(short, long)]
    iterations: Option<u64>,
    /// Seed for the random source, for replaying a run.
    #[clap(short, long)]
    seed: Option<u64>,
    /// Record crashes and keep fuzzing instead of stopping at the first one.
    #[clap(long)]
    continue_on_crash: bool,
}

fn load_config(cli: &Cli) -> Result<EdgefuzzConfig, anyhow::Error> {
    let mut config = match &cli.config_file {
        Some(config_path) => {
            log::info!("Loading configuration from {config_path:?}");
            EdgefuzzConfig::load_from_file(config_path)?
        }
        None => {
            let default_config_path = PathBuf::from("config.toml");
            if default_config_path.exists() {
                log::info!("Loading default configuration {default_config_path:?}");
                EdgefuzzConfig::load_from_file(&default_config_path)?
            } else {
                log::info!("No config file found, using built-in defaults");
                EdgefuzzConfig::default()
            }
        }
    };

    if let Some(target) = &cli.target {
        match config.target.command.first_mut() {
            Some(program) => *program = target.clone(),
            None => config.target.command.push(target.clone()),
        }
    }
    if let Some(iterations) = cli.iterations {
        config.fuzzer.max_iterations = Some(iterations);
    }
    if let Some(seed) = cli.seed {
        config.fuzzer.rng_seed = Some(seed);
    }
    if cli.continue_on_crash {
        config.fuzzer.stop_on_crash = false;
    }

    config.validate()?;
    log::debug!("Effective configuration: {config:#?}");
    Ok(config)
}

fn open_corpus(config: &EdgefuzzConfig) -> Result<OnDiskCorpus, anyhow::Error> {
    let mut corpus = OnDiskCorpus::open(&config.corpus.seed_dir)?;
    if corpus.is_empty() {
        let seed = TestCase::new(config.corpus.default_seed.as_bytes().to_vec())
            .context("default seed is empty")?;
        log::info!("Seed directory is empty, starting from {seed:?}");
        corpus.add(seed);
    }
    Ok(corpus)
}

/// Runs the fuzz loop over `channel`. The channel is released before this returns.
fn fuzz<C: CoverageChannel>(
    config: &EdgefuzzConfig,
    channel: C,
    stop: &AtomicBool,
) -> Result<RunSummary, anyhow::Error> {
    log::info!(
        "Coverage map {} ({} bytes) exported via {}",
        channel.identity(),
        channel.map_size(),
        config.target.coverage_env
    );

    let executor = CommandExecutor::new(
        CommandExecutorConfig {
            command: config.target.command.clone(),
            coverage_env: config.target.coverage_env.clone(),
            working_dir: config.target.working_dir.clone(),
        },
        channel,
    )?;
    let corpus = open_corpus(config)?;

    let seed = config.fuzzer.rng_seed.unwrap_or_else(rand::random::<u64>);
    log::info!("Random seed {seed} (pass --seed {seed} to replay)");

    let mut fuzzer = Fuzzer::new(
        executor,
        HavocMutator::new(config.fuzzer.max_mutations),
        RandomScheduler::new(),
        CrashOracle::new(config.fuzzer.crash_exit_code),
        ChaCha8Rng::seed_from_u64(seed),
        config.fuzzer_settings(),
    )
    .with_crash_store(CrashStore::new(&config.output.out_dir));

    match StatsLog::create(config.output.stats_path(), config.fuzzer.report_interval) {
        Ok(stats) => fuzzer = fuzzer.with_stats(stats),
        Err(e) => log::warn!("Statistics disabled: {e}"),
    }

    log::info!("Target: {}", config.target.command.join(" "));
    let mut state = FuzzState::new(corpus);
    let summary = fuzzer.run(&mut state, stop)?;

    let summary_path = config.output.summary_path();
    match summary.write_json(&summary_path) {
        Ok(()) => log::info!("Run summary written to {summary_path:?}"),
        Err(e) => log::warn!("{e}"),
    }
    Ok(summary)
}

/// Returns a flag raised by the first of `signals`. A second one exits at once.
fn install_stop_flag(signals: &[c_int]) -> io::Result<Arc<AtomicBool>> {
    let stop = Arc::new(AtomicBool::new(false));
    for &signal in signals {
        // Registered first so it sees the flag as it was before this signal.
        signal_hook::flag::register_conditional_shutdown(signal, EXIT_FORCED, Arc::clone(&stop))?;
        signal_hook::flag::register(signal, Arc::clone(&stop))?;
    }
    Ok(stop)
}

fn run(cli: Cli) -> Result<RunSummary, anyhow::Error> {
    let config = load_config(&cli)?;

    std::fs::create_dir_all(&config.output.out_dir).with_context(|| {
        format!("Failed to create output directory {:?}", config.output.out_dir)
    })?;

    let stop = install_stop_flag(TERM_SIGNALS).context("Failed to install signal handlers")?;

    let map_size = config.coverage.map_size;
    match config.coverage.backend {
        CoverageBackend::SharedMemory => {
            let channel = match config.coverage.shm_key {
                Some(key) => SharedMemoryChannel::with_key(key, map_size)?,
                None => SharedMemoryChannel::new(map_size)?,
            };
            fuzz(&config, channel, &stop)
        }
        CoverageBackend::File => {
            let channel = FileChannel::new(config.map_file_path(), map_size)?;
            fuzz(&config, channel, &stop)
        }
    }
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match run(Cli::parse()) {
        Ok(summary) if summary.stop_reason == StopReason::CrashFound => {
            ExitCode::from(EXIT_CRASH_FOUND)
        }
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e:#}");
            ExitCode::from(EXIT_STARTUP_FAILURE)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_overrides_config_values() {
        let cli = Cli::parse_from([
            "edgefuzz",
            "--config-file",
            "/nonexistent/edgefuzz.toml",
        ]);
        assert!(load_config(&cli).is_err());

        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("config.toml");
        std::fs::write(&path, "[target]\ncommand = [\"./old\", \"-q\"]\n").unwrap();
        let path_arg = path.to_string_lossy().into_owned();
        let cli = Cli::parse_from([
            "edgefuzz",
            "--config-file",
            path_arg.as_str(),
            "--target",
            "./new",
            "--iterations",
            "10",
            "--seed",
            "3",
            "--continue-on-crash",
        ]);
        let config = load_config(&cli).unwrap();
        assert_eq!(config.target.command, vec!["./new".to_string(), "-q".to_string()]);
        assert_eq!(config.fuzzer.max_iterations, Some(10));
        assert_eq!(config.fuzzer.rng_seed, Some(3));
        assert!(!config.fuzzer.stop_on_crash);
    }

    #[test]
    fn first_signal_only_raises_the_stop_flag() {
        use signal_hook::consts::SIGUSR1;
        use std::sync::atomic::Ordering;

        let stop = install_stop_flag(&[SIGUSR1]).unwrap();
        assert!(!stop.load(Ordering::Relaxed));
        signal_hook::low_level::raise(SIGUSR1).unwrap();
        assert!(stop.load(Ordering::Relaxed));
    }

    #[test]
    fn empty_seed_dir_falls_back_to_default_seed() {
        let temp = tempfile::tempdir().unwrap();
        let mut config = EdgefuzzConfig::default();
        config.corpus.seed_dir = temp.path().join("seeds");
        let corpus = open_corpus(&config).unwrap();
        assert_eq!(corpus.len(), 1);
        assert_eq!(corpus.get(0).unwrap().as_bytes(), b"a");
    }
}
