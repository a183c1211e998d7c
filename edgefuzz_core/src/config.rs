use crate::channel::{DEFAULT_COVERAGE_ENV, DEFAULT_MAP_SIZE};
use crate::fuzzer::{DEFAULT_MAX_CONSECUTIVE_FAILURES, FuzzerSettings};
use crate::mutator::DEFAULT_MAX_STACKING;
use crate::oracle::{CrashPolicy, DEFAULT_CRASH_EXIT_CODE};
use crate::stats::DEFAULT_REPORT_INTERVAL;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CoverageBackend {
    /// System V shared memory segment, identified by its id.
    #[default]
    SharedMemory,
    /// Plain file of `map-size` bytes, identified by its path.
    File,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct TargetConfig {
    #[serde(default = "default_command")]
    pub command: Vec<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_coverage_env")]
    pub coverage_env: String,
    pub working_dir: Option<PathBuf>,
}

fn default_command() -> Vec<String> {
    vec!["./target".to_string()]
}

fn default_timeout_ms() -> u64 {
    500
}

fn default_coverage_env() -> String {
    DEFAULT_COVERAGE_ENV.to_string()
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            command: default_command(),
            timeout_ms: default_timeout_ms(),
            coverage_env: default_coverage_env(),
            working_dir: None,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CoverageConfig {
    #[serde(default)]
    pub backend: CoverageBackend,
    /// Must equal the map size the target was instrumented with.
    #[serde(default = "default_map_size")]
    pub map_size: usize,
    /// Fixed segment key; a private segment is used when absent.
    pub shm_key: Option<i32>,
    /// Map path for the file backend. Defaults to `coverage.map` in the output directory.
    pub map_file: Option<PathBuf>,
}

fn default_map_size() -> usize {
    DEFAULT_MAP_SIZE
}

impl Default for CoverageConfig {
    fn default() -> Self {
        Self {
            backend: CoverageBackend::default(),
            map_size: default_map_size(),
            shm_key: None,
            map_file: None,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CorpusConfig {
    #[serde(default = "default_seed_dir")]
    pub seed_dir: PathBuf,
    /// Used when the seed directory holds no usable input.
    #[serde(default = "default_seed")]
    pub default_seed: String,
}

fn default_seed_dir() -> PathBuf {
    PathBuf::from("seeds")
}

fn default_seed() -> String {
    "a".to_string()
}

impl Default for CorpusConfig {
    fn default() -> Self {
        Self {
            seed_dir: default_seed_dir(),
            default_seed: default_seed(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct OutputConfig {
    #[serde(default = "default_out_dir")]
    pub out_dir: PathBuf,
    /// Relative names are resolved against `out-dir`.
    #[serde(default = "default_stats_file")]
    pub stats_file: PathBuf,
    #[serde(default = "default_summary_file")]
    pub summary_file: PathBuf,
}

fn default_out_dir() -> PathBuf {
    PathBuf::from("out")
}

fn default_stats_file() -> PathBuf {
    PathBuf::from("fuzz_stats.csv")
}

fn default_summary_file() -> PathBuf {
    PathBuf::from("run_summary.json")
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            out_dir: default_out_dir(),
            stats_file: default_stats_file(),
            summary_file: default_summary_file(),
        }
    }
}

impl OutputConfig {
    pub fn stats_path(&self) -> PathBuf {
        self.out_dir.join(&self.stats_file)
    }

    pub fn summary_path(&self) -> PathBuf {
        self.out_dir.join(&self.summary_file)
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct FuzzerConfig {
    /// Absent means run until interrupted or stopped by a crash.
    pub max_iterations: Option<u64>,
    #[serde(default = "default_max_mutations")]
    pub max_mutations: usize,
    #[serde(default = "default_report_interval")]
    pub report_interval: u64,
    #[serde(default = "default_crash_exit_code")]
    pub crash_exit_code: i32,
    #[serde(default = "default_stop_on_crash")]
    pub stop_on_crash: bool,
    /// Failed executions in a row that end the run.
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
    pub rng_seed: Option<u64>,
}

fn default_max_mutations() -> usize {
    DEFAULT_MAX_STACKING
}

fn default_report_interval() -> u64 {
    DEFAULT_REPORT_INTERVAL
}

fn default_crash_exit_code() -> i32 {
    DEFAULT_CRASH_EXIT_CODE
}

fn default_stop_on_crash() -> bool {
    true
}

fn default_max_consecutive_failures() -> u32 {
    DEFAULT_MAX_CONSECUTIVE_FAILURES
}

impl Default for FuzzerConfig {
    fn default() -> Self {
        Self {
            max_iterations: None,
            max_mutations: default_max_mutations(),
            report_interval: default_report_interval(),
            crash_exit_code: default_crash_exit_code(),
            stop_on_crash: default_stop_on_crash(),
            max_consecutive_failures: default_max_consecutive_failures(),
            rng_seed: None,
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct EdgefuzzConfig {
    #[serde(default)]
    pub target: TargetConfig,
    #[serde(default)]
    pub coverage: CoverageConfig,
    #[serde(default)]
    pub corpus: CorpusConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub fuzzer: FuzzerConfig,
}

impl EdgefuzzConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let config: EdgefuzzConfig = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;

        Ok(config)
    }

    /// Rejects settings no run could succeed with.
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.target.command.first().is_none_or(|program| program.is_empty()) {
            anyhow::bail!("target command is empty");
        }
        if self.target.timeout_ms == 0 {
            anyhow::bail!("target timeout-ms must be greater than zero");
        }
        if self.coverage.map_size == 0 {
            anyhow::bail!("coverage map-size must be greater than zero");
        }
        if self.corpus.default_seed.is_empty() {
            anyhow::bail!("corpus default-seed must not be empty");
        }
        if self.fuzzer.max_consecutive_failures == 0 {
            anyhow::bail!("fuzzer max-consecutive-failures must be greater than zero");
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.target.timeout_ms)
    }

    pub fn map_file_path(&self) -> PathBuf {
        self.coverage
            .map_file
            .clone()
            .unwrap_or_else(|| self.output.out_dir.join("coverage.map"))
    }

    pub fn fuzzer_settings(&self) -> FuzzerSettings {
        FuzzerSettings {
            timeout: self.timeout(),
            crash_policy: CrashPolicy::from_stop_on_crash(self.fuzzer.stop_on_crash),
            max_iterations: self.fuzzer.max_iterations,
            max_consecutive_failures: self.fuzzer.max_consecutive_failures,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config: EdgefuzzConfig = toml::from_str("").unwrap();
        assert_eq!(config.target.command, vec!["./target".to_string()]);
        assert_eq!(config.target.timeout_ms, 500);
        assert_eq!(config.target.coverage_env, "__AFL_SHM_ID");
        assert_eq!(config.coverage.backend, CoverageBackend::SharedMemory);
        assert_eq!(config.coverage.map_size, 65536);
        assert_eq!(config.corpus.seed_dir, PathBuf::from("seeds"));
        assert_eq!(config.corpus.default_seed, "a");
        assert_eq!(config.output.stats_path(), PathBuf::from("out/fuzz_stats.csv"));
        assert_eq!(config.fuzzer.max_iterations, None);
        assert_eq!(config.fuzzer.max_mutations, 8);
        assert_eq!(config.fuzzer.report_interval, 100);
        assert_eq!(config.fuzzer.crash_exit_code, 66);
        assert!(config.fuzzer.stop_on_crash);
        assert_eq!(config.fuzzer.max_consecutive_failures, 100);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn full_document_is_parsed() {
        let config: EdgefuzzConfig = toml::from_str(
            r#"
            [target]
            command = ["./target_instrumented", "--quiet"]
            timeout-ms = 250
            coverage-env = "EDGEFUZZ_MAP"

            [coverage]
            backend = "file"
            map-size = 4096
            map-file = "/tmp/edgefuzz.map"

            [corpus]
            seed-dir = "corpus"
            default-seed = "hello"

            [output]
            out-dir = "results"
            summary-file = "/var/tmp/summary.json"

            [fuzzer]
            max-iterations = 1000
            max-mutations = 4
            report-interval = 50
            crash-exit-code = 77
            stop-on-crash = false
            max-consecutive-failures = 3
            rng-seed = 1234
            "#,
        )
        .unwrap();

        assert_eq!(config.target.command.len(), 2);
        assert_eq!(config.timeout(), Duration::from_millis(250));
        assert_eq!(config.coverage.backend, CoverageBackend::File);
        assert_eq!(config.map_file_path(), PathBuf::from("/tmp/edgefuzz.map"));
        assert_eq!(config.output.stats_path(), PathBuf::from("results/fuzz_stats.csv"));
        assert_eq!(
            config.output.summary_path(),
            PathBuf::from("/var/tmp/summary.json")
        );
        assert_eq!(config.fuzzer.rng_seed, Some(1234));

        let settings = config.fuzzer_settings();
        assert_eq!(settings.crash_policy, CrashPolicy::Continue);
        assert_eq!(settings.max_iterations, Some(1000));
        assert_eq!(settings.max_consecutive_failures, 3);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let result: Result<EdgefuzzConfig, _> = toml::from_str("[fuzzer]\nthreads = 4\n");
        assert!(result.is_err());
    }

    #[test]
    fn map_file_defaults_into_out_dir() {
        let config = EdgefuzzConfig::default();
        assert_eq!(config.map_file_path(), PathBuf::from("out/coverage.map"));
    }

    #[test]
    fn validate_rejects_unusable_settings() {
        let mut config = EdgefuzzConfig::default();
        config.target.command.clear();
        assert!(config.validate().is_err());

        let mut config = EdgefuzzConfig::default();
        config.coverage.map_size = 0;
        assert!(config.validate().is_err());

        let mut config = EdgefuzzConfig::default();
        config.target.timeout_ms = 0;
        assert!(config.validate().is_err());

        let mut config = EdgefuzzConfig::default();
        config.fuzzer.max_consecutive_failures = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_from_file_reports_path_on_parse_error() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("config.toml");
        std::fs::write(&path, "[target]\ntimeout-ms = \"slow\"\n").unwrap();
        let err = EdgefuzzConfig::load_from_file(&path).unwrap_err();
        assert!(err.to_string().contains("config.toml"));

        std::fs::write(&path, "[fuzzer]\nrng-seed = 9\n").unwrap();
        let config = EdgefuzzConfig::load_from_file(&path).unwrap();
        assert_eq!(config.fuzzer.rng_seed, Some(9));
    }
}
