use crate::input::TestCase;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Filename prefix of persisted corpus entries.
pub const SEED_FILE_PREFIX: &str = "id_";

/// Errors that can arise during corpus operations.
#[derive(Error, Debug)]
pub enum CorpusError {
    /// The requested input ID was not found within the corpus.
    #[error("Input ID {0} not found in corpus")]
    InputNotFound(usize),

    /// Reading the seed directory or one of its files failed.
    #[error("Corpus I/O error at {path:?}: {source}")]
    Io { path: PathBuf, source: io::Error },

    /// Writing a retained entry to seed storage failed. The entry stays in
    /// the in-memory corpus regardless.
    #[error("Failed to persist corpus entry {id} to {path:?}: {source}")]
    Persist {
        id: usize,
        path: PathBuf,
        source: io::Error,
    },

    /// The seed directory already holds the highest file number there is.
    #[error("No seed file name left for corpus entry {0}")]
    FileIdsExhausted(usize),
}

/// An ordered, append-only collection of retained inputs.
///
/// Entries are never removed or reordered, so an ID handed out by [`add`]
/// stays valid for the lifetime of the corpus.
///
/// [`add`]: Corpus::add
pub trait Corpus {
    /// Appends `input` to the corpus. Nothing is written to storage.
    ///
    /// # Arguments
    /// * `input`: The test case to retain. The corpus takes ownership.
    ///
    /// # Returns
    /// The ID assigned to the entry, which is its position in the corpus.
    fn add(&mut self, input: TestCase) -> usize;

    /// # Arguments
    /// * `id`: The ID returned by `add` or assigned at load time.
    ///
    /// # Returns
    /// The entry, or `None` if no entry has that ID.
    fn get(&self, id: usize) -> Option<&TestCase>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Writes entry `id` to durable storage.
    ///
    /// # Arguments
    /// * `id`: The entry to write. It stays in the corpus whatever the outcome.
    ///
    /// # Returns
    /// The path the entry was written to, `Ok(None)` for purely in-memory
    /// corpora, or a `CorpusError` if the entry is unknown or the write fails.
    fn persist(&mut self, id: usize) -> Result<Option<PathBuf>, CorpusError>;
}

/// A corpus held only in memory. Nothing survives the process.
#[derive(Debug, Default)]
pub struct InMemoryCorpus {
    entries: Vec<TestCase>,
}

impl InMemoryCorpus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TestCase> {
        self.entries.iter()
    }
}

impl Corpus for InMemoryCorpus {
    fn add(&mut self, input: TestCase) -> usize {
        let id = self.entries.len();
        self.entries.push(input);
        id
    }

    fn get(&self, id: usize) -> Option<&TestCase> {
        self.entries.get(id)
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn persist(&mut self, id: usize) -> Result<Option<PathBuf>, CorpusError> {
        if id >= self.entries.len() {
            return Err(CorpusError::InputNotFound(id));
        }
        Ok(None)
    }
}

/// Result of scanning a seed directory.
#[derive(Debug, Default)]
pub struct SeedScan {
    pub seeds: Vec<TestCase>,
    /// Empty files, which cannot be test cases.
    pub skipped: Vec<PathBuf>,
    /// Highest `id_NNNNNN` number present in the directory.
    pub highest_id: Option<u64>,
}

/// Reads every regular file in `dir`, in filename order. Subdirectories are
/// not traversed.
pub fn scan_seed_dir(dir: &Path) -> Result<SeedScan, CorpusError> {
    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source| CorpusError::Io { path, source }
    };

    let mut paths = Vec::new();
    for entry in fs::read_dir(dir).map_err(io_err(dir))? {
        let path = entry.map_err(io_err(dir))?.path();
        if path.is_file() {
            paths.push(path);
        }
    }
    paths.sort();

    let mut scan = SeedScan::default();
    for path in paths {
        if let Some(id) = parse_seed_id(&path) {
            scan.highest_id = Some(scan.highest_id.map_or(id, |max| max.max(id)));
        }
        let bytes = fs::read(&path).map_err(io_err(&path))?;
        match TestCase::new(bytes) {
            Some(seed) => scan.seeds.push(seed),
            None => scan.skipped.push(path),
        }
    }
    Ok(scan)
}

fn parse_seed_id(path: &Path) -> Option<u64> {
    path.file_name()?
        .to_str()?
        .strip_prefix(SEED_FILE_PREFIX)?
        .parse()
        .ok()
}

/// An in-memory corpus mirrored into a seed directory.
///
/// Loading picks up every file already in the directory. Each persisted entry
/// is written as `id_NNNNNN` holding the exact input bytes; the number is one
/// past both the corpus length and the highest number already on disk, so
/// names never collide across runs.
#[derive(Debug)]
pub struct OnDiskCorpus {
    entries: InMemoryCorpus,
    seed_dir: PathBuf,
    /// `None` once every file number has been used.
    next_file_id: Option<u64>,
}

impl OnDiskCorpus {
    /// Opens `seed_dir`, creating it if needed, and loads the seeds inside.
    pub fn open(seed_dir: impl Into<PathBuf>) -> Result<Self, CorpusError> {
        let seed_dir = seed_dir.into();
        if !seed_dir.exists() {
            fs::create_dir_all(&seed_dir).map_err(|source| CorpusError::Io {
                path: seed_dir.clone(),
                source,
            })?;
        }

        let scan = scan_seed_dir(&seed_dir)?;
        for skipped in &scan.skipped {
            log::warn!("Skipping empty seed file {:?}", skipped);
        }

        let mut entries = InMemoryCorpus::new();
        for seed in scan.seeds {
            entries.add(seed);
        }
        log::info!("Loaded {} seeds from {:?}", entries.len(), seed_dir);

        Ok(Self {
            entries,
            seed_dir,
            next_file_id: scan.highest_id.map_or(Some(0), |id| id.checked_add(1)),
        })
    }

    pub fn seed_dir(&self) -> &Path {
        &self.seed_dir
    }

    fn seed_path(&self, file_id: u64) -> PathBuf {
        self.seed_dir.join(format!("{SEED_FILE_PREFIX}{file_id:06}"))
    }
}

impl Corpus for OnDiskCorpus {
    fn add(&mut self, input: TestCase) -> usize {
        self.entries.add(input)
    }

    fn get(&self, id: usize) -> Option<&TestCase> {
        self.entries.get(id)
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn persist(&mut self, id: usize) -> Result<Option<PathBuf>, CorpusError> {
        let input = self
            .entries
            .get(id)
            .ok_or(CorpusError::InputNotFound(id))?
            .clone();
        let next_file_id = self
            .next_file_id
            .ok_or(CorpusError::FileIdsExhausted(id))?;
        let file_id = next_file_id.max(self.entries.len() as u64);
        let path = self.seed_path(file_id);
        fs::write(&path, input.as_bytes()).map_err(|source| CorpusError::Persist {
            id,
            path: path.clone(),
            source,
        })?;
        self.next_file_id = file_id.checked_add(1);
        Ok(Some(path))
    }
}
