//! The coverage channel: a fixed-size byte map the target writes edge hits into.
//!
//! The engine resets the map before every execution and only reads it after
//! the target process has been reaped, so each snapshot holds exactly one
//! execution's activity.

use std::fs::{self, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::ptr;
use std::slice;
use thiserror::Error;

/// Default size of the coverage map, matching the common instrumentation default.
pub const DEFAULT_MAP_SIZE: usize = 65536;

/// Environment variable through which the target learns the channel identity.
pub const DEFAULT_COVERAGE_ENV: &str = "__AFL_SHM_ID";

/// Failures while acquiring or operating a coverage channel.
///
/// Allocation failures are fatal at startup; the engine never retries them.
#[derive(Error, Debug)]
pub enum ChannelError {
    /// A segment or map file with the requested identity already exists,
    /// usually left behind by an unclean shutdown.
    #[error("coverage map {identity} already exists; remove the stale segment or file and retry")]
    AlreadyExists { identity: String },

    #[error("failed to allocate a coverage map of {size} bytes: {source}")]
    Allocation { size: usize, source: io::Error },

    #[error("failed to attach coverage map {identity}: {source}")]
    Attach { identity: String, source: io::Error },

    #[error("coverage map size must be non-zero")]
    ZeroSize,

    #[error("coverage map has already been released")]
    Released,

    #[error("coverage map I/O error: {0}")]
    Io(#[from] io::Error),
}

/// A region shared between the engine and the target for one execution at a time.
pub trait CoverageChannel: Send {
    /// Handle passed to the target so it can attach to the map.
    fn identity(&self) -> String;

    fn map_size(&self) -> usize;

    /// Zero-fills the whole map.
    fn reset(&mut self) -> Result<(), ChannelError>;

    /// Copies the current contents of the map.
    ///
    /// # Returns
    /// A buffer of exactly `map_size()` bytes, or a `ChannelError` if the
    /// backing resource cannot be read.
    fn snapshot(&self) -> Result<Vec<u8>, ChannelError>;

    /// Detaches and removes the backing resource. Safe to call more than once.
    fn release(&mut self) -> Result<(), ChannelError>;
}

/// A System V shared memory segment, the transport instrumented targets expect.
///
/// The segment is created with `IPC_CREAT | IPC_EXCL`, so an existing segment
/// under the same key is reported instead of being silently reused. The segment
/// is removed on [`release`](CoverageChannel::release) and on drop.
#[derive(Debug)]
pub struct SharedMemoryChannel {
    shm_id: libc::c_int,
    map: *mut u8,
    map_size: usize,
    released: bool,
}

// The mapping is owned exclusively by this value; the raw pointer is never shared.
unsafe impl Send for SharedMemoryChannel {}

impl SharedMemoryChannel {
    /// Allocates a fresh private segment of `map_size` bytes.
    pub fn new(map_size: usize) -> Result<Self, ChannelError> {
        Self::create(libc::IPC_PRIVATE, map_size)
    }

    /// Allocates a segment under a fixed System V key.
    ///
    /// Fails with [`ChannelError::AlreadyExists`] when a segment with `key`
    /// survives from an earlier run.
    pub fn with_key(key: i32, map_size: usize) -> Result<Self, ChannelError> {
        Self::create(key as libc::key_t, map_size)
    }

    fn create(key: libc::key_t, map_size: usize) -> Result<Self, ChannelError> {
        if map_size == 0 {
            return Err(ChannelError::ZeroSize);
        }

        let shm_id =
            unsafe { libc::shmget(key, map_size, libc::IPC_CREAT | libc::IPC_EXCL | 0o600) };
        if shm_id < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EEXIST) {
                return Err(ChannelError::AlreadyExists {
                    identity: format!("shm key {key:#x}"),
                });
            }
            return Err(ChannelError::Allocation {
                size: map_size,
                source: err,
            });
        }

        let map = unsafe { libc::shmat(shm_id, ptr::null(), 0) };
        if map as isize == -1 || map.is_null() {
            let err = io::Error::last_os_error();
            unsafe {
                libc::shmctl(shm_id, libc::IPC_RMID, ptr::null_mut());
            }
            return Err(ChannelError::Attach {
                identity: shm_id.to_string(),
                source: err,
            });
        }

        let mut channel = Self {
            shm_id,
            map: map as *mut u8,
            map_size,
            released: false,
        };
        channel.reset()?;
        log::debug!(
            "Allocated shared memory coverage map id={} size={}",
            shm_id,
            map_size
        );
        Ok(channel)
    }

    pub fn shm_id(&self) -> i32 {
        self.shm_id
    }
}

impl CoverageChannel for SharedMemoryChannel {
    fn identity(&self) -> String {
        self.shm_id.to_string()
    }

    fn map_size(&self) -> usize {
        self.map_size
    }

    fn reset(&mut self) -> Result<(), ChannelError> {
        if self.released {
            return Err(ChannelError::Released);
        }
        unsafe { ptr::write_bytes(self.map, 0, self.map_size) };
        Ok(())
    }

    fn snapshot(&self) -> Result<Vec<u8>, ChannelError> {
        if self.released {
            return Err(ChannelError::Released);
        }
        let view = unsafe { slice::from_raw_parts(self.map, self.map_size) };
        Ok(view.to_vec())
    }

    fn release(&mut self) -> Result<(), ChannelError> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        let detach = unsafe { libc::shmdt(self.map as *const libc::c_void) };
        let detach_err = (detach != 0).then(io::Error::last_os_error);
        let remove = unsafe { libc::shmctl(self.shm_id, libc::IPC_RMID, ptr::null_mut()) };
        if remove != 0 {
            return Err(ChannelError::Io(io::Error::last_os_error()));
        }
        if let Some(err) = detach_err {
            return Err(ChannelError::Io(err));
        }
        log::debug!("Released shared memory coverage map id={}", self.shm_id);
        Ok(())
    }
}

impl Drop for SharedMemoryChannel {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            log::warn!("Failed to release coverage map {}: {}", self.shm_id, e);
        }
    }
}

/// A coverage map backed by a regular file, for platforms or targets that
/// cannot use System V shared memory. The target receives the file path and
/// writes hit counts at the byte offset of each edge.
#[derive(Debug)]
pub struct FileChannel {
    path: PathBuf,
    map_size: usize,
    released: bool,
}

impl FileChannel {
    /// Creates the map file at `path`. The file must not already exist.
    pub fn new(path: impl AsRef<Path>, map_size: usize) -> Result<Self, ChannelError> {
        if map_size == 0 {
            return Err(ChannelError::ZeroSize);
        }
        let path = path.as_ref().to_path_buf();
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file.set_len(map_size as u64)?,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(ChannelError::AlreadyExists {
                    identity: path.display().to_string(),
                });
            }
            Err(e) => {
                return Err(ChannelError::Allocation {
                    size: map_size,
                    source: e,
                });
            }
        }
        log::debug!("Created file coverage map {:?} size={}", path, map_size);
        Ok(Self {
            path,
            map_size,
            released: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CoverageChannel for FileChannel {
    fn identity(&self) -> String {
        self.path.display().to_string()
    }

    fn map_size(&self) -> usize {
        self.map_size
    }

    fn reset(&mut self) -> Result<(), ChannelError> {
        if self.released {
            return Err(ChannelError::Released);
        }
        let mut file = OpenOptions::new().write(true).open(&self.path)?;
        file.set_len(self.map_size as u64)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&vec![0u8; self.map_size])?;
        file.flush()?;
        Ok(())
    }

    fn snapshot(&self) -> Result<Vec<u8>, ChannelError> {
        if self.released {
            return Err(ChannelError::Released);
        }
        let mut contents = fs::read(&self.path)?;
        // Writes past the end of the map are not edges.
        contents.resize(self.map_size, 0);
        Ok(contents)
    }

    fn release(&mut self) -> Result<(), ChannelError> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ChannelError::Io(e)),
        }
    }
}

impl Drop for FileChannel {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            log::warn!("Failed to remove coverage map file {:?}: {}", self.path, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_key(salt: i32) -> i32 {
        // Distinct per process and per test so parallel test runs do not collide.
        0x4546_0000 ^ ((std::process::id() as i32) << 4) ^ salt
    }

    #[test]
    fn shared_memory_reset_and_snapshot() {
        let mut channel = SharedMemoryChannel::new(128).expect("allocate segment");
        assert_eq!(channel.map_size(), 128);
        assert!(channel.identity().parse::<i32>().is_ok());

        unsafe { *channel.map.add(7) = 3 };
        let snap = channel.snapshot().unwrap();
        assert_eq!(snap[7], 3);

        channel.reset().unwrap();
        assert!(channel.snapshot().unwrap().iter().all(|&b| b == 0));

        channel.release().unwrap();
        channel.release().unwrap();
        assert!(matches!(channel.snapshot(), Err(ChannelError::Released)));
    }

    #[test]
    fn shared_memory_existing_key_is_rejected_until_released() {
        let key = scratch_key(1);
        let mut first = SharedMemoryChannel::with_key(key, 64).expect("first allocation");
        match SharedMemoryChannel::with_key(key, 64) {
            Err(ChannelError::AlreadyExists { .. }) => {}
            other => panic!("expected AlreadyExists, got {other:?}"),
        }
        first.release().unwrap();

        let second = SharedMemoryChannel::with_key(key, 64);
        assert!(second.is_ok(), "key should be free after release");
    }

    #[test]
    fn shared_memory_drop_frees_the_key() {
        let key = scratch_key(2);
        {
            let _channel = SharedMemoryChannel::with_key(key, 64).unwrap();
        }
        assert!(SharedMemoryChannel::with_key(key, 64).is_ok());
    }

    #[test]
    fn zero_sized_maps_are_rejected() {
        assert!(matches!(
            SharedMemoryChannel::new(0),
            Err(ChannelError::ZeroSize)
        ));
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            FileChannel::new(dir.path().join("map"), 0),
            Err(ChannelError::ZeroSize)
        ));
    }

    #[test]
    fn file_channel_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("edges.map");
        let mut channel = FileChannel::new(&path, 32).unwrap();
        assert_eq!(channel.identity(), path.display().to_string());
        assert_eq!(fs::metadata(&path).unwrap().len(), 32);

        let mut raw = fs::read(&path).unwrap();
        raw[5] = 1;
        raw.extend_from_slice(&[9, 9, 9]);
        fs::write(&path, raw).unwrap();

        let snap = channel.snapshot().unwrap();
        assert_eq!(snap.len(), 32);
        assert_eq!(snap[5], 1);

        channel.reset().unwrap();
        let snap = channel.snapshot().unwrap();
        assert!(snap.iter().all(|&b| b == 0));
        assert_eq!(fs::metadata(&path).unwrap().len(), 32);

        channel.release().unwrap();
        assert!(!path.exists());
        channel.release().unwrap();
    }

    #[test]
    fn file_channel_refuses_stale_map() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stale.map");
        fs::write(&path, b"left over").unwrap();
        match FileChannel::new(&path, 16) {
            Err(ChannelError::AlreadyExists { identity }) => {
                assert!(identity.contains("stale.map"))
            }
            other => panic!("expected AlreadyExists, got {other:?}"),
        }
    }
}
