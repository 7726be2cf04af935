//! File-backed named mappings and the directory they live in.
//!
//! A segment is a regular file mapped with `memmap2`; any process that resolves
//! the same directory and name maps the same bytes. Files are named
//! `PanLink_<name>.mem` so a helper process can find them without any other
//! coordination.

use crate::error::{Result, ShmError};
use memmap2::MmapMut;
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Overrides the segment directory for every process that honours it.
pub const SHM_DIR_ENV: &str = "PANLINK_SHM_DIR";

const APP_DIR: &str = "PanLink";

/// Pick the directory segments are stored in.
///
/// Candidates, first usable wins: `explicit`, `$PANLINK_SHM_DIR`, the per-user
/// cache dir, the per-user local data dir, `<temp>/PanLink`.
pub fn resolve_directory(explicit: Option<&Path>) -> Result<PathBuf> {
    let mut candidates: Vec<PathBuf> = Vec::with_capacity(5);
    if let Some(dir) = explicit {
        candidates.push(dir.to_path_buf());
    }
    if let Some(dir) = std::env::var_os(SHM_DIR_ENV) {
        if !dir.is_empty() {
            candidates.push(PathBuf::from(dir));
        }
    }
    if let Some(dir) = dirs::cache_dir() {
        candidates.push(dir.join(APP_DIR));
    }
    if let Some(dir) = dirs::data_local_dir() {
        candidates.push(dir.join(APP_DIR));
    }
    candidates.push(std::env::temp_dir().join(APP_DIR));

    let mut last = PathBuf::new();
    for dir in candidates {
        if dir.is_dir() || std::fs::create_dir_all(&dir).is_ok() {
            return Ok(dir);
        }
        debug!("Shared memory directory {} not usable", dir.display());
        last = dir;
    }
    Err(ShmError::NoDirectory(last))
}

pub fn segment_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("PanLink_{}.mem", name))
}

/// Remove a segment's backing file. Returns `false` if it did not exist.
pub fn remove_segment(dir: &Path, name: &str) -> Result<bool> {
    match std::fs::remove_file(segment_path(dir, name)) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// One mapped segment file.
///
/// The mapping is only ever touched through raw pointers derived from `base`,
/// with the header fields accessed as atomics, so handing out `&self` across
/// threads is fine.
pub(crate) struct Segment {
    _mmap: MmapMut,
    base: *mut u8,
    len: usize,
    path: PathBuf,
    created: bool,
}

// SAFETY: `base` points into `_mmap`, which lives as long as the Segment and
// never moves. Concurrent access goes through atomics or through the
// single-writer seqlock protocol of the channel built on top.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl Segment {
    /// Attach to `path`, or create it with `len` bytes when missing and allowed.
    pub fn open(path: &Path, name: &str, len: usize, create_if_missing: bool) -> Result<Self> {
        let (file, created) = match Self::open_existing(path) {
            Ok(file) => (file, false),
            Err(e) if e.kind() == ErrorKind::NotFound && create_if_missing => {
                match Self::create_new(path) {
                    Ok(file) => (file, true),
                    // Lost a creation race against another process.
                    Err(e) if e.kind() == ErrorKind::AlreadyExists => (
                        Self::open_existing(path).map_err(|e| ShmError::unavailable(name, e))?,
                        false,
                    ),
                    Err(e) => return Err(ShmError::unavailable(name, e)),
                }
            }
            Err(e) => return Err(ShmError::unavailable(name, e)),
        };

        let existing = file
            .metadata()
            .map_err(|e| ShmError::unavailable(name, e))?
            .len() as usize;

        // A fresh file, or one whose creator hasn't sized it yet.
        if existing == 0 {
            file.set_len(len as u64)
                .map_err(|e| ShmError::unavailable(name, format!("failed to size: {}", e)))?;
        }

        let mut mmap = unsafe { MmapMut::map_mut(&file) }
            .map_err(|e| ShmError::unavailable(name, format!("failed to map: {}", e)))?;
        let mapped_len = mmap.len();
        let base = mmap.as_mut_ptr();

        if created {
            info!("Created shared memory {} ({} bytes)", path.display(), mapped_len);
        } else {
            debug!("Attached shared memory {} ({} bytes)", path.display(), mapped_len);
        }

        Ok(Self {
            _mmap: mmap,
            base,
            len: mapped_len,
            path: path.to_path_buf(),
            created,
        })
    }

    fn open_existing(path: &Path) -> std::io::Result<File> {
        OpenOptions::new().read(true).write(true).open(path)
    }

    #[cfg(unix)]
    fn create_new(path: &Path) -> std::io::Result<File> {
        use std::os::unix::fs::OpenOptionsExt;

        OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(path)
    }

    #[cfg(not(unix))]
    fn create_new(path: &Path) -> std::io::Result<File> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
    }

    pub fn base(&self) -> *mut u8 {
        self.base
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether this handle created the backing file.
    pub fn created(&self) -> bool {
        self.created
    }

    pub fn remove_file(&self) -> bool {
        std::fs::remove_file(&self.path).is_ok()
    }
}
