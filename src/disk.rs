//! Filesystem access as seen by the build core.
//!
//! Everything that stats, reads, or mutates the disk goes through
//! `DiskInterface` so tests can substitute an in-memory filesystem.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::path::Path;

#[cfg(unix)]
use std::os::unix::fs::MetadataExt;

/// MTime info gathered for a file.  Missing ("file is absent") and Unknown
/// ("not stat'd yet") are distinct: a missing output dirties its edge, while
/// an unknown one just hasn't been visited.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum MTime {
    Unknown,
    Missing,
    Stamp(i64),
}

impl MTime {
    pub fn is_known(&self) -> bool {
        !matches!(self, MTime::Unknown)
    }

    pub fn exists(&self) -> bool {
        matches!(self, MTime::Stamp(_))
    }
}

/// Result of reading a file where absence is an expected, recoverable case
/// (depfiles in particular).
pub enum FileRead {
    Okay(Vec<u8>),
    NotFound,
}

pub trait DiskInterface {
    /// stat() an on-disk path, producing its MTime.  Absence is not an error.
    fn stat(&self, path: &str) -> anyhow::Result<MTime>;
    /// Create the directories containing path.
    fn make_dirs(&self, path: &str) -> anyhow::Result<()>;
    fn write_file(&self, path: &str, content: &str) -> anyhow::Result<()>;
    /// Remove a file; removing an absent file is not an error.
    fn remove_file(&self, path: &str) -> anyhow::Result<()>;
    fn read_file(&self, path: &str) -> anyhow::Result<FileRead>;
}

pub struct RealDisk {}

impl RealDisk {
    pub fn new() -> Self {
        RealDisk {}
    }
}

impl Default for RealDisk {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
fn metadata_mtime(meta: &std::fs::Metadata) -> i64 {
    meta.mtime() * 1_000_000_000 + meta.mtime_nsec()
}

#[cfg(not(unix))]
fn metadata_mtime(meta: &std::fs::Metadata) -> i64 {
    use std::time::UNIX_EPOCH;
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

impl DiskInterface for RealDisk {
    fn stat(&self, path: &str) -> anyhow::Result<MTime> {
        match std::fs::metadata(path) {
            Ok(meta) => Ok(MTime::Stamp(metadata_mtime(&meta))),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(MTime::Missing),
            Err(err) => Err(anyhow::anyhow!("stat {}: {}", path, err)),
        }
    }

    fn make_dirs(&self, path: &str) -> anyhow::Result<()> {
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|err| anyhow::anyhow!("mkdir {}: {}", parent.display(), err))?;
            }
        }
        Ok(())
    }

    fn write_file(&self, path: &str, content: &str) -> anyhow::Result<()> {
        std::fs::write(path, content).map_err(|err| anyhow::anyhow!("write {}: {}", path, err))
    }

    fn remove_file(&self, path: &str) -> anyhow::Result<()> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(anyhow::anyhow!("remove {}: {}", path, err)),
        }
    }

    fn read_file(&self, path: &str) -> anyhow::Result<FileRead> {
        match std::fs::read(path) {
            Ok(bytes) => Ok(FileRead::Okay(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(FileRead::NotFound),
            Err(err) => Err(anyhow::anyhow!("read {}: {}", path, err)),
        }
    }
}

struct VFile {
    content: Vec<u8>,
    mtime: i64,
}

/// Memory-backed DiskInterface with a logical clock for mtimes.  Every write
/// ticks the clock, so tests control "newer than" relationships by write
/// order (or explicitly via `set_mtime`).
pub struct VirtualDisk {
    files: RefCell<HashMap<String, VFile>>,
    dirs: RefCell<HashSet<String>>,
    clock: Cell<i64>,
}

impl VirtualDisk {
    pub fn new() -> Self {
        VirtualDisk {
            files: RefCell::new(HashMap::new()),
            dirs: RefCell::new(HashSet::new()),
            clock: Cell::new(0),
        }
    }

    fn tick(&self) -> i64 {
        let t = self.clock.get() + 1;
        self.clock.set(t);
        t
    }

    pub fn add_file(&self, path: &str, content: impl Into<Vec<u8>>) {
        let t = self.tick();
        self.files.borrow_mut().insert(
            path.to_string(),
            VFile {
                content: content.into(),
                mtime: t,
            },
        );
    }

    pub fn set_mtime(&self, path: &str, mtime: i64) {
        self.files
            .borrow_mut()
            .get_mut(path)
            .expect("set_mtime of absent file")
            .mtime = mtime;
        if mtime > self.clock.get() {
            self.clock.set(mtime);
        }
    }

    pub fn mtime(&self, path: &str) -> Option<i64> {
        self.files.borrow().get(path).map(|f| f.mtime)
    }

    pub fn exists(&self, path: &str) -> bool {
        self.files.borrow().contains_key(path)
    }

    pub fn contents(&self, path: &str) -> Option<Vec<u8>> {
        self.files.borrow().get(path).map(|f| f.content.clone())
    }

    pub fn made_dirs(&self) -> Vec<String> {
        let mut dirs: Vec<String> = self.dirs.borrow().iter().cloned().collect();
        dirs.sort();
        dirs
    }
}

impl Default for VirtualDisk {
    fn default() -> Self {
        Self::new()
    }
}

impl DiskInterface for VirtualDisk {
    fn stat(&self, path: &str) -> anyhow::Result<MTime> {
        Ok(match self.files.borrow().get(path) {
            Some(f) => MTime::Stamp(f.mtime),
            None => MTime::Missing,
        })
    }

    fn make_dirs(&self, path: &str) -> anyhow::Result<()> {
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                self.dirs
                    .borrow_mut()
                    .insert(parent.to_string_lossy().into_owned());
            }
        }
        Ok(())
    }

    fn write_file(&self, path: &str, content: &str) -> anyhow::Result<()> {
        self.add_file(path, content.as_bytes().to_vec());
        Ok(())
    }

    fn remove_file(&self, path: &str) -> anyhow::Result<()> {
        self.files.borrow_mut().remove(path);
        Ok(())
    }

    fn read_file(&self, path: &str) -> anyhow::Result<FileRead> {
        Ok(match self.files.borrow().get(path) {
            Some(f) => FileRead::Okay(f.content.clone()),
            None => FileRead::NotFound,
        })
    }
}
