/// Per-column-family accounting of committed table files.
///
/// A tracker owns the ordered list of storage directories of one column
/// family and the byte size of every committed table file in each of them.
/// The first registered path is the primary one.
///
/// All mutations happen under one lock, so `total()` never observes a
/// half-applied `record`/`release`.
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// A committed table file contributing to a storage path's size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedFile {
    pub path: PathBuf,
    pub file_number: u64,
    pub size: u64,
}

/// Point-in-time view of one registered storage path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoragePathUsage {
    pub path: PathBuf,
    /// Advisory cap; 0 means unset
    pub target_size: u64,
    pub size: u64,
    pub file_count: usize,
}

#[derive(Debug)]
struct StoragePath {
    path: PathBuf,
    target_size: u64,
    size: u64,
    files: BTreeMap<u64, u64>,
}

#[derive(Debug, Default)]
struct TrackerState {
    paths: Vec<StoragePath>,
    total: u64,
}

impl TrackerState {
    fn path_mut(&mut self, path: &Path) -> Result<&mut StoragePath> {
        self.paths
            .iter_mut()
            .find(|p| p.path == path)
            .ok_or_else(|| Error::UnknownPath(path.to_path_buf()))
    }
}

#[derive(Debug, Default)]
pub struct PathSpaceTracker {
    state: Mutex<TrackerState>,
}

impl PathSpaceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a storage path with zero tracked size.
    pub fn register(&self, path: impl Into<PathBuf>, target_size: u64) -> Result<()> {
        let path = path.into();
        let mut state = self.state.lock();
        if state.paths.iter().any(|p| p.path == path) {
            return Err(Error::Config(format!(
                "storage path registered twice: {}",
                path.display()
            )));
        }
        state.paths.push(StoragePath {
            path,
            target_size,
            size: 0,
            files: BTreeMap::new(),
        });
        Ok(())
    }

    /// Records a committed file under `path`.
    pub fn record(&self, path: &Path, file_number: u64, size: u64) -> Result<TrackedFile> {
        let mut state = self.state.lock();
        let entry = state.path_mut(path)?;
        if entry.files.contains_key(&file_number) {
            return Err(Error::Internal(format!(
                "table file {} already tracked under {}",
                file_number,
                path.display()
            )));
        }
        entry.files.insert(file_number, size);
        entry.size += size;
        state.total += size;

        Ok(TrackedFile {
            path: path.to_path_buf(),
            file_number,
            size,
        })
    }

    /// Removes a file from `path`. Returns its size, or `None` if the file
    /// was not tracked.
    pub fn release(&self, path: &Path, file_number: u64) -> Result<Option<u64>> {
        let mut state = self.state.lock();
        let entry = state.path_mut(path)?;
        let Some(size) = entry.files.remove(&file_number) else {
            return Ok(None);
        };
        entry.size -= size;
        state.total -= size;
        Ok(Some(size))
    }

    /// Current byte sum across all paths.
    pub fn total(&self) -> u64 {
        self.state.lock().total
    }

    pub fn path_total(&self, path: &Path) -> Result<u64> {
        let mut state = self.state.lock();
        Ok(state.path_mut(path)?.size)
    }

    /// Finds which path holds `file_number`.
    pub fn locate(&self, file_number: u64) -> Option<TrackedFile> {
        let state = self.state.lock();
        state.paths.iter().find_map(|p| {
            p.files.get(&file_number).map(|&size| TrackedFile {
                path: p.path.clone(),
                file_number,
                size,
            })
        })
    }

    /// Picks the directory for a new table of roughly `estimated` bytes.
    ///
    /// The first path whose size plus the estimate stays within its target
    /// wins; a zero target never fills up. When every path is full the last
    /// one takes the overflow. Returns `None` only if nothing is registered.
    pub fn select_path(&self, estimated: u64) -> Option<PathBuf> {
        let state = self.state.lock();
        state
            .paths
            .iter()
            .find(|p| p.target_size == 0 || p.size.saturating_add(estimated) <= p.target_size)
            .or_else(|| state.paths.last())
            .map(|p| p.path.clone())
    }

    pub fn paths(&self) -> Vec<StoragePathUsage> {
        self.state
            .lock()
            .paths
            .iter()
            .map(|p| StoragePathUsage {
                path: p.path.clone(),
                target_size: p.target_size,
                size: p.size,
                file_count: p.files.len(),
            })
            .collect()
    }

    /// All committed files, ordered by path then file number.
    pub fn files(&self) -> Vec<TrackedFile> {
        let state = self.state.lock();
        state
            .paths
            .iter()
            .flat_map(|p| {
                p.files.iter().map(move |(&file_number, &size)| TrackedFile {
                    path: p.path.clone(),
                    file_number,
                    size,
                })
            })
            .collect()
    }
}
