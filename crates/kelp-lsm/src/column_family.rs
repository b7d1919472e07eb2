/// Column family state: write buffers, committed tables and the space
/// tracker of its storage paths.
///
/// # Read Path
/// 1. Active memtable
/// 2. Frozen memtables waiting for (or retrying) a flush, newest first
/// 3. Committed tables, newest first
///
/// Locks are always taken in the order active → frozen → tables, by
/// readers and writers alike.
use crate::config::{ColumnFamilyDescriptor, StoragePathConfig};
use crate::error::Result;
use crate::memtable::{Memtable, MemtableEntry};
use crate::table::TableFile;
use crate::tracker::PathSpaceTracker;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Caller-facing reference to a column family of one engine instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ColumnFamilyHandle {
    engine_id: u64,
    id: u32,
    name: String,
}

impl ColumnFamilyHandle {
    pub(crate) fn new(engine_id: u64, id: u32, name: impl Into<String>) -> Self {
        Self {
            engine_id,
            id,
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub(crate) fn engine_id(&self) -> u64 {
        self.engine_id
    }
}

pub struct ColumnFamily {
    handle: ColumnFamilyHandle,
    paths: Vec<StoragePathConfig>,
    tracker: Arc<PathSpaceTracker>,

    /// Active memtable for writes
    memtable: RwLock<Memtable>,

    /// Frozen memtables, oldest first. Dropped only once their data is in
    /// a committed table.
    immutables: RwLock<Vec<Arc<Memtable>>>,

    /// Committed tables, newest first
    tables: RwLock<Vec<Arc<TableFile>>>,

    /// Serializes flushes of this column family
    flush_lock: Mutex<()>,
}

impl ColumnFamily {
    pub(crate) fn new(
        handle: ColumnFamilyHandle,
        descriptor: &ColumnFamilyDescriptor,
        seqno: u64,
    ) -> Result<Self> {
        let tracker = PathSpaceTracker::new();
        for p in &descriptor.paths {
            tracker.register(&p.path, p.target_size)?;
        }

        Ok(Self {
            handle,
            paths: descriptor.paths.clone(),
            tracker: Arc::new(tracker),
            memtable: RwLock::new(Memtable::new(seqno)),
            immutables: RwLock::new(Vec::new()),
            tables: RwLock::new(Vec::new()),
            flush_lock: Mutex::new(()),
        })
    }

    pub fn handle(&self) -> &ColumnFamilyHandle {
        &self.handle
    }

    pub fn name(&self) -> &str {
        self.handle.name()
    }

    pub fn paths(&self) -> &[StoragePathConfig] {
        &self.paths
    }

    pub fn tracker(&self) -> &Arc<PathSpaceTracker> {
        &self.tracker
    }

    pub(crate) fn flush_lock(&self) -> &Mutex<()> {
        &self.flush_lock
    }

    /// Returns the approximate size of the active memtable afterwards.
    pub(crate) fn apply_put(&self, key: Bytes, value: Bytes, seqno: u64) -> usize {
        self.memtable.read().put(key, value, seqno)
    }

    pub(crate) fn apply_delete(&self, key: Bytes, seqno: u64) -> usize {
        self.memtable.read().delete(key, seqno)
    }

    /// Newest visible value for `key`; tombstones read as `None`.
    pub fn get(&self, key: &[u8]) -> Option<Bytes> {
        let memtable = self.memtable.read();
        if let Some(entry) = memtable.get(key) {
            return entry.value();
        }

        let immutables = self.immutables.read();
        for mt in immutables.iter().rev() {
            if let Some(entry) = mt.get(key) {
                return entry.value();
            }
        }

        let tables = self.tables.read();
        for table in tables.iter() {
            if let Some(entry) = table.get(key) {
                return entry.value.clone();
            }
        }
        None
    }

    /// Moves the active memtable to the frozen list and returns everything
    /// frozen, oldest first. An empty active memtable is left in place.
    pub(crate) fn freeze(&self, next_seqno: u64) -> Vec<Arc<Memtable>> {
        let mut memtable = self.memtable.write();
        let mut immutables = self.immutables.write();
        if !memtable.is_empty() {
            let frozen = std::mem::replace(&mut *memtable, Memtable::new(next_seqno));
            immutables.push(Arc::new(frozen));
        }
        immutables.clone()
    }

    /// Makes a committed table visible and drops the memtables it holds.
    /// Both happen under the same locks so readers never see a gap.
    pub(crate) fn install_table(&self, table: Arc<TableFile>, flushed: &[Arc<Memtable>]) {
        let mut immutables = self.immutables.write();
        let mut tables = self.tables.write();
        tables.insert(0, table);
        immutables.retain(|mt| !flushed.iter().any(|f| Arc::ptr_eq(f, mt)));
    }

    /// Adds a table found on disk at open. Tables must arrive oldest first.
    pub(crate) fn load_table(&self, table: Arc<TableFile>) {
        self.tables.write().insert(0, table);
    }

    pub(crate) fn remove_table(&self, file_number: u64) -> Option<Arc<TableFile>> {
        let mut tables = self.tables.write();
        let pos = tables.iter().position(|t| t.file_number == file_number)?;
        Some(tables.remove(pos))
    }

    /// Committed tables, newest first.
    pub fn tables(&self) -> Vec<Arc<TableFile>> {
        self.tables.read().clone()
    }

    /// Unflushed content as the reader sees it: one entry per key, newest
    /// write wins, tombstones as `None`.
    pub fn buffered_entries(&self) -> Vec<(Bytes, Option<Bytes>)> {
        let memtable = self.memtable.read();
        let immutables = self.immutables.read();

        let mut merged: BTreeMap<Bytes, MemtableEntry> = BTreeMap::new();
        for mt in immutables.iter() {
            merge_into(&mut merged, mt.iter());
        }
        merge_into(&mut merged, memtable.iter());

        merged.into_iter().map(|(k, e)| (k, e.value())).collect()
    }

    /// Approximate bytes held by the active and frozen memtables.
    pub fn buffered_bytes(&self) -> usize {
        let memtable = self.memtable.read();
        let immutables = self.immutables.read();
        memtable.size() + immutables.iter().map(|mt| mt.size()).sum::<usize>()
    }

    pub fn active_bytes(&self) -> usize {
        self.memtable.read().size()
    }
}

/// Folds entries into `merged`, keeping the one with the higher seqno.
pub(crate) fn merge_into(
    merged: &mut BTreeMap<Bytes, MemtableEntry>,
    entries: impl Iterator<Item = (Bytes, MemtableEntry)>,
) {
    for (key, entry) in entries {
        match merged.get(&key) {
            Some(existing) if existing.seqno() > entry.seqno() => {}
            _ => {
                merged.insert(key, entry);
            }
        }
    }
}
