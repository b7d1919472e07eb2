use crate::table::TableEntry;
use bytes::Bytes;
use crossbeam_skiplist::SkipMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Entry in the memtable representing a single key-value operation.
/// Each entry is tagged with a sequence number for ordering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemtableEntry {
    /// A put operation: key → value
    Put { value: Bytes, seqno: u64 },
    /// A delete operation (tombstone)
    Delete { seqno: u64 },
}

impl MemtableEntry {
    pub fn seqno(&self) -> u64 {
        match self {
            Self::Put { seqno, .. } | Self::Delete { seqno } => *seqno,
        }
    }

    /// The value, or `None` for a tombstone.
    pub fn value(&self) -> Option<Bytes> {
        match self {
            Self::Put { value, .. } => Some(value.clone()),
            Self::Delete { .. } => None,
        }
    }

    pub(crate) fn into_table_entry(self, key: Bytes) -> TableEntry {
        match self {
            Self::Put { value, seqno } => TableEntry {
                key,
                seqno,
                value: Some(value),
            },
            Self::Delete { seqno } => TableEntry {
                key,
                seqno,
                value: None,
            },
        }
    }
}

/// In-memory write buffer backed by a concurrent skiplist.
///
/// Holds applied-but-unflushed writes of one column family. A flush
/// freezes it and hands it to the flush coordinator; it is only dropped
/// once the table file holding its data is committed.
///
/// # Concurrency
/// Uses `crossbeam_skiplist::SkipMap` for lock-free concurrent reads and writes.
pub struct Memtable {
    data: SkipMap<Bytes, MemtableEntry>,

    /// Approximate size in bytes (keys + values + overhead)
    approx_size: AtomicUsize,

    min_seqno: u64,
    max_seqno: AtomicU64,
}

impl Memtable {
    /// Creates a new empty memtable starting at the given sequence number.
    pub fn new(min_seqno: u64) -> Self {
        Self {
            data: SkipMap::new(),
            approx_size: AtomicUsize::new(0),
            min_seqno,
            max_seqno: AtomicU64::new(min_seqno),
        }
    }

    /// Inserts a key-value pair. Returns the approximate size afterwards.
    pub fn put(&self, key: Bytes, value: Bytes, seqno: u64) -> usize {
        let entry_size = key.len() + value.len() + std::mem::size_of::<MemtableEntry>();
        self.insert(key, MemtableEntry::Put { value, seqno }, entry_size)
    }

    /// Deletes a key by inserting a tombstone.
    pub fn delete(&self, key: Bytes, seqno: u64) -> usize {
        let entry_size = key.len() + std::mem::size_of::<MemtableEntry>();
        self.insert(key, MemtableEntry::Delete { seqno }, entry_size)
    }

    fn insert(&self, key: Bytes, entry: MemtableEntry, entry_size: usize) -> usize {
        let seqno = entry.seqno();
        self.data.insert(key, entry);
        self.max_seqno.fetch_max(seqno, Ordering::Release);
        self.approx_size.fetch_add(entry_size, Ordering::Relaxed) + entry_size
    }

    /// Returns the most recent entry for the key. Tombstones are returned
    /// as-is; the caller interprets them.
    pub fn get(&self, key: &[u8]) -> Option<MemtableEntry> {
        self.data.get(key).map(|e| e.value().clone())
    }

    pub fn size(&self) -> usize {
        self.approx_size.load(Ordering::Relaxed)
    }

    pub fn min_seqno(&self) -> u64 {
        self.min_seqno
    }

    pub fn max_seqno(&self) -> u64 {
        self.max_seqno.load(Ordering::Acquire)
    }

    /// Returns an iterator over all entries in sorted key order.
    pub fn iter(&self) -> MemtableIterator<'_> {
        MemtableIterator {
            inner: self.data.iter(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }
}

/// Iterator over memtable entries in sorted key order.
pub struct MemtableIterator<'a> {
    inner: crossbeam_skiplist::map::Iter<'a, Bytes, MemtableEntry>,
}

impl<'a> Iterator for MemtableIterator<'a> {
    type Item = (Bytes, MemtableEntry);

    fn next(&mut self) -> Option<Self::Item> {
        self.inner
            .next()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
    }
}
