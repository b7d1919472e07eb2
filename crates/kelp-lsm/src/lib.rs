//! kelp-lsm: space-budgeted write path for a log-structured key-value engine.
//!
//! Tracks the on-disk footprint of every table file, gates new flush and
//! compaction output against an operator-set budget, and parks the engine
//! in a sticky background-error state when the budget is breached or table
//! I/O fails. `resume()` re-checks space once and either clears the error or
//! fails; it never waits or loops.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  Engine                                                      │
//! │  put / get / flush / resume / set_max_allowed_space_usage    │
//! └───────┬───────────────────────┬──────────────────────────────┘
//!         │ write                 │ flush
//!         ↓                       ↓
//! ┌───────────────────┐   ┌──────────────────────────────────────┐
//! │  ColumnFamily     │   │  FlushCoordinator                    │
//! │  memtable (skip-  │──→│  reserve → write tmp → fsync →       │
//! │  list) + frozen   │   │  rename → commit → install           │
//! │  + tables         │   └───────┬───────────────────┬──────────┘
//! └───────────────────┘           │                   │ denial / I/O
//!                                 ↓                   ↓
//! ┌──────────────────────────────────────┐  ┌───────────────────────┐
//! │  SpaceBudgetEnforcer                 │  │  BackgroundError-     │
//! │  total, pending, budget (one mutex)  │←─│  Controller           │
//! │  ├── PathSpaceTracker (cf "default") │  │  Normal ⇄ Error       │
//! │  └── PathSpaceTracker (cf ...)       │  └───────────────────────┘
//! └──────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use kelp_lsm::{Engine, EngineConfig, WriteBatch, WriteOptions};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut config = EngineConfig::with_column_families([("default", "/var/lib/kelp/default")]);
//!     config.max_allowed_space = 2 * 1024 * 1024;
//!     let engine = Engine::open(config)?;
//!     let cf = engine.cf_handle("default").ok_or("missing column family")?;
//!
//!     let mut batch = WriteBatch::new();
//!     batch.put(&cf, "key", "value");
//!     engine.put(&batch, &WriteOptions::default())?;
//!
//!     if let Err(e) = engine.flush(&cf) {
//!         eprintln!("flush failed: {}", e);
//!         engine.set_max_allowed_space_usage(20 * 1024 * 1024);
//!         engine.resume()?;
//!         engine.flush(&cf)?;
//!     }
//!
//!     assert_eq!(engine.get(&cf, b"key")?.as_deref(), Some(&b"value"[..]));
//!     Ok(())
//! }
//! ```

pub mod batch;
pub mod bg_error;
pub mod budget;
pub mod column_family;
pub mod config;
pub mod error;
pub mod flush;
pub mod io;
pub mod memtable;
pub mod retry;
pub mod table;
pub mod tracker;
pub mod wal;

pub use batch::{BatchOp, WriteBatch};
pub use bg_error::{BackgroundErrorController, BackgroundErrorKind, BackgroundErrorState};
pub use budget::{Reservation, SpaceBudgetEnforcer, SpaceUsage};
pub use column_family::ColumnFamilyHandle;
pub use config::{
    ColumnFamilyDescriptor, EngineConfig, MemtableConfig, StoragePathConfig, WriteOptions,
    DEFAULT_COLUMN_FAMILY_NAME,
};
pub use error::{Error, FlushFailureReason, Result};
pub use io::{LocalFs, StorageIo, WritableFile};
pub use tracker::{PathSpaceTracker, StoragePathUsage, TrackedFile};
pub use wal::WriteAheadLog;

// Re-export commonly used types
pub use bytes::Bytes;
pub use kelp_observe::{Meter, NoopMeter};

use column_family::ColumnFamily;
use flush::FlushCoordinator;
use kelp_observe::{FlushEvt, FlushKind, SpaceEvt, SpaceKind, VizEvent};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use table::{TableEntry, TableFile};

static NEXT_ENGINE_ID: AtomicU64 = AtomicU64::new(1);

/// Collaborators an engine is opened with.
#[derive(Clone)]
pub struct EngineContext {
    pub io: Arc<dyn StorageIo>,
    pub meter: Arc<dyn Meter>,
    pub wal: Option<Arc<dyn WriteAheadLog>>,
}

impl Default for EngineContext {
    fn default() -> Self {
        Self {
            io: Arc::new(LocalFs),
            meter: Arc::new(NoopMeter),
            wal: None,
        }
    }
}

/// A table found on disk while opening.
struct RecoveredTable {
    dir: PathBuf,
    file_number: u64,
    size: u64,
    entries: Vec<TableEntry>,
}

/// Storage engine facade.
///
/// Owns its budget enforcer and error controller; two engines in one
/// process share nothing.
pub struct Engine {
    id: u64,

    /// Configuration
    config: EngineConfig,

    /// Column families in descriptor order; a handle's id is its index
    column_families: Vec<Arc<ColumnFamily>>,

    enforcer: SpaceBudgetEnforcer,
    errors: BackgroundErrorController,

    io: Arc<dyn StorageIo>,
    wal: Option<Arc<dyn WriteAheadLog>>,
    meter: Arc<dyn Meter>,

    /// Next table file number, shared by all column families
    next_file_number: AtomicU64,

    /// Next sequence number for writes
    seqno: AtomicU64,
}

impl Engine {
    /// Opens an engine on the local filesystem without a write-ahead log.
    pub fn open(config: EngineConfig) -> Result<Self> {
        Self::open_with(config, EngineContext::default())
    }

    /// Opens an engine with explicit collaborators.
    ///
    /// # Steps
    /// 1. Validate the configuration
    /// 2. Create (or require) every storage directory
    /// 3. Delete leftover `*.sst.tmp` files, load `*.sst` files
    /// 4. Record loaded files in the column family's tracker and hand the
    ///    trackers to the enforcer
    /// 5. Resume file and sequence numbers after the largest found
    pub fn open_with(config: EngineConfig, ctx: EngineContext) -> Result<Self> {
        config.validate()?;
        let EngineContext { io, meter, wal } = ctx;

        for cf in &config.column_families {
            for p in &cf.paths {
                if io.exists(&p.path) {
                    continue;
                }
                if !config.create_if_missing {
                    return Err(Error::Config(format!(
                        "storage path {} does not exist",
                        p.path.display()
                    )));
                }
                io.create_dir_all(&p.path)?;
            }
        }

        let mut recovered = Vec::with_capacity(config.column_families.len());
        let mut max_file_number = 0;
        let mut max_seqno = 0;
        for cf in &config.column_families {
            let mut tables = Vec::new();
            for p in &cf.paths {
                tables.extend(recover_dir(io.as_ref(), &p.path)?);
            }
            tables.sort_by_key(|t| t.file_number);
            for t in &tables {
                max_file_number = max_file_number.max(t.file_number);
                max_seqno = max_seqno.max(t.entries.iter().map(|e| e.seqno).max().unwrap_or(0));
            }
            recovered.push(tables);
        }
        let next_seqno = max_seqno + 1;

        let id = NEXT_ENGINE_ID.fetch_add(1, Ordering::Relaxed);
        let enforcer = SpaceBudgetEnforcer::with_meter(
            config.max_allowed_space,
            config.reservation_timeout(),
            Arc::clone(&meter),
        );

        let mut column_families = Vec::with_capacity(config.column_families.len());
        for (idx, (desc, tables)) in config.column_families.iter().zip(recovered).enumerate() {
            let handle = ColumnFamilyHandle::new(id, idx as u32, desc.name.clone());
            let cf = ColumnFamily::new(handle, desc, next_seqno)?;

            let mut bytes = 0;
            let count = tables.len();
            for t in tables {
                cf.tracker().record(&t.dir, t.file_number, t.size)?;
                bytes += t.size;
                cf.load_table(Arc::new(TableFile::new(
                    t.file_number,
                    &t.dir,
                    t.size,
                    t.entries,
                )));
            }
            if count > 0 {
                tracing::info!(
                    "Recovered {} table files ({} bytes) for column family {}",
                    count,
                    bytes,
                    desc.name
                );
            }

            enforcer.add_tracker(Arc::clone(cf.tracker()));
            column_families.push(Arc::new(cf));
        }

        tracing::info!(
            "Opened engine {} with {} column families, {} bytes on disk, budget {}",
            id,
            column_families.len(),
            enforcer.get_total_size(),
            config.max_allowed_space
        );

        Ok(Self {
            id,
            errors: BackgroundErrorController::new(Arc::clone(&meter)),
            config,
            column_families,
            enforcer,
            io,
            wal,
            meter,
            next_file_number: AtomicU64::new(max_file_number + 1),
            seqno: AtomicU64::new(next_seqno),
        })
    }

    /// Applies a batch to the write buffers.
    ///
    /// Refused with [`Error::BackgroundError`] while in Error. Every handle
    /// is resolved and the write-ahead log appended (unless disabled) before
    /// any entry is applied, so a rejected batch leaves no trace.
    ///
    /// A column family whose buffer crosses `memtable.flush_trigger_bytes`
    /// is flushed before returning. A failure there does not fail this
    /// write; it is logged and leaves the engine in Error.
    pub fn put(&self, batch: &WriteBatch, options: &WriteOptions) -> Result<()> {
        self.errors.check_writable()?;
        if batch.is_empty() {
            return Ok(());
        }

        let targets = batch
            .ops()
            .iter()
            .map(|op| self.column_family(op.column_family()))
            .collect::<Result<Vec<_>>>()?;

        if let Some(wal) = self.wal.as_ref().filter(|_| !options.disable_wal) {
            wal.append(batch)
                .map_err(|e| Error::Write(format!("write-ahead log append failed: {}", e)))?;
        }

        let trigger = self.config.memtable.flush_trigger_bytes;
        let mut to_flush: Vec<&Arc<ColumnFamily>> = Vec::new();
        for (op, cf) in batch.ops().iter().zip(targets) {
            let seqno = self.seqno.fetch_add(1, Ordering::SeqCst);
            let size = match op {
                BatchOp::Put { key, value, .. } => cf.apply_put(key.clone(), value.clone(), seqno),
                BatchOp::Delete { key, .. } => cf.apply_delete(key.clone(), seqno),
            };
            if trigger > 0 && size >= trigger && !to_flush.iter().any(|c| Arc::ptr_eq(*c, cf)) {
                to_flush.push(cf);
            }
        }

        for cf in to_flush {
            self.meter.emit(VizEvent::Flush(FlushEvt {
                column_family: cf.name().to_string(),
                kind: FlushKind::Triggered {
                    buffer_bytes: cf.active_bytes(),
                },
            }));
            if let Err(e) = self.flush_column_family(cf) {
                tracing::warn!(
                    "Automatic flush of column family {} failed: {}",
                    cf.name(),
                    e
                );
            }
        }
        Ok(())
    }

    /// Newest value for `key`, `None` on a miss. Allowed in Error.
    pub fn get(&self, cf: &ColumnFamilyHandle, key: &[u8]) -> Result<Option<Bytes>> {
        Ok(self.column_family(cf)?.get(key))
    }

    /// Writes the column family's buffer to a new table file.
    ///
    /// `Ok(Some(file))` means the file is durable, visible and counted in
    /// the total size. `Ok(None)` means the buffer was empty. On error no
    /// new file exists and the buffer is unchanged.
    pub fn flush(&self, cf: &ColumnFamilyHandle) -> Result<Option<TrackedFile>> {
        let cf = self.column_family(cf)?;
        self.flush_column_family(cf)
    }

    fn flush_column_family(&self, cf: &ColumnFamily) -> Result<Option<TrackedFile>> {
        FlushCoordinator {
            io: self.io.as_ref(),
            enforcer: &self.enforcer,
            errors: &self.errors,
            meter: self.meter.as_ref(),
            next_file_number: &self.next_file_number,
            seqno: &self.seqno,
        }
        .flush(cf)
    }

    /// Re-checks space once; clears the error on success. A no-op in Normal.
    pub fn resume(&self) -> Result<()> {
        self.errors.resume(&self.enforcer)
    }

    /// Sets the budget in bytes; 0 disables enforcement.
    pub fn set_max_allowed_space_usage(&self, bytes: u64) {
        self.enforcer.set_max_allowed_space(bytes);
    }

    pub fn get_total_size(&self) -> u64 {
        self.enforcer.get_total_size()
    }

    pub fn is_max_allowed_space_reached(&self) -> bool {
        self.enforcer.is_max_allowed_space_reached()
    }

    pub fn is_max_allowed_space_reached_including_compactions(&self) -> bool {
        self.enforcer.is_max_allowed_space_reached_including_compactions()
    }

    pub fn space_usage(&self) -> SpaceUsage {
        self.enforcer.usage()
    }

    /// Claims budget for compaction output of `estimated_bytes`.
    ///
    /// A denial puts the engine in Error like a denied flush does.
    pub fn reserve_compaction(&self, estimated_bytes: u64) -> Result<Reservation> {
        self.errors.check_writable()?;
        match self.enforcer.try_reserve(estimated_bytes) {
            Err(Error::SpaceLimit {
                requested,
                available,
                budget,
            }) => {
                self.errors.set_error(
                    BackgroundErrorKind::SpaceLimitExceeded,
                    format!(
                        "compaction output of {} bytes does not fit, {} available of {}",
                        requested, available, budget
                    ),
                    requested,
                );
                Err(Error::SpaceLimit {
                    requested,
                    available,
                    budget,
                })
            }
            other => other,
        }
    }

    /// Allocates a file number for externally written table output.
    pub fn new_file_number(&self) -> u64 {
        self.next_file_number.fetch_add(1, Ordering::SeqCst)
    }

    /// Registers a table file that a compactor wrote to `dir` under its
    /// final name, committing `reservation` with the file's on-disk size.
    ///
    /// The file becomes readable as the newest table of the column family.
    /// Inputs it replaces are removed afterwards with
    /// [`Engine::delete_obsolete_file`].
    pub fn commit_compaction_output(
        &self,
        cf: &ColumnFamilyHandle,
        reservation: Reservation,
        dir: &Path,
        file_number: u64,
    ) -> Result<TrackedFile> {
        let cf = self.column_family(cf)?;
        let path = dir.join(table::table_file_name(file_number));

        let loaded = self
            .io
            .file_size(&path)
            .and_then(|size| self.io.read_file(&path).map(|data| (size, data)));
        let (size, data) = match loaded {
            Ok(loaded) => loaded,
            Err(e) => {
                reservation.release();
                let detail = format!("reading compaction output {}: {}", path.display(), e);
                self.errors
                    .set_error(BackgroundErrorKind::IoFailure, detail.clone(), 0);
                return Err(Error::Io(std::io::Error::new(e.kind(), detail)));
            }
        };
        let entries = table::decode(&data)?;

        let tracked = reservation.commit(cf.tracker(), dir, file_number, size)?;
        cf.load_table(Arc::new(TableFile::new(file_number, dir, size, entries)));
        tracing::info!(
            "Committed compaction output {} ({} bytes) for column family {}",
            path.display(),
            size,
            cf.name()
        );
        Ok(tracked)
    }

    /// Deletes a committed table file and releases its bytes.
    ///
    /// Returns the number of bytes released.
    pub fn delete_obsolete_file(&self, cf: &ColumnFamilyHandle, file_number: u64) -> Result<u64> {
        let cf = self.column_family(cf)?;
        let tracked = cf.tracker().locate(file_number).ok_or_else(|| {
            Error::Internal(format!(
                "file {} is not tracked by column family {}",
                file_number,
                cf.name()
            ))
        })?;

        let path = tracked.path.join(table::table_file_name(file_number));
        self.io.delete(&path)?;
        cf.remove_table(file_number);
        let released = self
            .enforcer
            .release_file(cf.tracker(), &tracked.path, file_number)?
            .unwrap_or(0);

        tracing::info!("Deleted obsolete table {} ({} bytes)", path.display(), released);
        self.meter.emit(VizEvent::Space(SpaceEvt {
            kind: SpaceKind::FileReleased {
                file_number,
                bytes: released,
            },
        }));
        Ok(released)
    }

    /// Snapshot of the background error state.
    pub fn background_error(&self) -> BackgroundErrorState {
        self.errors.state()
    }

    /// Handles in configuration order.
    pub fn column_families(&self) -> Vec<ColumnFamilyHandle> {
        self.column_families
            .iter()
            .map(|cf| cf.handle().clone())
            .collect()
    }

    pub fn cf_handle(&self, name: &str) -> Option<ColumnFamilyHandle> {
        self.column_families
            .iter()
            .find(|cf| cf.name() == name)
            .map(|cf| cf.handle().clone())
    }

    /// Unflushed content of a column family: one entry per key, newest
    /// write wins, deletes as `None`.
    pub fn buffered_entries(&self, cf: &ColumnFamilyHandle) -> Result<Vec<(Bytes, Option<Bytes>)>> {
        Ok(self.column_family(cf)?.buffered_entries())
    }

    /// Committed table files of a column family.
    pub fn table_files(&self, cf: &ColumnFamilyHandle) -> Result<Vec<TrackedFile>> {
        Ok(self.column_family(cf)?.tracker().files())
    }

    /// Per-path usage of a column family.
    pub fn path_usage(&self, cf: &ColumnFamilyHandle) -> Result<Vec<StoragePathUsage>> {
        Ok(self.column_family(cf)?.tracker().paths())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Closes the engine. Unflushed writes are lost unless a write-ahead
    /// log holds them.
    pub fn close(self) {
        let buffered: usize = self
            .column_families
            .iter()
            .map(|cf| cf.buffered_bytes())
            .sum();
        tracing::info!(
            "Closing engine {} ({} bytes on disk, {} bytes unflushed)",
            self.id,
            self.enforcer.get_total_size(),
            buffered
        );
    }

    fn column_family(&self, handle: &ColumnFamilyHandle) -> Result<&Arc<ColumnFamily>> {
        if handle.engine_id() != self.id {
            return Err(Error::UnknownColumnFamily(handle.name().to_string()));
        }
        self.column_families
            .get(handle.id() as usize)
            .filter(|cf| cf.name() == handle.name())
            .ok_or_else(|| Error::UnknownColumnFamily(handle.name().to_string()))
    }
}

/// Cleans up and loads one storage directory.
fn recover_dir(io: &dyn StorageIo, dir: &Path) -> Result<Vec<RecoveredTable>> {
    let mut tables = Vec::new();
    for path in io.list_dir(dir)? {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if table::is_temp_file_name(name) {
            tracing::warn!("Removing incomplete table file {}", path.display());
            io.delete(&path)?;
            continue;
        }
        let Some(file_number) = table::parse_table_file_name(name) else {
            continue;
        };
        let size = io.file_size(&path)?;
        let entries = table::decode(&io.read_file(&path)?)
            .map_err(|e| Error::Corruption(format!("{}: {}", path.display(), e)))?;
        tables.push(RecoveredTable {
            dir: dir.to_path_buf(),
            file_number,
            size,
            entries,
        });
    }
    Ok(tables)
}
