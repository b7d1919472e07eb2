/// Memtable flush under the space budget.
///
/// # Flush Protocol
/// 1. Freeze the active memtable; merge it with frozen memtables left by
///    earlier failed flushes
/// 2. Compute the exact encoded size of the table
/// 3. Reserve that many bytes; on denial abort, enter Error
/// 4. Write `NNNNNN.sst.tmp`, fsync, rename to `NNNNNN.sst`
/// 5. Commit the reservation with the on-disk size
/// 6. Install the table for reads, drop the flushed memtables
///
/// A flush reports success only after step 6. Any failure before that
/// deletes whatever file it created and leaves the frozen memtables in
/// place, so the data stays readable and the next flush retries it.
use crate::bg_error::{BackgroundErrorController, BackgroundErrorKind};
use crate::budget::{Reservation, SpaceBudgetEnforcer};
use crate::column_family::{merge_into, ColumnFamily};
use crate::error::{Error, FlushFailureReason, Result};
use crate::io::StorageIo;
use crate::memtable::{Memtable, MemtableEntry};
use crate::table::{self, TableEntry, TableFile};
use crate::tracker::TrackedFile;
use bytes::Bytes;
use kelp_observe::{obs_count, FlushEvt, FlushKind, Meter, VizEvent};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Borrows the engine's collaborators for the duration of one flush.
pub struct FlushCoordinator<'a> {
    pub io: &'a dyn StorageIo,
    pub enforcer: &'a SpaceBudgetEnforcer,
    pub errors: &'a BackgroundErrorController,
    pub meter: &'a dyn Meter,
    pub next_file_number: &'a AtomicU64,
    pub seqno: &'a AtomicU64,
}

impl FlushCoordinator<'_> {
    /// Flushes `cf`'s buffered writes into one new table file.
    ///
    /// Returns `Ok(None)` when there was nothing to flush.
    pub fn flush(&self, cf: &ColumnFamily) -> Result<Option<TrackedFile>> {
        self.errors.check_writable()?;

        let _flush_guard = cf.flush_lock().lock();

        let frozen = cf.freeze(self.seqno.load(Ordering::SeqCst));
        if frozen.is_empty() {
            return Ok(None);
        }

        let entries = merge_memtables(&frozen);
        let estimate = table::encoded_len(&entries);

        let reservation = match self.enforcer.try_reserve(estimate) {
            Ok(r) => r,
            Err(Error::SpaceLimit {
                requested,
                available,
                budget,
            }) => {
                let detail = format!(
                    "flush of column family {} needs {} bytes, {} available of {}",
                    cf.name(),
                    requested,
                    available,
                    budget
                );
                self.errors.set_error(
                    BackgroundErrorKind::SpaceLimitExceeded,
                    detail,
                    requested,
                );
                return Err(self.aborted(
                    cf,
                    FlushFailureReason::SpaceLimitExceeded {
                        requested,
                        available,
                    },
                ));
            }
            Err(e) => return Err(e),
        };

        let dir = match cf.tracker().select_path(estimate) {
            Some(dir) => dir,
            None => {
                reservation.release();
                return Err(Error::Internal(format!(
                    "column family {} has no storage path",
                    cf.name()
                )));
            }
        };
        let file_number = self.next_file_number.fetch_add(1, Ordering::SeqCst);

        let (final_path, actual_size) =
            match self.write_table(&dir, file_number, &entries) {
                Ok(written) => written,
                Err(e) => {
                    reservation.release();
                    let detail = format!(
                        "writing table {} for column family {}: {}",
                        file_number,
                        cf.name(),
                        e
                    );
                    self.errors
                        .set_error(BackgroundErrorKind::IoFailure, detail.clone(), 0);
                    return Err(self.aborted(cf, FlushFailureReason::IoFailure { detail }));
                }
            };

        let tracked = match self.commit(reservation, cf, &dir, file_number, actual_size) {
            Ok(tracked) => tracked,
            Err(e) => return Err(self.commit_failed(cf, file_number, &final_path, e)),
        };

        let entry_count = entries.len();
        cf.install_table(
            Arc::new(TableFile::new(file_number, &dir, actual_size, entries)),
            &frozen,
        );

        tracing::info!(
            "Flushed {} entries of column family {} to {} ({} bytes, estimated {})",
            entry_count,
            cf.name(),
            final_path.display(),
            actual_size,
            estimate
        );
        obs_count!(self.meter, "kelp_flush_total", &[], 1);
        self.meter.emit(VizEvent::Flush(FlushEvt {
            column_family: cf.name().to_string(),
            kind: FlushKind::Committed {
                file_number,
                bytes: actual_size,
                entries: entry_count,
            },
        }));

        Ok(Some(tracked))
    }

    /// Writes the table under a temporary name and renames it into place.
    /// Returns the final path and the on-disk size. On error no file is
    /// left behind.
    fn write_table(
        &self,
        dir: &Path,
        file_number: u64,
        entries: &[TableEntry],
    ) -> Result<(PathBuf, u64)> {
        let data = table::encode(entries)?;
        let tmp_path = dir.join(table::temp_file_name(file_number));
        let final_path = dir.join(table::table_file_name(file_number));

        let written = (|| -> std::io::Result<()> {
            let mut file = self.io.create_file(&tmp_path)?;
            file.write(&data)?;
            file.fsync()?;
            Ok(())
        })();
        if let Err(e) = written {
            self.remove_quietly(&tmp_path);
            return Err(e.into());
        }

        // A rename may move the file and then fail its directory sync
        if let Err(e) = self.io.rename(&tmp_path, &final_path) {
            self.remove_quietly(&tmp_path);
            self.remove_quietly(&final_path);
            return Err(e.into());
        }

        match self.io.file_size(&final_path) {
            Ok(size) => Ok((final_path, size)),
            Err(e) => {
                self.remove_quietly(&final_path);
                Err(e.into())
            }
        }
    }

    fn commit(
        &self,
        reservation: Reservation,
        cf: &ColumnFamily,
        dir: &Path,
        file_number: u64,
        actual_size: u64,
    ) -> Result<TrackedFile> {
        if reservation.is_expired() {
            let id = reservation.id();
            reservation.release();
            return Err(Error::ReservationExpired { id });
        }
        reservation.commit(cf.tracker(), dir, file_number, actual_size)
    }

    /// Removes the renamed file after a failed commit. Anything other than
    /// an expired reservation is an I/O-class failure and parks the engine.
    fn commit_failed(
        &self,
        cf: &ColumnFamily,
        file_number: u64,
        final_path: &Path,
        e: Error,
    ) -> Error {
        self.remove_quietly(final_path);
        let reason = match e {
            Error::ReservationExpired { .. } => FlushFailureReason::ReservationExpired,
            other => {
                let detail = format!(
                    "committing table {} for column family {}: {}",
                    file_number,
                    cf.name(),
                    other
                );
                self.errors
                    .set_error(BackgroundErrorKind::IoFailure, detail.clone(), 0);
                FlushFailureReason::IoFailure { detail }
            }
        };
        self.aborted(cf, reason)
    }

    fn remove_quietly(&self, path: &Path) {
        if self.io.exists(path) {
            if let Err(e) = self.io.delete(path) {
                tracing::warn!("Failed to remove {}: {}", path.display(), e);
            }
        }
    }

    fn aborted(&self, cf: &ColumnFamily, reason: FlushFailureReason) -> Error {
        tracing::warn!("Flush of column family {} aborted: {}", cf.name(), reason);
        obs_count!(self.meter, "kelp_flush_failed_total", &[], 1);
        let tag = match reason {
            FlushFailureReason::SpaceLimitExceeded { .. } => "space_limit",
            FlushFailureReason::IoFailure { .. } => "io",
            FlushFailureReason::ReservationExpired => "reservation_expired",
        };
        self.meter.emit(VizEvent::Flush(FlushEvt {
            column_family: cf.name().to_string(),
            kind: FlushKind::Aborted { reason: tag },
        }));
        Error::FlushFailed { reason }
    }
}

/// Merges frozen memtables (oldest first) into sorted table entries, one
/// per key, newest write wins.
fn merge_memtables(frozen: &[Arc<Memtable>]) -> Vec<TableEntry> {
    let mut merged: BTreeMap<Bytes, MemtableEntry> = BTreeMap::new();
    for mt in frozen {
        merge_into(&mut merged, mt.iter());
    }
    merged
        .into_iter()
        .map(|(key, entry)| entry.into_table_entry(key))
        .collect()
}
