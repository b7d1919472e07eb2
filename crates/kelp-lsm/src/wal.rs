//! Write-ahead log collaborator.
//!
//! The log itself lives outside this crate. When one is attached, every
//! batch written without `disable_wal` is appended before it reaches the
//! write buffer.

use crate::batch::WriteBatch;
use std::io;

pub trait WriteAheadLog: Send + Sync + 'static {
    /// Appends the batch durably. An error keeps the batch out of the
    /// write buffer.
    fn append(&self, batch: &WriteBatch) -> io::Result<()>;
}
