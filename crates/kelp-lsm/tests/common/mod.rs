//! Shared helpers for the integration tests.

#![allow(dead_code)]

use bytes::Bytes;
use kelp_lsm::{
    ColumnFamilyHandle, Engine, EngineConfig, EngineContext, LocalFs, StorageIo, WritableFile,
    WriteBatch, WriteOptions,
};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;
use tempfile::TempDir;

pub const MIB: u64 = 1024 * 1024;

/// Which storage operations fail. Flags can be flipped at any time.
#[derive(Default)]
pub struct Faults {
    pub fail_write: AtomicBool,
    pub fail_fsync: AtomicBool,
    pub fail_rename: AtomicBool,
    /// Rename moves the file, then the directory sync fails
    pub fail_dir_sync: AtomicBool,
    pub fail_file_size: AtomicBool,
    /// Milliseconds each write stalls before touching the file
    pub write_delay_ms: AtomicU64,
    pub files_created: AtomicUsize,
}

#[derive(Debug, Clone, Copy)]
pub enum Fault {
    Write,
    Fsync,
    Rename,
    DirSync,
    FileSize,
}

impl Faults {
    pub fn inject(&self, fault: Fault) {
        let flag = match fault {
            Fault::Write => &self.fail_write,
            Fault::Fsync => &self.fail_fsync,
            Fault::Rename => &self.fail_rename,
            Fault::DirSync => &self.fail_dir_sync,
            Fault::FileSize => &self.fail_file_size,
        };
        flag.store(true, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.fail_write.store(false, Ordering::SeqCst);
        self.fail_fsync.store(false, Ordering::SeqCst);
        self.fail_rename.store(false, Ordering::SeqCst);
        self.fail_dir_sync.store(false, Ordering::SeqCst);
        self.fail_file_size.store(false, Ordering::SeqCst);
        self.write_delay_ms.store(0, Ordering::SeqCst);
    }
}

fn injected(op: &str) -> io::Error {
    io::Error::new(io::ErrorKind::Other, format!("injected {} failure", op))
}

/// [`LocalFs`] with switchable failures.
#[derive(Clone, Default)]
pub struct FaultyIo {
    pub faults: Arc<Faults>,
}

struct FaultyFile {
    inner: Box<dyn WritableFile>,
    faults: Arc<Faults>,
}

impl WritableFile for FaultyFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<()> {
        let delay = self.faults.write_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            std::thread::sleep(Duration::from_millis(delay));
        }
        if self.faults.fail_write.load(Ordering::SeqCst) {
            // Leave a partial file behind, like a disk that fills mid-write
            self.inner.write(&buf[..buf.len() / 2])?;
            return Err(injected("write"));
        }
        self.inner.write(buf)
    }

    fn fsync(&mut self) -> io::Result<()> {
        if self.faults.fail_fsync.load(Ordering::SeqCst) {
            return Err(injected("fsync"));
        }
        self.inner.fsync()
    }
}

impl StorageIo for FaultyIo {
    fn create_file(&self, path: &Path) -> io::Result<Box<dyn WritableFile>> {
        self.faults.files_created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FaultyFile {
            inner: LocalFs.create_file(path)?,
            faults: Arc::clone(&self.faults),
        }))
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        if self.faults.fail_rename.load(Ordering::SeqCst) {
            return Err(injected("rename"));
        }
        if self.faults.fail_dir_sync.load(Ordering::SeqCst) {
            std::fs::rename(from, to)?;
            return Err(injected("directory sync"));
        }
        LocalFs.rename(from, to)
    }

    fn delete(&self, path: &Path) -> io::Result<()> {
        LocalFs.delete(path)
    }

    fn file_size(&self, path: &Path) -> io::Result<u64> {
        if self.faults.fail_file_size.load(Ordering::SeqCst) {
            return Err(injected("stat"));
        }
        LocalFs.file_size(path)
    }

    fn read_file(&self, path: &Path) -> io::Result<Vec<u8>> {
        LocalFs.read_file(path)
    }

    fn list_dir(&self, dir: &Path) -> io::Result<Vec<PathBuf>> {
        LocalFs.list_dir(dir)
    }

    fn create_dir_all(&self, dir: &Path) -> io::Result<()> {
        LocalFs.create_dir_all(dir)
    }

    fn exists(&self, path: &Path) -> bool {
        LocalFs.exists(path)
    }
}

static INIT: Once = Once::new();

/// Routes engine logs to the test output; filter with `RUST_LOG`.
pub fn init_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub fn config(dir: &TempDir, budget: u64) -> EngineConfig {
    init_tracing();
    let mut config = EngineConfig::with_column_families([("default", dir.path().join("default"))]);
    config.max_allowed_space = budget;
    config
}

pub fn open(dir: &TempDir, budget: u64) -> (Engine, ColumnFamilyHandle) {
    let engine = Engine::open(config(dir, budget)).unwrap();
    let cf = engine.cf_handle("default").unwrap();
    (engine, cf)
}

pub fn open_faulty(dir: &TempDir, budget: u64) -> (Engine, ColumnFamilyHandle, Arc<Faults>) {
    open_faulty_with(config(dir, budget))
}

pub fn open_faulty_with(config: EngineConfig) -> (Engine, ColumnFamilyHandle, Arc<Faults>) {
    let io = FaultyIo::default();
    let faults = Arc::clone(&io.faults);
    let ctx = EngineContext {
        io: Arc::new(io),
        ..Default::default()
    };
    let engine = Engine::open_with(config, ctx).unwrap();
    let cf = engine.cf_handle("default").unwrap();
    (engine, cf, faults)
}

/// Writes `count` keys of `value_len` bytes each, prefixed with `prefix`.
pub fn write_keys(
    engine: &Engine,
    cf: &ColumnFamilyHandle,
    prefix: &str,
    count: usize,
    value_len: usize,
) {
    let value = Bytes::from(vec![b'v'; value_len]);
    let mut batch = WriteBatch::new();
    for i in 0..count {
        batch.put(cf, format!("{}-{:06}", prefix, i), value.clone());
        if batch.len() == 64 {
            engine.put(&batch, &WriteOptions::default()).unwrap();
            batch.clear();
        }
    }
    if !batch.is_empty() {
        engine.put(&batch, &WriteOptions::default()).unwrap();
    }
}

/// Roughly 1.2 MiB of payload.
pub fn write_1_2_mib(engine: &Engine, cf: &ColumnFamilyHandle, prefix: &str) {
    write_keys(engine, cf, prefix, 1200, 1024);
}

/// Names of all files in `dir`, sorted.
pub fn list_files(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

/// Sum of on-disk sizes of the `.sst` files in `dir`.
pub fn sst_bytes_on_disk(dir: &Path) -> u64 {
    std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap())
        .filter(|e| e.file_name().to_string_lossy().ends_with(".sst"))
        .map(|e| e.metadata().unwrap().len())
        .sum()
}
