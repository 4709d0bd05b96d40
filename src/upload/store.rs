//! Physical file operations for uploads, run on the blocking pool.
//!
//! Each call blocks the requesting task until the operation finishes or the
//! worker timeout elapses. A timed out job keeps running on its thread, so
//! writes carry the caller's session lock into the job and release it only
//! once the job has stopped.

use std::fs::OpenOptions;
use std::io::{self, ErrorKind, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::task;
use tokio::time;

#[derive(Debug)]
pub enum StoreError {
    /// Exclusive create found an existing file.
    Exists,
    Io(io::Error),
    TimedOut,
    Worker(String),
}

impl From<io::Error> for StoreError {
    fn from(err: io::Error) -> Self {
        StoreError::Io(err)
    }
}

#[derive(Clone, Debug)]
pub struct FileWorker {
    timeout: Duration,
}

impl FileWorker {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Creates `path` and extends it to exactly `size` bytes. A zero size
    /// (deferred length) leaves the file empty.
    pub async fn create_and_preallocate(
        &self,
        path: &Path,
        exclusive: bool,
        size: u64,
    ) -> Result<(), StoreError> {
        let path = path.to_path_buf();
        self.run(move || create_blocking(&path, exclusive, size))
            .await
    }

    /// Writes `buffer` into the existing file at `offset` while holding
    /// `lease`. The lease comes back on success. On failure or timeout it is
    /// dropped by the job itself after the write returns.
    pub async fn write_at<L>(
        &self,
        path: &Path,
        buffer: Vec<u8>,
        offset: u64,
        lease: L,
    ) -> Result<L, StoreError>
    where
        L: Send + 'static,
    {
        let path = path.to_path_buf();
        self.run(move || write_blocking(&path, &buffer, offset).map(|()| lease))
            .await
    }

    pub async fn remove(&self, path: &Path) -> Result<(), StoreError> {
        let path: PathBuf = path.to_path_buf();
        self.run(move || std::fs::remove_file(&path).map_err(StoreError::from))
            .await
    }

    async fn run<F, T>(&self, op: F) -> Result<T, StoreError>
    where
        F: FnOnce() -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let handle = task::spawn_blocking(op);
        match time::timeout(self.timeout, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => Err(StoreError::Worker(err.to_string())),
            Err(_) => Err(StoreError::TimedOut),
        }
    }
}

fn create_blocking(path: &Path, exclusive: bool, size: u64) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut options = OpenOptions::new();
    options.write(true);
    if exclusive {
        options.create_new(true);
    } else {
        options.create(true).truncate(true);
    }
    let mut file = options.open(path).map_err(|err| match err.kind() {
        ErrorKind::AlreadyExists => StoreError::Exists,
        _ => StoreError::Io(err),
    })?;

    if size > 0 {
        file.seek(SeekFrom::Start(size - 1))?;
        file.write_all(&[0])?;
    }
    file.sync_all()?;
    Ok(())
}

fn write_blocking(path: &Path, buffer: &[u8], offset: u64) -> Result<(), StoreError> {
    let mut file = OpenOptions::new().write(true).open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(buffer)?;
    file.sync_data()?;
    Ok(())
}
