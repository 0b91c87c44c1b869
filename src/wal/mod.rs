//! Write-ahead log.
//!
//! Every mutation and transaction lifecycle event is appended here before it
//! is applied in memory. Appends go through a `BufWriter` and only reach
//! stable storage on [`Wal::flush`] (or on every append when
//! `DbOptions::fsync_writes` is set).

pub mod codec;
pub mod replay;

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::db::DbOptions;
use crate::error::{IoContext, Result};

pub use codec::{CodecError, LogRecord};
pub use replay::{replay, Recovered, ReplayError, Replayer};

/// Canonical log file.
pub const LOG_FILE_NAME: &str = "log.txt";
/// Log that becomes active at a checkpoint's commit point, renamed over
/// [`LOG_FILE_NAME`] once the matching snapshot is in place.
pub const LOG_NEXT_FILE_NAME: &str = "log.next.txt";

#[derive(Debug)]
pub struct Wal {
    inner: Mutex<WalFile>,
    fsync_writes: bool,
    buffer_bytes: usize,
}

#[derive(Debug)]
struct WalFile {
    path: PathBuf,
    writer: BufWriter<File>,
    bytes: u64,
}

impl WalFile {
    fn flush(&mut self) -> Result<()> {
        self.writer
            .flush()
            .io_context(|| format!("flush {}", self.path.display()))?;
        self.writer
            .get_ref()
            .sync_data()
            .io_context(|| format!("fsync {}", self.path.display()))
    }
}

impl Wal {
    /// Opens `path` for appending, creating it if missing. A torn final line
    /// is terminated so the next record starts on a line of its own.
    pub fn open(path: &Path, options: &DbOptions) -> Result<Self> {
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)
            .io_context(|| format!("open log {}", path.display()))?;
        let mut bytes = file
            .metadata()
            .io_context(|| format!("stat log {}", path.display()))?
            .len();
        if bytes > 0 {
            let mut last = [0u8; 1];
            file.seek(SeekFrom::End(-1))
                .and_then(|_| file.read_exact(&mut last))
                .io_context(|| format!("read tail of log {}", path.display()))?;
            if last[0] != b'\n' {
                file.write_all(b"\n")
                    .io_context(|| format!("terminate log {}", path.display()))?;
                bytes += 1;
                tracing::warn!(path = %path.display(), "terminated torn final log record");
            }
        }
        Ok(Self {
            inner: Mutex::new(WalFile {
                path: path.to_path_buf(),
                writer: BufWriter::with_capacity(options.log_buffer_bytes, file),
                bytes,
            }),
            fsync_writes: options.fsync_writes,
            buffer_bytes: options.log_buffer_bytes,
        })
    }

    pub fn append(&self, record: &LogRecord) -> Result<()> {
        let line = record.encode();
        let mut inner = self.inner.lock();
        inner
            .writer
            .write_all(line.as_bytes())
            .io_context(|| format!("append {} record to {}", record.op_name(), inner.path.display()))?;
        inner.bytes += line.len() as u64;
        if self.fsync_writes {
            inner.flush()?;
        }
        Ok(())
    }

    /// Forces buffered records to stable storage.
    pub fn flush(&self) -> Result<()> {
        self.inner.lock().flush()
    }

    pub fn path(&self) -> PathBuf {
        self.inner.lock().path.clone()
    }

    /// Bytes in the active log file, buffered ones included.
    pub fn bytes(&self) -> u64 {
        self.inner.lock().bytes
    }

    /// Makes a fresh file at `path` the append target. `preamble` is written
    /// and synced at its head. The previous file is flushed, synced and
    /// closed; if any of that fails the previous file stays active and the
    /// new one is removed.
    pub(crate) fn swap(&self, path: &Path, preamble: &[LogRecord]) -> Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .io_context(|| format!("create log {}", path.display()))?;
        let mut writer = BufWriter::with_capacity(self.buffer_bytes, file);
        let mut bytes = 0u64;

        let mut inner = self.inner.lock();
        let installed = (|| -> Result<()> {
            for record in preamble {
                let line = record.encode();
                writer
                    .write_all(line.as_bytes())
                    .io_context(|| format!("append preamble to {}", path.display()))?;
                bytes += line.len() as u64;
            }
            if !preamble.is_empty() {
                writer
                    .flush()
                    .and_then(|_| writer.get_ref().sync_data())
                    .io_context(|| format!("sync preamble of {}", path.display()))?;
            }
            inner.flush()
        })();
        if let Err(err) = installed {
            if let Err(remove_err) = std::fs::remove_file(path) {
                tracing::warn!(path = %path.display(), error = %remove_err, "failed to remove abandoned log");
            }
            return Err(err);
        }

        let old = std::mem::replace(
            &mut *inner,
            WalFile {
                path: path.to_path_buf(),
                writer,
                bytes,
            },
        );
        tracing::debug!(from = %old.path.display(), to = %path.display(), "log swapped");
        Ok(())
    }

    /// Points the writer at a read-only handle of the active file so every
    /// following flush fails.
    #[cfg(test)]
    pub(crate) fn reopen_read_only(&self) -> std::io::Result<()> {
        let mut inner = self.inner.lock();
        let file = File::open(&inner.path)?;
        inner.writer = BufWriter::with_capacity(self.buffer_bytes, file);
        Ok(())
    }

    /// Renames the active file on disk. Appends keep going to the same handle.
    pub(crate) fn rename_active(&self, to: &Path) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.path == to {
            return Ok(());
        }
        std::fs::rename(&inner.path, to)
            .io_context(|| format!("rename {} to {}", inner.path.display(), to.display()))?;
        inner.path = to.to_path_buf();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::txn::TxnId;

    fn put(key: &str, version: u64) -> LogRecord {
        LogRecord::Put {
            key: key.into(),
            value: "v".into(),
            txn: TxnId::MAIN,
            version: Some(version),
        }
    }

    #[test]
    fn appends_are_buffered_until_flush() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join(LOG_FILE_NAME);
        let wal = Wal::open(&path, &DbOptions::default())?;

        wal.append(&put("a", 1))?;
        assert_eq!(std::fs::read_to_string(&path)?, "");
        assert_eq!(wal.bytes(), put("a", 1).encode().len() as u64);

        wal.flush()?;
        assert_eq!(std::fs::read_to_string(&path)?, put("a", 1).encode());
        Ok(())
    }

    #[test]
    fn fsync_writes_persists_every_append() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join(LOG_FILE_NAME);
        let options = DbOptions {
            fsync_writes: true,
            ..Default::default()
        };
        let wal = Wal::open(&path, &options)?;
        wal.append(&put("a", 1))?;
        assert_eq!(std::fs::read_to_string(&path)?, put("a", 1).encode());
        Ok(())
    }

    #[test]
    fn failed_flush_surfaces_as_io_error() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join(LOG_FILE_NAME);
        let options = DbOptions {
            fsync_writes: true,
            ..Default::default()
        };
        let wal = Wal::open(&path, &options)?;
        wal.append(&put("a", 1))?;
        wal.reopen_read_only()?;

        let err = wal.append(&put("b", 2)).unwrap_err();
        assert!(matches!(err, crate::Error::Io { .. }), "{err}");
        assert!(wal.flush().is_err());
        assert_eq!(std::fs::read_to_string(&path)?, put("a", 1).encode());
        Ok(())
    }

    #[test]
    fn open_terminates_torn_tail() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join(LOG_FILE_NAME);
        std::fs::write(&path, "put \"torn")?;
        let wal = Wal::open(&path, &DbOptions::default())?;
        wal.append(&put("a", 1))?;
        wal.flush()?;
        let text = std::fs::read_to_string(&path)?;
        assert_eq!(text, format!("put \"torn\n{}", put("a", 1).encode()));
        Ok(())
    }

    #[test]
    fn swap_closes_old_file_and_writes_preamble() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join(LOG_FILE_NAME);
        let next = dir.path().join(LOG_NEXT_FILE_NAME);
        let wal = Wal::open(&path, &DbOptions::default())?;
        wal.append(&put("old", 1))?;

        let start = LogRecord::Start { txn: TxnId(2) };
        wal.swap(&next, std::slice::from_ref(&start))?;
        assert_eq!(std::fs::read_to_string(&path)?, put("old", 1).encode());
        assert_eq!(std::fs::read_to_string(&next)?, start.encode());
        assert_eq!(wal.path(), next);

        wal.append(&put("new", 2))?;
        wal.flush()?;
        assert_eq!(
            std::fs::read_to_string(&next)?,
            format!("{}{}", start.encode(), put("new", 2).encode())
        );

        wal.rename_active(&path)?;
        assert!(!next.exists());
        wal.append(&put("after", 3))?;
        wal.flush()?;
        assert!(std::fs::read_to_string(&path)?.ends_with(&put("after", 3).encode()));
        Ok(())
    }
}
