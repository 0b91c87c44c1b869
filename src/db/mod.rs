mod checkpoint;
mod checkpointer;
mod options;
mod recovery;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::layer::{Base, LayerChain};
use crate::txn::{TransactionTable, TxnId};
use crate::wal::{LogRecord, Wal};

pub use checkpointer::{BackgroundCheckpointer, CheckpointerState};
pub use options::{DbOptions, ReplayPolicy};

/// Database handle.
///
/// Semantics:
/// - Every mutation is appended to the log before it becomes visible. The log
///   reaches stable storage on [`Db::flush`], a checkpoint, or per record with
///   `DbOptions::fsync_writes`.
/// - Transactions see their own writes first, then everything committed to
///   the main timeline (read-committed). Commits merge last-writer-wins.
/// - Handles are cheap to clone and share one engine.
#[derive(Clone)]
pub struct Db {
    inner: Arc<DbInner>,
}

struct DbInner {
    dir: PathBuf,
    options: DbOptions,
    wal: Wal,
    txns: TransactionTable,
    chain: LayerChain,
    /// Bumped under the main slot's write lock, once per mutation applied to
    /// the main timeline.
    version: AtomicU64,
    checkpoint_lock: Mutex<()>,
}

impl Drop for DbInner {
    fn drop(&mut self) {
        if let Err(err) = self.wal.flush() {
            tracing::warn!(dir = %self.dir.display(), error = %err, "log flush on close failed");
        }
    }
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db")
            .field("dir", &self.inner.dir)
            .field("version", &self.version())
            .finish_non_exhaustive()
    }
}

impl Db {
    /// Opens (or creates) the store in `path`, replaying its log on top of the
    /// last snapshot.
    pub fn open(path: impl AsRef<Path>, options: DbOptions) -> Result<Self> {
        let dir = path.as_ref().to_path_buf();
        let opened = recovery::recover(&dir, &options)?;
        tracing::info!(
            dir = %dir.display(),
            keys = opened.base.len(),
            pending = opened.buffer.len(),
            version = opened.version,
            "opened store"
        );

        Ok(Self {
            inner: Arc::new(DbInner {
                dir,
                options,
                wal: opened.wal,
                txns: TransactionTable::new(opened.buffer),
                chain: LayerChain::new(opened.base),
                version: AtomicU64::new(opened.version),
                checkpoint_lock: Mutex::new(()),
            }),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    pub fn options(&self) -> &DbOptions {
        &self.inner.options
    }

    /// Effective value of `key` as seen by `tx`. `Ok(None)` means absent.
    ///
    /// A transaction reads its own buffer, then the main pending buffer, then
    /// the layers and the base. The main buffer sits in that chain so a
    /// transaction also sees writes committed since the last seal.
    pub fn get(&self, key: &str, tx: TxnId) -> Result<Option<String>> {
        let inner = &*self.inner;
        let slot = inner.txns.slot(tx)?;
        if !tx.is_main() {
            let state = slot.read();
            if state.released {
                return Err(Error::invalid_txn(tx));
            }
            if let Some(hit) = state.layer.get(key) {
                return Ok(hit.map(str::to_string));
            }
        }

        let snapshot = {
            let main = inner.txns.main().read();
            if let Some(hit) = main.layer.get(key) {
                return Ok(hit.map(str::to_string));
            }
            inner.chain.snapshot()
        };
        Ok(snapshot.get(key))
    }

    /// Like [`Db::get`] but reports absence as [`Error::KeyNotFound`].
    pub fn get_required(&self, key: &str, tx: TxnId) -> Result<String> {
        self.get(key, tx)?
            .ok_or_else(|| Error::KeyNotFound(key.to_string()))
    }

    /// Writes `key`. Returns the new version for the main timeline and 0
    /// inside a transaction.
    pub fn put(&self, key: &str, value: &str, tx: TxnId) -> Result<u64> {
        let record = |version| LogRecord::Put {
            key: key.to_string(),
            value: value.to_string(),
            txn: tx,
            version,
        };
        self.mutate(tx, record, |layer| layer.put(key, value))
    }

    /// Deletes `key` whether or not it exists. Returns the same as [`Db::put`].
    pub fn delete(&self, key: &str, tx: TxnId) -> Result<u64> {
        let record = |version| LogRecord::Del {
            key: key.to_string(),
            txn: tx,
            version,
        };
        self.mutate(tx, record, |layer| layer.delete(key))
    }

    /// Log first, then apply. A failed append is reported but the write stays
    /// visible in memory.
    fn mutate(
        &self,
        tx: TxnId,
        record: impl FnOnce(Option<u64>) -> LogRecord,
        apply: impl FnOnce(&mut crate::layer::Layer),
    ) -> Result<u64> {
        let inner = &*self.inner;
        if tx.is_main() {
            let mut main = inner.txns.main().write();
            let version = inner.version.fetch_add(1, Ordering::SeqCst) + 1;
            let logged = inner.wal.append(&record(Some(version)));
            apply(&mut main.layer);
            report_append(logged)?;
            return Ok(version);
        }

        let slot = inner.txns.slot(tx)?;
        let mut state = slot.write();
        if state.released {
            return Err(Error::invalid_txn(tx));
        }
        let logged = inner.wal.append(&record(None));
        apply(&mut state.layer);
        report_append(logged)?;
        Ok(0)
    }

    /// Claims a free transaction id. Fails with [`Error::NoFreeTransaction`]
    /// while every slot is in use.
    pub fn start_transaction(&self) -> Result<TxnId> {
        let inner = &*self.inner;
        let id = inner
            .txns
            .allocate(|id| report_append(inner.wal.append(&LogRecord::Start { txn: id })))?;
        tracing::debug!(txn = %id, "transaction started");
        Ok(id)
    }

    /// Merges `tx`'s writes into the main timeline and frees the id.
    /// Committing the main transaction is a no-op.
    pub fn commit(&self, tx: TxnId) -> Result<()> {
        if tx.index().is_none() {
            return Err(Error::invalid_txn(tx));
        }
        if tx.is_main() {
            return Ok(());
        }

        let inner = &*self.inner;
        let mut main = inner.txns.main().write();
        let (layer, logged) = inner.txns.finish(tx, |state| {
            let version = inner.version.fetch_add(1, Ordering::SeqCst) + 1;
            let logged = inner.wal.append(&LogRecord::Commit { txn: tx, version });
            (std::mem::take(&mut state.layer), logged)
        })?;
        main.layer.merge_from(&layer);
        drop(main);
        tracing::debug!(txn = %tx, writes = layer.len(), "transaction committed");
        report_append(logged)
    }

    /// Discards `tx`'s writes and frees the id.
    pub fn rollback(&self, tx: TxnId) -> Result<()> {
        let inner = &*self.inner;
        let logged = inner.txns.finish(tx, |state| {
            state.layer = Default::default();
            inner.wal.append(&LogRecord::Rollback { txn: tx })
        })?;
        tracing::debug!(txn = %tx, "transaction rolled back");
        report_append(logged)
    }

    /// Forces every appended record to stable storage.
    pub fn flush(&self) -> Result<()> {
        let result = self.inner.wal.flush();
        if let Err(err) = &result {
            tracing::error!(error = %err, "log flush failed");
        }
        result
    }

    /// Flushes and releases this handle. Unlike dropping, a failed flush is
    /// returned.
    pub fn close(self) -> Result<()> {
        self.flush()
    }

    /// Seals the pending buffer into the layer chain so a following
    /// [`Db::extract`] folds only immutable state.
    pub fn prepare_extract(&self) {
        let _serial = self.inner.checkpoint_lock.lock();
        let sealed = self.seal_current_layer();
        tracing::debug!(sealed, "prepared extract");
    }

    /// Point-in-time copy of every live key accepted by `keep`. Concurrent
    /// writers are not blocked while the copy is built.
    pub fn extract<F>(&self, keep: F) -> Base
    where
        F: Fn(&str) -> bool + Sync,
    {
        let snapshot = {
            let _serial = self.inner.checkpoint_lock.lock();
            self.seal_current_layer();
            self.inner.chain.snapshot()
        };
        let out = snapshot.fold_filtered(keep);
        tracing::debug!(
            keys = out.len(),
            layers = snapshot.layers().len(),
            "extracted"
        );
        out
    }

    /// Last version handed out on the main timeline.
    pub fn version(&self) -> u64 {
        self.inner.version.load(Ordering::SeqCst)
    }

    pub fn active_transactions(&self) -> Vec<TxnId> {
        self.inner.txns.active_ids()
    }

    /// Sealed layers not yet folded into the base.
    pub fn layer_count(&self) -> usize {
        self.inner.chain.layer_count()
    }

    /// Size of the active log, including records not yet flushed.
    pub fn log_bytes(&self) -> u64 {
        self.inner.wal.bytes()
    }

    /// Moves the pending main buffer onto the layer chain and starts a fresh
    /// one. Returns false if there was nothing to seal.
    pub(crate) fn seal_current_layer(&self) -> bool {
        let mut main = self.inner.txns.main().write();
        let layer = std::mem::take(&mut main.layer);
        self.inner.chain.push(layer)
    }
}

fn report_append(result: Result<()>) -> Result<()> {
    if let Err(err) = &result {
        tracing::error!(error = %err, "log append failed");
    }
    result
}
