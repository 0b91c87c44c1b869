use std::sync::atomic::Ordering;

use crate::db::Db;
use crate::error::{IoContext, Result};
use crate::layer::Layer;
use crate::snapshot::{self, SNAPSHOT_FILE_NAME, SNAPSHOT_NEXT_FILE_NAME};
use crate::txn::TxnId;
use crate::wal::{LogRecord, LOG_FILE_NAME, LOG_NEXT_FILE_NAME};

impl Db {
    /// Folds every sealed layer into a new base snapshot and starts a fresh
    /// log.
    ///
    /// Sequence:
    /// 1. Seal the pending buffer onto the layer chain.
    /// 2. Fold the chain into a candidate base without holding the main lock.
    /// 3. Under the main lock, add writes that landed since the seal and swap
    ///    the log over to `log.next.txt`. Its head records the version counter
    ///    and re-announces open transactions. This is the commit point.
    /// 4. Write the candidate to `slots.next.json`.
    /// 5. Under the main lock, rename the snapshot into place, then the log.
    ///
    /// The in-memory chain is only compacted once both renames succeeded. If
    /// a step after the commit point fails, `log.next.txt` stays the active
    /// log and the next checkpoint reuses it instead of swapping again.
    pub fn checkpoint(&self) -> Result<()> {
        let inner = &*self.inner;
        let _serial = inner.checkpoint_lock.lock();

        self.seal_current_layer();
        let sealed = inner.chain.snapshot();
        let mut candidate = sealed.fold();
        let folded = sealed.layers().len();
        drop(sealed);

        let log_next = inner.dir.join(LOG_NEXT_FILE_NAME);
        {
            let main = inner.txns.main().write();
            main.layer.apply_to(&mut candidate);
            if inner.wal.path() == log_next {
                tracing::info!("resuming checkpoint on the log of a failed attempt");
            } else {
                let version = inner.version.load(Ordering::SeqCst);
                inner.txns.with_active(|active| {
                    inner.wal.swap(&log_next, &preamble(version, active))
                })?;
            }
        }

        let snapshot_next = inner.dir.join(SNAPSHOT_NEXT_FILE_NAME);
        let sync = inner.options.sync_checkpoint_files;
        if let Err(err) = snapshot::write(&snapshot_next, &candidate, sync) {
            if let Err(remove_err) = std::fs::remove_file(&snapshot_next) {
                tracing::warn!(path = %snapshot_next.display(), error = %remove_err, "failed to remove partial snapshot");
            }
            return Err(err);
        }

        {
            let _main = inner.txns.main().write();
            let snapshot_path = inner.dir.join(SNAPSHOT_FILE_NAME);
            std::fs::rename(&snapshot_next, &snapshot_path).io_context(|| {
                format!("rename {} to {}", snapshot_next.display(), snapshot_path.display())
            })?;
            inner.wal.rename_active(&inner.dir.join(LOG_FILE_NAME))?;
        }
        if sync {
            snapshot::sync_dir(&inner.dir)?;
        }

        let keys = candidate.len();
        inner.chain.install_base(candidate, folded);
        tracing::info!(keys, layers = folded, "checkpoint complete");
        Ok(())
    }
}

/// Head of a new log: the version counter, then records that rebuild every
/// open transaction's buffer.
fn preamble(version: u64, active: &[(TxnId, &Layer)]) -> Vec<LogRecord> {
    let mut records = Vec::new();
    if version > 0 {
        records.push(LogRecord::Version { version });
    }
    for (txn, layer) in active {
        records.push(LogRecord::Start { txn: *txn });
        for (key, value) in layer.iter() {
            records.push(match value {
                Some(value) => LogRecord::Put {
                    key: key.to_string(),
                    value: value.to_string(),
                    txn: *txn,
                    version: None,
                },
                None => LogRecord::Del {
                    key: key.to_string(),
                    txn: *txn,
                    version: None,
                },
            });
        }
    }
    records
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::db::DbOptions;
    use crate::wal::replay;

    #[test]
    fn reannounced_transactions_replay_to_the_same_buffer() {
        let mut layer = Layer::new();
        layer.put("a", "1");
        layer.delete("b");
        let records = preamble(0, &[(TxnId(4), &layer)]);
        assert_eq!(records[0], LogRecord::Start { txn: TxnId(4) });
        assert_eq!(records.len(), 3);
        assert_eq!(preamble(9, &[])[..], [LogRecord::Version { version: 9 }]);

        let mut text: String = records.iter().map(LogRecord::encode).collect();
        text.push_str(&LogRecord::Commit { txn: TxnId(4), version: 1 }.encode());
        let (recovered, rejected) = replay(text.lines());
        assert!(rejected.is_empty());
        assert_eq!(recovered.buffer, {
            let mut expected = Layer::new();
            expected.merge_from(&layer);
            expected
        });
    }

    #[test]
    fn checkpoint_leaves_only_canonical_files() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let db = Db::open(dir.path(), DbOptions::default())?;
        db.put("a", "1", TxnId::MAIN)?;
        let tx = db.start_transaction()?;
        db.put("t", "x", tx)?;
        db.checkpoint()?;

        let mut names: Vec<String> = std::fs::read_dir(dir.path())?
            .map(|entry| entry.map(|e| e.file_name().to_string_lossy().into_owned()))
            .collect::<std::io::Result<_>>()?;
        names.sort();
        assert_eq!(names, vec![LOG_FILE_NAME, SNAPSHOT_FILE_NAME]);
        assert_eq!(db.layer_count(), 0);

        db.flush()?;
        let log = std::fs::read_to_string(dir.path().join(LOG_FILE_NAME))?;
        assert_eq!(
            log,
            format!(
                "{}{}{}",
                LogRecord::Version { version: 1 }.encode(),
                LogRecord::Start { txn: tx }.encode(),
                LogRecord::Put {
                    key: "t".into(),
                    value: "x".into(),
                    txn: tx,
                    version: None
                }
                .encode()
            )
        );
        Ok(())
    }

    #[test]
    fn version_survives_checkpoint_and_restart() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        {
            let db = Db::open(dir.path(), DbOptions::default())?;
            for i in 0..5 {
                db.put(&format!("k{i}"), "v", TxnId::MAIN)?;
            }
            db.checkpoint()?;
            db.close()?;
        }
        let db = Db::open(dir.path(), DbOptions::default())?;
        assert_eq!(db.version(), 5);
        assert_eq!(db.put("k5", "v", TxnId::MAIN)?, 6);

        // a second checkpoint on an unchanged counter keeps it as well
        db.checkpoint()?;
        drop(db);
        let db = Db::open(dir.path(), DbOptions::default())?;
        assert_eq!(db.version(), 6);
        Ok(())
    }
}
