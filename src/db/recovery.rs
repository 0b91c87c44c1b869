//! Startup: snapshot load, log replay and cleanup of an interrupted
//! checkpoint.
//!
//! Possible directory states after a crash, and what open does with them:
//! - `slots.json` + `log.txt`: replay the log on top of the snapshot.
//! - plus `slots.next.json`: the snapshot was never renamed into place; delete
//!   it.
//! - plus `log.next.txt`: the checkpoint passed its commit point. Replay
//!   `log.txt` then `log.next.txt` (both are idempotent on top of either the
//!   old or the new snapshot), write the result as the snapshot and rename
//!   `log.next.txt` over `log.txt`.

use std::path::Path;

use crate::db::{DbOptions, ReplayPolicy};
use crate::error::{Error, IoContext, Result};
use crate::layer::{Base, Layer};
use crate::snapshot::{self, SNAPSHOT_FILE_NAME, SNAPSHOT_NEXT_FILE_NAME};
use crate::wal::{LogRecord, Recovered, Replayer, Wal, LOG_FILE_NAME, LOG_NEXT_FILE_NAME};

pub(super) struct Opened {
    pub base: Base,
    pub buffer: Layer,
    pub version: u64,
    pub wal: Wal,
}

pub(super) fn recover(dir: &Path, options: &DbOptions) -> Result<Opened> {
    std::fs::create_dir_all(dir).io_context(|| format!("create dir {}", dir.display()))?;
    let snapshot_path = dir.join(SNAPSHOT_FILE_NAME);
    let snapshot_next = dir.join(SNAPSHOT_NEXT_FILE_NAME);
    let log_path = dir.join(LOG_FILE_NAME);
    let log_next = dir.join(LOG_NEXT_FILE_NAME);

    if snapshot_next.exists() {
        tracing::warn!(path = %snapshot_next.display(), "removing snapshot of an unfinished checkpoint");
        std::fs::remove_file(&snapshot_next)
            .io_context(|| format!("remove {}", snapshot_next.display()))?;
    }

    let mut base = match snapshot::load(&snapshot_path)? {
        Some(base) => base,
        None => {
            snapshot::write(&snapshot_path, &Base::new(), options.sync_checkpoint_files)?;
            tracing::info!(path = %snapshot_path.display(), "created empty snapshot");
            Base::new()
        }
    };

    let mut replayer = Replayer::new();
    replay_file(&log_path, &mut replayer, options.replay_policy)?;
    let mut recovered = replayer.finish();

    if log_next.exists() {
        // In-flight transactions of the old log were re-announced at the head
        // of the new one, so replay restarts with an empty table.
        let mut replayer = Replayer::resume(recovered.buffer, recovered.version);
        replay_file(&log_next, &mut replayer, options.replay_policy)?;
        recovered = replayer.finish();

        let mut consolidated = base;
        recovered.buffer.apply_to(&mut consolidated);
        snapshot::write(&snapshot_next, &consolidated, options.sync_checkpoint_files)?;
        std::fs::rename(&snapshot_next, &snapshot_path)
            .io_context(|| format!("rename {} to {}", snapshot_next.display(), snapshot_path.display()))?;
        std::fs::rename(&log_next, &log_path)
            .io_context(|| format!("rename {} to {}", log_next.display(), log_path.display()))?;
        if options.sync_checkpoint_files {
            snapshot::sync_dir(dir)?;
        }
        tracing::info!(keys = consolidated.len(), "completed interrupted checkpoint");
        base = consolidated;
    }

    let wal = Wal::open(&log_path, options)?;
    close_in_flight(&wal, &recovered)?;
    tracing::debug!(
        records = recovered.applied,
        discarded = recovered.in_flight.len(),
        "log replayed"
    );

    Ok(Opened {
        base,
        buffer: recovered.buffer,
        version: recovered.version,
        wal,
    })
}

/// Replays one log file. A missing file replays nothing.
fn replay_file(path: &Path, replayer: &mut Replayer, policy: ReplayPolicy) -> Result<()> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(Error::io(format!("read log {}", path.display()), err)),
    };

    for (idx, raw) in data.split(|b| *b == b'\n').enumerate() {
        let line = String::from_utf8_lossy(raw);
        let Err(err) = replayer.apply_line(&line) else {
            continue;
        };
        match policy {
            ReplayPolicy::Strict => {
                return Err(Error::MalformedLogRecord {
                    file: path.to_path_buf(),
                    line: idx + 1,
                    reason: err.to_string(),
                });
            }
            ReplayPolicy::SkipMalformed => {
                tracing::warn!(
                    file = %path.display(),
                    line = idx + 1,
                    error = %err,
                    "skipping malformed log record"
                );
            }
        }
    }
    Ok(())
}

/// Transactions still open at the end of the log were never acknowledged.
/// Closing them in the log lets their ids be reused without the next replay
/// seeing a second `start` for a live id.
fn close_in_flight(wal: &Wal, recovered: &Recovered) -> Result<()> {
    if recovered.in_flight.is_empty() {
        return Ok(());
    }
    for txn in &recovered.in_flight {
        wal.append(&LogRecord::Rollback { txn: *txn })?;
    }
    wal.flush()?;
    tracing::info!(count = recovered.in_flight.len(), "rolled back in-flight transactions");
    Ok(())
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::txn::TxnId;

    fn write_log(path: &Path, records: &[LogRecord]) -> anyhow::Result<()> {
        let text: String = records.iter().map(LogRecord::encode).collect();
        std::fs::write(path, text)?;
        Ok(())
    }

    #[test]
    fn fresh_directory_gets_initial_files() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let root = dir.path().join("node");
        let opened = recover(&root, &DbOptions::default())?;
        assert!(opened.base.is_empty());
        assert_eq!(std::fs::read_to_string(root.join(SNAPSHOT_FILE_NAME))?, "{}");
        assert!(root.join(LOG_FILE_NAME).exists());
        Ok(())
    }

    #[test]
    fn strict_policy_reports_file_and_line() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let log = dir.path().join(LOG_FILE_NAME);
        std::fs::write(&log, "start \"1\"\nnonsense\n")?;
        let options = DbOptions {
            replay_policy: ReplayPolicy::Strict,
            ..Default::default()
        };
        match recover(dir.path(), &options) {
            Err(Error::MalformedLogRecord { file, line, .. }) => {
                assert_eq!(file, log);
                assert_eq!(line, 2);
            }
            Err(other) => panic!("unexpected error {other}"),
            Ok(_) => panic!("strict replay accepted a malformed record"),
        }
        Ok(())
    }

    #[test]
    fn dangling_transactions_are_closed_in_the_log() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let log = dir.path().join(LOG_FILE_NAME);
        write_log(
            &log,
            &[
                LogRecord::Start { txn: TxnId(3) },
                LogRecord::Put {
                    key: "k".into(),
                    value: "v".into(),
                    txn: TxnId(3),
                    version: None,
                },
            ],
        )?;
        let opened = recover(dir.path(), &DbOptions::default())?;
        assert!(opened.buffer.is_empty());
        drop(opened);

        let text = std::fs::read_to_string(&log)?;
        assert!(text.ends_with(&LogRecord::Rollback { txn: TxnId(3) }.encode()));
        Ok(())
    }
}
