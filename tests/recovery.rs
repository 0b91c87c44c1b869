use std::path::Path;

use layerkv::snapshot::{SNAPSHOT_FILE_NAME, SNAPSHOT_NEXT_FILE_NAME};
use layerkv::wal::{LogRecord, LOG_FILE_NAME, LOG_NEXT_FILE_NAME};
use layerkv::{Base, Db, DbOptions, Error, ReplayPolicy, TxnId};
use tempfile::TempDir;

const MAIN: TxnId = TxnId::MAIN;

fn put(key: &str, value: &str, txn: TxnId, version: Option<u64>) -> LogRecord {
    LogRecord::Put {
        key: key.into(),
        value: value.into(),
        txn,
        version,
    }
}

fn write_log(path: &Path, records: &[LogRecord]) -> anyhow::Result<()> {
    let text: String = records.iter().map(LogRecord::encode).collect();
    std::fs::write(path, text)?;
    Ok(())
}

fn write_base(path: &Path, pairs: &[(&str, &str)]) -> anyhow::Result<()> {
    let base: Base = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    std::fs::write(path, serde_json::to_vec(&base)?)?;
    Ok(())
}

fn file_names(dir: &Path) -> anyhow::Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        names.push(entry?.file_name().to_string_lossy().into_owned());
    }
    names.sort();
    Ok(names)
}

/// Layout of a checkpoint that passed its commit point: `log.next.txt` holds
/// the re-announced transaction 2 and one main write made after the swap.
fn interrupted_checkpoint(dir: &Path, base: &[(&str, &str)]) -> anyhow::Result<()> {
    write_base(&dir.join(SNAPSHOT_FILE_NAME), base)?;
    write_log(
        &dir.join(LOG_FILE_NAME),
        &[
            put("a", "1", MAIN, Some(1)),
            LogRecord::Start { txn: TxnId(2) },
            put("t", "pending", TxnId(2), None),
            put("b", "2", MAIN, Some(2)),
        ],
    )?;
    write_log(
        &dir.join(LOG_NEXT_FILE_NAME),
        &[
            LogRecord::Start { txn: TxnId(2) },
            put("t", "pending", TxnId(2), None),
            put("c", "3", MAIN, Some(3)),
        ],
    )?;
    Ok(())
}

fn assert_interrupted_state(dir: &Path) -> anyhow::Result<()> {
    let db = Db::open(dir, DbOptions::default())?;
    assert_eq!(db.get("a", MAIN)?.as_deref(), Some("1"));
    assert_eq!(db.get("b", MAIN)?.as_deref(), Some("2"));
    assert_eq!(db.get("c", MAIN)?.as_deref(), Some("3"));
    assert_eq!(db.get("t", MAIN)?, None);
    assert_eq!(db.version(), 3);
    assert!(db.active_transactions().is_empty());
    drop(db);

    assert_eq!(file_names(dir)?, vec![LOG_FILE_NAME, SNAPSHOT_FILE_NAME]);
    let snapshot: Base = serde_json::from_slice(&std::fs::read(dir.join(SNAPSHOT_FILE_NAME))?)?;
    assert_eq!(snapshot.len(), 3);
    let log = std::fs::read_to_string(dir.join(LOG_FILE_NAME))?;
    assert!(log.starts_with(&LogRecord::Start { txn: TxnId(2) }.encode()));
    assert!(log.ends_with(&LogRecord::Rollback { txn: TxnId(2) }.encode()));

    // the consolidated layout opens cleanly again
    let db = Db::open(dir, DbOptions::default())?;
    assert_eq!(db.get("c", MAIN)?.as_deref(), Some("3"));
    let tx = db.start_transaction()?;
    assert_eq!(tx, TxnId(1));
    Ok(())
}

#[test]
fn crash_before_snapshot_rename_recovers_from_both_logs() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    interrupted_checkpoint(dir.path(), &[])?;
    std::fs::write(dir.path().join(SNAPSHOT_NEXT_FILE_NAME), "{\"a\": \"1\", \"b")?;
    assert_interrupted_state(dir.path())
}

#[test]
fn crash_between_renames_recovers_from_new_snapshot() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    interrupted_checkpoint(dir.path(), &[("a", "1"), ("b", "2")])?;
    assert_interrupted_state(dir.path())
}

#[test]
fn stale_snapshot_without_pending_log_is_discarded() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    write_base(&dir.path().join(SNAPSHOT_FILE_NAME), &[("old", "1")])?;
    write_base(&dir.path().join(SNAPSHOT_NEXT_FILE_NAME), &[("new", "1")])?;
    std::fs::write(dir.path().join(LOG_FILE_NAME), "")?;

    let db = Db::open(dir.path(), DbOptions::default())?;
    assert_eq!(db.get("old", MAIN)?.as_deref(), Some("1"));
    assert_eq!(db.get("new", MAIN)?, None);
    assert!(!dir.path().join(SNAPSHOT_NEXT_FILE_NAME).exists());
    Ok(())
}

#[test]
fn torn_tail_is_skipped_or_rejected_by_policy() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let mut text = put("a", "1", MAIN, Some(1)).encode();
    text.push_str(&put("b", "2", MAIN, Some(2)).encode());
    text.push_str("put \"c\" \"3");
    std::fs::write(dir.path().join(LOG_FILE_NAME), &text)?;

    let strict = DbOptions {
        replay_policy: ReplayPolicy::Strict,
        ..Default::default()
    };
    let err = Db::open(dir.path(), strict).unwrap_err();
    assert!(
        matches!(err, Error::MalformedLogRecord { line: 3, .. }),
        "unexpected error: {err}"
    );

    let db = Db::open(dir.path(), DbOptions::default())?;
    assert_eq!(db.get("a", MAIN)?.as_deref(), Some("1"));
    assert_eq!(db.get("b", MAIN)?.as_deref(), Some("2"));
    assert_eq!(db.get("c", MAIN)?, None);
    assert_eq!(db.version(), 2);
    Ok(())
}

#[test]
fn unflushed_writes_survive_a_clean_drop() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    {
        let db = Db::open(dir.path(), DbOptions::default())?;
        db.put("k", "v", MAIN)?;
        assert_eq!(std::fs::read_to_string(dir.path().join(LOG_FILE_NAME))?, "");
    }
    let db = Db::open(dir.path(), DbOptions::default())?;
    assert_eq!(db.get("k", MAIN)?.as_deref(), Some("v"));
    db.close()?;
    Ok(())
}

#[test]
fn failed_checkpoint_keeps_serving_and_is_resumed() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let db = Db::open(dir.path(), DbOptions::default())?;
    db.put("a", "1", MAIN)?;
    let tx = db.start_transaction()?;
    db.put("t", "x", tx)?;

    // a directory in the way makes the snapshot write fail after the swap
    let blocker = dir.path().join(SNAPSHOT_NEXT_FILE_NAME);
    std::fs::create_dir(&blocker)?;
    assert!(matches!(db.checkpoint(), Err(Error::Io { .. })));
    assert!(dir.path().join(LOG_NEXT_FILE_NAME).exists());

    db.put("b", "2", MAIN)?;
    db.commit(tx)?;
    assert_eq!(db.get("a", MAIN)?.as_deref(), Some("1"));
    assert_eq!(db.get("t", MAIN)?.as_deref(), Some("x"));

    std::fs::remove_dir(&blocker)?;
    db.checkpoint()?;
    assert_eq!(file_names(dir.path())?, vec![LOG_FILE_NAME, SNAPSHOT_FILE_NAME]);
    assert_eq!(db.layer_count(), 0);
    drop(db);

    let db = Db::open(dir.path(), DbOptions::default())?;
    for (key, value) in [("a", "1"), ("b", "2"), ("t", "x")] {
        assert_eq!(db.get(key, MAIN)?.as_deref(), Some(value), "key {key}");
    }
    Ok(())
}

#[test]
fn crash_after_failed_checkpoint_recovers_from_pending_log() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    {
        let db = Db::open(dir.path(), DbOptions::default())?;
        db.put("a", "1", MAIN)?;
        std::fs::create_dir(dir.path().join(SNAPSHOT_NEXT_FILE_NAME))?;
        assert!(db.checkpoint().is_err());
        db.put("b", "2", MAIN)?;
        db.flush()?;
    }
    std::fs::remove_dir(dir.path().join(SNAPSHOT_NEXT_FILE_NAME))?;

    let db = Db::open(dir.path(), DbOptions::default())?;
    assert_eq!(db.get("a", MAIN)?.as_deref(), Some("1"));
    assert_eq!(db.get("b", MAIN)?.as_deref(), Some("2"));
    assert!(!dir.path().join(LOG_NEXT_FILE_NAME).exists());
    Ok(())
}
