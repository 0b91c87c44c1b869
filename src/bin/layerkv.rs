use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use layerkv::wal::{LogRecord, LOG_FILE_NAME, LOG_NEXT_FILE_NAME};
use layerkv::{Db, DbOptions, TxnId};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "layerkv")]
#[command(about = "layerkv node storage tools", long_about = None)]
struct Cli {
    /// JSON file with `DbOptions` fields; missing fields keep defaults.
    #[arg(long, global = true)]
    options: Option<PathBuf>,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Put {
        #[arg(long)]
        db: PathBuf,
        #[arg(long)]
        key: String,
        #[arg(long)]
        value: String,
        #[arg(long, default_value_t = false)]
        sync: bool,
    },
    Get {
        #[arg(long)]
        db: PathBuf,
        #[arg(long)]
        key: String,
    },
    Delete {
        #[arg(long)]
        db: PathBuf,
        #[arg(long)]
        key: String,
        #[arg(long, default_value_t = false)]
        sync: bool,
    },
    Checkpoint {
        #[arg(long)]
        db: PathBuf,
    },
    Extract {
        #[arg(long)]
        db: PathBuf,
        #[arg(long, default_value = "")]
        prefix: String,
    },
    LogDump {
        #[arg(long)]
        db: PathBuf,
    },
    DbCheck {
        #[arg(long)]
        db: PathBuf,
    },
    Bench {
        #[arg(long)]
        db: PathBuf,
        #[arg(long, default_value_t = 50_000)]
        keys: usize,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let options = load_options(cli.options.as_deref())?;
    match cli.cmd {
        Command::Put {
            db,
            key,
            value,
            sync,
        } => put_cmd(&db, options, &key, &value, sync),
        Command::Get { db, key } => get_cmd(&db, options, &key),
        Command::Delete { db, key, sync } => delete_cmd(&db, options, &key, sync),
        Command::Checkpoint { db } => checkpoint_cmd(&db, options),
        Command::Extract { db, prefix } => extract_cmd(&db, options, &prefix),
        Command::LogDump { db } => log_dump(&db),
        Command::DbCheck { db } => db_check(&db),
        Command::Bench { db, keys } => bench(&db, options, keys),
    }
}

fn load_options(path: Option<&Path>) -> anyhow::Result<DbOptions> {
    let Some(path) = path else {
        return Ok(DbOptions::default());
    };
    let data = std::fs::read(path).with_context(|| format!("read options {}", path.display()))?;
    serde_json::from_slice(&data).with_context(|| format!("parse options {}", path.display()))
}

fn put_cmd(db: &Path, options: DbOptions, key: &str, value: &str, sync: bool) -> anyhow::Result<()> {
    let db = Db::open(db, options)?;
    let version = db.put(key, value, TxnId::MAIN)?;
    if sync {
        db.flush()?;
    }
    println!("put key={key} value={value} version={version} sync={sync}");
    db.close()?;
    Ok(())
}

fn get_cmd(db: &Path, options: DbOptions, key: &str) -> anyhow::Result<()> {
    let db = Db::open(db, options)?;
    match db.get(key, TxnId::MAIN)? {
        Some(value) => println!("value={value}"),
        None => println!("not_found"),
    }
    Ok(())
}

fn delete_cmd(db: &Path, options: DbOptions, key: &str, sync: bool) -> anyhow::Result<()> {
    let db = Db::open(db, options)?;
    let version = db.delete(key, TxnId::MAIN)?;
    if sync {
        db.flush()?;
    }
    println!("delete key={key} version={version} sync={sync}");
    db.close()?;
    Ok(())
}

fn checkpoint_cmd(db: &Path, options: DbOptions) -> anyhow::Result<()> {
    let db = Db::open(db, options)?;
    db.checkpoint().context("checkpoint")?;
    println!("checkpoint ok log_bytes={}", db.log_bytes());
    Ok(())
}

fn extract_cmd(db: &Path, options: DbOptions, prefix: &str) -> anyhow::Result<()> {
    let db = Db::open(db, options)?;
    db.prepare_extract();
    let extracted = db.extract(|key| key.starts_with(prefix));
    println!("{}", serde_json::to_string(&extracted)?);
    Ok(())
}

/// Prints every record of the active log files, one per line.
fn log_dump(db: &Path) -> anyhow::Result<()> {
    for name in [LOG_FILE_NAME, LOG_NEXT_FILE_NAME] {
        let path = db.join(name);
        if !path.exists() {
            continue;
        }
        let data = std::fs::read(&path).with_context(|| format!("read {}", path.display()))?;
        println!("# {}", path.display());
        for (idx, raw) in data.split(|b| *b == b'\n').enumerate() {
            let line = String::from_utf8_lossy(raw);
            match LogRecord::decode(&line) {
                Ok(Some(record)) => println!("{:>6} tx={} {record:?}", idx + 1, record.txn()),
                Ok(None) => {}
                Err(err) => println!("{:>6} malformed: {err}", idx + 1),
            }
        }
    }
    Ok(())
}

/// Verifies the snapshot parses and every log line replays.
fn db_check(db: &Path) -> anyhow::Result<()> {
    let snapshot_path = db.join(layerkv::snapshot::SNAPSHOT_FILE_NAME);
    let base = layerkv::snapshot::load(&snapshot_path)?
        .with_context(|| format!("missing snapshot: {}", snapshot_path.display()))?;

    let mut replayer = layerkv::wal::Replayer::new();
    let mut malformed = 0usize;
    for name in [LOG_FILE_NAME, LOG_NEXT_FILE_NAME] {
        let path = db.join(name);
        if !path.exists() {
            continue;
        }
        if name == LOG_NEXT_FILE_NAME {
            let recovered = replayer.finish();
            replayer = layerkv::wal::Replayer::resume(recovered.buffer, recovered.version);
        }
        let data = std::fs::read(&path).with_context(|| format!("read {}", path.display()))?;
        for (idx, raw) in data.split(|b| *b == b'\n').enumerate() {
            if let Err(err) = replayer.apply_line(&String::from_utf8_lossy(raw)) {
                malformed += 1;
                println!("malformed {}:{} {err}", path.display(), idx + 1);
            }
        }
    }

    let recovered = replayer.finish();
    if malformed > 0 {
        anyhow::bail!("db_check found {malformed} malformed log records");
    }
    println!(
        "db_check ok keys={} pending={} version={} in_flight={}",
        base.len(),
        recovered.buffer.len(),
        recovered.version,
        recovered.in_flight.len()
    );
    Ok(())
}

fn bench(db: &Path, options: DbOptions, keys: usize) -> anyhow::Result<()> {
    let db = Db::open(db, options)?;

    let start = std::time::Instant::now();
    for i in 0..keys {
        let key = format!("k{:08}", i);
        let val = format!("v{:08}", i);
        db.put(&key, &val, TxnId::MAIN)?;
    }
    db.flush()?;
    let write_elapsed = start.elapsed();

    let start = std::time::Instant::now();
    for i in 0..keys {
        let key = format!("k{:08}", i);
        let _ = db.get(&key, TxnId::MAIN)?;
    }
    let read_elapsed = start.elapsed();

    let start = std::time::Instant::now();
    db.checkpoint()?;
    let checkpoint_elapsed = start.elapsed();

    let write_qps = keys as f64 / write_elapsed.as_secs_f64();
    let read_qps = keys as f64 / read_elapsed.as_secs_f64();
    println!("bench keys={keys}");
    println!("write elapsed={write_elapsed:?} qps={write_qps:.0}");
    println!("read elapsed={read_elapsed:?} qps={read_qps:.0}");
    println!("checkpoint elapsed={checkpoint_elapsed:?}");
    Ok(())
}
