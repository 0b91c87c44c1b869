//! Base snapshot file (`slots.json`): a JSON object of string keys to string
//! values. A new snapshot is always written under [`SNAPSHOT_NEXT_FILE_NAME`]
//! and renamed into place.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::error::{Error, IoContext, Result};
use crate::layer::Base;

pub const SNAPSHOT_FILE_NAME: &str = "slots.json";
pub const SNAPSHOT_NEXT_FILE_NAME: &str = "slots.next.json";

/// Reads a snapshot. Returns `None` if the file does not exist; an empty file
/// is an empty base.
pub fn load(path: &Path) -> Result<Option<Base>> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(Error::io(format!("read snapshot {}", path.display()), err)),
    };
    if data.iter().all(u8::is_ascii_whitespace) {
        return Ok(Some(Base::new()));
    }
    serde_json::from_slice(&data)
        .map(Some)
        .map_err(|source| Error::Snapshot {
            path: path.to_path_buf(),
            source,
        })
}

/// Writes `base` to `path`, truncating any previous content. With `sync` the
/// file is fsynced before returning.
pub fn write(path: &Path, base: &Base, sync: bool) -> Result<()> {
    let file = File::create(path).io_context(|| format!("create snapshot {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer(&mut writer, base).map_err(|source| Error::Snapshot {
        path: path.to_path_buf(),
        source,
    })?;
    writer
        .flush()
        .io_context(|| format!("write snapshot {}", path.display()))?;
    if sync {
        writer
            .get_ref()
            .sync_all()
            .io_context(|| format!("fsync snapshot {}", path.display()))?;
    }
    Ok(())
}

/// Persists renames and creations inside `dir`.
pub fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)
        .and_then(|fd| fd.sync_all())
        .io_context(|| format!("fsync dir {}", dir.display()))
}
