//! Log replay.
//!
//! Rebuilds the main timeline's pending buffer and the version counter from a
//! sequence of log lines. Each line either applies completely or is rejected
//! with a [`ReplayError`] and has no effect; the caller decides whether a
//! rejected line aborts recovery or is skipped.

use crate::layer::Layer;
use crate::txn::{TxnId, TRANSACTION_COUNT};
use crate::wal::codec::{CodecError, LogRecord};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReplayError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("transaction {0} is not active")]
    NotActive(TxnId),

    #[error("transaction {0} is already active")]
    AlreadyActive(TxnId),

    #[error("{0} cannot be applied to the main timeline")]
    MainLifecycle(&'static str),
}

/// State reconstructed by a replay.
#[derive(Debug, Default)]
pub struct Recovered {
    pub buffer: Layer,
    pub version: u64,
    /// Transactions started but neither committed nor rolled back.
    pub in_flight: Vec<TxnId>,
    pub applied: usize,
}

#[derive(Debug)]
pub struct Replayer {
    buffers: Vec<Option<Layer>>,
    version: u64,
    applied: usize,
}

impl Default for Replayer {
    fn default() -> Self {
        Self::new()
    }
}

impl Replayer {
    pub fn new() -> Self {
        Self::resume(Layer::new(), 0)
    }

    /// Continues from a previously recovered main buffer with an empty
    /// transaction table.
    pub fn resume(buffer: Layer, version: u64) -> Self {
        let mut buffers = vec![None; TRANSACTION_COUNT];
        buffers[0] = Some(buffer);
        Self {
            buffers,
            version,
            applied: 0,
        }
    }

    pub fn apply_line(&mut self, line: &str) -> Result<(), ReplayError> {
        match LogRecord::decode(line)? {
            Some(record) => self.apply(record),
            None => Ok(()),
        }
    }

    pub fn apply(&mut self, record: LogRecord) -> Result<(), ReplayError> {
        match record {
            LogRecord::Put {
                key,
                value,
                txn,
                version,
            } => {
                self.active_mut(txn)?.put(key, value);
                self.advance(version);
            }
            LogRecord::Del { key, txn, version } => {
                self.active_mut(txn)?.delete(key);
                self.advance(version);
            }
            LogRecord::Start { txn } => {
                let slot = &mut self.buffers[index(txn)?];
                if slot.is_some() {
                    return Err(ReplayError::AlreadyActive(txn));
                }
                *slot = Some(Layer::new());
            }
            LogRecord::Commit { txn, version } => {
                let layer = self.take(txn, "commit")?;
                if let Some(main) = self.buffers[0].as_mut() {
                    main.merge_from(&layer);
                }
                self.advance(Some(version));
            }
            LogRecord::Rollback { txn } => {
                self.take(txn, "rollback")?;
            }
            LogRecord::Version { version } => self.advance(Some(version)),
        }
        self.applied += 1;
        Ok(())
    }

    pub fn finish(self) -> Recovered {
        let mut buffers = self.buffers.into_iter();
        let buffer = buffers.next().flatten().unwrap_or_default();
        let in_flight = buffers
            .enumerate()
            .filter(|(_, layer)| layer.is_some())
            .map(|(idx, _)| TxnId(idx as u32 + 1))
            .collect();
        Recovered {
            buffer,
            version: self.version,
            in_flight,
            applied: self.applied,
        }
    }

    fn active_mut(&mut self, txn: TxnId) -> Result<&mut Layer, ReplayError> {
        self.buffers[index(txn)?]
            .as_mut()
            .ok_or(ReplayError::NotActive(txn))
    }

    fn take(&mut self, txn: TxnId, op: &'static str) -> Result<Layer, ReplayError> {
        if txn.is_main() {
            return Err(ReplayError::MainLifecycle(op));
        }
        self.buffers[index(txn)?]
            .take()
            .ok_or(ReplayError::NotActive(txn))
    }

    fn advance(&mut self, version: Option<u64>) {
        if let Some(version) = version {
            self.version = self.version.max(version);
        }
    }
}

fn index(txn: TxnId) -> Result<usize, ReplayError> {
    txn.index().ok_or(ReplayError::NotActive(txn))
}

/// Replays every line, collecting rejected lines (1-based) instead of
/// stopping at the first one.
pub fn replay<'a, I>(lines: I) -> (Recovered, Vec<(usize, ReplayError)>)
where
    I: IntoIterator<Item = &'a str>,
{
    let mut replayer = Replayer::new();
    let mut rejected = Vec::new();
    for (idx, line) in lines.into_iter().enumerate() {
        if let Err(err) = replayer.apply_line(line) {
            rejected.push((idx + 1, err));
        }
    }
    (replayer.finish(), rejected)
}
