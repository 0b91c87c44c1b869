use std::path::PathBuf;

use crate::status::Status;
use crate::txn::TxnId;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid transaction id: {0}")]
    InvalidTransaction(u32),

    #[error("no available transaction id, try again later")]
    NoFreeTransaction,

    #[error("key not found: {0:?}")]
    KeyNotFound(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed log record at {}:{line}: {reason}", file.display())]
    MalformedLogRecord {
        file: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("snapshot {}: {source}", path.display())]
    Snapshot {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl Error {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub(crate) fn invalid_txn(id: TxnId) -> Self {
        Self::InvalidTransaction(id.0)
    }

    /// Retryable conditions are transient: the same call may succeed later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NoFreeTransaction | Self::Io { .. })
    }

    pub fn status(&self) -> Status {
        match self {
            Self::KeyNotFound(_) => Status::KeyNotFound,
            Self::NoFreeTransaction => Status::ServerUnavailable,
            Self::InvalidTransaction(_)
            | Self::Io { .. }
            | Self::MalformedLogRecord { .. }
            | Self::Snapshot { .. } => Status::OperationFailed,
        }
    }
}

/// Attaches a human readable context to `std::io::Result`, mirroring
/// `anyhow::Context` for the crate's typed error.
pub(crate) trait IoContext<T> {
    fn io_context<C, F>(self, f: F) -> Result<T>
    where
        C: Into<String>,
        F: FnOnce() -> C;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn io_context<C, F>(self, f: F) -> Result<T>
    where
        C: Into<String>,
        F: FnOnce() -> C,
    {
        self.map_err(|source| Error::io(f(), source))
    }
}
