//! Response statuses shared with the RPC layer.
//!
//! The network front end translates engine results into one of these codes;
//! the numeric values match the wire enum.

use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum Status {
    Ok = 0,
    KeyNotFound = 1,
    ServerUnavailable = 2,
    OperationFailed = 3,
}

impl Status {
    pub fn of<T>(result: &Result<T>) -> Self {
        match result {
            Ok(_) => Self::Ok,
            Err(err) => err.status(),
        }
    }

    /// Status of a point lookup, where absence is reported as `KeyNotFound`.
    pub fn of_lookup(result: &Result<Option<String>>) -> Self {
        match result {
            Ok(Some(_)) => Self::Ok,
            Ok(None) => Self::KeyNotFound,
            Err(err) => err.status(),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::KeyNotFound => "key not found",
            Self::ServerUnavailable => "server unavailable",
            Self::OperationFailed => "operation failed",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
