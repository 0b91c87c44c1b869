//! `layerkv` is the storage core of a node in a distributed key-value store.
//!
//! The key space lives in memory as a base snapshot plus a chain of immutable
//! layers:
//! - Every mutation is appended to a line-oriented write-ahead log before it
//!   becomes visible.
//! - Up to 15 transactions run concurrently next to the implicit main
//!   transaction, each with a private write buffer merged on commit.
//! - Checkpoints fold the chain into `slots.json` and restart the log while
//!   readers and writers keep going.
//! - Recovery replays the log on top of the last snapshot, including the
//!   files of a checkpoint interrupted by a crash.

pub mod db;
pub mod error;
pub mod layer;
pub mod snapshot;
pub mod status;
pub mod txn;
pub mod wal;

pub use db::{BackgroundCheckpointer, CheckpointerState, Db, DbOptions, ReplayPolicy};
pub use error::{Error, Result};
pub use layer::Base;
pub use status::Status;
pub use txn::{TxnId, TRANSACTION_COUNT};
