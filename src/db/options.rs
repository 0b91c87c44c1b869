use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DbOptions {
    /// Flush and fsync the log after every appended record instead of only
    /// on [`crate::Db::flush`].
    pub fsync_writes: bool,
    /// fsync the checkpoint's snapshot file and the directory after renames.
    pub sync_checkpoint_files: bool,
    pub log_buffer_bytes: usize,
    pub replay_policy: ReplayPolicy,
    /// The background checkpointer skips ticks while the active log is
    /// smaller than this.
    pub checkpoint_min_log_bytes: u64,
}

impl Default for DbOptions {
    fn default() -> Self {
        Self {
            fsync_writes: false,
            sync_checkpoint_files: true,
            log_buffer_bytes: 64 * 1024,
            replay_policy: ReplayPolicy::SkipMalformed,
            checkpoint_min_log_bytes: 0,
        }
    }
}

/// What recovery does with a log line it cannot apply.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayPolicy {
    /// Log the line and keep replaying.
    #[default]
    SkipMalformed,
    /// Fail `open` with [`crate::Error::MalformedLogRecord`].
    Strict,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let options: DbOptions =
            serde_json::from_str(r#"{"fsync_writes": true, "replay_policy": "strict"}"#).unwrap();
        assert!(options.fsync_writes);
        assert_eq!(options.replay_policy, ReplayPolicy::Strict);
        assert!(options.sync_checkpoint_files);
        assert_eq!(options.log_buffer_bytes, 64 * 1024);
    }
}
