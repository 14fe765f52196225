use thiserror::Error;

/// Errors a client of the shard layer can observe.
///
/// Replication-internal conditions (paxos rejections, proposal timeouts,
/// transport drops) never surface here; they are retried internally and only
/// ever degrade into `NoService`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShardError {
    /// No leader is known, or the lease was lost while the request was queued.
    #[error("no service")]
    NoService,

    /// Request rejected by control-plane validation.
    #[error("failed: {0}")]
    Failed(String),

    /// Key absent in the addressed shard.
    #[error("not found")]
    NotFound,

    /// Key outside the addressed shard's range.
    #[error("wrong shard")]
    WrongShard,
}
