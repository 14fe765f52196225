use serde::{Deserialize, Serialize};

use crate::{ContextId, LogPosition, ShardId, TableId, TrackId};

/// How a shard stores its data.
///
/// `Normal` shards serialize their memo chunk into immutable file chunks once
/// it grows past the configured chunk size. `Log` shards instead behave as a
/// bounded rolling window: the oldest entries are dropped when the memo chunk
/// exceeds the cap, and nothing is ever written to a file chunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    Normal,
    Log,
}

impl StorageType {
    /// Single-byte tag used in the TOC.
    pub fn as_byte(self) -> u8 {
        match self {
            StorageType::Normal => b'n',
            StorageType::Log => b'l',
        }
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            b'n' => Some(StorageType::Normal),
            b'l' => Some(StorageType::Log),
            _ => None,
        }
    }
}

impl Default for StorageType {
    fn default() -> Self {
        StorageType::Normal
    }
}

/// Static description of a shard, as handed down by the control plane.
///
/// `first_key` is inclusive, `last_key` exclusive; an empty key means
/// unbounded on that side.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardSpec {
    pub context_id: ContextId,
    pub table_id: TableId,
    pub shard_id: ShardId,
    pub track_id: TrackId,
    #[serde(with = "serde_bytes_vec")]
    pub first_key: Vec<u8>,
    #[serde(with = "serde_bytes_vec")]
    pub last_key: Vec<u8>,
    pub use_bloom_filter: bool,
    pub storage_type: StorageType,
    /// Log position of the shard's creation point.
    #[serde(default)]
    pub created_at: LogPosition,
}

impl ShardSpec {
    /// Range membership with empty keys treated as -inf / +inf.
    pub fn range_contains(&self, key: &[u8]) -> bool {
        range_contains(&self.first_key, &self.last_key, key)
    }
}

/// Shared range check used by shards and file chunk bounds.
pub fn range_contains(first_key: &[u8], last_key: &[u8], key: &[u8]) -> bool {
    if !first_key.is_empty() && key < first_key {
        return false;
    }
    if !last_key.is_empty() && key >= last_key {
        return false;
    }
    true
}

// Keys are raw byte strings; serde's default Vec<u8> handling (a number
// sequence) is fine for the JSON config surface, this module just keeps the
// intent explicit and gives one place to switch representation.
mod serde_bytes_vec {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(v: &[u8], s: S) -> Result<S::Ok, S::Error> {
        v.serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        Vec::<u8>::deserialize(d)
    }
}
