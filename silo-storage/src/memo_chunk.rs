//! In-memory sorted write buffer for one shard.

use std::collections::BTreeMap;

use silo_api_types::{ChunkId, LogPosition};

/// Rough per-entry bookkeeping overhead added to the byte-size estimate.
const ENTRY_OVERHEAD: usize = 32;

/// A buffered mutation: either a value or a delete tombstone.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EntryValue {
    Set(Vec<u8>),
    Delete,
}

impl EntryValue {
    fn size(&self) -> usize {
        match self {
            EntryValue::Set(v) => v.len(),
            EntryValue::Delete => 0,
        }
    }
}

/// Mutable, sorted map of pending writes, together with the range of log
/// records whose effects it contains.
pub struct MemoChunk {
    chunk_id: ChunkId,
    use_bloom_filter: bool,
    entries: BTreeMap<Vec<u8>, EntryValue>,
    size: usize,
    min_log_pos: Option<LogPosition>,
    max_log_pos: Option<LogPosition>,
}

impl MemoChunk {
    pub fn new(chunk_id: ChunkId, use_bloom_filter: bool) -> Self {
        Self {
            chunk_id,
            use_bloom_filter,
            entries: BTreeMap::new(),
            size: 0,
            min_log_pos: None,
            max_log_pos: None,
        }
    }

    pub fn chunk_id(&self) -> ChunkId {
        self.chunk_id
    }

    pub fn use_bloom_filter(&self) -> bool {
        self.use_bloom_filter
    }

    /// Byte-size estimate of the buffered entries.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn num_keys(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &[u8]) -> Option<&EntryValue> {
        self.entries.get(key)
    }

    /// Buffer a value; replaces any earlier entry for the key.
    pub fn set(&mut self, key: &[u8], value: &[u8]) {
        let entry = EntryValue::Set(value.to_vec());
        self.insert(key, entry);
    }

    /// Buffer a delete tombstone for the key.
    pub fn delete(&mut self, key: &[u8]) {
        self.insert(key, EntryValue::Delete);
    }

    fn insert(&mut self, key: &[u8], entry: EntryValue) {
        let added = key.len() + entry.size() + ENTRY_OVERHEAD;
        if let Some(old) = self.entries.insert(key.to_vec(), entry) {
            self.size -= key.len() + old.size() + ENTRY_OVERHEAD;
        }
        self.size += added;
    }

    /// Drop the smallest key. Used by log-type shards, where the memo chunk
    /// is a bounded rolling window.
    pub fn remove_first(&mut self) -> Option<Vec<u8>> {
        let key = self.entries.keys().next().cloned()?;
        let entry = self.entries.remove(&key).unwrap();
        self.size -= key.len() + entry.size() + ENTRY_OVERHEAD;
        Some(key)
    }

    /// Record that the effects of the log record at `pos` are contained in
    /// this chunk.
    pub fn register_log_command(&mut self, pos: LogPosition) {
        if self.min_log_pos.map(|min| pos < min).unwrap_or(true) {
            self.min_log_pos = Some(pos);
        }
        if self.max_log_pos.map(|max| pos > max).unwrap_or(true) {
            self.max_log_pos = Some(pos);
        }
    }

    pub fn min_log_pos(&self) -> Option<LogPosition> {
        self.min_log_pos
    }

    pub fn max_log_pos(&self) -> Option<LogPosition> {
        self.max_log_pos
    }

    /// Key-ordered iteration, used by the chunk serializer.
    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &EntryValue)> {
        self.entries.iter().map(|(k, v)| (k.as_slice(), v))
    }

    pub fn first_key(&self) -> Option<&[u8]> {
        self.entries.keys().next().map(|k| k.as_slice())
    }

    /// Key halfway through the chunk, for split-point selection.
    pub fn midpoint_key(&self) -> Option<&[u8]> {
        self.entries
            .keys()
            .nth(self.entries.len() / 2)
            .map(|k| k.as_slice())
    }

    pub fn last_key(&self) -> Option<&[u8]> {
        self.entries.keys().next_back().map(|k| k.as_slice())
    }

    /// Move all entries at or above `split_key` into a new map, adjusting the
    /// size estimate. Used by shard splits.
    pub fn split_off(&mut self, split_key: &[u8]) -> BTreeMap<Vec<u8>, EntryValue> {
        let moved = self.entries.split_off(split_key);
        for (k, v) in &moved {
            self.size -= k.len() + v.size() + ENTRY_OVERHEAD;
        }
        moved
    }

    /// Install entries moved out of another chunk by [`Self::split_off`].
    pub fn adopt(&mut self, entries: BTreeMap<Vec<u8>, EntryValue>, log_range: Option<(LogPosition, LogPosition)>) {
        for (k, v) in entries {
            self.size += k.len() + v.size() + ENTRY_OVERHEAD;
            self.entries.insert(k, v);
        }
        if let Some((min, max)) = log_range {
            self.register_log_command(min);
            self.register_log_command(max);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_replaces_and_accounts() {
        let mut memo = MemoChunk::new(1, false);
        memo.set(b"a", b"11");
        let size1 = memo.size();
        memo.set(b"a", b"2222");
        assert_eq!(memo.size(), size1 + 2);
        assert_eq!(memo.num_keys(), 1);
        assert_eq!(memo.get(b"a"), Some(&EntryValue::Set(b"2222".to_vec())));
    }

    #[test]
    fn delete_records_tombstone() {
        let mut memo = MemoChunk::new(1, false);
        memo.set(b"a", b"1");
        memo.delete(b"a");
        assert_eq!(memo.get(b"a"), Some(&EntryValue::Delete));
        assert_eq!(memo.num_keys(), 1);
    }

    #[test]
    fn remove_first_is_ordered() {
        let mut memo = MemoChunk::new(1, false);
        memo.set(b"c", b"3");
        memo.set(b"a", b"1");
        memo.set(b"b", b"2");

        assert_eq!(memo.remove_first().unwrap(), b"a".to_vec());
        assert_eq!(memo.remove_first().unwrap(), b"b".to_vec());
        assert_eq!(memo.num_keys(), 1);
    }

    #[test]
    fn log_positions_tracked() {
        let mut memo = MemoChunk::new(1, false);
        memo.register_log_command(LogPosition::new(3, 7));
        memo.register_log_command(LogPosition::new(2, 9));
        memo.register_log_command(LogPosition::new(3, 2));

        assert_eq!(memo.min_log_pos(), Some(LogPosition::new(2, 9)));
        assert_eq!(memo.max_log_pos(), Some(LogPosition::new(3, 7)));
    }

    #[test]
    fn split_off_moves_upper_range() {
        let mut memo = MemoChunk::new(1, false);
        memo.set(b"a", b"1");
        memo.set(b"c", b"3");
        memo.set(b"d", b"4");
        let before = memo.size();

        let moved = memo.split_off(b"c");
        assert_eq!(moved.len(), 2);
        assert_eq!(memo.num_keys(), 1);
        assert!(memo.size() < before);

        let mut other = MemoChunk::new(2, false);
        other.adopt(moved, None);
        assert_eq!(other.num_keys(), 2);
        assert!(other.get(b"c").is_some());
    }
}
