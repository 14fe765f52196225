//! Shard state inside the storage environment.

use std::sync::Arc;

use silo_api_types::{ChunkId, LogPosition, ShardSpec};

use crate::memo_chunk::{EntryValue, MemoChunk};

/// A contiguous key range of one table, with its active memo chunk, any
/// frozen memo chunks still being serialized, and the ordered list of file
/// chunks that hold its older data.
pub struct StorageShard {
    pub spec: ShardSpec,
    /// Active, mutable memo chunk.
    memo: MemoChunk,
    /// Promoted chunks awaiting serialization, oldest first. Immutable.
    frozen: Vec<Arc<MemoChunk>>,
    /// File chunk ids, ascending; newer chunks override older ones.
    chunk_ids: Vec<ChunkId>,
    /// Highest log position known durable in a file chunk; replay skips
    /// records at or below this.
    recovery_pos: LogPosition,
}

impl StorageShard {
    pub fn new(spec: ShardSpec, memo_chunk_id: ChunkId) -> Self {
        let use_bloom = spec.use_bloom_filter;
        Self {
            spec,
            memo: MemoChunk::new(memo_chunk_id, use_bloom),
            frozen: Vec::new(),
            chunk_ids: Vec::new(),
            recovery_pos: LogPosition::ZERO,
        }
    }

    /// Assemble a shard from existing pieces; used when splitting, where the
    /// new shard shares the source's frozen memo chunks and file chunks.
    pub(crate) fn from_parts(
        spec: ShardSpec,
        memo: MemoChunk,
        frozen: Vec<Arc<MemoChunk>>,
        chunk_ids: Vec<ChunkId>,
        recovery_pos: LogPosition,
    ) -> Self {
        Self {
            spec,
            memo,
            frozen,
            chunk_ids,
            recovery_pos,
        }
    }

    pub(crate) fn share_frozen(&self) -> Vec<Arc<MemoChunk>> {
        self.frozen.clone()
    }

    pub fn range_contains(&self, key: &[u8]) -> bool {
        self.spec.range_contains(key)
    }

    pub fn memo(&self) -> &MemoChunk {
        &self.memo
    }

    pub fn memo_mut(&mut self) -> &mut MemoChunk {
        &mut self.memo
    }

    /// Replace the active memo chunk with a fresh one and freeze the old one
    /// for serialization. Returns the frozen chunk.
    pub fn push_memo_chunk(&mut self, fresh: MemoChunk) -> Arc<MemoChunk> {
        let old = std::mem::replace(&mut self.memo, fresh);
        let old = Arc::new(old);
        self.frozen.push(old.clone());
        old
    }

    pub fn frozen_memo_chunks(&self) -> &[Arc<MemoChunk>] {
        &self.frozen
    }

    /// Drop a frozen chunk once its file chunk is durable and in the TOC.
    pub fn remove_frozen(&mut self, chunk_id: ChunkId) -> Option<Arc<MemoChunk>> {
        let idx = self.frozen.iter().position(|c| c.chunk_id() == chunk_id)?;
        Some(self.frozen.remove(idx))
    }

    pub fn chunk_ids(&self) -> &[ChunkId] {
        &self.chunk_ids
    }

    pub fn add_chunk(&mut self, chunk_id: ChunkId) {
        debug_assert!(self.chunk_ids.last().map_or(true, |last| *last < chunk_id));
        self.chunk_ids.push(chunk_id);
    }

    pub fn set_chunks(&mut self, mut chunk_ids: Vec<ChunkId>) {
        chunk_ids.sort_unstable();
        self.chunk_ids = chunk_ids;
    }

    pub fn remove_chunk(&mut self, chunk_id: ChunkId) {
        self.chunk_ids.retain(|id| *id != chunk_id);
    }

    pub fn recovery_pos(&self) -> LogPosition {
        self.recovery_pos
    }

    pub fn set_recovery_pos(&mut self, pos: LogPosition) {
        self.recovery_pos = pos;
    }

    /// Look up `key` in the in-memory portion: active memo first, then
    /// frozen chunks newest-first. `None` means "consult the file chunks".
    pub fn get_memo(&self, key: &[u8]) -> Option<&EntryValue> {
        if let Some(entry) = self.memo.get(key) {
            return Some(entry);
        }
        for frozen in self.frozen.iter().rev() {
            if let Some(entry) = frozen.get(key) {
                return Some(entry);
            }
        }
        None
    }

    /// Smallest log position still only in memory (active or frozen memo).
    /// Log segments above this are not needed by this shard anymore.
    pub fn min_unflushed_log_pos(&self) -> Option<LogPosition> {
        let mut min: Option<LogPosition> = self.memo.min_log_pos();
        for frozen in &self.frozen {
            if let Some(pos) = frozen.min_log_pos() {
                if min.map(|m| pos < m).unwrap_or(true) {
                    min = Some(pos);
                }
            }
        }
        min
    }

    /// Total bytes buffered in memory for this shard.
    pub fn memory_usage(&self) -> usize {
        self.memo.size() + self.frozen.iter().map(|c| c.size()).sum::<usize>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use silo_api_types::StorageType;

    fn spec() -> ShardSpec {
        ShardSpec {
            context_id: 1,
            table_id: 1,
            shard_id: 1,
            track_id: 0,
            first_key: vec![],
            last_key: vec![],
            use_bloom_filter: false,
            storage_type: StorageType::Normal,
            created_at: LogPosition::ZERO,
        }
    }

    #[test]
    fn memo_lookup_prefers_newer() {
        let mut shard = StorageShard::new(spec(), 1);
        shard.memo_mut().set(b"k", b"old");
        shard.push_memo_chunk(MemoChunk::new(2, false));
        assert_eq!(
            shard.get_memo(b"k"),
            Some(&EntryValue::Set(b"old".to_vec()))
        );

        // newer write in the active memo shadows the frozen one
        shard.memo_mut().set(b"k", b"new");
        assert_eq!(
            shard.get_memo(b"k"),
            Some(&EntryValue::Set(b"new".to_vec()))
        );
    }

    #[test]
    fn min_unflushed_considers_frozen() {
        let mut shard = StorageShard::new(spec(), 1);
        shard.memo_mut().set(b"a", b"1");
        shard.memo_mut().register_log_command(LogPosition::new(2, 5));
        shard.push_memo_chunk(MemoChunk::new(2, false));
        shard.memo_mut().set(b"b", b"2");
        shard.memo_mut().register_log_command(LogPosition::new(3, 1));

        assert_eq!(shard.min_unflushed_log_pos(), Some(LogPosition::new(2, 5)));

        let frozen_id = shard.frozen_memo_chunks()[0].chunk_id();
        shard.remove_frozen(frozen_id).unwrap();
        assert_eq!(shard.min_unflushed_log_pos(), Some(LogPosition::new(3, 1)));
    }
}
