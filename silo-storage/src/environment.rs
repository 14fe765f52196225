//! The storage environment: owner of all shards, chunks and log tracks.
//!
//! All mutating entry points run on the event-loop thread. A `set`/`delete`
//! appends to the shard's log track and mutates the memo chunk in the same
//! critical section; `commit` schedules the durable flush on a job thread.
//! When a memo chunk outgrows the configured chunk size it is frozen and
//! serialized into a file chunk in the background; the TOC is rewritten when
//! the chunk lands. Closed log segments become eligible for archival once no
//! shard's in-memory data refers to them.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, format_err, Error};

use silo_api_types::{
    ChunkId, ContextId, LogPosition, LogSegmentId, ShardId, ShardSpec, StorageType, TableId,
    TrackId, MAX_KEY_SIZE, MAX_VAL_SIZE,
};

use crate::file_chunk::FileChunk;
use crate::jobs::{JobCompletion, JobPool, StorageJob, ARCHIVE_SCRIPT_DELETE};
use crate::log_segment::{LogSegmentWriter, LOG_COMMAND_DELETE, LOG_COMMAND_SET};
use crate::memo_chunk::{EntryValue, MemoChunk};
use crate::page_cache::PageCache;
use crate::recovery;
use crate::shard::StorageShard;
use crate::toc::{self, TocShard};

pub const CHUNK_DIR_NAME: &str = "chunks";
pub const LOG_DIR_NAME: &str = "logs";

/// Storage tuning knobs.
#[derive(Clone, Debug)]
pub struct StorageConfig {
    pub env_path: PathBuf,
    /// Memo chunks above this size are serialized to file chunks (or, for
    /// log-type shards, trimmed from the front).
    pub chunk_size: u64,
    /// Log segments above this size are rotated.
    pub log_segment_size: u64,
    /// Byte budget of the page cache.
    pub page_cache_size: usize,
    /// Worker threads for commit/serialize/write/archive jobs.
    pub num_job_threads: usize,
    /// Archive command template; `$delete` just unlinks the segment.
    pub archive_script: String,
}

impl StorageConfig {
    pub fn new<P: Into<PathBuf>>(env_path: P) -> Self {
        Self {
            env_path: env_path.into(),
            chunk_size: 64 * 1024 * 1024,
            log_segment_size: 64 * 1024 * 1024,
            page_cache_size: 256 * 1024 * 1024,
            num_job_threads: 2,
            archive_script: ARCHIVE_SCRIPT_DELETE.to_string(),
        }
    }
}

/// Result of a read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GetResult {
    Value(Vec<u8>),
    NotFound,
    WrongShard,
    NoShard,
}

/// Result of a write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteResult {
    Done(LogPosition),
    WrongShard,
    NoShard,
}

type CommitCallback = Box<dyn FnOnce(Result<(), String>)>;

pub(crate) struct LogTrack {
    pub(crate) writer: LogSegmentWriter,
    commit_in_flight: bool,
    commit_again: bool,
    inflight_callbacks: Vec<CommitCallback>,
    queued_callbacks: Vec<CommitCallback>,
    /// Rotated-away segments whose last commit has not completed yet.
    closing_segments: Vec<(LogSegmentId, PathBuf)>,
    /// Fully durable closed segments, archival candidates.
    sealed_segments: Vec<(LogSegmentId, PathBuf)>,
}

impl LogTrack {
    fn new(writer: LogSegmentWriter) -> Self {
        Self {
            writer,
            commit_in_flight: false,
            commit_again: false,
            inflight_callbacks: Vec::new(),
            queued_callbacks: Vec::new(),
            closing_segments: Vec::new(),
            sealed_segments: Vec::new(),
        }
    }
}

pub struct StorageEnvironment {
    pub(crate) config: StorageConfig,
    pub(crate) chunk_dir: PathBuf,
    pub(crate) log_dir: PathBuf,
    pub(crate) shards: HashMap<(ContextId, ShardId), StorageShard>,
    pub(crate) file_chunks: HashMap<ChunkId, FileChunk>,
    pub(crate) tracks: HashMap<TrackId, LogTrack>,
    pub(crate) page_cache: PageCache,
    pub(crate) next_chunk_id: ChunkId,
    pub(crate) next_segment_ids: HashMap<TrackId, LogSegmentId>,
    jobs: JobPool,
    fatal: Option<String>,
}

impl StorageEnvironment {
    /// Open (and if necessary recover) a storage environment.
    pub fn open(config: StorageConfig) -> Result<Self, Error> {
        let chunk_dir = config.env_path.join(CHUNK_DIR_NAME);
        let log_dir = config.env_path.join(LOG_DIR_NAME);
        silo_tools::fs::create_path(&config.env_path)?;
        silo_tools::fs::create_path(&chunk_dir)?;
        silo_tools::fs::create_path(&log_dir)?;

        let jobs = JobPool::new(config.num_job_threads.max(1));
        let page_cache = PageCache::new(config.page_cache_size);

        let mut env = Self {
            config,
            chunk_dir,
            log_dir,
            shards: HashMap::new(),
            file_chunks: HashMap::new(),
            tracks: HashMap::new(),
            page_cache,
            next_chunk_id: 1,
            next_segment_ids: HashMap::new(),
            jobs,
            fatal: None,
        };

        let recovered = recovery::try_recovery(&mut env)?;
        if !recovered {
            // fresh environment: persist an empty TOC so the next open
            // recovers instead of re-initializing
            env.write_toc()?;
        }

        Ok(env)
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Set when a background disk write failed; the process should exit.
    pub fn fatal_error(&self) -> Option<&str> {
        self.fatal.as_deref()
    }

    fn set_fatal(&mut self, msg: String) {
        log::error!("fatal storage error: {}", msg);
        if self.fatal.is_none() {
            self.fatal = Some(msg);
        }
    }

    pub fn shard(&self, context_id: ContextId, shard_id: ShardId) -> Option<&StorageShard> {
        self.shards.get(&(context_id, shard_id))
    }

    pub fn shards(&self) -> impl Iterator<Item = &StorageShard> {
        self.shards.values()
    }

    pub fn num_file_chunks(&self) -> usize {
        self.file_chunks.len()
    }

    pub fn page_cache(&self) -> &PageCache {
        &self.page_cache
    }

    /// Total bytes buffered in memo chunks plus resident pages.
    pub fn memory_usage(&self) -> usize {
        self.shards.values().map(|s| s.memory_usage()).sum::<usize>() + self.page_cache.used()
    }

    // ------------------------------------------------------------------
    // shard management
    // ------------------------------------------------------------------

    pub fn create_shard(&mut self, spec: ShardSpec) -> Result<(), Error> {
        let key = (spec.context_id, spec.shard_id);
        if self.shards.contains_key(&key) {
            bail!(
                "shard {}:{} already exists",
                spec.context_id,
                spec.shard_id
            );
        }

        let memo_chunk_id = self.alloc_chunk_id();
        log::debug!(
            "creating shard {}:{} (table {}, track {})",
            spec.context_id,
            spec.shard_id,
            spec.table_id,
            spec.track_id
        );
        self.shards.insert(key, StorageShard::new(spec, memo_chunk_id));
        self.write_toc()
    }

    pub fn delete_shard(&mut self, context_id: ContextId, shard_id: ShardId) -> Result<(), Error> {
        let shard = match self.shards.remove(&(context_id, shard_id)) {
            Some(shard) => shard,
            None => bail!("no such shard {}:{}", context_id, shard_id),
        };

        for chunk_id in shard.chunk_ids() {
            if !self.is_chunk_referenced(*chunk_id) {
                self.drop_file_chunk(*chunk_id);
            }
        }

        self.write_toc()
    }

    fn is_chunk_referenced(&self, chunk_id: ChunkId) -> bool {
        self.shards
            .values()
            .any(|shard| shard.chunk_ids().contains(&chunk_id))
    }

    fn drop_file_chunk(&mut self, chunk_id: ChunkId) {
        if let Some(chunk) = self.file_chunks.remove(&chunk_id) {
            chunk.remove_pages_from_cache(&mut self.page_cache);
            if let Err(err) = std::fs::remove_file(chunk.filename()) {
                log::warn!(
                    "unable to delete chunk file {:?} - {}",
                    chunk.filename(),
                    err
                );
            }
        }
    }

    /// Range split in place: the source keeps `[first, splitKey)`, the new
    /// shard takes `[splitKey, last)` and shares the source's file chunks by
    /// reference.
    pub fn split_shard(
        &mut self,
        context_id: ContextId,
        shard_id: ShardId,
        new_shard_id: ShardId,
        split_key: &[u8],
    ) -> Result<(), Error> {
        if self.shards.contains_key(&(context_id, new_shard_id)) {
            bail!("shard {}:{} already exists", context_id, new_shard_id);
        }
        let new_memo_id = self.alloc_chunk_id();

        let source = self
            .shards
            .get_mut(&(context_id, shard_id))
            .ok_or_else(|| format_err!("no such shard {}:{}", context_id, shard_id))?;
        if split_key.is_empty() || !source.spec.range_contains(split_key) {
            bail!("split key outside shard range");
        }
        if source.spec.first_key.as_slice() == split_key {
            bail!("split key equals shard first key");
        }

        let mut new_spec = source.spec.clone();
        new_spec.shard_id = new_shard_id;
        new_spec.first_key = split_key.to_vec();

        let mut new_memo = MemoChunk::new(new_memo_id, new_spec.use_bloom_filter);
        let moved = source.memo_mut().split_off(split_key);
        let log_range = source
            .memo()
            .min_log_pos()
            .zip(source.memo().max_log_pos());
        new_memo.adopt(moved, log_range);

        let new_shard = StorageShard::from_parts(
            new_spec,
            new_memo,
            source.share_frozen(),
            source.chunk_ids().to_vec(),
            source.recovery_pos(),
        );
        source.spec.last_key = split_key.to_vec();

        log::debug!(
            "split shard {}:{} at key {:?} into {}:{}",
            context_id,
            shard_id,
            String::from_utf8_lossy(split_key),
            context_id,
            new_shard_id
        );

        self.shards.insert((context_id, new_shard_id), new_shard);
        self.write_toc()
    }

    /// Split-point suggestion for the control plane: the midpoint of the
    /// newest file chunk, or of the memo chunk when no file chunk exists.
    pub fn shard_midpoint(&self, context_id: ContextId, shard_id: ShardId) -> Option<Vec<u8>> {
        let shard = self.shards.get(&(context_id, shard_id))?;
        if let Some(chunk_id) = shard.chunk_ids().last() {
            if let Some(chunk) = self.file_chunks.get(chunk_id) {
                let midpoint = chunk.midpoint();
                if shard.range_contains(midpoint) {
                    return Some(midpoint.to_vec());
                }
            }
        }
        shard.memo().midpoint_key().map(|k| k.to_vec())
    }

    /// Resolve a shard by table and key, for records whose shard was split
    /// or migrated since they were logged.
    pub fn shard_by_key(
        &self,
        context_id: ContextId,
        table_id: TableId,
        key: &[u8],
    ) -> Option<(ContextId, ShardId)> {
        self.shards
            .values()
            .find(|shard| {
                shard.spec.context_id == context_id
                    && shard.spec.table_id == table_id
                    && shard.range_contains(key)
            })
            .map(|shard| (shard.spec.context_id, shard.spec.shard_id))
    }

    // ------------------------------------------------------------------
    // reads and writes
    // ------------------------------------------------------------------

    pub fn get(
        &mut self,
        context_id: ContextId,
        shard_id: ShardId,
        key: &[u8],
    ) -> Result<GetResult, Error> {
        let shard = match self.shards.get(&(context_id, shard_id)) {
            Some(shard) => shard,
            None => return Ok(GetResult::NoShard),
        };
        if !shard.range_contains(key) {
            return Ok(GetResult::WrongShard);
        }

        if let Some(entry) = shard.get_memo(key) {
            return Ok(match entry {
                EntryValue::Set(value) => GetResult::Value(value.clone()),
                EntryValue::Delete => GetResult::NotFound,
            });
        }

        // newest chunk wins
        let chunk_ids: Vec<ChunkId> = shard.chunk_ids().iter().rev().copied().collect();
        let mut found = None;
        for chunk_id in chunk_ids {
            let chunk = self
                .file_chunks
                .get_mut(&chunk_id)
                .ok_or_else(|| format_err!("chunk {} missing from environment", chunk_id))?;
            if let Some(entry) = chunk.get(key, &mut self.page_cache)? {
                found = Some(entry);
                break;
            }
        }
        self.apply_cache_evictions();

        Ok(match found {
            Some(EntryValue::Set(value)) => GetResult::Value(value),
            Some(EntryValue::Delete) | None => GetResult::NotFound,
        })
    }

    pub fn set(
        &mut self,
        context_id: ContextId,
        shard_id: ShardId,
        key: &[u8],
        value: &[u8],
    ) -> Result<WriteResult, Error> {
        if key.is_empty() || key.len() > MAX_KEY_SIZE {
            bail!("invalid key size {}", key.len());
        }
        if value.len() > MAX_VAL_SIZE {
            bail!("invalid value size {}", value.len());
        }
        self.write(context_id, shard_id, LOG_COMMAND_SET, key, Some(value))
    }

    pub fn delete(
        &mut self,
        context_id: ContextId,
        shard_id: ShardId,
        key: &[u8],
    ) -> Result<WriteResult, Error> {
        if key.is_empty() || key.len() > MAX_KEY_SIZE {
            bail!("invalid key size {}", key.len());
        }
        if let Some(shard) = self.shards.get(&(context_id, shard_id)) {
            if shard.spec.storage_type == StorageType::Log {
                bail!("delete on log-type shard {}:{}", context_id, shard_id);
            }
        }
        self.write(context_id, shard_id, LOG_COMMAND_DELETE, key, None)
    }

    fn write(
        &mut self,
        context_id: ContextId,
        shard_id: ShardId,
        op: u8,
        key: &[u8],
        value: Option<&[u8]>,
    ) -> Result<WriteResult, Error> {
        if let Some(fatal) = &self.fatal {
            bail!("storage environment is failed: {}", fatal);
        }

        let shard = match self.shards.get(&(context_id, shard_id)) {
            Some(shard) => shard,
            None => return Ok(WriteResult::NoShard),
        };
        if !shard.range_contains(key) {
            return Ok(WriteResult::WrongShard);
        }
        let track_id = shard.spec.track_id;
        let storage_type = shard.spec.storage_type;

        self.ensure_track(track_id)?;
        self.maybe_rotate_track(track_id)?;

        let track = self.tracks.get_mut(&track_id).unwrap();
        let pos = track.writer.append(context_id, shard_id, op, key, value);

        let chunk_size = self.config.chunk_size;
        let shard = self.shards.get_mut(&(context_id, shard_id)).unwrap();
        match op {
            LOG_COMMAND_SET => shard.memo_mut().set(key, value.unwrap()),
            _ => shard.memo_mut().delete(key),
        }
        shard.memo_mut().register_log_command(pos);

        if storage_type == StorageType::Log {
            // rolling window: drop oldest entries instead of serializing
            while shard.memo().size() as u64 > chunk_size {
                shard.memo_mut().remove_first();
            }
        } else if shard.memo().size() as u64 > chunk_size {
            self.promote_memo_chunk(context_id, shard_id);
        }

        Ok(WriteResult::Done(pos))
    }

    /// Freeze the active memo chunk and serialize it in the background.
    fn promote_memo_chunk(&mut self, context_id: ContextId, shard_id: ShardId) {
        let fresh_id = self.alloc_chunk_id();
        let shard = self.shards.get_mut(&(context_id, shard_id)).unwrap();
        let fresh = MemoChunk::new(fresh_id, shard.spec.use_bloom_filter);
        let frozen = shard.push_memo_chunk(fresh);

        log::debug!(
            "serializing chunk {} of shard {}:{}, size {}",
            frozen.chunk_id(),
            context_id,
            shard_id,
            frozen.size()
        );
        self.jobs.execute(StorageJob::SerializeChunk {
            context_id,
            shard_id,
            memo: frozen,
        });
    }

    pub(crate) fn alloc_chunk_id(&mut self) -> ChunkId {
        let id = self.next_chunk_id;
        self.next_chunk_id += 1;
        id
    }

    // ------------------------------------------------------------------
    // log tracks and commits
    // ------------------------------------------------------------------

    fn ensure_track(&mut self, track_id: TrackId) -> Result<(), Error> {
        if self.tracks.contains_key(&track_id) {
            return Ok(());
        }
        let segment_id = *self.next_segment_ids.get(&track_id).unwrap_or(&1);
        let writer = LogSegmentWriter::create(&self.log_dir, track_id, segment_id)?;
        self.next_segment_ids.insert(track_id, segment_id + 1);
        self.tracks.insert(track_id, LogTrack::new(writer));
        Ok(())
    }

    /// Rotate to a fresh segment when the active one is over the size cap or
    /// a commit is in flight on it. Only possible while no records are
    /// buffered; buffered records belong to the current segment.
    fn maybe_rotate_track(&mut self, track_id: TrackId) -> Result<(), Error> {
        let needs_rotate = {
            let track = self.tracks.get(&track_id).unwrap();
            !track.writer.has_uncommitted()
                && (track.commit_in_flight
                    || track.writer.size() > self.config.log_segment_size)
        };
        if !needs_rotate {
            return Ok(());
        }

        let segment_id = *self.next_segment_ids.get(&track_id).unwrap_or(&1);
        let writer = LogSegmentWriter::create(&self.log_dir, track_id, segment_id)?;
        self.next_segment_ids.insert(track_id, segment_id + 1);

        let track = self.tracks.get_mut(&track_id).unwrap();
        let old = std::mem::replace(&mut track.writer, writer);
        log::debug!(
            "rotated track {} to log segment {}",
            track_id,
            segment_id
        );
        let closed = (old.segment_id(), old.path().to_path_buf());
        if track.commit_in_flight {
            track.closing_segments.push(closed);
        } else {
            track.sealed_segments.push(closed);
            self.maybe_archive_segments(track_id);
        }
        Ok(())
    }

    /// Schedule a durable flush of everything appended so far on `track_id`.
    /// The callback fires on the event-loop thread after the fsync.
    pub fn commit(&mut self, track_id: TrackId, on_complete: CommitCallback) {
        if let Some(fatal) = &self.fatal {
            on_complete(Err(fatal.clone()));
            return;
        }
        let track = match self.tracks.get_mut(&track_id) {
            Some(track) => track,
            None => {
                // nothing was ever written on this track
                on_complete(Ok(()));
                return;
            }
        };

        track.queued_callbacks.push(on_complete);
        if track.commit_in_flight {
            track.commit_again = true;
            return;
        }
        self.start_commit(track_id);
    }

    fn start_commit(&mut self, track_id: TrackId) {
        let track = self.tracks.get_mut(&track_id).unwrap();
        debug_assert!(!track.commit_in_flight);

        let block = match track.writer.seal_block() {
            Some(block) => block,
            None => {
                // everything already durable
                for cb in track.queued_callbacks.drain(..) {
                    cb(Ok(()));
                }
                track.commit_again = false;
                return;
            }
        };

        let file = match track.writer.file_clone() {
            Ok(file) => file,
            Err(err) => {
                let msg = format!("unable to clone log segment handle - {}", err);
                for cb in track.queued_callbacks.drain(..) {
                    cb(Err(msg.clone()));
                }
                self.set_fatal(msg);
                return;
            }
        };

        track.commit_in_flight = true;
        track.commit_again = false;
        track.inflight_callbacks = std::mem::take(&mut track.queued_callbacks);
        let segment_id = track.writer.segment_id();
        self.jobs.execute(StorageJob::Commit {
            track_id,
            segment_id,
            file,
            block,
        });
    }

    /// Synchronous commit, used by recovery-time writes and tests.
    pub fn commit_sync(&mut self, track_id: TrackId) -> Result<(), Error> {
        if let Some(track) = self.tracks.get_mut(&track_id) {
            track.writer.commit_sync()?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // job completions
    // ------------------------------------------------------------------

    /// Notified whenever a background job completes.
    pub fn job_notifier(&self) -> Arc<tokio::sync::Notify> {
        self.jobs.notifier()
    }

    /// Drain and apply all available job completions. Returns how many were
    /// processed.
    pub fn poll_completions(&mut self) -> Result<usize, Error> {
        let mut processed = 0;
        while let Some(completion) = self.jobs.try_completion() {
            self.apply_completion(completion)?;
            processed += 1;
        }
        Ok(processed)
    }

    /// Block until all in-flight jobs have completed and been applied.
    pub fn wait_jobs_idle(&mut self) -> Result<(), Error> {
        loop {
            self.poll_completions()?;
            if self.jobs.in_flight() == 0 {
                return Ok(());
            }
            if let Some(completion) = self.jobs.wait_completion(Duration::from_secs(30)) {
                self.apply_completion(completion)?;
            } else {
                bail!("timed out waiting for storage jobs");
            }
        }
    }

    fn apply_completion(&mut self, completion: JobCompletion) -> Result<(), Error> {
        match completion {
            JobCompletion::Commit {
                track_id,
                segment_id,
                result,
            } => self.on_commit_complete(track_id, segment_id, result),
            JobCompletion::ChunkSerialized {
                context_id,
                shard_id,
                result,
            } => self.on_chunk_serialized(context_id, shard_id, result),
            JobCompletion::ChunkWritten {
                context_id,
                shard_id,
                result,
            } => self.on_chunk_written(context_id, shard_id, result),
            JobCompletion::SegmentArchived {
                track_id,
                segment_id,
                result,
            } => {
                match result {
                    Ok(()) => log::info!("archived log segment {} of track {}", segment_id, track_id),
                    Err(err) => log::error!(
                        "archiving log segment {} of track {} failed - {}",
                        segment_id,
                        track_id,
                        err
                    ),
                }
                Ok(())
            }
            JobCompletion::MemoChunkDeleted { chunk_id } => {
                log::debug!("deleted memo chunk {}", chunk_id);
                Ok(())
            }
        }
    }

    fn on_commit_complete(
        &mut self,
        track_id: TrackId,
        segment_id: LogSegmentId,
        result: Result<(), Error>,
    ) -> Result<(), Error> {
        let callback_result = match &result {
            Ok(()) => Ok(()),
            Err(err) => {
                let msg = format!(
                    "commit of log segment {} on track {} failed - {}",
                    segment_id, track_id, err
                );
                self.set_fatal(msg.clone());
                Err(msg)
            }
        };

        let track = self.tracks.get_mut(&track_id).unwrap();
        track.commit_in_flight = false;
        for cb in track.inflight_callbacks.drain(..) {
            cb(callback_result.clone());
        }

        // the committed segment may have been rotated away meanwhile
        if segment_id != track.writer.segment_id() {
            if let Some(idx) = track
                .closing_segments
                .iter()
                .position(|(id, _)| *id == segment_id)
            {
                let closed = track.closing_segments.remove(idx);
                track.sealed_segments.push(closed);
            }
        }

        if track.commit_again {
            self.start_commit(track_id);
        }
        self.maybe_archive_segments(track_id);
        Ok(())
    }

    fn on_chunk_serialized(
        &mut self,
        context_id: ContextId,
        shard_id: ShardId,
        result: Result<Box<crate::chunk_writer::SerializedFileChunk>, Error>,
    ) -> Result<(), Error> {
        let chunk = match result {
            Ok(chunk) => chunk,
            Err(err) => {
                self.set_fatal(format!(
                    "serializing memo chunk of shard {}:{} failed - {}",
                    context_id, shard_id, err
                ));
                return Ok(());
            }
        };
        self.jobs.execute(StorageJob::WriteChunk {
            context_id,
            shard_id,
            chunk,
            chunk_dir: self.chunk_dir.clone(),
        });
        Ok(())
    }

    fn on_chunk_written(
        &mut self,
        context_id: ContextId,
        shard_id: ShardId,
        result: Result<(Box<crate::chunk_writer::SerializedFileChunk>, PathBuf), Error>,
    ) -> Result<(), Error> {
        let (chunk, path) = match result {
            Ok(done) => done,
            Err(err) => {
                // no retry for disk errors; escalate
                self.set_fatal(format!(
                    "writing chunk file of shard {}:{} failed - {}",
                    context_id, shard_id, err
                ));
                return Ok(());
            }
        };

        let chunk_id = chunk.header.chunk_id;
        let file_chunk = chunk.into_file_chunk(path);

        // every shard that held the frozen memo (the source and any splits)
        // now references the file chunk instead
        let mut referenced = false;
        let mut frozen_refs = Vec::new();
        for shard in self.shards.values_mut() {
            if let Some(frozen) = shard.remove_frozen(chunk_id) {
                shard.add_chunk(chunk_id);
                referenced = true;
                frozen_refs.push(frozen);
            }
        }
        // tearing down a large memo chunk is worker-thread business
        for frozen in frozen_refs {
            self.jobs.execute(StorageJob::DeleteMemoChunk { memo: frozen });
        }

        if !referenced {
            // owning shard was deleted while the chunk was being written
            log::debug!("dropping unreferenced chunk {}", chunk_id);
            let _ = std::fs::remove_file(file_chunk.filename());
            return Ok(());
        }

        file_chunk.add_pages_to_cache(&mut self.page_cache);
        self.file_chunks.insert(chunk_id, file_chunk);
        self.apply_cache_evictions();

        self.write_toc()?;

        let track_ids: Vec<TrackId> = self.tracks.keys().copied().collect();
        for track_id in track_ids {
            self.maybe_archive_segments(track_id);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // TOC and archival
    // ------------------------------------------------------------------

    pub(crate) fn toc_shards(&self) -> Vec<TocShard> {
        let mut shards: Vec<TocShard> = self
            .shards
            .values()
            .map(|shard| TocShard {
                spec: shard.spec.clone(),
                chunk_ids: shard.chunk_ids().to_vec(),
            })
            .collect();
        shards.sort_by_key(|s| (s.spec.context_id, s.spec.shard_id));
        shards
    }

    pub(crate) fn write_toc(&mut self) -> Result<(), Error> {
        toc::write(&self.config.env_path, &self.toc_shards())
    }

    /// Hand closed segments no shard still needs to the archive job.
    fn maybe_archive_segments(&mut self, track_id: TrackId) {
        let min_needed: Option<LogSegmentId> = self
            .shards
            .values()
            .filter(|shard| shard.spec.track_id == track_id)
            .filter_map(|shard| shard.min_unflushed_log_pos())
            .map(|pos| pos.segment_id)
            .min();

        let track = match self.tracks.get_mut(&track_id) {
            Some(track) => track,
            None => return,
        };

        let mut eligible = Vec::new();
        track.sealed_segments.retain(|(segment_id, path)| {
            let needed = min_needed.map(|min| min <= *segment_id).unwrap_or(false);
            if needed {
                true
            } else {
                eligible.push((*segment_id, path.clone()));
                false
            }
        });

        for (segment_id, path) in eligible {
            log::debug!(
                "log segment {} of track {} is eligible for archival",
                segment_id,
                track_id
            );
            self.jobs.execute(StorageJob::ArchiveLogSegment {
                track_id,
                segment_id,
                path,
                script: self.config.archive_script.clone(),
            });
        }
    }

    pub(crate) fn apply_cache_evictions(&mut self) {
        for key in self.page_cache.take_evictions() {
            if let Some(chunk) = self.file_chunks.get_mut(&key.chunk_id) {
                chunk.on_page_evicted(key.kind);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(name: &str) -> StorageConfig {
        let dir = std::env::temp_dir().join(name);
        let _ = std::fs::remove_dir_all(&dir);
        StorageConfig::new(dir)
    }

    fn spec(context_id: ContextId, shard_id: ShardId) -> ShardSpec {
        ShardSpec {
            context_id,
            table_id: 1,
            shard_id,
            track_id: 0,
            first_key: vec![],
            last_key: vec![],
            use_bloom_filter: true,
            storage_type: StorageType::Normal,
            created_at: LogPosition::ZERO,
        }
    }

    fn cleanup(config: &StorageConfig) {
        let _ = std::fs::remove_dir_all(&config.env_path);
    }

    #[test]
    fn set_get_delete() {
        let config = test_config(".silo-test-env-basic");
        let mut env = StorageEnvironment::open(config.clone()).unwrap();
        env.create_shard(spec(1, 1)).unwrap();

        assert!(matches!(
            env.set(1, 1, b"alpha", b"1").unwrap(),
            WriteResult::Done(_)
        ));
        assert_eq!(
            env.get(1, 1, b"alpha").unwrap(),
            GetResult::Value(b"1".to_vec())
        );
        assert_eq!(env.get(1, 1, b"beta").unwrap(), GetResult::NotFound);
        assert_eq!(env.get(1, 9, b"alpha").unwrap(), GetResult::NoShard);

        env.delete(1, 1, b"alpha").unwrap();
        assert_eq!(env.get(1, 1, b"alpha").unwrap(), GetResult::NotFound);

        cleanup(&config);
    }

    #[test]
    fn wrong_shard_detected() {
        let config = test_config(".silo-test-env-range");
        let mut env = StorageEnvironment::open(config.clone()).unwrap();
        let mut bounded = spec(1, 1);
        bounded.first_key = b"b".to_vec();
        bounded.last_key = b"m".to_vec();
        env.create_shard(bounded).unwrap();

        assert_eq!(env.get(1, 1, b"a").unwrap(), GetResult::WrongShard);
        assert_eq!(env.get(1, 1, b"m").unwrap(), GetResult::WrongShard);
        assert_eq!(
            env.set(1, 1, b"a", b"x").unwrap(),
            WriteResult::WrongShard
        );
        assert!(matches!(
            env.set(1, 1, b"c", b"x").unwrap(),
            WriteResult::Done(_)
        ));

        cleanup(&config);
    }

    #[test]
    fn commit_callback_fires() {
        let config = test_config(".silo-test-env-commit");
        let mut env = StorageEnvironment::open(config.clone()).unwrap();
        env.create_shard(spec(1, 1)).unwrap();
        env.set(1, 1, b"a", b"1").unwrap();

        let fired = std::rc::Rc::new(std::cell::Cell::new(false));
        let flag = fired.clone();
        env.commit(0, Box::new(move |result| {
            assert!(result.is_ok());
            flag.set(true);
        }));
        env.wait_jobs_idle().unwrap();
        assert!(fired.get());

        cleanup(&config);
    }

    #[test]
    fn memo_chunk_promotion_creates_file_chunk() {
        let mut config = test_config(".silo-test-env-promote");
        config.chunk_size = 16 * 1024;
        let mut env = StorageEnvironment::open(config.clone()).unwrap();
        env.create_shard(spec(1, 1)).unwrap();

        for i in 0..600u32 {
            let key = format!("key-{:06}", i);
            env.set(1, 1, key.as_bytes(), &[b'v'; 48]).unwrap();
        }
        env.commit_sync(0).unwrap();
        env.wait_jobs_idle().unwrap();

        assert!(env.num_file_chunks() >= 1);
        let shard = env.shard(1, 1).unwrap();
        assert!(!shard.chunk_ids().is_empty());
        assert!(shard.frozen_memo_chunks().is_empty());

        // every key still readable, some from file chunks
        for i in 0..600u32 {
            let key = format!("key-{:06}", i);
            assert_eq!(
                env.get(1, 1, key.as_bytes()).unwrap(),
                GetResult::Value(vec![b'v'; 48]),
                "missing {}",
                key
            );
        }

        // TOC lists the chunk
        let toc_bytes = std::fs::read(config.env_path.join(toc::TOC_FILE_NAME)).unwrap();
        let toc_shards = toc::decode(&toc_bytes).unwrap();
        assert_eq!(toc_shards.len(), 1);
        assert!(!toc_shards[0].chunk_ids.is_empty());

        cleanup(&config);
    }

    #[test]
    fn split_shard_partitions_range() {
        let config = test_config(".silo-test-env-split");
        let mut env = StorageEnvironment::open(config.clone()).unwrap();
        env.create_shard(spec(1, 1)).unwrap();

        for key in [b"a", b"b", b"c", b"d"] {
            env.set(1, 1, key, b"v").unwrap();
        }

        env.split_shard(1, 1, 2, b"c").unwrap();

        assert_eq!(env.get(1, 1, b"a").unwrap(), GetResult::Value(b"v".to_vec()));
        assert_eq!(env.get(1, 1, b"c").unwrap(), GetResult::WrongShard);
        assert_eq!(env.get(1, 2, b"c").unwrap(), GetResult::Value(b"v".to_vec()));
        assert_eq!(env.get(1, 2, b"d").unwrap(), GetResult::Value(b"v".to_vec()));
        assert_eq!(env.get(1, 2, b"a").unwrap(), GetResult::WrongShard);

        // split key must be inside the range
        assert!(env.split_shard(1, 1, 3, b"x").is_err());

        cleanup(&config);
    }

    #[test]
    fn log_type_shard_is_rolling_window() {
        let mut config = test_config(".silo-test-env-logshard");
        config.chunk_size = 4 * 1024;
        let mut env = StorageEnvironment::open(config.clone()).unwrap();

        let mut log_spec = spec(1, 1);
        log_spec.storage_type = StorageType::Log;
        log_spec.use_bloom_filter = false;
        env.create_shard(log_spec).unwrap();

        for i in 0..200u32 {
            let key = format!("entry-{:06}", i);
            env.set(1, 1, key.as_bytes(), &[b'x'; 64]).unwrap();
        }

        let shard = env.shard(1, 1).unwrap();
        assert!(shard.memo().size() as u64 <= 4 * 1024 + 256);
        // never serialized to a file chunk
        assert_eq!(env.num_file_chunks(), 0);
        // oldest entries dropped
        assert_eq!(env.get(1, 1, b"entry-000000").unwrap(), GetResult::NotFound);
        assert_eq!(
            env.get(1, 1, b"entry-000199").unwrap(),
            GetResult::Value(vec![b'x'; 64])
        );
        // deletes on log shards are rejected
        assert!(env.delete(1, 1, b"entry-000199").is_err());

        cleanup(&config);
    }
}
