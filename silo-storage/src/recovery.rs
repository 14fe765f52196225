//! Crash recovery.
//!
//! Recovery rebuilds the environment from the TOC and the log segments:
//!
//! 1. Read the TOC, preferring a complete `toc.new` (which is then promoted
//!    over `toc`, so a second crash re-enters the same path).
//! 2. Reconstruct every shard, open its file chunks (header pages only) and
//!    compute the per-shard recovery position: the highest log position
//!    already durable in a file chunk.
//! 3. Replay every log track in segment order. Records at or below the
//!    owning shard's recovery position are skipped; keys that no longer fall
//!    into their logged shard are re-resolved by `(context, table, key)`.
//! 4. Between segments, memo chunks over the size threshold are serialized
//!    and written synchronously so replay memory stays bounded.
//! 5. Delete chunk files no shard references.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, Error};

use silo_api_types::{ContextId, LogPosition, ShardId, StorageType, TrackId};

use crate::chunk_writer;
use crate::environment::StorageEnvironment;
use crate::file_chunk::FileChunk;
use crate::log_segment::{
    parse_log_segment_file_name, LogRecord, LogSegmentReader, LOG_COMMAND_DELETE, LOG_COMMAND_SET,
};
use crate::memo_chunk::MemoChunk;
use crate::shard::StorageShard;
use crate::toc::{self, TocShard, TOC_FILE_NAME, TOC_NEW_FILE_NAME};

/// Returns false when there is nothing to recover (fresh environment).
pub(crate) fn try_recovery(env: &mut StorageEnvironment) -> Result<bool, Error> {
    let toc_path = env.config.env_path.join(TOC_FILE_NAME);
    let toc_new_path = env.config.env_path.join(TOC_NEW_FILE_NAME);

    let toc_new = try_read_toc_file(&toc_new_path);
    let shards = match toc_new {
        Ok(Some(shards)) => {
            // toc.new is complete: promote it before replaying anything
            match std::fs::remove_file(&toc_path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => bail!("unable to unlink {:?} - {}", toc_path, err),
            }
            std::fs::rename(&toc_new_path, &toc_path)?;
            shards
        }
        toc_new => {
            let toc_new_present = toc_new.is_err();
            match try_read_toc_file(&toc_path) {
                Ok(Some(shards)) => {
                    let _ = std::fs::remove_file(&toc_new_path);
                    shards
                }
                Ok(None) if !toc_new_present => return Ok(false), // fresh environment
                Ok(None) => bail!("toc.new is corrupt and toc is missing"),
                Err(err) => bail!("unable to read toc (and toc.new) - {}", err),
            }
        }
    };

    log::info!("recovering storage environment, {} shards", shards.len());

    open_shards(env, &shards)?;
    compute_shard_recovery(env);
    replay_log_tracks(env)?;
    delete_orphaned_chunks(env)?;

    log::info!("recovery done");
    Ok(true)
}

/// `Ok(None)` means the file does not exist; a corrupt or truncated file is
/// an `Err` so callers can distinguish fallback from fresh start.
fn try_read_toc_file(path: &Path) -> Result<Option<Vec<TocShard>>, Error> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => bail!("unable to read {:?} - {}", path, err),
    };
    toc::decode(&bytes).map(Some)
}

fn open_shards(env: &mut StorageEnvironment, toc_shards: &[TocShard]) -> Result<(), Error> {
    // open all referenced chunks first; chunks may be shared between shards
    // after a split
    for toc_shard in toc_shards {
        for chunk_id in &toc_shard.chunk_ids {
            if *chunk_id >= env.next_chunk_id {
                env.next_chunk_id = chunk_id + 1;
            }
            if env.file_chunks.contains_key(chunk_id) {
                continue;
            }
            let path = env
                .chunk_dir
                .join(crate::file_chunk::chunk_file_name(*chunk_id));
            let chunk = FileChunk::open(&path)?;
            if chunk.chunk_id() != *chunk_id {
                bail!(
                    "chunk file {:?} carries id {}, expected {}",
                    path,
                    chunk.chunk_id(),
                    chunk_id
                );
            }
            env.file_chunks.insert(*chunk_id, chunk);
        }
    }

    for toc_shard in toc_shards {
        let memo_chunk_id = env.alloc_chunk_id();
        let key = (toc_shard.spec.context_id, toc_shard.spec.shard_id);
        if env.shards.contains_key(&key) {
            bail!("duplicate shard {}:{} in toc", key.0, key.1);
        }
        let mut shard = StorageShard::new(toc_shard.spec.clone(), memo_chunk_id);
        shard.set_chunks(toc_shard.chunk_ids.clone());
        env.shards.insert(key, shard);
    }

    Ok(())
}

/// Per shard, the highest `(segmentID, commandID)` among its file chunks;
/// replay must skip records at or below it.
fn compute_shard_recovery(env: &mut StorageEnvironment) {
    let positions: Vec<((ContextId, ShardId), LogPosition)> = env
        .shards
        .values()
        .map(|shard| {
            let pos = shard
                .chunk_ids()
                .iter()
                .filter_map(|id| env.file_chunks.get(id))
                .map(|chunk| chunk.max_log_pos())
                .max()
                .unwrap_or(LogPosition::ZERO);
            ((shard.spec.context_id, shard.spec.shard_id), pos)
        })
        .collect();

    for (key, pos) in positions {
        env.shards.get_mut(&key).unwrap().set_recovery_pos(pos);
    }
}

fn replay_log_tracks(env: &mut StorageEnvironment) -> Result<(), Error> {
    let mut tracks: BTreeMap<TrackId, Vec<(u64, std::path::PathBuf)>> = BTreeMap::new();
    for path in silo_tools::fs::list_files_with_prefix(&env.log_dir, "log.")? {
        let name = match path.file_name().and_then(|n| n.to_str()) {
            Some(name) => name,
            None => continue,
        };
        if let Some((track_id, segment_id)) = parse_log_segment_file_name(name) {
            tracks.entry(track_id).or_default().push((segment_id, path));
        }
    }

    for (track_id, mut segments) in tracks {
        segments.sort_by_key(|(segment_id, _)| *segment_id);
        log::info!(
            "replaying {} log segments of track {}",
            segments.len(),
            track_id
        );

        let mut max_segment_id = 0;
        for (segment_id, path) in segments {
            replay_log_segment(env, &path)?;
            max_segment_id = segment_id;

            // keep replay memory bounded
            try_write_chunks(env)?;
        }
        env.next_segment_ids.insert(track_id, max_segment_id + 1);
    }

    Ok(())
}

fn replay_log_segment(env: &mut StorageEnvironment, path: &Path) -> Result<(), Error> {
    log::debug!("replaying log segment {:?}", path);
    let started = std::time::Instant::now();

    let mut reader = LogSegmentReader::open(path)?;
    let segment_id = reader.segment_id();
    let mut applied = 0u64;

    reader.replay(false, |record| {
        if apply_record(env, segment_id, record) {
            applied += 1;
        }
        Ok(())
    })?;

    log::debug!(
        "replayed {:?}: {} records applied, elapsed {} ms",
        path,
        applied,
        started.elapsed().as_millis()
    );
    Ok(())
}

/// Apply one replayed record; returns whether it was applied.
fn apply_record(env: &mut StorageEnvironment, segment_id: u64, record: LogRecord) -> bool {
    let pos = LogPosition::new(segment_id, record.command_id);

    let mut key = (record.context_id, record.shard_id);
    let shard = match env.shards.get(&key) {
        Some(shard) => shard,
        None => return false, // shard was deleted
    };

    // shard was split and the key now belongs to another shard
    if !shard.range_contains(&record.key) {
        key = match env.shard_by_key(record.context_id, shard.spec.table_id, &record.key) {
            Some(key) => key,
            None => return false,
        };
    }

    let chunk_size = env.config.chunk_size;
    let shard = env.shards.get_mut(&key).unwrap();

    if pos <= shard.recovery_pos() {
        return false; // already durable in a file chunk
    }

    match record.op {
        LOG_COMMAND_SET => {
            shard.memo_mut().set(&record.key, &record.value.unwrap());
            if shard.spec.storage_type == StorageType::Log {
                while shard.memo().size() as u64 > chunk_size {
                    shard.memo_mut().remove_first();
                }
            }
        }
        LOG_COMMAND_DELETE => {
            if shard.spec.storage_type == StorageType::Log {
                log::warn!(
                    "skipping delete record for log-type shard {}:{} at {}",
                    key.0,
                    key.1,
                    pos
                );
                return false;
            }
            shard.memo_mut().delete(&record.key);
        }
        _ => unreachable!("reader rejects unknown ops"),
    }
    shard.memo_mut().register_log_command(pos);
    true
}

/// Serialize and write any memo chunk over the size threshold, synchronously.
fn try_write_chunks(env: &mut StorageEnvironment) -> Result<(), Error> {
    let oversized: Vec<(ContextId, ShardId)> = env
        .shards
        .values()
        .filter(|shard| shard.spec.storage_type != StorageType::Log)
        .filter(|shard| shard.memo().size() as u64 > env.config.chunk_size)
        .map(|shard| (shard.spec.context_id, shard.spec.shard_id))
        .collect();

    for key in oversized {
        let fresh_id = env.alloc_chunk_id();
        let shard = env.shards.get_mut(&key).unwrap();
        let use_bloom = shard.spec.use_bloom_filter;
        let frozen = shard.push_memo_chunk(MemoChunk::new(fresh_id, use_bloom));
        let chunk_id = frozen.chunk_id();

        log::debug!(
            "writing chunk {} of shard {}:{} during recovery, size {}",
            chunk_id,
            key.0,
            key.1,
            frozen.size()
        );

        let serialized = chunk_writer::serialize(&frozen)?;
        let path = serialized.write(&env.chunk_dir)?;
        let file_chunk = serialized.into_file_chunk(path);

        let shard = env.shards.get_mut(&key).unwrap();
        shard.remove_frozen(chunk_id);
        shard.add_chunk(chunk_id);
        shard.set_recovery_pos(file_chunk.max_log_pos().max(shard.recovery_pos()));

        file_chunk.add_pages_to_cache(&mut env.page_cache);
        env.file_chunks.insert(chunk_id, file_chunk);
        env.apply_cache_evictions();

        env.write_toc()?;
    }

    Ok(())
}

/// Delete any `chunk.<id>` file (or leftover tmp) not referenced by a shard.
fn delete_orphaned_chunks(env: &mut StorageEnvironment) -> Result<(), Error> {
    for path in silo_tools::fs::list_files_with_prefix(&env.chunk_dir, "chunk.")? {
        let name = match path.file_name().and_then(|n| n.to_str()) {
            Some(name) => name,
            None => continue,
        };
        let referenced = name
            .strip_prefix("chunk.")
            .and_then(|rest| rest.parse::<u64>().ok())
            .map(|chunk_id| env.file_chunks.contains_key(&chunk_id))
            .unwrap_or(false);
        if !referenced {
            log::debug!("deleting orphaned chunk file {:?}", path);
            if let Err(err) = std::fs::remove_file(&path) {
                log::warn!("unable to delete orphaned chunk {:?} - {}", path, err);
            }
        }
    }
    Ok(())
}
