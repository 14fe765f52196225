//! Background storage jobs.
//!
//! Disk-bound work runs on a small worker-thread pool: log segment commits
//! (fdatasync), memo chunk serialization, chunk file writes, log segment
//! archival and memo chunk teardown. Completions are posted back over a
//! channel and drained on the event-loop thread; no environment state is
//! touched from worker threads.

use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{format_err, Error};
use crossbeam_channel::{Receiver, Sender};

use silo_api_types::{ChunkId, ContextId, LogSegmentId, ShardId, TrackId};

use crate::chunk_writer::{self, SerializedFileChunk};
use crate::log_segment::{write_sealed_block, SealedBlock};
use crate::memo_chunk::MemoChunk;

/// Archive script value meaning "just unlink the segment".
pub const ARCHIVE_SCRIPT_DELETE: &str = "$delete";

pub enum StorageJob {
    /// Durably flush a sealed log block.
    Commit {
        track_id: TrackId,
        segment_id: LogSegmentId,
        file: File,
        block: SealedBlock,
    },
    /// Serialize a frozen memo chunk into file chunk pages.
    SerializeChunk {
        context_id: ContextId,
        shard_id: ShardId,
        memo: Arc<MemoChunk>,
    },
    /// Write a serialized chunk to disk.
    WriteChunk {
        context_id: ContextId,
        shard_id: ShardId,
        chunk: Box<SerializedFileChunk>,
        chunk_dir: PathBuf,
    },
    /// Archive (or delete) a closed log segment.
    ArchiveLogSegment {
        track_id: TrackId,
        segment_id: LogSegmentId,
        path: PathBuf,
        script: String,
    },
    /// Tear down a dropped memo chunk off the event loop.
    DeleteMemoChunk { memo: Arc<MemoChunk> },
}

pub enum JobCompletion {
    Commit {
        track_id: TrackId,
        segment_id: LogSegmentId,
        result: Result<(), Error>,
    },
    ChunkSerialized {
        context_id: ContextId,
        shard_id: ShardId,
        result: Result<Box<SerializedFileChunk>, Error>,
    },
    ChunkWritten {
        context_id: ContextId,
        shard_id: ShardId,
        result: Result<(Box<SerializedFileChunk>, PathBuf), Error>,
    },
    SegmentArchived {
        track_id: TrackId,
        segment_id: LogSegmentId,
        result: Result<(), Error>,
    },
    MemoChunkDeleted { chunk_id: ChunkId },
}

fn run_job(job: StorageJob) -> JobCompletion {
    match job {
        StorageJob::Commit {
            track_id,
            segment_id,
            file,
            block,
        } => JobCompletion::Commit {
            track_id,
            segment_id,
            result: write_sealed_block(&file, &block),
        },
        StorageJob::SerializeChunk {
            context_id,
            shard_id,
            memo,
        } => {
            log::debug!(
                "serializing chunk {} in memory, size {}",
                memo.chunk_id(),
                memo.size()
            );
            let started = std::time::Instant::now();
            let result = chunk_writer::serialize(&memo).map(Box::new);
            log::debug!(
                "done serializing chunk {}, elapsed {} ms",
                memo.chunk_id(),
                started.elapsed().as_millis()
            );
            JobCompletion::ChunkSerialized {
                context_id,
                shard_id,
                result,
            }
        }
        StorageJob::WriteChunk {
            context_id,
            shard_id,
            chunk,
            chunk_dir,
        } => {
            let chunk_id = chunk.header.chunk_id;
            log::debug!("writing chunk {} to file", chunk_id);
            let started = std::time::Instant::now();
            let result = chunk.write(&chunk_dir).map(|path| (chunk, path));
            match &result {
                Ok((chunk, _)) => log::debug!(
                    "chunk {} written, elapsed {} ms, size {}",
                    chunk_id,
                    started.elapsed().as_millis(),
                    chunk.file_size
                ),
                Err(err) => log::error!("unable to write chunk file {} - {}", chunk_id, err),
            }
            JobCompletion::ChunkWritten {
                context_id,
                shard_id,
                result,
            }
        }
        StorageJob::ArchiveLogSegment {
            track_id,
            segment_id,
            path,
            script,
        } => JobCompletion::SegmentArchived {
            track_id,
            segment_id,
            result: archive_log_segment(&path, &script),
        },
        StorageJob::DeleteMemoChunk { memo } => {
            let chunk_id = memo.chunk_id();
            drop(memo);
            JobCompletion::MemoChunkDeleted { chunk_id }
        }
    }
}

/// Substitute `$(trackID)`, `$(segmentID)` and `$(filename)` in an archive
/// command template.
pub fn eval_archive_script(
    script: &str,
    track_id: TrackId,
    segment_id: LogSegmentId,
    path: &std::path::Path,
) -> String {
    script
        .replace("$(trackID)", &track_id.to_string())
        .replace("$(segmentID)", &segment_id.to_string())
        .replace("$(filename)", &path.to_string_lossy())
}

fn archive_log_segment(path: &std::path::Path, script: &str) -> Result<(), Error> {
    if script != ARCHIVE_SCRIPT_DELETE {
        log::debug!("archiving log segment {:?}: {}", path, script);
        let status = std::process::Command::new("sh")
            .arg("-c")
            .arg(script)
            .status()
            .map_err(|err| format_err!("unable to run archive script - {}", err))?;
        if !status.success() {
            return Err(format_err!(
                "archive script failed with status {} for {:?}",
                status,
                path
            ));
        }
    }
    std::fs::remove_file(path)
        .map_err(|err| format_err!("unable to delete log segment {:?} - {}", path, err))
}

pub struct JobPool {
    tx: Option<Sender<StorageJob>>,
    completions: Receiver<JobCompletion>,
    notify: Arc<tokio::sync::Notify>,
    workers: Vec<JoinHandle<()>>,
    in_flight: usize,
}

impl JobPool {
    pub fn new(num_workers: usize) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded::<StorageJob>();
        let (completion_tx, completions) = crossbeam_channel::unbounded();
        let notify = Arc::new(tokio::sync::Notify::new());

        let mut workers = Vec::with_capacity(num_workers);
        for i in 0..num_workers {
            let rx = rx.clone();
            let completion_tx = completion_tx.clone();
            let notify = notify.clone();
            let handle = std::thread::Builder::new()
                .name(format!("storage-job-{}", i))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        let completion = run_job(job);
                        if completion_tx.send(completion).is_err() {
                            break;
                        }
                        notify.notify_one();
                    }
                })
                .expect("unable to spawn storage job worker");
            workers.push(handle);
        }

        Self {
            tx: Some(tx),
            completions,
            notify,
            workers,
            in_flight: 0,
        }
    }

    pub fn execute(&mut self, job: StorageJob) {
        self.in_flight += 1;
        self.tx
            .as_ref()
            .expect("job pool already shut down")
            .send(job)
            .expect("job workers gone");
    }

    /// Non-blocking completion drain step.
    pub fn try_completion(&mut self) -> Option<JobCompletion> {
        match self.completions.try_recv() {
            Ok(completion) => {
                self.in_flight -= 1;
                Some(completion)
            }
            Err(_) => None,
        }
    }

    /// Blocking completion wait, used by synchronous drains in tests and
    /// recovery-adjacent paths.
    pub fn wait_completion(&mut self, timeout: Duration) -> Option<JobCompletion> {
        match self.completions.recv_timeout(timeout) {
            Ok(completion) => {
                self.in_flight -= 1;
                Some(completion)
            }
            Err(_) => None,
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Notified whenever a job completes; the event loop awaits this.
    pub fn notifier(&self) -> Arc<tokio::sync::Notify> {
        self.notify.clone()
    }
}

impl Drop for JobPool {
    fn drop(&mut self) {
        self.tx.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}
