//! Append-only log segments.
//!
//! A segment file `log.<trackID:020>.<segmentID>` starts with
//! `(version:u32, segmentID:u64)` and is followed by blocks:
//!
//! ```text
//! totalBlockSize:u64 | uncompressedLength:u64 | checksum:u32 |
//!   repeat:
//!     op:u8('s'|'d') | usePrevious:u8(0|1) |
//!     if !usePrevious: contextID:u16 | shardID:u64 |
//!     keyLen:u16 | key |
//!     if op='s': valueLen:u32 | value
//! ```
//!
//! Records are buffered into the current block; `commit` durably flushes it.
//! `usePrevious` reuses the previous record's `(contextID, shardID)` within
//! one block. `logCommandID` numbers records within the segment from 1,
//! across blocks.

use std::fs::File;
use std::io::{BufReader, Read};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use anyhow::{bail, format_err, Error};

use silo_api_types::{ContextId, LogCommandId, LogPosition, LogSegmentId, ShardId, TrackId};
use silo_tools::fs::fdatasync_file;
use silo_tools::io::{ByteReader, ReadLeExt, WriteLeExt};

use crate::page::crc32;
use crate::LOG_SEGMENT_VERSION;

const BLOCK_HEAD_SIZE: usize = 8 + 8 + 4;

pub const LOG_COMMAND_SET: u8 = b's';
pub const LOG_COMMAND_DELETE: u8 = b'd';

pub fn log_segment_file_name(track_id: TrackId, segment_id: LogSegmentId) -> String {
    format!("log.{:020}.{}", track_id, segment_id)
}

/// Parse `(trackID, segmentID)` out of a segment file name.
pub fn parse_log_segment_file_name(name: &str) -> Option<(TrackId, LogSegmentId)> {
    let rest = name.strip_prefix("log.")?;
    let (track, segment) = rest.split_once('.')?;
    Some((track.parse().ok()?, segment.parse().ok()?))
}

/// A finalized block waiting to be written and synced.
pub struct SealedBlock {
    pub offset: u64,
    pub bytes: Vec<u8>,
}

pub struct LogSegmentWriter {
    track_id: TrackId,
    segment_id: LogSegmentId,
    path: PathBuf,
    file: File,
    /// End of the durably laid-out region; sealed blocks are written here.
    write_offset: u64,
    /// Record bytes of the in-progress block.
    block: Vec<u8>,
    prev_ctx: Option<(ContextId, ShardId)>,
    next_command_id: LogCommandId,
}

impl LogSegmentWriter {
    /// Create a fresh segment and write its header.
    pub fn create(
        log_dir: &Path,
        track_id: TrackId,
        segment_id: LogSegmentId,
    ) -> Result<Self, Error> {
        let path = log_dir.join(log_segment_file_name(track_id, segment_id));
        let file = std::fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .read(true)
            .open(&path)
            .map_err(|err| format_err!("unable to create log segment {:?} - {}", path, err))?;

        let mut header = Vec::with_capacity(12);
        header.put_le_u32(LOG_SEGMENT_VERSION);
        header.put_le_u64(segment_id);
        file.write_all_at(&header, 0)?;

        Ok(Self {
            track_id,
            segment_id,
            path,
            file,
            write_offset: header.len() as u64,
            block: Vec::new(),
            prev_ctx: None,
            next_command_id: 1,
        })
    }

    pub fn track_id(&self) -> TrackId {
        self.track_id
    }

    pub fn segment_id(&self) -> LogSegmentId {
        self.segment_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes laid out plus the in-progress block.
    pub fn size(&self) -> u64 {
        self.write_offset + self.block.len() as u64
    }

    pub fn has_uncommitted(&self) -> bool {
        !self.block.is_empty()
    }

    /// Buffer one record; returns its log position. Not yet durable.
    pub fn append(
        &mut self,
        context_id: ContextId,
        shard_id: ShardId,
        op: u8,
        key: &[u8],
        value: Option<&[u8]>,
    ) -> LogPosition {
        debug_assert!(op == LOG_COMMAND_SET || op == LOG_COMMAND_DELETE);
        debug_assert!(!key.is_empty());

        let use_previous = self.prev_ctx == Some((context_id, shard_id));

        self.block.put_u8(op);
        self.block.put_u8(use_previous as u8);
        if !use_previous {
            self.block.put_le_u16(context_id);
            self.block.put_le_u64(shard_id);
            self.prev_ctx = Some((context_id, shard_id));
        }
        self.block.put_le_u16(key.len() as u16);
        self.block.put_bytes(key);
        if op == LOG_COMMAND_SET {
            let value = value.expect("set record without value");
            self.block.put_le_u32(value.len() as u32);
            self.block.put_bytes(value);
        }

        let command_id = self.next_command_id;
        self.next_command_id += 1;
        LogPosition::new(self.segment_id, command_id)
    }

    /// Finalize the in-progress block. The caller owns writing + syncing it
    /// (either inline via [`write_sealed_block`] or on a commit job).
    pub fn seal_block(&mut self) -> Option<SealedBlock> {
        if self.block.is_empty() {
            return None;
        }

        let records = std::mem::take(&mut self.block);
        self.prev_ctx = None;

        let total = (BLOCK_HEAD_SIZE + records.len()) as u64;
        let mut bytes = Vec::with_capacity(total as usize);
        bytes.put_le_u64(total);
        bytes.put_le_u64(records.len() as u64);
        bytes.put_le_u32(crc32(&records));
        bytes.put_bytes(&records);

        let offset = self.write_offset;
        self.write_offset += bytes.len() as u64;
        Some(SealedBlock { offset, bytes })
    }

    /// Clone of the underlying file handle, for commit jobs.
    pub fn file_clone(&self) -> Result<File, Error> {
        Ok(self.file.try_clone()?)
    }

    /// Seal, write and sync in one step. Used by recovery-time writes and
    /// tests; the live path runs the write on a commit job instead.
    pub fn commit_sync(&mut self) -> Result<(), Error> {
        if let Some(sealed) = self.seal_block() {
            write_sealed_block(&self.file, &sealed)?;
        }
        Ok(())
    }
}

/// Write a sealed block at its offset and make it durable.
pub fn write_sealed_block(file: &File, sealed: &SealedBlock) -> Result<(), Error> {
    file.write_all_at(&sealed.bytes, sealed.offset)?;
    fdatasync_file(file)
}

/// One replayed log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub command_id: LogCommandId,
    pub context_id: ContextId,
    pub shard_id: ShardId,
    pub op: u8,
    pub key: Vec<u8>,
    pub value: Option<Vec<u8>>,
}

pub struct LogSegmentReader {
    reader: BufReader<File>,
    segment_id: LogSegmentId,
}

impl LogSegmentReader {
    pub fn open(path: &Path) -> Result<Self, Error> {
        let file = File::open(path)
            .map_err(|err| format_err!("unable to open log segment {:?} - {}", path, err))?;
        let mut reader = BufReader::new(file);

        let version = reader.read_le_u32()?;
        if version > LOG_SEGMENT_VERSION {
            bail!(
                "log segment {:?} version {} is newer than supported",
                path,
                version
            );
        }
        let segment_id = reader.read_le_u64()?;

        Ok(Self { reader, segment_id })
    }

    pub fn segment_id(&self) -> LogSegmentId {
        self.segment_id
    }

    /// Replay every complete record. A short or torn tail ends the replay;
    /// with `verify_checksums` a corrupt block is an error instead of being
    /// applied.
    pub fn replay(
        &mut self,
        verify_checksums: bool,
        mut f: impl FnMut(LogRecord) -> Result<(), Error>,
    ) -> Result<(), Error> {
        let mut command_id: LogCommandId = 1;

        loop {
            let mut head = [0u8; 8];
            match self.reader.read_exact(&mut head) {
                Ok(()) => {}
                Err(_) => break, // end of log
            }
            let total = u64::from_le_bytes(head) as usize;
            if total < BLOCK_HEAD_SIZE {
                break;
            }

            let rest = total - 8;
            let mut block = vec![0u8; rest];
            if self.reader.read_exact(&mut block).is_err() {
                break; // torn tail
            }

            let mut parse = ByteReader::new(&block);
            let _uncompressed = parse.get_le_u64()?;
            let checksum = parse.get_le_u32()?;
            let records = &block[BLOCK_HEAD_SIZE - 8..];

            if verify_checksums && crc32(records) != checksum {
                bail!("log block checksum mismatch in segment {}", self.segment_id);
            }

            let mut parse = ByteReader::new(records);
            let mut prev_ctx: Option<(ContextId, ShardId)> = None;
            while !parse.is_empty() {
                let record = match Self::parse_record(&mut parse, &mut prev_ctx) {
                    Ok(record) => record,
                    Err(_) => break, // torn record, skip rest of block
                };
                f(LogRecord {
                    command_id,
                    context_id: record.0,
                    shard_id: record.1,
                    op: record.2,
                    key: record.3,
                    value: record.4,
                })?;
                command_id += 1;
            }
        }

        Ok(())
    }

    #[allow(clippy::type_complexity)]
    fn parse_record(
        parse: &mut ByteReader,
        prev_ctx: &mut Option<(ContextId, ShardId)>,
    ) -> Result<(ContextId, ShardId, u8, Vec<u8>, Option<Vec<u8>>), Error> {
        let op = parse.get_u8()?;
        if op != LOG_COMMAND_SET && op != LOG_COMMAND_DELETE {
            bail!("invalid log record op {:#x}", op);
        }
        let use_previous = parse.get_u8()? != 0;

        let (context_id, shard_id) = if use_previous {
            prev_ctx.ok_or_else(|| format_err!("usePrevious without previous record"))?
        } else {
            let ctx = (parse.get_le_u16()?, parse.get_le_u64()?);
            *prev_ctx = Some(ctx);
            ctx
        };

        let klen = parse.get_le_u16()? as usize;
        let key = parse.get_bytes(klen)?.to_vec();

        let value = if op == LOG_COMMAND_SET {
            let vlen = parse.get_le_u32()? as usize;
            Some(parse.get_bytes(vlen)?.to_vec())
        } else {
            None
        };

        Ok((context_id, shard_id, op, key, value))
    }
}
