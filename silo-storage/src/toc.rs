//! The table-of-contents file.
//!
//! The TOC lists every shard and, per shard, the chunk ids that compose it.
//! It is rewritten in full on every chunk commit: write `toc.new`, fsync,
//! unlink `toc`, rename. Recovery prefers a parseable `toc.new` and falls
//! back to `toc`, so a crash at any point of the rewrite loses nothing.
//!
//! Layout (little-endian, `pageSize` equals the total file size, `checksum`
//! covers everything after the first 8 bytes):
//!
//! ```text
//! pageSize:u32 | checksum:u32 | version:u32 | pad:u32 |
//! numShards:u32 | pad:u32 | shard records...
//! ```

use std::path::Path;

use anyhow::{bail, Error};

use silo_api_types::{ChunkId, LogPosition, ShardSpec, StorageType};
use silo_tools::io::{ByteReader, WriteLeExt};

use crate::page::crc32;
use crate::TOC_VERSION;

pub const TOC_FILE_NAME: &str = "toc";
pub const TOC_NEW_FILE_NAME: &str = "toc.new";

/// One shard record as stored in the TOC.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TocShard {
    pub spec: ShardSpec,
    pub chunk_ids: Vec<ChunkId>,
}

pub fn encode(shards: &[TocShard]) -> Vec<u8> {
    let mut body = Vec::new();
    body.put_le_u32(TOC_VERSION);
    body.put_le_u32(0); // pad
    body.put_le_u32(shards.len() as u32);
    body.put_le_u32(0); // pad

    for shard in shards {
        let spec = &shard.spec;
        body.put_le_u64(spec.track_id);
        body.put_le_u64(0); // pad
        body.put_le_u16(spec.context_id);
        body.put_le_u16(0); // pad
        body.put_le_u64(spec.table_id);
        body.put_le_u64(0); // pad
        body.put_le_u64(spec.shard_id);
        body.put_le_u64(0); // pad
        body.put_le_u64(spec.created_at.segment_id);
        body.put_le_u64(0); // pad
        body.put_le_u32(spec.created_at.command_id);
        body.put_le_u32(0); // pad
        body.put_lenpfx_bytes(&spec.first_key);
        body.put_lenpfx_bytes(&spec.last_key);
        body.put_u8(spec.use_bloom_filter as u8);
        body.put_u8(spec.storage_type.as_byte());
        body.put_le_u32(shard.chunk_ids.len() as u32);
        body.put_le_u32(0); // pad
        for chunk_id in &shard.chunk_ids {
            body.put_le_u64(*chunk_id);
            body.put_le_u64(0); // pad
        }
    }

    let page_size = 8 + body.len();
    let mut toc = Vec::with_capacity(page_size);
    toc.put_le_u32(page_size as u32);
    toc.put_le_u32(crc32(&body));
    toc.put_bytes(&body);
    toc
}

pub fn decode(bytes: &[u8]) -> Result<Vec<TocShard>, Error> {
    let mut head = ByteReader::new(bytes);
    let page_size = head.get_le_u32()? as usize;
    let checksum = head.get_le_u32()?;

    if page_size != bytes.len() {
        bail!(
            "toc size mismatch: header says {}, file has {}",
            page_size,
            bytes.len()
        );
    }

    let body = &bytes[8..];
    if crc32(body) != checksum {
        bail!("toc checksum mismatch");
    }

    let mut r = ByteReader::new(body);
    let version = r.get_le_u32()?;
    if version > TOC_VERSION {
        bail!("toc version {} is newer than supported", version);
    }
    r.skip(4)?;
    let num_shards = r.get_le_u32()?;
    r.skip(4)?;

    let mut shards = Vec::with_capacity(num_shards as usize);
    for _ in 0..num_shards {
        let track_id = r.get_le_u64()?;
        r.skip(8)?;
        let context_id = r.get_le_u16()?;
        r.skip(2)?;
        let table_id = r.get_le_u64()?;
        r.skip(8)?;
        let shard_id = r.get_le_u64()?;
        r.skip(8)?;
        let log_segment_id = r.get_le_u64()?;
        r.skip(8)?;
        let log_command_id = r.get_le_u32()?;
        r.skip(4)?;
        let first_key = r.get_lenpfx_bytes()?.to_vec();
        let last_key = r.get_lenpfx_bytes()?.to_vec();
        let use_bloom_filter = r.get_u8()? != 0;
        let storage_type = r.get_u8()?;
        let storage_type = StorageType::from_byte(storage_type)
            .ok_or_else(|| anyhow::format_err!("invalid storage type {:#x}", storage_type))?;
        let num_chunks = r.get_le_u32()?;
        r.skip(4)?;

        let mut chunk_ids = Vec::with_capacity(num_chunks as usize);
        for _ in 0..num_chunks {
            chunk_ids.push(r.get_le_u64()?);
            r.skip(8)?;
        }

        shards.push(TocShard {
            spec: ShardSpec {
                context_id,
                table_id,
                shard_id,
                track_id,
                first_key,
                last_key,
                use_bloom_filter,
                storage_type,
                created_at: LogPosition::new(log_segment_id, log_command_id),
            },
            chunk_ids,
        });
    }

    Ok(shards)
}

/// Crash-safe rewrite: `toc.new` + fsync, unlink `toc`, rename.
pub fn write(env_path: &Path, shards: &[TocShard]) -> Result<(), Error> {
    let toc_path = env_path.join(TOC_FILE_NAME);
    let toc_new_path = env_path.join(TOC_NEW_FILE_NAME);

    let bytes = encode(shards);
    silo_tools::fs::replace_file(&toc_new_path, &bytes, true)?;

    match std::fs::remove_file(&toc_path) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => bail!("unable to unlink {:?} - {}", toc_path, err),
    }
    std::fs::rename(&toc_new_path, &toc_path)?;
    silo_tools::fs::fsync_dir(env_path)?;

    Ok(())
}
