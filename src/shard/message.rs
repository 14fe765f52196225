//! Shard operations packaged into replicated values.
//!
//! A single paxos value carries a batch of operations; every replica applies
//! them to its storage environment in order when the value is chosen. The
//! one-byte dummy value lets a leader advance the log without any payload.

use anyhow::{bail, Error};

use silo_api_types::{ContextId, ShardId, ShardSpec, StorageType, TableId, TrackId};
use silo_replication::wire::{MessageReader, MessageWriter};

/// No-op value appended to keep followers current.
pub const DUMMY_VALUE: &[u8] = b"*";

const OP_SET: u8 = b's';
const OP_DELETE: u8 = b'd';
const OP_CREATE_SHARD: u8 = b'c';
const OP_DELETE_SHARD: u8 = b'x';
const OP_SPLIT_SHARD: u8 = b'p';

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ShardOp {
    Set {
        context_id: ContextId,
        shard_id: ShardId,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Delete {
        context_id: ContextId,
        shard_id: ShardId,
        key: Vec<u8>,
    },
    CreateShard {
        context_id: ContextId,
        table_id: TableId,
        shard_id: ShardId,
        track_id: TrackId,
        first_key: Vec<u8>,
        last_key: Vec<u8>,
        use_bloom_filter: bool,
        storage_type: StorageType,
    },
    DeleteShard {
        context_id: ContextId,
        shard_id: ShardId,
    },
    SplitShard {
        context_id: ContextId,
        shard_id: ShardId,
        new_shard_id: ShardId,
        split_key: Vec<u8>,
    },
}

impl ShardOp {
    pub fn create_shard_spec(&self) -> Option<ShardSpec> {
        match self {
            ShardOp::CreateShard {
                context_id,
                table_id,
                shard_id,
                track_id,
                first_key,
                last_key,
                use_bloom_filter,
                storage_type,
            } => Some(ShardSpec {
                context_id: *context_id,
                table_id: *table_id,
                shard_id: *shard_id,
                track_id: *track_id,
                first_key: first_key.clone(),
                last_key: last_key.clone(),
                use_bloom_filter: *use_bloom_filter,
                storage_type: *storage_type,
                created_at: Default::default(),
            }),
            _ => None,
        }
    }
}

pub fn is_dummy(value: &[u8]) -> bool {
    value == DUMMY_VALUE
}

pub fn encode_ops(ops: &[ShardOp]) -> Vec<u8> {
    let mut w = MessageWriter::new();
    for op in ops {
        match op {
            ShardOp::Set {
                context_id,
                shard_id,
                key,
                value,
            } => {
                w.field_char(OP_SET)
                    .field_u64(*context_id as u64)
                    .field_u64(*shard_id)
                    .field_bytes(key)
                    .field_bytes(value);
            }
            ShardOp::Delete {
                context_id,
                shard_id,
                key,
            } => {
                w.field_char(OP_DELETE)
                    .field_u64(*context_id as u64)
                    .field_u64(*shard_id)
                    .field_bytes(key);
            }
            ShardOp::CreateShard {
                context_id,
                table_id,
                shard_id,
                track_id,
                first_key,
                last_key,
                use_bloom_filter,
                storage_type,
            } => {
                w.field_char(OP_CREATE_SHARD)
                    .field_u64(*context_id as u64)
                    .field_u64(*table_id)
                    .field_u64(*shard_id)
                    .field_u64(*track_id)
                    .field_bytes(first_key)
                    .field_bytes(last_key)
                    .field_u64(*use_bloom_filter as u64)
                    .field_char(storage_type.as_byte());
            }
            ShardOp::DeleteShard {
                context_id,
                shard_id,
            } => {
                w.field_char(OP_DELETE_SHARD)
                    .field_u64(*context_id as u64)
                    .field_u64(*shard_id);
            }
            ShardOp::SplitShard {
                context_id,
                shard_id,
                new_shard_id,
                split_key,
            } => {
                w.field_char(OP_SPLIT_SHARD)
                    .field_u64(*context_id as u64)
                    .field_u64(*shard_id)
                    .field_u64(*new_shard_id)
                    .field_bytes(split_key);
            }
        }
    }
    w.into_bytes()
}

pub fn decode_ops(value: &[u8]) -> Result<Vec<ShardOp>, Error> {
    let mut ops = Vec::new();
    if value.is_empty() {
        return Ok(ops);
    }

    let mut r = MessageReader::new(value);
    loop {
        let kind = match r.read_char() {
            Ok(kind) => kind,
            Err(_) => break,
        };
        let op = match kind {
            OP_SET => ShardOp::Set {
                context_id: r.read_u64()? as ContextId,
                shard_id: r.read_u64()?,
                key: r.read_bytes()?.to_vec(),
                value: r.read_bytes()?.to_vec(),
            },
            OP_DELETE => ShardOp::Delete {
                context_id: r.read_u64()? as ContextId,
                shard_id: r.read_u64()?,
                key: r.read_bytes()?.to_vec(),
            },
            OP_CREATE_SHARD => ShardOp::CreateShard {
                context_id: r.read_u64()? as ContextId,
                table_id: r.read_u64()?,
                shard_id: r.read_u64()?,
                track_id: r.read_u64()?,
                first_key: r.read_bytes()?.to_vec(),
                last_key: r.read_bytes()?.to_vec(),
                use_bloom_filter: r.read_u64()? != 0,
                storage_type: {
                    let tag = r.read_char()?;
                    StorageType::from_byte(tag)
                        .ok_or_else(|| anyhow::format_err!("invalid storage type {:#x}", tag))?
                },
            },
            OP_DELETE_SHARD => ShardOp::DeleteShard {
                context_id: r.read_u64()? as ContextId,
                shard_id: r.read_u64()?,
            },
            OP_SPLIT_SHARD => ShardOp::SplitShard {
                context_id: r.read_u64()? as ContextId,
                shard_id: r.read_u64()?,
                new_shard_id: r.read_u64()?,
                split_key: r.read_bytes()?.to_vec(),
            },
            other => bail!("unknown shard op {:#x}", other),
        };
        ops.push(op);
    }
    Ok(ops)
}
