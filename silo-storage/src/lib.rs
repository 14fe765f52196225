//! This crate implements the silodb shard storage layer.
//!
//! # Data layout
//!
//! Every shard is a log-structured merge of one mutable in-memory **memo
//! chunk** and an ordered list of immutable on-disk **file chunks**. Writes
//! are appended to a per-track **log segment** for durability and applied to
//! the memo chunk in the same critical section; once the memo chunk exceeds
//! the configured chunk size it is frozen and serialized into a new file
//! chunk on a worker thread. The **TOC** file enumerates all shards and the
//! chunks that compose them and is rewritten atomically (`toc.new` + rename)
//! whenever a chunk is committed.
//!
//! On-disk files under the environment path:
//!
//! ```text
//! envPath/
//!   toc
//!   toc.new                          (transient during rewrite)
//!   chunks/chunk.<chunkID>
//!   logs/log.<trackID:020>.<segmentID>
//! ```
//!
//! All file chunk I/O happens in fixed-granularity **pages**, each framed
//! with its size and a CRC32 of the payload. Loaded pages are tracked by a
//! process-wide byte-bounded LRU **page cache**; evicted pages are dropped
//! from their owning chunk and transparently reloaded on the next lookup.
//!
//! # Recovery
//!
//! Crash recovery reads the TOC (preferring a complete `toc.new`), reopens
//! all file chunks, then replays the log segments of every track in order,
//! skipping records already covered by a file chunk. Memo chunks exceeding
//! the size threshold are written out between segments so replay memory
//! stays bounded.

pub mod bloom;
pub mod chunk_writer;
pub mod environment;
pub mod file_chunk;
pub mod jobs;
pub mod log_segment;
pub mod memo_chunk;
pub mod page;
pub mod page_cache;
pub mod recovery;
pub mod shard;
pub mod toc;

pub use environment::{GetResult, StorageConfig, StorageEnvironment, WriteResult};
pub use memo_chunk::{EntryValue, MemoChunk};
pub use page_cache::{PageCache, PageKey, PageKind};
pub use shard::StorageShard;

/// Granularity of all page I/O; pages are padded to a multiple of this.
pub const PAGE_GRAN: usize = 4096;

/// Target (uncompressed) size of one file chunk data page.
pub const DATA_PAGE_TARGET_SIZE: usize = 64 * 1024;

/// Size of the page-size + checksum framing in front of every page payload.
pub const PAGE_HEAD_SIZE: usize = 8;

/// sha256(b"silodb file chunk v1.0")[0..8]
pub const CHUNK_FILE_MAGIC_1_0: [u8; 8] = [155, 18, 73, 214, 42, 133, 96, 7];

/// Current log segment format version.
pub const LOG_SEGMENT_VERSION: u32 = 1;

/// Current TOC format version.
pub const TOC_VERSION: u32 = 1;
