//! Serialize a frozen memo chunk into a file chunk and write it to disk.
//!
//! The serializer splits the sorted entry stream into data pages close to
//! the target page size without ever splitting one entry, collects the index
//! records, and fills the bloom filter. The writer lays the pages out as
//! header | data pages | bloom | index, writes them to a sibling tmp file
//! and atomically renames it into place.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{bail, format_err, Error};

use silo_api_types::LogPosition;
use silo_tools::fs::{fsync_dir, fsync_file};

use crate::bloom::BloomFilter;
use crate::file_chunk::{
    chunk_file_name, BloomPage, ChunkHeader, DataPage, FileChunk, IndexPage, IndexRecord,
};
use crate::memo_chunk::{EntryValue, MemoChunk};
use crate::page::{frame_page, framed_size};
use crate::DATA_PAGE_TARGET_SIZE;

/// A file chunk serialized in memory, ready to be written out.
pub struct SerializedFileChunk {
    pub header: ChunkHeader,
    pub bloom_page: Option<BloomPage>,
    pub index_page: IndexPage,
    pub data_pages: Vec<DataPage>,
    /// Total on-disk size of all framed pages.
    pub file_size: u64,
}

/// Rough encoded size of one entry inside a data page.
fn entry_encoded_size(key: &[u8], value: &EntryValue) -> usize {
    match value {
        EntryValue::Set(v) => 1 + 2 + key.len() + 4 + v.len(),
        EntryValue::Delete => 1 + 2 + key.len(),
    }
}

/// Serialize `memo` into the pages of a new file chunk.
///
/// The memo chunk must be non-empty; the environment never serializes empty
/// chunks.
pub fn serialize(memo: &MemoChunk) -> Result<SerializedFileChunk, Error> {
    if memo.is_empty() {
        bail!("refusing to serialize empty memo chunk {}", memo.chunk_id());
    }

    let mut bloom = if memo.use_bloom_filter() {
        Some(BloomFilter::with_num_keys(memo.num_keys()))
    } else {
        None
    };

    // split the sorted stream into data pages
    let mut data_pages = Vec::new();
    let mut current: Vec<(Vec<u8>, EntryValue)> = Vec::new();
    let mut current_size = 4usize; // num_entries field

    for (key, value) in memo.iter() {
        if let Some(bloom) = bloom.as_mut() {
            bloom.add(key);
        }

        let encoded = entry_encoded_size(key, value);
        if !current.is_empty() && current_size + encoded > DATA_PAGE_TARGET_SIZE {
            data_pages.push(DataPage::new(std::mem::take(&mut current)));
            current_size = 4;
        }
        current.push((key.to_vec(), value.clone()));
        current_size += encoded;
    }
    if !current.is_empty() {
        data_pages.push(DataPage::new(current));
    }

    // lay out the file: header | data pages | bloom | index
    let header_payload_probe = ChunkHeader {
        chunk_id: memo.chunk_id(),
        use_bloom_filter: memo.use_bloom_filter(),
        num_keys: memo.num_keys() as u64,
        num_data_pages: data_pages.len() as u32,
        bloom_page_offset: 0,
        index_page_offset: 0,
        max_log_pos: memo.max_log_pos().unwrap_or(LogPosition::ZERO),
        first_key: memo.first_key().unwrap_or(b"").to_vec(),
        last_key: memo.last_key().unwrap_or(b"").to_vec(),
        midpoint: data_pages[data_pages.len() / 2]
            .first_key()
            .unwrap_or(b"")
            .to_vec(),
    };
    let header_size = framed_size(header_payload_probe.encode().len());

    let mut offset = header_size as u64;
    let mut index_records = Vec::with_capacity(data_pages.len());
    for (i, page) in data_pages.iter().enumerate() {
        index_records.push(IndexRecord {
            first_key: page
                .first_key()
                .ok_or_else(|| format_err!("empty data page"))?
                .to_vec(),
            index: i as u32,
            offset,
        });
        offset += framed_size(page.encode().len()) as u64;
    }

    let bloom_page = bloom.map(BloomPage::new);
    let bloom_page_offset = match &bloom_page {
        Some(page) => {
            let at = offset;
            offset += framed_size(page.encode().len()) as u64;
            at
        }
        None => 0,
    };

    let index_page = IndexPage::new(index_records);
    let index_page_offset = offset;
    offset += framed_size(index_page.encode().len()) as u64;

    let header = ChunkHeader {
        bloom_page_offset,
        index_page_offset,
        ..header_payload_probe
    };

    Ok(SerializedFileChunk {
        header,
        bloom_page,
        index_page,
        data_pages,
        file_size: offset,
    })
}

impl SerializedFileChunk {
    /// Write the chunk to `chunk_dir/chunk.<id>` via a tmp file and atomic
    /// rename. Returns the final path.
    pub fn write(&self, chunk_dir: &Path) -> Result<PathBuf, Error> {
        let final_path = chunk_dir.join(chunk_file_name(self.header.chunk_id));
        let mut tmp_path = final_path.clone();
        tmp_path.set_extension("tmp");

        let mut file = File::create(&tmp_path)
            .map_err(|err| format_err!("unable to create chunk file {:?} - {}", tmp_path, err))?;

        let mut written = 0u64;
        let mut write_frame = |file: &mut File, payload: &[u8]| -> Result<(), Error> {
            let frame = frame_page(payload);
            file.write_all(&frame)?;
            written += frame.len() as u64;
            Ok(())
        };

        write_frame(&mut file, &self.header.encode())?;
        for page in &self.data_pages {
            write_frame(&mut file, &page.encode())?;
        }
        if let Some(bloom) = &self.bloom_page {
            write_frame(&mut file, &bloom.encode())?;
        }
        write_frame(&mut file, &self.index_page.encode())?;

        if written != self.file_size {
            bail!(
                "chunk {} layout mismatch: wrote {} bytes, expected {}",
                self.header.chunk_id,
                written,
                self.file_size
            );
        }

        fsync_file(&file)?;
        drop(file);

        std::fs::rename(&tmp_path, &final_path).map_err(|err| {
            format_err!("atomic rename of chunk file {:?} failed - {}", final_path, err)
        })?;
        fsync_dir(chunk_dir)?;

        Ok(final_path)
    }

    /// Convert into a [`FileChunk`] with all pages still resident.
    pub fn into_file_chunk(self, filename: PathBuf) -> FileChunk {
        FileChunk::from_parts(
            filename,
            self.header,
            self.file_size,
            self.bloom_page,
            self.index_page,
            self.data_pages,
        )
    }
}
