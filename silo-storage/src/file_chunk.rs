//! Immutable on-disk chunk files.
//!
//! A chunk file is a sequence of framed pages: the header page at offset 0,
//! the data pages, then (optionally) the bloom page and finally the index
//! page. The header records the offsets of the bloom and index pages; the
//! index records `(firstKey, dataPageIndex, fileOffset)` for every data
//! page. Bloom, index and data pages are loaded lazily and dropped again
//! when the page cache evicts them; file descriptors for page loads are
//! short-lived.

use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{bail, format_err, Error};

use silo_api_types::{range_contains, ChunkId, LogPosition};
use silo_tools::io::{ByteReader, WriteLeExt};

use crate::bloom::BloomFilter;
use crate::memo_chunk::EntryValue;
use crate::page::read_page_at;
use crate::page_cache::{PageCache, PageKey, PageKind};
use crate::CHUNK_FILE_MAGIC_1_0;

/// Parsed header page of a chunk file.
#[derive(Clone, Debug)]
pub struct ChunkHeader {
    pub chunk_id: ChunkId,
    pub use_bloom_filter: bool,
    pub num_keys: u64,
    pub num_data_pages: u32,
    /// 0 when the chunk has no bloom page.
    pub bloom_page_offset: u64,
    pub index_page_offset: u64,
    pub max_log_pos: LogPosition,
    pub first_key: Vec<u8>,
    pub last_key: Vec<u8>,
    pub midpoint: Vec<u8>,
}

impl ChunkHeader {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.put_bytes(&CHUNK_FILE_MAGIC_1_0);
        buf.put_le_u32(1); // version
        buf.put_le_u64(self.chunk_id);
        buf.put_u8(self.use_bloom_filter as u8);
        buf.put_le_u64(self.num_keys);
        buf.put_le_u32(self.num_data_pages);
        buf.put_le_u64(self.bloom_page_offset);
        buf.put_le_u64(self.index_page_offset);
        buf.put_le_u64(self.max_log_pos.segment_id);
        buf.put_le_u32(self.max_log_pos.command_id);
        buf.put_lenpfx_bytes(&self.first_key);
        buf.put_lenpfx_bytes(&self.last_key);
        buf.put_lenpfx_bytes(&self.midpoint);
        buf
    }

    pub fn decode(payload: &[u8]) -> Result<Self, Error> {
        let mut r = ByteReader::new(payload);
        let magic = r.get_bytes(8)?;
        if magic != CHUNK_FILE_MAGIC_1_0 {
            bail!("bad chunk file magic");
        }
        let version = r.get_le_u32()?;
        if version != 1 {
            bail!("chunk file version {} is newer than supported", version);
        }
        let chunk_id = r.get_le_u64()?;
        let use_bloom_filter = r.get_u8()? != 0;
        let num_keys = r.get_le_u64()?;
        let num_data_pages = r.get_le_u32()?;
        let bloom_page_offset = r.get_le_u64()?;
        let index_page_offset = r.get_le_u64()?;
        let max_log_pos = LogPosition::new(r.get_le_u64()?, r.get_le_u32()?);
        let first_key = r.get_lenpfx_bytes()?.to_vec();
        let last_key = r.get_lenpfx_bytes()?.to_vec();
        let midpoint = r.get_lenpfx_bytes()?.to_vec();

        Ok(Self {
            chunk_id,
            use_bloom_filter,
            num_keys,
            num_data_pages,
            bloom_page_offset,
            index_page_offset,
            max_log_pos,
            first_key,
            last_key,
            midpoint,
        })
    }
}

/// Loaded bloom page.
pub struct BloomPage {
    filter: BloomFilter,
}

impl BloomPage {
    pub fn new(filter: BloomFilter) -> Self {
        Self { filter }
    }

    pub fn check(&self, key: &[u8]) -> bool {
        self.filter.check(key)
    }

    pub fn size(&self) -> usize {
        self.filter.num_bytes()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.put_le_u32(self.filter.num_bytes() as u32);
        buf.put_bytes(self.filter.as_bytes());
        buf
    }

    pub fn decode(payload: &[u8]) -> Result<Self, Error> {
        let mut r = ByteReader::new(payload);
        let num_bytes = r.get_le_u32()? as usize;
        let bits = r.get_bytes(num_bytes)?.to_vec();
        Ok(Self {
            filter: BloomFilter::from_bytes(bits),
        })
    }
}

/// One index record: the first key of a data page and where to find it.
#[derive(Clone, Debug)]
pub struct IndexRecord {
    pub first_key: Vec<u8>,
    pub index: u32,
    pub offset: u64,
}

/// Loaded index page: ordered index records, one per data page.
pub struct IndexPage {
    records: Vec<IndexRecord>,
    size: usize,
}

impl IndexPage {
    pub fn new(records: Vec<IndexRecord>) -> Self {
        let size = records
            .iter()
            .map(|r| r.first_key.len() + 16)
            .sum::<usize>();
        Self { records, size }
    }

    pub fn num_data_pages(&self) -> u32 {
        self.records.len() as u32
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Find the data page that may contain `key`: the record with the
    /// largest `first_key <= key`.
    pub fn locate(&self, key: &[u8]) -> Option<(u32, u64)> {
        let idx = self
            .records
            .partition_point(|r| r.first_key.as_slice() <= key);
        if idx == 0 {
            return None;
        }
        let record = &self.records[idx - 1];
        Some((record.index, record.offset))
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.put_le_u32(self.records.len() as u32);
        for record in &self.records {
            buf.put_lenpfx_bytes(&record.first_key);
            buf.put_le_u32(record.index);
            buf.put_le_u64(record.offset);
        }
        buf
    }

    pub fn decode(payload: &[u8]) -> Result<Self, Error> {
        let mut r = ByteReader::new(payload);
        let num = r.get_le_u32()?;
        let mut records = Vec::with_capacity(num as usize);
        for _ in 0..num {
            let first_key = r.get_lenpfx_bytes()?.to_vec();
            let index = r.get_le_u32()?;
            let offset = r.get_le_u64()?;
            records.push(IndexRecord {
                first_key,
                index,
                offset,
            });
        }
        Ok(Self::new(records))
    }
}

/// Loaded data page: a self-contained sorted block of entries.
pub struct DataPage {
    entries: Vec<(Vec<u8>, EntryValue)>,
    size: usize,
}

impl DataPage {
    pub fn new(entries: Vec<(Vec<u8>, EntryValue)>) -> Self {
        let size = entries
            .iter()
            .map(|(k, v)| {
                k.len()
                    + match v {
                        EntryValue::Set(val) => val.len(),
                        EntryValue::Delete => 0,
                    }
                    + 8
            })
            .sum::<usize>();
        Self { entries, size }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn num_entries(&self) -> usize {
        self.entries.len()
    }

    pub fn first_key(&self) -> Option<&[u8]> {
        self.entries.first().map(|(k, _)| k.as_slice())
    }

    pub fn get(&self, key: &[u8]) -> Option<&EntryValue> {
        self.entries
            .binary_search_by(|(k, _)| k.as_slice().cmp(key))
            .ok()
            .map(|idx| &self.entries[idx].1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &EntryValue)> {
        self.entries.iter().map(|(k, v)| (k.as_slice(), v))
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.put_le_u32(self.entries.len() as u32);
        for (key, value) in &self.entries {
            match value {
                EntryValue::Set(val) => {
                    buf.put_u8(b's');
                    buf.put_le_u16(key.len() as u16);
                    buf.put_bytes(key);
                    buf.put_le_u32(val.len() as u32);
                    buf.put_bytes(val);
                }
                EntryValue::Delete => {
                    buf.put_u8(b'd');
                    buf.put_le_u16(key.len() as u16);
                    buf.put_bytes(key);
                }
            }
        }
        buf
    }

    pub fn decode(payload: &[u8]) -> Result<Self, Error> {
        let mut r = ByteReader::new(payload);
        let num = r.get_le_u32()?;
        let mut entries = Vec::with_capacity(num as usize);
        for _ in 0..num {
            let op = r.get_u8()?;
            let klen = r.get_le_u16()? as usize;
            let key = r.get_bytes(klen)?.to_vec();
            let value = match op {
                b's' => {
                    let vlen = r.get_le_u32()? as usize;
                    EntryValue::Set(r.get_bytes(vlen)?.to_vec())
                }
                b'd' => EntryValue::Delete,
                other => bail!("invalid data page op {:#x}", other),
            };
            entries.push((key, value));
        }
        Ok(Self::new(entries))
    }
}

/// An immutable on-disk chunk with lazily loaded pages.
pub struct FileChunk {
    filename: PathBuf,
    header: ChunkHeader,
    file_size: u64,
    bloom_page: Option<BloomPage>,
    index_page: Option<IndexPage>,
    data_pages: Vec<Option<DataPage>>,
}

pub fn chunk_file_name(chunk_id: ChunkId) -> String {
    format!("chunk.{}", chunk_id)
}

impl FileChunk {
    /// Open a chunk file and read its header page. Any failure here is fatal
    /// for recovery; the caller escalates.
    pub fn open(path: &Path) -> Result<Self, Error> {
        let file = File::open(path)
            .map_err(|err| format_err!("unable to open chunk file {:?} - {}", path, err))?;
        let payload = read_page_at(&file, 0)
            .map_err(|err| format_err!("unable to read header page of {:?} - {}", path, err))?;
        let header = ChunkHeader::decode(&payload)
            .map_err(|err| format_err!("unable to parse header page of {:?} - {}", path, err))?;
        let file_size = file.metadata()?.len();

        let num_data_pages = header.num_data_pages as usize;
        Ok(Self {
            filename: path.to_path_buf(),
            header,
            file_size,
            bloom_page: None,
            index_page: None,
            data_pages: (0..num_data_pages).map(|_| None).collect(),
        })
    }

    /// Build a chunk whose pages are still resident from serialization.
    pub fn from_parts(
        filename: PathBuf,
        header: ChunkHeader,
        file_size: u64,
        bloom_page: Option<BloomPage>,
        index_page: IndexPage,
        data_pages: Vec<DataPage>,
    ) -> Self {
        Self {
            filename,
            header,
            file_size,
            bloom_page,
            index_page: Some(index_page),
            data_pages: data_pages.into_iter().map(Some).collect(),
        }
    }

    pub fn chunk_id(&self) -> ChunkId {
        self.header.chunk_id
    }

    pub fn header(&self) -> &ChunkHeader {
        &self.header
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn filename(&self) -> &Path {
        &self.filename
    }

    pub fn max_log_pos(&self) -> LogPosition {
        self.header.max_log_pos
    }

    pub fn midpoint(&self) -> &[u8] {
        &self.header.midpoint
    }

    pub fn range_contains(&self, key: &[u8]) -> bool {
        range_contains(&self.header.first_key, &self.header.last_key, key)
    }

    fn page_key(&self, kind: PageKind) -> PageKey {
        PageKey {
            chunk_id: self.header.chunk_id,
            kind,
        }
    }

    /// Look up `key`, lazily loading bloom/index/data pages as needed and
    /// keeping the page cache informed.
    pub fn get(&mut self, key: &[u8], cache: &mut PageCache) -> Result<Option<EntryValue>, Error> {
        if self.header.use_bloom_filter {
            if self.bloom_page.is_none() {
                self.load_bloom_page(cache)?; // evicted, load back
            } else {
                cache.register_hit(self.page_key(PageKind::Bloom));
            }
            if !self.bloom_page.as_ref().unwrap().check(key) {
                return Ok(None);
            }
        }

        if self.index_page.is_none() {
            self.load_index_page(cache)?; // evicted, load back
        } else {
            cache.register_hit(self.page_key(PageKind::Index));
        }
        let (index, offset) = match self.index_page.as_ref().unwrap().locate(key) {
            Some(found) => found,
            None => return Ok(None),
        };

        if self.data_pages[index as usize].is_none() {
            self.load_data_page(index, offset, false, cache)?; // evicted, load back
        } else {
            cache.register_hit(self.page_key(PageKind::Data(index)));
        }

        Ok(self.data_pages[index as usize]
            .as_ref()
            .unwrap()
            .get(key)
            .cloned())
    }

    fn read_page(&self, offset: u64) -> Result<Vec<u8>, Error> {
        // short-lived fd: open for this read only
        let file = File::open(&self.filename).map_err(|err| {
            format_err!("unable to open chunk file {:?} - {}", self.filename, err)
        })?;
        read_page_at(&file, offset).map_err(|err| {
            format_err!(
                "unable to read page from {:?} at offset {} - {}",
                self.filename,
                offset,
                err
            )
        })
    }

    fn load_bloom_page(&mut self, cache: &mut PageCache) -> Result<(), Error> {
        let payload = self.read_page(self.header.bloom_page_offset)?;
        let bloom = BloomPage::decode(&payload)?;
        cache.add_page(self.page_key(PageKind::Bloom), bloom.size());
        self.bloom_page = Some(bloom);
        Ok(())
    }

    fn load_index_page(&mut self, cache: &mut PageCache) -> Result<(), Error> {
        let payload = self.read_page(self.header.index_page_offset)?;
        let index = IndexPage::decode(&payload)?;
        if index.num_data_pages() != self.header.num_data_pages {
            bail!(
                "index page of {:?} names {} data pages, header says {}",
                self.filename,
                index.num_data_pages(),
                self.header.num_data_pages
            );
        }
        cache.add_page(self.page_key(PageKind::Index), index.size());
        self.index_page = Some(index);
        Ok(())
    }

    fn load_data_page(
        &mut self,
        index: u32,
        offset: u64,
        bulk: bool,
        cache: &mut PageCache,
    ) -> Result<(), Error> {
        let payload = self.read_page(offset)?;
        let data = DataPage::decode(&payload)?;
        let key = self.page_key(PageKind::Data(index));
        if bulk {
            cache.add_page_bulk(key, data.size());
        } else {
            cache.add_page(key, data.size());
        }
        self.data_pages[index as usize] = Some(data);
        Ok(())
    }

    /// Drop a page after the cache evicted it.
    pub fn on_page_evicted(&mut self, kind: PageKind) {
        match kind {
            PageKind::Bloom => self.bloom_page = None,
            PageKind::Index => self.index_page = None,
            PageKind::Data(index) => {
                if let Some(slot) = self.data_pages.get_mut(index as usize) {
                    *slot = None;
                }
            }
        }
    }

    /// Register all currently resident pages with the cache. Called after a
    /// freshly written chunk is installed, when every page is still loaded.
    pub fn add_pages_to_cache(&self, cache: &mut PageCache) {
        if let Some(bloom) = &self.bloom_page {
            cache.add_page(self.page_key(PageKind::Bloom), bloom.size());
        }
        if let Some(index) = &self.index_page {
            cache.add_page(self.page_key(PageKind::Index), index.size());
        }
        for (i, page) in self.data_pages.iter().enumerate() {
            if let Some(page) = page {
                cache.add_page(self.page_key(PageKind::Data(i as u32)), page.size());
            }
        }
    }

    /// Remove all resident pages from the cache (chunk is going away).
    pub fn remove_pages_from_cache(&self, cache: &mut PageCache) {
        if self.bloom_page.is_some() {
            cache.remove_page(self.page_key(PageKind::Bloom));
        }
        if self.index_page.is_some() {
            cache.remove_page(self.page_key(PageKind::Index));
        }
        for (i, page) in self.data_pages.iter().enumerate() {
            if page.is_some() {
                cache.remove_page(self.page_key(PageKind::Data(i as u32)));
            }
        }
    }

    /// Iterate every entry of the chunk in key order, loading data pages as
    /// bulk (cold) cache entries. Used by scans and chunk rewrites.
    pub fn for_each_entry(
        &mut self,
        cache: &mut PageCache,
        mut f: impl FnMut(&[u8], &EntryValue),
    ) -> Result<(), Error> {
        if self.index_page.is_none() {
            self.load_index_page(cache)?;
        }
        let locations: Vec<(u32, u64)> = self
            .index_page
            .as_ref()
            .unwrap()
            .records
            .iter()
            .map(|r| (r.index, r.offset))
            .collect();

        for (index, offset) in locations {
            if self.data_pages[index as usize].is_none() {
                self.load_data_page(index, offset, true, cache)?;
            }
            let page = self.data_pages[index as usize].as_ref().unwrap();
            for (key, value) in page.iter() {
                f(key, value);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PAGE_GRAN;

    #[test]
    fn header_roundtrip() {
        let header = ChunkHeader {
            chunk_id: 42,
            use_bloom_filter: true,
            num_keys: 1000,
            num_data_pages: 3,
            bloom_page_offset: 123 * PAGE_GRAN as u64,
            index_page_offset: 124 * PAGE_GRAN as u64,
            max_log_pos: LogPosition::new(5, 100),
            first_key: b"aardvark".to_vec(),
            last_key: b"zebra".to_vec(),
            midpoint: b"meerkat".to_vec(),
        };
        let decoded = ChunkHeader::decode(&header.encode()).unwrap();
        assert_eq!(decoded.chunk_id, 42);
        assert!(decoded.use_bloom_filter);
        assert_eq!(decoded.num_data_pages, 3);
        assert_eq!(decoded.max_log_pos, LogPosition::new(5, 100));
        assert_eq!(decoded.first_key, b"aardvark");
        assert_eq!(decoded.last_key, b"zebra");
        assert_eq!(decoded.midpoint, b"meerkat");
    }

    #[test]
    fn header_rejects_newer_version() {
        let header = ChunkHeader {
            chunk_id: 1,
            use_bloom_filter: false,
            num_keys: 0,
            num_data_pages: 0,
            bloom_page_offset: 0,
            index_page_offset: 0,
            max_log_pos: LogPosition::ZERO,
            first_key: vec![],
            last_key: vec![],
            midpoint: vec![],
        };
        let mut bytes = header.encode();
        bytes[8] = 9; // version field follows the magic
        assert!(ChunkHeader::decode(&bytes).is_err());
    }

    #[test]
    fn index_locate() {
        let index = IndexPage::new(vec![
            IndexRecord {
                first_key: b"b".to_vec(),
                index: 0,
                offset: 4096,
            },
            IndexRecord {
                first_key: b"m".to_vec(),
                index: 1,
                offset: 8192,
            },
        ]);

        assert_eq!(index.locate(b"a"), None);
        assert_eq!(index.locate(b"b"), Some((0, 4096)));
        assert_eq!(index.locate(b"g"), Some((0, 4096)));
        assert_eq!(index.locate(b"m"), Some((1, 8192)));
        assert_eq!(index.locate(b"z"), Some((1, 8192)));
    }

    #[test]
    fn data_page_roundtrip_and_lookup() {
        let page = DataPage::new(vec![
            (b"apple".to_vec(), EntryValue::Set(b"1".to_vec())),
            (b"banana".to_vec(), EntryValue::Delete),
            (b"cherry".to_vec(), EntryValue::Set(b"3".to_vec())),
        ]);

        let decoded = DataPage::decode(&page.encode()).unwrap();
        assert_eq!(decoded.num_entries(), 3);
        assert_eq!(
            decoded.get(b"apple"),
            Some(&EntryValue::Set(b"1".to_vec()))
        );
        assert_eq!(decoded.get(b"banana"), Some(&EntryValue::Delete));
        assert_eq!(decoded.get(b"durian"), None);
    }
}
