//! Fixed-granularity page framing.
//!
//! Every page begins with a 4-byte little-endian page size and a 4-byte
//! CRC32 of its payload; the page is zero-padded to the next granule.
//! Readers first fetch one granule to learn the page size, then the
//! remainder. A CRC mismatch is a hard error; the caller decides whether it
//! is fatal for the process.

use std::fs::File;
use std::os::unix::fs::FileExt;

use anyhow::{bail, Error};

use silo_tools::io::{ByteReader, WriteLeExt};

use crate::{PAGE_GRAN, PAGE_HEAD_SIZE};

fn round_up_to_gran(len: usize) -> usize {
    (len + PAGE_GRAN - 1) / PAGE_GRAN * PAGE_GRAN
}

pub fn crc32(data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Frame `payload` into a padded page image ready to be written at a
/// granule-aligned offset.
pub fn frame_page(payload: &[u8]) -> Vec<u8> {
    let logical_size = PAGE_HEAD_SIZE + payload.len();
    let padded_size = round_up_to_gran(logical_size);

    let mut page = Vec::with_capacity(padded_size);
    page.put_le_u32(logical_size as u32);
    page.put_le_u32(crc32(payload));
    page.put_bytes(payload);
    page.resize(padded_size, 0);
    page
}

/// Size a framed page will occupy on disk.
pub fn framed_size(payload_len: usize) -> usize {
    round_up_to_gran(PAGE_HEAD_SIZE + payload_len)
}

/// Read one page at `offset` and return its payload after CRC verification.
pub fn read_page_at(file: &File, offset: u64) -> Result<Vec<u8>, Error> {
    let mut first = vec![0u8; PAGE_GRAN];
    file.read_exact_at(&mut first, offset)?;

    let mut head = ByteReader::new(&first);
    let logical_size = head.get_le_u32()? as usize;
    let checksum = head.get_le_u32()?;

    if logical_size < PAGE_HEAD_SIZE {
        bail!("invalid page size {} at offset {}", logical_size, offset);
    }

    let mut page = first;
    if logical_size > PAGE_GRAN {
        page.resize(logical_size, 0);
        file.read_exact_at(&mut page[PAGE_GRAN..], offset + PAGE_GRAN as u64)?;
    } else {
        page.truncate(logical_size);
    }

    let payload = page.split_off(PAGE_HEAD_SIZE);
    let computed = crc32(&payload);
    if computed != checksum {
        bail!(
            "page checksum mismatch at offset {} (stored {:08x}, computed {:08x})",
            offset,
            checksum,
            computed
        );
    }

    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn tmp_file(data: &[u8]) -> File {
        let dir = std::env::temp_dir().join(".silo-test-page");
        let _ = std::fs::create_dir_all(&dir);
        let path = dir.join(format!("page-{}", data.len()));
        let mut f = File::create(&path).unwrap();
        f.write_all(data).unwrap();
        File::open(&path).unwrap()
    }

    #[test]
    fn page_roundtrip_small() {
        let payload = b"hello pages".to_vec();
        let framed = frame_page(&payload);
        assert_eq!(framed.len(), PAGE_GRAN);

        let file = tmp_file(&framed);
        assert_eq!(read_page_at(&file, 0).unwrap(), payload);
    }

    #[test]
    fn page_roundtrip_multi_granule() {
        let payload = vec![0xabu8; PAGE_GRAN * 2 + 17];
        let framed = frame_page(&payload);
        assert_eq!(framed.len() % PAGE_GRAN, 0);
        assert_eq!(framed.len(), framed_size(payload.len()));

        let file = tmp_file(&framed);
        assert_eq!(read_page_at(&file, 0).unwrap(), payload);
    }

    #[test]
    fn corrupt_page_detected() {
        let mut framed = frame_page(b"some payload");
        framed[PAGE_HEAD_SIZE + 3] ^= 0x40;
        let file = tmp_file(&framed);
        let err = read_page_at(&file, 0).unwrap_err();
        assert!(err.to_string().contains("checksum mismatch"));
    }
}
