//! ASCII wire format for replication messages.
//!
//! Messages are `:`-separated fields: a one-byte type tag, unsigned decimal
//! numbers, and length-prefixed binary payloads (`<len>:<raw bytes>`). The
//! payload bytes are raw; only the length field in front of them is parsed.

use anyhow::{bail, Error};

#[derive(Default)]
pub struct MessageWriter {
    buf: Vec<u8>,
}

impl MessageWriter {
    pub fn new() -> Self {
        Self::default()
    }

    fn sep(&mut self) {
        if !self.buf.is_empty() {
            self.buf.push(b':');
        }
    }

    pub fn field_char(&mut self, c: u8) -> &mut Self {
        self.sep();
        self.buf.push(c);
        self
    }

    pub fn field_u64(&mut self, v: u64) -> &mut Self {
        self.sep();
        self.buf.extend_from_slice(v.to_string().as_bytes());
        self
    }

    pub fn field_bytes(&mut self, data: &[u8]) -> &mut Self {
        self.field_u64(data.len() as u64);
        self.buf.push(b':');
        self.buf.extend_from_slice(data);
        self
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

pub struct MessageReader<'a> {
    data: &'a [u8],
    pos: usize,
    first: bool,
}

impl<'a> MessageReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            first: true,
        }
    }

    fn sep(&mut self) -> Result<(), Error> {
        if self.first {
            self.first = false;
            return Ok(());
        }
        if self.pos >= self.data.len() || self.data[self.pos] != b':' {
            bail!("malformed message: missing separator at {}", self.pos);
        }
        self.pos += 1;
        Ok(())
    }

    pub fn read_char(&mut self) -> Result<u8, Error> {
        self.sep()?;
        if self.pos >= self.data.len() {
            bail!("malformed message: missing type char");
        }
        let c = self.data[self.pos];
        self.pos += 1;
        Ok(c)
    }

    pub fn read_u64(&mut self) -> Result<u64, Error> {
        self.sep()?;
        let start = self.pos;
        while self.pos < self.data.len() && self.data[self.pos].is_ascii_digit() {
            self.pos += 1;
        }
        if self.pos == start {
            bail!("malformed message: expected number at {}", start);
        }
        let digits = std::str::from_utf8(&self.data[start..self.pos])?;
        Ok(digits.parse()?)
    }

    pub fn read_bytes(&mut self) -> Result<&'a [u8], Error> {
        let len = self.read_u64()? as usize;
        if self.pos >= self.data.len() || self.data[self.pos] != b':' {
            bail!("malformed message: missing payload separator");
        }
        self.pos += 1;
        if self.data.len() - self.pos < len {
            bail!(
                "malformed message: payload truncated ({} of {} bytes)",
                self.data.len() - self.pos,
                len
            );
        }
        let payload = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(payload)
    }

    pub fn expect_end(&self) -> Result<(), Error> {
        if self.pos != self.data.len() {
            bail!("malformed message: {} trailing bytes", self.data.len() - self.pos);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_with_binary_payload() {
        let mut w = MessageWriter::new();
        w.field_char(b'P')
            .field_u64(3)
            .field_u64(65538)
            .field_bytes(b"raw:with:colons\x00\xff");
        let bytes = w.into_bytes();

        let mut r = MessageReader::new(&bytes);
        assert_eq!(r.read_char().unwrap(), b'P');
        assert_eq!(r.read_u64().unwrap(), 3);
        assert_eq!(r.read_u64().unwrap(), 65538);
        assert_eq!(r.read_bytes().unwrap(), b"raw:with:colons\x00\xff");
        r.expect_end().unwrap();
    }

    #[test]
    fn empty_payload() {
        let mut w = MessageWriter::new();
        w.field_char(b'l').field_bytes(b"");
        let bytes = w.into_bytes();
        assert_eq!(bytes, b"l:0:");

        let mut r = MessageReader::new(&bytes);
        assert_eq!(r.read_char().unwrap(), b'l');
        assert_eq!(r.read_bytes().unwrap(), b"");
        r.expect_end().unwrap();
    }

    #[test]
    fn malformed_rejected() {
        let mut r = MessageReader::new(b"p:abc");
        assert_eq!(r.read_char().unwrap(), b'p');
        assert!(r.read_u64().is_err());

        let mut r = MessageReader::new(b"p:5:xy");
        r.read_char().unwrap();
        assert!(r.read_bytes().is_err()); // payload shorter than length

        let mut r = MessageReader::new(b"p:1");
        r.read_char().unwrap();
        r.read_u64().unwrap();
        assert!(r.read_u64().is_err());
    }
}
