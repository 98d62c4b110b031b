//! The options container codec.
//!
//! Job payloads are opaque engine-format blobs, with one exception: the slave
//! must append the implicit `masterid` and `timallow` options before handing
//! the options over to the engine. The container is therefore a flat list of
//! typed cells that this module can decode, extend, and re-encode without
//! understanding cell contents.
//!
//! On the wire: `count u32`, then per cell `tag u8, len u32, payload`.
//! Tags: 0 = raw bytes, 1 = UTF-8 string, 2 = u64 (len 8).

use std::{error, fmt};

use bytes::{Buf, BufMut, Bytes, BytesMut};

const TAG_BYTES: u8 = 0;
const TAG_STR: u8 = 1;
const TAG_U64: u8 = 2;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Cell {
    Bytes(Bytes),
    Str(String),
    U64(u64),
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CellList(pub Vec<Cell>);

impl CellList {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn push_str(&mut self, s: &str) {
        self.0.push(Cell::Str(s.to_owned()));
    }

    pub fn push_u64(&mut self, n: u64) {
        self.0.push(Cell::U64(n));
    }

    pub fn decode(mut src: &[u8]) -> Result<CellList, Error> {
        if src.len() < 4 {
            return Err(Error::Truncated);
        }

        let count = src.get_u32_le() as usize;
        let mut cells = Vec::with_capacity(count.min(1024));

        for _ in 0..count {
            if src.len() < 5 {
                return Err(Error::Truncated);
            }

            let tag = src.get_u8();
            let len = src.get_u32_le() as usize;
            if src.len() < len {
                return Err(Error::Truncated);
            }

            let payload = &src[..len];
            cells.push(match tag {
                TAG_BYTES => Cell::Bytes(Bytes::copy_from_slice(payload)),
                TAG_STR => Cell::Str(
                    String::from_utf8(payload.to_vec()).map_err(|_| Error::BadString)?,
                ),
                TAG_U64 => {
                    if len != 8 {
                        return Err(Error::BadLen { tag, len });
                    }
                    // Panic safety: len == 8 asserted above.
                    Cell::U64(u64::from_le_bytes(payload.try_into().unwrap()))
                },
                _ => return Err(Error::BadTag(tag)),
            });
            src.advance(len);
        }

        if !src.is_empty() {
            return Err(Error::TrailingBytes(src.len()));
        }

        Ok(CellList(cells))
    }

    pub fn encode(&self) -> Bytes {
        let mut dst = BytesMut::new();
        dst.put_u32_le(self.0.len() as u32);

        for cell in &self.0 {
            match cell {
                Cell::Bytes(b) => {
                    dst.put_u8(TAG_BYTES);
                    dst.put_u32_le(b.len() as u32);
                    dst.put_slice(b);
                },
                Cell::Str(s) => {
                    dst.put_u8(TAG_STR);
                    dst.put_u32_le(s.len() as u32);
                    dst.put_slice(s.as_bytes());
                },
                Cell::U64(n) => {
                    dst.put_u8(TAG_U64);
                    dst.put_u32_le(8);
                    dst.put_u64_le(*n);
                },
            }
        }

        dst.freeze()
    }

    /// Decodes an options blob, tolerating foreign formats: a blob this codec
    /// can't parse is preserved verbatim as a single raw cell, so appended
    /// implicit options never destroy what the master sent.
    pub fn decode_lossy(src: &[u8]) -> CellList {
        match CellList::decode(src) {
            Ok(list) => list,
            Err(_) if src.is_empty() => CellList::default(),
            Err(_) => CellList(vec![Cell::Bytes(Bytes::copy_from_slice(src))]),
        }
    }
}

#[derive(Debug)]
pub enum Error {
    Truncated,
    BadTag(u8),
    BadLen { tag: u8, len: usize },
    BadString,
    TrailingBytes(usize),
}

impl error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}
