//! Canonical encoding primitives.
//!
//! Every cell encoding starts with a one-byte [`tag`]. Counts and lengths are
//! unsigned LEB128 varints, signed integers are zig-zag mapped first. The
//! [`Reader`] rejects non-minimal varints: a second spelling of the same
//! value would produce a second hash for the same cell.

use lcs_types::{Hash, HASH_LENGTH};

use crate::error::{StoreError, StoreResult};

/// Tag bytes identifying each cell kind.
pub mod tag {
    pub const NIL: u8 = 0x00;
    pub const INTEGER: u8 = 0x10;
    pub const AMOUNT: u8 = 0x19;
    /// Child slot holding only the hash of a non-embedded cell.
    pub const REF: u8 = 0x20;
    pub const STRING: u8 = 0x30;
    pub const BLOB: u8 = 0x31;
    pub const KEYWORD: u8 = 0x33;
    pub const VECTOR: u8 = 0x80;
    pub const FALSE: u8 = 0xB0;
    pub const TRUE: u8 = 0xB1;
}

/// Cells whose encoding is at most this many bytes are embedded: they are
/// written inline into their parent rather than referenced by hash.
pub const MAX_EMBEDDED_LENGTH: usize = 140;

/// Deepest chain of vectors one encoding may nest inline. Each inline level
/// costs at least two bytes, so an embedded cell can never go deeper.
pub const MAX_INLINE_DEPTH: usize = MAX_EMBEDDED_LENGTH / 2;

/// Encoded size of a child slot that refers to a cell by hash.
pub const REF_SLOT_LENGTH: usize = 1 + HASH_LENGTH;

/// Longest possible LEB128 encoding of a `u64`.
pub const MAX_VARINT_LENGTH: usize = 10;

/// Encode a u64 as a variable-length integer.
pub fn write_varint(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value > 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if value == 0 {
            break;
        }
    }
}

/// Number of bytes [`write_varint`] emits for `value`.
pub fn varint_length(value: u64) -> usize {
    let bits = 64 - value.leading_zeros() as usize;
    bits.max(1).div_ceil(7)
}

/// Map a signed integer onto the unsigned range so small magnitudes stay short.
pub fn zigzag(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

/// Inverse of [`zigzag`].
pub fn unzigzag(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}

/// Cursor over an encoding. Errors carry the absolute byte offset.
#[derive(Debug)]
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Current offset from the start of the input.
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    /// Bytes between `start` and the current position.
    pub fn slice_from(&self, start: usize) -> &'a [u8] {
        &self.data[start..self.pos]
    }

    /// A `BadFormat` error at the current offset.
    pub fn bad(&self, reason: impl Into<String>) -> StoreError {
        self.bad_at(self.pos, reason)
    }

    pub fn bad_at(&self, offset: usize, reason: impl Into<String>) -> StoreError {
        StoreError::BadFormat {
            offset,
            reason: reason.into(),
        }
    }

    pub fn peek_u8(&self) -> StoreResult<u8> {
        self.data
            .get(self.pos)
            .copied()
            .ok_or_else(|| self.bad("unexpected end of input"))
    }

    pub fn read_u8(&mut self) -> StoreResult<u8> {
        let byte = self.peek_u8()?;
        self.pos += 1;
        Ok(byte)
    }

    /// Decode a minimal LEB128 varint.
    pub fn read_varint(&mut self) -> StoreResult<u64> {
        let start = self.pos;
        let mut value: u64 = 0;
        let mut shift = 0u32;
        loop {
            let byte = match self.data.get(self.pos) {
                Some(b) => *b,
                None => return Err(self.bad_at(start, "truncated varint")),
            };
            self.pos += 1;
            let bits = u64::from(byte & 0x7F);
            if shift == 63 && bits > 1 {
                return Err(self.bad_at(start, "varint overflow"));
            }
            value |= bits << shift;
            if byte & 0x80 == 0 {
                if byte == 0 && self.pos - start > 1 {
                    return Err(self.bad_at(start, "non-minimal varint"));
                }
                return Ok(value);
            }
            shift += 7;
            if shift > 63 {
                return Err(self.bad_at(start, "varint overflow"));
            }
        }
    }

    /// Read a varint that counts following bytes or items, checking it
    /// against both `max` and the bytes actually left in the input.
    pub fn read_length(&mut self, max: usize, what: &str) -> StoreResult<usize> {
        let start = self.pos;
        let raw = self.read_varint()?;
        let len = usize::try_from(raw).map_err(|_| self.bad_at(start, format!("{what} too large")))?;
        if len > max {
            return Err(self.bad_at(start, format!("{what} {len} exceeds maximum {max}")));
        }
        if len > self.remaining() {
            return Err(self.bad_at(
                start,
                format!("{what} {len} exceeds remaining {} bytes", self.remaining()),
            ));
        }
        Ok(len)
    }

    pub fn read_bytes(&mut self, len: usize) -> StoreResult<&'a [u8]> {
        if len > self.remaining() {
            return Err(self.bad(format!(
                "need {len} bytes, {} remaining",
                self.remaining()
            )));
        }
        let bytes = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    pub fn read_hash(&mut self) -> StoreResult<Hash> {
        let bytes = self.read_bytes(HASH_LENGTH)?;
        Hash::from_slice(bytes).map_err(|e| self.bad(e.to_string()))
    }

    /// Skip over one cell encoding without building it.
    ///
    /// Nested vectors are walked with an explicit stack and rejected past
    /// [`MAX_INLINE_DEPTH`], the same bound decoding applies.
    pub fn skip_cell(&mut self) -> StoreResult<()> {
        // Children still to skip at each open vector level.
        let mut open: Vec<usize> = Vec::new();
        loop {
            let start = self.pos;
            match self.read_u8()? {
                tag::NIL | tag::FALSE | tag::TRUE => {}
                tag::INTEGER | tag::AMOUNT => {
                    self.read_varint()?;
                }
                tag::REF => {
                    self.read_bytes(HASH_LENGTH)?;
                }
                tag::STRING | tag::BLOB | tag::KEYWORD => {
                    let len = self.read_length(usize::MAX, "length")?;
                    self.read_bytes(len)?;
                }
                tag::VECTOR => {
                    let count = self.read_length(usize::MAX, "element count")?;
                    if count > 0 {
                        if open.len() >= MAX_INLINE_DEPTH {
                            return Err(self.bad_at(start, "inline nesting too deep"));
                        }
                        open.push(count);
                        continue;
                    }
                }
                other => return Err(self.bad_at(start, format!("unknown tag 0x{other:02x}"))),
            }
            // One cell finished: close every vector it completes.
            loop {
                match open.last_mut() {
                    None => return Ok(()),
                    Some(left) if *left > 1 => {
                        *left -= 1;
                        break;
                    }
                    Some(_) => {
                        open.pop();
                    }
                }
            }
        }
    }
}
