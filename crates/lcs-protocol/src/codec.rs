//! Byte-level encodings for messages.
//!
//! A message frame is `[1 byte: type code][multi-cell encoding]`. The
//! multi-cell encoding is the payload cell's canonical encoding followed by
//! zero or more `[varint length][encoding]` entries, one per non-embedded
//! cell that travels with the payload. After decoding, each attached cell
//! is wired into the payload graph under the ref that names its hash.
//!
//! On a stream, frames are prefixed with a 4-byte big-endian length.

use std::collections::{HashMap, HashSet};

use bytes::{Buf, Bytes, BytesMut};
use lcs_store::encoding::{varint_length, write_varint, Reader};
use lcs_store::{Cell, Hash, StoreError, StoreResult};
use tracing::debug;

use crate::config::{ProtocolConfig, MAX_MESSAGE_SIZE};
use crate::error::{ProtocolError, ProtocolResult};
use crate::message::Message;

/// Length of the stream frame prefix.
pub const FRAME_PREFIX_SIZE: usize = 4;

/// Non-embedded cells reachable from `top` without passing through another
/// non-embedded cell, each once. Unresolved refs are skipped.
pub fn branch_cells(top: &Cell) -> Vec<Cell> {
    let mut out = Vec::new();
    let mut seen = HashSet::new();
    let mut stack = vec![top.clone()];
    while let Some(cell) = stack.pop() {
        for child in cell.refs().iter().rev() {
            let Some(value) = child.cell() else { continue };
            if value.is_embedded() {
                stack.push(value.clone());
            } else if seen.insert(value.hash()) {
                out.push(value.clone());
            }
        }
    }
    out
}

/// Encode `top` together with its branch cells.
pub fn encode_cells(top: &Cell) -> Vec<u8> {
    let extras = branch_cells(top);
    let extra_len: usize = extras
        .iter()
        .map(|c| varint_length(c.encoding_length() as u64) + c.encoding_length())
        .sum();
    let mut buf = Vec::with_capacity(top.encoding_length() + extra_len);
    buf.extend_from_slice(top.encoding());
    for cell in &extras {
        write_varint(&mut buf, cell.encoding_length() as u64);
        buf.extend_from_slice(cell.encoding());
    }
    buf
}

/// Decode a multi-cell encoding, returning the top cell with every
/// attached cell resolved into place.
///
/// Attached cells nobody refers to are dropped. Error offsets are relative
/// to the start of `bytes`.
pub fn decode_cells(bytes: &[u8]) -> StoreResult<Cell> {
    let mut reader = Reader::new(bytes);
    let top = Cell::read_from(&mut reader)?;

    let mut attached: HashMap<Hash, Cell> = HashMap::new();
    while !reader.is_empty() {
        let len = reader.read_length(usize::MAX, "attached cell length")?;
        let start = reader.position();
        let slice = reader.read_bytes(len)?;
        let cell = Cell::decode(slice).map_err(|e| shift_offset(e, start))?;
        attached.insert(cell.hash(), cell);
    }
    if attached.is_empty() {
        return Ok(top);
    }

    let total = attached.len();
    let mut used = 0usize;
    let mut visited = HashSet::new();
    let mut stack = vec![top.clone()];
    while let Some(cell) = stack.pop() {
        for child in cell.refs() {
            if !visited.insert(child.hash()) {
                continue;
            }
            if let Some(value) = child.cell() {
                stack.push(value.clone());
            } else if let Some(value) = attached.get(&child.hash()) {
                stack.push(child.resolve(value.clone())?.clone());
                used += 1;
            }
        }
    }
    if used < total {
        debug!(total, used, "ignoring unreferenced attached cells");
    }
    Ok(top)
}

fn shift_offset(err: StoreError, by: usize) -> StoreError {
    match err {
        StoreError::BadFormat { offset, reason } => StoreError::BadFormat {
            offset: offset + by,
            reason,
        },
        other => other,
    }
}

/// Length-prefixed framing for byte streams.
#[derive(Clone, Copy, Debug)]
pub struct MessageCodec {
    max_message_size: usize,
}

impl MessageCodec {
    pub fn new(config: &ProtocolConfig) -> Self {
        Self {
            max_message_size: config.max_message_size,
        }
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    /// Encode a message with framing: [4 bytes len][frame].
    pub fn encode(&self, msg: &Message) -> ProtocolResult<Vec<u8>> {
        let frame = msg.to_bytes();
        self.check_size(frame.len())?;
        let len = u32::try_from(frame.len()).map_err(|_| ProtocolError::MessageTooLarge {
            size: frame.len(),
            max: self.max_message_size,
        })?;
        let mut buf = Vec::with_capacity(FRAME_PREFIX_SIZE + frame.len());
        buf.extend_from_slice(&len.to_be_bytes());
        buf.extend_from_slice(&frame);
        Ok(buf)
    }

    /// Decode one framed message. Returns (message, bytes_consumed).
    ///
    /// Only the frame boundary is checked here; the payload is decoded on
    /// first use.
    pub fn decode(&self, data: &[u8]) -> ProtocolResult<(Message, usize)> {
        let len = self
            .frame_length(data)?
            .ok_or_else(|| ProtocolError::FramingError("too short".into()))?;
        let total = FRAME_PREFIX_SIZE + len;
        if data.len() < total {
            return Err(ProtocolError::FramingError(format!(
                "incomplete: have {}, need {}",
                data.len(),
                total
            )));
        }
        let frame = Bytes::copy_from_slice(&data[FRAME_PREFIX_SIZE..total]);
        Ok((Message::from_bytes(frame), total))
    }

    /// Take the next complete message off the front of a stream buffer.
    ///
    /// `Ok(None)` until the whole frame has arrived. A zero-length or
    /// oversized frame is an error and leaves the buffer untouched.
    pub fn decode_from(&self, buf: &mut BytesMut) -> ProtocolResult<Option<Message>> {
        let Some(len) = self.frame_length(&buf[..])? else {
            return Ok(None);
        };
        let total = FRAME_PREFIX_SIZE + len;
        if buf.len() < total {
            buf.reserve(total - buf.len());
            return Ok(None);
        }
        buf.advance(FRAME_PREFIX_SIZE);
        Ok(Some(Message::from_bytes(buf.split_to(len).freeze())))
    }

    fn frame_length(&self, data: &[u8]) -> ProtocolResult<Option<usize>> {
        let Some(prefix) = data.get(..FRAME_PREFIX_SIZE) else {
            return Ok(None);
        };
        let len = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
        if len == 0 {
            return Err(ProtocolError::FramingError("zero-length frame".into()));
        }
        self.check_size(len)?;
        Ok(Some(len))
    }

    fn check_size(&self, size: usize) -> ProtocolResult<()> {
        if size > self.max_message_size {
            return Err(ProtocolError::MessageTooLarge {
                size,
                max: self.max_message_size,
            });
        }
        Ok(())
    }
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self {
            max_message_size: MAX_MESSAGE_SIZE,
        }
    }
}
