//! Fixed-location file header holding the root pointer.
//!
//! On-disk format:
//! ```text
//! [4 bytes: magic "LCSD"]
//! [4 bytes: format version (little-endian u32)]
//! [44 bytes: root slot A]
//! [44 bytes: root slot B]
//! ```
//! A root slot is `[seq u64 LE][hash 32 bytes][CRC32 of the preceding 40 bytes, u32 LE]`.
//! The valid slot with the higher sequence holds the root. Updates always
//! overwrite the other slot, so a torn update leaves the previous root intact.

use lcs_store::{StoreError, StoreResult};
use lcs_types::{Hash, HASH_LENGTH};

pub const MAGIC: &[u8; 4] = b"LCSD";
pub const FORMAT_VERSION: u32 = 1;

const SLOT_BODY: usize = 8 + HASH_LENGTH;
pub const SLOT_SIZE: usize = SLOT_BODY + 4;
const SLOTS_START: usize = 8;

/// Offset of the first cell record.
pub const HEADER_SIZE: u64 = (SLOTS_START + 2 * SLOT_SIZE) as u64;

/// One root pointer generation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RootSlot {
    pub seq: u64,
    pub hash: Hash,
}

impl RootSlot {
    pub fn encode(&self) -> [u8; SLOT_SIZE] {
        let mut buf = [0u8; SLOT_SIZE];
        buf[..8].copy_from_slice(&self.seq.to_le_bytes());
        buf[8..SLOT_BODY].copy_from_slice(self.hash.as_bytes());
        let crc = crc32fast::hash(&buf[..SLOT_BODY]);
        buf[SLOT_BODY..].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    /// `None` for a never-written or torn slot.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != SLOT_SIZE {
            return None;
        }
        let crc = u32::from_le_bytes(bytes[SLOT_BODY..].try_into().ok()?);
        if crc32fast::hash(&bytes[..SLOT_BODY]) != crc {
            return None;
        }
        let seq = u64::from_le_bytes(bytes[..8].try_into().ok()?);
        if seq == 0 {
            return None;
        }
        let hash = Hash::from_slice(&bytes[8..SLOT_BODY]).ok()?;
        Some(Self { seq, hash })
    }
}

/// Parsed header state.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Header {
    slots: [Option<RootSlot>; 2],
}

impl Header {
    /// Header bytes for a brand-new file: no root in either slot.
    pub fn fresh_bytes() -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE as usize);
        buf.extend_from_slice(MAGIC);
        buf.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        buf.resize(HEADER_SIZE as usize, 0);
        buf
    }

    pub fn parse(bytes: &[u8]) -> StoreResult<Self> {
        if bytes.len() < HEADER_SIZE as usize {
            return Err(StoreError::Corrupt(format!(
                "header is {} bytes, expected {HEADER_SIZE}",
                bytes.len()
            )));
        }
        if &bytes[..4] != MAGIC {
            return Err(StoreError::Corrupt("not an LCS data file (bad magic)".into()));
        }
        let version = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        if version != FORMAT_VERSION {
            return Err(StoreError::Corrupt(format!(
                "unsupported format version {version}"
            )));
        }
        let slot = |i: usize| {
            let start = SLOTS_START + i * SLOT_SIZE;
            RootSlot::decode(&bytes[start..start + SLOT_SIZE])
        };
        Ok(Self {
            slots: [slot(0), slot(1)],
        })
    }

    /// The newest valid root slot.
    pub fn current(&self) -> Option<RootSlot> {
        self.slots.iter().flatten().max_by_key(|s| s.seq).copied()
    }

    /// Slot index and contents for the next root update.
    pub fn next(&self, hash: Hash) -> (usize, RootSlot) {
        let newest = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.map(|s| (i, s.seq)))
            .max_by_key(|(_, seq)| *seq);
        let (index, seq) = match newest {
            Some((i, seq)) => (1 - i, seq + 1),
            None => (0, 1),
        };
        (index, RootSlot { seq, hash })
    }

    pub fn install(&mut self, index: usize, slot: RootSlot) {
        self.slots[index] = Some(slot);
    }

    /// File offset of slot `index`.
    pub fn slot_offset(index: usize) -> u64 {
        (SLOTS_START + index * SLOT_SIZE) as u64
    }
}
