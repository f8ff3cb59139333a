//! Append-only cell records.
//!
//! On-disk format:
//! ```text
//! [4 bytes: payload length (little-endian u32)]
//! [4 bytes: CRC32 of payload (little-endian u32)]
//! [32 bytes: cell hash]   \ payload
//! [N bytes: encoding]     /
//! ```

use std::io::{self, Read};

use lcs_store::{StoreError, StoreResult};
use lcs_types::{Hash, HASH_LENGTH};
use tracing::{debug, warn};

/// Length prefix plus CRC.
pub const RECORD_HEADER_SIZE: usize = 8;

/// Bytes from the start of a record to the start of its encoding.
pub const ENCODING_OFFSET: u64 = (RECORD_HEADER_SIZE + HASH_LENGTH) as u64;

const MAX_PAYLOAD: usize = u32::MAX as usize;

/// Where a stored encoding lives in the file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Location {
    pub offset: u64,
    pub len: u32,
}

/// Frame one record.
pub fn encode(hash: &Hash, encoding: &[u8]) -> StoreResult<Vec<u8>> {
    let payload_len = HASH_LENGTH + encoding.len();
    if payload_len > MAX_PAYLOAD {
        return Err(StoreError::Format(format!(
            "encoding of {} bytes is too large for a record",
            encoding.len()
        )));
    }
    let mut crc = crc32fast::Hasher::new();
    crc.update(hash.as_bytes());
    crc.update(encoding);

    let mut buf = Vec::with_capacity(RECORD_HEADER_SIZE + payload_len);
    buf.extend_from_slice(&(payload_len as u32).to_le_bytes());
    buf.extend_from_slice(&crc.finalize().to_le_bytes());
    buf.extend_from_slice(hash.as_bytes());
    buf.extend_from_slice(encoding);
    Ok(buf)
}

/// Result of scanning the record area of a file.
#[derive(Debug, Default)]
pub struct ScanOutcome {
    /// Intact records in file order.
    pub records: Vec<(Hash, Location)>,
    /// Offset just past the last complete record.
    pub valid_end: u64,
    /// Records dropped for a CRC mismatch.
    pub skipped: usize,
}

/// Read records front-to-back from `reader`, positioned at `start`.
///
/// Records that fail CRC validation are logged and skipped. A record whose
/// length runs past `file_len` is a torn write from a crash: scanning stops
/// there and `valid_end` marks where the file should be cut.
pub fn scan<R: Read>(mut reader: R, start: u64, file_len: u64) -> io::Result<ScanOutcome> {
    let mut outcome = ScanOutcome {
        valid_end: start,
        ..ScanOutcome::default()
    };
    let mut offset = start;

    while offset + RECORD_HEADER_SIZE as u64 <= file_len {
        let mut header = [0u8; RECORD_HEADER_SIZE];
        reader.read_exact(&mut header)?;
        let length = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let expected_crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

        let end = offset + RECORD_HEADER_SIZE as u64 + u64::from(length);
        if (length as usize) < HASH_LENGTH || end > file_len {
            warn!(offset, length, file_len, "torn record; stopping recovery");
            break;
        }

        let mut payload = vec![0u8; length as usize];
        reader.read_exact(&mut payload)?;

        let actual_crc = crc32fast::hash(&payload);
        if actual_crc != expected_crc {
            warn!(
                offset,
                expected = expected_crc,
                actual = actual_crc,
                "CRC mismatch; skipping record"
            );
            outcome.skipped += 1;
        } else {
            let mut hash = [0u8; HASH_LENGTH];
            hash.copy_from_slice(&payload[..HASH_LENGTH]);
            outcome.records.push((
                Hash::from_hash(hash),
                Location {
                    offset: offset + ENCODING_OFFSET,
                    len: length - HASH_LENGTH as u32,
                },
            ));
        }

        offset = end;
        outcome.valid_end = end;
    }

    debug!(
        records = outcome.records.len(),
        skipped = outcome.skipped,
        valid_end = outcome.valid_end,
        "record scan complete"
    );
    Ok(outcome)
}
