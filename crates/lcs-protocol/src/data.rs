//! Missing-data exchange.
//!
//! A node that meets a hash it does not hold sends a DATA_REQUEST listing
//! the hashes it wants. The peer answers with DATA carrying one value per
//! requested hash in the same order, or `Nil` where it does not have the
//! cell. The requester checks every value against the hash it asked for
//! before writing anything.

use std::collections::HashSet;

use lcs_store::{persist_shallow, Cell, CellStore, Hash, StoreError};
use tracing::{debug, warn};

use crate::config::ProtocolConfig;
use crate::error::{ProtocolError, ProtocolResult};
use crate::message::{Message, MessageType};

fn expect_type(msg: &Message, kind: MessageType) -> ProtocolResult<()> {
    let actual = msg.message_type();
    if actual != kind {
        return Err(ProtocolError::InvalidMessageType(actual.type_tag()));
    }
    Ok(())
}

/// The hashes a DATA_REQUEST asks for, in request order.
pub fn requested_hashes(msg: &Message) -> ProtocolResult<Vec<Hash>> {
    expect_type(msg, MessageType::DataRequest)?;
    msg.body()?
        .iter()
        .enumerate()
        .map(|(i, r)| {
            r.cell()
                .and_then(Cell::blob_bytes)
                .and_then(|bytes| Hash::from_slice(&bytes).ok())
                .ok_or_else(|| {
                    ProtocolError::MalformedPayload(format!("entry {i} is not a 32-byte hash"))
                })
        })
        .collect()
}

/// Build the DATA response to `request` from `store`.
///
/// A request naming more than `max_data_request_hashes` hashes is refused
/// with [`ProtocolError::DenialGuard`] before its payload is decoded, and
/// nothing is read.
pub fn serve_data_request<S: CellStore + ?Sized>(
    store: &S,
    request: &Message,
    config: &ProtocolConfig,
) -> ProtocolResult<Message> {
    expect_type(request, MessageType::DataRequest)?;
    let id = request
        .id()
        .ok_or_else(|| ProtocolError::MalformedPayload("data request without an id".into()))?;
    // Checked from the frame header so an oversized request is never decoded.
    let count = request
        .body_len()
        .ok_or_else(|| ProtocolError::MalformedPayload("data request without a body".into()))?;
    if count > config.max_data_request_hashes {
        warn!(
            id,
            count,
            max = config.max_data_request_hashes,
            "refusing oversized data request"
        );
        return Err(ProtocolError::DenialGuard {
            count,
            max: config.max_data_request_hashes,
        });
    }

    let hashes = requested_hashes(request)?;
    let mut values = Vec::with_capacity(hashes.len());
    let mut found = 0usize;
    for hash in &hashes {
        match store.read_cell(hash)? {
            Some(cell) => {
                found += 1;
                values.push(cell);
            }
            None => values.push(Cell::nil()),
        }
    }
    debug!(id, requested = hashes.len(), found, "serving data request");
    Message::data(id, values)
}

/// What a DATA response delivered.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DataOutcome {
    /// Requested hashes now present in the store.
    pub stored: Vec<Hash>,
    /// Requested hashes the peer did not have.
    pub missing: Vec<Hash>,
    /// Children of delivered cells that the store still lacks.
    pub unresolved: Vec<Hash>,
}

impl DataOutcome {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty() && self.unresolved.is_empty()
    }
}

/// Verify a DATA response against the hashes that were requested and write
/// each delivered cell into `store` (top level only).
///
/// A value whose hash differs from the one requested is rejected with
/// `HashMismatch`, unless it is `Nil`, which marks the cell as unavailable.
/// Cells written before a rejection stay written.
pub fn apply_data_response<S: CellStore + ?Sized>(
    store: &S,
    response: &Message,
    requested: &[Hash],
) -> ProtocolResult<DataOutcome> {
    expect_type(response, MessageType::Data)?;
    let values = response.body()?;
    if values.len() != requested.len() {
        return Err(ProtocolError::MalformedPayload(format!(
            "expected {} values, got {}",
            requested.len(),
            values.len()
        )));
    }

    let nil = Cell::nil().hash();
    let mut outcome = DataOutcome::default();
    let mut seen = HashSet::new();
    for (value, expected) in values.iter().zip(requested) {
        let computed = value.hash();
        if computed != *expected {
            if computed == nil {
                outcome.missing.push(*expected);
                continue;
            }
            warn!(%expected, %computed, "data response carried the wrong cell");
            return Err(StoreError::HashMismatch {
                expected: *expected,
                computed,
            }
            .into());
        }

        let Some(cell) = value.cell() else {
            if store.contains(expected)? {
                outcome.stored.push(*expected);
            } else {
                outcome.missing.push(*expected);
            }
            continue;
        };
        persist_shallow(store, value, None)?;
        outcome.stored.push(*expected);
        collect_unresolved(store, cell, &mut seen, &mut outcome.unresolved)?;
    }

    debug!(
        stored = outcome.stored.len(),
        missing = outcome.missing.len(),
        unresolved = outcome.unresolved.len(),
        "applied data response"
    );
    Ok(outcome)
}

/// Walk the children of a delivered cell. Attached cells are written as
/// they are found; refs with nothing attached and nothing stored are
/// reported.
fn collect_unresolved<S: CellStore + ?Sized>(
    store: &S,
    cell: &Cell,
    seen: &mut HashSet<Hash>,
    unresolved: &mut Vec<Hash>,
) -> ProtocolResult<()> {
    let mut stack = vec![cell.clone()];
    while let Some(cell) = stack.pop() {
        for child in cell.refs() {
            if let Some(value) = child.cell().filter(|c| c.is_embedded()) {
                stack.push(value.clone());
                continue;
            }
            let hash = child.hash();
            if !seen.insert(hash) {
                continue;
            }
            match child.cell() {
                Some(value) => {
                    persist_shallow(store, child, None)?;
                    stack.push(value.clone());
                }
                None if !store.contains(&hash)? => unresolved.push(hash),
                None => {}
            }
        }
    }
    Ok(())
}
