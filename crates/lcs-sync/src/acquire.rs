//! Fetching a complete cell graph from a peer.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use lcs_protocol::{apply_data_response, DataOutcome, Message, ProtocolConfig};
use lcs_store::{missing_children, persist, Cell, CellStore, Hash, Ref, StoreError};
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::transport::DataSource;

/// Pulls missing cells from a [`DataSource`] into a local store.
///
/// Arrivals are written as they come in, so an acquisition that times out
/// or fails still leaves every fetched cell in the store.
pub struct Acquirer {
    source: Arc<dyn DataSource>,
    store: Arc<dyn CellStore>,
    config: ProtocolConfig,
}

impl Acquirer {
    pub fn new(
        source: Arc<dyn DataSource>,
        store: Arc<dyn CellStore>,
        config: ProtocolConfig,
    ) -> Self {
        Self {
            source,
            store,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn CellStore> {
        &self.store
    }

    /// Make the cell `hash` and everything reachable from it available
    /// locally, then persist it.
    pub async fn acquire(&self, hash: Hash, timeout: Duration) -> SyncResult<Cell> {
        match tokio::time::timeout(timeout, self.acquire_graph(hash)).await {
            Ok(result) => result,
            Err(_) => {
                let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
                warn!(%hash, timeout_ms, "acquisition timed out");
                Err(SyncError::Timeout { hash, timeout_ms })
            }
        }
    }

    async fn acquire_graph(&self, root: Hash) -> SyncResult<Cell> {
        let mut requested = HashSet::new();
        let mut frontier = VecDeque::new();
        if !self.store.contains(&root)? {
            requested.insert(root);
            frontier.push_back(root);
        }
        let mut rounds = 0usize;

        loop {
            while !frontier.is_empty() {
                let take = frontier.len().min(self.config.max_data_request_hashes.max(1));
                let batch: Vec<Hash> = frontier.drain(..take).collect();
                let outcome = self.fetch(&batch).await?;
                rounds += 1;
                if let Some(&hash) = outcome.missing.first() {
                    warn!(%hash, "peer does not have a required cell");
                    return Err(StoreError::MissingData(hash).into());
                }
                for hash in outcome.unresolved {
                    if requested.insert(hash) {
                        frontier.push_back(hash);
                    }
                }
            }

            match persist(&*self.store, &Ref::for_hash(root), None) {
                Ok(r) => {
                    info!(%root, rounds, "acquired cell graph");
                    return Ok(r.value_in(&*self.store)?);
                }
                // Something below a cell that was already local is absent.
                Err(StoreError::MissingData(_)) => {
                    let top = self
                        .store
                        .read_cell(&root)?
                        .ok_or(StoreError::MissingData(root))?;
                    for hash in missing_children(&*self.store, &top)? {
                        if !requested.insert(hash) {
                            return Err(StoreError::MissingData(hash).into());
                        }
                        frontier.push_back(hash);
                    }
                    if frontier.is_empty() {
                        return Err(StoreError::MissingData(root).into());
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn fetch(&self, batch: &[Hash]) -> SyncResult<DataOutcome> {
        let id = self.source.next_id();
        let request = Message::data_request(id, batch)?;
        debug!(id, count = batch.len(), "requesting cells");
        let reply = self.source.request_data(request).await?;
        if reply.id() != Some(id) {
            return Err(SyncError::UnexpectedReply {
                expected: id,
                actual: reply.id(),
            });
        }
        Ok(apply_data_response(&*self.store, &reply, batch)?)
    }
}
