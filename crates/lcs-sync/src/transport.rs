use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use lcs_protocol::{serve_data_request, Message, ProtocolConfig};
use lcs_store::CellStore;

use crate::error::SyncResult;

/// Something that answers DATA_REQUESTs.
#[async_trait]
pub trait DataSource: Send + Sync {
    /// An id for the next request. Every caller sharing this source draws
    /// from the same sequence, so concurrent requests never collide.
    fn next_id(&self) -> i64;

    /// Send `request` and wait for the DATA reply carrying the same id.
    async fn request_data(&self, request: Message) -> SyncResult<Message>;
}

/// A peer backed by a store in this process.
///
/// Requests and replies pass through their wire encoding, so the requester
/// never shares cell instances with the serving store.
pub struct LocalPeer {
    store: Arc<dyn CellStore>,
    config: ProtocolConfig,
    next_id: AtomicI64,
}

impl LocalPeer {
    pub fn new(store: Arc<dyn CellStore>, config: ProtocolConfig) -> Self {
        Self {
            store,
            config,
            next_id: AtomicI64::new(1),
        }
    }

    pub fn store(&self) -> &Arc<dyn CellStore> {
        &self.store
    }
}

#[async_trait]
impl DataSource for LocalPeer {
    fn next_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn request_data(&self, request: Message) -> SyncResult<Message> {
        let received = Message::from_bytes(request.to_bytes());
        let reply = serve_data_request(&*self.store, &received, &self.config)?;
        Ok(Message::from_bytes(reply.to_bytes()))
    }
}
