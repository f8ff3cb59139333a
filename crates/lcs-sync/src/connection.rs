//! A message link to one remote node.
//!
//! Outbound messages are framed with [`MessageCodec`] and pushed into an
//! mpsc channel as a length-prefixed byte stream that the transport
//! drains. Requests register a oneshot under their id. An inbound reply is
//! decoded and then routed to the waiter for its id; one that fails to
//! decode is dropped. Inbound DATA_REQUESTs are answered from the local
//! store.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use lcs_protocol::{
    serve_data_request, Message, MessageCodec, MessageType, ProtocolConfig, ProtocolError,
};
use lcs_store::CellStore;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{SyncError, SyncResult};
use crate::transport::DataSource;

struct Waiter {
    ticket: u64,
    tx: oneshot::Sender<Message>,
}

type Pending = Arc<Mutex<HashMap<i64, Waiter>>>;

pub struct PeerConnection {
    outbound: mpsc::UnboundedSender<Bytes>,
    pending: Pending,
    next_id: AtomicI64,
    next_ticket: AtomicU64,
    codec: MessageCodec,
    store: Arc<dyn CellStore>,
    config: ProtocolConfig,
}

/// Drops the pending entry if the waiting request is cancelled. An entry
/// that has since been taken over by another request is left alone.
struct PendingGuard {
    pending: Pending,
    id: i64,
    ticket: u64,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        let mut pending = self.pending.lock().expect("pending map lock poisoned");
        if let Entry::Occupied(entry) = pending.entry(self.id) {
            if entry.get().ticket == self.ticket {
                entry.remove();
            }
        }
    }
}

impl PeerConnection {
    /// A connection serving from `store`, plus the receiver of its outbound
    /// byte stream.
    pub fn new(
        store: Arc<dyn CellStore>,
        config: ProtocolConfig,
    ) -> (Self, mpsc::UnboundedReceiver<Bytes>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let conn = Self {
            outbound,
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicI64::new(1),
            next_ticket: AtomicU64::new(0),
            codec: MessageCodec::new(&config),
            store,
            config,
        };
        (conn, rx)
    }

    /// Two connections wired to each other in this process. Each side
    /// stays reachable only while its handle is held.
    pub fn pair(
        a: Arc<dyn CellStore>,
        b: Arc<dyn CellStore>,
        config: ProtocolConfig,
    ) -> (Arc<Self>, Arc<Self>) {
        let (a, a_rx) = Self::new(a, config.clone());
        let (b, b_rx) = Self::new(b, config);
        let (a, b) = (Arc::new(a), Arc::new(b));
        spawn_link(a_rx, &b);
        spawn_link(b_rx, &a);
        (a, b)
    }

    /// A request id no other request on this connection has been given.
    pub fn next_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Requests still waiting for a reply.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().expect("pending map lock poisoned").len()
    }

    /// Frame and send a message without waiting for anything back.
    pub fn send(&self, msg: &Message) -> SyncResult<()> {
        let wire = self.codec.encode(msg)?;
        self.outbound
            .send(Bytes::from(wire))
            .map_err(|_| SyncError::ConnectionClosed)
    }

    /// Send an id-bearing request and wait for the reply with the same id.
    ///
    /// An id that is already waiting for a reply is refused with
    /// [`SyncError::DuplicateRequest`]. Dropping the returned future
    /// abandons the request.
    pub async fn request(&self, msg: Message) -> SyncResult<Message> {
        let id = msg.id().ok_or_else(|| {
            ProtocolError::MalformedPayload(format!("{} carries no id", msg.message_type()))
        })?;
        let (tx, rx) = oneshot::channel();
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        match self.pending.lock().expect("pending map lock poisoned").entry(id) {
            Entry::Occupied(_) => return Err(SyncError::DuplicateRequest(id)),
            Entry::Vacant(slot) => {
                slot.insert(Waiter { ticket, tx });
            }
        }
        let _guard = PendingGuard {
            pending: Arc::clone(&self.pending),
            id,
            ticket,
        };
        self.send(&msg)?;
        rx.await.map_err(|_| SyncError::ConnectionClosed)
    }

    /// Dispatch one unframed message received from the remote side.
    pub fn handle_inbound(&self, frame: Bytes) {
        self.receive(Message::from_bytes(frame));
    }

    /// Dispatch one message received from the remote side.
    ///
    /// Garbage from the peer is logged and dropped; it never fails the
    /// connection.
    pub fn receive(&self, msg: Message) {
        let declared = msg.message_type();
        match declared {
            MessageType::Data | MessageType::Result | MessageType::Status
                if msg.payload().is_ok() =>
            {
                self.route_reply(msg)
            }
            MessageType::DataRequest => self.answer_data_request(msg),
            MessageType::Goodbye => {
                debug!("peer said goodbye");
                self.fail_pending();
            }
            MessageType::Belief | MessageType::Query | MessageType::Transact => {
                debug!(message_type = %declared, "no handler for message; ignoring")
            }
            _ => warn!(declared = %declared, "dropping unintelligible message"),
        }
    }

    fn route_reply(&self, msg: Message) {
        let Some(id) = msg.id() else {
            warn!(message_type = %msg.message_type(), "reply without id; dropping");
            return;
        };
        let waiter = self
            .pending
            .lock()
            .expect("pending map lock poisoned")
            .remove(&id);
        match waiter {
            // The receiver may have timed out in the meantime.
            Some(waiter) => {
                let _ = waiter.tx.send(msg);
            }
            None => debug!(id, "reply for unknown or abandoned request"),
        }
    }

    fn answer_data_request(&self, msg: Message) {
        let outbound = self.outbound.clone();
        let codec = self.codec;
        let msg = msg.with_return_handler(Arc::new(move |reply: Message| {
            let wire = match codec.encode(&reply) {
                Ok(wire) => wire,
                Err(e) => {
                    warn!(id = ?reply.id(), error = %e, "reply cannot be framed");
                    return;
                }
            };
            if outbound.send(Bytes::from(wire)).is_err() {
                debug!("connection closed before reply could be sent");
            }
        }));
        match serve_data_request(&*self.store, &msg, &self.config) {
            Ok(reply) => {
                msg.return_message(reply);
            }
            Err(e) => warn!(id = ?msg.id(), error = %e, "not answering data request"),
        }
    }

    /// Wake every waiting request with `ConnectionClosed`.
    fn fail_pending(&self) {
        self.pending
            .lock()
            .expect("pending map lock poisoned")
            .clear();
    }
}

#[async_trait]
impl DataSource for PeerConnection {
    fn next_id(&self) -> i64 {
        PeerConnection::next_id(self)
    }

    async fn request_data(&self, request: Message) -> SyncResult<Message> {
        self.request(request).await
    }
}

/// Feed the byte stream from `rx` into `remote`, one framed message at a
/// time, until the channel closes or `remote` is dropped. The link does not
/// keep `remote` alive. A frame the codec refuses ends the link, since the
/// stream cannot be resynchronised after it.
pub fn spawn_link(
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    remote: &Arc<PeerConnection>,
) -> JoinHandle<()> {
    let codec = remote.codec;
    let remote = Arc::downgrade(remote);
    tokio::spawn(async move {
        let mut buf = BytesMut::new();
        'stream: while let Some(chunk) = rx.recv().await {
            buf.extend_from_slice(&chunk);
            loop {
                match codec.decode_from(&mut buf) {
                    Ok(Some(msg)) => {
                        let Some(remote) = remote.upgrade() else { break 'stream };
                        remote.receive(msg);
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "bad frame on link; closing");
                        break 'stream;
                    }
                }
            }
        }
        debug!("link closed");
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use lcs_store::encoding::tag;
    use lcs_store::{Cell, MemoryStore};

    fn stores() -> (Arc<MemoryStore>, Arc<MemoryStore>) {
        (Arc::new(MemoryStore::new()), Arc::new(MemoryStore::new()))
    }

    fn unframe(wire: Bytes) -> Message {
        let (msg, used) = MessageCodec::default().decode(&wire).unwrap();
        assert_eq!(used, wire.len());
        msg
    }

    async fn until_pending(conn: &PeerConnection, count: usize) {
        while conn.pending_count() < count {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn data_request_is_answered_by_the_remote_store() {
        let (a, b) = stores();
        let cell = Cell::string("r".repeat(300));
        b.write_cell(&cell).unwrap();
        let (a_conn, _b_conn) = PeerConnection::pair(a, b, ProtocolConfig::default());

        let id = a_conn.next_id();
        let reply = a_conn
            .request(Message::data_request(id, &[cell.hash()]).unwrap())
            .await
            .unwrap();
        assert_eq!(reply.id(), Some(id));
        assert_eq!(reply.body().unwrap()[0].cell().unwrap(), &cell);
        assert_eq!(a_conn.pending_count(), 0);
    }

    #[tokio::test]
    async fn concurrent_requests_get_their_own_replies() {
        let (a, b) = stores();
        let cells: Vec<Cell> = (0..4)
            .map(|i| Cell::string(format!("{i}{}", "c".repeat(200))))
            .collect();
        for cell in &cells {
            b.write_cell(cell).unwrap();
        }
        let (a_conn, _b_conn) = PeerConnection::pair(a, b, ProtocolConfig::default());

        let mut tasks = Vec::new();
        for cell in cells {
            let conn = Arc::clone(&a_conn);
            tasks.push(tokio::spawn(async move {
                let id = conn.next_id();
                let reply = conn
                    .request(Message::data_request(id, &[cell.hash()]).unwrap())
                    .await
                    .unwrap();
                (id, reply, cell)
            }));
        }
        for task in tasks {
            let (id, reply, cell) = task.await.unwrap();
            assert_eq!(reply.id(), Some(id));
            assert_eq!(reply.body().unwrap()[0].hash(), cell.hash());
        }
    }

    #[tokio::test]
    async fn garbage_frames_are_dropped() {
        let (a, _) = stores();
        let (conn, mut rx) = PeerConnection::new(a, ProtocolConfig::default());
        conn.handle_inbound(Bytes::from_static(&[0, 0xEE, 0xEE]));
        conn.handle_inbound(Bytes::new());
        conn.handle_inbound(Bytes::from_static(&[6, 0x80]));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn oversized_request_gets_no_reply() {
        let (a, _) = stores();
        let config = ProtocolConfig {
            max_data_request_hashes: 1,
            ..ProtocolConfig::default()
        };
        let (conn, mut rx) = PeerConnection::new(a, config);
        let hashes = [Cell::integer(1).hash(), Cell::integer(2).hash()];
        conn.handle_inbound(Message::data_request(5, &hashes).unwrap().to_bytes());
        assert!(rx.try_recv().is_err());

        conn.handle_inbound(Message::data_request(6, &hashes[..1]).unwrap().to_bytes());
        let reply = unframe(rx.try_recv().unwrap());
        assert_eq!(reply.id(), Some(6));
    }

    #[tokio::test]
    async fn abandoned_request_is_forgotten() {
        let (a, _) = stores();
        let (conn, _rx) = PeerConnection::new(a, ProtocolConfig::default());
        let request = Message::data_request(conn.next_id(), &[Cell::nil().hash()]).unwrap();
        let waited = tokio::time::timeout(Duration::from_millis(20), conn.request(request)).await;
        assert!(waited.is_err());
        assert_eq!(conn.pending_count(), 0);

        // A late reply finds nobody waiting and is ignored.
        conn.handle_inbound(Message::data(1, vec![Cell::nil()]).unwrap().to_bytes());
    }

    #[tokio::test]
    async fn goodbye_releases_waiters() {
        let (a, _) = stores();
        let (conn, _rx) = PeerConnection::new(a, ProtocolConfig::default());
        let conn = Arc::new(conn);
        let waiter = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move {
                let request = Message::data_request(conn.next_id(), &[Cell::nil().hash()]).unwrap();
                conn.request(request).await
            })
        };
        until_pending(&conn, 1).await;
        conn.handle_inbound(Message::goodbye().unwrap().to_bytes());
        assert!(matches!(waiter.await.unwrap(), Err(SyncError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn closed_channel_fails_requests() {
        let (a, _) = stores();
        let (conn, rx) = PeerConnection::new(a, ProtocolConfig::default());
        drop(rx);
        let request = Message::data_request(1, &[Cell::nil().hash()]).unwrap();
        assert!(matches!(conn.request(request).await, Err(SyncError::ConnectionClosed)));
        assert_eq!(conn.pending_count(), 0);
    }

    #[tokio::test]
    async fn outbound_messages_are_length_prefixed() {
        let (a, _) = stores();
        let (conn, mut rx) = PeerConnection::new(a, ProtocolConfig::default());
        let msg = Message::query(3, Cell::integer(4)).unwrap();
        conn.send(&msg).unwrap();
        let wire = rx.try_recv().unwrap();
        assert_eq!(&wire[..4], &(msg.to_bytes().len() as u32).to_be_bytes());
        assert_eq!(unframe(wire).id(), Some(3));
    }

    #[tokio::test]
    async fn message_over_the_size_limit_is_not_sent() {
        let (a, _) = stores();
        let config = ProtocolConfig {
            max_message_size: 32,
            ..ProtocolConfig::default()
        };
        let (conn, mut rx) = PeerConnection::new(a, config);
        let msg = Message::query(1, Cell::string("q".repeat(100))).unwrap();
        assert!(matches!(
            conn.send(&msg),
            Err(SyncError::Protocol(ProtocolError::MessageTooLarge { max: 32, .. }))
        ));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn link_closes_on_a_bad_frame() {
        let (a, _) = stores();
        let (remote, _remote_rx) = PeerConnection::new(a, ProtocolConfig::default());
        let remote = Arc::new(remote);
        let (tx, rx) = mpsc::unbounded_channel();
        let link = spawn_link(rx, &remote);
        tx.send(Bytes::from_static(&[0, 0, 0, 0])).unwrap();
        link.await.unwrap();
    }

    #[tokio::test]
    async fn deeply_nested_reply_is_dropped() {
        let (a, _) = stores();
        let (conn, _rx) = PeerConnection::new(a, ProtocolConfig::default());
        let conn = Arc::new(conn);
        let id = conn.next_id();
        let waiter = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move {
                conn.request(Message::data_request(id, &[Cell::nil().hash()]).unwrap())
                    .await
            })
        };
        until_pending(&conn, 1).await;

        let mut frame = vec![MessageType::Data.type_tag(), tag::VECTOR, 2];
        for _ in 0..1_000_000 {
            frame.extend_from_slice(&[tag::VECTOR, 1]);
        }
        frame.push(tag::NIL);
        conn.handle_inbound(Bytes::from(frame));
        assert_eq!(conn.pending_count(), 1);

        conn.handle_inbound(Message::data(id, vec![Cell::nil()]).unwrap().to_bytes());
        assert_eq!(waiter.await.unwrap().unwrap().id(), Some(id));
    }

    #[tokio::test]
    async fn undecodable_reply_is_not_handed_to_the_waiter() {
        let (a, _) = stores();
        let (conn, _rx) = PeerConnection::new(a, ProtocolConfig::default());
        let conn = Arc::new(conn);
        let id = conn.next_id();
        let waiter = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move {
                conn.request(Message::data_request(id, &[Cell::nil().hash()]).unwrap())
                    .await
            })
        };
        until_pending(&conn, 1).await;

        // [:data id <garbage>]: the id peeks fine but the payload is broken.
        let mut frame = vec![MessageType::Data.type_tag(), tag::VECTOR, 3, tag::KEYWORD, 4];
        frame.extend_from_slice(b"data");
        frame.extend_from_slice(&[tag::INTEGER, (id * 2) as u8, 0xEE]);
        conn.handle_inbound(Bytes::from(frame));
        assert_eq!(conn.pending_count(), 1);

        conn.handle_inbound(Message::data(id, vec![Cell::nil()]).unwrap().to_bytes());
        assert_eq!(waiter.await.unwrap().unwrap().id(), Some(id));
    }

    #[tokio::test]
    async fn duplicate_pending_id_is_refused() {
        let (a, _) = stores();
        let (conn, _rx) = PeerConnection::new(a, ProtocolConfig::default());
        let conn = Arc::new(conn);
        let first = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move {
                conn.request(Message::data_request(7, &[Cell::nil().hash()]).unwrap())
                    .await
            })
        };
        until_pending(&conn, 1).await;

        let again = Message::data_request(7, &[Cell::integer(1).hash()]).unwrap();
        assert!(matches!(conn.request(again).await, Err(SyncError::DuplicateRequest(7))));
        // The refused request leaves the first one registered.
        assert_eq!(conn.pending_count(), 1);

        conn.handle_inbound(Message::data(7, vec![Cell::nil()]).unwrap().to_bytes());
        assert_eq!(first.await.unwrap().unwrap().id(), Some(7));
    }

    #[test]
    fn stale_guard_leaves_a_newer_waiter_alone() {
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let (tx, _rx) = oneshot::channel();
        pending.lock().unwrap().insert(9, Waiter { ticket: 2, tx });

        drop(PendingGuard {
            pending: Arc::clone(&pending),
            id: 9,
            ticket: 1,
        });
        assert!(pending.lock().unwrap().contains_key(&9));

        drop(PendingGuard {
            pending: Arc::clone(&pending),
            id: 9,
            ticket: 2,
        });
        assert!(pending.lock().unwrap().is_empty());
    }
}
