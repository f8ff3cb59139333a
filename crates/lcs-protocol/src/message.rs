//! Protocol messages.
//!
//! Every payload is a vector whose first element is a keyword naming the
//! message kind. Request/response kinds carry an integer id as the second
//! element so responses can be routed without decoding anything else.
//!
//! ```text
//! BELIEF        [:belief belief]
//! RESULT        [:result id value]
//! STATUS        [:status id value]
//! QUERY         [:query id form]
//! TRANSACT      [:transact id tx]
//! DATA_REQUEST  [:data-request id hash-blob...]
//! DATA          [:data id value-or-nil...]
//! GOODBYE       [:goodbye]
//! ```

use std::fmt;
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use lcs_store::encoding::{self, tag, Reader};
use lcs_store::{Cell, Hash, Ref, MAX_KEYWORD_LENGTH};
use tracing::warn;

use crate::codec;
use crate::error::{ProtocolError, ProtocolResult};

/// Message kinds with their frame type codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Unknown = 0,
    Belief = 1,
    Result = 2,
    Status = 3,
    Query = 4,
    Transact = 5,
    DataRequest = 6,
    Data = 7,
    Goodbye = 8,
}

impl MessageType {
    pub const ALL: [MessageType; 9] = [
        Self::Unknown,
        Self::Belief,
        Self::Result,
        Self::Status,
        Self::Query,
        Self::Transact,
        Self::DataRequest,
        Self::Data,
        Self::Goodbye,
    ];

    /// The byte written at the head of a frame.
    pub fn type_tag(self) -> u8 {
        self as u8
    }

    /// Unassigned codes map to [`MessageType::Unknown`].
    pub fn from_tag(code: u8) -> Self {
        Self::ALL
            .get(code as usize)
            .copied()
            .unwrap_or(Self::Unknown)
    }

    pub fn type_name(self) -> &'static str {
        match self {
            Self::Unknown => "UNKNOWN",
            Self::Belief => "BELIEF",
            Self::Result => "RESULT",
            Self::Status => "STATUS",
            Self::Query => "QUERY",
            Self::Transact => "TRANSACT",
            Self::DataRequest => "DATA_REQUEST",
            Self::Data => "DATA",
            Self::Goodbye => "GOODBYE",
        }
    }

    /// Keyword at the head of the payload.
    pub fn marker(self) -> Option<&'static str> {
        match self {
            Self::Unknown => None,
            Self::Belief => Some("belief"),
            Self::Result => Some("result"),
            Self::Status => Some("status"),
            Self::Query => Some("query"),
            Self::Transact => Some("transact"),
            Self::DataRequest => Some("data-request"),
            Self::Data => Some("data"),
            Self::Goodbye => Some("goodbye"),
        }
    }

    pub fn from_marker(name: &str) -> Self {
        Self::ALL
            .into_iter()
            .find(|t| t.marker() == Some(name))
            .unwrap_or(Self::Unknown)
    }

    /// Whether payloads of this kind carry a message id.
    pub fn has_id(self) -> bool {
        !matches!(self, Self::Unknown | Self::Belief | Self::Goodbye)
    }

    /// Index of the first body element in the payload vector.
    fn body_start(self) -> usize {
        if self.has_id() {
            2
        } else {
            1
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_name())
    }
}

/// Delivers a reply back to whoever sent the original message.
pub type ReturnHandler = Arc<dyn Fn(Message) + Send + Sync>;

/// One protocol message.
///
/// A message built locally holds its payload cell and encodes on demand.
/// A message read off the wire holds only its frame bytes; the type is
/// taken from the frame's type code, the id can be peeked, and the payload
/// is decoded the first time it is asked for. A payload that fails to
/// decode is logged once and never retried.
#[derive(Clone)]
pub struct Message {
    declared: MessageType,
    frame: OnceLock<Bytes>,
    payload: OnceLock<Result<Cell, String>>,
    inferred: OnceLock<MessageType>,
    return_handler: Option<ReturnHandler>,
}

impl Message {
    /// Wrap an already-built payload.
    pub fn new(kind: MessageType, payload: Cell) -> Self {
        Self {
            declared: kind,
            frame: OnceLock::new(),
            payload: OnceLock::from(Ok(payload)),
            inferred: OnceLock::new(),
            return_handler: None,
        }
    }

    /// Wrap a received frame without decoding it.
    pub fn from_bytes(frame: Bytes) -> Self {
        let declared = frame
            .first()
            .map_or(MessageType::Unknown, |&code| MessageType::from_tag(code));
        Self {
            declared,
            frame: OnceLock::from(frame),
            payload: OnceLock::new(),
            inferred: OnceLock::new(),
            return_handler: None,
        }
    }

    fn build(kind: MessageType, id: Option<i64>, body: Vec<Cell>) -> ProtocolResult<Self> {
        let marker = kind.marker().ok_or(ProtocolError::InvalidMessageType(kind.type_tag()))?;
        let mut items = Vec::with_capacity(2 + body.len());
        items.push(Cell::keyword(marker)?);
        if let Some(id) = id {
            items.push(Cell::integer(id));
        }
        items.extend(body);
        Ok(Self::new(kind, Cell::vector(items)?))
    }

    pub fn belief(belief: Cell) -> ProtocolResult<Self> {
        Self::build(MessageType::Belief, None, vec![belief])
    }

    pub fn result(id: i64, value: Cell) -> ProtocolResult<Self> {
        Self::build(MessageType::Result, Some(id), vec![value])
    }

    pub fn status(id: i64, value: Cell) -> ProtocolResult<Self> {
        Self::build(MessageType::Status, Some(id), vec![value])
    }

    pub fn query(id: i64, form: Cell) -> ProtocolResult<Self> {
        Self::build(MessageType::Query, Some(id), vec![form])
    }

    pub fn transact(id: i64, tx: Cell) -> ProtocolResult<Self> {
        Self::build(MessageType::Transact, Some(id), vec![tx])
    }

    /// Ask for the cells with these hashes, in this order.
    pub fn data_request(id: i64, hashes: &[Hash]) -> ProtocolResult<Self> {
        let body = hashes.iter().map(|h| Cell::blob(h.as_bytes().to_vec())).collect();
        Self::build(MessageType::DataRequest, Some(id), body)
    }

    /// Answer a data request: one value per requested hash, `Nil` where the
    /// cell is not available.
    pub fn data(id: i64, values: Vec<Cell>) -> ProtocolResult<Self> {
        Self::build(MessageType::Data, Some(id), values)
    }

    pub fn goodbye() -> ProtocolResult<Self> {
        Self::build(MessageType::Goodbye, None, Vec::new())
    }

    /// Attach the handler used by [`Message::return_message`].
    pub fn with_return_handler(mut self, handler: ReturnHandler) -> Self {
        self.return_handler = Some(handler);
        self
    }

    pub fn has_return_handler(&self) -> bool {
        self.return_handler.is_some()
    }

    /// Hand `reply` to the return handler. Returns false if there is none.
    pub fn return_message(&self, reply: Message) -> bool {
        match &self.return_handler {
            Some(handler) => {
                handler(reply);
                true
            }
            None => false,
        }
    }

    /// The message kind.
    ///
    /// Uses the frame's type code when it names a kind. Otherwise the
    /// payload is decoded and its marker keyword decides. Once the payload
    /// has failed to decode the message is [`MessageType::Unknown`],
    /// whatever its type code said.
    pub fn message_type(&self) -> MessageType {
        if self.declared != MessageType::Unknown {
            return match self.payload.get() {
                Some(Err(_)) => MessageType::Unknown,
                _ => self.declared,
            };
        }
        *self.inferred.get_or_init(|| match self.payload() {
            Ok(cell) => infer_type(&cell),
            Err(_) => MessageType::Unknown,
        })
    }

    /// The request id, if this kind carries one.
    pub fn id(&self) -> Option<i64> {
        if !self.message_type().has_id() {
            return None;
        }
        match (self.payload.get(), self.frame.get()) {
            (Some(Ok(cell)), _) => cell.get_ref(1)?.cell()?.as_integer(),
            (_, Some(frame)) => peek_id(frame),
            _ => None,
        }
    }

    /// The decoded payload cell.
    pub fn payload(&self) -> ProtocolResult<Cell> {
        self.payload
            .get_or_init(|| {
                let frame = self.frame.get().map_or(&[][..], |f| &f[..]);
                let body = frame.get(1..).unwrap_or_default();
                codec::decode_cells(body).map_err(|e| {
                    warn!(
                        declared = %self.declared,
                        len = frame.len(),
                        error = %e,
                        "undecodable message payload"
                    );
                    e.to_string()
                })
            })
            .clone()
            .map_err(ProtocolError::MalformedPayload)
    }

    /// Number of payload elements after the marker and id.
    ///
    /// A received message answers from its frame header without decoding
    /// the payload. `None` if the header is unreadable.
    pub fn body_len(&self) -> Option<usize> {
        let start = self.message_type().body_start();
        match (self.payload.get(), self.frame.get()) {
            (Some(Ok(cell)), _) => Some(cell.ref_count().saturating_sub(start)),
            (_, Some(frame)) => peek_body_len(frame),
            _ => None,
        }
    }

    /// Payload elements after the marker and id.
    pub fn body(&self) -> ProtocolResult<Vec<Ref>> {
        let kind = self.message_type();
        let payload = self.payload()?;
        if infer_type(&payload) != kind {
            return Err(ProtocolError::MalformedPayload(format!(
                "payload does not match message type {kind}"
            )));
        }
        let id = payload.get_ref(1).and_then(Ref::cell).and_then(Cell::as_integer);
        if kind.has_id() && id.is_none() {
            return Err(ProtocolError::MalformedPayload(format!(
                "{kind} without an integer id"
            )));
        }
        Ok(payload.refs().get(kind.body_start()..).unwrap_or_default().to_vec())
    }

    /// The frame bytes: `[type code][multi-cell encoding]`.
    pub fn to_bytes(&self) -> Bytes {
        self.frame
            .get_or_init(|| {
                let body = match self.payload.get() {
                    Some(Ok(cell)) => codec::encode_cells(cell),
                    _ => Vec::new(),
                };
                let mut buf = Vec::with_capacity(1 + body.len());
                buf.push(self.declared.type_tag());
                buf.extend_from_slice(&body);
                Bytes::from(buf)
            })
            .clone()
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("type", &self.message_type())
            .field("id", &self.id())
            .field("has_return_handler", &self.has_return_handler())
            .finish()
    }
}

fn infer_type(payload: &Cell) -> MessageType {
    payload
        .get_ref(0)
        .and_then(Ref::cell)
        .and_then(Cell::as_keyword)
        .map_or(MessageType::Unknown, MessageType::from_marker)
}

/// Message kind of a frame, from its type code or, failing that, from the
/// payload's marker keyword. Nothing past the marker is decoded.
pub fn peek_type(frame: &[u8]) -> MessageType {
    match frame.first() {
        Some(&code) if MessageType::from_tag(code) != MessageType::Unknown => {
            MessageType::from_tag(code)
        }
        Some(_) => peek_marker(&frame[1..]).unwrap_or(MessageType::Unknown),
        None => MessageType::Unknown,
    }
}

fn peek_marker(payload: &[u8]) -> Option<MessageType> {
    let mut reader = Reader::new(payload);
    if reader.read_u8().ok()? != tag::VECTOR || reader.read_varint().ok()? == 0 {
        return None;
    }
    if reader.read_u8().ok()? != tag::KEYWORD {
        return None;
    }
    let len = reader.read_length(MAX_KEYWORD_LENGTH, "keyword length").ok()?;
    let name = std::str::from_utf8(reader.read_bytes(len).ok()?).ok()?;
    Some(MessageType::from_marker(name))
}

/// Number of payload elements after the marker and id, read from the
/// frame's vector header alone.
pub fn peek_body_len(frame: &[u8]) -> Option<usize> {
    let start = peek_type(frame).body_start();
    let mut reader = Reader::new(frame.get(1..)?);
    if reader.read_u8().ok()? != tag::VECTOR {
        return None;
    }
    let count = usize::try_from(reader.read_varint().ok()?).ok()?;
    Some(count.saturating_sub(start))
}

/// Read the id of a frame without decoding its payload.
///
/// `None` for kinds without an id and for frames too damaged to tell.
pub fn peek_id(frame: &[u8]) -> Option<i64> {
    if !peek_type(frame).has_id() {
        return None;
    }
    let mut reader = Reader::new(frame.get(1..)?);
    if reader.read_u8().ok()? != tag::VECTOR || reader.read_varint().ok()? < 2 {
        return None;
    }
    reader.skip_cell().ok()?;
    if reader.read_u8().ok()? != tag::INTEGER {
        return None;
    }
    reader.read_varint().ok().map(encoding::unzigzag)
}
