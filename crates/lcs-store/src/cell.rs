use std::borrow::Cow;
use std::fmt;
use std::sync::{Arc, OnceLock, Weak};

use lcs_types::Hash;

use crate::encoding::{self, tag, Reader, MAX_EMBEDDED_LENGTH, MAX_INLINE_DEPTH};
use crate::error::{StoreError, StoreResult};
use crate::reference::Ref;

/// Largest value an [`Value::Amount`] may hold.
pub const MAX_AMOUNT: u64 = 1_000_000_000_000_000_000;

/// Longest keyword name in bytes.
pub const MAX_KEYWORD_LENGTH: usize = 64;

/// Most elements a vector may hold.
pub const MAX_VECTOR_COUNT: usize = 1 << 20;

/// Backing storage for a blob.
///
/// Both variants produce the same encoding for the same bytes, so a blob
/// built from a `u64` compares and hashes equal to the 8-byte blob holding
/// its big-endian representation.
#[derive(Clone, Debug)]
pub enum Blob {
    Bytes(Vec<u8>),
    Long(u64),
}

impl Blob {
    pub fn bytes(&self) -> Cow<'_, [u8]> {
        match self {
            Self::Bytes(b) => Cow::Borrowed(b),
            Self::Long(v) => Cow::Owned(v.to_be_bytes().to_vec()),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Bytes(b) => b.len(),
            Self::Long(_) => 8,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The closed set of cell kinds.
#[derive(Clone, Debug)]
pub enum Value {
    Nil,
    Bool(bool),
    Integer(i64),
    Amount(u64),
    String(String),
    Blob(Blob),
    Keyword(String),
    Vector(Vec<Ref>),
}

impl Value {
    /// Leading tag byte of this value's encoding.
    pub fn tag(&self) -> u8 {
        match self {
            Self::Nil => tag::NIL,
            Self::Bool(false) => tag::FALSE,
            Self::Bool(true) => tag::TRUE,
            Self::Integer(_) => tag::INTEGER,
            Self::Amount(_) => tag::AMOUNT,
            Self::String(_) => tag::STRING,
            Self::Blob(_) => tag::BLOB,
            Self::Keyword(_) => tag::KEYWORD,
            Self::Vector(_) => tag::VECTOR,
        }
    }

    /// Human-readable kind name, for logs and errors.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Nil => "nil",
            Self::Bool(_) => "bool",
            Self::Integer(_) => "integer",
            Self::Amount(_) => "amount",
            Self::String(_) => "string",
            Self::Blob(_) => "blob",
            Self::Keyword(_) => "keyword",
            Self::Vector(_) => "vector",
        }
    }

    fn check_domain(&self) -> StoreResult<()> {
        match self {
            Self::Amount(a) if *a > MAX_AMOUNT => Err(StoreError::Format(format!(
                "amount {a} exceeds maximum {MAX_AMOUNT}"
            ))),
            Self::Keyword(k) if k.is_empty() || k.len() > MAX_KEYWORD_LENGTH => {
                Err(StoreError::Format(format!(
                    "keyword length {} outside 1..={MAX_KEYWORD_LENGTH}",
                    k.len()
                )))
            }
            Self::Vector(refs) if refs.len() > MAX_VECTOR_COUNT => Err(StoreError::Format(
                format!("vector of {} elements exceeds maximum {MAX_VECTOR_COUNT}", refs.len()),
            )),
            _ => Ok(()),
        }
    }
}

pub(crate) struct CellInner {
    value: Value,
    encoding: Box<[u8]>,
    hash: OnceLock<Hash>,
}

/// An immutable unit of data with a canonical encoding.
///
/// A `Cell` is a cheap handle; clones share the same allocation. The
/// encoding is produced when the cell is built and the hash is computed on
/// first use. Two cells are equal iff their encodings are byte-identical.
#[derive(Clone)]
pub struct Cell(Arc<CellInner>);

impl Cell {
    fn from_parts(value: Value, encoding: Vec<u8>) -> Self {
        Self(Arc::new(CellInner {
            value,
            encoding: encoding.into_boxed_slice(),
            hash: OnceLock::new(),
        }))
    }

    fn build(value: Value) -> Self {
        let encoding = encode_value(&value);
        Self::from_parts(value, encoding)
    }

    pub fn nil() -> Self {
        Self::build(Value::Nil)
    }

    pub fn boolean(value: bool) -> Self {
        Self::build(Value::Bool(value))
    }

    pub fn integer(value: i64) -> Self {
        Self::build(Value::Integer(value))
    }

    /// A non-negative quantity no larger than [`MAX_AMOUNT`].
    pub fn amount(value: i64) -> StoreResult<Self> {
        let value = u64::try_from(value)
            .map_err(|_| StoreError::Format(format!("negative amount {value}")))?;
        Self::from_value(Value::Amount(value))
    }

    pub fn string(value: impl Into<String>) -> Self {
        Self::build(Value::String(value.into()))
    }

    pub fn blob(bytes: impl Into<Vec<u8>>) -> Self {
        Self::build(Value::Blob(Blob::Bytes(bytes.into())))
    }

    /// An 8-byte blob holding `value` big-endian.
    pub fn blob_from_u64(value: u64) -> Self {
        Self::build(Value::Blob(Blob::Long(value)))
    }

    pub fn keyword(name: impl Into<String>) -> StoreResult<Self> {
        Self::from_value(Value::Keyword(name.into()))
    }

    /// A vector of the given cells. Each element becomes a resolved child ref.
    pub fn vector(items: impl IntoIterator<Item = Cell>) -> StoreResult<Self> {
        Self::from_value(Value::Vector(items.into_iter().map(Ref::new).collect()))
    }

    /// Build a cell from an arbitrary value, checking its domain constraints.
    ///
    /// Unresolved refs inside a vector must name non-embedded cells; an
    /// embedded child has to be supplied resolved so it can be inlined.
    pub fn from_value(value: Value) -> StoreResult<Self> {
        value.check_domain()?;
        Ok(Self::build(value))
    }

    /// Decode a single cell from its canonical encoding.
    ///
    /// Non-embedded children come back as unresolved refs.
    pub fn decode(bytes: &[u8]) -> StoreResult<Self> {
        let mut reader = Reader::new(bytes);
        let cell = Self::read_from(&mut reader)?;
        if !reader.is_empty() {
            return Err(reader.bad("trailing bytes after cell"));
        }
        Ok(cell)
    }

    /// Decode one cell starting at the reader's position, leaving the reader
    /// positioned after it.
    pub fn read_from(reader: &mut Reader<'_>) -> StoreResult<Self> {
        read_cell(reader, 0)
    }

    pub fn value(&self) -> &Value {
        &self.0.value
    }

    pub fn tag(&self) -> u8 {
        self.0.value.tag()
    }

    /// The canonical encoding.
    pub fn encoding(&self) -> &[u8] {
        &self.0.encoding
    }

    pub fn encoding_length(&self) -> usize {
        self.0.encoding.len()
    }

    pub fn hash(&self) -> Hash {
        *self.0.hash.get_or_init(|| Hash::of(&self.0.encoding))
    }

    /// Whether this cell is inlined into its parents rather than stored on its own.
    pub fn is_embedded(&self) -> bool {
        self.0.encoding.len() <= MAX_EMBEDDED_LENGTH
    }

    /// Child refs of this cell, in encoding order. Empty for leaf kinds.
    pub fn refs(&self) -> &[Ref] {
        match &self.0.value {
            Value::Vector(refs) => refs,
            _ => &[],
        }
    }

    pub fn ref_count(&self) -> usize {
        self.refs().len()
    }

    pub fn get_ref(&self, index: usize) -> Option<&Ref> {
        self.refs().get(index)
    }

    pub fn is_nil(&self) -> bool {
        matches!(self.0.value, Value::Nil)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self.0.value {
            Value::Bool(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self.0.value {
            Value::Integer(i) => Some(i),
            _ => None,
        }
    }

    pub fn as_amount(&self) -> Option<u64> {
        match self.0.value {
            Value::Amount(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match &self.0.value {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_keyword(&self) -> Option<&str> {
        match &self.0.value {
            Value::Keyword(k) => Some(k),
            _ => None,
        }
    }

    pub fn blob_bytes(&self) -> Option<Cow<'_, [u8]>> {
        match &self.0.value {
            Value::Blob(b) => Some(b.bytes()),
            _ => None,
        }
    }

    /// Re-check a cell graph: domain constraints of every kind, and that
    /// every child slot is in canonical form (embedded children inline,
    /// others by hash). Walks every resolved descendant; unresolved children
    /// are not fetched.
    pub fn validate(&self) -> StoreResult<()> {
        let mut stack = vec![self.clone()];
        while let Some(cell) = stack.pop() {
            cell.0.value.check_domain()?;
            if encode_value(&cell.0.value).as_slice() != cell.encoding() {
                return Err(StoreError::BadFormat {
                    offset: 0,
                    reason: format!("{} {} is not in canonical form", cell.0.value.kind_name(), cell.hash()),
                });
            }
            stack.extend(cell.refs().iter().filter_map(|r| r.cell().cloned()));
        }
        Ok(())
    }

    /// Whether two handles share one allocation.
    pub fn ptr_eq(a: &Cell, b: &Cell) -> bool {
        Arc::ptr_eq(&a.0, &b.0)
    }

    pub(crate) fn downgrade(&self) -> WeakCell {
        WeakCell(Arc::downgrade(&self.0))
    }
}

impl PartialEq for Cell {
    fn eq(&self, other: &Self) -> bool {
        Self::ptr_eq(self, other) || self.0.encoding == other.0.encoding
    }
}

impl Eq for Cell {}

impl std::hash::Hash for Cell {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        std::hash::Hash::hash(&Cell::hash(self), state);
    }
}

impl fmt::Debug for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0.value, f)
    }
}

impl From<i64> for Cell {
    fn from(value: i64) -> Self {
        Cell::integer(value)
    }
}

impl From<bool> for Cell {
    fn from(value: bool) -> Self {
        Cell::boolean(value)
    }
}

impl From<&str> for Cell {
    fn from(value: &str) -> Self {
        Cell::string(value)
    }
}

/// Non-owning handle used by the decode cache.
#[derive(Clone)]
pub(crate) struct WeakCell(Weak<CellInner>);

impl WeakCell {
    pub fn upgrade(&self) -> Option<Cell> {
        self.0.upgrade().map(Cell)
    }

    pub fn is_live(&self) -> bool {
        self.0.strong_count() > 0
    }
}

fn encode_value(value: &Value) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.push(value.tag());
    match value {
        Value::Nil | Value::Bool(_) => {}
        Value::Integer(i) => encoding::write_varint(&mut buf, encoding::zigzag(*i)),
        Value::Amount(a) => encoding::write_varint(&mut buf, *a),
        Value::String(s) => write_bytes(&mut buf, s.as_bytes()),
        Value::Blob(b) => write_bytes(&mut buf, &b.bytes()),
        Value::Keyword(k) => write_bytes(&mut buf, k.as_bytes()),
        Value::Vector(refs) => {
            encoding::write_varint(&mut buf, refs.len() as u64);
            for r in refs {
                write_child(&mut buf, r);
            }
        }
    }
    buf
}

fn write_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    encoding::write_varint(buf, bytes.len() as u64);
    buf.extend_from_slice(bytes);
}

fn write_child(buf: &mut Vec<u8>, r: &Ref) {
    match r.cell() {
        Some(child) if child.is_embedded() => buf.extend_from_slice(child.encoding()),
        _ => {
            buf.push(tag::REF);
            buf.extend_from_slice(r.hash().as_bytes());
        }
    }
}

fn read_cell(reader: &mut Reader<'_>, depth: usize) -> StoreResult<Cell> {
    let start = reader.position();
    let value = match reader.read_u8()? {
        tag::NIL => Value::Nil,
        tag::FALSE => Value::Bool(false),
        tag::TRUE => Value::Bool(true),
        tag::INTEGER => Value::Integer(encoding::unzigzag(reader.read_varint()?)),
        tag::AMOUNT => {
            let amount = reader.read_varint()?;
            if amount > MAX_AMOUNT {
                return Err(reader.bad_at(start, format!("amount {amount} exceeds maximum")));
            }
            Value::Amount(amount)
        }
        tag::STRING => Value::String(read_utf8(reader, usize::MAX, "string length")?),
        tag::BLOB => {
            let len = reader.read_length(usize::MAX, "blob length")?;
            Value::Blob(Blob::Bytes(reader.read_bytes(len)?.to_vec()))
        }
        tag::KEYWORD => {
            let name = read_utf8(reader, MAX_KEYWORD_LENGTH, "keyword length")?;
            if name.is_empty() {
                return Err(reader.bad_at(start, "empty keyword"));
            }
            Value::Keyword(name)
        }
        tag::VECTOR => {
            // Every slot takes at least one byte, so the count is bounded by
            // the remaining input before anything is allocated.
            let count = reader.read_length(MAX_VECTOR_COUNT, "element count")?;
            let mut refs = Vec::with_capacity(count);
            for _ in 0..count {
                refs.push(read_child(reader, depth)?);
            }
            Value::Vector(refs)
        }
        tag::REF => return Err(reader.bad_at(start, "ref slot outside a vector")),
        other => return Err(reader.bad_at(start, format!("unknown tag 0x{other:02x}"))),
    };
    Ok(Cell::from_parts(value, reader.slice_from(start).to_vec()))
}

fn read_child(reader: &mut Reader<'_>, depth: usize) -> StoreResult<Ref> {
    if reader.peek_u8()? == tag::REF {
        reader.read_u8()?;
        return Ok(Ref::for_hash(reader.read_hash()?));
    }
    let start = reader.position();
    if depth >= MAX_INLINE_DEPTH {
        return Err(reader.bad_at(start, "inline nesting too deep"));
    }
    let child = read_cell(reader, depth + 1)?;
    if !child.is_embedded() {
        return Err(reader.bad_at(start, "non-embedded cell encoded inline"));
    }
    Ok(Ref::new(child))
}

fn read_utf8(reader: &mut Reader<'_>, max: usize, what: &str) -> StoreResult<String> {
    let len = reader.read_length(max, what)?;
    let start = reader.position();
    let bytes = reader.read_bytes(len)?;
    String::from_utf8(bytes.to_vec()).map_err(|_| reader.bad_at(start, "invalid UTF-8"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ascii(len: usize) -> String {
        "x".repeat(len)
    }

    // -----------------------------------------------------------------------
    // Encoding
    // -----------------------------------------------------------------------

    #[test]
    fn primitive_encodings() {
        assert_eq!(Cell::nil().encoding(), &[tag::NIL]);
        assert_eq!(Cell::boolean(true).encoding(), &[tag::TRUE]);
        assert_eq!(Cell::boolean(false).encoding(), &[tag::FALSE]);
        assert_eq!(Cell::integer(1).encoding(), &[tag::INTEGER, 2]);
        assert_eq!(Cell::integer(-1).encoding(), &[tag::INTEGER, 1]);
        assert_eq!(Cell::string("hi").encoding(), &[tag::STRING, 2, b'h', b'i']);
        assert_eq!(Cell::keyword("a").unwrap().encoding(), &[tag::KEYWORD, 1, b'a']);
    }

    #[test]
    fn hash_is_digest_of_encoding() {
        let cell = Cell::string("hello");
        assert_eq!(cell.hash(), Hash::of(cell.encoding()));
        assert_eq!(cell.hash(), cell.hash());
    }

    #[test]
    fn equal_values_built_separately_hash_equal() {
        let a = Cell::vector([Cell::integer(1), Cell::integer(2)]).unwrap();
        let b = Cell::vector(vec![Cell::from(1), Cell::from(2)]).unwrap();
        assert!(!Cell::ptr_eq(&a, &b));
        assert_eq!(a, b);
        assert_eq!(a.hash(), b.hash());
    }

    #[test]
    fn long_backed_blob_equals_byte_blob() {
        let fixed = Cell::blob_from_u64(0x0102_0304_0506_0708);
        let bytes = Cell::blob(vec![1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(fixed, bytes);
        assert_eq!(bytes, fixed);
        assert_eq!(fixed.hash(), bytes.hash());
        assert_eq!(fixed.blob_bytes().unwrap().as_ref(), &[1, 2, 3, 4, 5, 6, 7, 8]);
    }

    // -----------------------------------------------------------------------
    // Embedding
    // -----------------------------------------------------------------------

    #[test]
    fn string_of_137_chars_is_embedded() {
        let cell = Cell::string(ascii(137));
        assert_eq!(cell.encoding_length(), MAX_EMBEDDED_LENGTH);
        assert!(cell.is_embedded());
    }

    #[test]
    fn string_of_138_chars_is_not_embedded() {
        let cell = Cell::string(ascii(138));
        assert_eq!(cell.encoding_length(), MAX_EMBEDDED_LENGTH + 1);
        assert!(!cell.is_embedded());
    }

    #[test]
    fn embedded_child_is_inlined() {
        let child = Cell::integer(7);
        let parent = Cell::vector([child.clone()]).unwrap();
        let mut expected = vec![tag::VECTOR, 1];
        expected.extend_from_slice(child.encoding());
        assert_eq!(parent.encoding(), expected.as_slice());
    }

    #[test]
    fn large_child_is_referenced_by_hash() {
        let child = Cell::string(ascii(500));
        let parent = Cell::vector([child.clone()]).unwrap();
        let mut expected = vec![tag::VECTOR, 1, tag::REF];
        expected.extend_from_slice(child.hash().as_bytes());
        assert_eq!(parent.encoding(), expected.as_slice());
        assert!(parent.is_embedded());
    }

    #[test]
    fn refs_expose_children_generically() {
        let parent = Cell::vector([Cell::nil(), Cell::integer(3)]).unwrap();
        assert_eq!(parent.ref_count(), 2);
        assert_eq!(parent.get_ref(1).unwrap().hash(), Cell::integer(3).hash());
        assert!(parent.get_ref(2).is_none());
        assert_eq!(Cell::integer(3).ref_count(), 0);
    }

    // -----------------------------------------------------------------------
    // Domain checks
    // -----------------------------------------------------------------------

    #[test]
    fn negative_amount_is_format_error() {
        assert!(matches!(Cell::amount(-5), Err(StoreError::Format(_))));
    }

    #[test]
    fn amount_above_maximum_is_format_error() {
        assert!(Cell::amount(MAX_AMOUNT as i64).is_ok());
        assert!(matches!(Cell::amount(MAX_AMOUNT as i64 + 1), Err(StoreError::Format(_))));
    }

    #[test]
    fn keyword_length_is_checked() {
        assert!(Cell::keyword("").is_err());
        assert!(Cell::keyword(ascii(MAX_KEYWORD_LENGTH)).is_ok());
        assert!(Cell::keyword(ascii(MAX_KEYWORD_LENGTH + 1)).is_err());
    }

    // -----------------------------------------------------------------------
    // Decoding
    // -----------------------------------------------------------------------

    #[test]
    fn decode_roundtrip_nested() {
        let big = Cell::string(ascii(300));
        let cell = Cell::vector([
            Cell::integer(-42),
            Cell::keyword("k").unwrap(),
            Cell::vector([Cell::boolean(true), Cell::nil()]).unwrap(),
            big.clone(),
        ])
        .unwrap();
        let decoded = Cell::decode(cell.encoding()).unwrap();
        assert_eq!(decoded, cell);
        assert_eq!(decoded.hash(), cell.hash());

        // The big child travels by hash only.
        let child = decoded.get_ref(3).unwrap();
        assert!(!child.is_resolved());
        assert_eq!(child.hash(), big.hash());
        // Embedded children come back resolved.
        assert_eq!(decoded.get_ref(0).unwrap().cell().unwrap().as_integer(), Some(-42));
    }

    #[test]
    fn decode_rejects_unknown_tag_with_offset() {
        let err = Cell::decode(&[0x7F]).unwrap_err();
        assert!(matches!(err, StoreError::BadFormat { offset: 0, .. }));

        // Unknown tag inside a vector is reported at its own offset.
        let err = Cell::decode(&[tag::VECTOR, 2, tag::NIL, 0x7F]).unwrap_err();
        assert!(matches!(err, StoreError::BadFormat { offset: 3, .. }));
    }

    #[test]
    fn decode_rejects_length_beyond_input() {
        let err = Cell::decode(&[tag::STRING, 10, b'a']).unwrap_err();
        assert!(matches!(err, StoreError::BadFormat { offset: 1, .. }));
    }

    #[test]
    fn decode_rejects_trailing_bytes() {
        let err = Cell::decode(&[tag::NIL, tag::NIL]).unwrap_err();
        assert!(matches!(err, StoreError::BadFormat { offset: 1, .. }));
    }

    #[test]
    fn decode_rejects_inline_non_embedded_child() {
        let big = Cell::string(ascii(200));
        let mut bytes = vec![tag::VECTOR, 1];
        bytes.extend_from_slice(big.encoding());
        let err = Cell::decode(&bytes).unwrap_err();
        assert!(matches!(err, StoreError::BadFormat { offset: 2, .. }));
    }

    #[test]
    fn decode_rejects_top_level_ref() {
        let mut bytes = vec![tag::REF];
        bytes.extend_from_slice(&[0u8; 32]);
        assert!(Cell::decode(&bytes).is_err());
    }

    #[test]
    fn decode_rejects_out_of_range_amount() {
        let mut bytes = vec![tag::AMOUNT];
        encoding::write_varint(&mut bytes, MAX_AMOUNT + 1);
        assert!(matches!(Cell::decode(&bytes), Err(StoreError::BadFormat { offset: 0, .. })));
    }

    #[test]
    fn decode_rejects_invalid_utf8() {
        assert!(Cell::decode(&[tag::STRING, 1, 0xFF]).is_err());
    }

    #[test]
    fn decode_rejects_huge_vector_count_cheaply() {
        let mut bytes = vec![tag::VECTOR];
        encoding::write_varint(&mut bytes, 1_000_000);
        assert!(matches!(Cell::decode(&bytes), Err(StoreError::BadFormat { offset: 1, .. })));
    }

    #[test]
    fn decode_rejects_runaway_nesting() {
        let mut bytes = Vec::new();
        for _ in 0..1000 {
            bytes.extend_from_slice(&[tag::VECTOR, 1]);
        }
        bytes.push(tag::NIL);
        assert!(Cell::decode(&bytes).is_err());
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    #[test]
    fn validate_accepts_constructed_graph() {
        let cell = Cell::vector([Cell::string(ascii(400)), Cell::integer(1)]).unwrap();
        cell.validate().unwrap();
    }

    #[test]
    fn validate_rejects_hash_slot_for_embedded_child() {
        // A child small enough to inline, referenced by hash instead.
        let small = Cell::integer(5);
        let parent =
            Cell::from_value(Value::Vector(vec![Ref::for_hash(small.hash())])).unwrap();
        let decoded = Cell::decode(parent.encoding()).unwrap();
        decoded.validate().unwrap();

        // Once the child is known, the slot is visibly non-canonical.
        decoded.get_ref(0).unwrap().resolve(small).unwrap();
        assert!(decoded.validate().is_err());
    }

    proptest! {
        #[test]
        fn integer_encoding_is_canonical(value in any::<i64>()) {
            let cell = Cell::integer(value);
            let decoded = Cell::decode(cell.encoding()).unwrap();
            prop_assert_eq!(decoded.as_integer(), Some(value));
            prop_assert_eq!(decoded.hash(), cell.hash());
        }

        #[test]
        fn string_embedding_follows_encoded_length(len in 0usize..400) {
            let cell = Cell::string(ascii(len));
            prop_assert_eq!(cell.is_embedded(), cell.encoding_length() <= MAX_EMBEDDED_LENGTH);
        }
    }
}
