use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;

use crate::compression::FilterError;

/// A reference to an indirect object: object number plus generation.
///
/// This is a non-owning handle. Resolution always goes through the
/// [`XrefTable`](crate::xref::XrefTable) that owns the object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjRef {
    number: u32,
    generation: u16,
}

impl ObjRef {
    pub fn new(number: u32, generation: u16) -> ObjRef {
        ObjRef { number, generation }
    }

    #[inline(always)]
    pub fn number(&self) -> u32 {
        self.number
    }

    #[inline(always)]
    pub fn generation(&self) -> u16 {
        self.generation
    }
}

impl fmt::Display for ObjRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} R", self.number, self.generation)
    }
}

/// A PDF name object (`/Name`). Stored unescaped; `#xx` sequences are
/// resolved by the parser and re-applied by the writer.
///
/// Names are held as UTF-8 text. Name bytes that do not form valid UTF-8
/// are replaced with U+FFFD on parse, so such names do not round-trip
/// byte-exactly. Names produced by mainstream tooling are ASCII or UTF-8,
/// as PDF 2.0 recommends.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PdfName(String);

impl PdfName {
    pub fn new<S: Into<String>>(name: S) -> PdfName {
        PdfName(name.into())
    }

    #[inline(always)]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PdfName {
    fn from(s: &str) -> PdfName {
        PdfName(s.to_string())
    }
}

impl From<String> for PdfName {
    fn from(s: String) -> PdfName {
        PdfName(s)
    }
}

impl fmt::Display for PdfName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.0)
    }
}

/// A PDF string object. The payload is raw bytes; `hex` records whether the
/// source spelled it as a hexadecimal string so round-trips keep the form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PdfString {
    data: Vec<u8>,
    hex: bool,
}

impl PdfString {
    pub fn literal<B: Into<Vec<u8>>>(data: B) -> PdfString {
        PdfString {
            data: data.into(),
            hex: false,
        }
    }

    pub fn hex<B: Into<Vec<u8>>>(data: B) -> PdfString {
        PdfString {
            data: data.into(),
            hex: true,
        }
    }

    #[inline(always)]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    #[inline(always)]
    pub fn is_hex(&self) -> bool {
        self.hex
    }

    pub(crate) fn set_bytes(&mut self, data: Vec<u8>) {
        self.data = data;
    }

    /// Lossy UTF-8 view of the payload.
    pub fn to_string_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.data)
    }
}

/// A dictionary mapping names to values. Insertion order is irrelevant to
/// the format; a sorted map keeps serialization deterministic.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PdfDictionary(BTreeMap<PdfName, PdfObject>);

impl PdfDictionary {
    pub fn new() -> PdfDictionary {
        PdfDictionary(BTreeMap::new())
    }

    pub fn get(&self, key: &str) -> Option<&PdfObject> {
        self.0.get(&PdfName::new(key))
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut PdfObject> {
        self.0.get_mut(&PdfName::new(key))
    }

    pub fn put<K: Into<PdfName>, V: Into<PdfObject>>(&mut self, key: K, value: V) {
        self.0.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<PdfObject> {
        self.0.remove(&PdfName::new(key))
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(&PdfName::new(key))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PdfName, &PdfObject)> {
        self.0.iter()
    }

    pub fn values(&self) -> impl Iterator<Item = &PdfObject> {
        self.0.values()
    }

    pub(crate) fn values_mut(&mut self) -> impl Iterator<Item = &mut PdfObject> {
        self.0.values_mut()
    }

    /// Get a reference-valued entry.
    pub fn get_ref(&self, key: &str) -> Option<ObjRef> {
        self.get(key).and_then(PdfObject::as_reference)
    }

    /// Get an integral numeric entry.
    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(PdfObject::as_i64)
    }

    pub fn get_name(&self, key: &str) -> Option<&PdfName> {
        self.get(key).and_then(PdfObject::as_name)
    }

    pub fn get_array(&self, key: &str) -> Option<&[PdfObject]> {
        self.get(key).and_then(PdfObject::as_array)
    }

    pub fn get_dict(&self, key: &str) -> Option<&PdfDictionary> {
        self.get(key).and_then(PdfObject::as_dictionary)
    }
}

/// A stream object: a dictionary plus a byte payload.
///
/// `raw` marks a payload still in its on-disk (filtered) form. Payloads
/// constructed in memory are unfiltered; the writer applies Flate at
/// serialization time according to the configured compression level.
#[derive(Debug, Clone, PartialEq)]
pub struct PdfStream {
    pub dict: PdfDictionary,
    data: Vec<u8>,
    raw: bool,
}

impl PdfStream {
    /// Create a stream with an unfiltered in-memory payload.
    pub fn new<B: Into<Vec<u8>>>(dict: PdfDictionary, data: B) -> PdfStream {
        PdfStream {
            dict,
            data: data.into(),
            raw: false,
        }
    }

    /// Create a stream whose payload is exactly as it appears on disk,
    /// filters unapplied.
    pub fn from_raw<B: Into<Vec<u8>>>(dict: PdfDictionary, data: B) -> PdfStream {
        PdfStream {
            dict,
            data: data.into(),
            raw: true,
        }
    }

    /// The payload as currently held (possibly still filtered).
    #[inline(always)]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    #[inline(always)]
    pub fn is_raw(&self) -> bool {
        self.raw
    }

    /// Replace the payload with unfiltered bytes.
    pub fn set_data<B: Into<Vec<u8>>>(&mut self, data: B) {
        self.data = data.into();
        self.raw = false;
        self.dict.remove("Filter");
        self.dict.remove("DecodeParms");
    }

    pub(crate) fn replace_raw_data(&mut self, data: Vec<u8>) {
        self.data = data;
    }

    /// Discard the payload after it has been written out, keeping the
    /// dictionary so graph walks still see the stream's references.
    pub(crate) fn discard_payload(&mut self) {
        self.data = Vec::new();
    }

    /// The payload with any supported filters applied in reverse.
    ///
    /// Returns the bytes as-is when the payload is already unfiltered.
    pub fn decoded_data(&self) -> Result<Cow<'_, [u8]>, FilterError> {
        if !self.raw {
            return Ok(Cow::Borrowed(&self.data));
        }
        crate::compression::decode_stream(&self.dict, &self.data)
    }
}

/// The PDF object model: a closed tagged variant.
///
/// A value is *direct* while inlined in its parent; promotion to indirect
/// happens through [`XrefTable::allocate`](crate::xref::XrefTable::allocate),
/// after which containers refer to it with [`PdfObject::Reference`].
#[derive(Debug, Clone, PartialEq, Default)]
pub enum PdfObject {
    #[default]
    Null,
    Boolean(bool),
    Number(f64),
    String(PdfString),
    Name(PdfName),
    Array(Vec<PdfObject>),
    Dictionary(PdfDictionary),
    Stream(PdfStream),
    Reference(ObjRef),
}

impl PdfObject {
    #[inline(always)]
    pub fn is_null(&self) -> bool {
        matches!(self, PdfObject::Null)
    }

    #[inline(always)]
    pub fn is_stream(&self) -> bool {
        matches!(self, PdfObject::Stream(_))
    }

    #[inline(always)]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PdfObject::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    #[inline(always)]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PdfObject::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Numeric value, provided it is integral.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            PdfObject::Number(n) if n.fract() == 0.0 => Some(*n as i64),
            _ => None,
        }
    }

    #[inline(always)]
    pub fn as_string(&self) -> Option<&PdfString> {
        match self {
            PdfObject::String(s) => Some(s),
            _ => None,
        }
    }

    #[inline(always)]
    pub fn as_name(&self) -> Option<&PdfName> {
        match self {
            PdfObject::Name(n) => Some(n),
            _ => None,
        }
    }

    #[inline(always)]
    pub fn as_array(&self) -> Option<&[PdfObject]> {
        match self {
            PdfObject::Array(a) => Some(a),
            _ => None,
        }
    }

    #[inline(always)]
    pub fn as_array_mut(&mut self) -> Option<&mut Vec<PdfObject>> {
        match self {
            PdfObject::Array(a) => Some(a),
            _ => None,
        }
    }

    #[inline(always)]
    pub fn as_dictionary(&self) -> Option<&PdfDictionary> {
        match self {
            PdfObject::Dictionary(d) => Some(d),
            PdfObject::Stream(s) => Some(&s.dict),
            _ => None,
        }
    }

    #[inline(always)]
    pub fn as_dictionary_mut(&mut self) -> Option<&mut PdfDictionary> {
        match self {
            PdfObject::Dictionary(d) => Some(d),
            PdfObject::Stream(s) => Some(&mut s.dict),
            _ => None,
        }
    }

    #[inline(always)]
    pub fn as_stream(&self) -> Option<&PdfStream> {
        match self {
            PdfObject::Stream(s) => Some(s),
            _ => None,
        }
    }

    #[inline(always)]
    pub fn as_stream_mut(&mut self) -> Option<&mut PdfStream> {
        match self {
            PdfObject::Stream(s) => Some(s),
            _ => None,
        }
    }

    #[inline(always)]
    pub fn as_reference(&self) -> Option<ObjRef> {
        match self {
            PdfObject::Reference(r) => Some(*r),
            _ => None,
        }
    }
}

impl From<bool> for PdfObject {
    fn from(b: bool) -> PdfObject {
        PdfObject::Boolean(b)
    }
}

impl From<f64> for PdfObject {
    fn from(n: f64) -> PdfObject {
        PdfObject::Number(n)
    }
}

impl From<i64> for PdfObject {
    fn from(n: i64) -> PdfObject {
        PdfObject::Number(n as f64)
    }
}

impl From<i32> for PdfObject {
    fn from(n: i32) -> PdfObject {
        PdfObject::Number(n as f64)
    }
}

impl From<u32> for PdfObject {
    fn from(n: u32) -> PdfObject {
        PdfObject::Number(n as f64)
    }
}

impl From<PdfString> for PdfObject {
    fn from(s: PdfString) -> PdfObject {
        PdfObject::String(s)
    }
}

impl From<PdfName> for PdfObject {
    fn from(n: PdfName) -> PdfObject {
        PdfObject::Name(n)
    }
}

impl From<Vec<PdfObject>> for PdfObject {
    fn from(a: Vec<PdfObject>) -> PdfObject {
        PdfObject::Array(a)
    }
}

impl From<PdfDictionary> for PdfObject {
    fn from(d: PdfDictionary) -> PdfObject {
        PdfObject::Dictionary(d)
    }
}

impl From<PdfStream> for PdfObject {
    fn from(s: PdfStream) -> PdfObject {
        PdfObject::Stream(s)
    }
}

impl From<ObjRef> for PdfObject {
    fn from(r: ObjRef) -> PdfObject {
        PdfObject::Reference(r)
    }
}
