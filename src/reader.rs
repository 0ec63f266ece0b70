//! Lazy document reader.
//!
//! Opening a document parses only the header, the `startxref` pointer and
//! the cross-reference chain. Object bodies stay in the source (an owned
//! buffer or a memory map) until a reference is resolved, at which point the
//! [`ObjectLoader`] tokenizes the body at its recorded location.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io;
use std::path::Path;
use std::sync::Arc;

use crate::compression::FilterError;
use crate::crypto::{decrypt_in_place, Decryptor, DecryptorProvider};
use crate::object::{ObjRef, PdfDictionary, PdfObject, PdfStream};
use crate::parse::{
    find_bytes, is_regular, rfind_bytes, ParseError, RawXrefEntry, Tokenizer,
};
use crate::xref::{Location, SlotState, XrefTable};

/// How far from the end of the file `startxref` may sit.
const STARTXREF_WINDOW: usize = 1024;

/// How far into the file the `%PDF-` header may sit.
const HEADER_WINDOW: usize = 1024;

/// Trailer keys that describe the cross-reference section itself and must
/// not survive into the document-level trailer.
const STRUCTURAL_TRAILER_KEYS: &[&str] = &[
    "Prev",
    "Size",
    "XRefStm",
    "W",
    "Index",
    "Filter",
    "DecodeParms",
    "DP",
    "Length",
    "Type",
];

#[derive(Debug, thiserror::Error)]
pub enum OpenError {
    #[error("no %PDF- header found")]
    MissingHeader,

    #[error("no usable cross-reference data found")]
    MissingXref,

    #[error("no document catalog found")]
    MissingCatalog,

    #[error("document is encrypted and the credential was missing or rejected")]
    Authentication,

    #[error("failed to read source")]
    Read(#[from] io::Error),

    #[error(transparent)]
    Parse(#[from] ParseError),
}

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("document has no backing source")]
    NoSource,

    #[error("object stream {0} is missing or malformed")]
    BadObjectStream(u32),

    #[error("found object {found} where {expected} was recorded")]
    ObjectMismatch { expected: u32, found: u32 },

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Filter(#[from] FilterError),
}

enum SourceBytes {
    Owned(Vec<u8>),
    Mapped(memmap2::Mmap),
}

/// A cheaply cloneable handle to the raw bytes of an opened document.
#[derive(Clone)]
pub struct Source(Arc<SourceBytes>);

impl Source {
    pub fn from_bytes(bytes: Vec<u8>) -> Source {
        Source(Arc::new(SourceBytes::Owned(bytes)))
    }

    /// Memory-map a file.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Source> {
        let file = File::open(path)?;
        // Safety: the mapping is read-only and the crate never mutates the
        // file it maps; concurrent external truncation is undefined, as with
        // every mmap-backed reader.
        let map = unsafe { memmap2::Mmap::map(&file)? };
        Ok(Source(Arc::new(SourceBytes::Mapped(map))))
    }

    pub fn as_bytes(&self) -> &[u8] {
        match &*self.0 {
            SourceBytes::Owned(bytes) => bytes,
            SourceBytes::Mapped(map) => map,
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }
}

/// A decoded object stream, cached so sibling members parse for free.
struct CachedContainer {
    first: usize,
    /// `(object number, offset relative to /First)` per member.
    pairs: Vec<(u32, usize)>,
    data: Vec<u8>,
}

/// Loads object bodies on demand from a [`Source`], decrypting them when a
/// security handler is installed.
pub struct ObjectLoader {
    source: Source,
    decryptor: Option<Box<dyn Decryptor>>,
    /// Object number of the encryption dictionary, which is stored
    /// unencrypted and must never pass through the decryptor.
    encrypt_number: Option<u32>,
    containers: HashMap<u32, CachedContainer>,
}

impl ObjectLoader {
    pub(crate) fn new(source: Source) -> ObjectLoader {
        ObjectLoader {
            source,
            decryptor: None,
            encrypt_number: None,
            containers: HashMap::new(),
        }
    }

    pub(crate) fn set_decryptor(&mut self, decryptor: Box<dyn Decryptor>) {
        self.decryptor = Some(decryptor);
    }

    pub(crate) fn set_encrypt_number(&mut self, number: u32) {
        self.encrypt_number = Some(number);
    }

    /// Parse the `n g obj` body at `offset`, verifying the object number.
    pub(crate) fn load_at(&mut self, offset: u64, expected: ObjRef) -> Result<PdfObject, LoadError> {
        let buf = self.source.as_bytes();
        let pos = offset as usize;
        if pos >= buf.len() {
            return Err(ParseError::UnexpectedEof(pos).into());
        }
        let mut tok = Tokenizer::with_pos(buf, pos);
        let (number, _generation, mut obj) = tok.parse_indirect_object()?;
        if number != expected.number() {
            return Err(LoadError::ObjectMismatch {
                expected: expected.number(),
                found: number,
            });
        }
        if self.encrypt_number != Some(expected.number()) {
            if let Some(decryptor) = &self.decryptor {
                decrypt_in_place(&mut obj, expected, decryptor.as_ref());
            }
        }
        tracing::trace!(reference = %expected, offset, "loaded object");
        Ok(obj)
    }

    /// Parse member `index` of the object stream in object `container`,
    /// whose own body sits at `container_offset`.
    ///
    /// Members are never decrypted individually: the container payload went
    /// through the decryptor as a whole when it was first loaded.
    pub(crate) fn load_from_container(
        &mut self,
        container: u32,
        container_offset: u64,
        index: u32,
        expected: u32,
    ) -> Result<PdfObject, LoadError> {
        if !self.containers.contains_key(&container) {
            let cached = self.load_container(container, container_offset)?;
            self.containers.insert(container, cached);
        }
        let cached = &self.containers[&container];
        let (number, offset) = *cached
            .pairs
            .get(index as usize)
            .ok_or(LoadError::BadObjectStream(container))?;
        if number != expected {
            return Err(LoadError::ObjectMismatch {
                expected,
                found: number,
            });
        }
        let mut tok = Tokenizer::with_pos(&cached.data, cached.first + offset);
        let obj = tok.parse_object()?;
        tracing::trace!(number, container, index, "loaded object stream member");
        Ok(obj)
    }

    fn load_container(
        &mut self,
        container: u32,
        offset: u64,
    ) -> Result<CachedContainer, LoadError> {
        let buf = self.source.as_bytes();
        let pos = offset as usize;
        if pos >= buf.len() {
            return Err(ParseError::UnexpectedEof(pos).into());
        }
        let mut tok = Tokenizer::with_pos(buf, pos);
        let (number, _generation, mut obj) = tok.parse_indirect_object()?;
        if number != container {
            return Err(LoadError::ObjectMismatch {
                expected: container,
                found: number,
            });
        }
        if let Some(decryptor) = &self.decryptor {
            decrypt_in_place(&mut obj, ObjRef::new(container, 0), decryptor.as_ref());
        }
        let stream = match obj {
            PdfObject::Stream(stream) => stream,
            _ => return Err(LoadError::BadObjectStream(container)),
        };
        let count = stream
            .dict
            .get_i64("N")
            .filter(|n| *n >= 0)
            .ok_or(LoadError::BadObjectStream(container))? as usize;
        let first = stream
            .dict
            .get_i64("First")
            .filter(|f| *f >= 0)
            .ok_or(LoadError::BadObjectStream(container))? as usize;
        let data = stream.decoded_data()?.into_owned();
        if first > data.len() {
            return Err(LoadError::BadObjectStream(container));
        }

        let mut header = Tokenizer::new(&data[..first]);
        let mut pairs = Vec::with_capacity(count);
        for _ in 0..count {
            header.skip_whitespace();
            let member = header
                .parse_unsigned()
                .map_err(|_| LoadError::BadObjectStream(container))?;
            header.skip_whitespace();
            let member_offset = header
                .parse_unsigned()
                .map_err(|_| LoadError::BadObjectStream(container))?;
            if member > u32::MAX as u64 || first + member_offset as usize > data.len() {
                return Err(LoadError::BadObjectStream(container));
            }
            pairs.push((member as u32, member_offset as usize));
        }

        Ok(CachedContainer { first, pairs, data })
    }
}

/// Everything `open` produces: a registry wired to a loader, the merged
/// trailer, and enough provenance for incremental updates.
pub(crate) struct ParsedDocument {
    pub xref: XrefTable,
    pub trailer: PdfDictionary,
    pub version: (u8, u8),
    /// Offset of the newest cross-reference section, for `/Prev` chaining.
    /// `None` when the table had to be rebuilt by scanning.
    pub prev_startxref: Option<u64>,
    pub recovered: bool,
}

pub(crate) struct ReadOptions<'a> {
    pub password: Option<&'a [u8]>,
    pub decryptor_provider: Option<&'a dyn DecryptorProvider>,
}

#[derive(Debug, thiserror::Error)]
enum ChainError {
    #[error("cross-reference offset {0} is out of bounds")]
    OutOfBounds(usize),

    #[error("malformed cross-reference stream: {0}")]
    Malformed(&'static str),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Filter(#[from] FilterError),
}

/// Parse the structural skeleton of a document.
pub(crate) fn read_document(
    source: Source,
    options: ReadOptions<'_>,
) -> Result<ParsedDocument, OpenError> {
    let buf = source.as_bytes();
    let version = parse_header(buf).ok_or(OpenError::MissingHeader)?;

    let mut xref = XrefTable::new();
    let mut trailer = PdfDictionary::new();
    let mut recovered = false;
    let mut prev_startxref = None;

    match find_startxref(buf) {
        Some(start) => {
            let mut described = HashSet::new();
            match walk_chain(buf, start as usize, &mut xref, &mut trailer, &mut described) {
                Ok(()) if trailer.contains_key("Root") => {
                    prev_startxref = Some(start);
                }
                Ok(()) => {
                    tracing::warn!("cross-reference chain has no /Root, rebuilding by scan");
                    xref = XrefTable::new();
                    trailer = PdfDictionary::new();
                    rebuild_by_scan(buf, &mut xref, &mut trailer)?;
                    recovered = true;
                }
                Err(err) => {
                    tracing::warn!(error = %err, "cross-reference chain is broken, rebuilding by scan");
                    xref = XrefTable::new();
                    trailer = PdfDictionary::new();
                    rebuild_by_scan(buf, &mut xref, &mut trailer)?;
                    recovered = true;
                }
            }
        }
        None => {
            tracing::warn!("no startxref pointer, rebuilding by scan");
            rebuild_by_scan(buf, &mut xref, &mut trailer)?;
            recovered = true;
        }
    }

    let mut loader = ObjectLoader::new(source.clone());

    if let Some(encrypt) = trailer.get("Encrypt") {
        let encrypt_dict = match encrypt {
            PdfObject::Dictionary(dict) => dict.clone(),
            // The encryption dictionary itself is stored unencrypted, so it
            // can be loaded before any decryptor exists. Its slot stays
            // exempt from the decryptor for later registry lookups too.
            PdfObject::Reference(r) => match xref.state(r.number()) {
                Some(SlotState::InUse {
                    location: Some(Location::Offset(offset)),
                    ..
                }) => {
                    loader.set_encrypt_number(r.number());
                    let obj = loader
                        .load_at(offset, *r)
                        .map_err(|_| OpenError::Authentication)?;
                    match obj {
                        PdfObject::Dictionary(dict) => dict,
                        _ => return Err(OpenError::Authentication),
                    }
                }
                _ => return Err(OpenError::Authentication),
            },
            _ => return Err(OpenError::Authentication),
        };
        let provider = options
            .decryptor_provider
            .ok_or(OpenError::Authentication)?;
        let decryptor = provider
            .open(&encrypt_dict, options.password)
            .map_err(|_| OpenError::Authentication)?;
        loader.set_decryptor(decryptor);
        tracing::debug!("security handler installed");
    }

    for key in STRUCTURAL_TRAILER_KEYS {
        trailer.remove(key);
    }

    xref.install_loader(loader);

    tracing::debug!(
        size = xref.size(),
        recovered,
        version = format_args!("{}.{}", version.0, version.1),
        "document opened"
    );

    Ok(ParsedDocument {
        xref,
        trailer,
        version,
        prev_startxref,
        recovered,
    })
}

/// Locate `%PDF-M.m` near the start of the buffer.
fn parse_header(buf: &[u8]) -> Option<(u8, u8)> {
    let window = &buf[..buf.len().min(HEADER_WINDOW)];
    let at = find_bytes(window, b"%PDF-")?;
    let rest = &buf[at + 5..];
    let major = *rest.first()? as char;
    let minor = *rest.get(2)? as char;
    if rest.get(1) != Some(&b'.') {
        return None;
    }
    Some((major.to_digit(10)? as u8, minor.to_digit(10)? as u8))
}

/// Locate the last `startxref` pointer near the end of the buffer.
fn find_startxref(buf: &[u8]) -> Option<u64> {
    let tail_start = buf.len().saturating_sub(STARTXREF_WINDOW);
    let at = tail_start + rfind_bytes(&buf[tail_start..], b"startxref")?;
    let mut tok = Tokenizer::with_pos(buf, at + b"startxref".len());
    tok.skip_whitespace();
    tok.parse_unsigned().ok()
}

/// Walk the cross-reference chain newest-first, merging entries and trailer
/// keys with first-seen-wins semantics.
///
/// The worklist is ordered so a hybrid file's `/XRefStm` section is merged
/// before the classic section's `/Prev`.
fn walk_chain(
    buf: &[u8],
    start: usize,
    xref: &mut XrefTable,
    trailer: &mut PdfDictionary,
    described: &mut HashSet<u32>,
) -> Result<(), ChainError> {
    let mut worklist = vec![start];
    let mut visited = HashSet::new();

    while let Some(offset) = worklist.pop() {
        if !visited.insert(offset) {
            // A cycle in the Prev chain; already merged.
            continue;
        }
        if offset >= buf.len() {
            return Err(ChainError::OutOfBounds(offset));
        }

        let mut tok = Tokenizer::with_pos(buf, offset);
        tok.skip_whitespace();
        let section_trailer = if buf[tok.pos()..].starts_with(b"xref") {
            let section = tok.parse_xref_table()?;
            for (number, entry) in section.entries {
                if !described.insert(number) {
                    continue;
                }
                let state = match entry {
                    RawXrefEntry::Free {
                        next_free,
                        generation,
                    } => SlotState::Free {
                        next_free,
                        generation,
                    },
                    RawXrefEntry::Used { offset, generation } => SlotState::InUse {
                        location: Some(Location::Offset(offset)),
                        generation,
                        flushed: false,
                        modified: false,
                    },
                };
                xref.set_raw(number, state);
            }
            section.trailer
        } else {
            let (_, _, obj) = tok.parse_indirect_object()?;
            let stream = match obj {
                PdfObject::Stream(stream) => stream,
                _ => return Err(ChainError::Malformed("expected a stream object")),
            };
            merge_xref_stream(&stream, xref, described)?;
            stream.dict
        };

        if let Some(prev) = section_trailer.get_i64("Prev").filter(|p| *p >= 0) {
            worklist.push(prev as usize);
        }
        if let Some(hybrid) = section_trailer.get_i64("XRefStm").filter(|p| *p >= 0) {
            worklist.push(hybrid as usize);
        }
        for (key, value) in section_trailer.iter() {
            if !trailer.contains_key(key.as_str()) {
                trailer.put(key.clone(), value.clone());
            }
        }
    }
    Ok(())
}

/// Merge one `/Type /XRef` stream's entries into the registry.
fn merge_xref_stream(
    stream: &PdfStream,
    xref: &mut XrefTable,
    described: &mut HashSet<u32>,
) -> Result<(), ChainError> {
    let dict = &stream.dict;
    let size = dict
        .get_i64("Size")
        .filter(|s| *s >= 0)
        .ok_or(ChainError::Malformed("missing /Size"))?;

    let widths = dict
        .get_array("W")
        .ok_or(ChainError::Malformed("missing /W"))?;
    if widths.len() != 3 {
        return Err(ChainError::Malformed("/W must have three entries"));
    }
    let mut w = [0usize; 3];
    for (i, entry) in widths.iter().enumerate() {
        let width = entry
            .as_i64()
            .filter(|v| (0..=8).contains(v))
            .ok_or(ChainError::Malformed("bad /W entry"))?;
        w[i] = width as usize;
    }
    let row = w[0] + w[1] + w[2];
    if row == 0 {
        return Err(ChainError::Malformed("/W is all zeroes"));
    }

    let ranges: Vec<(u64, u64)> = match dict.get_array("Index") {
        None => vec![(0, size as u64)],
        Some(index) => {
            if index.len() % 2 != 0 {
                return Err(ChainError::Malformed("/Index must pair up"));
            }
            index
                .chunks(2)
                .map(|pair| {
                    let start = pair[0].as_i64().filter(|v| *v >= 0);
                    let count = pair[1].as_i64().filter(|v| *v >= 0);
                    match (start, count) {
                        (Some(start), Some(count)) => Ok((start as u64, count as u64)),
                        _ => Err(ChainError::Malformed("bad /Index entry")),
                    }
                })
                .collect::<Result<_, _>>()?
        }
    };

    let data = stream.decoded_data()?;
    let mut pos = 0usize;
    for (start, count) in ranges {
        for i in 0..count {
            if pos + row > data.len() {
                return Err(ChainError::Malformed("entry data is truncated"));
            }
            // A zero-width first field defaults to type 1 (in use).
            let kind = if w[0] == 0 {
                1
            } else {
                read_be(&data[pos..pos + w[0]])
            };
            let field2 = read_be(&data[pos + w[0]..pos + w[0] + w[1]]);
            let field3 = read_be(&data[pos + w[0] + w[1]..pos + row]);
            pos += row;

            let number = start + i;
            if number > u32::MAX as u64 {
                return Err(ChainError::Malformed("object number overflow"));
            }
            let number = number as u32;
            let state = match kind {
                0 => SlotState::Free {
                    next_free: field2.min(u32::MAX as u64) as u32,
                    generation: field3.min(u16::MAX as u64) as u16,
                },
                1 => SlotState::InUse {
                    location: Some(Location::Offset(field2)),
                    generation: field3.min(u16::MAX as u64) as u16,
                    flushed: false,
                    modified: false,
                },
                2 => SlotState::InUse {
                    location: Some(Location::InStream {
                        container: field2.min(u32::MAX as u64) as u32,
                        index: field3.min(u32::MAX as u64) as u32,
                    }),
                    generation: 0,
                    flushed: false,
                    modified: false,
                },
                other => {
                    // Unknown types read as null per the format; leaving the
                    // slot undescribed has the same effect.
                    tracing::warn!(number, kind = other, "unknown xref entry type");
                    continue;
                }
            };
            if described.insert(number) {
                xref.set_raw(number, state);
            }
        }
    }
    Ok(())
}

fn read_be(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0u64, |acc, b| acc << 8 | *b as u64)
}

/// Rebuild the registry by scanning the whole buffer for `n g obj` headers.
/// Later bodies win, matching the revision order of an appended file.
fn rebuild_by_scan(
    buf: &[u8],
    xref: &mut XrefTable,
    trailer: &mut PdfDictionary,
) -> Result<(), OpenError> {
    let mut catalog: Option<ObjRef> = None;
    let mut found_any = false;

    let mut search = 0usize;
    while let Some(rel) = find_bytes(&buf[search..], b"obj") {
        let at = search + rel;
        search = at + 3;
        if buf.get(at + 3).copied().is_some_and(is_regular) {
            continue;
        }
        let Some((start, number, generation)) = backtrack_object_header(buf, at) else {
            continue;
        };
        let mut tok = Tokenizer::with_pos(buf, start);
        match tok.parse_indirect_object() {
            Ok((parsed_number, parsed_generation, obj)) => {
                if parsed_number != number || parsed_generation != generation {
                    continue;
                }
                xref.set_raw(
                    number,
                    SlotState::InUse {
                        location: Some(Location::Offset(start as u64)),
                        generation,
                        flushed: false,
                        modified: false,
                    },
                );
                found_any = true;
                let is_catalog = obj
                    .as_dictionary()
                    .and_then(|d| d.get_name("Type"))
                    .is_some_and(|t| t.as_str() == "Catalog");
                if is_catalog {
                    catalog = Some(ObjRef::new(number, generation));
                }
                // Skip past the body so nested `obj` keywords in stream
                // payloads are not mistaken for headers.
                search = tok.pos().max(search);
            }
            Err(err) => {
                tracing::warn!(number, offset = start, error = %err, "skipping malformed body during rebuild");
            }
        }
    }

    if !found_any {
        return Err(OpenError::MissingXref);
    }

    // Prefer the last parseable trailer dictionary that names a catalog.
    let mut search = 0usize;
    while let Some(rel) = find_bytes(&buf[search..], b"trailer") {
        let at = search + rel;
        search = at + b"trailer".len();
        let mut tok = Tokenizer::with_pos(buf, at + b"trailer".len());
        tok.skip_whitespace();
        if let Ok(dict) = tok.parse_dictionary() {
            if dict.contains_key("Root") {
                for (key, value) in dict.iter() {
                    trailer.put(key.clone(), value.clone());
                }
            }
        }
    }

    if !trailer.contains_key("Root") {
        match catalog {
            Some(root) => {
                trailer.put("Root", root);
            }
            None => return Err(OpenError::MissingCatalog),
        }
    }

    tracing::debug!(size = xref.size(), "registry rebuilt by scan");
    Ok(())
}

/// From an `obj` keyword at `kw`, walk backwards over `<number> <gen>` and
/// return the header's start offset and both values.
fn backtrack_object_header(buf: &[u8], kw: usize) -> Option<(usize, u32, u16)> {
    let digits_before = |mut p: usize| {
        let end = p;
        while p > 0 && buf[p - 1].is_ascii_digit() {
            p -= 1;
        }
        (p != end).then_some(p)
    };
    let whitespace_before = |mut p: usize| {
        let end = p;
        while p > 0 && crate::parse::is_whitespace(buf[p - 1]) {
            p -= 1;
        }
        (p != end).then_some(p)
    };

    let gen_end = whitespace_before(kw)?;
    let gen_start = digits_before(gen_end)?;
    let num_end = whitespace_before(gen_start)?;
    let num_start = digits_before(num_end)?;
    if num_start > 0 && is_regular(buf[num_start - 1]) {
        return None;
    }

    let generation: u16 = std::str::from_utf8(&buf[gen_start..gen_end])
        .ok()?
        .parse()
        .ok()?;
    let number: u32 = std::str::from_utf8(&buf[num_start..num_end])
        .ok()?
        .parse()
        .ok()?;
    if number == 0 {
        return None;
    }
    Some((num_start, number, generation))
}
