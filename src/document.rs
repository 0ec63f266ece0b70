//! Document controller.
//!
//! A [`PdfDocument`] ties the registry, the reader and the writer together
//! and owns the lifecycle: objects are created or loaded while the document
//! is open, and `close` performs the reachability sweep, serializes every
//! selected object, writes the cross-reference section and releases the
//! sink. Three modes exist: writing a fresh document, reading an existing
//! one, and stamping (reading plus writing, optionally as an incremental
//! update that leaves the original bytes untouched).

use std::collections::{BTreeSet, HashSet, VecDeque};
use std::fmt;
use std::io::{self, Write};

use crate::compression::DEFAULT_COMPRESSION;
use crate::crypto::DecryptorProvider;
use crate::object::{ObjRef, PdfDictionary, PdfName, PdfObject, PdfStream, PdfString};
use crate::reader::{read_document, OpenError, ReadOptions, Source};
use crate::writer::{ObjectStreamBuilder, PdfWriter, XrefWriteEntry};
use crate::xref::{Location, ResolveError, SlotState, XrefTable, MAX_GENERATION};

/// Default page size, A4 in default user space units.
const DEFAULT_MEDIA_BOX: [i64; 4] = [0, 0, 595, 842];

const PRODUCER: &str = concat!("folio ", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PdfVersion {
    pub major: u8,
    pub minor: u8,
}

impl PdfVersion {
    pub const PDF_1_4: PdfVersion = PdfVersion { major: 1, minor: 4 };
    pub const PDF_1_5: PdfVersion = PdfVersion { major: 1, minor: 5 };
    pub const PDF_1_7: PdfVersion = PdfVersion { major: 1, minor: 7 };
    pub const PDF_2_0: PdfVersion = PdfVersion { major: 2, minor: 0 };
}

impl fmt::Display for PdfVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    ReadingOnly,
    Writing,
    Stamping,
}

#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    #[error("document is closed")]
    Closed,

    #[error("document was already closed")]
    AlreadyClosed,

    #[error("document was opened read-only")]
    ReadOnly,

    #[error("cannot append to a document whose cross-reference table was rebuilt")]
    AppendUnsupported,

    #[error("malformed document structure: {0}")]
    Malformed(&'static str),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Open(#[from] OpenError),

    #[error("failed to write output")]
    Io(#[from] io::Error),
}

/// Knobs for opening and saving documents. All setters are chainable.
#[derive(Default)]
pub struct DocumentOptions {
    version: Option<PdfVersion>,
    full_compression: bool,
    compression_level: Option<i32>,
    password: Option<Vec<u8>>,
    append_mode: bool,
    flush_unused_objects: bool,
    strict_close: bool,
    decryptor_provider: Option<Box<dyn DecryptorProvider>>,
}

impl DocumentOptions {
    pub fn new() -> DocumentOptions {
        DocumentOptions::default()
    }

    /// Header version for newly written documents. Defaults to 1.7.
    pub fn with_version(mut self, version: PdfVersion) -> Self {
        self.version = Some(version);
        self
    }

    /// Store the cross-reference table as a compressed stream and pack
    /// eligible objects into object streams.
    pub fn with_full_compression(mut self, full_compression: bool) -> Self {
        self.full_compression = full_compression;
        self
    }

    /// Flate level for stream payloads, `-1` for the default.
    pub fn with_compression_level(mut self, level: i32) -> Self {
        self.compression_level = Some(level);
        self
    }

    /// Credential handed to the decryptor provider when the document turns
    /// out to be encrypted.
    pub fn with_password(mut self, password: impl Into<Vec<u8>>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Stamp as an incremental update: the original bytes are copied
    /// verbatim and only changed objects are appended.
    pub fn with_append_mode(mut self, append_mode: bool) -> Self {
        self.append_mode = append_mode;
        self
    }

    /// Also serialize objects the reachability sweep would drop.
    pub fn with_flush_unused_objects(mut self, flush: bool) -> Self {
        self.flush_unused_objects = flush;
        self
    }

    /// Make closing an already-closed document an error instead of a no-op.
    pub fn with_strict_close(mut self, strict: bool) -> Self {
        self.strict_close = strict;
        self
    }

    /// Security handler factory for encrypted documents.
    pub fn with_decryptor_provider(mut self, provider: Box<dyn DecryptorProvider>) -> Self {
        self.decryptor_provider = Some(provider);
        self
    }
}

pub struct PdfDocument {
    mode: Mode,
    version: PdfVersion,
    xref: XrefTable,
    trailer: PdfDictionary,
    writer: Option<PdfWriter<Box<dyn Write>>>,
    /// Offset of the source's newest xref section, for `/Prev` in append mode.
    prev_startxref: Option<u64>,
    recovered: bool,
    closed: bool,
    full_compression: bool,
    compression_level: i32,
    flush_unused_objects: bool,
    append_mode: bool,
    strict_close: bool,
    /// Numbers serialized to the sink this session.
    session_written: BTreeSet<u32>,
    /// Numbers released this session; appended updates must republish them.
    freed: BTreeSet<u32>,
}

impl PdfDocument {
    /// Start a fresh document over `sink`. The header and a skeleton
    /// catalog, page tree and info dictionary are set up immediately.
    pub fn create<W: Write + 'static>(
        sink: W,
        options: DocumentOptions,
    ) -> Result<PdfDocument, DocumentError> {
        let version = options.version.unwrap_or(PdfVersion::PDF_1_7);
        let mut writer = PdfWriter::new(Box::new(sink) as Box<dyn Write>);
        writer.write_header((version.major, version.minor))?;

        let mut doc = PdfDocument {
            mode: Mode::Writing,
            version,
            xref: XrefTable::new(),
            trailer: PdfDictionary::new(),
            writer: Some(writer),
            prev_startxref: None,
            recovered: false,
            closed: false,
            full_compression: options.full_compression,
            compression_level: options.compression_level.unwrap_or(DEFAULT_COMPRESSION),
            flush_unused_objects: options.flush_unused_objects,
            append_mode: false,
            strict_close: options.strict_close,
            session_written: BTreeSet::new(),
            freed: BTreeSet::new(),
        };
        doc.bootstrap()?;
        Ok(doc)
    }

    /// Open an existing document for reading.
    pub fn open(source: Source, options: DocumentOptions) -> Result<PdfDocument, DocumentError> {
        let parsed = read_document(
            source,
            ReadOptions {
                password: options.password.as_deref(),
                decryptor_provider: options.decryptor_provider.as_deref(),
            },
        )?;
        Ok(PdfDocument {
            mode: Mode::ReadingOnly,
            version: PdfVersion {
                major: parsed.version.0,
                minor: parsed.version.1,
            },
            xref: parsed.xref,
            trailer: parsed.trailer,
            writer: None,
            prev_startxref: parsed.prev_startxref,
            recovered: parsed.recovered,
            closed: false,
            full_compression: options.full_compression,
            compression_level: options.compression_level.unwrap_or(DEFAULT_COMPRESSION),
            flush_unused_objects: options.flush_unused_objects,
            append_mode: false,
            strict_close: options.strict_close,
            session_written: BTreeSet::new(),
            freed: BTreeSet::new(),
        })
    }

    /// Open `source` and write a modified copy to `sink`. With append mode
    /// the source bytes are copied verbatim and changes accumulate as an
    /// incremental update; otherwise the whole document is rewritten.
    pub fn stamp<W: Write + 'static>(
        source: Source,
        sink: W,
        options: DocumentOptions,
    ) -> Result<PdfDocument, DocumentError> {
        let parsed = read_document(
            source.clone(),
            ReadOptions {
                password: options.password.as_deref(),
                decryptor_provider: options.decryptor_provider.as_deref(),
            },
        )?;
        let source_version = PdfVersion {
            major: parsed.version.0,
            minor: parsed.version.1,
        };
        let version = options.version.unwrap_or(source_version).max(source_version);

        let mut writer = PdfWriter::new(Box::new(sink) as Box<dyn Write>);
        if options.append_mode {
            if parsed.prev_startxref.is_none() {
                return Err(DocumentError::AppendUnsupported);
            }
            let bytes = source.as_bytes();
            writer.write_verbatim(bytes)?;
            if bytes.last() != Some(&b'\n') {
                writer.write_verbatim(b"\n")?;
            }
        } else {
            writer.write_header((version.major, version.minor))?;
        }

        Ok(PdfDocument {
            mode: Mode::Stamping,
            version,
            xref: parsed.xref,
            trailer: parsed.trailer,
            writer: Some(writer),
            prev_startxref: parsed.prev_startxref,
            recovered: parsed.recovered,
            closed: false,
            full_compression: options.full_compression,
            compression_level: options.compression_level.unwrap_or(DEFAULT_COMPRESSION),
            flush_unused_objects: options.flush_unused_objects,
            append_mode: options.append_mode,
            strict_close: options.strict_close,
            session_written: BTreeSet::new(),
            freed: BTreeSet::new(),
        })
    }

    fn bootstrap(&mut self) -> Result<(), DocumentError> {
        let mut catalog = PdfDictionary::new();
        catalog.put("Type", PdfName::new("Catalog"));
        let catalog_ref = self.xref.allocate(catalog.into());

        let mut pages = PdfDictionary::new();
        pages.put("Type", PdfName::new("Pages"));
        pages.put("Kids", PdfObject::Array(Vec::new()));
        pages.put("Count", 0i64);
        let pages_ref = self.xref.allocate(pages.into());

        let mut info = PdfDictionary::new();
        info.put("Producer", PdfString::literal(PRODUCER.as_bytes()));
        let info_ref = self.xref.allocate(info.into());

        self.xref
            .resolve_mut(catalog_ref)?
            .as_dictionary_mut()
            .ok_or(DocumentError::Malformed("catalog is not a dictionary"))?
            .put("Pages", pages_ref);

        self.trailer.put("Root", catalog_ref);
        self.trailer.put("Info", info_ref);
        Ok(())
    }

    // ---- accessors ----

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn version(&self) -> PdfVersion {
        self.version
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Whether the cross-reference table had to be rebuilt by scanning.
    pub fn is_recovered(&self) -> bool {
        self.recovered
    }

    pub fn trailer(&self) -> &PdfDictionary {
        &self.trailer
    }

    /// `/Size` of the registry: highest known object number plus one.
    pub fn xref_size(&self) -> u32 {
        self.xref.size()
    }

    pub fn catalog_ref(&self) -> Option<ObjRef> {
        self.trailer.get_ref("Root")
    }

    pub fn catalog(&mut self) -> Result<&PdfDictionary, DocumentError> {
        let root = self
            .catalog_ref()
            .ok_or(DocumentError::Malformed("trailer has no /Root"))?;
        self.xref
            .resolve(root)?
            .as_dictionary()
            .ok_or(DocumentError::Malformed("catalog is not a dictionary"))
    }

    // ---- object facade ----

    /// Register a value as a new indirect object and return its reference.
    pub fn create_object(&mut self, value: impl Into<PdfObject>) -> Result<ObjRef, DocumentError> {
        self.ensure_open()?;
        Ok(self.xref.allocate(value.into()))
    }

    pub fn resolve(&mut self, r: ObjRef) -> Result<&PdfObject, DocumentError> {
        self.ensure_open()?;
        Ok(self.xref.resolve(r)?)
    }

    pub fn resolve_mut(&mut self, r: ObjRef) -> Result<&mut PdfObject, DocumentError> {
        self.ensure_open()?;
        Ok(self.xref.resolve_mut(r)?)
    }

    /// Release an object's number back to the free list. References to the
    /// old generation resolve to null from here on.
    pub fn set_free(&mut self, r: ObjRef) -> Result<(), DocumentError> {
        self.ensure_open()?;
        if self.xref.generation_of(r.number()) != Some(r.generation()) {
            return Ok(());
        }
        self.xref.free(r.number());
        self.freed.insert(r.number());
        Ok(())
    }

    /// Serialize an object to the sink right away, freeing its payload from
    /// memory. The object becomes immutable. Early flushes always use an
    /// offset-addressed body, even under full compression.
    pub fn flush_object(&mut self, r: ObjRef) -> Result<(), DocumentError> {
        self.ensure_writable()?;
        if self.xref.generation_of(r.number()) != Some(r.generation()) {
            return Err(ResolveError::InvalidReference(r.number(), r.generation()).into());
        }
        let mut worklist = VecDeque::from([r.number()]);
        while let Some(number) = worklist.pop_front() {
            self.write_object_now(number, &mut worklist)?;
        }
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), DocumentError> {
        if self.closed {
            return Err(DocumentError::Closed);
        }
        Ok(())
    }

    fn ensure_writable(&self) -> Result<(), DocumentError> {
        self.ensure_open()?;
        if self.mode == Mode::ReadingOnly {
            return Err(DocumentError::ReadOnly);
        }
        Ok(())
    }

    // ---- page tree ----

    /// Append an empty page with the default media box, creating its
    /// contents stream. Returns the page's reference.
    pub fn add_new_page(&mut self) -> Result<ObjRef, DocumentError> {
        self.ensure_open()?;
        let pages_ref = self
            .catalog()?
            .get_ref("Pages")
            .ok_or(DocumentError::Malformed("catalog has no /Pages"))?;

        let contents_ref = self
            .xref
            .allocate(PdfStream::new(PdfDictionary::new(), Vec::new()).into());

        let mut page = PdfDictionary::new();
        page.put("Type", PdfName::new("Page"));
        page.put("Parent", pages_ref);
        page.put(
            "MediaBox",
            PdfObject::Array(DEFAULT_MEDIA_BOX.iter().map(|v| PdfObject::from(*v)).collect()),
        );
        page.put("Contents", contents_ref);
        page.put("Resources", PdfDictionary::new());
        let page_ref = self.xref.allocate(page.into());

        let pages = self
            .xref
            .resolve_mut(pages_ref)?
            .as_dictionary_mut()
            .ok_or(DocumentError::Malformed("page tree root is not a dictionary"))?;
        let count = pages.get_i64("Count").unwrap_or(0);
        if pages.get("Kids").and_then(PdfObject::as_array).is_none() {
            pages.put("Kids", PdfObject::Array(Vec::new()));
        }
        if let Some(kids) = pages.get_mut("Kids").and_then(PdfObject::as_array_mut) {
            kids.push(PdfObject::Reference(page_ref));
        }
        pages.put("Count", count + 1);

        tracing::debug!(page = %page_ref, "added page");
        Ok(page_ref)
    }

    // ---- closing ----

    /// Serialize the document and release the sink. Closing twice is a
    /// no-op unless strict close was requested.
    pub fn close(&mut self) -> Result<(), DocumentError> {
        if self.closed {
            return if self.strict_close {
                Err(DocumentError::AlreadyClosed)
            } else {
                Ok(())
            };
        }
        let result = self.close_inner();
        // The sink is released on every path, success or not.
        self.writer = None;
        self.closed = true;
        result
    }

    fn close_inner(&mut self) -> Result<(), DocumentError> {
        if self.mode == Mode::ReadingOnly {
            return Ok(());
        }

        let reachable = self.sweep()?;
        let mut worklist: VecDeque<u32> = VecDeque::new();
        for number in 1..self.xref.size() {
            let (flushed, modified) = match self.xref.state(number) {
                Some(SlotState::InUse {
                    flushed, modified, ..
                }) => (flushed, modified),
                _ => continue,
            };
            if flushed {
                continue;
            }
            let selected = if self.append_mode {
                modified && (reachable.contains(&number) || self.flush_unused_objects)
            } else {
                reachable.contains(&number) || self.flush_unused_objects
            };
            if selected {
                worklist.push_back(number);
            }
        }
        tracing::debug!(
            count = worklist.len(),
            append = self.append_mode,
            "serializing objects"
        );

        let encrypt_number = self.trailer.get_ref("Encrypt").map(|r| r.number());
        let mut container: Option<ObjectStreamBuilder> = None;
        while let Some(number) = worklist.pop_front() {
            let generation = match self.xref.state(number) {
                Some(SlotState::InUse {
                    generation,
                    flushed: false,
                    ..
                }) => generation,
                _ => continue,
            };
            self.xref.resolve(ObjRef::new(number, generation))?;
            let compressible = self.full_compression
                && generation == 0
                && Some(number) != encrypt_number
                && !matches!(self.xref.object(number), Some(PdfObject::Stream(_)));
            if compressible {
                let mut obj = self.xref.take_object(number).unwrap_or(PdfObject::Null);
                promote_nested_streams(&mut obj, &mut self.xref, &mut worklist);
                let builder = container.get_or_insert_with(ObjectStreamBuilder::new);
                builder.push(number, &obj);
                self.xref.restore_object(number, obj);
                if builder.is_full() {
                    let full = container.take().unwrap_or_else(ObjectStreamBuilder::new);
                    self.flush_container(full)?;
                }
            } else {
                self.write_object_now(number, &mut worklist)?;
            }
        }
        if let Some(builder) = container.take() {
            if !builder.is_empty() {
                self.flush_container(builder)?;
            }
        }

        if self.append_mode {
            self.write_appended_xref()?;
        } else {
            self.write_rewritten_xref()?;
        }
        if let Some(writer) = self.writer.as_mut() {
            writer.flush()?;
        }
        Ok(())
    }

    /// Serialize one object at the current offset, promoting any nested
    /// direct streams to indirect objects first.
    fn write_object_now(
        &mut self,
        number: u32,
        worklist: &mut VecDeque<u32>,
    ) -> Result<(), DocumentError> {
        let generation = match self.xref.state(number) {
            Some(SlotState::InUse {
                generation,
                flushed: false,
                ..
            }) => generation,
            _ => return Ok(()),
        };
        self.xref.resolve(ObjRef::new(number, generation))?;
        let mut obj = self.xref.take_object(number).unwrap_or(PdfObject::Null);
        promote_nested_streams(&mut obj, &mut self.xref, worklist);

        let writer = self.writer.as_mut().ok_or(DocumentError::Closed)?;
        let offset = writer.write_indirect(number, generation, &obj, self.compression_level)?;
        self.xref.restore_object(number, obj);
        self.xref.mark_flushed(number, Location::Offset(offset));
        self.session_written.insert(number);
        Ok(())
    }

    fn flush_container(&mut self, builder: ObjectStreamBuilder) -> Result<(), DocumentError> {
        let members = builder.members().to_vec();
        let stream = builder.build();
        let container_ref = self.xref.allocate_end(PdfObject::Null);

        let writer = self.writer.as_mut().ok_or(DocumentError::Closed)?;
        let offset = writer.write_indirect(
            container_ref.number(),
            0,
            &PdfObject::Stream(stream),
            self.compression_level,
        )?;
        self.xref
            .mark_flushed(container_ref.number(), Location::Offset(offset));
        self.session_written.insert(container_ref.number());

        for (index, member) in members.iter().enumerate() {
            self.xref.mark_flushed(
                *member,
                Location::InStream {
                    container: container_ref.number(),
                    index: index as u32,
                },
            );
            self.session_written.insert(*member);
        }
        tracing::debug!(
            container = container_ref.number(),
            members = members.len(),
            "wrote object stream"
        );
        Ok(())
    }

    /// Full-rewrite epilogue: unwritten slots are dropped (trailing ones
    /// shrink the table, interior ones become free entries), then the whole
    /// table is serialized.
    fn write_rewritten_xref(&mut self) -> Result<(), DocumentError> {
        let mut size = self.xref.size();
        while size > 1 {
            match self.xref.state(size - 1) {
                Some(SlotState::InUse { flushed: false, .. }) => size -= 1,
                _ => break,
            }
        }
        self.xref.truncate(size);
        for number in 1..size {
            if let Some(SlotState::InUse {
                flushed: false,
                generation,
                ..
            }) = self.xref.state(number)
            {
                tracing::debug!(number, "dropping unreferenced object");
                self.xref.set_raw(
                    number,
                    SlotState::Free {
                        next_free: 0,
                        generation: generation.saturating_add(1).min(MAX_GENERATION),
                    },
                );
            }
        }
        self.xref.relink_free_list();

        let mut entries = Vec::with_capacity(self.xref.size() as usize);
        for number in 0..self.xref.size() {
            if let Some(entry) = self.write_entry_for(number) {
                entries.push((number, entry));
            }
        }
        self.finish_xref(entries, false)
    }

    /// Append epilogue: only slots touched this session get entries, plus
    /// the free-list head.
    fn write_appended_xref(&mut self) -> Result<(), DocumentError> {
        let mut numbers: BTreeSet<u32> = self.session_written.clone();
        numbers.extend(self.freed.iter().copied());
        numbers.insert(0);

        let mut entries = Vec::with_capacity(numbers.len());
        for number in numbers {
            if let Some(entry) = self.write_entry_for(number) {
                entries.push((number, entry));
            }
        }
        self.finish_xref(entries, true)
    }

    fn write_entry_for(&self, number: u32) -> Option<XrefWriteEntry> {
        match self.xref.state(number)? {
            SlotState::Free {
                next_free,
                generation,
            } => Some(XrefWriteEntry::Free {
                next_free,
                generation,
            }),
            SlotState::InUse {
                location: Some(Location::Offset(offset)),
                generation,
                ..
            } => Some(XrefWriteEntry::Offset { offset, generation }),
            SlotState::InUse {
                location: Some(Location::InStream { container, index }),
                ..
            } => Some(XrefWriteEntry::InStream { container, index }),
            SlotState::InUse { location: None, .. } => None,
        }
    }

    fn finish_xref(
        &mut self,
        mut entries: Vec<(u32, XrefWriteEntry)>,
        append: bool,
    ) -> Result<(), DocumentError> {
        let mut trailer = PdfDictionary::new();
        for key in ["Root", "Info", "Encrypt", "ID"] {
            if let Some(value) = self.trailer.get(key) {
                trailer.put(key, value.clone());
            }
        }
        if append {
            let prev = self.prev_startxref.ok_or(DocumentError::AppendUnsupported)?;
            trailer.put("Prev", prev as i64);
        }

        let writer = self.writer.as_mut().ok_or(DocumentError::Closed)?;
        let start = if self.full_compression {
            // The cross-reference stream describes itself, so its slot is
            // allocated before the entry list is final.
            let xref_ref = self.xref.allocate_end(PdfObject::Null);
            let size = self.xref.size();
            let offset = writer.offset();
            entries.push((
                xref_ref.number(),
                XrefWriteEntry::Offset {
                    offset,
                    generation: 0,
                },
            ));
            writer.write_xref_stream(
                xref_ref.number(),
                &entries,
                &trailer,
                size,
                self.compression_level,
            )?
        } else {
            trailer.put("Size", self.xref.size() as i64);
            let offset = writer.write_xref_table(&entries)?;
            writer.write_trailer(&trailer)?;
            offset
        };
        writer.write_startxref(start)?;
        tracing::debug!(offset = start, size = self.xref.size(), "wrote cross-reference section");
        Ok(())
    }

    /// Mark every object reachable from the trailer. Dangling references,
    /// including references past the end of the table, resolve to null and
    /// terminate their branch.
    fn sweep(&mut self) -> Result<HashSet<u32>, DocumentError> {
        let mut visited = HashSet::new();
        let mut stack: Vec<ObjRef> = Vec::new();
        for value in self.trailer.values() {
            collect_refs(value, &mut stack);
        }
        while let Some(r) = stack.pop() {
            if !visited.insert(r.number()) {
                continue;
            }
            let obj = match self.xref.resolve(r) {
                Ok(obj) => obj,
                Err(ResolveError::InvalidReference(..)) => {
                    tracing::warn!(reference = %r, "reference to undefined object treated as null");
                    continue;
                }
                Err(err) => return Err(err.into()),
            };
            collect_refs(obj, &mut stack);
        }
        Ok(visited)
    }
}

impl Drop for PdfDocument {
    fn drop(&mut self) {
        if !self.closed && self.mode != Mode::ReadingOnly {
            tracing::warn!("document dropped without close, output is incomplete");
        }
    }
}

fn collect_refs(obj: &PdfObject, out: &mut Vec<ObjRef>) {
    match obj {
        PdfObject::Reference(r) => out.push(*r),
        PdfObject::Array(items) => {
            for item in items {
                collect_refs(item, out);
            }
        }
        PdfObject::Dictionary(dict) => {
            for value in dict.values() {
                collect_refs(value, out);
            }
        }
        PdfObject::Stream(stream) => {
            for value in stream.dict.values() {
                collect_refs(value, out);
            }
        }
        _ => {}
    }
}

/// Replace direct streams nested inside `obj` with references to freshly
/// allocated indirect objects, queueing those for serialization.
fn promote_nested_streams(obj: &mut PdfObject, xref: &mut XrefTable, worklist: &mut VecDeque<u32>) {
    match obj {
        PdfObject::Array(items) => {
            for item in items {
                promote_value(item, xref, worklist);
            }
        }
        PdfObject::Dictionary(dict) => {
            for value in dict.values_mut() {
                promote_value(value, xref, worklist);
            }
        }
        PdfObject::Stream(stream) => {
            for value in stream.dict.values_mut() {
                promote_value(value, xref, worklist);
            }
        }
        _ => {}
    }
}

fn promote_value(value: &mut PdfObject, xref: &mut XrefTable, worklist: &mut VecDeque<u32>) {
    if value.is_stream() {
        let stream = std::mem::take(value);
        let r = xref.allocate(stream);
        tracing::debug!(promoted = %r, "promoted nested stream to indirect object");
        worklist.push_back(r.number());
        *value = PdfObject::Reference(r);
    } else {
        promote_nested_streams(value, xref, worklist);
    }
}
