//! Serialization: object bodies, classic cross-reference tables and
//! cross-reference streams.
//!
//! All output goes through a [`CountingWriter`] so recorded byte offsets are
//! exact. The writer is policy-free: which objects get written, and whether
//! the table is classic or compressed, is decided by the document layer.

use std::borrow::Cow;
use std::io::{self, Write};

use crate::compression::{flate_encode, resolve_level};
use crate::counting::CountingWriter;
use crate::object::{PdfDictionary, PdfName, PdfObject, PdfStream};
use crate::parse::is_delimiter;

/// Object streams are capped at this many members; the document layer opens
/// a fresh container when one fills up.
pub(crate) const MAX_OBJSTM_MEMBERS: usize = 200;

/// One row of a cross-reference section, ready to serialize.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum XrefWriteEntry {
    Free { next_free: u32, generation: u16 },
    Offset { offset: u64, generation: u16 },
    InStream { container: u32, index: u32 },
}

pub(crate) struct PdfWriter<W: Write> {
    sink: CountingWriter<W>,
}

impl<W: Write> PdfWriter<W> {
    pub(crate) fn new(sink: W) -> PdfWriter<W> {
        PdfWriter {
            sink: CountingWriter::new(sink),
        }
    }

    /// Byte offset the next write will land at.
    pub(crate) fn offset(&self) -> u64 {
        self.sink.bytes_written()
    }

    pub(crate) fn flush(&mut self) -> io::Result<()> {
        self.sink.flush()
    }

    /// `%PDF-M.m` plus the high-bit comment line that marks the file binary.
    pub(crate) fn write_header(&mut self, version: (u8, u8)) -> io::Result<()> {
        write!(self.sink, "%PDF-{}.{}\n", version.0, version.1)?;
        self.sink.write_all(b"%\xE2\xE3\xCF\xD3\n")
    }

    /// Copy bytes through unchanged; used for the incremental-update prefix.
    pub(crate) fn write_verbatim(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.sink.write_all(bytes)
    }

    /// Serialize one `n g obj … endobj` body and return its offset.
    ///
    /// A non-raw stream payload is deflated when `level` resolves above
    /// zero; a raw payload is copied verbatim under its existing filters.
    pub(crate) fn write_indirect(
        &mut self,
        number: u32,
        generation: u16,
        obj: &PdfObject,
        level: i32,
    ) -> io::Result<u64> {
        let offset = self.sink.bytes_written();
        write!(self.sink, "{} {} obj\n", number, generation)?;
        match obj {
            PdfObject::Stream(stream) => {
                let mut dict = stream.dict.clone();
                let payload: Cow<'_, [u8]> = if stream.is_raw() {
                    Cow::Borrowed(stream.data())
                } else {
                    dict.remove("Filter");
                    dict.remove("DecodeParms");
                    let resolved = resolve_level(level);
                    if resolved > 0 && !stream.data().is_empty() {
                        dict.put("Filter", PdfName::new("FlateDecode"));
                        Cow::Owned(flate_encode(stream.data(), resolved))
                    } else {
                        Cow::Borrowed(stream.data())
                    }
                };
                dict.put("Length", payload.len() as i64);

                let mut out = Vec::new();
                serialize_dictionary(&mut out, &dict);
                self.sink.write_all(&out)?;
                self.sink.write_all(b"\nstream\n")?;
                self.sink.write_all(&payload)?;
                self.sink.write_all(b"\nendstream\nendobj\n")?;
            }
            other => {
                let mut out = Vec::new();
                serialize_object(&mut out, other);
                self.sink.write_all(&out)?;
                self.sink.write_all(b"\nendobj\n")?;
            }
        }
        tracing::trace!(number, generation, offset, "wrote object");
        Ok(offset)
    }

    /// Write a classic `xref` section and return its offset. Entries must be
    /// sorted by object number; contiguous runs become subsections.
    pub(crate) fn write_xref_table(
        &mut self,
        entries: &[(u32, XrefWriteEntry)],
    ) -> io::Result<u64> {
        let offset = self.sink.bytes_written();
        self.sink.write_all(b"xref\n")?;
        for (start, run) in contiguous_runs(entries) {
            write!(self.sink, "{} {}\n", start, run.len())?;
            for (_, entry) in run {
                // Each record is exactly 20 bytes.
                match *entry {
                    XrefWriteEntry::Free {
                        next_free,
                        generation,
                    } => write!(self.sink, "{:010} {:05} f\r\n", next_free, generation)?,
                    XrefWriteEntry::Offset { offset, generation } => {
                        write!(self.sink, "{:010} {:05} n\r\n", offset, generation)?
                    }
                    XrefWriteEntry::InStream { .. } => {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidInput,
                            "classic tables cannot describe object stream members",
                        ))
                    }
                }
            }
        }
        Ok(offset)
    }

    pub(crate) fn write_trailer(&mut self, trailer: &PdfDictionary) -> io::Result<()> {
        self.sink.write_all(b"trailer\n")?;
        let mut out = Vec::new();
        serialize_dictionary(&mut out, trailer);
        self.sink.write_all(&out)?;
        self.sink.write_all(b"\n")
    }

    /// Write a `/Type /XRef` stream as object `number` and return its
    /// offset. Fields are packed big-endian as `/W [1 4 2]`; the middle
    /// field widens to 8 bytes when an offset does not fit in 32 bits.
    pub(crate) fn write_xref_stream(
        &mut self,
        number: u32,
        entries: &[(u32, XrefWriteEntry)],
        extras: &PdfDictionary,
        size: u32,
        level: i32,
    ) -> io::Result<u64> {
        let mut field2_width = 4usize;
        for (_, entry) in entries {
            if let XrefWriteEntry::Offset { offset, .. } = entry {
                if *offset > u32::MAX as u64 {
                    field2_width = 8;
                }
            }
        }

        let mut rows = Vec::with_capacity(entries.len() * (3 + field2_width));
        let mut index = Vec::new();
        for (start, run) in contiguous_runs(entries) {
            index.push(PdfObject::from(start as i64));
            index.push(PdfObject::from(run.len() as i64));
            for (_, entry) in run {
                let (kind, field2, field3) = match *entry {
                    XrefWriteEntry::Free {
                        next_free,
                        generation,
                    } => (0u8, next_free as u64, generation as u64),
                    XrefWriteEntry::Offset { offset, generation } => {
                        (1, offset, generation as u64)
                    }
                    XrefWriteEntry::InStream { container, index } => {
                        (2, container as u64, index as u64)
                    }
                };
                if field3 > u16::MAX as u64 {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "cross-reference generation field exceeds two bytes",
                    ));
                }
                rows.push(kind);
                rows.extend_from_slice(&field2.to_be_bytes()[8 - field2_width..]);
                rows.extend_from_slice(&(field3 as u16).to_be_bytes());
            }
        }

        let mut dict = extras.clone();
        dict.put("Type", PdfName::new("XRef"));
        dict.put("Size", size as i64);
        dict.put(
            "W",
            PdfObject::Array(vec![
                PdfObject::from(1i64),
                PdfObject::from(field2_width as i64),
                PdfObject::from(2i64),
            ]),
        );
        dict.put("Index", PdfObject::Array(index));

        let stream = PdfStream::new(dict, rows);
        self.write_indirect(number, 0, &PdfObject::Stream(stream), level)
    }

    pub(crate) fn write_startxref(&mut self, offset: u64) -> io::Result<()> {
        write!(self.sink, "startxref\n{}\n%%EOF\n", offset)
    }
}

fn contiguous_runs(
    entries: &[(u32, XrefWriteEntry)],
) -> impl Iterator<Item = (u32, &[(u32, XrefWriteEntry)])> {
    let mut rest = entries;
    std::iter::from_fn(move || {
        let first = rest.first()?.0;
        let mut len = 1;
        while len < rest.len() && rest[len].0 == rest[len - 1].0 + 1 {
            len += 1;
        }
        let (run, tail) = rest.split_at(len);
        rest = tail;
        Some((first, run))
    })
}

/// Accumulates gen-0 non-stream objects into one `/Type /ObjStm` payload.
pub(crate) struct ObjectStreamBuilder {
    members: Vec<u32>,
    header: Vec<u8>,
    body: Vec<u8>,
}

impl ObjectStreamBuilder {
    pub(crate) fn new() -> ObjectStreamBuilder {
        ObjectStreamBuilder {
            members: Vec::new(),
            header: Vec::new(),
            body: Vec::new(),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub(crate) fn is_full(&self) -> bool {
        self.members.len() >= MAX_OBJSTM_MEMBERS
    }

    /// Member object numbers in stream order; the index of a number is its
    /// `/Index` field in the cross-reference entry.
    pub(crate) fn members(&self) -> &[u32] {
        &self.members
    }

    pub(crate) fn push(&mut self, number: u32, obj: &PdfObject) {
        let offset = self.body.len();
        serialize_object(&mut self.body, obj);
        self.body.push(b'\n');
        if !self.header.is_empty() {
            self.header.push(b' ');
        }
        self.header
            .extend_from_slice(format!("{} {}", number, offset).as_bytes());
        self.members.push(number);
    }

    /// Assemble the container stream. The caller owns the container's object
    /// number and cross-reference bookkeeping.
    pub(crate) fn build(mut self) -> PdfStream {
        self.header.push(b'\n');
        let first = self.header.len();
        let mut dict = PdfDictionary::new();
        dict.put("Type", PdfName::new("ObjStm"));
        dict.put("N", self.members.len() as i64);
        dict.put("First", first as i64);
        let mut payload = self.header;
        payload.extend_from_slice(&self.body);
        PdfStream::new(dict, payload)
    }
}

// ---- body serialization ----

pub(crate) fn serialize_object(out: &mut Vec<u8>, obj: &PdfObject) {
    match obj {
        PdfObject::Null => out.extend_from_slice(b"null"),
        PdfObject::Boolean(true) => out.extend_from_slice(b"true"),
        PdfObject::Boolean(false) => out.extend_from_slice(b"false"),
        PdfObject::Number(value) => serialize_number(out, *value),
        PdfObject::String(s) => {
            if s.is_hex() {
                out.push(b'<');
                for b in s.as_bytes() {
                    out.extend_from_slice(format!("{:02X}", b).as_bytes());
                }
                out.push(b'>');
            } else {
                out.push(b'(');
                for &b in s.as_bytes() {
                    match b {
                        b'\\' | b'(' | b')' => {
                            out.push(b'\\');
                            out.push(b);
                        }
                        b'\r' => out.extend_from_slice(b"\\r"),
                        _ => out.push(b),
                    }
                }
                out.push(b')');
            }
        }
        PdfObject::Name(name) => serialize_name(out, name),
        PdfObject::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b' ');
                }
                serialize_object(out, item);
            }
            out.push(b']');
        }
        PdfObject::Dictionary(dict) => serialize_dictionary(out, dict),
        PdfObject::Reference(r) => {
            out.extend_from_slice(format!("{} {} R", r.number(), r.generation()).as_bytes());
        }
        PdfObject::Stream(stream) => {
            // Streams are always promoted to their own indirect object
            // before serialization reaches them.
            debug_assert!(false, "stream nested in a direct object");
            serialize_dictionary(out, &stream.dict);
        }
    }
}

pub(crate) fn serialize_dictionary(out: &mut Vec<u8>, dict: &PdfDictionary) {
    out.extend_from_slice(b"<<");
    for (key, value) in dict.iter() {
        serialize_name(out, key);
        out.push(b' ');
        serialize_object(out, value);
    }
    out.extend_from_slice(b">>");
}

fn serialize_name(out: &mut Vec<u8>, name: &PdfName) {
    out.push(b'/');
    for &b in name.as_str().as_bytes() {
        if (b'!'..=b'~').contains(&b) && !is_delimiter(b) && b != b'#' {
            out.push(b);
        } else {
            out.extend_from_slice(format!("#{:02X}", b).as_bytes());
        }
    }
}

/// Integral values print without a fraction; reals keep six digits with
/// trailing zeroes trimmed.
fn serialize_number(out: &mut Vec<u8>, value: f64) {
    if !value.is_finite() {
        out.push(b'0');
        return;
    }
    if value.fract() == 0.0 && value.abs() < 9e15 {
        out.extend_from_slice(format!("{}", value as i64).as_bytes());
        return;
    }
    let mut text = format!("{:.6}", value);
    while text.ends_with('0') {
        text.pop();
    }
    if text.ends_with('.') {
        text.pop();
    }
    out.extend_from_slice(text.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{ObjRef, PdfString};
    use crate::parse::Tokenizer;

    fn serialized(obj: &PdfObject) -> String {
        let mut out = Vec::new();
        serialize_object(&mut out, obj);
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_serialize_scalars() {
        assert_eq!(serialized(&PdfObject::Null), "null");
        assert_eq!(serialized(&PdfObject::Boolean(true)), "true");
        assert_eq!(serialized(&PdfObject::from(42i64)), "42");
        assert_eq!(serialized(&PdfObject::from(-1.5f64)), "-1.5");
        assert_eq!(serialized(&PdfObject::from(0.000001f64)), "0.000001");
        assert_eq!(
            serialized(&PdfObject::Reference(ObjRef::new(12, 3))),
            "12 3 R"
        );
    }

    #[test]
    fn test_serialize_strings() {
        assert_eq!(
            serialized(&PdfObject::from(PdfString::literal(b"a(b)\\c".to_vec()))),
            "(a\\(b\\)\\\\c)"
        );
        assert_eq!(
            serialized(&PdfObject::from(PdfString::hex(vec![0xDE, 0xAD]))),
            "<DEAD>"
        );
    }

    #[test]
    fn test_serialize_name_escapes() {
        assert_eq!(serialized(&PdfObject::from(PdfName::new("Plain"))), "/Plain");
        assert_eq!(
            serialized(&PdfObject::from(PdfName::new("Has Space"))),
            "/Has#20Space"
        );
    }

    #[test]
    fn test_serialized_objects_parse_back() {
        let mut dict = PdfDictionary::new();
        dict.put("Type", PdfName::new("Page"));
        dict.put("Parent", ObjRef::new(2, 0));
        dict.put(
            "MediaBox",
            PdfObject::Array(vec![
                PdfObject::from(0i64),
                PdfObject::from(0i64),
                PdfObject::from(595i64),
                PdfObject::from(842i64),
            ]),
        );
        let obj = PdfObject::Dictionary(dict);

        let text = serialized(&obj);
        let parsed = Tokenizer::new(text.as_bytes()).parse_object().unwrap();
        assert_eq!(parsed, obj);
    }

    #[test]
    fn test_classic_records_are_twenty_bytes() {
        let entries = vec![
            (
                0,
                XrefWriteEntry::Free {
                    next_free: 0,
                    generation: 65535,
                },
            ),
            (
                1,
                XrefWriteEntry::Offset {
                    offset: 17,
                    generation: 0,
                },
            ),
        ];
        let mut writer = PdfWriter::new(Vec::new());
        writer.write_xref_table(&entries).unwrap();
        let out = writer.sink.into_inner();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text, "xref\n0 2\n0000000000 65535 f\r\n0000000017 00000 n\r\n");
        for record in text.lines().skip(2) {
            // Two trailing EOL bytes complete the record.
            assert_eq!(record.len() + 2, 20);
        }
    }

    #[test]
    fn test_xref_table_splits_subsections() {
        let entries = vec![
            (
                0,
                XrefWriteEntry::Free {
                    next_free: 0,
                    generation: 65535,
                },
            ),
            (
                7,
                XrefWriteEntry::Offset {
                    offset: 100,
                    generation: 0,
                },
            ),
            (
                8,
                XrefWriteEntry::Offset {
                    offset: 200,
                    generation: 0,
                },
            ),
        ];
        let mut writer = PdfWriter::new(Vec::new());
        writer.write_xref_table(&entries).unwrap();
        let text = String::from_utf8(writer.sink.into_inner()).unwrap();
        assert!(text.contains("\n0 1\n"));
        assert!(text.contains("\n7 2\n"));
    }

    #[test]
    fn test_object_stream_container_parses_back() {
        let mut builder = ObjectStreamBuilder::new();
        builder.push(4, &PdfObject::from(42i64));
        let mut dict = PdfDictionary::new();
        dict.put("Kind", PdfName::new("Test"));
        builder.push(9, &PdfObject::Dictionary(dict.clone()));
        assert_eq!(builder.members(), &[4, 9]);

        let stream = builder.build();
        assert_eq!(stream.dict.get_i64("N"), Some(2));
        let first = stream.dict.get_i64("First").unwrap() as usize;

        let data = stream.data();
        let mut header = Tokenizer::new(&data[..first]);
        let mut pairs = Vec::new();
        for _ in 0..2 {
            header.skip_whitespace();
            let number = header.parse_unsigned().unwrap();
            header.skip_whitespace();
            let offset = header.parse_unsigned().unwrap() as usize;
            pairs.push((number, offset));
        }
        assert_eq!(pairs[0].0, 4);
        assert_eq!(pairs[1].0, 9);

        let mut tok = Tokenizer::with_pos(data, first + pairs[1].1);
        assert_eq!(tok.parse_object().unwrap(), PdfObject::Dictionary(dict));
    }

    #[test]
    fn test_xref_stream_roundtrip_fields() {
        let entries = vec![
            (
                0,
                XrefWriteEntry::Free {
                    next_free: 0,
                    generation: 65535,
                },
            ),
            (
                1,
                XrefWriteEntry::Offset {
                    offset: 0x01020304,
                    generation: 2,
                },
            ),
            (
                2,
                XrefWriteEntry::InStream {
                    container: 5,
                    index: 1,
                },
            ),
        ];
        let mut writer = PdfWriter::new(Vec::new());
        writer
            .write_xref_stream(7, &entries, &PdfDictionary::new(), 8, 0)
            .unwrap();
        let out = writer.sink.into_inner();

        let (number, generation, obj) =
            Tokenizer::new(&out).parse_indirect_object().unwrap();
        assert_eq!((number, generation), (7, 0));
        let stream = obj.as_stream().unwrap();
        assert_eq!(stream.dict.get_name("Type").unwrap().as_str(), "XRef");
        assert_eq!(stream.dict.get_i64("Size"), Some(8));

        let data = stream.data();
        assert_eq!(data.len(), 3 * 7);
        assert_eq!(&data[..7], &[0, 0, 0, 0, 0, 0xFF, 0xFF]);
        assert_eq!(&data[7..14], &[1, 0x01, 0x02, 0x03, 0x04, 0, 2]);
        assert_eq!(&data[14..], &[2, 0, 0, 0, 5, 0, 1]);
    }

    #[test]
    fn test_xref_stream_widens_offset_field_past_4_gib() {
        let big = u32::MAX as u64 + 0x0102;
        let entries = vec![
            (
                0,
                XrefWriteEntry::Free {
                    next_free: 0,
                    generation: 65535,
                },
            ),
            (
                1,
                XrefWriteEntry::Offset {
                    offset: big,
                    generation: 0,
                },
            ),
        ];
        let mut writer = PdfWriter::new(Vec::new());
        writer
            .write_xref_stream(7, &entries, &PdfDictionary::new(), 8, 0)
            .unwrap();
        let out = writer.sink.into_inner();

        let (_, _, obj) = Tokenizer::new(&out).parse_indirect_object().unwrap();
        let stream = obj.as_stream().unwrap();
        let w = stream.dict.get_array("W").unwrap();
        assert_eq!(w[1].as_i64(), Some(8));

        let data = stream.data();
        assert_eq!(data.len(), 2 * 11);
        assert_eq!(&data[11..], &[1, 0, 0, 0, 1, 0, 0, 1, 1, 0, 0]);
    }

    #[test]
    fn test_write_indirect_compresses_non_raw_streams() {
        let mut dict = PdfDictionary::new();
        dict.put("Kind", PdfName::new("Test"));
        let payload = b"payload payload payload payload".repeat(8);
        let stream = PdfStream::new(dict, payload.clone());

        let mut writer = PdfWriter::new(Vec::new());
        writer
            .write_indirect(3, 0, &PdfObject::Stream(stream), 6)
            .unwrap();
        let out = writer.sink.into_inner();

        let (_, _, obj) = Tokenizer::new(&out).parse_indirect_object().unwrap();
        let written = obj.as_stream().unwrap();
        assert_eq!(
            written.dict.get_name("Filter").unwrap().as_str(),
            "FlateDecode"
        );
        assert_eq!(
            written.dict.get_i64("Length"),
            Some(written.data().len() as i64)
        );
        assert_eq!(&*written.decoded_data().unwrap(), &payload[..]);
    }
}
