//! Sans-IO parsing primitives for PDF syntax.
//!
//! The tokenizer works on plain byte slices without any I/O traits, so the
//! reader, the object-stream loader and the recovery scan can all share it,
//! and it can be tested without a registry or a file.

use crate::object::{ObjRef, PdfDictionary, PdfName, PdfObject, PdfStream, PdfString};

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("unexpected end of input at offset {0}")]
    UnexpectedEof(usize),

    #[error("unexpected byte {byte:#04x} at offset {offset}")]
    UnexpectedByte { byte: u8, offset: usize },

    #[error("expected keyword `{expected}` at offset {offset}")]
    ExpectedKeyword {
        expected: &'static str,
        offset: usize,
    },

    #[error("invalid number at offset {0}")]
    InvalidNumber(usize),

    #[error("invalid cross-reference table at offset {0}")]
    InvalidXrefTable(usize),
}

#[inline(always)]
pub(crate) fn is_whitespace(b: u8) -> bool {
    matches!(b, b'\0' | b'\t' | b'\n' | b'\x0c' | b'\r' | b' ')
}

#[inline(always)]
pub(crate) fn is_delimiter(b: u8) -> bool {
    matches!(
        b,
        b'(' | b')' | b'<' | b'>' | b'[' | b']' | b'{' | b'}' | b'/' | b'%'
    )
}

#[inline(always)]
pub(crate) fn is_regular(b: u8) -> bool {
    !is_whitespace(b) && !is_delimiter(b)
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// One entry of a classic plaintext cross-reference table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawXrefEntry {
    Free { next_free: u32, generation: u16 },
    Used { offset: u64, generation: u16 },
}

/// A parsed classic cross-reference section plus its trailer dictionary.
#[derive(Debug)]
pub struct XrefTableSection {
    pub entries: Vec<(u32, RawXrefEntry)>,
    pub trailer: PdfDictionary,
}

/// Cursor-based tokenizer over a byte slice.
pub struct Tokenizer<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Tokenizer<'a> {
    pub fn new(buf: &'a [u8]) -> Tokenizer<'a> {
        Tokenizer { buf, pos: 0 }
    }

    pub fn with_pos(buf: &'a [u8], pos: usize) -> Tokenizer<'a> {
        Tokenizer { buf, pos }
    }

    #[inline(always)]
    pub fn pos(&self) -> usize {
        self.pos
    }

    #[inline(always)]
    fn peek(&self) -> Option<u8> {
        self.buf.get(self.pos).copied()
    }

    /// Skip whitespace and `%` comments (which run to end of line).
    pub fn skip_whitespace(&mut self) {
        while let Some(b) = self.peek() {
            if is_whitespace(b) {
                self.pos += 1;
            } else if b == b'%' {
                while let Some(b) = self.peek() {
                    if b == b'\n' || b == b'\r' {
                        break;
                    }
                    self.pos += 1;
                }
            } else {
                break;
            }
        }
    }

    fn read_keyword(&mut self) -> &'a [u8] {
        let start = self.pos;
        while let Some(b) = self.peek() {
            if is_regular(b) {
                self.pos += 1;
            } else {
                break;
            }
        }
        &self.buf[start..self.pos]
    }

    fn expect_keyword(&mut self, expected: &'static str) -> Result<(), ParseError> {
        self.skip_whitespace();
        let offset = self.pos;
        if self.read_keyword() == expected.as_bytes() {
            Ok(())
        } else {
            Err(ParseError::ExpectedKeyword { expected, offset })
        }
    }

    fn expect_byte(&mut self, expected: u8) -> Result<(), ParseError> {
        match self.peek() {
            Some(b) if b == expected => {
                self.pos += 1;
                Ok(())
            }
            Some(byte) => Err(ParseError::UnexpectedByte {
                byte,
                offset: self.pos,
            }),
            None => Err(ParseError::UnexpectedEof(self.pos)),
        }
    }

    pub(crate) fn parse_unsigned(&mut self) -> Result<u64, ParseError> {
        let start = self.pos;
        let mut value: u64 = 0;
        while let Some(b @ b'0'..=b'9') = self.peek() {
            value = value
                .checked_mul(10)
                .and_then(|v| v.checked_add((b - b'0') as u64))
                .ok_or(ParseError::InvalidNumber(start))?;
            self.pos += 1;
        }
        if self.pos == start {
            return Err(ParseError::InvalidNumber(start));
        }
        Ok(value)
    }

    /// Parse any direct object, resolving `n g R` reference triples.
    pub fn parse_object(&mut self) -> Result<PdfObject, ParseError> {
        self.skip_whitespace();
        match self.peek() {
            None => Err(ParseError::UnexpectedEof(self.pos)),
            Some(b'/') => Ok(PdfObject::Name(self.parse_name()?)),
            Some(b'(') => Ok(PdfObject::String(self.parse_literal_string()?)),
            Some(b'<') => {
                if self.buf.get(self.pos + 1) == Some(&b'<') {
                    Ok(PdfObject::Dictionary(self.parse_dictionary()?))
                } else {
                    Ok(PdfObject::String(self.parse_hex_string()?))
                }
            }
            Some(b'[') => self.parse_array(),
            Some(b'0'..=b'9') | Some(b'+') | Some(b'-') | Some(b'.') => {
                self.parse_number_or_reference()
            }
            Some(_) => {
                let offset = self.pos;
                match self.read_keyword() {
                    b"true" => Ok(PdfObject::Boolean(true)),
                    b"false" => Ok(PdfObject::Boolean(false)),
                    b"null" => Ok(PdfObject::Null),
                    kw => Err(ParseError::UnexpectedByte {
                        byte: kw.first().copied().unwrap_or(0),
                        offset,
                    }),
                }
            }
        }
    }

    pub fn parse_name(&mut self) -> Result<PdfName, ParseError> {
        self.expect_byte(b'/')?;
        let mut out = Vec::new();
        while let Some(b) = self.peek() {
            if !is_regular(b) {
                break;
            }
            self.pos += 1;
            if b == b'#' {
                let hi = self.peek().and_then(hex_value);
                let lo = self.buf.get(self.pos + 1).copied().and_then(hex_value);
                if let (Some(hi), Some(lo)) = (hi, lo) {
                    out.push(hi << 4 | lo);
                    self.pos += 2;
                } else {
                    // Lenient: a bare `#` is taken literally.
                    out.push(b'#');
                }
            } else {
                out.push(b);
            }
        }
        // Non-UTF-8 name bytes degrade to U+FFFD; see [`PdfName`].
        Ok(PdfName::new(String::from_utf8_lossy(&out).into_owned()))
    }

    fn parse_literal_string(&mut self) -> Result<PdfString, ParseError> {
        self.expect_byte(b'(')?;
        let mut out = Vec::new();
        let mut depth = 1usize;
        loop {
            let b = self.peek().ok_or(ParseError::UnexpectedEof(self.pos))?;
            self.pos += 1;
            match b {
                b'\\' => {
                    let esc = self.peek().ok_or(ParseError::UnexpectedEof(self.pos))?;
                    self.pos += 1;
                    match esc {
                        b'n' => out.push(b'\n'),
                        b'r' => out.push(b'\r'),
                        b't' => out.push(b'\t'),
                        b'b' => out.push(8),
                        b'f' => out.push(12),
                        b'(' | b')' | b'\\' => out.push(esc),
                        b'0'..=b'7' => {
                            let mut value = (esc - b'0') as u16;
                            for _ in 0..2 {
                                match self.peek() {
                                    Some(d @ b'0'..=b'7') => {
                                        value = value * 8 + (d - b'0') as u16;
                                        self.pos += 1;
                                    }
                                    _ => break,
                                }
                            }
                            out.push(value as u8);
                        }
                        b'\r' => {
                            // Line continuation; swallow an optional LF.
                            if self.peek() == Some(b'\n') {
                                self.pos += 1;
                            }
                        }
                        b'\n' => {}
                        other => out.push(other),
                    }
                }
                b'(' => {
                    depth += 1;
                    out.push(b);
                }
                b')' => {
                    depth -= 1;
                    if depth == 0 {
                        break;
                    }
                    out.push(b);
                }
                b'\r' => {
                    // Any end-of-line inside a string reads as a single LF.
                    out.push(b'\n');
                    if self.peek() == Some(b'\n') {
                        self.pos += 1;
                    }
                }
                other => out.push(other),
            }
        }
        Ok(PdfString::literal(out))
    }

    fn parse_hex_string(&mut self) -> Result<PdfString, ParseError> {
        self.expect_byte(b'<')?;
        let mut out = Vec::new();
        let mut nibble: Option<u8> = None;
        loop {
            let b = self.peek().ok_or(ParseError::UnexpectedEof(self.pos))?;
            self.pos += 1;
            if b == b'>' {
                break;
            }
            if is_whitespace(b) {
                continue;
            }
            let value = hex_value(b).ok_or(ParseError::UnexpectedByte {
                byte: b,
                offset: self.pos - 1,
            })?;
            match nibble.take() {
                Some(hi) => out.push(hi << 4 | value),
                None => nibble = Some(value),
            }
        }
        if let Some(hi) = nibble {
            // An odd digit count implies a trailing zero.
            out.push(hi << 4);
        }
        Ok(PdfString::hex(out))
    }

    pub fn parse_dictionary(&mut self) -> Result<PdfDictionary, ParseError> {
        self.expect_byte(b'<')?;
        self.expect_byte(b'<')?;
        let mut dict = PdfDictionary::new();
        loop {
            self.skip_whitespace();
            match self.peek() {
                Some(b'>') => {
                    self.expect_byte(b'>')?;
                    self.expect_byte(b'>')?;
                    return Ok(dict);
                }
                Some(b'/') => {
                    let key = self.parse_name()?;
                    let value = self.parse_object()?;
                    dict.put(key, value);
                }
                Some(byte) => {
                    return Err(ParseError::UnexpectedByte {
                        byte,
                        offset: self.pos,
                    })
                }
                None => return Err(ParseError::UnexpectedEof(self.pos)),
            }
        }
    }

    fn parse_array(&mut self) -> Result<PdfObject, ParseError> {
        self.expect_byte(b'[')?;
        let mut items = Vec::new();
        loop {
            self.skip_whitespace();
            match self.peek() {
                Some(b']') => {
                    self.pos += 1;
                    return Ok(PdfObject::Array(items));
                }
                Some(_) => items.push(self.parse_object()?),
                None => return Err(ParseError::UnexpectedEof(self.pos)),
            }
        }
    }

    fn parse_number_or_reference(&mut self) -> Result<PdfObject, ParseError> {
        let (value, integral) = self.parse_number_value()?;

        if integral && value >= 0.0 && value <= u32::MAX as f64 {
            // A non-negative integer may begin an `n g R` reference triple.
            let save = self.pos;
            if let Some(generation) = self.try_parse_reference_tail() {
                return Ok(PdfObject::Reference(ObjRef::new(
                    value as u32,
                    generation,
                )));
            }
            self.pos = save;
        }

        Ok(PdfObject::Number(value))
    }

    fn try_parse_reference_tail(&mut self) -> Option<u16> {
        self.skip_whitespace();
        if !matches!(self.peek(), Some(b'0'..=b'9')) {
            return None;
        }
        let generation = self.parse_unsigned().ok()?;
        if generation > u16::MAX as u64 {
            return None;
        }
        self.skip_whitespace();
        let offset = self.pos;
        if self.read_keyword() == b"R" {
            Some(generation as u16)
        } else {
            self.pos = offset;
            None
        }
    }

    fn parse_number_value(&mut self) -> Result<(f64, bool), ParseError> {
        let start = self.pos;
        if matches!(self.peek(), Some(b'+') | Some(b'-')) {
            self.pos += 1;
        }
        let mut digits = 0usize;
        let mut integral = true;
        while let Some(b) = self.peek() {
            match b {
                b'0'..=b'9' => {
                    digits += 1;
                    self.pos += 1;
                }
                b'.' if integral => {
                    integral = false;
                    self.pos += 1;
                }
                _ => break,
            }
        }
        if digits == 0 {
            return Err(ParseError::InvalidNumber(start));
        }
        let text = std::str::from_utf8(&self.buf[start..self.pos])
            .map_err(|_| ParseError::InvalidNumber(start))?;
        let value = normalize_number(text).ok_or(ParseError::InvalidNumber(start))?;
        Ok((value, integral))
    }

    /// Parse an `n g obj … endobj` block, including an attached stream body.
    pub fn parse_indirect_object(&mut self) -> Result<(u32, u16, PdfObject), ParseError> {
        self.skip_whitespace();
        let header_offset = self.pos;
        let number = self.parse_unsigned()?;
        if number == 0 || number > u32::MAX as u64 {
            return Err(ParseError::InvalidNumber(header_offset));
        }
        self.skip_whitespace();
        let generation = self.parse_unsigned()?;
        if generation > u16::MAX as u64 {
            return Err(ParseError::InvalidNumber(header_offset));
        }
        self.expect_keyword("obj")?;

        let mut obj = self.parse_object()?;

        let save = self.pos;
        self.skip_whitespace();
        let kw_offset = self.pos;
        match self.read_keyword() {
            b"stream" => {
                let dict = match obj {
                    PdfObject::Dictionary(dict) => dict,
                    _ => {
                        return Err(ParseError::ExpectedKeyword {
                            expected: "endobj",
                            offset: kw_offset,
                        })
                    }
                };
                let data = self.parse_stream_payload(&dict)?;
                self.expect_keyword("endstream")?;
                obj = PdfObject::Stream(PdfStream::from_raw(dict, data));
                self.expect_keyword("endobj")?;
            }
            b"endobj" => {}
            _ => {
                self.pos = save;
                self.expect_keyword("endobj")?;
            }
        }

        Ok((number as u32, generation as u16, obj))
    }

    /// Read the raw payload following a `stream` keyword. A direct `/Length`
    /// is trusted when it lands on an `endstream`; anything else (indirect,
    /// missing, or lying) falls back to scanning for the keyword.
    fn parse_stream_payload(&mut self, dict: &PdfDictionary) -> Result<Vec<u8>, ParseError> {
        // `stream` is followed by CRLF or LF, never a bare CR.
        if self.peek() == Some(b'\r') {
            self.pos += 1;
        }
        if self.peek() == Some(b'\n') {
            self.pos += 1;
        }
        let data_start = self.pos;

        if let Some(len) = dict.get_i64("Length") {
            if len >= 0 {
                let end = data_start + len as usize;
                if end <= self.buf.len() {
                    let mut probe = Tokenizer::with_pos(self.buf, end);
                    probe.skip_whitespace();
                    if probe.buf[probe.pos..].starts_with(b"endstream") {
                        self.pos = end;
                        return Ok(self.buf[data_start..end].to_vec());
                    }
                }
                tracing::warn!(
                    offset = data_start,
                    length = len,
                    "stream /Length does not land on endstream, rescanning"
                );
            }
        }

        let rel = find_bytes(&self.buf[data_start..], b"endstream")
            .ok_or(ParseError::UnexpectedEof(data_start))?;
        let mut end = data_start + rel;
        // Trim at most one end-of-line that belongs to the keyword.
        if end > data_start && self.buf[end - 1] == b'\n' {
            end -= 1;
        }
        if end > data_start && self.buf[end - 1] == b'\r' {
            end -= 1;
        }
        self.pos = data_start + rel;
        Ok(self.buf[data_start..end].to_vec())
    }

    /// Parse a classic `xref` table and the trailer dictionary behind it.
    pub fn parse_xref_table(&mut self) -> Result<XrefTableSection, ParseError> {
        self.expect_keyword("xref")?;
        let mut entries = Vec::new();
        loop {
            self.skip_whitespace();
            match self.peek() {
                Some(b'0'..=b'9') => {
                    let start = self.parse_unsigned()?;
                    self.skip_whitespace();
                    let count = self.parse_unsigned()?;
                    if start + count > u32::MAX as u64 {
                        return Err(ParseError::InvalidXrefTable(self.pos));
                    }
                    for i in 0..count {
                        self.skip_whitespace();
                        let field1 = self.parse_unsigned()?;
                        self.skip_whitespace();
                        let field2 = self.parse_unsigned()?;
                        self.skip_whitespace();
                        let flag = self.peek().ok_or(ParseError::UnexpectedEof(self.pos))?;
                        self.pos += 1;
                        let generation = field2.min(u16::MAX as u64) as u16;
                        let entry = match flag {
                            b'n' => RawXrefEntry::Used {
                                offset: field1,
                                generation,
                            },
                            b'f' => RawXrefEntry::Free {
                                next_free: field1.min(u32::MAX as u64) as u32,
                                generation,
                            },
                            byte => {
                                return Err(ParseError::UnexpectedByte {
                                    byte,
                                    offset: self.pos - 1,
                                })
                            }
                        };
                        entries.push(((start + i) as u32, entry));
                    }
                }
                _ => break,
            }
        }
        self.expect_keyword("trailer")?;
        self.skip_whitespace();
        let trailer = self.parse_dictionary()?;
        Ok(XrefTableSection { entries, trailer })
    }
}

/// Shortest stable decimal rendering used when parsing; also validates.
fn normalize_number(text: &str) -> Option<f64> {
    let cleaned = text.strip_prefix('+').unwrap_or(text);
    if cleaned == "." || cleaned == "-." || cleaned.is_empty() || cleaned == "-" {
        return None;
    }
    cleaned.parse::<f64>().ok().or_else(|| {
        // A trailing dot ("17.") is valid PDF but not valid Rust float syntax.
        cleaned.strip_suffix('.').and_then(|s| s.parse::<f64>().ok())
    })
}

/// Byte-level substring search.
pub(crate) fn find_bytes(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Last occurrence of `needle` in `haystack`.
pub(crate) fn rfind_bytes(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    (0..=haystack.len() - needle.len()).rev().find(|&i| &haystack[i..i + needle.len()] == needle)
}
