//! Flate (zlib) stream compression and filter decoding.
//!
//! The writer compresses payloads with an explicit, resolved level so output
//! is identical across platforms. The reader undoes `/FlateDecode` filters,
//! including the PNG predictors that cross-reference streams commonly use.

use std::borrow::Cow;
use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;

use crate::object::PdfDictionary;

/// No Flate pass at all; payloads are written verbatim.
pub const NO_COMPRESSION: i32 = 0;
/// Resolved to [`DEFAULT_COMPRESSION_LEVEL`] before use.
pub const DEFAULT_COMPRESSION: i32 = -1;
pub const BEST_SPEED: i32 = 1;
pub const BEST_COMPRESSION: i32 = 9;

/// The concrete level `DEFAULT_COMPRESSION` resolves to (zlib's default).
pub const DEFAULT_COMPRESSION_LEVEL: u32 = 6;

#[derive(Debug, thiserror::Error)]
pub enum FilterError {
    #[error("unsupported stream filter `{0}`")]
    UnsupportedFilter(String),

    #[error("malformed filter entry in stream dictionary")]
    MalformedFilterEntry,

    #[error("failed to inflate stream payload")]
    Inflate(#[source] std::io::Error),

    #[error("unsupported predictor {0}")]
    UnsupportedPredictor(i64),

    #[error("predictor row data is truncated")]
    TruncatedPredictorRow,
}

/// Resolve a requested level in `[-1, 9]` to a concrete zlib level.
///
/// An "automatic" request (-1) must not vary output across platforms, so it
/// maps to a fixed default rather than whatever the backend feels like.
pub fn resolve_level(level: i32) -> u32 {
    match level {
        DEFAULT_COMPRESSION => DEFAULT_COMPRESSION_LEVEL,
        l if (0..=9).contains(&l) => l as u32,
        l => {
            tracing::warn!(level = l, "compression level out of range, clamping");
            if l < 0 {
                DEFAULT_COMPRESSION_LEVEL
            } else {
                9
            }
        }
    }
}

/// Deflate `data` as a zlib stream at an already-resolved level (1..=9).
pub fn flate_encode(data: &[u8], level: u32) -> Vec<u8> {
    let mut encoder = ZlibEncoder::new(
        Vec::with_capacity(data.len() / 2 + 16),
        flate2::Compression::new(level),
    );
    // Writing to a Vec cannot fail.
    let _ = encoder.write_all(data);
    encoder.finish().unwrap_or_default()
}

/// Inflate a zlib stream.
pub fn flate_decode(data: &[u8]) -> Result<Vec<u8>, FilterError> {
    let mut out = Vec::with_capacity(data.len() * 4);
    ZlibDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(FilterError::Inflate)?;
    Ok(out)
}

/// Apply a stream dictionary's filter chain in reverse to the raw payload.
///
/// Only `/FlateDecode` is supported here; image and text codecs live outside
/// this crate and consume raw payloads through the registry instead.
pub fn decode_stream<'a>(
    dict: &PdfDictionary,
    data: &'a [u8],
) -> Result<Cow<'a, [u8]>, FilterError> {
    let filters = match dict.get("Filter") {
        None => return Ok(Cow::Borrowed(data)),
        Some(f) => filter_names(f)?,
    };
    let parms = dict.get("DecodeParms").or_else(|| dict.get("DP"));

    let mut out = Cow::Borrowed(data);
    for (i, filter) in filters.iter().enumerate() {
        match filter.as_str() {
            "FlateDecode" | "Fl" => {
                let inflated = flate_decode(&out)?;
                let parm = filter_parm(parms, i, filters.len());
                out = Cow::Owned(match parm {
                    Some(p) => apply_predictor(p, inflated)?,
                    None => inflated,
                });
            }
            other => return Err(FilterError::UnsupportedFilter(other.to_string())),
        }
    }
    Ok(out)
}

fn filter_names(entry: &crate::object::PdfObject) -> Result<Vec<String>, FilterError> {
    use crate::object::PdfObject;
    match entry {
        PdfObject::Name(n) => Ok(vec![n.as_str().to_string()]),
        PdfObject::Array(items) => items
            .iter()
            .map(|item| match item {
                PdfObject::Name(n) => Ok(n.as_str().to_string()),
                _ => Err(FilterError::MalformedFilterEntry),
            })
            .collect(),
        _ => Err(FilterError::MalformedFilterEntry),
    }
}

fn filter_parm<'a>(
    parms: Option<&'a crate::object::PdfObject>,
    index: usize,
    filter_count: usize,
) -> Option<&'a PdfDictionary> {
    use crate::object::PdfObject;
    match parms {
        Some(PdfObject::Dictionary(d)) if filter_count == 1 => Some(d),
        Some(PdfObject::Array(items)) => items.get(index).and_then(PdfObject::as_dictionary),
        _ => None,
    }
}

/// Undo a PNG row predictor (predictors 10..=15) or pass data through for
/// predictor 1. TIFF predictor 2 is not supported.
fn apply_predictor(parms: &PdfDictionary, data: Vec<u8>) -> Result<Vec<u8>, FilterError> {
    let predictor = parms.get_i64("Predictor").unwrap_or(1);
    if predictor <= 1 {
        return Ok(data);
    }
    if !(10..=15).contains(&predictor) {
        return Err(FilterError::UnsupportedPredictor(predictor));
    }

    let colors = parms.get_i64("Colors").unwrap_or(1).max(1) as usize;
    let bpc = parms.get_i64("BitsPerComponent").unwrap_or(8).max(1) as usize;
    let columns = parms.get_i64("Columns").unwrap_or(1).max(1) as usize;

    let bytes_per_pixel = (colors * bpc).div_ceil(8);
    let row_len = (colors * bpc * columns).div_ceil(8);

    let mut out = Vec::with_capacity(data.len());
    let mut prev_row = vec![0u8; row_len];
    let mut pos = 0;

    while pos < data.len() {
        if pos + 1 + row_len > data.len() {
            return Err(FilterError::TruncatedPredictorRow);
        }
        let tag = data[pos];
        let mut row = data[pos + 1..pos + 1 + row_len].to_vec();
        pos += 1 + row_len;

        for i in 0..row_len {
            let left = if i >= bytes_per_pixel {
                row[i - bytes_per_pixel]
            } else {
                0
            };
            let up = prev_row[i];
            let up_left = if i >= bytes_per_pixel {
                prev_row[i - bytes_per_pixel]
            } else {
                0
            };
            row[i] = match tag {
                0 => row[i],
                1 => row[i].wrapping_add(left),
                2 => row[i].wrapping_add(up),
                3 => row[i].wrapping_add(((left as u16 + up as u16) / 2) as u8),
                4 => row[i].wrapping_add(paeth(left, up, up_left)),
                t => return Err(FilterError::UnsupportedPredictor(t as i64)),
            };
        }

        out.extend_from_slice(&row);
        prev_row.copy_from_slice(&row);
    }

    Ok(out)
}

fn paeth(a: u8, b: u8, c: u8) -> u8 {
    let p = a as i16 + b as i16 - c as i16;
    let pa = (p - a as i16).abs();
    let pb = (p - b as i16).abs();
    let pc = (p - c as i16).abs();
    if pa <= pb && pa <= pc {
        a
    } else if pb <= pc {
        b
    } else {
        c
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::PdfName;

    #[test]
    fn test_level_resolution_is_concrete() {
        assert_eq!(resolve_level(DEFAULT_COMPRESSION), 6);
        assert_eq!(resolve_level(0), 0);
        assert_eq!(resolve_level(9), 9);
        assert_eq!(resolve_level(resolve_level(-1) as i32), 6);
    }

    #[test]
    fn test_flate_roundtrip() {
        let data = b"compressible compressible compressible data".repeat(20);
        let packed = flate_encode(&data, 6);
        assert!(packed.len() < data.len());
        assert_eq!(flate_decode(&packed).unwrap(), data);
    }

    #[test]
    fn test_decode_stream_without_filter_borrows() {
        let dict = PdfDictionary::new();
        let data = b"as-is".to_vec();
        let decoded = decode_stream(&dict, &data).unwrap();
        assert!(matches!(decoded, Cow::Borrowed(_)));
    }

    #[test]
    fn test_decode_stream_flate() {
        let mut dict = PdfDictionary::new();
        dict.put("Filter", PdfName::new("FlateDecode"));
        let packed = flate_encode(b"hello streams", 6);
        let decoded = decode_stream(&dict, &packed).unwrap();
        assert_eq!(&*decoded, b"hello streams");
    }

    #[test]
    fn test_unknown_filter_is_an_error() {
        let mut dict = PdfDictionary::new();
        dict.put("Filter", PdfName::new("DCTDecode"));
        assert!(matches!(
            decode_stream(&dict, b"\xff\xd8"),
            Err(FilterError::UnsupportedFilter(_))
        ));
    }

    #[test]
    fn test_png_up_predictor() {
        // Two rows of 4 columns, predictor tag 2 (Up) on each row.
        let mut dict = PdfDictionary::new();
        dict.put("Predictor", 12i64);
        dict.put("Columns", 4i64);
        let raw = vec![
            2, 1, 2, 3, 4, // row 0: up against zeroes
            2, 1, 1, 1, 1, // row 1: up against row 0
        ];
        let out = apply_predictor(&dict, raw).unwrap();
        assert_eq!(out, vec![1, 2, 3, 4, 2, 3, 4, 5]);
    }
}
