//! Herein lies the object machinery of the PDF file format.
//!
//! Use [PdfDocument][PdfDocument] with [Source][Source] to read or stamp
//! existing files, and [PdfDocument::create][PdfDocument::create] to write
//! new ones. Objects live in a lazy cross-reference registry and are only
//! parsed from the source when a reference is resolved.

pub mod compression;
mod counting;
pub mod crypto;
pub mod document;
pub mod object;
pub mod parse;
pub mod reader;
mod writer;
pub mod xref;

pub use compression::{
    FilterError, BEST_COMPRESSION, BEST_SPEED, DEFAULT_COMPRESSION, NO_COMPRESSION,
};
pub use crypto::{CredentialError, Decryptor, DecryptorProvider, IdentityDecryptor};
pub use document::{DocumentError, DocumentOptions, Mode, PdfDocument, PdfVersion};
pub use object::{ObjRef, PdfDictionary, PdfName, PdfObject, PdfStream, PdfString};
pub use parse::ParseError;
pub use reader::{LoadError, OpenError, Source};
pub use xref::{ResolveError, XrefTable, MAX_GENERATION};
