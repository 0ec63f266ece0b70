//! Decryption hook point.
//!
//! The engine never implements cryptography itself. When an opened document
//! carries an `/Encrypt` dictionary, a caller-supplied [`DecryptorProvider`]
//! is asked for a [`Decryptor`], and every string and stream payload loaded
//! from the file is passed through it, keyed by the owning object's
//! reference. Members of object streams are exempt: their container payload
//! was already decrypted as a whole.

use crate::object::{ObjRef, PdfDictionary, PdfObject};

/// The supplied credential was rejected for this document.
#[derive(Debug, thiserror::Error)]
#[error("credential rejected for this document")]
pub struct CredentialError;

/// Transforms encrypted payload bytes back into plaintext.
pub trait Decryptor {
    /// Decrypt `data` belonging to the object identified by `r`.
    fn decrypt(&self, r: ObjRef, data: &[u8]) -> Vec<u8>;
}

/// Builds a [`Decryptor`] from a document's encryption dictionary and an
/// optional password. Returning an error aborts the read.
pub trait DecryptorProvider {
    fn open(
        &self,
        encrypt: &PdfDictionary,
        password: Option<&[u8]>,
    ) -> Result<Box<dyn Decryptor>, CredentialError>;
}

/// Pass-through decryptor, useful for tests and for formats where the
/// security handler leaves payloads untouched.
pub struct IdentityDecryptor;

impl Decryptor for IdentityDecryptor {
    fn decrypt(&self, _r: ObjRef, data: &[u8]) -> Vec<u8> {
        data.to_vec()
    }
}

/// Recursively pass the strings and stream payload of a freshly loaded
/// file-level object through the decryptor.
pub(crate) fn decrypt_in_place(obj: &mut PdfObject, r: ObjRef, decryptor: &dyn Decryptor) {
    match obj {
        PdfObject::String(s) => {
            let plain = decryptor.decrypt(r, s.as_bytes());
            s.set_bytes(plain);
        }
        PdfObject::Array(items) => {
            for item in items {
                decrypt_in_place(item, r, decryptor);
            }
        }
        PdfObject::Dictionary(dict) => {
            decrypt_dict(dict, r, decryptor);
        }
        PdfObject::Stream(stream) => {
            decrypt_dict(&mut stream.dict, r, decryptor);
            let plain = decryptor.decrypt(r, stream.data());
            stream.replace_raw_data(plain);
        }
        _ => {}
    }
}

fn decrypt_dict(dict: &mut PdfDictionary, r: ObjRef, decryptor: &dyn Decryptor) {
    let keys: Vec<_> = dict.iter().map(|(k, _)| k.as_str().to_string()).collect();
    for key in keys {
        if let Some(value) = dict.get_mut(&key) {
            decrypt_in_place(value, r, decryptor);
        }
    }
}
