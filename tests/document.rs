use std::cell::RefCell;
use std::io::{self, Write};
use std::rc::Rc;

use folio::crypto::CredentialError;
use folio::{
    Decryptor, DecryptorProvider, DocumentError, DocumentOptions, ObjRef, OpenError,
    PdfDictionary, PdfDocument, PdfObject, PdfStream, PdfString, Source,
};

/// A growable sink tests can inspect after the document releases it.
#[derive(Clone, Default)]
struct SharedSink(Rc<RefCell<Vec<u8>>>);

impl Write for SharedSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl SharedSink {
    fn take(&self) -> Vec<u8> {
        self.0.borrow_mut().split_off(0)
    }
}

/// New document with one page, returning the serialized bytes.
fn one_page_document(options: DocumentOptions) -> Vec<u8> {
    let sink = SharedSink::default();
    let mut doc = PdfDocument::create(sink.clone(), options).unwrap();
    doc.add_new_page().unwrap();
    doc.close().unwrap();
    sink.take()
}

/// Add an unused indirect array-in-dictionary pair, as a stamping fixture.
fn add_unused_objects(doc: &mut PdfDocument, with_stream: bool) {
    let mut array = vec![PdfObject::from(42i64)];
    if with_stream {
        array.push(PdfObject::Stream(PdfStream::new(
            PdfDictionary::new(),
            vec![1, 2, 34, 45],
        )));
    }
    let array_ref = doc.create_object(PdfObject::Array(array)).unwrap();
    let mut dict = PdfDictionary::new();
    dict.put("testName", array_ref);
    doc.create_object(dict).unwrap();
}

#[test]
fn page_structure_survives_a_roundtrip() {
    let bytes = one_page_document(DocumentOptions::new());

    let mut doc = PdfDocument::open(Source::from_bytes(bytes), DocumentOptions::new()).unwrap();
    assert_eq!(doc.xref_size(), 6);
    assert!(!doc.is_recovered());

    let pages_ref = doc.catalog().unwrap().get_ref("Pages").unwrap();
    let pages = doc.resolve(pages_ref).unwrap().as_dictionary().unwrap();
    assert_eq!(pages.get_i64("Count"), Some(1));
    let kids = pages.get_array("Kids").unwrap();
    let page_ref = kids[0].as_reference().unwrap();

    let page = doc.resolve(page_ref).unwrap().as_dictionary().unwrap();
    assert_eq!(page.get_name("Type").unwrap().as_str(), "Page");
    assert_eq!(page.get_ref("Parent"), Some(pages_ref));
    let contents_ref = page.get_ref("Contents").unwrap();
    let contents = doc.resolve(contents_ref).unwrap().as_stream().unwrap();
    assert!(contents.decoded_data().unwrap().is_empty());
}

#[test]
fn unused_objects_are_dropped_on_close() {
    let sink = SharedSink::default();
    let mut doc = PdfDocument::create(sink.clone(), DocumentOptions::new()).unwrap();
    doc.add_new_page().unwrap();
    add_unused_objects(&mut doc, false);
    assert_eq!(doc.xref_size(), 8);
    doc.close().unwrap();

    let mut reopened =
        PdfDocument::open(Source::from_bytes(sink.take()), DocumentOptions::new()).unwrap();
    assert_eq!(reopened.xref_size(), 6);
    assert!(reopened.catalog().is_ok());
}

#[test]
fn flush_unused_objects_keeps_them() {
    let sink = SharedSink::default();
    let mut doc = PdfDocument::create(
        sink.clone(),
        DocumentOptions::new().with_flush_unused_objects(true),
    )
    .unwrap();
    doc.add_new_page().unwrap();
    add_unused_objects(&mut doc, false);
    assert_eq!(doc.xref_size(), 8);
    doc.close().unwrap();

    let reopened =
        PdfDocument::open(Source::from_bytes(sink.take()), DocumentOptions::new()).unwrap();
    assert_eq!(reopened.xref_size(), 8);
}

#[test]
fn nested_direct_stream_is_promoted_to_its_own_object() {
    let sink = SharedSink::default();
    let mut doc = PdfDocument::create(
        sink.clone(),
        DocumentOptions::new().with_flush_unused_objects(true),
    )
    .unwrap();
    doc.add_new_page().unwrap();
    add_unused_objects(&mut doc, true);
    doc.close().unwrap();

    let mut reopened =
        PdfDocument::open(Source::from_bytes(sink.take()), DocumentOptions::new()).unwrap();
    // Six baseline entries, the array, the dictionary and the promoted stream.
    assert_eq!(reopened.xref_size(), 9);
    let promoted = ObjRef::new(8, 0);
    let stream = reopened.resolve(promoted).unwrap().as_stream().unwrap();
    assert_eq!(&*stream.decoded_data().unwrap(), &[1, 2, 34, 45]);
}

#[test]
fn stamping_rewrite_drops_unused_objects() {
    let sink = SharedSink::default();
    let mut doc = PdfDocument::create(
        sink.clone(),
        DocumentOptions::new().with_flush_unused_objects(true),
    )
    .unwrap();
    doc.add_new_page().unwrap();
    add_unused_objects(&mut doc, false);
    doc.close().unwrap();
    let original = sink.take();

    let out = SharedSink::default();
    let mut stamper = PdfDocument::stamp(
        Source::from_bytes(original),
        out.clone(),
        DocumentOptions::new(),
    )
    .unwrap();
    assert_eq!(stamper.xref_size(), 8);
    stamper.close().unwrap();

    let reopened =
        PdfDocument::open(Source::from_bytes(out.take()), DocumentOptions::new()).unwrap();
    assert_eq!(reopened.xref_size(), 6);
}

#[test]
fn freed_number_is_reused_with_a_bumped_generation() {
    let mut doc = PdfDocument::create(Vec::new(), DocumentOptions::new()).unwrap();
    let a = doc.create_object(PdfObject::from(42i64)).unwrap();
    doc.set_free(a).unwrap();

    let b = doc.create_object(PdfObject::from(43i64)).unwrap();
    assert_eq!(b.number(), a.number());
    assert_eq!(b.generation(), a.generation() + 1);

    // The stale reference dangles; the new one resolves.
    assert!(doc.resolve(a).unwrap().is_null());
    assert_eq!(doc.resolve(b).unwrap().as_i64(), Some(43));
    doc.close().unwrap();
}

#[test]
fn append_mode_preserves_the_original_bytes() {
    let original = one_page_document(DocumentOptions::new());

    let out = SharedSink::default();
    let mut doc = PdfDocument::stamp(
        Source::from_bytes(original.clone()),
        out.clone(),
        DocumentOptions::new().with_append_mode(true),
    )
    .unwrap();

    // Replace the page's contents stream, freeing the old one.
    let pages_ref = doc.catalog().unwrap().get_ref("Pages").unwrap();
    let page_ref = doc
        .resolve(pages_ref)
        .unwrap()
        .as_dictionary()
        .unwrap()
        .get_array("Kids")
        .unwrap()[0]
        .as_reference()
        .unwrap();
    let old_contents = doc
        .resolve(page_ref)
        .unwrap()
        .as_dictionary()
        .unwrap()
        .get_ref("Contents")
        .unwrap();
    doc.set_free(old_contents).unwrap();
    let replacement = doc
        .create_object(PdfStream::new(PdfDictionary::new(), b"0 0 m".to_vec()))
        .unwrap();
    assert_eq!(replacement.number(), old_contents.number());
    assert_eq!(replacement.generation(), old_contents.generation() + 1);
    doc.resolve_mut(page_ref)
        .unwrap()
        .as_dictionary_mut()
        .unwrap()
        .put("Contents", replacement);
    doc.close().unwrap();

    let appended = out.take();
    assert_eq!(&appended[..original.len()], &original[..]);
    assert!(appended.len() > original.len());

    let mut reopened =
        PdfDocument::open(Source::from_bytes(appended), DocumentOptions::new()).unwrap();
    // The stale reference dangles; the replacement resolves.
    assert!(reopened.resolve(old_contents).unwrap().is_null());
    let stream = reopened.resolve(replacement).unwrap().as_stream().unwrap();
    assert_eq!(&*stream.decoded_data().unwrap(), b"0 0 m");
}

#[test]
fn append_mode_without_changes_still_reopens() {
    let original = one_page_document(DocumentOptions::new());

    let out = SharedSink::default();
    let mut doc = PdfDocument::stamp(
        Source::from_bytes(original),
        out.clone(),
        DocumentOptions::new().with_append_mode(true),
    )
    .unwrap();
    doc.close().unwrap();

    let mut reopened =
        PdfDocument::open(Source::from_bytes(out.take()), DocumentOptions::new()).unwrap();
    assert_eq!(reopened.xref_size(), 6);
    assert!(reopened.catalog().is_ok());
}

#[test]
fn circular_references_roundtrip() {
    let sink = SharedSink::default();
    let mut doc = PdfDocument::create(sink.clone(), DocumentOptions::new()).unwrap();
    doc.add_new_page().unwrap();

    let a = doc.create_object(PdfDictionary::new()).unwrap();
    let b = doc.create_object(PdfDictionary::new()).unwrap();
    doc.resolve_mut(a)
        .unwrap()
        .as_dictionary_mut()
        .unwrap()
        .put("Other", b);
    doc.resolve_mut(b)
        .unwrap()
        .as_dictionary_mut()
        .unwrap()
        .put("Other", a);
    let root = doc.catalog_ref().unwrap();
    doc.resolve_mut(root)
        .unwrap()
        .as_dictionary_mut()
        .unwrap()
        .put("Loop", a);
    doc.close().unwrap();

    let mut reopened =
        PdfDocument::open(Source::from_bytes(sink.take()), DocumentOptions::new()).unwrap();
    let loop_ref = reopened.catalog().unwrap().get_ref("Loop").unwrap();
    let first = reopened
        .resolve(loop_ref)
        .unwrap()
        .as_dictionary()
        .unwrap()
        .get_ref("Other")
        .unwrap();
    let second = reopened
        .resolve(first)
        .unwrap()
        .as_dictionary()
        .unwrap()
        .get_ref("Other")
        .unwrap();
    assert_eq!(second, loop_ref);
}

#[test]
fn full_compression_packs_objects_into_streams() {
    let bytes = one_page_document(DocumentOptions::new().with_full_compression(true));
    let text = String::from_utf8_lossy(&bytes);
    assert!(text.contains("/ObjStm"));
    assert!(text.contains("/XRef"));
    assert!(!text.contains("trailer"));

    let mut doc = PdfDocument::open(Source::from_bytes(bytes), DocumentOptions::new()).unwrap();
    // Six baseline entries plus the container and the xref stream.
    assert_eq!(doc.xref_size(), 8);
    let pages_ref = doc.catalog().unwrap().get_ref("Pages").unwrap();
    let pages = doc.resolve(pages_ref).unwrap().as_dictionary().unwrap();
    assert_eq!(pages.get_i64("Count"), Some(1));
}

#[test]
fn append_mode_with_full_compression() {
    let original = one_page_document(DocumentOptions::new().with_full_compression(true));

    let out = SharedSink::default();
    let mut doc = PdfDocument::stamp(
        Source::from_bytes(original.clone()),
        out.clone(),
        DocumentOptions::new()
            .with_append_mode(true)
            .with_full_compression(true),
    )
    .unwrap();
    let info_ref = doc.trailer().get_ref("Info").unwrap();
    doc.resolve_mut(info_ref)
        .unwrap()
        .as_dictionary_mut()
        .unwrap()
        .put("Subject", PdfString::literal(b"appended".to_vec()));
    doc.close().unwrap();

    let appended = out.take();
    assert_eq!(&appended[..original.len()], &original[..]);

    let mut reopened =
        PdfDocument::open(Source::from_bytes(appended), DocumentOptions::new()).unwrap();
    let info = reopened.resolve(info_ref).unwrap().as_dictionary().unwrap();
    assert_eq!(
        info.get("Subject").unwrap().as_string().unwrap().as_bytes(),
        b"appended"
    );
}

#[test]
fn a_stray_reference_past_the_table_does_not_abort_close() {
    let sink = SharedSink::default();
    let mut doc = PdfDocument::create(sink.clone(), DocumentOptions::new()).unwrap();
    doc.add_new_page().unwrap();
    let root = doc.catalog_ref().unwrap();
    doc.resolve_mut(root)
        .unwrap()
        .as_dictionary_mut()
        .unwrap()
        .put("Stray", ObjRef::new(999, 0));
    doc.close().unwrap();

    let mut reopened =
        PdfDocument::open(Source::from_bytes(sink.take()), DocumentOptions::new()).unwrap();
    assert_eq!(reopened.xref_size(), 6);
    // The undefined reference is carried through untouched.
    let stray = reopened.catalog().unwrap().get_ref("Stray").unwrap();
    assert_eq!(stray, ObjRef::new(999, 0));
}

#[test]
fn broken_startxref_is_recovered_by_scanning() {
    let mut bytes = one_page_document(DocumentOptions::new());
    let at = bytes
        .windows(9)
        .rposition(|w| w == b"startxref")
        .unwrap();
    // Overwrite the pointer digits in place.
    for b in bytes[at + 10..].iter_mut() {
        if b.is_ascii_digit() {
            *b = b'9';
        }
    }

    let mut doc = PdfDocument::open(Source::from_bytes(bytes), DocumentOptions::new()).unwrap();
    assert!(doc.is_recovered());
    let pages_ref = doc.catalog().unwrap().get_ref("Pages").unwrap();
    let pages = doc.resolve(pages_ref).unwrap().as_dictionary().unwrap();
    assert_eq!(pages.get_i64("Count"), Some(1));
}

#[test]
fn recovered_documents_refuse_append_mode() {
    let mut bytes = one_page_document(DocumentOptions::new());
    let at = bytes
        .windows(9)
        .rposition(|w| w == b"startxref")
        .unwrap();
    for b in bytes[at + 10..].iter_mut() {
        if b.is_ascii_digit() {
            *b = b'9';
        }
    }

    let result = PdfDocument::stamp(
        Source::from_bytes(bytes),
        Vec::new(),
        DocumentOptions::new().with_append_mode(true),
    );
    assert!(matches!(result, Err(DocumentError::AppendUnsupported)));
}

#[test]
fn memory_mapped_source_roundtrips() {
    let bytes = one_page_document(DocumentOptions::new());
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("one_page.pdf");
    std::fs::write(&path, &bytes).unwrap();

    let mut doc =
        PdfDocument::open(Source::open(&path).unwrap(), DocumentOptions::new()).unwrap();
    assert_eq!(doc.xref_size(), 6);
    assert!(doc.catalog().is_ok());
}

// ---- encryption ----

struct XorDecryptor(u8);

impl Decryptor for XorDecryptor {
    fn decrypt(&self, _r: ObjRef, data: &[u8]) -> Vec<u8> {
        data.iter().map(|b| b ^ self.0).collect()
    }
}

struct PasswordProvider {
    expected: Vec<u8>,
}

impl DecryptorProvider for PasswordProvider {
    fn open(
        &self,
        _encrypt: &PdfDictionary,
        password: Option<&[u8]>,
    ) -> Result<Box<dyn Decryptor>, CredentialError> {
        if password == Some(self.expected.as_slice()) {
            Ok(Box::new(XorDecryptor(0x5A)))
        } else {
            Err(CredentialError)
        }
    }
}

/// Handcrafted classic file whose strings are XORed with 0x5A.
fn encrypted_fixture() -> Vec<u8> {
    let secret: Vec<u8> = b"secret".iter().map(|b| b ^ 0x5A).collect();
    let hex: String = secret.iter().map(|b| format!("{:02X}", b)).collect();

    let mut buf = b"%PDF-1.7\n".to_vec();
    let mut offsets = Vec::new();
    let bodies = [
        format!("<< /Type /Catalog /S <{}> >>", hex),
        "<< /Filter /Standard /V 1 /O (ownerkey) >>".to_string(),
    ];
    for (i, body) in bodies.iter().enumerate() {
        offsets.push(buf.len());
        buf.extend_from_slice(format!("{} 0 obj\n{}\nendobj\n", i + 1, body).as_bytes());
    }
    let xref_offset = buf.len();
    buf.extend_from_slice(b"xref\n0 3\n0000000000 65535 f \n");
    for offset in offsets {
        buf.extend_from_slice(format!("{:010} 00000 n \n", offset).as_bytes());
    }
    buf.extend_from_slice(b"trailer\n<< /Size 3 /Root 1 0 R /Encrypt 2 0 R >>\n");
    buf.extend_from_slice(format!("startxref\n{}\n%%EOF\n", xref_offset).as_bytes());
    buf
}

#[test]
fn encrypted_document_requires_a_credential() {
    let result = PdfDocument::open(
        Source::from_bytes(encrypted_fixture()),
        DocumentOptions::new(),
    );
    assert!(matches!(
        result,
        Err(DocumentError::Open(OpenError::Authentication))
    ));

    let wrong = PdfDocument::open(
        Source::from_bytes(encrypted_fixture()),
        DocumentOptions::new()
            .with_password(b"wrong".to_vec())
            .with_decryptor_provider(Box::new(PasswordProvider {
                expected: b"owner".to_vec(),
            })),
    );
    assert!(matches!(
        wrong,
        Err(DocumentError::Open(OpenError::Authentication))
    ));
}

#[test]
fn encrypted_document_decrypts_with_the_right_credential() {
    let mut doc = PdfDocument::open(
        Source::from_bytes(encrypted_fixture()),
        DocumentOptions::new()
            .with_password(b"owner".to_vec())
            .with_decryptor_provider(Box::new(PasswordProvider {
                expected: b"owner".to_vec(),
            })),
    )
    .unwrap();

    let catalog = doc.catalog().unwrap();
    assert_eq!(
        catalog.get("S").unwrap().as_string().unwrap().as_bytes(),
        b"secret"
    );
    // The encryption dictionary itself stays readable.
    let encrypt_ref = doc.trailer().get_ref("Encrypt").unwrap();
    let encrypt = doc.resolve(encrypt_ref).unwrap().as_dictionary().unwrap();
    assert_eq!(encrypt.get_name("Filter").unwrap().as_str(), "Standard");
}

#[test]
fn encryption_dictionary_is_never_decrypted() {
    let mut doc = PdfDocument::open(
        Source::from_bytes(encrypted_fixture()),
        DocumentOptions::new()
            .with_password(b"owner".to_vec())
            .with_decryptor_provider(Box::new(PasswordProvider {
                expected: b"owner".to_vec(),
            })),
    )
    .unwrap();

    // Stored plaintext; running it through the handler would corrupt it.
    let encrypt_ref = doc.trailer().get_ref("Encrypt").unwrap();
    let encrypt = doc.resolve(encrypt_ref).unwrap().as_dictionary().unwrap();
    assert_eq!(
        encrypt.get("O").unwrap().as_string().unwrap().as_bytes(),
        b"ownerkey"
    );
}

#[test]
fn early_flush_makes_an_object_immutable() {
    let sink = SharedSink::default();
    let mut doc = PdfDocument::create(sink.clone(), DocumentOptions::new()).unwrap();
    doc.add_new_page().unwrap();
    let marker = doc.create_object(PdfObject::from(7i64)).unwrap();
    let root = doc.catalog_ref().unwrap();
    doc.resolve_mut(root)
        .unwrap()
        .as_dictionary_mut()
        .unwrap()
        .put("Marker", marker);
    doc.flush_object(marker).unwrap();
    assert!(doc.resolve_mut(marker).is_err());
    // Reading the flushed object still works.
    assert_eq!(doc.resolve(marker).unwrap().as_i64(), Some(7));
    doc.close().unwrap();

    let mut reopened =
        PdfDocument::open(Source::from_bytes(sink.take()), DocumentOptions::new()).unwrap();
    let marker_ref = reopened.catalog().unwrap().get_ref("Marker").unwrap();
    assert_eq!(reopened.resolve(marker_ref).unwrap().as_i64(), Some(7));
}
