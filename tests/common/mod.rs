//! Shared fixtures for integration tests.
#![allow(dead_code)]

use chrono::Utc;
use lopdf::{dictionary, Document, Object};
use std::sync::Arc;
use std::time::Duration;

use pdf_signature_remover::blob::InMemoryBlobStore;
use pdf_signature_remover::config::{
    AccessLevelsConfig, ACCESS_LEVEL_CABINET, ACCESS_LEVEL_GOVERNMENT, ACCESS_LEVEL_PUBLIC,
};
use pdf_signature_remover::models::FileRecord;
use pdf_signature_remover::pipeline::{RemoverSettings, RetryPolicy, SignatureRemover};
use pdf_signature_remover::signatures::PdfSignatureStripper;
use pdf_signature_remover::store::memory::{FileEntry, InMemoryPieceStore, PieceRecord};

pub const FILE_BASE: &str = "http://themis.vlaanderen.be/id/bestand/";
pub const PIECE_BASE: &str = "http://themis.vlaanderen.be/id/stuk/";
pub const SUFFIX: &str = " (met certificaat)";

/// A one-page PDF whose form holds a text field plus one signature field
/// per entry of `signatures`.
pub fn pdf(signatures: &[&str]) -> Vec<u8> {
    let mut doc = Document::with_version("1.7");
    let pages_id = doc.new_object_id();
    let page_id = doc.new_object_id();
    let rect = || {
        Object::Array(
            [0, 0, 200, 40]
                .into_iter()
                .map(Object::Integer)
                .collect(),
        )
    };

    let mut fields = vec![doc.add_object(dictionary! {
        "Type" => "Annot",
        "Subtype" => "Widget",
        "FT" => "Tx",
        "T" => Object::string_literal("title"),
        "Rect" => rect(),
        "P" => page_id,
    })];
    for name in signatures {
        fields.push(doc.add_object(dictionary! {
            "Type" => "Annot",
            "Subtype" => "Widget",
            "FT" => "Sig",
            "T" => Object::string_literal(*name),
            "Rect" => rect(),
            "P" => page_id,
        }));
    }
    let refs: Vec<Object> = fields.into_iter().map(Object::Reference).collect();

    doc.objects.insert(
        page_id,
        Object::Dictionary(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Annots" => refs.clone(),
        }),
    );
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => vec![Object::Reference(page_id)],
            "Count" => Object::Integer(1),
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
        "AcroForm" => dictionary! {
            "Fields" => refs,
            "SigFlags" => Object::Integer(3),
        },
    });
    doc.trailer.set("Root", catalog_id);

    let mut out = Vec::new();
    doc.save_to(&mut out).unwrap();
    out
}

pub fn signed_pdf() -> Vec<u8> {
    pdf(&["minister", "secretary"])
}

pub fn unsigned_pdf() -> Vec<u8> {
    pdf(&[])
}

pub fn settings(retries: u32) -> RemoverSettings {
    RemoverSettings {
        retry: RetryPolicy {
            retries,
            delay: Duration::from_millis(5000),
        },
        file_resource_base: FILE_BASE.to_string(),
        piece_resource_base: PIECE_BASE.to_string(),
        title_suffix: SUFFIX.to_string(),
        ladder: AccessLevelsConfig::default().ladder(),
    }
}

pub fn levels() -> [&'static str; 3] {
    [ACCESS_LEVEL_PUBLIC, ACCESS_LEVEL_GOVERNMENT, ACCESS_LEVEL_CABINET]
}

/// In-memory graph, blob store, and a remover over both.
pub struct Fixture {
    pub pieces: Arc<InMemoryPieceStore>,
    pub blobs: Arc<InMemoryBlobStore>,
    pub remover: SignatureRemover,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_retries(1)
    }

    pub fn with_retries(retries: u32) -> Self {
        let pieces = Arc::new(InMemoryPieceStore::new());
        let blobs = Arc::new(InMemoryBlobStore::new());
        let remover = SignatureRemover::new(
            pieces.clone(),
            blobs.clone(),
            Arc::new(PdfSignatureStripper),
            settings(retries),
        );
        Self {
            pieces,
            blobs,
            remover,
        }
    }

    /// Record a file and its bytes under `share://<id>.<extension>`.
    pub fn add_file(&self, id: &str, name: &str, format: &str, extension: &str, bytes: Vec<u8>) -> String {
        let uri = format!("{}{}", FILE_BASE, id);
        let physical_uri = format!("share://{}.{}", id, extension);
        let record = |uri: String, id: String, name: String| FileRecord {
            uri,
            id,
            name,
            format: format.to_string(),
            size: bytes.len() as u64,
            extension: extension.to_string(),
            created: Utc::now(),
        };
        self.pieces.add_file(FileEntry {
            virtual_file: record(uri.clone(), id.to_string(), name.to_string()),
            physical_file: Some(record(
                physical_uri.clone(),
                format!("{}-physical", id),
                format!("{}.{}", id, extension),
            )),
            primary_source: None,
        });
        self.blobs.insert(&physical_uri, bytes);
        uri
    }

    pub fn add_pdf(&self, id: &str, bytes: Vec<u8>) -> String {
        self.add_file(id, &format!("{}.pdf", id), "application/pdf", "pdf", bytes)
    }

    /// A piece in a series bound to `file`.
    pub fn add_piece(&self, id: &str, title: &str, file: &str, level: Option<&str>) -> String {
        let uri = format!("{}{}", PIECE_BASE, id);
        self.pieces.add_piece(
            &uri,
            PieceRecord {
                id: id.to_string(),
                title: title.to_string(),
                file: Some(file.to_string()),
                access_level: level.map(str::to_string),
                in_series: true,
                ..Default::default()
            },
        );
        uri
    }
}
