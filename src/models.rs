//! Core data models.
//!
//! Delta notifications as delivered by the mu-delta-notifier, and the file
//! and piece records the sanitization pipeline reads and writes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const RDF_TYPE: &str = "http://www.w3.org/1999/02/22-rdf-syntax-ns#type";
pub const DOSSIER_STUK: &str = "https://data.vlaanderen.be/ns/dossier#Stuk";

pub const PDF_FORMAT: &str = "application/pdf";
pub const PDF_EXTENSION: &str = "pdf";

/// One RDF term of a delta triple.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct DeltaTerm {
    #[serde(rename = "type", default)]
    pub kind: String,
    pub value: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct Triple {
    pub subject: DeltaTerm,
    pub predicate: DeltaTerm,
    pub object: DeltaTerm,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub graph: Option<DeltaTerm>,
}

impl Triple {
    /// Whether this statement types its subject as a piece.
    pub fn declares_piece(&self) -> bool {
        self.predicate.value == RDF_TYPE && self.object.value == DOSSIER_STUK
    }
}

/// One change record: the statements inserted and deleted together.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct Changeset {
    #[serde(default)]
    pub inserts: Vec<Triple>,
    #[serde(default)]
    pub deletes: Vec<Triple>,
}

/// The file currently bound to a piece, as resolved for sanitization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PieceFile {
    /// Virtual file URI.
    pub uri: String,
    pub id: String,
    pub name: String,
    pub format: String,
    pub size: u64,
    pub extension: String,
    /// `share://` location of the bytes.
    pub physical_uri: String,
    pub access_level: Option<String>,
    /// Set when `uri` is a derivation of the piece's bound file rather
    /// than the bound file itself; holds the bound file's URI.
    pub primary_source: Option<String>,
}

impl PieceFile {
    pub fn is_derived(&self) -> bool {
        self.primary_source.is_some()
    }

    /// The file the piece's `prov:value` points at.
    pub fn bound_file(&self) -> &str {
        self.primary_source.as_deref().unwrap_or(&self.uri)
    }

    /// Extension says PDF and, when a format is declared, so does the format.
    pub fn is_pdf(&self) -> bool {
        let extension = self.extension.trim_start_matches('.');
        let format_ok = self.format.trim().is_empty()
            || self.format.to_ascii_lowercase().contains(PDF_EXTENSION);
        extension.eq_ignore_ascii_case(PDF_EXTENSION) && format_ok
    }
}

/// Metadata record of a newly created artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub uri: String,
    pub id: String,
    pub name: String,
    pub format: String,
    pub size: u64,
    pub extension: String,
    pub created: DateTime<Utc>,
}

/// A virtual file and the physical file holding its bytes. Always created
/// together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePair {
    pub virtual_file: FileRecord,
    pub physical_file: FileRecord,
}

/// A previously generated copy of a piece that is cleaned up before a new
/// one is written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaleCopy {
    pub piece: String,
    pub file: Option<String>,
    pub physical_uri: Option<String>,
    pub kind: StaleCopyKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StaleCopyKind {
    /// A signed copy made by an earlier run of this service.
    SignedCopy,
    /// A flattened signed copy made by the signing flow.
    FlattenedCopy,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(extension: &str, format: &str) -> PieceFile {
        PieceFile {
            uri: "http://x/file".into(),
            id: "1".into(),
            name: "a.pdf".into(),
            format: format.into(),
            size: 1,
            extension: extension.into(),
            physical_uri: "share://a.pdf".into(),
            access_level: None,
            primary_source: None,
        }
    }

    #[test]
    fn pdf_detection() {
        assert!(file("pdf", "application/pdf").is_pdf());
        assert!(file("PDF", "application/pdf; charset=binary").is_pdf());
        assert!(file(".pdf", "").is_pdf());
        assert!(!file("docx", "application/pdf").is_pdf());
        assert!(!file(
            "pdf",
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
        )
        .is_pdf());
    }

    #[test]
    fn bound_file_follows_the_primary_source() {
        let direct = file("pdf", "application/pdf");
        assert_eq!(direct.bound_file(), "http://x/file");

        let derived = PieceFile {
            primary_source: Some("http://x/source".into()),
            ..direct
        };
        assert_eq!(derived.bound_file(), "http://x/source");
    }

    #[test]
    fn parses_delta_body() {
        let body = r#"[
          { "inserts": [
              { "subject": { "type": "uri", "value": "http://x/piece/1" },
                "predicate": { "type": "uri", "value": "http://www.w3.org/1999/02/22-rdf-syntax-ns#type" },
                "object": { "type": "uri", "value": "https://data.vlaanderen.be/ns/dossier#Stuk" } }
            ],
            "deletes": [] },
          { "deletes": [] }
        ]"#;
        let changesets: Vec<Changeset> = serde_json::from_str(body).unwrap();
        assert_eq!(changesets.len(), 2);
        assert!(changesets[0].inserts[0].declares_piece());
        assert!(changesets[1].inserts.is_empty());
    }
}
