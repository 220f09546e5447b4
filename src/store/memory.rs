//! In-memory [`PieceStore`] for tests and offline runs.
//!
//! Models just enough of the graph to answer the pipeline's questions with
//! the same semantics as the SPARQL queries.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

use super::{PieceStore, Relink};
use crate::models::{FilePair, FileRecord, PieceFile, StaleCopy, StaleCopyKind};

/// A piece as the pipeline sees it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PieceRecord {
    pub id: String,
    pub title: String,
    /// Bound file (`prov:value`).
    pub file: Option<String>,
    pub access_level: Option<String>,
    /// Member of a series.
    pub in_series: bool,
    /// Set on signed copies: the piece the copy was split off.
    pub unsigned_piece: Option<String>,
    /// Flattened signed copy made by the signing flow.
    pub flattened_copy: Option<String>,
    pub created: Option<DateTime<Utc>>,
}

/// A virtual file, its physical file, and what it was derived from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub virtual_file: FileRecord,
    pub physical_file: Option<FileRecord>,
    pub primary_source: Option<String>,
}

#[derive(Default)]
struct Graph {
    pieces: BTreeMap<String, PieceRecord>,
    files: BTreeMap<String, FileEntry>,
}

#[derive(Default)]
pub struct InMemoryPieceStore {
    graph: RwLock<Graph>,
    writes: AtomicUsize,
    main_piece_checks: AtomicUsize,
}

impl InMemoryPieceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_piece(&self, uri: &str, piece: PieceRecord) {
        self.graph
            .write()
            .unwrap()
            .pieces
            .insert(uri.to_string(), piece);
    }

    pub fn add_file(&self, entry: FileEntry) {
        self.graph
            .write()
            .unwrap()
            .files
            .insert(entry.virtual_file.uri.clone(), entry);
    }

    pub fn update_piece(&self, uri: &str, f: impl FnOnce(&mut PieceRecord)) {
        if let Some(piece) = self.graph.write().unwrap().pieces.get_mut(uri) {
            f(piece);
        }
    }

    pub fn piece(&self, uri: &str) -> Option<PieceRecord> {
        self.graph.read().unwrap().pieces.get(uri).cloned()
    }

    pub fn file(&self, uri: &str) -> Option<FileEntry> {
        self.graph.read().unwrap().files.get(uri).cloned()
    }

    /// Signed copies currently split off `piece`, as `(uri, record)`.
    pub fn signed_copies_of(&self, piece: &str) -> Vec<(String, PieceRecord)> {
        self.graph
            .read()
            .unwrap()
            .pieces
            .iter()
            .filter(|(_, p)| p.unsigned_piece.as_deref() == Some(piece))
            .map(|(uri, p)| (uri.clone(), p.clone()))
            .collect()
    }

    pub fn file_count(&self) -> usize {
        self.graph.read().unwrap().files.len()
    }

    /// Number of applied graph writes.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn main_piece_checks(&self) -> usize {
        self.main_piece_checks.load(Ordering::SeqCst)
    }

    fn wrote(&self) {
        self.writes.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl PieceStore for InMemoryPieceStore {
    async fn is_main_piece(&self, piece: &str) -> Result<bool> {
        self.main_piece_checks.fetch_add(1, Ordering::SeqCst);
        let graph = self.graph.read().unwrap();
        let Some(record) = graph.pieces.get(piece) else {
            return Ok(false);
        };
        let is_flattened_copy = graph
            .pieces
            .values()
            .any(|p| p.flattened_copy.as_deref() == Some(piece));
        Ok(record.file.is_some()
            && record.in_series
            && record.unsigned_piece.is_none()
            && !is_flattened_copy)
    }

    async fn piece_file(&self, piece: &str) -> Result<Option<PieceFile>> {
        let graph = self.graph.read().unwrap();
        let Some(record) = graph.pieces.get(piece) else {
            return Ok(None);
        };
        let Some(source) = record.file.as_deref() else {
            return Ok(None);
        };
        let derived = graph
            .files
            .values()
            .find(|f| f.primary_source.as_deref() == Some(source));
        let Some(entry) = derived.or_else(|| graph.files.get(source)) else {
            return Ok(None);
        };
        let Some(physical) = &entry.physical_file else {
            return Ok(None);
        };
        let file = &entry.virtual_file;
        Ok(Some(PieceFile {
            uri: file.uri.clone(),
            id: file.id.clone(),
            name: file.name.clone(),
            format: file.format.clone(),
            size: file.size,
            extension: file.extension.clone(),
            physical_uri: physical.uri.clone(),
            access_level: record.access_level.clone(),
            primary_source: (file.uri != source).then(|| source.to_string()),
        }))
    }

    async fn stale_copies(&self, piece: &str, current_file: &str) -> Result<Vec<StaleCopy>> {
        let graph = self.graph.read().unwrap();
        let describe = |uri: &str, kind: StaleCopyKind| {
            let file = graph
                .pieces
                .get(uri)
                .and_then(|p| p.file.clone())
                .filter(|f| f != current_file);
            let physical_uri = file
                .as_deref()
                .and_then(|f| graph.files.get(f))
                .and_then(|e| e.physical_file.as_ref())
                .map(|p| p.uri.clone());
            StaleCopy {
                piece: uri.to_string(),
                file,
                physical_uri,
                kind,
            }
        };

        let mut copies: Vec<StaleCopy> = graph
            .pieces
            .iter()
            .filter(|(_, p)| p.unsigned_piece.as_deref() == Some(piece))
            .map(|(uri, _)| describe(uri, StaleCopyKind::SignedCopy))
            .collect();
        if let Some(flat) = graph.pieces.get(piece).and_then(|p| p.flattened_copy.as_deref()) {
            copies.push(describe(flat, StaleCopyKind::FlattenedCopy));
        }
        Ok(copies)
    }

    async fn remove_copy(&self, piece: &str, resolved: &PieceFile, copy: &StaleCopy) -> Result<bool> {
        let mut graph = self.graph.write().unwrap();
        let source = resolved.bound_file();
        let still_bound = graph
            .pieces
            .get(piece)
            .is_some_and(|p| p.file.as_deref() == Some(source));
        let still_derived = !resolved.is_derived()
            || graph
                .files
                .get(&resolved.uri)
                .is_some_and(|f| f.primary_source.as_deref() == Some(source));
        if !still_bound || !still_derived {
            return Ok(false);
        }

        graph.pieces.remove(&copy.piece);
        for other in graph.pieces.values_mut() {
            if other.flattened_copy.as_deref() == Some(copy.piece.as_str()) {
                other.flattened_copy = None;
            }
            if other.unsigned_piece.as_deref() == Some(copy.piece.as_str()) {
                other.unsigned_piece = None;
            }
        }
        if let Some(file) = &copy.file {
            graph.files.remove(file);
        }
        drop(graph);
        self.wrote();
        Ok(true)
    }

    async fn insert_file_pair(&self, pair: &FilePair) -> Result<()> {
        self.add_file(FileEntry {
            virtual_file: pair.virtual_file.clone(),
            physical_file: Some(pair.physical_file.clone()),
            primary_source: None,
        });
        self.wrote();
        Ok(())
    }

    async fn relink(&self, relink: &Relink<'_>) -> Result<bool> {
        let mut graph = self.graph.write().unwrap();
        let Some(piece) = graph.pieces.get(relink.piece) else {
            return Ok(false);
        };
        let Some(level) = piece.access_level.clone() else {
            return Ok(false);
        };
        let title = piece.title.clone();

        match &relink.original.primary_source {
            None => {
                if piece.file.as_deref() != Some(relink.original.uri.as_str()) {
                    return Ok(false);
                }
                if let Some(p) = graph.pieces.get_mut(relink.piece) {
                    p.file = Some(relink.sanitized_file.to_string());
                }
            }
            Some(source) => {
                let derived_matches = graph
                    .files
                    .get(&relink.original.uri)
                    .is_some_and(|f| f.primary_source.as_deref() == Some(source.as_str()));
                if piece.file.as_deref() != Some(source.as_str()) || !derived_matches {
                    return Ok(false);
                }
                if let Some(f) = graph.files.get_mut(&relink.original.uri) {
                    f.primary_source = None;
                }
                if let Some(f) = graph.files.get_mut(relink.sanitized_file) {
                    f.primary_source = Some(source.clone());
                }
            }
        }

        graph.pieces.insert(
            relink.copy_uri.to_string(),
            PieceRecord {
                id: relink.copy_id.to_string(),
                title: format!("{}{}", title, relink.title_suffix),
                file: Some(relink.original.uri.clone()),
                access_level: Some(relink.ladder.promote(&level).to_string()),
                in_series: false,
                unsigned_piece: Some(relink.piece.to_string()),
                flattened_copy: None,
                created: Some(relink.now),
            },
        );
        drop(graph);
        self.wrote();
        Ok(true)
    }
}
