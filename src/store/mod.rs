//! Piece metadata operations.
//!
//! The [`PieceStore`] trait names every read and write the sanitization
//! pipeline performs on the metadata graph. Keeping them behind one trait
//! lets the pipeline run against the real triplestore
//! ([`sparql::SparqlPieceStore`]) or an in-memory model
//! ([`memory::InMemoryPieceStore`]) with identical semantics.
//!
//! # Operations
//!
//! | Method | Purpose |
//! |--------|---------|
//! | [`is_main_piece`](PieceStore::is_main_piece) | Eligibility test |
//! | [`piece_file`](PieceStore::piece_file) | Resolve the effective bound file |
//! | [`stale_copies`](PieceStore::stale_copies) | Find copies left by earlier runs |
//! | [`remove_copy`](PieceStore::remove_copy) | Delete a copy and its file records, guarded on the resolved binding |
//! | [`insert_file_pair`](PieceStore::insert_file_pair) | Record a new virtual/physical file |
//! | [`relink`](PieceStore::relink) | Swap in the sanitized file and create the signed copy |

pub mod memory;
pub mod sparql;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::access::AccessLadder;
use crate::models::{FilePair, PieceFile, StaleCopy};

/// Everything needed to relink a piece to its sanitized file in one write.
#[derive(Debug, Clone)]
pub struct Relink<'a> {
    pub piece: &'a str,
    /// The file resolved before sanitization.
    pub original: &'a PieceFile,
    /// URI of the new sanitized virtual file.
    pub sanitized_file: &'a str,
    pub copy_uri: &'a str,
    pub copy_id: &'a str,
    pub now: DateTime<Utc>,
    pub title_suffix: &'a str,
    pub ladder: &'a AccessLadder,
}

#[async_trait]
pub trait PieceStore: Send + Sync {
    /// True iff `piece` is a piece bound to a file, belongs to a series,
    /// and was not itself generated as a signed copy.
    async fn is_main_piece(&self, piece: &str) -> Result<bool>;

    /// The piece's effective file: a file derived from the bound file when
    /// one exists, the bound file otherwise. `None` when nothing is bound.
    async fn piece_file(&self, piece: &str) -> Result<Option<PieceFile>>;

    /// Signed copies and flattened signed copies previously made for
    /// `piece`. A copy's file equal to `current_file` is never reported.
    async fn stale_copies(&self, piece: &str, current_file: &str) -> Result<Vec<StaleCopy>>;

    /// Remove a copy piece, every statement about or pointing at it, and
    /// the records of its file, provided `piece` still holds `resolved`.
    ///
    /// Returns `false` when the piece was rebound in the meantime and
    /// nothing was removed.
    async fn remove_copy(&self, piece: &str, resolved: &PieceFile, copy: &StaleCopy) -> Result<bool>;

    /// Insert both file records as one write.
    async fn insert_file_pair(&self, pair: &FilePair) -> Result<()>;

    /// Rebind the piece to the sanitized file and create its signed copy,
    /// conditional on the piece still matching `relink.original`.
    ///
    /// Returns `false` when the condition no longer held and nothing was
    /// written.
    async fn relink(&self, relink: &Relink<'_>) -> Result<bool>;
}
