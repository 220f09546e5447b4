//! The sanitization pipeline.
//!
//! For one piece: wait (bounded) for it to qualify as a main piece, resolve
//! its effective file, strip signature fields from the bytes, clean up the
//! copies earlier runs left behind, store the sanitized artifact, and relink
//! the graph so the piece serves the sanitized file while a new signed copy
//! keeps the original at an escalated confidentiality level.
//!
//! ```text
//! eligibility ─► resolve ─► read ─► strip ─► cleanup ─► write ─► relink
//!      │            │                  │         │
//!      └─ skipped ──┴──── skipped ─────┴─────────┘
//! ```

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::access::AccessLadder;
use crate::blob::{BlobLocation, BlobStore, FsBlobStore};
use crate::config::Config;
use crate::coordinator::BatchHandler;
use crate::delta::candidate_pieces;
use crate::graph::{Scope, SparqlClient};
use crate::models::{Changeset, FilePair, FileRecord, PieceFile, PDF_EXTENSION, PDF_FORMAT};
use crate::signatures::{PdfSignatureStripper, SignatureStripper, StripError, Stripped};
use crate::store::sparql::SparqlPieceStore;
use crate::store::{PieceStore, Relink};

/// A fixed number of extra attempts separated by a fixed delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Extra attempts after the first one.
    pub retries: u32,
    /// Pause before each extra attempt.
    pub delay: Duration,
}

impl RetryPolicy {
    /// Evaluate `check` until it answers true, at most `retries + 1` times.
    /// Errors end the loop immediately.
    pub async fn until<F, Fut, E>(&self, mut check: F) -> Result<bool, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<bool, E>>,
    {
        for attempt in 0..=self.retries {
            if attempt > 0 {
                tokio::time::sleep(self.delay).await;
            }
            if check(attempt).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

/// Pipeline knobs, taken from [`Config`] in production.
#[derive(Debug, Clone)]
pub struct RemoverSettings {
    /// How long to wait for a piece to become a main piece.
    pub retry: RetryPolicy,
    /// Prefix for new virtual file URIs (ends in `/`).
    pub file_resource_base: String,
    /// Prefix for new signed-copy piece URIs (ends in `/`).
    pub piece_resource_base: String,
    /// Appended to the piece title to name its signed copy.
    pub title_suffix: String,
    /// Confidentiality promotion for signed copies.
    pub ladder: AccessLadder,
}

impl RemoverSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            retry: RetryPolicy {
                retries: config.pipeline.eligibility_retries,
                delay: config.pipeline.retry_delay(),
            },
            file_resource_base: config.storage.file_resource_base.clone(),
            piece_resource_base: config.storage.piece_resource_base.clone(),
            title_suffix: config.pipeline.copy_title_suffix.clone(),
            ladder: config.access_levels.ladder(),
        }
    }
}

/// Why a piece was left untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    NotMainPiece,
    NoFile,
    NotPdf,
    NoAccessLevel,
    NoSignatures,
    /// Rebound to another file before cleanup, typically by an overlapping run.
    PieceChanged,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SkipReason::NotMainPiece => "not a main piece",
            SkipReason::NoFile => "no file bound",
            SkipReason::NotPdf => "bound file is not a PDF",
            SkipReason::NoAccessLevel => "piece has no confidentiality level",
            SkipReason::NoSignatures => "no signature fields",
            SkipReason::PieceChanged => "piece rebound while processing",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Done {
        sanitized_file: String,
        signed_copy: String,
        stale_copies_removed: usize,
        /// False when the piece changed between resolution and relinking
        /// and the conditional write matched nothing.
        relinked: bool,
    },
    Skipped {
        reason: SkipReason,
    },
}

impl Outcome {
    fn skipped(reason: SkipReason) -> Self {
        Outcome::Skipped { reason }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("graph operation failed: {0:#}")]
    Graph(anyhow::Error),
    #[error("artifact storage failed: {0:#}")]
    Blob(anyhow::Error),
    #[error("PDF transform failed: {0}")]
    Transform(#[from] StripError),
    #[error("PDF transform task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Runs the pipeline for one piece at a time.
#[derive(Clone)]
pub struct SignatureRemover {
    pieces: Arc<dyn PieceStore>,
    blobs: Arc<dyn BlobStore>,
    stripper: Arc<dyn SignatureStripper>,
    settings: RemoverSettings,
}

impl SignatureRemover {
    pub fn new(
        pieces: Arc<dyn PieceStore>,
        blobs: Arc<dyn BlobStore>,
        stripper: Arc<dyn SignatureStripper>,
        settings: RemoverSettings,
    ) -> Self {
        Self {
            pieces,
            blobs,
            stripper,
            settings,
        }
    }

    /// Production wiring: SPARQL endpoint and shared volume from `config`,
    /// acting as `scope` on `graph_uri`.
    pub fn from_config(config: &Config, scope: Scope, graph_uri: &str) -> Result<Self> {
        let client = SparqlClient::new(
            &config.graph.sparql_endpoint,
            scope,
            Duration::from_secs(config.graph.timeout_secs),
        )?;
        Ok(Self::new(
            Arc::new(SparqlPieceStore::new(Arc::new(client), graph_uri)),
            Arc::new(FsBlobStore::new(
                config.storage.share_root.clone(),
                &config.storage.subpath,
            )),
            Arc::new(PdfSignatureStripper),
            RemoverSettings::from_config(config),
        ))
    }

    async fn wait_for_main_piece(&self, piece: &str) -> Result<bool, PipelineError> {
        self.settings
            .retry
            .until(|attempt| {
                if attempt > 0 {
                    debug!(%piece, attempt, "re-checking eligibility");
                }
                self.pieces.is_main_piece(piece)
            })
            .await
            .map_err(PipelineError::Graph)
    }

    /// Sanitize one piece.
    pub async fn remove_signatures(&self, piece: &str) -> Result<Outcome, PipelineError> {
        if !self.wait_for_main_piece(piece).await? {
            return Ok(Outcome::skipped(SkipReason::NotMainPiece));
        }

        let Some(file) = self
            .pieces
            .piece_file(piece)
            .await
            .map_err(PipelineError::Graph)?
        else {
            return Ok(Outcome::skipped(SkipReason::NoFile));
        };
        if !file.is_pdf() {
            debug!(%piece, extension = %file.extension, format = %file.format, "not a PDF");
            return Ok(Outcome::skipped(SkipReason::NotPdf));
        }
        if file.access_level.is_none() {
            return Ok(Outcome::skipped(SkipReason::NoAccessLevel));
        }

        let bytes = self
            .blobs
            .read(&file.physical_uri)
            .await
            .map_err(PipelineError::Blob)?;
        let stripper = Arc::clone(&self.stripper);
        let sanitized = match tokio::task::spawn_blocking(move || stripper.strip(&bytes)).await?? {
            Stripped::Sanitized(bytes) => bytes,
            Stripped::NoSignatures => return Ok(Outcome::skipped(SkipReason::NoSignatures)),
        };

        let Some(stale_copies_removed) = self.remove_stale_copies(piece, &file).await? else {
            warn!(%piece, file = %file.uri, "piece rebound while processing; leaving it as is");
            return Ok(Outcome::skipped(SkipReason::PieceChanged));
        };
        let pair = self.store_sanitized(&file, &sanitized).await?;

        let copy_id = Uuid::new_v4().to_string();
        let copy_uri = format!("{}{}", self.settings.piece_resource_base, copy_id);
        let relinked = self
            .pieces
            .relink(&Relink {
                piece,
                original: &file,
                sanitized_file: &pair.virtual_file.uri,
                copy_uri: &copy_uri,
                copy_id: &copy_id,
                now: Utc::now(),
                title_suffix: &self.settings.title_suffix,
                ladder: &self.settings.ladder,
            })
            .await
            .map_err(PipelineError::Graph)?;
        if !relinked {
            warn!(%piece, file = %pair.virtual_file.uri, "piece changed before relinking; sanitized file left unlinked");
        }

        Ok(Outcome::Done {
            sanitized_file: pair.virtual_file.uri,
            signed_copy: copy_uri,
            stale_copies_removed,
            relinked,
        })
    }

    /// Remove the copies earlier runs left behind. `None` when the piece no
    /// longer holds `file`, which means a newer run owns it.
    async fn remove_stale_copies(
        &self,
        piece: &str,
        file: &PieceFile,
    ) -> Result<Option<usize>, PipelineError> {
        let copies = self
            .pieces
            .stale_copies(piece, &file.uri)
            .await
            .map_err(PipelineError::Graph)?;
        for copy in &copies {
            let removed = self
                .pieces
                .remove_copy(piece, file, copy)
                .await
                .map_err(PipelineError::Graph)?;
            if !removed {
                return Ok(None);
            }
            if let Some(physical) = &copy.physical_uri {
                self.blobs.delete(physical).await.map_err(PipelineError::Blob)?;
            }
            info!(%piece, copy = %copy.piece, kind = ?copy.kind, "removed stale copy");
        }
        Ok(Some(copies.len()))
    }

    /// Write the bytes and record them; the blob is removed again if the
    /// records cannot be written.
    async fn store_sanitized(&self, original: &PieceFile, data: &[u8]) -> Result<FilePair, PipelineError> {
        let location = self
            .blobs
            .write(data, PDF_EXTENSION)
            .await
            .map_err(PipelineError::Blob)?;
        let pair = self.file_pair(original, &location, data.len() as u64);

        if let Err(e) = self.pieces.insert_file_pair(&pair).await {
            if let Err(cleanup) = self.blobs.delete(&location.uri).await {
                warn!(uri = %location.uri, error = %cleanup, "could not remove unrecorded artifact");
            }
            return Err(PipelineError::Graph(e));
        }
        Ok(pair)
    }

    fn file_pair(&self, original: &PieceFile, location: &BlobLocation, size: u64) -> FilePair {
        let created = Utc::now();
        let virtual_id = Uuid::new_v4().to_string();
        let record = |uri: String, id: String, name: String| FileRecord {
            uri,
            id,
            name,
            format: PDF_FORMAT.to_string(),
            size,
            extension: PDF_EXTENSION.to_string(),
            created,
        };
        FilePair {
            virtual_file: record(
                format!("{}{}", self.settings.file_resource_base, virtual_id),
                virtual_id,
                original.name.clone(),
            ),
            physical_file: record(
                location.uri.clone(),
                location.id.clone(),
                location.file_name.clone(),
            ),
        }
    }
}

#[async_trait]
impl BatchHandler for SignatureRemover {
    async fn handle(&self, changesets: Vec<Changeset>) -> Result<()> {
        let pieces = candidate_pieces(&changesets);
        if pieces.is_empty() {
            debug!(changesets = changesets.len(), "no pieces in drained changesets");
            return Ok(());
        }
        info!(pieces = pieces.len(), "processing pieces");

        let (mut done, mut skipped, mut failed) = (0usize, 0usize, 0usize);
        for piece in &pieces {
            match self.remove_signatures(piece).await {
                Ok(Outcome::Done { relinked, .. }) => {
                    done += 1;
                    info!(%piece, relinked, "signatures removed");
                }
                Ok(Outcome::Skipped { reason }) => {
                    skipped += 1;
                    info!(%piece, %reason, "piece skipped");
                }
                Err(e) => {
                    failed += 1;
                    error!(%piece, error = %e, "failed to remove signatures");
                }
            }
        }
        info!(done, skipped, failed, "batch processed");
        Ok(())
    }
}
