//! # pdf-signature-remover
//!
//! Watches a document-management knowledge graph for newly created pieces,
//! strips embedded signature fields from their PDF files, and relinks the
//! graph so the piece serves the sanitized file while the signed original
//! lives on as a separate piece at a higher confidentiality level.
//!
//! ## Architecture
//!
//! ```text
//!  POST /delta ──► DeltaBuffer ──► RunCoordinator ──► SignatureRemover
//!                                  (one run at a time)     │
//!  POST /remove-signatures ────────────────────────────────┤
//!                                                          ▼
//!                           ┌──────────────┬──────────────┬──────────────┐
//!                           │  PieceStore  │  BlobStore   │  Signature-  │
//!                           │  (SPARQL)    │  (/share)    │  Stripper    │
//!                           └──────────────┴──────────────┴──────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration with environment overrides |
//! | [`models`] | Delta notifications, file and piece records |
//! | [`sparql`] | Parameterized SPARQL statements |
//! | [`graph`] | SPARQL endpoint client |
//! | [`store`] | Piece metadata operations (SPARQL and in-memory) |
//! | [`blob`] | Artifact bytes on the shared volume |
//! | [`signatures`] | Signature field removal from PDFs |
//! | [`access`] | Confidentiality ladder and promotion |
//! | [`delta`] | Notification buffer and piece extraction |
//! | [`coordinator`] | Serialized processing runs |
//! | [`pipeline`] | Per-piece sanitization |
//! | [`server`] | HTTP endpoints |

pub mod access;
pub mod blob;
pub mod config;
pub mod coordinator;
pub mod delta;
pub mod graph;
pub mod models;
pub mod pipeline;
pub mod server;
pub mod signatures;
pub mod sparql;
pub mod store;
