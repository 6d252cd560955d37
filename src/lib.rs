//! quire: manuscript ingestion, storage routing and chapter delivery for
//! serialized novels.
//!
//! Contributors upload a book (EPUB or pasted text). The upload is split into
//! chapters, given a stable identifier and written either to the shared
//! catalog or to the contributor's own device, depending on what they are
//! allowed to publish. Readers are then served chapters through a bounded
//! per-book cache, and their progress is merged across device and account.
//!
//! # Features
//!
//! - EPUB and plain text chapter extraction
//! - Deterministic slug identifiers for books
//! - Cover downscaling and re-encoding, video pass-through
//! - Tier-checked routing between shared and device storage
//! - Idempotent chapter upserts with targeted retry of failed chapters
//! - Batched chapter prefetch within the store's per-call key limit
//! - Reading history merged from device and account

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Contributor tiers.
pub mod auth;
/// Configuration and CLI.
pub mod config;
/// Cover and promotional asset normalization.
pub mod cover;
/// Error types.
pub mod error;
/// Manuscript format handlers.
pub mod formats;
/// Reading history.
pub mod history;
/// Book identifiers.
pub mod identity;
/// Upload orchestration.
pub mod ingest;
/// Book, chapter and progress models.
pub mod library;
/// Chapter delivery cache.
pub mod reader;
/// Storage routing and write strategies.
pub mod router;
/// HTTP server.
pub mod server;
/// Document and blob stores.
pub mod store;


pub use config::{Cli, Command, Config};
pub use error::{AppError, Result};
pub use ingest::{Ingestor, UploadOutcome, UploadRequest};
pub use reader::{ReadingSession, Shelf};
pub use router::{PersistenceRouter, RoutingDecision, route};
pub use server::AppState;
