//! Content-addressed cache of MSA and template artifacts.
//!
//! Records are keyed by the SHA-256 of the protein sequence, so the same
//! sequence is searched once and reused by every job that contains it.

pub mod db;
pub mod document;
pub mod record;

pub use db::{ArtifactStore, Reconciled, StoreStatus, DEFAULT_SEARCH_LIMIT};
pub use document::{BatchDocument, ChainEntry, ProteinChain};
pub use record::{sequence_id, Artifacts, RecordHeader, SequenceRecord};
