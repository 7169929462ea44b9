//! Abstract storage traits for the mapping tables.
//!
//! These traits define the contract that storage backends must implement:
//! - In-memory backend for tests and embedded use
//! - Persistent backend (feature `persistent`) for durable single-process use
//! - SQL backends implemented outside this crate against the same schema

use std::collections::{HashMap, HashSet};

use thiserror::Error;

use crate::error::ValidationError;
use crate::mapping::{
    AliasMappingRecord, EnrichmentIndexRecord, IndexKey, InsertReport, MatchResult, MatchType,
};

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// A record failed validation; nothing from the batch was written.
    #[error("Invalid record: {0}")]
    InvalidRecord(#[from] ValidationError),

    /// Backend error.
    #[error("Storage backend error: {0}")]
    BackendError(String),

    /// Serialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Connection failed.
    #[error("Connection error: {0}")]
    ConnectionError(String),
}

/// Durable alias → canonical-ID store (`alias_mapping`).
///
/// # Consistency
/// - `(alias_name, match_type)` is unique; writes are do-nothing-on-conflict
/// - A batch is validated as a whole before any row is applied
/// - Implementations must be safe for concurrent use
pub trait MappingRepository: Send + Sync {
    /// Looks up many aliases in one round-trip.
    ///
    /// For each alias with at least one stored row (restricted to
    /// `match_types` when given), returns only the most authoritative row.
    /// Aliases are compared after trimming.
    fn lookup_batch(
        &self,
        alias_names: &HashSet<String>,
        match_types: Option<&[MatchType]>,
    ) -> Result<HashMap<String, MatchResult>, StorageError>;

    /// Inserts records, ignoring any whose `(alias_name, match_type)` exists.
    ///
    /// Returns the number of rows actually inserted.
    fn insert_batch(&self, records: Vec<AliasMappingRecord>) -> Result<usize, StorageError>;

    /// Inserts records and reports rows that would have changed an existing
    /// mapping's canonical ID.
    fn insert_batch_with_conflict_check(
        &self,
        records: Vec<AliasMappingRecord>,
    ) -> Result<InsertReport, StorageError>;

    /// Administrative purge of every row written by `source`.
    fn purge_by_source(&self, source: &str) -> Result<usize, StorageError>;

    /// Number of stored rows.
    fn count(&self) -> Result<usize, StorageError>;
}

/// Durable normalized-key → company-ID cache (`enrichment_index`).
pub trait EnrichmentIndexStore: Send + Sync {
    /// Looks up many keys in one round-trip.
    fn lookup_index_batch(
        &self,
        keys: &[IndexKey],
    ) -> Result<HashMap<IndexKey, EnrichmentIndexRecord>, StorageError>;

    /// Inserts or updates rows.
    ///
    /// On key conflict the row with the strictly higher confidence wins;
    /// `hit_count` and `last_hit_at` of the stored row are preserved.
    /// Returns the number of rows inserted or replaced.
    fn upsert_index(&self, records: Vec<EnrichmentIndexRecord>) -> Result<usize, StorageError>;

    /// Increments `hit_count` and stamps `last_hit_at` for each existing key.
    fn record_hits(&self, keys: &[IndexKey]) -> Result<usize, StorageError>;

    /// Administrative purge of every row written by `source`.
    fn purge_index_by_source(&self, source: &str) -> Result<usize, StorageError>;
}
