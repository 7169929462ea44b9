//! WAL-backed mapping repository.
//!
//! Both tables are held in memory using the same state types as the
//! in-memory backend. A mutation is planned against the current state,
//! appended to the WAL as one entry, and only then applied.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use chrono::Utc;

use crate::mapping::{
    AliasMappingRecord, EnrichmentIndexRecord, IndexKey, InsertReport, MatchResult, MatchType,
};
use crate::storage::memory::{lock_err, AliasState, IndexState};
use crate::storage::traits::{EnrichmentIndexStore, MappingRepository, StorageError};

use super::file_lock::FileLock;
use super::snapshot;
use super::wal::{WalEntryKind, WriteAheadLog};
use super::PersistentConfig;

const WAL_FILE: &str = "mapping.wal";

fn backend(context: &str, e: io::Error) -> StorageError {
    StorageError::BackendError(format!("{context}: {e}"))
}

/// Result of a compaction.
#[derive(Debug, Clone)]
pub struct CompactionResult {
    /// WAL sequence covered by the new snapshot.
    pub up_to_sequence: u64,
    /// Alias rows written to the snapshot.
    pub alias_rows: usize,
    /// WAL size before compaction.
    pub wal_size_before: u64,
    /// WAL size after compaction.
    pub wal_size_after: u64,
}

/// Durable single-process implementation of both mapping tables.
pub struct PersistentMappingRepository {
    dir: PathBuf,
    _lock: FileLock,
    wal: WriteAheadLog,
    aliases: RwLock<AliasState>,
    index: RwLock<IndexState>,
    config: PersistentConfig,
}

impl std::fmt::Debug for PersistentMappingRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentMappingRepository")
            .field("dir", &self.dir)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl PersistentMappingRepository {
    /// Opens (or creates) a repository in `dir`, loading the snapshot and
    /// replaying the WAL written after it.
    pub fn open(dir: &Path, config: PersistentConfig) -> Result<Self, StorageError> {
        fs::create_dir_all(dir).map_err(|e| backend("failed to create store directory", e))?;
        let lock = FileLock::acquire(dir).map_err(|e| backend("failed to acquire lock", e))?;

        let snap = snapshot::load(dir).map_err(|e| backend("failed to load snapshot", e))?;
        let wal = WriteAheadLog::open(&dir.join(WAL_FILE), config.sync_on_write)
            .map_err(|e| backend("failed to open WAL", e))?;

        let repo = Self {
            dir: dir.to_path_buf(),
            _lock: lock,
            wal,
            aliases: RwLock::new(snap.aliases),
            index: RwLock::new(snap.index),
            config,
        };
        repo.replay(snap.up_to_sequence)?;
        Ok(repo)
    }

    fn replay(&self, after_sequence: u64) -> Result<(), StorageError> {
        let mut aliases = self.aliases.write().map_err(|_| lock_err("alias.replay"))?;
        let mut index = self.index.write().map_err(|_| lock_err("index.replay"))?;

        let mut applied = 0usize;
        for entry in self.wal.iter().map_err(|e| backend("failed to iterate WAL", e))? {
            let entry = entry.map_err(|e| backend("corrupted WAL entry", e))?;
            if entry.sequence <= after_sequence {
                continue;
            }

            match entry.kind {
                WalEntryKind::AliasInsert(records) => aliases.apply_insert(&records),
                WalEntryKind::AliasPurge { source } => {
                    aliases.purge(&source);
                }
                WalEntryKind::IndexUpsert(records) => index.apply_upsert(&records),
                WalEntryKind::IndexHits { keys, at } => {
                    index.apply_hits(&keys, at);
                }
                WalEntryKind::IndexPurge { source } => {
                    index.purge(&source);
                }
                WalEntryKind::Checkpoint { .. } => continue,
            }
            applied += 1;
        }

        if applied > 0 {
            tracing::info!(
                dir = %self.dir.display(),
                entries = applied,
                alias_rows = aliases.len(),
                "replayed mapping WAL"
            );
        }
        Ok(())
    }

    /// Writes a snapshot of both tables and truncates the WAL.
    ///
    /// Writers are blocked for the duration. If the process dies partway,
    /// the old snapshot plus the untruncated WAL still describe the state.
    pub fn compact(&self) -> Result<CompactionResult, StorageError> {
        let aliases = self.aliases.read().map_err(|_| lock_err("alias.compact"))?;
        let index = self.index.read().map_err(|_| lock_err("index.compact"))?;

        let wal_size_before = self.wal.size_bytes().unwrap_or(0);
        let up_to_sequence = self
            .wal
            .current_sequence()
            .map_err(|e| backend("failed to read WAL sequence", e))?;

        snapshot::write(&self.dir, up_to_sequence, &aliases, &index)
            .map_err(|e| backend("failed to write snapshot", e))?;
        self.wal
            .truncate_to_checkpoint(up_to_sequence)
            .map_err(|e| backend("failed to truncate WAL", e))?;

        let result = CompactionResult {
            up_to_sequence,
            alias_rows: aliases.len(),
            wal_size_before,
            wal_size_after: self.wal.size_bytes().unwrap_or(0),
        };
        tracing::info!(
            up_to_sequence,
            alias_rows = result.alias_rows,
            wal_size_before,
            wal_size_after = result.wal_size_after,
            "compacted mapping store"
        );
        Ok(result)
    }

    /// Current WAL size in bytes.
    #[must_use]
    pub fn wal_size(&self) -> u64 {
        self.wal.size_bytes().unwrap_or(0)
    }

    fn log(&self, kind: WalEntryKind) -> Result<(), StorageError> {
        self.wal
            .append(kind)
            .map(|_| ())
            .map_err(|e| backend("failed to append WAL entry", e))
    }

    // Called with no table lock held.
    fn maybe_compact(&self) {
        if self.wal_size() <= self.config.max_wal_size {
            return;
        }
        if let Err(e) = self.compact() {
            tracing::warn!(error = %e, "automatic compaction failed; WAL keeps growing");
        }
    }
}

impl MappingRepository for PersistentMappingRepository {
    fn lookup_batch(
        &self,
        alias_names: &HashSet<String>,
        match_types: Option<&[MatchType]>,
    ) -> Result<HashMap<String, MatchResult>, StorageError> {
        let state = self.aliases.read().map_err(|_| lock_err("alias.lookup_batch"))?;
        Ok(state.lookup(alias_names, match_types))
    }

    fn insert_batch(&self, records: Vec<AliasMappingRecord>) -> Result<usize, StorageError> {
        Ok(self.insert_batch_with_conflict_check(records)?.inserted_count)
    }

    fn insert_batch_with_conflict_check(
        &self,
        records: Vec<AliasMappingRecord>,
    ) -> Result<InsertReport, StorageError> {
        let report = {
            let mut state = self.aliases.write().map_err(|_| lock_err("alias.insert_batch"))?;
            let plan = state.plan_insert(records)?;
            if !plan.accepted.is_empty() {
                self.log(WalEntryKind::AliasInsert(plan.accepted.clone()))?;
                state.apply_insert(&plan.accepted);
            }
            plan.report
        };
        self.maybe_compact();
        Ok(report)
    }

    fn purge_by_source(&self, source: &str) -> Result<usize, StorageError> {
        let removed = {
            let mut state = self.aliases.write().map_err(|_| lock_err("alias.purge_by_source"))?;
            if state.count_by_source(source) == 0 {
                return Ok(0);
            }
            self.log(WalEntryKind::AliasPurge {
                source: source.to_string(),
            })?;
            state.purge(source)
        };
        self.maybe_compact();
        Ok(removed)
    }

    fn count(&self) -> Result<usize, StorageError> {
        let state = self.aliases.read().map_err(|_| lock_err("alias.count"))?;
        Ok(state.len())
    }
}

impl EnrichmentIndexStore for PersistentMappingRepository {
    fn lookup_index_batch(
        &self,
        keys: &[IndexKey],
    ) -> Result<HashMap<IndexKey, EnrichmentIndexRecord>, StorageError> {
        let state = self.index.read().map_err(|_| lock_err("index.lookup_batch"))?;
        Ok(state.lookup(keys))
    }

    fn upsert_index(&self, records: Vec<EnrichmentIndexRecord>) -> Result<usize, StorageError> {
        let written = {
            let mut state = self.index.write().map_err(|_| lock_err("index.upsert"))?;
            let rows = state.plan_upsert(records)?;
            if !rows.is_empty() {
                self.log(WalEntryKind::IndexUpsert(rows.clone()))?;
                state.apply_upsert(&rows);
            }
            rows.len()
        };
        self.maybe_compact();
        Ok(written)
    }

    fn record_hits(&self, keys: &[IndexKey]) -> Result<usize, StorageError> {
        let touched = {
            let mut state = self.index.write().map_err(|_| lock_err("index.record_hits"))?;
            let present: Vec<IndexKey> = state.lookup(keys).into_keys().collect();
            if present.is_empty() {
                return Ok(0);
            }
            let at = Utc::now();
            self.log(WalEntryKind::IndexHits {
                keys: keys.to_vec(),
                at,
            })?;
            state.apply_hits(keys, at)
        };
        self.maybe_compact();
        Ok(touched)
    }

    fn purge_index_by_source(&self, source: &str) -> Result<usize, StorageError> {
        let removed = {
            let mut state = self.index.write().map_err(|_| lock_err("index.purge_by_source"))?;
            if state.count_by_source(source) == 0 {
                return Ok(0);
            }
            self.log(WalEntryKind::IndexPurge {
                source: source.to_string(),
            })?;
            state.purge(source)
        };
        self.maybe_compact();
        Ok(removed)
    }
}
