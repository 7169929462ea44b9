//! In-memory storage backend.
//!
//! Thread-safe in-memory implementations of the storage traits. The table
//! state types are shared with the persistent backend, which replays its
//! write-ahead log into the same structures.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::mapping::{
    AliasMappingRecord, EnrichmentIndexRecord, IndexKey, InsertReport, MappingConflict,
    MatchResult, MatchType,
};
use crate::storage::traits::{EnrichmentIndexStore, MappingRepository, StorageError};

pub(crate) fn lock_err(context: &'static str) -> StorageError {
    StorageError::BackendError(format!("poisoned lock: {context}"))
}

fn normalize_alias(s: &str) -> String {
    s.trim().to_string()
}

/// Rows accepted by an insert, plus the report handed back to the caller.
#[derive(Debug, Default)]
pub(crate) struct InsertPlan {
    pub(crate) accepted: Vec<AliasMappingRecord>,
    pub(crate) report: InsertReport,
}

/// Contents of the `alias_mapping` table.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub(crate) struct AliasState {
    rows: HashMap<String, BTreeMap<MatchType, AliasMappingRecord>>,
}

impl AliasState {
    pub(crate) fn lookup(
        &self,
        alias_names: &HashSet<String>,
        match_types: Option<&[MatchType]>,
    ) -> HashMap<String, MatchResult> {
        let mut out = HashMap::with_capacity(alias_names.len());
        for alias in alias_names {
            let Some(by_type) = self.rows.get(&normalize_alias(alias)) else {
                continue;
            };

            let mut best: Option<&AliasMappingRecord> = None;
            for record in by_type.values() {
                if match_types.is_some_and(|allowed| !allowed.contains(&record.match_type)) {
                    continue;
                }
                // Ties keep the earlier match type (BTreeMap order).
                if best.map_or(true, |b| record.priority.outranks(b.priority)) {
                    best = Some(record);
                }
            }

            if let Some(record) = best {
                out.insert(alias.clone(), MatchResult::from(record));
            }
        }
        out
    }

    /// Decides which records a batch would insert without touching state.
    ///
    /// The whole batch is validated first so a bad row rejects the batch.
    pub(crate) fn plan_insert(
        &self,
        records: Vec<AliasMappingRecord>,
    ) -> Result<InsertPlan, StorageError> {
        for record in &records {
            record.validate()?;
        }

        let mut plan = InsertPlan::default();
        let mut pending: HashMap<(String, MatchType), usize> = HashMap::new();

        for mut record in records {
            record.alias_name = normalize_alias(&record.alias_name);
            let key = (record.alias_name.clone(), record.match_type);

            let existing = self
                .rows
                .get(&record.alias_name)
                .and_then(|by_type| by_type.get(&record.match_type))
                .map(|r| &r.canonical_id)
                .or_else(|| pending.get(&key).map(|&i| &plan.accepted[i].canonical_id));

            match existing {
                None => {
                    pending.insert(key, plan.accepted.len());
                    plan.accepted.push(record);
                }
                Some(existing_id) => {
                    plan.report.skipped_count += 1;
                    if *existing_id != record.canonical_id {
                        plan.report.conflicts.push(MappingConflict {
                            alias: record.alias_name.clone(),
                            match_type: record.match_type,
                            existing_id: existing_id.clone(),
                            new_id: record.canonical_id,
                        });
                    }
                }
            }
        }

        plan.report.inserted_count = plan.accepted.len();
        Ok(plan)
    }

    pub(crate) fn apply_insert(&mut self, records: &[AliasMappingRecord]) {
        for record in records {
            self.rows
                .entry(record.alias_name.clone())
                .or_default()
                .entry(record.match_type)
                .or_insert_with(|| record.clone());
        }
    }

    pub(crate) fn count_by_source(&self, source: &str) -> usize {
        self.rows
            .values()
            .flat_map(BTreeMap::values)
            .filter(|r| r.source == source)
            .count()
    }

    pub(crate) fn purge(&mut self, source: &str) -> usize {
        let mut removed = 0;
        self.rows.retain(|_, by_type| {
            let before = by_type.len();
            by_type.retain(|_, r| r.source != source);
            removed += before - by_type.len();
            !by_type.is_empty()
        });
        removed
    }

    pub(crate) fn len(&self) -> usize {
        self.rows.values().map(BTreeMap::len).sum()
    }
}

/// Contents of the `enrichment_index` table.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub(crate) struct IndexState {
    #[serde(with = "index_rows")]
    rows: HashMap<IndexKey, EnrichmentIndexRecord>,
}

// `IndexKey` is a struct, so the table is stored as a list of records and
// re-keyed on load.
mod index_rows {
    use std::collections::HashMap;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use crate::mapping::{EnrichmentIndexRecord, IndexKey};

    pub(super) fn serialize<S: Serializer>(
        rows: &HashMap<IndexKey, EnrichmentIndexRecord>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let mut records: Vec<&EnrichmentIndexRecord> = rows.values().collect();
        records.sort_by(|a, b| (a.lookup_type, &a.lookup_key).cmp(&(b.lookup_type, &b.lookup_key)));
        records.serialize(serializer)
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<HashMap<IndexKey, EnrichmentIndexRecord>, D::Error> {
        let records = Vec::<EnrichmentIndexRecord>::deserialize(deserializer)?;
        Ok(records.into_iter().map(|r| (r.key(), r)).collect())
    }
}

impl IndexState {
    pub(crate) fn lookup(&self, keys: &[IndexKey]) -> HashMap<IndexKey, EnrichmentIndexRecord> {
        keys.iter()
            .filter_map(|k| self.rows.get(k).map(|r| (k.clone(), r.clone())))
            .collect()
    }

    /// Returns the rows an upsert would write (in final form).
    pub(crate) fn plan_upsert(
        &self,
        records: Vec<EnrichmentIndexRecord>,
    ) -> Result<Vec<EnrichmentIndexRecord>, StorageError> {
        for record in &records {
            if record.lookup_key.trim().is_empty() {
                return Err(crate::error::ValidationError::EmptyAlias.into());
            }
        }

        let mut staged: HashMap<IndexKey, EnrichmentIndexRecord> = HashMap::new();
        let mut order: Vec<IndexKey> = Vec::new();

        for mut record in records {
            record.confidence = record.confidence.to_storage_precision();
            let key = record.key();
            let current = staged.get(&key).or_else(|| self.rows.get(&key));

            let write = match current {
                None => true,
                Some(existing) => {
                    if record.confidence > existing.confidence {
                        record.hit_count = existing.hit_count;
                        record.last_hit_at = existing.last_hit_at;
                        true
                    } else {
                        false
                    }
                }
            };

            if write {
                if !staged.contains_key(&key) {
                    order.push(key.clone());
                }
                staged.insert(key, record);
            }
        }

        Ok(order
            .into_iter()
            .filter_map(|k| staged.remove(&k))
            .collect())
    }

    pub(crate) fn apply_upsert(&mut self, records: &[EnrichmentIndexRecord]) {
        for record in records {
            self.rows.insert(record.key(), record.clone());
        }
    }

    pub(crate) fn apply_hits(&mut self, keys: &[IndexKey], at: DateTime<Utc>) -> usize {
        let mut touched = 0;
        for key in keys {
            if let Some(row) = self.rows.get_mut(key) {
                row.hit_count = row.hit_count.saturating_add(1);
                row.last_hit_at = Some(at);
                touched += 1;
            }
        }
        touched
    }

    pub(crate) fn count_by_source(&self, source: &str) -> usize {
        self.rows.values().filter(|r| r.source == source).count()
    }

    pub(crate) fn purge(&mut self, source: &str) -> usize {
        let before = self.rows.len();
        self.rows.retain(|_, r| r.source != source);
        before - self.rows.len()
    }
}

/// Thread-safe in-memory implementation of both mapping tables.
#[derive(Debug, Default)]
pub struct InMemoryMappingRepository {
    aliases: RwLock<AliasState>,
    index: RwLock<IndexState>,
}

impl InMemoryMappingRepository {
    /// Create a new empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a repository seeded with alias rows (e.g. a migration fixture).
    ///
    /// # Errors
    ///
    /// Returns `StorageError::InvalidRecord` if any row is invalid.
    pub fn with_records(records: Vec<AliasMappingRecord>) -> Result<Self, StorageError> {
        let repo = Self::new();
        repo.insert_batch(records)?;
        Ok(repo)
    }
}

impl MappingRepository for InMemoryMappingRepository {
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
        let mut state = self.aliases.write().map_err(|_| lock_err("alias.insert_batch"))?;
        let plan = state.plan_insert(records)?;
        state.apply_insert(&plan.accepted);
        Ok(plan.report)
    }

    fn purge_by_source(&self, source: &str) -> Result<usize, StorageError> {
        let mut state = self.aliases.write().map_err(|_| lock_err("alias.purge_by_source"))?;
        Ok(state.purge(source))
    }

    fn count(&self) -> Result<usize, StorageError> {
        let state = self.aliases.read().map_err(|_| lock_err("alias.count"))?;
        Ok(state.len())
    }
}

impl EnrichmentIndexStore for InMemoryMappingRepository {
    fn lookup_index_batch(
        &self,
        keys: &[IndexKey],
    ) -> Result<HashMap<IndexKey, EnrichmentIndexRecord>, StorageError> {
        let state = self.index.read().map_err(|_| lock_err("index.lookup_batch"))?;
        Ok(state.lookup(keys))
    }

    fn upsert_index(&self, records: Vec<EnrichmentIndexRecord>) -> Result<usize, StorageError> {
        let mut state = self.index.write().map_err(|_| lock_err("index.upsert"))?;
        let rows = state.plan_upsert(records)?;
        state.apply_upsert(&rows);
        Ok(rows.len())
    }

    fn record_hits(&self, keys: &[IndexKey]) -> Result<usize, StorageError> {
        let mut state = self.index.write().map_err(|_| lock_err("index.record_hits"))?;
        Ok(state.apply_hits(keys, Utc::now()))
    }

    fn purge_index_by_source(&self, source: &str) -> Result<usize, StorageError> {
        let mut state = self.index.write().map_err(|_| lock_err("index.purge_by_source"))?;
        Ok(state.purge(source))
    }
}
