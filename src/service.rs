//! Cache-first enrichment service.
//!
//! Answers lookups from the mapping tables only; it never calls the network.
//! The alias table is consulted first (most authoritative row wins across
//! all keys of a request), then the enrichment index, where only rows at or
//! above the confidence threshold are trusted.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::confidence::Confidence;
use crate::mapping::{CompanyId, IndexKey, LookupType, MatchResult, MatchType};
use crate::normalize::{is_blank, normalize_company_name};
use crate::provider::DEFAULT_CACHE_THRESHOLD;
use crate::storage::{EnrichmentIndexStore, MappingRepository, StorageError};

/// The identifiers available for one row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichmentRequest {
    /// Plan code.
    pub plan_code: Option<String>,
    /// Customer name.
    pub customer_name: Option<String>,
    /// Account name.
    pub account_name: Option<String>,
    /// Account number.
    pub account_number: Option<String>,
}

impl EnrichmentRequest {
    fn plan_code(&self) -> Option<&str> {
        non_blank(self.plan_code.as_deref())
    }

    fn account_number(&self) -> Option<&str> {
        non_blank(self.account_number.as_deref())
    }

    fn normalized_name(&self) -> Option<String> {
        non_blank(self.customer_name.as_deref())
            .map(normalize_company_name)
            .filter(|n| !n.is_empty())
    }

    fn normalized_account_name(&self) -> Option<String> {
        non_blank(self.account_name.as_deref())
            .map(normalize_company_name)
            .filter(|n| !n.is_empty())
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    if is_blank(value) {
        None
    } else {
        value.map(str::trim)
    }
}

/// Request fields probed against the alias table, and the match types
/// each one may hit.
#[derive(Debug, Clone, Copy)]
enum AliasKey {
    Plan,
    Account,
    Name,
    AccountName,
}

impl AliasKey {
    const ALL: [Self; 4] = [Self::Plan, Self::Account, Self::Name, Self::AccountName];

    const fn match_types(self) -> &'static [MatchType] {
        match self {
            Self::Plan => &[MatchType::Plan, MatchType::Hardcode],
            Self::Account => &[MatchType::Account],
            Self::Name => &[MatchType::Name],
            Self::AccountName => &[MatchType::AccountName],
        }
    }

    fn key(self, request: &EnrichmentRequest) -> Option<String> {
        match self {
            Self::Plan => request.plan_code().map(str::to_string),
            Self::Account => request.account_number().map(str::to_string),
            Self::Name => request.normalized_name(),
            Self::AccountName => request.normalized_account_name(),
        }
    }
}

/// Which table answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "table")]
pub enum HitSource {
    /// Answered by the alias table.
    Alias { match_type: MatchType },
    /// Answered by the enrichment index.
    Index { lookup_type: LookupType },
}

impl HitSource {
    /// Label used in per-type hit counters.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Alias { match_type } => match_type.as_str(),
            Self::Index { lookup_type } => lookup_type.as_str(),
        }
    }
}

/// A cache answer for one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceHit {
    /// Answered company ID.
    pub company_id: CompanyId,
    /// Which table answered.
    pub source: HitSource,
    /// Set for index hits.
    pub confidence: Option<Confidence>,
}

/// Resolves requests without spending external budget.
pub trait EnrichmentService: Send + Sync {
    /// Returns one entry per request, in request order.
    ///
    /// # Errors
    ///
    /// Storage failures are returned as-is; the caller decides how to
    /// degrade.
    fn lookup_batch(&self, requests: &[EnrichmentRequest]) -> Result<Vec<Option<ServiceHit>>, StorageError>;
}

/// `EnrichmentService` over the two mapping tables.
pub struct CacheFirstEnrichmentService {
    repository: Arc<dyn MappingRepository>,
    index: Option<Arc<dyn EnrichmentIndexStore>>,
    threshold: Confidence,
}

impl std::fmt::Debug for CacheFirstEnrichmentService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheFirstEnrichmentService")
            .field("has_index", &self.index.is_some())
            .field("threshold", &self.threshold)
            .finish_non_exhaustive()
    }
}

impl CacheFirstEnrichmentService {
    /// Service over the alias table only.
    #[must_use]
    pub fn new(repository: Arc<dyn MappingRepository>) -> Self {
        Self {
            repository,
            index: None,
            threshold: Confidence::new(DEFAULT_CACHE_THRESHOLD).unwrap_or_default(),
        }
    }

    /// Also consult the enrichment index.
    #[must_use]
    pub fn with_index(mut self, index: Arc<dyn EnrichmentIndexStore>) -> Self {
        self.index = Some(index);
        self
    }

    /// Minimum confidence for index rows.
    #[must_use]
    pub fn with_threshold(mut self, threshold: Confidence) -> Self {
        self.threshold = threshold;
        self
    }

    fn alias_hits(
        &self,
        requests: &[EnrichmentRequest],
    ) -> Result<Vec<Option<MatchResult>>, StorageError> {
        let mut best: Vec<Option<MatchResult>> = vec![None; requests.len()];
        for kind in AliasKey::ALL {
            let keys: Vec<Option<String>> = requests.iter().map(|r| kind.key(r)).collect();
            let wanted: HashSet<String> = keys.iter().flatten().cloned().collect();
            if wanted.is_empty() {
                continue;
            }

            let found = self.repository.lookup_batch(&wanted, Some(kind.match_types()))?;
            for (slot, key) in best.iter_mut().zip(&keys) {
                let Some(hit) = key.as_ref().and_then(|k| found.get(k)) else {
                    continue;
                };
                let better = slot
                    .as_ref()
                    .map_or(true, |current| hit.priority.outranks(current.priority));
                if better {
                    *slot = Some(hit.clone());
                }
            }
        }
        Ok(best)
    }

    fn index_keys(request: &EnrichmentRequest) -> Vec<IndexKey> {
        let plan = request.plan_code();
        let name = request.normalized_name();
        let mut keys = Vec::with_capacity(5);
        if let (Some(plan), Some(name)) = (plan, name.as_deref()) {
            keys.push(IndexKey::new(LookupType::PlanCustomer, format!("{plan}|{name}")));
        }
        if let Some(plan) = plan {
            keys.push(IndexKey::new(LookupType::PlanCode, plan));
        }
        if let Some(account) = request.account_number() {
            keys.push(IndexKey::new(LookupType::AccountNumber, account));
        }
        if let Some(name) = name {
            keys.push(IndexKey::new(LookupType::CustomerName, name));
        }
        if let Some(account_name) = request.normalized_account_name() {
            keys.push(IndexKey::new(LookupType::AccountName, account_name));
        }
        keys
    }
}

impl EnrichmentService for CacheFirstEnrichmentService {
    fn lookup_batch(&self, requests: &[EnrichmentRequest]) -> Result<Vec<Option<ServiceHit>>, StorageError> {
        let mut out: Vec<Option<ServiceHit>> = self
            .alias_hits(requests)?
            .into_iter()
            .map(|hit| {
                hit.map(|m| ServiceHit {
                    company_id: m.canonical_id,
                    source: HitSource::Alias {
                        match_type: m.match_type,
                    },
                    confidence: None,
                })
            })
            .collect();

        let Some(index) = &self.index else {
            return Ok(out);
        };

        let per_row: Vec<(usize, Vec<IndexKey>)> = out
            .iter()
            .enumerate()
            .filter(|(_, hit)| hit.is_none())
            .map(|(i, _)| (i, Self::index_keys(&requests[i])))
            .filter(|(_, keys)| !keys.is_empty())
            .collect();
        if per_row.is_empty() {
            return Ok(out);
        }

        let all_keys: Vec<IndexKey> = per_row
            .iter()
            .flat_map(|(_, keys)| keys.iter().cloned())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        let found = index.lookup_index_batch(&all_keys)?;

        let mut hit_keys: HashSet<IndexKey> = HashSet::new();
        for (row, keys) in per_row {
            let trusted = keys
                .iter()
                .find_map(|k| found.get(k).filter(|r| r.confidence.meets(self.threshold)).map(|r| (k, r)));
            if let Some((key, record)) = trusted {
                out[row] = Some(ServiceHit {
                    company_id: record.company_id.clone(),
                    source: HitSource::Index {
                        lookup_type: key.lookup_type,
                    },
                    confidence: Some(record.confidence),
                });
                hit_keys.insert(key.clone());
            }
        }

        if !hit_keys.is_empty() {
            let keys: Vec<IndexKey> = hit_keys.into_iter().collect();
            if let Err(e) = index.record_hits(&keys) {
                tracing::warn!(keys = keys.len(), error = %e, "failed to record enrichment index hits");
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::{sources, AliasMappingRecord, EnrichmentIndexRecord};
    use crate::storage::InMemoryMappingRepository;

    fn cid(s: &str) -> CompanyId {
        CompanyId::new(s).unwrap()
    }

    fn alias(key: &str, id: &str, match_type: MatchType) -> AliasMappingRecord {
        AliasMappingRecord::new(key, cid(id), match_type, sources::LEGACY_MIGRATION).unwrap()
    }

    fn request(plan: Option<&str>, name: Option<&str>) -> EnrichmentRequest {
        EnrichmentRequest {
            plan_code: plan.map(str::to_string),
            customer_name: name.map(str::to_string),
            ..EnrichmentRequest::default()
        }
    }

    fn index_row(lookup_type: LookupType, key: &str, id: &str, conf: f32) -> EnrichmentIndexRecord {
        EnrichmentIndexRecord::new(
            IndexKey::new(lookup_type, key),
            cid(id),
            Confidence::new(conf).unwrap(),
            sources::EQC_API,
        )
        .unwrap()
    }

    #[test]
    fn plan_alias_outranks_name_alias() {
        let repo = Arc::new(InMemoryMappingRepository::new());
        repo.insert_batch(vec![
            alias("P1", "PLAN-ID", MatchType::Plan),
            alias("acme", "NAME-ID", MatchType::Name),
        ])
        .unwrap();
        let service = CacheFirstEnrichmentService::new(repo);

        let hits = service
            .lookup_batch(&[request(Some("P1"), Some("ACME")), request(None, Some("Acme Co., Ltd."))])
            .unwrap();
        assert_eq!(hits[0].as_ref().unwrap().company_id, cid("PLAN-ID"));
        let second = hits[1].as_ref().unwrap();
        assert_eq!(second.company_id, cid("NAME-ID"));
        assert_eq!(second.source.label(), "name");
    }

    #[test]
    fn index_rows_below_threshold_are_ignored() {
        let repo = Arc::new(InMemoryMappingRepository::new());
        repo.upsert_index(vec![
            index_row(LookupType::CustomerName, "low", "L", 0.6),
            index_row(LookupType::CustomerName, "high", "H", 0.9),
        ])
        .unwrap();
        let service = CacheFirstEnrichmentService::new(repo.clone()).with_index(repo.clone());

        let hits = service
            .lookup_batch(&[request(None, Some("low")), request(None, Some("HIGH"))])
            .unwrap();
        assert!(hits[0].is_none());
        assert_eq!(hits[1].as_ref().unwrap().company_id, cid("H"));

        let key = IndexKey::new(LookupType::CustomerName, "high");
        assert_eq!(repo.lookup_index_batch(&[key.clone()]).unwrap()[&key].hit_count, 1);
    }

    #[test]
    fn plan_customer_key_wins_over_customer_name() {
        let repo = Arc::new(InMemoryMappingRepository::new());
        repo.upsert_index(vec![
            index_row(LookupType::CustomerName, "acme", "BY-NAME", 0.9),
            index_row(LookupType::PlanCustomer, "P9|acme", "BY-PAIR", 0.9),
        ])
        .unwrap();
        let service = CacheFirstEnrichmentService::new(repo.clone()).with_index(repo);

        let hits = service.lookup_batch(&[request(Some("P9"), Some("acme"))]).unwrap();
        let hit = hits[0].as_ref().unwrap();
        assert_eq!(hit.company_id, cid("BY-PAIR"));
        assert_eq!(hit.source.label(), "plan_customer");
    }

    #[test]
    fn blank_requests_miss() {
        let repo = Arc::new(InMemoryMappingRepository::new());
        let service = CacheFirstEnrichmentService::new(repo.clone()).with_index(repo);
        let hits = service.lookup_batch(&[request(Some("  "), None)]).unwrap();
        assert_eq!(hits, vec![None]);
    }
}
