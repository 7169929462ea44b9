//! Resolution statistics and per-row provenance.

use serde::{Deserialize, Serialize};

/// Where a row's output came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionSource {
    /// Plan override.
    PlanOverride,
    /// Taken from the existing ID column.
    ExistingColumn,
    /// Answered by the cache-first enrichment service.
    Cache,
    /// Answered by the external provider during this batch.
    Provider,
    /// Deterministic temp ID.
    TempId,
    /// Left empty: no source answered and temp IDs are off.
    Unresolved,
}

/// Counters for one batch.
///
/// The first five fields partition the rows: exactly one of them is
/// incremented per row. The rest are audit counters and overlap freely.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionStatistics {
    /// Plan override hits.
    pub plan_override_hits: u64,
    /// Existing column hits.
    pub existing_column_hits: u64,
    /// Cache or provider answers.
    pub enrichment_service_hits: u64,
    /// Rows given a temp ID.
    pub temp_ids_generated: u64,
    /// Rows left empty.
    pub unresolved: u64,

    /// Rows in the batch.
    pub total_rows: u64,
    /// Subset of `enrichment_service_hits` answered from cache.
    pub cache_hits: u64,
    /// Subset of `enrichment_service_hits` answered by the provider.
    pub provider_hits: u64,
    /// Provider budget units spent by this batch.
    pub sync_budget_used: u64,
    /// Rows that skipped the provider because no budget was left.
    pub budget_exhausted: u64,
    /// Names newly handed to the enrichment queue.
    pub async_queued: u64,
    /// Rows whose cache lookup failed with a storage error.
    pub service_errors: u64,
    /// Provider lookups that failed.
    pub provider_errors: u64,
}

impl ResolutionStatistics {
    pub(crate) fn record(&mut self, source: ResolutionSource) {
        match source {
            ResolutionSource::PlanOverride => self.plan_override_hits += 1,
            ResolutionSource::ExistingColumn => self.existing_column_hits += 1,
            ResolutionSource::Cache => {
                self.enrichment_service_hits += 1;
                self.cache_hits += 1;
            }
            ResolutionSource::Provider => {
                self.enrichment_service_hits += 1;
                self.provider_hits += 1;
            }
            ResolutionSource::TempId => self.temp_ids_generated += 1,
            ResolutionSource::Unresolved => self.unresolved += 1,
        }
    }

    /// Sum of the partition counters.
    #[must_use]
    pub const fn partition_sum(&self) -> u64 {
        self.plan_override_hits
            + self.existing_column_hits
            + self.enrichment_service_hits
            + self.temp_ids_generated
            + self.unresolved
    }

    /// True if the partition counters add up to `total_rows`.
    #[must_use]
    pub const fn is_consistent(&self) -> bool {
        self.partition_sum() == self.total_rows
    }

    /// Share of rows resolved to a real (non-temp) ID.
    #[must_use]
    pub fn resolution_rate(&self) -> f64 {
        if self.total_rows == 0 {
            return 0.0;
        }
        let resolved = self.plan_override_hits + self.existing_column_hits + self.enrichment_service_hits;
        resolved as f64 / self.total_rows as f64
    }

    /// Machine-readable form.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}
