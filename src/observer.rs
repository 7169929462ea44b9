//! Enrichment observability.
//!
//! `EnrichmentObserver` collects run counters and the registry of names that
//! ended up with a temp ID. It is shared (`Arc`) between the resolver, the
//! provider and any backfill worker, so every method takes `&self`.

use std::collections::{BTreeMap, HashMap};
use std::io::{self, Write};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::mapping::CompanyId;

/// A name that could not be resolved to a real company ID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnknownCompany {
    /// Normalized name.
    pub name: String,
    /// First temp ID assigned to the name.
    pub temp_id: CompanyId,
    /// When the name first fell back.
    pub first_seen: DateTime<Utc>,
    /// Times this name fell back to a temp ID.
    pub occurrence_count: u64,
    // Insertion order; breaks ties between identical `first_seen` stamps.
    #[serde(skip)]
    seq: u64,
}

/// Counter values at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichmentStats {
    /// Rows looked up, one per resolved row.
    pub total_lookups: u64,
    /// Cache hits.
    pub cache_hits: u64,
    /// Cache hits broken down by the match or lookup type that answered.
    pub cache_hits_by_type: BTreeMap<String, u64>,
    /// Temp IDs handed out, repeats included.
    pub temp_ids_generated: u64,
    /// Real provider requests, retries included.
    pub api_calls: u64,
    /// Budget units spent by synchronous lookups.
    pub sync_budget_used: u64,
    /// Names offered to the async queue and accepted.
    pub async_queued: u64,
    /// Queue depth after the last batch.
    pub queue_depth_after: u64,
}

/// Serializable view of the observer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObserverSnapshot {
    /// Counter values.
    pub stats: EnrichmentStats,
    /// Most frequent first.
    pub unknown_companies: Vec<UnknownCompany>,
    /// When the snapshot was taken.
    pub taken_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct ObserverState {
    stats: EnrichmentStats,
    unknown: HashMap<String, UnknownCompany>,
    next_seq: u64,
}

/// Thread-safe counters plus the unknown-companies registry.
///
/// # Examples
///
/// ```
/// use company_id_resolver::{EnrichmentObserver, TempIdGenerator};
///
/// let observer = EnrichmentObserver::new();
/// let id = TempIdGenerator::new().generate("acme");
/// for _ in 0..3 {
///     observer.record_temp_id("acme", &id);
/// }
/// let unknown = observer.unknown_companies();
/// assert_eq!(unknown.len(), 1);
/// assert_eq!(unknown[0].occurrence_count, 3);
/// ```
#[derive(Debug, Default)]
pub struct EnrichmentObserver {
    state: Mutex<ObserverState>,
}

impl EnrichmentObserver {
    /// Creates an empty observer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // Counters stay meaningful after a panic elsewhere, so poisoning is ignored.
    fn state(&self) -> MutexGuard<'_, ObserverState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Counts one row entering the lookup pipeline.
    pub fn record_lookup(&self) {
        self.state().stats.total_lookups += 1;
    }

    /// Counts a cache hit answered by `match_type`.
    pub fn record_cache_hit(&self, match_type: &str) {
        let mut state = self.state();
        state.stats.cache_hits += 1;
        *state
            .stats
            .cache_hits_by_type
            .entry(match_type.to_string())
            .or_insert(0) += 1;
    }

    /// Counts one HTTP request to the provider (retries included).
    pub fn record_api_call(&self) {
        self.state().stats.api_calls += 1;
    }

    /// Adds budget units spent by synchronous lookups.
    pub fn record_sync_budget_used(&self, units: u64) {
        self.state().stats.sync_budget_used += units;
    }

    /// Adds names handed to the async enrichment queue.
    pub fn record_async_queued(&self, count: u64) {
        self.state().stats.async_queued += count;
    }

    /// Records the queue depth observed at the end of a run.
    pub fn set_queue_depth(&self, depth: u64) {
        self.state().stats.queue_depth_after = depth;
    }

    /// Registers a temp-ID assignment for `name`.
    ///
    /// Repeated calls for the same name increment `occurrence_count`; the
    /// first temp ID and `first_seen` are kept.
    pub fn record_temp_id(&self, name: &str, temp_id: &CompanyId) {
        let mut state = self.state();
        state.stats.temp_ids_generated += 1;

        let seq = state.next_seq;
        let mut inserted = false;
        state
            .unknown
            .entry(name.to_string())
            .and_modify(|entry| entry.occurrence_count += 1)
            .or_insert_with(|| {
                inserted = true;
                UnknownCompany {
                    name: name.to_string(),
                    temp_id: temp_id.clone(),
                    first_seen: Utc::now(),
                    occurrence_count: 1,
                    seq,
                }
            });
        if inserted {
            state.next_seq += 1;
        }
    }

    /// Current counter values.
    #[must_use]
    pub fn stats(&self) -> EnrichmentStats {
        self.state().stats.clone()
    }

    /// Unknown companies, most frequent first.
    ///
    /// Ties are broken by `first_seen` (earlier first), then by name.
    #[must_use]
    pub fn unknown_companies(&self) -> Vec<UnknownCompany> {
        let mut out: Vec<UnknownCompany> = self.state().unknown.values().cloned().collect();
        out.sort_by(|a, b| {
            b.occurrence_count
                .cmp(&a.occurrence_count)
                .then_with(|| a.first_seen.cmp(&b.first_seen))
                .then_with(|| a.seq.cmp(&b.seq))
                .then_with(|| a.name.cmp(&b.name))
        });
        out
    }

    /// Counters and registry in one serializable value.
    #[must_use]
    pub fn snapshot(&self) -> ObserverSnapshot {
        ObserverSnapshot {
            stats: self.stats(),
            unknown_companies: self.unknown_companies(),
            taken_at: Utc::now(),
        }
    }

    /// Clears all counters and the registry.
    pub fn reset(&self) {
        *self.state() = ObserverState::default();
    }

    /// Writes the registry as CSV (`name,temp_id,first_seen,occurrence_count`).
    ///
    /// The header row is written even when the registry is empty.
    ///
    /// # Errors
    ///
    /// Propagates write errors from `writer`.
    pub fn write_unknown_companies_csv<W: Write>(&self, writer: W) -> io::Result<usize> {
        let rows = self.unknown_companies();
        let mut out = csv::WriterBuilder::new().has_headers(false).from_writer(writer);
        out.write_record(CSV_HEADER)?;
        for row in &rows {
            out.serialize(row)?;
        }
        out.flush()?;
        Ok(rows.len())
    }
}

const CSV_HEADER: [&str; 4] = ["name", "temp_id", "first_seen", "occurrence_count"];

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;
    use crate::temp_id::TempIdGenerator;

    fn temp(name: &str) -> CompanyId {
        TempIdGenerator::new().generate(name)
    }

    #[test]
    fn repeated_names_increment_count() {
        let obs = EnrichmentObserver::new();
        for _ in 0..3 {
            obs.record_temp_id("公司A", &temp("公司a"));
        }
        let unknown = obs.unknown_companies();
        assert_eq!(unknown.len(), 1);
        assert_eq!(unknown[0].occurrence_count, 3);
        assert_eq!(obs.stats().temp_ids_generated, 3);
    }

    #[test]
    fn unknown_companies_sorted_by_count_then_first_seen() {
        let obs = EnrichmentObserver::new();
        obs.record_temp_id("first", &temp("first"));
        obs.record_temp_id("second", &temp("second"));
        obs.record_temp_id("busy", &temp("busy"));
        obs.record_temp_id("busy", &temp("busy"));

        let names: Vec<String> = obs.unknown_companies().into_iter().map(|u| u.name).collect();
        assert_eq!(names, vec!["busy", "first", "second"]);
    }

    #[test]
    fn cache_hits_are_broken_down_by_type() {
        let obs = EnrichmentObserver::new();
        obs.record_cache_hit("plan");
        obs.record_cache_hit("name");
        obs.record_cache_hit("name");

        let stats = obs.stats();
        assert_eq!(stats.cache_hits, 3);
        assert_eq!(stats.cache_hits_by_type["name"], 2);
    }

    #[test]
    fn reset_clears_everything() {
        let obs = EnrichmentObserver::new();
        obs.record_api_call();
        obs.record_temp_id("x", &temp("x"));
        obs.reset();
        assert_eq!(obs.stats(), EnrichmentStats::default());
        assert!(obs.unknown_companies().is_empty());
    }

    #[test]
    fn concurrent_recording_loses_nothing() {
        let obs = Arc::new(EnrichmentObserver::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let obs = Arc::clone(&obs);
                thread::spawn(move || {
                    for _ in 0..250 {
                        obs.record_lookup();
                        obs.record_temp_id("shared", &temp("shared"));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(obs.stats().total_lookups, 2000);
        assert_eq!(obs.unknown_companies()[0].occurrence_count, 2000);
    }

    #[test]
    fn csv_export_quotes_fields() {
        let obs = EnrichmentObserver::new();
        obs.record_temp_id("Acme, \"Intl\"", &temp("acme"));

        let mut buf = Vec::new();
        assert_eq!(obs.write_unknown_companies_csv(&mut buf).unwrap(), 1);
        let text = String::from_utf8(buf).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("name,temp_id,first_seen,occurrence_count"));
        assert!(lines.next().unwrap().starts_with("\"Acme, \"\"Intl\"\"\",IN_"));
    }

    #[test]
    fn csv_export_reads_back_and_keeps_header_when_empty() {
        let obs = EnrichmentObserver::new();
        let mut empty = Vec::new();
        assert_eq!(obs.write_unknown_companies_csv(&mut empty).unwrap(), 0);
        assert_eq!(String::from_utf8(empty).unwrap().trim_end(), CSV_HEADER.join(","));

        obs.record_temp_id("平安, 上海\n分公司", &temp("平安"));
        obs.record_temp_id("平安, 上海\n分公司", &temp("平安"));
        let mut buf = Vec::new();
        obs.write_unknown_companies_csv(&mut buf).unwrap();

        let mut reader = csv::Reader::from_reader(buf.as_slice());
        let records: Vec<csv::StringRecord> = reader.records().map(Result::unwrap).collect();
        assert_eq!(records.len(), 1);
        assert_eq!(&records[0][0], "平安, 上海\n分公司");
        assert_eq!(&records[0][1], temp("平安").as_str());
        assert_eq!(&records[0][3], "2");
    }

    #[test]
    fn snapshot_serializes() {
        let obs = EnrichmentObserver::new();
        obs.record_temp_id("x", &temp("x"));
        let json = serde_json::to_value(obs.snapshot()).unwrap();
        assert_eq!(json["stats"]["temp_ids_generated"], 1);
        assert_eq!(json["unknown_companies"][0]["occurrence_count"], 1);
    }
}
