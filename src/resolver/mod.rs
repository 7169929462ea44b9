//! Batch company-ID resolution.
//!
//! `CompanyIdResolver::resolve_batch` walks every row through a fixed
//! priority chain and stops at the first step that yields an ID:
//!
//! 1. plan override
//! 2. existing-ID column passthrough
//! 3. cache-first enrichment service
//! 4. external provider, bounded by the batch budget
//! 5. temp ID (or a null cell if temp IDs are disabled)
//!
//! Exactly one `ResolutionStatistics` partition counter moves per row.
//! Failures in steps 3 and 4 only turn the affected rows into misses for
//! that step; a missing required column aborts the whole batch up front.

mod context;
mod stats;
mod strategy;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use context::{PlanOverrideMap, ResolutionContext, ResolutionContextBuilder};
pub use stats::{ResolutionSource, ResolutionStatistics};
pub use strategy::ResolutionStrategy;

use crate::error::{ResolveError, ResolveResult};
use crate::mapping::CompanyId;
use crate::normalize::{is_blank, normalize_company_name};
use crate::provider::{EnterpriseInfoProvider, ProviderState};
use crate::queue::EnrichmentQueue;
use crate::service::{EnrichmentRequest, EnrichmentService};
use crate::table::{Column, Table};
use crate::temp_id::BLANK_NAME_SENTINEL;

/// Result of `resolve_batch`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionOutput {
    /// Input table plus the output column, rows in input order.
    pub table: Table,
    /// Partition and audit counters.
    pub statistics: ResolutionStatistics,
    /// Per-row provenance, aligned with the table rows.
    pub sources: Vec<ResolutionSource>,
    /// Run ID from the context.
    pub run_id: Uuid,
}

/// Columns of the input table, bound once per batch.
struct InputColumns<'a> {
    plan_code: &'a Column,
    customer_name: &'a Column,
    account_name: Option<&'a Column>,
    account_number: Option<&'a Column>,
    existing_id: Option<&'a Column>,
    disambiguator: Option<&'a Column>,
}

impl<'a> InputColumns<'a> {
    fn bind(table: &'a Table, strategy: &ResolutionStrategy) -> ResolveResult<Self> {
        let required = |name: &str| {
            table.column(name).ok_or_else(|| ResolveError::MissingColumn {
                column: name.to_string(),
            })
        };
        let optional = |name: Option<&String>, field: &'static str| {
            let name = name?;
            let column = table.column(name);
            if column.is_none() {
                tracing::warn!(field, column = %name, "configured column not in input; treating as empty");
            }
            column
        };

        Ok(Self {
            plan_code: required(&strategy.plan_code_column)?,
            customer_name: required(&strategy.customer_name_column)?,
            account_name: optional(strategy.account_name_column.as_ref(), "account_name_column"),
            account_number: optional(strategy.account_number_column.as_ref(), "account_number_column"),
            existing_id: optional(strategy.existing_id_column.as_ref(), "existing_id_column"),
            disambiguator: optional(
                strategy.blank_name_disambiguator_column.as_ref(),
                "blank_name_disambiguator_column",
            ),
        })
    }

    fn request(&self, row: usize) -> EnrichmentRequest {
        let cell = |c: Option<&Column>| c.and_then(|c| c.get(row)).map(str::to_string);
        EnrichmentRequest {
            plan_code: cell(Some(self.plan_code)),
            customer_name: cell(Some(self.customer_name)),
            account_name: cell(self.account_name),
            account_number: cell(self.account_number),
        }
    }

    /// Raw and normalized customer name; `None` for blank cells.
    fn name(&self, row: usize) -> Option<(&'a str, String)> {
        let raw = self.customer_name.get(row).filter(|v| !is_blank(Some(*v)))?;
        let normalized = normalize_company_name(raw);
        (!normalized.is_empty()).then_some((raw, normalized))
    }
}

/// Mutable state of one batch.
struct Batch {
    ids: Vec<Option<CompanyId>>,
    sources: Vec<Option<ResolutionSource>>,
    stats: ResolutionStatistics,
}

impl Batch {
    fn new(rows: usize) -> Self {
        Self {
            ids: vec![None; rows],
            sources: vec![None; rows],
            stats: ResolutionStatistics {
                total_rows: rows as u64,
                ..ResolutionStatistics::default()
            },
        }
    }

    fn settle(&mut self, row: usize, id: Option<CompanyId>, source: ResolutionSource) {
        self.ids[row] = id;
        self.sources[row] = Some(source);
        self.stats.record(source);
    }

    fn pending(&self) -> Vec<usize> {
        self.sources
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_none())
            .map(|(row, _)| row)
            .collect()
    }
}

/// Stateless orchestrator; all collaborators live in the context.
///
/// # Examples
///
/// ```
/// use company_id_resolver::resolver::{
///     CompanyIdResolver, PlanOverrideMap, ResolutionContext, ResolutionStrategy,
/// };
/// use company_id_resolver::Table;
///
/// let overrides = PlanOverrideMap::from_pairs("2024-01", &[("FP0001", "614810477")]).unwrap();
/// let context = ResolutionContext::builder().overrides(overrides).build();
/// let resolver = CompanyIdResolver::new(context);
///
/// let table = Table::from_rows(
///     &["plan_code", "customer_name"],
///     &[vec![Some("FP0001"), Some("公司A")]],
/// )
/// .unwrap();
/// let output = resolver.resolve_batch(&table, &ResolutionStrategy::default()).unwrap();
/// assert_eq!(output.table.value("company_id", 0), Some("614810477"));
/// assert_eq!(output.statistics.plan_override_hits, 1);
/// ```
#[derive(Debug, Clone, Default)]
pub struct CompanyIdResolver {
    context: ResolutionContext,
}

impl CompanyIdResolver {
    /// Wraps a context.
    #[must_use]
    pub const fn new(context: ResolutionContext) -> Self {
        Self { context }
    }

    /// Context the resolver was built with.
    #[must_use]
    pub const fn context(&self) -> &ResolutionContext {
        &self.context
    }

    /// Resolves every row of `table` and returns a copy with the output
    /// column set.
    ///
    /// # Errors
    ///
    /// - `ResolveError::Validation` if `strategy` is invalid
    /// - `ResolveError::MissingColumn` if the plan-code or customer-name
    ///   column is absent
    ///
    /// Both are raised before any row is processed. Cache and provider
    /// failures are not errors; they are counted in the statistics.
    pub fn resolve_batch(&self, table: &Table, strategy: &ResolutionStrategy) -> ResolveResult<ResolutionOutput> {
        strategy.validate()?;
        let columns = InputColumns::bind(table, strategy)?;
        let run_id = self.context.run_id();
        let rows = table.len();

        tracing::debug!(%run_id, rows, overrides = self.context.overrides().len(), "resolving batch");

        let mut batch = Batch::new(rows);
        self.apply_direct(&columns, &mut batch);

        if strategy.use_cache_lookup {
            if let Some(service) = self.context.service() {
                self.apply_service(service, &columns, &mut batch);
            }
        }

        if strategy.use_enrichment_service {
            if let Some(provider) = self.context.provider() {
                self.apply_provider(provider, strategy, &columns, &mut batch);
            }
        }

        self.apply_fallback(strategy, &columns, &mut batch);

        let observer = self.context.observer();
        for _ in 0..rows {
            observer.record_lookup();
        }
        if let Some(queue) = self.context.queue() {
            observer.set_queue_depth(queue.depth() as u64);
        }

        let Batch { ids, sources, stats } = batch;
        if !stats.is_consistent() {
            return Err(ResolveError::internal(format!(
                "statistics partition {} does not match {} rows",
                stats.partition_sum(),
                stats.total_rows
            )));
        }
        let sources: Vec<ResolutionSource> = sources
            .into_iter()
            .map(|s| s.unwrap_or(ResolutionSource::Unresolved))
            .collect();

        let mut out = table.clone();
        out.set_column(Column::new(
            strategy.output_column.clone(),
            ids.into_iter().map(|id| id.map(CompanyId::into_string)).collect(),
        ))?;

        tracing::info!(
            %run_id,
            rows,
            plan_override_hits = stats.plan_override_hits,
            existing_column_hits = stats.existing_column_hits,
            enrichment_service_hits = stats.enrichment_service_hits,
            temp_ids_generated = stats.temp_ids_generated,
            unresolved = stats.unresolved,
            sync_budget_used = stats.sync_budget_used,
            "batch resolved"
        );

        Ok(ResolutionOutput {
            table: out,
            statistics: stats,
            sources,
            run_id,
        })
    }

    /// Plan overrides, then the existing-ID column.
    fn apply_direct(&self, columns: &InputColumns<'_>, batch: &mut Batch) {
        let overrides = self.context.overrides();
        for row in 0..batch.ids.len() {
            let plan = columns.plan_code.get(row).filter(|p| !is_blank(Some(*p)));
            if let Some(id) = plan.and_then(|p| overrides.get(p)) {
                batch.settle(row, Some(id.clone()), ResolutionSource::PlanOverride);
                continue;
            }

            let existing = columns
                .existing_id
                .and_then(|c| c.get(row))
                .and_then(|v| CompanyId::new(v).ok());
            if let Some(id) = existing {
                batch.settle(row, Some(id), ResolutionSource::ExistingColumn);
            }
        }
    }

    fn apply_service(&self, service: &dyn EnrichmentService, columns: &InputColumns<'_>, batch: &mut Batch) {
        let pending = batch.pending();
        if pending.is_empty() {
            return;
        }
        let requests: Vec<EnrichmentRequest> = pending.iter().map(|&row| columns.request(row)).collect();

        let hits = match service.lookup_batch(&requests) {
            Ok(hits) => hits,
            Err(e) => {
                tracing::warn!(
                    run_id = %self.context.run_id(),
                    rows = pending.len(),
                    error = %e,
                    "cache lookup failed; rows fall through"
                );
                batch.stats.service_errors += pending.len() as u64;
                return;
            }
        };

        let observer = self.context.observer();
        for (row, hit) in pending.into_iter().zip(hits) {
            if let Some(hit) = hit {
                observer.record_cache_hit(hit.source.label());
                batch.settle(row, Some(hit.company_id), ResolutionSource::Cache);
            }
        }
    }

    /// Synchronous provider lookups, at most `min(sync_lookup_budget,
    /// remaining_budget)` calls. A name repeated within the batch is looked
    /// up once.
    fn apply_provider(
        &self,
        provider: &dyn EnterpriseInfoProvider,
        strategy: &ResolutionStrategy,
        columns: &InputColumns<'_>,
        batch: &mut Batch,
    ) {
        let pending = batch.pending();
        if pending.is_empty() {
            return;
        }

        let remaining_before = provider.remaining_budget();
        let failures_before = provider.failure_count();
        let allowance = strategy.sync_lookup_budget.min(remaining_before);
        let queue = if strategy.enqueue_unresolved {
            self.context.queue()
        } else {
            None
        };

        let mut calls = 0u32;
        let mut memo: HashMap<String, Option<CompanyId>> = HashMap::new();
        for row in pending {
            let Some((raw, normalized)) = columns.name(row) else {
                continue;
            };
            if let Some(known) = memo.get(&normalized) {
                if let Some(id) = known {
                    batch.settle(row, Some(id.clone()), ResolutionSource::Provider);
                }
                continue;
            }

            if provider.state() == ProviderState::Disabled {
                continue;
            }
            if calls >= allowance || !provider.state().is_active() {
                batch.stats.budget_exhausted += 1;
                if let Some(queue) = queue {
                    self.offer(queue, &normalized, raw, batch);
                }
                continue;
            }

            calls += 1;
            let found = provider.lookup(raw).map(|info| info.company_id);
            if let Some(id) = &found {
                batch.settle(row, Some(id.clone()), ResolutionSource::Provider);
            }
            memo.insert(normalized, found);
        }

        let spent = remaining_before.saturating_sub(provider.remaining_budget());
        batch.stats.sync_budget_used += u64::from(spent);
        batch.stats.provider_errors += provider.failure_count().saturating_sub(failures_before);
        self.context.observer().record_sync_budget_used(u64::from(spent));

        tracing::debug!(
            run_id = %self.context.run_id(),
            provider = provider.name(),
            calls,
            allowance,
            spent,
            state = %provider.state(),
            "provider pass complete"
        );
    }

    fn offer(&self, queue: &EnrichmentQueue, normalized: &str, raw: &str, batch: &mut Batch) {
        match queue.try_enqueue(normalized, raw) {
            Ok(true) => {
                batch.stats.async_queued += 1;
                self.context.observer().record_async_queued(1);
            }
            Ok(false) => {}
            Err(e) => tracing::warn!(name = %normalized, error = %e, "could not queue name for enrichment"),
        }
    }

    /// Temp IDs for whatever is left, or null cells.
    fn apply_fallback(&self, strategy: &ResolutionStrategy, columns: &InputColumns<'_>, batch: &mut Batch) {
        let generator = self.context.temp_ids();
        let observer = self.context.observer();
        for row in batch.pending() {
            if !strategy.generate_temp_ids {
                batch.settle(row, None, ResolutionSource::Unresolved);
                continue;
            }

            let normalized = columns.name(row).map(|(_, n)| n);
            let disambiguator = columns.disambiguator.and_then(|c| c.get(row));
            let id = generator.generate_with_disambiguator(normalized.as_deref().unwrap_or(""), disambiguator);
            observer.record_temp_id(normalized.as_deref().unwrap_or(BLANK_NAME_SENTINEL), &id);
            batch.settle(row, Some(id), ResolutionSource::TempId);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::confidence::Confidence;
    use crate::mapping::{sources, AliasMappingRecord, MatchType};
    use crate::provider::CompanyInfo;
    use crate::service::CacheFirstEnrichmentService;
    use crate::storage::{InMemoryMappingRepository, MappingRepository, StorageError};
    use crate::temp_id::TempIdGenerator;

    fn table(rows: &[(Option<&str>, Option<&str>)]) -> Table {
        let rows: Vec<Vec<Option<&str>>> = rows.iter().map(|(p, n)| vec![*p, *n]).collect();
        Table::from_rows(&["plan_code", "customer_name"], &rows).unwrap()
    }

    /// Resolves every name to `ID-<name>` while budget lasts.
    struct CountingProvider {
        budget: AtomicU32,
        calls: AtomicU32,
    }

    impl CountingProvider {
        fn new(budget: u32) -> Self {
            Self {
                budget: AtomicU32::new(budget),
                calls: AtomicU32::new(0),
            }
        }
    }

    impl EnterpriseInfoProvider for CountingProvider {
        fn lookup(&self, name: &str) -> Option<CompanyInfo> {
            if self.budget.load(Ordering::SeqCst) == 0 {
                return None;
            }
            self.budget.fetch_sub(1, Ordering::SeqCst);
            self.calls.fetch_add(1, Ordering::SeqCst);
            Some(CompanyInfo {
                company_id: CompanyId::new(format!("ID-{name}")).unwrap(),
                official_name: name.to_string(),
                unified_credit_code: None,
                confidence: Confidence::one(),
                match_type: None,
            })
        }

        fn remaining_budget(&self) -> u32 {
            self.budget.load(Ordering::SeqCst)
        }

        fn state(&self) -> ProviderState {
            if self.remaining_budget() == 0 {
                ProviderState::BudgetExhausted
            } else {
                ProviderState::Active
            }
        }

        fn name(&self) -> &'static str {
            "counting"
        }
    }

    struct FailingService;

    impl EnrichmentService for FailingService {
        fn lookup_batch(
            &self,
            _requests: &[EnrichmentRequest],
        ) -> Result<Vec<Option<crate::service::ServiceHit>>, StorageError> {
            Err(StorageError::ConnectionError("down".to_string()))
        }
    }

    #[test]
    fn missing_required_column_fails_before_any_row() {
        let observer = Arc::new(crate::observer::EnrichmentObserver::new());
        let resolver = CompanyIdResolver::new(ResolutionContext::builder().observer(observer.clone()).build());
        let input = Table::from_rows(&["customer_name"], &[vec![Some("acme")]]).unwrap();

        let err = resolver.resolve_batch(&input, &ResolutionStrategy::default()).unwrap_err();
        assert!(matches!(err, ResolveError::MissingColumn { ref column } if column == "plan_code"));
        assert!(err.is_fatal_config());
        assert_eq!(observer.stats().total_lookups, 0);
    }

    #[test]
    fn override_beats_existing_column() {
        let overrides = PlanOverrideMap::from_pairs("v1", &[("P1", "OVR")]).unwrap();
        let resolver = CompanyIdResolver::new(ResolutionContext::builder().overrides(overrides).build());
        let input = Table::from_rows(
            &["plan_code", "customer_name", "existing"],
            &[
                vec![Some("P1"), Some("a"), Some("EXIST-1")],
                vec![Some("P2"), Some("b"), Some("EXIST-2")],
                vec![Some("P3"), Some("c"), Some("  ")],
            ],
        )
        .unwrap();
        let strategy = ResolutionStrategy::default().with_existing_id_column("existing");

        let out = resolver.resolve_batch(&input, &strategy).unwrap();
        assert_eq!(out.table.value("company_id", 0), Some("OVR"));
        assert_eq!(out.table.value("company_id", 1), Some("EXIST-2"));
        assert!(out.table.value("company_id", 2).unwrap().starts_with("IN_"));
        assert_eq!(
            out.sources,
            vec![
                ResolutionSource::PlanOverride,
                ResolutionSource::ExistingColumn,
                ResolutionSource::TempId
            ]
        );
        assert!(out.statistics.is_consistent());
    }

    #[test]
    fn cache_hits_are_counted_by_match_type() {
        let repo = Arc::new(InMemoryMappingRepository::new());
        repo.insert_batch(vec![AliasMappingRecord::new(
            "acme",
            CompanyId::new("CACHED").unwrap(),
            MatchType::Name,
            sources::MANUAL,
        )
        .unwrap()])
        .unwrap();
        let observer = Arc::new(crate::observer::EnrichmentObserver::new());
        let context = ResolutionContext::builder()
            .service(Arc::new(CacheFirstEnrichmentService::new(repo)))
            .observer(observer.clone())
            .build();

        let out = CompanyIdResolver::new(context)
            .resolve_batch(&table(&[(None, Some("ACME Co., Ltd."))]), &ResolutionStrategy::default())
            .unwrap();
        assert_eq!(out.table.value("company_id", 0), Some("CACHED"));
        assert_eq!(out.statistics.cache_hits, 1);
        assert_eq!(observer.stats().cache_hits_by_type.get("name"), Some(&1));
    }

    #[test]
    fn cache_failure_degrades_to_temp_ids() {
        let context = ResolutionContext::builder().service(Arc::new(FailingService)).build();
        let out = CompanyIdResolver::new(context)
            .resolve_batch(&table(&[(None, Some("a")), (None, Some("b"))]), &ResolutionStrategy::default())
            .unwrap();
        assert_eq!(out.statistics.service_errors, 2);
        assert_eq!(out.statistics.temp_ids_generated, 2);
    }

    #[test]
    fn provider_calls_are_bounded_and_deduplicated() {
        let provider = Arc::new(CountingProvider::new(10));
        let context = ResolutionContext::builder().provider(provider.clone()).build();
        let input = table(&[
            (None, Some("a")),
            (None, Some("A ")),
            (None, Some("b")),
            (None, Some("c")),
        ]);
        let strategy = ResolutionStrategy::default().with_provider_budget(2);

        let out = CompanyIdResolver::new(context).resolve_batch(&input, &strategy).unwrap();
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
        assert_eq!(out.statistics.provider_hits, 3);
        assert_eq!(out.statistics.sync_budget_used, 2);
        assert_eq!(out.statistics.budget_exhausted, 1);
        assert_eq!(out.sources[3], ResolutionSource::TempId);
        assert!(out.statistics.is_consistent());
    }

    #[test]
    fn budget_exhausted_names_are_queued_once() {
        let provider = Arc::new(CountingProvider::new(0));
        let queue = Arc::new(EnrichmentQueue::new(8));
        let context = ResolutionContext::builder()
            .provider(provider)
            .queue(queue.clone())
            .build();
        let mut strategy = ResolutionStrategy::default().with_provider_budget(5);
        strategy.enqueue_unresolved = true;

        let out = CompanyIdResolver::new(context)
            .resolve_batch(&table(&[(None, Some("x")), (None, Some("x")), (None, Some("  "))]), &strategy)
            .unwrap();
        assert_eq!(out.statistics.async_queued, 1);
        assert_eq!(out.statistics.budget_exhausted, 2);
        assert_eq!(queue.depth(), 1);
    }

    #[test]
    fn temp_ids_can_be_disabled() {
        let strategy = ResolutionStrategy {
            generate_temp_ids: false,
            ..ResolutionStrategy::default()
        };
        let out = CompanyIdResolver::default()
            .resolve_batch(&table(&[(Some("P"), Some("acme"))]), &strategy)
            .unwrap();
        assert_eq!(out.table.value("company_id", 0), None);
        assert_eq!(out.statistics.unresolved, 1);
    }

    #[test]
    fn blank_names_can_be_disambiguated() {
        let input = table(&[(Some("P1"), None), (Some("P2"), Some(" "))]);
        let shared = CompanyIdResolver::default()
            .resolve_batch(&input, &ResolutionStrategy::default())
            .unwrap();
        assert_eq!(shared.table.value("company_id", 0), shared.table.value("company_id", 1));

        let strategy = ResolutionStrategy {
            blank_name_disambiguator_column: Some("plan_code".to_string()),
            ..ResolutionStrategy::default()
        };
        let split = CompanyIdResolver::default().resolve_batch(&input, &strategy).unwrap();
        assert_ne!(split.table.value("company_id", 0), split.table.value("company_id", 1));
    }

    #[test]
    fn output_column_replaces_existing() {
        let input = Table::from_rows(
            &["plan_code", "customer_name", "company_id"],
            &[vec![None, Some("acme"), Some("stale")]],
        )
        .unwrap();
        let out = CompanyIdResolver::default()
            .resolve_batch(&input, &ResolutionStrategy::default())
            .unwrap();
        assert_eq!(out.table.column_names().count(), 3);
        assert_eq!(
            out.table.value("company_id", 0),
            Some(TempIdGenerator::new().generate("acme").as_str())
        );
    }
}
