//! EQC enterprise-information provider.
//!
//! State machine:
//!
//! ```text
//!            budget hits 0             reset_budget(n > 0)
//!   Active ──────────────▶ BudgetExhausted ──────────────▶ Active
//!     │
//!     │ 401 Unauthorized               reset_disabled()
//!     └──────────────────▶ Disabled ─────────────────────▶ Active
//! ```
//!
//! Outside `Active` a lookup returns `None` without touching the network.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::confidence::{Confidence, ConfidenceTable};
use crate::error::ValidationError;
use crate::mapping::{
    sources, AliasMappingRecord, CompanyId, EnrichmentIndexRecord, IndexKey, LookupType, MatchType,
};
use crate::normalize::normalize_company_name;
use crate::observer::EnrichmentObserver;
use crate::storage::{EnrichmentIndexStore, MappingRepository};

use super::retry::{saturating_millis, RetryPolicy};
use super::transport::{EqcTransport, HttpEqcTransport, SearchCandidate, DEFAULT_EQC_BASE_URL};
use super::{CompanyInfo, EnterpriseInfoProvider, ProviderState};

/// Minimum confidence for a lookup to be written to the alias table.
pub const DEFAULT_CACHE_THRESHOLD: f32 = 0.80;

const DEFAULT_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_BUDGET: u32 = 100;
const SOURCE_DOMAIN: &str = "eqc";

/// Provider configuration.
///
/// `cache_threshold` and `confidence_table` are optional in serialized form;
/// when absent the defaults are used and a warning is logged.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EqcConfig {
    /// Provider root URL, without a trailing slash.
    pub base_url: String,
    /// Bearer token. Never serialized.
    #[serde(skip_serializing)]
    pub token: Option<String>,
    /// Per-request timeout.
    pub timeout_ms: u64,
    /// Retry schedule for transient failures.
    pub retry: RetryPolicy,
    /// Minimum confidence for write-through caching.
    #[serde(default)]
    pub cache_threshold: Option<f32>,
    /// Indicator to confidence mapping.
    #[serde(default)]
    pub confidence_table: Option<ConfidenceTable>,
    /// Real lookups allowed for this provider instance.
    pub budget: u32,
}

impl fmt::Debug for EqcConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EqcConfig")
            .field("base_url", &self.base_url)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("timeout_ms", &self.timeout_ms)
            .field("retry", &self.retry)
            .field("cache_threshold", &self.cache_threshold)
            .field("confidence_table", &self.confidence_table)
            .field("budget", &self.budget)
            .finish()
    }
}

impl Default for EqcConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_EQC_BASE_URL.to_string(),
            token: None,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            retry: RetryPolicy::default(),
            cache_threshold: Some(DEFAULT_CACHE_THRESHOLD),
            confidence_table: Some(ConfidenceTable::default()),
            budget: DEFAULT_BUDGET,
        }
    }
}

impl EqcConfig {
    const MAX_TIMEOUT_MS: u64 = 60_000;

    /// Defaults overlaid with `EQC_API_TOKEN` and `EQC_API_BASE_URL`.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(token) = std::env::var("EQC_API_TOKEN") {
            if !token.trim().is_empty() {
                config.token = Some(token.trim().to_string());
            }
        }
        if let Ok(url) = std::env::var("EQC_API_BASE_URL") {
            if !url.trim().is_empty() {
                config.base_url = url.trim().to_string();
            }
        }
        config
    }

    /// Sets the token.
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Sets the budget.
    #[must_use]
    pub fn with_budget(mut self, budget: u32) -> Self {
        self.budget = budget;
        self
    }

    /// Checks the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::InvalidConfig` for an empty base URL, a
    /// timeout outside `1..=60000` ms, an invalid retry policy, or a
    /// threshold outside `[0, 1]`.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.base_url.trim().is_empty() {
            return Err(ValidationError::InvalidConfig {
                reason: "eqc.base_url must not be empty".to_string(),
            });
        }
        if self.timeout_ms == 0 || self.timeout_ms > Self::MAX_TIMEOUT_MS {
            return Err(ValidationError::InvalidConfig {
                reason: format!(
                    "eqc.timeout_ms must be in 1..={} (got {})",
                    Self::MAX_TIMEOUT_MS,
                    self.timeout_ms
                ),
            });
        }
        self.retry.validate()?;
        if let Some(threshold) = self.cache_threshold {
            Confidence::new(threshold).map_err(|_| ValidationError::InvalidConfig {
                reason: format!("eqc.cache_threshold must be in [0, 1] (got {threshold})"),
            })?;
        }
        Ok(())
    }

    fn resolved_threshold(&self) -> Result<Confidence, ValidationError> {
        match self.cache_threshold {
            Some(v) => Confidence::new(v),
            None => {
                tracing::warn!(
                    default = DEFAULT_CACHE_THRESHOLD,
                    "eqc.cache_threshold not configured; using default"
                );
                Confidence::new(DEFAULT_CACHE_THRESHOLD)
            }
        }
    }

    fn resolved_table(&self) -> ConfidenceTable {
        self.confidence_table.clone().unwrap_or_else(|| {
            tracing::warn!("eqc.confidence_table not configured; using default table");
            ConfidenceTable::default()
        })
    }
}

/// Budget-limited EQC client with retry, disablement and write-through
/// caching.
pub struct EqcProvider {
    transport: Arc<dyn EqcTransport>,
    token: Option<String>,
    timeout: Duration,
    retry: RetryPolicy,
    table: ConfidenceTable,
    threshold: Confidence,
    remaining: AtomicU32,
    disabled: AtomicBool,
    requests: AtomicU64,
    failures: AtomicU64,
    repository: Option<Arc<dyn MappingRepository>>,
    index: Option<Arc<dyn EnrichmentIndexStore>>,
    observer: Option<Arc<EnrichmentObserver>>,
}

impl fmt::Debug for EqcProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EqcProvider")
            .field("state", &self.state())
            .field("remaining_budget", &self.remaining_budget())
            .field("threshold", &self.threshold)
            .field("requests", &self.requests_sent())
            .finish_non_exhaustive()
    }
}

impl EqcProvider {
    /// Creates a provider over an explicit transport.
    ///
    /// # Errors
    ///
    /// Returns the configuration's validation error.
    pub fn new(config: EqcConfig, transport: Arc<dyn EqcTransport>) -> Result<Self, ValidationError> {
        config.validate()?;
        let threshold = config.resolved_threshold()?;
        let table = config.resolved_table();

        Ok(Self {
            transport,
            token: config.token.filter(|t| !t.trim().is_empty()),
            timeout: Duration::from_millis(config.timeout_ms),
            retry: config.retry,
            table,
            threshold,
            remaining: AtomicU32::new(config.budget),
            disabled: AtomicBool::new(false),
            requests: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            repository: None,
            index: None,
            observer: None,
        })
    }

    /// Creates a provider over the blocking HTTP transport.
    ///
    /// # Errors
    ///
    /// Returns a validation error for bad configuration or if the HTTP
    /// client cannot be built.
    pub fn http(config: EqcConfig) -> Result<Self, ValidationError> {
        let transport =
            HttpEqcTransport::new(config.base_url.clone()).map_err(|e| ValidationError::InvalidConfig {
                reason: format!("eqc transport: {e}"),
            })?;
        Self::new(config, Arc::new(transport))
    }

    /// Writes confident results to the alias table.
    #[must_use]
    pub fn with_repository(mut self, repository: Arc<dyn MappingRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    /// Writes every result to the enrichment index.
    #[must_use]
    pub fn with_index(mut self, index: Arc<dyn EnrichmentIndexStore>) -> Self {
        self.index = Some(index);
        self
    }

    /// Reports each HTTP request to `observer`.
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<EnrichmentObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Restores the budget; a `BudgetExhausted` provider becomes `Active`.
    pub fn reset_budget(&self, budget: u32) {
        self.remaining.store(budget, Ordering::Release);
        tracing::info!(budget, "eqc budget reset");
    }

    /// Clears disablement after the credentials were fixed.
    pub fn reset_disabled(&self) {
        self.disabled.store(false, Ordering::Release);
        tracing::info!("eqc provider re-enabled");
    }

    /// HTTP requests sent so far, including retries.
    #[must_use]
    pub fn requests_sent(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    /// Threshold used for alias write-through.
    #[must_use]
    pub const fn cache_threshold(&self) -> Confidence {
        self.threshold
    }

    fn reserve_budget(&self) -> bool {
        self.remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |b| b.checked_sub(1))
            .is_ok()
    }

    fn search_with_retry(&self, query: &str, token: &str) -> Option<Vec<SearchCandidate>> {
        let mut attempt = 0;
        loop {
            self.requests.fetch_add(1, Ordering::Relaxed);
            if let Some(observer) = &self.observer {
                observer.record_api_call();
            }

            match self.transport.search(query, token, self.timeout) {
                Ok(candidates) => return Some(candidates),
                Err(e) if e.is_unauthorized() => {
                    self.disabled.store(true, Ordering::Release);
                    self.failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        provider = "eqc",
                        "credentials rejected; provider disabled until reset"
                    );
                    return None;
                }
                Err(e) if self.retry.should_retry(attempt, &e) => {
                    let delay = self.retry.delay_for(attempt);
                    tracing::debug!(
                        attempt,
                        error = %e,
                        delay_ms = saturating_millis(delay),
                        "retrying eqc search"
                    );
                    thread::sleep(delay);
                    attempt += 1;
                }
                Err(e) => {
                    self.failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(name = %query, attempt, error = %e, "eqc search failed");
                    return None;
                }
            }
        }
    }

    fn write_through(&self, query: &str, info: &CompanyInfo) {
        let normalized = normalize_company_name(query);
        if normalized.is_empty() {
            return;
        }

        if let Some(repository) = &self.repository {
            if info.confidence.meets(self.threshold) {
                let written = AliasMappingRecord::new(
                    normalized.clone(),
                    info.company_id.clone(),
                    MatchType::Name,
                    sources::EQC_API,
                )
                .map_err(Into::into)
                .and_then(|record| repository.insert_batch_with_conflict_check(vec![record]));

                match written {
                    Ok(report) => {
                        for conflict in &report.conflicts {
                            tracing::warn!(%conflict, "eqc result conflicts with stored mapping");
                        }
                    }
                    Err(e) => {
                        tracing::warn!(alias = %normalized, error = %e, "failed to cache eqc result");
                    }
                }
            } else {
                tracing::debug!(
                    alias = %normalized,
                    confidence = %info.confidence,
                    threshold = %self.threshold,
                    "eqc result below cache threshold"
                );
            }
        }

        if let Some(index) = &self.index {
            let upserted = EnrichmentIndexRecord::new(
                IndexKey::new(LookupType::CustomerName, normalized.clone()),
                info.company_id.clone(),
                info.confidence,
                sources::EQC_API,
            )
            .map(|r| r.with_source_domain(SOURCE_DOMAIN))
            .map_err(Into::into)
            .and_then(|record| index.upsert_index(vec![record]));

            if let Err(e) = upserted {
                tracing::warn!(key = %normalized, error = %e, "failed to index eqc result");
            }
        }
    }
}

impl EnterpriseInfoProvider for EqcProvider {
    fn lookup(&self, name: &str) -> Option<CompanyInfo> {
        let query = name.trim();
        if query.is_empty() {
            return None;
        }
        if self.disabled.load(Ordering::Acquire) {
            return None;
        }
        if self.remaining.load(Ordering::Acquire) == 0 {
            return None;
        }
        let Some(token) = self.token.as_deref() else {
            tracing::debug!("no eqc token configured; skipping lookup");
            return None;
        };
        if !self.reserve_budget() {
            return None;
        }

        let candidates = self.search_with_retry(query, token)?;
        let Some(best) = candidates.into_iter().next() else {
            tracing::debug!(name = %query, "eqc returned no candidates");
            return None;
        };

        let company_id = match CompanyId::new(best.company_id) {
            Ok(id) => id,
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(name = %query, error = %e, "eqc candidate without company id");
                return None;
            }
        };

        let info = CompanyInfo {
            company_id,
            official_name: best.official_name,
            unified_credit_code: best.credit_code,
            confidence: self.table.score(best.match_quality.as_deref()),
            match_type: best.match_quality,
        };
        self.write_through(query, &info);
        Some(info)
    }

    fn remaining_budget(&self) -> u32 {
        self.remaining.load(Ordering::Acquire)
    }

    fn state(&self) -> ProviderState {
        if self.disabled.load(Ordering::Acquire) {
            ProviderState::Disabled
        } else if self.remaining.load(Ordering::Acquire) == 0 {
            ProviderState::BudgetExhausted
        } else {
            ProviderState::Active
        }
    }

    fn name(&self) -> &'static str {
        "eqc"
    }

    fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashSet, VecDeque};
    use std::sync::Mutex;

    use super::*;
    use crate::confidence::{EXACT_MATCH_INDICATOR, PHONETIC_MATCH_INDICATOR};
    use crate::error::TransportError;
    use crate::storage::InMemoryMappingRepository;

    type Reply = Result<Vec<SearchCandidate>, TransportError>;

    /// Replays canned replies; repeats the last one when the script runs out.
    struct ScriptedTransport {
        replies: Mutex<VecDeque<Reply>>,
        last: Reply,
        calls: AtomicU64,
    }

    impl ScriptedTransport {
        fn new(replies: Vec<Reply>) -> Arc<Self> {
            let last = replies.last().cloned().unwrap_or(Ok(Vec::new()));
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                last,
                calls: AtomicU64::new(0),
            })
        }

        fn calls(&self) -> u64 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl EqcTransport for ScriptedTransport {
        fn search(&self, _: &str, _: &str, _: Duration) -> Reply {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| self.last.clone())
        }
    }

    fn hit(id: &str, quality: &str) -> Reply {
        Ok(vec![SearchCandidate {
            company_id: id.to_string(),
            official_name: "中国平安保险(集团)股份有限公司".to_string(),
            credit_code: Some("91440300100012316L".to_string()),
            match_quality: Some(quality.to_string()),
        }])
    }

    fn config(budget: u32) -> EqcConfig {
        EqcConfig {
            retry: RetryPolicy {
                max_retries: 2,
                base_delay_ms: 0,
                max_delay_ms: 0,
            },
            ..EqcConfig::default()
        }
        .with_token("test-token")
        .with_budget(budget)
    }

    fn provider(budget: u32, transport: Arc<ScriptedTransport>) -> EqcProvider {
        EqcProvider::new(config(budget), transport).unwrap()
    }

    #[test]
    fn exact_match_scores_one() {
        let transport = ScriptedTransport::new(vec![hit("614810477", EXACT_MATCH_INDICATOR)]);
        let p = provider(5, transport.clone());

        let info = p.lookup("中国平安").unwrap();
        assert_eq!(info.company_id.as_str(), "614810477");
        assert_eq!(info.confidence, Confidence::one());
        assert_eq!(p.remaining_budget(), 4);
        assert_eq!(transport.calls(), 1);
    }

    #[test]
    fn budget_ceiling_stops_network_calls() {
        let transport = ScriptedTransport::new(vec![hit("1", EXACT_MATCH_INDICATOR)]);
        let p = provider(2, transport.clone());

        assert!(p.lookup("a").is_some());
        assert!(p.lookup("b").is_some());
        assert_eq!(p.state(), ProviderState::BudgetExhausted);
        assert!(p.lookup("c").is_none());
        assert_eq!(transport.calls(), 2);

        p.reset_budget(1);
        assert_eq!(p.state(), ProviderState::Active);
        assert!(p.lookup("c").is_some());
    }

    #[test]
    fn unauthorized_disables_until_reset() {
        let transport = ScriptedTransport::new(vec![
            Err(TransportError::Unauthorized),
            hit("1", EXACT_MATCH_INDICATOR),
        ]);
        let p = provider(10, transport.clone());

        assert!(p.lookup("a").is_none());
        assert_eq!(p.state(), ProviderState::Disabled);
        for _ in 0..5 {
            assert!(p.lookup("a").is_none());
        }
        assert_eq!(transport.calls(), 1);
        assert_eq!(p.failure_count(), 1);

        p.reset_disabled();
        assert!(p.lookup("a").is_some());
    }

    #[test]
    fn transient_errors_are_retried_within_one_budget_unit() {
        let transport = ScriptedTransport::new(vec![
            Err(TransportError::Timeout { duration_ms: 5000 }),
            Err(TransportError::from_status(502, "bad gateway")),
            hit("1", EXACT_MATCH_INDICATOR),
        ]);
        let p = provider(3, transport.clone());

        assert!(p.lookup("a").is_some());
        assert_eq!(transport.calls(), 3);
        assert_eq!(p.remaining_budget(), 2);
        assert_eq!(p.requests_sent(), 3);
    }

    #[test]
    fn retries_are_bounded() {
        let transport =
            ScriptedTransport::new(vec![Err(TransportError::Timeout { duration_ms: 5000 })]);
        let p = provider(3, transport.clone());

        assert!(p.lookup("a").is_none());
        assert_eq!(transport.calls(), 3);
        assert_eq!(p.remaining_budget(), 2);
        assert_eq!(p.state(), ProviderState::Active);
    }

    #[test]
    fn client_errors_are_not_retried() {
        let transport = ScriptedTransport::new(vec![Err(TransportError::from_status(404, "no"))]);
        let p = provider(3, transport.clone());

        assert!(p.lookup("a").is_none());
        assert_eq!(transport.calls(), 1);
        assert_eq!(p.remaining_budget(), 2);
    }

    #[test]
    fn missing_token_spends_nothing() {
        let transport = ScriptedTransport::new(vec![hit("1", EXACT_MATCH_INDICATOR)]);
        let mut cfg = config(3);
        cfg.token = None;
        let p = EqcProvider::new(cfg, transport.clone()).unwrap();

        assert!(p.lookup("a").is_none());
        assert_eq!(transport.calls(), 0);
        assert_eq!(p.remaining_budget(), 3);
    }

    #[test]
    fn empty_result_is_clean_miss() {
        let transport = ScriptedTransport::new(vec![Ok(Vec::new())]);
        let p = provider(3, transport.clone());
        assert!(p.lookup("a").is_none());
        assert_eq!(p.remaining_budget(), 2);
        assert_eq!(p.failure_count(), 0);
    }

    #[test]
    fn confident_result_is_written_through() {
        let repo = Arc::new(InMemoryMappingRepository::new());
        let transport = ScriptedTransport::new(vec![hit("614810477", EXACT_MATCH_INDICATOR)]);
        let p = provider(3, transport)
            .with_repository(repo.clone())
            .with_index(repo.clone());

        p.lookup("中国平安 (已注销)").unwrap();

        let names: HashSet<String> = ["中国平安".to_string()].into_iter().collect();
        let found = repo.lookup_batch(&names, Some(&[MatchType::Name])).unwrap();
        assert_eq!(found["中国平安"].canonical_id.as_str(), "614810477");
        assert_eq!(found["中国平安"].source, sources::EQC_API);

        let key = IndexKey::new(LookupType::CustomerName, "中国平安");
        let indexed = repo.lookup_index_batch(&[key.clone()]).unwrap();
        assert_eq!(indexed[&key].source_domain.as_deref(), Some(SOURCE_DOMAIN));
    }

    #[test]
    fn low_confidence_result_is_indexed_but_not_aliased() {
        let repo = Arc::new(InMemoryMappingRepository::new());
        let transport = ScriptedTransport::new(vec![hit("1", PHONETIC_MATCH_INDICATOR)]);
        let p = provider(3, transport)
            .with_repository(repo.clone())
            .with_index(repo.clone());

        let info = p.lookup("acme").unwrap();
        assert_eq!(info.confidence, Confidence::new(0.6).unwrap());
        assert_eq!(repo.count().unwrap(), 0);

        let key = IndexKey::new(LookupType::CustomerName, "acme");
        assert_eq!(repo.lookup_index_batch(&[key]).unwrap().len(), 1);
    }

    #[test]
    fn concurrent_lookups_never_overspend() {
        let transport = ScriptedTransport::new(vec![hit("1", EXACT_MATCH_INDICATOR)]);
        let p = Arc::new(provider(10, transport.clone()));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let p = Arc::clone(&p);
                thread::spawn(move || (0..5).filter(|j| p.lookup(&format!("n{i}-{j}")).is_some()).count())
            })
            .collect();
        let found: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();

        assert_eq!(found, 10);
        assert_eq!(transport.calls(), 10);
        assert_eq!(p.remaining_budget(), 0);
    }

    #[test]
    fn invalid_threshold_is_rejected() {
        let mut cfg = config(1);
        cfg.cache_threshold = Some(1.5);
        assert!(EqcProvider::new(cfg, ScriptedTransport::new(Vec::new())).is_err());
    }

    #[test]
    fn missing_threshold_and_table_fall_back_to_defaults() {
        let cfg: EqcConfig = serde_json::from_str(r#"{"budget": 3, "token": "t"}"#).unwrap();
        assert!(cfg.cache_threshold.is_none());
        assert!(cfg.confidence_table.is_none());

        let p = EqcProvider::new(cfg, ScriptedTransport::new(Vec::new())).unwrap();
        assert_eq!(p.cache_threshold(), Confidence::new(DEFAULT_CACHE_THRESHOLD).unwrap());
        assert_eq!(p.remaining_budget(), 3);
    }

    #[test]
    fn debug_output_redacts_token() {
        let rendered = format!("{:?}", config(1));
        assert!(!rendered.contains("test-token"));
        assert!(rendered.contains("<redacted>"));
    }
}
