//! Provider budget ceiling, disablement and write-through, driven through
//! the resolver with a scripted transport.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use company_id_resolver::provider::{EqcConfig, EqcProvider, EqcTransport, RetryPolicy, SearchCandidate};
use company_id_resolver::resolver::{CompanyIdResolver, ResolutionContext, ResolutionSource, ResolutionStrategy};
use company_id_resolver::storage::InMemoryMappingRepository;
use company_id_resolver::{
    CacheFirstEnrichmentService, EnrichmentObserver, EnrichmentQueue, EnterpriseInfoProvider, ProviderState,
    Table, TransportError,
};

type Reply = Result<Vec<SearchCandidate>, TransportError>;

/// Answers every name with `ID-<name>`, or with scripted replies first.
struct FakeEqc {
    script: Mutex<VecDeque<Reply>>,
    calls: AtomicU64,
}

impl FakeEqc {
    fn echo() -> Arc<Self> {
        Self::scripted(Vec::new())
    }

    fn scripted(replies: Vec<Reply>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(replies.into()),
            calls: AtomicU64::new(0),
        })
    }

    fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl EqcTransport for FakeEqc {
    fn search(&self, name: &str, _token: &str, _timeout: Duration) -> Reply {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(reply) = self.script.lock().unwrap().pop_front() {
            return reply;
        }
        Ok(vec![SearchCandidate {
            company_id: format!("ID-{name}"),
            official_name: name.to_string(),
            credit_code: None,
            match_quality: Some("exact".to_string()),
        }])
    }
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

fn names(names: &[&str]) -> Table {
    let rows: Vec<Vec<Option<&str>>> = names.iter().map(|n| vec![None, Some(*n)]).collect();
    Table::from_rows(&["plan_code", "customer_name"], &rows).unwrap()
}

#[test]
fn batch_budget_caps_provider_calls() {
    let transport = FakeEqc::echo();
    let provider = Arc::new(EqcProvider::new(config(100), transport.clone()).unwrap());
    let context = ResolutionContext::builder().provider(provider.clone()).build();

    let out = CompanyIdResolver::new(context)
        .resolve_batch(
            &names(&["a", "b", "c", "d", "e"]),
            &ResolutionStrategy::default().with_provider_budget(3),
        )
        .unwrap();

    assert_eq!(transport.calls(), 3);
    assert_eq!(provider.remaining_budget(), 97);
    assert_eq!(out.statistics.provider_hits, 3);
    assert_eq!(out.statistics.sync_budget_used, 3);
    assert_eq!(out.statistics.budget_exhausted, 2);
    assert_eq!(out.statistics.temp_ids_generated, 2);
}

#[test]
fn provider_budget_caps_batch_budget() {
    let transport = FakeEqc::echo();
    let provider = Arc::new(EqcProvider::new(config(2), transport.clone()).unwrap());
    let context = ResolutionContext::builder().provider(provider.clone()).build();

    let out = CompanyIdResolver::new(context)
        .resolve_batch(
            &names(&["a", "b", "c"]),
            &ResolutionStrategy::default().with_provider_budget(50),
        )
        .unwrap();

    assert_eq!(transport.calls(), 2);
    assert_eq!(provider.state(), ProviderState::BudgetExhausted);
    assert_eq!(out.statistics.sync_budget_used, 2);
    assert_eq!(out.sources[2], ResolutionSource::TempId);
}

#[test]
fn unauthorized_disables_provider_for_rest_of_run() {
    let transport = FakeEqc::scripted(vec![Err(TransportError::Unauthorized)]);
    let provider = Arc::new(EqcProvider::new(config(10), transport.clone()).unwrap());
    let context = ResolutionContext::builder().provider(provider.clone()).build();
    let resolver = CompanyIdResolver::new(context);
    let strategy = ResolutionStrategy::default().with_provider_budget(10);

    let out = resolver.resolve_batch(&names(&["a", "b", "c"]), &strategy).unwrap();
    assert_eq!(transport.calls(), 1);
    assert_eq!(provider.state(), ProviderState::Disabled);
    assert_eq!(out.statistics.temp_ids_generated, 3);
    assert_eq!(out.statistics.provider_errors, 1);
    // Disablement is not a budget problem.
    assert_eq!(out.statistics.budget_exhausted, 0);

    let again = resolver.resolve_batch(&names(&["d"]), &strategy).unwrap();
    assert_eq!(transport.calls(), 1);
    assert_eq!(again.statistics.provider_hits, 0);
}

#[test]
fn transient_failures_are_retried_then_missed() {
    let timeout = || Err(TransportError::Timeout { duration_ms: 5_000 });
    let transport = FakeEqc::scripted(vec![timeout(), timeout(), timeout()]);
    let provider = Arc::new(EqcProvider::new(config(10), transport.clone()).unwrap());
    let context = ResolutionContext::builder().provider(provider.clone()).build();

    let out = CompanyIdResolver::new(context)
        .resolve_batch(&names(&["a"]), &ResolutionStrategy::default().with_provider_budget(1))
        .unwrap();

    // One budget unit, three HTTP attempts.
    assert_eq!(transport.calls(), 3);
    assert_eq!(provider.remaining_budget(), 9);
    assert_eq!(provider.state(), ProviderState::Active);
    assert_eq!(out.statistics.provider_errors, 1);
    assert_eq!(out.sources[0], ResolutionSource::TempId);
}

#[test]
fn write_through_turns_next_batch_into_cache_hits() {
    let repo = Arc::new(InMemoryMappingRepository::new());
    let transport = FakeEqc::echo();
    let provider = Arc::new(
        EqcProvider::new(config(10), transport.clone())
            .unwrap()
            .with_repository(repo.clone())
            .with_index(repo.clone()),
    );
    let service = Arc::new(CacheFirstEnrichmentService::new(repo.clone()).with_index(repo));
    let context = ResolutionContext::builder()
        .service(service)
        .provider(provider)
        .build();
    let resolver = CompanyIdResolver::new(context);
    let strategy = ResolutionStrategy::default().with_provider_budget(10);

    let first = resolver.resolve_batch(&names(&["Acme"]), &strategy).unwrap();
    assert_eq!(first.sources, vec![ResolutionSource::Provider]);
    assert_eq!(first.table.value("company_id", 0), Some("ID-Acme"));

    let second = resolver.resolve_batch(&names(&["ACME"]), &strategy).unwrap();
    assert_eq!(second.sources, vec![ResolutionSource::Cache]);
    assert_eq!(second.table.value("company_id", 0), Some("ID-Acme"));
    assert_eq!(transport.calls(), 1);
}

#[test]
fn exhausted_budget_queues_names_for_backfill() {
    let transport = FakeEqc::echo();
    let provider = Arc::new(EqcProvider::new(config(1), transport.clone()).unwrap());
    let queue = Arc::new(EnrichmentQueue::new(16));
    let observer = Arc::new(EnrichmentObserver::new());
    let context = ResolutionContext::builder()
        .provider(provider.clone())
        .queue(queue.clone())
        .observer(observer.clone())
        .build();
    let mut strategy = ResolutionStrategy::default().with_provider_budget(5);
    strategy.enqueue_unresolved = true;

    let out = CompanyIdResolver::new(context)
        .resolve_batch(&names(&["a", "b", "c", "b"]), &strategy)
        .unwrap();
    assert_eq!(out.statistics.async_queued, 2);
    assert_eq!(queue.depth(), 2);
    assert_eq!(observer.stats().queue_depth_after, 2);
    assert_eq!(observer.stats().async_queued, 2);

    provider.reset_budget(5);
    let report = queue.run_backfill(provider.as_ref(), 10);
    assert_eq!(report.attempted, 2);
    assert_eq!(report.resolved, 2);
    assert!(queue.is_empty());
}

#[test]
fn concurrent_batches_never_overspend() {
    let transport = FakeEqc::echo();
    let provider = Arc::new(EqcProvider::new(config(25), transport.clone()).unwrap());

    let handles: Vec<_> = (0..8)
        .map(|t| {
            let provider = provider.clone();
            thread::spawn(move || {
                let context = ResolutionContext::builder().provider(provider).build();
                let rows: Vec<String> = (0..10).map(|i| format!("t{t}-n{i}")).collect();
                let refs: Vec<&str> = rows.iter().map(String::as_str).collect();
                CompanyIdResolver::new(context)
                    .resolve_batch(&names(&refs), &ResolutionStrategy::default().with_provider_budget(10))
                    .unwrap()
                    .statistics
                    .provider_hits
            })
        })
        .collect();

    let hits: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();
    assert_eq!(hits, 25);
    assert_eq!(transport.calls(), 25);
    assert_eq!(provider.remaining_budget(), 0);
}
