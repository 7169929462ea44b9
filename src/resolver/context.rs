//! Per-run collaborators.
//!
//! Everything the resolver talks to is owned by a `ResolutionContext` built
//! for the run; there are no process-wide singletons. Collaborators that
//! outlive a run (repository, observer, queue) are shared through `Arc`.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationError;
use crate::mapping::CompanyId;
use crate::observer::EnrichmentObserver;
use crate::provider::EnterpriseInfoProvider;
use crate::queue::EnrichmentQueue;
use crate::service::EnrichmentService;
use crate::temp_id::TempIdGenerator;

/// Immutable, versioned `plan_code → company ID` overrides.
///
/// Loaded by the caller; the resolver never mutates it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanOverrideMap {
    version: String,
    entries: HashMap<String, CompanyId>,
}

impl PlanOverrideMap {
    /// Builds a map, trimming plan codes.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::EmptyAlias` for a blank plan code.
    pub fn new(
        version: impl Into<String>,
        entries: impl IntoIterator<Item = (String, CompanyId)>,
    ) -> Result<Self, ValidationError> {
        let mut map = HashMap::new();
        for (plan_code, id) in entries {
            let key = plan_code.trim();
            if key.is_empty() {
                return Err(ValidationError::EmptyAlias);
            }
            map.insert(key.to_string(), id);
        }
        Ok(Self {
            version: version.into(),
            entries: map,
        })
    }

    /// Convenience constructor from string pairs.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a blank plan code or company ID.
    pub fn from_pairs(version: impl Into<String>, pairs: &[(&str, &str)]) -> Result<Self, ValidationError> {
        let entries = pairs
            .iter()
            .map(|(plan, id)| Ok(((*plan).to_string(), CompanyId::new(*id)?)))
            .collect::<Result<Vec<_>, ValidationError>>()?;
        Self::new(version, entries)
    }

    /// Override for `plan_code` (compared after trimming).
    #[must_use]
    pub fn get(&self, plan_code: &str) -> Option<&CompanyId> {
        self.entries.get(plan_code.trim())
    }

    /// Label of the override set, for logs.
    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Number of plan codes with an override.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if no override is configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Collaborators for one resolution run.
#[derive(Clone)]
pub struct ResolutionContext {
    run_id: Uuid,
    overrides: Arc<PlanOverrideMap>,
    service: Option<Arc<dyn EnrichmentService>>,
    provider: Option<Arc<dyn EnterpriseInfoProvider>>,
    queue: Option<Arc<EnrichmentQueue>>,
    observer: Arc<EnrichmentObserver>,
    temp_ids: TempIdGenerator,
}

impl std::fmt::Debug for ResolutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolutionContext")
            .field("run_id", &self.run_id)
            .field("overrides_version", &self.overrides.version())
            .field("overrides", &self.overrides.len())
            .field("has_service", &self.service.is_some())
            .field("provider", &self.provider.as_ref().map(|p| p.name()))
            .field("has_queue", &self.queue.is_some())
            .finish()
    }
}

impl Default for ResolutionContext {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl ResolutionContext {
    /// Starts a builder with a fresh run ID and an empty override map.
    #[must_use]
    pub fn builder() -> ResolutionContextBuilder {
        ResolutionContextBuilder::default()
    }

    /// Identifier stamped on logs and output.
    #[must_use]
    pub const fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Plan-code overrides for this run.
    #[must_use]
    pub fn overrides(&self) -> &PlanOverrideMap {
        &self.overrides
    }

    /// Cache-first service, if configured.
    #[must_use]
    pub fn service(&self) -> Option<&dyn EnrichmentService> {
        self.service.as_deref()
    }

    /// External provider, if configured.
    #[must_use]
    pub fn provider(&self) -> Option<&dyn EnterpriseInfoProvider> {
        self.provider.as_deref()
    }

    /// Async queue, if configured.
    #[must_use]
    pub fn queue(&self) -> Option<&EnrichmentQueue> {
        self.queue.as_deref()
    }

    /// Run observer.
    #[must_use]
    pub fn observer(&self) -> &EnrichmentObserver {
        &self.observer
    }

    /// Shared handle to the observer, e.g. for an exporter thread.
    #[must_use]
    pub fn observer_handle(&self) -> Arc<EnrichmentObserver> {
        Arc::clone(&self.observer)
    }

    /// Temp-ID generator for fallbacks.
    #[must_use]
    pub const fn temp_ids(&self) -> &TempIdGenerator {
        &self.temp_ids
    }
}

/// Builder for `ResolutionContext`.
#[derive(Default)]
pub struct ResolutionContextBuilder {
    run_id: Option<Uuid>,
    overrides: Option<Arc<PlanOverrideMap>>,
    service: Option<Arc<dyn EnrichmentService>>,
    provider: Option<Arc<dyn EnterpriseInfoProvider>>,
    queue: Option<Arc<EnrichmentQueue>>,
    observer: Option<Arc<EnrichmentObserver>>,
}

impl ResolutionContextBuilder {
    /// Uses a caller-chosen run ID instead of a random one.
    #[must_use]
    pub fn run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = Some(run_id);
        self
    }

    /// Sets the plan-code overrides.
    #[must_use]
    pub fn overrides(mut self, overrides: impl Into<Arc<PlanOverrideMap>>) -> Self {
        self.overrides = Some(overrides.into());
        self
    }

    /// Sets the cache-first service.
    #[must_use]
    pub fn service(mut self, service: Arc<dyn EnrichmentService>) -> Self {
        self.service = Some(service);
        self
    }

    /// Sets the external provider.
    #[must_use]
    pub fn provider(mut self, provider: Arc<dyn EnterpriseInfoProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Queue for names the sync budget could not cover.
    #[must_use]
    pub fn queue(mut self, queue: Arc<EnrichmentQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Shares an existing observer instead of creating one.
    #[must_use]
    pub fn observer(mut self, observer: Arc<EnrichmentObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Finishes the context. Missing parts get fresh defaults.
    #[must_use]
    pub fn build(self) -> ResolutionContext {
        ResolutionContext {
            run_id: self.run_id.unwrap_or_else(Uuid::new_v4),
            overrides: self.overrides.unwrap_or_default(),
            service: self.service,
            provider: self.provider,
            queue: self.queue,
            observer: self.observer.unwrap_or_default(),
            temp_ids: TempIdGenerator::new(),
        }
    }
}
