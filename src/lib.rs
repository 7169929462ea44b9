//! # company-id-resolver
//!
//! Resolves free-text customer names and plan codes in tabular records to
//! canonical company IDs.
//!
//! Each row goes through a fixed priority chain: plan overrides, an existing
//! ID column, a cache-first lookup over the mapping tables, a budgeted call
//! to an external enterprise-information provider, and finally a
//! deterministic temp ID so downstream joins never see a hole.
//!
//! ## Core Concepts
//!
//! - **`CompanyId`**: canonical identifier; temp IDs are `IN_` + 16 Base32 chars
//! - **Alias mapping**: `(alias, match_type) → company_id` with a `Priority`
//! - **Enrichment index**: `(lookup_type, key) → company_id` with a `Confidence`
//! - **`EnterpriseInfoProvider`**: budgeted external lookup with write-through caching
//! - **`EnrichmentObserver`**: run counters and the unknown-companies registry
//!
//! ## Usage
//!
//! ```
//! use std::sync::Arc;
//!
//! use company_id_resolver::resolver::{CompanyIdResolver, ResolutionContext, ResolutionStrategy};
//! use company_id_resolver::service::CacheFirstEnrichmentService;
//! use company_id_resolver::storage::InMemoryMappingRepository;
//! use company_id_resolver::Table;
//!
//! let repository = Arc::new(InMemoryMappingRepository::new());
//! let context = ResolutionContext::builder()
//!     .service(Arc::new(CacheFirstEnrichmentService::new(repository)))
//!     .build();
//! let resolver = CompanyIdResolver::new(context);
//!
//! let table = Table::from_rows(
//!     &["plan_code", "customer_name"],
//!     &[vec![Some("UNKNOWN"), Some("中国平安保险公司")]],
//! )?;
//! let output = resolver.resolve_batch(&table, &ResolutionStrategy::default())?;
//! assert!(output.table.value("company_id", 0).unwrap().starts_with("IN_"));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Core types
pub mod confidence;
pub mod error;
pub mod mapping;
pub mod normalize;
pub mod table;
pub mod temp_id;

// Storage and lookups
pub mod provider;
pub mod service;
pub mod storage;

// Orchestration and reporting
pub mod observer;
pub mod queue;
pub mod resolver;

// Re-export primary types at crate root for convenience
pub use confidence::{Confidence, ConfidenceTable};
pub use error::{QueueError, ResolveError, ResolveResult, TransportError, ValidationError};
pub use mapping::{
    AliasMappingRecord, CompanyId, EnrichmentIndexRecord, IndexKey, InsertReport, LookupType, MappingConflict,
    MatchResult, MatchType, Priority,
};
pub use observer::{EnrichmentObserver, EnrichmentStats, UnknownCompany};
pub use provider::{CompanyInfo, EnterpriseInfoProvider, EqcConfig, EqcProvider, NoopProvider, ProviderState};
pub use queue::EnrichmentQueue;
pub use resolver::{
    CompanyIdResolver, PlanOverrideMap, ResolutionContext, ResolutionOutput, ResolutionSource,
    ResolutionStatistics, ResolutionStrategy,
};
pub use service::{CacheFirstEnrichmentService, EnrichmentRequest, EnrichmentService};
pub use storage::{EnrichmentIndexStore, InMemoryMappingRepository, MappingRepository, StorageError};
pub use table::{Column, Table};
pub use temp_id::TempIdGenerator;
