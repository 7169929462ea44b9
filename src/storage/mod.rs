//! Storage for the `alias_mapping` and `enrichment_index` tables.
//!
//! The traits define the contract; `memory` is the reference backend and
//! `persistent` (feature-gated) adds a write-ahead log on top of it.

mod memory;
mod traits;

#[cfg(feature = "persistent")]
pub mod persistent;

pub use memory::InMemoryMappingRepository;
pub use traits::{EnrichmentIndexStore, MappingRepository, StorageError};
