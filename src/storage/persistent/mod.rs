//! Durable single-process backend for the mapping tables.
//!
//! - Write-ahead log, one entry per batch, replayed on open
//! - CRC32 checksums on every frame
//! - Exclusive directory lock
//! - Snapshot compaction once the WAL passes `max_wal_size`
//!
//! ```text
//! <dir>/
//!   .lock              flock target
//!   mapping.snapshot   compacted tables + covered WAL sequence
//!   mapping.wal        entries written since the snapshot
//! ```

mod codec;
mod file_lock;
mod repository;
mod snapshot;
mod wal;

pub use file_lock::FileLock;
pub use repository::{CompactionResult, PersistentMappingRepository};
pub use wal::{WalEntry, WalEntryKind, WriteAheadLog};

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::storage::StorageError;

/// Configuration for the persistent backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistentConfig {
    /// WAL size that triggers compaction (bytes).
    pub max_wal_size: u64,
    /// Whether to fsync after every WAL append.
    pub sync_on_write: bool,
}

impl Default for PersistentConfig {
    fn default() -> Self {
        Self {
            max_wal_size: 64 * 1024 * 1024,
            sync_on_write: true,
        }
    }
}

impl PersistentConfig {
    const MIN_WAL_SIZE: u64 = 4 * 1024;

    /// Checks the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::InvalidConfig` if `max_wal_size` is below 4 KiB.
    pub fn validate(self) -> Result<Self, ValidationError> {
        if self.max_wal_size < Self::MIN_WAL_SIZE {
            return Err(ValidationError::InvalidConfig {
                reason: format!(
                    "max_wal_size must be at least {} bytes (got {})",
                    Self::MIN_WAL_SIZE,
                    self.max_wal_size
                ),
            });
        }
        Ok(self)
    }
}

/// Opens or creates a persistent mapping repository at `path`.
///
/// # Errors
/// - invalid configuration
/// - the directory cannot be created or another process holds the lock
/// - the snapshot or WAL is corrupted
///
/// # Example
/// ```rust,ignore
/// use company_id_resolver::storage::persistent::open_repository;
///
/// let repo = Arc::new(open_repository("./mapping-store", None)?);
/// let service = CacheFirstEnrichmentService::new(repo.clone()).with_index(repo);
/// let context = ResolutionContext::builder().service(Arc::new(service)).build();
/// ```
pub fn open_repository(
    path: impl AsRef<Path>,
    config: Option<PersistentConfig>,
) -> Result<PersistentMappingRepository, StorageError> {
    let config = config
        .unwrap_or_default()
        .validate()
        .map_err(|e| StorageError::BackendError(e.to_string()))?;
    PersistentMappingRepository::open(path.as_ref(), config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiny_wal_limit_is_rejected() {
        let config = PersistentConfig {
            max_wal_size: 100,
            ..PersistentConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn open_rejects_invalid_config() {
        let dir = tempfile::tempdir().unwrap();
        let config = PersistentConfig {
            max_wal_size: 1,
            sync_on_write: false,
        };
        assert!(open_repository(dir.path(), Some(config)).is_err());
    }
}
