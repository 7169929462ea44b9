//! Alias-mapping and enrichment-index records.
//!
//! Mappings in the repository are explicit, auditable rows. A divergent
//! mapping for an existing `(alias, match_type)` is never applied; it is
//! reported back as a `MappingConflict`.

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::confidence::Confidence;
use crate::error::ValidationError;
use crate::temp_id::is_temp_id;

/// Canonical company identifier: either a real registry ID or a temp ID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CompanyId(String);

impl CompanyId {
    /// Creates a company ID from a non-blank string (trimmed).
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::EmptyCompanyId` for blank input.
    pub fn new(value: impl Into<String>) -> Result<Self, ValidationError> {
        let value = value.into();
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(ValidationError::EmptyCompanyId);
        }
        Ok(Self(trimmed.to_string()))
    }

    pub(crate) fn new_unchecked(value: String) -> Self {
        Self(value)
    }

    /// The raw ID.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if this is a generated temp ID.
    #[must_use]
    pub fn is_temp(&self) -> bool {
        is_temp_id(&self.0)
    }

    /// Unwraps the raw ID.
    #[must_use]
    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for CompanyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Category of alias that produced a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    /// Plan code.
    Plan,
    /// Account number.
    Account,
    /// Hand-maintained mapping.
    Hardcode,
    /// Normalized customer name.
    Name,
    /// Account (annuity) name.
    AccountName,
}

impl MatchType {
    /// Every match type in default-priority order.
    pub const ALL: [Self; 5] = [
        Self::Plan,
        Self::Account,
        Self::Hardcode,
        Self::Name,
        Self::AccountName,
    ];

    /// Priority assigned to rows of this type unless seeded otherwise.
    #[must_use]
    pub const fn default_priority(self) -> Priority {
        match self {
            Self::Plan => Priority::new(1),
            Self::Account => Priority::new(2),
            Self::Hardcode => Priority::new(3),
            Self::Name => Priority::new(4),
            Self::AccountName => Priority::new(5),
        }
    }

    /// Value stored in the `match_type` column.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Plan => "plan",
            Self::Account => "account",
            Self::Hardcode => "hardcode",
            Self::Name => "name",
            Self::AccountName => "account_name",
        }
    }
}

impl fmt::Display for MatchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Authority of a mapping row.
///
/// Stored as the integer rank where `1` is the most authoritative. The `Ord`
/// impl is inverted on purpose: a more authoritative priority compares
/// *greater*, so `max()` always picks the winner. Prefer `outranks` at call
/// sites.
///
/// ```
/// use company_id_resolver::Priority;
///
/// let plan = Priority::new(1);
/// let name = Priority::new(4);
/// assert!(plan.outranks(name));
/// assert_eq!(plan.max(name), plan);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Priority(u16);

impl Priority {
    /// The most authoritative priority.
    pub const HIGHEST: Self = Self(1);

    /// Wraps a raw rank.
    #[must_use]
    pub const fn new(rank: u16) -> Self {
        Self(rank)
    }

    /// The raw rank (lower = more authoritative).
    #[must_use]
    pub const fn rank(self) -> u16 {
        self.0
    }

    /// Returns true if `self` is strictly more authoritative than `other`.
    #[must_use]
    pub const fn outranks(self, other: Self) -> bool {
        self.0 < other.0
    }
}

impl Ord for Priority {
    fn cmp(&self, other: &Self) -> Ordering {
        other.0.cmp(&self.0)
    }
}

impl PartialOrd for Priority {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}", self.0)
    }
}

/// Well-known `source` values.
pub mod sources {
    /// Written by the provider's write-through cache.
    pub const EQC_API: &str = "eqc_api";
    /// Seeded by a bulk migration.
    pub const LEGACY_MIGRATION: &str = "legacy_migration";
    /// Maintained by an operator.
    pub const MANUAL: &str = "manual";
}

/// One row of the `alias_mapping` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AliasMappingRecord {
    /// Trimmed lookup key.
    pub alias_name: String,
    /// Company the alias maps to.
    pub canonical_id: CompanyId,
    /// Match type.
    pub match_type: MatchType,
    /// Authority used when aliases collide.
    pub priority: Priority,
    /// Writer of the row, e.g. `sources::EQC_API`.
    pub source: String,
    /// First write of the row.
    pub created_at: DateTime<Utc>,
    /// Last write of the row.
    pub updated_at: DateTime<Utc>,
}

impl AliasMappingRecord {
    /// Creates a record with the match type's default priority.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::EmptyAlias` if the alias is blank.
    pub fn new(
        alias_name: impl Into<String>,
        canonical_id: CompanyId,
        match_type: MatchType,
        source: impl Into<String>,
    ) -> Result<Self, ValidationError> {
        let alias_name = alias_name.into().trim().to_string();
        if alias_name.is_empty() {
            return Err(ValidationError::EmptyAlias);
        }
        let now = Utc::now();
        Ok(Self {
            alias_name,
            canonical_id,
            match_type,
            priority: match_type.default_priority(),
            source: source.into(),
            created_at: now,
            updated_at: now,
        })
    }

    /// Overrides the default priority.
    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Checks the record before it is written.
    ///
    /// # Errors
    ///
    /// Returns a `ValidationError` for a blank alias or company ID.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.alias_name.trim().is_empty() {
            return Err(ValidationError::EmptyAlias);
        }
        if self.canonical_id.as_str().trim().is_empty() {
            return Err(ValidationError::EmptyCompanyId);
        }
        Ok(())
    }
}

/// The winning row for an alias returned by `lookup_batch`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchResult {
    /// Alias name.
    pub alias_name: String,
    /// Company the alias maps to.
    pub canonical_id: CompanyId,
    /// Match type.
    pub match_type: MatchType,
    /// Authority of the winning row.
    pub priority: Priority,
    /// Writer of the winning row.
    pub source: String,
}

impl From<&AliasMappingRecord> for MatchResult {
    fn from(record: &AliasMappingRecord) -> Self {
        Self {
            alias_name: record.alias_name.clone(),
            canonical_id: record.canonical_id.clone(),
            match_type: record.match_type,
            priority: record.priority,
            source: record.source.clone(),
        }
    }
}

/// A divergent mapping that was detected and not applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingConflict {
    /// Alias that collided.
    pub alias: String,
    /// Match type.
    pub match_type: MatchType,
    /// Value already stored.
    pub existing_id: CompanyId,
    /// Value that was rejected.
    pub new_id: CompanyId,
}

impl fmt::Display for MappingConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[{}]: {} (kept) vs {} (rejected)",
            self.alias, self.match_type, self.existing_id, self.new_id
        )
    }
}

/// Outcome of `insert_batch_with_conflict_check`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InsertReport {
    /// Rows written.
    pub inserted_count: usize,
    /// Rows already present with the same ID.
    pub skipped_count: usize,
    /// Rejected rows, in input order.
    pub conflicts: Vec<MappingConflict>,
}

impl InsertReport {
    /// True if any row was rejected.
    #[must_use]
    pub fn has_conflicts(&self) -> bool {
        !self.conflicts.is_empty()
    }
}

/// Key type of an enrichment-index row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LookupType {
    /// Plan code.
    PlanCode,
    /// Account name.
    AccountName,
    /// Account number.
    AccountNumber,
    /// Normalized customer name.
    CustomerName,
    /// Plan code and customer name together.
    PlanCustomer,
}

impl LookupType {
    /// Value stored in the `lookup_type` column.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PlanCode => "plan_code",
            Self::AccountName => "account_name",
            Self::AccountNumber => "account_number",
            Self::CustomerName => "customer_name",
            Self::PlanCustomer => "plan_customer",
        }
    }
}

impl fmt::Display for LookupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Composite key of the enrichment index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IndexKey {
    /// Lookup type.
    pub lookup_type: LookupType,
    /// Trimmed key value.
    pub lookup_key: String,
}

impl IndexKey {
    /// Builds a key, trimming `lookup_key`.
    #[must_use]
    pub fn new(lookup_type: LookupType, lookup_key: impl Into<String>) -> Self {
        Self {
            lookup_type,
            lookup_key: lookup_key.into(),
        }
    }
}

/// One row of the `enrichment_index` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentIndexRecord {
    /// Normalized lookup key.
    pub lookup_key: String,
    /// Lookup type.
    pub lookup_type: LookupType,
    /// Answered company ID.
    pub company_id: CompanyId,
    /// Score that gated the write.
    pub confidence: Confidence,
    /// Writer of the row.
    pub source: String,
    /// Domain that supplied the answer, if known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_domain: Option<String>,
    /// Times this row answered a lookup.
    pub hit_count: u64,
    /// Time of the most recent hit.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_hit_at: Option<DateTime<Utc>>,
}

impl EnrichmentIndexRecord {
    /// Creates a fresh record (no hits yet).
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::EmptyAlias` if the key is blank.
    pub fn new(
        key: IndexKey,
        company_id: CompanyId,
        confidence: Confidence,
        source: impl Into<String>,
    ) -> Result<Self, ValidationError> {
        if key.lookup_key.trim().is_empty() {
            return Err(ValidationError::EmptyAlias);
        }
        Ok(Self {
            lookup_key: key.lookup_key,
            lookup_type: key.lookup_type,
            company_id,
            confidence: confidence.to_storage_precision(),
            source: source.into(),
            source_domain: None,
            hit_count: 0,
            last_hit_at: None,
        })
    }

    /// Records where the answer came from.
    #[must_use]
    pub fn with_source_domain(mut self, domain: impl Into<String>) -> Self {
        self.source_domain = Some(domain.into());
        self
    }

    /// Composite key of this row.
    #[must_use]
    pub fn key(&self) -> IndexKey {
        IndexKey::new(self.lookup_type, self.lookup_key.clone())
    }
}
