//! External enterprise-information providers.
//!
//! A provider turns a company name into a `CompanyInfo` at most once per
//! unit of budget. Providers never return errors to the resolver: failures
//! become `None` plus, where relevant, a state transition.

mod eqc;
mod retry;
mod transport;

pub use eqc::{EqcConfig, EqcProvider, DEFAULT_CACHE_THRESHOLD};
pub use retry::RetryPolicy;
pub use transport::{EqcTransport, HttpEqcTransport, SearchCandidate, DEFAULT_EQC_BASE_URL};

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::confidence::Confidence;
use crate::mapping::CompanyId;

/// Result of a successful provider lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompanyInfo {
    /// Canonical company ID.
    pub company_id: CompanyId,
    /// Registered name returned by the provider.
    pub official_name: String,
    /// Unified social credit code, when returned.
    pub unified_credit_code: Option<String>,
    /// Mapped from the match-quality indicator.
    pub confidence: Confidence,
    /// The provider's raw match-quality indicator.
    pub match_type: Option<String>,
}

/// Lifecycle state of a provider instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderState {
    /// Lookups reach the network.
    Active,
    /// Remaining budget is zero; cleared by `reset_budget`.
    BudgetExhausted,
    /// Credentials were rejected; cleared by `reset_disabled`.
    Disabled,
}

impl ProviderState {
    /// Returns true if a lookup could make a network call.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Active)
    }
}

impl fmt::Display for ProviderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::BudgetExhausted => write!(f, "budget_exhausted"),
            Self::Disabled => write!(f, "disabled"),
        }
    }
}

/// A budget-limited identity lookup service.
///
/// Implementations must be safe for concurrent use: concurrent lookups
/// must never spend more than the remaining budget.
pub trait EnterpriseInfoProvider: Send + Sync {
    /// Looks up a company by (raw) name.
    ///
    /// Returns `None` on a miss, on any failure, or without a network call
    /// when the provider is not `Active`.
    fn lookup(&self, name: &str) -> Option<CompanyInfo>;

    /// Budget left for real lookups.
    fn remaining_budget(&self) -> u32;

    /// Current lifecycle state.
    fn state(&self) -> ProviderState;

    /// Short provider name used in logs.
    fn name(&self) -> &'static str;

    /// Lookups that failed (transport error, auth failure, bad payload).
    fn failure_count(&self) -> u64 {
        0
    }
}

/// Provider that never finds anything and never spends budget.
///
/// Used for runs with enrichment switched off and in tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProvider;

impl EnterpriseInfoProvider for NoopProvider {
    fn lookup(&self, _name: &str) -> Option<CompanyInfo> {
        None
    }

    fn remaining_budget(&self) -> u32 {
        0
    }

    fn state(&self) -> ProviderState {
        ProviderState::BudgetExhausted
    }

    fn name(&self) -> &'static str {
        "noop"
    }
}
