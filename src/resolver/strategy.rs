//! Per-batch resolution configuration.

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Column names and switches for one `resolve_batch` call.
///
/// Deserializable so a pipeline can keep it next to its other settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolutionStrategy {
    /// Required input column with plan codes.
    pub plan_code_column: String,
    /// Required input column with free-text customer names.
    pub customer_name_column: String,
    /// Optional account-name column.
    pub account_name_column: Option<String>,
    /// Optional account-number column.
    pub account_number_column: Option<String>,
    /// Column whose non-blank values are passed through unchanged.
    pub existing_id_column: Option<String>,
    /// Column written with the resolved IDs (replaced if present).
    pub output_column: String,
    /// Maximum provider lookups for this batch.
    pub sync_lookup_budget: u32,
    /// Consult the cache-first enrichment service.
    pub use_cache_lookup: bool,
    /// Call the external provider.
    pub use_enrichment_service: bool,
    /// Fall back to temp IDs instead of leaving rows null.
    pub generate_temp_ids: bool,
    /// Offer names skipped for lack of budget to the enrichment queue.
    pub enqueue_unresolved: bool,
    /// Column hashed together with blank names so they get distinct temp IDs.
    pub blank_name_disambiguator_column: Option<String>,
}

impl Default for ResolutionStrategy {
    fn default() -> Self {
        Self {
            plan_code_column: "plan_code".to_string(),
            customer_name_column: "customer_name".to_string(),
            account_name_column: None,
            account_number_column: None,
            existing_id_column: None,
            output_column: "company_id".to_string(),
            sync_lookup_budget: 0,
            use_cache_lookup: true,
            use_enrichment_service: false,
            generate_temp_ids: true,
            enqueue_unresolved: false,
            blank_name_disambiguator_column: None,
        }
    }
}

impl ResolutionStrategy {
    /// Enables the provider with a batch budget.
    #[must_use]
    pub fn with_provider_budget(mut self, budget: u32) -> Self {
        self.use_enrichment_service = true;
        self.sync_lookup_budget = budget;
        self
    }

    /// Sets `existing_id_column`.
    #[must_use]
    pub fn with_existing_id_column(mut self, column: impl Into<String>) -> Self {
        self.existing_id_column = Some(column.into());
        self
    }

    /// Sets `output_column`.
    #[must_use]
    pub fn with_output_column(mut self, column: impl Into<String>) -> Self {
        self.output_column = column.into();
        self
    }

    /// Checks that every configured column name is non-blank.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::InvalidConfig` naming the offending field.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let columns = [
            ("plan_code_column", Some(&self.plan_code_column)),
            ("customer_name_column", Some(&self.customer_name_column)),
            ("output_column", Some(&self.output_column)),
            ("account_name_column", self.account_name_column.as_ref()),
            ("account_number_column", self.account_number_column.as_ref()),
            ("existing_id_column", self.existing_id_column.as_ref()),
            (
                "blank_name_disambiguator_column",
                self.blank_name_disambiguator_column.as_ref(),
            ),
        ];
        for (field, value) in columns {
            if value.is_some_and(|v| v.trim().is_empty()) {
                return Err(ValidationError::InvalidConfig {
                    reason: format!("strategy.{field} must not be blank"),
                });
            }
        }
        Ok(())
    }
}
