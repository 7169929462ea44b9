//! Confidence scores for automatically derived mappings.
//!
//! Confidence is never computed from the names themselves: it is read off the
//! external provider's match-quality indicator through a `ConfidenceTable`.
//! The score then gates whether a mapping is trusted enough to be cached.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// A validated score in `[0.0, 1.0]`.
///
/// # Examples
///
/// ```
/// use company_id_resolver::Confidence;
///
/// let conf = Confidence::new(0.8).unwrap();
/// assert!(conf.meets(Confidence::new(0.75).unwrap()));
/// assert!(Confidence::new(1.2).is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "f32", into = "f32")]
pub struct Confidence(f32);

impl Confidence {
    /// Minimum valid confidence value.
    pub const MIN_VALUE: f32 = 0.0;

    /// Maximum valid confidence value.
    pub const MAX_VALUE: f32 = 1.0;

    /// Creates a new confidence with validation.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::ConfidenceOutOfRange` if the value is not in [0.0, 1.0].
    pub fn new(value: f32) -> Result<Self, ValidationError> {
        if value.is_nan() || !(Self::MIN_VALUE..=Self::MAX_VALUE).contains(&value) {
            return Err(ValidationError::ConfidenceOutOfRange { value });
        }
        Ok(Self(value))
    }

    /// Creates a zero confidence.
    #[must_use]
    pub const fn zero() -> Self {
        Self(0.0)
    }

    /// Creates a full confidence.
    #[must_use]
    pub const fn one() -> Self {
        Self(1.0)
    }

    /// Raw score.
    #[must_use]
    pub const fn value(&self) -> f32 {
        self.0
    }

    /// Rounds to the two decimal places the enrichment index stores.
    #[must_use]
    pub fn to_storage_precision(self) -> Self {
        Self(((self.0 * 100.0).round() / 100.0).clamp(Self::MIN_VALUE, Self::MAX_VALUE))
    }

    /// Returns true if this score is at or above `threshold`.
    ///
    /// Both sides are compared at storage precision so a value that
    /// round-trips through the index keeps the same verdict.
    #[must_use]
    pub fn meets(&self, threshold: Self) -> bool {
        self.to_storage_precision().0 >= threshold.to_storage_precision().0
    }
}

impl Default for Confidence {
    fn default() -> Self {
        Self::zero()
    }
}

impl TryFrom<f32> for Confidence {
    type Error = ValidationError;

    fn try_from(value: f32) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Confidence> for f32 {
    fn from(conf: Confidence) -> Self {
        conf.0
    }
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2}", self.0)
    }
}

/// Indicator the provider uses for an exact full-name match.
pub const EXACT_MATCH_INDICATOR: &str = "全称精确匹配";

/// Indicator the provider uses for a fuzzy match.
pub const FUZZY_MATCH_INDICATOR: &str = "模糊匹配";

/// Indicator the provider uses for a phonetic (pinyin) match.
pub const PHONETIC_MATCH_INDICATOR: &str = "拼音";

/// Score used when the provider returns an indicator the table does not know.
pub const DEFAULT_UNKNOWN_CONFIDENCE: f32 = 0.70;

/// Maps the provider's match-quality indicator to a confidence score.
///
/// Keys are compared after trimming. A missing or unknown indicator scores
/// `default`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceTable {
    entries: BTreeMap<String, Confidence>,
    default: Confidence,
}

impl ConfidenceTable {
    /// Creates a table from explicit entries.
    #[must_use]
    pub fn new(entries: BTreeMap<String, Confidence>, default: Confidence) -> Self {
        Self { entries, default }
    }

    /// Adds or replaces a single entry.
    #[must_use]
    pub fn with_entry(mut self, indicator: impl Into<String>, confidence: Confidence) -> Self {
        self.entries.insert(indicator.into().trim().to_string(), confidence);
        self
    }

    /// Replaces the score used for unknown indicators.
    #[must_use]
    pub fn with_default(mut self, default: Confidence) -> Self {
        self.default = default;
        self
    }

    /// Scores an indicator.
    #[must_use]
    pub fn score(&self, indicator: Option<&str>) -> Confidence {
        indicator
            .map(str::trim)
            .and_then(|key| self.entries.get(key))
            .copied()
            .unwrap_or(self.default)
    }

    /// Returns the fallback score.
    #[must_use]
    pub const fn default_confidence(&self) -> Confidence {
        self.default
    }

    /// Number of mapped indicators.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if no indicator is mapped.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for ConfidenceTable {
    fn default() -> Self {
        let mut entries = BTreeMap::new();
        for (key, value) in [
            (EXACT_MATCH_INDICATOR, 1.00),
            ("exact", 1.00),
            (FUZZY_MATCH_INDICATOR, 0.80),
            ("fuzzy", 0.80),
            (PHONETIC_MATCH_INDICATOR, 0.60),
            ("phonetic", 0.60),
        ] {
            entries.insert(key.to_string(), Confidence(value));
        }
        Self {
            entries,
            default: Confidence(DEFAULT_UNKNOWN_CONFIDENCE),
        }
    }
}
