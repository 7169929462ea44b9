//! HTTP transport for the EQC search-by-name endpoint.
//!
//! The transport only moves bytes and classifies failures. Budget, retry and
//! confidence decisions live in `EqcProvider`, which is tested against
//! scripted transports.

use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::StatusCode;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::TransportError;

use super::retry::saturating_millis;

/// Default public endpoint.
pub const DEFAULT_EQC_BASE_URL: &str = "https://eqc.pingan.com";

const SEARCH_PATH: &str = "/kg-api-hfd/api/search/searchAll";

/// One ranked candidate returned by a name search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchCandidate {
    /// Canonical company ID.
    #[serde(rename = "companyId", deserialize_with = "string_or_number")]
    pub company_id: String,
    /// Registered name.
    #[serde(rename = "officialName", alias = "companyFullName", default)]
    pub official_name: String,
    /// Unified social credit code.
    #[serde(rename = "creditCode", alias = "unite_code", default)]
    pub credit_code: Option<String>,
    /// Raw indicator, mapped through `ConfidenceTable`.
    #[serde(rename = "matchQualityIndicator", alias = "type", default)]
    pub match_quality: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    list: Vec<SearchCandidate>,
}

// The endpoint has returned both `"614810477"` and `614810477`.
fn string_or_number<'de, D: Deserializer<'de>>(de: D) -> Result<String, D::Error> {
    match serde_json::Value::deserialize(de)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "companyId must be a string or number, got {other}"
        ))),
    }
}

/// Sends one search request.
///
/// Implementations must be safe to call from several threads.
pub trait EqcTransport: Send + Sync {
    /// Searches by company name and returns candidates best-first.
    ///
    /// A successful response with no candidates is `Ok(vec![])`.
    fn search(
        &self,
        name: &str,
        token: &str,
        timeout: Duration,
    ) -> Result<Vec<SearchCandidate>, TransportError>;
}

/// Blocking `reqwest` transport with bearer authentication.
#[derive(Debug, Clone)]
pub struct HttpEqcTransport {
    http: Client,
    base_url: String,
}

impl HttpEqcTransport {
    /// Creates a transport against `base_url`.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::ConnectionFailed` if the HTTP client cannot
    /// be built (e.g. TLS backend initialization failed).
    pub fn new(base_url: impl Into<String>) -> Result<Self, TransportError> {
        let http = Client::builder()
            .build()
            .map_err(|e| TransportError::ConnectionFailed {
                message: format!("failed to create HTTP client: {e}"),
            })?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// Base URL requests are sent to.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn classify(e: &reqwest::Error, timeout: Duration) -> TransportError {
        if e.is_timeout() {
            TransportError::Timeout {
                duration_ms: saturating_millis(timeout),
            }
        } else if e.is_decode() {
            TransportError::DeserializationFailed {
                message: e.to_string(),
            }
        } else {
            TransportError::ConnectionFailed {
                message: e.to_string(),
            }
        }
    }
}

impl EqcTransport for HttpEqcTransport {
    fn search(
        &self,
        name: &str,
        token: &str,
        timeout: Duration,
    ) -> Result<Vec<SearchCandidate>, TransportError> {
        let url = format!("{}{SEARCH_PATH}", self.base_url);

        let response = self
            .http
            .get(&url)
            .bearer_auth(token)
            .header("Accept", "application/json")
            .query(&[("key", name), ("currentPage", "1")])
            .timeout(timeout)
            .send()
            .map_err(|e| Self::classify(&e, timeout))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(TransportError::Unauthorized);
        }
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(TransportError::from_status(
                status.as_u16(),
                body.chars().take(200).collect::<String>(),
            ));
        }

        let parsed: SearchResponse = response
            .json()
            .map_err(|e| TransportError::DeserializationFailed {
                message: e.to_string(),
            })?;
        Ok(parsed.list)
    }
}
