//! Generic web-search fallback adapter.
//!
//! Last tier in the chain, backed by an external extraction service
//! (`WEBSEARCH_FINANCE_URL`). When that service is not configured the
//! adapter fails closed with `Unavailable`. It never substitutes
//! placeholder data, so a degraded deployment is visible to callers
//! instead of silently blending mock values into results.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use metric_core::concepts;
use metric_core::{Fact, PeriodHint, PriorityTier, SourceAdapter, SourceError};
use rust_decimal::Decimal;
use serde::Deserialize;

pub const SOURCE_ID: &str = "web-search";

pub struct WebSearchAdapter {
    client: reqwest::Client,
    endpoint: Option<String>,
}

impl WebSearchAdapter {
    /// Reads `WEBSEARCH_FINANCE_URL`; an unset variable leaves the
    /// adapter configured but inert.
    pub fn from_env() -> Self {
        Self::new(std::env::var("WEBSEARCH_FINANCE_URL").ok())
    }

    pub fn new(endpoint: Option<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(15))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            endpoint,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ExtractedFact {
    value: serde_json::Number,
    period_end: String,
    #[serde(default)]
    fiscal_quarter: Option<u8>,
    #[serde(default)]
    fiscal_year: Option<i32>,
    #[serde(default = "default_unit")]
    unit: String,
    #[serde(default)]
    url: Option<String>,
}

fn default_unit() -> String {
    "USD".to_string()
}

#[async_trait]
impl SourceAdapter for WebSearchAdapter {
    fn source_id(&self) -> &'static str {
        SOURCE_ID
    }

    fn priority_tier(&self) -> PriorityTier {
        PriorityTier::WebSearch
    }

    fn supports(&self, concept: &str) -> bool {
        concepts::is_flow(concept) || concepts::is_instant(concept)
    }

    async fn fetch(
        &self,
        ticker: &str,
        concept: &str,
        hint: &PeriodHint,
    ) -> Result<Vec<Fact>, SourceError> {
        let Some(endpoint) = &self.endpoint else {
            // Fail closed: no endpoint means no data, not fake data.
            return Err(SourceError::Unavailable(
                "web-search fallback not configured".to_string(),
            ));
        };

        let response = self
            .client
            .get(endpoint)
            .query(&[
                ("ticker", ticker),
                ("concept", concept),
                ("freq", hint.frequency.as_str()),
            ])
            .send()
            .await
            .map_err(|e| SourceError::Unavailable(e.to_string()))?;

        match response.status().as_u16() {
            200 => {}
            404 => {
                return Err(SourceError::NotFound(format!(
                    "no extracted facts for {} {}",
                    ticker, concept
                )))
            }
            429 => return Err(SourceError::RateLimited),
            status if status >= 500 => {
                return Err(SourceError::Unavailable(format!(
                    "extraction service returned {}",
                    status
                )))
            }
            status => {
                return Err(SourceError::Malformed(format!(
                    "unexpected extraction status {}",
                    status
                )))
            }
        }

        let extracted: Vec<ExtractedFact> = response
            .json()
            .await
            .map_err(|e| SourceError::Malformed(e.to_string()))?;

        let retrieved_at = Utc::now();
        let facts: Vec<Fact> = extracted
            .into_iter()
            .filter_map(|row| {
                let period_end = NaiveDate::parse_from_str(&row.period_end, "%Y-%m-%d").ok()?;
                let value = Decimal::from_str(&row.value.to_string()).ok()?;
                Some(Fact {
                    entity_id: ticker.to_uppercase(),
                    entity_name: None,
                    concept: concept.to_string(),
                    period_end,
                    fiscal_quarter: row.fiscal_quarter,
                    fiscal_year: row.fiscal_year,
                    frequency: hint.frequency,
                    value,
                    unit: row.unit,
                    source_id: SOURCE_ID.to_string(),
                    retrieved_at,
                    url: row.url,
                    accession: None,
                    form: None,
                })
            })
            .collect();

        if facts.is_empty() {
            return Err(SourceError::NotFound(format!(
                "extraction returned no usable facts for {} {}",
                ticker, concept
            )));
        }
        tracing::debug!(%ticker, %concept, count = facts.len(), "web-search facts extracted");
        Ok(facts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metric_core::{Frequency, PeriodRequest};

    fn hint() -> PeriodHint {
        PeriodHint {
            period: PeriodRequest::Latest,
            frequency: Frequency::Quarterly,
            as_of: None,
        }
    }

    #[tokio::test]
    async fn unconfigured_adapter_fails_closed() {
        let adapter = WebSearchAdapter::new(None);
        let err = adapter.fetch("AAPL", "revenue", &hint()).await.unwrap_err();
        assert!(matches!(err, SourceError::Unavailable(_)));
    }

    #[test]
    fn declares_fallback_tier() {
        let adapter = WebSearchAdapter::new(None);
        assert_eq!(adapter.priority_tier(), PriorityTier::WebSearch);
        assert!(adapter.supports("revenue"));
        assert!(!adapter.supports("sharePrice"));
    }
}
