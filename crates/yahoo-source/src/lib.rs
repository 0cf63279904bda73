//! Yahoo Finance quote-summary adapter.
//!
//! Market-data tier: fast and broad but without fiscal labels, so its
//! candidates only satisfy "latest" requests (the period resolver skips
//! unlabeled facts for explicit fiscal quarters). Also the only source
//! for live concepts (`sharePrice`, `marketCap`).

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metric_core::{Fact, Frequency, PeriodHint, PriorityTier, SourceAdapter, SourceError};
use rust_decimal::Decimal;

const BASE_URL: &str = "https://query2.finance.yahoo.com/v10/finance/quoteSummary";
pub const SOURCE_ID: &str = "yahoo-finance";

/// Statement concepts served from the quarterly/annual history modules.
const STATEMENT_CONCEPTS: &[(&str, &str)] = &[
    ("revenue", "totalRevenue"),
    ("costOfRevenue", "costOfRevenue"),
    ("operatingIncome", "operatingIncome"),
    ("netIncome", "netIncome"),
    ("totalAssets", "totalAssets"),
    ("totalLiabilities", "totalLiab"),
    ("shareholdersEquity", "totalStockholderEquity"),
    ("currentAssets", "totalCurrentAssets"),
    ("currentLiabilities", "totalCurrentLiabilities"),
];

const LIVE_CONCEPTS: &[(&str, &str)] = &[
    ("sharePrice", "regularMarketPrice"),
    ("marketCap", "marketCap"),
];

fn yahoo_field(concept: &str) -> Option<&'static str> {
    STATEMENT_CONCEPTS
        .iter()
        .chain(LIVE_CONCEPTS.iter())
        .find(|(name, _)| *name == concept)
        .map(|(_, field)| *field)
}

fn is_live(concept: &str) -> bool {
    LIVE_CONCEPTS.iter().any(|(name, _)| *name == concept)
}

fn is_balance(concept: &str) -> bool {
    matches!(
        concept,
        "totalAssets"
            | "totalLiabilities"
            | "shareholdersEquity"
            | "currentAssets"
            | "currentLiabilities"
    )
}

fn module_for(concept: &str, frequency: Frequency) -> &'static str {
    if is_live(concept) {
        "price"
    } else if is_balance(concept) {
        match frequency {
            Frequency::Quarterly => "balanceSheetHistoryQuarterly",
            Frequency::Annual => "balanceSheetHistory",
        }
    } else {
        match frequency {
            Frequency::Quarterly => "incomeStatementHistoryQuarterly",
            Frequency::Annual => "incomeStatementHistory",
        }
    }
}

#[derive(Clone)]
pub struct YahooAdapter {
    client: reqwest::Client,
    base_url: String,
}

impl YahooAdapter {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .user_agent("Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36")
                .timeout(std::time::Duration::from_secs(15))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            base_url: BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

impl Default for YahooAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SourceAdapter for YahooAdapter {
    fn source_id(&self) -> &'static str {
        SOURCE_ID
    }

    fn priority_tier(&self) -> PriorityTier {
        PriorityTier::MarketData
    }

    fn supports(&self, concept: &str) -> bool {
        yahoo_field(concept).is_some()
    }

    async fn fetch(
        &self,
        ticker: &str,
        concept: &str,
        hint: &PeriodHint,
    ) -> Result<Vec<Fact>, SourceError> {
        let module = module_for(concept, hint.frequency);
        let url = format!("{}/{}?modules={}", self.base_url, ticker, module);
        tracing::debug!(%ticker, %concept, %module, "fetching Yahoo quote summary");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| SourceError::Unavailable(e.to_string()))?;

        match response.status().as_u16() {
            200 => {}
            404 => {
                return Err(SourceError::NotFound(format!(
                    "Yahoo has no data for '{}'",
                    ticker
                )))
            }
            429 => return Err(SourceError::RateLimited),
            status if status >= 500 => {
                return Err(SourceError::Unavailable(format!("Yahoo returned {}", status)))
            }
            status => {
                return Err(SourceError::Malformed(format!(
                    "unexpected Yahoo status {}",
                    status
                )))
            }
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| SourceError::Malformed(e.to_string()))?;

        let facts = facts_from_quote_summary(&json, ticker, concept, hint.frequency, Utc::now());
        if facts.is_empty() {
            return Err(SourceError::NotFound(format!(
                "no {} data in Yahoo response for {}",
                concept, ticker
            )));
        }
        Ok(facts)
    }
}

/// Pull candidate facts out of a quoteSummary document. Yahoo wraps
/// numbers as `{"raw": ..., "fmt": "..."}`; we parse the raw number's
/// text form straight into Decimal.
fn facts_from_quote_summary(
    json: &serde_json::Value,
    ticker: &str,
    concept: &str,
    frequency: Frequency,
    retrieved_at: DateTime<Utc>,
) -> Vec<Fact> {
    let Some(result) = json
        .get("quoteSummary")
        .and_then(|v| v.get("result"))
        .and_then(|v| v.as_array())
        .and_then(|arr| arr.first())
    else {
        return Vec::new();
    };

    if is_live(concept) {
        let field = yahoo_field(concept).expect("live concept has a field");
        let Some(value) = result
            .get("price")
            .and_then(|p| p.get(field))
            .and_then(raw_decimal)
        else {
            return Vec::new();
        };
        let entity_name = result
            .get("price")
            .and_then(|p| p.get("longName"))
            .and_then(|v| v.as_str())
            .map(str::to_string);
        return vec![Fact {
            entity_id: ticker.to_uppercase(),
            entity_name,
            concept: concept.to_string(),
            period_end: retrieved_at.date_naive(),
            fiscal_quarter: None,
            fiscal_year: None,
            frequency,
            value,
            unit: "USD".to_string(),
            source_id: SOURCE_ID.to_string(),
            retrieved_at,
            url: Some(format!("https://finance.yahoo.com/quote/{}", ticker)),
            accession: None,
            form: None,
        }];
    }

    let module = module_for(concept, frequency);
    let (history_key, statement_key) = if is_balance(concept) {
        (module, "balanceSheetStatements")
    } else {
        (module, "incomeStatementHistory")
    };

    let Some(statements) = result
        .get(history_key)
        .and_then(|v| v.get(statement_key))
        .and_then(|v| v.as_array())
    else {
        return Vec::new();
    };

    let field = match yahoo_field(concept) {
        Some(field) => field,
        None => return Vec::new(),
    };

    statements
        .iter()
        .filter_map(|statement| {
            let end = statement
                .get("endDate")
                .and_then(|v| v.get("fmt"))
                .and_then(|v| v.as_str())?;
            let period_end = chrono::NaiveDate::parse_from_str(end, "%Y-%m-%d").ok()?;
            let value = statement.get(field).and_then(raw_decimal)?;
            Some(Fact {
                entity_id: ticker.to_uppercase(),
                // Statement modules do not name the filer.
                entity_name: None,
                concept: concept.to_string(),
                period_end,
                // Yahoo statements carry no fiscal labels; the resolver
                // treats these as unlabeled candidates.
                fiscal_quarter: None,
                fiscal_year: None,
                frequency,
                value,
                unit: "USD".to_string(),
                source_id: SOURCE_ID.to_string(),
                retrieved_at,
                url: Some(format!("https://finance.yahoo.com/quote/{}/financials", ticker)),
                accession: None,
                form: None,
            })
        })
        .collect()
}

fn raw_decimal(wrapped: &serde_json::Value) -> Option<Decimal> {
    let raw = wrapped.get("raw")?;
    Decimal::from_str(&raw.to_string()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn parses_quarterly_income_statements() {
        let json: serde_json::Value = serde_json::from_str(
            r#"{
                "quoteSummary": {
                    "result": [{
                        "incomeStatementHistoryQuarterly": {
                            "incomeStatementHistory": [
                                {"endDate": {"raw": 1735344000, "fmt": "2024-12-28"},
                                 "totalRevenue": {"raw": 124300000000, "fmt": "124.3B"}},
                                {"endDate": {"raw": 1727481600, "fmt": "2024-09-28"},
                                 "totalRevenue": {"raw": 94930000000, "fmt": "94.93B"}}
                            ]
                        }
                    }],
                    "error": null
                }
            }"#,
        )
        .unwrap();

        let facts =
            facts_from_quote_summary(&json, "AAPL", "revenue", Frequency::Quarterly, Utc::now());
        assert_eq!(facts.len(), 2);
        assert_eq!(facts[0].value, dec!(124300000000));
        assert_eq!(facts[0].fiscal_quarter, None);
        assert_eq!(facts[0].source_id, SOURCE_ID);
    }

    #[test]
    fn parses_live_price() {
        let json: serde_json::Value = serde_json::from_str(
            r#"{
                "quoteSummary": {
                    "result": [{
                        "price": {
                            "regularMarketPrice": {"raw": 232.47, "fmt": "232.47"},
                            "marketCap": {"raw": 3500000000000, "fmt": "3.5T"}
                        }
                    }],
                    "error": null
                }
            }"#,
        )
        .unwrap();

        let facts =
            facts_from_quote_summary(&json, "AAPL", "sharePrice", Frequency::Quarterly, Utc::now());
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].value, dec!(232.47));

        let caps =
            facts_from_quote_summary(&json, "AAPL", "marketCap", Frequency::Quarterly, Utc::now());
        assert_eq!(caps[0].value, dec!(3500000000000));
    }

    #[test]
    fn empty_result_yields_no_facts() {
        let json: serde_json::Value =
            serde_json::from_str(r#"{"quoteSummary": {"result": [], "error": null}}"#).unwrap();
        let facts =
            facts_from_quote_summary(&json, "ZZZZ", "revenue", Frequency::Quarterly, Utc::now());
        assert!(facts.is_empty());
    }

    #[test]
    fn declares_market_data_tier() {
        let adapter = YahooAdapter::new();
        assert_eq!(adapter.priority_tier(), PriorityTier::MarketData);
        assert!(adapter.supports("revenue"));
        assert!(adapter.supports("marketCap"));
        assert!(!adapter.supports("depreciationAmortization"));
    }
}
