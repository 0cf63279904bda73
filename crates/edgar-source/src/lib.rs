//! SEC EDGAR XBRL company-facts adapter.
//!
//! The authoritative source in the chain. Fetches the full company-facts
//! document for a filer and extracts every reported period for the
//! requested concept, with filing provenance (accession, form, filed
//! date) attached for citations. Concept names map to an ordered list of
//! XBRL tags, US-GAAP first and IFRS equivalents last, tried in order.

use std::collections::{HashMap, VecDeque};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use metric_core::{Fact, Frequency, PeriodHint, PriorityTier, SourceAdapter, SourceError};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::time::Instant;

const BASE_URL: &str = "https://data.sec.gov";
pub const SOURCE_ID: &str = "sec-edgar";

/// Sliding-window rate limiter: at most `max_requests` per `window`.
/// EDGAR's fair-use policy allows 10 req/sec; we default below that.
#[derive(Clone)]
struct RateLimiter {
    timestamps: Arc<Mutex<VecDeque<Instant>>>,
    max_requests: usize,
    window: Duration,
}

impl RateLimiter {
    fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            timestamps: Arc::new(Mutex::new(VecDeque::new())),
            max_requests,
            window,
        }
    }

    async fn acquire(&self) {
        loop {
            let mut ts = self.timestamps.lock().await;
            let now = Instant::now();

            while let Some(&front) = ts.front() {
                if now.duration_since(front) >= self.window {
                    ts.pop_front();
                } else {
                    break;
                }
            }

            if ts.len() < self.max_requests {
                ts.push_back(now);
                return;
            }

            let oldest = *ts.front().expect("window not empty");
            let sleep_dur =
                self.window.saturating_sub(now.duration_since(oldest)) + Duration::from_millis(50);
            drop(ts);
            tracing::debug!("rate limiter: waiting {:.2}s for EDGAR slot", sleep_dur.as_secs_f64());
            tokio::time::sleep(sleep_dur).await;
        }
    }
}

/// Ordered XBRL tag aliases per internal concept. GAAP tags first; the
/// IFRS equivalent closes each list for 20-F filers.
fn concept_aliases() -> HashMap<&'static str, Vec<&'static str>> {
    HashMap::from([
        (
            "revenue",
            vec![
                "RevenueFromContractWithCustomerExcludingAssessedTax",
                "SalesRevenueNet",
                "Revenues",
                "Revenue",
            ],
        ),
        (
            "costOfRevenue",
            vec![
                "CostOfGoodsAndServicesSold",
                "CostOfRevenue",
                "CostOfGoodsSold",
                "CostOfSales",
            ],
        ),
        ("operatingIncome", vec!["OperatingIncomeLoss", "ProfitLossFromOperatingActivities"]),
        ("netIncome", vec!["NetIncomeLoss", "ProfitLoss"]),
        (
            "depreciationAmortization",
            vec![
                "DepreciationDepletionAndAmortization",
                "DepreciationAndAmortization",
                "DepreciationAmortisationAndImpairmentLossReversalOfImpairmentLossRecognisedInProfitOrLoss",
            ],
        ),
        ("totalAssets", vec!["Assets"]),
        ("totalLiabilities", vec!["Liabilities"]),
        ("shareholdersEquity", vec!["StockholdersEquity", "Equity"]),
        ("currentAssets", vec!["AssetsCurrent", "CurrentAssets"]),
        ("currentLiabilities", vec!["LiabilitiesCurrent", "CurrentLiabilities"]),
    ])
}

/// Verified SEC filers. Entities are registered lazily elsewhere; this is
/// the resolution table from ticker to zero-padded CIK.
fn cik_registry() -> HashMap<&'static str, &'static str> {
    HashMap::from([
        ("AAPL", "0000320193"),
        ("MSFT", "0000789019"),
        ("NVDA", "0001045810"),
        ("AMZN", "0001018724"),
        ("GOOGL", "0001652044"),
        ("META", "0001326801"),
        ("TSM", "0001046179"),
        ("SAP", "0001000184"),
        ("ASML", "0000931825"),
        ("SHEL", "0001306965"),
    ])
}

pub struct EdgarAdapter {
    client: Client,
    rate_limiter: RateLimiter,
    base_url: String,
    ciks: HashMap<&'static str, &'static str>,
    aliases: HashMap<&'static str, Vec<&'static str>>,
}

impl EdgarAdapter {
    pub fn new() -> Self {
        // EDGAR asks for a descriptive UA with a contact address.
        let rate_limit: usize = std::env::var("EDGAR_RATE_LIMIT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(8);

        let client = Client::builder()
            .user_agent("FinSight Financial Data (contact@finsight.dev)")
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            client,
            rate_limiter: RateLimiter::new(rate_limit, Duration::from_secs(1)),
            base_url: BASE_URL.to_string(),
            ciks: cik_registry(),
            aliases: concept_aliases(),
        }
    }

    /// Point the adapter at a different host (tests, mirrors).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    async fn fetch_company_facts(&self, cik: &str) -> Result<CompanyFacts, SourceError> {
        self.rate_limiter.acquire().await;
        let url = format!("{}/api/xbrl/companyfacts/CIK{}.json", self.base_url, cik);
        tracing::debug!(%cik, "fetching EDGAR company facts");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| SourceError::Unavailable(e.to_string()))?;

        match response.status().as_u16() {
            200 => {}
            404 => return Err(SourceError::NotFound(format!("no filings for CIK {}", cik))),
            429 => return Err(SourceError::RateLimited),
            status if status >= 500 => {
                return Err(SourceError::Unavailable(format!("EDGAR returned {}", status)))
            }
            status => {
                return Err(SourceError::Malformed(format!(
                    "unexpected EDGAR status {}",
                    status
                )))
            }
        }

        response
            .json::<CompanyFacts>()
            .await
            .map_err(|e| SourceError::Malformed(e.to_string()))
    }
}

impl Default for EdgarAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SourceAdapter for EdgarAdapter {
    fn source_id(&self) -> &'static str {
        SOURCE_ID
    }

    fn priority_tier(&self) -> PriorityTier {
        PriorityTier::Regulatory
    }

    fn supports(&self, concept: &str) -> bool {
        self.aliases.contains_key(concept)
    }

    async fn fetch(
        &self,
        ticker: &str,
        concept: &str,
        _hint: &PeriodHint,
    ) -> Result<Vec<Fact>, SourceError> {
        let cik = self
            .ciks
            .get(ticker.to_uppercase().as_str())
            .copied()
            .ok_or_else(|| SourceError::NotFound(format!("unknown SEC filer '{}'", ticker)))?;

        let aliases = self
            .aliases
            .get(concept)
            .ok_or_else(|| SourceError::NotFound(format!("unsupported concept '{}'", concept)))?;

        let document = self.fetch_company_facts(cik).await?;
        let candidates = extract_candidates(&document, cik, concept, aliases);
        if candidates.is_empty() {
            return Err(SourceError::NotFound(format!(
                "no XBRL facts for {} {}",
                ticker, concept
            )));
        }
        tracing::debug!(%ticker, %concept, count = candidates.len(), "EDGAR candidates extracted");
        Ok(candidates)
    }
}

#[derive(Debug, Deserialize)]
struct CompanyFacts {
    #[serde(rename = "entityName", default)]
    entity_name: Option<String>,
    #[serde(default)]
    facts: HashMap<String, HashMap<String, ConceptFacts>>,
}

#[derive(Debug, Deserialize)]
struct ConceptFacts {
    #[serde(default)]
    units: HashMap<String, Vec<FactRow>>,
}

#[derive(Debug, Deserialize)]
struct FactRow {
    end: String,
    val: serde_json::Number,
    #[serde(default)]
    accn: Option<String>,
    #[serde(default)]
    fy: Option<i32>,
    #[serde(default)]
    fp: Option<String>,
    #[serde(default)]
    form: Option<String>,
}

/// Flatten the company-facts document into candidate Facts for one
/// concept. The first alias with any rows wins, matching the ordered
/// preference (a filer reporting `SalesRevenueNet` should not be mixed
/// with its own `Revenues` rows).
fn extract_candidates(
    document: &CompanyFacts,
    cik: &str,
    concept: &str,
    aliases: &[&str],
) -> Vec<Fact> {
    for taxonomy in ["us-gaap", "ifrs-full"] {
        let Some(taxonomy_facts) = document.facts.get(taxonomy) else {
            continue;
        };
        for alias in aliases {
            let Some(concept_facts) = taxonomy_facts.get(*alias) else {
                continue;
            };
            let mut facts = Vec::new();
            for (unit, rows) in &concept_facts.units {
                for row in rows {
                    if let Some(fact) =
                        row_to_fact(row, cik, document.entity_name.as_deref(), concept, unit)
                    {
                        facts.push(fact);
                    }
                }
            }
            if !facts.is_empty() {
                return facts;
            }
        }
    }
    Vec::new()
}

fn row_to_fact(
    row: &FactRow,
    cik: &str,
    entity_name: Option<&str>,
    concept: &str,
    unit: &str,
) -> Option<Fact> {
    let period_end = NaiveDate::parse_from_str(&row.end, "%Y-%m-%d").ok()?;
    // Parse through the JSON number's text form; going via f64 would
    // reintroduce the float drift Decimal exists to avoid.
    let value = Decimal::from_str(&row.val.to_string()).ok()?;

    let (frequency, fiscal_quarter) = match row.fp.as_deref() {
        Some("FY") => (Frequency::Annual, None),
        Some("Q1") => (Frequency::Quarterly, Some(1)),
        Some("Q2") => (Frequency::Quarterly, Some(2)),
        Some("Q3") => (Frequency::Quarterly, Some(3)),
        Some("Q4") => (Frequency::Quarterly, Some(4)),
        // Unlabeled rows are kept as unlabeled quarterly candidates; the
        // period resolver ranks them below labeled ones.
        _ => (Frequency::Quarterly, None),
    };

    let url = row.accn.as_ref().map(|accn| {
        format!(
            "https://www.sec.gov/Archives/edgar/data/{}/{}/",
            cik.trim_start_matches('0'),
            accn
        )
    });

    Some(Fact {
        entity_id: cik.to_string(),
        entity_name: entity_name.map(str::to_string),
        concept: concept.to_string(),
        period_end,
        fiscal_quarter,
        fiscal_year: row.fy,
        frequency,
        value,
        unit: unit.to_string(),
        source_id: SOURCE_ID.to_string(),
        retrieved_at: Utc::now(),
        url,
        accession: row.accn.clone(),
        form: row.form.clone(),
    })
}
