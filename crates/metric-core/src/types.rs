use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Reporting frequency of a fact or request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Frequency {
    #[serde(rename = "Q")]
    Quarterly,
    #[serde(rename = "A")]
    Annual,
}

impl Frequency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Frequency::Quarterly => "Q",
            Frequency::Annual => "A",
        }
    }

    pub fn parse(s: &str) -> Result<Self, EngineError> {
        match s {
            "Q" | "q" => Ok(Frequency::Quarterly),
            "A" | "a" => Ok(Frequency::Annual),
            other => Err(EngineError::NotFound(format!(
                "unknown frequency '{}', expected Q or A",
                other
            ))),
        }
    }
}

/// A covered company. Registered lazily on first successful fetch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    /// Canonical identifier (regulatory filer ID where available).
    pub id: String,
    pub ticker: String,
    pub name: String,
}

/// One observed numeric data point with full provenance.
///
/// Facts are immutable after creation; a re-fetch produces a new Fact,
/// never an update, so citation history survives refreshes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fact {
    pub entity_id: String,
    /// Filer display name when the source reports one. Feeds lazy
    /// entity registration in the router.
    pub entity_name: Option<String>,
    pub concept: String,
    pub period_end: NaiveDate,
    pub fiscal_quarter: Option<u8>,
    pub fiscal_year: Option<i32>,
    pub frequency: Frequency,
    pub value: Decimal,
    pub unit: String,
    pub source_id: String,
    pub retrieved_at: DateTime<Utc>,
    /// Source archive URL for the citation, when the source provides one.
    pub url: Option<String>,
    /// Filing accession number (regulatory sources only).
    pub accession: Option<String>,
    /// Form type, e.g. "10-Q" or "10-K" (regulatory sources only).
    pub form: Option<String>,
}

impl Fact {
    pub fn key(&self) -> FactKey {
        FactKey {
            entity_id: self.entity_id.clone(),
            concept: self.concept.clone(),
            period_end: self.period_end,
            frequency: self.frequency,
        }
    }

    pub fn period(&self) -> Period {
        Period {
            end: self.period_end,
            fiscal_quarter: self.fiscal_quarter,
            fiscal_year: self.fiscal_year,
            frequency: self.frequency,
        }
    }
}

/// Cache identity of a canonical fact. Source is deliberately excluded:
/// the store holds the one fact the router selected as canonical.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FactKey {
    pub entity_id: String,
    pub concept: String,
    pub period_end: NaiveDate,
    pub frequency: Frequency,
}

/// The caller's period phrasing, before resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeriodRequest {
    Latest,
    Quarter { year: i32, quarter: u8 },
    Year(i32),
}

impl PeriodRequest {
    /// Parse "latest", "YYYY-Qn" or "YYYY".
    pub fn parse(s: &str) -> Result<Self, EngineError> {
        if s.eq_ignore_ascii_case("latest") {
            return Ok(PeriodRequest::Latest);
        }
        if let Some((year, quarter)) = s.split_once("-Q") {
            let year: i32 = year
                .parse()
                .map_err(|_| EngineError::NotFound(format!("unparseable period '{}'", s)))?;
            let quarter: u8 = quarter
                .parse()
                .map_err(|_| EngineError::NotFound(format!("unparseable period '{}'", s)))?;
            if !(1..=4).contains(&quarter) {
                return Err(EngineError::NotFound(format!(
                    "quarter out of range in '{}'",
                    s
                )));
            }
            return Ok(PeriodRequest::Quarter { year, quarter });
        }
        s.parse::<i32>()
            .map(PeriodRequest::Year)
            .map_err(|_| EngineError::NotFound(format!("unparseable period '{}'", s)))
    }
}

/// Everything an adapter needs to narrow its candidate search.
#[derive(Debug, Clone)]
pub struct PeriodHint {
    pub period: PeriodRequest,
    pub frequency: Frequency,
    /// Upper bound on period_end; "latest" means latest at or before this.
    pub as_of: Option<NaiveDate>,
}

/// Canonical resolved period, attached to every result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Period {
    pub end: NaiveDate,
    pub fiscal_quarter: Option<u8>,
    pub fiscal_year: Option<i32>,
    pub frequency: Frequency,
}

impl Period {
    /// Human label: "2024-Q4" for quarters, "2024" for fiscal years,
    /// falling back to the period end date when fiscal metadata is absent.
    pub fn label(&self) -> String {
        match (self.frequency, self.fiscal_year, self.fiscal_quarter) {
            (Frequency::Quarterly, Some(fy), Some(fq)) => format!("{}-Q{}", fy, fq),
            (Frequency::Annual, Some(fy), _) => format!("{}", fy),
            _ => self.end.format("%Y-%m-%d").to_string(),
        }
    }
}

/// Adapter ordering in the fallback chain. Lower tiers are tried first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PriorityTier {
    /// Authoritative regulatory filings.
    Regulatory,
    /// Market-data vendors.
    MarketData,
    /// Generic web-search fallback.
    WebSearch,
}

impl PriorityTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            PriorityTier::Regulatory => "regulatory",
            PriorityTier::MarketData => "market-data",
            PriorityTier::WebSearch => "web-search",
        }
    }
}

/// Provenance entry on a returned result, deduplicated by source + period.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Citation {
    pub source: String,
    pub url: Option<String>,
    pub period: String,
}

/// How much the caller should trust the composed result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    /// Heuristic or approximate resolution was involved.
    Low,
    /// At least one input came from a fallback source.
    Medium,
    /// All inputs from the top-priority tier, accepted on first attempt.
    High,
}
