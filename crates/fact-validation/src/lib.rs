//! Plausibility checks on raw facts.
//!
//! Validation only ever accepts or rejects. It never corrects a value;
//! correction would blend sources and introduce silent distortions. A
//! rejection tells the router to try the next source; it is logged with
//! the offending value for offline audit.

use std::collections::HashMap;

use metric_core::concepts;
use metric_core::{Fact, Frequency};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PlausibilityBand {
    pub min: Decimal,
    pub max: Decimal,
}

impl PlausibilityBand {
    pub fn new(min: Decimal, max: Decimal) -> Self {
        Self { min, max }
    }

    fn contains(&self, value: Decimal) -> bool {
        value >= self.min && value <= self.max
    }
}

/// Why a fact was turned away. Carried into router diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct EntityBandKey {
    ticker: String,
    concept: String,
    frequency: Frequency,
}

/// Range and sign rules, checked before any fact is cached or returned.
///
/// Two layers: a wide per-concept sanity band (catches unit blunders like
/// thousands-vs-units), and optional per-entity bands tight enough to
/// catch an annual figure mislabeled quarterly.
pub struct ValidationRules {
    concept_bands: HashMap<String, PlausibilityBand>,
    entity_bands: HashMap<EntityBandKey, PlausibilityBand>,
}

impl ValidationRules {
    pub fn new() -> Self {
        Self {
            concept_bands: HashMap::new(),
            entity_bands: HashMap::new(),
        }
    }

    /// Wide sanity defaults for every known concept: nothing a public
    /// company reports exceeds tens of trillions of dollars.
    pub fn with_defaults() -> Self {
        let mut rules = Self::new();
        let sanity_max = dec!(50_000_000_000_000);
        for concept in concepts::all_base_concepts() {
            let min = if concepts::is_signed(concept) {
                -sanity_max
            } else {
                Decimal::ZERO
            };
            rules
                .concept_bands
                .insert(concept.to_string(), PlausibilityBand::new(min, sanity_max));
        }
        rules
    }

    pub fn with_entity_band(
        mut self,
        ticker: &str,
        concept: &str,
        frequency: Frequency,
        band: PlausibilityBand,
    ) -> Self {
        self.entity_bands.insert(
            EntityBandKey {
                ticker: ticker.to_uppercase(),
                concept: concept.to_string(),
                frequency,
            },
            band,
        );
        self
    }

    /// Accept or reject one fact. `ticker` keys the per-entity overrides.
    pub fn check(&self, ticker: &str, fact: &Fact) -> Result<(), Rejection> {
        // Sign rule: flow figures are positive unless the concept is
        // explicitly signed (net income can be a loss).
        if concepts::is_flow(&fact.concept)
            && !concepts::is_signed(&fact.concept)
            && fact.value <= Decimal::ZERO
        {
            return Err(self.reject(
                fact,
                format!("non-positive value {} for flow concept", fact.value),
            ));
        }

        if let Some(band) = self.entity_bands.get(&EntityBandKey {
            ticker: ticker.to_uppercase(),
            concept: fact.concept.clone(),
            frequency: fact.frequency,
        }) {
            if !band.contains(fact.value) {
                return Err(self.reject(
                    fact,
                    format!(
                        "value {} outside entity band [{}, {}]",
                        fact.value, band.min, band.max
                    ),
                ));
            }
        }

        if let Some(band) = self.concept_bands.get(&fact.concept) {
            if !band.contains(fact.value) {
                return Err(self.reject(
                    fact,
                    format!(
                        "value {} outside concept band [{}, {}]",
                        fact.value, band.min, band.max
                    ),
                ));
            }
        }

        Ok(())
    }

    fn reject(&self, fact: &Fact, reason: String) -> Rejection {
        tracing::warn!(
            concept = %fact.concept,
            source = %fact.source_id,
            value = %fact.value,
            period_end = %fact.period_end,
            %reason,
            "rejected implausible fact"
        );
        Rejection { reason }
    }
}

impl Default for ValidationRules {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, Utc};

    fn fact(concept: &str, value: Decimal, frequency: Frequency) -> Fact {
        Fact {
            entity_id: "0000320193".to_string(),
            entity_name: None,
            concept: concept.to_string(),
            period_end: NaiveDate::from_ymd_opt(2024, 12, 28).unwrap(),
            fiscal_quarter: Some(1),
            fiscal_year: Some(2025),
            frequency,
            value,
            unit: "USD".to_string(),
            source_id: "fallback".to_string(),
            retrieved_at: Utc::now(),
            url: None,
            accession: None,
            form: None,
        }
    }

    fn aapl_rules() -> ValidationRules {
        ValidationRules::with_defaults().with_entity_band(
            "AAPL",
            "revenue",
            Frequency::Quarterly,
            PlausibilityBand::new(dec!(20_000_000_000), dec!(120_000_000_000)),
        )
    }

    #[test]
    fn entity_band_rejects_mislabeled_annual_figure() {
        let rules = aapl_rules();
        let annual_as_quarterly = fact("revenue", dec!(202_695_000_000), Frequency::Quarterly);
        let rejection = rules.check("AAPL", &annual_as_quarterly).unwrap_err();
        assert!(rejection.reason.contains("entity band"));
    }

    #[test]
    fn entity_band_accepts_true_quarterly_figure() {
        let rules = aapl_rules();
        let quarterly = fact("revenue", dec!(94_900_000_000), Frequency::Quarterly);
        assert!(rules.check("AAPL", &quarterly).is_ok());
    }

    #[test]
    fn entity_band_does_not_apply_to_other_tickers() {
        let rules = aapl_rules();
        let small_cap = fact("revenue", dec!(1_000_000), Frequency::Quarterly);
        assert!(rules.check("MSFT", &small_cap).is_ok());
    }

    #[test]
    fn negative_revenue_is_rejected() {
        let rules = ValidationRules::with_defaults();
        let negative = fact("revenue", dec!(-5), Frequency::Quarterly);
        assert!(rules.check("AAPL", &negative).is_err());
    }

    #[test]
    fn net_loss_is_accepted() {
        let rules = ValidationRules::with_defaults();
        let loss = fact("netIncome", dec!(-2_000_000_000), Frequency::Quarterly);
        assert!(rules.check("AAPL", &loss).is_ok());
    }

    #[test]
    fn unknown_concept_passes_through() {
        let rules = ValidationRules::with_defaults();
        let odd = fact("someCustomConcept", dec!(42), Frequency::Annual);
        assert!(rules.check("AAPL", &odd).is_ok());
    }
}
