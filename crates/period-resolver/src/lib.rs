//! Canonical-period disambiguation.
//!
//! Adapters return every filing candidate they can see for a request; a
//! 10-Q and a 10-K routinely cover overlapping ranges, and fiscal years
//! do not line up with calendar years (Apple's Q1 ends in December).
//! This crate picks exactly one canonical period per request, or refuses
//! with a typed error when the rules cannot decide. It never guesses:
//! the one heuristic it carries (smaller magnitude wins when an annual
//! figure may be mislabeled quarterly) is flagged on the resolution so
//! the composer can cap confidence at `low`.

use chrono::NaiveDate;
use metric_core::{EngineError, Fact, Frequency, PeriodHint, PeriodRequest};
use rust_decimal::Decimal;

/// The chosen fact plus how it was chosen.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub fact: Fact,
    /// Set when the magnitude heuristic decided between candidates.
    pub heuristic: bool,
}

/// A quarterly figure should be well under half an annual one; anything
/// closer than this is a genuine tie.
const MAGNITUDE_SEPARATION: u32 = 2;

/// Pick one canonical fact out of an adapter's candidate list.
pub fn resolve(mut candidates: Vec<Fact>, hint: &PeriodHint) -> Result<Resolution, EngineError> {
    candidates.retain(|f| f.frequency == hint.frequency);
    if let Some(as_of) = hint.as_of {
        candidates.retain(|f| f.period_end <= as_of);
    }

    // Fiscal alignment is driven by source metadata only. An explicit
    // quarter request never matches a fact that lacks fiscal labels.
    match hint.period {
        PeriodRequest::Latest => {}
        PeriodRequest::Quarter { year, quarter } => {
            candidates
                .retain(|f| f.fiscal_year == Some(year) && f.fiscal_quarter == Some(quarter));
        }
        PeriodRequest::Year(year) => {
            candidates.retain(|f| f.fiscal_year == Some(year));
        }
    }

    let latest_end = candidates
        .iter()
        .map(|f| f.period_end)
        .max()
        .ok_or_else(|| {
            EngineError::NotFound(format!(
                "no {} candidate matched the requested period",
                hint.frequency.as_str()
            ))
        })?;
    candidates.retain(|f| f.period_end == latest_end);

    match hint.frequency {
        Frequency::Quarterly => resolve_quarterly(candidates),
        Frequency::Annual => resolve_annual(candidates),
    }
}

fn resolve_quarterly(candidates: Vec<Fact>) -> Result<Resolution, EngineError> {
    // Rule 1: facts carrying a fiscal quarter label beat unlabeled ones.
    let labeled: Vec<Fact> = candidates
        .iter()
        .filter(|f| f.fiscal_quarter.is_some())
        .cloned()
        .collect();
    let pool = if labeled.is_empty() { candidates } else { labeled };

    pick_by_magnitude(pool)
}

fn resolve_annual(candidates: Vec<Fact>) -> Result<Resolution, EngineError> {
    // Annual rule: a real fiscal-year fact has no quarter label.
    let fiscal_year_only: Vec<Fact> = candidates
        .iter()
        .filter(|f| f.fiscal_quarter.is_none())
        .cloned()
        .collect();
    let pool = if fiscal_year_only.is_empty() {
        candidates
    } else {
        fiscal_year_only
    };

    let deduped = dedupe_identical(pool);
    match deduped.as_slice() {
        [single] => Ok(Resolution {
            fact: single.clone(),
            heuristic: false,
        }),
        many => Err(EngineError::AmbiguousPeriod(format!(
            "{} annual candidates share period_end {}",
            many.len(),
            many[0].period_end
        ))),
    }
}

/// Rule 2, last resort: when one survivor's magnitude is clearly smaller
/// than the rest, it is probably the true quarterly figure and the larger
/// one an annual figure mislabeled quarterly. Resolutions taken this way
/// are flagged so they surface as low confidence, never high.
fn pick_by_magnitude(pool: Vec<Fact>) -> Result<Resolution, EngineError> {
    let deduped = dedupe_identical(pool);
    if let [single] = deduped.as_slice() {
        return Ok(Resolution {
            fact: single.clone(),
            heuristic: false,
        });
    }

    let mut by_magnitude: Vec<Fact> = deduped;
    by_magnitude.sort_by(|a, b| a.value.abs().cmp(&b.value.abs()));

    let smallest = by_magnitude[0].value.abs();
    let next = by_magnitude[1].value.abs();
    if smallest * Decimal::from(MAGNITUDE_SEPARATION) < next {
        tracing::warn!(
            concept = %by_magnitude[0].concept,
            period_end = %by_magnitude[0].period_end,
            chosen = %by_magnitude[0].value,
            rejected = %by_magnitude[1].value,
            "magnitude heuristic resolved overlapping quarterly candidates"
        );
        return Ok(Resolution {
            fact: by_magnitude[0].clone(),
            heuristic: true,
        });
    }

    Err(EngineError::AmbiguousPeriod(format!(
        "{} quarterly candidates with period_end {} and comparable magnitude",
        by_magnitude.len(),
        by_magnitude[0].period_end
    )))
}

/// The same filing often appears under several XBRL tags with one value;
/// those are duplicates, not an ambiguity.
fn dedupe_identical(mut pool: Vec<Fact>) -> Vec<Fact> {
    pool.sort_by(|a, b| a.value.cmp(&b.value));
    pool.dedup_by(|a, b| a.value == b.value);
    pool
}

/// Select the TTM window: the four most recent distinct quarters ending
/// at or before `as_of`. Fewer than four is a hard failure, never a
/// partial sum.
pub fn select_ttm_window(
    mut candidates: Vec<Fact>,
    as_of: Option<NaiveDate>,
) -> Result<Vec<Fact>, EngineError> {
    candidates.retain(|f| f.frequency == Frequency::Quarterly);
    if let Some(as_of) = as_of {
        candidates.retain(|f| f.period_end <= as_of);
    }
    candidates.sort_by(|a, b| b.period_end.cmp(&a.period_end));
    candidates.dedup_by(|a, b| a.period_end == b.period_end);

    if candidates.len() < 4 {
        return Err(EngineError::InsufficientHistory(format!(
            "TTM requires 4 quarters, only {} available",
            candidates.len()
        )));
    }
    candidates.truncate(4);
    Ok(candidates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn fact(
        end: (i32, u32, u32),
        fq: Option<u8>,
        fy: Option<i32>,
        freq: Frequency,
        value: Decimal,
    ) -> Fact {
        Fact {
            entity_id: "0000320193".to_string(),
            entity_name: None,
            concept: "revenue".to_string(),
            period_end: NaiveDate::from_ymd_opt(end.0, end.1, end.2).unwrap(),
            fiscal_quarter: fq,
            fiscal_year: fy,
            frequency: freq,
            value,
            unit: "USD".to_string(),
            source_id: "edgar".to_string(),
            retrieved_at: Utc::now(),
            url: None,
            accession: None,
            form: None,
        }
    }

    fn quarterly_hint(period: PeriodRequest) -> PeriodHint {
        PeriodHint {
            period,
            frequency: Frequency::Quarterly,
            as_of: None,
        }
    }

    #[test]
    fn explicit_quarter_matches_fiscal_metadata_not_calendar() {
        // Fiscal 2025 Q1 ends in calendar December 2024.
        let candidates = vec![
            fact((2024, 12, 28), Some(1), Some(2025), Frequency::Quarterly, dec!(124300000000)),
            fact((2024, 9, 28), Some(4), Some(2024), Frequency::Quarterly, dec!(94930000000)),
        ];
        let hint = quarterly_hint(PeriodRequest::Quarter { year: 2025, quarter: 1 });
        let resolved = resolve(candidates, &hint).unwrap();
        assert_eq!(resolved.fact.fiscal_year, Some(2025));
        assert!(!resolved.heuristic);
    }

    #[test]
    fn labeled_quarter_beats_unlabeled() {
        let candidates = vec![
            fact((2024, 9, 28), None, Some(2024), Frequency::Quarterly, dec!(391035000000)),
            fact((2024, 9, 28), Some(4), Some(2024), Frequency::Quarterly, dec!(94930000000)),
        ];
        let resolved = resolve(candidates, &quarterly_hint(PeriodRequest::Latest)).unwrap();
        assert_eq!(resolved.fact.value, dec!(94930000000));
        assert!(!resolved.heuristic);
    }

    #[test]
    fn magnitude_heuristic_flags_resolution() {
        // Both labeled quarterly, one is really the full-year figure.
        let candidates = vec![
            fact((2024, 9, 28), Some(4), Some(2024), Frequency::Quarterly, dec!(391035000000)),
            fact((2024, 9, 28), Some(4), Some(2024), Frequency::Quarterly, dec!(94930000000)),
        ];
        let resolved = resolve(candidates, &quarterly_hint(PeriodRequest::Latest)).unwrap();
        assert_eq!(resolved.fact.value, dec!(94930000000));
        assert!(resolved.heuristic);
    }

    #[test]
    fn comparable_magnitudes_are_ambiguous() {
        let candidates = vec![
            fact((2024, 9, 28), Some(4), Some(2024), Frequency::Quarterly, dec!(94930000000)),
            fact((2024, 9, 28), Some(4), Some(2024), Frequency::Quarterly, dec!(91000000000)),
        ];
        let err = resolve(candidates, &quarterly_hint(PeriodRequest::Latest)).unwrap_err();
        assert!(matches!(err, EngineError::AmbiguousPeriod(_)));
    }

    #[test]
    fn identical_values_are_duplicates_not_ambiguity() {
        let candidates = vec![
            fact((2024, 9, 28), Some(4), Some(2024), Frequency::Quarterly, dec!(94930000000)),
            fact((2024, 9, 28), Some(4), Some(2024), Frequency::Quarterly, dec!(94930000000)),
        ];
        let resolved = resolve(candidates, &quarterly_hint(PeriodRequest::Latest)).unwrap();
        assert!(!resolved.heuristic);
    }

    #[test]
    fn annual_prefers_unlabeled_fiscal_year_row() {
        let candidates = vec![
            fact((2024, 9, 28), Some(4), Some(2024), Frequency::Annual, dec!(94930000000)),
            fact((2024, 9, 28), None, Some(2024), Frequency::Annual, dec!(391035000000)),
        ];
        let hint = PeriodHint {
            period: PeriodRequest::Year(2024),
            frequency: Frequency::Annual,
            as_of: None,
        };
        let resolved = resolve(candidates, &hint).unwrap();
        assert_eq!(resolved.fact.value, dec!(391035000000));
    }

    #[test]
    fn as_of_bounds_latest() {
        let candidates = vec![
            fact((2024, 12, 28), Some(1), Some(2025), Frequency::Quarterly, dec!(124300000000)),
            fact((2024, 9, 28), Some(4), Some(2024), Frequency::Quarterly, dec!(94930000000)),
        ];
        let hint = PeriodHint {
            period: PeriodRequest::Latest,
            frequency: Frequency::Quarterly,
            as_of: NaiveDate::from_ymd_opt(2024, 10, 1),
        };
        let resolved = resolve(candidates, &hint).unwrap();
        assert_eq!(resolved.fact.fiscal_quarter, Some(4));
    }

    #[test]
    fn no_match_is_not_found() {
        let candidates = vec![fact(
            (2024, 9, 28),
            Some(4),
            Some(2024),
            Frequency::Quarterly,
            dec!(94930000000),
        )];
        let hint = quarterly_hint(PeriodRequest::Quarter { year: 2019, quarter: 2 });
        assert!(matches!(
            resolve(candidates, &hint).unwrap_err(),
            EngineError::NotFound(_)
        ));
    }

    #[test]
    fn ttm_window_takes_four_most_recent_quarters() {
        let candidates = vec![
            fact((2024, 3, 30), Some(2), Some(2024), Frequency::Quarterly, dec!(90753000000)),
            fact((2024, 12, 28), Some(1), Some(2025), Frequency::Quarterly, dec!(124300000000)),
            fact((2024, 6, 29), Some(3), Some(2024), Frequency::Quarterly, dec!(85777000000)),
            fact((2023, 12, 30), Some(1), Some(2024), Frequency::Quarterly, dec!(119575000000)),
            fact((2024, 9, 28), Some(4), Some(2024), Frequency::Quarterly, dec!(94930000000)),
        ];
        let window = select_ttm_window(candidates, None).unwrap();
        assert_eq!(window.len(), 4);
        assert_eq!(
            window[0].period_end,
            NaiveDate::from_ymd_opt(2024, 12, 28).unwrap()
        );
        assert_eq!(
            window[3].period_end,
            NaiveDate::from_ymd_opt(2024, 3, 30).unwrap()
        );
    }

    #[test]
    fn ttm_with_three_quarters_fails() {
        let candidates = vec![
            fact((2024, 12, 28), Some(1), Some(2025), Frequency::Quarterly, dec!(1)),
            fact((2024, 9, 28), Some(4), Some(2024), Frequency::Quarterly, dec!(2)),
            fact((2024, 6, 29), Some(3), Some(2024), Frequency::Quarterly, dec!(3)),
        ];
        assert!(matches!(
            select_ttm_window(candidates, None).unwrap_err(),
            EngineError::InsufficientHistory(_)
        ));
    }
}
