//! Base concept catalogue and classification.
//!
//! A concept is a named financial line item (`revenue`, `totalAssets`).
//! Classification drives cache TTLs, sign validation, and TTM rules:
//! flow concepts sum across quarters, instant concepts are point-in-time.

/// Income/cash-flow statement concepts measured over a period.
pub const FLOW_CONCEPTS: &[&str] = &[
    "revenue",
    "costOfRevenue",
    "operatingIncome",
    "netIncome",
    "depreciationAmortization",
];

/// Balance-sheet concepts measured at an instant.
pub const INSTANT_CONCEPTS: &[&str] = &[
    "totalAssets",
    "totalLiabilities",
    "shareholdersEquity",
    "currentAssets",
    "currentLiabilities",
];

/// Concepts that legitimately go negative (losses).
pub const SIGNED_CONCEPTS: &[&str] = &["netIncome", "operatingIncome"];

/// Live market concepts get a short cache TTL.
pub const LIVE_CONCEPTS: &[&str] = &["sharePrice", "marketCap"];

pub fn is_flow(concept: &str) -> bool {
    FLOW_CONCEPTS.contains(&concept)
}

pub fn is_instant(concept: &str) -> bool {
    INSTANT_CONCEPTS.contains(&concept)
}

pub fn is_signed(concept: &str) -> bool {
    SIGNED_CONCEPTS.contains(&concept)
}

pub fn is_live(concept: &str) -> bool {
    LIVE_CONCEPTS.contains(&concept)
}

/// Every base concept the engine knows how to fetch.
pub fn all_base_concepts() -> impl Iterator<Item = &'static str> {
    FLOW_CONCEPTS
        .iter()
        .chain(INSTANT_CONCEPTS.iter())
        .chain(LIVE_CONCEPTS.iter())
        .copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flow_and_instant_are_disjoint() {
        for c in FLOW_CONCEPTS {
            assert!(!is_instant(c), "{} classified both flow and instant", c);
        }
    }

    #[test]
    fn signed_concepts_are_flows() {
        for c in SIGNED_CONCEPTS {
            assert!(is_flow(c));
        }
    }
}
