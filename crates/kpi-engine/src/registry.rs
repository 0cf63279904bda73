//! Static KPI registry.
//!
//! Every derived metric is a declarative `(name, inputs, pure function)`
//! tuple over base concepts and other KPIs. The set forms a DAG that is
//! validated once at construction: a cycle or a dangling input is a
//! boot failure, never a request-time surprise.

use std::collections::{HashMap, VecDeque};

use metric_core::concepts;
use metric_core::EngineError;
use rust_decimal::Decimal;
use thiserror::Error;

/// Values of a definition's inputs, keyed by input name.
pub type InputValues = HashMap<&'static str, Decimal>;

pub type ComputeFn = fn(&InputValues) -> Result<Decimal, EngineError>;

#[derive(Clone, Debug)]
pub struct KpiDefinition {
    pub name: &'static str,
    /// Base concepts or other KPI names, evaluated before `compute`.
    pub inputs: &'static [&'static str],
    pub unit: &'static str,
    /// Human-readable formula for the registry listing route.
    pub formula: &'static str,
    pub compute: ComputeFn,
}

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("KPI dependency cycle involving: {0}")]
    Cycle(String),

    #[error("KPI '{kpi}' references unknown input '{input}'")]
    UnknownInput { kpi: &'static str, input: &'static str },

    #[error("duplicate KPI definition '{0}'")]
    Duplicate(&'static str),
}

#[derive(Debug)]
pub struct KpiRegistry {
    definitions: HashMap<&'static str, KpiDefinition>,
}

impl KpiRegistry {
    /// Build and validate a registry from definitions.
    pub fn new(definitions: Vec<KpiDefinition>) -> Result<Self, RegistryError> {
        let mut map: HashMap<&'static str, KpiDefinition> = HashMap::new();
        for def in definitions {
            if map.insert(def.name, def.clone()).is_some() {
                return Err(RegistryError::Duplicate(def.name));
            }
        }

        // Inputs must be either base concepts or other registered KPIs.
        for def in map.values() {
            for input in def.inputs {
                let known_concept = concepts::all_base_concepts().any(|c| c == *input);
                if !known_concept && !map.contains_key(input) {
                    return Err(RegistryError::UnknownInput {
                        kpi: def.name,
                        input,
                    });
                }
            }
        }

        Self::check_acyclic(&map)?;
        Ok(Self { definitions: map })
    }

    /// The built-in metric set.
    pub fn standard() -> Result<Self, RegistryError> {
        Self::new(standard_definitions())
    }

    pub fn get(&self, name: &str) -> Option<&KpiDefinition> {
        self.definitions.get(name)
    }

    pub fn is_kpi(&self, name: &str) -> bool {
        self.definitions.contains_key(name)
    }

    pub fn definitions(&self) -> impl Iterator<Item = &KpiDefinition> {
        self.definitions.values()
    }

    /// Kahn's algorithm over KPI-to-KPI edges. Base concepts are leaves
    /// and cannot participate in a cycle.
    fn check_acyclic(map: &HashMap<&'static str, KpiDefinition>) -> Result<(), RegistryError> {
        let mut in_degree: HashMap<&'static str, usize> =
            map.keys().map(|name| (*name, 0)).collect();
        let mut dependents: HashMap<&'static str, Vec<&'static str>> = HashMap::new();

        for def in map.values() {
            for input in def.inputs {
                if map.contains_key(input) {
                    *in_degree.get_mut(def.name).expect("known kpi") += 1;
                    dependents.entry(input).or_default().push(def.name);
                }
            }
        }

        let mut queue: VecDeque<&'static str> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(name, _)| *name)
            .collect();
        let mut visited = 0usize;

        while let Some(name) = queue.pop_front() {
            visited += 1;
            for dependent in dependents.get(name).into_iter().flatten() {
                let degree = in_degree.get_mut(dependent).expect("known kpi");
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(dependent);
                }
            }
        }

        if visited != map.len() {
            let mut stuck: Vec<&str> = in_degree
                .iter()
                .filter(|(_, d)| **d > 0)
                .map(|(name, _)| *name)
                .collect();
            stuck.sort_unstable();
            return Err(RegistryError::Cycle(stuck.join(", ")));
        }
        Ok(())
    }
}

/// Division that refuses to invent numbers: a zero denominator is an
/// undefined KPI, not infinity and not zero.
fn checked_div(
    numerator: Decimal,
    denominator: Decimal,
    what: &str,
) -> Result<Decimal, EngineError> {
    if denominator.is_zero() {
        return Err(EngineError::Undefined(format!(
            "{}: division by zero denominator",
            what
        )));
    }
    numerator
        .checked_div(denominator)
        .ok_or_else(|| EngineError::Undefined(format!("{}: quotient out of range", what)))
}

fn input(values: &InputValues, name: &'static str) -> Decimal {
    // The evaluator resolves every declared input before calling
    // compute, so a missing key is an engine bug, not bad data.
    *values.get(name).expect("declared input resolved")
}

fn standard_definitions() -> Vec<KpiDefinition> {
    vec![
        KpiDefinition {
            name: "grossProfit",
            inputs: &["revenue", "costOfRevenue"],
            unit: "USD",
            formula: "revenue - costOfRevenue",
            compute: |v| Ok(input(v, "revenue") - input(v, "costOfRevenue")),
        },
        KpiDefinition {
            name: "grossMargin",
            inputs: &["grossProfit", "revenue"],
            unit: "ratio",
            formula: "grossProfit / revenue",
            compute: |v| checked_div(input(v, "grossProfit"), input(v, "revenue"), "grossMargin"),
        },
        KpiDefinition {
            name: "operatingMargin",
            inputs: &["operatingIncome", "revenue"],
            unit: "ratio",
            formula: "operatingIncome / revenue",
            compute: |v| {
                checked_div(input(v, "operatingIncome"), input(v, "revenue"), "operatingMargin")
            },
        },
        KpiDefinition {
            name: "netMargin",
            inputs: &["netIncome", "revenue"],
            unit: "ratio",
            formula: "netIncome / revenue",
            compute: |v| checked_div(input(v, "netIncome"), input(v, "revenue"), "netMargin"),
        },
        KpiDefinition {
            name: "ebitda",
            inputs: &["operatingIncome", "depreciationAmortization"],
            unit: "USD",
            formula: "operatingIncome + depreciationAmortization",
            compute: |v| Ok(input(v, "operatingIncome") + input(v, "depreciationAmortization")),
        },
        KpiDefinition {
            name: "roe",
            inputs: &["netIncome", "shareholdersEquity"],
            unit: "ratio",
            formula: "netIncome / shareholdersEquity",
            compute: |v| checked_div(input(v, "netIncome"), input(v, "shareholdersEquity"), "roe"),
        },
        KpiDefinition {
            name: "roa",
            inputs: &["netIncome", "totalAssets"],
            unit: "ratio",
            formula: "netIncome / totalAssets",
            compute: |v| checked_div(input(v, "netIncome"), input(v, "totalAssets"), "roa"),
        },
        KpiDefinition {
            name: "currentRatio",
            inputs: &["currentAssets", "currentLiabilities"],
            unit: "ratio",
            formula: "currentAssets / currentLiabilities",
            compute: |v| {
                checked_div(input(v, "currentAssets"), input(v, "currentLiabilities"), "currentRatio")
            },
        },
        KpiDefinition {
            name: "debtToEquity",
            inputs: &["totalLiabilities", "shareholdersEquity"],
            unit: "ratio",
            formula: "totalLiabilities / shareholdersEquity",
            compute: |v| {
                checked_div(
                    input(v, "totalLiabilities"),
                    input(v, "shareholdersEquity"),
                    "debtToEquity",
                )
            },
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn standard_registry_is_acyclic() {
        let registry = KpiRegistry::standard().unwrap();
        assert!(registry.is_kpi("grossMargin"));
        assert!(!registry.is_kpi("revenue"));
    }

    #[test]
    fn cycle_is_a_boot_error() {
        let defs = vec![
            KpiDefinition {
                name: "a",
                inputs: &["b"],
                unit: "ratio",
                formula: "b",
                compute: |_| Ok(Decimal::ZERO),
            },
            KpiDefinition {
                name: "b",
                inputs: &["a"],
                unit: "ratio",
                formula: "a",
                compute: |_| Ok(Decimal::ZERO),
            },
        ];
        assert!(matches!(
            KpiRegistry::new(defs).unwrap_err(),
            RegistryError::Cycle(_)
        ));
    }

    #[test]
    fn unknown_input_is_a_boot_error() {
        let defs = vec![KpiDefinition {
            name: "mystery",
            inputs: &["noSuchConcept"],
            unit: "ratio",
            formula: "noSuchConcept",
            compute: |_| Ok(Decimal::ZERO),
        }];
        assert!(matches!(
            KpiRegistry::new(defs).unwrap_err(),
            RegistryError::UnknownInput { .. }
        ));
    }

    #[test]
    fn gross_profit_formula() {
        let registry = KpiRegistry::standard().unwrap();
        let def = registry.get("grossProfit").unwrap();
        let values = InputValues::from([
            ("revenue", dec!(124300000000)),
            ("costOfRevenue", dec!(66025000000)),
        ]);
        assert_eq!((def.compute)(&values).unwrap(), dec!(58275000000));
    }

    #[test]
    fn zero_denominator_is_undefined() {
        let registry = KpiRegistry::standard().unwrap();
        let def = registry.get("currentRatio").unwrap();
        let values = InputValues::from([
            ("currentAssets", dec!(100)),
            ("currentLiabilities", dec!(0)),
        ]);
        assert!(matches!(
            (def.compute)(&values).unwrap_err(),
            EngineError::Undefined(_)
        ));
    }
}
