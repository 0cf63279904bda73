//! KPI evaluation over the source router.
//!
//! The engine walks a metric's dependency DAG depth-first, fetching base
//! concepts through the router and computing derived values in Decimal.
//! Each request carries its own memo table, so a concept shared by two
//! branches (revenue under both grossProfit and grossMargin) is fetched
//! once. Composition collects provenance as it goes: citations are
//! deduplicated by source and period, and confidence is the weakest
//! signal seen anywhere in the tree.

pub mod registry;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use metric_core::{
    concepts, Citation, Confidence, EngineError, Entity, Frequency, Period, PeriodHint,
    PeriodRequest,
};
use rust_decimal::Decimal;
use serde::Serialize;
use source_router::{ResolvedFact, SourceRouter};

pub use registry::{InputValues, KpiDefinition, KpiRegistry, RegistryError};

pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(15);

#[derive(Debug, Clone)]
pub struct ComputeRequest {
    pub ticker: String,
    pub metric: String,
    pub period: PeriodRequest,
    pub frequency: Frequency,
    /// Trailing twelve months: flow inputs sum the four most recent
    /// quarters, instant inputs take the latest balance.
    pub ttm: bool,
    pub as_of: Option<NaiveDate>,
}

impl ComputeRequest {
    pub fn latest(ticker: &str, metric: &str) -> Self {
        Self {
            ticker: ticker.to_string(),
            metric: metric.to_string(),
            period: PeriodRequest::Latest,
            frequency: Frequency::Quarterly,
            ttm: false,
            as_of: None,
        }
    }
}

/// The composed answer for one request. Not persisted.
#[derive(Debug, Clone, Serialize)]
pub struct KpiResult {
    pub ticker: String,
    /// Lazily registered entity, once any fetch for the ticker succeeds.
    pub entity: Option<Entity>,
    pub metric: String,
    pub value: Decimal,
    pub unit: String,
    pub period: String,
    pub frequency: Frequency,
    pub ttm: bool,
    pub confidence: Confidence,
    pub citations: Vec<Citation>,
    pub inputs_used: BTreeMap<String, Decimal>,
}

/// One row of the registry listing route.
#[derive(Debug, Clone, Serialize)]
pub struct KpiListing {
    pub name: &'static str,
    pub formula: &'static str,
    pub unit: &'static str,
    pub inputs: Vec<&'static str>,
}

/// Per-request evaluation state. Dropped when the request completes.
#[derive(Default)]
struct EvalContext {
    memo: HashMap<String, Result<Decimal, EngineError>>,
    citations: Vec<Citation>,
    cited: HashSet<(String, String)>,
    inputs_used: BTreeMap<String, Decimal>,
    units: HashMap<String, String>,
    latest_period: Option<Period>,
    any_fallback: bool,
    any_heuristic: bool,
}

impl EvalContext {
    fn record(&mut self, resolved: &ResolvedFact) {
        self.any_fallback |= resolved.fallback_used;
        self.any_heuristic |= resolved.heuristic;

        let period = resolved.fact.period();
        let dedup = (resolved.fact.source_id.clone(), period.label());
        if self.cited.insert(dedup) {
            self.citations.push(Citation {
                source: resolved.fact.source_id.clone(),
                url: resolved.fact.url.clone(),
                period: period.label(),
            });
        }
        if self.latest_period.map_or(true, |p| period.end > p.end) {
            self.latest_period = Some(period);
        }
        self.units
            .entry(resolved.fact.concept.clone())
            .or_insert_with(|| resolved.fact.unit.clone());
    }
}

pub struct CalcEngine {
    registry: KpiRegistry,
    router: Arc<SourceRouter>,
    deadline: Duration,
}

impl CalcEngine {
    pub fn new(registry: KpiRegistry, router: Arc<SourceRouter>) -> Self {
        Self {
            registry,
            router,
            deadline: DEFAULT_DEADLINE,
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// Registry contents for the listing route, sorted by name.
    pub fn list_kpis(&self) -> Vec<KpiListing> {
        let mut listing: Vec<KpiListing> = self
            .registry
            .definitions()
            .map(|def| KpiListing {
                name: def.name,
                formula: def.formula,
                unit: def.unit,
                inputs: def.inputs.to_vec(),
            })
            .collect();
        listing.sort_by_key(|l| l.name);
        listing
    }

    /// Evaluate a metric under the request deadline.
    pub async fn compute(&self, req: &ComputeRequest) -> Result<KpiResult, EngineError> {
        match tokio::time::timeout(self.deadline, self.compute_inner(req)).await {
            Ok(result) => result,
            Err(_elapsed) => {
                tracing::warn!(ticker = %req.ticker, metric = %req.metric, "compute deadline exceeded");
                Err(EngineError::DeadlineExceeded)
            }
        }
    }

    async fn compute_inner(&self, req: &ComputeRequest) -> Result<KpiResult, EngineError> {
        let is_kpi = self.registry.is_kpi(&req.metric);
        if !is_kpi && !concepts::all_base_concepts().any(|c| c == req.metric) {
            return Err(EngineError::NotFound(format!(
                "unknown metric '{}'",
                req.metric
            )));
        }

        let mut ctx = EvalContext::default();
        let value = self.eval_node(req, &req.metric, &mut ctx).await?;

        let confidence = if ctx.any_heuristic {
            Confidence::Low
        } else if ctx.any_fallback {
            Confidence::Medium
        } else {
            Confidence::High
        };
        let unit = match self.registry.get(&req.metric) {
            Some(def) => def.unit.to_string(),
            None => ctx
                .units
                .get(&req.metric)
                .cloned()
                .unwrap_or_else(|| "USD".to_string()),
        };
        let period = ctx
            .latest_period
            .map(|p| p.label())
            .unwrap_or_else(|| "latest".to_string());

        tracing::info!(
            ticker = %req.ticker,
            metric = %req.metric,
            %value,
            %period,
            confidence = ?confidence,
            "computed"
        );
        Ok(KpiResult {
            ticker: req.ticker.to_uppercase(),
            entity: self.router.entity(&req.ticker),
            metric: req.metric.clone(),
            value,
            unit,
            period,
            frequency: req.frequency,
            ttm: req.ttm,
            confidence,
            citations: ctx.citations,
            inputs_used: ctx.inputs_used,
        })
    }

    /// Memoized DFS over the metric DAG. KPI nodes evaluate their inputs
    /// then apply the definition's pure function; base concepts go to the
    /// router. A missing base input surfaces as `Undefined` on the KPI
    /// that needed it, not as a bare `NotFound`.
    fn eval_node<'a>(
        &'a self,
        req: &'a ComputeRequest,
        name: &'a str,
        ctx: &'a mut EvalContext,
    ) -> BoxFuture<'a, Result<Decimal, EngineError>> {
        async move {
            if let Some(prior) = ctx.memo.get(name) {
                return prior.clone();
            }

            let result = match self.registry.get(name) {
                Some(def) => {
                    let def = def.clone();
                    let mut values = InputValues::new();
                    let mut failure: Option<EngineError> = None;
                    for input in def.inputs {
                        match self.eval_node(req, input, &mut *ctx).await {
                            Ok(value) => {
                                values.insert(*input, value);
                            }
                            Err(EngineError::NotFound(detail)) => {
                                failure = Some(EngineError::Undefined(format!(
                                    "{}: input '{}' unavailable ({})",
                                    name, input, detail
                                )));
                                break;
                            }
                            Err(other) => {
                                failure = Some(other);
                                break;
                            }
                        }
                    }
                    match failure {
                        Some(err) => Err(err),
                        None => (def.compute)(&values),
                    }
                }
                None => self.fetch_concept(req, name, ctx).await,
            };

            ctx.memo.insert(name.to_string(), result.clone());
            result
        }
        .boxed()
    }

    async fn fetch_concept(
        &self,
        req: &ComputeRequest,
        concept: &str,
        ctx: &mut EvalContext,
    ) -> Result<Decimal, EngineError> {
        let value = if req.ttm && concepts::is_flow(concept) {
            let window = self
                .router
                .fetch_ttm_window(&req.ticker, concept, req.as_of)
                .await?;
            let mut sum = Decimal::ZERO;
            for resolved in &window {
                ctx.record(resolved);
                sum += resolved.fact.value;
            }
            sum
        } else {
            // Instant concepts under TTM take the latest balance rather
            // than a sum; everything else follows the requested period.
            let hint = if req.ttm {
                PeriodHint {
                    period: PeriodRequest::Latest,
                    frequency: Frequency::Quarterly,
                    as_of: req.as_of,
                }
            } else {
                PeriodHint {
                    period: req.period,
                    frequency: req.frequency,
                    as_of: req.as_of,
                }
            };
            let resolved = self.router.fetch_fact(&req.ticker, concept, &hint).await?;
            ctx.record(&resolved);
            resolved.fact.value
        };
        ctx.inputs_used.insert(concept.to_string(), value);
        Ok(value)
    }
}
