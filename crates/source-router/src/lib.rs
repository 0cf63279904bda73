//! Health-aware routing across source adapters.
//!
//! One router replaces per-provider orchestration: adapters are data
//! (identity, tier, supported concepts) and the chain logic lives here
//! once. Per request the router consults the fact store, then walks the
//! eligible adapters in priority order with bounded timeouts and retry,
//! gates every candidate through period resolution and validation, and
//! writes accepted facts back through the store. Concurrent identical
//! requests are coalesced so the chain runs at most once per key.

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use dashmap::{DashMap, DashSet};
use fact_store::{ttl_for, FactStore, SingleFlight};
use fact_validation::ValidationRules;
use metric_core::{
    EngineError, Entity, Fact, FactKey, Frequency, PeriodHint, PeriodRequest, PriorityTier,
    SourceAdapter, SourceError,
};

#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Per-adapter call budget.
    pub call_timeout: Duration,
    /// Extra attempts after the first, for retryable errors only.
    pub max_retries: u32,
    /// First backoff; doubles per attempt.
    pub backoff_base: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(5),
            max_retries: 2,
            backoff_base: Duration::from_millis(250),
        }
    }
}

/// A canonical fact plus how the chain arrived at it, for confidence
/// scoring downstream.
#[derive(Debug, Clone)]
pub struct ResolvedFact {
    pub fact: Fact,
    pub tier: PriorityTier,
    /// The winning source was not the first eligible adapter.
    pub fallback_used: bool,
    /// The period resolver needed its magnitude heuristic.
    pub heuristic: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RequestKey {
    ticker: String,
    concept: String,
    period: PeriodRequest,
    frequency: Frequency,
    as_of: Option<NaiveDate>,
    series: bool,
}

impl RequestKey {
    fn single(ticker: &str, concept: &str, hint: &PeriodHint) -> Self {
        Self {
            ticker: ticker.to_uppercase(),
            concept: concept.to_string(),
            period: hint.period,
            frequency: hint.frequency,
            as_of: hint.as_of,
            series: false,
        }
    }

    fn series(ticker: &str, concept: &str, as_of: Option<NaiveDate>) -> Self {
        Self {
            ticker: ticker.to_uppercase(),
            concept: concept.to_string(),
            period: PeriodRequest::Latest,
            frequency: Frequency::Quarterly,
            as_of,
            series: true,
        }
    }
}

pub struct SourceRouter {
    adapters: Vec<Arc<dyn SourceAdapter>>,
    store: Arc<FactStore>,
    rules: Arc<ValidationRules>,
    config: RouterConfig,
    /// Resolved request → canonical cache key, so "latest"-style requests
    /// can short-circuit to the store without re-resolving.
    request_index: DashMap<RequestKey, FactKey>,
    /// Resolved series request → the cache keys of its window quarters.
    series_index: DashMap<RequestKey, Vec<FactKey>>,
    /// Cache keys whose canonical value was picked by the magnitude
    /// heuristic. Warm hits on these keep the low-confidence flag.
    heuristic_keys: DashSet<FactKey>,
    /// Entities registered lazily on first accepted fact per ticker.
    entities: DashMap<String, Entity>,
    flight: SingleFlight<RequestKey, Result<ResolvedFact, EngineError>>,
    series_flight: SingleFlight<RequestKey, Result<Vec<ResolvedFact>, EngineError>>,
}

impl SourceRouter {
    pub fn new(
        mut adapters: Vec<Arc<dyn SourceAdapter>>,
        store: Arc<FactStore>,
        rules: Arc<ValidationRules>,
    ) -> Self {
        adapters.sort_by_key(|a| a.priority_tier());
        Self {
            adapters,
            store,
            rules,
            config: RouterConfig::default(),
            request_index: DashMap::new(),
            series_index: DashMap::new(),
            heuristic_keys: DashSet::new(),
            entities: DashMap::new(),
            flight: SingleFlight::new(),
            series_flight: SingleFlight::new(),
        }
    }

    pub fn with_config(mut self, config: RouterConfig) -> Self {
        self.config = config;
        self
    }

    /// Fetch one canonical fact for a request, walking the fallback
    /// chain on miss.
    pub async fn fetch_fact(
        &self,
        ticker: &str,
        concept: &str,
        hint: &PeriodHint,
    ) -> Result<ResolvedFact, EngineError> {
        let key = RequestKey::single(ticker, concept, hint);
        if let Some(hit) = self.cached(&key) {
            return Ok(hit);
        }

        // Once an earlier resolution has mapped this request onto a
        // canonical cache key, coalesce in the store on that key: two
        // phrasings of the same period ("latest" vs the explicit
        // quarter) then share one upstream flight.
        let indexed = self.request_index.get(&key).map(|entry| entry.value().clone());
        if let Some(fact_key) = indexed {
            let fact = self
                .store
                .get_or_fetch(fact_key, || async {
                    self.fetch_uncoalesced(ticker, concept, hint, &key)
                        .await
                        .map(|resolved| resolved.fact)
                })
                .await?;
            return Ok(self.describe(concept, fact));
        }

        // First time this phrasing is seen: the cache key is unknown
        // until the chain resolves, so coalesce on the request itself.
        self.flight
            .run(
                key.clone(),
                || self.fetch_uncoalesced(ticker, concept, hint, &key),
                |_| {},
            )
            .await
    }

    /// Fetch the resolved quarterly history needed for a TTM window:
    /// exactly four distinct quarters ending at or before `as_of`,
    /// newest first.
    pub async fn fetch_ttm_window(
        &self,
        ticker: &str,
        concept: &str,
        as_of: Option<NaiveDate>,
    ) -> Result<Vec<ResolvedFact>, EngineError> {
        let key = RequestKey::series(ticker, concept, as_of);
        if let Some(window) = self.cached_series(&key) {
            return Ok(window);
        }
        self.series_flight
            .run(
                key.clone(),
                || self.fetch_series_uncoalesced(ticker, concept, as_of, &key),
                |_| {},
            )
            .await
    }

    /// Lazily registered entity for a ticker, if any fetch has succeeded.
    pub fn entity(&self, ticker: &str) -> Option<Entity> {
        self.entities
            .get(&ticker.to_uppercase())
            .map(|entry| entry.value().clone())
    }

    fn cached(&self, key: &RequestKey) -> Option<ResolvedFact> {
        let fact_key = self.request_index.get(key)?.clone();
        let fact = self.store.get(&fact_key)?;
        Some(self.describe(&key.concept, fact))
    }

    /// A cached window is only a hit if every quarter is still live; one
    /// expired entry sends the whole request back through the chain.
    fn cached_series(&self, key: &RequestKey) -> Option<Vec<ResolvedFact>> {
        let fact_keys = self.series_index.get(key)?.value().clone();
        let mut window = Vec::with_capacity(fact_keys.len());
        for fact_key in &fact_keys {
            let fact = self.store.get(fact_key)?;
            window.push(self.describe(&key.concept, fact));
        }
        Some(window)
    }

    /// Reconstruct routing metadata for a fact pulled from the store.
    fn describe(&self, concept: &str, fact: Fact) -> ResolvedFact {
        let first_eligible = self.eligible(concept).into_iter().next();
        let tier = self
            .adapters
            .iter()
            .find(|a| a.source_id() == fact.source_id)
            .map(|a| a.priority_tier())
            .or_else(|| first_eligible.map(|a| a.priority_tier()))
            .unwrap_or(PriorityTier::WebSearch);
        let fallback_used =
            first_eligible.map_or(false, |a| fact.source_id != a.source_id());
        let heuristic = self.heuristic_keys.contains(&fact.key());
        ResolvedFact {
            fact,
            tier,
            fallback_used,
            heuristic,
        }
    }

    /// Write an accepted fact through the store and keep the heuristic
    /// marker and entity registry in step with it.
    fn commit(&self, ticker: &str, resolved: &ResolvedFact) {
        self.store
            .put(resolved.fact.clone(), ttl_for(&resolved.fact.concept));
        let fact_key = resolved.fact.key();
        if resolved.heuristic {
            self.heuristic_keys.insert(fact_key);
        } else {
            self.heuristic_keys.remove(&fact_key);
        }
        self.register_entity(ticker, &resolved.fact);
    }

    fn register_entity(&self, ticker: &str, fact: &Fact) {
        let ticker = ticker.to_uppercase();
        self.entities.entry(ticker.clone()).or_insert_with(|| Entity {
            id: fact.entity_id.clone(),
            name: fact
                .entity_name
                .clone()
                .unwrap_or_else(|| ticker.clone()),
            ticker,
        });
    }

    fn eligible(&self, concept: &str) -> Vec<&Arc<dyn SourceAdapter>> {
        self.adapters.iter().filter(|a| a.supports(concept)).collect()
    }

    async fn fetch_uncoalesced(
        &self,
        ticker: &str,
        concept: &str,
        hint: &PeriodHint,
        key: &RequestKey,
    ) -> Result<ResolvedFact, EngineError> {
        // Re-check under coalescing: a previous leader may have filled
        // the cache while this caller queued.
        if let Some(hit) = self.cached(key) {
            return Ok(hit);
        }

        let eligible = self.eligible(concept);
        if eligible.is_empty() {
            return Err(EngineError::NotFound(format!(
                "no configured source supports concept '{}'",
                concept
            )));
        }

        let mut failures: Vec<String> = Vec::new();
        let mut any_rejection = false;
        let mut all_transient = true;

        for (idx, adapter) in eligible.iter().enumerate() {
            let source = adapter.source_id();
            let candidates = match self.call_with_retry(adapter.as_ref(), ticker, concept, hint).await
            {
                Ok(candidates) => candidates,
                Err(err) => {
                    if !err.is_retryable() {
                        all_transient = false;
                    }
                    tracing::info!(%ticker, %concept, %source, error = %err, "source failed, trying next");
                    failures.push(format!("{}: {}", source, err));
                    continue;
                }
            };

            let resolution = match period_resolver::resolve(candidates, hint) {
                Ok(resolution) => resolution,
                Err(EngineError::NotFound(detail)) => {
                    all_transient = false;
                    failures.push(format!("{}: {}", source, detail));
                    continue;
                }
                // Ambiguity is surfaced, never papered over by falling
                // through to a lower-priority source.
                Err(other) => return Err(other),
            };

            match self.rules.check(ticker, &resolution.fact) {
                Ok(()) => {
                    let resolved = ResolvedFact {
                        tier: adapter.priority_tier(),
                        fallback_used: idx > 0,
                        heuristic: resolution.heuristic,
                        fact: resolution.fact,
                    };
                    self.commit(ticker, &resolved);
                    self.request_index.insert(key.clone(), resolved.fact.key());
                    tracing::debug!(%ticker, %concept, %source, value = %resolved.fact.value, "fact accepted");
                    return Ok(resolved);
                }
                Err(rejection) => {
                    // Known-bad value: make sure no stale copy survives,
                    // then move down the chain instead of returning it.
                    self.store.invalidate(&resolution.fact.key());
                    any_rejection = true;
                    all_transient = false;
                    failures.push(format!("{}: rejected ({})", source, rejection.reason));
                    continue;
                }
            }
        }

        Err(Self::aggregate_failures(
            ticker,
            concept,
            failures,
            any_rejection,
            all_transient,
        ))
    }

    async fn fetch_series_uncoalesced(
        &self,
        ticker: &str,
        concept: &str,
        as_of: Option<NaiveDate>,
        key: &RequestKey,
    ) -> Result<Vec<ResolvedFact>, EngineError> {
        // Re-check under coalescing: a previous leader may have filled
        // the window while this caller queued.
        if let Some(window) = self.cached_series(key) {
            return Ok(window);
        }

        let hint = PeriodHint {
            period: PeriodRequest::Latest,
            frequency: Frequency::Quarterly,
            as_of,
        };
        let eligible = self.eligible(concept);
        if eligible.is_empty() {
            return Err(EngineError::NotFound(format!(
                "no configured source supports concept '{}'",
                concept
            )));
        }

        let mut failures: Vec<String> = Vec::new();
        let mut any_rejection = false;
        let mut any_insufficient: Option<EngineError> = None;
        let mut all_transient = true;

        'adapters: for (idx, adapter) in eligible.iter().enumerate() {
            let source = adapter.source_id();
            let candidates = match self.call_with_retry(adapter.as_ref(), ticker, concept, &hint).await
            {
                Ok(candidates) => candidates,
                Err(err) => {
                    if !err.is_retryable() {
                        all_transient = false;
                    }
                    failures.push(format!("{}: {}", source, err));
                    continue;
                }
            };

            // Resolve one canonical fact per distinct quarter end.
            let mut quarters: Vec<ResolvedFact> = Vec::new();
            let mut ends: Vec<NaiveDate> = candidates
                .iter()
                .filter(|f| f.frequency == Frequency::Quarterly)
                .map(|f| f.period_end)
                .collect();
            ends.sort_unstable();
            ends.dedup();

            for end in ends {
                let group: Vec<Fact> = candidates
                    .iter()
                    .filter(|f| f.period_end == end)
                    .cloned()
                    .collect();
                let group_hint = PeriodHint {
                    period: PeriodRequest::Latest,
                    frequency: Frequency::Quarterly,
                    as_of: Some(end),
                };
                let resolution = match period_resolver::resolve(group, &group_hint) {
                    Ok(resolution) => resolution,
                    Err(err) => {
                        all_transient = false;
                        failures.push(format!("{} ({}): {}", source, end, err));
                        continue 'adapters;
                    }
                };
                if let Err(rejection) = self.rules.check(ticker, &resolution.fact) {
                    self.store.invalidate(&resolution.fact.key());
                    any_rejection = true;
                    all_transient = false;
                    failures.push(format!("{}: rejected ({})", source, rejection.reason));
                    continue 'adapters;
                }
                quarters.push(ResolvedFact {
                    tier: adapter.priority_tier(),
                    fallback_used: idx > 0,
                    heuristic: resolution.heuristic,
                    fact: resolution.fact,
                });
            }

            let window = match period_resolver::select_ttm_window(
                quarters.iter().map(|r| r.fact.clone()).collect(),
                as_of,
            ) {
                Ok(window) => window,
                Err(err @ EngineError::InsufficientHistory(_)) => {
                    // This source is too shallow; a deeper one may still
                    // carry four quarters.
                    all_transient = false;
                    failures.push(format!("{}: {}", source, err));
                    any_insufficient = Some(err);
                    continue;
                }
                Err(other) => return Err(other),
            };

            let selected: Vec<ResolvedFact> = window
                .into_iter()
                .map(|fact| {
                    quarters
                        .iter()
                        .find(|r| r.fact.period_end == fact.period_end)
                        .cloned()
                        .expect("window fact came from quarters")
                })
                .collect();
            for resolved in &selected {
                self.commit(ticker, resolved);
            }
            self.series_index.insert(
                key.clone(),
                selected.iter().map(|r| r.fact.key()).collect(),
            );
            tracing::debug!(%ticker, %concept, %source, "TTM window resolved");
            return Ok(selected);
        }

        if let Some(err) = any_insufficient {
            return Err(err);
        }
        Err(Self::aggregate_failures(
            ticker,
            concept,
            failures,
            any_rejection,
            all_transient,
        ))
    }

    async fn call_with_retry(
        &self,
        adapter: &dyn SourceAdapter,
        ticker: &str,
        concept: &str,
        hint: &PeriodHint,
    ) -> Result<Vec<Fact>, SourceError> {
        let source = adapter.source_id();
        let mut attempt = 0u32;
        loop {
            let outcome =
                tokio::time::timeout(self.config.call_timeout, adapter.fetch(ticker, concept, hint))
                    .await;
            let err = match outcome {
                Ok(Ok(candidates)) => return Ok(candidates),
                Ok(Err(err)) => err,
                Err(_elapsed) => SourceError::Unavailable(format!(
                    "call timed out after {:?}",
                    self.config.call_timeout
                )),
            };

            if err.is_retryable() && attempt < self.config.max_retries {
                let backoff = self.config.backoff_base * 2u32.pow(attempt);
                attempt += 1;
                tracing::warn!(
                    %source,
                    attempt,
                    error = %err,
                    "retrying source after {:?}",
                    backoff
                );
                tokio::time::sleep(backoff).await;
                continue;
            }
            return Err(err);
        }
    }

    fn aggregate_failures(
        ticker: &str,
        concept: &str,
        failures: Vec<String>,
        any_rejection: bool,
        all_transient: bool,
    ) -> EngineError {
        let detail = format!(
            "{} {}: [{}]",
            ticker,
            concept,
            failures.join("; ")
        );
        if any_rejection {
            EngineError::ValidationFailed(detail)
        } else if all_transient && !failures.is_empty() {
            EngineError::SourceUnavailable(detail)
        } else {
            EngineError::NotFound(detail)
        }
    }
}
