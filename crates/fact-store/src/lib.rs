//! Canonical fact cache with TTL expiry and per-key single-flight.
//!
//! The store is the only mutable shared structure in the engine. All
//! access goes through `get`/`get_or_fetch`/`put`/`invalidate`; the
//! router is the only writer. The core concurrency guarantee lives in
//! `get_or_fetch`: at most one upstream fetch is in flight per key, and
//! every concurrent caller for that key shares its outcome.

pub mod singleflight;

use std::future::Future;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use metric_core::concepts;
use metric_core::{EngineError, Fact, FactKey};

pub use singleflight::SingleFlight;

/// Quarterly/annual filings barely change; cache for a day.
pub const FILING_TTL: Duration = Duration::hours(24);
/// Live market concepts go stale fast.
pub const LIVE_TTL: Duration = Duration::minutes(5);

pub fn ttl_for(concept: &str) -> Duration {
    if concepts::is_live(concept) {
        LIVE_TTL
    } else {
        FILING_TTL
    }
}

struct CacheEntry {
    fact: Fact,
    expires_at: DateTime<Utc>,
}

pub struct FactStore {
    entries: DashMap<FactKey, CacheEntry>,
    flight: SingleFlight<FactKey, Result<Fact, EngineError>>,
}

impl FactStore {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            flight: SingleFlight::new(),
        }
    }

    /// Synchronous cache lookup. Never touches the network. Expired
    /// entries are evicted lazily here.
    pub fn get(&self, key: &FactKey) -> Option<Fact> {
        if let Some(entry) = self.entries.get(key) {
            if entry.expires_at > Utc::now() {
                return Some(entry.fact.clone());
            }
        }
        // Expired or absent; drop the read guard before removing.
        self.entries.remove_if(key, |_, e| e.expires_at <= Utc::now());
        None
    }

    pub fn put(&self, fact: Fact, ttl: Duration) {
        let key = fact.key();
        self.entries.insert(
            key,
            CacheEntry {
                fact,
                expires_at: Utc::now() + ttl,
            },
        );
    }

    /// Explicit eviction, used after a validation failure so a known-bad
    /// value cannot linger.
    pub fn invalidate(&self, key: &FactKey) {
        if self.entries.remove(key).is_some() {
            tracing::debug!(concept = %key.concept, period_end = %key.period_end, "evicted cache entry");
        }
    }

    /// Coalescing fetch: a cache hit returns immediately; otherwise the
    /// first caller for `key` becomes the leader and runs `fetch_fn`,
    /// and every concurrent caller awaits the leader's outcome. Errors
    /// are delivered to all waiters but never cached; the next call
    /// retries from scratch, since upstream failures are often transient.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        key: FactKey,
        fetch_fn: F,
    ) -> Result<Fact, EngineError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Fact, EngineError>>,
    {
        if let Some(fact) = self.get(&key) {
            return Ok(fact);
        }

        // Only the elected leader invokes fetch_fn; a caller leads at
        // most once per get_or_fetch, so the take() cannot fire twice.
        let mut fetch_fn = Some(fetch_fn);
        let ttl = ttl_for(&key.concept);
        self.flight
            .run(
                key,
                move || {
                    let fetch = fetch_fn.take().expect("single-flight leader elected twice");
                    fetch()
                },
                |result| {
                    // Write-through before waiters are released, so late
                    // arrivals hit the cache instead of re-flying.
                    if let Ok(fact) = result {
                        self.put(fact.clone(), ttl);
                    }
                },
            )
            .await
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for FactStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use metric_core::Frequency;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn test_fact(concept: &str, value: rust_decimal::Decimal) -> Fact {
        Fact {
            entity_id: "0000320193".to_string(),
            entity_name: None,
            concept: concept.to_string(),
            period_end: NaiveDate::from_ymd_opt(2024, 12, 28).unwrap(),
            fiscal_quarter: Some(1),
            fiscal_year: Some(2025),
            frequency: Frequency::Quarterly,
            value,
            unit: "USD".to_string(),
            source_id: "edgar".to_string(),
            retrieved_at: Utc::now(),
            url: None,
            accession: None,
            form: None,
        }
    }

    #[tokio::test]
    async fn cache_hit_skips_fetch() {
        let store = FactStore::new();
        let fact = test_fact("revenue", dec!(94900000000));
        store.put(fact.clone(), FILING_TTL);

        let fetched = store
            .get_or_fetch(fact.key(), || async {
                panic!("fetch must not run on a warm cache")
            })
            .await
            .unwrap();
        assert_eq!(fetched.value, dec!(94900000000));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn single_flight_coalesces_concurrent_fetches() {
        let store = Arc::new(FactStore::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let fact = test_fact("revenue", dec!(94900000000));
        let key = fact.key();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            let calls = calls.clone();
            let key = key.clone();
            let fact = fact.clone();
            handles.push(tokio::spawn(async move {
                store
                    .get_or_fetch(key, move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                        Ok(fact)
                    })
                    .await
            }));
        }

        for handle in handles {
            let fact = handle.await.unwrap().unwrap();
            assert_eq!(fact.value, dec!(94900000000));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1, "upstream fetched more than once");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn coalesced_error_is_shared_but_not_cached() {
        let store = Arc::new(FactStore::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let fact = test_fact("revenue", dec!(1));
        let key = fact.key();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let calls = calls.clone();
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                store
                    .get_or_fetch(key, move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                        Err(EngineError::SourceUnavailable("edgar 503".to_string()))
                    })
                    .await
            }));
        }
        for handle in handles {
            let err = handle.await.unwrap().unwrap_err();
            assert_eq!(err, EngineError::SourceUnavailable("edgar 503".to_string()));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // No negative caching: a fresh call runs the fetch again.
        let fetched = store
            .get_or_fetch(key, || async move { Ok(fact) })
            .await
            .unwrap();
        assert_eq!(fetched.value, dec!(1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn cancelled_leader_releases_the_key() {
        let store = Arc::new(FactStore::new());
        let fact = test_fact("revenue", dec!(7));
        let key = fact.key();

        // A leader whose task is aborted mid-fetch never publishes.
        let leader = {
            let store = store.clone();
            let key = key.clone();
            tokio::spawn(async move {
                store
                    .get_or_fetch(key, || async {
                        tokio::time::sleep(std::time::Duration::from_secs(60)).await;
                        Err(EngineError::SourceUnavailable("never returns".to_string()))
                    })
                    .await
            })
        };
        // Let it win the flight before cancelling it.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        leader.abort();
        let _ = leader.await;

        // A later caller must be able to take over the key, not hang on
        // the dead flight.
        let fetched = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            store.get_or_fetch(key, || async move { Ok(fact) }),
        )
        .await
        .expect("caller completed after the cancelled leader")
        .unwrap();
        assert_eq!(fetched.value, dec!(7));
        assert_eq!(store.flight.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn expired_entry_is_a_miss() {
        let store = FactStore::new();
        let fact = test_fact("revenue", dec!(5));
        store.put(fact.clone(), Duration::seconds(-1));
        assert!(store.get(&fact.key()).is_none());
    }

    #[tokio::test]
    async fn invalidate_evicts() {
        let store = FactStore::new();
        let fact = test_fact("revenue", dec!(5));
        store.put(fact.clone(), FILING_TTL);
        store.invalidate(&fact.key());
        assert!(store.get(&fact.key()).is_none());
    }

    #[test]
    fn live_concepts_get_short_ttl() {
        assert_eq!(ttl_for("marketCap"), LIVE_TTL);
        assert_eq!(ttl_for("revenue"), FILING_TTL);
    }
}
