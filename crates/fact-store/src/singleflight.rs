//! Per-key coalescing of concurrent async work.
//!
//! The first caller for a key becomes the leader and runs the work;
//! every caller that arrives while the leader is in flight awaits the
//! leader's published outcome instead of duplicating the work. Outcomes
//! are delivered once and not retained: the next call after completion
//! starts a fresh flight.

use std::future::Future;
use std::hash::Hash;

use dashmap::DashMap;
use tokio::sync::watch;

pub struct SingleFlight<K, T>
where
    K: Eq + Hash + Clone,
    T: Clone,
{
    in_flight: DashMap<K, watch::Receiver<Option<T>>>,
}

impl<K, T> SingleFlight<K, T>
where
    K: Eq + Hash + Clone,
    T: Clone,
{
    pub fn new() -> Self {
        Self {
            in_flight: DashMap::new(),
        }
    }

    /// Run `work` for `key`, or await the in-flight run for the same key.
    ///
    /// `on_publish` runs on the leader after the work settles and before
    /// waiters are released; the store uses it to write successes into
    /// the cache, so late arrivals hit the entry instead of starting a
    /// duplicate flight.
    ///
    /// `work` is `FnMut` because a waiter whose leader was aborted before
    /// publishing (request deadline cancelled the leader's task) must be
    /// able to re-elect and run the work itself. A given caller runs the
    /// work at most once: after leading, it returns.
    pub async fn run<F, Fut, P>(&self, key: K, mut work: F, on_publish: P) -> T
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = T>,
        P: FnOnce(&T),
    {
        let mut on_publish = Some(on_publish);
        loop {
            let rx = match self.in_flight.entry(key.clone()) {
                dashmap::mapref::entry::Entry::Occupied(occupied) => occupied.get().clone(),
                dashmap::mapref::entry::Entry::Vacant(vacant) => {
                    let (tx, rx) = watch::channel(None);
                    vacant.insert(rx);
                    // Leader path. The entry guard is dropped before the
                    // await; no DashMap lock is held across it.
                    let result = work().await;
                    if let Some(publish) = on_publish.take() {
                        publish(&result);
                    }
                    self.in_flight.remove(&key);
                    let _ = tx.send(Some(result.clone()));
                    return result;
                }
            };

            let mut rx = rx;
            let mut settled = None;
            loop {
                if let Some(result) = rx.borrow().clone() {
                    settled = Some(result);
                    break;
                }
                if rx.changed().await.is_err() {
                    break;
                }
            }
            match settled {
                Some(result) => return result,
                None => {
                    // The leader was dropped before publishing (its sender
                    // went away with no value), so it also never removed
                    // its entry. Clear the stale entry, then loop so a
                    // waiter can win the vacant slot and lead.
                    self.in_flight
                        .remove_if(&key, |_, stale| stale.same_channel(&rx));
                    continue;
                }
            }
        }
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }
}

impl<K, T> Default for SingleFlight<K, T>
where
    K: Eq + Hash + Clone,
    T: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}
