use async_trait::async_trait;

use crate::error::SourceError;
use crate::types::{Fact, PeriodHint, PriorityTier};

/// Uniform client for one upstream provider.
///
/// Adapters are stateless and side-effect-free: they return candidate
/// facts and never touch the cache, which belongs to the router/store.
/// An adapter may return several candidates for one request (e.g. a 10-Q
/// and a 10-K covering overlapping ranges); the period resolver picks the
/// canonical one.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Stable identifier used in citations and diagnostics.
    fn source_id(&self) -> &'static str;

    fn priority_tier(&self) -> PriorityTier;

    /// Whether this source can serve the given concept at all. The router
    /// skips unsupported adapters without calling them.
    fn supports(&self, concept: &str) -> bool;

    async fn fetch(
        &self,
        ticker: &str,
        concept: &str,
        hint: &PeriodHint,
    ) -> Result<Vec<Fact>, SourceError>;
}
