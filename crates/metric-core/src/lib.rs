pub mod concepts;
pub mod error;
pub mod traits;
pub mod types;

pub use error::{EngineError, SourceError};
pub use traits::SourceAdapter;
pub use types::{
    Citation, Confidence, Entity, Fact, FactKey, Frequency, Period, PeriodHint, PeriodRequest,
    PriorityTier,
};
