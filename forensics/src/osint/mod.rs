//! OSINT/CTI fanout engine.
//!
//! Queries a registry of external intelligence sources in parallel with
//! per-source rate limiting, circuit breaking and caching, then aggregates
//! the reports through weighted consensus with explicit conflict
//! preservation.

pub mod breaker;
pub mod cache;
pub mod consensus;
pub mod fanout;
pub mod feeds;
pub mod quota;
pub mod source;
pub mod sources;

pub use breaker::{BreakerConfig, CircuitBreaker, CircuitState};
pub use cache::IntelCache;
pub use consensus::{resolve, ConflictRecord, ConsensusInput, ConsensusVerdict, ReputationTracker};
pub use fanout::{FanoutConfig, FanoutEngine, FanoutReport, QueryOutcome};
pub use feeds::{DarknetExposure, ThreatFeeds};
pub use quota::QuotaState;
pub use source::{
    FailureCause, IntelQuery, IntelSource, RateLimitSpec, SourceCategory, SourceError,
    SourceRegistry, SourceReport, SourceSpec, SourceVerdict, TrustLevel,
};
