//! Tiered parallel source querying.
//!
//! Tiers execute 1 → 2 → 3 → (4 only when budget allows), with bounded
//! concurrency inside a tier and a short pacing delay between tiers. Every
//! call runs the same pipeline: cache → breaker → quota → bounded call →
//! bookkeeping. Failed categories get up to two same-category alternates
//! with a single attempt each.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::osint::breaker::{BreakerConfig, CircuitBreaker};
use crate::osint::cache::IntelCache;
use crate::osint::consensus::ConsensusInput;
use crate::osint::quota::QuotaState;
use crate::osint::source::{
    FailureCause, IntelQuery, IntelSource, SourceCategory, SourceRegistry, SourceReport,
};

/// Fanout tuning.
#[derive(Debug, Clone)]
pub struct FanoutConfig {
    /// Concurrent queries inside one tier.
    pub tier_parallelism: usize,
    /// Delay between tiers.
    pub tier_pacing: Duration,
    /// Same-category alternates tried after a failure.
    pub fallback_alternates: usize,
    pub breaker: BreakerConfig,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            tier_parallelism: 4,
            tier_pacing: Duration::from_millis(150),
            fallback_alternates: 2,
            breaker: BreakerConfig::default(),
        }
    }
}

/// Outcome of one source query.
#[derive(Debug, Clone)]
pub enum QueryOutcome {
    Report(SourceReport),
    /// Circuit open and not yet ready for a probe.
    Unavailable,
    /// Quota does not permit a request right now.
    RateLimited,
    /// The call was made and failed.
    Failed { cause: FailureCause, message: String },
    /// Cancellation tripped before or during the call.
    Cancelled,
}

impl QueryOutcome {
    pub fn is_usable(&self) -> bool {
        matches!(self, Self::Report(_))
    }

    /// Whether a same-category alternate should be tried.
    pub fn wants_fallback(&self) -> bool {
        matches!(self, Self::Unavailable | Self::Failed { .. })
    }
}

/// Aggregate result of one fanout pass.
#[derive(Debug, Default)]
pub struct FanoutReport {
    pub reports: Vec<SourceReport>,
    /// Non-usable outcomes by source name.
    pub failures: Vec<(String, QueryOutcome)>,
    /// Categories with at least one usable result.
    pub satisfied: BTreeSet<SourceCategory>,
}

struct SourceState {
    quota: QuotaState,
    breaker: CircuitBreaker,
}

/// The fanout engine. Per-source quota and breaker state is independently
/// locked; the cache is shared.
pub struct FanoutEngine {
    registry: SourceRegistry,
    cache: IntelCache,
    states: HashMap<String, Arc<Mutex<SourceState>>>,
    config: FanoutConfig,
}

impl FanoutEngine {
    pub fn new(registry: SourceRegistry, cache: IntelCache, config: FanoutConfig) -> Self {
        let states = registry
            .all()
            .iter()
            .map(|s| {
                let spec = s.spec();
                (
                    spec.name.clone(),
                    Arc::new(Mutex::new(SourceState {
                        quota: QuotaState::new(spec.rate_limit.rpm, spec.rate_limit.rph),
                        breaker: CircuitBreaker::new(config.breaker),
                    })),
                )
            })
            .collect();
        Self {
            registry,
            cache,
            states,
            config,
        }
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    /// Query a single source through the full pipeline.
    pub async fn query_source(
        &self,
        source: &Arc<dyn IntelSource>,
        query: &IntelQuery,
        cancel: &CancellationToken,
    ) -> QueryOutcome {
        let spec = source.spec().clone();

        if let Some(hit) = self.cache.get(&spec.name, query) {
            tracing::debug!(source = %spec.name, "cache hit");
            return QueryOutcome::Report(hit);
        }
        if cancel.is_cancelled() {
            return QueryOutcome::Cancelled;
        }

        let state = match self.states.get(&spec.name) {
            Some(state) => state.clone(),
            None => {
                return QueryOutcome::Failed {
                    cause: FailureCause::Transport,
                    message: format!("source {} not registered", spec.name),
                }
            }
        };

        {
            let mut st = state.lock().await;
            let now = Instant::now();
            if !st.breaker.allows(now) {
                return QueryOutcome::Unavailable;
            }
            if !st.quota.permits(now) {
                return QueryOutcome::RateLimited;
            }
        }

        let started = Instant::now();
        let result = tokio::select! {
            _ = cancel.cancelled() => return QueryOutcome::Cancelled,
            result = tokio::time::timeout(spec.timeout(), source.fetch(query)) => result,
        };
        let latency_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(Ok(mut report)) => {
                report.latency_ms = latency_ms;
                let mut st = state.lock().await;
                let now = Instant::now();
                st.quota.record(now);
                st.breaker.record_success();
                drop(st);
                self.cache
                    .put(&spec.name, query, report.clone(), spec.cache_ttl_secs);
                QueryOutcome::Report(report)
            }
            Ok(Err(e)) => {
                let mut st = state.lock().await;
                st.breaker.record_failure(Instant::now());
                tracing::debug!(source = %spec.name, error = %e, "source call failed");
                QueryOutcome::Failed {
                    cause: e.cause(),
                    message: e.to_string(),
                }
            }
            Err(_) => {
                let mut st = state.lock().await;
                st.breaker.record_failure(Instant::now());
                QueryOutcome::Failed {
                    cause: FailureCause::Timeout,
                    message: format!("exceeded {}ms deadline", spec.timeout_ms),
                }
            }
        }
    }

    /// Query one source and tag the outcome with its name and category.
    async fn query_one(
        &self,
        source: Arc<dyn IntelSource>,
        query: IntelQuery,
        cancel: CancellationToken,
    ) -> (String, SourceCategory, QueryOutcome) {
        let spec = source.spec();
        let name = spec.name.clone();
        let category = spec.category;
        let outcome = self.query_source(&source, &query, &cancel).await;
        (name, category, outcome)
    }

    /// Query all registered sources tier by tier.
    ///
    /// `skip_tier4` drops the lowest-priority tier when the remaining
    /// budget is tight.
    pub async fn query_all(
        &self,
        query: &IntelQuery,
        cancel: &CancellationToken,
        skip_tier4: bool,
    ) -> FanoutReport {
        let mut out = FanoutReport::default();
        let mut attempted: HashSet<String> = HashSet::new();

        let mut ran_a_tier = false;
        for tier in 1u8..=4 {
            if tier == 4 && skip_tier4 {
                tracing::debug!("skipping tier 4 sources, budget tight");
                break;
            }
            if cancel.is_cancelled() {
                break;
            }
            let sources = self.registry.tier(tier);
            if sources.is_empty() {
                continue;
            }
            if ran_a_tier {
                tokio::time::sleep(self.config.tier_pacing).await;
            }
            ran_a_tier = true;

            let pending: Vec<_> = sources
                .into_iter()
                .map(|source| self.query_one(source, query.clone(), cancel.clone()))
                .collect();
            let outcomes: Vec<(String, SourceCategory, QueryOutcome)> = stream::iter(pending)
                .buffer_unordered(self.config.tier_parallelism.max(1))
                .collect()
                .await;

            for (name, category, outcome) in outcomes {
                attempted.insert(name.clone());
                match outcome {
                    QueryOutcome::Report(report) => {
                        out.satisfied.insert(category);
                        out.reports.push(report);
                    }
                    other => out.failures.push((name, other)),
                }
            }
        }

        self.smart_fallback(query, cancel, &mut out, &mut attempted)
            .await;

        tracing::info!(
            usable = out.reports.len(),
            failed = out.failures.len(),
            categories = out.satisfied.len(),
            "osint fanout complete"
        );
        out
    }

    /// Try same-category alternates for failed, unsatisfied categories.
    async fn smart_fallback(
        &self,
        query: &IntelQuery,
        cancel: &CancellationToken,
        out: &mut FanoutReport,
        attempted: &mut HashSet<String>,
    ) {
        let failed_categories: BTreeSet<SourceCategory> = out
            .failures
            .iter()
            .filter(|(_, outcome)| outcome.wants_fallback())
            .filter_map(|(name, _)| self.registry.get(name).map(|s| s.spec().category))
            .filter(|c| !out.satisfied.contains(c))
            .collect();

        for category in failed_categories {
            let alternates: Vec<_> = self
                .registry
                .category(category)
                .into_iter()
                .filter(|s| !attempted.contains(&s.spec().name))
                .take(self.config.fallback_alternates)
                .collect();
            for alternate in alternates {
                if cancel.is_cancelled() || out.satisfied.contains(&category) {
                    break;
                }
                let name = alternate.spec().name.clone();
                attempted.insert(name.clone());
                tracing::debug!(source = %name, ?category, "trying fallback source");
                match self.query_source(&alternate, query, cancel).await {
                    QueryOutcome::Report(report) => {
                        out.satisfied.insert(category);
                        out.reports.push(report);
                    }
                    other => out.failures.push((name, other)),
                }
            }
        }
    }

    /// Pair verdict-carrying reports with their registry weights for
    /// consensus, applying reputation-adjusted base weights when a tracker
    /// is supplied.
    pub fn consensus_inputs(
        &self,
        reports: &[SourceReport],
        reputation: Option<&crate::osint::consensus::ReputationTracker>,
    ) -> Vec<ConsensusInput> {
        reports
            .iter()
            .filter_map(|report| {
                let verdict = report.verdict?;
                let source = self.registry.get(&report.source)?;
                let spec = source.spec();
                let base_weight = match reputation {
                    Some(tracker) => tracker.weight_for(&spec.name, spec.base_weight),
                    None => spec.base_weight,
                };
                Some(ConsensusInput {
                    source: spec.name.clone(),
                    trust_level: spec.trust_level,
                    base_weight,
                    confidence_bias: spec.confidence_bias,
                    verdict,
                    confidence: report.confidence,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::osint::source::{
        RateLimitSpec, SourceError, SourceSpec, SourceVerdict, TrustLevel,
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn spec(name: &str, tier: u8, category: SourceCategory, rpm: u32) -> SourceSpec {
        SourceSpec {
            name: name.to_string(),
            category,
            priority_tier: tier,
            rate_limit: RateLimitSpec {
                rpm,
                rph: 1000,
                requires_key: false,
            },
            cache_ttl_secs: 300,
            trust_level: TrustLevel::Medium,
            base_weight: 1.0,
            confidence_bias: 1.0,
            timeout_ms: 200,
        }
    }

    /// Scripted source: fails the first `fail_first` calls, then succeeds.
    struct Scripted {
        spec: SourceSpec,
        fail_first: u32,
        calls: AtomicU32,
    }

    impl Scripted {
        fn ok(spec: SourceSpec) -> Arc<Self> {
            Arc::new(Self {
                spec,
                fail_first: 0,
                calls: AtomicU32::new(0),
            })
        }

        fn failing(spec: SourceSpec, fail_first: u32) -> Arc<Self> {
            Arc::new(Self {
                spec,
                fail_first,
                calls: AtomicU32::new(0),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl IntelSource for Scripted {
        fn spec(&self) -> &SourceSpec {
            &self.spec
        }
        async fn fetch(&self, _q: &IntelQuery) -> Result<SourceReport, SourceError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                Err(SourceError::Upstream("scripted failure".into()))
            } else {
                Ok(SourceReport::verdict(&self.spec, SourceVerdict::Clean, 0.9))
            }
        }
    }

    fn engine_with(sources: Vec<Arc<dyn IntelSource>>) -> FanoutEngine {
        let mut registry = SourceRegistry::new();
        for s in sources {
            registry.register(s);
        }
        FanoutEngine::new(registry, IntelCache::in_memory(), FanoutConfig {
            tier_pacing: Duration::from_millis(1),
            ..FanoutConfig::default()
        })
    }

    #[tokio::test]
    async fn test_rate_limit_one_of_five() {
        let source = Scripted::ok(spec("rep", 1, SourceCategory::Reputation, 1));
        // Distinct queries so the cache does not absorb the repeats.
        let engine = engine_with(vec![source.clone()]);
        let cancel = CancellationToken::new();

        let mut executed = 0;
        let mut limited = 0;
        for i in 0..5 {
            let q = IntelQuery::domain(&format!("example{i}.com"));
            let src = engine.registry.get("rep").unwrap();
            match engine.query_source(&src, &q, &cancel).await {
                QueryOutcome::Report(_) => executed += 1,
                QueryOutcome::RateLimited => limited += 1,
                other => panic!("unexpected outcome: {other:?}"),
            }
        }
        assert_eq!(executed, 1);
        assert_eq!(limited, 4);
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn test_cache_bypasses_quota() {
        let source = Scripted::ok(spec("rep", 1, SourceCategory::Reputation, 1));
        let engine = engine_with(vec![source.clone()]);
        let cancel = CancellationToken::new();
        let q = IntelQuery::domain("example.com");
        let src = engine.registry.get("rep").unwrap();

        assert!(engine.query_source(&src, &q, &cancel).await.is_usable());
        // Second identical query is served from cache despite rpm=1.
        match engine.query_source(&src, &q, &cancel).await {
            QueryOutcome::Report(report) => assert!(report.from_cache),
            other => panic!("expected cache hit, got {other:?}"),
        }
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn test_breaker_opens_and_rejects() {
        let source = Scripted::failing(spec("rep", 1, SourceCategory::Reputation, 100), 10);
        let engine = engine_with(vec![source.clone()]);
        let cancel = CancellationToken::new();
        let src = engine.registry.get("rep").unwrap();

        for i in 0..3 {
            let q = IntelQuery::domain(&format!("fail{i}.com"));
            match engine.query_source(&src, &q, &cancel).await {
                QueryOutcome::Failed { cause, .. } => assert_eq!(cause, FailureCause::Upstream),
                other => panic!("expected failure, got {other:?}"),
            }
        }
        // Circuit now open: the call never reaches the source.
        let q = IntelQuery::domain("fail3.com");
        assert!(matches!(
            engine.query_source(&src, &q, &cancel).await,
            QueryOutcome::Unavailable
        ));
        assert_eq!(source.calls(), 3);
    }

    #[tokio::test]
    async fn test_query_all_collects_by_tier() {
        let a: Arc<dyn IntelSource> = Scripted::ok(spec("dns", 1, SourceCategory::Dns, 100));
        let b: Arc<dyn IntelSource> =
            Scripted::ok(spec("rep", 2, SourceCategory::Reputation, 100));
        let c: Arc<dyn IntelSource> =
            Scripted::failing(spec("ti", 3, SourceCategory::ThreatIntel, 100), 100);
        let engine = engine_with(vec![a, b, c]);
        let cancel = CancellationToken::new();

        let report = engine
            .query_all(&IntelQuery::domain("example.com"), &cancel, false)
            .await;
        assert_eq!(report.reports.len(), 2);
        assert_eq!(report.failures.len(), 1);
        assert!(report.satisfied.contains(&SourceCategory::Dns));
        assert!(!report.satisfied.contains(&SourceCategory::ThreatIntel));
    }

    #[tokio::test]
    async fn test_skip_tier4_when_budget_tight() {
        let t4 = Scripted::ok(spec("slow", 4, SourceCategory::Social, 100));
        let engine = engine_with(vec![t4.clone() as Arc<dyn IntelSource>]);
        let cancel = CancellationToken::new();

        let report = engine
            .query_all(&IntelQuery::domain("example.com"), &cancel, true)
            .await;
        assert!(report.reports.is_empty());
        assert_eq!(t4.calls(), 0);

        let report = engine
            .query_all(&IntelQuery::domain("example.com"), &cancel, false)
            .await;
        assert_eq!(report.reports.len(), 1);
    }

    #[tokio::test]
    async fn test_smart_fallback_same_category() {
        // Primary reputation source fails; the only alternate sits in tier 4,
        // which the budget-tight pass skips. The fallback still rescues the
        // category with a single attempt.
        let primary: Arc<dyn IntelSource> =
            Scripted::failing(spec("rep-a", 1, SourceCategory::Reputation, 100), 100);
        let backup = Scripted::ok(spec("rep-b", 4, SourceCategory::Reputation, 100));
        let engine = engine_with(vec![primary, backup.clone() as Arc<dyn IntelSource>]);
        let cancel = CancellationToken::new();

        let report = engine
            .query_all(&IntelQuery::domain("example.com"), &cancel, true)
            .await;
        assert!(report.satisfied.contains(&SourceCategory::Reputation));
        assert_eq!(report.reports.len(), 1);
        assert_eq!(report.reports[0].source, "rep-b");
        assert_eq!(backup.calls(), 1);
    }

    #[tokio::test]
    async fn test_no_fallback_once_category_satisfied() {
        let good: Arc<dyn IntelSource> =
            Scripted::ok(spec("rep-a", 1, SourceCategory::Reputation, 100));
        let spare = Scripted::ok(spec("rep-b", 4, SourceCategory::Reputation, 100));
        let engine = engine_with(vec![good, spare.clone() as Arc<dyn IntelSource>]);
        let cancel = CancellationToken::new();

        let report = engine
            .query_all(&IntelQuery::domain("example.com"), &cancel, true)
            .await;
        assert_eq!(report.reports.len(), 1);
        assert_eq!(spare.calls(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_fanout_stops() {
        let source = Scripted::ok(spec("dns", 1, SourceCategory::Dns, 100));
        let engine = engine_with(vec![source.clone() as Arc<dyn IntelSource>]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = engine
            .query_all(&IntelQuery::domain("example.com"), &cancel, false)
            .await;
        assert!(report.reports.is_empty());
        assert_eq!(source.calls(), 0);
    }

    #[tokio::test]
    async fn test_consensus_inputs_pair_specs() {
        let mut s = spec("rep", 1, SourceCategory::Reputation, 100);
        s.base_weight = 1.4;
        s.confidence_bias = 1.2;
        let source = Scripted::ok(s);
        let engine = engine_with(vec![source as Arc<dyn IntelSource>]);
        let cancel = CancellationToken::new();

        let report = engine
            .query_all(&IntelQuery::domain("example.com"), &cancel, false)
            .await;
        let inputs = engine.consensus_inputs(&report.reports, None);
        assert_eq!(inputs.len(), 1);
        assert_eq!(inputs[0].base_weight, 1.4);
        assert_eq!(inputs[0].confidence_bias, 1.2);
    }
}
