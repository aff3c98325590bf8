//! Intelligence source registry and the source seam.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Source category. Smart fallback stays within a category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceCategory {
    Dns,
    Whois,
    Ssl,
    ThreatIntel,
    Reputation,
    Social,
    DarknetFeed,
}

/// How much a source's word is worth a priori.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustLevel {
    Unknown,
    Low,
    Medium,
    High,
}

/// Per-source rate limit declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitSpec {
    /// Requests per rolling minute.
    pub rpm: u32,
    /// Requests per rolling hour.
    pub rph: u32,
    /// Whether the source only works with an API key configured.
    pub requires_key: bool,
}

/// Static declaration of a registered source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceSpec {
    pub name: String,
    pub category: SourceCategory,
    /// 1 = unlimited/fast … 4 = skip when budget is tight.
    pub priority_tier: u8,
    pub rate_limit: RateLimitSpec,
    pub cache_ttl_secs: u64,
    pub trust_level: TrustLevel,
    /// Base vote weight in consensus.
    pub base_weight: f64,
    /// Multiplier applied to malicious votes from this source.
    pub confidence_bias: f64,
    /// Per-call deadline.
    pub timeout_ms: u64,
}

impl SourceSpec {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// The query fanned out to every source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntelQuery {
    pub domain: String,
    /// Entity keywords (site title tokens, brand names).
    pub keywords: Vec<String>,
}

impl IntelQuery {
    pub fn domain(domain: &str) -> Self {
        Self {
            domain: domain.to_string(),
            keywords: Vec::new(),
        }
    }

    /// Stable cache-key component for this query.
    pub fn cache_key(&self) -> String {
        let mut key = self.domain.clone();
        for kw in &self.keywords {
            key.push('|');
            key.push_str(kw);
        }
        key
    }
}

/// Binary verdict reported by verdict-capable sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceVerdict {
    Malicious,
    Clean,
}

/// One source's answer for one query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceReport {
    pub source: String,
    pub category: SourceCategory,
    /// Binary verdict if the source produces one; infrastructure sources
    /// (DNS, WHOIS) report attributes only.
    pub verdict: Option<SourceVerdict>,
    /// Source-reported confidence in [0, 1].
    pub confidence: f64,
    /// Free-form intel attributes (resolved IPs, registrar, issuer, …).
    pub attributes: BTreeMap<String, String>,
    pub fetched_at: DateTime<Utc>,
    pub latency_ms: u64,
    #[serde(default)]
    pub from_cache: bool,
}

/// Cause tag attached to failed source calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCause {
    Timeout,
    Transport,
    Upstream,
    Parse,
}

/// Error from a single source call.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SourceError {
    #[error("source timed out")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("upstream error: {0}")]
    Upstream(String),
    #[error("parse error: {0}")]
    Parse(String),
}

impl SourceError {
    pub fn cause(&self) -> FailureCause {
        match self {
            Self::Timeout => FailureCause::Timeout,
            Self::Transport(_) => FailureCause::Transport,
            Self::Upstream(_) => FailureCause::Upstream,
            Self::Parse(_) => FailureCause::Parse,
        }
    }
}

/// The source seam. Implementations perform exactly one upstream call;
/// quota, breaker, cache and timeout live in the fanout engine.
#[async_trait]
pub trait IntelSource: Send + Sync {
    fn spec(&self) -> &SourceSpec;

    async fn fetch(&self, query: &IntelQuery) -> Result<SourceReport, SourceError>;
}

/// The set of registered sources for one engine.
#[derive(Default, Clone)]
pub struct SourceRegistry {
    sources: Vec<Arc<dyn IntelSource>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, source: Arc<dyn IntelSource>) {
        tracing::debug!(
            source = %source.spec().name,
            tier = source.spec().priority_tier,
            "registered intel source"
        );
        self.sources.push(source);
    }

    pub fn all(&self) -> &[Arc<dyn IntelSource>] {
        &self.sources
    }

    /// Sources in a given priority tier, in registration order.
    pub fn tier(&self, tier: u8) -> Vec<Arc<dyn IntelSource>> {
        self.sources
            .iter()
            .filter(|s| s.spec().priority_tier == tier)
            .cloned()
            .collect()
    }

    /// Sources in a category ordered by priority tier then registration.
    pub fn category(&self, category: SourceCategory) -> Vec<Arc<dyn IntelSource>> {
        let mut out: Vec<_> = self
            .sources
            .iter()
            .filter(|s| s.spec().category == category)
            .cloned()
            .collect();
        out.sort_by_key(|s| s.spec().priority_tier);
        out
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn IntelSource>> {
        self.sources.iter().find(|s| s.spec().name == name).cloned()
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

impl SourceReport {
    /// Attribute-only report scaffold for infrastructure sources.
    pub fn attributes_only(spec: &SourceSpec, attributes: BTreeMap<String, String>) -> Self {
        Self {
            source: spec.name.clone(),
            category: spec.category,
            verdict: None,
            confidence: 1.0,
            attributes,
            fetched_at: Utc::now(),
            latency_ms: 0,
            from_cache: false,
        }
    }

    /// Verdict-carrying report scaffold.
    pub fn verdict(spec: &SourceSpec, verdict: SourceVerdict, confidence: f64) -> Self {
        Self {
            source: spec.name.clone(),
            category: spec.category,
            verdict: Some(verdict),
            confidence: confidence.clamp(0.0, 1.0),
            attributes: BTreeMap::new(),
            fetched_at: Utc::now(),
            latency_ms: 0,
            from_cache: false,
        }
    }
}
