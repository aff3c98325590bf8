//! Frozen agent configuration.
//!
//! Read from the environment exactly once at startup, then passed by
//! reference. Budgets come from the tier with optional env overrides.

use std::path::PathBuf;
use std::time::Duration;

use forensics::state::{AuditTier, Budget};

/// A network reputation source enabled via environment variables.
///
/// `OSINT_HTTP_SOURCES=name1,name2` declares the set; each `NAME` is then
/// configured through `<NAME>_URL`, `<NAME>_API_KEY` (required) and
/// `<NAME>_REQUESTS_PER_MINUTE` (optional).
#[derive(Debug, Clone)]
pub struct HttpSourceConfig {
    pub name: String,
    pub endpoint: String,
    pub api_key: String,
    pub rpm_override: Option<u32>,
}

/// Top-level agent configuration.
#[derive(Debug, Clone)]
pub struct AuditConfig {
    /// Default rollout fraction for the queue transport.
    pub rollout_fraction: f64,
    /// Minimum finding confidence to retain.
    pub confidence_threshold: f64,
    /// `MAX_ITERATIONS` override.
    pub max_iterations_override: Option<u32>,
    /// `MAX_PAGES_PER_AUDIT` override.
    pub max_pages_override: Option<u32>,
    /// `NIM_CALL_BUDGET` override.
    pub max_ai_calls_override: Option<u32>,
    /// Per-page scout deadline.
    pub scout_timeout: Duration,
    /// OSINT fanout deadline.
    pub graph_timeout: Duration,
    /// Global deadline inherited by the remaining phases.
    pub audit_timeout: Duration,
    /// Threat-feed directory (`THREAT_FEEDS_DIR`).
    pub feeds_dir: Option<PathBuf>,
    /// On-disk OSINT cache directory (`OSINT_CACHE_DIR`).
    pub cache_dir: Option<PathBuf>,
    /// Vision inference endpoint (`VISION_URL`, `VISION_API_KEY`).
    pub vision_url: Option<String>,
    pub vision_api_key: Option<String>,
    /// Key-gated network reputation sources.
    pub http_sources: Vec<HttpSourceConfig>,
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse().ok())
}

fn env_secs(name: &str, default_secs: u64) -> Duration {
    Duration::from_secs(env_parse(name).unwrap_or(default_secs))
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            rollout_fraction: env_parse::<f64>("QUEUE_IPC_ROLLOUT")
                .map(|f| f.clamp(0.0, 1.0))
                .unwrap_or(0.10),
            confidence_threshold: env_parse::<f64>("CONFIDENCE_THRESHOLD")
                .map(|f| f.clamp(0.0, 1.0))
                .unwrap_or(0.4),
            max_iterations_override: env_parse("MAX_ITERATIONS"),
            max_pages_override: env_parse("MAX_PAGES_PER_AUDIT"),
            max_ai_calls_override: env_parse("NIM_CALL_BUDGET"),
            scout_timeout: env_secs("SCOUT_TIMEOUT_SECS", 20),
            graph_timeout: env_secs("GRAPH_TIMEOUT_SECS", 45),
            audit_timeout: env_secs("AUDIT_TIMEOUT_SECS", 300),
            feeds_dir: std::env::var("THREAT_FEEDS_DIR").ok().map(PathBuf::from),
            cache_dir: std::env::var("OSINT_CACHE_DIR").ok().map(PathBuf::from),
            vision_url: std::env::var("VISION_URL").ok(),
            vision_api_key: std::env::var("VISION_API_KEY").ok(),
            http_sources: Self::http_sources_from_env(),
        }
    }
}

impl AuditConfig {
    fn http_sources_from_env() -> Vec<HttpSourceConfig> {
        let Ok(names) = std::env::var("OSINT_HTTP_SOURCES") else {
            return Vec::new();
        };
        names
            .split(',')
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .filter_map(|name| {
                let upper = name.to_ascii_uppercase().replace('-', "_");
                let api_key = std::env::var(format!("{upper}_API_KEY")).ok()?;
                let endpoint = match std::env::var(format!("{upper}_URL")) {
                    Ok(url) => url,
                    Err(_) => {
                        tracing::warn!(source = name, "source has key but no URL, skipping");
                        return None;
                    }
                };
                Some(HttpSourceConfig {
                    name: name.to_ascii_lowercase(),
                    endpoint,
                    api_key,
                    rpm_override: env_parse(&format!("{upper}_REQUESTS_PER_MINUTE")),
                })
            })
            .collect()
    }

    /// The effective budget for a tier, with env overrides applied.
    pub fn budget_for(&self, tier: AuditTier) -> Budget {
        let mut budget = tier.default_budget();
        if let Some(v) = self.max_iterations_override {
            budget.max_iterations = v.max(1);
        }
        if let Some(v) = self.max_pages_override {
            budget.max_pages = v.max(1);
        }
        if let Some(v) = self.max_ai_calls_override {
            budget.max_ai_calls = v;
        }
        budget
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_overrides_apply() {
        let config = AuditConfig {
            max_iterations_override: Some(7),
            max_pages_override: Some(20),
            max_ai_calls_override: None,
            ..test_config()
        };
        let budget = config.budget_for(AuditTier::Quick);
        assert_eq!(budget.max_iterations, 7);
        assert_eq!(budget.max_pages, 20);
        assert_eq!(
            budget.max_ai_calls,
            AuditTier::Quick.default_budget().max_ai_calls
        );
    }

    #[test]
    fn test_budget_defaults_without_overrides() {
        let budget = test_config().budget_for(AuditTier::Deep);
        assert_eq!(budget, AuditTier::Deep.default_budget());
    }

    fn test_config() -> AuditConfig {
        AuditConfig {
            rollout_fraction: 0.1,
            confidence_threshold: 0.4,
            max_iterations_override: None,
            max_pages_override: None,
            max_ai_calls_override: None,
            scout_timeout: Duration::from_secs(20),
            graph_timeout: Duration::from_secs(45),
            audit_timeout: Duration::from_secs(300),
            feeds_dir: None,
            cache_dir: None,
            vision_url: None,
            vision_api_key: None,
            http_sources: Vec::new(),
        }
    }
}
