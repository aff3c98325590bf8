//! Built-in intelligence sources.
//!
//! Infrastructure lookups (DNS), a generic HTTP reputation client for
//! key-gated providers, and offline feed-backed sources. Each performs one
//! upstream call; resilience lives in the fanout engine.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use crate::osint::feeds::ThreatFeeds;
use crate::osint::source::{
    IntelQuery, IntelSource, RateLimitSpec, SourceCategory, SourceError, SourceReport, SourceSpec,
    SourceVerdict, TrustLevel,
};

/// Spec scaffold with sensible defaults for a built-in source.
pub fn builtin_spec(
    name: &str,
    category: SourceCategory,
    priority_tier: u8,
    trust_level: TrustLevel,
    base_weight: f64,
) -> SourceSpec {
    SourceSpec {
        name: name.to_string(),
        category,
        priority_tier,
        rate_limit: RateLimitSpec {
            rpm: 60,
            rph: 1000,
            requires_key: false,
        },
        cache_ttl_secs: 900,
        trust_level,
        base_weight,
        confidence_bias: 1.0,
        timeout_ms: 5000,
    }
}

/// DNS resolution source. Resolving at all is weak evidence the entity
/// exists; the resolved addresses land in the attributes.
pub struct DnsSource {
    spec: SourceSpec,
}

impl DnsSource {
    pub fn new() -> Self {
        Self {
            spec: builtin_spec("dns", SourceCategory::Dns, 1, TrustLevel::Medium, 0.6),
        }
    }
}

impl Default for DnsSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IntelSource for DnsSource {
    fn spec(&self) -> &SourceSpec {
        &self.spec
    }

    async fn fetch(&self, query: &IntelQuery) -> Result<SourceReport, SourceError> {
        let addrs: Vec<String> = tokio::net::lookup_host((query.domain.as_str(), 443))
            .await
            .map_err(|e| SourceError::Transport(format!("dns lookup failed: {e}")))?
            .map(|a| a.ip().to_string())
            .collect();
        if addrs.is_empty() {
            return Err(SourceError::Upstream("no addresses resolved".into()));
        }
        let mut attributes = BTreeMap::new();
        attributes.insert("resolved_ips".to_string(), addrs.join(","));
        attributes.insert("address_count".to_string(), addrs.len().to_string());
        Ok(SourceReport::attributes_only(&self.spec, attributes))
    }
}

/// Generic reputation provider speaking a small JSON contract:
/// `GET {endpoint}?domain=<d>` with bearer auth, answering
/// `{"malicious": bool, "confidence": <0..1>, ...}`.
pub struct HttpReputationSource {
    spec: SourceSpec,
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl HttpReputationSource {
    pub fn new(mut spec: SourceSpec, endpoint: &str, api_key: &str) -> Self {
        spec.rate_limit.requires_key = true;
        Self {
            spec,
            client: reqwest::Client::new(),
            endpoint: endpoint.to_string(),
            api_key: api_key.to_string(),
        }
    }
}

#[async_trait]
impl IntelSource for HttpReputationSource {
    fn spec(&self) -> &SourceSpec {
        &self.spec
    }

    async fn fetch(&self, query: &IntelQuery) -> Result<SourceReport, SourceError> {
        let response = self
            .client
            .get(&self.endpoint)
            .query(&[("domain", query.domain.as_str())])
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| SourceError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::Upstream(format!("HTTP {status}")));
        }
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| SourceError::Parse(e.to_string()))?;

        let malicious = body
            .get("malicious")
            .and_then(|v| v.as_bool())
            .ok_or_else(|| SourceError::Parse("missing 'malicious' field".into()))?;
        let confidence = body
            .get("confidence")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.5);

        let verdict = if malicious {
            SourceVerdict::Malicious
        } else {
            SourceVerdict::Clean
        };
        let mut report = SourceReport::verdict(&self.spec, verdict, confidence);
        if let Some(categories) = body.get("categories").and_then(|v| v.as_array()) {
            let list: Vec<String> = categories
                .iter()
                .filter_map(|c| c.as_str().map(String::from))
                .collect();
            if !list.is_empty() {
                report
                    .attributes
                    .insert("categories".to_string(), list.join(","));
            }
        }
        Ok(report)
    }
}

/// Phishing blocklist lookup against the offline feed.
pub struct PhishingFeedSource {
    spec: SourceSpec,
    feeds: Arc<ThreatFeeds>,
}

impl PhishingFeedSource {
    pub fn new(feeds: Arc<ThreatFeeds>) -> Self {
        let mut spec = builtin_spec(
            "phishing_feed",
            SourceCategory::ThreatIntel,
            1,
            TrustLevel::High,
            1.5,
        );
        spec.confidence_bias = 1.2;
        Self { spec, feeds }
    }
}

#[async_trait]
impl IntelSource for PhishingFeedSource {
    fn spec(&self) -> &SourceSpec {
        &self.spec
    }

    async fn fetch(&self, query: &IntelQuery) -> Result<SourceReport, SourceError> {
        let listed = self.feeds.is_phishing_host(&query.domain);
        let verdict = if listed {
            SourceVerdict::Malicious
        } else {
            SourceVerdict::Clean
        };
        let confidence = if listed {
            self.feeds.quality.max(0.9)
        } else {
            0.5
        };
        let mut report = SourceReport::verdict(&self.spec, verdict, confidence);
        report
            .attributes
            .insert("phishing_listed".to_string(), listed.to_string());
        Ok(report)
    }
}

/// Malicious-domain blocklist lookup against the offline feed.
pub struct DomainBlocklistSource {
    spec: SourceSpec,
    feeds: Arc<ThreatFeeds>,
}

impl DomainBlocklistSource {
    pub fn new(feeds: Arc<ThreatFeeds>) -> Self {
        Self {
            spec: builtin_spec(
                "domain_blocklist",
                SourceCategory::Reputation,
                1,
                TrustLevel::High,
                1.4,
            ),
            feeds,
        }
    }
}

#[async_trait]
impl IntelSource for DomainBlocklistSource {
    fn spec(&self) -> &SourceSpec {
        &self.spec
    }

    async fn fetch(&self, query: &IntelQuery) -> Result<SourceReport, SourceError> {
        let listed = self.feeds.is_malicious_domain(&query.domain);
        let verdict = if listed {
            SourceVerdict::Malicious
        } else {
            SourceVerdict::Clean
        };
        let confidence = if listed { 0.9 } else { 0.6 };
        Ok(SourceReport::verdict(&self.spec, verdict, confidence))
    }
}

/// Dark-market exposure from the offline feed tables only.
pub struct DarknetFeedSource {
    spec: SourceSpec,
    feeds: Arc<ThreatFeeds>,
}

impl DarknetFeedSource {
    pub fn new(feeds: Arc<ThreatFeeds>) -> Self {
        Self {
            spec: builtin_spec(
                "darknet_feed",
                SourceCategory::DarknetFeed,
                2,
                TrustLevel::Medium,
                1.0,
            ),
            feeds,
        }
    }
}

#[async_trait]
impl IntelSource for DarknetFeedSource {
    fn spec(&self) -> &SourceSpec {
        &self.spec
    }

    async fn fetch(&self, query: &IntelQuery) -> Result<SourceReport, SourceError> {
        let exposure = self.feeds.darknet_exposure(&query.domain, &query.keywords);
        let mut report = if exposure.market_domain_match {
            SourceReport::verdict(&self.spec, SourceVerdict::Malicious, exposure.confidence)
        } else {
            // Keyword-only matches are context, not a verdict.
            SourceReport {
                source: self.spec.name.clone(),
                category: self.spec.category,
                verdict: None,
                confidence: exposure.confidence,
                attributes: BTreeMap::new(),
                fetched_at: Utc::now(),
                latency_ms: 0,
                from_cache: false,
            }
        };
        report.attributes.insert(
            "market_domain_match".to_string(),
            exposure.market_domain_match.to_string(),
        );
        if !exposure.keyword_matches.is_empty() {
            report.attributes.insert(
                "keyword_matches".to_string(),
                exposure.keyword_matches.join(","),
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn feeds() -> Arc<ThreatFeeds> {
        let dir = tempfile::tempdir().unwrap();
        let mut f = std::fs::File::create(dir.path().join("phishing_urls.csv")).unwrap();
        writeln!(f, "http://totally-not-a-bank.tk/login").unwrap();
        std::fs::write(dir.path().join("malicious_domains.txt"), "badhost.example\n").unwrap();
        std::fs::write(
            dir.path().join("dark_market_domains.txt"),
            "shadow-bazaar.example\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("dark_market_keywords.txt"), "fullz\n").unwrap();
        Arc::new(ThreatFeeds::load(dir.path()))
    }

    #[tokio::test]
    async fn test_phishing_feed_source() {
        let source = PhishingFeedSource::new(feeds());
        let hit = source
            .fetch(&IntelQuery::domain("totally-not-a-bank.tk"))
            .await
            .unwrap();
        assert_eq!(hit.verdict, Some(SourceVerdict::Malicious));
        assert_eq!(hit.attributes.get("phishing_listed").unwrap(), "true");

        let miss = source
            .fetch(&IntelQuery::domain("example.com"))
            .await
            .unwrap();
        assert_eq!(miss.verdict, Some(SourceVerdict::Clean));
    }

    #[tokio::test]
    async fn test_blocklist_source() {
        let source = DomainBlocklistSource::new(feeds());
        let hit = source
            .fetch(&IntelQuery::domain("badhost.example"))
            .await
            .unwrap();
        assert_eq!(hit.verdict, Some(SourceVerdict::Malicious));
        assert_eq!(hit.confidence, 0.9);
    }

    #[tokio::test]
    async fn test_darknet_source_market_match() {
        let source = DarknetFeedSource::new(feeds());
        let hit = source
            .fetch(&IntelQuery::domain("shadow-bazaar.example"))
            .await
            .unwrap();
        assert_eq!(hit.verdict, Some(SourceVerdict::Malicious));
        assert_eq!(hit.attributes.get("market_domain_match").unwrap(), "true");
    }

    #[tokio::test]
    async fn test_darknet_source_keyword_only_has_no_verdict() {
        let source = DarknetFeedSource::new(feeds());
        let report = source
            .fetch(&IntelQuery {
                domain: "example.com".into(),
                keywords: vec!["fullz".into()],
            })
            .await
            .unwrap();
        assert!(report.verdict.is_none());
        assert_eq!(report.attributes.get("keyword_matches").unwrap(), "fullz");
        assert!(report.confidence > 0.0);
    }

    #[test]
    fn test_builtin_spec_defaults() {
        let spec = builtin_spec("x", SourceCategory::Whois, 2, TrustLevel::Low, 0.8);
        assert_eq!(spec.priority_tier, 2);
        assert_eq!(spec.rate_limit.rpm, 60);
        assert!(!spec.rate_limit.requires_key);
    }
}
