//! Offline threat feeds.
//!
//! Flat files downloaded out of band and loaded once at startup:
//!
//! - `phishing_urls.csv`: first column is a known phishing URL
//! - `malicious_domains.txt`: one domain per line
//! - `dark_market_domains.txt`: one market domain per line
//! - `dark_market_keywords.txt`: one keyword per line
//!
//! Darknet exposure is evaluated **only** against these tables. No outbound
//! connection to any hidden-service network is ever attempted.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Result of the offline darknet exposure check.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DarknetExposure {
    pub market_domain_match: bool,
    pub keyword_matches: Vec<String>,
    /// Proportional to the feed quality, 0 when nothing matched.
    pub confidence: f64,
}

impl DarknetExposure {
    pub fn is_exposed(&self) -> bool {
        self.market_domain_match || !self.keyword_matches.is_empty()
    }
}

/// Pre-loaded threat-feed lookup tables.
#[derive(Debug, Clone, Default)]
pub struct ThreatFeeds {
    phishing_urls: HashSet<String>,
    phishing_hosts: HashSet<String>,
    malicious_domains: HashSet<String>,
    market_domains: HashSet<String>,
    market_keywords: Vec<String>,
    /// Feed quality factor applied to match confidences.
    pub quality: f64,
}

fn normalize_url(url: &str) -> String {
    url.trim().trim_end_matches('/').to_ascii_lowercase()
}

/// Host portion of a URL, without scheme, port, path or userinfo.
pub fn host_of(url: &str) -> Option<String> {
    let rest = url.trim().split("://").nth(1).unwrap_or(url.trim());
    let host = rest
        .split(['/', '?', '#'])
        .next()?
        .rsplit('@')
        .next()?
        .split(':')
        .next()?;
    if host.is_empty() {
        None
    } else {
        Some(host.to_ascii_lowercase())
    }
}

impl ThreatFeeds {
    /// Empty tables (every lookup misses).
    pub fn empty() -> Self {
        Self {
            quality: 0.0,
            ..Self::default()
        }
    }

    /// Load all feed files under `dir`. A missing or unreadable file
    /// degrades to an empty table with a warning.
    pub fn load(dir: &Path) -> Self {
        let read_lines = |file: &str| -> Vec<String> {
            let path = dir.join(file);
            match std::fs::read_to_string(&path) {
                Ok(contents) => contents
                    .lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty() && !l.starts_with('#'))
                    .map(str::to_string)
                    .collect(),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "threat feed missing");
                    Vec::new()
                }
            }
        };

        let phishing_urls: HashSet<String> = read_lines("phishing_urls.csv")
            .into_iter()
            .filter_map(|line| line.split(',').next().map(normalize_url))
            .filter(|u| !u.is_empty())
            .collect();
        let phishing_hosts = phishing_urls.iter().filter_map(|u| host_of(u)).collect();
        let malicious_domains = read_lines("malicious_domains.txt")
            .into_iter()
            .map(|d| d.to_ascii_lowercase())
            .collect();
        let market_domains = read_lines("dark_market_domains.txt")
            .into_iter()
            .map(|d| d.to_ascii_lowercase())
            .collect();
        let market_keywords = read_lines("dark_market_keywords.txt")
            .into_iter()
            .map(|k| k.to_ascii_lowercase())
            .collect();

        let feeds = Self {
            phishing_urls,
            phishing_hosts,
            malicious_domains,
            market_domains,
            market_keywords,
            quality: 0.8,
        };
        tracing::info!(
            phishing = feeds.phishing_urls.len(),
            malicious = feeds.malicious_domains.len(),
            markets = feeds.market_domains.len(),
            keywords = feeds.market_keywords.len(),
            "threat feeds loaded"
        );
        feeds
    }

    /// Exact-URL phishing list hit.
    pub fn is_phishing_url(&self, url: &str) -> bool {
        self.phishing_urls.contains(&normalize_url(url))
    }

    /// Whether the host appears in any phishing-listed URL.
    pub fn is_phishing_host(&self, host: &str) -> bool {
        self.phishing_hosts.contains(&host.to_ascii_lowercase())
    }

    pub fn is_malicious_domain(&self, domain: &str) -> bool {
        self.malicious_domains.contains(&domain.to_ascii_lowercase())
    }

    /// Offline darknet exposure for a domain and its entity keywords.
    pub fn darknet_exposure(&self, domain: &str, keywords: &[String]) -> DarknetExposure {
        let domain = domain.to_ascii_lowercase();
        let market_domain_match = self.market_domains.contains(&domain);
        let mut keyword_matches: Vec<String> = keywords
            .iter()
            .map(|k| k.to_ascii_lowercase())
            .filter(|k| self.market_keywords.iter().any(|mk| mk == k))
            .collect();
        keyword_matches.sort();
        keyword_matches.dedup();

        let confidence = if market_domain_match {
            self.quality
        } else if !keyword_matches.is_empty() {
            self.quality * 0.5
        } else {
            0.0
        };
        DarknetExposure {
            market_domain_match,
            keyword_matches,
            confidence,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn feeds_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let mut f = std::fs::File::create(dir.path().join("phishing_urls.csv")).unwrap();
        writeln!(f, "http://totally-not-a-bank.tk/login,2026-07-01").unwrap();
        writeln!(f, "https://fake-pay.example/checkout,2026-07-02").unwrap();
        std::fs::write(
            dir.path().join("malicious_domains.txt"),
            "badhost.example\n# comment\nmalware.test\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("dark_market_domains.txt"),
            "shadow-bazaar.example\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("dark_market_keywords.txt"),
            "fullz\ncarding\n",
        )
        .unwrap();
        dir
    }

    #[test]
    fn test_load_and_lookup() {
        let dir = feeds_dir();
        let feeds = ThreatFeeds::load(dir.path());

        assert!(feeds.is_phishing_url("http://totally-not-a-bank.tk/login"));
        assert!(feeds.is_phishing_url("HTTP://TOTALLY-NOT-A-BANK.TK/login/"));
        assert!(!feeds.is_phishing_url("https://example.com"));
        assert!(feeds.is_phishing_host("totally-not-a-bank.tk"));
        assert!(feeds.is_malicious_domain("MALWARE.TEST"));
        assert!(!feeds.is_malicious_domain("example.com"));
    }

    #[test]
    fn test_darknet_exposure() {
        let dir = feeds_dir();
        let feeds = ThreatFeeds::load(dir.path());

        let hit = feeds.darknet_exposure("shadow-bazaar.example", &[]);
        assert!(hit.market_domain_match);
        assert!(hit.is_exposed());
        assert_eq!(hit.confidence, feeds.quality);

        let kw = feeds.darknet_exposure("example.com", &["Carding".into(), "shop".into()]);
        assert!(!kw.market_domain_match);
        assert_eq!(kw.keyword_matches, vec!["carding"]);
        assert!(kw.confidence > 0.0 && kw.confidence < feeds.quality);

        let miss = feeds.darknet_exposure("example.com", &["flowers".into()]);
        assert!(!miss.is_exposed());
        assert_eq!(miss.confidence, 0.0);
    }

    #[test]
    fn test_missing_dir_degrades_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        let feeds = ThreatFeeds::load(&dir.path().join("nope"));
        assert!(!feeds.is_phishing_url("http://totally-not-a-bank.tk/login"));
        assert!(!feeds.darknet_exposure("anything.example", &[]).is_exposed());
    }

    #[test]
    fn test_host_of() {
        assert_eq!(
            host_of("https://user@Example.COM:8443/path?q=1").as_deref(),
            Some("example.com")
        );
        assert_eq!(host_of("example.org/path").as_deref(), Some("example.org"));
        assert_eq!(host_of(""), None);
    }
}
