//! Scout phase: page capture.
//!
//! The default [`HttpScout`] fetches pages over plain HTTP and extracts
//! headers, title, links and form shapes. A browser-automation scout with
//! screenshot capture plugs in behind the same [`Scout`] trait.

use std::collections::BTreeMap;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use tokio_util::sync::CancellationToken;

use forensics::error::AuditError;
use forensics::events::ProgressEvent;
use forensics::state::{AuditState, FormSummary, ScoutEvidence};
use forensics::transport::ProgressSink;

use super::{pct, Scout};
use crate::config::AuditConfig;

/// Reqwest-backed page scout.
pub struct HttpScout {
    client: reqwest::Client,
    title_re: Regex,
    link_re: Regex,
    form_re: Regex,
    input_re: Regex,
}

const MAX_LINKS: usize = 25;
const MAX_EXCERPT: usize = 4000;

impl HttpScout {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .user_agent("forensic-audit/0.1")
                .build()
                .unwrap_or_default(),
            title_re: Regex::new(r"(?is)<title[^>]*>(.*?)</title>").expect("static regex"),
            link_re: Regex::new(r#"(?i)href\s*=\s*["'](https?://[^"']+)["']"#)
                .expect("static regex"),
            form_re: Regex::new(r"(?is)<form[^>]*>.*?</form>").expect("static regex"),
            input_re: Regex::new(r"(?is)<input[^>]*>").expect("static regex"),
        }
    }

    fn extract_forms(&self, body: &str) -> Vec<FormSummary> {
        let method_re = Regex::new(r#"(?i)method\s*=\s*["']?(\w+)"#).expect("static regex");
        let action_re = Regex::new(r#"(?i)action\s*=\s*["']([^"']*)["']"#).expect("static regex");
        self.form_re
            .find_iter(body)
            .map(|m| {
                let form = m.as_str();
                let inputs: Vec<&str> = self.input_re.find_iter(form).map(|i| i.as_str()).collect();
                FormSummary {
                    action: action_re
                        .captures(form)
                        .and_then(|c| c.get(1))
                        .map(|a| a.as_str().to_string()),
                    method: method_re
                        .captures(form)
                        .and_then(|c| c.get(1))
                        .map(|m| m.as_str().to_ascii_lowercase())
                        .unwrap_or_else(|| "get".to_string()),
                    has_password_field: inputs
                        .iter()
                        .any(|i| i.to_ascii_lowercase().contains("type=\"password\"")
                            || i.to_ascii_lowercase().contains("type='password'")
                            || i.to_ascii_lowercase().contains("type=password")),
                    input_count: inputs.len() as u32,
                }
            })
            .collect()
    }
}

impl Default for HttpScout {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Scout for HttpScout {
    async fn scout(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<ScoutEvidence, AuditError> {
        let started = Instant::now();
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(AuditError::Cancelled),
            response = self.client.get(url).send() => response,
        }
        .map_err(|e| AuditError::upstream("scout", e.to_string()))?;

        let status_code = Some(response.status().as_u16());
        let final_url = response.url().to_string();
        let headers: BTreeMap<String, String> = response
            .headers()
            .iter()
            .map(|(k, v)| {
                (
                    k.as_str().to_ascii_lowercase(),
                    v.to_str().unwrap_or_default().to_string(),
                )
            })
            .collect();

        let body = tokio::select! {
            _ = cancel.cancelled() => return Err(AuditError::Cancelled),
            body = response.text() => body,
        }
        .map_err(|e| AuditError::upstream("scout", e.to_string()))?;

        let title = self
            .title_re
            .captures(&body)
            .and_then(|c| c.get(1))
            .map(|t| t.as_str().trim().to_string())
            .filter(|t| !t.is_empty());
        let mut links: Vec<String> = Vec::new();
        for cap in self.link_re.captures_iter(&body) {
            if let Some(href) = cap.get(1) {
                let href = href.as_str().to_string();
                if !links.contains(&href) {
                    links.push(href);
                }
            }
            if links.len() >= MAX_LINKS {
                break;
            }
        }
        let forms = self.extract_forms(&body);
        let body_excerpt = body
            .chars()
            .take(MAX_EXCERPT)
            .collect::<String>()
            .to_ascii_lowercase();

        Ok(ScoutEvidence {
            url: url.to_string(),
            uses_tls: final_url.starts_with("https://"),
            final_url,
            status_code,
            title,
            headers,
            links,
            forms,
            body_excerpt,
            screenshot: None,
            fetched_at: Utc::now(),
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }
}

/// Consecutive failures on a still-evidence-less audit before the scout
/// gives up on the target.
const MAX_BOOTSTRAP_ATTEMPTS: u32 = 3;

/// Run one scout iteration: pop pending URLs up to the page budget and
/// capture each with a per-page deadline. Failures are recorded and the
/// phase carries on; only cancellation propagates. While the audit has no
/// evidence at all, the target page is retried until the consecutive
/// failure counter reaches its cap.
pub async fn run(
    state: &mut AuditState,
    scout: &dyn Scout,
    sink: &dyn ProgressSink,
    cancel: &CancellationToken,
    config: &AuditConfig,
) -> Result<u32, AuditError> {
    let remaining_pages = state
        .budget
        .max_pages
        .saturating_sub(state.counters.pages_scouted);
    let planned = (state.pending_urls.len() as u32).min(remaining_pages);
    let mut captured = 0u32;

    for i in 0..planned {
        let Some(url) = state.pending_urls.pop_front() else {
            break;
        };
        let page_pct = pct::SCOUT_START
            + ((pct::SCOUT_END - pct::SCOUT_START) as u32 * (i + 1) / planned.max(1)) as u8;

        loop {
            if cancel.is_cancelled() {
                return Err(AuditError::Cancelled);
            }
            let result =
                tokio::time::timeout(config.scout_timeout, scout.scout(&url, cancel)).await;
            let error = match result {
                Ok(Ok(evidence)) => {
                    if let Some(shot) = &evidence.screenshot {
                        sink.emit(ProgressEvent::screenshot(
                            "scout",
                            page_pct.min(pct::SCOUT_END),
                            &url,
                            shot,
                        ));
                    }
                    state.record_scout(evidence)?;
                    captured += 1;
                    break;
                }
                Ok(Err(AuditError::Cancelled)) => return Err(AuditError::Cancelled),
                Ok(Err(e)) => e,
                Err(_) => AuditError::timeout(&format!("scout {url}"), config.scout_timeout),
            };

            tracing::warn!(url, error = %error, "scout failed");
            state.record_scout_failure(&url);
            state.push_error("scout", &error);
            let retry = state.scout_evidence.is_empty()
                && state.consecutive_scout_failures < MAX_BOOTSTRAP_ATTEMPTS;
            if !retry {
                break;
            }
        }
    }
    Ok(captured)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_form_extraction() {
        let scout = HttpScout::new();
        let body = r#"
            <form action="/login" method="POST">
              <input type="text" name="user">
              <input type="password" name="pass">
            </form>
            <form><input type=search></form>
        "#;
        let forms = scout.extract_forms(body);
        assert_eq!(forms.len(), 2);
        assert_eq!(forms[0].method, "post");
        assert_eq!(forms[0].action.as_deref(), Some("/login"));
        assert!(forms[0].has_password_field);
        assert_eq!(forms[0].input_count, 2);
        assert!(!forms[1].has_password_field);
        assert_eq!(forms[1].method, "get");
    }
}
