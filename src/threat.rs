use async_trait::async_trait;
use futures::future::join_all;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::cache::CacheStore;
use crate::dns::{first_listing, DnsLookup};
use crate::whitelist::Whitelist;

const SAFE_BROWSING_ENDPOINT: &str = "https://safebrowsing.googleapis.com/v4/threatMatches:find";
const SAFE_BROWSING_ORIGIN: &str = "Google Safe Browsing";
const BLACKLIST_ORIGIN: &str = "Blacklisted Domain";

#[derive(Debug, thiserror::Error)]
pub enum ReputationError {
    #[error("reputation request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("reputation service returned {0}")]
    Status(reqwest::StatusCode),
}

/// A URL reputation service. `Ok(Some(label))` names the threat found.
#[async_trait]
pub trait UrlReputation: Send + Sync {
    async fn lookup(&self, url: &str) -> Result<Option<String>, ReputationError>;
}

/// No reputation service configured.
pub struct NoReputation;

#[async_trait]
impl UrlReputation for NoReputation {
    async fn lookup(&self, _url: &str) -> Result<Option<String>, ReputationError> {
        Ok(None)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SafeBrowsingMatch {
    threat_type: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct SafeBrowsingResponse {
    #[serde(default)]
    matches: Vec<SafeBrowsingMatch>,
}

/// Google Safe Browsing v4 `threatMatches:find`.
pub struct SafeBrowsingClient {
    client: reqwest::Client,
    api_key: String,
}

impl SafeBrowsingClient {
    pub fn new(api_key: String, timeout: Duration) -> Result<Self, ReputationError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("mailcheck/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(SafeBrowsingClient { client, api_key })
    }
}

#[async_trait]
impl UrlReputation for SafeBrowsingClient {
    async fn lookup(&self, url: &str) -> Result<Option<String>, ReputationError> {
        let body = json!({
            "client": {
                "clientId": "mailcheck",
                "clientVersion": env!("CARGO_PKG_VERSION"),
            },
            "threatInfo": {
                "threatTypes": [
                    "MALWARE",
                    "SOCIAL_ENGINEERING",
                    "UNWANTED_SOFTWARE",
                    "POTENTIALLY_HARMFUL_APPLICATION"
                ],
                "platformTypes": ["ANY_PLATFORM"],
                "threatEntryTypes": ["URL"],
                "threatEntries": [{ "url": url }],
            }
        });

        let response = self
            .client
            .post(SAFE_BROWSING_ENDPOINT)
            .query(&[("key", self.api_key.as_str())])
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ReputationError::Status(response.status()));
        }
        let parsed: SafeBrowsingResponse = response.json().await?;
        Ok(parsed
            .matches
            .into_iter()
            .next()
            .map(|m| m.threat_type.unwrap_or_default()))
    }
}

/// `"<label> - <origin>"`, or just the origin when the label is blank.
pub fn with_origin(label: &str, origin: &str) -> String {
    let label = label.trim();
    if label.is_empty() {
        origin.to_string()
    } else {
        format!("{label} - {origin}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreatFinding {
    pub url: String,
    pub threat: String,
    pub parent_url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UrlCheckResult {
    pub threats: Vec<ThreatFinding>,
    pub safe: Vec<String>,
}

pub struct UrlChecker {
    whitelist: Arc<Whitelist>,
    reputation: Arc<dyn UrlReputation>,
    dns: Arc<dyn DnsLookup>,
    domain_blacklists: Vec<String>,
    cache: Arc<dyn CacheStore<Option<String>>>,
    lookup_delay: Duration,
}

impl UrlChecker {
    pub fn new(
        whitelist: Arc<Whitelist>,
        reputation: Arc<dyn UrlReputation>,
        dns: Arc<dyn DnsLookup>,
        domain_blacklists: Vec<String>,
        cache: Arc<dyn CacheStore<Option<String>>>,
    ) -> Self {
        UrlChecker {
            whitelist,
            reputation,
            dns,
            domain_blacklists,
            cache,
            lookup_delay: Duration::ZERO,
        }
    }

    pub fn with_lookup_delay(mut self, delay: Duration) -> Self {
        self.lookup_delay = delay;
        self
    }

    pub fn whitelist(&self) -> &Whitelist {
        &self.whitelist
    }

    /// Threat label for a URL or bare domain, `None` when nothing is known
    /// against it. Results, including "safe", are cached per input.
    pub async fn check_url(&self, url: &str) -> Option<String> {
        if let Some(cached) = self.cache.get(url) {
            return cached;
        }
        let verdict = self.evaluate(url).await;
        self.cache.insert(url, verdict.clone());
        verdict
    }

    pub async fn check_domain(&self, domain: &str) -> Option<String> {
        self.check_url(domain).await
    }

    async fn evaluate(&self, input: &str) -> Option<String> {
        let parsed = Url::parse(input)
            .ok()
            .filter(|u| matches!(u.scheme(), "http" | "https"));
        let host = match &parsed {
            Some(url) => url.host_str()?.to_lowercase(),
            None if is_bare_domain(input) => input.trim_end_matches('.').to_lowercase(),
            None => return None,
        };

        if self.whitelist.check(input) {
            return None;
        }

        if parsed.is_some() {
            if !self.lookup_delay.is_zero() {
                tokio::time::sleep(self.lookup_delay).await;
            }
            match self.reputation.lookup(input).await {
                Ok(Some(label)) => {
                    log::info!("{input} flagged by {SAFE_BROWSING_ORIGIN}: {label}");
                    return Some(with_origin(&label, SAFE_BROWSING_ORIGIN));
                }
                Ok(None) => {}
                Err(e) => log::warn!("Reputation lookup for {input} failed: {e}"),
            }
        }

        first_listing(self.dns.as_ref(), &host, &self.domain_blacklists)
            .await
            .map(|list| with_origin(&list, BLACKLIST_ORIGIN))
    }

    /// Check every URL concurrently. `parent` is the page they came from.
    pub async fn check_urls(&self, urls: &[String], parent: &str) -> UrlCheckResult {
        log::debug!("Checking {} URLs from {parent}", urls.len());
        let verdicts = join_all(urls.iter().map(|url| self.check_url(url))).await;

        let mut result = UrlCheckResult::default();
        for (url, verdict) in urls.iter().zip(verdicts) {
            match verdict {
                Some(threat) => result.threats.push(ThreatFinding {
                    url: url.clone(),
                    threat,
                    parent_url: parent.to_string(),
                }),
                None => result.safe.push(url.clone()),
            }
        }
        result
    }
}

fn is_bare_domain(input: &str) -> bool {
    !input.is_empty()
        && input.contains('.')
        && input
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
}


#[cfg(test)]
mod tests {
    use super::testing::CountingReputation;
    use super::*;
    use crate::cache::TtlCache;
    use crate::dns::testing::StaticDns;

    fn checker(
        reputation: Arc<CountingReputation>,
        dns: Arc<StaticDns>,
        whitelist: &[&str],
    ) -> UrlChecker {
        UrlChecker::new(
            Arc::new(Whitelist::from_hosts(whitelist.iter().copied())),
            reputation,
            dns,
            vec!["dbl.example".to_string(), "dbl2.example".to_string()],
            Arc::new(TtlCache::new(Duration::from_secs(3600))),
        )
    }

    #[tokio::test]
    async fn test_cached_verdict_skips_lookups() {
        let reputation = Arc::new(CountingReputation::default());
        let dns = Arc::new(StaticDns::default());
        let checker = checker(reputation.clone(), dns.clone(), &[]);

        assert_eq!(checker.check_url("https://clean.example/").await, None);
        assert_eq!(checker.check_url("https://clean.example/").await, None);
        assert_eq!(reputation.call_count(), 1);
        assert_eq!(dns.query_count(), 2);
    }

    #[tokio::test]
    async fn test_reputation_hit_wins_over_blacklist() {
        let reputation =
            Arc::new(CountingReputation::default().flag("https://bad.example/x", "SOCIAL_ENGINEERING"));
        let dns = Arc::new(
            StaticDns::default().with_a("bad.example.dbl.example", "127.0.1.2".parse().unwrap()),
        );
        let checker = checker(reputation, dns.clone(), &[]);
        let verdict = checker.check_url("https://bad.example/x").await;
        assert_eq!(verdict.as_deref(), Some("SOCIAL_ENGINEERING - Google Safe Browsing"));
        assert_eq!(dns.query_count(), 0);
    }

    #[tokio::test]
    async fn test_bare_domain_hits_blacklist() {
        let dns = Arc::new(
            StaticDns::default().with_a("spam.example.dbl2.example", "127.0.1.2".parse().unwrap()),
        );
        let reputation = Arc::new(CountingReputation::default());
        let checker = checker(reputation.clone(), dns, &[]);
        let verdict = checker.check_domain("spam.example").await;
        assert_eq!(verdict.as_deref(), Some("dbl2.example - Blacklisted Domain"));
        assert_eq!(reputation.call_count(), 0);
    }

    #[tokio::test]
    async fn test_whitelisted_url_is_safe_without_lookups() {
        let reputation = Arc::new(CountingReputation::default());
        let dns = Arc::new(StaticDns::default());
        let checker = checker(reputation.clone(), dns.clone(), &["bank.example"]);
        assert_eq!(checker.check_url("https://bank.example/login").await, None);
        assert_eq!(reputation.call_count(), 0);
        assert_eq!(dns.query_count(), 0);
    }

    #[tokio::test]
    async fn test_check_urls_splits_results() {
        let reputation =
            Arc::new(CountingReputation::default().flag("https://bad.example/", "MALWARE"));
        let checker = checker(reputation, Arc::new(StaticDns::default()), &[]);
        let urls = vec![
            "https://bad.example/".to_string(),
            "https://good.example/".to_string(),
        ];
        let result = checker.check_urls(&urls, "https://start.example/").await;
        assert_eq!(result.threats.len(), 1);
        assert_eq!(result.threats[0].url, "https://bad.example/");
        assert_eq!(result.threats[0].parent_url, "https://start.example/");
        assert_eq!(result.safe, vec!["https://good.example/"]);
    }

    #[test]
    fn test_with_origin() {
        assert_eq!(with_origin("", "X"), "X");
        assert_eq!(with_origin(" a ", "X"), "a - X");
    }
}
