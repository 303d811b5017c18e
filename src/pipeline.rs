use futures::future::join_all;
use std::collections::HashSet;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Instant;
use url::Url;

use crate::authenticator::{Authenticator, VerificationResult};
use crate::classifier::{Analyst, ClassifierInput, PromptKind};
use crate::crawler::Crawler;
use crate::email::ParsedEmail;
use crate::report::{
    explanation_terms, AiAnalysis, LinkAnalysis, LinkCheck, LinkMessage, Report, MAX_SCORE_FULL,
    MAX_SCORE_REDUCED,
};
use crate::threat::{ThreatFinding, UrlChecker};

const QUERY_DISPLAY_LIMIT: usize = 30;

/// Everything one analysis produced, before it is shaped into a [`Report`].
#[derive(Debug, Clone)]
pub struct PipelineResult {
    pub header: Option<VerificationResult>,
    pub links: LinkAnalysis,
    pub classifier_input: ClassifierInput,
    pub verdict: AiAnalysis,
}

impl PipelineResult {
    pub fn has_full_headers(&self) -> bool {
        self.header.is_some()
    }

    /// Merge into the report shape. Without headers the sender is whoever the
    /// classifier found in the forwarded body, falling back to the submitter.
    pub fn into_report(self, email: &ParsedEmail) -> Report {
        let (max_score, sender_name, sender_email) = if self.has_full_headers() {
            (
                MAX_SCORE_FULL,
                email.sender_name().to_string(),
                email.sender_address().to_string(),
            )
        } else {
            (
                MAX_SCORE_REDUCED,
                self.verdict
                    .sender_name
                    .clone()
                    .unwrap_or_else(|| email.sender_name().to_string()),
                self.verdict
                    .sender_address
                    .clone()
                    .unwrap_or_else(|| email.sender_address().to_string()),
            )
        };

        Report {
            sender_name,
            sender_email,
            subject: email.subject().to_string(),
            max_score,
            total_score: self.verdict.trust_points.clamp(0.0, f64::from(max_score)),
            ai_analysis: self.verdict,
            header_analysis: self.header.map(VerificationResult::into_analysis),
            link_analysis: self.links,
            explanation_terms: explanation_terms(),
        }
    }
}

/// Runs header checks, link checks and the classifier over one email.
pub struct Orchestrator {
    authenticator: Arc<Authenticator>,
    checker: Arc<UrlChecker>,
    crawler: Arc<Crawler>,
    analyst: Arc<Analyst>,
}

impl Orchestrator {
    pub fn new(
        authenticator: Arc<Authenticator>,
        checker: Arc<UrlChecker>,
        crawler: Arc<Crawler>,
        analyst: Arc<Analyst>,
    ) -> Self {
        Orchestrator {
            authenticator,
            checker,
            crawler,
            analyst,
        }
    }

    pub fn authenticator(&self) -> &Authenticator {
        &self.authenticator
    }

    /// `has_full_headers` is false for bodies forwarded as text; their header
    /// checks are skipped and the reduced prompt is used.
    pub async fn run_pipeline(&self, email: &ParsedEmail, has_full_headers: bool) -> PipelineResult {
        let started = Instant::now();

        let header = if has_full_headers {
            Some(self.authenticator.verify(email, &self.checker).await)
        } else {
            None
        };

        let (links, link_summary) = self.check_links(email).await;

        let classifier_input = ClassifierInput {
            header_analysis: header
                .as_ref()
                .map(|h| h.summary.clone())
                .unwrap_or_else(|| email.subject().to_string()),
            email_body: email.stripped_html(),
            link_analysis: link_summary,
        };
        let kind = if has_full_headers {
            PromptKind::FullHeaders
        } else {
            PromptKind::ForwardedBody
        };
        let verdict = self.analyst.analyze(kind, &classifier_input).await;

        log::info!(
            "Analyzed '{}': {} ({}), {} link checks, {}ms",
            email.subject(),
            verdict.title,
            verdict.trust_points,
            links.checks.len(),
            started.elapsed().as_millis()
        );

        PipelineResult {
            header,
            links,
            classifier_input,
            verdict,
        }
    }

    /// One check per distinct link target, run concurrently, plus the text
    /// block describing them for the classifier.
    pub async fn check_links(&self, email: &ParsedEmail) -> (LinkAnalysis, String) {
        let targets = link_targets(email.all_urls());
        log::debug!("Found {} links in '{}'", targets.len(), email.subject());

        let results = join_all(targets.iter().map(|url| self.check_link(url))).await;

        let mut analysis = LinkAnalysis::default();
        let mut summary = String::new();
        for (check, info) in results {
            analysis.checks.push(check);
            summary.push_str(&info);
        }
        (analysis, summary)
    }

    async fn check_link(&self, url: &str) -> (LinkCheck, String) {
        let title = format!("Checking {}", display_url(url));
        if self.checker.whitelist().check(url) {
            let check = LinkCheck {
                title,
                passed: true,
                message: LinkMessage::Text("URL found on whitelist".to_string()),
                screenshot: None,
            };
            return (check, String::new());
        }

        let crawl = self.crawler.crawl(url).await;
        let info = describe_crawl(url, &crawl.redirects, crawl.meta_description.as_deref());

        let (redirected, found) = tokio::join!(
            self.checker.check_urls(&crawl.redirects, url),
            self.checker.check_urls(&crawl.found_urls, url),
        );

        let mut nested = Vec::new();
        if let Some(last) = crawl.redirects.last() {
            nested.push(LinkCheck {
                title: format!("{} redirects checked", crawl.redirects.len()),
                passed: redirected.threats.is_empty(),
                message: LinkMessage::Nested(findings(&redirected.threats)),
                screenshot: None,
            });
            nested.push(LinkCheck {
                title: format!("Target: {}", origin_and_path(last)),
                passed: true,
                message: LinkMessage::Nested(Vec::new()),
                screenshot: None,
            });
        }
        if !crawl.found_urls.is_empty() {
            nested.push(LinkCheck {
                title: format!("{} links on the page checked", crawl.found_urls.len()),
                passed: found.threats.is_empty(),
                message: LinkMessage::Nested(findings(&found.threats)),
                screenshot: None,
            });
        }

        let check = LinkCheck {
            title,
            passed: redirected.threats.is_empty() && found.threats.is_empty(),
            message: LinkMessage::Nested(nested),
            screenshot: crawl.screenshot_id,
        };
        (check, info)
    }
}

/// Distinct http(s) targets; `mailto:` links become the mail domain's site.
pub fn link_targets(urls: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    urls.into_iter()
        .filter_map(|url| {
            if let Some(address) = url.strip_prefix("mailto:") {
                let address = address.split('?').next().unwrap_or_default();
                let domain = address.rsplit_once('@')?.1.trim();
                if domain.is_empty() {
                    return None;
                }
                return Some(format!("https://{domain}"));
            }
            Some(url)
        })
        .filter(|url| url.starts_with("http://") || url.starts_with("https://"))
        .filter(|url| seen.insert(url.clone()))
        .collect()
}

/// Origin, path and at most 30 characters of the query.
pub fn display_url(url: &str) -> String {
    let Ok(parsed) = Url::parse(url) else {
        return url.to_string();
    };
    let query = parsed.query().map(|q| format!("?{q}")).unwrap_or_default();
    let query = if query.chars().count() > QUERY_DISPLAY_LIMIT {
        let cut: String = query.chars().take(QUERY_DISPLAY_LIMIT).collect();
        format!("{cut}...")
    } else {
        query
    };
    format!("{}{}", origin_and_path(url), query)
}

fn origin_and_path(url: &str) -> String {
    match Url::parse(url) {
        Ok(parsed) => format!("{}{}", parsed.origin().ascii_serialization(), parsed.path()),
        Err(_) => url.to_string(),
    }
}

fn findings(threats: &[ThreatFinding]) -> Vec<LinkCheck> {
    threats
        .iter()
        .map(|t| LinkCheck {
            title: format!("Found: {}", t.url),
            passed: false,
            message: LinkMessage::Text(t.threat.clone()),
            screenshot: None,
        })
        .collect()
}

fn describe_crawl(url: &str, redirects: &[String], meta: Option<&str>) -> String {
    let mut hosts: Vec<String> = Vec::new();
    for redirect in redirects {
        if let Some(host) = Url::parse(redirect).ok().and_then(|u| u.host_str().map(str::to_string)) {
            if !hosts.contains(&host) {
                hosts.push(host);
            }
        }
    }

    let mut info = String::new();
    let _ = writeln!(info, "-----------------------------------");
    let _ = writeln!(info, "URL: {url}");
    let _ = writeln!(info, "1. Redirects:");
    let _ = writeln!(
        info,
        "  {} redirects to {} unique hostnames",
        redirects.len(),
        hosts.len()
    );
    let _ = writeln!(info, "  {}", hosts.join(" -> "));
    let _ = writeln!(info, "2. Meta Description:");
    let _ = writeln!(info, "  {}", meta.unwrap_or("none"));
    info
}


#[cfg(test)]
mod tests {
    use super::testing::orchestrator_with;
    use super::*;
    use crate::crawler::testing::{FakeEngine, FakeSite};
    use crate::crawler::Navigation;
    use crate::email::testing::sample_eml;
    use crate::report::Trustworthiness;
    use crate::threat::testing::CountingReputation;

    fn orchestrator(engine: FakeEngine, reputation: CountingReputation, whitelist: &[&str]) -> Orchestrator {
        orchestrator_with(engine, reputation, whitelist, true)
    }

    #[test]
    fn test_link_targets_maps_mailto_and_drops_other_schemes() {
        let targets = link_targets(vec![
            "mailto:help@pay.example?subject=hi".to_string(),
            "https://a.example/".to_string(),
            "https://a.example/".to_string(),
            "tel:+4912345".to_string(),
            "javascript:void(0)".to_string(),
        ]);
        assert_eq!(targets, vec!["https://pay.example", "https://a.example/"]);
    }

    #[test]
    fn test_display_url_truncates_long_queries() {
        assert_eq!(
            display_url("https://a.example/p?token=0123456789012345678901234567890"),
            "https://a.example/p?token=01234567890123456789012..."
        );
        assert_eq!(display_url("https://a.example/p?x=1"), "https://a.example/p?x=1");
    }

    #[tokio::test]
    async fn test_whitelisted_link_is_not_crawled() {
        let raw = sample_eml("a@sender.example", "Hi", "<a href=\"https://bank.example/login\">x</a>");
        let email = ParsedEmail::parse(&raw).unwrap();
        let orchestrator = orchestrator(FakeEngine::default(), CountingReputation::default(), &["bank.example"]);

        let (links, summary) = orchestrator.check_links(&email).await;
        assert_eq!(links.checks.len(), 1);
        assert!(links.checks[0].passed);
        assert_eq!(
            links.checks[0].message,
            LinkMessage::Text("URL found on whitelist".to_string())
        );
        assert!(summary.is_empty());
    }

    #[tokio::test]
    async fn test_threat_on_redirect_fails_the_link() {
        let site = FakeSite {
            navigation: Some(Navigation {
                chain: vec!["https://short.example/a".to_string()],
                final_url: "https://evil.example/login".to_string(),
            }),
            html: "<a href=\"https://help.example/\">help</a>".to_string(),
            ..Default::default()
        };
        let engine = FakeEngine::default().with_site("https://short.example/a", site);
        let reputation = CountingReputation::default().flag("https://evil.example/login", "SOCIAL_ENGINEERING");
        let orchestrator = orchestrator(engine, reputation, &[]);

        let raw = sample_eml("a@sender.example", "Hi", "<a href=\"https://short.example/a\">x</a>");
        let email = ParsedEmail::parse(&raw).unwrap();
        let (links, summary) = orchestrator.check_links(&email).await;

        let check = &links.checks[0];
        assert_eq!(check.title, "Checking https://short.example/a");
        assert!(!check.passed);
        let LinkMessage::Nested(nested) = &check.message else {
            panic!("expected nested checks");
        };
        assert_eq!(nested[0].title, "2 redirects checked");
        assert!(!nested[0].passed);
        assert_eq!(
            nested[0].message,
            LinkMessage::Nested(vec![LinkCheck {
                title: "Found: https://evil.example/login".to_string(),
                passed: false,
                message: LinkMessage::Text("SOCIAL_ENGINEERING - Google Safe Browsing".to_string()),
                screenshot: None,
            }])
        );
        assert_eq!(nested[1].title, "Target: https://evil.example/login");
        assert_eq!(nested[2].title, "1 links on the page checked");
        assert!(nested[2].passed);
        assert!(summary.contains("2 redirects to 2 unique hostnames"));
        assert!(summary.contains("short.example -> evil.example"));
    }

    #[tokio::test]
    async fn test_forwarded_body_uses_sender_from_verdict() {
        let raw = sample_eml("user@home.example", "Fwd: your account", "<p>Dear customer</p>");
        let email = ParsedEmail::parse(&raw).unwrap();
        let orchestrator = orchestrator(FakeEngine::default(), CountingReputation::default(), &[]);

        let result = orchestrator.run_pipeline(&email, false).await;
        assert!(result.header.is_none());
        assert_eq!(result.classifier_input.header_analysis, "Fwd: your account");

        let report = result.into_report(&email);
        assert_eq!(report.max_score, MAX_SCORE_REDUCED);
        assert_eq!(report.total_score, 5.0);
        assert_eq!(report.sender_email, "info@bank.example");
        assert!(report.header_analysis.is_none());
        assert_eq!(report.ai_analysis.trustworthiness, Trustworthiness::Trustworthy);
    }

    #[tokio::test]
    async fn test_full_headers_produce_header_analysis() {
        let raw = sample_eml("Alice <alice@sender.example>", "Invoice", "<p>Pay now</p>");
        let email = ParsedEmail::parse(&raw).unwrap();
        let orchestrator = orchestrator(FakeEngine::default(), CountingReputation::default(), &[]);

        let result = orchestrator.run_pipeline(&email, true).await;
        assert!(result.classifier_input.header_analysis.contains("Sender E-Mail: alice@sender.example"));

        let report = result.into_report(&email);
        assert_eq!(report.max_score, MAX_SCORE_FULL);
        assert_eq!(report.total_score, 8.0);
        assert_eq!(report.sender_email, "alice@sender.example");
        assert!(report.header_analysis.is_some_and(|h| !h.checks.is_empty()));
    }
}
