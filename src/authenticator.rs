//! Sender authentication and header analysis for a parsed message.

use async_trait::async_trait;
use futures::future::join_all;
use mail_auth::{AuthenticatedMessage, DkimResult, Resolver, SpfResult};
use std::fmt::Write as _;
use std::net::IpAddr;
use std::sync::Arc;

use crate::cache::CacheStore;
use crate::dns::{first_listing, format_for_dnsbl, resolve_host, DnsLookup};
use crate::email::ParsedEmail;
use crate::malware::MalwareScanner;
use crate::report::{HeaderAnalysis, HeaderCheck, Severity};
use crate::threat::UrlChecker;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("failed to create authentication resolver: {0}")]
    Setup(String),
    #[error("message could not be parsed for DKIM verification")]
    Unparseable,
}

/// SPF and DKIM evaluation.
#[async_trait]
pub trait SenderVerifier: Send + Sync {
    /// Whether `ip` (announcing itself as `helo`) may send for `sender`.
    async fn spf_passes(&self, ip: IpAddr, helo: &str, sender: &str, relay: &str) -> bool;
    /// One entry per DKIM signature: whether it verified.
    async fn dkim_results(&self, raw: &[u8]) -> Result<Vec<bool>, AuthError>;
}

pub struct MailAuthVerifier {
    resolver: Resolver,
}

impl MailAuthVerifier {
    pub fn new() -> Result<Self, AuthError> {
        let resolver = Resolver::new_system_conf().map_err(|e| AuthError::Setup(e.to_string()))?;
        Ok(MailAuthVerifier { resolver })
    }
}

#[async_trait]
impl SenderVerifier for MailAuthVerifier {
    async fn spf_passes(&self, ip: IpAddr, helo: &str, sender: &str, relay: &str) -> bool {
        let output = self.resolver.verify_spf_sender(ip, helo, relay, sender).await;
        log::debug!("SPF for {sender} via {helo} [{ip}]: {:?}", output.result());
        output.result() == SpfResult::Pass
    }

    async fn dkim_results(&self, raw: &[u8]) -> Result<Vec<bool>, AuthError> {
        let message = AuthenticatedMessage::parse(raw).ok_or(AuthError::Unparseable)?;
        let outputs = self.resolver.verify_dkim(&message).await;
        Ok(outputs
            .iter()
            .map(|output| output.result() == &DkimResult::Pass)
            .collect())
    }
}

/// Why a sender was or was not accepted as authentic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpoofingVerdict {
    NoHelo,
    NoAddress,
    Blacklisted { ip: IpAddr, list: String },
    SpfFailed { ip: IpAddr },
    SpfPassed { ip: IpAddr },
}

impl SpoofingVerdict {
    pub fn is_authentic(&self) -> bool {
        matches!(self, SpoofingVerdict::SpfPassed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentScan {
    pub file_name: String,
    pub viruses: Vec<String>,
    pub checksum: String,
}

/// Header checks plus the text block handed to the classifier.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VerificationResult {
    pub checks: Vec<HeaderCheck>,
    pub summary: String,
}

impl VerificationResult {
    pub fn into_analysis(self) -> HeaderAnalysis {
        HeaderAnalysis {
            checks: self.checks,
        }
    }
}

pub struct Authenticator {
    dns: Arc<dyn DnsLookup>,
    verifier: Arc<dyn SenderVerifier>,
    scanner: Arc<dyn MalwareScanner>,
    ip_blacklists: Vec<String>,
    dnsbl_cache: Arc<dyn CacheStore<Option<String>>>,
    relay: String,
}

impl Authenticator {
    pub fn new(
        dns: Arc<dyn DnsLookup>,
        verifier: Arc<dyn SenderVerifier>,
        scanner: Arc<dyn MalwareScanner>,
        ip_blacklists: Vec<String>,
        dnsbl_cache: Arc<dyn CacheStore<Option<String>>>,
        relay: impl Into<String>,
    ) -> Self {
        Authenticator {
            dns,
            verifier,
            scanner,
            ip_blacklists,
            dnsbl_cache,
            relay: relay.into(),
        }
    }

    pub fn relay(&self) -> &str {
        &self.relay
    }

    /// The first IP blacklist listing `ip`. Hits and misses are cached.
    pub async fn check_ip_dnsbl(&self, ip: IpAddr) -> Option<String> {
        let key = ip.to_string();
        if let Some(cached) = self.dnsbl_cache.get(&key) {
            return cached;
        }
        let listing =
            first_listing(self.dns.as_ref(), &format_for_dnsbl(&ip), &self.ip_blacklists).await;
        self.dnsbl_cache.insert(&key, listing.clone());
        listing
    }

    /// HELO, then its address, then blacklists, then SPF. Each step that
    /// cannot be completed counts against the sender.
    pub async fn spoofing_check(&self, email: &ParsedEmail) -> SpoofingVerdict {
        let trace = email.routing_trace(&self.relay);
        let helo = match trace.helo {
            Some(helo) => helo,
            None => {
                log::warn!("No HELO found in Received chain of {}", email.sender_address());
                return SpoofingVerdict::NoHelo;
            }
        };

        let ip = match resolve_host(self.dns.as_ref(), &helo).await {
            Some(ip) => ip,
            None => match trace.sender_ip {
                Some(v4) => IpAddr::V4(v4),
                None => {
                    log::warn!("No address found for sending server {helo}");
                    return SpoofingVerdict::NoAddress;
                }
            },
        };

        if let Some(list) = self.check_ip_dnsbl(ip).await {
            log::warn!("Sending server {helo} [{ip}] is listed on {list}");
            return SpoofingVerdict::Blacklisted { ip, list };
        }

        if self
            .verifier
            .spf_passes(ip, &helo, email.sender_address(), &self.relay)
            .await
        {
            SpoofingVerdict::SpfPassed { ip }
        } else {
            SpoofingVerdict::SpfFailed { ip }
        }
    }

    pub async fn is_authentic(&self, email: &ParsedEmail) -> bool {
        self.spoofing_check(email).await.is_authentic()
    }

    /// True only when there is at least one signature and all of them pass.
    pub async fn dkim_valid(&self, email: &ParsedEmail) -> bool {
        match self.verifier.dkim_results(email.raw()).await {
            Ok(results) => !results.is_empty() && results.iter().all(|passed| *passed),
            Err(e) => {
                log::debug!("DKIM verification failed: {e}");
                false
            }
        }
    }

    /// Scan every attachment concurrently. A scanner failure is logged and
    /// reported as clean for that attachment only.
    pub async fn malware_scan(&self, email: &ParsedEmail) -> Vec<AttachmentScan> {
        let scans = email.attachments().iter().map(|attachment| async move {
            let viruses = match self.scanner.scan(&attachment.content).await {
                Ok(viruses) => viruses,
                Err(e) => {
                    log::error!("Malware scan of {} failed: {e}", attachment.file_name);
                    Vec::new()
                }
            };
            AttachmentScan {
                file_name: attachment.file_name.clone(),
                viruses,
                checksum: attachment.checksum.clone(),
            }
        });
        join_all(scans).await
    }

    async fn blacklist_check(&self, checker: &UrlChecker, domain: Option<&str>) -> Option<String> {
        match domain {
            Some(domain) if !domain.is_empty() => checker.check_domain(domain).await,
            _ => None,
        }
    }

    /// Full header analysis: sender domain, sending server, Return-Path,
    /// spoofing, DKIM and attachment malware.
    pub async fn verify(&self, email: &ParsedEmail, checker: &UrlChecker) -> VerificationResult {
        let sender_domain = email.sender_domain().unwrap_or_default().to_lowercase();
        let helo = email.routing_trace(&self.relay).helo;
        let return_path_domain = email
            .return_path()
            .and_then(|rp| rp.rsplit_once('@'))
            .map(|(_, d)| d.to_lowercase());
        let return_path_differs = return_path_domain
            .as_deref()
            .is_some_and(|d| d != sender_domain);

        let (sender_listing, server_listing, return_path_listing, spoofing, dkim, scans) = tokio::join!(
            self.blacklist_check(checker, Some(&sender_domain)),
            self.blacklist_check(checker, helo.as_deref()),
            async {
                if return_path_differs {
                    self.blacklist_check(checker, return_path_domain.as_deref()).await
                } else {
                    None
                }
            },
            self.spoofing_check(email),
            self.dkim_valid(email),
            self.malware_scan(email),
        );

        let mut checks = Vec::new();
        let mut summary = String::new();

        checks.push(blacklist_result("Sender domain check", &sender_domain, &sender_listing));
        let _ = writeln!(summary, "Sender E-Mail: {}", email.sender_address());
        if let Some(listing) = &sender_listing {
            let _ = writeln!(summary, "Sender domain is blacklisted: {listing}");
        }
        let _ = writeln!(summary, "Sender Name: {}", email.sender_name());
        let _ = writeln!(summary, "Subject: {}", email.subject());

        if let Some(helo) = &helo {
            checks.push(blacklist_result("Sending mail server check", helo, &server_listing));
            let _ = writeln!(summary, "Sender Mailserver: {helo}");
            if let Some(listing) = &server_listing {
                let _ = writeln!(summary, "Mailserver is blacklisted: {listing}");
            }
        }

        if let (Some(return_path), Some(rp_domain)) = (email.return_path(), &return_path_domain) {
            let _ = writeln!(summary, "Return Path: {return_path}");
            if return_path_differs {
                if !rp_domain.ends_with(&format!(".{sender_domain}")) {
                    checks.push(HeaderCheck::fail(
                        "Return-Path check",
                        format!(
                            "The Return-Path domain ({rp_domain}) does not match the sender domain ({sender_domain})."
                        ),
                        Severity::Low,
                    ));
                }
                checks.push(blacklist_result(
                    "Return-Path domain check",
                    rp_domain,
                    &return_path_listing,
                ));
                if let Some(listing) = &return_path_listing {
                    let _ = writeln!(summary, "Return Path domain is blacklisted: {listing}");
                }
            }
        }

        let spf_passed = spoofing.is_authentic();
        checks.push(if spf_passed {
            HeaderCheck::pass("Spoofing check", "SPF check passed.")
        } else {
            HeaderCheck::fail(
                "Spoofing check",
                "SPF check failed. The sender address may be forged.",
                Severity::High,
            )
        });
        let _ = writeln!(summary, "SPF: {}", if spf_passed { "Passed" } else { "Failed" });

        checks.push(if dkim {
            HeaderCheck::pass(
                "Message integrity check",
                "DKIM signature is valid. The message is authenticated.",
            )
        } else {
            HeaderCheck::fail(
                "Message integrity check",
                "DKIM verification failed. The message may have been altered.",
                Severity::Medium,
            )
        });
        let _ = writeln!(summary, "DKIM: {}", if dkim { "Passed" } else { "Failed" });

        for scan in &scans {
            let title = format!("Malware scan of attachment ({})", scan.file_name);
            checks.push(if scan.viruses.is_empty() {
                HeaderCheck::pass(title, "No viruses found.")
            } else {
                HeaderCheck::fail(
                    title,
                    format!("Viruses found: {}.", scan.viruses.join(", ")),
                    Severity::High,
                )
            });
        }
        if !scans.is_empty() {
            let names: Vec<&str> = scans.iter().map(|s| s.file_name.as_str()).collect();
            let clean = scans.iter().all(|s| s.viruses.is_empty());
            let _ = writeln!(summary, "Attachments: {}", names.join(", "));
            let _ = writeln!(summary, "Virus Scan: {}", if clean { "Passed" } else { "Failed" });
        }

        VerificationResult { checks, summary }
    }
}

fn blacklist_result(title: &str, subject: &str, listing: &Option<String>) -> HeaderCheck {
    match listing {
        Some(listing) => HeaderCheck::fail(
            title,
            format!("{subject} was found on a blacklist ({listing})."),
            Severity::High,
        ),
        None => HeaderCheck::pass(title, format!("{subject} was not found on any blacklist.")),
    }
}
