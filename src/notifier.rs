//! Outbound notices to the person who submitted a message.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use lazy_static::lazy_static;
use regex::{Captures, Regex};
use std::fmt::Write as _;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::config::NotifierConfig;
use crate::report::{explanation_path, LinkCheck, LinkMessage, Report};

const SENDMAIL_TIMEOUT: Duration = Duration::from_secs(30);

lazy_static! {
    static ref TERM: Regex = Regex::new(r"\[\[([^\]]+)\]\]").unwrap();
}

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("invalid recipient: {0:?}")]
    InvalidRecipient(String),
    #[error("failed to run sendmail: {0}")]
    Io(#[from] std::io::Error),
    #[error("sendmail exited with {0}")]
    Transport(std::process::ExitStatus),
    #[error("sendmail timed out")]
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub to: String,
    pub subject: String,
    pub body: String,
}

/// Renders notices as plain text. `[[Term]]` markers become the term
/// followed by a link to its explanation page.
#[derive(Debug, Clone)]
pub struct Composer {
    site_url: String,
}

impl Composer {
    pub fn new(site_url: impl Into<String>) -> Self {
        Composer {
            site_url: site_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn link_terms(&self, text: &str) -> String {
        TERM.replace_all(text, |caps: &Captures| {
            let term = &caps[1];
            match explanation_path(term) {
                Some(path) => format!("{term} ({}{path})", self.site_url),
                None => term.to_string(),
            }
        })
        .into_owned()
    }

    pub fn report(&self, to: &str, report: &Report) -> OutgoingMessage {
        let ai = &report.ai_analysis;
        let mut body = String::new();
        let _ = writeln!(body, "Security report\n");
        let _ = writeln!(body, "Checked email:");
        let _ = writeln!(body, "  Subject: {}", report.subject);
        let _ = writeln!(body, "  Sender:  {} <{}>\n", report.sender_name, report.sender_email);

        if report.header_analysis.is_none() {
            let _ = writeln!(
                body,
                "You forwarded this email as text, not as an attachment. Only the original \
                 email file allows a complete analysis, see {}/how\n",
                self.site_url
            );
        }

        let _ = writeln!(body, "Score: {} of {}\n", report.total_score, report.max_score);
        let _ = writeln!(body, "AI analysis: {}", ai.title);
        for threat in &ai.threats {
            let _ = writeln!(
                body,
                "  [{:?}] {}: {}",
                threat.severity, threat.title, threat.description
            );
        }
        let _ = writeln!(body, "\n{}\n", self.link_terms(&ai.explanation));

        if let Some(headers) = &report.header_analysis {
            let _ = writeln!(body, "Header analysis:");
            for check in &headers.checks {
                let _ = writeln!(body, "  {} {}: {}", mark(check.passed), check.title, check.message);
            }
            body.push('\n');
        }

        let _ = writeln!(body, "URL analysis:");
        if report.link_analysis.checks.is_empty() {
            let _ = writeln!(body, "  No links found.");
        }
        for check in &report.link_analysis.checks {
            write_link_check(&mut body, check, 1);
            if let Some(id) = &check.screenshot {
                let _ = writeln!(body, "    Screenshot: {}/screenshot/{id}", self.site_url);
            }
        }
        let _ = writeln!(
            body,
            "\nLinks were only matched against known blacklists. A link that is not \
             listed is not guaranteed to be safe."
        );

        OutgoingMessage {
            to: to.to_string(),
            subject: format!("Security report - {}", report.sender_name),
            body,
        }
    }

    pub fn rate_limit_notice(&self, to: &str, subjects: &str) -> OutgoingMessage {
        OutgoingMessage {
            to: to.to_string(),
            subject: format!("Free email checks used up - {subjects}"),
            body: format!(
                "You have used up your free email checks for today. Please try again in 24 hours.\n\n\
                 Your email with the subject \"{subjects}\" was not stored. Send it again once \
                 your quota is available.\n"
            ),
        }
    }

    pub fn rejection_notice(&self, to: &str, subject: &str) -> OutgoingMessage {
        let body = format!(
            "Your email with the subject \"{subject}\" could not be processed because it failed \
             the [[SPF]] check. To prevent abuse, unauthenticated submissions are deleted \
             immediately.\n\nPlease make sure your email passes SPF and try again. Your email \
             provider can help with the configuration.\n"
        );
        OutgoingMessage {
            to: to.to_string(),
            subject: "Your email could not be processed".to_string(),
            body: self.link_terms(&body),
        }
    }
}

fn mark(passed: bool) -> &'static str {
    if passed {
        "[ok]"
    } else {
        "[!!]"
    }
}

fn write_link_check(out: &mut String, check: &LinkCheck, depth: usize) {
    let indent = "  ".repeat(depth);
    match &check.message {
        LinkMessage::Text(text) => {
            let _ = writeln!(out, "{indent}{} {}: {text}", mark(check.passed), check.title);
        }
        LinkMessage::Nested(children) => {
            let _ = writeln!(out, "{indent}{} {}", mark(check.passed), check.title);
            for child in children {
                write_link_check(out, child, depth + 1);
            }
        }
    }
}

/// Sends the notices users receive. Implementors provide transport only.
#[async_trait]
pub trait Notifier: Send + Sync {
    fn composer(&self) -> &Composer;

    async fn deliver(&self, message: OutgoingMessage) -> Result<(), NotifyError>;

    async fn send_full_report(&self, to: &str, report: &Report) -> Result<(), NotifyError> {
        self.deliver(self.composer().report(to, report)).await
    }

    async fn send_reduced_report(&self, to: &str, report: &Report) -> Result<(), NotifyError> {
        self.deliver(self.composer().report(to, report)).await
    }

    async fn send_rate_limit_notice(&self, to: &str, subjects: &str) -> Result<(), NotifyError> {
        self.deliver(self.composer().rate_limit_notice(to, subjects)).await
    }

    async fn send_rejection_notice(&self, to: &str, subject: &str) -> Result<(), NotifyError> {
        self.deliver(self.composer().rejection_notice(to, subject)).await
    }
}

/// Writes notices to the log instead of sending them.
pub struct LogNotifier {
    composer: Composer,
}

impl LogNotifier {
    pub fn new(composer: Composer) -> Self {
        LogNotifier { composer }
    }
}

#[async_trait]
impl Notifier for LogNotifier {
    fn composer(&self) -> &Composer {
        &self.composer
    }

    async fn deliver(&self, message: OutgoingMessage) -> Result<(), NotifyError> {
        log::info!("Notice to {}: {}", message.to, message.subject);
        log::debug!("{}", message.body);
        Ok(())
    }
}

/// Hands notices to the local MTA through `sendmail -t -i`.
pub struct SendmailNotifier {
    composer: Composer,
    sendmail_path: String,
    from: String,
}

impl SendmailNotifier {
    pub fn new(config: &NotifierConfig) -> Self {
        SendmailNotifier {
            composer: Composer::new(&config.site_url),
            sendmail_path: config.sendmail_path.clone(),
            from: config.from_address.clone(),
        }
    }
}

/// RFC 2047 encoded-word for non-ASCII header values.
pub fn encode_header(value: &str) -> String {
    if value.is_ascii() {
        value.to_string()
    } else {
        format!("=?UTF-8?B?{}?=", STANDARD.encode(value.as_bytes()))
    }
}

/// The full message as piped to sendmail.
pub fn compose_message(from: &str, message: &OutgoingMessage) -> Result<Vec<u8>, NotifyError> {
    let header_safe = |s: &str| !s.contains(['\r', '\n']);
    if message.to.is_empty() || !header_safe(&message.to) {
        return Err(NotifyError::InvalidRecipient(message.to.clone()));
    }
    let subject = message.subject.replace(['\r', '\n'], " ");

    let mut out = String::new();
    let _ = write!(out, "From: {from}\r\n");
    let _ = write!(out, "To: {}\r\n", message.to);
    let _ = write!(out, "Subject: {}\r\n", encode_header(&subject));
    out.push_str("MIME-Version: 1.0\r\n");
    out.push_str("Content-Type: text/plain; charset=utf-8\r\n");
    out.push_str("Content-Transfer-Encoding: 8bit\r\n\r\n");
    for line in message.body.lines() {
        out.push_str(line);
        out.push_str("\r\n");
    }
    Ok(out.into_bytes())
}

#[async_trait]
impl Notifier for SendmailNotifier {
    fn composer(&self) -> &Composer {
        &self.composer
    }

    async fn deliver(&self, message: OutgoingMessage) -> Result<(), NotifyError> {
        let payload = compose_message(&self.from, &message)?;
        let mut child = Command::new(&self.sendmail_path)
            .arg("-t")
            .arg("-i")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&payload).await?;
        }
        let status = tokio::time::timeout(SENDMAIL_TIMEOUT, child.wait())
            .await
            .map_err(|_| NotifyError::Timeout)??;
        if !status.success() {
            return Err(NotifyError::Transport(status));
        }
        log::info!("Sent '{}' to {}", message.subject, message.to);
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::{
        explanation_terms, AiAnalysis, HeaderAnalysis, HeaderCheck, LinkAnalysis, Severity,
    };

    fn report(with_headers: bool) -> Report {
        Report {
            sender_name: "Bank".to_string(),
            sender_email: "info@bank.example".to_string(),
            subject: "Account locked".to_string(),
            max_score: 10,
            total_score: 1.0,
            ai_analysis: AiAnalysis {
                explanation: "The [[SPF]] check failed and [[Unknown]] too.".to_string(),
                ..AiAnalysis::unavailable("x")
            },
            header_analysis: with_headers.then(|| HeaderAnalysis {
                checks: vec![HeaderCheck::fail("Spoofing check", "SPF failed", Severity::High)],
            }),
            link_analysis: LinkAnalysis {
                checks: vec![LinkCheck {
                    title: "Checking https://a.example/".to_string(),
                    passed: false,
                    message: LinkMessage::Nested(vec![LinkCheck {
                        title: "Found: https://b.example/".to_string(),
                        passed: false,
                        message: LinkMessage::Text("MALWARE - Google Safe Browsing".to_string()),
                        screenshot: None,
                    }]),
                    screenshot: Some("abc".to_string()),
                }],
            },
            explanation_terms: explanation_terms(),
        }
    }

    #[test]
    fn test_terms_are_linked() {
        let composer = Composer::new("https://mailcheck.example/");
        assert_eq!(
            composer.link_terms("[[SPF]] and [[Nope]]"),
            "SPF (https://mailcheck.example/explain/spf) and Nope"
        );
    }

    #[test]
    fn test_report_rendering() {
        let composer = Composer::new("https://mailcheck.example");
        let full = composer.report("user@home.example", &report(true));
        assert_eq!(full.subject, "Security report - Bank");
        assert!(full.body.contains("[!!] Spoofing check: SPF failed"));
        assert!(full.body.contains("    [!!] Found: https://b.example/: MALWARE - Google Safe Browsing"));
        assert!(full.body.contains("https://mailcheck.example/screenshot/abc"));
        assert!(full.body.contains("SPF (https://mailcheck.example/explain/spf)"));
        assert!(!full.body.contains("forwarded this email as text"));

        let reduced = composer.report("user@home.example", &report(false));
        assert!(reduced.body.contains("forwarded this email as text"));
        assert!(!reduced.body.contains("Header analysis"));
    }

    #[test]
    fn test_compose_message_encodes_subject_and_rejects_injection() {
        let message = OutgoingMessage {
            to: "user@home.example".to_string(),
            subject: "Prüfung".to_string(),
            body: "line one\nline two".to_string(),
        };
        let raw = String::from_utf8(compose_message("check@mailcheck.example", &message).unwrap()).unwrap();
        assert!(raw.contains("Subject: =?UTF-8?B?UHLDvGZ1bmc=?=\r\n"));
        assert!(raw.ends_with("line one\r\nline two\r\n"));

        let injected = OutgoingMessage {
            to: "a@b.example\r\nBcc: x@y.example".to_string(),
            ..message
        };
        assert!(matches!(
            compose_message("check@mailcheck.example", &injected),
            Err(NotifyError::InvalidRecipient(_))
        ));
    }

    #[tokio::test]
    async fn test_rejection_notice_mentions_subject() {
        let notifier = testing::RecordingNotifier::default();
        notifier
            .send_rejection_notice("user@home.example", "Invoice")
            .await
            .unwrap();
        let sent = notifier.sent.lock();
        assert!(sent[0].body.contains("\"Invoice\""));
        assert!(sent[0].body.contains("/explain/spf"));
    }
}
