use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;

use crate::email::ParsedEmail;
use crate::maildir::{HandlerError, MailHandler, MailOutcome};
use crate::notifier::Notifier;
use crate::pipeline::Orchestrator;
use crate::rate_limit::RateLimiter;

/// Handles one submission from the drop directory.
///
/// Unauthenticated senders are rejected before the rate limit is charged, so
/// a spoofed address cannot use up someone else's quota. A submission with
/// attached original messages gets one full report per attachment; a
/// submission without attachments is analyzed as a forwarded body.
pub struct MailCheckProcessor {
    orchestrator: Arc<Orchestrator>,
    rate_limiter: Arc<RateLimiter>,
    notifier: Arc<dyn Notifier>,
}

impl MailCheckProcessor {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        rate_limiter: Arc<RateLimiter>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        MailCheckProcessor {
            orchestrator,
            rate_limiter,
            notifier,
        }
    }

    async fn report_forwarded_body(&self, email: &ParsedEmail) -> usize {
        let report = self
            .orchestrator
            .run_pipeline(email, false)
            .await
            .into_report(email);
        match self
            .notifier
            .send_reduced_report(email.sender_address(), &report)
            .await
        {
            Ok(()) => 1,
            Err(e) => {
                log::error!("Error sending security report: {e}");
                0
            }
        }
    }

    async fn report_attachments(&self, email: &ParsedEmail, nested: &[ParsedEmail]) -> usize {
        let mut sent = 0;
        for original in nested {
            let report = self
                .orchestrator
                .run_pipeline(original, true)
                .await
                .into_report(original);
            match self
                .notifier
                .send_full_report(email.sender_address(), &report)
                .await
            {
                Ok(()) => sent += 1,
                Err(e) => log::error!("Error sending security report for '{}': {e}", original.subject()),
            }
        }
        sent
    }
}

fn log_access(email: &ParsedEmail, started: Instant, spf: bool) {
    log::info!(
        "Mail access: sender={} duration={}ms subject={:?} spf={}",
        email.sender_address(),
        started.elapsed().as_millis(),
        email.subject(),
        spf
    );
}

#[async_trait]
impl MailHandler for MailCheckProcessor {
    async fn on_received(&self, raw: &[u8]) -> Result<MailOutcome, HandlerError> {
        let started = Instant::now();
        let email = match ParsedEmail::parse(raw) {
            Ok(email) => email,
            Err(e) => {
                log::warn!("Failed to parse email: {e}");
                return Ok(MailOutcome::Unparseable);
            }
        };

        if !self.orchestrator.authenticator().is_authentic(&email).await {
            log::info!("Spoofing detected: {}", email.sender_address());
            self.notifier
                .send_rejection_notice(email.sender_address(), email.subject())
                .await?;
            log_access(&email, started, false);
            return Ok(MailOutcome::Rejected);
        }

        let nested = email.nested_messages();

        if self.rate_limiter.is_exceeded(email.sender_address()) {
            let subjects = std::iter::once(email.subject())
                .chain(nested.iter().map(|n| n.subject()))
                .collect::<Vec<_>>()
                .join(", ");
            log::info!("Rate limiting email from: {}", email.sender_address());
            self.notifier
                .send_rate_limit_notice(email.sender_address(), &subjects)
                .await?;
            return Ok(MailOutcome::RateLimited);
        }

        let count = if nested.is_empty() {
            self.report_forwarded_body(&email).await
        } else {
            self.report_attachments(&email, &nested).await
        };

        log_access(&email, started, true);
        Ok(MailOutcome::Reported { count })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::testing::FakeEngine;
    use crate::email::testing::{forwarding_eml, sample_eml};
    use crate::notifier::testing::RecordingNotifier;
    use crate::pipeline::testing::orchestrator_with;
    use crate::threat::testing::CountingReputation;
    use std::time::Duration;

    fn processor(spf_pass: bool, limit: u32) -> (MailCheckProcessor, Arc<RecordingNotifier>) {
        let notifier = Arc::new(RecordingNotifier::default());
        let orchestrator = orchestrator_with(
            FakeEngine::default(),
            CountingReputation::default(),
            &[],
            spf_pass,
        );
        let processor = MailCheckProcessor::new(
            Arc::new(orchestrator),
            Arc::new(RateLimiter::new(limit, Duration::from_secs(86400))),
            notifier.clone(),
        );
        (processor, notifier)
    }

    #[tokio::test]
    async fn test_garbage_is_unparseable() {
        let (processor, notifier) = processor(true, 3);
        let outcome = processor.on_received(b"not an email").await.unwrap();
        assert_eq!(outcome, MailOutcome::Unparseable);
        assert!(notifier.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn test_spoofed_sender_is_rejected_without_charging_quota() {
        let (processor, notifier) = processor(false, 1);
        let raw = sample_eml("victim@sender.example", "Hello", "<p>hi</p>");
        assert_eq!(processor.on_received(&raw).await.unwrap(), MailOutcome::Rejected);
        assert_eq!(processor.rate_limiter.remaining("victim@sender.example"), 1);
        assert_eq!(notifier.subjects(), vec!["Your email could not be processed"]);
    }

    #[tokio::test]
    async fn test_forwarded_body_gets_reduced_report() {
        let (processor, notifier) = processor(true, 3);
        let raw = sample_eml("user@sender.example", "Fwd: account", "<p>Dear customer</p>");
        assert_eq!(
            processor.on_received(&raw).await.unwrap(),
            MailOutcome::Reported { count: 1 }
        );
        let sent = notifier.sent.lock();
        assert_eq!(sent[0].to, "user@sender.example");
        assert_eq!(sent[0].subject, "Security report - Real Bank");
        assert!(sent[0].body.contains("Score: 5 of 5"));
    }

    #[tokio::test]
    async fn test_attached_original_gets_full_report() {
        let (processor, notifier) = processor(true, 3);
        let inner = sample_eml("Shop <news@shop.example>", "Your order", "<p>Thanks</p>");
        let raw = forwarding_eml("user@sender.example", &inner);
        assert_eq!(
            processor.on_received(&raw).await.unwrap(),
            MailOutcome::Reported { count: 1 }
        );
        let sent = notifier.sent.lock();
        assert_eq!(sent[0].subject, "Security report - Shop");
        assert!(sent[0].body.contains("Header analysis:"));
        assert!(sent[0].body.contains("Score: 8 of 10"));
    }

    #[tokio::test]
    async fn test_fourth_submission_is_rate_limited() {
        let (processor, notifier) = processor(true, 3);
        let inner = sample_eml("news@shop.example", "Your order", "<p>Thanks</p>");
        let raw = forwarding_eml("user@sender.example", &inner);
        for _ in 0..3 {
            assert!(matches!(
                processor.on_received(&raw).await.unwrap(),
                MailOutcome::Reported { .. }
            ));
        }
        assert_eq!(processor.on_received(&raw).await.unwrap(), MailOutcome::RateLimited);
        let subjects = notifier.subjects();
        assert_eq!(
            subjects.last().map(String::as_str),
            Some("Free email checks used up - Fwd: please check, Your order")
        );
    }
}
