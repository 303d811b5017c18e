use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use crate::cache::CacheStore;
use crate::email::{ParseError, ParsedEmail};
use crate::pipeline::Orchestrator;
use crate::rate_limit::RateLimiter;
use crate::report::Report;

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("file is {size} bytes, the limit is {limit}")]
    TooLarge { size: u64, limit: u64 },
    #[error("daily upload quota of {0} reached, please try again tomorrow")]
    QuotaExceeded(u32),
    #[error("invalid EML file: {0}")]
    InvalidEml(#[from] ParseError),
    #[error("cannot read upload: {0}")]
    Io(#[from] std::io::Error),
}

/// Analysis of uploaded `.eml` files for the web front end. The HTTP layer
/// stores the upload in a temp file and hands over its path.
pub struct UploadAnalyzer {
    orchestrator: Arc<Orchestrator>,
    quota: RateLimiter,
    reports: Arc<dyn CacheStore<Report>>,
    max_size: u64,
}

impl UploadAnalyzer {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        quota: RateLimiter,
        reports: Arc<dyn CacheStore<Report>>,
        max_size: u64,
    ) -> Self {
        UploadAnalyzer {
            orchestrator,
            quota,
            reports,
            max_size,
        }
    }

    /// Analyze the file at `path` for `source` (the client address). The
    /// file is deleted on every path out of this function. A file analyzed
    /// before is answered from the report cache without charging the quota.
    pub async fn analyze_file(&self, path: &Path, source: &str) -> Result<Report, UploadError> {
        let started = Instant::now();
        let result = self.analyze(path, source).await;

        match tokio::fs::remove_file(path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => log::warn!("Failed to delete upload {}: {e}", path.display()),
        }

        match &result {
            Ok(report) => log::info!(
                "Upload from {source} analyzed in {}ms: {}",
                started.elapsed().as_millis(),
                report.subject
            ),
            Err(e) => log::info!("Upload from {source} refused: {e}"),
        }
        result
    }

    async fn analyze(&self, path: &Path, source: &str) -> Result<Report, UploadError> {
        let size = tokio::fs::metadata(path).await?.len();
        if size > self.max_size {
            return Err(UploadError::TooLarge {
                size,
                limit: self.max_size,
            });
        }

        let raw = tokio::fs::read(path).await?;
        let key = format!("analysis_{}", hex::encode(Sha256::digest(&raw)));
        if let Some(report) = self.reports.get(&key) {
            log::debug!("Serving cached report for {key}");
            return Ok(report);
        }

        if self.quota.is_exceeded(source) {
            return Err(UploadError::QuotaExceeded(self.quota.limit()));
        }

        let email = ParsedEmail::parse(&raw)?;
        let report = self
            .orchestrator
            .run_pipeline(&email, true)
            .await
            .into_report(&email);
        self.reports.insert(&key, report.clone());
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::TtlCache;
    use crate::crawler::testing::FakeEngine;
    use crate::email::testing::sample_eml;
    use crate::pipeline::testing::orchestrator_with;
    use crate::threat::testing::CountingReputation;
    use std::time::Duration;

    fn analyzer(limit: u32, max_size: u64) -> UploadAnalyzer {
        let orchestrator = orchestrator_with(FakeEngine::default(), CountingReputation::default(), &[], true);
        UploadAnalyzer::new(
            Arc::new(orchestrator),
            RateLimiter::new(limit, Duration::from_secs(86400)),
            Arc::new(TtlCache::new(Duration::from_secs(5 * 3600))),
            max_size,
        )
    }

    fn upload(dir: &Path, name: &str, content: &[u8]) -> std::path::PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    #[tokio::test]
    async fn test_repeat_upload_is_cached_and_free() {
        let dir = tempfile::tempdir().unwrap();
        let analyzer = analyzer(1, 1024 * 1024);
        let eml = sample_eml("Shop <news@shop.example>", "Order", "<p>Thanks</p>");

        let first = analyzer
            .analyze_file(&upload(dir.path(), "a.eml", &eml), "203.0.113.7")
            .await
            .unwrap();
        assert_eq!(first.max_score, 10);
        assert!(first.header_analysis.is_some());

        // Quota is used up, but the same content is served from cache.
        let path = upload(dir.path(), "b.eml", &eml);
        let second = analyzer.analyze_file(&path, "203.0.113.7").await.unwrap();
        assert_eq!(first, second);
        assert!(!path.exists());

        let other = sample_eml("news@shop.example", "Other", "<p>x</p>");
        let path = upload(dir.path(), "c.eml", &other);
        assert!(matches!(
            analyzer.analyze_file(&path, "203.0.113.7").await,
            Err(UploadError::QuotaExceeded(1))
        ));
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_oversized_and_invalid_uploads_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let small = analyzer(5, 16);

        let path = upload(dir.path(), "big.eml", &[b'x'; 17]);
        assert!(matches!(
            small.analyze_file(&path, "198.51.100.1").await,
            Err(UploadError::TooLarge { size: 17, limit: 16 })
        ));
        assert!(!path.exists());

        let regular = analyzer(5, 1024);
        let path = upload(dir.path(), "bad.eml", b"hello");
        assert!(matches!(
            regular.analyze_file(&path, "198.51.100.1").await,
            Err(UploadError::InvalidEml(_))
        ));
        assert!(!path.exists());
    }
}
