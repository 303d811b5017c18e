//! Builds every long-lived component once and wires them together.

use anyhow::Context;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::authenticator::{Authenticator, MailAuthVerifier};
use crate::cache::{spawn_sweeper, CacheStore, TtlCache};
use crate::classifier::{Analyst, ChatCompletionClient};
use crate::config::{Config, NotifierKind};
use crate::crawler::chromium::ChromiumEngine;
use crate::crawler::{CrawlResult, CrawlSettings, CrawlSlots, Crawler};
use crate::dns::HickoryLookup;
use crate::maildir::MaildirWatcher;
use crate::malware::{ClamdScanner, DisabledScanner, MalwareScanner};
use crate::notifier::{Composer, LogNotifier, Notifier, SendmailNotifier};
use crate::pipeline::Orchestrator;
use crate::processor::MailCheckProcessor;
use crate::rate_limit::RateLimiter;
use crate::report::Report;
use crate::screenshots::{self, ScreenshotLedger};
use crate::threat::{NoReputation, SafeBrowsingClient, UrlChecker, UrlReputation};
use crate::whitelist::{self, Whitelist};

const CACHE_SWEEP_INTERVAL: Duration = Duration::from_secs(600);
const SCREENSHOT_SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

pub struct Services {
    pub config: Config,
    pub whitelist: Arc<Whitelist>,
    pub url_cache: Arc<TtlCache<Option<String>>>,
    pub dnsbl_cache: Arc<TtlCache<Option<String>>>,
    pub crawl_cache: Arc<TtlCache<CrawlResult>>,
    pub report_cache: Arc<TtlCache<Report>>,
    pub screenshots: Arc<ScreenshotLedger>,
    pub crawler: Arc<Crawler>,
    pub orchestrator: Arc<Orchestrator>,
    pub rate_limiter: Arc<RateLimiter>,
    pub notifier: Arc<dyn Notifier>,
    pub upload: Arc<crate::upload::UploadAnalyzer>,
}

impl Services {
    pub async fn build(config: Config) -> anyhow::Result<Self> {
        let threats = &config.threats;
        let cache_ttl = Duration::from_secs(threats.cache_ttl_seconds);

        let whitelist = Arc::new(Whitelist::new());
        if let Some(path) = &config.whitelist.path {
            match whitelist.load(std::path::Path::new(path)).await {
                Ok(count) => log::info!("Loaded {count} whitelisted hosts from {path}"),
                Err(e) => log::warn!("Whitelist {path} not loaded: {e}"),
            }
        }

        let dns = Arc::new(HickoryLookup::from_config(threats).context("failed to set up DNS resolver")?);
        let reputation: Arc<dyn UrlReputation> = match &threats.safe_browsing_api_key {
            Some(key) => Arc::new(
                SafeBrowsingClient::new(key.clone(), Duration::from_secs(threats.http_timeout_seconds))
                    .context("failed to build Safe Browsing client")?,
            ),
            None => {
                log::warn!("No Safe Browsing API key configured, URL reputation checks disabled");
                Arc::new(NoReputation)
            }
        };

        let url_cache: Arc<TtlCache<Option<String>>> = Arc::new(TtlCache::new(cache_ttl));
        let checker = Arc::new(
            UrlChecker::new(
                whitelist.clone(),
                reputation,
                dns.clone(),
                threats.domain_blacklists.clone(),
                url_cache.clone(),
            )
            .with_lookup_delay(Duration::from_millis(threats.lookup_delay_ms)),
        );

        let scanner: Arc<dyn MalwareScanner> = match &config.malware.clamd_address {
            Some(address) => Arc::new(ClamdScanner::new(
                address.clone(),
                Duration::from_secs(config.malware.timeout_seconds),
            )),
            None => Arc::new(DisabledScanner),
        };
        let dnsbl_cache: Arc<TtlCache<Option<String>>> = Arc::new(TtlCache::new(cache_ttl));
        let authenticator = Arc::new(Authenticator::new(
            dns,
            Arc::new(MailAuthVerifier::new().context("failed to set up SPF/DKIM resolver")?),
            scanner,
            threats.ip_blacklists.clone(),
            dnsbl_cache.clone(),
            config.mail_server.clone(),
        ));

        let screenshots = Arc::new(
            ScreenshotLedger::open(
                &config.crawler.screenshot_dir,
                config.crawler.screenshot_retention_days,
            )
            .await
            .with_context(|| format!("cannot open screenshot ledger in {}", config.crawler.screenshot_dir))?,
        );
        let crawl_cache: Arc<TtlCache<CrawlResult>> =
            Arc::new(TtlCache::new(Duration::from_secs(config.crawler.result_ttl_seconds)));
        let crawler = Arc::new(Crawler::new(
            Arc::new(ChromiumEngine::new(&config.crawler)),
            Arc::new(CrawlSlots::new(config.crawler.max_concurrency)),
            crawl_cache.clone(),
            Some(screenshots.clone()),
            CrawlSettings::from(&config.crawler),
        ));

        let classifier = ChatCompletionClient::new(&config.classifier).context("failed to build classifier client")?;
        if config.classifier.api_key.is_none() {
            log::warn!("No classifier API key configured, verdicts will be unavailable");
        }
        let analyst = Arc::new(Analyst::new(
            Arc::new(classifier),
            config.classifier.prompts_dir.as_ref().map(PathBuf::from),
        ));

        let orchestrator = Arc::new(Orchestrator::new(authenticator, checker, crawler.clone(), analyst));

        let rate_limiter = Arc::new(RateLimiter::new(
            config.rate_limit.daily_limit,
            Duration::from_secs(config.rate_limit.window_seconds),
        ));
        for identity in &config.rate_limit.whitelist {
            rate_limiter.add_to_whitelist(identity);
        }

        let notifier: Arc<dyn Notifier> = match config.notifier.kind {
            NotifierKind::Log => Arc::new(LogNotifier::new(Composer::new(&config.notifier.site_url))),
            NotifierKind::Sendmail => Arc::new(SendmailNotifier::new(&config.notifier)),
        };

        let report_cache: Arc<TtlCache<Report>> =
            Arc::new(TtlCache::new(Duration::from_secs(config.upload.report_cache_seconds)));
        let upload = Arc::new(crate::upload::UploadAnalyzer::new(
            orchestrator.clone(),
            RateLimiter::new(config.upload.daily_limit, Duration::from_secs(86400)),
            report_cache.clone(),
            config.upload.max_size_bytes,
        ));

        Ok(Services {
            config,
            whitelist,
            url_cache,
            dnsbl_cache,
            crawl_cache,
            report_cache,
            screenshots,
            crawler,
            orchestrator,
            rate_limiter,
            notifier,
            upload,
        })
    }

    pub fn processor(&self) -> Arc<MailCheckProcessor> {
        Arc::new(MailCheckProcessor::new(
            self.orchestrator.clone(),
            self.rate_limiter.clone(),
            self.notifier.clone(),
        ))
    }

    pub fn maildir_watcher(&self) -> MaildirWatcher {
        MaildirWatcher::new(&self.config.maildir, self.config.mail_server.clone(), self.processor())
    }

    /// Periodic maintenance: whitelist reload, cache sweeps, screenshot
    /// expiry and browser idle shutdown.
    pub fn spawn_background(&self) -> Vec<JoinHandle<()>> {
        let mut tasks = Vec::new();

        if let Some(path) = &self.config.whitelist.path {
            tasks.push(whitelist::spawn_reload(
                self.whitelist.clone(),
                PathBuf::from(path),
                Duration::from_secs(self.config.whitelist.reload_interval_seconds),
            ));
        }

        let url_cache: Arc<dyn CacheStore<Option<String>>> = self.url_cache.clone();
        let dnsbl_cache: Arc<dyn CacheStore<Option<String>>> = self.dnsbl_cache.clone();
        let crawl_cache: Arc<dyn CacheStore<CrawlResult>> = self.crawl_cache.clone();
        let report_cache: Arc<dyn CacheStore<Report>> = self.report_cache.clone();
        tasks.push(spawn_sweeper("url", url_cache, CACHE_SWEEP_INTERVAL));
        tasks.push(spawn_sweeper("dnsbl", dnsbl_cache, CACHE_SWEEP_INTERVAL));
        tasks.push(spawn_sweeper("crawl", crawl_cache, CACHE_SWEEP_INTERVAL));
        tasks.push(spawn_sweeper("report", report_cache, CACHE_SWEEP_INTERVAL));

        let rate_limiter = self.rate_limiter.clone();
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CACHE_SWEEP_INTERVAL);
            loop {
                ticker.tick().await;
                rate_limiter.sweep();
            }
        }));

        let ledger = self.screenshots.clone();
        tasks.push(tokio::spawn(async move {
            let dir = ledger.dir().to_path_buf();
            match ledger.bulk_import(&dir).await {
                Ok(0) => {}
                Ok(n) => log::info!("Adopted {n} untracked screenshots"),
                Err(e) => log::error!("Screenshot import failed: {e}"),
            }
        }));
        tasks.push(screenshots::spawn_sweeper(self.screenshots.clone(), SCREENSHOT_SWEEP_INTERVAL));

        tasks.push(self.crawler.spawn_idle_monitor(
            Duration::from_secs(self.config.crawler.idle_check_seconds),
            Duration::from_secs(self.config.crawler.idle_shutdown_seconds),
        ));

        tasks
    }

    pub async fn shutdown(&self) {
        self.crawler.shutdown().await;
    }
}
