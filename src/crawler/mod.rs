//! Concurrency-bounded page crawler. The crawl algorithm drives a
//! [`BrowserEngine`]; [`chromium::ChromiumEngine`] is the production engine.

pub mod chromium;

use async_trait::async_trait;
use lazy_static::lazy_static;
use parking_lot::Mutex;
use regex::Regex;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use url::Url;

use crate::cache::CacheStore;
use crate::config::CrawlerConfig;
use crate::screenshots::ScreenshotLedger;

lazy_static! {
    static ref SCRIPT_URL: Regex =
        Regex::new(r#"https?://(?:[a-zA-Z0-9-]+\.)+[a-zA-Z]{2,}(?:/[^\s'"]*)?"#).unwrap();
    static ref ANCHOR: Selector = Selector::parse("a[href]").unwrap();
    static ref SCRIPT: Selector = Selector::parse("script").unwrap();
    static ref META_DESCRIPTION: Selector = Selector::parse(r#"meta[name="description"]"#).unwrap();
}

/// Button labels that identify a cookie-consent overlay.
pub const CONSENT_KEYWORDS: [&str; 9] = [
    "akzeptieren",
    "accept",
    "zustimmen",
    "erlauben",
    "allow",
    "agree",
    "verstanden",
    "got it",
    "allow all cookies",
];

const CONSENT_SETTLE: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum CrawlError {
    #[error("browser error: {0}")]
    Browser(String),
    #[error("navigation failed: {0}")]
    Navigation(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("crawler slots closed")]
    Closed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrawlResult {
    /// Same-document navigations, then the request chain, then the final URL.
    pub redirects: Vec<String>,
    /// Absolute http(s) URLs linked or referenced from the final page.
    pub found_urls: Vec<String>,
    pub meta_description: Option<String>,
    pub screenshot_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Navigation {
    /// URLs that answered with a redirect, in order.
    pub chain: Vec<String>,
    pub final_url: String,
}

/// One open browser tab.
#[async_trait]
pub trait PageSession: Send {
    async fn navigate(&mut self, url: &str, timeout: Duration) -> Result<Navigation, CrawlError>;
    /// URLs reached by history/fragment navigation since the page opened.
    fn same_document_navigations(&self) -> Vec<String>;
    /// Wait until network activity settles, but no longer than `max`.
    async fn wait_for_idle(&mut self, max: Duration);
    async fn button_labels(&mut self) -> Result<Vec<String>, CrawlError>;
    async fn click_button(&mut self, index: usize) -> Result<(), CrawlError>;
    async fn screenshot(&mut self, path: &Path) -> Result<(), CrawlError>;
    async fn content(&mut self) -> Result<String, CrawlError>;
    async fn close(self: Box<Self>);
}

#[async_trait]
pub trait BrowserEngine: Send + Sync {
    /// Open a blank page, starting the browser first if needed.
    async fn open_page(&self) -> Result<Box<dyn PageSession>, CrawlError>;
    async fn shutdown(&self);
    fn is_running(&self) -> bool;
}

struct SlotState {
    in_use: usize,
    idle_since: Option<Instant>,
}

/// Counting semaphore over crawl slots that also remembers since when every
/// slot has been free. Waiters are served in FIFO order.
pub struct CrawlSlots {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    state: Arc<Mutex<SlotState>>,
}

/// A held crawl slot; released on drop.
pub struct SlotGuard {
    _permit: OwnedSemaphorePermit,
    state: Arc<Mutex<SlotState>>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        state.in_use -= 1;
        if state.in_use == 0 {
            state.idle_since = Some(Instant::now());
        }
    }
}

impl CrawlSlots {
    pub fn new(capacity: usize) -> Self {
        CrawlSlots {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            state: Arc::new(Mutex::new(SlotState {
                in_use: 0,
                idle_since: Some(Instant::now()),
            })),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn remaining(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub async fn acquire(&self) -> Result<SlotGuard, CrawlError> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| CrawlError::Closed)?;
        let mut state = self.state.lock();
        state.in_use += 1;
        state.idle_since = None;
        log::debug!("Crawl slot acquired, {} remaining", self.remaining());
        Ok(SlotGuard {
            _permit: permit,
            state: self.state.clone(),
        })
    }

    /// True when no slot is held and none has been for at least `duration`.
    pub fn is_unused_for(&self, duration: Duration) -> bool {
        let state = self.state.lock();
        state.in_use == 0 && state.idle_since.is_some_and(|since| since.elapsed() >= duration)
    }

    /// Take every slot at once if all are free right now.
    fn try_acquire_all(&self) -> Option<OwnedSemaphorePermit> {
        self.semaphore
            .clone()
            .try_acquire_many_owned(self.capacity as u32)
            .ok()
    }
}

#[derive(Debug, Clone)]
pub struct CrawlSettings {
    pub navigation_timeout: Duration,
    pub idle_wait: Duration,
    pub screenshot_timeout: Duration,
    /// Deadline for every other browser call (open, read, click, close).
    pub operation_timeout: Duration,
}

impl From<&CrawlerConfig> for CrawlSettings {
    fn from(config: &CrawlerConfig) -> Self {
        CrawlSettings {
            navigation_timeout: Duration::from_secs(config.navigation_timeout_seconds),
            idle_wait: Duration::from_millis(config.idle_wait_ms),
            screenshot_timeout: Duration::from_millis(config.screenshot_timeout_ms),
            operation_timeout: Duration::from_millis(config.operation_timeout_ms),
        }
    }
}

pub struct Crawler {
    engine: Arc<dyn BrowserEngine>,
    slots: Arc<CrawlSlots>,
    cache: Arc<dyn CacheStore<CrawlResult>>,
    screenshots: Option<Arc<ScreenshotLedger>>,
    settings: CrawlSettings,
}

impl Crawler {
    pub fn new(
        engine: Arc<dyn BrowserEngine>,
        slots: Arc<CrawlSlots>,
        cache: Arc<dyn CacheStore<CrawlResult>>,
        screenshots: Option<Arc<ScreenshotLedger>>,
        settings: CrawlSettings,
    ) -> Self {
        Crawler {
            engine,
            slots,
            cache,
            screenshots,
            settings,
        }
    }

    pub fn slots(&self) -> &CrawlSlots {
        &self.slots
    }

    /// Visit `url` and report what it leads to. Never fails: a page that
    /// cannot be loaded yields an empty result. Completed visits are cached.
    pub async fn crawl(&self, url: &str) -> CrawlResult {
        if let Some(cached) = self.cache.get(url) {
            log::debug!("Crawl cache hit for {url}");
            return cached;
        }

        let _slot = match self.slots.acquire().await {
            Ok(slot) => slot,
            Err(e) => {
                log::error!("Cannot crawl {url}: {e}");
                return CrawlResult::default();
            }
        };

        let mut page = match bounded(self.settings.operation_timeout, self.engine.open_page()).await {
            Ok(page) => page,
            Err(e) => {
                log::error!("Failed to open page for {url}: {e}");
                return CrawlResult::default();
            }
        };

        log::info!("Visiting {url}");
        let visit = self.visit(page.as_mut(), url).await;
        if tokio::time::timeout(self.settings.operation_timeout, page.close())
            .await
            .is_err()
        {
            log::warn!("Closing page for {url} timed out");
        }

        match visit {
            Some(result) => {
                self.cache.insert(url, result.clone());
                result
            }
            None => CrawlResult::default(),
        }
    }

    /// `None` when navigation itself failed. Every later step that fails or
    /// times out leaves its part of the result empty.
    async fn visit(&self, page: &mut dyn PageSession, url: &str) -> Option<CrawlResult> {
        let limit = self.settings.navigation_timeout;
        let navigation = match bounded(limit, page.navigate(url, limit)).await {
            Ok(navigation) => navigation,
            Err(e) => {
                log::warn!("Error visiting {url}: {e}");
                return None;
            }
        };

        self.settle(page, self.settings.idle_wait).await;

        let mut result = CrawlResult::default();
        result.redirects = page.same_document_navigations();
        result.redirects.extend(navigation.chain);
        result.redirects.push(navigation.final_url.clone());

        self.dismiss_consent(page).await;
        result.screenshot_id = self.capture(page).await;

        match bounded(self.settings.operation_timeout, page.content()).await {
            Ok(html) => {
                let base = Url::parse(&navigation.final_url).ok();
                let (found, meta) = extract_page(&html, base.as_ref());
                result.found_urls = found;
                result.meta_description = meta;
            }
            Err(e) => log::warn!("Failed to read content of {url}: {e}"),
        }

        Some(result)
    }

    async fn dismiss_consent(&self, page: &mut dyn PageSession) {
        let labels = match bounded(self.settings.operation_timeout, page.button_labels()).await {
            Ok(labels) => labels,
            Err(e) => {
                log::debug!("Could not list buttons: {e}");
                return;
            }
        };
        let hit = labels.iter().position(|label| {
            let label = label.to_lowercase();
            CONSENT_KEYWORDS.iter().any(|k| label.contains(k))
        });
        if let Some(index) = hit {
            log::debug!("Clicking consent button '{}'", labels[index].trim());
            if let Err(e) = bounded(self.settings.operation_timeout, page.click_button(index)).await {
                log::debug!("Consent click failed: {e}");
                return;
            }
            self.settle(page, CONSENT_SETTLE).await;
        }
    }

    async fn settle(&self, page: &mut dyn PageSession, max: Duration) {
        if tokio::time::timeout(max, page.wait_for_idle(max)).await.is_err() {
            log::debug!("Page still busy after {max:?}");
        }
    }

    /// Take the screenshot and record it in the ledger, both inside the
    /// screenshot deadline. An untracked file left behind by a timeout is
    /// adopted by the next bulk import.
    async fn capture(&self, page: &mut dyn PageSession) -> Option<String> {
        let ledger = self.screenshots.as_ref()?;
        let (id, path) = ledger.allocate();
        let shot = async {
            page.screenshot(&path).await?;
            ledger
                .add(&path)
                .await
                .map_err(|e| CrawlError::Browser(format!("cannot record screenshot {id}: {e}")))
        };
        match bounded(self.settings.screenshot_timeout, shot).await {
            Ok(()) => Some(id),
            Err(e) => {
                log::warn!("Screenshot skipped: {e}");
                None
            }
        }
    }

    /// Close the browser once every slot has been free for `idle_for`. All
    /// slots are held while it shuts down so no crawl starts against it.
    pub fn spawn_idle_monitor(
        self: &Arc<Self>,
        check_every: Duration,
        idle_for: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let crawler = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(check_every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                crawler.shutdown_if_idle(idle_for).await;
            }
        })
    }

    pub async fn shutdown(&self) {
        self.engine.shutdown().await;
    }

    pub async fn shutdown_if_idle(&self, idle_for: Duration) -> bool {
        if !self.engine.is_running() || !self.slots.is_unused_for(idle_for) {
            return false;
        }
        let Some(_all) = self.slots.try_acquire_all() else {
            return false;
        };
        log::info!("Closing browser after {idle_for:?} without crawls");
        self.engine.shutdown().await;
        true
    }
}

async fn bounded<T>(
    limit: Duration,
    op: impl Future<Output = Result<T, CrawlError>>,
) -> Result<T, CrawlError> {
    tokio::time::timeout(limit, op)
        .await
        .unwrap_or(Err(CrawlError::Timeout(limit)))
}

/// Outbound http(s) URLs from anchors (resolved against `base`) and inline
/// scripts, in document order without duplicates, plus the meta description.
pub fn extract_page(html: &str, base: Option<&Url>) -> (Vec<String>, Option<String>) {
    let document = Html::parse_document(html);
    let mut seen = HashSet::new();
    let mut found = Vec::new();

    for anchor in document.select(&ANCHOR) {
        let Some(href) = anchor.value().attr("href") else {
            continue;
        };
        let resolved = match base {
            Some(base) => base.join(href.trim()).ok(),
            None => Url::parse(href.trim()).ok(),
        };
        if let Some(url) = resolved {
            if matches!(url.scheme(), "http" | "https") && seen.insert(url.to_string()) {
                found.push(url.to_string());
            }
        }
    }

    for script in document.select(&SCRIPT) {
        let code: String = script.text().collect();
        for m in SCRIPT_URL.find_iter(&code) {
            if seen.insert(m.as_str().to_string()) {
                found.push(m.as_str().to_string());
            }
        }
    }

    let meta = document
        .select(&META_DESCRIPTION)
        .next()
        .and_then(|m| m.value().attr("content"))
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty());

    (found, meta)
}


#[cfg(test)]
mod tests {
    use super::testing::{FakeEngine, FakeSite};
    use super::*;
    use crate::cache::TtlCache;
    use std::sync::atomic::Ordering;

    fn settings() -> CrawlSettings {
        CrawlSettings {
            navigation_timeout: Duration::from_secs(10),
            idle_wait: Duration::from_millis(10),
            screenshot_timeout: Duration::from_millis(200),
            operation_timeout: Duration::from_millis(200),
        }
    }

    fn crawler(engine: Arc<FakeEngine>, capacity: usize, ledger: Option<Arc<ScreenshotLedger>>) -> Crawler {
        Crawler::new(
            engine,
            Arc::new(CrawlSlots::new(capacity)),
            Arc::new(TtlCache::new(Duration::from_secs(3600))),
            ledger,
            settings(),
        )
    }

    #[tokio::test]
    async fn test_third_acquire_waits_for_release() {
        let slots = Arc::new(CrawlSlots::new(2));
        let first = slots.acquire().await.unwrap();
        let _second = slots.acquire().await.unwrap();
        assert_eq!(slots.remaining(), 0);

        let waiter = {
            let slots = slots.clone();
            tokio::spawn(async move { slots.acquire().await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(first);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_idle_tracking() {
        let slots = CrawlSlots::new(2);
        let guard = slots.acquire().await.unwrap();
        assert!(!slots.is_unused_for(Duration::ZERO));
        drop(guard);
        assert!(slots.is_unused_for(Duration::ZERO));
        assert!(!slots.is_unused_for(Duration::from_secs(60)));
    }

    #[tokio::test]
    async fn test_failed_navigation_gives_empty_result_and_closes_page() {
        let engine = Arc::new(FakeEngine::default());
        let crawler = crawler(engine.clone(), 2, None);
        let result = crawler.crawl("https://unreachable.example/").await;
        assert!(result.redirects.is_empty());
        assert!(result.found_urls.is_empty());
        assert_eq!(engine.closed.load(Ordering::SeqCst), 1);
        assert_eq!(crawler.slots().remaining(), 2);
    }

    #[tokio::test]
    async fn test_redirect_order_and_extraction() {
        let html = r#"<html><head><meta name="description" content=" Login portal "></head>
            <body><a href="/account">acc</a><a href="mailto:x@y.example">m</a>
            <a href="https://cdn.example/a.js">js</a>
            <script>fetch("https://tracker.example/p?x=1")</script></body></html>"#;
        let site = FakeSite {
            navigation: Some(Navigation {
                chain: vec!["https://short.example/x".to_string()],
                final_url: "https://landing.example/home".to_string(),
            }),
            same_document: vec!["https://landing.example/home#step2".to_string()],
            buttons: vec!["Settings".to_string(), "Accept all".to_string()],
            html: html.to_string(),
            ..Default::default()
        };
        let engine = Arc::new(FakeEngine::default().with_site("https://short.example/x", site));
        let dir = tempfile::tempdir().unwrap();
        let ledger = Arc::new(ScreenshotLedger::open(dir.path(), 15).await.unwrap());
        let crawler = crawler(engine.clone(), 2, Some(ledger.clone()));

        let result = crawler.crawl("https://short.example/x").await;
        assert_eq!(
            result.redirects,
            vec![
                "https://landing.example/home#step2",
                "https://short.example/x",
                "https://landing.example/home",
            ]
        );
        assert_eq!(
            result.found_urls,
            vec![
                "https://landing.example/account",
                "https://cdn.example/a.js",
                "https://tracker.example/p?x=1",
            ]
        );
        assert!(result.found_urls.iter().all(|u| u.starts_with("http")));
        assert_eq!(result.meta_description.as_deref(), Some("Login portal"));
        assert_eq!(engine.clicks.lock().as_slice(), ["Accept all"]);
        let id = result.screenshot_id.unwrap();
        assert!(dir.path().join(format!("{id}.png")).exists());
        assert_eq!(ledger.entries().await.len(), 1);
    }

    #[tokio::test]
    async fn test_plain_page_has_empty_redirect_prefix() {
        let site = FakeSite {
            html: "<html><body>nothing</body></html>".to_string(),
            ..Default::default()
        };
        let engine = Arc::new(FakeEngine::default().with_site("https://plain.example/", site));
        let crawler = crawler(engine, 1, None);
        let result = crawler.crawl("https://plain.example/").await;
        assert_eq!(result.redirects, vec!["https://plain.example/"]);
        assert!(result.found_urls.is_empty());
        assert!(result.screenshot_id.is_none());
    }

    #[tokio::test]
    async fn test_slow_screenshot_is_skipped() {
        let site = FakeSite {
            html: "<html></html>".to_string(),
            screenshot_delay: Some(Duration::from_secs(5)),
            ..Default::default()
        };
        let engine = Arc::new(FakeEngine::default().with_site("https://slow.example/", site));
        let dir = tempfile::tempdir().unwrap();
        let ledger = Arc::new(ScreenshotLedger::open(dir.path(), 15).await.unwrap());
        let crawler = crawler(engine, 1, Some(ledger.clone()));
        let result = crawler.crawl("https://slow.example/").await;
        assert!(result.screenshot_id.is_none());
        assert_eq!(result.redirects.len(), 1);
        assert!(ledger.entries().await.is_empty());
    }

    #[tokio::test]
    async fn test_stalled_ledger_write_counts_against_screenshot_deadline() {
        let site = FakeSite {
            html: "<html></html>".to_string(),
            ..Default::default()
        };
        let engine = Arc::new(FakeEngine::default().with_site("https://busy.example/", site));
        let dir = tempfile::tempdir().unwrap();
        let ledger = Arc::new(ScreenshotLedger::open(dir.path(), 15).await.unwrap());
        let crawler = crawler(engine, 1, Some(ledger.clone()));

        let stall = {
            let ledger = ledger.clone();
            tokio::spawn(async move { ledger.stall_for(Duration::from_secs(3)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let started = Instant::now();
        let result = crawler.crawl("https://busy.example/").await;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(result.screenshot_id.is_none());
        assert_eq!(result.redirects, vec!["https://busy.example/"]);
        stall.abort();
    }

    #[tokio::test]
    async fn test_hung_page_reads_give_partial_result_and_free_the_slot() {
        let site = FakeSite {
            buttons: vec!["Accept".to_string()],
            hang_reads: true,
            ..Default::default()
        };
        let engine = Arc::new(
            FakeEngine::default()
                .with_site("https://a.example/", site)
                .with_site("https://b.example/", FakeSite::default()),
        );
        let crawler = crawler(engine.clone(), 1, None);

        let result = tokio::time::timeout(Duration::from_secs(5), crawler.crawl("https://a.example/"))
            .await
            .unwrap();
        assert_eq!(result.redirects, vec!["https://a.example/"]);
        assert!(result.found_urls.is_empty());
        assert!(engine.clicks.lock().is_empty());
        assert_eq!(engine.closed.load(Ordering::SeqCst), 1);

        // The only slot is free again for the next crawl.
        let next = tokio::time::timeout(Duration::from_secs(5), crawler.crawl("https://b.example/"))
            .await
            .unwrap();
        assert_eq!(next.redirects, vec!["https://b.example/"]);
        assert_eq!(crawler.slots().remaining(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_pages_never_exceed_capacity() {
        let mut engine = FakeEngine::default();
        for i in 0..6 {
            engine = engine.with_site(
                &format!("https://s{i}.example/"),
                FakeSite {
                    visit_delay: Some(Duration::from_millis(30)),
                    ..Default::default()
                },
            );
        }
        let engine = Arc::new(engine);
        let crawler = Arc::new(crawler(engine.clone(), 2, None));
        let tasks: Vec<_> = (0..6)
            .map(|i| {
                let crawler = crawler.clone();
                tokio::spawn(async move { crawler.crawl(&format!("https://s{i}.example/")).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(engine.opened.load(Ordering::SeqCst), 6);
        assert!(engine.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_second_crawl_is_served_from_cache() {
        let site = FakeSite::default();
        let engine = Arc::new(FakeEngine::default().with_site("https://once.example/", site));
        let crawler = crawler(engine.clone(), 1, None);
        crawler.crawl("https://once.example/").await;
        crawler.crawl("https://once.example/").await;
        assert_eq!(engine.opened.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_idle_shutdown_only_when_unused() {
        let engine = Arc::new(FakeEngine::default().with_site("https://a.example/", FakeSite::default()));
        let crawler = crawler(engine.clone(), 2, None);
        assert!(!crawler.shutdown_if_idle(Duration::ZERO).await);

        crawler.crawl("https://a.example/").await;
        let held = crawler.slots().acquire().await.unwrap();
        assert!(!crawler.shutdown_if_idle(Duration::ZERO).await);
        drop(held);

        assert!(crawler.shutdown_if_idle(Duration::ZERO).await);
        assert_eq!(engine.shutdowns.load(Ordering::SeqCst), 1);
        assert!(!engine.is_running());
        assert_eq!(crawler.slots().remaining(), 2);
    }
}
