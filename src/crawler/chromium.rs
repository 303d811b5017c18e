use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::network::{EventRequestWillBeSent, ResourceType};
use chromiumoxide::cdp::browser_protocol::page::EventNavigatedWithinDocument;
use chromiumoxide::element::Element;
use chromiumoxide::page::{Page, ScreenshotParams};
use futures::StreamExt;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

use super::{BrowserEngine, CrawlError, Navigation, PageSession};
use crate::config::CrawlerConfig;

/// Network silence that counts as idle.
const QUIET_PERIOD: Duration = Duration::from_millis(500);
const IDLE_POLL: Duration = Duration::from_millis(100);

struct RunningBrowser {
    browser: Browser,
    handler: JoinHandle<()>,
}

/// One shared headless Chromium, launched on first use and closed by
/// [`BrowserEngine::shutdown`].
pub struct ChromiumEngine {
    executable: Option<PathBuf>,
    window: (u32, u32),
    state: tokio::sync::Mutex<Option<RunningBrowser>>,
    running: AtomicBool,
}

impl ChromiumEngine {
    pub fn new(config: &CrawlerConfig) -> Self {
        ChromiumEngine {
            executable: config.chrome_executable.as_ref().map(PathBuf::from),
            window: (config.window_width, config.window_height),
            state: tokio::sync::Mutex::new(None),
            running: AtomicBool::new(false),
        }
    }

    async fn launch(&self) -> Result<RunningBrowser, CrawlError> {
        let mut builder = BrowserConfig::builder()
            .window_size(self.window.0, self.window.1)
            .no_sandbox()
            .arg("--disable-dev-shm-usage")
            .arg("--disable-gpu");
        if let Some(path) = &self.executable {
            builder = builder.chrome_executable(path);
        }
        let config = builder.build().map_err(CrawlError::Browser)?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| CrawlError::Browser(e.to_string()))?;
        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    log::debug!("Browser handler: {e}");
                }
            }
        });

        log::info!("Launched headless browser");
        Ok(RunningBrowser { browser, handler })
    }
}

#[async_trait]
impl BrowserEngine for ChromiumEngine {
    async fn open_page(&self) -> Result<Box<dyn PageSession>, CrawlError> {
        let mut state = self.state.lock().await;
        if state.is_none() {
            *state = Some(self.launch().await?);
            self.running.store(true, Ordering::SeqCst);
        }
        let Some(running) = state.as_ref() else {
            return Err(CrawlError::Closed);
        };
        let page = running
            .browser
            .new_page("about:blank")
            .await
            .map_err(|e| CrawlError::Browser(e.to_string()))?;
        ChromiumPage::attach(page).await.map(|p| Box::new(p) as Box<dyn PageSession>)
    }

    async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        if let Some(mut running) = state.take() {
            if let Err(e) = running.browser.close().await {
                log::warn!("Browser did not close cleanly: {e}");
            }
            if let Err(e) = running.browser.wait().await {
                log::warn!("Failed to reap browser process: {e}");
            }
            running.handler.abort();
            log::info!("Browser closed");
        }
        self.running.store(false, Ordering::SeqCst);
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct Traffic {
    /// Request id of the first top-level document request and its URLs,
    /// one per redirect hop.
    document: Option<(String, Vec<String>)>,
    same_document: Vec<String>,
    last_request: Option<Instant>,
}

struct ChromiumPage {
    page: Page,
    traffic: Arc<Mutex<Traffic>>,
    listeners: Vec<JoinHandle<()>>,
    buttons: Vec<Element>,
}

impl ChromiumPage {
    async fn attach(page: Page) -> Result<Self, CrawlError> {
        let traffic = Arc::new(Mutex::new(Traffic::default()));
        let browser_err = |e: chromiumoxide::error::CdpError| CrawlError::Browser(e.to_string());

        let mut requests = page
            .event_listener::<EventRequestWillBeSent>()
            .await
            .map_err(browser_err)?;
        let mut in_document = page
            .event_listener::<EventNavigatedWithinDocument>()
            .await
            .map_err(browser_err)?;

        let requests_task = {
            let traffic = traffic.clone();
            tokio::spawn(async move {
                while let Some(event) = requests.next().await {
                    let mut traffic = traffic.lock();
                    traffic.last_request = Some(Instant::now());
                    if event.r#type != Some(ResourceType::Document) {
                        continue;
                    }
                    let id = event.request_id.inner().clone();
                    match &mut traffic.document {
                        None => traffic.document = Some((id, vec![event.request.url.clone()])),
                        Some((first, urls)) if *first == id => urls.push(event.request.url.clone()),
                        Some(_) => {}
                    }
                }
            })
        };
        let in_document_task = {
            let traffic = traffic.clone();
            tokio::spawn(async move {
                while let Some(event) = in_document.next().await {
                    traffic.lock().same_document.push(event.url.clone());
                }
            })
        };

        Ok(ChromiumPage {
            page,
            traffic,
            listeners: vec![requests_task, in_document_task],
            buttons: Vec::new(),
        })
    }
}

#[async_trait]
impl PageSession for ChromiumPage {
    async fn navigate(&mut self, url: &str, timeout: Duration) -> Result<Navigation, CrawlError> {
        match tokio::time::timeout(timeout, self.page.goto(url)).await {
            Err(_) => return Err(CrawlError::Timeout(timeout)),
            Ok(Err(e)) => return Err(CrawlError::Navigation(e.to_string())),
            Ok(Ok(_)) => {}
        }

        let final_url = self
            .page
            .url()
            .await
            .map_err(|e| CrawlError::Browser(e.to_string()))?
            .unwrap_or_else(|| url.to_string());

        let mut chain = self
            .traffic
            .lock()
            .document
            .as_ref()
            .map(|(_, urls)| urls.clone())
            .unwrap_or_default();
        // The last hop is the document that actually loaded.
        chain.pop();

        Ok(Navigation { chain, final_url })
    }

    fn same_document_navigations(&self) -> Vec<String> {
        self.traffic.lock().same_document.clone()
    }

    async fn wait_for_idle(&mut self, max: Duration) {
        let deadline = Instant::now() + max;
        while Instant::now() < deadline {
            let quiet = self
                .traffic
                .lock()
                .last_request
                .map_or(true, |at| at.elapsed() >= QUIET_PERIOD);
            if quiet {
                return;
            }
            tokio::time::sleep(IDLE_POLL).await;
        }
    }

    async fn button_labels(&mut self) -> Result<Vec<String>, CrawlError> {
        self.buttons = self
            .page
            .find_elements("button")
            .await
            .map_err(|e| CrawlError::Browser(e.to_string()))?;
        let mut labels = Vec::with_capacity(self.buttons.len());
        for button in &self.buttons {
            let text = button.inner_text().await.ok().flatten().unwrap_or_default();
            labels.push(text);
        }
        Ok(labels)
    }

    async fn click_button(&mut self, index: usize) -> Result<(), CrawlError> {
        let button = self
            .buttons
            .get(index)
            .ok_or_else(|| CrawlError::Browser(format!("no button at index {index}")))?;
        button
            .click()
            .await
            .map_err(|e| CrawlError::Browser(e.to_string()))?;
        Ok(())
    }

    async fn screenshot(&mut self, path: &Path) -> Result<(), CrawlError> {
        self.page
            .save_screenshot(ScreenshotParams::builder().build(), path)
            .await
            .map_err(|e| CrawlError::Browser(e.to_string()))?;
        Ok(())
    }

    async fn content(&mut self) -> Result<String, CrawlError> {
        self.page
            .content()
            .await
            .map_err(|e| CrawlError::Browser(e.to_string()))
    }

    async fn close(self: Box<Self>) {
        let ChromiumPage {
            page,
            listeners,
            buttons,
            ..
        } = *self;
        drop(buttons);
        for listener in listeners {
            listener.abort();
        }
        if let Err(e) = page.close().await {
            log::debug!("Failed to close page: {e}");
        }
    }
}
