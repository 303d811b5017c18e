//! Watches the mail drop directory and feeds each new message to a
//! [`MailHandler`] exactly once.
//!
//! Filesystem events and the startup scan only publish paths onto a channel.
//! A single dispatcher task owns the set of in-flight file names, so two
//! events for the same file can never start two runs. Names are released
//! from the set through the same channel.

use async_trait::async_trait;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use notify_debouncer_mini::{new_debouncer, DebounceEventResult, Debouncer};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

use crate::config::MaildirConfig;
use crate::notifier::NotifyError;

const MOVE_ATTEMPTS: u32 = 3;
const MOVE_BACKOFF: Duration = Duration::from_millis(200);

/// What the handler did with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailOutcome {
    Unparseable,
    /// Sender failed authentication; a rejection notice was sent.
    Rejected,
    /// Sender is over quota; a notice was sent.
    RateLimited,
    Reported { count: usize },
}

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("notification failed: {0}")]
    Notify(#[from] NotifyError),
    #[error("{0}")]
    Failed(String),
}

#[async_trait]
pub trait MailHandler: Send + Sync {
    async fn on_received(&self, raw: &[u8]) -> Result<MailOutcome, HandlerError>;
}

#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("maildir I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot watch maildir: {0}")]
    Notify(#[from] notify::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatcherEvent {
    Processed { file: String, outcome: MailOutcome },
    Failed { file: String, error: String },
    Deleted { file: String },
}

/// Where a file stands once its worker finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Disposition {
    /// Handled and gone from the drop directory.
    Done,
    /// Not handled; the next event for it may try again.
    Retry,
    /// Handled, but still in the drop directory. It must never be handed to
    /// the handler again, so its name stays in flight.
    Pinned,
}

impl Disposition {
    /// How long to wait before releasing the name, or `None` to keep it.
    pub(crate) fn release_delay(self, grace: Duration) -> Option<Duration> {
        match self {
            Disposition::Done => Some(grace),
            Disposition::Retry => Some(Duration::ZERO),
            Disposition::Pinned => None,
        }
    }
}

struct MoveFailure {
    error: std::io::Error,
    left_in_place: bool,
}

#[derive(Debug)]
pub(crate) enum Command {
    Detected(PathBuf),
    Release(String),
}

pub struct MaildirWatcher {
    watch_dirs: [PathBuf; 2],
    processed_dir: PathBuf,
    token: String,
    handler: Arc<dyn MailHandler>,
    release_grace: Duration,
    write_settle: Duration,
    retention: Duration,
    cleanup_interval: Duration,
    events: Option<UnboundedSender<WatcherEvent>>,
}

/// Keeps the filesystem watcher alive; dropping it stops everything.
pub struct WatcherHandle {
    _debouncer: Debouncer<RecommendedWatcher>,
    dispatcher: JoinHandle<()>,
    cleanup: JoinHandle<()>,
}

impl Drop for WatcherHandle {
    fn drop(&mut self) {
        self.dispatcher.abort();
        self.cleanup.abort();
    }
}

impl MaildirWatcher {
    /// `token` is the mail server name every delivered file name carries.
    pub fn new(config: &MaildirConfig, token: impl Into<String>, handler: Arc<dyn MailHandler>) -> Self {
        let base = PathBuf::from(&config.base_path);
        MaildirWatcher {
            watch_dirs: [base.join("new"), base.join("cur")],
            processed_dir: base.join(".Processed").join("cur"),
            token: token.into(),
            handler,
            release_grace: config.release_grace(),
            write_settle: config.write_settle(),
            retention: config.retention(),
            cleanup_interval: config.cleanup_interval(),
            events: None,
        }
    }

    /// Publish [`WatcherEvent`]s to `events`.
    pub fn with_events(mut self, events: UnboundedSender<WatcherEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn processed_dir(&self) -> &Path {
        &self.processed_dir
    }

    /// Maildir names look like `<time>.<unique>.<host>[:2,flags]`.
    pub fn is_mail_file(&self, name: &str) -> bool {
        name.split('.').count() >= 3 && name.contains(&self.token)
    }

    fn emit(&self, event: WatcherEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    pub async fn start(self: Arc<Self>) -> Result<WatcherHandle, WatchError> {
        self.prepare().await?;
        let (tx, rx) = unbounded_channel();

        let feed = tx.clone();
        let mut debouncer = new_debouncer(self.write_settle, move |result: DebounceEventResult| {
            match result {
                Ok(events) => {
                    for event in events {
                        let _ = feed.send(Command::Detected(event.path));
                    }
                }
                Err(e) => log::error!("Maildir watch error: {e}"),
            }
        })?;
        for dir in &self.watch_dirs {
            debouncer.watcher().watch(dir, RecursiveMode::NonRecursive)?;
        }
        log::info!(
            "Watching for new mail files in {}",
            self.watch_dirs
                .iter()
                .map(|d| d.display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        );

        self.scan_existing(&tx).await?;
        let cleanup = self.spawn_cleanup();
        let dispatcher = tokio::spawn(self.dispatch(tx, rx));

        Ok(WatcherHandle {
            _debouncer: debouncer,
            dispatcher,
            cleanup,
        })
    }

    pub(crate) async fn prepare(&self) -> Result<(), WatchError> {
        for dir in &self.watch_dirs {
            tokio::fs::create_dir_all(dir).await?;
        }
        tokio::fs::create_dir_all(&self.processed_dir).await?;
        Ok(())
    }

    /// Enqueue files that arrived while the service was down.
    pub(crate) async fn scan_existing(&self, tx: &UnboundedSender<Command>) -> Result<usize, WatchError> {
        let mut found = 0;
        for dir in &self.watch_dirs {
            let mut entries = tokio::fs::read_dir(dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                if entry.file_type().await?.is_file() {
                    let _ = tx.send(Command::Detected(entry.path()));
                    found += 1;
                }
            }
        }
        log::debug!("Initial maildir scan queued {found} files");
        Ok(found)
    }

    /// Runs until the task is aborted. `tx` feeds releases back into `rx`.
    pub(crate) async fn dispatch(
        self: Arc<Self>,
        tx: UnboundedSender<Command>,
        mut rx: UnboundedReceiver<Command>,
    ) {
        let mut in_flight: HashSet<String> = HashSet::new();

        while let Some(command) = rx.recv().await {
            match command {
                Command::Release(name) => {
                    in_flight.remove(&name);
                }
                Command::Detected(path) => {
                    let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
                        continue;
                    };
                    if !path.is_file() {
                        continue;
                    }
                    if !self.is_mail_file(&name) || in_flight.contains(&name) {
                        log::debug!("File {name} is already in flight or not a mail file");
                        continue;
                    }
                    log::info!("New mail file detected: {name}");
                    in_flight.insert(name.clone());

                    let watcher = self.clone();
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        let disposition = watcher.process(&path, &name).await;
                        match disposition.release_delay(watcher.release_grace) {
                            Some(delay) => {
                                tokio::time::sleep(delay).await;
                                let _ = tx.send(Command::Release(name));
                            }
                            None => log::error!("Mail {name} stays blocked until restart"),
                        }
                    });
                }
            }
        }
    }

    async fn process(&self, path: &Path, name: &str) -> Disposition {
        let started = std::time::Instant::now();
        let raw = match tokio::fs::read(path).await {
            Ok(raw) => raw,
            Err(e) => {
                log::warn!("Cannot read mail file {name}: {e}");
                self.emit(WatcherEvent::Failed {
                    file: name.to_string(),
                    error: e.to_string(),
                });
                return Disposition::Retry;
            }
        };

        let outcome = match self.handler.on_received(&raw).await {
            Ok(outcome) => outcome,
            Err(e) => {
                log::error!("Processing {name} failed: {e}");
                self.emit(WatcherEvent::Failed {
                    file: name.to_string(),
                    error: e.to_string(),
                });
                return Disposition::Retry;
            }
        };

        if let Err(failure) = self.move_to_processed(path, name).await {
            log::error!(
                "Could not move {name} to {}: {}",
                self.processed_dir.display(),
                failure.error
            );
            self.emit(WatcherEvent::Failed {
                file: name.to_string(),
                error: failure.error.to_string(),
            });
            return if failure.left_in_place {
                Disposition::Pinned
            } else {
                Disposition::Done
            };
        }

        log::info!("Mail {name} processed in {}ms: {outcome:?}", started.elapsed().as_millis());
        self.emit(WatcherEvent::Processed {
            file: name.to_string(),
            outcome,
        });
        Disposition::Done
    }

    /// Retries with backoff. If the file still cannot be moved it is deleted
    /// so it is not handled again, and the move error is returned.
    async fn move_to_processed(&self, path: &Path, name: &str) -> Result<(), MoveFailure> {
        let destination = self.processed_dir.join(name);
        let mut delay = MOVE_BACKOFF;
        let mut last_error = None;

        for attempt in 1..=MOVE_ATTEMPTS {
            match tokio::fs::rename(path, &destination).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    log::warn!("Move of {name} failed (attempt {attempt}/{MOVE_ATTEMPTS}): {e}");
                    last_error = Some(e);
                }
            }
            if attempt < MOVE_ATTEMPTS {
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
        }

        let left_in_place = match tokio::fs::remove_file(path).await {
            Ok(()) => false,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => {
                log::error!("Could not delete unmovable mail file {name}: {e}");
                true
            }
        };
        Err(MoveFailure {
            error: last_error.unwrap_or_else(|| std::io::Error::other("move failed")),
            left_in_place,
        })
    }

    /// Delete processed mail files older than the retention period.
    pub async fn cleanup_processed(&self) -> Result<usize, WatchError> {
        let now = SystemTime::now();
        let mut deleted = 0;
        let mut entries = tokio::fs::read_dir(&self.processed_dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !self.is_mail_file(&name) {
                continue;
            }
            let modified = entry.metadata().await?.modified()?;
            let age = now.duration_since(modified).unwrap_or_default();
            if age > self.retention {
                tokio::fs::remove_file(entry.path()).await?;
                log::debug!("Deleted processed mail {name}");
                self.emit(WatcherEvent::Deleted { file: name });
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    fn spawn_cleanup(self: &Arc<Self>) -> JoinHandle<()> {
        let watcher = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(watcher.cleanup_interval);
            loop {
                ticker.tick().await;
                match watcher.cleanup_processed().await {
                    Ok(0) => {}
                    Ok(n) => log::info!("Removed {n} processed mail files"),
                    Err(e) => log::error!("Processed mail cleanup failed: {e}"),
                }
            }
        })
    }
}
