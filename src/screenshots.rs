use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::Mutex;

const LEDGER_FILE: &str = "screenshots.json";

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("screenshot ledger I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("screenshot ledger is corrupt: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScreenshotEntry {
    pub path: PathBuf,
    pub expires_at: DateTime<Utc>,
}

/// Tracks screenshot files and their expiry. The list is persisted as JSON
/// next to the screenshots so restarts keep reclaiming space.
pub struct ScreenshotLedger {
    dir: PathBuf,
    ledger_path: PathBuf,
    retention: ChronoDuration,
    entries: Mutex<Vec<ScreenshotEntry>>,
}

impl ScreenshotLedger {
    pub async fn open(dir: impl Into<PathBuf>, retention_days: i64) -> Result<Self, LedgerError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        let ledger_path = dir.join(LEDGER_FILE);

        let entries = match tokio::fs::read(&ledger_path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        Ok(ScreenshotLedger {
            dir,
            ledger_path,
            retention: ChronoDuration::days(retention_days),
            entries: Mutex::new(entries),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// A fresh screenshot id and its `<id>.png` location.
    pub fn allocate(&self) -> (String, PathBuf) {
        let id = uuid::Uuid::new_v4().to_string();
        let path = self.dir.join(format!("{id}.png"));
        (id, path)
    }

    pub async fn entries(&self) -> Vec<ScreenshotEntry> {
        self.entries.lock().await.clone()
    }

    async fn persist(&self, entries: &[ScreenshotEntry]) -> Result<(), LedgerError> {
        let json = serde_json::to_vec_pretty(entries)?;
        let tmp = self.ledger_path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.ledger_path).await?;
        Ok(())
    }

    /// Track `path` until now + retention.
    pub async fn add(&self, path: impl Into<PathBuf>) -> Result<(), LedgerError> {
        self.add_until(path, Utc::now() + self.retention).await
    }

    pub async fn add_until(
        &self,
        path: impl Into<PathBuf>,
        expires_at: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        let mut entries = self.entries.lock().await;
        entries.push(ScreenshotEntry {
            path: path.into(),
            expires_at,
        });
        self.persist(&entries).await
    }

    /// Keep the ledger locked for `duration`, stalling every write.
    #[cfg(test)]
    pub(crate) async fn stall_for(&self, duration: std::time::Duration) {
        let _entries = self.entries.lock().await;
        tokio::time::sleep(duration).await;
    }

    /// Delete expired files and drop their entries. Returns how many expired.
    pub async fn sweep_expired(&self) -> Result<usize, LedgerError> {
        let now = Utc::now();
        let mut entries = self.entries.lock().await;
        let (expired, live): (Vec<_>, Vec<_>) =
            entries.drain(..).partition(|e| e.expires_at <= now);

        for entry in &expired {
            match tokio::fs::remove_file(&entry.path).await {
                Ok(()) => log::debug!("Deleted expired screenshot {}", entry.path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => log::warn!("Failed to delete {}: {e}", entry.path.display()),
            }
        }

        *entries = live;
        if !expired.is_empty() {
            self.persist(&entries).await?;
        }
        Ok(expired.len())
    }

    /// Adopt untracked files in `dir`. Expiry counts from the file's creation
    /// time (modification time where the filesystem has no birth time);
    /// files already past it are deleted on the spot.
    pub async fn bulk_import(&self, dir: &Path) -> Result<usize, LedgerError> {
        let now = Utc::now();
        let mut entries = self.entries.lock().await;
        let mut adopted = 0;
        let mut reader = tokio::fs::read_dir(dir).await?;

        while let Some(item) = reader.next_entry().await? {
            let path = item.path();
            let is_ledger = path
                .file_name()
                .is_some_and(|n| n.to_string_lossy().starts_with(LEDGER_FILE));
            if is_ledger || entries.iter().any(|e| e.path == path) {
                continue;
            }
            let metadata = item.metadata().await?;
            if !metadata.is_file() {
                continue;
            }

            let born: SystemTime = metadata.created().or_else(|_| metadata.modified())?;
            let expires_at = DateTime::<Utc>::from(born) + self.retention;
            if expires_at <= now {
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    log::warn!("Failed to delete stale screenshot {}: {e}", path.display());
                }
                continue;
            }
            entries.push(ScreenshotEntry { path, expires_at });
            adopted += 1;
        }

        if adopted > 0 {
            self.persist(&entries).await?;
        }
        Ok(adopted)
    }
}

pub fn spawn_sweeper(ledger: Arc<ScreenshotLedger>, every: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            match ledger.sweep_expired().await {
                Ok(0) => {}
                Ok(n) => log::info!("Removed {n} expired screenshots"),
                Err(e) => log::error!("Screenshot sweep failed: {e}"),
            }
        }
    })
}
