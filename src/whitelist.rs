use parking_lot::RwLock;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// Query parameter names that turn a trusted host into an open redirect.
const REDIRECT_PARAM_MARKERS: [&str; 3] = ["redirect", "url", "return"];

/// Trusted hostnames. Reads are lock-shared; a reload swaps the whole set.
#[derive(Default)]
pub struct Whitelist {
    hosts: RwLock<HashSet<String>>,
}

impl Whitelist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_hosts<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let list = Self::new();
        list.replace(hosts.into_iter().map(|h| h.as_ref().to_lowercase()).collect());
        list
    }

    fn replace(&self, hosts: HashSet<String>) {
        *self.hosts.write() = hosts;
    }

    pub fn len(&self) -> usize {
        self.hosts.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.read().is_empty()
    }

    /// Replace the set with the non-empty, non-comment lines of `content`.
    pub fn load_from_str(&self, content: &str) -> usize {
        let hosts: HashSet<String> = content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(str::to_lowercase)
            .collect();
        let count = hosts.len();
        self.replace(hosts);
        count
    }

    pub async fn load(&self, path: &Path) -> std::io::Result<usize> {
        let content = tokio::fs::read_to_string(path).await?;
        Ok(self.load_from_str(&content))
    }

    /// True when the URL's host (or `www.` + host) is trusted and no query
    /// parameter looks like a redirect target.
    pub fn check(&self, input: &str) -> bool {
        let formatted = if input.starts_with("http") {
            input.to_string()
        } else {
            format!("http://{input}")
        };
        let parsed = match Url::parse(&formatted) {
            Ok(url) => url,
            Err(_) => return false,
        };
        let host = match parsed.host_str() {
            Some(host) => host.to_lowercase(),
            None => return false,
        };

        {
            let hosts = self.hosts.read();
            if !hosts.contains(&host) && !hosts.contains(&format!("www.{host}")) {
                return false;
            }
        }

        !parsed.query_pairs().any(|(name, _)| {
            let name = name.to_lowercase();
            REDIRECT_PARAM_MARKERS.iter().any(|m| name.contains(m))
        })
    }
}

/// Reload `path` into `list` every `every`. A failed read keeps the old set.
pub fn spawn_reload(
    list: Arc<Whitelist>,
    path: PathBuf,
    every: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            match list.load(&path).await {
                Ok(count) => log::debug!("Whitelist reloaded: {count} hosts"),
                Err(e) => log::warn!("Failed to reload whitelist {}: {e}", path.display()),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_known_host_passes() {
        let list = Whitelist::from_hosts(["paypal.com"]);
        assert!(list.check("https://paypal.com/x"));
        assert!(list.check("paypal.com"));
    }

    #[test]
    fn test_www_entry_covers_bare_host() {
        let list = Whitelist::from_hosts(["www.paypal.com"]);
        assert!(list.check("https://paypal.com/x"));
    }

    #[test]
    fn test_redirect_params_fail() {
        let list = Whitelist::from_hosts(["paypal.com"]);
        assert!(!list.check("https://paypal.com/x?redirect=evil"));
        assert!(!list.check("https://paypal.com/x?ReturnTo=evil"));
        assert!(!list.check("https://paypal.com/x?target_URL=evil"));
        assert!(list.check("https://paypal.com/x?lang=de"));
    }

    #[test]
    fn test_listed_host_with_and_without_redirect() {
        let list = Whitelist::from_hosts(["example.com"]);
        assert!(list.check("https://example.com/x?ref=1"));
        assert!(!list.check("https://example.com/?redirect=http://evil.com"));
        assert!(!list.check("https://notlisted.com"));
    }

    #[test]
    fn test_unknown_or_garbage_fails() {
        let list = Whitelist::from_hosts(["paypal.com"]);
        assert!(!list.check("https://paypal.com.evil.example/"));
        assert!(!list.check("http://"));
    }

    #[tokio::test]
    async fn test_load_skips_comments_and_replaces() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# trusted\nExample.org\n\n  bank.example  \n#old.example").unwrap();

        let list = Whitelist::from_hosts(["stale.example"]);
        let count = list.load(file.path()).await.unwrap();
        assert_eq!(count, 2);
        assert!(list.check("https://example.org"));
        assert!(list.check("https://bank.example/login"));
        assert!(!list.check("https://stale.example"));
        assert!(!list.check("https://old.example"));
    }
}
