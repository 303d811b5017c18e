use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Hostname of the local relay. Used as the SPF "mta" identity, to drop
    /// local hops from Received chains, and as the filename token that marks
    /// mail files in the drop directory.
    pub mail_server: String,
    pub maildir: MaildirConfig,
    pub crawler: CrawlerConfig,
    pub whitelist: WhitelistConfig,
    pub threats: ThreatConfig,
    pub rate_limit: RateLimitConfig,
    pub upload: UploadConfig,
    pub classifier: ClassifierConfig,
    pub malware: MalwareConfig,
    pub notifier: NotifierConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MaildirConfig {
    pub base_path: String,
    pub cleanup_interval_seconds: u64,
    pub retention_seconds: u64,
    /// Delay before a processed filename may be accepted again.
    pub release_grace_ms: u64,
    /// Quiet period before a freshly written file is considered complete.
    pub write_settle_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlerConfig {
    pub max_concurrency: usize,
    pub navigation_timeout_seconds: u64,
    pub idle_wait_ms: u64,
    pub screenshot_timeout_ms: u64,
    /// Deadline for page reads, clicks and opening or closing a tab.
    pub operation_timeout_ms: u64,
    pub idle_check_seconds: u64,
    pub idle_shutdown_seconds: u64,
    pub result_ttl_seconds: u64,
    pub chrome_executable: Option<String>,
    pub window_width: u32,
    pub window_height: u32,
    pub screenshot_dir: String,
    pub screenshot_retention_days: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WhitelistConfig {
    pub path: Option<String>,
    pub reload_interval_seconds: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DnsProvider {
    System,
    Cloudflare,
    Google,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreatConfig {
    pub safe_browsing_api_key: Option<String>,
    pub domain_blacklists: Vec<String>,
    pub ip_blacklists: Vec<String>,
    pub cache_ttl_seconds: u64,
    /// Fixed pause before each reputation lookup. Zero disables it.
    pub lookup_delay_ms: u64,
    pub dns_provider: DnsProvider,
    pub dns_timeout_seconds: u64,
    pub http_timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub daily_limit: u32,
    pub window_seconds: u64,
    /// Sender addresses exempt from the quota. Hashed at startup.
    pub whitelist: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    pub daily_limit: u32,
    pub max_size_bytes: u64,
    pub report_cache_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub temperature: f32,
    pub timeout_seconds: u64,
    /// Directory holding `prompt_eml.txt` / `prompt_no_eml.txt` overrides.
    pub prompts_dir: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MalwareConfig {
    /// clamd TCP endpoint, e.g. `127.0.0.1:3310`. Scanning is disabled when unset.
    pub clamd_address: Option<String>,
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotifierKind {
    Log,
    Sendmail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifierConfig {
    pub kind: NotifierKind,
    pub sendmail_path: String,
    pub from_address: String,
    /// Base URL used to link explanation terms in outgoing reports.
    pub site_url: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            mail_server: "mail.mailcheck.local".to_string(),
            maildir: MaildirConfig::default(),
            crawler: CrawlerConfig::default(),
            whitelist: WhitelistConfig::default(),
            threats: ThreatConfig::default(),
            rate_limit: RateLimitConfig::default(),
            upload: UploadConfig::default(),
            classifier: ClassifierConfig::default(),
            malware: MalwareConfig::default(),
            notifier: NotifierConfig::default(),
        }
    }
}

impl Default for MaildirConfig {
    fn default() -> Self {
        MaildirConfig {
            base_path: "/var/mail/mailcheck".to_string(),
            cleanup_interval_seconds: 15 * 60,
            retention_seconds: 60 * 60,
            release_grace_ms: 5000,
            write_settle_ms: 2000,
        }
    }
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        CrawlerConfig {
            max_concurrency: 7,
            navigation_timeout_seconds: 10,
            idle_wait_ms: 2000,
            screenshot_timeout_ms: 4500,
            operation_timeout_ms: 5000,
            idle_check_seconds: 60,
            idle_shutdown_seconds: 60,
            result_ttl_seconds: 60 * 60,
            chrome_executable: None,
            window_width: 1920,
            window_height: 1080,
            screenshot_dir: "/var/lib/mailcheck/screenshots".to_string(),
            screenshot_retention_days: 15,
        }
    }
}

impl Default for WhitelistConfig {
    fn default() -> Self {
        WhitelistConfig {
            path: Some("/etc/mailcheck/whitelist.txt".to_string()),
            reload_interval_seconds: 60,
        }
    }
}

impl Default for ThreatConfig {
    fn default() -> Self {
        ThreatConfig {
            safe_browsing_api_key: None,
            domain_blacklists: vec![
                "dbl.spamhaus.org".to_string(),
                "dbl.tornevall.org".to_string(),
                "multi.surbl.org".to_string(),
            ],
            ip_blacklists: vec!["zen.spamhaus.org".to_string()],
            cache_ttl_seconds: 60 * 60,
            lookup_delay_ms: 0,
            dns_provider: DnsProvider::Cloudflare,
            dns_timeout_seconds: 5,
            http_timeout_seconds: 10,
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        RateLimitConfig {
            daily_limit: 3,
            window_seconds: 86400,
            whitelist: Vec::new(),
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        UploadConfig {
            daily_limit: 5,
            max_size_bytes: 35 * 1024 * 1024,
            report_cache_seconds: 5 * 60 * 60,
        }
    }
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        ClassifierConfig {
            base_url: "https://openrouter.ai/api/v1".to_string(),
            api_key: None,
            model: "google/gemini-2.0-flash-001".to_string(),
            temperature: 0.8,
            timeout_seconds: 60,
            prompts_dir: None,
        }
    }
}

impl Default for MalwareConfig {
    fn default() -> Self {
        MalwareConfig {
            clamd_address: None,
            timeout_seconds: 30,
        }
    }
}

impl Default for NotifierConfig {
    fn default() -> Self {
        NotifierConfig {
            kind: NotifierKind::Log,
            sendmail_path: "/usr/sbin/sendmail".to_string(),
            from_address: "check@mailcheck.local".to_string(),
            site_url: "https://mailcheck.local".to_string(),
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Config = serde_yaml::from_str(&content)?;
        config.apply_env();
        Ok(config)
    }

    pub fn to_file(&self, path: &str) -> anyhow::Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Secrets left out of the file are taken from the environment.
    pub fn apply_env(&mut self) {
        if self.classifier.api_key.is_none() {
            self.classifier.api_key = std::env::var("OPENROUTER_API_KEY").ok();
        }
        if self.threats.safe_browsing_api_key.is_none() {
            self.threats.safe_browsing_api_key =
                std::env::var("GOOGLE_SAFE_BROWSING_API_KEY").ok();
        }
    }

    /// Sanity checks run by `--test-config`.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.mail_server.trim().is_empty() {
            anyhow::bail!("mail_server must not be empty");
        }
        if self.crawler.max_concurrency == 0 {
            anyhow::bail!("crawler.max_concurrency must be at least 1");
        }
        if self.rate_limit.daily_limit == 0 || self.upload.daily_limit == 0 {
            anyhow::bail!("daily limits must be at least 1");
        }
        url::Url::parse(&self.classifier.base_url)
            .map_err(|e| anyhow::anyhow!("classifier.base_url is not a URL: {e}"))?;
        if let Some(addr) = &self.malware.clamd_address {
            if !addr.contains(':') {
                anyhow::bail!("malware.clamd_address must be host:port, got '{addr}'");
            }
        }
        Ok(())
    }
}

impl MaildirConfig {
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_seconds)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_seconds)
    }

    pub fn release_grace(&self) -> Duration {
        Duration::from_millis(self.release_grace_ms)
    }

    pub fn write_settle(&self) -> Duration {
        Duration::from_millis(self.write_settle_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_round_trips_through_yaml() {
        let config = Config::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.crawler.max_concurrency, 7);
        assert_eq!(parsed.rate_limit.daily_limit, 3);
        assert_eq!(parsed.threats.ip_blacklists, vec!["zen.spamhaus.org"]);
        assert!(parsed.validate().is_ok());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let yaml = "mail_server: mx.example.org\ncrawler:\n  max_concurrency: 2\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.mail_server, "mx.example.org");
        assert_eq!(config.crawler.max_concurrency, 2);
        assert_eq!(config.crawler.navigation_timeout_seconds, 10);
        assert_eq!(config.upload.max_size_bytes, 35 * 1024 * 1024);
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let mut config = Config::default();
        config.crawler.max_concurrency = 0;
        assert!(config.validate().is_err());
    }
}
