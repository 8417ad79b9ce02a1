use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_DATABASE_URL: &str = "sqlite:crm_workers.db?mode=rwc";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database_url: String,
    pub webhook: WebhookConfig,
    pub mailbox: MailboxConfig,
    pub retention: RetentionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    pub interval_secs: u64,
    pub batch_size: usize,
    pub max_retries: u32,
    /// Pause between two deliveries of the same cycle.
    pub item_pause_ms: u64,
    pub default_timeout_ms: u64,
    pub user_agent: String,
    /// A job left in `processing` this long is treated as interrupted.
    pub processing_grace_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MailboxConfig {
    pub interval_secs: u64,
    pub account_batch_size: usize,
    /// Pause between two account batches of the same cycle.
    pub batch_pause_ms: u64,
    pub message_batch_size: usize,
    pub folder: String,
    pub connect_timeout_secs: u64,
    /// Deadline for everything after login: search, fetches and logout.
    pub session_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub interval_secs: u64,
    pub max_age_days: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            webhook: WebhookConfig::default(),
            mailbox: MailboxConfig::default(),
            retention: RetentionConfig::default(),
        }
    }
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            batch_size: 5,
            max_retries: 3,
            item_pause_ms: 100,
            default_timeout_ms: 30_000,
            user_agent: "CRM-Webhook/1.0".to_string(),
            processing_grace_secs: 300,
        }
    }
}

impl Default for MailboxConfig {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            account_batch_size: 10,
            batch_pause_ms: 1000,
            message_batch_size: 5,
            folder: "INBOX".to_string(),
            connect_timeout_secs: 60,
            session_timeout_secs: 300,
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            interval_secs: 86_400,
            max_age_days: 30,
        }
    }
}

impl WebhookConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn item_pause(&self) -> Duration {
        Duration::from_millis(self.item_pause_ms)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn processing_grace(&self) -> Duration {
        Duration::from_secs(self.processing_grace_secs)
    }
}

impl MailboxConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn batch_pause(&self) -> Duration {
        Duration::from_millis(self.batch_pause_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }
}

impl RetentionConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Config {
    /// Reads `settings.toml` if present, then applies `DATABASE_URL`.
    pub fn load() -> Self {
        use std::fs;
        let mut config = Self::default();
        if let Ok(content) = fs::read_to_string("settings.toml") {
            match toml::from_str(&content) {
                Ok(parsed) => config = parsed,
                Err(e) => tracing::warn!("settings.toml ignored: {}", e),
            }
        }
        if let Ok(url) = std::env::var("DATABASE_URL") {
            config.database_url = url;
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_worker_cadence() {
        let config = Config::default();
        assert_eq!(config.webhook.interval(), Duration::from_secs(30));
        assert_eq!(config.webhook.batch_size, 5);
        assert_eq!(config.webhook.item_pause(), Duration::from_millis(100));
        assert_eq!(config.webhook.default_timeout(), Duration::from_secs(30));
        assert_eq!(config.mailbox.interval(), Duration::from_secs(300));
        assert_eq!(config.mailbox.account_batch_size, 10);
        assert_eq!(config.mailbox.batch_pause(), Duration::from_secs(1));
        assert_eq!(config.mailbox.message_batch_size, 5);
        assert_eq!(config.mailbox.session_timeout(), Duration::from_secs(300));
        assert_eq!(config.retention.max_age_days, 30);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let config: Config = toml::from_str(
            r#"
            [webhook]
            batch_size = 20

            [mailbox]
            folder = "Archive"
            "#,
        )
        .unwrap();
        assert_eq!(config.webhook.batch_size, 20);
        assert_eq!(config.webhook.max_retries, 3);
        assert_eq!(config.mailbox.folder, "Archive");
        assert_eq!(config.mailbox.interval_secs, 300);
        assert_eq!(config.database_url, DEFAULT_DATABASE_URL);
    }
}
