use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

pub const DEFAULT_WEBHOOK_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_SOURCE: &str = "crm";

/// A secret value (account password, webhook signing secret).
/// Never printed by `Debug`, so it is safe inside logged structs.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(***)")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WebhookStatus {
    Pending,
    Processing,
    Success,
    Failed,
}

impl WebhookStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookStatus::Pending => "pending",
            WebhookStatus::Processing => "processing",
            WebhookStatus::Success => "success",
            WebhookStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(WebhookStatus::Pending),
            "processing" => Some(WebhookStatus::Processing),
            "success" => Some(WebhookStatus::Success),
            "failed" => Some(WebhookStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, WebhookStatus::Success | WebhookStatus::Failed)
    }
}

impl fmt::Display for WebhookStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The JSON envelope every webhook body carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub event: String,
    pub data: serde_json::Value,
    pub timestamp: String,
    pub source: String,
}

impl WebhookPayload {
    pub fn new(event: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            event: event.into(),
            data,
            timestamp: Utc::now().to_rfc3339(),
            source: DEFAULT_SOURCE.to_string(),
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }
}

/// Accepts only absolute `http`/`https` URLs.
pub fn is_valid_webhook_url(url: &str) -> bool {
    match reqwest::Url::parse(url) {
        Ok(parsed) => matches!(parsed.scheme(), "http" | "https") && parsed.has_host(),
        Err(_) => false,
    }
}

#[derive(Debug, Clone)]
pub struct WebhookJob {
    pub id: String,
    pub url: String,
    /// Serialized JSON body, sent and signed byte-for-byte.
    pub payload: Vec<u8>,
    pub secret: Option<Credential>,
    /// Caller-supplied headers, in insertion order.
    pub headers: Vec<(String, String)>,
    pub timeout: Duration,
    pub status: WebhookStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub last_error: Option<String>,
    pub response: Option<serde_json::Value>,
    pub response_status: Option<u16>,
    /// Round-trip time of the successful delivery.
    pub response_duration_ms: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub last_attempted_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
}

impl WebhookJob {
    pub fn new(url: impl Into<String>, payload: &WebhookPayload) -> serde_json::Result<Self> {
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            url: url.into(),
            payload: serde_json::to_vec(payload)?,
            secret: None,
            headers: Vec::new(),
            timeout: DEFAULT_WEBHOOK_TIMEOUT,
            status: WebhookStatus::Pending,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            last_error: None,
            response: None,
            response_status: None,
            response_duration_ms: None,
            created_at: Utc::now(),
            last_attempted_at: None,
            completed_at: None,
            failed_at: None,
        })
    }

    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(Credential::new(secret));
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// When the job reached its terminal status, if it has.
    pub fn terminal_at(&self) -> Option<DateTime<Utc>> {
        match self.status {
            WebhookStatus::Success => self.completed_at,
            WebhookStatus::Failed => self.failed_at,
            _ => None,
        }
    }
}

/// The only ways a webhook job row changes after creation.
#[derive(Debug, Clone, PartialEq)]
pub enum WebhookTransition {
    Processing {
        attempted_at: DateTime<Utc>,
    },
    Succeeded {
        response: serde_json::Value,
        response_status: u16,
        response_duration_ms: u64,
        completed_at: DateTime<Utc>,
    },
    Retrying {
        retry_count: u32,
        last_error: String,
        response_status: Option<u16>,
    },
    Failed {
        retry_count: u32,
        last_error: String,
        response_status: Option<u16>,
        failed_at: DateTime<Utc>,
    },
}

impl WebhookTransition {
    pub fn status(&self) -> WebhookStatus {
        match self {
            WebhookTransition::Processing { .. } => WebhookStatus::Processing,
            WebhookTransition::Succeeded { .. } => WebhookStatus::Success,
            WebhookTransition::Retrying { .. } => WebhookStatus::Pending,
            WebhookTransition::Failed { .. } => WebhookStatus::Failed,
        }
    }

    pub fn apply(&self, job: &mut WebhookJob) {
        job.status = self.status();
        match self {
            WebhookTransition::Processing { attempted_at } => {
                job.last_attempted_at = Some(*attempted_at);
            }
            WebhookTransition::Succeeded {
                response,
                response_status,
                response_duration_ms,
                completed_at,
            } => {
                job.response = Some(response.clone());
                job.response_status = Some(*response_status);
                job.response_duration_ms = Some(*response_duration_ms);
                job.completed_at = Some(*completed_at);
            }
            WebhookTransition::Retrying {
                retry_count,
                last_error,
                response_status,
            } => {
                job.retry_count = *retry_count;
                job.last_error = Some(last_error.clone());
                job.response_status = *response_status;
                job.failed_at = None;
            }
            WebhookTransition::Failed {
                retry_count,
                last_error,
                response_status,
                failed_at,
            } => {
                job.retry_count = *retry_count;
                job.last_error = Some(last_error.clone());
                job.response_status = *response_status;
                job.failed_at = Some(*failed_at);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WebhookStats {
    pub total: u64,
    pub pending: u64,
    pub processing: u64,
    pub success: u64,
    pub failed: u64,
}

impl WebhookStats {
    pub fn add(&mut self, status: WebhookStatus, count: u64) {
        self.total += count;
        match status {
            WebhookStatus::Pending => self.pending += count,
            WebhookStatus::Processing => self.processing += count,
            WebhookStatus::Success => self.success += count,
            WebhookStatus::Failed => self.failed += count,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MailAccount {
    pub id: String,
    pub name: String,
    pub email: String,
    pub imap_host: String,
    pub imap_port: u16,
    pub imap_secure: bool,
    /// Skip TLS certificate validation (self-signed servers).
    pub accept_invalid_certs: bool,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub smtp_secure: bool,
    pub username: String,
    pub password: Credential,
    pub is_active: bool,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// The only account fields the sync worker writes.
#[derive(Debug, Clone, PartialEq)]
pub struct MailAccountUpdate {
    pub last_sync_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

#[derive(Clone, PartialEq, Eq)]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    pub size: u64,
    pub content: Vec<u8>,
}

impl fmt::Debug for Attachment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Attachment")
            .field("filename", &self.filename)
            .field("content_type", &self.content_type)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredEmail {
    pub id: String,
    pub message_id: String,
    pub account_id: String,
    pub subject: String,
    pub from_address: String,
    pub from_name: String,
    pub to_addresses: Vec<String>,
    pub cc_addresses: Vec<String>,
    pub bcc_addresses: Vec<String>,
    pub text_body: String,
    pub html_body: String,
    pub attachments: Vec<Attachment>,
    pub is_read: bool,
    pub is_starred: bool,
    pub folder: String,
    pub received_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [
            WebhookStatus::Pending,
            WebhookStatus::Processing,
            WebhookStatus::Success,
            WebhookStatus::Failed,
        ] {
            assert_eq!(WebhookStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(WebhookStatus::parse("PENDING"), None);
    }

    #[test]
    fn test_only_success_and_failed_are_terminal() {
        assert!(!WebhookStatus::Pending.is_terminal());
        assert!(!WebhookStatus::Processing.is_terminal());
        assert!(WebhookStatus::Success.is_terminal());
        assert!(WebhookStatus::Failed.is_terminal());
    }

    #[test]
    fn test_credential_debug_is_redacted() {
        let secret = Credential::new("hunter2");
        assert_eq!(format!("{:?}", secret), "Credential(***)");
        assert_eq!(secret.expose(), "hunter2");
    }

    #[test]
    fn test_new_job_serializes_envelope() {
        let payload = WebhookPayload::new("contact.created", serde_json::json!({"id": 7}));
        let job = WebhookJob::new("https://example.com/hook", &payload).unwrap();
        assert_eq!(job.status, WebhookStatus::Pending);
        assert_eq!(job.retry_count, 0);
        assert_eq!(job.max_retries, DEFAULT_MAX_RETRIES);

        let decoded: WebhookPayload = serde_json::from_slice(&job.payload).unwrap();
        assert_eq!(decoded.event, "contact.created");
        assert_eq!(decoded.source, DEFAULT_SOURCE);
    }

    #[test]
    fn test_retrying_clears_failure_timestamp() {
        let payload = WebhookPayload::new("x", serde_json::Value::Null);
        let mut job = WebhookJob::new("https://example.com", &payload).unwrap();
        WebhookTransition::Retrying {
            retry_count: 1,
            last_error: "HTTP 500 Internal Server Error".into(),
            response_status: Some(500),
        }
        .apply(&mut job);
        assert_eq!(job.status, WebhookStatus::Pending);
        assert_eq!(job.retry_count, 1);
        assert_eq!(job.failed_at, None);
        assert_eq!(job.terminal_at(), None);
    }

    #[test]
    fn test_webhook_url_validation() {
        assert!(is_valid_webhook_url("https://hooks.example.com/a"));
        assert!(is_valid_webhook_url("http://localhost:8080"));
        assert!(!is_valid_webhook_url("ftp://example.com"));
        assert!(!is_valid_webhook_url("not a url"));
    }
}
