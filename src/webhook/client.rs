use crate::error::DeliveryError;
use crate::models::{WebhookJob, is_valid_webhook_url};
use crate::signing::{self, SIGNATURE_HEADER};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE, USER_AGENT};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Result of one HTTP delivery attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    /// 2xx; `body` is the parsed JSON response, or the raw text as a JSON string.
    /// `duration_ms` runs from sending the request to reading the full body.
    Success {
        status_code: u16,
        body: serde_json::Value,
        duration_ms: u64,
    },
    /// Any non-2xx, transport error or timeout. `status_code` is 0 when no
    /// response arrived.
    Failure { status_code: u16, message: String },
}

impl DeliveryOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, DeliveryOutcome::Success { .. })
    }

    pub fn status_code(&self) -> u16 {
        match self {
            DeliveryOutcome::Success { status_code, .. }
            | DeliveryOutcome::Failure { status_code, .. } => *status_code,
        }
    }

    fn failure(error: DeliveryError) -> Self {
        DeliveryOutcome::Failure {
            status_code: 0,
            message: error.to_string(),
        }
    }
}

/// Sends signed webhook requests.
#[derive(Clone)]
pub struct DeliveryClient {
    http: reqwest::Client,
    user_agent: String,
    default_timeout: Duration,
}

impl DeliveryClient {
    pub fn new(user_agent: &str, default_timeout: Duration) -> Result<Self, DeliveryError> {
        let http = reqwest::Client::builder().build()?;
        Ok(Self {
            http,
            user_agent: user_agent.to_string(),
            default_timeout,
        })
    }

    /// Fixed headers, then the job's own headers, then the signature.
    /// Job headers may replace the user agent but never `Content-Type`
    /// or the signature.
    pub fn build_headers(&self, job: &WebhookJob) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Ok(agent) = HeaderValue::from_str(&self.user_agent) {
            headers.insert(USER_AGENT, agent);
        }

        let signature_name = HeaderName::from_static("x-webhook-signature");
        for (name, value) in &job.headers {
            let parsed = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            );
            match parsed {
                (Ok(name), Ok(_)) if name == CONTENT_TYPE || name == signature_name => {
                    debug!(job_id = %job.id, header = %name, "ignoring reserved header");
                }
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => warn!(job_id = %job.id, header = %name, "skipping invalid header"),
            }
        }

        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(secret) = &job.secret {
            let signature = signing::signature_header_value(secret.expose(), &job.payload);
            if let Ok(value) = HeaderValue::from_str(&signature) {
                headers.insert(signature_name, value);
            }
        }
        headers
    }

    /// POSTs the job payload. Never fails: every problem becomes a
    /// [`DeliveryOutcome::Failure`].
    pub async fn send(&self, job: &WebhookJob) -> DeliveryOutcome {
        let url = match reqwest::Url::parse(&job.url) {
            Ok(url) if is_valid_webhook_url(&job.url) => url,
            Ok(_) => {
                return DeliveryOutcome::failure(DeliveryError::InvalidUrl(job.url.clone()));
            }
            Err(e) => {
                return DeliveryOutcome::failure(DeliveryError::InvalidUrl(format!(
                    "{}: {}",
                    job.url, e
                )));
            }
        };
        let timeout = if job.timeout.is_zero() {
            self.default_timeout
        } else {
            job.timeout
        };

        let started = Instant::now();
        let response = self
            .http
            .post(url)
            .headers(self.build_headers(job))
            .body(job.payload.clone())
            .timeout(timeout)
            .send()
            .await;

        let response = match response {
            Ok(r) => r,
            Err(e) => return DeliveryOutcome::failure(classify(&e, timeout)),
        };

        let status = response.status();
        let text = match response.text().await {
            Ok(text) => text,
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "could not read response body");
                String::new()
            }
        };
        let duration_ms = started.elapsed().as_millis() as u64;
        debug!(job_id = %job.id, status = status.as_u16(), duration_ms, "webhook response");

        if status.is_success() {
            DeliveryOutcome::Success {
                status_code: status.as_u16(),
                body: parse_body(text),
                duration_ms,
            }
        } else {
            DeliveryOutcome::Failure {
                status_code: status.as_u16(),
                message: format!("HTTP {}", status),
            }
        }
    }
}

fn parse_body(text: String) -> serde_json::Value {
    serde_json::from_str(&text).unwrap_or(serde_json::Value::String(text))
}

fn classify(error: &reqwest::Error, timeout: Duration) -> DeliveryError {
    if error.is_timeout() {
        return DeliveryError::Timeout(timeout);
    }

    let mut message = error.to_string();
    let mut source = std::error::Error::source(error);
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }

    if error.is_connect() {
        DeliveryError::Connect(message)
    } else {
        DeliveryError::Transport(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::WebhookPayload;

    fn client() -> DeliveryClient {
        DeliveryClient::new("CRM-Webhook/1.0", Duration::from_secs(30)).unwrap()
    }

    fn job() -> WebhookJob {
        let payload = WebhookPayload::new("task.done", serde_json::json!({"task": 9}));
        WebhookJob::new("http://127.0.0.1/hook", &payload).unwrap()
    }

    #[test]
    fn test_signature_only_with_secret() {
        let unsigned = client().build_headers(&job());
        assert!(unsigned.get(SIGNATURE_HEADER).is_none());

        let signed_job = job().with_secret("k");
        let signed = client().build_headers(&signed_job);
        let value = signed.get(SIGNATURE_HEADER).unwrap().to_str().unwrap();
        assert!(signing::verify_signature(&signed_job.payload, value, "k"));
    }

    #[test]
    fn test_custom_headers_cannot_override_reserved_ones() {
        let custom = job()
            .with_secret("k")
            .with_header("content-type", "text/plain")
            .with_header("X-Webhook-Signature", "sha256=forged")
            .with_header("User-Agent", "custom-agent")
            .with_header("X-Tenant", "acme");
        let headers = client().build_headers(&custom);

        assert_eq!(headers.get(CONTENT_TYPE).unwrap(), "application/json");
        assert_ne!(headers.get(SIGNATURE_HEADER).unwrap(), "sha256=forged");
        assert_eq!(headers.get(USER_AGENT).unwrap(), "custom-agent");
        assert_eq!(headers.get("x-tenant").unwrap(), "acme");
    }

    #[test]
    fn test_invalid_custom_header_is_skipped() {
        let custom = job().with_header("bad header", "x").with_header("X-Ok", "1");
        let headers = client().build_headers(&custom);
        assert_eq!(headers.get("x-ok").unwrap(), "1");
        assert_eq!(headers.len(), 3);
    }

    #[test]
    fn test_body_falls_back_to_text() {
        assert_eq!(
            parse_body(r#"{"ok":true}"#.to_string()),
            serde_json::json!({"ok": true})
        );
        assert_eq!(
            parse_body("accepted".to_string()),
            serde_json::Value::String("accepted".into())
        );
    }

    #[tokio::test]
    async fn test_invalid_url_is_a_failure_not_an_error() {
        let mut bad = job();
        bad.url = "not a url".into();
        match client().send(&bad).await {
            DeliveryOutcome::Failure {
                status_code,
                message,
            } => {
                assert_eq!(status_code, 0);
                assert!(message.starts_with("invalid webhook url"));
            }
            other => panic!("unexpected outcome {:?}", other),
        }

        bad.url = "ftp://files.example.com/hook".into();
        assert_eq!(
            client().send(&bad).await,
            DeliveryOutcome::Failure {
                status_code: 0,
                message: "invalid webhook url: ftp://files.example.com/hook".into()
            }
        );
    }
}
