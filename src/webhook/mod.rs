//! Outbound webhook delivery.
//!
//! Each cycle first re-arms jobs stuck in `processing`, then delivers up to
//! `batch_size` pending jobs one after another, oldest first.

pub mod client;
pub mod retention;

use crate::config::WebhookConfig;
use crate::error::DeliveryError;
use crate::models::{WebhookJob, WebhookTransition};
use crate::poller::{CycleReport, Processor};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::store::RecordStore;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use client::{DeliveryClient, DeliveryOutcome};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const INTERRUPTED: &str = "delivery interrupted";

pub struct WebhookProcessor {
    store: Arc<dyn RecordStore>,
    client: DeliveryClient,
    policy: RetryPolicy,
    batch_size: usize,
    item_pause: Duration,
    processing_grace: Duration,
}

impl WebhookProcessor {
    pub fn new(store: Arc<dyn RecordStore>, config: &WebhookConfig) -> Result<Self, DeliveryError> {
        Ok(Self {
            store,
            client: DeliveryClient::new(&config.user_agent, config.default_timeout())?,
            policy: RetryPolicy::new(config.max_retries),
            batch_size: config.batch_size,
            item_pause: config.item_pause(),
            processing_grace: config.processing_grace(),
        })
    }

    /// One delivery attempt: mark `processing`, send, record the outcome.
    pub async fn deliver(&self, job: &WebhookJob) -> Result<DeliveryOutcome> {
        debug!(job_id = %job.id, url = %job.url, attempt = job.retry_count + 1, "delivering webhook");

        self.store
            .update_webhook(
                &job.id,
                &WebhookTransition::Processing {
                    attempted_at: Utc::now(),
                },
            )
            .await
            .context("Failed to mark webhook as processing")?;

        let outcome = self.client.send(job).await;
        self.record_outcome(job, &outcome).await?;
        Ok(outcome)
    }

    async fn record_outcome(&self, job: &WebhookJob, outcome: &DeliveryOutcome) -> Result<()> {
        let transition = match outcome {
            DeliveryOutcome::Success {
                status_code,
                body,
                duration_ms,
            } => WebhookTransition::Succeeded {
                response: body.clone(),
                response_status: *status_code,
                response_duration_ms: *duration_ms,
                completed_at: Utc::now(),
            },
            DeliveryOutcome::Failure {
                status_code,
                message,
            } => self.failure_transition(job, message, Some(*status_code).filter(|s| *s != 0)),
        };

        match &transition {
            WebhookTransition::Succeeded { response_status, .. } => {
                info!(job_id = %job.id, status = response_status, "webhook delivered");
            }
            WebhookTransition::Retrying { retry_count, last_error, .. } => warn!(
                job_id = %job.id,
                attempt = retry_count,
                max = self.policy.effective_max(job.max_retries),
                error = %last_error,
                "webhook delivery failed, will retry"
            ),
            WebhookTransition::Failed { retry_count, last_error, .. } => error!(
                job_id = %job.id,
                attempts = retry_count,
                error = %last_error,
                "webhook delivery failed permanently"
            ),
            WebhookTransition::Processing { .. } => {}
        }

        self.store
            .update_webhook(&job.id, &transition)
            .await
            .context("Failed to record webhook outcome")
    }

    fn failure_transition(
        &self,
        job: &WebhookJob,
        message: &str,
        response_status: Option<u16>,
    ) -> WebhookTransition {
        match self.policy.decide(false, job.retry_count, job.max_retries) {
            RetryDecision::Exhaust { retry_count } => WebhookTransition::Failed {
                retry_count,
                last_error: message.to_string(),
                response_status,
                failed_at: Utc::now(),
            },
            RetryDecision::Retry { retry_count } => WebhookTransition::Retrying {
                retry_count,
                last_error: message.to_string(),
                response_status,
            },
            RetryDecision::Succeed => unreachable!("a failed attempt never decides success"),
        }
    }

    /// Treats every job in `processing` that started before `started_before`
    /// as one failed attempt. Returns how many jobs were re-armed or failed.
    pub async fn recover_stale(&self, started_before: DateTime<Utc>) -> Result<usize> {
        let stale = self
            .store
            .find_stale_processing_webhooks(started_before)
            .await?;

        for job in &stale {
            let transition = self.failure_transition(job, INTERRUPTED, None);
            warn!(
                job_id = %job.id,
                status = %transition.status(),
                "recovering interrupted webhook delivery"
            );
            self.store.update_webhook(&job.id, &transition).await?;
        }
        Ok(stale.len())
    }
}

#[async_trait]
impl Processor for WebhookProcessor {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn recover(&self) -> Result<()> {
        let recovered = self.recover_stale(Utc::now()).await?;
        if recovered > 0 {
            info!(count = recovered, "re-armed webhooks left in processing by a previous run");
        }
        Ok(())
    }

    async fn run_cycle(&self) -> Result<CycleReport> {
        let grace = chrono::Duration::from_std(self.processing_grace)
            .unwrap_or_else(|_| chrono::Duration::seconds(300));
        self.recover_stale(Utc::now() - grace).await?;

        let jobs = self
            .store
            .find_pending_webhooks(self.batch_size, self.policy.max_retries)
            .await
            .context("Failed to load pending webhooks")?;

        let mut report = CycleReport {
            items: jobs.len(),
            ..Default::default()
        };

        for (i, job) in jobs.iter().enumerate() {
            if i > 0 && !self.item_pause.is_zero() {
                tokio::time::sleep(self.item_pause).await;
            }

            match self.deliver(job).await {
                Ok(outcome) if outcome.is_success() => report.succeeded += 1,
                Ok(_) => report.failed += 1,
                Err(e) => {
                    error!(job_id = %job.id, error = %format!("{:#}", e), "webhook processing error");
                    report.failed += 1;
                }
            }
        }

        if report.items > 0 {
            if let Ok(stats) = self.store.webhook_stats().await {
                debug!(
                    pending = stats.pending,
                    processing = stats.processing,
                    success = stats.success,
                    failed = stats.failed,
                    "webhook queue"
                );
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{WebhookPayload, WebhookStatus};
    use crate::signing;
    use crate::store::MemoryStore;
    use axum::body::Bytes;
    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use axum::{Json, Router};
    use std::net::SocketAddr;
    use std::sync::Mutex;

    type Captured = Arc<Mutex<Vec<(HeaderMap, Bytes)>>>;

    async fn serve(router: Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        addr
    }

    async fn unreachable_url() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("http://{}/hook", addr)
    }

    fn config() -> WebhookConfig {
        WebhookConfig {
            item_pause_ms: 0,
            ..Default::default()
        }
    }

    fn processor(store: &Arc<MemoryStore>) -> WebhookProcessor {
        let store: Arc<dyn RecordStore> = store.clone();
        WebhookProcessor::new(store, &config()).unwrap()
    }

    fn job(url: &str) -> WebhookJob {
        let payload = WebhookPayload::new("contact.updated", serde_json::json!({"id": 12}));
        WebhookJob::new(url, &payload).unwrap()
    }

    #[tokio::test]
    async fn test_unreachable_target_exhausts_after_three_cycles() {
        let store = Arc::new(MemoryStore::default());
        let queued = job(&unreachable_url().await).with_max_retries(3);
        store.insert_webhook(&queued).await.unwrap();
        let processor = processor(&store);

        let mut statuses = vec![store.webhook(&queued.id).unwrap().status];
        for _ in 0..3 {
            let report = processor.run_cycle().await.unwrap();
            assert_eq!(report.items, 1);
            assert_eq!(report.failed, 1);
            statuses.push(store.webhook(&queued.id).unwrap().status);
        }

        assert_eq!(
            statuses,
            vec![
                WebhookStatus::Pending,
                WebhookStatus::Pending,
                WebhookStatus::Pending,
                WebhookStatus::Failed
            ]
        );
        let done = store.webhook(&queued.id).unwrap();
        assert_eq!(done.retry_count, 3);
        assert!(done.failed_at.is_some());
        assert!(done.last_error.unwrap().starts_with("connection failed"));
        assert_eq!(done.response_status, None);

        // Exhausted jobs are no longer picked up.
        let report = processor.run_cycle().await.unwrap();
        assert_eq!(report.items, 0);
    }

    #[tokio::test]
    async fn test_ok_response_is_stored_as_json() {
        let router = Router::new().route("/hook", post(|| async { Json(serde_json::json!({"ok": true})) }));
        let addr = serve(router).await;

        let store = Arc::new(MemoryStore::default());
        let queued = job(&format!("http://{}/hook", addr));
        store.insert_webhook(&queued).await.unwrap();

        let report = processor(&store).run_cycle().await.unwrap();
        assert_eq!(report.succeeded, 1);

        let done = store.webhook(&queued.id).unwrap();
        assert_eq!(done.status, WebhookStatus::Success);
        assert_eq!(done.response, Some(serde_json::json!({"ok": true})));
        assert_eq!(done.response_status, Some(200));
        assert!(done.response_duration_ms.is_some());
        assert_eq!(done.retry_count, 0);
        assert!(done.completed_at.is_some());
        assert!(done.last_attempted_at.is_some());
    }

    #[tokio::test]
    async fn test_server_error_counts_against_budget() {
        let router = Router::new().route(
            "/hook",
            post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "oops") }),
        );
        let addr = serve(router).await;

        let store = Arc::new(MemoryStore::default());
        let queued = job(&format!("http://{}/hook", addr));
        store.insert_webhook(&queued).await.unwrap();

        let outcome = processor(&store).deliver(&queued).await.unwrap();
        assert_eq!(outcome.status_code(), 500);

        let after = store.webhook(&queued.id).unwrap();
        assert_eq!(after.status, WebhookStatus::Pending);
        assert_eq!(after.retry_count, 1);
        assert_eq!(after.response_status, Some(500));
        assert_eq!(after.last_error.as_deref(), Some("HTTP 500 Internal Server Error"));
        assert_eq!(after.failed_at, None);
    }

    #[tokio::test]
    async fn test_last_allowed_failure_marks_failed() {
        let router = Router::new().route("/hook", post(|| async { StatusCode::NOT_FOUND }));
        let addr = serve(router).await;

        let store = Arc::new(MemoryStore::default());
        let mut queued = job(&format!("http://{}/hook", addr));
        queued.retry_count = 2;
        store.insert_webhook(&queued).await.unwrap();

        processor(&store).deliver(&queued).await.unwrap();
        let after = store.webhook(&queued.id).unwrap();
        assert_eq!(after.status, WebhookStatus::Failed);
        assert_eq!(after.retry_count, 3);
        assert_eq!(after.last_error.as_deref(), Some("HTTP 404 Not Found"));
    }

    #[tokio::test]
    async fn test_signed_delivery_is_verifiable_by_receiver() {
        let captured: Captured = Arc::default();
        let router = Router::new()
            .route(
                "/hook",
                post(
                    |State(captured): State<Captured>, headers: HeaderMap, body: Bytes| async move {
                        captured.lock().unwrap().push((headers, body));
                        StatusCode::NO_CONTENT
                    },
                ),
            )
            .with_state(captured.clone());
        let addr = serve(router).await;

        let store = Arc::new(MemoryStore::default());
        let queued = job(&format!("http://{}/hook", addr))
            .with_secret("shared")
            .with_header("Content-Type", "text/plain")
            .with_header("X-Tenant", "acme");
        store.insert_webhook(&queued).await.unwrap();

        let outcome = processor(&store).deliver(&queued).await.unwrap();
        assert!(outcome.is_success());

        let captured = captured.lock().unwrap();
        let (headers, body) = &captured[0];
        assert_eq!(body.as_ref(), queued.payload.as_slice());
        assert_eq!(headers["content-type"], "application/json");
        assert_eq!(headers["user-agent"], "CRM-Webhook/1.0");
        assert_eq!(headers["x-tenant"], "acme");
        let signature = headers["x-webhook-signature"].to_str().unwrap();
        assert!(signing::verify_signature(body, signature, "shared"));
        assert!(!signing::verify_signature(body, signature, "other"));

        let done = store.webhook(&queued.id).unwrap();
        assert_eq!(done.response, Some(serde_json::Value::String(String::new())));
    }

    #[tokio::test]
    async fn test_slow_target_times_out() {
        let router = Router::new().route(
            "/hook",
            post(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                StatusCode::OK
            }),
        );
        let addr = serve(router).await;

        let store = Arc::new(MemoryStore::default());
        let queued = job(&format!("http://{}/hook", addr)).with_timeout(Duration::from_millis(100));
        store.insert_webhook(&queued).await.unwrap();

        let outcome = processor(&store).deliver(&queued).await.unwrap();
        assert_eq!(
            outcome,
            DeliveryOutcome::Failure {
                status_code: 0,
                message: "request timed out after 100ms".into()
            }
        );
        assert_eq!(store.webhook(&queued.id).unwrap().status, WebhookStatus::Pending);
    }

    #[tokio::test]
    async fn test_cycle_takes_oldest_batch_first() {
        let router = Router::new().route("/hook", post(|| async { StatusCode::OK }));
        let addr = serve(router).await;
        let url = format!("http://{}/hook", addr);

        let store = Arc::new(MemoryStore::default());
        let mut ids = Vec::new();
        for i in 0..7 {
            let mut queued = job(&url);
            queued.created_at = DateTime::from_timestamp(1_700_000_000 + i, 0).unwrap();
            store.insert_webhook(&queued).await.unwrap();
            ids.push(queued.id);
        }

        let report = processor(&store).run_cycle().await.unwrap();
        assert_eq!(report.items, 5);
        for (i, id) in ids.iter().enumerate() {
            let expected = if i < 5 {
                WebhookStatus::Success
            } else {
                WebhookStatus::Pending
            };
            assert_eq!(store.webhook(id).unwrap().status, expected);
        }
    }

    #[tokio::test]
    async fn test_recover_rearms_interrupted_jobs() {
        let store = Arc::new(MemoryStore::default());
        let mut interrupted = job("http://127.0.0.1:1/hook");
        interrupted.status = WebhookStatus::Processing;
        interrupted.last_attempted_at = Some(Utc::now() - chrono::Duration::minutes(1));
        store.put_webhook(interrupted.clone());

        let mut last_chance = job("http://127.0.0.1:1/hook");
        last_chance.status = WebhookStatus::Processing;
        last_chance.retry_count = 2;
        last_chance.last_attempted_at = Some(Utc::now() - chrono::Duration::minutes(1));
        store.put_webhook(last_chance.clone());

        processor(&store).recover().await.unwrap();

        let rearmed = store.webhook(&interrupted.id).unwrap();
        assert_eq!(rearmed.status, WebhookStatus::Pending);
        assert_eq!(rearmed.retry_count, 1);
        assert_eq!(rearmed.last_error.as_deref(), Some(INTERRUPTED));

        let exhausted = store.webhook(&last_chance.id).unwrap();
        assert_eq!(exhausted.status, WebhookStatus::Failed);
        assert_eq!(exhausted.retry_count, 3);
    }

    #[tokio::test]
    async fn test_cycle_leaves_recent_processing_jobs_alone() {
        let store = Arc::new(MemoryStore::default());
        let mut in_flight = job("http://127.0.0.1:1/hook");
        in_flight.status = WebhookStatus::Processing;
        in_flight.last_attempted_at = Some(Utc::now());
        store.put_webhook(in_flight.clone());

        let report = processor(&store).run_cycle().await.unwrap();
        assert_eq!(report.items, 0);
        assert_eq!(
            store.webhook(&in_flight.id).unwrap().status,
            WebhookStatus::Processing
        );
    }
}
