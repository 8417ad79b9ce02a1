use crate::config::RetentionConfig;
use crate::poller::{CycleReport, Processor};
use crate::store::{RecordStore, RetentionFilter};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use std::sync::Arc;
use tracing::info;

/// Deletes `success`/`failed` webhook jobs that reached their terminal
/// status more than `max_age_days` ago. Pending and in-flight jobs are
/// never touched.
pub struct RetentionSweep {
    store: Arc<dyn RecordStore>,
    max_age: TimeDelta,
}

impl RetentionSweep {
    pub fn new(store: Arc<dyn RecordStore>, config: &RetentionConfig) -> Self {
        Self::with_max_age_days(store, config.max_age_days)
    }

    /// Negative ages count as zero; ages beyond what `TimeDelta` can hold
    /// are clamped to its maximum, which keeps everything.
    pub fn with_max_age_days(store: Arc<dyn RecordStore>, days: i64) -> Self {
        Self {
            store,
            max_age: TimeDelta::try_days(days.max(0)).unwrap_or(TimeDelta::MAX),
        }
    }

    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<u64> {
        let filter = RetentionFilter {
            terminal_before: now
                .checked_sub_signed(self.max_age)
                .unwrap_or(DateTime::<Utc>::MIN_UTC),
        };
        let deleted = self.store.delete_webhooks(&filter).await?;
        if deleted > 0 {
            info!(
                count = deleted,
                older_than_days = self.max_age.num_days(),
                "removed old webhook jobs"
            );
        }
        Ok(deleted)
    }
}

#[async_trait]
impl Processor for RetentionSweep {
    fn name(&self) -> &'static str {
        "retention"
    }

    async fn run_cycle(&self) -> Result<CycleReport> {
        let deleted = self.sweep(Utc::now()).await? as usize;
        Ok(CycleReport {
            items: deleted,
            succeeded: deleted,
            failed: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{WebhookJob, WebhookPayload, WebhookStatus};
    use crate::store::MemoryStore;

    fn job_with(status: WebhookStatus, age_days: i64) -> WebhookJob {
        let payload = WebhookPayload::new("deal.won", serde_json::json!({}));
        let mut job = WebhookJob::new("https://example.com/hook", &payload).unwrap();
        let at = Utc::now() - chrono::Duration::days(age_days);
        job.status = status;
        job.created_at = at;
        match status {
            WebhookStatus::Success => job.completed_at = Some(at),
            WebhookStatus::Failed => job.failed_at = Some(at),
            _ => {}
        }
        job
    }

    #[tokio::test]
    async fn test_sweep_only_removes_old_terminal_jobs() {
        let store = Arc::new(MemoryStore::default());
        let old_success = job_with(WebhookStatus::Success, 31);
        let old_failed = job_with(WebhookStatus::Failed, 45);
        let recent_success = job_with(WebhookStatus::Success, 2);
        let old_pending = job_with(WebhookStatus::Pending, 60);
        for job in [&old_success, &old_failed, &recent_success, &old_pending] {
            store.put_webhook(job.clone());
        }

        let sweep = RetentionSweep::new(store.clone(), &RetentionConfig::default());
        let report = sweep.run_cycle().await.unwrap();
        assert_eq!(report.items, 2);

        assert!(store.webhook(&old_success.id).is_none());
        assert!(store.webhook(&old_failed.id).is_none());
        assert!(store.webhook(&recent_success.id).is_some());
        assert!(store.webhook(&old_pending.id).is_some());
    }

    #[tokio::test]
    async fn test_zero_day_retention_removes_every_terminal_job() {
        let store = Arc::new(MemoryStore::default());
        let done = job_with(WebhookStatus::Success, 0);
        store.put_webhook(done.clone());

        let sweep = RetentionSweep::with_max_age_days(store.clone(), 0);
        let deleted = sweep.sweep(Utc::now() + chrono::Duration::seconds(1)).await.unwrap();
        assert_eq!(deleted, 1);
        assert!(store.webhook(&done.id).is_none());
    }

    #[tokio::test]
    async fn test_huge_retention_keeps_everything() {
        let store = Arc::new(MemoryStore::default());
        let ancient = job_with(WebhookStatus::Failed, 3650);
        store.put_webhook(ancient.clone());

        for days in [200_000_000, i64::MAX] {
            let sweep = RetentionSweep::with_max_age_days(store.clone(), days);
            assert_eq!(sweep.sweep(Utc::now()).await.unwrap(), 0);
        }
        assert!(store.webhook(&ancient.id).is_some());
    }
}
