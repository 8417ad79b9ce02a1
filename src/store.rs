use crate::models::{
    MailAccount, MailAccountUpdate, StoredEmail, WebhookJob, WebhookStats, WebhookTransition,
};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Selects terminal webhook jobs for the retention sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionFilter {
    /// Delete `success` jobs completed, and `failed` jobs failed, before this instant.
    pub terminal_before: DateTime<Utc>,
}

/// Everything the workers read from and write to persistent storage.
///
/// Both pollers derive every decision from fresh reads through this trait,
/// so an implementation must make each write visible to the next read.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Pending jobs below both their own retry budget and `max_retries`,
    /// oldest first.
    async fn find_pending_webhooks(&self, limit: usize, max_retries: u32)
        -> Result<Vec<WebhookJob>>;

    /// Jobs stuck in `processing` whose last attempt started before `started_before`.
    async fn find_stale_processing_webhooks(
        &self,
        started_before: DateTime<Utc>,
    ) -> Result<Vec<WebhookJob>>;

    async fn insert_webhook(&self, job: &WebhookJob) -> Result<()>;

    async fn update_webhook(&self, id: &str, transition: &WebhookTransition) -> Result<()>;

    /// Returns the number of deleted jobs.
    async fn delete_webhooks(&self, filter: &RetentionFilter) -> Result<u64>;

    async fn webhook_stats(&self) -> Result<WebhookStats>;

    async fn find_active_mail_accounts(&self) -> Result<Vec<MailAccount>>;

    async fn insert_mail_account(&self, account: &MailAccount) -> Result<()>;

    async fn update_mail_account(&self, id: &str, update: &MailAccountUpdate) -> Result<()>;

    async fn find_email_by_message_id(
        &self,
        account_id: &str,
        message_id: &str,
    ) -> Result<Option<StoredEmail>>;

    /// Existence check on `(message_id, account_id)` without loading the row.
    async fn contains_email(&self, account_id: &str, message_id: &str) -> Result<bool>;

    /// Returns `false` when `(message_id, account_id)` already exists; the
    /// existing row is left untouched.
    async fn insert_email(&self, email: &StoredEmail) -> Result<bool>;
}

#[cfg(test)]
pub use memory::MemoryStore;
