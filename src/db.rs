use crate::models::{
    Attachment, Credential, MailAccount, MailAccountUpdate, StoredEmail, WebhookJob, WebhookStats,
    WebhookStatus, WebhookTransition,
};
use crate::store::{RecordStore, RetentionFilter};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;
use std::time::Duration;
use tracing::warn;

const WEBHOOK_COLUMNS: &str = "id, url, payload, secret, headers, timeout_ms, status, retry_count, max_retries, \
     last_error, response, response_status, response_duration_ms, created_at, last_attempted_at, completed_at, failed_at";

const ACCOUNT_COLUMNS: &str = "id, name, email, imap_host, imap_port, imap_secure, accept_invalid_certs, \
     smtp_host, smtp_port, smtp_secure, username, password, is_active, last_sync_at, last_error";

const EMAIL_COLUMNS: &str = "id, message_id, account_id, subject, from_address, from_name, to_addresses, \
     cc_addresses, bcc_addresses, text_body, html_body, is_read, is_starred, folder, received_at";

/// SQLite-backed record store.
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(database_url: &str) -> Result<Self> {
        use sqlx::sqlite::SqliteConnectOptions;
        use std::str::FromStr;

        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);

        let pool = SqlitePool::connect_with(options)
            .await
            .with_context(|| format!("Failed to open database {}", database_url))?;
        Ok(Self { pool })
    }

    /// A private in-memory database on a single connection.
    pub async fn in_memory() -> Result<Self> {
        use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
        use std::str::FromStr;

        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    pub async fn run_migrations(&self) -> Result<()> {
        let schema = include_str!("../schema.sql");
        sqlx::query(schema).execute(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Most recently failed jobs, newest first.
    pub async fn recent_failures(&self, limit: i64) -> Result<Vec<WebhookJob>> {
        let rows = sqlx::query(&format!(
            "SELECT {WEBHOOK_COLUMNS} FROM webhook_jobs
             WHERE status = 'failed'
             ORDER BY failed_at DESC
             LIMIT ?"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .filter_map(|row| match webhook_from_row(row) {
                Ok(job) => Some(job),
                Err(e) => {
                    warn!(error = %format!("{:#}", e), "skipping unreadable webhook row");
                    None
                }
            })
            .collect())
    }

    /// Decodes claimable rows one by one. A row that cannot be decoded is
    /// moved to `failed` with the decode error, so it stops blocking the queue.
    async fn claimable_webhooks(&self, rows: Vec<SqliteRow>) -> Result<Vec<WebhookJob>> {
        let mut jobs = Vec::with_capacity(rows.len());
        for row in &rows {
            match webhook_from_row(row) {
                Ok(job) => jobs.push(job),
                Err(e) => {
                    let id: String = row.try_get("id")?;
                    let reason = format!("{:#}", e);
                    warn!(job_id = %id, error = %reason, "marking unreadable webhook as failed");
                    sqlx::query(
                        "UPDATE webhook_jobs SET status = 'failed', last_error = ?, failed_at = ?
                         WHERE id = ? AND status NOT IN ('success', 'failed')",
                    )
                    .bind(reason)
                    .bind(to_millis(Utc::now()))
                    .bind(&id)
                    .execute(&self.pool)
                    .await?;
                }
            }
        }
        Ok(jobs)
    }

    async fn load_attachments(&self, email_id: &str) -> Result<Vec<Attachment>> {
        let rows = sqlx::query(
            "SELECT filename, content_type, size, content FROM email_attachments
             WHERE email_id = ?
             ORDER BY position ASC",
        )
        .bind(email_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| Attachment {
                filename: row.get(0),
                content_type: row.get(1),
                size: row.get::<i64, _>(2) as u64,
                content: row.get(3),
            })
            .collect())
    }
}

fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

/// Both shapes seen in the `headers` column: `[["name", "value"], ...]` pairs
/// and a plain `{"name": "value"}` object.
#[derive(Deserialize)]
#[serde(untagged)]
enum StoredHeaders {
    Pairs(Vec<(String, String)>),
    Object(serde_json::Map<String, serde_json::Value>),
}

impl StoredHeaders {
    fn into_pairs(self) -> Vec<(String, String)> {
        match self {
            StoredHeaders::Pairs(pairs) => pairs,
            StoredHeaders::Object(map) => map
                .into_iter()
                .map(|(name, value)| match value {
                    serde_json::Value::String(s) => (name, s),
                    other => (name, other.to_string()),
                })
                .collect(),
        }
    }
}

fn webhook_from_row(row: &SqliteRow) -> Result<WebhookJob> {
    let status: String = row.get("status");
    let headers: String = row.get("headers");
    let response: Option<String> = row.get("response");

    Ok(WebhookJob {
        id: row.get("id"),
        url: row.get("url"),
        payload: row.get("payload"),
        secret: row.get::<Option<String>, _>("secret").map(Credential::new),
        headers: serde_json::from_str::<StoredHeaders>(&headers)
            .context("Malformed webhook headers column")?
            .into_pairs(),
        timeout: Duration::from_millis(row.get::<i64, _>("timeout_ms").max(0) as u64),
        status: WebhookStatus::parse(&status)
            .ok_or_else(|| anyhow::anyhow!("Unknown webhook status {}", status))?,
        retry_count: row.get::<i64, _>("retry_count") as u32,
        max_retries: row.get::<i64, _>("max_retries") as u32,
        last_error: row.get("last_error"),
        response: response.map(|r| serde_json::from_str(&r)).transpose()?,
        response_status: row.get::<Option<i64>, _>("response_status").map(|s| s as u16),
        response_duration_ms: row
            .get::<Option<i64>, _>("response_duration_ms")
            .map(|ms| ms.max(0) as u64),
        created_at: from_millis(row.get("created_at")),
        last_attempted_at: row.get::<Option<i64>, _>("last_attempted_at").map(from_millis),
        completed_at: row.get::<Option<i64>, _>("completed_at").map(from_millis),
        failed_at: row.get::<Option<i64>, _>("failed_at").map(from_millis),
    })
}

fn account_from_row(row: &SqliteRow) -> MailAccount {
    MailAccount {
        id: row.get("id"),
        name: row.get("name"),
        email: row.get("email"),
        imap_host: row.get("imap_host"),
        imap_port: row.get::<i64, _>("imap_port") as u16,
        imap_secure: row.get("imap_secure"),
        accept_invalid_certs: row.get("accept_invalid_certs"),
        smtp_host: row.get("smtp_host"),
        smtp_port: row.get::<i64, _>("smtp_port") as u16,
        smtp_secure: row.get("smtp_secure"),
        username: row.get("username"),
        password: Credential::new(row.get::<String, _>("password")),
        is_active: row.get("is_active"),
        last_sync_at: row.get::<Option<i64>, _>("last_sync_at").map(from_millis),
        last_error: row.get("last_error"),
    }
}

fn email_from_row(row: &SqliteRow) -> Result<StoredEmail> {
    let addresses = |column: &str| -> Result<Vec<String>> {
        serde_json::from_str(&row.get::<String, _>(column))
            .with_context(|| format!("Malformed {} column", column))
    };

    Ok(StoredEmail {
        id: row.get("id"),
        message_id: row.get("message_id"),
        account_id: row.get("account_id"),
        subject: row.get("subject"),
        from_address: row.get("from_address"),
        from_name: row.get("from_name"),
        to_addresses: addresses("to_addresses")?,
        cc_addresses: addresses("cc_addresses")?,
        bcc_addresses: addresses("bcc_addresses")?,
        text_body: row.get("text_body"),
        html_body: row.get("html_body"),
        attachments: Vec::new(),
        is_read: row.get("is_read"),
        is_starred: row.get("is_starred"),
        folder: row.get("folder"),
        received_at: from_millis(row.get("received_at")),
    })
}

#[async_trait]
impl RecordStore for Database {
    async fn find_pending_webhooks(
        &self,
        limit: usize,
        max_retries: u32,
    ) -> Result<Vec<WebhookJob>> {
        let rows = sqlx::query(&format!(
            "SELECT {WEBHOOK_COLUMNS} FROM webhook_jobs
             WHERE status = 'pending' AND retry_count < max_retries AND retry_count < ?
             ORDER BY created_at ASC
             LIMIT ?"
        ))
        .bind(max_retries as i64)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        self.claimable_webhooks(rows).await
    }

    async fn find_stale_processing_webhooks(
        &self,
        started_before: DateTime<Utc>,
    ) -> Result<Vec<WebhookJob>> {
        let rows = sqlx::query(&format!(
            "SELECT {WEBHOOK_COLUMNS} FROM webhook_jobs
             WHERE status = 'processing'
               AND (last_attempted_at IS NULL OR last_attempted_at < ?)
             ORDER BY created_at ASC"
        ))
        .bind(to_millis(started_before))
        .fetch_all(&self.pool)
        .await?;

        self.claimable_webhooks(rows).await
    }

    async fn insert_webhook(&self, job: &WebhookJob) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO webhook_jobs ({WEBHOOK_COLUMNS})
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(&job.id)
        .bind(&job.url)
        .bind(&job.payload)
        .bind(job.secret.as_ref().map(|s| s.expose().to_string()))
        .bind(serde_json::to_string(&job.headers)?)
        .bind(job.timeout.as_millis() as i64)
        .bind(job.status.as_str())
        .bind(job.retry_count as i64)
        .bind(job.max_retries as i64)
        .bind(&job.last_error)
        .bind(job.response.as_ref().map(|r| r.to_string()))
        .bind(job.response_status.map(|s| s as i64))
        .bind(job.response_duration_ms.map(|ms| ms as i64))
        .bind(to_millis(job.created_at))
        .bind(job.last_attempted_at.map(to_millis))
        .bind(job.completed_at.map(to_millis))
        .bind(job.failed_at.map(to_millis))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_webhook(&self, id: &str, transition: &WebhookTransition) -> Result<()> {
        // Terminal rows are immutable; the status guard makes a late write a no-op.
        let query = match transition {
            WebhookTransition::Processing { attempted_at } => sqlx::query(
                "UPDATE webhook_jobs SET status = 'processing', last_attempted_at = ?
                 WHERE id = ? AND status NOT IN ('success', 'failed')",
            )
            .bind(to_millis(*attempted_at)),
            WebhookTransition::Succeeded {
                response,
                response_status,
                response_duration_ms,
                completed_at,
            } => sqlx::query(
                "UPDATE webhook_jobs SET status = 'success', response = ?, response_status = ?,
                     response_duration_ms = ?, completed_at = ?
                 WHERE id = ? AND status NOT IN ('success', 'failed')",
            )
            .bind(response.to_string())
            .bind(*response_status as i64)
            .bind(*response_duration_ms as i64)
            .bind(to_millis(*completed_at)),
            WebhookTransition::Retrying {
                retry_count,
                last_error,
                response_status,
            } => sqlx::query(
                "UPDATE webhook_jobs SET status = 'pending', retry_count = ?, last_error = ?, response_status = ?, failed_at = NULL
                 WHERE id = ? AND status NOT IN ('success', 'failed')",
            )
            .bind(*retry_count as i64)
            .bind(last_error.clone())
            .bind(response_status.map(|s| s as i64)),
            WebhookTransition::Failed {
                retry_count,
                last_error,
                response_status,
                failed_at,
            } => sqlx::query(
                "UPDATE webhook_jobs SET status = 'failed', retry_count = ?, last_error = ?, response_status = ?, failed_at = ?
                 WHERE id = ? AND status NOT IN ('success', 'failed')",
            )
            .bind(*retry_count as i64)
            .bind(last_error.clone())
            .bind(response_status.map(|s| s as i64))
            .bind(to_millis(*failed_at)),
        };

        let result = query.bind(id).execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            anyhow::bail!("webhook {} not found or already terminal", id);
        }
        Ok(())
    }

    async fn delete_webhooks(&self, filter: &RetentionFilter) -> Result<u64> {
        let cutoff = to_millis(filter.terminal_before);
        let result = sqlx::query(
            "DELETE FROM webhook_jobs
             WHERE (status = 'success' AND completed_at < ?)
                OR (status = 'failed' AND failed_at < ?)",
        )
        .bind(cutoff)
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn webhook_stats(&self) -> Result<WebhookStats> {
        let rows = sqlx::query("SELECT status, COUNT(*) FROM webhook_jobs GROUP BY status")
            .fetch_all(&self.pool)
            .await?;

        let mut stats = WebhookStats::default();
        for row in rows {
            let status: String = row.get(0);
            let count: i64 = row.get(1);
            if let Some(status) = WebhookStatus::parse(&status) {
                stats.add(status, count as u64);
            }
        }
        Ok(stats)
    }

    async fn find_active_mail_accounts(&self) -> Result<Vec<MailAccount>> {
        let rows = sqlx::query(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM mail_accounts WHERE is_active = 1 ORDER BY email ASC"
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(account_from_row).collect())
    }

    async fn insert_mail_account(&self, account: &MailAccount) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO mail_accounts ({ACCOUNT_COLUMNS})
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(&account.id)
        .bind(&account.name)
        .bind(&account.email)
        .bind(&account.imap_host)
        .bind(account.imap_port as i64)
        .bind(account.imap_secure)
        .bind(account.accept_invalid_certs)
        .bind(&account.smtp_host)
        .bind(account.smtp_port as i64)
        .bind(account.smtp_secure)
        .bind(&account.username)
        .bind(account.password.expose())
        .bind(account.is_active)
        .bind(account.last_sync_at.map(to_millis))
        .bind(&account.last_error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_mail_account(&self, id: &str, update: &MailAccountUpdate) -> Result<()> {
        sqlx::query("UPDATE mail_accounts SET last_sync_at = ?, last_error = ? WHERE id = ?")
            .bind(to_millis(update.last_sync_at))
            .bind(&update.last_error)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn find_email_by_message_id(
        &self,
        account_id: &str,
        message_id: &str,
    ) -> Result<Option<StoredEmail>> {
        let row = sqlx::query(&format!(
            "SELECT {EMAIL_COLUMNS} FROM emails WHERE account_id = ? AND message_id = ?"
        ))
        .bind(account_id)
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(r) = row {
            let mut email = email_from_row(&r)?;
            email.attachments = self.load_attachments(&email.id).await?;
            Ok(Some(email))
        } else {
            Ok(None)
        }
    }

    async fn contains_email(&self, account_id: &str, message_id: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM emails WHERE account_id = ? AND message_id = ? LIMIT 1")
            .bind(account_id)
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn insert_email(&self, email: &StoredEmail) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(&format!(
            "INSERT INTO emails ({EMAIL_COLUMNS})
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(message_id, account_id) DO NOTHING"
        ))
        .bind(&email.id)
        .bind(&email.message_id)
        .bind(&email.account_id)
        .bind(&email.subject)
        .bind(&email.from_address)
        .bind(&email.from_name)
        .bind(serde_json::to_string(&email.to_addresses)?)
        .bind(serde_json::to_string(&email.cc_addresses)?)
        .bind(serde_json::to_string(&email.bcc_addresses)?)
        .bind(&email.text_body)
        .bind(&email.html_body)
        .bind(email.is_read)
        .bind(email.is_starred)
        .bind(&email.folder)
        .bind(to_millis(email.received_at))
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        for (position, attachment) in email.attachments.iter().enumerate() {
            sqlx::query(
                "INSERT INTO email_attachments (email_id, position, filename, content_type, size, content)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(&email.id)
            .bind(position as i64)
            .bind(&attachment.filename)
            .bind(&attachment.content_type)
            .bind(attachment.size as i64)
            .bind(&attachment.content)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(true)
    }
}
