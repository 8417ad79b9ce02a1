//! Inbound mail sync.
//!
//! Every cycle walks the active accounts in batches, syncing the accounts of
//! one batch concurrently. Only unseen messages are fetched; the
//! `(message_id, account_id)` key keeps repeated fetches from duplicating rows.

pub mod imap;
pub mod parse;

use crate::config::MailboxConfig;
use crate::error::MailboxError;
use crate::models::{MailAccount, MailAccountUpdate, StoredEmail};
use crate::poller::{CycleReport, Processor};
use crate::store::RecordStore;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use imap::{MailboxConnector, MailboxSession};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// What one account sync did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub unseen: usize,
    pub stored: usize,
    pub duplicates: usize,
    pub unparseable: usize,
    /// Session-level failure, as recorded on the account.
    pub error: Option<String>,
}

#[derive(Clone)]
pub struct MailboxSyncProcessor {
    store: Arc<dyn RecordStore>,
    connector: Arc<dyn MailboxConnector>,
    config: MailboxConfig,
}

impl MailboxSyncProcessor {
    pub fn new(
        store: Arc<dyn RecordStore>,
        connector: Arc<dyn MailboxConnector>,
        config: MailboxConfig,
    ) -> Self {
        Self {
            store,
            connector,
            config,
        }
    }

    /// Syncs one account and records the attempt on it. Never fails:
    /// session errors end up in the account's `last_error`.
    pub async fn sync_account(&self, account: &MailAccount) -> SyncReport {
        let folder = self.config.folder.as_str();
        let mut report = SyncReport::default();
        debug!(account = %account.email, folder, "syncing mailbox");

        let session_timeout = self.config.session_timeout();
        let result = match self.connector.open(account, folder).await {
            Ok(mut session) => {
                let result = tokio::time::timeout(
                    session_timeout,
                    self.sync_session(account, session.as_mut(), &mut report),
                )
                .await
                .unwrap_or(Err(MailboxError::Timeout(session_timeout)));

                if tokio::time::timeout(session_timeout, session.close())
                    .await
                    .is_err()
                {
                    warn!(account = %account.email, "logout timed out, dropping session");
                }
                result
            }
            Err(e) => Err(e),
        };

        if let Err(e) = &result {
            warn!(account = %account.email, error = %e, "mailbox sync failed");
            report.error = Some(e.to_string());
        } else if report.stored > 0 {
            info!(
                account = %account.email,
                stored = report.stored,
                duplicates = report.duplicates,
                "new messages stored"
            );
        }

        let update = MailAccountUpdate {
            last_sync_at: Utc::now(),
            last_error: report.error.clone(),
        };
        if let Err(e) = self.store.update_mail_account(&account.id, &update).await {
            error!(account = %account.email, error = %format!("{:#}", e), "could not record sync result");
        }
        report
    }

    async fn sync_session(
        &self,
        account: &MailAccount,
        session: &mut dyn MailboxSession,
        report: &mut SyncReport,
    ) -> Result<(), MailboxError> {
        let uids = session.search_unseen().await?;
        report.unseen = uids.len();
        if uids.is_empty() {
            return Ok(());
        }
        debug!(account = %account.email, count = uids.len(), "unseen messages");

        for chunk in uids.chunks(self.config.message_batch_size.max(1)) {
            for raw in session.fetch(chunk).await? {
                let email =
                    match parse::parse_message(&raw, &account.id, &self.config.folder, Utc::now()) {
                        Ok(email) => email,
                        Err(e) => {
                            warn!(account = %account.email, uid = raw.uid, error = %e, "unparseable message skipped");
                            report.unparseable += 1;
                            continue;
                        }
                    };

                match self.store_email(&email).await {
                    Ok(true) => report.stored += 1,
                    Ok(false) => report.duplicates += 1,
                    Err(e) => {
                        error!(
                            account = %account.email,
                            message_id = %email.message_id,
                            error = %format!("{:#}", e),
                            "could not store message"
                        );
                    }
                }
            }
        }
        Ok(())
    }

    /// Returns `false` for a message already stored for the account.
    async fn store_email(&self, email: &StoredEmail) -> Result<bool> {
        if self
            .store
            .contains_email(&email.account_id, &email.message_id)
            .await?
        {
            return Ok(false);
        }
        self.store.insert_email(email).await
    }
}

#[async_trait]
impl Processor for MailboxSyncProcessor {
    fn name(&self) -> &'static str {
        "mailbox"
    }

    async fn run_cycle(&self) -> Result<CycleReport> {
        let accounts = self
            .store
            .find_active_mail_accounts()
            .await
            .context("Failed to load active mail accounts")?;

        let mut report = CycleReport {
            items: accounts.len(),
            ..Default::default()
        };

        let batch_size = self.config.account_batch_size.max(1);
        for (i, batch) in accounts.chunks(batch_size).enumerate() {
            if i > 0 && !self.config.batch_pause().is_zero() {
                tokio::time::sleep(self.config.batch_pause()).await;
            }

            let mut tasks = JoinSet::new();
            for account in batch {
                let this = self.clone();
                let account = account.clone();
                tasks.spawn(async move { this.sync_account(&account).await });
            }

            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(sync) if sync.error.is_none() => report.succeeded += 1,
                    Ok(_) => report.failed += 1,
                    Err(e) => {
                        error!(error = %e, "account sync task panicked");
                        report.failed += 1;
                    }
                }
            }
        }
        Ok(report)
    }
}
