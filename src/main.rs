use crm_workers::config::Config;
use crm_workers::db::Database;
use crm_workers::mailbox::MailboxSyncProcessor;
use crm_workers::mailbox::imap::ImapConnector;
use crm_workers::poller::Poller;
use crm_workers::store::RecordStore;
use crm_workers::webhook::WebhookProcessor;
use crm_workers::webhook::retention::RetentionSweep;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let debug_logging = std::env::args().any(|arg| arg == "--debug");
    let run_once = std::env::args().any(|arg| arg == "--once");
    let webhooks_enabled = !std::env::args().any(|arg| arg == "--no-webhooks");
    let mailbox_enabled = !std::env::args().any(|arg| arg == "--no-mailbox");

    let default_level = if debug_logging { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let config = Config::load();
    let db = Arc::new(Database::new(&config.database_url).await?);
    db.run_migrations().await?;
    let store: Arc<dyn RecordStore> = db.clone();

    let webhooks = if webhooks_enabled {
        let processor = WebhookProcessor::new(store.clone(), &config.webhook)?;
        Some((
            Poller::new(processor, config.webhook.interval()),
            Poller::new(
                RetentionSweep::new(store.clone(), &config.retention),
                config.retention.interval(),
            ),
        ))
    } else {
        None
    };

    let mailbox = if mailbox_enabled {
        let connector = Arc::new(ImapConnector::new(config.mailbox.connect_timeout()));
        let processor = MailboxSyncProcessor::new(store.clone(), connector, config.mailbox.clone());
        Some(Poller::new(processor, config.mailbox.interval()))
    } else {
        None
    };

    if run_once {
        if let Some((delivery, retention)) = &webhooks {
            delivery.run_once().await;
            retention.run_once().await;
        }
        if let Some(mailbox) = &mailbox {
            mailbox.run_once().await;
        }
        db.close().await;
        return Ok(());
    }

    if let Some((delivery, retention)) = &webhooks {
        delivery.start().await;
        retention.start().await;
    }
    if let Some(mailbox) = &mailbox {
        mailbox.start().await;
    }
    info!(
        webhooks = webhooks_enabled,
        mailbox = mailbox_enabled,
        "workers running, press Ctrl+C to stop"
    );

    shutdown_signal().await;
    info!("shutting down");

    if let Some((delivery, retention)) = &webhooks {
        delivery.stop().await;
        retention.stop().await;
    }
    if let Some(mailbox) = &mailbox {
        mailbox.stop().await;
    }
    db.close().await;
    info!("workers stopped");
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal;
    let ctrl_c = async {
        signal::ctrl_c().await.ok();
    };
    #[cfg(unix)]
    let term = async {
        if let Ok(mut s) = signal::unix::signal(signal::unix::SignalKind::terminate()) {
            s.recv().await;
        }
    };
    #[cfg(not(unix))]
    let term = std::future::pending::<()>();
    tokio::select! { _ = ctrl_c => {}, _ = term => {} }
}
