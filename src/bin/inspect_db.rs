use crm_workers::config::Config;
use crm_workers::db::Database;
use crm_workers::store::RecordStore;
use crm_workers::webhook::retention::RetentionSweep;
use std::env;
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().collect();
    let config = Config::load();
    let db = Arc::new(Database::new(&config.database_url).await?);
    db.run_migrations().await?;

    if let Some(pos) = args.iter().position(|a| a == "--cleanup") {
        let Some(days) = args.get(pos + 1).and_then(|d| d.parse::<i64>().ok()) else {
            eprintln!("Usage: {} [--cleanup <days>]", args[0]);
            std::process::exit(1);
        };
        let sweep = RetentionSweep::with_max_age_days(db.clone(), days);
        let deleted = sweep.sweep(chrono::Utc::now()).await?;
        println!("Deleted {} webhook jobs older than {} days", deleted, days);
        db.close().await;
        return Ok(());
    }

    let stats = db.webhook_stats().await?;
    println!("Webhook jobs: {}", stats.total);
    println!("  pending:    {}", stats.pending);
    println!("  processing: {}", stats.processing);
    println!("  success:    {}", stats.success);
    println!("  failed:     {}", stats.failed);

    let failures = db.recent_failures(10).await?;
    if !failures.is_empty() {
        println!(
            "--------------------------------------------------------------------------------"
        );
        println!("Recent failures:");
        for job in failures {
            println!(
                "{}  {}  retries={}  status={}  error={}",
                job.failed_at
                    .map(|at| at.to_rfc3339())
                    .unwrap_or_else(|| "-".to_string()),
                job.url,
                job.retry_count,
                job.response_status
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "-".to_string()),
                job.last_error.as_deref().unwrap_or("(none)"),
            );
        }
    }

    let accounts = db.find_active_mail_accounts().await?;
    if !accounts.is_empty() {
        println!(
            "--------------------------------------------------------------------------------"
        );
        println!("Active mail accounts:");
        for account in accounts {
            println!(
                "{}  last_sync={}  last_error={}",
                account.email,
                account
                    .last_sync_at
                    .map(|at| at.to_rfc3339())
                    .unwrap_or_else(|| "never".to_string()),
                account.last_error.as_deref().unwrap_or("(none)"),
            );
        }
    }

    db.close().await;
    Ok(())
}
