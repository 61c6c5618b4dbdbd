use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use leadsync_engine::{
    AlertSink, NoopAlertSink, SyncConfig, SyncEngine, WebhookAlertSink,
};
use leadsync_source::{HttpLeadSource, HttpSourceConfig, TokenBucketConfig};
use leadsync_store::{LeadStore, PgLeadStore};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "leadsync-cli")]
#[command(about = "Lead synchronization engine command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the web ingress (and the scheduler when enabled).
    Serve,
    /// Sync one client now.
    Sync { client_id: String },
    /// Sync every client, least-recently-synced first.
    SyncAll,
    /// Pull one page of the global positive pool into the store.
    Backfill {
        #[arg(long, default_value_t = 100)]
        limit: u32,
        #[arg(long)]
        starting_after: Option<String>,
    },
    /// Remove local leads the external source no longer lists.
    Cleanup {
        #[arg(long)]
        client_id: Option<String>,
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
    /// Apply pending database migrations.
    Migrate,
    /// Wipe synced leads and the email cache.
    Reset {
        #[arg(long, default_value_t = false)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            let engine = build_engine().await?;
            let scheduler = engine.maybe_build_scheduler().await?;
            if let Some(scheduler) = &scheduler {
                scheduler
                    .start()
                    .await
                    .map_err(|err| anyhow::anyhow!("starting scheduler: {err}"))?;
                info!(cron = %engine.config().sync_cron, "scheduler started");
            }
            leadsync_web::serve_from_env(engine).await?;
        }
        Commands::Sync { client_id } => {
            let engine = build_engine().await?;
            let summary = engine.sync_client_data(&client_id).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::SyncAll => {
            let engine = build_engine().await?;
            let summary = engine.sync_all_clients().await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Backfill {
            limit,
            starting_after,
        } => {
            let engine = build_engine().await?;
            let summary = engine.backfill_positives(limit, starting_after).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Cleanup { client_id, dry_run } => {
            let engine = build_engine().await?;
            let report = engine
                .cleanup_campaigns(client_id.as_deref(), dry_run)
                .await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Migrate => {
            let store = connect_store().await?;
            store.run_migrations().await?;
            println!("migrations applied");
        }
        Commands::Reset { yes } => {
            if !yes {
                anyhow::bail!("reset wipes all synced leads and cached emails; pass --yes to confirm");
            }
            let store = connect_store().await?;
            store.reset_all().await?;
            println!("store reset");
        }
    }

    Ok(())
}

async fn connect_store() -> Result<PgLeadStore> {
    let database_url =
        std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    PgLeadStore::connect(&database_url)
        .await
        .context("connecting to the database")
}

async fn build_engine() -> Result<Arc<SyncEngine>> {
    let store = connect_store().await?;
    store.run_migrations().await?;

    let api_key =
        std::env::var("LEADSYNC_API_KEY").context("LEADSYNC_API_KEY must be set")?;
    let mut source_config = HttpSourceConfig {
        api_key,
        token_bucket: Some(TokenBucketConfig {
            capacity: 10,
            refill_every: Duration::from_secs(1),
        }),
        ..HttpSourceConfig::default()
    };
    if let Ok(base_url) = std::env::var("LEADSYNC_API_BASE_URL") {
        source_config.base_url = base_url;
    }
    let source = HttpLeadSource::new(source_config)?;

    let alerts: Arc<dyn AlertSink> = match std::env::var("LEADSYNC_ALERT_WEBHOOK_URL") {
        Ok(url) if !url.is_empty() => Arc::new(WebhookAlertSink::new(url)?),
        _ => Arc::new(NoopAlertSink),
    };

    Ok(Arc::new(SyncEngine::new(
        SyncConfig::from_env(),
        Arc::new(source),
        Arc::new(store),
        alerts,
    )))
}
