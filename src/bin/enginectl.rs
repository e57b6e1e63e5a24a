// src/bin/enginectl.rs
// Operator CLI for the storefront engine: one-shot maintenance commands that
// share the same config, pool, and collaborators as the server.
//
// Exit codes: 0 success, 1 recoverable error (upstream/transient), 2
// configuration error (bad flags, missing credentials).

use clap::{Parser, Subcommand};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::path::PathBuf;
use std::process::ExitCode;
use std::str::FromStr;
use tracing::{error, info};

use storefront_engine::config::CONFIG;
use storefront_engine::domain::RecordKind;
use storefront_engine::AppState;

#[derive(Parser)]
#[command(name = "enginectl", about = "Operator CLI for the storefront engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Full diff-and-converge pass for one catalog kind.
    Reconcile {
        #[arg(value_enum)]
        kind: CliRecordKind,
    },
    /// Re-walks the knowledge-base directory and re-indexes changed files.
    ReloadKnowledge { dir: PathBuf },
    /// Runs the hourly+daily rollup for the completed prior bucket(s) now.
    AggregateNow,
    /// Runs the retention sweep now.
    RetentionNow,
    /// Prints the same payload `GET /health` would return.
    Health,
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum CliRecordKind {
    Product,
    Category,
    Knowledge,
}

impl From<CliRecordKind> for RecordKind {
    fn from(k: CliRecordKind) -> Self {
        match k {
            CliRecordKind::Product => RecordKind::Product,
            CliRecordKind::Category => RecordKind::Category,
            CliRecordKind::Knowledge => RecordKind::Knowledge,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt().with_env_filter(CONFIG.logging.level.clone()).init();

    if let Err(e) = CONFIG.validate() {
        error!(error = %e, "configuration error");
        return ExitCode::from(2);
    }

    let cli = Cli::parse();

    let connect_options = match SqliteConnectOptions::from_str(&CONFIG.database.url) {
        Ok(opts) => opts.create_if_missing(true),
        Err(e) => {
            error!(error = %e, "invalid DATABASE_URL");
            return ExitCode::from(2);
        }
    };
    let pool = match SqlitePoolOptions::new()
        .max_connections(CONFIG.database.max_connections)
        .connect_with(connect_options)
        .await
    {
        Ok(p) => p,
        Err(e) => {
            error!(error = %e, "failed to connect to database");
            return ExitCode::from(1);
        }
    };
    if let Err(e) = sqlx::migrate!("./migrations").run(&pool).await {
        error!(error = %e, "failed to run migrations");
        return ExitCode::from(1);
    }

    let app_state = match AppState::new(pool).await {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to initialize application state");
            return ExitCode::from(2);
        }
    };

    let result = match cli.command {
        Command::Reconcile { kind } => run_reconcile(&app_state, kind.into()).await,
        Command::ReloadKnowledge { dir } => run_reload_knowledge(&app_state, &dir).await,
        Command::AggregateNow => run_aggregate_now(&app_state).await,
        Command::RetentionNow => run_retention_now(&app_state).await,
        Command::Health => run_health(&app_state).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "command failed");
            ExitCode::from(1)
        }
    }
}

async fn run_reconcile(app_state: &AppState, kind: RecordKind) -> anyhow::Result<()> {
    let report = app_state.sync_engine.reconcile(kind).await?;
    info!(
        kind = kind.as_str(),
        upserted = report.upserted,
        deleted = report.deleted,
        unchanged = report.unchanged,
        "reconcile complete"
    );
    Ok(())
}

async fn run_reload_knowledge(app_state: &AppState, dir: &std::path::Path) -> anyhow::Result<()> {
    storefront_engine::knowledge::validate_dir_exists(dir)?;
    let count = app_state.knowledge_loader.reload(dir).await?;
    info!(count, dir = %dir.display(), "knowledge base reloaded");
    Ok(())
}

async fn run_aggregate_now(app_state: &AppState) -> anyhow::Result<()> {
    let now = chrono::Utc::now();
    let hourly = app_state.aggregator.hourly_rollup(now - chrono::Duration::hours(1)).await?;
    let daily = app_state.aggregator.daily_rollup(now - chrono::Duration::days(1)).await?;
    info!(hourly_buckets = hourly.len(), daily_buckets = daily.len(), "aggregate run complete");
    Ok(())
}

async fn run_retention_now(app_state: &AppState) -> anyhow::Result<()> {
    let (messages, conversations) = app_state
        .aggregator
        .run_retention(
            chrono::Utc::now(),
            CONFIG.session.message_retention_days,
            CONFIG.session.conversation_retention_days,
        )
        .await?;
    info!(messages, conversations, "retention sweep complete");
    Ok(())
}

async fn run_health(app_state: &AppState) -> anyhow::Result<()> {
    let database_ok = sqlx::query("SELECT 1").fetch_one(&app_state.pool).await.is_ok();
    let embeddings_ok = app_state.embeddings.health_check().await;
    let llm_ok = app_state.llm.health_check().await;
    let catalog_ok = app_state.catalog.health_check().await;

    println!(
        "{}",
        serde_json::json!({
            "status": if !database_ok { "unhealthy" } else if !embeddings_ok || !llm_ok || !catalog_ok { "degraded" } else { "healthy" },
            "services": {
                "database": database_ok,
                "embeddings": embeddings_ok,
                "llm": llm_ok,
                "catalog": catalog_ok,
            }
        })
    );
    Ok(())
}
