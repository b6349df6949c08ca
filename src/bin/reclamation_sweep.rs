use anyhow::{Context, Result};
use checkout_ledger::{clock::SystemClock, config, db, events, AppServices};
use clap::{ArgAction, Parser};
use std::sync::Arc;
use std::time::Duration;
use tokio::{signal, sync::watch};
use tracing::{info, warn};

#[derive(Parser)]
#[command(
    name = "reclamation-sweep",
    about = "Abandon, expire and delete idle checkouts",
    version
)]
struct Cli {
    /// Run a single sweep and exit
    #[arg(long, action = ArgAction::SetTrue)]
    once: bool,
    /// Seconds between runs; defaults to `sweep.interval_secs`
    #[arg(long)]
    interval_secs: Option<u64>,
    /// Apply pending migrations before sweeping
    #[arg(long, action = ArgAction::SetTrue)]
    migrate: bool,
    /// Print the report of a single run as JSON
    #[arg(long, action = ArgAction::SetTrue)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config().context("failed to load configuration")?;
    config::init_tracing(cfg.log_level(), cfg.log_json);

    let pool = db::establish_connection_from_app_config(&cfg)
        .await
        .context("failed to connect to database")?;
    if cli.migrate || cfg.auto_migrate {
        db::run_migrations(&pool).await?;
    }

    let db_arc = Arc::new(pool);
    let (services, event_rx) = AppServices::build(db_arc.clone(), &cfg, Arc::new(SystemClock));
    let events_handle = tokio::spawn(events::process_events(event_rx));

    if cli.once {
        let report = services.sweep.run_once().await?;
        if cli.json {
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    } else if !cfg.sweep.enabled {
        warn!("Sweep disabled by configuration; use --once to force a run");
    } else {
        let interval = cli
            .interval_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| cfg.sweep.interval());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let sweep = services.sweep.clone();
        let runner = tokio::spawn(async move { sweep.run_periodic(interval, shutdown_rx).await });

        signal::ctrl_c().await.context("failed to listen for shutdown signal")?;
        info!("Shutdown signal received");
        let _ = shutdown_tx.send(true);
        runner.await.context("sweep loop panicked")?;
    }

    drop(services);
    let _ = events_handle.await;
    if let Ok(pool) = Arc::try_unwrap(db_arc) {
        db::close_pool(pool).await?;
    }
    Ok(())
}
