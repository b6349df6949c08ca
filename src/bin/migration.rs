use anyhow::{Context, Result};
use checkout_ledger::{config, db, migrator::Migrator};
use clap::{Parser, Subcommand};
use sea_orm_migration::MigratorTrait;
use tracing::info;

#[derive(Parser)]
#[command(name = "migration", about = "Apply or roll back the checkout ledger schema", version)]
struct Cli {
    /// Overrides the configured database URL
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Clone, Copy)]
enum Command {
    /// Apply pending migrations (default)
    Up,
    /// Roll back the last applied migration
    Down,
    /// Drop every table and re-apply all migrations
    Fresh,
    /// Print applied and pending migrations
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config().context("failed to load configuration")?;
    config::init_tracing(cfg.log_level(), cfg.log_json);

    let url = cli.database_url.unwrap_or_else(|| cfg.database_url.clone());
    let pool = db::establish_connection(&url)
        .await
        .context("failed to connect to database")?;

    match cli.command.unwrap_or(Command::Up) {
        Command::Up => db::run_migrations(&pool).await?,
        Command::Down => {
            info!("Rolling back last migration");
            Migrator::down(&pool, Some(1)).await?;
        }
        Command::Fresh => {
            info!("Recreating schema");
            Migrator::fresh(&pool).await?;
        }
        Command::Status => Migrator::status(&pool).await?,
    }

    db::close_pool(pool).await?;
    Ok(())
}
