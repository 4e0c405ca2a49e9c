use std::fs;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use eventstore::config::DatabaseConfig;
use eventstore::{EventStore, StoreConfig};
use shared::ReferenceData;
use sqlx::postgres::PgPoolOptions;

#[derive(Parser)]
#[command(name = "seeder")]
#[command(about = "Schema and reference-data loading utility for the billing event store")]
struct Args {
    /// Path to a reference-data snapshot (JSON) to install.
    #[arg(long)]
    config: Option<String>,

    /// Rebuild the derived events and billable component tables.
    #[arg(long)]
    refresh: bool,

    /// Consolidate every fully elapsed month after loading.
    #[arg(long)]
    consolidate: bool,

    /// Connection string; falls back to DATABASE_URL.
    #[arg(long)]
    database_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "seeder=info,eventstore=info".into()),
        )
        .init();

    let args = Args::parse();

    println!("{}", "=".repeat(80).cyan());
    println!("{}", "Billing Event Store Seeder".bold().cyan());
    println!("{}", "=".repeat(80).cyan());
    println!();

    let (connection_string, max_connections) = match args.database_url {
        Some(url) => (url, 5),
        None => {
            let db = DatabaseConfig::from_env().context("database configuration")?;
            (db.connection_string, db.max_connections)
        }
    };

    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(&connection_string)
        .await
        .context("Failed to connect to database")?;

    let store_config = StoreConfig::from_env().context("store configuration")?;
    let store = EventStore::with_config(pool, store_config);

    let start_time = Instant::now();

    store.init().await.context("Failed to initialise schema")?;
    println!("{} Schema initialised", "✓".green());

    if let Some(ref path) = args.config {
        println!("{} Loading reference data from: {}", "ℹ".blue(), path);
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        let snapshot = ReferenceData::from_json(&raw)
            .with_context(|| format!("Failed to parse config file: {path}"))?;
        store
            .store_reference_data(&snapshot)
            .await
            .context("Failed to install reference data")?;
        println!(
            "{} Installed {} plans, {} VAT rates, {} currency rates",
            "✓".green(),
            snapshot.pricing_plans.len(),
            snapshot.vat_rates.len(),
            snapshot.currency_rates.len(),
        );
    }

    if args.refresh {
        store.refresh().await.context("Failed to refresh derived tables")?;
        println!("{} Derived tables refreshed", "✓".green());
    }

    if args.consolidate {
        store.consolidate_all().await.context("Failed to consolidate")?;
        println!("{} Elapsed months consolidated", "✓".green());
    }

    let elapsed = start_time.elapsed();
    println!();
    println!("{}", "=".repeat(80).cyan());
    println!(
        "{} Done in {:.2}s",
        "✓".green().bold(),
        elapsed.as_secs_f64()
    );
    println!("{}", "=".repeat(80).cyan());

    Ok(())
}
