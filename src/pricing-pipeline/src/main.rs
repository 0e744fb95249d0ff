//! Pricing pipeline - daily market-value estimation for tracked cards.

use std::path::PathBuf;

use anyhow::Result;
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use common::{Config, Database, EbayClient};

mod config;
mod estimator;
mod pipeline;
mod provider;
mod reconciler;
mod scheduler;
mod store;
mod summary;
mod supply;
mod validator;

#[cfg(test)]
mod testing;

use config::PipelineConfig;
use provider::ListingsProvider;
use store::PgPricingStore;

/// Pricing pipeline - tiered refresh, supply, estimates and validation
#[derive(Parser, Debug)]
#[command(name = "pricing-pipeline")]
#[command(about = "Collectible market-value pricing pipeline")]
struct Cli {
    /// Target date (YYYY-MM-DD, default: today in UTC)
    #[arg(long, global = true)]
    date: Option<NaiveDate>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Reclassify every item into a refresh tier and reschedule it
    AssignTiers,

    /// Fetch and reconcile listings for due items
    Refresh {
        /// Maximum due items per pass
        #[arg(long, default_value = "500")]
        max_items: usize,

        /// Delay between item fetches in milliseconds
        #[arg(long, default_value = "500")]
        delay_ms: u64,
    },

    /// Recompute daily supply metrics
    Supply,

    /// Compute daily value estimates
    Estimate {
        #[command(flatten)]
        model: ModelArgs,
    },

    /// Match estimates to verified sales and record accuracy
    Validate {
        #[command(flatten)]
        model: ModelArgs,

        /// Write the Markdown model report to this path
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// Run refresh, supply, estimates and validation in order
    Daily {
        #[command(flatten)]
        model: ModelArgs,

        /// Write the Markdown model report to this path
        #[arg(long)]
        report: Option<PathBuf>,
    },
}

/// Manual calibration overrides.
#[derive(clap::Args, Debug)]
struct ModelArgs {
    /// Shock threshold as a multiple of trailing new volume (e.g., 1.5)
    #[arg(long)]
    shock_multiplier: Option<Decimal>,

    /// Discount applied to shocked estimates (e.g., 0.05 = 5%)
    #[arg(long)]
    shock_discount: Option<Decimal>,

    /// Model version to write and validate
    #[arg(long)]
    model_version: Option<String>,
}

impl ModelArgs {
    fn apply(&self, config: &mut PipelineConfig) -> Result<()> {
        if let Some(multiplier) = self.shock_multiplier {
            if multiplier <= Decimal::ONE {
                anyhow::bail!("shock_multiplier ({}) must be greater than 1", multiplier);
            }
            config.estimator.shock_multiplier = multiplier;
        }
        if let Some(discount) = self.shock_discount {
            if discount < Decimal::ZERO || discount >= Decimal::ONE {
                anyhow::bail!("shock_discount ({}) must be within [0, 1)", discount);
            }
            config.estimator.shock_discount = discount;
        }
        if let Some(version) = &self.model_version {
            config.set_model_version(version);
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging with RUST_LOG env var support (default: info)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .compact()
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let date = cli.date.unwrap_or_else(|| Utc::now().date_naive());

    info!("Pricing pipeline starting for {}", date);

    // Load config and connect to database
    let base_config = Config::from_env()?;
    let db = Database::connect(&base_config).await?;
    db.health_check().await?;
    info!("Database connected");

    let store = PgPricingStore::new(db);

    // Stop between awaits on Ctrl+C; committed items stay committed
    let shutdown = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Cannot listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Shutdown signal received");
    };

    tokio::select! {
        result = run(&cli.command, &base_config, &store, date) => result,
        _ = shutdown => {
            warn!("Interrupted; stage for {} left incomplete", date);
            std::process::exit(130);
        }
    }
}

async fn run(
    command: &Command,
    base_config: &Config,
    store: &PgPricingStore,
    date: NaiveDate,
) -> Result<()> {
    let mut config = PipelineConfig::default();

    match command {
        Command::AssignTiers => {
            let summary = scheduler::assign_tiers(
                store,
                date,
                &config.tiers,
                config.model_version(),
            )
            .await?;
            print_json(&summary)
        }
        Command::Refresh {
            max_items,
            delay_ms,
        } => {
            config.max_items_per_pass = *max_items;
            config.inter_item_delay = std::time::Duration::from_millis(*delay_ms);

            let client = build_client(base_config, &config)?;
            if !client.has_credentials() {
                anyhow::bail!("EBAY_ACCESS_TOKEN is required for listing refresh");
            }
            let summary =
                reconciler::refresh_due_items(store, &client, &config, date, Utc::now()).await?;
            print_json(&summary)
        }
        Command::Supply => {
            let summary = supply::run_supply(store, date).await?;
            print_json(&summary)
        }
        Command::Estimate { model } => {
            model.apply(&mut config)?;
            let summary = estimator::run_estimates(store, date, &config.estimator).await?;
            print_json(&summary)
        }
        Command::Validate { model, report } => {
            model.apply(&mut config)?;
            let summary = validator::run_validation(store, date, &config.validation).await?;
            write_report(report.as_ref(), summary.report.as_deref()).await?;
            print_json(&summary)
        }
        Command::Daily { model, report } => {
            model.apply(&mut config)?;

            let client = build_client(base_config, &config)?;
            let provider: Option<&dyn ListingsProvider> = if client.has_credentials() {
                Some(&client)
            } else {
                None
            };

            let daily = pipeline::run_daily(store, provider, &config, date, Utc::now()).await;

            let report_text = daily.validation.summary().and_then(|s| s.report.as_deref());
            write_report(report.as_ref(), report_text).await?;
            print_json(&daily)?;

            if daily.has_failures() {
                anyhow::bail!("daily run for {} had failed stages", date);
            }
            Ok(())
        }
    }
}

fn build_client(base_config: &Config, config: &PipelineConfig) -> Result<EbayClient> {
    Ok(EbayClient::new(
        base_config,
        config.fetch_timeout,
        config.page_size,
        &config.currency,
    )?)
}

async fn write_report(path: Option<&PathBuf>, report: Option<&str>) -> Result<()> {
    let Some(path) = path else {
        return Ok(());
    };
    match report {
        Some(text) => {
            tokio::fs::write(path, text).await?;
            info!("Model report written to {}", path.display());
        }
        None => warn!("No matched sales; no report written"),
    }
    Ok(())
}

fn print_json<T: Serialize>(summary: &T) -> Result<()> {
    match serde_json::to_string_pretty(summary) {
        Ok(json) => {
            println!("{json}");
            Ok(())
        }
        Err(e) => {
            error!("Failed to serialize summary: {}", e);
            Err(e.into())
        }
    }
}
