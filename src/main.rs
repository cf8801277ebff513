//! quotebot - automated liquidity-rewards market maker.
//!
//! One process, one binary market: resolves (or discovers) the market,
//! reconciles position, then quotes both sides until told to stop.

use anyhow::Result;
use clap::Parser;
use dotenv::dotenv;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use quotebot::config::Config;
use quotebot::engine;

#[derive(Debug, Parser)]
#[command(name = "quotebot", about = "Liquidity-rewards market maker for a binary CLOB")]
struct Cli {
    /// Make every decision but never touch the venue or the chain.
    #[arg(long, env = "DRY_RUN")]
    dry_run: bool,

    /// Run discovery, log the ranking, and exit.
    #[arg(long)]
    discover: bool,

    /// Quote this market instead of discovering one.
    #[arg(long, env = "MARKET_SLUG")]
    market_slug: Option<String>,

    /// Wind the session's market down: cancel, merge what is neutral, and
    /// mark it so discovery skips it.
    #[arg(long, env = "LIQUIDATE")]
    liquidate: bool,

    /// Directory for persisted fill history.
    #[arg(long, env = "DATA_DIR")]
    data_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut cfg = Config::from_env();
    if cli.dry_run {
        cfg.dry_run = true;
    }
    if cli.liquidate {
        cfg.liquidate = true;
    }
    if let Some(slug) = cli.market_slug {
        cfg.market_slug = Some(slug);
    }
    if let Some(data_dir) = cli.data_dir {
        cfg.data_dir = data_dir;
    }

    if let Err(e) = cfg.validate() {
        error!("invalid configuration: {e:#}");
        return ExitCode::from(2);
    }

    info!(
        dry_run = cfg.dry_run,
        market_slug = cfg.market_slug.as_deref().unwrap_or("<discover>"),
        order_size = cfg.quoting.order_size,
        spread_percent = cfg.quoting.spread_percent,
        max_net_exposure = cfg.limits.max_net_exposure,
        data_dir = %cfg.data_dir.display(),
        "starting"
    );

    let outcome: Result<()> = if cli.discover {
        engine::run_discovery(&cfg).await
    } else {
        engine::run_market_maker(cfg).await
    };

    match outcome {
        Ok(()) => {
            info!("clean shutdown");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}
