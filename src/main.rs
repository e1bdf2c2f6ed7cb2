//! PolyHybrid trading engine
//!
//! Loads configuration, wires the gateway and collaborators, then runs the
//! orchestrator until Ctrl-C or SIGTERM.

use anyhow::{Context, Result};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use polyhybrid::config::{AppConfig, LogFormat};
use polyhybrid::gateway::{ClobGateway, ExecutionGateway, PaperGateway, PublicClob, RetryPolicy, RetryingGateway};
use polyhybrid::markets::{GammaMarketSource, MarketSource, StaticMarketSource};
use polyhybrid::oracle::{AdvisoryOracle, DisabledOracle, HttpOracle};
use polyhybrid::orchestrator::Orchestrator;
use polyhybrid::persistence::EventJournal;
use polyhybrid::spot::BinanceSpotFeed;
use polyhybrid::strategy::{Collaborators, StrategyContext};

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));
    match config.logging.format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(false)
            .init(),
        LogFormat::Pretty => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init(),
    }
}

async fn build_gateway(config: &AppConfig) -> Result<Arc<dyn ExecutionGateway>> {
    let exec = &config.execution;
    let inner: Arc<dyn ExecutionGateway> = if config.bot.paper_mode {
        let mut paper = PaperGateway::new(config.paper_trading.initial_balance);
        if config.paper_trading.live_books {
            let books = PublicClob::new(&exec.clob_url, Duration::from_millis(exec.request_timeout_ms))?;
            paper = paper.with_live_books(Arc::new(books));
        }
        info!(balance = config.paper_trading.initial_balance, "🧪 Paper trading gateway");
        Arc::new(paper)
    } else {
        let clob = ClobGateway::connect(exec)
            .await
            .context("Failed to connect to the CLOB")?;
        info!(url = %exec.clob_url, "🔌 Live CLOB gateway");
        Arc::new(clob)
    };
    Ok(Arc::new(RetryingGateway::new(inner, RetryPolicy::from(exec))))
}

fn build_oracle(config: &AppConfig) -> Arc<dyn AdvisoryOracle> {
    if !config.oracle.enabled {
        return Arc::new(DisabledOracle);
    }
    match HttpOracle::from_config(&config.oracle) {
        Ok(oracle) => Arc::new(oracle),
        Err(e) => {
            warn!(error = %e, "Advisory oracle unavailable, running without it");
            Arc::new(DisabledOracle)
        }
    }
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Ctrl-C received"),
        _ = terminate => info!("SIGTERM received"),
    }
}

async fn run() -> Result<()> {
    let config = AppConfig::load()?;
    config.validate_env()?;
    init_tracing(&config);
    info!(config = %config.digest(), "⚙️ Configuration loaded");

    let gateway = build_gateway(&config).await?;
    let timeout = Duration::from_millis(config.execution.request_timeout_ms);
    let markets: Arc<dyn MarketSource> = if config.markets.is_empty() {
        Arc::new(GammaMarketSource::new(
            &config.execution.gamma_url,
            config.mm.max_markets,
            timeout,
        )?)
    } else {
        info!(markets = config.markets.len(), "Using configured market universe");
        Arc::new(StaticMarketSource::from_specs(&config.markets)?)
    };
    let spot = Arc::new(BinanceSpotFeed::new(&config.execution.binance_url, timeout)?);
    let journal = if config.persistence.journal_enabled {
        EventJournal::new(&config.persistence.data_dir)?
    } else {
        EventJournal::disabled()
    };

    let deps = Collaborators {
        gateway,
        markets,
        spot,
        oracle: build_oracle(&config),
        journal,
    };
    let ctx = Arc::new(StrategyContext::restore(config, deps)?);
    let (orchestrator, handle) = Orchestrator::new(ctx);
    orchestrator.startup().await?;

    tokio::spawn(async move {
        wait_for_signal().await;
        handle.shutdown();
    });

    orchestrator.run().await
}
