//! Operator entrypoint (spec §6). Flags are parsed with a small hand-rolled
//! scan over `std::env::args()`, matching the base crate's own
//! `Settings::from_env()`-style dependency-free option handling rather than
//! pulling in a CLI-parsing crate for a half-dozen flags.

use std::process::ExitCode;
use std::sync::Arc;

use predictor_engine::adapter::{ClobAdapter, PaperAdapter};
use predictor_engine::config::{EngineConfig, TradingMode};
use predictor_engine::notifier::LoggingNotifier;
use predictor_engine::orchestrator::Engine;
use predictor_engine::store::Store;
use predictor_engine::strategy::mirror::{MirrorConfig, MirrorStrategy, SizingMethod};
use predictor_engine::strategy::StrategyRunner;
use predictor_engine::wallet::{LiveWallet, PaperWallet, Wallet};
use tracing::{error, info};

struct Flags {
    status: bool,
    kill: bool,
    force_live: bool,
    log_level: Option<String>,
}

fn parse_flags() -> Result<Flags, String> {
    let mut flags = Flags {
        status: false,
        kill: false,
        force_live: false,
        log_level: None,
    };
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--status" => flags.status = true,
            "--kill" => flags.kill = true,
            "--live" => flags.force_live = true,
            "--log-level" => {
                let level = args.next().ok_or("--log-level requires a value")?;
                if !["DEBUG", "INFO", "WARNING", "ERROR"].contains(&level.as_str()) {
                    return Err(format!("invalid --log-level {level}"));
                }
                flags.log_level = Some(level);
            }
            other => return Err(format!("unrecognized argument: {other}")),
        }
    }
    Ok(flags)
}

async fn build_wallet(mode: TradingMode) -> eyre::Result<Arc<dyn Wallet>> {
    if mode.is_paper() {
        let starting = std::env::var("PAPER_STARTING_BALANCE_USD")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(10_000.0);
        return Ok(Arc::new(PaperWallet::new(starting)));
    }

    let rpc_url = std::env::var("POLYGON_RPC_URL").unwrap_or_else(|_| "https://polygon-rpc.com".to_string());
    let funder: alloy_primitives::Address = std::env::var("FUNDER_ADDRESS")
        .map_err(|_| eyre::eyre!("FUNDER_ADDRESS not set"))?
        .parse()
        .map_err(|e| eyre::eyre!("invalid FUNDER_ADDRESS: {e}"))?;
    let usdc: alloy_primitives::Address = std::env::var("USDC_CONTRACT_ADDRESS")
        .unwrap_or_else(|_| "0x2791Bca1f2de4661ED88A30C99A7a9449Aa84174".to_string())
        .parse()
        .map_err(|e| eyre::eyre!("invalid USDC_CONTRACT_ADDRESS: {e}"))?;
    Ok(Arc::new(LiveWallet::new(rpc_url, funder, usdc)))
}

async fn build_adapter(mode: TradingMode) -> eyre::Result<Arc<dyn predictor_engine::adapter::ExchangeAdapter>> {
    if mode.is_paper() {
        return Ok(Arc::new(PaperAdapter::new()));
    }
    let rest_url = std::env::var("PM_REST_URL").unwrap_or_else(|_| "https://clob.polymarket.com".to_string());
    let private_key = std::env::var("WALLET_PRIVATE_KEY").map_err(|_| eyre::eyre!("WALLET_PRIVATE_KEY not set"))?;
    Ok(Arc::new(ClobAdapter::connect(&rest_url, &private_key).await?))
}

fn mirror_config_from_env() -> MirrorConfig {
    let accounts = std::env::var("MIRROR_ACCOUNTS")
        .unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    MirrorConfig {
        accounts,
        sizing: SizingMethod::PortfolioPct,
        fixed_notional: 50.0,
        portfolio_pct: 2.0,
        source_pct: 5.0,
        min_source_notional: 100.0,
        max_slippage_pct: 5.0,
        min_position_size_usd: 5.0,
        per_account_allocation_cap_usd: 500.0,
        discipline: predictor_engine::intent::Discipline::ImmediateOrKill,
        taker_fee_rate: 0.0315,
        winner_fee_rate: 0.02,
    }
}

async fn run() -> eyre::Result<ExitCode> {
    dotenv::dotenv().ok();

    let flags = match parse_flags() {
        Ok(f) => f,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return Ok(ExitCode::from(1));
        }
    };

    let mut config = EngineConfig::from_env();
    if flags.force_live {
        config.trading_mode = TradingMode::Live;
    }
    if let Some(level) = &flags.log_level {
        config.log_level = level.to_ascii_lowercase();
    }
    predictor_engine::logging::init(&config.log_level);

    if let Err(e) = config.validate_for_live() {
        eprintln!("configuration error: {e}");
        return Ok(ExitCode::from(1));
    }

    let adapter = match build_adapter(config.trading_mode).await {
        Ok(a) => a,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return Ok(ExitCode::from(1));
        }
    };

    if flags.kill {
        let store = Store::connect(&config.database_url).await?;
        store.set_metadata("risk.kill_switch_active", "1").await?;
        if let Err(e) = adapter.cancel_all_orders().await {
            error!(error = %e, "kill_cancel_all_orders_failed");
        }
        info!("kill_switch_activated");
        return Ok(ExitCode::SUCCESS);
    }

    let wallet = match build_wallet(config.trading_mode).await {
        Ok(w) => w,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return Ok(ExitCode::from(1));
        }
    };
    let notifier = Arc::new(LoggingNotifier);

    let engine = Engine::bootstrap(config, adapter, wallet, notifier).await?;

    if flags.status {
        println!("{}", engine.status().await);
        return Ok(ExitCode::SUCCESS);
    }

    let streaming = engine.streaming();
    let mirror = Arc::new(MirrorStrategy::new(
        mirror_config_from_env(),
        engine.store(),
        engine.adapter(),
        engine.wallet(),
        streaming,
    ));
    engine.register_strategy(Arc::new(StrategyRunner::new(
        mirror,
        engine.store(),
        engine.order_manager(),
        std::time::Duration::from_secs(30),
    )));

    engine.start().await?;
    info!("engine_running");

    tokio::signal::ctrl_c().await.ok();
    info!("interrupt_received");
    engine.shutdown().await;
    Ok(ExitCode::from(130))
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("fatal error: {e:?}");
            ExitCode::from(1)
        }
    }
}
