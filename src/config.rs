//! `<Component>Config::from_env()` idiom, modeled directly on the base
//! crate's `CoordinatorConfig::from_env()` / `InventoryConfig::from_env()`.

use std::env;
use std::time::Duration;

fn env_f64(key: &str, default: f64) -> f64 {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradingMode {
    Paper,
    Live,
}

impl TradingMode {
    pub fn from_env() -> Self {
        match env::var("TRADING_MODE").unwrap_or_default().to_ascii_lowercase().as_str() {
            "live" => TradingMode::Live,
            _ => TradingMode::Paper,
        }
    }

    pub fn is_paper(self) -> bool {
        matches!(self, TradingMode::Paper)
    }
}

#[derive(Debug, Clone)]
pub struct RiskConfig {
    pub max_open_positions: u32,
    pub max_position_pct: f64,
    pub min_position_size_usd: f64,
    pub daily_loss_limit_pct: f64,
    pub min_cash_reserve_pct: f64,
    pub min_edge_pct: f64,
    pub strategy_allocation_cap_usd: Option<f64>,
}

impl RiskConfig {
    pub fn from_env() -> Self {
        Self {
            max_open_positions: env_u32("RISK_MAX_OPEN_POSITIONS", 10),
            max_position_pct: env_f64("RISK_MAX_POSITION_PCT", 15.0),
            min_position_size_usd: env_f64("RISK_MIN_POSITION_SIZE_USD", 5.0),
            daily_loss_limit_pct: env_f64("RISK_DAILY_LOSS_LIMIT_PCT", 10.0),
            min_cash_reserve_pct: env_f64("RISK_MIN_CASH_RESERVE_PCT", 10.0),
            min_edge_pct: env_f64("RISK_MIN_EDGE_PCT", 0.0),
            strategy_allocation_cap_usd: env::var("RISK_STRATEGY_ALLOCATION_CAP_USD")
                .ok()
                .and_then(|v| v.parse().ok()),
        }
    }
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_open_positions: 10,
            max_position_pct: 15.0,
            min_position_size_usd: 5.0,
            daily_loss_limit_pct: 10.0,
            min_cash_reserve_pct: 10.0,
            min_edge_pct: 0.0,
            strategy_allocation_cap_usd: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    pub max_requests: u32,
    pub window_seconds: f64,
}

impl RateLimiterConfig {
    pub fn from_env() -> Self {
        Self {
            max_requests: env_u32("RATE_LIMIT_MAX_REQUESTS", 55),
            window_seconds: env_f64("RATE_LIMIT_WINDOW_SECONDS", 60.0),
        }
    }
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            max_requests: 55,
            window_seconds: 60.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TakeProfitTier {
    pub gain_pct: f64,
    pub sell_pct: f64,
}

#[derive(Debug, Clone)]
pub struct PositionConfig {
    pub stop_loss_pct: f64,
    pub trailing_stop_pct: f64,
    pub take_profit_tiers: Vec<TakeProfitTier>,
    pub taker_fee_rate: f64,
    pub winner_fee_rate: f64,
}

impl PositionConfig {
    pub fn from_env() -> Self {
        Self {
            stop_loss_pct: env_f64("POSITION_STOP_LOSS_PCT", 15.0),
            trailing_stop_pct: env_f64("POSITION_TRAILING_STOP_PCT", 10.0),
            take_profit_tiers: vec![
                TakeProfitTier { gain_pct: 50.0, sell_pct: 50.0 },
                TakeProfitTier { gain_pct: 100.0, sell_pct: 100.0 },
            ],
            taker_fee_rate: env_f64("POSITION_TAKER_FEE_RATE", 0.0315),
            winner_fee_rate: env_f64("POSITION_WINNER_FEE_RATE", 0.02),
        }
    }
}

impl Default for PositionConfig {
    fn default() -> Self {
        Self {
            stop_loss_pct: 15.0,
            trailing_stop_pct: 10.0,
            take_profit_tiers: vec![
                TakeProfitTier { gain_pct: 50.0, sell_pct: 50.0 },
                TakeProfitTier { gain_pct: 100.0, sell_pct: 100.0 },
            ],
            taker_fee_rate: 0.0315,
            winner_fee_rate: 0.02,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StreamingConfig {
    pub ws_url: String,
    pub auth_key: Option<String>,
    pub initial_reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
    pub stale: Duration,
    pub heartbeat_check: Duration,
    pub force_reconnect: Duration,
}

impl StreamingConfig {
    pub fn from_env() -> Self {
        Self {
            ws_url: env::var("PM_WS_URL").unwrap_or_else(|_| "wss://ws-subscriptions-clob.polymarket.com/ws/market".to_string()),
            auth_key: env::var("PM_API_KEY").ok(),
            initial_reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(60),
            stale: Duration::from_secs(30),
            heartbeat_check: Duration::from_secs(10),
            force_reconnect: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrderManagerConfig {
    pub queue_capacity: usize,
    pub fill_confirmation_delay: Duration,
    pub exit_retry_attempts: u32,
    pub exit_retry_backoff_base_secs: u64,
}

impl OrderManagerConfig {
    pub fn from_env() -> Self {
        Self {
            queue_capacity: env_usize("ORDER_QUEUE_CAPACITY", 100),
            fill_confirmation_delay: Duration::from_millis(env_u64("ORDER_FILL_CONFIRM_DELAY_MS", 500)),
            exit_retry_attempts: env_u32("ORDER_EXIT_RETRY_ATTEMPTS", 3),
            exit_retry_backoff_base_secs: env_u64("ORDER_EXIT_RETRY_BACKOFF_BASE_SECS", 2),
        }
    }
}

impl Default for OrderManagerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 100,
            fill_confirmation_delay: Duration::from_millis(500),
            exit_retry_attempts: 3,
            exit_retry_backoff_base_secs: 2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub trading_mode: TradingMode,
    pub database_url: String,
    pub log_level: String,
    pub risk: RiskConfig,
    pub rate_limiter: RateLimiterConfig,
    pub position: PositionConfig,
    pub streaming: StreamingConfig,
    pub order_manager: OrderManagerConfig,
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self {
            trading_mode: TradingMode::from_env(),
            database_url: env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite://engine.db".to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            risk: RiskConfig::from_env(),
            rate_limiter: RateLimiterConfig::from_env(),
            position: PositionConfig::from_env(),
            streaming: StreamingConfig::from_env(),
            order_manager: OrderManagerConfig::from_env(),
        }
    }

    /// Live mode requires all credentials populated per spec §6; called by
    /// the CLI before starting loops.
    pub fn validate_for_live(&self) -> Result<(), String> {
        if self.trading_mode != TradingMode::Live {
            return Ok(());
        }
        let required = [
            "PM_API_KEY",
            "PM_API_SECRET",
            "PM_API_PASSPHRASE",
            "WALLET_PRIVATE_KEY",
            "FUNDER_ADDRESS",
        ];
        for key in required {
            if env::var(key).unwrap_or_default().is_empty() {
                return Err(format!("live mode requires {key} to be set"));
            }
        }
        Ok(())
    }
}
