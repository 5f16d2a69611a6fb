//! Notifier seam (chat notifications are out of scope per spec §1; this is
//! the interface the rest of the engine calls through, grounded in the call
//! sites of `original_source/src/notifications/telegram.py` as used from
//! `order_manager.py`/`position_manager.py`).

use async_trait::async_trait;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Info,
    Warning,
    Error,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn alert_system(&self, title: &str, message: &str, level: Level);
    async fn alert_position_opened(&self, strategy: &str, market_id: &str, side: &str, price: f64, size: f64);
    async fn alert_position_closed(&self, strategy: &str, market_id: &str, reason: &str, pnl: f64, pnl_pct: f64);
}

/// Default notifier used when no chat integration is configured: logs via
/// `tracing` instead of silently dropping alerts.
pub struct LoggingNotifier;

#[async_trait]
impl Notifier for LoggingNotifier {
    async fn alert_system(&self, title: &str, message: &str, level: Level) {
        match level {
            Level::Info => info!(title, message, "alert_system"),
            Level::Warning => warn!(title, message, "alert_system"),
            Level::Error => tracing::error!(title, message, "alert_system"),
        }
    }

    async fn alert_position_opened(&self, strategy: &str, market_id: &str, side: &str, price: f64, size: f64) {
        info!(strategy, market_id, side, price, size, "alert_position_opened");
    }

    async fn alert_position_closed(&self, strategy: &str, market_id: &str, reason: &str, pnl: f64, pnl_pct: f64) {
        info!(strategy, market_id, reason, pnl, pnl_pct, "alert_position_closed");
    }
}
