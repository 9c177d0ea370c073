//! # state
//!
//! AppState: everything the ops surface and the control loop share.
//!
//! The exchange position is *not* in here. Every decision re-observes it
//! on the venue; the state only holds handles (exchange, evidence, halt switch) and
//! the audit trail.

use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::info;

use crate::config::GuardConfig;
use crate::engine::{EvidenceAggregator, ReconciliationController, SharedEvidence};
use crate::events::EventBus;
use crate::exchange::{Exchange, HttpExchange, SimulatedExchange, FILL_CHANNEL_CAPACITY};
use crate::models::{CycleHistory, FillUpdate, SharedHistory};
use crate::risk::RiskManager;

// ─── AppState ─────────────────────────────────────────────────────────────────

/// Top-level shared state injected into every Axum handler.
#[derive(Clone)]
pub struct AppState {
    pub config:   Arc<GuardConfig>,

    // ── Exchange ──────────────────────────────────────────────────────────────
    pub exchange: Arc<dyn Exchange>,
    /// Fan-out for streaming fills (bridge webhook or simulator → Fill Waiter).
    pub fills_tx: broadcast::Sender<FillUpdate>,

    // ── Engine ────────────────────────────────────────────────────────────────
    pub evidence: SharedEvidence,
    pub risk:     Arc<RiskManager>,
    pub history:  SharedHistory,

    // ── Monitor / WebSocket ───────────────────────────────────────────────────
    /// Pre-serialized `GuardEvent` JSON.
    pub broadcast_tx: broadcast::Sender<String>,

    // ── Metrics ───────────────────────────────────────────────────────────────
    pub fills_received: Arc<AtomicU64>,
    pub started_at:     DateTime<Utc>,
}

impl AppState {
    pub fn new(
        config: GuardConfig,
        exchange: Arc<dyn Exchange>,
        fills_tx: broadcast::Sender<FillUpdate>,
    ) -> Self {
        let (broadcast_tx, _) = broadcast::channel(256);

        Self {
            risk:           Arc::new(RiskManager::new(config.max_consecutive_failures)),
            config:         Arc::new(config),
            exchange,
            fills_tx,
            evidence:       EvidenceAggregator::shared(),
            history:        CycleHistory::shared(CycleHistory::DEFAULT_CAPACITY),
            broadcast_tx,
            fills_received: Arc::new(AtomicU64::new(0)),
            started_at:     Utc::now(),
        }
    }

    pub fn events(&self) -> EventBus {
        EventBus::new(self.broadcast_tx.clone())
    }

    /// Controller wired to this state's exchange, evidence, halt switch and history.
    pub fn controller(&self) -> ReconciliationController {
        ReconciliationController::new(
            self.config.clone(),
            self.exchange.clone(),
            self.evidence.clone(),
            self.risk.clone(),
            self.history.clone(),
            self.events(),
        )
    }
}

/// Convenience type alias
pub type SharedState = Arc<AppState>;

/// `EXCHANGE_URL=mock` → simulated venue, anything else → REST bridge.
pub fn build_exchange(
    config: &GuardConfig,
    fills_tx: broadcast::Sender<FillUpdate>,
) -> anyhow::Result<Arc<dyn Exchange>> {
    if config.is_mock() {
        info!("🧪 Using simulated exchange (EXCHANGE_URL=mock)");
        return Ok(Arc::new(SimulatedExchange::new(fills_tx)));
    }

    let client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(5))
        .build()
        .context("building HTTP client")?;

    info!(url = %config.exchange_url, "🔗 Using exchange REST bridge");
    Ok(Arc::new(HttpExchange::new(client, &config.exchange_url, config.retry.timeout, fills_tx)))
}

pub fn build_state(config: GuardConfig) -> anyhow::Result<SharedState> {
    let (fills_tx, _) = broadcast::channel(FILL_CHANNEL_CAPACITY);
    let exchange = build_exchange(&config, fills_tx.clone())?;
    Ok(Arc::new(AppState::new(config, exchange, fills_tx)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_state_shares_one_fill_channel() {
        let state = build_state(GuardConfig::default()).unwrap();
        let _rx = state.exchange.subscribe_fills("ETH-USD-PERP");
        assert_eq!(state.fills_tx.receiver_count(), 1);
    }

    #[test]
    fn test_bridge_url_selects_http_exchange() {
        let config = GuardConfig {
            exchange_url: "http://127.0.0.1:8081".into(),
            ..GuardConfig::default()
        };
        assert!(build_state(config).is_ok());
    }
}
