//! # emergency_close
//!
//! Out-of-band recovery: cancel every active order on the contract and flatten the
//! position by its measured size, without starting the control loop.
//!
//! ```bash
//! EXCHANGE_URL=http://bridge:8081 cargo run --bin emergency_close -- ETH-USD-PERP
//! ```
//!
//! Exit code `0` when flat, `2` when a position or an unverifiable close remains.

use std::process::ExitCode;

use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use fillguard::config::GuardConfig;
use fillguard::engine::{emergency_close, CloseOutcome};
use fillguard::events::EventBus;
use fillguard::exchange::FILL_CHANNEL_CAPACITY;
use fillguard::state::build_exchange;

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::from_default_env()
                .add_directive("fillguard=debug".parse()?),
        )
        .init();

    let config = GuardConfig::from_env()?;
    let contract_id = std::env::args()
        .nth(1)
        .unwrap_or_else(|| config.contract_id.clone());

    let (fills_tx, _) = tokio::sync::broadcast::channel(FILL_CHANNEL_CAPACITY);
    let exchange = build_exchange(&config, fills_tx)?;

    info!(%contract_id, exchange = %config.exchange_url, "🚨 Emergency close");
    match emergency_close(exchange, &config, &contract_id, EventBus::detached()).await {
        CloseOutcome::Closed => {
            info!(%contract_id, "✅ Flat");
            Ok(ExitCode::SUCCESS)
        }
        CloseOutcome::StillOpen(residual) => {
            error!(%contract_id, %residual, "❌ Position still open, close it on the venue by hand");
            Ok(ExitCode::from(2))
        }
        CloseOutcome::Error(e) => {
            error!(%contract_id, error = %e, "❌ Close could not be verified");
            Ok(ExitCode::from(2))
        }
    }
}
