//! # fillguard — guard service
//!
//! Runs the reconciliation loop next to the HTTP/WebSocket ops surface.
//!
//! ## Environment Variables
//!
//! | Variable                    | Default          | Description                       |
//! |-----------------------------|------------------|-----------------------------------|
//! | `GUARD_CONTRACT_ID`         | `ETH-USD-PERP`   | contract traded and guarded       |
//! | `GUARD_SIDE` / `GUARD_QUANTITY` | `buy` / `0.05` | strategy entry                  |
//! | `GUARD_MAX_FILL_WAIT_SECS`  | `30`             | Fill Waiter bound                 |
//! | `GUARD_POLL_INTERVAL_MS`    | `2000`           | order-status poll interval        |
//! | `EXCHANGE_URL`              | `mock`           | REST bridge URL, `mock` = simulator |
//! | `BIND_ADDR`                 | `0.0.0.0:3000`   | ops server address                |
//! | `RUST_LOG`                  | `fillguard=debug` | tracing filter                   |
//!
//! The full list lives in `config.rs`.

use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use fillguard::config::GuardConfig;
use fillguard::models::{HaltCause, HaltReason};
use fillguard::routes::router;
use fillguard::state::build_state;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Load .env ──────────────────────────────────────────────────────────
    dotenvy::dotenv().ok();

    // ── 2. Structured logging ─────────────────────────────────────────────────
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::from_default_env()
                .add_directive("fillguard=debug".parse()?)
                .add_directive("tower_http=info".parse()?),
        )
        .init();

    info!(r#"

  ╔═══════════════════════════════════════════════════════╗
  ║              FILLGUARD — Reconciliation Guard         ║
  ║    Evidence · Gate · Fill Wait · Close · Halt         ║
  ╚═══════════════════════════════════════════════════════╝"#);

    // ── 3. Config + shared state ──────────────────────────────────────────────
    let config = GuardConfig::from_env()?;
    info!(
        contract_id = %config.contract_id,
        side        = %config.side,
        quantity    = %config.quantity,
        entry       = ?config.entry_order,
        exchange    = %config.exchange_url,
        "⚙️ Configuration loaded"
    );
    let addr = config.bind_addr;
    let state = build_state(config)?;

    // ── 4. Reconciliation loop ────────────────────────────────────────────────
    let mut controller = state.controller();
    tokio::spawn(async move {
        match controller.run().await {
            Some(reason) => error!(
                cause         = ?reason.cause,
                position      = ?reason.position,
                active_orders = ?reason.active_orders,
                "🛑 Guard HALTED — manual intervention required: {}", reason.message
            ),
            None => info!("🏁 Reconciliation loop finished"),
        }
    });

    // ── 5. Router ─────────────────────────────────────────────────────────────
    let app = router(state.clone());

    // ── 6. Bind & Serve ───────────────────────────────────────────────────────
    info!(?addr, "🚀 Fillguard server starting");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Ctrl-C received, halting guard");
                state.risk.halt(HaltReason::new(HaltCause::Manual, "process shutdown"));
            }
        })
        .await?;

    Ok(())
}
