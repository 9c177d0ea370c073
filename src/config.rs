//! # config — อ่าน Config จาก Environment Variables
//!
//! Every knob of the guard, read once at startup. Trading parameters that fail to
//! parse are an error, not a silent default: a typo in `GUARD_QUANTITY` must not turn
//! into a different order size.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context};
use rust_decimal::Decimal;

use crate::exchange::RetryPolicy;
use crate::models::{OrderSide, POSITION_EPSILON};

/// How the strategy's entry order is priced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryOrder {
    Market,
    /// Maker-safe limit: buy at best bid, sell at best ask.
    Limit,
}

impl FromStr for EntryOrder {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "market" => Ok(EntryOrder::Market),
            "limit"  => Ok(EntryOrder::Limit),
            other => bail!("Unknown GUARD_ENTRY_ORDER: '{other}'. Use 'market' or 'limit'"),
        }
    }
}

/// Fill Waiter timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FillWaitConfig {
    pub max_wait:      Duration,
    /// Kept short: a coarse interval hides fast fills.
    pub poll_interval: Duration,
}

/// Close Executor timing and escalation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseConfig {
    pub settlement_delay: Duration,
    pub max_attempts:     u32,
    /// Price distance from the touch for the aggressive-limit fallback, times attempt.
    pub limit_offset:     Decimal,
}

#[derive(Debug, Clone)]
pub struct GuardConfig {
    pub contract_id:    String,
    pub side:           OrderSide,
    pub quantity:       Decimal,
    pub entry_order:    EntryOrder,
    pub fill:           FillWaitConfig,
    pub close:          CloseConfig,
    /// Pause after cancellations before re-listing active orders.
    pub cancel_settle:  Duration,
    pub retry:          RetryPolicy,
    pub max_consecutive_failures: u32,
    /// How long a filled entry is held before the cycle flattens it.
    pub hold:           Duration,
    pub cycle_interval: Duration,
    /// `None` = run until halted.
    pub loop_count:     Option<u64>,
    /// REST bridge base URL, or `"mock"` for the simulated venue.
    pub exchange_url:   String,
    pub bind_addr:      SocketAddr,
    pub api_key:        Option<String>,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            contract_id:    "ETH-USD-PERP".to_string(),
            side:           OrderSide::Buy,
            quantity:       Decimal::new(5, 2),
            entry_order:    EntryOrder::Market,
            fill: FillWaitConfig {
                max_wait:      Duration::from_secs(30),
                poll_interval: Duration::from_secs(2),
            },
            close: CloseConfig {
                settlement_delay: Duration::from_secs(3),
                max_attempts:     3,
                limit_offset:     Decimal::TEN,
            },
            cancel_settle:  Duration::from_secs(1),
            retry:          RetryPolicy::default(),
            max_consecutive_failures: 5,
            hold:           Duration::from_secs(60),
            cycle_interval: Duration::from_secs(5),
            loop_count:     None,
            exchange_url:   "mock".to_string(),
            bind_addr:      SocketAddr::from(([0, 0, 0, 0], 3000)),
            api_key:        None,
        }
    }
}

impl GuardConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let d = Self::default();

        let quantity: Decimal = env_parse("GUARD_QUANTITY", d.quantity)?;
        if quantity < POSITION_EPSILON {
            bail!("GUARD_QUANTITY must be at least {POSITION_EPSILON}, got {quantity}");
        }

        let max_attempts: u32 = env_parse("GUARD_CLOSE_MAX_ATTEMPTS", d.close.max_attempts)?;
        if max_attempts == 0 {
            bail!("GUARD_CLOSE_MAX_ATTEMPTS must be at least 1");
        }

        let poll_interval = env_millis("GUARD_POLL_INTERVAL_MS", d.fill.poll_interval)?;
        if poll_interval.is_zero() {
            bail!("GUARD_POLL_INTERVAL_MS must be greater than 0");
        }

        let side = match std::env::var("GUARD_SIDE") {
            Ok(v) => v.parse().map_err(anyhow::Error::msg).context("GUARD_SIDE")?,
            Err(_) => d.side,
        };

        let loop_count = match std::env::var("GUARD_LOOP_COUNT") {
            Ok(v) if !v.trim().is_empty() => Some(
                v.trim().parse().context("GUARD_LOOP_COUNT must be a number")?,
            ),
            _ => None,
        };

        Ok(Self {
            contract_id:    std::env::var("GUARD_CONTRACT_ID").unwrap_or(d.contract_id),
            side,
            quantity,
            entry_order:    env_parse("GUARD_ENTRY_ORDER", d.entry_order)?,
            fill: FillWaitConfig {
                max_wait: Duration::from_secs(env_parse("GUARD_MAX_FILL_WAIT_SECS", d.fill.max_wait.as_secs())?),
                poll_interval,
            },
            close: CloseConfig {
                settlement_delay: env_millis("GUARD_SETTLEMENT_DELAY_MS", d.close.settlement_delay)?,
                max_attempts,
                limit_offset:     env_parse("GUARD_CLOSE_LIMIT_OFFSET", d.close.limit_offset)?,
            },
            cancel_settle:  env_millis("GUARD_CANCEL_SETTLE_MS", d.cancel_settle)?,
            retry: RetryPolicy {
                attempts: env_parse("GUARD_IO_RETRY_ATTEMPTS", d.retry.attempts)?.max(1),
                backoff:  env_millis("GUARD_IO_RETRY_BACKOFF_MS", d.retry.backoff)?,
                timeout:  env_millis("GUARD_IO_TIMEOUT_MS", d.retry.timeout)?,
            },
            max_consecutive_failures: env_parse("GUARD_MAX_CONSECUTIVE_FAILURES", d.max_consecutive_failures)?,
            hold:           Duration::from_secs(env_parse("GUARD_HOLD_SECS", d.hold.as_secs())?),
            cycle_interval: Duration::from_secs(env_parse("GUARD_CYCLE_INTERVAL_SECS", d.cycle_interval.as_secs())?),
            loop_count,
            exchange_url:   std::env::var("EXCHANGE_URL").unwrap_or(d.exchange_url),
            bind_addr:      env_parse("BIND_ADDR", d.bind_addr)?,
            api_key:        std::env::var("API_KEY").ok().filter(|k| !k.is_empty()),
        })
    }

    pub fn is_mock(&self) -> bool {
        self.exchange_url.eq_ignore_ascii_case("mock")
    }
}

fn env_parse<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(v) if !v.trim().is_empty() => v
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("{key}='{v}' is invalid: {e}")),
        _ => Ok(default),
    }
}

fn env_millis(key: &str, default: Duration) -> anyhow::Result<Duration> {
    env_parse(key, default.as_millis() as u64).map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_default_timings() {
        let cfg = GuardConfig::default();
        assert_eq!(cfg.fill.poll_interval, Duration::from_secs(2));
        assert_eq!(cfg.close.settlement_delay, Duration::from_secs(3));
        assert_eq!(cfg.quantity, dec!(0.05));
        assert!(cfg.is_mock());
    }

    #[test]
    fn test_entry_order_parsing() {
        assert_eq!("Market".parse::<EntryOrder>().unwrap(), EntryOrder::Market);
        assert_eq!(" limit ".parse::<EntryOrder>().unwrap(), EntryOrder::Limit);
        assert!("stop".parse::<EntryOrder>().is_err());
    }

    #[test]
    fn test_env_parse_rejects_garbage() {
        // Unique keys so parallel tests never race on the same variable.
        std::env::set_var("FG_TEST_PARSE_BAD", "0.05x");
        assert!(env_parse::<Decimal>("FG_TEST_PARSE_BAD", dec!(1)).is_err());

        std::env::set_var("FG_TEST_PARSE_OK", " 250 ");
        assert_eq!(env_millis("FG_TEST_PARSE_OK", Duration::ZERO).unwrap(), Duration::from_millis(250));

        assert_eq!(env_parse("FG_TEST_PARSE_MISSING", 7u32).unwrap(), 7);
    }
}
