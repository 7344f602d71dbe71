//! Configuration loading from environment variables.

use std::collections::HashSet;
use std::env;

use rust_decimal::Decimal;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(String),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Engine configuration loaded from environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection URL
    pub database_url: String,

    /// Kalshi REST base URL
    pub kalshi_api_url: String,
    /// Kalshi WebSocket URL
    pub kalshi_ws_url: String,
    /// Kalshi API key id (required for live trading)
    pub kalshi_api_key: Option<String>,
    /// Kalshi RSA private key, PEM (required for live trading)
    pub kalshi_private_key_pem: Option<String>,

    /// Polymarket CLOB REST base URL
    pub clob_api_url: String,
    /// Polymarket CLOB WebSocket URL
    pub clob_ws_url: String,
    /// Polygon wallet private key (required for live trading)
    pub wallet_private_key: Option<String>,
    /// Polygon JSON-RPC URL
    pub polygon_rpc_url: String,
    /// Polygon gas station URL
    pub gas_station_url: String,
    /// Configured POL/USD rate for gas conversion
    pub pol_usd_rate: Decimal,

    /// Baseline MVS threshold in cents (default 2)
    pub min_spread_cents: u32,
    /// Elevated threshold for short-duration crypto markets (default 4)
    pub crypto_short_duration_min_spread_cents: u32,
    /// Elevated threshold for cross-platform pairings (default 5)
    pub cross_platform_min_spread_cents: u32,
    /// Per-trade cap in dollars (default 1000)
    pub max_position_size_usd: Decimal,
    /// Per-trade fraction of free venue balance (default 0.02)
    pub balance_fraction: Decimal,
    /// Sizing multiplier applied to cross-platform pairings (default 0.5)
    pub cross_venue_risk_factor: Decimal,
    /// Per-signal contract cap regardless of depth (default 500)
    pub capacity_cap: u64,
    /// Smallest partial fill worth hedging instead of aborting (default 2)
    pub min_viable_qty: u64,

    /// If false the coordinator records signals but submits no orders.
    pub enable_live_trading: bool,
    /// Simulated per-venue balance used when live trading is off.
    pub dry_run_balance: Decimal,

    /// Whitelisted resolution-equivalent pairs as
    /// `(kalshi_ticker, polymarket_condition_id)`.
    pub cross_platform_whitelist: HashSet<(String, String)>,

    /// Merge retry budget (default 3)
    pub merge_max_retries: u32,
    /// Fade-strategy wait before escalating to chase (default 3000)
    pub hedge_timeout_ms: u64,
    /// Max acceptable hedge loss per contract, in cents (default 5)
    pub max_hedge_loss_cents_per_contract: u32,

    /// Leg inflight timeouts per routing (defaults 500 / 2000 / 5000)
    pub poly_leg_timeout_ms: u64,
    pub kalshi_leg_timeout_ms: u64,
    pub cross_leg_timeout_ms: u64,

    /// Bound on waiting for in-flight legs at shutdown (default 30000)
    pub shutdown_deadline_ms: u64,
}

impl Config {
    /// Load configuration from environment variables, reading `.env` first.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_env_only()
    }

    /// Load configuration from environment variables only (no .env file).
    /// Useful for testing.
    pub fn from_env_only() -> Result<Self, ConfigError> {
        let database_url = env::var("DATABASE_URL")
            .map_err(|_| ConfigError::MissingVar("DATABASE_URL".to_string()))?;

        Ok(Self {
            database_url,
            kalshi_api_url: env_or(
                "KALSHI_API_URL",
                "https://api.elections.kalshi.com/trade-api/v2",
            ),
            kalshi_ws_url: env_or(
                "KALSHI_WS_URL",
                "wss://api.elections.kalshi.com/trade-api/ws/v2",
            ),
            kalshi_api_key: env::var("KALSHI_API_KEY").ok(),
            kalshi_private_key_pem: env::var("KALSHI_PRIVATE_KEY_PEM").ok(),
            clob_api_url: env_or("CLOB_API_URL", "https://clob.polymarket.com"),
            clob_ws_url: env_or(
                "CLOB_WS_URL",
                "wss://ws-subscriptions-clob.polymarket.com/ws",
            ),
            wallet_private_key: env::var("WALLET_PRIVATE_KEY").ok(),
            polygon_rpc_url: env_or(
                "POLYGON_RPC_URL",
                "https://polygon-bor-rpc.publicnode.com",
            ),
            gas_station_url: env_or(
                "GAS_STATION_URL",
                "https://gasstation.polygon.technology/v2",
            ),
            pol_usd_rate: parse_env("POL_USD_RATE", Decimal::new(40, 2))?,
            min_spread_cents: parse_env("MIN_SPREAD_CENTS", 2)?,
            crypto_short_duration_min_spread_cents: parse_env(
                "CRYPTO_SHORT_DURATION_MIN_SPREAD_CENTS",
                4,
            )?,
            cross_platform_min_spread_cents: parse_env("CROSS_PLATFORM_MIN_SPREAD_CENTS", 5)?,
            max_position_size_usd: parse_env("MAX_POSITION_SIZE_USD", Decimal::new(1000, 0))?,
            balance_fraction: parse_env("BALANCE_FRACTION", Decimal::new(2, 2))?,
            cross_venue_risk_factor: parse_env("CROSS_VENUE_RISK_FACTOR", Decimal::new(5, 1))?,
            capacity_cap: parse_env("CAPACITY_CAP", 500)?,
            min_viable_qty: parse_env("MIN_VIABLE_QTY", 2)?,
            enable_live_trading: parse_env("ENABLE_LIVE_TRADING", false)?,
            dry_run_balance: parse_env("DRY_RUN_BALANCE", Decimal::new(10_000, 0))?,
            cross_platform_whitelist: parse_whitelist(
                &env::var("CROSS_PLATFORM_WHITELIST").unwrap_or_default(),
            ),
            merge_max_retries: parse_env("MERGE_MAX_RETRIES", 3)?,
            hedge_timeout_ms: parse_env("HEDGE_TIMEOUT_MS", 3000)?,
            max_hedge_loss_cents_per_contract: parse_env("MAX_HEDGE_LOSS_CENTS_PER_CONTRACT", 5)?,
            poly_leg_timeout_ms: parse_env("POLY_LEG_TIMEOUT_MS", 500)?,
            kalshi_leg_timeout_ms: parse_env("KALSHI_LEG_TIMEOUT_MS", 2000)?,
            cross_leg_timeout_ms: parse_env("CROSS_LEG_TIMEOUT_MS", 5000)?,
            shutdown_deadline_ms: parse_env("SHUTDOWN_DEADLINE_MS", 30_000)?,
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| ConfigError::InvalidValue(key.to_string(), raw)),
        Err(_) => Ok(default),
    }
}

/// Parse `KALSHI_TICKER=poly_condition,KALSHI_TICKER2=poly_condition2`.
/// Malformed entries are skipped.
fn parse_whitelist(raw: &str) -> HashSet<(String, String)> {
    raw.split(',')
        .filter_map(|entry| {
            let (kalshi, poly) = entry.trim().split_once('=')?;
            if kalshi.is_empty() || poly.is_empty() {
                return None;
            }
            Some((kalshi.trim().to_string(), poly.trim().to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_config_missing_database_url() {
        env::remove_var("DATABASE_URL");

        let result = Config::from_env_only();
        assert!(result.is_err());

        if let Err(ConfigError::MissingVar(var)) = result {
            assert_eq!(var, "DATABASE_URL");
        } else {
            panic!("Expected MissingVar error");
        }
    }

    #[test]
    #[serial]
    fn test_config_with_defaults() {
        env::set_var("DATABASE_URL", "postgres://localhost/test");
        env::remove_var("MIN_SPREAD_CENTS");
        env::remove_var("ENABLE_LIVE_TRADING");

        let config = Config::from_env_only().unwrap();

        assert_eq!(config.min_spread_cents, 2);
        assert_eq!(config.crypto_short_duration_min_spread_cents, 4);
        assert_eq!(config.balance_fraction, Decimal::new(2, 2));
        assert_eq!(config.max_position_size_usd, Decimal::new(1000, 0));
        assert!(!config.enable_live_trading);
        assert_eq!(config.poly_leg_timeout_ms, 500);
        assert_eq!(config.kalshi_leg_timeout_ms, 2000);
        assert_eq!(config.cross_leg_timeout_ms, 5000);
        assert!(config.cross_platform_whitelist.is_empty());

        env::remove_var("DATABASE_URL");
    }

    #[test]
    #[serial]
    fn test_config_invalid_value() {
        env::set_var("DATABASE_URL", "postgres://localhost/test");
        env::set_var("MIN_SPREAD_CENTS", "not-a-number");

        let result = Config::from_env_only();
        assert!(matches!(result, Err(ConfigError::InvalidValue(_, _))));

        env::remove_var("MIN_SPREAD_CENTS");
        env::remove_var("DATABASE_URL");
    }

    #[test]
    fn test_parse_whitelist() {
        let parsed = parse_whitelist("KXBTC-X=0xaaa, KXETH-Y=0xbbb,,bad-entry");
        assert_eq!(parsed.len(), 2);
        assert!(parsed.contains(&("KXBTC-X".to_string(), "0xaaa".to_string())));
        assert!(parsed.contains(&("KXETH-Y".to_string(), "0xbbb".to_string())));
    }

    #[test]
    fn test_parse_whitelist_empty() {
        assert!(parse_whitelist("").is_empty());
    }
}
