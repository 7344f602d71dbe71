//! Venue fee models and the Polygon gas oracle.
//!
//! All fee math is exact: Kalshi fees are computed in integer cents with
//! the venue's round-up direction reproduced bit-exactly; Polymarket fees
//! are `Decimal` arithmetic. Binary floats never touch money.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

/// Base rate of the Polymarket dynamic taker fee. The fee is
/// `base_rate * min(P, 1 - P)` per contract, so it peaks at the $0.50
/// midpoint and falls linearly toward the tails.
const DYNAMIC_FEE_BASE_RATE: Decimal = dec!(0.06);

/// Hard ceiling of the dynamic fee per contract.
const DYNAMIC_FEE_CEILING: Decimal = dec!(0.03);

/// Kalshi taker fee for an order of `qty` contracts at `price_cents`,
/// in cents: `ceil(0.07 * qty * P * (1 - P))` rounded up to the next cent.
pub fn kalshi_taker_fee_cents(qty: u64, price_cents: u32) -> u64 {
    if qty == 0 || price_cents == 0 || price_cents >= 100 {
        return 0;
    }
    // 0.07 * qty * (c/100) * ((100-c)/100) dollars
    //   = 7 * qty * c * (100-c) / 10_000 cents, rounded up.
    let raw = 7u128 * qty as u128 * price_cents as u128 * (100 - price_cents) as u128;
    raw.div_ceil(10_000) as u64
}

/// Kalshi taker fee in dollars for an order at a dollar price.
pub fn kalshi_taker_fee(qty: u64, price: Decimal) -> Decimal {
    let cents = (price * dec!(100)).round().to_u32().unwrap_or(0);
    Decimal::new(kalshi_taker_fee_cents(qty, cents) as i64, 2)
}

/// Polymarket taker fee per contract at a trade price.
///
/// Zero for ordinary markets. Markets tagged crypto + short-duration pay
/// a fee scaling with proximity of the price to $0.50, hard-capped at
/// 3.0% per contract.
pub fn polymarket_taker_fee_per_contract(price: Decimal, dynamic: bool) -> Decimal {
    if !dynamic {
        return Decimal::ZERO;
    }
    let proximity = price.min(Decimal::ONE - price).max(Decimal::ZERO);
    (DYNAMIC_FEE_BASE_RATE * proximity).min(DYNAMIC_FEE_CEILING)
}

#[derive(Debug, Error)]
pub enum GasError {
    #[error("gas station request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("gas station returned an unusable price: {0}")]
    BadPrice(String),
}

/// Point-in-time estimate of the cost of one merge transaction, in USDC.
#[derive(Debug, Clone, Copy)]
pub struct GasEstimate {
    pub usd_per_merge: Decimal,
    pub fetched_at: DateTime<Utc>,
}

impl GasEstimate {
    pub fn new(usd_per_merge: Decimal) -> Self {
        Self {
            usd_per_merge,
            fetched_at: Utc::now(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct GasStationTier {
    #[serde(rename = "maxFee")]
    max_fee: f64,
}

#[derive(Debug, Deserialize)]
struct GasStationResponse {
    fast: GasStationTier,
}

/// Polls the Polygon gas station and converts the fast-tier gas price into
/// a per-merge USDC estimate.
pub struct GasOracle {
    client: reqwest::Client,
    url: String,
    /// Configured POL/USD conversion rate.
    pol_usd: Decimal,
    /// Gas units consumed by one `mergePositions` call.
    gas_units_per_merge: u64,
    /// Estimate served before the first successful poll.
    fallback: Decimal,
}

impl GasOracle {
    pub fn new(url: impl Into<String>, pol_usd: Decimal, fallback_usd: Decimal) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(10))
                .build()
                .expect("Failed to create HTTP client"),
            url: url.into(),
            pol_usd,
            gas_units_per_merge: 150_000,
            fallback: fallback_usd,
        }
    }

    /// Estimate used until the gas station has answered once.
    pub fn fallback_estimate(&self) -> GasEstimate {
        GasEstimate::new(self.fallback)
    }

    /// Fetch a fresh estimate. On failure the caller keeps the previous
    /// snapshot; a stale estimate is better than no estimate.
    pub async fn fetch(&self) -> Result<GasEstimate, GasError> {
        let resp: GasStationResponse = self
            .client
            .get(&self.url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let gwei = Decimal::try_from(resp.fast.max_fee)
            .map_err(|e| GasError::BadPrice(e.to_string()))?;
        if gwei <= Decimal::ZERO {
            return Err(GasError::BadPrice(format!("gwei={gwei}")));
        }

        // gwei * units * 1e-9 = POL per tx, then into USD.
        let pol = gwei * Decimal::from(self.gas_units_per_merge) * Decimal::new(1, 9);
        let usd = (pol * self.pol_usd).round_dp(6);
        debug!("Gas estimate: {} gwei fast -> ${} per merge", gwei, usd);
        Ok(GasEstimate::new(usd))
    }

    /// Poll forever, publishing each estimate on a watch channel.
    pub async fn run(
        self,
        tx: tokio::sync::watch::Sender<GasEstimate>,
        interval: std::time::Duration,
    ) {
        loop {
            match self.fetch().await {
                Ok(estimate) => {
                    let _ = tx.send(estimate);
                }
                Err(e) => warn!("Gas oracle poll failed: {}", e),
            }
            tokio::time::sleep(interval).await;
        }
    }
}
