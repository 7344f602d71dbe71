//! Shared data models for venues, markets, signals and positions.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Trading venue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Venue {
    Kalshi,
    Polymarket,
}

impl std::fmt::Display for Venue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Venue::Kalshi => write!(f, "kalshi"),
            Venue::Polymarket => write!(f, "polymarket"),
        }
    }
}

/// Outcome side of a binary market.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Yes,
    No,
}

impl Side {
    /// The opposing outcome.
    pub fn opposite(self) -> Side {
        match self {
            Side::Yes => Side::No,
            Side::No => Side::Yes,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Yes => write!(f, "yes"),
            Side::No => write!(f, "no"),
        }
    }
}

/// Identifies one market on one venue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MarketKey {
    pub venue: Venue,
    /// Venue-native id: Kalshi ticker or Polymarket condition id.
    pub market_id: String,
}

impl MarketKey {
    pub fn new(venue: Venue, market_id: impl Into<String>) -> Self {
        Self {
            venue,
            market_id: market_id.into(),
        }
    }
}

impl std::fmt::Display for MarketKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.venue, self.market_id)
    }
}

/// A single (price, aggregated quantity) level at one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookLevel {
    /// Price in dollars, exact decimal.
    pub price: Decimal,
    /// Contracts resting at this price.
    pub qty: u64,
}

impl BookLevel {
    pub fn new(price: Decimal, qty: u64) -> Self {
        Self { price, qty }
    }
}

/// Market timeframe classification, used for dynamic-fee tagging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Timeframe {
    M15,
    H1,
    Daily,
    Other,
}

impl Timeframe {
    /// Short-duration markets carry the elevated spread threshold and,
    /// on Polymarket, the dynamic taker fee.
    pub fn is_short_duration(self) -> bool {
        matches!(self, Timeframe::M15 | Timeframe::H1)
    }

    pub fn parse(s: &str) -> Timeframe {
        match s.to_lowercase().as_str() {
            "15m" => Timeframe::M15,
            "1h" | "hourly" => Timeframe::H1,
            "1d" | "daily" => Timeframe::Daily,
            _ => Timeframe::Other,
        }
    }
}

/// Static metadata for a tracked market.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketMeta {
    pub key: MarketKey,
    pub name: String,
    /// Polymarket CTF condition id (0x-prefixed hex), if applicable.
    pub condition_id: Option<String>,
    /// Polymarket YES outcome token id.
    pub yes_token_id: Option<String>,
    /// Polymarket NO outcome token id.
    pub no_token_id: Option<String>,
    /// Crypto-asset market (BTC/ETH/...). Drives the dynamic fee.
    pub is_crypto: bool,
    pub timeframe: Timeframe,
    pub end_time: DateTime<Utc>,
}

impl MarketMeta {
    /// True when the Polymarket dynamic taker fee applies.
    pub fn has_dynamic_fee(&self) -> bool {
        self.key.venue == Venue::Polymarket && self.is_crypto && self.timeframe.is_short_duration()
    }

    /// Outcome token id for a side (Polymarket only).
    pub fn token_id(&self, side: Side) -> Option<&str> {
        match side {
            Side::Yes => self.yes_token_id.as_deref(),
            Side::No => self.no_token_id.as_deref(),
        }
    }
}

/// How the two legs of a pair are routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArbKind {
    /// Both legs on Polymarket, merged through the CTF after the fill.
    PolymarketIntra,
    /// Both legs on Kalshi, held to cash settlement.
    KalshiIntra,
    /// Yes and No legs on different venues (whitelisted pairs only).
    CrossPlatform,
}

/// A detected negative-spread opportunity, priced at top of book.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArbSignal {
    pub kind: ArbKind,
    /// Market whose YES contract we buy.
    pub yes_market: MarketKey,
    /// Market whose NO contract we buy.
    pub no_market: MarketKey,
    pub yes_ask: Decimal,
    pub no_ask: Decimal,
    /// Largest monotone-profitable quantity across matched depth.
    pub max_qty: u64,
    /// Estimated fees per contract with both legs taking at the ask.
    pub est_fees_per_contract: Decimal,
    /// Estimated gas per contract (Polymarket merge; zero elsewhere).
    pub est_gas_per_contract: Decimal,
    pub net_edge_per_contract: Decimal,
    pub ts: DateTime<Utc>,
}

impl ArbSignal {
    /// Cost of one Yes+No pair before fees.
    pub fn pair_cost(&self) -> Decimal {
        self.yes_ask + self.no_ask
    }
}

/// A live holding on one venue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub venue: Venue,
    pub market_id: String,
    pub side: Side,
    pub qty: u64,
    pub avg_cost: Decimal,
    pub acquired_ts: DateTime<Utc>,
}

/// Result of executing one leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fill {
    pub qty: u64,
    pub avg_price: Decimal,
}

impl Fill {
    pub fn none() -> Self {
        Self {
            qty: 0,
            avg_price: Decimal::ZERO,
        }
    }

    pub fn notional(&self) -> Decimal {
        Decimal::from(self.qty) * self.avg_price
    }
}

/// Per-arb execution state machine.
///
/// `Idle → Leg1Submitted → {Leg1Filled, Aborted} → Leg2Submitted →
/// {BothFilled, HedgeNeeded} → {Merged, ClosedAtLoss}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LegState {
    Idle,
    Leg1Submitted,
    Leg1Filled,
    Aborted,
    Leg2Submitted,
    /// Both legs filled. Terminal for pairs held to settlement; otherwise
    /// the merge path decides between `Merged` and `ClosedAtLoss`.
    BothFilled,
    HedgeNeeded,
    Merged,
    ClosedAtLoss,
}

impl LegState {
    /// States in which no further orders will be placed for this arb.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            LegState::Aborted | LegState::Merged | LegState::ClosedAtLoss
        )
    }

    /// States that block new arbs on the touched markets.
    pub fn blocks_market(self) -> bool {
        matches!(self, LegState::Leg1Submitted | LegState::HedgeNeeded)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LegState::Idle => "idle",
            LegState::Leg1Submitted => "leg1_submitted",
            LegState::Leg1Filled => "leg1_filled",
            LegState::Aborted => "aborted",
            LegState::Leg2Submitted => "leg2_submitted",
            LegState::BothFilled => "both_filled",
            LegState::HedgeNeeded => "hedge_needed",
            LegState::Merged => "merged",
            LegState::ClosedAtLoss => "closed_at_loss",
        }
    }
}

/// Terminal outcome reported by the hedger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HedgeOutcome {
    /// Missing leg acquired; exposure is flat.
    HedgedToNeutral { fill: Fill },
    /// Hedge budget exhausted; position retained pending manual action.
    ClosedAtLoss { unhedged_qty: u64 },
}

/// Append-only record of one completed (or terminally failed) arb.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub id: Uuid,
    pub kind: ArbKind,
    pub yes_market: MarketKey,
    pub no_market: MarketKey,
    pub yes_qty: u64,
    pub yes_avg_cost: Decimal,
    pub no_qty: u64,
    pub no_avg_cost: Decimal,
    pub fees: Decimal,
    pub gas: Decimal,
    pub merge_tx: Option<String>,
    pub realized_pnl: Decimal,
    pub final_state: LegState,
    pub is_dry_run: bool,
    pub created_at: DateTime<Utc>,
}

impl TradeRecord {
    /// Realized PnL for a fully merged pair:
    /// `qty · (1 − leg1_cost − leg2_cost) − fees − gas`.
    pub fn merged_pnl(
        qty: u64,
        yes_avg_cost: Decimal,
        no_avg_cost: Decimal,
        fees: Decimal,
        gas: Decimal,
    ) -> Decimal {
        Decimal::from(qty) * (Decimal::ONE - yes_avg_cost - no_avg_cost) - fees - gas
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_side_opposite() {
        assert_eq!(Side::Yes.opposite(), Side::No);
        assert_eq!(Side::No.opposite(), Side::Yes);
    }

    #[test]
    fn test_timeframe_short_duration() {
        assert!(Timeframe::M15.is_short_duration());
        assert!(Timeframe::H1.is_short_duration());
        assert!(!Timeframe::Daily.is_short_duration());
        assert!(!Timeframe::Other.is_short_duration());
    }

    #[test]
    fn test_leg_state_terminal() {
        assert!(LegState::Aborted.is_terminal());
        assert!(LegState::Merged.is_terminal());
        assert!(LegState::ClosedAtLoss.is_terminal());
        assert!(!LegState::Leg1Submitted.is_terminal());
        assert!(!LegState::BothFilled.is_terminal());
    }

    #[test]
    fn test_leg_state_blocks_market() {
        assert!(LegState::Leg1Submitted.blocks_market());
        assert!(LegState::HedgeNeeded.blocks_market());
        assert!(!LegState::BothFilled.blocks_market());
        assert!(!LegState::Merged.blocks_market());
    }

    #[test]
    fn test_merged_pnl() {
        // 10 contracts at 0.45 + 0.53 with $0.005 gas, no fees.
        let pnl = TradeRecord::merged_pnl(10, dec!(0.45), dec!(0.53), dec!(0), dec!(0.005));
        assert_eq!(pnl, dec!(0.195));
    }

    #[test]
    fn test_dynamic_fee_tagging() {
        let meta = MarketMeta {
            key: MarketKey::new(Venue::Polymarket, "0xabc"),
            name: "BTC up 15m".to_string(),
            condition_id: Some("0xabc".to_string()),
            yes_token_id: Some("1".to_string()),
            no_token_id: Some("2".to_string()),
            is_crypto: true,
            timeframe: Timeframe::M15,
            end_time: Utc::now(),
        };
        assert!(meta.has_dynamic_fee());

        let daily = MarketMeta {
            timeframe: Timeframe::Daily,
            ..meta.clone()
        };
        assert!(!daily.has_dynamic_fee());

        let kalshi = MarketMeta {
            key: MarketKey::new(Venue::Kalshi, "KXBTC"),
            ..meta
        };
        assert!(!kalshi.has_dynamic_fee());
    }
}
