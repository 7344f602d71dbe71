//! Risk gates, per-venue capital ledgers and the position sizer.
//!
//! Gate order: venue liveness, open-leg check, capital check, per-trade
//! cap, whitelist (cross-platform only), then sizing. Every rejection is
//! structured and feeds metrics; none are fatal. The whole evaluation is
//! synchronous over a snapshot of engine state, so a reservation is atomic
//! with respect to await points.

use std::collections::{HashMap, HashSet};

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use common::models::{ArbKind, ArbSignal, MarketKey, Venue};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RiskRejection {
    #[error("venue {0} is not live")]
    VenueDown(Venue),

    #[error("open leg in flight on {0}")]
    OpenLeg(MarketKey),

    #[error("insufficient capital on {venue}: need {needed}, free {free}")]
    InsufficientCapital {
        venue: Venue,
        needed: Decimal,
        free: Decimal,
    },

    #[error("pair not in cross-platform whitelist")]
    NotWhitelisted,

    #[error("sized to zero contracts")]
    ZeroQty,
}

impl RiskRejection {
    /// Stable label for the metrics counters.
    pub fn gate(&self) -> &'static str {
        match self {
            RiskRejection::VenueDown(_) => "venue_down",
            RiskRejection::OpenLeg(_) => "open_leg",
            RiskRejection::InsufficientCapital { .. } => "capital",
            RiskRejection::NotWhitelisted => "whitelist",
            RiskRejection::ZeroQty => "zero_qty",
        }
    }
}

/// Free-balance counter for one venue. Reservations move free capital to
/// reserved; settlement releases the reservation, deducts what was spent
/// and credits merge payouts.
#[derive(Debug, Clone)]
pub struct BalanceLedger {
    total: Decimal,
    reserved: Decimal,
}

impl BalanceLedger {
    pub fn new(total: Decimal) -> Self {
        Self {
            total,
            reserved: Decimal::ZERO,
        }
    }

    pub fn total(&self) -> Decimal {
        self.total
    }

    pub fn free(&self) -> Decimal {
        self.total - self.reserved
    }

    fn reserve(&mut self, amount: Decimal) -> bool {
        if amount > self.free() {
            return false;
        }
        self.reserved += amount;
        true
    }

    fn settle(&mut self, reserved: Decimal, spent: Decimal, credited: Decimal) {
        self.reserved = (self.reserved - reserved).max(Decimal::ZERO);
        self.total = self.total - spent + credited;
    }
}

/// An approved, sized and capital-reserved arb.
#[derive(Debug, Clone)]
pub struct Approval {
    pub arb_id: Uuid,
    pub signal: ArbSignal,
    pub qty: u64,
    /// Reserved on the yes leg's venue.
    pub yes_reserved: Decimal,
    /// Reserved on the no leg's venue.
    pub no_reserved: Decimal,
}

#[derive(Debug, Clone)]
pub struct RiskConfig {
    pub max_position_size_usd: Decimal,
    pub balance_fraction: Decimal,
    /// Whitelisted `(kalshi_ticker, polymarket_condition_id)` pairs.
    pub whitelist: HashSet<(String, String)>,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_position_size_usd: Decimal::new(1000, 0),
            balance_fraction: Decimal::new(2, 2),
            whitelist: HashSet::new(),
        }
    }
}

pub struct RiskEngine {
    cfg: RiskConfig,
    ledgers: HashMap<Venue, BalanceLedger>,
    live: HashMap<Venue, bool>,
    /// Markets with an in-flight state machine. One arb per market, full
    /// stop: entries are added at approval and cleared at terminal states.
    open: HashSet<MarketKey>,
}

impl RiskEngine {
    pub fn new(cfg: RiskConfig, kalshi_balance: Decimal, poly_balance: Decimal) -> Self {
        let mut ledgers = HashMap::new();
        ledgers.insert(Venue::Kalshi, BalanceLedger::new(kalshi_balance));
        ledgers.insert(Venue::Polymarket, BalanceLedger::new(poly_balance));
        let mut live = HashMap::new();
        live.insert(Venue::Kalshi, true);
        live.insert(Venue::Polymarket, true);
        Self {
            cfg,
            ledgers,
            live,
            open: HashSet::new(),
        }
    }

    pub fn set_venue_live(&mut self, venue: Venue, is_live: bool) {
        self.live.insert(venue, is_live);
    }

    pub fn free_balance(&self, venue: Venue) -> Decimal {
        self.ledgers.get(&venue).map(|l| l.free()).unwrap_or_default()
    }

    /// Run the gate sequence and, on success, reserve capital and mark the
    /// touched markets in flight.
    pub fn approve(&mut self, signal: &ArbSignal) -> Result<Approval, RiskRejection> {
        // (1) venue liveness
        for venue in [signal.yes_market.venue, signal.no_market.venue] {
            if !self.live.get(&venue).copied().unwrap_or(false) {
                return Err(RiskRejection::VenueDown(venue));
            }
        }

        // (2) open-leg: only one in-flight arb per (venue, market)
        for market in [&signal.yes_market, &signal.no_market] {
            if self.open.contains(market) {
                return Err(RiskRejection::OpenLeg(market.clone()));
            }
        }

        // Overheads (fees + gas) are carried half per leg.
        let overhead_pc = signal.est_fees_per_contract + signal.est_gas_per_contract;
        let half_overhead = overhead_pc / Decimal::TWO;
        let yes_cost_pc = signal.yes_ask + half_overhead;
        let no_cost_pc = signal.no_ask + half_overhead;

        // (3) capital: each leg's ledger must cover at least one contract
        let balance_qty = self.balance_qty(signal, yes_cost_pc, no_cost_pc)?;

        // (4) per-trade cap against the smaller involved balance
        let venue_balance = self
            .ledger(signal.yes_market.venue)
            .total()
            .min(self.ledger(signal.no_market.venue).total());
        let cap_usd = self
            .cfg
            .max_position_size_usd
            .min(self.cfg.balance_fraction * venue_balance);
        let cap_qty = (cap_usd / signal.pair_cost())
            .floor()
            .to_u64()
            .unwrap_or(0);

        // (5) whitelist, cross-platform only
        if signal.kind == ArbKind::CrossPlatform && !self.is_whitelisted(signal) {
            return Err(RiskRejection::NotWhitelisted);
        }

        // (6) sizing
        let qty = signal.max_qty.min(cap_qty).min(balance_qty);
        if qty == 0 {
            return Err(RiskRejection::ZeroQty);
        }

        let yes_reserved = Decimal::from(qty) * yes_cost_pc;
        let no_reserved = Decimal::from(qty) * no_cost_pc;
        if signal.yes_market.venue == signal.no_market.venue {
            let ok = self
                .ledger_mut(signal.yes_market.venue)
                .reserve(yes_reserved + no_reserved);
            debug_assert!(ok, "sizing guaranteed coverage");
        } else {
            self.ledger_mut(signal.yes_market.venue).reserve(yes_reserved);
            self.ledger_mut(signal.no_market.venue).reserve(no_reserved);
        }

        self.open.insert(signal.yes_market.clone());
        self.open.insert(signal.no_market.clone());

        debug!(
            "Approved {} x {} + {} (reserved {} / {})",
            qty, signal.yes_market, signal.no_market, yes_reserved, no_reserved
        );

        Ok(Approval {
            arb_id: Uuid::new_v4(),
            signal: signal.clone(),
            qty,
            yes_reserved,
            no_reserved,
        })
    }

    /// Settle one leg's reservation at a terminal state: the reservation
    /// is released, actual spend deducted, merge payouts credited.
    pub fn settle_leg(&mut self, venue: Venue, reserved: Decimal, spent: Decimal, credited: Decimal) {
        self.ledger_mut(venue).settle(reserved, spent, credited);
    }

    /// Clear the in-flight marker once the arb's machine is terminal.
    pub fn clear_market(&mut self, market: &MarketKey) {
        self.open.remove(market);
    }

    fn balance_qty(
        &self,
        signal: &ArbSignal,
        yes_cost_pc: Decimal,
        no_cost_pc: Decimal,
    ) -> Result<u64, RiskRejection> {
        let mut qty = u64::MAX;
        let legs = if signal.yes_market.venue == signal.no_market.venue {
            vec![(signal.yes_market.venue, yes_cost_pc + no_cost_pc)]
        } else {
            vec![
                (signal.yes_market.venue, yes_cost_pc),
                (signal.no_market.venue, no_cost_pc),
            ]
        };
        for (venue, cost_pc) in legs {
            let free = self.ledger(venue).free();
            if free < cost_pc {
                return Err(RiskRejection::InsufficientCapital {
                    venue,
                    needed: cost_pc,
                    free,
                });
            }
            qty = qty.min((free / cost_pc).floor().to_u64().unwrap_or(0));
        }
        Ok(qty)
    }

    fn is_whitelisted(&self, signal: &ArbSignal) -> bool {
        let (kalshi, poly) = match (signal.yes_market.venue, signal.no_market.venue) {
            (Venue::Kalshi, Venue::Polymarket) => (&signal.yes_market, &signal.no_market),
            (Venue::Polymarket, Venue::Kalshi) => (&signal.no_market, &signal.yes_market),
            _ => return false,
        };
        self.cfg
            .whitelist
            .contains(&(kalshi.market_id.clone(), poly.market_id.clone()))
    }

    fn ledger(&self, venue: Venue) -> &BalanceLedger {
        self.ledgers.get(&venue).expect("ledger exists per venue")
    }

    fn ledger_mut(&mut self, venue: Venue) -> &mut BalanceLedger {
        self.ledgers.get_mut(&venue).expect("ledger exists per venue")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn poly_signal(max_qty: u64) -> ArbSignal {
        ArbSignal {
            kind: ArbKind::PolymarketIntra,
            yes_market: MarketKey::new(Venue::Polymarket, "0xcond"),
            no_market: MarketKey::new(Venue::Polymarket, "0xcond"),
            yes_ask: dec!(0.45),
            no_ask: dec!(0.53),
            max_qty,
            est_fees_per_contract: dec!(0),
            est_gas_per_contract: dec!(0.005),
            net_edge_per_contract: dec!(0.015),
            ts: Utc::now(),
        }
    }

    fn cross_signal() -> ArbSignal {
        ArbSignal {
            kind: ArbKind::CrossPlatform,
            yes_market: MarketKey::new(Venue::Kalshi, "KXBTC"),
            no_market: MarketKey::new(Venue::Polymarket, "0xcond"),
            yes_ask: dec!(0.44),
            no_ask: dec!(0.48),
            max_qty: 20,
            est_fees_per_contract: dec!(0.0175),
            est_gas_per_contract: dec!(0),
            net_edge_per_contract: dec!(0.0625),
            ts: Utc::now(),
        }
    }

    fn engine(whitelist: HashSet<(String, String)>) -> RiskEngine {
        RiskEngine::new(
            RiskConfig {
                whitelist,
                ..RiskConfig::default()
            },
            dec!(10000),
            dec!(10000),
        )
    }

    #[test]
    fn test_approval_reserves_capital() {
        let mut risk = engine(HashSet::new());
        let approval = risk.approve(&poly_signal(10)).unwrap();

        assert_eq!(approval.qty, 10);
        // 10 * (0.45 + 0.0025) + 10 * (0.53 + 0.0025) = 9.85
        assert_eq!(
            approval.yes_reserved + approval.no_reserved,
            dec!(9.85)
        );
        assert_eq!(risk.free_balance(Venue::Polymarket), dec!(10000) - dec!(9.85));
    }

    #[test]
    fn test_open_leg_blocks_second_arb() {
        let mut risk = engine(HashSet::new());
        risk.approve(&poly_signal(10)).unwrap();

        let err = risk.approve(&poly_signal(10)).unwrap_err();
        assert!(matches!(err, RiskRejection::OpenLeg(_)));

        // Terminal state frees the market again.
        risk.clear_market(&MarketKey::new(Venue::Polymarket, "0xcond"));
        assert!(risk.approve(&poly_signal(10)).is_ok());
    }

    #[test]
    fn test_venue_down_rejected() {
        let mut risk = engine(HashSet::new());
        risk.set_venue_live(Venue::Polymarket, false);
        assert!(matches!(
            risk.approve(&poly_signal(10)),
            Err(RiskRejection::VenueDown(Venue::Polymarket))
        ));
    }

    #[test]
    fn test_per_trade_cap_bounds_qty() {
        // balance_fraction 0.02 of $10,000 caps the trade at $200:
        // floor(200 / 0.98) = 204 contracts.
        let mut risk = engine(HashSet::new());
        let approval = risk.approve(&poly_signal(100_000)).unwrap();
        assert_eq!(approval.qty, 204);
    }

    #[test]
    fn test_insufficient_capital_rejected() {
        let mut risk = RiskEngine::new(RiskConfig::default(), dec!(10000), dec!(0.10));
        let err = risk.approve(&poly_signal(10)).unwrap_err();
        assert!(matches!(
            err,
            RiskRejection::InsufficientCapital {
                venue: Venue::Polymarket,
                ..
            }
        ));
    }

    #[test]
    fn test_whitelist_miss_rejected_even_with_edge() {
        let mut risk = engine(HashSet::new());
        let err = risk.approve(&cross_signal()).unwrap_err();
        assert_eq!(err, RiskRejection::NotWhitelisted);
    }

    #[test]
    fn test_whitelisted_cross_pair_approved() {
        let mut whitelist = HashSet::new();
        whitelist.insert(("KXBTC".to_string(), "0xcond".to_string()));
        let mut risk = engine(whitelist);

        let approval = risk.approve(&cross_signal()).unwrap();
        assert_eq!(approval.qty, 20);
        // Each venue reserved only its own leg.
        assert!(risk.free_balance(Venue::Kalshi) < dec!(10000));
        assert!(risk.free_balance(Venue::Polymarket) < dec!(10000));
    }

    #[test]
    fn test_settle_releases_and_credits() {
        let mut risk = engine(HashSet::new());
        let approval = risk.approve(&poly_signal(10)).unwrap();
        let reserved = approval.yes_reserved + approval.no_reserved;

        // Both legs fill for $9.80, merge pays out $10.00.
        risk.settle_leg(Venue::Polymarket, reserved, dec!(9.80), dec!(10.00));
        risk.clear_market(&MarketKey::new(Venue::Polymarket, "0xcond"));

        assert_eq!(risk.free_balance(Venue::Polymarket), dec!(10000.20));
    }

    #[test]
    fn test_aborted_arb_returns_full_reservation() {
        let mut risk = engine(HashSet::new());
        let approval = risk.approve(&poly_signal(10)).unwrap();
        let reserved = approval.yes_reserved + approval.no_reserved;

        risk.settle_leg(Venue::Polymarket, reserved, dec!(0), dec!(0));
        assert_eq!(risk.free_balance(Venue::Polymarket), dec!(10000));
    }
}
