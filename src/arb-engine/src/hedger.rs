//! Hedger: neutralizes a filled leg whose counterpart never arrived.
//!
//! Invoked only from the coordinator's hedge-needed state with a bounded
//! budget, and returns a terminal outcome rather than calling back into
//! the coordinator. Two strategies:
//!
//! - **Chase**: cross the spread with successive IOC orders stepping
//!   through ask levels, bounded by a price ceiling.
//! - **Fade**: rest a passive limit near the bid for a while, then
//!   escalate to chase with whatever remains.

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use tracing::{info, warn};

use common::book::tick;
use common::models::{Fill, HedgeOutcome, MarketMeta, Side, Venue};
use common::OrderBook;

use crate::adapters::{KalshiOrderAdapter, PolymarketOrderAdapter};

#[derive(Debug, Clone)]
pub struct HedgerConfig {
    /// Max acceptable loss per contract when buying the missing leg.
    pub max_loss_per_contract: Decimal,
    /// How long a fade limit rests before escalating to chase.
    pub fade_timeout: Duration,
    /// Ladder levels a chase may consume.
    pub max_chase_levels: usize,
}

impl Default for HedgerConfig {
    fn default() -> Self {
        Self {
            max_loss_per_contract: Decimal::new(5, 2),
            fade_timeout: Duration::from_millis(3000),
            max_chase_levels: 5,
        }
    }
}

/// One hedge assignment: buy `qty` of `side` on the leg's own market.
#[derive(Debug, Clone)]
pub struct HedgeRequest {
    pub market: MarketMeta,
    pub side: Side,
    pub qty: u64,
    /// Average cost of the leg we already hold.
    pub leg1_avg_cost: Decimal,
    /// Book snapshot taken when the hedge was triggered.
    pub book: Arc<OrderBook>,
}

pub struct Hedger {
    kalshi: Arc<dyn KalshiOrderAdapter>,
    poly: Arc<dyn PolymarketOrderAdapter>,
    cfg: HedgerConfig,
}

impl Hedger {
    pub fn new(
        kalshi: Arc<dyn KalshiOrderAdapter>,
        poly: Arc<dyn PolymarketOrderAdapter>,
        cfg: HedgerConfig,
    ) -> Self {
        Self { kalshi, poly, cfg }
    }

    /// Acquire the missing leg within the loss budget. The ceiling bounds
    /// the worst pair cost at `1 + max_loss_per_contract`.
    pub async fn resolve(&self, req: HedgeRequest) -> HedgeOutcome {
        let ceiling = Decimal::ONE - req.leg1_avg_cost + self.cfg.max_loss_per_contract;
        info!(
            "Hedging {} x{} {} (ceiling {})",
            req.market.key, req.qty, req.side, ceiling
        );

        let asks = req.book.ask_levels(req.side);
        let depth_within_ceiling: u64 = asks
            .iter()
            .filter(|l| l.price <= ceiling)
            .map(|l| l.qty)
            .sum();

        let mut remaining = req.qty;
        let mut cost = Decimal::ZERO;

        // Thin book or adverse move: rest passively first.
        if depth_within_ceiling < req.qty {
            let target = fade_price(&req, ceiling);
            match self.place_passive(&req, target, remaining).await {
                Ok(fill) => {
                    cost += fill.notional();
                    remaining -= fill.qty.min(remaining);
                }
                Err(e) => warn!("Fade order failed: {}", e),
            }
            if remaining == 0 {
                return hedged(req.qty, cost);
            }
            info!("Fade left {} unfilled; escalating to chase", remaining);
        }

        // Chase: step through ask levels below the ceiling.
        for level in asks.iter().take(self.cfg.max_chase_levels) {
            if remaining == 0 {
                break;
            }
            if level.price > ceiling {
                warn!(
                    "Chase stopped at {} (ceiling {}), {} unhedged",
                    level.price, ceiling, remaining
                );
                break;
            }
            let take = remaining.min(level.qty);
            match self.place_ioc(&req, level.price, take).await {
                Ok(fill) => {
                    cost += fill.notional();
                    remaining -= fill.qty.min(remaining);
                }
                Err(e) => {
                    warn!("Chase order at {} failed: {}", level.price, e);
                }
            }
        }

        if remaining == 0 {
            hedged(req.qty, cost)
        } else {
            warn!(
                "Hedge budget exhausted on {}: {} of {} unhedged",
                req.market.key, remaining, req.qty
            );
            HedgeOutcome::ClosedAtLoss {
                unhedged_qty: remaining,
            }
        }
    }

    async fn place_ioc(
        &self,
        req: &HedgeRequest,
        price: Decimal,
        qty: u64,
    ) -> anyhow::Result<Fill> {
        match req.market.key.venue {
            Venue::Kalshi => {
                self.kalshi
                    .place_limit_ioc(&req.market.key.market_id, req.side, to_cents(price), qty)
                    .await
            }
            Venue::Polymarket => {
                let token = req
                    .market
                    .token_id(req.side)
                    .ok_or_else(|| anyhow::anyhow!("missing token id for {}", req.market.key))?;
                self.poly.place_fok(token, price, qty).await
            }
        }
    }

    async fn place_passive(
        &self,
        req: &HedgeRequest,
        price: Decimal,
        qty: u64,
    ) -> anyhow::Result<Fill> {
        match req.market.key.venue {
            Venue::Kalshi => {
                self.kalshi
                    .place_passive(
                        &req.market.key.market_id,
                        req.side,
                        to_cents(price),
                        qty,
                        self.cfg.fade_timeout,
                    )
                    .await
            }
            Venue::Polymarket => {
                let token = req
                    .market
                    .token_id(req.side)
                    .ok_or_else(|| anyhow::anyhow!("missing token id for {}", req.market.key))?;
                self.poly
                    .place_passive(token, price, qty, self.cfg.fade_timeout)
                    .await
            }
        }
    }
}

/// Join the bid one tick inside, never above the ceiling.
fn fade_price(req: &HedgeRequest, ceiling: Decimal) -> Decimal {
    let joined = req
        .book
        .best_bid(req.side)
        .map(|b| b.price + tick())
        .unwrap_or(ceiling);
    joined.min(ceiling)
}

fn hedged(qty: u64, cost: Decimal) -> HedgeOutcome {
    HedgeOutcome::HedgedToNeutral {
        fill: Fill {
            qty,
            avg_price: if qty > 0 {
                cost / Decimal::from(qty)
            } else {
                Decimal::ZERO
            },
        },
    }
}

fn to_cents(price: Decimal) -> u32 {
    (price * Decimal::new(100, 0))
        .round()
        .to_u32()
        .unwrap_or(0)
}
