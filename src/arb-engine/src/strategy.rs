//! Negative-spread detection engine.
//!
//! A Yes+No pair pays $1.00 at settlement, so any book state where
//! `Ask_Yes + Ask_No + fees + gas < 1.00` is riskless edge. The engine
//! re-evaluates a market on every published book snapshot, prices both
//! legs as takers at the ask, and emits a signal only when the net edge
//! clears the market's minimum viable spread.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use tokio::sync::watch;
use tracing::{debug, info};

use common::fees::{kalshi_taker_fee, polymarket_taker_fee_per_contract, GasEstimate};
use common::models::{ArbKind, ArbSignal, BookLevel, MarketKey, MarketMeta, Side, Venue};
use common::OrderBook;

/// Strategy thresholds and caps, in dollars per contract.
#[derive(Debug, Clone)]
pub struct StrategyConfig {
    /// Baseline minimum viable spread.
    pub min_spread: Decimal,
    /// Elevated threshold for short-duration crypto markets.
    pub crypto_short_min_spread: Decimal,
    /// Elevated threshold for cross-platform pairings.
    pub cross_platform_min_spread: Decimal,
    /// Hard per-signal contract cap regardless of book depth.
    pub capacity_cap: u64,
    /// Sizing multiplier for cross-platform pairings.
    pub cross_venue_risk_factor: Decimal,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            min_spread: Decimal::new(2, 2),
            crypto_short_min_spread: Decimal::new(4, 2),
            cross_platform_min_spread: Decimal::new(5, 2),
            capacity_cap: 500,
            cross_venue_risk_factor: Decimal::new(5, 1),
        }
    }
}

pub struct StrategyEngine {
    cfg: StrategyConfig,
    markets: HashMap<MarketKey, MarketMeta>,
    /// Whitelisted resolution-equivalent `(kalshi, polymarket)` pairs.
    whitelist: Vec<(MarketKey, MarketKey)>,
    /// Latest published snapshot per market.
    books: HashMap<MarketKey, Arc<OrderBook>>,
    gas_rx: watch::Receiver<GasEstimate>,
}

impl StrategyEngine {
    pub fn new(
        cfg: StrategyConfig,
        markets: Vec<MarketMeta>,
        whitelist: Vec<(MarketKey, MarketKey)>,
        gas_rx: watch::Receiver<GasEstimate>,
    ) -> Self {
        Self {
            cfg,
            markets: markets.into_iter().map(|m| (m.key.clone(), m)).collect(),
            whitelist,
            books: HashMap::new(),
            gas_rx,
        }
    }

    /// Evaluate a freshly published book. Returns candidate signals sorted
    /// by net edge, best first.
    pub fn on_book_update(&mut self, book: Arc<OrderBook>) -> Vec<ArbSignal> {
        let key = MarketKey::new(book.venue, book.market_id.clone());
        self.books.insert(key.clone(), book);

        let mut signals = Vec::new();
        if let Some(signal) = self.evaluate_intra(&key) {
            signals.push(signal);
        }

        for (kalshi_key, poly_key) in self.whitelist.clone() {
            if kalshi_key != key && poly_key != key {
                continue;
            }
            // Both pairings: Kalshi Yes + Polymarket No and the reverse.
            if let Some(signal) = self.evaluate_cross(&kalshi_key, &poly_key) {
                signals.push(signal);
            }
            if let Some(signal) = self.evaluate_cross(&poly_key, &kalshi_key) {
                signals.push(signal);
            }
        }

        signals.sort_by(|a, b| {
            b.net_edge_per_contract
                .cmp(&a.net_edge_per_contract)
        });
        signals
    }

    /// Same-market pairing: buy Yes and No on one venue.
    fn evaluate_intra(&self, key: &MarketKey) -> Option<ArbSignal> {
        let book = self.books.get(key)?;
        let meta = self.markets.get(key)?;

        let yes_top = book.best_ask(Side::Yes)?;
        let no_top = book.best_ask(Side::No)?;

        let kind = match key.venue {
            Venue::Polymarket => ArbKind::PolymarketIntra,
            Venue::Kalshi => ArbKind::KalshiIntra,
        };

        self.build_signal(
            kind,
            (key, meta, yes_top, book.ask_levels(Side::Yes)),
            (key, meta, no_top, book.ask_levels(Side::No)),
        )
    }

    /// Cross-platform pairing: Yes on `yes_key`, No on `no_key`.
    fn evaluate_cross(&self, yes_key: &MarketKey, no_key: &MarketKey) -> Option<ArbSignal> {
        let yes_book = self.books.get(yes_key)?;
        let no_book = self.books.get(no_key)?;
        let yes_meta = self.markets.get(yes_key)?;
        let no_meta = self.markets.get(no_key)?;

        let yes_top = yes_book.best_ask(Side::Yes)?;
        let no_top = no_book.best_ask(Side::No)?;

        self.build_signal(
            ArbKind::CrossPlatform,
            (yes_key, yes_meta, yes_top, yes_book.ask_levels(Side::Yes)),
            (no_key, no_meta, no_top, no_book.ask_levels(Side::No)),
        )
    }

    fn build_signal(
        &self,
        kind: ArbKind,
        yes_leg: (&MarketKey, &MarketMeta, BookLevel, Vec<BookLevel>),
        no_leg: (&MarketKey, &MarketMeta, BookLevel, Vec<BookLevel>),
    ) -> Option<ArbSignal> {
        let (yes_key, yes_meta, yes_top, yes_levels) = yes_leg;
        let (no_key, no_meta, no_top, no_levels) = no_leg;

        let threshold = self.threshold(kind, yes_meta, no_meta);

        // Worst realistic case for marketable orders: both legs take at
        // their top-of-book ask.
        let top_qty = yes_top
            .qty
            .min(no_top.qty)
            .min(self.cfg.capacity_cap)
            .max(1);
        let fees_pc = self.leg_fee_per_contract(yes_key.venue, yes_meta, yes_top.price, top_qty)
            + self.leg_fee_per_contract(no_key.venue, no_meta, no_top.price, top_qty);

        // Gas pays for the CTF merge; only the intra-Polymarket path merges.
        let gas_pc = if kind == ArbKind::PolymarketIntra {
            self.gas_rx.borrow().usd_per_merge
        } else {
            Decimal::ZERO
        };

        let net_edge = Decimal::ONE - yes_top.price - no_top.price - fees_pc - gas_pc;
        if net_edge < threshold {
            if net_edge > Decimal::ZERO {
                debug!(
                    "Sub-threshold edge {} on {} + {} (threshold {})",
                    net_edge, yes_key, no_key, threshold
                );
            }
            return None;
        }

        let mut max_qty = self.max_monotone_qty(&yes_levels, &no_levels, fees_pc, gas_pc);
        if kind == ArbKind::CrossPlatform {
            max_qty = scale_qty(max_qty, self.cfg.cross_venue_risk_factor);
        }
        if max_qty == 0 {
            return None;
        }

        info!(
            "Signal: {} yes@{} + {} no@{} edge {} qty {}",
            yes_key, yes_top.price, no_key, no_top.price, net_edge, max_qty
        );

        Some(ArbSignal {
            kind,
            yes_market: yes_key.clone(),
            no_market: no_key.clone(),
            yes_ask: yes_top.price,
            no_ask: no_top.price,
            max_qty,
            est_fees_per_contract: fees_pc,
            est_gas_per_contract: gas_pc,
            net_edge_per_contract: net_edge,
            ts: Utc::now(),
        })
    }

    /// Minimum viable spread for a pairing. Short-duration crypto markets
    /// always demand the elevated threshold, cross-platform pairings the
    /// larger of their own floor and the crypto one.
    fn threshold(&self, kind: ArbKind, yes_meta: &MarketMeta, no_meta: &MarketMeta) -> Decimal {
        let crypto_short = |m: &MarketMeta| m.is_crypto && m.timeframe.is_short_duration();
        let base = if crypto_short(yes_meta) || crypto_short(no_meta) {
            self.cfg.crypto_short_min_spread
        } else {
            self.cfg.min_spread
        };
        if kind == ArbKind::CrossPlatform {
            base.max(self.cfg.cross_platform_min_spread)
        } else {
            base
        }
    }

    fn leg_fee_per_contract(
        &self,
        venue: Venue,
        meta: &MarketMeta,
        price: Decimal,
        qty: u64,
    ) -> Decimal {
        match venue {
            Venue::Kalshi => {
                // The exact integer formula rounds per order, so the
                // per-contract share depends on the quantity.
                kalshi_taker_fee(qty, price) / Decimal::from(qty.max(1))
            }
            Venue::Polymarket => {
                polymarket_taker_fee_per_contract(price, meta.has_dynamic_fee())
            }
        }
    }

    /// Greedy walk across matching depth: accumulate quantity while each
    /// level pair still clears fees and gas, never crossing into a level
    /// that would turn the marginal edge non-positive.
    fn max_monotone_qty(
        &self,
        yes_levels: &[BookLevel],
        no_levels: &[BookLevel],
        fees_pc: Decimal,
        gas_pc: Decimal,
    ) -> u64 {
        let mut total = 0u64;
        let (mut yi, mut ni) = (0usize, 0usize);
        let mut y_rem = yes_levels.first().map(|l| l.qty).unwrap_or(0);
        let mut n_rem = no_levels.first().map(|l| l.qty).unwrap_or(0);

        while yi < yes_levels.len() && ni < no_levels.len() && total < self.cfg.capacity_cap {
            let edge = Decimal::ONE
                - yes_levels[yi].price
                - no_levels[ni].price
                - fees_pc
                - gas_pc;
            if edge <= Decimal::ZERO {
                break;
            }

            let chunk = y_rem.min(n_rem).min(self.cfg.capacity_cap - total);
            total += chunk;
            y_rem -= chunk;
            n_rem -= chunk;

            if y_rem == 0 {
                yi += 1;
                y_rem = yes_levels.get(yi).map(|l| l.qty).unwrap_or(0);
            }
            if n_rem == 0 {
                ni += 1;
                n_rem = no_levels.get(ni).map(|l| l.qty).unwrap_or(0);
            }
        }

        total
    }
}

fn scale_qty(qty: u64, factor: Decimal) -> u64 {
    use rust_decimal::prelude::ToPrimitive;
    (Decimal::from(qty) * factor).floor().to_u64().unwrap_or(0)
}
