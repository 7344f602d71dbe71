//! Unified order book with synthetic-ask reconstruction for Kalshi.
//!
//! Kalshi's feed delivers only bid ladders; the executable ask on one side
//! is the reflection of the opposing side's bid:
//! `Ask_Yes(px) = 1.00 - Bid_No(1.00 - px)` (and symmetrically for No).
//! Polymarket delivers all four ladders natively.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use thiserror::Error;

use crate::models::{BookLevel, Side, Venue};

/// Venue tick size in dollars. Both venues quote in whole cents.
pub fn tick() -> Decimal {
    Decimal::new(1, 2)
}

#[derive(Debug, Error)]
pub enum BookError {
    #[error("crossed book on {side} side: bid {bid} vs ask {ask}")]
    Crossed {
        side: Side,
        bid: Decimal,
        ask: Decimal,
    },

    #[error("stale update: seq {got} <= last {last}")]
    StaleSequence { got: u64, last: u64 },

    #[error("sequence gap: expected {expected}, got {got}")]
    SequenceGap { expected: u64, got: u64 },

    #[error("synthetic ask ladder of a Kalshi book cannot be updated directly")]
    SyntheticLadder,
}

/// Bid or ask ladder of one side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LadderKind {
    Bid,
    Ask,
}

/// Replacement contents for a snapshot. `None` ladders are left untouched,
/// so a Polymarket per-token book message can replace only its own side.
#[derive(Debug, Clone, Default)]
pub struct LadderUpdate {
    pub yes_bids: Option<Vec<BookLevel>>,
    pub no_bids: Option<Vec<BookLevel>>,
    pub yes_asks: Option<Vec<BookLevel>>,
    pub no_asks: Option<Vec<BookLevel>>,
}

/// Normalized event emitted by a venue feed adapter.
#[derive(Debug, Clone)]
pub enum FeedEvent {
    Snapshot {
        market_id: String,
        seq: u64,
        is_provisional: bool,
        ladders: LadderUpdate,
    },
    /// Absolute-quantity level update. `new_qty == 0` removes the level.
    Delta {
        market_id: String,
        side: Side,
        ladder: LadderKind,
        price: Decimal,
        new_qty: u64,
        seq: u64,
    },
    /// The adapter lost sequence continuity; the book must be discarded
    /// until the next snapshot arrives.
    Desync { market_id: String },
}

/// Order book for one `(venue, market_id)`.
#[derive(Debug, Clone)]
pub struct OrderBook {
    pub venue: Venue,
    pub market_id: String,
    pub last_update_seq: u64,
    pub last_update_ts: DateTime<Utc>,
    /// Venue-flagged provisional books are held but never published.
    pub is_provisional: bool,
    yes_bids: BTreeMap<Decimal, u64>,
    no_bids: BTreeMap<Decimal, u64>,
    yes_asks: BTreeMap<Decimal, u64>,
    no_asks: BTreeMap<Decimal, u64>,
}

impl OrderBook {
    pub fn new(venue: Venue, market_id: impl Into<String>) -> Self {
        Self {
            venue,
            market_id: market_id.into(),
            last_update_seq: 0,
            last_update_ts: Utc::now(),
            is_provisional: false,
            yes_bids: BTreeMap::new(),
            no_bids: BTreeMap::new(),
            yes_asks: BTreeMap::new(),
            no_asks: BTreeMap::new(),
        }
    }

    /// Replace ladder contents from a snapshot and rebuild synthetic asks.
    pub fn apply_snapshot(
        &mut self,
        seq: u64,
        is_provisional: bool,
        ladders: LadderUpdate,
    ) -> Result<(), BookError> {
        if let Some(levels) = ladders.yes_bids {
            self.yes_bids = Self::to_ladder(levels);
        }
        if let Some(levels) = ladders.no_bids {
            self.no_bids = Self::to_ladder(levels);
        }
        if self.venue == Venue::Kalshi {
            // Asks are always derived, never taken from the wire.
            self.rebuild_synthetic_asks();
        } else {
            if let Some(levels) = ladders.yes_asks {
                self.yes_asks = Self::to_ladder(levels);
            }
            if let Some(levels) = ladders.no_asks {
                self.no_asks = Self::to_ladder(levels);
            }
        }

        self.is_provisional = is_provisional;
        self.last_update_seq = seq;
        self.last_update_ts = Utc::now();
        self.validate()
    }

    /// Apply a single absolute-quantity level update.
    ///
    /// Kalshi sequence numbers are contiguous: a gap is an error the caller
    /// must resolve by resnapshotting. Polymarket sequences (timestamps)
    /// only need to be monotone.
    pub fn apply_delta(
        &mut self,
        side: Side,
        ladder: LadderKind,
        price: Decimal,
        new_qty: u64,
        seq: u64,
    ) -> Result<(), BookError> {
        if seq <= self.last_update_seq {
            return Err(BookError::StaleSequence {
                got: seq,
                last: self.last_update_seq,
            });
        }
        if self.venue == Venue::Kalshi && seq != self.last_update_seq + 1 {
            return Err(BookError::SequenceGap {
                expected: self.last_update_seq + 1,
                got: seq,
            });
        }
        if self.venue == Venue::Kalshi && ladder == LadderKind::Ask {
            return Err(BookError::SyntheticLadder);
        }

        let book = match (side, ladder) {
            (Side::Yes, LadderKind::Bid) => &mut self.yes_bids,
            (Side::No, LadderKind::Bid) => &mut self.no_bids,
            (Side::Yes, LadderKind::Ask) => &mut self.yes_asks,
            (Side::No, LadderKind::Ask) => &mut self.no_asks,
        };
        if new_qty == 0 {
            book.remove(&price);
        } else {
            book.insert(price, new_qty);
        }

        if self.venue == Venue::Kalshi {
            // The transform is a linear reflection, so a full O(levels)
            // recomputation of the opposing ask ladder is cheap.
            self.rebuild_synthetic_asks();
        }

        self.last_update_seq = seq;
        self.last_update_ts = Utc::now();
        self.validate()
    }

    /// Best (highest) bid for a side.
    pub fn best_bid(&self, side: Side) -> Option<BookLevel> {
        let ladder = match side {
            Side::Yes => &self.yes_bids,
            Side::No => &self.no_bids,
        };
        ladder
            .iter()
            .next_back()
            .map(|(p, q)| BookLevel::new(*p, *q))
    }

    /// Best (lowest) executable ask for a side. `None` means no liquidity
    /// (the infinite-ask sentinel).
    pub fn best_ask(&self, side: Side) -> Option<BookLevel> {
        let ladder = match side {
            Side::Yes => &self.yes_asks,
            Side::No => &self.no_asks,
        };
        ladder.iter().next().map(|(p, q)| BookLevel::new(*p, *q))
    }

    /// Ask ladder for a side, ascending by price.
    pub fn ask_levels(&self, side: Side) -> Vec<BookLevel> {
        let ladder = match side {
            Side::Yes => &self.yes_asks,
            Side::No => &self.no_asks,
        };
        ladder
            .iter()
            .map(|(p, q)| BookLevel::new(*p, *q))
            .collect()
    }

    /// Bid ladder for a side, descending by price.
    pub fn bid_levels(&self, side: Side) -> Vec<BookLevel> {
        let ladder = match side {
            Side::Yes => &self.yes_bids,
            Side::No => &self.no_bids,
        };
        ladder
            .iter()
            .rev()
            .map(|(p, q)| BookLevel::new(*p, *q))
            .collect()
    }

    /// Derive both ask ladders from the opposing bid ladders.
    /// Quantity at each synthetic level equals the opposing bid quantity.
    fn rebuild_synthetic_asks(&mut self) {
        self.yes_asks = Self::reflect(&self.no_bids);
        self.no_asks = Self::reflect(&self.yes_bids);
    }

    fn reflect(bids: &BTreeMap<Decimal, u64>) -> BTreeMap<Decimal, u64> {
        bids.iter()
            .map(|(p, q)| (Decimal::ONE - *p, *q))
            .collect()
    }

    fn to_ladder(levels: Vec<BookLevel>) -> BTreeMap<Decimal, u64> {
        levels
            .into_iter()
            .filter(|l| l.qty > 0)
            .map(|l| (l.price, l.qty))
            .collect()
    }

    /// Top-of-book integrity: `best_bid <= best_ask - tick` on each side
    /// when both exist. A violating book is malformed and must be
    /// resnapshotted by the caller.
    fn validate(&self) -> Result<(), BookError> {
        for side in [Side::Yes, Side::No] {
            if let (Some(bid), Some(ask)) = (self.best_bid(side), self.best_ask(side)) {
                if bid.price > ask.price - tick() {
                    return Err(BookError::Crossed {
                        side,
                        bid: bid.price,
                        ask: ask.price,
                    });
                }
            }
        }
        Ok(())
    }
}
