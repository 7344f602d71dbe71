//! Common library for the pair-arb engine.
//!
//! Provides shared functionality:
//! - Configuration loading from .env
//! - Unified order book with Kalshi synthetic-ask reconstruction
//! - Venue fee and gas models
//! - Venue feed adapters (Kalshi WS, Polymarket CLOB WS)
//! - Database connection pooling and the trade/position repository

pub mod book;
pub mod clob;
pub mod config;
pub mod db;
pub mod fees;
pub mod kalshi_ws;
pub mod models;
pub mod repository;

pub use book::{BookError, FeedEvent, LadderKind, LadderUpdate, OrderBook};
pub use clob::{ClobError, PolymarketFeed, TokenMap};
pub use config::Config;
pub use db::Database;
pub use fees::{GasEstimate, GasOracle};
pub use kalshi_ws::{FeedError, KalshiFeed, KalshiSigner};
pub use models::{
    ArbKind, ArbSignal, BookLevel, Fill, HedgeOutcome, LegState, MarketKey, MarketMeta, Position,
    Side, Timeframe, TradeRecord, Venue,
};
