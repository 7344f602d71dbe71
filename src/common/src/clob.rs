//! Polymarket CLOB WebSocket feed adapter.
//!
//! Polymarket books are native on all four ladders, but each outcome token
//! has its own book. The adapter owns the token -> (market, side) mapping
//! and decodes every frame straight into the normalized `FeedEvent`s the
//! book store consumes: a per-token `book` frame becomes a one-sided
//! snapshot keyed by the market's condition id, a `price_change` frame
//! becomes absolute-quantity deltas. Event timestamps serve as the
//! monotone sequence.

use std::collections::HashMap;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, warn};

use crate::book::{FeedEvent, LadderKind, LadderUpdate};
use crate::models::{BookLevel, Side};

#[derive(Debug, Error)]
pub enum ClobError {
    #[error("WebSocket connection failed: {0}")]
    ConnectionError(#[from] WsError),

    #[error("Failed to parse message: {0}")]
    ParseError(String),

    #[error("Connection timeout")]
    Timeout,

    #[error("Channel closed")]
    ChannelClosed,
}

/// Price level on the wire; prices and sizes arrive as strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireLevel {
    pub price: String,
    pub size: String,
}

impl WireLevel {
    /// Parse into a book level. Fractional share sizes floor to whole
    /// contracts; unparseable or empty levels drop.
    pub fn to_level(&self) -> Option<BookLevel> {
        let price = self.price.parse::<Decimal>().ok()?;
        let qty = self.size.parse::<Decimal>().ok()?.floor().to_u64()?;
        (qty > 0).then_some(BookLevel::new(price, qty))
    }
}

/// Full book frame for one outcome token. Only the fields the book store
/// needs are kept; serde drops the rest.
#[derive(Debug, Clone, Deserialize)]
pub struct BookMessage {
    pub asset_id: String,
    /// Bids (buy orders). May be named "buys" in some API versions.
    #[serde(alias = "buys")]
    pub bids: Vec<WireLevel>,
    /// Asks (sell orders). May be named "sells" in some API versions.
    #[serde(alias = "sells")]
    pub asks: Vec<WireLevel>,
    pub timestamp: String,
}

impl BookMessage {
    fn seq(&self) -> u64 {
        self.timestamp.parse().unwrap_or(0)
    }

    /// Ladder replacement for the side this token represents. A book
    /// frame only covers its own token, so the opposite side's ladders
    /// stay untouched.
    fn ladder_update(&self, side: Side) -> LadderUpdate {
        let bids = Some(self.bids.iter().filter_map(WireLevel::to_level).collect());
        let asks = Some(self.asks.iter().filter_map(WireLevel::to_level).collect());
        match side {
            Side::Yes => LadderUpdate {
                yes_bids: bids,
                yes_asks: asks,
                ..Default::default()
            },
            Side::No => LadderUpdate {
                no_bids: bids,
                no_asks: asks,
                ..Default::default()
            },
        }
    }
}

/// Level change for one outcome token.
#[derive(Debug, Clone, Deserialize)]
pub struct PriceChange {
    pub asset_id: String,
    pub price: String,
    pub size: String,
    pub side: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PriceChangeMessage {
    pub price_changes: Vec<PriceChange>,
    pub timestamp: String,
}

/// Subscription request to the market channel.
#[derive(Debug, Serialize)]
pub struct SubscribeRequest {
    #[serde(rename = "type")]
    pub msg_type: String,
    pub assets_ids: Vec<String>,
}

impl SubscribeRequest {
    pub fn market(asset_ids: Vec<String>) -> Self {
        Self {
            msg_type: "market".to_string(),
            assets_ids: asset_ids,
        }
    }
}

/// Maps an outcome token id to its market and side.
#[derive(Debug, Clone, Default)]
pub struct TokenMap {
    tokens: HashMap<String, (String, Side)>,
}

impl TokenMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, token_id: impl Into<String>, market_id: impl Into<String>, side: Side) {
        self.tokens
            .insert(token_id.into(), (market_id.into(), side));
    }

    pub fn get(&self, token_id: &str) -> Option<&(String, Side)> {
        self.tokens.get(token_id)
    }

    pub fn token_ids(&self) -> Vec<String> {
        self.tokens.keys().cloned().collect()
    }
}

/// Polymarket CLOB feed client.
pub struct PolymarketFeed {
    ws_url: String,
    tokens: TokenMap,
    reconnect_delay: Duration,
    max_reconnect_delay: Duration,
}

impl PolymarketFeed {
    pub fn new(clob_ws_url: &str, tokens: TokenMap) -> Self {
        Self {
            ws_url: format!("{}/market", clob_ws_url),
            tokens,
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(30),
        }
    }

    /// Decode one text frame into normalized feed events. Pings, frames
    /// for untracked tokens and unknown event types decode to nothing.
    fn decode_frame(&self, text: &str) -> Vec<FeedEvent> {
        if text == "ping" {
            return Vec::new();
        }
        let Ok(value) = serde_json::from_str::<serde_json::Value>(text) else {
            debug!("Undecodable CLOB frame: {}", &text[..text.len().min(120)]);
            return Vec::new();
        };

        // The initial subscription response is an array of per-token books.
        if let Some(items) = value.as_array() {
            return items
                .iter()
                .filter_map(|item| self.decode_book(item))
                .collect();
        }

        match value.get("event_type").and_then(|e| e.as_str()) {
            Some("book") => self.decode_book(&value).into_iter().collect(),
            Some("price_change") => self.decode_changes(&value),
            Some(other) => {
                debug!("Ignoring CLOB event type {}", other);
                Vec::new()
            }
            None => Vec::new(),
        }
    }

    /// A `book` frame replaces the ladders of the side its token maps to.
    fn decode_book(&self, value: &serde_json::Value) -> Option<FeedEvent> {
        if value.get("event_type").and_then(|e| e.as_str()) != Some("book") {
            return None;
        }
        let book: BookMessage = serde_json::from_value(value.clone()).ok()?;
        let (market_id, side) = self.tokens.get(&book.asset_id)?;
        Some(FeedEvent::Snapshot {
            market_id: market_id.clone(),
            seq: book.seq(),
            is_provisional: false,
            ladders: book.ladder_update(*side),
        })
    }

    /// A `price_change` frame carries absolute new quantities per level;
    /// size zero removes the level.
    fn decode_changes(&self, value: &serde_json::Value) -> Vec<FeedEvent> {
        let Ok(msg) = serde_json::from_value::<PriceChangeMessage>(value.clone()) else {
            warn!("Unparseable price_change frame");
            return Vec::new();
        };
        let seq = msg.timestamp.parse().unwrap_or(0);
        msg.price_changes
            .iter()
            .filter_map(|change| {
                let (market_id, side) = self.tokens.get(&change.asset_id)?;
                let price = change.price.parse::<Decimal>().ok()?;
                let new_qty = change.size.parse::<Decimal>().ok()?.floor().to_u64()?;
                let ladder = match change.side.to_uppercase().as_str() {
                    "BUY" => LadderKind::Bid,
                    "SELL" => LadderKind::Ask,
                    other => {
                        warn!("Unknown price change side: {}", other);
                        return None;
                    }
                };
                Some(FeedEvent::Delta {
                    market_id: market_id.clone(),
                    side: *side,
                    ladder,
                    price,
                    new_qty,
                    seq,
                })
            })
            .collect()
    }

    async fn connect(&self) -> Result<WebSocketStream<MaybeTlsStream<TcpStream>>, ClobError> {
        info!("Connecting to CLOB WebSocket: {}", self.ws_url);
        let (ws_stream, _) = timeout(Duration::from_secs(30), connect_async(&self.ws_url))
            .await
            .map_err(|_| ClobError::Timeout)?
            .map_err(ClobError::ConnectionError)?;
        info!("Connected to CLOB WebSocket");
        Ok(ws_stream)
    }

    /// Connect, subscribe and forward decoded events until the connection
    /// drops.
    pub async fn stream(&self, tx: mpsc::Sender<FeedEvent>) -> Result<(), ClobError> {
        let mut ws = self.connect().await?;

        let request = SubscribeRequest::market(self.tokens.token_ids());
        let json =
            serde_json::to_string(&request).map_err(|e| ClobError::ParseError(e.to_string()))?;
        info!("Subscribing to {} Polymarket tokens", request.assets_ids.len());
        ws.send(Message::Text(json.into())).await?;

        while let Some(msg) = ws.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    for event in self.decode_frame(&text) {
                        tx.send(event)
                            .await
                            .map_err(|_| ClobError::ChannelClosed)?;
                    }
                }
                Ok(Message::Ping(data)) => {
                    ws.send(Message::Pong(data)).await?;
                }
                Ok(Message::Close(_)) => {
                    info!("CLOB WebSocket closed by server");
                    break;
                }
                Err(e) => {
                    error!("CLOB WebSocket error: {}", e);
                    return Err(ClobError::ConnectionError(e));
                }
                _ => {}
            }
        }

        Ok(())
    }
}

/// Run the Polymarket feed with capped-backoff reconnection.
pub async fn run_polymarket_feed(
    clob_ws_url: String,
    tokens: TokenMap,
    tx: mpsc::Sender<FeedEvent>,
) -> Result<(), ClobError> {
    let feed = PolymarketFeed::new(&clob_ws_url, tokens);
    let mut delay = feed.reconnect_delay;

    loop {
        match feed.stream(tx.clone()).await {
            Ok(()) => {
                info!("Polymarket feed ended; reconnecting");
                delay = feed.reconnect_delay;
            }
            Err(ClobError::ChannelClosed) => return Ok(()),
            Err(e) => {
                error!("Polymarket feed error: {}", e);
            }
        }
        info!("Reconnecting Polymarket feed in {:?}", delay);
        sleep(delay).await;
        delay = std::cmp::min(delay * 2, feed.max_reconnect_delay);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn feed() -> PolymarketFeed {
        let mut tokens = TokenMap::new();
        tokens.insert("yes-token", "0xcond", Side::Yes);
        tokens.insert("no-token", "0xcond", Side::No);
        PolymarketFeed::new("wss://example", tokens)
    }

    #[test]
    fn test_wire_level_parsing() {
        let level = WireLevel {
            price: "0.45".to_string(),
            size: "100.7".to_string(),
        };
        // Fractional shares floor to whole contracts.
        assert_eq!(level.to_level(), Some(BookLevel::new(dec!(0.45), 100)));

        let empty = WireLevel {
            price: "0.45".to_string(),
            size: "0".to_string(),
        };
        assert_eq!(empty.to_level(), None);

        let garbage = WireLevel {
            price: "n/a".to_string(),
            size: "10".to_string(),
        };
        assert_eq!(garbage.to_level(), None);
    }

    #[test]
    fn test_book_frame_decodes_to_one_sided_snapshot() {
        let json = r#"{
            "event_type": "book",
            "asset_id": "yes-token",
            "market": "0xcond",
            "bids": [{"price": "0.44", "size": "100"}],
            "asks": [{"price": "0.45", "size": "50"}],
            "timestamp": "1700000000000",
            "hash": "abc"
        }"#;
        let events = feed().decode_frame(json);
        assert_eq!(events.len(), 1);
        match &events[0] {
            FeedEvent::Snapshot {
                market_id,
                seq,
                ladders,
                ..
            } => {
                assert_eq!(market_id, "0xcond");
                assert_eq!(*seq, 1_700_000_000_000);
                assert_eq!(
                    ladders.yes_asks,
                    Some(vec![BookLevel::new(dec!(0.45), 50)])
                );
                assert_eq!(
                    ladders.yes_bids,
                    Some(vec![BookLevel::new(dec!(0.44), 100)])
                );
                // The NO token's ladders are untouched by a YES book.
                assert!(ladders.no_bids.is_none());
                assert!(ladders.no_asks.is_none());
            }
            other => panic!("expected snapshot, got {other:?}"),
        }
    }

    #[test]
    fn test_initial_array_decodes_tracked_books_only() {
        let json = r#"[
            {
                "event_type": "book",
                "asset_id": "no-token",
                "buys": [{"price": "0.52", "size": "20"}],
                "sells": [],
                "timestamp": "1700000000000"
            },
            {
                "event_type": "book",
                "asset_id": "someone-elses-token",
                "bids": [],
                "asks": [],
                "timestamp": "1700000000000"
            }
        ]"#;
        let events = feed().decode_frame(json);
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            FeedEvent::Snapshot { market_id, .. } if market_id == "0xcond"
        ));
    }

    #[test]
    fn test_price_change_decodes_sides_and_removals() {
        let json = r#"{
            "event_type": "price_change",
            "market": "0xcond",
            "price_changes": [
                {"asset_id": "no-token", "price": "0.53", "size": "40", "side": "SELL"},
                {"asset_id": "yes-token", "price": "0.44", "size": "0", "side": "BUY"}
            ],
            "timestamp": "1700000000002"
        }"#;
        let events = feed().decode_frame(json);
        assert_eq!(events.len(), 2);

        match &events[0] {
            FeedEvent::Delta {
                market_id,
                side,
                ladder,
                price,
                new_qty,
                seq,
            } => {
                assert_eq!(market_id, "0xcond");
                assert_eq!(*side, Side::No);
                assert_eq!(*ladder, LadderKind::Ask);
                assert_eq!(*price, dec!(0.53));
                assert_eq!(*new_qty, 40);
                assert_eq!(*seq, 1_700_000_000_002);
            }
            other => panic!("expected delta, got {other:?}"),
        }
        // Size zero passes through as a level removal.
        assert!(matches!(
            &events[1],
            FeedEvent::Delta {
                ladder: LadderKind::Bid,
                new_qty: 0,
                ..
            }
        ));
    }

    #[test]
    fn test_noise_frames_decode_to_nothing() {
        let feed = feed();
        assert!(feed.decode_frame("ping").is_empty());
        assert!(feed.decode_frame("[]").is_empty());
        assert!(feed.decode_frame("not json").is_empty());
        assert!(feed
            .decode_frame(r#"{"event_type": "last_trade_price", "asset_id": "yes-token"}"#)
            .is_empty());
    }
}
