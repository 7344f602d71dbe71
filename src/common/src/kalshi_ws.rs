//! Kalshi WebSocket feed adapter.
//!
//! Kalshi delivers only bid ladders over `orderbook_snapshot` /
//! `orderbook_delta`; executable asks are reconstructed downstream in the
//! unified book. The wire delta carries a signed quantity change, which this
//! adapter folds into the absolute-quantity events the normalizer consumes.
//!
//! Sequence numbers are contiguous per market. On a gap the adapter emits
//! `Desync`, discards its local ladder and resubscribes the market, which
//! makes the server send a fresh snapshot.

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use futures_util::{SinkExt, StreamExt};
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::pss::SigningKey;
use rsa::signature::{RandomizedSigner, SignatureEncoding};
use rsa::RsaPrivateKey;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::http;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::book::{FeedEvent, LadderKind, LadderUpdate};
use crate::models::{BookLevel, Side};

#[derive(Debug, Error)]
pub enum FeedError {
    /// Authentication rejected. Fatal for the venue: do not reconnect.
    #[error("feed authentication failed: {0}")]
    Auth(String),

    #[error("WebSocket connection failed: {0}")]
    Connection(String),

    #[error("failed to parse message: {0}")]
    Parse(String),

    #[error("event channel closed")]
    ChannelClosed,
}

/// Signs Kalshi requests with RSA-PSS (SHA-256) over
/// `{timestamp_ms}{method}{path}`, as the venue requires for both the
/// WebSocket handshake and REST order calls.
#[derive(Clone)]
pub struct KalshiSigner {
    pub api_key: String,
    private_key: RsaPrivateKey,
}

impl std::fmt::Debug for KalshiSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KalshiSigner")
            .field("api_key", &self.api_key)
            .field("private_key", &"[REDACTED]")
            .finish()
    }
}

impl KalshiSigner {
    pub fn from_pem(api_key: impl Into<String>, pem: &str) -> Result<Self, FeedError> {
        let private_key = RsaPrivateKey::from_pkcs8_pem(pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
            .map_err(|e| FeedError::Auth(format!("invalid RSA private key: {e}")))?;
        Ok(Self {
            api_key: api_key.into(),
            private_key,
        })
    }

    /// Base64 RSA-PSS signature over `{timestamp_ms}{method}{path}`.
    pub fn sign(&self, timestamp_ms: u64, method: &str, path: &str) -> String {
        let message = format!("{timestamp_ms}{method}{path}");
        let signing_key = SigningKey::<sha2::Sha256>::new(self.private_key.clone());
        let mut rng = rsa::rand_core::OsRng;
        let signature = signing_key.sign_with_rng(&mut rng, message.as_bytes());
        BASE64.encode(signature.to_bytes())
    }

    /// The three auth headers Kalshi expects on a signed request.
    pub fn headers(&self, method: &str, path: &str) -> Vec<(String, String)> {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        vec![
            ("KALSHI-ACCESS-KEY".to_string(), self.api_key.clone()),
            (
                "KALSHI-ACCESS-SIGNATURE".to_string(),
                self.sign(timestamp_ms, method, path),
            ),
            (
                "KALSHI-ACCESS-TIMESTAMP".to_string(),
                timestamp_ms.to_string(),
            ),
        ]
    }
}

/// Subscribe / unsubscribe command envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandMessage {
    pub id: u64,
    pub cmd: String,
    pub params: CommandParams,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandParams {
    pub channels: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub market_tickers: Option<Vec<String>>,
}

/// Orderbook snapshot payload. Only bid ladders are delivered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderbookSnapshot {
    pub market_ticker: String,
    #[serde(default)]
    pub yes: Vec<WirePriceLevel>,
    #[serde(default)]
    pub no: Vec<WirePriceLevel>,
    pub seq: u64,
    #[serde(default)]
    pub is_provisional: bool,
}

/// Single wire price level, price in cents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WirePriceLevel {
    pub price: i32,
    pub quantity: i64,
}

/// Signed quantity change at one bid level.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderbookDelta {
    pub market_ticker: String,
    pub price: i32,
    pub delta: i64,
    pub side: String,
    pub seq: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub msg: String,
    pub code: Option<i32>,
}

/// Convert Kalshi cents (1-99) to decimal dollars.
pub fn cents_to_decimal(cents: i32) -> Decimal {
    Decimal::new(cents as i64, 2)
}

/// Adapter-local bid ladders, needed to fold signed wire deltas into the
/// absolute quantities of `FeedEvent::Delta`.
#[derive(Debug, Default)]
struct LocalLadders {
    yes_bids: HashMap<i32, i64>,
    no_bids: HashMap<i32, i64>,
    seq: u64,
    /// Set after a gap until the replacement snapshot lands.
    desynced: bool,
}

impl LocalLadders {
    fn reset(&mut self, snapshot: &OrderbookSnapshot) {
        self.yes_bids.clear();
        self.no_bids.clear();
        for level in &snapshot.yes {
            if level.quantity > 0 {
                self.yes_bids.insert(level.price, level.quantity);
            }
        }
        for level in &snapshot.no {
            if level.quantity > 0 {
                self.no_bids.insert(level.price, level.quantity);
            }
        }
        self.seq = snapshot.seq;
        self.desynced = false;
    }

    /// Fold a signed delta; returns the new absolute quantity at the level.
    fn fold(&mut self, delta: &OrderbookDelta) -> u64 {
        let book = match delta.side.as_str() {
            "yes" => &mut self.yes_bids,
            _ => &mut self.no_bids,
        };
        let new_qty = book.get(&delta.price).copied().unwrap_or(0) + delta.delta;
        if new_qty <= 0 {
            book.remove(&delta.price);
            0
        } else {
            book.insert(delta.price, new_qty);
            new_qty as u64
        }
    }
}

/// Kalshi WebSocket feed.
pub struct KalshiFeed {
    signer: Option<KalshiSigner>,
    ws_url: String,
    tickers: Vec<String>,
    ladders: HashMap<String, LocalLadders>,
    next_cmd_id: u64,
}

impl KalshiFeed {
    pub fn new(ws_url: impl Into<String>, tickers: Vec<String>) -> Self {
        Self {
            signer: None,
            ws_url: ws_url.into(),
            tickers,
            ladders: HashMap::new(),
            next_cmd_id: 1,
        }
    }

    pub fn with_signer(mut self, signer: KalshiSigner) -> Self {
        self.signer = Some(signer);
        self
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_cmd_id;
        self.next_cmd_id += 1;
        id
    }

    fn subscribe_cmd(&mut self, tickers: Vec<String>) -> CommandMessage {
        CommandMessage {
            id: self.next_id(),
            cmd: "subscribe".to_string(),
            params: CommandParams {
                channels: vec!["orderbook_delta".to_string()],
                market_tickers: Some(tickers),
            },
        }
    }

    /// Connect, subscribe and stream events until the connection drops.
    ///
    /// `resync_rx` carries market ids whose books the normalizer wants
    /// resnapshotted (e.g. after rejecting a malformed update).
    pub async fn stream(
        &mut self,
        tx: mpsc::Sender<FeedEvent>,
        resync_rx: &mut mpsc::Receiver<String>,
    ) -> Result<(), FeedError> {
        info!("Connecting to Kalshi WebSocket at {}", self.ws_url);

        let host = url::Url::parse(&self.ws_url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_default();
        let path = url::Url::parse(&self.ws_url)
            .map(|u| u.path().to_string())
            .unwrap_or_else(|_| "/trade-api/ws/v2".to_string());

        let mut request = http::Request::builder()
            .uri(self.ws_url.as_str())
            .header("Host", host.as_str());
        if let Some(signer) = &self.signer {
            for (key, value) in signer.headers("GET", &path) {
                request = request.header(key.as_str(), value.as_str());
            }
        }
        let request = request
            .body(())
            .map_err(|e| FeedError::Connection(e.to_string()))?;

        let (ws_stream, response) = timeout(Duration::from_secs(10), connect_async(request))
            .await
            .map_err(|_| FeedError::Connection("connection timeout".to_string()))?
            .map_err(|e| match &e {
                tokio_tungstenite::tungstenite::Error::Http(resp)
                    if resp.status() == http::StatusCode::UNAUTHORIZED
                        || resp.status() == http::StatusCode::FORBIDDEN =>
                {
                    FeedError::Auth(format!("handshake rejected: {}", resp.status()))
                }
                _ => FeedError::Connection(e.to_string()),
            })?;

        info!("Connected to Kalshi WebSocket (status: {})", response.status());
        let (mut write, mut read) = ws_stream.split();

        let cmd = self.subscribe_cmd(self.tickers.clone());
        let msg_json =
            serde_json::to_string(&cmd).map_err(|e| FeedError::Parse(e.to_string()))?;
        info!("Subscribing to {} Kalshi markets", self.tickers.len());
        write
            .send(Message::Text(msg_json.into()))
            .await
            .map_err(|e| FeedError::Connection(e.to_string()))?;

        for ticker in &self.tickers {
            self.ladders.insert(ticker.clone(), LocalLadders::default());
        }

        loop {
            tokio::select! {
                msg = read.next() => {
                    let Some(msg) = msg else {
                        info!("Kalshi WebSocket stream ended");
                        return Ok(());
                    };
                    match msg {
                        Ok(Message::Text(text)) => {
                            match self.handle_message(&text, &tx).await {
                                Ok(Some(resub)) => {
                                    let cmd = self.subscribe_cmd(vec![resub]);
                                    let json = serde_json::to_string(&cmd)
                                        .map_err(|e| FeedError::Parse(e.to_string()))?;
                                    write
                                        .send(Message::Text(json.into()))
                                        .await
                                        .map_err(|e| FeedError::Connection(e.to_string()))?;
                                }
                                Ok(None) => {}
                                Err(FeedError::ChannelClosed) => return Err(FeedError::ChannelClosed),
                                Err(FeedError::Auth(reason)) => return Err(FeedError::Auth(reason)),
                                Err(e) => warn!("Failed to handle Kalshi message: {}", e),
                            }
                        }
                        Ok(Message::Ping(data)) => {
                            write
                                .send(Message::Pong(data))
                                .await
                                .map_err(|e| FeedError::Connection(e.to_string()))?;
                        }
                        Ok(Message::Close(_)) => {
                            info!("Kalshi WebSocket closed by server");
                            return Ok(());
                        }
                        Err(e) => return Err(FeedError::Connection(e.to_string())),
                        _ => {}
                    }
                }
                Some(ticker) = resync_rx.recv() => {
                    debug!("Resync requested for {}", ticker);
                    if let Some(ladders) = self.ladders.get_mut(&ticker) {
                        ladders.desynced = true;
                    }
                    let cmd = self.subscribe_cmd(vec![ticker]);
                    let json = serde_json::to_string(&cmd)
                        .map_err(|e| FeedError::Parse(e.to_string()))?;
                    write
                        .send(Message::Text(json.into()))
                        .await
                        .map_err(|e| FeedError::Connection(e.to_string()))?;
                }
            }
        }
    }

    /// Handle one text frame. Returns a ticker to resubscribe when a
    /// sequence gap was detected.
    async fn handle_message(
        &mut self,
        text: &str,
        tx: &mpsc::Sender<FeedEvent>,
    ) -> Result<Option<String>, FeedError> {
        let raw: serde_json::Value =
            serde_json::from_str(text).map_err(|e| FeedError::Parse(e.to_string()))?;
        let Some(msg_type) = raw.get("type").and_then(|t| t.as_str()) else {
            debug!("Kalshi message without type field");
            return Ok(None);
        };
        // Payloads arrive either flat or under a "msg" envelope.
        let payload = raw.get("msg").cloned().unwrap_or(raw.clone());

        match msg_type {
            "orderbook_snapshot" => {
                let snapshot: OrderbookSnapshot = serde_json::from_value(payload)
                    .map_err(|e| FeedError::Parse(e.to_string()))?;
                self.handle_snapshot(snapshot, tx).await?;
                Ok(None)
            }
            "orderbook_delta" => {
                let delta: OrderbookDelta = serde_json::from_value(payload)
                    .map_err(|e| FeedError::Parse(e.to_string()))?;
                self.handle_delta(delta, tx).await
            }
            "subscribed" => {
                debug!("Kalshi subscription confirmed");
                Ok(None)
            }
            "error" => {
                let err: ErrorMessage = serde_json::from_value(payload)
                    .map_err(|e| FeedError::Parse(e.to_string()))?;
                if err.code == Some(401) {
                    return Err(FeedError::Auth(err.msg));
                }
                error!("Kalshi feed error: {} (code: {:?})", err.msg, err.code);
                Ok(None)
            }
            other => {
                debug!("Unknown Kalshi message type: {}", other);
                Ok(None)
            }
        }
    }

    async fn handle_snapshot(
        &mut self,
        snapshot: OrderbookSnapshot,
        tx: &mpsc::Sender<FeedEvent>,
    ) -> Result<(), FeedError> {
        let ticker = snapshot.market_ticker.clone();
        debug!("Kalshi snapshot for {} (seq {})", ticker, snapshot.seq);

        let ladders = self.ladders.entry(ticker.clone()).or_default();
        ladders.reset(&snapshot);

        let to_levels = |wire: &[WirePriceLevel]| -> Vec<BookLevel> {
            wire.iter()
                .filter(|l| l.quantity > 0)
                .map(|l| BookLevel::new(cents_to_decimal(l.price), l.quantity as u64))
                .collect()
        };

        tx.send(FeedEvent::Snapshot {
            market_id: ticker,
            seq: snapshot.seq,
            is_provisional: snapshot.is_provisional,
            ladders: LadderUpdate {
                yes_bids: Some(to_levels(&snapshot.yes)),
                no_bids: Some(to_levels(&snapshot.no)),
                yes_asks: None,
                no_asks: None,
            },
        })
        .await
        .map_err(|_| FeedError::ChannelClosed)
    }

    async fn handle_delta(
        &mut self,
        delta: OrderbookDelta,
        tx: &mpsc::Sender<FeedEvent>,
    ) -> Result<Option<String>, FeedError> {
        let ticker = delta.market_ticker.clone();
        let Some(ladders) = self.ladders.get_mut(&ticker) else {
            return Ok(None);
        };
        if ladders.desynced {
            // Waiting for the replacement snapshot; drop in-flight deltas.
            return Ok(None);
        }
        if delta.seq <= ladders.seq {
            debug!("Stale Kalshi delta for {} (seq {})", ticker, delta.seq);
            return Ok(None);
        }
        if delta.seq != ladders.seq + 1 {
            warn!(
                "Kalshi sequence gap for {}: expected {}, got {}; resnapshotting",
                ticker,
                ladders.seq + 1,
                delta.seq
            );
            ladders.desynced = true;
            tx.send(FeedEvent::Desync {
                market_id: ticker.clone(),
            })
            .await
            .map_err(|_| FeedError::ChannelClosed)?;
            return Ok(Some(ticker));
        }

        let side = if delta.side == "yes" { Side::Yes } else { Side::No };
        let new_qty = ladders.fold(&delta);
        ladders.seq = delta.seq;

        tx.send(FeedEvent::Delta {
            market_id: ticker,
            side,
            ladder: LadderKind::Bid,
            price: cents_to_decimal(delta.price),
            new_qty,
            seq: delta.seq,
        })
        .await
        .map_err(|_| FeedError::ChannelClosed)?;
        Ok(None)
    }
}

/// Run the Kalshi feed with reconnection. Auth failures are fatal and
/// propagate to the caller; everything else retries with capped backoff.
pub async fn run_kalshi_feed(
    ws_url: String,
    tickers: Vec<String>,
    signer: Option<KalshiSigner>,
    tx: mpsc::Sender<FeedEvent>,
    mut resync_rx: mpsc::Receiver<String>,
) -> Result<(), FeedError> {
    let mut delay = Duration::from_secs(1);
    let max_delay = Duration::from_secs(30);

    loop {
        let mut feed = KalshiFeed::new(ws_url.clone(), tickers.clone());
        if let Some(signer) = signer.clone() {
            feed = feed.with_signer(signer);
        }

        match feed.stream(tx.clone(), &mut resync_rx).await {
            Ok(()) => {
                info!("Kalshi feed ended; reconnecting");
                delay = Duration::from_secs(1);
            }
            Err(FeedError::Auth(reason)) => {
                error!("Kalshi feed auth failure: {}", reason);
                return Err(FeedError::Auth(reason));
            }
            Err(FeedError::ChannelClosed) => return Ok(()),
            Err(e) => {
                error!("Kalshi feed error: {}", e);
            }
        }

        info!("Reconnecting Kalshi feed in {:?}", delay);
        tokio::time::sleep(delay).await;
        delay = std::cmp::min(delay * 2, max_delay);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn snapshot(yes: Vec<(i32, i64)>, no: Vec<(i32, i64)>, seq: u64) -> OrderbookSnapshot {
        OrderbookSnapshot {
            market_ticker: "KXBTC-25JAN13-T100000".to_string(),
            yes: yes
                .into_iter()
                .map(|(price, quantity)| WirePriceLevel { price, quantity })
                .collect(),
            no: no
                .into_iter()
                .map(|(price, quantity)| WirePriceLevel { price, quantity })
                .collect(),
            seq,
            is_provisional: false,
        }
    }

    #[test]
    fn test_cents_to_decimal() {
        assert_eq!(cents_to_decimal(50), dec!(0.50));
        assert_eq!(cents_to_decimal(99), dec!(0.99));
        assert_eq!(cents_to_decimal(1), dec!(0.01));
    }

    #[test]
    fn test_fold_delta_accumulates() {
        let mut ladders = LocalLadders::default();
        ladders.reset(&snapshot(vec![(55, 100)], vec![], 1));

        let new_qty = ladders.fold(&OrderbookDelta {
            market_ticker: "KXBTC".to_string(),
            price: 55,
            delta: 50,
            side: "yes".to_string(),
            seq: 2,
        });
        assert_eq!(new_qty, 150);

        let removed = ladders.fold(&OrderbookDelta {
            market_ticker: "KXBTC".to_string(),
            price: 55,
            delta: -150,
            side: "yes".to_string(),
            seq: 3,
        });
        assert_eq!(removed, 0);
        assert!(ladders.yes_bids.get(&55).is_none());
    }

    #[test]
    fn test_snapshot_reset_clears_desync() {
        let mut ladders = LocalLadders::default();
        ladders.desynced = true;
        ladders.reset(&snapshot(vec![(40, 10)], vec![(30, 5)], 7));
        assert!(!ladders.desynced);
        assert_eq!(ladders.seq, 7);
        assert_eq!(ladders.yes_bids.get(&40), Some(&10));
        assert_eq!(ladders.no_bids.get(&30), Some(&5));
    }

    #[tokio::test]
    async fn test_delta_gap_emits_desync() {
        let mut feed = KalshiFeed::new("wss://example", vec![]);
        feed.ladders
            .insert("KXBTC".to_string(), LocalLadders::default());
        feed.ladders.get_mut("KXBTC").unwrap().seq = 5;

        let (tx, mut rx) = mpsc::channel(8);
        let resub = feed
            .handle_delta(
                OrderbookDelta {
                    market_ticker: "KXBTC".to_string(),
                    price: 50,
                    delta: 10,
                    side: "yes".to_string(),
                    seq: 8,
                },
                &tx,
            )
            .await
            .unwrap();

        assert_eq!(resub, Some("KXBTC".to_string()));
        assert!(matches!(
            rx.recv().await,
            Some(FeedEvent::Desync { market_id }) if market_id == "KXBTC"
        ));
        // Subsequent in-flight deltas are dropped until the snapshot.
        let resub = feed
            .handle_delta(
                OrderbookDelta {
                    market_ticker: "KXBTC".to_string(),
                    price: 50,
                    delta: 10,
                    side: "yes".to_string(),
                    seq: 9,
                },
                &tx,
            )
            .await
            .unwrap();
        assert_eq!(resub, None);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_contiguous_delta_emits_absolute_qty() {
        let mut feed = KalshiFeed::new("wss://example", vec![]);
        let (tx, mut rx) = mpsc::channel(8);
        feed.handle_snapshot(snapshot(vec![(55, 100)], vec![(42, 60)], 1), &tx)
            .await
            .unwrap();
        let _ = rx.recv().await;

        feed.handle_delta(
            OrderbookDelta {
                market_ticker: "KXBTC-25JAN13-T100000".to_string(),
                price: 42,
                delta: 15,
                side: "no".to_string(),
                seq: 2,
            },
            &tx,
        )
        .await
        .unwrap();

        match rx.recv().await {
            Some(FeedEvent::Delta {
                side,
                ladder,
                price,
                new_qty,
                seq,
                ..
            }) => {
                assert_eq!(side, Side::No);
                assert_eq!(ladder, LadderKind::Bid);
                assert_eq!(price, dec!(0.42));
                assert_eq!(new_qty, 75);
                assert_eq!(seq, 2);
            }
            other => panic!("expected delta event, got {other:?}"),
        }
    }
}
