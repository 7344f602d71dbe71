//! Book store: applies feed events and publishes consistent snapshots.
//!
//! Owns every `OrderBook`. Updates for one market are serialized through
//! this task, so the strategy sees a totally ordered snapshot sequence per
//! market; across markets ordering follows arrival. A market that loses
//! sequence continuity (or produces a malformed book) is held unpublished
//! until its replacement snapshot arrives.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use common::book::{BookError, FeedEvent};
use common::models::{MarketKey, Venue};
use common::OrderBook;

struct BookEntry {
    book: OrderBook,
    /// False while waiting for a resnapshot; the book is not published.
    synced: bool,
}

pub struct Normalizer {
    books: HashMap<MarketKey, BookEntry>,
    /// Kalshi market ids whose books need a fresh snapshot.
    kalshi_resync_tx: mpsc::Sender<String>,
    publish_tx: mpsc::Sender<Arc<OrderBook>>,
}

impl Normalizer {
    pub fn new(
        kalshi_resync_tx: mpsc::Sender<String>,
        publish_tx: mpsc::Sender<Arc<OrderBook>>,
    ) -> Self {
        Self {
            books: HashMap::new(),
            kalshi_resync_tx,
            publish_tx,
        }
    }

    /// Consume both venue feeds until they close.
    pub async fn run(
        mut self,
        mut kalshi_rx: mpsc::Receiver<FeedEvent>,
        mut poly_rx: mpsc::Receiver<FeedEvent>,
    ) {
        loop {
            tokio::select! {
                event = kalshi_rx.recv() => {
                    match event {
                        Some(event) => self.handle(Venue::Kalshi, event).await,
                        None => {
                            info!("Kalshi feed channel closed");
                            break;
                        }
                    }
                }
                event = poly_rx.recv() => {
                    match event {
                        Some(event) => self.handle(Venue::Polymarket, event).await,
                        None => {
                            info!("Polymarket feed channel closed");
                            break;
                        }
                    }
                }
            }
        }
    }

    async fn handle(&mut self, venue: Venue, event: FeedEvent) {
        match event {
            FeedEvent::Snapshot {
                market_id,
                seq,
                is_provisional,
                ladders,
            } => {
                let key = MarketKey::new(venue, market_id.clone());
                let entry = self.books.entry(key).or_insert_with(|| BookEntry {
                    book: OrderBook::new(venue, market_id.clone()),
                    synced: false,
                });
                match entry.book.apply_snapshot(seq, is_provisional, ladders) {
                    Ok(()) => {
                        entry.synced = true;
                        self.publish(venue, &market_id).await;
                    }
                    Err(e) => {
                        warn!("Rejected snapshot for {}:{}: {}", venue, market_id, e);
                        entry.synced = false;
                        self.request_resync(venue, &market_id).await;
                    }
                }
            }
            FeedEvent::Delta {
                market_id,
                side,
                ladder,
                price,
                new_qty,
                seq,
            } => {
                let key = MarketKey::new(venue, market_id.clone());
                let Some(entry) = self.books.get_mut(&key) else {
                    debug!("Delta for unknown book {}:{}", venue, market_id);
                    return;
                };
                if !entry.synced {
                    return;
                }
                match entry.book.apply_delta(side, ladder, price, new_qty, seq) {
                    Ok(()) => self.publish(venue, &market_id).await,
                    Err(BookError::StaleSequence { .. }) => {}
                    Err(e) => {
                        warn!("Rejected delta for {}:{}: {}", venue, market_id, e);
                        entry.synced = false;
                        self.request_resync(venue, &market_id).await;
                    }
                }
            }
            FeedEvent::Desync { market_id } => {
                let key = MarketKey::new(venue, market_id);
                if let Some(entry) = self.books.get_mut(&key) {
                    entry.synced = false;
                }
            }
        }
    }

    /// Emit a stable snapshot of a consistent, non-provisional book.
    async fn publish(&self, venue: Venue, market_id: &str) {
        let key = MarketKey::new(venue, market_id.to_string());
        let Some(entry) = self.books.get(&key) else {
            return;
        };
        if entry.book.is_provisional {
            debug!("Holding provisional book {}", key);
            return;
        }
        let _ = self.publish_tx.send(Arc::new(entry.book.clone())).await;
    }

    /// Ask the venue adapter for a fresh snapshot. The Polymarket feed
    /// pushes full books unprompted, so only Kalshi takes requests.
    async fn request_resync(&self, venue: Venue, market_id: &str) {
        if venue == Venue::Kalshi {
            let _ = self.kalshi_resync_tx.send(market_id.to_string()).await;
        }
    }
}
