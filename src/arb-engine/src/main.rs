//! Negative-spread arbitrage engine for binary prediction markets.
//!
//! Pipeline: venue feeds -> normalizer (unified books) -> strategy
//! (negative-spread detection) -> risk (gates + sizing) -> execution
//! (two-leg state machine -> CTF merge | hedger).
//!
//! A Yes+No pair pays $1.00 at settlement; whenever the executable asks
//! plus fees and gas sum below that, the engine buys both sides and, on
//! Polymarket, merges the pair back to collateral immediately.

mod adapters;
mod execution;
mod hedger;
mod merge;
mod metrics;
mod normalizer;
mod risk;
mod strategy;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use rust_decimal::Decimal;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use common::models::{MarketKey, MarketMeta, Position, Side, Venue};
use common::{repository, Config, Database, GasOracle, KalshiSigner, OrderBook, TokenMap};

use adapters::{
    DisabledVenue, KalshiHttpAdapter, KalshiOrderAdapter, PolymarketClobAdapter,
    PolymarketOrderAdapter,
};
use execution::{ArbJob, ArbOutcome, Coordinator, ExecutionConfig};
use hedger::{Hedger, HedgerConfig};
use merge::{connect_chain, CtfMerger, DisabledMerge, MergeExecutor};
use metrics::EngineMetrics;
use normalizer::Normalizer;
use risk::{RiskConfig, RiskEngine};
use strategy::{StrategyConfig, StrategyEngine};

/// Market-neutral arbitrage engine for Kalshi and Polymarket.
#[derive(Parser, Debug)]
#[command(name = "arb-engine")]
#[command(about = "Detects and executes negative-spread Yes+No pairs")]
struct Args {
    /// Path to the tracked-market registry (JSON array of market metadata)
    #[arg(long, default_value = "markets.json")]
    markets: String,

    /// Submit real orders (overrides ENABLE_LIVE_TRADING)
    #[arg(long)]
    live: bool,

    /// Override the baseline MVS threshold in cents
    #[arg(long)]
    min_spread_cents: Option<u32>,

    /// Metrics summary interval in seconds
    #[arg(long, default_value = "60")]
    metrics_interval: u64,
}

/// Control messages from the feed supervisors to the engine loop.
enum ControlMsg {
    VenueDown(Venue),
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let args = Args::parse();
    let mut config = Config::from_env().context("loading configuration")?;
    if args.live {
        config.enable_live_trading = true;
    }
    if let Some(cents) = args.min_spread_cents {
        config.min_spread_cents = cents;
    }

    info!(
        "arb-engine starting ({} mode)",
        if config.enable_live_trading {
            "LIVE"
        } else {
            "dry-run"
        }
    );

    let markets = load_markets(&args.markets)?;
    info!("Tracking {} markets", markets.len());

    // Database failure is fatal: the trade log is not optional. Connecting
    // also bootstraps the trades and positions tables.
    let db = Database::connect(&config)
        .await
        .context("database startup failed")?;

    run_engine(config, args.metrics_interval, markets, db).await
}

async fn run_engine(
    config: Config,
    metrics_interval_secs: u64,
    markets: Vec<MarketMeta>,
    db: Database,
) -> Result<()> {
    let metas: HashMap<MarketKey, MarketMeta> = markets
        .iter()
        .map(|m| (m.key.clone(), m.clone()))
        .collect();

    // ---- gas oracle ----
    let oracle = GasOracle::new(
        config.gas_station_url.clone(),
        config.pol_usd_rate,
        Decimal::new(5, 3),
    );
    let (gas_tx, gas_rx) = watch::channel(oracle.fallback_estimate());
    tokio::spawn(oracle.run(gas_tx, Duration::from_secs(30)));

    // ---- venue feeds ----
    let kalshi_tickers: Vec<String> = markets
        .iter()
        .filter(|m| m.key.venue == Venue::Kalshi)
        .map(|m| m.key.market_id.clone())
        .collect();
    let mut tokens = TokenMap::new();
    for meta in markets.iter().filter(|m| m.key.venue == Venue::Polymarket) {
        if let (Some(yes), Some(no)) = (&meta.yes_token_id, &meta.no_token_id) {
            tokens.insert(yes.clone(), meta.key.market_id.clone(), Side::Yes);
            tokens.insert(no.clone(), meta.key.market_id.clone(), Side::No);
        }
    }

    let (kalshi_feed_tx, kalshi_feed_rx) = mpsc::channel(1024);
    let (poly_feed_tx, poly_feed_rx) = mpsc::channel(1024);
    let (resync_tx, resync_rx) = mpsc::channel(64);
    let (control_tx, mut control_rx) = mpsc::channel(8);

    let feed_signer = match (&config.kalshi_api_key, &config.kalshi_private_key_pem) {
        (Some(key), Some(pem)) => Some(KalshiSigner::from_pem(key.clone(), pem)?),
        _ => None,
    };

    {
        let ws_url = config.kalshi_ws_url.clone();
        let control = control_tx.clone();
        tokio::spawn(async move {
            if let Err(e) =
                common::kalshi_ws::run_kalshi_feed(ws_url, kalshi_tickers, feed_signer, kalshi_feed_tx, resync_rx)
                    .await
            {
                error!("Kalshi feed terminated: {}", e);
                let _ = control.send(ControlMsg::VenueDown(Venue::Kalshi)).await;
            }
        });
    }
    {
        let ws_url = config.clob_ws_url.clone();
        let control = control_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = common::clob::run_polymarket_feed(ws_url, tokens, poly_feed_tx).await {
                error!("Polymarket feed terminated: {}", e);
                let _ = control.send(ControlMsg::VenueDown(Venue::Polymarket)).await;
            }
        });
    }

    // ---- normalizer ----
    let (publish_tx, mut publish_rx) = mpsc::channel(1024);
    tokio::spawn(Normalizer::new(resync_tx, publish_tx).run(kalshi_feed_rx, poly_feed_rx));

    // ---- adapters, merger, hedger, coordinator ----
    let (kalshi_orders, poly_orders, merger): (
        Arc<dyn KalshiOrderAdapter>,
        Arc<dyn PolymarketOrderAdapter>,
        Arc<dyn MergeExecutor>,
    ) = if config.enable_live_trading {
        let api_key = config
            .kalshi_api_key
            .clone()
            .context("KALSHI_API_KEY required for live trading")?;
        let pem = config
            .kalshi_private_key_pem
            .clone()
            .context("KALSHI_PRIVATE_KEY_PEM required for live trading")?;
        let wallet_key = config
            .wallet_private_key
            .clone()
            .context("WALLET_PRIVATE_KEY required for live trading")?;

        let kalshi = KalshiHttpAdapter::new(
            &config.kalshi_api_url,
            KalshiSigner::from_pem(api_key, &pem)?,
        );
        let poly = PolymarketClobAdapter::connect(&config.clob_api_url, &wallet_key).await?;
        let chain = connect_chain(&config.polygon_rpc_url, &wallet_key).await?;
        let merger = CtfMerger::new(
            Arc::new(chain),
            config.merge_max_retries,
            Duration::from_secs(5),
        );
        (Arc::new(kalshi), Arc::new(poly), Arc::new(merger))
    } else {
        (
            Arc::new(DisabledVenue),
            Arc::new(DisabledVenue),
            Arc::new(DisabledMerge),
        )
    };

    // Rebuild state from the persisted trade log before accepting signals.
    let open_exposure = reconcile_persisted_state(&db).await?;

    let (kalshi_balance, poly_balance) = if config.enable_live_trading {
        // Venue balances already reflect capital tied up in held positions.
        (
            kalshi_orders.balance().await.context("Kalshi balance")?,
            poly_orders.balance().await.context("Polymarket balance")?,
        )
    } else {
        // Simulated balances must account for the held positions themselves.
        let held = |venue: Venue| open_exposure.get(&venue).copied().unwrap_or_default();
        (
            (config.dry_run_balance - held(Venue::Kalshi)).max(Decimal::ZERO),
            (config.dry_run_balance - held(Venue::Polymarket)).max(Decimal::ZERO),
        )
    };
    info!(
        "Balances: kalshi ${} / polymarket ${}",
        kalshi_balance, poly_balance
    );

    let hedger = Arc::new(Hedger::new(
        kalshi_orders.clone(),
        poly_orders.clone(),
        HedgerConfig {
            max_loss_per_contract: Decimal::new(
                config.max_hedge_loss_cents_per_contract as i64,
                2,
            ),
            fade_timeout: Duration::from_millis(config.hedge_timeout_ms),
            max_chase_levels: 5,
        },
    ));
    let coordinator = Arc::new(Coordinator::new(
        kalshi_orders,
        poly_orders,
        merger,
        hedger,
        ExecutionConfig {
            enable_live_trading: config.enable_live_trading,
            min_viable_qty: config.min_viable_qty,
            poly_leg_timeout: Duration::from_millis(config.poly_leg_timeout_ms),
            kalshi_leg_timeout: Duration::from_millis(config.kalshi_leg_timeout_ms),
            cross_leg_timeout: Duration::from_millis(config.cross_leg_timeout_ms),
        },
    ));

    // ---- strategy + risk ----
    let whitelist_keys: Vec<(MarketKey, MarketKey)> = config
        .cross_platform_whitelist
        .iter()
        .map(|(kalshi, poly)| {
            (
                MarketKey::new(Venue::Kalshi, kalshi.clone()),
                MarketKey::new(Venue::Polymarket, poly.clone()),
            )
        })
        .collect();
    let mut strategy = StrategyEngine::new(
        StrategyConfig {
            min_spread: Decimal::new(config.min_spread_cents as i64, 2),
            crypto_short_min_spread: Decimal::new(
                config.crypto_short_duration_min_spread_cents as i64,
                2,
            ),
            cross_platform_min_spread: Decimal::new(
                config.cross_platform_min_spread_cents as i64,
                2,
            ),
            capacity_cap: config.capacity_cap,
            cross_venue_risk_factor: config.cross_venue_risk_factor,
        },
        markets,
        whitelist_keys,
        gas_rx,
    );
    let mut risk = RiskEngine::new(
        RiskConfig {
            max_position_size_usd: config.max_position_size_usd,
            balance_fraction: config.balance_fraction,
            whitelist: config.cross_platform_whitelist.clone(),
        },
        kalshi_balance,
        poly_balance,
    );

    // ---- engine loop ----
    let mut metrics = EngineMetrics::new();
    let mut books: HashMap<MarketKey, Arc<OrderBook>> = HashMap::new();
    let mut in_flight: JoinSet<ArbOutcome> = JoinSet::new();
    let mut metrics_tick = tokio::time::interval(Duration::from_secs(metrics_interval_secs));
    let mut venue_auth_failed = false;
    let mut draining = false;
    // Armed with a real deadline once draining starts.
    let drain_deadline = tokio::time::sleep(Duration::from_secs(86_400 * 365));
    tokio::pin!(drain_deadline);

    loop {
        tokio::select! {
            book = publish_rx.recv() => {
                let Some(book) = book else {
                    warn!("Normalizer stopped publishing");
                    break;
                };
                metrics.book_updates += 1;
                let key = MarketKey::new(book.venue, book.market_id.clone());
                books.insert(key, book.clone());
                if draining {
                    continue;
                }
                for signal in strategy.on_book_update(book) {
                    metrics.signals += 1;
                    match risk.approve(&signal) {
                        Ok(approval) => {
                            metrics.approvals += 1;
                            let Some(job) = build_job(&approval, &metas, &books) else {
                                // Unknown metadata: hand the reservation back.
                                risk.settle_leg(
                                    signal.yes_market.venue,
                                    approval.yes_reserved,
                                    Decimal::ZERO,
                                    Decimal::ZERO,
                                );
                                risk.settle_leg(
                                    signal.no_market.venue,
                                    approval.no_reserved,
                                    Decimal::ZERO,
                                    Decimal::ZERO,
                                );
                                risk.clear_market(&signal.yes_market);
                                risk.clear_market(&signal.no_market);
                                continue;
                            };
                            let coordinator = coordinator.clone();
                            in_flight.spawn(async move { coordinator.run_arb(job).await });
                        }
                        Err(rejection) => {
                            metrics.record_rejection(rejection.gate());
                        }
                    }
                }
            }

            Some(result) = in_flight.join_next(), if !in_flight.is_empty() => {
                match result {
                    Ok(outcome) => {
                        apply_outcome(&outcome, &mut risk, &mut metrics, &db).await;
                    }
                    Err(e) => error!("Coordinator task panicked: {}", e),
                }
                if draining && in_flight.is_empty() {
                    break;
                }
            }

            Some(msg) = control_rx.recv() => {
                match msg {
                    ControlMsg::VenueDown(venue) => {
                        error!("Venue {} is down; evaluation suspended for it", venue);
                        risk.set_venue_live(venue, false);
                        venue_auth_failed = true;
                    }
                }
            }

            _ = metrics_tick.tick() => {
                metrics.log_summary();
            }

            _ = tokio::signal::ctrl_c(), if !draining => {
                info!(
                    "Shutdown requested; draining {} in-flight arbs",
                    in_flight.len()
                );
                draining = true;
                if in_flight.is_empty() {
                    break;
                }
                drain_deadline
                    .as_mut()
                    .reset(tokio::time::Instant::now()
                        + Duration::from_millis(config.shutdown_deadline_ms));
            }

            _ = &mut drain_deadline, if draining => {
                warn!("Shutdown deadline reached with {} arbs in flight", in_flight.len());
                break;
            }
        }
    }

    metrics.log_summary();
    if venue_auth_failed {
        anyhow::bail!("venue feed failed permanently");
    }
    info!("Clean shutdown");
    Ok(())
}

fn build_job(
    approval: &risk::Approval,
    metas: &HashMap<MarketKey, MarketMeta>,
    books: &HashMap<MarketKey, Arc<OrderBook>>,
) -> Option<ArbJob> {
    let signal = &approval.signal;
    let yes_meta = metas.get(&signal.yes_market)?.clone();
    let no_meta = metas.get(&signal.no_market)?.clone();
    let yes_book = books.get(&signal.yes_market)?.clone();
    let no_book = books.get(&signal.no_market)?.clone();
    Some(ArbJob {
        approval: approval.clone(),
        yes_meta,
        no_meta,
        yes_book,
        no_book,
    })
}

async fn apply_outcome(
    outcome: &ArbOutcome,
    risk: &mut RiskEngine,
    metrics: &mut EngineMetrics,
    db: &Database,
) {
    for release in &outcome.releases {
        risk.settle_leg(release.venue, release.reserved, release.spent, release.credited);
    }
    let record = &outcome.record;
    risk.clear_market(&record.yes_market);
    risk.clear_market(&record.no_market);
    metrics.record_outcome(outcome.final_state, record.realized_pnl);

    if let Err(e) = repository::insert_trade_record(db.pool(), record).await {
        error!("Failed to persist trade {}: {}", record.id, e);
    }
    if record.final_state == common::LegState::Merged {
        // Merged legs are consumed; clear any rows a crash-recovered run
        // may have carried for the same legs.
        for (market, side) in [
            (&record.yes_market, Side::Yes),
            (&record.no_market, Side::No),
        ] {
            if let Err(e) =
                repository::remove_position(db.pool(), market.venue, &market.market_id, side)
                    .await
            {
                error!("Failed to clear merged position on {}: {}", market, e);
            }
        }
    } else {
        // Unmerged legs remain live positions.
        for (qty, avg_cost, market, side) in [
            (
                record.yes_qty,
                record.yes_avg_cost,
                &record.yes_market,
                Side::Yes,
            ),
            (
                record.no_qty,
                record.no_avg_cost,
                &record.no_market,
                Side::No,
            ),
        ] {
            if qty == 0 {
                continue;
            }
            let position = Position {
                venue: market.venue,
                market_id: market.market_id.clone(),
                side,
                qty,
                avg_cost,
                acquired_ts: record.created_at,
            };
            if let Err(e) = repository::upsert_position(db.pool(), &position).await {
                error!("Failed to persist position on {}: {}", market, e);
            }
        }
    }
}

/// Rebuild engine state from the persisted trade log: replay it, verify
/// the stored position table agrees, and report the open exposure per
/// venue so the ledgers start from honest balances.
async fn reconcile_persisted_state(db: &Database) -> Result<HashMap<Venue, Decimal>> {
    let trade_log = repository::get_trade_log(db.pool())
        .await
        .context("loading trade log")?;
    let stored = repository::get_open_positions(db.pool())
        .await
        .context("loading positions")?;
    let (replayed, lifetime_pnl) = repository::replay_positions(&trade_log);

    let keys = |positions: &[Position]| -> HashSet<(Venue, String, Side)> {
        positions
            .iter()
            .map(|p| (p.venue, p.market_id.clone(), p.side))
            .collect()
    };
    if keys(&stored) != keys(&replayed) {
        // The append-only log is the source of truth; a divergent position
        // table means a write was lost or duplicated mid-crash.
        warn!(
            "Position table disagrees with trade-log replay ({} stored vs {} replayed); trusting the log",
            stored.len(),
            replayed.len()
        );
    }
    info!(
        "Trade log: {} arbs recorded, {} open legs, lifetime realized PnL {}",
        trade_log.len(),
        replayed.len(),
        lifetime_pnl
    );

    let mut exposure: HashMap<Venue, Decimal> = HashMap::new();
    for position in &replayed {
        *exposure.entry(position.venue).or_default() +=
            Decimal::from(position.qty) * position.avg_cost;
    }
    Ok(exposure)
}

/// Load the tracked-market registry from a JSON file.
fn load_markets(path: &str) -> Result<Vec<MarketMeta>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading market registry {path}"))?;
    let markets: Vec<MarketMeta> =
        serde_json::from_str(&raw).context("parsing market registry")?;
    Ok(markets)
}
