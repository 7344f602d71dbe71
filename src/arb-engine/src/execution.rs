//! Execution coordinator: drives the two-leg state machine for one arb.
//!
//! Each approved arb gets its own coordinator task that owns the machine
//! for its lifetime. Fills, timeouts and merge results arrive as events on
//! a bounded channel consumed by that task, and every transition is a pure
//! function of `(state, event)` - there are no callbacks.
//!
//! Leg ordering puts the higher-certainty leg second: intra-venue arbs
//! submit both legs at once (FOK on Polymarket, aggressive limit IOC on
//! Kalshi); cross-platform arbs submit the Kalshi leg first and only then
//! the Polymarket FOK leg, sized to the confirmed Kalshi fill.

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use common::fees::{kalshi_taker_fee, polymarket_taker_fee_per_contract};
use common::models::{
    ArbKind, Fill, HedgeOutcome, LegState, MarketMeta, Side, TradeRecord, Venue,
};
use common::repository::new_trade_record;
use common::OrderBook;

use crate::adapters::{KalshiOrderAdapter, PolymarketOrderAdapter};
use crate::hedger::{HedgeRequest, Hedger};
use crate::merge::MergeExecutor;
use crate::risk::Approval;

#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    /// When false, signals are recorded and fills simulated at the ask.
    pub enable_live_trading: bool,
    /// Partial leg-1 fills below this abort instead of hedging.
    pub min_viable_qty: u64,
    pub poly_leg_timeout: Duration,
    pub kalshi_leg_timeout: Duration,
    pub cross_leg_timeout: Duration,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            enable_live_trading: false,
            min_viable_qty: 2,
            poly_leg_timeout: Duration::from_millis(500),
            kalshi_leg_timeout: Duration::from_millis(2000),
            cross_leg_timeout: Duration::from_millis(5000),
        }
    }
}

/// Events consumed by the owning task.
#[derive(Debug, Clone)]
pub enum ExecEvent {
    /// Signal passed risk; leg 1 is being placed.
    Approved,
    /// Leg 1 settled: full, partial or empty (rejects and timeouts arrive
    /// as empty fills).
    Leg1Result(Fill),
    /// Leg 2 was placed for `target_qty` contracts.
    Leg2Dispatched { target_qty: u64 },
    Leg2Result(Fill),
    MergeConfirmed { tx_hash: String },
    MergeFailed,
    HedgeResolved(HedgeOutcome),
    /// Simultaneous dispatch relabeled the legs: the leg that filled is
    /// "leg 1" regardless of submission order.
    SwapLegLabels,
}

/// The per-arb machine. Transitions are pure over `(state, event)` with
/// the viability floor fixed at approval time.
#[derive(Debug)]
pub struct LegStateMachine {
    state: LegState,
    min_viable_qty: u64,
    leg2_target: u64,
}

impl LegStateMachine {
    pub fn new(min_viable_qty: u64) -> Self {
        Self {
            state: LegState::Idle,
            min_viable_qty,
            leg2_target: 0,
        }
    }

    pub fn state(&self) -> LegState {
        self.state
    }

    pub fn on_event(&mut self, event: &ExecEvent) -> LegState {
        let next = match (self.state, event) {
            (state, ExecEvent::SwapLegLabels) => state,

            (LegState::Idle, ExecEvent::Approved) => LegState::Leg1Submitted,

            (LegState::Leg1Submitted, ExecEvent::Leg1Result(fill)) => {
                if fill.qty >= self.min_viable_qty.max(1) {
                    LegState::Leg1Filled
                } else {
                    // Rejected, timed out, or partial below the viable
                    // minimum: abort rather than hedge.
                    LegState::Aborted
                }
            }

            (LegState::Leg1Filled, ExecEvent::Leg2Dispatched { target_qty }) => {
                self.leg2_target = *target_qty;
                LegState::Leg2Submitted
            }

            (LegState::Leg2Submitted, ExecEvent::Leg2Result(fill)) => {
                if fill.qty >= self.leg2_target {
                    LegState::BothFilled
                } else {
                    LegState::HedgeNeeded
                }
            }

            (LegState::BothFilled, ExecEvent::MergeConfirmed { .. }) => LegState::Merged,
            (LegState::BothFilled, ExecEvent::MergeFailed) => LegState::ClosedAtLoss,

            (LegState::HedgeNeeded, ExecEvent::HedgeResolved(outcome)) => match outcome {
                HedgeOutcome::HedgedToNeutral { .. } => LegState::BothFilled,
                HedgeOutcome::ClosedAtLoss { .. } => LegState::ClosedAtLoss,
            },

            (state, event) => {
                warn!("Ignoring {:?} in state {:?}", event, state);
                state
            }
        };

        if next != self.state {
            debug!("LegState {:?} -> {:?}", self.state, next);
            self.state = next;
        }
        next
    }
}

/// Capital movement reported back to the risk ledgers at terminal states.
#[derive(Debug, Clone)]
pub struct CapitalRelease {
    pub venue: Venue,
    pub reserved: Decimal,
    pub spent: Decimal,
    pub credited: Decimal,
}

/// Everything a coordinator task needs to run one arb.
#[derive(Clone)]
pub struct ArbJob {
    pub approval: Approval,
    pub yes_meta: MarketMeta,
    pub no_meta: MarketMeta,
    /// Book snapshots at approval time, used by the hedger's level walk.
    pub yes_book: Arc<OrderBook>,
    pub no_book: Arc<OrderBook>,
}

#[derive(Debug)]
pub struct ArbOutcome {
    pub arb_id: Uuid,
    pub final_state: LegState,
    pub record: TradeRecord,
    pub releases: Vec<CapitalRelease>,
}

/// One leg of the pair as routed to a venue.
#[derive(Clone)]
struct LegSpec {
    pair_side: Side,
    meta: MarketMeta,
    price: Decimal,
}

pub struct Coordinator {
    kalshi: Arc<dyn KalshiOrderAdapter>,
    poly: Arc<dyn PolymarketOrderAdapter>,
    merger: Arc<dyn MergeExecutor>,
    hedger: Arc<Hedger>,
    cfg: ExecutionConfig,
}

impl Coordinator {
    pub fn new(
        kalshi: Arc<dyn KalshiOrderAdapter>,
        poly: Arc<dyn PolymarketOrderAdapter>,
        merger: Arc<dyn MergeExecutor>,
        hedger: Arc<Hedger>,
        cfg: ExecutionConfig,
    ) -> Self {
        Self {
            kalshi,
            poly,
            merger,
            hedger,
            cfg,
        }
    }

    /// Run one arb to a terminal state.
    pub async fn run_arb(&self, job: ArbJob) -> ArbOutcome {
        let signal = job.approval.signal.clone();
        let qty = job.approval.qty;

        let yes_leg = LegSpec {
            pair_side: Side::Yes,
            meta: job.yes_meta.clone(),
            price: signal.yes_ask,
        };
        let no_leg = LegSpec {
            pair_side: Side::No,
            meta: job.no_meta.clone(),
            price: signal.no_ask,
        };

        // The leg with higher execution certainty goes second. Cross-venue
        // routes Kalshi first; intra-venue fires both at once.
        let (mut leg1_spec, mut leg2_spec, simultaneous) = match signal.kind {
            ArbKind::CrossPlatform => {
                if signal.yes_market.venue == Venue::Kalshi {
                    (yes_leg, no_leg, false)
                } else {
                    (no_leg, yes_leg, false)
                }
            }
            _ => (yes_leg, no_leg, true),
        };
        let leg_timeout = match signal.kind {
            ArbKind::PolymarketIntra => self.cfg.poly_leg_timeout,
            ArbKind::KalshiIntra => self.cfg.kalshi_leg_timeout,
            ArbKind::CrossPlatform => self.cfg.cross_leg_timeout,
        };

        let (ev_tx, mut ev_rx) = mpsc::channel::<ExecEvent>(8);
        let mut machine = LegStateMachine::new(self.cfg.min_viable_qty);
        machine.on_event(&ExecEvent::Approved);
        info!(
            "Arb {} ({:?}): leg1 {} x{} @ {}",
            job.approval.arb_id, signal.kind, leg1_spec.meta.key, qty, leg1_spec.price
        );

        // Fills tracked by pair side, so record assembly never depends on
        // which label a fill arrived under.
        let mut yes_fill = Fill::none();
        let mut no_fill = Fill::none();
        let mut merge_tx: Option<String> = None;

        if !self.cfg.enable_live_trading {
            dispatch_dry_run(&signal.kind, &leg1_spec, &leg2_spec, qty, &ev_tx).await;
        } else if simultaneous {
            self.dispatch_simultaneous(&leg1_spec, &leg2_spec, qty, leg_timeout, &ev_tx);
        } else {
            self.dispatch_leg(&leg1_spec, qty, leg_timeout, &ev_tx, true);
        }

        while let Some(event) = ev_rx.recv().await {
            // Bookkeeping before the transition consumes the event.
            match &event {
                ExecEvent::SwapLegLabels => {
                    std::mem::swap(&mut leg1_spec, &mut leg2_spec);
                }
                ExecEvent::Leg1Result(fill) => {
                    store_fill(&leg1_spec, fill, &mut yes_fill, &mut no_fill)
                }
                ExecEvent::Leg2Result(fill) => {
                    store_fill(&leg2_spec, fill, &mut yes_fill, &mut no_fill)
                }
                ExecEvent::HedgeResolved(HedgeOutcome::HedgedToNeutral { fill }) => {
                    store_fill(&leg2_spec, fill, &mut yes_fill, &mut no_fill)
                }
                ExecEvent::MergeConfirmed { tx_hash } if !tx_hash.is_empty() => {
                    merge_tx = Some(tx_hash.clone());
                }
                _ => {}
            }

            let state = machine.on_event(&event);
            match state {
                LegState::Leg1Filled if !simultaneous && self.cfg.enable_live_trading => {
                    // Shrink leg 2 to the confirmed leg-1 quantity.
                    let target = match leg1_spec.pair_side {
                        Side::Yes => yes_fill.qty,
                        Side::No => no_fill.qty,
                    };
                    let _ = ev_tx
                        .send(ExecEvent::Leg2Dispatched { target_qty: target })
                        .await;
                    self.dispatch_leg(&leg2_spec, target, leg_timeout, &ev_tx, false);
                }
                LegState::HedgeNeeded => {
                    self.dispatch_hedge(&job, &leg2_spec, yes_fill, no_fill, &ev_tx);
                }
                LegState::BothFilled => {
                    if self.mergeable(signal.kind) {
                        if self.cfg.enable_live_trading {
                            self.dispatch_merge(&job, yes_fill, no_fill, &ev_tx);
                        }
                        // In a dry run the simulated confirmation is
                        // already queued behind this event.
                    } else {
                        // Held to settlement: terminal for this machine.
                        break;
                    }
                }
                s if s.is_terminal() => break,
                _ => {}
            }
        }

        let final_state = machine.state();
        let record = self.build_record(&job, final_state, yes_fill, no_fill, merge_tx);
        let releases = self.build_releases(&job, &record);

        info!(
            "Arb {} finished {:?}: yes {}x{} no {}x{} pnl {}",
            job.approval.arb_id,
            final_state,
            record.yes_qty,
            record.yes_avg_cost,
            record.no_qty,
            record.no_avg_cost,
            record.realized_pnl
        );

        ArbOutcome {
            arb_id: job.approval.arb_id,
            final_state,
            record,
            releases,
        }
    }

    fn mergeable(&self, kind: ArbKind) -> bool {
        kind == ArbKind::PolymarketIntra
    }

    fn dispatch_simultaneous(
        &self,
        leg1: &LegSpec,
        leg2: &LegSpec,
        qty: u64,
        timeout: Duration,
        ev_tx: &mpsc::Sender<ExecEvent>,
    ) {
        let kalshi = self.kalshi.clone();
        let poly = self.poly.clone();
        let leg1 = leg1.clone();
        let leg2 = leg2.clone();
        let ev_tx = ev_tx.clone();
        let min_viable = self.cfg.min_viable_qty.max(1);
        tokio::spawn(async move {
            let (fill1, fill2) = tokio::join!(
                submit_leg(&kalshi, &poly, &leg1, qty, timeout),
                submit_leg(&kalshi, &poly, &leg2, qty, timeout),
            );
            // "Leg 1" is whichever leg actually filled, so a dead first
            // leg beside a live second one routes through the hedge path
            // instead of aborting around an orphan.
            let (first, second) = if fill1.qty < min_viable && fill2.qty >= min_viable {
                let _ = ev_tx.send(ExecEvent::SwapLegLabels).await;
                (fill2, fill1)
            } else {
                (fill1, fill2)
            };
            let _ = ev_tx.send(ExecEvent::Leg1Result(first)).await;
            if first.qty >= min_viable {
                let _ = ev_tx
                    .send(ExecEvent::Leg2Dispatched {
                        target_qty: first.qty,
                    })
                    .await;
                let _ = ev_tx.send(ExecEvent::Leg2Result(second)).await;
            }
        });
    }

    fn dispatch_leg(
        &self,
        leg: &LegSpec,
        qty: u64,
        timeout: Duration,
        ev_tx: &mpsc::Sender<ExecEvent>,
        is_leg1: bool,
    ) {
        let kalshi = self.kalshi.clone();
        let poly = self.poly.clone();
        let leg = leg.clone();
        let ev_tx = ev_tx.clone();
        tokio::spawn(async move {
            let fill = submit_leg(&kalshi, &poly, &leg, qty, timeout).await;
            let event = if is_leg1 {
                ExecEvent::Leg1Result(fill)
            } else {
                ExecEvent::Leg2Result(fill)
            };
            let _ = ev_tx.send(event).await;
        });
    }

    fn dispatch_hedge(
        &self,
        job: &ArbJob,
        missing_leg: &LegSpec,
        yes_fill: Fill,
        no_fill: Fill,
        ev_tx: &mpsc::Sender<ExecEvent>,
    ) {
        let (held, missing_qty) = match missing_leg.pair_side {
            Side::No => (yes_fill, yes_fill.qty.saturating_sub(no_fill.qty)),
            Side::Yes => (no_fill, no_fill.qty.saturating_sub(yes_fill.qty)),
        };
        let book = match missing_leg.pair_side {
            Side::Yes => job.yes_book.clone(),
            Side::No => job.no_book.clone(),
        };
        let request = HedgeRequest {
            market: missing_leg.meta.clone(),
            side: missing_leg.pair_side,
            qty: missing_qty,
            leg1_avg_cost: held.avg_price,
            book,
        };
        let hedger = self.hedger.clone();
        let ev_tx = ev_tx.clone();
        tokio::spawn(async move {
            let outcome = hedger.resolve(request).await;
            let _ = ev_tx.send(ExecEvent::HedgeResolved(outcome)).await;
        });
    }

    fn dispatch_merge(
        &self,
        job: &ArbJob,
        yes_fill: Fill,
        no_fill: Fill,
        ev_tx: &mpsc::Sender<ExecEvent>,
    ) {
        let Some(condition_id) = job.yes_meta.condition_id.clone() else {
            warn!("Mergeable arb without a condition id; holding positions");
            let _ = ev_tx.try_send(ExecEvent::MergeFailed);
            return;
        };
        let merge_qty = yes_fill.qty.min(no_fill.qty);
        let merger = self.merger.clone();
        let ev_tx = ev_tx.clone();
        tokio::spawn(async move {
            match merger.merge_pair(&condition_id, merge_qty).await {
                Ok(tx_hash) => {
                    let _ = ev_tx.send(ExecEvent::MergeConfirmed { tx_hash }).await;
                }
                Err(e) => {
                    warn!("Merge failed after retries: {}", e);
                    let _ = ev_tx.send(ExecEvent::MergeFailed).await;
                }
            }
        });
    }

    fn build_record(
        &self,
        job: &ArbJob,
        final_state: LegState,
        yes_fill: Fill,
        no_fill: Fill,
        merge_tx: Option<String>,
    ) -> TradeRecord {
        let signal = &job.approval.signal;
        let fees = self.leg_fee(&job.yes_meta, yes_fill) + self.leg_fee(&job.no_meta, no_fill);
        let gas = if final_state == LegState::Merged {
            signal.est_gas_per_contract
        } else {
            Decimal::ZERO
        };
        let merged_qty = yes_fill.qty.min(no_fill.qty);
        let realized_pnl = if final_state == LegState::Merged {
            TradeRecord::merged_pnl(
                merged_qty,
                yes_fill.avg_price,
                no_fill.avg_price,
                fees,
                gas,
            )
        } else {
            Decimal::ZERO
        };

        TradeRecord {
            yes_qty: yes_fill.qty,
            yes_avg_cost: yes_fill.avg_price,
            no_qty: no_fill.qty,
            no_avg_cost: no_fill.avg_price,
            fees,
            gas,
            merge_tx,
            realized_pnl,
            final_state,
            is_dry_run: !self.cfg.enable_live_trading,
            ..new_trade_record(
                signal.kind,
                signal.yes_market.clone(),
                signal.no_market.clone(),
            )
        }
    }

    fn build_releases(&self, job: &ArbJob, record: &TradeRecord) -> Vec<CapitalRelease> {
        let signal = &job.approval.signal;
        let yes_fee = self.leg_fee(
            &job.yes_meta,
            Fill {
                qty: record.yes_qty,
                avg_price: record.yes_avg_cost,
            },
        );
        let no_fee = record.fees - yes_fee;

        let mut releases = vec![
            CapitalRelease {
                venue: signal.yes_market.venue,
                reserved: job.approval.yes_reserved,
                spent: Decimal::from(record.yes_qty) * record.yes_avg_cost + yes_fee,
                credited: Decimal::ZERO,
            },
            CapitalRelease {
                venue: signal.no_market.venue,
                reserved: job.approval.no_reserved,
                spent: Decimal::from(record.no_qty) * record.no_avg_cost + no_fee,
                credited: Decimal::ZERO,
            },
        ];
        if record.final_state == LegState::Merged {
            let merged_qty = record.yes_qty.min(record.no_qty);
            releases.push(CapitalRelease {
                venue: Venue::Polymarket,
                reserved: Decimal::ZERO,
                spent: record.gas,
                credited: Decimal::from(merged_qty),
            });
        }
        releases
    }

    fn leg_fee(&self, meta: &MarketMeta, fill: Fill) -> Decimal {
        if fill.qty == 0 {
            return Decimal::ZERO;
        }
        match meta.key.venue {
            Venue::Kalshi => kalshi_taker_fee(fill.qty, fill.avg_price),
            Venue::Polymarket => {
                polymarket_taker_fee_per_contract(fill.avg_price, meta.has_dynamic_fee())
                    * Decimal::from(fill.qty)
            }
        }
    }
}

/// Queue the simulated event sequence for a dry run: both legs fill at
/// their ask and a mergeable pair merges instantly (no tx hash).
async fn dispatch_dry_run(
    kind: &ArbKind,
    leg1: &LegSpec,
    leg2: &LegSpec,
    qty: u64,
    ev_tx: &mpsc::Sender<ExecEvent>,
) {
    let fill1 = Fill {
        qty,
        avg_price: leg1.price,
    };
    let fill2 = Fill {
        qty,
        avg_price: leg2.price,
    };
    let _ = ev_tx.send(ExecEvent::Leg1Result(fill1)).await;
    let _ = ev_tx
        .send(ExecEvent::Leg2Dispatched { target_qty: qty })
        .await;
    let _ = ev_tx.send(ExecEvent::Leg2Result(fill2)).await;
    if *kind == ArbKind::PolymarketIntra {
        let _ = ev_tx
            .send(ExecEvent::MergeConfirmed {
                tx_hash: String::new(),
            })
            .await;
    }
}

fn store_fill(leg: &LegSpec, fill: &Fill, yes: &mut Fill, no: &mut Fill) {
    match leg.pair_side {
        Side::Yes => *yes = *fill,
        Side::No => *no = *fill,
    }
}

/// Place one leg on its venue, reducing errors and timeouts to an empty
/// fill (an expired FOK / cancelled IOC).
async fn submit_leg(
    kalshi: &Arc<dyn KalshiOrderAdapter>,
    poly: &Arc<dyn PolymarketOrderAdapter>,
    leg: &LegSpec,
    qty: u64,
    deadline: Duration,
) -> Fill {
    use rust_decimal::prelude::ToPrimitive;

    let placed = tokio::time::timeout(deadline, async {
        match leg.meta.key.venue {
            Venue::Kalshi => {
                let cents = (leg.price * Decimal::new(100, 0))
                    .round()
                    .to_u32()
                    .unwrap_or(0);
                kalshi
                    .place_limit_ioc(&leg.meta.key.market_id, leg.pair_side, cents, qty)
                    .await
            }
            Venue::Polymarket => match leg.meta.token_id(leg.pair_side) {
                Some(token) => poly.place_fok(token, leg.price, qty).await,
                None => Err(anyhow::anyhow!("missing token id for {}", leg.meta.key)),
            },
        }
    })
    .await;

    match placed {
        Ok(Ok(fill)) => fill,
        Ok(Err(e)) => {
            warn!("Leg on {} failed: {}", leg.meta.key, e);
            Fill::none()
        }
        Err(_) => {
            warn!("Leg on {} timed out after {:?}", leg.meta.key, deadline);
            Fill::none()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{MockKalshiOrderAdapter, MockPolymarketOrderAdapter};
    use crate::hedger::HedgerConfig;
    use crate::merge::MockMergeExecutor;
    use crate::risk::Approval;
    use chrono::Utc;
    use common::book::LadderUpdate;
    use common::models::{ArbSignal, BookLevel, MarketKey, Timeframe};
    use rust_decimal_macros::dec;

    fn poly_meta() -> MarketMeta {
        MarketMeta {
            key: MarketKey::new(Venue::Polymarket, "0xcond"),
            name: "poly market".to_string(),
            condition_id: Some("0xcond".to_string()),
            yes_token_id: Some("yes-token".to_string()),
            no_token_id: Some("no-token".to_string()),
            is_crypto: false,
            timeframe: Timeframe::Daily,
            end_time: Utc::now(),
        }
    }

    fn kalshi_meta() -> MarketMeta {
        MarketMeta {
            key: MarketKey::new(Venue::Kalshi, "KXBTC"),
            name: "kalshi market".to_string(),
            condition_id: None,
            yes_token_id: None,
            no_token_id: None,
            is_crypto: true,
            timeframe: Timeframe::Daily,
            end_time: Utc::now(),
        }
    }

    fn poly_signal() -> ArbSignal {
        ArbSignal {
            kind: ArbKind::PolymarketIntra,
            yes_market: MarketKey::new(Venue::Polymarket, "0xcond"),
            no_market: MarketKey::new(Venue::Polymarket, "0xcond"),
            yes_ask: dec!(0.45),
            no_ask: dec!(0.53),
            max_qty: 10,
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

    fn job_for(signal: ArbSignal, qty: u64) -> ArbJob {
        let (yes_meta, no_meta) = match signal.kind {
            ArbKind::CrossPlatform => (kalshi_meta(), poly_meta()),
            _ => (poly_meta(), poly_meta()),
        };
        let mut book = OrderBook::new(Venue::Polymarket, "0xcond");
        book.apply_snapshot(
            1,
            false,
            LadderUpdate {
                yes_asks: Some(vec![BookLevel::new(dec!(0.45), 50)]),
                no_asks: Some(vec![BookLevel::new(dec!(0.54), 50)]),
                ..Default::default()
            },
        )
        .unwrap();
        let book = Arc::new(book);
        ArbJob {
            approval: Approval {
                arb_id: Uuid::new_v4(),
                signal,
                qty,
                yes_reserved: dec!(4.525),
                no_reserved: dec!(5.325),
            },
            yes_meta,
            no_meta,
            yes_book: book.clone(),
            no_book: book,
        }
    }

    fn live_cfg() -> ExecutionConfig {
        ExecutionConfig {
            enable_live_trading: true,
            ..ExecutionConfig::default()
        }
    }

    fn coordinator(
        kalshi: MockKalshiOrderAdapter,
        poly: MockPolymarketOrderAdapter,
        merger: MockMergeExecutor,
        cfg: ExecutionConfig,
    ) -> Coordinator {
        let kalshi: Arc<dyn KalshiOrderAdapter> = Arc::new(kalshi);
        let poly: Arc<dyn PolymarketOrderAdapter> = Arc::new(poly);
        let hedger = Arc::new(Hedger::new(
            kalshi.clone(),
            poly.clone(),
            HedgerConfig {
                fade_timeout: Duration::from_millis(1),
                ..HedgerConfig::default()
            },
        ));
        Coordinator::new(kalshi, poly, Arc::new(merger), hedger, cfg)
    }

    // ---- pure state machine ----

    #[test]
    fn test_machine_happy_path() {
        let mut machine = LegStateMachine::new(2);
        assert_eq!(machine.on_event(&ExecEvent::Approved), LegState::Leg1Submitted);
        let fill = Fill {
            qty: 10,
            avg_price: dec!(0.45),
        };
        assert_eq!(
            machine.on_event(&ExecEvent::Leg1Result(fill)),
            LegState::Leg1Filled
        );
        assert_eq!(
            machine.on_event(&ExecEvent::Leg2Dispatched { target_qty: 10 }),
            LegState::Leg2Submitted
        );
        assert_eq!(
            machine.on_event(&ExecEvent::Leg2Result(fill)),
            LegState::BothFilled
        );
        assert_eq!(
            machine.on_event(&ExecEvent::MergeConfirmed {
                tx_hash: "0xtx".to_string()
            }),
            LegState::Merged
        );
    }

    #[test]
    fn test_machine_leg1_zero_fill_aborts() {
        let mut machine = LegStateMachine::new(2);
        machine.on_event(&ExecEvent::Approved);
        assert_eq!(
            machine.on_event(&ExecEvent::Leg1Result(Fill::none())),
            LegState::Aborted
        );
        assert!(machine.state().is_terminal());
    }

    #[test]
    fn test_machine_partial_below_min_viable_aborts() {
        let mut machine = LegStateMachine::new(5);
        machine.on_event(&ExecEvent::Approved);
        let small = Fill {
            qty: 3,
            avg_price: dec!(0.45),
        };
        assert_eq!(
            machine.on_event(&ExecEvent::Leg1Result(small)),
            LegState::Aborted
        );
    }

    #[test]
    fn test_machine_partial_leg1_shrinks_leg2() {
        let mut machine = LegStateMachine::new(2);
        machine.on_event(&ExecEvent::Approved);
        let partial = Fill {
            qty: 7,
            avg_price: dec!(0.45),
        };
        assert_eq!(
            machine.on_event(&ExecEvent::Leg1Result(partial)),
            LegState::Leg1Filled
        );
        machine.on_event(&ExecEvent::Leg2Dispatched { target_qty: 7 });
        let full = Fill {
            qty: 7,
            avg_price: dec!(0.53),
        };
        assert_eq!(
            machine.on_event(&ExecEvent::Leg2Result(full)),
            LegState::BothFilled
        );
    }

    #[test]
    fn test_machine_leg2_shortfall_needs_hedge() {
        let mut machine = LegStateMachine::new(2);
        machine.on_event(&ExecEvent::Approved);
        machine.on_event(&ExecEvent::Leg1Result(Fill {
            qty: 10,
            avg_price: dec!(0.45),
        }));
        machine.on_event(&ExecEvent::Leg2Dispatched { target_qty: 10 });
        assert_eq!(
            machine.on_event(&ExecEvent::Leg2Result(Fill::none())),
            LegState::HedgeNeeded
        );
        let hedged = HedgeOutcome::HedgedToNeutral {
            fill: Fill {
                qty: 10,
                avg_price: dec!(0.54),
            },
        };
        assert_eq!(
            machine.on_event(&ExecEvent::HedgeResolved(hedged)),
            LegState::BothFilled
        );
    }

    #[test]
    fn test_machine_merge_failure_closes_at_loss() {
        let mut machine = LegStateMachine::new(2);
        machine.on_event(&ExecEvent::Approved);
        machine.on_event(&ExecEvent::Leg1Result(Fill {
            qty: 10,
            avg_price: dec!(0.45),
        }));
        machine.on_event(&ExecEvent::Leg2Dispatched { target_qty: 10 });
        machine.on_event(&ExecEvent::Leg2Result(Fill {
            qty: 10,
            avg_price: dec!(0.53),
        }));
        assert_eq!(
            machine.on_event(&ExecEvent::MergeFailed),
            LegState::ClosedAtLoss
        );
    }

    #[test]
    fn test_machine_ignores_out_of_order_events() {
        let mut machine = LegStateMachine::new(2);
        machine.on_event(&ExecEvent::Approved);
        // A merge confirmation before any fill is nonsense; state holds.
        assert_eq!(
            machine.on_event(&ExecEvent::MergeConfirmed {
                tx_hash: "0x".to_string()
            }),
            LegState::Leg1Submitted
        );
    }

    // ---- coordinator ----

    #[tokio::test]
    async fn test_dry_run_records_without_orders() {
        // No adapter expectations: a dry run must not place anything.
        let outcome = coordinator(
            MockKalshiOrderAdapter::new(),
            MockPolymarketOrderAdapter::new(),
            MockMergeExecutor::new(),
            ExecutionConfig::default(),
        )
        .run_arb(job_for(poly_signal(), 10))
        .await;

        assert_eq!(outcome.final_state, LegState::Merged);
        assert!(outcome.record.is_dry_run);
        assert!(outcome.record.merge_tx.is_none());
        // 10 * (1 - 0.45 - 0.53) - 0.005 gas.
        assert_eq!(outcome.record.realized_pnl, dec!(0.195));
    }

    #[tokio::test]
    async fn test_live_intra_polymarket_merge() {
        let mut poly = MockPolymarketOrderAdapter::new();
        poly.expect_place_fok()
            .withf(|token, _, qty| token == "yes-token" && *qty == 10)
            .times(1)
            .returning(|_, price, qty| {
                Ok(Fill {
                    qty,
                    avg_price: price,
                })
            });
        poly.expect_place_fok()
            .withf(|token, _, qty| token == "no-token" && *qty == 10)
            .times(1)
            .returning(|_, price, qty| {
                Ok(Fill {
                    qty,
                    avg_price: price,
                })
            });
        let mut merger = MockMergeExecutor::new();
        merger
            .expect_merge_pair()
            .withf(|condition, qty| condition == "0xcond" && *qty == 10)
            .times(1)
            .returning(|_, _| Ok("0xmerge".to_string()));

        let outcome = coordinator(
            MockKalshiOrderAdapter::new(),
            poly,
            merger,
            live_cfg(),
        )
        .run_arb(job_for(poly_signal(), 10))
        .await;

        assert_eq!(outcome.final_state, LegState::Merged);
        assert_eq!(outcome.record.merge_tx.as_deref(), Some("0xmerge"));
        assert_eq!(outcome.record.realized_pnl, dec!(0.195));

        // The merge payout credits the Polymarket ledger.
        let credit: Decimal = outcome.releases.iter().map(|r| r.credited).sum();
        assert_eq!(credit, dec!(10));
    }

    #[tokio::test]
    async fn test_live_leg2_reject_hedges_then_merges() {
        // Yes FOK fills 7; the No FOK dies. The hedger chases No at 0.54
        // (book snapshot level) and the pair still merges.
        let mut poly = MockPolymarketOrderAdapter::new();
        poly.expect_place_fok()
            .withf(|token, _, _| token == "yes-token")
            .times(1)
            .returning(|_, price, qty| {
                Ok(Fill {
                    qty,
                    avg_price: price,
                })
            });
        poly.expect_place_fok()
            .withf(|token, price, _| token == "no-token" && *price == dec!(0.53))
            .times(1)
            .returning(|_, _, _| Ok(Fill::none()));
        poly.expect_place_fok()
            .withf(|token, price, qty| {
                token == "no-token" && *price == dec!(0.54) && *qty == 7
            })
            .times(1)
            .returning(|_, price, qty| {
                Ok(Fill {
                    qty,
                    avg_price: price,
                })
            });
        let mut merger = MockMergeExecutor::new();
        merger
            .expect_merge_pair()
            .withf(|_, qty| *qty == 7)
            .times(1)
            .returning(|_, _| Ok("0xmerge".to_string()));

        let outcome = coordinator(
            MockKalshiOrderAdapter::new(),
            poly,
            merger,
            live_cfg(),
        )
        .run_arb(job_for(poly_signal(), 7))
        .await;

        assert_eq!(outcome.final_state, LegState::Merged);
        assert_eq!(outcome.record.yes_qty, 7);
        assert_eq!(outcome.record.no_qty, 7);
        assert_eq!(outcome.record.no_avg_cost, dec!(0.54));
    }

    #[tokio::test]
    async fn test_live_cross_platform_sequential_legs() {
        // Kalshi leg first; on its confirmed fill the Polymarket FOK is
        // sized to the Kalshi quantity.
        let mut kalshi = MockKalshiOrderAdapter::new();
        kalshi
            .expect_place_limit_ioc()
            .withf(|ticker, side, cents, qty| {
                ticker == "KXBTC" && *side == Side::Yes && *cents == 44 && *qty == 20
            })
            .times(1)
            .returning(|_, _, cents, qty| {
                Ok(Fill {
                    qty: qty - 5,
                    avg_price: Decimal::new(cents as i64, 2),
                })
            });
        let mut poly = MockPolymarketOrderAdapter::new();
        poly.expect_place_fok()
            .withf(|token, _, qty| token == "no-token" && *qty == 15)
            .times(1)
            .returning(|_, price, qty| {
                Ok(Fill {
                    qty,
                    avg_price: price,
                })
            });

        let outcome = coordinator(kalshi, poly, MockMergeExecutor::new(), live_cfg())
            .run_arb(job_for(cross_signal(), 20))
            .await;

        // No merge across venues: the pair is held to settlement.
        assert_eq!(outcome.final_state, LegState::BothFilled);
        assert_eq!(outcome.record.yes_qty, 15);
        assert_eq!(outcome.record.no_qty, 15);
        assert!(outcome.record.merge_tx.is_none());
    }

    #[tokio::test]
    async fn test_live_leg1_dead_aborts_and_releases() {
        let mut kalshi = MockKalshiOrderAdapter::new();
        kalshi
            .expect_place_limit_ioc()
            .times(1)
            .returning(|_, _, _, _| Ok(Fill::none()));

        let outcome = coordinator(
            kalshi,
            MockPolymarketOrderAdapter::new(),
            MockMergeExecutor::new(),
            live_cfg(),
        )
        .run_arb(job_for(cross_signal(), 20))
        .await;

        assert_eq!(outcome.final_state, LegState::Aborted);
        assert_eq!(outcome.record.yes_qty, 0);
        assert_eq!(outcome.record.no_qty, 0);
        // Full reservation released, nothing spent.
        for release in &outcome.releases {
            assert_eq!(release.spent, dec!(0));
        }
    }

    #[tokio::test]
    async fn test_live_simultaneous_one_leg_dead_hedges() {
        // Both FOKs fire at once; yes dies, no fills. The legs are
        // relabeled so the filled leg is leg 1 and the yes side hedges.
        let mut poly = MockPolymarketOrderAdapter::new();
        poly.expect_place_fok()
            .withf(|token, price, _| token == "yes-token" && *price == dec!(0.45))
            .times(1)
            .returning(|_, _, _| Ok(Fill::none()));
        poly.expect_place_fok()
            .withf(|token, _, _| token == "no-token")
            .times(1)
            .returning(|_, price, qty| {
                Ok(Fill {
                    qty,
                    avg_price: price,
                })
            });
        // Hedge chase for the yes side at the book's 0.45 level.
        poly.expect_place_fok()
            .withf(|token, price, qty| {
                token == "yes-token" && *price == dec!(0.45) && *qty == 10
            })
            .times(1)
            .returning(|_, price, qty| {
                Ok(Fill {
                    qty,
                    avg_price: price,
                })
            });
        let mut merger = MockMergeExecutor::new();
        merger
            .expect_merge_pair()
            .times(1)
            .returning(|_, _| Ok("0xmerge".to_string()));

        let outcome = coordinator(
            MockKalshiOrderAdapter::new(),
            poly,
            merger,
            live_cfg(),
        )
        .run_arb(job_for(poly_signal(), 10))
        .await;

        assert_eq!(outcome.final_state, LegState::Merged);
        assert_eq!(outcome.record.yes_qty, 10);
        assert_eq!(outcome.record.no_qty, 10);
    }
}
