//! Database repository for trade records and live positions.
//!
//! Queries are runtime-bound so the crate builds without a live database.
//! The trade log is append-only: replaying it must reproduce positions and
//! realized PnL exactly. `replay_positions` implements the replay, and the
//! engine verifies the stored position table against it at every startup
//! before accepting signals.

use chrono::Utc;
use rust_decimal::Decimal;
use sqlx::PgPool;
use sqlx::Row;

use crate::models::{ArbKind, LegState, MarketKey, Position, Side, TradeRecord, Venue};

/// Create the trade and position tables when missing.
pub async fn ensure_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS trades (
            id UUID PRIMARY KEY,
            kind VARCHAR NOT NULL,
            yes_venue VARCHAR NOT NULL,
            yes_market_id VARCHAR NOT NULL,
            no_venue VARCHAR NOT NULL,
            no_market_id VARCHAR NOT NULL,
            yes_qty BIGINT NOT NULL,
            yes_avg_cost NUMERIC NOT NULL,
            no_qty BIGINT NOT NULL,
            no_avg_cost NUMERIC NOT NULL,
            fees NUMERIC NOT NULL,
            gas NUMERIC NOT NULL,
            merge_tx VARCHAR,
            realized_pnl NUMERIC NOT NULL,
            final_state VARCHAR NOT NULL,
            is_dry_run BOOLEAN NOT NULL,
            created_at TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS positions (
            venue VARCHAR NOT NULL,
            market_id VARCHAR NOT NULL,
            side VARCHAR NOT NULL,
            qty BIGINT NOT NULL,
            avg_cost NUMERIC NOT NULL,
            acquired_ts TIMESTAMPTZ NOT NULL,
            PRIMARY KEY (venue, market_id, side)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Append one completed arb to the trade log.
pub async fn insert_trade_record(pool: &PgPool, record: &TradeRecord) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO trades (
            id, kind, yes_venue, yes_market_id, no_venue, no_market_id,
            yes_qty, yes_avg_cost, no_qty, no_avg_cost,
            fees, gas, merge_tx, realized_pnl, final_state, is_dry_run, created_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
        "#,
    )
    .bind(record.id)
    .bind(kind_str(record.kind))
    .bind(record.yes_market.venue.to_string())
    .bind(&record.yes_market.market_id)
    .bind(record.no_market.venue.to_string())
    .bind(&record.no_market.market_id)
    .bind(record.yes_qty as i64)
    .bind(record.yes_avg_cost)
    .bind(record.no_qty as i64)
    .bind(record.no_avg_cost)
    .bind(record.fees)
    .bind(record.gas)
    .bind(record.merge_tx.as_deref())
    .bind(record.realized_pnl)
    .bind(record.final_state.as_str())
    .bind(record.is_dry_run)
    .bind(record.created_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Insert a leg fill, folding into an existing position at a
/// quantity-weighted average cost.
pub async fn upsert_position(pool: &PgPool, position: &Position) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO positions (venue, market_id, side, qty, avg_cost, acquired_ts)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (venue, market_id, side) DO UPDATE SET
            avg_cost = (positions.qty * positions.avg_cost
                        + EXCLUDED.qty * EXCLUDED.avg_cost)
                       / (positions.qty + EXCLUDED.qty),
            qty = positions.qty + EXCLUDED.qty
        "#,
    )
    .bind(position.venue.to_string())
    .bind(&position.market_id)
    .bind(position.side.to_string())
    .bind(position.qty as i64)
    .bind(position.avg_cost)
    .bind(position.acquired_ts)
    .execute(pool)
    .await?;

    Ok(())
}

/// Remove a position consumed by a merge, redeem or settlement. Deleting
/// an absent row is a no-op, so settlement paths may call this blindly.
pub async fn remove_position(
    pool: &PgPool,
    venue: Venue,
    market_id: &str,
    side: Side,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        "DELETE FROM positions WHERE venue = $1 AND market_id = $2 AND side = $3",
    )
    .bind(venue.to_string())
    .bind(market_id)
    .bind(side.to_string())
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// All live positions.
pub async fn get_open_positions(pool: &PgPool) -> Result<Vec<Position>, sqlx::Error> {
    let rows = sqlx::query(
        "SELECT venue, market_id, side, qty, avg_cost, acquired_ts FROM positions ORDER BY acquired_ts",
    )
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .filter_map(|row| {
            Some(Position {
                venue: parse_venue(row.get::<String, _>("venue").as_str())?,
                market_id: row.get("market_id"),
                side: parse_side(row.get::<String, _>("side").as_str())?,
                qty: row.get::<i64, _>("qty") as u64,
                avg_cost: row.get("avg_cost"),
                acquired_ts: row.get("acquired_ts"),
            })
        })
        .collect())
}

/// Load the full trade log, oldest first.
pub async fn get_trade_log(pool: &PgPool) -> Result<Vec<TradeRecord>, sqlx::Error> {
    let rows = sqlx::query("SELECT * FROM trades ORDER BY created_at")
        .fetch_all(pool)
        .await?;

    Ok(rows
        .into_iter()
        .filter_map(|row| {
            Some(TradeRecord {
                id: row.get("id"),
                kind: parse_kind(row.get::<String, _>("kind").as_str())?,
                yes_market: MarketKey::new(
                    parse_venue(row.get::<String, _>("yes_venue").as_str())?,
                    row.get::<String, _>("yes_market_id"),
                ),
                no_market: MarketKey::new(
                    parse_venue(row.get::<String, _>("no_venue").as_str())?,
                    row.get::<String, _>("no_market_id"),
                ),
                yes_qty: row.get::<i64, _>("yes_qty") as u64,
                yes_avg_cost: row.get("yes_avg_cost"),
                no_qty: row.get::<i64, _>("no_qty") as u64,
                no_avg_cost: row.get("no_avg_cost"),
                fees: row.get("fees"),
                gas: row.get("gas"),
                merge_tx: row.get("merge_tx"),
                realized_pnl: row.get("realized_pnl"),
                final_state: parse_state(row.get::<String, _>("final_state").as_str())?,
                is_dry_run: row.get("is_dry_run"),
                created_at: row.get("created_at"),
            })
        })
        .collect())
}

/// Rebuild live positions and cumulative realized PnL from the trade log.
///
/// Merged pairs consume both legs; every other final state retains the
/// legs it filled (aborted partials, unhedged losses, pairs awaiting
/// settlement).
pub fn replay_positions(records: &[TradeRecord]) -> (Vec<Position>, Decimal) {
    let mut positions = Vec::new();
    let mut realized = Decimal::ZERO;

    for record in records {
        realized += record.realized_pnl;
        if record.final_state == LegState::Merged {
            continue;
        }
        if record.yes_qty > 0 {
            positions.push(Position {
                venue: record.yes_market.venue,
                market_id: record.yes_market.market_id.clone(),
                side: Side::Yes,
                qty: record.yes_qty,
                avg_cost: record.yes_avg_cost,
                acquired_ts: record.created_at,
            });
        }
        if record.no_qty > 0 {
            positions.push(Position {
                venue: record.no_market.venue,
                market_id: record.no_market.market_id.clone(),
                side: Side::No,
                qty: record.no_qty,
                avg_cost: record.no_avg_cost,
                acquired_ts: record.created_at,
            });
        }
    }

    (positions, realized)
}

fn kind_str(kind: ArbKind) -> &'static str {
    match kind {
        ArbKind::PolymarketIntra => "polymarket_intra",
        ArbKind::KalshiIntra => "kalshi_intra",
        ArbKind::CrossPlatform => "cross_platform",
    }
}

fn parse_kind(s: &str) -> Option<ArbKind> {
    match s {
        "polymarket_intra" => Some(ArbKind::PolymarketIntra),
        "kalshi_intra" => Some(ArbKind::KalshiIntra),
        "cross_platform" => Some(ArbKind::CrossPlatform),
        _ => None,
    }
}

fn parse_venue(s: &str) -> Option<Venue> {
    match s {
        "kalshi" => Some(Venue::Kalshi),
        "polymarket" => Some(Venue::Polymarket),
        _ => None,
    }
}

fn parse_side(s: &str) -> Option<Side> {
    match s {
        "yes" => Some(Side::Yes),
        "no" => Some(Side::No),
        _ => None,
    }
}

fn parse_state(s: &str) -> Option<LegState> {
    match s {
        "idle" => Some(LegState::Idle),
        "leg1_submitted" => Some(LegState::Leg1Submitted),
        "leg1_filled" => Some(LegState::Leg1Filled),
        "aborted" => Some(LegState::Aborted),
        "leg2_submitted" => Some(LegState::Leg2Submitted),
        "both_filled" => Some(LegState::BothFilled),
        "hedge_needed" => Some(LegState::HedgeNeeded),
        "merged" => Some(LegState::Merged),
        "closed_at_loss" => Some(LegState::ClosedAtLoss),
        _ => None,
    }
}

/// Build a trade record stamped with the current time.
pub fn new_trade_record(
    kind: ArbKind,
    yes_market: MarketKey,
    no_market: MarketKey,
) -> TradeRecord {
    TradeRecord {
        id: uuid::Uuid::new_v4(),
        kind,
        yes_market,
        no_market,
        yes_qty: 0,
        yes_avg_cost: Decimal::ZERO,
        no_qty: 0,
        no_avg_cost: Decimal::ZERO,
        fees: Decimal::ZERO,
        gas: Decimal::ZERO,
        merge_tx: None,
        realized_pnl: Decimal::ZERO,
        final_state: LegState::Idle,
        is_dry_run: true,
        created_at: Utc::now(),
    }
}
