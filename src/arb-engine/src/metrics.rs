//! Engine counters, logged on an interval.

use std::collections::HashMap;

use rust_decimal::Decimal;
use tracing::info;

use common::models::LegState;

/// Running totals since process start.
#[derive(Debug, Default, Clone)]
pub struct EngineMetrics {
    pub book_updates: u64,
    pub signals: u64,
    pub approvals: u64,
    pub rejections_by_gate: HashMap<&'static str, u64>,
    pub merged: u64,
    pub settling: u64,
    pub aborted: u64,
    pub closed_at_loss: u64,
    pub realized_pnl: Decimal,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_rejection(&mut self, gate: &'static str) {
        *self.rejections_by_gate.entry(gate).or_insert(0) += 1;
    }

    pub fn record_outcome(&mut self, final_state: LegState, pnl: Decimal) {
        match final_state {
            LegState::Merged => self.merged += 1,
            LegState::BothFilled => self.settling += 1,
            LegState::Aborted => self.aborted += 1,
            LegState::ClosedAtLoss => self.closed_at_loss += 1,
            _ => {}
        }
        self.realized_pnl += pnl;
    }

    pub fn log_summary(&self) {
        let rejections: u64 = self.rejections_by_gate.values().sum();
        info!(
            "Metrics: {} updates, {} signals, {} approved, {} rejected, \
             {} merged, {} settling, {} aborted, {} closed-at-loss, pnl {}",
            self.book_updates,
            self.signals,
            self.approvals,
            rejections,
            self.merged,
            self.settling,
            self.aborted,
            self.closed_at_loss,
            self.realized_pnl
        );
        for (gate, count) in &self.rejections_by_gate {
            info!("  rejections[{}] = {}", gate, count);
        }
    }
}
