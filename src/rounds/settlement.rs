//! Bet Settlement
//! Mission: Pay every bet exactly once, even across crashes and retries
//!
//! Bets are written one by one. A failed write never aborts the rest; the
//! report tells the caller whether the round may move on or has to be retried.

use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use super::payout::calculate_individual_payout;
use super::repository::{BetPatch, BetRepository};
use super::types::{Asset, Bet, BetResultStatus, SettlementStatus};

#[derive(Debug, Clone, PartialEq)]
pub struct BetUpdate {
    pub bet_id: Uuid,
    pub patch: BetPatch,
}

impl BetUpdate {
    fn completed(bet: &Bet, result_status: BetResultStatus, payout_amount: i64, now: i64) -> Self {
        Self {
            bet_id: bet.id,
            patch: BetPatch {
                result_status,
                settlement_status: SettlementStatus::Completed,
                payout_amount,
                settled_at: Some(now),
            },
        }
    }
}

/// Winners get their floor share of the pool, everyone else gets nothing.
/// With no winner every bet loses. Already COMPLETED bets are left out.
pub fn plan_payouts(
    bets: &[Bet],
    winner: Option<Asset>,
    payout_ratio: f64,
    now: i64,
) -> Vec<BetUpdate> {
    bets.iter()
        .filter(|bet| !bet.is_settled())
        .map(|bet| {
            if winner == Some(bet.prediction) {
                let payout = calculate_individual_payout(bet.amount, payout_ratio);
                BetUpdate::completed(bet, BetResultStatus::Won, payout, now)
            } else {
                BetUpdate::completed(bet, BetResultStatus::Lost, 0, now)
            }
        })
        .collect()
}

/// Stake returned in full, used when a round is cancelled or voided.
pub fn plan_refunds(bets: &[Bet], now: i64) -> Vec<BetUpdate> {
    bets.iter()
        .filter(|bet| !bet.is_settled())
        .map(|bet| BetUpdate::completed(bet, BetResultStatus::Refunded, bet.amount, now))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedBet {
    pub bet_id: Uuid,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementReport {
    pub settled: Vec<Uuid>,
    /// Bets another worker completed between our read and our write
    pub skipped: Vec<Uuid>,
    pub failed: Vec<FailedBet>,
    /// Sum of winning payouts written by this run
    pub total_payout: i64,
    /// Sum of refunds written by this run
    pub total_refunded: i64,
}

impl SettlementReport {
    pub fn settled_count(&self) -> usize {
        self.settled.len()
    }

    pub fn failed_count(&self) -> usize {
        self.failed.len()
    }

    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

pub async fn apply_bet_updates(
    bets: &dyn BetRepository,
    round_id: Uuid,
    updates: Vec<BetUpdate>,
) -> SettlementReport {
    let mut report = SettlementReport::default();

    for update in updates {
        match bets.update_by_id(update.bet_id, &update.patch).await {
            Ok(true) => {
                match update.patch.result_status {
                    BetResultStatus::Won => report.total_payout += update.patch.payout_amount,
                    BetResultStatus::Refunded => {
                        report.total_refunded += update.patch.payout_amount
                    }
                    _ => {}
                }
                report.settled.push(update.bet_id);
            }
            Ok(false) => {
                debug!(round_id = %round_id, bet_id = %update.bet_id, "Bet already settled, skipping");
                report.skipped.push(update.bet_id);
            }
            Err(e) => {
                warn!(
                    round_id = %round_id,
                    bet_id = %update.bet_id,
                    error = %e,
                    "⚠️ Bet settlement write failed"
                );
                mark_failed(bets, round_id, update.bet_id).await;
                report.failed.push(FailedBet {
                    bet_id: update.bet_id,
                    error: format!("{:#}", e),
                });
            }
        }
    }

    report
}

/// Best effort; a FAILED bet is picked up again by the next settlement run.
async fn mark_failed(bets: &dyn BetRepository, round_id: Uuid, bet_id: Uuid) {
    let patch = BetPatch {
        result_status: BetResultStatus::Pending,
        settlement_status: SettlementStatus::Failed,
        payout_amount: 0,
        settled_at: None,
    };
    if let Err(e) = bets.update_by_id(bet_id, &patch).await {
        debug!(round_id = %round_id, bet_id = %bet_id, error = %e, "Could not flag bet as FAILED");
    }
}
