//! Round Service
//! Mission: One entry point per scheduler tick, each safe to call twice
//!
//! Every method reads the current round, asks the FSM for the edge it wants
//! and writes back through the repositories. Ticks that find nothing to do
//! return an outcome instead of an error.

use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use super::chain::ChainAdapter;
use super::clock::Clock;
use super::config::{clamp_fee_rate, RoundConfig};
use super::error::{RoundError, RoundResult, INVALID_ROUND_STATUS, PAYOUTS_ALREADY_WRITTEN};
use super::fsm::{
    ensure_allowed, AwaitEndPrice, BeginCalculation, CancelRound, CompleteSettlement, LockBetting,
    OpenBetting, RoundFsm, Transition, VoidRound,
};
use super::payout::{calculate_payout, PayoutBreakdown, PayoutInput};
use super::repository::{BetRepository, RoundRepository};
use super::settlement::{apply_bet_updates, plan_payouts, plan_refunds};
use super::types::{Asset, Bet, BetResultStatus, PriceSnapshot, Round, RoundStatus, RoundType};
use super::winner::{determine_winner, PriceMoves};

pub const MISSED_OPEN_WINDOW: &str = "MISSED_OPEN_WINDOW";
pub const CANCELLED_BY_SYSTEM: &str = "SYSTEM";

// ─── Outcomes ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OpenOutcome {
    NoRound,
    #[serde(rename_all = "camelCase")]
    NotReady { round_id: Uuid, start_time: i64 },
    /// The open window passed before any tick picked the round up
    Cancelled { round: Round },
    Opened { round: Round },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LockOutcome {
    NoRound,
    #[serde(rename_all = "camelCase")]
    NotReady { round_id: Uuid, lock_time: i64 },
    Locked { round: Round },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AwaitPriceOutcome {
    NoRound,
    #[serde(rename_all = "camelCase")]
    NotReady { round_id: Uuid, end_time: i64 },
    Pending { round: Round },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SettleOutcome {
    #[serde(rename_all = "camelCase")]
    AlreadySettled { round_id: Uuid },
    #[serde(rename_all = "camelCase")]
    NoBets { round_id: Uuid },
    /// Some bet writes failed; the round stays CALCULATING for the next attempt
    #[serde(rename_all = "camelCase")]
    Partial {
        round_id: Uuid,
        settled_count: usize,
        failed_count: usize,
        message: String,
    },
    #[serde(rename_all = "camelCase")]
    Settled {
        round_id: Uuid,
        settled_count: usize,
        total_payout: i64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FinalizeOutcome {
    NoRound,
    #[serde(rename_all = "camelCase")]
    NotReady { round_id: Uuid, end_time: i64 },
    #[serde(rename_all = "camelCase")]
    Finalized {
        round_id: Uuid,
        winner: Asset,
        gold_change_percent: f64,
        btc_change_percent: f64,
        settlement: SettleOutcome,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RefundOutcome {
    /// Round was already in the requested terminal state
    #[serde(rename_all = "camelCase")]
    AlreadyClosed { round_id: Uuid, round_status: RoundStatus },
    #[serde(rename_all = "camelCase")]
    Partial {
        round_id: Uuid,
        refunded_count: usize,
        failed_count: usize,
        message: String,
    },
    #[serde(rename_all = "camelCase")]
    Cancelled {
        round: Round,
        refunded_count: usize,
        total_refunded: i64,
    },
    #[serde(rename_all = "camelCase")]
    Voided {
        round: Round,
        refunded_count: usize,
        total_refunded: i64,
    },
}

// ─── Service ────────────────────────────────────────────────────────────

pub struct RoundService {
    rounds: Arc<dyn RoundRepository>,
    bets: Arc<dyn BetRepository>,
    fsm: RoundFsm,
    clock: Arc<dyn Clock>,
    chain: Arc<dyn ChainAdapter>,
    config: RoundConfig,
}

impl RoundService {
    pub fn new(
        rounds: Arc<dyn RoundRepository>,
        bets: Arc<dyn BetRepository>,
        clock: Arc<dyn Clock>,
        chain: Arc<dyn ChainAdapter>,
        config: RoundConfig,
    ) -> Self {
        Self {
            fsm: RoundFsm::new(rounds.clone(), clock.clone()),
            rounds,
            bets,
            clock,
            chain,
            config: config.sanitized(),
        }
    }

    pub fn fsm(&self) -> &RoundFsm {
        &self.fsm
    }

    pub fn config(&self) -> &RoundConfig {
        &self.config
    }

    /// Schedule the round after the last one of the default type.
    pub async fn create_next_scheduled_round(&self) -> RoundResult<Round> {
        self.create_next_round(self.config.default_round_type).await
    }

    /// Idempotent on `startTime`: an existing round at the computed slot is
    /// returned unchanged.
    pub async fn create_next_round(&self, round_type: RoundType) -> RoundResult<Round> {
        let now = self.clock.now_ms();
        let last = self.rounds.find_last_round(round_type).await?;

        let (round_number, start_time) = match &last {
            Some(last) => (
                last.round_number + 1,
                last.start_time + round_type.duration_ms(),
            ),
            None => (1, self.config.next_aligned_start(round_type, now)),
        };

        if let Some(existing) = self.rounds.find_by_start_time(round_type, start_time).await? {
            info!(
                round_id = %existing.id,
                round_number = existing.round_number,
                start_time,
                "Round already scheduled for slot"
            );
            return Ok(existing);
        }

        let round = Round::scheduled(
            round_type,
            round_number,
            start_time,
            self.config.betting_window_ms(round_type),
            self.config.fee_rate(),
            now,
        );
        let created = self.rounds.insert(&round).await?;

        info!(
            round_id = %created.id,
            round_number = created.round_number,
            round_type = %created.round_type,
            start_time = created.start_time,
            lock_time = created.lock_time,
            end_time = created.end_time,
            "📅 Scheduled round"
        );
        Ok(created)
    }

    pub async fn open_round(&self, prices: &PriceSnapshot) -> RoundResult<OpenOutcome> {
        let Some(round) = self
            .rounds
            .find_latest_by_status(RoundStatus::Scheduled)
            .await?
        else {
            return Ok(OpenOutcome::NoRound);
        };
        let now = self.clock.now_ms();

        if now < round.start_time {
            return Ok(OpenOutcome::NotReady {
                round_id: round.id,
                start_time: round.start_time,
            });
        }

        if now >= round.lock_time {
            warn!(
                round_id = %round.id,
                round_number = round.round_number,
                lock_time = round.lock_time,
                now,
                "Open window missed, cancelling round"
            );
            let round = self
                .fsm
                .transition(
                    round.id,
                    Transition::Cancel(CancelRound {
                        cancellation_reason: Some(MISSED_OPEN_WINDOW.to_string()),
                        cancelled_by: Some(CANCELLED_BY_SYSTEM.to_string()),
                        cancelled_at: now,
                    }),
                )
                .await?;
            return Ok(OpenOutcome::Cancelled { round });
        }

        ensure_valid_prices(prices)?;
        let sui_pool_address = self.chain.pool_address(&round).await?;

        if let Some(reason) = &prices.fallback_reason {
            warn!(round_id = %round.id, reason = %reason, "Opening round on fallback start prices");
        }

        let round = self
            .fsm
            .transition(
                round.id,
                Transition::OpenBetting(OpenBetting {
                    gold_start_price: prices.gold.to_string(),
                    btc_start_price: prices.btc.to_string(),
                    price_snapshot_start_at: prices.timestamp,
                    start_price_source: prices.source.clone(),
                    sui_pool_address,
                    betting_opened_at: now,
                    fallback_reason: prices.fallback_reason.clone(),
                }),
            )
            .await?;
        Ok(OpenOutcome::Opened { round })
    }

    pub async fn lock_round(&self) -> RoundResult<LockOutcome> {
        let Some(round) = self
            .rounds
            .find_latest_by_status(RoundStatus::BettingOpen)
            .await?
        else {
            return Ok(LockOutcome::NoRound);
        };
        let now = self.clock.now_ms();

        if round.lock_time > now {
            return Ok(LockOutcome::NotReady {
                round_id: round.id,
                lock_time: round.lock_time,
            });
        }

        let round = self
            .fsm
            .transition(
                round.id,
                Transition::LockBetting(LockBetting {
                    betting_locked_at: now,
                }),
            )
            .await?;
        Ok(LockOutcome::Locked { round })
    }

    /// Park a locked round whose end time has passed until end prices arrive.
    pub async fn await_end_price(&self) -> RoundResult<AwaitPriceOutcome> {
        let Some(round) = self
            .rounds
            .find_latest_by_status(RoundStatus::BettingLocked)
            .await?
        else {
            return Ok(AwaitPriceOutcome::NoRound);
        };
        let now = self.clock.now_ms();

        if now < round.end_time {
            return Ok(AwaitPriceOutcome::NotReady {
                round_id: round.id,
                end_time: round.end_time,
            });
        }

        let round = self
            .fsm
            .transition(
                round.id,
                Transition::AwaitEndPrice(AwaitEndPrice {
                    round_ended_at: now,
                }),
            )
            .await?;
        Ok(AwaitPriceOutcome::Pending { round })
    }

    /// Decide the winner from stored start prices and `end_prices`, then
    /// settle in the same call.
    pub async fn finalize_round(&self, end_prices: &PriceSnapshot) -> RoundResult<FinalizeOutcome> {
        let round = match self
            .rounds
            .find_latest_by_status(RoundStatus::PricePending)
            .await?
        {
            Some(round) => round,
            None => match self
                .rounds
                .find_latest_by_status(RoundStatus::BettingLocked)
                .await?
            {
                Some(round) => round,
                None => return Ok(FinalizeOutcome::NoRound),
            },
        };
        let now = self.clock.now_ms();

        if now < round.end_time {
            return Ok(FinalizeOutcome::NotReady {
                round_id: round.id,
                end_time: round.end_time,
            });
        }

        ensure_valid_prices(end_prices)?;
        let gold_start = stored_price(&round, round.gold_start_price.as_deref(), "goldStartPrice")?;
        let btc_start = stored_price(&round, round.btc_start_price.as_deref(), "btcStartPrice")?;

        let result = determine_winner(PriceMoves {
            gold_start,
            gold_end: end_prices.gold,
            btc_start,
            btc_end: end_prices.btc,
        });

        if let Some(reason) = &end_prices.fallback_reason {
            warn!(round_id = %round.id, reason = %reason, "Finalizing round on fallback end prices");
        }

        let calculating = self
            .fsm
            .transition(
                round.id,
                Transition::BeginCalculation(BeginCalculation {
                    gold_end_price: end_prices.gold.to_string(),
                    btc_end_price: end_prices.btc.to_string(),
                    price_snapshot_end_at: end_prices.timestamp,
                    end_price_source: end_prices.source.clone(),
                    gold_change_percent: result.gold_change_percent,
                    btc_change_percent: result.btc_change_percent,
                    winner: result.winner,
                    round_ended_at: now,
                    fallback_reason: end_prices.fallback_reason.clone(),
                }),
            )
            .await?;

        info!(
            round_id = %calculating.id,
            round_number = calculating.round_number,
            winner = %result.winner,
            gold_change_percent = result.gold_change_percent,
            btc_change_percent = result.btc_change_percent,
            "🏁 Round finalized"
        );

        let settlement = self.settle_round(calculating.id).await?;
        Ok(FinalizeOutcome::Finalized {
            round_id: calculating.id,
            winner: result.winner,
            gold_change_percent: result.gold_change_percent,
            btc_change_percent: result.btc_change_percent,
            settlement,
        })
    }

    /// Pay out a CALCULATING round. Safe to call repeatedly: completed bets
    /// are never rewritten and a SETTLED round short-circuits.
    pub async fn settle_round(&self, round_id: Uuid) -> RoundResult<SettleOutcome> {
        let round = self
            .rounds
            .find_by_id(round_id)
            .await?
            .ok_or_else(|| RoundError::round_not_found(round_id))?;

        if round.status == RoundStatus::Settled {
            return Ok(SettleOutcome::AlreadySettled { round_id });
        }
        if round.status != RoundStatus::Calculating {
            return Err(RoundError::business(
                INVALID_ROUND_STATUS,
                format!(
                    "Round {} must be CALCULATING to settle, found {}",
                    round_id, round.status
                ),
                json!({
                    "roundId": round_id.to_string(),
                    "currentStatus": round.status.as_str(),
                }),
            ));
        }

        let now = self.clock.now_ms();
        let bets = self.bets.find_by_round_id(round_id).await?;

        if bets.is_empty() {
            let object_id = self.chain.settlement_object_id(&round, 0, 0).await?;
            self.fsm
                .transition(
                    round_id,
                    Transition::Settle(CompleteSettlement {
                        platform_fee_collected: 0,
                        payout_pool: Some(0),
                        sui_settlement_object_id: object_id,
                        settlement_completed_at: now,
                    }),
                )
                .await?;
            info!(round_id = %round_id, "Round settled with no bets");
            return Ok(SettleOutcome::NoBets { round_id });
        }

        let breakdown = payout_breakdown(&round);
        let plan = plan_payouts(&bets, round.winner, breakdown.payout_ratio, now);
        let report = apply_bet_updates(self.bets.as_ref(), round_id, plan).await;

        if !report.is_complete() {
            warn!(
                round_id = %round_id,
                settled = report.settled_count(),
                failed = report.failed_count(),
                "⚠️ Round partially settled, leaving it CALCULATING"
            );
            return Ok(SettleOutcome::Partial {
                round_id,
                settled_count: report.settled_count(),
                failed_count: report.failed_count(),
                message: format!(
                    "Partially settled: {} bets failed and will be retried",
                    report.failed_count()
                ),
            });
        }

        let object_id = self
            .chain
            .settlement_object_id(&round, breakdown.platform_fee, breakdown.payout_pool)
            .await?;
        self.fsm
            .transition(
                round_id,
                Transition::Settle(CompleteSettlement {
                    platform_fee_collected: breakdown.platform_fee,
                    payout_pool: Some(breakdown.payout_pool),
                    sui_settlement_object_id: object_id,
                    settlement_completed_at: now,
                }),
            )
            .await?;

        info!(
            round_id = %round_id,
            round_number = round.round_number,
            winner = ?round.winner,
            settled = report.settled_count(),
            skipped = report.skipped.len(),
            platform_fee = breakdown.platform_fee,
            total_payout = report.total_payout,
            "💰 Round settled"
        );
        Ok(SettleOutcome::Settled {
            round_id,
            settled_count: report.settled_count(),
            total_payout: report.total_payout,
        })
    }

    /// Operator cancel from any live state. Stakes are refunded first; the
    /// round only moves once every refund is written.
    pub async fn cancel_round(
        &self,
        round_id: Uuid,
        reason: Option<String>,
        cancelled_by: Option<String>,
    ) -> RoundResult<RefundOutcome> {
        let now = self.clock.now_ms();
        self.refund_and_close(
            round_id,
            Transition::Cancel(CancelRound {
                cancellation_reason: reason,
                cancelled_by,
                cancelled_at: now,
            }),
        )
        .await
    }

    /// CALCULATING -> VOIDED with full refunds. Never triggered automatically.
    pub async fn void_round(
        &self,
        round_id: Uuid,
        reason: Option<String>,
    ) -> RoundResult<RefundOutcome> {
        let now = self.clock.now_ms();
        self.refund_and_close(
            round_id,
            Transition::Void(VoidRound {
                settlement_completed_at: now,
                void_reason: reason,
            }),
        )
        .await
    }

    async fn refund_and_close(
        &self,
        round_id: Uuid,
        transition: Transition,
    ) -> RoundResult<RefundOutcome> {
        let target = transition.target();
        let round = self
            .rounds
            .find_by_id(round_id)
            .await?
            .ok_or_else(|| RoundError::round_not_found(round_id))?;

        if round.status == target {
            return Ok(RefundOutcome::AlreadyClosed {
                round_id,
                round_status: round.status,
            });
        }
        // Refunds must not be written for a round that cannot move.
        ensure_allowed(&round, target)?;

        let bets = self.bets.find_by_round_id(round_id).await?;
        ensure_no_payouts(&round, &bets)?;
        let plan = plan_refunds(&bets, self.clock.now_ms());
        let report = apply_bet_updates(self.bets.as_ref(), round_id, plan).await;

        if !report.is_complete() {
            warn!(
                round_id = %round_id,
                target = %target,
                refunded = report.settled_count(),
                failed = report.failed_count(),
                "⚠️ Refunds incomplete, round not closed"
            );
            return Ok(RefundOutcome::Partial {
                round_id,
                refunded_count: report.settled_count(),
                failed_count: report.failed_count(),
                message: format!(
                    "Partially refunded: {} bets failed and will be retried",
                    report.failed_count()
                ),
            });
        }

        let round = self.fsm.transition(round_id, transition).await?;
        info!(
            round_id = %round_id,
            status = %round.status,
            refunded = report.settled_count(),
            total_refunded = report.total_refunded,
            "Round closed with refunds"
        );

        let refunded_count = report.settled_count();
        let total_refunded = report.total_refunded;
        Ok(match target {
            RoundStatus::Voided => RefundOutcome::Voided {
                round,
                refunded_count,
                total_refunded,
            },
            _ => RefundOutcome::Cancelled {
                round,
                refunded_count,
                total_refunded,
            },
        })
    }
}

/// Refunding next to WON/LOST bets would pay out more than the pool holds.
/// A partially settled round has to be settled, not refunded.
fn ensure_no_payouts(round: &Round, bets: &[Bet]) -> RoundResult<()> {
    let decided = bets
        .iter()
        .filter(|b| {
            b.is_settled()
                && matches!(b.result_status, BetResultStatus::Won | BetResultStatus::Lost)
        })
        .count();
    if decided == 0 {
        return Ok(());
    }
    warn!(
        round_id = %round.id,
        status = %round.status,
        decided,
        "Refusing refunds, payouts already written"
    );
    Err(RoundError::business(
        PAYOUTS_ALREADY_WRITTEN,
        format!(
            "Round {} already has {} settled bets; finish settlement instead",
            round.id, decided
        ),
        json!({
            "roundId": round.id.to_string(),
            "currentStatus": round.status.as_str(),
            "settledBets": decided,
        }),
    ))
}

fn ensure_valid_prices(prices: &PriceSnapshot) -> RoundResult<()> {
    if prices.is_valid() {
        Ok(())
    } else {
        Err(RoundError::validation(format!(
            "price snapshot from {} must carry positive finite prices (gold={}, btc={})",
            prices.source, prices.gold, prices.btc
        )))
    }
}

fn stored_price(round: &Round, raw: Option<&str>, field: &str) -> RoundResult<f64> {
    match raw.and_then(|p| p.parse::<f64>().ok()) {
        Some(p) if p.is_finite() && p > 0.0 => Ok(p),
        _ => Err(RoundError::validation(format!(
            "round {} has no usable {} ({:?})",
            round.id, field, raw
        ))),
    }
}

/// No winner means no winning pool, so the ratio is zero and every bet loses.
fn payout_breakdown(round: &Round) -> PayoutBreakdown {
    match round.winner {
        Some(winner) => calculate_payout(PayoutInput {
            winner,
            total_pool: round.total_pool,
            total_gold_bets: round.total_gold_bets,
            total_btc_bets: round.total_btc_bets,
            platform_fee_rate: round.platform_fee_rate,
        }),
        None => {
            let platform_fee =
                (round.total_pool as f64 * clamp_fee_rate(round.platform_fee_rate)).floor() as i64;
            PayoutBreakdown {
                platform_fee,
                payout_pool: round.total_pool - platform_fee,
                payout_ratio: 0.0,
                winning_pool: 0,
                losing_pool: round.total_pool,
            }
        }
    }
}
