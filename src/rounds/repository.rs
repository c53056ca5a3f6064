//! Persistence contracts consumed by the round engine.
//!
//! Storage is only assumed to offer single-row atomicity: rounds move through
//! a compare-and-swap on `status`, bets through a compare-and-swap on
//! `settlementStatus`. No multi-row transactions are relied upon.

use anyhow::Result;
use uuid::Uuid;

use super::types::{Asset, Bet, BetResultStatus, Round, RoundStatus, RoundType, SettlementStatus};

/// Partial update of a round. `None` leaves the column untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoundPatch {
    pub status: Option<RoundStatus>,

    pub gold_start_price: Option<String>,
    pub btc_start_price: Option<String>,
    pub price_snapshot_start_at: Option<i64>,
    pub start_price_source: Option<String>,
    pub start_price_is_fallback: Option<bool>,
    pub start_price_fallback_reason: Option<String>,
    pub gold_end_price: Option<String>,
    pub btc_end_price: Option<String>,
    pub price_snapshot_end_at: Option<i64>,
    pub end_price_source: Option<String>,
    pub end_price_is_fallback: Option<bool>,
    pub end_price_fallback_reason: Option<String>,

    pub gold_change_percent: Option<f64>,
    pub btc_change_percent: Option<f64>,
    pub winner: Option<Asset>,
    pub platform_fee_collected: Option<i64>,
    pub payout_pool: Option<i64>,
    pub sui_pool_address: Option<String>,
    pub sui_settlement_object_id: Option<String>,
    pub cancellation_reason: Option<String>,
    pub cancelled_by: Option<String>,
    pub void_reason: Option<String>,

    pub betting_opened_at: Option<i64>,
    pub betting_locked_at: Option<i64>,
    pub round_ended_at: Option<i64>,
    pub settlement_completed_at: Option<i64>,
    pub settlement_failure_alert_sent_at: Option<i64>,
    pub cancelled_at: Option<i64>,

    /// Stores default this to their own clock when absent
    pub updated_at: Option<i64>,
}

impl RoundPatch {
    /// Apply onto an in-memory round. Shared by the fake store and by tests.
    pub fn apply_to(&self, round: &mut Round, now: i64) {
        macro_rules! set {
            ($($field:ident),* $(,)?) => {
                $(if let Some(v) = &self.$field { round.$field = v.clone(); })*
            };
        }
        macro_rules! set_opt {
            ($($field:ident),* $(,)?) => {
                $(if let Some(v) = &self.$field { round.$field = Some(v.clone()); })*
            };
        }

        set!(status, start_price_is_fallback, end_price_is_fallback);
        set_opt!(
            gold_start_price,
            btc_start_price,
            price_snapshot_start_at,
            start_price_source,
            start_price_fallback_reason,
            gold_end_price,
            btc_end_price,
            price_snapshot_end_at,
            end_price_source,
            end_price_fallback_reason,
            gold_change_percent,
            btc_change_percent,
            winner,
            platform_fee_collected,
            payout_pool,
            sui_pool_address,
            sui_settlement_object_id,
            cancellation_reason,
            cancelled_by,
            void_reason,
            betting_opened_at,
            betting_locked_at,
            round_ended_at,
            settlement_completed_at,
            settlement_failure_alert_sent_at,
            cancelled_at,
        );
        round.updated_at = self.updated_at.unwrap_or(now);
    }
}

/// Settlement write for one bet.
#[derive(Debug, Clone, PartialEq)]
pub struct BetPatch {
    pub result_status: BetResultStatus,
    pub settlement_status: SettlementStatus,
    pub payout_amount: i64,
    pub settled_at: Option<i64>,
}

#[async_trait::async_trait]
pub trait RoundRepository: Send + Sync {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Round>>;

    /// Unconditional partial update. Returns the updated row, `None` if absent.
    async fn update_by_id(&self, id: Uuid, patch: &RoundPatch) -> Result<Option<Round>>;

    /// Compare-and-swap on status: applies only while the row is still in
    /// `expected`. Returns `None` when the row is missing or has moved on.
    async fn update_if_status(
        &self,
        id: Uuid,
        expected: RoundStatus,
        patch: &RoundPatch,
    ) -> Result<Option<Round>>;

    /// Sets `settlementFailureAlertSentAt` only while the round is still
    /// CALCULATING and has never been escalated. `None` means another worker
    /// got there first (or the round moved on) and no alert may be sent.
    async fn mark_settlement_alert_sent(&self, id: Uuid, at: i64) -> Result<Option<Round>>;

    /// Highest `roundNumber` of the given type.
    async fn find_last_round(&self, round_type: RoundType) -> Result<Option<Round>>;

    async fn find_by_start_time(
        &self,
        round_type: RoundType,
        start_time: i64,
    ) -> Result<Option<Round>>;

    /// Most recent (latest `startTime`) round in `status`.
    async fn find_latest_by_status(&self, status: RoundStatus) -> Result<Option<Round>>;

    async fn insert(&self, round: &Round) -> Result<Round>;

    /// CALCULATING rounds with `roundEndedAt <= threshold_ms` or no
    /// `roundEndedAt` at all.
    async fn find_stuck_calculating_rounds(&self, threshold_ms: i64) -> Result<Vec<Round>>;
}

#[async_trait::async_trait]
pub trait BetRepository: Send + Sync {
    async fn find_by_round_id(&self, round_id: Uuid) -> Result<Vec<Bet>>;

    /// Conditional settlement write: skipped when the bet is already
    /// COMPLETED. Returns whether the row was written.
    async fn update_by_id(&self, id: Uuid, patch: &BetPatch) -> Result<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_patch_leaves_unset_fields() {
        let mut round = Round::scheduled(RoundType::OneMin, 1, 0, 20_000, 0.05, 0);
        round.gold_start_price = Some("2650".into());

        let patch = RoundPatch {
            status: Some(RoundStatus::BettingLocked),
            betting_locked_at: Some(42),
            ..Default::default()
        };
        patch.apply_to(&mut round, 99);

        assert_eq!(round.status, RoundStatus::BettingLocked);
        assert_eq!(round.betting_locked_at, Some(42));
        assert_eq!(round.gold_start_price.as_deref(), Some("2650"));
        assert_eq!(round.updated_at, 99);
    }
}
