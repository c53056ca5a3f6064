//! Round Lifecycle State Machine
//!
//! **States:** `SCHEDULED -> BETTING_OPEN -> BETTING_LOCKED -> [PRICE_PENDING] -> CALCULATING -> SETTLED | VOIDED`,
//! with `CANCELLED` reachable from every non-terminal state.
//!
//! **Hard Rules:**
//! - Forward only. Terminal states have no outgoing edges.
//! - Requesting the state a round is already in is a no-op with zero writes.
//! - Each edge carries its required fields in its own `Transition` variant,
//!   so a round can never be persisted past an edge without that edge's data.
//! - Untyped input (CLI / external callers) goes through
//!   [`transition_from_request`], the only place that checks field presence
//!   at runtime.

use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::clock::Clock;
use super::error::{RoundError, RoundResult, CONCURRENT_TRANSITION, INVALID_TRANSITION};
use super::repository::{RoundPatch, RoundRepository};
use super::types::{Asset, Round, RoundStatus};

// ─── Transition table ───────────────────────────────────────────────────

pub fn allowed_transitions(from: RoundStatus) -> &'static [RoundStatus] {
    use RoundStatus::*;
    match from {
        Scheduled => &[BettingOpen, Cancelled],
        BettingOpen => &[BettingLocked, Cancelled],
        BettingLocked => &[PricePending, Calculating, Cancelled],
        PricePending => &[Calculating, Cancelled],
        Calculating => &[Settled, Voided, Cancelled],
        Settled | Cancelled | Voided => &[],
    }
}

pub fn can_transition(from: RoundStatus, to: RoundStatus) -> bool {
    allowed_transitions(from).contains(&to)
}

/// String form used at the boundary. Unknown states fail closed.
pub fn can_transition_str(from: &str, to: &str) -> bool {
    let Some(from_status) = RoundStatus::from_str(from) else {
        warn!(from, to, "Unknown round status in transition check");
        return false;
    };
    let Some(to_status) = RoundStatus::from_str(to) else {
        warn!(from, to, "Unknown target status in transition check");
        return false;
    };
    can_transition(from_status, to_status)
}

const OPEN_FIELDS: &[&str] = &[
    "goldStartPrice",
    "btcStartPrice",
    "priceSnapshotStartAt",
    "startPriceSource",
    "suiPoolAddress",
    "bettingOpenedAt",
];
const LOCK_FIELDS: &[&str] = &["bettingLockedAt"];
const END_FIELDS: &[&str] = &["roundEndedAt"];
const CALCULATE_FIELDS: &[&str] = &[
    "goldEndPrice",
    "btcEndPrice",
    "priceSnapshotEndAt",
    "endPriceSource",
    "goldChangePercent",
    "btcChangePercent",
    "winner",
];
const LOCKED_TO_CALCULATE_FIELDS: &[&str] = &[
    "roundEndedAt",
    "goldEndPrice",
    "btcEndPrice",
    "priceSnapshotEndAt",
    "endPriceSource",
    "goldChangePercent",
    "btcChangePercent",
    "winner",
];
const SETTLE_FIELDS: &[&str] = &[
    "platformFeeCollected",
    "suiSettlementObjectId",
    "settlementCompletedAt",
];
const VOID_FIELDS: &[&str] = &["settlementCompletedAt"];

/// Metadata keys an edge must carry before it may be persisted.
pub fn required_fields(from: RoundStatus, to: RoundStatus) -> &'static [&'static str] {
    use RoundStatus::*;
    match (from, to) {
        (Scheduled, BettingOpen) => OPEN_FIELDS,
        (BettingOpen, BettingLocked) => LOCK_FIELDS,
        (BettingLocked, PricePending) => END_FIELDS,
        (BettingLocked, Calculating) => LOCKED_TO_CALCULATE_FIELDS,
        (PricePending, Calculating) => CALCULATE_FIELDS,
        (Calculating, Settled) => SETTLE_FIELDS,
        (Calculating, Voided) => VOID_FIELDS,
        _ => &[],
    }
}

// ─── Typed transitions ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct OpenBetting {
    pub gold_start_price: String,
    pub btc_start_price: String,
    pub price_snapshot_start_at: i64,
    pub start_price_source: String,
    pub sui_pool_address: String,
    pub betting_opened_at: i64,
    pub fallback_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LockBetting {
    pub betting_locked_at: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AwaitEndPrice {
    pub round_ended_at: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BeginCalculation {
    pub gold_end_price: String,
    pub btc_end_price: String,
    pub price_snapshot_end_at: i64,
    pub end_price_source: String,
    pub gold_change_percent: f64,
    pub btc_change_percent: f64,
    pub winner: Asset,
    /// CALCULATING entry time; the recovery loop measures staleness from it
    pub round_ended_at: i64,
    pub fallback_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompleteSettlement {
    pub platform_fee_collected: i64,
    /// `None` leaves the stored column as it is
    pub payout_pool: Option<i64>,
    pub sui_settlement_object_id: String,
    pub settlement_completed_at: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VoidRound {
    pub settlement_completed_at: i64,
    pub void_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CancelRound {
    pub cancellation_reason: Option<String>,
    pub cancelled_by: Option<String>,
    pub cancelled_at: i64,
}

/// One variant per target state, each carrying exactly what its edge needs.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    OpenBetting(OpenBetting),
    LockBetting(LockBetting),
    AwaitEndPrice(AwaitEndPrice),
    BeginCalculation(BeginCalculation),
    Settle(CompleteSettlement),
    Void(VoidRound),
    Cancel(CancelRound),
}

impl Transition {
    pub fn target(&self) -> RoundStatus {
        match self {
            Transition::OpenBetting(_) => RoundStatus::BettingOpen,
            Transition::LockBetting(_) => RoundStatus::BettingLocked,
            Transition::AwaitEndPrice(_) => RoundStatus::PricePending,
            Transition::BeginCalculation(_) => RoundStatus::Calculating,
            Transition::Settle(_) => RoundStatus::Settled,
            Transition::Void(_) => RoundStatus::Voided,
            Transition::Cancel(_) => RoundStatus::Cancelled,
        }
    }

    pub fn into_patch(self, updated_at: i64) -> RoundPatch {
        let status = Some(self.target());
        let mut patch = match self {
            Transition::OpenBetting(m) => RoundPatch {
                start_price_is_fallback: Some(m.fallback_reason.is_some()),
                gold_start_price: Some(m.gold_start_price),
                btc_start_price: Some(m.btc_start_price),
                price_snapshot_start_at: Some(m.price_snapshot_start_at),
                start_price_source: Some(m.start_price_source),
                start_price_fallback_reason: m.fallback_reason,
                sui_pool_address: Some(m.sui_pool_address),
                betting_opened_at: Some(m.betting_opened_at),
                ..Default::default()
            },
            Transition::LockBetting(m) => RoundPatch {
                betting_locked_at: Some(m.betting_locked_at),
                ..Default::default()
            },
            Transition::AwaitEndPrice(m) => RoundPatch {
                round_ended_at: Some(m.round_ended_at),
                ..Default::default()
            },
            Transition::BeginCalculation(m) => RoundPatch {
                end_price_is_fallback: Some(m.fallback_reason.is_some()),
                gold_end_price: Some(m.gold_end_price),
                btc_end_price: Some(m.btc_end_price),
                price_snapshot_end_at: Some(m.price_snapshot_end_at),
                end_price_source: Some(m.end_price_source),
                end_price_fallback_reason: m.fallback_reason,
                gold_change_percent: Some(m.gold_change_percent),
                btc_change_percent: Some(m.btc_change_percent),
                winner: Some(m.winner),
                round_ended_at: Some(m.round_ended_at),
                ..Default::default()
            },
            Transition::Settle(m) => RoundPatch {
                platform_fee_collected: Some(m.platform_fee_collected),
                payout_pool: m.payout_pool,
                sui_settlement_object_id: Some(m.sui_settlement_object_id),
                settlement_completed_at: Some(m.settlement_completed_at),
                ..Default::default()
            },
            Transition::Void(m) => RoundPatch {
                settlement_completed_at: Some(m.settlement_completed_at),
                void_reason: m.void_reason,
                ..Default::default()
            },
            Transition::Cancel(m) => RoundPatch {
                cancellation_reason: m.cancellation_reason,
                cancelled_by: m.cancelled_by,
                cancelled_at: Some(m.cancelled_at),
                ..Default::default()
            },
        };
        patch.status = status;
        patch.updated_at = Some(updated_at);
        patch
    }
}

// ─── Boundary validation ────────────────────────────────────────────────

/// Build a typed transition from untyped metadata.
///
/// Missing metadata is treated exactly like metadata with every required key
/// absent: edges with required fields reject it.
pub fn transition_from_request(
    from: RoundStatus,
    to: RoundStatus,
    metadata: Option<&Map<String, Value>>,
    now: i64,
) -> RoundResult<Transition> {
    let empty = Map::new();
    let meta = metadata.unwrap_or(&empty);

    let missing: Vec<String> = required_fields(from, to)
        .iter()
        .filter(|key| meta.get(**key).map_or(true, Value::is_null))
        .map(|key| key.to_string())
        .collect();
    if !missing.is_empty() {
        return Err(RoundError::missing_fields(
            format!("{} -> {} requires metadata", from, to),
            missing,
        ));
    }
    if metadata.is_none() {
        debug!(%from, %to, "Transition requested without metadata");
    }

    let transition = match to {
        RoundStatus::BettingOpen => Transition::OpenBetting(OpenBetting {
            gold_start_price: price_field(meta, "goldStartPrice")?,
            btc_start_price: price_field(meta, "btcStartPrice")?,
            price_snapshot_start_at: int_field(meta, "priceSnapshotStartAt")?,
            start_price_source: str_field(meta, "startPriceSource")?,
            sui_pool_address: str_field(meta, "suiPoolAddress")?,
            betting_opened_at: int_field(meta, "bettingOpenedAt")?,
            fallback_reason: opt_str_field(meta, "startPriceFallbackReason")?,
        }),
        RoundStatus::BettingLocked => Transition::LockBetting(LockBetting {
            betting_locked_at: int_field(meta, "bettingLockedAt")?,
        }),
        RoundStatus::PricePending => Transition::AwaitEndPrice(AwaitEndPrice {
            round_ended_at: int_field(meta, "roundEndedAt")?,
        }),
        RoundStatus::Calculating => Transition::BeginCalculation(BeginCalculation {
            gold_end_price: price_field(meta, "goldEndPrice")?,
            btc_end_price: price_field(meta, "btcEndPrice")?,
            price_snapshot_end_at: int_field(meta, "priceSnapshotEndAt")?,
            end_price_source: str_field(meta, "endPriceSource")?,
            gold_change_percent: float_field(meta, "goldChangePercent")?,
            btc_change_percent: float_field(meta, "btcChangePercent")?,
            winner: winner_field(meta, "winner")?,
            round_ended_at: match meta.get("roundEndedAt") {
                Some(v) if !v.is_null() => int_field(meta, "roundEndedAt")?,
                _ => now,
            },
            fallback_reason: opt_str_field(meta, "endPriceFallbackReason")?,
        }),
        RoundStatus::Settled => Transition::Settle(CompleteSettlement {
            platform_fee_collected: int_field(meta, "platformFeeCollected")?,
            payout_pool: match meta.get("payoutPool") {
                Some(v) if !v.is_null() => Some(int_field(meta, "payoutPool")?),
                _ => None,
            },
            sui_settlement_object_id: str_field(meta, "suiSettlementObjectId")?,
            settlement_completed_at: int_field(meta, "settlementCompletedAt")?,
        }),
        RoundStatus::Voided => Transition::Void(VoidRound {
            settlement_completed_at: int_field(meta, "settlementCompletedAt")?,
            void_reason: opt_str_field(meta, "voidReason")?,
        }),
        RoundStatus::Cancelled => Transition::Cancel(CancelRound {
            cancellation_reason: opt_str_field(meta, "cancellationReason")?,
            cancelled_by: opt_str_field(meta, "cancelledBy")?,
            cancelled_at: now,
        }),
        RoundStatus::Scheduled => {
            return Err(RoundError::validation(
                "SCHEDULED is an initial state and cannot be a transition target",
            ))
        }
    };
    Ok(transition)
}

fn invalid(key: &str, expected: &str) -> RoundError {
    RoundError::validation(format!("metadata field {} must be {}", key, expected))
}

fn str_field(meta: &Map<String, Value>, key: &str) -> RoundResult<String> {
    match meta.get(key) {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.clone()),
        _ => Err(invalid(key, "a non-empty string")),
    }
}

fn opt_str_field(meta: &Map<String, Value>, key: &str) -> RoundResult<Option<String>> {
    match meta.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(invalid(key, "a string")),
    }
}

/// Prices stay decimal strings; numbers are accepted and stringified.
fn price_field(meta: &Map<String, Value>, key: &str) -> RoundResult<String> {
    let raw = match meta.get(key) {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        _ => return Err(invalid(key, "a decimal price")),
    };
    match raw.parse::<f64>() {
        Ok(p) if p.is_finite() && p > 0.0 => Ok(raw),
        _ => Err(invalid(key, "a positive decimal price")),
    }
}

fn int_field(meta: &Map<String, Value>, key: &str) -> RoundResult<i64> {
    meta.get(key)
        .and_then(Value::as_i64)
        .ok_or_else(|| invalid(key, "an integer"))
}

fn float_field(meta: &Map<String, Value>, key: &str) -> RoundResult<f64> {
    meta.get(key)
        .and_then(Value::as_f64)
        .ok_or_else(|| invalid(key, "a number"))
}

fn winner_field(meta: &Map<String, Value>, key: &str) -> RoundResult<Asset> {
    meta.get(key)
        .and_then(Value::as_str)
        .and_then(Asset::from_str)
        .ok_or_else(|| invalid(key, "GOLD or BTC"))
}

pub fn parse_round_id(raw: &str) -> RoundResult<Uuid> {
    Uuid::parse_str(raw.trim())
        .map_err(|_| RoundError::validation(format!("invalid round id: {:?}", raw)))
}

// ─── Executor ───────────────────────────────────────────────────────────

/// The only mutator of round status.
pub struct RoundFsm {
    rounds: Arc<dyn RoundRepository>,
    clock: Arc<dyn Clock>,
}

impl RoundFsm {
    pub fn new(rounds: Arc<dyn RoundRepository>, clock: Arc<dyn Clock>) -> Self {
        Self { rounds, clock }
    }

    /// Apply a typed transition.
    pub async fn transition(&self, round_id: Uuid, transition: Transition) -> RoundResult<Round> {
        let round = self.load(round_id).await?;
        self.apply(round, transition).await
    }

    /// Boundary entry point for untyped callers.
    pub async fn transition_round_status(
        &self,
        round_id: &str,
        new_status: RoundStatus,
        metadata: Option<&Map<String, Value>>,
    ) -> RoundResult<Round> {
        let id = parse_round_id(round_id)?;
        let round = self.load(id).await?;

        if round.status == new_status {
            debug!(round_id = %id, status = %new_status, "Transition to current status is a no-op");
            return Ok(round);
        }
        ensure_allowed(&round, new_status)?;

        let transition =
            transition_from_request(round.status, new_status, metadata, self.clock.now_ms())?;
        self.apply(round, transition).await
    }

    async fn load(&self, round_id: Uuid) -> RoundResult<Round> {
        self.rounds
            .find_by_id(round_id)
            .await?
            .ok_or_else(|| RoundError::round_not_found(round_id))
    }

    async fn apply(&self, round: Round, transition: Transition) -> RoundResult<Round> {
        let from = round.status;
        let to = transition.target();

        if from == to {
            debug!(round_id = %round.id, status = %to, "Transition to current status is a no-op");
            return Ok(round);
        }
        ensure_allowed(&round, to)?;

        let patch = transition.into_patch(self.clock.now_ms());
        match self.rounds.update_if_status(round.id, from, &patch).await? {
            Some(updated) => {
                info!(
                    round_id = %updated.id,
                    round_number = updated.round_number,
                    from = %from,
                    to = %to,
                    "🔄 Round status transition"
                );
                Ok(updated)
            }
            None => {
                // Lost the compare-and-swap; someone else moved the round.
                let current = self.load(round.id).await?;
                if current.status == to {
                    debug!(round_id = %current.id, status = %to, "Concurrent transition already applied");
                    Ok(current)
                } else {
                    warn!(
                        round_id = %current.id,
                        expected = %from,
                        actual = %current.status,
                        wanted = %to,
                        "Round moved during transition"
                    );
                    Err(RoundError::business(
                        CONCURRENT_TRANSITION,
                        format!(
                            "Round {} changed from {} to {} while transitioning to {}",
                            current.id, from, current.status, to
                        ),
                        json!({
                            "roundId": current.id.to_string(),
                            "expectedStatus": from.as_str(),
                            "currentStatus": current.status.as_str(),
                            "newStatus": to.as_str(),
                        }),
                    ))
                }
            }
        }
    }
}

/// `INVALID_TRANSITION` unless `round` may move to `to`.
pub fn ensure_allowed(round: &Round, to: RoundStatus) -> RoundResult<()> {
    if can_transition(round.status, to) {
        return Ok(());
    }
    let allowed: Vec<&str> = allowed_transitions(round.status)
        .iter()
        .map(|s| s.as_str())
        .collect();
    warn!(
        round_id = %round.id,
        from = %round.status,
        to = %to,
        "Rejected illegal round transition"
    );
    Err(RoundError::business(
        INVALID_TRANSITION,
        format!(
            "Cannot transition round {} from {} to {}",
            round.id, round.status, to
        ),
        json!({
            "roundId": round.id.to_string(),
            "currentStatus": round.status.as_str(),
            "newStatus": to.as_str(),
            "allowedTransitions": allowed,
        }),
    ))
}
