//! Round & Bet Models
//! Mission: One canonical shape for rounds, bets and their status enums

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

pub const MS_PER_SEC: i64 = 1_000;
pub const MS_PER_MIN: i64 = 60 * MS_PER_SEC;
pub const MS_PER_HOUR: i64 = 60 * MS_PER_MIN;
pub const MS_PER_DAY: i64 = 24 * MS_PER_HOUR;

/// The two assets a round compares. Doubles as the bet prediction and the winner.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum Asset {
    Gold,
    Btc,
}

impl Asset {
    pub fn as_str(&self) -> &'static str {
        match self {
            Asset::Gold => "GOLD",
            Asset::Btc => "BTC",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "GOLD" => Some(Asset::Gold),
            "BTC" => Some(Asset::Btc),
            _ => None,
        }
    }
}

impl fmt::Display for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Period length of a round.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum RoundType {
    #[serde(rename = "1MIN")]
    OneMin,
    #[serde(rename = "6HOUR")]
    SixHour,
    #[serde(rename = "1DAY")]
    OneDay,
}

impl RoundType {
    pub const ALL: [RoundType; 3] = [RoundType::OneMin, RoundType::SixHour, RoundType::OneDay];

    pub fn as_str(&self) -> &'static str {
        match self {
            RoundType::OneMin => "1MIN",
            RoundType::SixHour => "6HOUR",
            RoundType::OneDay => "1DAY",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "1MIN" => Some(RoundType::OneMin),
            "6HOUR" => Some(RoundType::SixHour),
            "1DAY" => Some(RoundType::OneDay),
            _ => None,
        }
    }

    /// Fixed round length in milliseconds.
    pub fn duration_ms(&self) -> i64 {
        match self {
            RoundType::OneMin => MS_PER_MIN,
            RoundType::SixHour => 6 * MS_PER_HOUR,
            RoundType::OneDay => MS_PER_DAY,
        }
    }
}

impl fmt::Display for RoundType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoundStatus {
    Scheduled,
    BettingOpen,
    BettingLocked,
    PricePending,
    Calculating,
    Settled,
    Cancelled,
    Voided,
}

impl RoundStatus {
    pub const ALL: [RoundStatus; 8] = [
        RoundStatus::Scheduled,
        RoundStatus::BettingOpen,
        RoundStatus::BettingLocked,
        RoundStatus::PricePending,
        RoundStatus::Calculating,
        RoundStatus::Settled,
        RoundStatus::Cancelled,
        RoundStatus::Voided,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RoundStatus::Scheduled => "SCHEDULED",
            RoundStatus::BettingOpen => "BETTING_OPEN",
            RoundStatus::BettingLocked => "BETTING_LOCKED",
            RoundStatus::PricePending => "PRICE_PENDING",
            RoundStatus::Calculating => "CALCULATING",
            RoundStatus::Settled => "SETTLED",
            RoundStatus::Cancelled => "CANCELLED",
            RoundStatus::Voided => "VOIDED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        let wanted = s.trim().to_uppercase();
        Self::ALL.into_iter().find(|st| st.as_str() == wanted)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RoundStatus::Settled | RoundStatus::Cancelled | RoundStatus::Voided
        )
    }
}

impl fmt::Display for RoundStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum BetResultStatus {
    Pending,
    Won,
    Lost,
    Refunded,
}

impl BetResultStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BetResultStatus::Pending => "PENDING",
            BetResultStatus::Won => "WON",
            BetResultStatus::Lost => "LOST",
            BetResultStatus::Refunded => "REFUNDED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(BetResultStatus::Pending),
            "WON" => Some(BetResultStatus::Won),
            "LOST" => Some(BetResultStatus::Lost),
            "REFUNDED" => Some(BetResultStatus::Refunded),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum SettlementStatus {
    Pending,
    Completed,
    Failed,
}

impl SettlementStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SettlementStatus::Pending => "PENDING",
            SettlementStatus::Completed => "COMPLETED",
            SettlementStatus::Failed => "FAILED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(SettlementStatus::Pending),
            "COMPLETED" => Some(SettlementStatus::Completed),
            "FAILED" => Some(SettlementStatus::Failed),
            _ => None,
        }
    }
}

/// One betting period.
///
/// Prices are kept as decimal strings so the stored value is exactly what the
/// price source reported. Every `Option` field is filled in by the FSM edge
/// that requires it and never cleared afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Round {
    pub id: Uuid,
    pub round_number: i64,
    #[serde(rename = "type")]
    pub round_type: RoundType,
    pub status: RoundStatus,

    pub start_time: i64,
    pub lock_time: i64,
    pub end_time: i64,

    // --- Prices ---
    pub gold_start_price: Option<String>,
    pub btc_start_price: Option<String>,
    pub price_snapshot_start_at: Option<i64>,
    pub start_price_source: Option<String>,
    pub start_price_is_fallback: bool,
    pub start_price_fallback_reason: Option<String>,
    pub gold_end_price: Option<String>,
    pub btc_end_price: Option<String>,
    pub price_snapshot_end_at: Option<i64>,
    pub end_price_source: Option<String>,
    pub end_price_is_fallback: bool,
    pub end_price_fallback_reason: Option<String>,

    // --- Pool aggregates (owned by bet placement) ---
    pub total_pool: i64,
    pub total_gold_bets: i64,
    pub total_btc_bets: i64,
    pub total_bets_count: i64,

    // --- Settlement outputs ---
    pub gold_change_percent: Option<f64>,
    pub btc_change_percent: Option<f64>,
    pub winner: Option<Asset>,
    pub platform_fee_rate: f64,
    pub platform_fee_collected: Option<i64>,
    pub payout_pool: Option<i64>,
    pub sui_pool_address: Option<String>,
    pub sui_settlement_object_id: Option<String>,
    pub cancellation_reason: Option<String>,
    pub cancelled_by: Option<String>,
    pub void_reason: Option<String>,

    // --- Lifecycle timestamps ---
    pub betting_opened_at: Option<i64>,
    pub betting_locked_at: Option<i64>,
    pub round_ended_at: Option<i64>,
    pub settlement_completed_at: Option<i64>,
    pub settlement_failure_alert_sent_at: Option<i64>,
    pub cancelled_at: Option<i64>,

    pub created_at: i64,
    pub updated_at: i64,
}

impl Round {
    /// Fresh SCHEDULED round; lock and end times derive from `start_time`.
    pub fn scheduled(
        round_type: RoundType,
        round_number: i64,
        start_time: i64,
        betting_window_ms: i64,
        platform_fee_rate: f64,
        now: i64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            round_number,
            round_type,
            status: RoundStatus::Scheduled,
            start_time,
            lock_time: start_time + betting_window_ms,
            end_time: start_time + round_type.duration_ms(),
            gold_start_price: None,
            btc_start_price: None,
            price_snapshot_start_at: None,
            start_price_source: None,
            start_price_is_fallback: false,
            start_price_fallback_reason: None,
            gold_end_price: None,
            btc_end_price: None,
            price_snapshot_end_at: None,
            end_price_source: None,
            end_price_is_fallback: false,
            end_price_fallback_reason: None,
            total_pool: 0,
            total_gold_bets: 0,
            total_btc_bets: 0,
            total_bets_count: 0,
            gold_change_percent: None,
            btc_change_percent: None,
            winner: None,
            platform_fee_rate,
            platform_fee_collected: None,
            payout_pool: None,
            sui_pool_address: None,
            sui_settlement_object_id: None,
            cancellation_reason: None,
            cancelled_by: None,
            void_reason: None,
            betting_opened_at: None,
            betting_locked_at: None,
            round_ended_at: None,
            settlement_completed_at: None,
            settlement_failure_alert_sent_at: None,
            cancelled_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// One user's wager on one round.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Bet {
    pub id: Uuid,
    pub round_id: Uuid,
    pub user_id: String,
    pub prediction: Asset,
    pub amount: i64,
    pub result_status: BetResultStatus,
    pub settlement_status: SettlementStatus,
    pub payout_amount: i64,
    pub settled_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Bet {
    pub fn new(round_id: Uuid, user_id: &str, prediction: Asset, amount: i64, now: i64) -> Self {
        Self {
            id: Uuid::new_v4(),
            round_id,
            user_id: user_id.to_string(),
            prediction,
            amount,
            result_status: BetResultStatus::Pending,
            settlement_status: SettlementStatus::Pending,
            payout_amount: 0,
            settled_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_settled(&self) -> bool {
        self.settlement_status == SettlementStatus::Completed
    }
}

/// A price observation for both assets, as handed over by the price feed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PriceSnapshot {
    pub gold: f64,
    pub btc: f64,
    pub timestamp: i64,
    pub source: String,
    /// Set when the feed served a fallback quote instead of the primary one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<String>,
}

impl PriceSnapshot {
    pub fn new(gold: f64, btc: f64, timestamp: i64, source: &str) -> Self {
        Self {
            gold,
            btc,
            timestamp,
            source: source.to_string(),
            fallback_reason: None,
        }
    }

    pub fn is_fallback(&self) -> bool {
        self.fallback_reason.is_some()
    }

    pub fn is_valid(&self) -> bool {
        self.gold.is_finite() && self.gold > 0.0 && self.btc.is_finite() && self.btc > 0.0
    }
}
