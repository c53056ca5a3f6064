//! In-memory round & bet store.
//!
//! Same contracts as the SQLite store, plus fault injection so settlement and
//! recovery paths can be driven through partial failures in tests.

use anyhow::{anyhow, Result};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use uuid::Uuid;

use super::repository::{BetPatch, BetRepository, RoundPatch, RoundRepository};
use super::types::{Asset, Bet, Round, RoundStatus, RoundType, SettlementStatus};

#[derive(Default)]
pub struct InMemoryRoundStore {
    rounds: Mutex<HashMap<Uuid, Round>>,
    bets: Mutex<HashMap<Uuid, Bet>>,
    failing_bets: Mutex<HashSet<Uuid>>,
    fail_round_reads: AtomicBool,
    round_writes: AtomicUsize,
    bet_writes: AtomicUsize,
}

impl InMemoryRoundStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a bet and bump the round aggregates under one lock.
    pub fn record_bet(&self, bet: &Bet) -> Result<()> {
        let mut rounds = self.rounds.lock();
        let round = rounds
            .get_mut(&bet.round_id)
            .ok_or_else(|| anyhow!("round {} not found", bet.round_id))?;
        round.total_pool += bet.amount;
        round.total_bets_count += 1;
        match bet.prediction {
            Asset::Gold => round.total_gold_bets += bet.amount,
            Asset::Btc => round.total_btc_bets += bet.amount,
        }
        self.bets.lock().insert(bet.id, bet.clone());
        Ok(())
    }

    pub fn bet(&self, id: Uuid) -> Option<Bet> {
        self.bets.lock().get(&id).cloned()
    }

    /// Every update of `bet_id` fails until cleared.
    pub fn fail_bet_updates(&self, bet_id: Uuid) {
        self.failing_bets.lock().insert(bet_id);
    }

    pub fn clear_bet_failures(&self) {
        self.failing_bets.lock().clear();
    }

    /// Make `find_by_id` error out, simulating a storage outage.
    pub fn set_fail_round_reads(&self, fail: bool) {
        self.fail_round_reads.store(fail, Ordering::SeqCst);
    }

    pub fn round_write_count(&self) -> usize {
        self.round_writes.load(Ordering::SeqCst)
    }

    pub fn bet_write_count(&self) -> usize {
        self.bet_writes.load(Ordering::SeqCst)
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[async_trait::async_trait]
impl RoundRepository for InMemoryRoundStore {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Round>> {
        if self.fail_round_reads.load(Ordering::SeqCst) {
            return Err(anyhow!("round store unavailable"));
        }
        Ok(self.rounds.lock().get(&id).cloned())
    }

    async fn update_by_id(&self, id: Uuid, patch: &RoundPatch) -> Result<Option<Round>> {
        let mut rounds = self.rounds.lock();
        let Some(round) = rounds.get_mut(&id) else {
            return Ok(None);
        };
        patch.apply_to(round, now_ms());
        self.round_writes.fetch_add(1, Ordering::SeqCst);
        Ok(Some(round.clone()))
    }

    async fn update_if_status(
        &self,
        id: Uuid,
        expected: RoundStatus,
        patch: &RoundPatch,
    ) -> Result<Option<Round>> {
        let mut rounds = self.rounds.lock();
        let Some(round) = rounds.get_mut(&id) else {
            return Ok(None);
        };
        if round.status != expected {
            return Ok(None);
        }
        patch.apply_to(round, now_ms());
        self.round_writes.fetch_add(1, Ordering::SeqCst);
        Ok(Some(round.clone()))
    }

    async fn mark_settlement_alert_sent(&self, id: Uuid, at: i64) -> Result<Option<Round>> {
        let mut rounds = self.rounds.lock();
        let Some(round) = rounds.get_mut(&id) else {
            return Ok(None);
        };
        if round.status != RoundStatus::Calculating
            || round.settlement_failure_alert_sent_at.is_some()
        {
            return Ok(None);
        }
        round.settlement_failure_alert_sent_at = Some(at);
        round.updated_at = at;
        self.round_writes.fetch_add(1, Ordering::SeqCst);
        Ok(Some(round.clone()))
    }

    async fn find_last_round(&self, round_type: RoundType) -> Result<Option<Round>> {
        Ok(self
            .rounds
            .lock()
            .values()
            .filter(|r| r.round_type == round_type)
            .max_by_key(|r| r.round_number)
            .cloned())
    }

    async fn find_by_start_time(
        &self,
        round_type: RoundType,
        start_time: i64,
    ) -> Result<Option<Round>> {
        Ok(self
            .rounds
            .lock()
            .values()
            .find(|r| r.round_type == round_type && r.start_time == start_time)
            .cloned())
    }

    async fn find_latest_by_status(&self, status: RoundStatus) -> Result<Option<Round>> {
        Ok(self
            .rounds
            .lock()
            .values()
            .filter(|r| r.status == status)
            .max_by_key(|r| (r.start_time, r.round_number))
            .cloned())
    }

    async fn insert(&self, round: &Round) -> Result<Round> {
        let mut rounds = self.rounds.lock();
        if rounds.values().any(|r| {
            r.id == round.id
                || (r.round_type == round.round_type && r.start_time == round.start_time)
        }) {
            return Err(anyhow!(
                "duplicate round {} ({} @ {})",
                round.id,
                round.round_type,
                round.start_time
            ));
        }
        rounds.insert(round.id, round.clone());
        Ok(round.clone())
    }

    async fn find_stuck_calculating_rounds(&self, threshold_ms: i64) -> Result<Vec<Round>> {
        let mut stuck: Vec<Round> = self
            .rounds
            .lock()
            .values()
            .filter(|r| r.status == RoundStatus::Calculating)
            .filter(|r| r.round_ended_at.map_or(true, |t| t <= threshold_ms))
            .cloned()
            .collect();
        stuck.sort_by_key(|r| r.round_ended_at.unwrap_or(i64::MIN));
        Ok(stuck)
    }
}

#[async_trait::async_trait]
impl BetRepository for InMemoryRoundStore {
    async fn find_by_round_id(&self, round_id: Uuid) -> Result<Vec<Bet>> {
        let mut bets: Vec<Bet> = self
            .bets
            .lock()
            .values()
            .filter(|b| b.round_id == round_id)
            .cloned()
            .collect();
        bets.sort_by_key(|b| (b.created_at, b.id));
        Ok(bets)
    }

    async fn update_by_id(&self, id: Uuid, patch: &BetPatch) -> Result<bool> {
        if self.failing_bets.lock().contains(&id) {
            return Err(anyhow!("injected failure updating bet {}", id));
        }
        let mut bets = self.bets.lock();
        let bet = bets
            .get_mut(&id)
            .ok_or_else(|| anyhow!("bet {} not found", id))?;
        if bet.settlement_status == SettlementStatus::Completed {
            return Ok(false);
        }
        bet.result_status = patch.result_status;
        bet.settlement_status = patch.settlement_status;
        bet.payout_amount = patch.payout_amount;
        bet.settled_at = patch.settled_at;
        bet.updated_at = now_ms();
        self.bet_writes.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }
}
