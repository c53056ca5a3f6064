//! Integration tests for the round lifecycle
//!
//! Drives rounds end to end through `RoundService` against a real SQLite file,
//! the way the `roundbot` cron subcommands do.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::NamedTempFile;
use uuid::Uuid;

use roundbot_backend::rounds::{
    error::CONCURRENT_TRANSITION,
    fsm::{CancelRound, LockBetting},
    repository::{BetPatch, RoundPatch},
    types::{BetResultStatus, SettlementStatus, MS_PER_MIN, MS_PER_SEC},
    AlertSink, Asset, Bet, BetRepository, FinalizeOutcome, LockOutcome, ManualClock, OpenOutcome,
    PaperChainAdapter, PriceSnapshot, RecoveryLoop, RecoverySummary, RefundOutcome, Round,
    RoundConfig, RoundRepository, RoundService, RoundStatus, RoundType, SettleOutcome,
    SqliteRoundStore, Transition,
};

// 2026-01-01T00:00:00Z
const JAN_1: i64 = 1_767_225_600_000;

/// Hands control back to the runtime after every round read and before every
/// status write, so branches of a `tokio::join!` really interleave the way two
/// cron processes would.
struct Interleaved {
    inner: Arc<SqliteRoundStore>,
    bet_writes: AtomicUsize,
}

impl Interleaved {
    fn bet_writes(&self) -> usize {
        self.bet_writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RoundRepository for Interleaved {
    async fn find_by_id(&self, id: Uuid) -> anyhow::Result<Option<Round>> {
        let round = self.inner.find_by_id(id).await?;
        tokio::task::yield_now().await;
        Ok(round)
    }

    async fn update_by_id(&self, id: Uuid, patch: &RoundPatch) -> anyhow::Result<Option<Round>> {
        RoundRepository::update_by_id(self.inner.as_ref(), id, patch).await
    }

    async fn update_if_status(
        &self,
        id: Uuid,
        expected: RoundStatus,
        patch: &RoundPatch,
    ) -> anyhow::Result<Option<Round>> {
        tokio::task::yield_now().await;
        self.inner.update_if_status(id, expected, patch).await
    }

    async fn mark_settlement_alert_sent(&self, id: Uuid, at: i64) -> anyhow::Result<Option<Round>> {
        self.inner.mark_settlement_alert_sent(id, at).await
    }

    async fn find_last_round(&self, round_type: RoundType) -> anyhow::Result<Option<Round>> {
        self.inner.find_last_round(round_type).await
    }

    async fn find_by_start_time(
        &self,
        round_type: RoundType,
        start_time: i64,
    ) -> anyhow::Result<Option<Round>> {
        self.inner.find_by_start_time(round_type, start_time).await
    }

    async fn find_latest_by_status(&self, status: RoundStatus) -> anyhow::Result<Option<Round>> {
        self.inner.find_latest_by_status(status).await
    }

    async fn insert(&self, round: &Round) -> anyhow::Result<Round> {
        self.inner.insert(round).await
    }

    async fn find_stuck_calculating_rounds(&self, threshold_ms: i64) -> anyhow::Result<Vec<Round>> {
        let stuck = self.inner.find_stuck_calculating_rounds(threshold_ms).await?;
        tokio::task::yield_now().await;
        Ok(stuck)
    }
}

#[async_trait]
impl BetRepository for Interleaved {
    async fn find_by_round_id(&self, round_id: Uuid) -> anyhow::Result<Vec<Bet>> {
        self.inner.find_by_round_id(round_id).await
    }

    async fn update_by_id(&self, id: Uuid, patch: &BetPatch) -> anyhow::Result<bool> {
        let written = BetRepository::update_by_id(self.inner.as_ref(), id, patch).await?;
        if written {
            self.bet_writes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(written)
    }
}

#[derive(Default)]
struct Alerts {
    sent: Mutex<Vec<(Uuid, i64)>>,
}

impl Alerts {
    fn sent(&self) -> Vec<(Uuid, i64)> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl AlertSink for Alerts {
    async fn settlement_stuck(&self, round: &Round, stuck_ms: i64) {
        self.sent.lock().push((round.id, stuck_ms));
    }
}

struct Env {
    _db: NamedTempFile,
    store: Arc<SqliteRoundStore>,
    shared: Arc<Interleaved>,
    clock: Arc<ManualClock>,
    service: Arc<RoundService>,
}

fn setup(now: i64) -> Env {
    let db = NamedTempFile::new().expect("temp db");
    let store = Arc::new(SqliteRoundStore::new(db.path().to_str().unwrap()).expect("open store"));
    let shared = Arc::new(Interleaved {
        inner: store.clone(),
        bet_writes: AtomicUsize::new(0),
    });
    let clock = Arc::new(ManualClock::new(now));
    let config = RoundConfig {
        default_round_type: RoundType::OneMin,
        ..Default::default()
    };
    let service = Arc::new(RoundService::new(
        shared.clone(),
        shared.clone(),
        clock.clone(),
        Arc::new(PaperChainAdapter::default()),
        config,
    ));
    Env {
        _db: db,
        store,
        shared,
        clock,
        service,
    }
}

fn recovery_loop(env: &Env, alerts: &Arc<Alerts>) -> RecoveryLoop {
    RecoveryLoop::new(
        env.shared.clone(),
        env.service.clone(),
        alerts.clone(),
        env.clock.clone(),
    )
}

fn prices(gold: f64, btc: f64, ts: i64) -> PriceSnapshot {
    PriceSnapshot::new(gold, btc, ts, "integration-feed")
}

async fn load(env: &Env, round: &Round) -> Round {
    env.store.find_by_id(round.id).await.unwrap().unwrap()
}

#[tokio::test]
async fn test_full_lifecycle_pays_reference_pool() {
    let env = setup(JAN_1 + 30 * MS_PER_SEC);

    let round = env.service.create_next_scheduled_round().await.unwrap();
    assert_eq!(round.round_number, 1);
    assert_eq!(round.start_time, JAN_1 + MS_PER_MIN);
    assert_eq!(round.lock_time, round.start_time + 20 * MS_PER_SEC);
    assert_eq!(round.end_time, round.start_time + MS_PER_MIN);

    env.clock.set(round.start_time);
    let opened = env
        .service
        .open_round(&prices(2650.0, 98000.0, round.start_time))
        .await
        .unwrap();
    assert!(matches!(opened, OpenOutcome::Opened { .. }));

    let bets = [
        Bet::new(round.id, "alice", Asset::Gold, 100_000, round.start_time + 1),
        Bet::new(round.id, "bob", Asset::Gold, 500_000, round.start_time + 2),
        Bet::new(round.id, "carol", Asset::Btc, 400_000, round.start_time + 3),
    ];
    for bet in &bets {
        env.store.record_bet(bet).unwrap();
    }
    let stored = load(&env, &round).await;
    assert_eq!(stored.total_pool, 1_000_000);
    assert_eq!(stored.total_gold_bets, 600_000);
    assert_eq!(stored.total_bets_count, 3);

    env.clock.set(round.lock_time);
    assert!(matches!(
        env.service.lock_round().await.unwrap(),
        LockOutcome::Locked { .. }
    ));

    env.clock.set(round.end_time);
    let outcome = env
        .service
        .finalize_round(&prices(2676.5, 97020.0, round.end_time))
        .await
        .unwrap();
    let FinalizeOutcome::Finalized {
        winner, settlement, ..
    } = outcome
    else {
        panic!("round should finalize");
    };
    assert_eq!(winner, Asset::Gold);
    assert_eq!(
        settlement,
        SettleOutcome::Settled {
            round_id: round.id,
            settled_count: 3,
            total_payout: 949_999,
        }
    );

    let settled = load(&env, &round).await;
    assert_eq!(settled.status, RoundStatus::Settled);
    assert_eq!(settled.winner, Some(Asset::Gold));
    assert_eq!(settled.gold_start_price.as_deref(), Some("2650"));
    assert_eq!(settled.gold_end_price.as_deref(), Some("2676.5"));
    assert_eq!(settled.platform_fee_collected, Some(50_000));
    assert_eq!(settled.payout_pool, Some(950_000));
    assert_eq!(settled.betting_locked_at, Some(round.lock_time));
    assert_eq!(settled.settlement_completed_at, Some(round.end_time));

    let paid = env.store.find_by_round_id(round.id).await.unwrap();
    let payouts: Vec<(String, BetResultStatus, i64)> = paid
        .iter()
        .map(|b| (b.user_id.clone(), b.result_status, b.payout_amount))
        .collect();
    assert_eq!(
        payouts,
        vec![
            ("alice".to_string(), BetResultStatus::Won, 158_333),
            ("bob".to_string(), BetResultStatus::Won, 791_666),
            ("carol".to_string(), BetResultStatus::Lost, 0),
        ]
    );
    assert!(paid
        .iter()
        .all(|b| b.settlement_status == SettlementStatus::Completed));

    let next = env.service.create_next_scheduled_round().await.unwrap();
    assert_eq!(next.round_number, 2);
    assert_eq!(next.start_time, round.start_time + MS_PER_MIN);
}

#[tokio::test]
async fn test_overlapping_settles_pay_once() {
    let env = setup(JAN_1);
    let mut round = Round::scheduled(RoundType::OneMin, 1, JAN_1, 20_000, 0.05, JAN_1);
    round.status = RoundStatus::Calculating;
    round.winner = Some(Asset::Btc);
    round.round_ended_at = Some(JAN_1 + MS_PER_MIN);
    env.store.insert(&round).await.unwrap();
    env.store
        .record_bet(&Bet::new(round.id, "u1", Asset::Btc, 1_000, JAN_1))
        .unwrap();
    env.store
        .record_bet(&Bet::new(round.id, "u2", Asset::Gold, 1_000, JAN_1 + 1))
        .unwrap();

    // Both calls read CALCULATING before either writes.
    let (a, b) = tokio::join!(
        env.service.settle_round(round.id),
        env.service.settle_round(round.id)
    );
    let outcomes = [a.unwrap(), b.unwrap()];
    assert!(outcomes.iter().all(|o| matches!(
        o,
        SettleOutcome::Settled { .. } | SettleOutcome::AlreadySettled { .. }
    )));
    let (settled, paid): (usize, i64) = outcomes
        .iter()
        .map(|o| match o {
            SettleOutcome::Settled {
                settled_count,
                total_payout,
                ..
            } => (*settled_count, *total_payout),
            _ => (0, 0),
        })
        .fold((0, 0), |acc, x| (acc.0 + x.0, acc.1 + x.1));
    assert_eq!(settled, 2);
    assert_eq!(paid, 1_900);
    assert_eq!(env.shared.bet_writes(), 2);

    let bets = env.store.find_by_round_id(round.id).await.unwrap();
    assert_eq!(bets[0].payout_amount, 1_900);
    assert_eq!(bets[1].payout_amount, 0);
    assert_eq!(load(&env, &round).await.status, RoundStatus::Settled);

    let again = env.service.settle_round(round.id).await.unwrap();
    assert_eq!(again, SettleOutcome::AlreadySettled { round_id: round.id });
    assert_eq!(env.shared.bet_writes(), 2);
}

#[tokio::test]
async fn test_conflicting_transitions_one_loses() {
    let env = setup(JAN_1);
    let mut round = Round::scheduled(RoundType::OneMin, 1, JAN_1, 20_000, 0.05, JAN_1);
    round.status = RoundStatus::BettingOpen;
    env.store.insert(&round).await.unwrap();

    let fsm = env.service.fsm();
    let (lock, cancel) = tokio::join!(
        fsm.transition(
            round.id,
            Transition::LockBetting(LockBetting {
                betting_locked_at: JAN_1 + 20 * MS_PER_SEC,
            }),
        ),
        fsm.transition(
            round.id,
            Transition::Cancel(CancelRound {
                cancellation_reason: Some("feed outage".into()),
                cancelled_by: Some("ops".into()),
                cancelled_at: JAN_1 + 20 * MS_PER_SEC,
            }),
        )
    );

    let (winner, loser) = match (lock, cancel) {
        (Ok(won), Err(lost)) | (Err(lost), Ok(won)) => (won, lost),
        (a, b) => panic!("exactly one transition should win: {a:?} / {b:?}"),
    };
    assert_eq!(loser.code(), CONCURRENT_TRANSITION);
    assert_eq!(load(&env, &round).await.status, winner.status);
}

#[tokio::test]
async fn test_overlapping_recovery_ticks_alert_once() {
    let now = JAN_1 + 60 * MS_PER_MIN;
    let env = setup(now);
    let mut round = Round::scheduled(RoundType::OneMin, 1, JAN_1, 20_000, 0.05, JAN_1);
    round.status = RoundStatus::Calculating;
    round.winner = Some(Asset::Gold);
    round.round_ended_at = Some(now - 35 * MS_PER_MIN);
    env.store.insert(&round).await.unwrap();

    let alerts = Arc::new(Alerts::default());
    let first = recovery_loop(&env, &alerts);
    let second = recovery_loop(&env, &alerts);

    // Both ticks see the round unescalated before either writes the marker.
    let (a, b) = tokio::join!(first.recovery_rounds(), second.recovery_rounds());
    assert_eq!((a.stuck_count, b.stuck_count), (1, 1));
    assert_eq!(a.alerted_count + b.alerted_count, 1);
    assert_eq!(a.retried_count + b.retried_count, 0);
    assert_eq!(alerts.sent(), vec![(round.id, 35 * MS_PER_MIN)]);

    let stored = load(&env, &round).await;
    assert_eq!(stored.status, RoundStatus::Calculating);
    assert_eq!(stored.settlement_failure_alert_sent_at, Some(now));
    assert_eq!(env.shared.bet_writes(), 0);
}

#[tokio::test]
async fn test_recovery_retries_then_escalates() {
    let env = setup(JAN_1 + 60 * MS_PER_MIN);
    let now = JAN_1 + 60 * MS_PER_MIN;

    let mut recent = Round::scheduled(RoundType::OneMin, 1, JAN_1, 20_000, 0.05, JAN_1);
    recent.status = RoundStatus::Calculating;
    recent.winner = Some(Asset::Gold);
    recent.round_ended_at = Some(now - 15 * MS_PER_MIN);
    env.store.insert(&recent).await.unwrap();
    env.store
        .record_bet(&Bet::new(recent.id, "u1", Asset::Gold, 500, JAN_1))
        .unwrap();

    let mut orphan = Round::scheduled(RoundType::OneMin, 2, JAN_1 + MS_PER_MIN, 20_000, 0.05, JAN_1);
    orphan.status = RoundStatus::Calculating;
    orphan.winner = Some(Asset::Btc);
    env.store.insert(&orphan).await.unwrap();

    let alerts = Arc::new(Alerts::default());
    let recovery = recovery_loop(&env, &alerts);

    let first = recovery.recovery_rounds().await;
    assert_eq!(
        first,
        RecoverySummary {
            stuck_count: 2,
            retried_count: 1,
            alerted_count: 1,
        }
    );
    assert_eq!(load(&env, &recent).await.status, RoundStatus::Settled);
    let escalated = load(&env, &orphan).await;
    assert_eq!(escalated.status, RoundStatus::Calculating);
    assert_eq!(escalated.settlement_failure_alert_sent_at, Some(now));
    assert_eq!(alerts.sent(), vec![(orphan.id, now)]);

    env.clock.advance(MS_PER_MIN);
    let second = recovery.recovery_rounds().await;
    assert_eq!(
        second,
        RecoverySummary {
            stuck_count: 1,
            retried_count: 0,
            alerted_count: 0,
        }
    );
    assert_eq!(alerts.sent().len(), 1);
}

#[tokio::test]
async fn test_boundary_transition_validates_metadata() {
    let env = setup(JAN_1);
    let round = env.service.create_next_scheduled_round().await.unwrap();
    let fsm = env.service.fsm();
    let id = round.id.to_string();

    let err = fsm
        .transition_round_status(&id, RoundStatus::BettingOpen, None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "VALIDATION_ERROR");
    assert_eq!(load(&env, &round).await.status, RoundStatus::Scheduled);

    let meta = json!({
        "goldStartPrice": "2650.10",
        "btcStartPrice": "98000.00",
        "priceSnapshotStartAt": JAN_1,
        "startPriceSource": "ops",
        "suiPoolAddress": "0xfeed",
        "bettingOpenedAt": JAN_1,
    });
    let opened = fsm
        .transition_round_status(&id, RoundStatus::BettingOpen, meta.as_object())
        .await
        .unwrap();
    assert_eq!(opened.gold_start_price.as_deref(), Some("2650.10"));
    assert_eq!(load(&env, &round).await, opened);

    let err = fsm
        .transition_round_status(&id, RoundStatus::Settled, None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "INVALID_TRANSITION");
}

#[tokio::test]
async fn test_cancel_refunds_on_sqlite() {
    let env = setup(JAN_1);
    let round = env.service.create_next_scheduled_round().await.unwrap();
    env.clock.set(round.start_time);
    env.service
        .open_round(&prices(2650.0, 98000.0, round.start_time))
        .await
        .unwrap();
    env.store
        .record_bet(&Bet::new(round.id, "u1", Asset::Gold, 700, round.start_time))
        .unwrap();

    let outcome = env
        .service
        .cancel_round(round.id, Some("price feed down".into()), Some("ops".into()))
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        RefundOutcome::Cancelled {
            refunded_count: 1,
            total_refunded: 700,
            ..
        }
    ));

    let cancelled = load(&env, &round).await;
    assert_eq!(cancelled.status, RoundStatus::Cancelled);
    assert_eq!(cancelled.cancellation_reason.as_deref(), Some("price feed down"));
    let bets = env.store.find_by_round_id(round.id).await.unwrap();
    assert_eq!(bets[0].result_status, BetResultStatus::Refunded);
    assert_eq!(bets[0].payout_amount, 700);
}
