//! SQLite-backed Round & Bet Storage
//!
//! - WAL mode so readers never block the settlement writer
//! - Round status changes are compare-and-swap on `status`
//! - Bet settlement writes are compare-and-swap on `settlement_status`
//! - Pool aggregates are bumped in SQL (`x = x + ?`), never read-modify-write

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, Connection, OpenFlags, OptionalExtension, Row};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use super::repository::{BetPatch, BetRepository, RoundPatch, RoundRepository};
use super::types::{
    Asset, Bet, BetResultStatus, Round, RoundStatus, RoundType, SettlementStatus,
};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA temp_store = MEMORY;

CREATE TABLE IF NOT EXISTS rounds (
    id TEXT PRIMARY KEY,
    round_number INTEGER NOT NULL,
    round_type TEXT NOT NULL,
    status TEXT NOT NULL,
    start_time INTEGER NOT NULL,
    lock_time INTEGER NOT NULL,
    end_time INTEGER NOT NULL,

    gold_start_price TEXT,
    btc_start_price TEXT,
    price_snapshot_start_at INTEGER,
    start_price_source TEXT,
    start_price_is_fallback INTEGER NOT NULL DEFAULT 0,
    start_price_fallback_reason TEXT,
    gold_end_price TEXT,
    btc_end_price TEXT,
    price_snapshot_end_at INTEGER,
    end_price_source TEXT,
    end_price_is_fallback INTEGER NOT NULL DEFAULT 0,
    end_price_fallback_reason TEXT,

    total_pool INTEGER NOT NULL DEFAULT 0,
    total_gold_bets INTEGER NOT NULL DEFAULT 0,
    total_btc_bets INTEGER NOT NULL DEFAULT 0,
    total_bets_count INTEGER NOT NULL DEFAULT 0,

    gold_change_percent REAL,
    btc_change_percent REAL,
    winner TEXT,
    platform_fee_rate REAL NOT NULL,
    platform_fee_collected INTEGER,
    payout_pool INTEGER,
    sui_pool_address TEXT,
    sui_settlement_object_id TEXT,
    cancellation_reason TEXT,
    cancelled_by TEXT,
    void_reason TEXT,

    betting_opened_at INTEGER,
    betting_locked_at INTEGER,
    round_ended_at INTEGER,
    settlement_completed_at INTEGER,
    settlement_failure_alert_sent_at INTEGER,
    cancelled_at INTEGER,

    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,

    UNIQUE (round_type, round_number),
    UNIQUE (round_type, start_time)
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_rounds_status_start
    ON rounds(status, start_time DESC);

CREATE INDEX IF NOT EXISTS idx_rounds_calculating_ended
    ON rounds(round_ended_at) WHERE status = 'CALCULATING';

CREATE TABLE IF NOT EXISTS bets (
    id TEXT PRIMARY KEY,
    round_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    prediction TEXT NOT NULL,
    amount INTEGER NOT NULL CHECK (amount > 0),
    result_status TEXT NOT NULL,
    settlement_status TEXT NOT NULL,
    payout_amount INTEGER NOT NULL DEFAULT 0,
    settled_at INTEGER,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    FOREIGN KEY (round_id) REFERENCES rounds(id)
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_bets_round
    ON bets(round_id, created_at ASC);
"#;

const ROUND_COLUMNS: &str = "id, round_number, round_type, status, start_time, lock_time, end_time, \
     gold_start_price, btc_start_price, price_snapshot_start_at, start_price_source, \
     start_price_is_fallback, start_price_fallback_reason, \
     gold_end_price, btc_end_price, price_snapshot_end_at, end_price_source, \
     end_price_is_fallback, end_price_fallback_reason, \
     total_pool, total_gold_bets, total_btc_bets, total_bets_count, \
     gold_change_percent, btc_change_percent, winner, platform_fee_rate, platform_fee_collected, \
     payout_pool, sui_pool_address, sui_settlement_object_id, cancellation_reason, cancelled_by, \
     void_reason, betting_opened_at, betting_locked_at, round_ended_at, settlement_completed_at, \
     settlement_failure_alert_sent_at, cancelled_at, created_at, updated_at";

const BET_COLUMNS: &str = "id, round_id, user_id, prediction, amount, result_status, \
     settlement_status, payout_amount, settled_at, created_at, updated_at";

/// Round and bet storage on a single SQLite file.
pub struct SqliteRoundStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRoundStore {
    pub fn new(db_path: &str) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        let conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("Failed to open rounds database at {}", db_path))?;

        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize rounds schema")?;

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap_or_default();
        if journal_mode.to_lowercase() != "wal" {
            warn!("WAL mode not active, journal_mode = {}", journal_mode);
        }

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM rounds", [], |row| row.get(0))
            .unwrap_or(0);
        info!(db_path, rounds = count, "📊 Rounds database initialized");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Insert a bet and bump the round's pool aggregates atomically.
    pub fn record_bet(&self, bet: &Bet) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let (gold_delta, btc_delta) = match bet.prediction {
            Asset::Gold => (bet.amount, 0),
            Asset::Btc => (0, bet.amount),
        };
        let changed = tx.execute(
            "UPDATE rounds SET
                total_pool = total_pool + ?1,
                total_gold_bets = total_gold_bets + ?2,
                total_btc_bets = total_btc_bets + ?3,
                total_bets_count = total_bets_count + 1,
                updated_at = ?4
             WHERE id = ?5",
            params![
                bet.amount,
                gold_delta,
                btc_delta,
                Utc::now().timestamp_millis(),
                bet.round_id.to_string()
            ],
        )?;
        if changed == 0 {
            return Err(anyhow!("round {} not found", bet.round_id));
        }

        tx.execute(
            &format!(
                "INSERT INTO bets ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                BET_COLUMNS
            ),
            params![
                bet.id.to_string(),
                bet.round_id.to_string(),
                &bet.user_id,
                bet.prediction.as_str(),
                bet.amount,
                bet.result_status.as_str(),
                bet.settlement_status.as_str(),
                bet.payout_amount,
                bet.settled_at,
                bet.created_at,
                bet.updated_at,
            ],
        )
        .context("Failed to insert bet")?;

        tx.commit()?;
        Ok(())
    }

    /// Most recent rounds first, for operator listings.
    pub fn list_recent_rounds(&self, limit: usize) -> Result<Vec<Round>> {
        let limit = limit.clamp(1, 1000) as i64;
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM rounds ORDER BY start_time DESC, round_number DESC LIMIT ?1",
            ROUND_COLUMNS
        ))?;
        let rounds = stmt
            .query_map(params![limit], round_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rounds)
    }

    fn query_round(&self, where_sql: &str, values: Vec<Value>) -> Result<Option<Round>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare_cached(&format!("SELECT {} FROM rounds {}", ROUND_COLUMNS, where_sql))?;
        let round = stmt
            .query_row(params_from_iter(values), round_from_row)
            .optional()?;
        Ok(round)
    }

    fn apply_round_patch(
        &self,
        id: Uuid,
        expected: Option<RoundStatus>,
        patch: &RoundPatch,
    ) -> Result<Option<Round>> {
        let mut columns = patch_columns(patch);
        columns.push((
            "updated_at",
            Value::Integer(patch.updated_at.unwrap_or_else(|| Utc::now().timestamp_millis())),
        ));

        let set_sql = columns
            .iter()
            .enumerate()
            .map(|(i, (name, _))| format!("{} = ?{}", name, i + 1))
            .collect::<Vec<_>>()
            .join(", ");
        let mut values: Vec<Value> = columns.into_iter().map(|(_, v)| v).collect();
        values.push(Value::Text(id.to_string()));
        let mut sql = format!("UPDATE rounds SET {} WHERE id = ?{}", set_sql, values.len());
        if let Some(status) = expected {
            values.push(Value::Text(status.as_str().to_string()));
            sql.push_str(&format!(" AND status = ?{}", values.len()));
        }

        let changed = {
            let conn = self.conn.lock();
            conn.execute(&sql, params_from_iter(values))?
        };
        if changed == 0 {
            return Ok(None);
        }
        self.query_round("WHERE id = ?1", vec![Value::Text(id.to_string())])
    }
}

fn patch_columns(patch: &RoundPatch) -> Vec<(&'static str, Value)> {
    let mut cols: Vec<(&'static str, Value)> = Vec::new();

    macro_rules! text {
        ($($field:ident),* $(,)?) => {
            $(if let Some(v) = &patch.$field { cols.push((stringify!($field), Value::Text(v.clone()))); })*
        };
    }
    macro_rules! int {
        ($($field:ident),* $(,)?) => {
            $(if let Some(v) = patch.$field { cols.push((stringify!($field), Value::Integer(v))); })*
        };
    }
    macro_rules! real {
        ($($field:ident),* $(,)?) => {
            $(if let Some(v) = patch.$field { cols.push((stringify!($field), Value::Real(v))); })*
        };
    }
    macro_rules! flag {
        ($($field:ident),* $(,)?) => {
            $(if let Some(v) = patch.$field { cols.push((stringify!($field), Value::Integer(i64::from(v)))); })*
        };
    }

    if let Some(status) = patch.status {
        cols.push(("status", Value::Text(status.as_str().to_string())));
    }
    if let Some(winner) = patch.winner {
        cols.push(("winner", Value::Text(winner.as_str().to_string())));
    }
    text!(
        gold_start_price,
        btc_start_price,
        start_price_source,
        start_price_fallback_reason,
        gold_end_price,
        btc_end_price,
        end_price_source,
        end_price_fallback_reason,
        sui_pool_address,
        sui_settlement_object_id,
        cancellation_reason,
        cancelled_by,
        void_reason,
    );
    int!(
        price_snapshot_start_at,
        price_snapshot_end_at,
        platform_fee_collected,
        payout_pool,
        betting_opened_at,
        betting_locked_at,
        round_ended_at,
        settlement_completed_at,
        settlement_failure_alert_sent_at,
        cancelled_at,
    );
    real!(gold_change_percent, btc_change_percent);
    flag!(start_price_is_fallback, end_price_is_fallback);

    cols
}

fn conversion_error(column: &str, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        Type::Text,
        format!("invalid {} value {:?}", column, value).into(),
    )
}

fn uuid_col(row: &Row<'_>, column: &str) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(column)?;
    Uuid::parse_str(&raw).map_err(|_| conversion_error(column, &raw))
}

fn enum_col<T>(row: &Row<'_>, column: &str, parse: fn(&str) -> Option<T>) -> rusqlite::Result<T> {
    let raw: String = row.get(column)?;
    parse(&raw).ok_or_else(|| conversion_error(column, &raw))
}

fn round_from_row(row: &Row<'_>) -> rusqlite::Result<Round> {
    let winner: Option<String> = row.get("winner")?;
    let winner = match winner {
        Some(w) => Some(Asset::from_str(&w).ok_or_else(|| conversion_error("winner", &w))?),
        None => None,
    };

    Ok(Round {
        id: uuid_col(row, "id")?,
        round_number: row.get("round_number")?,
        round_type: enum_col(row, "round_type", RoundType::from_str)?,
        status: enum_col(row, "status", RoundStatus::from_str)?,
        start_time: row.get("start_time")?,
        lock_time: row.get("lock_time")?,
        end_time: row.get("end_time")?,
        gold_start_price: row.get("gold_start_price")?,
        btc_start_price: row.get("btc_start_price")?,
        price_snapshot_start_at: row.get("price_snapshot_start_at")?,
        start_price_source: row.get("start_price_source")?,
        start_price_is_fallback: row.get("start_price_is_fallback")?,
        start_price_fallback_reason: row.get("start_price_fallback_reason")?,
        gold_end_price: row.get("gold_end_price")?,
        btc_end_price: row.get("btc_end_price")?,
        price_snapshot_end_at: row.get("price_snapshot_end_at")?,
        end_price_source: row.get("end_price_source")?,
        end_price_is_fallback: row.get("end_price_is_fallback")?,
        end_price_fallback_reason: row.get("end_price_fallback_reason")?,
        total_pool: row.get("total_pool")?,
        total_gold_bets: row.get("total_gold_bets")?,
        total_btc_bets: row.get("total_btc_bets")?,
        total_bets_count: row.get("total_bets_count")?,
        gold_change_percent: row.get("gold_change_percent")?,
        btc_change_percent: row.get("btc_change_percent")?,
        winner,
        platform_fee_rate: row.get("platform_fee_rate")?,
        platform_fee_collected: row.get("platform_fee_collected")?,
        payout_pool: row.get("payout_pool")?,
        sui_pool_address: row.get("sui_pool_address")?,
        sui_settlement_object_id: row.get("sui_settlement_object_id")?,
        cancellation_reason: row.get("cancellation_reason")?,
        cancelled_by: row.get("cancelled_by")?,
        void_reason: row.get("void_reason")?,
        betting_opened_at: row.get("betting_opened_at")?,
        betting_locked_at: row.get("betting_locked_at")?,
        round_ended_at: row.get("round_ended_at")?,
        settlement_completed_at: row.get("settlement_completed_at")?,
        settlement_failure_alert_sent_at: row.get("settlement_failure_alert_sent_at")?,
        cancelled_at: row.get("cancelled_at")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn bet_from_row(row: &Row<'_>) -> rusqlite::Result<Bet> {
    Ok(Bet {
        id: uuid_col(row, "id")?,
        round_id: uuid_col(row, "round_id")?,
        user_id: row.get("user_id")?,
        prediction: enum_col(row, "prediction", Asset::from_str)?,
        amount: row.get("amount")?,
        result_status: enum_col(row, "result_status", BetResultStatus::from_str)?,
        settlement_status: enum_col(row, "settlement_status", SettlementStatus::from_str)?,
        payout_amount: row.get("payout_amount")?,
        settled_at: row.get("settled_at")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

#[async_trait::async_trait]
impl RoundRepository for SqliteRoundStore {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Round>> {
        self.query_round("WHERE id = ?1", vec![Value::Text(id.to_string())])
    }

    async fn update_by_id(&self, id: Uuid, patch: &RoundPatch) -> Result<Option<Round>> {
        self.apply_round_patch(id, None, patch)
    }

    async fn update_if_status(
        &self,
        id: Uuid,
        expected: RoundStatus,
        patch: &RoundPatch,
    ) -> Result<Option<Round>> {
        self.apply_round_patch(id, Some(expected), patch)
    }

    async fn mark_settlement_alert_sent(&self, id: Uuid, at: i64) -> Result<Option<Round>> {
        let changed = {
            let conn = self.conn.lock();
            conn.execute(
                "UPDATE rounds SET settlement_failure_alert_sent_at = ?1, updated_at = ?1
                 WHERE id = ?2 AND status = 'CALCULATING'
                   AND settlement_failure_alert_sent_at IS NULL",
                params![at, id.to_string()],
            )?
        };
        if changed == 0 {
            return Ok(None);
        }
        self.query_round("WHERE id = ?1", vec![Value::Text(id.to_string())])
    }

    async fn find_last_round(&self, round_type: RoundType) -> Result<Option<Round>> {
        self.query_round(
            "WHERE round_type = ?1 ORDER BY round_number DESC LIMIT 1",
            vec![Value::Text(round_type.as_str().to_string())],
        )
    }

    async fn find_by_start_time(
        &self,
        round_type: RoundType,
        start_time: i64,
    ) -> Result<Option<Round>> {
        self.query_round(
            "WHERE round_type = ?1 AND start_time = ?2 LIMIT 1",
            vec![
                Value::Text(round_type.as_str().to_string()),
                Value::Integer(start_time),
            ],
        )
    }

    async fn find_latest_by_status(&self, status: RoundStatus) -> Result<Option<Round>> {
        self.query_round(
            "WHERE status = ?1 ORDER BY start_time DESC, round_number DESC LIMIT 1",
            vec![Value::Text(status.as_str().to_string())],
        )
    }

    async fn insert(&self, round: &Round) -> Result<Round> {
        let placeholders = (1..=42)
            .map(|i| format!("?{}", i))
            .collect::<Vec<_>>()
            .join(", ");
        let values: Vec<Value> = vec![
            Value::Text(round.id.to_string()),
            Value::Integer(round.round_number),
            Value::Text(round.round_type.as_str().to_string()),
            Value::Text(round.status.as_str().to_string()),
            Value::Integer(round.start_time),
            Value::Integer(round.lock_time),
            Value::Integer(round.end_time),
            round.gold_start_price.clone().into(),
            round.btc_start_price.clone().into(),
            round.price_snapshot_start_at.into(),
            round.start_price_source.clone().into(),
            Value::Integer(i64::from(round.start_price_is_fallback)),
            round.start_price_fallback_reason.clone().into(),
            round.gold_end_price.clone().into(),
            round.btc_end_price.clone().into(),
            round.price_snapshot_end_at.into(),
            round.end_price_source.clone().into(),
            Value::Integer(i64::from(round.end_price_is_fallback)),
            round.end_price_fallback_reason.clone().into(),
            Value::Integer(round.total_pool),
            Value::Integer(round.total_gold_bets),
            Value::Integer(round.total_btc_bets),
            Value::Integer(round.total_bets_count),
            round.gold_change_percent.into(),
            round.btc_change_percent.into(),
            round.winner.map(|w| w.as_str().to_string()).into(),
            Value::Real(round.platform_fee_rate),
            round.platform_fee_collected.into(),
            round.payout_pool.into(),
            round.sui_pool_address.clone().into(),
            round.sui_settlement_object_id.clone().into(),
            round.cancellation_reason.clone().into(),
            round.cancelled_by.clone().into(),
            round.void_reason.clone().into(),
            round.betting_opened_at.into(),
            round.betting_locked_at.into(),
            round.round_ended_at.into(),
            round.settlement_completed_at.into(),
            round.settlement_failure_alert_sent_at.into(),
            round.cancelled_at.into(),
            Value::Integer(round.created_at),
            Value::Integer(round.updated_at),
        ];

        {
            let conn = self.conn.lock();
            conn.execute(
                &format!("INSERT INTO rounds ({}) VALUES ({})", ROUND_COLUMNS, placeholders),
                params_from_iter(values),
            )
            .with_context(|| format!("Failed to insert round {}", round.id))?;
        }
        Ok(round.clone())
    }

    async fn find_stuck_calculating_rounds(&self, threshold_ms: i64) -> Result<Vec<Round>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM rounds
             WHERE status = 'CALCULATING' AND (round_ended_at IS NULL OR round_ended_at <= ?1)
             ORDER BY round_ended_at ASC",
            ROUND_COLUMNS
        ))?;
        let rounds = stmt
            .query_map(params![threshold_ms], round_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rounds)
    }
}

#[async_trait::async_trait]
impl BetRepository for SqliteRoundStore {
    async fn find_by_round_id(&self, round_id: Uuid) -> Result<Vec<Bet>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM bets WHERE round_id = ?1 ORDER BY created_at ASC, id ASC",
            BET_COLUMNS
        ))?;
        let bets = stmt
            .query_map(params![round_id.to_string()], bet_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(bets)
    }

    async fn update_by_id(&self, id: Uuid, patch: &BetPatch) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE bets SET
                result_status = ?1,
                settlement_status = ?2,
                payout_amount = ?3,
                settled_at = ?4,
                updated_at = ?5
             WHERE id = ?6 AND settlement_status != 'COMPLETED'",
            params![
                patch.result_status.as_str(),
                patch.settlement_status.as_str(),
                patch.payout_amount,
                patch.settled_at,
                Utc::now().timestamp_millis(),
                id.to_string(),
            ],
        )?;
        if changed > 0 {
            return Ok(true);
        }

        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM bets WHERE id = ?1)",
            params![id.to_string()],
            |row| row.get(0),
        )?;
        if exists {
            Ok(false)
        } else {
            Err(anyhow!("bet {} not found", id))
        }
    }
}
