//! RoundBot - Gold vs BTC prediction rounds
//! Mission: Drive every round from schedule to payout, one cron tick at a time
//!
//! Each subcommand is a single scheduler tick: it runs to completion, prints
//! its outcome as JSON and exits. There is no internal timer loop.

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use dotenv::dotenv;
use serde_json::{Map, Value};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use roundbot_backend::rounds::{
    fsm::parse_round_id, Asset, Bet, Clock, LogAlertSink, PaperChainAdapter, PriceSnapshot,
    RecoveryLoop, RoundConfig, RoundError, RoundRepository, RoundResult, RoundService,
    RoundStatus, RoundType, SqliteRoundStore, SystemClock,
};

#[derive(Parser, Debug)]
#[command(name = "roundbot")]
#[command(about = "Gold vs BTC prediction round lifecycle")]
struct Cli {
    /// SQLite database path
    #[arg(long, env = "ROUNDS_DB_PATH")]
    db_path: Option<String>,

    /// TOML config file; environment variables are used when absent
    #[arg(long, env = "ROUNDBOT_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct PriceArgs {
    #[arg(long)]
    gold: f64,
    #[arg(long)]
    btc: f64,
    #[arg(long, default_value = "manual")]
    source: String,
    /// Snapshot time in epoch ms (defaults to now)
    #[arg(long)]
    timestamp: Option<i64>,
    /// Set when the quote came from a fallback feed
    #[arg(long)]
    fallback_reason: Option<String>,
}

impl PriceArgs {
    fn snapshot(&self, now: i64) -> PriceSnapshot {
        PriceSnapshot {
            gold: self.gold,
            btc: self.btc,
            timestamp: self.timestamp.unwrap_or(now),
            source: self.source.clone(),
            fallback_reason: self.fallback_reason.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Schedule the next round
    Create {
        /// 1MIN, 6HOUR or 1DAY (defaults to ROUND_DEFAULT_TYPE)
        #[arg(long)]
        round_type: Option<String>,
    },

    /// Open betting on the latest scheduled round
    Open(PriceArgs),

    /// Close betting on the latest open round
    Lock,

    /// Park a locked round past its end time until end prices arrive
    AwaitPrice,

    /// Record end prices, pick the winner and settle
    Finalize(PriceArgs),

    /// Settle a CALCULATING round
    Settle { round_id: String },

    /// Cancel a round and refund its bets
    Cancel {
        round_id: String,
        #[arg(long)]
        reason: Option<String>,
        #[arg(long, default_value = "OPERATOR")]
        by: String,
    },

    /// Void a CALCULATING round and refund its bets
    Void {
        round_id: String,
        #[arg(long)]
        reason: Option<String>,
    },

    /// Retry or escalate rounds stuck in CALCULATING
    Recover,

    /// Raw status transition with JSON metadata
    Transition {
        round_id: String,
        status: String,
        /// JSON object with the fields the edge requires
        #[arg(long)]
        metadata: Option<String>,
    },

    /// Record a bet on an open round
    PlaceBet {
        round_id: String,
        #[arg(long)]
        user: String,
        /// GOLD or BTC
        #[arg(long)]
        prediction: String,
        #[arg(long)]
        amount: i64,
    },

    /// Show the most recent rounds
    List {
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    init_tracing();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => RoundConfig::from_toml_file(path)?,
        None => RoundConfig::from_env(),
    };
    if let Some(db_path) = &cli.db_path {
        config.db_path = db_path.clone();
    }
    let config = config.sanitized();

    let store = Arc::new(SqliteRoundStore::new(&config.db_path)?);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let service = Arc::new(RoundService::new(
        store.clone(),
        store.clone(),
        clock.clone(),
        Arc::new(PaperChainAdapter::from_env()),
        config.clone(),
    ));

    let retry = RetryPolicy {
        attempts: config.cron_retry_count.max(1),
        delay: Duration::from_millis(config.cron_retry_delay_ms),
    };
    let now = clock.now_ms();

    let output: RoundResult<Value> = match cli.command {
        Command::Create { round_type } => {
            let round_type = match round_type {
                Some(raw) => RoundType::from_str(&raw)
                    .ok_or_else(|| RoundError::validation(format!("unknown round type {raw}")))?,
                None => config.default_round_type,
            };
            retry
                .run("create", || service.create_next_round(round_type))
                .await
                .and_then(to_json)
        }
        Command::Open(prices) => {
            let snapshot = prices.snapshot(now);
            retry
                .run("open", || service.open_round(&snapshot))
                .await
                .and_then(to_json)
        }
        Command::Lock => retry
            .run("lock", || service.lock_round())
            .await
            .and_then(to_json),
        Command::AwaitPrice => retry
            .run("await-price", || service.await_end_price())
            .await
            .and_then(to_json),
        Command::Finalize(prices) => {
            let snapshot = prices.snapshot(now);
            retry
                .run("finalize", || service.finalize_round(&snapshot))
                .await
                .and_then(to_json)
        }
        Command::Settle { round_id } => {
            let id = parse_round_id(&round_id)?;
            retry
                .run("settle", || service.settle_round(id))
                .await
                .and_then(to_json)
        }
        Command::Cancel {
            round_id,
            reason,
            by,
        } => {
            let id = parse_round_id(&round_id)?;
            retry
                .run("cancel", || {
                    service.cancel_round(id, reason.clone(), Some(by.clone()))
                })
                .await
                .and_then(to_json)
        }
        Command::Void { round_id, reason } => {
            let id = parse_round_id(&round_id)?;
            retry
                .run("void", || service.void_round(id, reason.clone()))
                .await
                .and_then(to_json)
        }
        Command::Recover => {
            let recovery =
                RecoveryLoop::new(store.clone(), service.clone(), Arc::new(LogAlertSink), clock);
            to_json(recovery.recovery_rounds().await)
        }
        Command::Transition {
            round_id,
            status,
            metadata,
        } => {
            let status = RoundStatus::from_str(&status)
                .ok_or_else(|| RoundError::validation(format!("unknown round status {status}")))?;
            let metadata = parse_metadata(metadata.as_deref())?;
            retry
                .run("transition", || {
                    service
                        .fsm()
                        .transition_round_status(&round_id, status, metadata.as_ref())
                })
                .await
                .and_then(to_json)
        }
        Command::PlaceBet {
            round_id,
            user,
            prediction,
            amount,
        } => place_bet(&store, &round_id, &user, &prediction, amount, now).await,
        Command::List { limit } => store
            .list_recent_rounds(limit)
            .map_err(RoundError::from)
            .and_then(to_json),
    };

    match output {
        Ok(value) => {
            println!("{}", serde_json::to_string_pretty(&value)?);
            Ok(())
        }
        Err(e) => {
            error!(code = e.code(), error = %e, "❌ Command failed");
            let body = serde_json::json!({
                "status": "error",
                "code": e.code(),
                "message": e.to_string(),
            });
            println!("{}", serde_json::to_string_pretty(&body)?);
            Err(e.into())
        }
    }
}

/// Scheduler-side retry for storage failures. Validation and business-rule
/// errors are returned on the first attempt.
struct RetryPolicy {
    attempts: u32,
    delay: Duration,
}

impl RetryPolicy {
    async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> RoundResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = RoundResult<T>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.attempts => {
                    warn!(
                        command = label,
                        attempt,
                        max_attempts = self.attempts,
                        error = %e,
                        "Storage error, retrying"
                    );
                    tokio::time::sleep(self.delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn to_json<T: serde::Serialize>(value: T) -> RoundResult<Value> {
    serde_json::to_value(value).map_err(|e| RoundError::Persistence(e.into()))
}

fn parse_metadata(raw: Option<&str>) -> RoundResult<Option<Map<String, Value>>> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => Ok(Some(map)),
        Ok(Value::Null) => Ok(None),
        Ok(_) => Err(RoundError::validation("metadata must be a JSON object")),
        Err(e) => Err(RoundError::validation(format!("metadata is not valid JSON: {e}"))),
    }
}

async fn place_bet(
    store: &SqliteRoundStore,
    round_id: &str,
    user: &str,
    prediction: &str,
    amount: i64,
    now: i64,
) -> RoundResult<Value> {
    let id = parse_round_id(round_id)?;
    let prediction = Asset::from_str(prediction)
        .ok_or_else(|| RoundError::validation(format!("prediction must be GOLD or BTC, got {prediction}")))?;
    if amount <= 0 {
        return Err(RoundError::validation("amount must be positive"));
    }

    let round = store
        .find_by_id(id)
        .await?
        .ok_or_else(|| RoundError::round_not_found(id))?;
    if round.status != RoundStatus::BettingOpen {
        return Err(RoundError::validation(format!(
            "round {} is {}, bets need BETTING_OPEN",
            id, round.status
        )));
    }
    if now >= round.lock_time {
        return Err(RoundError::validation(format!(
            "round {} stopped taking bets at {}",
            id, round.lock_time
        )));
    }

    let bet = Bet::new(id, user, prediction, amount, now);
    store.record_bet(&bet)?;
    info!(round_id = %id, bet_id = %bet.id, user, prediction = %prediction, amount, "🎯 Bet placed");
    to_json(bet)
}

/// Initialize tracing with env-filter override
fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "roundbot_backend=info,roundbot=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn load_env() {
    // 1) Standard dotenv search (cwd + parents)
    let _ = dotenv();

    // 2) Crate-root .env, for runs with --manifest-path from elsewhere
    let manifest_dir = Path::new(env!("CARGO_MANIFEST_DIR"));
    let candidate = manifest_dir.join(".env");
    if candidate.exists() {
        let _ = dotenv::from_path(&candidate);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn test_metadata_must_be_object() {
        assert!(parse_metadata(None).unwrap().is_none());
        assert!(parse_metadata(Some("null")).unwrap().is_none());
        let map = parse_metadata(Some(r#"{"bettingLockedAt": 5}"#)).unwrap().unwrap();
        assert_eq!(map["bettingLockedAt"], 5);
        assert!(parse_metadata(Some("[1,2]")).is_err());
        assert!(parse_metadata(Some("{oops")).is_err());
    }

    #[tokio::test]
    async fn test_retry_stops_on_business_errors() {
        let policy = RetryPolicy {
            attempts: 3,
            delay: Duration::from_millis(1),
        };
        let mut calls = 0;
        let result: RoundResult<()> = policy
            .run("test", || {
                calls += 1;
                async { Err(RoundError::validation("bad")) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls, 1);

        let mut calls = 0;
        let result: RoundResult<u32> = policy
            .run("test", || {
                calls += 1;
                let n = calls;
                async move {
                    if n < 3 {
                        Err(RoundError::Persistence(anyhow!("locked")))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 3);
    }

    #[test]
    fn test_cli_parses_subcommands() {
        let cli = Cli::try_parse_from([
            "roundbot",
            "--db-path",
            "x.db",
            "place-bet",
            "00000000-0000-0000-0000-000000000000",
            "--user",
            "u1",
            "--prediction",
            "gold",
            "--amount",
            "10",
        ])
        .unwrap();
        assert!(matches!(cli.command, Command::PlaceBet { amount: 10, .. }));

        let cli = Cli::try_parse_from(["roundbot", "open", "--gold", "2650", "--btc", "98000"]).unwrap();
        let Command::Open(prices) = cli.command else {
            panic!("wrong subcommand");
        };
        assert_eq!(prices.snapshot(7).timestamp, 7);
    }
}
