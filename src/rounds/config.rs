//! Round Engine Configuration
//!
//! Defaults are production values; every knob can be overridden from the
//! environment (`from_env`) or a TOML file (`from_toml_file`).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::warn;

use super::types::{RoundType, MS_PER_DAY, MS_PER_HOUR, MS_PER_MIN, MS_PER_SEC};

pub const DEFAULT_PLATFORM_FEE_RATE: f64 = 0.05;
pub const DEFAULT_START_HOURS_UTC: [u32; 4] = [2, 8, 14, 20];

/// Betting window per round type, in seconds after `startTime`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BettingWindows {
    pub one_min_secs: i64,
    pub six_hour_secs: i64,
    pub one_day_secs: i64,
}

impl Default for BettingWindows {
    fn default() -> Self {
        Self {
            one_min_secs: 20,
            six_hour_secs: 10 * 60,
            one_day_secs: 60 * 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RoundConfig {
    /// Share of the pool kept by the platform, clamped to [0, 1]
    pub platform_fee_rate: f64,
    /// Round type produced by `createNextScheduledRound`
    pub default_round_type: RoundType,
    /// UTC hours at which 6HOUR rounds start (first one also anchors 1DAY)
    pub start_hours_utc: Vec<u32>,
    pub betting_windows: BettingWindows,
    /// A CALCULATING round younger than this is left alone by recovery
    pub retry_start_threshold_minutes: i64,
    /// A CALCULATING round older than this is escalated instead of retried
    pub alert_threshold_minutes: i64,
    /// Scheduler-side retry policy for storage failures
    pub cron_retry_count: u32,
    pub cron_retry_delay_ms: u64,
    pub db_path: String,
}

impl Default for RoundConfig {
    fn default() -> Self {
        Self {
            platform_fee_rate: DEFAULT_PLATFORM_FEE_RATE,
            default_round_type: RoundType::SixHour,
            start_hours_utc: DEFAULT_START_HOURS_UTC.to_vec(),
            betting_windows: BettingWindows::default(),
            retry_start_threshold_minutes: 10,
            alert_threshold_minutes: 30,
            cron_retry_count: 3,
            cron_retry_delay_ms: 1_000,
            db_path: "roundbot_rounds.db".to_string(),
        }
    }
}

impl RoundConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(v) = std::env::var("PLATFORM_FEE_RATE") {
            if let Ok(rate) = v.parse() {
                config.platform_fee_rate = rate;
            }
        }
        if let Ok(v) = std::env::var("ROUND_DEFAULT_TYPE") {
            match RoundType::from_str(&v) {
                Some(t) => config.default_round_type = t,
                None => warn!(value = %v, "Ignoring unknown ROUND_DEFAULT_TYPE"),
            }
        }
        if let Ok(v) = std::env::var("ROUND_START_HOURS") {
            let hours: Vec<u32> = v
                .split(',')
                .filter_map(|h| h.trim().parse().ok())
                .collect();
            if !hours.is_empty() {
                config.start_hours_utc = hours;
            }
        }
        if let Ok(v) = std::env::var("BETTING_WINDOW_1MIN_SECS") {
            if let Ok(secs) = v.parse() {
                config.betting_windows.one_min_secs = secs;
            }
        }
        if let Ok(v) = std::env::var("BETTING_WINDOW_6HOUR_SECS") {
            if let Ok(secs) = v.parse() {
                config.betting_windows.six_hour_secs = secs;
            }
        }
        if let Ok(v) = std::env::var("BETTING_WINDOW_1DAY_SECS") {
            if let Ok(secs) = v.parse() {
                config.betting_windows.one_day_secs = secs;
            }
        }
        if let Ok(v) = std::env::var("RECOVERY_RETRY_START_MINUTES") {
            if let Ok(m) = v.parse() {
                config.retry_start_threshold_minutes = m;
            }
        }
        if let Ok(v) = std::env::var("RECOVERY_ALERT_MINUTES") {
            if let Ok(m) = v.parse() {
                config.alert_threshold_minutes = m;
            }
        }
        if let Ok(v) = std::env::var("CRON_RETRY_COUNT") {
            if let Ok(n) = v.parse() {
                config.cron_retry_count = n;
            }
        }
        if let Ok(v) = std::env::var("CRON_RETRY_DELAY_MS") {
            if let Ok(ms) = v.parse() {
                config.cron_retry_delay_ms = ms;
            }
        }
        if let Ok(v) = std::env::var("ROUNDS_DB_PATH") {
            if !v.trim().is_empty() {
                config.db_path = v;
            }
        }

        config.sanitized()
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config at {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Invalid round config in {}", path.display()))?;
        Ok(config.sanitized())
    }

    /// Clamp out-of-range knobs back into something the engine can run with.
    pub fn sanitized(mut self) -> Self {
        self.platform_fee_rate = clamp_fee_rate(self.platform_fee_rate);

        let mut hours: Vec<u32> = self
            .start_hours_utc
            .iter()
            .copied()
            .filter(|h| *h < 24)
            .collect();
        hours.sort_unstable();
        hours.dedup();
        if hours.is_empty() {
            warn!("No valid start hours configured, using defaults");
            hours = DEFAULT_START_HOURS_UTC.to_vec();
        }
        self.start_hours_utc = hours;

        self.retry_start_threshold_minutes = self.retry_start_threshold_minutes.max(0);
        if self.alert_threshold_minutes < self.retry_start_threshold_minutes {
            warn!(
                retry_start = self.retry_start_threshold_minutes,
                alert = self.alert_threshold_minutes,
                "Alert threshold below retry threshold, raising it"
            );
            self.alert_threshold_minutes = self.retry_start_threshold_minutes;
        }
        self
    }

    pub fn fee_rate(&self) -> f64 {
        clamp_fee_rate(self.platform_fee_rate)
    }

    pub fn betting_window_ms(&self, round_type: RoundType) -> i64 {
        let secs = match round_type {
            RoundType::OneMin => self.betting_windows.one_min_secs,
            RoundType::SixHour => self.betting_windows.six_hour_secs,
            RoundType::OneDay => self.betting_windows.one_day_secs,
        };
        // The window has to close before the round ends.
        secs.max(0)
            .saturating_mul(MS_PER_SEC)
            .min(round_type.duration_ms())
    }

    pub fn retry_start_threshold_ms(&self) -> i64 {
        self.retry_start_threshold_minutes.saturating_mul(MS_PER_MIN)
    }

    pub fn alert_threshold_ms(&self) -> i64 {
        self.alert_threshold_minutes.saturating_mul(MS_PER_MIN)
    }

    /// First grid slot at or after `now_ms` for a type with no prior round.
    pub fn next_aligned_start(&self, round_type: RoundType, now_ms: i64) -> i64 {
        match round_type {
            RoundType::OneMin => ceil_to(now_ms, MS_PER_MIN),
            RoundType::SixHour => {
                let day_start = now_ms - now_ms.rem_euclid(MS_PER_DAY);
                [day_start, day_start + MS_PER_DAY]
                    .into_iter()
                    .flat_map(|day| {
                        self.start_hours_utc
                            .iter()
                            .map(move |h| day + i64::from(*h) * MS_PER_HOUR)
                    })
                    .find(|slot| *slot >= now_ms)
                    .unwrap_or(day_start + MS_PER_DAY)
            }
            RoundType::OneDay => {
                let anchor = i64::from(self.start_hours_utc.first().copied().unwrap_or(0));
                let day_start = now_ms - now_ms.rem_euclid(MS_PER_DAY);
                let today = day_start + anchor * MS_PER_HOUR;
                if today >= now_ms {
                    today
                } else {
                    today + MS_PER_DAY
                }
            }
        }
    }
}

/// NaN and infinities fall back to the default rate.
pub fn clamp_fee_rate(rate: f64) -> f64 {
    if rate.is_finite() {
        rate.clamp(0.0, 1.0)
    } else {
        DEFAULT_PLATFORM_FEE_RATE
    }
}

fn ceil_to(value: i64, step: i64) -> i64 {
    let rem = value.rem_euclid(step);
    if rem == 0 {
        value
    } else {
        value + (step - rem)
    }
}
