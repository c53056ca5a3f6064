//! Operator alerting for rounds that could not settle on their own.

use tracing::error;

use super::types::{MS_PER_MIN, Round};

#[async_trait::async_trait]
pub trait AlertSink: Send + Sync {
    async fn settlement_stuck(&self, round: &Round, stuck_ms: i64);
}

/// Emits the alert as an `error!` event for log-based paging.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogAlertSink;

#[async_trait::async_trait]
impl AlertSink for LogAlertSink {
    async fn settlement_stuck(&self, round: &Round, stuck_ms: i64) {
        error!(
            round_id = %round.id,
            round_number = round.round_number,
            round_type = %round.round_type,
            stuck_minutes = stuck_ms / MS_PER_MIN,
            total_pool = round.total_pool,
            total_bets = round.total_bets_count,
            "🚨 Settlement stuck past alert threshold, manual intervention required"
        );
    }
}

#[cfg(any(test, feature = "test-util"))]
pub use recording::RecordingAlertSink;

#[cfg(any(test, feature = "test-util"))]
mod recording {
    use parking_lot::Mutex;
    use uuid::Uuid;

    use super::AlertSink;
    use crate::rounds::types::Round;

    /// Keeps every alert in memory.
    #[derive(Debug, Default)]
    pub struct RecordingAlertSink {
        alerts: Mutex<Vec<(Uuid, i64)>>,
    }

    impl RecordingAlertSink {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn alerts(&self) -> Vec<(Uuid, i64)> {
            self.alerts.lock().clone()
        }
    }

    #[async_trait::async_trait]
    impl AlertSink for RecordingAlertSink {
        async fn settlement_stuck(&self, round: &Round, stuck_ms: i64) {
            self.alerts.lock().push((round.id, stuck_ms));
        }
    }
}
