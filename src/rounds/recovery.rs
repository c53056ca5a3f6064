//! Settlement Recovery
//! Mission: Finish rounds a crashed settlement left in CALCULATING
//!
//! Level-triggered poller. Each tick re-reads the stuck set, so a missed tick
//! loses nothing. Rounds are retried inside the window
//! `[retry_start, alert)` and escalated exactly once past it.

use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::alert::AlertSink;
use super::clock::Clock;
use super::repository::RoundRepository;
use super::service::RoundService;
use super::types::Round;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoverySummary {
    pub stuck_count: usize,
    pub retried_count: usize,
    pub alerted_count: usize,
}

enum Action {
    Skip,
    Alert,
    Retry,
}

pub struct RecoveryLoop {
    rounds: Arc<dyn RoundRepository>,
    service: Arc<RoundService>,
    alerts: Arc<dyn AlertSink>,
    clock: Arc<dyn Clock>,
    retry_start_ms: i64,
    alert_ms: i64,
}

impl RecoveryLoop {
    pub fn new(
        rounds: Arc<dyn RoundRepository>,
        service: Arc<RoundService>,
        alerts: Arc<dyn AlertSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let retry_start_ms = service.config().retry_start_threshold_ms();
        let alert_ms = service.config().alert_threshold_ms();
        Self {
            rounds,
            service,
            alerts,
            clock,
            retry_start_ms,
            alert_ms,
        }
    }

    /// One recovery tick. Never fails; problems are logged and counted.
    pub async fn recovery_rounds(&self) -> RecoverySummary {
        let now = self.clock.now_ms();
        let stuck = match self
            .rounds
            .find_stuck_calculating_rounds(now - self.retry_start_ms)
            .await
        {
            Ok(stuck) => stuck,
            Err(e) => {
                error!(error = %e, "Failed to query stuck rounds");
                return RecoverySummary::default();
            }
        };

        let mut summary = RecoverySummary {
            stuck_count: stuck.len(),
            ..Default::default()
        };

        for round in &stuck {
            // A missing end time counts as stuck forever.
            let stuck_ms = now - round.round_ended_at.unwrap_or(0);

            match self.classify(round, stuck_ms) {
                Action::Skip => {
                    debug!(round_id = %round.id, "Round already escalated, skipping");
                }
                Action::Alert => {
                    if self.escalate(round, stuck_ms, now).await {
                        summary.alerted_count += 1;
                    }
                }
                Action::Retry => {
                    match self.service.settle_round(round.id).await {
                        Ok(outcome) => {
                            info!(round_id = %round.id, stuck_ms, outcome = ?outcome, "🔁 Settlement retried");
                        }
                        Err(e) => {
                            warn!(round_id = %round.id, stuck_ms, error = %e, "Settlement retry failed");
                        }
                    }
                    // Progress comes from the next tick, so a failed attempt still counts.
                    summary.retried_count += 1;
                }
            }
        }

        if summary.stuck_count > 0 {
            info!(
                stuck = summary.stuck_count,
                retried = summary.retried_count,
                alerted = summary.alerted_count,
                "Recovery tick complete"
            );
        }
        summary
    }

    fn classify(&self, round: &Round, stuck_ms: i64) -> Action {
        if round.settlement_failure_alert_sent_at.is_some() {
            Action::Skip
        } else if stuck_ms >= self.alert_ms {
            Action::Alert
        } else {
            Action::Retry
        }
    }

    /// The marker is claimed before paging: only the worker whose write lands
    /// sends the alert, and a crash after the write cannot page twice.
    async fn escalate(&self, round: &Round, stuck_ms: i64, now: i64) -> bool {
        match self.rounds.mark_settlement_alert_sent(round.id, now).await {
            Ok(Some(claimed)) => {
                self.alerts.settlement_stuck(&claimed, stuck_ms).await;
                true
            }
            Ok(None) => {
                debug!(round_id = %round.id, "Round escalated or settled elsewhere, not alerting");
                false
            }
            Err(e) => {
                error!(round_id = %round.id, error = %e, "Failed to record settlement alert");
                false
            }
        }
    }
}
