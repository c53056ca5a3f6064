//! Round lifecycle engine: scheduling, betting windows, price capture,
//! winner determination, payout and settlement recovery.

pub mod alert;
pub mod chain;
pub mod clock;
pub mod config;
pub mod error;
pub mod fsm;
#[cfg(any(test, feature = "test-util"))]
pub mod memory;
pub mod payout;
pub mod recovery;
pub mod repository;
pub mod service;
pub mod settlement;
pub mod sqlite_store;
pub mod types;
pub mod winner;

pub use alert::{AlertSink, LogAlertSink};
#[cfg(any(test, feature = "test-util"))]
pub use alert::RecordingAlertSink;
pub use chain::{ChainAdapter, PaperChainAdapter};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::RoundConfig;
pub use error::{RoundError, RoundResult};
pub use fsm::{can_transition, transition_from_request, RoundFsm, Transition};
#[cfg(any(test, feature = "test-util"))]
pub use memory::InMemoryRoundStore;
pub use recovery::{RecoveryLoop, RecoverySummary};
pub use repository::{BetRepository, RoundRepository};
pub use service::{
    AwaitPriceOutcome, FinalizeOutcome, LockOutcome, OpenOutcome, RefundOutcome, RoundService,
    SettleOutcome,
};
pub use sqlite_store::SqliteRoundStore;
pub use types::{Asset, Bet, PriceSnapshot, Round, RoundStatus, RoundType};
