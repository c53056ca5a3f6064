//! RoundBot Backend Library
//!
//! Gold vs BTC prediction rounds. Exposes the round engine for the
//! `roundbot` binary and integration tests.

pub mod rounds;

pub use rounds::{RoundConfig, RoundError, RoundResult, RoundService};
