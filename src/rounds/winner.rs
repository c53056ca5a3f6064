//! Winner Calculator
//! Mission: Decide which asset moved more over the round

use serde::{Deserialize, Serialize};

use super::types::Asset;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriceMoves {
    pub gold_start: f64,
    pub gold_end: f64,
    pub btc_start: f64,
    pub btc_end: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WinnerResult {
    pub winner: Asset,
    pub gold_change_percent: f64,
    pub btc_change_percent: f64,
}

/// `(end - start) / start * 100`
pub fn change_percent(start: f64, end: f64) -> f64 {
    (end - start) / start * 100.0
}

/// Compares raw fractional change; GOLD wins ties. Never produces a draw.
///
/// Start prices must be non-zero; callers validate snapshots before they
/// get here.
pub fn determine_winner(moves: PriceMoves) -> WinnerResult {
    let gold_fraction = (moves.gold_end - moves.gold_start) / moves.gold_start;
    let btc_fraction = (moves.btc_end - moves.btc_start) / moves.btc_start;

    let winner = if gold_fraction >= btc_fraction {
        Asset::Gold
    } else {
        Asset::Btc
    };

    WinnerResult {
        winner,
        gold_change_percent: change_percent(moves.gold_start, moves.gold_end),
        btc_change_percent: change_percent(moves.btc_start, moves.btc_end),
    }
}
