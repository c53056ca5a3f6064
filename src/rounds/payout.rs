//! Payout Calculation
//! Mission: Split the pool without ever paying out more than it holds
//!
//! All rounding is floor; the remainder stays with the platform.

use serde::{Deserialize, Serialize};

use super::config::clamp_fee_rate;
use super::types::Asset;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PayoutInput {
    pub winner: Asset,
    pub total_pool: i64,
    pub total_gold_bets: i64,
    pub total_btc_bets: i64,
    pub platform_fee_rate: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayoutBreakdown {
    pub platform_fee: i64,
    pub payout_pool: i64,
    /// Unrounded payout per unit staked on the winning side
    pub payout_ratio: f64,
    pub winning_pool: i64,
    pub losing_pool: i64,
}

pub fn calculate_payout(input: PayoutInput) -> PayoutBreakdown {
    let fee_rate = clamp_fee_rate(input.platform_fee_rate);
    let platform_fee = (input.total_pool as f64 * fee_rate).floor() as i64;
    let payout_pool = input.total_pool - platform_fee;

    let (winning_pool, losing_pool) = match input.winner {
        Asset::Gold => (input.total_gold_bets, input.total_btc_bets),
        Asset::Btc => (input.total_btc_bets, input.total_gold_bets),
    };

    // Nobody backed the winner: every payout is zero.
    let payout_ratio = if winning_pool > 0 {
        payout_pool as f64 / winning_pool as f64
    } else {
        0.0
    };

    PayoutBreakdown {
        platform_fee,
        payout_pool,
        payout_ratio,
        winning_pool,
        losing_pool,
    }
}

pub fn calculate_individual_payout(bet_amount: i64, payout_ratio: f64) -> i64 {
    (bet_amount as f64 * payout_ratio).floor() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_scenario() {
        let breakdown = calculate_payout(PayoutInput {
            winner: Asset::Gold,
            total_pool: 1_000_000,
            total_gold_bets: 600_000,
            total_btc_bets: 400_000,
            platform_fee_rate: 0.05,
        });
        assert_eq!(breakdown.platform_fee, 50_000);
        assert_eq!(breakdown.payout_pool, 950_000);
        assert_eq!(breakdown.winning_pool, 600_000);
        assert_eq!(breakdown.losing_pool, 400_000);
        assert!((breakdown.payout_ratio - 1.5833).abs() < 1e-4);
        assert_eq!(
            calculate_individual_payout(100_000, breakdown.payout_ratio),
            158_333
        );
    }

    #[test]
    fn test_individual_payout_floors() {
        assert_eq!(calculate_individual_payout(100_000, 1.5833), 158_330);
        assert_eq!(calculate_individual_payout(1, 1.9), 1);
        assert_eq!(calculate_individual_payout(0, 1.9), 0);
    }

    #[test]
    fn test_fee_plus_pool_conserves_total() {
        let rates = [0.0, 0.01, 0.05, 0.123, 0.5, 0.999, 1.0];
        let pools = [0_i64, 1, 7, 999, 1_000_000, 123_456_789];
        for rate in rates {
            for pool in pools {
                let b = calculate_payout(PayoutInput {
                    winner: Asset::Btc,
                    total_pool: pool,
                    total_gold_bets: pool / 3,
                    total_btc_bets: pool - pool / 3,
                    platform_fee_rate: rate,
                });
                assert_eq!(b.platform_fee + b.payout_pool, pool, "rate={rate} pool={pool}");
                assert!(b.platform_fee >= 0);
            }
        }
    }

    #[test]
    fn test_empty_winning_side_pays_nothing() {
        let b = calculate_payout(PayoutInput {
            winner: Asset::Btc,
            total_pool: 500,
            total_gold_bets: 500,
            total_btc_bets: 0,
            platform_fee_rate: 0.05,
        });
        assert_eq!(b.payout_ratio, 0.0);
        assert_eq!(calculate_individual_payout(500, b.payout_ratio), 0);
    }

    #[test]
    fn test_winner_payouts_never_exceed_pool() {
        let b = calculate_payout(PayoutInput {
            winner: Asset::Gold,
            total_pool: 1_000,
            total_gold_bets: 333,
            total_btc_bets: 667,
            platform_fee_rate: 0.05,
        });
        let paid: i64 = [111, 111, 111]
            .iter()
            .map(|a| calculate_individual_payout(*a, b.payout_ratio))
            .sum();
        assert!(paid <= b.payout_pool);
    }
}
