//! On-chain bookkeeping seam.
//!
//! Only the object ids are tracked here: the pool address a round opens
//! against and the settlement object produced when it settles. Executing the
//! settlement on chain is someone else's job.

use anyhow::Result;
use uuid::Uuid;

use super::types::Round;

#[async_trait::async_trait]
pub trait ChainAdapter: Send + Sync {
    /// Pool address recorded on the round when betting opens.
    async fn pool_address(&self, round: &Round) -> Result<String>;

    /// Object id recorded on the round when settlement completes.
    async fn settlement_object_id(
        &self,
        round: &Round,
        platform_fee: i64,
        payout_pool: i64,
    ) -> Result<String>;
}

/// Placeholder ids until the round is wired to a real chain client.
#[derive(Debug, Clone, Default)]
pub struct PaperChainAdapter {
    pub pool_address: Option<String>,
}

impl PaperChainAdapter {
    pub fn from_env() -> Self {
        Self {
            pool_address: std::env::var("SUI_POOL_ADDRESS")
                .ok()
                .filter(|v| !v.trim().is_empty()),
        }
    }
}

#[async_trait::async_trait]
impl ChainAdapter for PaperChainAdapter {
    async fn pool_address(&self, round: &Round) -> Result<String> {
        Ok(self
            .pool_address
            .clone()
            .unwrap_or_else(|| format!("paper:pool:{}", round.id)))
    }

    async fn settlement_object_id(
        &self,
        round: &Round,
        _platform_fee: i64,
        _payout_pool: i64,
    ) -> Result<String> {
        Ok(format!("paper:settlement:{}:{}", round.id, Uuid::new_v4()))
    }
}
