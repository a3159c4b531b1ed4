//! The interface to the Electrum chain client, plus the feerate model.
//!
//! The client itself lives outside this crate; the engine only consumes the
//! operations below. Fee estimates are refreshed on every reconnection by
//! requesting the 2 / 6 / 18 / 144-block targets and mapping them onto
//! [`FeeratesPerKw`], with fallback constants when a target is unavailable.

use async_trait::async_trait;
use bitcoin::{block::Header, OutPoint, Transaction, Txid};
use serde::{Deserialize, Serialize};

use crate::channel::ChannelId;

/// Feerates in satoshis per 1000 weight units, one per spend urgency class.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct FeeratesPerKw {
    /// Channel funding and splice transactions (6-block target).
    pub funding: u32,
    /// Mutual close transactions (18-block target).
    pub mutual_close: u32,
    /// Claiming our main output after a unilateral close (144-block target).
    pub claim_main: u32,
    /// Anything that must confirm quickly, e.g. HTLC claims (2-block target).
    pub fast: u32,
}

impl FeeratesPerKw {
    /// Fallbacks used when the chain client cannot produce an estimate for a
    /// target.
    pub const FALLBACK: Self = Self {
        funding: 2_500,
        mutual_close: 1_000,
        claim_main: 500,
        fast: 10_000,
    };

    /// Map raw per-target estimates (sat/kw, `None` when the backend had no
    /// estimate) onto the feerate classes.
    pub fn from_targets(
        blocks_2: Option<u32>,
        blocks_6: Option<u32>,
        blocks_18: Option<u32>,
        blocks_144: Option<u32>,
    ) -> Self {
        Self {
            funding: blocks_6.unwrap_or(Self::FALLBACK.funding),
            mutual_close: blocks_18.unwrap_or(Self::FALLBACK.mutual_close),
            claim_main: blocks_144.unwrap_or(Self::FALLBACK.claim_main),
            fast: blocks_2.unwrap_or(Self::FALLBACK.fast),
        }
    }
}

/// A watch registered by a channel: tell me when this tx confirms, or when
/// this outpoint is spent.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Watch {
    Confirmed {
        channel_id: ChannelId,
        txid: Txid,
        min_depth: u32,
    },
    Spent {
        channel_id: ChannelId,
        outpoint: OutPoint,
    },
}

/// A notification produced for a previously registered [`Watch`].
#[derive(Clone, Debug)]
pub enum WatchEvent {
    Confirmed {
        channel_id: ChannelId,
        txid: Txid,
        block_height: u32,
        tx: Transaction,
    },
    Spent {
        channel_id: ChannelId,
        outpoint: OutPoint,
        spending_tx: Transaction,
    },
}

impl WatchEvent {
    pub fn channel_id(&self) -> ChannelId {
        match self {
            Self::Confirmed { channel_id, .. } => *channel_id,
            Self::Spent { channel_id, .. } => *channel_id,
        }
    }
}

/// The chain operations the engine needs. Implemented outside this crate by
/// the Electrum client; implemented in-tree only by test fakes.
#[async_trait]
pub trait ChainSource: Send + Sync {
    /// Latest known `(height, header)`. Updates are delivered out-of-band to
    /// the orchestrator queue; this accessor exists for first-boot races.
    async fn tip(&self) -> anyhow::Result<(u32, Header)>;

    /// Fee estimate in sat/kw for confirmation within `blocks`, or `None`
    /// when the backend has no estimate for that target.
    async fn estimate_fee(&self, blocks: u32) -> anyhow::Result<Option<u32>>;

    /// The feerate to use for a CPFP child so that the whole ancestor
    /// package of `package_weight` reaches `target_feerate` sat/kw.
    async fn cpfp_feerate(
        &self,
        package_weight: u64,
        target_feerate: u32,
    ) -> anyhow::Result<u32>;

    /// Broadcast a transaction.
    async fn publish(&self, tx: &Transaction) -> anyhow::Result<()>;

    /// Register a confirmation / spend watch.
    async fn watch(&self, watch: Watch) -> anyhow::Result<()>;
}

/// Fetch all four fee targets and fold them into [`FeeratesPerKw`],
/// substituting fallbacks for targets the backend could not estimate.
pub async fn refresh_feerates(
    chain: &dyn ChainSource,
) -> anyhow::Result<FeeratesPerKw> {
    let blocks_2 = chain.estimate_fee(2).await?;
    let blocks_6 = chain.estimate_fee(6).await?;
    let blocks_18 = chain.estimate_fee(18).await?;
    let blocks_144 = chain.estimate_fee(144).await?;
    Ok(FeeratesPerKw::from_targets(
        blocks_2, blocks_6, blocks_18, blocks_144,
    ))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fallbacks_fill_missing_targets() {
        let feerates =
            FeeratesPerKw::from_targets(Some(12_000), None, Some(800), None);
        assert_eq!(feerates.fast, 12_000);
        assert_eq!(feerates.funding, FeeratesPerKw::FALLBACK.funding);
        assert_eq!(feerates.mutual_close, 800);
        assert_eq!(feerates.claim_main, FeeratesPerKw::FALLBACK.claim_main);
    }
}
