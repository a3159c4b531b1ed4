//! The swap-in manager: promotes confirmed on-chain UTXOs into Lightning
//! liquidity by requesting a channel open / splice from the peer, while
//! guaranteeing no UTXO is committed to two concurrent funding attempts.

use std::collections::HashSet;

use bitcoin::{OutPoint, Txid};
use common::rng::Crng;
use tracing::{debug, info};

use crate::{
    channel::WalletInput,
    wallet::WalletState,
};

/// Confirmation policy for swapping a UTXO in.
#[derive(Copy, Clone, Debug)]
pub struct SwapInParams {
    /// Minimum confirmations before a UTXO is trusted enough to fund a
    /// channel.
    pub min_confirmations: u32,
    /// Maximum confirmations: beyond this, the UTXO is considered too old
    /// to keep waiting on the peer.
    pub max_confirmations: u32,
    /// The relative timelock after which the UTXO becomes refundable to
    /// the user without peer cooperation. UTXOs close to this age must
    /// not be offered.
    pub refund_delay: u32,
}

/// A request for the peer to open (or splice into) a channel with the
/// given wallet inputs.
#[derive(Clone, Debug)]
pub struct RequestChannelOpen {
    pub request_id: [u8; 32],
    pub wallet_inputs: Vec<WalletInput>,
}

impl RequestChannelOpen {
    pub fn outpoints(&self) -> Vec<OutPoint> {
        self.wallet_inputs
            .iter()
            .map(|input| input.outpoint)
            .collect()
    }
}

/// Tracks which UTXOs are already committed to an in-flight funding
/// attempt. The soft reservation set covers our own requests; the
/// channel-derived set (computed by the caller from all pending
/// commitments) covers everything a funding tx already references.
#[derive(Debug, Default)]
pub struct SwapInManager {
    reserved_utxos: HashSet<OutPoint>,
}

impl SwapInManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reserved(&self) -> &HashSet<OutPoint> {
        &self.reserved_utxos
    }

    /// Decide whether to swap in. At most one request is produced per
    /// call; its inputs are reserved until unlocked or spent.
    pub fn try_swap_in(
        &mut self,
        current_block_height: u32,
        wallet: &WalletState,
        params: &SwapInParams,
        trusted_txs: &HashSet<Txid>,
        channel_utxos: &HashSet<OutPoint>,
        rng: &mut impl Crng,
    ) -> Option<RequestChannelOpen> {
        if !wallet.consistent() {
            debug!("wallet snapshot inconsistent, skipping swap-in");
            return None;
        }

        let mut selected = Vec::new();
        for utxo in wallet.utxos() {
            if self.reserved_utxos.contains(&utxo.outpoint)
                || channel_utxos.contains(&utxo.outpoint)
            {
                continue;
            }

            // Mutual-close outputs of the pre-splice migration are
            // trusted even unconfirmed.
            let trusted = trusted_txs.contains(&utxo.outpoint.txid);
            if !trusted {
                let confs = utxo.confirmations(current_block_height);
                if confs < params.min_confirmations
                    || confs > params.max_confirmations
                    || params.refund_delay <= confs
                {
                    continue;
                }
            }

            let Some(parent_tx) = wallet.parent_tx(utxo) else {
                continue;
            };
            selected.push(WalletInput {
                outpoint: utxo.outpoint,
                amount: utxo.amount,
                parent_tx: parent_tx.clone(),
            });
        }

        if selected.is_empty() {
            return None;
        }

        let mut request_id = [0u8; 32];
        rng.fill_bytes(&mut request_id);
        for input in &selected {
            self.reserved_utxos.insert(input.outpoint);
        }
        info!(
            utxos = selected.len(),
            "requesting channel open for swap-in",
        );
        Some(RequestChannelOpen {
            request_id,
            wallet_inputs: selected,
        })
    }

    /// Release inputs after a channel abort or splice failure.
    /// Idempotent.
    pub fn unlock_wallet_inputs(
        &mut self,
        outpoints: impl IntoIterator<Item = OutPoint>,
    ) {
        for outpoint in outpoints {
            self.reserved_utxos.remove(&outpoint);
        }
    }
}

#[cfg(test)]
mod test {
    use bitcoin::hashes::Hash;
    use common::{amount::Amount, rng::FastRng};

    use super::*;
    use crate::wallet::UnspentItem;

    fn params() -> SwapInParams {
        SwapInParams {
            min_confirmations: 3,
            max_confirmations: 720,
            refund_delay: 25_920,
        }
    }

    fn txid(byte: u8) -> Txid {
        Txid::from_byte_array([byte; 32])
    }

    fn parent_tx() -> bitcoin::Transaction {
        bitcoin::Transaction {
            version: bitcoin::transaction::Version::TWO,
            lock_time: bitcoin::absolute::LockTime::ZERO,
            input: vec![],
            output: vec![],
        }
    }

    fn wallet_with(utxos: Vec<(u8, u32)>) -> WalletState {
        let mut wallet = WalletState::default();
        let items = utxos
            .into_iter()
            .map(|(parent_byte, height)| {
                wallet.parent_txs.insert(txid(parent_byte), parent_tx());
                UnspentItem {
                    outpoint: OutPoint::new(txid(parent_byte), 0),
                    amount: Amount::from_sat(50_000),
                    block_height: height,
                }
            })
            .collect();
        wallet.addresses.insert("addr".to_owned(), items);
        wallet
    }

    #[test]
    fn respects_confirmation_window() {
        let mut manager = SwapInManager::new();
        let mut rng = FastRng::from_u64(42);
        // One deeply confirmed UTXO (height 100) and one with only 2
        // confirmations (height 149) at tip 150.
        let wallet = wallet_with(vec![(1, 100), (2, 149)]);

        let request = manager
            .try_swap_in(
                150,
                &wallet,
                &params(),
                &HashSet::new(),
                &HashSet::new(),
                &mut rng,
            )
            .expect("one utxo is eligible");
        assert_eq!(request.wallet_inputs.len(), 1);
        assert_eq!(request.wallet_inputs[0].outpoint.txid, txid(1));
    }

    #[test]
    fn rejects_unconfirmed_too_old_and_near_refund() {
        let mut manager = SwapInManager::new();
        let mut rng = FastRng::from_u64(43);
        let p = SwapInParams {
            min_confirmations: 3,
            max_confirmations: 10,
            refund_delay: 30,
        };
        // Unconfirmed (height 0), too old (confs 21 > 10), and near the
        // refund path (confs 100 >= 30).
        let wallet = wallet_with(vec![(1, 0), (2, 130), (3, 51)]);
        assert!(manager
            .try_swap_in(
                150,
                &wallet,
                &p,
                &HashSet::new(),
                &HashSet::new(),
                &mut rng,
            )
            .is_none());
    }

    #[test]
    fn trusted_txs_bypass_confirmations() {
        let mut manager = SwapInManager::new();
        let mut rng = FastRng::from_u64(44);
        // Unconfirmed, but its parent is a trusted migration tx.
        let wallet = wallet_with(vec![(7, 0)]);
        let trusted = HashSet::from([txid(7)]);

        let request = manager
            .try_swap_in(
                150,
                &wallet,
                &params(),
                &trusted,
                &HashSet::new(),
                &mut rng,
            )
            .expect("trusted tx is eligible unconfirmed");
        assert_eq!(request.wallet_inputs[0].outpoint.txid, txid(7));
    }

    #[test]
    fn reservation_prevents_double_commitment() {
        let mut manager = SwapInManager::new();
        let mut rng = FastRng::from_u64(45);
        let wallet = wallet_with(vec![(1, 100)]);

        let request = manager
            .try_swap_in(
                150,
                &wallet,
                &params(),
                &HashSet::new(),
                &HashSet::new(),
                &mut rng,
            )
            .expect("first call selects");

        // Second call on the same wallet: everything is reserved.
        assert!(manager
            .try_swap_in(
                150,
                &wallet,
                &params(),
                &HashSet::new(),
                &HashSet::new(),
                &mut rng,
            )
            .is_none());

        // Unlock (idempotent) and try again.
        manager.unlock_wallet_inputs(request.outpoints());
        manager.unlock_wallet_inputs(request.outpoints());
        assert!(manager
            .try_swap_in(
                150,
                &wallet,
                &params(),
                &HashSet::new(),
                &HashSet::new(),
                &mut rng,
            )
            .is_some());
    }

    #[test]
    fn channel_utxos_are_excluded() {
        let mut manager = SwapInManager::new();
        let mut rng = FastRng::from_u64(46);
        let wallet = wallet_with(vec![(1, 100)]);
        let channel_utxos = HashSet::from([OutPoint::new(txid(1), 0)]);
        assert!(manager
            .try_swap_in(
                150,
                &wallet,
                &params(),
                &HashSet::new(),
                &channel_utxos,
                &mut rng,
            )
            .is_none());
    }
}
