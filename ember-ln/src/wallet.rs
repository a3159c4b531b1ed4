//! The on-chain wallet snapshot model.
//!
//! The wallet itself (address derivation, chain scanning) is driven by the
//! Electrum client outside this crate; the engine consumes immutable
//! snapshots and decides what to do with confirmed UTXOs.

use std::collections::HashMap;

use bitcoin::{OutPoint, Transaction, Txid};
use common::amount::Amount;
use serde::{Deserialize, Serialize};

/// One unspent output as reported by the Electrum `listunspent` protocol:
/// `block_height` is 0 for unconfirmed outputs.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct UnspentItem {
    pub outpoint: OutPoint,
    pub amount: Amount,
    pub block_height: u32,
}

impl UnspentItem {
    /// Confirmation count at `current_height`, treating height 0 (mempool)
    /// as 0 confirmations.
    pub fn confirmations(&self, current_height: u32) -> u32 {
        if self.block_height == 0 || self.block_height > current_height {
            0
        } else {
            current_height - self.block_height + 1
        }
    }
}

/// An immutable snapshot of the user's on-chain wallet.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct WalletState {
    /// Unspent outputs, keyed by the address they pay to.
    pub addresses: HashMap<String, Vec<UnspentItem>>,
    /// Full parent transactions for every unspent output.
    pub parent_txs: HashMap<Txid, Transaction>,
}

impl WalletState {
    /// All unspent outputs across all addresses.
    pub fn utxos(&self) -> impl Iterator<Item = &UnspentItem> {
        self.addresses.values().flatten()
    }

    /// Total confirmed + unconfirmed balance.
    pub fn balance(&self) -> Amount {
        self.utxos().map(|utxo| utxo.amount).sum()
    }

    /// A snapshot is consistent when every referenced parent tx is present.
    /// Inconsistent snapshots occur transiently while the Electrum client is
    /// still downloading parents and must not be acted upon.
    pub fn consistent(&self) -> bool {
        self.utxos()
            .all(|utxo| self.parent_txs.contains_key(&utxo.outpoint.txid))
    }

    /// The parent tx of `utxo`, if known.
    pub fn parent_tx(&self, utxo: &UnspentItem) -> Option<&Transaction> {
        self.parent_txs.get(&utxo.outpoint.txid)
    }
}

#[cfg(test)]
mod test {
    use bitcoin::hashes::Hash;

    use super::*;

    fn txid(byte: u8) -> Txid {
        Txid::from_byte_array([byte; 32])
    }

    fn utxo(parent: u8, height: u32) -> UnspentItem {
        UnspentItem {
            outpoint: OutPoint::new(txid(parent), 0),
            amount: Amount::from_sat(10_000),
            block_height: height,
        }
    }

    #[test]
    fn confirmations_treats_zero_height_as_unconfirmed() {
        assert_eq!(utxo(1, 0).confirmations(150), 0);
        assert_eq!(utxo(1, 150).confirmations(150), 1);
        assert_eq!(utxo(1, 100).confirmations(150), 51);
    }

    #[test]
    fn consistency_requires_all_parents() {
        let mut wallet = WalletState::default();
        wallet
            .addresses
            .insert("addr1".to_owned(), vec![utxo(1, 100)]);
        assert!(!wallet.consistent());

        let parent = Transaction {
            version: bitcoin::transaction::Version::TWO,
            lock_time: bitcoin::absolute::LockTime::ZERO,
            input: vec![],
            output: vec![],
        };
        wallet.parent_txs.insert(txid(1), parent);
        // The snapshot references parent txid 1 by outpoint, not by the
        // (empty) parent's computed txid; only presence in the map matters.
        assert!(wallet.consistent());
    }
}
