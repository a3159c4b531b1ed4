//! The key-manager seam.
//!
//! Key derivation is owned by an external key manager (it may live in a
//! secure enclave on some platforms); the engine only consumes the
//! operations below. [`SeedKeyManager`] is a plain software implementation
//! used by tests and by platforms without hardware keys.

use bitcoin::{
    hashes::{sha256, Hash, HashEngine},
    secp256k1::{All, Message, PublicKey, Secp256k1, SecretKey},
    sighash::{EcdsaSighashType, SighashCache},
    Transaction, TxOut, Witness,
};

/// Key operations the engine needs. Channel states persist a key *index*,
/// never key material; keys are re-derived through this seam on demand.
pub trait KeyManager: Send + Sync {
    /// Our static node id.
    fn node_id(&self) -> PublicKey;

    /// The node secret key. Keys the noise transport, invoice signatures,
    /// and the channel-backup sealing key.
    fn node_secret(&self) -> SecretKey;

    /// Deterministic per-channel keys for the given key index.
    fn channel_keys(&self, key_index: u64) -> ChannelKeys;

    /// Sign a wallet-owned segwit input of an interactive funding tx,
    /// returning the full witness.
    fn sign_wallet_input(
        &self,
        tx: &Transaction,
        input_index: usize,
        prev_output: &TxOut,
    ) -> anyhow::Result<Witness>;
}

/// The per-channel key set. Holds base secrets plus the per-commitment
/// secret chain seed.
#[derive(Clone)]
pub struct ChannelKeys {
    pub funding_key: SecretKey,
    pub revocation_base_key: SecretKey,
    pub payment_key: SecretKey,
    pub delayed_payment_key: SecretKey,
    pub htlc_key: SecretKey,
    shachain_seed: [u8; 32],
}

impl ChannelKeys {
    pub fn funding_pubkey(&self, secp: &Secp256k1<All>) -> PublicKey {
        PublicKey::from_secret_key(secp, &self.funding_key)
    }

    pub fn revocation_basepoint(&self, secp: &Secp256k1<All>) -> PublicKey {
        PublicKey::from_secret_key(secp, &self.revocation_base_key)
    }

    pub fn payment_point(&self, secp: &Secp256k1<All>) -> PublicKey {
        PublicKey::from_secret_key(secp, &self.payment_key)
    }

    pub fn delayed_payment_basepoint(
        &self,
        secp: &Secp256k1<All>,
    ) -> PublicKey {
        PublicKey::from_secret_key(secp, &self.delayed_payment_key)
    }

    pub fn htlc_basepoint(&self, secp: &Secp256k1<All>) -> PublicKey {
        PublicKey::from_secret_key(secp, &self.htlc_key)
    }

    /// The secret revealed to the peer when commitment `index` is revoked.
    pub fn per_commitment_secret(&self, index: u64) -> SecretKey {
        let digest = tagged_hash(
            b"per-commitment-secret",
            &self.shachain_seed,
            index,
        );
        SecretKey::from_slice(&digest)
            .expect("sha256 output is a valid scalar")
    }

    /// The public point the peer commits to for commitment `index`.
    pub fn per_commitment_point(
        &self,
        secp: &Secp256k1<All>,
        index: u64,
    ) -> PublicKey {
        PublicKey::from_secret_key(secp, &self.per_commitment_secret(index))
    }
}

// Avoid leaking secrets through debug logs.
impl std::fmt::Debug for ChannelKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ChannelKeys(..)")
    }
}

/// A software [`KeyManager`] deriving all key material from a 32-byte seed
/// with domain-separated SHA-256.
pub struct SeedKeyManager {
    seed: [u8; 32],
    node_key: SecretKey,
    secp: Secp256k1<All>,
}

impl SeedKeyManager {
    pub fn new(seed: [u8; 32]) -> Self {
        let node_key =
            SecretKey::from_slice(&tagged_hash(b"node-key", &seed, 0))
                .expect("sha256 output is a valid scalar");
        Self {
            seed,
            node_key,
            secp: Secp256k1::new(),
        }
    }

    fn derive_key(&self, tag: &[u8], key_index: u64) -> SecretKey {
        SecretKey::from_slice(&tagged_hash(tag, &self.seed, key_index))
            .expect("sha256 output is a valid scalar")
    }
}

impl KeyManager for SeedKeyManager {
    fn node_id(&self) -> PublicKey {
        PublicKey::from_secret_key(&self.secp, &self.node_key)
    }

    fn node_secret(&self) -> SecretKey {
        self.node_key
    }

    fn channel_keys(&self, key_index: u64) -> ChannelKeys {
        ChannelKeys {
            funding_key: self.derive_key(b"funding-key", key_index),
            revocation_base_key: self
                .derive_key(b"revocation-base-key", key_index),
            payment_key: self.derive_key(b"payment-key", key_index),
            delayed_payment_key: self
                .derive_key(b"delayed-payment-key", key_index),
            htlc_key: self.derive_key(b"htlc-key", key_index),
            shachain_seed: tagged_hash(b"shachain-seed", &self.seed, key_index),
        }
    }

    fn sign_wallet_input(
        &self,
        tx: &Transaction,
        input_index: usize,
        prev_output: &TxOut,
    ) -> anyhow::Result<Witness> {
        // Wallet UTXOs are p2wpkh outputs of the wallet key.
        let wallet_key = self.derive_key(b"wallet-key", 0);
        let wallet_pubkey = PublicKey::from_secret_key(&self.secp, &wallet_key);

        let mut cache = SighashCache::new(tx);
        let sighash = cache.p2wpkh_signature_hash(
            input_index,
            &prev_output.script_pubkey,
            prev_output.value,
            EcdsaSighashType::All,
        )?;
        let msg = Message::from_digest(sighash.to_byte_array());
        let sig = self.secp.sign_ecdsa(&msg, &wallet_key);

        let mut sig_bytes = sig.serialize_der().to_vec();
        sig_bytes.push(EcdsaSighashType::All as u8);

        let mut witness = Witness::new();
        witness.push(sig_bytes);
        witness.push(wallet_pubkey.serialize().to_vec());
        Ok(witness)
    }
}

/// `sha256(tag || data || be64(index))`
fn tagged_hash(tag: &[u8], data: &[u8; 32], index: u64) -> [u8; 32] {
    let mut engine = sha256::Hash::engine();
    engine.input(tag);
    engine.input(data);
    engine.input(&index.to_be_bytes());
    sha256::Hash::from_engine(engine).to_byte_array()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn derivation_is_deterministic_and_separated() {
        let km1 = SeedKeyManager::new([7u8; 32]);
        let km2 = SeedKeyManager::new([7u8; 32]);
        assert_eq!(km1.node_id(), km2.node_id());

        let keys0 = km1.channel_keys(0);
        let keys1 = km1.channel_keys(1);
        assert_ne!(keys0.funding_key, keys1.funding_key);
        assert_ne!(keys0.funding_key, keys0.htlc_key);
    }

    #[test]
    fn per_commitment_chain_is_stable() {
        let keys = SeedKeyManager::new([1u8; 32]).channel_keys(0);
        let secp = Secp256k1::new();
        let point_a = keys.per_commitment_point(&secp, 42);
        let point_b = keys.per_commitment_point(&secp, 42);
        assert_eq!(point_a, point_b);
        assert_ne!(point_a, keys.per_commitment_point(&secp, 43));
    }
}
