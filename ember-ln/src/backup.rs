//! Sealed channel-state backups.
//!
//! The full persisted channel state travels in the `channel_data` TLV of
//! `channel_reestablish`, as a versioned ChaCha20-Poly1305 blob keyed from
//! the node secret. The peer stores it blindly; we can recover from it
//! after a data loss.
//!
//! Blob layout: `version(1) || nonce(12) || ciphertext+tag`.

use bitcoin::{
    hashes::{sha256, Hash, HashEngine},
    secp256k1::SecretKey,
};
use ring::aead::{
    Aad, LessSafeKey, Nonce, UnboundKey, CHACHA20_POLY1305, NONCE_LEN,
};
use thiserror::Error;

use crate::channel::PersistedChannel;

/// The highest blob version this code can read.
pub const BACKUP_VERSION: u8 = 1;

#[derive(Debug, Error)]
pub enum BackupError {
    /// The blob was produced by a newer version of this software. The
    /// caller must NOT treat this as corruption: it surfaces as an
    /// upgrade-required signal, never a force-close.
    #[error("unsupported backup version {0}")]
    UnsupportedVersion(u8),

    #[error("backup too short")]
    TooShort,

    #[error("backup decryption failed")]
    Decrypt,

    #[error("backup deserialization failed: {0}")]
    Deserialize(#[from] serde_json::Error),
}

fn backup_key(node_secret: &SecretKey) -> LessSafeKey {
    let mut engine = sha256::Hash::engine();
    engine.input(b"channel-backup-key");
    engine.input(&node_secret.secret_bytes());
    let key_bytes = sha256::Hash::from_engine(engine).to_byte_array();
    let unbound = UnboundKey::new(&CHACHA20_POLY1305, &key_bytes)
        .expect("chacha20poly1305 key is 32 bytes");
    LessSafeKey::new(unbound)
}

/// Encrypt and authenticate a persisted channel state.
pub fn seal(
    node_secret: &SecretKey,
    state: &PersistedChannel,
) -> anyhow::Result<Vec<u8>> {
    let plaintext = serde_json::to_vec(state)?;

    // The nonce is derived from the plaintext, so it is unique per
    // distinct state under the same key.
    let mut engine = sha256::Hash::engine();
    engine.input(b"channel-backup-nonce");
    engine.input(&plaintext);
    let digest = sha256::Hash::from_engine(engine).to_byte_array();
    let mut nonce_bytes = [0u8; NONCE_LEN];
    nonce_bytes.copy_from_slice(&digest[..NONCE_LEN]);

    let key = backup_key(node_secret);
    let mut data = plaintext;
    key.seal_in_place_append_tag(
        Nonce::assume_unique_for_key(nonce_bytes),
        Aad::empty(),
        &mut data,
    )
    .map_err(|_| anyhow::anyhow!("backup encryption failed"))?;

    let mut blob = Vec::with_capacity(1 + NONCE_LEN + data.len());
    blob.push(BACKUP_VERSION);
    blob.extend_from_slice(&nonce_bytes);
    blob.extend_from_slice(&data);
    Ok(blob)
}

/// Decrypt and deserialize a backup blob.
pub fn open(
    node_secret: &SecretKey,
    blob: &[u8],
) -> Result<PersistedChannel, BackupError> {
    let (&version, rest) =
        blob.split_first().ok_or(BackupError::TooShort)?;
    if version > BACKUP_VERSION {
        return Err(BackupError::UnsupportedVersion(version));
    }
    if rest.len() < NONCE_LEN {
        return Err(BackupError::TooShort);
    }
    let (nonce_bytes, ciphertext) = rest.split_at(NONCE_LEN);
    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(nonce_bytes);

    let key = backup_key(node_secret);
    let mut data = ciphertext.to_vec();
    let plaintext = key
        .open_in_place(
            Nonce::assume_unique_for_key(nonce),
            Aad::empty(),
            &mut data,
        )
        .map_err(|_| BackupError::Decrypt)?;
    Ok(serde_json::from_slice(plaintext)?)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::channel::test_support::fixture;

    fn test_state() -> PersistedChannel {
        let (commitments, ..) = fixture();
        PersistedChannel::WaitForFundingConfirmed { commitments }
    }

    #[test]
    fn seal_open_roundtrip() {
        let node_secret = SecretKey::from_slice(&[0x42; 32]).unwrap();
        let state = test_state();
        let blob = seal(&node_secret, &state).unwrap();
        let recovered = open(&node_secret, &blob).unwrap();
        assert_eq!(recovered.channel_id(), state.channel_id());
    }

    #[test]
    fn wrong_key_fails_closed() {
        let state = test_state();
        let blob =
            seal(&SecretKey::from_slice(&[0x42; 32]).unwrap(), &state)
                .unwrap();
        let err =
            open(&SecretKey::from_slice(&[0x43; 32]).unwrap(), &blob)
                .unwrap_err();
        assert!(matches!(err, BackupError::Decrypt));
    }

    #[test]
    fn newer_version_is_not_corruption() {
        let node_secret = SecretKey::from_slice(&[0x42; 32]).unwrap();
        let mut blob = seal(&node_secret, &test_state()).unwrap();
        blob[0] = BACKUP_VERSION + 1;
        let err = open(&node_secret, &blob).unwrap_err();
        assert!(matches!(
            err,
            BackupError::UnsupportedVersion(v) if v == BACKUP_VERSION + 1,
        ));
    }

    #[test]
    fn tampered_blob_fails() {
        let node_secret = SecretKey::from_slice(&[0x42; 32]).unwrap();
        let mut blob = seal(&node_secret, &test_state()).unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0x01;
        assert!(matches!(
            open(&node_secret, &blob),
            Err(BackupError::Decrypt),
        ));
    }
}
