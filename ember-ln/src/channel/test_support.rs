//! Shared fixtures for channel tests: a funded channel in `Normal`
//! operation, seen from one or both sides.

use bitcoin::{
    hashes::Hash,
    secp256k1::{ecdsa::Signature, All, Secp256k1},
    Txid,
};
use common::amount::Amount;

use super::{
    commitments::{
        build_commit_tx_for_local, ChannelParams, Commitment,
        CommitmentChanges, CommitmentSpec, Commitments, FundingStatus,
        LocalCommit, LocalParams, RemoteCommit, RemoteParams,
    },
    normal::NormalData,
    ChannelId, ChannelState, ShortChannelId,
};
use crate::{
    keys::{ChannelKeys, KeyManager, SeedKeyManager},
    wire::Features,
};

pub const FUNDING_SAT: u64 = 100_000;
pub const TO_LOCAL_MSAT: u64 = 70_000_000;
pub const TO_REMOTE_MSAT: u64 = 30_000_000;

pub fn test_funding_txid() -> Txid {
    Txid::from_byte_array([9u8; 32])
}

fn local_params() -> LocalParams {
    LocalParams {
        dust_limit_sat: 546,
        max_htlc_value_in_flight: Amount::from_msat(50_000_000),
        channel_reserve_sat: 1_000,
        htlc_minimum: Amount::from_msat(1),
        to_self_delay: 720,
        max_accepted_htlcs: 30,
    }
}

fn remote_params(keys: &ChannelKeys, secp: &Secp256k1<All>) -> RemoteParams {
    RemoteParams {
        dust_limit_sat: 546,
        max_htlc_value_in_flight: Amount::from_msat(50_000_000),
        channel_reserve_sat: 1_000,
        htlc_minimum: Amount::from_msat(1),
        to_self_delay: 720,
        max_accepted_htlcs: 30,
        funding_pubkey: keys.funding_pubkey(secp),
        revocation_basepoint: keys.revocation_basepoint(secp),
        payment_basepoint: keys.payment_point(secp),
        delayed_payment_basepoint: keys.delayed_payment_basepoint(secp),
        htlc_basepoint: keys.htlc_basepoint(secp),
    }
}

/// A placeholder co-signature for the initial commitment; tests never
/// re-verify commit 0.
fn placeholder_sig() -> Signature {
    Signature::from_compact(&[0x01; 64]).unwrap()
}

/// Build one side's `Commitments` for a 100k-sat channel.
///
/// `is_initiator` decides who pays the commit fee. `to_local` is this
/// side's balance.
fn one_side(
    our_keys: &ChannelKeys,
    their_keys: &ChannelKeys,
    to_local: Amount,
    to_remote: Amount,
    is_initiator: bool,
    secp: &Secp256k1<All>,
) -> Commitments {
    let params = ChannelParams {
        channel_id: ChannelId::from_funding(&test_funding_txid(), 0),
        key_index: 0,
        local: local_params(),
        remote: remote_params(their_keys, secp),
        local_is_initiator: is_initiator,
        channel_flags: 0,
        features: Features::default(),
    };

    let spec = CommitmentSpec {
        to_local,
        to_remote,
        feerate_per_kw: 2_500,
        htlcs: vec![],
    };

    let mut commitment = Commitment {
        funding_tx_index: 0,
        funding_txid: test_funding_txid(),
        funding_output_index: 0,
        funding_amount: Amount::from_sat(FUNDING_SAT),
        funding_status: FundingStatus::Confirmed { block_height: 699_000 },
        local_commit: LocalCommit {
            index: 0,
            spec: spec.clone(),
            // Replaced just below once the commitment exists to build from.
            tx: bitcoin::Transaction {
                version: bitcoin::transaction::Version::TWO,
                lock_time: bitcoin::absolute::LockTime::ZERO,
                input: vec![],
                output: vec![],
            },
            remote_sig: placeholder_sig(),
            htlc_remote_sigs: vec![],
        },
        remote_commit: RemoteCommit {
            index: 0,
            spec: spec.clone(),
            txid: Txid::from_byte_array([0x77; 32]),
            remote_per_commitment_point: their_keys
                .per_commitment_point(secp, 0),
        },
        next_remote_commit: None,
    };
    commitment.local_commit.tx = build_commit_tx_for_local(
        &commitment,
        &spec,
        &params,
        our_keys,
        secp,
        0,
    );

    Commitments {
        params,
        changes: CommitmentChanges::default(),
        active: vec![commitment],
        inactive: vec![],
        local_next_htlc_id: 0,
        remote_next_htlc_id: 0,
        remote_next_per_commitment_point: their_keys
            .per_commitment_point(secp, 1),
        remote_per_commitment_secrets: Default::default(),
        originators: Default::default(),
        pending_failed: vec![],
        next_incoming_dispatch_id: 0,
    }
}

/// One side of a funded channel (the initiator, 70k/30k split).
pub fn fixture() -> (Commitments, ChannelKeys, Secp256k1<All>) {
    let secp = Secp256k1::new();
    let local_km = SeedKeyManager::new([1u8; 32]);
    let remote_km = SeedKeyManager::new([2u8; 32]);
    let local_keys = local_km.channel_keys(0);
    let remote_keys = remote_km.channel_keys(0);
    let commitments = one_side(
        &local_keys,
        &remote_keys,
        Amount::from_msat(TO_LOCAL_MSAT),
        Amount::from_msat(TO_REMOTE_MSAT),
        true,
        &secp,
    );
    (commitments, local_keys, secp)
}

/// Both sides of the same channel, with mirrored balances.
#[allow(clippy::type_complexity)]
pub fn peer_fixture() -> (
    (Commitments, ChannelKeys),
    (Commitments, ChannelKeys),
    Secp256k1<All>,
) {
    let secp = Secp256k1::new();
    let local_km = SeedKeyManager::new([1u8; 32]);
    let remote_km = SeedKeyManager::new([2u8; 32]);
    let local_keys = local_km.channel_keys(0);
    let remote_keys = remote_km.channel_keys(0);

    let mut local = one_side(
        &local_keys,
        &remote_keys,
        Amount::from_msat(TO_LOCAL_MSAT),
        Amount::from_msat(TO_REMOTE_MSAT),
        true,
        &secp,
    );
    let mut remote = one_side(
        &remote_keys,
        &local_keys,
        Amount::from_msat(TO_REMOTE_MSAT),
        Amount::from_msat(TO_LOCAL_MSAT),
        false,
        &secp,
    );

    // Each side's view of the other's commitment tx.
    local.active[0].remote_commit.txid =
        remote.active[0].local_commit.txid();
    remote.active[0].remote_commit.txid =
        local.active[0].local_commit.txid();

    ((local, local_keys), (remote, remote_keys), secp)
}

/// A `Normal`-state channel (initiator side) for state-machine tests.
pub fn normal_state() -> ChannelState {
    let (commitments, _keys, _secp) = fixture();
    ChannelState::Normal(NormalData {
        commitments,
        short_channel_id: ShortChannelId::new(699_000, 1, 0),
        remote_channel_update: None,
        splice_session: None,
        local_shutdown_sent: None,
        their_splice_locked: None,
    })
}
