//! The durable core of a channel: parameters, the active commitment list,
//! pending change sets, and the sign / revoke protocol operations.
//!
//! All specs are stored from *our* perspective: `to_local` is our balance.
//! The remote's commitment transaction is materialized from the mirrored
//! spec at build time.
//!
//! Invariants maintained here:
//! - `active` is never empty; its head is the latest funding (most recent
//!   splice candidate).
//! - For every commitment, `to_local + to_remote + sum(htlcs)` equals the
//!   funding amount.
//! - Commitment indices only ever increase.
//! - A per-commitment secret is revealed only after the successor
//!   commitment is signed by the counterparty.

use std::collections::BTreeMap;

use bitcoin::{
    hashes::{sha256, Hash},
    secp256k1::{
        ecdsa::Signature, All, Message, PublicKey, Secp256k1, SecretKey,
    },
    sighash::{EcdsaSighashType, SighashCache},
    Amount as SatAmount, OutPoint, Transaction, Txid,
};
use common::amount::Amount;
use serde::{Deserialize, Serialize};

use super::{
    scripts::{self, CommitTxKeys},
    AddHtlcSpec, ChannelError, ChannelId, HTLC_SAFETY_DELTA,
};
use crate::{
    keys::ChannelKeys,
    payments::{PartId, PaymentId},
    wire::{
        CommitmentSigned, Features, RevokeAndAck, UpdateAddHtlc, UpdateFee,
        UpdateFailHtlc, UpdateFailMalformedHtlc, UpdateFulfillHtlc,
    },
};

// --- Parameters --- //

/// Our side's negotiated limits.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LocalParams {
    pub dust_limit_sat: u64,
    pub max_htlc_value_in_flight: Amount,
    pub channel_reserve_sat: u64,
    pub htlc_minimum: Amount,
    pub to_self_delay: u16,
    pub max_accepted_htlcs: u16,
}

/// The remote side's negotiated limits and static channel keys.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RemoteParams {
    pub dust_limit_sat: u64,
    pub max_htlc_value_in_flight: Amount,
    pub channel_reserve_sat: u64,
    pub htlc_minimum: Amount,
    pub to_self_delay: u16,
    pub max_accepted_htlcs: u16,
    pub funding_pubkey: PublicKey,
    pub revocation_basepoint: PublicKey,
    pub payment_basepoint: PublicKey,
    pub delayed_payment_basepoint: PublicKey,
    pub htlc_basepoint: PublicKey,
}

/// Static channel parameters, fixed at funding agreement.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChannelParams {
    pub channel_id: ChannelId,
    /// Index into the key manager's channel key derivation.
    pub key_index: u64,
    pub local: LocalParams,
    pub remote: RemoteParams,
    pub local_is_initiator: bool,
    pub channel_flags: u8,
    pub features: Features,
}

// --- Specs and commits --- //

#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize,
)]
pub enum HtlcDirection {
    /// Added by us; claimable by the peer with the preimage.
    Outgoing,
    /// Added by the peer; claimable by us with the preimage.
    Incoming,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct DirectedHtlc {
    pub direction: HtlcDirection,
    pub add: UpdateAddHtlc,
}

/// One commitment's balances and in-flight HTLCs, from our perspective.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommitmentSpec {
    pub to_local: Amount,
    pub to_remote: Amount,
    pub feerate_per_kw: u32,
    pub htlcs: Vec<DirectedHtlc>,
}

impl CommitmentSpec {
    pub fn htlc_total(&self) -> Amount {
        self.htlcs.iter().map(|htlc| htlc.add.amount).sum()
    }

    pub fn total(&self) -> Amount {
        self.to_local + self.to_remote + self.htlc_total()
    }

    pub fn find(
        &self,
        direction: HtlcDirection,
        id: u64,
    ) -> Option<&DirectedHtlc> {
        self.htlcs
            .iter()
            .find(|htlc| htlc.direction == direction && htlc.add.id == id)
    }

    /// The spec as seen from the other side.
    pub fn mirrored(&self) -> CommitmentSpec {
        CommitmentSpec {
            to_local: self.to_remote,
            to_remote: self.to_local,
            feerate_per_kw: self.feerate_per_kw,
            htlcs: self
                .htlcs
                .iter()
                .map(|htlc| DirectedHtlc {
                    direction: match htlc.direction {
                        HtlcDirection::Outgoing => HtlcDirection::Incoming,
                        HtlcDirection::Incoming => HtlcDirection::Outgoing,
                    },
                    add: htlc.add.clone(),
                })
                .collect(),
        }
    }
}

/// Our commitment transaction at the current local index, co-signed by the
/// remote.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LocalCommit {
    pub index: u64,
    pub spec: CommitmentSpec,
    pub tx: Transaction,
    pub remote_sig: Signature,
    pub htlc_remote_sigs: Vec<Signature>,
}

impl LocalCommit {
    pub fn txid(&self) -> Txid {
        self.tx.compute_txid()
    }
}

/// The remote's commitment transaction at the current remote index. We only
/// track its txid and the per-commitment point it was built for.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RemoteCommit {
    pub index: u64,
    /// From our perspective; mirrored when materializing their tx.
    pub spec: CommitmentSpec,
    pub txid: Txid,
    pub remote_per_commitment_point: PublicKey,
}

/// Confirmation status of one funding transaction.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum FundingStatus {
    /// Not yet confirmed; we keep the full tx for republish.
    Unconfirmed { tx: Option<Transaction> },
    Confirmed { block_height: u32 },
}

/// One funding transaction and the commitments built on it. Multiple
/// actives exist only during an unconfirmed splice.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Commitment {
    /// 0 for the initial funding, incremented per splice.
    pub funding_tx_index: u64,
    pub funding_txid: Txid,
    pub funding_output_index: u32,
    pub funding_amount: Amount,
    pub funding_status: FundingStatus,
    pub local_commit: LocalCommit,
    pub remote_commit: RemoteCommit,
    /// Set between our `commitment_signed` and their `revoke_and_ack`.
    pub next_remote_commit: Option<RemoteCommit>,
}

impl Commitment {
    pub fn funding_outpoint(&self) -> OutPoint {
        OutPoint::new(self.funding_txid, self.funding_output_index)
    }

    pub fn is_confirmed(&self) -> bool {
        matches!(self.funding_status, FundingStatus::Confirmed { .. })
    }
}

// --- Change sets --- //

/// An update message buffered in the "proposed changes" sets.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum UpdateMsg {
    Add(UpdateAddHtlc),
    Fulfill(UpdateFulfillHtlc),
    Fail(UpdateFailHtlc),
    FailMalformed(UpdateFailMalformedHtlc),
    Fee(UpdateFee),
}

/// Buffered changes on both sides of the signing pipeline.
///
/// Lifecycle of one of our changes: `local_proposed` (update sent) ->
/// `local_signed` (covered by our `commitment_signed`) -> `local_acked`
/// (peer revoked; lands in our local commit at their next signature).
/// Mirrored for their changes.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CommitmentChanges {
    pub local_proposed: Vec<UpdateMsg>,
    pub local_signed: Vec<UpdateMsg>,
    pub local_acked: Vec<UpdateMsg>,
    pub remote_proposed: Vec<UpdateMsg>,
    pub remote_acked: Vec<UpdateMsg>,
    pub remote_signed: Vec<UpdateMsg>,
}

impl CommitmentChanges {
    pub fn local_has_changes(&self) -> bool {
        !self.local_proposed.is_empty() || !self.remote_acked.is_empty()
    }

    pub fn remote_has_changes(&self) -> bool {
        !self.remote_proposed.is_empty() || !self.local_acked.is_empty()
    }

    /// Whether `id` already has a terminal (fulfill/fail) change buffered
    /// anywhere in the pipeline.
    fn htlc_resolved(&self, id: u64, ours: bool) -> bool {
        let sets: [&Vec<UpdateMsg>; 3] = if ours {
            [&self.local_proposed, &self.local_signed, &self.local_acked]
        } else {
            [
                &self.remote_proposed,
                &self.remote_acked,
                &self.remote_signed,
            ]
        };
        sets.iter().flat_map(|set| set.iter()).any(|msg| match msg {
            UpdateMsg::Fulfill(m) => m.id == id,
            UpdateMsg::Fail(m) => m.id == id,
            UpdateMsg::FailMalformed(m) => m.id == id,
            _ => false,
        })
    }
}

/// Who originated one of our outgoing HTLCs; routes settlement back to the
/// outgoing payment handler.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize,
)]
pub struct HtlcOrigin {
    pub payment_id: PaymentId,
    pub part_id: PartId,
}

/// What a completed revocation round-trip released.
#[derive(Clone, Debug, Default)]
pub struct RevocationOutcome {
    /// Failed settlements of our outgoing HTLCs, withheld so that fulfills
    /// always propagate first.
    pub failed: Vec<(HtlcOrigin, Vec<u8>)>,
    /// Incoming HTLCs that just became irrevocably committed and must be
    /// handed to the payment layer.
    pub incoming: Vec<UpdateAddHtlc>,
}

// --- Commitments --- //

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Commitments {
    pub params: ChannelParams,
    pub changes: CommitmentChanges,
    /// Non-empty; head is the latest funding.
    pub active: Vec<Commitment>,
    pub inactive: Vec<Commitment>,
    pub local_next_htlc_id: u64,
    pub remote_next_htlc_id: u64,
    pub remote_next_per_commitment_point: PublicKey,
    /// Revocation secrets the peer has revealed, by commitment index.
    pub remote_per_commitment_secrets: BTreeMap<u64, [u8; 32]>,
    /// Outgoing htlc id -> payment part that owns it.
    pub originators: BTreeMap<u64, HtlcOrigin>,
    /// Failed settlements withheld until the revocation completes, so
    /// fulfills always reach the payment layer first.
    pub pending_failed: Vec<(HtlcOrigin, Vec<u8>)>,
    /// Incoming HTLC ids below this have already been handed to the
    /// payment layer.
    #[serde(default)]
    pub next_incoming_dispatch_id: u64,
}

impl Commitments {
    pub fn latest(&self) -> &Commitment {
        self.active.first().expect("active commitments are non-empty")
    }

    fn latest_mut(&mut self) -> &mut Commitment {
        self.active.first_mut().expect("active commitments are non-empty")
    }

    pub fn all(&self) -> impl Iterator<Item = &Commitment> {
        self.active.iter().chain(self.inactive.iter())
    }

    pub fn local_commit_index(&self) -> u64 {
        self.latest().local_commit.index
    }

    pub fn remote_commit_index(&self) -> u64 {
        self.latest().remote_commit.index
    }

    pub fn last_remote_per_commitment_secret(&self) -> Option<[u8; 32]> {
        self.remote_per_commitment_secrets
            .last_key_value()
            .map(|(_, secret)| *secret)
    }

    /// The local commit spec with every pending change applied: what the
    /// channel will look like once the in-flight updates are fully signed.
    pub fn projected_spec(&self) -> CommitmentSpec {
        let ours = self
            .changes
            .local_acked
            .iter()
            .chain(self.changes.local_signed.iter())
            .chain(self.changes.local_proposed.iter());
        let theirs = self.changes.remote_proposed.iter();
        apply_changes(
            &self.latest().local_commit.spec,
            ours.cloned().collect(),
            theirs.cloned().collect(),
        )
    }

    // --- Adding and resolving HTLCs --- //

    /// Validate and buffer an outgoing HTLC add. On success returns the
    /// wire message to send.
    pub fn send_add(
        &mut self,
        spec: &AddHtlcSpec,
        block_height: u32,
    ) -> Result<UpdateAddHtlc, ChannelError> {
        if spec.cltv_expiry <= block_height + HTLC_SAFETY_DELTA {
            return Err(ChannelError::ExpiryTooSoon {
                expiry: spec.cltv_expiry,
                tip: block_height,
            });
        }
        if spec.amount < self.params.remote.htlc_minimum {
            return Err(ChannelError::HtlcValueTooSmall {
                minimum: self.params.remote.htlc_minimum,
            });
        }

        let projected = self.projected_spec();
        let outgoing = projected
            .htlcs
            .iter()
            .filter(|htlc| htlc.direction == HtlcDirection::Outgoing)
            .collect::<Vec<_>>();
        if outgoing.len() + 1 > usize::from(self.params.remote.max_accepted_htlcs)
        {
            return Err(ChannelError::TooManyAcceptedHtlcs {
                maximum: self.params.remote.max_accepted_htlcs,
            });
        }
        let in_flight: Amount =
            outgoing.iter().map(|htlc| htlc.add.amount).sum();
        if in_flight + spec.amount
            > self.params.remote.max_htlc_value_in_flight
        {
            return Err(ChannelError::HtlcValueInFlightTooHigh {
                maximum: self.params.remote.max_htlc_value_in_flight,
            });
        }

        // We must stay above the reserve and cover the commit fee if we
        // funded the channel.
        let mut required = spec.amount
            + Amount::from_sat(self.params.remote.channel_reserve_sat);
        if self.params.local_is_initiator {
            required += Amount::from_sat(scripts::commit_fee_sat(
                projected.feerate_per_kw,
                projected.htlcs.len() + 1,
            ));
        }
        if projected.to_local < required {
            return Err(ChannelError::InsufficientFunds {
                missing: required - projected.to_local,
            });
        }

        let add = UpdateAddHtlc {
            channel_id: self.params.channel_id,
            id: self.local_next_htlc_id,
            amount: spec.amount,
            payment_hash: spec.payment_hash,
            cltv_expiry: spec.cltv_expiry,
            onion: spec.onion.clone(),
        };
        self.local_next_htlc_id += 1;
        self.originators.insert(
            add.id,
            HtlcOrigin {
                payment_id: spec.payment_id,
                part_id: spec.part_id,
            },
        );
        self.changes
            .local_proposed
            .push(UpdateMsg::Add(add.clone()));
        Ok(add)
    }

    /// Validate and buffer an incoming HTLC add from the peer.
    pub fn receive_add(
        &mut self,
        add: UpdateAddHtlc,
    ) -> Result<(), ChannelError> {
        if add.id != self.remote_next_htlc_id {
            return Err(ChannelError::PeerError(format!(
                "unexpected htlc id {} (expected {})",
                add.id, self.remote_next_htlc_id,
            )));
        }
        if add.amount < self.params.local.htlc_minimum {
            return Err(ChannelError::HtlcValueTooSmall {
                minimum: self.params.local.htlc_minimum,
            });
        }
        let projected = self.projected_spec();
        let incoming = projected
            .htlcs
            .iter()
            .filter(|htlc| htlc.direction == HtlcDirection::Incoming)
            .collect::<Vec<_>>();
        if incoming.len() + 1 > usize::from(self.params.local.max_accepted_htlcs)
        {
            return Err(ChannelError::TooManyAcceptedHtlcs {
                maximum: self.params.local.max_accepted_htlcs,
            });
        }
        let in_flight: Amount =
            incoming.iter().map(|htlc| htlc.add.amount).sum();
        if in_flight + add.amount
            > self.params.local.max_htlc_value_in_flight
        {
            return Err(ChannelError::HtlcValueInFlightTooHigh {
                maximum: self.params.local.max_htlc_value_in_flight,
            });
        }
        if projected.to_remote < add.amount {
            return Err(ChannelError::InsufficientFunds {
                missing: add.amount - projected.to_remote,
            });
        }

        self.remote_next_htlc_id += 1;
        self.changes.remote_proposed.push(UpdateMsg::Add(add));
        Ok(())
    }

    /// Fulfill an incoming HTLC we hold the preimage for.
    pub fn send_fulfill(
        &mut self,
        id: u64,
        preimage: [u8; 32],
    ) -> Result<UpdateFulfillHtlc, ChannelError> {
        let htlc = self
            .latest()
            .local_commit
            .spec
            .find(HtlcDirection::Incoming, id)
            .ok_or(ChannelError::UnknownHtlc { id })?;
        let hash = sha256::Hash::hash(&preimage).to_byte_array();
        if hash != htlc.add.payment_hash {
            return Err(ChannelError::InvalidHtlcPreimage { id });
        }
        if self.changes.htlc_resolved(id, true) {
            return Err(ChannelError::HtlcAlreadyResolved { id });
        }
        let fulfill = UpdateFulfillHtlc {
            channel_id: self.params.channel_id,
            id,
            payment_preimage: preimage,
        };
        self.changes
            .local_proposed
            .push(UpdateMsg::Fulfill(fulfill.clone()));
        Ok(fulfill)
    }

    /// Fail an incoming HTLC.
    pub fn send_fail(
        &mut self,
        id: u64,
        reason: Vec<u8>,
    ) -> Result<UpdateFailHtlc, ChannelError> {
        if self
            .latest()
            .local_commit
            .spec
            .find(HtlcDirection::Incoming, id)
            .is_none()
        {
            return Err(ChannelError::UnknownHtlc { id });
        }
        if self.changes.htlc_resolved(id, true) {
            return Err(ChannelError::HtlcAlreadyResolved { id });
        }
        let fail = UpdateFailHtlc {
            channel_id: self.params.channel_id,
            id,
            reason,
        };
        self.changes
            .local_proposed
            .push(UpdateMsg::Fail(fail.clone()));
        Ok(fail)
    }

    /// The peer fulfilled one of our outgoing HTLCs. Returns the origin so
    /// the settlement is forwarded to the payment layer immediately
    /// (fulfills propagate before fails).
    pub fn receive_fulfill(
        &mut self,
        fulfill: &UpdateFulfillHtlc,
    ) -> Result<(HtlcOrigin, Amount), ChannelError> {
        let htlc = self
            .latest()
            .remote_commit
            .spec
            .find(HtlcDirection::Outgoing, fulfill.id)
            .ok_or(ChannelError::UnknownHtlc { id: fulfill.id })?;
        let hash =
            sha256::Hash::hash(&fulfill.payment_preimage).to_byte_array();
        if hash != htlc.add.payment_hash {
            return Err(ChannelError::InvalidHtlcPreimage { id: fulfill.id });
        }
        if self.changes.htlc_resolved(fulfill.id, false) {
            return Err(ChannelError::HtlcAlreadyResolved { id: fulfill.id });
        }
        let amount = htlc.add.amount;
        let origin = self
            .originators
            .get(&fulfill.id)
            .copied()
            .ok_or(ChannelError::UnknownHtlc { id: fulfill.id })?;
        self.changes
            .remote_proposed
            .push(UpdateMsg::Fulfill(fulfill.clone()));
        Ok((origin, amount))
    }

    /// The peer failed one of our outgoing HTLCs. The settlement is
    /// withheld until the revocation round-trip completes.
    pub fn receive_fail(
        &mut self,
        fail: &UpdateFailHtlc,
    ) -> Result<(), ChannelError> {
        if self
            .latest()
            .remote_commit
            .spec
            .find(HtlcDirection::Outgoing, fail.id)
            .is_none()
        {
            return Err(ChannelError::UnknownHtlc { id: fail.id });
        }
        if self.changes.htlc_resolved(fail.id, false) {
            return Err(ChannelError::HtlcAlreadyResolved { id: fail.id });
        }
        let origin = self
            .originators
            .get(&fail.id)
            .copied()
            .ok_or(ChannelError::UnknownHtlc { id: fail.id })?;
        self.pending_failed.push((origin, fail.reason.clone()));
        self.changes
            .remote_proposed
            .push(UpdateMsg::Fail(fail.clone()));
        Ok(())
    }

    // --- Signing round-trips --- //

    /// Sign the remote's next commitment(s): one `commitment_signed` per
    /// active funding.
    pub fn send_commit(
        &mut self,
        keys: &ChannelKeys,
        secp: &Secp256k1<All>,
    ) -> Result<Vec<CommitmentSigned>, ChannelError> {
        if !self.changes.local_has_changes() {
            return Err(ChannelError::NoChangesToSign);
        }
        if self
            .active
            .iter()
            .any(|commitment| commitment.next_remote_commit.is_some())
        {
            return Err(ChannelError::UnrevokedCommitment);
        }

        let ours = self.changes.local_proposed.clone();
        let theirs = self.changes.remote_acked.clone();
        let multiple_active = self.active.len() > 1;
        let channel_id = self.params.channel_id;
        let remote_point = self.remote_next_per_commitment_point;

        let mut msgs = Vec::with_capacity(self.active.len());
        for commitment in &mut self.active {
            let spec = apply_changes(
                &commitment.remote_commit.spec,
                ours.clone(),
                theirs.clone(),
            );
            debug_assert_eq!(spec.total(), commitment.funding_amount);

            let remote_tx = build_commit_tx_for_remote(
                commitment,
                &spec,
                &self.params,
                keys,
                secp,
            );
            let digest = funding_sighash(
                &remote_tx,
                commitment,
                &self.params,
                keys,
                secp,
            )?;
            let signature =
                secp.sign_ecdsa(&Message::from_digest(digest), &keys.funding_key);
            let htlc_signatures = spec
                .htlcs
                .iter()
                .filter(|htlc| {
                    htlc.add.amount.sats_floor()
                        >= self.params.remote.dust_limit_sat
                })
                .map(|_| {
                    secp.sign_ecdsa(
                        &Message::from_digest(digest),
                        &keys.htlc_key,
                    )
                })
                .collect();

            commitment.next_remote_commit = Some(RemoteCommit {
                index: commitment.remote_commit.index + 1,
                spec,
                txid: remote_tx.compute_txid(),
                remote_per_commitment_point: remote_point,
            });
            msgs.push(CommitmentSigned {
                channel_id,
                signature,
                htlc_signatures,
                funding_txid: multiple_active
                    .then_some(commitment.funding_txid),
            });
        }

        self.changes.local_signed =
            std::mem::take(&mut self.changes.local_proposed);
        self.changes.remote_signed =
            std::mem::take(&mut self.changes.remote_acked);
        Ok(msgs)
    }

    /// Process the peer's `commitment_signed` over our next local
    /// commitment(s) and produce our revocation.
    ///
    /// During a splice window the peer sends one signature per active
    /// funding; the caller buffers until it has them all.
    pub fn receive_commit(
        &mut self,
        sigs: &[CommitmentSigned],
        keys: &ChannelKeys,
        secp: &Secp256k1<All>,
    ) -> Result<RevokeAndAck, ChannelError> {
        if !self.changes.remote_has_changes() {
            return Err(ChannelError::NoChangesToSign);
        }

        let ours = self.changes.local_acked.clone();
        let theirs = self.changes.remote_proposed.clone();
        let old_index = self.local_commit_index();
        let params = self.params.clone();

        for commitment in &mut self.active {
            let sig = sigs
                .iter()
                .find(|sig| match sig.funding_txid {
                    Some(txid) => txid == commitment.funding_txid,
                    None => true,
                })
                .ok_or(ChannelError::InvalidCommitmentSignature {
                    commit_number: old_index + 1,
                })?;

            let spec = apply_changes(
                &commitment.local_commit.spec,
                ours.clone(),
                theirs.clone(),
            );
            debug_assert_eq!(spec.total(), commitment.funding_amount);

            let local_tx = build_commit_tx_for_local(
                commitment,
                &spec,
                &params,
                keys,
                secp,
                old_index + 1,
            );
            let digest =
                funding_sighash(&local_tx, commitment, &params, keys, secp)?;
            secp.verify_ecdsa(
                &Message::from_digest(digest),
                &sig.signature,
                &params.remote.funding_pubkey,
            )
            .map_err(|_| ChannelError::InvalidCommitmentSignature {
                commit_number: old_index + 1,
            })?;

            commitment.local_commit = LocalCommit {
                index: old_index + 1,
                spec,
                tx: local_tx,
                remote_sig: sig.signature,
                htlc_remote_sigs: sig.htlc_signatures.clone(),
            };
        }

        let consumed = std::mem::take(&mut self.changes.remote_proposed);
        self.changes.remote_acked.extend(consumed);
        self.changes.local_acked.clear();

        // Reveal the secret of the commitment we just replaced, and commit
        // to the point after next.
        Ok(RevokeAndAck {
            channel_id: self.params.channel_id,
            per_commitment_secret: keys
                .per_commitment_secret(old_index)
                .secret_bytes(),
            next_per_commitment_point: keys
                .per_commitment_point(secp, old_index + 2),
        })
    }

    /// Process the peer's revocation of their previous commitment. Returns
    /// the failed-HTLC settlements withheld until now plus the incoming
    /// HTLCs that just became irrevocably committed.
    pub fn receive_revocation(
        &mut self,
        rev: &RevokeAndAck,
        secp: &Secp256k1<All>,
    ) -> Result<RevocationOutcome, ChannelError> {
        let revoked_index = self.remote_commit_index();
        let expected_point =
            self.latest().remote_commit.remote_per_commitment_point;
        let secret = SecretKey::from_slice(&rev.per_commitment_secret)
            .map_err(|_| ChannelError::InvalidRevocation {
                commit_number: revoked_index,
            })?;
        if PublicKey::from_secret_key(secp, &secret) != expected_point {
            return Err(ChannelError::InvalidRevocation {
                commit_number: revoked_index,
            });
        }

        for commitment in &mut self.active {
            let next = commitment.next_remote_commit.take().ok_or(
                ChannelError::InvalidRevocation {
                    commit_number: revoked_index,
                },
            )?;
            commitment.remote_commit = next;
        }

        self.remote_per_commitment_secrets
            .insert(revoked_index, rev.per_commitment_secret);
        self.remote_next_per_commitment_point =
            rev.next_per_commitment_point;

        let incoming_now_committed = self.newly_committed_incoming();

        let signed = std::mem::take(&mut self.changes.local_signed);
        self.changes.local_acked.extend(signed);
        self.changes.remote_signed.clear();

        let failed = std::mem::take(&mut self.pending_failed);
        Ok(RevocationOutcome {
            failed,
            incoming: incoming_now_committed,
        })
    }

    /// Incoming HTLCs now present in both commitments that the payment
    /// layer hasn't seen yet.
    fn newly_committed_incoming(&mut self) -> Vec<UpdateAddHtlc> {
        let in_remote = |id: u64| {
            self.latest()
                .remote_commit
                .spec
                .find(HtlcDirection::Incoming, id)
                .is_some()
        };
        let fresh = self
            .latest()
            .local_commit
            .spec
            .htlcs
            .iter()
            .filter(|htlc| {
                htlc.direction == HtlcDirection::Incoming
                    && htlc.add.id >= self.next_incoming_dispatch_id
                    && in_remote(htlc.add.id)
            })
            .map(|htlc| htlc.add.clone())
            .collect::<Vec<_>>();
        if let Some(max_id) = fresh.iter().map(|add| add.id).max() {
            self.next_incoming_dispatch_id = max_id + 1;
        }
        fresh
    }

    // --- Splice bookkeeping --- //

    /// Add a freshly negotiated splice funding as the new latest
    /// commitment; the previous actives stay until the new one locks.
    pub fn add_active(&mut self, commitment: Commitment) {
        self.active.insert(0, commitment);
    }

    /// The splice funding `txid` reached `min_depth` and both sides
    /// exchanged `splice_locked`: deactivate everything older.
    pub fn lock_splice(&mut self, txid: Txid) -> Result<(), ChannelError> {
        let position = self
            .active
            .iter()
            .position(|commitment| commitment.funding_txid == txid)
            .ok_or(ChannelError::UnknownSpendingTx { txid })?;
        let older = self.active.split_off(position + 1);
        self.inactive.extend(older);
        Ok(())
    }

    /// All wallet inputs referenced by any known funding tx, confirmed or
    /// not. Used by the swap-in manager to avoid double-commitment.
    pub fn funding_inputs(&self) -> Vec<OutPoint> {
        self.all()
            .filter_map(|commitment| match &commitment.funding_status {
                FundingStatus::Unconfirmed { tx: Some(tx) } => Some(
                    tx.input
                        .iter()
                        .map(|input| input.previous_output)
                        .collect::<Vec<_>>(),
                ),
                _ => None,
            })
            .flatten()
            .collect()
    }
}

// --- Spec application --- //

/// Apply buffered changes to a spec: adds first (both sides), then
/// settlements, so a settlement in the same batch as its add resolves.
pub fn apply_changes(
    spec: &CommitmentSpec,
    ours: Vec<UpdateMsg>,
    theirs: Vec<UpdateMsg>,
) -> CommitmentSpec {
    fn settle(
        next: &mut CommitmentSpec,
        id: u64,
        settled_by_us: bool,
        fulfilled: bool,
    ) {
        // We settle incoming HTLCs; they settle our outgoing ones.
        let direction = if settled_by_us {
            HtlcDirection::Incoming
        } else {
            HtlcDirection::Outgoing
        };
        if let Some(position) = next
            .htlcs
            .iter()
            .position(|h| h.direction == direction && h.add.id == id)
        {
            let htlc = next.htlcs.remove(position);
            // A fulfill credits the settler; a fail refunds the sender.
            let credit_local = settled_by_us == fulfilled;
            if credit_local {
                next.to_local += htlc.add.amount;
            } else {
                next.to_remote += htlc.add.amount;
            }
        }
    }

    let mut next = spec.clone();

    // Adds first, so settlements in the same batch can resolve them.
    for (msgs, direction) in [
        (&ours, HtlcDirection::Outgoing),
        (&theirs, HtlcDirection::Incoming),
    ] {
        for msg in msgs.iter() {
            if let UpdateMsg::Add(add) = msg {
                match direction {
                    HtlcDirection::Outgoing =>
                        next.to_local = next.to_local - add.amount,
                    HtlcDirection::Incoming =>
                        next.to_remote = next.to_remote - add.amount,
                }
                next.htlcs.push(DirectedHtlc {
                    direction,
                    add: add.clone(),
                });
            }
        }
    }

    for (msgs, settled_by_us) in [(&ours, true), (&theirs, false)] {
        for msg in msgs.iter() {
            match msg {
                UpdateMsg::Fulfill(m) =>
                    settle(&mut next, m.id, settled_by_us, true),
                UpdateMsg::Fail(m) =>
                    settle(&mut next, m.id, settled_by_us, false),
                UpdateMsg::FailMalformed(m) =>
                    settle(&mut next, m.id, settled_by_us, false),
                UpdateMsg::Fee(m) => next.feerate_per_kw = m.feerate_per_kw,
                UpdateMsg::Add(..) => {}
            }
        }
    }

    next
}

// --- Tx building helpers --- //

fn commit_tx_keys(
    params: &ChannelParams,
    keys: &ChannelKeys,
    secp: &Secp256k1<All>,
    for_local_owner: bool,
) -> CommitTxKeys {
    if for_local_owner {
        CommitTxKeys {
            revocation_pubkey: params.remote.revocation_basepoint,
            delayed_payment_pubkey: keys.delayed_payment_basepoint(secp),
            remote_payment_point: params.remote.payment_basepoint,
            local_htlc_pubkey: keys.htlc_basepoint(secp),
            remote_htlc_pubkey: params.remote.htlc_basepoint,
            to_self_delay: params.remote.to_self_delay,
            dust_limit_sat: params.local.dust_limit_sat,
            owner_pays_fee: params.local_is_initiator,
        }
    } else {
        CommitTxKeys {
            revocation_pubkey: keys.revocation_basepoint(secp),
            delayed_payment_pubkey: params.remote.delayed_payment_basepoint,
            remote_payment_point: keys.payment_point(secp),
            local_htlc_pubkey: params.remote.htlc_basepoint,
            remote_htlc_pubkey: keys.htlc_basepoint(secp),
            to_self_delay: params.local.to_self_delay,
            dust_limit_sat: params.remote.dust_limit_sat,
            owner_pays_fee: !params.local_is_initiator,
        }
    }
}

/// Materialize our commitment tx for `spec`.
pub fn build_commit_tx_for_local(
    commitment: &Commitment,
    spec: &CommitmentSpec,
    params: &ChannelParams,
    keys: &ChannelKeys,
    secp: &Secp256k1<All>,
    _index: u64,
) -> Transaction {
    let tx_keys = commit_tx_keys(params, keys, secp, true);
    scripts::commit_tx(commitment.funding_outpoint(), spec, &tx_keys)
}

/// Materialize the remote's commitment tx for `spec` (our view; mirrored
/// internally).
pub fn build_commit_tx_for_remote(
    commitment: &Commitment,
    spec: &CommitmentSpec,
    params: &ChannelParams,
    keys: &ChannelKeys,
    secp: &Secp256k1<All>,
) -> Transaction {
    let tx_keys = commit_tx_keys(params, keys, secp, false);
    scripts::commit_tx(
        commitment.funding_outpoint(),
        &spec.mirrored(),
        &tx_keys,
    )
}

/// BIP 143 sighash of a commitment tx's funding input.
pub(crate) fn funding_sighash(
    tx: &Transaction,
    commitment: &Commitment,
    params: &ChannelParams,
    keys: &ChannelKeys,
    secp: &Secp256k1<All>,
) -> Result<[u8; 32], ChannelError> {
    let script = scripts::funding_script(
        &keys.funding_pubkey(secp),
        &params.remote.funding_pubkey,
    );
    let mut cache = SighashCache::new(tx);
    let sighash = cache
        .p2wsh_signature_hash(
            0,
            &script,
            SatAmount::from_sat(commitment.funding_amount.sats_floor()),
            EcdsaSighashType::All,
        )
        .map_err(|_| ChannelError::InvalidCommitmentSignature {
            commit_number: commitment.local_commit.index,
        })?;
    Ok(sighash.to_byte_array())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::channel::test_support::{fixture, peer_fixture};
    use crate::wire::OnionPacket;

    fn add_spec(amount_msat: u64, preimage: [u8; 32]) -> AddHtlcSpec {
        AddHtlcSpec {
            amount: Amount::from_msat(amount_msat),
            payment_hash: sha256::Hash::hash(&preimage).to_byte_array(),
            cltv_expiry: 700_500,
            onion: OnionPacket(vec![]),
            payment_id: PaymentId([1; 16]),
            part_id: PartId([2; 16]),
        }
    }

    #[test]
    fn balances_always_sum_to_funding() {
        let (mut local, _keys, secp) = fixture();
        let funding = local.latest().funding_amount;
        assert_eq!(local.latest().local_commit.spec.total(), funding);

        local.send_add(&add_spec(10_000_000, [1; 32]), 700_000).unwrap();
        assert_eq!(local.projected_spec().total(), funding);
        let _ = secp;
    }

    #[test]
    fn full_sign_revoke_round_trip() {
        let ((mut local, local_keys), (mut remote, remote_keys), secp) =
            peer_fixture();

        // Local adds an HTLC and signs.
        let add = local
            .send_add(&add_spec(10_000_000, [3; 32]), 700_000)
            .unwrap();
        remote.receive_add(add).unwrap();
        let sigs = local.send_commit(&local_keys, &secp).unwrap();
        assert_eq!(sigs.len(), 1);

        // Remote validates, revokes, and signs back.
        let rev = remote
            .receive_commit(&sigs, &remote_keys, &secp)
            .unwrap();
        local.receive_revocation(&rev, &secp).unwrap();

        let sigs_back = remote.send_commit(&remote_keys, &secp).unwrap();
        let rev_back = local
            .receive_commit(&sigs_back, &local_keys, &secp)
            .unwrap();
        remote.receive_revocation(&rev_back, &secp).unwrap();

        // Both sides now have the HTLC in both commitments with matching
        // ids, and indices advanced monotonically.
        assert_eq!(local.local_commit_index(), 1);
        assert_eq!(local.remote_commit_index(), 1);
        assert_eq!(
            local.latest().local_commit.spec.htlcs.len(),
            1,
        );
        assert_eq!(
            remote.latest().local_commit.spec.htlcs.len(),
            1,
        );
        assert_eq!(
            local.latest().local_commit.spec.total(),
            local.latest().funding_amount,
        );
    }

    #[test]
    fn cannot_sign_twice_without_revocation() {
        let ((mut local, local_keys), (mut remote, _), secp) =
            peer_fixture();
        let add = local
            .send_add(&add_spec(10_000_000, [4; 32]), 700_000)
            .unwrap();
        remote.receive_add(add).unwrap();
        local.send_commit(&local_keys, &secp).unwrap();
        // A second add+sign before the revocation must be refused.
        local.send_add(&add_spec(5_000_000, [5; 32]), 700_000).unwrap();
        assert_eq!(
            local.send_commit(&local_keys, &secp),
            Err(ChannelError::UnrevokedCommitment),
        );
    }

    #[test]
    fn sign_without_changes_is_rejected() {
        let ((mut local, local_keys), _, secp) = peer_fixture();
        assert_eq!(
            local.send_commit(&local_keys, &secp),
            Err(ChannelError::NoChangesToSign),
        );
    }

    #[test]
    fn add_rejects_insufficient_funds_and_limits() {
        let (mut local, _keys, _secp) = fixture();
        // Way more than the channel holds.
        let err = local
            .send_add(&add_spec(10_000_000_000, [6; 32]), 700_000)
            .unwrap_err();
        assert!(matches!(err, ChannelError::InsufficientFunds { .. }));

        // Expiry too close to the tip.
        let mut spec = add_spec(1_000_000, [7; 32]);
        spec.cltv_expiry = 700_001;
        let err = local.send_add(&spec, 700_000).unwrap_err();
        assert!(matches!(err, ChannelError::ExpiryTooSoon { .. }));
    }

    #[test]
    fn fulfill_requires_matching_preimage() {
        let ((mut local, local_keys), (mut remote, remote_keys), secp) =
            peer_fixture();
        let preimage = [8; 32];
        let add = local
            .send_add(&add_spec(10_000_000, preimage), 700_000)
            .unwrap();
        remote.receive_add(add).unwrap();
        let sigs = local.send_commit(&local_keys, &secp).unwrap();
        let rev = remote
            .receive_commit(&sigs, &remote_keys, &secp)
            .unwrap();
        local.receive_revocation(&rev, &secp).unwrap();
        let sigs_back = remote.send_commit(&remote_keys, &secp).unwrap();
        let rev_back = local
            .receive_commit(&sigs_back, &local_keys, &secp)
            .unwrap();
        remote.receive_revocation(&rev_back, &secp).unwrap();

        // The incoming side fulfills with the right preimage only.
        assert!(matches!(
            remote.send_fulfill(0, [9; 32]),
            Err(ChannelError::InvalidHtlcPreimage { id: 0 }),
        ));
        let fulfill = remote.send_fulfill(0, preimage).unwrap();
        let (origin, amount) = local.receive_fulfill(&fulfill).unwrap();
        assert_eq!(origin.payment_id, PaymentId([1; 16]));
        assert_eq!(amount, Amount::from_msat(10_000_000));

        // Double-settlement is refused.
        assert!(matches!(
            remote.send_fulfill(0, preimage),
            Err(ChannelError::HtlcAlreadyResolved { id: 0 }),
        ));
    }
}
