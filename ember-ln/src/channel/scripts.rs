//! Commitment transaction construction: a compact subset of the BOLT 3
//! output scripts, deterministic output ordering, and weight-based fees.

use bitcoin::{
    absolute::LockTime,
    hashes::{hash160, Hash},
    opcodes::all as op,
    script::Builder,
    secp256k1::PublicKey,
    transaction::Version,
    Amount as SatAmount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn,
    TxOut, Witness,
};
use super::commitments::{CommitmentSpec, HtlcDirection};

/// Base weight of a commitment tx without HTLC outputs.
pub const COMMIT_WEIGHT: u64 = 724;

/// Additional weight per HTLC output.
pub const HTLC_OUTPUT_WEIGHT: u64 = 172;

/// Weight of a keyed (p2wpkh) input, used for funding fee computation.
pub const P2WPKH_INPUT_WEIGHT: u64 = 272;

/// `fee = feerate_per_kw * weight / 1000`, in satoshis.
pub fn weight_to_fee_sat(feerate_per_kw: u32, weight: u64) -> u64 {
    u64::from(feerate_per_kw) * weight / 1_000
}

/// Fee of a commitment tx carrying `num_htlcs` untrimmed HTLC outputs.
pub fn commit_fee_sat(feerate_per_kw: u32, num_htlcs: usize) -> u64 {
    let weight = COMMIT_WEIGHT + HTLC_OUTPUT_WEIGHT * num_htlcs as u64;
    weight_to_fee_sat(feerate_per_kw, weight)
}

/// The 2-of-2 multisig locking a channel's funding output, keys sorted
/// lexicographically.
pub fn funding_script(
    local_funding_pubkey: &PublicKey,
    remote_funding_pubkey: &PublicKey,
) -> ScriptBuf {
    let local = local_funding_pubkey.serialize();
    let remote = remote_funding_pubkey.serialize();
    let (first, second) = if local <= remote {
        (local, remote)
    } else {
        (remote, local)
    };
    let multisig = Builder::new()
        .push_opcode(op::OP_PUSHNUM_2)
        .push_slice(first)
        .push_slice(second)
        .push_opcode(op::OP_PUSHNUM_2)
        .push_opcode(op::OP_CHECKMULTISIG)
        .into_script();
    ScriptBuf::new_p2wsh(&multisig.wscript_hash())
}

/// The delayed, revocable `to_local` output script.
pub fn to_local_script(
    revocation_pubkey: &PublicKey,
    to_self_delay: u16,
    delayed_payment_pubkey: &PublicKey,
) -> ScriptBuf {
    Builder::new()
        .push_opcode(op::OP_IF)
        .push_slice(revocation_pubkey.serialize())
        .push_opcode(op::OP_ELSE)
        .push_int(i64::from(to_self_delay))
        .push_opcode(op::OP_CSV)
        .push_opcode(op::OP_DROP)
        .push_slice(delayed_payment_pubkey.serialize())
        .push_opcode(op::OP_ENDIF)
        .push_opcode(op::OP_CHECKSIG)
        .into_script()
}

/// The immediately-spendable `to_remote` output: p2wpkh to the payment
/// point.
pub fn to_remote_script(payment_point: &PublicKey) -> ScriptBuf {
    let hash = hash160::Hash::hash(&payment_point.serialize());
    ScriptBuf::new_p2wpkh(&bitcoin::WPubkeyHash::from_byte_array(
        hash.to_byte_array(),
    ))
}

/// A hash-locked HTLC output script. Offered and received HTLCs share this
/// compact form: claimable by the holder of the preimage or, after the
/// expiry, by the other side; always revocable.
pub fn htlc_script(
    revocation_pubkey: &PublicKey,
    local_htlc_pubkey: &PublicKey,
    remote_htlc_pubkey: &PublicKey,
    payment_hash: &[u8; 32],
    cltv_expiry: u32,
) -> ScriptBuf {
    let ripemd_of_hash =
        bitcoin::hashes::ripemd160::Hash::hash(payment_hash);
    Builder::new()
        .push_opcode(op::OP_IF)
        .push_slice(revocation_pubkey.serialize())
        .push_opcode(op::OP_CHECKSIG)
        .push_opcode(op::OP_ELSE)
        .push_opcode(op::OP_HASH160)
        .push_slice(ripemd_of_hash.to_byte_array())
        .push_opcode(op::OP_EQUAL)
        .push_opcode(op::OP_IF)
        .push_slice(remote_htlc_pubkey.serialize())
        .push_opcode(op::OP_ELSE)
        .push_int(i64::from(cltv_expiry))
        .push_opcode(op::OP_CLTV)
        .push_opcode(op::OP_DROP)
        .push_slice(local_htlc_pubkey.serialize())
        .push_opcode(op::OP_ENDIF)
        .push_opcode(op::OP_CHECKSIG)
        .push_opcode(op::OP_ENDIF)
        .into_script()
}

/// Keys needed to materialize one side's commitment transaction.
pub struct CommitTxKeys {
    pub revocation_pubkey: PublicKey,
    pub delayed_payment_pubkey: PublicKey,
    pub remote_payment_point: PublicKey,
    pub local_htlc_pubkey: PublicKey,
    pub remote_htlc_pubkey: PublicKey,
    pub to_self_delay: u16,
    pub dust_limit_sat: u64,
    /// Whether the spec owner pays the commit fee (the funder does).
    pub owner_pays_fee: bool,
}

/// Build a commitment transaction for the owner of `spec` (`to_local` is
/// the owner's balance). Dust outputs are trimmed; outputs are sorted
/// deterministically by `(value, script)`.
pub fn commit_tx(
    funding_outpoint: OutPoint,
    spec: &CommitmentSpec,
    keys: &CommitTxKeys,
) -> Transaction {
    let untrimmed_htlcs = spec
        .htlcs
        .iter()
        .filter(|htlc| htlc.add.amount.sats_floor() >= keys.dust_limit_sat)
        .collect::<Vec<_>>();
    let fee_sat = commit_fee_sat(spec.feerate_per_kw, untrimmed_htlcs.len());

    let mut to_local_sat = spec.to_local.sats_floor();
    let mut to_remote_sat = spec.to_remote.sats_floor();
    if keys.owner_pays_fee {
        to_local_sat = to_local_sat.saturating_sub(fee_sat);
    } else {
        to_remote_sat = to_remote_sat.saturating_sub(fee_sat);
    }

    let mut outputs = Vec::new();
    if to_local_sat >= keys.dust_limit_sat {
        let script = to_local_script(
            &keys.revocation_pubkey,
            keys.to_self_delay,
            &keys.delayed_payment_pubkey,
        );
        outputs.push(TxOut {
            value: SatAmount::from_sat(to_local_sat),
            script_pubkey: ScriptBuf::new_p2wsh(&script.wscript_hash()),
        });
    }
    if to_remote_sat >= keys.dust_limit_sat {
        outputs.push(TxOut {
            value: SatAmount::from_sat(to_remote_sat),
            script_pubkey: to_remote_script(&keys.remote_payment_point),
        });
    }
    for htlc in untrimmed_htlcs {
        // From the owner's perspective, outgoing HTLCs are claimable by the
        // remote with the preimage; incoming are claimable by the owner.
        let (local_key, remote_key) = match htlc.direction {
            HtlcDirection::Outgoing =>
                (&keys.local_htlc_pubkey, &keys.remote_htlc_pubkey),
            HtlcDirection::Incoming =>
                (&keys.remote_htlc_pubkey, &keys.local_htlc_pubkey),
        };
        let script = htlc_script(
            &keys.revocation_pubkey,
            local_key,
            remote_key,
            &htlc.add.payment_hash,
            htlc.add.cltv_expiry,
        );
        outputs.push(TxOut {
            value: SatAmount::from_sat(htlc.add.amount.sats_floor()),
            script_pubkey: ScriptBuf::new_p2wsh(&script.wscript_hash()),
        });
    }

    outputs.sort_by(|a, b| {
        a.value
            .cmp(&b.value)
            .then_with(|| a.script_pubkey.cmp(&b.script_pubkey))
    });

    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: funding_outpoint,
            script_sig: ScriptBuf::new(),
            sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
            witness: Witness::new(),
        }],
        output: outputs,
    }
}

/// Build the penalty transaction claiming every output of a revoked remote
/// commitment into `claim_script`.
pub fn penalty_tx(
    revoked_commit_tx: &Transaction,
    claim_script: ScriptBuf,
    feerate_per_kw: u32,
) -> Option<Transaction> {
    let revoked_txid = revoked_commit_tx.compute_txid();
    let inputs = revoked_commit_tx
        .output
        .iter()
        .enumerate()
        .map(|(vout, _)| TxIn {
            previous_output: OutPoint::new(revoked_txid, vout as u32),
            script_sig: ScriptBuf::new(),
            sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
            witness: Witness::new(),
        })
        .collect::<Vec<_>>();
    if inputs.is_empty() {
        return None;
    }

    let total_in: u64 = revoked_commit_tx
        .output
        .iter()
        .map(|output| output.value.to_sat())
        .sum();
    // Penalty inputs are script-path spends; budget a generous weight.
    let weight = 500 + 400 * inputs.len() as u64;
    let fee_sat = weight_to_fee_sat(feerate_per_kw, weight);
    let claim_value = total_in.checked_sub(fee_sat)?;

    Some(Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: inputs,
        output: vec![TxOut {
            value: SatAmount::from_sat(claim_value),
            script_pubkey: claim_script,
        }],
    })
}
