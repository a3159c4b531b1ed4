//! The interactive transaction construction protocol used by dual funding
//! and splicing: both sides contribute inputs and outputs in alternating
//! `tx_add_input` / `tx_add_output` / `tx_complete` turns, then exchange
//! `commitment_signed` and `tx_signatures`.
//!
//! Serial-id parity partitions the namespace: the initiator uses even
//! serial ids, the non-initiator odd ones. Signatures for local inputs are
//! withheld until the peer's `commitment_signed` has been validated.

use std::collections::VecDeque;

use bitcoin::{
    absolute::LockTime, transaction::Version, Amount as SatAmount, OutPoint,
    ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness,
};
use serde::{Deserialize, Serialize};

use super::{ChannelError, ChannelId, WalletInput};
use crate::{
    keys::KeyManager,
    wire::{
        LightningMessage, TxAddInput, TxAddOutput, TxComplete, TxSignatures,
    },
};

/// Sequence used for interactive-tx inputs (RBF-signaling).
const INPUT_SEQUENCE: u32 = 0xffff_fffd;

/// The previous funding output spent by a splice.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct SharedInput {
    pub outpoint: OutPoint,
    pub amount_sat: u64,
}

/// Fixed parameters of one interactive-tx session.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InteractiveTxParams {
    pub channel_id: ChannelId,
    pub is_initiator: bool,
    /// The value the shared funding output must carry.
    pub funding_amount_sat: u64,
    pub funding_script: ScriptBuf,
    pub target_feerate_per_kw: u32,
    pub lock_time: u32,
    /// Present when splicing: the old funding output being replaced.
    pub shared_input: Option<SharedInput>,
}

/// One queued local contribution.
#[derive(Clone, Debug, Serialize, Deserialize)]
enum Contribution {
    Input(TxAddInput),
    Output(TxAddOutput),
}

/// The unsigned funding transaction produced by a completed session.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BuiltFundingTx {
    pub channel_id: ChannelId,
    pub tx: Transaction,
    pub funding_output_index: u32,
    /// Indices (into `tx.input`) of the wallet inputs we must sign.
    pub local_input_indices: Vec<usize>,
    pub local_inputs: Vec<TxAddInput>,
}

impl BuiltFundingTx {
    pub fn txid(&self) -> bitcoin::Txid {
        self.tx.compute_txid()
    }

    /// Sign our wallet inputs. Called only after the peer's
    /// `commitment_signed` validated.
    pub fn sign_local_inputs(
        &self,
        keys: &dyn KeyManager,
    ) -> anyhow::Result<TxSignatures> {
        let mut witnesses = Vec::with_capacity(self.local_input_indices.len());
        for (position, input_index) in
            self.local_input_indices.iter().enumerate()
        {
            let add = &self.local_inputs[position];
            let prev_output = add
                .prev_tx
                .output
                .get(add.prev_tx_vout as usize)
                .ok_or_else(|| {
                    anyhow::anyhow!("prev tx missing vout {}", add.prev_tx_vout)
                })?;
            let witness =
                keys.sign_wallet_input(&self.tx, *input_index, prev_output)?;
            witnesses.push(witness);
        }
        Ok(TxSignatures {
            channel_id: self.channel_id,
            txid: self.txid(),
            witnesses,
        })
    }

    /// Merge our witnesses and the peer's into the final tx.
    pub fn apply_signatures(
        &self,
        ours: &TxSignatures,
        theirs: &TxSignatures,
        remote_input_indices: &[usize],
    ) -> Result<Transaction, ChannelError> {
        if theirs.witnesses.len() != remote_input_indices.len() {
            return Err(ChannelError::InteractiveTx(
                "wrong number of remote witnesses",
            ));
        }
        let mut tx = self.tx.clone();
        for (witness, input_index) in
            ours.witnesses.iter().zip(self.local_input_indices.iter())
        {
            tx.input[*input_index].witness = witness.clone();
        }
        for (witness, input_index) in
            theirs.witnesses.iter().zip(remote_input_indices.iter())
        {
            tx.input[*input_index].witness = witness.clone();
        }
        Ok(tx)
    }
}

/// What a protocol step produced.
#[derive(Debug)]
pub struct StepResult {
    pub messages: Vec<LightningMessage>,
    pub built: Option<BuiltFundingTx>,
}

/// An in-progress interactive-tx session.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InteractiveTxSession {
    pub params: InteractiveTxParams,
    to_send: VecDeque<Contribution>,
    local_inputs: Vec<TxAddInput>,
    local_outputs: Vec<TxAddOutput>,
    remote_inputs: Vec<TxAddInput>,
    remote_outputs: Vec<TxAddOutput>,
    local_complete: bool,
    remote_complete: bool,
}

impl InteractiveTxSession {
    /// Queue our contributions: wallet inputs, the shared funding output
    /// (initiator only), and any extra outputs (splice-out).
    pub fn new(
        params: InteractiveTxParams,
        wallet_inputs: &[WalletInput],
        extra_outputs: Vec<TxOut>,
    ) -> Self {
        let parity = if params.is_initiator { 0 } else { 1 };
        let mut next_serial = parity;
        let mut serial = || {
            let current = next_serial;
            next_serial += 2;
            current
        };

        let mut to_send = VecDeque::new();
        for input in wallet_inputs {
            to_send.push_back(Contribution::Input(TxAddInput {
                channel_id: params.channel_id,
                serial_id: serial(),
                prev_tx: input.parent_tx.clone(),
                prev_tx_vout: input.outpoint.vout,
                sequence: INPUT_SEQUENCE,
            }));
        }
        if params.is_initiator {
            to_send.push_back(Contribution::Output(TxAddOutput {
                channel_id: params.channel_id,
                serial_id: serial(),
                amount_sat: params.funding_amount_sat,
                script_pubkey: params.funding_script.clone(),
            }));
        }
        for output in extra_outputs {
            to_send.push_back(Contribution::Output(TxAddOutput {
                channel_id: params.channel_id,
                serial_id: serial(),
                amount_sat: output.value.to_sat(),
                script_pubkey: output.script_pubkey,
            }));
        }

        Self {
            params,
            to_send,
            local_inputs: vec![],
            local_outputs: vec![],
            remote_inputs: vec![],
            remote_outputs: vec![],
            local_complete: false,
            remote_complete: false,
        }
    }

    /// The initiator speaks first.
    pub fn start(&mut self) -> LightningMessage {
        debug_assert!(self.params.is_initiator);
        self.next_message()
    }

    /// Outpoints of the wallet inputs we have queued or sent, to unlock on
    /// abort.
    pub fn local_input_outpoints(&self) -> Vec<OutPoint> {
        let sent = self.local_inputs.iter();
        let queued = self.to_send.iter().filter_map(|c| match c {
            Contribution::Input(input) => Some(input),
            Contribution::Output(..) => None,
        });
        sent.chain(queued)
            .map(|input| {
                OutPoint::new(
                    input.prev_tx.compute_txid(),
                    input.prev_tx_vout,
                )
            })
            .collect()
    }

    fn next_message(&mut self) -> LightningMessage {
        match self.to_send.pop_front() {
            Some(Contribution::Input(input)) => {
                self.local_inputs.push(input.clone());
                LightningMessage::TxAddInput(input)
            }
            Some(Contribution::Output(output)) => {
                self.local_outputs.push(output.clone());
                LightningMessage::TxAddOutput(output)
            }
            None => {
                self.local_complete = true;
                LightningMessage::TxComplete(TxComplete {
                    channel_id: self.params.channel_id,
                })
            }
        }
    }

    fn check_remote_serial(&self, serial_id: u64) -> Result<(), ChannelError> {
        let expected_parity = if self.params.is_initiator { 1 } else { 0 };
        if serial_id % 2 != expected_parity {
            return Err(ChannelError::InteractiveTx("wrong serial parity"));
        }
        let duplicate = self
            .remote_inputs
            .iter()
            .map(|i| i.serial_id)
            .chain(self.remote_outputs.iter().map(|o| o.serial_id))
            .any(|existing| existing == serial_id);
        if duplicate {
            return Err(ChannelError::InteractiveTx("duplicate serial id"));
        }
        Ok(())
    }

    /// Process one peer message and take our turn. `tx_complete` must be
    /// re-sent whenever the peer keeps contributing after ours.
    pub fn receive(
        &mut self,
        msg: &LightningMessage,
    ) -> Result<StepResult, ChannelError> {
        let mut respond = true;
        match msg {
            LightningMessage::TxAddInput(input) => {
                self.check_remote_serial(input.serial_id)?;
                if input.prev_tx.output.get(input.prev_tx_vout as usize).is_none()
                {
                    return Err(ChannelError::InteractiveTx(
                        "input vout out of range",
                    ));
                }
                self.remote_complete = false;
                self.remote_inputs.push(input.clone());
            }
            LightningMessage::TxAddOutput(output) => {
                self.check_remote_serial(output.serial_id)?;
                self.remote_complete = false;
                self.remote_outputs.push(output.clone());
            }
            LightningMessage::TxRemoveInput(remove) => {
                self.remote_complete = false;
                self.remote_inputs
                    .retain(|input| input.serial_id != remove.serial_id);
            }
            LightningMessage::TxRemoveOutput(remove) => {
                self.remote_complete = false;
                self.remote_outputs
                    .retain(|output| output.serial_id != remove.serial_id);
            }
            LightningMessage::TxComplete(..) => {
                self.remote_complete = true;
                respond = !self.local_complete;
            }
            _ =>
                return Err(ChannelError::InteractiveTx(
                    "unexpected message in interactive session",
                )),
        }

        let mut messages = Vec::new();
        if respond {
            messages.push(self.next_message());
        }

        let built = if self.local_complete && self.remote_complete {
            Some(self.build()?)
        } else {
            None
        };
        Ok(StepResult { messages, built })
    }

    /// Assemble the unsigned funding tx, inputs and outputs ordered by
    /// serial id, and locate the shared funding output.
    fn build(&self) -> Result<BuiltFundingTx, ChannelError> {
        let mut inputs: Vec<(u64, bool, TxIn, Option<usize>)> = Vec::new();

        // The shared (previous funding) input of a splice spends with the
        // lowest possible priority so it always sorts first.
        if let Some(shared) = &self.params.shared_input {
            inputs.push((
                0,
                false,
                TxIn {
                    previous_output: shared.outpoint,
                    script_sig: ScriptBuf::new(),
                    sequence: Sequence(INPUT_SEQUENCE),
                    witness: Witness::new(),
                },
                None,
            ));
        }

        for (position, input) in self.local_inputs.iter().enumerate() {
            inputs.push((
                input.serial_id + 1,
                true,
                TxIn {
                    previous_output: OutPoint::new(
                        input.prev_tx.compute_txid(),
                        input.prev_tx_vout,
                    ),
                    script_sig: ScriptBuf::new(),
                    sequence: Sequence(input.sequence),
                    witness: Witness::new(),
                },
                Some(position),
            ));
        }
        for input in &self.remote_inputs {
            inputs.push((
                input.serial_id + 1,
                false,
                TxIn {
                    previous_output: OutPoint::new(
                        input.prev_tx.compute_txid(),
                        input.prev_tx_vout,
                    ),
                    script_sig: ScriptBuf::new(),
                    sequence: Sequence(input.sequence),
                    witness: Witness::new(),
                },
                None,
            ));
        }
        inputs.sort_by_key(|(sort_key, ..)| *sort_key);

        let mut outputs = self
            .local_outputs
            .iter()
            .chain(self.remote_outputs.iter())
            .map(|output| {
                (
                    output.serial_id,
                    TxOut {
                        value: SatAmount::from_sat(output.amount_sat),
                        script_pubkey: output.script_pubkey.clone(),
                    },
                )
            })
            .collect::<Vec<_>>();
        outputs.sort_by_key(|(serial_id, _)| *serial_id);

        let funding_output_index = outputs
            .iter()
            .position(|(_, output)| {
                output.script_pubkey == self.params.funding_script
                    && output.value.to_sat() == self.params.funding_amount_sat
            })
            .ok_or(ChannelError::InteractiveTx(
                "shared funding output missing",
            ))? as u32;

        let local_input_indices = inputs
            .iter()
            .enumerate()
            .filter_map(|(tx_index, (_, is_local, ..))| {
                is_local.then_some(tx_index)
            })
            .collect();

        let tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::from_consensus(self.params.lock_time),
            input: inputs.into_iter().map(|(_, _, txin, _)| txin).collect(),
            output: outputs.into_iter().map(|(_, txout)| txout).collect(),
        };

        Ok(BuiltFundingTx {
            channel_id: self.params.channel_id,
            tx,
            funding_output_index,
            local_input_indices,
            local_inputs: self.local_inputs.clone(),
        })
    }

    /// Indices (into the built tx) of the remote's inputs, for witness
    /// application.
    pub fn remote_input_indices(
        &self,
        built: &BuiltFundingTx,
    ) -> Vec<usize> {
        let shared = self
            .params
            .shared_input
            .as_ref()
            .map(|shared| shared.outpoint);
        built
            .tx
            .input
            .iter()
            .enumerate()
            .filter_map(|(tx_index, input)| {
                let is_local =
                    built.local_input_indices.contains(&tx_index);
                let is_shared = shared == Some(input.previous_output);
                (!is_local && !is_shared).then_some(tx_index)
            })
            .collect()
    }
}

#[cfg(test)]
mod test {
    use bitcoin::hashes::Hash;
    use common::amount::Amount;

    use super::*;
    use crate::channel::scripts;
    use crate::keys::SeedKeyManager;

    fn wallet_input(value_sat: u64) -> WalletInput {
        // A parent tx with a single output owned by the wallet.
        let parent = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::new(
                    bitcoin::Txid::from_byte_array([0x21; 32]),
                    0,
                ),
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: vec![TxOut {
                value: SatAmount::from_sat(value_sat),
                script_pubkey: ScriptBuf::new(),
            }],
        };
        WalletInput {
            outpoint: OutPoint::new(parent.compute_txid(), 0),
            amount: Amount::from_sat(value_sat),
            parent_tx: parent,
        }
    }

    fn params(is_initiator: bool, funding_script: ScriptBuf) -> InteractiveTxParams {
        InteractiveTxParams {
            channel_id: ChannelId([5; 32]),
            is_initiator,
            funding_amount_sat: 150_000,
            funding_script,
            target_feerate_per_kw: 2_500,
            lock_time: 0,
            shared_input: None,
        }
    }

    #[test]
    fn full_session_builds_identical_txs() {
        let km = SeedKeyManager::new([3; 32]);
        let secp = bitcoin::secp256k1::Secp256k1::new();
        let keys = crate::keys::KeyManager::channel_keys(&km, 0);
        let funding_script = scripts::funding_script(
            &keys.funding_pubkey(&secp),
            &keys.htlc_basepoint(&secp),
        );

        let mut initiator = InteractiveTxSession::new(
            params(true, funding_script.clone()),
            &[wallet_input(200_000)],
            vec![],
        );
        let mut other = InteractiveTxSession::new(
            params(false, funding_script),
            &[],
            vec![],
        );

        // Ping-pong messages between the two sessions until both build.
        let mut to_other = vec![initiator.start()];
        let mut to_initiator: Vec<LightningMessage> = vec![];
        let mut built_initiator = None;
        let mut built_other = None;
        for _ in 0..10 {
            if built_initiator.is_some() && built_other.is_some() {
                break;
            }
            for msg in std::mem::take(&mut to_other) {
                let step = other.receive(&msg).unwrap();
                if let Some(built) = step.built {
                    built_other = Some(built);
                }
                to_initiator.extend(step.messages);
            }
            for msg in std::mem::take(&mut to_initiator) {
                let step = initiator.receive(&msg).unwrap();
                if let Some(built) = step.built {
                    built_initiator = Some(built);
                }
                to_other.extend(step.messages);
            }
        }

        let built_initiator = built_initiator.expect("initiator built");
        let built_other = built_other.expect("other side built");
        assert_eq!(built_initiator.txid(), built_other.txid());
        assert_eq!(
            built_initiator.funding_output_index,
            built_other.funding_output_index,
        );
        // The initiator contributed the only wallet input.
        assert_eq!(built_initiator.local_input_indices.len(), 1);
        assert!(built_other.local_input_indices.is_empty());
        // Both sides agree on which inputs are the remote's.
        assert_eq!(
            other.remote_input_indices(&built_other),
            built_initiator.local_input_indices,
        );
    }

    #[test]
    fn rejects_wrong_parity_and_duplicates() {
        let mut session = InteractiveTxSession::new(
            params(false, ScriptBuf::new()),
            &[],
            vec![],
        );
        // Remote is the initiator here, so must use even serials.
        let bad = LightningMessage::TxAddOutput(TxAddOutput {
            channel_id: ChannelId([5; 32]),
            serial_id: 3,
            amount_sat: 1,
            script_pubkey: ScriptBuf::new(),
        });
        assert!(matches!(
            session.receive(&bad),
            Err(ChannelError::InteractiveTx("wrong serial parity")),
        ));

        let good = LightningMessage::TxAddOutput(TxAddOutput {
            channel_id: ChannelId([5; 32]),
            serial_id: 2,
            amount_sat: 1,
            script_pubkey: ScriptBuf::new(),
        });
        session.receive(&good).unwrap();
        assert!(matches!(
            session.receive(&good),
            Err(ChannelError::InteractiveTx("duplicate serial id")),
        ));
    }
}
