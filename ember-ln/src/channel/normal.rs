//! The `Normal` state: HTLC add/settle/fail, commitment signing
//! round-trips, splicing, shutdown initiation, and HTLC-timeout policing.

use bitcoin::{secp256k1::Message, Txid};
use common::amount::Amount;
use tracing::{debug, info, warn};

use super::{
    command_not_valid,
    commitments::{
        build_commit_tx_for_local, build_commit_tx_for_remote,
        funding_sighash, Commitment, Commitments, FundingStatus,
        LocalCommit, RemoteCommit,
    },
    interactive_tx::{
        BuiltFundingTx, InteractiveTxParams, InteractiveTxSession,
        SharedInput,
    },
    scripts, store_action, unexpected_message, AddHtlcFailed,
    ChannelAction, ChannelCommand, ChannelContext, ChannelError,
    ChannelEvent, ChannelState, HtlcSettlement, ShortChannelId,
    SpliceRequest, WalletInput, HTLC_SAFETY_DELTA, MIN_DEPTH,
};
use crate::{
    electrum::{Watch, WatchEvent},
    payments::{OnChainPayment, PaymentId},
    wire::{
        ChannelUpdate, CommitmentSigned, LightningMessage, Shutdown,
        SpliceAck, SpliceInit, SpliceLocked, TxAbort, TxSignatures,
    },
};

/// An in-flight splice negotiation. Not persisted: on disconnect both
/// sides abandon the attempt and the wallet inputs are unlocked.
#[derive(Clone, Debug)]
pub struct SpliceSession {
    pub request: SpliceRequest,
    pub is_initiator: bool,
    /// Net change to our side, in satoshis (negative for splice-out).
    pub local_contribution_sat: i64,
    pub remote_contribution_sat: i64,
    /// `None` until `splice_ack` establishes the interactive round.
    pub session: Option<InteractiveTxSession>,
    pub built: Option<BuiltFundingTx>,
    pub new_commitment: Option<Commitment>,
    pub remote_commit_sig_received: bool,
    pub local_sigs: Option<TxSignatures>,
    pub remote_sigs: Option<TxSignatures>,
}

impl SpliceSession {
    pub fn local_input_outpoints(&self) -> Vec<bitcoin::OutPoint> {
        match &self.session {
            Some(session) => session.local_input_outpoints(),
            None => self
                .request
                .splice_in
                .as_ref()
                .map(|splice_in| {
                    splice_in
                        .wallet_inputs
                        .iter()
                        .map(|input| input.outpoint)
                        .collect()
                })
                .unwrap_or_default(),
        }
    }

    fn wallet_inputs(&self) -> Vec<WalletInput> {
        self.request
            .splice_in
            .as_ref()
            .map(|splice_in| splice_in.wallet_inputs.clone())
            .unwrap_or_default()
    }
}

/// Everything `Normal` carries beyond the commitments.
#[derive(Clone, Debug)]
pub struct NormalData {
    pub commitments: Commitments,
    pub short_channel_id: ShortChannelId,
    pub remote_channel_update: Option<ChannelUpdate>,
    pub splice_session: Option<SpliceSession>,
    pub local_shutdown_sent: Option<Shutdown>,
    /// `splice_locked` txid received before our own confirmation.
    pub their_splice_locked: Option<Txid>,
}

pub(super) fn process(
    mut data: NormalData,
    cmd: ChannelCommand,
    ctx: &ChannelContext<'_>,
) -> (ChannelState, Vec<ChannelAction>) {
    match cmd {
        ChannelCommand::AddHtlc(spec) => {
            if data.local_shutdown_sent.is_some() {
                let failed = AddHtlcFailed {
                    channel_id: data.commitments.params.channel_id,
                    payment_id: spec.payment_id,
                    part_id: spec.part_id,
                    reason: ChannelError::CommandNotValid {
                        state: "ShuttingDown",
                        command: "AddHtlc",
                    },
                };
                return (
                    ChannelState::Normal(data),
                    vec![ChannelAction::AddFailed(failed)],
                );
            }
            match data.commitments.send_add(&spec, ctx.block_height) {
                Ok(add) => {
                    let state = ChannelState::Normal(data);
                    let mut actions = vec![ChannelAction::SendMessage(
                        LightningMessage::UpdateAddHtlc(add),
                    )];
                    actions.extend(store_action(&state));
                    (state, actions)
                }
                Err(reason) => {
                    debug!("add htlc rejected locally: {reason}");
                    let failed = AddHtlcFailed {
                        channel_id: data.commitments.params.channel_id,
                        payment_id: spec.payment_id,
                        part_id: spec.part_id,
                        reason,
                    };
                    (
                        ChannelState::Normal(data),
                        vec![ChannelAction::AddFailed(failed)],
                    )
                }
            }
        }

        ChannelCommand::FulfillHtlc {
            id,
            preimage,
            commit,
        } => match data.commitments.send_fulfill(id, preimage.0) {
            Ok(fulfill) => {
                let state = ChannelState::Normal(data);
                let mut actions = vec![ChannelAction::SendMessage(
                    LightningMessage::UpdateFulfillHtlc(fulfill),
                )];
                if commit {
                    actions.push(ChannelAction::SendToSelf(Box::new(
                        ChannelCommand::Sign,
                    )));
                }
                actions.extend(store_action(&state));
                (state, actions)
            }
            Err(error) => (
                ChannelState::Normal(data),
                vec![ChannelAction::NotExecuted {
                    command: "FulfillHtlc",
                    error,
                }],
            ),
        },

        ChannelCommand::FailHtlc { id, reason, commit } =>
            match data.commitments.send_fail(id, reason) {
                Ok(fail) => {
                    let state = ChannelState::Normal(data);
                    let mut actions = vec![ChannelAction::SendMessage(
                        LightningMessage::UpdateFailHtlc(fail),
                    )];
                    if commit {
                        actions.push(ChannelAction::SendToSelf(Box::new(
                            ChannelCommand::Sign,
                        )));
                    }
                    actions.extend(store_action(&state));
                    (state, actions)
                }
                Err(error) => (
                    ChannelState::Normal(data),
                    vec![ChannelAction::NotExecuted {
                        command: "FailHtlc",
                        error,
                    }],
                ),
            },

        ChannelCommand::Sign => {
            let keys =
                ctx.keys.channel_keys(data.commitments.params.key_index);
            match data.commitments.send_commit(&keys, ctx.secp) {
                Ok(msgs) => {
                    let state = ChannelState::Normal(data);
                    let mut actions = msgs
                        .into_iter()
                        .map(|msg| {
                            ChannelAction::SendMessage(
                                LightningMessage::CommitmentSigned(msg),
                            )
                        })
                        .collect::<Vec<_>>();
                    actions.extend(store_action(&state));
                    (state, actions)
                }
                // Nothing to sign or waiting on a revocation: both are
                // normal timing races, not failures.
                Err(
                    ChannelError::NoChangesToSign
                    | ChannelError::UnrevokedCommitment,
                ) => (ChannelState::Normal(data), vec![]),
                Err(error) => (
                    ChannelState::Normal(data),
                    vec![ChannelAction::NotExecuted {
                        command: "Sign",
                        error,
                    }],
                ),
            }
        }

        ChannelCommand::CheckHtlcTimeout =>
            check_htlc_timeout(data, ctx),

        ChannelCommand::Splice(request) => start_splice(data, request, ctx),

        ChannelCommand::Close {
            script_pubkey,
            feerate_per_kw: _,
        } => {
            let script = script_pubkey.unwrap_or_else(|| {
                let keys = ctx
                    .keys
                    .channel_keys(data.commitments.params.key_index);
                scripts::to_remote_script(&keys.payment_point(ctx.secp))
            });
            let shutdown = Shutdown {
                channel_id: data.commitments.params.channel_id,
                script_pubkey: script,
            };
            data.local_shutdown_sent = Some(shutdown.clone());
            let state = ChannelState::Normal(data);
            let mut actions = vec![ChannelAction::SendMessage(
                LightningMessage::Shutdown(shutdown),
            )];
            actions.extend(store_action(&state));
            (state, actions)
        }

        ChannelCommand::MessageReceived(msg) =>
            process_message(data, msg, ctx),

        ChannelCommand::WatchReceived(WatchEvent::Confirmed {
            txid,
            block_height,
            ..
        }) => splice_tx_confirmed(data, txid, block_height),

        cmd => command_not_valid(ChannelState::Normal(data), cmd.name()),
    }
}

fn process_message(
    mut data: NormalData,
    msg: LightningMessage,
    ctx: &ChannelContext<'_>,
) -> (ChannelState, Vec<ChannelAction>) {
    match msg {
        LightningMessage::UpdateAddHtlc(add) =>
            match data.commitments.receive_add(add) {
                Ok(()) => (ChannelState::Normal(data), vec![]),
                Err(error) => protocol_error(data, error),
            },

        LightningMessage::UpdateFulfillHtlc(fulfill) =>
            match data.commitments.receive_fulfill(&fulfill) {
                Ok((origin, _amount)) => {
                    // Fulfills propagate to the payment layer immediately.
                    let settlement = HtlcSettlement::Fulfilled {
                        origin,
                        preimage: crate::payments::PaymentPreimage(
                            fulfill.payment_preimage,
                        ),
                    };
                    (
                        ChannelState::Normal(data),
                        vec![ChannelAction::AddSettled(settlement)],
                    )
                }
                Err(error) => protocol_error(data, error),
            },

        LightningMessage::UpdateFailHtlc(fail) =>
            match data.commitments.receive_fail(&fail) {
                Ok(()) => (ChannelState::Normal(data), vec![]),
                Err(error) => protocol_error(data, error),
            },

        LightningMessage::UpdateFailMalformedHtlc(fail) => {
            let as_fail = crate::wire::UpdateFailHtlc {
                channel_id: fail.channel_id,
                id: fail.id,
                reason: fail.failure_code.to_be_bytes().to_vec(),
            };
            match data.commitments.receive_fail(&as_fail) {
                Ok(()) => (ChannelState::Normal(data), vec![]),
                Err(error) => protocol_error(data, error),
            }
        }

        LightningMessage::UpdateFee(fee) => {
            data.commitments
                .changes
                .remote_proposed
                .push(super::commitments::UpdateMsg::Fee(fee));
            (ChannelState::Normal(data), vec![])
        }

        LightningMessage::CommitmentSigned(commit_sig) =>
            receive_commit_sig(data, commit_sig, ctx),

        LightningMessage::RevokeAndAck(rev) => {
            match data.commitments.receive_revocation(&rev, ctx.secp) {
                Ok(outcome) => {
                    let mut actions = Vec::new();
                    for add in outcome.incoming {
                        actions.push(
                            ChannelAction::ProcessIncomingHtlc(add),
                        );
                    }
                    for (origin, reason) in outcome.failed {
                        actions.push(ChannelAction::AddSettled(
                            HtlcSettlement::Failed { origin, reason },
                        ));
                    }
                    if data.commitments.changes.local_has_changes() {
                        actions.push(ChannelAction::SendToSelf(Box::new(
                            ChannelCommand::Sign,
                        )));
                    }
                    let state = ChannelState::Normal(data);
                    actions.extend(store_action(&state));
                    (state, actions)
                }
                Err(error) => protocol_error(data, error),
            }
        }

        LightningMessage::Shutdown(remote_shutdown) =>
            receive_shutdown(data, remote_shutdown, ctx),

        LightningMessage::SpliceInit(splice_init) =>
            receive_splice_init(data, splice_init, ctx),

        LightningMessage::SpliceAck(splice_ack) =>
            receive_splice_ack(data, splice_ack, ctx),

        LightningMessage::SpliceLocked(splice_locked) =>
            receive_splice_locked(data, splice_locked),

        LightningMessage::TxAddInput(..)
        | LightningMessage::TxAddOutput(..)
        | LightningMessage::TxRemoveInput(..)
        | LightningMessage::TxRemoveOutput(..)
        | LightningMessage::TxComplete(..) =>
            splice_interactive_message(data, msg, ctx),

        LightningMessage::TxSignatures(remote_sigs) =>
            splice_tx_signatures(data, remote_sigs, ctx),

        LightningMessage::TxAbort(..) => {
            if let Some(splice) = data.splice_session.take() {
                info!("peer aborted the splice attempt");
                let outpoints = splice.local_input_outpoints();
                let mut actions = vec![ChannelAction::SendMessage(
                    LightningMessage::TxAbort(TxAbort::new(
                        data.commitments.params.channel_id,
                        "acked",
                    )),
                )];
                if !outpoints.is_empty() {
                    actions.push(ChannelAction::UnlockWalletInputs(
                        outpoints,
                    ));
                }
                (ChannelState::Normal(data), actions)
            } else {
                unexpected_message(ChannelState::Normal(data), "tx_abort")
            }
        }

        LightningMessage::ChannelUpdate(update) => {
            data.remote_channel_update = Some(update);
            let state = ChannelState::Normal(data);
            let actions = store_action(&state).into_iter().collect();
            (state, actions)
        }

        // Late retransmissions are harmless.
        LightningMessage::ChannelReady(..) =>
            (ChannelState::Normal(data), vec![]),

        _ => unexpected_message(
            ChannelState::Normal(data),
            "unhandled message",
        ),
    }
}

// --- Commit sig handling (normal + splice paths) --- //

fn receive_commit_sig(
    mut data: NormalData,
    commit_sig: CommitmentSigned,
    ctx: &ChannelContext<'_>,
) -> (ChannelState, Vec<ChannelAction>) {
    // A signature targeting the in-flight splice funding belongs to the
    // splice session, not the commitment round-trips.
    let splice_txid = data
        .splice_session
        .as_ref()
        .and_then(|splice| splice.built.as_ref())
        .map(|built| built.txid());
    if commit_sig.funding_txid.is_some()
        && commit_sig.funding_txid == splice_txid
    {
        return splice_commit_sig(data, commit_sig, ctx);
    }

    let keys = ctx.keys.channel_keys(data.commitments.params.key_index);
    match data
        .commitments
        .receive_commit(&[commit_sig], &keys, ctx.secp)
    {
        Ok(rev) => {
            let mut actions = vec![ChannelAction::SendMessage(
                LightningMessage::RevokeAndAck(rev),
            )];
            // Remember the HTLCs of this commitment number so a penalty
            // tx can claim them if this state is later revoked and
            // published by the peer.
            let htlc_infos = htlc_infos_of(&data.commitments);
            if !htlc_infos.is_empty() {
                actions.push(ChannelAction::StoreHtlcInfos(htlc_infos));
            }
            if data.commitments.changes.local_has_changes() {
                actions.push(ChannelAction::SendToSelf(Box::new(
                    ChannelCommand::Sign,
                )));
            }
            let state = ChannelState::Normal(data);
            actions.extend(store_action(&state));
            (state, actions)
        }
        Err(error) => protocol_error(data, error),
    }
}

/// HTLC metadata of the latest local commitment, persisted for penalty
/// construction.
fn htlc_infos_of(commitments: &Commitments) -> Vec<super::HtlcInfo> {
    let local_commit = &commitments.latest().local_commit;
    local_commit
        .spec
        .htlcs
        .iter()
        .map(|htlc| super::HtlcInfo {
            channel_id: commitments.params.channel_id,
            commitment_number: local_commit.index,
            payment_hash: htlc.add.payment_hash,
            cltv_expiry: htlc.add.cltv_expiry,
        })
        .collect()
}

// --- HTLC timeout --- //

fn check_htlc_timeout(
    data: NormalData,
    ctx: &ChannelContext<'_>,
) -> (ChannelState, Vec<ChannelAction>) {
    let projected = data.commitments.projected_spec();
    let almost_expired = projected.htlcs.iter().find(|htlc| {
        ctx.block_height + HTLC_SAFETY_DELTA >= htlc.add.cltv_expiry
    });
    match almost_expired {
        Some(htlc) => {
            warn!(
                htlc_id = htlc.add.id,
                cltv_expiry = htlc.add.cltv_expiry,
                tip = ctx.block_height,
                "htlc close to expiry, force-closing",
            );
            super::closing::force_close(ChannelState::Normal(data), ctx)
        }
        None => (ChannelState::Normal(data), vec![]),
    }
}

// --- Shutdown --- //

fn receive_shutdown(
    data: NormalData,
    remote_shutdown: Shutdown,
    ctx: &ChannelContext<'_>,
) -> (ChannelState, Vec<ChannelAction>) {
    let has_pending_htlcs =
        !data.commitments.projected_spec().htlcs.is_empty();

    let local_shutdown = match &data.local_shutdown_sent {
        Some(shutdown) => shutdown.clone(),
        None => {
            let keys = ctx
                .keys
                .channel_keys(data.commitments.params.key_index);
            Shutdown {
                channel_id: data.commitments.params.channel_id,
                script_pubkey: scripts::to_remote_script(
                    &keys.payment_point(ctx.secp),
                ),
            }
        }
    };

    let mut actions = Vec::new();
    if data.local_shutdown_sent.is_none() {
        actions.push(ChannelAction::SendMessage(
            LightningMessage::Shutdown(local_shutdown.clone()),
        ));
    }

    let state = if has_pending_htlcs {
        // Keep settling in-flight HTLCs; no new adds are accepted.
        ChannelState::ShuttingDown {
            commitments: data.commitments,
            local_shutdown,
            remote_shutdown: Some(remote_shutdown),
        }
    } else {
        ChannelState::Negotiating {
            commitments: data.commitments,
            local_shutdown,
            remote_shutdown,
            local_closing_fee_sat: None,
        }
    };
    actions.extend(store_action(&state));

    // The funder opens the fee negotiation.
    if matches!(state, ChannelState::Negotiating { .. }) {
        if let Some(commitments) = state.commitments() {
            if commitments.params.local_is_initiator {
                actions.push(ChannelAction::SendToSelf(Box::new(
                    ChannelCommand::Close {
                        script_pubkey: None,
                        feerate_per_kw: None,
                    },
                )));
            }
        }
    }
    (state, actions)
}

// --- Splicing --- //

fn splice_contribution_sat(request: &SpliceRequest) -> i64 {
    let splice_in: u64 = request
        .splice_in
        .as_ref()
        .map(|splice_in| {
            splice_in
                .wallet_inputs
                .iter()
                .map(|input| input.amount.sats_floor())
                .sum()
        })
        .unwrap_or(0);
    let splice_out: u64 = request
        .splice_out
        .as_ref()
        .map(|splice_out| splice_out.amount.sats_floor())
        .unwrap_or(0);
    // The splice initiator pays the interactive-tx fees from its
    // contribution.
    let fee = scripts::weight_to_fee_sat(request.feerate_per_kw, 800);
    splice_in as i64 - splice_out as i64 - fee as i64
}

fn start_splice(
    mut data: NormalData,
    request: SpliceRequest,
    ctx: &ChannelContext<'_>,
) -> (ChannelState, Vec<ChannelAction>) {
    if data.splice_session.is_some() {
        return (
            ChannelState::Normal(data),
            vec![ChannelAction::NotExecuted {
                command: "Splice",
                error: ChannelError::CommandNotValid {
                    state: "Normal(splicing)",
                    command: "Splice",
                },
            }],
        );
    }
    if !data.commitments.latest().is_confirmed() {
        return (
            ChannelState::Normal(data),
            vec![ChannelAction::NotExecuted {
                command: "Splice",
                error: ChannelError::CommandNotValid {
                    state: "Normal(unconfirmed funding)",
                    command: "Splice",
                },
            }],
        );
    }

    let keys = ctx.keys.channel_keys(data.commitments.params.key_index);
    let local_contribution_sat = splice_contribution_sat(&request);
    let splice_init = SpliceInit {
        channel_id: data.commitments.params.channel_id,
        funding_contribution_sat: local_contribution_sat,
        funding_feerate_per_kw: request.feerate_per_kw,
        lock_time: ctx.block_height,
        funding_pubkey: keys.funding_pubkey(ctx.secp),
        push_amount: None,
    };
    data.splice_session = Some(SpliceSession {
        request,
        is_initiator: true,
        local_contribution_sat,
        remote_contribution_sat: 0,
        session: None,
        built: None,
        new_commitment: None,
        remote_commit_sig_received: false,
        local_sigs: None,
        remote_sigs: None,
    });
    (
        ChannelState::Normal(data),
        vec![ChannelAction::SendMessage(LightningMessage::SpliceInit(
            splice_init,
        ))],
    )
}

fn new_funding_amount_sat(
    commitments: &Commitments,
    local_contribution_sat: i64,
    remote_contribution_sat: i64,
) -> Option<u64> {
    let old = commitments.latest().funding_amount.sats_floor() as i64;
    u64::try_from(old + local_contribution_sat + remote_contribution_sat)
        .ok()
}

fn receive_splice_init(
    mut data: NormalData,
    splice_init: SpliceInit,
    ctx: &ChannelContext<'_>,
) -> (ChannelState, Vec<ChannelAction>) {
    if data.splice_session.is_some() {
        return protocol_error(
            data,
            ChannelError::PeerError("concurrent splice".to_owned()),
        );
    }
    let keys = ctx.keys.channel_keys(data.commitments.params.key_index);
    let Some(funding_amount_sat) = new_funding_amount_sat(
        &data.commitments,
        0,
        splice_init.funding_contribution_sat,
    ) else {
        return protocol_error(
            data,
            ChannelError::PeerError("splice underflows funding".to_owned()),
        );
    };

    let funding_script = scripts::funding_script(
        &keys.funding_pubkey(ctx.secp),
        &data.commitments.params.remote.funding_pubkey,
    );
    let latest = data.commitments.latest();
    let session = InteractiveTxSession::new(
        InteractiveTxParams {
            channel_id: data.commitments.params.channel_id,
            is_initiator: false,
            funding_amount_sat,
            funding_script,
            target_feerate_per_kw: splice_init.funding_feerate_per_kw,
            lock_time: splice_init.lock_time,
            shared_input: Some(SharedInput {
                outpoint: latest.funding_outpoint(),
                amount_sat: latest.funding_amount.sats_floor(),
            }),
        },
        &[],
        vec![],
    );

    let splice_ack = SpliceAck {
        channel_id: data.commitments.params.channel_id,
        funding_contribution_sat: 0,
        funding_pubkey: keys.funding_pubkey(ctx.secp),
    };
    data.splice_session = Some(SpliceSession {
        request: SpliceRequest {
            splice_in: None,
            splice_out: None,
            feerate_per_kw: splice_init.funding_feerate_per_kw,
        },
        is_initiator: false,
        local_contribution_sat: 0,
        remote_contribution_sat: splice_init.funding_contribution_sat,
        session: Some(session),
        built: None,
        new_commitment: None,
        remote_commit_sig_received: false,
        local_sigs: None,
        remote_sigs: None,
    });
    (
        ChannelState::Normal(data),
        vec![ChannelAction::SendMessage(LightningMessage::SpliceAck(
            splice_ack,
        ))],
    )
}

fn receive_splice_ack(
    mut data: NormalData,
    splice_ack: SpliceAck,
    ctx: &ChannelContext<'_>,
) -> (ChannelState, Vec<ChannelAction>) {
    let Some(mut splice) = data.splice_session.take() else {
        return unexpected_message(
            ChannelState::Normal(data),
            "splice_ack",
        );
    };
    if splice.session.is_some() {
        return protocol_error(
            data,
            ChannelError::PeerError("duplicate splice_ack".to_owned()),
        );
    }
    splice.remote_contribution_sat = splice_ack.funding_contribution_sat;

    let keys = ctx.keys.channel_keys(data.commitments.params.key_index);
    let Some(funding_amount_sat) = new_funding_amount_sat(
        &data.commitments,
        splice.local_contribution_sat,
        splice.remote_contribution_sat,
    ) else {
        return protocol_error(
            data,
            ChannelError::PeerError("splice underflows funding".to_owned()),
        );
    };

    let funding_script = scripts::funding_script(
        &keys.funding_pubkey(ctx.secp),
        &data.commitments.params.remote.funding_pubkey,
    );
    let latest = data.commitments.latest();
    let splice_out_outputs = splice
        .request
        .splice_out
        .as_ref()
        .map(|splice_out| {
            vec![bitcoin::TxOut {
                value: bitcoin::Amount::from_sat(
                    splice_out.amount.sats_floor(),
                ),
                script_pubkey: splice_out.script_pubkey.clone(),
            }]
        })
        .unwrap_or_default();
    let mut session = InteractiveTxSession::new(
        InteractiveTxParams {
            channel_id: data.commitments.params.channel_id,
            is_initiator: true,
            funding_amount_sat,
            funding_script,
            target_feerate_per_kw: splice.request.feerate_per_kw,
            lock_time: ctx.block_height,
            shared_input: Some(SharedInput {
                outpoint: latest.funding_outpoint(),
                amount_sat: latest.funding_amount.sats_floor(),
            }),
        },
        &splice.wallet_inputs(),
        splice_out_outputs,
    );
    let first = session.start();
    splice.session = Some(session);
    data.splice_session = Some(splice);
    (
        ChannelState::Normal(data),
        vec![ChannelAction::SendMessage(first)],
    )
}

fn splice_interactive_message(
    mut data: NormalData,
    msg: LightningMessage,
    ctx: &ChannelContext<'_>,
) -> (ChannelState, Vec<ChannelAction>) {
    let Some(mut splice) = data.splice_session.take() else {
        return unexpected_message(
            ChannelState::Normal(data),
            "interactive tx message",
        );
    };
    let Some(session) = splice.session.as_mut() else {
        return protocol_error(
            data,
            ChannelError::InteractiveTx("no active interactive session"),
        );
    };

    match session.receive(&msg) {
        Ok(step) => {
            let mut actions = step
                .messages
                .into_iter()
                .map(ChannelAction::SendMessage)
                .collect::<Vec<_>>();
            if let Some(built) = step.built {
                let (new_data, mut more) =
                    splice_tx_built(data, splice, built, ctx);
                actions.append(&mut more);
                return (ChannelState::Normal(new_data), actions);
            }
            data.splice_session = Some(splice);
            (ChannelState::Normal(data), actions)
        }
        Err(error) => {
            let outpoints = splice.local_input_outpoints();
            let mut actions = vec![ChannelAction::SendMessage(
                LightningMessage::TxAbort(TxAbort::new(
                    data.commitments.params.channel_id,
                    &error.to_string(),
                )),
            )];
            if !outpoints.is_empty() {
                actions.push(ChannelAction::UnlockWalletInputs(outpoints));
            }
            (ChannelState::Normal(data), actions)
        }
    }
}

/// The splice interactive round completed: build the replacement
/// commitment (same indices, adjusted balances, same HTLCs) and sign it.
fn splice_tx_built(
    mut data: NormalData,
    mut splice: SpliceSession,
    built: BuiltFundingTx,
    ctx: &ChannelContext<'_>,
) -> (NormalData, Vec<ChannelAction>) {
    let keys = ctx.keys.channel_keys(data.commitments.params.key_index);
    let latest = data.commitments.latest();

    let delta_local = Amount::from_sat(
        splice.local_contribution_sat.unsigned_abs(),
    );
    let delta_remote = Amount::from_sat(
        splice.remote_contribution_sat.unsigned_abs(),
    );
    let mut local_spec = latest.local_commit.spec.clone();
    if splice.local_contribution_sat >= 0 {
        local_spec.to_local += delta_local;
    } else {
        local_spec.to_local = local_spec.to_local - delta_local;
    }
    if splice.remote_contribution_sat >= 0 {
        local_spec.to_remote += delta_remote;
    } else {
        local_spec.to_remote = local_spec.to_remote - delta_remote;
    }
    let mut remote_spec = latest.remote_commit.spec.clone();
    remote_spec.to_local = local_spec.to_local;
    remote_spec.to_remote = local_spec.to_remote;

    let funding_amount = Amount::from_sat(
        new_funding_amount_sat(
            &data.commitments,
            splice.local_contribution_sat,
            splice.remote_contribution_sat,
        )
        .unwrap_or(0),
    );

    let mut new_commitment = Commitment {
        funding_tx_index: latest.funding_tx_index + 1,
        funding_txid: built.txid(),
        funding_output_index: built.funding_output_index,
        funding_amount,
        funding_status: FundingStatus::Unconfirmed {
            tx: Some(built.tx.clone()),
        },
        local_commit: LocalCommit {
            index: latest.local_commit.index,
            spec: local_spec.clone(),
            tx: built.tx.clone(), // rebuilt below
            remote_sig: latest.local_commit.remote_sig,
            htlc_remote_sigs: vec![],
        },
        remote_commit: RemoteCommit {
            index: latest.remote_commit.index,
            spec: remote_spec.clone(),
            txid: built.txid(), // rebuilt below
            remote_per_commitment_point: latest
                .remote_commit
                .remote_per_commitment_point,
        },
        next_remote_commit: None,
    };
    new_commitment.local_commit.tx = build_commit_tx_for_local(
        &new_commitment,
        &local_spec,
        &data.commitments.params,
        &keys,
        ctx.secp,
        new_commitment.local_commit.index,
    );
    let remote_tx = build_commit_tx_for_remote(
        &new_commitment,
        &remote_spec,
        &data.commitments.params,
        &keys,
        ctx.secp,
    );
    new_commitment.remote_commit.txid = remote_tx.compute_txid();

    let mut actions = Vec::new();
    match funding_sighash(
        &remote_tx,
        &new_commitment,
        &data.commitments.params,
        &keys,
        ctx.secp,
    ) {
        Ok(digest) => {
            let commit_sig = CommitmentSigned {
                channel_id: data.commitments.params.channel_id,
                signature: ctx.secp.sign_ecdsa(
                    &Message::from_digest(digest),
                    &keys.funding_key,
                ),
                htlc_signatures: vec![],
                funding_txid: Some(built.txid()),
            };
            actions.push(ChannelAction::SendMessage(
                LightningMessage::CommitmentSigned(commit_sig),
            ));
        }
        Err(error) => {
            warn!("splice signing failed: {error}");
            actions.push(ChannelAction::SendMessage(
                LightningMessage::TxAbort(TxAbort::new(
                    data.commitments.params.channel_id,
                    &error.to_string(),
                )),
            ));
            let outpoints = splice.local_input_outpoints();
            if !outpoints.is_empty() {
                actions.push(ChannelAction::UnlockWalletInputs(outpoints));
            }
            return (data, actions);
        }
    }

    splice.built = Some(built);
    splice.new_commitment = Some(new_commitment);
    data.splice_session = Some(splice);
    (data, actions)
}

fn splice_commit_sig(
    mut data: NormalData,
    commit_sig: CommitmentSigned,
    ctx: &ChannelContext<'_>,
) -> (ChannelState, Vec<ChannelAction>) {
    let Some(mut splice) = data.splice_session.take() else {
        return unexpected_message(
            ChannelState::Normal(data),
            "splice commitment_signed",
        );
    };
    let Some(new_commitment) = splice.new_commitment.as_mut() else {
        return protocol_error(
            data,
            ChannelError::PeerError("premature splice signature".to_owned()),
        );
    };

    let keys = ctx.keys.channel_keys(data.commitments.params.key_index);
    let digest = match funding_sighash(
        &new_commitment.local_commit.tx,
        new_commitment,
        &data.commitments.params,
        &keys,
        ctx.secp,
    ) {
        Ok(digest) => digest,
        Err(error) => return protocol_error(data, error),
    };
    if ctx
        .secp
        .verify_ecdsa(
            &Message::from_digest(digest),
            &commit_sig.signature,
            &data.commitments.params.remote.funding_pubkey,
        )
        .is_err()
    {
        return protocol_error(
            data,
            ChannelError::InvalidCommitmentSignature {
                commit_number: new_commitment.local_commit.index,
            },
        );
    }
    new_commitment.local_commit.remote_sig = commit_sig.signature;
    splice.remote_commit_sig_received = true;

    let mut actions = Vec::new();
    // The splice non-initiator reveals its tx signatures first.
    if !splice.is_initiator {
        if let Some(built) = &splice.built {
            match built.sign_local_inputs(ctx.keys) {
                Ok(sigs) => {
                    splice.local_sigs = Some(sigs.clone());
                    actions.push(ChannelAction::SendMessage(
                        LightningMessage::TxSignatures(sigs),
                    ));
                }
                Err(err) => {
                    warn!("failed to sign splice inputs: {err:#}");
                }
            }
        }
    }

    data.splice_session = Some(splice);
    maybe_complete_splice(data, actions, ctx)
}

fn splice_tx_signatures(
    mut data: NormalData,
    remote_sigs: TxSignatures,
    ctx: &ChannelContext<'_>,
) -> (ChannelState, Vec<ChannelAction>) {
    let Some(mut splice) = data.splice_session.take() else {
        return unexpected_message(
            ChannelState::Normal(data),
            "tx_signatures",
        );
    };
    splice.remote_sigs = Some(remote_sigs);

    let mut actions = Vec::new();
    if splice.is_initiator
        && splice.remote_commit_sig_received
        && splice.local_sigs.is_none()
    {
        if let Some(built) = &splice.built {
            match built.sign_local_inputs(ctx.keys) {
                Ok(sigs) => {
                    splice.local_sigs = Some(sigs.clone());
                    actions.push(ChannelAction::SendMessage(
                        LightningMessage::TxSignatures(sigs),
                    ));
                }
                Err(err) => {
                    warn!("failed to sign splice inputs: {err:#}");
                }
            }
        }
    }

    data.splice_session = Some(splice);
    maybe_complete_splice(data, actions, ctx)
}

/// When the splice commit sig validated and both `tx_signatures` are in,
/// activate the new funding alongside the old one.
fn maybe_complete_splice(
    mut data: NormalData,
    mut actions: Vec<ChannelAction>,
    _ctx: &ChannelContext<'_>,
) -> (ChannelState, Vec<ChannelAction>) {
    let ready = data
        .splice_session
        .as_ref()
        .map(|splice| {
            splice.remote_commit_sig_received
                && splice.local_sigs.is_some()
                && splice.remote_sigs.is_some()
                && splice.new_commitment.is_some()
        })
        .unwrap_or(false);
    if !ready {
        return (ChannelState::Normal(data), actions);
    }

    let splice = data.splice_session.take().expect("checked above");
    let built = splice.built.expect("ready implies built");
    let new_commitment =
        splice.new_commitment.expect("ready implies commitment");
    let ours = splice.local_sigs.expect("ready implies local sigs");
    let theirs = splice.remote_sigs.expect("ready implies remote sigs");

    let session = splice.session.expect("built implies session");
    let remote_indices = session.remote_input_indices(&built);
    let full_tx = match built.apply_signatures(&ours, &theirs, &remote_indices)
    {
        Ok(tx) => tx,
        Err(error) => {
            warn!("splice signature merge failed: {error}");
            return protocol_error(data, error);
        }
    };

    let channel_id = data.commitments.params.channel_id;
    let funding_txid = new_commitment.funding_txid;
    let mining_fee = Amount::from_sat(scripts::weight_to_fee_sat(
        splice.request.feerate_per_kw,
        800,
    ));

    data.commitments.add_active(new_commitment);

    if splice.is_initiator {
        actions.push(ChannelAction::PublishTx(full_tx));
        actions.push(ChannelAction::StoreOutgoingPayment(
            OnChainPayment::Splice {
                id: PaymentId(first_16_bytes_of(&funding_txid)),
                amount: Amount::from_sat(
                    splice.local_contribution_sat.unsigned_abs(),
                ),
                mining_fee,
                channel_id,
                txid: funding_txid,
                created_at: common::time::TimestampMs::now(),
                confirmed_at: None,
                locked_at: None,
            },
        ));
    }
    actions.push(ChannelAction::SendWatch(Watch::Confirmed {
        channel_id,
        txid: funding_txid,
        min_depth: MIN_DEPTH,
    }));
    actions.push(ChannelAction::SendWatch(Watch::Spent {
        channel_id,
        outpoint: bitcoin::OutPoint::new(
            funding_txid,
            built.funding_output_index,
        ),
    }));

    info!(%channel_id, %funding_txid, "splice negotiated");
    let state = ChannelState::Normal(data);
    actions.extend(store_action(&state));
    (state, actions)
}

/// A splice candidate funding confirmed: tell the peer with
/// `splice_locked`. The old funding only deactivates once both sides have
/// seen the lock-in, so HTLCs keep being signed against both until then.
fn splice_tx_confirmed(
    mut data: NormalData,
    txid: Txid,
    block_height: u32,
) -> (ChannelState, Vec<ChannelAction>) {
    let mut matched = false;
    for commitment in &mut data.commitments.active {
        if commitment.funding_txid == txid {
            commitment.funding_status =
                FundingStatus::Confirmed { block_height };
            matched = true;
        }
    }
    if !matched {
        return (ChannelState::Normal(data), vec![]);
    }

    let channel_id = data.commitments.params.channel_id;
    let mut actions = vec![
        ChannelAction::SendMessage(LightningMessage::SpliceLocked(
            SpliceLocked {
                channel_id,
                splice_txid: txid,
            },
        )),
        ChannelAction::SetLocked(txid),
    ];
    if data.their_splice_locked == Some(txid) {
        data.their_splice_locked = None;
        match data.commitments.lock_splice(txid) {
            Ok(()) => actions.push(ChannelAction::EmitEvent(
                ChannelEvent::SpliceLocked {
                    channel_id,
                    funding_txid: txid,
                },
            )),
            Err(error) => return protocol_error(data, error),
        }
    }
    let state = ChannelState::Normal(data);
    actions.extend(store_action(&state));
    (state, actions)
}

/// The peer saw the splice funding lock in. Once both sides agree, the
/// older fundings become inactive.
fn receive_splice_locked(
    mut data: NormalData,
    splice_locked: SpliceLocked,
) -> (ChannelState, Vec<ChannelAction>) {
    let channel_id = data.commitments.params.channel_id;
    let confirmed_locally = data
        .commitments
        .active
        .iter()
        .any(|commitment| {
            commitment.funding_txid == splice_locked.splice_txid
                && commitment.is_confirmed()
        });
    if !confirmed_locally {
        // We haven't seen the confirmation yet; hold the peer's lock-in
        // until our watch fires.
        data.their_splice_locked = Some(splice_locked.splice_txid);
        return (ChannelState::Normal(data), vec![]);
    }
    match data.commitments.lock_splice(splice_locked.splice_txid) {
        Ok(()) => {
            let mut actions = vec![ChannelAction::EmitEvent(
                ChannelEvent::SpliceLocked {
                    channel_id,
                    funding_txid: splice_locked.splice_txid,
                },
            )];
            let state = ChannelState::Normal(data);
            actions.extend(store_action(&state));
            (state, actions)
        }
        Err(error) => protocol_error(data, error),
    }
}

// --- Failure path --- //

/// A protocol violation in `Normal`: error the peer and force-close via
/// the latest signed commitment.
fn protocol_error(
    data: NormalData,
    error: ChannelError,
) -> (ChannelState, Vec<ChannelAction>) {
    tracing::error!("protocol error: {error}");
    super::closing::force_close_with_error(
        ChannelState::Normal(data),
        error,
    )
}

fn first_16_bytes_of(txid: &Txid) -> [u8; 16] {
    use bitcoin::hashes::Hash;
    let bytes = txid.to_byte_array();
    let mut out = [0u8; 16];
    out.copy_from_slice(&bytes[..16]);
    out
}

#[cfg(test)]
mod test {
    use bitcoin::secp256k1::Secp256k1;

    use super::*;
    use crate::channel::test_support::{fixture, normal_state};
    use crate::channel::{AddHtlcSpec, ChannelContext};
    use crate::keys::{KeyManager, SeedKeyManager};
    use crate::payments::{PartId, PaymentId};
    use crate::wire::OnionPacket;

    fn test_ctx<'a>(
        keys: &'a SeedKeyManager,
        secp: &'a Secp256k1<bitcoin::secp256k1::All>,
        block_height: u32,
    ) -> ChannelContext<'a> {
        ChannelContext {
            local_node_id: keys.node_id(),
            remote_node_id: SeedKeyManager::new([2; 32]).node_id(),
            chain_hash: [6; 32],
            block_height,
            feerates: crate::electrum::FeeratesPerKw::FALLBACK,
            keys,
            secp,
        }
    }

    #[test]
    fn htlc_timeout_force_closes_with_local_commit() {
        let km = SeedKeyManager::new([1; 32]);
        let secp = Secp256k1::new();

        // A Normal channel holding an outgoing HTLC with cltv 700_000.
        let state = normal_state();
        let ctx = test_ctx(&km, &secp, 699_000);
        let spec = AddHtlcSpec {
            amount: common::amount::Amount::from_msat(10_000_000),
            payment_hash: [0xaa; 32],
            cltv_expiry: 700_000,
            onion: OnionPacket(vec![]),
            payment_id: PaymentId([1; 16]),
            part_id: PartId([2; 16]),
        };
        let (state, actions) =
            state.process(ChannelCommand::AddHtlc(spec), &ctx);
        assert!(actions.iter().any(|action| matches!(
            action,
            ChannelAction::SendMessage(
                LightningMessage::UpdateAddHtlc(..),
            ),
        )));

        // At tip 700_000 the sweep must force-close and publish our
        // commitment tx.
        let ctx = test_ctx(&km, &secp, 700_000);
        let (state, actions) =
            state.process(ChannelCommand::CheckHtlcTimeout, &ctx);
        assert_eq!(state.name(), "Closing");
        assert!(actions.iter().any(|action| matches!(
            action,
            ChannelAction::PublishTx(..),
        )));
    }

    #[test]
    fn add_htlc_is_rejected_after_shutdown_sent() {
        let km = SeedKeyManager::new([1; 32]);
        let secp = Secp256k1::new();
        let ctx = test_ctx(&km, &secp, 699_000);

        let (state, actions) = normal_state().process(
            ChannelCommand::Close {
                script_pubkey: None,
                feerate_per_kw: None,
            },
            &ctx,
        );
        assert!(actions.iter().any(|action| matches!(
            action,
            ChannelAction::SendMessage(LightningMessage::Shutdown(..)),
        )));

        let spec = AddHtlcSpec {
            amount: common::amount::Amount::from_msat(1_000_000),
            payment_hash: [0xbb; 32],
            cltv_expiry: 700_500,
            onion: OnionPacket(vec![]),
            payment_id: PaymentId([3; 16]),
            part_id: PartId([4; 16]),
        };
        let (_state, actions) =
            state.process(ChannelCommand::AddHtlc(spec), &ctx);
        assert!(actions.iter().any(|action| matches!(
            action,
            ChannelAction::AddFailed(..),
        )));
    }

    #[test]
    fn splice_request_sends_splice_init_and_rejects_concurrent() {
        let km = SeedKeyManager::new([1; 32]);
        let secp = Secp256k1::new();
        let ctx = test_ctx(&km, &secp, 699_000);

        let request = crate::channel::SpliceRequest {
            splice_in: None,
            splice_out: Some(crate::channel::SpliceOut {
                amount: common::amount::Amount::from_sat(10_000),
                script_pubkey: bitcoin::ScriptBuf::new(),
            }),
            feerate_per_kw: 2_500,
        };
        let (state, actions) = normal_state()
            .process(ChannelCommand::Splice(request.clone()), &ctx);
        assert!(actions.iter().any(|action| matches!(
            action,
            ChannelAction::SendMessage(LightningMessage::SpliceInit(..)),
        )));

        // A second splice while one is in flight is refused.
        let (_state, actions) =
            state.process(ChannelCommand::Splice(request), &ctx);
        assert!(actions.iter().any(|action| matches!(
            action,
            ChannelAction::NotExecuted { command: "Splice", .. },
        )));
    }

    #[test]
    fn remote_shutdown_without_htlcs_moves_to_negotiating() {
        let km = SeedKeyManager::new([1; 32]);
        let secp = Secp256k1::new();
        let ctx = test_ctx(&km, &secp, 699_000);

        let shutdown = crate::wire::Shutdown {
            channel_id: normal_state().channel_ids()[0],
            script_pubkey: bitcoin::ScriptBuf::new(),
        };
        let (state, actions) = normal_state().process(
            ChannelCommand::MessageReceived(LightningMessage::Shutdown(
                shutdown,
            )),
            &ctx,
        );
        assert_eq!(state.name(), "Negotiating");
        // We echo our own shutdown and, as the funder, open the fee
        // negotiation.
        assert!(actions.iter().any(|action| matches!(
            action,
            ChannelAction::SendMessage(LightningMessage::Shutdown(..)),
        )));
        assert!(actions.iter().any(|action| matches!(
            action,
            ChannelAction::SendToSelf(..),
        )));
    }

    #[test]
    fn channel_update_is_stored_and_persisted() {
        let km = SeedKeyManager::new([1; 32]);
        let secp = Secp256k1::new();
        let ctx = test_ctx(&km, &secp, 699_000);
        let (commitments, ..) = fixture();
        let _ = commitments;

        let update = ChannelUpdate {
            signature: bitcoin::secp256k1::ecdsa::Signature::from_compact(
                &[1; 64],
            )
            .unwrap(),
            chain_hash: [6; 32],
            short_channel_id: 42,
            timestamp: 1,
            message_flags: 1,
            channel_flags: 0,
            cltv_expiry_delta: 144,
            htlc_minimum: common::amount::Amount::from_msat(1),
            fee_base_msat: 1_000,
            fee_proportional_millionths: 100,
            htlc_maximum: common::amount::Amount::from_msat(1_000_000_000),
        };
        let (state, actions) = normal_state().process(
            ChannelCommand::MessageReceived(
                LightningMessage::ChannelUpdate(update),
            ),
            &ctx,
        );
        assert!(matches!(
            &state,
            ChannelState::Normal(data) if data.remote_channel_update.is_some(),
        ));
        assert!(actions.iter().any(|action| matches!(
            action,
            ChannelAction::StoreState(..),
        )));
    }
}
