//! Cooperative shutdown, closing-fee negotiation, unilateral closes, and
//! on-chain claim handling, including penalty transactions for revoked
//! commitments.

use bitcoin::{
    secp256k1::Message, Amount as SatAmount, OutPoint, ScriptBuf, Sequence,
    Transaction, TxIn, TxOut, Txid, Witness,
};
use common::{amount::Amount, time::TimestampMs};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use super::{
    command_not_valid, scripts, store_action, unexpected_message,
    ChannelAction, ChannelCommand, ChannelContext, ChannelError,
    ChannelEvent, ChannelId, ChannelState, Commitments, MIN_DEPTH,
};
use crate::{
    electrum::{Watch, WatchEvent},
    payments::{ClosingType, OnChainPayment, PaymentId},
    wire::{ClosingSigned, ErrorMsg, LightningMessage},
};

/// A revoked remote commitment we are claiming via the penalty path.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RevokedCommitPublished {
    pub commit_tx: Transaction,
    pub penalty_tx: Option<Transaction>,
}

/// The close-related transactions a `Closing` channel is tracking.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SpendingTxs {
    pub mutual_close_published: Vec<Transaction>,
    pub local_commit_published: Option<Transaction>,
    pub remote_commit_published: Option<Transaction>,
    pub revoked_commit_published: Vec<RevokedCommitPublished>,
}

impl SpendingTxs {
    fn closing_type_for(&self, txid: Txid) -> Option<ClosingType> {
        if self
            .mutual_close_published
            .iter()
            .any(|tx| tx.compute_txid() == txid)
        {
            return Some(ClosingType::Mutual);
        }
        if self
            .local_commit_published
            .as_ref()
            .map(|tx| tx.compute_txid() == txid)
            .unwrap_or(false)
        {
            return Some(ClosingType::Local);
        }
        if self
            .remote_commit_published
            .as_ref()
            .map(|tx| tx.compute_txid() == txid)
            .unwrap_or(false)
        {
            return Some(ClosingType::Remote);
        }
        if self
            .revoked_commit_published
            .iter()
            .any(|revoked| revoked.commit_tx.compute_txid() == txid)
        {
            return Some(ClosingType::Revoked);
        }
        None
    }
}

// --- Force close --- //

/// Unilaterally close with our latest signed commitment.
pub(super) fn force_close(
    state: ChannelState,
    ctx: &ChannelContext<'_>,
) -> (ChannelState, Vec<ChannelAction>) {
    let Some(commitments) = state.commitments().cloned() else {
        return command_not_valid(state, "ForceClose");
    };
    do_force_close(commitments, None, ctx.block_height)
}

/// Force close after a protocol violation: also error the peer.
pub(super) fn force_close_with_error(
    state: ChannelState,
    reason: ChannelError,
) -> (ChannelState, Vec<ChannelAction>) {
    let Some(commitments) = state.commitments().cloned() else {
        return command_not_valid(state, "ForceClose");
    };
    do_force_close(commitments, Some(reason), 0)
}

fn do_force_close(
    commitments: Commitments,
    error: Option<ChannelError>,
    _block_height: u32,
) -> (ChannelState, Vec<ChannelAction>) {
    let channel_id = commitments.params.channel_id;
    let local_commit_tx = commitments.latest().local_commit.tx.clone();
    let local_txid = local_commit_tx.compute_txid();
    let to_local = commitments.latest().local_commit.spec.to_local;

    warn!(%channel_id, %local_txid, "force-closing channel");

    let mut actions = Vec::new();
    if let Some(reason) = &error {
        actions.push(ChannelAction::SendMessage(LightningMessage::Error(
            ErrorMsg::new(channel_id, &reason.to_string()),
        )));
    }
    actions.push(ChannelAction::PublishTx(local_commit_tx.clone()));
    actions.push(ChannelAction::SendWatch(Watch::Confirmed {
        channel_id,
        txid: local_txid,
        min_depth: MIN_DEPTH,
    }));
    actions.push(ChannelAction::EmitEvent(ChannelEvent::ChannelClosing {
        channel_id,
        closing_type: ClosingType::Local,
    }));
    actions.push(ChannelAction::StoreOutgoingPayment(
        OnChainPayment::Close {
            id: PaymentId(id_from_txid(&local_txid)),
            amount: to_local,
            address: String::new(),
            mining_fee: Amount::from_sat(scripts::commit_fee_sat(
                commitments.latest().local_commit.spec.feerate_per_kw,
                commitments.latest().local_commit.spec.htlcs.len(),
            )),
            channel_id,
            txid: local_txid,
            closing_type: ClosingType::Local,
            created_at: TimestampMs::now(),
            confirmed_at: None,
            locked_at: None,
        },
    ));

    let state = ChannelState::Closing {
        commitments,
        spending_txs: SpendingTxs {
            local_commit_published: Some(local_commit_tx),
            ..Default::default()
        },
    };
    actions.extend(store_action(&state));
    (state, actions)
}

// --- Funding spent --- //

/// Some transaction spent one of our funding outputs. Classify it and
/// react: our own commit, the remote's current commit, a mutual close, or
/// a revoked remote commit (penalty mode).
pub(super) fn funding_spent(
    state: ChannelState,
    channel_id: ChannelId,
    outpoint: OutPoint,
    spending_tx: Transaction,
    ctx: &ChannelContext<'_>,
) -> (ChannelState, Vec<ChannelAction>) {
    let Some(commitments) = state.commitments().cloned() else {
        return (state, vec![]);
    };
    let spending_txid = spending_tx.compute_txid();
    let latest = commitments.latest();

    // When already Closing, just keep tracking the confirmed spend.
    let mut spending_txs = match &state {
        ChannelState::Closing { spending_txs, .. } => spending_txs.clone(),
        _ => SpendingTxs::default(),
    };

    let local_txid = latest.local_commit.txid();
    let remote_txid = latest.remote_commit.txid;
    let next_remote_txid = latest
        .next_remote_commit
        .as_ref()
        .map(|commit| commit.txid);

    let mut actions = Vec::new();
    let closing_type;

    if spending_txid == local_txid {
        closing_type = ClosingType::Local;
        spending_txs.local_commit_published = Some(spending_tx.clone());
    } else if spending_txid == remote_txid
        || Some(spending_txid) == next_remote_txid
    {
        info!(%channel_id, %spending_txid, "remote published its commitment");
        closing_type = ClosingType::Remote;
        spending_txs.remote_commit_published = Some(spending_tx.clone());
    } else if matches!(state, ChannelState::Negotiating { .. }) {
        // A spend while negotiating is the mutual close settling.
        closing_type = ClosingType::Mutual;
        spending_txs.mutual_close_published.push(spending_tx.clone());
    } else {
        // Not any current commitment: a revoked remote commitment. Claim
        // everything through the penalty path.
        error!(
            %channel_id,
            %spending_txid,
            "funding spent by a revoked commitment, publishing penalty",
        );
        closing_type = ClosingType::Revoked;
        let keys = ctx.keys.channel_keys(commitments.params.key_index);
        let claim_script =
            scripts::to_remote_script(&keys.payment_point(ctx.secp));
        let penalty = scripts::penalty_tx(
            &spending_tx,
            claim_script,
            ctx.feerates.fast,
        );
        if let Some(penalty) = &penalty {
            actions.push(ChannelAction::PublishTx(penalty.clone()));
        }
        // The commitment number cannot be recovered from the tx alone;
        // fetch the stored HTLC info to extend the claim if needed.
        actions.push(ChannelAction::GetHtlcInfos {
            revoked_commit_txid: spending_txid,
            commitment_number: commitments.remote_commit_index(),
        });
        spending_txs.revoked_commit_published.push(
            RevokedCommitPublished {
                commit_tx: spending_tx.clone(),
                penalty_tx: penalty,
            },
        );
    }

    let _ = outpoint;
    actions.push(ChannelAction::SendWatch(Watch::Confirmed {
        channel_id,
        txid: spending_txid,
        min_depth: MIN_DEPTH,
    }));
    actions.push(ChannelAction::EmitEvent(ChannelEvent::ChannelClosing {
        channel_id,
        closing_type,
    }));

    let state = ChannelState::Closing {
        commitments,
        spending_txs,
    };
    actions.extend(store_action(&state));
    (state, actions)
}

// --- State dispatch --- //

pub(super) fn process(
    state: ChannelState,
    cmd: ChannelCommand,
    ctx: &ChannelContext<'_>,
) -> (ChannelState, Vec<ChannelAction>) {
    match state {
        ChannelState::ShuttingDown {
            commitments,
            local_shutdown,
            remote_shutdown,
        } => process_shutting_down(
            commitments,
            local_shutdown,
            remote_shutdown,
            cmd,
            ctx,
        ),
        ChannelState::Negotiating {
            commitments,
            local_shutdown,
            remote_shutdown,
            local_closing_fee_sat,
        } => process_negotiating(
            commitments,
            local_shutdown,
            remote_shutdown,
            local_closing_fee_sat,
            cmd,
            ctx,
        ),
        ChannelState::Closing {
            commitments,
            spending_txs,
        } => process_closing(commitments, spending_txs, cmd, ctx),
        ChannelState::Closed { .. } => match cmd {
            ChannelCommand::CheckHtlcTimeout => (state, vec![]),
            cmd => command_not_valid(state, cmd.name()),
        },
        _ => unreachable!("dispatched with a non-closing state"),
    }
}

fn process_shutting_down(
    mut commitments: Commitments,
    local_shutdown: crate::wire::Shutdown,
    remote_shutdown: Option<crate::wire::Shutdown>,
    cmd: ChannelCommand,
    ctx: &ChannelContext<'_>,
) -> (ChannelState, Vec<ChannelAction>) {
    let rebuild = |commitments: Commitments,
                   remote_shutdown: Option<crate::wire::Shutdown>|
     -> ChannelState {
        ChannelState::ShuttingDown {
            commitments,
            local_shutdown: local_shutdown.clone(),
            remote_shutdown,
        }
    };

    match cmd {
        // No new HTLCs once shutdown has begun.
        ChannelCommand::AddHtlc(spec) => {
            let failed = super::AddHtlcFailed {
                channel_id: commitments.params.channel_id,
                payment_id: spec.payment_id,
                part_id: spec.part_id,
                reason: ChannelError::CommandNotValid {
                    state: "ShuttingDown",
                    command: "AddHtlc",
                },
            };
            (
                rebuild(commitments, remote_shutdown),
                vec![ChannelAction::AddFailed(failed)],
            )
        }

        ChannelCommand::FulfillHtlc {
            id,
            preimage,
            commit,
        } => match commitments.send_fulfill(id, preimage.0) {
            Ok(fulfill) => {
                let state = rebuild(commitments, remote_shutdown);
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
                rebuild(commitments, remote_shutdown),
                vec![ChannelAction::NotExecuted {
                    command: "FulfillHtlc",
                    error,
                }],
            ),
        },

        ChannelCommand::FailHtlc { id, reason, commit } =>
            match commitments.send_fail(id, reason) {
                Ok(fail) => {
                    let state = rebuild(commitments, remote_shutdown);
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
                    rebuild(commitments, remote_shutdown),
                    vec![ChannelAction::NotExecuted {
                        command: "FailHtlc",
                        error,
                    }],
                ),
            },

        ChannelCommand::Sign => {
            let keys = ctx.keys.channel_keys(commitments.params.key_index);
            match commitments.send_commit(&keys, ctx.secp) {
                Ok(msgs) => {
                    let state = rebuild(commitments, remote_shutdown);
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
                Err(
                    ChannelError::NoChangesToSign
                    | ChannelError::UnrevokedCommitment,
                ) => (rebuild(commitments, remote_shutdown), vec![]),
                Err(error) => (
                    rebuild(commitments, remote_shutdown),
                    vec![ChannelAction::NotExecuted {
                        command: "Sign",
                        error,
                    }],
                ),
            }
        }

        ChannelCommand::MessageReceived(msg) => match msg {
            LightningMessage::UpdateFulfillHtlc(fulfill) =>
                match commitments.receive_fulfill(&fulfill) {
                    Ok((origin, _amount)) => {
                        let settlement =
                            super::HtlcSettlement::Fulfilled {
                                origin,
                                preimage: crate::payments::PaymentPreimage(
                                    fulfill.payment_preimage,
                                ),
                            };
                        (
                            rebuild(commitments, remote_shutdown),
                            vec![ChannelAction::AddSettled(settlement)],
                        )
                    }
                    Err(error) => force_close_with_error(
                        rebuild(commitments, remote_shutdown),
                        error,
                    ),
                },

            LightningMessage::UpdateFailHtlc(fail) =>
                match commitments.receive_fail(&fail) {
                    Ok(()) =>
                        (rebuild(commitments, remote_shutdown), vec![]),
                    Err(error) => force_close_with_error(
                        rebuild(commitments, remote_shutdown),
                        error,
                    ),
                },

            LightningMessage::CommitmentSigned(commit_sig) => {
                let keys =
                    ctx.keys.channel_keys(commitments.params.key_index);
                match commitments.receive_commit(
                    &[commit_sig],
                    &keys,
                    ctx.secp,
                ) {
                    Ok(rev) => {
                        let mut actions =
                            vec![ChannelAction::SendMessage(
                                LightningMessage::RevokeAndAck(rev),
                            )];
                        if commitments.changes.local_has_changes() {
                            actions.push(ChannelAction::SendToSelf(
                                Box::new(ChannelCommand::Sign),
                            ));
                        }
                        let state = rebuild(commitments, remote_shutdown);
                        actions.extend(store_action(&state));
                        (state, actions)
                    }
                    Err(error) => force_close_with_error(
                        rebuild(commitments, remote_shutdown),
                        error,
                    ),
                }
            }

            LightningMessage::RevokeAndAck(rev) => {
                match commitments.receive_revocation(&rev, ctx.secp) {
                    Ok(outcome) => {
                        let mut actions = Vec::new();
                        for (origin, reason) in outcome.failed {
                            actions.push(ChannelAction::AddSettled(
                                super::HtlcSettlement::Failed {
                                    origin,
                                    reason,
                                },
                            ));
                        }
                        // Once all HTLCs have settled, move on to fee
                        // negotiation.
                        let no_htlcs = commitments
                            .projected_spec()
                            .htlcs
                            .is_empty();
                        let state = match (no_htlcs, remote_shutdown) {
                            (true, Some(remote_shutdown)) => {
                                let negotiating =
                                    ChannelState::Negotiating {
                                        commitments,
                                        local_shutdown: local_shutdown
                                            .clone(),
                                        remote_shutdown,
                                        local_closing_fee_sat: None,
                                    };
                                if let Some(c) =
                                    negotiating.commitments()
                                {
                                    if c.params.local_is_initiator {
                                        actions.push(
                                            ChannelAction::SendToSelf(
                                                Box::new(
                                                    ChannelCommand::Close {
                                                        script_pubkey:
                                                            None,
                                                        feerate_per_kw:
                                                            None,
                                                    },
                                                ),
                                            ),
                                        );
                                    }
                                }
                                negotiating
                            }
                            (_, remote_shutdown) =>
                                rebuild(commitments, remote_shutdown),
                        };
                        actions.extend(store_action(&state));
                        (state, actions)
                    }
                    Err(error) => force_close_with_error(
                        rebuild(commitments, remote_shutdown),
                        error,
                    ),
                }
            }

            LightningMessage::Shutdown(their_shutdown) =>
                (rebuild(commitments, Some(their_shutdown)), vec![]),

            _ => unexpected_message(
                rebuild(commitments, remote_shutdown),
                "message while shutting down",
            ),
        },

        ChannelCommand::CheckHtlcTimeout => {
            let expired = {
                let projected = commitments.projected_spec();
                projected.htlcs.iter().any(|htlc| {
                    ctx.block_height + super::HTLC_SAFETY_DELTA
                        >= htlc.add.cltv_expiry
                })
            };
            if expired {
                force_close(rebuild(commitments, remote_shutdown), ctx)
            } else {
                (rebuild(commitments, remote_shutdown), vec![])
            }
        }

        cmd => command_not_valid(
            rebuild(commitments, remote_shutdown),
            cmd.name(),
        ),
    }
}

fn process_negotiating(
    commitments: Commitments,
    local_shutdown: crate::wire::Shutdown,
    remote_shutdown: crate::wire::Shutdown,
    local_closing_fee_sat: Option<u64>,
    cmd: ChannelCommand,
    ctx: &ChannelContext<'_>,
) -> (ChannelState, Vec<ChannelAction>) {
    match cmd {
        // (Re-)propose a closing fee.
        ChannelCommand::Close { feerate_per_kw, .. } => {
            let feerate =
                feerate_per_kw.unwrap_or(ctx.feerates.mutual_close);
            let fee_sat = scripts::weight_to_fee_sat(feerate, 724);
            let (closing_signed, _tx) = make_closing_signed(
                &commitments,
                &local_shutdown,
                &remote_shutdown,
                fee_sat,
                ctx,
            );
            let state = ChannelState::Negotiating {
                commitments,
                local_shutdown,
                remote_shutdown,
                local_closing_fee_sat: Some(fee_sat),
            };
            let mut actions = vec![ChannelAction::SendMessage(
                LightningMessage::ClosingSigned(closing_signed),
            )];
            actions.extend(store_action(&state));
            (state, actions)
        }

        ChannelCommand::MessageReceived(
            LightningMessage::ClosingSigned(their_closing),
        ) => {
            let agreed = local_closing_fee_sat
                .map(|ours| ours == their_closing.fee_sat)
                .unwrap_or(false);
            if agreed || local_closing_fee_sat.is_some() {
                // Accept the peer's fee and settle.
                let (our_closing, close_tx) = make_closing_signed(
                    &commitments,
                    &local_shutdown,
                    &remote_shutdown,
                    their_closing.fee_sat,
                    ctx,
                );
                let close_tx = finalize_mutual_close(
                    close_tx,
                    &commitments,
                    &our_closing,
                    &their_closing,
                    ctx,
                );
                let channel_id = commitments.params.channel_id;
                let closing_txid = close_tx.compute_txid();
                let to_local =
                    commitments.latest().local_commit.spec.to_local;
                info!(%channel_id, %closing_txid, "mutual close agreed");

                let mut actions = Vec::new();
                if !agreed {
                    actions.push(ChannelAction::SendMessage(
                        LightningMessage::ClosingSigned(our_closing),
                    ));
                }
                actions.push(ChannelAction::PublishTx(close_tx.clone()));
                actions.push(ChannelAction::SendWatch(
                    Watch::Confirmed {
                        channel_id,
                        txid: closing_txid,
                        min_depth: MIN_DEPTH,
                    },
                ));
                actions.push(ChannelAction::EmitEvent(
                    ChannelEvent::ChannelClosing {
                        channel_id,
                        closing_type: ClosingType::Mutual,
                    },
                ));
                actions.push(ChannelAction::StoreOutgoingPayment(
                    OnChainPayment::Close {
                        id: PaymentId(id_from_txid(&closing_txid)),
                        amount: to_local,
                        address: local_shutdown
                            .script_pubkey
                            .to_string(),
                        mining_fee: Amount::from_sat(
                            their_closing.fee_sat,
                        ),
                        channel_id,
                        txid: closing_txid,
                        closing_type: ClosingType::Mutual,
                        created_at: TimestampMs::now(),
                        confirmed_at: None,
                        locked_at: None,
                    },
                ));
                let state = ChannelState::Closing {
                    commitments,
                    spending_txs: SpendingTxs {
                        mutual_close_published: vec![close_tx],
                        ..Default::default()
                    },
                };
                actions.extend(store_action(&state));
                (state, actions)
            } else {
                // They proposed first; respond with the same fee to
                // converge immediately.
                let state = ChannelState::Negotiating {
                    commitments,
                    local_shutdown,
                    remote_shutdown,
                    local_closing_fee_sat,
                };
                let actions = vec![ChannelAction::SendToSelf(Box::new(
                    ChannelCommand::Close {
                        script_pubkey: None,
                        feerate_per_kw: None,
                    },
                ))];
                let _ = their_closing;
                (state, actions)
            }
        }

        ChannelCommand::CheckHtlcTimeout => (
            ChannelState::Negotiating {
                commitments,
                local_shutdown,
                remote_shutdown,
                local_closing_fee_sat,
            },
            vec![],
        ),

        cmd => command_not_valid(
            ChannelState::Negotiating {
                commitments,
                local_shutdown,
                remote_shutdown,
                local_closing_fee_sat,
            },
            cmd.name(),
        ),
    }
}

fn process_closing(
    commitments: Commitments,
    spending_txs: SpendingTxs,
    cmd: ChannelCommand,
    _ctx: &ChannelContext<'_>,
) -> (ChannelState, Vec<ChannelAction>) {
    match cmd {
        ChannelCommand::WatchReceived(WatchEvent::Confirmed {
            txid, ..
        }) => {
            let Some(closing_type) = spending_txs.closing_type_for(txid)
            else {
                return (
                    ChannelState::Closing {
                        commitments,
                        spending_txs,
                    },
                    vec![],
                );
            };
            let channel_id = commitments.params.channel_id;
            info!(%channel_id, %txid, ?closing_type, "closing tx confirmed");
            let state = ChannelState::Closed {
                channel_id,
                closing_type,
                closing_txid: txid,
                closed_at: TimestampMs::now(),
            };
            let mut actions = vec![
                ChannelAction::SetLocked(txid),
                ChannelAction::EmitEvent(ChannelEvent::ChannelClosed {
                    channel_id,
                }),
            ];
            actions.extend(store_action(&state));
            (state, actions)
        }

        ChannelCommand::GetHtlcInfosResponse {
            revoked_commit_txid,
            htlc_infos,
        } => {
            // The penalty tx already claims every output; the HTLC info
            // only serves logging / accounting here.
            info!(
                %revoked_commit_txid,
                htlcs = htlc_infos.len(),
                "htlc info for revoked commitment",
            );
            (
                ChannelState::Closing {
                    commitments,
                    spending_txs,
                },
                vec![],
            )
        }

        ChannelCommand::CheckHtlcTimeout => (
            ChannelState::Closing {
                commitments,
                spending_txs,
            },
            vec![],
        ),

        ChannelCommand::MessageReceived(..) => (
            // The peer may still retransmit while we wait for
            // confirmations; nothing changes our course now.
            ChannelState::Closing {
                commitments,
                spending_txs,
            },
            vec![],
        ),

        cmd => command_not_valid(
            ChannelState::Closing {
                commitments,
                spending_txs,
            },
            cmd.name(),
        ),
    }
}

// --- Mutual close construction --- //

/// Build the mutual close tx at `fee_sat` and our signature over it.
fn make_closing_signed(
    commitments: &Commitments,
    local_shutdown: &crate::wire::Shutdown,
    remote_shutdown: &crate::wire::Shutdown,
    fee_sat: u64,
    ctx: &ChannelContext<'_>,
) -> (ClosingSigned, Transaction) {
    let keys = ctx.keys.channel_keys(commitments.params.key_index);
    let tx = mutual_close_tx(
        commitments,
        &local_shutdown.script_pubkey,
        &remote_shutdown.script_pubkey,
        fee_sat,
    );
    let digest = super::commitments::funding_sighash(
        &tx,
        commitments.latest(),
        &commitments.params,
        &keys,
        ctx.secp,
    )
    .unwrap_or([0u8; 32]);
    let signature = ctx
        .secp
        .sign_ecdsa(&Message::from_digest(digest), &keys.funding_key);
    (
        ClosingSigned {
            channel_id: commitments.params.channel_id,
            fee_sat,
            signature,
            fee_range: None,
        },
        tx,
    )
}

fn mutual_close_tx(
    commitments: &Commitments,
    local_script: &ScriptBuf,
    remote_script: &ScriptBuf,
    fee_sat: u64,
) -> Transaction {
    let spec = &commitments.latest().local_commit.spec;
    let mut to_local_sat = spec.to_local.sats_floor();
    let mut to_remote_sat = spec.to_remote.sats_floor();
    // The funder pays the closing fee.
    if commitments.params.local_is_initiator {
        to_local_sat = to_local_sat.saturating_sub(fee_sat);
    } else {
        to_remote_sat = to_remote_sat.saturating_sub(fee_sat);
    }

    let dust = commitments.params.local.dust_limit_sat;
    let mut outputs = Vec::new();
    if to_local_sat >= dust {
        outputs.push(TxOut {
            value: SatAmount::from_sat(to_local_sat),
            script_pubkey: local_script.clone(),
        });
    }
    if to_remote_sat >= dust {
        outputs.push(TxOut {
            value: SatAmount::from_sat(to_remote_sat),
            script_pubkey: remote_script.clone(),
        });
    }
    outputs.sort_by(|a, b| {
        a.value
            .cmp(&b.value)
            .then_with(|| a.script_pubkey.cmp(&b.script_pubkey))
    });

    Transaction {
        version: bitcoin::transaction::Version::TWO,
        lock_time: bitcoin::absolute::LockTime::ZERO,
        input: vec![TxIn {
            previous_output: commitments.latest().funding_outpoint(),
            script_sig: ScriptBuf::new(),
            sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
            witness: Witness::new(),
        }],
        output: outputs,
    }
}

/// Fill the 2-of-2 witness with both signatures, low-pubkey first.
fn finalize_mutual_close(
    mut tx: Transaction,
    commitments: &Commitments,
    ours: &ClosingSigned,
    theirs: &ClosingSigned,
    ctx: &ChannelContext<'_>,
) -> Transaction {
    let keys = ctx.keys.channel_keys(commitments.params.key_index);
    let local_pubkey = keys.funding_pubkey(ctx.secp);
    let remote_pubkey = commitments.params.remote.funding_pubkey;

    let mut our_sig = ours.signature.serialize_der().to_vec();
    our_sig.push(bitcoin::sighash::EcdsaSighashType::All as u8);
    let mut their_sig = theirs.signature.serialize_der().to_vec();
    their_sig.push(bitcoin::sighash::EcdsaSighashType::All as u8);

    let (first, second) =
        if local_pubkey.serialize() <= remote_pubkey.serialize() {
            (our_sig, their_sig)
        } else {
            (their_sig, our_sig)
        };

    let witness_script =
        scripts::funding_script(&local_pubkey, &remote_pubkey);
    let mut witness = Witness::new();
    witness.push(Vec::new()); // CHECKMULTISIG off-by-one
    witness.push(first);
    witness.push(second);
    witness.push(witness_script.to_bytes());
    tx.input[0].witness = witness;
    tx
}

fn id_from_txid(txid: &Txid) -> [u8; 16] {
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
    use crate::keys::{KeyManager, SeedKeyManager};

    fn test_ctx<'a>(
        keys: &'a SeedKeyManager,
        secp: &'a Secp256k1<bitcoin::secp256k1::All>,
    ) -> ChannelContext<'a> {
        ChannelContext {
            local_node_id: keys.node_id(),
            remote_node_id: SeedKeyManager::new([2; 32]).node_id(),
            chain_hash: [6; 32],
            block_height: 700_000,
            feerates: crate::electrum::FeeratesPerKw::FALLBACK,
            keys,
            secp,
        }
    }

    #[test]
    fn force_close_publishes_local_commit_and_records_close() {
        let km = SeedKeyManager::new([1; 32]);
        let secp = Secp256k1::new();
        let ctx = test_ctx(&km, &secp);

        let (state, actions) =
            normal_state().process(ChannelCommand::ForceClose, &ctx);
        assert_eq!(state.name(), "Closing");
        assert!(actions.iter().any(|action| matches!(
            action,
            ChannelAction::PublishTx(..),
        )));
        assert!(actions.iter().any(|action| matches!(
            action,
            ChannelAction::StoreOutgoingPayment(
                OnChainPayment::Close { .. },
            ),
        )));
    }

    #[test]
    fn revoked_commitment_spend_triggers_penalty() {
        let km = SeedKeyManager::new([1; 32]);
        let secp = Secp256k1::new();
        let ctx = test_ctx(&km, &secp);
        let (commitments, ..) = fixture();
        let channel_id = commitments.params.channel_id;
        let funding_outpoint = commitments.latest().funding_outpoint();

        // A spending tx that matches none of the known commitments.
        let rogue = Transaction {
            version: bitcoin::transaction::Version::TWO,
            lock_time: bitcoin::absolute::LockTime::ZERO,
            input: vec![TxIn {
                previous_output: funding_outpoint,
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: vec![TxOut {
                value: SatAmount::from_sat(99_000),
                script_pubkey: ScriptBuf::new(),
            }],
        };

        let (state, actions) = normal_state().process(
            ChannelCommand::WatchReceived(WatchEvent::Spent {
                channel_id,
                outpoint: funding_outpoint,
                spending_tx: rogue,
            }),
            &ctx,
        );
        assert_eq!(state.name(), "Closing");
        // The penalty tx claiming the rogue commitment must be published
        // and the stored htlc info requested.
        assert!(actions.iter().any(|action| matches!(
            action,
            ChannelAction::PublishTx(..),
        )));
        assert!(actions.iter().any(|action| matches!(
            action,
            ChannelAction::GetHtlcInfos { .. },
        )));
    }

    #[test]
    fn fee_negotiation_converges_and_publishes_mutual_close() {
        let km = SeedKeyManager::new([1; 32]);
        let secp = Secp256k1::new();
        let ctx = test_ctx(&km, &secp);

        // Enter Negotiating via a remote shutdown with no HTLCs in
        // flight.
        let shutdown = crate::wire::Shutdown {
            channel_id: normal_state().channel_ids()[0],
            script_pubkey: ScriptBuf::new(),
        };
        let (state, _) = normal_state().process(
            ChannelCommand::MessageReceived(
                crate::wire::LightningMessage::Shutdown(shutdown),
            ),
            &ctx,
        );
        assert_eq!(state.name(), "Negotiating");

        // We propose a fee...
        let (state, actions) = state.process(
            ChannelCommand::Close {
                script_pubkey: None,
                feerate_per_kw: None,
            },
            &ctx,
        );
        let our_closing = actions
            .iter()
            .find_map(|action| match action {
                ChannelAction::SendMessage(
                    LightningMessage::ClosingSigned(msg),
                ) => Some(msg.clone()),
                _ => None,
            })
            .expect("closing_signed sent");

        // ...and the peer agrees on the same fee.
        let (state, actions) = state.process(
            ChannelCommand::MessageReceived(
                LightningMessage::ClosingSigned(our_closing),
            ),
            &ctx,
        );
        assert_eq!(state.name(), "Closing");
        assert!(actions.iter().any(|action| matches!(
            action,
            ChannelAction::PublishTx(..),
        )));
        assert!(actions.iter().any(|action| matches!(
            action,
            ChannelAction::EmitEvent(ChannelEvent::ChannelClosing {
                closing_type: ClosingType::Mutual,
                ..
            }),
        )));
    }

    #[test]
    fn closing_tx_confirmation_closes_the_channel() {
        let km = SeedKeyManager::new([1; 32]);
        let secp = Secp256k1::new();
        let ctx = test_ctx(&km, &secp);

        let (state, _) =
            normal_state().process(ChannelCommand::ForceClose, &ctx);
        let closing_txid = match &state {
            ChannelState::Closing { spending_txs, .. } => spending_txs
                .local_commit_published
                .as_ref()
                .unwrap()
                .compute_txid(),
            other => panic!("expected Closing, got {}", other.name()),
        };
        let channel_id = state.channel_ids()[0];

        let (state, actions) = state.process(
            ChannelCommand::WatchReceived(WatchEvent::Confirmed {
                channel_id,
                txid: closing_txid,
                block_height: 700_100,
                tx: Transaction {
                    version: bitcoin::transaction::Version::TWO,
                    lock_time: bitcoin::absolute::LockTime::ZERO,
                    input: vec![],
                    output: vec![],
                },
            }),
            &ctx,
        );
        assert_eq!(state.name(), "Closed");
        assert!(actions.iter().any(|action| matches!(
            action,
            ChannelAction::EmitEvent(ChannelEvent::ChannelClosed { .. }),
        )));
        assert!(actions.iter().any(|action| matches!(
            action,
            ChannelAction::SetLocked(..),
        )));
    }
}
