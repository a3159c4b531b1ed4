//! Funding-phase transitions: dual-funded open negotiation, the
//! interactive-tx construction round, first-commitment signing, and
//! confirmation handling up to `Normal`.

use bitcoin::secp256k1::Message;
use common::amount::Amount;
use tracing::{debug, info};

use super::{
    command_not_valid,
    commitments::{
        build_commit_tx_for_local, build_commit_tx_for_remote,
        funding_sighash, ChannelParams, Commitment, CommitmentChanges,
        CommitmentSpec, Commitments, FundingStatus, LocalCommit,
        LocalParams, RemoteCommit, RemoteParams,
    },
    interactive_tx::{
        BuiltFundingTx, InteractiveTxParams, InteractiveTxSession,
    },
    normal::NormalData,
    scripts, store_action, unexpected_message, ChannelAction,
    ChannelCommand, ChannelContext, ChannelError, ChannelEvent, ChannelId,
    ChannelState, InitiatorInit, NonInitiatorInit, ShortChannelId,
    MIN_DEPTH, TO_SELF_DELAY,
};
use crate::{
    electrum::Watch,
    payments::ReceivedWith,
    wire::{
        AcceptChannel2, ChannelOrigin, ChannelReady, CommitmentSigned,
        ErrorMsg, LightningMessage, OpenChannel2, TxAbort, TxSignatures,
    },
};

// Default local limits for new channels.
const DUST_LIMIT_SAT: u64 = 546;
const MAX_HTLC_VALUE_IN_FLIGHT_MSAT: u64 = 150_000_000;
const MAX_ACCEPTED_HTLCS: u16 = 30;
const HTLC_MINIMUM_MSAT: u64 = 1;

fn default_local_params(funding_sat: u64) -> LocalParams {
    LocalParams {
        dust_limit_sat: DUST_LIMIT_SAT,
        max_htlc_value_in_flight: Amount::from_msat(
            MAX_HTLC_VALUE_IN_FLIGHT_MSAT,
        ),
        // 1% reserve, floored at the dust limit.
        channel_reserve_sat: (funding_sat / 100).max(DUST_LIMIT_SAT),
        htlc_minimum: Amount::from_msat(HTLC_MINIMUM_MSAT),
        to_self_delay: TO_SELF_DELAY,
        max_accepted_htlcs: MAX_ACCEPTED_HTLCS,
    }
}

/// Everything negotiated before the interactive round completes.
#[derive(Clone, Debug)]
pub struct FundingNegotiation {
    pub temporary_channel_id: ChannelId,
    pub is_initiator: bool,
    pub key_index: u64,
    pub local_contribution_sat: u64,
    pub remote_contribution_sat: u64,
    /// Amount pushed to the non-initiator at opening (msat).
    pub push_amount: Amount,
    pub commitment_feerate_per_kw: u32,
    pub local: LocalParams,
    pub remote: RemoteParams,
    pub first_remote_point: bitcoin::secp256k1::PublicKey,
    pub channel_flags: u8,
    pub origin: Option<ChannelOrigin>,
}

impl FundingNegotiation {
    fn funding_amount_sat(&self) -> u64 {
        self.local_contribution_sat + self.remote_contribution_sat
    }
}

/// State between the interactive round completing and `tx_signatures`
/// being exchanged.
#[derive(Clone, Debug)]
pub struct SigningSession {
    pub temporary_channel_id: ChannelId,
    pub commitments: Commitments,
    pub built: BuiltFundingTx,
    pub session: InteractiveTxSession,
    pub negotiation: FundingNegotiation,
    pub remote_commit_sig_received: bool,
    pub local_sigs: Option<TxSignatures>,
    pub remote_sigs: Option<TxSignatures>,
}

/// Dispatch for all funding-phase states.
pub(super) fn process(
    state: ChannelState,
    cmd: ChannelCommand,
    ctx: &ChannelContext<'_>,
) -> (ChannelState, Vec<ChannelAction>) {
    match (state, cmd) {
        (
            ChannelState::WaitForInit,
            ChannelCommand::InitNonInitiator(init),
        ) => (ChannelState::WaitForOpenChannel { init }, vec![]),

        (
            ChannelState::WaitForInit,
            ChannelCommand::InitInitiator(init),
        ) => init_initiator(init, ctx),

        (
            ChannelState::WaitForOpenChannel { init },
            ChannelCommand::MessageReceived(LightningMessage::OpenChannel2(
                open,
            )),
        ) => receive_open_channel(init, open, ctx),

        (
            ChannelState::WaitForAcceptChannel { init, open_sent },
            ChannelCommand::MessageReceived(
                LightningMessage::AcceptChannel2(accept),
            ),
        ) => receive_accept_channel(init, open_sent, accept, ctx),

        (
            ChannelState::WaitForFundingCreated {
                init_funding,
                mut session,
            },
            ChannelCommand::MessageReceived(msg),
        ) => match &msg {
            LightningMessage::TxAddInput(..)
            | LightningMessage::TxAddOutput(..)
            | LightningMessage::TxRemoveInput(..)
            | LightningMessage::TxRemoveOutput(..)
            | LightningMessage::TxComplete(..) => {
                match session.receive(&msg) {
                    Ok(step) => {
                        let mut actions = step
                            .messages
                            .into_iter()
                            .map(ChannelAction::SendMessage)
                            .collect::<Vec<_>>();
                        match step.built {
                            Some(built) => {
                                let (state, mut more) = funding_tx_built(
                                    init_funding,
                                    session,
                                    built,
                                    ctx,
                                );
                                actions.append(&mut more);
                                (state, actions)
                            }
                            None => (
                                ChannelState::WaitForFundingCreated {
                                    init_funding,
                                    session,
                                },
                                actions,
                            ),
                        }
                    }
                    Err(error) => abort_funding(
                        init_funding.temporary_channel_id,
                        session.local_input_outpoints(),
                        error,
                    ),
                }
            }
            LightningMessage::TxAbort(..) => {
                info!("peer aborted the interactive funding");
                let outpoints = session.local_input_outpoints();
                let mut actions =
                    vec![ChannelAction::SendMessage(
                        LightningMessage::TxAbort(TxAbort::new(
                            init_funding.temporary_channel_id,
                            "acked",
                        )),
                    )];
                if !outpoints.is_empty() {
                    actions.push(ChannelAction::UnlockWalletInputs(
                        outpoints,
                    ));
                }
                (ChannelState::Aborted, actions)
            }
            _ => unexpected_message(
                ChannelState::WaitForFundingCreated {
                    init_funding,
                    session,
                },
                "non-interactive message",
            ),
        },

        (
            ChannelState::WaitForFundingSigned { signing },
            ChannelCommand::MessageReceived(msg),
        ) => match msg {
            LightningMessage::CommitmentSigned(commit_sig) =>
                receive_first_commit_sig(signing, commit_sig, ctx),
            LightningMessage::TxSignatures(remote_sigs) =>
                receive_tx_signatures(signing, remote_sigs, ctx),
            LightningMessage::TxAbort(..) => {
                let outpoints = signing.session.local_input_outpoints();
                let mut actions = Vec::new();
                if !outpoints.is_empty() {
                    actions.push(ChannelAction::UnlockWalletInputs(
                        outpoints,
                    ));
                }
                (ChannelState::Aborted, actions)
            }
            _ => unexpected_message(
                ChannelState::WaitForFundingSigned { signing },
                "non-signing message",
            ),
        },

        (
            ChannelState::WaitForFundingConfirmed {
                mut commitments,
                their_channel_ready,
            },
            ChannelCommand::WatchReceived(
                crate::electrum::WatchEvent::Confirmed {
                    txid,
                    block_height,
                    ..
                },
            ),
        ) => {
            let matches_funding = commitments
                .active
                .iter()
                .any(|commitment| commitment.funding_txid == txid);
            if !matches_funding {
                return (
                    ChannelState::WaitForFundingConfirmed {
                        commitments,
                        their_channel_ready,
                    },
                    vec![],
                );
            }
            for commitment in &mut commitments.active {
                if commitment.funding_txid == txid {
                    commitment.funding_status =
                        FundingStatus::Confirmed { block_height };
                }
            }
            funding_confirmed(
                commitments,
                their_channel_ready,
                block_height,
                ctx,
            )
        }

        (
            ChannelState::WaitForFundingConfirmed {
                commitments,
                their_channel_ready: _,
            },
            ChannelCommand::MessageReceived(LightningMessage::ChannelReady(
                ready,
            )),
        ) => {
            debug!(channel_id = %ready.channel_id, "peer channel_ready");
            (
                ChannelState::WaitForFundingConfirmed {
                    commitments,
                    their_channel_ready: Some(ready),
                },
                vec![],
            )
        }

        (
            ChannelState::WaitForChannelReady {
                commitments,
                short_channel_id,
            },
            ChannelCommand::MessageReceived(LightningMessage::ChannelReady(
                _ready,
            )),
        ) => {
            let state = ChannelState::Normal(NormalData {
                commitments,
                short_channel_id,
                remote_channel_update: None,
                splice_session: None,
                local_shutdown_sent: None,
                their_splice_locked: None,
            });
            let channel_id = state
                .channel_ids()
                .first()
                .copied()
                .unwrap_or(ChannelId::ZERO);
            info!(%channel_id, "channel is open");
            let mut actions = vec![ChannelAction::EmitEvent(
                ChannelEvent::ChannelOpened { channel_id },
            )];
            actions.extend(store_action(&state));
            (state, actions)
        }

        // HTLC-timeout sweeps are harmless before Normal: no HTLCs yet.
        (state, ChannelCommand::CheckHtlcTimeout) => (state, vec![]),

        (state, cmd) => command_not_valid(state, cmd.name()),
    }
}

/// Legacy channels predate the `channel_ready` exchange; once the funding
/// confirms they move straight into the modern flow.
pub(super) fn process_legacy(
    commitments: Commitments,
    cmd: ChannelCommand,
    ctx: &ChannelContext<'_>,
) -> (ChannelState, Vec<ChannelAction>) {
    match cmd {
        ChannelCommand::WatchReceived(
            crate::electrum::WatchEvent::Confirmed {
                block_height, ..
            },
        ) => funding_confirmed(commitments, None, block_height, ctx),
        ChannelCommand::CheckHtlcTimeout =>
            (ChannelState::LegacyWaitForFundingConfirmed { commitments }, vec![]),
        cmd => command_not_valid(
            ChannelState::LegacyWaitForFundingConfirmed { commitments },
            cmd.name(),
        ),
    }
}

// --- Open / accept --- //

fn init_initiator(
    init: InitiatorInit,
    ctx: &ChannelContext<'_>,
) -> (ChannelState, Vec<ChannelAction>) {
    let keys = ctx.keys.channel_keys(init.key_index);
    let temporary_channel_id = derive_temporary_id(&keys, ctx);
    let funding_sat = init.funding_amount.sats_floor();
    let local = default_local_params(funding_sat);

    let open = OpenChannel2 {
        chain_hash: ctx.chain_hash,
        temporary_channel_id,
        funding_feerate_per_kw: init.funding_feerate_per_kw,
        commitment_feerate_per_kw: init.commitment_feerate_per_kw,
        funding_amount_sat: funding_sat,
        dust_limit_sat: local.dust_limit_sat,
        max_htlc_value_in_flight: local.max_htlc_value_in_flight,
        htlc_minimum: local.htlc_minimum,
        to_self_delay: local.to_self_delay,
        max_accepted_htlcs: local.max_accepted_htlcs,
        lock_time: ctx.block_height,
        funding_pubkey: keys.funding_pubkey(ctx.secp),
        revocation_basepoint: keys.revocation_basepoint(ctx.secp),
        payment_basepoint: keys.payment_point(ctx.secp),
        delayed_payment_basepoint: keys.delayed_payment_basepoint(ctx.secp),
        htlc_basepoint: keys.htlc_basepoint(ctx.secp),
        first_per_commitment_point: keys
            .per_commitment_point(ctx.secp, 0),
        second_per_commitment_point: keys
            .per_commitment_point(ctx.secp, 1),
        channel_flags: init.channel_flags,
        channel_type: None,
        push_amount: (!init.push_amount.is_zero())
            .then_some(init.push_amount),
        origin: None,
    };

    let actions =
        vec![ChannelAction::SendMessage(LightningMessage::OpenChannel2(
            open.clone(),
        ))];
    (
        ChannelState::WaitForAcceptChannel {
            init,
            open_sent: open,
        },
        actions,
    )
}

fn receive_open_channel(
    init: NonInitiatorInit,
    open: OpenChannel2,
    ctx: &ChannelContext<'_>,
) -> (ChannelState, Vec<ChannelAction>) {
    let push = open.push_amount.unwrap_or(Amount::ZERO);
    let funding = Amount::from_sat(
        open.funding_amount_sat + init.funding_contribution.sats_floor(),
    );
    if funding < push {
        let error = ChannelError::FundingBelowPush {
            funding,
            push,
        };
        return abort_funding(
            open.temporary_channel_id,
            init.wallet_inputs
                .iter()
                .map(|input| input.outpoint)
                .collect(),
            error,
        );
    }

    let keys = ctx.keys.channel_keys(init.key_index);
    let local_contribution_sat = init.funding_contribution.sats_floor();
    let local = default_local_params(funding.sats_floor());

    let accept = AcceptChannel2 {
        temporary_channel_id: open.temporary_channel_id,
        funding_amount_sat: local_contribution_sat,
        dust_limit_sat: local.dust_limit_sat,
        max_htlc_value_in_flight: local.max_htlc_value_in_flight,
        htlc_minimum: local.htlc_minimum,
        minimum_depth: MIN_DEPTH,
        to_self_delay: local.to_self_delay,
        max_accepted_htlcs: local.max_accepted_htlcs,
        funding_pubkey: keys.funding_pubkey(ctx.secp),
        revocation_basepoint: keys.revocation_basepoint(ctx.secp),
        payment_basepoint: keys.payment_point(ctx.secp),
        delayed_payment_basepoint: keys.delayed_payment_basepoint(ctx.secp),
        htlc_basepoint: keys.htlc_basepoint(ctx.secp),
        first_per_commitment_point: keys
            .per_commitment_point(ctx.secp, 0),
        second_per_commitment_point: keys
            .per_commitment_point(ctx.secp, 1),
        channel_type: open.channel_type.clone(),
    };

    let negotiation = FundingNegotiation {
        temporary_channel_id: open.temporary_channel_id,
        is_initiator: false,
        key_index: init.key_index,
        local_contribution_sat,
        remote_contribution_sat: open.funding_amount_sat,
        push_amount: push,
        commitment_feerate_per_kw: open.commitment_feerate_per_kw,
        local,
        remote: RemoteParams {
            dust_limit_sat: open.dust_limit_sat,
            max_htlc_value_in_flight: open.max_htlc_value_in_flight,
            channel_reserve_sat: (open.funding_amount_sat / 100)
                .max(DUST_LIMIT_SAT),
            htlc_minimum: open.htlc_minimum,
            to_self_delay: open.to_self_delay,
            max_accepted_htlcs: open.max_accepted_htlcs,
            funding_pubkey: open.funding_pubkey,
            revocation_basepoint: open.revocation_basepoint,
            payment_basepoint: open.payment_basepoint,
            delayed_payment_basepoint: open.delayed_payment_basepoint,
            htlc_basepoint: open.htlc_basepoint,
        },
        first_remote_point: open.first_per_commitment_point,
        channel_flags: open.channel_flags,
        origin: open.origin.clone(),
    };

    let funding_script = scripts::funding_script(
        &keys.funding_pubkey(ctx.secp),
        &open.funding_pubkey,
    );
    let session = InteractiveTxSession::new(
        InteractiveTxParams {
            channel_id: open.temporary_channel_id,
            is_initiator: false,
            funding_amount_sat: negotiation.funding_amount_sat(),
            funding_script,
            target_feerate_per_kw: open.funding_feerate_per_kw,
            lock_time: open.lock_time,
            shared_input: None,
        },
        &init.wallet_inputs,
        vec![],
    );

    let actions = vec![ChannelAction::SendMessage(
        LightningMessage::AcceptChannel2(accept),
    )];
    (
        ChannelState::WaitForFundingCreated {
            init_funding: negotiation,
            session,
        },
        actions,
    )
}

fn receive_accept_channel(
    init: InitiatorInit,
    open_sent: OpenChannel2,
    accept: AcceptChannel2,
    ctx: &ChannelContext<'_>,
) -> (ChannelState, Vec<ChannelAction>) {
    let keys = ctx.keys.channel_keys(init.key_index);
    let negotiation = FundingNegotiation {
        temporary_channel_id: open_sent.temporary_channel_id,
        is_initiator: true,
        key_index: init.key_index,
        local_contribution_sat: open_sent.funding_amount_sat,
        remote_contribution_sat: accept.funding_amount_sat,
        push_amount: init.push_amount,
        commitment_feerate_per_kw: open_sent.commitment_feerate_per_kw,
        local: default_local_params(
            open_sent.funding_amount_sat + accept.funding_amount_sat,
        ),
        remote: RemoteParams {
            dust_limit_sat: accept.dust_limit_sat,
            max_htlc_value_in_flight: accept.max_htlc_value_in_flight,
            channel_reserve_sat: ((open_sent.funding_amount_sat
                + accept.funding_amount_sat)
                / 100)
                .max(DUST_LIMIT_SAT),
            htlc_minimum: accept.htlc_minimum,
            to_self_delay: accept.to_self_delay,
            max_accepted_htlcs: accept.max_accepted_htlcs,
            funding_pubkey: accept.funding_pubkey,
            revocation_basepoint: accept.revocation_basepoint,
            payment_basepoint: accept.payment_basepoint,
            delayed_payment_basepoint: accept.delayed_payment_basepoint,
            htlc_basepoint: accept.htlc_basepoint,
        },
        first_remote_point: accept.first_per_commitment_point,
        channel_flags: open_sent.channel_flags,
        origin: None,
    };

    let funding_script = scripts::funding_script(
        &keys.funding_pubkey(ctx.secp),
        &accept.funding_pubkey,
    );
    let mut session = InteractiveTxSession::new(
        InteractiveTxParams {
            channel_id: open_sent.temporary_channel_id,
            is_initiator: true,
            funding_amount_sat: negotiation.funding_amount_sat(),
            funding_script,
            target_feerate_per_kw: open_sent.funding_feerate_per_kw,
            lock_time: open_sent.lock_time,
            shared_input: None,
        },
        &init.wallet_inputs,
        vec![],
    );

    let first = session.start();
    let actions = vec![ChannelAction::SendMessage(first)];
    (
        ChannelState::WaitForFundingCreated {
            init_funding: negotiation,
            session,
        },
        actions,
    )
}

// --- Interactive round completion --- //

/// Both sides sent `tx_complete`: assign the final channel id, build the
/// initial commitments, and send our `commitment_signed`. Our
/// `tx_signatures` are withheld until the peer's signature validates.
fn funding_tx_built(
    negotiation: FundingNegotiation,
    session: InteractiveTxSession,
    built: BuiltFundingTx,
    ctx: &ChannelContext<'_>,
) -> (ChannelState, Vec<ChannelAction>) {
    let keys = ctx.keys.channel_keys(negotiation.key_index);
    let funding_txid = built.txid();
    let channel_id =
        ChannelId::from_funding(&funding_txid, built.funding_output_index);

    let funding_amount =
        Amount::from_sat(negotiation.funding_amount_sat());
    let local_base = Amount::from_sat(negotiation.local_contribution_sat);
    let (to_local, to_remote) = if negotiation.is_initiator {
        (
            local_base - negotiation.push_amount,
            funding_amount - local_base + negotiation.push_amount,
        )
    } else {
        (
            local_base + negotiation.push_amount,
            funding_amount - local_base - negotiation.push_amount,
        )
    };

    let spec = CommitmentSpec {
        to_local,
        to_remote,
        feerate_per_kw: negotiation.commitment_feerate_per_kw,
        htlcs: vec![],
    };

    let params = ChannelParams {
        channel_id,
        key_index: negotiation.key_index,
        local: negotiation.local.clone(),
        remote: negotiation.remote.clone(),
        local_is_initiator: negotiation.is_initiator,
        channel_flags: negotiation.channel_flags,
        features: Default::default(),
    };

    let mut commitment = Commitment {
        funding_tx_index: 0,
        funding_txid,
        funding_output_index: built.funding_output_index,
        funding_amount,
        funding_status: FundingStatus::Unconfirmed {
            tx: Some(built.tx.clone()),
        },
        local_commit: LocalCommit {
            index: 0,
            spec: spec.clone(),
            // Rebuilt just below once the commitment value exists.
            tx: bitcoin::Transaction {
                version: bitcoin::transaction::Version::TWO,
                lock_time: bitcoin::absolute::LockTime::ZERO,
                input: vec![],
                output: vec![],
            },
            // Placeholder until the peer's commitment_signed arrives.
            remote_sig: placeholder_signature(),
            htlc_remote_sigs: vec![],
        },
        remote_commit: RemoteCommit {
            index: 0,
            spec: spec.clone(),
            txid: funding_txid, // patched below
            remote_per_commitment_point: negotiation.first_remote_point,
        },
        next_remote_commit: None,
    };

    commitment.local_commit.tx = build_commit_tx_for_local(
        &commitment,
        &spec,
        &params,
        &keys,
        ctx.secp,
        0,
    );
    let remote_tx = build_commit_tx_for_remote(
        &commitment,
        &spec,
        &params,
        &keys,
        ctx.secp,
    );
    commitment.remote_commit.txid = remote_tx.compute_txid();

    // Sign their first commitment.
    let commit_sig = match funding_sighash(
        &remote_tx,
        &commitment,
        &params,
        &keys,
        ctx.secp,
    ) {
        Ok(digest) => CommitmentSigned {
            channel_id,
            signature: ctx
                .secp
                .sign_ecdsa(&Message::from_digest(digest), &keys.funding_key),
            htlc_signatures: vec![],
            funding_txid: None,
        },
        Err(error) => {
            return abort_funding(
                negotiation.temporary_channel_id,
                session.local_input_outpoints(),
                error,
            );
        }
    };

    let commitments = Commitments {
        params,
        changes: CommitmentChanges::default(),
        active: vec![commitment],
        inactive: vec![],
        local_next_htlc_id: 0,
        remote_next_htlc_id: 0,
        remote_next_per_commitment_point: negotiation.first_remote_point,
        remote_per_commitment_secrets: Default::default(),
        originators: Default::default(),
        pending_failed: vec![],
        next_incoming_dispatch_id: 0,
    };

    info!(
        temporary = %negotiation.temporary_channel_id,
        assigned = %channel_id,
        "funding tx agreed, channel id assigned",
    );
    let actions = vec![
        ChannelAction::IdAssigned {
            temporary: negotiation.temporary_channel_id,
            assigned: channel_id,
        },
        ChannelAction::SendMessage(LightningMessage::CommitmentSigned(
            commit_sig,
        )),
    ];

    (
        ChannelState::WaitForFundingSigned {
            signing: SigningSession {
                temporary_channel_id: negotiation.temporary_channel_id,
                commitments,
                built,
                session,
                negotiation,
                remote_commit_sig_received: false,
                local_sigs: None,
                remote_sigs: None,
            },
        },
        actions,
    )
}

fn receive_first_commit_sig(
    mut signing: SigningSession,
    commit_sig: CommitmentSigned,
    ctx: &ChannelContext<'_>,
) -> (ChannelState, Vec<ChannelAction>) {
    let keys = ctx.keys.channel_keys(signing.commitments.params.key_index);
    let commitment = &signing.commitments.active[0];
    let digest = match funding_sighash(
        &commitment.local_commit.tx,
        commitment,
        &signing.commitments.params,
        &keys,
        ctx.secp,
    ) {
        Ok(digest) => digest,
        Err(error) => {
            return abort_funding(
                signing.temporary_channel_id,
                signing.session.local_input_outpoints(),
                error,
            );
        }
    };
    if ctx
        .secp
        .verify_ecdsa(
            &Message::from_digest(digest),
            &commit_sig.signature,
            &signing.commitments.params.remote.funding_pubkey,
        )
        .is_err()
    {
        return abort_funding(
            signing.temporary_channel_id,
            signing.session.local_input_outpoints(),
            ChannelError::InvalidCommitmentSignature { commit_number: 0 },
        );
    }

    signing.commitments.active[0].local_commit.remote_sig =
        commit_sig.signature;
    signing.remote_commit_sig_received = true;

    let mut actions = Vec::new();
    // The non-initiator reveals its tx signatures first.
    if !signing.negotiation.is_initiator {
        match signing.built.sign_local_inputs(ctx.keys) {
            Ok(sigs) => {
                signing.local_sigs = Some(sigs.clone());
                actions.push(ChannelAction::SendMessage(
                    LightningMessage::TxSignatures(sigs),
                ));
            }
            Err(err) => {
                tracing::error!("failed to sign funding inputs: {err:#}");
                return abort_funding(
                    signing.temporary_channel_id,
                    signing.session.local_input_outpoints(),
                    ChannelError::InteractiveTx("local signing failed"),
                );
            }
        }
    }

    maybe_complete_signing(signing, actions, ctx)
}

fn receive_tx_signatures(
    mut signing: SigningSession,
    remote_sigs: TxSignatures,
    ctx: &ChannelContext<'_>,
) -> (ChannelState, Vec<ChannelAction>) {
    if remote_sigs.txid != signing.built.txid() {
        return abort_funding(
            signing.temporary_channel_id,
            signing.session.local_input_outpoints(),
            ChannelError::UnknownSpendingTx {
                txid: remote_sigs.txid,
            },
        );
    }
    signing.remote_sigs = Some(remote_sigs);

    let mut actions = Vec::new();
    // The initiator reveals its signatures only after the peer's.
    if signing.negotiation.is_initiator
        && signing.remote_commit_sig_received
        && signing.local_sigs.is_none()
    {
        match signing.built.sign_local_inputs(ctx.keys) {
            Ok(sigs) => {
                signing.local_sigs = Some(sigs.clone());
                actions.push(ChannelAction::SendMessage(
                    LightningMessage::TxSignatures(sigs),
                ));
            }
            Err(err) => {
                tracing::error!("failed to sign funding inputs: {err:#}");
                return abort_funding(
                    signing.temporary_channel_id,
                    signing.session.local_input_outpoints(),
                    ChannelError::InteractiveTx("local signing failed"),
                );
            }
        }
    }

    maybe_complete_signing(signing, actions, ctx)
}

/// Once the peer's commitment signature validated and both tx_signatures
/// are known, publish (initiator) and start watching for confirmation.
fn maybe_complete_signing(
    signing: SigningSession,
    mut actions: Vec<ChannelAction>,
    _ctx: &ChannelContext<'_>,
) -> (ChannelState, Vec<ChannelAction>) {
    let ready = signing.remote_commit_sig_received
        && signing.local_sigs.is_some()
        && signing.remote_sigs.is_some();
    if !ready {
        return (ChannelState::WaitForFundingSigned { signing }, actions);
    }

    let ours = signing.local_sigs.as_ref().expect("checked above");
    let theirs = signing.remote_sigs.as_ref().expect("checked above");
    let remote_indices =
        signing.session.remote_input_indices(&signing.built);
    let full_tx =
        match signing.built.apply_signatures(ours, theirs, &remote_indices)
        {
            Ok(tx) => tx,
            Err(error) => {
                return abort_funding(
                    signing.temporary_channel_id,
                    signing.session.local_input_outpoints(),
                    error,
                );
            }
        };

    let channel_id = signing.commitments.params.channel_id;
    let funding_txid = signing.built.txid();

    if signing.negotiation.is_initiator {
        actions.push(ChannelAction::PublishTx(full_tx));
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
            signing.built.funding_output_index,
        ),
    }));

    // Record the incoming new-channel payment for pay-to-open /
    // please-open originated channels.
    if let Some(origin) = &signing.negotiation.origin {
        let (service_fee, mining_fee) = match origin {
            ChannelOrigin::PleaseOpenChannel {
                service_fee,
                mining_fee,
                ..
            }
            | ChannelOrigin::PayToOpen {
                service_fee,
                mining_fee,
                ..
            } => (*service_fee, *mining_fee),
        };
        if !signing.negotiation.push_amount.is_zero() {
            actions.push(ChannelAction::StoreIncomingPayment {
                amount: signing.negotiation.push_amount,
                origin: Some(origin.clone()),
                received_with: ReceivedWith::NewChannel {
                    amount: signing.negotiation.push_amount,
                    mining_fee,
                    service_fee,
                    channel_id: Some(channel_id),
                },
            });
        }
    }

    let state = ChannelState::WaitForFundingConfirmed {
        commitments: signing.commitments,
        their_channel_ready: None,
    };
    actions.extend(store_action(&state));
    (state, actions)
}

// --- Confirmation --- //

fn funding_confirmed(
    commitments: Commitments,
    their_channel_ready: Option<ChannelReady>,
    block_height: u32,
    ctx: &ChannelContext<'_>,
) -> (ChannelState, Vec<ChannelAction>) {
    let keys = ctx.keys.channel_keys(commitments.params.key_index);
    let channel_id = commitments.params.channel_id;
    let output_index = commitments.latest().funding_output_index;
    let short_channel_id =
        ShortChannelId::new(block_height, 0, output_index as u16);

    let ready = ChannelReady {
        channel_id,
        next_per_commitment_point: keys
            .per_commitment_point(ctx.secp, 1),
        short_channel_id_alias: Some(short_channel_id.0),
    };
    let mut actions = vec![ChannelAction::SendMessage(
        LightningMessage::ChannelReady(ready),
    )];

    let state = match their_channel_ready {
        Some(..) => {
            info!(%channel_id, "channel is open");
            actions.push(ChannelAction::EmitEvent(
                ChannelEvent::ChannelOpened { channel_id },
            ));
            ChannelState::Normal(NormalData {
                commitments,
                short_channel_id,
                remote_channel_update: None,
                splice_session: None,
                local_shutdown_sent: None,
                their_splice_locked: None,
            })
        }
        None => ChannelState::WaitForChannelReady {
            commitments,
            short_channel_id,
        },
    };
    actions.extend(store_action(&state));
    (state, actions)
}

// --- Helpers --- //

fn derive_temporary_id(
    keys: &crate::keys::ChannelKeys,
    ctx: &ChannelContext<'_>,
) -> ChannelId {
    use bitcoin::hashes::{sha256, Hash, HashEngine};
    let mut engine = sha256::Hash::engine();
    engine.input(b"temporary-channel-id");
    engine.input(&keys.funding_pubkey(ctx.secp).serialize());
    ChannelId(sha256::Hash::from_engine(engine).to_byte_array())
}

fn placeholder_signature() -> bitcoin::secp256k1::ecdsa::Signature {
    bitcoin::secp256k1::ecdsa::Signature::from_compact(&[0x01; 64])
        .expect("constant compact signature is valid")
}

fn abort_funding(
    temporary_channel_id: ChannelId,
    outpoints: Vec<bitcoin::OutPoint>,
    error: ChannelError,
) -> (ChannelState, Vec<ChannelAction>) {
    tracing::warn!(%temporary_channel_id, "aborting funding: {error}");
    let mut actions = vec![ChannelAction::SendMessage(
        LightningMessage::Error(ErrorMsg::new(
            temporary_channel_id,
            &error.to_string(),
        )),
    )];
    if !outpoints.is_empty() {
        actions.push(ChannelAction::UnlockWalletInputs(outpoints));
    }
    actions.push(ChannelAction::NotExecuted {
        command: "funding",
        error,
    });
    (ChannelState::Aborted, actions)
}
