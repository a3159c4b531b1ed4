//! The `Offline` and `Syncing` wrappers: disconnection, reconnection,
//! `channel_reestablish` processing, and data-loss-protection recovery
//! from the peer-held encrypted backup.
//!
//! While wrapped, only a minimal command alphabet is admitted
//! (`Connected`, `WatchReceived`, `CheckHtlcTimeout`); HTLC adds are
//! rejected back to the payment layer.

use tracing::{info, warn};

use super::{
    make_reestablish, AddHtlcFailed, ChannelAction, ChannelCommand,
    ChannelContext, ChannelError, ChannelEvent, ChannelState,
};
use crate::{
    backup::{self, BackupError},
    wire::{ChannelReestablish, LightningMessage},
};

/// `Connected` while `Offline`: persisted channels start the reestablish
/// handshake and enter `Syncing`; everything else has nothing to resync.
pub(super) fn start_reestablish(
    inner: ChannelState,
    ctx: &ChannelContext<'_>,
) -> (ChannelState, Vec<ChannelAction>) {
    match inner.commitments() {
        Some(commitments) => {
            let reestablish =
                make_reestablish(commitments, inner.persisted().as_ref(), ctx);
            let actions = vec![ChannelAction::SendMessage(
                LightningMessage::ChannelReestablish(reestablish),
            )];
            (ChannelState::Syncing(Box::new(inner)), actions)
        }
        // Closed (or never-funded) channels have nothing to reestablish.
        None => (ChannelState::Offline(Box::new(inner)), vec![]),
    }
}

/// The minimal alphabet shared by `Offline` and `Syncing`.
fn process_minimal(
    wrap: fn(Box<ChannelState>) -> ChannelState,
    inner: ChannelState,
    cmd: ChannelCommand,
    ctx: &ChannelContext<'_>,
) -> (ChannelState, Vec<ChannelAction>) {
    match cmd {
        // Chain watches keep applying; whatever the inner machine decides
        // stays wrapped because we are still not (fully) connected.
        ChannelCommand::WatchReceived(..)
        | ChannelCommand::CheckHtlcTimeout => {
            let (next_inner, actions) = inner.process(cmd, ctx);
            // Force-close paths must not be suppressed by the wrapper.
            (wrap(Box::new(next_inner)), actions)
        }

        ChannelCommand::ForceClose => {
            let (next_inner, actions) = inner.process(cmd, ctx);
            (wrap(Box::new(next_inner)), actions)
        }

        ChannelCommand::AddHtlc(spec) => {
            let failed = AddHtlcFailed {
                channel_id: inner
                    .channel_ids()
                    .first()
                    .copied()
                    .unwrap_or(super::ChannelId::ZERO),
                payment_id: spec.payment_id,
                part_id: spec.part_id,
                reason: ChannelError::CommandNotValid {
                    state: "Offline",
                    command: "AddHtlc",
                },
            };
            (
                wrap(Box::new(inner)),
                vec![ChannelAction::AddFailed(failed)],
            )
        }

        cmd => {
            let state = wrap(Box::new(inner));
            let error = ChannelError::CommandNotValid {
                state: "Offline",
                command: cmd.name(),
            };
            (
                state,
                vec![ChannelAction::NotExecuted {
                    command: cmd.name(),
                    error,
                }],
            )
        }
    }
}

pub(super) fn process_while_offline(
    wrap: fn(Box<ChannelState>) -> ChannelState,
    inner: ChannelState,
    cmd: ChannelCommand,
    ctx: &ChannelContext<'_>,
) -> (ChannelState, Vec<ChannelAction>) {
    process_minimal(wrap, inner, cmd, ctx)
}

pub(super) fn process_while_syncing(
    inner: ChannelState,
    cmd: ChannelCommand,
    ctx: &ChannelContext<'_>,
) -> (ChannelState, Vec<ChannelAction>) {
    match cmd {
        ChannelCommand::MessageReceived(
            LightningMessage::ChannelReestablish(reestablish),
        ) => finish_reestablish(inner, reestablish, ctx),
        cmd => process_minimal(ChannelState::Syncing, inner, cmd, ctx),
    }
}

/// The peer's `channel_reestablish` arrived: detect data loss, recover
/// from the encrypted backup when possible, then resume the inner state.
fn finish_reestablish(
    inner: ChannelState,
    reestablish: ChannelReestablish,
    ctx: &ChannelContext<'_>,
) -> (ChannelState, Vec<ChannelAction>) {
    let Some(commitments) = inner.commitments() else {
        return (ChannelState::Offline(Box::new(inner)), vec![]);
    };
    let channel_id = commitments.params.channel_id;
    let our_next_local = commitments.local_commit_index() + 1;

    // The peer expects a commitment number ahead of what we can produce:
    // our persisted state is stale. Try the data-loss-protection path.
    if reestablish.next_revocation_number > commitments.local_commit_index()
        || reestablish.next_commitment_number > our_next_local
    {
        return recover_from_backup(inner, reestablish, ctx);
    }

    info!(
        %channel_id,
        next_commitment_number = reestablish.next_commitment_number,
        "reestablish complete",
    );

    let mut actions = Vec::new();
    // Retransmit whatever the peer is missing.
    if reestablish.next_commitment_number < our_next_local {
        if commitments.changes.local_has_changes() {
            actions.push(ChannelAction::SendToSelf(Box::new(
                ChannelCommand::Sign,
            )));
        }
    }
    (inner, actions)
}

fn recover_from_backup(
    inner: ChannelState,
    reestablish: ChannelReestablish,
    ctx: &ChannelContext<'_>,
) -> (ChannelState, Vec<ChannelAction>) {
    let channel_id = inner
        .channel_ids()
        .first()
        .copied()
        .unwrap_or(super::ChannelId::ZERO);

    let Some(blob) = &reestablish.channel_data else {
        warn!(
            %channel_id,
            "peer is ahead of us and no backup was provided",
        );
        return (ChannelState::Syncing(Box::new(inner)), vec![]);
    };

    match backup::open(&ctx.keys.node_secret(), blob) {
        Ok(recovered) => {
            let newer = recovered
                .commitments()
                .map(|commitments| {
                    inner
                        .commitments()
                        .map(|ours| {
                            commitments.local_commit_index()
                                > ours.local_commit_index()
                        })
                        .unwrap_or(true)
                })
                .unwrap_or(false);
            if !newer {
                warn!(
                    %channel_id,
                    "peer backup is not newer than local state, ignoring",
                );
                return (ChannelState::Syncing(Box::new(inner)), vec![]);
            }

            info!(
                %channel_id,
                "recovered channel state from peer backup",
            );
            // Replace the local state and redo the reestablish handshake
            // from the recovered state.
            let recovered_state = ChannelState::Offline(Box::new(
                recovered.clone().into_state(),
            ));
            let mut actions = vec![ChannelAction::StoreState(recovered)];
            let (state, mut more) = recovered_state.process(
                ChannelCommand::Connected {
                    our_init: Default::default(),
                    their_init: Default::default(),
                },
                ctx,
            );
            actions.append(&mut more);
            // Process the peer's reestablish against the recovered state.
            let (state, mut more) = state.process(
                ChannelCommand::MessageReceived(
                    LightningMessage::ChannelReestablish(reestablish),
                ),
                ctx,
            );
            actions.append(&mut more);
            (state, actions)
        }
        Err(BackupError::UnsupportedVersion(version)) => {
            // Produced by a newer app version: never force-close, just
            // tell the user to upgrade and leave the channel untouched.
            warn!(
                %channel_id,
                version,
                "peer backup requires a newer app version",
            );
            (
                ChannelState::Syncing(Box::new(inner)),
                vec![ChannelAction::EmitEvent(
                    ChannelEvent::UpgradeRequired { channel_id },
                )],
            )
        }
        Err(err) => {
            warn!(%channel_id, "ignoring undecryptable backup: {err}");
            (ChannelState::Syncing(Box::new(inner)), vec![])
        }
    }
}

#[cfg(test)]
mod test {
    use bitcoin::secp256k1::Secp256k1;

    use super::*;
    use crate::channel::test_support::{normal_state, peer_fixture};
    use crate::channel::{ChannelState, PersistedChannel, ShortChannelId};
    use crate::keys::{KeyManager, SeedKeyManager};
    use crate::payments::{PartId, PaymentId};
    use crate::wire::Init;

    fn test_ctx<'a>(
        keys: &'a SeedKeyManager,
        secp: &'a Secp256k1<bitcoin::secp256k1::All>,
    ) -> super::super::ChannelContext<'a> {
        super::super::ChannelContext {
            local_node_id: keys.node_id(),
            remote_node_id: SeedKeyManager::new([2; 32]).node_id(),
            chain_hash: [6; 32],
            block_height: 700_000,
            feerates: crate::electrum::FeeratesPerKw::FALLBACK,
            keys,
            secp,
        }
    }

    fn offline_normal() -> ChannelState {
        ChannelState::Offline(Box::new(normal_state()))
    }

    #[test]
    fn disconnect_wraps_and_reconnect_sends_reestablish() {
        let km = SeedKeyManager::new([1; 32]);
        let secp = Secp256k1::new();
        let ctx = test_ctx(&km, &secp);

        let (state, actions) =
            normal_state().process(ChannelCommand::Disconnected, &ctx);
        assert_eq!(state.name(), "Offline");
        assert!(actions.is_empty());

        let (state, actions) = state.process(
            ChannelCommand::Connected {
                our_init: Init::default(),
                their_init: Init::default(),
            },
            &ctx,
        );
        assert_eq!(state.name(), "Syncing");
        let reestablish = actions.iter().find_map(|action| match action {
            ChannelAction::SendMessage(
                LightningMessage::ChannelReestablish(msg),
            ) => Some(msg.clone()),
            _ => None,
        });
        let reestablish = reestablish.expect("reestablish sent");
        assert_eq!(reestablish.next_commitment_number, 1);
        // The sealed backup rides along.
        assert!(reestablish.channel_data.is_some());
    }

    #[test]
    fn offline_rejects_htlc_adds() {
        let km = SeedKeyManager::new([1; 32]);
        let secp = Secp256k1::new();
        let ctx = test_ctx(&km, &secp);

        let spec = crate::channel::AddHtlcSpec {
            amount: common::amount::Amount::from_msat(1_000),
            payment_hash: [0; 32],
            cltv_expiry: 700_500,
            onion: crate::wire::OnionPacket(vec![]),
            payment_id: PaymentId([1; 16]),
            part_id: PartId([2; 16]),
        };
        let (state, actions) =
            offline_normal().process(ChannelCommand::AddHtlc(spec), &ctx);
        assert_eq!(state.name(), "Offline");
        assert!(actions.iter().any(|action| matches!(
            action,
            ChannelAction::AddFailed(..),
        )));
    }

    #[test]
    fn matching_reestablish_resumes_the_inner_state() {
        let km = SeedKeyManager::new([1; 32]);
        let secp = Secp256k1::new();
        let ctx = test_ctx(&km, &secp);

        let (state, _) =
            normal_state().process(ChannelCommand::Disconnected, &ctx);
        let (state, _) = state.process(
            ChannelCommand::Connected {
                our_init: Init::default(),
                their_init: Init::default(),
            },
            &ctx,
        );

        // The peer is at the same commitment numbers.
        let their_reestablish = ChannelReestablish {
            channel_id: state.channel_ids()[0],
            next_commitment_number: 1,
            next_revocation_number: 0,
            your_last_per_commitment_secret: [0; 32],
            my_current_per_commitment_point: SeedKeyManager::new([2; 32])
                .channel_keys(0)
                .per_commitment_point(&secp, 0),
            channel_data: None,
            next_funding_txid: None,
        };
        let (state, _) = state.process(
            ChannelCommand::MessageReceived(
                LightningMessage::ChannelReestablish(their_reestablish),
            ),
            &ctx,
        );
        assert_eq!(state.name(), "Normal");
    }

    #[test]
    fn recovery_replaces_stale_state_from_peer_backup() {
        let km = SeedKeyManager::new([1; 32]);
        let secp = Secp256k1::new();
        let ctx = test_ctx(&km, &secp);

        // The "current" state with a higher commitment index, as sealed
        // into the backup the peer stores for us.
        let ((mut current, _), ..) = peer_fixture();
        for commitment in &mut current.active {
            commitment.local_commit.index = 5;
            commitment.remote_commit.index = 5;
        }
        let persisted = PersistedChannel::Normal {
            commitments: current,
            short_channel_id: ShortChannelId::new(699_000, 1, 0),
            remote_channel_update: None,
        };
        let blob =
            crate::backup::seal(&km.node_secret(), &persisted).unwrap();

        // Our local state is stale (index 0); the peer expects number 6.
        let (state, _) =
            normal_state().process(ChannelCommand::Disconnected, &ctx);
        let (state, _) = state.process(
            ChannelCommand::Connected {
                our_init: Init::default(),
                their_init: Init::default(),
            },
            &ctx,
        );
        let their_reestablish = ChannelReestablish {
            channel_id: state.channel_ids()[0],
            next_commitment_number: 6,
            next_revocation_number: 5,
            your_last_per_commitment_secret: [0; 32],
            my_current_per_commitment_point: SeedKeyManager::new([2; 32])
                .channel_keys(0)
                .per_commitment_point(&secp, 5),
            channel_data: Some(blob),
            next_funding_txid: None,
        };
        let (state, actions) = state.process(
            ChannelCommand::MessageReceived(
                LightningMessage::ChannelReestablish(their_reestablish),
            ),
            &ctx,
        );

        // The recovered state replaced ours and was re-persisted.
        assert!(actions.iter().any(|action| matches!(
            action,
            ChannelAction::StoreState(..),
        )));
        assert_eq!(
            state.commitments().unwrap().local_commit_index(),
            5,
        );
    }

    #[test]
    fn newer_backup_version_emits_upgrade_required() {
        let km = SeedKeyManager::new([1; 32]);
        let secp = Secp256k1::new();
        let ctx = test_ctx(&km, &secp);

        let (state, _) =
            normal_state().process(ChannelCommand::Disconnected, &ctx);
        let (state, _) = state.process(
            ChannelCommand::Connected {
                our_init: Init::default(),
                their_init: Init::default(),
            },
            &ctx,
        );

        let persisted = state.persisted().unwrap();
        let mut blob =
            crate::backup::seal(&km.node_secret(), &persisted).unwrap();
        blob[0] = crate::backup::BACKUP_VERSION + 1;

        let their_reestablish = ChannelReestablish {
            channel_id: state.channel_ids()[0],
            next_commitment_number: 10,
            next_revocation_number: 9,
            your_last_per_commitment_secret: [0; 32],
            my_current_per_commitment_point: SeedKeyManager::new([2; 32])
                .channel_keys(0)
                .per_commitment_point(&secp, 9),
            channel_data: Some(blob),
            next_funding_txid: None,
        };
        let (state, actions) = state.process(
            ChannelCommand::MessageReceived(
                LightningMessage::ChannelReestablish(their_reestablish),
            ),
            &ctx,
        );

        // No force close: still syncing, with an upgrade-required event.
        assert_eq!(state.name(), "Syncing");
        assert!(actions.iter().any(|action| matches!(
            action,
            ChannelAction::EmitEvent(ChannelEvent::UpgradeRequired { .. }),
        )));
    }
}
