//! The per-channel state machine.
//!
//! A channel is a pure value: [`ChannelState::process`] maps `(state,
//! command, context)` to `(state', actions)` and performs no I/O. The peer
//! orchestrator owns the channel map and interprets the emitted
//! [`ChannelAction`]s (send a wire message, publish a transaction, register
//! a watch, persist, emit an event).
//!
//! States before `WaitForFundingSigned` hold only negotiation data; states
//! from `WaitForFundingSigned` onward carry [`Commitments`] and are
//! persisted on every transition that changes them.

use std::fmt::{self, Display};

use bitcoin::{
    secp256k1::{All, PublicKey, Secp256k1},
    OutPoint, ScriptBuf, Transaction, Txid,
};
use common::{
    amount::Amount, hex, rng::Crng, serde_helpers::hexstr_or_bytes,
    time::TimestampMs,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    electrum::{FeeratesPerKw, Watch, WatchEvent},
    keys::KeyManager,
    payments::{
        ClosingType, PartId, PaymentId, PaymentPreimage, ReceivedWith,
    },
    wire::{
        ChannelOrigin, ChannelReestablish, LightningMessage, UpdateAddHtlc,
    },
};

pub mod closing;
pub mod commitments;
pub mod interactive_tx;
pub mod normal;
pub mod opening;
pub mod scripts;
pub mod sync;

#[cfg(test)]
pub(crate) mod test_support;

pub use commitments::{Commitments, HtlcDirection};

use commitments::HtlcOrigin;
use interactive_tx::InteractiveTxSession;

// --- Constants --- //

/// Depth a funding or splice tx must reach before it is locked in.
pub const MIN_DEPTH: u32 = 3;

/// We force-close when the tip is within this many blocks of an HTLC's
/// `cltv_expiry`, to guarantee on-chain resolution.
pub const HTLC_SAFETY_DELTA: u32 = 18;

/// `to_self_delay` we ask of the remote.
pub const TO_SELF_DELAY: u16 = 720;

// --- Identifiers --- //

/// A channel's stable 32-byte identifier. Temporary (random) before the
/// funding tx is known, then replaced once by the funding-derived id.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct ChannelId(#[serde(with = "hexstr_or_bytes")] pub [u8; 32]);

impl ChannelId {
    pub const ZERO: Self = Self([0u8; 32]);

    /// A fresh temporary channel id from a local nonce.
    pub fn temporary(rng: &mut impl Crng) -> Self {
        let mut id = [0u8; 32];
        rng.fill_bytes(&mut id);
        Self(id)
    }

    /// The final channel id: the funding txid xored with the funding output
    /// index, per Lightning convention.
    pub fn from_funding(funding_txid: &Txid, output_index: u32) -> Self {
        use bitcoin::hashes::Hash;
        let mut id = funding_txid.to_byte_array();
        id[30] ^= (output_index >> 8) as u8;
        id[31] ^= output_index as u8;
        Self(id)
    }
}

impl Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::display(&self.0))
    }
}

impl fmt::Debug for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChannelId({self})")
    }
}

/// A confirmed channel's `block x tx x output` coordinates.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize,
)]
pub struct ShortChannelId(pub u64);

impl ShortChannelId {
    pub fn new(block_height: u32, tx_index: u32, output_index: u16) -> Self {
        Self(
            (u64::from(block_height) << 40)
                | (u64::from(tx_index) << 16)
                | u64::from(output_index),
        )
    }

    pub fn block_height(self) -> u32 {
        (self.0 >> 40) as u32
    }
}

impl Display for ShortChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{}x{}",
            self.0 >> 40,
            (self.0 >> 16) & 0xff_ffff,
            self.0 & 0xffff,
        )
    }
}

// --- Errors --- //

/// Failures produced by channel transitions. Command-level failures surface
/// as actions; protocol-level failures force-close.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum ChannelError {
    #[error("unexpected message {message} in state {state}")]
    UnexpectedMessage {
        state: &'static str,
        message: &'static str,
    },

    #[error("command {command} not valid in state {state}")]
    CommandNotValid {
        state: &'static str,
        command: &'static str,
    },

    #[error("invalid commitment signature for commit {commit_number}")]
    InvalidCommitmentSignature { commit_number: u64 },

    #[error("invalid revocation secret for commit {commit_number}")]
    InvalidRevocation { commit_number: u64 },

    #[error("unknown htlc id {id}")]
    UnknownHtlc { id: u64 },

    #[error("htlc {id} already resolved")]
    HtlcAlreadyResolved { id: u64 },

    #[error("invalid htlc preimage for htlc {id}")]
    InvalidHtlcPreimage { id: u64 },

    #[error("insufficient funds: missing {missing} msat")]
    InsufficientFunds { missing: Amount },

    #[error("htlc value too small: minimum {minimum} msat")]
    HtlcValueTooSmall { minimum: Amount },

    #[error("too many accepted htlcs: maximum {maximum}")]
    TooManyAcceptedHtlcs { maximum: u16 },

    #[error("htlc value in flight above maximum {maximum} msat")]
    HtlcValueInFlightTooHigh { maximum: Amount },

    #[error("expiry {expiry} too close to current tip {tip}")]
    ExpiryTooSoon { expiry: u32, tip: u32 },

    #[error("cannot sign without pending changes")]
    NoChangesToSign,

    #[error("cannot sign until previous commitment is revoked")]
    UnrevokedCommitment,

    #[error("interactive tx failed: {0}")]
    InteractiveTx(&'static str),

    #[error("funding amount {funding} below push amount {push}")]
    FundingBelowPush { funding: Amount, push: Amount },

    #[error("peer error: {0}")]
    PeerError(String),

    #[error("funding output spent by unknown tx {txid}")]
    UnknownSpendingTx { txid: Txid },
}

// --- Commands --- //

/// A request to add an outgoing HTLC.
#[derive(Clone, Debug)]
pub struct AddHtlcSpec {
    pub amount: Amount,
    pub payment_hash: [u8; 32],
    pub cltv_expiry: u32,
    pub onion: crate::wire::OnionPacket,
    pub payment_id: PaymentId,
    pub part_id: PartId,
}

/// A user request to splice funds in and/or out.
#[derive(Clone, Debug)]
pub struct SpliceRequest {
    pub splice_in: Option<SpliceIn>,
    pub splice_out: Option<SpliceOut>,
    pub feerate_per_kw: u32,
}

#[derive(Clone, Debug)]
pub struct SpliceIn {
    pub wallet_inputs: Vec<WalletInput>,
}

#[derive(Clone, Debug)]
pub struct SpliceOut {
    pub amount: Amount,
    pub script_pubkey: ScriptBuf,
}

/// A wallet UTXO contributed to an interactive funding.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct WalletInput {
    pub outpoint: OutPoint,
    pub amount: Amount,
    pub parent_tx: Transaction,
}

/// Initial parameters when we initiate a dual-funded open.
#[derive(Clone, Debug)]
pub struct InitiatorInit {
    pub funding_amount: Amount,
    pub push_amount: Amount,
    pub wallet_inputs: Vec<WalletInput>,
    pub commitment_feerate_per_kw: u32,
    pub funding_feerate_per_kw: u32,
    pub channel_flags: u8,
    /// Key-derivation index assigned by the orchestrator.
    pub key_index: u64,
}

/// Initial parameters when the peer initiates (pay-to-open or in response
/// to our `please_open_channel`).
#[derive(Clone, Debug)]
pub struct NonInitiatorInit {
    pub temporary_channel_id: ChannelId,
    pub funding_contribution: Amount,
    pub wallet_inputs: Vec<WalletInput>,
    pub origin: Option<ChannelOrigin>,
    /// Key-derivation index assigned by the orchestrator.
    pub key_index: u64,
}

/// The input alphabet of the state machine.
#[derive(Clone, Debug)]
pub enum ChannelCommand {
    /// Restore a persisted channel at startup; the channel comes back
    /// `Offline`.
    Restore(PersistedChannel),
    InitInitiator(InitiatorInit),
    InitNonInitiator(NonInitiatorInit),
    Connected {
        our_init: crate::wire::Init,
        their_init: crate::wire::Init,
    },
    Disconnected,
    MessageReceived(LightningMessage),
    WatchReceived(WatchEvent),
    Sign,
    AddHtlc(AddHtlcSpec),
    FulfillHtlc {
        id: u64,
        preimage: PaymentPreimage,
        commit: bool,
    },
    FailHtlc {
        id: u64,
        reason: Vec<u8>,
        commit: bool,
    },
    CheckHtlcTimeout,
    Splice(SpliceRequest),
    Close {
        script_pubkey: Option<ScriptBuf>,
        feerate_per_kw: Option<u32>,
    },
    ForceClose,
    GetHtlcInfosResponse {
        revoked_commit_txid: Txid,
        htlc_infos: Vec<HtlcInfo>,
    },
}

impl ChannelCommand {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Restore(..) => "Restore",
            Self::InitInitiator(..) => "InitInitiator",
            Self::InitNonInitiator(..) => "InitNonInitiator",
            Self::Connected { .. } => "Connected",
            Self::Disconnected => "Disconnected",
            Self::MessageReceived(..) => "MessageReceived",
            Self::WatchReceived(..) => "WatchReceived",
            Self::Sign => "Sign",
            Self::AddHtlc(..) => "AddHtlc",
            Self::FulfillHtlc { .. } => "FulfillHtlc",
            Self::FailHtlc { .. } => "FailHtlc",
            Self::CheckHtlcTimeout => "CheckHtlcTimeout",
            Self::Splice(..) => "Splice",
            Self::Close { .. } => "Close",
            Self::ForceClose => "ForceClose",
            Self::GetHtlcInfosResponse { .. } => "GetHtlcInfosResponse",
        }
    }
}

/// Minimal info about an HTLC on a revoked commitment, needed to build the
/// penalty tx after the fact.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct HtlcInfo {
    pub channel_id: ChannelId,
    pub commitment_number: u64,
    #[serde(with = "hexstr_or_bytes")]
    pub payment_hash: [u8; 32],
    pub cltv_expiry: u32,
}

// --- Actions --- //

/// How a locally-commanded HTLC add failed before reaching the wire.
#[derive(Clone, Debug)]
pub struct AddHtlcFailed {
    pub channel_id: ChannelId,
    pub payment_id: PaymentId,
    pub part_id: PartId,
    pub reason: ChannelError,
}

/// The settlement of one of our outgoing HTLCs by the peer.
#[derive(Clone, Debug)]
pub enum HtlcSettlement {
    Fulfilled {
        origin: HtlcOrigin,
        preimage: PaymentPreimage,
    },
    Failed {
        origin: HtlcOrigin,
        /// Encrypted failure onion, decoded by the sphinx seam upstream.
        reason: Vec<u8>,
    },
}

/// Domain events emitted by channel transitions, translated onto the node
/// event bus by the orchestrator.
#[derive(Clone, Debug)]
pub enum ChannelEvent {
    ChannelOpened {
        channel_id: ChannelId,
    },
    ChannelClosing {
        channel_id: ChannelId,
        closing_type: ClosingType,
    },
    ChannelClosed {
        channel_id: ChannelId,
    },
    SpliceLocked {
        channel_id: ChannelId,
        funding_txid: Txid,
    },
    /// The peer's backup was produced by a newer version than this code can
    /// deserialize; the channel is left untouched.
    UpgradeRequired {
        channel_id: ChannelId,
    },
}

/// The output alphabet of the state machine.
#[derive(Clone, Debug)]
pub enum ChannelAction {
    SendMessage(LightningMessage),
    SendToSelf(Box<ChannelCommand>),
    SendWatch(Watch),
    PublishTx(Transaction),
    StoreState(PersistedChannel),
    RemoveChannel(ChannelId),
    StoreHtlcInfos(Vec<HtlcInfo>),
    StoreIncomingPayment {
        amount: Amount,
        origin: Option<ChannelOrigin>,
        received_with: ReceivedWith,
    },
    StoreOutgoingPayment(crate::payments::OnChainPayment),
    GetHtlcInfos {
        revoked_commit_txid: Txid,
        commitment_number: u64,
    },
    SetLocked(Txid),
    IdAssigned {
        temporary: ChannelId,
        assigned: ChannelId,
    },
    ProcessIncomingHtlc(UpdateAddHtlc),
    AddFailed(AddHtlcFailed),
    AddSettled(HtlcSettlement),
    NotExecuted {
        command: &'static str,
        error: ChannelError,
    },
    UnlockWalletInputs(Vec<OutPoint>),
    EmitEvent(ChannelEvent),
}

// --- Context --- //

/// Everything a transition may read but not own: static ids, the current
/// chain view, and the key manager seam.
pub struct ChannelContext<'a> {
    pub local_node_id: PublicKey,
    pub remote_node_id: PublicKey,
    pub chain_hash: [u8; 32],
    pub block_height: u32,
    pub feerates: FeeratesPerKw,
    pub keys: &'a dyn KeyManager,
    pub secp: &'a Secp256k1<All>,
}

// --- Persisted form --- //

/// The durable snapshot of a channel. Only states from
/// `WaitForFundingSigned` onward are persisted; everything earlier is
/// renegotiated from scratch on reconnect.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum PersistedChannel {
    WaitForFundingConfirmed {
        commitments: Commitments,
    },
    WaitForChannelReady {
        commitments: Commitments,
        short_channel_id: ShortChannelId,
    },
    Normal {
        commitments: Commitments,
        short_channel_id: ShortChannelId,
        remote_channel_update: Option<crate::wire::ChannelUpdate>,
    },
    ShuttingDown {
        commitments: Commitments,
        local_shutdown: crate::wire::Shutdown,
        remote_shutdown: Option<crate::wire::Shutdown>,
    },
    Negotiating {
        commitments: Commitments,
        local_shutdown: crate::wire::Shutdown,
        remote_shutdown: crate::wire::Shutdown,
        local_closing_fee_sat: Option<u64>,
    },
    Closing {
        commitments: Commitments,
        spending_txs: closing::SpendingTxs,
    },
    Closed {
        channel_id: ChannelId,
        closing_type: ClosingType,
        closing_txid: Txid,
        closed_at: TimestampMs,
    },
    LegacyWaitForFundingConfirmed {
        commitments: Commitments,
    },
}

impl PersistedChannel {
    pub fn channel_id(&self) -> ChannelId {
        match self {
            Self::WaitForFundingConfirmed { commitments }
            | Self::WaitForChannelReady { commitments, .. }
            | Self::Normal { commitments, .. }
            | Self::ShuttingDown { commitments, .. }
            | Self::Negotiating { commitments, .. }
            | Self::Closing { commitments, .. }
            | Self::LegacyWaitForFundingConfirmed { commitments } =>
                commitments.params.channel_id,
            Self::Closed { channel_id, .. } => *channel_id,
        }
    }

    pub fn commitments(&self) -> Option<&Commitments> {
        match self {
            Self::WaitForFundingConfirmed { commitments }
            | Self::WaitForChannelReady { commitments, .. }
            | Self::Normal { commitments, .. }
            | Self::ShuttingDown { commitments, .. }
            | Self::Negotiating { commitments, .. }
            | Self::Closing { commitments, .. }
            | Self::LegacyWaitForFundingConfirmed { commitments } =>
                Some(commitments),
            Self::Closed { .. } => None,
        }
    }

    /// Rehydrate the in-memory state. Restored channels start wrapped in
    /// `Offline` until the connection is (re)established.
    pub(crate) fn into_state(self) -> ChannelState {
        match self {
            Self::WaitForFundingConfirmed { commitments } =>
                ChannelState::WaitForFundingConfirmed {
                    commitments,
                    their_channel_ready: None,
                },
            Self::WaitForChannelReady {
                commitments,
                short_channel_id,
            } => ChannelState::WaitForChannelReady {
                commitments,
                short_channel_id,
            },
            Self::Normal {
                commitments,
                short_channel_id,
                remote_channel_update,
            } => ChannelState::Normal(normal::NormalData {
                commitments,
                short_channel_id,
                remote_channel_update,
                splice_session: None,
                local_shutdown_sent: None,
                their_splice_locked: None,
            }),
            Self::ShuttingDown {
                commitments,
                local_shutdown,
                remote_shutdown,
            } => ChannelState::ShuttingDown {
                commitments,
                local_shutdown,
                remote_shutdown,
            },
            Self::Negotiating {
                commitments,
                local_shutdown,
                remote_shutdown,
                local_closing_fee_sat,
            } => ChannelState::Negotiating {
                commitments,
                local_shutdown,
                remote_shutdown,
                local_closing_fee_sat,
            },
            Self::Closing {
                commitments,
                spending_txs,
            } => ChannelState::Closing {
                commitments,
                spending_txs,
            },
            Self::Closed {
                channel_id,
                closing_type,
                closing_txid,
                closed_at,
            } => ChannelState::Closed {
                channel_id,
                closing_type,
                closing_txid,
                closed_at,
            },
            Self::LegacyWaitForFundingConfirmed { commitments } =>
                ChannelState::LegacyWaitForFundingConfirmed { commitments },
        }
    }
}

// --- The state machine --- //

/// The tagged sum of channel states. `Offline` and `Syncing` wrap an inner
/// state while disconnected / reestablishing.
#[derive(Clone, Debug)]
#[allow(clippy::large_enum_variant)]
pub enum ChannelState {
    WaitForInit,
    WaitForOpenChannel {
        init: NonInitiatorInit,
    },
    WaitForAcceptChannel {
        init: InitiatorInit,
        open_sent: crate::wire::OpenChannel2,
    },
    WaitForFundingCreated {
        init_funding: opening::FundingNegotiation,
        session: InteractiveTxSession,
    },
    WaitForFundingSigned {
        signing: opening::SigningSession,
    },
    WaitForFundingConfirmed {
        commitments: Commitments,
        their_channel_ready: Option<crate::wire::ChannelReady>,
    },
    WaitForChannelReady {
        commitments: Commitments,
        short_channel_id: ShortChannelId,
    },
    Normal(normal::NormalData),
    ShuttingDown {
        commitments: Commitments,
        local_shutdown: crate::wire::Shutdown,
        remote_shutdown: Option<crate::wire::Shutdown>,
    },
    Negotiating {
        commitments: Commitments,
        local_shutdown: crate::wire::Shutdown,
        remote_shutdown: crate::wire::Shutdown,
        local_closing_fee_sat: Option<u64>,
    },
    Closing {
        commitments: Commitments,
        spending_txs: closing::SpendingTxs,
    },
    Closed {
        channel_id: ChannelId,
        closing_type: ClosingType,
        closing_txid: Txid,
        closed_at: TimestampMs,
    },
    Aborted,
    LegacyWaitForFundingConfirmed {
        commitments: Commitments,
    },
    Offline(Box<ChannelState>),
    Syncing(Box<ChannelState>),
}

impl ChannelState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::WaitForInit => "WaitForInit",
            Self::WaitForOpenChannel { .. } => "WaitForOpenChannel",
            Self::WaitForAcceptChannel { .. } => "WaitForAcceptChannel",
            Self::WaitForFundingCreated { .. } => "WaitForFundingCreated",
            Self::WaitForFundingSigned { .. } => "WaitForFundingSigned",
            Self::WaitForFundingConfirmed { .. } =>
                "WaitForFundingConfirmed",
            Self::WaitForChannelReady { .. } => "WaitForChannelReady",
            Self::Normal(..) => "Normal",
            Self::ShuttingDown { .. } => "ShuttingDown",
            Self::Negotiating { .. } => "Negotiating",
            Self::Closing { .. } => "Closing",
            Self::Closed { .. } => "Closed",
            Self::Aborted => "Aborted",
            Self::LegacyWaitForFundingConfirmed { .. } =>
                "LegacyWaitForFundingConfirmed",
            Self::Offline(..) => "Offline",
            Self::Syncing(..) => "Syncing",
        }
    }

    /// The channel ids this state answers to. Both the temporary and the
    /// assigned id are honored until funding-contribution agreement.
    pub fn channel_ids(&self) -> Vec<ChannelId> {
        match self {
            Self::WaitForInit | Self::Aborted => vec![],
            Self::WaitForOpenChannel { init } =>
                vec![init.temporary_channel_id],
            Self::WaitForAcceptChannel { open_sent, .. } =>
                vec![open_sent.temporary_channel_id],
            Self::WaitForFundingCreated { init_funding, .. } =>
                vec![init_funding.temporary_channel_id],
            Self::WaitForFundingSigned { signing } => vec![
                signing.commitments.params.channel_id,
                signing.temporary_channel_id,
            ],
            Self::WaitForFundingConfirmed { commitments, .. }
            | Self::WaitForChannelReady { commitments, .. }
            | Self::ShuttingDown { commitments, .. }
            | Self::Negotiating { commitments, .. }
            | Self::Closing { commitments, .. }
            | Self::LegacyWaitForFundingConfirmed { commitments } =>
                vec![commitments.params.channel_id],
            Self::Normal(data) => vec![data.commitments.params.channel_id],
            Self::Closed { channel_id, .. } => vec![*channel_id],
            Self::Offline(inner) | Self::Syncing(inner) =>
                inner.channel_ids(),
        }
    }

    pub fn commitments(&self) -> Option<&Commitments> {
        match self {
            Self::WaitForFundingSigned { signing } =>
                Some(&signing.commitments),
            Self::WaitForFundingConfirmed { commitments, .. }
            | Self::WaitForChannelReady { commitments, .. }
            | Self::ShuttingDown { commitments, .. }
            | Self::Negotiating { commitments, .. }
            | Self::Closing { commitments, .. }
            | Self::LegacyWaitForFundingConfirmed { commitments } =>
                Some(commitments),
            Self::Normal(data) => Some(&data.commitments),
            Self::Offline(inner) | Self::Syncing(inner) =>
                inner.commitments(),
            _ => None,
        }
    }

    /// The persisted snapshot of this state, for states that are persisted.
    pub fn persisted(&self) -> Option<PersistedChannel> {
        match self {
            Self::WaitForFundingConfirmed { commitments, .. } =>
                Some(PersistedChannel::WaitForFundingConfirmed {
                    commitments: commitments.clone(),
                }),
            Self::WaitForChannelReady {
                commitments,
                short_channel_id,
            } => Some(PersistedChannel::WaitForChannelReady {
                commitments: commitments.clone(),
                short_channel_id: *short_channel_id,
            }),
            Self::Normal(data) => Some(PersistedChannel::Normal {
                commitments: data.commitments.clone(),
                short_channel_id: data.short_channel_id,
                remote_channel_update: data.remote_channel_update.clone(),
            }),
            Self::ShuttingDown {
                commitments,
                local_shutdown,
                remote_shutdown,
            } => Some(PersistedChannel::ShuttingDown {
                commitments: commitments.clone(),
                local_shutdown: local_shutdown.clone(),
                remote_shutdown: remote_shutdown.clone(),
            }),
            Self::Negotiating {
                commitments,
                local_shutdown,
                remote_shutdown,
                local_closing_fee_sat,
            } => Some(PersistedChannel::Negotiating {
                commitments: commitments.clone(),
                local_shutdown: local_shutdown.clone(),
                remote_shutdown: remote_shutdown.clone(),
                local_closing_fee_sat: *local_closing_fee_sat,
            }),
            Self::Closing {
                commitments,
                spending_txs,
            } => Some(PersistedChannel::Closing {
                commitments: commitments.clone(),
                spending_txs: spending_txs.clone(),
            }),
            Self::Closed {
                channel_id,
                closing_type,
                closing_txid,
                closed_at,
            } => Some(PersistedChannel::Closed {
                channel_id: *channel_id,
                closing_type: *closing_type,
                closing_txid: *closing_txid,
                closed_at: *closed_at,
            }),
            Self::LegacyWaitForFundingConfirmed { commitments } =>
                Some(PersistedChannel::LegacyWaitForFundingConfirmed {
                    commitments: commitments.clone(),
                }),
            Self::WaitForFundingSigned { .. }
            | Self::WaitForInit
            | Self::WaitForOpenChannel { .. }
            | Self::WaitForAcceptChannel { .. }
            | Self::WaitForFundingCreated { .. }
            | Self::Aborted => None,
            Self::Offline(inner) | Self::Syncing(inner) =>
                inner.persisted(),
        }
    }

    /// The pure transition function. Consumes the state and returns the
    /// successor plus the effects the orchestrator must perform.
    pub fn process(
        self,
        cmd: ChannelCommand,
        ctx: &ChannelContext<'_>,
    ) -> (ChannelState, Vec<ChannelAction>) {
        // Transitions that apply uniformly, regardless of the inner state.
        match (self, cmd) {
            // Restore persisted state; restored channels are offline until
            // `Connected`.
            (Self::WaitForInit, ChannelCommand::Restore(persisted)) => {
                // Fully closed channels need no runtime state; prune the
                // stored row instead of restoring it.
                if let PersistedChannel::Closed { channel_id, .. } =
                    &persisted
                {
                    let actions =
                        vec![ChannelAction::RemoveChannel(*channel_id)];
                    return (Self::Aborted, actions);
                }
                let mut actions = Vec::new();
                if let Some(commitments) = persisted.commitments() {
                    for commitment in commitments.all() {
                        actions.push(ChannelAction::SendWatch(
                            Watch::Spent {
                                channel_id: commitments.params.channel_id,
                                outpoint: commitment.funding_outpoint(),
                            },
                        ));
                        if !commitment.is_confirmed() {
                            actions.push(ChannelAction::SendWatch(
                                Watch::Confirmed {
                                    channel_id: commitments
                                        .params
                                        .channel_id,
                                    txid: commitment.funding_txid,
                                    min_depth: MIN_DEPTH,
                                },
                            ));
                        }
                    }
                }
                (Self::Offline(Box::new(persisted.into_state())), actions)
            }

            // Disconnection wraps the state; wrapping is idempotent.
            (Self::Offline(inner), ChannelCommand::Disconnected) =>
                (Self::Offline(inner), vec![]),
            (Self::Syncing(inner), ChannelCommand::Disconnected) =>
                (Self::Offline(inner), vec![]),
            (state, ChannelCommand::Disconnected) => match state {
                Self::WaitForInit
                | Self::WaitForOpenChannel { .. }
                | Self::WaitForAcceptChannel { .. }
                | Self::WaitForFundingCreated { .. }
                | Self::Aborted => {
                    // Nothing durable was negotiated yet; give up and
                    // release any locked wallet inputs.
                    let unlock = state.wallet_inputs_to_unlock();
                    let mut actions = Vec::new();
                    if !unlock.is_empty() {
                        actions
                            .push(ChannelAction::UnlockWalletInputs(unlock));
                    }
                    (Self::Aborted, actions)
                }
                other => (Self::Offline(Box::new(other)), vec![]),
            },

            // Reconnection: persisted channels enter `Syncing` and send
            // `channel_reestablish`; everything else restarts.
            (Self::Offline(inner), ChannelCommand::Connected { .. }) =>
                sync::start_reestablish(*inner, ctx),

            // Offline/Syncing admit only a minimal command alphabet.
            (Self::Offline(inner), cmd) =>
                sync::process_while_offline(Self::Offline, *inner, cmd, ctx),
            (Self::Syncing(inner), cmd) =>
                sync::process_while_syncing(*inner, cmd, ctx),

            // Force close works from any state with commitments.
            (state, ChannelCommand::ForceClose) => match state.commitments()
            {
                Some(_) => closing::force_close(state, ctx),
                None => {
                    let unlock = state.wallet_inputs_to_unlock();
                    let mut actions = vec![ChannelAction::NotExecuted {
                        command: "ForceClose",
                        error: ChannelError::CommandNotValid {
                            state: state.name(),
                            command: "ForceClose",
                        },
                    }];
                    if !unlock.is_empty() {
                        actions
                            .push(ChannelAction::UnlockWalletInputs(unlock));
                    }
                    (Self::Aborted, actions)
                }
            },

            // A peer `error` addressed to this channel force-closes it.
            (
                state,
                ChannelCommand::MessageReceived(LightningMessage::Error(
                    error,
                )),
            ) if state.commitments().is_some() => {
                tracing::error!(
                    channel_id = %error.channel_id,
                    "peer error: {}",
                    error.to_ascii(),
                );
                closing::force_close(state, ctx)
            }

            // Watch events for spent fundings apply in (almost) any state.
            (
                state,
                ChannelCommand::WatchReceived(WatchEvent::Spent {
                    channel_id,
                    outpoint,
                    spending_tx,
                }),
            ) if state.commitments().is_some() =>
                closing::funding_spent(
                    state,
                    channel_id,
                    outpoint,
                    spending_tx,
                    ctx,
                ),

            // Everything else is state-specific.
            (state, cmd) => match state {
                Self::WaitForInit
                | Self::WaitForOpenChannel { .. }
                | Self::WaitForAcceptChannel { .. }
                | Self::WaitForFundingCreated { .. }
                | Self::WaitForFundingSigned { .. }
                | Self::WaitForFundingConfirmed { .. }
                | Self::WaitForChannelReady { .. } =>
                    opening::process(state, cmd, ctx),
                Self::Normal(data) => normal::process(data, cmd, ctx),
                Self::ShuttingDown { .. }
                | Self::Negotiating { .. }
                | Self::Closing { .. }
                | Self::Closed { .. } => closing::process(state, cmd, ctx),
                Self::Aborted => {
                    let actions = vec![ChannelAction::NotExecuted {
                        command: cmd.name(),
                        error: ChannelError::CommandNotValid {
                            state: "Aborted",
                            command: cmd.name(),
                        },
                    }];
                    (Self::Aborted, actions)
                }
                Self::LegacyWaitForFundingConfirmed { commitments } =>
                    opening::process_legacy(commitments, cmd, ctx),
                Self::Offline(..) | Self::Syncing(..) =>
                    unreachable!("wrappers handled above"),
            },
        }
    }

    /// Wallet inputs locked by an in-progress funding attempt, to release
    /// on abort.
    pub fn wallet_inputs_to_unlock(&self) -> Vec<OutPoint> {
        match self {
            Self::WaitForOpenChannel { init } => init
                .wallet_inputs
                .iter()
                .map(|input| input.outpoint)
                .collect(),
            Self::WaitForAcceptChannel { init, .. } => init
                .wallet_inputs
                .iter()
                .map(|input| input.outpoint)
                .collect(),
            Self::WaitForFundingCreated { session, .. } =>
                session.local_input_outpoints(),
            Self::Normal(data) => data
                .splice_session
                .as_ref()
                .map(|splice| splice.local_input_outpoints())
                .unwrap_or_default(),
            Self::Offline(inner) | Self::Syncing(inner) =>
                inner.wallet_inputs_to_unlock(),
            _ => vec![],
        }
    }
}

/// Convenience: persist the current state if it has a persisted form.
pub(crate) fn store_action(state: &ChannelState) -> Option<ChannelAction> {
    state.persisted().map(ChannelAction::StoreState)
}

/// Convenience: reply to an unexpected message with a warning and stay put.
pub(crate) fn unexpected_message(
    state: ChannelState,
    message: &'static str,
) -> (ChannelState, Vec<ChannelAction>) {
    let error = ChannelError::UnexpectedMessage {
        state: state.name(),
        message,
    };
    tracing::warn!(state = state.name(), message, "unexpected message");
    let actions = vec![ChannelAction::NotExecuted {
        command: "MessageReceived",
        error,
    }];
    (state, actions)
}

/// Convenience: reject a command that is invalid in the current state.
pub(crate) fn command_not_valid(
    state: ChannelState,
    command: &'static str,
) -> (ChannelState, Vec<ChannelAction>) {
    let error = ChannelError::CommandNotValid {
        state: state.name(),
        command,
    };
    let actions = vec![ChannelAction::NotExecuted { command, error }];
    (state, actions)
}

/// Build the reestablish message for a persisted channel, including the
/// sealed `channel_data` backup.
pub(crate) fn make_reestablish(
    commitments: &Commitments,
    persisted: Option<&PersistedChannel>,
    ctx: &ChannelContext<'_>,
) -> ChannelReestablish {
    let keys = ctx.keys.channel_keys(commitments.params.key_index);
    let next_local = commitments.local_commit_index() + 1;
    let next_remote_revocation = commitments.remote_commit_index();
    let last_secret = if commitments.remote_commit_index() == 0 {
        [0u8; 32]
    } else {
        // The last secret the peer revealed to us.
        commitments
            .last_remote_per_commitment_secret()
            .unwrap_or([0u8; 32])
    };
    let channel_data = persisted.and_then(|state| {
        crate::backup::seal(&ctx.keys.node_secret(), state)
            .map_err(|err| {
                tracing::warn!("failed to seal channel backup: {err:#}");
            })
            .ok()
    });
    ChannelReestablish {
        channel_id: commitments.params.channel_id,
        next_commitment_number: next_local,
        next_revocation_number: next_remote_revocation,
        your_last_per_commitment_secret: last_secret,
        my_current_per_commitment_point: keys.per_commitment_point(
            ctx.secp,
            commitments.local_commit_index(),
        ),
        channel_data,
        next_funding_txid: None,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn channel_id_from_funding_xors_output_index() {
        use bitcoin::hashes::Hash;
        let txid = Txid::from_byte_array([0xab; 32]);
        let id0 = ChannelId::from_funding(&txid, 0);
        let id1 = ChannelId::from_funding(&txid, 1);
        assert_eq!(id0.0[..31], [0xab; 32][..31]);
        assert_eq!(id0.0[31], 0xab);
        assert_eq!(id1.0[31], 0xab ^ 0x01);
        assert_ne!(id0, id1);
    }

    #[test]
    fn short_channel_id_parts() {
        let scid = ShortChannelId::new(700_123, 42, 1);
        assert_eq!(scid.block_height(), 700_123);
        assert_eq!(scid.to_string(), "700123x42x1");
    }
}
