//! The peer orchestrator: the singleton that owns the channels, the single
//! transport connection to the trampoline peer, and the serial command
//! queue through which every input flows.
//!
//! One unbounded queue is the point of truth: decoded wire frames, watch
//! notifications, timer ticks, user API calls, and swap-in outputs are all
//! enqueued and processed one at a time, so channel transitions observe a
//! total order consistent with their serialization to storage. Background
//! tasks (receive, send, ping, timeout sweep) only *produce* commands.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use bitcoin::{
    secp256k1::{All, Secp256k1},
    OutPoint, Txid,
};
use common::{
    amount::Amount, rng::SysRng, task::LxTask, time::TimestampMs,
};
use rand_core::RngCore;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{mpsc, watch},
};
use tracing::{debug, error, info, instrument, warn};

use crate::{
    channel::{
        ChannelAction, ChannelCommand, ChannelContext, ChannelEvent,
        ChannelId, ChannelState, HtlcSettlement, NonInitiatorInit,
        SpliceIn, SpliceRequest,
    },
    electrum::{refresh_feerates, ChainSource, FeeratesPerKw, WatchEvent},
    events::{EventBus, NodeEvent},
    keys::KeyManager,
    payments::{
        db::PaymentsDb,
        inbound::{
            ChannelsStatus, HintDefaults, InboundAction,
            InboundPaymentHandler, LiquidityPolicy,
        },
        outbound::{
            ChannelBalance, OutboundAction, OutboundPaymentHandler,
            SendPayment,
        },
        PaymentPreimage,
    },
    postman::Postman,
    sphinx::{MessageSphinx, PaymentSphinx},
    swap::{RequestChannelOpen, SwapInManager, SwapInParams},
    transport::{self, NoiseHandshake},
    wallet::WalletState,
    wire::{
        Features, Init, LightningMessage, PayToOpenRequest, Ping, Pong,
    },
};

/// Interval of the keep-alive ping.
pub const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Interval of the payment-timeout sweep.
pub const PAYMENT_TIMEOUT_INTERVAL: Duration = Duration::from_secs(10);

/// Timeouts for [`connect`].
#[derive(Copy, Clone, Debug)]
pub struct ConnectConfig {
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

/// Static node configuration.
pub struct NodeParams {
    pub network: bitcoin::Network,
    pub chain_hash: [u8; 32],
    pub remote_node_id: bitcoin::secp256k1::PublicKey,
    pub features: Features,
    pub liquidity_policy: LiquidityPolicy,
    pub swap_in: SwapInParams,
    /// Pre-splice mutual-close txids accepted unconfirmed during the
    /// zero-conf migration.
    pub trusted_swap_in_txs: HashSet<Txid>,
    pub hint_defaults: HintDefaults,
}

/// The externally visible state of the transport connection.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    Closed { reason: Option<String> },
    Established,
}

/// Everything the orchestrator processes, in arrival order.
pub enum PeerCommand {
    /// A fresh transport finished its handshake.
    ConnectionEstablished {
        connection_id: u64,
        outgoing_tx: mpsc::UnboundedSender<LightningMessage>,
    },
    ConnectionLost {
        connection_id: u64,
        reason: String,
    },
    MessageReceived {
        connection_id: u64,
        msg: LightningMessage,
    },
    WatchReceived(WatchEvent),
    TipUpdated {
        block_height: u32,
    },
    FeeratesUpdated(FeeratesPerKw),
    WalletUpdated(WalletState),
    SendPayment(SendPayment),
    CreateInvoice {
        preimage: PaymentPreimage,
        amount: Option<Amount>,
        description: crate::invoice::InvoiceDescription,
        expiry: Option<Duration>,
        reply_tx: tokio::sync::oneshot::Sender<
            anyhow::Result<crate::invoice::Invoice>,
        >,
    },
    ChannelCommand {
        channel_id: ChannelId,
        cmd: ChannelCommand,
    },
    UnlockWalletInputs(Vec<OutPoint>),
    CheckPaymentTimeouts,
    Disconnect,
}

struct Connection {
    id: u64,
    outgoing_tx: mpsc::UnboundedSender<LightningMessage>,
    their_init: Option<Init>,
}

/// The peer singleton. Owned by its processing loop; everything external
/// talks to it through [`PeerCommand`]s.
pub struct Peer {
    params: NodeParams,
    keys: Arc<dyn KeyManager>,
    db: Arc<dyn PaymentsDb>,
    chain: Arc<dyn ChainSource>,
    payment_sphinx: Arc<dyn PaymentSphinx>,
    postman: Arc<Postman>,
    events: EventBus,
    inbound: InboundPaymentHandler,
    outbound: OutboundPaymentHandler,
    swap_in: SwapInManager,
    secp: Secp256k1<All>,
    rng: SysRng,

    channels: HashMap<ChannelId, ChannelState>,
    connection: Option<Connection>,
    next_connection_id: u64,
    next_key_index: u64,
    block_height: Option<u32>,
    feerates: Option<FeeratesPerKw>,
    wallet: WalletState,
    pending_open_requests: HashMap<[u8; 32], RequestChannelOpen>,

    command_tx: mpsc::UnboundedSender<PeerCommand>,
    connection_state_tx: watch::Sender<ConnectionState>,
}

pub struct PeerHandle {
    pub command_tx: mpsc::UnboundedSender<PeerCommand>,
    pub connection_state: watch::Receiver<ConnectionState>,
    pub events: EventBus,
}

impl Peer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        params: NodeParams,
        keys: Arc<dyn KeyManager>,
        db: Arc<dyn PaymentsDb>,
        chain: Arc<dyn ChainSource>,
        payment_sphinx: Arc<dyn PaymentSphinx>,
        message_sphinx: Arc<dyn MessageSphinx>,
    ) -> (Self, PeerHandle, mpsc::UnboundedReceiver<PeerCommand>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (connection_state_tx, connection_state_rx) =
            watch::channel(ConnectionState::Closed { reason: None });
        let events = EventBus::new();
        let inbound =
            InboundPaymentHandler::new(db.clone(), events.clone());
        let outbound = OutboundPaymentHandler::new(
            db.clone(),
            payment_sphinx.clone(),
            events.clone(),
        );
        let postman = Arc::new(Postman::new(message_sphinx));

        let handle = PeerHandle {
            command_tx: command_tx.clone(),
            connection_state: connection_state_rx,
            events: events.clone(),
        };
        let peer = Self {
            params,
            keys,
            db,
            chain,
            payment_sphinx,
            postman,
            events,
            inbound,
            outbound,
            swap_in: SwapInManager::new(),
            secp: Secp256k1::new(),
            rng: SysRng::new(),
            channels: HashMap::new(),
            connection: None,
            next_connection_id: 0,
            next_key_index: 0,
            block_height: None,
            feerates: None,
            wallet: WalletState::default(),
            pending_open_requests: HashMap::new(),
            command_tx,
            connection_state_tx,
        };
        (peer, handle, command_rx)
    }

    /// Load persisted channels at startup; they come back `Offline`.
    pub async fn restore(&mut self) -> anyhow::Result<()> {
        let persisted = self
            .db
            .list_local_channels()
            .await
            .context("listing persisted channels")?;
        for state in persisted {
            let channel_id = state.channel_id();
            info!(%channel_id, "restoring channel");
            self.next_key_index = self.next_key_index.max(
                state
                    .commitments()
                    .map(|c| c.params.key_index + 1)
                    .unwrap_or(0),
            );
            self.apply_channel_command(
                channel_id,
                ChannelCommand::Restore(state),
                Some(ChannelState::WaitForInit),
            )
            .await;
        }
        Ok(())
    }

    /// The single consumer loop.
    pub async fn run(
        mut self,
        mut command_rx: mpsc::UnboundedReceiver<PeerCommand>,
    ) {
        while let Some(cmd) = command_rx.recv().await {
            self.process_command(cmd).await;
        }
        debug!("peer command queue closed, stopping");
    }

    #[instrument(skip_all, name = "(peer)")]
    async fn process_command(&mut self, cmd: PeerCommand) {
        match cmd {
            PeerCommand::ConnectionEstablished {
                connection_id,
                outgoing_tx,
            } => {
                info!(connection_id, "transport established");
                let init = Init {
                    features: self.params.features.clone(),
                    tlvs: vec![],
                };
                let _ = outgoing_tx.send(LightningMessage::Init(init));
                self.connection = Some(Connection {
                    id: connection_id,
                    outgoing_tx,
                    their_init: None,
                });
            }

            PeerCommand::ConnectionLost {
                connection_id,
                reason,
            } => {
                if self
                    .connection
                    .as_ref()
                    .map(|conn| conn.id != connection_id)
                    .unwrap_or(true)
                {
                    return;
                }
                warn!(connection_id, reason, "connection lost");
                self.drop_connection(Some(reason)).await;
            }

            PeerCommand::Disconnect => {
                self.drop_connection(Some("requested".to_owned())).await;
            }

            PeerCommand::MessageReceived { connection_id, msg } => {
                // Frames from a superseded connection are discarded.
                let current = self
                    .connection
                    .as_ref()
                    .map(|conn| conn.id == connection_id)
                    .unwrap_or(false);
                if !current {
                    debug!(connection_id, "dropping stale-connection frame");
                    return;
                }
                self.process_message(msg).await;
            }

            PeerCommand::WatchReceived(event) => {
                let channel_id = event.channel_id();
                self.apply_channel_command(
                    channel_id,
                    ChannelCommand::WatchReceived(event),
                    None,
                )
                .await;
            }

            PeerCommand::TipUpdated { block_height } => {
                self.block_height = Some(block_height);
                let channel_ids =
                    self.channels.keys().copied().collect::<Vec<_>>();
                for channel_id in channel_ids {
                    self.apply_channel_command(
                        channel_id,
                        ChannelCommand::CheckHtlcTimeout,
                        None,
                    )
                    .await;
                }
            }

            PeerCommand::FeeratesUpdated(feerates) => {
                self.feerates = Some(feerates);
            }

            PeerCommand::WalletUpdated(wallet) => {
                self.wallet = wallet;
                self.consider_swap_in().await;
            }

            PeerCommand::SendPayment(request) => {
                self.send_payment(request).await;
            }

            PeerCommand::CreateInvoice {
                preimage,
                amount,
                description,
                expiry,
                reply_tx,
            } => {
                let result = self
                    .create_invoice(preimage, amount, description, expiry)
                    .await;
                let _ = reply_tx.send(result);
            }

            PeerCommand::ChannelCommand { channel_id, cmd } => {
                self.apply_channel_command(channel_id, cmd, None).await;
            }

            PeerCommand::UnlockWalletInputs(outpoints) => {
                self.swap_in.unlock_wallet_inputs(outpoints);
            }

            PeerCommand::CheckPaymentTimeouts => {
                let actions =
                    self.inbound.check_timeouts(TimestampMs::now()).await;
                self.dispatch_inbound_actions(actions);
            }
        }
    }

    // --- Message routing --- //

    async fn process_message(&mut self, msg: LightningMessage) {
        match msg {
            LightningMessage::Init(their_init) => {
                self.handle_their_init(their_init).await;
            }

            LightningMessage::Ping(ping) => {
                let pong = Pong {
                    ignored: vec![0u8; usize::from(ping.num_pong_bytes)],
                };
                self.send_message(LightningMessage::Pong(pong));
            }
            LightningMessage::Pong(..) => {}

            // A zero channel id addresses the connection: log, never
            // close channels over it.
            LightningMessage::Error(err) if err.is_connection_level() => {
                error!("connection-level error: {}", err.to_ascii());
            }
            LightningMessage::Warning(warning) => {
                warn!(
                    channel_id = %warning.channel_id,
                    "peer warning: {}",
                    String::from_utf8_lossy(&warning.data),
                );
            }

            LightningMessage::ChannelUpdate(update) => {
                // Matched by short_channel_id against Normal channels.
                let target = self.channels.iter().find_map(
                    |(channel_id, state)| match state {
                        ChannelState::Normal(data)
                            if data.short_channel_id.0
                                == update.short_channel_id =>
                            Some(*channel_id),
                        _ => None,
                    },
                );
                match target {
                    Some(channel_id) => {
                        self.apply_channel_command(
                            channel_id,
                            ChannelCommand::MessageReceived(
                                LightningMessage::ChannelUpdate(update),
                            ),
                            None,
                        )
                        .await;
                    }
                    None => debug!(
                        scid = update.short_channel_id,
                        "channel_update for unknown channel",
                    ),
                }
            }

            LightningMessage::OnionMessage(onion_msg) => {
                let node_secret = self.keys.node_secret();
                if let Some(delivered) =
                    self.postman.process(&node_secret, onion_msg)
                {
                    debug!(
                        bytes = delivered.payload.len(),
                        "unsolicited onion message payload",
                    );
                }
            }

            LightningMessage::PayToOpenRequest(request) => {
                self.handle_pay_to_open(request).await;
            }

            LightningMessage::LegacyInfo(info) => {
                self.events.emit(NodeEvent::LegacyInfo {
                    has_channels: info.has_channels,
                });
            }

            // Push-notification token messages only travel node -> peer.
            LightningMessage::FcmToken(..)
            | LightningMessage::UnsetFcmToken => {
                debug!("ignoring fcm token message from peer");
            }

            LightningMessage::OpenChannel2(open)
                if !self.routes_to_existing_channel(
                    open.temporary_channel_id,
                ) =>
            {
                self.handle_new_open_channel(open).await;
            }

            // Everything else routes to the owning channel, by final or
            // temporary channel id.
            msg => match msg.channel_id() {
                Some(raw_id) => {
                    let Some(channel_id) = self.resolve_channel(raw_id)
                    else {
                        debug!(
                            channel_id = %raw_id,
                            msg_type = msg.msg_type(),
                            "message for unknown channel",
                        );
                        return;
                    };
                    self.apply_channel_command(
                        channel_id,
                        ChannelCommand::MessageReceived(msg),
                        None,
                    )
                    .await;
                }
                None => {
                    // Unknown message codes were already filtered by the
                    // read loop's odd/even rule.
                    debug!(
                        msg_type = msg.msg_type(),
                        "unroutable message dropped",
                    );
                }
            },
        }
    }

    async fn handle_their_init(&mut self, their_init: Init) {
        // Validate the feature graph: an unknown even bit is fatal.
        if let Some(bit) =
            their_init.features.unknown_even_bit(&KNOWN_FEATURES)
        {
            error!(bit, "peer requires an unknown feature, disconnecting");
            self.drop_connection(Some(format!(
                "unknown required feature bit {bit}",
            )))
            .await;
            return;
        }

        if let Some(conn) = &mut self.connection {
            if conn.their_init.is_some() {
                debug!("duplicate init from peer");
            }
            conn.their_init = Some(their_init.clone());
        }
        let _ = self
            .connection_state_tx
            .send(ConnectionState::Established);
        info!("peer connection established");

        // Refresh on-chain feerates on every reconnection.
        match refresh_feerates(self.chain.as_ref()).await {
            Ok(feerates) => self.feerates = Some(feerates),
            Err(err) => warn!("feerate refresh failed: {err:#}"),
        }

        let our_init = Init {
            features: self.params.features.clone(),
            tlvs: vec![],
        };
        let channel_ids =
            self.channels.keys().copied().collect::<Vec<_>>();
        for channel_id in channel_ids {
            self.apply_channel_command(
                channel_id,
                ChannelCommand::Connected {
                    our_init: our_init.clone(),
                    their_init: their_init.clone(),
                },
                None,
            )
            .await;
        }
    }

    /// `open_channel2` not matching any known channel: this is the peer
    /// responding to our `please_open_channel` (the origin TLV carries the
    /// request id) or initiating a pay-to-open funding.
    async fn handle_new_open_channel(
        &mut self,
        open: crate::wire::OpenChannel2,
    ) {
        use crate::wire::ChannelOrigin;

        let (wallet_inputs, origin) = match &open.origin {
            Some(ChannelOrigin::PleaseOpenChannel {
                request_id, ..
            }) => {
                let Some(request) =
                    self.pending_open_requests.remove(request_id)
                else {
                    warn!("open_channel2 for unknown request id");
                    self.send_message(LightningMessage::Error(
                        crate::wire::ErrorMsg::new(
                            open.temporary_channel_id,
                            "unknown please_open_channel request",
                        ),
                    ));
                    return;
                };
                (request.wallet_inputs, open.origin.clone())
            }
            _ => (vec![], open.origin.clone()),
        };

        // The contributed funding is our inputs minus their weight at the
        // funding feerate; the push covers the fees the peer charges. A
        // funding below the push is a net loss, reject it.
        let input_total: Amount = wallet_inputs
            .iter()
            .map(|input| input.amount)
            .sum();
        let input_fee = Amount::from_sat(
            crate::channel::scripts::weight_to_fee_sat(
                open.funding_feerate_per_kw,
                crate::channel::scripts::P2WPKH_INPUT_WEIGHT
                    * wallet_inputs.len() as u64,
            ),
        );
        let funding_contribution = input_total.saturating_sub(input_fee);
        let push = open.push_amount.unwrap_or(Amount::ZERO);
        let funding_total =
            Amount::from_sat(open.funding_amount_sat) + funding_contribution;
        if funding_total < push {
            warn!("rejecting open: funding below push amount");
            self.send_message(LightningMessage::Error(
                crate::wire::ErrorMsg::new(
                    open.temporary_channel_id,
                    "funding amount below push amount",
                ),
            ));
            self.swap_in.unlock_wallet_inputs(
                wallet_inputs.iter().map(|input| input.outpoint),
            );
            return;
        }

        let key_index = self.next_key_index;
        self.next_key_index += 1;
        let init = NonInitiatorInit {
            temporary_channel_id: open.temporary_channel_id,
            funding_contribution,
            wallet_inputs,
            origin,
            key_index,
        };

        let temporary_id = open.temporary_channel_id;
        self.channels
            .insert(temporary_id, ChannelState::WaitForInit);
        self.apply_channel_command(
            temporary_id,
            ChannelCommand::InitNonInitiator(init),
            None,
        )
        .await;
        self.apply_channel_command(
            temporary_id,
            ChannelCommand::MessageReceived(
                LightningMessage::OpenChannel2(open),
            ),
            None,
        )
        .await;
    }

    async fn handle_pay_to_open(&mut self, request: PayToOpenRequest) {
        let node_secret = self.keys.node_secret();
        let payload = match self.payment_sphinx.peel_to_final(
            &node_secret,
            &request.payment_hash,
            &request.final_packet,
        ) {
            Ok(payload) => payload,
            Err(err) => {
                warn!("undecodable pay-to-open onion: {err}");
                return;
            }
        };
        let actions = self
            .inbound
            .process_pay_to_open(
                &request,
                &payload,
                self.params.liquidity_policy,
                self.channels_status(),
                TimestampMs::now(),
            )
            .await;
        self.dispatch_inbound_actions(actions);
    }

    // --- Payments --- //

    /// Create an invoice hinted through the trampoline peer, using the
    /// maximum fees across the remote channel updates we have seen.
    async fn create_invoice(
        &mut self,
        preimage: PaymentPreimage,
        amount: Option<Amount>,
        description: crate::invoice::InvoiceDescription,
        expiry: Option<Duration>,
    ) -> anyhow::Result<crate::invoice::Invoice> {
        let remote_updates = self
            .channels
            .values()
            .filter_map(|state| match state {
                ChannelState::Normal(data) =>
                    data.remote_channel_update.clone(),
                _ => None,
            })
            .collect::<Vec<_>>();
        let hint_scid = self
            .channels
            .values()
            .find_map(|state| match state {
                ChannelState::Normal(data) =>
                    Some(data.short_channel_id.0),
                _ => None,
            })
            .unwrap_or(0);
        let node_secret = self.keys.node_secret();
        self.inbound
            .create_invoice(
                &self.secp,
                self.params.network,
                &node_secret,
                self.params.remote_node_id,
                hint_scid,
                &remote_updates,
                self.params.hint_defaults,
                preimage,
                amount,
                description,
                expiry,
                &mut self.rng,
            )
            .await
    }

    async fn send_payment(&mut self, request: SendPayment) {
        let balances = self.channel_balances();
        let Some(block_height) = self.block_height else {
            warn!("no chain tip yet, failing payment");
            return;
        };
        match self
            .outbound
            .send_payment(request, balances, block_height, &mut self.rng)
            .await
        {
            Ok(actions) => self.dispatch_outbound_actions(actions),
            Err(err) => error!("send payment failed: {err:#}"),
        }
    }

    fn dispatch_outbound_actions(&self, actions: Vec<OutboundAction>) {
        for action in actions {
            match action {
                OutboundAction::AddHtlc { channel_id, spec } => {
                    let _ = self.command_tx.send(
                        PeerCommand::ChannelCommand {
                            channel_id,
                            cmd: ChannelCommand::AddHtlc(spec),
                        },
                    );
                }
            }
        }
    }

    fn dispatch_inbound_actions(&self, actions: Vec<InboundAction>) {
        for action in actions {
            match action {
                InboundAction::FulfillHtlc {
                    channel_id,
                    htlc_id,
                    preimage,
                } => {
                    let _ = self.command_tx.send(
                        PeerCommand::ChannelCommand {
                            channel_id,
                            cmd: ChannelCommand::FulfillHtlc {
                                id: htlc_id,
                                preimage,
                                commit: true,
                            },
                        },
                    );
                }
                InboundAction::FailHtlc {
                    channel_id,
                    htlc_id,
                    reason,
                } => {
                    let _ = self.command_tx.send(
                        PeerCommand::ChannelCommand {
                            channel_id,
                            cmd: ChannelCommand::FailHtlc {
                                id: htlc_id,
                                reason: format!("{reason:?}").into_bytes(),
                                commit: true,
                            },
                        },
                    );
                }
                InboundAction::PayToOpenResponse(response) => {
                    self.send_message(
                        LightningMessage::PayToOpenResponse(response),
                    );
                }
            }
        }
    }

    // --- Swap-in --- //

    /// Promote confirmed wallet UTXOs into channel liquidity: splice into
    /// an existing `Normal` channel when we have one, otherwise ask the
    /// peer to open a channel with our inputs.
    async fn consider_swap_in(&mut self) {
        let Some(block_height) = self.block_height else { return };
        let channel_utxos = self
            .channels
            .values()
            .filter_map(ChannelState::commitments)
            .flat_map(|commitments| commitments.funding_inputs())
            .collect::<HashSet<_>>();
        let Some(request) = self.swap_in.try_swap_in(
            block_height,
            &self.wallet,
            &self.params.swap_in,
            &self.params.trusted_swap_in_txs,
            &channel_utxos,
            &mut self.rng,
        ) else {
            return;
        };

        let feerates = self.feerates.unwrap_or(FeeratesPerKw::FALLBACK);
        let normal_channel = self.channels.iter().find_map(
            |(channel_id, state)| match state {
                ChannelState::Normal(..) => Some(*channel_id),
                _ => None,
            },
        );

        match normal_channel {
            Some(channel_id) => {
                // Splice into the existing channel; the CPFP-adjusted
                // feerate brings the whole ancestor package up to target.
                let package_weight: u64 = request
                    .wallet_inputs
                    .iter()
                    .map(|input| input.parent_tx.weight().to_wu())
                    .sum();
                let feerate = match self
                    .chain
                    .cpfp_feerate(package_weight, feerates.funding)
                    .await
                {
                    Ok(feerate) => feerate,
                    Err(err) => {
                        warn!("cpfp feerate failed: {err:#}");
                        self.swap_in
                            .unlock_wallet_inputs(request.outpoints());
                        return;
                    }
                };
                info!(%channel_id, "splicing swap-in funds");
                let _ =
                    self.command_tx.send(PeerCommand::ChannelCommand {
                        channel_id,
                        cmd: ChannelCommand::Splice(SpliceRequest {
                            splice_in: Some(SpliceIn {
                                wallet_inputs: request.wallet_inputs,
                            }),
                            splice_out: None,
                            feerate_per_kw: feerate,
                        }),
                    });
            }
            None => {
                let num_inputs = request.wallet_inputs.len() as u16;
                let total_input_weight =
                    crate::channel::scripts::P2WPKH_INPUT_WEIGHT
                        * u64::from(num_inputs);
                let balance: Amount = request
                    .wallet_inputs
                    .iter()
                    .map(|input| input.amount)
                    .sum();
                let grandparents = request
                    .wallet_inputs
                    .iter()
                    .flat_map(|input| {
                        input
                            .parent_tx
                            .input
                            .iter()
                            .map(|txin| txin.previous_output)
                    })
                    .collect();
                let msg = crate::wire::PleaseOpenChannel {
                    chain_hash: self.params.chain_hash,
                    request_id: request.request_id,
                    local_funding_amount_sat: balance.sats_floor(),
                    num_inputs,
                    total_input_weight: total_input_weight as u32,
                    grandparents,
                };
                info!("requesting channel open from peer");
                self.pending_open_requests
                    .insert(request.request_id, request);
                self.send_message(LightningMessage::PleaseOpenChannel(
                    msg,
                ));
            }
        }
    }

    // --- Channel plumbing --- //

    fn channel_context(&self) -> ChannelContext<'_> {
        ChannelContext {
            local_node_id: self.keys.node_id(),
            remote_node_id: self.params.remote_node_id,
            chain_hash: self.params.chain_hash,
            block_height: self.block_height.unwrap_or(0),
            feerates: self.feerates.unwrap_or(FeeratesPerKw::FALLBACK),
            keys: self.keys.as_ref(),
            secp: &self.secp,
        }
    }

    fn resolve_channel(&self, raw_id: ChannelId) -> Option<ChannelId> {
        if self.channels.contains_key(&raw_id) {
            return Some(raw_id);
        }
        // Temporary ids are honored until the funding-derived id lands.
        self.channels.iter().find_map(|(key, state)| {
            state.channel_ids().contains(&raw_id).then_some(*key)
        })
    }

    fn routes_to_existing_channel(&self, raw_id: ChannelId) -> bool {
        self.resolve_channel(raw_id).is_some()
    }

    /// Run one channel transition and interpret its actions. `seed` is
    /// used when the channel does not exist yet (restore, new open).
    async fn apply_channel_command(
        &mut self,
        channel_id: ChannelId,
        cmd: ChannelCommand,
        seed: Option<ChannelState>,
    ) {
        let state = match self.channels.remove(&channel_id) {
            Some(state) => state,
            None => match seed {
                Some(seed) => seed,
                None => {
                    debug!(%channel_id, "command for unknown channel");
                    return;
                }
            },
        };

        let (next_state, actions) = {
            let ctx = self.channel_context();
            state.process(cmd, &ctx)
        };

        // Aborted and fully-closed channels fall out of the map.
        let keep = !matches!(next_state, ChannelState::Aborted);
        if keep {
            self.channels.insert(channel_id, next_state);
        }

        self.apply_channel_actions(channel_id, actions).await;
    }

    async fn apply_channel_actions(
        &mut self,
        channel_id: ChannelId,
        actions: Vec<ChannelAction>,
    ) {
        for action in actions {
            self.apply_channel_action(channel_id, action).await;
        }
    }

    async fn apply_channel_action(
        &mut self,
        channel_id: ChannelId,
        action: ChannelAction,
    ) {
        match action {
            ChannelAction::SendMessage(msg) => self.send_message(msg),

            ChannelAction::SendToSelf(cmd) => {
                let _ = self.command_tx.send(PeerCommand::ChannelCommand {
                    channel_id,
                    cmd: *cmd,
                });
            }

            ChannelAction::SendWatch(watch) => {
                if let Err(err) = self.chain.watch(watch).await {
                    warn!("failed to register watch: {err:#}");
                }
            }

            ChannelAction::PublishTx(tx) => {
                let txid = tx.compute_txid();
                match self.chain.publish(&tx).await {
                    Ok(()) => debug!(%txid, "published tx"),
                    Err(err) =>
                        error!(%txid, "failed to publish tx: {err:#}"),
                }
            }

            ChannelAction::StoreState(state) => {
                if let Err(err) =
                    self.db.add_or_update_channel(state).await
                {
                    // Storage failures are surfaced, never silently
                    // retried.
                    error!(%channel_id, "failed to persist channel: {err}");
                }
            }

            ChannelAction::RemoveChannel(id) => {
                if let Err(err) = self.db.remove_channel(id).await {
                    error!(%id, "failed to remove channel: {err}");
                }
                self.channels.remove(&id);
            }

            ChannelAction::StoreHtlcInfos(htlc_infos) => {
                if let Err(err) = self.db.add_htlc_infos(htlc_infos).await
                {
                    error!("failed to store htlc infos: {err}");
                }
            }

            ChannelAction::GetHtlcInfos {
                revoked_commit_txid,
                commitment_number,
            } => {
                match self
                    .db
                    .list_htlc_infos(channel_id, commitment_number)
                    .await
                {
                    Ok(htlc_infos) => {
                        let _ = self.command_tx.send(
                            PeerCommand::ChannelCommand {
                                channel_id,
                                cmd:
                                    ChannelCommand::GetHtlcInfosResponse {
                                        revoked_commit_txid,
                                        htlc_infos,
                                    },
                            },
                        );
                    }
                    Err(err) =>
                        error!("failed to list htlc infos: {err}"),
                }
            }

            ChannelAction::StoreIncomingPayment {
                amount,
                origin,
                received_with,
            } => {
                self.store_incoming_payment(amount, origin, received_with)
                    .await;
            }

            ChannelAction::StoreOutgoingPayment(payment) => {
                if let Err(err) =
                    self.db.add_on_chain_payment(payment).await
                {
                    error!("failed to store on-chain payment: {err}");
                }
            }

            ChannelAction::SetLocked(txid) => {
                if let Err(err) =
                    self.db.set_locked(txid, TimestampMs::now()).await
                {
                    error!(%txid, "failed to set locked: {err}");
                }
            }

            ChannelAction::IdAssigned {
                temporary,
                assigned,
            } => {
                debug!(%temporary, %assigned, "channel id assigned");
                if let Some(state) = self.channels.remove(&temporary) {
                    self.channels.insert(assigned, state);
                }
            }

            ChannelAction::ProcessIncomingHtlc(add) => {
                let node_secret = self.keys.node_secret();
                let payload = match self.payment_sphinx.peel_to_final(
                    &node_secret,
                    &add.payment_hash,
                    &add.onion,
                ) {
                    Ok(payload) => payload,
                    Err(err) => {
                        warn!("undecodable htlc onion: {err}");
                        let _ = self.command_tx.send(
                            PeerCommand::ChannelCommand {
                                channel_id,
                                cmd: ChannelCommand::FailHtlc {
                                    id: add.id,
                                    reason: b"invalid onion".to_vec(),
                                    commit: true,
                                },
                            },
                        );
                        return;
                    }
                };
                let actions = self
                    .inbound
                    .process_htlc(
                        &add,
                        &payload,
                        self.block_height.unwrap_or(0),
                        TimestampMs::now(),
                    )
                    .await;
                self.dispatch_inbound_actions(actions);
            }

            ChannelAction::AddFailed(failed) => {
                match self
                    .outbound
                    .on_add_failed(&failed, &mut self.rng)
                    .await
                {
                    Ok(actions) => self.dispatch_outbound_actions(actions),
                    Err(err) => error!("add-failed handling: {err:#}"),
                }
            }

            ChannelAction::AddSettled(HtlcSettlement::Fulfilled {
                origin,
                preimage,
            }) => {
                if let Err(err) = self
                    .outbound
                    .on_add_settled_fulfill(origin, preimage)
                    .await
                {
                    error!("fulfill handling: {err:#}");
                }
            }

            ChannelAction::AddSettled(HtlcSettlement::Failed {
                origin,
                reason,
            }) => {
                match self
                    .outbound
                    .on_add_settled_fail(origin, &reason, &mut self.rng)
                    .await
                {
                    Ok(actions) => self.dispatch_outbound_actions(actions),
                    Err(err) => error!("fail handling: {err:#}"),
                }
            }

            ChannelAction::NotExecuted { command, error } => {
                debug!(%channel_id, command, "command not executed: {error}");
            }

            ChannelAction::UnlockWalletInputs(outpoints) => {
                self.swap_in.unlock_wallet_inputs(outpoints);
            }

            ChannelAction::EmitEvent(event) => {
                self.emit_channel_event(event);
            }
        }
    }

    async fn store_incoming_payment(
        &mut self,
        amount: Amount,
        origin: Option<crate::wire::ChannelOrigin>,
        received_with: crate::payments::ReceivedWith,
    ) {
        use crate::wire::ChannelOrigin;
        let now = TimestampMs::now();
        match origin {
            // Pay-to-open parts land on the existing invoice row.
            Some(ChannelOrigin::PayToOpen { payment_hash, .. }) => {
                if let Err(err) = self
                    .db
                    .receive_payment(
                        crate::payments::PaymentHash(payment_hash),
                        vec![received_with],
                        now,
                    )
                    .await
                {
                    error!("failed to record pay-to-open: {err}");
                }
            }
            // Swap-ins create a fresh incoming payment keyed by a local
            // preimage.
            _ => {
                let mut preimage_bytes = [0u8; 32];
                self.rng.fill_bytes(&mut preimage_bytes);
                let preimage = PaymentPreimage(preimage_bytes);
                let payment_hash = preimage.payment_hash();
                if let Err(err) = self
                    .db
                    .add_incoming_payment(
                        preimage,
                        crate::payments::IncomingOrigin::SwapIn {
                            address: None,
                        },
                        now,
                    )
                    .await
                {
                    error!("failed to create swap-in payment: {err}");
                    return;
                }
                if let Err(err) = self
                    .db
                    .receive_payment(payment_hash, vec![received_with], now)
                    .await
                {
                    error!("failed to record swap-in: {err}");
                }
                self.events.emit(NodeEvent::PaymentReceived {
                    payment_hash,
                    amount,
                });
            }
        }
    }

    fn emit_channel_event(&self, event: ChannelEvent) {
        let node_event = match event {
            ChannelEvent::ChannelOpened { channel_id } =>
                NodeEvent::ChannelOpened { channel_id },
            ChannelEvent::ChannelClosing {
                channel_id,
                closing_type,
            } => NodeEvent::ChannelClosing {
                channel_id,
                closing_type,
            },
            ChannelEvent::ChannelClosed { channel_id } =>
                NodeEvent::ChannelClosed { channel_id },
            ChannelEvent::SpliceLocked {
                channel_id,
                funding_txid,
            } => NodeEvent::SpliceLocked {
                channel_id,
                funding_txid,
            },
            ChannelEvent::UpgradeRequired { channel_id } =>
                NodeEvent::UpgradeRequired { channel_id },
        };
        self.events.emit(node_event);
    }

    // --- Views --- //

    fn channels_status(&self) -> ChannelsStatus {
        let mut initializing = false;
        for state in self.channels.values() {
            match state {
                ChannelState::Normal(..) => return ChannelsStatus::HasNormal,
                ChannelState::WaitForFundingSigned { .. }
                | ChannelState::WaitForFundingConfirmed { .. }
                | ChannelState::WaitForChannelReady { .. } =>
                    initializing = true,
                _ => {}
            }
        }
        if initializing {
            ChannelsStatus::Initializing
        } else {
            ChannelsStatus::None
        }
    }

    fn channel_balances(&self) -> Vec<ChannelBalance> {
        self.channels
            .iter()
            .filter_map(|(channel_id, state)| match state {
                ChannelState::Normal(data) => {
                    let spec = data.commitments.projected_spec();
                    let reserve = Amount::from_sat(
                        data.commitments
                            .params
                            .remote
                            .channel_reserve_sat,
                    );
                    Some(ChannelBalance {
                        channel_id: *channel_id,
                        available: spec.to_local.saturating_sub(reserve),
                    })
                }
                _ => None,
            })
            .collect()
    }

    // --- Connection plumbing --- //

    fn send_message(&self, msg: LightningMessage) {
        let Some(conn) = &self.connection else {
            debug!(
                msg_type = msg.msg_type(),
                "not connected, dropping outgoing message",
            );
            return;
        };
        // The send loop is the single consumer; on overflow the message
        // drops with a warning rather than blocking the orchestrator.
        if conn.outgoing_tx.send(msg).is_err() {
            warn!("send loop gone, dropping outgoing message");
        }
    }

    async fn drop_connection(&mut self, reason: Option<String>) {
        if self.connection.take().is_none() {
            return;
        }
        let _ = self
            .connection_state_tx
            .send(ConnectionState::Closed { reason });

        // Pending pay-to-open requests die with the connection.
        for (_, request) in self.pending_open_requests.drain() {
            self.swap_in.unlock_wallet_inputs(request.outpoints());
        }

        let channel_ids = self.channels.keys().copied().collect::<Vec<_>>();
        for channel_id in channel_ids {
            self.apply_channel_command(
                channel_id,
                ChannelCommand::Disconnected,
                None,
            )
            .await;
        }
    }

    /// Fresh connection ids; frames tagged with an older id are ignored
    /// by the time their command is processed.
    pub fn next_connection_id(&mut self) -> u64 {
        self.next_connection_id += 1;
        self.next_connection_id
    }
}

/// Features we understand (BOLT 9 even bits only; odd bits are always
/// acceptable).
const KNOWN_FEATURES: [usize; 7] = [0, 4, 8, 12, 14, 16, 38];

/// Open the TCP socket to the peer within the connect timeout.
pub async fn connect_tcp(
    addr: &str,
    config: &ConnectConfig,
) -> anyhow::Result<tokio::net::TcpStream> {
    tokio::time::timeout(
        config.connect_timeout,
        tokio::net::TcpStream::connect(addr),
    )
    .await
    .context("connect request timed out")?
    .context("TcpStream::connect() failed")
}

/// Handshake + spawn the connection-scoped task tree (receive loop, send
/// loop, keep-alive ping, payment-timeout sweep). Tasks only produce
/// [`PeerCommand`]s; they never mutate state directly.
pub async fn establish_connection<S>(
    mut stream: S,
    noise: Box<dyn NoiseHandshake>,
    config: ConnectConfig,
    connection_id: u64,
    command_tx: mpsc::UnboundedSender<PeerCommand>,
) -> anyhow::Result<Vec<LxTask<()>>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (send_cipher, recv_cipher) = transport::handshake(
        &mut stream,
        noise,
        config.handshake_timeout,
    )
    .await?;
    let (mut writer, mut reader) =
        transport::framed(stream, send_cipher, recv_cipher);

    let (outgoing_tx, mut outgoing_rx) =
        mpsc::unbounded_channel::<LightningMessage>();

    command_tx
        .send(PeerCommand::ConnectionEstablished {
            connection_id,
            outgoing_tx: outgoing_tx.clone(),
        })
        .ok()
        .context("peer loop is gone")?;

    let mut tasks = Vec::new();

    // Send loop: single consumer of the outgoing queue.
    tasks.push(LxTask::spawn("peer-send", async move {
        while let Some(msg) = outgoing_rx.recv().await {
            if let Err(err) = writer.write_frame(&msg.encode()).await {
                warn!("send loop failed: {err:#}");
                break;
            }
        }
    }));

    // Receive loop: decode frames into commands.
    let recv_command_tx = command_tx.clone();
    tasks.push(LxTask::spawn("peer-recv", async move {
        loop {
            let frame = match reader.read_frame().await {
                Ok(frame) => frame,
                Err(err) => {
                    let _ =
                        recv_command_tx.send(PeerCommand::ConnectionLost {
                            connection_id,
                            reason: format!("{err:#}"),
                        });
                    return;
                }
            };
            match LightningMessage::decode(&frame) {
                Ok(msg) => {
                    let _ =
                        recv_command_tx.send(PeerCommand::MessageReceived {
                            connection_id,
                            msg,
                        });
                }
                Err(crate::wire::codec::WireError::UnknownMessage(
                    msg_type,
                )) if crate::wire::unknown_type_is_odd(msg_type) => {
                    debug!(msg_type, "ignoring unknown odd message");
                }
                Err(err) => {
                    warn!("undecodable frame: {err}");
                    let _ =
                        recv_command_tx.send(PeerCommand::ConnectionLost {
                            connection_id,
                            reason: format!("protocol error: {err}"),
                        });
                    return;
                }
            }
        }
    }));

    // Keep-alive ping.
    let ping_tx = outgoing_tx.clone();
    tasks.push(LxTask::spawn("peer-ping", async move {
        let mut interval = tokio::time::interval(PING_INTERVAL);
        interval.tick().await; // immediate first tick
        loop {
            interval.tick().await;
            let ping = LightningMessage::Ping(Ping {
                num_pong_bytes: 8,
                ignored: vec![],
            });
            if ping_tx.send(ping).is_err() {
                return;
            }
        }
    }));

    // Payment-timeout sweep.
    let sweep_tx = command_tx;
    tasks.push(LxTask::spawn("payment-timeout", async move {
        let mut interval = tokio::time::interval(PAYMENT_TIMEOUT_INTERVAL);
        loop {
            interval.tick().await;
            if sweep_tx.send(PeerCommand::CheckPaymentTimeouts).is_err() {
                return;
            }
        }
    }));

    Ok(tasks)
}

#[cfg(test)]
mod test {
    use async_trait::async_trait;
    use bitcoin::{block::Header, Transaction};

    use super::*;
    use crate::{
        electrum::Watch,
        keys::SeedKeyManager,
        payments::db::MemoryPaymentsDb,
        sphinx::fake::{FakeMessageSphinx, FakePaymentSphinx},
        wallet::UnspentItem,
    };

    struct FakeChain;

    #[async_trait]
    impl ChainSource for FakeChain {
        async fn tip(&self) -> anyhow::Result<(u32, Header)> {
            anyhow::bail!("not used in tests")
        }
        async fn estimate_fee(
            &self,
            _blocks: u32,
        ) -> anyhow::Result<Option<u32>> {
            Ok(Some(2_500))
        }
        async fn cpfp_feerate(
            &self,
            _package_weight: u64,
            target_feerate: u32,
        ) -> anyhow::Result<u32> {
            Ok(target_feerate * 2)
        }
        async fn publish(&self, _tx: &Transaction) -> anyhow::Result<()> {
            Ok(())
        }
        async fn watch(&self, _watch: Watch) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn node_params() -> NodeParams {
        let secp = Secp256k1::new();
        let remote = bitcoin::secp256k1::SecretKey::from_slice(&[2; 32])
            .unwrap();
        NodeParams {
            network: bitcoin::Network::Regtest,
            chain_hash: [6; 32],
            remote_node_id:
                bitcoin::secp256k1::PublicKey::from_secret_key(
                    &secp, &remote,
                ),
            features: Features(vec![0x02, 0x02]),
            liquidity_policy: LiquidityPolicy::Auto {
                max_absolute_fee: Amount::from_sat(5_000),
                max_relative_fee_basis_points: 3_000,
            },
            swap_in: SwapInParams {
                min_confirmations: 3,
                max_confirmations: 720,
                refund_delay: 25_920,
            },
            trusted_swap_in_txs: HashSet::new(),
            hint_defaults: HintDefaults::default(),
        }
    }

    fn make_peer() -> (
        Peer,
        PeerHandle,
        mpsc::UnboundedReceiver<PeerCommand>,
    ) {
        logger::init_for_testing();
        Peer::new(
            node_params(),
            Arc::new(SeedKeyManager::new([1; 32])),
            Arc::new(MemoryPaymentsDb::new()),
            Arc::new(FakeChain),
            Arc::new(FakePaymentSphinx),
            Arc::new(FakeMessageSphinx),
        )
    }

    fn established(
        peer: &mut Peer,
    ) -> mpsc::UnboundedReceiver<LightningMessage> {
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        peer.connection = Some(Connection {
            id: 1,
            outgoing_tx,
            their_init: Some(Init::default()),
        });
        outgoing_rx
    }

    #[tokio::test]
    async fn stale_connection_frames_are_discarded() {
        let (mut peer, _handle, _rx) = make_peer();
        let mut outgoing = established(&mut peer);

        // A ping over the stale connection id 0 is dropped; over the
        // current id it is answered.
        let ping = LightningMessage::Ping(Ping {
            num_pong_bytes: 2,
            ignored: vec![],
        });
        peer.process_command(PeerCommand::MessageReceived {
            connection_id: 0,
            msg: ping.clone(),
        })
        .await;
        assert!(outgoing.try_recv().is_err());

        peer.process_command(PeerCommand::MessageReceived {
            connection_id: 1,
            msg: ping,
        })
        .await;
        assert!(matches!(
            outgoing.try_recv().unwrap(),
            LightningMessage::Pong(..),
        ));
    }

    #[tokio::test]
    async fn connection_level_error_does_not_touch_channels() {
        let (mut peer, _handle, _rx) = make_peer();
        let _outgoing = established(&mut peer);

        peer.process_command(PeerCommand::MessageReceived {
            connection_id: 1,
            msg: LightningMessage::Error(crate::wire::ErrorMsg::new(
                ChannelId::ZERO,
                "connection-level problem",
            )),
        })
        .await;
        // No channels existed and none were created or removed.
        assert!(peer.channels.is_empty());
    }

    #[tokio::test]
    async fn wallet_update_without_channels_requests_open() {
        let (mut peer, _handle, _rx) = make_peer();
        let mut outgoing = established(&mut peer);
        peer.block_height = Some(150);

        // A deeply confirmed utxo in the wallet.
        let parent = Transaction {
            version: bitcoin::transaction::Version::TWO,
            lock_time: bitcoin::absolute::LockTime::ZERO,
            input: vec![],
            output: vec![],
        };
        let mut wallet = WalletState::default();
        wallet
            .parent_txs
            .insert(parent.compute_txid(), parent.clone());
        wallet.addresses.insert(
            "addr".to_owned(),
            vec![UnspentItem {
                outpoint: OutPoint::new(parent.compute_txid(), 0),
                amount: Amount::from_sat(200_000),
                block_height: 100,
            }],
        );

        peer.process_command(PeerCommand::WalletUpdated(wallet)).await;

        let msg = outgoing.try_recv().expect("please_open_channel sent");
        match msg {
            LightningMessage::PleaseOpenChannel(open) => {
                assert_eq!(open.num_inputs, 1);
                assert_eq!(open.local_funding_amount_sat, 200_000);
                assert!(peer
                    .pending_open_requests
                    .contains_key(&open.request_id));
            }
            other => panic!("unexpected message: {other:?}"),
        }

        // A second wallet update must not double-commit the same utxo.
        assert!(outgoing.try_recv().is_err());
    }

    #[tokio::test]
    async fn disconnect_purges_pending_open_requests() {
        let (mut peer, _handle, _rx) = make_peer();
        let _outgoing = established(&mut peer);
        peer.block_height = Some(150);

        let parent = Transaction {
            version: bitcoin::transaction::Version::TWO,
            lock_time: bitcoin::absolute::LockTime::ZERO,
            input: vec![],
            output: vec![],
        };
        let mut wallet = WalletState::default();
        wallet
            .parent_txs
            .insert(parent.compute_txid(), parent.clone());
        wallet.addresses.insert(
            "addr".to_owned(),
            vec![UnspentItem {
                outpoint: OutPoint::new(parent.compute_txid(), 0),
                amount: Amount::from_sat(200_000),
                block_height: 100,
            }],
        );
        peer.process_command(PeerCommand::WalletUpdated(wallet.clone()))
            .await;
        assert_eq!(peer.pending_open_requests.len(), 1);
        assert_eq!(peer.swap_in.reserved().len(), 1);

        peer.process_command(PeerCommand::Disconnect).await;
        assert!(peer.pending_open_requests.is_empty());
        // The reservation was released, so the utxo can be offered again
        // on the next connection.
        assert!(peer.swap_in.reserved().is_empty());
    }

    #[tokio::test]
    async fn unknown_feature_bit_disconnects() {
        let (mut peer, handle, _rx) = make_peer();
        let _outgoing = established(&mut peer);

        // Bit 40 is even and unknown.
        let mut feature_bytes = vec![0u8; 6];
        feature_bytes[0] = 0x01;
        peer.process_command(PeerCommand::MessageReceived {
            connection_id: 1,
            msg: LightningMessage::Init(Init {
                features: Features(feature_bytes),
                tlvs: vec![],
            }),
        })
        .await;

        assert!(peer.connection.is_none());
        assert!(matches!(
            &*handle.connection_state.borrow(),
            ConnectionState::Closed { reason: Some(..) },
        ));
    }
}
