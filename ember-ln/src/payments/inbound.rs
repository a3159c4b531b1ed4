//! The incoming payment handler: invoice creation, HTLC / pay-to-open
//! validation, multi-part aggregation, and preimage release.

use std::{collections::HashMap, sync::Arc, time::Duration};

use bitcoin::secp256k1::{All, PublicKey, Secp256k1};
use common::{amount::Amount, rng::Crng, time::TimestampMs};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{
    db::PaymentsDb, IncomingOrigin, PaymentHash, PaymentPreimage,
    PaymentSecret, ReceivedWith,
};
use crate::{
    channel::ChannelId,
    events::{EventBus, NodeEvent},
    invoice::{
        self, ExtraHop, Invoice, InvoiceDescription, NewInvoice,
    },
    sphinx::FinalPayload,
    wire::{
        ChannelUpdate, PayToOpenRequest, PayToOpenResponse,
        PayToOpenResult, UpdateAddHtlc,
    },
};

/// How long parts of a multi-part payment may trickle in before the whole
/// set is failed back.
pub const MPP_TIMEOUT: Duration = Duration::from_secs(60);

/// Fallbacks for the invoice route hint when we have no channel update
/// from the peer yet.
#[derive(Copy, Clone, Debug)]
pub struct HintDefaults {
    pub fee_base_msat: u32,
    pub fee_proportional_millionths: u32,
    pub cltv_expiry_delta: u16,
}

impl Default for HintDefaults {
    fn default() -> Self {
        Self {
            fee_base_msat: 1_000,
            fee_proportional_millionths: 100,
            cltv_expiry_delta: 144,
        }
    }
}

/// The user's policy for paying channel-opening fees on incoming
/// liquidity.
#[derive(Copy, Clone, Debug)]
pub enum LiquidityPolicy {
    /// Never accept fees: reject pay-to-open.
    Disable,
    /// Accept when the fee is below both an absolute cap and a relative
    /// cap in basis points of the amount.
    Auto {
        max_absolute_fee: Amount,
        max_relative_fee_basis_points: u64,
    },
}

impl LiquidityPolicy {
    pub fn accepts(&self, amount: Amount, fee: Amount) -> bool {
        match self {
            Self::Disable => false,
            Self::Auto {
                max_absolute_fee,
                max_relative_fee_basis_points,
            } => {
                fee <= *max_absolute_fee
                    && fee.msat() * 10_000
                        <= amount.msat() * max_relative_fee_basis_points
            }
        }
    }
}

/// The orchestrator's one-line summary of channel availability, used to
/// pick the right pay-to-open rejection.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ChannelsStatus {
    /// At least one `Normal` channel exists.
    HasNormal,
    /// No `Normal` channel, but one is currently funding or waiting for
    /// `channel_ready`.
    Initializing,
    None,
}

/// Effects the orchestrator must apply after processing an incoming part.
#[derive(Clone, Debug)]
pub enum InboundAction {
    FulfillHtlc {
        channel_id: ChannelId,
        htlc_id: u64,
        preimage: PaymentPreimage,
    },
    FailHtlc {
        channel_id: ChannelId,
        htlc_id: u64,
        reason: RejectionReason,
    },
    PayToOpenResponse(PayToOpenResponse),
}

/// Why an incoming part was refused. The orchestrator maps this onto the
/// right wire failure via the sphinx seam.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RejectionReason {
    UnknownPaymentHash,
    InvoiceExpired,
    InvalidPaymentSecret,
    AmountTooLow,
    ExpiryTooSoon,
    PaymentTimeout,
    ChannelInitializing,
    PolicyRejected,
}

/// One part of an in-flight (possibly multi-part) payment.
#[derive(Clone, Debug)]
enum PendingPart {
    Htlc {
        channel_id: ChannelId,
        htlc_id: u64,
        amount: Amount,
    },
    PayToOpen {
        amount: Amount,
        mining_fee: Amount,
        service_fee: Amount,
        response_chain_hash: [u8; 32],
    },
}

impl PendingPart {
    fn amount(&self) -> Amount {
        match self {
            Self::Htlc { amount, .. } => *amount,
            Self::PayToOpen { amount, .. } => *amount,
        }
    }
}

#[derive(Debug)]
struct PendingPayment {
    parts: Vec<PendingPart>,
    total_amount: Amount,
    started_at: TimestampMs,
}

/// Stateful facade over the payments store for the receiving side.
pub struct InboundPaymentHandler {
    db: Arc<dyn PaymentsDb>,
    events: EventBus,
    pending: Mutex<HashMap<PaymentHash, PendingPayment>>,
}

impl InboundPaymentHandler {
    pub fn new(db: Arc<dyn PaymentsDb>, events: EventBus) -> Self {
        Self {
            db,
            events,
            pending: Mutex::new(HashMap::new()),
        }
    }

    // --- Invoice creation --- //

    /// Create and persist an invoice. The route hint synthesizes a single
    /// virtual hop to us through the trampoline peer, using the *maximum*
    /// fees and cltv delta across all known remote channel updates so the
    /// first payment attempt almost always fits.
    #[allow(clippy::too_many_arguments)]
    pub async fn create_invoice(
        &self,
        secp: &Secp256k1<All>,
        network: bitcoin::Network,
        node_secret: &bitcoin::secp256k1::SecretKey,
        trampoline_node_id: PublicKey,
        hint_scid: u64,
        remote_updates: &[ChannelUpdate],
        defaults: HintDefaults,
        preimage: PaymentPreimage,
        amount: Option<Amount>,
        description: InvoiceDescription,
        expiry: Option<Duration>,
        rng: &mut impl Crng,
    ) -> anyhow::Result<Invoice> {
        let fee_base_msat = remote_updates
            .iter()
            .map(|update| update.fee_base_msat)
            .max()
            .unwrap_or(defaults.fee_base_msat);
        let fee_proportional_millionths = remote_updates
            .iter()
            .map(|update| update.fee_proportional_millionths)
            .max()
            .unwrap_or(defaults.fee_proportional_millionths);
        let cltv_expiry_delta = remote_updates
            .iter()
            .map(|update| update.cltv_expiry_delta)
            .max()
            .unwrap_or(defaults.cltv_expiry_delta);

        let mut payment_secret = [0u8; 32];
        rng.fill_bytes(&mut payment_secret);

        let invoice = invoice::create_invoice(
            secp,
            NewInvoice {
                network,
                preimage,
                payment_secret: PaymentSecret(payment_secret),
                amount,
                description,
                expiry,
                extra_hop: ExtraHop {
                    node_id: trampoline_node_id,
                    short_channel_id: hint_scid,
                    fee_base_msat,
                    fee_proportional_millionths,
                    cltv_expiry_delta,
                },
                node_secret,
            },
        )?;

        self.db
            .add_incoming_payment(
                preimage,
                IncomingOrigin::Invoice(invoice.clone()),
                TimestampMs::now(),
            )
            .await?;
        info!(payment_hash = %invoice.payment_hash(), "invoice created");
        Ok(invoice)
    }

    // --- Incoming parts --- //

    /// Process an incoming HTLC whose onion was peeled to us.
    pub async fn process_htlc(
        &self,
        add: &UpdateAddHtlc,
        payload: &FinalPayload,
        current_height: u32,
        received_at: TimestampMs,
    ) -> Vec<InboundAction> {
        let payment_hash = PaymentHash(add.payment_hash);
        let part = PendingPart::Htlc {
            channel_id: add.channel_id,
            htlc_id: add.id,
            amount: add.amount,
        };

        if add.cltv_expiry
            <= current_height + crate::channel::HTLC_SAFETY_DELTA
        {
            return vec![self
                .reject_part(&part, payment_hash, RejectionReason::ExpiryTooSoon)];
        }
        self.process_part(payment_hash, part, payload, received_at)
            .await
    }

    /// Process a pay-to-open request: the peer wants to open (or splice
    /// into) a channel to settle this part, charging fees.
    pub async fn process_pay_to_open(
        &self,
        request: &PayToOpenRequest,
        payload: &FinalPayload,
        policy: LiquidityPolicy,
        channels: ChannelsStatus,
        received_at: TimestampMs,
    ) -> Vec<InboundAction> {
        let payment_hash = PaymentHash(request.payment_hash);
        let fees = request.mining_fee + request.service_fee;
        let part = PendingPart::PayToOpen {
            amount: request.amount - fees,
            mining_fee: request.mining_fee,
            service_fee: request.service_fee,
            response_chain_hash: request.chain_hash,
        };

        // While a channel is initializing, a concurrent pay-to-open would
        // duplicate liquidity; the sender will retry shortly.
        if channels == ChannelsStatus::Initializing {
            return vec![self.reject_part(
                &part,
                payment_hash,
                RejectionReason::ChannelInitializing,
            )];
        }
        if !policy.accepts(request.amount, fees) {
            warn!(
                %payment_hash,
                "pay-to-open rejected by liquidity policy",
            );
            return vec![self.reject_part(
                &part,
                payment_hash,
                RejectionReason::PolicyRejected,
            )];
        }
        self.process_part(payment_hash, part, payload, received_at)
            .await
    }

    async fn process_part(
        &self,
        payment_hash: PaymentHash,
        part: PendingPart,
        payload: &FinalPayload,
        received_at: TimestampMs,
    ) -> Vec<InboundAction> {
        let payment = match self.db.get_incoming_payment(payment_hash).await
        {
            Ok(Some(payment)) => payment,
            Ok(None) => {
                debug!(%payment_hash, "no invoice for incoming part");
                return vec![self.reject_part(
                    &part,
                    payment_hash,
                    RejectionReason::UnknownPaymentHash,
                )];
            }
            Err(err) => {
                warn!(%payment_hash, "payments db failed: {err}");
                return vec![self.reject_part(
                    &part,
                    payment_hash,
                    RejectionReason::UnknownPaymentHash,
                )];
            }
        };

        let IncomingOrigin::Invoice(invoice) = &payment.origin else {
            // Swap-in payments settle through the channel-open path, not
            // through HTLCs.
            return vec![self.reject_part(
                &part,
                payment_hash,
                RejectionReason::UnknownPaymentHash,
            )];
        };
        if invoice.is_expired() {
            return vec![self.reject_part(
                &part,
                payment_hash,
                RejectionReason::InvoiceExpired,
            )];
        }
        if invoice.payment_secret() != payload.payment_secret {
            return vec![self.reject_part(
                &part,
                payment_hash,
                RejectionReason::InvalidPaymentSecret,
            )];
        }
        if let Some(invoice_amount) = invoice.amount() {
            if payload.total_amount < invoice_amount {
                return vec![self.reject_part(
                    &part,
                    payment_hash,
                    RejectionReason::AmountTooLow,
                )];
            }
        }

        // Aggregate parts with the same payment hash until they cover the
        // announced total.
        let mut pending = self.pending.lock().await;
        let entry =
            pending.entry(payment_hash).or_insert_with(|| PendingPayment {
                parts: vec![],
                total_amount: payload.total_amount,
                started_at: received_at,
            });
        entry.parts.push(part);
        let received: Amount =
            entry.parts.iter().map(PendingPart::amount).sum();
        let fees: Amount = entry
            .parts
            .iter()
            .map(|part| match part {
                PendingPart::PayToOpen {
                    mining_fee,
                    service_fee,
                    ..
                } => *mining_fee + *service_fee,
                PendingPart::Htlc { .. } => Amount::ZERO,
            })
            .sum();
        if received + fees < entry.total_amount {
            debug!(
                %payment_hash,
                %received,
                total = %entry.total_amount,
                "waiting for more parts",
            );
            return vec![];
        }

        // Complete: release the preimage on every part and persist the
        // aggregated receive.
        let completed = pending.remove(&payment_hash).expect("just inserted");
        drop(pending);

        let mut actions = Vec::with_capacity(completed.parts.len());
        let mut received_with = Vec::with_capacity(completed.parts.len());
        for part in completed.parts {
            match part {
                PendingPart::Htlc {
                    channel_id,
                    htlc_id,
                    amount,
                } => {
                    actions.push(InboundAction::FulfillHtlc {
                        channel_id,
                        htlc_id,
                        preimage: payment.preimage,
                    });
                    received_with.push(ReceivedWith::LightningHtlc {
                        amount,
                        channel_id,
                        htlc_id,
                    });
                }
                PendingPart::PayToOpen {
                    amount,
                    mining_fee,
                    service_fee,
                    response_chain_hash,
                } => {
                    actions.push(InboundAction::PayToOpenResponse(
                        PayToOpenResponse {
                            chain_hash: response_chain_hash,
                            payment_hash: payment_hash.0,
                            result: PayToOpenResult::Success {
                                payment_preimage: payment.preimage.0,
                            },
                        },
                    ));
                    received_with.push(ReceivedWith::NewChannel {
                        amount,
                        mining_fee,
                        service_fee,
                        channel_id: None,
                    });
                }
            }
        }

        let amount_received: Amount =
            received_with.iter().map(ReceivedWith::amount).sum();
        if let Err(err) = self
            .db
            .receive_payment(payment_hash, received_with, received_at)
            .await
        {
            warn!(%payment_hash, "failed to persist receive: {err}");
        }
        info!(%payment_hash, amount = %amount_received, "payment received");
        self.events.emit(NodeEvent::PaymentReceived {
            payment_hash,
            amount: amount_received,
        });
        actions
    }

    /// Fail every pending MPP set older than [`MPP_TIMEOUT`].
    pub async fn check_timeouts(
        &self,
        now: TimestampMs,
    ) -> Vec<InboundAction> {
        let mut pending = self.pending.lock().await;
        let mut actions = Vec::new();
        pending.retain(|payment_hash, payment| {
            let age_ms =
                now.as_i64().saturating_sub(payment.started_at.as_i64());
            if age_ms < MPP_TIMEOUT.as_millis() as i64 {
                return true;
            }
            warn!(%payment_hash, "multi-part payment timed out");
            for part in &payment.parts {
                actions.push(fail_part(
                    part,
                    *payment_hash,
                    RejectionReason::PaymentTimeout,
                ));
            }
            false
        });
        actions
    }

    fn reject_part(
        &self,
        part: &PendingPart,
        payment_hash: PaymentHash,
        reason: RejectionReason,
    ) -> InboundAction {
        debug!(%payment_hash, ?reason, "rejecting incoming part");
        fail_part(part, payment_hash, reason)
    }
}

fn fail_part(
    part: &PendingPart,
    payment_hash: PaymentHash,
    reason: RejectionReason,
) -> InboundAction {
    match part {
        PendingPart::Htlc {
            channel_id,
            htlc_id,
            ..
        } => InboundAction::FailHtlc {
            channel_id: *channel_id,
            htlc_id: *htlc_id,
            reason,
        },
        PendingPart::PayToOpen {
            response_chain_hash,
            ..
        } => InboundAction::PayToOpenResponse(PayToOpenResponse {
            chain_hash: *response_chain_hash,
            payment_hash: payment_hash.0,
            result: PayToOpenResult::Failure {
                reason: format!("{reason:?}").into_bytes(),
            },
        }),
    }
}

#[cfg(test)]
mod test {
    use bitcoin::secp256k1::SecretKey;
    use common::rng::FastRng;

    use super::*;
    use crate::payments::db::MemoryPaymentsDb;
    use crate::wire::OnionPacket;

    struct Setup {
        handler: InboundPaymentHandler,
        secp: Secp256k1<All>,
        node_secret: SecretKey,
        trampoline: PublicKey,
        rng: FastRng,
    }

    fn setup() -> Setup {
        let secp = Secp256k1::new();
        let node_secret = SecretKey::from_slice(&[0x61; 32]).unwrap();
        let trampoline_secret =
            SecretKey::from_slice(&[0x62; 32]).unwrap();
        Setup {
            handler: InboundPaymentHandler::new(
                Arc::new(MemoryPaymentsDb::new()),
                EventBus::new(),
            ),
            secp,
            node_secret,
            trampoline: PublicKey::from_secret_key(
                &Secp256k1::new(),
                &trampoline_secret,
            ),
            rng: FastRng::from_u64(1234),
        }
    }

    async fn make_invoice(
        setup: &mut Setup,
        preimage: PaymentPreimage,
        amount_msat: u64,
        updates: &[ChannelUpdate],
    ) -> Invoice {
        setup
            .handler
            .create_invoice(
                &setup.secp,
                bitcoin::Network::Regtest,
                &setup.node_secret,
                setup.trampoline,
                42,
                updates,
                HintDefaults::default(),
                preimage,
                Some(Amount::from_msat(amount_msat)),
                InvoiceDescription::Direct("test".to_owned()),
                None,
                &mut setup.rng,
            )
            .await
            .unwrap()
    }

    fn add(amount_msat: u64, payment_hash: PaymentHash, htlc_id: u64) -> UpdateAddHtlc {
        UpdateAddHtlc {
            channel_id: ChannelId([5; 32]),
            id: htlc_id,
            amount: Amount::from_msat(amount_msat),
            payment_hash: payment_hash.0,
            cltv_expiry: 700_500,
            onion: OnionPacket(vec![]),
        }
    }

    fn payload(
        invoice: &Invoice,
        amount_msat: u64,
        total_msat: u64,
    ) -> FinalPayload {
        FinalPayload {
            amount: Amount::from_msat(amount_msat),
            total_amount: Amount::from_msat(total_msat),
            cltv_expiry: 700_500,
            payment_secret: invoice.payment_secret(),
        }
    }

    #[tokio::test]
    async fn single_part_releases_preimage() {
        let mut setup = setup();
        let preimage = PaymentPreimage([3; 32]);
        let invoice =
            make_invoice(&mut setup, preimage, 150_000, &[]).await;
        let hash = invoice.payment_hash();

        let actions = setup
            .handler
            .process_htlc(
                &add(150_000, hash, 1),
                &payload(&invoice, 150_000, 150_000),
                700_000,
                TimestampMs::from(110u32),
            )
            .await;
        assert!(matches!(
            actions.as_slice(),
            [InboundAction::FulfillHtlc { htlc_id: 1, .. }],
        ));
    }

    #[tokio::test]
    async fn multi_part_aggregates_before_release() {
        let mut setup = setup();
        let preimage = PaymentPreimage([4; 32]);
        let invoice =
            make_invoice(&mut setup, preimage, 100_000, &[]).await;
        let hash = invoice.payment_hash();

        // First part: nothing released.
        let actions = setup
            .handler
            .process_htlc(
                &add(57_000, hash, 1),
                &payload(&invoice, 57_000, 100_000),
                700_000,
                TimestampMs::from(110u32),
            )
            .await;
        assert!(actions.is_empty());

        // Second part completes the set: both HTLCs fulfilled.
        let actions = setup
            .handler
            .process_htlc(
                &add(43_000, hash, 2),
                &payload(&invoice, 43_000, 100_000),
                700_000,
                TimestampMs::from(111u32),
            )
            .await;
        assert_eq!(actions.len(), 2);
        assert!(actions.iter().all(|action| matches!(
            action,
            InboundAction::FulfillHtlc { .. },
        )));
    }

    #[tokio::test]
    async fn wrong_payment_secret_is_rejected() {
        let mut setup = setup();
        let preimage = PaymentPreimage([5; 32]);
        let invoice =
            make_invoice(&mut setup, preimage, 100_000, &[]).await;
        let hash = invoice.payment_hash();

        let mut bad_payload = payload(&invoice, 100_000, 100_000);
        bad_payload.payment_secret = PaymentSecret([0xff; 32]);
        let actions = setup
            .handler
            .process_htlc(
                &add(100_000, hash, 1),
                &bad_payload,
                700_000,
                TimestampMs::from(110u32),
            )
            .await;
        assert!(matches!(
            actions.as_slice(),
            [InboundAction::FailHtlc {
                reason: RejectionReason::InvalidPaymentSecret,
                ..
            }],
        ));
    }

    #[tokio::test]
    async fn pay_to_open_rejected_while_channel_initializing() {
        let mut setup = setup();
        let preimage = PaymentPreimage([6; 32]);
        let invoice =
            make_invoice(&mut setup, preimage, 99_000, &[]).await;

        let request = PayToOpenRequest {
            chain_hash: [6; 32],
            payment_hash: invoice.payment_hash().0,
            amount: Amount::from_msat(100_000),
            funding_sat: 100_000,
            mining_fee: Amount::ZERO,
            service_fee: Amount::from_msat(1_000),
            expire_at: 0,
            final_packet: OnionPacket(vec![]),
        };
        let actions = setup
            .handler
            .process_pay_to_open(
                &request,
                &payload(&invoice, 100_000, 100_000),
                LiquidityPolicy::Auto {
                    max_absolute_fee: Amount::from_sat(5_000),
                    max_relative_fee_basis_points: 3_000,
                },
                ChannelsStatus::Initializing,
                TimestampMs::from(110u32),
            )
            .await;
        match actions.as_slice() {
            [InboundAction::PayToOpenResponse(response)] => {
                assert!(matches!(
                    &response.result,
                    PayToOpenResult::Failure { reason }
                        if reason == b"ChannelInitializing",
                ));
            }
            other => panic!("unexpected actions: {other:?}"),
        }
    }

    #[tokio::test]
    async fn liquidity_policy_caps_fees() {
        let policy = LiquidityPolicy::Auto {
            max_absolute_fee: Amount::from_sat(1_000),
            // 1% relative cap
            max_relative_fee_basis_points: 100,
        };
        assert!(policy.accepts(
            Amount::from_msat(10_000_000),
            Amount::from_msat(100_000),
        ));
        assert!(!policy.accepts(
            Amount::from_msat(10_000_000),
            Amount::from_msat(200_000),
        ));
        assert!(!LiquidityPolicy::Disable
            .accepts(Amount::from_msat(1), Amount::ZERO));
    }

    #[tokio::test]
    async fn stale_parts_time_out() {
        let mut setup = setup();
        let preimage = PaymentPreimage([7; 32]);
        let invoice =
            make_invoice(&mut setup, preimage, 100_000, &[]).await;
        let hash = invoice.payment_hash();

        let actions = setup
            .handler
            .process_htlc(
                &add(57_000, hash, 1),
                &payload(&invoice, 57_000, 100_000),
                700_000,
                TimestampMs::from(0u32),
            )
            .await;
        assert!(actions.is_empty());

        // Well past the MPP window.
        let actions = setup
            .handler
            .check_timeouts(TimestampMs::from(120_000u32))
            .await;
        assert!(matches!(
            actions.as_slice(),
            [InboundAction::FailHtlc {
                reason: RejectionReason::PaymentTimeout,
                ..
            }],
        ));
    }

    #[tokio::test]
    async fn hint_uses_max_fees_across_updates() {
        let mut setup = setup();
        let sig = bitcoin::secp256k1::ecdsa::Signature::from_compact(
            &[1; 64],
        )
        .unwrap();
        let update = |base: u32, prop: u32, cltv: u16| ChannelUpdate {
            signature: sig,
            chain_hash: [6; 32],
            short_channel_id: 1,
            timestamp: 0,
            message_flags: 1,
            channel_flags: 0,
            cltv_expiry_delta: cltv,
            htlc_minimum: Amount::from_msat(1),
            fee_base_msat: base,
            fee_proportional_millionths: prop,
            htlc_maximum: Amount::from_msat(1_000_000_000),
        };
        let invoice = make_invoice(
            &mut setup,
            PaymentPreimage([8; 32]),
            100_000,
            &[update(500, 300, 40), update(2_000, 100, 288)],
        )
        .await;

        // The single hint hop carries the maxima: base 2000, prop 300,
        // cltv 288.
        let hints = invoice.0.route_hints();
        let hop = &hints[0].0[0];
        assert_eq!(hop.fees.base_msat, 2_000);
        assert_eq!(hop.fees.proportional_millionths, 300);
        assert_eq!(hop.cltv_expiry_delta, 288);
    }
}
