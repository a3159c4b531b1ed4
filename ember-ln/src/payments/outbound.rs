//! The outgoing payment handler: splits a send into HTLC attempts,
//! escalates trampoline fees on retryable failures, and finalizes the
//! persistent payment record.

use std::{collections::HashMap, sync::Arc};

use bitcoin::secp256k1::PublicKey;
use common::{amount::Amount, rng::Crng, time::TimestampMs};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{
    db::{OffchainResult, PartResult, PaymentsDb},
    FinalFailure, OutgoingDetails, OutgoingPart, OutgoingPayment,
    OutgoingStatus, PartId, PartStatus, PaymentId, PaymentPreimage,
};
use crate::{
    channel::{
        commitments::HtlcOrigin, AddHtlcFailed, AddHtlcSpec, ChannelId,
    },
    events::{EventBus, NodeEvent},
    sphinx::{FinalPayload, PaymentSphinx},
};

/// One step of the trampoline fee escalation ladder.
#[derive(Copy, Clone, Debug)]
pub struct TrampolineFees {
    pub fee_base: Amount,
    pub fee_proportional_millionths: u64,
    pub cltv_expiry_delta: u32,
}

impl TrampolineFees {
    pub fn fee_for(&self, amount: Amount) -> Amount {
        let proportional = amount.msat()
            * self.fee_proportional_millionths
            / 1_000_000;
        self.fee_base + Amount::from_msat(proportional)
    }
}

/// Defaults mirror what the trampoline peer advertises; each retry climbs
/// one rung.
pub const DEFAULT_TRAMPOLINE_FEES: [TrampolineFees; 4] = [
    TrampolineFees {
        fee_base: Amount::ZERO,
        fee_proportional_millionths: 0,
        cltv_expiry_delta: 576,
    },
    TrampolineFees {
        fee_base: Amount::from_sat(1),
        fee_proportional_millionths: 100,
        cltv_expiry_delta: 576,
    },
    TrampolineFees {
        fee_base: Amount::from_sat(3),
        fee_proportional_millionths: 100,
        cltv_expiry_delta: 576,
    },
    TrampolineFees {
        fee_base: Amount::from_sat(5),
        fee_proportional_millionths: 1_000,
        cltv_expiry_delta: 576,
    },
];

/// A user request to pay an invoice (or swap out).
#[derive(Clone, Debug)]
pub struct SendPayment {
    pub payment_id: PaymentId,
    pub amount: Amount,
    pub recipient: PublicKey,
    pub details: OutgoingDetails,
    pub trampoline_fees_override: Option<Vec<TrampolineFees>>,
}

/// A channel able to carry an outgoing HTLC right now.
#[derive(Copy, Clone, Debug)]
pub struct ChannelBalance {
    pub channel_id: ChannelId,
    pub available: Amount,
}

/// Effects the orchestrator must apply.
#[derive(Clone, Debug)]
pub enum OutboundAction {
    AddHtlc {
        channel_id: ChannelId,
        spec: AddHtlcSpec,
    },
}

#[derive(Debug)]
struct PendingSend {
    request: SendPayment,
    attempt: usize,
    channels: Vec<ChannelBalance>,
    current_height: u32,
}

/// Stateful facade over the payments store for the sending side.
pub struct OutboundPaymentHandler {
    db: Arc<dyn PaymentsDb>,
    sphinx: Arc<dyn PaymentSphinx>,
    events: EventBus,
    pending: Mutex<HashMap<PaymentId, PendingSend>>,
}

impl OutboundPaymentHandler {
    pub fn new(
        db: Arc<dyn PaymentsDb>,
        sphinx: Arc<dyn PaymentSphinx>,
        events: EventBus,
    ) -> Self {
        Self {
            db,
            sphinx,
            events,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Start a payment: insert the parent row and issue the first
    /// attempt.
    pub async fn send_payment(
        &self,
        request: SendPayment,
        channels: Vec<ChannelBalance>,
        current_height: u32,
        rng: &mut impl Crng,
    ) -> anyhow::Result<Vec<OutboundAction>> {
        if let OutgoingDetails::Normal { invoice } = &request.details {
            if invoice.is_expired() {
                self.fail_payment_before_insert(
                    &request,
                    FinalFailure::InvalidPaymentRequest,
                )
                .await?;
                return Ok(vec![]);
            }
        }

        let payment = OutgoingPayment {
            id: request.payment_id,
            recipient_amount: request.amount,
            recipient: request.recipient,
            details: request.details.clone(),
            parts: vec![],
            status: OutgoingStatus::Pending,
            created_at: TimestampMs::now(),
        };
        self.db.add_outgoing_payment(payment).await?;

        let mut pending = self.pending.lock().await;
        pending.insert(
            request.payment_id,
            PendingSend {
                request: request.clone(),
                attempt: 0,
                channels: channels.clone(),
                current_height,
            },
        );
        drop(pending);

        self.try_attempt(request.payment_id, rng).await
    }

    /// Issue the next attempt for a pending payment, or finalize it as
    /// failed when the ladder is exhausted.
    async fn try_attempt(
        &self,
        payment_id: PaymentId,
        rng: &mut impl Crng,
    ) -> anyhow::Result<Vec<OutboundAction>> {
        let mut pending = self.pending.lock().await;
        let Some(send) = pending.get_mut(&payment_id) else {
            return Ok(vec![]);
        };

        let fees_ladder: &[TrampolineFees] = send
            .request
            .trampoline_fees_override
            .as_deref()
            .unwrap_or(&DEFAULT_TRAMPOLINE_FEES);
        let Some(fees) = fees_ladder.get(send.attempt) else {
            let request = pending
                .remove(&payment_id)
                .expect("present above")
                .request;
            drop(pending);
            self.finalize_failed(
                &request,
                FinalFailure::NoRouteToRecipient,
            )
            .await?;
            return Ok(vec![]);
        };

        let total = send.request.amount + fees.fee_for(send.request.amount);
        let Some(channel) = send
            .channels
            .iter()
            .filter(|channel| channel.available >= total)
            .max_by_key(|channel| channel.available.msat())
            .copied()
        else {
            let request = pending
                .remove(&payment_id)
                .expect("present above")
                .request;
            drop(pending);
            self.finalize_failed(
                &request,
                FinalFailure::InsufficientBalance,
            )
            .await?;
            return Ok(vec![]);
        };

        let part_id = PartId::generate(rng);
        let cltv_expiry = send.current_height
            + fees.cltv_expiry_delta
            + min_final_cltv(&send.request.details);
        let (payment_hash, payment_secret) = match &send.request.details {
            OutgoingDetails::Normal { invoice } =>
                (invoice.payment_hash(), invoice.payment_secret()),
            OutgoingDetails::SwapOut { .. } => {
                // Swap-out settlement is hash-locked on a preimage chosen
                // by the peer and carried in the swap agreement.
                (
                    super::PaymentHash([0u8; 32]),
                    super::PaymentSecret([0u8; 32]),
                )
            }
        };

        let payload = FinalPayload {
            amount: total,
            total_amount: total,
            cltv_expiry,
            payment_secret,
        };
        let onion = self
            .sphinx
            .build_payment_onion(&send.request.recipient, &payload);

        let part = OutgoingPart {
            id: part_id,
            amount: total,
            route: vec![send.request.recipient],
            status: PartStatus::Pending,
            created_at: TimestampMs::now(),
        };
        send.attempt += 1;
        drop(pending);

        self.db
            .add_outgoing_lightning_parts(payment_id, vec![part])
            .await?;

        debug!(
            %payment_id,
            %part_id,
            amount = %total,
            "issuing payment attempt",
        );
        Ok(vec![OutboundAction::AddHtlc {
            channel_id: channel.channel_id,
            spec: AddHtlcSpec {
                amount: total,
                payment_hash: payment_hash.0,
                cltv_expiry,
                onion,
                payment_id,
                part_id,
            },
        }])
    }

    /// The channel refused the add locally (reserve, limits, offline).
    pub async fn on_add_failed(
        &self,
        failed: &AddHtlcFailed,
        rng: &mut impl Crng,
    ) -> anyhow::Result<Vec<OutboundAction>> {
        debug!(
            payment_id = %failed.payment_id,
            part_id = %failed.part_id,
            "attempt rejected locally: {}",
            failed.reason,
        );
        self.db
            .complete_outgoing_lightning_part(
                failed.part_id,
                PartResult::Failed {
                    failure_code: None,
                    failure_message: failed.reason.to_string(),
                },
                TimestampMs::now(),
            )
            .await?;

        // Drop the channel that refused and retry on another (or fail).
        let mut pending = self.pending.lock().await;
        if let Some(send) = pending.get_mut(&failed.payment_id) {
            send.channels
                .retain(|channel| channel.channel_id != failed.channel_id);
        }
        drop(pending);
        self.try_attempt(failed.payment_id, rng).await
    }

    /// The peer failed the HTLC: decode the failure onion, retry on
    /// temporary failures with escalated fees, finalize on permanent
    /// ones.
    pub async fn on_add_settled_fail(
        &self,
        origin: HtlcOrigin,
        reason: &[u8],
        rng: &mut impl Crng,
    ) -> anyhow::Result<Vec<OutboundAction>> {
        let decoded = self.sphinx.decode_failure(reason).ok();
        let (failure_code, failure_message) = match &decoded {
            Some(failure) => (Some(failure.code), failure.message.clone()),
            None => (None, "undecodable failure".to_owned()),
        };
        self.db
            .complete_outgoing_lightning_part(
                origin.part_id,
                PartResult::Failed {
                    failure_code,
                    failure_message,
                },
                TimestampMs::now(),
            )
            .await?;

        let permanent = decoded
            .as_ref()
            .map(|failure| failure.is_permanent())
            .unwrap_or(false);
        if permanent {
            let request = {
                let mut pending = self.pending.lock().await;
                pending.remove(&origin.payment_id).map(|send| send.request)
            };
            if let Some(request) = request {
                self.finalize_failed(
                    &request,
                    FinalFailure::RecipientUnreachable,
                )
                .await?;
            }
            return Ok(vec![]);
        }
        self.try_attempt(origin.payment_id, rng).await
    }

    /// The peer fulfilled the HTLC.
    pub async fn on_add_settled_fulfill(
        &self,
        origin: HtlcOrigin,
        preimage: PaymentPreimage,
    ) -> anyhow::Result<()> {
        self.db
            .complete_outgoing_lightning_part(
                origin.part_id,
                PartResult::Succeeded { preimage },
                TimestampMs::now(),
            )
            .await?;

        let Some(payment) = self
            .db
            .get_lightning_outgoing_payment(origin.payment_id)
            .await?
        else {
            warn!(
                payment_id = %origin.payment_id,
                "fulfilled part for unknown payment",
            );
            return Ok(());
        };

        let all_settled = payment.parts.iter().all(|part| {
            !matches!(part.status, PartStatus::Pending)
        });
        let any_pending_retry = self
            .pending
            .lock()
            .await
            .contains_key(&origin.payment_id)
            && !all_settled;
        if any_pending_retry {
            self.events.emit(NodeEvent::PaymentProgress {
                payment_id: origin.payment_id,
                fees_paid: payment.fees(),
            });
            return Ok(());
        }

        self.pending.lock().await.remove(&origin.payment_id);
        self.db
            .complete_outgoing_payment_offchain(
                origin.payment_id,
                OffchainResult::Succeeded { preimage },
                TimestampMs::now(),
            )
            .await?;
        let payment = self
            .db
            .get_lightning_outgoing_payment(origin.payment_id)
            .await?
            .expect("completed just above");
        info!(
            payment_id = %origin.payment_id,
            amount = %payment.amount(),
            fees = %payment.fees(),
            "payment sent",
        );
        self.events.emit(NodeEvent::PaymentSent {
            payment_id: origin.payment_id,
            preimage,
            fees_paid: payment.fees(),
        });
        Ok(())
    }

    async fn finalize_failed(
        &self,
        request: &SendPayment,
        reason: FinalFailure,
    ) -> anyhow::Result<()> {
        self.db
            .complete_outgoing_payment_offchain(
                request.payment_id,
                OffchainResult::Failed { reason },
                TimestampMs::now(),
            )
            .await?;
        let part_failures = self
            .db
            .get_lightning_outgoing_payment(request.payment_id)
            .await?
            .map(|payment| {
                payment
                    .parts
                    .iter()
                    .filter_map(|part| match &part.status {
                        PartStatus::Failed {
                            failure_message, ..
                        } => Some(failure_message.clone()),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default();
        warn!(
            payment_id = %request.payment_id,
            %reason,
            "payment not sent",
        );
        self.events.emit(NodeEvent::PaymentNotSent {
            payment_id: request.payment_id,
            reason,
            part_failures,
        });
        Ok(())
    }

    /// An invalid request that never got a parent row still surfaces a
    /// user-visible failure event.
    async fn fail_payment_before_insert(
        &self,
        request: &SendPayment,
        reason: FinalFailure,
    ) -> anyhow::Result<()> {
        let payment = OutgoingPayment {
            id: request.payment_id,
            recipient_amount: request.amount,
            recipient: request.recipient,
            details: request.details.clone(),
            parts: vec![],
            status: OutgoingStatus::Failed {
                reason,
                completed_at: TimestampMs::now(),
            },
            created_at: TimestampMs::now(),
        };
        self.db.add_outgoing_payment(payment).await?;
        self.events.emit(NodeEvent::PaymentNotSent {
            payment_id: request.payment_id,
            reason,
            part_failures: vec![],
        });
        Ok(())
    }

    /// A payment that was mid-flight when the wallet restarted cannot be
    /// safely retried; the orchestrator calls this for every payment it
    /// finds still `Pending` in storage at startup.
    pub async fn fail_restarted_payment(
        &self,
        payment_id: PaymentId,
    ) -> anyhow::Result<()> {
        self.db
            .complete_outgoing_payment_offchain(
                payment_id,
                OffchainResult::Failed {
                    reason: FinalFailure::WalletRestartedDuringPayment,
                },
                TimestampMs::now(),
            )
            .await?;
        self.events.emit(NodeEvent::PaymentNotSent {
            payment_id,
            reason: FinalFailure::WalletRestartedDuringPayment,
            part_failures: vec![],
        });
        Ok(())
    }
}

fn min_final_cltv(details: &OutgoingDetails) -> u32 {
    match details {
        OutgoingDetails::Normal { invoice } =>
            invoice.min_final_cltv_expiry_delta() as u32,
        OutgoingDetails::SwapOut { .. } =>
            crate::invoice::MIN_FINAL_CLTV_EXPIRY_DELTA as u32,
    }
}

#[cfg(test)]
mod test {
    use bitcoin::secp256k1::{Secp256k1, SecretKey};
    use common::rng::FastRng;

    use super::*;
    use crate::payments::db::MemoryPaymentsDb;
    use crate::payments::PaymentSecret;
    use crate::sphinx::fake::FakePaymentSphinx;

    struct Setup {
        handler: OutboundPaymentHandler,
        db: Arc<MemoryPaymentsDb>,
        rng: FastRng,
        recipient: PublicKey,
    }

    fn setup() -> Setup {
        let db = Arc::new(MemoryPaymentsDb::new());
        let secp = Secp256k1::new();
        let recipient = PublicKey::from_secret_key(
            &secp,
            &SecretKey::from_slice(&[0x71; 32]).unwrap(),
        );
        Setup {
            handler: OutboundPaymentHandler::new(
                db.clone(),
                Arc::new(FakePaymentSphinx),
                EventBus::new(),
            ),
            db,
            rng: FastRng::from_u64(777),
            recipient,
        }
    }

    fn invoice(
        preimage: PaymentPreimage,
        amount_msat: u64,
    ) -> crate::invoice::Invoice {
        let secp = Secp256k1::new();
        let node_secret = SecretKey::from_slice(&[0x72; 32]).unwrap();
        crate::invoice::create_invoice(
            &secp,
            crate::invoice::NewInvoice {
                network: bitcoin::Network::Regtest,
                preimage,
                payment_secret: PaymentSecret([9; 32]),
                amount: Some(Amount::from_msat(amount_msat)),
                description: crate::invoice::InvoiceDescription::Direct(
                    "out".to_owned(),
                ),
                expiry: None,
                extra_hop: crate::invoice::ExtraHop {
                    node_id: PublicKey::from_secret_key(
                        &secp,
                        &SecretKey::from_slice(&[0x73; 32]).unwrap(),
                    ),
                    short_channel_id: 7,
                    fee_base_msat: 0,
                    fee_proportional_millionths: 0,
                    cltv_expiry_delta: 144,
                },
                node_secret: &node_secret,
            },
        )
        .unwrap()
    }

    fn request(
        setup: &Setup,
        preimage: PaymentPreimage,
        amount_msat: u64,
    ) -> SendPayment {
        SendPayment {
            payment_id: PaymentId([0x10; 16]),
            amount: Amount::from_msat(amount_msat),
            recipient: setup.recipient,
            details: OutgoingDetails::Normal {
                invoice: invoice(preimage, amount_msat),
            },
            trampoline_fees_override: None,
        }
    }

    fn channel(byte: u8, available_msat: u64) -> ChannelBalance {
        ChannelBalance {
            channel_id: ChannelId([byte; 32]),
            available: Amount::from_msat(available_msat),
        }
    }

    #[tokio::test]
    async fn send_issues_first_attempt() {
        let mut setup = setup();
        let preimage = PaymentPreimage([0x20; 32]);
        let actions = setup
            .handler
            .send_payment(
                request(&setup, preimage, 100_000),
                vec![channel(1, 50_000_000)],
                700_000,
                &mut setup.rng,
            )
            .await
            .unwrap();

        match actions.as_slice() {
            [OutboundAction::AddHtlc { channel_id, spec }] => {
                assert_eq!(*channel_id, ChannelId([1; 32]));
                // First rung of the fee ladder is zero-fee.
                assert_eq!(spec.amount, Amount::from_msat(100_000));
                assert_eq!(
                    spec.payment_hash,
                    preimage.payment_hash().0,
                );
            }
            other => panic!("unexpected actions: {other:?}"),
        }

        let payment = setup
            .db
            .get_lightning_outgoing_payment(PaymentId([0x10; 16]))
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(payment.status, OutgoingStatus::Pending));
        assert_eq!(payment.parts.len(), 1);
    }

    #[tokio::test]
    async fn insufficient_balance_fails_without_attempt() {
        let mut setup = setup();
        let preimage = PaymentPreimage([0x21; 32]);
        let actions = setup
            .handler
            .send_payment(
                request(&setup, preimage, 100_000),
                vec![channel(1, 10_000)],
                700_000,
                &mut setup.rng,
            )
            .await
            .unwrap();
        assert!(actions.is_empty());

        let payment = setup
            .db
            .get_lightning_outgoing_payment(PaymentId([0x10; 16]))
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            payment.status,
            OutgoingStatus::Failed {
                reason: FinalFailure::InsufficientBalance,
                ..
            },
        ));
    }

    #[tokio::test]
    async fn temporary_failure_retries_with_higher_fees() {
        let mut setup = setup();
        let preimage = PaymentPreimage([0x22; 32]);
        let actions = setup
            .handler
            .send_payment(
                request(&setup, preimage, 100_000),
                vec![channel(1, 50_000_000)],
                700_000,
                &mut setup.rng,
            )
            .await
            .unwrap();
        let first_spec = match actions.as_slice() {
            [OutboundAction::AddHtlc { spec, .. }] => spec.clone(),
            other => panic!("unexpected actions: {other:?}"),
        };

        // Temporary (non-PERM) failure: retry climbs the fee ladder.
        let failure = crate::sphinx::DecodedFailure {
            code: 0x1007, // TEMPORARY_CHANNEL_FAILURE
            message: "temporary channel failure".to_owned(),
        };
        let reason = serde_json::to_vec(&failure).unwrap();
        let actions = setup
            .handler
            .on_add_settled_fail(
                HtlcOrigin {
                    payment_id: first_spec.payment_id,
                    part_id: first_spec.part_id,
                },
                &reason,
                &mut setup.rng,
            )
            .await
            .unwrap();
        match actions.as_slice() {
            [OutboundAction::AddHtlc { spec, .. }] => {
                // Second rung: 1 sat base + 100 ppm of 100k msat.
                assert_eq!(spec.amount, Amount::from_msat(101_010));
                assert_ne!(spec.part_id, first_spec.part_id);
            }
            other => panic!("unexpected actions: {other:?}"),
        }
    }

    #[tokio::test]
    async fn local_rejection_retries_on_another_channel() {
        let mut setup = setup();
        let preimage = PaymentPreimage([0x26; 32]);
        let actions = setup
            .handler
            .send_payment(
                request(&setup, preimage, 100_000),
                vec![channel(1, 60_000_000), channel(2, 50_000_000)],
                700_000,
                &mut setup.rng,
            )
            .await
            .unwrap();
        // The biggest channel is chosen first.
        let (first_channel, spec) = match actions.as_slice() {
            [OutboundAction::AddHtlc { channel_id, spec }] =>
                (*channel_id, spec.clone()),
            other => panic!("unexpected actions: {other:?}"),
        };
        assert_eq!(first_channel, ChannelId([1; 32]));

        // The channel refuses locally (e.g. reserve); the retry must go
        // to the other channel with a fresh part.
        let failed = AddHtlcFailed {
            channel_id: first_channel,
            payment_id: spec.payment_id,
            part_id: spec.part_id,
            reason: crate::channel::ChannelError::InsufficientFunds {
                missing: Amount::from_msat(1),
            },
        };
        let actions = setup
            .handler
            .on_add_failed(&failed, &mut setup.rng)
            .await
            .unwrap();
        match actions.as_slice() {
            [OutboundAction::AddHtlc { channel_id, spec: retry }] => {
                assert_eq!(*channel_id, ChannelId([2; 32]));
                assert_ne!(retry.part_id, spec.part_id);
            }
            other => panic!("unexpected actions: {other:?}"),
        }
    }

    #[tokio::test]
    async fn permanent_failure_finalizes() {
        let mut setup = setup();
        let preimage = PaymentPreimage([0x23; 32]);
        let actions = setup
            .handler
            .send_payment(
                request(&setup, preimage, 100_000),
                vec![channel(1, 50_000_000)],
                700_000,
                &mut setup.rng,
            )
            .await
            .unwrap();
        let spec = match actions.as_slice() {
            [OutboundAction::AddHtlc { spec, .. }] => spec.clone(),
            other => panic!("unexpected actions: {other:?}"),
        };

        let failure = crate::sphinx::DecodedFailure {
            code: 0x400f, // PERM | incorrect_or_unknown_payment_details
            message: "incorrect payment details".to_owned(),
        };
        let reason = serde_json::to_vec(&failure).unwrap();
        let actions = setup
            .handler
            .on_add_settled_fail(
                HtlcOrigin {
                    payment_id: spec.payment_id,
                    part_id: spec.part_id,
                },
                &reason,
                &mut setup.rng,
            )
            .await
            .unwrap();
        assert!(actions.is_empty());

        let payment = setup
            .db
            .get_lightning_outgoing_payment(PaymentId([0x10; 16]))
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            payment.status,
            OutgoingStatus::Failed {
                reason: FinalFailure::RecipientUnreachable,
                ..
            },
        ));
    }

    #[tokio::test]
    async fn fulfill_completes_payment_with_fee_accounting() {
        let mut setup = setup();
        let preimage = PaymentPreimage([0x24; 32]);
        let actions = setup
            .handler
            .send_payment(
                request(&setup, preimage, 100_000),
                vec![channel(1, 50_000_000)],
                700_000,
                &mut setup.rng,
            )
            .await
            .unwrap();
        let spec = match actions.as_slice() {
            [OutboundAction::AddHtlc { spec, .. }] => spec.clone(),
            other => panic!("unexpected actions: {other:?}"),
        };

        setup
            .handler
            .on_add_settled_fulfill(
                HtlcOrigin {
                    payment_id: spec.payment_id,
                    part_id: spec.part_id,
                },
                preimage,
            )
            .await
            .unwrap();

        let payment = setup
            .db
            .get_lightning_outgoing_payment(PaymentId([0x10; 16]))
            .await
            .unwrap()
            .unwrap();
        match payment.status {
            OutgoingStatus::Succeeded {
                preimage: settled, ..
            } => assert_eq!(settled, preimage),
            other => panic!("unexpected status: {other:?}"),
        }
        assert_eq!(payment.amount(), Amount::from_msat(100_000));
        assert_eq!(payment.fees(), Amount::ZERO);
    }

    #[tokio::test]
    async fn expired_invoice_is_rejected_up_front() {
        let mut setup = setup();
        let preimage = PaymentPreimage([0x25; 32]);
        let secp = Secp256k1::new();
        let node_secret = SecretKey::from_slice(&[0x74; 32]).unwrap();
        let expired = crate::invoice::create_invoice(
            &secp,
            crate::invoice::NewInvoice {
                network: bitcoin::Network::Regtest,
                preimage,
                payment_secret: PaymentSecret([9; 32]),
                amount: Some(Amount::from_msat(100_000)),
                description: crate::invoice::InvoiceDescription::Direct(
                    "old".to_owned(),
                ),
                expiry: Some(std::time::Duration::from_secs(0)),
                extra_hop: crate::invoice::ExtraHop {
                    node_id: setup.recipient,
                    short_channel_id: 7,
                    fee_base_msat: 0,
                    fee_proportional_millionths: 0,
                    cltv_expiry_delta: 144,
                },
                node_secret: &node_secret,
            },
        )
        .unwrap();

        let request = SendPayment {
            payment_id: PaymentId([0x11; 16]),
            amount: Amount::from_msat(100_000),
            recipient: setup.recipient,
            details: OutgoingDetails::Normal { invoice: expired },
            trampoline_fees_override: None,
        };
        let actions = setup
            .handler
            .send_payment(
                request,
                vec![channel(1, 50_000_000)],
                700_000,
                &mut setup.rng,
            )
            .await
            .unwrap();
        assert!(actions.is_empty());

        let payment = setup
            .db
            .get_lightning_outgoing_payment(PaymentId([0x11; 16]))
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            payment.status,
            OutgoingStatus::Failed {
                reason: FinalFailure::InvalidPaymentRequest,
                ..
            },
        ));
    }
}
