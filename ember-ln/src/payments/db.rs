//! The payments / channels storage contract, and the in-memory
//! implementation backing tests and ephemeral nodes.
//!
//! The production database engine lives outside this crate; it implements
//! [`PaymentsDb`] with the exact semantics encoded here:
//!
//! - Incoming payment rows refuse duplicate payment hashes.
//! - `receive_payment` is additive: parts append, the timestamp updates.
//! - Parent payment ids and part ids are never reused.
//! - Completing a payment off-chain as succeeded retains only the
//!   succeeded parts.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use bitcoin::Txid;
use common::time::TimestampMs;
use thiserror::Error;

use super::{
    FinalFailure, IncomingOrigin, IncomingPayment, OnChainPayment,
    OutgoingPart, OutgoingPayment, OutgoingStatus, PartId, PartStatus,
    PaymentHash, PaymentId, PaymentPreimage, Received, ReceivedWith,
};
use crate::channel::{ChannelId, HtlcInfo, PersistedChannel};

/// Storage-contract violations. The storage engine is assumed reliable;
/// these are caller bugs, not transient failures.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum PaymentsDbError {
    #[error("an incoming payment already exists for hash {0}")]
    DuplicatePaymentHash(PaymentHash),

    #[error("outgoing payment id {0} already used")]
    DuplicatePaymentId(PaymentId),

    #[error("outgoing part id {0} already used")]
    DuplicatePartId(PartId),

    #[error("no incoming payment for hash {0}")]
    UnknownPaymentHash(PaymentHash),

    #[error("no outgoing payment with id {0}")]
    UnknownPayment(PaymentId),

    #[error("no outgoing part with id {0}")]
    UnknownPart(PartId),
}

/// How one HTLC attempt ended.
#[derive(Clone, Debug)]
pub enum PartResult {
    Succeeded { preimage: PaymentPreimage },
    Failed {
        failure_code: Option<u16>,
        failure_message: String,
    },
}

/// How a whole outgoing payment ended off-chain.
#[derive(Clone, Debug)]
pub enum OffchainResult {
    Succeeded { preimage: PaymentPreimage },
    Failed { reason: FinalFailure },
}

#[async_trait]
pub trait PaymentsDb: Send + Sync {
    // --- Incoming --- //

    /// Fails on duplicate payment hash.
    async fn add_incoming_payment(
        &self,
        preimage: PaymentPreimage,
        origin: IncomingOrigin,
        created_at: TimestampMs,
    ) -> Result<(), PaymentsDbError>;

    async fn get_incoming_payment(
        &self,
        payment_hash: PaymentHash,
    ) -> Result<Option<IncomingPayment>, PaymentsDbError>;

    /// Appends parts and refreshes the received timestamp.
    async fn receive_payment(
        &self,
        payment_hash: PaymentHash,
        parts: Vec<ReceivedWith>,
        received_at: TimestampMs,
    ) -> Result<(), PaymentsDbError>;

    // --- Outgoing --- //

    /// Fails if the parent id or any part id is reused.
    async fn add_outgoing_payment(
        &self,
        payment: OutgoingPayment,
    ) -> Result<(), PaymentsDbError>;

    /// Fails on unknown parent or reused part id.
    async fn add_outgoing_lightning_parts(
        &self,
        parent_id: PaymentId,
        parts: Vec<OutgoingPart>,
    ) -> Result<(), PaymentsDbError>;

    /// Fails on unknown part.
    async fn complete_outgoing_lightning_part(
        &self,
        part_id: PartId,
        result: PartResult,
        completed_at: TimestampMs,
    ) -> Result<(), PaymentsDbError>;

    /// Fails on unknown parent. A success drops previously-failed parts
    /// from the payment's view.
    async fn complete_outgoing_payment_offchain(
        &self,
        parent_id: PaymentId,
        result: OffchainResult,
        completed_at: TimestampMs,
    ) -> Result<(), PaymentsDbError>;

    async fn get_lightning_outgoing_payment(
        &self,
        parent_id: PaymentId,
    ) -> Result<Option<OutgoingPayment>, PaymentsDbError>;

    async fn get_lightning_outgoing_payment_from_part_id(
        &self,
        part_id: PartId,
    ) -> Result<Option<OutgoingPayment>, PaymentsDbError>;

    async fn list_lightning_outgoing_payments(
        &self,
        payment_hash: PaymentHash,
    ) -> Result<Vec<OutgoingPayment>, PaymentsDbError>;

    // --- On-chain rows --- //

    async fn add_on_chain_payment(
        &self,
        payment: OnChainPayment,
    ) -> Result<(), PaymentsDbError>;

    /// Record that an on-chain funding/close tx locked in.
    async fn set_locked(
        &self,
        txid: Txid,
        at: TimestampMs,
    ) -> Result<(), PaymentsDbError>;

    // --- HTLC info for penalty construction --- //

    async fn add_htlc_infos(
        &self,
        htlc_infos: Vec<HtlcInfo>,
    ) -> Result<(), PaymentsDbError>;

    async fn list_htlc_infos(
        &self,
        channel_id: ChannelId,
        commitment_number: u64,
    ) -> Result<Vec<HtlcInfo>, PaymentsDbError>;

    // --- Channels --- //

    async fn add_or_update_channel(
        &self,
        state: PersistedChannel,
    ) -> Result<(), PaymentsDbError>;

    async fn remove_channel(
        &self,
        channel_id: ChannelId,
    ) -> Result<(), PaymentsDbError>;

    async fn list_local_channels(
        &self,
    ) -> Result<Vec<PersistedChannel>, PaymentsDbError>;
}

// --- In-memory implementation --- //

/// Methods on [`Inner`] take `&mut self`, which allows reentrancy without
/// deadlocking; the [`Mutex`] is held only for the duration of one call.
#[derive(Default)]
struct Inner {
    incoming: HashMap<PaymentHash, IncomingPayment>,
    outgoing: HashMap<PaymentId, OutgoingPayment>,
    part_index: HashMap<PartId, PaymentId>,
    on_chain: Vec<OnChainPayment>,
    htlc_infos: Vec<HtlcInfo>,
    channels: HashMap<ChannelId, PersistedChannel>,
}

/// An in-memory [`PaymentsDb`].
#[derive(Default)]
pub struct MemoryPaymentsDb {
    inner: Mutex<Inner>,
}

impl MemoryPaymentsDb {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PaymentsDb for MemoryPaymentsDb {
    async fn add_incoming_payment(
        &self,
        preimage: PaymentPreimage,
        origin: IncomingOrigin,
        created_at: TimestampMs,
    ) -> Result<(), PaymentsDbError> {
        let mut inner = self.inner.lock().unwrap();
        let payment_hash = preimage.payment_hash();
        if inner.incoming.contains_key(&payment_hash) {
            return Err(PaymentsDbError::DuplicatePaymentHash(payment_hash));
        }
        inner.incoming.insert(
            payment_hash,
            IncomingPayment {
                preimage,
                origin,
                created_at,
                received: None,
            },
        );
        Ok(())
    }

    async fn get_incoming_payment(
        &self,
        payment_hash: PaymentHash,
    ) -> Result<Option<IncomingPayment>, PaymentsDbError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.incoming.get(&payment_hash).cloned())
    }

    async fn receive_payment(
        &self,
        payment_hash: PaymentHash,
        parts: Vec<ReceivedWith>,
        received_at: TimestampMs,
    ) -> Result<(), PaymentsDbError> {
        let mut inner = self.inner.lock().unwrap();
        let payment = inner
            .incoming
            .get_mut(&payment_hash)
            .ok_or(PaymentsDbError::UnknownPaymentHash(payment_hash))?;
        match &mut payment.received {
            Some(received) => {
                received.parts.extend(parts);
                received.received_at = received_at;
            }
            None =>
                payment.received = Some(Received { parts, received_at }),
        }
        Ok(())
    }

    async fn add_outgoing_payment(
        &self,
        payment: OutgoingPayment,
    ) -> Result<(), PaymentsDbError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.outgoing.contains_key(&payment.id) {
            return Err(PaymentsDbError::DuplicatePaymentId(payment.id));
        }
        for part in &payment.parts {
            if inner.part_index.contains_key(&part.id) {
                return Err(PaymentsDbError::DuplicatePartId(part.id));
            }
        }
        for part in &payment.parts {
            inner.part_index.insert(part.id, payment.id);
        }
        inner.outgoing.insert(payment.id, payment);
        Ok(())
    }

    async fn add_outgoing_lightning_parts(
        &self,
        parent_id: PaymentId,
        parts: Vec<OutgoingPart>,
    ) -> Result<(), PaymentsDbError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.outgoing.contains_key(&parent_id) {
            return Err(PaymentsDbError::UnknownPayment(parent_id));
        }
        for part in &parts {
            if inner.part_index.contains_key(&part.id) {
                return Err(PaymentsDbError::DuplicatePartId(part.id));
            }
        }
        for part in &parts {
            inner.part_index.insert(part.id, parent_id);
        }
        inner
            .outgoing
            .get_mut(&parent_id)
            .expect("checked above")
            .parts
            .extend(parts);
        Ok(())
    }

    async fn complete_outgoing_lightning_part(
        &self,
        part_id: PartId,
        result: PartResult,
        completed_at: TimestampMs,
    ) -> Result<(), PaymentsDbError> {
        let mut inner = self.inner.lock().unwrap();
        let parent_id = *inner
            .part_index
            .get(&part_id)
            .ok_or(PaymentsDbError::UnknownPart(part_id))?;
        let payment = inner
            .outgoing
            .get_mut(&parent_id)
            .ok_or(PaymentsDbError::UnknownPart(part_id))?;
        let part = payment
            .parts
            .iter_mut()
            .find(|part| part.id == part_id)
            .ok_or(PaymentsDbError::UnknownPart(part_id))?;
        part.status = match result {
            PartResult::Succeeded { preimage } => PartStatus::Succeeded {
                preimage,
                completed_at,
            },
            PartResult::Failed {
                failure_code,
                failure_message,
            } => PartStatus::Failed {
                failure_code,
                failure_message,
                completed_at,
            },
        };
        Ok(())
    }

    async fn complete_outgoing_payment_offchain(
        &self,
        parent_id: PaymentId,
        result: OffchainResult,
        completed_at: TimestampMs,
    ) -> Result<(), PaymentsDbError> {
        let mut inner = self.inner.lock().unwrap();
        let payment = inner
            .outgoing
            .get_mut(&parent_id)
            .ok_or(PaymentsDbError::UnknownPayment(parent_id))?;
        match result {
            OffchainResult::Succeeded { preimage } => {
                payment.status = OutgoingStatus::Succeeded {
                    preimage,
                    completed_at,
                };
                // The payment's final view keeps only what was delivered.
                payment.parts.retain(|part| {
                    matches!(part.status, PartStatus::Succeeded { .. })
                });
            }
            OffchainResult::Failed { reason } => {
                payment.status = OutgoingStatus::Failed {
                    reason,
                    completed_at,
                };
            }
        }
        Ok(())
    }

    async fn get_lightning_outgoing_payment(
        &self,
        parent_id: PaymentId,
    ) -> Result<Option<OutgoingPayment>, PaymentsDbError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.outgoing.get(&parent_id).cloned())
    }

    async fn get_lightning_outgoing_payment_from_part_id(
        &self,
        part_id: PartId,
    ) -> Result<Option<OutgoingPayment>, PaymentsDbError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .part_index
            .get(&part_id)
            .and_then(|parent_id| inner.outgoing.get(parent_id))
            .cloned())
    }

    async fn list_lightning_outgoing_payments(
        &self,
        payment_hash: PaymentHash,
    ) -> Result<Vec<OutgoingPayment>, PaymentsDbError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .outgoing
            .values()
            .filter(|payment| {
                payment.payment_hash() == Some(payment_hash)
            })
            .cloned()
            .collect())
    }

    async fn add_on_chain_payment(
        &self,
        payment: OnChainPayment,
    ) -> Result<(), PaymentsDbError> {
        let mut inner = self.inner.lock().unwrap();
        inner.on_chain.push(payment);
        Ok(())
    }

    async fn set_locked(
        &self,
        txid: Txid,
        at: TimestampMs,
    ) -> Result<(), PaymentsDbError> {
        let mut inner = self.inner.lock().unwrap();
        for payment in &mut inner.on_chain {
            if payment.txid() == txid {
                payment.set_locked(at);
            }
        }
        Ok(())
    }

    async fn add_htlc_infos(
        &self,
        htlc_infos: Vec<HtlcInfo>,
    ) -> Result<(), PaymentsDbError> {
        let mut inner = self.inner.lock().unwrap();
        inner.htlc_infos.extend(htlc_infos);
        Ok(())
    }

    async fn list_htlc_infos(
        &self,
        channel_id: ChannelId,
        commitment_number: u64,
    ) -> Result<Vec<HtlcInfo>, PaymentsDbError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .htlc_infos
            .iter()
            .filter(|info| {
                info.channel_id == channel_id
                    && info.commitment_number == commitment_number
            })
            .cloned()
            .collect())
    }

    async fn add_or_update_channel(
        &self,
        state: PersistedChannel,
    ) -> Result<(), PaymentsDbError> {
        let mut inner = self.inner.lock().unwrap();
        inner.channels.insert(state.channel_id(), state);
        Ok(())
    }

    async fn remove_channel(
        &self,
        channel_id: ChannelId,
    ) -> Result<(), PaymentsDbError> {
        let mut inner = self.inner.lock().unwrap();
        inner.channels.remove(&channel_id);
        Ok(())
    }

    async fn list_local_channels(
        &self,
    ) -> Result<Vec<PersistedChannel>, PaymentsDbError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.channels.values().cloned().collect())
    }
}

#[cfg(test)]
mod test {
    use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
    use common::amount::Amount;

    use super::*;
    use crate::payments::OutgoingDetails;

    fn preimage(byte: u8) -> PaymentPreimage {
        PaymentPreimage([byte; 32])
    }

    fn node_pk(byte: u8) -> PublicKey {
        let secp = Secp256k1::new();
        PublicKey::from_secret_key(
            &secp,
            &SecretKey::from_slice(&[byte; 32]).unwrap(),
        )
    }

    fn lightning_part(amount_msat: u64, htlc_id: u64) -> ReceivedWith {
        ReceivedWith::LightningHtlc {
            amount: Amount::from_msat(amount_msat),
            channel_id: ChannelId([1; 32]),
            htlc_id,
        }
    }

    fn pending_part(id_byte: u8, amount_msat: u64) -> OutgoingPart {
        OutgoingPart {
            id: PartId([id_byte; 16]),
            amount: Amount::from_msat(amount_msat),
            route: vec![node_pk(9)],
            status: PartStatus::Pending,
            created_at: TimestampMs::from(100u32),
        }
    }

    fn outgoing(
        id_byte: u8,
        recipient_msat: u64,
        details: OutgoingDetails,
        parts: Vec<OutgoingPart>,
    ) -> OutgoingPayment {
        OutgoingPayment {
            id: PaymentId([id_byte; 16]),
            recipient_amount: Amount::from_msat(recipient_msat),
            recipient: node_pk(9),
            details,
            parts,
            status: OutgoingStatus::Pending,
            created_at: TimestampMs::from(100u32),
        }
    }

    fn swap_out_details() -> OutgoingDetails {
        OutgoingDetails::SwapOut {
            address: "bcrt1qtest".to_owned(),
            swap_fee: Amount::from_sat(15),
        }
    }

    fn invoice_details(
        preimage: PaymentPreimage,
        amount_msat: u64,
    ) -> OutgoingDetails {
        let secp = Secp256k1::new();
        let node_secret = SecretKey::from_slice(&[0x51; 32]).unwrap();
        let invoice = crate::invoice::create_invoice(
            &secp,
            crate::invoice::NewInvoice {
                network: bitcoin::Network::Regtest,
                preimage,
                payment_secret: crate::payments::PaymentSecret([7; 32]),
                amount: Some(Amount::from_msat(amount_msat)),
                description: crate::invoice::InvoiceDescription::Direct(
                    "test".to_owned(),
                ),
                expiry: None,
                extra_hop: crate::invoice::ExtraHop {
                    node_id: node_pk(8),
                    short_channel_id: 1,
                    fee_base_msat: 0,
                    fee_proportional_millionths: 0,
                    cltv_expiry_delta: 144,
                },
                node_secret: &node_secret,
            },
        )
        .unwrap();
        OutgoingDetails::Normal { invoice }
    }

    #[tokio::test]
    async fn single_htlc_receive() {
        let db = MemoryPaymentsDb::new();
        let preimage = preimage(1);
        let hash = preimage.payment_hash();
        db.add_incoming_payment(
            preimage,
            IncomingOrigin::SwapIn { address: None },
            TimestampMs::from(100u32),
        )
        .await
        .unwrap();

        db.receive_payment(
            hash,
            vec![lightning_part(200_000, 1)],
            TimestampMs::from(110u32),
        )
        .await
        .unwrap();

        let payment = db.get_incoming_payment(hash).await.unwrap().unwrap();
        assert_eq!(payment.amount(), Amount::from_msat(200_000));
        assert_eq!(payment.fees(), Amount::ZERO);
        assert_eq!(payment.received.as_ref().unwrap().parts.len(), 1);
    }

    #[tokio::test]
    async fn multi_part_receive_preserves_order_and_fees() {
        let db = MemoryPaymentsDb::new();
        let preimage = preimage(2);
        let hash = preimage.payment_hash();
        db.add_incoming_payment(
            preimage,
            IncomingOrigin::SwapIn { address: None },
            TimestampMs::from(100u32),
        )
        .await
        .unwrap();

        let parts = vec![
            lightning_part(57_000, 0),
            lightning_part(43_000, 1),
            ReceivedWith::NewChannel {
                amount: Amount::from_msat(99_000),
                mining_fee: Amount::ZERO,
                service_fee: Amount::from_msat(1_000),
                channel_id: None,
            },
        ];
        db.receive_payment(hash, parts.clone(), TimestampMs::from(110u32))
            .await
            .unwrap();

        let payment = db.get_incoming_payment(hash).await.unwrap().unwrap();
        assert_eq!(payment.amount(), Amount::from_msat(199_000));
        assert_eq!(payment.fees(), Amount::from_msat(1_000));
        assert_eq!(payment.received.as_ref().unwrap().parts, parts);
    }

    #[tokio::test]
    async fn receive_twice_is_additive_and_updates_timestamp() {
        let db = MemoryPaymentsDb::new();
        let preimage = preimage(3);
        let hash = preimage.payment_hash();
        db.add_incoming_payment(
            preimage,
            IncomingOrigin::SwapIn { address: None },
            TimestampMs::from(100u32),
        )
        .await
        .unwrap();

        let part_a = lightning_part(200_000, 0);
        let part_b = lightning_part(100_000, 1);
        db.receive_payment(
            hash,
            vec![part_a.clone()],
            TimestampMs::from(110u32),
        )
        .await
        .unwrap();
        db.receive_payment(
            hash,
            vec![part_b.clone()],
            TimestampMs::from(150u32),
        )
        .await
        .unwrap();

        let payment = db.get_incoming_payment(hash).await.unwrap().unwrap();
        let received = payment.received.as_ref().unwrap();
        assert_eq!(payment.amount(), Amount::from_msat(300_000));
        assert_eq!(received.received_at, TimestampMs::from(150u32));
        assert_eq!(received.parts, vec![part_a, part_b]);
    }

    #[tokio::test]
    async fn duplicate_payment_hash_is_refused() {
        let db = MemoryPaymentsDb::new();
        let preimage = preimage(4);
        db.add_incoming_payment(
            preimage,
            IncomingOrigin::SwapIn { address: None },
            TimestampMs::from(100u32),
        )
        .await
        .unwrap();
        let err = db
            .add_incoming_payment(
                preimage,
                IncomingOrigin::SwapIn { address: None },
                TimestampMs::from(101u32),
            )
            .await
            .unwrap_err();
        assert_eq!(
            err,
            PaymentsDbError::DuplicatePaymentHash(preimage.payment_hash()),
        );
    }

    #[tokio::test]
    async fn normal_payment_fee_accounting() {
        let db = MemoryPaymentsDb::new();
        let preimage = preimage(5);
        // 180k to the recipient via parts of 115k and 75k.
        let payment = outgoing(
            1,
            180_000,
            invoice_details(preimage, 180_000),
            vec![pending_part(1, 115_000), pending_part(2, 75_000)],
        );
        db.add_outgoing_payment(payment).await.unwrap();

        for part_id in [PartId([1; 16]), PartId([2; 16])] {
            db.complete_outgoing_lightning_part(
                part_id,
                PartResult::Succeeded { preimage },
                TimestampMs::from(120u32),
            )
            .await
            .unwrap();
        }
        db.complete_outgoing_payment_offchain(
            PaymentId([1; 16]),
            OffchainResult::Succeeded { preimage },
            TimestampMs::from(121u32),
        )
        .await
        .unwrap();

        let payment = db
            .get_lightning_outgoing_payment(PaymentId([1; 16]))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(payment.fees(), Amount::from_msat(10_000));
        assert_eq!(payment.amount(), Amount::from_msat(190_000));
    }

    #[tokio::test]
    async fn swap_out_fee_accounting() {
        let db = MemoryPaymentsDb::new();
        let preimage = preimage(6);
        // 150k to the recipient; 15 sat swap fee; one HTLC of 157k.
        let payment = outgoing(
            2,
            150_000,
            swap_out_details(),
            vec![pending_part(3, 157_000)],
        );
        db.add_outgoing_payment(payment).await.unwrap();
        db.complete_outgoing_lightning_part(
            PartId([3; 16]),
            PartResult::Succeeded { preimage },
            TimestampMs::from(120u32),
        )
        .await
        .unwrap();
        db.complete_outgoing_payment_offchain(
            PaymentId([2; 16]),
            OffchainResult::Succeeded { preimage },
            TimestampMs::from(121u32),
        )
        .await
        .unwrap();

        let payment = db
            .get_lightning_outgoing_payment(PaymentId([2; 16]))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(payment.fees(), Amount::from_msat(22_000));
        assert_eq!(payment.amount(), Amount::from_msat(157_000));
    }

    #[tokio::test]
    async fn id_reuse_is_refused() {
        let db = MemoryPaymentsDb::new();
        let payment = outgoing(
            3,
            1_000,
            swap_out_details(),
            vec![pending_part(7, 1_000)],
        );
        db.add_outgoing_payment(payment.clone()).await.unwrap();

        // Parent id reuse.
        assert_eq!(
            db.add_outgoing_payment(payment).await.unwrap_err(),
            PaymentsDbError::DuplicatePaymentId(PaymentId([3; 16])),
        );
        // Part id reuse on a different parent.
        let other = outgoing(
            4,
            1_000,
            swap_out_details(),
            vec![pending_part(7, 1_000)],
        );
        assert_eq!(
            db.add_outgoing_payment(other).await.unwrap_err(),
            PaymentsDbError::DuplicatePartId(PartId([7; 16])),
        );
        // Part id reuse via add_outgoing_lightning_parts.
        assert_eq!(
            db.add_outgoing_lightning_parts(
                PaymentId([3; 16]),
                vec![pending_part(7, 500)],
            )
            .await
            .unwrap_err(),
            PaymentsDbError::DuplicatePartId(PartId([7; 16])),
        );
    }

    #[tokio::test]
    async fn success_drops_failed_parts() {
        let db = MemoryPaymentsDb::new();
        let preimage = preimage(7);
        let payment = outgoing(
            5,
            100_000,
            swap_out_details(),
            vec![pending_part(8, 105_000), pending_part(9, 105_000)],
        );
        db.add_outgoing_payment(payment).await.unwrap();

        db.complete_outgoing_lightning_part(
            PartId([8; 16]),
            PartResult::Failed {
                failure_code: Some(0x100f),
                failure_message: "temporary channel failure".to_owned(),
            },
            TimestampMs::from(110u32),
        )
        .await
        .unwrap();
        db.complete_outgoing_lightning_part(
            PartId([9; 16]),
            PartResult::Succeeded { preimage },
            TimestampMs::from(120u32),
        )
        .await
        .unwrap();
        db.complete_outgoing_payment_offchain(
            PaymentId([5; 16]),
            OffchainResult::Succeeded { preimage },
            TimestampMs::from(121u32),
        )
        .await
        .unwrap();

        let payment = db
            .get_lightning_outgoing_payment(PaymentId([5; 16]))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(payment.parts.len(), 1);
        assert_eq!(payment.parts[0].id, PartId([9; 16]));
    }
}
