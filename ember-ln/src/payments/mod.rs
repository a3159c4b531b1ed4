//! Payment types.
//!
//! The full hierarchy of persistent payment records is as follows:
//!
//! [`IncomingPayment`]
//! |
//! |___origin: invoice or swap-in
//! |
//! |___received: a list of [`ReceivedWith`] parts (Lightning HTLC parts
//!     and/or a new-channel part carrying mining / service fees)
//!
//! [`OutgoingPayment`]
//! |
//! |___details: [`OutgoingDetails::Normal`] (invoice) or
//! |   [`OutgoingDetails::SwapOut`] (on-chain address + swap fee)
//! |
//! |___parts: individual HTLC attempts, each with its own id and status
//!
//! [`OnChainPayment`]: splice / splice-CPFP / close records with mining
//! fees, txid, and confirmation timestamps.
//!
//! NOTE: Everything in this hierarchy impls [`Serialize`] and
//! [`Deserialize`], so be mindful of backwards compatibility.

use std::{
    fmt::{self, Display},
    str::FromStr,
};

use bitcoin::{
    hashes::{sha256, Hash},
    secp256k1::PublicKey,
    Txid,
};
use common::{
    amount::Amount,
    hex::{self, FromHex},
    rng::Crng,
    serde_helpers::hexstr_or_bytes,
    time::TimestampMs,
};
use serde::{Deserialize, Serialize};
use serde_with::{DeserializeFromStr, SerializeDisplay};

use crate::{channel::ChannelId, invoice::Invoice};

/// Payment storage contract + in-memory implementation.
pub mod db;
/// Incoming payment handler.
pub mod inbound;
/// Outgoing payment handler.
pub mod outbound;

// --- Newtypes --- //

/// The SHA-256 of a payment preimage. Identifies a payment end-to-end.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct PaymentHash(#[serde(with = "hexstr_or_bytes")] pub [u8; 32]);

/// The secret whose hash locks an HTLC.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct PaymentPreimage(#[serde(with = "hexstr_or_bytes")] pub [u8; 32]);

/// The Bolt 11 payment secret, proving the payer saw the invoice.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct PaymentSecret(#[serde(with = "hexstr_or_bytes")] pub [u8; 32]);

/// The id of a whole outgoing payment (the "parent id"). Never reused.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[derive(SerializeDisplay, DeserializeFromStr)]
pub struct PaymentId(pub [u8; 16]);

/// The id of one attempt (part) of an outgoing payment. Never reused.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[derive(SerializeDisplay, DeserializeFromStr)]
pub struct PartId(pub [u8; 16]);

impl PaymentPreimage {
    pub fn payment_hash(&self) -> PaymentHash {
        PaymentHash(sha256::Hash::hash(&self.0).to_byte_array())
    }
}

impl PaymentId {
    pub fn generate(rng: &mut impl Crng) -> Self {
        let mut id = [0u8; 16];
        rng.fill_bytes(&mut id);
        Self(id)
    }
}

impl PartId {
    pub fn generate(rng: &mut impl Crng) -> Self {
        let mut id = [0u8; 16];
        rng.fill_bytes(&mut id);
        Self(id)
    }
}

// --- Incoming payments --- //

/// Why we expect (or received) an incoming payment.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum IncomingOrigin {
    /// We issued a Bolt 11 invoice for it.
    Invoice(Invoice),
    /// An on-chain swap-in promoted into Lightning liquidity.
    SwapIn { address: Option<String> },
}

/// One settled part of an incoming payment.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ReceivedWith {
    /// A plain HTLC part on an existing channel.
    LightningHtlc {
        amount: Amount,
        channel_id: ChannelId,
        htlc_id: u64,
    },
    /// A part settled by the peer opening (or splicing into) a channel on
    /// the fly. `amount` is the amount credited after fees.
    NewChannel {
        amount: Amount,
        mining_fee: Amount,
        service_fee: Amount,
        channel_id: Option<ChannelId>,
    },
}

impl ReceivedWith {
    pub fn amount(&self) -> Amount {
        match self {
            Self::LightningHtlc { amount, .. } => *amount,
            Self::NewChannel { amount, .. } => *amount,
        }
    }

    pub fn fees(&self) -> Amount {
        match self {
            Self::LightningHtlc { .. } => Amount::ZERO,
            Self::NewChannel {
                mining_fee,
                service_fee,
                ..
            } => *mining_fee + *service_fee,
        }
    }
}

/// The settled portion of an [`IncomingPayment`]. Receiving additional parts
/// on the same payment hash appends to `parts` and refreshes `received_at`.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Received {
    pub parts: Vec<ReceivedWith>,
    pub received_at: TimestampMs,
}

/// A payment expected or received by us, keyed by payment hash.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IncomingPayment {
    pub preimage: PaymentPreimage,
    pub origin: IncomingOrigin,
    pub created_at: TimestampMs,
    pub received: Option<Received>,
}

impl IncomingPayment {
    pub fn payment_hash(&self) -> PaymentHash {
        self.preimage.payment_hash()
    }

    /// Amount credited to us across all settled parts.
    pub fn amount(&self) -> Amount {
        self.received
            .as_ref()
            .map(|r| r.parts.iter().map(ReceivedWith::amount).sum())
            .unwrap_or(Amount::ZERO)
    }

    /// Fees deducted by the peer across all settled parts.
    pub fn fees(&self) -> Amount {
        self.received
            .as_ref()
            .map(|r| r.parts.iter().map(ReceivedWith::fees).sum())
            .unwrap_or(Amount::ZERO)
    }
}

// --- Outgoing payments --- //

/// What an outgoing payment pays for.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum OutgoingDetails {
    /// A normal Bolt 11 payment.
    Normal { invoice: Invoice },
    /// A swap-out: the recipient amount lands on-chain at `address`; the
    /// swap fee (mining fee included) is charged on top.
    SwapOut { address: String, swap_fee: Amount },
}

/// The status of one HTLC attempt.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum PartStatus {
    Pending,
    Succeeded {
        preimage: PaymentPreimage,
        completed_at: TimestampMs,
    },
    Failed {
        failure_code: Option<u16>,
        failure_message: String,
        completed_at: TimestampMs,
    },
}

/// One HTLC attempt of an outgoing payment.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OutgoingPart {
    pub id: PartId,
    pub amount: Amount,
    /// The node ids this part was routed through.
    pub route: Vec<PublicKey>,
    pub status: PartStatus,
    pub created_at: TimestampMs,
}

/// The terminal classification of a failed outgoing payment, surfaced to
/// the user.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum FinalFailure {
    NoRouteToRecipient,
    RecipientUnreachable,
    InsufficientBalance,
    InvalidPaymentRequest,
    WalletRestartedDuringPayment,
    UnknownError,
}

impl Display for FinalFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NoRouteToRecipient => "no route to recipient",
            Self::RecipientUnreachable => "recipient unreachable",
            Self::InsufficientBalance => "insufficient balance",
            Self::InvalidPaymentRequest => "invalid payment request",
            Self::WalletRestartedDuringPayment =>
                "wallet restarted during payment",
            Self::UnknownError => "unknown error",
        };
        f.write_str(s)
    }
}

/// The overall status of an outgoing payment.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum OutgoingStatus {
    Pending,
    Succeeded {
        preimage: PaymentPreimage,
        completed_at: TimestampMs,
    },
    Failed {
        reason: FinalFailure,
        completed_at: TimestampMs,
    },
}

/// A payment sent by us, keyed by its parent [`PaymentId`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OutgoingPayment {
    pub id: PaymentId,
    pub recipient_amount: Amount,
    pub recipient: PublicKey,
    pub details: OutgoingDetails,
    pub parts: Vec<OutgoingPart>,
    pub status: OutgoingStatus,
    pub created_at: TimestampMs,
}

impl OutgoingPayment {
    pub fn payment_hash(&self) -> Option<PaymentHash> {
        match &self.details {
            OutgoingDetails::Normal { invoice } =>
                Some(invoice.payment_hash()),
            OutgoingDetails::SwapOut { .. } => None,
        }
    }

    /// Amount actually sent out, summed over succeeded parts.
    pub fn amount(&self) -> Amount {
        self.parts
            .iter()
            .filter(|p| matches!(p.status, PartStatus::Succeeded { .. }))
            .map(|p| p.amount)
            .sum()
    }

    /// Total fees: the routing overhead above the recipient amount, plus the
    /// swap fee for swap-outs.
    pub fn fees(&self) -> Amount {
        let parts_total: Amount = self
            .parts
            .iter()
            .filter(|p| !matches!(p.status, PartStatus::Failed { .. }))
            .map(|p| p.amount)
            .sum();
        let routing_fees = parts_total.saturating_sub(self.recipient_amount);
        match &self.details {
            OutgoingDetails::Normal { .. } => routing_fees,
            OutgoingDetails::SwapOut { swap_fee, .. } =>
                routing_fees + *swap_fee,
        }
    }
}

// --- On-chain payment records --- //

/// How a channel ended up closed on-chain.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ClosingType {
    Mutual,
    Local,
    Remote,
    Revoked,
    Other,
}

/// Splice / close records carrying on-chain mining fees, txid, and
/// confirmation timestamps.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum OnChainPayment {
    Splice {
        id: PaymentId,
        amount: Amount,
        mining_fee: Amount,
        channel_id: ChannelId,
        txid: Txid,
        created_at: TimestampMs,
        confirmed_at: Option<TimestampMs>,
        locked_at: Option<TimestampMs>,
    },
    SpliceCpfp {
        id: PaymentId,
        mining_fee: Amount,
        channel_id: ChannelId,
        txid: Txid,
        created_at: TimestampMs,
        confirmed_at: Option<TimestampMs>,
        locked_at: Option<TimestampMs>,
    },
    Close {
        id: PaymentId,
        amount: Amount,
        address: String,
        mining_fee: Amount,
        channel_id: ChannelId,
        txid: Txid,
        closing_type: ClosingType,
        created_at: TimestampMs,
        confirmed_at: Option<TimestampMs>,
        locked_at: Option<TimestampMs>,
    },
}

impl OnChainPayment {
    pub fn txid(&self) -> Txid {
        match self {
            Self::Splice { txid, .. } => *txid,
            Self::SpliceCpfp { txid, .. } => *txid,
            Self::Close { txid, .. } => *txid,
        }
    }

    pub fn set_locked(&mut self, at: TimestampMs) {
        match self {
            Self::Splice { locked_at, .. } => *locked_at = Some(at),
            Self::SpliceCpfp { locked_at, .. } => *locked_at = Some(at),
            Self::Close { locked_at, .. } => *locked_at = Some(at),
        }
    }
}

// --- Redact secret information --- //

impl fmt::Debug for PaymentPreimage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PaymentPreimage(..)")
    }
}

impl fmt::Debug for PaymentSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PaymentSecret(..)")
    }
}

// --- FromStr / Display impls --- //

impl FromStr for PaymentHash {
    type Err = hex::DecodeError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <[u8; 32]>::from_hex(s).map(Self)
    }
}
impl FromStr for PaymentId {
    type Err = hex::DecodeError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <[u8; 16]>::from_hex(s).map(Self)
    }
}
impl FromStr for PartId {
    type Err = hex::DecodeError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <[u8; 16]>::from_hex(s).map(Self)
    }
}

impl Display for PaymentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::display(&self.0))
    }
}
impl Display for PaymentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::display(&self.0))
    }
}
impl Display for PartId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::display(&self.0))
    }
}

#[cfg(test)]
mod test {
    use common::rng::FastRng;

    use super::*;

    #[test]
    fn preimage_hashes_to_payment_hash() {
        let preimage = PaymentPreimage([1u8; 32]);
        let hash = preimage.payment_hash();
        let expected = sha256::Hash::hash(&[1u8; 32]).to_byte_array();
        assert_eq!(hash.0, expected);
    }

    #[test]
    fn id_fromstr_display_roundtrip() {
        let mut rng = FastRng::from_u64(96);
        let id = PaymentId::generate(&mut rng);
        assert_eq!(PaymentId::from_str(&id.to_string()).unwrap(), id);
        let part = PartId::generate(&mut rng);
        assert_eq!(PartId::from_str(&part.to_string()).unwrap(), part);
        assert_ne!(id.0, part.0);
    }

    #[test]
    fn received_with_accounting() {
        let lightning = ReceivedWith::LightningHtlc {
            amount: Amount::from_msat(57_000),
            channel_id: ChannelId([1; 32]),
            htlc_id: 0,
        };
        let new_channel = ReceivedWith::NewChannel {
            amount: Amount::from_msat(99_000),
            mining_fee: Amount::ZERO,
            service_fee: Amount::from_msat(1_000),
            channel_id: None,
        };
        assert_eq!(lightning.fees(), Amount::ZERO);
        assert_eq!(new_channel.amount(), Amount::from_msat(99_000));
        assert_eq!(new_channel.fees(), Amount::from_msat(1_000));
    }
}
