//! Lightning wire messages.
//!
//! BOLT 1/2/7 messages plus the extensions this node speaks with its
//! trampoline peer: dual funding, splicing, `channel_reestablish` with an
//! encrypted `channel_data` TLV, `please_open_channel`, pay-to-open, legacy
//! migration info, FCM tokens, and onion messages.
//!
//! All messages are `u16`-type-prefixed and TLV-extensible. Per BOLT 1,
//! unknown even message/TLV types are errors while unknown odd types are
//! ignored.

use bitcoin::{
    secp256k1::{ecdsa::Signature, PublicKey},
    ScriptBuf, Transaction, Txid, Witness,
};
use bytes::BufMut;
use common::{amount::Amount, serde_helpers::hexstr_or_bytes};
use serde::{Deserialize, Serialize};

use crate::channel::ChannelId;

pub mod codec;

use codec::{
    get_array, get_bytes, get_i64, get_prefixed_bytes, get_pubkey,
    get_script, get_signature, get_tlv_stream, get_tx, get_txid, get_u16,
    get_u32, get_u64, get_u8, get_witness, put_prefixed_bytes, put_pubkey,
    put_script, put_signature, put_tlv_stream, put_tx, put_txid, put_witness,
    reject_unknown_even, Result, TlvRecord, WireError,
};

// --- Message type codes --- //

const MSG_WARNING: u16 = 1;
const MSG_INIT: u16 = 16;
const MSG_ERROR: u16 = 17;
const MSG_PING: u16 = 18;
const MSG_PONG: u16 = 19;
const MSG_CHANNEL_READY: u16 = 36;
const MSG_SHUTDOWN: u16 = 38;
const MSG_CLOSING_SIGNED: u16 = 39;
const MSG_OPEN_CHANNEL2: u16 = 64;
const MSG_ACCEPT_CHANNEL2: u16 = 65;
const MSG_TX_ADD_INPUT: u16 = 66;
const MSG_TX_ADD_OUTPUT: u16 = 67;
const MSG_TX_REMOVE_INPUT: u16 = 68;
const MSG_TX_REMOVE_OUTPUT: u16 = 69;
const MSG_TX_COMPLETE: u16 = 70;
const MSG_TX_SIGNATURES: u16 = 71;
const MSG_TX_ABORT: u16 = 74;
const MSG_SPLICE_LOCKED: u16 = 77;
const MSG_SPLICE_INIT: u16 = 80;
const MSG_SPLICE_ACK: u16 = 81;
const MSG_UPDATE_ADD_HTLC: u16 = 128;
const MSG_UPDATE_FULFILL_HTLC: u16 = 130;
const MSG_UPDATE_FAIL_HTLC: u16 = 131;
const MSG_COMMITMENT_SIGNED: u16 = 132;
const MSG_REVOKE_AND_ACK: u16 = 133;
const MSG_UPDATE_FEE: u16 = 134;
const MSG_UPDATE_FAIL_MALFORMED_HTLC: u16 = 135;
const MSG_CHANNEL_REESTABLISH: u16 = 136;
const MSG_CHANNEL_UPDATE: u16 = 258;
const MSG_ONION_MESSAGE: u16 = 513;
const MSG_FCM_TOKEN: u16 = 35017;
const MSG_UNSET_FCM_TOKEN: u16 = 35019;
const MSG_LEGACY_INFO: u16 = 35023;
const MSG_PLEASE_OPEN_CHANNEL: u16 = 36001;
const MSG_PAY_TO_OPEN_REQUEST: u16 = 36003;
const MSG_PAY_TO_OPEN_RESPONSE: u16 = 36005;

// --- TLV type codes --- //

const TLV_CHANNEL_TYPE: u64 = 1;
const TLV_SCID_ALIAS: u64 = 1;
const TLV_FEE_RANGE: u64 = 1;
const TLV_CHANNEL_DATA: u64 = 1;
const TLV_NEXT_FUNDING: u64 = 3;
const TLV_PUSH_AMOUNT: u64 = 0x4700_0005;
const TLV_ORIGIN: u64 = 0x4700_0009;
const TLV_FUNDING_TXID: u64 = 0x4700_0011;

/// Fixed size of a payment onion packet (BOLT 4).
pub const ONION_PACKET_LEN: usize = 1366;

// --- Support types --- //

/// A BOLT 9 feature bit vector, most significant byte first.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Features(#[serde(with = "hexstr_or_bytes")] pub Vec<u8>);

impl Features {
    /// Whether feature bit `bit` (BOLT 9 numbering, bit 0 = least
    /// significant bit of the last byte) is set.
    pub fn supports(&self, bit: usize) -> bool {
        let byte_index = bit / 8;
        if byte_index >= self.0.len() {
            return false;
        }
        let byte = self.0[self.0.len() - 1 - byte_index];
        byte & (1 << (bit % 8)) != 0
    }

    /// The lowest unknown *even* feature bit, if any. Odd bits are always
    /// acceptable ("it's ok to be odd").
    pub fn unknown_even_bit(&self, known: &[usize]) -> Option<usize> {
        (0..self.0.len() * 8)
            .step_by(2)
            .find(|bit| self.supports(*bit) && !known.contains(bit))
    }
}

/// An opaque, fixed-size Sphinx onion packet.
#[derive(Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct OnionPacket(#[serde(with = "hexstr_or_bytes")] pub Vec<u8>);

impl OnionPacket {
    /// An all-zero packet of the standard size; used where the payload is
    /// produced or consumed by the (external) sphinx layer.
    pub fn blank() -> Self {
        Self(vec![0u8; ONION_PACKET_LEN])
    }
}

impl std::fmt::Debug for OnionPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "OnionPacket({} bytes)", self.0.len())
    }
}

/// Why a channel open was initiated by the peer; attached as a TLV to
/// `open_channel2` so the non-initiator can match it to local state.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ChannelOrigin {
    /// Response to our `please_open_channel`.
    PleaseOpenChannel {
        #[serde(with = "hexstr_or_bytes")]
        request_id: [u8; 32],
        service_fee: Amount,
        mining_fee: Amount,
    },
    /// Opened on the fly to settle an incoming payment.
    PayToOpen {
        #[serde(with = "hexstr_or_bytes")]
        payment_hash: [u8; 32],
        service_fee: Amount,
        mining_fee: Amount,
    },
}

impl ChannelOrigin {
    fn read(r: &mut &[u8]) -> Result<Self> {
        match get_u16(r)? {
            1 => Ok(Self::PleaseOpenChannel {
                request_id: get_array(r)?,
                service_fee: Amount::from_msat(get_u64(r)?),
                mining_fee: Amount::from_sat(get_u64(r)?),
            }),
            2 => Ok(Self::PayToOpen {
                payment_hash: get_array(r)?,
                service_fee: Amount::from_msat(get_u64(r)?),
                mining_fee: Amount::from_sat(get_u64(r)?),
            }),
            _ => Err(WireError::Invalid("channel origin")),
        }
    }

    fn write(&self, w: &mut Vec<u8>) {
        match self {
            Self::PleaseOpenChannel {
                request_id,
                service_fee,
                mining_fee,
            } => {
                w.put_u16(1);
                w.put_slice(request_id);
                w.put_u64(service_fee.msat());
                w.put_u64(mining_fee.sats_floor());
            }
            Self::PayToOpen {
                payment_hash,
                service_fee,
                mining_fee,
            } => {
                w.put_u16(2);
                w.put_slice(payment_hash);
                w.put_u64(service_fee.msat());
                w.put_u64(mining_fee.sats_floor());
            }
        }
    }
}

// --- Messages --- //

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Init {
    pub features: Features,
    /// Undecoded extension records (e.g. `networks`).
    pub tlvs: Vec<(u64, Vec<u8>)>,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ErrorMsg {
    pub channel_id: ChannelId,
    pub data: Vec<u8>,
}

impl ErrorMsg {
    pub fn new(channel_id: ChannelId, message: &str) -> Self {
        Self {
            channel_id,
            data: message.as_bytes().to_vec(),
        }
    }

    /// Zero channel id addresses the connection, not a channel.
    pub fn is_connection_level(&self) -> bool {
        self.channel_id == ChannelId([0u8; 32])
    }

    pub fn to_ascii(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct WarningMsg {
    pub channel_id: ChannelId,
    pub data: Vec<u8>,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Ping {
    pub num_pong_bytes: u16,
    pub ignored: Vec<u8>,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Pong {
    pub ignored: Vec<u8>,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct OpenChannel2 {
    #[serde(with = "hexstr_or_bytes")]
    pub chain_hash: [u8; 32],
    pub temporary_channel_id: ChannelId,
    pub funding_feerate_per_kw: u32,
    pub commitment_feerate_per_kw: u32,
    pub funding_amount_sat: u64,
    pub dust_limit_sat: u64,
    pub max_htlc_value_in_flight: Amount,
    pub htlc_minimum: Amount,
    pub to_self_delay: u16,
    pub max_accepted_htlcs: u16,
    pub lock_time: u32,
    pub funding_pubkey: PublicKey,
    pub revocation_basepoint: PublicKey,
    pub payment_basepoint: PublicKey,
    pub delayed_payment_basepoint: PublicKey,
    pub htlc_basepoint: PublicKey,
    pub first_per_commitment_point: PublicKey,
    pub second_per_commitment_point: PublicKey,
    pub channel_flags: u8,
    pub channel_type: Option<Vec<u8>>,
    pub push_amount: Option<Amount>,
    pub origin: Option<ChannelOrigin>,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct AcceptChannel2 {
    pub temporary_channel_id: ChannelId,
    pub funding_amount_sat: u64,
    pub dust_limit_sat: u64,
    pub max_htlc_value_in_flight: Amount,
    pub htlc_minimum: Amount,
    pub minimum_depth: u32,
    pub to_self_delay: u16,
    pub max_accepted_htlcs: u16,
    pub funding_pubkey: PublicKey,
    pub revocation_basepoint: PublicKey,
    pub payment_basepoint: PublicKey,
    pub delayed_payment_basepoint: PublicKey,
    pub htlc_basepoint: PublicKey,
    pub first_per_commitment_point: PublicKey,
    pub second_per_commitment_point: PublicKey,
    pub channel_type: Option<Vec<u8>>,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TxAddInput {
    pub channel_id: ChannelId,
    pub serial_id: u64,
    pub prev_tx: Transaction,
    pub prev_tx_vout: u32,
    pub sequence: u32,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TxAddOutput {
    pub channel_id: ChannelId,
    pub serial_id: u64,
    pub amount_sat: u64,
    pub script_pubkey: ScriptBuf,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TxRemoveInput {
    pub channel_id: ChannelId,
    pub serial_id: u64,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TxRemoveOutput {
    pub channel_id: ChannelId,
    pub serial_id: u64,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TxComplete {
    pub channel_id: ChannelId,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TxSignatures {
    pub channel_id: ChannelId,
    pub txid: Txid,
    pub witnesses: Vec<Witness>,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TxAbort {
    pub channel_id: ChannelId,
    pub data: Vec<u8>,
}

impl TxAbort {
    pub fn new(channel_id: ChannelId, reason: &str) -> Self {
        Self {
            channel_id,
            data: reason.as_bytes().to_vec(),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ChannelReady {
    pub channel_id: ChannelId,
    pub next_per_commitment_point: PublicKey,
    pub short_channel_id_alias: Option<u64>,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Shutdown {
    pub channel_id: ChannelId,
    pub script_pubkey: ScriptBuf,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ClosingSigned {
    pub channel_id: ChannelId,
    pub fee_sat: u64,
    pub signature: Signature,
    pub fee_range: Option<(u64, u64)>,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct UpdateAddHtlc {
    pub channel_id: ChannelId,
    pub id: u64,
    pub amount: Amount,
    pub payment_hash: [u8; 32],
    pub cltv_expiry: u32,
    pub onion: OnionPacket,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct UpdateFulfillHtlc {
    pub channel_id: ChannelId,
    pub id: u64,
    #[serde(with = "hexstr_or_bytes")]
    pub payment_preimage: [u8; 32],
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct UpdateFailHtlc {
    pub channel_id: ChannelId,
    pub id: u64,
    pub reason: Vec<u8>,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct UpdateFailMalformedHtlc {
    pub channel_id: ChannelId,
    pub id: u64,
    #[serde(with = "hexstr_or_bytes")]
    pub sha256_of_onion: [u8; 32],
    pub failure_code: u16,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct CommitmentSigned {
    pub channel_id: ChannelId,
    pub signature: Signature,
    pub htlc_signatures: Vec<Signature>,
    /// During a splice, which funding tx this signature targets.
    pub funding_txid: Option<Txid>,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct RevokeAndAck {
    pub channel_id: ChannelId,
    #[serde(with = "hexstr_or_bytes")]
    pub per_commitment_secret: [u8; 32],
    pub next_per_commitment_point: PublicKey,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct UpdateFee {
    pub channel_id: ChannelId,
    pub feerate_per_kw: u32,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ChannelReestablish {
    pub channel_id: ChannelId,
    pub next_commitment_number: u64,
    pub next_revocation_number: u64,
    #[serde(with = "hexstr_or_bytes")]
    pub your_last_per_commitment_secret: [u8; 32],
    pub my_current_per_commitment_point: PublicKey,
    /// Encrypted backup of our full persisted channel state.
    pub channel_data: Option<Vec<u8>>,
    pub next_funding_txid: Option<Txid>,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct SpliceInit {
    pub channel_id: ChannelId,
    /// Positive for splice-in, negative for splice-out.
    pub funding_contribution_sat: i64,
    pub funding_feerate_per_kw: u32,
    pub lock_time: u32,
    pub funding_pubkey: PublicKey,
    pub push_amount: Option<Amount>,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct SpliceAck {
    pub channel_id: ChannelId,
    pub funding_contribution_sat: i64,
    pub funding_pubkey: PublicKey,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct SpliceLocked {
    pub channel_id: ChannelId,
    pub splice_txid: Txid,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct PleaseOpenChannel {
    #[serde(with = "hexstr_or_bytes")]
    pub chain_hash: [u8; 32],
    #[serde(with = "hexstr_or_bytes")]
    pub request_id: [u8; 32],
    pub local_funding_amount_sat: u64,
    pub num_inputs: u16,
    pub total_input_weight: u32,
    /// Outpoints of the grandparent txs, for zero-conf risk scoring.
    pub grandparents: Vec<bitcoin::OutPoint>,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct PayToOpenRequest {
    #[serde(with = "hexstr_or_bytes")]
    pub chain_hash: [u8; 32],
    #[serde(with = "hexstr_or_bytes")]
    pub payment_hash: [u8; 32],
    pub amount: Amount,
    pub funding_sat: u64,
    pub mining_fee: Amount,
    pub service_fee: Amount,
    pub expire_at: u64,
    pub final_packet: OnionPacket,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum PayToOpenResult {
    Success {
        #[serde(with = "hexstr_or_bytes")]
        payment_preimage: [u8; 32],
    },
    Failure {
        reason: Vec<u8>,
    },
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct PayToOpenResponse {
    #[serde(with = "hexstr_or_bytes")]
    pub chain_hash: [u8; 32],
    #[serde(with = "hexstr_or_bytes")]
    pub payment_hash: [u8; 32],
    pub result: PayToOpenResult,
}

/// Info about a wallet migrated from the legacy Android app.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct LegacyInfo {
    pub has_channels: bool,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct FcmToken {
    pub token: String,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct OnionMessage {
    pub blinding_key: PublicKey,
    pub onion: Vec<u8>,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ChannelUpdate {
    pub signature: Signature,
    #[serde(with = "hexstr_or_bytes")]
    pub chain_hash: [u8; 32],
    pub short_channel_id: u64,
    pub timestamp: u32,
    pub message_flags: u8,
    pub channel_flags: u8,
    pub cltv_expiry_delta: u16,
    pub htlc_minimum: Amount,
    pub fee_base_msat: u32,
    pub fee_proportional_millionths: u32,
    pub htlc_maximum: Amount,
}

// --- The message enum --- //

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum LightningMessage {
    Init(Init),
    Error(ErrorMsg),
    Warning(WarningMsg),
    Ping(Ping),
    Pong(Pong),
    OpenChannel2(OpenChannel2),
    AcceptChannel2(AcceptChannel2),
    TxAddInput(TxAddInput),
    TxAddOutput(TxAddOutput),
    TxRemoveInput(TxRemoveInput),
    TxRemoveOutput(TxRemoveOutput),
    TxComplete(TxComplete),
    TxSignatures(TxSignatures),
    TxAbort(TxAbort),
    ChannelReady(ChannelReady),
    Shutdown(Shutdown),
    ClosingSigned(ClosingSigned),
    UpdateAddHtlc(UpdateAddHtlc),
    UpdateFulfillHtlc(UpdateFulfillHtlc),
    UpdateFailHtlc(UpdateFailHtlc),
    UpdateFailMalformedHtlc(UpdateFailMalformedHtlc),
    CommitmentSigned(CommitmentSigned),
    RevokeAndAck(RevokeAndAck),
    UpdateFee(UpdateFee),
    ChannelReestablish(ChannelReestablish),
    SpliceInit(SpliceInit),
    SpliceAck(SpliceAck),
    SpliceLocked(SpliceLocked),
    PleaseOpenChannel(PleaseOpenChannel),
    PayToOpenRequest(PayToOpenRequest),
    PayToOpenResponse(PayToOpenResponse),
    LegacyInfo(LegacyInfo),
    FcmToken(FcmToken),
    UnsetFcmToken,
    OnionMessage(OnionMessage),
    ChannelUpdate(ChannelUpdate),
}

impl LightningMessage {
    /// The raw 32-byte channel id this message is addressed to, if any.
    /// Funding-phase messages return the temporary channel id.
    pub fn channel_id(&self) -> Option<ChannelId> {
        use LightningMessage::*;
        match self {
            Error(m) => Some(m.channel_id),
            Warning(m) => Some(m.channel_id),
            OpenChannel2(m) => Some(m.temporary_channel_id),
            AcceptChannel2(m) => Some(m.temporary_channel_id),
            TxAddInput(m) => Some(m.channel_id),
            TxAddOutput(m) => Some(m.channel_id),
            TxRemoveInput(m) => Some(m.channel_id),
            TxRemoveOutput(m) => Some(m.channel_id),
            TxComplete(m) => Some(m.channel_id),
            TxSignatures(m) => Some(m.channel_id),
            TxAbort(m) => Some(m.channel_id),
            ChannelReady(m) => Some(m.channel_id),
            Shutdown(m) => Some(m.channel_id),
            ClosingSigned(m) => Some(m.channel_id),
            UpdateAddHtlc(m) => Some(m.channel_id),
            UpdateFulfillHtlc(m) => Some(m.channel_id),
            UpdateFailHtlc(m) => Some(m.channel_id),
            UpdateFailMalformedHtlc(m) => Some(m.channel_id),
            CommitmentSigned(m) => Some(m.channel_id),
            RevokeAndAck(m) => Some(m.channel_id),
            UpdateFee(m) => Some(m.channel_id),
            ChannelReestablish(m) => Some(m.channel_id),
            SpliceInit(m) => Some(m.channel_id),
            SpliceAck(m) => Some(m.channel_id),
            SpliceLocked(m) => Some(m.channel_id),
            Init(..) | Ping(..) | Pong(..) | PleaseOpenChannel(..)
            | PayToOpenRequest(..) | PayToOpenResponse(..) | LegacyInfo(..)
            | FcmToken(..) | UnsetFcmToken | OnionMessage(..)
            | ChannelUpdate(..) => None,
        }
    }

    pub fn msg_type(&self) -> u16 {
        use LightningMessage::*;
        match self {
            Init(..) => MSG_INIT,
            Error(..) => MSG_ERROR,
            Warning(..) => MSG_WARNING,
            Ping(..) => MSG_PING,
            Pong(..) => MSG_PONG,
            OpenChannel2(..) => MSG_OPEN_CHANNEL2,
            AcceptChannel2(..) => MSG_ACCEPT_CHANNEL2,
            TxAddInput(..) => MSG_TX_ADD_INPUT,
            TxAddOutput(..) => MSG_TX_ADD_OUTPUT,
            TxRemoveInput(..) => MSG_TX_REMOVE_INPUT,
            TxRemoveOutput(..) => MSG_TX_REMOVE_OUTPUT,
            TxComplete(..) => MSG_TX_COMPLETE,
            TxSignatures(..) => MSG_TX_SIGNATURES,
            TxAbort(..) => MSG_TX_ABORT,
            ChannelReady(..) => MSG_CHANNEL_READY,
            Shutdown(..) => MSG_SHUTDOWN,
            ClosingSigned(..) => MSG_CLOSING_SIGNED,
            UpdateAddHtlc(..) => MSG_UPDATE_ADD_HTLC,
            UpdateFulfillHtlc(..) => MSG_UPDATE_FULFILL_HTLC,
            UpdateFailHtlc(..) => MSG_UPDATE_FAIL_HTLC,
            UpdateFailMalformedHtlc(..) => MSG_UPDATE_FAIL_MALFORMED_HTLC,
            CommitmentSigned(..) => MSG_COMMITMENT_SIGNED,
            RevokeAndAck(..) => MSG_REVOKE_AND_ACK,
            UpdateFee(..) => MSG_UPDATE_FEE,
            ChannelReestablish(..) => MSG_CHANNEL_REESTABLISH,
            SpliceInit(..) => MSG_SPLICE_INIT,
            SpliceAck(..) => MSG_SPLICE_ACK,
            SpliceLocked(..) => MSG_SPLICE_LOCKED,
            PleaseOpenChannel(..) => MSG_PLEASE_OPEN_CHANNEL,
            PayToOpenRequest(..) => MSG_PAY_TO_OPEN_REQUEST,
            PayToOpenResponse(..) => MSG_PAY_TO_OPEN_RESPONSE,
            LegacyInfo(..) => MSG_LEGACY_INFO,
            FcmToken(..) => MSG_FCM_TOKEN,
            UnsetFcmToken => MSG_UNSET_FCM_TOKEN,
            OnionMessage(..) => MSG_ONION_MESSAGE,
            ChannelUpdate(..) => MSG_CHANNEL_UPDATE,
        }
    }

    /// Encode to the full wire form: `u16` type then body.
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Vec::with_capacity(64);
        w.put_u16(self.msg_type());
        self.write_body(&mut w);
        w
    }

    /// Decode a full wire frame. Returns `UnknownMessage` for message types
    /// we don't understand; the caller applies the odd/even rule.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut r = bytes;
        let msg_type = get_u16(&mut r)?;
        Self::read_body(msg_type, &mut r)
    }

    fn write_body(&self, w: &mut Vec<u8>) {
        use LightningMessage::*;
        match self {
            Init(m) => {
                // Empty global features for backwards compatibility.
                w.put_u16(0);
                put_prefixed_bytes(w, &m.features.0);
                let records = m
                    .tlvs
                    .iter()
                    .map(|(typ, value)| TlvRecord {
                        typ: *typ,
                        value: value.clone(),
                    })
                    .collect::<Vec<_>>();
                put_tlv_stream(w, &records);
            }
            Error(m) => {
                w.put_slice(&m.channel_id.0);
                put_prefixed_bytes(w, &m.data);
            }
            Warning(m) => {
                w.put_slice(&m.channel_id.0);
                put_prefixed_bytes(w, &m.data);
            }
            Ping(m) => {
                w.put_u16(m.num_pong_bytes);
                put_prefixed_bytes(w, &m.ignored);
            }
            Pong(m) => put_prefixed_bytes(w, &m.ignored),
            OpenChannel2(m) => {
                w.put_slice(&m.chain_hash);
                w.put_slice(&m.temporary_channel_id.0);
                w.put_u32(m.funding_feerate_per_kw);
                w.put_u32(m.commitment_feerate_per_kw);
                w.put_u64(m.funding_amount_sat);
                w.put_u64(m.dust_limit_sat);
                w.put_u64(m.max_htlc_value_in_flight.msat());
                w.put_u64(m.htlc_minimum.msat());
                w.put_u16(m.to_self_delay);
                w.put_u16(m.max_accepted_htlcs);
                w.put_u32(m.lock_time);
                put_pubkey(w, &m.funding_pubkey);
                put_pubkey(w, &m.revocation_basepoint);
                put_pubkey(w, &m.payment_basepoint);
                put_pubkey(w, &m.delayed_payment_basepoint);
                put_pubkey(w, &m.htlc_basepoint);
                put_pubkey(w, &m.first_per_commitment_point);
                put_pubkey(w, &m.second_per_commitment_point);
                w.put_u8(m.channel_flags);

                let mut records = Vec::new();
                if let Some(channel_type) = &m.channel_type {
                    records.push(TlvRecord {
                        typ: TLV_CHANNEL_TYPE,
                        value: channel_type.clone(),
                    });
                }
                if let Some(push_amount) = &m.push_amount {
                    records.push(TlvRecord {
                        typ: TLV_PUSH_AMOUNT,
                        value: push_amount.msat().to_be_bytes().to_vec(),
                    });
                }
                if let Some(origin) = &m.origin {
                    let mut value = Vec::new();
                    origin.write(&mut value);
                    records.push(TlvRecord { typ: TLV_ORIGIN, value });
                }
                put_tlv_stream(w, &records);
            }
            AcceptChannel2(m) => {
                w.put_slice(&m.temporary_channel_id.0);
                w.put_u64(m.funding_amount_sat);
                w.put_u64(m.dust_limit_sat);
                w.put_u64(m.max_htlc_value_in_flight.msat());
                w.put_u64(m.htlc_minimum.msat());
                w.put_u32(m.minimum_depth);
                w.put_u16(m.to_self_delay);
                w.put_u16(m.max_accepted_htlcs);
                put_pubkey(w, &m.funding_pubkey);
                put_pubkey(w, &m.revocation_basepoint);
                put_pubkey(w, &m.payment_basepoint);
                put_pubkey(w, &m.delayed_payment_basepoint);
                put_pubkey(w, &m.htlc_basepoint);
                put_pubkey(w, &m.first_per_commitment_point);
                put_pubkey(w, &m.second_per_commitment_point);

                let mut records = Vec::new();
                if let Some(channel_type) = &m.channel_type {
                    records.push(TlvRecord {
                        typ: TLV_CHANNEL_TYPE,
                        value: channel_type.clone(),
                    });
                }
                put_tlv_stream(w, &records);
            }
            TxAddInput(m) => {
                w.put_slice(&m.channel_id.0);
                w.put_u64(m.serial_id);
                put_tx(w, &m.prev_tx);
                w.put_u32(m.prev_tx_vout);
                w.put_u32(m.sequence);
            }
            TxAddOutput(m) => {
                w.put_slice(&m.channel_id.0);
                w.put_u64(m.serial_id);
                w.put_u64(m.amount_sat);
                put_script(w, &m.script_pubkey);
            }
            TxRemoveInput(m) => {
                w.put_slice(&m.channel_id.0);
                w.put_u64(m.serial_id);
            }
            TxRemoveOutput(m) => {
                w.put_slice(&m.channel_id.0);
                w.put_u64(m.serial_id);
            }
            TxComplete(m) => w.put_slice(&m.channel_id.0),
            TxSignatures(m) => {
                w.put_slice(&m.channel_id.0);
                put_txid(w, &m.txid);
                w.put_u16(m.witnesses.len() as u16);
                for witness in &m.witnesses {
                    put_witness(w, witness);
                }
            }
            TxAbort(m) => {
                w.put_slice(&m.channel_id.0);
                put_prefixed_bytes(w, &m.data);
            }
            ChannelReady(m) => {
                w.put_slice(&m.channel_id.0);
                put_pubkey(w, &m.next_per_commitment_point);
                let mut records = Vec::new();
                if let Some(alias) = m.short_channel_id_alias {
                    records.push(TlvRecord {
                        typ: TLV_SCID_ALIAS,
                        value: alias.to_be_bytes().to_vec(),
                    });
                }
                put_tlv_stream(w, &records);
            }
            Shutdown(m) => {
                w.put_slice(&m.channel_id.0);
                put_script(w, &m.script_pubkey);
            }
            ClosingSigned(m) => {
                w.put_slice(&m.channel_id.0);
                w.put_u64(m.fee_sat);
                put_signature(w, &m.signature);
                let mut records = Vec::new();
                if let Some((min, max)) = m.fee_range {
                    let mut value = Vec::new();
                    value.put_u64(min);
                    value.put_u64(max);
                    records.push(TlvRecord { typ: TLV_FEE_RANGE, value });
                }
                put_tlv_stream(w, &records);
            }
            UpdateAddHtlc(m) => {
                w.put_slice(&m.channel_id.0);
                w.put_u64(m.id);
                w.put_u64(m.amount.msat());
                w.put_slice(&m.payment_hash);
                w.put_u32(m.cltv_expiry);
                w.put_slice(&m.onion.0);
            }
            UpdateFulfillHtlc(m) => {
                w.put_slice(&m.channel_id.0);
                w.put_u64(m.id);
                w.put_slice(&m.payment_preimage);
            }
            UpdateFailHtlc(m) => {
                w.put_slice(&m.channel_id.0);
                w.put_u64(m.id);
                put_prefixed_bytes(w, &m.reason);
            }
            UpdateFailMalformedHtlc(m) => {
                w.put_slice(&m.channel_id.0);
                w.put_u64(m.id);
                w.put_slice(&m.sha256_of_onion);
                w.put_u16(m.failure_code);
            }
            CommitmentSigned(m) => {
                w.put_slice(&m.channel_id.0);
                put_signature(w, &m.signature);
                w.put_u16(m.htlc_signatures.len() as u16);
                for sig in &m.htlc_signatures {
                    put_signature(w, sig);
                }
                let mut records = Vec::new();
                if let Some(funding_txid) = &m.funding_txid {
                    let mut value = Vec::new();
                    put_txid(&mut value, funding_txid);
                    records.push(TlvRecord {
                        typ: TLV_FUNDING_TXID,
                        value,
                    });
                }
                put_tlv_stream(w, &records);
            }
            RevokeAndAck(m) => {
                w.put_slice(&m.channel_id.0);
                w.put_slice(&m.per_commitment_secret);
                put_pubkey(w, &m.next_per_commitment_point);
            }
            UpdateFee(m) => {
                w.put_slice(&m.channel_id.0);
                w.put_u32(m.feerate_per_kw);
            }
            ChannelReestablish(m) => {
                w.put_slice(&m.channel_id.0);
                w.put_u64(m.next_commitment_number);
                w.put_u64(m.next_revocation_number);
                w.put_slice(&m.your_last_per_commitment_secret);
                put_pubkey(w, &m.my_current_per_commitment_point);
                let mut records = Vec::new();
                if let Some(channel_data) = &m.channel_data {
                    records.push(TlvRecord {
                        typ: TLV_CHANNEL_DATA,
                        value: channel_data.clone(),
                    });
                }
                if let Some(next_funding_txid) = &m.next_funding_txid {
                    let mut value = Vec::new();
                    put_txid(&mut value, next_funding_txid);
                    records.push(TlvRecord {
                        typ: TLV_NEXT_FUNDING,
                        value,
                    });
                }
                put_tlv_stream(w, &records);
            }
            SpliceInit(m) => {
                w.put_slice(&m.channel_id.0);
                w.put_i64(m.funding_contribution_sat);
                w.put_u32(m.funding_feerate_per_kw);
                w.put_u32(m.lock_time);
                put_pubkey(w, &m.funding_pubkey);
                let mut records = Vec::new();
                if let Some(push_amount) = &m.push_amount {
                    records.push(TlvRecord {
                        typ: TLV_PUSH_AMOUNT,
                        value: push_amount.msat().to_be_bytes().to_vec(),
                    });
                }
                put_tlv_stream(w, &records);
            }
            SpliceAck(m) => {
                w.put_slice(&m.channel_id.0);
                w.put_i64(m.funding_contribution_sat);
                put_pubkey(w, &m.funding_pubkey);
            }
            SpliceLocked(m) => {
                w.put_slice(&m.channel_id.0);
                put_txid(w, &m.splice_txid);
            }
            PleaseOpenChannel(m) => {
                w.put_slice(&m.chain_hash);
                w.put_slice(&m.request_id);
                w.put_u64(m.local_funding_amount_sat);
                w.put_u16(m.num_inputs);
                w.put_u32(m.total_input_weight);
                w.put_u16(m.grandparents.len() as u16);
                for outpoint in &m.grandparents {
                    put_txid(w, &outpoint.txid);
                    w.put_u32(outpoint.vout);
                }
            }
            PayToOpenRequest(m) => {
                w.put_slice(&m.chain_hash);
                w.put_slice(&m.payment_hash);
                w.put_u64(m.amount.msat());
                w.put_u64(m.funding_sat);
                w.put_u64(m.mining_fee.msat());
                w.put_u64(m.service_fee.msat());
                w.put_u64(m.expire_at);
                put_prefixed_bytes(w, &m.final_packet.0);
            }
            PayToOpenResponse(m) => {
                w.put_slice(&m.chain_hash);
                w.put_slice(&m.payment_hash);
                match &m.result {
                    self::PayToOpenResult::Success { payment_preimage } => {
                        w.put_u8(0);
                        w.put_slice(payment_preimage);
                    }
                    self::PayToOpenResult::Failure { reason } => {
                        w.put_u8(1);
                        put_prefixed_bytes(w, reason);
                    }
                }
            }
            LegacyInfo(m) => w.put_u8(u8::from(m.has_channels)),
            FcmToken(m) => put_prefixed_bytes(w, m.token.as_bytes()),
            UnsetFcmToken => {}
            OnionMessage(m) => {
                put_pubkey(w, &m.blinding_key);
                put_prefixed_bytes(w, &m.onion);
            }
            ChannelUpdate(m) => {
                put_signature(w, &m.signature);
                w.put_slice(&m.chain_hash);
                w.put_u64(m.short_channel_id);
                w.put_u32(m.timestamp);
                w.put_u8(m.message_flags);
                w.put_u8(m.channel_flags);
                w.put_u16(m.cltv_expiry_delta);
                w.put_u64(m.htlc_minimum.msat());
                w.put_u32(m.fee_base_msat);
                w.put_u32(m.fee_proportional_millionths);
                w.put_u64(m.htlc_maximum.msat());
            }
        }
    }

    fn read_body(msg_type: u16, r: &mut &[u8]) -> Result<Self> {
        let msg = match msg_type {
            MSG_INIT => {
                let global_len = get_u16(r)? as usize;
                let _global = get_bytes(r, global_len)?;
                let features = Features(get_prefixed_bytes(r)?);
                let tlvs = get_tlv_stream(r)?
                    .into_iter()
                    .map(|record| (record.typ, record.value))
                    .collect();
                Self::Init(Init { features, tlvs })
            }
            MSG_ERROR => Self::Error(ErrorMsg {
                channel_id: ChannelId(get_array(r)?),
                data: get_prefixed_bytes(r)?,
            }),
            MSG_WARNING => Self::Warning(WarningMsg {
                channel_id: ChannelId(get_array(r)?),
                data: get_prefixed_bytes(r)?,
            }),
            MSG_PING => Self::Ping(Ping {
                num_pong_bytes: get_u16(r)?,
                ignored: get_prefixed_bytes(r)?,
            }),
            MSG_PONG => Self::Pong(Pong {
                ignored: get_prefixed_bytes(r)?,
            }),
            MSG_OPEN_CHANNEL2 => {
                let chain_hash = get_array(r)?;
                let temporary_channel_id = ChannelId(get_array(r)?);
                let funding_feerate_per_kw = get_u32(r)?;
                let commitment_feerate_per_kw = get_u32(r)?;
                let funding_amount_sat = get_u64(r)?;
                let dust_limit_sat = get_u64(r)?;
                let max_htlc_value_in_flight =
                    Amount::from_msat(get_u64(r)?);
                let htlc_minimum = Amount::from_msat(get_u64(r)?);
                let to_self_delay = get_u16(r)?;
                let max_accepted_htlcs = get_u16(r)?;
                let lock_time = get_u32(r)?;
                let funding_pubkey = get_pubkey(r)?;
                let revocation_basepoint = get_pubkey(r)?;
                let payment_basepoint = get_pubkey(r)?;
                let delayed_payment_basepoint = get_pubkey(r)?;
                let htlc_basepoint = get_pubkey(r)?;
                let first_per_commitment_point = get_pubkey(r)?;
                let second_per_commitment_point = get_pubkey(r)?;
                let channel_flags = get_u8(r)?;

                let mut channel_type = None;
                let mut push_amount = None;
                let mut origin = None;
                let mut unknown = Vec::new();
                for record in get_tlv_stream(r)? {
                    match record.typ {
                        TLV_CHANNEL_TYPE => channel_type = Some(record.value),
                        TLV_PUSH_AMOUNT => {
                            let mut v = record.value.as_slice();
                            push_amount =
                                Some(Amount::from_msat(get_u64(&mut v)?));
                        }
                        TLV_ORIGIN => {
                            let mut v = record.value.as_slice();
                            origin = Some(ChannelOrigin::read(&mut v)?);
                        }
                        _ => unknown.push(record),
                    }
                }
                reject_unknown_even(&unknown)?;

                Self::OpenChannel2(OpenChannel2 {
                    chain_hash,
                    temporary_channel_id,
                    funding_feerate_per_kw,
                    commitment_feerate_per_kw,
                    funding_amount_sat,
                    dust_limit_sat,
                    max_htlc_value_in_flight,
                    htlc_minimum,
                    to_self_delay,
                    max_accepted_htlcs,
                    lock_time,
                    funding_pubkey,
                    revocation_basepoint,
                    payment_basepoint,
                    delayed_payment_basepoint,
                    htlc_basepoint,
                    first_per_commitment_point,
                    second_per_commitment_point,
                    channel_flags,
                    channel_type,
                    push_amount,
                    origin,
                })
            }
            MSG_ACCEPT_CHANNEL2 => {
                let temporary_channel_id = ChannelId(get_array(r)?);
                let funding_amount_sat = get_u64(r)?;
                let dust_limit_sat = get_u64(r)?;
                let max_htlc_value_in_flight =
                    Amount::from_msat(get_u64(r)?);
                let htlc_minimum = Amount::from_msat(get_u64(r)?);
                let minimum_depth = get_u32(r)?;
                let to_self_delay = get_u16(r)?;
                let max_accepted_htlcs = get_u16(r)?;
                let funding_pubkey = get_pubkey(r)?;
                let revocation_basepoint = get_pubkey(r)?;
                let payment_basepoint = get_pubkey(r)?;
                let delayed_payment_basepoint = get_pubkey(r)?;
                let htlc_basepoint = get_pubkey(r)?;
                let first_per_commitment_point = get_pubkey(r)?;
                let second_per_commitment_point = get_pubkey(r)?;

                let mut channel_type = None;
                let mut unknown = Vec::new();
                for record in get_tlv_stream(r)? {
                    match record.typ {
                        TLV_CHANNEL_TYPE => channel_type = Some(record.value),
                        _ => unknown.push(record),
                    }
                }
                reject_unknown_even(&unknown)?;

                Self::AcceptChannel2(AcceptChannel2 {
                    temporary_channel_id,
                    funding_amount_sat,
                    dust_limit_sat,
                    max_htlc_value_in_flight,
                    htlc_minimum,
                    minimum_depth,
                    to_self_delay,
                    max_accepted_htlcs,
                    funding_pubkey,
                    revocation_basepoint,
                    payment_basepoint,
                    delayed_payment_basepoint,
                    htlc_basepoint,
                    first_per_commitment_point,
                    second_per_commitment_point,
                    channel_type,
                })
            }
            MSG_TX_ADD_INPUT => Self::TxAddInput(TxAddInput {
                channel_id: ChannelId(get_array(r)?),
                serial_id: get_u64(r)?,
                prev_tx: get_tx(r)?,
                prev_tx_vout: get_u32(r)?,
                sequence: get_u32(r)?,
            }),
            MSG_TX_ADD_OUTPUT => Self::TxAddOutput(TxAddOutput {
                channel_id: ChannelId(get_array(r)?),
                serial_id: get_u64(r)?,
                amount_sat: get_u64(r)?,
                script_pubkey: get_script(r)?,
            }),
            MSG_TX_REMOVE_INPUT => Self::TxRemoveInput(TxRemoveInput {
                channel_id: ChannelId(get_array(r)?),
                serial_id: get_u64(r)?,
            }),
            MSG_TX_REMOVE_OUTPUT => Self::TxRemoveOutput(TxRemoveOutput {
                channel_id: ChannelId(get_array(r)?),
                serial_id: get_u64(r)?,
            }),
            MSG_TX_COMPLETE => Self::TxComplete(TxComplete {
                channel_id: ChannelId(get_array(r)?),
            }),
            MSG_TX_SIGNATURES => {
                let channel_id = ChannelId(get_array(r)?);
                let txid = get_txid(r)?;
                let num_witnesses = get_u16(r)?;
                let mut witnesses = Vec::with_capacity(num_witnesses.into());
                for _ in 0..num_witnesses {
                    witnesses.push(get_witness(r)?);
                }
                Self::TxSignatures(TxSignatures {
                    channel_id,
                    txid,
                    witnesses,
                })
            }
            MSG_TX_ABORT => Self::TxAbort(TxAbort {
                channel_id: ChannelId(get_array(r)?),
                data: get_prefixed_bytes(r)?,
            }),
            MSG_CHANNEL_READY => {
                let channel_id = ChannelId(get_array(r)?);
                let next_per_commitment_point = get_pubkey(r)?;
                let mut short_channel_id_alias = None;
                let mut unknown = Vec::new();
                for record in get_tlv_stream(r)? {
                    match record.typ {
                        TLV_SCID_ALIAS => {
                            let mut v = record.value.as_slice();
                            short_channel_id_alias = Some(get_u64(&mut v)?);
                        }
                        _ => unknown.push(record),
                    }
                }
                reject_unknown_even(&unknown)?;
                Self::ChannelReady(ChannelReady {
                    channel_id,
                    next_per_commitment_point,
                    short_channel_id_alias,
                })
            }
            MSG_SHUTDOWN => Self::Shutdown(Shutdown {
                channel_id: ChannelId(get_array(r)?),
                script_pubkey: get_script(r)?,
            }),
            MSG_CLOSING_SIGNED => {
                let channel_id = ChannelId(get_array(r)?);
                let fee_sat = get_u64(r)?;
                let signature = get_signature(r)?;
                let mut fee_range = None;
                let mut unknown = Vec::new();
                for record in get_tlv_stream(r)? {
                    match record.typ {
                        TLV_FEE_RANGE => {
                            let mut v = record.value.as_slice();
                            fee_range =
                                Some((get_u64(&mut v)?, get_u64(&mut v)?));
                        }
                        _ => unknown.push(record),
                    }
                }
                reject_unknown_even(&unknown)?;
                Self::ClosingSigned(ClosingSigned {
                    channel_id,
                    fee_sat,
                    signature,
                    fee_range,
                })
            }
            MSG_UPDATE_ADD_HTLC => Self::UpdateAddHtlc(UpdateAddHtlc {
                channel_id: ChannelId(get_array(r)?),
                id: get_u64(r)?,
                amount: Amount::from_msat(get_u64(r)?),
                payment_hash: get_array(r)?,
                cltv_expiry: get_u32(r)?,
                onion: OnionPacket(get_bytes(r, ONION_PACKET_LEN)?),
            }),
            MSG_UPDATE_FULFILL_HTLC => {
                Self::UpdateFulfillHtlc(UpdateFulfillHtlc {
                    channel_id: ChannelId(get_array(r)?),
                    id: get_u64(r)?,
                    payment_preimage: get_array(r)?,
                })
            }
            MSG_UPDATE_FAIL_HTLC => Self::UpdateFailHtlc(UpdateFailHtlc {
                channel_id: ChannelId(get_array(r)?),
                id: get_u64(r)?,
                reason: get_prefixed_bytes(r)?,
            }),
            MSG_UPDATE_FAIL_MALFORMED_HTLC => {
                Self::UpdateFailMalformedHtlc(UpdateFailMalformedHtlc {
                    channel_id: ChannelId(get_array(r)?),
                    id: get_u64(r)?,
                    sha256_of_onion: get_array(r)?,
                    failure_code: get_u16(r)?,
                })
            }
            MSG_COMMITMENT_SIGNED => {
                let channel_id = ChannelId(get_array(r)?);
                let signature = get_signature(r)?;
                let num_htlcs = get_u16(r)?;
                let mut htlc_signatures =
                    Vec::with_capacity(num_htlcs.into());
                for _ in 0..num_htlcs {
                    htlc_signatures.push(get_signature(r)?);
                }
                let mut funding_txid = None;
                let mut unknown = Vec::new();
                for record in get_tlv_stream(r)? {
                    match record.typ {
                        TLV_FUNDING_TXID => {
                            let mut v = record.value.as_slice();
                            funding_txid = Some(get_txid(&mut v)?);
                        }
                        _ => unknown.push(record),
                    }
                }
                reject_unknown_even(&unknown)?;
                Self::CommitmentSigned(CommitmentSigned {
                    channel_id,
                    signature,
                    htlc_signatures,
                    funding_txid,
                })
            }
            MSG_REVOKE_AND_ACK => Self::RevokeAndAck(RevokeAndAck {
                channel_id: ChannelId(get_array(r)?),
                per_commitment_secret: get_array(r)?,
                next_per_commitment_point: get_pubkey(r)?,
            }),
            MSG_UPDATE_FEE => Self::UpdateFee(UpdateFee {
                channel_id: ChannelId(get_array(r)?),
                feerate_per_kw: get_u32(r)?,
            }),
            MSG_CHANNEL_REESTABLISH => {
                let channel_id = ChannelId(get_array(r)?);
                let next_commitment_number = get_u64(r)?;
                let next_revocation_number = get_u64(r)?;
                let your_last_per_commitment_secret = get_array(r)?;
                let my_current_per_commitment_point = get_pubkey(r)?;
                let mut channel_data = None;
                let mut next_funding_txid = None;
                let mut unknown = Vec::new();
                for record in get_tlv_stream(r)? {
                    match record.typ {
                        TLV_CHANNEL_DATA => channel_data = Some(record.value),
                        TLV_NEXT_FUNDING => {
                            let mut v = record.value.as_slice();
                            next_funding_txid = Some(get_txid(&mut v)?);
                        }
                        _ => unknown.push(record),
                    }
                }
                reject_unknown_even(&unknown)?;
                Self::ChannelReestablish(ChannelReestablish {
                    channel_id,
                    next_commitment_number,
                    next_revocation_number,
                    your_last_per_commitment_secret,
                    my_current_per_commitment_point,
                    channel_data,
                    next_funding_txid,
                })
            }
            MSG_SPLICE_INIT => {
                let channel_id = ChannelId(get_array(r)?);
                let funding_contribution_sat = get_i64(r)?;
                let funding_feerate_per_kw = get_u32(r)?;
                let lock_time = get_u32(r)?;
                let funding_pubkey = get_pubkey(r)?;
                let mut push_amount = None;
                let mut unknown = Vec::new();
                for record in get_tlv_stream(r)? {
                    match record.typ {
                        TLV_PUSH_AMOUNT => {
                            let mut v = record.value.as_slice();
                            push_amount =
                                Some(Amount::from_msat(get_u64(&mut v)?));
                        }
                        _ => unknown.push(record),
                    }
                }
                reject_unknown_even(&unknown)?;
                Self::SpliceInit(SpliceInit {
                    channel_id,
                    funding_contribution_sat,
                    funding_feerate_per_kw,
                    lock_time,
                    funding_pubkey,
                    push_amount,
                })
            }
            MSG_SPLICE_ACK => Self::SpliceAck(SpliceAck {
                channel_id: ChannelId(get_array(r)?),
                funding_contribution_sat: get_i64(r)?,
                funding_pubkey: get_pubkey(r)?,
            }),
            MSG_SPLICE_LOCKED => Self::SpliceLocked(SpliceLocked {
                channel_id: ChannelId(get_array(r)?),
                splice_txid: get_txid(r)?,
            }),
            MSG_PLEASE_OPEN_CHANNEL => {
                let chain_hash = get_array(r)?;
                let request_id = get_array(r)?;
                let local_funding_amount_sat = get_u64(r)?;
                let num_inputs = get_u16(r)?;
                let total_input_weight = get_u32(r)?;
                let num_grandparents = get_u16(r)?;
                let mut grandparents =
                    Vec::with_capacity(num_grandparents.into());
                for _ in 0..num_grandparents {
                    let txid = get_txid(r)?;
                    let vout = get_u32(r)?;
                    grandparents.push(bitcoin::OutPoint::new(txid, vout));
                }
                Self::PleaseOpenChannel(PleaseOpenChannel {
                    chain_hash,
                    request_id,
                    local_funding_amount_sat,
                    num_inputs,
                    total_input_weight,
                    grandparents,
                })
            }
            MSG_PAY_TO_OPEN_REQUEST => {
                Self::PayToOpenRequest(PayToOpenRequest {
                    chain_hash: get_array(r)?,
                    payment_hash: get_array(r)?,
                    amount: Amount::from_msat(get_u64(r)?),
                    funding_sat: get_u64(r)?,
                    mining_fee: Amount::from_msat(get_u64(r)?),
                    service_fee: Amount::from_msat(get_u64(r)?),
                    expire_at: get_u64(r)?,
                    final_packet: OnionPacket(get_prefixed_bytes(r)?),
                })
            }
            MSG_PAY_TO_OPEN_RESPONSE => {
                let chain_hash = get_array(r)?;
                let payment_hash = get_array(r)?;
                let result = match get_u8(r)? {
                    0 => PayToOpenResult::Success {
                        payment_preimage: get_array(r)?,
                    },
                    1 => PayToOpenResult::Failure {
                        reason: get_prefixed_bytes(r)?,
                    },
                    _ => return Err(WireError::Invalid("pay_to_open result")),
                };
                Self::PayToOpenResponse(PayToOpenResponse {
                    chain_hash,
                    payment_hash,
                    result,
                })
            }
            MSG_LEGACY_INFO => Self::LegacyInfo(LegacyInfo {
                has_channels: get_u8(r)? != 0,
            }),
            MSG_FCM_TOKEN => {
                let bytes = get_prefixed_bytes(r)?;
                let token = String::from_utf8(bytes)
                    .map_err(|_| WireError::Invalid("fcm token"))?;
                Self::FcmToken(FcmToken { token })
            }
            MSG_UNSET_FCM_TOKEN => Self::UnsetFcmToken,
            MSG_ONION_MESSAGE => Self::OnionMessage(OnionMessage {
                blinding_key: get_pubkey(r)?,
                onion: get_prefixed_bytes(r)?,
            }),
            MSG_CHANNEL_UPDATE => Self::ChannelUpdate(ChannelUpdate {
                signature: get_signature(r)?,
                chain_hash: get_array(r)?,
                short_channel_id: get_u64(r)?,
                timestamp: get_u32(r)?,
                message_flags: get_u8(r)?,
                channel_flags: get_u8(r)?,
                cltv_expiry_delta: get_u16(r)?,
                htlc_minimum: Amount::from_msat(get_u64(r)?),
                fee_base_msat: get_u32(r)?,
                fee_proportional_millionths: get_u32(r)?,
                htlc_maximum: Amount::from_msat(get_u64(r)?),
            }),
            other => return Err(WireError::UnknownMessage(other)),
        };
        Ok(msg)
    }
}

/// Whether an unknown message type may be safely ignored (odd) or must be
/// treated as a protocol error (even).
pub fn unknown_type_is_odd(msg_type: u16) -> bool {
    msg_type % 2 == 1
}

#[cfg(test)]
mod test {
    use std::str::FromStr;

    use bitcoin::secp256k1::{Secp256k1, SecretKey};

    use super::*;

    fn pubkey(byte: u8) -> PublicKey {
        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(&[byte; 32]).unwrap();
        PublicKey::from_secret_key(&secp, &sk)
    }

    fn signature() -> Signature {
        // Any valid compact signature works for codec tests.
        Signature::from_compact(&[0x01; 64]).unwrap()
    }

    fn roundtrip(msg: LightningMessage) {
        let encoded = msg.encode();
        let decoded = LightningMessage::decode(&encoded).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn roundtrip_control_messages() {
        roundtrip(LightningMessage::Init(Init {
            features: Features(vec![0x20, 0x02]),
            tlvs: vec![(1, vec![0x43, 0xe8])],
        }));
        roundtrip(LightningMessage::Error(ErrorMsg::new(
            ChannelId([7; 32]),
            "internal error",
        )));
        roundtrip(LightningMessage::Ping(Ping {
            num_pong_bytes: 12,
            ignored: vec![0; 3],
        }));
        roundtrip(LightningMessage::Pong(Pong { ignored: vec![0; 12] }));
        roundtrip(LightningMessage::FcmToken(FcmToken {
            token: "token123".to_owned(),
        }));
        roundtrip(LightningMessage::UnsetFcmToken);
        roundtrip(LightningMessage::LegacyInfo(LegacyInfo {
            has_channels: true,
        }));
    }

    #[test]
    fn roundtrip_htlc_messages() {
        roundtrip(LightningMessage::UpdateAddHtlc(UpdateAddHtlc {
            channel_id: ChannelId([1; 32]),
            id: 7,
            amount: Amount::from_msat(150_000),
            payment_hash: [0xab; 32],
            cltv_expiry: 700_000,
            onion: OnionPacket::blank(),
        }));
        roundtrip(LightningMessage::UpdateFulfillHtlc(UpdateFulfillHtlc {
            channel_id: ChannelId([1; 32]),
            id: 7,
            payment_preimage: [0xcd; 32],
        }));
        roundtrip(LightningMessage::UpdateFailHtlc(UpdateFailHtlc {
            channel_id: ChannelId([1; 32]),
            id: 7,
            reason: vec![0xde, 0xad],
        }));
        roundtrip(LightningMessage::CommitmentSigned(CommitmentSigned {
            channel_id: ChannelId([1; 32]),
            signature: signature(),
            htlc_signatures: vec![signature(), signature()],
            funding_txid: Some(Txid::from_str(
                "4242424242424242424242424242424242424242424242424242424242424242",
            ).unwrap()),
        }));
        roundtrip(LightningMessage::RevokeAndAck(RevokeAndAck {
            channel_id: ChannelId([1; 32]),
            per_commitment_secret: [0x11; 32],
            next_per_commitment_point: pubkey(3),
        }));
    }

    #[test]
    fn roundtrip_funding_messages() {
        roundtrip(LightningMessage::OpenChannel2(OpenChannel2 {
            chain_hash: [6; 32],
            temporary_channel_id: ChannelId([2; 32]),
            funding_feerate_per_kw: 2_500,
            commitment_feerate_per_kw: 2_500,
            funding_amount_sat: 200_000,
            dust_limit_sat: 546,
            max_htlc_value_in_flight: Amount::from_msat(150_000_000),
            htlc_minimum: Amount::from_msat(1),
            to_self_delay: 720,
            max_accepted_htlcs: 30,
            lock_time: 0,
            funding_pubkey: pubkey(1),
            revocation_basepoint: pubkey(2),
            payment_basepoint: pubkey(3),
            delayed_payment_basepoint: pubkey(4),
            htlc_basepoint: pubkey(5),
            first_per_commitment_point: pubkey(6),
            second_per_commitment_point: pubkey(7),
            channel_flags: 0,
            channel_type: Some(vec![0x10, 0x10, 0x00]),
            push_amount: Some(Amount::from_msat(42_000)),
            origin: Some(ChannelOrigin::PleaseOpenChannel {
                request_id: [9; 32],
                service_fee: Amount::from_msat(1_000_000),
                mining_fee: Amount::from_sat(300),
            }),
        }));
        roundtrip(LightningMessage::TxAddOutput(TxAddOutput {
            channel_id: ChannelId([2; 32]),
            serial_id: 4,
            amount_sat: 250_000,
            script_pubkey: ScriptBuf::new(),
        }));
        roundtrip(LightningMessage::TxComplete(TxComplete {
            channel_id: ChannelId([2; 32]),
        }));
        roundtrip(LightningMessage::TxAbort(TxAbort::new(
            ChannelId([2; 32]),
            "duplicate serial id",
        )));
        roundtrip(LightningMessage::SpliceInit(SpliceInit {
            channel_id: ChannelId([2; 32]),
            funding_contribution_sat: -25_000,
            funding_feerate_per_kw: 3_000,
            lock_time: 0,
            funding_pubkey: pubkey(8),
            push_amount: None,
        }));
    }

    #[test]
    fn roundtrip_reestablish_with_backup() {
        roundtrip(LightningMessage::ChannelReestablish(ChannelReestablish {
            channel_id: ChannelId([3; 32]),
            next_commitment_number: 42,
            next_revocation_number: 41,
            your_last_per_commitment_secret: [0x77; 32],
            my_current_per_commitment_point: pubkey(9),
            channel_data: Some(vec![0x01, 0x02, 0x03]),
            next_funding_txid: None,
        }));
    }

    #[test]
    fn roundtrip_pay_to_open() {
        roundtrip(LightningMessage::PleaseOpenChannel(PleaseOpenChannel {
            chain_hash: [6; 32],
            request_id: [0x55; 32],
            local_funding_amount_sat: 120_000,
            num_inputs: 2,
            total_input_weight: 552,
            grandparents: vec![bitcoin::OutPoint::null()],
        }));
        roundtrip(LightningMessage::PayToOpenRequest(PayToOpenRequest {
            chain_hash: [6; 32],
            payment_hash: [0xaa; 32],
            amount: Amount::from_msat(99_000),
            funding_sat: 100_000,
            mining_fee: Amount::from_sat(150),
            service_fee: Amount::from_msat(1_000),
            expire_at: 1_700_000_000,
            final_packet: OnionPacket(vec![0x0b; 120]),
        }));
        roundtrip(LightningMessage::PayToOpenResponse(PayToOpenResponse {
            chain_hash: [6; 32],
            payment_hash: [0xaa; 32],
            result: PayToOpenResult::Success {
                payment_preimage: [0xbb; 32],
            },
        }));
    }

    #[test]
    fn unknown_message_types_follow_odd_even_rule() {
        // 25000 is even: must be treated as an error by the caller.
        let mut even = Vec::new();
        even.put_u16(25_000u16);
        assert_eq!(
            LightningMessage::decode(&even),
            Err(WireError::UnknownMessage(25_000)),
        );
        assert!(!unknown_type_is_odd(25_000));
        assert!(unknown_type_is_odd(25_001));
    }

    #[test]
    fn features_bit_indexing() {
        // 0x0200_0000 == bit 25 in a 4-byte vector.
        let features = Features(vec![0x02, 0x00, 0x00, 0x00]);
        assert!(features.supports(25));
        assert!(!features.supports(24));
        assert_eq!(features.unknown_even_bit(&[]), None);

        let features = Features(vec![0x01, 0x00]); // bit 8, even
        assert_eq!(features.unknown_even_bit(&[]), Some(8));
        assert_eq!(features.unknown_even_bit(&[8]), None);
    }
}
