//! Seams for onion-routing cryptography. The sphinx construction itself
//! (ephemeral-key ratcheting, HMAC chaining, error wrapping) is an
//! external collaborator; the engine consumes these interfaces and ships
//! deterministic fakes for tests.

use bitcoin::secp256k1::{PublicKey, SecretKey};
use common::amount::Amount;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    payments::PaymentSecret,
    wire::OnionPacket,
};

#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum OnionError {
    #[error("onion payload could not be decrypted")]
    Undecryptable,

    #[error("onion payload is malformed")]
    Malformed,

    #[error("onion is not addressed to us")]
    NotForUs,
}

// --- Payment onions --- //

/// The final-hop payload of a payment onion addressed to us.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct FinalPayload {
    pub amount: Amount,
    /// Total amount of the MPP set this part belongs to.
    pub total_amount: Amount,
    pub cltv_expiry: u32,
    pub payment_secret: PaymentSecret,
}

/// The decoded failure of one of our outgoing HTLCs.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct DecodedFailure {
    pub code: u16,
    pub message: String,
}

impl DecodedFailure {
    /// BOLT 4: the PERM bit marks failures that will not resolve by
    /// retrying the same route.
    pub fn is_permanent(&self) -> bool {
        self.code & 0x4000 != 0
    }
}

/// Peel / build payment onions.
pub trait PaymentSphinx: Send + Sync {
    /// Peel the final hop of a payment onion addressed to us.
    fn peel_to_final(
        &self,
        node_secret: &SecretKey,
        payment_hash: &[u8; 32],
        onion: &OnionPacket,
    ) -> Result<FinalPayload, OnionError>;

    /// Build a trampoline payment onion to `recipient` for one part.
    fn build_payment_onion(
        &self,
        recipient: &PublicKey,
        payload: &FinalPayload,
    ) -> OnionPacket;

    /// Decode an encrypted failure blob from one of our outgoing HTLCs.
    fn decode_failure(
        &self,
        reason: &[u8],
    ) -> Result<DecodedFailure, OnionError>;
}

// --- Onion messages --- //

/// A blinded route to some recipient: an introduction point plus opaque
/// per-hop payloads only the route builder could assemble.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct BlindedRoute {
    pub intro_node_id: PublicKey,
    pub blinding_key: PublicKey,
    /// Opaque per-hop data; decrypted hop-by-hop by the sphinx layer.
    pub encrypted_hops: Vec<Vec<u8>>,
}

/// One peel step of an onion message.
#[derive(Clone, Debug)]
pub enum PeeledMessage {
    /// The message terminates at us.
    Deliver {
        path_id: Option<[u8; 32]>,
        payload: Vec<u8>,
        reply_path: Option<BlindedRoute>,
    },
    /// The next hop is us again (self-padding): peel again.
    SelfRelay(crate::wire::OnionMessage),
    /// Addressed to someone else; we do not relay third-party traffic.
    Drop,
}

/// Peel / build onion messages.
pub trait MessageSphinx: Send + Sync {
    fn peel(
        &self,
        node_secret: &SecretKey,
        msg: &crate::wire::OnionMessage,
    ) -> Result<PeeledMessage, OnionError>;

    /// Build an onion message over `route`, optionally asking the
    /// recipient to answer over `reply_path`.
    fn build(
        &self,
        route: &BlindedRoute,
        path_id: Option<[u8; 32]>,
        payload: &[u8],
        reply_path: Option<BlindedRoute>,
    ) -> crate::wire::OnionMessage;

    /// Blind a route over the given hops (successive DH blinding in the
    /// real implementation).
    fn build_route(&self, hops: &[PublicKey]) -> BlindedRoute;
}

// --- Test fakes --- //

/// A structurally-faithful fake: payloads are serialized rather than
/// encrypted, and "blinding" is the recipient's identity key.
pub mod fake {
    use bitcoin::secp256k1::{Secp256k1, SecretKey};

    use super::*;

    #[derive(Serialize, Deserialize)]
    struct FakeMessageOnion {
        /// Remaining hops, identified by their real node ids.
        hops: Vec<PublicKey>,
        path_id: Option<[u8; 32]>,
        payload: Vec<u8>,
        reply_path: Option<BlindedRoute>,
    }

    #[derive(Default)]
    pub struct FakePaymentSphinx;

    impl PaymentSphinx for FakePaymentSphinx {
        fn peel_to_final(
            &self,
            _node_secret: &SecretKey,
            _payment_hash: &[u8; 32],
            onion: &OnionPacket,
        ) -> Result<FinalPayload, OnionError> {
            serde_json::from_slice(&onion.0)
                .map_err(|_| OnionError::Malformed)
        }

        fn build_payment_onion(
            &self,
            _recipient: &PublicKey,
            payload: &FinalPayload,
        ) -> OnionPacket {
            OnionPacket(
                serde_json::to_vec(payload)
                    .expect("payload serializes"),
            )
        }

        fn decode_failure(
            &self,
            reason: &[u8],
        ) -> Result<DecodedFailure, OnionError> {
            serde_json::from_slice(reason)
                .map_err(|_| OnionError::Malformed)
        }
    }

    #[derive(Default)]
    pub struct FakeMessageSphinx;

    impl MessageSphinx for FakeMessageSphinx {
        fn peel(
            &self,
            node_secret: &SecretKey,
            msg: &crate::wire::OnionMessage,
        ) -> Result<PeeledMessage, OnionError> {
            let secp = Secp256k1::new();
            let me = PublicKey::from_secret_key(&secp, node_secret);
            let mut onion: FakeMessageOnion =
                serde_json::from_slice(&msg.onion)
                    .map_err(|_| OnionError::Malformed)?;

            let Some(hop) = onion.hops.first().copied() else {
                return Err(OnionError::Malformed);
            };
            if hop != me {
                return Ok(PeeledMessage::Drop);
            }
            onion.hops.remove(0);

            match onion.hops.first() {
                None => Ok(PeeledMessage::Deliver {
                    path_id: onion.path_id,
                    payload: onion.payload,
                    reply_path: onion.reply_path,
                }),
                Some(next) if *next == me =>
                    Ok(PeeledMessage::SelfRelay(crate::wire::OnionMessage {
                        blinding_key: me,
                        onion: serde_json::to_vec(&onion)
                            .expect("onion serializes"),
                    })),
                Some(..) => Ok(PeeledMessage::Drop),
            }
        }

        fn build(
            &self,
            route: &BlindedRoute,
            path_id: Option<[u8; 32]>,
            payload: &[u8],
            reply_path: Option<BlindedRoute>,
        ) -> crate::wire::OnionMessage {
            let hops = route
                .encrypted_hops
                .iter()
                .map(|hop| {
                    PublicKey::from_slice(hop)
                        .expect("fake hops are serialized pubkeys")
                })
                .collect();
            let onion = FakeMessageOnion {
                hops,
                path_id,
                payload: payload.to_vec(),
                reply_path,
            };
            crate::wire::OnionMessage {
                blinding_key: route.blinding_key,
                onion: serde_json::to_vec(&onion)
                    .expect("onion serializes"),
            }
        }

        fn build_route(&self, hops: &[PublicKey]) -> BlindedRoute {
            BlindedRoute {
                intro_node_id: hops[0],
                blinding_key: hops[0],
                encrypted_hops: hops
                    .iter()
                    .map(|pk| pk.serialize().to_vec())
                    .collect(),
            }
        }
    }
}
