//! A thin facade over [`lightning_invoice`], which owns Bolt 11 encoding,
//! signing, and checksum rules. This module adds serde, our newtypes, and
//! the invoice-creation entry point used by the incoming payment handler.

use std::{fmt, str::FromStr, time::Duration};

use bitcoin::{
    hashes::{sha256, Hash},
    secp256k1::{All, PublicKey, Secp256k1, SecretKey},
    Network,
};
use common::amount::Amount;
use lightning_invoice::{
    Bolt11Invoice, Currency, InvoiceBuilder, RouteHint, RouteHintHop,
    RoutingFees,
};
use serde_with::{DeserializeFromStr, SerializeDisplay};

use crate::payments::{PaymentHash, PaymentPreimage, PaymentSecret};

/// Default invoice expiry when the caller doesn't pick one.
pub const DEFAULT_EXPIRY_SECS: u64 = 3_600;

/// The default `min_final_cltv_expiry_delta` we encode into our invoices.
pub const MIN_FINAL_CLTV_EXPIRY_DELTA: u64 = 144;

/// A signed Bolt 11 invoice.
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(SerializeDisplay, DeserializeFromStr)]
pub struct Invoice(pub Bolt11Invoice);

impl Invoice {
    pub fn payment_hash(&self) -> PaymentHash {
        PaymentHash(self.0.payment_hash().to_byte_array())
    }

    pub fn payment_secret(&self) -> PaymentSecret {
        PaymentSecret(self.0.payment_secret().0)
    }

    pub fn amount(&self) -> Option<Amount> {
        self.0.amount_milli_satoshis().map(Amount::from_msat)
    }

    pub fn min_final_cltv_expiry_delta(&self) -> u64 {
        self.0.min_final_cltv_expiry_delta()
    }

    pub fn is_expired(&self) -> bool {
        self.0.is_expired()
    }

    pub fn payee_node_id(&self) -> PublicKey {
        self.0.recover_payee_pub_key()
    }
}

impl fmt::Display for Invoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for Invoice {
    type Err = lightning_invoice::ParseOrSemanticError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Bolt11Invoice::from_str(s).map(Self)
    }
}

/// The description committed into an invoice: a string, or the SHA-256 of a
/// longer description kept elsewhere.
#[derive(Clone, Debug)]
pub enum InvoiceDescription {
    Direct(String),
    Hash([u8; 32]),
}

/// The single virtual hop hinted in our invoices: senders route to our
/// trampoline peer, which forwards to us over a (possibly not yet existing)
/// channel.
#[derive(Copy, Clone, Debug)]
pub struct ExtraHop {
    pub node_id: PublicKey,
    pub short_channel_id: u64,
    pub fee_base_msat: u32,
    pub fee_proportional_millionths: u32,
    pub cltv_expiry_delta: u16,
}

/// Everything needed to build and sign an invoice.
pub struct NewInvoice<'a> {
    pub network: Network,
    pub preimage: PaymentPreimage,
    pub payment_secret: PaymentSecret,
    pub amount: Option<Amount>,
    pub description: InvoiceDescription,
    pub expiry: Option<Duration>,
    pub extra_hop: ExtraHop,
    pub node_secret: &'a SecretKey,
}

/// Build and sign a Bolt 11 invoice with the node key.
pub fn create_invoice(
    secp: &Secp256k1<All>,
    new: NewInvoice<'_>,
) -> anyhow::Result<Invoice> {
    let currency = match new.network {
        Network::Bitcoin => Currency::Bitcoin,
        Network::Testnet => Currency::BitcoinTestnet,
        Network::Signet => Currency::Signet,
        _ => Currency::Regtest,
    };

    let hint = RouteHint(vec![RouteHintHop {
        src_node_id: new.extra_hop.node_id,
        short_channel_id: new.extra_hop.short_channel_id,
        fees: RoutingFees {
            base_msat: new.extra_hop.fee_base_msat,
            proportional_millionths: new
                .extra_hop
                .fee_proportional_millionths,
        },
        cltv_expiry_delta: new.extra_hop.cltv_expiry_delta,
        htlc_minimum_msat: None,
        htlc_maximum_msat: None,
    }]);

    let payment_hash =
        sha256::Hash::from_byte_array(new.preimage.payment_hash().0);
    let expiry = new
        .expiry
        .unwrap_or(Duration::from_secs(DEFAULT_EXPIRY_SECS));

    let builder = InvoiceBuilder::new(currency)
        .payment_hash(payment_hash)
        .payment_secret(lightning_invoice::PaymentSecret(
            new.payment_secret.0,
        ))
        .current_timestamp()
        .expiry_time(expiry)
        .min_final_cltv_expiry_delta(MIN_FINAL_CLTV_EXPIRY_DELTA)
        .private_route(hint)
        .basic_mpp();

    let builder = match new.amount {
        Some(amount) => builder.amount_milli_satoshis(amount.msat()),
        None => builder,
    };

    let node_secret = new.node_secret;
    let invoice = match new.description {
        InvoiceDescription::Direct(description) => builder
            .description(description)
            .build_signed(|hash| {
                secp.sign_ecdsa_recoverable(hash, node_secret)
            })?,
        InvoiceDescription::Hash(hash_bytes) => builder
            .description_hash(sha256::Hash::from_byte_array(hash_bytes))
            .build_signed(|hash| {
                secp.sign_ecdsa_recoverable(hash, node_secret)
            })?,
    };

    Ok(Invoice(invoice))
}

#[cfg(test)]
mod test {
    use common::rng::FastRng;
    use rand_core::RngCore;

    use super::*;

    fn test_keys() -> (Secp256k1<All>, SecretKey, PublicKey) {
        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(&[0x42; 32]).unwrap();
        let pk = PublicKey::from_secret_key(&secp, &sk);
        (secp, sk, pk)
    }

    #[test]
    fn created_invoice_roundtrips_and_validates() {
        let (secp, node_secret, _) = test_keys();
        let mut rng = FastRng::from_u64(7);
        let mut preimage_bytes = [0u8; 32];
        rng.fill_bytes(&mut preimage_bytes);
        let preimage = PaymentPreimage(preimage_bytes);

        // The hinted hop is our trampoline peer.
        let peer_secret = SecretKey::from_slice(&[0x43; 32]).unwrap();
        let peer_node_id = PublicKey::from_secret_key(&secp, &peer_secret);

        let invoice = create_invoice(
            &secp,
            NewInvoice {
                network: Network::Regtest,
                preimage,
                payment_secret: PaymentSecret([9u8; 32]),
                amount: Some(Amount::from_msat(150_000)),
                description: InvoiceDescription::Direct(
                    "coffee".to_owned(),
                ),
                expiry: None,
                extra_hop: ExtraHop {
                    node_id: peer_node_id,
                    short_channel_id: 42,
                    fee_base_msat: 1_000,
                    fee_proportional_millionths: 100,
                    cltv_expiry_delta: 144,
                },
                node_secret: &node_secret,
            },
        )
        .unwrap();

        assert_eq!(invoice.payment_hash(), preimage.payment_hash());
        assert_eq!(invoice.amount(), Some(Amount::from_msat(150_000)));
        assert_eq!(invoice.payment_secret(), PaymentSecret([9u8; 32]));
        assert!(!invoice.is_expired());

        // Display -> FromStr roundtrip.
        let reparsed = Invoice::from_str(&invoice.to_string()).unwrap();
        assert_eq!(reparsed, invoice);
        assert_eq!(
            reparsed.payee_node_id(),
            PublicKey::from_secret_key(&secp, &node_secret),
        );
    }
}
