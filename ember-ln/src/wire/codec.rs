//! Low-level wire codec primitives: big-endian integers, BigSize varints,
//! compact crypto types, and TLV streams.
//!
//! Readers take `&mut &[u8]` so partially-consumed input can thread through
//! struct decoders; writers append to a `Vec<u8>`.

use bitcoin::{
    consensus,
    hashes::Hash,
    secp256k1::{ecdsa::Signature, PublicKey},
    ScriptBuf, Transaction, Txid, Witness,
};
use bytes::{Buf, BufMut};
use thiserror::Error;

/// Errors produced while encoding or decoding wire messages.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum WireError {
    #[error("unexpected end of input")]
    UnexpectedEof,

    #[error("unknown message type {0}")]
    UnknownMessage(u16),

    #[error("unknown even tlv type {0}")]
    UnknownEvenTlv(u64),

    #[error("tlv records not in strictly ascending order")]
    TlvOrder,

    #[error("non-canonical bigsize encoding")]
    NonCanonicalBigSize,

    #[error("invalid value for {0}")]
    Invalid(&'static str),
}

pub type Result<T> = std::result::Result<T, WireError>;

// --- Primitive readers --- //

fn ensure_remaining(r: &&[u8], n: usize) -> Result<()> {
    if r.remaining() < n {
        Err(WireError::UnexpectedEof)
    } else {
        Ok(())
    }
}

pub fn get_u8(r: &mut &[u8]) -> Result<u8> {
    ensure_remaining(r, 1)?;
    Ok(r.get_u8())
}

pub fn get_u16(r: &mut &[u8]) -> Result<u16> {
    ensure_remaining(r, 2)?;
    Ok(r.get_u16())
}

pub fn get_u32(r: &mut &[u8]) -> Result<u32> {
    ensure_remaining(r, 4)?;
    Ok(r.get_u32())
}

pub fn get_u64(r: &mut &[u8]) -> Result<u64> {
    ensure_remaining(r, 8)?;
    Ok(r.get_u64())
}

pub fn get_i64(r: &mut &[u8]) -> Result<i64> {
    ensure_remaining(r, 8)?;
    Ok(r.get_i64())
}

pub fn get_bytes(r: &mut &[u8], n: usize) -> Result<Vec<u8>> {
    ensure_remaining(r, n)?;
    let mut out = vec![0u8; n];
    r.copy_to_slice(&mut out);
    Ok(out)
}

pub fn get_array<const N: usize>(r: &mut &[u8]) -> Result<[u8; N]> {
    ensure_remaining(r, N)?;
    let mut out = [0u8; N];
    r.copy_to_slice(&mut out);
    Ok(out)
}

/// A `u16`-length-prefixed byte string.
pub fn get_prefixed_bytes(r: &mut &[u8]) -> Result<Vec<u8>> {
    let len = get_u16(r)? as usize;
    get_bytes(r, len)
}

pub fn put_prefixed_bytes(w: &mut Vec<u8>, bytes: &[u8]) {
    debug_assert!(bytes.len() <= usize::from(u16::MAX));
    w.put_u16(bytes.len() as u16);
    w.put_slice(bytes);
}

// --- BigSize --- //

/// Read a BigSize varint, rejecting non-canonical encodings.
pub fn get_bigsize(r: &mut &[u8]) -> Result<u64> {
    let first = get_u8(r)?;
    match first {
        0..=0xfc => Ok(u64::from(first)),
        0xfd => {
            let val = u64::from(get_u16(r)?);
            if val < 0xfd {
                return Err(WireError::NonCanonicalBigSize);
            }
            Ok(val)
        }
        0xfe => {
            let val = u64::from(get_u32(r)?);
            if val <= u64::from(u16::MAX) {
                return Err(WireError::NonCanonicalBigSize);
            }
            Ok(val)
        }
        0xff => {
            let val = get_u64(r)?;
            if val <= u64::from(u32::MAX) {
                return Err(WireError::NonCanonicalBigSize);
            }
            Ok(val)
        }
    }
}

pub fn put_bigsize(w: &mut Vec<u8>, value: u64) {
    if value < 0xfd {
        w.put_u8(value as u8);
    } else if value <= u64::from(u16::MAX) {
        w.put_u8(0xfd);
        w.put_u16(value as u16);
    } else if value <= u64::from(u32::MAX) {
        w.put_u8(0xfe);
        w.put_u32(value as u32);
    } else {
        w.put_u8(0xff);
        w.put_u64(value);
    }
}

// --- Crypto / bitcoin types --- //

pub fn get_pubkey(r: &mut &[u8]) -> Result<PublicKey> {
    let bytes = get_array::<33>(r)?;
    PublicKey::from_slice(&bytes).map_err(|_| WireError::Invalid("pubkey"))
}

pub fn put_pubkey(w: &mut Vec<u8>, pubkey: &PublicKey) {
    w.put_slice(&pubkey.serialize());
}

pub fn get_signature(r: &mut &[u8]) -> Result<Signature> {
    let bytes = get_array::<64>(r)?;
    Signature::from_compact(&bytes)
        .map_err(|_| WireError::Invalid("signature"))
}

pub fn put_signature(w: &mut Vec<u8>, sig: &Signature) {
    w.put_slice(&sig.serialize_compact());
}

pub fn get_txid(r: &mut &[u8]) -> Result<Txid> {
    get_array::<32>(r).map(Txid::from_byte_array)
}

pub fn put_txid(w: &mut Vec<u8>, txid: &Txid) {
    w.put_slice(&txid.to_byte_array());
}

/// A `u16`-length-prefixed script.
pub fn get_script(r: &mut &[u8]) -> Result<ScriptBuf> {
    get_prefixed_bytes(r).map(ScriptBuf::from_bytes)
}

pub fn put_script(w: &mut Vec<u8>, script: &ScriptBuf) {
    put_prefixed_bytes(w, script.as_bytes());
}

/// A `u16`-length-prefixed consensus-serialized transaction.
pub fn get_tx(r: &mut &[u8]) -> Result<Transaction> {
    let bytes = get_prefixed_bytes(r)?;
    consensus::deserialize(&bytes).map_err(|_| WireError::Invalid("tx"))
}

pub fn put_tx(w: &mut Vec<u8>, tx: &Transaction) {
    put_prefixed_bytes(w, &consensus::serialize(tx));
}

/// A witness stack: element count, then `u16`-prefixed elements.
pub fn get_witness(r: &mut &[u8]) -> Result<Witness> {
    let num_elements = get_u16(r)?;
    let mut witness = Witness::new();
    for _ in 0..num_elements {
        witness.push(get_prefixed_bytes(r)?);
    }
    Ok(witness)
}

pub fn put_witness(w: &mut Vec<u8>, witness: &Witness) {
    w.put_u16(witness.len() as u16);
    for element in witness.iter() {
        put_prefixed_bytes(w, element);
    }
}

// --- TLV streams --- //

/// One record of a TLV stream, value still undecoded.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TlvRecord {
    pub typ: u64,
    pub value: Vec<u8>,
}

/// Read a TLV stream to the end of the input. Types must be strictly
/// ascending.
pub fn get_tlv_stream(r: &mut &[u8]) -> Result<Vec<TlvRecord>> {
    let mut records = Vec::new();
    let mut last_typ: Option<u64> = None;
    while r.has_remaining() {
        let typ = get_bigsize(r)?;
        if let Some(last) = last_typ {
            if typ <= last {
                return Err(WireError::TlvOrder);
            }
        }
        last_typ = Some(typ);
        let len = get_bigsize(r)? as usize;
        let value = get_bytes(r, len)?;
        records.push(TlvRecord { typ, value });
    }
    Ok(records)
}

/// Write a TLV stream. Records must already be sorted by type.
pub fn put_tlv_stream(w: &mut Vec<u8>, records: &[TlvRecord]) {
    debug_assert!(records.windows(2).all(|r| r[0].typ < r[1].typ));
    for record in records {
        put_bigsize(w, record.typ);
        put_bigsize(w, record.value.len() as u64);
        w.put_slice(&record.value);
    }
}

/// Apply the BOLT odd/even rule to TLV records the decoder didn't consume:
/// unknown even types are errors, unknown odd types are ignored.
pub fn reject_unknown_even(records: &[TlvRecord]) -> Result<()> {
    match records.iter().find(|r| r.typ % 2 == 0) {
        Some(record) => Err(WireError::UnknownEvenTlv(record.typ)),
        None => Ok(()),
    }
}

#[cfg(test)]
mod test {
    use proptest::prelude::*;

    use super::*;

    proptest! {
        #[test]
        fn bigsize_roundtrip_any_u64(value: u64) {
            let mut buf = Vec::new();
            put_bigsize(&mut buf, value);
            let mut r = buf.as_slice();
            prop_assert_eq!(get_bigsize(&mut r).unwrap(), value);
            prop_assert!(r.is_empty());
        }

        #[test]
        fn prefixed_bytes_roundtrip(bytes: Vec<u8>) {
            prop_assume!(bytes.len() <= usize::from(u16::MAX));
            let mut buf = Vec::new();
            put_prefixed_bytes(&mut buf, &bytes);
            let mut r = buf.as_slice();
            prop_assert_eq!(get_prefixed_bytes(&mut r).unwrap(), bytes);
        }
    }

    #[test]
    fn bigsize_roundtrip_and_canonicality() {
        for value in [0u64, 0xfc, 0xfd, 0xffff, 0x10000, u64::MAX] {
            let mut buf = Vec::new();
            put_bigsize(&mut buf, value);
            let mut r = buf.as_slice();
            assert_eq!(get_bigsize(&mut r).unwrap(), value);
            assert!(r.is_empty());
        }

        // 0xfc encoded with the 0xfd prefix is non-canonical.
        let mut r: &[u8] = &[0xfd, 0x00, 0xfc];
        assert_eq!(
            get_bigsize(&mut r),
            Err(WireError::NonCanonicalBigSize),
        );
    }

    #[test]
    fn tlv_stream_enforces_order() {
        let records = vec![
            TlvRecord { typ: 1, value: vec![0xaa] },
            TlvRecord { typ: 3, value: vec![] },
        ];
        let mut buf = Vec::new();
        put_tlv_stream(&mut buf, &records);
        let mut r = buf.as_slice();
        assert_eq!(get_tlv_stream(&mut r).unwrap(), records);

        // 3 before 1 must be rejected.
        let mut bad = Vec::new();
        put_bigsize(&mut bad, 3);
        put_bigsize(&mut bad, 0);
        put_bigsize(&mut bad, 1);
        put_bigsize(&mut bad, 1);
        bad.push(0xaa);
        let mut r = bad.as_slice();
        assert_eq!(get_tlv_stream(&mut r), Err(WireError::TlvOrder));
    }

    #[test]
    fn unknown_even_tlv_is_an_error() {
        let odd_only = [TlvRecord { typ: 7, value: vec![] }];
        assert_eq!(reject_unknown_even(&odd_only), Ok(()));

        let with_even = [
            TlvRecord { typ: 7, value: vec![] },
            TlvRecord { typ: 8, value: vec![] },
        ];
        assert_eq!(
            reject_unknown_even(&with_even),
            Err(WireError::UnknownEvenTlv(8)),
        );
    }

    #[test]
    fn truncated_reads_fail_cleanly() {
        let mut r: &[u8] = &[0x01];
        assert_eq!(get_u32(&mut r), Err(WireError::UnexpectedEof));
        let mut r: &[u8] = &[];
        assert_eq!(get_u8(&mut r), Err(WireError::UnexpectedEof));
    }
}
