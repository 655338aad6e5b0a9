use hex::ToHex;
use once_cell::sync::OnceCell;
pub use primitive_types::U256;
use primitive_types::H256;
use rlp_derive::{RlpDecodable, RlpEncodable};
use serde::{Serialize, Serializer};
use sha3::Digest;

use std::fmt;
use std::ops::Deref;
use std::str::FromStr;

/// Amount of the chain's native coin. Arithmetic is always checked: the
/// supply-accounting code never wraps silently.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Debug, Default)]
pub struct Coin(U256);

#[derive(Clone, PartialEq, Eq, Hash, Default, Debug)]
pub struct Hash(H256);

#[derive(Clone, Default)]
pub struct Bytes(Vec<u8>);

/// Gas is metered with plain 64-bit integers per request; block-level totals
/// are accumulated as [U256].
pub type Gas = u64;

// Coin

impl Coin {
    #[inline(always)]
    pub fn checked_add(&self, other: &Coin) -> Option<Coin> {
        Some(Coin(self.0.checked_add(other.0)?))
    }

    #[inline(always)]
    pub fn checked_sub(&self, other: &Coin) -> Option<Coin> {
        Some(Coin(self.0.checked_sub(other.0)?))
    }

    #[inline(always)]
    pub fn checked_mul(&self, other: &Coin) -> Option<Coin> {
        Some(Coin(self.0.checked_mul(other.0)?))
    }

    #[inline(always)]
    pub fn saturating_sub(&self, other: &Coin) -> Coin {
        Coin(self.0.saturating_sub(other.0))
    }

    #[inline]
    pub fn zero() -> &'static Self {
        static V: OnceCell<Coin> = OnceCell::new();
        V.get_or_init(|| U256::zero().into())
    }

    #[inline(always)]
    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    #[inline(always)]
    pub fn min(&self, other: &Coin) -> Coin {
        Coin(std::cmp::min(self.0, other.0))
    }
}

impl From<U256> for Coin {
    fn from(u: U256) -> Self {
        Self(u)
    }
}

impl From<u64> for Coin {
    fn from(u: u64) -> Self {
        Self(u.into())
    }
}

impl From<Coin> for U256 {
    fn from(c: Coin) -> Self {
        c.0
    }
}

impl AsRef<U256> for Coin {
    fn as_ref(&self) -> &U256 {
        &self.0
    }
}

impl FromStr for Coin {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, ()> {
        Ok(Self(U256::from_str(s).map_err(|_| ())?))
    }
}

impl fmt::Display for Coin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl Serialize for Coin {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("0x{:x}", &self.0))
    }
}

// Hash

impl Hash {
    #[inline(always)]
    pub fn hash(slice: &[u8]) -> Self {
        Self::from_slice(sha3::Keccak256::digest(slice).as_slice())
    }

    #[inline]
    pub fn zero() -> &'static Self {
        static V: OnceCell<Hash> = OnceCell::new();
        V.get_or_init(|| Self(H256::zero()))
    }

    #[inline(always)]
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    #[inline(always)]
    pub fn from_slice(s: &[u8]) -> Self {
        Self(H256::from_slice(s))
    }

    #[inline]
    pub fn to_fixed_bytes(self) -> [u8; 32] {
        self.0.to_fixed_bytes()
    }
}

impl From<[u8; 32]> for Hash {
    fn from(u: [u8; 32]) -> Self {
        Self(u.into())
    }
}

impl FromStr for Hash {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, ()> {
        Ok(Self(H256::from_str(s).map_err(|_| ())?))
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl Serialize for Hash {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        BytesRef::serialize(&BytesRef(self.as_bytes()), serializer)
    }
}

// Bytes

impl Bytes {
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.0
    }
}

impl From<Vec<u8>> for Bytes {
    fn from(v: Vec<u8>) -> Self {
        Self(v)
    }
}

impl From<&[u8]> for Bytes {
    fn from(s: &[u8]) -> Self {
        Self(s.into())
    }
}

impl Deref for Bytes {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl PartialEq for Bytes {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for Bytes {}

impl fmt::Display for Bytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        <BytesRef as fmt::LowerHex>::fmt(&BytesRef(self), f)
    }
}

impl fmt::Debug for Bytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        <BytesRef as fmt::LowerHex>::fmt(&BytesRef(self), f)
    }
}

impl rlp::Encodable for Bytes {
    fn rlp_append(&self, s: &mut rlp::RlpStream) {
        s.encoder().encode_value(self)
    }
}

impl rlp::Decodable for Bytes {
    fn decode(rlp: &rlp::Rlp) -> Result<Self, rlp::DecoderError> {
        rlp.decoder().decode_value(|bytes| Ok(Self(bytes.to_vec())))
    }
}

pub struct BytesRef<'a>(&'a [u8]);

impl<'a> From<&'a [u8]> for BytesRef<'a> {
    fn from(s: &'a [u8]) -> Self {
        Self(s)
    }
}

impl<'a> fmt::LowerHex for BytesRef<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.encode_hex::<String>())
    }
}

impl<'a> Serialize for BytesRef<'a> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("0x{:x}", &self))
    }
}

// NOTE: adapted from https://docs.rs/impl-rlp/latest/src/impl_rlp/lib.rs.html
macro_rules! impl_wrapped_uint_rlp {
    ($name: ident, $wrapper_name: ident, $size: expr) => {
        impl rlp::Encodable for $wrapper_name {
            fn rlp_append(&self, s: &mut rlp::RlpStream) {
                let leading_empty_bytes = $size * 8 - (self.0.bits() + 7) / 8;
                let mut buffer = [0u8; $size * 8];
                self.0.to_big_endian(&mut buffer);
                s.encoder().encode_value(&buffer[leading_empty_bytes..]);
            }
        }

        impl rlp::Decodable for $wrapper_name {
            fn decode(rlp: &rlp::Rlp) -> Result<Self, rlp::DecoderError> {
                rlp.decoder().decode_value(|bytes| {
                    if !bytes.is_empty() && bytes[0] == 0 {
                        Err(rlp::DecoderError::RlpInvalidIndirection)
                    } else if bytes.len() <= $size * 8 {
                        Ok($wrapper_name($name::from(bytes)))
                    } else {
                        Err(rlp::DecoderError::RlpIsTooBig)
                    }
                })
            }
        }
    };
}

macro_rules! impl_wrapped_fixed_hash_rlp {
    ($name: ident, $wrapper_name: ident, $size: expr) => {
        impl rlp::Encodable for $wrapper_name {
            fn rlp_append(&self, s: &mut rlp::RlpStream) {
                s.encoder().encode_value(self.0.as_ref());
            }
        }

        impl rlp::Decodable for $wrapper_name {
            fn decode(rlp: &rlp::Rlp) -> Result<Self, rlp::DecoderError> {
                rlp.decoder().decode_value(|bytes| {
                    match bytes.len().cmp(&$size) {
                        core::cmp::Ordering::Less => {
                            Err(rlp::DecoderError::RlpIsTooShort)
                        }
                        core::cmp::Ordering::Greater => {
                            Err(rlp::DecoderError::RlpIsTooBig)
                        }
                        core::cmp::Ordering::Equal => {
                            let mut t = [0u8; $size];
                            t.copy_from_slice(bytes);
                            Ok($wrapper_name($name(t)))
                        }
                    }
                })
            }
        }
    };
}

impl_wrapped_uint_rlp!(U256, Coin, 4);
impl_wrapped_fixed_hash_rlp!(H256, Hash, 32);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct U256RLP(pub U256);
impl_wrapped_uint_rlp!(U256, U256RLP, 4);

/// Content-addressed primary key of a request: the keccak hash of its
/// canonical byte encoding. Also keys the matching response and appears in
/// object histories.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct TransactionReference(Hash);

impl TransactionReference {
    #[inline(always)]
    pub fn hash(encoded: &[u8]) -> Self {
        Self(Hash::hash(encoded))
    }

    #[inline(always)]
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    #[inline(always)]
    pub fn from_slice(s: &[u8]) -> Self {
        Self(Hash::from_slice(s))
    }
}

impl From<Hash> for TransactionReference {
    fn from(h: Hash) -> Self {
        Self(h)
    }
}

impl fmt::Display for TransactionReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl rlp::Encodable for TransactionReference {
    fn rlp_append(&self, s: &mut rlp::RlpStream) {
        self.0.rlp_append(s)
    }
}

impl rlp::Decodable for TransactionReference {
    fn decode(rlp: &rlp::Rlp) -> Result<Self, rlp::DecoderError> {
        Ok(Self(Hash::decode(rlp)?))
    }
}

/// Identity of a persistent object: the transaction that created it plus a
/// progressive number distinguishing the objects created by that same
/// transaction. Never reused.
#[derive(Clone, PartialEq, Eq, Hash, Debug, RlpEncodable, RlpDecodable)]
pub struct StorageReference {
    pub transaction: TransactionReference,
    pub progressive: u64,
}

impl StorageReference {
    pub fn new(transaction: TransactionReference, progressive: u64) -> Self {
        Self {
            transaction,
            progressive,
        }
    }

    /// Flat byte form, used as a lookup key by the persistence layer.
    pub fn to_key(&self) -> Vec<u8> {
        let mut key = self.transaction.as_bytes().to_vec();
        key.extend_from_slice(&self.progressive.to_le_bytes());
        key
    }
}

impl fmt::Display for StorageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.transaction, self.progressive)
    }
}

/// Externally visible identity of a snapshot: the content hash of its trie
/// root. The all-zero id denotes the empty (genesis) store.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct StateId([u8; 32]);

impl StateId {
    #[inline]
    pub fn zero() -> &'static Self {
        static V: OnceCell<StateId> = OnceCell::new();
        V.get_or_init(|| Self([0; 32]))
    }

    #[inline(always)]
    pub fn is_zero(&self) -> bool {
        self == Self::zero()
    }

    #[inline(always)]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn from_slice(s: &[u8]) -> Option<Self> {
        Some(Self(s.try_into().ok()?))
    }
}

impl From<[u8; 32]> for StateId {
    fn from(u: [u8; 32]) -> Self {
        Self(u)
    }
}

impl fmt::Display for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", BytesRef(&self.0))
    }
}

impl Serialize for StateId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        BytesRef::serialize(&BytesRef(&self.0), serializer)
    }
}

/// Scalar value of an object field, also the argument and return currency of
/// method calls. The engine never interprets values beyond moving them; only
/// the manifest introspection decodes specific variants.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum StorageValue {
    Null,
    Bool(bool),
    I64(i64),
    U256(U256),
    Str(String),
    Ref(StorageReference),
}

const VALUE_NULL: u8 = 0x0;
const VALUE_BOOL: u8 = 0x1;
const VALUE_I64: u8 = 0x2;
const VALUE_U256: u8 = 0x3;
const VALUE_STR: u8 = 0x4;
const VALUE_REF: u8 = 0x5;

impl rlp::Encodable for StorageValue {
    fn rlp_append(&self, s: &mut rlp::RlpStream) {
        let s = s.begin_list(2);
        match self {
            StorageValue::Null => s.append(&VALUE_NULL).append_empty_data(),
            StorageValue::Bool(b) => s.append(&VALUE_BOOL).append(b),
            // two's complement, so negative inflation survives the trip
            StorageValue::I64(x) => s.append(&VALUE_I64).append(&(*x as u64)),
            StorageValue::U256(x) => {
                s.append(&VALUE_U256).append(&U256RLP(*x))
            }
            StorageValue::Str(x) => s.append(&VALUE_STR).append(x),
            StorageValue::Ref(x) => s.append(&VALUE_REF).append(x),
        };
    }
}

impl rlp::Decodable for StorageValue {
    fn decode(rlp: &rlp::Rlp) -> Result<Self, rlp::DecoderError> {
        Ok(match rlp.val_at::<u8>(0)? {
            VALUE_NULL => StorageValue::Null,
            VALUE_BOOL => StorageValue::Bool(rlp.val_at(1)?),
            VALUE_I64 => StorageValue::I64(rlp.val_at::<u64>(1)? as i64),
            VALUE_U256 => StorageValue::U256(rlp.val_at::<U256RLP>(1)?.0),
            VALUE_STR => StorageValue::Str(rlp.val_at(1)?),
            VALUE_REF => StorageValue::Ref(rlp.val_at(1)?),
            _ => return Err(rlp::DecoderError::Custom("bad value tag")),
        })
    }
}

#[inline(always)]
pub fn checked_as_u64(x: &U256) -> Option<u64> {
    if x > &u64::MAX.into() {
        None
    } else {
        Some(x.as_u64())
    }
}

#[test]
fn test_storage_reference_key() {
    let t = TransactionReference::hash(b"genesis");
    let r0 = StorageReference::new(t.clone(), 0);
    let r1 = StorageReference::new(t.clone(), 1);
    assert_ne!(r0.to_key(), r1.to_key());
    assert_eq!(&r0.to_key()[..32], t.as_bytes());
}

#[test]
fn test_state_id_zero() {
    assert!(StateId::zero().is_zero());
    assert!(!StateId::from([1; 32]).is_zero());
    assert_eq!(
        StateId::from_slice(StateId::zero().as_bytes()),
        Some(StateId::zero().clone())
    );
}
