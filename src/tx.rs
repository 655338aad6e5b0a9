use std::io::Write;

use once_cell::sync::OnceCell;
use rlp_derive::{RlpDecodable, RlpEncodable};
use sha3::Digest;

use crate::common::{
    Bytes, Coin, Gas, Hash, StorageReference, StorageValue,
    TransactionReference, U256, U256RLP,
};

/// A submitted transaction. The set of kinds is closed: dispatch happens
/// exactly once, at the delivery boundary, over this enum.
///
/// A request is content-addressed by [Request::reference], the hash of its
/// canonical encoding; two byte-identical requests are the same transaction.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Request {
    /// Store a code module on behalf of a paying account.
    CodeInstall(CodeInstallRequest),
    /// Store a code module with no payer; only accepted before the node is
    /// initialized (it seeds the base classpath).
    SystemCodeInstall(SystemCodeInstallRequest),
    /// Create a seed account holding part of the initial supply; only
    /// accepted before the node is initialized.
    GenesisAccount(GenesisAccountRequest),
    /// Run a constructor, creating one object.
    ConstructorCall(ConstructorCallRequest),
    /// Run a method on a target object.
    InstanceCall(InstanceCallRequest),
    /// Run a static method of a class.
    StaticCall(StaticCallRequest),
    /// Unsigned, gas-free call synthesized by the engine itself (validator
    /// rewards, coinbase). Never accepted from the outside.
    SystemCall(SystemCallRequest),
    /// Mark the node as initialized by installing the manifest.
    Initialization(InitializationRequest),
}

#[derive(Clone, PartialEq, Eq, Debug, RlpEncodable, RlpDecodable)]
pub struct Signature {
    pub r: U256RLP,
    pub s: U256RLP,
    pub v: U256RLP,
}

#[derive(Clone, PartialEq, Eq, Debug, RlpEncodable, RlpDecodable)]
pub struct CodeInstallRequest {
    pub caller: StorageReference,
    pub nonce: u64,
    pub gas_limit: Gas,
    pub gas_price: Coin,
    pub classpath: TransactionReference,
    pub module: Bytes,
    pub deps: Vec<TransactionReference>,
    pub sig: Signature,
}

#[derive(Clone, PartialEq, Eq, Debug, RlpEncodable, RlpDecodable)]
pub struct SystemCodeInstallRequest {
    pub module: Bytes,
    pub deps: Vec<TransactionReference>,
}

#[derive(Clone, PartialEq, Eq, Debug, RlpEncodable, RlpDecodable)]
pub struct GenesisAccountRequest {
    pub amount: Coin,
    pub public_key: String,
    pub classpath: TransactionReference,
}

#[derive(Clone, PartialEq, Eq, Debug, RlpEncodable, RlpDecodable)]
pub struct ConstructorCallRequest {
    pub caller: StorageReference,
    pub nonce: u64,
    pub gas_limit: Gas,
    pub gas_price: Coin,
    pub classpath: TransactionReference,
    pub class: String,
    pub args: Vec<StorageValue>,
    pub sig: Signature,
}

#[derive(Clone, PartialEq, Eq, Debug, RlpEncodable, RlpDecodable)]
pub struct InstanceCallRequest {
    pub caller: StorageReference,
    pub nonce: u64,
    pub gas_limit: Gas,
    pub gas_price: Coin,
    pub classpath: TransactionReference,
    pub receiver: StorageReference,
    pub method: String,
    pub args: Vec<StorageValue>,
    pub sig: Signature,
}

#[derive(Clone, PartialEq, Eq, Debug, RlpEncodable, RlpDecodable)]
pub struct StaticCallRequest {
    pub caller: StorageReference,
    pub nonce: u64,
    pub gas_limit: Gas,
    pub gas_price: Coin,
    pub classpath: TransactionReference,
    pub class: String,
    pub method: String,
    pub args: Vec<StorageValue>,
    pub sig: Signature,
}

#[derive(Clone, PartialEq, Eq, Debug, RlpEncodable, RlpDecodable)]
pub struct SystemCallRequest {
    pub caller: StorageReference,
    pub nonce: u64,
    pub receiver: StorageReference,
    pub method: String,
    pub args: Vec<StorageValue>,
}

#[derive(Clone, PartialEq, Eq, Debug, RlpEncodable, RlpDecodable)]
pub struct InitializationRequest {
    pub classpath: TransactionReference,
    pub manifest: StorageReference,
}

impl Request {
    const CODE_INSTALL: u8 = 0x0;
    const SYSTEM_CODE_INSTALL: u8 = 0x1;
    const GENESIS_ACCOUNT: u8 = 0x2;
    const CONSTRUCTOR_CALL: u8 = 0x3;
    const INSTANCE_CALL: u8 = 0x4;
    const STATIC_CALL: u8 = 0x5;
    const SYSTEM_CALL: u8 = 0x6;
    const INITIALIZATION: u8 = 0x7;

    /// Canonical byte encoding: one kind tag followed by the RLP of the
    /// payload. [Request::reference] hashes exactly these bytes.
    pub fn encode(&self) -> Vec<u8> {
        let (tag, payload) = match self {
            Request::CodeInstall(p) => (Self::CODE_INSTALL, rlp::encode(p)),
            Request::SystemCodeInstall(p) => {
                (Self::SYSTEM_CODE_INSTALL, rlp::encode(p))
            }
            Request::GenesisAccount(p) => {
                (Self::GENESIS_ACCOUNT, rlp::encode(p))
            }
            Request::ConstructorCall(p) => {
                (Self::CONSTRUCTOR_CALL, rlp::encode(p))
            }
            Request::InstanceCall(p) => (Self::INSTANCE_CALL, rlp::encode(p)),
            Request::StaticCall(p) => (Self::STATIC_CALL, rlp::encode(p)),
            Request::SystemCall(p) => (Self::SYSTEM_CALL, rlp::encode(p)),
            Request::Initialization(p) => {
                (Self::INITIALIZATION, rlp::encode(p))
            }
        };
        let mut buff = vec![tag];
        buff.write(payload.as_ref()).unwrap();
        buff
    }

    pub fn decode(bytes: &[u8]) -> Option<Request> {
        if bytes.is_empty() {
            return None
        }
        let rlp = rlp::Rlp::new(&bytes[1..]);
        Some(match bytes[0] {
            Self::CODE_INSTALL => Request::CodeInstall(rlp.as_val().ok()?),
            Self::SYSTEM_CODE_INSTALL => {
                Request::SystemCodeInstall(rlp.as_val().ok()?)
            }
            Self::GENESIS_ACCOUNT => {
                Request::GenesisAccount(rlp.as_val().ok()?)
            }
            Self::CONSTRUCTOR_CALL => {
                Request::ConstructorCall(rlp.as_val().ok()?)
            }
            Self::INSTANCE_CALL => Request::InstanceCall(rlp.as_val().ok()?),
            Self::STATIC_CALL => Request::StaticCall(rlp.as_val().ok()?),
            Self::SYSTEM_CALL => Request::SystemCall(rlp.as_val().ok()?),
            Self::INITIALIZATION => {
                Request::Initialization(rlp.as_val().ok()?)
            }
            _ => return None,
        })
    }

    #[inline]
    pub fn reference(&self) -> TransactionReference {
        TransactionReference::hash(&self.encode())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Request::CodeInstall(_) => "code install",
            Request::SystemCodeInstall(_) => "system code install",
            Request::GenesisAccount(_) => "genesis account",
            Request::ConstructorCall(_) => "constructor call",
            Request::InstanceCall(_) => "instance call",
            Request::StaticCall(_) => "static call",
            Request::SystemCall(_) => "system call",
            Request::Initialization(_) => "initialization",
        }
    }

    /// System requests carry no payer: they are unsigned, consume no gas and
    /// do not enter the reward bookkeeping.
    pub fn is_system(&self) -> bool {
        matches!(
            self,
            Request::SystemCodeInstall(_) |
                Request::GenesisAccount(_) |
                Request::SystemCall(_) |
                Request::Initialization(_)
        )
    }

    pub fn caller(&self) -> Option<&StorageReference> {
        match self {
            Request::CodeInstall(p) => Some(&p.caller),
            Request::ConstructorCall(p) => Some(&p.caller),
            Request::InstanceCall(p) => Some(&p.caller),
            Request::StaticCall(p) => Some(&p.caller),
            Request::SystemCall(p) => Some(&p.caller),
            _ => None,
        }
    }

    pub fn nonce(&self) -> Option<u64> {
        match self {
            Request::CodeInstall(p) => Some(p.nonce),
            Request::ConstructorCall(p) => Some(p.nonce),
            Request::InstanceCall(p) => Some(p.nonce),
            Request::StaticCall(p) => Some(p.nonce),
            Request::SystemCall(p) => Some(p.nonce),
            _ => None,
        }
    }

    pub fn gas_limit(&self) -> Option<Gas> {
        match self {
            Request::CodeInstall(p) => Some(p.gas_limit),
            Request::ConstructorCall(p) => Some(p.gas_limit),
            Request::InstanceCall(p) => Some(p.gas_limit),
            Request::StaticCall(p) => Some(p.gas_limit),
            _ => None,
        }
    }

    pub fn gas_price(&self) -> Option<&Coin> {
        match self {
            Request::CodeInstall(p) => Some(&p.gas_price),
            Request::ConstructorCall(p) => Some(&p.gas_price),
            Request::InstanceCall(p) => Some(&p.gas_price),
            Request::StaticCall(p) => Some(&p.gas_price),
            _ => None,
        }
    }

    pub fn classpath(&self) -> Option<&TransactionReference> {
        match self {
            Request::CodeInstall(p) => Some(&p.classpath),
            Request::GenesisAccount(p) => Some(&p.classpath),
            Request::ConstructorCall(p) => Some(&p.classpath),
            Request::InstanceCall(p) => Some(&p.classpath),
            Request::StaticCall(p) => Some(&p.classpath),
            Request::Initialization(p) => Some(&p.classpath),
            _ => None,
        }
    }

    pub fn signature(&self) -> Option<&Signature> {
        match self {
            Request::CodeInstall(p) => Some(&p.sig),
            Request::ConstructorCall(p) => Some(&p.sig),
            Request::InstanceCall(p) => Some(&p.sig),
            Request::StaticCall(p) => Some(&p.sig),
            _ => None,
        }
    }

    /// Hash a signer commits to: the canonical encoding with the signature
    /// fields zeroed out.
    pub fn sig_hash(&self) -> Option<Hash> {
        self.signature()?;
        let mut unsigned = self.clone();
        let blank = Signature {
            r: U256RLP(U256::zero()),
            s: U256RLP(U256::zero()),
            v: U256RLP(U256::zero()),
        };
        match &mut unsigned {
            Request::CodeInstall(p) => p.sig = blank,
            Request::ConstructorCall(p) => p.sig = blank,
            Request::InstanceCall(p) => p.sig = blank,
            Request::StaticCall(p) => p.sig = blank,
            _ => return None,
        }
        Some(Hash::hash(&unsigned.encode()))
    }
}

#[inline]
fn secp256k1_n() -> &'static U256 {
    use std::str::FromStr;
    static V: OnceCell<U256> = OnceCell::new();
    V.get_or_init(|| U256::from_str("0xfffffffffffffffffffffffffffffffebaaedce6af48a03bbfd25e8cd0364141").unwrap())
}

#[inline]
fn secp256k1_half_n() -> &'static U256 {
    static V: OnceCell<U256> = OnceCell::new();
    V.get_or_init(|| secp256k1_n() / 2)
}

/// Recover the signer of `hash` and return its 20-byte key fingerprint in
/// hex, the form under which accounts store their public key. `None` means
/// the signature is invalid.
pub fn recover_signer(hash: &Hash, sig: &Signature) -> Option<String> {
    let (r, s, vb) = (sig.r.0, sig.s.0, sig.v.0);
    if vb.bits() > 8 {
        return None
    }
    let v = vb.low_u64();
    if r.is_zero() || s.is_zero() {
        return None
    }
    if &s > secp256k1_half_n() {
        return None
    }
    if &r >= secp256k1_n() || &s >= secp256k1_n() || (v != 0 && v != 1) {
        return None
    }
    let mut rb = [0u8; 32];
    let mut sb = [0u8; 32];
    r.to_big_endian(&mut rb);
    s.to_big_endian(&mut sb);
    let mut r1 = libsecp256k1::curve::Scalar([0; 8]);
    let mut s1 = libsecp256k1::curve::Scalar([0; 8]);
    drop(r1.set_b32(&rb));
    drop(s1.set_b32(&sb));
    let sig = libsecp256k1::Signature { r: r1, s: s1 };
    let msg = libsecp256k1::Message::parse_slice(hash.as_bytes()).ok()?;
    let recover_id = libsecp256k1::RecoveryId::parse(v as u8).ok()?;
    let pubkey = libsecp256k1::recover(&msg, &sig, &recover_id)
        .ok()?
        .serialize();
    assert!(pubkey[0] == 4);
    Some(hex::encode(
        &sha3::Keccak256::digest(&pubkey[1..]).as_slice()[12..],
    ))
}

/// Sign `hash` with a raw secret key; the counterpart of [recover_signer].
pub fn sign_hash(hash: &Hash, secret: &[u8; 32]) -> Option<Signature> {
    let sk = libsecp256k1::SecretKey::parse(secret).ok()?;
    let msg = libsecp256k1::Message::parse_slice(hash.as_bytes()).ok()?;
    let (sig, rec) = libsecp256k1::sign(&msg, &sk);
    Some(Signature {
        r: U256RLP(U256::from_big_endian(&sig.r.b32())),
        s: U256RLP(U256::from_big_endian(&sig.s.b32())),
        v: U256RLP(U256::from(rec.serialize())),
    })
}

/// Fingerprint of the public key matching a raw secret key, as stored in the
/// `publicKey` field of accounts.
pub fn key_fingerprint(secret: &[u8; 32]) -> Option<String> {
    let sk = libsecp256k1::SecretKey::parse(secret).ok()?;
    let pubkey = libsecp256k1::PublicKey::from_secret_key(&sk).serialize();
    Some(hex::encode(
        &sha3::Keccak256::digest(&pubkey[1..]).as_slice()[12..],
    ))
}
