use std::str::FromStr;

use crate::common::{
    checked_as_u64, Coin, Gas, StorageReference, StorageValue, U256,
};
use crate::err::Fault;
use crate::exec::{CodeExecutor, ExecEnv};
use crate::resp::{FieldId, Response};
use crate::tx::{Request, SystemCallRequest};

/// Chain-wide parameters, rebuilt from a batch of view calls into the
/// manifest subsystem and cached until a delivered response is judged able
/// to have changed them. Before initialization the defaults apply.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ConsensusConfig {
    pub chain_id: U256,
    pub genesis_time: u64,
    pub max_gas_per_transaction: Gas,
    pub initial_gas_price: Coin,
    /// How fast the gas price forgets past load, in millionths.
    pub oblivion: u64,
    pub initial_supply: Coin,
    /// Supply bound the reward clamp enforces, from either direction.
    pub final_supply: Coin,
    /// Signed yearly inflation applied to gas rewards, in millionths.
    pub initial_inflation: i64,
    pub signature: SignatureAlgo,
    pub verification_version: u64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            chain_id: U256::zero(),
            genesis_time: 0,
            max_gas_per_transaction: 1_000_000_000,
            initial_gas_price: 100u64.into(),
            oblivion: 250_000,
            initial_supply: Coin::zero().clone(),
            final_supply: Coin::zero().clone(),
            initial_inflation: 0,
            signature: SignatureAlgo::Secp256k1,
            verification_version: 0,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum SignatureAlgo {
    Secp256k1,
}

impl FromStr for SignatureAlgo {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, ()> {
        match s {
            "secp256k1" => Ok(SignatureAlgo::Secp256k1),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for SignatureAlgo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignatureAlgo::Secp256k1 => write!(f, "secp256k1"),
        }
    }
}

// Well-known names of the manifest subsystem. The manifest anchors the other
// objects through these fields; the engine follows them directly from state,
// then gathers parameters through view calls.
pub const MANIFEST_CLASS: &str = "Manifest";
pub const FIELD_VALIDATORS: &str = "validators";
pub const FIELD_GAS_STATION: &str = "gasStation";
pub const FIELD_VERSIONS: &str = "versions";
pub const FIELD_ACCOUNTS_LEDGER: &str = "accountsLedger";
pub const FIELD_NONCE: &str = "nonce";
pub const FIELD_CURRENT_SUPPLY: &str = "currentSupply";
pub const VALIDATORS_CLASS: &str = "Validators";

pub const VIEW_CHAIN_ID: &str = "chainId";
pub const VIEW_GENESIS_TIME: &str = "genesisTime";
pub const VIEW_SIGNATURE: &str = "signature";
pub const VIEW_MAX_GAS: &str = "maxGasPerTransaction";
pub const VIEW_INITIAL_GAS_PRICE: &str = "initialGasPrice";
pub const VIEW_GAS_PRICE: &str = "gasPrice";
pub const VIEW_OBLIVION: &str = "oblivion";
pub const VIEW_INITIAL_SUPPLY: &str = "initialSupply";
pub const VIEW_FINAL_SUPPLY: &str = "finalSupply";
pub const VIEW_INITIAL_INFLATION: &str = "initialInflation";
pub const VIEW_CURRENT_INFLATION: &str = "currentInflation";
pub const VIEW_VERIFICATION_VERSION: &str = "verificationVersion";

pub const METHOD_REWARD_VALIDATORS: &str = "rewardValidators";
pub const METHOD_CREDIT: &str = "credit";

pub fn manifest_field(name: &str) -> FieldId {
    FieldId::new(MANIFEST_CLASS, name)
}

/// The objects the manifest anchors, located once per recomputation.
#[derive(Clone, Debug)]
pub struct Subsystems {
    pub manifest: StorageReference,
    pub validators: StorageReference,
    pub gas_station: StorageReference,
    pub versions: StorageReference,
    pub accounts_ledger: StorageReference,
}

impl Subsystems {
    pub fn contains(&self, object: &StorageReference) -> bool {
        object == &self.manifest ||
            object == &self.validators ||
            object == &self.gas_station ||
            object == &self.versions
    }
}

async fn ref_field(
    env: &dyn ExecEnv, manifest: &StorageReference, name: &'static str,
) -> Result<StorageReference, Fault> {
    match env.field_value(manifest, &manifest_field(name)).await? {
        Some(StorageValue::Ref(r)) => Ok(r),
        _ => Err(Fault::WrongParameter(name)),
    }
}

/// Follow the manifest's well-known fields; `None` before initialization.
pub(crate) async fn locate_subsystems(
    env: &dyn ExecEnv,
) -> Result<Option<Subsystems>, Fault> {
    let manifest = match env.manifest().await {
        Some(m) => m,
        None => return Ok(None),
    };
    Ok(Some(Subsystems {
        validators: ref_field(env, &manifest, FIELD_VALIDATORS).await?,
        gas_station: ref_field(env, &manifest, FIELD_GAS_STATION).await?,
        versions: ref_field(env, &manifest, FIELD_VERSIONS).await?,
        accounts_ledger: ref_field(env, &manifest, FIELD_ACCOUNTS_LEDGER)
            .await?,
        manifest,
    }))
}

/// One read-only call into the manifest subsystem: built and evaluated, never
/// pushed. Any outcome other than a method result is an internal fault, since
/// the subsystem is assumed well-formed once installed.
pub(crate) async fn view_call(
    env: &dyn ExecEnv, executor: &dyn CodeExecutor, caller: &StorageReference,
    receiver: &StorageReference, method: &'static str,
    args: Vec<StorageValue>,
) -> Result<Option<StorageValue>, Fault> {
    let req = Request::SystemCall(SystemCallRequest {
        caller: caller.clone(),
        nonce: 0,
        receiver: receiver.clone(),
        method: method.into(),
        args,
    });
    match executor.build_response(env, &req).await {
        Ok(Response::MethodCalled(p)) => Ok(p.result),
        Ok(_) => Err(Fault::UnexpectedResponse(req.reference())),
        Err(rej) => Err(Fault::Introspection(method, rej.to_string())),
    }
}

fn as_u256(
    v: Option<StorageValue>, name: &'static str,
) -> Result<U256, Fault> {
    match v {
        Some(StorageValue::U256(x)) => Ok(x),
        _ => Err(Fault::WrongParameter(name)),
    }
}

fn as_coin(
    v: Option<StorageValue>, name: &'static str,
) -> Result<Coin, Fault> {
    Ok(as_u256(v, name)?.into())
}

fn as_u64(v: Option<StorageValue>, name: &'static str) -> Result<u64, Fault> {
    match v {
        Some(StorageValue::I64(x)) if x >= 0 => Ok(x as u64),
        Some(StorageValue::U256(x)) => {
            checked_as_u64(&x).ok_or(Fault::WrongParameter(name))
        }
        _ => Err(Fault::WrongParameter(name)),
    }
}

fn as_i64(v: Option<StorageValue>, name: &'static str) -> Result<i64, Fault> {
    match v {
        Some(StorageValue::I64(x)) => Ok(x),
        _ => Err(Fault::WrongParameter(name)),
    }
}

fn as_str(
    v: Option<StorageValue>, name: &'static str,
) -> Result<String, Fault> {
    match v {
        Some(StorageValue::Str(x)) => Ok(x),
        _ => Err(Fault::WrongParameter(name)),
    }
}

/// Rebuild the full consensus from the manifest subsystem. Returns the
/// defaults for an uninitialized store.
pub(crate) async fn extract_consensus(
    env: &dyn ExecEnv, executor: &dyn CodeExecutor,
) -> Result<ConsensusConfig, Fault> {
    let subs = match locate_subsystems(env).await? {
        Some(s) => s,
        None => return Ok(ConsensusConfig::default()),
    };
    let m = &subs.manifest;
    let chain_id = as_u256(
        view_call(env, executor, m, m, VIEW_CHAIN_ID, Vec::new()).await?,
        VIEW_CHAIN_ID,
    )?;
    let genesis_time = as_u64(
        view_call(env, executor, m, m, VIEW_GENESIS_TIME, Vec::new()).await?,
        VIEW_GENESIS_TIME,
    )?;
    let signature = as_str(
        view_call(env, executor, m, m, VIEW_SIGNATURE, Vec::new()).await?,
        VIEW_SIGNATURE,
    )?
    .parse()
    .map_err(|_| Fault::WrongParameter(VIEW_SIGNATURE))?;
    let gs = &subs.gas_station;
    let max_gas_per_transaction = as_u64(
        view_call(env, executor, m, gs, VIEW_MAX_GAS, Vec::new()).await?,
        VIEW_MAX_GAS,
    )?;
    let initial_gas_price = as_coin(
        view_call(env, executor, m, gs, VIEW_INITIAL_GAS_PRICE, Vec::new())
            .await?,
        VIEW_INITIAL_GAS_PRICE,
    )?;
    let oblivion = as_u64(
        view_call(env, executor, m, gs, VIEW_OBLIVION, Vec::new()).await?,
        VIEW_OBLIVION,
    )?;
    let vs = &subs.validators;
    let initial_supply = as_coin(
        view_call(env, executor, m, vs, VIEW_INITIAL_SUPPLY, Vec::new())
            .await?,
        VIEW_INITIAL_SUPPLY,
    )?;
    let final_supply = as_coin(
        view_call(env, executor, m, vs, VIEW_FINAL_SUPPLY, Vec::new()).await?,
        VIEW_FINAL_SUPPLY,
    )?;
    let initial_inflation = as_i64(
        view_call(env, executor, m, vs, VIEW_INITIAL_INFLATION, Vec::new())
            .await?,
        VIEW_INITIAL_INFLATION,
    )?;
    let verification_version = as_u64(
        view_call(
            env,
            executor,
            m,
            &subs.versions,
            VIEW_VERIFICATION_VERSION,
            Vec::new(),
        )
        .await?,
        VIEW_VERIFICATION_VERSION,
    )?;
    Ok(ConsensusConfig {
        chain_id,
        genesis_time,
        max_gas_per_transaction,
        initial_gas_price,
        oblivion,
        initial_supply,
        final_supply,
        initial_inflation,
        signature,
        verification_version,
    })
}

/// Current gas price from the gas station; the configured initial price for
/// an uninitialized store.
pub(crate) async fn extract_gas_price(
    env: &dyn ExecEnv, executor: &dyn CodeExecutor,
) -> Result<Coin, Fault> {
    match locate_subsystems(env).await? {
        Some(subs) => as_coin(
            view_call(
                env,
                executor,
                &subs.manifest,
                &subs.gas_station,
                VIEW_GAS_PRICE,
                Vec::new(),
            )
            .await?,
            VIEW_GAS_PRICE,
        ),
        None => Ok(ConsensusConfig::default().initial_gas_price),
    }
}

/// Current inflation from the validators; zero for an uninitialized store.
pub(crate) async fn extract_inflation(
    env: &dyn ExecEnv, executor: &dyn CodeExecutor,
) -> Result<i64, Fault> {
    match locate_subsystems(env).await? {
        Some(subs) => as_i64(
            view_call(
                env,
                executor,
                &subs.manifest,
                &subs.validators,
                VIEW_CURRENT_INFLATION,
                Vec::new(),
            )
            .await?,
            VIEW_CURRENT_INFLATION,
        ),
        None => Ok(0),
    }
}
