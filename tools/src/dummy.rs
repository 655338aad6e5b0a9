use std::collections::hash_map::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use log::info;
use parking_lot::Mutex;
use sha3::Digest;

use qstate::common::{
    Coin, Gas, StateId, StorageReference, StorageValue, TransactionReference,
    U256, U256RLP,
};
use qstate::err::{DeliverError, Fault, Rejection};
use qstate::exec::{CodeExecutor, EventKind, ExecEnv, LoadedCode, PlainModule};
use qstate::node::EventSink;
use qstate::resp::{
    AccountCreatedResponse, CodeInstalledResponse, ConstructorCalledResponse,
    FailedResponse, FieldId, InitializedResponse, MethodCalledResponse,
    Response, Update,
};
use qstate::state::{StateStore, StoreDelta, StoreMut, StoreR};
use qstate::tx::{
    ConstructorCallRequest, GenesisAccountRequest, Request, Signature,
    SystemCodeInstallRequest, InitializationRequest,
};

pub const ACCOUNT_CLASS: &str = "Account";
const GAS_BASE: Gas = 100;

// -- in-memory state store --

#[derive(Default, Clone)]
struct Snapshot {
    requests: HashMap<TransactionReference, Request>,
    responses: HashMap<TransactionReference, Response>,
    histories: HashMap<StorageReference, Vec<TransactionReference>>,
    manifest: Option<StorageReference>,
}

impl Snapshot {
    fn is_empty(&self) -> bool {
        self.requests.is_empty() &&
            self.responses.is_empty() &&
            self.histories.is_empty() &&
            self.manifest.is_none()
    }

    /// Content hash over the sorted entries, so equal states get equal ids
    /// no matter how they were reached. The empty state is the zero id.
    fn content_id(&self) -> StateId {
        if self.is_empty() {
            return StateId::zero().clone()
        }
        let mut hasher = sha3::Keccak256::new();
        let mut reqs: Vec<_> = self.requests.iter().collect();
        reqs.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));
        for (r, req) in reqs {
            hasher.update([0u8]);
            hasher.update(r.as_bytes());
            hasher.update(req.encode());
        }
        let mut resps: Vec<_> = self.responses.iter().collect();
        resps.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));
        for (r, resp) in resps {
            hasher.update([1u8]);
            hasher.update(r.as_bytes());
            hasher.update(resp.encode());
        }
        let mut hists: Vec<_> = self
            .histories
            .iter()
            .map(|(o, h)| (o.to_key(), h))
            .collect();
        hists.sort_by(|a, b| a.0.cmp(&b.0));
        for (key, history) in hists {
            hasher.update([2u8]);
            hasher.update(&key);
            for r in history {
                hasher.update(r.as_bytes());
            }
        }
        if let Some(m) = &self.manifest {
            hasher.update([3u8]);
            hasher.update(m.to_key());
        }
        let mut out = [0u8; 32];
        out.copy_from_slice(hasher.finalize().as_slice());
        StateId::from(out)
    }

    fn absorb(&mut self, delta: &StoreDelta) {
        for (r, req) in &delta.requests {
            self.requests.insert(r.clone(), req.clone());
        }
        for (r, resp) in &delta.responses {
            self.responses.insert(r.clone(), resp.clone());
        }
        for (o, h) in &delta.histories {
            self.histories.insert(o.clone(), h.clone());
        }
        if let Some(m) = &delta.manifest {
            self.manifest = Some(m.clone());
        }
    }
}

struct MemReader(Arc<Snapshot>);

#[async_trait]
impl StoreR for MemReader {
    async fn request(&self, r: &TransactionReference) -> Option<Request> {
        self.0.requests.get(r).cloned()
    }
    async fn response(&self, r: &TransactionReference) -> Option<Response> {
        self.0.responses.get(r).cloned()
    }
    async fn history(
        &self, object: &StorageReference,
    ) -> Option<Vec<TransactionReference>> {
        self.0.histories.get(object).cloned()
    }
    async fn manifest(&self) -> Option<StorageReference> {
        self.0.manifest.clone()
    }
}

#[derive(Default)]
struct MemStates {
    committed: HashMap<StateId, Arc<Snapshot>>,
    checkpoints: HashMap<StateId, u64>,
    staged: Option<(StateId, Snapshot)>,
}

/// In-memory [StateStore] with the same two-phase commit discipline as the
/// trie-backed one; the workhorse of the engine tests.
#[derive(Default)]
pub struct MemStateStore(Mutex<MemStates>);

impl MemStateStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn checkpoint_count(&self) -> usize {
        self.0.lock().checkpoints.len()
    }

    pub fn has_staged(&self) -> bool {
        self.0.lock().staged.is_some()
    }
}

#[async_trait]
impl StateStore for MemStateStore {
    fn read(&self, state: Option<&StateId>) -> Arc<dyn StoreR> {
        let states = self.0.lock();
        let snap = match state {
            None => Arc::new(Snapshot::default()),
            Some(id) => states
                .committed
                .get(id)
                .cloned()
                .unwrap_or_else(|| Arc::new(Snapshot::default())),
        };
        Arc::new(MemReader(snap))
    }

    fn contains(&self, state: &StateId) -> bool {
        self.0.lock().checkpoints.contains_key(state)
    }

    async fn apply(
        &self, base: Option<&StateId>, delta: &StoreDelta,
    ) -> Result<StateId, Fault> {
        let mut states = self.0.lock();
        if states.staged.is_some() {
            return Err(Fault::Persistence(
                "another commit is in flight".into(),
            ))
        }
        let mut snap = match base {
            None => Snapshot::default(),
            Some(id) => states
                .committed
                .get(id)
                .map(|s| s.as_ref().clone())
                .ok_or_else(|| Fault::UnknownState(id.clone()))?,
        };
        snap.absorb(delta);
        let id = snap.content_id();
        states.staged = Some((id.clone(), snap));
        Ok(id)
    }

    fn commit(&self, state: &StateId, now: u64) -> Result<(), Fault> {
        let mut states = self.0.lock();
        match states.staged.take() {
            Some((id, snap)) if &id == state => {
                states.committed.insert(id.clone(), Arc::new(snap));
                states.checkpoints.insert(id, now);
                Ok(())
            }
            other => {
                states.staged = other;
                Err(Fault::Persistence("no matching staged state".into()))
            }
        }
    }

    fn abort(&self) {
        self.0.lock().staged = None;
    }

    fn keep_from(&self, cutoff: u64) -> Result<usize, Fault> {
        let mut states = self.0.lock();
        let doomed: Vec<StateId> = states
            .checkpoints
            .iter()
            .filter(|(_, ts)| **ts < cutoff)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &doomed {
            states.checkpoints.remove(id);
        }
        Ok(doomed.len())
    }
}

// -- scripted code executor --

/// A minimal, deterministic response builder used to exercise the engine: it
/// keeps account balances and nonces as object fields, answers 0-argument
/// methods by reading the field of the same name, and implements the two
/// system calls the engine synthesizes (validator reward and ledger credit).
pub struct DummyExecutor {
    check_signatures: bool,
}

impl DummyExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            check_signatures: false,
        })
    }

    pub fn with_signature_checks() -> Arc<Self> {
        Arc::new(Self {
            check_signatures: true,
        })
    }
}

fn reject(f: Fault) -> Rejection {
    Rejection::Failed(f.to_string())
}

async fn class_of(
    env: &dyn ExecEnv, object: &StorageReference,
) -> Result<String, Rejection> {
    env.class_tag(object)
        .await
        .map_err(reject)?
        .ok_or_else(|| Rejection::Failed(format!("unknown object {}", object)))
}

async fn read_field(
    env: &dyn ExecEnv, object: &StorageReference, name: &str,
) -> Result<Option<StorageValue>, Rejection> {
    let class = class_of(env, object).await?;
    env.field_value(object, &FieldId::new(&class, name))
        .await
        .map_err(reject)
}

async fn read_u256(
    env: &dyn ExecEnv, object: &StorageReference, name: &str,
) -> Result<U256, Rejection> {
    match read_field(env, object, name).await? {
        Some(StorageValue::U256(x)) => Ok(x),
        None => Ok(U256::zero()),
        _ => Err(Rejection::Failed(format!("field {} is not numeric", name))),
    }
}

fn field(
    object: &StorageReference, class: &str, name: &str, value: StorageValue,
) -> Update {
    Update::Field {
        object: object.clone(),
        field: FieldId::new(class, name),
        value,
    }
}

/// Validate nonce/signature/affordability of a paid request and produce the
/// updates charging its payer. Any refusal here is a [Rejection]: the engine
/// must leave no trace of the request.
async fn charge(
    env: &dyn ExecEnv, req: &Request, check_signatures: bool,
) -> Result<(Vec<Update>, Gas), Rejection> {
    let caller = req.caller().unwrap().clone();
    let nonce = req.nonce().unwrap();
    let gas_limit = req.gas_limit().unwrap();
    let gas_price = req.gas_price().unwrap().clone();
    let cfg = env.config().await.map_err(reject)?;
    if gas_limit > cfg.max_gas_per_transaction {
        return Err(Rejection::GasCeiling(
            gas_limit,
            cfg.max_gas_per_transaction,
        ))
    }
    let class = class_of(env, &caller).await?;
    let current = match env
        .field_value(&caller, &FieldId::new(&class, "nonce"))
        .await
        .map_err(reject)?
    {
        Some(StorageValue::I64(n)) => n as u64,
        _ => return Err(Rejection::Failed("caller has no nonce".into())),
    };
    if current != nonce {
        return Err(Rejection::NonceMismatch {
            caller,
            expected: current,
            got: nonce,
        })
    }
    if check_signatures {
        let key = match env
            .field_value(&caller, &FieldId::new(&class, "publicKey"))
            .await
            .map_err(reject)?
        {
            Some(StorageValue::Str(k)) => k,
            _ => {
                return Err(Rejection::Failed(
                    "caller has no public key".into(),
                ))
            }
        };
        if !env.verify_signature(req, &key).await.map_err(reject)? {
            return Err(Rejection::BadSignature(caller))
        }
    }
    let balance = read_u256(env, &caller, "balance").await?;
    let worst = U256::from(gas_price.clone())
        .checked_mul(U256::from(gas_limit))
        .ok_or_else(|| Rejection::Failed("gas offer overflow".into()))?;
    if balance < worst {
        return Err(Rejection::InsufficientBalance {
            caller,
            gas: gas_limit,
        })
    }
    let gas = GAS_BASE.min(gas_limit);
    let cost = U256::from(gas_price) * U256::from(gas);
    Ok((
        vec![
            field(
                &caller,
                &class,
                "nonce",
                StorageValue::I64(nonce as i64 + 1),
            ),
            field(
                &caller,
                &class,
                "balance",
                StorageValue::U256(balance - cost),
            ),
        ],
        gas,
    ))
}

/// Interpret `set`/`emit`/getter methods shared by instance calls.
fn arg_pairs(args: &[StorageValue]) -> Option<Vec<(String, StorageValue)>> {
    if args.len() % 2 != 0 {
        return None
    }
    let mut pairs = Vec::new();
    for chunk in args.chunks(2) {
        match &chunk[0] {
            StorageValue::Str(name) => {
                pairs.push((name.clone(), chunk[1].clone()))
            }
            _ => return None,
        }
    }
    Some(pairs)
}

#[async_trait]
impl CodeExecutor for DummyExecutor {
    async fn build_response(
        &self, env: &dyn ExecEnv, req: &Request,
    ) -> Result<Response, Rejection> {
        let reference = req.reference();
        match req {
            Request::SystemCodeInstall(p) => {
                Ok(Response::CodeInstalled(CodeInstalledResponse {
                    module: p.module.clone(),
                    deps: p.deps.clone(),
                    verification_version: 0,
                    updates: Vec::new(),
                    gas: 0,
                }))
            }
            Request::CodeInstall(p) => {
                let (updates, gas) =
                    charge(env, req, self.check_signatures).await?;
                let version =
                    env.config().await.map_err(reject)?.verification_version;
                env.loaded_code(&p.classpath).await?;
                Ok(Response::CodeInstalled(CodeInstalledResponse {
                    module: p.module.clone(),
                    deps: p.deps.clone(),
                    verification_version: version,
                    updates,
                    gas,
                }))
            }
            Request::GenesisAccount(p) => {
                if env.manifest().await.is_some() {
                    return Err(Rejection::Failed(
                        "node is already initialized".into(),
                    ))
                }
                let account = StorageReference::new(reference, 0);
                let updates = vec![
                    Update::ClassTag {
                        object: account.clone(),
                        class: ACCOUNT_CLASS.into(),
                    },
                    field(
                        &account,
                        ACCOUNT_CLASS,
                        "balance",
                        StorageValue::U256(p.amount.clone().into()),
                    ),
                    field(
                        &account,
                        ACCOUNT_CLASS,
                        "nonce",
                        StorageValue::I64(0),
                    ),
                    field(
                        &account,
                        ACCOUNT_CLASS,
                        "publicKey",
                        StorageValue::Str(p.public_key.clone()),
                    ),
                ];
                Ok(Response::AccountCreated(AccountCreatedResponse {
                    account,
                    updates,
                }))
            }
            Request::ConstructorCall(p) => {
                let (mut updates, gas) =
                    charge(env, req, self.check_signatures).await?;
                let pairs = match arg_pairs(&p.args) {
                    Some(pairs) => pairs,
                    None => {
                        return Ok(Response::ConstructorFailed(
                            FailedResponse {
                                cause: "constructor arguments must be \
                                        (name, value) pairs"
                                    .into(),
                                updates,
                                gas,
                            },
                        ))
                    }
                };
                let new_object = StorageReference::new(reference, 0);
                updates.push(Update::ClassTag {
                    object: new_object.clone(),
                    class: p.class.clone(),
                });
                for (name, value) in pairs {
                    updates.push(field(&new_object, &p.class, &name, value));
                }
                Ok(Response::ConstructorCalled(ConstructorCalledResponse {
                    new_object,
                    updates,
                    events: Vec::new(),
                    gas,
                }))
            }
            Request::InstanceCall(p) => {
                let (mut updates, gas) =
                    charge(env, req, self.check_signatures).await?;
                match p.method.as_str() {
                    "set" => {
                        let pairs = arg_pairs(&p.args).unwrap_or_default();
                        let class = class_of(env, &p.receiver).await?;
                        for (name, value) in pairs {
                            updates.push(field(
                                &p.receiver,
                                &class,
                                &name,
                                value,
                            ));
                        }
                        Ok(Response::MethodCalled(MethodCalledResponse {
                            result: None,
                            updates,
                            events: Vec::new(),
                            gas,
                        }))
                    }
                    "emit" => {
                        let class = match p.args.first() {
                            Some(StorageValue::Str(c)) => c.clone(),
                            _ => {
                                return Ok(Response::MethodFailed(
                                    FailedResponse {
                                        cause: "emit needs a class name"
                                            .into(),
                                        updates,
                                        gas,
                                    },
                                ))
                            }
                        };
                        let event = qstate::resp::Event {
                            object: StorageReference::new(reference, 0),
                            class,
                            creator: p.receiver.clone(),
                        };
                        Ok(Response::MethodCalled(MethodCalledResponse {
                            result: None,
                            updates,
                            events: vec![event],
                            gas,
                        }))
                    }
                    getter if p.args.is_empty() => {
                        let result =
                            read_field(env, &p.receiver, getter).await?;
                        Ok(Response::MethodCalled(MethodCalledResponse {
                            result,
                            updates,
                            events: Vec::new(),
                            gas,
                        }))
                    }
                    other => Ok(Response::MethodFailed(FailedResponse {
                        cause: format!("unknown method {}", other),
                        updates,
                        gas,
                    })),
                }
            }
            Request::StaticCall(p) => {
                let (updates, gas) =
                    charge(env, req, self.check_signatures).await?;
                match p.method.as_str() {
                    "nothing" => {
                        Ok(Response::MethodCalled(MethodCalledResponse {
                            result: None,
                            updates,
                            events: Vec::new(),
                            gas,
                        }))
                    }
                    other => Ok(Response::MethodFailed(FailedResponse {
                        cause: format!("unknown static method {}", other),
                        updates,
                        gas,
                    })),
                }
            }
            Request::SystemCall(p) => match p.method.as_str() {
                "rewardValidators" => {
                    if p.args.len() < 6 {
                        return Err(Rejection::Malformed(
                            "reward call needs six arguments".into(),
                        ))
                    }
                    let (coins, without) = match (&p.args[3], &p.args[4]) {
                        (
                            StorageValue::U256(c),
                            StorageValue::U256(w),
                        ) => (*c, *w),
                        _ => {
                            return Err(Rejection::Malformed(
                                "reward amounts must be numeric".into(),
                            ))
                        }
                    };
                    let manifest = &p.caller;
                    let validators = &p.receiver;
                    let m_class = class_of(env, manifest).await?;
                    let nonce = match env
                        .field_value(
                            manifest,
                            &FieldId::new(&m_class, "nonce"),
                        )
                        .await
                        .map_err(reject)?
                    {
                        Some(StorageValue::I64(n)) => n,
                        _ => 0,
                    };
                    let mut updates = vec![field(
                        manifest,
                        &m_class,
                        "nonce",
                        StorageValue::I64(nonce + 1),
                    )];
                    let v_class = class_of(env, validators).await?;
                    if !coins.is_zero() {
                        let balance =
                            read_u256(env, validators, "balance").await?;
                        updates.push(field(
                            validators,
                            &v_class,
                            "balance",
                            StorageValue::U256(balance + coins),
                        ));
                    }
                    if coins != without {
                        let supply = read_u256(
                            env,
                            validators,
                            "currentSupply",
                        )
                        .await?;
                        let new_supply = if coins >= without {
                            supply + (coins - without)
                        } else {
                            supply.saturating_sub(without - coins)
                        };
                        updates.push(field(
                            validators,
                            &v_class,
                            "currentSupply",
                            StorageValue::U256(new_supply),
                        ));
                    }
                    Ok(Response::MethodCalled(MethodCalledResponse {
                        result: None,
                        updates,
                        events: Vec::new(),
                        gas: 0,
                    }))
                }
                "credit" => {
                    let pairs = match arg_pairs(&p.args) {
                        Some(pairs) if !pairs.is_empty() => pairs,
                        _ => {
                            return Err(Rejection::Malformed(
                                "credit needs (key, amount) pairs".into(),
                            ))
                        }
                    };
                    let ledger = &p.receiver;
                    let manifest = &p.caller;
                    let l_class = class_of(env, ledger).await?;
                    let m_class = class_of(env, manifest).await?;
                    let nonce = match env
                        .field_value(
                            manifest,
                            &FieldId::new(&m_class, "nonce"),
                        )
                        .await
                        .map_err(reject)?
                    {
                        Some(StorageValue::I64(n)) => n,
                        _ => 0,
                    };
                    let mut updates = vec![field(
                        manifest,
                        &m_class,
                        "nonce",
                        StorageValue::I64(nonce + 1),
                    )];
                    let mut created = false;
                    let mut all = true;
                    for (key, value) in pairs {
                        let amount = match value {
                            StorageValue::U256(a) => a,
                            _ => {
                                return Err(Rejection::Malformed(
                                    "credit amounts must be numeric".into(),
                                ))
                            }
                        };
                        let bind = FieldId::new(
                            &l_class,
                            &format!("account:{}", key),
                        );
                        match env
                            .field_value(ledger, &bind)
                            .await
                            .map_err(reject)?
                        {
                            Some(StorageValue::Ref(account)) => {
                                let balance =
                                    read_u256(env, &account, "balance")
                                        .await?;
                                updates.push(field(
                                    &account,
                                    ACCOUNT_CLASS,
                                    "balance",
                                    StorageValue::U256(balance + amount),
                                ));
                            }
                            _ => {
                                // only one fresh account per transaction, so
                                // it gets progressive index zero
                                if created {
                                    all = false;
                                    continue
                                }
                                created = true;
                                let account = StorageReference::new(
                                    reference.clone(),
                                    0,
                                );
                                updates.push(Update::ClassTag {
                                    object: account.clone(),
                                    class: ACCOUNT_CLASS.into(),
                                });
                                updates.push(field(
                                    &account,
                                    ACCOUNT_CLASS,
                                    "balance",
                                    StorageValue::U256(amount),
                                ));
                                updates.push(field(
                                    &account,
                                    ACCOUNT_CLASS,
                                    "nonce",
                                    StorageValue::I64(0),
                                ));
                                updates.push(field(
                                    &account,
                                    ACCOUNT_CLASS,
                                    "publicKey",
                                    StorageValue::Str(key.clone()),
                                ));
                                updates.push(field(
                                    ledger,
                                    &l_class,
                                    &format!("account:{}", key),
                                    StorageValue::Ref(account),
                                ));
                            }
                        }
                    }
                    Ok(Response::MethodCalled(MethodCalledResponse {
                        result: Some(StorageValue::Bool(all)),
                        updates,
                        events: Vec::new(),
                        gas: 0,
                    }))
                }
                getter if p.args.is_empty() => {
                    let result = read_field(env, &p.receiver, getter).await?;
                    Ok(Response::MethodCalled(MethodCalledResponse {
                        result,
                        updates: Vec::new(),
                        events: Vec::new(),
                        gas: 0,
                    }))
                }
                other => Err(Rejection::Failed(format!(
                    "unknown system method {}",
                    other
                ))),
            },
            Request::Initialization(p) => {
                if env.manifest().await.is_some() {
                    return Err(Rejection::Failed(
                        "node is already initialized".into(),
                    ))
                }
                Ok(Response::Initialized(InitializedResponse {
                    manifest: p.manifest.clone(),
                }))
            }
        }
    }

    async fn load_code(
        &self, env: &dyn ExecEnv, classpath: &TransactionReference,
    ) -> Result<Arc<dyn LoadedCode>, Rejection> {
        info!("loading code at {}", classpath);
        match env.request(classpath).await {
            Some(Request::CodeInstall(p)) => {
                Ok(Arc::new(PlainModule::new(classpath.clone(), p.deps)))
            }
            Some(Request::SystemCodeInstall(p)) => {
                Ok(Arc::new(PlainModule::new(classpath.clone(), p.deps)))
            }
            _ => Err(Rejection::MissingCode(classpath.clone())),
        }
    }

    fn classify_event(&self, class: &str) -> EventKind {
        match class {
            "ConsensusUpdate" => EventKind::ConsensusUpdate,
            "GasPriceUpdate" => EventKind::GasPriceUpdate,
            "InflationUpdate" => EventKind::InflationUpdate,
            _ => EventKind::Other,
        }
    }
}

// -- event sink --

/// [EventSink] that records every notification, for assertions.
#[derive(Default)]
pub struct RecordingSink(
    Mutex<Vec<(StorageReference, StorageReference)>>,
);

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn taken(&self) -> Vec<(StorageReference, StorageReference)> {
        std::mem::take(&mut *self.0.lock())
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }
}

impl EventSink for RecordingSink {
    fn notify(&self, creator: &StorageReference, event: &StorageReference) {
        self.0.lock().push((creator.clone(), event.clone()));
    }
}

// -- genesis helper --

pub fn blank_sig() -> Signature {
    Signature {
        r: U256RLP(U256::zero()),
        s: U256RLP(U256::zero()),
        v: U256RLP(U256::zero()),
    }
}

#[derive(Clone, Debug)]
pub struct GenesisParams {
    pub chain_id: u64,
    pub gamete_balance: Coin,
    pub initial_supply: Coin,
    pub final_supply: Coin,
    pub inflation: i64,
    pub gas_price: Coin,
    pub max_gas: u64,
    pub oblivion: u64,
}

impl Default for GenesisParams {
    fn default() -> Self {
        Self {
            chain_id: 10086,
            gamete_balance: 1_000_000_000u64.into(),
            initial_supply: 1_000_000u64.into(),
            final_supply: 2_000_000u64.into(),
            inflation: 100_000,
            gas_price: 100u64.into(),
            max_gas: 1_000_000,
            oblivion: 250_000,
        }
    }
}

/// References of everything the genesis sequence created.
pub struct Genesis {
    pub classpath: TransactionReference,
    pub gamete: StorageReference,
    pub validators: StorageReference,
    pub gas_station: StorageReference,
    pub versions: StorageReference,
    pub ledger: StorageReference,
    pub manifest: StorageReference,
}

/// Build the full genesis request sequence: base code, gamete, the manifest
/// subsystem objects, then initialization. References are content hashes, so
/// the created objects are known before anything is delivered.
pub fn genesis_requests(g: &GenesisParams) -> (Vec<Request>, Genesis) {
    let code = Request::SystemCodeInstall(SystemCodeInstallRequest {
        module: (&b"base code"[..]).into(),
        deps: Vec::new(),
    });
    let classpath = code.reference();

    let gamete_req = Request::GenesisAccount(GenesisAccountRequest {
        amount: g.gamete_balance.clone(),
        public_key: "gamete".into(),
        classpath: classpath.clone(),
    });
    let gamete = StorageReference::new(gamete_req.reference(), 0);

    let construct = |nonce: u64, class: &str, args: Vec<StorageValue>| {
        Request::ConstructorCall(ConstructorCallRequest {
            caller: gamete.clone(),
            nonce,
            gas_limit: 10_000,
            gas_price: Coin::zero().clone(),
            classpath: classpath.clone(),
            class: class.into(),
            args,
            sig: blank_sig(),
        })
    };

    let validators_req = construct(
        0,
        "Validators",
        vec![
            StorageValue::Str("currentSupply".into()),
            StorageValue::U256(g.initial_supply.clone().into()),
            StorageValue::Str("initialSupply".into()),
            StorageValue::U256(g.initial_supply.clone().into()),
            StorageValue::Str("finalSupply".into()),
            StorageValue::U256(g.final_supply.clone().into()),
            StorageValue::Str("initialInflation".into()),
            StorageValue::I64(g.inflation),
            StorageValue::Str("currentInflation".into()),
            StorageValue::I64(g.inflation),
        ],
    );
    let gas_station_req = construct(
        1,
        "GasStation",
        vec![
            StorageValue::Str("gasPrice".into()),
            StorageValue::U256(g.gas_price.clone().into()),
            StorageValue::Str("initialGasPrice".into()),
            StorageValue::U256(g.gas_price.clone().into()),
            StorageValue::Str("maxGasPerTransaction".into()),
            StorageValue::I64(g.max_gas as i64),
            StorageValue::Str("oblivion".into()),
            StorageValue::I64(g.oblivion as i64),
        ],
    );
    let versions_req = construct(
        2,
        "Versions",
        vec![
            StorageValue::Str("verificationVersion".into()),
            StorageValue::I64(0),
        ],
    );
    let ledger_req = construct(3, "Ledger", Vec::new());

    let validators = StorageReference::new(validators_req.reference(), 0);
    let gas_station = StorageReference::new(gas_station_req.reference(), 0);
    let versions = StorageReference::new(versions_req.reference(), 0);
    let ledger = StorageReference::new(ledger_req.reference(), 0);

    let manifest_req = construct(
        4,
        "Manifest",
        vec![
            StorageValue::Str("chainId".into()),
            StorageValue::U256(g.chain_id.into()),
            StorageValue::Str("genesisTime".into()),
            StorageValue::I64(0),
            StorageValue::Str("signature".into()),
            StorageValue::Str("secp256k1".into()),
            StorageValue::Str("validators".into()),
            StorageValue::Ref(validators.clone()),
            StorageValue::Str("gasStation".into()),
            StorageValue::Ref(gas_station.clone()),
            StorageValue::Str("versions".into()),
            StorageValue::Ref(versions.clone()),
            StorageValue::Str("accountsLedger".into()),
            StorageValue::Ref(ledger.clone()),
            StorageValue::Str("nonce".into()),
            StorageValue::I64(0),
        ],
    );
    let manifest = StorageReference::new(manifest_req.reference(), 0);

    let init_req = Request::Initialization(InitializationRequest {
        classpath: classpath.clone(),
        manifest: manifest.clone(),
    });

    (
        vec![
            code,
            gamete_req,
            validators_req,
            gas_station_req,
            versions_req,
            ledger_req,
            manifest_req,
            init_req,
        ],
        Genesis {
            classpath,
            gamete,
            validators,
            gas_station,
            versions,
            ledger,
            manifest,
        },
    )
}

/// Deliver the genesis sequence into an open transformation.
pub async fn install_genesis(
    m: &mut StoreMut, g: &GenesisParams,
) -> Result<Genesis, DeliverError> {
    let (requests, genesis) = genesis_requests(g);
    for req in requests {
        m.deliver(req).await?;
    }
    Ok(genesis)
}
