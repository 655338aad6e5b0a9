use std::collections::hash_map::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use log::debug;
use parking_lot::Mutex;

use crate::cache::StoreCache;
use crate::common::{
    Coin, Gas, StateId, StorageReference, StorageValue, TransactionReference,
    U256,
};
use crate::consensus::{
    self, manifest_field, ConsensusConfig, Subsystems, FIELD_CURRENT_SUPPLY,
    FIELD_NONCE, METHOD_CREDIT, METHOD_REWARD_VALIDATORS, VALIDATORS_CLASS,
};
use crate::err::{DeliverError, Fault, Rejection};
use crate::exec::{CodeExecutor, EventKind, ExecEnv, LoadedCode, Workers};
use crate::resp::{Event, FieldId, Response, Update};
use crate::tx::{
    recover_signer, InstanceCallRequest, Request, StaticCallRequest,
    SystemCallRequest,
};

/// Read contract over committed state at one fixed state id. Implementations
/// answer from the persistent trie (or an in-memory stand-in); `None` always
/// means "absent from this state", never an error.
#[async_trait]
pub trait StoreR: Send + Sync {
    async fn request(&self, r: &TransactionReference) -> Option<Request>;
    async fn response(&self, r: &TransactionReference) -> Option<Response>;
    async fn history(
        &self, object: &StorageReference,
    ) -> Option<Vec<TransactionReference>>;
    async fn manifest(&self) -> Option<StorageReference>;
}

/// A state that contains nothing; the backing of the genesis store.
pub struct EmptyState;

#[async_trait]
impl StoreR for EmptyState {
    async fn request(&self, _r: &TransactionReference) -> Option<Request> {
        None
    }
    async fn response(&self, _r: &TransactionReference) -> Option<Response> {
        None
    }
    async fn history(
        &self, _object: &StorageReference,
    ) -> Option<Vec<TransactionReference>> {
        None
    }
    async fn manifest(&self) -> Option<StorageReference> {
        None
    }
}

/// The writes accumulated by one transformation, ready to be mapped onto the
/// persistence layer.
#[derive(Clone, Default)]
pub struct StoreDelta {
    pub requests: HashMap<TransactionReference, Request>,
    pub responses: HashMap<TransactionReference, Response>,
    pub histories: HashMap<StorageReference, Vec<TransactionReference>>,
    pub manifest: Option<StorageReference>,
}

impl StoreDelta {
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty() &&
            self.responses.is_empty() &&
            self.histories.is_empty() &&
            self.manifest.is_none()
    }
}

/// Persistence seam: maps deltas onto a content-addressed trie and hands out
/// read views at past state ids. Commit is two-phase: [StateStore::apply]
/// stages the writes of one block into an exclusive pending transaction and
/// computes the resulting id; [StateStore::commit] persists it together with
/// a checkpoint timestamp; [StateStore::abort] discards it.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Read view at a state id; `None` is the empty genesis state.
    fn read(&self, state: Option<&StateId>) -> Arc<dyn StoreR>;
    /// Whether the id is a checked-in checkpoint. The zero id always is.
    fn contains(&self, state: &StateId) -> bool;
    async fn apply(
        &self, base: Option<&StateId>, delta: &StoreDelta,
    ) -> Result<StateId, Fault>;
    fn commit(&self, state: &StateId, now: u64) -> Result<(), Fault>;
    fn abort(&self);
    /// Garbage-collect checkpoints older than `cutoff`, in a transaction of
    /// their own. Returns how many went away.
    fn keep_from(&self, cutoff: u64) -> Result<usize, Fault>;
}

#[inline]
pub fn base_of(id: &StateId) -> Option<&StateId> {
    if id.is_zero() {
        None
    } else {
        Some(id)
    }
}

/// Node-local knobs of a store, decoupled from the chain-wide consensus.
#[derive(Clone, Debug, serde::Deserialize)]
#[serde(default)]
pub struct StoreParams {
    /// Gas ceiling substituted into view transformations, regardless of the
    /// chain-wide per-transaction ceiling.
    pub view_gas_limit: Gas,
    /// Capacity of the signature and code memoization maps.
    pub cache_capacity: usize,
    /// Share of the coinbase that goes to the miner, in millionths.
    pub miner_share: u64,
}

impl Default for StoreParams {
    fn default() -> Self {
        Self {
            view_gas_limit: 50_000_000,
            cache_capacity: 1024,
            miner_share: 500_000,
        }
    }
}

/// An immutable, thread-safe snapshot of committed state plus its cached
/// derived values. Supports only reads and the spawning of transformations;
/// it is superseded (and dropped) when a newer snapshot is committed.
pub struct Store {
    source: Arc<dyn StoreR>,
    state_id: StateId,
    pub(crate) executor: Arc<dyn CodeExecutor>,
    pub(crate) workers: Arc<Workers>,
    pub(crate) cache: StoreCache,
    pub(crate) params: StoreParams,
}

impl Store {
    pub fn new(
        source: Arc<dyn StoreR>, state_id: StateId,
        executor: Arc<dyn CodeExecutor>, workers: Arc<Workers>,
        cache: Option<StoreCache>, params: StoreParams,
    ) -> Arc<Self> {
        let cache =
            cache.unwrap_or_else(|| StoreCache::new(params.cache_capacity));
        Arc::new(Self {
            source,
            state_id,
            executor,
            workers,
            cache,
            params,
        })
    }

    /// Reconstruct a snapshot at a past state id, reusing a cache bundle if
    /// one is supplied, else starting a cold one.
    pub fn checked_out(
        db: &dyn StateStore, state_id: &StateId,
        executor: Arc<dyn CodeExecutor>, workers: Arc<Workers>,
        cache: Option<StoreCache>, params: StoreParams,
    ) -> Result<Arc<Self>, Fault> {
        if !state_id.is_zero() && !db.contains(state_id) {
            return Err(Fault::UnknownState(state_id.clone()))
        }
        Ok(Self::new(
            db.read(base_of(state_id)),
            state_id.clone(),
            executor,
            workers,
            cache,
            params,
        ))
    }

    pub fn state_id(&self) -> &StateId {
        &self.state_id
    }

    pub async fn get_request(
        &self, r: &TransactionReference,
    ) -> Option<Request> {
        self.source.request(r).await
    }

    pub async fn get_response(
        &self, r: &TransactionReference,
    ) -> Option<Response> {
        self.source.response(r).await
    }

    pub async fn get_history(
        &self, object: &StorageReference,
    ) -> Option<Vec<TransactionReference>> {
        self.source.history(object).await
    }

    pub async fn get_manifest(&self) -> Option<StorageReference> {
        self.source.manifest().await
    }

    /// [Store::get_request] with the typed unknown-reference refusal for
    /// references absent from this snapshot.
    pub async fn request_of(
        &self, r: &TransactionReference,
    ) -> Result<Request, Rejection> {
        self.get_request(r)
            .await
            .ok_or_else(|| Rejection::UnknownReference(r.clone()))
    }

    /// [Store::get_response], same refusal.
    pub async fn response_of(
        &self, r: &TransactionReference,
    ) -> Result<Response, Rejection> {
        self.get_response(r)
            .await
            .ok_or_else(|| Rejection::UnknownReference(r.clone()))
    }

    /// Current consensus parameters (recomputed lazily, then cached).
    pub async fn get_config(&self) -> Result<Arc<ConsensusConfig>, Fault> {
        self.config().await
    }

    /// Open a transformation on top of this snapshot. The snapshot stays
    /// pinned (and readable) for the whole life of the transformation.
    pub fn begin(self: &Arc<Self>, now: u64) -> StoreMut {
        StoreMut::new(self.clone(), now, false)
    }

    /// Open a view transformation: same state, but the exposed consensus
    /// carries the node-local view gas ceiling instead of the chain one.
    pub fn begin_view(self: &Arc<Self>) -> StoreMut {
        StoreMut::new(self.clone(), 0, true)
    }

    /// Validate a request cheaply by building (not delivering) its response
    /// in a throwaway transformation. Never mutates any state, even on
    /// failure: a check has no payer, so nothing may be charged or written.
    pub async fn check(
        self: &Arc<Self>, req: &Request,
    ) -> Result<Response, DeliverError> {
        let throwaway = self.begin(0);
        let resp = self.executor.build_response(&throwaway, req).await?;
        Ok(resp)
    }

    async fn memoized_signature(
        &self, req: &Request, key: &str,
    ) -> Result<bool, Fault> {
        let reference = req.reference();
        if let Some(ok) = self.cache.signatures.get(&reference) {
            return Ok(ok)
        }
        let (hash, sig) = match (req.sig_hash(), req.signature()) {
            (Some(h), Some(s)) => (h, s.clone()),
            _ => return Ok(false),
        };
        let key = key.to_string();
        let ok = self
            .workers
            .submit(move || {
                recover_signer(&hash, &sig).map_or(false, |f| f == key)
            })
            .await
            .map_err(|_| Fault::Background("signature verification"))?;
        self.cache.signatures.put(reference, ok);
        Ok(ok)
    }
}

#[async_trait]
impl ExecEnv for Store {
    async fn request(&self, r: &TransactionReference) -> Option<Request> {
        self.source.request(r).await
    }

    async fn response(&self, r: &TransactionReference) -> Option<Response> {
        self.source.response(r).await
    }

    async fn history(
        &self, object: &StorageReference,
    ) -> Option<Vec<TransactionReference>> {
        self.source.history(object).await
    }

    async fn manifest(&self) -> Option<StorageReference> {
        self.source.manifest().await
    }

    async fn config(&self) -> Result<Arc<ConsensusConfig>, Fault> {
        if let Some(c) = self.cache.consensus() {
            return Ok(c)
        }
        let config =
            Arc::new(consensus::extract_consensus(self, &*self.executor).await?);
        self.cache.install_consensus(config.clone());
        Ok(config)
    }

    async fn gas_price(&self) -> Result<Coin, Fault> {
        if let Some(p) = self.cache.gas_price() {
            return Ok(p)
        }
        let price =
            consensus::extract_gas_price(self, &*self.executor).await?;
        self.cache.install_gas_price(price.clone());
        Ok(price)
    }

    async fn verify_signature(
        &self, req: &Request, key: &str,
    ) -> Result<bool, Fault> {
        self.memoized_signature(req, key).await
    }

    async fn loaded_code(
        &self, classpath: &TransactionReference,
    ) -> Result<Arc<dyn LoadedCode>, Rejection> {
        if let Some(code) = self.cache.code.get(classpath) {
            return Ok(code)
        }
        let code = self.executor.load_code(self, classpath).await?;
        self.cache.code.put(classpath.clone(), code.clone());
        Ok(code)
    }
}

/// The final materialization of a transformation: everything needed to turn
/// its effects into a committed snapshot, or to drop them wholesale.
pub struct FinalState {
    /// The state id the transformation was opened on.
    pub base: StateId,
    pub now: u64,
    pub delta: StoreDelta,
    /// Refreshed cache bundle to attach to the resulting snapshot.
    pub cache: StoreCache,
    /// Events awaiting notification once commit ordering is established.
    pub events: Vec<Event>,
}

/// A mutable, single-owner accumulator of the effects of one block (or one
/// check): the delivery engine. It is created from exactly one [Store],
/// drives a sequence of requests, and is consumed exactly once: either
/// finished into a new snapshot or dropped, discarding everything.
///
/// Reads see the pending writes first and fall back to the base snapshot, so
/// each delivered request observes its predecessors in the same block.
pub struct StoreMut {
    base: Arc<Store>,
    now: u64,
    view: bool,
    delta: StoreDelta,
    // lazily recomputed chain parameters; a cell is cleared when a delivered
    // response is judged able to have changed it
    consensus: Mutex<Option<Arc<ConsensusConfig>>>,
    gas_price: Mutex<Option<Coin>>,
    inflation: Mutex<Option<i64>>,
    subsystems: Mutex<Option<Subsystems>>,
    // reward bookkeeping over non-system requests
    gas_consumed: U256,
    coins: Coin,
    coins_without_inflation: Coin,
    delivered: u64,
    events: Vec<Event>,
}

impl StoreMut {
    fn new(base: Arc<Store>, now: u64, view: bool) -> Self {
        let consensus = base.cache.consensus();
        let gas_price = base.cache.gas_price();
        let inflation = base.cache.inflation();
        Self {
            base,
            now,
            view,
            delta: StoreDelta::default(),
            consensus: Mutex::new(consensus),
            gas_price: Mutex::new(gas_price),
            inflation: Mutex::new(inflation),
            subsystems: Mutex::new(None),
            gas_consumed: U256::zero(),
            coins: Coin::zero().clone(),
            coins_without_inflation: Coin::zero().clone(),
            delivered: 0,
            events: Vec::new(),
        }
    }

    /// Moment this transformation executes at, as decided by `beginBlock`.
    pub fn now(&self) -> u64 {
        self.now
    }

    pub fn base(&self) -> &Arc<Store> {
        &self.base
    }

    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    /// Execute one request and fold its effects into the accumulated state.
    /// A [Rejection] leaves no trace here: there is no payer for a rejected
    /// request. A [Fault] means this transformation is poisoned.
    pub async fn deliver(
        &mut self, req: Request,
    ) -> Result<(TransactionReference, Response), DeliverError> {
        if self.view {
            return Err(Fault::UndeliverableRequest.into())
        }
        let reference = req.reference();
        debug!("delivering {} {}", req.kind(), reference);
        let resp = self.base.executor.build_response(self, &req).await?;
        self.push(&reference, &req, &resp).await?;
        self.note_delivery(&req, &resp).await?;
        Ok((reference, resp))
    }

    /// Build and evaluate an instance method call without ever pushing it;
    /// the engine's own manifest introspection goes through the same path.
    pub async fn run_instance_view(
        &self, req: InstanceCallRequest,
    ) -> Result<Option<StorageValue>, DeliverError> {
        let req = Request::InstanceCall(req);
        self.run_view(req).await
    }

    /// [StoreMut::run_instance_view], for static methods.
    pub async fn run_static_view(
        &self, req: StaticCallRequest,
    ) -> Result<Option<StorageValue>, DeliverError> {
        let req = Request::StaticCall(req);
        self.run_view(req).await
    }

    async fn run_view(
        &self, req: Request,
    ) -> Result<Option<StorageValue>, DeliverError> {
        let reference = req.reference();
        match self.base.executor.build_response(self, &req).await? {
            Response::MethodCalled(p) => Ok(p.result),
            Response::MethodFailed(p) => {
                Err(Rejection::Failed(p.cause).into())
            }
            _ => Err(Fault::UnexpectedResponse(reference).into()),
        }
    }

    /// Synthesize and deliver the validator-reward call for this block: the
    /// gas rewards accumulated so far, minted coins clamped to the final
    /// supply bound. Deliberately not pushed when it would only move the
    /// manifest nonce, to avoid growing the chain with no-op rewards.
    pub async fn deliver_reward(
        &mut self, behaving: &str, misbehaving: &str,
    ) -> Result<(), DeliverError> {
        let subs = match self.located_subsystems().await? {
            Some(s) => s,
            None => {
                debug!("store not initialized, no validator reward");
                return Ok(())
            }
        };
        let coins = self.clamped_reward(&subs).await?;
        let nonce = self.account_nonce(&subs.manifest).await?;
        let req = Request::SystemCall(SystemCallRequest {
            caller: subs.manifest.clone(),
            nonce,
            receiver: subs.validators.clone(),
            method: METHOD_REWARD_VALIDATORS.into(),
            args: vec![
                StorageValue::Str(behaving.into()),
                StorageValue::Str(misbehaving.into()),
                StorageValue::U256(self.gas_consumed),
                StorageValue::U256(coins.clone().into()),
                StorageValue::U256(
                    self.coins_without_inflation.clone().into(),
                ),
                StorageValue::I64(self.delivered as i64),
            ],
        });
        let reference = req.reference();
        let resp = self.base.executor.build_response(self, &req).await?;
        if self.only_manifest_nonce(&subs, resp.updates()) {
            debug!("reward would only touch the manifest nonce, skipped");
            return Ok(())
        }
        self.push(&reference, &req, &resp).await?;
        self.note_delivery(&req, &resp).await?;
        Ok(())
    }

    /// Split a block reward between the node's and the miner's public keys
    /// through the accounts ledger. A second, corrective call is issued only
    /// when the ledger could not credit both parties at once, so that a
    /// freshly created ledger account is always the progressive-zero object
    /// of its creating transaction.
    pub async fn deliver_coinbase(
        &mut self, reward: Coin, node_key: &str, miner_key: &str,
    ) -> Result<(), DeliverError> {
        let subs = match self.located_subsystems().await? {
            Some(s) => s,
            None => {
                debug!("store not initialized, no coinbase");
                return Ok(())
            }
        };
        if reward.is_zero() {
            return Ok(())
        }
        let scale = U256::from(1_000_000u64);
        let share = U256::from(self.base.params.miner_share.min(1_000_000));
        let miner_part: Coin =
            (U256::from(reward.clone()) * share / scale).into();
        let node_part = reward.saturating_sub(&miner_part);
        let nonce = self.account_nonce(&subs.manifest).await?;
        let req = Request::SystemCall(SystemCallRequest {
            caller: subs.manifest.clone(),
            nonce,
            receiver: subs.accounts_ledger.clone(),
            method: METHOD_CREDIT.into(),
            args: vec![
                StorageValue::Str(node_key.into()),
                StorageValue::U256(node_part.into()),
                StorageValue::Str(miner_key.into()),
                StorageValue::U256(miner_part.clone().into()),
            ],
        });
        let reference = req.reference();
        let resp = self.base.executor.build_response(self, &req).await?;
        let both = match &resp {
            Response::MethodCalled(p) => match &p.result {
                Some(StorageValue::Bool(both)) => *both,
                _ => return Err(Fault::UnexpectedResponse(reference).into()),
            },
            _ => return Err(Fault::UnexpectedResponse(reference).into()),
        };
        self.push(&reference, &req, &resp).await?;
        self.note_delivery(&req, &resp).await?;
        if !both {
            let nonce = self.account_nonce(&subs.manifest).await?;
            let req = Request::SystemCall(SystemCallRequest {
                caller: subs.manifest.clone(),
                nonce,
                receiver: subs.accounts_ledger.clone(),
                method: METHOD_CREDIT.into(),
                args: vec![
                    StorageValue::Str(miner_key.into()),
                    StorageValue::U256(miner_part.into()),
                ],
            });
            let reference = req.reference();
            let resp = self.base.executor.build_response(self, &req).await?;
            if !matches!(resp, Response::MethodCalled(_)) {
                return Err(Fault::UnexpectedResponse(reference).into())
            }
            self.push(&reference, &req, &resp).await?;
            self.note_delivery(&req, &resp).await?;
        }
        Ok(())
    }

    /// Consume the transformation into its final materialization. This is the
    /// only way its effects survive; dropping the transformation instead
    /// discards them completely.
    pub fn finish(self) -> FinalState {
        let consensus = self.consensus.into_inner();
        let gas_price = self.gas_price.into_inner();
        let inflation = self.inflation.into_inner();
        let cache = self.base.cache.fork(consensus, gas_price, inflation);
        FinalState {
            base: self.base.state_id.clone(),
            now: self.now,
            delta: self.delta,
            cache,
            events: self.events,
        }
    }

    /// Finish, persist and check out the resulting snapshot in one step,
    /// returning it together with the events awaiting notification. Block
    /// building goes through the two-phase path instead.
    pub async fn into_store(
        self, db: &dyn StateStore,
    ) -> Result<(Arc<Store>, Vec<Event>), Fault> {
        let executor = self.base.executor.clone();
        let workers = self.base.workers.clone();
        let params = self.base.params.clone();
        let f = self.finish();
        let id = db.apply(base_of(&f.base), &f.delta).await?;
        db.commit(&id, f.now)?;
        let store = Store::checked_out(
            db,
            &id,
            executor,
            workers,
            Some(f.cache),
            params,
        )?;
        Ok((store, f.events))
    }

    // -- push / history maintenance --

    /// Fold a successful response into the accumulated state: store request
    /// and response under the reference, then recompute the history of every
    /// touched object. Initialization responses only set the manifest.
    async fn push(
        &mut self, reference: &TransactionReference, req: &Request,
        resp: &Response,
    ) -> Result<(), Fault> {
        if let Response::Initialized(p) = resp {
            self.delta.requests.insert(reference.clone(), req.clone());
            self.delta.responses.insert(reference.clone(), resp.clone());
            self.delta.manifest = Some(p.manifest.clone());
            return Ok(())
        }
        self.delta.requests.insert(reference.clone(), req.clone());
        self.delta.responses.insert(reference.clone(), resp.clone());
        let mut objects: Vec<&StorageReference> = Vec::new();
        for u in resp.updates() {
            if !objects.contains(&u.object()) {
                objects.push(u.object());
            }
        }
        let mut expanded = Vec::new();
        for object in objects {
            let history = self.expand_history(object, reference, resp).await?;
            expanded.push((object.clone(), history));
        }
        for (object, history) in expanded {
            self.delta.histories.insert(object, history);
        }
        Ok(())
    }

    async fn expand_history(
        &self, object: &StorageReference, reference: &TransactionReference,
        resp: &Response,
    ) -> Result<Vec<TransactionReference>, Fault> {
        let fresh: Vec<Update> = resp
            .updates()
            .iter()
            .filter(|u| u.object() == object)
            .cloned()
            .collect();
        if fresh.iter().any(|u| u.is_class_tag()) {
            // created by the very transaction being pushed
            return Ok(vec![reference.clone()])
        }
        let old = self
            .history(object)
            .await
            .ok_or_else(|| Fault::UnknownObject(object.clone()))?;
        self.simplified(object, reference, fresh, &old).await
    }

    /// Prepend the new reference and simplify the remainder: an old entry
    /// survives only while it still supplies at least one update not shadowed
    /// by a strictly newer retained entry; the oldest entry is always kept,
    /// as it anchors the class tag. Keeps each history proportional to the
    /// object's distinct fields rather than to its update count.
    async fn simplified(
        &self, object: &StorageReference, reference: &TransactionReference,
        mut covered: Vec<Update>, old: &[TransactionReference],
    ) -> Result<Vec<TransactionReference>, Fault> {
        let mut kept = vec![reference.clone()];
        if old.is_empty() {
            return Ok(kept)
        }
        let oldest = old.len() - 1;
        for r in &old[..oldest] {
            let resp = self
                .response(r)
                .await
                .ok_or_else(|| Fault::MissingResponse(r.clone()))?;
            let mut fresh = Vec::new();
            for u in resp.updates().iter().filter(|u| u.object() == object) {
                if !covered.iter().any(|c| c.same_property(u)) &&
                    !fresh.iter().any(|c: &Update| c.same_property(u))
                {
                    fresh.push(u.clone());
                }
            }
            if !fresh.is_empty() {
                kept.push(r.clone());
                covered.extend(fresh);
            }
        }
        kept.push(old[oldest].clone());
        Ok(kept)
    }

    // -- bookkeeping --

    async fn note_delivery(
        &mut self, req: &Request, resp: &Response,
    ) -> Result<(), Fault> {
        self.events.extend(resp.events().iter().cloned());
        if !req.is_system() {
            let gas = resp.gas_consumed();
            let price = req
                .gas_price()
                .cloned()
                .unwrap_or_else(|| Coin::zero().clone());
            let without = price
                .checked_mul(&Coin::from(gas))
                .ok_or_else(|| Fault::SupplyOverflow(price.clone()))?;
            let inflation = self.current_inflation().await?;
            let with = apply_inflation(&without, inflation)
                .ok_or_else(|| Fault::SupplyOverflow(without.clone()))?;
            self.gas_consumed = self
                .gas_consumed
                .checked_add(U256::from(gas))
                .ok_or_else(|| Fault::SupplyOverflow(without.clone()))?;
            self.coins = self
                .coins
                .checked_add(&with)
                .ok_or_else(|| Fault::SupplyOverflow(with.clone()))?;
            self.coins_without_inflation = self
                .coins_without_inflation
                .checked_add(&without)
                .ok_or_else(|| Fault::SupplyOverflow(without.clone()))?;
            self.delivered += 1;
        }
        self.refresh_invalidation(resp).await
    }

    /// Judge whether a delivered response may have changed the cached chain
    /// parameters, and clear the matching cells if so.
    async fn refresh_invalidation(
        &self, resp: &Response,
    ) -> Result<(), Fault> {
        if let Response::Initialized(_) = resp {
            *self.consensus.lock() = None;
            *self.gas_price.lock() = None;
            *self.inflation.lock() = None;
            *self.subsystems.lock() = None;
            return Ok(())
        }
        if resp.events().is_empty() {
            return Ok(())
        }
        let subs = match self.located_subsystems().await? {
            Some(s) => s,
            None => return Ok(()),
        };
        for ev in resp.events() {
            match self.base.executor.classify_event(&ev.class) {
                EventKind::ConsensusUpdate if subs.contains(&ev.creator) => {
                    *self.consensus.lock() = None;
                    *self.subsystems.lock() = None;
                }
                EventKind::GasPriceUpdate
                    if ev.creator == subs.gas_station =>
                {
                    *self.gas_price.lock() = None;
                }
                EventKind::InflationUpdate
                    if ev.creator == subs.validators =>
                {
                    *self.inflation.lock() = None;
                }
                _ => (),
            }
        }
        Ok(())
    }

    async fn located_subsystems(&self) -> Result<Option<Subsystems>, Fault> {
        if let Some(s) = self.subsystems.lock().clone() {
            return Ok(Some(s))
        }
        match consensus::locate_subsystems(self).await? {
            Some(s) => {
                *self.subsystems.lock() = Some(s.clone());
                Ok(Some(s))
            }
            None => Ok(None),
        }
    }

    async fn chain_config(&self) -> Result<Arc<ConsensusConfig>, Fault> {
        if let Some(c) = self.consensus.lock().clone() {
            return Ok(c)
        }
        let config = Arc::new(
            consensus::extract_consensus(self, &*self.base.executor).await?,
        );
        *self.consensus.lock() = Some(config.clone());
        Ok(config)
    }

    async fn current_inflation(&self) -> Result<i64, Fault> {
        if let Some(i) = *self.inflation.lock() {
            return Ok(i)
        }
        let inflation =
            consensus::extract_inflation(self, &*self.base.executor).await?;
        *self.inflation.lock() = Some(inflation);
        Ok(inflation)
    }

    /// Gas rewards of this block, clamped so the resulting supply neither
    /// exceeds the final supply when minting, nor undershoots it when the
    /// inflation is negative.
    async fn clamped_reward(&self, subs: &Subsystems) -> Result<Coin, Fault> {
        let cfg = self.chain_config().await?;
        let current = match self
            .field_value(
                &subs.validators,
                &FieldId::new(VALIDATORS_CLASS, FIELD_CURRENT_SUPPLY),
            )
            .await?
        {
            Some(StorageValue::U256(x)) => Coin::from(x),
            _ => return Err(Fault::WrongParameter(FIELD_CURRENT_SUPPLY)),
        };
        let without = &self.coins_without_inflation;
        if self.coins >= *without {
            let minted = self.coins.checked_sub(without).unwrap_or_default();
            let headroom = cfg.final_supply.saturating_sub(&current);
            without
                .checked_add(&minted.min(headroom))
                .ok_or_else(|| Fault::SupplyOverflow(current))
        } else {
            let burned = without.saturating_sub(&self.coins);
            let headroom = current.saturating_sub(&cfg.final_supply);
            Ok(without.saturating_sub(&burned.min(headroom)))
        }
    }

    async fn account_nonce(
        &self, account: &StorageReference,
    ) -> Result<u64, Fault> {
        match self
            .field_value(account, &manifest_field(FIELD_NONCE))
            .await?
        {
            Some(StorageValue::I64(n)) if n >= 0 => Ok(n as u64),
            None => Ok(0),
            _ => Err(Fault::WrongParameter(FIELD_NONCE)),
        }
    }

    fn only_manifest_nonce(
        &self, subs: &Subsystems, updates: &[Update],
    ) -> bool {
        updates.iter().all(|u| {
            matches!(u, Update::Field { object, field, .. }
                if object == &subs.manifest && field.name == FIELD_NONCE)
        })
    }
}

fn apply_inflation(base: &Coin, inflation: i64) -> Option<Coin> {
    let scale = U256::from(1_000_000u64);
    let b: U256 = base.clone().into();
    if inflation >= 0 {
        let factor = scale.checked_add(U256::from(inflation as u64))?;
        Some(Coin::from(b.checked_mul(factor)? / scale))
    } else {
        let m = std::cmp::min(U256::from(inflation.unsigned_abs()), scale);
        Some(Coin::from(b.checked_mul(scale - m)? / scale))
    }
}

#[async_trait]
impl ExecEnv for StoreMut {
    async fn request(&self, r: &TransactionReference) -> Option<Request> {
        match self.delta.requests.get(r) {
            Some(req) => Some(req.clone()),
            None => self.base.get_request(r).await,
        }
    }

    async fn response(&self, r: &TransactionReference) -> Option<Response> {
        match self.delta.responses.get(r) {
            Some(resp) => Some(resp.clone()),
            None => self.base.get_response(r).await,
        }
    }

    async fn history(
        &self, object: &StorageReference,
    ) -> Option<Vec<TransactionReference>> {
        match self.delta.histories.get(object) {
            Some(h) => Some(h.clone()),
            None => self.base.get_history(object).await,
        }
    }

    async fn manifest(&self) -> Option<StorageReference> {
        match &self.delta.manifest {
            Some(m) => Some(m.clone()),
            None => self.base.get_manifest().await,
        }
    }

    async fn config(&self) -> Result<Arc<ConsensusConfig>, Fault> {
        let config = self.chain_config().await?;
        if self.view {
            // the view gas ceiling is a node-local decision
            let mut cfg = (*config).clone();
            cfg.max_gas_per_transaction = self.base.params.view_gas_limit;
            return Ok(Arc::new(cfg))
        }
        Ok(config)
    }

    async fn gas_price(&self) -> Result<Coin, Fault> {
        if let Some(p) = self.gas_price.lock().clone() {
            return Ok(p)
        }
        let price =
            consensus::extract_gas_price(self, &*self.base.executor).await?;
        *self.gas_price.lock() = Some(price.clone());
        Ok(price)
    }

    async fn verify_signature(
        &self, req: &Request, key: &str,
    ) -> Result<bool, Fault> {
        self.base.memoized_signature(req, key).await
    }

    async fn loaded_code(
        &self, classpath: &TransactionReference,
    ) -> Result<Arc<dyn LoadedCode>, Rejection> {
        if let Some(code) = self.base.cache.code.get(classpath) {
            return Ok(code)
        }
        let code = self.base.executor.load_code(self, classpath).await?;
        self.base.cache.code.put(classpath.clone(), code.clone());
        Ok(code)
    }
}
