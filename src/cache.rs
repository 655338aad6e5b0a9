use std::num::NonZeroUsize;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::common::{Coin, TransactionReference};
use crate::consensus::ConsensusConfig;
use crate::exec::LoadedCode;

/// Fixed-capacity map with least-recently-used eviction, shareable between
/// threads. Used to memoize signature checks and loaded code.
pub struct BoundedCache<K: std::hash::Hash + Eq, V>(
    Mutex<lru::LruCache<K, V>>,
);

impl<K: std::hash::Hash + Eq, V: Clone> BoundedCache<K, V> {
    pub fn new(capacity: usize) -> Self {
        Self(Mutex::new(lru::LruCache::new(
            NonZeroUsize::new(capacity.max(1)).unwrap(),
        )))
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.0.lock().get(key).map(|v| v.clone())
    }

    pub fn put(&self, key: K, val: V) {
        self.0.lock().put(key, val);
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }
}

/// The bundle of derived values attached to a snapshot: memoized signature
/// checks, memoized code loaders and the lazily recomputed consensus, gas
/// price and inflation. Treated as a unit so that a checkout can reuse it
/// wholesale and skip recomputation.
///
/// The signature and code maps are content-addressed, hence safely shared by
/// every snapshot of the same chain; the three value cells belong to one
/// snapshot and are refreshed by replacing the stored value, never by
/// mutating it in place under a reader.
pub struct StoreCache {
    pub(crate) signatures: Arc<BoundedCache<TransactionReference, bool>>,
    pub(crate) code:
        Arc<BoundedCache<TransactionReference, Arc<dyn LoadedCode>>>,
    consensus: RwLock<Option<Arc<ConsensusConfig>>>,
    gas_price: RwLock<Option<Coin>>,
    inflation: RwLock<Option<i64>>,
}

impl StoreCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            signatures: Arc::new(BoundedCache::new(capacity)),
            code: Arc::new(BoundedCache::new(capacity)),
            consensus: RwLock::new(None),
            gas_price: RwLock::new(None),
            inflation: RwLock::new(None),
        }
    }

    /// A cache for a derived snapshot: the content-addressed maps are shared,
    /// the value cells start from the given states.
    pub fn fork(
        &self, consensus: Option<Arc<ConsensusConfig>>,
        gas_price: Option<Coin>, inflation: Option<i64>,
    ) -> Self {
        Self {
            signatures: self.signatures.clone(),
            code: self.code.clone(),
            consensus: RwLock::new(consensus),
            gas_price: RwLock::new(gas_price),
            inflation: RwLock::new(inflation),
        }
    }

    /// A cache carrying the same state: shared maps, copied value cells.
    pub fn duplicate(&self) -> Self {
        self.fork(self.consensus(), self.gas_price(), self.inflation())
    }

    pub fn consensus(&self) -> Option<Arc<ConsensusConfig>> {
        self.consensus.read().clone()
    }

    pub fn install_consensus(&self, config: Arc<ConsensusConfig>) {
        *self.consensus.write() = Some(config);
    }

    pub fn gas_price(&self) -> Option<Coin> {
        self.gas_price.read().clone()
    }

    pub fn install_gas_price(&self, price: Coin) {
        *self.gas_price.write() = Some(price);
    }

    pub fn inflation(&self) -> Option<i64> {
        *self.inflation.read()
    }

    pub fn install_inflation(&self, inflation: i64) {
        *self.inflation.write() = Some(inflation);
    }
}
