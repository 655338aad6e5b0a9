use std::sync::Arc;

use async_trait::async_trait;
use memory_db::{KeyFunction, PrefixedKey};
use parking_lot::Mutex;
use reference_trie::{ExtensionLayout, RefHasher};
use rocksdb::{Direction, IteratorMode, WriteBatch, DB};
use sync_unsafe_cell::SyncUnsafeCell;
use trie_db::{
    DBValue, HashDB, HashDBRef, Hasher, Trie, TrieDB, TrieDBMut, TrieMut,
};

use qstate::common::{StateId, StorageReference, TransactionReference};
use qstate::err::Fault;
use qstate::resp::Response;
use qstate::state::{StateStore, StoreDelta, StoreR};
use qstate::tx::Request;

// key spaces inside each trie
const KEY_REQUEST: u8 = 0x0;
const KEY_RESPONSE: u8 = 0x1;
const KEY_HISTORY: u8 = 0x2;
const KEY_MANIFEST: u8 = 0x3;

// key space of the checkpoint records, outside the tries
const CHECKPOINT_PREFIX: &[u8] = b"states";

type Out = <RefHasher as Hasher>::Out;
type KF = PrefixedKey<RefHasher>;

fn request_key(r: &TransactionReference) -> Vec<u8> {
    let mut key = vec![KEY_REQUEST];
    key.extend_from_slice(r.as_bytes());
    key
}

fn response_key(r: &TransactionReference) -> Vec<u8> {
    let mut key = vec![KEY_RESPONSE];
    key.extend_from_slice(r.as_bytes());
    key
}

fn history_key(object: &StorageReference) -> Vec<u8> {
    let mut key = vec![KEY_HISTORY];
    key.extend_from_slice(&object.to_key());
    key
}

fn manifest_key() -> Vec<u8> {
    vec![KEY_MANIFEST]
}

struct Counter(i64);

impl Counter {
    fn encode(&self) -> DBValue {
        self.0.to_le_bytes().into()
    }

    fn decode(raw: &[u8]) -> Option<Self> {
        Some(Self(i64::from_le_bytes(raw[..8].try_into().ok()?)))
    }
}

struct NodeStoreInner {
    db: DB,
    wb: Option<WriteBatch>,
}

impl NodeStoreInner {
    fn get_wb(&mut self) -> &mut WriteBatch {
        self.wb.get_or_insert_with(WriteBatch::default)
    }
}

/// Copy-on-write trie node store over RocksDB: nodes are reference-counted
/// in, never deleted, so every state ever committed stays readable and the
/// forest only grows. Writes accumulate in a write batch until the pending
/// transaction commits or aborts.
struct NodeStore {
    inner: Mutex<NodeStoreInner>,
    prefix: Vec<u8>,
    null_node_hash: Out,
    null_node_data: Vec<u8>,
}

impl NodeStore {
    const CNT_SUFFIX: [u8; 1] = [0x0; 1];
    const DATA_SUFFIX: [u8; 1] = [0x1; 1];

    fn new(prefix: Vec<u8>, db: DB) -> Self {
        let null_node_data = vec![0u8];
        Self {
            inner: Mutex::new(NodeStoreInner { db, wb: None }),
            prefix,
            null_node_hash: RefHasher::hash(&null_node_data),
            null_node_data,
        }
    }

    fn finalize_key(
        &self, key: &Out, prefix: hash_db::Prefix, suffix: &[u8],
    ) -> Vec<u8> {
        let mut buff = self.prefix.clone();
        buff.extend_from_slice(&KF::key(key, prefix));
        buff.extend_from_slice(suffix);
        buff
    }
}

impl hash_db::AsHashDB<RefHasher, DBValue> for NodeStore {
    fn as_hash_db(&self) -> &dyn HashDB<RefHasher, DBValue> {
        self
    }
    fn as_hash_db_mut<'a>(
        &'a mut self,
    ) -> &'a mut (dyn HashDB<RefHasher, DBValue> + 'a) {
        self
    }
}

impl HashDB<RefHasher, DBValue> for NodeStore {
    fn get(
        &self, key: &Out, prefix: (&[u8], Option<u8>),
    ) -> Option<DBValue> {
        if key == &self.null_node_hash {
            return Some(self.null_node_data.clone())
        }
        let cnt_key = self.finalize_key(key, prefix, &Self::CNT_SUFFIX);
        let inner = self.inner.lock();
        inner.db.get(&cnt_key).ok()?.and_then(|r| {
            let cnt = Counter::decode(&r).unwrap();
            if cnt.0 > 0 {
                let data_key =
                    self.finalize_key(key, prefix, &Self::DATA_SUFFIX);
                inner.db.get(&data_key).ok()?
            } else {
                None
            }
        })
    }
    fn contains(&self, key: &Out, prefix: (&[u8], Option<u8>)) -> bool {
        if key == &self.null_node_hash {
            return true
        }
        let cnt_key = self.finalize_key(key, prefix, &Self::CNT_SUFFIX);
        let inner = self.inner.lock();
        match inner.db.get(&cnt_key).ok() {
            Some(Some(v)) => Counter::decode(&v).unwrap().0 > 0,
            _ => false,
        }
    }
    fn emplace(
        &mut self, key: Out, prefix: (&[u8], Option<u8>), value: DBValue,
    ) {
        if value == self.null_node_data {
            return
        }
        let cnt_key = self.finalize_key(&key, prefix, &Self::CNT_SUFFIX);
        let data_key = self.finalize_key(&key, prefix, &Self::DATA_SUFFIX);
        let mut inner = self.inner.lock();
        match inner.db.get(&cnt_key).unwrap() {
            Some(v) => {
                let wb = inner.get_wb();
                let cnt = Counter::decode(&v).unwrap();
                if cnt.0 <= 0 {
                    wb.put(data_key, value);
                }
                wb.put(cnt_key, Counter(cnt.0 + 1).encode());
            }
            None => {
                let wb = inner.get_wb();
                wb.put(cnt_key, Counter(1).encode());
                wb.put(data_key, value);
            }
        }
    }
    fn insert(&mut self, prefix: (&[u8], Option<u8>), value: &[u8]) -> Out {
        if value == self.null_node_data {
            return self.null_node_hash
        }
        let key = RefHasher::hash(value);
        HashDB::emplace(self, key, prefix, value.into());
        key
    }
    fn remove(&mut self, _key: &Out, _prefix: (&[u8], Option<u8>)) {
        // removes are ignored: the node store is copy-on-write and committed
        // states must stay readable after later commits
    }
}

impl HashDBRef<RefHasher, DBValue> for NodeStore {
    fn get(
        &self, key: &Out, prefix: (&[u8], Option<u8>),
    ) -> Option<DBValue> {
        HashDB::get(self, key, prefix)
    }
    fn contains(&self, key: &Out, prefix: (&[u8], Option<u8>)) -> bool {
        HashDB::contains(self, key, prefix)
    }
}

struct TrieStoreInner {
    db: SyncUnsafeCell<NodeStore>,
}

impl TrieStoreInner {
    fn get_inner(&self) -> &NodeStore {
        unsafe { &*self.db.get() }
    }
    fn get_inner_mut(&self) -> &mut NodeStore {
        unsafe { &mut *self.db.get() }
    }

    fn get(&self, key: &[u8], root: &Out) -> Option<Vec<u8>> {
        let trie = TrieDB::<ExtensionLayout>::new(self.get_inner(), root).ok()?;
        trie.get(key).ok()?
    }
}

/// Trie-backed [StateStore]: maps each transformation's accumulated writes
/// onto a persistent, content-addressed trie and keeps one checkpoint record
/// (state id, timestamp) per committed block, the unit the garbage collector
/// works on. The pending write batch is exclusive: one commit (or collection
/// sweep) in flight at a time.
pub struct TrieStore(Arc<TrieStoreInner>);

impl TrieStore {
    pub fn new(rocksdb: DB, prefix: &[u8]) -> Self {
        Self(Arc::new(TrieStoreInner {
            db: SyncUnsafeCell::new(NodeStore::new(prefix.to_vec(), rocksdb)),
        }))
    }

    fn checkpoint_key(state: &StateId) -> Vec<u8> {
        let mut key = CHECKPOINT_PREFIX.to_vec();
        key.extend_from_slice(state.as_bytes());
        key
    }

    fn reader(&self, state: Option<&StateId>) -> TrieReader {
        TrieReader {
            root: state.map(|s| {
                let mut out = Out::default();
                out.copy_from_slice(s.as_bytes());
                out
            }),
            store: self.0.clone(),
        }
    }
}

#[async_trait]
impl StateStore for TrieStore {
    fn read(&self, state: Option<&StateId>) -> Arc<dyn StoreR> {
        Arc::new(self.reader(state))
    }

    fn contains(&self, state: &StateId) -> bool {
        let node_store = self.0.get_inner();
        let inner = node_store.inner.lock();
        matches!(inner.db.get(Self::checkpoint_key(state)), Ok(Some(_)))
    }

    async fn apply(
        &self, base: Option<&StateId>, delta: &StoreDelta,
    ) -> Result<StateId, Fault> {
        {
            let node_store = self.0.get_inner();
            let inner = node_store.inner.lock();
            if inner.wb.is_some() {
                return Err(Fault::Persistence(
                    "another commit is in flight".into(),
                ))
            }
        }
        let wdb = self.0.get_inner_mut();
        let mut new_root = Out::default();
        {
            let mut trie = match base {
                Some(b) => {
                    new_root.copy_from_slice(b.as_bytes());
                    TrieDBMut::<ExtensionLayout>::from_existing(
                        wdb,
                        &mut new_root,
                    )
                    .map_err(|e| Fault::Persistence(e.to_string()))?
                }
                None => TrieDBMut::<ExtensionLayout>::new(wdb, &mut new_root),
            };
            for (r, req) in &delta.requests {
                trie.insert(&request_key(r), &req.encode())
                    .map_err(|e| Fault::Persistence(e.to_string()))?;
            }
            for (r, resp) in &delta.responses {
                trie.insert(&response_key(r), &resp.encode())
                    .map_err(|e| Fault::Persistence(e.to_string()))?;
            }
            for (object, history) in &delta.histories {
                let encoded =
                    rlp::encode_list::<TransactionReference, _>(history);
                trie.insert(&history_key(object), &encoded)
                    .map_err(|e| Fault::Persistence(e.to_string()))?;
            }
            if let Some(manifest) = &delta.manifest {
                trie.insert(&manifest_key(), &rlp::encode(manifest))
                    .map_err(|e| Fault::Persistence(e.to_string()))?;
            }
        }
        // the trie nodes are now staged in the write batch; make sure one
        // exists even for an empty block, so commit/abort stay symmetric
        wdb.inner.lock().get_wb();
        StateId::from_slice(&new_root)
            .ok_or_else(|| Fault::Persistence("malformed trie root".into()))
    }

    fn commit(&self, state: &StateId, now: u64) -> Result<(), Fault> {
        let node_store = self.0.get_inner();
        let mut inner = node_store.inner.lock();
        let mut wb = inner.wb.take().unwrap_or_default();
        wb.put(Self::checkpoint_key(state), now.to_le_bytes());
        inner
            .db
            .write(wb)
            .map_err(|e| Fault::Persistence(e.to_string()))
    }

    fn abort(&self) {
        let node_store = self.0.get_inner();
        node_store.inner.lock().wb = None;
    }

    fn keep_from(&self, cutoff: u64) -> Result<usize, Fault> {
        let node_store = self.0.get_inner();
        let inner = node_store.inner.lock();
        let mut wb = WriteBatch::default();
        let mut removed = 0;
        let iter = inner.db.iterator(IteratorMode::From(
            CHECKPOINT_PREFIX,
            Direction::Forward,
        ));
        for (key, value) in iter {
            if !key.starts_with(CHECKPOINT_PREFIX) {
                break
            }
            if value.len() < 8 {
                return Err(Fault::Persistence(
                    "malformed checkpoint record".into(),
                ))
            }
            let ts = u64::from_le_bytes(value[..8].try_into().unwrap());
            if ts < cutoff {
                wb.delete(key);
                removed += 1;
            }
        }
        if removed > 0 {
            inner
                .db
                .write(wb)
                .map_err(|e| Fault::Persistence(e.to_string()))?;
        }
        Ok(removed)
    }
}

/// Read view over one trie root. A missing root means the empty state.
pub struct TrieReader {
    root: Option<Out>,
    store: Arc<TrieStoreInner>,
}

#[async_trait]
impl StoreR for TrieReader {
    async fn request(&self, r: &TransactionReference) -> Option<Request> {
        let root = self.root.as_ref()?;
        Request::decode(&self.store.get(&request_key(r), root)?)
    }

    async fn response(&self, r: &TransactionReference) -> Option<Response> {
        let root = self.root.as_ref()?;
        Response::decode(&self.store.get(&response_key(r), root)?)
    }

    async fn history(
        &self, object: &StorageReference,
    ) -> Option<Vec<TransactionReference>> {
        let root = self.root.as_ref()?;
        let raw = self.store.get(&history_key(object), root)?;
        rlp::Rlp::new(&raw).as_list().ok()
    }

    async fn manifest(&self) -> Option<StorageReference> {
        let root = self.root.as_ref()?;
        let raw = self.store.get(&manifest_key(), root)?;
        rlp::decode(&raw).ok()
    }
}
