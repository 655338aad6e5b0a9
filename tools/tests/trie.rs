use std::sync::Arc;

use qstate::common::{
    StateId, StorageReference, StorageValue, TransactionReference,
};
use qstate::exec::Workers;
use qstate::resp::{FieldId, MethodCalledResponse, Response, Update};
use qstate::state::{StateStore, Store, StoreDelta, StoreParams};
use qstate::tx::{Request, SystemCallRequest};

use qstate_tools::dummy::{install_genesis, DummyExecutor, GenesisParams};
use qstate_tools::index::BlockIndex;
use qstate_tools::trie::TrieStore;

fn fresh_db(path: &str) -> rocksdb::DB {
    rocksdb::DB::destroy(&rocksdb::Options::default(), path).unwrap();
    rocksdb::DB::open_default(path).unwrap()
}

fn sample_request(tag: &str) -> Request {
    Request::SystemCall(SystemCallRequest {
        caller: StorageReference::new(
            TransactionReference::hash(b"caller"),
            0,
        ),
        nonce: 0,
        receiver: StorageReference::new(
            TransactionReference::hash(b"receiver"),
            0,
        ),
        method: tag.into(),
        args: Vec::new(),
    })
}

fn sample_delta(tag: &str) -> (StoreDelta, TransactionReference) {
    let req = sample_request(tag);
    let reference = req.reference();
    let object =
        StorageReference::new(TransactionReference::hash(b"object"), 0);
    let resp = Response::MethodCalled(MethodCalledResponse {
        result: Some(StorageValue::Str(tag.into())),
        updates: vec![Update::Field {
            object: object.clone(),
            field: FieldId::new("Thing", "f"),
            value: StorageValue::Str(tag.into()),
        }],
        events: Vec::new(),
        gas: 7,
    });
    let mut delta = StoreDelta::default();
    delta.requests.insert(reference.clone(), req);
    delta.responses.insert(reference.clone(), resp);
    delta
        .histories
        .insert(object, vec![reference.clone()]);
    delta.manifest = Some(StorageReference::new(reference.clone(), 0));
    (delta, reference)
}

#[tokio::test]
async fn test_commit_checkout_roundtrip() {
    let path = "./trie-roundtrip";
    let (delta, reference) = sample_delta("hello");
    let id;
    {
        let store = TrieStore::new(fresh_db(path), b"trie");
        id = store.apply(None, &delta).await.unwrap();
        store.commit(&id, 42).unwrap();
        assert!(store.contains(&id));
    }
    // a reopened database still has the whole state
    let store = TrieStore::new(rocksdb::DB::open_default(path).unwrap(), b"trie");
    assert!(store.contains(&id));
    let reader = store.read(Some(&id));
    let req = reader.request(&reference).await.unwrap();
    assert_eq!(req.reference(), reference);
    let resp = reader.response(&reference).await.unwrap();
    assert!(matches!(resp, Response::MethodCalled(_)));
    let object =
        StorageReference::new(TransactionReference::hash(b"object"), 0);
    assert_eq!(
        reader.history(&object).await,
        Some(vec![reference.clone()])
    );
    assert_eq!(
        reader.manifest().await,
        Some(StorageReference::new(reference, 0))
    );
    // the empty read view answers nothing
    let empty = store.read(None);
    assert!(empty.manifest().await.is_none());
}

#[tokio::test]
async fn test_abort_discards_staged_writes() {
    let path = "./trie-abort";
    let store = TrieStore::new(fresh_db(path), b"trie");
    let (delta, reference) = sample_delta("doomed");
    let id = store.apply(None, &delta).await.unwrap();
    store.abort();
    assert!(!store.contains(&id));
    // nothing reached the database: the root resolves to no data
    let reader = store.read(Some(&id));
    assert!(reader.request(&reference).await.is_none());
    // the pending slot is free again after the abort
    let id2 = store.apply(None, &delta).await.unwrap();
    assert_eq!(id, id2);
    store.commit(&id2, 1).unwrap();
    assert!(store.contains(&id2));
}

#[tokio::test]
async fn test_only_one_commit_in_flight() {
    let path = "./trie-exclusive";
    let store = TrieStore::new(fresh_db(path), b"trie");
    let (delta, _) = sample_delta("first");
    store.apply(None, &delta).await.unwrap();
    let (other, _) = sample_delta("second");
    assert!(store.apply(None, &other).await.is_err());
}

#[tokio::test]
async fn test_keep_from_drops_old_checkpoints() {
    let path = "./trie-gc";
    let store = TrieStore::new(fresh_db(path), b"trie");
    let (delta1, reference) = sample_delta("old");
    let id1 = store.apply(None, &delta1).await.unwrap();
    store.commit(&id1, 10).unwrap();
    let (delta2, _) = sample_delta("new");
    let id2 = store.apply(Some(&id1), &delta2).await.unwrap();
    store.commit(&id2, 20).unwrap();

    assert_eq!(store.keep_from(15).unwrap(), 1);
    assert!(!store.contains(&id1));
    assert!(store.contains(&id2));
    // the node store is copy-on-write: the collected state can no longer be
    // checked out, but its data is still there for the newer state
    let reader = store.read(Some(&id2));
    assert!(reader.request(&reference).await.is_some());
    assert_eq!(store.keep_from(15).unwrap(), 0);
}

#[tokio::test]
async fn test_state_ids_are_content_addressed() {
    let path_a = "./trie-content-a";
    let path_b = "./trie-content-b";
    let (delta, _) = sample_delta("same");
    let a = TrieStore::new(fresh_db(path_a), b"trie");
    let b = TrieStore::new(fresh_db(path_b), b"trie");
    let id_a = a.apply(None, &delta).await.unwrap();
    let id_b = b.apply(None, &delta).await.unwrap();
    // two nodes applying the same writes agree on the state id
    assert_eq!(id_a, id_b);
    let (other, _) = sample_delta("different");
    a.abort();
    let id_c = a.apply(None, &other).await.unwrap();
    assert_ne!(id_a, id_c);
}

#[tokio::test]
async fn test_genesis_on_trie_store() {
    let path = "./trie-genesis";
    let db: Arc<TrieStore> =
        Arc::new(TrieStore::new(fresh_db(path), b"trie"));
    let params = GenesisParams::default();
    let store = Store::new(
        db.read(None),
        StateId::zero().clone(),
        DummyExecutor::new(),
        Arc::new(Workers::new(2)),
        None,
        StoreParams::default(),
    );
    let mut m = store.begin(0);
    let genesis = install_genesis(&mut m, &params).await.unwrap();
    let (head, _) = m.into_store(&*db).await.unwrap();
    assert_eq!(head.get_manifest().await, Some(genesis.manifest.clone()));
    let cfg = head.get_config().await.unwrap();
    assert_eq!(cfg.chain_id, params.chain_id.into());

    // cold checkout of the same id straight from the trie
    let again = Store::checked_out(
        &*db,
        head.state_id(),
        DummyExecutor::new(),
        Arc::new(Workers::new(2)),
        None,
        StoreParams::default(),
    )
    .unwrap();
    assert_eq!(again.get_manifest().await, Some(genesis.manifest));
    assert_eq!(
        again.get_history(&genesis.gamete).await,
        head.get_history(&genesis.gamete).await
    );
    assert_eq!(again.get_config().await.unwrap(), cfg);
}

#[test]
fn test_block_index_lifecycle() {
    use qstate::indexer::{IndexBatch, IndexStore, IndexedBlock};
    let path = "./index-test";
    let mut index = BlockIndex::new(fresh_db(path), b"idx");

    let block = |height: u64, tag: &[u8], txs: &[&[u8]]| IndexedBlock {
        height,
        hash: qstate::common::Hash::hash(tag),
        transactions: txs
            .iter()
            .map(|t| TransactionReference::hash(t))
            .collect(),
    };

    let blocks: [(u64, &[u8], &[&[u8]]); 3] = [
        (0, b"b0", &[b"t0"]),
        (1, b"b1", &[b"t1", b"t2"]),
        (2, b"b2", &[b"t3"]),
    ];
    for (h, tag, txs) in blocks {
        index
            .apply(IndexBatch {
                unbind: Vec::new(),
                bind: Some(block(h, tag, txs)),
                advance_base: None,
            })
            .unwrap();
    }
    assert_eq!(index.base().unwrap(), None);
    assert_eq!(index.top().unwrap(), Some(2));
    let (h, hash) = index
        .block_of(&TransactionReference::hash(b"t2"))
        .unwrap()
        .unwrap();
    assert_eq!(h, 1);
    assert_eq!(index.hash_at(1).unwrap(), Some(hash.clone()));
    assert_eq!(
        index.transactions_of(&hash).unwrap().unwrap().len(),
        2
    );

    // a reorganization unwinds heights 1..=2 and binds a new block
    index
        .apply(IndexBatch {
            unbind: vec![1, 2],
            bind: Some(block(1, b"b1'", &[b"t4"])),
            advance_base: None,
        })
        .unwrap();
    assert_eq!(index.top().unwrap(), Some(1));
    assert!(index
        .block_of(&TransactionReference::hash(b"t2"))
        .unwrap()
        .is_none());
    assert!(index
        .block_of(&TransactionReference::hash(b"t4"))
        .unwrap()
        .is_some());

    // pruning the oldest height advances the base watermark
    index
        .apply(IndexBatch {
            unbind: vec![0],
            bind: None,
            advance_base: Some(0),
        })
        .unwrap();
    assert_eq!(index.base().unwrap(), Some(0));
    assert!(index.hash_at(0).unwrap().is_none());
    assert!(index
        .block_of(&TransactionReference::hash(b"t0"))
        .unwrap()
        .is_none());
    assert_eq!(index.top().unwrap(), Some(1));
}
