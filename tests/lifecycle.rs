use std::sync::Arc;
use std::time::Duration;

use qstate::common::{Coin, StateId, StorageValue};
use qstate::err::{DeliverError, Fault, Rejection};
use qstate::node::{BlockMetadata, Node, NodeConfig};
use qstate::state::StateStore;
use qstate::tx::{InstanceCallRequest, Request};

use qstate_tools::dummy::{
    blank_sig, genesis_requests, DummyExecutor, Genesis, GenesisParams,
    MemStateStore, RecordingSink,
};

fn metadata() -> BlockMetadata {
    BlockMetadata {
        behaving: "v1".into(),
        misbehaving: "".into(),
        reward: Coin::from(1_000u64),
        node_key: "nodek".into(),
        miner_key: "minerk".into(),
    }
}

fn new_node() -> (Arc<MemStateStore>, Arc<RecordingSink>, Node) {
    let db = MemStateStore::new();
    let sink = RecordingSink::new();
    let node = Node::new(
        db.clone(),
        DummyExecutor::new(),
        sink.clone(),
        NodeConfig::default(),
    );
    (db, sink, node)
}

/// Drive a full genesis block through the node and commit it.
async fn committed_genesis(node: &Node) -> (StateId, Genesis) {
    let (requests, genesis) = genesis_requests(&GenesisParams::default());
    let group = node
        .begin_block(0, 0, Node::initial_state_id())
        .unwrap();
    for req in requests {
        node.deliver_transaction(group, &req.encode())
            .await
            .unwrap();
    }
    let state = node.end_block(group, &metadata()).await.unwrap();
    let committed = node.commit_block(group).unwrap();
    assert_eq!(state, committed);
    (state, genesis)
}

#[tokio::test]
async fn test_full_block_lifecycle() {
    let (db, _sink, node) = new_node();
    let (state, _genesis) = committed_genesis(&node).await;
    assert!(!state.is_zero());
    assert!(db.contains(&state));
    assert_eq!(db.checkpoint_count(), 1);
    assert!(!db.has_staged());

    // a next block opens on the committed head and reuses its cache
    let group = node.begin_block(1, 10, &state).unwrap();
    let next = node.end_block(group, &metadata()).await.unwrap();
    node.commit_block(group).unwrap();
    assert!(db.contains(&next));
}

#[tokio::test]
async fn test_undecodable_bytes_are_rejected() {
    let (db, _sink, node) = new_node();
    let group = node
        .begin_block(0, 0, Node::initial_state_id())
        .unwrap();
    match node.deliver_transaction(group, b"garbage").await {
        Err(DeliverError::Rejected(Rejection::Malformed(_))) => (),
        other => panic!("expected malformed rejection, got {:?}", other.err()),
    }
    node.abort_block(group).unwrap();
    assert!(!db.has_staged());
}

#[tokio::test]
async fn test_commit_or_abort_exactly_once() {
    let (_db, _sink, node) = new_node();
    let (state, _genesis) = committed_genesis(&node).await;

    let group = node.begin_block(1, 10, &state).unwrap();
    node.end_block(group, &metadata()).await.unwrap();
    node.commit_block(group).unwrap();
    // the group is spent: neither commit nor abort may run again
    assert!(matches!(
        node.commit_block(group),
        Err(Fault::UnknownGroup(_))
    ));
    assert!(matches!(
        node.abort_block(group),
        Err(Fault::UnknownGroup(_))
    ));

    let group = node.begin_block(2, 20, &state).unwrap();
    node.end_block(group, &metadata()).await.unwrap();
    node.abort_block(group).unwrap();
    assert!(matches!(
        node.commit_block(group),
        Err(Fault::UnknownGroup(_))
    ));
}

#[tokio::test]
async fn test_abort_without_end_block() {
    let (db, _sink, node) = new_node();
    let (state, genesis) = committed_genesis(&node).await;
    let checkpoints = db.checkpoint_count();

    let group = node.begin_block(1, 10, &state).unwrap();
    let set = Request::InstanceCall(InstanceCallRequest {
        caller: genesis.gamete.clone(),
        nonce: 5,
        gas_limit: 10_000,
        gas_price: 100u64.into(),
        classpath: genesis.classpath.clone(),
        receiver: genesis.versions.clone(),
        method: "set".into(),
        args: vec![
            StorageValue::Str("x".into()),
            StorageValue::U256(1.into()),
        ],
        sig: blank_sig(),
    });
    node.deliver_transaction(group, &set.encode()).await.unwrap();
    node.abort_block(group).unwrap();

    // nothing persisted, nothing staged, the group id is dead
    assert_eq!(db.checkpoint_count(), checkpoints);
    assert!(!db.has_staged());
    assert!(matches!(
        node.deliver_transaction(group, &set.encode()).await,
        Err(DeliverError::Fault(Fault::UnknownGroup(_)))
    ));
}

#[tokio::test]
async fn test_commit_before_end_is_refused() {
    let (_db, _sink, node) = new_node();
    let group = node
        .begin_block(0, 0, Node::initial_state_id())
        .unwrap();
    assert!(matches!(
        node.commit_block(group),
        Err(Fault::NotSealed(_))
    ));
    // the group survives the refusal and can still be aborted
    node.abort_block(group).unwrap();
}

#[tokio::test]
async fn test_system_calls_cannot_be_submitted() {
    let (_db, _sink, node) = new_node();
    let (state, genesis) = committed_genesis(&node).await;
    let group = node.begin_block(1, 10, &state).unwrap();
    let foreign = Request::SystemCall(qstate::tx::SystemCallRequest {
        caller: genesis.manifest.clone(),
        nonce: 0,
        receiver: genesis.validators.clone(),
        method: "rewardValidators".into(),
        args: Vec::new(),
    });
    assert!(matches!(
        node.deliver_transaction(group, &foreign.encode()).await,
        Err(DeliverError::Rejected(Rejection::Malformed(_)))
    ));
    node.abort_block(group).unwrap();
}

#[tokio::test]
async fn test_events_notified_after_commit() {
    let (_db, sink, node) = new_node();
    let (state, genesis) = committed_genesis(&node).await;

    let group = node.begin_block(1, 10, &state).unwrap();
    let emit = Request::InstanceCall(InstanceCallRequest {
        caller: genesis.gamete.clone(),
        nonce: 5,
        gas_limit: 10_000,
        gas_price: 100u64.into(),
        classpath: genesis.classpath.clone(),
        receiver: genesis.versions.clone(),
        method: "emit".into(),
        args: vec![StorageValue::Str("SomethingHappened".into())],
        sig: blank_sig(),
    });
    node.deliver_transaction(group, &emit.encode()).await.unwrap();
    assert!(sink.is_empty()); // nothing before commit
    node.end_block(group, &metadata()).await.unwrap();
    assert!(sink.is_empty());
    node.commit_block(group).unwrap();

    // the publisher thread delivers shortly after commit
    let mut waited = 0;
    while sink.is_empty() && waited < 1_000 {
        std::thread::sleep(Duration::from_millis(10));
        waited += 10;
    }
    let notified = sink.taken();
    assert_eq!(notified.len(), 1);
    assert_eq!(notified[0].0, genesis.versions);
}

#[tokio::test]
async fn test_unknown_state_cannot_be_checked_out() {
    let (_db, _sink, node) = new_node();
    let ghost = StateId::from([7; 32]);
    assert!(matches!(
        node.begin_block(0, 0, &ghost),
        Err(Fault::UnknownState(_))
    ));
}

#[tokio::test]
async fn test_keep_from_prunes_old_checkpoints() {
    let (db, _sink, node) = new_node();
    // genesis committed at now = 0
    let (state, genesis) = committed_genesis(&node).await;

    // a later block at now = 100
    let group = node.begin_block(1, 100, &state).unwrap();
    let set = Request::InstanceCall(InstanceCallRequest {
        caller: genesis.gamete.clone(),
        nonce: 5,
        gas_limit: 10_000,
        gas_price: 100u64.into(),
        classpath: genesis.classpath.clone(),
        receiver: genesis.versions.clone(),
        method: "set".into(),
        args: vec![
            StorageValue::Str("x".into()),
            StorageValue::U256(1.into()),
        ],
        sig: blank_sig(),
    });
    node.deliver_transaction(group, &set.encode()).await.unwrap();
    let newer = node.end_block(group, &metadata()).await.unwrap();
    node.commit_block(group).unwrap();

    assert_eq!(node.keep_from(50).unwrap(), 1);
    assert!(!db.contains(&state));
    assert!(db.contains(&newer));
}
