use std::sync::Arc;

use qstate::common::{
    Coin, StateId, StorageReference, StorageValue, TransactionReference,
};
use qstate::err::{DeliverError, Rejection};
use qstate::exec::{ExecEnv, Workers};
use qstate::resp::{FieldId, Response};
use qstate::state::{base_of, StateStore, Store, StoreParams};
use qstate::tx::{
    CodeInstallRequest, InstanceCallRequest, Request,
    SystemCodeInstallRequest,
};

use qstate_tools::dummy::{
    blank_sig, install_genesis, DummyExecutor, Genesis, GenesisParams,
    MemStateStore, ACCOUNT_CLASS,
};

async fn genesis_store(
    params: &GenesisParams,
) -> (Arc<MemStateStore>, Arc<Store>, Genesis) {
    let db = MemStateStore::new();
    let executor = DummyExecutor::new();
    let workers = Arc::new(Workers::new(2));
    let store = Store::new(
        db.read(None),
        StateId::zero().clone(),
        executor,
        workers,
        None,
        StoreParams::default(),
    );
    let mut m = store.begin(0);
    let g = install_genesis(&mut m, params).await.unwrap();
    let (store, _) = m.into_store(&*db).await.unwrap();
    (db, store, g)
}

fn set_call(
    g: &Genesis, nonce: u64, receiver: &StorageReference, name: &str,
    value: u64,
) -> Request {
    Request::InstanceCall(InstanceCallRequest {
        caller: g.gamete.clone(),
        nonce,
        gas_limit: 10_000,
        gas_price: 100u64.into(),
        classpath: g.classpath.clone(),
        receiver: receiver.clone(),
        method: "set".into(),
        args: vec![
            StorageValue::Str(name.into()),
            StorageValue::U256(value.into()),
        ],
        sig: blank_sig(),
    })
}

async fn u256_field(
    store: &Store, object: &StorageReference, class: &str, name: &str,
) -> Option<u64> {
    match store
        .field_value(object, &FieldId::new(class, name))
        .await
        .unwrap()
    {
        Some(StorageValue::U256(x)) => Some(x.as_u64()),
        _ => None,
    }
}

#[tokio::test]
async fn test_genesis_reaches_consensus() {
    let params = GenesisParams::default();
    let (_db, store, g) = genesis_store(&params).await;
    assert_eq!(store.get_manifest().await, Some(g.manifest.clone()));
    let cfg = store.get_config().await.unwrap();
    assert_eq!(cfg.chain_id, params.chain_id.into());
    assert_eq!(cfg.max_gas_per_transaction, params.max_gas);
    assert_eq!(cfg.initial_supply, params.initial_supply);
    assert_eq!(cfg.final_supply, params.final_supply);
    assert_eq!(cfg.initial_inflation, params.inflation);
    // the snapshot is no longer the zero state
    assert!(!store.state_id().is_zero());
}

#[tokio::test]
async fn test_system_code_install_touches_no_history() {
    let (db, store, g) = genesis_store(&GenesisParams::default()).await;
    let mut m = store.begin(1);
    let req = Request::SystemCodeInstall(SystemCodeInstallRequest {
        module: (&b"extra code"[..]).into(),
        deps: vec![g.classpath.clone()],
    });
    let reference = req.reference();
    let (r, resp) = m.deliver(req).await.unwrap();
    assert_eq!(r, reference);
    assert!(matches!(resp, Response::CodeInstalled(_)));
    let (next, _) = m.into_store(&*db).await.unwrap();
    assert!(next.get_request(&reference).await.is_some());
    assert!(next.get_response(&reference).await.is_some());
    // a code install creates no storage object: histories are untouched
    for object in [&g.gamete, &g.manifest, &g.validators] {
        assert_eq!(
            next.get_history(object).await,
            store.get_history(object).await
        );
    }
}

#[tokio::test]
async fn test_paid_code_install_roundtrip() {
    let (db, store, g) = genesis_store(&GenesisParams::default()).await;
    let mut m = store.begin(1);
    let req = Request::CodeInstall(CodeInstallRequest {
        caller: g.gamete.clone(),
        nonce: 5, // five constructor calls ran at genesis
        gas_limit: 10_000,
        gas_price: 100u64.into(),
        classpath: g.classpath.clone(),
        module: (&b"user code"[..]).into(),
        deps: Vec::new(),
        sig: blank_sig(),
    });
    let reference = req.reference();
    let (_, resp) = m.deliver(req).await.unwrap();
    assert!(matches!(resp, Response::CodeInstalled(_)));
    let (next, _) = m.into_store(&*db).await.unwrap();
    assert!(next.get_request(&reference).await.is_some());
    assert!(next.get_response(&reference).await.is_some());
}

#[tokio::test]
async fn test_rejected_request_leaves_no_trace() {
    let (db, store, g) = genesis_store(&GenesisParams::default()).await;
    let mut m = store.begin(1);
    // wrong nonce: the gamete is at 5 after genesis
    let req = set_call(&g, 99, &g.manifest, "extra", 1);
    let reference = req.reference();
    match m.deliver(req).await {
        Err(DeliverError::Rejected(Rejection::NonceMismatch { .. })) => (),
        other => panic!("expected a nonce rejection, got {:?}", other.err()),
    }
    let (next, _) = m.into_store(&*db).await.unwrap();
    assert!(next.get_request(&reference).await.is_none());
    assert!(next.get_response(&reference).await.is_none());
    // nothing was delivered, so the state did not even change
    assert_eq!(next.state_id(), store.state_id());
}

#[tokio::test]
async fn test_check_mutates_nothing() {
    let (db, store, g) = genesis_store(&GenesisParams::default()).await;
    let good = set_call(&g, 5, &g.manifest, "extra", 1);
    assert!(store.check(&good).await.is_ok());
    let bad = set_call(&g, 99, &g.manifest, "extra", 1);
    assert!(matches!(
        store.check(&bad).await,
        Err(DeliverError::Rejected(_))
    ));
    // no transaction was staged against the persistence layer
    assert!(!db.has_staged());
    assert!(store.get_request(&good.reference()).await.is_none());
}

#[tokio::test]
async fn test_history_scan_matches_chronological_replay() {
    let (db, store, g) = genesis_store(&GenesisParams::default()).await;
    let mut m = store.begin(1);
    // an uneven mix of writes over three fields of the same object
    let writes: &[(&str, u64)] = &[
        ("a", 1),
        ("b", 2),
        ("a", 3),
        ("c", 4),
        ("a", 5),
        ("b", 6),
        ("a", 7),
    ];
    let mut nonce = 5;
    for (name, value) in writes {
        m.deliver(set_call(&g, nonce, &g.versions, name, *value))
            .await
            .unwrap();
        nonce += 1;
    }
    let (next, _) = m.into_store(&*db).await.unwrap();
    // newest-first scan must agree with the last chronological write
    assert_eq!(
        u256_field(&next, &g.versions, "Versions", "a").await,
        Some(7)
    );
    assert_eq!(
        u256_field(&next, &g.versions, "Versions", "b").await,
        Some(6)
    );
    assert_eq!(
        u256_field(&next, &g.versions, "Versions", "c").await,
        Some(4)
    );
    // the history stays proportional to the distinct fields, not the writes:
    // latest entry + one per shadowed-but-live field + the creation anchor
    let history = next.get_history(&g.versions).await.unwrap();
    assert!(
        history.len() <= 4,
        "history grew to {} entries",
        history.len()
    );
}

#[tokio::test]
async fn test_random_history_cross_validate() {
    use rand::{Rng, SeedableRng};
    use std::collections::HashMap;
    let (db, store, g) = genesis_store(&GenesisParams::default()).await;
    let mut rng = rand::rngs::StdRng::from_seed([7; 32]);
    let mut expected: HashMap<String, u64> = HashMap::new();
    let mut store = store;
    let mut nonce = 5;
    let mut next_val = 1u64;
    for block in 0..5 {
        let mut m = store.begin(block);
        for _ in 0..rng.gen_range(1..20) {
            let name = format!("f{}", rng.gen_range(0..6));
            m.deliver(set_call(&g, nonce, &g.versions, &name, next_val))
                .await
                .unwrap();
            expected.insert(name, next_val);
            nonce += 1;
            next_val += 1;
        }
        let (next, _) = m.into_store(&*db).await.unwrap();
        store = next;
    }
    // the compacted histories answer exactly like a chronological replay
    for (name, value) in &expected {
        assert_eq!(
            u256_field(&store, &g.versions, "Versions", name).await,
            Some(*value)
        );
    }
    let history = store.get_history(&g.versions).await.unwrap();
    assert!(
        history.len() <= expected.len() + 2,
        "history grew to {} entries for {} fields",
        history.len(),
        expected.len()
    );
}

#[tokio::test]
async fn test_overwrite_keeps_two_entries() {
    let (db, store, g) = genesis_store(&GenesisParams::default()).await;
    let mut m = store.begin(1);
    m.deliver(set_call(&g, 5, &g.versions, "x", 1)).await.unwrap();
    m.deliver(set_call(&g, 6, &g.versions, "x", 2)).await.unwrap();
    let (next, _) = m.into_store(&*db).await.unwrap();
    // second write shadows the first completely: new entry + anchor
    let history = next.get_history(&g.versions).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(
        u256_field(&next, &g.versions, "Versions", "x").await,
        Some(2)
    );
}

#[tokio::test]
async fn test_reward_clamps_at_final_supply() {
    // 10% inflation but almost no headroom left before the final supply
    let params = GenesisParams {
        initial_supply: 1_000_000u64.into(),
        final_supply: 1_000_100u64.into(),
        inflation: 100_000,
        ..GenesisParams::default()
    };
    let (db, store, g) = genesis_store(&params).await;
    let mut m = store.begin(1);
    let mut nonce = 5;
    for i in 0..5 {
        m.deliver(set_call(&g, nonce, &g.versions, "x", i))
            .await
            .unwrap();
        nonce += 1;
    }
    m.deliver_reward("v1 v2", "").await.unwrap();
    let (next, _) = m.into_store(&*db).await.unwrap();
    // 5 calls * 100 gas * 100 price = 50_000 fees, 10% inflation would mint
    // 5_000 coins, but only 100 fit under the final supply
    assert_eq!(
        u256_field(&next, &g.validators, "Validators", "currentSupply").await,
        Some(1_000_100)
    );
    // the validators were still credited the fees plus the clamped mint
    assert_eq!(
        u256_field(&next, &g.validators, "Validators", "balance").await,
        Some(50_100)
    );
}

#[tokio::test]
async fn test_noop_reward_is_not_pushed() {
    let (db, store, _g) = genesis_store(&GenesisParams::default()).await;
    let mut m = store.begin(1);
    // no paid request was delivered: the reward would only bump the nonce
    m.deliver_reward("v1", "").await.unwrap();
    let (next, _) = m.into_store(&*db).await.unwrap();
    assert_eq!(next.state_id(), store.state_id());
}

#[tokio::test]
async fn test_coinbase_splits_and_corrects() {
    let (db, store, g) = genesis_store(&GenesisParams::default()).await;
    let mut m = store.begin(1);
    m.deliver_coinbase(1_000u64.into(), "nodek", "minerk")
        .await
        .unwrap();
    let (next, _) = m.into_store(&*db).await.unwrap();
    let ledger_class = next.class_tag(&g.ledger).await.unwrap().unwrap();
    let mut accounts = Vec::new();
    for key in ["nodek", "minerk"] {
        let bound = next
            .field_value(
                &g.ledger,
                &FieldId::new(&ledger_class, &format!("account:{}", key)),
            )
            .await
            .unwrap();
        match bound {
            Some(StorageValue::Ref(account)) => accounts.push(account),
            other => panic!("{} not credited: {:?}", key, other),
        }
    }
    // both freshly created accounts got progressive index zero, which is
    // only possible through the corrective second transaction
    assert!(accounts.iter().all(|a| a.progressive == 0));
    assert_ne!(accounts[0].transaction, accounts[1].transaction);
    for account in &accounts {
        assert_eq!(
            u256_field(&next, account, ACCOUNT_CLASS, "balance").await,
            Some(500)
        );
    }

    // a second coinbase finds both ledger accounts and needs one call
    let mut m = next.begin(2);
    m.deliver_coinbase(1_000u64.into(), "nodek", "minerk")
        .await
        .unwrap();
    let (last, _) = m.into_store(&*db).await.unwrap();
    for account in &accounts {
        assert_eq!(
            u256_field(&last, account, ACCOUNT_CLASS, "balance").await,
            Some(1_000)
        );
    }
}

#[tokio::test]
async fn test_checkout_with_same_cache_is_idempotent() {
    let (db, store, g) = genesis_store(&GenesisParams::default()).await;
    let mut m = store.begin(1);
    m.deliver(set_call(&g, 5, &g.versions, "x", 1)).await.unwrap();
    let executor = DummyExecutor::new();
    let workers = Arc::new(Workers::new(2));
    let f = m.finish();
    let id = db.apply(base_of(&f.base), &f.delta).await.unwrap();
    db.commit(&id, f.now).unwrap();
    let s1 = Store::checked_out(
        &*db,
        &id,
        executor.clone(),
        workers.clone(),
        Some(f.cache.duplicate()),
        StoreParams::default(),
    )
    .unwrap();
    let s2 = Store::checked_out(
        &*db,
        &id,
        executor,
        workers,
        Some(f.cache),
        StoreParams::default(),
    )
    .unwrap();
    assert_eq!(s1.state_id(), s2.state_id());
    assert_eq!(s1.get_manifest().await, s2.get_manifest().await);
    assert_eq!(
        s1.get_history(&g.versions).await,
        s2.get_history(&g.versions).await
    );
    assert_eq!(
        s1.get_config().await.unwrap(),
        s2.get_config().await.unwrap()
    );
}

#[tokio::test]
async fn test_view_run_reads_without_pushing() {
    let (db, store, g) = genesis_store(&GenesisParams::default()).await;
    let view = store.begin_view();
    let req = InstanceCallRequest {
        caller: g.gamete.clone(),
        nonce: 5,
        gas_limit: 10_000,
        gas_price: 100u64.into(),
        classpath: g.classpath.clone(),
        receiver: g.manifest.clone(),
        method: "chainId".into(),
        args: Vec::new(),
        sig: blank_sig(),
    };
    let result = view.run_instance_view(req).await.unwrap();
    assert_eq!(
        result,
        Some(StorageValue::U256(
            GenesisParams::default().chain_id.into()
        ))
    );
    assert!(!db.has_staged());
}

#[tokio::test]
async fn test_unknown_reference_reads_none() {
    let (_db, store, _g) = genesis_store(&GenesisParams::default()).await;
    let missing = TransactionReference::hash(b"never delivered");
    assert!(store.get_request(&missing).await.is_none());
    assert!(store.get_response(&missing).await.is_none());
    assert!(matches!(
        store.request_of(&missing).await,
        Err(Rejection::UnknownReference(_))
    ));
    assert!(matches!(
        store.response_of(&missing).await,
        Err(Rejection::UnknownReference(_))
    ));
    let ghost = StorageReference::new(missing, 0);
    assert!(store.get_history(&ghost).await.is_none());
}

#[tokio::test]
async fn test_signature_verification_is_memoized() {
    use qstate::tx::{key_fingerprint, sign_hash};
    let (_db, store, g) = genesis_store(&GenesisParams::default()).await;
    let secret = [0x21; 32];
    let key = key_fingerprint(&secret).unwrap();

    let mut req = set_call(&g, 5, &g.versions, "x", 1);
    let hash = req.sig_hash().unwrap();
    if let Request::InstanceCall(p) = &mut req {
        p.sig = sign_hash(&hash, &secret).unwrap();
    }
    assert!(store.verify_signature(&req, &key).await.unwrap());
    // second answer comes from the bounded cache, same verdict
    assert!(store.verify_signature(&req, &key).await.unwrap());

    // a different request signed by someone else does not match this key
    let mut other = set_call(&g, 6, &g.versions, "x", 1);
    let hash = other.sig_hash().unwrap();
    if let Request::InstanceCall(p) = &mut other {
        p.sig = sign_hash(&hash, &[0x22; 32]).unwrap();
    }
    assert!(!store.verify_signature(&other, &key).await.unwrap());
    // an unsigned system request can never verify
    let system = Request::SystemCodeInstall(
        qstate::tx::SystemCodeInstallRequest {
            module: (&b"m"[..]).into(),
            deps: Vec::new(),
        },
    );
    assert!(!store.verify_signature(&system, &key).await.unwrap());
}

#[tokio::test]
async fn test_gas_price_event_invalidates_cache() {
    let (db, store, g) = genesis_store(&GenesisParams::default()).await;
    // warm the caches, then raise the gas price and fire the update event
    assert_eq!(
        store.gas_price().await.unwrap(),
        Coin::from(100u64)
    );
    let mut m = store.begin(1);
    m.deliver(set_call(&g, 5, &g.gas_station, "gasPrice", 250))
        .await
        .unwrap();
    let emit = Request::InstanceCall(InstanceCallRequest {
        caller: g.gamete.clone(),
        nonce: 6,
        gas_limit: 10_000,
        gas_price: 100u64.into(),
        classpath: g.classpath.clone(),
        receiver: g.gas_station.clone(),
        method: "emit".into(),
        args: vec![StorageValue::Str("GasPriceUpdate".into())],
        sig: blank_sig(),
    });
    m.deliver(emit).await.unwrap();
    let (next, _) = m.into_store(&*db).await.unwrap();
    assert_eq!(next.gas_price().await.unwrap(), Coin::from(250u64));
}
