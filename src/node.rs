use std::collections::hash_map::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc};

use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::cache::StoreCache;
use crate::common::{Coin, StateId, StorageReference, TransactionReference};
use crate::err::{DeliverError, Fault, Rejection};
use crate::exec::{CodeExecutor, Workers};
use crate::resp::{Event, Response};
use crate::state::{base_of, StateStore, Store, StoreMut, StoreParams};
use crate::tx::Request;

/// Downstream collaborator notified of (creator, event) pairs, once per
/// delivered transaction carrying events, after commit ordering is
/// established.
pub trait EventSink: Send + Sync {
    fn notify(&self, creator: &StorageReference, event: &StorageReference);
}

/// Node-local configuration. None of this is consensus-critical; two nodes
/// may disagree on all of it and still agree on every state id.
#[derive(Clone, Debug, Default, serde::Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub store: StoreParams,
    /// Worker threads for CPU-bound sub-tasks.
    pub workers: usize,
}

/// What the consensus engine knows about a block when it closes it.
#[derive(Clone, Debug)]
pub struct BlockMetadata {
    /// Space-separated identifiers of the well-behaving validators.
    pub behaving: String,
    /// Space-separated identifiers of the misbehaving validators.
    pub misbehaving: String,
    /// The block reward to split between node and miner.
    pub reward: Coin,
    pub node_key: String,
    pub miner_key: String,
}

enum OpenBlock {
    /// Delivery still in progress.
    Building(StoreMut),
    /// `end_block` ran: the final state is staged in the persistence layer,
    /// waiting for exactly one of commit or abort.
    Sealed {
        state: StateId,
        now: u64,
        cache: StoreCache,
        events: Vec<Event>,
    },
}

/// The block-lifecycle surface the consensus engine drives. Each block under
/// construction lives in its own group: one transformation bound to its own
/// base snapshot, so several candidate blocks can be built concurrently.
pub struct Node {
    db: Arc<dyn StateStore>,
    executor: Arc<dyn CodeExecutor>,
    workers: Arc<Workers>,
    config: NodeConfig,
    groups: Mutex<HashMap<u64, OpenBlock>>,
    next_group: AtomicU64,
    // cache bundle of the last committed head, reused on checkout
    head_cache: Mutex<Option<(StateId, StoreCache)>>,
    publisher_tx: Option<mpsc::Sender<Vec<Event>>>,
    publisher: Option<std::thread::JoinHandle<()>>,
}

impl Node {
    pub fn new(
        db: Arc<dyn StateStore>, executor: Arc<dyn CodeExecutor>,
        sink: Arc<dyn EventSink>, config: NodeConfig,
    ) -> Self {
        let workers = Arc::new(Workers::new(config.workers.max(1)));
        let (publisher_tx, rx) = mpsc::channel::<Vec<Event>>();
        // events reach the sink from a dedicated thread, in commit order
        let publisher = std::thread::spawn(move || {
            while let Ok(batch) = rx.recv() {
                for ev in batch {
                    sink.notify(&ev.creator, &ev.object)
                }
            }
        });
        Self {
            db,
            executor,
            workers,
            config,
            groups: Mutex::new(HashMap::new()),
            next_group: AtomicU64::new(0),
            head_cache: Mutex::new(None),
            publisher_tx: Some(publisher_tx),
            publisher: Some(publisher),
        }
    }

    /// The well-known identifier of the empty genesis store.
    pub fn initial_state_id() -> &'static StateId {
        StateId::zero()
    }

    /// Reconstruct a snapshot at a state id, reusing the head cache bundle
    /// when the id matches the last committed head.
    pub fn checkout(&self, id: &StateId) -> Result<Arc<Store>, Fault> {
        let cache = {
            let head = self.head_cache.lock();
            match &*head {
                Some((hid, c)) if hid == id => Some(c.duplicate()),
                _ => None,
            }
        };
        Store::checked_out(
            &*self.db,
            id,
            self.executor.clone(),
            self.workers.clone(),
            cache,
            self.config.store.clone(),
        )
    }

    /// Open a transformation at `base`, to accumulate the block being built
    /// at `height`. Returns the group id all later lifecycle calls use.
    pub fn begin_block(
        &self, height: u64, when: u64, base: &StateId,
    ) -> Result<u64, Fault> {
        let store = self.checkout(base)?;
        let group = self.next_group.fetch_add(1, Ordering::Relaxed);
        let xform = store.begin(when);
        self.groups.lock().insert(group, OpenBlock::Building(xform));
        info!("block {} opened at {} under group {}", height, base, group);
        Ok(group)
    }

    /// Decode and deliver one raw transaction into the group's block. A
    /// decode failure or a rejection is reported to the submitter's waiting
    /// caller and leaves no persistent effect.
    pub async fn deliver_transaction(
        &self, group: u64, raw: &[u8],
    ) -> Result<(TransactionReference, Response), DeliverError> {
        let req = Request::decode(raw).ok_or_else(|| {
            Rejection::Malformed("undecodable request bytes".into())
        })?;
        if let Request::SystemCall(_) = req {
            // only the engine itself synthesizes these
            return Err(Rejection::Malformed(
                "system calls cannot be submitted".into(),
            )
            .into())
        }
        let mut xform = self.take_building(group)?;
        let result = xform.deliver(req).await;
        self.groups.lock().insert(group, OpenBlock::Building(xform));
        if let Err(e) = &result {
            debug!("group {}: request refused: {}", group, e);
        }
        result
    }

    /// Close the group's block: deliver the validator reward and the
    /// coinbase, stage the accumulated writes and return the new state id.
    pub async fn end_block(
        &self, group: u64, md: &BlockMetadata,
    ) -> Result<StateId, Fault> {
        let mut xform = self.take_building(group)?;
        xform
            .deliver_reward(&md.behaving, &md.misbehaving)
            .await
            .map_err(|e| e.into_fault("validator reward"))?;
        xform
            .deliver_coinbase(md.reward.clone(), &md.node_key, &md.miner_key)
            .await
            .map_err(|e| e.into_fault("coinbase"))?;
        let f = xform.finish();
        let state = self.db.apply(base_of(&f.base), &f.delta).await?;
        self.groups.lock().insert(
            group,
            OpenBlock::Sealed {
                state: state.clone(),
                now: f.now,
                cache: f.cache,
                events: f.events,
            },
        );
        info!("group {} sealed at {}", group, state);
        Ok(state)
    }

    /// Persist the staged block of this group and release it. The new head
    /// cache is retained for the next checkout; pending event notifications
    /// go out now that commit ordering is established.
    pub fn commit_block(&self, group: u64) -> Result<StateId, Fault> {
        let taken = self.groups.lock().remove(&group);
        let (state, now, cache, events) = match taken {
            Some(OpenBlock::Sealed { state, now, cache, events }) => {
                (state, now, cache, events)
            }
            Some(building) => {
                self.groups.lock().insert(group, building);
                return Err(Fault::NotSealed(group))
            }
            None => return Err(Fault::UnknownGroup(group)),
        };
        self.db.commit(&state, now)?;
        *self.head_cache.lock() = Some((state.clone(), cache));
        if !events.is_empty() {
            if let Err(_) =
                self.publisher_tx.as_ref().unwrap().send(events)
            {
                warn!("event publisher is gone, notifications dropped");
            }
        }
        info!("group {} committed at {}", group, state);
        Ok(state)
    }

    /// Discard the group's block: abort the staged transaction if one was
    /// opened, release the base snapshot, forget the group.
    pub fn abort_block(&self, group: u64) -> Result<(), Fault> {
        let taken = self.groups.lock().remove(&group);
        match taken {
            Some(OpenBlock::Building(xform)) => {
                // no persistence transaction was ever opened
                drop(xform);
                info!("group {} aborted before sealing", group);
                Ok(())
            }
            Some(OpenBlock::Sealed { state, .. }) => {
                self.db.abort();
                info!("group {} aborted, {} discarded", group, state);
                Ok(())
            }
            None => Err(Fault::UnknownGroup(group)),
        }
    }

    /// Garbage-collect states persisted before `cutoff`.
    pub fn keep_from(&self, cutoff: u64) -> Result<usize, Fault> {
        let removed = self.db.keep_from(cutoff)?;
        if removed > 0 {
            info!("garbage collected {} old states", removed);
        }
        Ok(removed)
    }

    fn take_building(&self, group: u64) -> Result<StoreMut, Fault> {
        let taken = self.groups.lock().remove(&group);
        match taken {
            Some(OpenBlock::Building(xform)) => Ok(xform),
            Some(sealed) => {
                self.groups.lock().insert(group, sealed);
                Err(Fault::UnknownGroup(group))
            }
            None => Err(Fault::UnknownGroup(group)),
        }
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        drop(self.publisher_tx.take());
        if let Some(t) = self.publisher.take() {
            t.join().unwrap()
        }
    }
}
