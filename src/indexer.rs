use std::sync::mpsc;
use std::time::Duration;

use log::{debug, warn};

use crate::common::{Hash, TransactionReference};
use crate::err::Fault;

/// One canonical block, as the indexer needs it: its position, identity and
/// the references of the transactions it contains.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct IndexedBlock {
    pub height: u64,
    pub hash: Hash,
    pub transactions: Vec<TransactionReference>,
}

/// Transient unavailability of the canonical chain. Logged and retried on
/// the next iteration, never fatal.
#[derive(thiserror::Error, Debug)]
pub enum ChainError {
    #[error("canonical chain unavailable: {0}")]
    Unavailable(String),
    #[error("block {0} not available yet")]
    MissingBlock(Hash),
    #[error("node closed")]
    Closed,
}

/// Read-only view of the canonical chain, as exposed by the consensus
/// engine. All methods may observe the chain mid-growth or mid-reorg; the
/// indexer copes by comparing hashes height by height.
pub trait ChainReader: Send {
    fn head_height(&self) -> Result<Option<u64>, ChainError>;
    /// Canonical block hashes for heights `from .. from + count`; may come
    /// back shorter when the chain is shorter.
    fn hashes(&self, from: u64, count: u64) -> Result<Vec<Hash>, ChainError>;
    fn block(&self, hash: &Hash) -> Result<Option<IndexedBlock>, ChainError>;
}

/// One atomic step against the auxiliary index: unwind some heights, bind a
/// block, advance the base watermark. Applied in a single database
/// transaction.
#[derive(Default)]
pub struct IndexBatch {
    pub unbind: Vec<u64>,
    pub bind: Option<IndexedBlock>,
    pub advance_base: Option<u64>,
}

/// The auxiliary transaction→block index: height↔hash, hash↔transaction
/// references, plus one entry per transaction. Unwinding a height drops all
/// three kinds of bindings for it.
pub trait IndexStore: Send {
    /// The base watermark `B`; bound heights are `B+1 ..= top`. `None` until
    /// the first prune.
    fn base(&self) -> Result<Option<u64>, Fault>;
    /// Highest bound height, if any.
    fn top(&self) -> Result<Option<u64>, Fault>;
    fn hash_at(&self, height: u64) -> Result<Option<Hash>, Fault>;
    fn transactions_of(
        &self, hash: &Hash,
    ) -> Result<Option<Vec<TransactionReference>>, Fault>;
    /// The block a transaction was included in: the index's whole purpose.
    fn block_of(
        &self, r: &TransactionReference,
    ) -> Result<Option<(u64, Hash)>, Fault>;
    fn apply(&mut self, batch: IndexBatch) -> Result<(), Fault>;
}

enum PassError {
    /// Retry next iteration.
    Chain(ChainError),
    /// The index is corrupted; terminate the loop.
    Fatal(Fault),
}

impl From<ChainError> for PassError {
    fn from(e: ChainError) -> Self {
        PassError::Chain(e)
    }
}

impl From<Fault> for PassError {
    fn from(e: Fault) -> Self {
        PassError::Fatal(e)
    }
}

/// Background reconciliation loop that mirrors the canonical chain into the
/// auxiliary index, detecting and repairing reorganizations and pruning
/// beyond a retention depth.
pub struct Indexer<C: ChainReader, D: IndexStore> {
    chain: C,
    db: D,
    /// How many heights stay bound above the base watermark.
    depth: u64,
    pause: Duration,
}

impl<C: ChainReader, D: IndexStore> Indexer<C, D> {
    pub fn new(chain: C, db: D, depth: u64, pause: Duration) -> Self {
        Self {
            chain,
            db,
            depth: depth.max(1),
            pause,
        }
    }

    /// Run forever with a fixed pause between iterations. A message (or the
    /// disconnection) of `stop` is a clean shutdown; a corrupted index
    /// terminates the loop with the fault.
    pub fn run(mut self, stop: &mpsc::Receiver<()>) -> Result<(), Fault> {
        loop {
            match self.reconcile() {
                Ok(0) => (),
                Ok(n) => debug!("indexer bound {} heights", n),
                Err(PassError::Chain(e)) => {
                    warn!("indexer pass failed, will retry: {}", e)
                }
                Err(PassError::Fatal(f)) => return Err(f),
            }
            match stop.recv_timeout(self.pause) {
                Err(mpsc::RecvTimeoutError::Timeout) => (),
                _ => return Ok(()),
            }
        }
    }

    /// One pass: walk the canonical hashes above the base watermark, repair
    /// every height whose indexed hash disagrees, keep the bound range
    /// within the retention depth. Returns how many heights were (re)bound.
    fn reconcile(&mut self) -> Result<u64, PassError> {
        let head = match self.chain.head_height()? {
            Some(h) => h,
            None => return Ok(0),
        };
        let start = match self.db.base()? {
            Some(b) => b + 1,
            None => 0,
        };
        let mut bound = 0;
        for h in start..=head {
            let canonical = match self.chain.hashes(h, 1)?.into_iter().next()
            {
                Some(c) => c,
                // the chain got shorter under us; next pass will see why
                None => break,
            };
            if self.db.hash_at(h)?.as_ref() == Some(&canonical) {
                continue
            }
            // disagreement (or nothing bound yet): everything indexed from
            // this height upward belongs to an abandoned branch
            let mut unbind = Vec::new();
            if let Some(top) = self.db.top()? {
                if top >= h {
                    debug!("reorganization: unwinding heights {}..={}", h, top);
                    unbind = (h..=top).collect();
                }
            }
            let block = self
                .chain
                .block(&canonical)?
                .ok_or(ChainError::MissingBlock(canonical))?;
            self.db.apply(IndexBatch {
                unbind,
                bind: Some(block),
                advance_base: None,
            })?;
            bound += 1;
            self.prune()?;
        }
        Ok(bound)
    }

    fn prune(&mut self) -> Result<(), Fault> {
        loop {
            let low = match self.db.base()? {
                Some(b) => b + 1,
                None => 0,
            };
            match self.db.top()? {
                Some(top) if top >= low && top - low + 1 > self.depth => {
                    debug!("pruning height {}", low);
                    self.db.apply(IndexBatch {
                        unbind: vec![low],
                        bind: None,
                        advance_base: Some(low),
                    })?;
                }
                _ => return Ok(()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::{BTreeMap, HashMap};
    use std::sync::Arc;

    #[derive(Clone)]
    struct TestChain(Arc<Mutex<Vec<IndexedBlock>>>);

    impl TestChain {
        fn new() -> Self {
            Self(Arc::new(Mutex::new(Vec::new())))
        }

        fn push_block(&self, txs: &[&[u8]]) {
            let mut chain = self.0.lock();
            let height = chain.len() as u64;
            let mut seed = height.to_le_bytes().to_vec();
            for t in txs {
                seed.extend_from_slice(t);
            }
            chain.push(IndexedBlock {
                height,
                hash: Hash::hash(&seed),
                transactions: txs
                    .iter()
                    .map(|t| TransactionReference::hash(t))
                    .collect(),
            });
        }

        fn reorg_to(&self, height: u64) {
            self.0.lock().truncate(height as usize);
        }
    }

    impl ChainReader for TestChain {
        fn head_height(&self) -> Result<Option<u64>, ChainError> {
            Ok(self.0.lock().last().map(|b| b.height))
        }
        fn hashes(
            &self, from: u64, count: u64,
        ) -> Result<Vec<Hash>, ChainError> {
            let chain = self.0.lock();
            Ok(chain
                .iter()
                .skip(from as usize)
                .take(count as usize)
                .map(|b| b.hash.clone())
                .collect())
        }
        fn block(
            &self, hash: &Hash,
        ) -> Result<Option<IndexedBlock>, ChainError> {
            Ok(self.0.lock().iter().find(|b| &b.hash == hash).cloned())
        }
    }

    #[derive(Default)]
    struct MemIndex {
        base: Option<u64>,
        heights: BTreeMap<u64, Hash>,
        blocks: HashMap<Hash, Vec<TransactionReference>>,
        txs: HashMap<TransactionReference, (u64, Hash)>,
    }

    impl IndexStore for MemIndex {
        fn base(&self) -> Result<Option<u64>, Fault> {
            Ok(self.base)
        }
        fn top(&self) -> Result<Option<u64>, Fault> {
            Ok(self.heights.keys().next_back().copied())
        }
        fn hash_at(&self, height: u64) -> Result<Option<Hash>, Fault> {
            Ok(self.heights.get(&height).cloned())
        }
        fn transactions_of(
            &self, hash: &Hash,
        ) -> Result<Option<Vec<TransactionReference>>, Fault> {
            Ok(self.blocks.get(hash).cloned())
        }
        fn block_of(
            &self, r: &TransactionReference,
        ) -> Result<Option<(u64, Hash)>, Fault> {
            Ok(self.txs.get(r).cloned())
        }
        fn apply(&mut self, batch: IndexBatch) -> Result<(), Fault> {
            for h in batch.unbind {
                if let Some(hash) = self.heights.remove(&h) {
                    if let Some(txs) = self.blocks.remove(&hash) {
                        for t in txs {
                            self.txs.remove(&t);
                        }
                    }
                }
            }
            if let Some(b) = batch.bind {
                self.heights.insert(b.height, b.hash.clone());
                for t in &b.transactions {
                    self.txs
                        .insert(t.clone(), (b.height, b.hash.clone()));
                }
                self.blocks.insert(b.hash, b.transactions);
            }
            if let Some(b) = batch.advance_base {
                self.base = Some(b);
            }
            Ok(())
        }
    }

    fn drained<C: ChainReader, D: IndexStore>(idx: &mut Indexer<C, D>) -> u64 {
        match idx.reconcile() {
            Ok(n) => n,
            Err(_) => panic!("reconcile failed"),
        }
    }

    #[test]
    fn test_binds_new_blocks() {
        let chain = TestChain::new();
        chain.push_block(&[b"t0", b"t1"]);
        chain.push_block(&[b"t2"]);
        let mut idx =
            Indexer::new(chain.clone(), MemIndex::default(), 100, Duration::ZERO);
        assert_eq!(drained(&mut idx), 2);
        let t2 = TransactionReference::hash(b"t2");
        let (height, hash) = idx.db.block_of(&t2).unwrap().unwrap();
        assert_eq!(height, 1);
        assert_eq!(idx.db.hash_at(1).unwrap(), Some(hash.clone()));
        assert_eq!(
            idx.db.transactions_of(&hash).unwrap().unwrap(),
            vec![t2]
        );
        // a second pass with nothing new binds nothing
        assert_eq!(drained(&mut idx), 0);
    }

    #[test]
    fn test_repairs_reorganization() {
        let chain = TestChain::new();
        chain.push_block(&[b"t0"]);
        chain.push_block(&[b"t1"]);
        chain.push_block(&[b"t2"]);
        let mut idx =
            Indexer::new(chain.clone(), MemIndex::default(), 100, Duration::ZERO);
        assert_eq!(drained(&mut idx), 3);
        // replace heights 1.. with a competing branch
        chain.reorg_to(1);
        chain.push_block(&[b"t1'"]);
        chain.push_block(&[b"t3"]);
        assert_eq!(drained(&mut idx), 2);
        assert!(idx.db.block_of(&TransactionReference::hash(b"t1")).unwrap().is_none());
        assert!(idx.db.block_of(&TransactionReference::hash(b"t2")).unwrap().is_none());
        let (h, _) = idx
            .db
            .block_of(&TransactionReference::hash(b"t1'"))
            .unwrap()
            .unwrap();
        assert_eq!(h, 1);
    }

    #[test]
    fn test_prunes_beyond_retention_depth() {
        let chain = TestChain::new();
        for i in 0u64..6 {
            chain.push_block(&[&i.to_le_bytes()]);
        }
        let mut idx =
            Indexer::new(chain.clone(), MemIndex::default(), 3, Duration::ZERO);
        assert_eq!(drained(&mut idx), 6);
        // heights 0..=2 pruned, base advanced to 2, 3..=5 still bound
        assert_eq!(idx.db.base().unwrap(), Some(2));
        assert!(idx.db.hash_at(2).unwrap().is_none());
        assert!(idx.db.hash_at(3).unwrap().is_some());
        assert!(idx
            .db
            .block_of(&TransactionReference::hash(&0u64.to_le_bytes()))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_stop_terminates_run() {
        let chain = TestChain::new();
        chain.push_block(&[b"t0"]);
        let idx = Indexer::new(
            chain,
            MemIndex::default(),
            100,
            Duration::from_millis(5),
        );
        let (tx, rx) = mpsc::channel();
        let handle = std::thread::spawn(move || idx.run(&rx));
        tx.send(()).unwrap();
        assert!(handle.join().unwrap().is_ok());
    }
}
