use rocksdb::{WriteBatch, DB};

use qstate::common::{Hash, TransactionReference};
use qstate::err::Fault;
use qstate::indexer::{IndexBatch, IndexStore};

const SPACE_HEIGHT: u8 = b'h';
const SPACE_BLOCK: u8 = b'b';
const SPACE_TX: u8 = b't';
const KEY_BASE: u8 = b'B';
const KEY_TOP: u8 = b'T';

/// RocksDB-backed auxiliary index: height↔hash, hash↔transaction references
/// and one record per transaction, kept consistent by applying every
/// [IndexBatch] as a single write batch.
pub struct BlockIndex {
    db: DB,
    prefix: Vec<u8>,
}

impl BlockIndex {
    pub fn new(db: DB, prefix: &[u8]) -> Self {
        Self {
            db,
            prefix: prefix.to_vec(),
        }
    }

    fn space_key(&self, space: u8, payload: &[u8]) -> Vec<u8> {
        let mut key = self.prefix.clone();
        key.push(space);
        key.extend_from_slice(payload);
        key
    }

    fn height_key(&self, height: u64) -> Vec<u8> {
        self.space_key(SPACE_HEIGHT, &height.to_le_bytes())
    }

    fn block_key(&self, hash: &Hash) -> Vec<u8> {
        self.space_key(SPACE_BLOCK, hash.as_bytes())
    }

    fn tx_key(&self, r: &TransactionReference) -> Vec<u8> {
        self.space_key(SPACE_TX, r.as_bytes())
    }

    fn mark_key(&self, mark: u8) -> Vec<u8> {
        let mut key = self.prefix.clone();
        key.push(mark);
        key
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Fault> {
        self.db
            .get(key)
            .map_err(|e| Fault::Persistence(e.to_string()))
    }

    fn get_height_mark(&self, mark: u8) -> Result<Option<u64>, Fault> {
        Ok(self.get(&self.mark_key(mark))?.map(|raw| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&raw[..8]);
            u64::from_le_bytes(b)
        }))
    }
}

fn encode_refs(refs: &[TransactionReference]) -> Vec<u8> {
    let mut buff = Vec::with_capacity(refs.len() * 32);
    for r in refs {
        buff.extend_from_slice(r.as_bytes());
    }
    buff
}

fn decode_refs(raw: &[u8]) -> Vec<TransactionReference> {
    raw.chunks_exact(32)
        .map(TransactionReference::from_slice)
        .collect()
}

impl IndexStore for BlockIndex {
    fn base(&self) -> Result<Option<u64>, Fault> {
        self.get_height_mark(KEY_BASE)
    }

    fn top(&self) -> Result<Option<u64>, Fault> {
        self.get_height_mark(KEY_TOP)
    }

    fn hash_at(&self, height: u64) -> Result<Option<Hash>, Fault> {
        Ok(self
            .get(&self.height_key(height))?
            .map(|raw| Hash::from_slice(&raw)))
    }

    fn transactions_of(
        &self, hash: &Hash,
    ) -> Result<Option<Vec<TransactionReference>>, Fault> {
        Ok(self.get(&self.block_key(hash))?.map(|raw| decode_refs(&raw)))
    }

    fn block_of(
        &self, r: &TransactionReference,
    ) -> Result<Option<(u64, Hash)>, Fault> {
        Ok(self.get(&self.tx_key(r))?.map(|raw| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&raw[..8]);
            (u64::from_le_bytes(b), Hash::from_slice(&raw[8..40]))
        }))
    }

    fn apply(&mut self, batch: IndexBatch) -> Result<(), Fault> {
        let mut wb = WriteBatch::default();
        let mut top = self.top()?;
        // an unbind set always reaches up to the current top (reorg) or is a
        // single pruned low height; the new top follows from its minimum
        if let Some(t) = top {
            if batch.unbind.contains(&t) {
                let lo = *batch.unbind.iter().min().unwrap();
                top = lo.checked_sub(1);
            }
        }
        for h in &batch.unbind {
            if let Some(hash) = self.hash_at(*h)? {
                if let Some(txs) = self.transactions_of(&hash)? {
                    for t in txs {
                        wb.delete(self.tx_key(&t));
                    }
                }
                wb.delete(self.block_key(&hash));
            }
            wb.delete(self.height_key(*h));
        }
        if let Some(block) = &batch.bind {
            wb.put(
                self.height_key(block.height),
                block.hash.as_bytes(),
            );
            wb.put(
                self.block_key(&block.hash),
                encode_refs(&block.transactions),
            );
            let mut entry = block.height.to_le_bytes().to_vec();
            entry.extend_from_slice(block.hash.as_bytes());
            for t in &block.transactions {
                wb.put(self.tx_key(t), &entry);
            }
            top = Some(top.map_or(block.height, |t| t.max(block.height)));
        }
        match top {
            Some(t) => wb.put(self.mark_key(KEY_TOP), t.to_le_bytes()),
            None => wb.delete(self.mark_key(KEY_TOP)),
        }
        if let Some(base) = batch.advance_base {
            wb.put(self.mark_key(KEY_BASE), base.to_le_bytes());
        }
        self.db
            .write(wb)
            .map_err(|e| Fault::Persistence(e.to_string()))
    }
}
