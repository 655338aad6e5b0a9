//! # qState: versioned state storage & transaction delivery for a chain node
//!
//! qState is the state engine of a blockchain node: it keeps the
//! authoritative, versioned state of all on-chain objects, executes submitted
//! transactions against that state and produces new, immutable,
//! content-addressed snapshots that the consensus engine can commit or
//! discard. It is deliberately storage-agnostic and executor-agnostic: the
//! persistent trie and the smart-contract runtime plug in behind small
//! interfaces, so the same engine drives a production node and an in-memory
//! test bench alike.
//!
//! # Design Philosophy & Overview
//!
//! The crate is a handful of modules, each usable in a standalone fashion:
//!
//! - [common]: the base value types (hashes, references, state ids, coins).
//! - [tx] / [resp]: the closed request and response sum types. Dispatch over
//!   the request kind happens exactly once, at the delivery boundary;
//!   there is no instance-of chain to chase through a class hierarchy.
//! - [state]: the heart of the engine: immutable [Store](state::Store)
//!   snapshots, the single-owner [StoreMut](state::StoreMut) transformation,
//!   and the [StateStore](state::StateStore) persistence seam.
//! - [exec]: the boundary to the code executor (response builders, code
//!   loading, event classification) and the worker pool for CPU-bound
//!   sub-tasks.
//! - [consensus]: the chain-wide parameters and their lazy recomputation
//!   from the manifest subsystem.
//! - [cache]: bounded LRU memoization and the per-snapshot cache bundle.
//! - [node]: the block lifecycle the consensus engine drives
//!   (begin/deliver/end/commit/abort, garbage collection).
//! - [indexer]: the background loop mirroring the canonical chain into a
//!   transaction→block lookup index, resilient to reorganizations.
//!
//! # On the Data Flow
//!
//! However sophisticated the node around it, the engine's life is one loop:
//!
//! - a block is opened against the current head snapshot (Read),
//! - requests are delivered, their effects accumulate in memory (Modify),
//! - the block is closed and the accumulated writes are flushed onto a
//!   persistent, content-addressed trie, yielding a new state id (Write).
//!
//! The consensus engine then either commits that id, making the new snapshot
//! the head, or aborts, discarding every effect wholesale.
//!
//! # State Versioning
//!
//! Committed state is never mutated. A [Store](state::Store) is a
//! point-in-time, thread-safe view of one committed state, identified by a
//! [StateId](common::StateId) (the hash of its trie root). All mutation goes
//! through a [StoreMut](state::StoreMut): a mutable accumulator, exclusively
//! owned by the flow building one block, that layers its pending writes over
//! the base snapshot. Reads through the transformation see the pending
//! writes first and fall through to the base, so each delivered request
//! observes its in-block predecessors; the base snapshot itself stays
//! untouched and is pinned alive for the whole life of the transformation.
//! Rolling back is therefore free: drop the transformation and nothing
//! happened. Committing is a move: [StoreMut::finish](state::StoreMut::finish)
//! consumes the transformation, so stale reuse is a compile error rather
//! than a runtime race.
//!
//! Per-object state is a *history*: the list, newest first, of the
//! transactions whose updates are sufficient to reconstruct every field of
//! the object plus its class tag. Delivery keeps histories compact by
//! dropping entries whose every update is shadowed by a newer one (see
//! [state]); scanning a history newest-to-oldest and taking the first update
//! to a field is always equivalent to a full chronological replay.
//!
//! # A Realistic Composition
//!
//! ```notrust
//!    consensus engine                      submitters
//!         |                                    |
//!  begin/end/commit/abort              deliver_transaction
//!         v                                    v
//!      [ Node ] --- groups ---> [ StoreMut (one per block) ]
//!         |                         |            ^
//!         |                    <ExecEnv>    build_response
//!         |                         v            |
//!         |                  [ CodeExecutor (opaque) ]
//!         v
//!    [ StateStore ] -- apply/commit/abort --> content-addressed trie
//!         |
//!     checked_out(StateId) ---> [ Store (immutable snapshot) ]
//!
//!    [ Indexer ]  (background) canonical chain -> tx->block index
//! ```

#[macro_use]
pub mod common;
pub mod cache;
pub mod consensus;
pub mod err;
pub mod exec;
pub mod indexer;
pub mod node;
pub mod resp;
pub mod state;
pub mod tx;
