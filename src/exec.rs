use std::sync::{mpsc, Arc};

use async_trait::async_trait;
use futures::channel::oneshot;
use parking_lot::Mutex;

use crate::common::{
    Coin, StorageReference, StorageValue, TransactionReference,
};
use crate::consensus::ConsensusConfig;
use crate::err::{Fault, Rejection};
use crate::resp::{FieldId, Response, Update};
use crate::tx::Request;

/// How an event's runtime class relates to the cached chain parameters. The
/// classification is supplied by the code executor, which is the only
/// component that understands the class hierarchy of the installed code.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum EventKind {
    ConsensusUpdate,
    GasPriceUpdate,
    InflationUpdate,
    Other,
}

/// An immutable, resolved unit of installed code that can be read-shared by
/// threads. Loading may be expensive, so the engine memoizes these behind
/// the classpath reference. For a simple, standalone implementation, refer
/// to [PlainModule].
pub trait LoadedCode: Send + Sync {
    /// The install transaction this code was resolved from.
    fn classpath(&self) -> &TransactionReference;
    /// The install transactions of the full resolved dependency closure,
    /// classpath first.
    fn modules(&self) -> &[TransactionReference];
}

/// Simple [LoadedCode] carrying a pre-resolved dependency closure.
pub struct PlainModule {
    classpath: TransactionReference,
    modules: Vec<TransactionReference>,
}

impl PlainModule {
    pub fn new(
        classpath: TransactionReference, deps: Vec<TransactionReference>,
    ) -> Self {
        let mut modules = vec![classpath.clone()];
        modules.extend(deps);
        Self { classpath, modules }
    }
}

impl LoadedCode for PlainModule {
    fn classpath(&self) -> &TransactionReference {
        &self.classpath
    }
    fn modules(&self) -> &[TransactionReference] {
        &self.modules
    }
}

/// Read-only contract the engine offers to response builders: given a
/// transaction reference, its request and response; given an object, its
/// update history; plus the installed manifest and the current chain
/// parameters. Implemented both by an immutable snapshot and by an
/// in-progress transformation (which answers from its pending writes first).
#[async_trait]
pub trait ExecEnv: Send + Sync {
    async fn request(&self, r: &TransactionReference) -> Option<Request>;
    async fn response(&self, r: &TransactionReference) -> Option<Response>;
    /// Ordered newest-first; `None` for objects this state knows nothing of.
    async fn history(
        &self, object: &StorageReference,
    ) -> Option<Vec<TransactionReference>>;
    async fn manifest(&self) -> Option<StorageReference>;
    /// Current consensus parameters, recomputed lazily. Builders running the
    /// manifest's own view calls must not re-enter this.
    async fn config(&self) -> Result<Arc<ConsensusConfig>, Fault>;
    /// Current gas price, recomputed lazily.
    async fn gas_price(&self) -> Result<Coin, Fault>;
    /// Memoized signature verification of a signed request against the
    /// signer fingerprint stored by the caller's account.
    async fn verify_signature(
        &self, req: &Request, key: &str,
    ) -> Result<bool, Fault>;
    /// Memoized code loading through the executor.
    async fn loaded_code(
        &self, classpath: &TransactionReference,
    ) -> Result<Arc<dyn LoadedCode>, Rejection>;

    /// Current value of one field: the first update to it found scanning the
    /// object's history from newest to oldest. The push algorithm keeps this
    /// scan equivalent to a full chronological replay.
    async fn field_value(
        &self, object: &StorageReference, field: &FieldId,
    ) -> Result<Option<StorageValue>, Fault> {
        let history = match self.history(object).await {
            Some(h) => h,
            None => return Ok(None),
        };
        for r in &history {
            let resp = self
                .response(r)
                .await
                .ok_or_else(|| Fault::MissingResponse(r.clone()))?;
            for u in resp.updates() {
                if let Update::Field { object: o, field: f, value } = u {
                    if o == object && f == field {
                        return Ok(Some(value.clone()))
                    }
                }
            }
        }
        Ok(None)
    }

    /// Class tag of an object, anchored by the oldest history entry.
    async fn class_tag(
        &self, object: &StorageReference,
    ) -> Result<Option<String>, Fault> {
        let history = match self.history(object).await {
            Some(h) => h,
            None => return Ok(None),
        };
        for r in &history {
            let resp = self
                .response(r)
                .await
                .ok_or_else(|| Fault::MissingResponse(r.clone()))?;
            for u in resp.updates() {
                if let Update::ClassTag { object: o, class } = u {
                    if o == object {
                        return Ok(Some(class.clone()))
                    }
                }
            }
        }
        Ok(None)
    }
}

/// The opaque code-execution collaborator: turns a request into a response
/// against a read-only environment, loads code, and classifies event classes.
/// The engine never looks inside responses beyond their type tags, updates
/// and events.
#[async_trait]
pub trait CodeExecutor: Send + Sync {
    /// Build (but do not deliver) the response for a request. A [Rejection]
    /// means the request has no payer and must leave no trace.
    async fn build_response(
        &self, env: &dyn ExecEnv, req: &Request,
    ) -> Result<Response, Rejection>;

    /// Resolve the code installed by `classpath` and its dependency closure.
    async fn load_code(
        &self, env: &dyn ExecEnv, classpath: &TransactionReference,
    ) -> Result<Arc<dyn LoadedCode>, Rejection>;

    /// Classify a runtime class name of an event object.
    fn classify_event(&self, class: &str) -> EventKind;
}

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Small pool of worker threads for CPU-bound sub-tasks (signature
/// verification, code resolution) submitted by transformations. Jobs resolve
/// through one-shot channels, so callers may await them from async code.
pub struct Workers {
    sender: Option<mpsc::Sender<Job>>,
    threads: Vec<std::thread::JoinHandle<()>>,
}

impl Workers {
    pub fn new(size: usize) -> Self {
        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));
        let threads = (0..size.max(1))
            .map(|_| {
                let receiver = receiver.clone();
                std::thread::spawn(move || loop {
                    let job = receiver.lock().recv();
                    match job {
                        Ok(job) => job(),
                        Err(_) => break,
                    }
                })
            })
            .collect();
        Self {
            sender: Some(sender),
            threads,
        }
    }

    pub fn submit<T, F>(&self, f: F) -> oneshot::Receiver<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job = Box::new(move || {
            let _ = tx.send(f());
        });
        if let Err(_) = self.sender.as_ref().unwrap().send(job) {
            panic!("worker pool was shutdown too soon");
        }
        rx
    }
}

impl Drop for Workers {
    fn drop(&mut self) {
        drop(self.sender.take());
        for t in self.threads.drain(..) {
            t.join().unwrap()
        }
    }
}
