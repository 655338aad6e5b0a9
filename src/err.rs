use crate::common::{Coin, Gas, StateId, StorageReference, TransactionReference};

/// Expected, recoverable refusal of a request. A rejection is reported to the
/// submitter and leaves no trace in the transformation: there is no payer for
/// a rejected request, so nothing may be charged or written.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    #[error("unknown transaction reference {0}")]
    UnknownReference(TransactionReference),
    #[error("malformed request: {0}")]
    Malformed(String),
    #[error("invalid signature by {0}")]
    BadSignature(StorageReference),
    #[error("nonce mismatch for {caller}: expected {expected}, got {got}")]
    NonceMismatch {
        caller: StorageReference,
        expected: u64,
        got: u64,
    },
    #[error("{caller} cannot afford {gas} units of gas")]
    InsufficientBalance { caller: StorageReference, gas: Gas },
    #[error("gas limit {0} exceeds the allowed ceiling {1}")]
    GasCeiling(Gas, Gas),
    #[error("classpath {0} cannot be resolved")]
    MissingCode(TransactionReference),
    #[error("{0}")]
    Failed(String),
}

/// Non-recoverable internal-consistency fault: the store or one of its
/// invariants is corrupted, or a collaborator misbehaved in a way the engine
/// assumes impossible. Never silently swallowed.
#[derive(thiserror::Error, Debug)]
pub enum Fault {
    #[error("response of unexpected shape for {0}")]
    UnexpectedResponse(TransactionReference),
    #[error("missing response for {0}, recorded in a history")]
    MissingResponse(TransactionReference),
    #[error("update to unknown object {0}")]
    UnknownObject(StorageReference),
    #[error("manifest parameter {0} has a wrong type")]
    WrongParameter(&'static str),
    #[error("manifest introspection of {0} failed: {1}")]
    Introspection(&'static str, String),
    #[error("request kind cannot be delivered here")]
    UndeliverableRequest,
    #[error("no block is open under group {0}")]
    UnknownGroup(u64),
    #[error("group {0} has no staged block to commit")]
    NotSealed(u64),
    #[error("state {0} cannot be checked out")]
    UnknownState(StateId),
    #[error("supply accounting overflow at {0} coins")]
    SupplyOverflow(Coin),
    #[error("persistence failure: {0}")]
    Persistence(String),
    #[error("background task failed: {0}")]
    Background(&'static str),
}

/// Outcome surface of a delivery: either an expected rejection or a fatal
/// fault. The two classes are disjoint by construction.
#[derive(thiserror::Error, Debug)]
pub enum DeliverError {
    #[error(transparent)]
    Rejected(#[from] Rejection),
    #[error(transparent)]
    Fault(#[from] Fault),
}

impl DeliverError {
    pub fn is_rejection(&self) -> bool {
        matches!(self, DeliverError::Rejected(_))
    }

    /// Escalate to a fault: used where a rejection cannot legitimately occur
    /// (system calls synthesized by the engine itself).
    pub fn into_fault(self, what: &'static str) -> Fault {
        match self {
            DeliverError::Fault(f) => f,
            DeliverError::Rejected(r) => {
                Fault::Introspection(what, r.to_string())
            }
        }
    }
}
