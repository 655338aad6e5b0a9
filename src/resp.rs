use std::io::Write;

use rlp_derive::{RlpDecodable, RlpEncodable};

use crate::common::{
    Bytes, Gas, StorageReference, StorageValue, TransactionReference,
};

/// An atomic fact established by a transaction about one object: either its
/// class tag, set once at creation, or the value of one field.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Update {
    ClassTag { object: StorageReference, class: String },
    Field { object: StorageReference, field: FieldId, value: StorageValue },
}

/// Identity of a field: the class that declares it plus its name. Two updates
/// to the same field of the same object shadow each other.
#[derive(Clone, PartialEq, Eq, Hash, Debug, RlpEncodable, RlpDecodable)]
pub struct FieldId {
    pub class: String,
    pub name: String,
}

impl FieldId {
    pub fn new(class: &str, name: &str) -> Self {
        Self {
            class: class.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for FieldId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.class, self.name)
    }
}

impl Update {
    pub fn object(&self) -> &StorageReference {
        match self {
            Update::ClassTag { object, .. } => object,
            Update::Field { object, .. } => object,
        }
    }

    /// Whether the two updates speak about the same property, so that the
    /// newer one shadows the older. Class tags shadow class tags.
    pub fn same_property(&self, other: &Update) -> bool {
        match (self, other) {
            (
                Update::ClassTag { object: o1, .. },
                Update::ClassTag { object: o2, .. },
            ) => o1 == o2,
            (
                Update::Field { object: o1, field: f1, .. },
                Update::Field { object: o2, field: f2, .. },
            ) => o1 == o2 && f1 == f2,
            _ => false,
        }
    }

    pub fn is_class_tag(&self) -> bool {
        matches!(self, Update::ClassTag { .. })
    }
}

const UPDATE_CLASS_TAG: u8 = 0x0;
const UPDATE_FIELD: u8 = 0x1;

impl rlp::Encodable for Update {
    fn rlp_append(&self, s: &mut rlp::RlpStream) {
        match self {
            Update::ClassTag { object, class } => {
                s.begin_list(3)
                    .append(&UPDATE_CLASS_TAG)
                    .append(object)
                    .append(class);
            }
            Update::Field { object, field, value } => {
                s.begin_list(4)
                    .append(&UPDATE_FIELD)
                    .append(object)
                    .append(field)
                    .append(value);
            }
        }
    }
}

impl rlp::Decodable for Update {
    fn decode(rlp: &rlp::Rlp) -> Result<Self, rlp::DecoderError> {
        Ok(match rlp.val_at::<u8>(0)? {
            UPDATE_CLASS_TAG => Update::ClassTag {
                object: rlp.val_at(1)?,
                class: rlp.val_at(2)?,
            },
            UPDATE_FIELD => Update::Field {
                object: rlp.val_at(1)?,
                field: rlp.val_at(2)?,
                value: rlp.val_at(3)?,
            },
            _ => return Err(rlp::DecoderError::Custom("bad update tag")),
        })
    }
}

/// An event triggered by a transaction: a storage object of some runtime
/// class, created by another object. The creator decides whether the event
/// may invalidate cached consensus parameters.
#[derive(Clone, PartialEq, Eq, Debug, RlpEncodable, RlpDecodable)]
pub struct Event {
    pub object: StorageReference,
    pub class: String,
    pub creator: StorageReference,
}

/// The computed outcome of a request, tagged by kind. Successful outcomes
/// that touch objects carry their updates and zero or more events; failed
/// outcomes still carry the updates that charged the payer.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Response {
    CodeInstalled(CodeInstalledResponse),
    CodeInstallFailed(FailedResponse),
    AccountCreated(AccountCreatedResponse),
    ConstructorCalled(ConstructorCalledResponse),
    ConstructorFailed(FailedResponse),
    MethodCalled(MethodCalledResponse),
    MethodFailed(FailedResponse),
    Initialized(InitializedResponse),
}

#[derive(Clone, PartialEq, Eq, Debug, RlpEncodable, RlpDecodable)]
pub struct CodeInstalledResponse {
    /// Instrumented form of the module, as produced by the code executor.
    pub module: Bytes,
    pub deps: Vec<TransactionReference>,
    pub verification_version: u64,
    pub updates: Vec<Update>,
    pub gas: Gas,
}

#[derive(Clone, PartialEq, Eq, Debug, RlpEncodable, RlpDecodable)]
pub struct AccountCreatedResponse {
    pub account: StorageReference,
    pub updates: Vec<Update>,
}

#[derive(Clone, PartialEq, Eq, Debug, RlpEncodable, RlpDecodable)]
pub struct ConstructorCalledResponse {
    pub new_object: StorageReference,
    pub updates: Vec<Update>,
    pub events: Vec<Event>,
    pub gas: Gas,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct MethodCalledResponse {
    /// `None` for void methods.
    pub result: Option<StorageValue>,
    pub updates: Vec<Update>,
    pub events: Vec<Event>,
    pub gas: Gas,
}

/// The called code completed abnormally after the payer was charged. Not a
/// rejection: the request was well-formed and paid for.
#[derive(Clone, PartialEq, Eq, Debug, RlpEncodable, RlpDecodable)]
pub struct FailedResponse {
    pub cause: String,
    pub updates: Vec<Update>,
    pub gas: Gas,
}

#[derive(Clone, PartialEq, Eq, Debug, RlpEncodable, RlpDecodable)]
pub struct InitializedResponse {
    pub manifest: StorageReference,
}

// rlp for MethodCalledResponse is manual: Option is not rlp-friendly, so the
// result travels as a (present, value) pair.
impl rlp::Encodable for MethodCalledResponse {
    fn rlp_append(&self, s: &mut rlp::RlpStream) {
        let s = s.begin_list(5);
        match &self.result {
            Some(v) => s.append(&true).append(v),
            None => s.append(&false).append(&StorageValue::Null),
        };
        s.append_list(&self.updates)
            .append_list(&self.events)
            .append(&self.gas);
    }
}

impl rlp::Decodable for MethodCalledResponse {
    fn decode(rlp: &rlp::Rlp) -> Result<Self, rlp::DecoderError> {
        let present: bool = rlp.val_at(0)?;
        Ok(Self {
            result: if present { Some(rlp.val_at(1)?) } else { None },
            updates: rlp.list_at(2)?,
            events: rlp.list_at(3)?,
            gas: rlp.val_at(4)?,
        })
    }
}

impl Response {
    const CODE_INSTALLED: u8 = 0x0;
    const CODE_INSTALL_FAILED: u8 = 0x1;
    const ACCOUNT_CREATED: u8 = 0x2;
    const CONSTRUCTOR_CALLED: u8 = 0x3;
    const CONSTRUCTOR_FAILED: u8 = 0x4;
    const METHOD_CALLED: u8 = 0x5;
    const METHOD_FAILED: u8 = 0x6;
    const INITIALIZED: u8 = 0x7;

    pub fn encode(&self) -> Vec<u8> {
        let (tag, payload) = match self {
            Response::CodeInstalled(p) => {
                (Self::CODE_INSTALLED, rlp::encode(p))
            }
            Response::CodeInstallFailed(p) => {
                (Self::CODE_INSTALL_FAILED, rlp::encode(p))
            }
            Response::AccountCreated(p) => {
                (Self::ACCOUNT_CREATED, rlp::encode(p))
            }
            Response::ConstructorCalled(p) => {
                (Self::CONSTRUCTOR_CALLED, rlp::encode(p))
            }
            Response::ConstructorFailed(p) => {
                (Self::CONSTRUCTOR_FAILED, rlp::encode(p))
            }
            Response::MethodCalled(p) => (Self::METHOD_CALLED, rlp::encode(p)),
            Response::MethodFailed(p) => (Self::METHOD_FAILED, rlp::encode(p)),
            Response::Initialized(p) => (Self::INITIALIZED, rlp::encode(p)),
        };
        let mut buff = vec![tag];
        buff.write(payload.as_ref()).unwrap();
        buff
    }

    pub fn decode(bytes: &[u8]) -> Option<Response> {
        if bytes.is_empty() {
            return None
        }
        let rlp = rlp::Rlp::new(&bytes[1..]);
        Some(match bytes[0] {
            Self::CODE_INSTALLED => Response::CodeInstalled(rlp.as_val().ok()?),
            Self::CODE_INSTALL_FAILED => {
                Response::CodeInstallFailed(rlp.as_val().ok()?)
            }
            Self::ACCOUNT_CREATED => {
                Response::AccountCreated(rlp.as_val().ok()?)
            }
            Self::CONSTRUCTOR_CALLED => {
                Response::ConstructorCalled(rlp.as_val().ok()?)
            }
            Self::CONSTRUCTOR_FAILED => {
                Response::ConstructorFailed(rlp.as_val().ok()?)
            }
            Self::METHOD_CALLED => Response::MethodCalled(rlp.as_val().ok()?),
            Self::METHOD_FAILED => Response::MethodFailed(rlp.as_val().ok()?),
            Self::INITIALIZED => Response::Initialized(rlp.as_val().ok()?),
            _ => return None,
        })
    }

    pub fn updates(&self) -> &[Update] {
        match self {
            Response::CodeInstalled(p) => &p.updates,
            Response::CodeInstallFailed(p) => &p.updates,
            Response::AccountCreated(p) => &p.updates,
            Response::ConstructorCalled(p) => &p.updates,
            Response::ConstructorFailed(p) => &p.updates,
            Response::MethodCalled(p) => &p.updates,
            Response::MethodFailed(p) => &p.updates,
            Response::Initialized(_) => &[],
        }
    }

    pub fn events(&self) -> &[Event] {
        match self {
            Response::ConstructorCalled(p) => &p.events,
            Response::MethodCalled(p) => &p.events,
            _ => &[],
        }
    }

    pub fn gas_consumed(&self) -> Gas {
        match self {
            Response::CodeInstalled(p) => p.gas,
            Response::CodeInstallFailed(p) => p.gas,
            Response::ConstructorCalled(p) => p.gas,
            Response::ConstructorFailed(p) => p.gas,
            Response::MethodCalled(p) => p.gas,
            Response::MethodFailed(p) => p.gas,
            Response::AccountCreated(_) | Response::Initialized(_) => 0,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(
            self,
            Response::CodeInstallFailed(_) |
                Response::ConstructorFailed(_) |
                Response::MethodFailed(_)
        )
    }
}
