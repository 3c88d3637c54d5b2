//! # Protocol Frames
//!
//! Defines the envelope exchanged with a runtime image: one [`Request`] in,
//! one [`Reply`] out.
//!
//! ## Invariants
//! - Every request except `OpenSession` names the session it acts in.
//! - A reply is either a [`Response`] or a [`Fault`] raised inside the runtime.
//!   Faults are passed back to the caller unchanged; the envelope never retries.

use serde::Deserialize;
use serde::Serialize;

use crate::error::Error;
use crate::error::Result;
use crate::value::Obj;
use crate::value::ObjectId;
use crate::value::SessionKey;
use crate::value::Value;

/// An operation for the runtime to perform.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Request {
    OpenSession,
    CloseSession { session: SessionKey },
    /// Look up `name` in `module`, resolving the module through the host if needed.
    Global { session: SessionKey, module: String, name: String },
    Eval { session: SessionKey, source: String },
    FromValue { session: SessionKey, value: Value },
    ToValue { session: SessionKey, obj: Obj },
    Attr { session: SessionKey, obj: Obj, name: String },
    SetAttr { session: SessionKey, obj: Obj, name: String, value: Obj },
    Call { session: SessionKey, callee: Obj, args: Vec<Obj> },
    IsOwner { session: SessionKey, obj: Obj },
    /// Serialize `obj`, optionally in the context of `receiver`.
    Pickle { session: SessionKey, receiver: Option<Obj>, obj: Obj },
    /// Deserialize `data` unless an object for `id` is already loaded.
    UnpickleOrGet { session: SessionKey, id: ObjectId, data: Vec<u8> },
    Unload { session: SessionKey, id: ObjectId },
}

impl Request {
    /// Name of the operation, used in diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            Self::OpenSession => "open-session",
            Self::CloseSession { .. } => "close-session",
            Self::Global { .. } => "global",
            Self::Eval { .. } => "eval",
            Self::FromValue { .. } => "from-value",
            Self::ToValue { .. } => "to-value",
            Self::Attr { .. } => "attr",
            Self::SetAttr { .. } => "set-attr",
            Self::Call { .. } => "call",
            Self::IsOwner { .. } => "is-owner",
            Self::Pickle { .. } => "pickle",
            Self::UnpickleOrGet { .. } => "unpickle-or-get",
            Self::Unload { .. } => "unload",
        }
    }

    /// The session a request acts in, if any.
    pub fn session(&self) -> Option<SessionKey> {
        match self {
            Self::OpenSession => None,
            Self::CloseSession { session }
            | Self::Global { session, .. }
            | Self::Eval { session, .. }
            | Self::FromValue { session, .. }
            | Self::ToValue { session, .. }
            | Self::Attr { session, .. }
            | Self::SetAttr { session, .. }
            | Self::Call { session, .. }
            | Self::IsOwner { session, .. }
            | Self::Pickle { session, .. }
            | Self::UnpickleOrGet { session, .. }
            | Self::Unload { session, .. } => Some(*session),
        }
    }
}

/// A successful result.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Response {
    Unit,
    Session(SessionKey),
    Obj(Obj),
    Value(Value),
    Bool(bool),
    Bytes(Vec<u8>),
}

impl Response {
    fn kind(&self) -> &'static str {
        match self {
            Self::Unit => "unit",
            Self::Session(_) => "session",
            Self::Obj(_) => "obj",
            Self::Value(_) => "value",
            Self::Bool(_) => "bool",
            Self::Bytes(_) => "bytes",
        }
    }

    fn unexpected(self, expected: &'static str) -> Error {
        Error::UnexpectedResponse { expected, found: self.kind() }
    }

    pub fn into_unit(self) -> Result<()> {
        match self {
            Self::Unit => Ok(()),
            other => Err(other.unexpected("unit")),
        }
    }

    pub fn into_session(self) -> Result<SessionKey> {
        match self {
            Self::Session(key) => Ok(key),
            other => Err(other.unexpected("session")),
        }
    }

    pub fn into_obj(self) -> Result<Obj> {
        match self {
            Self::Obj(obj) => Ok(obj),
            other => Err(other.unexpected("obj")),
        }
    }

    pub fn into_value(self) -> Result<Value> {
        match self {
            Self::Value(value) => Ok(value),
            other => Err(other.unexpected("value")),
        }
    }

    pub fn into_bool(self) -> Result<bool> {
        match self {
            Self::Bool(b) => Ok(b),
            other => Err(other.unexpected("bool")),
        }
    }

    pub fn into_bytes(self) -> Result<Vec<u8>> {
        match self {
            Self::Bytes(bytes) => Ok(bytes),
            other => Err(other.unexpected("bytes")),
        }
    }
}

/// Broad classification of a runtime failure.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FaultKind {
    /// Evaluation, conversion, or serialization failed inside the runtime.
    Runtime,
    /// A module, attribute, or replicated object does not exist.
    NotFound,
    /// An object reference was presented to a session that does not own it.
    Ownership,
    /// The request could not be understood.
    Protocol,
}

impl std::fmt::Display for FaultKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Runtime => write!(f, "runtime fault"),
            Self::NotFound => write!(f, "not found"),
            Self::Ownership => write!(f, "ownership violation"),
            Self::Protocol => write!(f, "protocol violation"),
        }
    }
}

/// A failure raised inside the runtime (the `Err` side of a [`Reply`]).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fault {
    pub kind: FaultKind,
    pub message: String,
}

impl Fault {
    pub fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::new(FaultKind::Runtime, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(FaultKind::NotFound, message)
    }

    pub fn ownership(message: impl Into<String>) -> Self {
        Self::new(FaultKind::Ownership, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(FaultKind::Protocol, message)
    }
}

impl std::fmt::Display for Fault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for Fault {}

/// The outcome of one request.
pub type Reply = std::result::Result<Response, Fault>;
