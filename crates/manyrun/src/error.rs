//! # Error Definitions
//!
//! One error type for the host. Construction faults (`Load`, `Integrity`,
//! `Extract`, `Configure`) abort manager construction; `Usage` is raised at
//! the call that violates a precondition; `Runtime` carries a fault raised
//! inside the runtime unchanged.

use std::path::PathBuf;

use manyrpc::Fault;
use manyrpc::ObjectId;

/// A caller-correctable misuse of the API.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum UsageError {
    /// `create_movable` on a session that was not obtained through a manager.
    NoManager,
    /// `create_movable` on a value owned by another session or instance.
    ForeignValue,
    /// An instance presented to a manager that does not own it.
    ForeignInstance,
    /// A manager was asked to start zero instances.
    NoInstances,
    /// A session operation that needs a current value was called without one.
    NoCurrentValue,
}

impl std::fmt::Display for UsageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoManager => write!(f, "no manager to register replicated object with"),
            Self::ForeignValue => {
                write!(f, "cannot replicate a value living in a different instance")
            }
            Self::ForeignInstance => write!(f, "instance does not belong to this manager"),
            Self::NoInstances => write!(f, "a manager needs at least one instance"),
            Self::NoCurrentValue => write!(f, "session has no current value"),
        }
    }
}

impl std::error::Error for UsageError {}

#[derive(Debug)]
pub enum Error {
    /// The dynamic loader refused to open an image.
    Load { path: PathBuf, message: String },
    /// An image is missing an entry point or speaks another ABI version.
    Integrity { symbol: String, message: String },
    /// A payload could not be turned into a loadable file.
    Extract { payload: String, message: String },
    Usage(UsageError),
    /// A fault raised inside the runtime.
    Runtime(Fault),
    /// The envelope between host and runtime broke.
    Protocol(manyrpc::Error),
    /// The environment's configuration hook failed.
    Configure(String),
    /// Finalizing, flushing, or closing an image failed.
    Teardown(String),
    /// The replicated value has been unloaded from every instance.
    ObjectNotFound(ObjectId),
    /// The runtime was already finalized.
    Closed,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Load { path, message } => {
                write!(f, "Load error: {}: {}", path.display(), message)
            }
            Self::Integrity { symbol, message } => {
                write!(f, "Integrity fault: {}: {}", symbol, message)
            }
            Self::Extract { payload, message } => {
                write!(f, "Extract error: {}: {}", payload, message)
            }
            Self::Usage(e) => write!(f, "Usage error: {}", e),
            Self::Runtime(fault) => write!(f, "Runtime fault: {}", fault),
            Self::Protocol(e) => write!(f, "Protocol error: {}", e),
            Self::Configure(msg) => write!(f, "Configure error: {}", msg),
            Self::Teardown(msg) => write!(f, "Teardown error: {}", msg),
            Self::ObjectNotFound(id) => write!(f, "Object not found: {}", id),
            Self::Closed => write!(f, "Runtime is closed"),
        }
    }
}

impl std::error::Error for Error {}

impl From<UsageError> for Error {
    fn from(e: UsageError) -> Self {
        Self::Usage(e)
    }
}

impl From<Fault> for Error {
    fn from(fault: Fault) -> Self {
        Self::Runtime(fault)
    }
}

impl From<manyrpc::Error> for Error {
    fn from(e: manyrpc::Error) -> Self {
        Self::Protocol(e)
    }
}

impl Error {
    pub(crate) fn integrity(symbol: &str, message: impl Into<String>) -> Self {
        Self::Integrity { symbol: symbol.to_string(), message: message.into() }
    }

    pub(crate) fn missing_symbol(symbol: &str) -> Self {
        Self::integrity(symbol, "entry point not exported by image")
    }
}

pub type Result<T> = std::result::Result<T, Error>;
