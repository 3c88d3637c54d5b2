//! # Error Definitions
//!
//! Failures of the envelope itself, as opposed to [`Fault`](crate::Fault)s
//! raised by the runtime on the other side of it.

/// Operational failures within the envelope mechanism.
#[derive(Debug)]
pub enum Error {
    /// A frame or value could not be serialized.
    Encode(postcard::Error),
    /// A buffer did not contain a well-formed frame or value.
    Decode(postcard::Error),
    /// The runtime answered with a response of the wrong shape.
    UnexpectedResponse { expected: &'static str, found: &'static str },
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Encode(e) => write!(f, "Encode error: {}", e),
            Self::Decode(e) => write!(f, "Decode error: {}", e),
            Self::UnexpectedResponse { expected, found } => {
                write!(f, "Unexpected response: expected {}, found {}", expected, found)
            }
        }
    }
}

impl std::error::Error for Error {}

/// A specialized Result type for envelope operations.
pub type Result<T> = std::result::Result<T, Error>;
