//! # manyrpc
//!
//! The contract between a manyrun host and the runtime images it loads.
//!
//! ## Architecture
//!
//! A runtime image is a native library that exports a factory returning a
//! small C vtable ([`abi::RtRuntimeV1`]). Every operation the host performs
//! on the runtime travels through a single `dispatch` entry as one encoded
//! [`Request`] in and one encoded [`Reply`] out. Keeping the vtable narrow
//! means the ABI only has to agree on byte buffers; everything richer lives
//! in the serde-described envelope.
//!
//! - [`value`]: host-side value model and opaque object references.
//! - [`frame`]: the request/response envelope.
//! - [`codec`]: postcard encoding of envelopes and values.
//! - [`abi`]: `#[repr(C)]` types and exported entry point names.

pub mod abi;
pub mod codec;
pub mod error;
pub mod frame;
pub mod value;

pub use error::Error;
pub use error::Result;
pub use frame::Fault;
pub use frame::FaultKind;
pub use frame::Reply;
pub use frame::Request;
pub use frame::Response;
pub use value::MAX_NESTING_DEPTH;
pub use value::Obj;
pub use value::ObjectId;
pub use value::SessionKey;
pub use value::Value;
