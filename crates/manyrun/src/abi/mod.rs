//! Adapters between the opaque runtime traits and the C ABI.
//!
//! - [`import`]: drives a runtime an image exposes through
//!   [`RtRuntimeV1`](manyrpc::abi::RtRuntimeV1), on the host side.
//! - [`export`]: exposes any [`RuntimeState`](crate::runtime::RuntimeState)
//!   through that vtable, for images written in Rust.
//!
//! Wrapping a runtime with `export` and then `import` must be
//! indistinguishable from calling it directly; the mock image relies on this
//! to exercise the ABI in-process.

pub mod export;
pub mod import;
