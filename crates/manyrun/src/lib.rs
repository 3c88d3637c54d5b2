//! # manyrun
//!
//! Runs several independent copies of an embeddable scripting runtime inside
//! one process, so the runtime's global execution lock does not serialize all
//! work.
//!
//! ## Architecture
//!
//! Each [`Instance`] is a freshly loaded copy of the runtime image, opened
//! with a private symbol namespace so its globals never collide with its
//! siblings'. Instances share the address space, so large read-only data can
//! be reached from all of them without copying.
//!
//! - [`InstanceManager`]: owns the instances and the [`ModuleRegistry`] they
//!   consult; tags each instance with its index; hands out sessions.
//! - [`LoadBalancer`]: lock-free choice of a lightly loaded instance.
//! - [`Session`]: a borrow of one instance; all runtime calls go through it.
//! - [`ReplicatedValue`]: a serialized value that can be materialized in any
//!   instance of its manager.
//!
//! The runtime itself stays opaque behind [`RuntimeState`] and
//! [`RuntimeSession`]. Natively loaded images speak the `manyrpc` ABI; the
//! [`mock`] image implements the same traits in-process.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use manyrun::{DefaultEnvironment, InstanceManager, Value};
//!
//! # fn example() -> manyrun::Result<()> {
//! let manager = InstanceManager::new(4, Arc::new(DefaultEnvironment::from_env()))?;
//!
//! let mut session = manager.acquire_session()?;
//! let answer = session.from_value(42i64)?;
//! let movable = session.create_movable(answer)?;
//! drop(session);
//!
//! let other = manager.instance(3).expect("four instances");
//! let mut session = movable.acquire_session(Some(other))?;
//! assert_eq!(session.current_value()?, Value::Int(42));
//! # Ok(())
//! # }
//! ```

pub mod abi;
pub mod balancer;
pub mod environment;
pub mod error;
pub mod instance;
pub mod loader;
pub mod manager;
pub mod mock;
pub mod payload;
pub mod registry;
pub mod replicated;
pub mod runtime;
pub mod session;

pub use balancer::LoadBalancer;
pub use environment::DefaultEnvironment;
pub use environment::Environment;
pub use error::Error;
pub use error::Result;
pub use error::UsageError;
pub use instance::ImageSpec;
pub use instance::Instance;
pub use instance::InstanceId;
pub use loader::ImageLoader;
pub use loader::LoadFlags;
pub use loader::LoadedImage;
pub use manager::InstanceManager;
pub use manager::ManagerBuilder;
pub use payload::DirectorySource;
pub use payload::ExtractedImage;
pub use payload::Payload;
pub use payload::PayloadSource;
pub use registry::ModuleRegistry;
pub use registry::ModuleResolver;
pub use replicated::ReplicatedValue;
pub use runtime::RuntimeSession;
pub use runtime::RuntimeState;
pub use session::Session;

pub use manyrpc::Obj;
pub use manyrpc::ObjectId;
pub use manyrpc::Value;

#[cfg(test)]
mod tests;
