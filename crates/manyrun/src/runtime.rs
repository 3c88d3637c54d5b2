//! Opaque runtime interface.
//!
//! The host never interprets the scripting runtime it embeds. Everything it
//! needs is expressed by these two traits:
//!
//! - **RuntimeState**: one initialized runtime, created by an image's factory
//!   and finalized exactly once before the image is closed.
//! - **RuntimeSession**: a handle through which calls are made into that
//!   runtime. Objects it returns are [`Obj`] references valid only inside it.
//!
//! Implementations exist for natively loaded images
//! ([`NativeRuntime`](crate::abi::import::NativeRuntime)) and for the
//! in-process [`mock`](crate::mock) image.

use manyrpc::Obj;
use manyrpc::ObjectId;
use manyrpc::SessionKey;
use manyrpc::Value;

use crate::error::Result;
use crate::registry::ModuleResolver;

pub trait RuntimeState: Send + Sync + 'static {
    /// Opens a session. Distinct sessions may be used from different
    /// threads at once; the runtime serializes internally.
    fn open_session(&self) -> Result<Box<dyn RuntimeSession>>;

    /// Installs the hook consulted for modules the runtime cannot find itself.
    /// Replaces any previous hook.
    fn set_module_resolver(&self, resolver: ModuleResolver);

    /// Runs the runtime's own finalization. Called once, while the image that
    /// produced the runtime is still mapped.
    fn finalize(self: Box<Self>) -> Result<()>;
}

/// Calls into one runtime session.
///
/// # Errors
///
/// Failures raised inside the runtime come back as
/// [`Error::Runtime`](crate::Error::Runtime), unchanged.
pub trait RuntimeSession: Send {
    fn key(&self) -> SessionKey;

    /// Looks up `name` in `module`.
    fn global(&mut self, module: &str, name: &str) -> Result<Obj>;

    fn eval(&mut self, source: &str) -> Result<Obj>;

    fn from_value(&mut self, value: &Value) -> Result<Obj>;

    fn to_value(&mut self, obj: Obj) -> Result<Value>;

    fn attr(&mut self, obj: Obj, name: &str) -> Result<Obj>;

    fn set_attr(&mut self, obj: Obj, name: &str, value: Obj) -> Result<()>;

    fn call(&mut self, callee: Obj, args: &[Obj]) -> Result<Obj>;

    /// Whether `obj` was produced by this session.
    fn is_owner(&mut self, obj: Obj) -> Result<bool>;

    /// Serializes `obj`, optionally in the context of `receiver`.
    fn pickle(&mut self, receiver: Option<Obj>, obj: Obj) -> Result<Vec<u8>>;

    /// Deserializes `data` as the object for `id`, or returns the object
    /// already loaded for `id` in this runtime.
    fn unpickle_or_get(&mut self, id: ObjectId, data: &[u8]) -> Result<Obj>;

    /// Drops the object loaded for `id`. Returns `false` when nothing was loaded.
    fn unload(&mut self, id: ObjectId) -> Result<bool>;
}
