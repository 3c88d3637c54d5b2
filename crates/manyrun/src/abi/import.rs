//! Host side of the runtime ABI.

use std::borrow::Cow;
use std::ffi::c_void;
use std::mem::MaybeUninit;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::RwLock;

use manyrpc::Fault;
use manyrpc::Obj;
use manyrpc::ObjectId;
use manyrpc::Request;
use manyrpc::Response;
use manyrpc::SessionKey;
use manyrpc::Value;
use manyrpc::abi::ABI_VERSION;
use manyrpc::abi::NEW_RUNTIME_SYMBOL;
use manyrpc::abi::RtBuf;
use manyrpc::abi::RtEmitFn;
use manyrpc::abi::RtNewRuntimeFn;
use manyrpc::abi::RtResolver;
use manyrpc::abi::RtRuntimeV1;
use manyrpc::abi::RtStatus;
use manyrpc::abi::RtStr;
use manyrpc::codec;

use crate::error::Error;
use crate::error::Result;
use crate::registry::ModuleResolver;
use crate::runtime::RuntimeSession;
use crate::runtime::RuntimeState;

/// The vtable plus everything the image may call back into.
struct Channel {
    vtable: RtRuntimeV1,
    /// `false` once the runtime is finalized; guards every vtable call.
    live: RwLock<bool>,
    /// The resolver handed to the image. Boxed so the pointer given out stays put.
    resolver: Mutex<Option<Box<ModuleResolver>>>,
}

// SAFETY: an image's dispatch entry must be callable from any thread; the
// state pointer is only released by `finalize`, which takes the write lock.
unsafe impl Send for Channel {}
unsafe impl Sync for Channel {}

impl Channel {
    fn call(&self, request: &Request) -> Result<Response> {
        let live = self.live.read().unwrap_or_else(PoisonError::into_inner);
        if !*live {
            return Err(Error::Closed);
        }

        let bytes = codec::encode_request(request)?;
        let mut out = RtBuf::empty();
        // SAFETY: the runtime is live while the read lock is held.
        let status =
            unsafe { (self.vtable.dispatch)(self.vtable.state, RtStr::from_bytes(&bytes), &mut out) };
        if !status.is_ok() {
            // SAFETY: whatever the image put in `out` is its to release.
            unsafe { (self.vtable.free_buf)(out) };
            return Err(Error::Runtime(Fault::protocol(format!(
                "runtime could not answer {} ({})",
                request.name(),
                status
            ))));
        }

        // SAFETY: `out` was filled by the image and is released right after.
        let reply = codec::decode_reply(unsafe { out.as_slice() });
        unsafe { (self.vtable.free_buf)(out) };
        Ok(reply??)
    }
}

/// A runtime living in a natively loaded image.
pub struct NativeRuntime {
    channel: Arc<Channel>,
}

fn path_bytes(path: &Path) -> Cow<'_, [u8]> {
    #[cfg(unix)]
    {
        use std::os::unix::ffi::OsStrExt;
        Cow::Borrowed(path.as_os_str().as_bytes())
    }
    #[cfg(not(unix))]
    {
        Cow::Owned(path.to_string_lossy().into_owned().into_bytes())
    }
}

impl NativeRuntime {
    /// Calls an image factory with the given path lists.
    pub fn create(
        factory: RtNewRuntimeFn,
        extra_paths: &[PathBuf],
        plugin_paths: &[PathBuf],
    ) -> Result<Self> {
        let extra: Vec<Cow<'_, [u8]>> = extra_paths.iter().map(|p| path_bytes(p)).collect();
        let plugins: Vec<Cow<'_, [u8]>> = plugin_paths.iter().map(|p| path_bytes(p)).collect();
        let extra: Vec<RtStr> = extra.iter().map(|b| RtStr::from_bytes(b)).collect();
        let plugins: Vec<RtStr> = plugins.iter().map(|b| RtStr::from_bytes(b)).collect();

        let mut vtable = MaybeUninit::<RtRuntimeV1>::uninit();
        // SAFETY: both lists outlive the call; `vtable` is written on `Ok`.
        let status = unsafe {
            factory(extra.as_ptr(), extra.len(), plugins.as_ptr(), plugins.len(), vtable.as_mut_ptr())
        };
        match status {
            RtStatus::OK => {}
            RtStatus::INCOMPATIBLE => {
                return Err(Error::integrity(
                    NEW_RUNTIME_SYMBOL,
                    format!("image does not speak ABI version {}", ABI_VERSION),
                ));
            }
            RtStatus::FAILED => {
                return Err(Error::Runtime(Fault::runtime("runtime factory failed")));
            }
            other => {
                return Err(Error::integrity(NEW_RUNTIME_SYMBOL, format!("factory returned {}", other)));
            }
        }
        // SAFETY: the factory reported success.
        Self::from_vtable(unsafe { vtable.assume_init() })
    }

    pub fn from_vtable(vtable: RtRuntimeV1) -> Result<Self> {
        if vtable.abi_version != ABI_VERSION {
            return Err(Error::integrity(
                NEW_RUNTIME_SYMBOL,
                format!("runtime ABI version {}, host expects {}", vtable.abi_version, ABI_VERSION),
            ));
        }
        if vtable.state.is_null() {
            return Err(Error::integrity(NEW_RUNTIME_SYMBOL, "factory returned a null runtime"));
        }
        Ok(Self {
            channel: Arc::new(Channel {
                vtable,
                live: RwLock::new(true),
                resolver: Mutex::new(None),
            }),
        })
    }
}

unsafe extern "C" fn find_module(
    ctx: *const c_void,
    name: RtStr,
    sink: *mut c_void,
    emit: RtEmitFn,
) -> bool {
    // SAFETY: `ctx` points at a boxed resolver owned by the channel.
    let resolver = unsafe { &*(ctx as *const ModuleResolver) };
    // SAFETY: the image passes a valid name for the duration of the call.
    let Ok(name) = std::str::from_utf8(unsafe { name.as_bytes() }) else {
        return false;
    };
    match resolver(name) {
        Some(source) => {
            // SAFETY: the image copies `source` before `emit` returns.
            unsafe { emit(sink, RtStr::new(&source)) };
            true
        }
        None => false,
    }
}

impl RuntimeState for NativeRuntime {
    fn open_session(&self) -> Result<Box<dyn RuntimeSession>> {
        let key = self.channel.call(&Request::OpenSession)?.into_session()?;
        Ok(Box::new(NativeSession { channel: Arc::clone(&self.channel), key }))
    }

    fn set_module_resolver(&self, resolver: ModuleResolver) {
        // Exclusive: no dispatch may be resolving through the old context
        // when it is released.
        let live = self.channel.live.write().unwrap_or_else(PoisonError::into_inner);
        if !*live {
            return;
        }
        let mut slot = self.channel.resolver.lock().unwrap_or_else(PoisonError::into_inner);
        let boxed = Box::new(resolver);
        let ctx = &*boxed as *const ModuleResolver as *const c_void;
        let raw = RtResolver { ctx, find: find_module };
        // SAFETY: the runtime is live; `ctx` stays valid until the next replacement.
        unsafe { (self.channel.vtable.set_resolver)(self.channel.vtable.state, raw) };
        // The image has switched over; the previous resolver can go.
        *slot = Some(boxed);
    }

    fn finalize(self: Box<Self>) -> Result<()> {
        let mut live = self.channel.live.write().unwrap_or_else(PoisonError::into_inner);
        if !*live {
            return Err(Error::Closed);
        }
        *live = false;
        // SAFETY: no call is in flight and none can start.
        let status = unsafe { (self.channel.vtable.finalize)(self.channel.vtable.state) };
        match status {
            RtStatus::OK => Ok(()),
            other => Err(Error::Teardown(format!("runtime finalizer returned {}", other))),
        }
    }
}

struct NativeSession {
    channel: Arc<Channel>,
    key: SessionKey,
}

impl RuntimeSession for NativeSession {
    fn key(&self) -> SessionKey {
        self.key
    }

    fn global(&mut self, module: &str, name: &str) -> Result<Obj> {
        let request =
            Request::Global { session: self.key, module: module.into(), name: name.into() };
        Ok(self.channel.call(&request)?.into_obj()?)
    }

    fn eval(&mut self, source: &str) -> Result<Obj> {
        let request = Request::Eval { session: self.key, source: source.into() };
        Ok(self.channel.call(&request)?.into_obj()?)
    }

    fn from_value(&mut self, value: &Value) -> Result<Obj> {
        let request = Request::FromValue { session: self.key, value: value.clone() };
        Ok(self.channel.call(&request)?.into_obj()?)
    }

    fn to_value(&mut self, obj: Obj) -> Result<Value> {
        let request = Request::ToValue { session: self.key, obj };
        Ok(self.channel.call(&request)?.into_value()?)
    }

    fn attr(&mut self, obj: Obj, name: &str) -> Result<Obj> {
        let request = Request::Attr { session: self.key, obj, name: name.into() };
        Ok(self.channel.call(&request)?.into_obj()?)
    }

    fn set_attr(&mut self, obj: Obj, name: &str, value: Obj) -> Result<()> {
        let request = Request::SetAttr { session: self.key, obj, name: name.into(), value };
        Ok(self.channel.call(&request)?.into_unit()?)
    }

    fn call(&mut self, callee: Obj, args: &[Obj]) -> Result<Obj> {
        let request = Request::Call { session: self.key, callee, args: args.to_vec() };
        Ok(self.channel.call(&request)?.into_obj()?)
    }

    fn is_owner(&mut self, obj: Obj) -> Result<bool> {
        let request = Request::IsOwner { session: self.key, obj };
        Ok(self.channel.call(&request)?.into_bool()?)
    }

    fn pickle(&mut self, receiver: Option<Obj>, obj: Obj) -> Result<Vec<u8>> {
        let request = Request::Pickle { session: self.key, receiver, obj };
        Ok(self.channel.call(&request)?.into_bytes()?)
    }

    fn unpickle_or_get(&mut self, id: ObjectId, data: &[u8]) -> Result<Obj> {
        let request = Request::UnpickleOrGet { session: self.key, id, data: data.to_vec() };
        Ok(self.channel.call(&request)?.into_obj()?)
    }

    fn unload(&mut self, id: ObjectId) -> Result<bool> {
        let request = Request::Unload { session: self.key, id };
        Ok(self.channel.call(&request)?.into_bool()?)
    }
}

impl Drop for NativeSession {
    fn drop(&mut self) {
        match self.channel.call(&Request::CloseSession { session: self.key }) {
            Ok(_) | Err(Error::Closed) => {}
            Err(e) => tracing::warn!(session = %self.key, error = %e, "failed to close session"),
        }
    }
}
