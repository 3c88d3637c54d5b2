//! Image side of the runtime ABI.
//!
//! [`export_runtime`] turns a [`RuntimeState`] into the vtable an image's
//! factory returns. Sessions are kept in a table keyed by [`SessionKey`];
//! each is locked for the duration of one request, so distinct sessions
//! proceed in parallel.

use std::collections::HashMap;
use std::ffi::c_void;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;

use manyrpc::Fault;
use manyrpc::Reply;
use manyrpc::Request;
use manyrpc::Response;
use manyrpc::SessionKey;
use manyrpc::abi::ABI_VERSION;
use manyrpc::abi::RtBuf;
use manyrpc::abi::RtResolver;
use manyrpc::abi::RtRuntimeV1;
use manyrpc::abi::RtStatus;
use manyrpc::abi::RtStr;
use manyrpc::codec;

use crate::error::Error;
use crate::registry::ModuleResolver;
use crate::runtime::RuntimeSession;
use crate::runtime::RuntimeState;

type SharedSession = Arc<Mutex<Box<dyn RuntimeSession>>>;

struct Exported {
    runtime: Box<dyn RuntimeState>,
    sessions: Mutex<HashMap<SessionKey, SharedSession>>,
}

fn fault(error: Error) -> Fault {
    match error {
        Error::Runtime(fault) => fault,
        Error::Protocol(e) => Fault::protocol(e.to_string()),
        other => Fault::runtime(other.to_string()),
    }
}

impl Exported {
    fn session(&self, key: SessionKey) -> Result<SharedSession, Fault> {
        let sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        sessions.get(&key).cloned().ok_or_else(|| Fault::protocol(format!("unknown {}", key)))
    }

    fn serve(&self, request: Request) -> Reply {
        match request {
            Request::OpenSession => {
                let session = self.runtime.open_session().map_err(fault)?;
                let key = session.key();
                let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
                sessions.insert(key, Arc::new(Mutex::new(session)));
                Ok(Response::Session(key))
            }
            Request::CloseSession { session } => {
                let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
                sessions.remove(&session);
                Ok(Response::Unit)
            }
            other => {
                let Some(key) = other.session() else {
                    return Err(Fault::protocol(format!("{} names no session", other.name())));
                };
                let shared = self.session(key)?;
                let mut session = shared.lock().unwrap_or_else(PoisonError::into_inner);
                serve_session(session.as_mut(), other).map_err(fault)
            }
        }
    }
}

fn serve_session(session: &mut dyn RuntimeSession, request: Request) -> crate::Result<Response> {
    let response = match request {
        Request::Global { module, name, .. } => Response::Obj(session.global(&module, &name)?),
        Request::Eval { source, .. } => Response::Obj(session.eval(&source)?),
        Request::FromValue { value, .. } => Response::Obj(session.from_value(&value)?),
        Request::ToValue { obj, .. } => Response::Value(session.to_value(obj)?),
        Request::Attr { obj, name, .. } => Response::Obj(session.attr(obj, &name)?),
        Request::SetAttr { obj, name, value, .. } => {
            session.set_attr(obj, &name, value)?;
            Response::Unit
        }
        Request::Call { callee, args, .. } => Response::Obj(session.call(callee, &args)?),
        Request::IsOwner { obj, .. } => Response::Bool(session.is_owner(obj)?),
        Request::Pickle { receiver, obj, .. } => Response::Bytes(session.pickle(receiver, obj)?),
        Request::UnpickleOrGet { id, data, .. } => {
            Response::Obj(session.unpickle_or_get(id, &data)?)
        }
        Request::Unload { id, .. } => Response::Bool(session.unload(id)?),
        Request::OpenSession | Request::CloseSession { .. } => {
            return Err(Error::Runtime(Fault::protocol("session management inside a session")));
        }
    };
    Ok(response)
}

/// Host resolver as seen from inside the image.
struct ForeignResolver(RtResolver);

// SAFETY: the host's resolver context is shared across threads by contract.
unsafe impl Send for ForeignResolver {}
unsafe impl Sync for ForeignResolver {}

unsafe extern "C" fn emit_source(sink: *mut c_void, text: RtStr) {
    // SAFETY: `sink` is the `Option<String>` passed by `ForeignResolver::find`.
    let found = unsafe { &mut *(sink as *mut Option<String>) };
    // SAFETY: the host keeps `text` alive for the call.
    *found = Some(String::from_utf8_lossy(unsafe { text.as_bytes() }).into_owned());
}

impl ForeignResolver {
    fn find(&self, name: &str) -> Option<String> {
        let mut found: Option<String> = None;
        let sink = &mut found as *mut Option<String> as *mut c_void;
        // SAFETY: `sink` outlives the call; `emit_source` matches its type.
        let hit = unsafe { (self.0.find)(self.0.ctx, RtStr::new(name), sink, emit_source) };
        if hit { found } else { None }
    }
}

unsafe extern "C" fn exported_dispatch(state: *mut c_void, request: RtStr, out: *mut RtBuf) -> RtStatus {
    // SAFETY: `state` came from `export_runtime` and is not yet finalized.
    let exported = unsafe { &*(state as *const Exported) };
    // SAFETY: the host keeps the request bytes alive for the call.
    let reply = match codec::decode_request(unsafe { request.as_bytes() }) {
        Ok(request) => exported.serve(request),
        Err(e) => Err(Fault::protocol(e.to_string())),
    };
    match codec::encode_reply(&reply) {
        Ok(bytes) => {
            // SAFETY: `out` points at a host-owned slot.
            unsafe { out.write(RtBuf::from_vec(bytes)) };
            RtStatus::OK
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to encode reply");
            RtStatus::FAILED
        }
    }
}

unsafe extern "C" fn exported_free_buf(buf: RtBuf) {
    // SAFETY: every non-empty buffer handed out came from `RtBuf::from_vec`.
    drop(unsafe { buf.into_vec() });
}

unsafe extern "C" fn exported_set_resolver(state: *mut c_void, resolver: RtResolver) {
    // SAFETY: as in `exported_dispatch`.
    let exported = unsafe { &*(state as *const Exported) };
    let foreign = ForeignResolver(resolver);
    let hook: ModuleResolver = Arc::new(move |name: &str| foreign.find(name));
    exported.runtime.set_module_resolver(hook);
}

unsafe extern "C" fn exported_finalize(state: *mut c_void) -> RtStatus {
    // SAFETY: `state` came from `Box::into_raw` in `export_runtime`; finalize runs once.
    let exported = unsafe { Box::from_raw(state as *mut Exported) };
    let Exported { runtime, sessions } = *exported;
    drop(sessions);
    match runtime.finalize() {
        Ok(()) => RtStatus::OK,
        Err(e) => {
            tracing::error!(error = %e, "runtime finalization failed");
            RtStatus::FAILED
        }
    }
}

/// Exposes `runtime` through the C ABI. The returned vtable owns the runtime
/// until its `finalize` entry is called.
pub fn export_runtime(runtime: Box<dyn RuntimeState>) -> RtRuntimeV1 {
    let exported = Box::new(Exported { runtime, sessions: Mutex::new(HashMap::new()) });
    RtRuntimeV1 {
        abi_version: ABI_VERSION,
        state: Box::into_raw(exported) as *mut c_void,
        dispatch: exported_dispatch,
        free_buf: exported_free_buf,
        set_resolver: exported_set_resolver,
        finalize: exported_finalize,
    }
}
