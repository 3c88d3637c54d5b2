//! # C ABI
//!
//! The fixed binary interface a runtime image exports. The host looks these
//! entry points up by name after loading the image:
//!
//! - [`NEW_RUNTIME_SYMBOL`] (required): builds the runtime state and fills in
//!   an [`RtRuntimeV1`] vtable.
//! - [`SET_SELF_SYMBOL`] (required for isolated loading): receives the loader
//!   handle of this very copy of the image, so that extension libraries the
//!   runtime loads later bind against this copy rather than a sibling.
//! - [`FLUSH_NATIVE_LIBS_SYMBOL`] (required for isolated loading): unloads
//!   those extension libraries; called after the runtime state is finalized
//!   and before the image is closed.
//!
//! Buffers handed from the image to the host are owned by the image and must
//! be returned through [`RtRuntimeV1::free_buf`]; each image copy may carry
//! its own allocator.

use std::ffi::c_void;
use std::mem::ManuallyDrop;

pub const ABI_VERSION: u32 = 1;

pub const NEW_RUNTIME_SYMBOL: &str = "manyrun_new_runtime";
pub const SET_SELF_SYMBOL: &str = "manyrun_set_self";
pub const FLUSH_NATIVE_LIBS_SYMBOL: &str = "manyrun_flush_native_libs";

/// Borrowed bytes. Valid only for the duration of the call they are passed to.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct RtStr {
    pub ptr: *const u8,
    pub len: usize,
}

impl RtStr {
    pub fn new(s: &str) -> Self {
        Self::from_bytes(s.as_bytes())
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self { ptr: bytes.as_ptr(), len: bytes.len() }
    }

    /// # Safety
    /// `ptr` and `len` must describe live, initialized bytes for `'a`, or `ptr` must be null.
    pub unsafe fn as_bytes<'a>(self) -> &'a [u8] {
        if self.ptr.is_null() || self.len == 0 {
            return &[];
        }
        // SAFETY: upheld by the caller.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

/// Owned bytes allocated by the side that produced them.
#[repr(C)]
#[derive(Debug)]
pub struct RtBuf {
    pub ptr: *mut u8,
    pub len: usize,
    pub cap: usize,
}

impl RtBuf {
    pub const fn empty() -> Self {
        Self { ptr: std::ptr::null_mut(), len: 0, cap: 0 }
    }

    pub fn from_vec(bytes: Vec<u8>) -> Self {
        let mut bytes = ManuallyDrop::new(bytes);
        Self { ptr: bytes.as_mut_ptr(), len: bytes.len(), cap: bytes.capacity() }
    }

    /// # Safety
    /// The buffer must be live; it must not have been released yet.
    pub unsafe fn as_slice(&self) -> &[u8] {
        if self.ptr.is_null() || self.len == 0 {
            return &[];
        }
        // SAFETY: upheld by the caller.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    /// Reclaims a buffer produced by [`RtBuf::from_vec`]. Returns an empty
    /// vector for [`RtBuf::empty`].
    ///
    /// # Safety
    /// Must only be called by the side that allocated the buffer, exactly once.
    pub unsafe fn into_vec(self) -> Vec<u8> {
        if self.ptr.is_null() {
            return Vec::new();
        }
        // SAFETY: upheld by the caller; the parts came from `from_vec`.
        unsafe { Vec::from_raw_parts(self.ptr, self.len, self.cap) }
    }
}

/// Status code returned across the boundary. Kept as a plain integer so
/// that any value an image returns is representable; the host treats codes
/// it does not know as an integrity fault.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RtStatus(pub u32);

impl RtStatus {
    pub const OK: Self = Self(0);
    pub const FAILED: Self = Self(1);
    pub const INCOMPATIBLE: Self = Self(2);

    pub fn is_ok(self) -> bool {
        self == Self::OK
    }
}

impl std::fmt::Display for RtStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::OK => f.write_str("ok"),
            Self::FAILED => f.write_str("failed"),
            Self::INCOMPATIBLE => f.write_str("incompatible"),
            Self(code) => write!(f, "unknown status {}", code),
        }
    }
}

/// Receives module source text from the host. The image must copy `text`
/// before returning.
pub type RtEmitFn = unsafe extern "C" fn(sink: *mut c_void, text: RtStr);

/// Host callback consulted when the runtime cannot find a module itself.
/// Returns `true` after calling `emit` exactly once when `name` is known.
pub type RtFindFn =
    unsafe extern "C" fn(ctx: *const c_void, name: RtStr, sink: *mut c_void, emit: RtEmitFn) -> bool;

/// Installed with [`RtRuntimeV1::set_resolver`]. A new resolver replaces the
/// previous one; the image must not call the old `ctx` after `set_resolver`
/// returns.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct RtResolver {
    pub ctx: *const c_void,
    pub find: RtFindFn,
}

/// The runtime vtable filled in by [`RtNewRuntimeFn`].
///
/// `dispatch` takes an encoded [`Request`](crate::Request) and writes an
/// encoded [`Reply`](crate::Reply) into `out`. It returns a non-`Ok` status
/// only when no reply could be produced at all.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct RtRuntimeV1 {
    pub abi_version: u32,
    pub state: *mut c_void,
    pub dispatch: unsafe extern "C" fn(state: *mut c_void, request: RtStr, out: *mut RtBuf) -> RtStatus,
    pub free_buf: unsafe extern "C" fn(buf: RtBuf),
    pub set_resolver: unsafe extern "C" fn(state: *mut c_void, resolver: RtResolver),
    /// Runs the runtime's own finalization and releases `state`.
    pub finalize: unsafe extern "C" fn(state: *mut c_void) -> RtStatus,
}

pub type RtNewRuntimeFn = unsafe extern "C" fn(
    extra_paths: *const RtStr,
    extra_len: usize,
    plugin_paths: *const RtStr,
    plugin_len: usize,
    out: *mut RtRuntimeV1,
) -> RtStatus;

pub type RtSetSelfFn = unsafe extern "C" fn(handle: *mut c_void);

pub type RtFlushNativeLibsFn = unsafe extern "C" fn();
