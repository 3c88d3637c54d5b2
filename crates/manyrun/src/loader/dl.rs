//! `dlopen`-backed loader.

use std::ffi::c_void;
use std::os::raw::c_int;
use std::path::Path;
use std::path::PathBuf;

use libloading::os::unix::Library;
use manyrpc::abi::FLUSH_NATIVE_LIBS_SYMBOL;
use manyrpc::abi::NEW_RUNTIME_SYMBOL;
use manyrpc::abi::RtFlushNativeLibsFn;
use manyrpc::abi::RtNewRuntimeFn;
use manyrpc::abi::RtSetSelfFn;
use manyrpc::abi::SET_SELF_SYMBOL;

use crate::abi::import::NativeRuntime;
use crate::error::Error;
use crate::error::Result;
use crate::loader::ImageLoader;
use crate::loader::LoadFlags;
use crate::loader::LoadedImage;
use crate::runtime::RuntimeState;

#[derive(Clone, Copy, Debug, Default)]
pub struct DlLoader;

impl DlLoader {
    pub fn new() -> Self {
        Self
    }
}

#[cfg(all(target_os = "linux", target_env = "gnu"))]
fn deepbind() -> Option<c_int> {
    Some(libc::RTLD_DEEPBIND)
}

#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
fn deepbind() -> Option<c_int> {
    None
}

fn raw_flags(path: &Path, flags: LoadFlags) -> Result<c_int> {
    let mut raw = 0;
    if flags.contains(LoadFlags::LOCAL) {
        raw |= libc::RTLD_LOCAL;
    }
    if flags.contains(LoadFlags::LAZY) {
        raw |= libc::RTLD_LAZY;
    } else {
        raw |= libc::RTLD_NOW;
    }
    if flags.contains(LoadFlags::DEEPBIND) {
        raw |= deepbind().ok_or_else(|| Error::Load {
            path: path.to_path_buf(),
            message: "isolated loading is not supported on this platform".into(),
        })?;
    }
    Ok(raw)
}

fn open_image(path: &Path, flags: LoadFlags) -> Result<DlImage> {
    let raw = raw_flags(path, flags)?;
    tracing::trace!(path = %path.display(), ?flags, raw, "dlopen");

    // SAFETY: opening runs the image's initializers; images are trusted build artifacts.
    let library = unsafe { Library::open(Some(path), raw) }.map_err(|e| Error::Load {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    let handle = library.into_raw();
    // SAFETY: `handle` was just produced by `into_raw`.
    let library = unsafe { Library::from_raw(handle) };

    Ok(DlImage { path: path.to_path_buf(), library, handle: RawHandle(handle) })
}

impl ImageLoader for DlLoader {
    fn open(&self, path: &Path, flags: LoadFlags) -> Result<Box<dyn LoadedImage>> {
        Ok(Box::new(open_image(path, flags)?))
    }
}

/// The loader's handle for an open image, as passed to `set_self`.
struct RawHandle(*mut c_void);

// SAFETY: the handle is an opaque token owned by the dynamic loader; dlsym and
// dlclose may be called on it from any thread.
unsafe impl Send for RawHandle {}
unsafe impl Sync for RawHandle {}

pub struct DlImage {
    path: PathBuf,
    library: Library,
    handle: RawHandle,
}

impl DlImage {
    fn symbol<T: Copy>(&self, name: &str) -> Result<T> {
        // SAFETY: `T` is the entry point type declared by the ABI for `name`.
        let symbol = unsafe { self.library.get::<T>(name.as_bytes()) }
            .map_err(|_| Error::missing_symbol(name))?;
        Ok(*symbol)
    }
}

impl LoadedImage for DlImage {
    fn path(&self) -> &Path {
        &self.path
    }

    fn bind_self(&self) -> Result<()> {
        let set_self: RtSetSelfFn = self.symbol(SET_SELF_SYMBOL)?;
        // SAFETY: the handle stays valid until `close`.
        unsafe { set_self(self.handle.0) };
        Ok(())
    }

    fn new_runtime(
        &self,
        extra_paths: &[PathBuf],
        plugin_paths: &[PathBuf],
    ) -> Result<Box<dyn RuntimeState>> {
        let factory: RtNewRuntimeFn = self.symbol(NEW_RUNTIME_SYMBOL)?;
        let runtime = NativeRuntime::create(factory, extra_paths, plugin_paths)?;
        Ok(Box::new(runtime))
    }

    fn flush_native_libs(&self) -> Result<()> {
        let flush: RtFlushNativeLibsFn = self.symbol(FLUSH_NATIVE_LIBS_SYMBOL)?;
        // SAFETY: takes no arguments; the image is still mapped.
        unsafe { flush() };
        Ok(())
    }

    fn close(self: Box<Self>) -> Result<()> {
        let path = self.path;
        self.library
            .close()
            .map_err(|e| Error::Teardown(format!("closing {}: {}", path.display(), e)))
    }
}
