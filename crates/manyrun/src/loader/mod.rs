//! # Image Loader
//!
//! Opens runtime images and exposes their entry points.
//!
//! ## Philosophy
//!
//! - **Private namespaces**: every image is opened with local symbol
//!   visibility, so N copies of the same image coexist without their globals
//!   aliasing. Images that bring their own extension loader are additionally
//!   opened with deep binding, so they resolve against themselves first.
//! - **One teardown order**: a [`LoadedImage`] only offers the pieces; the
//!   order (finalize, flush, close) is encoded once in
//!   [`Instance`](crate::Instance) and callers cannot reorder it.

use std::path::Path;
use std::path::PathBuf;

use crate::error::Result;
use crate::runtime::RuntimeState;

#[cfg(unix)]
pub mod dl;

#[cfg(unix)]
pub use dl::DlLoader;

bitflags::bitflags! {
    /// Dynamic loader mode for one image.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct LoadFlags: u32 {
        /// Symbols are not made available to later loads.
        const LOCAL = 1 << 0;
        /// Resolve functions on first call.
        const LAZY = 1 << 1;
        /// Prefer the image's own symbols over already loaded ones.
        const DEEPBIND = 1 << 2;
    }
}

impl LoadFlags {
    /// `LOCAL | LAZY`, plus `DEEPBIND` for images with a custom loader.
    pub fn for_image(custom_loader: bool) -> Self {
        let mut flags = Self::LOCAL | Self::LAZY;
        if custom_loader {
            flags |= Self::DEEPBIND;
        }
        flags
    }
}

/// Opens images. Shared by every instance of a manager.
pub trait ImageLoader: Send + Sync {
    fn open(&self, path: &Path, flags: LoadFlags) -> Result<Box<dyn LoadedImage>>;
}

/// One opened copy of an image.
///
/// Every entry point lookup that fails is an
/// [`Error::Integrity`](crate::Error::Integrity): images are build artifacts,
/// so a missing symbol means the image is corrupt or from another build.
pub trait LoadedImage: Send + Sync {
    fn path(&self) -> &Path;

    /// Hands the image its own loader handle, so extension libraries it
    /// loads later bind against this copy.
    fn bind_self(&self) -> Result<()>;

    /// Calls the image's factory.
    fn new_runtime(
        &self,
        extra_paths: &[PathBuf],
        plugin_paths: &[PathBuf],
    ) -> Result<Box<dyn RuntimeState>>;

    /// Unloads extension libraries the runtime opened.
    fn flush_native_libs(&self) -> Result<()>;

    /// Closes the image. Any runtime created from it must be finalized first.
    fn close(self: Box<Self>) -> Result<()>;
}
