//! # Runtime Instance
//!
//! One independently loaded and initialized copy of the runtime image.
//!
//! ## Loading
//!
//! 1. Extract the payload and derive loader flags from it.
//! 2. Open the image. Images with a custom loader are opened isolated and
//!    told their own handle (`bind_self`).
//! 3. Extract plugin payloads.
//! 4. Create the runtime through the image's factory, passing the
//!    environment's search paths and the plugin paths.
//! 5. Let the environment configure the instance.
//!
//! ## Teardown
//!
//! Finalize the runtime, flush native libraries (isolated images only), close
//! the image. If finalize or flush fails, the image is left open: closing it
//! under a half-finalized runtime is undefined behavior, so the mapping is
//! leaked and the error surfaced instead.

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use crate::environment::Environment;
use crate::error::Error;
use crate::error::Result;
use crate::loader::ImageLoader;
use crate::loader::LoadFlags;
use crate::loader::LoadedImage;
use crate::payload::ExtractedImage;
use crate::payload::Payload;
use crate::payload::PayloadSource;
use crate::registry::ModuleResolver;
use crate::runtime::RuntimeSession;
use crate::runtime::RuntimeState;
use crate::session::Session;

/// Strong type for instance identifiers: the 0-based position in the manager.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct InstanceId(pub usize);

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "instance-{}", self.0)
    }
}

/// What to load for each instance and how.
#[derive(Clone)]
pub struct ImageSpec {
    pub payload: Payload,
    pub plugins: Vec<Payload>,
    pub source: Arc<dyn PayloadSource>,
    pub loader: Arc<dyn ImageLoader>,
}

impl ImageSpec {
    /// The interpreter payload with no plugins.
    pub fn new(source: Arc<dyn PayloadSource>, loader: Arc<dyn ImageLoader>) -> Self {
        Self { payload: Payload::interpreter(), plugins: Vec::new(), source, loader }
    }
}

/// The image and the runtime it produced, torn down together.
struct LoadedRuntime {
    state: Option<Box<dyn RuntimeState>>,
    image: Option<Box<dyn LoadedImage>>,
    custom_loader: bool,
}

impl LoadedRuntime {
    fn state(&self) -> Result<&dyn RuntimeState> {
        self.state.as_deref().ok_or(Error::Closed)
    }

    fn image(&self) -> Result<&dyn LoadedImage> {
        self.image.as_deref().ok_or(Error::Closed)
    }

    fn teardown(&mut self) -> Result<()> {
        let Some(image) = self.image.take() else {
            return Ok(());
        };

        if let Some(state) = self.state.take() {
            if let Err(e) = state.finalize() {
                std::mem::forget(image);
                return Err(Error::Teardown(format!("finalizing runtime: {}", e)));
            }
            if self.custom_loader {
                if let Err(e) = image.flush_native_libs() {
                    std::mem::forget(image);
                    return Err(Error::Teardown(format!("flushing native libraries: {}", e)));
                }
            }
        }

        image.close()
    }
}

impl Drop for LoadedRuntime {
    fn drop(&mut self) {
        if let Err(e) = self.teardown() {
            tracing::error!(error = %e, "instance teardown failed; image left loaded");
        }
    }
}

pub struct Instance {
    id: InstanceId,
    path: PathBuf,
    // Declared before `images` so the runtime is torn down before extracted files go away.
    runtime: LoadedRuntime,
    images: Vec<ExtractedImage>,
}

impl Instance {
    /// Loads a standalone instance. Sessions on it have no manager, so they
    /// cannot replicate values.
    pub fn load(index: usize, spec: &ImageSpec, environment: &dyn Environment) -> Result<Self> {
        let id = InstanceId(index);
        let main = spec.source.extract(&spec.payload)?;
        let flags = LoadFlags::for_image(main.custom_loader);
        tracing::debug!(instance = %id, path = %main.path.display(), ?flags, "loading runtime image");

        let image = spec.loader.open(&main.path, flags)?;
        let path = main.path.clone();
        let mut runtime =
            LoadedRuntime { state: None, image: Some(image), custom_loader: main.custom_loader };
        let mut images = vec![main];

        if runtime.custom_loader {
            runtime.image()?.bind_self()?;
        }

        let mut plugin_paths = Vec::with_capacity(spec.plugins.len());
        for plugin in &spec.plugins {
            let extracted = spec.source.extract(plugin)?;
            tracing::trace!(instance = %id, plugin = %plugin.name, path = %extracted.path.display(), "plugin extracted");
            plugin_paths.push(extracted.path.clone());
            images.push(extracted);
        }

        let extra_paths = environment.extra_search_paths();
        tracing::trace!(instance = %id, ?extra_paths, ?plugin_paths, "creating runtime");
        runtime.state = Some(runtime.image()?.new_runtime(&extra_paths, &plugin_paths)?);

        let instance = Self { id, path, runtime, images };
        environment
            .configure_instance(&instance)
            .map_err(|e| Error::Configure(format!("{}: {:#}", id, e)))?;

        tracing::debug!(instance = %id, "runtime ready");
        Ok(instance)
    }

    pub fn id(&self) -> InstanceId {
        self.id
    }

    /// Path of the image this instance was loaded from.
    pub fn image_path(&self) -> &Path {
        &self.path
    }

    /// Extracted files kept alive for this instance: the image, then plugins.
    pub fn images(&self) -> &[ExtractedImage] {
        &self.images
    }

    pub fn flags(&self) -> LoadFlags {
        LoadFlags::for_image(self.runtime.custom_loader)
    }

    /// Opens a session pinned to this instance, outside of any manager.
    pub fn acquire_session(&self) -> Result<Session<'_>> {
        Ok(Session::new(self, None, None, self.open_raw()?))
    }

    pub(crate) fn open_raw(&self) -> Result<Box<dyn RuntimeSession>> {
        self.runtime.state()?.open_session()
    }

    pub fn set_module_resolver(&self, resolver: ModuleResolver) -> Result<()> {
        self.runtime.state()?.set_module_resolver(resolver);
        Ok(())
    }

    /// Tears the instance down, reporting failures instead of logging them.
    pub fn close(mut self) -> Result<()> {
        tracing::debug!(instance = %self.id, "closing instance");
        self.runtime.teardown()
    }
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("flags", &self.flags())
            .finish()
    }
}
