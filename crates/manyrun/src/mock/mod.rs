//! Mock image for testing and for hosts that cannot load native images.
//!
//! [`MockLoader`] stands in for the dynamic loader and records every loader
//! interaction as a [`MockEvent`], so tests can observe flags, bind-self
//! calls, and the teardown order. [`MockSource`] stands in for payload
//! extraction. Runtimes are [`MockRuntime`]s, optionally driven through the
//! real ABI adapters.

mod literal;
mod runtime;

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use manyrpc::abi::FLUSH_NATIVE_LIBS_SYMBOL;
use manyrpc::abi::NEW_RUNTIME_SYMBOL;
use manyrpc::abi::SET_SELF_SYMBOL;

pub use runtime::MockRuntime;

use crate::abi::export::export_runtime;
use crate::abi::import::NativeRuntime;
use crate::error::Error;
use crate::error::Result;
use crate::loader::ImageLoader;
use crate::loader::LoadFlags;
use crate::loader::LoadedImage;
use crate::payload::ExtractedImage;
use crate::payload::Payload;
use crate::payload::PayloadSource;
use crate::runtime::RuntimeState;

/// One loader interaction. `image` counts opens, starting at zero.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MockEvent {
    Open { image: u64, path: PathBuf, flags: LoadFlags },
    BindSelf { image: u64 },
    NewRuntime { image: u64, extra_paths: Vec<PathBuf>, plugin_paths: Vec<PathBuf> },
    Finalize { image: u64 },
    Flush { image: u64 },
    Close { image: u64 },
}

impl MockEvent {
    pub fn image(&self) -> u64 {
        match self {
            Self::Open { image, .. }
            | Self::BindSelf { image }
            | Self::NewRuntime { image, .. }
            | Self::Finalize { image }
            | Self::Flush { image }
            | Self::Close { image } => *image,
        }
    }
}

#[derive(Clone, Debug, Default)]
struct Options {
    through_abi: bool,
    missing_symbol: Option<&'static str>,
    fail_open_at: Option<usize>,
    fail_finalize: bool,
    fail_flush: bool,
}

#[derive(Default)]
struct Shared {
    events: Arc<Mutex<Vec<MockEvent>>>,
    runtimes: Mutex<Vec<MockRuntime>>,
    opened: AtomicUsize,
}

impl Shared {
    fn record(&self, event: MockEvent) {
        tracing::trace!(?event, "mock loader");
        self.events.lock().unwrap_or_else(PoisonError::into_inner).push(event);
    }
}

/// Loader producing [`MockRuntime`]s. Clones share their event log.
#[derive(Clone, Default)]
pub struct MockLoader {
    options: Options,
    shared: Arc<Shared>,
}

impl MockLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap every runtime in the C ABI adapters.
    pub fn through_abi(mut self) -> Self {
        self.options.through_abi = true;
        self
    }

    /// Images will not export `symbol`.
    pub fn missing_symbol(mut self, symbol: &'static str) -> Self {
        self.options.missing_symbol = Some(symbol);
        self
    }

    /// The `n`th open (counting from zero) is refused.
    pub fn fail_open_at(mut self, n: usize) -> Self {
        self.options.fail_open_at = Some(n);
        self
    }

    pub fn fail_finalize(mut self) -> Self {
        self.options.fail_finalize = true;
        self
    }

    pub fn fail_flush(mut self) -> Self {
        self.options.fail_flush = true;
        self
    }

    pub fn events(&self) -> Vec<MockEvent> {
        self.shared.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Events of one image, in order.
    pub fn events_for(&self, image: u64) -> Vec<MockEvent> {
        self.events().into_iter().filter(|e| e.image() == image).collect()
    }

    /// Handles on every runtime created so far, in creation order.
    pub fn runtimes(&self) -> Vec<MockRuntime> {
        self.shared.runtimes.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn runtime(&self, index: usize) -> Option<MockRuntime> {
        self.runtimes().get(index).cloned()
    }

    pub fn opened(&self) -> usize {
        self.shared.opened.load(Ordering::SeqCst)
    }
}

impl ImageLoader for MockLoader {
    fn open(&self, path: &Path, flags: LoadFlags) -> Result<Box<dyn LoadedImage>> {
        let n = self.shared.opened.fetch_add(1, Ordering::SeqCst);
        if self.options.fail_open_at == Some(n) {
            return Err(Error::Load {
                path: path.to_path_buf(),
                message: "mock image refused to open".into(),
            });
        }
        let image = n as u64;
        self.shared.record(MockEvent::Open { image, path: path.to_path_buf(), flags });
        Ok(Box::new(MockImage {
            image,
            path: path.to_path_buf(),
            options: self.options.clone(),
            shared: Arc::clone(&self.shared),
        }))
    }
}

struct MockImage {
    image: u64,
    path: PathBuf,
    options: Options,
    shared: Arc<Shared>,
}

impl MockImage {
    fn require(&self, symbol: &str) -> Result<()> {
        if self.options.missing_symbol == Some(symbol) {
            return Err(Error::missing_symbol(symbol));
        }
        Ok(())
    }
}

impl LoadedImage for MockImage {
    fn path(&self) -> &Path {
        &self.path
    }

    fn bind_self(&self) -> Result<()> {
        self.require(SET_SELF_SYMBOL)?;
        self.shared.record(MockEvent::BindSelf { image: self.image });
        Ok(())
    }

    fn new_runtime(
        &self,
        extra_paths: &[PathBuf],
        plugin_paths: &[PathBuf],
    ) -> Result<Box<dyn RuntimeState>> {
        self.require(NEW_RUNTIME_SYMBOL)?;
        self.shared.record(MockEvent::NewRuntime {
            image: self.image,
            extra_paths: extra_paths.to_vec(),
            plugin_paths: plugin_paths.to_vec(),
        });

        let runtime = MockRuntime::observed(
            self.image,
            Arc::clone(&self.shared.events),
            extra_paths.to_vec(),
            self.options.fail_finalize,
        );
        self.shared.runtimes.lock().unwrap_or_else(PoisonError::into_inner).push(runtime.clone());

        if self.options.through_abi {
            let native = NativeRuntime::from_vtable(export_runtime(Box::new(runtime)))?;
            Ok(Box::new(native))
        } else {
            Ok(Box::new(runtime))
        }
    }

    fn flush_native_libs(&self) -> Result<()> {
        self.require(FLUSH_NATIVE_LIBS_SYMBOL)?;
        self.shared.record(MockEvent::Flush { image: self.image });
        if self.options.fail_flush {
            return Err(Error::Teardown("mock flush failed".into()));
        }
        Ok(())
    }

    fn close(self: Box<Self>) -> Result<()> {
        self.shared.record(MockEvent::Close { image: self.image });
        Ok(())
    }
}

/// Payload source that invents a distinct path per extraction.
#[derive(Clone, Default)]
pub struct MockSource {
    section: usize,
    missing: Option<String>,
    extracted: Arc<AtomicUsize>,
}

impl MockSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Extract the payload's `index`th section (falling back to the first),
    /// e.g. `1` for an interpreter build without a custom loader.
    pub fn section(mut self, index: usize) -> Self {
        self.section = index;
        self
    }

    /// Extraction of the payload named `name` fails.
    pub fn missing(mut self, name: impl Into<String>) -> Self {
        self.missing = Some(name.into());
        self
    }

    pub fn extracted(&self) -> usize {
        self.extracted.load(Ordering::SeqCst)
    }
}

impl PayloadSource for MockSource {
    fn extract(&self, payload: &Payload) -> Result<ExtractedImage> {
        let section = payload.sections.get(self.section).or_else(|| payload.sections.first());
        let section = match section {
            Some(section) if self.missing.as_deref() != Some(payload.name.as_str()) => section,
            _ => {
                return Err(Error::Extract {
                    payload: payload.name.clone(),
                    message: "not embedded in this build".into(),
                });
            }
        };
        let n = self.extracted.fetch_add(1, Ordering::SeqCst);
        let path = PathBuf::from(format!("/mock/{}/{}", n, section.file_name()));
        Ok(ExtractedImage::new(path, section.custom_loader))
    }
}
