//! # Instance Manager
//!
//! Owns N runtime instances, the module registry they share, and the load
//! balancer that spreads sessions over them. Either every instance loads and
//! the manager is usable, or construction fails and whatever was already
//! loaded is torn down again.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use manyrpc::ObjectId;
use manyrpc::Value;

use crate::balancer::LoadBalancer;
use crate::environment::DefaultEnvironment;
use crate::environment::Environment;
use crate::error::Error;
use crate::error::Result;
use crate::error::UsageError;
use crate::instance::ImageSpec;
use crate::instance::Instance;
use crate::loader::ImageLoader;
use crate::payload::DirectorySource;
use crate::payload::Payload;
use crate::payload::PayloadSource;
use crate::registry::ModuleRegistry;
use crate::replicated::ReplicatedValue;
use crate::session::Session;

/// Module installed in every manager for argument-name introspection.
pub const ARGUMENT_NAMES_MODULE: &str = "GetArgumentNamesModule";

/// Function in [`ARGUMENT_NAMES_MODULE`] returning a callable's parameter
/// names, or `None` when it takes none.
pub const ARGUMENT_NAMES_FUNCTION: &str = "getArgumentNames";

const ARGUMENT_NAMES_SOURCE: &str = "\
from inspect import signature
from typing import Callable, Optional


def getArgumentNames(function: Callable) -> Optional[list]:
    names = list(signature(function).parameters.keys())
    if len(names) == 0:
        return None
    return names
";

pub struct InstanceManager {
    instances: Vec<Instance>,
    registry: Arc<ModuleRegistry>,
    balancer: LoadBalancer,
    next_object_id: AtomicU64,
    environment: Arc<dyn Environment>,
}

impl InstanceManager {
    /// Loads `count` instances of the default runtime image.
    pub fn new(count: usize, environment: Arc<dyn Environment>) -> Result<Self> {
        Self::builder().instances(count).environment(environment).build()
    }

    pub fn builder() -> ManagerBuilder {
        ManagerBuilder::new()
    }

    /// Inserts or replaces the source for `name`. Visible to every instance
    /// the next time it resolves the module.
    pub fn register_module_source(&self, name: impl Into<String>, source: impl Into<Arc<str>>) {
        self.registry.register(name, source);
    }

    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    /// Opens a session on a lightly loaded instance. Never blocks.
    pub fn acquire_session(&self) -> Result<Session<'_>> {
        let slot = self.balancer.acquire();
        let instance = &self.instances[slot];
        match instance.open_raw() {
            Ok(raw) => Ok(Session::new(instance, Some(self), Some(slot), raw)),
            Err(e) => {
                self.balancer.free(slot);
                Err(e)
            }
        }
    }

    /// Opens a session on a specific instance of this manager, bypassing the
    /// balancer.
    pub fn acquire_session_on<'m>(&'m self, instance: &'m Instance) -> Result<Session<'m>> {
        if !self.owns(instance) {
            return Err(UsageError::ForeignInstance.into());
        }
        Ok(Session::new(instance, Some(self), None, instance.open_raw()?))
    }

    pub(crate) fn release_slot(&self, slot: usize) {
        self.balancer.free(slot);
    }

    pub(crate) fn replicate(&self, data: Vec<u8>) -> ReplicatedValue<'_> {
        let id = ObjectId(self.next_object_id.fetch_add(1, Ordering::SeqCst));
        ReplicatedValue::new(id, data, self)
    }

    pub fn owns(&self, instance: &Instance) -> bool {
        self.instances.iter().any(|own| std::ptr::eq(own, instance))
    }

    pub fn instances(&self) -> &[Instance] {
        &self.instances
    }

    pub fn instance(&self, index: usize) -> Option<&Instance> {
        self.instances.get(index)
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Per-instance count of sessions currently holding a balancer slot.
    pub fn loads(&self) -> Vec<u64> {
        self.balancer.loads()
    }

    pub fn environment(&self) -> &Arc<dyn Environment> {
        &self.environment
    }

    /// Tears down every instance in order. All instances are closed even if
    /// one fails; the first failure is returned.
    pub fn shutdown(self) -> Result<()> {
        let mut first = None;
        for instance in self.instances {
            let id = instance.id();
            if let Err(e) = instance.close() {
                tracing::error!(instance = %id, error = %e, "instance teardown failed");
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }
}

/// Makes `runtime.version.instance` equal to the instance's index, so code
/// inside the runtime can partition work by instance.
fn tag_instance(instance: &Instance) -> Result<()> {
    let mut session = instance.open_raw()?;
    let version = session.global("runtime", "version")?;
    let tag = session.from_value(&Value::Int(instance.id().0 as i64))?;
    session.set_attr(version, "instance", tag)
}

fn default_instance_count() -> usize {
    std::thread::available_parallelism().map(NonZeroUsize::get).unwrap_or(1)
}

#[cfg(unix)]
fn default_loader() -> Option<Arc<dyn ImageLoader>> {
    Some(Arc::new(crate::loader::DlLoader::new()))
}

#[cfg(not(unix))]
fn default_loader() -> Option<Arc<dyn ImageLoader>> {
    None
}

/// Fluent builder for an [`InstanceManager`].
pub struct ManagerBuilder {
    instances: Option<usize>,
    environment: Option<Arc<dyn Environment>>,
    payload: Payload,
    plugins: Vec<Payload>,
    source: Option<Arc<dyn PayloadSource>>,
    loader: Option<Arc<dyn ImageLoader>>,
    modules: Vec<(String, String)>,
}

impl Default for ManagerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ManagerBuilder {
    pub fn new() -> Self {
        Self {
            instances: None,
            environment: None,
            payload: Payload::interpreter(),
            plugins: Vec::new(),
            source: None,
            loader: None,
            modules: Vec::new(),
        }
    }

    /// Number of instances. Defaults to the available parallelism.
    pub fn instances(mut self, count: usize) -> Self {
        self.instances = Some(count);
        self
    }

    pub fn environment(mut self, environment: Arc<dyn Environment>) -> Self {
        self.environment = Some(environment);
        self
    }

    pub fn payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    pub fn plugin(mut self, plugin: Payload) -> Self {
        self.plugins.push(plugin);
        self
    }

    pub fn source(mut self, source: impl PayloadSource + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    pub fn loader(mut self, loader: impl ImageLoader + 'static) -> Self {
        self.loader = Some(Arc::new(loader));
        self
    }

    /// Registers a module source before any instance is created.
    pub fn module(mut self, name: impl Into<String>, source: impl Into<String>) -> Self {
        self.modules.push((name.into(), source.into()));
        self
    }

    pub fn build(self) -> Result<InstanceManager> {
        let count = self.instances.unwrap_or_else(default_instance_count);
        if count == 0 {
            return Err(UsageError::NoInstances.into());
        }
        let environment: Arc<dyn Environment> =
            self.environment.unwrap_or_else(|| Arc::new(DefaultEnvironment::from_env()));
        let source: Arc<dyn PayloadSource> =
            self.source.unwrap_or_else(|| Arc::new(DirectorySource::from_env()));
        let loader = self
            .loader
            .or_else(default_loader)
            .ok_or_else(|| Error::Configure("no image loader for this platform".into()))?;
        let spec = ImageSpec { payload: self.payload, plugins: self.plugins, source, loader };

        let registry = Arc::new(ModuleRegistry::new());
        registry.register(ARGUMENT_NAMES_MODULE, ARGUMENT_NAMES_SOURCE);
        for (name, source) in self.modules {
            registry.register(name, source);
        }

        tracing::debug!(count, payload = %spec.payload.name, "starting instances");
        let mut instances = Vec::with_capacity(count);
        for index in 0..count {
            let instance = Instance::load(index, &spec, environment.as_ref())?;
            tag_instance(&instance)?;
            instance.set_module_resolver(registry.resolver())?;
            instances.push(instance);
        }

        Ok(InstanceManager {
            instances,
            registry,
            balancer: LoadBalancer::new(count),
            next_object_id: AtomicU64::new(0),
            environment,
        })
    }
}
