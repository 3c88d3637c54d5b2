//! # Module Source Registry
//!
//! Name to source text, owned by one manager and consulted by each of its
//! instances when the runtime cannot find a module on its own. Managers never
//! share a registry.

use std::sync::Arc;

use dashmap::DashMap;

/// Resolver hook handed to a runtime: module name in, source text out.
pub type ModuleResolver = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

#[derive(Default)]
pub struct ModuleRegistry {
    sources: DashMap<String, Arc<str>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or overwrites the source for `name`.
    pub fn register(&self, name: impl Into<String>, source: impl Into<Arc<str>>) {
        let name = name.into();
        tracing::trace!(module = %name, "registering module source");
        self.sources.insert(name, source.into());
    }

    /// The most recently registered source for `name`.
    pub fn resolve(&self, name: &str) -> Option<Arc<str>> {
        self.sources.get(name).map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.sources.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// A resolver that reads through to this registry, so sources
    /// registered later are visible to instances created earlier.
    pub fn resolver(self: &Arc<Self>) -> ModuleResolver {
        let registry = Arc::clone(self);
        Arc::new(move |name| registry.resolve(name).map(|source| source.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_registered() {
        let registry = ModuleRegistry::new();
        registry.register("Foo", "x=1");

        assert_eq!(registry.resolve("Foo").as_deref(), Some("x=1"));
        assert!(registry.resolve("Bar").is_none());
    }

    #[test]
    fn test_latest_registration_wins() {
        let registry = ModuleRegistry::new();
        registry.register("Foo", "x=1");
        registry.register("Foo", "x=2");

        assert_eq!(registry.resolve("Foo").as_deref(), Some("x=2"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_resolver_sees_later_registrations() {
        let registry = Arc::new(ModuleRegistry::new());
        let resolver = registry.resolver();
        assert_eq!(resolver("late"), None);

        registry.register("late", "y = 3");
        assert_eq!(resolver("late").as_deref(), Some("y = 3"));
    }

    #[test]
    fn test_registries_are_independent() {
        let a = Arc::new(ModuleRegistry::new());
        let b = Arc::new(ModuleRegistry::new());
        a.register("shared", "a = 1");

        assert!(b.resolver()("shared").is_none());
        assert!(a.contains("shared"));
        assert!(b.is_empty());
    }
}
