//! In-process runtime used by the mock image.
//!
//! Objects live in a per-runtime heap and are referenced from sessions by
//! slot. Session keys are unique across every mock runtime in the process,
//! so an [`Obj`] from one instance is never mistaken for a local one.
//!
//! Modules:
//! - `runtime`: holds the `version` namespace instances are tagged through.
//! - `builtins`: `add`, `len`, `echo`, `fail`, `id`, `list`.
//! - anything else is looked up through the module resolver; module source
//!   is one `name = literal` binding per line.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::RwLock;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use manyrpc::Fault;
use manyrpc::Obj;
use manyrpc::ObjectId;
use manyrpc::SessionKey;
use manyrpc::Value;
use manyrpc::codec;

use super::MockEvent;
use super::literal;
use crate::error::Error;
use crate::error::Result;
use crate::registry::ModuleResolver;
use crate::runtime::RuntimeSession;
use crate::runtime::RuntimeState;

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);
static NEXT_OBJECT: AtomicU64 = AtomicU64::new(1);

#[derive(Copy, Clone, Debug)]
enum Builtin {
    Add,
    Len,
    Echo,
    Fail,
    Id,
    List,
}

impl Builtin {
    const ALL: [(&'static str, Builtin); 6] = [
        ("add", Builtin::Add),
        ("len", Builtin::Len),
        ("echo", Builtin::Echo),
        ("fail", Builtin::Fail),
        ("id", Builtin::Id),
        ("list", Builtin::List),
    ];
}

enum Kind {
    Value(Value),
    Builtin(Builtin),
    Namespace(Mutex<HashMap<String, Arc<Object>>>),
}

struct Object {
    oid: u64,
    kind: Kind,
}

impl Object {
    fn new(kind: Kind) -> Arc<Self> {
        Arc::new(Self { oid: NEXT_OBJECT.fetch_add(1, Ordering::Relaxed), kind })
    }

    fn value(value: Value) -> Arc<Self> {
        Self::new(Kind::Value(value))
    }

    fn namespace(members: HashMap<String, Arc<Object>>) -> Arc<Self> {
        Self::new(Kind::Namespace(Mutex::new(members)))
    }

    fn type_name(&self) -> &'static str {
        match &self.kind {
            Kind::Value(v) => v.type_name(),
            Kind::Builtin(_) => "builtin",
            Kind::Namespace(_) => "namespace",
        }
    }

    fn as_value(&self) -> std::result::Result<&Value, Fault> {
        match &self.kind {
            Kind::Value(v) => Ok(v),
            _ => Err(Fault::runtime(format!("expected a value, got {}", self.type_name()))),
        }
    }

    fn get_attr(&self, name: &str) -> std::result::Result<Arc<Object>, Fault> {
        match &self.kind {
            Kind::Namespace(members) => {
                let members = members.lock().unwrap_or_else(PoisonError::into_inner);
                members
                    .get(name)
                    .cloned()
                    .ok_or_else(|| Fault::not_found(format!("namespace has no attribute {:?}", name)))
            }
            _ => Err(Fault::not_found(format!(
                "{} object has no attribute {:?}",
                self.type_name(),
                name
            ))),
        }
    }
}

fn parse_module(name: &str, source: &str) -> std::result::Result<Arc<Object>, Fault> {
    let mut members = HashMap::new();
    for (lineno, line) in source.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let parsed = line.split_once('=').and_then(|(binding, literal)| {
            let binding = binding.trim();
            let valid = !binding.is_empty()
                && binding.chars().all(|c| c.is_alphanumeric() || c == '_');
            valid.then_some((binding, literal))
        });
        let Some((binding, text)) = parsed else {
            return Err(Fault::runtime(format!("{}:{}: invalid syntax", name, lineno + 1)));
        };
        let value = literal::parse(text)
            .map_err(|e| Fault::runtime(format!("{}:{}: {}", name, lineno + 1, e)))?;
        members.insert(binding.to_string(), Object::value(value));
    }
    Ok(Object::namespace(members))
}

struct Observer {
    image: u64,
    events: Arc<Mutex<Vec<MockEvent>>>,
}

struct Inner {
    version: Arc<Object>,
    modules: Mutex<HashMap<String, Arc<Object>>>,
    resolver: RwLock<Option<ModuleResolver>>,
    replicated: Mutex<HashMap<ObjectId, Arc<Object>>>,
    unpickles: AtomicUsize,
    open_sessions: AtomicUsize,
    finalized: AtomicBool,
    fail_finalize: bool,
    search_paths: Vec<PathBuf>,
    observer: Option<Observer>,
}

impl Inner {
    fn module(&self, name: &str) -> std::result::Result<Arc<Object>, Fault> {
        {
            let modules = self.modules.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(module) = modules.get(name) {
                return Ok(Arc::clone(module));
            }
        }

        let resolver = self.resolver.read().unwrap_or_else(PoisonError::into_inner).clone();
        let source = resolver
            .and_then(|resolve| resolve(name))
            .ok_or_else(|| Fault::not_found(format!("no module named {:?}", name)))?;
        let module = parse_module(name, &source)?;

        let mut modules = self.modules.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(Arc::clone(modules.entry(name.to_string()).or_insert(module)))
    }
}

/// The mock runtime. Clones share state, so a test can keep one as an observer
/// while the instance owns another.
#[derive(Clone)]
pub struct MockRuntime {
    inner: Arc<Inner>,
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::build(Vec::new(), false, None)
    }

    pub(crate) fn observed(
        image: u64,
        events: Arc<Mutex<Vec<MockEvent>>>,
        search_paths: Vec<PathBuf>,
        fail_finalize: bool,
    ) -> Self {
        Self::build(search_paths, fail_finalize, Some(Observer { image, events }))
    }

    fn build(search_paths: Vec<PathBuf>, fail_finalize: bool, observer: Option<Observer>) -> Self {
        let version = Object::namespace(HashMap::new());
        let runtime = Object::namespace(HashMap::from([("version".to_string(), Arc::clone(&version))]));
        let builtins = Object::namespace(
            Builtin::ALL
                .iter()
                .map(|(name, builtin)| (name.to_string(), Object::new(Kind::Builtin(*builtin))))
                .collect(),
        );
        let modules =
            HashMap::from([("runtime".to_string(), runtime), ("builtins".to_string(), builtins)]);

        Self {
            inner: Arc::new(Inner {
                version,
                modules: Mutex::new(modules),
                resolver: RwLock::new(None),
                replicated: Mutex::new(HashMap::new()),
                unpickles: AtomicUsize::new(0),
                open_sessions: AtomicUsize::new(0),
                finalized: AtomicBool::new(false),
                fail_finalize,
                search_paths,
                observer,
            }),
        }
    }

    /// How many times a replicated object was actually deserialized.
    pub fn unpickle_count(&self) -> usize {
        self.inner.unpickles.load(Ordering::SeqCst)
    }

    /// Whether an object is currently loaded for `id`.
    pub fn holds(&self, id: ObjectId) -> bool {
        let replicated = self.inner.replicated.lock().unwrap_or_else(PoisonError::into_inner);
        replicated.contains_key(&id)
    }

    pub fn replicated_count(&self) -> usize {
        self.inner.replicated.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn open_sessions(&self) -> usize {
        self.inner.open_sessions.load(Ordering::SeqCst)
    }

    pub fn is_finalized(&self) -> bool {
        self.inner.finalized.load(Ordering::SeqCst)
    }

    /// The `instance` attribute of `runtime.version`, if it was set.
    pub fn instance_tag(&self) -> Option<Value> {
        let tag = self.inner.version.get_attr("instance").ok()?;
        tag.as_value().ok().cloned()
    }

    pub fn search_paths(&self) -> &[PathBuf] {
        &self.inner.search_paths
    }
}

impl RuntimeState for MockRuntime {
    fn open_session(&self) -> Result<Box<dyn RuntimeSession>> {
        if self.is_finalized() {
            return Err(Error::Closed);
        }
        let key = SessionKey(NEXT_SESSION.fetch_add(1, Ordering::Relaxed));
        self.inner.open_sessions.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockSession { key, inner: Arc::clone(&self.inner), slots: Vec::new() }))
    }

    fn set_module_resolver(&self, resolver: ModuleResolver) {
        *self.inner.resolver.write().unwrap_or_else(PoisonError::into_inner) = Some(resolver);
    }

    fn finalize(self: Box<Self>) -> Result<()> {
        self.inner.finalized.store(true, Ordering::SeqCst);
        if let Some(observer) = &self.inner.observer {
            let mut events = observer.events.lock().unwrap_or_else(PoisonError::into_inner);
            events.push(MockEvent::Finalize { image: observer.image });
        }
        if self.inner.fail_finalize {
            return Err(Error::Runtime(Fault::runtime("finalizer raised during shutdown")));
        }
        Ok(())
    }
}

struct MockSession {
    key: SessionKey,
    inner: Arc<Inner>,
    slots: Vec<Arc<Object>>,
}

impl MockSession {
    fn push(&mut self, object: Arc<Object>) -> Obj {
        let slot = self.slots.len() as u32;
        self.slots.push(object);
        Obj::new(self.key, slot)
    }

    fn get(&self, obj: Obj) -> std::result::Result<Arc<Object>, Fault> {
        if obj.session != self.key {
            return Err(Fault::ownership(format!("{} does not belong to {}", obj, self.key)));
        }
        self.slots
            .get(obj.slot as usize)
            .cloned()
            .ok_or_else(|| Fault::not_found(format!("{} is not a live object", obj)))
    }

    fn invoke(&mut self, builtin: Builtin, args: &[Obj]) -> std::result::Result<Arc<Object>, Fault> {
        let args = args.iter().map(|arg| self.get(*arg)).collect::<std::result::Result<Vec<_>, _>>()?;
        let arity = |n: usize| {
            if args.len() == n {
                Ok(())
            } else {
                Err(Fault::runtime(format!("{:?} takes {} arguments, got {}", builtin, n, args.len())))
            }
        };

        match builtin {
            Builtin::Add => {
                arity(2)?;
                let sum = match (args[0].as_value()?, args[1].as_value()?) {
                    (Value::Int(a), Value::Int(b)) => a
                        .checked_add(*b)
                        .map(Value::Int)
                        .ok_or_else(|| Fault::runtime("integer overflow"))?,
                    (Value::Float(a), Value::Float(b)) => Value::Float(a + b),
                    (Value::Int(a), Value::Float(b)) => Value::Float(*a as f64 + b),
                    (Value::Float(a), Value::Int(b)) => Value::Float(a + *b as f64),
                    (Value::Str(a), Value::Str(b)) => Value::Str(format!("{}{}", a, b)),
                    (Value::List(a), Value::List(b)) => {
                        Value::List(a.iter().chain(b.iter()).cloned().collect())
                    }
                    (a, b) => {
                        return Err(Fault::runtime(format!(
                            "unsupported operand types for +: {} and {}",
                            a.type_name(),
                            b.type_name()
                        )));
                    }
                };
                Ok(Object::value(sum))
            }
            Builtin::Len => {
                arity(1)?;
                let len = match args[0].as_value()? {
                    Value::Str(s) => s.chars().count(),
                    Value::List(items) => items.len(),
                    other => {
                        return Err(Fault::runtime(format!("{} has no len()", other.type_name())));
                    }
                };
                Ok(Object::value(Value::Int(len as i64)))
            }
            Builtin::Echo => {
                arity(1)?;
                Ok(Arc::clone(&args[0]))
            }
            Builtin::Fail => {
                let message = match args.first() {
                    Some(arg) => arg.as_value()?.to_string(),
                    None => "failure requested".to_string(),
                };
                Err(Fault::runtime(message))
            }
            Builtin::Id => {
                arity(1)?;
                Ok(Object::value(Value::Int(args[0].oid as i64)))
            }
            Builtin::List => {
                let items = args
                    .iter()
                    .map(|arg| arg.as_value().cloned())
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(Object::value(Value::List(items)))
            }
        }
    }
}

impl RuntimeSession for MockSession {
    fn key(&self) -> SessionKey {
        self.key
    }

    fn global(&mut self, module: &str, name: &str) -> Result<Obj> {
        let member = self.inner.module(module)?.get_attr(name)?;
        Ok(self.push(member))
    }

    fn eval(&mut self, source: &str) -> Result<Obj> {
        let value = literal::parse(source).map_err(Fault::runtime)?;
        Ok(self.push(Object::value(value)))
    }

    fn from_value(&mut self, value: &Value) -> Result<Obj> {
        Ok(self.push(Object::value(value.clone())))
    }

    fn to_value(&mut self, obj: Obj) -> Result<Value> {
        Ok(self.get(obj)?.as_value()?.clone())
    }

    fn attr(&mut self, obj: Obj, name: &str) -> Result<Obj> {
        let member = self.get(obj)?.get_attr(name)?;
        Ok(self.push(member))
    }

    fn set_attr(&mut self, obj: Obj, name: &str, value: Obj) -> Result<()> {
        let target = self.get(obj)?;
        let value = self.get(value)?;
        match &target.kind {
            Kind::Namespace(members) => {
                let mut members = members.lock().unwrap_or_else(PoisonError::into_inner);
                members.insert(name.to_string(), value);
                Ok(())
            }
            _ => Err(Fault::runtime(format!(
                "cannot set attribute {:?} on {}",
                name,
                target.type_name()
            ))
            .into()),
        }
    }

    fn call(&mut self, callee: Obj, args: &[Obj]) -> Result<Obj> {
        let target = self.get(callee)?;
        let Kind::Builtin(builtin) = &target.kind else {
            return Err(Fault::runtime(format!("{} object is not callable", target.type_name())).into());
        };
        let result = self.invoke(*builtin, args)?;
        Ok(self.push(result))
    }

    fn is_owner(&mut self, obj: Obj) -> Result<bool> {
        Ok(obj.session == self.key && (obj.slot as usize) < self.slots.len())
    }

    fn pickle(&mut self, _receiver: Option<Obj>, obj: Obj) -> Result<Vec<u8>> {
        let object = self.get(obj)?;
        let value = object.as_value().map_err(|_| {
            Fault::runtime(format!("cannot pickle {} object", object.type_name()))
        })?;
        codec::encode_value(value).map_err(|e| Error::Runtime(Fault::runtime(e.to_string())))
    }

    fn unpickle_or_get(&mut self, id: ObjectId, data: &[u8]) -> Result<Obj> {
        let object = {
            let mut replicated = self.inner.replicated.lock().unwrap_or_else(PoisonError::into_inner);
            match replicated.get(&id) {
                Some(object) => Arc::clone(object),
                None => {
                    let value = codec::decode_value(data)
                        .map_err(|e| Fault::runtime(format!("unpickling {}: {}", id, e)))?;
                    self.inner.unpickles.fetch_add(1, Ordering::SeqCst);
                    let object = Object::value(value);
                    replicated.insert(id, Arc::clone(&object));
                    object
                }
            }
        };
        Ok(self.push(object))
    }

    fn unload(&mut self, id: ObjectId) -> Result<bool> {
        let mut replicated = self.inner.replicated.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(replicated.remove(&id).is_some())
    }
}

impl Drop for MockSession {
    fn drop(&mut self) {
        self.inner.open_sessions.fetch_sub(1, Ordering::SeqCst);
    }
}
