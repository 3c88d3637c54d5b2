//! # Session
//!
//! A short-lived borrow of one instance through which all calls into its
//! runtime are made. A session is used by one thread at a time; distinct
//! sessions, even on the same instance, may run concurrently.
//!
//! A session obtained through a manager's load balancer holds a slot and
//! gives it back exactly once when dropped, on every exit path.

use manyrpc::Obj;
use manyrpc::SessionKey;
use manyrpc::Value;

use crate::error::Result;
use crate::error::UsageError;
use crate::instance::Instance;
use crate::manager::InstanceManager;
use crate::replicated::ReplicatedValue;
use crate::runtime::RuntimeSession;

pub struct Session<'m> {
    instance: &'m Instance,
    manager: Option<&'m InstanceManager>,
    slot: Option<usize>,
    runtime: Box<dyn RuntimeSession>,
    current: Option<Obj>,
}

impl<'m> Session<'m> {
    pub(crate) fn new(
        instance: &'m Instance,
        manager: Option<&'m InstanceManager>,
        slot: Option<usize>,
        runtime: Box<dyn RuntimeSession>,
    ) -> Self {
        Self { instance, manager, slot, runtime, current: None }
    }

    pub fn instance(&self) -> &'m Instance {
        self.instance
    }

    pub fn manager(&self) -> Option<&'m InstanceManager> {
        self.manager
    }

    /// The balancer slot this session holds, if it came from the balancer.
    pub fn slot(&self) -> Option<usize> {
        self.slot
    }

    pub fn key(&self) -> SessionKey {
        self.runtime.key()
    }

    /// The implicit receiver for [`call_current`](Self::call_current) and
    /// [`call_method`](Self::call_method).
    pub fn current(&self) -> Option<Obj> {
        self.current
    }

    pub fn set_current(&mut self, obj: Obj) {
        self.current = Some(obj);
    }

    fn require_current(&self) -> Result<Obj> {
        Ok(self.current.ok_or(UsageError::NoCurrentValue)?)
    }

    pub fn global(&mut self, module: &str, name: &str) -> Result<Obj> {
        self.runtime.global(module, name)
    }

    pub fn eval(&mut self, source: &str) -> Result<Obj> {
        self.runtime.eval(source)
    }

    pub fn from_value(&mut self, value: impl Into<Value>) -> Result<Obj> {
        self.runtime.from_value(&value.into())
    }

    pub fn to_value(&mut self, obj: Obj) -> Result<Value> {
        self.runtime.to_value(obj)
    }

    pub fn attr(&mut self, obj: Obj, name: &str) -> Result<Obj> {
        self.runtime.attr(obj, name)
    }

    pub fn set_attr(&mut self, obj: Obj, name: &str, value: Obj) -> Result<()> {
        self.runtime.set_attr(obj, name, value)
    }

    pub fn call(&mut self, callee: Obj, args: &[Obj]) -> Result<Obj> {
        self.runtime.call(callee, args)
    }

    pub fn is_owner(&mut self, obj: Obj) -> Result<bool> {
        self.runtime.is_owner(obj)
    }

    /// Converts the current value to a host value.
    pub fn current_value(&mut self) -> Result<Value> {
        let current = self.require_current()?;
        self.runtime.to_value(current)
    }

    /// Calls the current value.
    pub fn call_current(&mut self, args: &[Obj]) -> Result<Obj> {
        let current = self.require_current()?;
        self.runtime.call(current, args)
    }

    /// Calls the attribute `name` of the current value.
    pub fn call_method(&mut self, name: &str, args: &[Obj]) -> Result<Obj> {
        let current = self.require_current()?;
        let method = self.runtime.attr(current, name)?;
        self.runtime.call(method, args)
    }

    /// Snapshots `obj` into a handle that can be materialized in any
    /// instance of this session's manager.
    ///
    /// # Errors
    ///
    /// - [`UsageError::NoManager`] if the session was opened on a standalone
    ///   instance.
    /// - [`UsageError::ForeignValue`] if `obj` is not owned by this session.
    pub fn create_movable(&mut self, obj: Obj) -> Result<ReplicatedValue<'m>> {
        let manager = self.manager.ok_or(UsageError::NoManager)?;
        if !self.runtime.is_owner(obj)? {
            return Err(UsageError::ForeignValue.into());
        }
        let data = self.runtime.pickle(self.current, obj)?;
        let value = manager.replicate(data);
        tracing::debug!(
            object = %value.id(),
            instance = %self.instance.id(),
            bytes = value.data().len(),
            "created replicated value"
        );
        Ok(value)
    }

    /// Materializes `value` in this session's instance. Repeated
    /// materialization in one instance yields the same runtime object.
    ///
    /// # Errors
    ///
    /// - [`Error::ObjectNotFound`](crate::Error::ObjectNotFound) once the
    ///   value has been unloaded from every instance.
    /// - [`UsageError::ForeignInstance`] if this instance does not belong to
    ///   the value's manager.
    pub fn from_movable(&mut self, value: &ReplicatedValue<'_>) -> Result<Obj> {
        value.ensure_loaded()?;
        if !value.manager().owns(self.instance) {
            return Err(UsageError::ForeignInstance.into());
        }
        let obj = self.runtime.unpickle_or_get(value.id(), value.data())?;
        tracing::debug!(object = %value.id(), instance = %self.instance.id(), "materialized replicated value");
        Ok(obj)
    }
}

impl Drop for Session<'_> {
    fn drop(&mut self) {
        if let (Some(manager), Some(slot)) = (self.manager, self.slot.take()) {
            manager.release_slot(slot);
        }
    }
}

impl std::fmt::Debug for Session<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("instance", &self.instance.id())
            .field("key", &self.runtime.key())
            .field("slot", &self.slot)
            .field("current", &self.current)
            .finish()
    }
}
