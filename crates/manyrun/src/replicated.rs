//! # Replicated Values
//!
//! A serialized snapshot of a runtime value, identified manager-wide, that
//! can be materialized into any instance of that manager. This is the only
//! way to move a value between instances: they never share the memory the
//! value lives in.
//!
//! ## Lifecycle
//! - Created by [`Session::create_movable`](crate::Session::create_movable).
//! - Materialized any number of times, into any instance. Each instance keeps
//!   at most one object per identifier.
//! - Unloaded from one instance, or from all of them. Unloading from an
//!   instance that holds nothing for the identifier is a no-op. After an
//!   unload from all instances the handle refuses further materialization.
//! - Dropping the last clone unloads from all instances unless that already
//!   happened.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use manyrpc::ObjectId;

use crate::error::Error;
use crate::error::Result;
use crate::error::UsageError;
use crate::instance::Instance;
use crate::manager::InstanceManager;
use crate::session::Session;

struct Replica<'m> {
    id: ObjectId,
    data: Vec<u8>,
    manager: &'m InstanceManager,
    unloaded: AtomicBool,
}

impl Replica<'_> {
    fn unload_from(&self, instance: &Instance) -> Result<()> {
        if !self.manager.owns(instance) {
            return Err(UsageError::ForeignInstance.into());
        }
        let mut session = instance.open_raw()?;
        let removed = session.unload(self.id)?;
        tracing::debug!(object = %self.id, instance = %instance.id(), removed, "unloaded replicated value");
        Ok(())
    }

    fn unload_all(&self) -> Result<()> {
        let mut first = None;
        for instance in self.manager.instances() {
            if let Err(e) = self.unload_from(instance) {
                tracing::warn!(object = %self.id, instance = %instance.id(), error = %e, "unload failed");
                first.get_or_insert(e);
            }
        }
        match first {
            Some(e) => Err(e),
            None => {
                self.unloaded.store(true, Ordering::SeqCst);
                Ok(())
            }
        }
    }
}

impl Drop for Replica<'_> {
    fn drop(&mut self) {
        if self.unloaded.load(Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.unload_all() {
            tracing::error!(object = %self.id, error = %e, "failed to unload dropped replicated value");
        }
    }
}

/// Handle to a replicated value. Clones share one record.
#[derive(Clone)]
pub struct ReplicatedValue<'m> {
    inner: Arc<Replica<'m>>,
}

impl<'m> ReplicatedValue<'m> {
    pub(crate) fn new(id: ObjectId, data: Vec<u8>, manager: &'m InstanceManager) -> Self {
        Self {
            inner: Arc::new(Replica { id, data, manager, unloaded: AtomicBool::new(false) }),
        }
    }

    pub fn id(&self) -> ObjectId {
        self.inner.id
    }

    /// The serialized value, opaque to the host.
    pub fn data(&self) -> &[u8] {
        &self.inner.data
    }

    pub fn manager(&self) -> &'m InstanceManager {
        self.inner.manager
    }

    pub fn is_unloaded(&self) -> bool {
        self.inner.unloaded.load(Ordering::SeqCst)
    }

    pub(crate) fn ensure_loaded(&self) -> Result<()> {
        if self.is_unloaded() {
            return Err(Error::ObjectNotFound(self.inner.id));
        }
        Ok(())
    }

    /// Opens a session on `instance` (or a load-balanced one) with the value
    /// materialized as its current value.
    pub fn acquire_session(&self, instance: Option<&'m Instance>) -> Result<Session<'m>> {
        self.ensure_loaded()?;
        let manager = self.inner.manager;
        let mut session = match instance {
            Some(instance) => manager.acquire_session_on(instance)?,
            None => manager.acquire_session()?,
        };
        let obj = session.from_movable(self)?;
        session.set_current(obj);
        Ok(session)
    }

    /// Drops the value from `instance`, or from every instance of the manager.
    pub fn unload(&self, instance: Option<&Instance>) -> Result<()> {
        match instance {
            Some(instance) => self.inner.unload_from(instance),
            None => self.inner.unload_all(),
        }
    }
}

impl std::fmt::Debug for ReplicatedValue<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicatedValue")
            .field("id", &self.inner.id)
            .field("bytes", &self.inner.data.len())
            .field("unloaded", &self.is_unloaded())
            .finish()
    }
}
