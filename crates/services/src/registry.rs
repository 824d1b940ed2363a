//! Session-scoped lookup of live services.

use std::any::{Any, TypeId, type_name};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use common::SessionId;

use crate::error::RegistryError;

struct Entry {
    capability: &'static str,
    service: Box<dyn Any + Send + Sync>,
}

/// Maps (session id, capability type) to a live service instance.
///
/// The capability is the type a service is registered under, usually a trait
/// object such as `dyn CommandControl`. Each session holds at most one
/// service per capability.
#[derive(Default)]
pub struct ServiceRegistry {
    entries: RwLock<HashMap<SessionId, HashMap<TypeId, Entry>>>,
}

impl ServiceRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the process-wide registry.
    pub fn global() -> &'static Arc<ServiceRegistry> {
        static GLOBAL: OnceLock<Arc<ServiceRegistry>> = OnceLock::new();
        GLOBAL.get_or_init(|| Arc::new(ServiceRegistry::new()))
    }

    /// Registers `service` as the `S` capability of `session`.
    pub fn register<S>(&self, session: SessionId, service: Arc<S>) -> Result<(), RegistryError>
    where
        S: ?Sized + Send + Sync + 'static,
    {
        let capability = type_name::<S>();
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let services = entries.entry(session).or_default();
        if services.contains_key(&TypeId::of::<S>()) {
            return Err(RegistryError::DuplicateCapability {
                session,
                capability,
            });
        }

        services.insert(
            TypeId::of::<S>(),
            Entry {
                capability,
                service: Box::new(service),
            },
        );
        tracing::debug!(%session, capability, "service registered");
        Ok(())
    }

    /// Returns the `S` capability of `session`, if registered.
    pub fn lookup<S>(&self, session: SessionId) -> Option<Arc<S>>
    where
        S: ?Sized + Send + Sync + 'static,
    {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(&session)?
            .get(&TypeId::of::<S>())?
            .service
            .downcast_ref::<Arc<S>>()
            .cloned()
    }

    /// Removes and returns the `S` capability of `session`.
    pub fn unregister<S>(&self, session: SessionId) -> Option<Arc<S>>
    where
        S: ?Sized + Send + Sync + 'static,
    {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let services = entries.get_mut(&session)?;
        let entry = services.remove(&TypeId::of::<S>())?;
        if services.is_empty() {
            entries.remove(&session);
        }
        tracing::debug!(%session, capability = entry.capability, "service unregistered");
        entry.service.downcast::<Arc<S>>().ok().map(|service| *service)
    }

    /// Returns true if `session` has an `S` capability.
    pub fn contains<S>(&self, session: SessionId) -> bool
    where
        S: ?Sized + Send + Sync + 'static,
    {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&session)
            .is_some_and(|services| services.contains_key(&TypeId::of::<S>()))
    }

    /// Returns the capability names registered for `session`.
    pub fn capabilities(&self, session: SessionId) -> Vec<&'static str> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<_> = entries
            .get(&session)
            .map(|services| services.values().map(|entry| entry.capability).collect())
            .unwrap_or_default();
        names.sort_unstable();
        names
    }

    /// Removes every service of `session` and returns how many were removed.
    ///
    /// Services are dropped, not rolled back.
    pub fn tear_down(&self, session: SessionId) -> usize {
        let removed = self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&session);
        let count = removed.as_ref().map_or(0, HashMap::len);
        tracing::debug!(%session, count, "session services torn down");
        count
    }
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("ServiceRegistry")
            .field("sessions", &entries.len())
            .finish()
    }
}
