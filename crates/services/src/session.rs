//! Session lifecycle.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock, Weak};

use common::SessionId;
use concurrent::DispatchExecutor;
use tokio::runtime::Handle;

use crate::error::{Result, SessionError};
use crate::registry::ServiceRegistry;

/// Notified after a session has ended.
pub trait SessionEndedListener: Send + Sync {
    /// Called once per ended session, after its services were torn down.
    fn session_ended(&self, session: &Session);
}

#[derive(Default)]
struct Table {
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
    listeners: RwLock<Vec<Arc<dyn SessionEndedListener>>>,
}

/// One launch session: a dispatch executor plus the services it owns.
pub struct Session {
    id: SessionId,
    executor: DispatchExecutor,
    registry: Arc<ServiceRegistry>,
    table: Weak<Table>,
    /// Held across registration and teardown so no service outlives `end`.
    ended: Mutex<bool>,
}

impl Session {
    /// Starts a session in the process-wide manager.
    pub fn start(id: SessionId) -> Result<Arc<Session>> {
        SessionManager::global().start(id)
    }

    /// Returns the session id.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Returns the session's dispatch executor.
    pub fn executor(&self) -> &DispatchExecutor {
        &self.executor
    }

    /// Returns the registry holding this session's services.
    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    /// Registers a service under capability `S`.
    ///
    /// Fails with [`SessionError::Ended`] once [`end`](Self::end) has started,
    /// even when the two race on different threads.
    pub fn register<S>(&self, service: Arc<S>) -> Result<()>
    where
        S: ?Sized + Send + Sync + 'static,
    {
        let ended = self.ended.lock().unwrap_or_else(PoisonError::into_inner);
        if *ended {
            return Err(SessionError::Ended(self.id));
        }
        Ok(self.registry.register(self.id, service)?)
    }

    /// Looks up this session's `S` capability.
    pub fn lookup<S>(&self) -> Option<Arc<S>>
    where
        S: ?Sized + Send + Sync + 'static,
    {
        self.registry.lookup(self.id)
    }

    /// Returns true once [`end`](Self::end) ran.
    pub fn is_ended(&self) -> bool {
        *self.ended.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Ends the session.
    ///
    /// Removes its services from the registry, shuts the executor down (tasks
    /// already queued still run) and notifies the ended listeners. Returns
    /// false if the session had already ended.
    #[tracing::instrument(skip(self), fields(session = %self.id))]
    pub fn end(&self) -> bool {
        let released = {
            let mut ended = self.ended.lock().unwrap_or_else(PoisonError::into_inner);
            if *ended {
                return false;
            }
            *ended = true;
            self.registry.tear_down(self.id)
        };
        self.executor.shutdown();

        let listeners = match self.table.upgrade() {
            Some(table) => {
                table
                    .sessions
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&self.id);
                table
                    .listeners
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone()
            }
            None => Vec::new(),
        };
        tracing::info!(released, "session ended");

        for listener in listeners {
            listener.session_ended(self);
        }
        true
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("executor", &self.executor.name())
            .field("ended", &self.is_ended())
            .finish()
    }
}

/// Table of live sessions, by id.
pub struct SessionManager {
    registry: Arc<ServiceRegistry>,
    table: Arc<Table>,
}

impl SessionManager {
    /// Creates a manager whose sessions register services in `registry`.
    pub fn new(registry: Arc<ServiceRegistry>) -> Self {
        Self {
            registry,
            table: Arc::default(),
        }
    }

    /// Returns the process-wide manager, backed by [`ServiceRegistry::global`].
    pub fn global() -> &'static Arc<SessionManager> {
        static GLOBAL: OnceLock<Arc<SessionManager>> = OnceLock::new();
        GLOBAL.get_or_init(|| Arc::new(SessionManager::new(ServiceRegistry::global().clone())))
    }

    /// Returns the registry shared by this manager's sessions.
    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    /// Starts a session whose executor runs on the current tokio runtime.
    pub fn start(&self, id: SessionId) -> Result<Arc<Session>> {
        let runtime = Handle::try_current().map_err(|_| concurrent::ExecutorError::NoRuntime)?;
        self.start_on(id, &runtime)
    }

    /// Starts a session whose executor runs on `runtime`.
    #[tracing::instrument(skip(self, runtime), fields(session = %id))]
    pub fn start_on(&self, id: SessionId, runtime: &Handle) -> Result<Arc<Session>> {
        let mut sessions = self
            .table
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if sessions.contains_key(&id) {
            return Err(SessionError::AlreadyExists(id));
        }

        let session = Arc::new(Session {
            id,
            executor: DispatchExecutor::with_runtime(id.to_string(), runtime),
            registry: self.registry.clone(),
            table: Arc::downgrade(&self.table),
            ended: Mutex::new(false),
        });
        sessions.insert(id, session.clone());
        tracing::info!("session started");
        Ok(session)
    }

    /// Returns the live session with `id`.
    pub fn get(&self, id: SessionId) -> Option<Arc<Session>> {
        self.table
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    /// Ends the live session with `id`.
    pub fn end(&self, id: SessionId) -> Result<()> {
        let session = self.get(id).ok_or(SessionError::NotFound(id))?;
        session.end();
        Ok(())
    }

    /// Returns the ids of live sessions, in ascending order.
    pub fn active_sessions(&self) -> Vec<SessionId> {
        let mut ids: Vec<_> = self
            .table
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Adds a listener notified whenever a session of this manager ends.
    pub fn add_ended_listener(&self, listener: Arc<dyn SessionEndedListener>) {
        self.table
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("sessions", &self.active_sessions())
            .finish()
    }
}
