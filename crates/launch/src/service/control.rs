//! Command control service: the session's connection to the backend process.

use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use common::SessionId;
use concurrent::DispatchExecutor;
use serde::Serialize;
use tokio::sync::{oneshot, watch};

use crate::error::{LaunchError, Result};
use crate::process::{ProcessHandle, SpawnedProcess};
use crate::version::BackendVersion;

/// Lifecycle of the backend behind a [`CommandControl`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum ControlState {
    /// The service exists but no backend process is attached.
    #[default]
    Created,
    /// A backend process is running.
    Started,
    /// The backend finished its initialization.
    Initialized,
    /// The backend process exited.
    Terminated { exit_code: Option<i32> },
}

impl ControlState {
    /// Returns true if the backend can accept commands.
    pub fn is_running(&self) -> bool {
        matches!(self, ControlState::Started | ControlState::Initialized)
    }

    /// Returns the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlState::Created => "Created",
            ControlState::Started => "Started",
            ControlState::Initialized => "Initialized",
            ControlState::Terminated { .. } => "Terminated",
        }
    }
}

impl std::fmt::Display for ControlState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Sends commands to the backend process of one session and tracks its
/// lifecycle.
#[derive(Debug)]
pub struct CommandControl {
    session: SessionId,
    version: BackendVersion,
    process: Mutex<Option<Arc<ProcessHandle>>>,
    started_at: Mutex<Option<DateTime<Utc>>>,
    state: watch::Sender<ControlState>,
}

impl CommandControl {
    /// Creates the service without a backend process.
    pub fn new(session: SessionId, version: BackendVersion) -> Self {
        let (state, _) = watch::channel(ControlState::Created);
        Self {
            session,
            version,
            process: Mutex::new(None),
            started_at: Mutex::new(None),
            state,
        }
    }

    /// Returns the owning session.
    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Returns the backend version.
    pub fn backend_version(&self) -> &BackendVersion {
        &self.version
    }

    /// Returns the current state.
    pub fn state(&self) -> ControlState {
        *self.state.borrow()
    }

    /// Subscribes to state changes.
    pub fn subscribe(&self) -> watch::Receiver<ControlState> {
        self.state.subscribe()
    }

    /// Returns true once the backend process exited.
    pub fn is_terminated(&self) -> bool {
        matches!(self.state(), ControlState::Terminated { .. })
    }

    /// Returns when the backend process was started.
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        *self.started_at.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the backend process id.
    pub fn pid(&self) -> Option<u32> {
        self.process_handle().and_then(|process| process.pid())
    }

    fn process_handle(&self) -> Option<Arc<ProcessHandle>> {
        self.process
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Takes ownership of a started backend process.
    ///
    /// The process's exit is observed in the background and reported on
    /// `executor`, where the control then moves to
    /// [`ControlState::Terminated`].
    pub fn attach_process(self: &Arc<Self>, spawned: SpawnedProcess, executor: &DispatchExecutor) {
        let SpawnedProcess { handle, exit } = spawned;
        tracing::info!(session = %self.session, pid = ?handle.pid(), "backend attached to control");
        *self.process.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(handle));
        *self.started_at.lock().unwrap_or_else(PoisonError::into_inner) = Some(Utc::now());
        self.state.send_replace(ControlState::Started);
        self.watch_exit(exit, executor);
    }

    fn watch_exit(self: &Arc<Self>, exit: oneshot::Receiver<Option<i32>>, executor: &DispatchExecutor) {
        let control = Arc::downgrade(self);
        let executor = executor.clone();
        let runtime = executor.runtime().clone();
        runtime.spawn(async move {
            let exit_code = exit.await.unwrap_or(None);
            let Some(control) = control.upgrade() else {
                return;
            };
            let target = control.clone();
            if executor
                .submit(move || target.mark_terminated(exit_code))
                .is_err()
            {
                control.mark_terminated(exit_code);
            }
        });
    }

    /// Records that the backend finished its initialization.
    pub fn mark_initialized(&self) -> Result<()> {
        match self.state() {
            ControlState::Started => {
                self.state.send_replace(ControlState::Initialized);
                Ok(())
            }
            ControlState::Initialized => Ok(()),
            state => Err(LaunchError::Backend(format!(
                "cannot complete initialization of a backend in state {state}"
            ))),
        }
    }

    pub(crate) fn mark_terminated(&self, exit_code: Option<i32>) {
        if self.is_terminated() {
            return;
        }
        tracing::info!(session = %self.session, ?exit_code, "backend terminated");
        self.state
            .send_replace(ControlState::Terminated { exit_code });
    }

    /// Sends one command line to the backend.
    pub fn send(&self, command: impl Into<String>) -> Result<()> {
        let command = command.into();
        if self.is_terminated() {
            return Err(LaunchError::Backend("backend has exited".to_string()));
        }
        let process = self
            .process_handle()
            .ok_or_else(|| LaunchError::Backend("backend is not started".to_string()))?;
        tracing::debug!(session = %self.session, %command, "sending backend command");
        process.send(command)
    }

    /// Kills the backend process. Returns false if there was none to kill.
    pub fn terminate(&self) -> bool {
        self.process_handle()
            .is_some_and(|process| process.kill())
    }
}
