//! Launch delegate: validates a configuration and brings a session up.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use common::{SessionId, SessionIdGenerator};
use concurrent::{Query, QueryError, RequestMonitor, SequenceReport};
use services::{Session, SessionManager};
use tokio::runtime::Handle;

use crate::config::LaunchConfiguration;
use crate::configurator::BackendConfigurator;
use crate::error::{LaunchError, Result};
use crate::factory::{RunControlFlavor, ServicesFactory};
use crate::process::ProcessSpawner;
use crate::sequence::{LaunchContext, finish, run_on, services_launch_sequence};
use crate::service::{CommandControl, ControlState, RunControl};
use crate::version::{NON_STOP_FIRST_VERSION, POST_MORTEM_TRACING_FIRST_VERSION, known};

/// Phase name: the services launch sequence.
pub const PHASE_SERVICES: &str = "services_launch";

/// Phase name: completing the backend initialization.
pub const PHASE_COMPLETE_INITIALIZATION: &str = "complete_initialization";

#[derive(Default)]
struct CancelState {
    cancelled: bool,
    monitors: Vec<RequestMonitor>,
}

/// Lets another thread cancel a launch in progress.
///
/// Cancelling marks the monitor of the running phase canceled, which stops
/// the services launch sequence at its next step boundary and rolls it back.
#[derive(Clone, Default)]
pub struct LaunchCancellation {
    state: Arc<Mutex<CancelState>>,
}

impl LaunchCancellation {
    /// Creates a cancellation handle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancels the launch.
    pub fn cancel(&self) {
        let monitors = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.cancelled = true;
            std::mem::take(&mut state.monitors)
        };
        for monitor in monitors {
            monitor.cancel();
        }
    }

    /// Returns true once [`cancel`](Self::cancel) was called.
    pub fn is_cancelled(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cancelled
    }

    fn track(&self, monitor: &RequestMonitor) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.cancelled {
            drop(state);
            monitor.cancel();
        } else {
            state.monitors.push(monitor.clone());
        }
    }
}

impl std::fmt::Debug for LaunchCancellation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LaunchCancellation")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Kills the backend and ends the session.
fn cleanup(session: &Session) -> bool {
    if let Some(control) = session.lookup::<CommandControl>() {
        control.terminate();
    }
    session.end()
}

/// A running launch session.
#[derive(Debug)]
pub struct Launch {
    session: Arc<Session>,
    config: Arc<LaunchConfiguration>,
    flavor: RunControlFlavor,
    started_at: DateTime<Utc>,
    report: SequenceReport,
}

impl Launch {
    /// Returns the session.
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Returns the session id.
    pub fn session_id(&self) -> SessionId {
        self.session.id()
    }

    /// Returns the configuration the session was launched with.
    pub fn config(&self) -> &LaunchConfiguration {
        &self.config
    }

    /// Returns the run-control flavor.
    pub fn flavor(&self) -> RunControlFlavor {
        self.flavor
    }

    /// Returns when the launch started.
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Returns what the services launch sequence did.
    pub fn services_report(&self) -> &SequenceReport {
        &self.report
    }

    /// Returns the command control service, while the session is live.
    pub fn control(&self) -> Option<Arc<CommandControl>> {
        self.session.lookup()
    }

    /// Returns the run control service, while the session is live.
    pub fn run_control(&self) -> Option<Arc<RunControl>> {
        self.session.lookup()
    }

    /// Waits until the backend process exits and returns its exit code.
    pub async fn wait_for_exit(&self) -> Option<i32> {
        let control = self.control()?;
        let mut states = control.subscribe();
        let state = states
            .wait_for(|state| matches!(state, ControlState::Terminated { .. }))
            .await
            .ok()
            .map(|state| *state)?;
        match state {
            ControlState::Terminated { exit_code } => exit_code,
            _ => None,
        }
    }

    /// Kills the backend and ends the session. Returns false if the session
    /// had already ended.
    #[tracing::instrument(skip(self), fields(session = %self.session.id()))]
    pub fn shutdown(&self) -> bool {
        cleanup(&self.session)
    }
}

/// Launches debug sessions.
///
/// [`launch`](Self::launch) blocks the calling thread while the session's
/// executor brings the backend up, so call it from a blocking context such as
/// `tokio::task::spawn_blocking`, never from inside a session executor.
pub struct LaunchDelegate {
    runtime: Handle,
    sessions: Arc<SessionManager>,
    spawner: Arc<dyn ProcessSpawner>,
    configurator: Arc<dyn BackendConfigurator>,
    timeout: Option<Duration>,
}

impl LaunchDelegate {
    /// Creates a delegate whose sessions run on `runtime` and are kept in the
    /// process-wide session table.
    pub fn new(
        runtime: Handle,
        spawner: Arc<dyn ProcessSpawner>,
        configurator: Arc<dyn BackendConfigurator>,
    ) -> Self {
        Self {
            runtime,
            sessions: SessionManager::global().clone(),
            spawner,
            configurator,
            timeout: None,
        }
    }

    /// Keeps sessions in `sessions` instead of the process-wide table.
    pub fn with_sessions(mut self, sessions: Arc<SessionManager>) -> Self {
        self.sessions = sessions;
        self
    }

    /// Bounds how long each launch phase may take.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Returns the session table.
    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Launches a session for `config`.
    ///
    /// On any failure after the session was created, the session is cleaned
    /// up before the error is returned.
    #[tracing::instrument(
        skip(self, config, cancellation),
        fields(session_type = %config.session_type, attach = config.attach)
    )]
    pub fn launch(
        &self,
        config: LaunchConfiguration,
        cancellation: &LaunchCancellation,
    ) -> Result<Launch> {
        metrics::counter!("launch_attempts_total").increment(1);
        let result = self.launch_session(config, cancellation);
        match &result {
            Ok(launch) => {
                tracing::info!(session = %launch.session_id(), flavor = %launch.flavor(), "launch completed");
            }
            Err(LaunchError::Cancelled) => tracing::info!("launch cancelled"),
            Err(err) => {
                metrics::counter!("launch_failures_total").increment(1);
                tracing::warn!(%err, "launch failed");
            }
        }
        result
    }

    fn launch_session(
        &self,
        config: LaunchConfiguration,
        cancellation: &LaunchCancellation,
    ) -> Result<Launch> {
        if cancellation.is_cancelled() {
            return Err(LaunchError::Cancelled);
        }

        config.validate()?;
        if !config.attach {
            config.check_binary()?;
        }

        let version = config.version()?;
        if config.non_stop && !version.supports_non_stop() {
            return Err(LaunchError::NonStopNotSupported {
                version,
                required: known(NON_STOP_FIRST_VERSION),
            });
        }
        if config.post_mortem_tracing && !version.supports_post_mortem_tracing() {
            return Err(LaunchError::PostMortemTracingNotSupported {
                version,
                required: known(POST_MORTEM_TRACING_FIRST_VERSION),
            });
        }

        let factory = ServicesFactory::new(version, config.non_stop);
        let flavor = factory.run_control_flavor();
        let started_at = Utc::now();
        let session = self
            .sessions
            .start_on(SessionIdGenerator::global().next_id(), &self.runtime)?;
        tracing::info!(session = %session.id(), %flavor, "session created");

        let context = Arc::new(LaunchContext {
            session: session.clone(),
            config: Arc::new(config),
            factory,
            spawner: self.spawner.clone(),
            configurator: self.configurator.clone(),
        });

        let sequence = services_launch_sequence(context.clone());
        let observer = sequence.observer();
        let services = self.await_phase(&session, cancellation, move |rm| {
            let submitted = sequence.with_parent(&rm).submit(rm.executor());
            let overall = match submitted {
                Ok(overall) => overall,
                Err(err) => return finish(rm, Err(services::SessionError::from(err).into())),
            };
            let relay = rm.clone();
            let installed = overall.set_completion_callback(move |overall| {
                let completed = match overall.error() {
                    None => relay.done(),
                    Some(cause) => relay.complete_with_error(cause),
                };
                if let Err(err) = completed {
                    tracing::error!(%err, "services launch result already reported");
                }
            });
            if let Err(err) = installed {
                tracing::error!(%err, "could not observe the services launch sequence");
            }
        });
        if let Err(err) = services {
            cleanup(&session);
            return Err(phase_error(PHASE_SERVICES, err));
        }

        if cancellation.is_cancelled() {
            cleanup(&session);
            return Err(LaunchError::Cancelled);
        }

        let completing = context.clone();
        let initialized = self.await_phase(&session, cancellation, move |rm| {
            complete_initialization(&completing, rm);
        });
        if let Err(err) = initialized {
            cleanup(&session);
            return Err(phase_error(PHASE_COMPLETE_INITIALIZATION, err));
        }

        Ok(Launch {
            session,
            config: context.config.clone(),
            flavor,
            started_at,
            report: observer.report(),
        })
    }

    /// Runs `operation` on the session executor and blocks until it completes.
    fn await_phase<F>(
        &self,
        session: &Session,
        cancellation: &LaunchCancellation,
        operation: F,
    ) -> std::result::Result<(), QueryError>
    where
        F: FnOnce(RequestMonitor) + Send + 'static,
    {
        let mut query = Query::new(session.executor(), operation);
        if let Some(timeout) = self.timeout {
            query = query.with_timeout(timeout);
        }
        let monitor = query.monitor().clone();
        cancellation.track(&monitor);

        let result = query.run();
        if matches!(result, Err(QueryError::Timeout(_))) {
            monitor.cancel();
        }
        result
    }
}

impl std::fmt::Debug for LaunchDelegate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LaunchDelegate")
            .field("sessions", &self.sessions)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Starts or resumes the program once the services launch sequence is done.
fn complete_initialization(context: &Arc<LaunchContext>, rm: RequestMonitor) {
    let control = match context.control() {
        Ok(control) => control,
        Err(err) => return finish(rm, Err(err)),
    };
    if control.is_terminated() {
        return finish(
            rm,
            Err(LaunchError::Backend(
                "backend exited before initialization completed".to_string(),
            )),
        );
    }
    if rm.is_canceled() {
        if let Err(err) = rm.complete_cancelled() {
            tracing::error!(%err, "request monitor already completed");
        }
        return;
    }

    let configurator = context.configurator.clone();
    let config = context.config.clone();
    let initialized = control.clone();
    run_on(
        context.session.executor(),
        rm,
        async move { configurator.complete_initialization(&control, &config).await },
        move |()| initialized.mark_initialized(),
    );
}

fn phase_error(phase: &'static str, err: QueryError) -> LaunchError {
    match err {
        QueryError::Cancelled(_) => LaunchError::Cancelled,
        QueryError::Interrupted => LaunchError::Interrupted,
        QueryError::Timeout(after) => LaunchError::Timeout { phase, after },
        QueryError::Failed(cause) if phase == PHASE_SERVICES => LaunchError::ServicesSequence(cause),
        QueryError::Failed(cause) => LaunchError::CompleteInitialization(cause),
        other => LaunchError::Query(other),
    }
}
