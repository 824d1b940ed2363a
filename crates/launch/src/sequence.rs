//! The services launch sequence.

use std::future::Future;
use std::sync::Arc;

use concurrent::{DispatchExecutor, RequestMonitor, Sequence, Step};
use services::{Session, SessionError};

use crate::config::LaunchConfiguration;
use crate::configurator::BackendConfigurator;
use crate::error::{LaunchError, Result};
use crate::factory::ServicesFactory;
use crate::process::{BackendCommand, ProcessSpawner};
use crate::service::{CommandControl, RunControl};

/// Name of the services launch sequence.
pub const SEQUENCE_NAME: &str = "services_launch";

/// Step name: Create the control and run-control services.
pub const STEP_CREATE_SERVICES: &str = "create_services";

/// Step name: Start the backend process.
pub const STEP_START_BACKEND: &str = "start_backend";

/// Step name: Load, attach or connect to the program.
pub const STEP_CONNECT_PROGRAM: &str = "connect_program";

/// Step name: Apply the run-control mode and initialization commands.
pub const STEP_CONFIGURE_BACKEND: &str = "configure_backend";

/// State shared by the steps of one launch.
pub struct LaunchContext {
    pub session: Arc<Session>,
    pub config: Arc<LaunchConfiguration>,
    pub factory: ServicesFactory,
    pub spawner: Arc<dyn ProcessSpawner>,
    pub configurator: Arc<dyn BackendConfigurator>,
}

impl LaunchContext {
    /// Returns the session's command control service.
    pub fn control(&self) -> Result<Arc<CommandControl>> {
        self.session
            .lookup::<CommandControl>()
            .ok_or(LaunchError::ServiceUnavailable("CommandControl"))
    }

    /// Returns the session's run control service.
    pub fn run_control(&self) -> Result<Arc<RunControl>> {
        self.session
            .lookup::<RunControl>()
            .ok_or(LaunchError::ServiceUnavailable("RunControl"))
    }
}

impl std::fmt::Debug for LaunchContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LaunchContext")
            .field("session", &self.session.id())
            .field("config", &self.config)
            .field("factory", &self.factory)
            .finish()
    }
}

/// Builds the sequence creating the services of a launch session.
pub fn services_launch_sequence(context: Arc<LaunchContext>) -> Sequence<LaunchContext> {
    Sequence::new(SEQUENCE_NAME, context)
        .with_step(CreateServices)
        .with_step(StartBackend)
        .with_step(ConnectProgram)
        .with_step(ConfigureBackend)
}

/// Completes `rm` with `result`.
pub(crate) fn finish(rm: RequestMonitor, result: Result<()>) {
    let completed = match result {
        Ok(()) => rm.done(),
        Err(err) => rm.complete_with_error(err.into()),
    };
    if let Err(err) = completed {
        tracing::error!(%err, "request monitor already completed");
    }
}

/// Runs `work` on the executor's runtime, then applies `then` to its output
/// on the executor and completes `rm` with the result.
pub(crate) fn run_on<T, W, F>(executor: &DispatchExecutor, rm: RequestMonitor, work: W, then: F)
where
    T: Send + 'static,
    W: Future<Output = Result<T>> + Send + 'static,
    F: FnOnce(T) -> Result<()> + Send + 'static,
{
    let executor = executor.clone();
    let runtime = executor.runtime().clone();
    runtime.spawn(async move {
        let output = work.await;
        let fallback = rm.clone();
        if let Err(err) = executor.submit(move || finish(rm, output.and_then(then))) {
            tracing::warn!(%err, "session executor gone before step completion");
            finish(fallback, Err(SessionError::Executor(err).into()));
        }
    });
}

struct CreateServices;

impl Step<LaunchContext> for CreateServices {
    fn name(&self) -> &str {
        STEP_CREATE_SERVICES
    }

    fn execute(&self, context: &Arc<LaunchContext>, rm: RequestMonitor) {
        let session = &context.session;
        let id = session.id();
        let result = session
            .register(context.factory.create_command_control(id))
            .and_then(|()| {
                session
                    .register(context.factory.create_run_control(id))
                    .inspect_err(|_| {
                        session.registry().unregister::<CommandControl>(id);
                    })
            })
            .map_err(LaunchError::from);
        finish(rm, result);
    }

    fn rollback(&self, context: &Arc<LaunchContext>, rm: RequestMonitor) {
        let id = context.session.id();
        let registry = context.session.registry();
        registry.unregister::<RunControl>(id);
        registry.unregister::<CommandControl>(id);
        finish(rm, Ok(()));
    }
}

struct StartBackend;

impl Step<LaunchContext> for StartBackend {
    fn name(&self) -> &str {
        STEP_START_BACKEND
    }

    fn execute(&self, context: &Arc<LaunchContext>, rm: RequestMonitor) {
        let command = BackendCommand::for_launch(&context.config);
        let spawner = context.spawner.clone();
        let owner = context.clone();
        run_on(
            context.session.executor(),
            rm,
            async move { spawner.spawn(&command).await },
            move |spawned| {
                let control = match owner.control() {
                    Ok(control) => control,
                    Err(err) => {
                        spawned.handle.kill();
                        return Err(err);
                    }
                };
                control.attach_process(spawned, owner.session.executor());
                Ok(())
            },
        );
    }

    fn rollback(&self, context: &Arc<LaunchContext>, rm: RequestMonitor) {
        if let Ok(control) = context.control() {
            control.terminate();
        }
        finish(rm, Ok(()));
    }
}

struct ConnectProgram;

impl Step<LaunchContext> for ConnectProgram {
    fn name(&self) -> &str {
        STEP_CONNECT_PROGRAM
    }

    fn execute(&self, context: &Arc<LaunchContext>, rm: RequestMonitor) {
        let control = match context.control() {
            Ok(control) => control,
            Err(err) => return finish(rm, Err(err)),
        };
        let configurator = context.configurator.clone();
        let config = context.config.clone();
        run_on(
            context.session.executor(),
            rm,
            async move { configurator.connect(&control, &config).await },
            |()| Ok(()),
        );
    }

    fn rollback(&self, context: &Arc<LaunchContext>, rm: RequestMonitor) {
        let control = match context.control() {
            Ok(control) => control,
            Err(err) => return finish(rm, Err(err)),
        };
        let configurator = context.configurator.clone();
        let config = context.config.clone();
        run_on(
            context.session.executor(),
            rm,
            async move { configurator.disconnect(&control, &config).await },
            |()| Ok(()),
        );
    }
}

struct ConfigureBackend;

impl Step<LaunchContext> for ConfigureBackend {
    fn name(&self) -> &str {
        STEP_CONFIGURE_BACKEND
    }

    fn execute(&self, context: &Arc<LaunchContext>, rm: RequestMonitor) {
        let services = context
            .control()
            .and_then(|control| Ok((control, context.run_control()?)));
        let (control, run_control) = match services {
            Ok(services) => services,
            Err(err) => return finish(rm, Err(err)),
        };
        let configurator = context.configurator.clone();
        let config = context.config.clone();
        run_on(
            context.session.executor(),
            rm,
            async move {
                configurator
                    .configure(&control, &run_control, &config)
                    .await
            },
            |()| Ok(()),
        );
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use common::SessionId;
    use concurrent::{SequenceState, codes};
    use services::{ServiceRegistry, SessionManager};
    use tokio::sync::oneshot;

    use crate::configurator::InMemoryConfigurator;
    use crate::process::InMemoryProcessSpawner;
    use crate::version::BackendVersion;

    use super::*;

    struct Fixture {
        spawner: InMemoryProcessSpawner,
        configurator: InMemoryConfigurator,
        context: Arc<LaunchContext>,
    }

    fn fixture(id: u64) -> Fixture {
        let manager = SessionManager::new(Arc::new(ServiceRegistry::new()));
        let session = manager.start(SessionId::new(id)).unwrap();
        let spawner = InMemoryProcessSpawner::new();
        let configurator = InMemoryConfigurator::new();
        let context = Arc::new(LaunchContext {
            session,
            config: Arc::new(LaunchConfiguration::local("/bin/app")),
            factory: ServicesFactory::new(BackendVersion::parse("7.2").unwrap(), false),
            spawner: Arc::new(spawner.clone()),
            configurator: Arc::new(configurator.clone()),
        });
        Fixture {
            spawner,
            configurator,
            context,
        }
    }

    async fn run(context: &Arc<LaunchContext>) -> RequestMonitor {
        let sequence = services_launch_sequence(context.clone());
        let overall = sequence.submit(context.session.executor()).unwrap();
        let (tx, rx) = oneshot::channel();
        overall
            .set_completion_callback(move |rm| {
                let _ = tx.send(rm);
            })
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .unwrap()
            .unwrap()
    }

    #[test]
    fn test_step_order() {
        let names: Vec<&str> = [
            STEP_CREATE_SERVICES,
            STEP_START_BACKEND,
            STEP_CONNECT_PROGRAM,
            STEP_CONFIGURE_BACKEND,
        ]
        .to_vec();
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let _guard = runtime.enter();
        let fixture = fixture(1);
        let sequence = services_launch_sequence(fixture.context.clone());
        assert_eq!(sequence.step_names(), names);
    }

    #[tokio::test]
    async fn test_sequence_creates_services() {
        let fixture = fixture(2);
        let overall = run(&fixture.context).await;

        assert!(overall.is_success());
        let control = fixture.context.control().unwrap();
        assert!(control.state().is_running());
        assert!(fixture.spawner.is_running(control.pid().unwrap()));
        assert!(fixture.context.run_control().is_ok());
        assert_eq!(fixture.configurator.calls(), vec!["connect", "configure"]);
    }

    #[tokio::test]
    async fn test_spawn_failure_rolls_back_services() {
        let fixture = fixture(3);
        fixture.spawner.set_fail_on_spawn(true);

        let overall = run(&fixture.context).await;

        assert_eq!(overall.error().unwrap().code, codes::REQUEST_FAILED);
        assert!(fixture.context.control().is_err());
        assert!(fixture.context.run_control().is_err());
        assert!(fixture.configurator.calls().is_empty());
    }

    #[tokio::test]
    async fn test_configure_failure_disconnects_and_kills() {
        let fixture = fixture(4);
        fixture.configurator.set_fail_on_configure(true);
        let sequence = services_launch_sequence(fixture.context.clone());
        let observer = sequence.observer();

        let overall = sequence.submit(fixture.context.session.executor()).unwrap();
        let (tx, rx) = oneshot::channel();
        overall
            .set_completion_callback(move |rm| {
                let _ = tx.send(rm.is_success());
            })
            .unwrap();
        assert!(!rx.await.unwrap());

        let pid = fixture.spawner.last_pid().unwrap();
        assert!(fixture.spawner.is_killed(pid));
        assert_eq!(
            fixture.configurator.calls(),
            vec!["connect", "configure", "disconnect"]
        );
        assert_eq!(observer.state(), SequenceState::Failed);
        assert_eq!(
            observer.report().rolled_back,
            vec![STEP_CONNECT_PROGRAM, STEP_START_BACKEND, STEP_CREATE_SERVICES]
        );
        assert!(fixture.context.control().is_err());
    }

    #[tokio::test]
    async fn test_disconnect_failure_is_secondary() {
        let fixture = fixture(5);
        fixture.configurator.set_fail_on_configure(true);
        fixture.configurator.set_fail_on_disconnect(true);
        let sequence = services_launch_sequence(fixture.context.clone());
        let observer = sequence.observer();

        let overall = sequence.submit(fixture.context.session.executor()).unwrap();
        let (tx, rx) = oneshot::channel();
        overall
            .set_completion_callback(move |rm| {
                let _ = tx.send(rm.error());
            })
            .unwrap();

        let cause = rx.await.unwrap().unwrap();
        assert!(cause.message.contains("configure"));
        let report = observer.report();
        assert_eq!(report.rollback_faults.len(), 1);
        assert_eq!(report.rollback_faults[0].step, STEP_CONNECT_PROGRAM);
        assert_eq!(report.rolled_back.len(), 3);
    }
}
