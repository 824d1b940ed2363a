//! Bringing a started backend to the program being debugged.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;

use crate::config::{LaunchConfiguration, SessionType};
use crate::error::{LaunchError, Result};
use crate::service::{CommandControl, RunControl};

/// Drives the backend through a launch.
#[async_trait]
pub trait BackendConfigurator: Send + Sync {
    /// Loads, attaches or connects to the program.
    async fn connect(&self, control: &CommandControl, config: &LaunchConfiguration) -> Result<()>;

    /// Undoes [`connect`](Self::connect).
    async fn disconnect(&self, control: &CommandControl, config: &LaunchConfiguration)
    -> Result<()>;

    /// Applies the run-control mode and the user's initialization commands.
    async fn configure(
        &self,
        control: &CommandControl,
        run_control: &RunControl,
        config: &LaunchConfiguration,
    ) -> Result<()>;

    /// Starts or resumes the program once every service is ready.
    async fn complete_initialization(
        &self,
        control: &CommandControl,
        config: &LaunchConfiguration,
    ) -> Result<()>;
}

/// Configures the backend by sending it CLI command lines.
#[derive(Debug, Clone, Copy, Default)]
pub struct CliConfigurator;

impl CliConfigurator {
    /// Commands that bring the backend to the program.
    pub fn connect_commands(config: &LaunchConfiguration) -> Vec<String> {
        let mut commands = Vec::new();
        if let Some(program) = &config.program {
            commands.push(format!("file {}", program.display()));
        }
        if !config.attach && !config.program_args.is_empty() {
            commands.push(format!("set args {}", config.program_args.join(" ")));
        }

        match config.session_type {
            SessionType::Remote => {
                let target = config.remote_target.as_deref().unwrap_or_default();
                if config.attach {
                    commands.push(format!("target extended-remote {target}"));
                } else {
                    commands.push(format!("target remote {target}"));
                }
            }
            SessionType::Core => {
                if let Some(core) = &config.core_file {
                    commands.push(format!("core-file {}", core.display()));
                }
            }
            SessionType::Local => {}
        }

        if let (true, Some(pid)) = (config.attach, config.process_id) {
            commands.push(format!("attach {pid}"));
        }
        commands
    }

    /// Commands that undo [`connect_commands`](Self::connect_commands).
    pub fn disconnect_commands(config: &LaunchConfiguration) -> Vec<String> {
        match (config.session_type, config.attach) {
            (SessionType::Core, _) => Vec::new(),
            (_, true) => vec!["detach".to_string()],
            (_, false) => vec!["kill".to_string()],
        }
    }

    /// Commands applying the run-control mode and the initialization commands.
    pub fn configure_commands(run_control: &RunControl, config: &LaunchConfiguration) -> Vec<String> {
        run_control
            .mode_command()
            .map(str::to_string)
            .into_iter()
            .chain(config.init_commands.iter().cloned())
            .collect()
    }

    /// Commands that start or resume the program.
    pub fn complete_initialization_commands(config: &LaunchConfiguration) -> Vec<String> {
        match (config.session_type, config.attach) {
            (SessionType::Core, _) | (_, true) => Vec::new(),
            (SessionType::Local, false) => vec!["run".to_string()],
            (SessionType::Remote, false) => vec!["continue".to_string()],
        }
    }

    fn send_all(control: &CommandControl, commands: Vec<String>) -> Result<()> {
        commands
            .into_iter()
            .try_for_each(|command| control.send(command))
    }
}

#[async_trait]
impl BackendConfigurator for CliConfigurator {
    async fn connect(&self, control: &CommandControl, config: &LaunchConfiguration) -> Result<()> {
        Self::send_all(control, Self::connect_commands(config))
    }

    async fn disconnect(
        &self,
        control: &CommandControl,
        config: &LaunchConfiguration,
    ) -> Result<()> {
        Self::send_all(control, Self::disconnect_commands(config))
    }

    async fn configure(
        &self,
        control: &CommandControl,
        run_control: &RunControl,
        config: &LaunchConfiguration,
    ) -> Result<()> {
        Self::send_all(control, Self::configure_commands(run_control, config))
    }

    async fn complete_initialization(
        &self,
        control: &CommandControl,
        config: &LaunchConfiguration,
    ) -> Result<()> {
        Self::send_all(control, Self::complete_initialization_commands(config))
    }
}

#[derive(Debug, Default)]
struct InMemoryConfiguratorState {
    calls: Vec<&'static str>,
    fail_on_connect: bool,
    fail_on_disconnect: bool,
    fail_on_configure: bool,
    fail_on_complete: bool,
    delay: Option<Duration>,
}

/// In-memory configurator for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryConfigurator {
    state: Arc<RwLock<InMemoryConfiguratorState>>,
}

impl InMemoryConfigurator {
    /// Creates a new in-memory configurator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Configures the configurator to fail on connect calls.
    pub fn set_fail_on_connect(&self, fail: bool) {
        self.write().fail_on_connect = fail;
    }

    /// Configures the configurator to fail on disconnect calls.
    pub fn set_fail_on_disconnect(&self, fail: bool) {
        self.write().fail_on_disconnect = fail;
    }

    /// Configures the configurator to fail on configure calls.
    pub fn set_fail_on_configure(&self, fail: bool) {
        self.write().fail_on_configure = fail;
    }

    /// Configures the configurator to fail on complete-initialization calls.
    pub fn set_fail_on_complete(&self, fail: bool) {
        self.write().fail_on_complete = fail;
    }

    /// Makes every call wait for `delay` first.
    pub fn set_delay(&self, delay: Option<Duration>) {
        self.write().delay = delay;
    }

    /// Returns the calls received so far, in order.
    pub fn calls(&self) -> Vec<&'static str> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .calls
            .clone()
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, InMemoryConfiguratorState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    async fn call(&self, name: &'static str, fail: fn(&InMemoryConfiguratorState) -> bool) -> Result<()> {
        let delay = self.write().delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.write();
        state.calls.push(name);
        if fail(&state) {
            return Err(LaunchError::Backend(format!("{name} rejected by backend")));
        }
        Ok(())
    }
}

#[async_trait]
impl BackendConfigurator for InMemoryConfigurator {
    async fn connect(&self, _control: &CommandControl, _config: &LaunchConfiguration) -> Result<()> {
        self.call("connect", |state| state.fail_on_connect).await
    }

    async fn disconnect(
        &self,
        _control: &CommandControl,
        _config: &LaunchConfiguration,
    ) -> Result<()> {
        self.call("disconnect", |state| state.fail_on_disconnect)
            .await
    }

    async fn configure(
        &self,
        _control: &CommandControl,
        _run_control: &RunControl,
        _config: &LaunchConfiguration,
    ) -> Result<()> {
        self.call("configure", |state| state.fail_on_configure)
            .await
    }

    async fn complete_initialization(
        &self,
        _control: &CommandControl,
        _config: &LaunchConfiguration,
    ) -> Result<()> {
        self.call("complete_initialization", |state| state.fail_on_complete)
            .await
    }
}
