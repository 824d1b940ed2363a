//! Starting backend processes.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};

use crate::config::LaunchConfiguration;
use crate::error::{LaunchError, Result};

/// Command line of a backend process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendCommand {
    /// Executable to run.
    pub program: PathBuf,
    /// Arguments.
    pub args: Vec<String>,
}

impl BackendCommand {
    /// Builds the backend command line for `config`.
    pub fn for_launch(config: &LaunchConfiguration) -> Self {
        Self {
            program: config.backend_path.clone(),
            args: vec!["--quiet".to_string(), "--nx".to_string()],
        }
    }
}

/// Stops a running process.
pub trait ProcessKiller: Send + Sync {
    /// Requests termination. The exit is reported through the exit notification.
    fn kill(&self);
}

/// Opaque handle on a started backend process.
pub struct ProcessHandle {
    pid: Option<u32>,
    input: mpsc::UnboundedSender<String>,
    killer: Box<dyn ProcessKiller>,
    killed: AtomicBool,
}

impl ProcessHandle {
    /// Creates a handle writing command lines to `input`.
    pub fn new(
        pid: Option<u32>,
        input: mpsc::UnboundedSender<String>,
        killer: impl ProcessKiller + 'static,
    ) -> Self {
        Self {
            pid,
            input,
            killer: Box::new(killer),
            killed: AtomicBool::new(false),
        }
    }

    /// Returns the OS process id, if known.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Sends one command line to the backend.
    pub fn send(&self, command: impl Into<String>) -> Result<()> {
        self.input
            .send(command.into())
            .map_err(|_| LaunchError::Backend("backend input is closed".to_string()))
    }

    /// Kills the process. Returns false if it was already killed.
    pub fn kill(&self) -> bool {
        if self.killed.swap(true, Ordering::AcqRel) {
            return false;
        }
        tracing::info!(pid = ?self.pid, "killing backend process");
        self.killer.kill();
        true
    }

    /// Returns true once [`kill`](Self::kill) was called.
    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.pid)
            .field("killed", &self.is_killed())
            .finish()
    }
}

/// A started process: its handle plus a notification resolving with the
/// exit code once it exits (`None` when killed by a signal).
#[derive(Debug)]
pub struct SpawnedProcess {
    pub handle: ProcessHandle,
    pub exit: oneshot::Receiver<Option<i32>>,
}

/// Starts backend processes.
#[async_trait]
pub trait ProcessSpawner: Send + Sync {
    /// Starts `command`.
    async fn spawn(&self, command: &BackendCommand) -> Result<SpawnedProcess>;
}

struct SignalKiller {
    signal: Mutex<Option<oneshot::Sender<()>>>,
}

impl ProcessKiller for SignalKiller {
    fn kill(&self) {
        let signal = self
            .signal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(signal) = signal {
            let _ = signal.send(());
        }
    }
}

/// Spawns real processes with `tokio::process`.
///
/// Command lines are written to the child's stdin; its stdout and stderr are
/// inherited. Dropping the handle without killing also stops the child.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioProcessSpawner;

#[async_trait]
impl ProcessSpawner for TokioProcessSpawner {
    #[tracing::instrument(skip(self), fields(program = %command.program.display()))]
    async fn spawn(&self, command: &BackendCommand) -> Result<SpawnedProcess> {
        let mut child = tokio::process::Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                LaunchError::Spawn(format!("{}: {err}", command.program.display()))
            })?;
        let pid = child.id();
        tracing::info!(?pid, "backend process started");

        let (input, mut lines) = mpsc::unbounded_channel::<String>();
        if let Some(mut stdin) = child.stdin.take() {
            tokio::spawn(async move {
                while let Some(line) = lines.recv().await {
                    let written = async {
                        stdin.write_all(line.as_bytes()).await?;
                        stdin.write_all(b"\n").await?;
                        stdin.flush().await
                    };
                    if let Err(err) = written.await {
                        tracing::warn!(?pid, %err, "backend input closed");
                        break;
                    }
                }
            });
        }

        let (kill_tx, kill_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = oneshot::channel();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_rx => {
                    if let Err(err) = child.kill().await {
                        tracing::warn!(?pid, %err, "failed to kill backend process");
                    }
                    child.wait().await
                }
            };
            let code = match status {
                Ok(status) => status.code(),
                Err(err) => {
                    tracing::warn!(?pid, %err, "failed to wait for backend process");
                    None
                }
            };
            tracing::info!(?pid, ?code, "backend process exited");
            let _ = exit_tx.send(code);
        });

        let killer = SignalKiller {
            signal: Mutex::new(Some(kill_tx)),
        };
        Ok(SpawnedProcess {
            handle: ProcessHandle::new(pid, input, killer),
            exit: exit_rx,
        })
    }
}

struct InMemoryProcess {
    command: BackendCommand,
    input: mpsc::UnboundedReceiver<String>,
    received: Vec<String>,
    exit: Option<oneshot::Sender<Option<i32>>>,
    killed: bool,
}

#[derive(Default)]
struct InMemorySpawnerState {
    processes: HashMap<u32, InMemoryProcess>,
    next_pid: u32,
    fail_on_spawn: bool,
}

type SharedState = Arc<RwLock<InMemorySpawnerState>>;

fn write(state: &SharedState) -> std::sync::RwLockWriteGuard<'_, InMemorySpawnerState> {
    state.write().unwrap_or_else(PoisonError::into_inner)
}

struct InMemoryKiller {
    pid: u32,
    state: SharedState,
}

impl ProcessKiller for InMemoryKiller {
    fn kill(&self) {
        let mut state = write(&self.state);
        if let Some(process) = state.processes.get_mut(&self.pid) {
            process.killed = true;
            if let Some(exit) = process.exit.take() {
                let _ = exit.send(None);
            }
        }
    }
}

/// In-memory process spawner for testing.
///
/// Processes never run; tests read the command lines they received and
/// decide when they exit.
#[derive(Clone, Default)]
pub struct InMemoryProcessSpawner {
    state: SharedState,
}

impl InMemoryProcessSpawner {
    /// Creates a new in-memory spawner.
    pub fn new() -> Self {
        Self::default()
    }

    /// Configures the spawner to fail on spawn calls.
    pub fn set_fail_on_spawn(&self, fail: bool) {
        write(&self.state).fail_on_spawn = fail;
    }

    /// Returns the number of processes spawned.
    pub fn spawn_count(&self) -> usize {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .processes
            .len()
    }

    /// Returns the pid of the most recently spawned process.
    pub fn last_pid(&self) -> Option<u32> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .processes
            .keys()
            .max()
            .copied()
    }

    /// Returns the command a process was started with.
    pub fn command(&self, pid: u32) -> Option<BackendCommand> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .processes
            .get(&pid)
            .map(|process| process.command.clone())
    }

    /// Returns every command line the process received so far.
    pub fn received(&self, pid: u32) -> Vec<String> {
        let mut state = write(&self.state);
        let Some(process) = state.processes.get_mut(&pid) else {
            return Vec::new();
        };
        while let Ok(line) = process.input.try_recv() {
            process.received.push(line);
        }
        process.received.clone()
    }

    /// Returns true if the process was killed.
    pub fn is_killed(&self, pid: u32) -> bool {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .processes
            .get(&pid)
            .is_some_and(|process| process.killed)
    }

    /// Returns true if the process has neither exited nor been killed.
    pub fn is_running(&self, pid: u32) -> bool {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .processes
            .get(&pid)
            .is_some_and(|process| process.exit.is_some())
    }

    /// Makes the process exit with `code`. Returns false if it already exited.
    pub fn exit(&self, pid: u32, code: i32) -> bool {
        let exit = write(&self.state)
            .processes
            .get_mut(&pid)
            .and_then(|process| process.exit.take());
        match exit {
            Some(exit) => {
                let _ = exit.send(Some(code));
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl ProcessSpawner for InMemoryProcessSpawner {
    async fn spawn(&self, command: &BackendCommand) -> Result<SpawnedProcess> {
        let mut state = write(&self.state);

        if state.fail_on_spawn {
            return Err(LaunchError::Spawn(format!(
                "{}: No such file or directory",
                command.program.display()
            )));
        }

        state.next_pid += 1;
        let pid = 1000 + state.next_pid;
        let (input, lines) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = oneshot::channel();
        state.processes.insert(
            pid,
            InMemoryProcess {
                command: command.clone(),
                input: lines,
                received: Vec::new(),
                exit: Some(exit_tx),
                killed: false,
            },
        );

        let killer = InMemoryKiller {
            pid,
            state: self.state.clone(),
        };
        Ok(SpawnedProcess {
            handle: ProcessHandle::new(Some(pid), input, killer),
            exit: exit_rx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command() -> BackendCommand {
        BackendCommand::for_launch(&LaunchConfiguration::default())
    }

    #[test]
    fn test_command_for_launch() {
        let command = command();
        assert_eq!(command.program, PathBuf::from("gdb"));
        assert!(command.args.contains(&"--nx".to_string()));
    }

    #[tokio::test]
    async fn test_spawn_send_and_exit() {
        let spawner = InMemoryProcessSpawner::new();
        let spawned = spawner.spawn(&command()).await.unwrap();
        let pid = spawned.handle.pid().unwrap();

        spawned.handle.send("file /bin/app").unwrap();
        assert_eq!(spawner.received(pid), vec!["file /bin/app"]);
        assert!(spawner.is_running(pid));

        assert!(spawner.exit(pid, 3));
        assert_eq!(spawned.exit.await.unwrap(), Some(3));
        assert!(!spawner.is_running(pid));
        assert!(!spawner.exit(pid, 4));
    }

    #[tokio::test]
    async fn test_kill_reports_exit() {
        let spawner = InMemoryProcessSpawner::new();
        let spawned = spawner.spawn(&command()).await.unwrap();
        let pid = spawned.handle.pid().unwrap();

        assert!(spawned.handle.kill());
        assert!(!spawned.handle.kill());
        assert!(spawner.is_killed(pid));
        assert_eq!(spawned.exit.await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_fail_on_spawn() {
        let spawner = InMemoryProcessSpawner::new();
        spawner.set_fail_on_spawn(true);

        let result = spawner.spawn(&command()).await;
        assert!(matches!(result, Err(LaunchError::Spawn(_))));
        assert_eq!(spawner.spawn_count(), 0);
    }

    #[tokio::test]
    async fn test_pids_increase() {
        let spawner = InMemoryProcessSpawner::new();
        let first = spawner.spawn(&command()).await.unwrap();
        let second = spawner.spawn(&command()).await.unwrap();

        assert!(second.handle.pid() > first.handle.pid());
        assert_eq!(spawner.last_pid(), second.handle.pid());
        assert_eq!(spawner.command(first.handle.pid().unwrap()), Some(command()));
    }

    #[tokio::test]
    async fn test_tokio_spawner_missing_program() {
        let command = BackendCommand {
            program: PathBuf::from("/definitely/not/a/backend"),
            args: Vec::new(),
        };
        let result = TokioProcessSpawner.spawn(&command).await;
        assert!(matches!(result, Err(LaunchError::Spawn(_))));
    }
}
