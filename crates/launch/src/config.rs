//! Launch configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{LaunchError, Result};
use crate::version::BackendVersion;

/// How the backend reaches the program being debugged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionType {
    /// A program on this machine, started or attached to by the backend.
    #[default]
    Local,
    /// A program behind a remote debug target.
    Remote,
    /// A core dump.
    Core,
}

impl SessionType {
    /// Returns the string representation used in configuration files.
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionType::Local => "local",
            SessionType::Remote => "remote",
            SessionType::Core => "core",
        }
    }
}

impl std::fmt::Display for SessionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

fn default_backend_path() -> PathBuf {
    PathBuf::from("gdb")
}

fn default_backend_version() -> String {
    "7.2".to_string()
}

/// Everything a launch needs to know, usually read from a JSON file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LaunchConfiguration {
    /// How the program is reached.
    pub session_type: SessionType,
    /// Attach to a running process instead of starting the program.
    pub attach: bool,
    /// The program binary.
    pub program: Option<PathBuf>,
    /// Arguments passed to the program when the backend starts it.
    pub program_args: Vec<String>,
    /// Process to attach to.
    pub process_id: Option<u32>,
    /// Remote target, such as `localhost:2345`.
    pub remote_target: Option<String>,
    /// Core dump to open.
    pub core_file: Option<PathBuf>,
    /// Backend executable.
    #[serde(default = "default_backend_path")]
    pub backend_path: PathBuf,
    /// Version reported by the backend.
    #[serde(default = "default_backend_version")]
    pub backend_version: String,
    /// Run the backend in non-stop mode.
    pub non_stop: bool,
    /// Open a trace file for post-mortem tracing.
    pub post_mortem_tracing: bool,
    /// Commands run after the program is loaded.
    pub init_commands: Vec<String>,
}

impl Default for LaunchConfiguration {
    fn default() -> Self {
        Self {
            session_type: SessionType::Local,
            attach: false,
            program: None,
            program_args: Vec::new(),
            process_id: None,
            remote_target: None,
            core_file: None,
            backend_path: default_backend_path(),
            backend_version: default_backend_version(),
            non_stop: false,
            post_mortem_tracing: false,
            init_commands: Vec::new(),
        }
    }
}

impl LaunchConfiguration {
    /// Configuration for starting `program` locally.
    pub fn local(program: impl Into<PathBuf>) -> Self {
        Self {
            program: Some(program.into()),
            ..Self::default()
        }
    }

    /// Configuration for attaching to a local process.
    pub fn attach(process_id: u32) -> Self {
        Self {
            attach: true,
            process_id: Some(process_id),
            ..Self::default()
        }
    }

    /// Configuration for debugging through a remote target.
    pub fn remote(program: impl Into<PathBuf>, target: impl Into<String>) -> Self {
        Self {
            session_type: SessionType::Remote,
            program: Some(program.into()),
            remote_target: Some(target.into()),
            ..Self::default()
        }
    }

    /// Sets the backend version.
    pub fn with_backend_version(mut self, version: impl Into<String>) -> Self {
        self.backend_version = version.into();
        self
    }

    /// Enables or disables non-stop mode.
    pub fn with_non_stop(mut self, non_stop: bool) -> Self {
        self.non_stop = non_stop;
        self
    }

    /// Adds a command run once the program is loaded.
    pub fn with_init_command(mut self, command: impl Into<String>) -> Self {
        self.init_commands.push(command.into());
        self
    }

    /// Parses a configuration from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Reads a configuration from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Parses [`backend_version`](Self::backend_version).
    pub fn version(&self) -> Result<BackendVersion> {
        BackendVersion::parse(&self.backend_version)
    }

    /// Checks the fields each session type needs.
    pub fn validate(&self) -> Result<()> {
        match self.session_type {
            SessionType::Remote if self.remote_target.is_none() => Err(
                LaunchError::InvalidConfiguration("remote session without a target".to_string()),
            ),
            SessionType::Core if self.core_file.is_none() => Err(
                LaunchError::InvalidConfiguration("core session without a core file".to_string()),
            ),
            SessionType::Core if self.attach => Err(LaunchError::InvalidConfiguration(
                "core sessions cannot attach".to_string(),
            )),
            _ => Ok(()),
        }
    }

    /// Checks that the program binary exists.
    ///
    /// Attach sessions skip this check since the backend can find the
    /// executable of the process on its own.
    pub fn check_binary(&self) -> Result<()> {
        let program = self
            .program
            .as_ref()
            .ok_or(LaunchError::ProgramNotSpecified)?;
        if !program.is_file() {
            return Err(LaunchError::ProgramNotFound(program.clone()));
        }
        Ok(())
    }
}
