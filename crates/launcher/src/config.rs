//! Launcher configuration loaded from environment variables.

use std::path::PathBuf;
use std::time::Duration;

/// Launcher configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `LAUNCH_CONFIG`: path of the JSON launch configuration (default: `"launch.json"`)
/// - `LAUNCH_TIMEOUT_SECS`: limit for each launch phase (default: `30`)
/// - `RUST_LOG`: tracing filter directive (default: `"info"`)
#[derive(Debug, Clone)]
pub struct Config {
    pub launch_config: PathBuf,
    pub launch_timeout: Duration,
    pub log_level: String,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            launch_config: lookup("LAUNCH_CONFIG")
                .map(PathBuf::from)
                .unwrap_or(defaults.launch_config),
            launch_timeout: lookup("LAUNCH_TIMEOUT_SECS")
                .and_then(|secs| secs.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.launch_timeout),
            log_level: lookup("RUST_LOG").unwrap_or(defaults.log_level),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            launch_config: PathBuf::from("launch.json"),
            launch_timeout: Duration::from_secs(30),
            log_level: "info".to_string(),
        }
    }
}
