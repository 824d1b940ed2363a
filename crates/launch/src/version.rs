//! Backend version numbers and the features they gate.

use std::cmp::Ordering;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::LaunchError;

/// First backend version supporting non-stop mode.
pub const NON_STOP_FIRST_VERSION: &str = "6.8.50";

/// First backend version supporting post-mortem tracing.
pub const POST_MORTEM_TRACING_FIRST_VERSION: &str = "7.2";

/// First backend version with the 7.2 non-stop run control.
pub const RUN_CONTROL_7_2_VERSION: &str = "7.2";

/// A dotted numeric version such as `7.2` or `6.8.50`.
///
/// Missing trailing components compare as zero, so `7.2` equals `7.2.0`.
/// Anything after the numeric prefix (`7.6-ubuntu`) is ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BackendVersion {
    parts: Vec<u32>,
}

impl BackendVersion {
    /// Parses a version string.
    pub fn parse(text: &str) -> Result<Self, LaunchError> {
        let mut parts = Vec::new();
        for component in text.trim().split('.') {
            let digits: String = component.chars().take_while(char::is_ascii_digit).collect();
            if digits.is_empty() {
                break;
            }
            let value = digits
                .parse()
                .map_err(|_| LaunchError::InvalidVersion(text.to_string()))?;
            parts.push(value);
            if digits.len() != component.len() {
                break;
            }
        }

        if parts.is_empty() {
            return Err(LaunchError::InvalidVersion(text.to_string()));
        }
        Ok(Self { parts })
    }

    /// Returns the numeric components.
    pub fn parts(&self) -> &[u32] {
        &self.parts
    }

    /// Returns true if this version is `other` or later.
    pub fn at_least(&self, other: &BackendVersion) -> bool {
        self >= other
    }

    /// Returns true if the backend supports non-stop mode.
    pub fn supports_non_stop(&self) -> bool {
        self.at_least(&known(NON_STOP_FIRST_VERSION))
    }

    /// Returns true if the backend supports post-mortem tracing.
    pub fn supports_post_mortem_tracing(&self) -> bool {
        self.at_least(&known(POST_MORTEM_TRACING_FIRST_VERSION))
    }
}

/// Parses one of the version constants of this module.
pub(crate) fn known(text: &'static str) -> BackendVersion {
    BackendVersion {
        parts: text.split('.').filter_map(|part| part.parse().ok()).collect(),
    }
}

impl Ord for BackendVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.parts.len().max(other.parts.len());
        (0..len)
            .map(|i| {
                let left = self.parts.get(i).copied().unwrap_or(0);
                let right = other.parts.get(i).copied().unwrap_or(0);
                left.cmp(&right)
            })
            .find(|ordering| ordering.is_ne())
            .unwrap_or(Ordering::Equal)
    }
}

impl PartialOrd for BackendVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for BackendVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for BackendVersion {}

impl std::fmt::Display for BackendVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text: Vec<String> = self.parts.iter().map(u32::to_string).collect();
        write!(f, "{}", text.join("."))
    }
}

impl FromStr for BackendVersion {
    type Err = LaunchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for BackendVersion {
    type Error = LaunchError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<BackendVersion> for String {
    fn from(version: BackendVersion) -> Self {
        version.to_string()
    }
}
