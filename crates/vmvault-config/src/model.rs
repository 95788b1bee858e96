//! Configuration model with per-field defaults.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};

/// Top-level configuration consumed by vmvault services.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VmvaultConfig {
    /// Hypervisor connection settings.
    #[serde(default)]
    pub hypervisor: HypervisorConfig,
    /// Retrieval and task-monitoring knobs.
    #[serde(default)]
    pub retrieval: RetrievalConfig,
}

impl VmvaultConfig {
    /// Validate the merged configuration.
    ///
    /// # Errors
    ///
    /// Returns the first field that fails validation.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.hypervisor.server_address.trim().is_empty() {
            return Err(ConfigError::invalid("server_address", "cannot be empty"));
        }
        if self.hypervisor.username.trim().is_empty() {
            return Err(ConfigError::invalid("username", "cannot be empty"));
        }
        if self.hypervisor.password.expose().is_empty() {
            return Err(ConfigError::invalid("password", "cannot be empty"));
        }
        if self.retrieval.poll_interval_secs == 0 {
            return Err(ConfigError::invalid(
                "poll_interval_secs",
                "must be at least one second",
            ));
        }
        Ok(())
    }
}

/// Hypervisor management server connection settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HypervisorConfig {
    /// Address (IP or hostname) of the management server.
    #[serde(default)]
    pub server_address: String,
    /// Basic-auth username.
    #[serde(default)]
    pub username: String,
    /// Basic-auth password.
    #[serde(default)]
    pub password: Secret,
    /// Whether to verify the server TLS certificate. Defaults to `false`,
    /// matching the lab appliances this tool is pointed at.
    #[serde(default)]
    pub verify_server_certificate: bool,
}

/// Knobs for the task monitor and retrieval pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetrievalConfig {
    /// Seconds between polls of a remote task.
    #[serde(default = "defaults::poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Optional overall deadline for a remote task, in seconds.
    #[serde(default)]
    pub task_deadline_secs: Option<u64>,
    /// Optional overall deadline for a single download, in seconds.
    #[serde(default)]
    pub download_deadline_secs: Option<u64>,
    /// Directory under which per-run temp directories are created.
    /// Defaults to the system temp directory.
    #[serde(default)]
    pub temp_root: Option<PathBuf>,
}

impl RetrievalConfig {
    /// Poll interval as a [`Duration`].
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Task deadline as a [`Duration`], when configured.
    #[must_use]
    pub fn task_deadline(&self) -> Option<Duration> {
        self.task_deadline_secs.map(Duration::from_secs)
    }

    /// Download deadline as a [`Duration`], when configured.
    #[must_use]
    pub fn download_deadline(&self) -> Option<Duration> {
        self.download_deadline_secs.map(Duration::from_secs)
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: defaults::poll_interval_secs(),
            task_deadline_secs: None,
            download_deadline_secs: None,
            temp_root: None,
        }
    }
}

mod defaults {
    pub(super) const fn poll_interval_secs() -> u64 {
        2
    }
}

/// Wrapper keeping secret values out of logs and debug output.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    /// Wrap a secret value.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Access the underlying value.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str("Secret(****)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_poll_every_two_seconds() {
        let config = RetrievalConfig::default();
        assert_eq!(config.poll_interval(), Duration::from_secs(2));
        assert!(config.task_deadline().is_none());
        assert!(config.download_deadline().is_none());
    }

    #[test]
    fn validation_accepts_complete_config() {
        let config = VmvaultConfig {
            hypervisor: HypervisorConfig {
                server_address: "esx.example".into(),
                username: "root".into(),
                password: Secret::new("secret"),
                verify_server_certificate: true,
            },
            retrieval: RetrievalConfig::default(),
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_poll_interval_is_rejected() {
        let mut config = VmvaultConfig {
            hypervisor: HypervisorConfig {
                server_address: "esx.example".into(),
                username: "root".into(),
                password: Secret::new("secret"),
                verify_server_certificate: false,
            },
            retrieval: RetrievalConfig::default(),
        };
        config.retrieval.poll_interval_secs = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                field: "poll_interval_secs",
                ..
            })
        ));
    }
}
