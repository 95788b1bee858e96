//! Typed configuration for vmvault services.
//!
//! Configuration is loaded from an optional TOML file, then overridden by
//! `VMVAULT_*` environment variables, then validated. Secrets stay inside
//! [`Secret`] so they never land in logs or debug output.

mod error;
mod model;

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use tracing::info;

pub use error::{ConfigError, ConfigResult};
pub use model::{HypervisorConfig, RetrievalConfig, Secret, VmvaultConfig};

/// Environment variable prefix honoured by [`load`].
pub const ENV_PREFIX: &str = "VMVAULT_";

/// Load configuration from an optional TOML file and the process environment.
///
/// Environment variables use the `VMVAULT_` prefix with underscores, e.g.
/// `VMVAULT_SERVER_ADDRESS`, `VMVAULT_USERNAME`, `VMVAULT_PASSWORD`,
/// `VMVAULT_VERIFY_SERVER_CERTIFICATE`.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed, or if the merged
/// configuration fails validation.
pub fn load(path: Option<&Path>) -> ConfigResult<VmvaultConfig> {
    let env: HashMap<String, String> = std::env::vars().collect();
    load_with_env(path, &env)
}

/// Load configuration with an explicit environment map (test seam).
///
/// # Errors
///
/// Same failure modes as [`load`].
pub fn load_with_env(
    path: Option<&Path>,
    env: &HashMap<String, String>,
) -> ConfigResult<VmvaultConfig> {
    let mut config = match path {
        Some(path) => {
            let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            toml::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?
        }
        None => VmvaultConfig::default(),
    };

    apply_env(&mut config, env)?;
    config.validate()?;

    info!(
        server = %config.hypervisor.server_address,
        verify_certificate = config.hypervisor.verify_server_certificate,
        "configuration loaded"
    );
    Ok(config)
}

fn apply_env(config: &mut VmvaultConfig, env: &HashMap<String, String>) -> ConfigResult<()> {
    if let Some(value) = env_value(env, "SERVER_ADDRESS") {
        config.hypervisor.server_address = value;
    }
    if let Some(value) = env_value(env, "USERNAME") {
        config.hypervisor.username = value;
    }
    if let Some(value) = env_value(env, "PASSWORD") {
        config.hypervisor.password = Secret::new(value);
    }
    if let Some(value) = env_value(env, "VERIFY_SERVER_CERTIFICATE") {
        config.hypervisor.verify_server_certificate = parse_bool(&value)
            .ok_or_else(|| ConfigError::invalid_value(
                "verify_server_certificate",
                "expected a boolean",
                value,
            ))?;
    }
    if let Some(value) = env_value(env, "POLL_INTERVAL_SECS") {
        config.retrieval.poll_interval_secs = parse_u64(&value, "poll_interval_secs")?;
    }
    if let Some(value) = env_value(env, "TASK_DEADLINE_SECS") {
        config.retrieval.task_deadline_secs = Some(parse_u64(&value, "task_deadline_secs")?);
    }
    if let Some(value) = env_value(env, "DOWNLOAD_DEADLINE_SECS") {
        config.retrieval.download_deadline_secs =
            Some(parse_u64(&value, "download_deadline_secs")?);
    }
    if let Some(value) = env_value(env, "TEMP_ROOT") {
        config.retrieval.temp_root = Some(value.into());
    }
    Ok(())
}

fn env_value(env: &HashMap<String, String>, key: &str) -> Option<String> {
    env.get(&format!("{ENV_PREFIX}{key}"))
        .filter(|value| !value.trim().is_empty())
        .cloned()
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

fn parse_u64(value: &str, field: &'static str) -> ConfigResult<u64> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::invalid_value(field, "expected an integer", value))
}
