//! Configuration loading via `ortho-config` and the runtime settings bag.
//!
//! [`FixtureConfig`] carries layered defaults (files, environment, CLI).
//! [`Config`] is the mutable settings bag threaded through provisioning;
//! the orchestrator writes resolved values (generated password, key path,
//! working-copy root, ownership flags) back into it.

use std::collections::BTreeMap;
use std::time::Duration;

use camino::Utf8PathBuf;
use ortho_config::OrthoConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ownership::Ownership;

/// Image started when none is configured.
pub const DEFAULT_IMAGE: &str = "opalmer/gerrittest:2.14.2";

/// Administrative account created by the image.
pub const DEFAULT_USERNAME: &str = "admin";

/// Remote name wired into the working copy.
pub const DEFAULT_ORIGIN_NAME: &str = "origin";

/// Upper bound for the whole provisioning run.
pub const DEFAULT_TIMEOUT_SECS: u64 = 120;

/// Interval between readiness probes against the HTTP endpoint.
pub const DEFAULT_READINESS_POLL_MS: u64 = 500;

/// Layered defaults loaded from `gerrit-fixture.toml`, `GERRIT_FIXTURE_*`
/// environment variables, and CLI flags.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(prefix = "GERRIT_FIXTURE")]
pub struct FixtureConfig {
    /// Container image providing the review service.
    #[ortho_config(default = DEFAULT_IMAGE.to_owned())]
    pub image: String,
    /// Account used for HTTP login, key installation and the git remote.
    #[ortho_config(default = DEFAULT_USERNAME.to_owned())]
    pub username: String,
    /// Remote name added to the working copy.
    #[ortho_config(default = DEFAULT_ORIGIN_NAME.to_owned())]
    pub origin_name: String,
    /// Local port mapped to the HTTP API; `0` lets the runtime choose.
    #[ortho_config(default = 0)]
    pub port_http: u16,
    /// Local port mapped to the SSH daemon; `0` lets the runtime choose.
    #[ortho_config(default = 0)]
    pub port_ssh: u16,
    /// Deadline for the whole provisioning run, in seconds.
    #[ortho_config(default = DEFAULT_TIMEOUT_SECS)]
    pub timeout_secs: u64,
    /// Interval between HTTP readiness probes, in milliseconds.
    #[ortho_config(default = DEFAULT_READINESS_POLL_MS)]
    pub readiness_poll_ms: u64,
    /// Path to the `docker` executable.
    #[ortho_config(default = "docker".to_owned())]
    pub docker_bin: String,
    /// Path to the `ssh` executable.
    #[ortho_config(default = "ssh".to_owned())]
    pub ssh_bin: String,
    /// Path to the `ssh-keygen` executable.
    #[ortho_config(default = "ssh-keygen".to_owned())]
    pub ssh_keygen_bin: String,
    /// Path to the `git` executable.
    #[ortho_config(default = "git".to_owned())]
    pub git_bin: String,
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(description: &'static str, env_var: &'static str, toml_key: &'static str) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }
}

fn require_field(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::MissingField(format!(
            "missing {}: set {} or add {} to gerrit-fixture.toml",
            metadata.description, metadata.env_var, metadata.toml_key
        )));
    }
    Ok(())
}

impl FixtureConfig {
    /// Loads configuration without attempting to parse CLI arguments. Values
    /// still merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("gerrit-fixture")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation on required fields.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required field is empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_field(
            &self.image,
            &FieldMetadata::new("container image", "GERRIT_FIXTURE_IMAGE", "image"),
        )?;
        require_field(
            &self.origin_name,
            &FieldMetadata::new(
                "origin remote name",
                "GERRIT_FIXTURE_ORIGIN_NAME",
                "origin_name",
            ),
        )?;
        require_field(
            &self.docker_bin,
            &FieldMetadata::new("docker binary", "GERRIT_FIXTURE_DOCKER_BIN", "docker_bin"),
        )?;
        require_field(
            &self.ssh_bin,
            &FieldMetadata::new("ssh binary", "GERRIT_FIXTURE_SSH_BIN", "ssh_bin"),
        )?;
        require_field(
            &self.ssh_keygen_bin,
            &FieldMetadata::new(
                "ssh-keygen binary",
                "GERRIT_FIXTURE_SSH_KEYGEN_BIN",
                "ssh_keygen_bin",
            ),
        )?;
        require_field(
            &self.git_bin,
            &FieldMetadata::new("git binary", "GERRIT_FIXTURE_GIT_BIN", "git_bin"),
        )?;
        if self.timeout_secs == 0 {
            return Err(ConfigError::InvalidTimeout);
        }
        Ok(())
    }

    /// Builds the runtime [`Config`] from the layered defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when validation fails.
    pub fn as_config(&self) -> Result<Config, ConfigError> {
        self.validate()?;
        Ok(Config {
            image: self.image.trim().to_owned(),
            port_http: self.port_http,
            port_ssh: self.port_ssh,
            timeout_secs: self.timeout_secs,
            readiness_poll_ms: self.readiness_poll_ms,
            username: self.username.trim().to_owned(),
            origin_name: self.origin_name.trim().to_owned(),
            tools: Tools {
                docker_bin: self.docker_bin.clone(),
                ssh_bin: self.ssh_bin.clone(),
                ssh_keygen_bin: self.ssh_keygen_bin.clone(),
                git_bin: self.git_bin.clone(),
            },
            ..Config::default()
        })
    }
}

/// External programs the collaborators shell out to.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct Tools {
    /// Path to the `docker` executable.
    pub docker_bin: String,
    /// Path to the `ssh` executable.
    pub ssh_bin: String,
    /// Path to the `ssh-keygen` executable.
    pub ssh_keygen_bin: String,
    /// Path to the `git` executable.
    pub git_bin: String,
}

impl Default for Tools {
    fn default() -> Self {
        Self {
            docker_bin: String::from("docker"),
            ssh_bin: String::from("ssh"),
            ssh_keygen_bin: String::from("ssh-keygen"),
            git_bin: String::from("git"),
        }
    }
}

/// Settings bag for one instance.
///
/// `cleanup` is mutated only by the orchestrator: a flag is set exactly when
/// the orchestrator created the corresponding resource.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct Config {
    /// Container image providing the review service.
    pub image: String,
    /// Requested local HTTP port; `0` means random.
    pub port_http: u16,
    /// Requested local SSH port; `0` means random.
    pub port_ssh: u16,
    /// Deadline for provisioning, in seconds.
    pub timeout_secs: u64,
    /// Interval between HTTP readiness probes, in milliseconds.
    pub readiness_poll_ms: u64,
    /// Account used for login, key installation and the git remote.
    pub username: String,
    /// Account password. When absent the service generates one and the
    /// generated value is written back here.
    pub password: Option<String>,
    /// Project to create on the service.
    pub project: Option<String>,
    /// Private key to authenticate with. When absent a key is generated.
    pub private_key_path: Option<Utf8PathBuf>,
    /// Working-copy root. When absent a temporary directory is allocated.
    pub repo_root: Option<Utf8PathBuf>,
    /// Remote name added to the working copy.
    pub origin_name: String,
    /// Stop after the container is running.
    pub container_only: bool,
    /// Git configuration written into the working copy.
    pub git_config: BTreeMap<String, String>,
    /// Resources the orchestrator created and must destroy.
    pub cleanup: Ownership,
    /// External programs used by the collaborators.
    pub tools: Tools,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            image: DEFAULT_IMAGE.to_owned(),
            port_http: 0,
            port_ssh: 0,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            readiness_poll_ms: DEFAULT_READINESS_POLL_MS,
            username: DEFAULT_USERNAME.to_owned(),
            password: None,
            project: None,
            private_key_path: None,
            repo_root: None,
            origin_name: DEFAULT_ORIGIN_NAME.to_owned(),
            container_only: false,
            git_config: BTreeMap::new(),
            cleanup: Ownership::default(),
            tools: Tools::default(),
        }
    }
}

impl Config {
    /// Provisioning deadline.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Readiness probe interval.
    #[must_use]
    pub const fn readiness_poll_interval(&self) -> Duration {
        Duration::from_millis(self.readiness_poll_ms)
    }

    /// Returns the configured password when one was supplied and is not
    /// blank.
    #[must_use]
    pub fn explicit_password(&self) -> Option<&str> {
        self.password
            .as_deref()
            .filter(|password| !password.is_empty())
    }

    /// Validates fields every stage depends on.
    ///
    /// The username is checked by the account stage, which reports it as a
    /// configuration error before any request is issued.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when a required field is empty or the timeout
    /// is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_field(
            &self.image,
            &FieldMetadata::new("container image", "GERRIT_FIXTURE_IMAGE", "image"),
        )?;
        require_field(
            &self.origin_name,
            &FieldMetadata::new(
                "origin remote name",
                "GERRIT_FIXTURE_ORIGIN_NAME",
                "origin_name",
            ),
        )?;
        if self.timeout_secs == 0 {
            return Err(ConfigError::InvalidTimeout);
        }
        Ok(())
    }

    /// Validates the account username.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when the username is blank.
    pub fn require_username(&self) -> Result<&str, ConfigError> {
        validate_username(&self.username)
    }
}

/// Rejects a blank account username, returning it trimmed.
///
/// # Errors
///
/// Returns [`ConfigError::MissingField`] when `username` is blank.
pub fn validate_username(username: &str) -> Result<&str, ConfigError> {
    require_field(
        username,
        &FieldMetadata::new("username", "GERRIT_FIXTURE_USERNAME", "username"),
    )?;
    Ok(username.trim())
}

/// Errors raised during configuration loading and validation.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Raised when the provisioning deadline is zero.
    #[error("timeout must be greater than zero")]
    InvalidTimeout,
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}
