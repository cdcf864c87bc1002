//! The instance aggregate: everything one provisioned review service owns,
//! and the idempotent teardown that walks the ownership record.

mod orchestrator;

use std::fmt;
use std::sync::Arc;

use camino::Utf8Path;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{Span, debug, warn};

use crate::account::HttpSession;
use crate::command::SharedRunner;
use crate::config::Config;
use crate::container::{ContainerDriver, ContainerHandle};
use crate::descriptor::{Descriptor, DescriptorError};
use crate::files;
use crate::keys::{self, KeyMaterial};
use crate::ownership::Resource;
use crate::ssh::SshSession;
use crate::working_copy::WorkingCopy;

pub use orchestrator::{Orchestrator, ProvisionError, ProvisionFailure};

/// How far provisioning got.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Nothing has been provisioned.
    #[default]
    Uninitialized,
    /// Key material is available.
    KeyReady,
    /// The container is running and its ports are known.
    ContainerReady,
    /// Provisioning stopped after the container on request.
    ContainerOnly,
    /// The account is logged in, keyed and has a password.
    AccountReady,
    /// The SSH session is open.
    SessionReady,
    /// The working copy is prepared. Provisioning is complete.
    WorkingCopyReady,
}

impl Stage {
    /// Stable identifier used in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::KeyReady => "key_ready",
            Self::ContainerReady => "container_ready",
            Self::ContainerOnly => "container_only",
            Self::AccountReady => "account_ready",
            Self::SessionReady => "session_ready",
            Self::WorkingCopyReady => "working_copy_ready",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Account the instance is logged in as.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct AccountIdentity {
    /// Login name.
    pub username: String,
}

/// A single resource that could not be torn down.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TeardownFailure {
    /// Resource being removed.
    pub resource: Resource,
    /// Failure detail.
    pub message: String,
}

/// Every teardown failure of one [`Instance::destroy`] call.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("teardown failed: {}", render_failures(.failures))]
pub struct TeardownError {
    /// Individual failures in teardown order.
    pub failures: Vec<TeardownFailure>,
}

fn render_failures(failures: &[TeardownFailure]) -> String {
    failures
        .iter()
        .map(|failure| format!("{}: {}", failure.resource, failure.message))
        .collect::<Vec<_>>()
        .join("; ")
}

/// A provisioned (or partially provisioned) review service.
pub struct Instance {
    pub(crate) config: Config,
    pub(crate) stage: Stage,
    pub(crate) keys: Option<KeyMaterial>,
    pub(crate) container: Option<ContainerHandle>,
    pub(crate) container_id: Option<String>,
    pub(crate) http: Option<HttpSession>,
    pub(crate) ssh: Option<SshSession>,
    pub(crate) repo: Option<WorkingCopy>,
    pub(crate) account: Option<AccountIdentity>,
    driver: Arc<dyn ContainerDriver>,
    runner: SharedRunner,
    span: Span,
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("stage", &self.stage)
            .field("container", &self.container)
            .field("container_id", &self.container_id)
            .field("account", &self.account)
            .field("ssh", &self.ssh)
            .field("repo", &self.repo)
            .finish_non_exhaustive()
    }
}

impl Instance {
    pub(crate) fn new(
        config: Config,
        driver: Arc<dyn ContainerDriver>,
        runner: SharedRunner,
        span: Span,
    ) -> Self {
        Self {
            config,
            stage: Stage::Uninitialized,
            keys: None,
            container: None,
            container_id: None,
            http: None,
            ssh: None,
            repo: None,
            account: None,
            driver,
            runner,
            span,
        }
    }

    /// Settings, including values resolved during provisioning.
    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Last stage reached.
    #[must_use]
    pub const fn stage(&self) -> Stage {
        self.stage
    }

    /// Resolved key material.
    #[must_use]
    pub const fn keys(&self) -> Option<&KeyMaterial> {
        self.keys.as_ref()
    }

    /// Running container and its endpoints.
    #[must_use]
    pub const fn container(&self) -> Option<&ContainerHandle> {
        self.container.as_ref()
    }

    /// Identifier (or, before the runtime has answered, the name) of the
    /// container this instance started, even when its ports were never
    /// resolved.
    #[must_use]
    pub fn container_id(&self) -> Option<&str> {
        self.container
            .as_ref()
            .map(|handle| handle.id.as_str())
            .or(self.container_id.as_deref())
    }

    /// Logged-in HTTP session.
    #[must_use]
    pub const fn http(&self) -> Option<&HttpSession> {
        self.http.as_ref()
    }

    /// Open SSH session.
    #[must_use]
    pub const fn ssh(&self) -> Option<&SshSession> {
        self.ssh.as_ref()
    }

    /// Prepared working copy.
    #[must_use]
    pub const fn working_copy(&self) -> Option<&WorkingCopy> {
        self.repo.as_ref()
    }

    /// Account the instance is logged in as.
    #[must_use]
    pub const fn account(&self) -> Option<&AccountIdentity> {
        self.account.as_ref()
    }

    /// Resolved account password.
    #[must_use]
    pub fn password(&self) -> Option<&str> {
        self.config.password.as_deref()
    }

    /// Span every log event of this instance is recorded under.
    #[must_use]
    pub const fn span(&self) -> &Span {
        &self.span
    }

    /// Writes the durable description of this instance to `path`.
    ///
    /// # Errors
    ///
    /// Returns [`DescriptorError`] when the file cannot be written.
    pub fn save(&self, path: &Utf8Path) -> Result<(), DescriptorError> {
        Descriptor::from_instance(self).save(path)
    }

    /// Closes the SSH session while leaving the rest of the instance alive,
    /// for example before the process exits and hands the instance over
    /// through a descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`crate::ssh::SshError`] when the master refuses to exit.
    pub async fn close_session(&mut self) -> Result<(), crate::ssh::SshError> {
        let Some(mut session) = self.ssh.take() else {
            return Ok(());
        };
        self.config.cleanup.release(Resource::SshSession);
        session.close().await
    }

    /// Tears down every resource the instance owns: the SSH session, the
    /// container, the working copy and the generated key, in that order.
    ///
    /// Every owned resource is attempted once; failures are collected and
    /// returned together. Resources are released from the ownership record
    /// after their attempt, so calling `destroy` again does nothing.
    ///
    /// # Errors
    ///
    /// Returns [`TeardownError`] listing each resource that could not be
    /// removed.
    pub async fn destroy(&mut self) -> Result<(), TeardownError> {
        let owned: Vec<Resource> = self.config.cleanup.owned().collect();
        let mut failures = Vec::new();
        for resource in owned {
            debug!(parent: &self.span, phase = "teardown", task = %resource, action = "remove");
            let outcome = self.tear_down(resource).await;
            self.config.cleanup.release(resource);
            if let Err(message) = outcome {
                warn!(parent: &self.span, phase = "teardown", task = %resource, error = %message);
                failures.push(TeardownFailure { resource, message });
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(TeardownError { failures })
        }
    }

    async fn tear_down(&mut self, resource: Resource) -> Result<(), String> {
        match resource {
            Resource::SshSession => match self.ssh.take() {
                Some(mut session) => session.close().await.map_err(|err| err.to_string()),
                None => Ok(()),
            },
            Resource::Container => {
                let launched = self.container_id.take();
                match self.container.take().map(|handle| handle.id).or(launched) {
                    Some(id) => self
                        .driver
                        .terminate(&id)
                        .await
                        .map_err(|err| err.to_string()),
                    None => Ok(()),
                }
            }
            Resource::WorkingCopy => {
                if let Some(mut copy) = self.repo.take() {
                    return copy.remove().map_err(|err| err.to_string());
                }
                match self.config.repo_root.as_deref() {
                    Some(root) => files::remove_dir_all_if_exists(root)
                        .map(|_| ())
                        .map_err(|err| err.to_string()),
                    None => Ok(()),
                }
            }
            Resource::PrivateKey => {
                self.keys = None;
                match self.config.private_key_path.as_deref() {
                    Some(path) => keys::remove_generated(path).map_err(|err| err.to_string()),
                    None => Ok(()),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests;
