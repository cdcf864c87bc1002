//! Runs the provisioning stages in order under a deadline.

use std::future::{Future, pending};
use std::sync::Arc;

use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, info, info_span};
use uuid::Uuid;

use super::{AccountIdentity, Instance, Stage};
use crate::account::{self, AccountError, HttpSession};
use crate::command::{ProcessCommandRunner, SharedRunner};
use crate::config::{Config, ConfigError, Tools};
use crate::container::{self, ContainerDriver, ContainerError, ContainerRequest, DockerDriver};
use crate::keys::{self, KeyError};
use crate::ownership::Resource;
use crate::ssh::{SshError, SshSession, SshTarget};
use crate::working_copy::{self, WorkingCopyError};

/// Errors that stop provisioning.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ProvisionError {
    /// Raised when the settings are unusable before any stage runs.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    /// Raised when key material cannot be resolved.
    #[error("key setup failed: {0}")]
    Keys(#[from] KeyError),
    /// Raised when the container cannot be started.
    #[error("container setup failed: {0}")]
    Container(#[from] ContainerError),
    /// Raised when account setup fails.
    #[error(transparent)]
    Account(#[from] AccountError),
    /// Raised when the SSH session cannot be opened.
    #[error("ssh setup failed: {0}")]
    Ssh(#[from] SshError),
    /// Raised when the working copy cannot be prepared.
    #[error("working copy setup failed: {0}")]
    WorkingCopy(#[from] WorkingCopyError),
    /// Raised when provisioning outlives its deadline.
    #[error("provisioning timed out after {seconds}s")]
    TimedOut {
        /// Deadline that expired.
        seconds: u64,
    },
    /// Raised when provisioning is interrupted.
    #[error("provisioning was cancelled")]
    Cancelled,
}

impl ProvisionError {
    /// Stage that was being provisioned when the error occurred, if the
    /// error belongs to one.
    #[must_use]
    pub const fn stage(&self) -> Option<Stage> {
        match self {
            Self::Keys(_) => Some(Stage::KeyReady),
            Self::Container(_) => Some(Stage::ContainerReady),
            Self::Account(_) => Some(Stage::AccountReady),
            Self::Ssh(_) => Some(Stage::SessionReady),
            Self::WorkingCopy(_) => Some(Stage::WorkingCopyReady),
            Self::Config(_) | Self::TimedOut { .. } | Self::Cancelled => None,
        }
    }

    /// Returns `true` for configuration errors raised before any I/O.
    #[must_use]
    pub const fn is_configuration(&self) -> bool {
        matches!(self, Self::Config(_) | Self::Account(AccountError::Config(_)))
    }
}

/// A failed provisioning run and the partial instance it left behind.
#[derive(Debug)]
pub struct ProvisionFailure {
    /// Why provisioning stopped.
    pub error: ProvisionError,
    /// Everything provisioned before the failure. Call
    /// [`Instance::destroy`] to release it.
    pub instance: Instance,
}

impl ProvisionFailure {
    /// Splits the failure into its error and partial instance.
    #[must_use]
    pub fn into_parts(self) -> (ProvisionError, Instance) {
        (self.error, self.instance)
    }
}

/// Creates, reattaches and hands out instances.
#[derive(Clone)]
pub struct Orchestrator {
    driver: Arc<dyn ContainerDriver>,
    runner: SharedRunner,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator").finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Builds an orchestrator from explicit collaborators.
    #[must_use]
    pub fn new(driver: Arc<dyn ContainerDriver>, runner: SharedRunner) -> Self {
        Self { driver, runner }
    }

    /// Builds an orchestrator driving docker and the host's `ssh`,
    /// `ssh-keygen` and `git`.
    #[must_use]
    pub fn docker(tools: &Tools) -> Self {
        let runner = ProcessCommandRunner::shared();
        let driver = Arc::new(DockerDriver::new(tools.docker_bin.clone(), Arc::clone(&runner)));
        Self::new(driver, runner)
    }

    pub(crate) fn instance(&self, config: Config) -> Instance {
        let id = Uuid::new_v4().simple().to_string();
        let span = info_span!("instance", id = %id.get(..8).unwrap_or(id.as_str()));
        Instance::new(
            config,
            Arc::clone(&self.driver),
            Arc::clone(&self.runner),
            span,
        )
    }

    /// Provisions a new instance under `config.timeout()`.
    ///
    /// # Errors
    ///
    /// Returns the error and the partial instance when any stage fails or
    /// the deadline expires.
    pub async fn create(&self, config: Config) -> Result<Instance, Box<ProvisionFailure>> {
        self.create_with_cancel(config, pending()).await
    }

    /// Provisions a new instance, stopping early when `cancel` resolves.
    ///
    /// # Errors
    ///
    /// Returns the error and the partial instance when any stage fails, the
    /// deadline expires or `cancel` resolves first.
    pub async fn create_with_cancel<C>(
        &self,
        config: Config,
        cancel: C,
    ) -> Result<Instance, Box<ProvisionFailure>>
    where
        C: Future<Output = ()>,
    {
        let mut instance = self.instance(config);
        if let Err(err) = instance.config.validate() {
            return Err(Box::new(ProvisionFailure {
                error: ProvisionError::Config(err),
                instance,
            }));
        }

        let seconds = instance.config.timeout_secs;
        let deadline = instance.config.timeout();
        let outcome = tokio::select! {
            result = timeout(deadline, run_stages(&mut instance)) => {
                result.unwrap_or(Err(ProvisionError::TimedOut { seconds }))
            }
            () = cancel => Err(ProvisionError::Cancelled),
        };

        match outcome {
            Ok(()) => {
                info!(parent: &instance.span, stage = %instance.stage, "instance ready");
                Ok(instance)
            }
            Err(error) => {
                info!(
                    parent: &instance.span,
                    stage = %instance.stage,
                    error = %error,
                    "provisioning failed",
                );
                Err(Box::new(ProvisionFailure { error, instance }))
            }
        }
    }

    pub(crate) fn driver(&self) -> &dyn ContainerDriver {
        self.driver.as_ref()
    }

    pub(crate) const fn runner(&self) -> &SharedRunner {
        &self.runner
    }
}

async fn run_stages(instance: &mut Instance) -> Result<(), ProvisionError> {
    let span = instance.span.clone();

    debug!(parent: &span, phase = "setup", task = "keys");
    let material = keys::resolve(&mut instance.config, instance.runner.as_ref(), &span)?;
    let public_key = material.public_key.clone();
    instance.keys = Some(material);
    instance.stage = Stage::KeyReady;

    let request = ContainerRequest {
        name: container::container_name(),
        image: instance.config.image.clone(),
        port_http: instance.config.port_http,
        port_ssh: instance.config.port_ssh,
    };
    instance.config.cleanup.claim(Resource::Container);
    instance.container_id = Some(request.name.clone());
    let id = container::launch(instance.driver.as_ref(), &request, &span).await?;
    instance.container_id = Some(id.clone());
    let handle = container::publish(instance.driver.as_ref(), &request, id, &span).await?;
    let http_endpoint = handle.http.clone();
    let ssh_endpoint = handle.ssh.clone();
    instance.container = Some(handle);
    instance.stage = Stage::ContainerReady;

    if instance.config.container_only {
        debug!(parent: &span, phase = "setup", task = "container", action = "stop-early");
        instance.stage = Stage::ContainerOnly;
        return Ok(());
    }

    let session = HttpSession::new(&http_endpoint, &instance.config.username, span.clone())?;
    instance.config.username = session.user().to_owned();
    account::provision(&session, &mut instance.config, &public_key, &span).await?;
    instance.account = Some(AccountIdentity {
        username: session.user().to_owned(),
    });
    instance.http = Some(session);
    instance.stage = Stage::AccountReady;

    let key_path = instance
        .config
        .private_key_path
        .clone()
        .unwrap_or_default();
    let target = SshTarget {
        user: instance.config.username.clone(),
        endpoint: ssh_endpoint.clone(),
        key_path,
    };
    let ssh_bin = instance.config.tools.ssh_bin.clone();
    let pending_session =
        SshSession::new(target, &ssh_bin, Arc::clone(&instance.runner), span.clone())?;
    instance.config.cleanup.claim(Resource::SshSession);
    instance.ssh.insert(pending_session).open().await?;
    instance.stage = Stage::SessionReady;

    let copy = working_copy::prepare(
        &mut instance.config,
        &ssh_endpoint,
        Arc::clone(&instance.runner),
        span.clone(),
    )?;
    instance.repo = Some(copy);
    instance.stage = Stage::WorkingCopyReady;
    Ok(())
}
