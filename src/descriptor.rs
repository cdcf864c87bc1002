//! Durable JSON description of an instance and its reconstruction into
//! live handles.
//!
//! The descriptor records settings, the container identity with its ports,
//! the account identity and the stage reached. Key bytes and live sessions
//! are never written; the key is referenced by path and must still exist
//! when the descriptor is loaded.

use std::sync::Arc;

use camino::Utf8Path;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::account::{AccountError, HttpSession};
use crate::config::Config;
use crate::container::{ContainerError, ContainerHandle};
use crate::files::{self, FileError};
use crate::instance::{AccountIdentity, Instance, Orchestrator, Stage};
use crate::keys::{self, KeyError};
use crate::ownership::Resource;
use crate::ssh::{SshError, SshSession, SshTarget};
use crate::working_copy::{WorkingCopy, WorkingCopyError};

/// Errors raised while saving or loading descriptors.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum DescriptorError {
    /// Raised when the descriptor file cannot be read or written.
    #[error(transparent)]
    File(#[from] FileError),
    /// Raised when the descriptor cannot be encoded or decoded.
    #[error("invalid descriptor {path}: {message}")]
    Format {
        /// Descriptor path.
        path: String,
        /// Serde error message.
        message: String,
    },
    /// Raised when the recorded stage requires data the descriptor lacks.
    #[error("descriptor at stage {stage} is missing {missing}")]
    Incomplete {
        /// Recorded stage.
        stage: Stage,
        /// Absent field.
        missing: &'static str,
    },
    /// Raised when the container cannot be re-attached.
    #[error("failed to re-attach container: {0}")]
    Container(#[from] ContainerError),
    /// Raised when the referenced key cannot be loaded.
    #[error("failed to load key: {0}")]
    Keys(#[from] KeyError),
    /// Raised when the HTTP session cannot be restored.
    #[error("failed to restore http session: {0}")]
    Account(#[from] AccountError),
    /// Raised when the SSH session cannot be restored.
    #[error("failed to restore ssh session: {0}")]
    Ssh(#[from] SshError),
    /// Raised when the working copy cannot be reopened.
    #[error("failed to reopen working copy: {0}")]
    WorkingCopy(#[from] WorkingCopyError),
}

/// Serialisable subset of an [`Instance`].
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Descriptor {
    /// Settings with every resolved value.
    pub config: Config,
    /// Stage reached.
    pub stage: Stage,
    /// Container identity and ports.
    pub container: Option<ContainerHandle>,
    /// Account identity.
    pub account: Option<AccountIdentity>,
}

impl Descriptor {
    /// Captures the durable parts of `instance`.
    #[must_use]
    pub fn from_instance(instance: &Instance) -> Self {
        Self {
            config: instance.config().clone(),
            stage: instance.stage(),
            container: instance.container().cloned(),
            account: instance.account().cloned(),
        }
    }

    /// Renders the descriptor as pretty-printed JSON.
    ///
    /// # Errors
    ///
    /// Returns [`DescriptorError::Format`] when encoding fails.
    pub fn to_json(&self) -> Result<String, DescriptorError> {
        serde_json::to_string_pretty(self).map_err(|err| DescriptorError::Format {
            path: String::from("<memory>"),
            message: err.to_string(),
        })
    }

    /// Writes the descriptor to `path` with owner-only permissions,
    /// creating parent directories and replacing existing content.
    ///
    /// # Errors
    ///
    /// Returns [`DescriptorError`] when encoding or writing fails.
    pub fn save(&self, path: &Utf8Path) -> Result<(), DescriptorError> {
        let mut rendered = self.to_json()?;
        rendered.push('\n');
        files::write_private(path, rendered.as_bytes())?;
        Ok(())
    }

    /// Reads a descriptor from `path`.
    ///
    /// # Errors
    ///
    /// Returns [`DescriptorError`] when the file cannot be read or parsed.
    pub fn load(path: &Utf8Path) -> Result<Self, DescriptorError> {
        let contents = files::read_to_string(path)?;
        serde_json::from_str(&contents).map_err(|err| DescriptorError::Format {
            path: path.to_string(),
            message: err.to_string(),
        })
    }
}

impl Orchestrator {
    /// Loads the descriptor at `path` and reconstructs the instance it
    /// describes without provisioning anything new.
    ///
    /// # Errors
    ///
    /// Returns [`DescriptorError`] when the file is unreadable or any handle
    /// the recorded stage requires cannot be reconstructed.
    pub async fn reattach(&self, path: &Utf8Path) -> Result<Instance, DescriptorError> {
        let descriptor = Descriptor::load(path)?;
        self.rehydrate(descriptor).await
    }

    /// Reconstructs live handles for `descriptor` as far as its stage
    /// requires. When a later handle fails, an SSH session already opened
    /// for the attempt is closed before the error is returned.
    ///
    /// # Errors
    ///
    /// Returns [`DescriptorError`] when a required handle cannot be
    /// reconstructed.
    pub async fn rehydrate(&self, descriptor: Descriptor) -> Result<Instance, DescriptorError> {
        let Descriptor {
            config,
            stage,
            container,
            account,
        } = descriptor;
        let mut instance = self.instance(config);
        instance.stage = stage;
        debug!(parent: instance.span(), phase = "reattach", stage = %stage);

        if let Err(err) = self.restore(&mut instance, container, account).await {
            if let Err(close) = instance.close_session().await {
                warn!(
                    parent: instance.span(),
                    phase = "reattach",
                    task = "ssh",
                    error = %close,
                );
            }
            return Err(err);
        }
        Ok(instance)
    }

    async fn restore(
        &self,
        instance: &mut Instance,
        container: Option<ContainerHandle>,
        account: Option<AccountIdentity>,
    ) -> Result<(), DescriptorError> {
        let stage = instance.stage;
        let span = instance.span().clone();

        if stage >= Stage::KeyReady {
            let path = instance
                .config
                .private_key_path
                .clone()
                .ok_or(DescriptorError::Incomplete {
                    stage,
                    missing: "private_key_path",
                })?;
            let keygen = instance.config.tools.ssh_keygen_bin.clone();
            instance.keys = Some(keys::load(&path, self.runner().as_ref(), &keygen)?);
        }

        if stage >= Stage::ContainerReady {
            let handle = container.ok_or(DescriptorError::Incomplete {
                stage,
                missing: "container",
            })?;
            self.driver().attach(&handle).await?;
            instance.container = Some(handle);
        }

        if stage >= Stage::AccountReady {
            let identity = account.ok_or(DescriptorError::Incomplete {
                stage,
                missing: "account",
            })?;
            let endpoint = instance
                .container
                .as_ref()
                .map(|handle| handle.http.clone())
                .ok_or(DescriptorError::Incomplete {
                    stage,
                    missing: "container",
                })?;
            let session = HttpSession::new(&endpoint, &identity.username, span.clone())?;
            session.login().await?;
            instance.config.username = session.user().to_owned();
            instance.http = Some(session);
            instance.account = Some(identity);
        }

        if stage >= Stage::SessionReady {
            let target = SshTarget {
                user: instance.config.username.clone(),
                endpoint: instance
                    .container
                    .as_ref()
                    .map(|handle| handle.ssh.clone())
                    .ok_or(DescriptorError::Incomplete {
                        stage,
                        missing: "container",
                    })?,
                key_path: instance.config.private_key_path.clone().unwrap_or_default(),
            };
            let ssh_bin = instance.config.tools.ssh_bin.clone();
            let pending_session =
                SshSession::new(target, &ssh_bin, Arc::clone(self.runner()), span.clone())?;
            instance.config.cleanup.claim(Resource::SshSession);
            instance.ssh.insert(pending_session).open().await?;
        } else {
            instance.config.cleanup.release(Resource::SshSession);
        }

        if stage >= Stage::WorkingCopyReady {
            let root = instance
                .config
                .repo_root
                .clone()
                .ok_or(DescriptorError::Incomplete {
                    stage,
                    missing: "repo_root",
                })?;
            let copy = WorkingCopy::open(&root, &instance.config, Arc::clone(self.runner()), span)?;
            instance.repo = Some(copy);
        }
        Ok(())
    }
}
