//! SSH transport session: an OpenSSH control master shared by later
//! commands against the review service.

use std::ffi::OsString;

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tracing::{Span, debug};
use uuid::Uuid;

use crate::command::{CommandError, CommandOutput, SharedRunner, args, run_blocking};
use crate::container::Endpoint;
use crate::files::{self, FileError};

/// Errors raised by the SSH session.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum SshError {
    /// Raised when the control master cannot be opened.
    #[error("failed to open ssh session to {target}: {source}")]
    Connect {
        /// `user@host:port` the session targeted.
        target: String,
        /// Underlying command failure.
        #[source]
        source: CommandError,
    },
    /// Raised when the session opened but the service did not answer.
    #[error("ssh session to {target} failed verification: {message}")]
    Verify {
        /// `user@host:port` the session targeted.
        target: String,
        /// Detail of the failure, including any teardown note.
        message: String,
    },
    /// Raised when a command over an open session fails.
    #[error("ssh command failed: {0}")]
    Command(#[source] CommandError),
    /// Raised when running a command on a closed session.
    #[error("ssh session is closed")]
    Closed,
    /// Raised when the control socket location cannot be determined.
    #[error(transparent)]
    File(#[from] FileError),
}

/// Connection parameters for [`SshSession::connect`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SshTarget {
    /// Login name.
    pub user: String,
    /// SSH endpoint published by the container.
    pub endpoint: Endpoint,
    /// Private key to authenticate with.
    pub key_path: Utf8PathBuf,
}

impl SshTarget {
    fn destination(&self) -> String {
        format!("{}@{}", self.user, self.endpoint.address)
    }

    fn describe(&self) -> String {
        format!("{}@{}", self.user, self.endpoint)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum MasterState {
    Pending,
    Open,
    Closed,
}

/// Control-master session. A session is created pending, becomes open once
/// the master is up and verified, and is closed at most once.
pub struct SshSession {
    target: SshTarget,
    control_path: Utf8PathBuf,
    ssh_bin: String,
    runner: SharedRunner,
    state: MasterState,
    span: Span,
}

impl std::fmt::Debug for SshSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshSession")
            .field("target", &self.target)
            .field("control_path", &self.control_path)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl SshSession {
    /// Prepares a session for `target` without starting anything. The
    /// control socket location is fixed here so the session can be closed
    /// even if opening is interrupted.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::File`] when no temporary directory is available.
    pub fn new(
        target: SshTarget,
        ssh_bin: &str,
        runner: SharedRunner,
        span: Span,
    ) -> Result<Self, SshError> {
        let control_path = files::temp_dir()?.join(format!(
            "gerrit-fixture-ssh-{}.sock",
            Uuid::new_v4().simple().to_string().get(..12).unwrap_or("master")
        ));
        Ok(Self {
            target,
            control_path,
            ssh_bin: ssh_bin.to_owned(),
            runner,
            state: MasterState::Pending,
            span,
        })
    }

    /// Opens a control master for `target` and verifies it by running
    /// `gerrit version`.
    ///
    /// # Errors
    ///
    /// See [`SshSession::open`].
    pub async fn connect(
        target: SshTarget,
        ssh_bin: &str,
        runner: SharedRunner,
        span: Span,
    ) -> Result<Self, SshError> {
        let mut session = Self::new(target, ssh_bin, runner, span)?;
        session.open().await?;
        Ok(session)
    }

    /// Starts the control master and verifies it by running
    /// `gerrit version`. There is no retry; a failed verification closes the
    /// master before returning.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::Connect`] when the master cannot be started,
    /// [`SshError::Verify`] when the service does not answer over it and
    /// [`SshError::Closed`] when the session was already closed.
    pub async fn open(&mut self) -> Result<(), SshError> {
        match self.state {
            MasterState::Open => return Ok(()),
            MasterState::Closed => return Err(SshError::Closed),
            MasterState::Pending => {}
        }
        debug!(
            parent: &self.span,
            phase = "setup",
            task = "ssh",
            action = "connect",
            target = %self.target.describe(),
        );
        let mut master = self.base_args();
        master.extend(args([
            "-i",
            self.target.key_path.as_str(),
            "-o",
            "ControlMaster=yes",
            "-o",
            "ControlPersist=yes",
            "-f",
            "-N",
        ]));
        master.push(OsString::from(self.target.destination()));
        run_blocking(&self.runner, &self.ssh_bin, master)
            .await
            .and_then(|output| output.into_success(&self.ssh_bin))
            .map_err(|source| SshError::Connect {
                target: self.target.describe(),
                source,
            })?;
        self.state = MasterState::Open;

        if let Err(err) = self.run(&["gerrit", "version"]).await {
            let teardown = self.close().await.err();
            let message = match teardown {
                Some(teardown) => format!("{err} (teardown also failed: {teardown})"),
                None => err.to_string(),
            };
            return Err(SshError::Verify {
                target: self.target.describe(),
                message,
            });
        }
        Ok(())
    }

    fn base_args(&self) -> Vec<OsString> {
        let port = self.target.endpoint.port.to_string();
        let control = format!("ControlPath={}", self.control_path);
        args([
            "-p",
            port.as_str(),
            "-o",
            "BatchMode=yes",
            "-o",
            "StrictHostKeyChecking=no",
            "-o",
            "UserKnownHostsFile=/dev/null",
            "-o",
            control.as_str(),
        ])
    }

    /// Runs a command on the service over the open master.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::Closed`] after [`SshSession::close`] and
    /// [`SshError::Command`] when the command fails.
    pub async fn run(&self, command: &[&str]) -> Result<CommandOutput, SshError> {
        if self.state != MasterState::Open {
            return Err(SshError::Closed);
        }
        let mut argv = self.base_args();
        argv.push(OsString::from(self.target.destination()));
        argv.extend(args(command.iter().copied()));
        run_blocking(&self.runner, &self.ssh_bin, argv)
            .await
            .and_then(|output| output.into_success(&self.ssh_bin))
            .map_err(SshError::Command)
    }

    /// Stops the control master. Closing an already closed session does
    /// nothing. A session whose master never came up, leaving no control
    /// socket behind, closes successfully.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::Command`] when the master refuses to exit. The
    /// session counts as closed either way.
    pub async fn close(&mut self) -> Result<(), SshError> {
        let previous = self.state;
        if previous == MasterState::Closed {
            return Ok(());
        }
        self.state = MasterState::Closed;
        debug!(parent: &self.span, phase = "teardown", task = "ssh", action = "close");
        let mut argv = self.base_args();
        argv.extend(args(["-O", "exit"]));
        argv.push(OsString::from(self.target.destination()));
        let result = run_blocking(&self.runner, &self.ssh_bin, argv)
            .await
            .and_then(|output| output.into_success(&self.ssh_bin))
            .map(|_| ())
            .map_err(SshError::Command);
        let master_absent = previous == MasterState::Pending
            && !files::exists(&self.control_path).unwrap_or(true);
        files::remove_file_if_exists(&self.control_path).ok();
        if master_absent { Ok(()) } else { result }
    }

    /// Returns `true` while the master is up and has not been closed.
    #[must_use]
    pub const fn is_open(&self) -> bool {
        matches!(self.state, MasterState::Open)
    }

    /// Control socket shared by commands over this session.
    #[must_use]
    pub fn control_path(&self) -> &Utf8Path {
        &self.control_path
    }

    /// Target of the session.
    #[must_use]
    pub const fn target(&self) -> &SshTarget {
        &self.target
    }
}
