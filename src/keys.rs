//! SSH key material: load a caller-supplied key or generate a throwaway
//! pair, and point git at it.

use std::borrow::Cow;
use std::fmt;

use camino::{Utf8Path, Utf8PathBuf};
use shell_escape::unix::escape;
use thiserror::Error;
use tracing::{Span, debug};
use uuid::Uuid;

use crate::command::{CommandError, CommandRunner, args};
use crate::config::Config;
use crate::files::{self, FileError};
use crate::ownership::Resource;

/// Git configuration key carrying the transport override.
pub const SSH_COMMAND_KEY: &str = "core.sshCommand";

/// Comment stamped onto generated keys.
const KEY_COMMENT: &str = "gerrit-fixture";

/// Errors raised while resolving key material.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum KeyError {
    /// Raised when a key file cannot be read or removed.
    #[error(transparent)]
    File(#[from] FileError),
    /// Raised when `ssh-keygen` fails.
    #[error("ssh-keygen failed: {0}")]
    Keygen(#[source] CommandError),
    /// Raised when a key file exists but is empty.
    #[error("key file {path} is empty")]
    Empty {
        /// Offending key file.
        path: Utf8PathBuf,
    },
}

/// Private key bytes. Never serialised and redacted from debug output.
#[derive(Clone, Eq, PartialEq)]
pub struct PrivateKey(String);

impl PrivateKey {
    /// Returns the PEM text.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKey(<redacted>)")
    }
}

/// A resolved key pair and the file it lives in.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct KeyMaterial {
    /// Location of the private key on disk.
    pub private_key_path: Utf8PathBuf,
    /// Private key contents.
    pub private_key: PrivateKey,
    /// Public key in `authorized_keys` format.
    pub public_key: String,
}

/// Resolves the key pair for `config`.
///
/// With `private_key_path` set the key is loaded and left unowned. Otherwise
/// a 2048-bit RSA pair is generated in the temporary directory, its path is
/// written back into `config` and the key is marked owned. Either way the
/// git transport override is recorded under [`SSH_COMMAND_KEY`].
///
/// # Errors
///
/// Returns [`KeyError`] when the key cannot be generated or read.
pub fn resolve(
    config: &mut Config,
    runner: &dyn CommandRunner,
    span: &Span,
) -> Result<KeyMaterial, KeyError> {
    let keygen = config.tools.ssh_keygen_bin.clone();
    let material = if let Some(path) = config.private_key_path.clone() {
        config.cleanup.release(Resource::PrivateKey);
        debug!(parent: span, phase = "setup", task = "keys", action = "load", path = %path);
        load(&path, runner, &keygen)?
    } else {
        let path = files::temp_dir()?.join(format!(
            "gerrit-fixture-id_rsa-{}",
            Uuid::new_v4().simple()
        ));
        config.private_key_path = Some(path.clone());
        config.cleanup.claim(Resource::PrivateKey);
        debug!(parent: span, phase = "setup", task = "keys", action = "generate", path = %path);
        generate(&path, runner, &keygen)?;
        load(&path, runner, &keygen)?
    };

    config.git_config.insert(
        SSH_COMMAND_KEY.to_owned(),
        ssh_command(&material.private_key_path),
    );
    Ok(material)
}

/// Loads an existing key pair, reading `<path>.pub` when present.
///
/// # Errors
///
/// Returns [`KeyError`] when the private key cannot be read or the public
/// half cannot be derived.
pub fn load(
    path: &Utf8Path,
    runner: &dyn CommandRunner,
    keygen: &str,
) -> Result<KeyMaterial, KeyError> {
    let private_key = files::read_to_string(path)?;
    if private_key.trim().is_empty() {
        return Err(KeyError::Empty {
            path: path.to_path_buf(),
        });
    }

    let public_path = public_key_path(path);
    let raw_public = if files::exists(&public_path)? {
        files::read_to_string(&public_path)?
    } else {
        runner
            .run(keygen, &args(["-y", "-f", path.as_str()]))
            .and_then(|output| output.into_success(keygen))
            .map_err(KeyError::Keygen)?
            .stdout
    };
    let public_key = raw_public.trim().to_owned();
    if public_key.is_empty() {
        return Err(KeyError::Empty { path: public_path });
    }

    Ok(KeyMaterial {
        private_key_path: path.to_path_buf(),
        private_key: PrivateKey(private_key),
        public_key,
    })
}

fn generate(path: &Utf8Path, runner: &dyn CommandRunner, keygen: &str) -> Result<(), KeyError> {
    runner
        .run(
            keygen,
            &args([
                "-q",
                "-t",
                "rsa",
                "-b",
                "2048",
                "-N",
                "",
                "-C",
                KEY_COMMENT,
                "-f",
                path.as_str(),
            ]),
        )
        .and_then(|output| output.into_success(keygen))
        .map_err(KeyError::Keygen)?;
    Ok(())
}

/// Removes a generated key and its `.pub` companion. Missing files are
/// ignored.
///
/// # Errors
///
/// Returns [`KeyError::File`] when either file exists but cannot be removed.
pub fn remove_generated(path: &Utf8Path) -> Result<(), KeyError> {
    files::remove_file_if_exists(path)?;
    files::remove_file_if_exists(&public_key_path(path))?;
    Ok(())
}

/// Path of the public half next to `path`.
#[must_use]
pub fn public_key_path(path: &Utf8Path) -> Utf8PathBuf {
    Utf8PathBuf::from(format!("{path}.pub"))
}

/// Transport override making git authenticate with `path` and skip host key
/// checks against the throwaway server.
#[must_use]
pub fn ssh_command(path: &Utf8Path) -> String {
    format!(
        "ssh -i {} -o UserKnownHostsFile=/dev/null -o StrictHostKeyChecking=no",
        escape(Cow::Borrowed(path.as_str()))
    )
}
