//! Local git working copy wired to the review service.

use camino::{Utf8Path, Utf8PathBuf};
use git2::{ErrorCode, IndexAddOption, ObjectType, Oid, Repository, Signature};
use thiserror::Error;
use tracing::{Span, debug, warn};
use uuid::Uuid;

use crate::command::{CommandError, SharedRunner, args, run_blocking};
use crate::config::Config;
use crate::container::Endpoint;
use crate::files::{self, FileError};
use crate::ownership::Resource;

/// Hook adding a `Change-Id` footer to commits made with the git CLI.
const COMMIT_MSG_HOOK: &str = include_str!("commit-msg");

/// Remote pushed to when none is given.
pub const DEFAULT_REMOTE: &str = "origin";

/// Ref pushed when none is given; creates a change for review on `master`.
pub const DEFAULT_PUSH_REF: &str = "HEAD:refs/for/master";

/// Errors raised by the working copy.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum WorkingCopyError {
    /// Raised when an operation needs a repository that was never opened or
    /// has been removed.
    #[error("working copy is not initialized")]
    NotInitialized,
    /// Raised when a libgit2 operation fails.
    #[error("git operation on {root} failed: {message}")]
    Git {
        /// Working-copy root.
        root: Utf8PathBuf,
        /// libgit2 error message.
        message: String,
    },
    /// Raised when file system operations fail.
    #[error(transparent)]
    File(#[from] FileError),
    /// Raised when `git push` fails.
    #[error("git push failed: {0}")]
    Push(#[source] CommandError),
    /// Raised when `git apply` rejects a patch or cannot run.
    #[error("git apply failed in {root}: {output}")]
    Apply {
        /// Working-copy root.
        root: Utf8PathBuf,
        /// Combined output of `git apply -v`.
        output: String,
    },
}

/// Builds the SSH remote URL for `project`.
#[must_use]
pub fn remote_url(user: &str, ssh: &Endpoint, project: &str) -> String {
    format!("ssh://{user}@{}:{}/{project}", ssh.address, ssh.port)
}

/// Git working directory used to push changes to the service.
pub struct WorkingCopy {
    root: Utf8PathBuf,
    repo: Option<Repository>,
    user: String,
    email: String,
    git_bin: String,
    runner: SharedRunner,
    span: Span,
}

impl std::fmt::Debug for WorkingCopy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkingCopy")
            .field("root", &self.root)
            .field("initialized", &self.repo.is_some())
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

/// Picks the working-copy root: the configured one (unowned) or a fresh
/// temporary directory, which is recorded in `config` and marked owned.
///
/// # Errors
///
/// Returns [`WorkingCopyError::File`] when the temporary directory cannot be
/// determined.
pub fn allocate_root(config: &mut Config) -> Result<Utf8PathBuf, WorkingCopyError> {
    if let Some(root) = config.repo_root.clone() {
        config.cleanup.release(Resource::WorkingCopy);
        return Ok(root);
    }
    let root = files::temp_dir()?.join(format!("gerrit-fixture-{}", Uuid::new_v4().simple()));
    config.repo_root = Some(root.clone());
    config.cleanup.claim(Resource::WorkingCopy);
    Ok(root)
}

/// Prepares the working copy: allocates the root, initialises or opens the
/// repository, installs the `commit-msg` hook, writes identity and transport
/// settings and, with a project configured, adds the remote.
///
/// # Errors
///
/// Returns [`WorkingCopyError`] when any step fails.
pub fn prepare(
    config: &mut Config,
    ssh: &Endpoint,
    runner: SharedRunner,
    span: Span,
) -> Result<WorkingCopy, WorkingCopyError> {
    let root = allocate_root(config)?;
    files::create_private_dir_all(&root)?;
    debug!(parent: &span, phase = "setup", task = "repo", action = "init", path = %root);

    let repo = match Repository::open(&root) {
        Ok(repo) => repo,
        Err(err) if err.code() == ErrorCode::NotFound => {
            Repository::init(&root).map_err(|err| git_error(&root, &err))?
        }
        Err(err) => return Err(git_error(&root, &err)),
    };
    let copy = WorkingCopy {
        user: config.username.clone(),
        email: format!("{}@localhost", config.username),
        git_bin: config.tools.git_bin.clone(),
        root,
        repo: Some(repo),
        runner,
        span,
    };
    copy.install_hook()?;
    copy.write_config(config)?;

    if let Some(project) = config.project.as_deref().filter(|name| !name.is_empty()) {
        let url = remote_url(&config.username, ssh, project);
        copy.add_remote(&config.origin_name, &url)?;
    }
    Ok(copy)
}

impl WorkingCopy {
    /// Opens an existing working copy without modifying it.
    ///
    /// # Errors
    ///
    /// Returns [`WorkingCopyError::Git`] when `root` is not a repository.
    pub fn open(
        root: &Utf8Path,
        config: &Config,
        runner: SharedRunner,
        span: Span,
    ) -> Result<Self, WorkingCopyError> {
        let repo = Repository::open(root).map_err(|err| git_error(root, &err))?;
        Ok(Self {
            root: root.to_path_buf(),
            repo: Some(repo),
            user: config.username.clone(),
            email: format!("{}@localhost", config.username),
            git_bin: config.tools.git_bin.clone(),
            runner,
            span,
        })
    }

    /// Working-copy root.
    #[must_use]
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// Returns `true` while the repository handle is present.
    #[must_use]
    pub const fn is_initialized(&self) -> bool {
        self.repo.is_some()
    }

    fn repo(&self) -> Result<&Repository, WorkingCopyError> {
        self.repo.as_ref().ok_or(WorkingCopyError::NotInitialized)
    }

    fn install_hook(&self) -> Result<(), WorkingCopyError> {
        let repo = self.repo()?;
        let git_dir = Utf8Path::from_path(repo.path()).ok_or_else(|| WorkingCopyError::Git {
            root: self.root.clone(),
            message: String::from("git directory is not valid UTF-8"),
        })?;
        files::write_executable(&git_dir.join("hooks").join("commit-msg"), COMMIT_MSG_HOOK)?;
        Ok(())
    }

    fn write_config(&self, config: &Config) -> Result<(), WorkingCopyError> {
        let repo = self.repo()?;
        let mut git_config = repo.config().map_err(|err| git_error(&self.root, &err))?;
        let entries = [
            ("user.name", self.user.as_str()),
            ("user.email", self.email.as_str()),
        ]
        .into_iter()
        .chain(
            config
                .git_config
                .iter()
                .map(|(key, value)| (key.as_str(), value.as_str())),
        );
        for (key, value) in entries {
            git_config
                .set_str(key, value)
                .map_err(|err| git_error(&self.root, &err))?;
        }
        Ok(())
    }

    /// Adds `name` pointing at `url`, updating the URL when the remote
    /// already exists.
    ///
    /// # Errors
    ///
    /// Returns [`WorkingCopyError`] when the repository is absent or the
    /// remote cannot be written.
    pub fn add_remote(&self, name: &str, url: &str) -> Result<(), WorkingCopyError> {
        let repo = self.repo()?;
        debug!(parent: &self.span, phase = "setup", task = "repo", action = "add-remote", remote = name, url);
        match repo.remote(name, url) {
            Ok(_) => Ok(()),
            Err(err) if err.code() == ErrorCode::Exists => repo
                .remote_set_url(name, url)
                .map_err(|err| git_error(&self.root, &err)),
            Err(err) => Err(git_error(&self.root, &err)),
        }
    }

    /// Stages files matching `pathspecs`, relative to the root.
    ///
    /// # Errors
    ///
    /// Returns [`WorkingCopyError`] when the repository is absent or the
    /// index cannot be written.
    pub fn add(&self, pathspecs: &[&str]) -> Result<(), WorkingCopyError> {
        let repo = self.repo()?;
        let mut index = repo.index().map_err(|err| git_error(&self.root, &err))?;
        index
            .add_all(pathspecs.iter(), IndexAddOption::DEFAULT, None)
            .and_then(|()| index.write())
            .map_err(|err| git_error(&self.root, &err))
    }

    /// Commits the index on `HEAD` and returns the commit id. A `Change-Id`
    /// footer is appended when the message lacks one.
    ///
    /// # Errors
    ///
    /// Returns [`WorkingCopyError`] when the repository is absent or the
    /// commit cannot be written.
    pub fn commit(&self, message: &str) -> Result<Oid, WorkingCopyError> {
        let repo = self.repo()?;
        let to_git = |err: git2::Error| git_error(&self.root, &err);
        let mut index = repo.index().map_err(to_git)?;
        let tree_id = index.write_tree().map_err(to_git)?;
        let tree = repo.find_tree(tree_id).map_err(to_git)?;
        let signature = Signature::now(&self.user, &self.email).map_err(to_git)?;
        let parent = repo.head().ok().and_then(|head| head.peel_to_commit().ok());
        let parents: Vec<&git2::Commit<'_>> = parent.iter().collect();
        let full_message =
            with_change_id(message, tree_id, parent.as_ref().map(git2::Commit::id))
                .map_err(to_git)?;

        let oid = repo
            .commit(Some("HEAD"), &signature, &signature, &full_message, &tree, &parents)
            .map_err(to_git)?;
        debug!(parent: &self.span, task = "repo", action = "commit", commit = %oid);
        Ok(oid)
    }

    /// Pushes `refspec` to `remote` with the git CLI so the configured
    /// `core.sshCommand` applies. Defaults to [`DEFAULT_REMOTE`] and
    /// [`DEFAULT_PUSH_REF`].
    ///
    /// # Errors
    ///
    /// Returns [`WorkingCopyError::NotInitialized`] when the repository is
    /// absent and [`WorkingCopyError::Push`] when git fails.
    pub async fn push(
        &self,
        remote: Option<&str>,
        refspec: Option<&str>,
    ) -> Result<(), WorkingCopyError> {
        self.repo()?;
        let remote_name = remote.unwrap_or(DEFAULT_REMOTE);
        let target_ref = refspec.unwrap_or(DEFAULT_PUSH_REF);
        debug!(parent: &self.span, task = "repo", action = "push", remote = remote_name, refspec = target_ref);
        run_blocking(
            &self.runner,
            &self.git_bin,
            args(["-C", self.root.as_str(), "push", remote_name, target_ref]),
        )
        .await
        .and_then(|output| output.into_success(&self.git_bin))
        .map(|_| ())
        .map_err(WorkingCopyError::Push)
    }

    /// Applies a unified diff to the working tree with `git apply -v`. The
    /// patch is staged in a private file inside the git directory and
    /// removed afterwards; the index is left untouched.
    ///
    /// # Errors
    ///
    /// Returns [`WorkingCopyError::NotInitialized`] when the repository is
    /// absent and [`WorkingCopyError::Apply`] with git's combined output
    /// when the patch does not apply.
    pub async fn apply_diff(&self, patch: &[u8]) -> Result<(), WorkingCopyError> {
        self.repo()?;
        let patch_path = self
            .root
            .join(".git")
            .join(format!("gerrit-fixture-{}.patch", Uuid::new_v4().simple()));
        files::write_private(&patch_path, patch)?;
        debug!(parent: &self.span, phase = "apply-diff", task = "repo", action = "apply-to-root", bytes = patch.len());
        let outcome = run_blocking(
            &self.runner,
            &self.git_bin,
            args(["-C", self.root.as_str(), "apply", "-v", patch_path.as_str()]),
        )
        .await;
        files::remove_file_if_exists(&patch_path).ok();

        let output = outcome.map_err(|err| WorkingCopyError::Apply {
            root: self.root.clone(),
            output: err.to_string(),
        })?;
        if output.is_success() {
            return Ok(());
        }
        let combined = [output.stdout.trim(), output.stderr.trim()]
            .into_iter()
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join("\n");
        warn!(parent: &self.span, phase = "apply-diff", action = "apply-to-root", output = %combined);
        Err(WorkingCopyError::Apply {
            root: self.root.clone(),
            output: combined,
        })
    }

    /// Deletes the working directory and drops the repository handle.
    /// Removing an already removed copy fails with
    /// [`WorkingCopyError::NotInitialized`].
    ///
    /// # Errors
    ///
    /// Returns [`WorkingCopyError`] when the copy is absent or the directory
    /// cannot be deleted.
    pub fn remove(&mut self) -> Result<(), WorkingCopyError> {
        self.repo.take().ok_or(WorkingCopyError::NotInitialized)?;
        debug!(parent: &self.span, phase = "teardown", task = "repo", action = "remove", path = %self.root);
        files::remove_dir_all_if_exists(&self.root)?;
        Ok(())
    }
}

fn git_error(root: &Utf8Path, err: &git2::Error) -> WorkingCopyError {
    WorkingCopyError::Git {
        root: root.to_path_buf(),
        message: err.message().to_owned(),
    }
}

fn has_change_id(message: &str) -> bool {
    message.lines().any(|line| {
        line.strip_prefix("Change-Id: I")
            .is_some_and(|id| id.len() == 40 && id.bytes().all(|b| b.is_ascii_hexdigit()))
    })
}

fn with_change_id(message: &str, tree: Oid, parent: Option<Oid>) -> Result<String, git2::Error> {
    let trimmed = message.trim_end();
    if has_change_id(trimmed) {
        return Ok(format!("{trimmed}\n"));
    }
    let seed = format!(
        "tree {tree}\nparent {}\n\n{trimmed}\n{}",
        parent.map_or_else(String::new, |oid| oid.to_string()),
        Uuid::new_v4()
    );
    let id = Oid::hash_object(ObjectType::Blob, seed.as_bytes())?;
    let last_is_footer = trimmed
        .lines()
        .last()
        .is_some_and(|line| line.split_once(": ").is_some_and(|(key, _)| !key.contains(' ')));
    let separator = if last_is_footer && trimmed.lines().count() > 1 {
        "\n"
    } else {
        "\n\n"
    };
    Ok(format!("{trimmed}{separator}Change-Id: I{id}\n"))
}

#[cfg(test)]
mod tests;
