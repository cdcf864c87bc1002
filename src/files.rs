//! Capability-scoped file helpers shared by key handling, the working copy
//! and the descriptor codec.

use std::io::{self, Write};

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use thiserror::Error;

/// Errors raised by file helpers.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum FileError {
    /// Raised when file system operations fail.
    #[error("failed to access {path}: {message}")]
    Io {
        /// Path that could not be accessed.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
    /// Raised when a path has no final component.
    #[error("path {path} is missing a file name")]
    MissingFileName {
        /// Offending path.
        path: Utf8PathBuf,
    },
}

impl FileError {
    fn io(path: &Utf8Path, err: &io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            message: err.to_string(),
        }
    }
}

fn split(path: &Utf8Path) -> Result<(&Utf8Path, &str), FileError> {
    let file_name = path.file_name().ok_or_else(|| FileError::MissingFileName {
        path: path.to_path_buf(),
    })?;
    let parent = path
        .parent()
        .filter(|parent| !parent.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."));
    Ok((parent, file_name))
}

fn open_parent(parent: &Utf8Path) -> Result<Dir, FileError> {
    Dir::open_ambient_dir(parent, ambient_authority()).map_err(|err| FileError::io(parent, &err))
}

/// Reads a UTF-8 file.
///
/// # Errors
///
/// Returns [`FileError`] when the file cannot be opened or read.
pub fn read_to_string(path: &Utf8Path) -> Result<String, FileError> {
    let (parent, file_name) = split(path)?;
    open_parent(parent)?
        .read_to_string(file_name)
        .map_err(|err| FileError::io(path, &err))
}

/// Returns `true` when `path` exists.
///
/// # Errors
///
/// Returns [`FileError`] when the parent directory exists but cannot be
/// inspected.
pub fn exists(path: &Utf8Path) -> Result<bool, FileError> {
    let (parent, file_name) = split(path)?;
    match Dir::open_ambient_dir(parent, ambient_authority()) {
        Ok(dir) => dir
            .try_exists(file_name)
            .map_err(|err| FileError::io(path, &err)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(FileError::io(parent, &err)),
    }
}

/// Creates `dir` and any missing parents, restricted to the owner.
///
/// # Errors
///
/// Returns [`FileError`] when a directory cannot be created.
pub fn create_private_dir_all(dir: &Utf8Path) -> Result<(), FileError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;

        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(dir)
            .map_err(|err| FileError::io(dir, &err))
    }
    #[cfg(not(unix))]
    {
        Dir::create_ambient_dir_all(dir, ambient_authority()).map_err(|err| FileError::io(dir, &err))
    }
}

/// Writes `contents` to `path`, creating parent directories (0700) and
/// leaving the file readable and writable by the owner only (0600). Existing
/// content is replaced.
///
/// A new file is created with mode 0600; an existing file is restricted to
/// 0600 before its content is replaced.
///
/// # Errors
///
/// Returns [`FileError`] when a directory or the file cannot be written.
pub fn write_private(path: &Utf8Path, contents: &[u8]) -> Result<(), FileError> {
    let (parent, _) = split(path)?;
    create_private_dir_all(parent)?;
    let mut file = open_private(path)?;
    set_mode(path, 0o600)?;
    file.set_len(0)
        .and_then(|()| file.write_all(contents))
        .map_err(|err| FileError::io(path, &err))
}

#[cfg(unix)]
fn open_private(path: &Utf8Path) -> Result<std::fs::File, FileError> {
    use std::os::unix::fs::OpenOptionsExt;

    std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .mode(0o600)
        .open(path)
        .map_err(|err| FileError::io(path, &err))
}

#[cfg(not(unix))]
fn open_private(path: &Utf8Path) -> Result<std::fs::File, FileError> {
    std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(path)
        .map_err(|err| FileError::io(path, &err))
}

/// Writes an executable script readable only by the owner (0700).
///
/// # Errors
///
/// Returns [`FileError`] when the file cannot be written.
pub fn write_executable(path: &Utf8Path, contents: &str) -> Result<(), FileError> {
    let (parent, file_name) = split(path)?;
    Dir::create_ambient_dir_all(parent, ambient_authority())
        .map_err(|err| FileError::io(parent, &err))?;
    open_parent(parent)?
        .write(file_name, contents)
        .map_err(|err| FileError::io(path, &err))?;
    set_mode(path, 0o700)
}

#[cfg(unix)]
fn set_mode(path: &Utf8Path, mode: u32) -> Result<(), FileError> {
    use std::os::unix::fs::PermissionsExt;

    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .map_err(|err| FileError::io(path, &err))
}

#[cfg(not(unix))]
fn set_mode(_path: &Utf8Path, _mode: u32) -> Result<(), FileError> {
    Ok(())
}

/// Removes a file, treating a missing file as already removed.
///
/// Returns `true` when a file was deleted.
///
/// # Errors
///
/// Returns [`FileError`] for failures other than the file being absent.
pub fn remove_file_if_exists(path: &Utf8Path) -> Result<bool, FileError> {
    let (parent, file_name) = split(path)?;
    let dir = match Dir::open_ambient_dir(parent, ambient_authority()) {
        Ok(dir) => dir,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(FileError::io(parent, &err)),
    };
    match dir.remove_file(file_name) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(FileError::io(path, &err)),
    }
}

/// Recursively removes a directory, treating a missing directory as already
/// removed.
///
/// Returns `true` when a directory was deleted.
///
/// # Errors
///
/// Returns [`FileError`] for failures other than the directory being absent.
pub fn remove_dir_all_if_exists(path: &Utf8Path) -> Result<bool, FileError> {
    let (parent, name) = split(path)?;
    let dir = match Dir::open_ambient_dir(parent, ambient_authority()) {
        Ok(dir) => dir,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(FileError::io(parent, &err)),
    };
    match dir.remove_dir_all(name) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(FileError::io(path, &err)),
    }
}

/// Returns the system temporary directory as a UTF-8 path.
///
/// # Errors
///
/// Returns [`FileError::Io`] when the temporary directory is not valid UTF-8.
pub fn temp_dir() -> Result<Utf8PathBuf, FileError> {
    Utf8PathBuf::from_path_buf(std::env::temp_dir()).map_err(|path| FileError::Io {
        path: Utf8PathBuf::from(path.to_string_lossy().into_owned()),
        message: String::from("temporary directory is not valid UTF-8"),
    })
}
