//! Command-line interface definitions for the `gerrit-fixture` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Top-level CLI for the `gerrit-fixture` binary.
#[derive(Debug, Parser)]
#[command(
    name = "gerrit-fixture",
    about = "Start and stop disposable Gerrit instances for integration tests",
    arg_required_else_help = true
)]
pub(crate) struct Cli {
    /// Log filter used when `RUST_LOG` is unset (for example `info` or
    /// `gerrit_fixture=debug`).
    #[arg(long, global = true, value_name = "FILTER", default_value = "warn")]
    pub(crate) log_level: String,
    /// Subcommand to run.
    #[command(subcommand)]
    pub(crate) command: Command,
}

/// Subcommands of `gerrit-fixture`.
#[derive(Debug, Subcommand)]
pub(crate) enum Command {
    /// Provision a new instance and describe it.
    #[command(name = "start", about = "Provision a new Gerrit instance")]
    Start(StartCommand),
    /// Tear down an instance described by a descriptor file.
    #[command(name = "stop", about = "Tear down an instance from its descriptor")]
    Stop(StopCommand),
}

/// Arguments for the `gerrit-fixture start` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct StartCommand {
    /// Container image to run. Defaults to the configured image.
    #[arg(long, value_name = "IMAGE")]
    pub(crate) image: Option<String>,
    /// Host port published for HTTP. 0 lets docker choose.
    #[arg(long, value_name = "PORT")]
    pub(crate) port_http: Option<u16>,
    /// Host port published for SSH. 0 lets docker choose.
    #[arg(long, value_name = "PORT")]
    pub(crate) port_ssh: Option<u16>,
    /// Overall provisioning deadline in seconds.
    #[arg(long, value_name = "SECONDS")]
    pub(crate) timeout: Option<u64>,
    /// Password to set for the admin account instead of generating one.
    #[arg(short = 'p', long, value_name = "PASSWORD")]
    pub(crate) password: Option<String>,
    /// Existing private key to use instead of generating one.
    #[arg(short = 'i', long, value_name = "PATH")]
    pub(crate) private_key: Option<PathBuf>,
    /// Project to create on the server and wire up as the origin remote.
    #[arg(long, value_name = "NAME")]
    pub(crate) project: Option<String>,
    /// Directory for the working copy. A temporary one is created when unset.
    #[arg(long, value_name = "PATH")]
    pub(crate) repo_root: Option<PathBuf>,
    /// Stop once the container is running.
    #[arg(long)]
    pub(crate) start_only: bool,
    /// Leave partially provisioned resources behind when start fails.
    #[arg(short = 'n', long)]
    pub(crate) no_cleanup: bool,
    /// Write the descriptor to this file instead of printing it.
    #[arg(short = 'j', long, value_name = "PATH")]
    pub(crate) json: Option<PathBuf>,
}

/// Arguments for the `gerrit-fixture stop` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct StopCommand {
    /// Descriptor written by `start --json`.
    #[arg(short = 'j', long, value_name = "PATH", required = true)]
    pub(crate) json: PathBuf,
}
