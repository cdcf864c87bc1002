//! Disposable Gerrit instances for integration tests and CI.
//!
//! An [`Orchestrator`] provisions an [`Instance`] in strictly ordered stages
//! (key material, container, account, SSH session, working copy), tracks
//! which resources it created in an [`Ownership`] record, and tears down
//! exactly those on [`Instance::destroy`]. A [`Descriptor`] persists an
//! instance to JSON so another process can reattach to it.

pub mod account;
pub mod command;
pub mod config;
pub mod container;
pub mod descriptor;
pub mod files;
pub mod instance;
pub mod keys;
pub mod ownership;
pub mod ssh;
pub mod test_support;
pub mod working_copy;

pub use account::{AccountError, AccountInfo, HttpSession};
pub use command::{CommandError, CommandOutput, CommandRunner, ProcessCommandRunner};
pub use config::{Config, ConfigError, FixtureConfig, Tools};
pub use container::{
    ContainerDriver, ContainerError, ContainerHandle, ContainerRequest, DockerDriver, Endpoint,
    PublishedPorts,
};
pub use descriptor::{Descriptor, DescriptorError};
pub use instance::{
    AccountIdentity, Instance, Orchestrator, ProvisionError, ProvisionFailure, Stage,
    TeardownError, TeardownFailure,
};
pub use keys::{KeyError, KeyMaterial, PrivateKey};
pub use ownership::{Ownership, Resource};
pub use ssh::{SshError, SshSession, SshTarget};
pub use working_copy::{WorkingCopy, WorkingCopyError};
