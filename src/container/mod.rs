//! Container provisioning: the driver seam, endpoint handling and the
//! docker CLI implementation.

mod docker;

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{Span, debug};
use uuid::Uuid;

use crate::command::CommandError;

pub use docker::DockerDriver;

/// Port the review service listens on for HTTP inside the container.
pub const INTERNAL_HTTP_PORT: u16 = 8080;

/// Port the review service listens on for SSH inside the container.
pub const INTERNAL_SSH_PORT: u16 = 29418;

/// Host every published port is bound to.
pub const PUBLISH_ADDRESS: &str = "127.0.0.1";

/// Host name substituted for the loopback address on the HTTP endpoint. The
/// service scopes its session cookie by host name.
pub const LOOPBACK_HOST: &str = "localhost";

/// Host and port of a published service.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Endpoint {
    /// Host name or address.
    pub address: String,
    /// Local port.
    pub port: u16,
}

impl Endpoint {
    /// Creates an endpoint.
    #[must_use]
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
        }
    }

    /// Replaces `127.0.0.1` with `localhost`.
    #[must_use]
    pub fn with_loopback_host(mut self) -> Self {
        if self.address == PUBLISH_ADDRESS {
            LOOPBACK_HOST.clone_into(&mut self.address);
        }
        self
    }

    /// Base URL for HTTP requests against this endpoint.
    #[must_use]
    pub fn http_url(&self) -> String {
        format!("http://{}:{}", self.address, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// A running container and its published endpoints.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ContainerHandle {
    /// Runtime identifier.
    pub id: String,
    /// Image the container was started from.
    pub image: String,
    /// Published HTTP endpoint.
    pub http: Endpoint,
    /// Published SSH endpoint.
    pub ssh: Endpoint,
}

/// Parameters for starting a container.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ContainerRequest {
    /// Name given to the container so it can be removed before its id is
    /// known.
    pub name: String,
    /// Image to start.
    pub image: String,
    /// Requested local HTTP port; `0` lets the runtime choose.
    pub port_http: u16,
    /// Requested local SSH port; `0` lets the runtime choose.
    pub port_ssh: u16,
}

/// Endpoints a started container publishes on the host.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PublishedPorts {
    /// Published HTTP endpoint.
    pub http: Endpoint,
    /// Published SSH endpoint.
    pub ssh: Endpoint,
}

/// Errors raised by container drivers.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ContainerError {
    /// Raised when a driver command cannot run or exits unsuccessfully.
    #[error("container command failed: {0}")]
    Command(#[from] CommandError),
    /// Raised when the runtime reports no identifier for a new container.
    #[error("container runtime returned no container id")]
    MissingId,
    /// Raised when a published port cannot be determined.
    #[error("could not resolve published port {internal}/tcp for {id}: {message}")]
    PortResolution {
        /// Container identifier.
        id: String,
        /// Port inside the container.
        internal: u16,
        /// Detail of the failure.
        message: String,
    },
    /// Raised when re-attaching to a container that is not running.
    #[error("container {id} is not running")]
    NotRunning {
        /// Container identifier.
        id: String,
    },
    /// Raised by in-memory drivers to simulate runtime failures.
    #[error("container runtime error: {0}")]
    Runtime(String),
}

/// Boxed future returned by [`ContainerDriver`] methods.
pub type DriverFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ContainerError>> + Send + 'a>>;

/// Minimal operations required to run the review service container.
///
/// Starting is split in two so the caller can record the container before
/// waiting on port resolution.
pub trait ContainerDriver: Send + Sync {
    /// Creates and starts a container named `request.name` and returns its
    /// runtime identifier.
    fn launch<'a>(&'a self, request: &'a ContainerRequest) -> DriverFuture<'a, String>;

    /// Resolves the host endpoints a started container publishes.
    fn published<'a>(&'a self, id: &'a str) -> DriverFuture<'a, PublishedPorts>;

    /// Confirms a previously started container is still running.
    fn attach<'a>(&'a self, handle: &'a ContainerHandle) -> DriverFuture<'a, ()>;

    /// Stops and removes the container with identifier or name `id`. A
    /// container that does not exist counts as removed.
    fn terminate<'a>(&'a self, id: &'a str) -> DriverFuture<'a, ()>;
}

/// Unique name for a new container.
#[must_use]
pub fn container_name() -> String {
    format!("gerrit-fixture-{}", Uuid::new_v4().simple())
}

/// Launches the container described by `request` and returns its id.
///
/// # Errors
///
/// Returns [`ContainerError`] when the driver fails.
pub async fn launch(
    driver: &dyn ContainerDriver,
    request: &ContainerRequest,
    span: &Span,
) -> Result<String, ContainerError> {
    debug!(
        parent: span,
        phase = "setup",
        task = "container",
        action = "launch",
        image = %request.image,
        name = %request.name,
    );
    driver.launch(request).await
}

/// Resolves the endpoints of the launched container `id` and rewrites the
/// HTTP endpoint's loopback address.
///
/// # Errors
///
/// Returns [`ContainerError`] when the ports cannot be resolved.
pub async fn publish(
    driver: &dyn ContainerDriver,
    request: &ContainerRequest,
    id: String,
    span: &Span,
) -> Result<ContainerHandle, ContainerError> {
    let ports = driver.published(&id).await?;
    let handle = ContainerHandle {
        id,
        image: request.image.clone(),
        http: ports.http.with_loopback_host(),
        ssh: ports.ssh,
    };
    debug!(
        parent: span,
        phase = "setup",
        task = "container",
        action = "started",
        id = %handle.id,
        http = %handle.http,
        ssh = %handle.ssh,
    );
    Ok(handle)
}
