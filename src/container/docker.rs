//! [`ContainerDriver`] backed by the docker CLI.

use super::{
    ContainerDriver, ContainerError, ContainerHandle, ContainerRequest, DriverFuture, Endpoint,
    INTERNAL_HTTP_PORT, INTERNAL_SSH_PORT, PUBLISH_ADDRESS, PublishedPorts,
};
use crate::command::{CommandError, SharedRunner, args, run_blocking};

/// Fragment of `docker rm` stderr reporting an unknown container.
const NO_SUCH_CONTAINER: &str = "No such container";

/// Drives containers through `docker run`, `docker port`, `docker inspect`
/// and `docker rm`.
#[derive(Clone)]
pub struct DockerDriver {
    docker_bin: String,
    runner: SharedRunner,
}

impl std::fmt::Debug for DockerDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DockerDriver")
            .field("docker_bin", &self.docker_bin)
            .finish_non_exhaustive()
    }
}

impl DockerDriver {
    /// Creates a driver invoking `docker_bin` through `runner`.
    #[must_use]
    pub fn new(docker_bin: impl Into<String>, runner: SharedRunner) -> Self {
        Self {
            docker_bin: docker_bin.into(),
            runner,
        }
    }

    async fn docker(&self, parts: &[&str]) -> Result<String, ContainerError> {
        let output = run_blocking(&self.runner, &self.docker_bin, args(parts.iter().copied()))
            .await?
            .into_success(&self.docker_bin)?;
        Ok(output.stdout)
    }

    async fn published_port(&self, id: &str, internal: u16) -> Result<Endpoint, ContainerError> {
        let spec = format!("{internal}/tcp");
        let stdout = self
            .docker(&["port", id, &spec])
            .await
            .map_err(|err| ContainerError::PortResolution {
                id: id.to_owned(),
                internal,
                message: err.to_string(),
            })?;
        parse_port_line(&stdout).ok_or_else(|| ContainerError::PortResolution {
            id: id.to_owned(),
            internal,
            message: format!("unexpected output {:?}", stdout.trim()),
        })
    }

    async fn remove(&self, id: &str) -> Result<(), ContainerError> {
        match self.docker(&["rm", "-f", id]).await {
            Ok(_) => Ok(()),
            Err(ContainerError::Command(CommandError::Failure { ref stderr, .. }))
                if stderr.contains(NO_SUCH_CONTAINER) =>
            {
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

/// Formats a `-p` publish argument; port `0` leaves the host port empty so
/// the runtime picks one.
fn publish_arg(host_port: u16, internal: u16) -> String {
    if host_port == 0 {
        format!("{PUBLISH_ADDRESS}::{internal}")
    } else {
        format!("{PUBLISH_ADDRESS}:{host_port}:{internal}")
    }
}

/// Parses the first line of `docker port` output such as `127.0.0.1:49153`
/// or `[::1]:49153`.
fn parse_port_line(stdout: &str) -> Option<Endpoint> {
    let line = stdout.lines().map(str::trim).find(|line| !line.is_empty())?;
    let (raw_host, raw_port) = line.rsplit_once(':')?;
    let port = raw_port.parse::<u16>().ok()?;
    let host = raw_host.trim_start_matches('[').trim_end_matches(']');
    let address = if host.is_empty() || host == "0.0.0.0" {
        PUBLISH_ADDRESS
    } else {
        host
    };
    Some(Endpoint::new(address, port))
}

impl ContainerDriver for DockerDriver {
    fn launch<'a>(&'a self, request: &'a ContainerRequest) -> DriverFuture<'a, String> {
        Box::pin(async move {
            let http_arg = publish_arg(request.port_http, INTERNAL_HTTP_PORT);
            let ssh_arg = publish_arg(request.port_ssh, INTERNAL_SSH_PORT);
            let stdout = self
                .docker(&[
                    "run",
                    "-d",
                    "--name",
                    &request.name,
                    "-p",
                    &http_arg,
                    "-p",
                    &ssh_arg,
                    &request.image,
                ])
                .await?;
            stdout
                .lines()
                .map(str::trim)
                .rfind(|line| !line.is_empty())
                .map(str::to_owned)
                .ok_or(ContainerError::MissingId)
        })
    }

    fn published<'a>(&'a self, id: &'a str) -> DriverFuture<'a, PublishedPorts> {
        Box::pin(async move {
            let http = self.published_port(id, INTERNAL_HTTP_PORT).await?;
            let ssh = self.published_port(id, INTERNAL_SSH_PORT).await?;
            Ok(PublishedPorts { http, ssh })
        })
    }

    fn attach<'a>(&'a self, handle: &'a ContainerHandle) -> DriverFuture<'a, ()> {
        Box::pin(async move {
            let stdout = self
                .docker(&["inspect", "-f", "{{.State.Running}}", &handle.id])
                .await?;
            if stdout.trim() == "true" {
                Ok(())
            } else {
                Err(ContainerError::NotRunning {
                    id: handle.id.clone(),
                })
            }
        })
    }

    fn terminate<'a>(&'a self, id: &'a str) -> DriverFuture<'a, ()> {
        Box::pin(async move { self.remove(id).await })
    }
}
