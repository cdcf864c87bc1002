//! Per-resource ownership record consulted uniformly by teardown.
//!
//! A resource is owned when the orchestrator created it and is therefore
//! responsible for destroying it. Caller-supplied resources are recorded as
//! not owned and survive teardown.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Resource kinds an instance may own.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resource {
    /// The SSH control-master session.
    SshSession,
    /// The backing container.
    Container,
    /// The local git working directory.
    WorkingCopy,
    /// The generated private key file and its public companion.
    PrivateKey,
}

impl Resource {
    /// Every resource kind, in teardown order.
    pub const TEARDOWN_ORDER: [Self; 4] = [
        Self::SshSession,
        Self::Container,
        Self::WorkingCopy,
        Self::PrivateKey,
    ];

    /// Stable identifier used in logs and the descriptor.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SshSession => "ssh_session",
            Self::Container => "container",
            Self::WorkingCopy => "working_copy",
            Self::PrivateKey => "private_key",
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Map from resource kind to "owned by this instance".
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ownership(BTreeMap<Resource, bool>);

impl Default for Ownership {
    fn default() -> Self {
        Self(
            Resource::TEARDOWN_ORDER
                .into_iter()
                .map(|resource| (resource, false))
                .collect(),
        )
    }
}

impl Ownership {
    /// Records that the orchestrator created `resource`.
    pub fn claim(&mut self, resource: Resource) {
        self.0.insert(resource, true);
    }

    /// Records that `resource` is not ours to destroy, either because the
    /// caller supplied it or because it has already been torn down.
    pub fn release(&mut self, resource: Resource) {
        self.0.insert(resource, false);
    }

    /// Returns `true` when the instance must destroy `resource`.
    #[must_use]
    pub fn owns(&self, resource: Resource) -> bool {
        self.0.get(&resource).copied().unwrap_or(false)
    }

    /// Iterates owned resources in teardown order.
    pub fn owned(&self) -> impl Iterator<Item = Resource> + '_ {
        Resource::TEARDOWN_ORDER
            .into_iter()
            .filter(|resource| self.owns(*resource))
    }
}
