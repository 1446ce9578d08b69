//! Container handles and their lifecycle state machine.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use devnet_common::{DevnetError, DevnetResult};
use serde::Serialize;

use crate::spec::ServiceSpec;

/// Lifecycle state of a cluster-owned container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    /// Created in the engine, not started.
    Created,
    /// Start requested.
    Starting,
    /// Engine reports it running; not yet probed healthy.
    Running,
    /// Health probe succeeded.
    Healthy,
    /// Health probe never succeeded within its timeout.
    Unhealthy,
    /// Teardown in progress.
    Stopping,
    /// Stopped and removed from the engine.
    Removed,
    /// Teardown exhausted its retries.
    Failed,
}

impl ContainerState {
    /// Whether teardown has finished with this container, successfully or not.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Removed | Self::Failed)
    }

    /// Whether moving to `next` is a legal transition.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        use ContainerState::{Created, Failed, Healthy, Removed, Running, Starting, Stopping, Unhealthy};

        match (self, next) {
            (Created, Starting) | (Starting, Running) | (Running, Healthy | Unhealthy) => true,
            (Stopping, Removed | Failed) => true,
            // Removing again re-runs teardown; failed containers are retried
            (_, Stopping) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
            Self::Stopping => "stopping",
            Self::Removed => "removed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A container created for one service of a cluster.
#[derive(Debug, Clone, Serialize)]
pub struct ContainerHandle {
    /// Engine-assigned id.
    pub id: String,
    /// Container name (`<cluster>-<service>`).
    pub name: String,
    /// Service this container runs.
    pub service: Arc<ServiceSpec>,
    /// Current lifecycle state.
    pub state: ContainerState,
    /// Published ports, container port to host port.
    pub ports: BTreeMap<u16, u16>,
}

impl ContainerHandle {
    /// A freshly created container.
    #[must_use]
    pub fn new(id: String, name: String, service: Arc<ServiceSpec>) -> Self {
        Self {
            id,
            name,
            service,
            state: ContainerState::Created,
            ports: BTreeMap::new(),
        }
    }

    /// Move to `next`, rejecting illegal transitions.
    pub fn transition(&mut self, next: ContainerState) -> DevnetResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(DevnetError::invalid_state(
                format!("move container {} to {next}", self.name),
                self.state,
            ));
        }
        tracing::debug!(container = %self.name, from = %self.state, to = %next, "Container state change");
        self.state = next;
        Ok(())
    }

    /// Host port published for a container port.
    #[must_use]
    pub fn host_port(&self, container_port: u16) -> Option<u16> {
        self.ports.get(&container_port).copied()
    }
}
