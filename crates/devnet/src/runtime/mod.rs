//! Container engine abstraction.
//!
//! [`ContainerRuntime`] is the seam between the cluster lifecycle and the
//! engine. [`DockerEngine`] implements it (and [`NetworkManager`]) against the
//! Docker Engine API.
//!
//! [`NetworkManager`]: crate::network::NetworkManager

mod docker;

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use devnet_common::DevnetResult;
use futures::stream::BoxStream;

use crate::network::CLUSTER_LABEL;
use crate::spec::{ClusterSpec, PortMapping, ServiceSpec};

pub use docker::DockerEngine;

/// Label carrying the service name.
pub const SERVICE_LABEL: &str = "devnet.service";

/// Everything needed to create one service container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateRequest {
    /// Container name.
    pub name: String,
    /// Image reference.
    pub image: String,
    /// Environment variables.
    pub environment: BTreeMap<String, String>,
    /// Command override; empty keeps the image default.
    pub command: Vec<String>,
    /// Published ports.
    pub ports: Vec<PortMapping>,
    /// Network to attach to.
    pub network: String,
    /// DNS alias on that network.
    pub alias: String,
    /// Engine labels.
    pub labels: BTreeMap<String, String>,
}

impl CreateRequest {
    /// Request for a service's container within a cluster.
    #[must_use]
    pub fn for_service(cluster: &ClusterSpec, service: &ServiceSpec) -> Self {
        Self {
            name: cluster.container_name(service),
            image: service.image.clone(),
            environment: service.environment.clone(),
            command: service.command.clone(),
            ports: service.ports.clone(),
            network: cluster.network_name(),
            alias: service.name.to_string(),
            labels: BTreeMap::from([
                (CLUSTER_LABEL.to_string(), cluster.name().to_string()),
                (SERVICE_LABEL.to_string(), service.name.to_string()),
            ]),
        }
    }
}

/// Engine-side container state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Created, never started.
    Created,
    /// Running.
    Running,
    /// Paused.
    Paused,
    /// Restarting.
    Restarting,
    /// Exited.
    Exited,
    /// Being removed or dead.
    Dead,
    /// Anything the engine reports that is not listed above.
    Unknown,
}

impl EngineState {
    /// Whether the container process is up.
    #[must_use]
    pub const fn is_running(self) -> bool {
        matches!(self, Self::Running)
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Restarting => "restarting",
            Self::Exited => "exited",
            Self::Dead => "dead",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Result of inspecting a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerStatus {
    /// Engine-assigned id.
    pub id: String,
    /// Engine state.
    pub state: EngineState,
    /// Exit code, once exited.
    pub exit_code: Option<i64>,
    /// Published ports, container port to host port.
    pub ports: BTreeMap<u16, u16>,
}

/// Options for [`ContainerRuntime::remove`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoveOptions {
    /// Kill the container if it is still running.
    pub force: bool,
}

/// Container operations used by the cluster lifecycle.
///
/// Implementations map engine failures onto `EngineUnreachable`, `NotFound`,
/// `AlreadyExists` and `OperationFailed`.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create a container and return its id.
    async fn create_container(&self, request: &CreateRequest) -> DevnetResult<String>;

    /// Start a created container.
    async fn start(&self, id: &str) -> DevnetResult<()>;

    /// Stop a container. Stopping a stopped container is a no-op.
    async fn stop(&self, id: &str) -> DevnetResult<()>;

    /// Remove a container.
    async fn remove(&self, id: &str, options: RemoveOptions) -> DevnetResult<()>;

    /// Inspect a container's state and published ports.
    async fn inspect(&self, id: &str) -> DevnetResult<ContainerStatus>;

    /// Stream log lines (stdout and stderr). Without `follow` the stream ends
    /// at the current end of the log.
    fn logs<'a>(&'a self, id: &'a str, follow: bool) -> BoxStream<'a, DevnetResult<String>>;
}
