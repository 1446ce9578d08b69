//! Cluster network management.

use std::collections::BTreeMap;

use async_trait::async_trait;
use devnet_common::DevnetResult;
use serde::{Deserialize, Serialize};

/// Label carrying the owning cluster's name.
pub const CLUSTER_LABEL: &str = "devnet.cluster";

/// Network options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkOptions {
    /// Network driver.
    #[serde(default = "default_driver")]
    pub driver: String,
    /// Disable external connectivity.
    #[serde(default)]
    pub internal: bool,
}

fn default_driver() -> String {
    "bridge".to_string()
}

impl Default for NetworkOptions {
    fn default() -> Self {
        Self {
            driver: default_driver(),
            internal: false,
        }
    }
}

/// A network to create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkRequest {
    /// Network name.
    pub name: String,
    /// Driver and isolation options.
    pub options: NetworkOptions,
    /// Engine labels.
    pub labels: BTreeMap<String, String>,
}

impl NetworkRequest {
    /// Request for a cluster's network.
    #[must_use]
    pub fn for_cluster(cluster: &str, name: String, options: NetworkOptions) -> Self {
        Self {
            name,
            options,
            labels: BTreeMap::from([(CLUSTER_LABEL.to_string(), cluster.to_string())]),
        }
    }
}

/// A created network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkHandle {
    /// Engine-assigned id.
    pub id: String,
    /// Network name.
    pub name: String,
}

/// Creates and removes isolated networks.
#[async_trait]
pub trait NetworkManager: Send + Sync {
    /// Create a network and return its id.
    ///
    /// Fails with `AlreadyExists` when a network of that name is present.
    async fn create_network(&self, request: &NetworkRequest) -> DevnetResult<String>;

    /// Remove a network by id or name. A missing network is not an error.
    async fn remove_network(&self, id: &str) -> DevnetResult<()>;
}
