//! Client-facing endpoints of a started cluster.

use serde::{Deserialize, Serialize};

use crate::catalog::ServiceKind;
use crate::container::{ContainerHandle, ContainerState};
use crate::spec::ClusterSpec;

/// Endpoints SDK clients use to reach a started cluster.
///
/// Only healthy services with a known kind contribute a URI; absent services
/// are omitted from the serialized form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkConfig {
    /// Node RPC endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_uri: Option<String>,
    /// Indexer GraphQL endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub indexer_uri: Option<String>,
    /// Indexer GraphQL websocket endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub indexer_ws_uri: Option<String>,
    /// Proof server endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proof_server_uri: Option<String>,
    /// Faucet endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub faucet_uri: Option<String>,
    /// Network identifier.
    pub network_id: String,
}

impl NetworkConfig {
    /// Resolve endpoints from the cluster's healthy containers.
    #[must_use]
    pub fn resolve(spec: &ClusterSpec, handles: &[ContainerHandle]) -> Self {
        let mut config = Self {
            node_uri: None,
            indexer_uri: None,
            indexer_ws_uri: None,
            proof_server_uri: None,
            faucet_uri: None,
            network_id: spec.network_id().to_string(),
        };

        for handle in handles
            .iter()
            .filter(|handle| handle.state == ContainerState::Healthy)
        {
            let Some(kind) = handle.service.kind else {
                continue;
            };
            let Some(port) = handle
                .service
                .api_port()
                .and_then(|port| handle.host_port(port))
            else {
                tracing::warn!(service = %handle.service.name, "No published API port, omitting endpoint");
                continue;
            };
            let authority = format!("{}:{port}", spec.host());

            match kind {
                ServiceKind::Node => config.node_uri = Some(format!("http://{authority}")),
                ServiceKind::Indexer => {
                    config.indexer_uri = Some(format!("http://{authority}/api/v1/graphql"));
                    config.indexer_ws_uri = Some(format!("ws://{authority}/api/v1/graphql/ws"));
                }
                ServiceKind::ProofServer => {
                    config.proof_server_uri = Some(format!("http://{authority}"));
                }
                ServiceKind::Faucet => config.faucet_uri = Some(format!("http://{authority}")),
            }
        }

        config
    }
}
