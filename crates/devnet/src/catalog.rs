//! Default images, ports and probes for the devnet services.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use devnet_common::{DevnetError, ResourceName};
use serde::{Deserialize, Serialize};

use crate::spec::{ClusterConfig, PortMapping, ProbeSpec, ServiceConfig};

/// Logical role of a service within a devnet cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceKind {
    /// Blockchain node.
    Node,
    /// Chain indexer.
    Indexer,
    /// Zero-knowledge proof server.
    ProofServer,
    /// Token faucet.
    Faucet,
}

impl ServiceKind {
    /// All kinds in their canonical start order.
    pub const ALL: [Self; 4] = [Self::Node, Self::Indexer, Self::ProofServer, Self::Faucet];

    /// The conventional service name for this kind.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Node => "node",
            Self::Indexer => "indexer",
            Self::ProofServer => "proof-server",
            Self::Faucet => "faucet",
        }
    }

    /// Infer the kind from a conventional service name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }

    /// Container port serving the API clients connect to.
    #[must_use]
    pub const fn api_port(&self) -> u16 {
        match self {
            Self::Node => 9944,
            Self::Indexer => 8088,
            Self::ProofServer => 6300,
            Self::Faucet => 8080,
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceKind {
    type Err = DevnetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s).ok_or_else(|| DevnetError::config(format!("unknown service kind '{s}'")))
    }
}

/// Catalog entry for one service kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    /// Image reference.
    pub image: String,
    /// Published ports.
    pub ports: Vec<PortMapping>,
    /// Readiness probe.
    pub probe: ProbeSpec,
    /// Kinds this service waits for.
    pub depends_on: Vec<ServiceKind>,
    /// Environment variables.
    pub environment: BTreeMap<String, String>,
}

/// Static mapping from service kind to image and default settings.
#[derive(Debug, Clone)]
pub struct ImageCatalog {
    entries: BTreeMap<ServiceKind, CatalogEntry>,
}

impl Default for ImageCatalog {
    fn default() -> Self {
        let http = |kind: ServiceKind, path: &str| ProbeSpec::Http {
            port: kind.api_port(),
            path: path.to_string(),
        };
        let fixed = |kind: ServiceKind| vec![PortMapping::fixed(kind.api_port())];

        let mut entries = BTreeMap::new();
        entries.insert(
            ServiceKind::Node,
            CatalogEntry {
                image: "midnightnetwork/midnight-node:latest".to_string(),
                ports: fixed(ServiceKind::Node),
                probe: http(ServiceKind::Node, "/health"),
                depends_on: Vec::new(),
                environment: BTreeMap::from([("CFG_PRESET".to_string(), "dev".to_string())]),
            },
        );
        entries.insert(
            ServiceKind::Indexer,
            CatalogEntry {
                image: "midnightnetwork/indexer-standalone:latest".to_string(),
                ports: fixed(ServiceKind::Indexer),
                probe: http(ServiceKind::Indexer, "/ready"),
                depends_on: vec![ServiceKind::Node],
                // Service names resolve through network aliases
                environment: BTreeMap::from([(
                    "APP__INFRA__NODE__URL".to_string(),
                    "ws://node:9944".to_string(),
                )]),
            },
        );
        entries.insert(
            ServiceKind::ProofServer,
            CatalogEntry {
                image: "midnightnetwork/proof-server:latest".to_string(),
                ports: fixed(ServiceKind::ProofServer),
                probe: http(ServiceKind::ProofServer, "/"),
                depends_on: vec![ServiceKind::Node],
                environment: BTreeMap::new(),
            },
        );
        entries.insert(
            ServiceKind::Faucet,
            CatalogEntry {
                image: "midnightnetwork/faucet:latest".to_string(),
                ports: fixed(ServiceKind::Faucet),
                probe: http(ServiceKind::Faucet, "/health"),
                depends_on: vec![ServiceKind::Node, ServiceKind::Indexer],
                environment: BTreeMap::from([
                    ("NODE_URL".to_string(), "ws://node:9944".to_string()),
                    (
                        "INDEXER_URL".to_string(),
                        "http://indexer:8088/api/v1/graphql".to_string(),
                    ),
                ]),
            },
        );

        Self { entries }
    }
}

impl ImageCatalog {
    /// Look up the entry for a kind.
    #[must_use]
    pub fn lookup(&self, kind: ServiceKind) -> Option<&CatalogEntry> {
        self.entries.get(&kind)
    }

    /// Override the image used for a kind.
    #[must_use]
    pub fn with_image(mut self, kind: ServiceKind, image: impl Into<String>) -> Self {
        if let Some(entry) = self.entries.get_mut(&kind) {
            entry.image = image.into();
        }
        self
    }

    /// Build the standard devnet cluster: node, indexer, proof server and optionally a faucet.
    ///
    /// Images, ports, probes and dependencies are left unset so they resolve
    /// from this catalog when the cluster is made.
    #[must_use]
    pub fn devnet_config(&self, name: ResourceName, include_faucet: bool) -> ClusterConfig {
        let services = ServiceKind::ALL
            .into_iter()
            .filter(|kind| include_faucet || *kind != ServiceKind::Faucet)
            .filter(|kind| self.entries.contains_key(kind))
            .map(ServiceConfig::of_kind)
            .collect();

        ClusterConfig::new(name, services)
    }
}
