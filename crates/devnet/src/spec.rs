//! Cluster configuration parsing and validation.
//!
//! A [`ClusterConfig`] is what users write (devnet.yaml) or what
//! [`ImageCatalog::devnet_config`] produces. [`ClusterSpec::resolve`] fills
//! gaps from the catalog, validates names, probes and the dependency graph,
//! and fixes the start order once.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use devnet_common::duration::{humanized, humanized_option};
use devnet_common::{DevnetError, DevnetResult, ResourceName};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::catalog::{ImageCatalog, ServiceKind};
use crate::graph::DependencyGraph;
use crate::health::Backoff;
use crate::network::NetworkOptions;

/// Cluster configuration (devnet.yaml).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Cluster name, prefix of every child resource.
    #[serde(default = "ResourceName::generate")]
    pub name: ResourceName,

    /// Host used to reach published ports.
    #[serde(default = "default_host")]
    pub host: String,

    /// Network identifier reported to SDK clients.
    #[serde(default = "default_network_id")]
    pub network_id: String,

    /// Cluster network options.
    #[serde(default)]
    pub network: NetworkOptions,

    /// Health check defaults for services that do not override them.
    #[serde(default)]
    pub health: HealthDefaults,

    /// Services in declaration order.
    pub services: Vec<ServiceConfig>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_network_id() -> String {
    "undeployed".to_string()
}

/// Cluster-wide health check defaults.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HealthDefaults {
    /// Maximum time a service may take to become healthy.
    #[serde(with = "humanized", default = "default_health_timeout")]
    pub timeout: Duration,
    /// Polling backoff.
    #[serde(default)]
    pub backoff: Backoff,
}

fn default_health_timeout() -> Duration {
    Duration::from_secs(120)
}

impl Default for HealthDefaults {
    fn default() -> Self {
        Self {
            timeout: default_health_timeout(),
            backoff: Backoff::default(),
        }
    }
}

/// Service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Service name.
    pub name: ResourceName,

    /// Service role; inferred from the name when omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ServiceKind>,

    /// Image reference; defaults from the catalog.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Port mappings; default from the catalog.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ports: Option<Vec<PortMapping>>,

    /// Environment variables, merged over the catalog's.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,

    /// Command override.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,

    /// Service dependencies; default from the catalog.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<Vec<String>>,

    /// Health check override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub healthcheck: Option<HealthcheckConfig>,
}

impl ServiceConfig {
    /// A service of the given kind with everything else from the catalog.
    #[must_use]
    pub fn of_kind(kind: ServiceKind) -> Self {
        Self {
            name: ResourceName::new(kind.as_str()).unwrap_or_else(|_| ResourceName::generate()),
            kind: Some(kind),
            image: None,
            ports: None,
            environment: BTreeMap::new(),
            command: Vec::new(),
            depends_on: None,
            healthcheck: None,
        }
    }
}

/// Health check override for one service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthcheckConfig {
    /// Probe definition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probe: Option<ProbeSpec>,
    /// Timeout override.
    #[serde(
        default,
        with = "humanized_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub timeout: Option<Duration>,
    /// Backoff override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff: Option<Backoff>,
}

/// Readiness probe definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProbeSpec {
    /// HTTP GET against a published container port; any 2xx is ready.
    Http {
        /// Container port.
        port: u16,
        /// Request path.
        #[serde(default = "default_probe_path")]
        path: String,
    },
    /// TCP connect against a published container port.
    Tcp {
        /// Container port.
        port: u16,
    },
    /// Regex match against the container's log output.
    Log {
        /// Pattern to search for.
        pattern: String,
    },
    /// Ready as soon as the engine reports the container running.
    Running,
}

fn default_probe_path() -> String {
    "/".to_string()
}

impl fmt::Display for ProbeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http { port, path } => write!(f, "http :{port}{path}"),
            Self::Tcp { port } => write!(f, "tcp :{port}"),
            Self::Log { pattern } => write!(f, "log /{pattern}/"),
            Self::Running => write!(f, "running"),
        }
    }
}

/// A published port: `"9944"` (engine-assigned host port) or `"19944:9944"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawPort", into = "String")]
pub struct PortMapping {
    /// Port inside the container.
    pub container: u16,
    /// Fixed host port; `None` lets the engine pick one.
    pub host: Option<u16>,
}

impl PortMapping {
    /// Publish on the same port number on the host.
    #[must_use]
    pub const fn fixed(port: u16) -> Self {
        Self {
            container: port,
            host: Some(port),
        }
    }

    /// Publish on an engine-assigned host port.
    #[must_use]
    pub const fn ephemeral(container: u16) -> Self {
        Self {
            container,
            host: None,
        }
    }
}

impl fmt::Display for PortMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.host {
            Some(host) => write!(f, "{host}:{}", self.container),
            None => write!(f, "{}", self.container),
        }
    }
}

impl FromStr for PortMapping {
    type Err = DevnetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse = |part: &str| {
            part.trim()
                .parse::<u16>()
                .ok()
                .filter(|port| *port != 0)
                .ok_or_else(|| DevnetError::config(format!("invalid port mapping '{s}'")))
        };

        match s.split_once(':') {
            Some((host, container)) => Ok(Self {
                container: parse(container)?,
                host: Some(parse(host)?),
            }),
            None => Ok(Self::ephemeral(parse(s)?)),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawPort {
    Number(u16),
    Text(String),
}

impl TryFrom<RawPort> for PortMapping {
    type Error = DevnetError;

    fn try_from(raw: RawPort) -> Result<Self, Self::Error> {
        match raw {
            RawPort::Number(port) => port.to_string().parse(),
            RawPort::Text(text) => text.parse(),
        }
    }
}

impl From<PortMapping> for String {
    fn from(port: PortMapping) -> Self {
        port.to_string()
    }
}

impl ClusterConfig {
    /// Create a configuration with default host, network and health settings.
    #[must_use]
    pub fn new(name: ResourceName, services: Vec<ServiceConfig>) -> Self {
        Self {
            name,
            host: default_host(),
            network_id: default_network_id(),
            network: NetworkOptions::default(),
            health: HealthDefaults::default(),
            services,
        }
    }

    /// Parse from YAML.
    pub fn from_yaml(yaml: &str) -> DevnetResult<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Parse from file.
    pub fn from_file(path: &Path) -> DevnetResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Publish every port on an engine-assigned host port so clusters can coexist.
    ///
    /// Applies to explicit port lists and to the catalog defaults alike.
    #[must_use]
    pub fn with_ephemeral_ports(mut self, catalog: &ImageCatalog) -> Self {
        for service in &mut self.services {
            let ports = service.ports.take().or_else(|| {
                service
                    .kind
                    .or_else(|| ServiceKind::from_name(service.name.as_str()))
                    .and_then(|kind| catalog.lookup(kind))
                    .map(|entry| entry.ports.clone())
            });
            service.ports = ports.map(|ports| {
                ports
                    .into_iter()
                    .map(|port| PortMapping::ephemeral(port.container))
                    .collect()
            });
        }
        self
    }
}

/// Fully resolved health check of a service.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthCheck {
    /// Probe definition.
    pub probe: ProbeSpec,
    /// Maximum time to become healthy.
    #[serde(with = "humanized")]
    pub timeout: Duration,
    /// Polling backoff.
    pub backoff: Backoff,
}

/// Fully resolved, validated service.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceSpec {
    /// Service name.
    pub name: ResourceName,
    /// Service role, if known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<ServiceKind>,
    /// Image reference.
    pub image: String,
    /// Published ports.
    pub ports: Vec<PortMapping>,
    /// Environment variables.
    pub environment: BTreeMap<String, String>,
    /// Command override.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    /// Services that must be healthy first.
    pub depends_on: Vec<ResourceName>,
    /// Health check.
    pub health: HealthCheck,
}

impl ServiceSpec {
    /// Container port clients connect to: the kind's API port if published, else the first port.
    #[must_use]
    pub fn api_port(&self) -> Option<u16> {
        let preferred = self.kind.map(|kind| kind.api_port());
        self.ports
            .iter()
            .map(|port| port.container)
            .find(|port| Some(*port) == preferred)
            .or_else(|| self.ports.first().map(|port| port.container))
    }
}

/// Immutable, validated cluster specification.
#[derive(Debug, Clone)]
pub struct ClusterSpec {
    name: ResourceName,
    host: String,
    network_id: String,
    network: NetworkOptions,
    services: Vec<Arc<ServiceSpec>>,
    start_order: Vec<usize>,
}

impl ClusterSpec {
    /// Resolve a configuration against the catalog and validate it.
    ///
    /// # Errors
    ///
    /// Returns [`DevnetError::Config`] for duplicate or unknown services, a
    /// dependency cycle, a missing image, or a malformed probe.
    pub fn resolve(config: &ClusterConfig, catalog: &ImageCatalog) -> DevnetResult<Self> {
        if config.services.is_empty() {
            return Err(DevnetError::config(format!(
                "cluster '{}' has no services",
                config.name
            )));
        }

        let mut index_by_name: HashMap<&str, usize> = HashMap::new();
        let mut index_by_kind: HashMap<ServiceKind, usize> = HashMap::new();
        for (index, service) in config.services.iter().enumerate() {
            if index_by_name.insert(service.name.as_str(), index).is_some() {
                return Err(DevnetError::config(format!(
                    "duplicate service name '{}'",
                    service.name
                )));
            }
            if let Some(kind) = resolve_kind(service) {
                if let Some(previous) = index_by_kind.insert(kind, index) {
                    return Err(DevnetError::config(format!(
                        "services '{}' and '{}' both have kind {kind}",
                        config.services[previous].name, service.name
                    )));
                }
            }
        }

        let mut graph = DependencyGraph::new(config.services.len());
        let mut services = Vec::with_capacity(config.services.len());

        for (index, service) in config.services.iter().enumerate() {
            let kind = resolve_kind(service);
            let entry = kind.and_then(|kind| catalog.lookup(kind));

            let image = service
                .image
                .clone()
                .or_else(|| entry.map(|entry| entry.image.clone()))
                .ok_or_else(|| {
                    DevnetError::config(format!(
                        "service '{}' has no image and no known kind",
                        service.name
                    ))
                })?;

            let ports = service
                .ports
                .clone()
                .or_else(|| entry.map(|entry| entry.ports.clone()))
                .unwrap_or_default();

            let mut environment = entry
                .map(|entry| entry.environment.clone())
                .unwrap_or_default();
            environment.extend(service.environment.clone());

            let dependency_indices: Vec<usize> = match &service.depends_on {
                Some(names) => names
                    .iter()
                    .map(|name| {
                        index_by_name.get(name.as_str()).copied().ok_or_else(|| {
                            DevnetError::config(format!(
                                "service '{}' depends on unknown service '{name}'",
                                service.name
                            ))
                        })
                    })
                    .collect::<DevnetResult<_>>()?,
                // Catalog defaults only link services present in this cluster
                None => entry
                    .map(|entry| {
                        entry
                            .depends_on
                            .iter()
                            .filter_map(|kind| index_by_kind.get(kind).copied())
                            .collect()
                    })
                    .unwrap_or_default(),
            };
            for &dependency in &dependency_indices {
                graph.add_dependency(index, dependency);
            }

            let overrides = service.healthcheck.clone().unwrap_or_default();
            let probe = overrides
                .probe
                .or_else(|| entry.map(|entry| entry.probe.clone()))
                .unwrap_or(ProbeSpec::Running);
            validate_probe(&service.name, &probe, &ports)?;

            services.push(Arc::new(ServiceSpec {
                name: service.name.clone(),
                kind,
                image,
                ports,
                environment,
                command: service.command.clone(),
                depends_on: dependency_indices
                    .iter()
                    .map(|&dependency| config.services[dependency].name.clone())
                    .collect(),
                health: HealthCheck {
                    probe,
                    timeout: overrides.timeout.unwrap_or(config.health.timeout),
                    backoff: overrides.backoff.unwrap_or(config.health.backoff),
                },
            }));
        }

        let start_order = graph.topological_order().map_err(|stuck| {
            let names: Vec<&str> = stuck
                .iter()
                .map(|&index| config.services[index].name.as_str())
                .collect();
            DevnetError::config(format!(
                "circular dependency between services: {}",
                names.join(", ")
            ))
        })?;

        Ok(Self {
            name: config.name.clone(),
            host: config.host.clone(),
            network_id: config.network_id.clone(),
            network: config.network.clone(),
            services,
            start_order,
        })
    }

    /// Cluster name.
    #[must_use]
    pub fn name(&self) -> &ResourceName {
        &self.name
    }

    /// Host used to reach published ports.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Network identifier reported to SDK clients.
    #[must_use]
    pub fn network_id(&self) -> &str {
        &self.network_id
    }

    /// Cluster network options.
    #[must_use]
    pub fn network(&self) -> &NetworkOptions {
        &self.network
    }

    /// Name of the cluster network.
    #[must_use]
    pub fn network_name(&self) -> String {
        self.name.child("net")
    }

    /// Name of a service's container.
    #[must_use]
    pub fn container_name(&self, service: &ServiceSpec) -> String {
        self.name.child(service.name.as_str())
    }

    /// Services in declaration order.
    #[must_use]
    pub fn services(&self) -> &[Arc<ServiceSpec>] {
        &self.services
    }

    /// Look up a service by name.
    #[must_use]
    pub fn service(&self, name: &str) -> Option<&Arc<ServiceSpec>> {
        self.services.iter().find(|service| service.name.as_str() == name)
    }

    /// Services in start order: dependencies first, ties by declaration order.
    pub fn start_order(&self) -> impl Iterator<Item = &Arc<ServiceSpec>> {
        self.start_order.iter().map(|&index| &self.services[index])
    }
}

fn resolve_kind(service: &ServiceConfig) -> Option<ServiceKind> {
    service
        .kind
        .or_else(|| ServiceKind::from_name(service.name.as_str()))
}

fn validate_probe(service: &ResourceName, probe: &ProbeSpec, ports: &[PortMapping]) -> DevnetResult<()> {
    let require_port = |port: u16| {
        if ports.iter().any(|mapping| mapping.container == port) {
            Ok(())
        } else {
            Err(DevnetError::config(format!(
                "service '{service}' probes port {port}, which is not published"
            )))
        }
    };

    match probe {
        ProbeSpec::Http { port, path } => {
            if !path.starts_with('/') {
                return Err(DevnetError::config(format!(
                    "service '{service}' probe path '{path}' must start with '/'"
                )));
            }
            require_port(*port)
        }
        ProbeSpec::Tcp { port } => require_port(*port),
        ProbeSpec::Log { pattern } => Regex::new(pattern).map(|_| ()).map_err(|err| {
            DevnetError::config(format!("service '{service}' has an invalid log pattern: {err}"))
        }),
        ProbeSpec::Running => Ok(()),
    }
}
