//! devnet CLI.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use color_eyre::eyre::{Result, bail};
use devnet_common::ResourceName;
use futures::StreamExt;
use serde::Serialize;
use tabled::{Table, Tabled};
use tokio_util::sync::CancellationToken;

use crate::catalog::{ImageCatalog, ServiceKind};
use crate::cluster::{Cluster, ClusterBackend};
use crate::runtime::{ContainerRuntime, DockerEngine};
use crate::scope::scoped;
use crate::spec::{ClusterConfig, ClusterSpec, ServiceConfig, ServiceSpec};

/// Cluster name used when neither the file nor `--name` sets one.
const DEFAULT_CLUSTER_NAME: &str = "devnet";

/// devnet - Local devnet clusters on a container engine
#[derive(Parser)]
#[command(name = "devnet")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to a cluster file; the standard devnet is used when omitted
    #[arg(short, long, env = "DEVNET_CONFIG")]
    pub file: Option<PathBuf>,

    /// Cluster name
    #[arg(short, long)]
    pub name: Option<String>,

    /// Include a faucet service
    #[arg(long)]
    pub faucet: bool,

    /// Publish every port on an engine-assigned host port
    #[arg(long)]
    pub ephemeral_ports: bool,

    /// Container engine endpoint
    #[arg(long, env = "DOCKER_HOST")]
    pub docker_host: Option<String>,

    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// devnet commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Start the cluster and print its endpoints
    Up {
        /// Leave the cluster running and exit
        #[arg(short, long)]
        detach: bool,
    },

    /// Remove the cluster's containers and network
    Down,

    /// Show the state of each service container
    Status,

    /// View service logs
    Logs {
        /// Follow log output
        #[arg(short, long)]
        follow: bool,

        /// Service name
        service: String,
    },

    /// Validate and show the resolved configuration
    Config {
        /// Output format
        #[arg(long, value_enum, default_value_t = OutputFormat::Yaml)]
        format: OutputFormat,
    },
}

/// Output format of `devnet config`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// YAML
    Yaml,
    /// JSON
    Json,
}

#[derive(Tabled)]
struct ServiceRow {
    #[tabled(rename = "SERVICE")]
    service: String,
    #[tabled(rename = "CONTAINER")]
    container: String,
    #[tabled(rename = "IMAGE")]
    image: String,
    #[tabled(rename = "STATE")]
    state: String,
    #[tabled(rename = "PORTS")]
    ports: String,
}

/// Resolved configuration as printed by `devnet config`.
#[derive(Serialize)]
struct ResolvedConfig<'a> {
    name: &'a str,
    network: String,
    network_id: &'a str,
    start_order: Vec<&'a str>,
    services: Vec<&'a ServiceSpec>,
}

impl<'a> ResolvedConfig<'a> {
    fn new(spec: &'a ClusterSpec) -> Self {
        Self {
            name: spec.name().as_str(),
            network: spec.network_name(),
            network_id: spec.network_id(),
            start_order: spec
                .start_order()
                .map(|service| service.name.as_str())
                .collect(),
            services: spec.services().iter().map(|service| &**service).collect(),
        }
    }
}

impl Cli {
    /// Execute the CLI command.
    pub async fn execute(self) -> Result<()> {
        let catalog = ImageCatalog::default();
        let config = self.load_config(&catalog)?;

        match self.command {
            Commands::Config { format } => {
                let spec = ClusterSpec::resolve(&config, &catalog)?;
                let resolved = ResolvedConfig::new(&spec);
                let output = match format {
                    OutputFormat::Yaml => serde_yaml::to_string(&resolved)?,
                    OutputFormat::Json => serde_json::to_string_pretty(&resolved)?,
                };
                println!("{}", output.trim_end());
                Ok(())
            }

            Commands::Up { detach } => {
                let engine = Arc::new(DockerEngine::connect(self.docker_host.as_deref()).await?);
                let cluster = Arc::new(Cluster::make(
                    &config,
                    &catalog,
                    ClusterBackend::docker(engine)?,
                )?);

                let cancel = CancellationToken::new();
                tokio::spawn({
                    let cancel = cancel.clone();
                    async move {
                        if tokio::signal::ctrl_c().await.is_ok() {
                            tracing::info!("Interrupted, shutting down");
                            cancel.cancel();
                        }
                    }
                });

                if detach {
                    let endpoints = cluster.start(&cancel).await?;
                    println!("{}", serde_json::to_string_pretty(&endpoints)?);
                    eprintln!(
                        "Cluster {} started; remove it with `devnet --name {} down`",
                        cluster.name(),
                        cluster.name()
                    );
                } else {
                    let shutdown = cancel.clone();
                    scoped(cluster, &cancel, |endpoints| async move {
                        println!("{}", serde_json::to_string_pretty(&endpoints)?);
                        eprintln!("Press Ctrl-C to stop the cluster");
                        shutdown.cancelled().await;
                        Ok(())
                    })
                    .await?;
                    eprintln!("Cluster removed");
                }
                Ok(())
            }

            Commands::Down => {
                let engine = Arc::new(DockerEngine::connect(self.docker_host.as_deref()).await?);
                let cluster = Cluster::make(&config, &catalog, ClusterBackend::docker(engine)?)?;
                cluster.remove_leftovers().await?;
                println!("Removed cluster {}", cluster.name());
                Ok(())
            }

            Commands::Status => {
                let spec = ClusterSpec::resolve(&config, &catalog)?;
                let engine = DockerEngine::connect(self.docker_host.as_deref()).await?;

                let mut rows = Vec::with_capacity(spec.services().len());
                for service in spec.start_order() {
                    let container = spec.container_name(service);
                    let (state, ports) = match engine.inspect(&container).await {
                        Ok(status) => (
                            status.state.to_string(),
                            status
                                .ports
                                .iter()
                                .map(|(container, host)| format!("{host}->{container}"))
                                .collect::<Vec<_>>()
                                .join(", "),
                        ),
                        Err(err) if err.is_not_found() => ("absent".to_string(), String::new()),
                        Err(err) => return Err(err.into()),
                    };
                    rows.push(ServiceRow {
                        service: service.name.to_string(),
                        container,
                        image: service.image.clone(),
                        state,
                        ports,
                    });
                }

                println!("{}", Table::new(rows));
                Ok(())
            }

            Commands::Logs { follow, service } => {
                let spec = ClusterSpec::resolve(&config, &catalog)?;
                let Some(service) = spec.service(&service) else {
                    bail!("no service named '{service}' in cluster {}", spec.name());
                };
                let container = spec.container_name(service);
                let engine = DockerEngine::connect(self.docker_host.as_deref()).await?;

                let mut lines = engine.logs(&container, follow);
                while let Some(line) = lines.next().await {
                    println!("{}", line?);
                }
                Ok(())
            }
        }
    }

    /// Build the cluster configuration from the file or the catalog plus flags.
    fn load_config(&self, catalog: &ImageCatalog) -> Result<ClusterConfig> {
        let mut config = match &self.file {
            Some(path) => {
                let mut config = ClusterConfig::from_file(path)?;
                let has_faucet = config.services.iter().any(|service| {
                    service.kind == Some(ServiceKind::Faucet)
                        || service.name.as_str() == ServiceKind::Faucet.as_str()
                });
                if self.faucet && !has_faucet {
                    config.services.push(ServiceConfig::of_kind(ServiceKind::Faucet));
                }
                config
            }
            None => catalog.devnet_config(ResourceName::new(DEFAULT_CLUSTER_NAME)?, self.faucet),
        };

        if let Some(name) = &self.name {
            config.name = ResourceName::new(name.as_str())?;
        }
        if self.ephemeral_ports {
            config = config.with_ephemeral_ports(catalog);
        }
        Ok(config)
    }
}
