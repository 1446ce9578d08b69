//! # devnet
//!
//! Local devnet clusters on a container engine.
//!
//! devnet provides:
//! - Declarative clusters (node, indexer, proof server, faucet) with catalog defaults
//! - Dependency-ordered startup gated on readiness probes
//! - Rollback of partially started clusters and aggregated teardown errors
//! - Scoped clusters that are removed on every exit path
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use devnet::{Cluster, ClusterBackend, DockerEngine, ImageCatalog, scoped};
//! use devnet_common::ResourceName;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> devnet_common::DevnetResult<()> {
//! let catalog = ImageCatalog::default();
//! let config = catalog.devnet_config(ResourceName::new("local")?, false);
//! let backend = ClusterBackend::docker(Arc::new(DockerEngine::connect(None).await?))?;
//! let cluster = Arc::new(Cluster::make(&config, &catalog, backend)?);
//!
//! scoped(cluster, &CancellationToken::new(), |endpoints| async move {
//!     println!("node at {:?}", endpoints.node_uri);
//!     Ok(())
//! })
//! .await
//! # }
//! ```

#![warn(missing_docs)]

pub mod catalog;
pub mod cli;
pub mod cluster;
pub mod container;
pub mod endpoints;
pub mod graph;
pub mod health;
pub mod network;
pub mod runtime;
pub mod scope;
pub mod spec;

pub use catalog::{ImageCatalog, ServiceKind};
pub use cluster::{Cluster, ClusterBackend, ClusterPhase};
pub use endpoints::NetworkConfig;
pub use runtime::{ContainerRuntime, DockerEngine};
pub use scope::{ClusterGuard, scoped};
pub use spec::{ClusterConfig, ClusterSpec};
