//! Cluster lifecycle: make, start, remove.

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use devnet_common::{DevnetError, DevnetResult, ResourceName};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::catalog::ImageCatalog;
use crate::container::{ContainerHandle, ContainerState};
use crate::endpoints::NetworkConfig;
use crate::health::{Backoff, EngineProbes, HealthChecker, ProbeFactory};
use crate::network::{NetworkHandle, NetworkManager, NetworkRequest};
use crate::runtime::{ContainerRuntime, CreateRequest, DockerEngine, RemoveOptions};
use crate::spec::{ClusterConfig, ClusterSpec, ServiceSpec};

/// Attempts per teardown step before it counts as failed.
const TEARDOWN_ATTEMPTS: u32 = 3;

const TEARDOWN_BACKOFF: Backoff = Backoff {
    initial: Duration::from_millis(200),
    factor: 2.0,
    max_delay: Duration::from_secs(1),
};

/// Names of clusters alive in this process.
static LIVE_CLUSTERS: Lazy<Mutex<HashSet<String>>> = Lazy::new(|| Mutex::new(HashSet::new()));

/// Reserves a cluster name for the lifetime of a [`Cluster`].
#[derive(Debug)]
struct NameLease(String);

impl NameLease {
    fn acquire(name: &ResourceName) -> DevnetResult<Self> {
        if LIVE_CLUSTERS.lock().insert(name.to_string()) {
            Ok(Self(name.to_string()))
        } else {
            Err(DevnetError::config(format!(
                "a cluster named '{name}' already exists in this process"
            )))
        }
    }
}

impl Drop for NameLease {
    fn drop(&mut self) {
        LIVE_CLUSTERS.lock().remove(&self.0);
    }
}

/// Engine-facing collaborators of a cluster.
#[derive(Clone)]
pub struct ClusterBackend {
    /// Container operations.
    pub runtime: Arc<dyn ContainerRuntime>,
    /// Network operations.
    pub networks: Arc<dyn NetworkManager>,
    /// Readiness probe construction.
    pub probes: Arc<dyn ProbeFactory>,
}

impl ClusterBackend {
    /// Backend talking to a Docker engine.
    pub fn docker(engine: Arc<DockerEngine>) -> DevnetResult<Self> {
        let runtime: Arc<dyn ContainerRuntime> = engine.clone();
        let probes = EngineProbes::new(Arc::clone(&runtime))?;
        Ok(Self {
            runtime,
            networks: engine,
            probes: Arc::new(probes),
        })
    }
}

impl fmt::Debug for ClusterBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterBackend").finish_non_exhaustive()
    }
}

/// Lifecycle phase of a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterPhase {
    /// Made; nothing exists in the engine.
    Created,
    /// `start` in flight.
    Starting,
    /// Every service healthy.
    Started,
    /// `remove` in flight.
    Removing,
    /// Torn down (after `remove` or a rolled-back `start`).
    Removed,
    /// A lifecycle future was dropped mid-flight; only `remove` is allowed.
    Interrupted,
}

impl fmt::Display for ClusterPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Starting => "starting",
            Self::Started => "started",
            Self::Removing => "removing",
            Self::Removed => "removed",
            Self::Interrupted => "interrupted",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
struct ClusterState {
    phase: ClusterPhase,
    containers: Vec<ContainerHandle>,
    network: Option<NetworkHandle>,
    network_config: Option<NetworkConfig>,
}

/// Marks the cluster interrupted unless the operation settles it.
struct PhaseGuard<'a> {
    cluster: &'a Cluster,
    operation: &'static str,
    previous: ClusterPhase,
    settled: bool,
}

impl PhaseGuard<'_> {
    fn settle(mut self, phase: ClusterPhase) {
        self.cluster.state.lock().phase = phase;
        self.settled = true;
    }
}

impl Drop for PhaseGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.cluster.state.lock().phase = ClusterPhase::Interrupted;
            tracing::warn!(
                cluster = %self.cluster.spec.name(),
                operation = self.operation,
                "Lifecycle operation interrupted; call remove to clean up"
            );
        }
    }
}

/// What a teardown step targets.
struct TeardownTarget {
    /// Index into the recorded handles; `None` for containers found by name only.
    index: Option<usize>,
    id: String,
    name: String,
}

/// A devnet cluster: one network plus one container per service.
///
/// The cluster is the sole writer of its container handles. At most one
/// lifecycle operation runs at a time; a second concurrent call fails with
/// [`DevnetError::InvalidState`].
pub struct Cluster {
    spec: Arc<ClusterSpec>,
    backend: ClusterBackend,
    state: Mutex<ClusterState>,
    _lease: NameLease,
}

impl Cluster {
    /// Resolve and validate `config`. Makes no engine calls.
    ///
    /// # Errors
    ///
    /// [`DevnetError::Config`] for an invalid configuration, a dependency
    /// cycle, or a name already used by a live cluster in this process.
    pub fn make(
        config: &ClusterConfig,
        catalog: &ImageCatalog,
        backend: ClusterBackend,
    ) -> DevnetResult<Self> {
        let spec = ClusterSpec::resolve(config, catalog)?;
        Self::from_spec(spec, backend)
    }

    /// Wrap an already resolved spec.
    pub fn from_spec(spec: ClusterSpec, backend: ClusterBackend) -> DevnetResult<Self> {
        let lease = NameLease::acquire(spec.name())?;
        tracing::debug!(
            cluster = %spec.name(),
            order = ?spec.start_order().map(|service| service.name.as_str()).collect::<Vec<_>>(),
            "Resolved start order"
        );

        Ok(Self {
            spec: Arc::new(spec),
            backend,
            state: Mutex::new(ClusterState {
                phase: ClusterPhase::Created,
                containers: Vec::new(),
                network: None,
                network_config: None,
            }),
            _lease: lease,
        })
    }

    /// The validated specification.
    #[must_use]
    pub fn spec(&self) -> &ClusterSpec {
        &self.spec
    }

    /// Cluster name.
    #[must_use]
    pub fn name(&self) -> &ResourceName {
        self.spec.name()
    }

    /// Current lifecycle phase.
    #[must_use]
    pub fn phase(&self) -> ClusterPhase {
        self.state.lock().phase
    }

    /// Snapshot of the container handles in creation order.
    #[must_use]
    pub fn handles(&self) -> Vec<ContainerHandle> {
        self.state.lock().containers.clone()
    }

    /// Endpoints of the started cluster.
    ///
    /// # Errors
    ///
    /// [`DevnetError::InvalidState`] unless the cluster is started.
    pub fn network_config(&self) -> DevnetResult<NetworkConfig> {
        let state = self.state.lock();
        match (&state.network_config, state.phase) {
            (Some(config), ClusterPhase::Started) => Ok(config.clone()),
            (_, phase) => Err(DevnetError::invalid_state("read the network config", phase)),
        }
    }

    /// Create the network and start every service in dependency order.
    ///
    /// Each service becomes healthy before any dependent is created. On
    /// failure or cancellation everything created so far is torn down in
    /// reverse order before the error is returned.
    ///
    /// # Errors
    ///
    /// - [`DevnetError::StartupFailed`] naming the service that failed
    /// - [`DevnetError::Cancelled`] when `cancel` fires
    /// - [`DevnetError::EngineUnreachable`] when the engine cannot be reached
    /// - [`DevnetError::Config`] when the cluster network already exists
    /// - [`DevnetError::InvalidState`] unless the cluster was just made
    pub async fn start(&self, cancel: &CancellationToken) -> DevnetResult<NetworkConfig> {
        let guard = self.begin("start", &[ClusterPhase::Created], ClusterPhase::Starting)?;
        tracing::info!(cluster = %self.spec.name(), services = self.spec.services().len(), "Starting cluster");

        match self.bring_up(cancel).await {
            Ok(config) => {
                self.state.lock().network_config = Some(config.clone());
                guard.settle(ClusterPhase::Started);
                tracing::info!(cluster = %self.spec.name(), "Cluster started");
                Ok(config)
            }
            Err(err) => {
                tracing::error!(cluster = %self.spec.name(), error = %err, "Cluster start failed, rolling back");
                let err = match self.teardown(false).await {
                    Ok(()) => err,
                    Err(teardown) => self.with_rollback_failures(err, teardown),
                };
                guard.settle(ClusterPhase::Removed);
                Err(err)
            }
        }
    }

    /// Stop and remove every container in reverse creation order, then the network.
    ///
    /// Resources that are already gone count as removed, so calling this
    /// again is safe. A never-started cluster has nothing to remove.
    ///
    /// # Errors
    ///
    /// - [`DevnetError::TeardownFailed`] with every step that failed, after all steps ran
    /// - [`DevnetError::InvalidState`] while another lifecycle operation is in flight
    pub async fn remove(&self) -> DevnetResult<()> {
        let guard = self.begin(
            "remove",
            &[
                ClusterPhase::Created,
                ClusterPhase::Started,
                ClusterPhase::Removed,
                ClusterPhase::Interrupted,
            ],
            ClusterPhase::Removing,
        )?;

        if guard.previous == ClusterPhase::Created {
            guard.settle(ClusterPhase::Removed);
            tracing::debug!(cluster = %self.spec.name(), "Cluster never started, nothing to remove");
            return Ok(());
        }

        tracing::info!(cluster = %self.spec.name(), "Removing cluster");
        // An interrupted start may have created resources it never recorded
        let result = self.teardown(guard.previous == ClusterPhase::Interrupted).await;
        self.state.lock().network_config = None;
        guard.settle(ClusterPhase::Removed);

        if result.is_ok() {
            tracing::info!(cluster = %self.spec.name(), "Cluster removed");
        }
        result
    }

    /// Remove containers and the network left by an earlier process that ran
    /// a cluster of the same name. Only valid on a freshly made cluster.
    ///
    /// # Errors
    ///
    /// Same as [`Cluster::remove`].
    pub async fn remove_leftovers(&self) -> DevnetResult<()> {
        let guard = self.begin(
            "remove leftovers",
            &[ClusterPhase::Created],
            ClusterPhase::Removing,
        )?;
        tracing::info!(cluster = %self.spec.name(), "Removing leftover resources");
        let result = self.teardown(true).await;
        guard.settle(ClusterPhase::Removed);
        result
    }

    /// Attach failed rollback steps to a startup error.
    ///
    /// Containers whose removal failed stay recorded as `Failed`, so a later
    /// [`Cluster::remove`] retries them.
    fn with_rollback_failures(&self, err: DevnetError, teardown: DevnetError) -> DevnetError {
        let failures = match teardown {
            DevnetError::TeardownFailed { errors } => errors,
            other => vec![other],
        };
        match err {
            DevnetError::StartupFailed {
                service,
                cause,
                mut rollback,
            } => {
                rollback.extend(failures);
                DevnetError::StartupFailed {
                    service,
                    cause,
                    rollback,
                }
            }
            err => {
                for failure in &failures {
                    tracing::error!(
                        cluster = %self.spec.name(),
                        error = %failure,
                        "Rollback incomplete; remove retries the remaining resources"
                    );
                }
                err
            }
        }
    }

    /// Check and transition the phase atomically.
    fn begin(
        &self,
        operation: &'static str,
        allowed: &[ClusterPhase],
        next: ClusterPhase,
    ) -> DevnetResult<PhaseGuard<'_>> {
        let mut state = self.state.lock();
        if !allowed.contains(&state.phase) {
            return Err(DevnetError::invalid_state(operation, state.phase));
        }
        let previous = std::mem::replace(&mut state.phase, next);
        Ok(PhaseGuard {
            cluster: self,
            operation,
            previous,
            settled: false,
        })
    }

    async fn bring_up(&self, cancel: &CancellationToken) -> DevnetResult<NetworkConfig> {
        if cancel.is_cancelled() {
            return Err(DevnetError::Cancelled);
        }
        self.create_network(cancel).await?;

        for service in self.spec.start_order() {
            if cancel.is_cancelled() {
                return Err(DevnetError::Cancelled);
            }
            self.start_service(service, cancel)
                .await
                .map_err(|err| match err {
                    DevnetError::Cancelled | DevnetError::EngineUnreachable { .. } => err,
                    err => DevnetError::startup_failed(service.name.as_str(), err),
                })?;
        }

        let state = self.state.lock();
        Ok(NetworkConfig::resolve(&self.spec, &state.containers))
    }

    async fn create_network(&self, cancel: &CancellationToken) -> DevnetResult<()> {
        let name = self.spec.network_name();
        let request = NetworkRequest::for_cluster(
            self.spec.name().as_str(),
            name.clone(),
            self.spec.network().clone(),
        );

        tracing::info!(cluster = %self.spec.name(), network = %name, "Creating network");
        let created = cancellable(cancel, self.backend.networks.create_network(&request)).await;
        if matches!(created, Err(DevnetError::Cancelled)) {
            // The engine may have finished the request; roll back by name
            self.state.lock().network = Some(NetworkHandle {
                id: name.clone(),
                name,
            });
            return Err(DevnetError::Cancelled);
        }
        let id = created.map_err(|err| match err {
            DevnetError::AlreadyExists { .. } => DevnetError::config(format!(
                "network '{name}' already exists; is another cluster named '{}' running?",
                self.spec.name()
            )),
            err => err,
        })?;

        self.state.lock().network = Some(NetworkHandle { id, name });
        Ok(())
    }

    async fn start_service(
        &self,
        service: &Arc<ServiceSpec>,
        cancel: &CancellationToken,
    ) -> DevnetResult<()> {
        let request = CreateRequest::for_service(&self.spec, service);
        tracing::info!(
            cluster = %self.spec.name(),
            service = %service.name,
            image = %service.image,
            "Creating container"
        );

        let runtime = &self.backend.runtime;
        let id = match cancellable(cancel, runtime.create_container(&request)).await {
            Ok(id) => id,
            Err(DevnetError::Cancelled) => {
                // Image pull or create was in flight; roll back by name
                self.state.lock().containers.push(ContainerHandle::new(
                    request.name.clone(),
                    request.name.clone(),
                    Arc::clone(service),
                ));
                return Err(DevnetError::Cancelled);
            }
            Err(err) => return Err(err),
        };
        let index = {
            let mut state = self.state.lock();
            state.containers.push(ContainerHandle::new(
                id.clone(),
                request.name.clone(),
                Arc::clone(service),
            ));
            state.containers.len() - 1
        };

        self.transition(index, ContainerState::Starting)?;
        tracing::info!(container = %request.name, "Starting container");
        cancellable(cancel, runtime.start(&id)).await?;
        self.transition(index, ContainerState::Running)?;

        let status = cancellable(cancel, runtime.inspect(&id)).await?;
        let handle = {
            let mut state = self.state.lock();
            state.containers[index].ports = status.ports;
            state.containers[index].clone()
        };

        let probe = self.backend.probes.build(&self.spec, service, &handle)?;
        tracing::info!(
            service = %service.name,
            probe = %probe.target(),
            timeout = ?service.health.timeout,
            "Waiting for service to become healthy"
        );

        let checker = HealthChecker::new(service.health.backoff);
        match checker
            .wait_until_healthy(probe.as_ref(), service.health.timeout, cancel)
            .await
        {
            Ok(()) => {
                self.transition(index, ContainerState::Healthy)?;
                tracing::info!(service = %service.name, "Service healthy");
                Ok(())
            }
            Err(err) => {
                if matches!(err, DevnetError::HealthTimeout { .. }) {
                    self.transition(index, ContainerState::Unhealthy)?;
                }
                Err(err)
            }
        }
    }

    fn transition(&self, index: usize, next: ContainerState) -> DevnetResult<()> {
        self.state.lock().containers[index].transition(next)
    }

    /// Reverse-order teardown; every step runs even when earlier ones fail.
    ///
    /// With `sweep`, services without a recorded handle are removed by their
    /// deterministic container name and the network by its name.
    async fn teardown(&self, sweep: bool) -> DevnetResult<()> {
        let (mut targets, network) = {
            let state = self.state.lock();
            let targets: Vec<TeardownTarget> = state
                .containers
                .iter()
                .enumerate()
                .rev()
                .map(|(index, handle)| TeardownTarget {
                    index: Some(index),
                    id: handle.id.clone(),
                    name: handle.name.clone(),
                })
                .collect();
            (targets, state.network.clone())
        };

        if sweep {
            let recorded: HashSet<String> = targets.iter().map(|target| target.name.clone()).collect();
            let start_order: Vec<_> = self.spec.start_order().collect();
            for service in start_order.into_iter().rev() {
                let name = self.spec.container_name(service);
                if !recorded.contains(&name) {
                    targets.push(TeardownTarget {
                        index: None,
                        id: name.clone(),
                        name,
                    });
                }
            }
        }

        let mut errors = Vec::new();
        for target in targets {
            if let Some(index) = target.index {
                self.transition(index, ContainerState::Stopping)?;
            }

            match self.remove_container(&target).await {
                Ok(()) => {
                    if let Some(index) = target.index {
                        self.transition(index, ContainerState::Removed)?;
                    }
                    tracing::info!(container = %target.name, "Container removed");
                }
                Err(err) => {
                    if let Some(index) = target.index {
                        self.transition(index, ContainerState::Failed)?;
                    }
                    tracing::error!(container = %target.name, error = %err, "Failed to remove container");
                    errors.push(err);
                }
            }
        }

        let network_id = network
            .map(|network| network.id)
            .or_else(|| sweep.then(|| self.spec.network_name()));
        if let Some(id) = network_id {
            let networks = &self.backend.networks;
            match retry_step("remove network", &id, || networks.remove_network(&id)).await {
                Ok(()) => tracing::info!(network = %self.spec.network_name(), "Network removed"),
                Err(err) => {
                    tracing::error!(network = %self.spec.network_name(), error = %err, "Failed to remove network");
                    errors.push(err);
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(DevnetError::TeardownFailed { errors })
        }
    }

    async fn remove_container(&self, target: &TeardownTarget) -> DevnetResult<()> {
        let runtime = &self.backend.runtime;
        let id = target.id.as_str();

        // Force removal kills the container anyway, so a failed stop is not fatal
        if let Err(err) = retry_step("stop", &target.name, || runtime.stop(id)).await {
            tracing::warn!(container = %target.name, error = %err, "Stop failed, forcing removal");
        }
        retry_step("remove", &target.name, || {
            runtime.remove(id, RemoveOptions { force: true })
        })
        .await
    }
}

impl fmt::Debug for Cluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cluster")
            .field("name", self.spec.name())
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        match self.state.get_mut().phase {
            // Detached clusters outlive the process on purpose
            ClusterPhase::Started => {
                tracing::debug!(cluster = %self.spec.name(), "Cluster dropped while started");
            }
            ClusterPhase::Interrupted => tracing::warn!(
                cluster = %self.spec.name(),
                "Interrupted cluster dropped without remove; resources may be left behind"
            ),
            _ => {}
        }
    }
}

/// Race an engine request against cancellation.
async fn cancellable<T>(
    cancel: &CancellationToken,
    request: impl Future<Output = DevnetResult<T>>,
) -> DevnetResult<T> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(DevnetError::Cancelled),
        result = request => result,
    }
}

/// Run a teardown step, treating `NotFound` as done and retrying transient failures.
async fn retry_step<F, Fut>(step: &str, target: &str, mut operation: F) -> DevnetResult<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = DevnetResult<()>>,
{
    let mut delays = TEARDOWN_BACKOFF.delays();
    let mut attempt = 1;
    loop {
        match operation().await {
            Ok(()) => return Ok(()),
            Err(err) if err.is_not_found() => {
                tracing::debug!(step, target, "Already gone");
                return Ok(());
            }
            Err(err) if err.is_retryable() && attempt < TEARDOWN_ATTEMPTS => {
                tracing::warn!(step, target, attempt, error = %err, "Teardown step failed, retrying");
                tokio::time::sleep(delays.next().unwrap_or(TEARDOWN_BACKOFF.max_delay)).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
