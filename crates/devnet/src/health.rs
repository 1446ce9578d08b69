//! Readiness probing with exponential backoff.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use devnet_common::duration::humanized;
use devnet_common::{DevnetError, DevnetResult};
use futures::StreamExt;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

use crate::container::ContainerHandle;
use crate::runtime::{ContainerRuntime, EngineState};
use crate::spec::{ClusterSpec, ProbeSpec, ServiceSpec};

/// Per-request timeout of HTTP probes.
const HTTP_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Delay schedule between probe attempts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Backoff {
    /// Delay after the first failed attempt.
    #[serde(with = "humanized", default = "default_initial")]
    pub initial: Duration,
    /// Growth factor applied after each failed attempt (at least 1).
    #[serde(default = "default_factor")]
    pub factor: f64,
    /// Upper bound of a single delay.
    #[serde(with = "humanized", default = "default_max_delay")]
    pub max_delay: Duration,
}

const fn default_initial() -> Duration {
    Duration::from_millis(250)
}

const fn default_factor() -> f64 {
    2.0
}

const fn default_max_delay() -> Duration {
    Duration::from_secs(5)
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: default_initial(),
            factor: default_factor(),
            max_delay: default_max_delay(),
        }
    }
}

impl Backoff {
    /// The infinite sequence of delays.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + use<> {
        let factor = self.factor.max(1.0);
        let max = self.max_delay.max(self.initial);
        std::iter::successors(Some(self.initial), move |current| {
            let next = Duration::try_from_secs_f64(current.as_secs_f64() * factor).unwrap_or(max);
            Some(next.min(max))
        })
    }
}

/// Outcome of a single probe attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The service is ready.
    Ready,
    /// Not ready yet; retry after a delay.
    NotReady(String),
}

/// One readiness check. Returning `Err` aborts the wait immediately.
#[async_trait]
pub trait Probe: Send + Sync {
    /// Human-readable probe target, used in logs and errors.
    fn target(&self) -> String;

    /// Perform a single attempt.
    async fn attempt(&self) -> DevnetResult<ProbeOutcome>;
}

/// Builds the probe for a started service container.
pub trait ProbeFactory: Send + Sync {
    /// Build the probe for `service`, resolving targets through `container`'s published ports.
    fn build(
        &self,
        cluster: &ClusterSpec,
        service: &ServiceSpec,
        container: &ContainerHandle,
    ) -> DevnetResult<Box<dyn Probe>>;
}

/// Polls a probe until it reports ready, times out, or is cancelled.
#[derive(Debug, Clone, Copy, Default)]
pub struct HealthChecker {
    backoff: Backoff,
}

impl HealthChecker {
    /// Create a checker with the given backoff.
    #[must_use]
    pub const fn new(backoff: Backoff) -> Self {
        Self { backoff }
    }

    /// Wait until `probe` reports ready.
    ///
    /// # Errors
    ///
    /// - [`DevnetError::HealthTimeout`] when `timeout` elapses without success
    /// - [`DevnetError::Cancelled`] when `cancel` fires
    /// - any error the probe returns, unchanged
    pub async fn wait_until_healthy(
        &self,
        probe: &dyn Probe,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> DevnetResult<()> {
        let target = probe.target();
        let deadline = Instant::now() + timeout;
        let mut delays = self.backoff.delays();
        let mut last_reason: Option<String> = None;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let outcome = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(DevnetError::Cancelled),
                outcome = time::timeout_at(deadline, probe.attempt()) => outcome,
            };

            match outcome {
                Ok(Ok(ProbeOutcome::Ready)) => {
                    tracing::debug!(%target, attempt, "Probe ready");
                    return Ok(());
                }
                Ok(Ok(ProbeOutcome::NotReady(reason))) => {
                    tracing::debug!(%target, attempt, %reason, "Probe not ready");
                    last_reason = Some(reason);
                }
                Ok(Err(err)) => return Err(err),
                Err(_) => break,
            }

            let delay = delays.next().unwrap_or(self.backoff.max_delay);
            let wake = (Instant::now() + delay).min(deadline);
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(DevnetError::Cancelled),
                () = time::sleep_until(wake) => {}
            }
            if Instant::now() >= deadline {
                break;
            }
        }

        Err(DevnetError::HealthTimeout {
            target,
            timeout,
            last_reason,
        })
    }
}

/// HTTP GET; any 2xx response is ready.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: reqwest::Client,
    url: String,
}

impl HttpProbe {
    /// Probe `url` with `client`.
    #[must_use]
    pub const fn new(client: reqwest::Client, url: String) -> Self {
        Self { client, url }
    }
}

#[async_trait]
impl Probe for HttpProbe {
    fn target(&self) -> String {
        self.url.clone()
    }

    async fn attempt(&self) -> DevnetResult<ProbeOutcome> {
        Ok(match self.client.get(&self.url).send().await {
            Ok(response) if response.status().is_success() => ProbeOutcome::Ready,
            Ok(response) => ProbeOutcome::NotReady(format!("HTTP {}", response.status())),
            Err(err) => ProbeOutcome::NotReady(err.to_string()),
        })
    }
}

/// TCP connect; an accepted connection is ready.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    addr: String,
}

impl TcpProbe {
    /// Probe `host:port`.
    #[must_use]
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            addr: format!("{host}:{port}"),
        }
    }
}

#[async_trait]
impl Probe for TcpProbe {
    fn target(&self) -> String {
        format!("tcp://{}", self.addr)
    }

    async fn attempt(&self) -> DevnetResult<ProbeOutcome> {
        Ok(match TcpStream::connect(&self.addr).await {
            Ok(_) => ProbeOutcome::Ready,
            Err(err) => ProbeOutcome::NotReady(err.to_string()),
        })
    }
}

/// Searches a snapshot of the container's log for a pattern.
pub struct LogProbe {
    runtime: Arc<dyn ContainerRuntime>,
    container: String,
    pattern: Regex,
}

impl LogProbe {
    /// Probe `container`'s log for `pattern`.
    #[must_use]
    pub fn new(runtime: Arc<dyn ContainerRuntime>, container: String, pattern: Regex) -> Self {
        Self {
            runtime,
            container,
            pattern,
        }
    }
}

#[async_trait]
impl Probe for LogProbe {
    fn target(&self) -> String {
        format!("log of {} matching /{}/", self.container, self.pattern)
    }

    async fn attempt(&self) -> DevnetResult<ProbeOutcome> {
        let mut lines = self.runtime.logs(&self.container, false);
        let mut scanned = 0usize;
        while let Some(line) = lines.next().await {
            match line {
                Ok(line) if self.pattern.is_match(&line) => return Ok(ProbeOutcome::Ready),
                Ok(_) => scanned += 1,
                Err(err) if err.is_retryable() => {
                    return Ok(ProbeOutcome::NotReady(err.to_string()));
                }
                Err(err) => return Err(err),
            }
        }
        Ok(ProbeOutcome::NotReady(format!("no match in {scanned} log lines")))
    }
}

/// Ready as soon as the engine reports the container running.
pub struct RunningProbe {
    runtime: Arc<dyn ContainerRuntime>,
    container: String,
}

impl RunningProbe {
    /// Probe `container`'s engine state.
    #[must_use]
    pub fn new(runtime: Arc<dyn ContainerRuntime>, container: String) -> Self {
        Self { runtime, container }
    }
}

#[async_trait]
impl Probe for RunningProbe {
    fn target(&self) -> String {
        format!("container {}", self.container)
    }

    async fn attempt(&self) -> DevnetResult<ProbeOutcome> {
        let status = self.runtime.inspect(&self.container).await?;
        match status.state {
            EngineState::Running => Ok(ProbeOutcome::Ready),
            EngineState::Exited | EngineState::Dead => Err(DevnetError::ProbeFailed {
                target: self.target(),
                message: format!(
                    "container {} with exit code {}",
                    status.state,
                    status.exit_code.map_or_else(|| "unknown".to_string(), |code| code.to_string())
                ),
            }),
            state => Ok(ProbeOutcome::NotReady(format!("container is {state}"))),
        }
    }
}

/// Builds probes that reach services through their published ports and the engine.
pub struct EngineProbes {
    runtime: Arc<dyn ContainerRuntime>,
    client: reqwest::Client,
}

impl EngineProbes {
    /// Create a factory using `runtime` for log and state probes.
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> DevnetResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(HTTP_PROBE_TIMEOUT)
            .build()
            .map_err(|err| DevnetError::config(format!("failed to build HTTP client: {err}")))?;
        Ok(Self { runtime, client })
    }
}

impl ProbeFactory for EngineProbes {
    fn build(
        &self,
        cluster: &ClusterSpec,
        service: &ServiceSpec,
        container: &ContainerHandle,
    ) -> DevnetResult<Box<dyn Probe>> {
        let host_port = |port: u16| {
            container.host_port(port).ok_or_else(|| {
                DevnetError::config(format!(
                    "service '{}' probes port {port}, which is not published",
                    service.name
                ))
            })
        };

        Ok(match &service.health.probe {
            ProbeSpec::Http { port, path } => Box::new(HttpProbe::new(
                self.client.clone(),
                format!("http://{}:{}{path}", cluster.host(), host_port(*port)?),
            )),
            ProbeSpec::Tcp { port } => Box::new(TcpProbe::new(cluster.host(), host_port(*port)?)),
            ProbeSpec::Log { pattern } => {
                let pattern = Regex::new(pattern).map_err(|err| {
                    DevnetError::config(format!(
                        "service '{}' has an invalid log pattern: {err}",
                        service.name
                    ))
                })?;
                Box::new(LogProbe::new(
                    Arc::clone(&self.runtime),
                    container.id.clone(),
                    pattern,
                ))
            }
            ProbeSpec::Running => Box::new(RunningProbe::new(
                Arc::clone(&self.runtime),
                container.id.clone(),
            )),
        })
    }
}
