//! In-memory engine that records every call.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use devnet::ClusterBackend;
use devnet::container::ContainerHandle;
use devnet::health::{Probe, ProbeFactory, ProbeOutcome};
use devnet::network::{NetworkManager, NetworkRequest};
use devnet::runtime::{
    ContainerRuntime, ContainerStatus, CreateRequest, EngineState, RemoveOptions,
};
use devnet::spec::{ClusterSpec, ServiceSpec};
use devnet_common::{DevnetError, DevnetResult};
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;

/// Engine operations that can fail on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Create,
    Start,
    Stop,
    Remove,
    Inspect,
    CreateNetwork,
    RemoveNetwork,
}

/// A recorded call. Containers and networks are identified by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    CreateNetwork(String),
    RemoveNetwork(String),
    Create(String),
    Start(String),
    Stop(String),
    Remove(String),
    Inspect(String),
    Ready(String),
    NotReady(String),
}

struct Injected {
    op: Op,
    name: String,
    remaining: u32,
    error: fn() -> DevnetError,
}

struct MockContainer {
    name: String,
    running: bool,
    ports: BTreeMap<u16, u16>,
}

#[derive(Default)]
struct Inner {
    events: Vec<Event>,
    containers: HashMap<String, MockContainer>,
    networks: HashMap<String, String>,
    next_id: u32,
    injected: Vec<Injected>,
    never_healthy: HashSet<String>,
    slow_creates: HashMap<String, Duration>,
    calls: usize,
}

impl Inner {
    fn check(&mut self, op: Op, name: &str) -> DevnetResult<()> {
        self.calls += 1;
        let Some(injected) = self
            .injected
            .iter_mut()
            .find(|injected| injected.op == op && injected.name == name && injected.remaining > 0)
        else {
            return Ok(());
        };
        injected.remaining -= 1;
        Err((injected.error)())
    }

    /// Resolve an id or name to the container id.
    fn lookup(&self, id: &str) -> DevnetResult<String> {
        if self.containers.contains_key(id) {
            return Ok(id.to_string());
        }
        self.containers
            .iter()
            .find(|(_, container)| container.name == id)
            .map(|(id, _)| id.clone())
            .ok_or_else(|| DevnetError::not_found("container", id))
    }

    fn name_of(&self, id: &str) -> String {
        self.lookup(id)
            .ok()
            .and_then(|id| self.containers.get(&id).map(|c| c.name.clone()))
            .unwrap_or_else(|| id.to_string())
    }
}

/// Recording mock engine; clones share state.
#[derive(Clone, Default)]
pub struct MockEngine {
    inner: Arc<Mutex<Inner>>,
}

pub fn operation_failed() -> DevnetError {
    DevnetError::operation_failed("mock engine failure")
}

pub fn unreachable() -> DevnetError {
    DevnetError::EngineUnreachable {
        message: "mock socket closed".to_string(),
    }
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn backend(&self) -> ClusterBackend {
        ClusterBackend {
            runtime: Arc::new(self.clone()),
            networks: Arc::new(self.clone()),
            probes: Arc::new(self.clone()),
        }
    }

    /// Fail the next `times` calls of `op` on the named container or network.
    pub fn fail(&self, op: Op, name: &str, times: u32, error: fn() -> DevnetError) {
        self.inner.lock().injected.push(Injected {
            op,
            name: name.to_string(),
            remaining: times,
            error,
        });
    }

    /// The named service's probe never reports ready.
    pub fn never_healthy(&self, service: &str) {
        self.inner.lock().never_healthy.insert(service.to_string());
    }

    /// Creating the named container takes `delay`, like a long image pull.
    pub fn slow_create(&self, name: &str, delay: Duration) {
        self.inner.lock().slow_creates.insert(name.to_string(), delay);
    }

    /// Pretend a network of that name already exists.
    pub fn preexisting_network(&self, name: &str) {
        self.inner
            .lock()
            .networks
            .insert(format!("net-existing-{name}"), name.to_string());
    }

    pub fn events(&self) -> Vec<Event> {
        self.inner.lock().events.clone()
    }

    /// Number of engine calls, failed ones included.
    pub fn calls(&self) -> usize {
        self.inner.lock().calls
    }

    pub fn live_containers(&self) -> Vec<String> {
        let mut names: Vec<_> = self
            .inner
            .lock()
            .containers
            .values()
            .map(|container| container.name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn live_networks(&self) -> Vec<String> {
        self.inner.lock().networks.values().cloned().collect()
    }

    /// Position of the first matching event.
    pub fn position(&self, event: &Event) -> Option<usize> {
        self.events().iter().position(|recorded| recorded == event)
    }
}

#[async_trait]
impl ContainerRuntime for MockEngine {
    async fn create_container(&self, request: &CreateRequest) -> DevnetResult<String> {
        let delay = self.inner.lock().slow_creates.get(&request.name).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut inner = self.inner.lock();
        inner.check(Op::Create, &request.name)?;
        if inner.containers.values().any(|c| c.name == request.name) {
            return Err(DevnetError::AlreadyExists {
                kind: "container".to_string(),
                name: request.name.clone(),
            });
        }

        inner.next_id += 1;
        let id = format!("cid-{}", inner.next_id);
        let ports = request
            .ports
            .iter()
            .map(|port| (port.container, port.host.unwrap_or(port.container + 20000)))
            .collect();
        inner.containers.insert(
            id.clone(),
            MockContainer {
                name: request.name.clone(),
                running: false,
                ports,
            },
        );
        inner.events.push(Event::Create(request.name.clone()));
        Ok(id)
    }

    async fn start(&self, id: &str) -> DevnetResult<()> {
        let mut inner = self.inner.lock();
        let name = inner.name_of(id);
        inner.check(Op::Start, &name)?;
        let id = inner.lookup(id)?;
        if let Some(container) = inner.containers.get_mut(&id) {
            container.running = true;
        }
        inner.events.push(Event::Start(name));
        Ok(())
    }

    async fn stop(&self, id: &str) -> DevnetResult<()> {
        let mut inner = self.inner.lock();
        let name = inner.name_of(id);
        inner.check(Op::Stop, &name)?;
        let id = inner.lookup(id)?;
        if let Some(container) = inner.containers.get_mut(&id) {
            container.running = false;
        }
        inner.events.push(Event::Stop(name));
        Ok(())
    }

    async fn remove(&self, id: &str, options: RemoveOptions) -> DevnetResult<()> {
        assert!(options.force, "teardown always force-removes");
        let mut inner = self.inner.lock();
        let name = inner.name_of(id);
        inner.check(Op::Remove, &name)?;
        let id = inner.lookup(id)?;
        inner.containers.remove(&id);
        inner.events.push(Event::Remove(name));
        Ok(())
    }

    async fn inspect(&self, id: &str) -> DevnetResult<ContainerStatus> {
        let mut inner = self.inner.lock();
        let name = inner.name_of(id);
        inner.check(Op::Inspect, &name)?;
        let id = inner.lookup(id)?;
        let container = &inner.containers[&id];
        let status = ContainerStatus {
            id: id.clone(),
            state: if container.running {
                EngineState::Running
            } else {
                EngineState::Created
            },
            exit_code: None,
            ports: container.ports.clone(),
        };
        inner.events.push(Event::Inspect(name));
        Ok(status)
    }

    fn logs<'a>(&'a self, id: &'a str, _follow: bool) -> BoxStream<'a, DevnetResult<String>> {
        let lines = match self.inner.lock().lookup(id) {
            Ok(_) => vec![Ok("booting".to_string()), Ok("listening".to_string())],
            Err(err) => vec![Err(err)],
        };
        stream::iter(lines).boxed()
    }
}

#[async_trait]
impl NetworkManager for MockEngine {
    async fn create_network(&self, request: &NetworkRequest) -> DevnetResult<String> {
        let mut inner = self.inner.lock();
        inner.check(Op::CreateNetwork, &request.name)?;
        if inner.networks.values().any(|name| *name == request.name) {
            return Err(DevnetError::AlreadyExists {
                kind: "network".to_string(),
                name: request.name.clone(),
            });
        }
        inner.next_id += 1;
        let id = format!("net-{}", inner.next_id);
        inner.networks.insert(id.clone(), request.name.clone());
        inner.events.push(Event::CreateNetwork(request.name.clone()));
        Ok(id)
    }

    async fn remove_network(&self, id: &str) -> DevnetResult<()> {
        let mut inner = self.inner.lock();
        let key = inner
            .networks
            .iter()
            .find(|(key, name)| *key == id || *name == id)
            .map(|(key, _)| key.clone());
        let name = key
            .as_ref()
            .and_then(|key| inner.networks.get(key).cloned())
            .unwrap_or_else(|| id.to_string());
        inner.check(Op::RemoveNetwork, &name)?;
        if let Some(key) = key {
            inner.networks.remove(&key);
            inner.events.push(Event::RemoveNetwork(name));
        }
        Ok(())
    }
}

struct MockProbe {
    inner: Arc<Mutex<Inner>>,
    service: String,
}

#[async_trait]
impl Probe for MockProbe {
    fn target(&self) -> String {
        format!("mock://{}", self.service)
    }

    async fn attempt(&self) -> DevnetResult<ProbeOutcome> {
        let mut inner = self.inner.lock();
        if inner.never_healthy.contains(&self.service) {
            inner.events.push(Event::NotReady(self.service.clone()));
            Ok(ProbeOutcome::NotReady("mock service still booting".to_string()))
        } else {
            inner.events.push(Event::Ready(self.service.clone()));
            Ok(ProbeOutcome::Ready)
        }
    }
}

impl ProbeFactory for MockEngine {
    fn build(
        &self,
        _cluster: &ClusterSpec,
        service: &ServiceSpec,
        _container: &ContainerHandle,
    ) -> DevnetResult<Box<dyn Probe>> {
        Ok(Box::new(MockProbe {
            inner: Arc::clone(&self.inner),
            service: service.name.to_string(),
        }))
    }
}
