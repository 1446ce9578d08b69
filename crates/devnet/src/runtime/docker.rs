//! Docker Engine API backend.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, LogsOptions, NetworkingConfig, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::CreateImageOptions;
use bollard::network::{CreateNetworkOptions, ListNetworksOptions};
use bollard::secret::{ContainerStateStatusEnum, NetworkCreateResponse};
use bollard::service::{EndpointSettings, HostConfig, PortBinding, PortMap};
use bollard::{API_DEFAULT_VERSION, Docker};
use devnet_common::{DevnetError, DevnetResult};
use futures::stream::{self, BoxStream, StreamExt};

use super::{ContainerRuntime, ContainerStatus, CreateRequest, EngineState, RemoveOptions};
use crate::network::{NetworkManager, NetworkRequest};

/// Request timeout for the engine connection, in seconds.
const CONNECT_TIMEOUT_SECS: u64 = 120;

/// Grace period before the engine kills a stopping container, in seconds.
const STOP_TIMEOUT_SECS: i64 = 10;

/// Container runtime and network manager backed by the Docker Engine API.
#[derive(Debug, Clone)]
pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    /// Connect to the engine and check it answers.
    ///
    /// `host` accepts `unix://`, `tcp://` and `http://` endpoints; `None` uses
    /// the platform default socket.
    pub async fn connect(host: Option<&str>) -> DevnetResult<Self> {
        let docker = match host {
            Some(host) if host.starts_with("tcp://") || host.starts_with("http://") => {
                Docker::connect_with_http(host, CONNECT_TIMEOUT_SECS, API_DEFAULT_VERSION)
            }
            #[cfg(unix)]
            Some(host) => Docker::connect_with_unix(host, CONNECT_TIMEOUT_SECS, API_DEFAULT_VERSION),
            _ => Docker::connect_with_local_defaults(),
        }
        .map_err(|err| DevnetError::EngineUnreachable {
            message: err.to_string(),
        })?;

        docker
            .ping()
            .await
            .map_err(|err| DevnetError::EngineUnreachable {
                message: err.to_string(),
            })?;

        tracing::debug!(host = host.unwrap_or("default"), "Connected to container engine");
        Ok(Self { docker })
    }

    async fn ensure_image(&self, image: &str) -> DevnetResult<()> {
        match self.docker.inspect_image(image).await {
            Ok(_) => return Ok(()),
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => {}
            Err(err) => return Err(map_error("image", image, err)),
        }

        tracing::info!(image, "Pulling image");
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };
        let mut progress = self.docker.create_image(Some(options), None, None);
        while let Some(update) = progress.next().await {
            let update = update.map_err(|err| map_error("image", image, err))?;
            if let Some(status) = update.status {
                tracing::debug!(image, %status, "Pull progress");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ContainerRuntime for DockerEngine {
    async fn create_container(&self, request: &CreateRequest) -> DevnetResult<String> {
        self.ensure_image(&request.image).await?;

        let exposed_ports: HashMap<String, HashMap<(), ()>> = request
            .ports
            .iter()
            .map(|port| (format!("{}/tcp", port.container), HashMap::new()))
            .collect();

        let port_bindings: PortMap = request
            .ports
            .iter()
            .map(|port| {
                let binding = PortBinding {
                    host_ip: None,
                    host_port: Some(port.host.map(|host| host.to_string()).unwrap_or_default()),
                };
                (format!("{}/tcp", port.container), Some(vec![binding]))
            })
            .collect();

        let host_config = HostConfig {
            port_bindings: Some(port_bindings),
            network_mode: Some(request.network.clone()),
            ..Default::default()
        };

        let endpoint = EndpointSettings {
            aliases: Some(vec![request.alias.clone()]),
            ..Default::default()
        };

        let config = Config {
            image: Some(request.image.clone()),
            env: Some(
                request
                    .environment
                    .iter()
                    .map(|(key, value)| format!("{key}={value}"))
                    .collect(),
            ),
            cmd: (!request.command.is_empty()).then(|| request.command.clone()),
            labels: Some(request.labels.clone().into_iter().collect()),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            networking_config: Some(NetworkingConfig {
                endpoints_config: HashMap::from([(request.network.clone(), endpoint)]),
            }),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: request.name.as_str(),
            platform: None,
        };

        let response = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|err| map_error("container", &request.name, err))?;

        for warning in &response.warnings {
            tracing::warn!(container = %request.name, %warning, "Engine warning");
        }
        Ok(response.id)
    }

    async fn start(&self, id: &str) -> DevnetResult<()> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|err| map_error("container", id, err))
    }

    async fn stop(&self, id: &str) -> DevnetResult<()> {
        let options = StopContainerOptions {
            t: STOP_TIMEOUT_SECS,
        };
        match self.docker.stop_container(id, Some(options)).await {
            // 304: already stopped
            Ok(()) | Err(BollardError::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(err) => Err(map_error("container", id, err)),
        }
    }

    async fn remove(&self, id: &str, options: RemoveOptions) -> DevnetResult<()> {
        let options = RemoveContainerOptions {
            force: options.force,
            v: true,
            ..Default::default()
        };
        self.docker
            .remove_container(id, Some(options))
            .await
            .map_err(|err| map_error("container", id, err))
    }

    async fn inspect(&self, id: &str) -> DevnetResult<ContainerStatus> {
        let response = self
            .docker
            .inspect_container(id, None)
            .await
            .map_err(|err| map_error("container", id, err))?;

        let state = response.state.as_ref();
        Ok(ContainerStatus {
            id: response.id.clone().unwrap_or_else(|| id.to_string()),
            state: state
                .and_then(|state| state.status.clone())
                .map_or(EngineState::Unknown, engine_state),
            exit_code: state.and_then(|state| state.exit_code),
            ports: response
                .network_settings
                .and_then(|settings| settings.ports)
                .map(|ports| published_ports(&ports))
                .unwrap_or_default(),
        })
    }

    fn logs<'a>(&'a self, id: &'a str, follow: bool) -> BoxStream<'a, DevnetResult<String>> {
        let options = LogsOptions::<String> {
            follow,
            stdout: true,
            stderr: true,
            tail: "all".to_string(),
            ..Default::default()
        };

        self.docker
            .logs(id, Some(options))
            .flat_map(move |chunk| {
                let lines: Vec<DevnetResult<String>> = match chunk {
                    Ok(output) => output
                        .to_string()
                        .lines()
                        .map(|line| Ok(line.to_string()))
                        .collect(),
                    Err(err) => vec![Err(map_error("container", id, err))],
                };
                stream::iter(lines)
            })
            .boxed()
    }
}

#[async_trait]
impl NetworkManager for DockerEngine {
    async fn create_network(&self, request: &NetworkRequest) -> DevnetResult<String> {
        // The name filter matches substrings
        let filters = HashMap::from([("name".to_string(), vec![request.name.clone()])]);
        let existing = self
            .docker
            .list_networks(Some(ListNetworksOptions { filters }))
            .await
            .map_err(|err| map_error("network", &request.name, err))?;
        if existing
            .iter()
            .any(|network| network.name.as_deref() == Some(request.name.as_str()))
        {
            return Err(DevnetError::AlreadyExists {
                kind: "network".to_string(),
                name: request.name.clone(),
            });
        }

        let labels: HashMap<&str, &str> = request
            .labels
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
            .collect();

        let options = CreateNetworkOptions {
            name: request.name.as_str(),
            driver: request.options.driver.as_str(),
            internal: request.options.internal,
            labels,
            ..Default::default()
        };

        let response = self
            .docker
            .create_network(options)
            .await
            .map_err(|err| map_error("network", &request.name, err))?;

        created_network_id(&request.name, response)
    }

    async fn remove_network(&self, id: &str) -> DevnetResult<()> {
        match self.docker.remove_network(id).await {
            Ok(()) => Ok(()),
            Err(err) => match map_error("network", id, err) {
                DevnetError::NotFound { .. } => Ok(()),
                err => Err(err),
            },
        }
    }
}

fn map_error(kind: &str, name: &str, err: BollardError) -> DevnetError {
    match err {
        BollardError::DockerResponseServerError {
            status_code: 404, ..
        } => DevnetError::not_found(kind, name),
        BollardError::DockerResponseServerError {
            status_code: 409,
            message,
        } if message.contains("already in use") || message.contains("already exists") => {
            DevnetError::AlreadyExists {
                kind: kind.to_string(),
                name: name.to_string(),
            }
        }
        BollardError::DockerResponseServerError {
            status_code,
            message,
        } => DevnetError::operation_failed(format!("{kind} {name}: {message} ({status_code})")),
        err @ (BollardError::IOError { .. }
        | BollardError::HyperLegacyError { .. }
        | BollardError::SocketNotFoundError(_)
        | BollardError::RequestTimeoutError) => DevnetError::EngineUnreachable {
            message: err.to_string(),
        },
        err => DevnetError::operation_failed(format!("{kind} {name}: {err}")),
    }
}

fn created_network_id(name: &str, response: NetworkCreateResponse) -> DevnetResult<String> {
    response
        .id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| DevnetError::operation_failed(format!("engine returned no id for network {name}")))
}

fn engine_state(status: ContainerStateStatusEnum) -> EngineState {
    match status {
        ContainerStateStatusEnum::CREATED => EngineState::Created,
        ContainerStateStatusEnum::RUNNING => EngineState::Running,
        ContainerStateStatusEnum::PAUSED => EngineState::Paused,
        ContainerStateStatusEnum::RESTARTING => EngineState::Restarting,
        ContainerStateStatusEnum::EXITED => EngineState::Exited,
        ContainerStateStatusEnum::REMOVING | ContainerStateStatusEnum::DEAD => EngineState::Dead,
        ContainerStateStatusEnum::EMPTY => EngineState::Unknown,
    }
}

/// Map `"9944/tcp" -> [{HostPort: "32768"}]` to `9944 -> 32768`.
fn published_ports(ports: &PortMap) -> BTreeMap<u16, u16> {
    ports
        .iter()
        .filter_map(|(key, bindings)| {
            let container = key.split('/').next()?.parse().ok()?;
            let host = bindings
                .as_ref()?
                .iter()
                .find_map(|binding| binding.host_port.as_deref()?.parse().ok())?;
            Some((container, host))
        })
        .collect()
}
