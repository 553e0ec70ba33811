//! Backend driver for an existing Docker container
//!
//! The container is never created or removed here. It is started, paused, unpaused and
//! stopped through the Docker API, and its health check (when it has one) decides when
//! a start has finished.

use crate::backend::{Backend, DEFAULT_FAKE_STATUS};
use crate::error::BackendError;
use crate::plugins::Plugin;
use crate::status::{BackendStatus, StatusCell, Transition};
use async_trait::async_trait;
use bollard::container::{StartContainerOptions, StopContainerOptions};
use bollard::models::{ContainerState, ContainerStateStatusEnum, HealthStatusEnum};
use bollard::Docker;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Seconds Docker waits after SIGTERM before killing the container
const STOP_TIMEOUT_SECS: i64 = 10;

/// What a container inspection says about an in-progress start
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StartProbe {
    Ready,
    Waiting,
    Exited,
}

/// Map the container's state onto the backend lifecycle
fn status_from_state(state: Option<ContainerStateStatusEnum>) -> BackendStatus {
    match state {
        Some(ContainerStateStatusEnum::CREATED) | Some(ContainerStateStatusEnum::RESTARTING) => {
            BackendStatus::Starting
        }
        Some(ContainerStateStatusEnum::RUNNING) => BackendStatus::Running,
        Some(ContainerStateStatusEnum::PAUSED) => BackendStatus::Paused,
        Some(ContainerStateStatusEnum::REMOVING) => BackendStatus::Stopping,
        _ => BackendStatus::Stopped,
    }
}

fn probe_start(state: Option<&ContainerState>) -> StartProbe {
    let Some(state) = state else {
        return StartProbe::Waiting;
    };
    match state.status {
        Some(ContainerStateStatusEnum::RUNNING) => {}
        Some(ContainerStateStatusEnum::EXITED) | Some(ContainerStateStatusEnum::DEAD) => {
            return StartProbe::Exited
        }
        _ => return StartProbe::Waiting,
    }

    match state.health.as_ref().and_then(|h| h.status) {
        // No health check configured
        None | Some(HealthStatusEnum::EMPTY) | Some(HealthStatusEnum::NONE) => StartProbe::Ready,
        Some(HealthStatusEnum::HEALTHY) => StartProbe::Ready,
        Some(HealthStatusEnum::STARTING) | Some(HealthStatusEnum::UNHEALTHY) => {
            StartProbe::Waiting
        }
    }
}

fn is_status_code(error: &bollard::errors::Error, code: u16) -> bool {
    matches!(
        error,
        bollard::errors::Error::DockerResponseServerError { status_code, .. } if *status_code == code
    )
}

pub struct DockerBackend {
    client: Docker,
    container_id: String,
    plugin: Option<Plugin>,
    health_poll_interval: Duration,
    status: StatusCell,
}

impl DockerBackend {
    /// Connect to the Docker daemon and look up `container_id`.
    ///
    /// Connection priority:
    /// 1. Explicit docker_host parameter
    /// 2. DOCKER_HOST environment variable
    /// 3. Platform socket defaults
    pub async fn connect(
        container_id: &str,
        docker_host: Option<&str>,
        plugin: Option<Plugin>,
        health_poll_interval: Duration,
    ) -> anyhow::Result<Self> {
        let client = match docker_host
            .map(str::to_string)
            .or_else(|| std::env::var("DOCKER_HOST").ok())
        {
            Some(host) => connect_to_host(&host)?,
            None => Docker::connect_with_local_defaults().map_err(|e| {
                anyhow::anyhow!(
                    "Cannot connect to Docker daemon: {}. \
                     Start dockerd or set DOCKER_HOST / docker_host.",
                    e
                )
            })?,
        };

        client.ping().await.map_err(|e| {
            anyhow::anyhow!(
                "Docker daemon is not responding: {}. Ensure dockerd is running.",
                e
            )
        })?;
        debug!("Connected to Docker daemon");

        let backend = Self {
            client,
            container_id: container_id.to_string(),
            plugin,
            health_poll_interval,
            status: StatusCell::default(),
        };
        let state = backend.inspect().await?;
        backend
            .status
            .observe(status_from_state(state.as_ref().and_then(|s| s.status)));
        info!(
            container_id,
            status = %backend.status.get(),
            "Controlling Docker container"
        );

        Ok(backend)
    }

    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    async fn inspect(&self) -> Result<Option<ContainerState>, BackendError> {
        match self.client.inspect_container(&self.container_id, None).await {
            Ok(info) => Ok(info.state),
            Err(e) if is_status_code(&e, 404) => {
                Err(BackendError::ContainerNotFound(self.container_id.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Re-read the container state after a control call failed
    async fn resync(&self) {
        match self.inspect().await {
            Ok(state) => {
                let status = status_from_state(state.as_ref().and_then(|s| s.status));
                self.status.observe(status);
                debug!(container_id = %self.container_id, %status, "Resynced container status");
            }
            Err(e) => warn!(container_id = %self.container_id, error = %e, "Cannot inspect container"),
        }
    }

    async fn start_container(&self) -> Result<(), BackendError> {
        match self
            .client
            .start_container(&self.container_id, None::<StartContainerOptions<String>>)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_status_code(&e, 304) => {
                debug!(container_id = %self.container_id, "Container was already started");
                Ok(())
            }
            Err(e) if is_status_code(&e, 404) => {
                Err(BackendError::ContainerNotFound(self.container_id.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Poll until the container is running and healthy. `Ok(false)` if a stop took over.
    async fn wait_until_healthy(&self) -> Result<bool, BackendError> {
        loop {
            if self.status.get() != BackendStatus::Starting {
                return Ok(false);
            }
            match probe_start(self.inspect().await?.as_ref()) {
                StartProbe::Ready => return Ok(true),
                StartProbe::Exited => return Err(BackendError::ExitedBeforeReady),
                StartProbe::Waiting => tokio::time::sleep(self.health_poll_interval).await,
            }
        }
    }
}

fn connect_to_host(host: &str) -> anyhow::Result<Docker> {
    if let Some(socket_path) = host.strip_prefix("unix://") {
        Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION)
            .map_err(|e| anyhow::anyhow!("Cannot connect to Unix socket '{}': {}", socket_path, e))
    } else if host.starts_with("tcp://") || host.starts_with("http://") {
        Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION)
            .map_err(|e| anyhow::anyhow!("Cannot connect to TCP endpoint '{}': {}", host, e))
    } else {
        anyhow::bail!(
            "Invalid docker_host format: '{}'. Expected 'unix:///path/to/socket' or 'tcp://host:port'",
            host
        )
    }
}

#[async_trait]
impl Backend for DockerBackend {
    fn status(&self) -> BackendStatus {
        self.status.get()
    }

    async fn start(&self) -> Result<(), BackendError> {
        if self.status.advance(Transition::Start).is_none() {
            return Ok(());
        }
        info!(container_id = %self.container_id, "Starting container");

        let result = match self.start_container().await {
            Ok(()) => self.wait_until_healthy().await,
            Err(e) => Err(e),
        };

        match result {
            Ok(true) => {
                if self.status.advance(Transition::Ready).is_some() {
                    info!(container_id = %self.container_id, "Container ready");
                }
                Ok(())
            }
            Ok(false) => Ok(()),
            Err(e) => {
                error!(container_id = %self.container_id, error = %e, "Container failed to start");
                self.status.advance(Transition::Abort);
                Err(e)
            }
        }
    }

    async fn stop(&self) -> Result<(), BackendError> {
        let previous = match self.status.advance(Transition::Stop) {
            Some(previous) => previous,
            None => return Ok(()),
        };
        info!(container_id = %self.container_id, from = %previous, "Stopping container");

        if previous == BackendStatus::Paused {
            if let Err(e) = self.client.unpause_container(&self.container_id).await {
                debug!(container_id = %self.container_id, error = %e, "Unpause before stop failed");
            }
        }

        let options = StopContainerOptions {
            t: STOP_TIMEOUT_SECS,
        };
        match self
            .client
            .stop_container(&self.container_id, Some(options))
            .await
        {
            Ok(_) => {}
            Err(e) if is_status_code(&e, 304) || is_status_code(&e, 404) => {
                debug!(container_id = %self.container_id, "Container was not running");
            }
            Err(e) => {
                warn!(container_id = %self.container_id, error = %e, "Failed to stop container");
                self.resync().await;
                return Ok(());
            }
        }

        self.status.advance(Transition::Exited);
        info!(container_id = %self.container_id, "Container stopped");
        Ok(())
    }

    async fn pause(&self) -> Result<(), BackendError> {
        if self.status.advance(Transition::Pause).is_none() {
            return Ok(());
        }
        info!(container_id = %self.container_id, "Pausing container");
        if let Err(e) = self.client.pause_container(&self.container_id).await {
            warn!(container_id = %self.container_id, error = %e, "Failed to pause container");
        }
        Ok(())
    }

    async fn unpause(&self) -> Result<(), BackendError> {
        if self.status.advance(Transition::Unpause).is_none() {
            return Ok(());
        }
        info!(container_id = %self.container_id, "Unpausing container");
        if let Err(e) = self.client.unpause_container(&self.container_id).await {
            warn!(container_id = %self.container_id, error = %e, "Failed to unpause container");
        }
        Ok(())
    }

    async fn close(&self) {
        debug!(container_id = %self.container_id, "Releasing Docker client");
    }

    fn validates_clients(&self) -> bool {
        self.plugin.as_ref().is_some_and(Plugin::validates_clients)
    }

    fn is_valid_connection(&self, initial: &[u8]) -> bool {
        self.plugin
            .as_ref()
            .map_or(true, |plugin| plugin.is_valid_connection(initial))
    }

    fn fake_status(&self) -> Vec<u8> {
        self.plugin
            .as_ref()
            .map_or_else(|| DEFAULT_FAKE_STATUS.to_vec(), |plugin| plugin.fake_status().to_vec())
    }
}
