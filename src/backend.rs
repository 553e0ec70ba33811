//! The contract every controllable backend satisfies
//!
//! The coordinator never mutates backend status itself. It reads [`Backend::status`] to
//! decide how to route a client and calls the lifecycle methods to request transitions.
//! Every lifecycle method is an idempotent no-op when the backend is not in a state the
//! transition applies to, and must tolerate being called concurrently from several
//! connection handlers and the idle-stop task.

use crate::config::{BackendConfig, BackendType};
use crate::docker::DockerBackend;
use crate::error::BackendError;
use crate::plugins::{Plugin, PluginKind};
use crate::process::{ProcessBackend, ProcessSettings};
use crate::status::BackendStatus;
use async_trait::async_trait;

/// Payload sent to clients while a backend without its own framing is warming up
pub const DEFAULT_FAKE_STATUS: &[u8] = b"Server starting up...";

#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Current lifecycle state, never blocks
    fn status(&self) -> BackendStatus;

    /// Launch the backend and wait until it is ready. No-op unless stopped.
    async fn start(&self) -> Result<(), BackendError>;

    /// Terminate the backend and wait for it to exit. No-op unless running or paused.
    async fn stop(&self) -> Result<(), BackendError>;

    /// Suspend without terminating. No-op unless running.
    async fn pause(&self) -> Result<(), BackendError>;

    /// Resume a suspended backend. No-op unless paused.
    async fn unpause(&self) -> Result<(), BackendError>;

    /// Release process or client resources. Safe to call more than once.
    async fn close(&self);

    /// Whether [`is_valid_connection`](Backend::is_valid_connection) looks at client bytes
    fn validates_clients(&self) -> bool {
        false
    }

    /// Inspect the first bytes sent by a client before a costly start is triggered
    fn is_valid_connection(&self, _initial: &[u8]) -> bool {
        true
    }

    /// Protocol-appropriate "starting up" payload
    fn fake_status(&self) -> Vec<u8> {
        DEFAULT_FAKE_STATUS.to_vec()
    }
}

/// Backend driver chosen from configuration
pub enum ServerBackend {
    Process(ProcessBackend),
    Docker(DockerBackend),
}

impl ServerBackend {
    /// Build the configured driver. Docker backends connect and look up their container.
    pub async fn from_config(config: &BackendConfig) -> anyhow::Result<Self> {
        match config.backend_type {
            BackendType::Process => {
                let settings = ProcessSettings::from_config(config).map_err(anyhow::Error::msg)?;
                Ok(ServerBackend::Process(ProcessBackend::new(
                    Plugin::new(config.plugin),
                    settings,
                )))
            }
            BackendType::Docker => {
                let container_id = config
                    .container_id
                    .as_deref()
                    .ok_or_else(|| anyhow::anyhow!("docker backend requires 'container_id'"))?;
                let plugin = (config.plugin != PluginKind::Generic).then(|| Plugin::new(config.plugin));
                let backend = DockerBackend::connect(
                    container_id,
                    config.docker_host.as_deref(),
                    plugin,
                    config.health_poll_interval(),
                )
                .await?;
                Ok(ServerBackend::Docker(backend))
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ServerBackend::Process(_) => "process",
            ServerBackend::Docker(_) => "docker",
        }
    }
}

#[async_trait]
impl Backend for ServerBackend {
    fn status(&self) -> BackendStatus {
        match self {
            ServerBackend::Process(b) => b.status(),
            ServerBackend::Docker(b) => b.status(),
        }
    }

    async fn start(&self) -> Result<(), BackendError> {
        match self {
            ServerBackend::Process(b) => b.start().await,
            ServerBackend::Docker(b) => b.start().await,
        }
    }

    async fn stop(&self) -> Result<(), BackendError> {
        match self {
            ServerBackend::Process(b) => b.stop().await,
            ServerBackend::Docker(b) => b.stop().await,
        }
    }

    async fn pause(&self) -> Result<(), BackendError> {
        match self {
            ServerBackend::Process(b) => b.pause().await,
            ServerBackend::Docker(b) => b.pause().await,
        }
    }

    async fn unpause(&self) -> Result<(), BackendError> {
        match self {
            ServerBackend::Process(b) => b.unpause().await,
            ServerBackend::Docker(b) => b.unpause().await,
        }
    }

    async fn close(&self) {
        match self {
            ServerBackend::Process(b) => b.close().await,
            ServerBackend::Docker(b) => b.close().await,
        }
    }

    fn validates_clients(&self) -> bool {
        match self {
            ServerBackend::Process(b) => b.validates_clients(),
            ServerBackend::Docker(b) => b.validates_clients(),
        }
    }

    fn is_valid_connection(&self, initial: &[u8]) -> bool {
        match self {
            ServerBackend::Process(b) => b.is_valid_connection(initial),
            ServerBackend::Docker(b) => b.is_valid_connection(initial),
        }
    }

    fn fake_status(&self) -> Vec<u8> {
        match self {
            ServerBackend::Process(b) => b.fake_status(),
            ServerBackend::Docker(b) => b.fake_status(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::{StatusCell, Transition};

    /// Backend relying on every default method
    struct Bare {
        status: StatusCell,
    }

    #[async_trait]
    impl Backend for Bare {
        fn status(&self) -> BackendStatus {
            self.status.get()
        }

        async fn start(&self) -> Result<(), BackendError> {
            if self.status.advance(Transition::Start).is_some() {
                self.status.advance(Transition::Ready);
            }
            Ok(())
        }

        async fn stop(&self) -> Result<(), BackendError> {
            if self.status.advance(Transition::Stop).is_some() {
                self.status.advance(Transition::Exited);
            }
            Ok(())
        }

        async fn pause(&self) -> Result<(), BackendError> {
            self.status.advance(Transition::Pause);
            Ok(())
        }

        async fn unpause(&self) -> Result<(), BackendError> {
            self.status.advance(Transition::Unpause);
            Ok(())
        }

        async fn close(&self) {}
    }

    #[test]
    fn test_default_contract_methods() {
        let backend = Bare {
            status: StatusCell::default(),
        };
        assert!(!backend.validates_clients());
        assert!(backend.is_valid_connection(b""));
        assert!(backend.is_valid_connection(b"\x16\x03\x01garbage"));
        assert_eq!(backend.fake_status(), b"Server starting up...".to_vec());
    }

    #[tokio::test]
    async fn test_process_backend_from_config() {
        let config = BackendConfig {
            plugin: PluginKind::Minecraft,
            ..Default::default()
        };
        let backend = ServerBackend::from_config(&config).await.unwrap();
        assert_eq!(backend.kind(), "process");
        assert_eq!(backend.status(), BackendStatus::Stopped);
        assert!(backend.validates_clients());
    }

    #[tokio::test]
    async fn test_generic_process_requires_command() {
        let err = ServerBackend::from_config(&BackendConfig::default())
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("requires a 'command' field"));
    }

    #[tokio::test]
    async fn test_lifecycle_calls_are_idempotent() {
        let backend = Bare {
            status: StatusCell::default(),
        };

        backend.stop().await.unwrap();
        backend.pause().await.unwrap();
        backend.unpause().await.unwrap();
        assert_eq!(backend.status(), BackendStatus::Stopped);

        backend.start().await.unwrap();
        backend.start().await.unwrap();
        assert_eq!(backend.status(), BackendStatus::Running);

        backend.pause().await.unwrap();
        backend.pause().await.unwrap();
        assert_eq!(backend.status(), BackendStatus::Paused);

        backend.unpause().await.unwrap();
        backend.unpause().await.unwrap();
        assert_eq!(backend.status(), BackendStatus::Running);

        backend.stop().await.unwrap();
        backend.stop().await.unwrap();
        assert_eq!(backend.status(), BackendStatus::Stopped);

        backend.close().await;
        backend.close().await;
    }
}
