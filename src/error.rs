//! Error types for backends, tunnels and client connections

use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Failure of a backend lifecycle operation
#[derive(Debug, Error)]
pub enum BackendError {
    /// The backend process could not be launched
    #[error("failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The process exited before reporting it was ready
    #[error("backend exited before becoming ready")]
    ExitedBeforeReady,

    /// A stdio pipe needed for readiness detection or stop commands was not captured
    #[error("backend process has no {0} pipe")]
    MissingPipe(&'static str),

    /// Delivering a signal to the backend process failed
    #[error("failed to send signal {signal} to pid {pid}: {source}")]
    Signal {
        signal: i32,
        pid: u32,
        #[source]
        source: std::io::Error,
    },

    /// The configured container does not exist
    #[error("container '{0}' does not exist")]
    ContainerNotFound(String),

    /// Docker API failure
    #[error("docker API error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl BackendError {
    /// Whether retrying the same operation cannot succeed without operator action
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            BackendError::Spawn { .. }
                | BackendError::ExitedBeforeReady
                | BackendError::ContainerNotFound(_)
        )
    }
}

/// Failure to establish or run a proxy tunnel
#[derive(Debug, Error)]
pub enum TunnelError {
    /// Backend refused or reset the connection attempt
    #[error("failed to connect to backend {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// Backend did not accept within the connect timeout
    #[error("timed out after {timeout:?} connecting to backend {addr}")]
    ConnectTimeout { addr: String, timeout: Duration },

    /// A pipe failed mid-stream
    #[error("tunnel I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure while handling one client connection
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error(transparent)]
    Tunnel(#[from] TunnelError),

    #[error("backend control failed: {0}")]
    Backend(#[from] BackendError),

    #[error("client {addr} I/O error: {source}")]
    Client {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}
