//! Accept loop and per-connection lifecycle decisions
//!
//! Every accepted client is routed once on the backend status read at accept time:
//! streamed through when the backend is up, resumed first when it is paused, and
//! otherwise answered with the backend's "starting up" payload while a start is kicked
//! off in the background of that connection.

use crate::backend::Backend;
use crate::config::{ProxyConfig, Strategy};
use crate::error::{ConnectionError, TunnelError};
use crate::scheduler::IdleScheduler;
use crate::status::BackendStatus;
use crate::tunnel;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

/// Bytes read from a client to validate its handshake
const VALIDATION_READ_SIZE: usize = 1024;

/// How a freshly accepted client is handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Stream straight through to the backend
    Proxy,
    /// Resume the backend, then stream through
    UnpauseThenProxy,
    /// Send the fake status, close, and start the backend
    NotReady,
}

/// Decide how to handle a client given the backend status at accept time
pub fn route(strategy: Strategy, status: BackendStatus) -> Route {
    match (strategy, status) {
        (_, BackendStatus::Running) => Route::Proxy,
        (Strategy::Pause, BackendStatus::Paused) => Route::UnpauseThenProxy,
        _ => Route::NotReady,
    }
}

/// Scale-to-zero front proxy for a single backend
pub struct ZeroScale<B: Backend> {
    backend: Arc<B>,
    scheduler: Arc<IdleScheduler<B>>,
    listen_addr: String,
    server_host: String,
    server_port: u16,
    strategy: Strategy,
    idle_shutdown: Duration,
    shutdown_timeout: Duration,
    connect_timeout: Duration,
    validation_timeout: Duration,
    ignore_bad_clients: bool,
    stop_on_exit: bool,
}

impl<B: Backend> ZeroScale<B> {
    pub fn new(backend: Arc<B>, config: &ProxyConfig) -> Self {
        let idle_shutdown = config.idle_shutdown();
        Self {
            scheduler: IdleScheduler::new(Arc::clone(&backend), config.method, idle_shutdown),
            backend,
            listen_addr: config.listen_addr(),
            server_host: config.server_host.clone(),
            server_port: config.server_port(),
            strategy: config.method,
            idle_shutdown,
            shutdown_timeout: config.shutdown_timeout(),
            connect_timeout: config.connect_timeout(),
            validation_timeout: config.validation_timeout(),
            ignore_bad_clients: config.ignore_bad_clients,
            stop_on_exit: config.stop_on_exit,
        }
    }

    /// Override the idle window with sub-second precision
    pub fn with_idle_shutdown(mut self, idle_shutdown: Duration) -> Self {
        self.idle_shutdown = idle_shutdown;
        self.scheduler =
            IdleScheduler::new(Arc::clone(&self.backend), self.strategy, idle_shutdown);
        self
    }

    pub fn with_shutdown_timeout(mut self, shutdown_timeout: Duration) -> Self {
        self.shutdown_timeout = shutdown_timeout;
        self
    }

    pub fn with_validation_timeout(mut self, validation_timeout: Duration) -> Self {
        self.validation_timeout = validation_timeout;
        self
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn scheduler(&self) -> &Arc<IdleScheduler<B>> {
        &self.scheduler
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Bind the public listener
    pub async fn bind(&self) -> std::io::Result<TcpListener> {
        TcpListener::bind(&self.listen_addr).await
    }

    /// Bind and serve until `shutdown_rx` flips to true
    pub async fn run(self: Arc<Self>, shutdown_rx: watch::Receiver<bool>) -> anyhow::Result<()> {
        let listener = self
            .bind()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind {}: {}", self.listen_addr, e))?;
        self.serve(listener, shutdown_rx).await
    }

    /// Accept clients on `listener` until shutdown, then stop and release the backend
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        info!(
            %addr,
            backend = %format!("{}:{}", self.server_host, self.server_port),
            strategy = %self.strategy,
            idle_shutdown_secs = self.idle_shutdown.as_secs_f64(),
            "Proxy listening"
        );

        if self.strategy == Strategy::Pause {
            // Warm the backend up so the first client does not wait for a cold start
            let this = Arc::clone(&self);
            tokio::spawn(async move {
                match this.backend.start().await {
                    Ok(()) => this.scheduler.schedule_stop(),
                    Err(e) => error!(error = %e, "Initial backend start failed"),
                }
            });
        }

        self.accept_loop(&listener, &mut shutdown_rx).await;

        self.shutdown().await;
        drop(listener);
        info!("Proxy stopped");
        Ok(())
    }

    async fn accept_loop(
        self: &Arc<Self>,
        listener: &TcpListener,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) {
        if *shutdown_rx.borrow() {
            return;
        }
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let this = Arc::clone(self);
                            let connection_id = Uuid::new_v4();
                            let span = tracing::info_span!("connection", id = %connection_id, %addr);
                            tokio::spawn(
                                async move {
                                    if let Err(e) = this.handle_connection(stream, addr).await {
                                        debug!(error = %e, "Connection error");
                                    }
                                }
                                .instrument(span),
                            );
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Proxy shutting down");
                        break;
                    }
                }
            }
        }
    }

    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        addr: SocketAddr,
    ) -> Result<(), ConnectionError> {
        let _ = stream.set_nodelay(true);
        let status = self.backend.status();
        let route = route(self.strategy, status);
        debug!(%status, ?route, "Accepted client");

        match route {
            Route::Proxy => self.proxy_client(stream).await,
            Route::UnpauseThenProxy => {
                info!("Backend paused, resuming for client");
                self.backend.unpause().await?;
                self.proxy_client(stream).await
            }
            Route::NotReady => self.not_ready(stream, addr).await,
        }
    }

    async fn proxy_client(&self, stream: TcpStream) -> Result<(), ConnectionError> {
        let _guard = self.scheduler.connection_opened();

        let tunnel = tunnel::proxy(
            stream,
            &self.server_host,
            self.server_port,
            self.connect_timeout,
        );
        match tunnel.await {
            Ok(stats) => {
                debug!(finished = ?stats.finished, bytes = stats.bytes, "Client disconnected");
                Ok(())
            }
            Err(e @ (TunnelError::Connect { .. } | TunnelError::ConnectTimeout { .. })) => {
                warn!(error = %e, "Cannot reach backend, dropping client");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn not_ready(
        &self,
        mut stream: TcpStream,
        addr: SocketAddr,
    ) -> Result<(), ConnectionError> {
        if !self.ignore_bad_clients && self.backend.validates_clients() {
            let mut buf = vec![0u8; VALIDATION_READ_SIZE];
            let read = tokio::time::timeout(self.validation_timeout, stream.read(&mut buf)).await;
            let n = match read {
                Ok(Ok(0)) => {
                    debug!("Client closed before sending a handshake");
                    return Ok(());
                }
                Ok(Ok(n)) => n,
                Ok(Err(source)) => return Err(ConnectionError::Client { addr, source }),
                Err(_) => {
                    debug!(
                        timeout_secs = self.validation_timeout.as_secs_f64(),
                        "Client sent no handshake in time"
                    );
                    return Ok(());
                }
            };
            if !self.backend.is_valid_connection(&buf[..n]) {
                info!("Ignoring invalid client");
                return Ok(());
            }
        }

        info!("Backend not ready, sending starting status");
        let fake_status = self.backend.fake_status();
        let written = async {
            stream.write_all(&fake_status).await?;
            stream.shutdown().await
        }
        .await;
        if let Err(e) = written {
            debug!(error = %e, "Failed to send starting status");
        }
        drop(stream);

        match self.backend.start().await {
            Ok(()) => {
                self.scheduler.schedule_stop();
                Ok(())
            }
            Err(e) => {
                error!(error = %e, permanent = e.is_permanent(), "Backend start failed");
                Ok(())
            }
        }
    }

    /// Cancel the idle action, stop the backend within the shutdown timeout, release it
    async fn shutdown(&self) {
        self.scheduler.cancel_stop();

        if self.stop_on_exit {
            info!(status = %self.backend.status(), "Stopping backend before exit");
            match tokio::time::timeout(self.shutdown_timeout, self.backend.stop()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "Backend stop failed during shutdown"),
                Err(_) => warn!(
                    timeout_secs = self.shutdown_timeout.as_secs_f64(),
                    "Backend did not stop within the shutdown timeout"
                ),
            }
        }

        self.backend.close().await;
    }
}
