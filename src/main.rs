use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};
use zeroscale::backend::ServerBackend;
use zeroscale::config::{BackendConfig, BackendType, Config, ProxyConfig, Strategy};
use zeroscale::coordinator::ZeroScale;
use zeroscale::plugins::PluginKind;

#[derive(Parser, Debug)]
#[command(name = "zeroscale", version, about = "Scale-to-zero TCP proxy")]
struct Cli {
    #[command(flatten)]
    proxy: ProxyArgs,

    #[command(subcommand)]
    command: Command,
}

/// Flags shared by every subcommand
#[derive(Args, Debug)]
struct ProxyArgs {
    /// Host the backend listens on
    #[arg(short = 'H', long, global = true)]
    server_host: Option<String>,

    /// Stop the backend when idle instead of pausing it
    #[arg(short = 'm', long, global = true)]
    method_stop: bool,

    /// Seconds without clients before the backend is paused or stopped
    #[arg(short = 't', long, value_name = "SECS", global = true)]
    idle_shutdown: Option<u64>,

    /// Seconds to wait for the backend to stop when exiting
    #[arg(short = 's', long, value_name = "SECS", global = true)]
    shutdown_timeout: Option<u64>,

    /// Start the backend for any client, without checking its handshake
    #[arg(short = 'b', long, global = true)]
    ignore_bad_clients: bool,

    /// Log lifecycle events
    #[arg(short = 'i', long, global = true)]
    info: bool,

    /// Log per-connection detail
    #[arg(short = 'd', long, global = true)]
    debug: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run from a TOML configuration file
    Run {
        #[arg(short, long, default_value = "zeroscale.toml")]
        config: PathBuf,
    },

    /// Spawn the backend as a local process
    Process {
        /// Server plugin: generic, minecraft or terraria
        plugin: PluginKind,

        /// Port clients connect to
        listen_port: u16,

        /// Port the backend listens on (default: listen_port)
        server_port: Option<u16>,

        /// Working directory for the server process
        #[arg(short = 'w', long)]
        working_directory: Option<PathBuf>,

        #[arg(long, value_name = "SIGNAL")]
        pause_signal: Option<i32>,

        #[arg(long, value_name = "SIGNAL")]
        unpause_signal: Option<i32>,

        #[arg(long, value_name = "SIGNAL")]
        stop_signal: Option<i32>,

        /// Server command and arguments (default: the plugin's command)
        #[arg(last = true)]
        command: Vec<String>,
    },

    /// Control an existing Docker container
    Docker {
        /// Port clients connect to
        listen_port: u16,

        /// Port the container is published on
        server_port: u16,

        /// Container id or name
        container_id: String,

        /// Plugin used to validate clients and answer while starting
        #[arg(short = 'p', long)]
        server_plugin: Option<PluginKind>,

        /// Leave the container running when the proxy exits
        #[arg(long)]
        disable_exit_stop: bool,

        /// Docker daemon address, e.g. unix:///var/run/docker.sock
        #[arg(long)]
        docker_host: Option<String>,
    },
}

impl ProxyArgs {
    fn log_directive(&self) -> &'static str {
        if self.debug {
            "zeroscale=debug"
        } else if self.info {
            "zeroscale=info"
        } else {
            "zeroscale=warn"
        }
    }

    /// Apply command-line overrides on top of file or subcommand settings
    fn apply(&self, proxy: &mut ProxyConfig) {
        if let Some(ref host) = self.server_host {
            proxy.server_host = host.clone();
        }
        if self.method_stop {
            proxy.method = Strategy::Stop;
        }
        if let Some(secs) = self.idle_shutdown {
            proxy.idle_shutdown_secs = secs;
        }
        if let Some(secs) = self.shutdown_timeout {
            proxy.shutdown_timeout_secs = secs;
        }
        if self.ignore_bad_clients {
            proxy.ignore_bad_clients = true;
        }
    }
}

impl Cli {
    fn into_config(self) -> anyhow::Result<Config> {
        let mut config = match self.command {
            Command::Run { config } => {
                let loaded = Config::load(&config)?;
                info!(path = %config.display(), "Configuration loaded");
                loaded
            }
            Command::Process {
                plugin,
                listen_port,
                server_port,
                working_directory,
                pause_signal,
                unpause_signal,
                stop_signal,
                command,
            } => {
                let defaults = BackendConfig::default();
                let mut command = command.into_iter();
                Config {
                    proxy: ProxyConfig {
                        listen_port,
                        server_port,
                        ..Default::default()
                    },
                    backend: BackendConfig {
                        backend_type: BackendType::Process,
                        plugin,
                        command: command.next(),
                        args: command.collect(),
                        working_dir: working_directory,
                        stop_signal: stop_signal.unwrap_or(defaults.stop_signal),
                        pause_signal: pause_signal.unwrap_or(defaults.pause_signal),
                        unpause_signal: unpause_signal.unwrap_or(defaults.unpause_signal),
                        ..defaults
                    },
                }
            }
            Command::Docker {
                listen_port,
                server_port,
                container_id,
                server_plugin,
                disable_exit_stop,
                docker_host,
            } => Config {
                proxy: ProxyConfig {
                    listen_port,
                    server_port: Some(server_port),
                    stop_on_exit: !disable_exit_stop,
                    ..Default::default()
                },
                backend: BackendConfig {
                    backend_type: BackendType::Docker,
                    plugin: server_plugin.unwrap_or_default(),
                    container_id: Some(container_id),
                    docker_host,
                    ..Default::default()
                },
            },
        };

        self.proxy.apply(&mut config.proxy);
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(cli.proxy.log_directive().parse().expect("valid log directive"))
                .add_directive("backend=info".parse().expect("valid log directive")),
        )
        .init();

    let config = cli.into_config().map_err(|e| {
        error!(error = %e, "Invalid configuration");
        e
    })?;

    let backend = ServerBackend::from_config(&config.backend).await.map_err(|e| {
        error!(error = %e, "Failed to set up backend");
        e
    })?;
    info!(
        name = env!("CARGO_PKG_NAME"),
        version = env!("CARGO_PKG_VERSION"),
        backend = backend.kind(),
        plugin = %config.backend.plugin,
        "Starting zeroscale"
    );

    let proxy = Arc::new(ZeroScale::new(Arc::new(backend), &config.proxy));
    let listener = proxy.bind().await.map_err(|e| {
        error!(addr = %config.proxy.listen_addr(), error = %e, "Failed to bind listener");
        e
    })?;

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = tokio::spawn(Arc::clone(&proxy).serve(listener, shutdown_rx));

    wait_for_signal().await?;
    let _ = shutdown_tx.send(true);

    server.await??;
    info!("Shutdown complete");
    Ok(())
}

/// Wait for Ctrl+C, or SIGTERM on unix
async fn wait_for_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    Ok(())
}
