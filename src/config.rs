use crate::plugins::{Plugin, PluginKind};
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Complete configuration for one proxy instance
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Listener, backend address and idle policy
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// How the backend is launched and controlled
    #[serde(default)]
    pub backend: BackendConfig,
}

/// What to do with a backend once it has been idle long enough
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// Suspend the backend and resume it on the next connection (default)
    #[default]
    Pause,
    /// Terminate the backend and start it again on demand
    Stop,
}

impl Strategy {
    pub fn action(&self) -> &'static str {
        match self {
            Strategy::Pause => "pause",
            Strategy::Stop => "stop",
        }
    }

    pub fn action_progressive(&self) -> &'static str {
        match self {
            Strategy::Pause => "pausing",
            Strategy::Stop => "stopping",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.action())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProxyConfig {
    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Public port clients connect to
    #[serde(default)]
    pub listen_port: u16,

    /// Host the backend listens on (default: localhost)
    #[serde(default = "default_server_host")]
    pub server_host: String,

    /// Port the backend listens on (default: listen_port)
    pub server_port: Option<u16>,

    /// Idle management strategy: "pause" (default) or "stop"
    #[serde(default)]
    pub method: Strategy,

    /// Seconds without connections before the backend is paused or stopped
    #[serde(default = "default_idle_shutdown")]
    pub idle_shutdown_secs: u64,

    /// Upper bound on stopping the backend when the proxy exits
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    /// Upper bound on opening the backend connection for a proxied client
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// How long to wait for a client's first bytes while the backend is down
    #[serde(default = "default_validation_timeout")]
    pub validation_timeout_secs: u64,

    /// Start the backend for any client, skipping handshake validation
    #[serde(default)]
    pub ignore_bad_clients: bool,

    /// Stop the backend when the proxy exits (default: true)
    #[serde(default = "default_true")]
    pub stop_on_exit: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            listen_port: 0,
            server_host: default_server_host(),
            server_port: None,
            method: Strategy::default(),
            idle_shutdown_secs: default_idle_shutdown(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            validation_timeout_secs: default_validation_timeout(),
            ignore_bad_clients: false,
            stop_on_exit: true,
        }
    }
}

impl ProxyConfig {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.listen_port)
    }

    pub fn server_port(&self) -> u16 {
        self.server_port.unwrap_or(self.listen_port)
    }

    pub fn idle_shutdown(&self) -> Duration {
        Duration::from_secs(self.idle_shutdown_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn validation_timeout(&self) -> Duration {
        Duration::from_secs(self.validation_timeout_secs)
    }

    fn validate(&self, errors: &mut Vec<String>) {
        if self.listen_port == 0 {
            errors.push("proxy: 'listen_port' must be greater than 0".to_string());
        }
        if self.server_port == Some(0) {
            errors.push("proxy: 'server_port' must be greater than 0".to_string());
        }
        if self.listen_port != 0
            && self.server_port() == self.listen_port
            && is_local_host(&self.server_host)
        {
            errors.push(format!(
                "proxy: backend {}:{} is the proxy's own listener, set 'server_port'",
                self.server_host,
                self.server_port()
            ));
        }
        if self.connect_timeout_secs == 0 {
            errors.push("proxy: 'connect_timeout_secs' must be greater than 0".to_string());
        }
        if self.validation_timeout_secs == 0 {
            errors.push("proxy: 'validation_timeout_secs' must be greater than 0".to_string());
        }
    }
}

/// Backend driver: spawned local process or existing Docker container
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    /// Process spawned and signalled directly (default)
    #[default]
    Process,
    /// Existing container controlled through the Docker API
    Docker,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    /// Backend type: "process" (default) or "docker"
    #[serde(default, rename = "type")]
    pub backend_type: BackendType,

    /// Server protocol knowledge: "generic" (default), "minecraft" or "terraria"
    #[serde(default)]
    pub plugin: PluginKind,

    // === Process fields ===
    /// Command to execute. Split shell-style when `args` is empty.
    ///
    /// Optional for plugins that ship a default command.
    pub command: Option<String>,

    /// Arguments to pass to the command
    #[serde(default)]
    pub args: Vec<String>,

    /// Working directory for the process
    pub working_dir: Option<PathBuf>,

    /// Extra environment variables for the process
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Signal sent to stop a process without a console stop command (default: SIGINT)
    #[serde(default = "default_stop_signal")]
    pub stop_signal: i32,

    /// Signal used to pause the process (default: SIGTSTP)
    #[serde(default = "default_pause_signal")]
    pub pause_signal: i32,

    /// Signal used to resume the process (default: SIGCONT)
    #[serde(default = "default_unpause_signal")]
    pub unpause_signal: i32,

    // === Docker fields ===
    /// Container id or name (docker only)
    pub container_id: Option<String>,

    /// Docker daemon address, e.g. "unix:///var/run/docker.sock" (docker only)
    pub docker_host: Option<String>,

    /// Interval between container health checks while starting
    #[serde(default = "default_health_poll_interval")]
    pub health_poll_interval_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            backend_type: BackendType::default(),
            plugin: PluginKind::default(),
            command: None,
            args: Vec::new(),
            working_dir: None,
            env: HashMap::new(),
            stop_signal: default_stop_signal(),
            pause_signal: default_pause_signal(),
            unpause_signal: default_unpause_signal(),
            container_id: None,
            docker_host: None,
            health_poll_interval_ms: default_health_poll_interval(),
        }
    }
}

impl BackendConfig {
    /// Program and arguments to spawn, falling back to the plugin's default command
    pub fn resolved_command(&self) -> Result<Vec<String>, String> {
        let command = match &self.command {
            Some(command) if self.args.is_empty() => shell_words::split(command)
                .map_err(|e| format!("backend: cannot parse 'command': {}", e))?,
            Some(command) => std::iter::once(command.clone())
                .chain(self.args.iter().cloned())
                .collect(),
            None => Plugin::new(self.plugin).default_command().ok_or_else(|| {
                format!(
                    "backend: the {} plugin requires a 'command' field",
                    self.plugin
                )
            })?,
        };

        if command.first().map_or(true, |program| program.is_empty()) {
            return Err("backend: 'command' must not be empty".to_string());
        }
        Ok(command)
    }

    pub fn health_poll_interval(&self) -> Duration {
        Duration::from_millis(self.health_poll_interval_ms)
    }

    fn validate(&self, errors: &mut Vec<String>) {
        match self.backend_type {
            BackendType::Process => {
                if let Err(e) = self.resolved_command() {
                    errors.push(e);
                }
                for (name, signal) in [
                    ("stop_signal", self.stop_signal),
                    ("pause_signal", self.pause_signal),
                    ("unpause_signal", self.unpause_signal),
                ] {
                    if !is_valid_signal(signal) {
                        errors.push(format!(
                            "backend: '{}' = {} is not a valid signal number",
                            name, signal
                        ));
                    }
                }
            }
            BackendType::Docker => {
                if self.container_id.as_deref().map_or(true, str::is_empty) {
                    errors.push(
                        "backend: docker backend requires 'container_id' field".to_string(),
                    );
                }
                if self.health_poll_interval_ms == 0 {
                    errors.push(
                        "backend: 'health_poll_interval_ms' must be greater than 0".to_string(),
                    );
                }
            }
        }
    }
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_server_host() -> String {
    "localhost".to_string()
}

fn default_idle_shutdown() -> u64 {
    15
}

fn default_shutdown_timeout() -> u64 {
    15
}

fn default_connect_timeout() -> u64 {
    20
}

fn default_validation_timeout() -> u64 {
    5
}

fn default_true() -> bool {
    true
}

fn default_stop_signal() -> i32 {
    2 // SIGINT
}

fn default_pause_signal() -> i32 {
    20 // SIGTSTP
}

fn default_unpause_signal() -> i32 {
    18 // SIGCONT
}

fn default_health_poll_interval() -> u64 {
    500
}

fn is_valid_signal(signal: i32) -> bool {
    (1..=64).contains(&signal)
}

fn is_local_host(host: &str) -> bool {
    matches!(host, "localhost" | "127.0.0.1" | "::1" | "0.0.0.0")
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Cannot read config '{}': {}", path.display(), e))?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        self.proxy.validate(&mut errors);
        self.backend.validate(&mut errors);

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[proxy]
bind = "127.0.0.1"
listen_port = 25565
server_port = 25566
method = "stop"
idle_shutdown_secs = 60
ignore_bad_clients = true

[backend]
type = "process"
plugin = "minecraft"
command = "java"
args = ["-Xmx2G", "-jar", "server.jar", "nogui"]
working_dir = "/srv/minecraft"
env = { JAVA_HOME = "/opt/java" }
"#;

        let config: Config = toml::from_str(toml).unwrap();
        config.validate().unwrap();

        assert_eq!(config.proxy.listen_addr(), "127.0.0.1:25565");
        assert_eq!(config.proxy.server_port(), 25566);
        assert_eq!(config.proxy.method, Strategy::Stop);
        assert_eq!(config.proxy.idle_shutdown(), Duration::from_secs(60));
        assert!(config.proxy.ignore_bad_clients);
        assert!(config.proxy.stop_on_exit);

        assert_eq!(config.backend.backend_type, BackendType::Process);
        assert_eq!(config.backend.plugin, PluginKind::Minecraft);
        assert_eq!(
            config.backend.working_dir.as_deref(),
            Some(Path::new("/srv/minecraft"))
        );
        assert_eq!(config.backend.env.get("JAVA_HOME").unwrap(), "/opt/java");
        assert_eq!(
            config.backend.resolved_command().unwrap(),
            vec!["java", "-Xmx2G", "-jar", "server.jar", "nogui"]
        );
    }

    #[test]
    fn test_defaults() {
        let proxy = ProxyConfig::default();
        assert_eq!(proxy.bind, "0.0.0.0");
        assert_eq!(proxy.server_host, "localhost");
        assert_eq!(proxy.method, Strategy::Pause);
        assert_eq!(proxy.idle_shutdown(), Duration::from_secs(15));
        assert_eq!(proxy.shutdown_timeout(), Duration::from_secs(15));
        assert_eq!(proxy.connect_timeout(), Duration::from_secs(20));
        assert_eq!(proxy.validation_timeout(), Duration::from_secs(5));
        assert!(!proxy.ignore_bad_clients);
        assert!(proxy.stop_on_exit);

        let backend = BackendConfig::default();
        assert_eq!(backend.plugin, PluginKind::Generic);
        assert_eq!(backend.stop_signal, 2);
        assert_eq!(backend.pause_signal, 20);
        assert_eq!(backend.unpause_signal, 18);
        assert_eq!(backend.health_poll_interval(), Duration::from_millis(500));
    }

    #[test]
    fn test_server_port_defaults_to_listen_port() {
        let toml = r#"
[proxy]
listen_port = 8080
server_host = "10.0.0.5"

[backend]
command = "./server"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.proxy.server_port(), 8080);
        config.validate().unwrap();
    }

    #[test]
    fn test_command_split_when_no_args() {
        let backend = BackendConfig {
            command: Some("python3 -m http.server 'my port'".to_string()),
            ..Default::default()
        };
        assert_eq!(
            backend.resolved_command().unwrap(),
            vec!["python3", "-m", "http.server", "my port"]
        );
    }

    #[test]
    fn test_plugin_default_command() {
        let backend = BackendConfig {
            plugin: PluginKind::Terraria,
            ..Default::default()
        };
        assert_eq!(
            backend.resolved_command().unwrap(),
            vec!["TerrariaServer.bin.x86_64"]
        );
    }

    #[test]
    fn test_validation_errors_are_collected() {
        let toml = r#"
[proxy]
listen_port = 0

[backend]
stop_signal = 99
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.starts_with("Configuration errors:"));
        assert!(err.contains("'listen_port' must be greater than 0"));
        assert!(err.contains("generic plugin requires a 'command' field"));
        assert!(err.contains("'stop_signal' = 99 is not a valid signal number"));
    }

    #[test]
    fn test_self_proxy_rejected() {
        let toml = r#"
[proxy]
listen_port = 7777

[backend]
plugin = "terraria"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("is the proxy's own listener"));
    }

    #[test]
    fn test_docker_requires_container_id() {
        let toml = r#"
[proxy]
listen_port = 8080
server_port = 8081

[backend]
type = "docker"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("requires 'container_id'"));

        let toml = r#"
[proxy]
listen_port = 8080
server_port = 8081

[backend]
type = "docker"
container_id = "web"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        config.validate().unwrap();
    }

    #[test]
    fn test_unknown_method_rejected() {
        let toml = r#"
[proxy]
listen_port = 8080
method = "hibernate"
"#;
        assert!(toml::from_str::<Config>(toml).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[proxy]
listen_port = 9000
server_port = 9001

[backend]
command = "sleep 60"
"#
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.proxy.listen_port, 9000);
        assert_eq!(config.backend.resolved_command().unwrap(), vec!["sleep", "60"]);
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load("/nonexistent/zeroscale.toml").unwrap_err();
        assert!(err.to_string().contains("Cannot read config"));
    }
}
