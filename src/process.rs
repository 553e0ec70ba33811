//! Backend driver for a locally spawned server process
//!
//! The child is owned by an exit watcher task, so an unexpected crash is noticed even
//! while nobody is calling into the backend. Everything else reaches the process through
//! its pid (signals) or its stdin (console stop commands).

use crate::backend::Backend;
use crate::config::BackendConfig;
use crate::error::BackendError;
use crate::plugins::Plugin;
use crate::status::{BackendStatus, StatusCell, Transition};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader, Lines};
use tokio::process::{ChildStdin, Command};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How long a stopping process gets before it is killed
const STOP_GRACE_PERIOD: Duration = Duration::from_secs(60);

#[cfg(unix)]
const SIGKILL: i32 = libc::SIGKILL;
#[cfg(not(unix))]
const SIGKILL: i32 = 9;

/// Launch parameters for the backend process
#[derive(Debug, Clone)]
pub struct ProcessSettings {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub stop_signal: i32,
    pub pause_signal: i32,
    pub unpause_signal: i32,
}

impl ProcessSettings {
    /// Settings running `program args...` with the default signals
    pub fn new(program: &str, args: &[&str]) -> Self {
        let defaults = BackendConfig::default();
        Self {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            working_dir: None,
            env: HashMap::new(),
            stop_signal: defaults.stop_signal,
            pause_signal: defaults.pause_signal,
            unpause_signal: defaults.unpause_signal,
        }
    }

    pub fn from_config(config: &BackendConfig) -> Result<Self, String> {
        let mut command = config.resolved_command()?.into_iter();
        let program = command
            .next()
            .ok_or_else(|| "backend: 'command' must not be empty".to_string())?;

        Ok(Self {
            program,
            args: command.collect(),
            working_dir: config.working_dir.clone(),
            env: config.env.clone(),
            stop_signal: config.stop_signal,
            pause_signal: config.pause_signal,
            unpause_signal: config.unpause_signal,
        })
    }

    fn display_command(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Handle to a spawned process
struct RunningProcess {
    pid: u32,
    stdin: Option<ChildStdin>,
    exited: watch::Receiver<bool>,
}

impl RunningProcess {
    fn has_exited(&self) -> bool {
        *self.exited.borrow()
    }

    async fn wait(&mut self) {
        wait_for_exit(&mut self.exited).await;
    }
}

async fn wait_for_exit(exited: &mut watch::Receiver<bool>) {
    // A dropped sender also means the watcher saw the exit
    let _ = exited.wait_for(|exited| *exited).await;
}

pub struct ProcessBackend {
    plugin: Plugin,
    settings: ProcessSettings,
    status: Arc<StatusCell>,
    process: tokio::sync::Mutex<Option<RunningProcess>>,
    /// Cancels the readiness watcher of an in-progress start
    startup: parking_lot::Mutex<Option<CancellationToken>>,
}

impl ProcessBackend {
    pub fn new(plugin: Plugin, settings: ProcessSettings) -> Self {
        Self {
            plugin,
            settings,
            status: Arc::new(StatusCell::default()),
            process: tokio::sync::Mutex::new(None),
            startup: parking_lot::Mutex::new(None),
        }
    }

    pub fn plugin(&self) -> &Plugin {
        &self.plugin
    }

    /// Pid of the running process, if any
    pub async fn pid(&self) -> Option<u32> {
        self.process.lock().await.as_ref().map(|p| p.pid)
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.settings.program);
        cmd.args(&self.settings.args);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.stdin(if self.plugin.stop_command().is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

        if let Some(ref working_dir) = self.settings.working_dir {
            cmd.current_dir(working_dir);
        }
        for (key, value) in &self.settings.env {
            cmd.env(key, value);
        }

        // Keep terminal Ctrl+C away from the server, shutdown stops it gracefully
        #[cfg(unix)]
        cmd.process_group(0);

        cmd
    }

    /// Whether the registered process is gone (or was never registered)
    async fn process_exited(&self) -> bool {
        self.process
            .lock()
            .await
            .as_ref()
            .map_or(true, RunningProcess::has_exited)
    }

    /// Spawn the child and its exit watcher, returning its stdout line reader.
    ///
    /// The child is registered under the process lock, which is also held by whoever
    /// cancels `cancelled`. A child spawned after cancellation is killed here instead.
    async fn spawn(
        &self,
        cancelled: &CancellationToken,
    ) -> Result<Lines<BufReader<tokio::process::ChildStdout>>, BackendError> {
        let command = self.settings.display_command();
        info!(command = %command, plugin = %self.plugin.kind(), "Starting backend process");

        let mut child = self
            .command()
            .spawn()
            .map_err(|source| BackendError::Spawn { command, source })?;

        let pid = child.id().ok_or_else(|| {
            BackendError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "spawned process has no pid",
            ))
        })?;
        let stdout = child.stdout.take().ok_or(BackendError::MissingPipe("stdout"))?;
        if let Some(stderr) = child.stderr.take() {
            forward_output(BufReader::new(stderr).lines(), "stderr");
        }
        let stdin = child.stdin.take();

        let (exit_tx, exit_rx) = watch::channel(false);
        let status = Arc::clone(&self.status);
        tokio::spawn(async move {
            match child.wait().await {
                Ok(exit) => debug!(pid, ?exit, "Backend process exited"),
                Err(e) => warn!(pid, error = %e, "Error waiting for backend process"),
            }
            let _ = exit_tx.send(true);
            // Nobody asked for this exit
            if status
                .advance_from(&[BackendStatus::Running, BackendStatus::Paused], Transition::Stop)
                .is_some()
            {
                status.advance(Transition::Exited);
                warn!(pid, "Backend process exited unexpectedly");
            }
        });

        let mut slot = self.process.lock().await;
        if cancelled.is_cancelled() {
            warn!(pid, "Startup cancelled while spawning, killing backend process");
            let _ = send_signal(pid, SIGKILL);
        } else {
            info!(pid, "Backend process spawned");
            *slot = Some(RunningProcess {
                pid,
                stdin,
                exited: exit_rx,
            });
        }

        Ok(BufReader::new(stdout).lines())
    }

    /// Read stdout until the plugin's ready line or until `cancelled`
    async fn wait_until_ready<R>(
        &self,
        lines: &mut Lines<BufReader<R>>,
        cancelled: &CancellationToken,
    ) -> Result<(), BackendError>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            tokio::select! {
                biased;
                _ = cancelled.cancelled() => return Ok(()),
                line = lines.next_line() => match line? {
                    Some(line) => {
                        info!(target: "backend", stream = "stdout", "{}", line);
                        if self.plugin.is_ready_line(&line) {
                            return Ok(());
                        }
                    }
                    None => return Err(BackendError::ExitedBeforeReady),
                },
            }
        }
    }

    /// Cancel an in-progress start while holding the process lock
    async fn cancel_startup(&self) -> tokio::sync::MutexGuard<'_, Option<RunningProcess>> {
        let slot = self.process.lock().await;
        if let Some(token) = self.startup.lock().take() {
            token.cancel();
        }
        slot
    }

    /// Kill and reap a process nobody is stopping gracefully
    async fn kill_leftover(&self) {
        let leftover = self.process.lock().await.take();
        if let Some(mut process) = leftover {
            if !process.has_exited() {
                warn!(pid = process.pid, "Killing backend process");
                let _ = send_signal(process.pid, SIGKILL);
            }
            process.wait().await;
        }
    }

    async fn signal(&self, signal: i32) -> Result<(), BackendError> {
        match self.pid().await {
            Some(pid) => send_signal(pid, signal),
            None => Ok(()),
        }
    }

    /// Ask the process to exit: console command when the plugin has one, else a signal
    async fn request_exit(&self, pid: u32, stdin: Option<&mut ChildStdin>) {
        if let (Some(command), Some(stdin)) = (self.plugin.stop_command(), stdin) {
            info!(pid, command = command.trim_end(), "Sending stop command");
            let written = async {
                stdin.write_all(command.as_bytes()).await?;
                stdin.flush().await
            }
            .await;
            match written {
                Ok(()) => return,
                Err(e) => warn!(pid, error = %e, "Cannot write stop command, signalling"),
            }
        }

        info!(pid, signal = self.settings.stop_signal, "Sending stop signal");
        if let Err(e) = send_signal(pid, self.settings.stop_signal) {
            warn!(error = %e, "Stop signal failed");
        }
    }
}

#[async_trait]
impl Backend for ProcessBackend {
    fn status(&self) -> BackendStatus {
        self.status.get()
    }

    async fn start(&self) -> Result<(), BackendError> {
        if self.status.advance(Transition::Start).is_none() {
            return Ok(());
        }

        let token = CancellationToken::new();
        *self.startup.lock() = Some(token.clone());

        let result = async {
            let mut lines = self.spawn(&token).await?;
            if self.plugin.watches_output() {
                self.wait_until_ready(&mut lines, &token).await?;
            }
            forward_output(lines, "stdout");
            Ok(())
        }
        .await;
        self.startup.lock().take();

        // Whoever cancelled owns the registered process now
        if token.is_cancelled() {
            debug!("Startup cancelled");
            // Only applies when close, not stop, cancelled us
            self.status.advance(Transition::Abort);
            return Ok(());
        }

        match result {
            Ok(()) => {
                if self.status.advance(Transition::Ready).is_none() {
                    return Ok(());
                }
                // The exit watcher publishes the exit before it looks at the status, so an
                // exit it saw while still Starting is caught here.
                if self.process_exited().await {
                    if self
                        .status
                        .advance_from(&[BackendStatus::Running], Transition::Stop)
                        .is_some()
                    {
                        self.status.advance(Transition::Exited);
                    }
                    self.process.lock().await.take();
                    let e = BackendError::ExitedBeforeReady;
                    error!(error = %e, "Backend failed to start");
                    return Err(e);
                }
                info!("Backend ready");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Backend failed to start");
                self.kill_leftover().await;
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
        info!(from = %previous, "Stopping backend");

        // The process stays registered until its exit is confirmed, so `close` can still
        // kill it if this future is dropped midway.
        let target = self.cancel_startup().await.as_mut().map(|process| {
            (process.pid, process.stdin.take(), process.exited.clone())
        });

        if let Some((pid, mut stdin, mut exited)) = target {
            if !*exited.borrow() {
                if previous == BackendStatus::Paused {
                    // A stopped process cannot act on the stop request
                    if let Err(e) = send_signal(pid, self.settings.unpause_signal) {
                        warn!(error = %e, "Cannot resume paused backend before stopping");
                    }
                }
                self.request_exit(pid, stdin.as_mut()).await;

                if tokio::time::timeout(STOP_GRACE_PERIOD, wait_for_exit(&mut exited))
                    .await
                    .is_err()
                {
                    warn!(
                        pid,
                        grace_period_secs = STOP_GRACE_PERIOD.as_secs(),
                        "Grace period exceeded, sending SIGKILL"
                    );
                    let _ = send_signal(pid, SIGKILL);
                    wait_for_exit(&mut exited).await;
                }
            }
            self.process.lock().await.take();
        }

        self.status.advance(Transition::Exited);
        info!("Backend stopped");
        Ok(())
    }

    async fn pause(&self) -> Result<(), BackendError> {
        if self.status.advance(Transition::Pause).is_none() {
            return Ok(());
        }
        info!("Pausing backend");
        if let Err(e) = self.signal(self.settings.pause_signal).await {
            warn!(error = %e, "Pause signal failed");
        }
        Ok(())
    }

    async fn unpause(&self) -> Result<(), BackendError> {
        if self.status.advance(Transition::Unpause).is_none() {
            return Ok(());
        }
        info!("Unpausing backend");
        if let Err(e) = self.signal(self.settings.unpause_signal).await {
            warn!(error = %e, "Unpause signal failed");
        }
        Ok(())
    }

    async fn close(&self) {
        drop(self.cancel_startup().await);
        self.kill_leftover().await;
        // A stop abandoned midway leaves the status at Stopping
        if self.status.advance(Transition::Exited).is_some() {
            debug!("Abandoned stop finished by close");
        }
    }

    fn validates_clients(&self) -> bool {
        self.plugin.validates_clients()
    }

    fn is_valid_connection(&self, initial: &[u8]) -> bool {
        self.plugin.is_valid_connection(initial)
    }

    fn fake_status(&self) -> Vec<u8> {
        self.plugin.fake_status().to_vec()
    }
}

/// Log the rest of a process output stream under the `backend` target
fn forward_output<R>(mut lines: Lines<BufReader<R>>, stream: &'static str)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        while let Ok(Some(line)) = lines.next_line().await {
            info!(target: "backend", stream, "{}", line);
        }
    });
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: i32) -> Result<(), BackendError> {
    let rc = unsafe { libc::kill(pid as i32, signal) };
    if rc == 0 {
        Ok(())
    } else {
        Err(BackendError::Signal {
            signal,
            pid,
            source: std::io::Error::last_os_error(),
        })
    }
}

#[cfg(not(unix))]
fn send_signal(pid: u32, signal: i32) -> Result<(), BackendError> {
    Err(BackendError::Signal {
        signal,
        pid,
        source: std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "signals are only supported on unix",
        ),
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::plugins::PluginKind;

    fn sleeper() -> ProcessBackend {
        ProcessBackend::new(Plugin::default(), ProcessSettings::new("sleep", &["60"]))
    }

    fn shell(plugin: PluginKind, script: &str) -> ProcessBackend {
        ProcessBackend::new(Plugin::new(plugin), ProcessSettings::new("sh", &["-c", script]))
    }

    /// Process state letter from /proc, e.g. 'S' sleeping or 'T' stopped
    #[cfg(target_os = "linux")]
    fn proc_state(pid: u32) -> Option<char> {
        let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
        let after_name = stat.rsplit_once(')')?.1;
        after_name.trim_start().chars().next()
    }

    fn process_alive(pid: u32) -> bool {
        unsafe { libc::kill(pid as i32, 0) == 0 }
    }

    async fn wait_for_status(backend: &ProcessBackend, expected: BackendStatus) {
        for _ in 0..100 {
            if backend.status() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("backend never reached {}", expected);
    }

    #[test]
    fn test_settings_from_config() {
        let config = BackendConfig {
            command: Some("java -jar server.jar".to_string()),
            working_dir: Some(PathBuf::from("/srv")),
            stop_signal: 15,
            ..Default::default()
        };
        let settings = ProcessSettings::from_config(&config).unwrap();
        assert_eq!(settings.program, "java");
        assert_eq!(settings.args, vec!["-jar", "server.jar"]);
        assert_eq!(settings.working_dir, Some(PathBuf::from("/srv")));
        assert_eq!(settings.stop_signal, 15);
        assert_eq!(settings.display_command(), "java -jar server.jar");
    }

    #[tokio::test]
    async fn test_start_and_stop_generic() {
        let backend = sleeper();
        assert_eq!(backend.status(), BackendStatus::Stopped);

        backend.start().await.unwrap();
        assert_eq!(backend.status(), BackendStatus::Running);
        assert!(backend.pid().await.is_some());

        // Second start is a no-op
        let pid = backend.pid().await;
        backend.start().await.unwrap();
        assert_eq!(backend.pid().await, pid);

        backend.stop().await.unwrap();
        assert_eq!(backend.status(), BackendStatus::Stopped);
        assert!(backend.pid().await.is_none());

        backend.stop().await.unwrap();
        assert_eq!(backend.status(), BackendStatus::Stopped);
    }

    #[tokio::test]
    async fn test_pause_and_unpause() {
        let backend = sleeper();
        backend.start().await.unwrap();
        let pid = backend.pid().await.unwrap();

        backend.pause().await.unwrap();
        assert_eq!(backend.status(), BackendStatus::Paused);
        #[cfg(target_os = "linux")]
        {
            tokio::time::sleep(Duration::from_millis(100)).await;
            assert_eq!(proc_state(pid), Some('T'));
        }

        backend.pause().await.unwrap();
        assert_eq!(backend.status(), BackendStatus::Paused);

        backend.unpause().await.unwrap();
        assert_eq!(backend.status(), BackendStatus::Running);
        #[cfg(target_os = "linux")]
        {
            tokio::time::sleep(Duration::from_millis(100)).await;
            assert_ne!(proc_state(pid), Some('T'));
        }

        backend.close().await;
    }

    #[tokio::test]
    async fn test_stop_while_paused() {
        let backend = sleeper();
        backend.start().await.unwrap();
        backend.pause().await.unwrap();

        tokio::time::timeout(Duration::from_secs(10), backend.stop())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(backend.status(), BackendStatus::Stopped);
    }

    #[tokio::test]
    async fn test_pause_requires_running() {
        let backend = sleeper();
        backend.pause().await.unwrap();
        backend.unpause().await.unwrap();
        assert_eq!(backend.status(), BackendStatus::Stopped);
    }

    #[tokio::test]
    async fn test_spawn_failure_is_permanent() {
        let backend = ProcessBackend::new(
            Plugin::default(),
            ProcessSettings::new("/nonexistent/zeroscale-test-server", &[]),
        );

        let err = backend.start().await.unwrap_err();
        assert!(matches!(err, BackendError::Spawn { .. }));
        assert!(err.is_permanent());
        assert_eq!(backend.status(), BackendStatus::Stopped);
    }

    #[tokio::test]
    async fn test_ready_line_detection() {
        let backend = shell(
            PluginKind::Minecraft,
            "echo 'Starting minecraft server'; \
             echo '[12:00:01] [Server thread/INFO]: Done (1.234s)! For help, type \"help\"'; \
             exec sleep 60",
        );

        backend.start().await.unwrap();
        assert_eq!(backend.status(), BackendStatus::Running);
        backend.close().await;
    }

    #[tokio::test]
    async fn test_exit_before_ready() {
        let backend = shell(PluginKind::Terraria, "echo 'Loading world'; exit 1");

        let err = backend.start().await.unwrap_err();
        assert!(matches!(err, BackendError::ExitedBeforeReady));
        assert_eq!(backend.status(), BackendStatus::Stopped);
        assert!(backend.pid().await.is_none());
    }

    #[tokio::test]
    async fn test_stop_command_on_stdin() {
        // Exits once it reads the console stop command
        let backend = shell(
            PluginKind::Terraria,
            "echo 'Server started'; read line; [ \"$line\" = exit ] && exit 0; sleep 60",
        );

        backend.start().await.unwrap();
        assert_eq!(backend.status(), BackendStatus::Running);

        tokio::time::timeout(Duration::from_secs(10), backend.stop())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(backend.status(), BackendStatus::Stopped);
    }

    #[tokio::test]
    async fn test_stop_during_startup() {
        // Never prints the ready line, exits on the console stop command
        let backend = Arc::new(shell(
            PluginKind::Minecraft,
            "echo 'Preparing level'; read line; exit 0",
        ));

        let starting = {
            let backend = Arc::clone(&backend);
            tokio::spawn(async move { backend.start().await })
        };
        wait_for_status(&backend, BackendStatus::Starting).await;
        while backend.pid().await.is_none() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        tokio::time::timeout(Duration::from_secs(10), backend.stop())
            .await
            .unwrap()
            .unwrap();
        starting.await.unwrap().unwrap();
        assert_eq!(backend.status(), BackendStatus::Stopped);
        assert!(backend.pid().await.is_none());
    }

    #[tokio::test]
    async fn test_unexpected_exit_marks_stopped() {
        let backend = ProcessBackend::new(Plugin::default(), ProcessSettings::new("sleep", &["0.2"]));

        backend.start().await.unwrap();
        assert_eq!(backend.status(), BackendStatus::Running);

        wait_for_status(&backend, BackendStatus::Stopped).await;
        backend.stop().await.unwrap();
        backend.close().await;
    }

    #[tokio::test]
    async fn test_close_kills_process_after_abandoned_stop() {
        // Ignores SIGINT, so a graceful stop never finishes
        let backend = shell(PluginKind::Generic, "trap '' INT; while :; do sleep 1; done");
        backend.start().await.unwrap();
        let pid = backend.pid().await.unwrap();

        let stopped = tokio::time::timeout(Duration::from_millis(500), backend.stop()).await;
        assert!(stopped.is_err());
        assert_eq!(backend.status(), BackendStatus::Stopping);
        assert_eq!(backend.pid().await, Some(pid));

        backend.close().await;
        assert!(!process_alive(pid));
        assert!(backend.pid().await.is_none());
        assert_eq!(backend.status(), BackendStatus::Stopped);
    }

    #[tokio::test]
    async fn test_close_during_startup_kills_process() {
        let backend = Arc::new(shell(PluginKind::Minecraft, "echo 'Preparing level'; sleep 60"));

        let starting = {
            let backend = Arc::clone(&backend);
            tokio::spawn(async move { backend.start().await })
        };
        let pid = loop {
            if let Some(pid) = backend.pid().await {
                break pid;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        };

        backend.close().await;
        starting.await.unwrap().unwrap();
        assert!(!process_alive(pid));
        assert_eq!(backend.status(), BackendStatus::Stopped);
    }

    #[tokio::test]
    async fn test_immediate_exit_never_left_running() {
        for _ in 0..20 {
            let backend = ProcessBackend::new(Plugin::default(), ProcessSettings::new("true", &[]));
            if let Err(e) = backend.start().await {
                assert!(matches!(e, BackendError::ExitedBeforeReady));
                assert_eq!(backend.status(), BackendStatus::Stopped);
            }
            wait_for_status(&backend, BackendStatus::Stopped).await;
            backend.close().await;
        }
    }

    #[tokio::test]
    async fn test_working_dir_and_env() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = ProcessSettings::new(
            "sh",
            &["-c", "echo \"$ZEROSCALE_TEST\" > marker; exec sleep 60"],
        );
        settings.working_dir = Some(dir.path().to_path_buf());
        settings.env.insert("ZEROSCALE_TEST".to_string(), "hello".to_string());

        let backend = ProcessBackend::new(Plugin::default(), settings);
        backend.start().await.unwrap();

        let marker = dir.path().join("marker");
        let mut contents = String::new();
        for _ in 0..100 {
            contents = std::fs::read_to_string(&marker).unwrap_or_default();
            if !contents.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(contents.trim(), "hello");

        backend.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_plugin_delegation() {
        let backend = shell(PluginKind::Minecraft, "true");
        assert!(backend.validates_clients());
        assert!(!backend.is_valid_connection(b"garbage"));
        assert_eq!(backend.fake_status(), backend.plugin().fake_status().to_vec());

        assert!(!sleeper().validates_clients());
    }
}
