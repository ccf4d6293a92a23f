//! Plugin process supervision
//!
//! Each plugin's entry point runs as a child process listening on a port the
//! supervisor assigns (`-port <port>`). One watcher task per process owns the
//! `Child`, reaps it and publishes its status. The process table never leaves
//! this module: callers get [`PluginEndpoint`] copies.

use super::manifest::PluginDefinition;
use crate::config::PluginsConfig;
use crate::error::SupervisorError;
use crate::state::Metrics;
use dashmap::DashMap;
use serde::Serialize;
use std::process::Stdio;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ProcessStatus {
    NotStarted,
    Running,
    Exited,
    Failed,
}

/// Where a plugin can be reached, copied out of the process table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginEndpoint {
    pub plugin_id: String,
    pub name: String,
    pub schema: String,
    pub host: String,
    pub port: u16,
    pub pid: Option<u32>,
    pub status: ProcessStatus,
}

impl PluginEndpoint {
    pub fn base_url(&self) -> String {
        format!("{}://{}:{}", self.schema, self.host, self.port)
    }

    pub fn is_running(&self) -> bool {
        self.status == ProcessStatus::Running
    }
}

struct ManagedProcess {
    plugin: Arc<PluginDefinition>,
    port: u16,
    pid: Option<u32>,
    status: watch::Receiver<ProcessStatus>,
    stop: Arc<Notify>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

pub struct ProcessSupervisor {
    schema: String,
    host: String,
    base_port: u16,
    shutdown_grace: Duration,
    next_offset: AtomicU32,
    processes: DashMap<String, ManagedProcess>,
    metrics: Option<Arc<Metrics>>,
}

impl ProcessSupervisor {
    pub fn new(config: &PluginsConfig) -> Self {
        Self {
            schema: config.schema.clone(),
            host: config.host.clone(),
            base_port: config.base_port,
            shutdown_grace: config.shutdown_grace(),
            next_offset: AtomicU32::new(0),
            processes: DashMap::new(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Next port in the monotonic sequence. Ports are never reused.
    fn allocate_port(&self) -> Result<u16, SupervisorError> {
        let offset = self.next_offset.fetch_add(1, Ordering::SeqCst);
        u16::try_from(u32::from(self.base_port) + offset).map_err(|_| SupervisorError::PortsExhausted)
    }

    /// Spawn a plugin's entry point. A failure marks the plugin `Failed`.
    pub fn start(&self, plugin: Arc<PluginDefinition>) -> Result<PluginEndpoint, SupervisorError> {
        let id = plugin.id().to_string();
        if self.processes.contains_key(&id) {
            return Err(SupervisorError::AlreadyStarted(id));
        }

        let port = self.allocate_port()?;

        if !plugin.entry_point.is_file() {
            self.mark_failed(plugin.clone(), port);
            return Err(SupervisorError::BinaryMissing {
                plugin: id,
                path: plugin.entry_point.clone(),
            });
        }

        info!(plugin = %id, port, "Starting plugin: {}", plugin.name());

        let mut cmd = Command::new(&plugin.entry_point);
        cmd.arg("-port")
            .arg(port.to_string())
            .current_dir(&plugin.root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                error!(plugin = %id, error = %e, "Failed to spawn plugin");
                self.mark_failed(plugin, port);
                return Err(SupervisorError::SpawnFailed {
                    plugin: id,
                    reason: e.to_string(),
                });
            }
        };

        if let Some(stdout) = child.stdout.take() {
            drain_output(plugin.name().to_string(), stdout, false);
        }
        if let Some(stderr) = child.stderr.take() {
            drain_output(plugin.name().to_string(), stderr, true);
        }

        let pid = child.id();
        let (status_tx, status_rx) = watch::channel(ProcessStatus::Running);
        let stop = Arc::new(Notify::new());

        let watcher = tokio::spawn(watch_process(
            id.clone(),
            child,
            stop.clone(),
            self.shutdown_grace,
            status_tx,
            self.metrics.clone(),
        ));

        if let Some(metrics) = &self.metrics {
            metrics.plugin_started();
        }

        let endpoint = self.endpoint_for(&plugin, port, pid, ProcessStatus::Running);
        self.processes.insert(
            id,
            ManagedProcess {
                plugin,
                port,
                pid,
                status: status_rx,
                stop,
                watcher: Mutex::new(Some(watcher)),
            },
        );

        Ok(endpoint)
    }

    /// Start every plugin in order. Returns the endpoints that came up;
    /// failures are logged and leave the plugin `Failed`.
    pub fn start_all(&self, plugins: &[Arc<PluginDefinition>]) -> Vec<PluginEndpoint> {
        plugins
            .iter()
            .filter_map(|plugin| match self.start(plugin.clone()) {
                Ok(endpoint) => Some(endpoint),
                Err(e) => {
                    error!("{}", e);
                    None
                }
            })
            .collect()
    }

    fn mark_failed(&self, plugin: Arc<PluginDefinition>, port: u16) {
        let (_, status) = watch::channel(ProcessStatus::Failed);
        if let Some(metrics) = &self.metrics {
            metrics.plugin_failed_to_start();
        }
        self.processes.insert(
            plugin.id().to_string(),
            ManagedProcess {
                plugin,
                port,
                pid: None,
                status,
                stop: Arc::new(Notify::new()),
                watcher: Mutex::new(None),
            },
        );
    }

    fn endpoint_for(
        &self,
        plugin: &PluginDefinition,
        port: u16,
        pid: Option<u32>,
        status: ProcessStatus,
    ) -> PluginEndpoint {
        PluginEndpoint {
            plugin_id: plugin.id().to_string(),
            name: plugin.name().to_string(),
            schema: self.schema.clone(),
            host: self.host.clone(),
            port,
            pid,
            status,
        }
    }

    fn snapshot_of(&self, process: &ManagedProcess) -> PluginEndpoint {
        let status = *process.status.borrow();
        self.endpoint_for(&process.plugin, process.port, process.pid, status)
    }

    pub fn endpoint(&self, plugin_id: &str) -> Option<PluginEndpoint> {
        self.processes
            .get(plugin_id)
            .map(|process| self.snapshot_of(&process))
    }

    /// Every supervised plugin, in port (start) order
    pub fn endpoints(&self) -> Vec<PluginEndpoint> {
        let mut endpoints: Vec<PluginEndpoint> = self
            .processes
            .iter()
            .map(|entry| self.snapshot_of(entry.value()))
            .collect();
        endpoints.sort_by_key(|endpoint| endpoint.port);
        endpoints
    }

    pub fn status(&self, plugin_id: &str) -> ProcessStatus {
        self.processes
            .get(plugin_id)
            .map(|process| *process.status.borrow())
            .unwrap_or(ProcessStatus::NotStarted)
    }

    /// Subscribe to status changes of one plugin
    pub fn subscribe(&self, plugin_id: &str) -> Option<watch::Receiver<ProcessStatus>> {
        self.processes
            .get(plugin_id)
            .map(|process| process.status.clone())
    }

    /// Terminate every running plugin and wait for the watchers to finish
    pub async fn shutdown(&self) {
        let mut watchers = Vec::new();
        for entry in self.processes.iter() {
            entry.stop.notify_one();
            let handle = entry
                .watcher
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take();
            if let Some(handle) = handle {
                watchers.push((entry.key().clone(), handle));
            }
        }

        for (plugin, handle) in watchers {
            if let Err(e) = handle.await {
                warn!(plugin = %plugin, error = %e, "Plugin watcher ended abnormally");
            }
        }
        info!("All plugin processes stopped");
    }
}

/// Owns the child until it exits or a stop is requested
async fn watch_process(
    plugin: String,
    mut child: Child,
    stop: Arc<Notify>,
    grace: Duration,
    status: watch::Sender<ProcessStatus>,
    metrics: Option<Arc<Metrics>>,
) {
    let exited = tokio::select! {
        result = child.wait() => Some(result),
        _ = stop.notified() => None,
    };

    let final_status = match exited {
        Some(Ok(exit)) if exit.success() => {
            info!(plugin = %plugin, "Plugin exited");
            ProcessStatus::Exited
        }
        Some(Ok(exit)) => {
            warn!(plugin = %plugin, status = %exit, "Plugin exited with failure");
            ProcessStatus::Failed
        }
        Some(Err(e)) => {
            error!(plugin = %plugin, error = %e, "Failed to wait on plugin process");
            ProcessStatus::Failed
        }
        None => {
            terminate(&plugin, &mut child, grace).await;
            info!(plugin = %plugin, "Plugin stopped");
            ProcessStatus::Exited
        }
    };

    if let Some(metrics) = &metrics {
        metrics.plugin_stopped(final_status == ProcessStatus::Failed);
    }
    status.send_replace(final_status);
}

/// SIGTERM, then kill once the grace period runs out
async fn terminate(plugin: &str, child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = child.id() {
            match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                Ok(()) => {
                    if tokio::time::timeout(grace, child.wait()).await.is_ok() {
                        return;
                    }
                    debug!(plugin = %plugin, "Grace period elapsed, killing plugin");
                }
                Err(e) => debug!(plugin = %plugin, error = %e, "Failed to send SIGTERM"),
            }
        }
    }

    #[cfg(not(unix))]
    let _ = grace;

    if let Err(e) = child.kill().await {
        warn!(plugin = %plugin, error = %e, "Failed to kill plugin process");
    }
}

/// Re-emit each line of plugin output as a log event
fn drain_output<R>(plugin: String, stream: R, is_stderr: bool)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if is_stderr => warn!(plugin = %plugin, "> {} - {}", plugin, line),
                Ok(Some(line)) => info!(plugin = %plugin, "> {} - {}", plugin, line),
                Ok(None) => break,
                Err(e) => {
                    debug!(plugin = %plugin, error = %e, "Stopped reading plugin output");
                    break;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::manifest::PluginManifest;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use tempfile::TempDir;

    fn config(base_port: u16) -> PluginsConfig {
        PluginsConfig {
            base_port,
            shutdown_grace_ms: 500,
            ..PluginsConfig::default()
        }
    }

    fn plugin(root: &Path, id: &str, script: Option<&str>) -> Arc<PluginDefinition> {
        let dir = root.join(id);
        std::fs::create_dir_all(&dir).unwrap();
        let entry_point = dir.join("main");
        if let Some(script) = script {
            std::fs::write(&entry_point, script).unwrap();
            std::fs::set_permissions(&entry_point, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        let manifest: PluginManifest =
            serde_json::from_value(serde_json::json!({ "id": id, "name": id })).unwrap();
        Arc::new(PluginDefinition {
            manifest,
            root: dir,
            entry_point,
        })
    }

    async fn wait_for(rx: &mut watch::Receiver<ProcessStatus>, want: ProcessStatus) {
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == want))
            .await
            .expect("status change timed out")
            .unwrap();
    }

    #[test]
    fn test_ports_are_monotonic() {
        let supervisor = ProcessSupervisor::new(&config(30002));
        assert_eq!(supervisor.allocate_port().unwrap(), 30002);
        assert_eq!(supervisor.allocate_port().unwrap(), 30003);
    }

    #[test]
    fn test_port_exhaustion() {
        let supervisor = ProcessSupervisor::new(&config(u16::MAX));
        assert_eq!(supervisor.allocate_port().unwrap(), u16::MAX);
        assert!(matches!(
            supervisor.allocate_port(),
            Err(SupervisorError::PortsExhausted)
        ));
    }

    #[tokio::test]
    async fn test_missing_binary_marks_failed() {
        let temp = TempDir::new().unwrap();
        let supervisor = ProcessSupervisor::new(&config(40100));
        let result = supervisor.start(plugin(temp.path(), "ghost", None));

        assert!(matches!(result, Err(SupervisorError::BinaryMissing { .. })));
        assert_eq!(supervisor.status("ghost"), ProcessStatus::Failed);
        assert_eq!(supervisor.status("unknown"), ProcessStatus::NotStarted);
    }

    #[tokio::test]
    async fn test_start_receives_port_and_shutdown_stops() {
        let temp = TempDir::new().unwrap();
        let supervisor = ProcessSupervisor::new(&config(40200));
        let script = "#!/bin/sh\necho \"listening $2\"\nexec sleep 30\n";

        let endpoint = supervisor.start(plugin(temp.path(), "sleeper", Some(script))).unwrap();
        assert_eq!(endpoint.port, 40200);
        assert_eq!(endpoint.plugin_id, "sleeper");
        assert!(endpoint.is_running());
        assert_eq!(endpoint.base_url(), "http://localhost:40200");

        let mut rx = supervisor.subscribe("sleeper").unwrap();
        supervisor.shutdown().await;
        wait_for(&mut rx, ProcessStatus::Exited).await;
    }

    #[tokio::test]
    async fn test_failed_exit_is_observed() {
        let temp = TempDir::new().unwrap();
        let supervisor = ProcessSupervisor::new(&config(40300));
        supervisor
            .start(plugin(temp.path(), "crasher", Some("#!/bin/sh\nexit 3\n")))
            .unwrap();

        let mut rx = supervisor.subscribe("crasher").unwrap();
        wait_for(&mut rx, ProcessStatus::Failed).await;
        assert_eq!(supervisor.endpoint("crasher").unwrap().status, ProcessStatus::Failed);
    }

    #[tokio::test]
    async fn test_start_all_isolates_failures() {
        let temp = TempDir::new().unwrap();
        let supervisor = ProcessSupervisor::new(&config(40400));
        let plugins = vec![
            plugin(temp.path(), "broken", None),
            plugin(temp.path(), "fine", Some("#!/bin/sh\nexec sleep 30\n")),
        ];

        let started = supervisor.start_all(&plugins);
        assert_eq!(started.len(), 1);
        assert_eq!(started[0].plugin_id, "fine");
        assert_eq!(started[0].port, 40401);

        let all = supervisor.endpoints();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].status, ProcessStatus::Failed);

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_double_start_rejected() {
        let temp = TempDir::new().unwrap();
        let supervisor = ProcessSupervisor::new(&config(40500));
        let sleeper = plugin(temp.path(), "once", Some("#!/bin/sh\nexec sleep 30\n"));

        supervisor.start(sleeper.clone()).unwrap();
        assert!(matches!(
            supervisor.start(sleeper),
            Err(SupervisorError::AlreadyStarted(_))
        ));
        supervisor.shutdown().await;
    }
}
