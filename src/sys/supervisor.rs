// src/sys/supervisor.rs
//
// Keeps nginx and the WebSSH2 backend alive: restart on crash, clean stop on signal.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use serde::Serialize;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{error, info, warn};

use crate::config::ConfigurationSnapshot;
use crate::error::BootstrapError;
use crate::sys::backend::BackendEnvironment;

pub const STOP_GRACE_PERIOD: Duration = Duration::from_secs(10);

// ==============================================================================
// 1. Service State Machine
// ==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ServiceState {
    NotStarted,
    Running,
    Crashed,
    Restarting,
    Stopped,
}

impl ServiceState {
    /// Forward-only: NotStarted → Running → (Crashed → Restarting → Running)* → Stopped.
    /// A restart whose spawn fails drops back to Crashed.
    pub fn can_transition_to(self, next: ServiceState) -> bool {
        use ServiceState::*;
        matches!(
            (self, next),
            (NotStarted, Running)
                | (Running, Crashed)
                | (Crashed, Restarting)
                | (Restarting, Running)
                | (Restarting, Crashed)
                | (NotStarted | Running | Crashed | Restarting, Stopped)
        )
    }
}

/// What to run. Mirrors a unit file: command line, working dir, environment.
#[derive(Debug, Clone)]
pub struct ServiceSpec {
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    pub working_directory: Option<PathBuf>,
    pub env_vars: Vec<(String, String)>,
    /// Where the service is expected to answer once up.
    pub endpoint: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceHandle {
    pub name: String,
    pub pid: Option<u32>,
    pub restart_count: u32,
    pub endpoint: String,
    state: ServiceState,
}

impl ServiceHandle {
    pub fn new(spec: &ServiceSpec) -> Self {
        Self {
            name: spec.name.clone(),
            pid: None,
            restart_count: 0,
            endpoint: spec.endpoint.clone(),
            state: ServiceState::NotStarted,
        }
    }

    pub fn state(&self) -> ServiceState {
        self.state
    }

    pub fn transition(&mut self, next: ServiceState) -> Result<(), BootstrapError> {
        if !self.state.can_transition_to(next) {
            return Err(BootstrapError::Invariant(format!(
                "service {} cannot go from {:?} to {:?}",
                self.name, self.state, next
            )));
        }
        info!(
            service = %self.name,
            pid = ?self.pid,
            endpoint = %self.endpoint,
            restart_count = self.restart_count,
            from = ?self.state,
            to = ?next,
            "Service state change"
        );
        self.state = next;
        Ok(())
    }
}

// ==============================================================================
// 2. Service Definitions
// ==============================================================================

pub fn nginx_service(snapshot: &ConfigurationSnapshot) -> ServiceSpec {
    let conf = Path::new(snapshot.get("NGINX_CONF_DIR")).join("nginx.conf");
    ServiceSpec {
        name: "nginx".into(),
        command: snapshot.get("NGINX_BIN").to_string(),
        args: vec![
            "-c".into(),
            conf.display().to_string(),
            "-g".into(),
            "daemon off;".into(),
        ],
        working_directory: None,
        env_vars: Vec::new(),
        endpoint: format!("https://127.0.0.1:{}/health", snapshot.get("NGINX_LISTEN_PORT").trim()),
    }
}

pub fn backend_service(snapshot: &ConfigurationSnapshot, backend: &BackendEnvironment) -> ServiceSpec {
    ServiceSpec {
        name: "webssh2".into(),
        command: snapshot.get("WEBSSH2_NODE_BIN").to_string(),
        args: vec!["index.js".into()],
        working_directory: Some(PathBuf::from(snapshot.get("WEBSSH2_APP_DIR"))),
        env_vars: backend.process_env(),
        endpoint: format!(
            "{}:{}",
            backend.get("WEBSSH2_LISTEN_IP").unwrap_or("127.0.0.1"),
            backend.get("WEBSSH2_LISTEN_PORT").unwrap_or("2222")
        ),
    }
}

// ==============================================================================
// 3. Process Plumbing
// ==============================================================================

fn spawn(spec: &ServiceSpec) -> Result<(Child, u32), String> {
    let mut cmd = Command::new(&spec.command);
    cmd.args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);
    if let Some(dir) = &spec.working_directory {
        cmd.current_dir(dir);
    }
    for (k, v) in &spec.env_vars {
        cmd.env(k, v);
    }

    let child = cmd
        .spawn()
        .map_err(|e| format!("failed to start {} ({}): {}", spec.name, spec.command, e))?;
    let pid = child
        .id()
        .ok_or_else(|| format!("{} exited before its pid could be read", spec.name))?;
    Ok((child, pid))
}

/// SIGTERM, then SIGKILL once `grace` runs out.
async fn terminate(name: &str, child: &mut Child, pid: u32, grace: Duration) {
    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        warn!(service = name, pid, "SIGTERM failed: {}", e);
    }
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => info!(service = name, pid, %status, "Service exited after SIGTERM"),
        Ok(Err(e)) => warn!(service = name, pid, "Waiting for service failed: {}", e),
        Err(_) => {
            warn!(service = name, pid, grace_secs = grace.as_secs(), "Grace period expired, killing");
            if let Err(e) = child.kill().await {
                error!(service = name, pid, "SIGKILL failed: {}", e);
            }
        }
    }
}

fn shutdown_requested(rx: &watch::Receiver<bool>) -> bool {
    *rx.borrow()
}

/// Resolves once shutdown is flagged (or the sender is gone).
async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

// ==============================================================================
// 4. Supervisor
// ==============================================================================

pub struct Supervisor {
    services: Vec<ServiceSpec>,
    restart_delay: Duration,
    grace: Duration,
}

impl Supervisor {
    pub fn new(services: Vec<ServiceSpec>, restart_delay: Duration) -> Self {
        Self {
            services,
            restart_delay,
            grace: STOP_GRACE_PERIOD,
        }
    }

    pub fn from_bootstrap(
        snapshot: &ConfigurationSnapshot,
        backend: &BackendEnvironment,
    ) -> Result<Self, BootstrapError> {
        let delay = snapshot.number::<u64>("SUPERVISOR_RESTART_DELAY_SECS")?;
        Ok(Self::new(
            vec![nginx_service(snapshot), backend_service(snapshot, backend)],
            Duration::from_secs(delay),
        ))
    }

    #[cfg(test)]
    fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Supervises every service until `shutdown` flips to true. A service that
    /// cannot be started at all triggers shutdown of the rest and is returned as the error.
    pub async fn run(&self, shutdown: Arc<watch::Sender<bool>>) -> Result<Vec<ServiceHandle>, BootstrapError> {
        let mut tasks = JoinSet::new();
        for (index, spec) in self.services.iter().cloned().enumerate() {
            let rx = shutdown.subscribe();
            let (delay, grace) = (self.restart_delay, self.grace);
            tasks.spawn(async move { (index, supervise(spec, delay, grace, rx).await) });
        }

        let mut finished: Vec<Option<ServiceHandle>> = vec![None; self.services.len()];
        let mut failure = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, Ok(handle))) => finished[index] = Some(handle),
                Ok((_, Err(e))) => {
                    error!("[supervisor] FATAL: {}", e);
                    shutdown.send_replace(true);
                    failure.get_or_insert(e);
                }
                Err(e) => {
                    shutdown.send_replace(true);
                    failure.get_or_insert(BootstrapError::Supervisor(format!("service task panicked: {}", e)));
                }
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(finished.into_iter().flatten().collect()),
        }
    }
}

async fn supervise(
    spec: ServiceSpec,
    restart_delay: Duration,
    grace: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> Result<ServiceHandle, BootstrapError> {
    let mut handle = ServiceHandle::new(&spec);

    loop {
        if shutdown_requested(&shutdown) {
            break;
        }

        match spawn(&spec) {
            Ok((mut child, pid)) => {
                handle.pid = Some(pid);
                handle.transition(ServiceState::Running)?;

                tokio::select! {
                    status = child.wait() => {
                        handle.pid = None;
                        if shutdown_requested(&shutdown) {
                            break;
                        }
                        match status {
                            Ok(status) => warn!(service = %spec.name, pid, %status, "Service exited unexpectedly"),
                            Err(e) => warn!(service = %spec.name, pid, "Lost track of service: {}", e),
                        }
                        handle.transition(ServiceState::Crashed)?;
                    }
                    _ = wait_for_shutdown(&mut shutdown) => {
                        terminate(&spec.name, &mut child, pid, grace).await;
                        handle.pid = None;
                        break;
                    }
                }
            }
            Err(e) if handle.state() == ServiceState::NotStarted => {
                return Err(BootstrapError::Supervisor(e));
            }
            Err(e) => {
                warn!(service = %spec.name, "Restart failed: {}", e);
                handle.transition(ServiceState::Crashed)?;
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(restart_delay) => {}
            _ = wait_for_shutdown(&mut shutdown) => break,
        }
        handle.restart_count += 1;
        handle.transition(ServiceState::Restarting)?;
    }

    handle.transition(ServiceState::Stopped)?;
    Ok(handle)
}

/// Flips `shutdown` on the first SIGTERM or SIGINT.
pub fn listen_for_signals(shutdown: Arc<watch::Sender<bool>>) -> JoinHandle<()> {
    use tokio::signal::unix::{SignalKind, signal};

    tokio::spawn(async move {
        let (mut sigterm, mut sigint) = match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(term), Ok(int)) => (term, int),
            (Err(e), _) | (_, Err(e)) => {
                error!("Failed to register signal handlers: {}", e);
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, stopping services"),
            _ = sigint.recv() => info!("Received SIGINT, stopping services"),
        }
        shutdown.send_replace(true);
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell_service(name: &str, script: &str) -> ServiceSpec {
        ServiceSpec {
            name: name.into(),
            command: "sh".into(),
            args: vec!["-c".into(), script.into()],
            working_directory: None,
            env_vars: vec![("GATEWAY_TEST".into(), "1".into())],
            endpoint: "127.0.0.1:0".into(),
        }
    }

    #[test]
    fn state_machine_is_forward_only() {
        use ServiceState::*;
        assert!(NotStarted.can_transition_to(Running));
        assert!(Running.can_transition_to(Crashed));
        assert!(Crashed.can_transition_to(Restarting));
        assert!(Restarting.can_transition_to(Running));
        assert!(Running.can_transition_to(Stopped));

        assert!(!Running.can_transition_to(NotStarted));
        assert!(!Crashed.can_transition_to(Running));
        assert!(!Stopped.can_transition_to(Running));
        assert!(!Stopped.can_transition_to(Stopped));
    }

    #[test]
    fn illegal_transition_is_an_invariant_error() {
        let mut handle = ServiceHandle::new(&shell_service("x", "true"));
        let err = handle.transition(ServiceState::Crashed).unwrap_err();
        assert!(matches!(err, BootstrapError::Invariant(_)));
        assert_eq!(handle.state(), ServiceState::NotStarted);
    }

    #[test]
    fn nginx_runs_in_foreground_with_rendered_config() {
        let snapshot = ConfigurationSnapshot::with_overrides(&[("NGINX_CONF_DIR", "/etc/nginx")]);
        let spec = nginx_service(&snapshot);
        assert_eq!(spec.command, "nginx");
        assert_eq!(spec.args, vec!["-c", "/etc/nginx/nginx.conf", "-g", "daemon off;"]);
        assert_eq!(spec.endpoint, "https://127.0.0.1:443/health");
    }

    #[cfg_attr(miri, ignore)]
    #[tokio::test]
    async fn crashing_service_is_restarted_until_shutdown() {
        let supervisor = Supervisor::new(vec![shell_service("crashy", "exit 1")], Duration::from_millis(20));
        let shutdown = Arc::new(watch::channel(false).0);

        let stopper = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(400)).await;
                shutdown.send_replace(true);
            })
        };

        let handles = supervisor.run(shutdown).await.unwrap();
        stopper.await.unwrap();

        assert_eq!(handles.len(), 1);
        assert!(handles[0].restart_count >= 2, "restarts: {}", handles[0].restart_count);
        assert_eq!(handles[0].state(), ServiceState::Stopped);
        assert!(handles[0].pid.is_none());
    }

    #[cfg_attr(miri, ignore)]
    #[tokio::test]
    async fn shutdown_terminates_long_running_service() {
        let supervisor = Supervisor::new(vec![shell_service("sleepy", "exec sleep 30")], Duration::from_millis(20))
            .with_grace(Duration::from_secs(2));
        let shutdown = Arc::new(watch::channel(false).0);

        let stopper = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                shutdown.send_replace(true);
            })
        };

        let started = std::time::Instant::now();
        let handles = supervisor.run(shutdown).await.unwrap();
        stopper.await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(handles[0].restart_count, 0);
        assert_eq!(handles[0].state(), ServiceState::Stopped);
    }

    #[cfg_attr(miri, ignore)]
    #[tokio::test]
    async fn unstartable_service_is_fatal() {
        let spec = ServiceSpec {
            command: "/nonexistent/webssh2-gateway-test-binary".into(),
            ..shell_service("ghost", "")
        };
        let supervisor = Supervisor::new(vec![spec], Duration::from_millis(20));
        let err = supervisor.run(Arc::new(watch::channel(false).0)).await.unwrap_err();
        assert!(matches!(err, BootstrapError::Supervisor(_)));
        assert_eq!(err.exit_code(), 17);
    }
}
