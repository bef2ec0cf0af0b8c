//! Lifecycle of the Xray subprocess.
//!
//! The supervisor owns at most one running instance. Every transition goes
//! through one async mutex; the state itself lives in a `watch` channel so
//! readers never wait on a transition in progress.

use std::{
    os::unix::process::ExitStatusExt,
    process::ExitStatus,
    sync::Arc,
    time::Duration,
};

use command_group::{AsyncGroupChild, Signal, UnixChildExt};
use futures::{
    StreamExt,
    stream::{self, BoxStream},
};
use node_core::{
    ConfigDocument, Executor, ExecutorError, LogHub, LogMsg, NodeSettings, SpawnedProcess,
    log_hub::{DEFAULT_HISTORY_LINES, DEFAULT_QUEUE_CAPACITY},
};
use serde::Serialize;
use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    net::TcpStream,
    sync::{Mutex, oneshot, watch},
    task::JoinHandle,
    time::{sleep, timeout},
};
use tokio_stream::wrappers::LinesStream;

use crate::session::unix_now;

/// How long an exited core's output pipes get to drain into the hub.
const PIPE_DRAIN: Duration = Duration::from_secs(1);

/// Delay between two TCP health probe attempts.
const PROBE_INTERVAL: Duration = Duration::from_millis(100);

/// Observable state of the managed core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ProcessState {
    NotRunning,
    Starting,
    Running {
        pid: u32,
        started_at: i64,
        core_version: Option<String>,
    },
    Stopping,
    /// The core exited on its own, or could not be brought up.
    ///
    /// Signal deaths report `128 + signal`.
    Crashed {
        exit_code: i32,
        last_lines: Vec<String>,
    },
}

impl ProcessState {
    /// `Starting` or `Running`.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(self, Self::Starting | Self::Running { .. })
    }

    #[must_use]
    pub const fn is_running(&self) -> bool {
        matches!(self, Self::Running { .. })
    }
}

/// Start error.
#[derive(Debug, Error)]
pub enum StartError {
    #[error("Xray is started already")]
    AlreadyRunning,
    #[error("Failed to launch xray: {0}")]
    Spawn(#[from] ExecutorError),
    #[error("Xray exited during startup with code {exit_code}")]
    ExitedDuringStartup {
        exit_code: i32,
        last_lines: Vec<String>,
    },
    #[error("Xray did not become healthy within {0:?}")]
    HealthTimeout(Duration),
    #[error(transparent)]
    Stop(#[from] StopError),
}

/// Stop error.
#[derive(Debug, Error)]
pub enum StopError {
    #[error("Failed to kill xray: {0}")]
    KillFailed(String),
    #[error("Xray supervision task failed: {0}")]
    Join(String),
}

/// Supervisor tuning.
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// Upper bound on the start health probe.
    pub startup_timeout: Duration,
    /// Time between SIGTERM and SIGKILL.
    pub stop_grace: Duration,
    /// Address whose TCP listener marks the core as healthy.
    pub probe_addr: Option<(String, u16)>,
    /// Lines kept for crash reports.
    pub history_lines: usize,
    /// Per-subscriber log queue length.
    pub queue_capacity: usize,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            startup_timeout: Duration::from_secs(5),
            stop_grace: Duration::from_secs(5),
            probe_addr: None,
            history_lines: DEFAULT_HISTORY_LINES,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl SupervisorOptions {
    /// Options derived from the node settings; the health probe targets the
    /// injected API inbound.
    #[must_use]
    pub fn from_settings(settings: &NodeSettings) -> Self {
        let host = match settings.api_host.as_str() {
            "0.0.0.0" | "" => "127.0.0.1".to_string(),
            "::" | "[::]" => "::1".to_string(),
            other => other.to_string(),
        };
        Self {
            startup_timeout: settings.startup_timeout,
            stop_grace: settings.stop_grace,
            probe_addr: Some((host, settings.api_port)),
            ..Self::default()
        }
    }
}

/// What the API needs from the instance currently (or last) launched.
#[derive(Clone)]
pub struct ActiveInstance {
    pub pid: u32,
    /// Transformed document the instance was started with.
    pub config: Arc<ConfigDocument>,
    /// Output of the instance; closed once it ends.
    pub hub: Arc<LogHub>,
}

struct Instance {
    stop_tx: oneshot::Sender<()>,
    watcher: JoinHandle<Result<i32, StopError>>,
    hub: Arc<LogHub>,
}

enum Wake {
    Exited(std::io::Result<ExitStatus>),
    StopRequested,
}

enum Probe {
    Ready,
    Exited,
}

/// Starts, stops and watches the proxy core.
pub struct ProcessSupervisor<E: Executor> {
    executor: Arc<E>,
    options: SupervisorOptions,
    instance: Mutex<Option<Instance>>,
    state: Arc<watch::Sender<ProcessState>>,
    active: watch::Sender<Option<ActiveInstance>>,
    version: watch::Sender<Option<String>>,
}

impl<E: Executor + 'static> ProcessSupervisor<E> {
    /// Create a supervisor; nothing is started.
    #[must_use]
    pub fn new(executor: E, options: SupervisorOptions) -> Self {
        let (state, _) = watch::channel(ProcessState::NotRunning);
        let (active, _) = watch::channel(None);
        let (version, _) = watch::channel(None);
        Self {
            executor: Arc::new(executor),
            options,
            instance: Mutex::new(None),
            state: Arc::new(state),
            active,
            version,
        }
    }

    /// Current state snapshot.
    #[must_use]
    pub fn state(&self) -> ProcessState {
        self.state.borrow().clone()
    }

    /// Watch state transitions.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<ProcessState> {
        self.state.subscribe()
    }

    /// Last successfully probed core version.
    #[must_use]
    pub fn version(&self) -> Option<String> {
        self.version.borrow().clone()
    }

    /// Ask the executable for its version, keeping the previous value on
    /// failure.
    pub async fn probe_version(&self) -> Option<String> {
        match self.executor.version().await {
            Ok(version) => {
                tracing::debug!(%version, "probed xray version");
                self.version.send_replace(Some(version.clone()));
                Some(version)
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to probe xray version");
                self.version()
            }
        }
    }

    /// Document held for the current instance.
    #[must_use]
    pub fn config(&self) -> Option<Arc<ConfigDocument>> {
        self.active.borrow().as_ref().map(|a| Arc::clone(&a.config))
    }

    /// Current instance, if one was launched and not stopped since.
    #[must_use]
    pub fn active(&self) -> Option<ActiveInstance> {
        self.active.borrow().clone()
    }

    /// Log hub of the current instance, or a closed hub when there is none.
    #[must_use]
    pub fn log_hub(&self) -> Arc<LogHub> {
        self.active
            .borrow()
            .as_ref()
            .map_or_else(|| Arc::new(LogHub::closed()), |a| Arc::clone(&a.hub))
    }

    /// Launch the core with an already transformed document.
    ///
    /// # Errors
    /// Returns error if the core is already up, cannot be spawned, exits
    /// during startup or fails the health probe.
    pub async fn start(&self, config: ConfigDocument) -> Result<(), StartError> {
        let mut instance = self.instance.lock().await;
        self.start_locked(&mut instance, config).await
    }

    /// Stop the core. A no-op when nothing runs.
    ///
    /// # Errors
    /// Returns error if the core could not be killed.
    pub async fn stop(&self) -> Result<(), StopError> {
        let mut instance = self.instance.lock().await;
        self.stop_locked(&mut instance).await
    }

    /// Stop (if running) and start again, without letting another
    /// transition in between.
    ///
    /// # Errors
    /// See [`stop`](Self::stop) and [`start`](Self::start).
    pub async fn restart(&self, config: ConfigDocument) -> Result<(), StartError> {
        let mut instance = self.instance.lock().await;
        self.stop_locked(&mut instance).await?;
        self.start_locked(&mut instance, config).await
    }

    async fn start_locked(
        &self,
        slot: &mut Option<Instance>,
        config: ConfigDocument,
    ) -> Result<(), StartError> {
        if self.state.borrow().is_active() {
            return Err(StartError::AlreadyRunning);
        }
        // A crashed instance's watcher has already finished.
        if let Some(old) = slot.take() {
            reap(old).await;
        }

        let version = self.probe_version().await;
        self.state.send_replace(ProcessState::Starting);

        let mut process = match self.executor.spawn(&config).await {
            Ok(process) => process,
            Err(e) => {
                tracing::error!(error = %e, "failed to spawn xray");
                self.state.send_replace(ProcessState::NotRunning);
                return Err(e.into());
            }
        };
        let pid = process.pid().unwrap_or_default();

        let hub = Arc::new(LogHub::with_capacity(
            self.options.queue_capacity,
            self.options.history_lines,
        ));
        let (ready_tx, ready_rx) = watch::channel(false);
        let executor = Arc::clone(&self.executor);
        let forwarder = spawn_log_pumps(&mut process, Arc::clone(&hub), move |line| {
            if executor.is_ready_line(line, version.as_deref()) {
                ready_tx.send_replace(true);
            }
        });

        let (exit_tx, exit_rx) = watch::channel(None);
        let (stop_tx, stop_rx) = oneshot::channel();
        let watcher = tokio::spawn(supervise(Watch {
            child: process.child,
            pid,
            stop_rx,
            exit_tx,
            state: Arc::clone(&self.state),
            hub: Arc::clone(&hub),
            forwarder,
            grace: self.options.stop_grace,
            history_lines: self.options.history_lines,
        }));

        self.active.send_replace(Some(ActiveInstance {
            pid,
            config: Arc::new(config),
            hub: Arc::clone(&hub),
        }));
        *slot = Some(Instance {
            stop_tx,
            watcher,
            hub: Arc::clone(&hub),
        });

        let probe = wait_healthy(ready_rx, exit_rx.clone(), self.options.probe_addr.clone());
        let outcome = timeout(self.options.startup_timeout, probe).await;
        let exited = exit_rx.borrow().is_some();
        match outcome {
            Ok(Probe::Ready) if !exited => {
                let running = ProcessState::Running {
                    pid,
                    started_at: unix_now(),
                    core_version: self.version(),
                };
                let promoted = self.state.send_if_modified(|state| {
                    if matches!(state, ProcessState::Starting) {
                        *state = running;
                        true
                    } else {
                        false
                    }
                });
                if promoted {
                    tracing::info!(pid, "xray started");
                    return Ok(());
                }
                Err(self.exited_during_startup().await)
            }
            Ok(_) => Err(self.exited_during_startup().await),
            Err(_) => {
                tracing::error!(
                    pid,
                    timeout = ?self.options.startup_timeout,
                    "xray failed its health probe, stopping it"
                );
                let exit_code = match slot.take() {
                    Some(instance) => shutdown(instance).await.unwrap_or(-1),
                    None => -1,
                };
                self.state.send_replace(ProcessState::Crashed {
                    exit_code,
                    last_lines: hub.tail(self.options.history_lines),
                });
                Err(StartError::HealthTimeout(self.options.startup_timeout))
            }
        }
    }

    /// Wait for the watcher to record the crash, then report it.
    async fn exited_during_startup(&self) -> StartError {
        let mut rx = self.state.subscribe();
        let settled = rx
            .wait_for(|s| !s.is_active())
            .await
            .map(|s| s.clone());
        match settled {
            Ok(ProcessState::Crashed {
                exit_code,
                last_lines,
            }) => StartError::ExitedDuringStartup {
                exit_code,
                last_lines,
            },
            _ => StartError::ExitedDuringStartup {
                exit_code: -1,
                last_lines: Vec::new(),
            },
        }
    }

    async fn stop_locked(&self, slot: &mut Option<Instance>) -> Result<(), StopError> {
        let Some(instance) = slot.take() else {
            return Ok(());
        };
        if !self.state.borrow().is_active() {
            reap(instance).await;
            return Ok(());
        }

        self.state.send_replace(ProcessState::Stopping);
        let hub = Arc::clone(&instance.hub);
        let result = shutdown(instance).await;
        self.active.send_replace(None);

        match result {
            Ok(exit_code) => {
                tracing::warn!(exit_code, "xray stopped");
                self.state.send_replace(ProcessState::NotRunning);
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to stop xray");
                self.state.send_replace(ProcessState::Crashed {
                    exit_code: -1,
                    last_lines: hub.tail(self.options.history_lines),
                });
                Err(e)
            }
        }
    }
}

/// Ask the watcher to terminate the instance and wait for it.
async fn shutdown(instance: Instance) -> Result<i32, StopError> {
    // The watcher may already be gone if the core exited on its own.
    let _ = instance.stop_tx.send(());
    instance
        .watcher
        .await
        .map_err(|e| StopError::Join(e.to_string()))?
}

async fn reap(instance: Instance) {
    if let Err(e) = shutdown(instance).await {
        tracing::warn!(error = %e, "failed to reap previous xray instance");
    }
}

struct Watch {
    child: AsyncGroupChild,
    pid: u32,
    stop_rx: oneshot::Receiver<()>,
    exit_tx: watch::Sender<Option<i32>>,
    state: Arc<watch::Sender<ProcessState>>,
    hub: Arc<LogHub>,
    forwarder: JoinHandle<()>,
    grace: Duration,
    history_lines: usize,
}

/// Own the child until it exits or a stop is requested.
async fn supervise(w: Watch) -> Result<i32, StopError> {
    let Watch {
        mut child,
        pid,
        stop_rx,
        exit_tx,
        state,
        hub,
        mut forwarder,
        grace,
        history_lines,
    } = w;

    let wake = tokio::select! {
        status = child.wait() => Wake::Exited(status),
        _ = stop_rx => Wake::StopRequested,
    };

    match wake {
        Wake::Exited(status) => {
            let exit_code = status.as_ref().map_or(-1, exit_code_of);
            exit_tx.send_replace(Some(exit_code));
            drain(&mut forwarder, &hub).await;

            let last_lines = hub.tail(history_lines);
            let crashed = state.send_if_modified(|s| {
                if s.is_active() {
                    *s = ProcessState::Crashed {
                        exit_code,
                        last_lines,
                    };
                    true
                } else {
                    false
                }
            });
            if crashed {
                tracing::error!(pid, exit_code, "xray exited unexpectedly");
            }
            Ok(exit_code)
        }
        Wake::StopRequested => {
            let result = terminate(&mut child, pid, grace).await;
            if let Ok(code) = result {
                exit_tx.send_replace(Some(code));
            }
            drain(&mut forwarder, &hub).await;
            result
        }
    }
}

/// SIGTERM the group, then SIGKILL it once the grace period runs out.
async fn terminate(
    child: &mut AsyncGroupChild,
    pid: u32,
    grace: Duration,
) -> Result<i32, StopError> {
    if let Err(e) = child.signal(Signal::SIGTERM) {
        tracing::debug!(pid, error = %e, "SIGTERM not delivered");
    }

    match timeout(grace, child.wait()).await {
        Ok(Ok(status)) => Ok(exit_code_of(&status)),
        Ok(Err(e)) => Err(StopError::KillFailed(e.to_string())),
        Err(_) => {
            tracing::warn!(
                pid,
                grace = ?grace,
                "xray ignored SIGTERM, sending SIGKILL to process group"
            );
            child
                .start_kill()
                .map_err(|e| StopError::KillFailed(e.to_string()))?;
            let status = child
                .wait()
                .await
                .map_err(|e| StopError::KillFailed(e.to_string()))?;
            Ok(exit_code_of(&status))
        }
    }
}

async fn drain(forwarder: &mut JoinHandle<()>, hub: &LogHub) {
    if timeout(PIPE_DRAIN, &mut *forwarder).await.is_err() {
        tracing::debug!("xray output still open after exit, closing log hub");
        forwarder.abort();
    }
    hub.close();
}

fn exit_code_of(status: &ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(-1)
}

async fn wait_healthy(
    mut ready: watch::Receiver<bool>,
    mut exited: watch::Receiver<Option<i32>>,
    probe_addr: Option<(String, u16)>,
) -> Probe {
    let ready_line = async {
        if ready.wait_for(|r| *r).await.is_err() {
            std::future::pending::<()>().await;
        }
    };
    let exit = async {
        if exited.wait_for(Option::is_some).await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        biased;
        () = exit => Probe::Exited,
        () = ready_line => Probe::Ready,
        () = probe_tcp(probe_addr) => Probe::Ready,
    }
}

async fn probe_tcp(addr: Option<(String, u16)>) {
    let Some((host, port)) = addr else {
        return std::future::pending().await;
    };
    loop {
        if TcpStream::connect((host.as_str(), port)).await.is_ok() {
            tracing::debug!(%host, port, "xray API port is accepting connections");
            return;
        }
        sleep(PROBE_INTERVAL).await;
    }
}

fn lines<R>(
    reader: Option<R>,
    tag: fn(String) -> LogMsg,
) -> BoxStream<'static, std::io::Result<LogMsg>>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    match reader {
        Some(reader) => LinesStream::new(BufReader::new(reader).lines())
            .map(move |line| line.map(tag))
            .boxed(),
        None => stream::empty().boxed(),
    }
}

/// Merge stdout and stderr into the hub, calling `on_line` for each line.
fn spawn_log_pumps<F>(
    process: &mut SpawnedProcess,
    hub: Arc<LogHub>,
    on_line: F,
) -> JoinHandle<()>
where
    F: Fn(&str) + Send + 'static,
{
    let stdout = lines(process.child.inner().stdout.take(), LogMsg::Stdout);
    let stderr = lines(process.child.inner().stderr.take(), LogMsg::Stderr);

    let merged = stream::select(stdout, stderr).filter_map(move |next| {
        let next = match next {
            Ok(msg) => {
                let text = msg.text().trim_end();
                if text.is_empty() {
                    None
                } else {
                    tracing::debug!(target: "xray", "{text}");
                    on_line(text);
                    let text = text.to_string();
                    Some(Ok(if msg.is_stderr() {
                        LogMsg::Stderr(text)
                    } else {
                        LogMsg::Stdout(text)
                    }))
                }
            }
            Err(e) => Some(Err(e)),
        };
        futures::future::ready(next)
    });

    hub.spawn_forwarder(merged)
}
