//! Gateway process supervisor.
//!
//! Owns the lifecycle of one gateway subprocess: spawns it in its own
//! process group, forwards its output into `tracing`, restarts it with
//! exponential backoff when it exits unexpectedly, and stops the whole
//! process tree on request.

use crate::backoff::backoff_delay;
use chrono::{DateTime, Utc};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const EVENT_CAPACITY: usize = 64;

/// Lifecycle state of the supervised process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    /// No process and nothing scheduled.
    Stopped,
    /// A spawn is in progress or a restart is scheduled.
    Starting,
    /// The process is alive.
    Running,
    /// A stop was requested and the process has not exited yet.
    Stopping,
}

/// Notifications published by the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    /// A process was spawned.
    Started {
        /// Process id (also the process group id).
        pid: u32,
    },
    /// The process exited.
    Exited {
        /// Exit code, if it exited normally.
        code: Option<i32>,
        /// Terminating signal, if it was killed.
        signal: Option<i32>,
    },
    /// The supervisor settled in the stopped state after a requested stop.
    Stopped,
    /// An unexpected exit; a new spawn is scheduled after `delay`.
    Restarting {
        /// Consecutive restart attempt driving the delay.
        attempt: u32,
        /// Delay before the next spawn.
        delay: Duration,
    },
    /// A recoverable error, such as a failed spawn.
    Error {
        /// Human-readable description.
        message: String,
    },
    /// The restart cap was exceeded; no further restarts will happen.
    Fatal {
        /// Human-readable description.
        message: String,
    },
}

/// Snapshot returned by [`Supervisor::status`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SupervisorStatus {
    /// Current lifecycle state.
    pub state: ProcessState,
    /// Pid of the running process.
    pub pid: Option<u32>,
    /// Consecutive restart attempts.
    pub restart_count: u32,
    /// Wall-clock time of the last successful spawn.
    pub last_start: Option<DateTime<Utc>>,
    /// Last recorded error.
    pub last_error: Option<String>,
}

/// Errors from signalling the supervised process.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The pid does not fit a platform pid.
    #[error("pid {0} out of range")]
    InvalidPid(u32),
    /// Delivering a signal failed.
    #[error("failed to send {signal} to {pid}: {source}")]
    Signal {
        /// Target pid.
        pid: u32,
        /// Signal that was sent.
        signal: Signal,
        /// Underlying errno.
        source: nix::Error,
    },
}

/// How to launch and restart the gateway.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Program to execute.
    pub command: String,
    /// Arguments, e.g. `["gateway"]`.
    pub args: Vec<String>,
    /// Gateway configuration file, exported through `config_path_env`.
    pub config_path: Option<PathBuf>,
    /// Gateway state directory, exported through `state_dir_env` and used
    /// as the working directory.
    pub state_dir: Option<PathBuf>,
    /// Environment variable name for `config_path`.
    pub config_path_env: String,
    /// Environment variable name for `state_dir`.
    pub state_dir_env: String,
    /// Delay before the first restart.
    pub initial_backoff: Duration,
    /// Upper bound on the restart delay.
    pub max_backoff: Duration,
    /// A process that ran at least this long counts as healthy.
    pub healthy_threshold: Duration,
    /// Time between SIGTERM and SIGKILL on stop.
    pub stop_grace: Duration,
    /// Give up after this many consecutive restarts. `None` is unlimited.
    pub max_restarts: Option<u32>,
}

impl SupervisorConfig {
    /// Config for `command args…` with default timings.
    #[must_use]
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            config_path: None,
            state_dir: None,
            config_path_env: "OPENCLAW_CONFIG_PATH".to_string(),
            state_dir_env: "OPENCLAW_STATE_DIR".to_string(),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            healthy_threshold: Duration::from_secs(60),
            stop_grace: Duration::from_secs(5),
            max_restarts: None,
        }
    }
}

struct RunningProcess {
    pid: u32,
    started: Instant,
    exited: watch::Receiver<bool>,
}

struct State {
    state: ProcessState,
    process: Option<RunningProcess>,
    restart_count: u32,
    last_start: Option<DateTime<Utc>>,
    last_error: Option<String>,
    stop_requested: bool,
    env: HashMap<String, String>,
    restart_timer: Option<JoinHandle<()>>,
    generation: u64,
}

struct Inner {
    config: SupervisorConfig,
    state: Mutex<State>,
    events: broadcast::Sender<SupervisorEvent>,
}

/// Handle to the gateway supervisor. Cheap to clone.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

#[derive(Clone, Copy)]
enum OutputStream {
    Stdout,
    Stderr,
}

impl Supervisor {
    /// Creates a stopped supervisor and the first event receiver.
    #[must_use]
    pub fn new(config: SupervisorConfig) -> (Self, broadcast::Receiver<SupervisorEvent>) {
        let (events, rx) = broadcast::channel(EVENT_CAPACITY);
        let inner = Arc::new(Inner {
            config,
            state: Mutex::new(State {
                state: ProcessState::Stopped,
                process: None,
                restart_count: 0,
                last_start: None,
                last_error: None,
                stop_requested: false,
                env: HashMap::new(),
                restart_timer: None,
                generation: 0,
            }),
            events,
        });
        (Self { inner }, rx)
    }

    /// Another receiver of supervisor events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.inner.events.subscribe()
    }

    /// Spawns the gateway. No-op if it is already running or starting.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) {
        let mut st = self.inner.lock();
        match st.state {
            ProcessState::Running | ProcessState::Starting => {
                warn!(state = ?st.state, "gateway already running, ignoring start");
                return;
            }
            ProcessState::Stopping => {
                warn!("gateway stop in progress, ignoring start");
                return;
            }
            ProcessState::Stopped => {}
        }
        st.stop_requested = false;
        st.restart_count = 0;
        if let Some(timer) = st.restart_timer.take() {
            timer.abort();
        }
        self.inner.spawn_locked(&mut st);
    }

    /// Stops the gateway and its whole process group.
    ///
    /// Sends SIGTERM, escalates to SIGKILL after the grace period and
    /// resolves once the process has exited. Idempotent.
    pub async fn stop(&self) {
        let target = {
            let mut st = self.inner.lock();
            st.stop_requested = true;
            if let Some(timer) = st.restart_timer.take() {
                timer.abort();
            }
            match &st.process {
                Some(process) => {
                    let target = (process.pid, process.exited.clone());
                    st.state = ProcessState::Stopping;
                    Some(target)
                }
                None => {
                    if st.state != ProcessState::Stopped {
                        st.state = ProcessState::Stopped;
                        self.inner.emit(SupervisorEvent::Stopped);
                    }
                    None
                }
            }
        };
        let Some((pid, mut exited)) = target else {
            return;
        };

        info!(pid, "stopping gateway");
        if let Err(e) = send_signal(pid, Signal::SIGTERM, true) {
            warn!(error = %e, "SIGTERM to gateway process group failed");
        }

        let grace = self.inner.config.stop_grace;
        if tokio::time::timeout(grace, exited.wait_for(|done| *done))
            .await
            .is_err()
        {
            warn!(pid, grace_ms = grace.as_millis() as u64, "gateway ignored SIGTERM, sending SIGKILL");
            if let Err(e) = send_signal(pid, Signal::SIGKILL, true) {
                warn!(error = %e, "SIGKILL to gateway process group failed");
            }
            let _ = exited.wait_for(|done| *done).await;
        }
    }

    /// Asks the running gateway to re-read its configuration in place
    /// (SIGUSR1 to the process only). Falls back to a full restart when no
    /// process is running.
    ///
    /// # Errors
    ///
    /// Returns an error if the signal cannot be delivered.
    pub async fn reload(&self) -> Result<(), SupervisorError> {
        let pid = self.inner.lock().process.as_ref().map(|p| p.pid);
        if let Some(pid) = pid {
            info!(pid, "reloading gateway configuration");
            return send_signal(pid, Signal::SIGUSR1, false);
        }
        info!("no gateway running, restarting instead of reloading");
        self.stop().await;
        self.start();
        Ok(())
    }

    /// Current lifecycle snapshot.
    #[must_use]
    pub fn status(&self) -> SupervisorStatus {
        let st = self.inner.lock();
        SupervisorStatus {
            state: st.state,
            pid: st.process.as_ref().map(|p| p.pid),
            restart_count: st.restart_count,
            last_start: st.last_start,
            last_error: st.last_error.clone(),
        }
    }

    /// Replaces the environment overrides used by the next spawn.
    pub fn set_env(&self, env: HashMap<String, String>) {
        self.inner.lock().env = env;
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: SupervisorEvent) {
        if self.events.send(event).is_err() {
            debug!("supervisor event dropped: no active subscribers");
        }
    }

    fn command(&self, env: &HashMap<String, String>) -> Command {
        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args).envs(env);
        if let Some(path) = &self.config.config_path {
            cmd.env(&self.config.config_path_env, path);
        }
        if let Some(dir) = &self.config.state_dir {
            cmd.env(&self.config.state_dir_env, dir);
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .process_group(0);
        cmd
    }

    fn spawn_locked(self: &Arc<Self>, st: &mut State) {
        st.generation += 1;
        let generation = st.generation;
        st.state = ProcessState::Starting;

        let spawned = self
            .command(&st.env)
            .spawn()
            .map_err(|e| e.to_string())
            .and_then(|child| match child.id() {
                Some(pid) => Ok((child, pid)),
                None => Err("process exited before a pid was assigned".to_string()),
            });

        let (mut child, pid) = match spawned {
            Ok(spawned) => spawned,
            Err(e) => {
                let message = format!("failed to spawn {}: {e}", self.config.command);
                error!("{message}");
                st.last_error = Some(message.clone());
                self.emit(SupervisorEvent::Error { message });
                self.after_exit(st, None);
                return;
            }
        };

        if let Some(stdout) = child.stdout.take() {
            forward_output(stdout, pid, OutputStream::Stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(stderr, pid, OutputStream::Stderr);
        }

        let (exited_tx, exited_rx) = watch::channel(false);
        st.process = Some(RunningProcess {
            pid,
            started: Instant::now(),
            exited: exited_rx,
        });
        st.state = ProcessState::Running;
        st.last_start = Some(Utc::now());
        info!(pid, command = %self.config.command, "gateway started");
        self.emit(SupervisorEvent::Started { pid });

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let status = child.wait().await;
            inner.on_exit(generation, status);
            let _ = exited_tx.send(true);
        });
    }

    fn on_exit(self: &Arc<Self>, generation: u64, status: std::io::Result<ExitStatus>) {
        let mut st = self.lock();
        if st.generation != generation {
            return;
        }
        let uptime = st.process.take().map(|p| p.started.elapsed());

        let (code, signal) = match &status {
            Ok(status) => (status.code(), exit_signal(status)),
            Err(e) => {
                warn!(error = %e, "failed to wait for gateway");
                (None, None)
            }
        };
        info!(?code, ?signal, uptime_ms = uptime.map(|u| u.as_millis() as u64), "gateway exited");
        self.emit(SupervisorEvent::Exited { code, signal });

        if !st.stop_requested && st.state != ProcessState::Stopping {
            st.last_error = Some(match (code, signal) {
                (Some(code), _) => format!("gateway exited with code {code}"),
                (None, Some(signal)) => format!("gateway killed by signal {signal}"),
                (None, None) => "gateway exited".to_string(),
            });
        }
        self.after_exit(&mut st, uptime);
    }

    /// Decides between settling, giving up and scheduling a restart.
    fn after_exit(self: &Arc<Self>, st: &mut State, uptime: Option<Duration>) {
        if st.state == ProcessState::Stopping || st.stop_requested {
            st.state = ProcessState::Stopped;
            info!("gateway stopped");
            self.emit(SupervisorEvent::Stopped);
            return;
        }

        st.restart_count = st.restart_count.saturating_add(1);
        if let Some(max) = self.config.max_restarts {
            if st.restart_count > max {
                st.state = ProcessState::Stopped;
                let message = format!(
                    "gateway exited {} times in a row, giving up (max_restarts = {max})",
                    st.restart_count
                );
                error!("{message}");
                st.last_error = Some(message.clone());
                self.emit(SupervisorEvent::Fatal { message });
                return;
            }
        }

        // A long run before the crash restarts the ladder at the base delay.
        if uptime.is_some_and(|u| u >= self.config.healthy_threshold) {
            st.restart_count = 1;
        }

        let attempt = st.restart_count;
        let delay = backoff_delay(attempt, self.config.initial_backoff, self.config.max_backoff);
        st.state = ProcessState::Starting;
        warn!(attempt, delay_ms = delay.as_millis() as u64, "gateway exited unexpectedly, restarting");
        self.emit(SupervisorEvent::Restarting { attempt, delay });

        if let Some(timer) = st.restart_timer.take() {
            timer.abort();
        }
        let inner = Arc::clone(self);
        st.restart_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.restart_due();
        }));
    }

    fn restart_due(self: &Arc<Self>) {
        let mut st = self.lock();
        // Dropping our own handle detaches it; the task is about to finish.
        st.restart_timer = None;
        if st.stop_requested || st.process.is_some() {
            return;
        }
        self.spawn_locked(&mut st);
    }
}

fn forward_output<R>(reader: R, pid: u32, stream: OutputStream)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => match stream {
                    OutputStream::Stdout => info!(target: "gateway", pid, "{line}"),
                    OutputStream::Stderr => warn!(target: "gateway", pid, "{line}"),
                },
                Ok(None) => break,
                Err(e) => {
                    debug!(pid, error = %e, "gateway output stream closed");
                    break;
                }
            }
        }
    });
}

fn send_signal(pid: u32, signal: Signal, group: bool) -> Result<(), SupervisorError> {
    let raw = i32::try_from(pid).map_err(|_| SupervisorError::InvalidPid(pid))?;
    let target = Pid::from_raw(raw);
    let result = if group {
        signal::killpg(target, signal)
    } else {
        signal::kill(target, signal)
    };
    result.map_err(|source| SupervisorError::Signal { pid, signal, source })
}

fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = SupervisorConfig::new("openclaw", vec!["gateway".into()]);
        assert_eq!(config.initial_backoff, Duration::from_secs(1));
        assert_eq!(config.max_backoff, Duration::from_secs(30));
        assert_eq!(config.healthy_threshold, Duration::from_secs(60));
        assert_eq!(config.stop_grace, Duration::from_secs(5));
        assert_eq!(config.max_restarts, None);
    }

    #[tokio::test]
    async fn new_supervisor_is_stopped() {
        let (sup, _rx) = Supervisor::new(SupervisorConfig::new("true", vec![]));
        let status = sup.status();
        assert_eq!(status.state, ProcessState::Stopped);
        assert_eq!(status.pid, None);
        assert_eq!(status.restart_count, 0);
        assert!(status.last_start.is_none());
    }

    #[tokio::test]
    async fn stop_when_stopped_is_a_no_op() {
        let (sup, mut rx) = Supervisor::new(SupervisorConfig::new("true", vec![]));
        sup.stop().await;
        sup.stop().await;
        assert_eq!(sup.status().state, ProcessState::Stopped);
        assert!(rx.try_recv().is_err(), "no events expected");
    }

    #[tokio::test]
    async fn spawn_failure_is_reported_and_scheduled_for_restart() {
        let mut config = SupervisorConfig::new("/nonexistent/agwc-test-binary", vec![]);
        config.initial_backoff = Duration::from_secs(10);
        let (sup, mut rx) = Supervisor::new(config);
        sup.start();

        assert!(matches!(rx.recv().await.unwrap(), SupervisorEvent::Error { .. }));
        assert_eq!(
            rx.recv().await.unwrap(),
            SupervisorEvent::Restarting {
                attempt: 1,
                delay: Duration::from_secs(10)
            }
        );
        let status = sup.status();
        assert_eq!(status.state, ProcessState::Starting);
        assert!(status.last_error.unwrap().contains("failed to spawn"));

        sup.stop().await;
        assert_eq!(sup.status().state, ProcessState::Stopped);
        assert_eq!(rx.recv().await.unwrap(), SupervisorEvent::Stopped);
    }
}
