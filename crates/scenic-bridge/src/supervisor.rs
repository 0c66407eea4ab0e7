//! Lifecycle of the one managed Scenic application process.
//!
//! The child's stdout and stderr are pumped line by line into a bounded
//! [`LogBuffer`]. A monitor task owns the `Child` handle, records the exit and
//! clears the managed slot when the process goes away on its own.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::SupervisorConfig;
use crate::errors::ProcessError;
use crate::log_buffer::{LogBuffer, LogLine, LogStream};

/// How long to wait for the process to die after a forceful kill.
const KILL_WAIT: Duration = Duration::from_secs(5);
/// How long the monitor waits for output pumps to drain after exit.
const PUMP_DRAIN: Duration = Duration::from_millis(500);
const STARTUP_LOG_TAIL: usize = 20;

#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StartReport {
    pub pid: u32,
    pub path: PathBuf,
    pub program: String,
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StopReport {
    pub pid: u32,
    pub path: PathBuf,
    /// Whether graceful termination had to be escalated to a kill.
    pub forced: bool,
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExitSummary {
    pub pid: u32,
    pub path: PathBuf,
    pub code: Option<i32>,
    /// False when the process died without being asked to.
    pub requested: bool,
    pub at: DateTime<Local>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessStatus {
    pub running: bool,
    pub pid: Option<u32>,
    pub path: Option<PathBuf>,
    pub program: Option<String>,
    pub started_at: Option<DateTime<Local>>,
    pub uptime_secs: Option<u64>,
    pub memory_bytes: Option<u64>,
    pub cpu_percent: Option<f32>,
    pub log_lines: usize,
    pub log_capacity: usize,
    pub last_exit: Option<ExitSummary>,
}

#[derive(Debug, Clone, Copy)]
struct Exit {
    code: Option<i32>,
}

struct ManagedProcess {
    pid: u32,
    path: PathBuf,
    program: String,
    generation: u64,
    started_at: Instant,
    started_wall: DateTime<Local>,
    exit_rx: watch::Receiver<Option<Exit>>,
    kill_tx: Option<oneshot::Sender<()>>,
}

struct Inner {
    config: SupervisorConfig,
    logs: LogBuffer,
    current: Mutex<Option<ManagedProcess>>,
    last_exit: Mutex<Option<ExitSummary>>,
    generation: AtomicU64,
    start_gate: tokio::sync::Mutex<()>,
}

impl Inner {
    /// Clear the managed slot if it still holds `generation`.
    fn clear_if_current(&self, generation: u64) -> bool {
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        if current.as_ref().is_some_and(|p| p.generation == generation) {
            *current = None;
            true
        } else {
            false
        }
    }
}

#[derive(Clone)]
pub struct ProcessSupervisor {
    inner: Arc<Inner>,
}

impl ProcessSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        let logs = LogBuffer::new(config.log_capacity);
        Self {
            inner: Arc::new(Inner {
                config,
                logs,
                current: Mutex::new(None),
                last_exit: Mutex::new(None),
                generation: AtomicU64::new(0),
                start_gate: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.inner.config
    }

    /// Launch spec for `working_dir` using the configured program, arguments
    /// and environment.
    pub fn default_launch(&self, working_dir: impl Into<PathBuf>) -> LaunchSpec {
        LaunchSpec {
            program: self.inner.config.program.clone(),
            args: self.inner.config.args.clone(),
            working_dir: working_dir.into(),
            env: self.inner.config.env.clone(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner
            .current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    pub async fn start(&self, spec: LaunchSpec) -> Result<StartReport, ProcessError> {
        let _gate = self.inner.start_gate.lock().await;

        if let Some(existing) = self
            .inner
            .current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
        {
            return Err(ProcessError::AlreadyRunning {
                pid: existing.pid,
                path: existing.path.clone(),
            });
        }
        validate_working_dir(&spec.working_dir)?;

        self.inner.logs.clear();
        self.inner.logs.push(
            LogStream::Supervisor,
            format!(
                "starting {} {} in {}",
                spec.program,
                spec.args.join(" "),
                spec.working_dir.display()
            ),
        );

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .current_dir(&spec.working_dir)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|source| ProcessError::Spawn {
            program: spec.program.clone(),
            path: spec.working_dir.clone(),
            source,
        })?;
        let pid = child.id().unwrap_or_default();

        let mut pumps = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            pumps.push(tokio::spawn(pump_output(
                stdout,
                LogStream::Stdout,
                self.inner.clone(),
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.push(tokio::spawn(pump_output(
                stderr,
                LogStream::Stderr,
                self.inner.clone(),
            )));
        }

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (exit_tx, exit_rx) = watch::channel::<Option<Exit>>(None);
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        {
            let mut current = self.inner.current.lock().unwrap_or_else(|e| e.into_inner());
            *current = Some(ManagedProcess {
                pid,
                path: spec.working_dir.clone(),
                program: spec.program.clone(),
                generation,
                started_at: Instant::now(),
                started_wall: Local::now(),
                exit_rx: exit_rx.clone(),
                kill_tx: Some(kill_tx),
            });
        }
        tokio::spawn(monitor(
            self.inner.clone(),
            child,
            pid,
            spec.working_dir.clone(),
            generation,
            kill_rx,
            exit_tx,
            pumps,
        ));
        info!(pid, path = %spec.working_dir.display(), program = %spec.program, "Started application");

        let mut exit_rx = exit_rx;
        if let Some(exit) = wait_for_exit(&mut exit_rx, self.inner.config.startup_grace).await {
            let recent_logs = self
                .inner
                .logs
                .tail(STARTUP_LOG_TAIL)
                .iter()
                .map(LogLine::to_string)
                .collect();
            warn!(pid, code = ?exit.code, "Application exited during startup");
            return Err(ProcessError::ExitedDuringStartup {
                path: spec.working_dir,
                code: exit.code,
                recent_logs,
            });
        }

        Ok(StartReport {
            pid,
            path: spec.working_dir,
            program: spec.program,
            args: spec.args,
        })
    }

    /// Ask the process to exit, escalating to a kill after the stop grace.
    ///
    /// Holds the start gate until the old child has been reaped, so a
    /// concurrent `start` waits instead of spawning next to it.
    pub async fn stop(&self) -> Result<StopReport, ProcessError> {
        let _gate = self.inner.start_gate.lock().await;
        let managed = self
            .inner
            .current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or(ProcessError::NotRunning)?;
        let ManagedProcess {
            pid,
            path,
            mut exit_rx,
            kill_tx,
            ..
        } = managed;

        self.inner
            .logs
            .push(LogStream::Supervisor, format!("stopping process {pid}"));

        let mut forced = false;
        let mut exit = None;
        if request_graceful_exit(pid) {
            exit = wait_for_exit(&mut exit_rx, self.inner.config.stop_grace).await;
        }
        if exit.is_none() {
            forced = true;
            info!(pid, "Application ignored termination request, killing");
            if let Some(kill_tx) = kill_tx {
                let _ = kill_tx.send(());
            }
            exit = wait_for_exit(&mut exit_rx, KILL_WAIT).await;
            if exit.is_none() {
                warn!(pid, "Application did not exit after kill");
            }
        }

        info!(pid, forced, "Stopped application");
        Ok(StopReport {
            pid,
            path,
            forced,
            exit_code: exit.and_then(|e| e.code),
        })
    }

    /// Stop the managed process if there is one.
    pub async fn shutdown(&self) {
        if self.is_running() {
            if let Err(e) = self.stop().await {
                debug!("Nothing to stop on shutdown: {}", e);
            }
        }
    }

    pub fn status(&self) -> ProcessStatus {
        let running = {
            let current = self.inner.current.lock().unwrap_or_else(|e| e.into_inner());
            current.as_ref().map(|p| {
                (
                    p.pid,
                    p.path.clone(),
                    p.program.clone(),
                    p.started_wall,
                    p.started_at.elapsed().as_secs(),
                )
            })
        };
        let last_exit = self
            .inner
            .last_exit
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        let (pid, path, program, started_at, uptime_secs) = match running {
            Some((pid, path, program, started, uptime)) => {
                (Some(pid), Some(path), Some(program), Some(started), Some(uptime))
            }
            None => (None, None, None, None, None),
        };
        let usage = pid.and_then(sample_usage);

        ProcessStatus {
            running: pid.is_some(),
            pid,
            path,
            program,
            started_at,
            uptime_secs,
            memory_bytes: usage.map(|(memory, _)| memory),
            cpu_percent: usage.map(|(_, cpu)| cpu),
            log_lines: self.inner.logs.len(),
            log_capacity: self.inner.logs.capacity(),
            last_exit,
        }
    }

    /// The `n` most recent captured lines.
    pub fn logs(&self, n: usize) -> Vec<LogLine> {
        self.inner.logs.tail(n)
    }

    pub fn log_buffer(&self) -> &LogBuffer {
        &self.inner.logs
    }
}

fn validate_working_dir(path: &Path) -> Result<(), ProcessError> {
    let invalid = |reason: &str| ProcessError::InvalidPath {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    };
    if !path.is_absolute() {
        return Err(invalid("path must be absolute"));
    }
    if !path.is_dir() {
        return Err(invalid("not an existing directory"));
    }
    Ok(())
}

async fn wait_for_exit(rx: &mut watch::Receiver<Option<Exit>>, limit: Duration) -> Option<Exit> {
    match tokio::time::timeout(limit, rx.wait_for(|exit| exit.is_some())).await {
        Ok(Ok(exit)) => *exit,
        _ => None,
    }
}

async fn pump_output<R>(reader: R, stream: LogStream, inner: Arc<Inner>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf);
                let text = text.trim_end_matches(['\r', '\n']);
                debug!(target: "scenic_app", stream = ?stream, "{}", text);
                inner.logs.push(stream, text);
            }
            Err(e) => {
                debug!(stream = ?stream, "Output pump stopped: {}", e);
                break;
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn monitor(
    inner: Arc<Inner>,
    mut child: Child,
    pid: u32,
    path: PathBuf,
    generation: u64,
    mut kill_rx: oneshot::Receiver<()>,
    exit_tx: watch::Sender<Option<Exit>>,
    pumps: Vec<JoinHandle<()>>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        Ok(()) = &mut kill_rx => {
            if let Err(e) = child.start_kill() {
                warn!(pid, "Failed to kill application: {}", e);
            }
            child.wait().await
        }
    };

    for pump in pumps {
        let _ = tokio::time::timeout(PUMP_DRAIN, pump).await;
    }

    let code = match &status {
        Ok(status) => status.code(),
        Err(e) => {
            warn!(pid, "Failed to collect exit status: {}", e);
            None
        }
    };
    let described = match code {
        Some(code) => format!("exit code {code}"),
        None => "terminated by signal".to_string(),
    };
    inner.logs.push(
        LogStream::Supervisor,
        format!("process {pid} exited ({described})"),
    );

    let unexpected = inner.clear_if_current(generation);
    if unexpected {
        warn!(pid, code = ?code, "Application exited unexpectedly");
    }
    *inner.last_exit.lock().unwrap_or_else(|e| e.into_inner()) = Some(ExitSummary {
        pid,
        path,
        code,
        requested: !unexpected,
        at: Local::now(),
    });
    let _ = exit_tx.send(Some(Exit { code }));
}

#[cfg(unix)]
fn request_graceful_exit(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    // SAFETY: plain kill(2) on the pid of a child we spawned and have not reaped.
    unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) == 0 }
}

#[cfg(not(unix))]
fn request_graceful_exit(_pid: u32) -> bool {
    false
}

fn sample_usage(pid: u32) -> Option<(u64, f32)> {
    use sysinfo::{Pid, ProcessesToUpdate, System};

    let pid = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    system
        .process(pid)
        .map(|process| (process.memory(), process.cpu_usage()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_path_rejected() {
        let err = validate_working_dir(Path::new("relative/app")).unwrap_err();
        assert!(matches!(err, ProcessError::InvalidPath { .. }));
    }

    #[test]
    fn test_missing_dir_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert!(validate_working_dir(&missing).is_err());
        assert!(validate_working_dir(dir.path()).is_ok());
    }

    #[test]
    fn test_default_launch_uses_config() {
        let supervisor = ProcessSupervisor::new(SupervisorConfig::default());
        let spec = supervisor.default_launch("/srv/app");
        assert_eq!(spec.program, "mix");
        assert_eq!(spec.args, vec!["run", "--no-halt"]);
        assert_eq!(spec.env.get("MIX_ENV").map(String::as_str), Some("dev"));
    }

    #[tokio::test]
    async fn test_stop_without_process() {
        let supervisor = ProcessSupervisor::new(SupervisorConfig::default());
        assert!(matches!(
            supervisor.stop().await,
            Err(ProcessError::NotRunning)
        ));
        assert!(!supervisor.status().running);
    }
}
