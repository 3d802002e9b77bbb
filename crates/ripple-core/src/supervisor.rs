use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use regex::Regex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Mutex;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

use crate::events::{Event, TaskStatus, emit};
use crate::executor::shell_command;

/// A supervised long-lived task (dev server).
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub id: u64,
    pub name: String,
    pub pid: u32,
    pub status: TaskStatus,
    pub started_at: std::time::Instant,
    pub ended_at: Option<std::time::Instant>,
    pub detected_port: Option<u16>,
}

/// Supervisor for long-lived child processes.
///
/// Children are spawned into their own process group so that a shutdown
/// signal can reliably kill the whole process tree, shells and grandchildren
/// included. Stdout/stderr are line-buffered, stripped of terminal-clear
/// escape sequences, prefixed with the task name, and forwarded to the event
/// sink. Dev-server children are not bounded by the executor's concurrency
/// limit.
pub struct TaskSupervisor {
    tasks: Mutex<HashMap<u64, TaskRecord>>,
    next_id: AtomicU64,
    events: Option<UnboundedSender<Event>>,
}

impl TaskSupervisor {
    pub fn new(events: Option<UnboundedSender<Event>>) -> Arc<Self> {
        Arc::new(TaskSupervisor {
            tasks: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            events,
        })
    }

    /// Spawn a shell command as a supervised task.
    ///
    /// The child joins a fresh process group; its output is demuxed and a
    /// port detector scans for common listening banners, recording the first
    /// match. A monitor task reaps the child and records its exit status —
    /// a dev server dying is logged, not fatal.
    pub async fn spawn_task(
        self: &Arc<Self>,
        name: &str,
        command: &str,
        cwd: &PathBuf,
        env: &HashMap<String, String>,
    ) -> Result<u64> {
        let (shell, shell_flag) = shell_command();
        let mut cmd = tokio::process::Command::new(shell);
        cmd.arg(shell_flag)
            .arg(command)
            .current_dir(cwd)
            .envs(env)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());

        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn dev task '{}'", name))?;

        let pid = child.id().unwrap_or(0);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let record = TaskRecord {
            id,
            name: name.to_string(),
            pid,
            status: TaskStatus::Running,
            started_at: std::time::Instant::now(),
            ended_at: None,
            detected_port: None,
        };
        self.tasks.lock().await.insert(id, record);

        emit(
            self.events.as_ref(),
            Event::TaskAdded {
                id,
                name: name.to_string(),
                pid,
            },
        );

        // safety: both pipes were requested above
        let stdout = child.stdout.take().expect("stdout piped");
        let stderr = child.stderr.take().expect("stderr piped");

        self.spawn_output_monitor(id, name.to_string(), stdout, false);
        self.spawn_output_monitor(id, name.to_string(), stderr, true);

        // Reaper: record how the task ended.
        let supervisor = Arc::clone(self);
        let task_name = name.to_string();
        tokio::spawn(async move {
            let status = child.wait().await;
            let (task_status, code) = match status {
                Ok(s) if s.success() => (TaskStatus::Stopped, 0),
                Ok(s) => (TaskStatus::Error, s.code().unwrap_or(-1)),
                Err(_) => (TaskStatus::Error, -1),
            };

            supervisor.update_status(id, task_status).await;
            emit(
                supervisor.events.as_ref(),
                Event::Info(format!(
                    "Task '{}' exited with code {}",
                    task_name, code
                )),
            );
        });

        Ok(id)
    }

    fn spawn_output_monitor<R>(self: &Arc<Self>, id: u64, name: String, reader: R, is_stderr: bool)
    where
        R: tokio::io::AsyncRead + Unpin + Send + 'static,
    {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            let reader = BufReader::new(reader);
            let mut lines = reader.lines();
            while let Ok(Some(raw)) = lines.next_line().await {
                let line = strip_terminal_controls(&raw);

                if let Some(port) = detect_port(&line) {
                    supervisor.record_port(id, port).await;
                }

                emit(
                    supervisor.events.as_ref(),
                    Event::TaskLog {
                        name: name.clone(),
                        line,
                        is_stderr,
                    },
                );
            }
            debug!(task = %name, "output monitor ended");
        });
    }

    /// Record a task status change and notify the sink.
    pub async fn update_status(&self, id: u64, status: TaskStatus) {
        let mut tasks = self.tasks.lock().await;
        if let Some(record) = tasks.get_mut(&id) {
            record.status = status;
            if status != TaskStatus::Running && record.ended_at.is_none() {
                record.ended_at = Some(std::time::Instant::now());
            }
            emit(self.events.as_ref(), Event::TaskStatus { id, status });
        }
    }

    /// Record the first detected listening port on a task.
    async fn record_port(&self, id: u64, port: u16) {
        let mut tasks = self.tasks.lock().await;
        if let Some(record) = tasks.get_mut(&id)
            && record.detected_port.is_none()
        {
            record.detected_port = Some(port);
            emit(self.events.as_ref(), Event::TaskPort { id, port });
        }
    }

    /// Snapshot of all task records.
    pub async fn tasks(&self) -> Vec<TaskRecord> {
        let mut records: Vec<TaskRecord> = self.tasks.lock().await.values().cloned().collect();
        records.sort_by_key(|r| r.id);
        records
    }

    /// Kill every supervised task's whole process group.
    ///
    /// SIGKILL is delivered to the negative PID (the group); on failure the
    /// positive PID is retried. Returns `(name, killed)` per task. All tasks
    /// are removed from the registry regardless of kill outcome.
    pub async fn shutdown_all(&self) -> Vec<(String, bool)> {
        let mut tasks = self.tasks.lock().await;
        let mut outcomes = Vec::new();

        for (id, record) in tasks.drain() {
            let killed = kill_process_group(record.pid);
            if !killed {
                warn!(task = %record.name, pid = record.pid, "failed to kill process group");
            }
            emit(self.events.as_ref(), Event::TaskRemoved { id });
            outcomes.push((record.name, killed));
        }

        outcomes.sort();
        outcomes
    }
}

/// Deliver SIGKILL to a child's process group, falling back to the process
/// itself when group delivery fails.
#[cfg(unix)]
fn kill_process_group(pid: u32) -> bool {
    use nix::sys::signal::{Signal, kill, killpg};
    use nix::unistd::Pid;

    if pid == 0 {
        return false;
    }

    let pgid = Pid::from_raw(pid as i32);
    match killpg(pgid, Signal::SIGKILL) {
        Ok(()) => true,
        Err(e) => {
            warn!(pid, error = %e, "killpg failed; retrying positive pid");
            kill(Pid::from_raw(pid as i32), Signal::SIGKILL).is_ok()
        }
    }
}

#[cfg(windows)]
fn kill_process_group(pid: u32) -> bool {
    // taskkill /T takes the whole tree down, the closest analogue to a
    // process-group SIGKILL.
    std::process::Command::new("taskkill")
        .args(["/pid", &pid.to_string(), "/f", "/t"])
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Strip terminal-clear escape sequences (`ESC[…J`, `ESC[…H`, `ESC c`) from
/// a child output line so a dev server clearing its screen cannot wipe the
/// host terminal. Color codes are left intact.
pub fn strip_terminal_controls(line: &str) -> String {
    static PATTERN: std::sync::LazyLock<Regex> =
        std::sync::LazyLock::new(|| Regex::new(r"\x1b\[[0-9;?]*[HJ]|\x1bc").expect("valid regex"));
    PATTERN.replace_all(line, "").into_owned()
}

/// Scan a line for common listening banners and return the advertised port.
pub fn detect_port(line: &str) -> Option<u16> {
    static URL: std::sync::LazyLock<Regex> = std::sync::LazyLock::new(|| {
        Regex::new(r"https?://[^\s/:]+:(\d{2,5})").expect("valid regex")
    });
    static PORT: std::sync::LazyLock<Regex> = std::sync::LazyLock::new(|| {
        Regex::new(r"(?i)\bport\s*[:=]?\s*(\d{2,5})\b").expect("valid regex")
    });

    for re in [&*URL, &*PORT] {
        if let Some(caps) = re.captures(line)
            && let Ok(port) = caps[1].parse::<u16>()
        {
            return Some(port);
        }
    }
    None
}
