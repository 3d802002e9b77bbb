use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;

/// Lifecycle states of a supervised long-lived task (dev server).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Running,
    Stopped,
    Error,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Stopped => write!(f, "stopped"),
            TaskStatus::Error => write!(f, "error"),
        }
    }
}

/// Events emitted by the engine during planning, generation, and execution.
///
/// These events decouple the engine from the presentation layer, allowing
/// different frontends (colored CLI output, JSON lines, a future TUI) to
/// consume the same stream.
#[derive(Debug, Clone)]
pub enum Event {
    /// A wave of independent project builds is about to start.
    WaveStarted {
        wave: usize,
        total_waves: usize,
        projects: Vec<String>,
    },
    /// A single project build has been admitted by the scheduler.
    ProjectStarted {
        name: String,
        wave: usize,
        total_waves: usize,
        step: usize,
        total_steps: usize,
        is_parallel: bool,
    },
    /// A line of output from a project build.
    ProjectOutput {
        name: String,
        line: String,
        is_stderr: bool,
    },
    /// A project build has finished.
    ProjectFinished {
        name: String,
        success: bool,
        duration: Duration,
    },
    /// A source generator is about to run.
    GeneratorStarted { key: String },
    /// A line of output from a generator process.
    GeneratorOutput {
        key: String,
        line: String,
        is_stderr: bool,
    },
    /// A generator has finished.
    GeneratorFinished {
        key: String,
        success: bool,
        duration: Duration,
    },
    /// A long-lived task has been registered with the supervisor.
    TaskAdded { id: u64, name: String, pid: u32 },
    /// A supervised task changed state.
    TaskStatus { id: u64, status: TaskStatus },
    /// A listening port was detected in a supervised task's output.
    TaskPort { id: u64, port: u16 },
    /// A supervised task has been removed (reaped and displayed).
    TaskRemoved { id: u64 },
    /// A prefixed output line from a supervised task.
    TaskLog {
        name: String,
        line: String,
        is_stderr: bool,
    },
    /// Transient status line for the watch loop (`None` clears it).
    Status(Option<String>),
    /// A warning message.
    Warning(String),
    /// An informational message.
    Info(String),
}

/// Send an event if a sink is attached, ignoring send errors (the receiver
/// may have been dropped during shutdown).
pub fn emit(tx: Option<&UnboundedSender<Event>>, event: Event) {
    if let Some(tx) = tx {
        let _ = tx.send(event);
    }
}
