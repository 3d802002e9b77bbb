use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use notify_debouncer_mini::{DebouncedEventKind, new_debouncer};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::project::Project;

/// Default debounce duration for file change events.
pub const DEFAULT_DEBOUNCE_MS: u64 = 500;

/// Directory names ignored wherever they appear under the workspace.
const IGNORED_DIRS: &[&str] = &[
    "node_modules",
    "dist",
    ".angular",
    ".nx",
    "coverage",
    ".git",
    "tmp",
    ".cache",
];

/// One debounced batch of changes, attributed to owning projects.
///
/// `escalated` is set when a workspace-level config file changed, in which
/// case `changed` contains every project regardless of per-file attribution.
#[derive(Debug, Clone)]
pub struct ChangeBatch {
    pub changed: BTreeSet<String>,
    pub files_by_project: HashMap<String, Vec<PathBuf>>,
    pub escalated: bool,
}

/// Watcher configuration.
pub struct WatchOptions {
    pub debounce_ms: u64,
    /// Caller-supplied ignore globs, notably generator output paths.
    pub extra_ignores: Vec<String>,
}

impl Default for WatchOptions {
    fn default() -> Self {
        WatchOptions {
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            extra_ignores: Vec::new(),
        }
    }
}

/// Compiled ignore set: the fixed directory list, log files, and
/// caller-supplied glob patterns matched against the absolute path.
pub struct IgnoreSet {
    patterns: Vec<glob::Pattern>,
}

impl IgnoreSet {
    pub fn new(extra: &[String]) -> Result<Self> {
        let mut patterns = Vec::new();
        for raw in extra {
            patterns.push(
                glob::Pattern::new(raw)
                    .with_context(|| format!("Invalid ignore pattern: {}", raw))?,
            );
        }
        Ok(IgnoreSet { patterns })
    }

    pub fn is_ignored(&self, path: &Path) -> bool {
        if path
            .components()
            .any(|c| matches!(c, std::path::Component::Normal(s) if IGNORED_DIRS.contains(&s.to_str().unwrap_or(""))))
        {
            return true;
        }

        if path.extension().and_then(|e| e.to_str()) == Some("log") {
            return true;
        }

        let path_str = path.to_string_lossy();
        self.patterns.iter().any(|p| p.matches(&path_str))
    }
}

/// Turn a flushed set of event paths into at most one [`ChangeBatch`].
///
/// - Ignored paths are dropped.
/// - A surviving path directly under the workspace root escalates the batch
///   to a global change (the workspace manifest, lockfiles, root TS-config,
///   and any other top-level file all expand the change set to every
///   project).
/// - Remaining paths are attributed to their owning project by
///   longest-absolute-path-prefix match; unattributed paths are dropped.
///
/// Returns `None` when nothing survives.
pub fn classify_batch(
    root: &Path,
    projects: &[Project],
    ignores: &IgnoreSet,
    paths: impl IntoIterator<Item = PathBuf>,
) -> Option<ChangeBatch> {
    let mut changed: BTreeSet<String> = BTreeSet::new();
    let mut files_by_project: HashMap<String, Vec<PathBuf>> = HashMap::new();
    let mut escalated = false;

    for path in paths {
        if ignores.is_ignored(&path) {
            debug!(path = %path.display(), "ignoring change");
            continue;
        }

        if path.parent() == Some(root) && !path.is_dir() {
            debug!(path = %path.display(), "workspace-level config changed; escalating");
            escalated = true;
            continue;
        }

        match find_owning_project(&path, projects) {
            Some(name) => {
                changed.insert(name.clone());
                files_by_project.entry(name).or_default().push(path);
            }
            None => {
                debug!(path = %path.display(), "no owning project; dropping");
            }
        }
    }

    if escalated {
        changed = projects.iter().map(|p| p.name.clone()).collect();
    }

    if changed.is_empty() {
        return None;
    }

    Some(ChangeBatch {
        changed,
        files_by_project,
        escalated,
    })
}

/// Find the project owning a path: the project whose absolute directory is
/// the longest prefix of the path.
fn find_owning_project(path: &Path, projects: &[Project]) -> Option<String> {
    projects
        .iter()
        .filter(|p| path.starts_with(&p.absolute_path))
        .max_by_key(|p| p.absolute_path.as_os_str().len())
        .map(|p| p.name.clone())
}

/// Watch the workspace root recursively, emitting one debounced
/// [`ChangeBatch`] per burst of changes.
///
/// This function blocks the current thread until `shutdown_rx` signals (or
/// its sender is dropped); callers run it on a blocking task. The debouncer
/// waits for event silence before flushing, which also covers write-finish
/// stabilization for files being written in chunks.
pub fn start_watching(
    root: &Path,
    projects: &[Project],
    options: WatchOptions,
    batch_tx: mpsc::UnboundedSender<ChangeBatch>,
    mut shutdown_rx: mpsc::Receiver<()>,
) -> Result<()> {
    let debounce = if options.debounce_ms == 0 {
        Duration::from_millis(DEFAULT_DEBOUNCE_MS)
    } else {
        Duration::from_millis(options.debounce_ms)
    };

    let ignores = IgnoreSet::new(&options.extra_ignores)?;

    let (tx, rx) = std::sync::mpsc::channel();
    let mut debouncer = new_debouncer(debounce, tx).context("Failed to create file watcher")?;

    debouncer
        .watcher()
        .watch(root, notify::RecursiveMode::Recursive)
        .with_context(|| format!("Failed to watch directory: {}", root.display()))?;

    loop {
        // Check for shutdown signal (non-blocking)
        match shutdown_rx.try_recv() {
            Ok(()) => break,
            Err(tokio::sync::mpsc::error::TryRecvError::Disconnected) => break,
            Err(tokio::sync::mpsc::error::TryRecvError::Empty) => {}
        }

        // Wait for debounced events with a timeout so we can check shutdown
        match rx.recv_timeout(Duration::from_millis(200)) {
            Ok(Ok(events)) => {
                let paths = events
                    .into_iter()
                    .filter(|e| e.kind == DebouncedEventKind::Any)
                    .map(|e| e.path);

                if let Some(batch) = classify_batch(root, projects, &ignores, paths) {
                    debug!(projects = ?batch.changed, "change batch");
                    if batch_tx.send(batch).is_err() {
                        // Receiver dropped, stop watching
                        break;
                    }
                }
            }
            Ok(Err(error)) => {
                warn!(%error, "watch error");
            }
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {}
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    Ok(())
}
