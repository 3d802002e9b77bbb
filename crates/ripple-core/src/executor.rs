use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Semaphore;
use tokio::sync::mpsc::UnboundedSender;

use crate::events::{Event, emit};
use crate::plan::BuildPlan;
use crate::pm::PackageManager;
use crate::project::Project;

/// Default number of concurrent project builds.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Return the platform-appropriate shell executable and flag for running
/// shell-string commands (generators, dev scripts).
///
/// On Windows, returns `("cmd", "/C")`. On Unix-like systems, `("sh", "-c")`.
pub fn shell_command() -> (&'static str, &'static str) {
    if cfg!(target_os = "windows") {
        ("cmd", "/C")
    } else {
        ("sh", "-c")
    }
}

/// Outcome of one project build.
#[derive(Debug, Clone)]
pub struct BuildResult {
    pub project: String,
    pub ok: bool,
    pub duration: Duration,
    pub stdout: String,
    pub stderr: String,
}

/// Aggregated outcome of a whole run.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub ok: bool,
    pub duration: Duration,
    pub results: Vec<BuildResult>,
}

/// Produces the `(program, args)` invocation for one project's build.
pub type BuildCommandFn = Arc<dyn Fn(&Project) -> (String, Vec<String>) + Send + Sync>;

/// Wave-by-wave build runner with bounded concurrency.
///
/// Within a wave, builds are admitted through a counting semaphore up to the
/// concurrency limit; completion order is not defined. Wave `k+1` never
/// starts until every build in wave `k` has completed. Any failure lets the
/// current wave finish, then halts execution before the next wave.
pub struct Executor {
    concurrency: usize,
    dry_run: bool,
    build_command: BuildCommandFn,
}

impl Executor {
    /// Executor using the detected package manager's build template.
    pub fn new(concurrency: usize, dry_run: bool, pm: PackageManager) -> Self {
        Self::with_command(
            concurrency,
            dry_run,
            Arc::new(move |project: &Project| pm.render_build(&project.name)),
        )
    }

    /// Executor with a custom build-command strategy.
    pub fn with_command(concurrency: usize, dry_run: bool, build_command: BuildCommandFn) -> Self {
        Executor {
            concurrency: concurrency.max(1),
            dry_run,
            build_command,
        }
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Drive the plan to completion, emitting progress events.
    ///
    /// Commands run at the workspace root with `env` plus per-project
    /// variables layered on top.
    pub async fn run(
        &self,
        plan: &BuildPlan,
        projects: &BTreeMap<String, Project>,
        root: &Path,
        env: &HashMap<String, String>,
        events: Option<&UnboundedSender<Event>>,
    ) -> Result<RunResult> {
        let run_start = Instant::now();
        let total_waves = plan.waves.len();
        let total_steps = plan.total_steps();

        let failed = Arc::new(AtomicBool::new(false));
        let results = Arc::new(tokio::sync::Mutex::new(Vec::<BuildResult>::new()));

        let mut step = 0usize;

        for (wave_idx, wave) in plan.waves.iter().enumerate() {
            let wave_number = wave_idx + 1;
            emit(
                events,
                Event::WaveStarted {
                    wave: wave_number,
                    total_waves,
                    projects: wave.clone(),
                },
            );

            let semaphore = Arc::new(Semaphore::new(self.concurrency));
            let mut handles = Vec::new();

            for name in wave {
                step += 1;

                let Some(project) = projects.get(name) else {
                    anyhow::bail!("Plan references unknown project '{}'", name);
                };

                let (program, args) = (self.build_command)(project);

                emit(
                    events,
                    Event::ProjectStarted {
                        name: name.clone(),
                        wave: wave_number,
                        total_waves,
                        step,
                        total_steps,
                        is_parallel: wave.len() > 1,
                    },
                );

                if self.dry_run {
                    let line = format!("DRY RUN: would run `{} {}`", program, args.join(" "));
                    emit(
                        events,
                        Event::ProjectOutput {
                            name: name.clone(),
                            line: line.clone(),
                            is_stderr: false,
                        },
                    );
                    emit(
                        events,
                        Event::ProjectFinished {
                            name: name.clone(),
                            success: true,
                            duration: Duration::ZERO,
                        },
                    );
                    results.lock().await.push(BuildResult {
                        project: name.clone(),
                        ok: true,
                        duration: Duration::ZERO,
                        stdout: line,
                        stderr: String::new(),
                    });
                    continue;
                }

                let sem = semaphore.clone();
                let results = results.clone();
                let failed = failed.clone();
                let tx = events.cloned();
                let name = name.clone();
                let root = root.to_path_buf();
                let env = build_project_env(env, project);

                let handle = tokio::spawn(async move {
                    // safety: the semaphore is never closed, so acquire always succeeds
                    let _permit = sem.acquire().await.expect("semaphore closed unexpectedly");

                    let result = run_build(&name, &program, &args, &root, &env, tx.as_ref()).await;

                    if !result.ok {
                        failed.store(true, Ordering::Relaxed);
                    }
                    results.lock().await.push(result);
                });

                handles.push(handle);
            }

            for handle in handles {
                handle.await.context("Build task panicked")?;
            }

            // Failure short-circuit: the wave that failed has fully drained;
            // later waves are not attempted.
            if failed.load(Ordering::Relaxed) {
                break;
            }
        }

        let results = Arc::try_unwrap(results)
            .map_err(|_| anyhow::anyhow!("Build tasks still hold the result accumulator"))?
            .into_inner();

        Ok(RunResult {
            ok: !failed.load(Ordering::Relaxed),
            duration: run_start.elapsed(),
            results,
        })
    }
}

/// Spawn one build, tee stdout/stderr line-by-line to the event sink, and
/// accumulate full buffers for the result record.
async fn run_build(
    name: &str,
    program: &str,
    args: &[String],
    root: &Path,
    env: &HashMap<String, String>,
    events: Option<&UnboundedSender<Event>>,
) -> BuildResult {
    let start = Instant::now();

    let child = tokio::process::Command::new(program)
        .args(args)
        .current_dir(root)
        .envs(env)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .spawn();

    let mut child = match child {
        Ok(child) => child,
        Err(e) => {
            let line = format!("ERROR: {}", e);
            emit(
                events,
                Event::ProjectOutput {
                    name: name.to_string(),
                    line: line.clone(),
                    is_stderr: true,
                },
            );
            emit(
                events,
                Event::ProjectFinished {
                    name: name.to_string(),
                    success: false,
                    duration: start.elapsed(),
                },
            );
            return BuildResult {
                project: name.to_string(),
                ok: false,
                duration: start.elapsed(),
                stdout: String::new(),
                stderr: line,
            };
        }
    };

    // safety: both pipes were requested above
    let stdout = child.stdout.take().expect("stdout piped");
    let stderr = child.stderr.take().expect("stderr piped");

    let stdout_task = tee_lines(name.to_string(), stdout, false, events.cloned());
    let stderr_task = tee_lines(name.to_string(), stderr, true, events.cloned());

    let status = child.wait().await;

    // Ensure streaming finishes before ProjectFinished is emitted.
    let stdout_buf = stdout_task.await.unwrap_or_default();
    let stderr_buf = stderr_task.await.unwrap_or_default();

    let success = match status {
        Ok(s) => s.success(),
        Err(e) => {
            emit(
                events,
                Event::ProjectOutput {
                    name: name.to_string(),
                    line: format!("ERROR: {}", e),
                    is_stderr: true,
                },
            );
            false
        }
    };

    emit(
        events,
        Event::ProjectFinished {
            name: name.to_string(),
            success,
            duration: start.elapsed(),
        },
    );

    BuildResult {
        project: name.to_string(),
        ok: success,
        duration: start.elapsed(),
        stdout: stdout_buf,
        stderr: stderr_buf,
    }
}

/// Stream lines from a child pipe to the event sink while accumulating the
/// full buffer for the result record.
fn tee_lines<R>(
    name: String,
    reader: R,
    is_stderr: bool,
    events: Option<UnboundedSender<Event>>,
) -> tokio::task::JoinHandle<String>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let reader = BufReader::new(reader);
        let mut lines = reader.lines();
        let mut buffer = String::new();
        while let Ok(Some(line)) = lines.next_line().await {
            buffer.push_str(&line);
            buffer.push('\n');
            emit(
                events.as_ref(),
                Event::ProjectOutput {
                    name: name.clone(),
                    line,
                    is_stderr,
                },
            );
        }
        buffer
    })
}

/// Layer per-project variables over the workspace environment.
fn build_project_env(base: &HashMap<String, String>, project: &Project) -> HashMap<String, String> {
    let mut env = base.clone();
    env.insert("RIPPLE_PROJECT_NAME".to_string(), project.name.clone());
    env.insert(
        "RIPPLE_PROJECT_PATH".to_string(),
        project.absolute_path.display().to_string(),
    );
    env
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    use crate::graph::test_support::make_project;

    fn projects_map(names: &[&str]) -> BTreeMap<String, Project> {
        names
            .iter()
            .map(|n| (n.to_string(), make_project(n, &[])))
            .collect()
    }

    fn plan_of(waves: &[&[&str]]) -> BuildPlan {
        let affected: BTreeSet<String> = waves
            .iter()
            .flat_map(|w| w.iter().map(|s| s.to_string()))
            .collect();
        BuildPlan {
            affected,
            waves: waves
                .iter()
                .map(|w| w.iter().map(|s| s.to_string()).collect())
                .collect(),
        }
    }

    /// Build-command strategy that runs a per-project shell snippet.
    fn sh_commands(table: &[(&str, &str)]) -> BuildCommandFn {
        let table: HashMap<String, String> = table
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Arc::new(move |project: &Project| {
            let snippet = table
                .get(&project.name)
                .cloned()
                .unwrap_or_else(|| "true".to_string());
            let (shell, flag) = shell_command();
            (shell.to_string(), vec![flag.to_string(), snippet])
        })
    }

    #[tokio::test]
    async fn test_successful_run_collects_all_results() {
        let projects = projects_map(&["a", "b", "c"]);
        let plan = plan_of(&[&["b", "c"], &["a"]]);
        let executor = Executor::with_command(
            2,
            false,
            sh_commands(&[("a", "echo built-a"), ("b", "true"), ("c", "true")]),
        );

        let result = executor
            .run(&plan, &projects, Path::new("/tmp"), &HashMap::new(), None)
            .await
            .unwrap();

        assert!(result.ok);
        assert_eq!(result.results.len(), 3);
        let a = result.results.iter().find(|r| r.project == "a").unwrap();
        assert!(a.ok);
        assert_eq!(a.stdout, "built-a\n");
    }

    #[tokio::test]
    async fn test_failure_short_circuits_later_waves() {
        // Two waves [[x, y], [z]]: x fails, y still completes, z never starts.
        let projects = projects_map(&["x", "y", "z"]);
        let plan = plan_of(&[&["x", "y"], &["z"]]);
        let executor = Executor::with_command(
            2,
            false,
            sh_commands(&[("x", "exit 1"), ("y", "echo y-ran"), ("z", "echo z-ran")]),
        );

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let result = executor
            .run(&plan, &projects, Path::new("/tmp"), &HashMap::new(), Some(&tx))
            .await
            .unwrap();
        drop(tx);

        assert!(!result.ok);
        let names: BTreeSet<&str> = result.results.iter().map(|r| r.project.as_str()).collect();
        assert_eq!(names, ["x", "y"].into_iter().collect());

        let y = result.results.iter().find(|r| r.project == "y").unwrap();
        assert!(y.ok, "in-flight wave member runs to completion");

        while let Some(event) = rx.recv().await {
            if let Event::ProjectStarted { name, .. } = event {
                assert_ne!(name, "z", "suppressed wave must not start");
            }
        }
    }

    #[tokio::test]
    async fn test_dry_run_synthesizes_success() {
        let projects = projects_map(&["a", "b"]);
        let plan = plan_of(&[&["a", "b"]]);
        let executor = Executor::new(4, true, PackageManager::Npm);

        let result = executor
            .run(&plan, &projects, Path::new("/tmp"), &HashMap::new(), None)
            .await
            .unwrap();

        assert!(result.ok);
        assert_eq!(result.results.len(), 2);
        for r in &result.results {
            assert!(r.ok);
            assert!(r.stdout.contains("DRY RUN"));
            assert!(r.stdout.contains("npm run build -w"));
        }
    }

    #[tokio::test]
    async fn test_stderr_is_captured_separately() {
        let projects = projects_map(&["a"]);
        let plan = plan_of(&[&["a"]]);
        let executor =
            Executor::with_command(1, false, sh_commands(&[("a", "echo oops >&2; exit 2")]));

        let result = executor
            .run(&plan, &projects, Path::new("/tmp"), &HashMap::new(), None)
            .await
            .unwrap();

        assert!(!result.ok);
        let a = &result.results[0];
        assert!(!a.ok);
        assert_eq!(a.stderr, "oops\n");
        assert!(a.stdout.is_empty());
    }

    #[tokio::test]
    async fn test_step_numbering_spans_waves() {
        let projects = projects_map(&["a", "b", "c"]);
        let plan = plan_of(&[&["b", "c"], &["a"]]);
        let executor = Executor::with_command(1, false, sh_commands(&[]));

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        executor
            .run(&plan, &projects, Path::new("/tmp"), &HashMap::new(), Some(&tx))
            .await
            .unwrap();
        drop(tx);

        let mut steps = Vec::new();
        while let Some(event) = rx.recv().await {
            if let Event::ProjectStarted {
                step, total_steps, ..
            } = event
            {
                assert_eq!(total_steps, 3);
                steps.push(step);
            }
        }
        steps.sort_unstable();
        assert_eq!(steps, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_spawn_error_marks_project_failed() {
        let projects = projects_map(&["a"]);
        let plan = plan_of(&[&["a"]]);
        let executor = Executor::with_command(
            1,
            false,
            Arc::new(|_: &Project| ("definitely-not-a-binary-xyz".to_string(), vec![])),
        );

        let result = executor
            .run(&plan, &projects, Path::new("/tmp"), &HashMap::new(), None)
            .await
            .unwrap();

        assert!(!result.ok);
        assert!(result.results[0].stderr.contains("ERROR"));
    }

    #[test]
    fn test_concurrency_floor_is_one() {
        let executor = Executor::new(0, false, PackageManager::Npm);
        assert_eq!(executor.concurrency, 1);
    }
}
