use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tracing::debug;

use crate::events::{Event, emit};
use crate::executor::{Executor, RunResult};
use crate::generator::{GeneratorRegistry, run_generators};
use crate::graph::DependencyGraph;
use crate::plan::plan_waves;
use crate::pm::PackageManager;
use crate::project::filter::FilterPattern;
use crate::supervisor::TaskSupervisor;
use crate::watcher::ChangeBatch;
use crate::workspace::Workspace;

/// Serialized rebuild state.
///
/// One logical builder runs at a time. While a build is in progress, any
/// additional change sets accumulate into a single pending batch, which
/// becomes the next build's input — chains of changes during active builds
/// collapse to exactly one follow-up build.
#[derive(Debug, Default)]
pub struct CoalesceState {
    is_building: bool,
    pending: Option<BTreeSet<String>>,
}

impl CoalesceState {
    /// A change set arrived. Returns the set to build now, or `None` when a
    /// build is in progress and the set was coalesced into pending.
    pub fn on_change(&mut self, changed: BTreeSet<String>) -> Option<BTreeSet<String>> {
        if self.is_building {
            self.pending.get_or_insert_with(BTreeSet::new).extend(changed);
            return None;
        }
        self.is_building = true;
        Some(changed)
    }

    /// The current build finished. Returns the coalesced pending set (the
    /// builder keeps the lock and re-enters), or releases the lock.
    pub fn on_build_done(&mut self) -> Option<BTreeSet<String>> {
        match self.pending.take() {
            Some(pending) => Some(pending),
            None => {
                self.is_building = false;
                None
            }
        }
    }

    pub fn is_building(&self) -> bool {
        self.is_building
    }
}

/// Orchestrator configuration.
pub struct OrchestratorOptions {
    pub filter: Option<FilterPattern>,
}

/// Composes the affected computer, wave planner, generator registry,
/// executor, and task supervisor into the plan-then-execute path used by
/// both one-shot builds and the watch loop.
pub struct Orchestrator {
    pub workspace: Workspace,
    pub graph: DependencyGraph,
    pub registry: GeneratorRegistry,
    executor: Executor,
    filter: Option<FilterPattern>,
    supervisor: Arc<TaskSupervisor>,
    events: Option<UnboundedSender<Event>>,
    state: CoalesceState,
    build_count: u64,
}

impl Orchestrator {
    pub fn new(
        workspace: Workspace,
        executor: Executor,
        options: OrchestratorOptions,
        events: Option<UnboundedSender<Event>>,
    ) -> Self {
        let graph = DependencyGraph::build(&workspace.projects);
        let registry = GeneratorRegistry::load(&workspace);
        let supervisor = TaskSupervisor::new(events.clone());

        Orchestrator {
            workspace,
            graph,
            registry,
            executor,
            filter: options.filter,
            supervisor,
            events,
            state: CoalesceState::default(),
            build_count: 0,
        }
    }

    pub fn build_count(&self) -> u64 {
        self.build_count
    }

    pub fn supervisor(&self) -> Arc<TaskSupervisor> {
        Arc::clone(&self.supervisor)
    }

    /// Ignore globs the watcher must carry so generator outputs cannot
    /// schedule the build that just produced them.
    pub fn watch_ignore_globs(&self) -> Vec<String> {
        self.registry.ignore_globs()
    }

    /// Restrict an affected set to the user's `--filter` pattern, if any.
    fn apply_filter(&self, affected: BTreeSet<String>) -> BTreeSet<String> {
        let Some(ref filter) = self.filter else {
            return affected;
        };
        affected
            .into_iter()
            .filter(|name| {
                self.workspace
                    .project(name)
                    .is_some_and(|p| filter.matches(&p.relative_path()))
            })
            .collect()
    }

    /// One-shot build for the `build` command: affected → plan → generators
    /// → executor. Generator failure aborts the whole run.
    pub async fn build_once(&mut self, seeds: &BTreeSet<String>) -> Result<RunResult> {
        self.build_count += 1;

        let affected = self.graph.affected(seeds);
        let filtered = self.apply_filter(affected);

        if filtered.is_empty() {
            emit(
                self.events.as_ref(),
                Event::Info("Nothing to build.".to_string()),
            );
            return Ok(RunResult {
                ok: true,
                duration: std::time::Duration::ZERO,
                results: Vec::new(),
            });
        }

        let plan = plan_waves(&filtered, &self.graph.deps)?;

        let triggered = self.registry.triggered(&filtered, &self.workspace);
        if !triggered.is_empty() {
            if self.executor.is_dry_run() {
                let keys: Vec<&str> = triggered.iter().map(|g| g.key.as_str()).collect();
                emit(
                    self.events.as_ref(),
                    Event::Info(format!("DRY RUN: would run generator(s): {}", keys.join(", "))),
                );
            } else {
                run_generators(&triggered, &self.workspace.env_vars(), self.events.as_ref())
                    .await?;
            }
        }

        self.executor
            .run(
                &plan,
                &self.graph.projects,
                &self.workspace.root_path,
                &self.workspace.env_vars(),
                self.events.as_ref(),
            )
            .await
    }

    /// One rebuild pass in watch mode. Forgiving: planner, generator, and
    /// build failures log and return so the next change event gets a clean
    /// attempt. Returns `None` when the filtered affected set was empty or
    /// the run never reached the executor.
    pub async fn rebuild(&mut self, changed: &BTreeSet<String>) -> Option<RunResult> {
        self.build_count += 1;

        let affected = self.graph.affected(changed);
        let filtered = self.apply_filter(affected);

        if filtered.is_empty() {
            debug!(?changed, "no affected projects after filtering");
            emit(self.events.as_ref(), Event::Status(None));
            return None;
        }

        emit(
            self.events.as_ref(),
            Event::Status(Some(format!(
                "Building {} project(s)...",
                filtered.len()
            ))),
        );

        let plan = match plan_waves(&filtered, &self.graph.deps) {
            Ok(plan) => plan,
            Err(e) => {
                emit(
                    self.events.as_ref(),
                    Event::Warning(format!("Planning failed: {}", e)),
                );
                emit(self.events.as_ref(), Event::Status(None));
                return None;
            }
        };

        let triggered = self.registry.triggered(&filtered, &self.workspace);
        if !triggered.is_empty()
            && let Err(e) =
                run_generators(&triggered, &self.workspace.env_vars(), self.events.as_ref()).await
        {
            emit(
                self.events.as_ref(),
                Event::Warning(format!("Generator failed: {}", e)),
            );
            emit(self.events.as_ref(), Event::Status(None));
            return None;
        }

        let result = self
            .executor
            .run(
                &plan,
                &self.graph.projects,
                &self.workspace.root_path,
                &self.workspace.env_vars(),
                self.events.as_ref(),
            )
            .await;

        match result {
            Ok(run) => {
                let status = if run.ok {
                    format!(
                        "Build #{} succeeded ({} project(s), {:.1}s)",
                        self.build_count,
                        run.results.len(),
                        run.duration.as_secs_f64()
                    )
                } else {
                    format!("Build #{} failed", self.build_count)
                };
                emit(self.events.as_ref(), Event::Status(Some(status)));
                Some(run)
            }
            Err(e) => {
                emit(
                    self.events.as_ref(),
                    Event::Warning(format!("Build failed to run: {}", e)),
                );
                emit(self.events.as_ref(), Event::Status(None));
                None
            }
        }
    }

    /// Build the transitive dependency closure of the dev targets (excluding
    /// the targets themselves), then run generators whose deps land in
    /// `targets ∪ closure`. Runs before any dev server starts; failures here
    /// are fatal — a dev server must not come up over stale dependencies.
    pub async fn pre_dev_build(&mut self, targets: &BTreeSet<String>) -> Result<()> {
        let closure = self.graph.dependency_closure(targets);

        if !closure.is_empty() {
            let plan = plan_waves(&closure, &self.graph.deps)?;
            let result = self
                .executor
                .run(
                    &plan,
                    &self.graph.projects,
                    &self.workspace.root_path,
                    &self.workspace.env_vars(),
                    self.events.as_ref(),
                )
                .await?;

            if !result.ok {
                anyhow::bail!("Pre-dev build of dependency closure failed");
            }
        }

        let scope: BTreeSet<String> = targets.union(&closure).cloned().collect();
        let triggered = self.registry.triggered(&scope, &self.workspace);
        if !triggered.is_empty() {
            run_generators(&triggered, &self.workspace.env_vars(), self.events.as_ref()).await?;
        }

        Ok(())
    }

    /// Start each target's dev task through the supervisor. Targets without
    /// a `dev` script are skipped with a warning.
    pub async fn start_dev_tasks(&self, targets: &BTreeSet<String>) -> Result<()> {
        let pm = PackageManager::detect(&self.workspace);

        for name in targets {
            let Some(project) = self.workspace.project(name) else {
                emit(
                    self.events.as_ref(),
                    Event::Warning(format!("Unknown dev target '{}'", name)),
                );
                continue;
            };

            if project.script("dev").is_none() {
                emit(
                    self.events.as_ref(),
                    Event::Warning(format!("Project '{}' has no `dev` script; skipping", name)),
                );
                continue;
            }

            let (program, args) = pm.render_script(name, "dev");
            let command = format!("{} {}", program, args.join(" "));

            self.supervisor
                .spawn_task(name, &command, &self.workspace.root_path, &self.workspace.env_vars())
                .await?;
        }

        Ok(())
    }

    /// Drive the watch loop until the batch channel closes.
    ///
    /// The loop is the single logical builder: batches received while a
    /// rebuild is in flight sit in the channel, are folded into one pending
    /// set when the rebuild finishes, and trigger exactly one follow-up
    /// rebuild.
    pub async fn run_watch_loop(
        &mut self,
        mut batch_rx: UnboundedReceiver<ChangeBatch>,
    ) -> Result<()> {
        while let Some(batch) = batch_rx.recv().await {
            // The loop is idle here, so this always starts a build.
            let Some(mut current) = self.state.on_change(batch.changed) else {
                continue;
            };

            loop {
                debug!(projects = ?current, "rebuilding");
                self.rebuild(&current).await;

                // Everything that arrived during the rebuild coalesces
                while let Ok(extra) = batch_rx.try_recv() {
                    let _ = self.state.on_change(extra.changed);
                }

                match self.state.on_build_done() {
                    Some(next) => current = next,
                    None => break,
                }
            }
        }

        Ok(())
    }

    /// Kill all supervised tasks and report the outcome.
    pub async fn shutdown(&self) {
        let outcomes = self.supervisor.shutdown_all().await;
        for (name, killed) in outcomes {
            let line = if killed {
                format!("Stopped dev task '{}'", name)
            } else {
                format!("Failed to stop dev task '{}'", name)
            };
            emit(self.events.as_ref(), Event::Info(line));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::fs;
    use std::sync::Arc as StdArc;
    use tempfile::TempDir;

    use crate::executor::{BuildCommandFn, shell_command};
    use crate::project::Project;

    fn set(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    // -----------------------------------------------------------------------
    // CoalesceState
    // -----------------------------------------------------------------------

    #[test]
    fn test_coalesce_idle_change_starts_build() {
        let mut state = CoalesceState::default();
        assert_eq!(state.on_change(set(&["a"])), Some(set(&["a"])));
        assert!(state.is_building());
    }

    #[test]
    fn test_coalesce_changes_during_build_fold_into_one_pending() {
        let mut state = CoalesceState::default();
        state.on_change(set(&["a"]));

        assert_eq!(state.on_change(set(&["b"])), None);
        assert_eq!(state.on_change(set(&["c"])), None);
        assert_eq!(state.on_change(set(&["b"])), None);

        // One pending batch, the union of everything that arrived
        assert_eq!(state.on_build_done(), Some(set(&["b", "c"])));
        assert!(state.is_building(), "lock is held for the follow-up build");

        // Follow-up finished with nothing new: released
        assert_eq!(state.on_build_done(), None);
        assert!(!state.is_building());
    }

    #[test]
    fn test_coalesce_release_without_pending() {
        let mut state = CoalesceState::default();
        state.on_change(set(&["a"]));
        assert_eq!(state.on_build_done(), None);
        assert!(!state.is_building());

        // Next change starts a fresh build
        assert_eq!(state.on_change(set(&["d"])), Some(set(&["d"])));
    }

    // -----------------------------------------------------------------------
    // Orchestrator over fixture workspaces
    // -----------------------------------------------------------------------

    fn fixture(projects: &[(&str, &str)]) -> (TempDir, Workspace) {
        let tmp = TempDir::new().unwrap();
        fs::write(
            tmp.path().join("package.json"),
            r#"{"name": "x", "workspaces": ["packages/*", "apps/*"]}"#,
        )
        .unwrap();
        for (rel, manifest) in projects {
            let dir = tmp.path().join(rel);
            fs::create_dir_all(&dir).unwrap();
            fs::write(dir.join("package.json"), manifest).unwrap();
        }
        let ws = Workspace::load(tmp.path()).unwrap();
        (tmp, ws)
    }

    /// Executor whose "build" echoes the project name.
    fn echo_executor() -> Executor {
        let command: BuildCommandFn = StdArc::new(|project: &Project| {
            let (shell, flag) = shell_command();
            (
                shell.to_string(),
                vec![flag.to_string(), format!("echo built {}", project.name)],
            )
        });
        Executor::with_command(2, false, command)
    }

    fn orchestrator(
        ws: Workspace,
        filter: Option<FilterPattern>,
    ) -> (Orchestrator, tokio::sync::mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let orch = Orchestrator::new(
            ws,
            echo_executor(),
            OrchestratorOptions { filter },
            Some(tx),
        );
        (orch, rx)
    }

    #[tokio::test]
    async fn test_rebuild_builds_affected_closure() {
        let (_tmp, ws) = fixture(
            &[
                ("packages/core", r#"{"name": "core"}"#),
                ("packages/api", r#"{"name": "api", "dependencies": {"core": "*"}}"#),
                ("apps/web", r#"{"name": "web", "dependencies": {"api": "*"}}"#),
            ],
        );

        let (mut orch, mut rx) = orchestrator(ws, None);
        let run = orch.rebuild(&set(&["core"])).await.unwrap();
        assert!(run.ok);

        let built: BTreeSet<&str> = run.results.iter().map(|r| r.project.as_str()).collect();
        assert_eq!(built, ["core", "api", "web"].into_iter().collect());
        assert_eq!(orch.build_count(), 1);

        drop(orch);
        let mut saw_status = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, Event::Status(Some(_))) {
                saw_status = true;
            }
        }
        assert!(saw_status);
    }

    #[tokio::test]
    async fn test_rebuild_empty_after_filter_skips_executor() {
        let (_tmp, ws) = fixture(
            &[
                ("packages/core", r#"{"name": "core"}"#),
                ("apps/web", r#"{"name": "web"}"#),
            ],
        );

        let filter = Some(FilterPattern::new("apps/*"));
        let (mut orch, mut rx) = orchestrator(ws, filter);

        // core is affected but filtered out
        assert!(orch.rebuild(&set(&["core"])).await.is_none());

        drop(orch);
        while let Ok(event) = rx.try_recv() {
            assert!(
                !matches!(event, Event::ProjectStarted { .. }),
                "no project may build when the filtered set is empty"
            );
        }
    }

    #[tokio::test]
    async fn test_rebuild_generator_failure_is_forgiving() {
        let (_tmp, ws) = fixture(
            &[("packages/api", r#"{"name": "api", "sources": {"gen": "exit 1"}}"#)],
        );

        let (mut orch, mut rx) = orchestrator(ws, None);
        assert!(orch.rebuild(&set(&["api"])).await.is_none());

        drop(orch);
        let mut saw_warning = false;
        let mut saw_build = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                Event::Warning(msg) if msg.contains("Generator failed") => saw_warning = true,
                Event::ProjectStarted { .. } => saw_build = true,
                _ => {}
            }
        }
        assert!(saw_warning);
        assert!(!saw_build, "executor must not run after a generator failure");
    }

    #[tokio::test]
    async fn test_build_once_runs_generators_before_builds() {
        let (tmp, ws) = fixture(
            &[(
                "packages/api",
                r#"{"name": "api", "sources": {"gen": "echo ran > gen-marker.txt"}}"#,
            )],
        );

        let marker = ws.project("api").unwrap().absolute_path.join("gen-marker.txt");

        let (mut orch, _rx) = orchestrator(ws, None);
        let run = orch.build_once(&set(&["api"])).await.unwrap();
        assert!(run.ok);
        assert!(marker.exists(), "generator ran before the build");
        drop(tmp);
    }

    #[tokio::test]
    async fn test_build_once_generator_failure_aborts() {
        let (_tmp, ws) = fixture(
            &[("packages/api", r#"{"name": "api", "sources": {"gen": "exit 2"}}"#)],
        );

        let (mut orch, _rx) = orchestrator(ws, None);
        let err = orch.build_once(&set(&["api"])).await.unwrap_err();
        assert!(err.to_string().contains("gen"));
    }

    #[tokio::test]
    async fn test_pre_dev_build_builds_closure_not_targets() {
        let (_tmp, ws) = fixture(
            &[
                ("packages/core", r#"{"name": "core"}"#),
                ("packages/api", r#"{"name": "api", "dependencies": {"core": "*"}}"#),
                ("apps/web", r#"{"name": "web", "dependencies": {"api": "*"}}"#),
            ],
        );

        let (mut orch, mut rx) = orchestrator(ws, None);
        orch.pre_dev_build(&set(&["web"])).await.unwrap();

        drop(orch);
        let mut built = BTreeSet::new();
        while let Ok(event) = rx.try_recv() {
            if let Event::ProjectFinished { name, .. } = event {
                built.insert(name);
            }
        }
        assert_eq!(built, set(&["api", "core"]));
    }

    #[tokio::test]
    async fn test_watch_loop_coalesces_queued_batches() {
        let (_tmp, ws) = fixture(
            &[
                ("packages/a", r#"{"name": "a"}"#),
                ("packages/b", r#"{"name": "b"}"#),
                ("packages/c", r#"{"name": "c"}"#),
            ],
        );

        let (mut orch, _rx) = orchestrator(ws, None);

        let (batch_tx, batch_rx) = tokio::sync::mpsc::unbounded_channel();
        let batch = |names: &[&str]| ChangeBatch {
            changed: set(names),
            files_by_project: HashMap::new(),
            escalated: false,
        };

        // First batch triggers a build; the two queued during it collapse
        // into one follow-up build.
        batch_tx.send(batch(&["a"])).unwrap();
        batch_tx.send(batch(&["b"])).unwrap();
        batch_tx.send(batch(&["c"])).unwrap();
        drop(batch_tx);

        orch.run_watch_loop(batch_rx).await.unwrap();

        assert_eq!(orch.build_count(), 2, "three batches, two builds");
    }

    #[tokio::test]
    async fn test_watch_ignore_globs_cover_generator_outputs() {
        let (_tmp, ws) = fixture(
            &[(
                "packages/api",
                r#"{"name": "api", "sources": {"src/generated": "gen"}}"#,
            )],
        );

        let (orch, _rx) = orchestrator(ws, None);
        let globs = orch.watch_ignore_globs();
        assert!(globs.iter().any(|g| g.contains("src/generated")));
    }
}
