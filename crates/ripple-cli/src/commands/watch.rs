use std::collections::BTreeSet;

use anyhow::{Result, bail};
use clap::Args;
use colored::Colorize;

use ripple_core::executor::{DEFAULT_CONCURRENCY, Executor};
use ripple_core::orchestrator::{Orchestrator, OrchestratorOptions};
use ripple_core::pm::PackageManager;
use ripple_core::project::filter::FilterPattern;
use ripple_core::watcher::{self, WatchOptions};
use ripple_core::workspace::Workspace;

/// Arguments for the `watch` command
#[derive(Args, Debug)]
pub struct WatchArgs {
    /// Dev-server targets to start (name, path, or name suffix)
    pub targets: Vec<String>,

    /// Restrict rebuilds to projects whose path matches the pattern (`*` wildcard)
    #[arg(long)]
    pub filter: Option<String>,

    /// Debounce window for file change events, in milliseconds
    #[arg(long, default_value_t = watcher::DEFAULT_DEBOUNCE_MS)]
    pub debounce: u64,

    /// Number of concurrent project builds
    #[arg(short = 'c', long, default_value_t = DEFAULT_CONCURRENCY)]
    pub concurrency: usize,
}

/// Watch mode: optionally pre-build and start dev servers, then rebuild the
/// affected set on every debounced change batch until Ctrl+C.
pub async fn run(workspace: Workspace, args: WatchArgs) -> Result<()> {
    // Resolve dev targets up front; unresolved ids warn, all-dropped is fatal.
    let targets: BTreeSet<String> = if args.targets.is_empty() {
        BTreeSet::new()
    } else {
        let (resolved, unresolved) = workspace.resolve_ids(&args.targets);
        if !unresolved.is_empty() {
            eprintln!(
                "{} Unknown dev target(s): {}",
                "WARNING:".yellow().bold(),
                unresolved.join(", ")
            );
        }
        if resolved.is_empty() {
            bail!(
                "None of the given dev targets matched a workspace project: {}",
                args.targets.join(", ")
            );
        }
        resolved.into_iter().collect()
    };

    // The watcher thread needs its own view of the project list and root.
    let watch_root = workspace.root_path.clone();
    let watch_projects = workspace.projects.clone();

    let pm = PackageManager::detect(&workspace);
    let executor = Executor::new(args.concurrency, false, pm);
    let options = OrchestratorOptions {
        filter: args.filter.as_deref().map(FilterPattern::new),
    };

    let (tx, render_handle) = crate::render::spawn_plain_renderer();
    let mut orchestrator = Orchestrator::new(workspace, executor, options, Some(tx));

    // Bring dev dependencies up to date and start the dev servers before
    // the watch loop begins.
    if !targets.is_empty() {
        println!(
            "{} Pre-building dependencies of: {}\n",
            "i".blue(),
            targets.iter().cloned().collect::<Vec<_>>().join(", ").bold(),
        );
        orchestrator.pre_dev_build(&targets).await?;
        orchestrator.start_dev_tasks(&targets).await?;
    }

    // Generator outputs join the ignore set so a generator writing into a
    // watched tree cannot schedule another build.
    let extra_ignores = orchestrator.watch_ignore_globs();

    let (batch_tx, batch_rx) = tokio::sync::mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = tokio::sync::mpsc::channel::<()>(1);

    let debounce_ms = args.debounce;
    let watcher_handle = tokio::task::spawn_blocking(move || {
        watcher::start_watching(
            &watch_root,
            &watch_projects,
            WatchOptions {
                debounce_ms,
                extra_ignores,
            },
            batch_tx,
            shutdown_rx,
        )
    });

    let shutdown_tx_ctrlc = shutdown_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("\n{} Shutting down...", "!".yellow());
            let _ = shutdown_tx_ctrlc.send(()).await;
        }
    });

    println!(
        "\n{} Watching for changes... (press {} to stop)\n",
        "i".blue(),
        "Ctrl+C".bold(),
    );

    // The loop runs until the watcher exits and drops its batch sender.
    orchestrator.run_watch_loop(batch_rx).await?;

    // Kill every supervised dev task's process group, then drain the watcher.
    orchestrator.shutdown().await;
    watcher_handle.await??;

    drop(shutdown_tx);
    drop(orchestrator);
    render_handle.await??;

    Ok(())
}
