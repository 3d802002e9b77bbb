use std::collections::BTreeSet;

use anyhow::{Result, bail};
use clap::Args;
use colored::Colorize;

use ripple_core::executor::{DEFAULT_CONCURRENCY, Executor};
use ripple_core::graph::DependencyGraph;
use ripple_core::orchestrator::{Orchestrator, OrchestratorOptions};
use ripple_core::pm::PackageManager;
use ripple_core::project::filter::FilterPattern;
use ripple_core::workspace::Workspace;

use super::plan::resolve_changed;

/// Arguments for the `build` command
#[derive(Args, Debug)]
pub struct BuildArgs {
    /// Changed project identifiers; omit to build the whole workspace
    #[arg(long = "changed", num_args = 1..)]
    pub changed: Vec<String>,

    /// Number of concurrent project builds
    #[arg(short = 'c', long, default_value_t = DEFAULT_CONCURRENCY)]
    pub concurrency: usize,

    /// Show what would be built without spawning anything
    #[arg(long)]
    pub dry_run: bool,

    /// Restrict builds to projects whose path matches the pattern (`*` wildcard)
    #[arg(long)]
    pub filter: Option<String>,
}

/// Run triggered generators, then build the affected set wave by wave.
pub async fn run(workspace: Workspace, args: BuildArgs) -> Result<()> {
    let seeds: BTreeSet<String> = if args.changed.is_empty() {
        workspace.project_names().into_iter().collect()
    } else {
        resolve_changed(&workspace, &args.changed)?
    };

    if workspace.projects.is_empty() {
        println!("{}", "No projects in the workspace.".yellow());
        return Ok(());
    }

    // Refuse to plan over a cyclic graph
    let graph = DependencyGraph::build(&workspace.projects);
    let cycles = graph.detect_cycles();
    if !cycles.is_empty() {
        for cycle in &cycles {
            eprintln!("  {} {}", "CYCLE:".red().bold(), cycle.join(" -> "));
        }
        bail!("Refusing to build: the dependency graph has cycles");
    }

    // The build total is known before the orchestrator runs: the affected
    // closure of the seeds, narrowed by the filter pattern.
    let filter = args.filter.as_deref().map(FilterPattern::new);
    let affected = graph.affected(&seeds);
    let candidates = workspace.projects.iter().filter(|p| affected.contains(&p.name));
    let to_build = match &filter {
        Some(f) => f.apply(candidates),
        None => candidates.collect(),
    };

    let pm = PackageManager::detect(&workspace);
    println!(
        "Building with {} (concurrency {}{})\n",
        pm.to_string().cyan(),
        args.concurrency.to_string().cyan(),
        if args.dry_run { ", dry-run" } else { "" },
    );

    let executor = Executor::new(args.concurrency, args.dry_run, pm);
    let options = OrchestratorOptions { filter };

    let (tx, render_handle) = if args.dry_run {
        crate::render::spawn_plain_renderer()
    } else {
        crate::render::spawn_renderer(to_build.len(), "Building projects...")
    };
    let mut orchestrator = Orchestrator::new(workspace, executor, options, Some(tx));

    let result = orchestrator.build_once(&seeds).await;

    drop(orchestrator);
    render_handle.await??;

    let result = result?;
    let failed = result.results.iter().filter(|r| !r.ok).count();
    if !result.ok {
        bail!("{} project(s) failed to build", failed.max(1));
    }

    println!(
        "\nBuilt {} project(s) in {:.1}s",
        result.results.len().to_string().cyan(),
        result.duration.as_secs_f64(),
    );

    Ok(())
}
