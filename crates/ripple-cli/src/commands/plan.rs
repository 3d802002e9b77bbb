use std::collections::BTreeSet;

use anyhow::{Result, bail};
use clap::Args;
use colored::Colorize;

use ripple_core::graph::DependencyGraph;
use ripple_core::plan::plan_waves;
use ripple_core::workspace::Workspace;

/// Arguments for the `plan` command
#[derive(Args, Debug)]
pub struct PlanArgs {
    /// Changed project identifiers (name, workspace-relative path, or name suffix)
    #[arg(long = "changed", num_args = 1.., required = true)]
    pub changed: Vec<String>,

    /// Output the plan as JSON
    #[arg(long)]
    pub json: bool,
}

/// Compute the affected set and wave plan for a change set.
pub async fn run(workspace: &Workspace, args: PlanArgs) -> Result<()> {
    let seeds = resolve_changed(workspace, &args.changed)?;

    let graph = DependencyGraph::build(&workspace.projects);

    let cycles = graph.detect_cycles();
    if !cycles.is_empty() {
        for cycle in &cycles {
            eprintln!("  {} {}", "CYCLE:".red().bold(), cycle.join(" -> "));
        }
        bail!("Refusing to plan: the dependency graph has cycles");
    }

    let affected = graph.affected(&seeds);
    let plan = plan_waves(&affected, &graph.deps)?;

    if args.json {
        let value = serde_json::json!({
            "changed": seeds.iter().collect::<Vec<_>>(),
            "affected": plan.affected.iter().collect::<Vec<_>>(),
            "waves": plan.waves,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!(
        "\n{} {} changed, {} affected, {} wave(s)\n",
        "Plan:".bold(),
        seeds.len(),
        plan.affected.len(),
        plan.waves.len(),
    );

    for (i, wave) in plan.waves.iter().enumerate() {
        println!(
            "  {} {}",
            format!("wave {}:", i + 1).cyan().bold(),
            wave.join(", ")
        );
    }

    Ok(())
}

/// Resolve `--changed` identifiers, warning about (and dropping) any that do
/// not match a project. Dropping all of them is fatal.
pub fn resolve_changed(workspace: &Workspace, ids: &[String]) -> Result<BTreeSet<String>> {
    let (resolved, unresolved) = workspace.resolve_ids(ids);

    if !unresolved.is_empty() {
        eprintln!(
            "{} Unknown project identifier(s): {}",
            "WARNING:".yellow().bold(),
            unresolved.join(", ")
        );
    }

    if resolved.is_empty() {
        bail!(
            "None of the given identifiers matched a workspace project: {}",
            ids.join(", ")
        );
    }

    Ok(resolved.into_iter().collect())
}
