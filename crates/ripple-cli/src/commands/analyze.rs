use anyhow::Result;
use clap::Args;
use colored::Colorize;

use ripple_core::graph::DependencyGraph;
use ripple_core::workspace::Workspace;

/// Arguments for the `analyze` command
#[derive(Args, Debug)]
pub struct AnalyzeArgs {
    /// Also list each project's dependents (reverse edges)
    #[arg(long)]
    pub rdeps: bool,
}

/// Print the dependency graph and detect cycles.
///
/// Exit code is non-zero when any cycle exists — downstream commands would
/// refuse to plan against this graph.
pub async fn run(workspace: &Workspace, args: AnalyzeArgs) -> Result<()> {
    let graph = DependencyGraph::build(&workspace.projects);

    println!(
        "\n{} {} project(s), {} workspace edge(s)\n",
        "Graph:".bold(),
        graph.projects.len(),
        graph.deps.values().map(|d| d.len()).sum::<usize>(),
    );

    for (name, project) in &graph.projects {
        let deps: Vec<&str> = graph.deps_of(name).collect();
        let deps_display = if deps.is_empty() {
            "(no workspace deps)".dimmed().to_string()
        } else {
            format!("-> {}", deps.join(", "))
        };
        println!(
            "  {} {} {}",
            name.cyan().bold(),
            format!("({})", project.relative_path()).dimmed(),
            deps_display,
        );

        if args.rdeps {
            let rdeps: Vec<&str> = graph.rdeps_of(name).collect();
            if !rdeps.is_empty() {
                println!("      {} {}", "<-".dimmed(), rdeps.join(", ").dimmed());
            }
        }
    }

    let cycles = graph.detect_cycles();
    if !cycles.is_empty() {
        println!();
        for cycle in &cycles {
            eprintln!(
                "  {} {}",
                "CYCLE:".red().bold(),
                cycle.join(" -> ")
            );
        }
        anyhow::bail!("{} dependency cycle(s) detected", cycles.len());
    }

    println!("\n{} No dependency cycles.", "OK".green().bold());
    Ok(())
}
