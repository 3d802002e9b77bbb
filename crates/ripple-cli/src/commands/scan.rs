use anyhow::{Result, bail};
use clap::Args;
use colored::Colorize;

use ripple_core::generator::GeneratorRegistry;
use ripple_core::scanner::scan_workspace;
use ripple_core::workspace::Workspace;

/// Arguments for the `scan` command
#[derive(Args, Debug)]
pub struct ScanArgs {
    /// Output findings as JSON
    #[arg(long)]
    pub json: bool,
}

/// Scan project sources for relative imports whose targets are missing.
///
/// Generator output paths are expected to be missing on a clean checkout
/// and are filtered out; the configured generators are listed instead.
pub async fn run(workspace: &Workspace, args: ScanArgs) -> Result<()> {
    let registry = GeneratorRegistry::load(workspace);
    let outputs = registry.output_paths();

    let findings = scan_workspace(workspace, &outputs)?;

    if args.json {
        let value = serde_json::json!({
            "generators": registry
                .generators
                .iter()
                .map(|g| serde_json::json!({
                    "key": g.key,
                    "command": g.command,
                    "target": g.target,
                }))
                .collect::<Vec<_>>(),
            "unknown": findings
                .iter()
                .map(|f| serde_json::json!({
                    "project": f.project,
                    "specifier": f.specifier,
                    "resolved": f.resolved,
                    "importers": f.importers,
                }))
                .collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        if !registry.generators.is_empty() {
            println!("\n{}", "Configured generators:".bold());
            for g in &registry.generators {
                let target = g
                    .target
                    .as_deref()
                    .map(|t| format!(" -> {}", t))
                    .unwrap_or_default();
                println!("  {} {}{}", "$".cyan(), g.key, target.dimmed());
            }
        }

        if findings.is_empty() {
            println!("\n{} No unknown dependencies.", "OK".green().bold());
        } else {
            println!("\n{}", "Unknown dependencies:".bold());
            for f in &findings {
                eprintln!(
                    "  {} {} imports {} {}",
                    "?".red().bold(),
                    f.project.cyan(),
                    f.specifier.bold(),
                    format!("({} file(s))", f.importers.len()).dimmed(),
                );
                for importer in &f.importers {
                    eprintln!("      {}", importer.display().to_string().dimmed());
                }
            }
        }
    }

    if !findings.is_empty() {
        bail!("{} unknown dependencies found", findings.len());
    }

    Ok(())
}
