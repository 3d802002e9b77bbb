mod cli;
mod commands;
mod render;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Commands, Verbosity};
use colored::Colorize;
use ripple_core::workspace::Workspace;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let verbosity = cli.verbosity();

    init_tracing(verbosity);

    // `completion` doesn't require an existing workspace — handle it early
    if let Commands::Completion(args) = cli.command {
        clap_complete::generate(
            args.shell,
            &mut <Cli as clap::CommandFactory>::command(),
            "ripple",
            &mut std::io::stdout(),
        );
        return Ok(());
    }

    // Find and load workspace
    let workspace = match Workspace::find_and_load() {
        Ok(ws) => ws,
        Err(e) => {
            eprintln!("{} Failed to load workspace: {}", "ERROR".red().bold(), e);
            std::process::exit(1);
        }
    };

    // Print any warnings collected during workspace loading
    for warning in &workspace.warnings {
        eprintln!("{} {}", "WARNING:".yellow().bold(), warning);
    }

    if verbosity != Verbosity::Quiet {
        let name = workspace.manifest.name.as_deref().unwrap_or("workspace");
        println!(
            "{} {} ({}) [{} project(s)]",
            "ripple".cyan().bold(),
            name.bold(),
            workspace.root_path.display(),
            workspace.projects.len(),
        );
    }

    let result = match cli.command {
        Commands::Analyze(args) => commands::analyze::run(&workspace, args).await,
        Commands::Build(args) => commands::build::run(workspace, args).await,
        Commands::Completion(_) => unreachable!("completion handled above"),
        Commands::Plan(args) => commands::plan::run(&workspace, args).await,
        Commands::Scan(args) => commands::scan::run(&workspace, args).await,
        Commands::Watch(args) => commands::watch::run(workspace, args).await,
    };

    match result {
        Ok(()) => {
            if verbosity != Verbosity::Quiet {
                println!("\n{}", "SUCCESS".green().bold());
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("\n{} {}", "FAILED".red().bold(), e);
            std::process::exit(1);
        }
    }
}

/// Initialise the global tracing subscriber.
///
/// Level priority: `RIPPLE_LOG` env var, then `--verbose` (debug), default
/// warn so internal diagnostics stay out of normal command output.
fn init_tracing(verbosity: Verbosity) {
    let level = std::env::var("RIPPLE_LOG")
        .ok()
        .and_then(|s| s.parse::<tracing::Level>().ok())
        .unwrap_or(match verbosity {
            Verbosity::Verbose => tracing::Level::DEBUG,
            _ => tracing::Level::WARN,
        });

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}
