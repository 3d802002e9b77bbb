use clap::{Args, Parser, Subcommand};
use clap_complete::Shell;

use crate::commands::{
    analyze::AnalyzeArgs, build::BuildArgs, plan::PlanArgs, scan::ScanArgs, watch::WatchArgs,
};

/// ripple: a workspace-aware build orchestrator for JS/TS monorepos
///
/// Derives a dependency graph from workspace manifests, plans affected
/// builds into parallel waves, and rebuilds incrementally on file change.
#[derive(Parser, Debug)]
#[command(name = "ripple", version, about, long_about = None)]
pub struct Cli {
    /// Increase output verbosity (show debug info)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress non-essential output
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Verbosity level resolved from --verbose / --quiet flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verbosity {
    /// --quiet: only errors and essential output
    Quiet,
    /// default: normal output
    Normal,
    /// --verbose: extra debug info
    Verbose,
}

impl Cli {
    /// Resolve the verbosity level from CLI flags
    pub fn verbosity(&self) -> Verbosity {
        match (self.quiet, self.verbose) {
            (true, _) => Verbosity::Quiet,
            (_, true) => Verbosity::Verbose,
            _ => Verbosity::Normal,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print the dependency graph and detect cycles
    Analyze(AnalyzeArgs),

    /// Run source generators, then build affected projects wave by wave
    Build(BuildArgs),

    /// Generate shell completion scripts
    Completion(CompletionArgs),

    /// Compute the affected set and wave plan for a change set
    Plan(PlanArgs),

    /// Report unresolved relative imports across project sources
    Scan(ScanArgs),

    /// Pre-build dev dependencies, start dev servers, and rebuild on change
    Watch(WatchArgs),
}

/// Arguments for the `completion` command
#[derive(Args, Debug)]
pub struct CompletionArgs {
    /// The shell to generate completions for
    #[arg(value_enum)]
    pub shell: Shell,
}
