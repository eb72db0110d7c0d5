//! Command-line interface definition.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Debug, Parser)]
#[command(name = "ralph", about = "Autonomous agent execution engine for tracked tasks", version)]
pub struct Cli {
    /// Working directory (defaults to the current directory)
    #[arg(long, global = true)]
    pub cwd: Option<PathBuf>,

    /// Enable debug logging to the console
    #[arg(long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the engine against the configured tracker
    Run(RunArgs),
    /// Open (or print) documentation
    Docs(DocsArgs),
}

#[derive(Debug, clap::Args)]
pub struct RunArgs {
    /// Agent plugin id (overrides ralph.toml)
    #[arg(long)]
    pub agent: Option<String>,

    /// Model passed to the agent
    #[arg(long)]
    pub model: Option<String>,

    /// Number of parallel workers (1 = sequential)
    #[arg(long)]
    pub workers: Option<usize>,

    /// Iteration cap; 0 runs until the tracker is complete
    #[arg(long)]
    pub max_iterations: Option<u64>,

    /// Steal a live instance lock
    #[arg(long)]
    pub force: bool,

    /// Never prompt; auto-clean dead locks
    #[arg(long)]
    pub non_interactive: bool,

    /// Reopen completed tasks whose commits are missing from the
    /// integration branch
    #[arg(long)]
    pub reopen_unverified: bool,
}

#[derive(Debug, clap::Args)]
pub struct DocsArgs {
    /// Documentation section to open
    #[arg(value_enum, default_value_t = DocsSection::Readme)]
    pub section: DocsSection,

    /// Print the URL instead of opening a browser
    #[arg(long)]
    pub print: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DocsSection {
    Readme,
    Config,
    Agents,
    Trackers,
    Troubleshooting,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run() {
        let cli = Cli::parse_from(["ralph", "run", "--workers", "3", "--force"]);
        match cli.command {
            Command::Run(args) => {
                assert_eq!(args.workers, Some(3));
                assert!(args.force);
                assert!(!args.non_interactive);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_parse_docs_default_section() {
        let cli = Cli::parse_from(["ralph", "docs", "--print"]);
        match cli.command {
            Command::Docs(args) => {
                assert_eq!(args.section, DocsSection::Readme);
                assert!(args.print);
            }
            _ => panic!("expected docs"),
        }
    }
}
