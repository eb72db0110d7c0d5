//! ralph - autonomous agent execution engine

use clap::Parser;

mod cli;
mod commands;
mod logging;

use cli::{Cli, Command};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let cwd = match cli
        .cwd
        .clone()
        .map(Ok)
        .unwrap_or_else(std::env::current_dir)
    {
        Ok(cwd) => cwd,
        Err(e) => {
            eprintln!("Error: cannot resolve working directory: {e}");
            std::process::exit(1);
        }
    };

    let code = match cli.command {
        Command::Run(args) => commands::run::run(cwd, cli.debug, args).await,
        Command::Docs(args) => commands::docs::docs(&cwd, &args),
    };
    std::process::exit(code);
}
