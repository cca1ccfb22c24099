use anyhow::Result;
use clap::{Parser, Subcommand};

use dock_cli::commands::{check, serve};

/// Dock - host for hot-deployable packages
#[derive(Parser)]
#[clap(name = "dock", author, version, about)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the HTTP surface and deploy packages on request
    Serve(serve::ServeArgs),

    /// Validate a package layout without loading it
    Check(check::CheckArgs),
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve(args) => serve::execute(args),
        Commands::Check(args) => check::execute(args),
    }
}
