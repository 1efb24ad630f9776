mod run;

use crate::run::RunCommand;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    pub cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a topology scenario against a simulated cluster
    Run(RunCommand),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse the command line args
    let cli = Cli::parse();

    // Dispatch commands
    match cli.cmd {
        Commands::Run(run) => {
            let level = if run.verbose {
                tracing::Level::DEBUG
            } else {
                tracing::Level::INFO
            };
            tracing_subscriber::fmt().with_max_level(level).init();
            run.execute().await
        }
    }
}
