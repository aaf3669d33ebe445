use anyhow::Result;
use clap::Parser;
use gibnn::cli::{run, Cli, Commands};

fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Run(args) => {
            run::run(args)?;
        }
    }

    Ok(())
}
