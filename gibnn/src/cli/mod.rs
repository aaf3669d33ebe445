pub mod run;

use clap::{Parser, Subcommand};

pub use run::{PviConfig, RunArgs, Task, Variant};

#[derive(Parser)]
#[command(name = "gibnn")]
#[command(about = "Partitioned variational inference for Bayesian neural networks")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run partitioned VI on a toy dataset
    Run(RunArgs),
}
