use clap::{Parser, Subcommand};

#[derive(Debug, Parser)] // requires `derive` feature
#[command(name = "downsweep")]
#[command(about = "Sweeps messy download folders into a clean library", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the full sweep over the configured source roots
    Process,
    /// Print the effective configuration
    PrintConfig,
    /// Re-run the environment benchmark and refresh the cached profile
    Bench,
}
