mod cli;

use anyhow::Context;
use clap::Parser;
use cli::{Cli, Commands};
use dotenv::dotenv;
use tracing::{debug, error, info};

use downsweep::{app_config, logging, pipeline, policy};

fn main() {
    dotenv().ok();

    let _guard = logging::init_logger();

    let args = Cli::parse();

    let result = match args.command.unwrap_or(Commands::Process) {
        Commands::Process => run_process(),
        Commands::PrintConfig => print_config(),
        Commands::Bench => run_bench(),
    };

    if let Err(err) = result {
        error!("Error: {:#}", err);
        std::process::exit(1);
    }
}

fn run_process() -> anyhow::Result<()> {
    let config = app_config::load_configuration().context("loading configuration")?;
    debug!("config.source_roots: {:?}", config.source_roots);
    debug!("config.destination_root: {:?}", config.destination_root);

    let mut driver = pipeline::FolderLifecycleDriver::new(config);
    let summary = driver.run().context("running sweep")?;

    if summary.retries_pending > 0 {
        info!(
            "{} deletions still pending; they will be retried next run",
            summary.retries_pending
        );
    }
    Ok(())
}

fn print_config() -> anyhow::Result<()> {
    let config = app_config::load_configuration().context("loading configuration")?;
    println!("{:#?}", config);
    Ok(())
}

fn run_bench() -> anyhow::Result<()> {
    let policy = policy::AdaptiveTimeoutPolicy::rebenchmark(policy::default_cache_dir())
        .context("benchmarking environment")?;
    let profile = policy.profile();
    info!(
        "disk tier {:?}: seq {:.0} MB/s, rand {:.0} MB/s, cpu score {:.2}",
        profile.disk_tier, profile.seq_read_mb_s, profile.rand_read_mb_s, profile.cpu_score
    );
    Ok(())
}
