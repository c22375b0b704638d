use std::{path::PathBuf, process::ExitCode};

use anyhow::{Context, Result};
use clap::Parser;

use rootless_preflight::{
    config::PreflightConfig,
    preflight::Preflight,
    report::{EnvironmentReporter, EXIT_INVALID},
    storage::StorageBackend,
    userns_helper,
};

/// Checks whether an unprivileged container build can run here
#[derive(Debug, Parser)]
#[clap(name = "rootless-preflight", version)]
struct Args {
    /// TOML configuration file
    #[clap(long)]
    config: Option<PathBuf>,
    /// storage driver to check for (vfs, native, overlay)
    #[clap(long)]
    storage_driver: Option<String>,
    /// don't try a live overlay mount
    #[clap(long)]
    skip_mount_test: bool,
    /// print the report as JSON
    #[clap(long)]
    json: bool,
}

fn load_config(args: &Args) -> Result<PreflightConfig> {
    let mut config = match &args.config {
        Some(path) => PreflightConfig::load(path)
            .with_context(|| format!("Loading configuration {}", path.display()))?,
        None => PreflightConfig::default(),
    };
    if let Some(name) = &args.storage_driver {
        config.storage_driver = name
            .parse::<StorageBackend>()
            .context("Parsing --storage-driver")?;
    }
    if args.skip_mount_test {
        config.mount_test = false;
    }
    Ok(config)
}

fn main() -> Result<ExitCode> {
    // must come before anything else: the probe child can't have threads
    userns_helper::init_if_helper();
    env_logger::init();

    let args = Args::parse();
    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e:#}");
            return Ok(ExitCode::from(EXIT_INVALID));
        }
    };

    let report = Preflight::new(config).run();
    let reporter = EnvironmentReporter::new(&report);
    if args.json {
        println!("{}", reporter.to_json()?);
    } else {
        print!("{}", reporter.to_text());
    }
    Ok(reporter.exit_code())
}
