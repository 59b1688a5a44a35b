// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

mod admin;
mod config;
mod contend;
mod devices;
mod dump;
mod error;
mod serve;
mod utils;

use clap::{Parser, Subcommand};
use error::result_to_exit_code;
use std::path::PathBuf;
use std::process::ExitCode;

/// Camera Broker CLI - Device arbitration, hot-plug and admin tool
#[derive(Parser)]
#[command(name = "camerabroker")]
#[command(version)]
#[command(about = "Camera Broker CLI - Device arbitration, hot-plug and admin tool")]
#[command(long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable verbose logging (use RUST_LOG=debug for more)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Output results in JSON format
    #[arg(long, global = true)]
    json: bool,

    /// Broker description file (JSON); defaults to a built-in virtual backend
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List camera devices with status, cost and backend
    Devices(devices::Args),

    /// Open one device from two processes and report who wins
    Contend(contend::Args),

    /// Apply an administrative override (uid state, mute, privacy, rotate-and-crop)
    Admin(admin::Args),

    /// Print the diagnostic dump of the broker
    Dump(dump::Args),

    /// Run the broker until Ctrl+C, optionally hot-plugging a device
    Serve(serve::Args),
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    init_logging(cli.verbose, cli.quiet);

    let config = cli.config.as_deref();
    let result = match cli.command {
        Commands::Devices(args) => devices::execute(args, cli.json, config),
        Commands::Contend(args) => contend::execute(args, cli.json, config),
        Commands::Admin(args) => admin::execute(args, cli.json, config),
        Commands::Dump(args) => dump::execute(args, cli.json, config),
        Commands::Serve(args) => serve::execute(args, cli.json, config),
    };

    result_to_exit_code(result)
}

/// Initialize env_logger based on verbosity flags
fn init_logging(verbose: bool, quiet: bool) {
    let env = env_logger::Env::default();

    let env = if quiet {
        env.default_filter_or("error")
    } else if verbose {
        env.default_filter_or("debug")
    } else {
        env.default_filter_or("info")
    };

    env_logger::Builder::from_env(env)
        .format_timestamp(None)
        .format_target(false)
        .init();

    log::debug!("Logging initialized");
}
