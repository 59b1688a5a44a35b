// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! Run the broker until interrupted, optionally hot-plugging a device.

use crate::config::Broker;
use crate::error::CliError;
use crate::utils;
use clap::Args as ClapArgs;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::{Duration, Instant};

const TICK: Duration = Duration::from_millis(20);

#[derive(ClapArgs, Debug)]
pub struct Args {
    /// Stop after this many seconds (default: run until Ctrl+C)
    #[arg(short, long)]
    duration: Option<u64>,

    /// Unplug and replug the hot-plug device every N milliseconds
    #[arg(long, value_name = "MS")]
    hotplug_interval: Option<u64>,

    /// Device toggled by --hotplug-interval
    #[arg(long, default_value = "1")]
    hotplug_device: String,
}

pub fn execute(args: Args, json: bool, config: Option<&Path>) -> Result<(), CliError> {
    log::debug!("Serve parameters: {:?}", args);

    if args.hotplug_interval == Some(0) {
        return Err(CliError::InvalidArgs(
            "Hot-plug interval must be positive".to_string(),
        ));
    }

    let broker = Broker::open(config)?;
    let hotplug = match args.hotplug_interval {
        Some(ms) => {
            let (backend, spec) = broker.find_device(&args.hotplug_device).ok_or_else(|| {
                CliError::DeviceNotFound(format!(
                    "No device {} in the broker description",
                    args.hotplug_device
                ))
            })?;
            Some((backend, spec, Duration::from_millis(ms)))
        }
        None => None,
    };

    let term = utils::install_signal_handler()?;
    let deadline = args
        .duration
        .map(|secs| Instant::now() + Duration::from_secs(secs));

    log::info!(
        "Broker running with {} devices (Ctrl+C to stop)...",
        broker.ctx.supervisor().devices().len()
    );

    let mut plugged = true;
    let mut toggles = 0u64;
    let mut next_toggle = hotplug.as_ref().map(|(_, _, every)| Instant::now() + *every);

    while !term.load(Ordering::Relaxed) {
        let now = Instant::now();
        if deadline.is_some_and(|d| now >= d) {
            break;
        }

        if let (Some((backend, spec, every)), Some(due)) = (hotplug.as_ref(), next_toggle) {
            if now >= due {
                if plugged {
                    log::info!("Unplugging device {}", spec.id);
                    backend.unplug(&spec.id);
                } else {
                    log::info!("Plugging device {}", spec.id);
                    backend.plug(spec.to_device());
                }
                plugged = !plugged;
                toggles += 1;
                broker.ctx.flush_events();
                next_toggle = Some(now + *every);
            }
        }

        thread::sleep(TICK);
    }

    if term.load(Ordering::Relaxed) {
        log::info!("Received Ctrl+C, stopping...");
    }
    log::info!("Toggled hot-plug device {} times", toggles);

    broker.ctx.flush_events();
    let sup = broker.ctx.supervisor();
    if json {
        let json_str = serde_json::to_string_pretty(&sup.dump_report())
            .map_err(|e| CliError::General(format!("JSON serialization failed: {}", e)))?;
        println!("{}", json_str);
    } else {
        print!("{}", sup.dump());
    }

    broker.ctx.shutdown();
    Ok(())
}
