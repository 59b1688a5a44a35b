// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! Device listing with status, cost and owning backend.

use crate::config::Broker;
use crate::error::CliError;
use camerabroker::supervisor::DeviceReport;
use camerabroker::DeviceStatus;
use clap::Args as ClapArgs;
use serde::Serialize;
use std::path::Path;

#[derive(ClapArgs, Debug)]
pub struct Args {
    /// Show only devices that can be opened right now
    #[arg(long)]
    available: bool,

    /// Show only devices of this backend instance (e.g. virtual-1)
    #[arg(short, long)]
    backend: Option<String>,
}

#[derive(Debug, Serialize)]
struct DevicesOutput {
    devices: Vec<DeviceReport>,
    summary: Summary,
}

#[derive(Debug, Serialize)]
struct Summary {
    total_devices: usize,
    present: usize,
    backends: usize,
    max_cost: i32,
}

pub fn execute(args: Args, json: bool, config: Option<&Path>) -> Result<(), CliError> {
    log::debug!("Executing devices command: {:?}", args);

    let broker = Broker::open(config)?;
    let sup = broker.ctx.supervisor();
    let report = sup.dump_report();
    let total_devices = report.devices.len();

    let devices: Vec<DeviceReport> = report
        .devices
        .into_iter()
        .filter(|d| !args.available || d.status == DeviceStatus::Present)
        .filter(|d| match args.backend.as_deref() {
            Some(backend) => d.backend.as_deref() == Some(backend),
            None => true,
        })
        .collect();

    let output = DevicesOutput {
        summary: Summary {
            total_devices,
            present: devices
                .iter()
                .filter(|d| d.status == DeviceStatus::Present)
                .count(),
            backends: report.backends.len(),
            max_cost: sup.max_cost(),
        },
        devices,
    };

    if json {
        let json_str = serde_json::to_string_pretty(&output)
            .map_err(|e| CliError::General(format!("JSON serialization failed: {}", e)))?;
        println!("{}", json_str);
    } else {
        print_text_output(&output);
    }

    Ok(())
}

fn print_text_output(output: &DevicesOutput) {
    println!(
        "Camera Devices ({} devices, {} backends, max cost {})\n",
        output.summary.total_devices, output.summary.backends, output.summary.max_cost
    );

    if output.devices.is_empty() {
        println!("  No devices");
        return;
    }

    for device in &output.devices {
        println!("  {}: {}", device.device_id, device.status);
        println!("    Cost: {}", device.cost);
        if !device.conflicting.is_empty() {
            println!("    Conflicts: {}", device.conflicting.join(", "));
        }
        if let Some(torch) = device.torch {
            println!("    Torch: {}", torch);
        }
        if !device.unavailable_physical_ids.is_empty() {
            println!(
                "    Unavailable physical: {}",
                device.unavailable_physical_ids.join(", ")
            );
        }
        if let Some(ref backend) = device.backend {
            println!("    Backend: {}", backend);
        }
    }
}
