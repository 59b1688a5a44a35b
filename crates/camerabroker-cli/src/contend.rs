// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! Open one device from two processes in turn and report who holds it.

use crate::config::Broker;
use crate::error::CliError;
use crate::utils::{credentials, CliClient};
use camerabroker::registry::LeaseKey;
use camerabroker::session::SessionProtocol;
use clap::Args as ClapArgs;
use serde::Serialize;
use std::path::Path;

#[derive(ClapArgs, Debug)]
pub struct Args {
    /// Device to open
    #[arg(short, long, default_value = "0")]
    device: String,

    /// PID of the process that opens first
    #[arg(long, default_value_t = 200)]
    first: i32,

    /// PID of the process that opens second
    #[arg(long, default_value_t = 100)]
    second: i32,

    /// Open the first client as a trusted platform process
    #[arg(long)]
    first_trusted: bool,

    /// Open through the legacy protocol
    #[arg(long)]
    legacy: bool,
}

#[derive(Debug, Serialize)]
struct Attempt {
    pid: i32,
    trusted: bool,
    opened: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    disconnected: Option<String>,
}

#[derive(Debug, Serialize)]
struct ContendOutput {
    device: String,
    first: Attempt,
    second: Attempt,
    holder: Option<i32>,
    evicted: bool,
}

pub fn execute(args: Args, json: bool, config: Option<&Path>) -> Result<(), CliError> {
    log::debug!("Executing contend command: {:?}", args);

    if args.first == args.second {
        return Err(CliError::InvalidArgs(format!(
            "First and second PID must differ: {}",
            args.first
        )));
    }
    if args.first <= 0 || args.second <= 0 {
        return Err(CliError::InvalidArgs("PIDs must be positive".to_string()));
    }

    let protocol = if args.legacy {
        SessionProtocol::Legacy
    } else {
        SessionProtocol::Modern
    };
    let broker = Broker::open(config)?;
    let sup = broker.ctx.supervisor();

    // The first open must succeed for the demo to mean anything.
    let first_client = CliClient::new();
    let first_session = sup.connect(
        &args.device,
        credentials(args.first, args.first_trusted),
        protocol,
        first_client.as_callbacks(),
    )?;
    log::info!("PID {} opened device {}", args.first, args.device);

    let second_client = CliClient::new();
    let second = match sup.connect(
        &args.device,
        credentials(args.second, false),
        protocol,
        second_client.as_callbacks(),
    ) {
        Ok(session) => {
            log::info!("PID {} opened device {}", args.second, args.device);
            Ok(session)
        }
        Err(e) if e.is_retryable() => {
            log::info!("PID {} was refused: {}", args.second, e);
            Err(e.to_string())
        }
        Err(e) => return Err(e.into()),
    };

    let holder = sup
        .session(&LeaseKey::online(args.device.as_str()))
        .map(|s| s.pid());
    let output = ContendOutput {
        device: args.device.clone(),
        first: Attempt {
            pid: args.first,
            trusted: args.first_trusted,
            opened: true,
            error: None,
            disconnected: first_client.disconnect_reason(),
        },
        second: Attempt {
            pid: args.second,
            trusted: false,
            opened: second.is_ok(),
            error: second.as_ref().err().cloned(),
            disconnected: second_client.disconnect_reason(),
        },
        holder,
        evicted: first_session.is_disconnected(),
    };

    if json {
        let json_str = serde_json::to_string_pretty(&output)
            .map_err(|e| CliError::General(format!("JSON serialization failed: {}", e)))?;
        println!("{}", json_str);
    } else {
        print_text_output(&output);
    }

    first_session.disconnect();
    if let Ok(session) = second {
        session.disconnect();
    }
    Ok(())
}

fn print_text_output(output: &ContendOutput) {
    println!("Contention on device {}\n", output.device);
    for (label, attempt) in [("First", &output.first), ("Second", &output.second)] {
        let who = if attempt.trusted {
            format!("PID {} (trusted)", attempt.pid)
        } else {
            format!("PID {}", attempt.pid)
        };
        match (&attempt.error, &attempt.disconnected) {
            (Some(error), _) => println!("  {}: {} refused: {}", label, who, error),
            (None, Some(reason)) => println!("  {}: {} opened, then {}", label, who, reason),
            (None, None) => println!("  {}: {} opened", label, who),
        }
    }
    println!();
    match output.holder {
        Some(pid) => println!("Holder: PID {}", pid),
        None => println!("Holder: none"),
    }
    if output.evicted {
        println!("The first client was evicted");
    }
}
