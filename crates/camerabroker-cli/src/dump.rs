// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! Diagnostic dump of a fresh broker, optionally with sessions open.

use crate::config::Broker;
use crate::error::CliError;
use crate::utils::{credentials, parse_open_request, CliClient};
use camerabroker::session::SessionProtocol;
use clap::Args as ClapArgs;
use std::path::Path;

#[derive(ClapArgs, Debug)]
pub struct Args {
    /// Open DEVICE:PID before dumping (repeatable)
    #[arg(long, value_name = "DEVICE:PID")]
    open: Vec<String>,
}

pub fn execute(args: Args, json: bool, config: Option<&Path>) -> Result<(), CliError> {
    log::debug!("Executing dump command: {:?}", args);

    let requests = args
        .open
        .iter()
        .map(|s| parse_open_request(s))
        .collect::<Result<Vec<_>, _>>()?;

    let broker = Broker::open(config)?;
    let sup = broker.ctx.supervisor();

    // Later opens may evict earlier ones; the dump shows whoever is left.
    let mut sessions = Vec::new();
    for (device, pid) in requests {
        let client = CliClient::new();
        match sup.connect(
            &device,
            credentials(pid, false),
            SessionProtocol::Modern,
            client.as_callbacks(),
        ) {
            Ok(session) => sessions.push(session),
            Err(e) if e.is_retryable() => log::info!("PID {} refused {}: {}", pid, device, e),
            Err(e) => return Err(e.into()),
        }
    }

    if json {
        let json_str = serde_json::to_string_pretty(&sup.dump_report())
            .map_err(|e| CliError::General(format!("JSON serialization failed: {}", e)))?;
        println!("{}", json_str);
    } else {
        print!("{}", sup.dump());
    }

    for session in sessions {
        session.disconnect();
    }
    Ok(())
}
