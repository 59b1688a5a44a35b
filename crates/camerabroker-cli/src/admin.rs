// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! Administrative overrides run against a fresh broker.

use crate::config::Broker;
use crate::error::CliError;
use crate::utils::{credentials, parse_open_request, CliClient};
use camerabroker::session::{Session, SessionProtocol};
use camerabroker::supervisor::ConnectionSupervisor;
use clap::{Args as ClapArgs, Subcommand, ValueEnum};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

#[derive(ClapArgs, Debug)]
pub struct Args {
    /// Open DEVICE:PID before applying the command (repeatable)
    #[arg(long, value_name = "DEVICE:PID")]
    open: Vec<String>,

    #[command(subcommand)]
    command: AdminCommand,
}

#[derive(Subcommand, Debug)]
enum AdminCommand {
    /// Query or override the cached activity state of a uid
    UidState {
        #[command(subcommand)]
        action: UidAction,
    },

    /// Query or set the rotate-and-crop override (4 = none)
    RotateAndCrop {
        #[command(subcommand)]
        action: RotateAction,
    },

    /// Mute or unmute every camera that supports it
    CameraMute {
        #[arg(value_enum)]
        state: Switch,
    },

    /// Enable or disable sensor privacy
    SensorPrivacy {
        #[arg(value_enum)]
        state: Switch,
    },
}

#[derive(Subcommand, Debug)]
enum UidAction {
    /// Print the cached state of UID
    Get { uid: u32 },
    /// Force UID active or idle
    Set {
        uid: u32,
        #[arg(value_enum)]
        state: UidStateArg,
    },
    /// Drop the override of UID
    Reset { uid: u32 },
}

#[derive(Subcommand, Debug)]
enum RotateAction {
    /// Print the current override
    Get,
    /// Set the override, 0 to 4
    Set { value: u8 },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum UidStateArg {
    Active,
    Idle,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Switch {
    On,
    Off,
}

#[derive(Debug, Serialize)]
struct AdminOutput {
    setting: String,
    value: serde_json::Value,
    /// Sessions still open after the command, as "DEVICE:PID".
    open_sessions: Vec<String>,
    /// Sessions the command closed, with the reason.
    closed_sessions: Vec<ClosedSession>,
}

#[derive(Debug, Serialize)]
struct ClosedSession {
    session: String,
    reason: String,
}

pub fn execute(args: Args, json: bool, config: Option<&Path>) -> Result<(), CliError> {
    log::debug!("Executing admin command: {:?}", args);

    let requests = args
        .open
        .iter()
        .map(|s| parse_open_request(s))
        .collect::<Result<Vec<_>, _>>()?;

    let broker = Broker::open(config)?;
    let sup = broker.ctx.supervisor();
    let mut sessions: Vec<(String, Arc<Session>, Arc<CliClient>)> = Vec::new();
    for (device, pid) in requests {
        let client = CliClient::new();
        let session = sup.connect(
            &device,
            credentials(pid, false),
            SessionProtocol::Modern,
            client.as_callbacks(),
        )?;
        sessions.push((format!("{}:{}", device, pid), session, client));
    }

    let (setting, value) = apply(sup, args.command)?;

    let mut output = AdminOutput {
        setting,
        value,
        open_sessions: Vec::new(),
        closed_sessions: Vec::new(),
    };
    for (label, session, client) in &sessions {
        if session.is_disconnected() {
            output.closed_sessions.push(ClosedSession {
                session: label.clone(),
                reason: client
                    .disconnect_reason()
                    .unwrap_or_else(|| "closed".to_string()),
            });
        } else {
            output.open_sessions.push(label.clone());
        }
    }

    if json {
        let json_str = serde_json::to_string_pretty(&output)
            .map_err(|e| CliError::General(format!("JSON serialization failed: {}", e)))?;
        println!("{}", json_str);
    } else {
        println!("{}: {}", output.setting, display_value(&output.value));
        for closed in &output.closed_sessions {
            println!("  Closed {}: {}", closed.session, closed.reason);
        }
        for open in &output.open_sessions {
            println!("  Open {}", open);
        }
    }

    for (_, session, _) in sessions {
        session.disconnect();
    }
    Ok(())
}

fn apply(
    sup: &ConnectionSupervisor,
    command: AdminCommand,
) -> Result<(String, serde_json::Value), CliError> {
    match command {
        AdminCommand::UidState { action } => {
            let uid = match action {
                UidAction::Get { uid } => uid,
                UidAction::Set { uid, state } => {
                    sup.set_uid_state(uid, state == UidStateArg::Active);
                    uid
                }
                UidAction::Reset { uid } => {
                    sup.reset_uid_state(uid);
                    uid
                }
            };
            Ok((
                format!("uid {} state", uid),
                sup.uid_state(uid).as_str().into(),
            ))
        }
        AdminCommand::RotateAndCrop { action } => {
            if let RotateAction::Set { value } = action {
                sup.set_rotate_and_crop_override(value)?;
            }
            Ok((
                "rotate-and-crop".to_string(),
                sup.rotate_and_crop_override().into(),
            ))
        }
        AdminCommand::CameraMute { state } => {
            sup.set_camera_mute(state == Switch::On);
            Ok(("camera mute".to_string(), sup.camera_mute().into()))
        }
        AdminCommand::SensorPrivacy { state } => {
            sup.set_sensor_privacy(state == Switch::On);
            Ok(("sensor privacy".to_string(), sup.sensor_privacy().into()))
        }
    }
}

fn display_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Bool(true) => "on".to_string(),
        serde_json::Value::Bool(false) => "off".to_string(),
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
