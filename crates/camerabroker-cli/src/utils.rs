// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

use crate::error::CliError;
use camerabroker::session::{CallerCredentials, ClientCallbacks, DeathLink, DisconnectReason};
use signal_hook::consts::SIGINT;
use signal_hook::flag;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Install signal handler for graceful shutdown on Ctrl+C
///
/// Returns an Arc<AtomicBool> that will be set to true when SIGINT is received.
pub fn install_signal_handler() -> Result<Arc<AtomicBool>, CliError> {
    let term = Arc::new(AtomicBool::new(false));

    flag::register(SIGINT, Arc::clone(&term))
        .map_err(|e| CliError::General(format!("Failed to register signal handler: {}", e)))?;

    log::debug!("Installed SIGINT handler");
    Ok(term)
}

/// Parse an open request in format "DEVICE:PID"
///
/// The device id may itself contain ':'; the PID is after the last one.
///
/// # Examples
/// ```
/// use camerabroker_cli::utils::parse_open_request;
/// assert_eq!(parse_open_request("0:100").unwrap(), ("0".to_string(), 100));
/// ```
pub fn parse_open_request(s: &str) -> Result<(String, i32), CliError> {
    let (device, pid) = s.rsplit_once(':').ok_or_else(|| {
        CliError::InvalidArgs(format!("Invalid open request (expected DEVICE:PID): {}", s))
    })?;
    if device.is_empty() {
        return Err(CliError::InvalidArgs(format!(
            "Missing device id in open request: {}",
            s
        )));
    }
    let pid = pid
        .parse::<i32>()
        .map_err(|_| CliError::InvalidArgs(format!("Invalid PID in open request: {}", s)))?;
    if pid <= 0 {
        return Err(CliError::InvalidArgs(format!("PID must be positive: {}", s)));
    }
    Ok((device.to_string(), pid))
}

/// Credentials the CLI uses for process `pid`.
pub fn credentials(pid: i32, trusted: bool) -> CallerCredentials {
    let uid = 10_000 + pid.unsigned_abs();
    let creds = CallerCredentials::new(pid, uid, format!("cli.client{}", pid));
    if trusted {
        creds.trusted()
    } else {
        creds
    }
}

static NEXT_REMOTE: AtomicU64 = AtomicU64::new(1);

/// In-process client end that records what the broker tells it.
pub struct CliClient {
    remote: u64,
    disconnect: Mutex<Option<String>>,
    link: Mutex<Option<DeathLink>>,
}

impl CliClient {
    pub fn new() -> Arc<Self> {
        Arc::new(CliClient {
            remote: NEXT_REMOTE.fetch_add(1, Ordering::Relaxed),
            disconnect: Mutex::new(None),
            link: Mutex::new(None),
        })
    }

    pub fn as_callbacks(self: &Arc<Self>) -> Arc<dyn ClientCallbacks> {
        self.clone()
    }

    /// Why the broker disconnected this client, if it did.
    pub fn disconnect_reason(&self) -> Option<String> {
        self.disconnect.lock().ok().and_then(|r| r.clone())
    }
}

impl ClientCallbacks for CliClient {
    fn remote_id(&self) -> u64 {
        self.remote
    }

    fn on_disconnected(&self, device_id: &str, reason: &DisconnectReason) {
        log::info!("Client {} lost device {}: {}", self.remote, device_id, reason);
        if let Ok(mut slot) = self.disconnect.lock() {
            slot.get_or_insert_with(|| reason.to_string());
        }
    }

    fn on_device_error(&self, device_id: &str, message: &str) {
        log::warn!("Device {} error: {}", device_id, message);
    }

    fn link_to_death(&self, link: DeathLink) -> bool {
        if let Ok(mut slot) = self.link.lock() {
            *slot = Some(link);
        }
        true
    }

    fn unlink_to_death(&self) {
        if let Ok(mut slot) = self.link.lock() {
            slot.take();
        }
    }
}
