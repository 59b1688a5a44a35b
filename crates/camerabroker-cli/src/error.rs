// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

use std::fmt;
use std::process::ExitCode;

/// CLI-specific error type with exit code mapping
#[derive(Debug)]
pub enum CliError {
    /// Invalid command-line arguments or configuration
    InvalidArgs(String),
    /// Camera device not present or not usable
    DeviceNotFound(String),
    /// Camera held by another client or resource ceiling reached
    Busy(String),
    /// Access refused by policy
    Denied(String),
    /// Operation timed out
    Timeout(String),
    /// General error from the broker
    General(String),
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliError::InvalidArgs(msg) => write!(f, "Invalid arguments: {}", msg),
            CliError::DeviceNotFound(msg) => write!(f, "Device not found: {}", msg),
            CliError::Busy(msg) => write!(f, "Device busy: {}", msg),
            CliError::Denied(msg) => write!(f, "Access denied: {}", msg),
            CliError::Timeout(msg) => write!(f, "Timeout: {}", msg),
            CliError::General(msg) => write!(f, "Error: {}", msg),
        }
    }
}

impl std::error::Error for CliError {}

impl CliError {
    /// Get the exit code for this error
    pub fn exit_code(&self) -> ExitCode {
        match self {
            CliError::InvalidArgs(_) => ExitCode::from(2),
            CliError::DeviceNotFound(_) => ExitCode::from(3),
            CliError::Busy(_) => ExitCode::from(4),
            CliError::Denied(_) => ExitCode::from(5),
            CliError::Timeout(_) => ExitCode::from(6),
            CliError::General(_) => ExitCode::from(1),
        }
    }
}

/// Map camerabroker::Error to CliError with appropriate exit codes
impl From<camerabroker::Error> for CliError {
    fn from(err: camerabroker::Error) -> Self {
        use camerabroker::Error;

        match err {
            Error::IllegalArgument(msg) => CliError::InvalidArgs(msg),
            Error::Json(json_err) => {
                CliError::InvalidArgs(format!("Invalid configuration: {}", json_err))
            }

            Error::Disconnected(msg) => CliError::DeviceNotFound(msg),

            Error::CameraInUse(msg) | Error::MaxCamerasInUse(msg) => CliError::Busy(msg),

            Error::PermissionDenied(msg) | Error::Disabled(msg) => CliError::Denied(msg),

            Error::Timeout(msg) => CliError::Timeout(msg),

            Error::Io(io_err) => match io_err.kind() {
                std::io::ErrorKind::NotFound => {
                    CliError::InvalidArgs(format!("File not found: {}", io_err))
                }
                _ => CliError::General(format!("I/O error: {}", io_err)),
            },

            Error::InvalidOperation(msg) | Error::Internal(msg) | Error::AlreadyExists(msg) => {
                CliError::General(msg)
            }
        }
    }
}

/// Helper function to convert result to exit code
pub fn result_to_exit_code<T>(result: Result<T, CliError>) -> ExitCode {
    match result {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e);
            e.exit_code()
        }
    }
}
