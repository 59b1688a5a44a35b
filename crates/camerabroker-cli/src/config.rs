// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! Broker description file: tunables, virtual backends and the process table.
//!
//! ```json
//! {
//!   "broker": { "max_cost": 100 },
//!   "backends": [
//!     { "name": "virtual", "devices": [ { "id": "0", "cost": 50, "flash": true } ] }
//!   ],
//!   "processes": [ { "pid": 100, "score": 100 } ]
//! }
//! ```

use crate::error::CliError;
use camerabroker::backend::{VirtualBackend, VirtualDevice, VirtualDirectory};
use camerabroker::config::BrokerConfig;
use camerabroker::context::{ArbitrationContext, Collaborators};
use camerabroker::priority::{process_state, StaticProcessTable};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BrokerFile {
    pub broker: BrokerConfig,
    pub backends: Vec<BackendSpec>,
    pub processes: Vec<ProcessSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackendSpec {
    pub name: String,
    /// Devices are only reported through hot-plug events.
    #[serde(default)]
    pub hotplug_only: bool,
    #[serde(default)]
    pub devices: Vec<DeviceSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceSpec {
    pub id: String,
    #[serde(default = "default_cost")]
    pub cost: i32,
    #[serde(default)]
    pub conflicts: Vec<String>,
    #[serde(default)]
    pub flash: bool,
    #[serde(default)]
    pub physical_ids: Vec<String>,
    #[serde(default = "default_mute")]
    pub mute: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProcessSpec {
    pub pid: i32,
    pub score: i32,
    #[serde(default = "default_state")]
    pub state: i32,
}

fn default_cost() -> i32 {
    100
}

fn default_mute() -> bool {
    true
}

fn default_state() -> i32 {
    process_state::TOP
}

impl Default for BrokerFile {
    /// One virtual backend with two devices, a foreground process 100 and a
    /// background process 200.
    fn default() -> Self {
        BrokerFile {
            broker: BrokerConfig::default(),
            backends: vec![BackendSpec {
                name: "virtual".to_string(),
                hotplug_only: false,
                devices: vec![
                    DeviceSpec {
                        id: "0".to_string(),
                        cost: 50,
                        conflicts: Vec::new(),
                        flash: true,
                        physical_ids: Vec::new(),
                        mute: true,
                    },
                    DeviceSpec {
                        id: "1".to_string(),
                        cost: 50,
                        conflicts: Vec::new(),
                        flash: false,
                        physical_ids: vec!["2".to_string(), "3".to_string()],
                        mute: true,
                    },
                ],
            }],
            processes: vec![
                ProcessSpec {
                    pid: 100,
                    score: 100,
                    state: process_state::TOP,
                },
                ProcessSpec {
                    pid: 200,
                    score: 10,
                    state: process_state::BACKGROUND,
                },
            ],
        }
    }
}

impl DeviceSpec {
    pub fn to_device(&self) -> VirtualDevice {
        VirtualDevice::new(self.id.clone())
            .with_cost(self.cost)
            .with_conflicts(self.conflicts.iter().cloned())
            .with_flash(self.flash)
            .with_physical_ids(self.physical_ids.iter().cloned())
            .with_mute_support(self.mute)
    }
}

impl BrokerFile {
    /// Load `path`, or the built-in description when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self, CliError> {
        let Some(path) = path else {
            log::debug!("No config file given, using the built-in broker description");
            return Ok(BrokerFile::default());
        };
        let text = fs::read_to_string(path).map_err(|e| {
            CliError::InvalidArgs(format!("Cannot read config {}: {}", path.display(), e))
        })?;
        let file: BrokerFile = serde_json::from_str(&text).map_err(|e| {
            CliError::InvalidArgs(format!("Invalid config {}: {}", path.display(), e))
        })?;
        file.broker.validate()?;
        log::debug!(
            "Loaded {} with {} backends and {} processes",
            path.display(),
            file.backends.len(),
            file.processes.len()
        );
        Ok(file)
    }
}

/// A running broker over the virtual backends of a [`BrokerFile`].
pub struct Broker {
    pub ctx: ArbitrationContext,
    pub backends: Vec<Arc<VirtualBackend>>,
    pub file: BrokerFile,
}

impl Broker {
    pub fn start(file: BrokerFile) -> Result<Self, CliError> {
        let directory = Arc::new(VirtualDirectory::new());
        let mut backends = Vec::new();
        for spec in &file.backends {
            let backend = if spec.hotplug_only {
                VirtualBackend::hotplug_only(&spec.name)
            } else {
                VirtualBackend::new(&spec.name)
            };
            for device in &spec.devices {
                backend.plug(device.to_device());
            }
            directory.publish(Arc::clone(&backend));
            backends.push(backend);
        }

        let processes = Arc::new(StaticProcessTable::new());
        for p in &file.processes {
            processes.set(p.pid, p.score, p.state);
        }

        let collaborators = Collaborators::permissive(directory).with_process_info(processes);
        let ctx = ArbitrationContext::start(file.broker.clone(), collaborators)?;
        Ok(Broker {
            ctx,
            backends,
            file,
        })
    }

    /// Load `path` and start a broker over it.
    pub fn open(path: Option<&Path>) -> Result<Self, CliError> {
        Broker::start(BrokerFile::load(path)?)
    }

    /// The virtual backend and description of device `id`.
    pub fn find_device(&self, id: &str) -> Option<(Arc<VirtualBackend>, DeviceSpec)> {
        self.file
            .backends
            .iter()
            .zip(self.backends.iter())
            .find_map(|(spec, backend)| {
                spec.devices
                    .iter()
                    .find(|d| d.id == id)
                    .map(|d| (Arc::clone(backend), d.clone()))
            })
    }
}
