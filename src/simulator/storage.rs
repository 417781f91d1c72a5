//! Persisted simulator state.
//!
//! Plain JSON documents in a configured directory: `simulator.json`,
//! `gateways.json`, `devices.json`, `integrations.json`,
//! `templates.json`. Missing integrations/templates are non-fatal;
//! everything else must be present and well-formed at startup.

use std::fs;
use std::path::PathBuf;

use log::warn;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::SimulatorConfig;
use crate::device::state::DeviceConfig;
use crate::error::SimulatorError;
use crate::gateway::GatewayConfig;
use crate::simulator::{DeviceTemplate, Integration};

pub const SIMULATOR_FILE: &str = "simulator.json";
pub const GATEWAYS_FILE: &str = "gateways.json";
pub const DEVICES_FILE: &str = "devices.json";
pub const INTEGRATIONS_FILE: &str = "integrations.json";
pub const TEMPLATES_FILE: &str = "templates.json";

/// Handle to the configuration directory.
pub struct Storage {
    dir: PathBuf,
}

impl Storage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Storage { dir: dir.into() }
    }

    pub fn path(&self, file: &str) -> PathBuf {
        self.dir.join(file)
    }

    fn read_required<T: DeserializeOwned>(&self, file: &str) -> Result<T, SimulatorError> {
        let path = self.path(file);
        let text = fs::read_to_string(&path)
            .map_err(|e| SimulatorError::Fatal(format!("read {}: {e}", path.display())))?;
        serde_json::from_str(&text)
            .map_err(|e| SimulatorError::Fatal(format!("parse {}: {e}", path.display())))
    }

    fn read_optional<T: DeserializeOwned + Default>(&self, file: &str) -> Result<T, SimulatorError> {
        let path = self.path(file);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                warn!("{} missing, starting empty", path.display());
                return Ok(T::default());
            }
            Err(err) => {
                return Err(SimulatorError::Fatal(format!(
                    "read {}: {err}",
                    path.display()
                )))
            }
        };
        serde_json::from_str(&text)
            .map_err(|e| SimulatorError::Fatal(format!("parse {}: {e}", path.display())))
    }

    fn write<T: Serialize>(&self, file: &str, value: &T) -> Result<(), SimulatorError> {
        let path = self.path(file);
        let text = serde_json::to_string_pretty(value)?;
        fs::write(&path, text)
            .map_err(|e| SimulatorError::Fatal(format!("write {}: {e}", path.display())))
    }

    pub fn load_simulator(&self) -> Result<SimulatorConfig, SimulatorError> {
        self.read_required(SIMULATOR_FILE)
    }

    pub fn load_devices(&self) -> Result<Vec<DeviceConfig>, SimulatorError> {
        self.read_required(DEVICES_FILE)
    }

    pub fn load_gateways(&self) -> Result<Vec<GatewayConfig>, SimulatorError> {
        self.read_required(GATEWAYS_FILE)
    }

    pub fn load_integrations(&self) -> Result<Vec<Integration>, SimulatorError> {
        self.read_optional(INTEGRATIONS_FILE)
    }

    pub fn load_templates(&self) -> Result<Vec<DeviceTemplate>, SimulatorError> {
        self.read_optional(TEMPLATES_FILE)
    }

    pub fn save_simulator(&self, config: &SimulatorConfig) -> Result<(), SimulatorError> {
        self.write(SIMULATOR_FILE, config)
    }

    pub fn save_devices(&self, devices: &[DeviceConfig]) -> Result<(), SimulatorError> {
        self.write(DEVICES_FILE, &devices)
    }

    pub fn save_gateways(&self, gateways: &[GatewayConfig]) -> Result<(), SimulatorError> {
        self.write(GATEWAYS_FILE, &gateways)
    }

    pub fn save_integrations(&self, integrations: &[Integration]) -> Result<(), SimulatorError> {
        self.write(INTEGRATIONS_FILE, &integrations)
    }

    pub fn save_templates(&self, templates: &[DeviceTemplate]) -> Result<(), SimulatorError> {
        self.write(TEMPLATES_FILE, &templates)
    }
}
