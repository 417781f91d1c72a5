//! # Simulator Configuration
//!
//! Runtime configuration loaded from `simulator.json`: the bridge address
//! the virtual gateways dial, performance tuning for the routing fabric
//! and scheduler, and event-history retention.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_FORWARDER_SHARDS, DEFAULT_HISTORY, DEFAULT_UPLINK_BUFFER};
use crate::error::SimulatorError;

/// Performance tuning for the concurrent runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    /// Number of independent routing-fabric shards
    pub forwarder_shards: usize,
    /// Capacity of each gateway's uplink queue
    pub uplink_buffer_size: usize,
    /// Scheduler worker pool size
    pub worker_count: usize,
    /// Scheduler tick resolution in milliseconds
    pub scheduler_resolution_ms: u64,
    /// Scheduler fan-out queue capacity
    pub work_queue_size: usize,
    /// Drive devices from the shared scheduler instead of one task each.
    /// Preferred for large populations.
    pub use_scheduler: bool,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            forwarder_shards: DEFAULT_FORWARDER_SHARDS,
            uplink_buffer_size: DEFAULT_UPLINK_BUFFER,
            worker_count: 8,
            scheduler_resolution_ms: 1000, // 1 s minimum tick
            work_queue_size: 256,
            use_scheduler: true,
        }
    }
}

impl PerformanceConfig {
    pub fn scheduler_resolution(&self) -> Duration {
        Duration::from_millis(self.scheduler_resolution_ms.max(1))
    }
}

/// Per-topic event history retention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    pub history_per_device: usize,
    pub history_per_gateway: usize,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            history_per_device: DEFAULT_HISTORY,
            history_per_gateway: DEFAULT_HISTORY,
        }
    }
}

/// Top-level simulator configuration (`simulator.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatorConfig {
    /// UDP address of the packet-forwarder bridge, `host:port`
    pub bridge_address: String,
    #[serde(default)]
    pub performance: PerformanceConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            bridge_address: "127.0.0.1:1700".to_string(),
            performance: PerformanceConfig::default(),
            retention: RetentionConfig::default(),
        }
    }
}

impl SimulatorConfig {
    /// Reads the configuration file. Unreadable or malformed content is
    /// fatal at startup.
    pub fn load(path: &Path) -> Result<Self, SimulatorError> {
        let text = fs::read_to_string(path)
            .map_err(|e| SimulatorError::Fatal(format!("read {}: {e}", path.display())))?;
        serde_json::from_str(&text)
            .map_err(|e| SimulatorError::Fatal(format!("parse {}: {e}", path.display())))
    }

    pub fn save(&self, path: &Path) -> Result<(), SimulatorError> {
        let text = serde_json::to_string_pretty(self)?;
        fs::write(path, text)
            .map_err(|e| SimulatorError::Fatal(format!("write {}: {e}", path.display())))?;
        Ok(())
    }
}
