//! # lwnsim - A Rust Crate for LoRaWAN Network Simulation
//!
//! The lwnsim crate emulates large populations of LoRaWAN end-devices and
//! gateways so that a network server (e.g. a packet-forwarder bridge) can
//! be exercised with realistic uplink, downlink, join, MAC-command and
//! class-B/C traffic without physical radios.
//!
//! ## Features
//!
//! - Per-device LoRaWAN 1.0.x state machines: OTA activation, uplink
//!   scheduling, RX-window reception, MAC-command execution,
//!   retransmission and class switching
//! - Per-gateway packet-forwarder loops speaking the Semtech UDP protocol
//! - A sharded routing fabric computing range-based visibility between
//!   devices and gateways
//! - A tick-wheel scheduler driving thousands of device wakeups from a
//!   bounded worker pool
//! - A pub/sub event broker with per-topic history for observers
//! - Support for logging and error handling
//!
//! ## Usage
//!
//! ```rust,no_run
//! use lwnsim::simulator::{Simulator, Storage};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), lwnsim::SimulatorError> {
//!     lwnsim::init_logger();
//!     let storage = Storage::new("./config");
//!     let simulator = Simulator::from_storage(&storage).await?;
//!     simulator.run().await?;
//!     tokio::signal::ctrl_c().await.ok();
//!     simulator.stop().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod constants;
pub mod device;
pub mod error;
pub mod event;
pub mod forwarder;
pub mod gateway;
pub mod logging;
pub mod lorawan;
pub mod scheduler;
pub mod simulator;
pub mod util;

pub use crate::error::SimulatorError;
pub use crate::logging::{init_logger, log_info};

// Core runtime types
pub use config::{PerformanceConfig, RetentionConfig, SimulatorConfig};
pub use device::state::{ActivationMode, DeviceClass, DeviceConfig};
pub use device::Device;
pub use event::{Event, EventBroker, EventKind, SubscriptionHandle};
pub use forwarder::{Forwarder, RadioFrame};
pub use gateway::{Gateway, GatewayConfig, GatewayKind};
pub use scheduler::{JobExecutor, TickWheel};
pub use simulator::{DeviceTemplate, Integration, Simulator, Storage};
pub use util::geo::Location;

// Protocol layer
pub use lorawan::crypto::AesKey;
pub use lorawan::region::Region;
