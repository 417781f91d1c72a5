//! # Utility Modules
//!
//! This module provides common utility functions and types used throughout
//! the lwnsim crate: the overwriting ring buffer behind event history, the
//! bounded uplink queue owned by every gateway, geographic distance for
//! range checks, and EUI/MAC hex helpers.

pub mod eui;
pub mod geo;
pub mod queue;
pub mod ring;

// Re-export commonly used types and functions
pub use eui::{format_eui, parse_eui};
pub use geo::{distance_meters, Location};
pub use queue::UplinkQueue;
pub use ring::RingBuffer;
