//! # Simulator Error Handling
//!
//! This module defines the SimulatorError enum, which represents the different
//! error types that can occur in the lwnsim crate.

use thiserror::Error;

/// Represents the different error types that can occur in the simulator.
///
/// Local recovery is the default policy: transient and protocol errors are
/// logged and surfaced as broker events, never propagated across components
/// as panics. Only `Fatal` aborts startup.
#[derive(Debug, Error)]
pub enum SimulatorError {
    /// Rejected user input (duplicate name/EUI, invalid region, invalid template).
    #[error("Validation error: {0}")]
    Validation(String),

    /// UDP connect/read/write failure or bridge unreachable. Retried.
    #[error("Transient I/O error: {0}")]
    TransientIo(String),

    /// MIC mismatch on an inbound frame.
    #[error("Invalid MIC for device {0}")]
    InvalidMic(String),

    /// Frame counter outside the acceptable gap.
    #[error("Frame counter gap exceeded: last {last}, received {received}")]
    FrameCounterGap { last: u32, received: u32 },

    /// A PHY payload that does not parse as a LoRaWAN frame.
    #[error("Error parsing LoRaWAN frame: {0}")]
    FrameParse(String),

    /// An unknown MAC command identifier was encountered.
    #[error("Unknown MAC command: 0x{0:02X}")]
    UnknownMacCommand(u8),

    /// Payload codec returned an invalid payload, timed out, or was not found.
    #[error("Codec error: {0}")]
    Codec(String),

    /// An entity lookup by id failed.
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: u64 },

    /// Configuration unreadable at startup. Aborts.
    #[error("Fatal configuration error: {0}")]
    Fatal(String),

    /// A catch-all error for uncategorized cases.
    #[error("Other error: {0}")]
    Other(String),
}

impl From<std::io::Error> for SimulatorError {
    fn from(err: std::io::Error) -> Self {
        SimulatorError::TransientIo(err.to_string())
    }
}

impl From<serde_json::Error> for SimulatorError {
    fn from(err: serde_json::Error) -> Self {
        SimulatorError::Fatal(format!("JSON: {err}"))
    }
}
