//! LoRaWAN Protocol Constants
//!
//! This module defines constants used in the LoRaWAN 1.0.x simulation,
//! together with the Semtech packet-forwarder wire protocol identifiers.

use std::time::Duration;

// ----------------------------------------------------------------------------
// Frame limits (LoRaWAN 1.0.x)
// ----------------------------------------------------------------------------

/// Maximum acceptable forward gap on the downlink frame counter
pub const MAX_FCNT_GAP: u32 = 16_384;

/// Maximum number of MAC commands piggybacked in FOpts
pub const MAX_FOPTS_COMMANDS: usize = 15;

/// Maximum FOpts length in bytes
pub const MAX_FOPTS_LEN: usize = 15;

/// MIC size in bytes
pub const MIC_SIZE: usize = 4;

/// FPort reserved for MAC-only frames
pub const MAC_FPORT: u8 = 0;

// ----------------------------------------------------------------------------
// Receive-window timing
// ----------------------------------------------------------------------------

/// Default RX1 delay after an uplink (RECEIVE_DELAY1)
pub const RECEIVE_DELAY1: Duration = Duration::from_secs(1);

/// RX2 opens one second after RX1 (RECEIVE_DELAY2 = RECEIVE_DELAY1 + 1s)
pub const RECEIVE_DELAY2: Duration = Duration::from_secs(2);

/// Join-accept RX1 delay (JOIN_ACCEPT_DELAY1)
pub const JOIN_ACCEPT_DELAY1: Duration = Duration::from_secs(5);

/// Join-accept RX2 delay (JOIN_ACCEPT_DELAY2)
pub const JOIN_ACCEPT_DELAY2: Duration = Duration::from_secs(6);

/// Width of an open receive window beyond its start delay
pub const RX_WINDOW: Duration = Duration::from_millis(900);

/// Wait between failed join attempts (ACK_TIMEOUT)
pub const ACK_TIMEOUT: Duration = Duration::from_secs(2);

// ----------------------------------------------------------------------------
// ADR back-off
// ----------------------------------------------------------------------------

/// Uplinks without a downlink before ADRACKReq is set (ADR_ACK_LIMIT)
pub const ADR_ACK_LIMIT: u32 = 64;

/// Further uplinks without a downlink before each data-rate decrement (ADR_ACK_DELAY)
pub const ADR_ACK_DELAY: u32 = 32;

// ----------------------------------------------------------------------------
// Packet-forwarder wire protocol (Semtech GWMP v2)
// ----------------------------------------------------------------------------

/// Protocol version byte carried in every datagram
pub const PROTOCOL_VERSION: u8 = 0x02;

/// Gateway -> server: uplink frames and statistics
pub const PKT_PUSH_DATA: u8 = 0x00;

/// Server -> gateway: PUSH_DATA acknowledgement
pub const PKT_PUSH_ACK: u8 = 0x01;

/// Gateway -> server: downlink keepalive / route registration
pub const PKT_PULL_DATA: u8 = 0x02;

/// Server -> gateway: downlink frame to transmit
pub const PKT_PULL_RESP: u8 = 0x03;

/// Server -> gateway: PULL_DATA acknowledgement
pub const PKT_PULL_ACK: u8 = 0x04;

/// Gateway -> server: transmission report for a PULL_RESP
pub const PKT_TX_ACK: u8 = 0x05;

/// GPS epoch (1980-01-06T00:00:00Z) as Unix milliseconds
pub const GPS_EPOCH_UNIX_MS: i64 = 315_964_800_000;

/// Offset added to GPS time in the rxpk `tmms` field, in milliseconds
pub const GPS_TIME_OFFSET_MS: i64 = 18_000;

// ----------------------------------------------------------------------------
// Defaults
// ----------------------------------------------------------------------------

/// Default gateway uplink queue capacity
pub const DEFAULT_UPLINK_BUFFER: usize = 1000;

/// Default forwarder shard count
pub const DEFAULT_FORWARDER_SHARDS: usize = 16;

/// Per-subscriber live event buffer
pub const SUBSCRIBER_BUFFER: usize = 256;

/// Default per-topic event history retention
pub const DEFAULT_HISTORY: usize = 64;
