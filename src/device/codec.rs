//! Payload codec capability.
//!
//! Devices can source their FRMPayload from an external codec subsystem
//! (a JavaScript sandbox in the full product). The runtime only needs
//! this capability trait; it is injected per device at setup time and
//! carries no process-wide state. Codec failures are soft: encoding
//! falls back to the device's static payload, decoding is skipped.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::SimulatorError;

/// A message recorded against a codec's per-device state.
#[derive(Debug, Clone)]
pub struct CodecMessage {
    pub fcnt: u32,
    pub fport: u8,
    pub bytes: Vec<u8>,
    pub timestamp: DateTime<Utc>,
}

/// Snapshot of the device the codec may inspect when encoding.
#[derive(Debug, Clone)]
pub struct CodecDeviceView {
    pub dev_eui: u64,
    pub battery: u8,
    pub data_rate: u8,
    pub fcnt_up: u32,
}

/// What the device runtime needs from the codec subsystem.
#[async_trait]
pub trait PayloadCodec: Send + Sync {
    /// Produces the next uplink payload and its FPort.
    async fn encode(
        &self,
        codec_id: i64,
        dev_eui: u64,
        device: &CodecDeviceView,
    ) -> Result<(Vec<u8>, u8), SimulatorError>;

    /// Feeds a received downlink to the codec, for side effects only.
    async fn decode(
        &self,
        codec_id: i64,
        dev_eui: u64,
        bytes: &[u8],
        fport: u8,
        device: &CodecDeviceView,
    ) -> Result<(), SimulatorError>;

    /// Opaque per-device codec state, if any.
    fn get_state(&self, dev_eui: u64) -> Option<String>;

    /// Records an exchanged message against the per-device state.
    fn record_message(&self, dev_eui: u64, message: CodecMessage);
}
