//! # Observability Events
//!
//! Tagged records describing what the simulated network is doing, fanned
//! out to observers through the [`broker::EventBroker`]. Device events
//! carry the devEUI, gateway events the MAC, system events neither.

pub mod broker;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::util::eui::format_eui;

pub use broker::{EventBroker, SubscriptionHandle};

/// Reserved topic carrying every error-kinded event in addition to its
/// own topic.
pub const ERRORS_TOPIC: &str = "errors";

/// Reserved topic for simulator-wide events.
pub const SYSTEM_TOPIC: &str = "system";

/// Topic name for a device's event stream.
pub fn device_topic(dev_eui: u64) -> String {
    format!("device:{}", format_eui(dev_eui))
}

/// Topic name for a gateway's event stream.
pub fn gateway_topic(mac: u64) -> String {
    format!("gateway:{}", format_eui(mac))
}

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Started,
    Stopped,
    Join,
    Unjoin,
    Uplink,
    Downlink,
    MacCommand,
    ClassSwitch,
    LocationChange,
    Keepalive,
    Error,
}

impl EventKind {
    /// Error-kinded events are mirrored to the `errors` topic.
    pub fn is_error(&self) -> bool {
        matches!(self, EventKind::Error)
    }
}

/// A single observability record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Monotonic identifier, stamped by the broker when empty
    #[serde(default)]
    pub id: String,
    pub time: DateTime<Utc>,
    pub kind: EventKind,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub dev_eui: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub gateway_mac: Option<String>,
    pub message: String,
}

impl Event {
    pub fn device(dev_eui: u64, kind: EventKind, message: impl Into<String>) -> Self {
        Event {
            id: String::new(),
            time: Utc::now(),
            kind,
            dev_eui: Some(format_eui(dev_eui)),
            gateway_mac: None,
            message: message.into(),
        }
    }

    pub fn gateway(mac: u64, kind: EventKind, message: impl Into<String>) -> Self {
        Event {
            id: String::new(),
            time: Utc::now(),
            kind,
            dev_eui: None,
            gateway_mac: Some(format_eui(mac)),
            message: message.into(),
        }
    }

    pub fn system(kind: EventKind, message: impl Into<String>) -> Self {
        Event {
            id: String::new(),
            time: Utc::now(),
            kind,
            dev_eui: None,
            gateway_mac: None,
            message: message.into(),
        }
    }
}
