//! Device configuration and runtime state.
//!
//! `DeviceConfig` is the persisted identity of a simulated end-device;
//! `DeviceState` is everything the state machine mutates at runtime,
//! guarded by the device's own mutex.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::RECEIVE_DELAY1;
use crate::lorawan::commands::UplinkMacCommand;
use crate::lorawan::crypto::AesKey;
use crate::lorawan::region::{Channel, Region};
use crate::util::eui::hex_u64;
use crate::util::geo::Location;

/// Operating mode of the protocol state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// OTA join in progress
    Activation,
    Normal,
    /// Repeating an unacknowledged confirmed uplink
    Retransmission,
    /// Draining queued downlinks after an FPending flag
    FPending,
}

/// LoRaWAN device class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceClass {
    A,
    B,
    C,
}

/// How the device obtains a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActivationMode {
    /// Over-the-air activation: join procedure with the AppKey
    Otaa {
        #[serde(with = "hex_u64")]
        join_eui: u64,
        app_key: AesKey,
    },
    /// Pre-keyed session; such devices cannot un-join
    Abp {
        dev_addr: u32,
        nwk_skey: AesKey,
        app_skey: AesKey,
    },
}

/// Persisted device definition (an entry of `devices.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub id: u64,
    pub name: String,
    #[serde(with = "hex_u64")]
    pub dev_eui: u64,
    pub location: Location,
    /// Antenna range in meters; gateways farther than this never hear
    /// the device
    pub range_m: f64,
    pub region: Region,
    pub activation: ActivationMode,
    /// Initial uplink data rate
    #[serde(default)]
    pub data_rate: u8,
    pub uplink_interval_secs: u64,
    #[serde(default)]
    pub supports_class_b: bool,
    #[serde(default)]
    pub supports_class_c: bool,
    #[serde(default)]
    pub adr_enabled: bool,
    /// Static FRMPayload used when no codec is attached
    #[serde(with = "hex::serde")]
    pub payload: Vec<u8>,
    pub fport: u8,
    /// Emit ConfirmedDataUp instead of UnconfirmedDataUp
    #[serde(default)]
    pub confirmed: bool,
    /// Retries for an unacknowledged confirmed uplink
    #[serde(default = "default_nb_retransmission")]
    pub nb_retransmission: u8,
    /// Back-to-back copies of every unconfirmed uplink
    #[serde(default = "default_nb_rep")]
    pub nb_rep: u8,
    /// DevStatusAns battery level: 0 external power, 255 unknown
    #[serde(default = "default_battery")]
    pub battery: u8,
    /// Payload codec attached to this device, if any
    #[serde(default)]
    pub codec_id: Option<i64>,
    /// Included in `run()` when true
    #[serde(default)]
    pub active: bool,
}

fn default_nb_retransmission() -> u8 {
    3
}

fn default_nb_rep() -> u8 {
    1
}

fn default_battery() -> u8 {
    255
}

impl DeviceConfig {
    pub fn uplink_interval(&self) -> Duration {
        Duration::from_secs(self.uplink_interval_secs.max(1))
    }

    pub fn is_otaa(&self) -> bool {
        matches!(self.activation, ActivationMode::Otaa { .. })
    }
}

/// Established session keys and address.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub dev_addr: u32,
    pub nwk_skey: AesKey,
    pub app_skey: AesKey,
}

/// Runtime counters for the ADR back-off (see `device::adr`).
#[derive(Debug, Clone, Copy, Default)]
pub struct AdrCounters {
    pub uplinks_without_downlink: u32,
    pub ack_requested: bool,
}

/// Mutable runtime state behind the device mutex.
#[derive(Debug)]
pub struct DeviceState {
    pub joined: bool,
    pub mode: Mode,
    pub class: DeviceClass,
    pub session: Option<SessionState>,
    pub data_rate: u8,
    pub tx_power: u8,
    /// Index into `channels` of the channel used for the next uplink
    pub active_channel: usize,
    pub channels: Vec<Channel>,
    pub fcnt_up: u32,
    pub fcnt_down: u32,
    pub dev_nonce: u16,
    /// Current location; mutated by `change_location`
    pub location: Location,
    /// Current static payload; mutated by `change_payload`
    pub payload: Vec<u8>,
    pub fport: u8,
    /// One-shot uplinks queued by the control surface
    pub queued_uplinks: Vec<Vec<u8>>,
    /// MAC answers consumed by the next uplink
    pub pending_answers: Vec<UplinkMacCommand>,
    /// MAC answers repeated on every uplink until a class-A downlink
    pub sticky_answers: Vec<UplinkMacCommand>,
    /// A ConfirmedDataDown arrived; ACK the next uplink
    pub ack_pending: bool,
    pub adr: AdrCounters,
    pub rx1_delay: Duration,
    pub rx1_dr_offset: u8,
    pub rx2_frequency: u32,
    pub rx2_data_rate: u8,
    /// NbTrans from the last LinkADRReq redundancy field
    pub nb_trans: u8,
    /// Aggregated duty cycle exponent from DutyCycleReq (recorded only)
    pub max_duty_cycle: u8,
}

impl DeviceState {
    /// Initial state for a configuration: region defaults, no session
    /// unless pre-keyed.
    pub fn initial(config: &DeviceConfig) -> Self {
        let session = match &config.activation {
            ActivationMode::Abp {
                dev_addr,
                nwk_skey,
                app_skey,
            } => Some(SessionState {
                dev_addr: *dev_addr,
                nwk_skey: nwk_skey.clone(),
                app_skey: app_skey.clone(),
            }),
            ActivationMode::Otaa { .. } => None,
        };
        let joined = session.is_some();

        DeviceState {
            joined,
            mode: if joined { Mode::Normal } else { Mode::Activation },
            class: DeviceClass::A,
            session,
            data_rate: config.data_rate.min(config.region.max_uplink_data_rate()),
            tx_power: 0,
            active_channel: 0,
            channels: config.region.default_channels(),
            fcnt_up: 0,
            fcnt_down: 0,
            dev_nonce: 0,
            location: config.location,
            payload: config.payload.clone(),
            fport: config.fport,
            queued_uplinks: Vec::new(),
            pending_answers: Vec::new(),
            sticky_answers: Vec::new(),
            ack_pending: false,
            adr: AdrCounters::default(),
            rx1_delay: RECEIVE_DELAY1,
            rx1_dr_offset: 0,
            rx2_frequency: config.region.rx2_frequency(),
            rx2_data_rate: config.region.rx2_data_rate(),
            nb_trans: 1,
            max_duty_cycle: 0,
        }
    }

    /// Drops the session and returns to activation. Only meaningful for
    /// OTA devices; pre-keyed callers must not invoke this.
    pub fn unjoin(&mut self) {
        self.joined = false;
        self.session = None;
        self.mode = Mode::Activation;
        self.fcnt_up = 0;
        self.fcnt_down = 0;
        self.adr = AdrCounters::default();
        self.pending_answers.clear();
        self.sticky_answers.clear();
        self.ack_pending = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn otaa_config() -> DeviceConfig {
        DeviceConfig {
            id: 1,
            name: "sensor-1".into(),
            dev_eui: 0x0011_2233_4455_6677,
            location: Location::new(48.0, 2.0, 0),
            range_m: 5000.0,
            region: Region::EU868,
            activation: ActivationMode::Otaa {
                join_eui: 0x1,
                app_key: AesKey::new([0x10; 16]),
            },
            data_rate: 0,
            uplink_interval_secs: 10,
            supports_class_b: false,
            supports_class_c: false,
            adr_enabled: true,
            payload: vec![1, 2, 3],
            fport: 1,
            confirmed: false,
            nb_retransmission: 3,
            nb_rep: 1,
            battery: 255,
            codec_id: None,
            active: true,
        }
    }

    #[test]
    fn otaa_starts_unjoined() {
        let state = DeviceState::initial(&otaa_config());
        assert!(!state.joined);
        assert_eq!(state.mode, Mode::Activation);
        assert_eq!(state.channels.len(), 3);
        assert_eq!(state.rx2_frequency, 869_525_000);
    }

    #[test]
    fn abp_starts_joined() {
        let mut config = otaa_config();
        config.activation = ActivationMode::Abp {
            dev_addr: 0x2601_0001,
            nwk_skey: AesKey::new([1; 16]),
            app_skey: AesKey::new([2; 16]),
        };
        let state = DeviceState::initial(&config);
        assert!(state.joined);
        assert_eq!(state.mode, Mode::Normal);
    }

    #[test]
    fn config_serde_round_trips() {
        let config = otaa_config();
        let text = serde_json::to_string(&config).unwrap();
        let parsed: DeviceConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed.dev_eui, config.dev_eui);
        assert_eq!(parsed.payload, config.payload);
        assert!(parsed.is_otaa());
    }
}
