//! Regional parameters: channel plans, data rates, receive-window defaults.
//!
//! Only the parameters the simulator exercises are modeled: uplink channel
//! tables, DR <-> SF/BW mapping, RX1 offset arithmetic and RX2 defaults.
//! Dwell-time and EIRP tables are out of scope.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::SimulatorError;

/// Supported regional channel plans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Region {
    EU868,
    US915,
    AU915,
    AS923,
    IN865,
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Region::EU868 => "EU868",
            Region::US915 => "US915",
            Region::AU915 => "AU915",
            Region::AS923 => "AS923",
            Region::IN865 => "IN865",
        };
        f.write_str(name)
    }
}

impl FromStr for Region {
    type Err = SimulatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "EU868" => Ok(Region::EU868),
            "US915" => Ok(Region::US915),
            "AU915" => Ok(Region::AU915),
            "AS923" => Ok(Region::AS923),
            "IN865" => Ok(Region::IN865),
            other => Err(SimulatorError::Validation(format!("invalid region {other:?}"))),
        }
    }
}

/// Spreading factor / bandwidth pair behind a data-rate index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataRateSpec {
    pub spreading_factor: u8,
    pub bandwidth_khz: u32,
}

impl DataRateSpec {
    /// Packet-forwarder `datr` string, e.g. `SF7BW125`.
    pub fn datr(&self) -> String {
        format!("SF{}BW{}", self.spreading_factor, self.bandwidth_khz)
    }
}

const fn dr(sf: u8, bw: u32) -> DataRateSpec {
    DataRateSpec {
        spreading_factor: sf,
        bandwidth_khz: bw,
    }
}

const EU868_DRS: &[DataRateSpec] = &[
    dr(12, 125),
    dr(11, 125),
    dr(10, 125),
    dr(9, 125),
    dr(8, 125),
    dr(7, 125),
    dr(7, 250),
];

const US915_DRS: &[DataRateSpec] = &[
    dr(10, 125),
    dr(9, 125),
    dr(8, 125),
    dr(7, 125),
    dr(8, 500),
    // 5..7 RFU
    dr(0, 0),
    dr(0, 0),
    dr(0, 0),
    // 8..13 downlink, 500 kHz
    dr(12, 500),
    dr(11, 500),
    dr(10, 500),
    dr(9, 500),
    dr(8, 500),
    dr(7, 500),
];

const AU915_DRS: &[DataRateSpec] = &[
    dr(12, 125),
    dr(11, 125),
    dr(10, 125),
    dr(9, 125),
    dr(8, 125),
    dr(7, 125),
    dr(8, 500),
    dr(0, 0),
    dr(12, 500),
    dr(11, 500),
    dr(10, 500),
    dr(9, 500),
    dr(8, 500),
    dr(7, 500),
];

const AS923_DRS: &[DataRateSpec] = &[
    dr(12, 125),
    dr(11, 125),
    dr(10, 125),
    dr(9, 125),
    dr(8, 125),
    dr(7, 125),
    dr(7, 250),
];

const IN865_DRS: &[DataRateSpec] = &[
    dr(12, 125),
    dr(11, 125),
    dr(10, 125),
    dr(9, 125),
    dr(8, 125),
    dr(7, 125),
];

/// 64 x 125 kHz channels plus the 8-channel 500 kHz bank.
static US915_CHANNELS: Lazy<Vec<Channel>> = Lazy::new(|| {
    let mut channels: Vec<Channel> = (0..64)
        .map(|i| Channel::new(902_300_000 + i * 200_000, 0, 3))
        .collect();
    channels.extend((0..8).map(|i| Channel::new(903_000_000 + i * 1_600_000, 4, 4)));
    channels
});

static AU915_CHANNELS: Lazy<Vec<Channel>> = Lazy::new(|| {
    let mut channels: Vec<Channel> = (0..64)
        .map(|i| Channel::new(915_200_000 + i * 200_000, 0, 5))
        .collect();
    channels.extend((0..8).map(|i| Channel::new(915_900_000 + i * 1_600_000, 6, 6)));
    channels
});

/// An uplink channel in the device's runtime table.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    /// Center frequency in Hz
    pub frequency: u32,
    pub min_dr: u8,
    pub max_dr: u8,
    /// Channel may be used for uplinks
    pub enabled_uplink: bool,
    /// Channel exists in the current plan (LinkADR mask / NewChannelReq)
    pub active: bool,
    /// RX1 frequency override from DlChannelReq; RX1 follows the uplink
    /// frequency when unset
    #[serde(default)]
    pub downlink_frequency: Option<u32>,
}

impl Channel {
    pub fn new(frequency: u32, min_dr: u8, max_dr: u8) -> Self {
        Channel {
            frequency,
            min_dr,
            max_dr,
            enabled_uplink: true,
            active: true,
            downlink_frequency: None,
        }
    }

    /// Frequency a downlink answering an uplink on this channel uses.
    pub fn rx1_frequency(&self) -> u32 {
        self.downlink_frequency.unwrap_or(self.frequency)
    }

    pub fn admits(&self, data_rate: u8) -> bool {
        self.active && self.enabled_uplink && data_rate >= self.min_dr && data_rate <= self.max_dr
    }
}

impl Region {
    /// Data-rate table, indexed by DR.
    pub fn data_rates(&self) -> &'static [DataRateSpec] {
        match self {
            Region::EU868 => EU868_DRS,
            Region::US915 => US915_DRS,
            Region::AU915 => AU915_DRS,
            Region::AS923 => AS923_DRS,
            Region::IN865 => IN865_DRS,
        }
    }

    pub fn data_rate_spec(&self, data_rate: u8) -> Option<DataRateSpec> {
        self.data_rates()
            .get(data_rate as usize)
            .copied()
            .filter(|spec| spec.bandwidth_khz != 0)
    }

    /// Highest uplink data rate of the plan.
    pub fn max_uplink_data_rate(&self) -> u8 {
        match self {
            Region::EU868 | Region::AS923 => 6,
            Region::US915 => 4,
            Region::AU915 => 6,
            Region::IN865 => 5,
        }
    }

    /// Fixed 72-channel plans rotate through 8-channel groups.
    pub fn uses_channel_groups(&self) -> bool {
        matches!(self, Region::US915 | Region::AU915)
    }

    /// Default uplink channel table at device reset.
    pub fn default_channels(&self) -> Vec<Channel> {
        match self {
            Region::EU868 => vec![
                Channel::new(868_100_000, 0, 5),
                Channel::new(868_300_000, 0, 5),
                Channel::new(868_500_000, 0, 5),
            ],
            Region::US915 => US915_CHANNELS.clone(),
            Region::AU915 => AU915_CHANNELS.clone(),
            Region::AS923 => vec![
                Channel::new(923_200_000, 0, 5),
                Channel::new(923_400_000, 0, 5),
            ],
            Region::IN865 => vec![
                Channel::new(865_062_500, 0, 5),
                Channel::new(865_402_500, 0, 5),
                Channel::new(865_985_000, 0, 5),
            ],
        }
    }

    /// RX2 window frequency in Hz.
    pub fn rx2_frequency(&self) -> u32 {
        match self {
            Region::EU868 => 869_525_000,
            Region::US915 | Region::AU915 => 923_300_000,
            Region::AS923 => 923_200_000,
            Region::IN865 => 866_550_000,
        }
    }

    /// RX2 window default data rate.
    pub fn rx2_data_rate(&self) -> u8 {
        match self {
            Region::EU868 => 0,
            Region::US915 | Region::AU915 => 8,
            Region::AS923 | Region::IN865 => 2,
        }
    }

    /// RX1 downlink data rate for a given uplink DR and RX1DROffset.
    pub fn rx1_data_rate(&self, uplink_dr: u8, offset: u8) -> u8 {
        match self {
            Region::EU868 | Region::AS923 | Region::IN865 => uplink_dr.saturating_sub(offset),
            Region::US915 => {
                let dr = (10 + uplink_dr as i16 - offset as i16).clamp(8, 13);
                dr as u8
            }
            Region::AU915 => {
                let dr = (8 + uplink_dr as i16 - offset as i16).clamp(8, 13);
                dr as u8
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_region_names_case_insensitively() {
        assert_eq!(Region::from_str("eu868").unwrap(), Region::EU868);
        assert_eq!(Region::from_str("US915").unwrap(), Region::US915);
        assert!(Region::from_str("MARS").is_err());
    }

    #[test]
    fn eu868_defaults() {
        let channels = Region::EU868.default_channels();
        assert_eq!(channels.len(), 3);
        assert_eq!(channels[0].frequency, 868_100_000);
        assert_eq!(Region::EU868.rx2_frequency(), 869_525_000);
        assert_eq!(Region::EU868.rx2_data_rate(), 0);
        assert_eq!(Region::EU868.data_rate_spec(5).unwrap().datr(), "SF7BW125");
    }

    #[test]
    fn us915_has_72_channels_and_500khz_bank() {
        let channels = Region::US915.default_channels();
        assert_eq!(channels.len(), 72);
        assert_eq!(channels[64].frequency, 903_000_000);
        assert!(channels[64].admits(4));
        assert!(!channels[0].admits(4));
    }

    #[test]
    fn rx1_offset_arithmetic() {
        assert_eq!(Region::EU868.rx1_data_rate(5, 2), 3);
        assert_eq!(Region::EU868.rx1_data_rate(1, 4), 0);
        assert_eq!(Region::US915.rx1_data_rate(3, 0), 13);
        assert_eq!(Region::US915.rx1_data_rate(0, 3), 8);
    }
}
