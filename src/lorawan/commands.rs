//! MAC commands (LoRaWAN 1.0.x, CIDs 0x02-0x0A).
//!
//! Split by direction: `DownlinkMacCommand` is what a network server can
//! piggyback toward the device, `UplinkMacCommand` what the device sends
//! or answers back. Parsing an unknown CID aborts the whole FOpts block,
//! since command lengths are CID-dependent.

use crate::error::SimulatorError;

/// Commands received by the device (network -> device).
#[derive(Debug, Clone, PartialEq)]
pub enum DownlinkMacCommand {
    /// Answer to an earlier LinkCheckReq
    LinkCheckAns { margin: u8, gw_cnt: u8 },
    /// ADR: change data rate, TX power and channel mask
    LinkAdrReq {
        data_rate: u8,
        tx_power: u8,
        ch_mask: u16,
        /// Bits 6:4 channel-mask control, bits 3:0 NbTrans
        redundancy: u8,
    },
    DutyCycleReq { max_duty_cycle: u8 },
    RxParamSetupReq {
        rx1_dr_offset: u8,
        rx2_data_rate: u8,
        /// RX2 frequency in Hz
        frequency: u32,
    },
    DevStatusReq,
    NewChannelReq {
        ch_index: u8,
        /// Hz; 0 disables the channel
        frequency: u32,
        min_dr: u8,
        max_dr: u8,
    },
    RxTimingSetupReq { delay_secs: u8 },
    TxParamSetupReq { eirp_dwell: u8 },
    DlChannelReq { ch_index: u8, frequency: u32 },
}

impl DownlinkMacCommand {
    pub fn cid(&self) -> u8 {
        match self {
            DownlinkMacCommand::LinkCheckAns { .. } => 0x02,
            DownlinkMacCommand::LinkAdrReq { .. } => 0x03,
            DownlinkMacCommand::DutyCycleReq { .. } => 0x04,
            DownlinkMacCommand::RxParamSetupReq { .. } => 0x05,
            DownlinkMacCommand::DevStatusReq => 0x06,
            DownlinkMacCommand::NewChannelReq { .. } => 0x07,
            DownlinkMacCommand::RxTimingSetupReq { .. } => 0x08,
            DownlinkMacCommand::TxParamSetupReq { .. } => 0x09,
            DownlinkMacCommand::DlChannelReq { .. } => 0x0A,
        }
    }

    /// Serializes CID + payload (server side; used by canned bridges and
    /// the orchestrator's send-MAC-command operation).
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![self.cid()];
        match self {
            DownlinkMacCommand::LinkCheckAns { margin, gw_cnt } => {
                out.extend_from_slice(&[*margin, *gw_cnt]);
            }
            DownlinkMacCommand::LinkAdrReq {
                data_rate,
                tx_power,
                ch_mask,
                redundancy,
            } => {
                out.push((data_rate << 4) | (tx_power & 0x0F));
                out.extend_from_slice(&ch_mask.to_le_bytes());
                out.push(*redundancy);
            }
            DownlinkMacCommand::DutyCycleReq { max_duty_cycle } => out.push(*max_duty_cycle),
            DownlinkMacCommand::RxParamSetupReq {
                rx1_dr_offset,
                rx2_data_rate,
                frequency,
            } => {
                out.push(((rx1_dr_offset & 0x07) << 4) | (rx2_data_rate & 0x0F));
                out.extend_from_slice(&freq_to_wire(*frequency));
            }
            DownlinkMacCommand::DevStatusReq => {}
            DownlinkMacCommand::NewChannelReq {
                ch_index,
                frequency,
                min_dr,
                max_dr,
            } => {
                out.push(*ch_index);
                out.extend_from_slice(&freq_to_wire(*frequency));
                out.push((max_dr << 4) | (min_dr & 0x0F));
            }
            DownlinkMacCommand::RxTimingSetupReq { delay_secs } => out.push(delay_secs & 0x0F),
            DownlinkMacCommand::TxParamSetupReq { eirp_dwell } => out.push(*eirp_dwell),
            DownlinkMacCommand::DlChannelReq { ch_index, frequency } => {
                out.push(*ch_index);
                out.extend_from_slice(&freq_to_wire(*frequency));
            }
        }
        out
    }

    /// Parses a whole FOpts block (or an FPort-0 FRMPayload).
    pub fn parse_all(bytes: &[u8]) -> Result<Vec<Self>, SimulatorError> {
        let mut commands = Vec::new();
        let mut rest = bytes;
        while let Some((&cid, tail)) = rest.split_first() {
            let need = match cid {
                0x02 => 2,
                0x03 => 4,
                0x04 => 1,
                0x05 => 4,
                0x06 => 0,
                0x07 => 5,
                0x08 => 1,
                0x09 => 1,
                0x0A => 4,
                other => return Err(SimulatorError::UnknownMacCommand(other)),
            };
            if tail.len() < need {
                return Err(SimulatorError::FrameParse(format!(
                    "truncated MAC command 0x{cid:02X}"
                )));
            }
            let (payload, remaining) = tail.split_at(need);
            commands.push(match cid {
                0x02 => DownlinkMacCommand::LinkCheckAns {
                    margin: payload[0],
                    gw_cnt: payload[1],
                },
                0x03 => DownlinkMacCommand::LinkAdrReq {
                    data_rate: payload[0] >> 4,
                    tx_power: payload[0] & 0x0F,
                    ch_mask: u16::from_le_bytes([payload[1], payload[2]]),
                    redundancy: payload[3],
                },
                0x04 => DownlinkMacCommand::DutyCycleReq {
                    max_duty_cycle: payload[0],
                },
                0x05 => DownlinkMacCommand::RxParamSetupReq {
                    rx1_dr_offset: (payload[0] >> 4) & 0x07,
                    rx2_data_rate: payload[0] & 0x0F,
                    frequency: freq_from_wire(&payload[1..4]),
                },
                0x06 => DownlinkMacCommand::DevStatusReq,
                0x07 => DownlinkMacCommand::NewChannelReq {
                    ch_index: payload[0],
                    frequency: freq_from_wire(&payload[1..4]),
                    min_dr: payload[4] & 0x0F,
                    max_dr: payload[4] >> 4,
                },
                0x08 => DownlinkMacCommand::RxTimingSetupReq {
                    delay_secs: payload[0] & 0x0F,
                },
                0x09 => DownlinkMacCommand::TxParamSetupReq {
                    eirp_dwell: payload[0],
                },
                0x0A => DownlinkMacCommand::DlChannelReq {
                    ch_index: payload[0],
                    frequency: freq_from_wire(&payload[1..4]),
                },
                _ => unreachable!(),
            });
            rest = remaining;
        }
        Ok(commands)
    }
}

/// Commands sent by the device (device -> network).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UplinkMacCommand {
    LinkCheckReq,
    LinkAdrAns {
        ch_mask_ack: bool,
        data_rate_ack: bool,
        power_ack: bool,
    },
    DutyCycleAns,
    RxParamSetupAns {
        channel_ack: bool,
        rx2_dr_ack: bool,
        rx1_dr_offset_ack: bool,
    },
    DevStatusAns { battery: u8, margin: u8 },
    NewChannelAns { freq_ack: bool, dr_ack: bool },
    RxTimingSetupAns,
    TxParamSetupAns,
    DlChannelAns { freq_ack: bool, uplink_freq_ack: bool },
}

impl UplinkMacCommand {
    pub fn cid(&self) -> u8 {
        match self {
            UplinkMacCommand::LinkCheckReq => 0x02,
            UplinkMacCommand::LinkAdrAns { .. } => 0x03,
            UplinkMacCommand::DutyCycleAns => 0x04,
            UplinkMacCommand::RxParamSetupAns { .. } => 0x05,
            UplinkMacCommand::DevStatusAns { .. } => 0x06,
            UplinkMacCommand::NewChannelAns { .. } => 0x07,
            UplinkMacCommand::RxTimingSetupAns => 0x08,
            UplinkMacCommand::TxParamSetupAns => 0x09,
            UplinkMacCommand::DlChannelAns { .. } => 0x0A,
        }
    }

    /// Serialized length, CID included.
    pub fn len(&self) -> usize {
        match self {
            UplinkMacCommand::DevStatusAns { .. } => 3,
            UplinkMacCommand::LinkAdrAns { .. }
            | UplinkMacCommand::RxParamSetupAns { .. }
            | UplinkMacCommand::NewChannelAns { .. }
            | UplinkMacCommand::DlChannelAns { .. } => 2,
            _ => 1,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![self.cid()];
        match self {
            UplinkMacCommand::LinkAdrAns {
                ch_mask_ack,
                data_rate_ack,
                power_ack,
            } => {
                let mut status = 0u8;
                if *ch_mask_ack {
                    status |= 0x01;
                }
                if *data_rate_ack {
                    status |= 0x02;
                }
                if *power_ack {
                    status |= 0x04;
                }
                out.push(status);
            }
            UplinkMacCommand::RxParamSetupAns {
                channel_ack,
                rx2_dr_ack,
                rx1_dr_offset_ack,
            } => {
                let mut status = 0u8;
                if *channel_ack {
                    status |= 0x01;
                }
                if *rx2_dr_ack {
                    status |= 0x02;
                }
                if *rx1_dr_offset_ack {
                    status |= 0x04;
                }
                out.push(status);
            }
            UplinkMacCommand::DevStatusAns { battery, margin } => {
                out.push(*battery);
                out.push(margin & 0x3F);
            }
            UplinkMacCommand::NewChannelAns { freq_ack, dr_ack } => {
                let mut status = 0u8;
                if *freq_ack {
                    status |= 0x01;
                }
                if *dr_ack {
                    status |= 0x02;
                }
                out.push(status);
            }
            UplinkMacCommand::DlChannelAns {
                freq_ack,
                uplink_freq_ack,
            } => {
                let mut status = 0u8;
                if *freq_ack {
                    status |= 0x01;
                }
                if *uplink_freq_ack {
                    status |= 0x02;
                }
                out.push(status);
            }
            _ => {}
        }
        out
    }
}

/// 24-bit frequency field: Hz / 100, little-endian.
fn freq_to_wire(freq_hz: u32) -> [u8; 3] {
    let raw = freq_hz / 100;
    let bytes = raw.to_le_bytes();
    [bytes[0], bytes[1], bytes[2]]
}

fn freq_from_wire(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], 0]) * 100
}
