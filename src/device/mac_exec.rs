//! Inbound MAC command execution.
//!
//! Every command a downlink carries is executed against the device state
//! and answered on the next uplink. LinkADRReq blocks are evaluated as a
//! group: a partial failure refuses the whole block and mutates nothing.
//! RXParamSetupReq acknowledges its three fields independently but
//! commits only when all three are acceptable. The RXParamSetup,
//! RXTimingSetup and DlChannel answers are sticky: they repeat on every
//! uplink until the first class-A downlink clears them.

use std::time::Duration;

use log::{debug, warn};
use rand::Rng;

use crate::device::state::DeviceState;
use crate::lorawan::commands::{DownlinkMacCommand, UplinkMacCommand};
use crate::lorawan::region::{Channel, Region};

/// Result of executing the commands of one downlink.
#[derive(Debug, Default)]
pub struct MacExecution {
    /// Answers consumed by the next uplink
    pub answers: Vec<UplinkMacCommand>,
    /// Answers repeated until a class-A downlink confirms them
    pub sticky: Vec<UplinkMacCommand>,
    /// Human-readable notes for the device event stream
    pub notes: Vec<String>,
}

/// Executes all commands of a downlink in order.
pub fn execute(
    region: Region,
    state: &mut DeviceState,
    battery: u8,
    commands: &[DownlinkMacCommand],
) -> MacExecution {
    let mut out = MacExecution::default();

    // LinkADRReq blocks are grouped and answered once per request, with
    // identical status bytes, after evaluating the whole block.
    let adr_reqs: Vec<&DownlinkMacCommand> = commands
        .iter()
        .filter(|c| matches!(c, DownlinkMacCommand::LinkAdrReq { .. }))
        .collect();
    if !adr_reqs.is_empty() {
        execute_link_adr_block(region, state, &adr_reqs, &mut out);
    }

    for command in commands {
        match command {
            DownlinkMacCommand::LinkAdrReq { .. } => {} // handled above
            DownlinkMacCommand::LinkCheckAns { margin, gw_cnt } => {
                out.notes
                    .push(format!("link check: margin {margin} dB, {gw_cnt} gateway(s)"));
            }
            DownlinkMacCommand::DutyCycleReq { max_duty_cycle } => {
                state.max_duty_cycle = *max_duty_cycle & 0x0F;
                out.answers.push(UplinkMacCommand::DutyCycleAns);
                out.notes
                    .push(format!("duty cycle exponent set to {}", state.max_duty_cycle));
            }
            DownlinkMacCommand::RxParamSetupReq {
                rx1_dr_offset,
                rx2_data_rate,
                frequency,
            } => {
                let offset_ok = *rx1_dr_offset <= 5;
                let dr_ok = region.data_rate_spec(*rx2_data_rate).is_some();
                let freq_ok = *frequency >= 100_000_000;
                if offset_ok && dr_ok && freq_ok {
                    state.rx1_dr_offset = *rx1_dr_offset;
                    state.rx2_data_rate = *rx2_data_rate;
                    state.rx2_frequency = *frequency;
                } else {
                    debug!(
                        "RXParamSetupReq refused: offset_ok={offset_ok} dr_ok={dr_ok} freq_ok={freq_ok}"
                    );
                }
                out.sticky.push(UplinkMacCommand::RxParamSetupAns {
                    channel_ack: freq_ok,
                    rx2_dr_ack: dr_ok,
                    rx1_dr_offset_ack: offset_ok,
                });
            }
            DownlinkMacCommand::DevStatusReq => {
                // Margin of the last received downlink; the propagation
                // model has no SNR, report a plausible value.
                let margin = rand::thread_rng().gen_range(5..=20);
                out.answers.push(UplinkMacCommand::DevStatusAns { battery, margin });
            }
            DownlinkMacCommand::NewChannelReq {
                ch_index,
                frequency,
                min_dr,
                max_dr,
            } => {
                let (freq_ack, dr_ack) =
                    apply_new_channel(region, state, *ch_index, *frequency, *min_dr, *max_dr);
                out.answers
                    .push(UplinkMacCommand::NewChannelAns { freq_ack, dr_ack });
            }
            DownlinkMacCommand::RxTimingSetupReq { delay_secs } => {
                let delay = if *delay_secs == 0 { 1 } else { *delay_secs };
                state.rx1_delay = Duration::from_secs(delay as u64);
                out.sticky.push(UplinkMacCommand::RxTimingSetupAns);
                out.notes.push(format!("RX1 delay set to {delay}s"));
            }
            DownlinkMacCommand::TxParamSetupReq { .. } => {
                out.answers.push(UplinkMacCommand::TxParamSetupAns);
            }
            DownlinkMacCommand::DlChannelReq { ch_index, frequency } => {
                let exists = (*ch_index as usize) < state.channels.len()
                    && state.channels[*ch_index as usize].active;
                let freq_ok = *frequency >= 100_000_000;
                if exists && freq_ok {
                    state.channels[*ch_index as usize].downlink_frequency = Some(*frequency);
                }
                out.sticky.push(UplinkMacCommand::DlChannelAns {
                    freq_ack: freq_ok,
                    uplink_freq_ack: exists,
                });
            }
        }
    }

    out
}

/// Evaluates a LinkADRReq block as a group; state changes only when the
/// whole block is acceptable.
fn execute_link_adr_block(
    region: Region,
    state: &mut DeviceState,
    requests: &[&DownlinkMacCommand],
    out: &mut MacExecution,
) {
    // Work on a copy of the channel enable map.
    let mut enabled: Vec<bool> = state.channels.iter().map(|ch| ch.enabled_uplink).collect();
    let mut requested_dr = state.data_rate;
    let mut requested_power = state.tx_power;
    let mut requested_nb_trans = state.nb_trans;
    let mut ch_mask_ok = true;

    for request in requests {
        let DownlinkMacCommand::LinkAdrReq {
            data_rate,
            tx_power,
            ch_mask,
            redundancy,
        } = request
        else {
            continue;
        };
        let ch_mask_cntl = (redundancy >> 4) & 0x07;
        match ch_mask_cntl {
            0..=4 => {
                let base = ch_mask_cntl as usize * 16;
                for bit in 0..16 {
                    let idx = base + bit;
                    if idx < enabled.len() {
                        enabled[idx] = ch_mask & (1 << bit) != 0;
                    } else if ch_mask & (1 << bit) != 0 {
                        // Enabling a channel that does not exist
                        ch_mask_ok = false;
                    }
                }
            }
            6 => {
                // All 125 kHz channels on; the mask applies to the bank.
                for (idx, slot) in enabled.iter_mut().enumerate() {
                    if idx < 64 {
                        *slot = state.channels[idx].active;
                    } else {
                        *slot = ch_mask & (1 << (idx - 64)) != 0;
                    }
                }
            }
            _ => ch_mask_ok = false,
        }
        // 0x0F means "keep current data rate / power".
        if *data_rate != 0x0F {
            requested_dr = *data_rate;
        }
        if *tx_power != 0x0F {
            requested_power = *tx_power;
        }
        let nb_trans = redundancy & 0x0F;
        requested_nb_trans = if nb_trans == 0 { 1 } else { nb_trans };
    }

    // Mask must leave at least one enabled channel.
    let any_enabled = state
        .channels
        .iter()
        .zip(&enabled)
        .any(|(ch, on)| *on && ch.active);
    ch_mask_ok &= any_enabled;

    let data_rate_ack = requested_dr <= region.max_uplink_data_rate()
        && region.data_rate_spec(requested_dr).is_some()
        && state
            .channels
            .iter()
            .zip(&enabled)
            .any(|(ch, on)| *on && ch.active && requested_dr >= ch.min_dr && requested_dr <= ch.max_dr);
    let power_ack = requested_power <= 7;

    let accepted = ch_mask_ok && data_rate_ack && power_ack;
    if accepted {
        for (channel, on) in state.channels.iter_mut().zip(&enabled) {
            channel.enabled_uplink = *on;
        }
        state.data_rate = requested_dr;
        state.tx_power = requested_power;
        state.nb_trans = requested_nb_trans;
        out.notes.push(format!(
            "ADR applied: DR{requested_dr}, power index {requested_power}, NbTrans {requested_nb_trans}"
        ));
    } else {
        warn!(
            "LinkADRReq block refused: ch_mask_ok={ch_mask_ok} data_rate_ack={data_rate_ack} power_ack={power_ack}"
        );
    }

    // One identical answer per request in the block.
    for _ in requests {
        out.answers.push(UplinkMacCommand::LinkAdrAns {
            ch_mask_ack: ch_mask_ok,
            data_rate_ack,
            power_ack,
        });
    }
}

fn apply_new_channel(
    region: Region,
    state: &mut DeviceState,
    ch_index: u8,
    frequency: u32,
    min_dr: u8,
    max_dr: u8,
) -> (bool, bool) {
    if region.uses_channel_groups() {
        // Fixed plans have an immutable channel table.
        return (false, false);
    }
    let idx = ch_index as usize;
    if frequency == 0 {
        // Disabling an existing channel.
        if let Some(channel) = state.channels.get_mut(idx) {
            channel.active = false;
            channel.enabled_uplink = false;
            return (true, true);
        }
        return (false, false);
    }
    let freq_ok = frequency >= 100_000_000;
    let dr_ok = min_dr <= max_dr && max_dr <= region.max_uplink_data_rate();
    if freq_ok && dr_ok {
        let channel = Channel::new(frequency, min_dr, max_dr);
        if idx < state.channels.len() {
            state.channels[idx] = channel;
        } else if idx == state.channels.len() {
            state.channels.push(channel);
        } else {
            return (false, dr_ok);
        }
    }
    (freq_ok, dr_ok)
}
