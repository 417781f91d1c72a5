//! Uplink channel selection.
//!
//! Dynamic plans (EU868, AS923, IN865) pick uniformly at random among
//! the active uplink channels admitting the current data rate. Fixed
//! 72-channel plans (US915, AU915) rotate deterministically through
//! 8-channel groups, visiting the 500 kHz bank after group 7.

use rand::Rng;

use crate::lorawan::region::{Channel, Region};

/// Channels per rotation group in fixed plans
const GROUP_SIZE: usize = 8;

/// Index where the 500 kHz bank starts in fixed plans
const BANK_500K: usize = 64;

/// Outcome of a selection: the channel to transmit on, and possibly a
/// lowered data rate when the preferred group cannot serve the current
/// one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selection {
    pub channel: usize,
    pub data_rate: u8,
}

/// Picks the channel for the next uplink.
///
/// `active_channel` is the index used by the previous uplink; dynamic
/// plans ignore it, fixed plans advance from it.
pub fn select_channel(
    region: Region,
    channels: &[Channel],
    active_channel: usize,
    data_rate: u8,
) -> Option<Selection> {
    if region.uses_channel_groups() {
        select_grouped(channels, active_channel, data_rate)
    } else {
        select_random(channels, data_rate)
    }
}

fn select_random(channels: &[Channel], data_rate: u8) -> Option<Selection> {
    let candidates: Vec<usize> = channels
        .iter()
        .enumerate()
        .filter(|(_, ch)| ch.admits(data_rate))
        .map(|(i, _)| i)
        .collect();
    if candidates.is_empty() {
        return None;
    }
    let pick = rand::thread_rng().gen_range(0..candidates.len());
    Some(Selection {
        channel: candidates[pick],
        data_rate,
    })
}

fn select_grouped(channels: &[Channel], active_channel: usize, data_rate: u8) -> Option<Selection> {
    if channels.len() <= BANK_500K {
        // Table was trimmed by LinkADR masks down to a dynamic shape.
        return select_random(channels, data_rate);
    }

    // After the 500 kHz bank (or from a 125 kHz group), advance one group;
    // group 7 hands over to the bank at 64.
    let next_start = if active_channel >= BANK_500K {
        0
    } else {
        let group = active_channel / GROUP_SIZE;
        if group == 7 {
            BANK_500K
        } else {
            (group + 1) * GROUP_SIZE
        }
    };
    let group_end = (next_start + GROUP_SIZE).min(channels.len());
    let group = &channels[next_start..group_end];

    // First enabled channel of the group admitting the current DR.
    if let Some(offset) = group.iter().position(|ch| ch.admits(data_rate)) {
        return Some(Selection {
            channel: next_start + offset,
            data_rate,
        });
    }

    // No channel admits the DR: fall back to the group's ceiling and its
    // first active channel.
    let max_dr = group
        .iter()
        .filter(|ch| ch.active && ch.enabled_uplink)
        .map(|ch| ch.max_dr)
        .max()?;
    let offset = group
        .iter()
        .position(|ch| ch.admits(max_dr))?;
    Some(Selection {
        channel: next_start + offset,
        data_rate: max_dr,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eu868_picks_an_admitting_channel() {
        let channels = Region::EU868.default_channels();
        for _ in 0..32 {
            let sel = select_channel(Region::EU868, &channels, 0, 5).unwrap();
            assert!(channels[sel.channel].admits(5));
            assert_eq!(sel.data_rate, 5);
        }
    }

    #[test]
    fn eu868_with_no_admitting_channel_yields_none() {
        let mut channels = Region::EU868.default_channels();
        for ch in &mut channels {
            ch.enabled_uplink = false;
        }
        assert!(select_channel(Region::EU868, &channels, 0, 5).is_none());
    }

    #[test]
    fn us915_rotates_groups_and_visits_500k_bank() {
        let channels = Region::US915.default_channels();
        // From group 0 the rotation moves to group 1.
        let sel = select_channel(Region::US915, &channels, 3, 0).unwrap();
        assert_eq!(sel.channel, 8);
        // Group 7 hands over to the 500 kHz bank, where DR0 is not
        // admitted; the group ceiling (DR4) applies.
        let sel = select_channel(Region::US915, &channels, 57, 0).unwrap();
        assert_eq!(sel.channel, 64);
        assert_eq!(sel.data_rate, 4);
        // And the bank wraps back to group 0.
        let sel = select_channel(Region::US915, &channels, 64, 0).unwrap();
        assert_eq!(sel.channel, 0);
    }
}
