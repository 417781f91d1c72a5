//! Adaptive Data Rate back-off
//!
//! Device-side half of the ADR procedure: while the network stays
//! silent, first request an acknowledgement (ADRACKReq), then step the
//! data rate down toward the most robust setting, and finally give up
//! the session. Any downlink resets the counters.

use serde::{Deserialize, Serialize};

use crate::constants::{ADR_ACK_DELAY, ADR_ACK_LIMIT};
use crate::device::state::AdrCounters;

/// ADR back-off parameters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AdrConfig {
    /// Uplinks without a downlink before ADRACKReq is raised
    pub ack_limit: u32,

    /// Further uplinks between successive data-rate decrements
    pub ack_delay: u32,
}

impl Default for AdrConfig {
    fn default() -> Self {
        Self {
            ack_limit: ADR_ACK_LIMIT,
            ack_delay: ADR_ACK_DELAY,
        }
    }
}

/// What the state machine must do after recording an uplink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdrAction {
    /// Keep going
    None,
    /// Set ADRACKReq on subsequent uplinks
    RequestAck,
    /// Decrement the data rate one step
    StepDown,
    /// Data rate exhausted; the device needs a fresh join
    Rejoin,
}

/// Evaluates the counters after one more downlink-less uplink.
///
/// `at_lowest_dr` tells whether a further step-down is possible.
pub fn record_uplink(
    config: &AdrConfig,
    counters: &mut AdrCounters,
    at_lowest_dr: bool,
) -> AdrAction {
    counters.uplinks_without_downlink += 1;
    let n = counters.uplinks_without_downlink;

    if n < config.ack_limit {
        return AdrAction::None;
    }
    if !counters.ack_requested {
        counters.ack_requested = true;
        return AdrAction::RequestAck;
    }
    // Past the limit: one step every ack_delay uplinks.
    if (n - config.ack_limit) % config.ack_delay == 0 {
        if at_lowest_dr {
            return AdrAction::Rejoin;
        }
        return AdrAction::StepDown;
    }
    AdrAction::None
}

/// A downlink proves the network hears us; clear the back-off.
pub fn record_downlink(counters: &mut AdrCounters) {
    counters.uplinks_without_downlink = 0;
    counters.ack_requested = false;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ack_requested_at_limit() {
        let config = AdrConfig {
            ack_limit: 3,
            ack_delay: 2,
        };
        let mut counters = AdrCounters::default();
        assert_eq!(record_uplink(&config, &mut counters, false), AdrAction::None);
        assert_eq!(record_uplink(&config, &mut counters, false), AdrAction::None);
        assert_eq!(
            record_uplink(&config, &mut counters, false),
            AdrAction::RequestAck
        );
        assert!(counters.ack_requested);
    }

    #[test]
    fn steps_down_every_delay_then_rejoins() {
        let config = AdrConfig {
            ack_limit: 2,
            ack_delay: 2,
        };
        let mut counters = AdrCounters::default();
        record_uplink(&config, &mut counters, false); // 1
        record_uplink(&config, &mut counters, false); // 2: RequestAck
        assert_eq!(record_uplink(&config, &mut counters, false), AdrAction::None); // 3
        assert_eq!(
            record_uplink(&config, &mut counters, false),
            AdrAction::StepDown
        ); // 4
        assert_eq!(record_uplink(&config, &mut counters, false), AdrAction::None); // 5
        assert_eq!(
            record_uplink(&config, &mut counters, true),
            AdrAction::Rejoin
        ); // 6, lowest DR
    }

    #[test]
    fn downlink_resets() {
        let config = AdrConfig::default();
        let mut counters = AdrCounters {
            uplinks_without_downlink: 100,
            ack_requested: true,
        };
        record_downlink(&mut counters);
        assert_eq!(counters.uplinks_without_downlink, 0);
        assert!(!counters.ack_requested);
    }
}
