//! # Routing Fabric
//!
//! The radio-propagation model between devices and gateways: a sharded
//! many-to-many binding derived from geographic range. Uplinks fan out
//! onto the queue of every gateway within the emitting device's antenna
//! range; downlinks fan out to every device with an open receive slot on
//! the (frequency, gateway) pair.
//!
//! Sharding by devEUI is the contention-reduction mechanism: device-local
//! operations touch exactly one shard lock. Gateway membership is global
//! (a gateway interacts with devices in every shard) and lives under its
//! own registry lock, acquired before any shard lock. Cross-shard
//! operations visit shards one at a time; two shard locks are never held
//! simultaneously.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use chrono::Utc;
use log::debug;

use crate::constants::{GPS_EPOCH_UNIX_MS, GPS_TIME_OFFSET_MS};
use crate::device::slot::DownlinkSlot;
use crate::lorawan::phy::PhyPayload;
use crate::util::geo::{distance_meters, Location};
use crate::util::queue::UplinkQueue;

/// An uplink radio frame in flight between a device and the gateways
/// that can hear it.
#[derive(Debug, Clone)]
pub struct RadioFrame {
    /// Uplink channel index on the emitting device
    pub channel: usize,
    /// Center frequency in Hz
    pub frequency: u32,
    pub modulation: String,
    /// Packet-forwarder data-rate string, e.g. `SF7BW125`
    pub data_rate: String,
    pub code_rate: String,
    /// Raw PHY payload bytes; cheap to clone across the gateway fan-out
    pub payload: Bytes,
    /// Wall-clock reception time, stamped by the fabric
    pub received_at: chrono::DateTime<Utc>,
    /// Concentrator microsecond counter
    pub tmst: u32,
    /// GPS time of reception in milliseconds
    pub tmms: i64,
}

impl RadioFrame {
    pub fn size(&self) -> usize {
        self.payload.len()
    }
}

/// Per-device membership record.
struct DeviceEntry {
    location: Location,
    range_m: f64,
}

/// One shard of device-local routing state.
#[derive(Default)]
struct Shard {
    /// devEUI -> membership
    devices: HashMap<u64, DeviceEntry>,
    /// devEUI -> gateway MAC -> that gateway's uplink queue
    dev_to_gw: HashMap<u64, HashMap<u64, Arc<UplinkQueue<RadioFrame>>>>,
    /// frequency -> gateway MAC -> devEUI -> open delivery slot
    gw_to_dev: HashMap<u32, HashMap<u64, HashMap<u64, Arc<DownlinkSlot>>>>,
}

/// Cross-shard gateway membership.
struct GatewayEntry {
    queue: Arc<UplinkQueue<RadioFrame>>,
    location: Location,
}

/// The sharded routing fabric.
pub struct Forwarder {
    shards: Vec<Mutex<Shard>>,
    gateways: Mutex<HashMap<u64, GatewayEntry>>,
}

impl Forwarder {
    pub fn new(shard_count: usize) -> Self {
        let shard_count = shard_count.max(1);
        Forwarder {
            shards: (0..shard_count).map(|_| Mutex::new(Shard::default())).collect(),
            gateways: Mutex::new(HashMap::new()),
        }
    }

    /// Stable shard index for a devEUI (Fibonacci multiplicative hash).
    pub fn shard_index(&self, dev_eui: u64) -> usize {
        let mixed = dev_eui.wrapping_mul(0x9E37_79B9_7F4A_7C15);
        (mixed >> 32) as usize % self.shards.len()
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    fn shard(&self, dev_eui: u64) -> &Mutex<Shard> {
        &self.shards[self.shard_index(dev_eui)]
    }

    /// Inserts or re-links a device: for every known gateway within the
    /// device's range a (device, gateway) uplink binding is created.
    pub fn add_device(&self, dev_eui: u64, location: Location, range_m: f64) {
        // Registry lock first, then the single shard lock.
        let gateways = self.gateways.lock().expect("gateway registry poisoned");
        let mut shard = self.shard(dev_eui).lock().expect("shard poisoned");

        let links: HashMap<u64, Arc<UplinkQueue<RadioFrame>>> = gateways
            .iter()
            .filter(|(_, gw)| distance_meters(&location, &gw.location) <= range_m)
            .map(|(mac, gw)| (*mac, gw.queue.clone()))
            .collect();

        shard.devices.insert(dev_eui, DeviceEntry { location, range_m });
        shard.dev_to_gw.insert(dev_eui, links);
    }

    /// Same as [`add_device`]: idempotent re-link after a location or
    /// range mutation.
    pub fn update_device(&self, dev_eui: u64, location: Location, range_m: f64) {
        self.add_device(dev_eui, location, range_m);
    }

    /// Removes a device and all of its bindings.
    pub fn delete_device(&self, dev_eui: u64) {
        let mut shard = self.shard(dev_eui).lock().expect("shard poisoned");
        shard.devices.remove(&dev_eui);
        shard.dev_to_gw.remove(&dev_eui);
        for by_gw in shard.gw_to_dev.values_mut() {
            for slots in by_gw.values_mut() {
                slots.remove(&dev_eui);
            }
        }
    }

    /// Registers a gateway and links it to every in-range device across
    /// all shards.
    pub fn add_gateway(&self, mac: u64, queue: Arc<UplinkQueue<RadioFrame>>, location: Location) {
        {
            let mut gateways = self.gateways.lock().expect("gateway registry poisoned");
            gateways.insert(
                mac,
                GatewayEntry {
                    queue: queue.clone(),
                    location,
                },
            );
        }
        // Shard by shard; never two shard locks at once.
        for shard in &self.shards {
            let mut shard = shard.lock().expect("shard poisoned");
            let in_range: Vec<u64> = shard
                .devices
                .iter()
                .filter(|(_, d)| distance_meters(&d.location, &location) <= d.range_m)
                .map(|(eui, _)| *eui)
                .collect();
            for eui in in_range {
                shard
                    .dev_to_gw
                    .entry(eui)
                    .or_default()
                    .insert(mac, queue.clone());
            }
        }
    }

    /// Removes a gateway, every uplink link and every downlink
    /// registration that references it.
    pub fn delete_gateway(&self, mac: u64) {
        {
            let mut gateways = self.gateways.lock().expect("gateway registry poisoned");
            gateways.remove(&mac);
        }
        for shard in &self.shards {
            let mut shard = shard.lock().expect("shard poisoned");
            for links in shard.dev_to_gw.values_mut() {
                links.remove(&mac);
            }
            for by_gw in shard.gw_to_dev.values_mut() {
                by_gw.remove(&mac);
            }
        }
    }

    /// True when an uplink binding exists between the pair.
    pub fn linked(&self, dev_eui: u64, mac: u64) -> bool {
        let shard = self.shard(dev_eui).lock().expect("shard poisoned");
        shard
            .dev_to_gw
            .get(&dev_eui)
            .map(|links| links.contains_key(&mac))
            .unwrap_or(false)
    }

    /// Opens `slot` and records it for every gateway currently bound to
    /// the device, keyed by `frequency`. Called when a device opens a
    /// receive window.
    pub fn register(&self, frequency: u32, dev_eui: u64, slot: Arc<DownlinkSlot>) {
        slot.open();
        let mut shard = self.shard(dev_eui).lock().expect("shard poisoned");
        let macs: Vec<u64> = shard
            .dev_to_gw
            .get(&dev_eui)
            .map(|links| links.keys().copied().collect())
            .unwrap_or_default();
        let by_freq = shard.gw_to_dev.entry(frequency).or_default();
        for mac in macs {
            by_freq.entry(mac).or_default().insert(dev_eui, slot.clone());
        }
    }

    /// Closes and removes every slot the device registered at `frequency`.
    /// After this returns, no delivery through those registrations can
    /// succeed.
    pub fn unregister(&self, frequency: u32, dev_eui: u64) {
        let mut shard = self.shard(dev_eui).lock().expect("shard poisoned");
        if let Some(by_gw) = shard.gw_to_dev.get_mut(&frequency) {
            for slots in by_gw.values_mut() {
                if let Some(slot) = slots.remove(&dev_eui) {
                    slot.close();
                }
            }
            by_gw.retain(|_, slots| !slots.is_empty());
        }
    }

    /// Fans an uplink frame out to every gateway bound to the device,
    /// stamping reception timestamps on the way.
    pub fn uplink(&self, mut frame: RadioFrame, dev_eui: u64) {
        let now = Utc::now();
        frame.received_at = now;
        frame.tmst = (now.timestamp_micros() & 0xFFFF_FFFF) as u32;
        frame.tmms = now.timestamp_millis() - GPS_EPOCH_UNIX_MS + GPS_TIME_OFFSET_MS;

        let queues: Vec<Arc<UplinkQueue<RadioFrame>>> = {
            let shard = self.shard(dev_eui).lock().expect("shard poisoned");
            shard
                .dev_to_gw
                .get(&dev_eui)
                .map(|links| links.values().cloned().collect())
                .unwrap_or_default()
        };
        if queues.is_empty() {
            debug!("uplink from {dev_eui:016x}: no gateway in range");
        }
        for queue in queues {
            queue.push(frame.clone());
        }
    }

    /// Delivers a downlink PHY payload through a gateway: every device
    /// with an open slot on `(frequency, mac)` receives a push. Returns
    /// true when at least one slot accepted.
    pub fn downlink(&self, phy: &PhyPayload, frequency: u32, mac: u64) -> bool {
        let mut delivered = false;
        for shard in &self.shards {
            let slots: Vec<Arc<DownlinkSlot>> = {
                let shard = shard.lock().expect("shard poisoned");
                shard
                    .gw_to_dev
                    .get(&frequency)
                    .and_then(|by_gw| by_gw.get(&mac))
                    .map(|slots| slots.values().cloned().collect())
                    .unwrap_or_default()
            };
            for slot in slots {
                if slot.push(phy.clone()) {
                    delivered = true;
                }
            }
        }
        delivered
    }
}
