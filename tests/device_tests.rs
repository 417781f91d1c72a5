//! Device state-machine properties, driven against a canned network
//! server that answers through the routing fabric: join lifecycle and
//! deterministic session keys, frame-counter monotonicity, confirmed
//! retransmission with un-join.


use std::sync::Arc;
use std::time::Duration;

use lwnsim::device::Device;
use lwnsim::event::{device_topic, EventBroker, EventKind};
use lwnsim::lorawan::crypto::{self, AesKey};
use lwnsim::lorawan::mac::DataFrame;
use lwnsim::lorawan::phy::{JoinAccept, JoinRequest, MType, PhyPayload};
use lwnsim::util::queue::UplinkQueue;
use lwnsim::{Forwarder, RadioFrame, RetentionConfig};
use mock_support::{abp_device, otaa_device, test_location, APP_KEY, APP_SKEY, NWK_SKEY};
use tokio::time::timeout;

const GW_MAC: u64 = 0xAAAA_0000_0000_0001;

struct Rig {
    fabric: Arc<Forwarder>,
    broker: Arc<EventBroker>,
    queue: Arc<UplinkQueue<RadioFrame>>,
}

fn rig() -> Rig {
    let fabric = Arc::new(Forwarder::new(16));
    let broker = Arc::new(EventBroker::new(RetentionConfig::default()));
    let queue = Arc::new(UplinkQueue::new(64));
    fabric.add_gateway(GW_MAC, queue.clone(), test_location());
    Rig {
        fabric,
        broker,
        queue,
    }
}

/// Canned server: answers every join-request on RX1, reports the
/// session keys it derived, and forwards every other frame to the test.
fn spawn_join_server(
    rig: &Rig,
    keys_tx: tokio::sync::mpsc::UnboundedSender<(AesKey, AesKey)>,
    data_tx: tokio::sync::mpsc::UnboundedSender<RadioFrame>,
) -> tokio::task::JoinHandle<()> {
    let fabric = rig.fabric.clone();
    let queue = rig.queue.clone();
    tokio::spawn(async move {
        let app_key = AesKey::new(APP_KEY);
        while let Some(frame) = queue.pop().await {
            let phy = PhyPayload::new(frame.payload.to_vec());
            if phy.mtype().ok() != Some(MType::JoinRequest) {
                let _ = data_tx.send(frame);
                continue;
            }
            let request = JoinRequest::from_phy(&phy, &app_key).expect("join-request");
            let accept = JoinAccept {
                join_nonce: [0x01, 0x02, 0x03],
                net_id: [0x13, 0x00, 0x00],
                dev_addr: 0x2601_AB01,
                dl_settings: 0x12, // RX1DROffset=1, RX2DataRate=2
                rx_delay: 1,
                cf_list: None,
            };
            let keys = crypto::derive_session_keys(
                &app_key,
                &accept.join_nonce,
                &accept.net_id,
                request.dev_nonce,
            );
            let _ = keys_tx.send(keys);
            // RX1: answer on the uplink frequency.
            fabric.downlink(&accept.to_phy(&app_key), frame.frequency, GW_MAC);
        }
    })
}

#[tokio::test(start_paused = true)]
async fn otaa_join_transitions_to_normal_and_derives_matching_keys() {
    let rig = rig();
    let (keys_tx, mut keys_rx) = tokio::sync::mpsc::unbounded_channel();
    let (data_tx, mut data_rx) = tokio::sync::mpsc::unbounded_channel();
    let server = spawn_join_server(&rig, keys_tx, data_tx);

    let device = Device::new(otaa_device(1, 0xD1), rig.fabric.clone(), rig.broker.clone(), None);
    rig.fabric.add_device(0xD1, test_location(), 5000.0);
    let (mut events, _, _handle) = rig.broker.subscribe(&device_topic(0xD1));

    device.start();
    assert!(!device.is_joined().await);
    device.step().await; // join attempt
    assert!(device.is_joined().await, "device did not join");

    // A join event was emitted.
    let mut saw_join = false;
    while let Ok(Some(event)) = timeout(Duration::from_millis(100), events.recv()).await {
        if event.kind == EventKind::Join {
            saw_join = true;
            break;
        }
    }
    assert!(saw_join, "no join event on the device topic");

    // The next uplink must decode under the keys the server derived
    // from (joinNonce, netId, devNonce, appKey).
    let (nwk_skey, app_skey) = keys_rx.recv().await.expect("server keys");
    device.step().await;
    let uplink = loop {
        let frame = data_rx.recv().await.expect("uplink frame");
        let phy = PhyPayload::new(frame.payload.to_vec());
        if phy.mtype().ok() == Some(MType::UnconfirmedDataUp) {
            break phy;
        }
    };
    let (frame, fcnt) = DataFrame::decode(&uplink, &nwk_skey, &app_skey, 0)
        .expect("uplink must verify under the derived session keys");
    assert_eq!(fcnt, 0);
    assert_eq!(frame.frm_payload, vec![0x01, 0x02, 0x03]);

    device.stop();
    rig.queue.close();
    let _ = server.await;
}

#[tokio::test(start_paused = true)]
async fn fcnt_up_is_strictly_increasing_across_uplinks() {
    let rig = rig();
    let device = Device::new(abp_device(2, 0xD2), rig.fabric.clone(), rig.broker.clone(), None);
    rig.fabric.add_device(0xD2, test_location(), 5000.0);

    device.start();
    for _ in 0..4 {
        device.step().await;
    }
    device.stop();

    let nwk = AesKey::new(NWK_SKEY);
    let app = AesKey::new(APP_SKEY);
    let mut last = None;
    let mut seen = 0;
    while let Some(frame) = {
        // Drain without blocking: the queue holds everything already.
        if rig.queue.is_empty() {
            None
        } else {
            rig.queue.pop().await
        }
    } {
        let phy = PhyPayload::new(frame.payload.to_vec());
        let (_, fcnt) = DataFrame::decode(&phy, &nwk, &app, last.map_or(0, |l: u32| l)).unwrap();
        if let Some(last) = last {
            assert!(fcnt > last, "fcnt regressed: {last} -> {fcnt}");
        }
        last = Some(fcnt);
        seen += 1;
    }
    assert_eq!(seen, 4);
}

#[tokio::test(start_paused = true)]
async fn unacknowledged_confirmed_uplink_retransmits_then_unjoins() {
    let rig = rig();
    let (keys_tx, mut keys_rx) = tokio::sync::mpsc::unbounded_channel();
    let (data_tx, mut data_rx) = tokio::sync::mpsc::unbounded_channel();

    // Server that answers joins but never ACKs data.
    let server = spawn_join_server(&rig, keys_tx, data_tx);

    let mut config = otaa_device(3, 0xD3);
    config.confirmed = true;
    config.nb_retransmission = 2;
    config.data_rate = 5;
    let device = Device::new(config, rig.fabric.clone(), rig.broker.clone(), None);
    rig.fabric.add_device(0xD3, test_location(), 5000.0);
    let (mut events, _, _handle) = rig.broker.subscribe(&device_topic(0xD3));

    device.start();
    device.step().await; // join
    assert!(device.is_joined().await);
    let (nwk_skey, app_skey) = keys_rx.recv().await.unwrap();

    device.step().await; // confirmed uplink + retransmissions

    // Let the server drain the queue into the forwarding channel.
    tokio::time::sleep(Duration::from_millis(10)).await;

    // Initial transmission plus two retransmissions, same frame
    // counter, data rate stepping down each time.
    let mut data_rates = Vec::new();
    let mut fcnts = Vec::new();
    while let Ok(frame) = data_rx.try_recv() {
        let phy = PhyPayload::new(frame.payload.to_vec());
        if phy.mtype().ok() == Some(MType::ConfirmedDataUp) {
            let (_, fcnt) = DataFrame::decode(&phy, &nwk_skey, &app_skey, 0).unwrap();
            fcnts.push(fcnt);
            data_rates.push(frame.data_rate.clone());
        }
    }
    assert_eq!(fcnts.len(), 3, "expected 1 + nb_retransmission transmissions");
    assert!(fcnts.iter().all(|f| *f == fcnts[0]), "fcnt changed on retry");
    assert_eq!(data_rates[0], "SF7BW125");
    assert_eq!(data_rates[1], "SF8BW125");
    assert_eq!(data_rates[2], "SF9BW125");

    // The OTA device gave up its session.
    assert!(!device.is_joined().await, "device still joined after retries");
    let mut saw_unjoin = false;
    while let Ok(Some(event)) = timeout(Duration::from_millis(100), events.recv()).await {
        if event.kind == EventKind::Unjoin {
            saw_unjoin = true;
            break;
        }
    }
    assert!(saw_unjoin, "no unjoin event after exhausted retries");

    device.stop();
    rig.queue.close();
    let _ = server.await;
}

#[tokio::test(start_paused = true)]
async fn downlink_mac_commands_are_executed_and_answered() {
    let rig = rig();
    let device = Device::new(abp_device(4, 0xD4), rig.fabric.clone(), rig.broker.clone(), None);
    rig.fabric.add_device(0xD4, test_location(), 5000.0);

    // Server: answer the first uplink with a DevStatusReq on RX1.
    let fabric = rig.fabric.clone();
    let queue = rig.queue.clone();
    let server = tokio::spawn(async move {
        let nwk = AesKey::new(NWK_SKEY);
        let app = AesKey::new(APP_SKEY);
        let mut answered = false;
        while let Some(frame) = queue.pop().await {
            let phy = PhyPayload::new(frame.payload.to_vec());
            let Ok((uplink, _)) = DataFrame::decode(&phy, &nwk, &app, 0) else {
                continue;
            };
            if answered {
                // Inspect the second uplink's FOpts for DevStatusAns.
                return uplink.fhdr.fopts;
            }
            answered = true;
            let reply = DataFrame {
                mtype: MType::UnconfirmedDataDown,
                fhdr: lwnsim::lorawan::mac::Fhdr {
                    dev_addr: uplink.fhdr.dev_addr,
                    fctrl: lwnsim::lorawan::mac::FCtrl::empty(),
                    fcnt: 0,
                    fopts: vec![0x06], // DevStatusReq
                },
                fport: None,
                frm_payload: Vec::new(),
            };
            let phy = reply.encode(&nwk, &app, 0).unwrap();
            fabric.downlink(&phy, frame.frequency, GW_MAC);
        }
        Vec::new()
    });

    device.start();
    device.step().await; // uplink, receives DevStatusReq
    device.step().await; // answer rides in this uplink's FOpts
    device.stop();
    rig.queue.close();

    let fopts = server.await.unwrap();
    assert_eq!(fopts.len(), 3, "DevStatusAns expected in FOpts");
    assert_eq!(fopts[0], 0x06);
    assert_eq!(fopts[1], 255, "battery byte");
}
