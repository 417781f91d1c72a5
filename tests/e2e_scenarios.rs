//! End-to-end scenarios over real UDP: uplink fan-out to the bridge,
//! downlink delivery with TX_ACK, the no-listener policy, and graceful
//! shutdown.


use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use base64::Engine;
use lwnsim::event::{device_topic, EventKind};
use lwnsim::gateway::packets::{GwmpPacket, PullRespPayload, Txpk};
use lwnsim::lorawan::crypto::AesKey;
use lwnsim::lorawan::mac::{DataFrame, FCtrl, Fhdr};
use lwnsim::lorawan::phy::{MType, PhyPayload};
use lwnsim::{PerformanceConfig, RetentionConfig, Simulator, SimulatorConfig};
use mock_support::{abp_device, test_location, virtual_gateway, APP_SKEY, CannedBridge, NWK_SKEY};
use tokio::time::{timeout, Instant};

fn simulator_config(bridge_address: String) -> SimulatorConfig {
    SimulatorConfig {
        bridge_address,
        performance: PerformanceConfig {
            use_scheduler: false,
            ..PerformanceConfig::default()
        },
        retention: RetentionConfig::default(),
    }
}

fn decode_uplink(data_b64: &str) -> (DataFrame, u32) {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(data_b64)
        .expect("rxpk.data base64");
    let phy = PhyPayload::new(bytes);
    DataFrame::decode(
        &phy,
        &AesKey::new(NWK_SKEY),
        &AesKey::new(APP_SKEY),
        0,
    )
    .expect("uplink MIC must verify under the device's session keys")
}

/// S1: two gateways in range of one device; every uplink reaches the
/// bridge once per gateway, MIC-valid.
#[tokio::test]
async fn s1_uplink_fans_out_to_both_gateways() {
    let bridge = CannedBridge::bind().await;
    let simulator = Simulator::new(simulator_config(bridge.address()));

    simulator
        .add_gateway(virtual_gateway(1, 0xAAAA_0000_0000_0001, test_location()))
        .await
        .unwrap();
    simulator
        .add_gateway(virtual_gateway(2, 0xAAAA_0000_0000_0002, test_location()))
        .await
        .unwrap();

    let mut device = abp_device(1, 0xD000_0000_0000_0001);
    device.range_m = 5000.0;
    device.nb_rep = 2; // two copies per cycle
    simulator.add_device(device).await.unwrap();

    simulator.run().await.unwrap();

    // Collect PUSH_DATA per gateway socket for a few seconds.
    let mut push_data_by_source: HashMap<SocketAddr, u32> = HashMap::new();
    let deadline = Instant::now() + Duration::from_secs(4);
    while Instant::now() < deadline {
        let Some((packet, from)) = bridge.recv_packet(Duration::from_millis(500)).await else {
            continue;
        };
        if let GwmpPacket::PushData { payload, .. } = packet {
            let Some(rxpks) = payload.rxpk else { continue };
            for rxpk in rxpks {
                let (frame, _) = decode_uplink(&rxpk.data);
                assert_eq!(frame.mtype, MType::UnconfirmedDataUp);
                assert_eq!(frame.frm_payload, vec![0x01, 0x02, 0x03]);
                *push_data_by_source.entry(from).or_default() += 1;
            }
        }
    }
    simulator.stop().await;

    assert_eq!(
        push_data_by_source.len(),
        2,
        "expected PUSH_DATA from both gateways: {push_data_by_source:?}"
    );
    for (source, count) in &push_data_by_source {
        assert!(*count >= 2, "gateway {source} sent only {count} uplinks");
    }
}

/// S2: a class-C device waiting on RX2 accepts a PULL_RESP downlink and
/// the gateway acknowledges with TX_ACK carrying the same token.
#[tokio::test]
async fn s2_downlink_reaches_waiting_device_and_acks() {
    let bridge = CannedBridge::bind().await;
    let simulator = Simulator::new(simulator_config(bridge.address()));

    simulator
        .add_gateway(virtual_gateway(1, 0xAAAA_0000_0000_0011, test_location()))
        .await
        .unwrap();

    let mut device = abp_device(1, 0xD000_0000_0000_0011);
    device.supports_class_c = true;
    device.uplink_interval_secs = 30;
    let dev_addr = 0x2601_0001;
    simulator.add_device(device).await.unwrap();

    let (mut events, _, _handle) = simulator
        .broker()
        .subscribe(&device_topic(0xD000_0000_0000_0011));

    simulator.run().await.unwrap();

    // Learn the gateway's socket address from its first datagram and
    // give the first execution cycle time to finish.
    let (_, gateway_addr) = bridge
        .recv_packet(Duration::from_secs(5))
        .await
        .expect("no datagram from gateway");
    tokio::time::sleep(Duration::from_secs(3)).await;

    // Build a valid UnconfirmedDataDown for the device on RX2.
    let down = DataFrame {
        mtype: MType::UnconfirmedDataDown,
        fhdr: Fhdr {
            dev_addr,
            fctrl: FCtrl::empty(),
            fcnt: 0,
            fopts: Vec::new(),
        },
        fport: Some(1),
        frm_payload: vec![0x09, 0x09],
    };
    let phy = down
        .encode(&AesKey::new(NWK_SKEY), &AesKey::new(APP_SKEY), 0)
        .unwrap();
    let token = 0x1234;
    let pull_resp = GwmpPacket::PullResp {
        token,
        payload: PullRespPayload {
            txpk: Txpk {
                imme: Some(true),
                tmst: None,
                freq: 869.525,
                rfch: Some(0),
                powe: Some(14),
                modu: Some("LORA".into()),
                datr: "SF12BW125".into(),
                codr: Some("4/5".into()),
                ipol: Some(true),
                size: phy.len() as u16,
                data: base64::engine::general_purpose::STANDARD.encode(&phy.bytes),
                ncrc: None,
            },
        },
    };
    bridge.send_to(&pull_resp, gateway_addr).await;

    // The gateway must TX_ACK with the same token.
    let mut acked = false;
    let deadline = Instant::now() + Duration::from_secs(3);
    while Instant::now() < deadline {
        let Some((packet, _)) = bridge.recv_packet(Duration::from_millis(300)).await else {
            continue;
        };
        if let GwmpPacket::TxAck { token: t, .. } = packet {
            assert_eq!(t, token, "TX_ACK token mismatch");
            acked = true;
            break;
        }
    }
    assert!(acked, "gateway never sent TX_ACK");

    // And the device emitted a downlink event.
    let mut saw_downlink = false;
    while let Ok(Some(event)) = timeout(Duration::from_millis(500), events.recv()).await {
        if event.kind == EventKind::Downlink {
            saw_downlink = true;
            break;
        }
    }
    assert!(saw_downlink, "device did not report the downlink");

    simulator.stop().await;
}

/// S3: a PULL_RESP with nobody listening is not TX_ACKed.
#[tokio::test]
async fn s3_no_listener_means_no_tx_ack() {
    let bridge = CannedBridge::bind().await;
    let simulator = Simulator::new(simulator_config(bridge.address()));

    simulator
        .add_gateway(virtual_gateway(1, 0xAAAA_0000_0000_0021, test_location()))
        .await
        .unwrap();
    // No device at all: no open slot can exist.
    simulator.run().await.unwrap();

    let (_, gateway_addr) = bridge
        .recv_packet(Duration::from_secs(5))
        .await
        .expect("no datagram from gateway");

    let pull_resp = GwmpPacket::PullResp {
        token: 0x4242,
        payload: PullRespPayload {
            txpk: Txpk {
                imme: Some(true),
                tmst: None,
                freq: 869.525,
                rfch: Some(0),
                powe: Some(14),
                modu: Some("LORA".into()),
                datr: "SF12BW125".into(),
                codr: Some("4/5".into()),
                ipol: Some(true),
                size: 4,
                data: base64::engine::general_purpose::STANDARD.encode([0x60, 1, 2, 3]),
                ncrc: None,
            },
        },
    };
    bridge.send_to(&pull_resp, gateway_addr).await;

    // Nothing but keepalives/uplink reports may come back.
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if let Some((packet, _)) = bridge.recv_packet(Duration::from_millis(300)).await {
            assert!(
                !matches!(packet, GwmpPacket::TxAck { .. }),
                "gateway TX_ACKed with no listener"
            );
        }
    }

    simulator.stop().await;
}

/// Property 16: stop() returns promptly regardless of entity count,
/// with every task joined.
#[tokio::test]
async fn graceful_shutdown_is_bounded() {
    let bridge = CannedBridge::bind().await;
    let simulator = Simulator::new(simulator_config(bridge.address()));

    for i in 0..2u64 {
        simulator
            .add_gateway(virtual_gateway(
                i + 1,
                0xAAAA_0000_0000_0100 + i,
                test_location(),
            ))
            .await
            .unwrap();
    }
    for i in 0..5u64 {
        simulator
            .add_device(abp_device(i + 1, 0xD000_0000_0000_0100 + i))
            .await
            .unwrap();
    }

    simulator.run().await.unwrap();
    tokio::time::sleep(Duration::from_millis(1200)).await;

    timeout(Duration::from_secs(5), simulator.stop())
        .await
        .expect("stop() did not complete in time");
}
