//! # Gateway Runtime
//!
//! The per-gateway packet-forwarder loop. A running gateway owns a UDP
//! socket and three tasks: a sender draining the uplink queue into
//! PUSH_DATA datagrams, a receiver handling acknowledgements and
//! PULL_RESP downlinks, and (for virtual gateways) a PULL_DATA
//! keepalive. Read errors trigger a reconnect loop, never a crash.

pub mod packets;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::SimulatorError;
use crate::event::{Event, EventBroker, EventKind};
use crate::logging::log_error;
use crate::forwarder::{Forwarder, RadioFrame};
use crate::gateway::packets::{
    GwmpPacket, PushDataPayload, Rxpk, Stat, TxAckPayload, TxpkAck,
};
use crate::util::eui::hex_u64;
use crate::util::geo::Location;
use crate::util::queue::UplinkQueue;

/// Where a gateway sends its datagrams.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayKind {
    /// Talks to the simulator-wide bridge address
    Virtual,
    /// Forwards to its own UDP peer; no keepalive
    Real { peer: String },
}

/// Persisted gateway definition (an entry of `gateways.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub id: u64,
    pub name: String,
    #[serde(with = "hex_u64")]
    pub mac: u64,
    pub location: Location,
    #[serde(default = "default_keepalive")]
    pub keepalive_secs: u64,
    pub kind: GatewayKind,
    /// Included in `run()` when true
    #[serde(default)]
    pub active: bool,
}

fn default_keepalive() -> u64 {
    30
}

/// Forwarder statistics, shared across the gateway's tasks.
#[derive(Debug, Default)]
pub struct GatewayStats {
    /// Radio packets received
    pub rxnb: AtomicU32,
    /// Radio packets with a valid CRC
    pub rxok: AtomicU32,
    /// Radio packets forwarded upstream
    pub rxfw: AtomicU32,
    /// PUSH_DATA datagrams sent
    pub push_data: AtomicU32,
    /// PUSH_ACK datagrams received
    pub push_ack: AtomicU32,
    /// PULL_DATA datagrams sent
    pub pull_data: AtomicU32,
    /// PULL_ACK datagrams received
    pub pull_ack: AtomicU32,
    /// Downlink datagrams received
    pub dwnb: AtomicU32,
    /// Downlink frames transmitted (TX_ACK sent)
    pub txnb: AtomicU32,
}

impl GatewayStats {
    /// Upstream acknowledgement ratio in percent.
    pub fn ackr(&self) -> f64 {
        let sent = self.push_data.load(Ordering::Relaxed);
        if sent == 0 {
            return 0.0;
        }
        let acked = self.push_ack.load(Ordering::Relaxed);
        (acked as f64 / sent as f64) * 100.0
    }
}

/// A simulated packet-forwarder gateway.
pub struct Gateway {
    config: GatewayConfig,
    queue: Arc<UplinkQueue<RadioFrame>>,
    stats: Arc<GatewayStats>,
    forwarder: Arc<Forwarder>,
    broker: Arc<EventBroker>,
    running: watch::Sender<bool>,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Gateway {
    pub fn new(
        config: GatewayConfig,
        uplink_buffer: usize,
        forwarder: Arc<Forwarder>,
        broker: Arc<EventBroker>,
    ) -> Arc<Self> {
        let (running, _) = watch::channel(false);
        Arc::new(Gateway {
            config,
            queue: Arc::new(UplinkQueue::new(uplink_buffer)),
            stats: Arc::new(GatewayStats::default()),
            forwarder,
            broker,
            running,
            socket: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn mac(&self) -> u64 {
        self.config.mac
    }

    /// The queue the routing fabric pushes uplinks onto.
    pub fn queue(&self) -> Arc<UplinkQueue<RadioFrame>> {
        self.queue.clone()
    }

    pub fn stats(&self) -> Arc<GatewayStats> {
        self.stats.clone()
    }

    pub fn can_execute(&self) -> bool {
        *self.running.borrow()
    }

    fn peer<'a>(&'a self, bridge: &'a str) -> &'a str {
        match &self.config.kind {
            GatewayKind::Virtual => bridge,
            GatewayKind::Real { peer } => peer,
        }
    }

    /// Dials the bridge and starts the sender, receiver and (virtual
    /// only) keepalive tasks.
    pub async fn start(self: &Arc<Self>, bridge: &str) -> Result<(), SimulatorError> {
        let peer = self.peer(bridge).to_string();
        let socket = dial(&peer).await?;
        {
            let mut slot = self.socket.lock().expect("socket lock poisoned");
            *slot = Some(socket);
        }
        let _ = self.running.send(true);

        let mut tasks = self.tasks.lock().expect("task lock poisoned");
        tasks.push(tokio::spawn(self.clone().sender_loop()));
        tasks.push(tokio::spawn(self.clone().receiver_loop(peer.clone())));
        if self.config.kind == GatewayKind::Virtual {
            tasks.push(tokio::spawn(self.clone().keepalive_loop()));
        }
        drop(tasks);

        info!("gateway {} up, forwarding to {peer}", self.config.name);
        self.emit(EventKind::Started, "gateway started");
        Ok(())
    }

    /// Signals every loop and waits for all of them to exit.
    pub async fn stop(&self) {
        let _ = self.running.send(false);
        self.queue.signal();
        let tasks: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock().expect("task lock poisoned");
            tasks.drain(..).collect()
        };
        for task in tasks {
            let _ = task.await;
        }
        {
            let mut slot = self.socket.lock().expect("socket lock poisoned");
            *slot = None;
        }
        self.emit(EventKind::Stopped, "gateway stopped");
    }

    fn current_socket(&self) -> Option<Arc<UdpSocket>> {
        self.socket.lock().expect("socket lock poisoned").clone()
    }

    fn emit(&self, kind: EventKind, message: impl Into<String>) {
        self.broker.publish_gateway(
            self.config.mac,
            Event::gateway(self.config.mac, kind, message),
        );
    }

    fn stat_block(&self) -> Stat {
        Stat {
            time: Utc::now().format("%Y-%m-%d %H:%M:%S GMT").to_string(),
            lati: self.config.location.latitude,
            long: self.config.location.longitude,
            alti: self.config.location.altitude,
            rxnb: self.stats.rxnb.load(Ordering::Relaxed),
            rxok: self.stats.rxok.load(Ordering::Relaxed),
            rxfw: self.stats.rxfw.load(Ordering::Relaxed),
            ackr: self.stats.ackr(),
            dwnb: self.stats.dwnb.load(Ordering::Relaxed),
            txnb: self.stats.txnb.load(Ordering::Relaxed),
        }
    }

    /// Pops uplink frames and ships them as PUSH_DATA. Exits when the
    /// queue is signalled or closed.
    async fn sender_loop(self: Arc<Self>) {
        while self.can_execute() {
            let Some(frame) = self.queue.pop().await else {
                break;
            };
            self.stats.rxnb.fetch_add(1, Ordering::Relaxed);
            self.stats.rxok.fetch_add(1, Ordering::Relaxed);

            let packet = GwmpPacket::PushData {
                token: GwmpPacket::random_token(),
                mac: self.config.mac,
                payload: PushDataPayload {
                    rxpk: Some(vec![Rxpk::from_frame(&frame)]),
                    stat: Some(self.stat_block()),
                },
            };
            let Ok(bytes) = packet.to_bytes() else { continue };
            let Some(socket) = self.current_socket() else {
                break;
            };
            match socket.send(&bytes).await {
                Ok(_) => {
                    self.stats.rxfw.fetch_add(1, Ordering::Relaxed);
                    self.stats.push_data.fetch_add(1, Ordering::Relaxed);
                    debug!("{}: PUSH_DATA sent ({} bytes)", self.config.name, bytes.len());
                }
                Err(err) => {
                    self.emit(EventKind::Error, format!("PUSH_DATA send failed: {err}"));
                }
            }
        }
    }

    /// Reads datagrams from the bridge: acknowledgements bump counters,
    /// PULL_RESP turns into a fabric downlink and a conditional TX_ACK.
    /// On read errors the loop re-dials until stopped.
    async fn receiver_loop(self: Arc<Self>, peer: String) {
        let mut stop_rx = self.running.subscribe();
        let mut buf = vec![0u8; 65_535];
        while self.can_execute() {
            let Some(socket) = self.current_socket() else { break };
            let received = tokio::select! {
                result = socket.recv(&mut buf) => result,
                _ = stop_rx.changed() => break,
            };
            match received {
                Ok(len) => self.handle_datagram(&buf[..len]).await,
                Err(err) => {
                    self.emit(EventKind::Error, format!("read failed: {err}"));
                    if !self.reconnect(&peer, &mut stop_rx).await {
                        break;
                    }
                }
            }
        }
    }

    /// Re-dials the peer until it succeeds or the gateway stops.
    async fn reconnect(&self, peer: &str, stop_rx: &mut watch::Receiver<bool>) -> bool {
        while self.can_execute() {
            match dial(peer).await {
                Ok(socket) => {
                    let mut slot = self.socket.lock().expect("socket lock poisoned");
                    *slot = Some(socket);
                    info!("{}: reconnected to {peer}", self.config.name);
                    return true;
                }
                Err(err) => {
                    log_error(&format!("{}: reconnect failed: {err}", self.config.name));
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                _ = stop_rx.changed() => return false,
            }
        }
        false
    }

    async fn handle_datagram(&self, bytes: &[u8]) {
        let packet = match GwmpPacket::parse(bytes) {
            Ok(packet) => packet,
            Err(err) => {
                debug!("{}: unparseable datagram: {err}", self.config.name);
                return;
            }
        };
        match packet {
            GwmpPacket::PushAck { .. } => {
                self.stats.push_ack.fetch_add(1, Ordering::Relaxed);
            }
            GwmpPacket::PullAck { .. } => {
                self.stats.pull_ack.fetch_add(1, Ordering::Relaxed);
            }
            GwmpPacket::PullResp { token, payload } => {
                self.stats.dwnb.fetch_add(1, Ordering::Relaxed);
                self.handle_pull_resp(token, payload).await;
            }
            GwmpPacket::PushData { .. } | GwmpPacket::PullData { .. } | GwmpPacket::TxAck { .. } => {
                debug!("{}: unexpected packet from bridge, ignored", self.config.name);
            }
        }
    }

    /// Pushes the downlink through the fabric; TX_ACK (same token) only
    /// when some device accepted it.
    async fn handle_pull_resp(&self, token: u16, payload: packets::PullRespPayload) {
        let txpk = payload.txpk;
        let phy = match txpk.phy_payload() {
            Ok(bytes) => crate::lorawan::phy::PhyPayload::new(bytes),
            Err(err) => {
                self.emit(EventKind::Error, format!("PULL_RESP rejected: {err}"));
                return;
            }
        };
        let frequency = txpk.frequency_hz();
        let delivered = self.forwarder.downlink(&phy, frequency, self.config.mac);
        if !delivered {
            debug!(
                "{}: no device listening on {frequency} Hz",
                self.config.name
            );
            return;
        }
        self.stats.txnb.fetch_add(1, Ordering::Relaxed);
        self.emit(EventKind::Downlink, format!("downlink transmitted on {frequency} Hz"));

        let ack = GwmpPacket::TxAck {
            token,
            mac: self.config.mac,
            payload: Some(TxAckPayload {
                txpk_ack: TxpkAck {
                    error: "NONE".to_string(),
                },
            }),
        };
        if let (Ok(bytes), Some(socket)) = (ack.to_bytes(), self.current_socket()) {
            if let Err(err) = socket.send(&bytes).await {
                self.emit(EventKind::Error, format!("TX_ACK send failed: {err}"));
            }
        }
    }

    /// Periodic PULL_DATA keepalive (virtual gateways).
    async fn keepalive_loop(self: Arc<Self>) {
        let mut stop_rx = self.running.subscribe();
        let period = Duration::from_secs(self.config.keepalive_secs.max(1));
        while self.can_execute() {
            let packet = GwmpPacket::PullData {
                token: GwmpPacket::random_token(),
                mac: self.config.mac,
            };
            if let (Ok(bytes), Some(socket)) = (packet.to_bytes(), self.current_socket()) {
                match socket.send(&bytes).await {
                    Ok(_) => {
                        self.stats.pull_data.fetch_add(1, Ordering::Relaxed);
                        self.emit(EventKind::Keepalive, "PULL_DATA sent");
                    }
                    Err(err) => {
                        self.emit(EventKind::Error, format!("PULL_DATA send failed: {err}"));
                    }
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(period) => {}
                _ = stop_rx.changed() => {}
            }
        }
    }
}

async fn dial(peer: &str) -> Result<Arc<UdpSocket>, SimulatorError> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket
        .connect(peer)
        .await
        .map_err(|e| SimulatorError::TransientIo(format!("connect {peer}: {e}")))?;
    Ok(Arc::new(socket))
}
