//! # Device Runtime
//!
//! The per-device LoRaWAN 1.0.x state machine: OTA activation, uplink
//! emission, receive windows, downlink processing, MAC command
//! execution, ADR back-off, retransmission and class switching.
//!
//! A device can be driven two ways: a dedicated task looping on its own
//! ticker (`run`), or the shared tick-wheel scheduler invoking one
//! [`Device::step`] per interval (`DeviceStepJob`). Both drivers honor
//! the same stop signal and check it at every blocking point.

pub mod adr;
pub mod channels;
pub mod codec;
pub mod mac_exec;
pub mod slot;
pub mod state;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use log::{debug, info, warn};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::constants::{
    ACK_TIMEOUT, JOIN_ACCEPT_DELAY1, JOIN_ACCEPT_DELAY2, MAX_FCNT_GAP, MAX_FOPTS_COMMANDS,
    MAX_FOPTS_LEN, RX_WINDOW,
};
use crate::device::adr::{AdrAction, AdrConfig};
use crate::device::codec::{CodecDeviceView, CodecMessage, PayloadCodec};
use crate::device::slot::DownlinkSlot;
use crate::device::state::{DeviceClass, DeviceConfig, DeviceState, Mode};
use crate::event::{Event, EventBroker, EventKind};
use crate::forwarder::{Forwarder, RadioFrame};
use crate::lorawan::commands::{DownlinkMacCommand, UplinkMacCommand};
use crate::lorawan::crypto::{self, AesKey};
use crate::lorawan::mac::{DataFrame, FCtrl, Fhdr};
use crate::lorawan::phy::{JoinAccept, JoinRequest, MType, PhyPayload};
use crate::lorawan::region::Channel;
use crate::scheduler::JobExecutor;
use crate::util::geo::Location;

pub use state::{ActivationMode, SessionState};

/// Ping-slot cadence for the simplified class-B listener
const PING_SLOT_PERIOD: Duration = Duration::from_secs(32);

/// Window the continuous class-C listener re-arms with
const CLASS_C_WINDOW: Duration = Duration::from_secs(30);

/// What a pass through the receive windows produced.
#[derive(Debug, Clone, Copy, Default)]
struct DownlinkOutcome {
    received: bool,
    ack: bool,
    fpending: bool,
}

/// Everything needed to put one uplink on the air and open its windows.
struct UplinkPlan {
    phy: PhyPayload,
    channel: usize,
    frequency: u32,
    data_rate: String,
    rx1_frequency: u32,
    rx1_window: Duration,
    rx2_frequency: u32,
    confirmed: bool,
    repetitions: u8,
    fcnt: u32,
}

/// A simulated LoRaWAN end-device.
pub struct Device {
    config: DeviceConfig,
    state: Mutex<DeviceState>,
    slot: Arc<DownlinkSlot>,
    forwarder: Arc<Forwarder>,
    broker: Arc<EventBroker>,
    codec: Option<Arc<dyn PayloadCodec>>,
    adr_config: AdrConfig,
    running: watch::Sender<bool>,
    /// Self-reference for the class B/C background listeners
    weak: std::sync::Weak<Device>,
}

impl Device {
    pub fn new(
        config: DeviceConfig,
        forwarder: Arc<Forwarder>,
        broker: Arc<EventBroker>,
        codec: Option<Arc<dyn PayloadCodec>>,
    ) -> Arc<Self> {
        let state = DeviceState::initial(&config);
        let (running, _) = watch::channel(false);
        Arc::new_cyclic(|weak| Device {
            config,
            state: Mutex::new(state),
            slot: Arc::new(DownlinkSlot::new()),
            forwarder,
            broker,
            codec,
            adr_config: AdrConfig::default(),
            running,
            weak: weak.clone(),
        })
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn dev_eui(&self) -> u64 {
        self.config.dev_eui
    }

    /// Current location (mutable at runtime, unlike the rest of the
    /// configuration).
    pub async fn location(&self) -> Location {
        self.state.lock().await.location
    }

    pub fn can_execute(&self) -> bool {
        *self.running.borrow()
    }

    /// Marks the device running and announces it. Routing-fabric
    /// membership is the orchestrator's responsibility.
    pub fn start(&self) {
        let _ = self.running.send(true);
        self.broker.publish_device(
            self.config.dev_eui,
            Event::device(self.config.dev_eui, EventKind::Started, "device started"),
        );
    }

    /// Stops the device: every loop observes the signal, the delivery
    /// slot wakes empty-handed.
    pub fn stop(&self) {
        let _ = self.running.send(false);
        self.slot.close();
        self.broker.publish_device(
            self.config.dev_eui,
            Event::device(self.config.dev_eui, EventKind::Stopped, "device stopped"),
        );
    }

    /// Dedicated-task driver: activation loop, then one execution cycle
    /// per uplink interval.
    pub fn run(self: &Arc<Self>) -> JoinHandle<()> {
        let device = self.clone();
        tokio::spawn(async move {
            let mut stop_rx = device.running.subscribe();
            let interval = device.config.uplink_interval();
            while device.can_execute() {
                let joined = device.state.lock().await.joined;
                let pause = if joined {
                    device.step_cycle().await;
                    interval
                } else {
                    device.try_join().await;
                    let joined_now = device.state.lock().await.joined;
                    if joined_now {
                        continue;
                    }
                    ACK_TIMEOUT
                };
                tokio::select! {
                    _ = tokio::time::sleep(pause) => {}
                    _ = stop_rx.changed() => {}
                }
            }
        })
    }

    /// Scheduler driver: one step per tick. Unjoined OTA devices spend
    /// the step on a join attempt.
    pub async fn step(&self) {
        if !self.can_execute() {
            return;
        }
        let joined = self.state.lock().await.joined;
        if joined {
            self.step_cycle().await;
        } else {
            self.try_join().await;
        }
    }

    // ------------------------------------------------------------------
    // Control-surface operations
    // ------------------------------------------------------------------

    /// Queues a device-originated MAC command (e.g. LinkCheckReq) for
    /// the next uplink's FOpts.
    pub async fn send_mac_command(&self, command: UplinkMacCommand) {
        self.state.lock().await.pending_answers.push(command);
    }

    /// Replaces the static payload and FPort.
    pub async fn change_payload(&self, payload: Vec<u8>, fport: u8) {
        let mut state = self.state.lock().await;
        state.payload = payload;
        state.fport = fport;
    }

    /// Queues a one-shot uplink payload, consumed before the static or
    /// codec-sourced payload.
    pub async fn enqueue_uplink(&self, payload: Vec<u8>) {
        self.state.lock().await.queued_uplinks.push(payload);
    }

    /// Moves the device. The caller must re-link the routing fabric.
    pub async fn change_location(&self, location: Location) {
        self.state.lock().await.location = location;
        self.broker.publish_device(
            self.config.dev_eui,
            Event::device(
                self.config.dev_eui,
                EventKind::LocationChange,
                format!("moved to {:.5},{:.5}", location.latitude, location.longitude),
            ),
        );
    }

    /// True once a session is established.
    pub async fn is_joined(&self) -> bool {
        self.state.lock().await.joined
    }

    /// Current uplink frame counter.
    pub async fn fcnt_up(&self) -> u32 {
        self.state.lock().await.fcnt_up
    }

    // ------------------------------------------------------------------
    // Activation
    // ------------------------------------------------------------------

    /// One OTA join attempt: join-request, JA1/JA2 windows, session
    /// establishment. No-op for pre-keyed devices.
    async fn try_join(&self) {
        let ActivationMode::Otaa { join_eui, app_key } = &self.config.activation else {
            return;
        };
        if !self.can_execute() {
            return;
        }

        let (phy, channel, frequency, data_rate, rx1_frequency, rx2_frequency) = {
            let mut state = self.state.lock().await;
            state.mode = Mode::Activation;
            state.class = DeviceClass::A;
            state.dev_nonce = rand::random();

            let Some(sel) = channels::select_channel(
                self.config.region,
                &state.channels,
                state.active_channel,
                state.data_rate,
            ) else {
                warn!("{}: no usable channel for join", self.config.name);
                return;
            };
            state.active_channel = sel.channel;
            state.data_rate = sel.data_rate;
            let channel = state.channels[sel.channel];
            let Some(spec) = self.config.region.data_rate_spec(sel.data_rate) else {
                return;
            };

            let request = JoinRequest {
                join_eui: *join_eui,
                dev_eui: self.config.dev_eui,
                dev_nonce: state.dev_nonce,
            };
            (
                request.to_phy(app_key),
                sel.channel,
                channel.frequency,
                spec.datr(),
                channel.rx1_frequency(),
                state.rx2_frequency,
            )
        };

        self.transmit(channel, frequency, data_rate, phy.bytes.clone(), 1);
        self.emit(EventKind::Uplink, "join-request sent");

        // JA1, then JA2. The slot is armed for the whole delay+window
        // span, so an immediate reply is accepted early.
        let received = self
            .window(rx1_frequency, JOIN_ACCEPT_DELAY1 + RX_WINDOW)
            .await;
        let received = match received {
            Some(phy) => Some(phy),
            None if self.can_execute() => {
                self.window(rx2_frequency, JOIN_ACCEPT_DELAY2 - JOIN_ACCEPT_DELAY1 + RX_WINDOW)
                    .await
            }
            None => None,
        };

        let Some(reply) = received else {
            debug!("{}: no join-accept", self.config.name);
            return;
        };

        match JoinAccept::from_phy(&reply, app_key) {
            Ok(accept) => self.establish_session(app_key, &accept).await,
            Err(err) => {
                self.emit(EventKind::Error, format!("join-accept rejected: {err}"));
            }
        }
    }

    async fn establish_session(&self, app_key: &AesKey, accept: &JoinAccept) {
        let mut state = self.state.lock().await;
        let (nwk_skey, app_skey) = crypto::derive_session_keys(
            app_key,
            &accept.join_nonce,
            &accept.net_id,
            state.dev_nonce,
        );
        state.session = Some(SessionState {
            dev_addr: accept.dev_addr,
            nwk_skey,
            app_skey,
        });
        state.joined = true;
        state.mode = Mode::Normal;
        state.fcnt_up = 0;
        state.fcnt_down = 0;
        state.rx1_dr_offset = accept.rx1_dr_offset();
        state.rx2_data_rate = accept.rx2_data_rate();
        state.rx1_delay = Duration::from_secs(accept.rx1_delay_secs() as u64);
        if !self.config.region.uses_channel_groups() {
            for frequency in accept.cf_list_frequencies() {
                if !state.channels.iter().any(|ch| ch.frequency == frequency) {
                    let max_dr = self.config.region.max_uplink_data_rate().min(5);
                    state.channels.push(Channel::new(frequency, 0, max_dr));
                }
            }
        }
        drop(state);

        info!("{}: joined", self.config.name);
        self.emit(EventKind::Join, "join accepted, session established");
    }

    // ------------------------------------------------------------------
    // Normal execution cycle
    // ------------------------------------------------------------------

    async fn step_cycle(&self) {
        if !self.can_execute() {
            return;
        }
        self.switch_class_if_needed().await;

        let Some(plan) = self.build_uplink().await else {
            return;
        };
        let fcnt = plan.fcnt;
        self.transmit(
            plan.channel,
            plan.frequency,
            plan.data_rate.clone(),
            plan.phy.bytes.clone(),
            plan.repetitions,
        );
        self.emit(
            EventKind::Uplink,
            format!("uplink sent (fcnt {fcnt}, {} bytes)", plan.phy.len()),
        );

        let mut outcome = self.receive_after_uplink(&plan).await;

        // FPending: keep polling with empty frames while the server has
        // more queued and we are allowed to run.
        while outcome.fpending && self.can_execute() {
            self.state.lock().await.mode = Mode::FPending;
            let Some(empty) = self.build_empty_uplink().await else {
                break;
            };
            self.transmit(
                empty.channel,
                empty.frequency,
                empty.data_rate.clone(),
                empty.phy.bytes.clone(),
                1,
            );
            outcome = self.receive_after_uplink(&empty).await;
        }

        // Confirmed uplinks without an ACK enter retransmission.
        if plan.confirmed && !outcome.ack {
            outcome = self.retransmit(&plan).await;
        }

        let mut state = self.state.lock().await;
        state.mode = Mode::Normal;
        if outcome.received {
            adr::record_downlink(&mut state.adr);
        } else if self.config.adr_enabled {
            let at_lowest = state.data_rate == 0;
            match adr::record_uplink(&self.adr_config, &mut state.adr, at_lowest) {
                AdrAction::None | AdrAction::RequestAck => {}
                AdrAction::StepDown => {
                    state.data_rate = state.data_rate.saturating_sub(1);
                    debug!("{}: ADR back-off to DR{}", self.config.name, state.data_rate);
                }
                AdrAction::Rejoin => {
                    if self.config.is_otaa() {
                        state.unjoin();
                        drop(state);
                        self.emit(EventKind::Unjoin, "ADR back-off exhausted, rejoining");
                        return;
                    }
                }
            }
        }
    }

    /// Opens RX1 (and RX2 for class A) after an uplink and processes
    /// whatever arrives.
    async fn receive_after_uplink(&self, plan: &UplinkPlan) -> DownlinkOutcome {
        let class = self.state.lock().await.class;

        if let Some(phy) = self.window(plan.rx1_frequency, plan.rx1_window).await {
            return self.process_downlink(&phy).await;
        }
        if class != DeviceClass::A || !self.can_execute() {
            // Class B/C devices listen outside the uplink exchange.
            return DownlinkOutcome::default();
        }
        if let Some(phy) = self
            .window(plan.rx2_frequency, Duration::from_secs(1) + RX_WINDOW)
            .await
        {
            return self.process_downlink(&phy).await;
        }
        DownlinkOutcome::default()
    }

    /// Registers the delivery slot at `frequency` and waits out one
    /// window.
    async fn window(&self, frequency: u32, duration: Duration) -> Option<PhyPayload> {
        self.forwarder
            .register(frequency, self.config.dev_eui, self.slot.clone());
        let phy = self.slot.recv(duration).await;
        self.forwarder.unregister(frequency, self.config.dev_eui);
        phy
    }

    /// Repeats an unacknowledged confirmed uplink, decrementing the data
    /// rate each time. Exhausting the retries un-joins OTA devices.
    async fn retransmit(&self, plan: &UplinkPlan) -> DownlinkOutcome {
        let mut outcome = DownlinkOutcome::default();
        {
            self.state.lock().await.mode = Mode::Retransmission;
        }
        for attempt in 1..=self.config.nb_retransmission {
            if !self.can_execute() {
                return outcome;
            }
            let (channel, frequency, data_rate, rx1_frequency) = {
                let mut state = self.state.lock().await;
                state.data_rate = state.data_rate.saturating_sub(1);
                let dr = state.data_rate;
                match channels::select_channel(
                    self.config.region,
                    &state.channels,
                    state.active_channel,
                    dr,
                ) {
                    Some(sel) => {
                        state.active_channel = sel.channel;
                        state.data_rate = sel.data_rate;
                        let channel = state.channels[sel.channel];
                        let datr = self
                            .config
                            .region
                            .data_rate_spec(sel.data_rate)
                            .map(|s| s.datr())
                            .unwrap_or_else(|| plan.data_rate.clone());
                        (sel.channel, channel.frequency, datr, channel.rx1_frequency())
                    }
                    None => return outcome,
                }
            };
            debug!(
                "{}: retransmission {attempt}/{}",
                self.config.name, self.config.nb_retransmission
            );
            self.transmit(
                channel,
                frequency,
                data_rate.clone(),
                plan.phy.bytes.clone(),
                1,
            );

            let retry_plan = UplinkPlan {
                phy: plan.phy.clone(),
                channel,
                frequency,
                data_rate,
                rx1_frequency,
                rx1_window: plan.rx1_window,
                rx2_frequency: plan.rx2_frequency,
                confirmed: true,
                repetitions: 1,
                fcnt: plan.fcnt,
            };
            outcome = self.receive_after_uplink(&retry_plan).await;
            if outcome.ack {
                return outcome;
            }
        }

        if self.config.is_otaa() {
            self.state.lock().await.unjoin();
            self.emit(
                EventKind::Unjoin,
                "confirmed uplink unacknowledged, rejoining",
            );
        } else {
            warn!(
                "{}: confirmed uplink unacknowledged after {} retries",
                self.config.name, self.config.nb_retransmission
            );
        }
        outcome
    }

    // ------------------------------------------------------------------
    // Uplink construction
    // ------------------------------------------------------------------

    /// Assembles the next data uplink: payload source, FOpts, encryption
    /// and MIC. Returns None when the device has no session or no
    /// usable channel.
    async fn build_uplink(&self) -> Option<UplinkPlan> {
        let (codec_view, queued) = {
            let mut state = self.state.lock().await;
            let view = CodecDeviceView {
                dev_eui: self.config.dev_eui,
                battery: self.config.battery,
                data_rate: state.data_rate,
                fcnt_up: state.fcnt_up,
            };
            let queued = if state.queued_uplinks.is_empty() {
                None
            } else {
                Some(state.queued_uplinks.remove(0))
            };
            (view, queued)
        };

        // Payload source: queued one-shot, codec, else static. Codec
        // failures fall back to the static payload.
        let mut state_fport = self.state.lock().await.fport;
        let payload = match queued {
            Some(bytes) => bytes,
            None => match (&self.codec, self.config.codec_id) {
                (Some(codec), Some(codec_id)) => {
                    match codec.encode(codec_id, self.config.dev_eui, &codec_view).await {
                        Ok((bytes, fport)) => {
                            state_fport = fport;
                            bytes
                        }
                        Err(err) => {
                            warn!("{}: codec encode failed: {err}", self.config.name);
                            self.state.lock().await.payload.clone()
                        }
                    }
                }
                _ => self.state.lock().await.payload.clone(),
            },
        };

        self.finish_uplink(Some((state_fport, payload))).await
    }

    /// Assembles an empty uplink (FPending polling).
    async fn build_empty_uplink(&self) -> Option<UplinkPlan> {
        self.finish_uplink(None).await
    }

    async fn finish_uplink(&self, app_payload: Option<(u8, Vec<u8>)>) -> Option<UplinkPlan> {
        let mut state = self.state.lock().await;
        let session = state.session.clone()?;

        let sel = channels::select_channel(
            self.config.region,
            &state.channels,
            state.active_channel,
            state.data_rate,
        )?;
        state.active_channel = sel.channel;
        state.data_rate = sel.data_rate;
        let channel = state.channels[sel.channel];
        let datr = self.config.region.data_rate_spec(sel.data_rate)?.datr();

        let mut fctrl = FCtrl::empty();
        if self.config.adr_enabled {
            fctrl |= FCtrl::ADR;
            if state.adr.ack_requested {
                fctrl |= FCtrl::ADR_ACK_REQ;
            }
        }
        if state.ack_pending {
            fctrl |= FCtrl::ACK;
            state.ack_pending = false;
        }

        let fopts = drain_fopts(&mut state);
        let (fport, frm_payload) = match &app_payload {
            Some((fport, bytes)) => (Some(*fport), bytes.clone()),
            None => (None, Vec::new()),
        };

        let mtype = if self.config.confirmed {
            MType::ConfirmedDataUp
        } else {
            MType::UnconfirmedDataUp
        };
        let fcnt = state.fcnt_up;
        let frame = DataFrame {
            mtype,
            fhdr: Fhdr {
                dev_addr: session.dev_addr,
                fctrl,
                fcnt: fcnt as u16,
                fopts,
            },
            fport,
            frm_payload,
        };
        let phy = match frame.encode(&session.nwk_skey, &session.app_skey, fcnt) {
            Ok(phy) => phy,
            Err(err) => {
                warn!("{}: uplink encode failed: {err}", self.config.name);
                return None;
            }
        };
        state.fcnt_up = state.fcnt_up.wrapping_add(1);

        let repetitions = if self.config.confirmed {
            1
        } else {
            self.config.nb_rep.max(1)
        };

        let plan = UplinkPlan {
            phy,
            channel: sel.channel,
            frequency: channel.frequency,
            data_rate: datr,
            rx1_frequency: channel.rx1_frequency(),
            rx1_window: state.rx1_delay + RX_WINDOW,
            rx2_frequency: state.rx2_frequency,
            confirmed: self.config.confirmed,
            repetitions,
            fcnt,
        };

        if let (Some(codec), Some((fport, bytes))) = (&self.codec, &app_payload) {
            codec.record_message(
                self.config.dev_eui,
                CodecMessage {
                    fcnt,
                    fport: *fport,
                    bytes: bytes.clone(),
                    timestamp: Utc::now(),
                },
            );
        }

        Some(plan)
    }

    /// Hands copies of the frame to the fabric, `repetitions` times
    /// back-to-back (NbRep for unconfirmed traffic).
    fn transmit(
        &self,
        channel: usize,
        frequency: u32,
        data_rate: String,
        payload: Vec<u8>,
        repetitions: u8,
    ) {
        let frame = RadioFrame {
            channel,
            frequency,
            modulation: "LORA".to_string(),
            data_rate,
            code_rate: "4/5".to_string(),
            payload: payload.into(),
            received_at: Utc::now(),
            tmst: 0,
            tmms: 0,
        };
        for _ in 0..repetitions.max(1) {
            self.forwarder.uplink(frame.clone(), self.config.dev_eui);
        }
    }

    // ------------------------------------------------------------------
    // Downlink processing
    // ------------------------------------------------------------------

    /// Decrypts, validates and executes one received PHY payload.
    async fn process_downlink(&self, phy: &PhyPayload) -> DownlinkOutcome {
        let mut outcome = DownlinkOutcome::default();
        let decode_for_codec = {
            let mut state = self.state.lock().await;
            let Some(session) = state.session.clone() else {
                return outcome;
            };

            let decoded = DataFrame::decode(
                phy,
                &session.nwk_skey,
                &session.app_skey,
                state.fcnt_down,
            );
            let (frame, fcnt) = match decoded {
                Ok(pair) => pair,
                Err(err) => {
                    drop(state);
                    self.emit(EventKind::Error, format!("downlink rejected: {err}"));
                    return outcome;
                }
            };
            if frame.fhdr.dev_addr != session.dev_addr {
                debug!("{}: downlink for another device, ignored", self.config.name);
                return outcome;
            }
            if fcnt.saturating_sub(state.fcnt_down) > MAX_FCNT_GAP {
                drop(state);
                self.emit(
                    EventKind::Error,
                    format!("downlink rejected: frame counter gap ({fcnt})"),
                );
                return outcome;
            }
            state.fcnt_down = fcnt;
            outcome.received = true;
            outcome.ack = frame.fhdr.fctrl.contains(FCtrl::ACK);
            outcome.fpending = frame.fhdr.fctrl.contains(FCtrl::F_PENDING);
            if frame.mtype == MType::ConfirmedDataDown {
                state.ack_pending = true;
            }

            // First class-A downlink confirms the sticky answers.
            state.sticky_answers.clear();

            // MAC commands ride in FOpts, or in the FRMPayload on port 0.
            let mut command_bytes = frame.fhdr.fopts.clone();
            if frame.fport == Some(0) {
                command_bytes.extend_from_slice(&frame.frm_payload);
            }
            match DownlinkMacCommand::parse_all(&command_bytes) {
                Ok(commands) if !commands.is_empty() => {
                    let exec = mac_exec::execute(
                        self.config.region,
                        &mut state,
                        self.config.battery,
                        &commands,
                    );
                    state.pending_answers.extend(exec.answers);
                    for sticky in exec.sticky {
                        state
                            .sticky_answers
                            .retain(|existing| existing.cid() != sticky.cid());
                        state.sticky_answers.push(sticky);
                    }
                    drop(state);
                    for note in exec.notes {
                        self.emit(EventKind::MacCommand, note);
                    }
                    self.emit(
                        EventKind::MacCommand,
                        format!("executed {} MAC command(s)", commands.len()),
                    );
                    None
                }
                Ok(_) => {
                    drop(state);
                    match frame.fport {
                        Some(fport) if fport > 0 => Some((fport, frame.frm_payload.clone())),
                        _ => None,
                    }
                }
                Err(err) => {
                    drop(state);
                    self.emit(EventKind::Error, format!("MAC command rejected: {err}"));
                    None
                }
            }
        };

        // Application payloads are offered to the codec for side effects.
        if let Some((fport, bytes)) = decode_for_codec {
            if let (Some(codec), Some(codec_id)) = (&self.codec, self.config.codec_id) {
                let view = {
                    let state = self.state.lock().await;
                    CodecDeviceView {
                        dev_eui: self.config.dev_eui,
                        battery: self.config.battery,
                        data_rate: state.data_rate,
                        fcnt_up: state.fcnt_up,
                    }
                };
                if let Err(err) = codec
                    .decode(codec_id, self.config.dev_eui, &bytes, fport, &view)
                    .await
                {
                    warn!("{}: codec decode failed: {err}", self.config.name);
                }
            }
        }

        self.emit(EventKind::Downlink, "downlink received");
        outcome
    }

    // ------------------------------------------------------------------
    // Class switching
    // ------------------------------------------------------------------

    /// Promotes the device to its best supported class, spawning the
    /// matching background listener on first switch.
    async fn switch_class_if_needed(&self) {
        let target = if self.config.supports_class_c {
            DeviceClass::C
        } else if self.config.supports_class_b {
            DeviceClass::B
        } else {
            DeviceClass::A
        };
        let switched = {
            let mut state = self.state.lock().await;
            if state.class == target {
                false
            } else {
                state.class = target;
                true
            }
        };
        if !switched {
            return;
        }
        self.emit(EventKind::ClassSwitch, format!("switched to class {target:?}"));
        match target {
            DeviceClass::C => self.spawn_class_c_listener(),
            DeviceClass::B => self.spawn_class_b_listener(),
            DeviceClass::A => {}
        }
    }

    /// Class C: RX2 stays open through a background registration that
    /// re-arms itself after every delivery or timeout.
    fn spawn_class_c_listener(&self) {
        let device = match self.self_arc() {
            Some(device) => device,
            None => return,
        };
        tokio::spawn(async move {
            let mut stop_rx = device.running.subscribe();
            while device.can_execute() {
                let frequency = device.state.lock().await.rx2_frequency;
                device
                    .forwarder
                    .register(frequency, device.config.dev_eui, device.slot.clone());
                let received = tokio::select! {
                    phy = device.slot.recv(CLASS_C_WINDOW) => phy,
                    _ = stop_rx.changed() => None,
                };
                device
                    .forwarder
                    .unregister(frequency, device.config.dev_eui);
                if let Some(phy) = received {
                    device.process_downlink(&phy).await;
                }
            }
        });
    }

    /// Class B: periodic ping slots on the RX2 parameters. Beacon
    /// acquisition is not modeled; the cadence is fixed.
    fn spawn_class_b_listener(&self) {
        let device = match self.self_arc() {
            Some(device) => device,
            None => return,
        };
        tokio::spawn(async move {
            let mut stop_rx = device.running.subscribe();
            while device.can_execute() {
                tokio::select! {
                    _ = tokio::time::sleep(PING_SLOT_PERIOD) => {}
                    _ = stop_rx.changed() => continue,
                }
                if !device.can_execute() {
                    return;
                }
                let frequency = device.state.lock().await.rx2_frequency;
                device
                    .forwarder
                    .register(frequency, device.config.dev_eui, device.slot.clone());
                let received = device.slot.recv(RX_WINDOW).await;
                device
                    .forwarder
                    .unregister(frequency, device.config.dev_eui);
                if let Some(phy) = received {
                    device.process_downlink(&phy).await;
                }
            }
        });
    }

    fn emit(&self, kind: EventKind, message: impl Into<String>) {
        self.broker.publish_device(
            self.config.dev_eui,
            Event::device(self.config.dev_eui, kind, message),
        );
    }
}

/// Drains pending answers (and copies sticky ones) into an FOpts block,
/// enforcing the 15-command / 15-byte budget.
fn drain_fopts(state: &mut DeviceState) -> Vec<u8> {
    let mut commands: Vec<UplinkMacCommand> = state.sticky_answers.clone();
    commands.extend(state.pending_answers.drain(..));

    let mut out = Vec::new();
    let mut taken = 0usize;
    for command in commands {
        let bytes = command.to_bytes();
        if taken >= MAX_FOPTS_COMMANDS || out.len() + bytes.len() > MAX_FOPTS_LEN {
            warn!("FOpts budget exceeded, dropping remaining MAC answers");
            break;
        }
        out.extend_from_slice(&bytes);
        taken += 1;
    }
    out
}

impl Device {
    fn self_arc(&self) -> Option<Arc<Device>> {
        self.weak.upgrade()
    }
}

/// Scheduler job driving one device step per firing.
pub struct DeviceStepJob {
    device: Arc<Device>,
}

impl DeviceStepJob {
    pub fn new(device: Arc<Device>) -> Self {
        DeviceStepJob { device }
    }
}

#[async_trait]
impl JobExecutor for DeviceStepJob {
    async fn execute(&self) {
        self.device.step().await;
    }
}
