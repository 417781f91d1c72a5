//! # Simulator Orchestrator
//!
//! Owns the lifecycle of every runtime component: the entity
//! collections, the routing fabric, the optional shared scheduler, the
//! event broker, and the bridge address virtual gateways dial. The
//! public methods here are the contract an external control surface
//! programs against.

pub mod storage;

use std::collections::HashMap;
use std::sync::Arc;

use log::{info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::SimulatorConfig;
use crate::device::state::DeviceConfig;
use crate::device::{Device, DeviceStepJob};
use crate::error::SimulatorError;
use crate::event::{Event, EventBroker, EventKind};
use crate::forwarder::Forwarder;
use crate::gateway::{Gateway, GatewayConfig};
use crate::lorawan::commands::UplinkMacCommand;
use crate::lorawan::region::Region;
use crate::scheduler::TickWheel;
use crate::util::geo::Location;

pub use storage::Storage;

/// An external system notified of device traffic (managed here, used by
/// the boundary layers).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Integration {
    pub id: u64,
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub token: String,
}

/// A reusable device blueprint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceTemplate {
    pub id: i64,
    pub name: String,
    pub region: Region,
    pub uplink_interval_secs: u64,
    #[serde(with = "hex::serde")]
    pub payload: Vec<u8>,
    pub fport: u8,
    pub range_m: f64,
}

/// How a running device is being driven.
enum DeviceDriver {
    Task(JoinHandle<()>),
    Job(u64),
}

#[derive(Default)]
struct Collections {
    devices: HashMap<u64, Arc<Device>>,
    gateways: HashMap<u64, Arc<Gateway>>,
    integrations: HashMap<u64, Integration>,
    templates: HashMap<i64, DeviceTemplate>,
    drivers: HashMap<u64, DeviceDriver>,
    next_device_id: u64,
    next_gateway_id: u64,
    running: bool,
}

/// The simulation runtime.
pub struct Simulator {
    config: SimulatorConfig,
    forwarder: Arc<Forwarder>,
    broker: Arc<EventBroker>,
    scheduler: Mutex<Option<Arc<TickWheel>>>,
    collections: Mutex<Collections>,
}

impl Simulator {
    pub fn new(config: SimulatorConfig) -> Self {
        let forwarder = Arc::new(Forwarder::new(config.performance.forwarder_shards));
        let broker = Arc::new(EventBroker::new(config.retention.clone()));
        Simulator {
            config,
            forwarder,
            broker,
            scheduler: Mutex::new(None),
            collections: Mutex::new(Collections {
                next_device_id: 1,
                next_gateway_id: 1,
                ..Collections::default()
            }),
        }
    }

    /// Builds a simulator from the persisted state files in `storage`.
    pub async fn from_storage(storage: &Storage) -> Result<Self, SimulatorError> {
        let config = storage.load_simulator()?;
        let simulator = Simulator::new(config);

        for gateway in storage.load_gateways()? {
            simulator.add_gateway(gateway).await?;
        }
        for device in storage.load_devices()? {
            simulator.add_device(device).await?;
        }
        {
            let mut collections = simulator.collections.lock().await;
            for integration in storage.load_integrations()? {
                collections.integrations.insert(integration.id, integration);
            }
            for template in storage.load_templates()? {
                collections.templates.insert(template.id, template);
            }
        }
        Ok(simulator)
    }

    pub fn broker(&self) -> Arc<EventBroker> {
        self.broker.clone()
    }

    pub fn forwarder(&self) -> Arc<Forwarder> {
        self.forwarder.clone()
    }

    pub fn config(&self) -> &SimulatorConfig {
        &self.config
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Starts every active gateway and device.
    pub async fn run(&self) -> Result<(), SimulatorError> {
        let mut collections = self.collections.lock().await;
        if collections.running {
            return Ok(());
        }

        if self.config.performance.use_scheduler {
            let mut scheduler = self.scheduler.lock().await;
            if scheduler.is_none() {
                *scheduler = Some(Arc::new(TickWheel::new(
                    self.config.performance.scheduler_resolution(),
                    64,
                    self.config.performance.worker_count,
                    self.config.performance.work_queue_size,
                )));
            }
        }

        // Gateways first, so the fabric can link devices to them.
        let gateways: Vec<Arc<Gateway>> = collections
            .gateways
            .values()
            .filter(|gw| gw.config().active)
            .cloned()
            .collect();
        for gateway in gateways {
            self.start_gateway(&gateway).await?;
        }

        let devices: Vec<Arc<Device>> = collections
            .devices
            .values()
            .filter(|dev| dev.config().active)
            .cloned()
            .collect();
        for device in devices {
            self.start_device(&device, &mut collections).await;
        }

        collections.running = true;
        drop(collections);
        info!("simulator running");
        self.broker
            .publish_system(Event::system(EventKind::Started, "simulator running"));
        Ok(())
    }

    /// Tears everything down: devices, then gateways, then the
    /// scheduler. Each stage completes before the next begins.
    pub async fn stop(&self) {
        let mut collections = self.collections.lock().await;
        if !collections.running {
            return;
        }

        let device_ids: Vec<u64> = collections.devices.keys().copied().collect();
        for id in device_ids {
            self.stop_device_by_id(id, &mut collections).await;
        }

        let gateways: Vec<Arc<Gateway>> = collections.gateways.values().cloned().collect();
        for gateway in gateways {
            gateway.stop().await;
            self.forwarder.delete_gateway(gateway.mac());
        }

        collections.running = false;
        drop(collections);

        let scheduler = self.scheduler.lock().await.take();
        if let Some(scheduler) = scheduler {
            scheduler.stop().await;
        }

        info!("simulator stopped");
        self.broker
            .publish_system(Event::system(EventKind::Stopped, "simulator stopped"));
    }

    async fn start_gateway(&self, gateway: &Arc<Gateway>) -> Result<(), SimulatorError> {
        self.forwarder.add_gateway(
            gateway.mac(),
            gateway.queue(),
            gateway.config().location,
        );
        gateway.start(&self.config.bridge_address).await
    }

    async fn start_device(&self, device: &Arc<Device>, collections: &mut Collections) {
        let location = device.location().await;
        self.forwarder
            .add_device(device.dev_eui(), location, device.config().range_m);
        device.start();

        let scheduler = self.scheduler.lock().await.clone();
        let driver = match scheduler {
            Some(scheduler) => {
                let job = scheduler.schedule(
                    device.config().uplink_interval(),
                    Arc::new(DeviceStepJob::new(device.clone())),
                );
                DeviceDriver::Job(job)
            }
            None => DeviceDriver::Task(device.run()),
        };
        collections.drivers.insert(device.config().id, driver);
    }

    async fn stop_device_by_id(&self, id: u64, collections: &mut Collections) {
        let Some(device) = collections.devices.get(&id).cloned() else {
            return;
        };
        device.stop();
        match collections.drivers.remove(&id) {
            Some(DeviceDriver::Task(handle)) => {
                let _ = handle.await;
            }
            Some(DeviceDriver::Job(job)) => {
                if let Some(scheduler) = self.scheduler.lock().await.as_ref() {
                    scheduler.remove(job);
                }
            }
            None => {}
        }
        self.forwarder.delete_device(device.dev_eui());
    }

    // ------------------------------------------------------------------
    // Device CRUD
    // ------------------------------------------------------------------

    /// Adds a device. Name and EUI must be unique across devices and
    /// gateways.
    pub async fn add_device(&self, config: DeviceConfig) -> Result<u64, SimulatorError> {
        self.add_device_with_codec(config, None).await
    }

    /// Adds a device wired to a payload codec capability.
    pub async fn add_device_with_codec(
        &self,
        mut config: DeviceConfig,
        codec: Option<Arc<dyn crate::device::codec::PayloadCodec>>,
    ) -> Result<u64, SimulatorError> {
        let mut collections = self.collections.lock().await;
        validate_device(&config, &collections, None)?;

        if config.id == 0 {
            config.id = collections.next_device_id;
        }
        collections.next_device_id = collections.next_device_id.max(config.id + 1);
        let id = config.id;

        let device = Device::new(
            config,
            self.forwarder.clone(),
            self.broker.clone(),
            codec,
        );
        let running = collections.running;
        let active = device.config().active;
        collections.devices.insert(id, device.clone());
        if running && active {
            self.start_device(&device, &mut collections).await;
        }
        Ok(id)
    }

    /// Replaces a device definition, re-linking the fabric if running.
    pub async fn update_device(&self, config: DeviceConfig) -> Result<(), SimulatorError> {
        let mut collections = self.collections.lock().await;
        if !collections.devices.contains_key(&config.id) {
            return Err(SimulatorError::NotFound {
                kind: "device",
                id: config.id,
            });
        }
        validate_device(&config, &collections, Some(config.id))?;

        let id = config.id;
        self.stop_device_by_id(id, &mut collections).await;
        if let Some(old) = collections.devices.remove(&id) {
            self.broker.remove_device(old.dev_eui());
        }

        let device = Device::new(
            config,
            self.forwarder.clone(),
            self.broker.clone(),
            None,
        );
        let running = collections.running;
        let active = device.config().active;
        collections.devices.insert(id, device.clone());
        if running && active {
            self.start_device(&device, &mut collections).await;
        }
        Ok(())
    }

    pub async fn delete_device(&self, id: u64) -> Result<(), SimulatorError> {
        let mut collections = self.collections.lock().await;
        if !collections.devices.contains_key(&id) {
            return Err(SimulatorError::NotFound { kind: "device", id });
        }
        self.stop_device_by_id(id, &mut collections).await;
        if let Some(device) = collections.devices.remove(&id) {
            self.broker.remove_device(device.dev_eui());
        }
        Ok(())
    }

    /// Atomic on/off for one device.
    pub async fn toggle_device(&self, id: u64) -> Result<bool, SimulatorError> {
        let mut collections = self.collections.lock().await;
        let device = collections
            .devices
            .get(&id)
            .cloned()
            .ok_or(SimulatorError::NotFound { kind: "device", id })?;
        if device.can_execute() {
            self.stop_device_by_id(id, &mut collections).await;
            Ok(false)
        } else {
            self.start_device(&device, &mut collections).await;
            Ok(true)
        }
    }

    // ------------------------------------------------------------------
    // Gateway CRUD
    // ------------------------------------------------------------------

    pub async fn add_gateway(&self, mut config: GatewayConfig) -> Result<u64, SimulatorError> {
        let mut collections = self.collections.lock().await;
        validate_gateway(&config, &collections, None)?;

        if config.id == 0 {
            config.id = collections.next_gateway_id;
        }
        collections.next_gateway_id = collections.next_gateway_id.max(config.id + 1);
        let id = config.id;

        let gateway = Gateway::new(
            config,
            self.config.performance.uplink_buffer_size,
            self.forwarder.clone(),
            self.broker.clone(),
        );
        let running = collections.running;
        let active = gateway.config().active;
        collections.gateways.insert(id, gateway.clone());
        drop(collections);
        if running && active {
            self.start_gateway(&gateway).await?;
        }
        Ok(id)
    }

    pub async fn update_gateway(&self, config: GatewayConfig) -> Result<(), SimulatorError> {
        let id = config.id;
        {
            let collections = self.collections.lock().await;
            if !collections.gateways.contains_key(&id) {
                return Err(SimulatorError::NotFound { kind: "gateway", id });
            }
            validate_gateway(&config, &collections, Some(id))?;
        }
        self.delete_gateway(id).await?;
        self.add_gateway(config).await?;
        Ok(())
    }

    pub async fn delete_gateway(&self, id: u64) -> Result<(), SimulatorError> {
        let gateway = {
            let mut collections = self.collections.lock().await;
            collections
                .gateways
                .remove(&id)
                .ok_or(SimulatorError::NotFound { kind: "gateway", id })?
        };
        gateway.stop().await;
        self.forwarder.delete_gateway(gateway.mac());
        self.broker.remove_gateway(gateway.mac());
        Ok(())
    }

    pub async fn toggle_gateway(&self, id: u64) -> Result<bool, SimulatorError> {
        let gateway = {
            let collections = self.collections.lock().await;
            collections
                .gateways
                .get(&id)
                .cloned()
                .ok_or(SimulatorError::NotFound { kind: "gateway", id })?
        };
        if gateway.can_execute() {
            gateway.stop().await;
            self.forwarder.delete_gateway(gateway.mac());
            Ok(false)
        } else {
            self.start_gateway(&gateway).await?;
            Ok(true)
        }
    }

    // ------------------------------------------------------------------
    // Device forwarding operations
    // ------------------------------------------------------------------

    async fn device(&self, id: u64) -> Result<Arc<Device>, SimulatorError> {
        let collections = self.collections.lock().await;
        collections
            .devices
            .get(&id)
            .cloned()
            .ok_or(SimulatorError::NotFound { kind: "device", id })
    }

    /// Queues a device-originated MAC command for the next uplink.
    pub async fn send_mac_command(
        &self,
        id: u64,
        command: UplinkMacCommand,
    ) -> Result<(), SimulatorError> {
        self.device(id).await?.send_mac_command(command).await;
        Ok(())
    }

    /// Replaces a device's static payload.
    pub async fn change_payload(
        &self,
        id: u64,
        payload: Vec<u8>,
        fport: u8,
    ) -> Result<(), SimulatorError> {
        self.device(id).await?.change_payload(payload, fport).await;
        Ok(())
    }

    /// Queues a one-shot uplink.
    pub async fn send_uplink(&self, id: u64, payload: Vec<u8>) -> Result<(), SimulatorError> {
        self.device(id).await?.enqueue_uplink(payload).await;
        Ok(())
    }

    /// Moves a device and re-links the routing fabric.
    pub async fn change_location(
        &self,
        id: u64,
        location: Location,
    ) -> Result<(), SimulatorError> {
        let device = self.device(id).await?;
        device.change_location(location).await;
        self.forwarder
            .update_device(device.dev_eui(), location, device.config().range_m);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Integrations and templates
    // ------------------------------------------------------------------

    pub async fn add_integration(&self, integration: Integration) -> Result<(), SimulatorError> {
        let mut collections = self.collections.lock().await;
        if collections
            .integrations
            .values()
            .any(|existing| existing.name == integration.name)
        {
            return Err(SimulatorError::Validation(format!(
                "integration name {:?} already in use",
                integration.name
            )));
        }
        collections.integrations.insert(integration.id, integration);
        Ok(())
    }

    pub async fn delete_integration(&self, id: u64) -> Result<(), SimulatorError> {
        let mut collections = self.collections.lock().await;
        collections
            .integrations
            .remove(&id)
            .map(|_| ())
            .ok_or(SimulatorError::NotFound {
                kind: "integration",
                id,
            })
    }

    pub async fn add_template(&self, template: DeviceTemplate) -> Result<(), SimulatorError> {
        let mut collections = self.collections.lock().await;
        collections.templates.insert(template.id, template);
        Ok(())
    }

    pub async fn template(&self, id: i64) -> Option<DeviceTemplate> {
        self.collections.lock().await.templates.get(&id).cloned()
    }

    // ------------------------------------------------------------------
    // Event helpers
    // ------------------------------------------------------------------

    pub fn emit_system(&self, kind: EventKind, message: impl Into<String>) {
        self.broker.publish_system(Event::system(kind, message));
    }

    pub fn emit_error(&self, message: impl Into<String>) {
        let message = message.into();
        warn!("{message}");
        self.broker
            .publish_system(Event::system(EventKind::Error, message));
    }
}

fn validate_device(
    config: &DeviceConfig,
    collections: &Collections,
    allow_id: Option<u64>,
) -> Result<(), SimulatorError> {
    for (id, existing) in &collections.devices {
        if Some(*id) == allow_id {
            continue;
        }
        if existing.config().name == config.name {
            return Err(SimulatorError::Validation(format!(
                "device name {:?} already in use",
                config.name
            )));
        }
        if existing.dev_eui() == config.dev_eui {
            return Err(SimulatorError::Validation(format!(
                "devEUI {:016x} already in use",
                config.dev_eui
            )));
        }
    }
    for gateway in collections.gateways.values() {
        if gateway.config().name == config.name {
            return Err(SimulatorError::Validation(format!(
                "name {:?} already used by a gateway",
                config.name
            )));
        }
        if gateway.mac() == config.dev_eui {
            return Err(SimulatorError::Validation(format!(
                "identifier {:016x} already used by a gateway",
                config.dev_eui
            )));
        }
    }
    Ok(())
}

fn validate_gateway(
    config: &GatewayConfig,
    collections: &Collections,
    allow_id: Option<u64>,
) -> Result<(), SimulatorError> {
    for (id, existing) in &collections.gateways {
        if Some(*id) == allow_id {
            continue;
        }
        if existing.config().name == config.name {
            return Err(SimulatorError::Validation(format!(
                "gateway name {:?} already in use",
                config.name
            )));
        }
        if existing.mac() == config.mac {
            return Err(SimulatorError::Validation(format!(
                "MAC {:016x} already in use",
                config.mac
            )));
        }
    }
    for device in collections.devices.values() {
        if device.config().name == config.name {
            return Err(SimulatorError::Validation(format!(
                "name {:?} already used by a device",
                config.name
            )));
        }
        if device.dev_eui() == config.mac {
            return Err(SimulatorError::Validation(format!(
                "identifier {:016x} already used by a device",
                config.mac
            )));
        }
    }
    Ok(())
}
