//! Orchestrator contract: uniqueness validation across collections,
//! toggling, location changes re-linking the fabric, storage loading.


use lwnsim::util::geo::Location;
use lwnsim::{Simulator, SimulatorConfig, SimulatorError, Storage};
use mock_support::{abp_device, test_location, virtual_gateway};
use tokio_test::assert_ok;

fn simulator() -> Simulator {
    Simulator::new(SimulatorConfig::default())
}

#[tokio::test]
async fn duplicate_device_names_and_euis_are_rejected() {
    let simulator = simulator();
    simulator.add_device(abp_device(1, 0xD1)).await.unwrap();

    let mut same_name = abp_device(2, 0xD2);
    same_name.name = "device-1".into();
    assert!(matches!(
        simulator.add_device(same_name).await,
        Err(SimulatorError::Validation(_))
    ));

    let same_eui = abp_device(3, 0xD1);
    assert!(matches!(
        simulator.add_device(same_eui).await,
        Err(SimulatorError::Validation(_))
    ));
}

#[tokio::test]
async fn identifiers_are_unique_across_devices_and_gateways() {
    let simulator = simulator();
    simulator
        .add_gateway(virtual_gateway(1, 0xAB, test_location()))
        .await
        .unwrap();

    // A device reusing the gateway's 64-bit identifier is refused.
    let clash = abp_device(1, 0xAB);
    assert!(matches!(
        simulator.add_device(clash).await,
        Err(SimulatorError::Validation(_))
    ));

    // And a gateway reusing a device name is refused.
    simulator.add_device(abp_device(2, 0xD2)).await.unwrap();
    let mut gateway = virtual_gateway(2, 0xAC, test_location());
    gateway.name = "device-2".into();
    assert!(matches!(
        simulator.add_gateway(gateway).await,
        Err(SimulatorError::Validation(_))
    ));
}

#[tokio::test]
async fn toggle_device_flips_running_state() {
    let simulator = simulator();
    let id = simulator.add_device(abp_device(1, 0xD1)).await.unwrap();

    assert!(simulator.toggle_device(id).await.unwrap());
    assert!(!simulator.toggle_device(id).await.unwrap());
    assert!(matches!(
        simulator.toggle_device(999).await,
        Err(SimulatorError::NotFound { .. })
    ));
}

#[tokio::test]
async fn change_location_relinks_the_fabric() {
    let simulator = simulator();
    let mut config = abp_device(1, 0xD1);
    config.location = Location::new(0.0, 0.0, 0); // nowhere near the gateway
    let id = simulator.add_device(config).await.unwrap();

    // Fabric membership normally appears when entities start; seed it
    // directly to observe the re-link.
    let fabric = simulator.forwarder();
    let queue = std::sync::Arc::new(lwnsim::util::queue::UplinkQueue::new(16));
    fabric.add_gateway(0xA1, queue, test_location());
    fabric.add_device(0xD1, Location::new(0.0, 0.0, 0), 5000.0);
    assert!(!fabric.linked(0xD1, 0xA1));

    simulator
        .change_location(id, test_location())
        .await
        .unwrap();
    assert!(fabric.linked(0xD1, 0xA1));
}

#[tokio::test]
async fn from_storage_loads_all_collections() {
    let dir = tempfile::tempdir().unwrap();
    let storage = Storage::new(dir.path());
    storage.save_simulator(&SimulatorConfig::default()).unwrap();
    storage
        .save_devices(&[abp_device(1, 0xD1), abp_device(2, 0xD2)])
        .unwrap();
    storage
        .save_gateways(&[virtual_gateway(1, 0xA1, test_location())])
        .unwrap();

    let simulator = Simulator::from_storage(&storage).await.unwrap();
    // Entities are addressable through the public operations.
    assert_ok!(simulator.toggle_device(1).await);
    assert_ok!(simulator.toggle_device(2).await);
    assert_ok!(simulator.delete_gateway(1).await);
}

#[tokio::test]
async fn delete_device_clears_broker_topic() {
    let simulator = simulator();
    let id = simulator.add_device(abp_device(1, 0xD7)).await.unwrap();

    let broker = simulator.broker();
    let topic = lwnsim::event::device_topic(0xD7);
    let (mut rx, _, _handle) = broker.subscribe(&topic);

    simulator.delete_device(id).await.unwrap();
    assert!(rx.recv().await.is_none(), "subscription survived deletion");
}
