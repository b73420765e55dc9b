//! Hub manager integration tests against the simulated bus
//!
//! Covers:
//! - One reset per connection, not one per change bit
//! - Over-current on one port leaves its siblings alone
//! - Devices behind an external hub, enumerated in parallel
//! - Hot-plug behind a hub via the status-change endpoint
//! - Unplugging a hub tears down its subtree
//!
//! Run with: `cargo test -p host --test hub_tests`

use common::UsbEvent;
use host::sim::{PortRef, SimNodeId};
use host::{DeviceProfile, EnumerationSettings, SchedulerSettings, SimController, UsbController};
use protocol::{ControllerId, DeviceId, DeviceSpeed, class};
use std::collections::HashSet;
use std::sync::Arc;

// ============================================================================
// Test Utilities
// ============================================================================

fn controller(sim: &Arc<SimController>) -> (UsbController, async_channel::Receiver<UsbEvent>) {
    let (tx, rx) = async_channel::unbounded();
    let controller = UsbController::new(
        ControllerId(1),
        sim.clone(),
        SchedulerSettings::ehci(),
        EnumerationSettings::immediate(),
        Some(tx),
    );
    controller.start().unwrap();
    (controller, rx)
}

fn drain(events: &async_channel::Receiver<UsbEvent>) -> Vec<UsbEvent> {
    std::iter::from_fn(|| events.try_recv().ok()).collect()
}

/// Root port 1: a four-port high-speed hub
fn with_hub(sim: &SimController) -> SimNodeId {
    sim.attach_root(1, DeviceProfile::hub(DeviceSpeed::High, 4))
        .unwrap()
}

fn hub_id(controller: &UsbController) -> DeviceId {
    controller
        .list_devices()
        .into_iter()
        .find(|d| d.class == class::HUB)
        .map(|d| d.id)
        .expect("hub not enumerated")
}

// ============================================================================
// Reset sequencing
// ============================================================================

#[test]
fn test_single_reset_per_connection() {
    let sim = Arc::new(SimController::new("sim", 2));
    let (controller, _events) = controller(&sim);
    let hub = with_hub(&sim);
    sim.attach(PortRef::hub(hub, 2), DeviceProfile::keyboard(DeviceSpeed::Low))
        .unwrap();

    let devices = controller.scan().unwrap();
    assert_eq!(devices.len(), 2);
    assert_eq!(sim.resets(PortRef::root(1)), 1);
    assert_eq!(sim.resets(PortRef::hub(hub, 2)), 1);

    // C_PORT_CONNECTION and C_PORT_RESET are both acknowledged
    let status = sim.port_status(PortRef::hub(hub, 2)).unwrap();
    assert!(status.enabled());
    assert!(!status.has_changes());

    // Nothing left to service
    controller.poll();
    assert_eq!(sim.resets(PortRef::hub(hub, 2)), 1);
    assert_eq!(controller.list_devices().len(), 2);
}

// ============================================================================
// Over-current
// ============================================================================

#[test]
fn test_over_current_isolated_to_port() {
    let sim = Arc::new(SimController::new("sim", 2));
    let (controller, events) = controller(&sim);
    sim.attach_root(1, DeviceProfile::keyboard(DeviceSpeed::Low))
        .unwrap();
    sim.attach_root(2, DeviceProfile::mouse(DeviceSpeed::Full))
        .unwrap();
    assert_eq!(controller.scan().unwrap().len(), 2);
    drain(&events);

    sim.inject_over_current(PortRef::root(2));
    controller.poll();

    let devices = controller.list_devices();
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].port, 1);
    assert_eq!(devices[0].state, "active");

    let root = controller.hub_state(None).unwrap();
    assert!(root.slot(2).unwrap().over_current);
    assert!(root.slot(2).unwrap().device.is_none());
    assert!(!root.slot(1).unwrap().over_current);
    assert!(!sim.port_status(PortRef::root(2)).unwrap().enabled());
    assert!(sim.port_status(PortRef::root(1)).unwrap().enabled());

    let events = drain(&events);
    assert!(events.iter().any(|e| matches!(
        e,
        UsbEvent::PortOverCurrent { hub: None, port: 2, .. }
    )));
    assert!(events.iter().any(|e| matches!(e, UsbEvent::DeviceRemoved { .. })));
}

// ============================================================================
// External hubs
// ============================================================================

#[test]
fn test_devices_behind_hub() {
    let sim = Arc::new(SimController::new("sim", 2));
    let (controller, _events) = controller(&sim);
    let hub = with_hub(&sim);
    sim.attach(PortRef::hub(hub, 1), DeviceProfile::mouse(DeviceSpeed::Full))
        .unwrap();
    sim.attach(PortRef::hub(hub, 3), DeviceProfile::keyboard(DeviceSpeed::Low))
        .unwrap();
    sim.attach(PortRef::hub(hub, 4), DeviceProfile::storage(DeviceSpeed::High))
        .unwrap();

    let devices = controller.scan().unwrap();
    assert_eq!(devices.len(), 4);

    let hub_id = hub_id(&controller);
    let hub_info = controller.device_info(hub_id).unwrap();
    assert_eq!(hub_info.driver.as_deref(), Some("hub"));
    // Status-change endpoint is periodic
    assert_eq!(hub_info.reservations, 1);

    let children: Vec<_> = devices.iter().filter(|d| d.parent == Some(hub_id)).collect();
    assert_eq!(children.len(), 3);
    let ports: HashSet<u8> = children.iter().map(|d| d.port).collect();
    assert_eq!(ports, HashSet::from([1, 3, 4]));
    assert!(children.iter().all(|d| d.state == "active"));

    let addresses: HashSet<u8> = devices.iter().map(|d| d.address).collect();
    assert_eq!(addresses.len(), 4);
    assert!(!addresses.contains(&0));

    let state = controller.hub_state(Some(hub_id)).unwrap();
    assert_eq!(state.port_count(), 4);
    assert_eq!(state.devices().len(), 3);
}

#[test]
fn test_hot_plug_behind_hub() {
    let sim = Arc::new(SimController::new("sim", 1));
    let (controller, events) = controller(&sim);
    let hub = with_hub(&sim);
    controller.scan().unwrap();
    let hub_id = hub_id(&controller);
    drain(&events);

    // Nothing changed yet: the status-change endpoint NAKs
    controller.poll();
    assert_eq!(controller.list_devices().len(), 1);

    let mouse = sim
        .attach(PortRef::hub(hub, 2), DeviceProfile::mouse(DeviceSpeed::Full))
        .unwrap();
    controller.poll();

    let devices = controller.list_devices();
    assert_eq!(devices.len(), 2);
    let mouse_info = devices.iter().find(|d| d.parent == Some(hub_id)).unwrap();
    assert_eq!(mouse_info.port, 2);
    assert_eq!(mouse_info.driver.as_deref(), Some("hid-boot"));

    sim.detach(mouse);
    controller.poll();
    assert_eq!(controller.list_devices().len(), 1);

    let events = drain(&events);
    assert!(matches!(events[0], UsbEvent::DeviceActivated { .. }));
    assert!(matches!(
        events[1],
        UsbEvent::DeviceRemoved {
            released_reservations: 1,
            ..
        }
    ));
}

#[test]
fn test_hub_unplug_removes_subtree() {
    let sim = Arc::new(SimController::new("sim", 2));
    let (controller, events) = controller(&sim);
    let hub = with_hub(&sim);
    sim.attach(PortRef::hub(hub, 1), DeviceProfile::keyboard(DeviceSpeed::Low))
        .unwrap();
    sim.attach(PortRef::hub(hub, 2), DeviceProfile::webcam(DeviceSpeed::High))
        .unwrap();
    sim.attach_root(2, DeviceProfile::mouse(DeviceSpeed::Full))
        .unwrap();

    assert_eq!(controller.scan().unwrap().len(), 4);
    let reserved = controller.scheduler().reservation_count();
    drain(&events);

    sim.detach(hub);
    controller.poll();

    let devices = controller.list_devices();
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].port, 2);
    assert_eq!(devices[0].parent, None);
    assert!(controller.hub_state(Some(hub_id_of_removed(&events))).is_none());

    // Only the root mouse still holds bandwidth
    assert_eq!(controller.scheduler().reservation_count(), 1);
    assert!(reserved > 1);
}

/// Id of the last device reported removed
fn hub_id_of_removed(events: &async_channel::Receiver<UsbEvent>) -> DeviceId {
    drain(events)
        .into_iter()
        .filter_map(|e| match e {
            UsbEvent::DeviceRemoved { device, .. } => Some(device),
            _ => None,
        })
        .last()
        .expect("no removal reported")
}
