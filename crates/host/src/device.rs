//! USB device model
//!
//! A `UsbDevice` is the controller's record of one attached function: its
//! address, speed, position in the topology, descriptors and the endpoint set
//! of the active configuration. Records live in a per-controller
//! `DeviceTable` arena keyed by `DeviceId`; hubs refer to children by id.

use crate::control::ControlTarget;
use crate::{lock, read, write};
use common::{DeviceInfo, Error, Result};
use protocol::{
    Configuration, ControllerId, DataToggle, DeviceDescriptor, DeviceId, DeviceSpeed,
    EndpointDescriptor, HidDescriptor, InterfaceSetting, ScheduleHandle,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};

/// Enumeration lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceState {
    /// Connection seen on a port, not yet reset
    Detected,
    /// Reset complete, answering at address 0
    Default,
    /// SET_ADDRESS done
    Addressed,
    /// SET_CONFIGURATION done
    Configured,
    /// Periodic bandwidth reserved, ready for class drivers
    Active,
    /// Terminal
    Removed,
}

impl DeviceState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Detected => "detected",
            Self::Default => "default",
            Self::Addressed => "addressed",
            Self::Configured => "configured",
            Self::Active => "active",
            Self::Removed => "removed",
        }
    }

    /// Forward steps one at a time; anything but `Removed` may be removed
    pub fn can_transition_to(self, next: DeviceState) -> bool {
        use DeviceState::*;
        matches!(
            (self, next),
            (Detected, Default)
                | (Default, Addressed)
                | (Addressed, Configured)
                | (Configured, Active)
                | (Detected | Default | Addressed | Configured | Active, Removed)
        )
    }
}

impl std::fmt::Display for DeviceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Endpoint of the active configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub descriptor: EndpointDescriptor,
    /// Owning interface number
    pub interface: u8,
    pub toggle: DataToggle,
    /// Periodic bandwidth held for this endpoint
    pub reservation: Option<ScheduleHandle>,
}

impl Endpoint {
    pub fn new(descriptor: EndpointDescriptor, interface: u8) -> Self {
        Self {
            descriptor,
            interface,
            toggle: DataToggle::Data0,
            reservation: None,
        }
    }

    pub fn address(&self) -> u8 {
        self.descriptor.address
    }

    pub fn is_periodic(&self) -> bool {
        self.descriptor.transfer_type().is_periodic()
    }
}

/// String descriptors read during enumeration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceStrings {
    pub language: Option<u16>,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
}

#[derive(Debug)]
pub struct UsbDevice {
    id: DeviceId,
    /// Upstream hub; `None` on a root port
    parent: Option<DeviceId>,
    port: u8,
    speed: DeviceSpeed,
    /// 0 until SET_ADDRESS completes
    address: u8,
    state: DeviceState,
    max_packet0: u16,
    descriptor: Option<DeviceDescriptor>,
    configurations: Vec<Configuration>,
    active: Option<usize>,
    endpoints: Vec<Endpoint>,
    pub strings: DeviceStrings,
    hid: Vec<(u8, HidDescriptor)>,
    driver: Option<String>,
}

impl UsbDevice {
    pub fn new(id: DeviceId, parent: Option<DeviceId>, port: u8, speed: DeviceSpeed) -> Self {
        Self {
            id,
            parent,
            port,
            speed,
            address: 0,
            state: DeviceState::Detected,
            max_packet0: speed.bootstrap_max_packet(),
            descriptor: None,
            configurations: Vec::new(),
            active: None,
            endpoints: Vec::new(),
            strings: DeviceStrings::default(),
            hid: Vec::new(),
            driver: None,
        }
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn parent(&self) -> Option<DeviceId> {
        self.parent
    }

    pub fn port(&self) -> u8 {
        self.port
    }

    pub fn speed(&self) -> DeviceSpeed {
        self.speed
    }

    /// Speed is only final once the port reset reports it
    pub fn set_speed(&mut self, speed: DeviceSpeed) {
        self.speed = speed;
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn set_address(&mut self, address: u8) {
        self.address = address;
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn is_removed(&self) -> bool {
        self.state == DeviceState::Removed
    }

    /// Move to `next`, rejecting anything the lifecycle does not allow
    pub fn transition(&mut self, next: DeviceState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::InvalidState {
                device: self.id,
                state: self.state.to_string(),
                operation: format!("enter {}", next),
            });
        }
        tracing::trace!("{} {} -> {}", self.id, self.state, next);
        self.state = next;
        Ok(())
    }

    /// Fail unless the device is currently in `expected`
    pub fn require(&self, expected: DeviceState, operation: &str) -> Result<()> {
        if self.state != expected {
            return Err(Error::InvalidState {
                device: self.id,
                state: self.state.to_string(),
                operation: operation.to_string(),
            });
        }
        Ok(())
    }

    pub fn max_packet0(&self) -> u16 {
        self.max_packet0
    }

    pub fn set_max_packet0(&mut self, max_packet: u16) {
        self.max_packet0 = max_packet;
    }

    /// Endpoint 0 at the device's current address and packet size
    pub fn control_target(&self) -> ControlTarget {
        ControlTarget {
            address: self.address,
            max_packet: self.max_packet0,
            speed: self.speed,
        }
    }

    pub fn descriptor(&self) -> Option<&DeviceDescriptor> {
        self.descriptor.as_ref()
    }

    pub fn set_descriptor(&mut self, descriptor: DeviceDescriptor) {
        self.descriptor = Some(descriptor);
    }

    pub fn configurations(&self) -> &[Configuration] {
        &self.configurations
    }

    pub fn add_configuration(&mut self, configuration: Configuration) {
        self.configurations.push(configuration);
    }

    pub fn active_configuration(&self) -> Option<&Configuration> {
        self.active.and_then(|i| self.configurations.get(i))
    }

    /// `bConfigurationValue` of the active configuration, 0 when unconfigured
    pub fn configuration_value(&self) -> u8 {
        self.active_configuration()
            .map(|c| c.header.configuration_value)
            .unwrap_or(0)
    }

    /// Make `configurations[index]` active
    ///
    /// Rebuilds the endpoint set from alternate setting 0 of every interface;
    /// every toggle starts at DATA0 and no endpoint holds a reservation.
    pub fn activate_configuration(&mut self, index: usize) -> Result<u8> {
        let configuration = self.configurations.get(index).ok_or_else(|| Error::InvalidState {
            device: self.id,
            state: self.state.to_string(),
            operation: format!("select configuration #{}", index),
        })?;
        let value = configuration.header.configuration_value;

        let mut endpoints = Vec::new();
        let mut hid = Vec::new();
        for setting in configuration.default_settings() {
            let number = setting.interface.interface_number;
            endpoints.extend(
                setting
                    .endpoints
                    .iter()
                    .cloned()
                    .map(|ep| Endpoint::new(ep, number)),
            );
            if let Some(descriptor) = setting.hid {
                hid.push((number, descriptor));
            }
        }

        self.active = Some(index);
        self.endpoints = endpoints;
        self.hid = hid;
        Ok(value)
    }

    /// Interface settings in use
    pub fn interfaces(&self) -> Vec<InterfaceSetting> {
        self.active_configuration()
            .map(|c| c.default_settings())
            .unwrap_or_default()
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    pub fn endpoints_mut(&mut self) -> &mut [Endpoint] {
        &mut self.endpoints
    }

    pub fn endpoint_mut(&mut self, address: u8) -> Option<&mut Endpoint> {
        self.endpoints.iter_mut().find(|e| e.address() == address)
    }

    /// Reset every toggle to DATA0 (after SET_CONFIGURATION or SET_INTERFACE)
    pub fn reset_toggles(&mut self) {
        for endpoint in &mut self.endpoints {
            endpoint.toggle = DataToggle::Data0;
        }
    }

    pub fn reservations(&self) -> Vec<ScheduleHandle> {
        self.endpoints.iter().filter_map(|e| e.reservation).collect()
    }

    /// Detach every reservation from its endpoint, handing them to the caller
    pub fn take_reservations(&mut self) -> Vec<ScheduleHandle> {
        self.endpoints
            .iter_mut()
            .filter_map(|e| e.reservation.take())
            .collect()
    }

    /// HID class descriptors of the active configuration, by interface
    pub fn hid_descriptors(&self) -> &[(u8, HidDescriptor)] {
        &self.hid
    }

    pub fn driver(&self) -> Option<&str> {
        self.driver.as_deref()
    }

    pub fn bind_driver(&mut self, name: &str) {
        self.driver = Some(name.to_string());
    }

    /// Device class, falling back to the first interface when deferred
    pub fn class(&self) -> u8 {
        match self.descriptor.as_ref().map(|d| d.class) {
            Some(class) if class != protocol::class::INTERFACE => class,
            _ => self
                .interfaces()
                .first()
                .map(|s| s.interface.class)
                .unwrap_or(protocol::class::INTERFACE),
        }
    }

    /// Snapshot for the async side
    pub fn info(&self, controller: ControllerId) -> DeviceInfo {
        DeviceInfo {
            controller,
            id: self.id,
            address: self.address,
            speed: self.speed,
            state: self.state.to_string(),
            parent: self.parent,
            port: self.port,
            vendor_id: self.descriptor.as_ref().map(|d| d.vendor_id).unwrap_or(0),
            product_id: self.descriptor.as_ref().map(|d| d.product_id).unwrap_or(0),
            class: self.class(),
            configuration: self.configuration_value(),
            manufacturer: self.strings.manufacturer.clone(),
            product: self.strings.product.clone(),
            serial_number: self.strings.serial_number.clone(),
            reservations: self.reservations().len(),
            driver: self.driver.clone(),
        }
    }
}

pub type DeviceRef = Arc<Mutex<UsbDevice>>;

/// Per-controller device arena
///
/// Records are removed only by an explicit destroy; a device whose
/// enumeration failed stays here in `Removed` until then.
pub struct DeviceTable {
    devices: RwLock<HashMap<DeviceId, DeviceRef>>,
    next_id: AtomicU32,
}

impl Default for DeviceTable {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceTable {
    pub fn new() -> Self {
        Self {
            devices: RwLock::new(HashMap::new()),
            next_id: AtomicU32::new(1),
        }
    }

    /// Create a `Detected` record
    pub fn insert(&self, parent: Option<DeviceId>, port: u8, speed: DeviceSpeed) -> DeviceRef {
        let id = DeviceId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let device = Arc::new(Mutex::new(UsbDevice::new(id, parent, port, speed)));
        write(&self.devices).insert(id, device.clone());
        device
    }

    pub fn get(&self, id: DeviceId) -> Option<DeviceRef> {
        read(&self.devices).get(&id).cloned()
    }

    pub fn remove(&self, id: DeviceId) -> Option<DeviceRef> {
        write(&self.devices).remove(&id)
    }

    /// All ids, ascending
    pub fn ids(&self) -> Vec<DeviceId> {
        let mut ids: Vec<DeviceId> = read(&self.devices).keys().copied().collect();
        ids.sort();
        ids
    }

    /// Devices directly below `parent` (`None` = root hub)
    pub fn children_of(&self, parent: Option<DeviceId>) -> Vec<DeviceId> {
        let mut ids: Vec<DeviceId> = read(&self.devices)
            .iter()
            .filter(|(_, d)| lock(d).parent() == parent)
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }

    /// Live device currently answering at `address`
    pub fn holder_of(&self, address: u8) -> Option<DeviceId> {
        read(&self.devices)
            .iter()
            .find(|(_, d)| {
                let d = lock(d);
                d.address() == address && !d.is_removed()
            })
            .map(|(id, _)| *id)
    }

    pub fn len(&self) -> usize {
        read(&self.devices).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every live device, ordered by id
    pub fn snapshot(&self, controller: ControllerId) -> Vec<DeviceInfo> {
        self.ids()
            .into_iter()
            .filter_map(|id| self.get(id))
            .map(|d| lock(&d).info(controller))
            .filter(|info| info.state != DeviceState::Removed.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::{ConfigurationDescriptor, Descriptor, InterfaceDescriptor};

    fn configuration() -> Configuration {
        Configuration {
            header: ConfigurationDescriptor {
                total_length: 9 + 9 + 7 + 7,
                num_interfaces: 1,
                configuration_value: 1,
                configuration_index: 0,
                attributes: 0x80,
                max_power: 50,
            },
            tail: vec![
                Descriptor::Interface(InterfaceDescriptor {
                    interface_number: 0,
                    alternate_setting: 0,
                    num_endpoints: 2,
                    class: protocol::class::HID,
                    subclass: 1,
                    protocol: 1,
                    interface_index: 0,
                }),
                Descriptor::Endpoint(EndpointDescriptor {
                    address: 0x81,
                    attributes: 0x03,
                    max_packet_size: 8,
                    interval: 10,
                }),
                Descriptor::Endpoint(EndpointDescriptor {
                    address: 0x02,
                    attributes: 0x02,
                    max_packet_size: 64,
                    interval: 0,
                }),
            ],
        }
    }

    #[test]
    fn test_lifecycle_transitions() {
        let mut device = UsbDevice::new(DeviceId(1), None, 1, DeviceSpeed::Full);
        assert_eq!(device.state(), DeviceState::Detected);

        assert!(device.transition(DeviceState::Addressed).is_err());
        device.transition(DeviceState::Default).unwrap();
        device.transition(DeviceState::Addressed).unwrap();
        device.transition(DeviceState::Configured).unwrap();
        device.transition(DeviceState::Active).unwrap();
        device.transition(DeviceState::Removed).unwrap();

        let err = device.transition(DeviceState::Removed).unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));
    }

    #[test]
    fn test_activate_configuration_resets_toggles() {
        let mut device = UsbDevice::new(DeviceId(1), None, 1, DeviceSpeed::Full);
        device.add_configuration(configuration());

        assert_eq!(device.activate_configuration(0).unwrap(), 1);
        assert_eq!(device.endpoints().len(), 2);

        device.endpoint_mut(0x81).unwrap().toggle.flip();
        device.endpoint_mut(0x81).unwrap().reservation = Some(ScheduleHandle(7));
        device.activate_configuration(0).unwrap();

        assert!(device.endpoints().iter().all(|e| e.toggle == DataToggle::Data0));
        assert!(device.reservations().is_empty());
    }

    #[test]
    fn test_take_reservations() {
        let mut device = UsbDevice::new(DeviceId(1), None, 1, DeviceSpeed::Full);
        device.add_configuration(configuration());
        device.activate_configuration(0).unwrap();
        device.endpoint_mut(0x81).unwrap().reservation = Some(ScheduleHandle(3));

        assert_eq!(device.take_reservations(), vec![ScheduleHandle(3)]);
        assert!(device.take_reservations().is_empty());
    }

    #[test]
    fn test_class_falls_back_to_interface() {
        let mut device = UsbDevice::new(DeviceId(1), None, 1, DeviceSpeed::Low);
        device.add_configuration(configuration());
        device.activate_configuration(0).unwrap();
        assert_eq!(device.class(), protocol::class::HID);
        assert_eq!(device.info(ControllerId(0)).configuration, 1);
    }

    #[test]
    fn test_table_children_and_snapshot() {
        let table = DeviceTable::new();
        let hub = table.insert(None, 1, DeviceSpeed::High);
        let hub_id = lock(&hub).id();
        let child = table.insert(Some(hub_id), 2, DeviceSpeed::Full);
        let child_id = lock(&child).id();

        assert_eq!(table.children_of(None), vec![hub_id]);
        assert_eq!(table.children_of(Some(hub_id)), vec![child_id]);

        lock(&child).transition(DeviceState::Removed).unwrap();
        let snapshot = table.snapshot(ControllerId(0));
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id, hub_id);
    }
}
