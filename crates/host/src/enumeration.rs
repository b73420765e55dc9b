//! Enumeration state machine
//!
//! Drives one device from `Detected` to `Active`:
//!
//! 1. Reset the port, read the first 8 bytes of the device descriptor at
//!    address 0 with 8-byte packets to learn `bMaxPacketSize0`, then
//!    SET_ADDRESS. Only this phase needs the default address, so only this
//!    phase holds the controller's default-address lock.
//! 2. After the settle delay, read the full device descriptor, the string
//!    descriptors, and every configuration (header first, then
//!    `wTotalLength` bytes).
//! 3. SET_CONFIGURATION with the first configuration that parsed.
//! 4. Reserve bandwidth for every periodic endpoint, all or nothing.
//!
//! Any failure releases whatever was acquired and leaves the device
//! `Removed`; the record itself stays until the device is destroyed.

use crate::address::AddressPool;
use crate::config::EnumerationSettings;
use crate::control::{ControlEngine, ControlTarget};
use crate::device::{DeviceRef, DeviceState, DeviceStrings, DeviceTable, UsbDevice};
use crate::hub::{self, HubPorts};
use crate::lock;
use crate::scheduler::Scheduler;
use common::{Error, Result};
use protocol::{
    Configuration, ConfigurationDescriptor, DeviceDescriptor, DeviceRequest, ProtocolError,
    ScheduleHandle, StringDescriptor, descriptor_type, feature,
};
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// Legal `bMaxPacketSize0` values
const MAX_PACKET0_SIZES: [u8; 4] = [8, 16, 32, 64];

pub struct Enumerator<'a> {
    pub control: &'a ControlEngine,
    pub scheduler: &'a Scheduler,
    pub addresses: &'a Mutex<AddressPool>,
    pub devices: &'a DeviceTable,
    /// Held while a device answers at address 0
    pub default_address: &'a Mutex<()>,
    pub settings: &'a EnumerationSettings,
}

impl Enumerator<'_> {
    /// Enumerate the `Detected` device behind `ports`
    ///
    /// On failure the port is disabled so the device cannot linger at the
    /// default address.
    pub fn initialize(&self, device: &DeviceRef, ports: &dyn HubPorts) -> Result<()> {
        let (id, port) = {
            let d = lock(device);
            d.require(DeviceState::Detected, "initialize")?;
            (d.id(), d.port())
        };

        match self.run(device, ports) {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("Enumeration of {} on port {} failed: {}", id, port, e);
                self.teardown(&mut lock(device));
                if let Err(disable) = ports.clear_feature(port, feature::PORT_ENABLE) {
                    debug!("Could not disable port {}: {}", port, disable);
                }
                Err(e)
            }
        }
    }

    /// Release everything the device holds and mark it `Removed`
    ///
    /// Safe to call more than once. Returns the reservations released.
    pub fn teardown(&self, device: &mut UsbDevice) -> usize {
        let handles = device.take_reservations();
        let released = self.release_all(&handles);

        if device.address() != 0 {
            lock(self.addresses).release(device.address());
            device.set_address(0);
        }
        if !device.is_removed() {
            // Every live state may move to Removed
            let _ = device.transition(DeviceState::Removed);
        }
        released
    }

    fn release_all(&self, handles: &[ScheduleHandle]) -> usize {
        handles
            .iter()
            .filter(|h| match self.scheduler.release(**h) {
                Ok(()) => true,
                Err(e) => {
                    warn!("Releasing {}: {}", h, e);
                    false
                }
            })
            .count()
    }

    fn run(&self, device: &DeviceRef, ports: &dyn HubPorts) -> Result<()> {
        self.assign_address(device, ports)?;

        if !self.settings.settle_delay().is_zero() {
            std::thread::sleep(self.settings.settle_delay());
        }
        let target = lock(device).control_target();

        let bytes = self
            .control
            .read(&target, &DeviceRequest::get_device_descriptor(DeviceDescriptor::LENGTH as u16))?;
        let descriptor = DeviceDescriptor::parse(&bytes)?;
        debug!(
            "Device {:04x}:{:04x} USB {:x}.{:02x}, class {}, {} configuration(s)",
            descriptor.vendor_id,
            descriptor.product_id,
            descriptor.usb_version >> 8,
            descriptor.usb_version & 0xFF,
            protocol::class::name(descriptor.class),
            descriptor.num_configurations
        );

        let strings = if self.settings.read_strings {
            self.read_strings(&target, &descriptor)
        } else {
            DeviceStrings::default()
        };
        let configurations = self.read_configurations(&target, &descriptor)?;

        let value = {
            let mut d = lock(device);
            d.set_descriptor(descriptor);
            d.strings = strings;
            for configuration in configurations {
                d.add_configuration(configuration);
            }
            d.configurations()
                .first()
                .map(|c| c.header.configuration_value)
                .ok_or_else(|| {
                    ProtocolError::malformed(
                        descriptor_type::CONFIGURATION,
                        "no usable configuration",
                    )
                })?
        };

        self.control
            .write(&target, &DeviceRequest::set_configuration(value))?;
        {
            let mut d = lock(device);
            d.transition(DeviceState::Configured)?;
            d.activate_configuration(0)?;
        }

        self.admit(device)
    }

    /// Reset, bootstrap read and SET_ADDRESS under the default-address lock
    fn assign_address(&self, device: &DeviceRef, ports: &dyn HubPorts) -> Result<()> {
        let _default = lock(self.default_address);

        let port = lock(device).port();
        let speed = hub::reset_port(ports, port, self.settings)?;
        {
            let mut d = lock(device);
            d.set_speed(speed);
            d.transition(DeviceState::Default)?;
        }

        let target = ControlTarget::bootstrap(speed);
        let prefix = self.control.read(
            &target,
            &DeviceRequest::get_device_descriptor(DeviceDescriptor::PREFIX_LENGTH as u16),
        )?;
        let max_packet0 = DeviceDescriptor::max_packet_from_prefix(&prefix)?;
        if !MAX_PACKET0_SIZES.contains(&max_packet0) {
            return Err(ProtocolError::malformed(
                descriptor_type::DEVICE,
                format!("bMaxPacketSize0 {} is not 8, 16, 32 or 64", max_packet0),
            )
            .into());
        }

        let address = lock(self.addresses).allocate()?;
        if let Some(holder) = self.devices.holder_of(address) {
            // The pool lost track of a live device; keep the address marked used
            warn!("Address {} allocated while {} still holds it", address, holder);
            return Err(Error::AddressConflict(address));
        }
        let assigned = self
            .control
            .write(&target, &DeviceRequest::set_address(address))
            .map_err(Error::from)
            .and_then(|()| {
                let mut d = lock(device);
                d.transition(DeviceState::Addressed)?;
                d.set_address(address);
                d.set_max_packet0(u16::from(max_packet0));
                Ok(())
            });
        if let Err(e) = assigned {
            lock(self.addresses).release(address);
            return Err(e);
        }

        debug!("{} speed device on port {} now at address {}", speed, port, address);
        Ok(())
    }

    /// Language table, then manufacturer / product / serial; never fatal
    fn read_strings(&self, target: &ControlTarget, descriptor: &DeviceDescriptor) -> DeviceStrings {
        let indices = [
            descriptor.manufacturer_index,
            descriptor.product_index,
            descriptor.serial_index,
        ];
        if indices.iter().all(|i| *i == 0) {
            return DeviceStrings::default();
        }

        let language = match self.read_string(target, 0, 0) {
            Ok(table) => table.language_ids().first().copied(),
            Err(e) => {
                debug!("No language table: {}", e);
                None
            }
        };
        let Some(language) = language else {
            return DeviceStrings::default();
        };

        let text = |index: u8| {
            if index == 0 {
                return None;
            }
            match self.read_string(target, index, language) {
                Ok(s) => Some(s.to_string_lossy()),
                Err(e) => {
                    debug!("String {} unreadable: {}", index, e);
                    None
                }
            }
        };

        DeviceStrings {
            language: Some(language),
            manufacturer: text(indices[0]),
            product: text(indices[1]),
            serial_number: text(indices[2]),
        }
    }

    /// Two-byte header to learn `bLength`, then the whole descriptor
    fn read_string(
        &self,
        target: &ControlTarget,
        index: u8,
        language: u16,
    ) -> Result<StringDescriptor> {
        let header_length = StringDescriptor::HEADER_LENGTH as u16;
        let header = self.control.read(
            target,
            &DeviceRequest::get_string_descriptor(index, language, header_length),
        )?;
        let length = header.first().copied().unwrap_or(0);
        if usize::from(length) < StringDescriptor::HEADER_LENGTH {
            return Err(ProtocolError::malformed(
                descriptor_type::STRING,
                format!("bLength {}", length),
            )
            .into());
        }
        let bytes = self.control.read(
            target,
            &DeviceRequest::get_string_descriptor(index, language, u16::from(length)),
        )?;
        Ok(StringDescriptor::parse(&bytes)?)
    }

    /// Every configuration that can be fetched and parsed
    ///
    /// A configuration that fails is skipped unless the device is gone.
    fn read_configurations(
        &self,
        target: &ControlTarget,
        descriptor: &DeviceDescriptor,
    ) -> Result<Vec<Configuration>> {
        let mut configurations = Vec::new();
        for index in 0..descriptor.num_configurations {
            match self.read_configuration(target, index) {
                Ok(configuration) => configurations.push(configuration),
                Err(e) if e.is_disconnect() => return Err(e),
                Err(e) => warn!("Skipping configuration #{}: {}", index, e),
            }
        }
        Ok(configurations)
    }

    fn read_configuration(&self, target: &ControlTarget, index: u8) -> Result<Configuration> {
        let header_length = ConfigurationDescriptor::LENGTH as u16;
        let header = self.control.read(
            target,
            &DeviceRequest::get_configuration_descriptor(index, header_length),
        )?;
        let header = ConfigurationDescriptor::parse(&header)?;
        let bytes = self.control.read(
            target,
            &DeviceRequest::get_configuration_descriptor(index, header.total_length),
        )?;
        Ok(Configuration::parse(&bytes)?)
    }

    /// Reserve every periodic endpoint or none of them
    fn admit(&self, device: &DeviceRef) -> Result<()> {
        let (speed, periodic) = {
            let d = lock(device);
            let periodic: Vec<_> = d
                .endpoints()
                .iter()
                .filter(|e| e.is_periodic())
                .map(|e| e.descriptor.clone())
                .collect();
            (d.speed(), periodic)
        };

        let mut granted = Vec::with_capacity(periodic.len());
        for endpoint in &periodic {
            match self.scheduler.admit_endpoint(endpoint, speed) {
                Ok(handle) => granted.push((endpoint.address, handle)),
                Err(e) => {
                    let handles: Vec<_> = granted.iter().map(|(_, h)| *h).collect();
                    self.release_all(&handles);
                    return Err(e);
                }
            }
        }

        let mut d = lock(device);
        if let Err(e) = d.transition(DeviceState::Active) {
            // Destroyed while we were admitting
            let handles: Vec<_> = granted.iter().map(|(_, h)| *h).collect();
            self.release_all(&handles);
            return Err(e);
        }
        for (address, handle) in granted {
            if let Some(endpoint) = d.endpoint_mut(address) {
                endpoint.reservation = Some(handle);
            }
        }
        info!(
            "{} active at address {}: {} {}, {} periodic reservation(s)",
            d.id(),
            d.address(),
            d.strings.manufacturer.as_deref().unwrap_or("?"),
            d.strings.product.as_deref().unwrap_or("?"),
            d.reservations().len()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerSettings;
    use crate::hub::RootHubPorts;
    use crate::sim::{DeviceProfile, SimController};
    use crate::transport::HostController;
    use protocol::DeviceSpeed;
    use std::sync::Arc;

    #[test]
    fn test_address_held_by_live_device_conflicts() {
        let sim = Arc::new(SimController::new("t", 2));
        sim.start().unwrap();
        sim.attach_root(2, DeviceProfile::keyboard(DeviceSpeed::Low))
            .unwrap();

        let settings = EnumerationSettings::immediate();
        let control = ControlEngine::new(sim.clone(), &settings);
        let scheduler = Scheduler::new(SchedulerSettings::ehci());
        let addresses = Mutex::new(AddressPool::new());
        let default_address = Mutex::new(());
        let devices = DeviceTable::new();

        // A record on port 1 answers at address 1, unknown to the pool
        let stale = devices.insert(None, 1, DeviceSpeed::Full);
        lock(&stale).set_address(1);

        let enumerator = Enumerator {
            control: &control,
            scheduler: &scheduler,
            addresses: &addresses,
            devices: &devices,
            default_address: &default_address,
            settings: &settings,
        };
        let device = devices.insert(None, 2, DeviceSpeed::Low);
        let ports = RootHubPorts::new(sim.as_ref());

        let err = enumerator.initialize(&device, &ports).unwrap_err();
        assert!(matches!(err, Error::AddressConflict(1)));
        assert!(lock(&device).is_removed());
        assert_eq!(lock(&device).address(), 0);

        // Address 1 stays reserved; the retry gets a fresh one
        assert!(lock(&addresses).in_use(1));
        let retry = devices.insert(None, 2, DeviceSpeed::Low);
        enumerator.initialize(&retry, &ports).unwrap();
        assert_eq!(lock(&retry).address(), 2);
        assert_eq!(lock(&retry).state(), DeviceState::Active);
    }
}
