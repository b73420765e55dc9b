//! Class drivers offered every device that reaches `Active`
//!
//! Drivers are tried in order; the first whose `bind` succeeds owns the
//! device. A failing bind leaves the device active but unbound.

use crate::control::ControlEngine;
use crate::device::UsbDevice;
use crate::hub::ExternalHubPorts;
use common::Result;
use protocol::{DeviceRequest, HubDescriptor, class, hid_request};
use tracing::debug;

/// Outcome of a successful bind
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Binding {
    Bound,
    /// Device is a hub; the controller takes over its ports
    Hub(HubDescriptor),
}

pub trait ClassDriver: Send + Sync {
    fn name(&self) -> &'static str;

    /// Cheap descriptor check, no bus traffic
    fn probe(&self, device: &UsbDevice) -> bool;

    fn bind(&self, control: &ControlEngine, device: &UsbDevice) -> Result<Binding>;
}

/// Hub class (09h)
pub struct HubDriver;

impl ClassDriver for HubDriver {
    fn name(&self) -> &'static str {
        "hub"
    }

    fn probe(&self, device: &UsbDevice) -> bool {
        device.descriptor().is_some_and(|d| d.class == class::HUB)
            || device
                .interfaces()
                .iter()
                .any(|s| s.interface.class == class::HUB)
    }

    fn bind(&self, control: &ControlEngine, device: &UsbDevice) -> Result<Binding> {
        let descriptor = ExternalHubPorts::read_descriptor(control, &device.control_target())?;
        debug!(
            "{}: hub with {} port(s), {:?} power switching, {} ms power-on delay",
            device.id(),
            descriptor.num_ports,
            descriptor.characteristics.power_switching(),
            descriptor.power_on_delay_ms()
        );
        Ok(Binding::Hub(descriptor))
    }
}

/// HID boot-protocol keyboards and mice
///
/// Switches every boot interface to the boot protocol and turns off idle
/// reports. SET_IDLE is optional for mice, so a refusal there is ignored.
pub struct HidBootDriver;

impl HidBootDriver {
    fn boot_interfaces(device: &UsbDevice) -> Vec<(u8, u8)> {
        device
            .interfaces()
            .iter()
            .filter(|s| {
                s.interface.class == class::HID
                    && s.interface.subclass == class::HID_SUBCLASS_BOOT
                    && matches!(
                        s.interface.protocol,
                        class::HID_PROTOCOL_KEYBOARD | class::HID_PROTOCOL_MOUSE
                    )
            })
            .map(|s| (s.interface.interface_number, s.interface.protocol))
            .collect()
    }
}

impl ClassDriver for HidBootDriver {
    fn name(&self) -> &'static str {
        "hid-boot"
    }

    fn probe(&self, device: &UsbDevice) -> bool {
        !Self::boot_interfaces(device).is_empty()
    }

    fn bind(&self, control: &ControlEngine, device: &UsbDevice) -> Result<Binding> {
        let target = device.control_target();
        for (interface, protocol) in Self::boot_interfaces(device) {
            control.write(
                &target,
                &DeviceRequest::hid_set_protocol(interface, hid_request::BOOT_PROTOCOL),
            )?;
            if let Err(e) = control.write(&target, &DeviceRequest::hid_set_idle(interface, 0, 0)) {
                if protocol == class::HID_PROTOCOL_KEYBOARD {
                    return Err(e.into());
                }
                debug!("{}: interface {} refused SET_IDLE: {}", device.id(), interface, e);
            }
        }
        Ok(Binding::Bound)
    }
}

/// Hub first, then HID boot
pub fn default_drivers() -> Vec<Box<dyn ClassDriver>> {
    vec![Box::new(HubDriver), Box::new(HidBootDriver)]
}
