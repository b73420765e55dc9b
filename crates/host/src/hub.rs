//! Hub manager
//!
//! Port bookkeeping and the port-level sequences shared by the root hub and
//! external hubs: power-on, reset-and-wait-for-enable, and turning a port's
//! change bits into one event. Both kinds of hub sit behind `HubPorts`; the
//! root hub talks to the transport's root-port registers, an external hub is
//! driven with class requests over its control pipe.

use crate::config::EnumerationSettings;
use crate::control::{ControlEngine, ControlTarget};
use crate::transport::HostController;
use common::{Error, Result};
use protocol::{
    DeviceId, DeviceRequest, DeviceSpeed, HubDescriptor, HubStatus, PortStatus, TransferError,
    feature,
};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Port-level access to one hub
pub trait HubPorts {
    fn port_count(&self) -> u8;
    fn port_status(&self, port: u8) -> std::result::Result<PortStatus, TransferError>;
    fn set_feature(&self, port: u8, feature: u16) -> std::result::Result<(), TransferError>;
    fn clear_feature(&self, port: u8, feature: u16) -> std::result::Result<(), TransferError>;

    fn hub_status(&self) -> std::result::Result<HubStatus, TransferError> {
        Ok(HubStatus::default())
    }

    fn clear_hub_feature(&self, _feature: u16) -> std::result::Result<(), TransferError> {
        Ok(())
    }
}

/// Root hub, backed by the controller's port registers
pub struct RootHubPorts<'a> {
    transport: &'a dyn HostController,
}

impl<'a> RootHubPorts<'a> {
    pub fn new(transport: &'a dyn HostController) -> Self {
        Self { transport }
    }
}

impl HubPorts for RootHubPorts<'_> {
    fn port_count(&self) -> u8 {
        self.transport.root_port_count()
    }

    fn port_status(&self, port: u8) -> std::result::Result<PortStatus, TransferError> {
        self.transport.root_port_status(port)
    }

    fn set_feature(&self, port: u8, feature: u16) -> std::result::Result<(), TransferError> {
        self.transport.set_root_port_feature(port, feature)
    }

    fn clear_feature(&self, port: u8, feature: u16) -> std::result::Result<(), TransferError> {
        self.transport.clear_root_port_feature(port, feature)
    }
}

/// External hub, driven with hub class requests
pub struct ExternalHubPorts<'a> {
    control: &'a ControlEngine,
    target: ControlTarget,
    ports: u8,
}

impl<'a> ExternalHubPorts<'a> {
    pub fn new(control: &'a ControlEngine, target: ControlTarget, ports: u8) -> Self {
        Self {
            control,
            target,
            ports,
        }
    }

    /// Read and parse the hub class descriptor
    pub fn read_descriptor(
        control: &ControlEngine,
        target: &ControlTarget,
    ) -> Result<HubDescriptor> {
        let request = DeviceRequest::get_hub_descriptor(
            protocol::descriptor_type::HUB,
            0,
            HubDescriptor::MAX_LENGTH as u16,
        );
        let bytes = control.read(target, &request)?;
        Ok(HubDescriptor::parse(&bytes)?)
    }
}

fn decode_error(e: protocol::ProtocolError) -> TransferError {
    TransferError::Protocol(e.to_string())
}

impl HubPorts for ExternalHubPorts<'_> {
    fn port_count(&self) -> u8 {
        self.ports
    }

    fn port_status(&self, port: u8) -> std::result::Result<PortStatus, TransferError> {
        let bytes = self
            .control
            .read(&self.target, &DeviceRequest::get_port_status(port))?;
        PortStatus::from_bytes(&bytes).map_err(decode_error)
    }

    fn set_feature(&self, port: u8, feature: u16) -> std::result::Result<(), TransferError> {
        self.control
            .write(&self.target, &DeviceRequest::set_port_feature(feature, 0, port))
    }

    fn clear_feature(&self, port: u8, feature: u16) -> std::result::Result<(), TransferError> {
        self.control
            .write(&self.target, &DeviceRequest::clear_port_feature(feature, 0, port))
    }

    fn hub_status(&self) -> std::result::Result<HubStatus, TransferError> {
        let bytes = self
            .control
            .read(&self.target, &DeviceRequest::get_hub_status())?;
        HubStatus::from_bytes(&bytes).map_err(decode_error)
    }

    fn clear_hub_feature(&self, feature: u16) -> std::result::Result<(), TransferError> {
        self.control
            .write(&self.target, &DeviceRequest::clear_hub_feature(feature))
    }
}

// ============================================================================
// Port table
// ============================================================================

/// One downstream port
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortSlot {
    /// Last status read from the hub
    pub status: PortStatus,
    /// Attached device; the controller's table owns the record
    pub device: Option<DeviceId>,
    /// Disabled after an over-current condition
    pub over_current: bool,
}

/// Port table of one hub (root or external)
#[derive(Debug, Clone)]
pub struct HubState {
    pub descriptor: Option<HubDescriptor>,
    ports: Vec<PortSlot>,
}

impl HubState {
    pub fn new(descriptor: Option<HubDescriptor>, port_count: u8) -> Self {
        Self {
            descriptor,
            ports: vec![PortSlot::default(); port_count as usize],
        }
    }

    pub fn port_count(&self) -> u8 {
        self.ports.len() as u8
    }

    pub fn slot(&self, port: u8) -> Result<&PortSlot> {
        let ports = self.port_count();
        port.checked_sub(1)
            .and_then(|i| self.ports.get(i as usize))
            .ok_or(Error::PortOutOfRange { port, ports })
    }

    pub fn slot_mut(&mut self, port: u8) -> Result<&mut PortSlot> {
        let ports = self.port_count();
        port.checked_sub(1)
            .and_then(|i| self.ports.get_mut(i as usize))
            .ok_or(Error::PortOutOfRange { port, ports })
    }

    /// Port holding `device`, if any
    pub fn port_of(&self, device: DeviceId) -> Option<u8> {
        self.ports
            .iter()
            .position(|s| s.device == Some(device))
            .map(|i| i as u8 + 1)
    }

    /// Attached devices by port
    pub fn devices(&self) -> Vec<(u8, DeviceId)> {
        self.ports
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.device.map(|d| (i as u8 + 1, d)))
            .collect()
    }

    /// Forget `device` wherever it is attached
    pub fn detach(&mut self, device: DeviceId) -> Option<u8> {
        let port = self.port_of(device)?;
        if let Ok(slot) = self.slot_mut(port) {
            slot.device = None;
        }
        Some(port)
    }
}

// ============================================================================
// Port sequences
// ============================================================================

/// What a port's change bits amount to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortEvent {
    /// Something is now attached; `previous` was attached before the bounce
    Connected { previous: Option<DeviceId> },
    /// The attached device went away
    Disconnected(DeviceId),
    /// Port disabled for over-current
    OverCurrent { previous: Option<DeviceId> },
    /// Nothing to do (reset/suspend completion, spurious change)
    Idle,
}

/// Power every port, then wait `bPwrOn2PwrGood` × 2 ms
pub fn power_on(
    ports: &dyn HubPorts,
    descriptor: Option<&HubDescriptor>,
) -> std::result::Result<(), TransferError> {
    for port in 1..=ports.port_count() {
        ports.set_feature(port, feature::PORT_POWER)?;
    }
    let delay = descriptor.map(|d| d.power_on_delay_ms()).unwrap_or(0);
    if delay > 0 {
        std::thread::sleep(Duration::from_millis(delay));
    }
    debug!("Powered {} port(s), waited {} ms", ports.port_count(), delay);
    Ok(())
}

/// Reset `port` once and wait for it to come back enabled
///
/// Returns the speed the port reports. The reset-change bit raised by the
/// reset itself is acknowledged here.
pub fn reset_port(
    ports: &dyn HubPorts,
    port: u8,
    settings: &EnumerationSettings,
) -> std::result::Result<DeviceSpeed, TransferError> {
    ports.set_feature(port, feature::PORT_RESET)?;
    let deadline = Instant::now() + settings.reset_timeout();

    for attempt in 0..settings.port_poll_attempts {
        let status = ports.port_status(port)?;
        trace!(
            "Port {} reset poll {}: status={:#06x} change={:#06x}",
            port, attempt, status.status, status.change
        );
        if !status.connected() {
            return Err(TransferError::Disconnected);
        }
        if status.enabled() && !status.resetting() {
            if status.reset_changed() {
                ports.clear_feature(port, feature::C_PORT_RESET)?;
            }
            return Ok(status.speed());
        }
        if Instant::now() >= deadline {
            break;
        }
        std::thread::sleep(settings.poll_interval());
    }
    warn!("Port {} did not enable after reset", port);
    Err(TransferError::Timeout)
}

/// Acknowledge `port`'s change bits and classify them
///
/// `attached` is the device the caller currently records on the port.
/// Over-current disables the port through PORT_ENABLE; other ports of the
/// hub are not touched.
pub fn service_port(
    ports: &dyn HubPorts,
    port: u8,
    attached: Option<DeviceId>,
) -> std::result::Result<(PortStatus, PortEvent), TransferError> {
    let status = ports.port_status(port)?;
    for selector in status.change_features() {
        ports.clear_feature(port, selector)?;
    }

    let event = if status.over_current_changed() && status.over_current() {
        warn!("Over-current on port {}, disabling it", port);
        ports.clear_feature(port, feature::PORT_ENABLE)?;
        PortEvent::OverCurrent { previous: attached }
    } else if status.connection_changed() {
        if status.connected() {
            PortEvent::Connected { previous: attached }
        } else {
            attached.map_or(PortEvent::Idle, PortEvent::Disconnected)
        }
    } else if status.enable_changed() && !status.enabled() {
        attached.map_or(PortEvent::Idle, PortEvent::Disconnected)
    } else if status.connected() && attached.is_none() && !status.has_changes() {
        // Present at scan time with no pending change
        PortEvent::Connected { previous: None }
    } else {
        PortEvent::Idle
    };

    Ok((status, event))
}

/// Ports flagged in a hub's status-change bitmap (bit 0 is the hub itself)
pub fn changed_ports(bitmap: &[u8], port_count: u8) -> Vec<u8> {
    (1..=port_count)
        .filter(|&port| {
            let bit = port as usize;
            bitmap
                .get(bit / 8)
                .is_some_and(|byte| byte & (1 << (bit % 8)) != 0)
        })
        .collect()
}

/// Whether the hub-change bit of a status-change bitmap is set
pub fn hub_changed(bitmap: &[u8]) -> bool {
    bitmap.first().is_some_and(|b| b & 1 != 0)
}

/// Acknowledge hub-level changes; returns whether over-current is active
pub fn service_hub(ports: &dyn HubPorts) -> std::result::Result<bool, TransferError> {
    let status = ports.hub_status()?;
    if status.change & HubStatus::C_LOCAL_POWER != 0 {
        ports.clear_hub_feature(feature::C_HUB_LOCAL_POWER)?;
    }
    if status.change & HubStatus::C_OVER_CURRENT != 0 {
        ports.clear_hub_feature(feature::C_HUB_OVER_CURRENT)?;
    }
    Ok(status.over_current())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    /// In-memory hub: ports enable when reset is requested
    struct FakeHub {
        ports: RefCell<Vec<PortStatus>>,
        resets: RefCell<Vec<u8>>,
        cleared: RefCell<Vec<(u8, u16)>>,
    }

    impl FakeHub {
        fn new(count: usize) -> Self {
            Self {
                ports: RefCell::new(vec![PortStatus::default(); count]),
                resets: RefCell::new(Vec::new()),
                cleared: RefCell::new(Vec::new()),
            }
        }

        fn set(&self, port: u8, status: u16, change: u16) {
            self.ports.borrow_mut()[port as usize - 1] = PortStatus::new(status, change);
        }
    }

    impl HubPorts for FakeHub {
        fn port_count(&self) -> u8 {
            self.ports.borrow().len() as u8
        }

        fn port_status(&self, port: u8) -> std::result::Result<PortStatus, TransferError> {
            Ok(self.ports.borrow()[port as usize - 1])
        }

        fn set_feature(&self, port: u8, selector: u16) -> std::result::Result<(), TransferError> {
            let mut ports = self.ports.borrow_mut();
            let p = &mut ports[port as usize - 1];
            match selector {
                feature::PORT_RESET => {
                    self.resets.borrow_mut().push(port);
                    p.status |= PortStatus::ENABLE;
                    p.change |= PortStatus::C_RESET;
                }
                feature::PORT_POWER => p.status |= PortStatus::POWER,
                _ => {}
            }
            Ok(())
        }

        fn clear_feature(&self, port: u8, selector: u16) -> std::result::Result<(), TransferError> {
            self.cleared.borrow_mut().push((port, selector));
            let mut ports = self.ports.borrow_mut();
            let p = &mut ports[port as usize - 1];
            if let Some(mask) = PortStatus::change_mask(selector) {
                p.change &= !mask;
            } else if let Some(mask) = PortStatus::status_mask(selector) {
                p.status &= !mask;
            }
            Ok(())
        }
    }

    #[test]
    fn test_power_on_all_ports() {
        let hub = FakeHub::new(3);
        power_on(&hub, None).unwrap();
        assert!(hub.ports.borrow().iter().all(|p| p.powered()));
    }

    #[test]
    fn test_reset_port_reports_speed_and_acks() {
        let hub = FakeHub::new(2);
        hub.set(1, PortStatus::CONNECTION | PortStatus::POWER | PortStatus::LOW_SPEED, 0);

        let speed = reset_port(&hub, 1, &EnumerationSettings::immediate()).unwrap();
        assert_eq!(speed, DeviceSpeed::Low);
        assert_eq!(*hub.resets.borrow(), vec![1]);
        assert!(!hub.port_status(1).unwrap().reset_changed());
    }

    #[test]
    fn test_reset_empty_port_is_disconnected() {
        let hub = FakeHub::new(1);
        let err = reset_port(&hub, 1, &EnumerationSettings::immediate()).unwrap_err();
        assert_eq!(err, TransferError::Disconnected);
    }

    #[test]
    fn test_service_connect_acks_every_change() {
        let hub = FakeHub::new(2);
        hub.set(
            2,
            PortStatus::CONNECTION | PortStatus::POWER,
            PortStatus::C_CONNECTION | PortStatus::C_RESET,
        );

        let (_, event) = service_port(&hub, 2, None).unwrap();
        assert_eq!(event, PortEvent::Connected { previous: None });
        assert!(!hub.port_status(2).unwrap().has_changes());
    }

    #[test]
    fn test_service_reset_change_alone_is_idle() {
        let hub = FakeHub::new(1);
        hub.set(
            1,
            PortStatus::CONNECTION | PortStatus::ENABLE | PortStatus::POWER,
            PortStatus::C_RESET,
        );
        let (_, event) = service_port(&hub, 1, Some(DeviceId(4))).unwrap();
        assert_eq!(event, PortEvent::Idle);
        assert!(hub.resets.borrow().is_empty());
    }

    #[test]
    fn test_service_disconnect() {
        let hub = FakeHub::new(1);
        hub.set(1, PortStatus::POWER, PortStatus::C_CONNECTION);
        let (_, event) = service_port(&hub, 1, Some(DeviceId(9))).unwrap();
        assert_eq!(event, PortEvent::Disconnected(DeviceId(9)));
    }

    #[test]
    fn test_over_current_disables_only_that_port() {
        let hub = FakeHub::new(2);
        let live = PortStatus::CONNECTION | PortStatus::ENABLE | PortStatus::POWER;
        hub.set(1, live | PortStatus::OVER_CURRENT, PortStatus::C_OVER_CURRENT);
        hub.set(2, live, 0);

        let (_, event) = service_port(&hub, 1, Some(DeviceId(1))).unwrap();
        assert_eq!(event, PortEvent::OverCurrent { previous: Some(DeviceId(1)) });
        assert!(!hub.port_status(1).unwrap().enabled());
        assert!(hub.port_status(2).unwrap().enabled());
        assert!(hub.cleared.borrow().iter().all(|(port, _)| *port == 1));
    }

    #[test]
    fn test_changed_ports_bitmap() {
        // Bits 0 (hub), 2 and 9
        let bitmap = [0b0000_0101, 0b0000_0010];
        assert_eq!(changed_ports(&bitmap, 12), vec![2, 9]);
        assert!(hub_changed(&bitmap));
        assert_eq!(changed_ports(&[0b10], 1), vec![1]);
        assert!(changed_ports(&[], 4).is_empty());
    }

    #[test]
    fn test_hub_state_slots() {
        let mut state = HubState::new(None, 4);
        state.slot_mut(3).unwrap().device = Some(DeviceId(7));
        assert_eq!(state.port_of(DeviceId(7)), Some(3));
        assert_eq!(state.devices(), vec![(3, DeviceId(7))]);
        assert!(matches!(
            state.slot(0),
            Err(Error::PortOutOfRange { port: 0, ports: 4 })
        ));
        assert_eq!(state.detach(DeviceId(7)), Some(3));
        assert!(state.devices().is_empty());
    }
}
