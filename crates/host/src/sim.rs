//! Simulated USB bus
//!
//! A `HostController` that answers at the packet level from canned device
//! profiles: standard requests, hub class requests, and the HID boot
//! requests. It checks the DATA0/DATA1 sequence of every control stage,
//! applies SET_ADDRESS and feature changes at the status stage like real
//! silicon, and keeps per-port reset counters so tests can see exactly how
//! the core drove the bus. Faults (disconnect mid-sequence, NAKed setups,
//! stalled configurations, dead devices) are injected per node.
//!
//! Used by the `usb-host` binary's demo mode and by the integration tests.

use crate::config::{SimDeviceConfig, SimulationSettings};
use crate::lock;
use crate::transport::{HostController, Pid, Token};
use common::{Error, Result};
use protocol::{
    ConfigurationDescriptor, DataToggle, Descriptor, DeviceDescriptor, DeviceRequest, DeviceSpeed,
    Direction, EndpointDescriptor, HidClassDescriptor, HidDescriptor, HubCharacteristics,
    HubDescriptor, HubStatus, InterfaceDescriptor, PortStatus, RequestKind, StringDescriptor,
    TransferError, class, descriptor_type, feature, hid_request, hub_request,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, trace};

/// Canned device kinds for configuration files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SimKind {
    Keyboard,
    Mouse,
    Webcam,
    Storage,
    Hub,
}

impl SimKind {
    /// Downstream ports of a simulated hub
    pub const HUB_PORTS: u8 = 4;
}

// ============================================================================
// Device profiles
// ============================================================================

const SIM_VENDOR: u16 = 0x1D6B;

/// Everything a simulated device answers with
#[derive(Debug, Clone)]
pub struct DeviceProfile {
    pub speed: DeviceSpeed,
    pub device: DeviceDescriptor,
    /// Full configuration blobs, in descriptor index order
    pub configurations: Vec<Vec<u8>>,
    /// String descriptor text; index 1 is `strings[0]`
    pub strings: Vec<String>,
    pub hub: Option<HubDescriptor>,
}

/// Assemble a configuration blob with a correct header
///
/// `bNumInterfaces` counts alternate setting 0 interfaces in `tail`.
pub fn build_configuration(
    value: u8,
    attributes: u8,
    max_power: u8,
    tail: &[Descriptor],
) -> Vec<u8> {
    let mut body = Vec::new();
    for descriptor in tail {
        descriptor.write_to(&mut body);
    }
    let num_interfaces = tail
        .iter()
        .filter(|d| matches!(d, Descriptor::Interface(i) if i.alternate_setting == 0))
        .count() as u8;
    let header = ConfigurationDescriptor {
        total_length: (ConfigurationDescriptor::LENGTH + body.len()) as u16,
        num_interfaces,
        configuration_value: value,
        configuration_index: 0,
        attributes,
        max_power,
    };
    let mut out = Vec::with_capacity(header.total_length as usize);
    header.write_to(&mut out);
    out.extend_from_slice(&body);
    out
}

fn interface(
    number: u8,
    alternate: u8,
    endpoints: u8,
    class: u8,
    subclass: u8,
    protocol: u8,
) -> Descriptor {
    Descriptor::Interface(InterfaceDescriptor {
        interface_number: number,
        alternate_setting: alternate,
        num_endpoints: endpoints,
        class,
        subclass,
        protocol,
        interface_index: 0,
    })
}

fn endpoint(address: u8, attributes: u8, max_packet_size: u16, interval: u8) -> Descriptor {
    Descriptor::Endpoint(EndpointDescriptor {
        address,
        attributes,
        max_packet_size,
        interval,
    })
}

fn hid(report_length: u16) -> Descriptor {
    Descriptor::Hid(HidDescriptor {
        hid_version: 0x0111,
        country_code: 0,
        descriptors: vec![HidClassDescriptor {
            descriptor_type: descriptor_type::REPORT,
            length: report_length,
        }],
    })
}

impl DeviceProfile {
    fn base(speed: DeviceSpeed, product_id: u16, class: u8, max_packet0: u8) -> DeviceDescriptor {
        DeviceDescriptor {
            usb_version: if speed.uses_microframes() { 0x0200 } else { 0x0110 },
            class,
            subclass: 0,
            protocol: 0,
            max_packet_size0: max_packet0,
            vendor_id: SIM_VENDOR,
            product_id,
            device_version: 0x0100,
            manufacturer_index: 1,
            product_index: 2,
            serial_index: 3,
            num_configurations: 1,
        }
    }

    fn with(
        speed: DeviceSpeed,
        device: DeviceDescriptor,
        configuration: Vec<u8>,
        product: &str,
        serial: &str,
    ) -> Self {
        Self {
            speed,
            device,
            configurations: vec![configuration],
            strings: vec!["Sim Devices".to_string(), product.to_string(), serial.to_string()],
            hub: None,
        }
    }

    /// HID boot keyboard, one interrupt IN endpoint every 10 frames
    pub fn keyboard(speed: DeviceSpeed) -> Self {
        let tail = [
            interface(0, 0, 1, class::HID, class::HID_SUBCLASS_BOOT, class::HID_PROTOCOL_KEYBOARD),
            hid(65),
            endpoint(0x81, 0x03, 8, 10),
        ];
        Self::with(
            speed,
            Self::base(speed, 0x0101, class::INTERFACE, 8),
            build_configuration(1, 0xA0, 50, &tail),
            "Sim Keyboard",
            "KB0001",
        )
    }

    /// HID boot mouse
    pub fn mouse(speed: DeviceSpeed) -> Self {
        let tail = [
            interface(0, 0, 1, class::HID, class::HID_SUBCLASS_BOOT, class::HID_PROTOCOL_MOUSE),
            hid(52),
            endpoint(0x81, 0x03, 4, 10),
        ];
        Self::with(
            speed,
            Self::base(speed, 0x0102, class::INTERFACE, 8),
            build_configuration(1, 0xA0, 50, &tail),
            "Sim Mouse",
            "MS0001",
        )
    }

    /// Video function: interrupt status endpoint plus an isochronous
    /// stream that only exists in alternate setting 1
    pub fn webcam(speed: DeviceSpeed) -> Self {
        let mut device = Self::base(speed, 0x0103, class::MISC, 64);
        device.subclass = 0x02;
        device.protocol = 0x01;
        let tail = [
            interface(0, 0, 1, class::VIDEO, 0x01, 0x00),
            // Class-specific VC header, carried through as an opaque record
            Descriptor::Unknown {
                descriptor_type: 0x24,
                data: vec![0x05, 0x24, 0x01, 0x00, 0x01],
            },
            endpoint(0x83, 0x03, 16, 8),
            interface(1, 0, 0, class::VIDEO, 0x02, 0x00),
            interface(1, 1, 1, class::VIDEO, 0x02, 0x00),
            endpoint(0x81, 0x05, 1024, 1),
        ];
        Self::with(
            speed,
            device,
            build_configuration(1, 0x80, 250, &tail),
            "Sim Webcam",
            "CAM0001",
        )
    }

    /// Mass storage, bulk only
    pub fn storage(speed: DeviceSpeed) -> Self {
        let bulk = if speed.uses_microframes() { 512 } else { 64 };
        let tail = [
            interface(0, 0, 2, class::MASS_STORAGE, 0x06, 0x50),
            endpoint(0x81, 0x02, bulk, 0),
            endpoint(0x02, 0x02, bulk, 0),
        ];
        Self::with(
            speed,
            Self::base(speed, 0x0104, class::INTERFACE, 64),
            build_configuration(1, 0x80, 100, &tail),
            "Sim Storage",
            "MSC0001",
        )
    }

    /// Hub with `ports` downstream ports and individual power switching
    pub fn hub(speed: DeviceSpeed, ports: u8) -> Self {
        let mut device = Self::base(speed, 0x0105, class::HUB, 64);
        device.protocol = u8::from(speed.uses_microframes());
        let tail = [
            interface(0, 0, 1, class::HUB, 0, 0),
            endpoint(0x81, 0x03, 1, if speed.uses_microframes() { 12 } else { 255 }),
        ];
        let mut profile = Self::with(
            speed,
            device,
            build_configuration(1, 0xE0, 0, &tail),
            "Sim Hub",
            "HUB0001",
        );
        profile.hub = Some(HubDescriptor::new(ports, HubCharacteristics(0x0009), 5));
        profile
    }

    /// Vendor function with one interrupt IN endpoint
    pub fn interrupt_device(speed: DeviceSpeed, max_packet_size: u16, interval: u8) -> Self {
        Self::periodic_device(speed, &[(0x81, 0x03, max_packet_size, interval)])
    }

    /// Vendor function with arbitrary periodic endpoints
    /// (`address`, `bmAttributes`, `wMaxPacketSize`, `bInterval`)
    pub fn periodic_device(speed: DeviceSpeed, endpoints: &[(u8, u8, u16, u8)]) -> Self {
        let mut tail = vec![interface(0, 0, endpoints.len() as u8, class::VENDOR_SPECIFIC, 0, 0)];
        tail.extend(
            endpoints
                .iter()
                .map(|&(address, attributes, mps, interval)| {
                    endpoint(address, attributes, mps, interval)
                }),
        );
        Self::with(
            speed,
            Self::base(speed, 0x0106, class::VENDOR_SPECIFIC, 64),
            build_configuration(1, 0x80, 100, &tail),
            "Sim Periodic",
            "PER0001",
        )
    }

    pub fn from_kind(kind: SimKind, speed: DeviceSpeed) -> Self {
        match kind {
            SimKind::Keyboard => Self::keyboard(speed),
            SimKind::Mouse => Self::mouse(speed),
            SimKind::Webcam => Self::webcam(speed),
            SimKind::Storage => Self::storage(speed),
            SimKind::Hub => Self::hub(speed, SimKind::HUB_PORTS),
        }
    }

    /// Add a configuration; `bNumConfigurations` follows
    pub fn push_configuration(mut self, configuration: Vec<u8>) -> Self {
        self.configurations.push(configuration);
        self.device.num_configurations = self.configurations.len() as u8;
        self
    }

    pub fn with_max_packet0(mut self, max_packet0: u8) -> Self {
        self.device.max_packet_size0 = max_packet0;
        self
    }

    pub fn without_strings(mut self) -> Self {
        self.strings.clear();
        self.device.manufacturer_index = 0;
        self.device.product_index = 0;
        self.device.serial_index = 0;
        self
    }
}

// ============================================================================
// Bus model
// ============================================================================

/// Node in the simulated topology
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SimNodeId(pub usize);

/// A port on the root hub or on a simulated hub
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortRef {
    pub hub: Option<SimNodeId>,
    pub port: u8,
}

impl PortRef {
    pub fn root(port: u8) -> Self {
        Self { hub: None, port }
    }

    pub fn hub(hub: SimNodeId, port: u8) -> Self {
        Self {
            hub: Some(hub),
            port,
        }
    }
}

/// Injected misbehavior
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Faults {
    /// Unplug when the setup after this many completed ones arrives
    pub disconnect_after: Option<usize>,
    /// NAK this many setups before answering
    pub nak_setups: u32,
    /// Stall GET_DESCRIPTOR for this configuration index
    pub stall_configuration: Option<u8>,
    /// Never answer
    pub unresponsive: bool,
}

#[derive(Debug, Clone, Copy, Default)]
struct SimPort {
    status: PortStatus,
    attached: Option<SimNodeId>,
    resets: usize,
}

#[derive(Debug, Clone, Copy)]
enum StatusAction {
    None,
    SetAddress(u8),
    SetConfiguration(u8),
    PortFeature { port: u8, selector: u16, set: bool },
    HubFeature { selector: u16 },
    HidProtocol(u16),
    HidIdle(u8),
}

#[derive(Debug)]
struct PendingControl {
    request: DeviceRequest,
    /// IN payload, or a stall owed at the next stage
    response: std::result::Result<Vec<u8>, TransferError>,
    offset: usize,
    next_toggle: DataToggle,
    action: StatusAction,
}

#[derive(Debug)]
struct Node {
    profile: DeviceProfile,
    upstream: PortRef,
    address: u8,
    configuration: u8,
    control: Option<PendingControl>,
    /// Expected toggle per non-control endpoint
    toggles: HashMap<u8, DataToggle>,
    ports: Vec<SimPort>,
    hub_change: u16,
    faults: Faults,
    setups: usize,
    /// Order of the last reset; breaks ties between address-0 devices
    reset_seq: u64,
    hid_protocol: Option<u16>,
    hid_idle: Option<u8>,
    gone: bool,
}

#[derive(Debug)]
struct Bus {
    root: Vec<SimPort>,
    nodes: Vec<Node>,
    running: bool,
    cancelled: bool,
    reset_seq: u64,
    transactions: usize,
}

fn speed_bits(speed: DeviceSpeed) -> u16 {
    match speed {
        DeviceSpeed::Low => PortStatus::LOW_SPEED,
        DeviceSpeed::High | DeviceSpeed::Super => PortStatus::HIGH_SPEED,
        _ => 0,
    }
}

impl Bus {
    fn port(&self, port: PortRef) -> Option<&SimPort> {
        let index = usize::from(port.port.checked_sub(1)?);
        match port.hub {
            None => self.root.get(index),
            Some(hub) => self.nodes.get(hub.0)?.ports.get(index),
        }
    }

    fn port_mut(&mut self, port: PortRef) -> Option<&mut SimPort> {
        let index = usize::from(port.port.checked_sub(1)?);
        match port.hub {
            None => self.root.get_mut(index),
            Some(hub) => self.nodes.get_mut(hub.0)?.ports.get_mut(index),
        }
    }

    fn reachable(&self, id: SimNodeId) -> bool {
        let Some(node) = self.nodes.get(id.0) else {
            return false;
        };
        if node.gone {
            return false;
        }
        let linked = self
            .port(node.upstream)
            .is_some_and(|p| p.attached == Some(id) && p.status.enabled());
        linked && node.upstream.hub.is_none_or(|hub| self.reachable(hub))
    }

    fn find(&self, address: u8) -> std::result::Result<SimNodeId, TransferError> {
        let found = (0..self.nodes.len())
            .map(SimNodeId)
            .filter(|&id| self.nodes[id.0].address == address && self.reachable(id))
            .max_by_key(|id| self.nodes[id.0].reset_seq);
        match found {
            Some(id) => Ok(id),
            None if self.nodes.iter().any(|n| n.gone && n.address == address) => {
                Err(TransferError::Disconnected)
            }
            None => Err(TransferError::Timeout),
        }
    }

    fn attach(&mut self, at: PortRef, profile: DeviceProfile) -> Result<SimNodeId> {
        let ports = match at.hub {
            None => self.root.len(),
            Some(hub) => self.nodes.get(hub.0).map_or(0, |n| n.ports.len()),
        } as u8;
        let occupied = self
            .port(at)
            .ok_or(Error::PortOutOfRange {
                port: at.port,
                ports,
            })?
            .attached
            .is_some_and(|n| !self.nodes[n.0].gone);
        if occupied {
            return Err(Error::Config(format!("simulated port {} already occupied", at.port)));
        }

        let id = SimNodeId(self.nodes.len());
        let hub_ports = profile.hub.as_ref().map_or(0, |h| h.num_ports) as usize;
        let speed = profile.speed;
        self.nodes.push(Node {
            profile,
            upstream: at,
            address: 0,
            configuration: 0,
            control: None,
            toggles: HashMap::new(),
            ports: vec![SimPort::default(); hub_ports],
            hub_change: 0,
            faults: Faults::default(),
            setups: 0,
            reset_seq: 0,
            hid_protocol: None,
            hid_idle: None,
            gone: false,
        });

        if let Some(port) = self.port_mut(at) {
            port.attached = Some(id);
            port.status.status |= PortStatus::CONNECTION | speed_bits(speed);
            port.status.status &= !PortStatus::ENABLE;
            port.status.change |= PortStatus::C_CONNECTION;
        }
        Ok(id)
    }

    fn detach(&mut self, id: SimNodeId) {
        let Some(node) = self.nodes.get_mut(id.0) else {
            return;
        };
        if node.gone {
            return;
        }
        node.gone = true;
        node.control = None;
        let upstream = node.upstream;
        let children: Vec<SimNodeId> = node.ports.iter().filter_map(|p| p.attached).collect();

        if let Some(port) = self.port_mut(upstream) {
            if port.attached == Some(id) {
                port.attached = None;
                port.status.status &= !(PortStatus::CONNECTION
                    | PortStatus::ENABLE
                    | PortStatus::LOW_SPEED
                    | PortStatus::HIGH_SPEED);
                port.status.change |= PortStatus::C_CONNECTION;
            }
        }
        for child in children {
            self.detach(child);
        }
    }

    fn port_feature(&mut self, at: PortRef, selector: u16, set: bool) {
        let Some(port) = self.port_mut(at) else {
            return;
        };

        if set && selector == feature::PORT_RESET {
            let Some(child) = port.attached else {
                return;
            };
            port.resets += 1;
            port.status.status |= PortStatus::ENABLE;
            port.status.change |= PortStatus::C_RESET;
            self.reset_seq += 1;
            let seq = self.reset_seq;
            if let Some(node) = self.nodes.get_mut(child.0) {
                node.address = 0;
                node.configuration = 0;
                node.control = None;
                node.toggles.clear();
                node.reset_seq = seq;
            }
            return;
        }

        if set {
            if let Some(mask) = PortStatus::status_mask(selector) {
                port.status.status |= mask;
            }
        } else if let Some(mask) = PortStatus::change_mask(selector) {
            port.status.change &= !mask;
        } else if let Some(mask) = PortStatus::status_mask(selector) {
            port.status.status &= !mask;
        }
    }

    fn node_mut(&mut self, id: SimNodeId) -> &mut Node {
        &mut self.nodes[id.0]
    }

    // ------------------------------------------------------------------------
    // Control pipe
    // ------------------------------------------------------------------------

    /// Work out the answer to a setup packet
    fn respond(
        &self,
        id: SimNodeId,
        request: &DeviceRequest,
    ) -> (std::result::Result<Vec<u8>, TransferError>, StatusAction) {
        let node = &self.nodes[id.0];
        let profile = &node.profile;
        let kind = request.request_type.kind();
        let recipient = request.request_type.recipient();
        let stall = || (Err(TransferError::Stall), StatusAction::None);
        let reply = |bytes: Vec<u8>| (Ok(bytes), StatusAction::None);

        match (kind, request.request) {
            (RequestKind::Standard, protocol::types::request::GET_DESCRIPTOR) => {
                let dtype = (request.value >> 8) as u8;
                let index = (request.value & 0xFF) as u8;
                match dtype {
                    descriptor_type::DEVICE => reply(profile.device.to_bytes()),
                    descriptor_type::CONFIGURATION => {
                        if node.faults.stall_configuration == Some(index) {
                            return stall();
                        }
                        match profile.configurations.get(index as usize) {
                            Some(bytes) => reply(bytes.clone()),
                            None => stall(),
                        }
                    }
                    descriptor_type::STRING if index == 0 => {
                        if profile.strings.is_empty() {
                            return stall();
                        }
                        let table = StringDescriptor {
                            code_units: vec![StringDescriptor::LANGUAGE_EN_US],
                        };
                        reply(Descriptor::String(table).serialize())
                    }
                    descriptor_type::STRING => match profile.strings.get(index as usize - 1) {
                        Some(text) => {
                            reply(Descriptor::String(StringDescriptor::from_text(text)).serialize())
                        }
                        None => stall(),
                    },
                    _ => stall(),
                }
            }
            (RequestKind::Standard, protocol::types::request::SET_ADDRESS) => {
                if request.value > 127 {
                    return stall();
                }
                (Ok(Vec::new()), StatusAction::SetAddress(request.value as u8))
            }
            (RequestKind::Standard, protocol::types::request::SET_CONFIGURATION) => {
                let value = request.value as u8;
                let known = value == 0
                    || profile
                        .configurations
                        .iter()
                        .any(|c| c.get(5) == Some(&value));
                if !known {
                    return stall();
                }
                (Ok(Vec::new()), StatusAction::SetConfiguration(value))
            }
            (RequestKind::Standard, protocol::types::request::GET_CONFIGURATION) => {
                reply(vec![node.configuration])
            }
            (RequestKind::Standard, protocol::types::request::GET_STATUS) => reply(vec![0, 0]),
            (RequestKind::Class, _) if profile.hub.is_some() => self.respond_hub(id, request),
            (RequestKind::Class, hid_request::SET_PROTOCOL)
                if recipient == protocol::Recipient::Interface =>
            {
                (Ok(Vec::new()), StatusAction::HidProtocol(request.value))
            }
            (RequestKind::Class, hid_request::SET_IDLE)
                if recipient == protocol::Recipient::Interface =>
            {
                (Ok(Vec::new()), StatusAction::HidIdle((request.value >> 8) as u8))
            }
            _ => stall(),
        }
    }

    fn respond_hub(
        &self,
        id: SimNodeId,
        request: &DeviceRequest,
    ) -> (std::result::Result<Vec<u8>, TransferError>, StatusAction) {
        let node = &self.nodes[id.0];
        let stall = (Err(TransferError::Stall), StatusAction::None);
        let Some(descriptor) = node.profile.hub.as_ref() else {
            return stall;
        };
        let port = (request.index & 0xFF) as u8;
        let port_valid = port >= 1 && port <= descriptor.num_ports;
        let to_port = request.request_type.recipient() == protocol::Recipient::Other;

        match request.request {
            hub_request::GET_DESCRIPTOR if (request.value >> 8) as u8 == descriptor_type::HUB => {
                (Ok(descriptor.to_bytes()), StatusAction::None)
            }
            hub_request::GET_STATUS if to_port && port_valid => {
                let status = node.ports[port as usize - 1].status;
                (Ok(status.to_bytes().to_vec()), StatusAction::None)
            }
            hub_request::GET_STATUS => {
                let status = HubStatus {
                    status: 0,
                    change: node.hub_change,
                };
                (Ok(status.to_bytes().to_vec()), StatusAction::None)
            }
            hub_request::SET_FEATURE | hub_request::CLEAR_FEATURE if to_port && port_valid => (
                Ok(Vec::new()),
                StatusAction::PortFeature {
                    port,
                    selector: request.value,
                    set: request.request == hub_request::SET_FEATURE,
                },
            ),
            hub_request::CLEAR_FEATURE if !to_port => (
                Ok(Vec::new()),
                StatusAction::HubFeature {
                    selector: request.value,
                },
            ),
            _ => stall,
        }
    }

    fn complete(&mut self, id: SimNodeId, action: StatusAction) {
        match action {
            StatusAction::None => {}
            StatusAction::SetAddress(address) => {
                trace!("sim node {} now at address {}", id.0, address);
                self.node_mut(id).address = address;
            }
            StatusAction::SetConfiguration(value) => {
                let node = self.node_mut(id);
                node.configuration = value;
                node.toggles.clear();
            }
            StatusAction::PortFeature { port, selector, set } => {
                self.port_feature(PortRef::hub(id, port), selector, set);
            }
            StatusAction::HubFeature { selector } => {
                let node = self.node_mut(id);
                match selector {
                    feature::C_HUB_LOCAL_POWER => node.hub_change &= !HubStatus::C_LOCAL_POWER,
                    feature::C_HUB_OVER_CURRENT => node.hub_change &= !HubStatus::C_OVER_CURRENT,
                    _ => {}
                }
            }
            StatusAction::HidProtocol(protocol) => self.node_mut(id).hid_protocol = Some(protocol),
            StatusAction::HidIdle(duration) => self.node_mut(id).hid_idle = Some(duration),
        }
    }

    fn control(
        &mut self,
        id: SimNodeId,
        token: &Token,
        data: &mut [u8],
    ) -> std::result::Result<usize, TransferError> {
        match token.pid {
            Pid::Setup => {
                if token.toggle != DataToggle::Data0 {
                    return Err(TransferError::Protocol("SETUP must use DATA0".into()));
                }
                let request = DeviceRequest::from_bytes(data)
                    .map_err(|e| TransferError::Protocol(e.to_string()))?;

                let node = self.node_mut(id);
                if let Some(limit) = node.faults.disconnect_after {
                    if node.setups >= limit {
                        debug!(
                            "sim node {} unplugged during request {:#04x}",
                            id.0, request.request
                        );
                        self.detach(id);
                        return Err(TransferError::Disconnected);
                    }
                }
                if node.faults.nak_setups > 0 {
                    node.faults.nak_setups -= 1;
                    return Err(TransferError::Nak);
                }
                node.setups += 1;

                let (response, action) = self.respond(id, &request);
                self.node_mut(id).control = Some(PendingControl {
                    request,
                    response,
                    offset: 0,
                    next_toggle: DataToggle::Data1,
                    action,
                });
                Ok(data.len())
            }
            Pid::In | Pid::Out => {
                let node = self.node_mut(id);
                let Some(pending) = node.control.as_mut() else {
                    return Err(TransferError::Protocol("no control transfer in progress".into()));
                };
                let data_stage = pending.request.has_data_stage();
                let data_direction = pending.request.direction();
                let is_data = data_stage
                    && matches!(
                        (token.pid, data_direction),
                        (Pid::In, Direction::In) | (Pid::Out, Direction::Out)
                    );
                if is_data && token.toggle != pending.next_toggle {
                    node.control = None;
                    return Err(TransferError::Protocol("control data toggle mismatch".into()));
                }

                let payload = match &pending.response {
                    Ok(payload) => payload,
                    Err(e) => {
                        let e = e.clone();
                        node.control = None;
                        return Err(e);
                    }
                };

                if is_data {
                    let moved = if token.pid == Pid::In {
                        let limit = (pending.request.length as usize).min(payload.len());
                        let remaining = limit.saturating_sub(pending.offset);
                        let chunk = remaining
                            .min(data.len())
                            .min(usize::from(token.max_packet))
                            .min(usize::from(node.profile.device.max_packet_size0));
                        let end = pending.offset + chunk;
                        data[..chunk].copy_from_slice(&payload[pending.offset..end]);
                        chunk
                    } else {
                        data.len()
                    };
                    pending.offset += moved;
                    pending.next_toggle.flip();
                    return Ok(moved);
                }

                // Status stage: always DATA1, opposite to the data stage
                let expected_pid = if data_stage && data_direction == Direction::In {
                    Pid::Out
                } else {
                    Pid::In
                };
                if token.pid != expected_pid || token.toggle != DataToggle::Data1 {
                    node.control = None;
                    return Err(TransferError::Protocol("bad status stage".into()));
                }
                let action = pending.action;
                node.control = None;
                self.complete(id, action);
                Ok(0)
            }
        }
    }

    /// Interrupt IN on a non-control endpoint
    fn periodic(
        &mut self,
        id: SimNodeId,
        token: &Token,
        data: &mut [u8],
    ) -> std::result::Result<usize, TransferError> {
        let endpoint = token.endpoint | 0x80;
        let node = &self.nodes[id.0];
        let expected = node.toggles.get(&endpoint).copied().unwrap_or_default();
        if token.pid != Pid::In {
            return Err(TransferError::Stall);
        }
        if token.toggle != expected {
            return Err(TransferError::Protocol("interrupt data toggle mismatch".into()));
        }

        // Only hubs have anything to say: their port-change bitmap
        let Some(descriptor) = node.profile.hub.as_ref() else {
            return Err(TransferError::Nak);
        };
        let mut bitmap = vec![0u8; HubDescriptor::bitmap_len(descriptor.num_ports)];
        if node.hub_change != 0 {
            bitmap[0] |= 1;
        }
        for (i, port) in node.ports.iter().enumerate() {
            if port.status.has_changes() {
                let bit = i + 1;
                bitmap[bit / 8] |= 1 << (bit % 8);
            }
        }
        if bitmap.iter().all(|b| *b == 0) {
            return Err(TransferError::Nak);
        }

        let n = bitmap.len().min(data.len());
        data[..n].copy_from_slice(&bitmap[..n]);
        self.node_mut(id).toggles.insert(endpoint, expected.flipped());
        Ok(n)
    }
}

/// Simulated host controller
pub struct SimController {
    name: String,
    bus: Mutex<Bus>,
}

impl SimController {
    pub fn new(name: &str, root_ports: u8) -> Self {
        Self {
            name: name.to_string(),
            bus: Mutex::new(Bus {
                root: vec![SimPort::default(); root_ports as usize],
                nodes: Vec::new(),
                running: false,
                cancelled: false,
                reset_seq: 0,
                transactions: 0,
            }),
        }
    }

    /// Build the topology described by a `[simulation]` section
    pub fn from_settings(settings: &SimulationSettings) -> Result<Self> {
        let sim = Self::new("sim-ehci", settings.root_ports);
        for device in &settings.devices {
            sim.attach_config(PortRef::root(device.port), device)?;
        }
        Ok(sim)
    }

    fn attach_config(&self, at: PortRef, config: &SimDeviceConfig) -> Result<SimNodeId> {
        let node = self.attach(at, DeviceProfile::from_kind(config.kind, config.speed))?;
        for child in &config.children {
            self.attach_config(PortRef::hub(node, child.port), child)?;
        }
        Ok(node)
    }

    /// Plug a device into a port; raises C_PORT_CONNECTION
    pub fn attach(&self, at: PortRef, profile: DeviceProfile) -> Result<SimNodeId> {
        lock(&self.bus).attach(at, profile)
    }

    pub fn attach_root(&self, port: u8, profile: DeviceProfile) -> Result<SimNodeId> {
        self.attach(PortRef::root(port), profile)
    }

    /// Unplug a device (and everything behind it)
    pub fn detach(&self, node: SimNodeId) {
        lock(&self.bus).detach(node);
    }

    pub fn set_faults(&self, node: SimNodeId, faults: Faults) {
        if let Some(n) = lock(&self.bus).nodes.get_mut(node.0) {
            n.faults = faults;
        }
    }

    /// Raise over-current on a port
    pub fn inject_over_current(&self, at: PortRef) {
        let mut bus = lock(&self.bus);
        if let Some(port) = bus.port_mut(at) {
            port.status.status |= PortStatus::OVER_CURRENT;
            port.status.change |= PortStatus::C_OVER_CURRENT;
        }
    }

    pub fn port_status(&self, at: PortRef) -> Option<PortStatus> {
        lock(&self.bus).port(at).map(|p| p.status)
    }

    /// Times the port has been reset
    pub fn resets(&self, at: PortRef) -> usize {
        lock(&self.bus).port(at).map_or(0, |p| p.resets)
    }

    pub fn address_of(&self, node: SimNodeId) -> Option<u8> {
        lock(&self.bus).nodes.get(node.0).map(|n| n.address)
    }

    pub fn configuration_of(&self, node: SimNodeId) -> Option<u8> {
        lock(&self.bus).nodes.get(node.0).map(|n| n.configuration)
    }

    pub fn hid_protocol_of(&self, node: SimNodeId) -> Option<u16> {
        lock(&self.bus).nodes.get(node.0).and_then(|n| n.hid_protocol)
    }

    pub fn hid_idle_of(&self, node: SimNodeId) -> Option<u8> {
        lock(&self.bus).nodes.get(node.0).and_then(|n| n.hid_idle)
    }

    /// Setups the node accepted
    pub fn setups_of(&self, node: SimNodeId) -> usize {
        lock(&self.bus).nodes.get(node.0).map_or(0, |n| n.setups)
    }

    /// Transactions issued on the bus so far
    pub fn transactions(&self) -> usize {
        lock(&self.bus).transactions
    }
}

impl HostController for SimController {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&self) -> std::result::Result<(), TransferError> {
        let mut bus = lock(&self.bus);
        bus.running = true;
        bus.cancelled = false;
        Ok(())
    }

    fn stop(&self) -> std::result::Result<(), TransferError> {
        lock(&self.bus).running = false;
        Ok(())
    }

    fn reset(&self) -> std::result::Result<(), TransferError> {
        let mut bus = lock(&self.bus);
        for port in &mut bus.root {
            port.status.status &= !PortStatus::ENABLE;
        }
        Ok(())
    }

    fn poll(&self) -> Vec<u8> {
        let bus = lock(&self.bus);
        bus.root
            .iter()
            .enumerate()
            .filter(|(_, p)| p.status.has_changes())
            .map(|(i, _)| i as u8 + 1)
            .collect()
    }

    fn root_port_count(&self) -> u8 {
        lock(&self.bus).root.len() as u8
    }

    fn root_port_status(&self, port: u8) -> std::result::Result<PortStatus, TransferError> {
        lock(&self.bus)
            .port(PortRef::root(port))
            .map(|p| p.status)
            .ok_or(TransferError::Stall)
    }

    fn set_root_port_feature(
        &self,
        port: u8,
        selector: u16,
    ) -> std::result::Result<(), TransferError> {
        let mut bus = lock(&self.bus);
        if bus.port(PortRef::root(port)).is_none() {
            return Err(TransferError::Stall);
        }
        bus.port_feature(PortRef::root(port), selector, true);
        Ok(())
    }

    fn clear_root_port_feature(
        &self,
        port: u8,
        selector: u16,
    ) -> std::result::Result<(), TransferError> {
        let mut bus = lock(&self.bus);
        if bus.port(PortRef::root(port)).is_none() {
            return Err(TransferError::Stall);
        }
        bus.port_feature(PortRef::root(port), selector, false);
        Ok(())
    }

    fn transact(
        &self,
        token: &Token,
        data: &mut [u8],
        _timeout: Duration,
    ) -> std::result::Result<usize, TransferError> {
        let mut bus = lock(&self.bus);
        if bus.cancelled {
            return Err(TransferError::Cancelled);
        }
        if !bus.running {
            return Err(TransferError::Protocol("controller not running".into()));
        }
        bus.transactions += 1;

        let id = bus.find(token.address)?;
        if bus.nodes[id.0].faults.unresponsive {
            return Err(TransferError::Timeout);
        }
        if token.endpoint == 0 {
            bus.control(id, token, data)
        } else {
            bus.periodic(id, token, data)
        }
    }

    fn cancel_all(&self) {
        lock(&self.bus).cancelled = true;
    }
}
