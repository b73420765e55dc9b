//! Descriptor codec
//!
//! Parses and serializes the fixed-layout descriptors of USB 2.0 §9.6 plus the
//! HID (0x21) and hub (0x29) class descriptors. Every record starts with
//! `[bLength][bDescriptorType]`; multi-byte fields are little-endian.
//!
//! Parsing is purely structural:
//! - fixed-size records (device, configuration header, interface, endpoint)
//!   must declare exactly their defined size,
//! - variable records (string, HID, hub) must declare at least their minimum
//!   size and be consistent with their own counts,
//! - a record consumes exactly `bLength` bytes, and a configuration consumes
//!   exactly `wTotalLength` bytes,
//! - unknown descriptor types are kept as opaque blobs.
//!
//! The codec is stateless; `serialize(parse(bytes)) == bytes` holds for every
//! well-formed input.

use crate::error::{ProtocolError, Result};
use crate::hub::HubCharacteristics;
use crate::types::{Direction, EndpointType, descriptor_type};
use bytes::{Buf, BufMut};

/// Read and validate the `[bLength][bDescriptorType]` header
fn header(bytes: &[u8]) -> Result<(usize, u8)> {
    if bytes.len() < 2 {
        return Err(ProtocolError::BufferTooSmall {
            needed: 2,
            available: bytes.len(),
        });
    }
    let length = bytes[0] as usize;
    let dtype = bytes[1];
    if length < 2 {
        return Err(ProtocolError::malformed(
            dtype,
            format!("bLength {} shorter than the descriptor header", length),
        ));
    }
    if bytes.len() < length {
        return Err(ProtocolError::BufferTooSmall {
            needed: length,
            available: bytes.len(),
        });
    }
    Ok((length, dtype))
}

/// Check header for a fixed-size record and return its body
fn fixed_body(bytes: &[u8], expected_type: u8, size: usize) -> Result<&[u8]> {
    let (length, dtype) = header(bytes)?;
    if dtype != expected_type {
        return Err(ProtocolError::UnexpectedDescriptorType {
            expected: expected_type,
            found: dtype,
        });
    }
    if length != size {
        return Err(ProtocolError::malformed(
            dtype,
            format!("bLength {}, expected {}", length, size),
        ));
    }
    Ok(&bytes[2..size])
}

// ============================================================================
// Device
// ============================================================================

/// Standard device descriptor (18 bytes)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    /// bcdUSB
    pub usb_version: u16,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub max_packet_size0: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    /// bcdDevice
    pub device_version: u16,
    pub manufacturer_index: u8,
    pub product_index: u8,
    pub serial_index: u8,
    pub num_configurations: u8,
}

impl DeviceDescriptor {
    pub const LENGTH: usize = 18;
    /// Bytes read before the address is assigned
    pub const PREFIX_LENGTH: usize = 8;

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let mut body = fixed_body(bytes, descriptor_type::DEVICE, Self::LENGTH)?;
        Ok(Self {
            usb_version: body.get_u16_le(),
            class: body.get_u8(),
            subclass: body.get_u8(),
            protocol: body.get_u8(),
            max_packet_size0: body.get_u8(),
            vendor_id: body.get_u16_le(),
            product_id: body.get_u16_le(),
            device_version: body.get_u16_le(),
            manufacturer_index: body.get_u8(),
            product_index: body.get_u8(),
            serial_index: body.get_u8(),
            num_configurations: body.get_u8(),
        })
    }

    /// Extract `bMaxPacketSize0` from the first 8 bytes of a device descriptor
    ///
    /// Used during the bootstrap read at address 0, when only the prefix has
    /// been transferred.
    pub fn max_packet_from_prefix(bytes: &[u8]) -> Result<u8> {
        if bytes.len() < Self::PREFIX_LENGTH {
            return Err(ProtocolError::BufferTooSmall {
                needed: Self::PREFIX_LENGTH,
                available: bytes.len(),
            });
        }
        if bytes[1] != descriptor_type::DEVICE {
            return Err(ProtocolError::UnexpectedDescriptorType {
                expected: descriptor_type::DEVICE,
                found: bytes[1],
            });
        }
        if bytes[0] as usize != Self::LENGTH {
            return Err(ProtocolError::malformed(
                descriptor_type::DEVICE,
                format!("bLength {}, expected {}", bytes[0], Self::LENGTH),
            ));
        }
        Ok(bytes[7])
    }

    pub fn write_to(&self, buf: &mut impl BufMut) {
        buf.put_u8(Self::LENGTH as u8);
        buf.put_u8(descriptor_type::DEVICE);
        buf.put_u16_le(self.usb_version);
        buf.put_u8(self.class);
        buf.put_u8(self.subclass);
        buf.put_u8(self.protocol);
        buf.put_u8(self.max_packet_size0);
        buf.put_u16_le(self.vendor_id);
        buf.put_u16_le(self.product_id);
        buf.put_u16_le(self.device_version);
        buf.put_u8(self.manufacturer_index);
        buf.put_u8(self.product_index);
        buf.put_u8(self.serial_index);
        buf.put_u8(self.num_configurations);
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::LENGTH);
        self.write_to(&mut out);
        out
    }

    /// bcdUSB as (major, minor)
    pub fn usb_release(&self) -> (u8, u8) {
        ((self.usb_version >> 8) as u8, ((self.usb_version >> 4) & 0xF) as u8)
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Configuration descriptor header (9 bytes)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigurationDescriptor {
    /// wTotalLength: header plus every nested descriptor
    pub total_length: u16,
    pub num_interfaces: u8,
    pub configuration_value: u8,
    /// iConfiguration
    pub configuration_index: u8,
    pub attributes: u8,
    /// In 2 mA units
    pub max_power: u8,
}

impl ConfigurationDescriptor {
    pub const LENGTH: usize = 9;

    const SELF_POWERED: u8 = 0x40;
    const REMOTE_WAKEUP: u8 = 0x20;

    /// Parse the header only (the 9-byte fetch made to learn `wTotalLength`)
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let mut body = fixed_body(bytes, descriptor_type::CONFIGURATION, Self::LENGTH)?;
        let header = Self {
            total_length: body.get_u16_le(),
            num_interfaces: body.get_u8(),
            configuration_value: body.get_u8(),
            configuration_index: body.get_u8(),
            attributes: body.get_u8(),
            max_power: body.get_u8(),
        };
        if (header.total_length as usize) < Self::LENGTH {
            return Err(ProtocolError::malformed(
                descriptor_type::CONFIGURATION,
                format!("wTotalLength {} shorter than header", header.total_length),
            ));
        }
        Ok(header)
    }

    pub fn write_to(&self, buf: &mut impl BufMut) {
        buf.put_u8(Self::LENGTH as u8);
        buf.put_u8(descriptor_type::CONFIGURATION);
        buf.put_u16_le(self.total_length);
        buf.put_u8(self.num_interfaces);
        buf.put_u8(self.configuration_value);
        buf.put_u8(self.configuration_index);
        buf.put_u8(self.attributes);
        buf.put_u8(self.max_power);
    }

    pub fn self_powered(&self) -> bool {
        self.attributes & Self::SELF_POWERED != 0
    }

    pub fn remote_wakeup(&self) -> bool {
        self.attributes & Self::REMOTE_WAKEUP != 0
    }

    pub fn max_power_ma(&self) -> u16 {
        u16::from(self.max_power) * 2
    }
}

/// A full configuration: header plus every nested descriptor in wire order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Configuration {
    pub header: ConfigurationDescriptor,
    pub tail: Vec<Descriptor>,
}

/// One interface alternate setting with the descriptors that follow it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceSetting {
    pub interface: InterfaceDescriptor,
    pub endpoints: Vec<EndpointDescriptor>,
    pub hid: Option<HidDescriptor>,
}

impl Configuration {
    /// Parse a complete configuration of exactly `wTotalLength` bytes
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let header_bytes = bytes.get(..ConfigurationDescriptor::LENGTH).unwrap_or(bytes);
        let header = ConfigurationDescriptor::parse(header_bytes)?;
        let total = header.total_length as usize;
        if bytes.len() < total {
            return Err(ProtocolError::BufferTooSmall {
                needed: total,
                available: bytes.len(),
            });
        }

        let mut offset = ConfigurationDescriptor::LENGTH;
        let mut tail = Vec::new();
        while offset < total {
            let (length, dtype) = header_within(&bytes[offset..total])?;
            let record = &bytes[offset..offset + length];
            let descriptor = match dtype {
                descriptor_type::DEVICE | descriptor_type::CONFIGURATION => {
                    return Err(ProtocolError::malformed(
                        dtype,
                        "nested inside a configuration",
                    ));
                }
                _ => Descriptor::parse_record(record)?,
            };
            tail.push(descriptor);
            offset += length;
        }

        Ok(Self { header, tail })
    }

    pub fn write_to(&self, buf: &mut impl BufMut) {
        self.header.write_to(buf);
        for descriptor in &self.tail {
            descriptor.write_to(buf);
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.header.total_length as usize);
        self.write_to(&mut out);
        out
    }

    /// Group the tail into interface alternate settings
    ///
    /// Endpoint and HID descriptors attach to the closest preceding interface;
    /// anything before the first interface and unknown records are skipped.
    pub fn interfaces(&self) -> Vec<InterfaceSetting> {
        let mut settings: Vec<InterfaceSetting> = Vec::new();
        for descriptor in &self.tail {
            match descriptor {
                Descriptor::Interface(interface) => settings.push(InterfaceSetting {
                    interface: interface.clone(),
                    endpoints: Vec::new(),
                    hid: None,
                }),
                Descriptor::Endpoint(endpoint) => {
                    if let Some(current) = settings.last_mut() {
                        current.endpoints.push(endpoint.clone());
                    }
                }
                Descriptor::Hid(hid) => {
                    if let Some(current) = settings.last_mut() {
                        current.hid = Some(hid.clone());
                    }
                }
                _ => {}
            }
        }
        settings
    }

    /// First alternate setting (0) of every interface
    pub fn default_settings(&self) -> Vec<InterfaceSetting> {
        self.interfaces()
            .into_iter()
            .filter(|s| s.interface.alternate_setting == 0)
            .collect()
    }
}

/// Header check for a record that must fit inside `bytes`
fn header_within(bytes: &[u8]) -> Result<(usize, u8)> {
    match header(bytes) {
        Err(ProtocolError::BufferTooSmall { .. }) => Err(ProtocolError::malformed(
            bytes.get(1).copied().unwrap_or(0),
            "record overruns wTotalLength",
        )),
        other => other,
    }
}

// ============================================================================
// Interface
// ============================================================================

/// Interface descriptor (9 bytes)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceDescriptor {
    pub interface_number: u8,
    pub alternate_setting: u8,
    pub num_endpoints: u8,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    /// iInterface
    pub interface_index: u8,
}

impl InterfaceDescriptor {
    pub const LENGTH: usize = 9;

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let mut body = fixed_body(bytes, descriptor_type::INTERFACE, Self::LENGTH)?;
        Ok(Self {
            interface_number: body.get_u8(),
            alternate_setting: body.get_u8(),
            num_endpoints: body.get_u8(),
            class: body.get_u8(),
            subclass: body.get_u8(),
            protocol: body.get_u8(),
            interface_index: body.get_u8(),
        })
    }

    pub fn write_to(&self, buf: &mut impl BufMut) {
        buf.put_u8(Self::LENGTH as u8);
        buf.put_u8(descriptor_type::INTERFACE);
        buf.put_u8(self.interface_number);
        buf.put_u8(self.alternate_setting);
        buf.put_u8(self.num_endpoints);
        buf.put_u8(self.class);
        buf.put_u8(self.subclass);
        buf.put_u8(self.protocol);
        buf.put_u8(self.interface_index);
    }
}

// ============================================================================
// Endpoint
// ============================================================================

/// Endpoint descriptor (7 bytes)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointDescriptor {
    /// bEndpointAddress: bit 7 direction, bits 0..3 number
    pub address: u8,
    pub attributes: u8,
    /// Raw wMaxPacketSize, including the high-bandwidth multiplier bits
    pub max_packet_size: u16,
    pub interval: u8,
}

impl EndpointDescriptor {
    pub const LENGTH: usize = 7;

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let mut body = fixed_body(bytes, descriptor_type::ENDPOINT, Self::LENGTH)?;
        Ok(Self {
            address: body.get_u8(),
            attributes: body.get_u8(),
            max_packet_size: body.get_u16_le(),
            interval: body.get_u8(),
        })
    }

    pub fn write_to(&self, buf: &mut impl BufMut) {
        buf.put_u8(Self::LENGTH as u8);
        buf.put_u8(descriptor_type::ENDPOINT);
        buf.put_u8(self.address);
        buf.put_u8(self.attributes);
        buf.put_u16_le(self.max_packet_size);
        buf.put_u8(self.interval);
    }

    pub fn number(&self) -> u8 {
        self.address & 0x0F
    }

    pub fn direction(&self) -> Direction {
        Direction::from_bit7(self.address)
    }

    pub fn transfer_type(&self) -> EndpointType {
        EndpointType::from_attributes(self.attributes)
    }

    /// Payload bytes per transaction (bits 0..10)
    pub fn payload_size(&self) -> u16 {
        self.max_packet_size & 0x07FF
    }

    /// High-speed transactions per microframe (bits 11..12, plus one)
    pub fn transactions_per_microframe(&self) -> u16 {
        ((self.max_packet_size >> 11) & 0x03) + 1
    }
}

// ============================================================================
// String
// ============================================================================

/// String descriptor: UTF-16LE code units (or language IDs for index 0)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StringDescriptor {
    pub code_units: Vec<u16>,
}

impl StringDescriptor {
    pub const HEADER_LENGTH: usize = 2;
    /// Language ID for US English, the usual first entry of string 0
    pub const LANGUAGE_EN_US: u16 = 0x0409;

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let (length, dtype) = header(bytes)?;
        if dtype != descriptor_type::STRING {
            return Err(ProtocolError::UnexpectedDescriptorType {
                expected: descriptor_type::STRING,
                found: dtype,
            });
        }
        if (length - Self::HEADER_LENGTH) % 2 != 0 {
            return Err(ProtocolError::malformed(
                dtype,
                format!("bLength {} leaves a partial UTF-16 code unit", length),
            ));
        }
        let mut body = &bytes[Self::HEADER_LENGTH..length];
        let mut code_units = Vec::with_capacity(body.len() / 2);
        while body.has_remaining() {
            code_units.push(body.get_u16_le());
        }
        Ok(Self { code_units })
    }

    pub fn from_text(text: &str) -> Self {
        Self {
            code_units: text.encode_utf16().collect(),
        }
    }

    pub fn length(&self) -> usize {
        Self::HEADER_LENGTH + self.code_units.len() * 2
    }

    pub fn write_to(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.length() as u8);
        buf.put_u8(descriptor_type::STRING);
        for unit in &self.code_units {
            buf.put_u16_le(*unit);
        }
    }

    /// Decode as text, replacing unpaired surrogates
    pub fn to_string_lossy(&self) -> String {
        char::decode_utf16(self.code_units.iter().copied())
            .map(|c| c.unwrap_or(char::REPLACEMENT_CHARACTER))
            .collect()
    }

    /// Language IDs carried by string descriptor 0
    pub fn language_ids(&self) -> &[u16] {
        &self.code_units
    }
}

// ============================================================================
// HID
// ============================================================================

/// Entry of the HID descriptor's trailing class-descriptor table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HidClassDescriptor {
    pub descriptor_type: u8,
    pub length: u16,
}

/// HID class descriptor (6 bytes + 3 per class descriptor)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HidDescriptor {
    /// bcdHID
    pub hid_version: u16,
    pub country_code: u8,
    pub descriptors: Vec<HidClassDescriptor>,
}

impl HidDescriptor {
    pub const MIN_LENGTH: usize = 6;

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let (length, dtype) = header(bytes)?;
        if dtype != descriptor_type::HID {
            return Err(ProtocolError::UnexpectedDescriptorType {
                expected: descriptor_type::HID,
                found: dtype,
            });
        }
        if length < Self::MIN_LENGTH {
            return Err(ProtocolError::malformed(
                dtype,
                format!("bLength {}, minimum {}", length, Self::MIN_LENGTH),
            ));
        }
        let mut body = &bytes[2..length];
        let hid_version = body.get_u16_le();
        let country_code = body.get_u8();
        let count = body.get_u8() as usize;
        if length != Self::MIN_LENGTH + count * 3 {
            return Err(ProtocolError::malformed(
                dtype,
                format!(
                    "bLength {} does not match {} class descriptors",
                    length, count
                ),
            ));
        }
        let descriptors = (0..count)
            .map(|_| HidClassDescriptor {
                descriptor_type: body.get_u8(),
                length: body.get_u16_le(),
            })
            .collect();
        Ok(Self {
            hid_version,
            country_code,
            descriptors,
        })
    }

    pub fn length(&self) -> usize {
        Self::MIN_LENGTH + self.descriptors.len() * 3
    }

    pub fn write_to(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.length() as u8);
        buf.put_u8(descriptor_type::HID);
        buf.put_u16_le(self.hid_version);
        buf.put_u8(self.country_code);
        buf.put_u8(self.descriptors.len() as u8);
        for entry in &self.descriptors {
            buf.put_u8(entry.descriptor_type);
            buf.put_u16_le(entry.length);
        }
    }

    /// Length of the report descriptor, if advertised
    pub fn report_descriptor_length(&self) -> Option<u16> {
        self.descriptors
            .iter()
            .find(|d| d.descriptor_type == descriptor_type::REPORT)
            .map(|d| d.length)
    }
}

// ============================================================================
// Hub
// ============================================================================

/// USB 2.0 hub descriptor (USB 2.0 table 11-13)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubDescriptor {
    pub num_ports: u8,
    pub characteristics: HubCharacteristics,
    /// bPwrOn2PwrGood, in 2 ms units
    pub power_on_to_good: u8,
    /// bHubContrCurrent, in mA
    pub controller_current: u8,
    /// DeviceRemovable bitmap; bit N describes port N, bit 0 reserved
    pub device_removable: Vec<u8>,
    /// PortPwrCtrlMask, whatever remains of the declared length
    pub port_power_ctrl_mask: Vec<u8>,
}

impl HubDescriptor {
    pub const FIXED_LENGTH: usize = 7;
    /// Largest descriptor a 255-port hub can return
    pub const MAX_LENGTH: usize = Self::FIXED_LENGTH + 2 * 32;

    /// Bytes needed for one per-port bitmap
    pub fn bitmap_len(num_ports: u8) -> usize {
        (num_ports as usize + 1).div_ceil(8)
    }

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let (length, dtype) = header(bytes)?;
        if dtype != descriptor_type::HUB {
            return Err(ProtocolError::UnexpectedDescriptorType {
                expected: descriptor_type::HUB,
                found: dtype,
            });
        }
        if length < Self::FIXED_LENGTH {
            return Err(ProtocolError::malformed(
                dtype,
                format!("bDescLength {}, minimum {}", length, Self::FIXED_LENGTH),
            ));
        }
        let mut body = &bytes[2..length];
        let num_ports = body.get_u8();
        let characteristics = HubCharacteristics(body.get_u16_le());
        let power_on_to_good = body.get_u8();
        let controller_current = body.get_u8();

        let bitmap = Self::bitmap_len(num_ports);
        if body.remaining() < bitmap {
            return Err(ProtocolError::malformed(
                dtype,
                format!(
                    "bDescLength {} too short for the DeviceRemovable bitmap of {} ports",
                    length, num_ports
                ),
            ));
        }
        let device_removable = body[..bitmap].to_vec();
        body.advance(bitmap);
        let port_power_ctrl_mask = body.to_vec();

        Ok(Self {
            num_ports,
            characteristics,
            power_on_to_good,
            controller_current,
            device_removable,
            port_power_ctrl_mask,
        })
    }

    /// Build a descriptor with conventional bitmaps for `num_ports` ports
    pub fn new(num_ports: u8, characteristics: HubCharacteristics, power_on_to_good: u8) -> Self {
        let bitmap = Self::bitmap_len(num_ports);
        Self {
            num_ports,
            characteristics,
            power_on_to_good,
            controller_current: 100,
            device_removable: vec![0; bitmap],
            port_power_ctrl_mask: vec![0xFF; bitmap],
        }
    }

    pub fn length(&self) -> usize {
        Self::FIXED_LENGTH + self.device_removable.len() + self.port_power_ctrl_mask.len()
    }

    pub fn write_to(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.length() as u8);
        buf.put_u8(descriptor_type::HUB);
        buf.put_u8(self.num_ports);
        buf.put_u16_le(self.characteristics.0);
        buf.put_u8(self.power_on_to_good);
        buf.put_u8(self.controller_current);
        buf.put_slice(&self.device_removable);
        buf.put_slice(&self.port_power_ctrl_mask);
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.length());
        self.write_to(&mut out);
        out
    }

    /// Whether the device on `port` (1-based) is non-removable
    pub fn is_fixed(&self, port: u8) -> bool {
        let byte = port as usize / 8;
        let bit = port % 8;
        self.device_removable
            .get(byte)
            .is_some_and(|b| b & (1 << bit) != 0)
    }

    /// Milliseconds to wait after powering a port
    pub fn power_on_delay_ms(&self) -> u64 {
        u64::from(self.power_on_to_good) * 2
    }
}

// ============================================================================
// Any descriptor
// ============================================================================

/// Any descriptor the codec understands, or an opaque blob
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Descriptor {
    Device(DeviceDescriptor),
    Configuration(Configuration),
    Interface(InterfaceDescriptor),
    Endpoint(EndpointDescriptor),
    String(StringDescriptor),
    Hid(HidDescriptor),
    Hub(HubDescriptor),
    /// Unrecognized type; `data` holds the whole record including its header
    Unknown { descriptor_type: u8, data: Vec<u8> },
}

impl Descriptor {
    /// Parse one descriptor and check it has the expected type
    ///
    /// For configurations the input must cover `wTotalLength`; every other
    /// record consumes exactly `bLength` bytes and ignores what follows.
    pub fn parse(bytes: &[u8], expected_type: u8) -> Result<Self> {
        let (_, dtype) = header(bytes)?;
        if dtype != expected_type {
            return Err(ProtocolError::UnexpectedDescriptorType {
                expected: expected_type,
                found: dtype,
            });
        }
        if dtype == descriptor_type::CONFIGURATION {
            return Configuration::parse(bytes).map(Self::Configuration);
        }
        let (length, _) = header(bytes)?;
        Self::parse_record(&bytes[..length])
    }

    /// Parse a single record of exactly `bLength` bytes, any type
    fn parse_record(record: &[u8]) -> Result<Self> {
        let dtype = record[1];
        Ok(match dtype {
            descriptor_type::DEVICE => Self::Device(DeviceDescriptor::parse(record)?),
            descriptor_type::CONFIGURATION => {
                Self::Configuration(Configuration::parse(record)?)
            }
            descriptor_type::INTERFACE => Self::Interface(InterfaceDescriptor::parse(record)?),
            descriptor_type::ENDPOINT => Self::Endpoint(EndpointDescriptor::parse(record)?),
            descriptor_type::STRING => Self::String(StringDescriptor::parse(record)?),
            descriptor_type::HID => Self::Hid(HidDescriptor::parse(record)?),
            descriptor_type::HUB => Self::Hub(HubDescriptor::parse(record)?),
            _ => Self::Unknown {
                descriptor_type: dtype,
                data: record.to_vec(),
            },
        })
    }

    pub fn descriptor_type(&self) -> u8 {
        match self {
            Self::Device(_) => descriptor_type::DEVICE,
            Self::Configuration(_) => descriptor_type::CONFIGURATION,
            Self::Interface(_) => descriptor_type::INTERFACE,
            Self::Endpoint(_) => descriptor_type::ENDPOINT,
            Self::String(_) => descriptor_type::STRING,
            Self::Hid(_) => descriptor_type::HID,
            Self::Hub(_) => descriptor_type::HUB,
            Self::Unknown {
                descriptor_type, ..
            } => *descriptor_type,
        }
    }

    pub fn write_to(&self, buf: &mut impl BufMut) {
        match self {
            Self::Device(d) => d.write_to(buf),
            Self::Configuration(c) => c.write_to(buf),
            Self::Interface(i) => i.write_to(buf),
            Self::Endpoint(e) => e.write_to(buf),
            Self::String(s) => s.write_to(buf),
            Self::Hid(h) => h.write_to(buf),
            Self::Hub(h) => h.write_to(buf),
            Self::Unknown { data, .. } => buf.put_slice(data),
        }
    }

    /// Serialize back to wire bytes
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.write_to(&mut out);
        out
    }
}
