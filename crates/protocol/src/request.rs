//! Control request (setup packet) encoding
//!
//! A `DeviceRequest` is the 8-byte SETUP payload sent to endpoint 0:
//!
//! ```text
//! [bmRequestType][bRequest][wValue: u16 LE][wIndex: u16 LE][wLength: u16 LE]
//! ```
//!
//! `bmRequestType` packs direction (bit 7), type (bits 5..6) and recipient
//! (bits 0..4); the fields are always extracted with explicit masks.

use crate::error::{ProtocolError, Result};
use crate::types::{Direction, descriptor_type, hid_request, hub_request, request};
use byteorder::{ByteOrder, LittleEndian};

const DIRECTION_MASK: u8 = 0x80;
const TYPE_MASK: u8 = 0x60;
const TYPE_SHIFT: u8 = 5;
const RECIPIENT_MASK: u8 = 0x1F;

/// Request type (bmRequestType bits 5..6)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Standard,
    Class,
    Vendor,
    Reserved,
}

/// Request recipient (bmRequestType bits 0..4)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recipient {
    Device,
    Interface,
    Endpoint,
    Other,
    Reserved(u8),
}

/// Packed bmRequestType byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestType(pub u8);

impl RequestType {
    pub fn new(direction: Direction, kind: RequestKind, recipient: Recipient) -> Self {
        let dir = match direction {
            Direction::Out => 0,
            Direction::In => DIRECTION_MASK,
        };
        let kind = match kind {
            RequestKind::Standard => 0,
            RequestKind::Class => 1,
            RequestKind::Vendor => 2,
            RequestKind::Reserved => 3,
        } << TYPE_SHIFT;
        let recipient = match recipient {
            Recipient::Device => 0,
            Recipient::Interface => 1,
            Recipient::Endpoint => 2,
            Recipient::Other => 3,
            Recipient::Reserved(r) => r & RECIPIENT_MASK,
        };
        Self(dir | kind | recipient)
    }

    pub fn direction(self) -> Direction {
        Direction::from_bit7(self.0)
    }

    pub fn kind(self) -> RequestKind {
        match (self.0 & TYPE_MASK) >> TYPE_SHIFT {
            0 => RequestKind::Standard,
            1 => RequestKind::Class,
            2 => RequestKind::Vendor,
            _ => RequestKind::Reserved,
        }
    }

    pub fn recipient(self) -> Recipient {
        match self.0 & RECIPIENT_MASK {
            0 => Recipient::Device,
            1 => Recipient::Interface,
            2 => Recipient::Endpoint,
            3 => Recipient::Other,
            r => Recipient::Reserved(r),
        }
    }
}

/// One control request
///
/// Stateless; built fresh for every transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceRequest {
    pub request_type: RequestType,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl DeviceRequest {
    /// Size of a setup packet on the wire
    pub const SIZE: usize = 8;

    pub fn new(
        request_type: RequestType,
        request: u8,
        value: u16,
        index: u16,
        length: u16,
    ) -> Self {
        Self {
            request_type,
            request,
            value,
            index,
            length,
        }
    }

    /// Direction of the data stage (or of the status stage's opposite)
    pub fn direction(&self) -> Direction {
        self.request_type.direction()
    }

    pub fn has_data_stage(&self) -> bool {
        self.length > 0
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0] = self.request_type.0;
        out[1] = self.request;
        LittleEndian::write_u16(&mut out[2..4], self.value);
        LittleEndian::write_u16(&mut out[4..6], self.index);
        LittleEndian::write_u16(&mut out[6..8], self.length);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::SIZE {
            return Err(ProtocolError::BufferTooSmall {
                needed: Self::SIZE,
                available: bytes.len(),
            });
        }
        Ok(Self {
            request_type: RequestType(bytes[0]),
            request: bytes[1],
            value: LittleEndian::read_u16(&bytes[2..4]),
            index: LittleEndian::read_u16(&bytes[4..6]),
            length: LittleEndian::read_u16(&bytes[6..8]),
        })
    }

    fn standard(direction: Direction, recipient: Recipient) -> RequestType {
        RequestType::new(direction, RequestKind::Standard, recipient)
    }

    // ------------------------------------------------------------------
    // Standard requests
    // ------------------------------------------------------------------

    /// GET_DESCRIPTOR for a standard descriptor
    pub fn get_descriptor(descriptor_type: u8, index: u8, language: u16, length: u16) -> Self {
        Self::new(
            Self::standard(Direction::In, Recipient::Device),
            request::GET_DESCRIPTOR,
            (u16::from(descriptor_type) << 8) | u16::from(index),
            language,
            length,
        )
    }

    pub fn get_device_descriptor(length: u16) -> Self {
        Self::get_descriptor(descriptor_type::DEVICE, 0, 0, length)
    }

    pub fn get_configuration_descriptor(index: u8, length: u16) -> Self {
        Self::get_descriptor(descriptor_type::CONFIGURATION, index, 0, length)
    }

    pub fn get_string_descriptor(index: u8, language: u16, length: u16) -> Self {
        Self::get_descriptor(descriptor_type::STRING, index, language, length)
    }

    pub fn set_address(address: u8) -> Self {
        Self::new(
            Self::standard(Direction::Out, Recipient::Device),
            request::SET_ADDRESS,
            u16::from(address),
            0,
            0,
        )
    }

    pub fn set_configuration(value: u8) -> Self {
        Self::new(
            Self::standard(Direction::Out, Recipient::Device),
            request::SET_CONFIGURATION,
            u16::from(value),
            0,
            0,
        )
    }

    pub fn get_configuration() -> Self {
        Self::new(
            Self::standard(Direction::In, Recipient::Device),
            request::GET_CONFIGURATION,
            0,
            0,
            1,
        )
    }

    pub fn get_status(recipient: Recipient, index: u16) -> Self {
        Self::new(
            Self::standard(Direction::In, recipient),
            request::GET_STATUS,
            0,
            index,
            2,
        )
    }

    pub fn set_interface(interface: u8, alternate: u8) -> Self {
        Self::new(
            Self::standard(Direction::Out, Recipient::Interface),
            request::SET_INTERFACE,
            u16::from(alternate),
            u16::from(interface),
            0,
        )
    }

    /// CLEAR_FEATURE(ENDPOINT_HALT) on an endpoint
    pub fn clear_endpoint_halt(endpoint: u8) -> Self {
        Self::new(
            Self::standard(Direction::Out, Recipient::Endpoint),
            request::CLEAR_FEATURE,
            0,
            u16::from(endpoint),
            0,
        )
    }

    // ------------------------------------------------------------------
    // Hub class requests
    // ------------------------------------------------------------------

    fn hub(direction: Direction, recipient: Recipient) -> RequestType {
        RequestType::new(direction, RequestKind::Class, recipient)
    }

    fn port_index(selector: u8, port: u8) -> u16 {
        (u16::from(selector) << 8) | u16::from(port)
    }

    pub fn clear_hub_feature(feature: u16) -> Self {
        Self::new(
            Self::hub(Direction::Out, Recipient::Device),
            hub_request::CLEAR_FEATURE,
            feature,
            0,
            0,
        )
    }

    pub fn set_hub_feature(feature: u16) -> Self {
        Self::new(
            Self::hub(Direction::Out, Recipient::Device),
            hub_request::SET_FEATURE,
            feature,
            0,
            0,
        )
    }

    /// ClearPortFeature; `selector` lands in the high byte of wIndex
    pub fn clear_port_feature(feature: u16, selector: u8, port: u8) -> Self {
        Self::new(
            Self::hub(Direction::Out, Recipient::Other),
            hub_request::CLEAR_FEATURE,
            feature,
            Self::port_index(selector, port),
            0,
        )
    }

    /// SetPortFeature; `selector` lands in the high byte of wIndex
    pub fn set_port_feature(feature: u16, selector: u8, port: u8) -> Self {
        Self::new(
            Self::hub(Direction::Out, Recipient::Other),
            hub_request::SET_FEATURE,
            feature,
            Self::port_index(selector, port),
            0,
        )
    }

    pub fn get_hub_status() -> Self {
        Self::new(
            Self::hub(Direction::In, Recipient::Device),
            hub_request::GET_STATUS,
            0,
            0,
            4,
        )
    }

    pub fn get_port_status(port: u8) -> Self {
        Self::new(
            Self::hub(Direction::In, Recipient::Other),
            hub_request::GET_STATUS,
            0,
            u16::from(port),
            4,
        )
    }

    pub fn get_hub_descriptor(descriptor_type: u8, index: u8, length: u16) -> Self {
        Self::new(
            Self::hub(Direction::In, Recipient::Device),
            hub_request::GET_DESCRIPTOR,
            (u16::from(descriptor_type) << 8) | u16::from(index),
            0,
            length,
        )
    }

    pub fn set_hub_descriptor(descriptor_type: u8, index: u8, length: u16) -> Self {
        Self::new(
            Self::hub(Direction::Out, Recipient::Device),
            hub_request::SET_DESCRIPTOR,
            (u16::from(descriptor_type) << 8) | u16::from(index),
            0,
            length,
        )
    }

    /// CLEAR_TT_BUFFER; `value` packs device address, endpoint number and type
    pub fn clear_tt_buffer(value: u16, tt_port: u16) -> Self {
        Self::new(
            Self::hub(Direction::Out, Recipient::Other),
            hub_request::CLEAR_TT_BUFFER,
            value,
            tt_port,
            0,
        )
    }

    pub fn reset_tt(tt_port: u16) -> Self {
        Self::new(
            Self::hub(Direction::Out, Recipient::Other),
            hub_request::RESET_TT,
            0,
            tt_port,
            0,
        )
    }

    pub fn get_tt_state(tt_flags: u16, tt_port: u16, length: u16) -> Self {
        Self::new(
            Self::hub(Direction::In, Recipient::Other),
            hub_request::GET_TT_STATE,
            tt_flags,
            tt_port,
            length,
        )
    }

    pub fn stop_tt(tt_port: u16) -> Self {
        Self::new(
            Self::hub(Direction::Out, Recipient::Other),
            hub_request::STOP_TT,
            0,
            tt_port,
            0,
        )
    }

    // ------------------------------------------------------------------
    // HID class requests
    // ------------------------------------------------------------------

    /// SET_PROTOCOL on a boot-capable interface
    pub fn hid_set_protocol(interface: u8, protocol: u16) -> Self {
        Self::new(
            RequestType::new(Direction::Out, RequestKind::Class, Recipient::Interface),
            hid_request::SET_PROTOCOL,
            protocol,
            u16::from(interface),
            0,
        )
    }

    /// SET_IDLE; `duration` in 4 ms units, 0 = report only on change
    pub fn hid_set_idle(interface: u8, duration: u8, report_id: u8) -> Self {
        Self::new(
            RequestType::new(Direction::Out, RequestKind::Class, Recipient::Interface),
            hid_request::SET_IDLE,
            (u16::from(duration) << 8) | u16::from(report_id),
            u16::from(interface),
            0,
        )
    }
}
