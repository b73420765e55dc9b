//! USB type definitions shared by the codec and the host core
//!
//! Identifiers, speeds, endpoint attributes and the numeric code tables
//! (class codes, request codes, descriptor types) defined by USB 2.0 chapter 9
//! and the hub class chapter 11.

use serde::{Deserialize, Serialize};

/// Controller identifier (registry-assigned)
///
/// Returned by controller registration and used to address a controller in
/// every later call. Identifiers are never reused within one registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ControllerId(pub u32);

/// Device identifier (controller-assigned)
///
/// Index into a controller's device arena. Hub ports refer to their attached
/// device through this id, never through an owning reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(pub u32);

/// Handle to one periodic bandwidth reservation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ScheduleHandle(pub u64);

impl std::fmt::Display for ControllerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "hc{}", self.0)
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "dev{}", self.0)
    }
}

impl std::fmt::Display for ScheduleHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sched#{}", self.0)
    }
}

/// USB device speed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceSpeed {
    /// Speed not (yet) known
    #[default]
    Unknown,
    /// Low speed - 1.5 Mbps (USB 1.0)
    Low,
    /// Full speed - 12 Mbps (USB 1.1)
    Full,
    /// High speed - 480 Mbps (USB 2.0)
    High,
    /// SuperSpeed - 5 Gbps (USB 3.0)
    Super,
}

impl DeviceSpeed {
    /// Default control endpoint packet size before `bMaxPacketSize0` is known
    pub fn bootstrap_max_packet(self) -> u16 {
        8
    }

    /// Whether the speed schedules in microframes rather than whole frames
    pub fn uses_microframes(self) -> bool {
        matches!(self, Self::High | Self::Super)
    }
}

impl std::fmt::Display for DeviceSpeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Unknown => "unknown",
            Self::Low => "low",
            Self::Full => "full",
            Self::High => "high",
            Self::Super => "super",
        };
        f.write_str(s)
    }
}

/// Endpoint transfer type (bmAttributes bits 0..1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointType {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

impl EndpointType {
    pub fn from_attributes(attributes: u8) -> Self {
        match attributes & 0x03 {
            0 => Self::Control,
            1 => Self::Isochronous,
            2 => Self::Bulk,
            _ => Self::Interrupt,
        }
    }

    pub fn to_attributes(self) -> u8 {
        match self {
            Self::Control => 0,
            Self::Isochronous => 1,
            Self::Bulk => 2,
            Self::Interrupt => 3,
        }
    }

    /// Interrupt and isochronous endpoints need reserved frame bandwidth
    pub fn is_periodic(self) -> bool {
        matches!(self, Self::Isochronous | Self::Interrupt)
    }
}

/// Data direction (bit 7 of an endpoint address or bmRequestType)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Host to device
    Out,
    /// Device to host
    In,
}

impl Direction {
    pub fn from_bit7(value: u8) -> Self {
        if value & 0x80 != 0 {
            Self::In
        } else {
            Self::Out
        }
    }

    pub fn opposite(self) -> Self {
        match self {
            Self::Out => Self::In,
            Self::In => Self::Out,
        }
    }
}

/// DATA0/DATA1 sequence bit
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum DataToggle {
    #[default]
    Data0,
    Data1,
}

impl DataToggle {
    pub fn flipped(self) -> Self {
        match self {
            Self::Data0 => Self::Data1,
            Self::Data1 => Self::Data0,
        }
    }

    pub fn flip(&mut self) {
        *self = self.flipped();
    }
}

/// Device and interface class codes
///
/// See <https://www.usb.org/defined-class-codes>.
pub mod class {
    /// Use class info in Interface Descriptors
    pub const INTERFACE: u8 = 0x00;
    pub const AUDIO: u8 = 0x01;
    /// Communications and CDC Control
    pub const COMMUNICATION: u8 = 0x02;
    /// Human Interface Device
    pub const HID: u8 = 0x03;
    pub const PHYSICAL: u8 = 0x05;
    pub const STILL_IMAGE: u8 = 0x06;
    pub const PRINTER: u8 = 0x07;
    pub const MASS_STORAGE: u8 = 0x08;
    /// Hub (used in the device descriptor)
    pub const HUB: u8 = 0x09;
    pub const CDC_DATA: u8 = 0x0A;
    pub const SMART_CARD: u8 = 0x0B;
    pub const CONTENT_SECURITY: u8 = 0x0D;
    pub const VIDEO: u8 = 0x0E;
    pub const PERSONAL_HEALTHCARE: u8 = 0x0F;
    pub const AUDIO_VIDEO: u8 = 0x10;
    pub const BILLBOARD: u8 = 0x11;
    pub const TYPE_C_BRIDGE: u8 = 0x12;
    pub const BULK_DISPLAY: u8 = 0x13;
    pub const MCTP_OVER_USB: u8 = 0x14;
    pub const I3C: u8 = 0x3C;
    pub const DIAGNOSTIC: u8 = 0xDC;
    pub const WIRELESS_CONTROLLER: u8 = 0xE0;
    pub const MISC: u8 = 0xEF;
    pub const APPLICATION_SPECIFIC: u8 = 0xFE;
    pub const VENDOR_SPECIFIC: u8 = 0xFF;

    /// HID subclass codes
    pub const HID_SUBCLASS_NONE: u8 = 0x00;
    pub const HID_SUBCLASS_BOOT: u8 = 0x01;

    /// HID boot protocol codes
    pub const HID_PROTOCOL_NONE: u8 = 0x00;
    pub const HID_PROTOCOL_KEYBOARD: u8 = 0x01;
    pub const HID_PROTOCOL_MOUSE: u8 = 0x02;

    /// Human readable class name, used in logs
    pub fn name(code: u8) -> &'static str {
        match code {
            INTERFACE => "per-interface",
            AUDIO => "audio",
            COMMUNICATION => "communication",
            HID => "hid",
            PHYSICAL => "physical",
            STILL_IMAGE => "still-image",
            PRINTER => "printer",
            MASS_STORAGE => "mass-storage",
            HUB => "hub",
            CDC_DATA => "cdc-data",
            SMART_CARD => "smart-card",
            CONTENT_SECURITY => "content-security",
            VIDEO => "video",
            PERSONAL_HEALTHCARE => "personal-healthcare",
            AUDIO_VIDEO => "audio-video",
            BILLBOARD => "billboard",
            TYPE_C_BRIDGE => "type-c-bridge",
            BULK_DISPLAY => "bulk-display",
            MCTP_OVER_USB => "mctp",
            I3C => "i3c",
            DIAGNOSTIC => "diagnostic",
            WIRELESS_CONTROLLER => "wireless",
            MISC => "misc",
            APPLICATION_SPECIFIC => "application-specific",
            VENDOR_SPECIFIC => "vendor-specific",
            _ => "reserved",
        }
    }
}

/// Standard request codes (USB 2.0 table 9-4)
pub mod request {
    pub const GET_STATUS: u8 = 0x00;
    pub const CLEAR_FEATURE: u8 = 0x01;
    pub const SET_FEATURE: u8 = 0x03;
    pub const SET_ADDRESS: u8 = 0x05;
    pub const GET_DESCRIPTOR: u8 = 0x06;
    pub const SET_DESCRIPTOR: u8 = 0x07;
    pub const GET_CONFIGURATION: u8 = 0x08;
    pub const SET_CONFIGURATION: u8 = 0x09;
    pub const GET_INTERFACE: u8 = 0x0A;
    pub const SET_INTERFACE: u8 = 0x0B;
    pub const SYNCH_FRAME: u8 = 0x0C;
}

/// Hub class request codes (USB 2.0 table 11-16)
pub mod hub_request {
    pub const GET_STATUS: u8 = 0x00;
    pub const CLEAR_FEATURE: u8 = 0x01;
    pub const SET_FEATURE: u8 = 0x03;
    pub const GET_DESCRIPTOR: u8 = 0x06;
    pub const SET_DESCRIPTOR: u8 = 0x07;
    pub const CLEAR_TT_BUFFER: u8 = 0x08;
    pub const RESET_TT: u8 = 0x09;
    pub const GET_TT_STATE: u8 = 0x0A;
    pub const STOP_TT: u8 = 0x0B;
}

/// HID class request codes (HID 1.11 section 7.2)
pub mod hid_request {
    pub const GET_REPORT: u8 = 0x01;
    pub const GET_IDLE: u8 = 0x02;
    pub const GET_PROTOCOL: u8 = 0x03;
    pub const SET_REPORT: u8 = 0x09;
    pub const SET_IDLE: u8 = 0x0A;
    pub const SET_PROTOCOL: u8 = 0x0B;

    /// wValue of SET_PROTOCOL
    pub const BOOT_PROTOCOL: u16 = 0;
    pub const REPORT_PROTOCOL: u16 = 1;
}

/// Descriptor type codes
pub mod descriptor_type {
    pub const DEVICE: u8 = 0x01;
    pub const CONFIGURATION: u8 = 0x02;
    pub const STRING: u8 = 0x03;
    pub const INTERFACE: u8 = 0x04;
    pub const ENDPOINT: u8 = 0x05;
    pub const DEVICE_QUALIFIER: u8 = 0x06;
    pub const OTHER_SPEED: u8 = 0x07;
    pub const INTERFACE_POWER: u8 = 0x08;
    pub const OTG: u8 = 0x09;
    pub const DEBUG: u8 = 0x0A;
    pub const INTERFACE_ASSOCIATION: u8 = 0x0B;
    pub const BOS: u8 = 0x0F;
    pub const DEVICE_CAPABILITY: u8 = 0x10;
    pub const HID: u8 = 0x21;
    pub const REPORT: u8 = 0x22;
    pub const PHYSICAL: u8 = 0x23;
    pub const HUB: u8 = 0x29;
    pub const SUPERSPEED_HUB: u8 = 0x2A;
    pub const SUPERSPEED_ENDPOINT_COMPANION: u8 = 0x30;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_type_attributes() {
        assert_eq!(EndpointType::from_attributes(0x03), EndpointType::Interrupt);
        // Synchronisation/usage bits do not affect the transfer type
        assert_eq!(EndpointType::from_attributes(0x0D), EndpointType::Isochronous);
        assert_eq!(EndpointType::Bulk.to_attributes(), 2);
        assert!(EndpointType::Interrupt.is_periodic());
        assert!(!EndpointType::Bulk.is_periodic());
    }

    #[test]
    fn test_direction_bit() {
        assert_eq!(Direction::from_bit7(0x81), Direction::In);
        assert_eq!(Direction::from_bit7(0x02), Direction::Out);
        assert_eq!(Direction::In.opposite(), Direction::Out);
    }

    #[test]
    fn test_toggle_flip() {
        let mut toggle = DataToggle::default();
        toggle.flip();
        assert_eq!(toggle, DataToggle::Data1);
        assert_eq!(toggle.flipped(), DataToggle::Data0);
    }

    #[test]
    fn test_class_names() {
        assert_eq!(class::name(class::HUB), "hub");
        assert_eq!(class::name(0x42), "reserved");
    }
}
