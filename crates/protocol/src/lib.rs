//! USB wire formats for the host subsystem
//!
//! This crate holds everything that travels over the bus and nothing that
//! keeps state: the descriptor codec, the 8-byte setup packet, hub and port
//! status words, and the numeric code tables of USB 2.0 chapters 9 and 11.
//!
//! # Example
//!
//! ```
//! use protocol::{Descriptor, DeviceRequest, descriptor_type};
//!
//! // Ask for the first 8 bytes of the device descriptor
//! let setup = DeviceRequest::get_device_descriptor(8);
//! assert_eq!(setup.to_bytes(), [0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x08, 0x00]);
//!
//! // Parse what came back
//! let bytes = [0x07, 0x05, 0x81, 0x03, 0x08, 0x00, 0x0A];
//! let endpoint = Descriptor::parse(&bytes, descriptor_type::ENDPOINT).unwrap();
//! assert_eq!(endpoint.serialize(), bytes);
//! ```

pub mod descriptor;
pub mod error;
pub mod hub;
pub mod request;
pub mod types;

pub use descriptor::{
    Configuration, ConfigurationDescriptor, Descriptor, DeviceDescriptor, EndpointDescriptor,
    HidClassDescriptor, HidDescriptor, HubDescriptor, InterfaceDescriptor, InterfaceSetting,
    StringDescriptor,
};
pub use error::{ProtocolError, Result, TransferError};
pub use hub::{
    HubCharacteristics, HubStatus, MAX_HUB_PORTS, OverCurrentMode, PortStatus, PowerSwitching,
    feature,
};
pub use request::{DeviceRequest, Recipient, RequestKind, RequestType};
pub use types::{
    ControllerId, DataToggle, DeviceId, DeviceSpeed, Direction, EndpointType, ScheduleHandle,
    class, descriptor_type, hid_request, hub_request,
};
