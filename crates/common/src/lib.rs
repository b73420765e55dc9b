//! Common utilities for the USB host subsystem
//!
//! Shared between the host core and its binary: the subsystem error type and
//! its errno mapping, logging setup, and the async channel bridge to the
//! blocking USB worker thread.

pub mod channel;
pub mod errno;
pub mod error;
pub mod logging;

pub use channel::{DeviceInfo, UsbBridge, UsbCommand, UsbEvent, UsbWorker, create_usb_bridge};
pub use errno::Errno;
pub use error::{Error, Result};
pub use logging::setup_logging;
