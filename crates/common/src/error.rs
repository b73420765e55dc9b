//! Common error types

use crate::errno::Errno;
use protocol::{ControllerId, DeviceId, ProtocolError, ScheduleHandle, TransferError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Descriptor error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Transfer error: {0}")]
    Transfer(#[from] TransferError),

    /// Admission refused; never retried by the core
    #[error("Insufficient bandwidth: {required} byte-times required, {available} available")]
    InsufficientBandwidth { required: u32, available: u32 },

    #[error("Invalid schedule handle: {0}")]
    InvalidHandle(ScheduleHandle),

    #[error("Polling interval {interval} cannot be scheduled in a {frames}-frame list")]
    InvalidInterval { interval: u32, frames: u32 },

    /// Address handed out twice; indicates a device-model bug
    #[error("Address {0} already in use")]
    AddressConflict(u8),

    #[error("No free device address")]
    AddressExhausted,

    #[error("Device not found: {0}")]
    DeviceNotFound(DeviceId),

    #[error("Controller not found: {0}")]
    ControllerNotFound(ControllerId),

    #[error("Controller {0} is being removed")]
    ControllerRemoving(ControllerId),

    #[error("Device {device} is {state}, cannot {operation}")]
    InvalidState {
        device: DeviceId,
        state: String,
        operation: String,
    },

    #[error("Port {port} out of range (hub has {ports} ports)")]
    PortOutOfRange { port: u8, ports: u8 },

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Map onto the kernel's generic error taxonomy
    pub fn errno(&self) -> Errno {
        match self {
            Self::Protocol(_) => Errno::EINVAL,
            Self::Transfer(e) => match e {
                TransferError::Stall => Errno::EPIPE,
                TransferError::Nak => Errno::EAGAIN,
                TransferError::Timeout => Errno::ETIMEDOUT,
                TransferError::Disconnected => Errno::ENODEV,
                TransferError::Protocol(_) => Errno::EPROTO,
                TransferError::Cancelled => Errno::ECANCELED,
            },
            Self::InsufficientBandwidth { .. } => Errno::ENOSPC,
            Self::InvalidHandle(_) => Errno::EBADF,
            Self::InvalidInterval { .. } => Errno::EINVAL,
            Self::AddressConflict(_) => Errno::EEXIST,
            Self::AddressExhausted => Errno::EBUSY,
            Self::DeviceNotFound(_) | Self::ControllerNotFound(_) => Errno::ENODEV,
            Self::ControllerRemoving(_) => Errno::ESHUTDOWN,
            Self::InvalidState { .. } | Self::PortOutOfRange { .. } | Self::Config(_) => {
                Errno::EINVAL
            }
            Self::Channel(_) | Self::Io(_) => Errno::EIO,
        }
    }

    /// Negative errno, as returned across the kernel boundary
    pub fn to_kernel_code(&self) -> i32 {
        -self.errno().code()
    }

    /// Whether the device behind this error is gone
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            Self::Transfer(TransferError::Disconnected | TransferError::Cancelled)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
