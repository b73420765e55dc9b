//! Protocol error types

use thiserror::Error;

/// Wire-format errors raised while decoding descriptors and status words
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// Structurally invalid descriptor
    #[error("Malformed descriptor (type {descriptor_type:#04x}): {reason}")]
    MalformedDescriptor { descriptor_type: u8, reason: String },

    /// Buffer too small for the structure being decoded
    #[error("Buffer too small: needed {needed}, got {available}")]
    BufferTooSmall { needed: usize, available: usize },

    /// Descriptor type differs from the one requested
    #[error("Unexpected descriptor type {found:#04x} (expected {expected:#04x})")]
    UnexpectedDescriptorType { expected: u8, found: u8 },
}

impl ProtocolError {
    pub fn malformed(descriptor_type: u8, reason: impl Into<String>) -> Self {
        Self::MalformedDescriptor {
            descriptor_type,
            reason: reason.into(),
        }
    }
}

/// Completion status of a failed bus transaction
///
/// Reported by a host-controller transport for a single packet and surfaced
/// by the control transfer engine once its retry budget is spent.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransferError {
    /// Endpoint returned STALL
    #[error("endpoint stalled")]
    Stall,

    /// Device answered NAK (not ready)
    #[error("device not ready (NAK)")]
    Nak,

    /// No handshake before the deadline
    #[error("transfer timed out")]
    Timeout,

    /// Device is no longer attached
    #[error("device disconnected")]
    Disconnected,

    /// CRC, bit-stuffing, babble or other bus protocol failure
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Transfer aborted by the host (controller removal)
    #[error("transfer cancelled")]
    Cancelled,
}

impl TransferError {
    /// Stall, NAK and timeout are treated as "not ready" and may be retried
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Stall | Self::Nak | Self::Timeout)
    }
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;
