//! Host-controller transport
//!
//! The register-level driver beneath the core. A transport moves single
//! packets on the bus, reports root-port state and can abort everything in
//! flight; scheduling policy and the device model live above it.

use protocol::{DataToggle, DeviceSpeed, PortStatus, TransferError};
use std::time::Duration;

/// Packet identifier of a token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pid {
    Setup,
    In,
    Out,
}

/// Everything the controller needs to issue one transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token {
    pub address: u8,
    pub endpoint: u8,
    pub pid: Pid,
    pub toggle: DataToggle,
    /// Largest packet the endpoint accepts
    pub max_packet: u16,
    pub speed: DeviceSpeed,
}

/// A host controller (EHCI, UHCI, xHCI, or a simulation)
///
/// Implementations are internally synchronized: sibling enumerations call
/// `transact` from several threads at once.
pub trait HostController: Send + Sync {
    fn name(&self) -> &str;

    fn start(&self) -> Result<(), TransferError>;
    fn stop(&self) -> Result<(), TransferError>;
    fn reset(&self) -> Result<(), TransferError>;

    /// Root ports with pending change bits
    fn poll(&self) -> Vec<u8>;

    fn root_port_count(&self) -> u8;
    fn root_port_status(&self, port: u8) -> Result<PortStatus, TransferError>;
    fn set_root_port_feature(&self, port: u8, feature: u16) -> Result<(), TransferError>;
    fn clear_root_port_feature(&self, port: u8, feature: u16) -> Result<(), TransferError>;

    /// Run one transaction
    ///
    /// SETUP and OUT send `data`; IN fills it. Returns the bytes moved, which
    /// for IN may be less than `data.len()` (short packet).
    fn transact(
        &self,
        token: &Token,
        data: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransferError>;

    /// Abort every outstanding and future transaction with `Cancelled`
    fn cancel_all(&self);
}
