//! Async channel bridge between Tokio runtime and USB thread

use crate::errno::Errno;
use async_channel::{Receiver, Sender, bounded};
use protocol::{ControllerId, DeviceId, DeviceSpeed};
use serde::Serialize;

/// Snapshot of one enumerated device, as reported to the async side
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub controller: ControllerId,
    pub id: DeviceId,
    pub address: u8,
    pub speed: DeviceSpeed,
    /// Lifecycle state name (`active`, `configured`, ...)
    pub state: String,
    /// Upstream hub; `None` for root ports
    pub parent: Option<DeviceId>,
    pub port: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub class: u8,
    pub configuration: u8,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
    /// Periodic bandwidth reservations held by the device
    pub reservations: usize,
    /// Class driver bound after activation
    pub driver: Option<String>,
}

/// Commands from Tokio runtime to USB thread
#[derive(Debug)]
pub enum UsbCommand {
    /// Start a controller and enumerate everything behind its root hub
    ScanController {
        controller: ControllerId,
        /// Devices that reached `Active`
        response: tokio::sync::oneshot::Sender<crate::Result<Vec<DeviceInfo>>>,
    },

    /// A port reported a status change (interrupt or poll)
    ///
    /// Outcomes come back as events.
    PortChanged {
        controller: ControllerId,
        /// Hub device; `None` for the root hub
        hub: Option<DeviceId>,
        port: u8,
    },

    /// List every device on every controller
    ListDevices {
        response: tokio::sync::oneshot::Sender<Vec<DeviceInfo>>,
    },

    /// Tear down a controller and all of its devices
    RemoveController {
        controller: ControllerId,
        response: tokio::sync::oneshot::Sender<crate::Result<()>>,
    },

    /// Shutdown the USB thread gracefully
    Shutdown,
}

/// Events from the USB thread
#[derive(Debug, Clone)]
pub enum UsbEvent {
    /// Device finished enumeration and holds its bandwidth
    DeviceActivated { device: DeviceInfo },

    /// Device left (disconnect or teardown)
    DeviceRemoved {
        controller: ControllerId,
        device: DeviceId,
        /// Reservations returned to the scheduler
        released_reservations: usize,
    },

    /// Enumeration of a newly connected device failed; siblings unaffected
    EnumerationFailed {
        controller: ControllerId,
        hub: Option<DeviceId>,
        port: u8,
        errno: Errno,
        reason: String,
    },

    /// Port disabled after over-current
    PortOverCurrent {
        controller: ControllerId,
        hub: Option<DeviceId>,
        port: u8,
    },

    /// Controller fully torn down
    ControllerRemoved {
        controller: ControllerId,
        devices: usize,
    },
}

/// Handle for Tokio runtime (async)
#[derive(Clone)]
pub struct UsbBridge {
    cmd_tx: Sender<UsbCommand>,
    event_rx: Receiver<UsbEvent>,
}

impl UsbBridge {
    /// Send a command to the USB thread
    pub async fn send_command(&self, cmd: UsbCommand) -> crate::Result<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Receive an event from the USB thread
    pub async fn recv_event(&self) -> crate::Result<UsbEvent> {
        self.event_rx
            .recv()
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Send a command from a plain thread
    pub fn send_command_blocking(&self, cmd: UsbCommand) -> crate::Result<()> {
        self.cmd_tx
            .send_blocking(cmd)
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }
}

/// Handle for USB thread (blocking)
pub struct UsbWorker {
    pub(crate) cmd_rx: Receiver<UsbCommand>,
    /// Event sender (public for USB worker thread to access)
    pub event_tx: Sender<UsbEvent>,
}

impl UsbWorker {
    /// Receive a command from Tokio runtime (blocking)
    pub fn recv_command(&self) -> crate::Result<UsbCommand> {
        self.cmd_rx
            .recv_blocking()
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Try to receive a command without blocking
    pub fn try_recv_command(&self) -> Option<UsbCommand> {
        self.cmd_rx.try_recv().ok()
    }

    /// Send an event to Tokio runtime (blocking)
    pub fn send_event(&self, event: UsbEvent) -> crate::Result<()> {
        self.event_tx
            .send_blocking(event)
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }
}

/// Create the channel bridge between Tokio and USB thread
///
/// Returns (UsbBridge for Tokio, UsbWorker for USB thread)
pub fn create_usb_bridge() -> (UsbBridge, UsbWorker) {
    let (cmd_tx, cmd_rx) = bounded(256);
    let (event_tx, event_rx) = bounded(256);

    (
        UsbBridge { cmd_tx, event_rx },
        UsbWorker { cmd_rx, event_tx },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_bridge() {
        let (bridge, worker) = create_usb_bridge();

        // Spawn a thread to simulate USB worker
        let handle = std::thread::spawn(move || {
            let cmd = worker.recv_command().unwrap();
            matches!(cmd, UsbCommand::ListDevices { .. })
        });

        // Send command from async context
        let (tx, _rx) = tokio::sync::oneshot::channel();
        bridge
            .send_command(UsbCommand::ListDevices { response: tx })
            .await
            .unwrap();

        assert!(handle.join().unwrap());
    }
}
