//! USB worker thread
//!
//! All bus work is blocking, so it runs on a dedicated thread that owns the
//! registry and talks to the Tokio side over the `common` channel bridge.
//! Each loop iteration drains one command, then services pending port
//! changes on every controller, then sleeps for the port poll interval.

use crate::registry::UsbRegistry;
use common::{UsbCommand, UsbWorker};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub struct UsbWorkerThread {
    registry: Arc<UsbRegistry>,
    /// Communication channel with Tokio runtime
    worker: UsbWorker,
    poll_interval: Duration,
}

impl UsbWorkerThread {
    pub fn new(registry: Arc<UsbRegistry>, worker: UsbWorker, poll_interval: Duration) -> Self {
        Self {
            registry,
            worker,
            poll_interval,
        }
    }

    /// Run until a Shutdown command arrives or the bridge closes
    pub fn run(self) {
        info!("USB worker thread started");

        loop {
            match self.worker.try_recv_command() {
                Some(UsbCommand::Shutdown) => {
                    info!("USB worker shutting down");
                    break;
                }
                Some(cmd) => self.handle_command(cmd),
                None => {
                    if self.worker.event_tx.is_closed() {
                        warn!("Event receiver dropped, stopping USB worker");
                        break;
                    }
                }
            }

            self.registry.poll_all();
            std::thread::sleep(self.poll_interval);
        }

        self.registry.shutdown();
        info!("USB worker thread stopped");
    }

    /// Handle a command from the Tokio runtime
    fn handle_command(&self, cmd: UsbCommand) {
        // A panic in one command must not take the bus down with it
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            self.handle_command_inner(cmd)
        }));

        if let Err(e) = result {
            error!("Panic in USB command handler: {:?}", e);
        }
    }

    fn handle_command_inner(&self, cmd: UsbCommand) {
        match cmd {
            UsbCommand::ScanController {
                controller,
                response,
            } => {
                debug!("Scanning controller {}", controller);
                let _ = response.send(self.registry.scan(controller));
            }

            UsbCommand::PortChanged {
                controller,
                hub,
                port,
            } => {
                debug!("Port {} of {:?} on {} changed", port, hub, controller);
                if let Err(e) = self.registry.port_changed(controller, hub, port) {
                    warn!("Port change on controller {}: {}", controller, e);
                }
            }

            UsbCommand::ListDevices { response } => {
                let devices = self.registry.list_devices();
                debug!("Listing {} devices", devices.len());
                let _ = response.send(devices);
            }

            UsbCommand::RemoveController {
                controller,
                response,
            } => {
                let result = self.registry.remove_controller(controller).map(|_| ());
                let _ = response.send(result);
            }

            UsbCommand::Shutdown => {
                // Handled in the main loop
            }
        }
    }
}

/// Spawn the USB worker thread
pub fn spawn_usb_worker(
    registry: Arc<UsbRegistry>,
    worker: UsbWorker,
    poll_interval: Duration,
) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name("usb-worker".to_string())
        .spawn(move || UsbWorkerThread::new(registry, worker, poll_interval).run())
        .expect("Failed to spawn USB worker thread")
}
