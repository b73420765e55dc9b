//! Controller registry
//!
//! Maps controller ids to running `UsbController`s and routes device
//! operations to the controller that owns them. Removing a controller takes
//! it out of the map first so no new work can reach it, then tears it down.

use crate::config::{EnumerationSettings, SchedulerSettings};
use crate::controller::UsbController;
use crate::transport::HostController;
use crate::{read, write};
use common::{DeviceInfo, Error, Result, UsbEvent};
use protocol::{ControllerId, DeviceId, DeviceSpeed};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

pub struct UsbRegistry {
    controllers: RwLock<HashMap<ControllerId, Arc<UsbController>>>,
    next_id: AtomicU32,
    scheduler: SchedulerSettings,
    enumeration: EnumerationSettings,
    events: Option<async_channel::Sender<UsbEvent>>,
}

impl UsbRegistry {
    pub fn new(scheduler: SchedulerSettings, enumeration: EnumerationSettings) -> Self {
        Self {
            controllers: RwLock::new(HashMap::new()),
            next_id: AtomicU32::new(0),
            scheduler,
            enumeration,
            events: None,
        }
    }

    /// Report device and port events on `events`
    pub fn with_events(mut self, events: async_channel::Sender<UsbEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Register and start a controller
    ///
    /// Nothing is enumerated until the controller is scanned.
    pub fn add_controller(&self, transport: Arc<dyn HostController>) -> Result<ControllerId> {
        let id = ControllerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let controller = Arc::new(UsbController::new(
            id,
            transport,
            self.scheduler.clone(),
            self.enumeration.clone(),
            self.events.clone(),
        ));
        controller.start()?;
        write(&self.controllers).insert(id, controller);
        info!("Registered controller {}", id);
        Ok(id)
    }

    /// Tear down a controller and every device behind it
    pub fn remove_controller(&self, id: ControllerId) -> Result<usize> {
        let controller = write(&self.controllers)
            .remove(&id)
            .ok_or(Error::ControllerNotFound(id))?;
        controller.remove()
    }

    pub fn controller(&self, id: ControllerId) -> Result<Arc<UsbController>> {
        read(&self.controllers)
            .get(&id)
            .cloned()
            .ok_or(Error::ControllerNotFound(id))
    }

    /// Registered controllers, ordered by id
    pub fn controllers(&self) -> Vec<Arc<UsbController>> {
        let mut controllers: Vec<_> = read(&self.controllers).values().cloned().collect();
        controllers.sort_by_key(|c| c.id());
        controllers
    }

    pub fn create_device(
        &self,
        controller: ControllerId,
        parent: Option<DeviceId>,
        port: u8,
        speed: DeviceSpeed,
    ) -> Result<DeviceId> {
        self.controller(controller)?.create_device(parent, port, speed)
    }

    pub fn initialize_device(&self, controller: ControllerId, device: DeviceId) -> Result<()> {
        self.controller(controller)?.initialize_device(device)
    }

    /// Returns the reservations the device (alone) released
    pub fn destroy_device(&self, controller: ControllerId, device: DeviceId) -> Result<usize> {
        self.controller(controller)?.destroy_device(device)
    }

    pub fn scan(&self, controller: ControllerId) -> Result<Vec<DeviceInfo>> {
        self.controller(controller)?.scan()
    }

    pub fn port_changed(
        &self,
        controller: ControllerId,
        hub: Option<DeviceId>,
        port: u8,
    ) -> Result<()> {
        self.controller(controller)?.port_changed(hub, port)
    }

    /// Live devices on every controller
    pub fn list_devices(&self) -> Vec<DeviceInfo> {
        self.controllers()
            .iter()
            .flat_map(|c| c.list_devices())
            .collect()
    }

    /// Service pending port changes on every controller
    pub fn poll_all(&self) {
        for controller in self.controllers() {
            debug!("Polling controller {}", controller.id());
            controller.poll();
        }
    }

    /// Remove every controller
    pub fn shutdown(&self) {
        let ids: Vec<ControllerId> = self.controllers().iter().map(|c| c.id()).collect();
        for id in ids {
            if let Err(e) = self.remove_controller(id) {
                debug!("Removing controller {}: {}", id, e);
            }
        }
    }
}
