//! Host controller instance
//!
//! A `UsbController` owns one transport, its frame scheduler, the device
//! arena, the address pool and a port table for every hub behind it (the
//! root hub under key `None`). Port events flow through `handle_port`:
//! connect enumerates, disconnect destroys the subtree, over-current
//! disables the one port and reports it.
//!
//! Public operations register as in-flight work. Removal flips the
//! controller into `removing`, cancels every transfer on the transport and
//! waits for in-flight work to drain before tearing devices down.

use crate::address::AddressPool;
use crate::class::{Binding, ClassDriver, default_drivers};
use crate::config::{EnumerationSettings, SchedulerSettings};
use crate::control::ControlEngine;
use crate::device::{DeviceRef, DeviceState, DeviceTable};
use crate::enumeration::Enumerator;
use crate::hub::{self, ExternalHubPorts, HubPorts, HubState, PortEvent, RootHubPorts};
use crate::scheduler::Scheduler;
use crate::transport::{HostController, Pid, Token};
use crate::{lock, wait};
use common::{DeviceInfo, Error, Result, UsbEvent};
use protocol::{
    ControllerId, DeviceId, DeviceSpeed, EndpointType, HubDescriptor, TransferError, feature,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use tracing::{debug, info, warn};

pub struct UsbController {
    id: ControllerId,
    transport: Arc<dyn HostController>,
    control: ControlEngine,
    scheduler: Scheduler,
    devices: DeviceTable,
    addresses: Mutex<AddressPool>,
    default_address: Mutex<()>,
    hubs: Mutex<HashMap<Option<DeviceId>, HubState>>,
    drivers: Vec<Box<dyn ClassDriver>>,
    settings: EnumerationSettings,
    removing: AtomicBool,
    in_flight: Mutex<usize>,
    drained: Condvar,
    events: Option<async_channel::Sender<UsbEvent>>,
}

/// Registration of one in-flight operation
struct InFlight<'a> {
    controller: &'a UsbController,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut count = lock(&self.controller.in_flight);
        *count -= 1;
        if *count == 0 {
            self.controller.drained.notify_all();
        }
    }
}

impl UsbController {
    pub fn new(
        id: ControllerId,
        transport: Arc<dyn HostController>,
        scheduler: SchedulerSettings,
        settings: EnumerationSettings,
        events: Option<async_channel::Sender<UsbEvent>>,
    ) -> Self {
        Self {
            id,
            control: ControlEngine::new(transport.clone(), &settings),
            transport,
            scheduler: Scheduler::new(scheduler),
            devices: DeviceTable::new(),
            addresses: Mutex::new(AddressPool::new()),
            default_address: Mutex::new(()),
            hubs: Mutex::new(HashMap::new()),
            drivers: default_drivers(),
            settings,
            removing: AtomicBool::new(false),
            in_flight: Mutex::new(0),
            drained: Condvar::new(),
            events,
        }
    }

    pub fn id(&self) -> ControllerId {
        self.id
    }

    pub fn name(&self) -> &str {
        self.transport.name()
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn is_removing(&self) -> bool {
        self.removing.load(Ordering::SeqCst)
    }

    fn begin(&self) -> Result<InFlight<'_>> {
        let mut count = lock(&self.in_flight);
        if self.is_removing() {
            return Err(Error::ControllerRemoving(self.id));
        }
        *count += 1;
        Ok(InFlight { controller: self })
    }

    fn enumerator(&self) -> Enumerator<'_> {
        Enumerator {
            control: &self.control,
            scheduler: &self.scheduler,
            addresses: &self.addresses,
            devices: &self.devices,
            default_address: &self.default_address,
            settings: &self.settings,
        }
    }

    fn emit(&self, event: UsbEvent) {
        if let Some(tx) = &self.events {
            if let Err(e) = tx.try_send(event) {
                warn!("Dropping USB event: {}", e);
            }
        }
    }

    /// Start the transport and power the root hub
    pub fn start(&self) -> Result<()> {
        let _op = self.begin()?;
        self.transport.start()?;
        let root = RootHubPorts::new(self.transport.as_ref());
        lock(&self.hubs).insert(None, HubState::new(None, root.port_count()));
        hub::power_on(&root, None)?;
        info!(
            "Controller {} ({}) started with {} root port(s)",
            self.id,
            self.name(),
            root.port_count()
        );
        Ok(())
    }

    /// Run `f` against the port interface of `hub`
    fn with_ports<R>(
        &self,
        hub: Option<DeviceId>,
        f: impl FnOnce(&dyn HubPorts) -> R,
    ) -> Result<R> {
        let count = lock(&self.hubs)
            .get(&hub)
            .map(|h| h.port_count())
            .ok_or(match hub {
                Some(id) => Error::DeviceNotFound(id),
                None => Error::ControllerNotFound(self.id),
            })?;
        match hub {
            None => Ok(f(&RootHubPorts::new(self.transport.as_ref()))),
            Some(id) => {
                let device = self.devices.get(id).ok_or(Error::DeviceNotFound(id))?;
                let target = lock(&device).control_target();
                Ok(f(&ExternalHubPorts::new(&self.control, target, count)))
            }
        }
    }

    fn slot_device(&self, hub: Option<DeviceId>, port: u8) -> Result<(Option<DeviceId>, bool)> {
        let hubs = lock(&self.hubs);
        let state = hubs.get(&hub).ok_or(match hub {
            Some(id) => Error::DeviceNotFound(id),
            None => Error::ControllerNotFound(self.id),
        })?;
        let slot = state.slot(port)?;
        Ok((slot.device, slot.over_current))
    }

    // ------------------------------------------------------------------------
    // Device lifecycle
    // ------------------------------------------------------------------------

    /// Create a `Detected` record on a free hub port
    pub fn create_device(
        &self,
        parent: Option<DeviceId>,
        port: u8,
        speed: DeviceSpeed,
    ) -> Result<DeviceId> {
        let _op = self.begin()?;
        self.create_device_inner(parent, port, speed)
    }

    fn create_device_inner(
        &self,
        parent: Option<DeviceId>,
        port: u8,
        speed: DeviceSpeed,
    ) -> Result<DeviceId> {
        let mut hubs = lock(&self.hubs);
        let state = hubs.get_mut(&parent).ok_or(match parent {
            Some(id) => Error::DeviceNotFound(id),
            None => Error::ControllerNotFound(self.id),
        })?;
        let slot = state.slot_mut(port)?;
        if let Some(existing) = slot.device {
            return Err(Error::InvalidState {
                device: existing,
                state: "attached".to_string(),
                operation: format!("share port {}", port),
            });
        }
        let device = self.devices.insert(parent, port, speed);
        let id = lock(&device).id();
        slot.device = Some(id);
        debug!("Created {} on {:?} port {}", id, parent, port);
        Ok(id)
    }

    /// Enumerate, bind a class driver, and bring up hub ports
    pub fn initialize_device(&self, id: DeviceId) -> Result<()> {
        let _op = self.begin()?;
        self.initialize_inner(id)
    }

    fn initialize_inner(&self, id: DeviceId) -> Result<()> {
        let device = self.devices.get(id).ok_or(Error::DeviceNotFound(id))?;
        let parent = lock(&device).parent();

        self.with_ports(parent, |ports| self.enumerator().initialize(&device, ports))??;

        let hub = self.bind_drivers(&device);
        let info = lock(&device).info(self.id);
        self.emit(UsbEvent::DeviceActivated { device: info });

        if let Some(descriptor) = hub {
            if let Err(e) = self.bring_up_hub(id, descriptor) {
                warn!("Hub {} bring-up failed: {}", id, e);
            }
        }
        Ok(())
    }

    /// Offer the device to each driver in turn; returns a hub binding
    fn bind_drivers(&self, device: &DeviceRef) -> Option<HubDescriptor> {
        let mut d = lock(device);
        for driver in &self.drivers {
            if !driver.probe(&d) {
                continue;
            }
            match driver.bind(&self.control, &d) {
                Ok(binding) => {
                    debug!("{} bound to {}", d.id(), driver.name());
                    d.bind_driver(driver.name());
                    return match binding {
                        Binding::Hub(descriptor) => Some(descriptor),
                        Binding::Bound => None,
                    };
                }
                Err(e) => warn!("{} driver failed to bind {}: {}", driver.name(), d.id(), e),
            }
        }
        None
    }

    fn bring_up_hub(&self, id: DeviceId, descriptor: HubDescriptor) -> Result<()> {
        let count = descriptor.num_ports;
        lock(&self.hubs).insert(Some(id), HubState::new(Some(descriptor.clone()), count));
        self.with_ports(Some(id), |ports| hub::power_on(ports, Some(&descriptor)))??;
        info!("Hub {} powered {} port(s)", id, count);
        self.scan_hub(Some(id));
        Ok(())
    }

    /// Tear down a device and everything behind it
    ///
    /// Returns the schedule reservations released by this device.
    pub fn destroy_device(&self, id: DeviceId) -> Result<usize> {
        let device = self.devices.get(id).ok_or(Error::DeviceNotFound(id))?;

        let downstream = lock(&self.hubs).remove(&Some(id));
        if let Some(state) = downstream {
            for (_, child) in state.devices() {
                if let Err(e) = self.destroy_device(child) {
                    debug!("Child {} of {}: {}", child, id, e);
                }
            }
        }

        let (parent, port, released) = {
            let mut d = lock(&device);
            let released = self.enumerator().teardown(&mut d);
            (d.parent(), d.port(), released)
        };

        let attached = lock(&self.hubs)
            .get_mut(&parent)
            .and_then(|state| state.detach(id))
            .is_some();
        if attached {
            let disabled = self
                .with_ports(parent, |ports| ports.clear_feature(port, feature::PORT_ENABLE))
                .and_then(|r| r.map_err(Error::from));
            if let Err(e) = disabled {
                debug!("Disabling port {} after removing {}: {}", port, id, e);
            }
        }

        self.devices.remove(id);
        info!("Removed {} ({} reservation(s) released)", id, released);
        self.emit(UsbEvent::DeviceRemoved {
            controller: self.id,
            device: id,
            released_reservations: released,
        });
        Ok(released)
    }

    // ------------------------------------------------------------------------
    // Port events
    // ------------------------------------------------------------------------

    /// Enumerate everything attached to the root hub (and behind it)
    pub fn scan(&self) -> Result<Vec<DeviceInfo>> {
        let _op = self.begin()?;
        self.scan_hub(None);
        Ok(self.list_devices())
    }

    /// Service every port of `hub`, siblings in parallel
    fn scan_hub(&self, hub: Option<DeviceId>) {
        let count = lock(&self.hubs).get(&hub).map_or(0, |h| h.port_count());
        thread::scope(|scope| {
            for port in 1..=count {
                scope.spawn(move || self.handle_port(hub, port));
            }
        });
    }

    /// A port reported a change
    pub fn port_changed(&self, hub: Option<DeviceId>, port: u8) -> Result<()> {
        let _op = self.begin()?;
        self.slot_device(hub, port)?;
        self.handle_port(hub, port);
        Ok(())
    }

    fn handle_port(&self, hub: Option<DeviceId>, port: u8) {
        if let Err(e) = self.handle_port_inner(hub, port) {
            warn!("Port {} of {:?}: {}", port, hub, e);
        }
    }

    fn handle_port_inner(&self, hub: Option<DeviceId>, port: u8) -> Result<()> {
        let (attached, over_current) = self.slot_device(hub, port)?;
        let (status, event) =
            self.with_ports(hub, |ports| hub::service_port(ports, port, attached))??;

        if let Some(state) = lock(&self.hubs).get_mut(&hub) {
            state.slot_mut(port)?.status = status;
        }

        match event {
            PortEvent::Connected { .. } if over_current => {
                debug!("Ignoring connection on over-current port {}", port);
            }
            PortEvent::Connected { previous } => {
                if let Some(old) = previous {
                    self.destroy_device(old)?;
                }
                self.enumerate_port(hub, port, status.speed());
            }
            PortEvent::Disconnected(id) => {
                self.destroy_device(id)?;
            }
            PortEvent::OverCurrent { previous } => {
                if let Some(state) = lock(&self.hubs).get_mut(&hub) {
                    state.slot_mut(port)?.over_current = true;
                }
                if let Some(old) = previous {
                    self.destroy_device(old)?;
                }
                self.emit(UsbEvent::PortOverCurrent {
                    controller: self.id,
                    hub,
                    port,
                });
            }
            PortEvent::Idle => {}
        }
        Ok(())
    }

    fn enumerate_port(&self, hub: Option<DeviceId>, port: u8, speed: DeviceSpeed) {
        let result = self
            .create_device_inner(hub, port, speed)
            .and_then(|id| self.initialize_inner(id));
        if let Err(e) = result {
            self.emit(UsbEvent::EnumerationFailed {
                controller: self.id,
                hub,
                port,
                errno: e.errno(),
                reason: e.to_string(),
            });
        }
    }

    /// Service root ports with pending changes and poll every hub's
    /// status-change endpoint
    pub fn poll(&self) {
        let Ok(_op) = self.begin() else {
            return;
        };
        for port in self.transport.poll() {
            self.handle_port(None, port);
        }

        let hubs: Vec<DeviceId> = lock(&self.hubs).keys().flatten().copied().collect();
        for hub_id in hubs {
            match self.poll_hub(hub_id) {
                Ok(ports) => {
                    for port in ports {
                        self.handle_port(Some(hub_id), port);
                    }
                }
                Err(Error::Transfer(TransferError::Nak)) => {}
                Err(e) => debug!("Polling hub {}: {}", hub_id, e),
            }
        }
    }

    /// One interrupt IN on the hub's status-change endpoint
    fn poll_hub(&self, id: DeviceId) -> Result<Vec<u8>> {
        let device = self.devices.get(id).ok_or(Error::DeviceNotFound(id))?;
        let count = lock(&self.hubs).get(&Some(id)).map_or(0, |h| h.port_count());

        let token = {
            let d = lock(&device);
            if d.state() != DeviceState::Active {
                return Ok(Vec::new());
            }
            let Some(endpoint) = d.endpoints().iter().find(|e| {
                e.descriptor.transfer_type() == EndpointType::Interrupt
                    && e.descriptor.direction() == protocol::Direction::In
            }) else {
                return Ok(Vec::new());
            };
            Token {
                address: d.address(),
                endpoint: endpoint.descriptor.number(),
                pid: Pid::In,
                toggle: endpoint.toggle,
                max_packet: endpoint.descriptor.payload_size(),
                speed: d.speed(),
            }
        };

        let mut bitmap = vec![0u8; HubDescriptor::bitmap_len(count)];
        let n = self
            .transport
            .transact(&token, &mut bitmap, self.settings.control_timeout())?;
        if let Some(endpoint) = lock(&device).endpoint_mut(token.endpoint | 0x80) {
            endpoint.toggle.flip();
        }

        let bitmap = &bitmap[..n];
        if hub::hub_changed(bitmap) {
            let over_current = self.with_ports(Some(id), hub::service_hub)??;
            if over_current {
                warn!("Hub {} reports over-current", id);
            }
        }
        Ok(hub::changed_ports(bitmap, count))
    }

    // ------------------------------------------------------------------------
    // Queries and teardown
    // ------------------------------------------------------------------------

    /// Devices that are not `Removed`
    pub fn list_devices(&self) -> Vec<DeviceInfo> {
        self.devices.snapshot(self.id)
    }

    pub fn device_info(&self, id: DeviceId) -> Result<DeviceInfo> {
        let device = self.devices.get(id).ok_or(Error::DeviceNotFound(id))?;
        let info = lock(&device).info(self.id);
        Ok(info)
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Port table of a hub (`None` = root hub)
    pub fn hub_state(&self, hub: Option<DeviceId>) -> Option<HubState> {
        lock(&self.hubs).get(&hub).cloned()
    }

    /// Cancel everything, wait for in-flight work, destroy every device
    ///
    /// Returns the number of devices torn down.
    pub fn remove(&self) -> Result<usize> {
        {
            let _count = lock(&self.in_flight);
            if self.removing.swap(true, Ordering::SeqCst) {
                return Err(Error::ControllerRemoving(self.id));
            }
        }
        self.transport.cancel_all();

        let mut count = lock(&self.in_flight);
        while *count > 0 {
            debug!("Controller {} waiting for {} operation(s)", self.id, *count);
            count = wait(&self.drained, count);
        }
        drop(count);

        let devices = self.devices.len();
        for id in self.devices.children_of(None) {
            if let Err(e) = self.destroy_device(id) {
                debug!("Removing {}: {}", id, e);
            }
        }
        // Anything left is orphaned by a failed hub bring-up
        for id in self.devices.ids() {
            if let Err(e) = self.destroy_device(id) {
                debug!("Removing {}: {}", id, e);
            }
        }
        lock(&self.hubs).clear();

        if let Err(e) = self.transport.stop() {
            warn!("Stopping controller {}: {}", self.id, e);
        }
        info!(
            "Controller {} removed, {} device(s) torn down, {} reservation(s) left",
            self.id,
            devices,
            self.scheduler.reservation_count()
        );
        self.emit(UsbEvent::ControllerRemoved {
            controller: self.id,
            devices,
        });
        Ok(devices)
    }
}
