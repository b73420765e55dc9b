//! USB host subsystem core
//!
//! Host controllers register with a `UsbRegistry`; each becomes a
//! `UsbController` that enumerates devices behind its root hub and any
//! external hubs, reserves periodic bandwidth in its frame scheduler, and
//! binds class drivers. All bus work is blocking and runs on the worker
//! thread; the async side talks to it through `common::UsbBridge`.

pub mod address;
pub mod class;
pub mod config;
pub mod control;
pub mod controller;
pub mod device;
pub mod enumeration;
pub mod hub;
pub mod registry;
pub mod scheduler;
pub mod sim;
pub mod transport;
pub mod worker;

pub use config::{EnumerationSettings, HostConfig, SchedulerSettings};
pub use controller::UsbController;
pub use device::{DeviceState, UsbDevice};
pub use registry::UsbRegistry;
pub use scheduler::{BandwidthRequest, Scheduler};
pub use sim::{DeviceProfile, SimController};
pub use transport::HostController;
pub use worker::{UsbWorkerThread, spawn_usb_worker};

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

// Poisoning only means another thread panicked mid-update; the worker
// catches command panics, so keep going with the data as it is.

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn wait<'a, T>(condvar: &Condvar, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
    condvar.wait(guard).unwrap_or_else(PoisonError::into_inner)
}
