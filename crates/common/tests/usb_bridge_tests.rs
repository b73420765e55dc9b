//! USB Bridge Integration Tests
//!
//! Tests for the async channel bridge between Tokio runtime and USB thread.
//!
//! # Test Scenarios
//! - Command/response flow for scans, listings and controller removal
//! - Event flow for activation, removal and failures
//! - Shutdown and dropped-channel behavior
//! - Errno carried on failure events
//!
//! Run with: `cargo test -p common --test usb_bridge_tests`

use common::{DeviceInfo, Errno, Error, UsbCommand, UsbEvent, create_usb_bridge};
use protocol::{ControllerId, DeviceId, DeviceSpeed, TransferError};
use std::thread;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::timeout;

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Test Utilities
// ============================================================================

fn device_info(id: u32, address: u8) -> DeviceInfo {
    DeviceInfo {
        controller: ControllerId(1),
        id: DeviceId(id),
        address,
        speed: DeviceSpeed::High,
        state: "active".to_string(),
        parent: None,
        port: address,
        vendor_id: 0x1234,
        product_id: 0x5678,
        class: 0x00,
        configuration: 1,
        manufacturer: Some("Test Manufacturer".to_string()),
        product: Some(format!("Test Product {}", id)),
        serial_number: None,
        reservations: 1,
        driver: None,
    }
}

// ============================================================================
// UsbCommand Message Flow Tests
// ============================================================================

#[tokio::test]
async fn test_scan_controller_flow() {
    let (bridge, worker) = create_usb_bridge();

    let handle = thread::spawn(move || {
        if let Ok(UsbCommand::ScanController {
            controller,
            response,
        }) = worker.recv_command()
        {
            assert_eq!(controller, ControllerId(1));
            let _ = response.send(Ok(vec![device_info(0, 1), device_info(1, 2)]));
        }
    });

    let (tx, rx) = oneshot::channel();
    bridge
        .send_command(UsbCommand::ScanController {
            controller: ControllerId(1),
            response: tx,
        })
        .await
        .expect("Failed to send command");

    let devices = timeout(TEST_TIMEOUT, rx)
        .await
        .expect("Timed out")
        .expect("Response dropped")
        .expect("Scan failed");
    assert_eq!(devices.len(), 2);
    assert_eq!(devices[1].address, 2);

    handle.join().expect("Worker thread panicked");
}

#[tokio::test]
async fn test_remove_unknown_controller_flow() {
    let (bridge, worker) = create_usb_bridge();

    let handle = thread::spawn(move || {
        if let Ok(UsbCommand::RemoveController {
            controller,
            response,
        }) = worker.recv_command()
        {
            let _ = response.send(Err(Error::ControllerNotFound(controller)));
        }
    });

    let (tx, rx) = oneshot::channel();
    bridge
        .send_command(UsbCommand::RemoveController {
            controller: ControllerId(9),
            response: tx,
        })
        .await
        .unwrap();

    let result = timeout(TEST_TIMEOUT, rx).await.unwrap().unwrap();
    let err = result.unwrap_err();
    assert_eq!(err.errno(), Errno::ENODEV);

    handle.join().expect("Worker thread panicked");
}

#[tokio::test]
async fn test_port_changed_is_fire_and_forget() {
    let (bridge, worker) = create_usb_bridge();

    bridge
        .send_command(UsbCommand::PortChanged {
            controller: ControllerId(1),
            hub: Some(DeviceId(3)),
            port: 4,
        })
        .await
        .unwrap();

    match worker.try_recv_command() {
        Some(UsbCommand::PortChanged { hub, port, .. }) => {
            assert_eq!(hub, Some(DeviceId(3)));
            assert_eq!(port, 4);
        }
        other => panic!("unexpected command: {:?}", other),
    }
    assert!(worker.try_recv_command().is_none());
}

#[tokio::test]
async fn test_shutdown_command_flow() {
    let (bridge, worker) = create_usb_bridge();

    let handle = thread::spawn(move || {
        loop {
            match worker.recv_command() {
                Ok(UsbCommand::Shutdown) => return true,
                Ok(_) => continue,
                Err(_) => return false,
            }
        }
    });

    let (tx, _rx) = oneshot::channel();
    bridge
        .send_command(UsbCommand::ListDevices { response: tx })
        .await
        .unwrap();
    bridge.send_command(UsbCommand::Shutdown).await.unwrap();

    assert!(handle.join().expect("Worker thread panicked"));
}

#[test]
fn test_worker_sees_closed_channel() {
    let (bridge, worker) = create_usb_bridge();
    drop(bridge);
    assert!(matches!(worker.recv_command(), Err(Error::Channel(_))));
}

// ============================================================================
// UsbEvent Message Flow Tests
// ============================================================================

#[tokio::test]
async fn test_event_sequence() {
    let (bridge, worker) = create_usb_bridge();

    let handle = thread::spawn(move || {
        for i in 0..3 {
            worker
                .send_event(UsbEvent::DeviceActivated {
                    device: device_info(i, i as u8 + 1),
                })
                .expect("Failed to send event");
        }
        worker
            .send_event(UsbEvent::EnumerationFailed {
                controller: ControllerId(1),
                hub: None,
                port: 4,
                errno: Error::from(TransferError::Disconnected).errno(),
                reason: "device disconnected".to_string(),
            })
            .expect("Failed to send event");
        worker
            .send_event(UsbEvent::ControllerRemoved {
                controller: ControllerId(1),
                devices: 3,
            })
            .expect("Failed to send event");
    });

    let mut activated = 0;
    let mut failed = None;
    let mut removed = None;
    for _ in 0..5 {
        match timeout(TEST_TIMEOUT, bridge.recv_event()).await {
            Ok(Ok(UsbEvent::DeviceActivated { .. })) => activated += 1,
            Ok(Ok(UsbEvent::EnumerationFailed { errno, port, .. })) => failed = Some((errno, port)),
            Ok(Ok(UsbEvent::ControllerRemoved { devices, .. })) => removed = Some(devices),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    assert_eq!(activated, 3);
    assert_eq!(failed, Some((Errno::ENODEV, 4)));
    assert_eq!(removed, Some(3));

    handle.join().expect("Worker thread panicked");
}
