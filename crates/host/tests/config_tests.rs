//! Integration tests for configuration parsing
//!
//! Covers:
//! - Minimal and full host configuration files
//! - Nested simulated topologies
//! - Save/load through the filesystem
//! - Invalid configuration handling
//!
//! Run with: `cargo test -p host --test config_tests`

use host::HostConfig;
use host::config::load_config;
use host::sim::SimKind;
use protocol::DeviceSpeed;
use std::time::Duration;
use tempfile::TempDir;

const MINIMAL_CONFIG: &str = r#"
[host]
log_level = "info"
"#;

const FULL_CONFIG: &str = r#"
[host]
log_level = "debug"

[scheduler]
frames = 256
sub_frames = 1
slot_capacity = 1500
ceiling_percent = 90

[enumeration]
control_timeout_ms = 1000
max_retries = 5
retry_backoff_ms = 2
set_address_settle_ms = 2
reset_timeout_ms = 100
port_poll_interval_ms = 20
port_poll_attempts = 8
read_strings = false

[simulation]
root_ports = 2

[[simulation.devices]]
port = 1
kind = "hub"
speed = "high"

[[simulation.devices.children]]
port = 4
kind = "keyboard"
speed = "low"

[[simulation.devices]]
port = 2
kind = "storage"
"#;

fn parse(text: &str) -> HostConfig {
    let config: HostConfig = toml::from_str(text).unwrap();
    config.validate().unwrap();
    config
}

// ============================================================================
// Parsing
// ============================================================================

#[test]
fn test_minimal_config_uses_defaults() {
    let config = parse(MINIMAL_CONFIG);
    assert_eq!(config.scheduler.frames, 1024);
    assert_eq!(config.scheduler.sub_frames, 8);
    assert_eq!(config.scheduler.slot_ceiling(), 6000);
    assert_eq!(config.enumeration.max_retries, 3);
    assert!(config.enumeration.read_strings);
    assert_eq!(config.simulation.root_ports, 4);
}

#[test]
fn test_full_config() {
    let config = parse(FULL_CONFIG);
    assert_eq!(config.host.log_level, "debug");

    assert_eq!(config.scheduler.frames, 256);
    assert_eq!(config.scheduler.slot_ceiling(), 1350);
    assert_eq!(config.scheduler.frame_ceiling(), 1350);

    assert_eq!(config.enumeration.control_timeout(), Duration::from_secs(1));
    assert_eq!(config.enumeration.max_retries, 5);
    assert_eq!(config.enumeration.poll_interval(), Duration::from_millis(20));
    assert!(!config.enumeration.read_strings);

    let devices = &config.simulation.devices;
    assert_eq!(devices.len(), 2);
    assert_eq!(devices[0].kind, SimKind::Hub);
    assert_eq!(devices[0].speed, DeviceSpeed::High);
    assert_eq!(devices[0].children.len(), 1);
    assert_eq!(devices[0].children[0].kind, SimKind::Keyboard);
    assert_eq!(devices[0].children[0].speed, DeviceSpeed::Low);
    // Speed defaults to full
    assert_eq!(devices[1].speed, DeviceSpeed::Full);
}

// ============================================================================
// Invalid configurations
// ============================================================================

#[test]
fn test_invalid_scheduler_geometry() {
    let text = MINIMAL_CONFIG.to_string() + "\n[scheduler]\nframes = 1000\n";
    let config: HostConfig = toml::from_str(&text).unwrap();
    assert!(config.validate().is_err());

    let text = MINIMAL_CONFIG.to_string() + "\n[scheduler]\nsub_frames = 3\n";
    let config: HostConfig = toml::from_str(&text).unwrap();
    assert!(config.validate().is_err());
}

#[test]
fn test_oversized_slot_capacity() {
    let text = MINIMAL_CONFIG.to_string() + "\n[scheduler]\nslot_capacity = 100000000\n";
    let config: HostConfig = toml::from_str(&text).unwrap();
    assert!(config.validate().is_err());

    // The ceiling is still computed without overflow
    assert_eq!(config.scheduler.slot_ceiling(), 80_000_000);
    assert_eq!(config.scheduler.frame_ceiling(), 640_000_000);

    let text = MINIMAL_CONFIG.to_string() + "\n[scheduler]\nslot_capacity = 60000\n";
    let config: HostConfig = toml::from_str(&text).unwrap();
    config.validate().unwrap();
    assert_eq!(config.scheduler.slot_ceiling(), 48_000);
}

#[test]
fn test_children_on_non_hub_rejected() {
    let text = r#"
[[simulation.devices]]
port = 1
kind = "mouse"

[[simulation.devices.children]]
port = 1
kind = "keyboard"
"#;
    let config: HostConfig = toml::from_str(text).unwrap();
    assert!(config.validate().is_err());
}

#[test]
fn test_hub_child_port_out_of_range() {
    let text = r#"
[[simulation.devices]]
port = 1
kind = "hub"

[[simulation.devices.children]]
port = 5
kind = "keyboard"
"#;
    let config: HostConfig = toml::from_str(text).unwrap();
    assert!(config.validate().is_err());
}

#[test]
fn test_unknown_kind_rejected() {
    let text = r#"
[[simulation.devices]]
port = 1
kind = "printer"
"#;
    assert!(toml::from_str::<HostConfig>(text).is_err());
}

// ============================================================================
// Filesystem
// ============================================================================

#[test]
fn test_save_and_load() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nested").join("host.toml");

    let config = parse(FULL_CONFIG);
    config.save(&path).unwrap();

    let loaded = HostConfig::load(Some(path.clone())).unwrap();
    assert_eq!(loaded.scheduler, config.scheduler);
    assert_eq!(loaded.enumeration, config.enumeration);
    assert_eq!(loaded.simulation.devices.len(), 2);

    let loaded = load_config(path.to_str().unwrap()).unwrap();
    assert_eq!(loaded.host.log_level, "debug");
}

#[test]
fn test_load_missing_file() {
    let dir = TempDir::new().unwrap();
    assert!(HostConfig::load(Some(dir.path().join("absent.toml"))).is_err());
}

#[test]
fn test_load_rejects_invalid_values() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("host.toml");
    std::fs::write(&path, "[host]\nlog_level = \"loud\"\n").unwrap();
    assert!(HostConfig::load(Some(path)).is_err());
}
