//! Host configuration management

use crate::sim::SimKind;
use anyhow::{Context, Result, anyhow};
use protocol::DeviceSpeed;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostConfig {
    #[serde(default)]
    pub host: HostSettings,
    /// Periodic frame schedule geometry and ceiling
    #[serde(default)]
    pub scheduler: SchedulerSettings,
    /// Enumeration timing and retry policy
    #[serde(default)]
    pub enumeration: EnumerationSettings,
    /// Simulated bus used by the binary's demo mode
    #[serde(default)]
    pub simulation: SimulationSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostSettings {
    #[serde(default = "HostSettings::default_log_level")]
    pub log_level: String,
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
        }
    }
}

impl HostSettings {
    fn default_log_level() -> String {
        "info".to_string()
    }
}

/// Frame schedule geometry
///
/// Bandwidth is counted in byte-times of one sub-frame slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerSettings {
    /// Frame-list length, power of two
    #[serde(default = "SchedulerSettings::default_frames")]
    pub frames: u32,
    /// Sub-frames per frame: 1, 2, 4 or 8
    #[serde(default = "SchedulerSettings::default_sub_frames")]
    pub sub_frames: u32,
    /// Raw byte-times in one sub-frame
    #[serde(default = "SchedulerSettings::default_slot_capacity")]
    pub slot_capacity: u32,
    /// Share of every slot that periodic traffic may reserve
    #[serde(default = "SchedulerSettings::default_ceiling_percent")]
    pub ceiling_percent: u32,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self::ehci()
    }
}

impl SchedulerSettings {
    pub const MIN_FRAMES: u32 = 8;
    pub const MAX_FRAMES: u32 = 4096;
    /// Largest sub-frame budget accepted from a config file
    pub const MAX_SLOT_CAPACITY: u32 = 60_000;

    fn default_frames() -> u32 {
        1024
    }

    fn default_sub_frames() -> u32 {
        8
    }

    fn default_slot_capacity() -> u32 {
        7500 // one high-speed microframe
    }

    fn default_ceiling_percent() -> u32 {
        80
    }

    /// High-speed controller: 1024 frames of 8 microframes
    pub fn ehci() -> Self {
        Self {
            frames: Self::default_frames(),
            sub_frames: Self::default_sub_frames(),
            slot_capacity: Self::default_slot_capacity(),
            ceiling_percent: Self::default_ceiling_percent(),
        }
    }

    /// Full-speed controller: 1024 whole frames, 900 byte-times reservable
    pub fn uhci() -> Self {
        Self {
            frames: 1024,
            sub_frames: 1,
            slot_capacity: 1500,
            ceiling_percent: 60,
        }
    }

    /// Reservable byte-times per slot
    pub fn slot_ceiling(&self) -> u32 {
        let ceiling = u64::from(self.slot_capacity) * u64::from(self.ceiling_percent) / 100;
        u32::try_from(ceiling).unwrap_or(u32::MAX)
    }

    /// Reservable byte-times per frame
    pub fn frame_ceiling(&self) -> u32 {
        self.slot_ceiling().saturating_mul(self.sub_frames)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.frames.is_power_of_two()
            || !(Self::MIN_FRAMES..=Self::MAX_FRAMES).contains(&self.frames)
        {
            return Err(anyhow!(
                "Invalid scheduler.frames {}, must be a power of two in {}..={}",
                self.frames,
                Self::MIN_FRAMES,
                Self::MAX_FRAMES
            ));
        }
        if ![1, 2, 4, 8].contains(&self.sub_frames) {
            return Err(anyhow!(
                "Invalid scheduler.sub_frames {}, must be 1, 2, 4 or 8",
                self.sub_frames
            ));
        }
        if !(1..=Self::MAX_SLOT_CAPACITY).contains(&self.slot_capacity) {
            return Err(anyhow!(
                "Invalid scheduler.slot_capacity {}, must be 1..={}",
                self.slot_capacity,
                Self::MAX_SLOT_CAPACITY
            ));
        }
        if !(1..=100).contains(&self.ceiling_percent) {
            return Err(anyhow!(
                "Invalid scheduler.ceiling_percent {}, must be 1..=100",
                self.ceiling_percent
            ));
        }
        Ok(())
    }
}

/// Enumeration timing and retry policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnumerationSettings {
    /// Deadline for one control transfer attempt
    #[serde(default = "EnumerationSettings::default_control_timeout")]
    pub control_timeout_ms: u64,
    /// Extra attempts after a stall, NAK or timeout
    #[serde(default = "EnumerationSettings::default_max_retries")]
    pub max_retries: u32,
    /// First backoff; doubled per attempt
    #[serde(default = "EnumerationSettings::default_retry_backoff")]
    pub retry_backoff_ms: u64,
    /// Wait after SET_ADDRESS before talking to the new address
    #[serde(default = "EnumerationSettings::default_settle")]
    pub set_address_settle_ms: u64,
    /// Upper bound on a port reset
    #[serde(default = "EnumerationSettings::default_reset_timeout")]
    pub reset_timeout_ms: u64,
    #[serde(default = "EnumerationSettings::default_poll_interval")]
    pub port_poll_interval_ms: u64,
    #[serde(default = "EnumerationSettings::default_poll_attempts")]
    pub port_poll_attempts: u32,
    /// Fetch manufacturer/product/serial strings
    #[serde(default = "EnumerationSettings::default_read_strings")]
    pub read_strings: bool,
}

impl Default for EnumerationSettings {
    fn default() -> Self {
        Self {
            control_timeout_ms: Self::default_control_timeout(),
            max_retries: Self::default_max_retries(),
            retry_backoff_ms: Self::default_retry_backoff(),
            set_address_settle_ms: Self::default_settle(),
            reset_timeout_ms: Self::default_reset_timeout(),
            port_poll_interval_ms: Self::default_poll_interval(),
            port_poll_attempts: Self::default_poll_attempts(),
            read_strings: Self::default_read_strings(),
        }
    }
}

impl EnumerationSettings {
    fn default_control_timeout() -> u64 {
        5000
    }

    fn default_max_retries() -> u32 {
        3
    }

    fn default_retry_backoff() -> u64 {
        10
    }

    fn default_settle() -> u64 {
        10
    }

    fn default_reset_timeout() -> u64 {
        500
    }

    fn default_poll_interval() -> u64 {
        100
    }

    fn default_poll_attempts() -> u32 {
        16
    }

    fn default_read_strings() -> bool {
        true
    }

    /// No waits at all; for simulated buses
    pub fn immediate() -> Self {
        Self {
            retry_backoff_ms: 0,
            set_address_settle_ms: 0,
            port_poll_interval_ms: 0,
            ..Self::default()
        }
    }

    pub fn control_timeout(&self) -> Duration {
        Duration::from_millis(self.control_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.set_address_settle_ms)
    }

    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.port_poll_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.control_timeout_ms == 0 {
            return Err(anyhow!("enumeration.control_timeout_ms must be greater than 0"));
        }
        if self.max_retries > 16 {
            return Err(anyhow!(
                "Invalid enumeration.max_retries {}, must be at most 16",
                self.max_retries
            ));
        }
        if self.reset_timeout_ms == 0 || self.port_poll_attempts == 0 {
            return Err(anyhow!(
                "enumeration.reset_timeout_ms and port_poll_attempts must be greater than 0"
            ));
        }
        Ok(())
    }
}

/// Simulated topology for demo mode
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationSettings {
    #[serde(default = "SimulationSettings::default_root_ports")]
    pub root_ports: u8,
    #[serde(default)]
    pub devices: Vec<SimDeviceConfig>,
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            root_ports: Self::default_root_ports(),
            devices: vec![
                SimDeviceConfig::new(1, SimKind::Keyboard, DeviceSpeed::Low),
                SimDeviceConfig::new(2, SimKind::Webcam, DeviceSpeed::High),
                SimDeviceConfig {
                    children: vec![
                        SimDeviceConfig::new(1, SimKind::Mouse, DeviceSpeed::Full),
                        SimDeviceConfig::new(3, SimKind::Storage, DeviceSpeed::High),
                    ],
                    ..SimDeviceConfig::new(3, SimKind::Hub, DeviceSpeed::High)
                },
            ],
        }
    }
}

impl SimulationSettings {
    fn default_root_ports() -> u8 {
        4
    }
}

/// One simulated device
///
/// # Example Configuration
/// ```toml
/// [[simulation.devices]]
/// port = 1
/// kind = "hub"
/// speed = "high"
///
/// [[simulation.devices.children]]
/// port = 2
/// kind = "keyboard"
/// speed = "low"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimDeviceConfig {
    pub port: u8,
    pub kind: SimKind,
    #[serde(default = "SimDeviceConfig::default_speed")]
    pub speed: DeviceSpeed,
    /// Downstream devices; hubs only
    #[serde(default)]
    pub children: Vec<SimDeviceConfig>,
}

impl SimDeviceConfig {
    pub fn new(port: u8, kind: SimKind, speed: DeviceSpeed) -> Self {
        Self {
            port,
            kind,
            speed,
            children: Vec::new(),
        }
    }

    fn default_speed() -> DeviceSpeed {
        DeviceSpeed::Full
    }
}

impl HostConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            // Try standard locations in order
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/usb-host/host.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: HostConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("usb-host").join("host.toml")
        } else {
            PathBuf::from(".config/usb-host/host.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.host.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.host.log_level,
                valid_levels.join(", ")
            ));
        }

        self.scheduler.validate()?;
        self.enumeration.validate()?;

        if self.simulation.root_ports == 0 {
            return Err(anyhow!("simulation.root_ports must be greater than 0"));
        }
        Self::validate_sim_devices(&self.simulation.devices, self.simulation.root_ports)?;

        Ok(())
    }

    /// Ports must exist and be unique; only hubs carry children
    fn validate_sim_devices(devices: &[SimDeviceConfig], ports: u8) -> Result<()> {
        let mut seen = Vec::new();
        for device in devices {
            if device.port == 0 || device.port > ports {
                return Err(anyhow!(
                    "Simulated {:?} on port {}, hub has ports 1..={}",
                    device.kind,
                    device.port,
                    ports
                ));
            }
            if seen.contains(&device.port) {
                return Err(anyhow!("Port {} used twice", device.port));
            }
            seen.push(device.port);

            if device.kind == SimKind::Hub {
                Self::validate_sim_devices(&device.children, SimKind::HUB_PORTS)?;
            } else if !device.children.is_empty() {
                return Err(anyhow!(
                    "Simulated {:?} on port {} has children but is not a hub",
                    device.kind,
                    device.port
                ));
            }
        }
        Ok(())
    }
}

/// Load configuration from a path with `~` expansion
pub fn load_config(path: &str) -> Result<HostConfig> {
    let path_buf = PathBuf::from(shellexpand::tilde(path).as_ref());
    HostConfig::load(Some(path_buf))
}
