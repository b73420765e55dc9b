//! Hub class wire structures (USB 2.0 chapter 11)
//!
//! Status and change words are plain integers with named masks; every field
//! is extracted explicitly so the layout never depends on the platform.

use crate::error::{ProtocolError, Result};
use crate::types::DeviceSpeed;
use serde::{Deserialize, Serialize};

/// Hub and port feature selectors (USB 2.0 table 11-17)
pub mod feature {
    pub const C_HUB_LOCAL_POWER: u16 = 0;
    pub const C_HUB_OVER_CURRENT: u16 = 1;

    pub const PORT_CONNECTION: u16 = 0;
    pub const PORT_ENABLE: u16 = 1;
    pub const PORT_SUSPEND: u16 = 2;
    pub const PORT_OVER_CURRENT: u16 = 3;
    pub const PORT_RESET: u16 = 4;
    pub const PORT_POWER: u16 = 8;
    pub const PORT_LOW_SPEED: u16 = 9;
    pub const C_PORT_CONNECTION: u16 = 16;
    pub const C_PORT_ENABLE: u16 = 17;
    pub const C_PORT_SUSPEND: u16 = 18;
    pub const C_PORT_OVER_CURRENT: u16 = 19;
    pub const C_PORT_RESET: u16 = 20;
    pub const PORT_TEST: u16 = 21;
    pub const PORT_INDICATOR: u16 = 22;
}

/// Largest port number a USB 2.0 hub may report
pub const MAX_HUB_PORTS: u8 = 255;

// ============================================================================
// Port status
// ============================================================================

/// `wPortStatus` / `wPortChange` pair returned by GetPortStatus
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortStatus {
    pub status: u16,
    pub change: u16,
}

impl PortStatus {
    pub const WIRE_SIZE: usize = 4;

    // wPortStatus
    pub const CONNECTION: u16 = 0x0001;
    pub const ENABLE: u16 = 0x0002;
    pub const SUSPEND: u16 = 0x0004;
    pub const OVER_CURRENT: u16 = 0x0008;
    pub const RESET: u16 = 0x0010;
    pub const POWER: u16 = 0x0100;
    pub const LOW_SPEED: u16 = 0x0200;
    pub const HIGH_SPEED: u16 = 0x0400;
    pub const TEST: u16 = 0x0800;
    pub const INDICATOR: u16 = 0x1000;

    // wPortChange
    pub const C_CONNECTION: u16 = 0x0001;
    pub const C_ENABLE: u16 = 0x0002;
    pub const C_SUSPEND: u16 = 0x0004;
    pub const C_OVER_CURRENT: u16 = 0x0008;
    pub const C_RESET: u16 = 0x0010;

    pub fn new(status: u16, change: u16) -> Self {
        Self { status, change }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::WIRE_SIZE {
            return Err(ProtocolError::BufferTooSmall {
                needed: Self::WIRE_SIZE,
                available: bytes.len(),
            });
        }
        Ok(Self {
            status: u16::from_le_bytes([bytes[0], bytes[1]]),
            change: u16::from_le_bytes([bytes[2], bytes[3]]),
        })
    }

    pub fn to_bytes(self) -> [u8; 4] {
        let s = self.status.to_le_bytes();
        let c = self.change.to_le_bytes();
        [s[0], s[1], c[0], c[1]]
    }

    pub fn connected(&self) -> bool {
        self.status & Self::CONNECTION != 0
    }

    pub fn enabled(&self) -> bool {
        self.status & Self::ENABLE != 0
    }

    pub fn suspended(&self) -> bool {
        self.status & Self::SUSPEND != 0
    }

    pub fn over_current(&self) -> bool {
        self.status & Self::OVER_CURRENT != 0
    }

    pub fn resetting(&self) -> bool {
        self.status & Self::RESET != 0
    }

    pub fn powered(&self) -> bool {
        self.status & Self::POWER != 0
    }

    /// Attached device speed from the low/high speed bits
    pub fn speed(&self) -> DeviceSpeed {
        if self.status & Self::LOW_SPEED != 0 {
            DeviceSpeed::Low
        } else if self.status & Self::HIGH_SPEED != 0 {
            DeviceSpeed::High
        } else {
            DeviceSpeed::Full
        }
    }

    pub fn connection_changed(&self) -> bool {
        self.change & Self::C_CONNECTION != 0
    }

    pub fn enable_changed(&self) -> bool {
        self.change & Self::C_ENABLE != 0
    }

    pub fn suspend_changed(&self) -> bool {
        self.change & Self::C_SUSPEND != 0
    }

    pub fn over_current_changed(&self) -> bool {
        self.change & Self::C_OVER_CURRENT != 0
    }

    pub fn reset_changed(&self) -> bool {
        self.change & Self::C_RESET != 0
    }

    pub fn has_changes(&self) -> bool {
        self.change != 0
    }

    /// C_PORT_* selectors needed to acknowledge every set change bit
    pub fn change_features(&self) -> Vec<u16> {
        [
            (Self::C_CONNECTION, feature::C_PORT_CONNECTION),
            (Self::C_ENABLE, feature::C_PORT_ENABLE),
            (Self::C_SUSPEND, feature::C_PORT_SUSPEND),
            (Self::C_OVER_CURRENT, feature::C_PORT_OVER_CURRENT),
            (Self::C_RESET, feature::C_PORT_RESET),
        ]
        .into_iter()
        .filter(|(mask, _)| self.change & mask != 0)
        .map(|(_, selector)| selector)
        .collect()
    }

    /// Status bit driven by a PORT_* selector, if it maps to one
    pub fn status_mask(selector: u16) -> Option<u16> {
        match selector {
            feature::PORT_CONNECTION => Some(Self::CONNECTION),
            feature::PORT_ENABLE => Some(Self::ENABLE),
            feature::PORT_SUSPEND => Some(Self::SUSPEND),
            feature::PORT_OVER_CURRENT => Some(Self::OVER_CURRENT),
            feature::PORT_RESET => Some(Self::RESET),
            feature::PORT_POWER => Some(Self::POWER),
            feature::PORT_LOW_SPEED => Some(Self::LOW_SPEED),
            feature::PORT_TEST => Some(Self::TEST),
            feature::PORT_INDICATOR => Some(Self::INDICATOR),
            _ => None,
        }
    }

    /// Change bit acknowledged by a C_PORT_* selector, if it maps to one
    pub fn change_mask(selector: u16) -> Option<u16> {
        match selector {
            feature::C_PORT_CONNECTION => Some(Self::C_CONNECTION),
            feature::C_PORT_ENABLE => Some(Self::C_ENABLE),
            feature::C_PORT_SUSPEND => Some(Self::C_SUSPEND),
            feature::C_PORT_OVER_CURRENT => Some(Self::C_OVER_CURRENT),
            feature::C_PORT_RESET => Some(Self::C_RESET),
            _ => None,
        }
    }
}

// ============================================================================
// Hub status
// ============================================================================

/// `wHubStatus` / `wHubChange` pair returned by GetHubStatus
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HubStatus {
    pub status: u16,
    pub change: u16,
}

impl HubStatus {
    pub const WIRE_SIZE: usize = 4;

    pub const LOCAL_POWER_LOST: u16 = 0x0001;
    pub const OVER_CURRENT: u16 = 0x0002;
    pub const C_LOCAL_POWER: u16 = 0x0001;
    pub const C_OVER_CURRENT: u16 = 0x0002;

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        PortStatus::from_bytes(bytes).map(|p| Self {
            status: p.status,
            change: p.change,
        })
    }

    pub fn to_bytes(self) -> [u8; 4] {
        PortStatus::new(self.status, self.change).to_bytes()
    }

    pub fn local_power_lost(&self) -> bool {
        self.status & Self::LOCAL_POWER_LOST != 0
    }

    pub fn over_current(&self) -> bool {
        self.status & Self::OVER_CURRENT != 0
    }

    pub fn local_power_changed(&self) -> bool {
        self.change & Self::C_LOCAL_POWER != 0
    }

    pub fn over_current_changed(&self) -> bool {
        self.change & Self::C_OVER_CURRENT != 0
    }
}

// ============================================================================
// Hub characteristics
// ============================================================================

/// Logical power switching mode (wHubCharacteristics bits 0..1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerSwitching {
    Ganged,
    Individual,
    /// USB 1.0 hubs only
    None,
}

/// Over-current protection mode (wHubCharacteristics bits 3..4)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverCurrentMode {
    Global,
    Individual,
    None,
}

/// `wHubCharacteristics`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct HubCharacteristics(pub u16);

impl HubCharacteristics {
    const LPSM: u16 = 0x0003;
    const COMPOUND: u16 = 0x0004;
    const OCPM: u16 = 0x0018;
    const TTTT: u16 = 0x0060;
    const PORT_INDICATORS: u16 = 0x0080;

    pub fn power_switching(&self) -> PowerSwitching {
        match self.0 & Self::LPSM {
            0 => PowerSwitching::Ganged,
            1 => PowerSwitching::Individual,
            _ => PowerSwitching::None,
        }
    }

    pub fn is_compound(&self) -> bool {
        self.0 & Self::COMPOUND != 0
    }

    pub fn over_current_mode(&self) -> OverCurrentMode {
        match (self.0 & Self::OCPM) >> 3 {
            0 => OverCurrentMode::Global,
            1 => OverCurrentMode::Individual,
            _ => OverCurrentMode::None,
        }
    }

    /// Transaction translator think time, in full-speed bit times
    pub fn tt_think_time(&self) -> u8 {
        ((((self.0 & Self::TTTT) >> 5) + 1) * 8) as u8
    }

    pub fn port_indicators(&self) -> bool {
        self.0 & Self::PORT_INDICATORS != 0
    }
}
