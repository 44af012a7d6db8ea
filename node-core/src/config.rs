//! Build-time node configuration.
//!
//! Runtime settings (unit address, line rate) live in holding registers and
//! the persistent store; this is what the node falls back to.

use rtu_proto::{BaudCode, Identification, SerialConfig, MAX_UNIT_ID};

/// Identification reported in holding registers 0x00..=0x03 and by the
/// identification functions.
pub const DEFAULT_IDENTIFICATION: Identification = Identification {
    vendor_id: 0x5446,
    product_id: 0x4D30,
    hw_revision: 0x0100,
    fw_revision: 0x0100,
    vendor: "TF",
    model: "M0-NODE",
};

/// Identify duration requested by the identify-info function.
pub const DEFAULT_IDENTIFY_SECS: u16 = 5;

pub const DEFAULT_UNIT_ID: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct NodeConfig {
    /// Address used when the store holds none.
    pub default_unit_id: u8,
    /// Line settings at boot.
    pub serial: SerialConfig,
    pub identification: Identification,
    pub identify_secs: u16,
}

pub const DEFAULT_CONFIG: NodeConfig = NodeConfig {
    default_unit_id: DEFAULT_UNIT_ID,
    serial: SerialConfig::new(BaudCode::DEFAULT.baud_rate()),
    identification: DEFAULT_IDENTIFICATION,
    identify_secs: DEFAULT_IDENTIFY_SECS,
};

impl NodeConfig {
    /// Pick the boot address: a stored address if assignable, the default
    /// otherwise.
    #[must_use]
    pub fn boot_unit_id(&self, stored: Option<u16>) -> u8 {
        match stored {
            Some(unit) if (1..=u16::from(MAX_UNIT_ID)).contains(&unit) => unit as u8,
            _ => self.default_unit_id,
        }
    }

    /// Baud code matching the boot line rate, or the default code for rates
    /// outside the table.
    #[must_use]
    pub fn baud_code(&self) -> BaudCode {
        BaudCode::from_baud_rate(self.serial.baud_rate).unwrap_or(BaudCode::DEFAULT)
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        DEFAULT_CONFIG
    }
}
