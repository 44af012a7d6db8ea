//! The register map: the node's single addressable state hub.
//!
//! Two independent banks of 16-bit registers. The holding bank is
//! read/write from the bus (subject to each register's access policy), the
//! input bank is read-only from the bus and filled by the sensor manager.
//! Every address has exactly one writer role; internal writers use
//! [`RegisterMap::set`] and friends, which bypass the bus access policy.
//!
//! Addresses are stable. New registers are only ever appended at the end of
//! a bank.

use rtu_proto::{ExceptionCode, MAX_REGISTERS_PER_REQUEST};

/// Number of holding registers (0x00..=0x2F).
pub const HOLDING_LEN: usize = 0x30;

/// Number of input registers (0x00..=0x1F).
pub const INPUT_LEN: usize = 0x20;

/// Holding register addresses.
pub mod holding {
    pub const VENDOR_ID: u16 = 0x00;
    pub const PRODUCT_ID: u16 = 0x01;
    pub const HW_REVISION: u16 = 0x02;
    pub const FW_REVISION: u16 = 0x03;
    /// Unit address the node currently answers on.
    pub const UNIT_ID: u16 = 0x04;
    pub const CAPABILITIES: u16 = 0x05;
    pub const UPTIME_LO: u16 = 0x06;
    pub const UPTIME_HI: u16 = 0x07;
    pub const STATUS: u16 = 0x08;
    pub const ERRORS: u16 = 0x09;

    pub const BAUD_CODE: u16 = 0x10;
    pub const IMU_FILTER_HZ: u16 = 0x11;
    pub const SAVE_APPLY: u16 = 0x12;
    pub const IDENTIFY_SECS: u16 = 0x13;
    /// Unit address that becomes active on the next save/apply.
    pub const CFG_UNIT_ID: u16 = 0x14;
    pub const IDENTIFY_ACTIVE: u16 = 0x15;

    pub const DIAG_RX_FRAMES: u16 = 0x20;
    pub const DIAG_CRC_ERRORS: u16 = 0x21;
    pub const DIAG_EXCEPTIONS: u16 = 0x22;
    pub const DIAG_TX_FRAMES: u16 = 0x23;
    pub const DIAG_OVERRUNS: u16 = 0x24;
    pub const DIAG_LAST_EXCEPTION: u16 = 0x25;
    pub const DIAG_FRAMING_ANOMALIES: u16 = 0x26;

    pub const CMD_SAVE: u16 = 0xA55A;
    pub const CMD_APPLY: u16 = 0xB007;

    pub const STATUS_OK: u16 = 1 << 0;
    pub const STATUS_IMU_READY: u16 = 1 << 1;
    pub const STATUS_CFG_DIRTY: u16 = 1 << 2;

    pub const ERROR_IMU_COMM: u16 = 1 << 0;
    pub const ERROR_STORE: u16 = 1 << 1;
    pub const ERROR_RANGE: u16 = 1 << 2;

    pub const CAP_RS485: u16 = 1 << 0;
    pub const CAP_IMU: u16 = 1 << 1;
    pub const CAP_IDENTIFY: u16 = 1 << 2;
    pub const CAP_ANEMOMETER: u16 = 1 << 3;
    pub const CAP_LOAD_CELL: u16 = 1 << 4;
    pub const CAP_TEMPERATURE: u16 = 1 << 5;

    pub const DEFAULT_IMU_FILTER_HZ: u16 = 42;
}

/// Input register addresses.
pub mod input {
    pub const ANGLE_X: u16 = 0x00;
    pub const ANGLE_Y: u16 = 0x01;
    pub const TEMPERATURE: u16 = 0x02;
    pub const ACCEL_X: u16 = 0x03;
    pub const ACCEL_Y: u16 = 0x04;
    pub const ACCEL_Z: u16 = 0x05;
    pub const GYRO_X: u16 = 0x06;
    pub const GYRO_Y: u16 = 0x07;
    pub const GYRO_Z: u16 = 0x08;
    pub const SAMPLE_COUNTER_LO: u16 = 0x09;
    pub const SAMPLE_COUNTER_HI: u16 = 0x0A;
    pub const FLAGS: u16 = 0x0B;
    pub const LOAD: u16 = 0x0C;
    pub const WIND_SPEED: u16 = 0x0D;
    pub const WIND_DIRECTION: u16 = 0x0E;
    /// Wind speed window: min, max, avg.
    pub const WIND_SPEED_STATS: u16 = 0x0F;
    /// Accel X window: min, max, avg.
    pub const ACCEL_X_STATS: u16 = 0x12;
    pub const ACCEL_Y_STATS: u16 = 0x15;
    pub const ACCEL_Z_STATS: u16 = 0x18;
    /// Load window: min, max, avg.
    pub const LOAD_STATS: u16 = 0x1B;

    pub const FLAG_IMU_STALE: u16 = 1 << 0;
    pub const FLAG_TEMPERATURE_STALE: u16 = 1 << 1;
    pub const FLAG_LOAD_STALE: u16 = 1 << 2;
    pub const FLAG_ANEMOMETER_STALE: u16 = 1 << 3;
}

/// Register bank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Bank {
    Holding,
    Input,
}

impl Bank {
    #[inline]
    #[must_use]
    pub const fn len(self) -> usize {
        match self {
            Self::Holding => HOLDING_LEN,
            Self::Input => INPUT_LEN,
        }
    }
}

/// Values a writable register accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueRule {
    /// Any 16-bit value, stored verbatim.
    Any,
    /// Inclusive range.
    Range { min: u16, max: u16 },
    /// Enumerated set.
    OneOf(&'static [u16]),
}

impl ValueRule {
    #[must_use]
    pub fn accepts(&self, value: u16) -> bool {
        match *self {
            Self::Any => true,
            Self::Range { min, max } => (min..=max).contains(&value),
            Self::OneOf(set) => set.contains(&value),
        }
    }
}

/// Access policy from the bus side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    ReadOnly,
    ReadWrite(ValueRule),
    /// Writable; every accepted write bumps the register's write sequence.
    Command(ValueRule),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Persistence {
    Volatile,
    /// Survives power cycles through the persistent store.
    Persistent,
}

/// Static description of one register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterDef {
    pub name: &'static str,
    pub access: Access,
    /// Raw value = engineering value × scale.
    pub scale: u16,
    pub persistence: Persistence,
}

impl RegisterDef {
    const fn ro(name: &'static str) -> Self {
        Self {
            name,
            access: Access::ReadOnly,
            scale: 1,
            persistence: Persistence::Volatile,
        }
    }

    const fn rw(name: &'static str, rule: ValueRule) -> Self {
        Self {
            access: Access::ReadWrite(rule),
            ..Self::ro(name)
        }
    }

    const fn command(name: &'static str, rule: ValueRule) -> Self {
        Self {
            access: Access::Command(rule),
            ..Self::ro(name)
        }
    }

    const fn scaled(self, scale: u16) -> Self {
        Self { scale, ..self }
    }

    const fn persistent(self) -> Self {
        Self {
            persistence: Persistence::Persistent,
            ..self
        }
    }

    #[inline]
    #[must_use]
    pub const fn is_command(&self) -> bool {
        matches!(self.access, Access::Command(_))
    }
}

const RESERVED: RegisterDef = RegisterDef::ro("reserved");

const SAVE_APPLY_CODES: &[u16] = &[holding::CMD_SAVE, holding::CMD_APPLY];

#[rustfmt::skip]
static HOLDING_TABLE: [RegisterDef; HOLDING_LEN] = [
    RegisterDef::ro("vendor_id"),                                   // 0x00
    RegisterDef::ro("product_id"),
    RegisterDef::ro("hw_revision"),
    RegisterDef::ro("fw_revision"),
    RegisterDef::ro("unit_id"),                                     // 0x04
    RegisterDef::ro("capabilities"),
    RegisterDef::ro("uptime_lo"),
    RegisterDef::ro("uptime_hi"),
    RegisterDef::ro("status"),                                      // 0x08
    RegisterDef::ro("errors"),
    RESERVED, RESERVED, RESERVED, RESERVED, RESERVED, RESERVED,     // 0x0A-0x0F
    RegisterDef::rw("baud_code", ValueRule::Range { min: 0, max: 4 }), // 0x10
    RegisterDef::rw("imu_filter_hz", ValueRule::Range { min: 0, max: 200 }),
    RegisterDef::command("save_apply", ValueRule::OneOf(SAVE_APPLY_CODES)),
    RegisterDef::command("identify_secs", ValueRule::Any),
    RegisterDef::rw("cfg_unit_id", ValueRule::Range { min: 1, max: 247 }).persistent(), // 0x14
    RegisterDef::ro("identify_active"),
    RESERVED, RESERVED, RESERVED, RESERVED, RESERVED,               // 0x16-0x1A
    RESERVED, RESERVED, RESERVED, RESERVED, RESERVED,               // 0x1B-0x1F
    RegisterDef::ro("diag_rx_frames"),                              // 0x20
    RegisterDef::ro("diag_crc_errors"),
    RegisterDef::ro("diag_exceptions"),
    RegisterDef::ro("diag_tx_frames"),
    RegisterDef::ro("diag_overruns"),                               // 0x24
    RegisterDef::ro("diag_last_exception"),
    RegisterDef::ro("diag_framing_anomalies"),
    RESERVED, RESERVED, RESERVED, RESERVED, RESERVED,               // 0x27-0x2B
    RESERVED, RESERVED, RESERVED, RESERVED,                         // 0x2C-0x2F
];

#[rustfmt::skip]
static INPUT_TABLE: [RegisterDef; INPUT_LEN] = [
    RegisterDef::ro("angle_x").scaled(100),                         // 0x00
    RegisterDef::ro("angle_y").scaled(100),
    RegisterDef::ro("temperature").scaled(100),
    RegisterDef::ro("accel_x").scaled(1000),
    RegisterDef::ro("accel_y").scaled(1000),                        // 0x04
    RegisterDef::ro("accel_z").scaled(1000),
    RegisterDef::ro("gyro_x").scaled(1000),
    RegisterDef::ro("gyro_y").scaled(1000),
    RegisterDef::ro("gyro_z").scaled(1000),                         // 0x08
    RegisterDef::ro("sample_counter_lo"),
    RegisterDef::ro("sample_counter_hi"),
    RegisterDef::ro("flags"),
    RegisterDef::ro("load").scaled(100),                            // 0x0C
    RegisterDef::ro("wind_speed").scaled(100),
    RegisterDef::ro("wind_direction"),
    RegisterDef::ro("wind_speed_min").scaled(100),
    RegisterDef::ro("wind_speed_max").scaled(100),                  // 0x10
    RegisterDef::ro("wind_speed_avg").scaled(100),
    RegisterDef::ro("accel_x_min").scaled(1000),
    RegisterDef::ro("accel_x_max").scaled(1000),
    RegisterDef::ro("accel_x_avg").scaled(1000),                    // 0x14
    RegisterDef::ro("accel_y_min").scaled(1000),
    RegisterDef::ro("accel_y_max").scaled(1000),
    RegisterDef::ro("accel_y_avg").scaled(1000),
    RegisterDef::ro("accel_z_min").scaled(1000),                    // 0x18
    RegisterDef::ro("accel_z_max").scaled(1000),
    RegisterDef::ro("accel_z_avg").scaled(1000),
    RegisterDef::ro("load_min").scaled(100),
    RegisterDef::ro("load_max").scaled(100),                        // 0x1C
    RegisterDef::ro("load_avg").scaled(100),
    RESERVED, RESERVED,                                             // 0x1E-0x1F
];

/// Register access errors. Both map onto protocol exceptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RegisterError {
    /// Address outside the bank, or not writable.
    IllegalAddress,
    /// Quantity out of range, or value rejected by the register's rule.
    IllegalValue,
}

impl core::fmt::Display for RegisterError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::IllegalAddress => write!(f, "illegal register address"),
            Self::IllegalValue => write!(f, "illegal register value"),
        }
    }
}

impl From<RegisterError> for ExceptionCode {
    fn from(e: RegisterError) -> Self {
        match e {
            RegisterError::IllegalAddress => ExceptionCode::IllegalDataAddress,
            RegisterError::IllegalValue => ExceptionCode::IllegalDataValue,
        }
    }
}

/// Backing store for both banks plus write sequence counters.
pub struct RegisterMap {
    holding: [u16; HOLDING_LEN],
    input: [u16; INPUT_LEN],
    write_seq: [u16; HOLDING_LEN],
}

impl RegisterMap {
    /// All registers zero, except configuration registers at their defaults.
    #[must_use]
    pub fn new() -> Self {
        let mut map = Self {
            holding: [0; HOLDING_LEN],
            input: [0; INPUT_LEN],
            write_seq: [0; HOLDING_LEN],
        };
        map.set(Bank::Holding, holding::BAUD_CODE, rtu_proto::BaudCode::DEFAULT.code());
        map.set(Bank::Holding, holding::IMU_FILTER_HZ, holding::DEFAULT_IMU_FILTER_HZ);
        map
    }

    /// Static definition of a register, if the address exists.
    #[must_use]
    pub fn definition(bank: Bank, address: u16) -> Option<&'static RegisterDef> {
        match bank {
            Bank::Holding => HOLDING_TABLE.get(usize::from(address)),
            Bank::Input => INPUT_TABLE.get(usize::from(address)),
        }
    }

    /// Read `count` registers starting at `start`, in address order.
    pub fn read(&self, bank: Bank, start: u16, count: u16) -> Result<&[u16], RegisterError> {
        if count == 0 || count > MAX_REGISTERS_PER_REQUEST {
            return Err(RegisterError::IllegalValue);
        }
        let start = usize::from(start);
        let end = start + usize::from(count);
        if end > bank.len() {
            return Err(RegisterError::IllegalAddress);
        }
        Ok(&self.bank(bank)[start..end])
    }

    /// Check a bus write against the holding register's access policy.
    pub fn check_write(&self, address: u16, value: u16) -> Result<(), RegisterError> {
        let def =
            Self::definition(Bank::Holding, address).ok_or(RegisterError::IllegalAddress)?;
        let rule = match def.access {
            Access::ReadOnly => return Err(RegisterError::IllegalAddress),
            Access::ReadWrite(rule) | Access::Command(rule) => rule,
        };
        if rule.accepts(value) {
            Ok(())
        } else {
            Err(RegisterError::IllegalValue)
        }
    }

    /// Bus write to a single holding register.
    pub fn write(&mut self, address: u16, value: u16) -> Result<(), RegisterError> {
        self.check_write(address, value)?;
        self.apply_write(address, value);
        Ok(())
    }

    /// Bus write to a contiguous run of holding registers.
    ///
    /// Every value is validated before any is applied; on error nothing
    /// changes.
    pub fn write_multiple<I>(&mut self, start: u16, values: I) -> Result<(), RegisterError>
    where
        I: Iterator<Item = u16> + Clone,
    {
        let count = values.clone().count();
        if count == 0 || count > usize::from(MAX_REGISTERS_PER_REQUEST) {
            return Err(RegisterError::IllegalValue);
        }
        if usize::from(start) + count > HOLDING_LEN {
            return Err(RegisterError::IllegalAddress);
        }
        for (address, value) in (start..).zip(values.clone()) {
            self.check_write(address, value)?;
        }
        for (address, value) in (start..).zip(values) {
            self.apply_write(address, value);
        }
        Ok(())
    }

    /// Accepted writes to a command register so far (wrapping).
    #[inline]
    #[must_use]
    pub fn write_sequence(&self, address: u16) -> u16 {
        self.write_seq
            .get(usize::from(address))
            .copied()
            .unwrap_or(0)
    }

    /// Current value; 0 outside the bank.
    #[inline]
    #[must_use]
    pub fn get(&self, bank: Bank, address: u16) -> u16 {
        self.bank(bank)
            .get(usize::from(address))
            .copied()
            .unwrap_or(0)
    }

    /// Internal write, bypassing the bus access policy.
    #[inline]
    pub fn set(&mut self, bank: Bank, address: u16, value: u16) {
        if let Some(slot) = self.bank_mut(bank).get_mut(usize::from(address)) {
            *slot = value;
        }
    }

    /// Store a signed value in two's complement.
    #[inline]
    pub fn set_i16(&mut self, bank: Bank, address: u16, value: i16) {
        self.set(bank, address, value as u16);
    }

    /// Store a 32-bit value as low word at `address`, high word at `address + 1`.
    pub fn set_u32(&mut self, bank: Bank, address: u16, value: u32) {
        self.set(bank, address, value as u16);
        self.set(bank, address + 1, (value >> 16) as u16);
    }

    #[must_use]
    pub fn get_u32(&self, bank: Bank, address: u16) -> u32 {
        u32::from(self.get(bank, address)) | (u32::from(self.get(bank, address + 1)) << 16)
    }

    /// Increment a counter register, sticking at 0xFFFF.
    pub fn increment_saturating(&mut self, bank: Bank, address: u16) {
        let value = self.get(bank, address).saturating_add(1);
        self.set(bank, address, value);
    }

    /// Set or clear bits of a bitfield register.
    pub fn update_bits(&mut self, bank: Bank, address: u16, mask: u16, on: bool) {
        let value = self.get(bank, address);
        let value = if on { value | mask } else { value & !mask };
        self.set(bank, address, value);
    }

    fn apply_write(&mut self, address: u16, value: u16) {
        let index = usize::from(address);
        self.holding[index] = value;
        if HOLDING_TABLE[index].is_command() {
            self.write_seq[index] = self.write_seq[index].wrapping_add(1);
        }
    }

    fn bank(&self, bank: Bank) -> &[u16] {
        match bank {
            Bank::Holding => &self.holding,
            Bank::Input => &self.input,
        }
    }

    fn bank_mut(&mut self, bank: Bank) -> &mut [u16] {
        match bank {
            Bank::Holding => &mut self.holding,
            Bank::Input => &mut self.input,
        }
    }
}

impl Default for RegisterMap {
    fn default() -> Self {
        Self::new()
    }
}
