//! Sensor capability contract and normalized telemetry.
//!
//! Every sensor, real or synthetic, implements [`Sensor`]. A poll yields a
//! [`TelemetryDelta`]: a sparse set of (channel, value) pairs in fixed units.
//!
//! | Channel          | Unit          | Register |
//! |------------------|---------------|----------|
//! | angle X/Y        | centi-degree  | IR 0x00-0x01 |
//! | temperature      | centi-°C      | IR 0x02 |
//! | accel X/Y/Z      | milli-g       | IR 0x03-0x05 |
//! | gyro X/Y/Z       | milli-deg/s   | IR 0x06-0x08 |
//! | load             | centi-kg      | IR 0x0C |
//! | wind speed       | centi-m/s     | IR 0x0D |
//! | wind direction   | degree        | IR 0x0E |

pub mod anemometer;
pub mod manager;
pub mod mock;

pub use anemometer::{Anemometer, MillivoltSource, WindSample};
pub use manager::SensorManager;

use crate::registers::{holding, input};
use heapless::Vec;

/// Kinds of sensor a node can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SensorKind {
    Imu,
    Temperature,
    LoadCell,
    Anemometer,
}

impl SensorKind {
    /// Bit in the input `flags` register set while this sensor is unavailable.
    #[must_use]
    pub const fn stale_flag(self) -> u16 {
        match self {
            Self::Imu => input::FLAG_IMU_STALE,
            Self::Temperature => input::FLAG_TEMPERATURE_STALE,
            Self::LoadCell => input::FLAG_LOAD_STALE,
            Self::Anemometer => input::FLAG_ANEMOMETER_STALE,
        }
    }

    /// Bit in the holding `capabilities` register.
    #[must_use]
    pub const fn capability(self) -> u16 {
        match self {
            Self::Imu => holding::CAP_IMU,
            Self::Temperature => holding::CAP_TEMPERATURE,
            Self::LoadCell => holding::CAP_LOAD_CELL,
            Self::Anemometer => holding::CAP_ANEMOMETER,
        }
    }
}

/// Telemetry channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Channel {
    AngleX,
    AngleY,
    Temperature,
    AccelX,
    AccelY,
    AccelZ,
    GyroX,
    GyroY,
    GyroZ,
    Load,
    WindSpeed,
    WindDirection,
}

impl Channel {
    /// Input register holding the latest value.
    #[must_use]
    pub const fn register(self) -> u16 {
        match self {
            Self::AngleX => input::ANGLE_X,
            Self::AngleY => input::ANGLE_Y,
            Self::Temperature => input::TEMPERATURE,
            Self::AccelX => input::ACCEL_X,
            Self::AccelY => input::ACCEL_Y,
            Self::AccelZ => input::ACCEL_Z,
            Self::GyroX => input::GYRO_X,
            Self::GyroY => input::GYRO_Y,
            Self::GyroZ => input::GYRO_Z,
            Self::Load => input::LOAD,
            Self::WindSpeed => input::WIND_SPEED,
            Self::WindDirection => input::WIND_DIRECTION,
        }
    }

    /// First of the min/max/avg registers, for channels under statistics.
    #[must_use]
    pub const fn stats_register(self) -> Option<u16> {
        match self {
            Self::WindSpeed => Some(input::WIND_SPEED_STATS),
            Self::AccelX => Some(input::ACCEL_X_STATS),
            Self::AccelY => Some(input::ACCEL_Y_STATS),
            Self::AccelZ => Some(input::ACCEL_Z_STATS),
            Self::Load => Some(input::LOAD_STATS),
            _ => None,
        }
    }

    #[must_use]
    pub const fn is_signed(self) -> bool {
        !matches!(self, Self::WindSpeed | Self::WindDirection)
    }

    /// Whether `value` fits the register without clamping.
    #[must_use]
    pub fn in_range(self, value: i32) -> bool {
        if self.is_signed() {
            i16::try_from(value).is_ok()
        } else {
            u16::try_from(value).is_ok()
        }
    }

    /// Register encoding: clamp into i16 (two's complement) or u16.
    #[must_use]
    pub fn encode(self, value: i32) -> u16 {
        if self.is_signed() {
            value.clamp(i32::from(i16::MIN), i32::from(i16::MAX)) as i16 as u16
        } else {
            value.clamp(0, i32::from(u16::MAX)) as u16
        }
    }
}

/// Upper bound on channels in one delta.
pub const MAX_DELTA_CHANNELS: usize = 12;

/// One poll's worth of normalized readings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TelemetryDelta {
    values: Vec<(Channel, i32), MAX_DELTA_CHANNELS>,
}

impl TelemetryDelta {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`TelemetryDelta::set`].
    #[must_use]
    pub fn with(mut self, channel: Channel, value: i32) -> Self {
        self.set(channel, value);
        self
    }

    /// Set a channel, replacing an earlier value for the same channel.
    pub fn set(&mut self, channel: Channel, value: i32) {
        if let Some(slot) = self.values.iter_mut().find(|(c, _)| *c == channel) {
            slot.1 = value;
        } else {
            // one slot per channel, cannot overflow
            let _ = self.values.push((channel, value));
        }
    }

    #[must_use]
    pub fn get(&self, channel: Channel) -> Option<i32> {
        self.values
            .iter()
            .find(|(c, _)| *c == channel)
            .map(|&(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Channel, i32)> + '_ {
        self.values.iter().copied()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }
}

/// Error type for sensor start-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SensorError {
    /// Nothing answered on the sensor's bus or pin.
    NotDetected,
    /// Communication with the sensor failed.
    Bus,
    /// The sensor answered with values outside its valid range.
    OutOfRange,
}

impl core::fmt::Display for SensorError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::NotDetected => write!(f, "sensor not detected"),
            Self::Bus => write!(f, "sensor bus error"),
            Self::OutOfRange => write!(f, "sensor reading out of range"),
        }
    }
}

/// Capability contract every sensor satisfies.
///
/// `poll` must return promptly. Sensors that sample slowly keep their own
/// schedule and return `None` between samples.
pub trait Sensor {
    fn kind(&self) -> SensorKind;

    fn name(&self) -> &'static str;

    /// Probe and configure the hardware.
    fn begin(&mut self, now_ms: u64) -> Result<(), SensorError>;

    fn poll(&mut self, now_ms: u64) -> Option<TelemetryDelta>;

    fn is_available(&self) -> bool;
}

/// The node's sensor fit, assembled once at startup.
#[derive(Default)]
pub struct SensorSet<'a> {
    pub imu: Option<&'a mut dyn Sensor>,
    pub temperature: Option<&'a mut dyn Sensor>,
    pub load_cell: Option<&'a mut dyn Sensor>,
    pub anemometer: Option<&'a mut dyn Sensor>,
}

impl<'a> SensorSet<'a> {
    /// Capability bits for the fitted sensors, plus the always-present
    /// RS-485 and identify bits.
    #[must_use]
    pub fn capabilities(&self) -> u16 {
        let mut caps = holding::CAP_RS485 | holding::CAP_IDENTIFY;
        for (fitted, kind) in [
            (self.imu.is_some(), SensorKind::Imu),
            (self.temperature.is_some(), SensorKind::Temperature),
            (self.load_cell.is_some(), SensorKind::LoadCell),
            (self.anemometer.is_some(), SensorKind::Anemometer),
        ] {
            if fitted {
                caps |= kind.capability();
            }
        }
        caps
    }
}
