//! Synthetic sensors for bench testing without hardware.
//!
//! All values are deterministic triangle waves driven by a per-sensor step
//! counter, so two runs with the same poll times produce the same registers.
//!
//! | Sensor      | Interval | Output |
//! |-------------|----------|--------|
//! | IMU         | 100 ms   | accel ±50 mg around (0, 0, 1000), angles ±5°, gyro ±2 dps, 25 °C |
//! | Temperature | 500 ms   | 20.00 °C → 25.00 °C → 20.00 °C over 20 s |
//! | Load cell   | 100 ms   | 0.50 kg → 4.50 kg → 0.50 kg over 8 s |
//! | Anemometer  | 1000 ms  | 0.4 V → 2.0 V → 0.4 V over 40 s, vane +10° per sample |

use super::anemometer::{Anemometer, MillivoltSource, WindSample, MAX_MILLIVOLTS, MIN_MILLIVOLTS};
use super::{Channel, Sensor, SensorError, SensorKind, TelemetryDelta};

/// Triangle wave: `lo` at step 0, `hi` at half period, back to `lo`.
#[must_use]
pub fn triangle(step: u32, period: u32, lo: i32, hi: i32) -> i32 {
    let period = period.max(2);
    let half = period / 2;
    let pos = step % period;
    let rise = if pos <= half { pos } else { period - pos };
    lo + (hi - lo) * rise as i32 / half as i32
}

/// Fixed-interval schedule with a step counter.
#[derive(Debug, Clone, Copy)]
struct Schedule {
    interval_ms: u64,
    next_ms: u64,
    step: u32,
}

impl Schedule {
    const fn new(interval_ms: u64) -> Self {
        Self {
            interval_ms,
            next_ms: 0,
            step: 0,
        }
    }

    fn start(&mut self, now_ms: u64) {
        self.next_ms = now_ms;
        self.step = 0;
    }

    /// Step number of a sample due at `now_ms`.
    fn due(&mut self, now_ms: u64) -> Option<u32> {
        if now_ms < self.next_ms {
            return None;
        }
        self.next_ms = now_ms + self.interval_ms;
        let step = self.step;
        self.step = self.step.wrapping_add(1);
        Some(step)
    }
}

macro_rules! synthetic_sensor {
    ($name:ident, $kind:expr, $label:literal, $interval:expr) => {
        pub struct $name {
            schedule: Schedule,
            present: bool,
            available: bool,
        }

        impl $name {
            #[must_use]
            pub const fn new() -> Self {
                Self {
                    schedule: Schedule::new($interval),
                    present: true,
                    available: false,
                }
            }

            /// A sensor that never answers `begin`.
            #[must_use]
            pub const fn absent() -> Self {
                Self {
                    present: false,
                    ..Self::new()
                }
            }

            /// Take the sensor offline or back online at runtime.
            pub fn set_available(&mut self, available: bool) {
                self.available = available && self.present;
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl Sensor for $name {
            fn kind(&self) -> SensorKind {
                $kind
            }

            fn name(&self) -> &'static str {
                $label
            }

            fn begin(&mut self, now_ms: u64) -> Result<(), SensorError> {
                if !self.present {
                    self.available = false;
                    return Err(SensorError::NotDetected);
                }
                self.schedule.start(now_ms);
                self.available = true;
                Ok(())
            }

            fn poll(&mut self, now_ms: u64) -> Option<TelemetryDelta> {
                if !self.available {
                    return None;
                }
                let step = self.schedule.due(now_ms)?;
                Some(Self::reading(step))
            }

            fn is_available(&self) -> bool {
                self.available
            }
        }
    };
}

synthetic_sensor!(MockImu, SensorKind::Imu, "mock-imu", 100);
synthetic_sensor!(MockTemperature, SensorKind::Temperature, "mock-temperature", 500);
synthetic_sensor!(MockLoadCell, SensorKind::LoadCell, "mock-load-cell", 100);

impl MockImu {
    fn reading(step: u32) -> TelemetryDelta {
        TelemetryDelta::new()
            .with(Channel::AccelX, triangle(step, 40, -50, 50))
            .with(Channel::AccelY, triangle(step.wrapping_add(10), 40, -50, 50))
            .with(Channel::AccelZ, triangle(step, 20, 980, 1020))
            .with(Channel::AngleX, triangle(step, 100, -500, 500))
            .with(Channel::AngleY, triangle(step.wrapping_add(25), 100, -500, 500))
            .with(Channel::GyroX, triangle(step, 30, -2000, 2000))
            .with(Channel::GyroY, triangle(step.wrapping_add(10), 30, -2000, 2000))
            .with(Channel::GyroZ, triangle(step.wrapping_add(20), 30, -2000, 2000))
            .with(Channel::Temperature, 2500)
    }
}

impl MockTemperature {
    fn reading(step: u32) -> TelemetryDelta {
        TelemetryDelta::new().with(Channel::Temperature, triangle(step, 40, 2000, 2500))
    }
}

impl MockLoadCell {
    fn reading(step: u32) -> TelemetryDelta {
        let grams = triangle(step, 80, 500, 4500);
        TelemetryDelta::new().with(Channel::Load, grams_to_centi_kg(grams))
    }
}

/// Load cell output in grams to the centi-kg register unit.
#[inline]
#[must_use]
pub const fn grams_to_centi_kg(grams: i32) -> i32 {
    grams / 10
}

/// Generator standing in for the anemometer ADC.
#[derive(Debug, Clone, Default)]
pub struct SyntheticWind {
    step: u32,
    disconnected: bool,
}

impl SyntheticWind {
    /// Simulate unplugging or reconnecting the anemometer.
    pub fn set_connected(&mut self, connected: bool) {
        self.disconnected = !connected;
    }
}

impl MillivoltSource for SyntheticWind {
    fn sample(&mut self) -> Result<WindSample, SensorError> {
        if self.disconnected {
            return Err(SensorError::NotDetected);
        }
        let step = self.step;
        self.step = self.step.wrapping_add(1);
        Ok(WindSample {
            millivolts: triangle(step, 40, i32::from(MIN_MILLIVOLTS), i32::from(MAX_MILLIVOLTS))
                as u16,
            direction_deg: ((step % 36) * 10) as u16,
        })
    }
}

pub type MockAnemometer = Anemometer<SyntheticWind>;

impl MockAnemometer {
    #[must_use]
    pub fn synthetic() -> Self {
        Anemometer::new(SyntheticWind::default())
    }
}
