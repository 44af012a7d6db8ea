//! Analog cup anemometer with a wind vane.
//!
//! The anemometer outputs 0.4 V at rest and 2.0 V at 32.4 m/s, linear in
//! between. Voltages outside that band are clamped. A failed sample marks
//! the sensor unavailable until a later sample succeeds.

use super::{Channel, Sensor, SensorError, SensorKind, TelemetryDelta};
use fixed::types::I32F32;
use fixed_macro::fixed;

/// One sample every second.
pub const SAMPLE_INTERVAL_MS: u64 = 1_000;

/// Output at rest.
pub const MIN_MILLIVOLTS: u16 = 400;

/// Output at full scale.
pub const MAX_MILLIVOLTS: u16 = 2_000;

/// (32.4 m/s * 100) / (2000 mV - 400 mV)
const CMPS_PER_MILLIVOLT: I32F32 = fixed!(2.025: I32F32);

/// Raw reading from the anemometer and vane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct WindSample {
    pub millivolts: u16,
    pub direction_deg: u16,
}

/// Source of raw wind readings (an ADC in firmware, a generator in tests).
pub trait MillivoltSource {
    fn sample(&mut self) -> Result<WindSample, SensorError>;
}

/// Convert anemometer output to centi-m/s.
#[must_use]
pub fn speed_cmps(millivolts: u16) -> u16 {
    let above_rest = millivolts.clamp(MIN_MILLIVOLTS, MAX_MILLIVOLTS) - MIN_MILLIVOLTS;
    (I32F32::from_num(above_rest) * CMPS_PER_MILLIVOLT)
        .round()
        .to_num()
}

pub struct Anemometer<S> {
    source: S,
    next_sample_ms: u64,
    available: bool,
}

impl<S: MillivoltSource> Anemometer<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            next_sample_ms: 0,
            available: false,
        }
    }

    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }
}

impl<S: MillivoltSource> Sensor for Anemometer<S> {
    fn kind(&self) -> SensorKind {
        SensorKind::Anemometer
    }

    fn name(&self) -> &'static str {
        "anemometer"
    }

    fn begin(&mut self, now_ms: u64) -> Result<(), SensorError> {
        match self.source.sample() {
            Ok(_) => {
                self.available = true;
                self.next_sample_ms = now_ms;
                Ok(())
            }
            Err(e) => {
                self.available = false;
                self.next_sample_ms = now_ms + SAMPLE_INTERVAL_MS;
                Err(e)
            }
        }
    }

    /// Samples once per interval whether or not the last sample worked, so
    /// a sensor that drops out is marked unavailable and one that comes
    /// back is picked up again.
    fn poll(&mut self, now_ms: u64) -> Option<TelemetryDelta> {
        if now_ms < self.next_sample_ms {
            return None;
        }
        self.next_sample_ms = now_ms + SAMPLE_INTERVAL_MS;
        match self.source.sample() {
            Ok(sample) => {
                if !self.available {
                    info!("anemometer detected");
                    self.available = true;
                }
                Some(
                    TelemetryDelta::new()
                        .with(Channel::WindSpeed, i32::from(speed_cmps(sample.millivolts)))
                        .with(Channel::WindDirection, i32::from(sample.direction_deg % 360)),
                )
            }
            Err(e) => {
                if self.available {
                    warn!("anemometer lost: {:?}", e);
                    self.available = false;
                }
                None
            }
        }
    }

    fn is_available(&self) -> bool {
        self.available
    }
}
