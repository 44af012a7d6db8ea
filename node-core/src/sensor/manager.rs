//! Polls the fitted sensors and folds their readings into the input bank.

use super::{Channel, Sensor, SensorSet, TelemetryDelta};
use crate::registers::{input, Bank, RegisterMap};
use crate::stats::{TumblingWindow, WINDOW_MS};
use heapless::Vec;

/// One slot per [`super::SensorKind`].
pub const MAX_SENSORS: usize = 4;

/// Channels that keep a 5 s min/max/avg window.
const STATS_CHANNELS: [Channel; 5] = [
    Channel::WindSpeed,
    Channel::AccelX,
    Channel::AccelY,
    Channel::AccelZ,
    Channel::Load,
];

struct StatsSlot {
    channel: Channel,
    window: TumblingWindow,
}

/// Owns the sensor registration list and every input register.
pub struct SensorManager<'a> {
    sensors: Vec<&'a mut dyn Sensor, MAX_SENSORS>,
    stats: [StatsSlot; STATS_CHANNELS.len()],
    capabilities: u16,
    sample_counter: u32,
    out_of_range: bool,
}

impl<'a> SensorManager<'a> {
    /// Register the fitted sensors in fixed order: IMU, temperature, load
    /// cell, anemometer. The set cannot change afterwards.
    pub fn new(set: SensorSet<'a>) -> Self {
        let capabilities = set.capabilities();
        let mut sensors = Vec::new();
        for sensor in [set.imu, set.temperature, set.load_cell, set.anemometer]
            .into_iter()
            .flatten()
        {
            // four kinds, four slots
            let _ = sensors.push(sensor);
        }
        Self {
            sensors,
            stats: STATS_CHANNELS.map(|channel| StatsSlot {
                channel,
                window: TumblingWindow::new(WINDOW_MS),
            }),
            capabilities,
            sample_counter: 0,
            out_of_range: false,
        }
    }

    /// Capability bits for the holding `capabilities` register.
    #[inline]
    #[must_use]
    pub fn capabilities(&self) -> u16 {
        self.capabilities
    }

    #[inline]
    #[must_use]
    pub fn sample_counter(&self) -> u32 {
        self.sample_counter
    }

    /// Whether the last cycle that produced readings had to clamp one.
    #[inline]
    #[must_use]
    pub fn out_of_range(&self) -> bool {
        self.out_of_range
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sensors.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sensors.is_empty()
    }

    /// Start every sensor. Failures leave the sensor registered but
    /// unavailable.
    pub fn begin(&mut self, regs: &mut RegisterMap, now_ms: u64) {
        for sensor in self.sensors.iter_mut() {
            match sensor.begin(now_ms) {
                Ok(()) => info!("sensor {} ready", sensor.name()),
                Err(e) => warn!("sensor {} failed to start: {:?}", sensor.name(), e),
            }
        }
        regs.set(Bank::Input, input::FLAGS, self.stale_flags());
    }

    /// Poll every sensor once and fold the readings in.
    pub fn poll(&mut self, regs: &mut RegisterMap, now_ms: u64) {
        let mut produced = false;
        let mut clamped = false;
        let mut stale = 0;
        for sensor in self.sensors.iter_mut() {
            // unavailable sensors are still polled so they can recover
            let delta = sensor.poll(now_ms);
            if !sensor.is_available() {
                stale |= sensor.kind().stale_flag();
                continue;
            }
            if let Some(delta) = delta {
                if !delta.is_empty() {
                    produced = true;
                    clamped |= Self::fold(&mut self.stats, regs, now_ms, &delta);
                }
            }
        }
        regs.set(Bank::Input, input::FLAGS, stale);

        if produced {
            self.out_of_range = clamped;
            self.sample_counter = self.sample_counter.wrapping_add(1);
            regs.set_u32(Bank::Input, input::SAMPLE_COUNTER_LO, self.sample_counter);
        }
    }

    /// Whether the given kind is fitted and currently answering.
    #[must_use]
    pub fn is_available(&self, kind: super::SensorKind) -> bool {
        self.sensors
            .iter()
            .any(|s| s.kind() == kind && s.is_available())
    }

    fn stale_flags(&self) -> u16 {
        self.sensors
            .iter()
            .filter(|s| !s.is_available())
            .fold(0, |flags, s| flags | s.kind().stale_flag())
    }

    /// Write a delta into the input bank. Returns `true` if a value had to
    /// be clamped.
    fn fold(
        stats: &mut [StatsSlot],
        regs: &mut RegisterMap,
        now_ms: u64,
        delta: &TelemetryDelta,
    ) -> bool {
        let mut clamped = false;
        for (channel, value) in delta.iter() {
            clamped |= !channel.in_range(value);
            regs.set(Bank::Input, channel.register(), channel.encode(value));

            let Some(slot) = stats.iter_mut().find(|s| s.channel == channel) else {
                continue;
            };
            let Some(base) = channel.stats_register() else {
                continue;
            };
            if let Some(summary) = slot.window.on_sample(now_ms, value) {
                regs.set(Bank::Input, base, channel.encode(summary.min));
                regs.set(Bank::Input, base + 1, channel.encode(summary.max));
                regs.set(Bank::Input, base + 2, channel.encode(summary.mean));
            }
        }
        clamped
    }
}
