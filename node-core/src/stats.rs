//! Tumbling-window statistics.
//!
//! Each channel under statistics owns one [`TumblingWindow`]. Samples fold
//! into the open window as min, max and an incremental mean. The first
//! sample at or after `start + length` closes the window, hands back its
//! summary and seeds the next window.

use fixed::types::I32F32;

/// Window length used by the sensor manager.
pub const WINDOW_MS: u64 = 5_000;

/// Summary of a closed window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct WindowSummary {
    pub min: i32,
    pub max: i32,
    /// Mean rounded to the nearest integer.
    pub mean: i32,
    pub count: u32,
}

#[derive(Debug, Clone, Copy)]
struct OpenWindow {
    start_ms: u64,
    count: u32,
    min: i32,
    max: i32,
    mean: I32F32,
}

impl OpenWindow {
    fn seeded(start_ms: u64, sample: i32) -> Self {
        Self {
            start_ms,
            count: 1,
            min: sample,
            max: sample,
            mean: I32F32::from_num(sample),
        }
    }

    fn add(&mut self, sample: i32) {
        self.count += 1;
        self.min = self.min.min(sample);
        self.max = self.max.max(sample);
        let delta = I32F32::from_num(sample) - self.mean;
        self.mean += delta / i64::from(self.count);
    }

    fn summary(&self) -> WindowSummary {
        WindowSummary {
            min: self.min,
            max: self.max,
            mean: self.mean.round().to_num(),
            count: self.count,
        }
    }
}

/// One channel's tumbling window.
#[derive(Debug, Clone, Copy)]
pub struct TumblingWindow {
    length_ms: u64,
    open: Option<OpenWindow>,
}

impl TumblingWindow {
    #[must_use]
    pub const fn new(length_ms: u64) -> Self {
        Self {
            length_ms,
            open: None,
        }
    }

    /// Fold a sample in. Returns the closed window's summary when this
    /// sample ended it; the sample then seeds the next window.
    pub fn on_sample(&mut self, now_ms: u64, sample: i32) -> Option<WindowSummary> {
        match &mut self.open {
            None => {
                self.open = Some(OpenWindow::seeded(now_ms, sample));
                None
            }
            Some(window) if now_ms >= window.start_ms + self.length_ms => {
                let closed = window.summary();
                *window = OpenWindow::seeded(now_ms, sample);
                Some(closed)
            }
            Some(window) => {
                window.add(sample);
                None
            }
        }
    }

    /// Samples in the open window.
    #[must_use]
    pub fn open_count(&self) -> u32 {
        self.open.map_or(0, |w| w.count)
    }

    /// Start time of the open window.
    #[must_use]
    pub fn open_since(&self) -> Option<u64> {
        self.open.map(|w| w.start_ms)
    }
}

impl Default for TumblingWindow {
    fn default() -> Self {
        Self::new(WINDOW_MS)
    }
}
